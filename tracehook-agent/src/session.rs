// Agent session state
//
// Owns the hosted runtime, the registry and the capture callback, and turns
// protocol requests into engine calls.

use crate::protocol::{Event, Request};
use serde_json::Value as Json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracehook_engine::evaluator::LookupEvaluator;
use tracehook_engine::heap::{Mapping, Sequence};
use tracehook_engine::instrument::{ClassIr, ClassTransformer};
use tracehook_engine::location::ClassKeyResolver;
use tracehook_engine::registry::UpdatePlan;
use tracehook_engine::runtime::InMemoryRuntime;
use tracehook_engine::sink::ChannelSink;
use tracehook_engine::{
    AgentConfig, CaptureCallback, EventSnapshot, HitOutcome, Locals, TracepointRegistry, Value,
};
use tracing::{debug, warn};

pub struct AgentSession {
    runtime: Arc<InMemoryRuntime>,
    registry: Arc<TracepointRegistry>,
    callback: CaptureCallback,
}

impl AgentSession {
    /// Build a session and the receiving end of its snapshot channel
    pub fn new(config: &AgentConfig) -> (Self, mpsc::Receiver<EventSnapshot>) {
        let runtime = Arc::new(InMemoryRuntime::new());
        let registry = Arc::new(TracepointRegistry::new(
            ClassKeyResolver::from_config(config),
            runtime.clone(),
        ));
        runtime.add_hook(Arc::new(ClassTransformer::new(registry.clone(), config.hook.clone())));

        let (sink, rx) = ChannelSink::new(config.sink_capacity);
        let callback = CaptureCallback::from_config(config, registry.clone(), Arc::new(sink))
            .with_evaluator(Arc::new(LookupEvaluator));

        (
            Self {
                runtime,
                registry,
                callback,
            },
            rx,
        )
    }

    pub fn registry(&self) -> Arc<TracepointRegistry> {
        self.registry.clone()
    }

    /// Handle everything except `update`, which goes through the poller
    pub fn handle(&self, request: Request) -> Event {
        let result = match request {
            Request::Update { .. } => {
                return Event::Error {
                    message: "updates are applied by the poller".to_string(),
                }
            }
            Request::DefineClass { class } => Ok(self.define_class(class)),
            Request::AddTracepoint { tracepoint } => self.registry.add_tracepoint(tracepoint).map(instrumented),
            Request::RemoveTracepoint { id } => self.registry.remove_tracepoint(&id).map(instrumented),
            Request::Hit {
                ids,
                file,
                line,
                locals,
            } => Ok(self.hit(&ids, &file, line, locals)),
        };
        result.unwrap_or_else(|e| {
            warn!("Request failed: {}", e);
            Event::Error { message: e.to_string() }
        })
    }

    fn define_class(&self, class: ClassIr) -> Event {
        let name = class.name.clone();
        let original = class.clone();
        self.runtime.define_class(class);
        let rewritten = self.runtime.installed(&name).is_some_and(|installed| installed != original);
        debug!("Defined {} (rewritten: {})", name, rewritten);
        Event::Instrumented {
            classes: if rewritten { vec![name] } else { Vec::new() },
        }
    }

    fn hit(&self, ids: &[String], file: &str, line: u32, locals: serde_json::Map<String, Json>) -> Event {
        let locals: Locals = locals.into_iter().map(|(name, value)| (name, to_value(value))).collect();
        let outcome = self.callback.on_hit_current_thread(ids, file, line, &locals);
        let (outcome, snapshots) = match outcome {
            HitOutcome::Reentrant => ("reentrant", 0),
            HitOutcome::Unknown => ("unknown", 0),
            HitOutcome::Filtered => ("filtered", 0),
            HitOutcome::Captured(n) => ("captured", n),
            HitOutcome::Failed => ("failed", 0),
        };
        Event::Hit {
            outcome: outcome.to_string(),
            snapshots,
        }
    }
}

fn instrumented(plan: UpdatePlan) -> Event {
    Event::Instrumented {
        classes: plan.classes.into_iter().map(|c| c.name).collect(),
    }
}

/// Map a JSON local onto the value model the capture engine walks
pub fn to_value(json: Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Boolean(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => i32::try_from(i).map(Value::Int).unwrap_or(Value::Long(i)),
            None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::text(s),
        Json::Array(items) => Value::object(Sequence::new(
            "java.util.ArrayList",
            items.into_iter().map(to_value).collect(),
        )),
        Json::Object(entries) => Value::object(Mapping::new(
            "java.util.LinkedHashMap",
            entries
                .into_iter()
                .map(|(k, v)| (Value::text(k), to_value(v)))
                .collect(),
        )),
    }
}
