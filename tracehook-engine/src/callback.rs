// Capture callback
//
// Synchronous entry point reached from instrumented code. Resolves the
// tracepoints of a hit, filters them by fire budget and condition, runs
// one shared stack capture and turns it into one snapshot per surviving
// tracepoint. Nothing raised in here may reach the application thread.

use crate::capture::{capture_stack, CaptureSession};
use crate::config::{AgentConfig, FrameConfigBuilder, FrameDefaults};
use crate::evaluator::Evaluator;
use crate::frames::{FrameStrategy, GenericFrameStrategy, NoStackWalker, RuntimeFrame, StackWalker};
use crate::model::{EventSnapshot, WatchResult};
use crate::registry::TracepointRegistry;
use crate::sink::SnapshotSink;
use crate::tracepoint::{now_millis, TracepointDefinition};
use crate::value::Locals;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, trace};

/// Per-thread capture state. Not `Sync`: one per thread.
#[derive(Debug, Default)]
pub struct ThreadContext {
    active: Cell<bool>,
}

impl ThreadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the context for one capture; None while a capture is running
    pub fn enter(&self) -> Option<ReentrancyToken<'_>> {
        if self.active.replace(true) {
            None
        } else {
            Some(ReentrancyToken { context: self })
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }
}

/// Releases the owning context when dropped, including during unwinding
#[derive(Debug)]
pub struct ReentrancyToken<'a> {
    context: &'a ThreadContext,
}

impl Drop for ReentrancyToken<'_> {
    fn drop(&mut self) {
        self.context.active.set(false);
    }
}

thread_local! {
    static CURRENT: ThreadContext = ThreadContext::new();
}

#[derive(Debug, Default)]
pub struct CallbackStats {
    hits: AtomicU64,
    reentrant_skips: AtomicU64,
    captures: AtomicU64,
    snapshots: AtomicU64,
}

impl CallbackStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn reentrant_skips(&self) -> u64 {
        self.reentrant_skips.load(Ordering::Relaxed)
    }

    /// Shared stack captures performed
    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::Relaxed)
    }

    pub fn snapshots(&self) -> u64 {
        self.snapshots.load(Ordering::Relaxed)
    }
}

/// What happened to one hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOutcome {
    /// A capture was already running on this thread
    Reentrant,
    /// None of the ids is known to the current registry generation
    Unknown,
    /// Every tracepoint was rate limited or failed its condition
    Filtered,
    /// Snapshots handed to the sink
    Captured(usize),
    /// The capture path panicked; the hit was dropped
    Failed,
}

pub struct CaptureCallback {
    registry: Arc<TracepointRegistry>,
    sink: Arc<dyn SnapshotSink>,
    evaluator: Option<Arc<dyn Evaluator>>,
    strategy: Arc<dyn FrameStrategy>,
    walker: Arc<dyn StackWalker>,
    defaults: FrameDefaults,
    resource: Arc<BTreeMap<String, String>>,
    stats: CallbackStats,
}

impl CaptureCallback {
    pub fn new(registry: Arc<TracepointRegistry>, sink: Arc<dyn SnapshotSink>) -> Self {
        Self {
            registry,
            sink,
            evaluator: None,
            strategy: Arc::new(GenericFrameStrategy::default()),
            walker: Arc::new(NoStackWalker),
            defaults: FrameDefaults::default(),
            resource: Arc::new(BTreeMap::new()),
            stats: CallbackStats::default(),
        }
    }

    /// Callback wired with the frame defaults, app-frame prefixes and resource of `config`
    pub fn from_config(
        config: &AgentConfig,
        registry: Arc<TracepointRegistry>,
        sink: Arc<dyn SnapshotSink>,
    ) -> Self {
        Self::new(registry, sink)
            .with_defaults(config.frame_defaults.clone())
            .with_strategy(Arc::new(GenericFrameStrategy::new(
                config.in_app_include.clone(),
                config.in_app_exclude.clone(),
            )))
            .with_resource(config.resource.clone())
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn FrameStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_stack_walker(mut self, walker: Arc<dyn StackWalker>) -> Self {
        self.walker = walker;
        self
    }

    pub fn with_defaults(mut self, defaults: FrameDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_resource(mut self, resource: BTreeMap<String, String>) -> Self {
        self.resource = Arc::new(resource);
        self
    }

    pub fn stats(&self) -> &CallbackStats {
        &self.stats
    }

    /// `on_hit` using the calling thread's own context
    pub fn on_hit_current_thread(&self, ids: &[String], file: &str, line: u32, locals: &Locals) -> HitOutcome {
        CURRENT.with(|context| self.on_hit(context, ids, file, line, locals))
    }

    /// Handle one hit of instrumented code on the thread owning `context`
    pub fn on_hit(
        &self,
        context: &ThreadContext,
        ids: &[String],
        file: &str,
        line: u32,
        locals: &Locals,
    ) -> HitOutcome {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);

        let Some(_token) = context.enter() else {
            trace!("Skipping re-entrant hit at {}:{}", file, line);
            self.stats.reentrant_skips.fetch_add(1, Ordering::Relaxed);
            return HitOutcome::Reentrant;
        };

        match catch_unwind(AssertUnwindSafe(|| self.process_hit(ids, file, line, locals))) {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("Capture of hit at {}:{} panicked, dropping it", file, line);
                HitOutcome::Failed
            }
        }
    }

    fn process_hit(&self, ids: &[String], file: &str, line: u32, locals: &Locals) -> HitOutcome {
        let started = Instant::now();
        let ts_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let snapshot = self.registry.current();
        let resolved = snapshot.resolve(ids);
        if resolved.is_empty() {
            debug!("No live tracepoints for ids {:?}", ids);
            return HitOutcome::Unknown;
        }

        let now_ms = now_millis();
        let firing: Vec<TracepointDefinition> = resolved
            .iter()
            .filter(|tp| tp.can_fire(now_ms))
            .filter(|tp| self.condition_holds(tp, locals))
            // budget is consumed only once the condition held
            .filter(|tp| tp.try_fire(now_ms))
            .map(|tp| (**tp).clone())
            .collect();
        if firing.is_empty() {
            return HitOutcome::Filtered;
        }

        let mut builder = FrameConfigBuilder::new();
        for tp in &firing {
            builder.process(tp);
        }
        let config = builder.close(&self.defaults);

        let mut stack = self.walker.current_stack();
        if stack.is_empty() {
            stack.push(synthesize_frame(file, line));
        }
        let captured = capture_stack(self.strategy.as_ref(), &stack, locals, config, started);
        self.stats.captures.fetch_add(1, Ordering::Relaxed);
        let frames = Arc::new(captured.frames);

        let count = firing.len();
        let sessions = vec![captured.session; count];
        for (tp, mut session) in firing.into_iter().zip(sessions) {
            let watches = self.evaluate_watches(&tp, locals, &mut session);

            let mut event = EventSnapshot::new(
                tp,
                ts_nanos,
                frames.clone(),
                session.into_table(),
                self.resource.clone(),
            );
            for watch in watches {
                if let Err(e) = event.add_watch_result(watch) {
                    error!("Failed to record watch result: {}", e);
                }
            }
            event.close(started.elapsed().as_nanos() as u64);

            self.stats.snapshots.fetch_add(1, Ordering::Relaxed);
            self.sink.send(event);
        }

        HitOutcome::Captured(count)
    }

    fn condition_holds(&self, tp: &TracepointDefinition, locals: &Locals) -> bool {
        let Some(condition) = tp.condition() else {
            return true;
        };
        match &self.evaluator {
            Some(evaluator) => evaluator.evaluate_boolean(condition, locals),
            None => {
                debug!("Tracepoint {} has a condition but no evaluator is configured", tp.id);
                false
            }
        }
    }

    fn evaluate_watches(
        &self,
        tp: &TracepointDefinition,
        locals: &Locals,
        session: &mut CaptureSession,
    ) -> Vec<WatchResult> {
        let limit = session.config().max_watch_vars();
        let mut results = Vec::new();

        for expression in tp.watches.iter().take(limit) {
            let Some(evaluator) = &self.evaluator else {
                results.push(WatchResult::Error {
                    expression: expression.clone(),
                    error: "no evaluator configured".to_string(),
                });
                continue;
            };

            let evaluated = catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(expression, locals)));
            let result = match evaluated {
                Ok(Ok(value)) => match session.capture_value(expression, &value) {
                    Some(variable) => WatchResult::Good {
                        expression: expression.clone(),
                        variable,
                    },
                    None => WatchResult::Error {
                        expression: expression.clone(),
                        error: "variable limit reached".to_string(),
                    },
                },
                Ok(Err(failure)) => WatchResult::Error {
                    expression: expression.clone(),
                    error: failure.message,
                },
                Err(_) => WatchResult::Error {
                    expression: expression.clone(),
                    error: "evaluator panicked".to_string(),
                },
            };
            results.push(result);
        }

        if tp.watches.len() > limit {
            debug!(
                "Tracepoint {} has {} watches, evaluated the first {}",
                tp.id,
                tp.watches.len(),
                limit
            );
        }
        results
    }
}

/// Stand-in innermost frame for hosts without a stack walker
fn synthesize_frame(file: &str, line: u32) -> RuntimeFrame {
    let name = file.rsplit(['/', '\\']).next().unwrap_or(file);
    let class_name = name.split('.').next().unwrap_or(name);
    RuntimeFrame::new(class_name, "<unknown>", line).with_file(name)
}
