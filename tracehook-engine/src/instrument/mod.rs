// Instrumentation engine
//
// The class-file hook that rewrites classes as the runtime presents them.
// Which tracepoints apply to a class comes from the registry's current
// snapshot; which lines they land on comes from a LocationResolver.

pub mod analysis;
pub mod descriptor;
pub mod ir;
pub mod transform;

pub use ir::{ClassIr, Insn, Kind, Label, MethodIr};
pub use transform::{instrument_class, LineTargets};

use crate::error::{EngineError, EngineResult};
use crate::location::{DirectLineResolver, LocationResolver};
use crate::registry::TracepointRegistry;
use crate::runtime::{ClassFileHook, LoadedClass};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The static method instrumented code calls on every hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookTarget {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl Default for HookTarget {
    fn default() -> Self {
        Self {
            owner: "com/tracehook/agent/Callback".to_string(),
            name: "onHit".to_string(),
            descriptor: "([Ljava/lang/String;Ljava/lang/String;ILjava/util/Map;)V".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    /// Hand the class back as it was presented
    Unchanged,
    Rewritten(ClassIr),
}

pub struct ClassTransformer {
    registry: Arc<TracepointRegistry>,
    locations: Arc<dyn LocationResolver>,
    hook: HookTarget,
}

impl ClassTransformer {
    pub fn new(registry: Arc<TracepointRegistry>, hook: HookTarget) -> Self {
        Self {
            registry,
            locations: Arc::new(DirectLineResolver),
            hook,
        }
    }

    pub fn with_location_resolver(mut self, locations: Arc<dyn LocationResolver>) -> Self {
        self.locations = locations;
        self
    }

    /// Tracepoint ids per line for `class`, from the current registry snapshot
    pub fn line_targets(&self, class: &ClassIr) -> LineTargets {
        let snapshot = self.registry.current();
        let loaded = LoadedClass::of(class);
        let mut seen = BTreeSet::new();
        let mut targets = LineTargets::new();

        let resolver = self.registry.resolver();
        for key in resolver.keys_for_class(&loaded) {
            if !resolver.matches(&key, &loaded) {
                continue;
            }
            for tp in snapshot.for_key(&key) {
                if !seen.insert(tp.id.clone()) {
                    continue;
                }
                for line in self.locations.resolve_lines(class, tp) {
                    targets.entry(line).or_default().push(tp.id.clone());
                }
            }
        }

        for ids in targets.values_mut() {
            ids.sort();
        }
        targets
    }

    pub fn transform_class(&self, class: &ClassIr) -> EngineResult<Option<ClassIr>> {
        let targets = self.line_targets(class);
        if targets.is_empty() {
            return Ok(None);
        }
        debug!("Instrumenting {} at lines {:?}", class.name, targets.keys().collect::<Vec<_>>());
        instrument_class(class, &targets, &self.hook)
    }
}

impl ClassFileHook for ClassTransformer {
    fn transform(&self, class: &ClassIr) -> TransformOutcome {
        let result = catch_unwind(AssertUnwindSafe(|| self.transform_class(class)))
            .unwrap_or_else(|_| Err(EngineError::rewrite(&class.name, "*", "rewriter panicked")));

        match result {
            Ok(Some(rewritten)) => {
                info!("Instrumented class {}", class.name);
                TransformOutcome::Rewritten(rewritten)
            }
            Ok(None) => TransformOutcome::Unchanged,
            Err(e) => {
                warn!("Leaving class {} unmodified: {}", class.name, e);
                TransformOutcome::Unchanged
            }
        }
    }
}
