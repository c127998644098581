// Host class runtime
//
// The registry asks the runtime to re-present classes; the runtime runs the
// registered class-file hooks over each one. InMemoryRuntime keeps classes
// as IR in memory, which is what the agent binary and the tests host.

use crate::error::{EngineError, EngineResult};
use crate::instrument::{ClassIr, TransformOutcome};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A class as the runtime reports it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoadedClass {
    /// Internal name, e.g. `com/example/Foo$Inner`
    pub name: String,
    pub source_file: Option<String>,
}

impl LoadedClass {
    pub fn of(class: &ClassIr) -> Self {
        Self {
            name: class.name.clone(),
            source_file: class.source_file.clone(),
        }
    }
}

pub trait ClassRuntime: Send + Sync {
    fn loaded_classes(&self) -> Vec<LoadedClass>;

    /// Re-present exactly these classes to the class-file hooks
    fn retransform(&self, classes: &[LoadedClass]) -> EngineResult<()>;
}

/// Called for every class definition and retransformation
pub trait ClassFileHook: Send + Sync {
    fn transform(&self, class: &ClassIr) -> TransformOutcome;
}

#[derive(Default)]
pub struct InMemoryRuntime {
    originals: RwLock<BTreeMap<String, ClassIr>>,
    installed: RwLock<BTreeMap<String, ClassIr>>,
    hooks: RwLock<Vec<Arc<dyn ClassFileHook>>>,
    retransforms: Mutex<Vec<Vec<String>>>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&self, hook: Arc<dyn ClassFileHook>) {
        self.hooks.write().push(hook);
    }

    /// Load a class, running the hooks over it as a class-load event would
    pub fn define_class(&self, class: ClassIr) {
        info!("Defining class {}", class.name);
        let installed = self.run_hooks(&class);
        self.installed.write().insert(class.name.clone(), installed);
        self.originals.write().insert(class.name.clone(), class);
    }

    /// The currently installed (possibly rewritten) form of a class
    pub fn installed(&self, name: &str) -> Option<ClassIr> {
        self.installed.read().get(name).cloned()
    }

    /// Names passed to each `retransform` call, in call order
    pub fn retransform_history(&self) -> Vec<Vec<String>> {
        self.retransforms.lock().clone()
    }

    fn run_hooks(&self, original: &ClassIr) -> ClassIr {
        let hooks = self.hooks.read().clone();
        let mut current = original.clone();
        for hook in hooks {
            if let TransformOutcome::Rewritten(rewritten) = hook.transform(&current) {
                current = rewritten;
            }
        }
        current
    }
}

impl ClassRuntime for InMemoryRuntime {
    fn loaded_classes(&self) -> Vec<LoadedClass> {
        self.originals.read().values().map(LoadedClass::of).collect()
    }

    fn retransform(&self, classes: &[LoadedClass]) -> EngineResult<()> {
        let names: Vec<String> = classes.iter().map(|c| c.name.clone()).collect();
        debug!("Retransforming {:?}", names);
        self.retransforms.lock().push(names);

        for class in classes {
            let original = self
                .originals
                .read()
                .get(&class.name)
                .cloned()
                .ok_or_else(|| EngineError::Runtime(format!("class {} is not loaded", class.name)))?;
            let installed = self.run_hooks(&original);
            self.installed.write().insert(class.name.clone(), installed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Renamer;

    impl ClassFileHook for Renamer {
        fn transform(&self, class: &ClassIr) -> TransformOutcome {
            let mut rewritten = class.clone();
            rewritten.source_file = Some("Renamed.java".to_string());
            TransformOutcome::Rewritten(rewritten)
        }
    }

    #[test]
    fn test_define_runs_hooks_and_keeps_original() {
        let runtime = InMemoryRuntime::new();
        runtime.add_hook(Arc::new(Renamer));
        runtime.define_class(ClassIr::new("com/example/Foo", Some("Foo.java")));

        let installed = runtime.installed("com/example/Foo").unwrap();
        assert_eq!(installed.source_file.as_deref(), Some("Renamed.java"));
        let loaded = runtime.loaded_classes();
        assert_eq!(loaded[0].source_file.as_deref(), Some("Foo.java"));
    }

    #[test]
    fn test_retransform_unknown_class_fails() {
        let runtime = InMemoryRuntime::new();
        let missing = LoadedClass {
            name: "com/example/Missing".to_string(),
            source_file: None,
        };
        assert!(runtime.retransform(&[missing]).is_err());
        assert_eq!(runtime.retransform_history().len(), 1);
    }
}
