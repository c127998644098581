// Tracepoint registry
//
// Holds the current tracepoint set as an immutable snapshot that readers
// clone cheaply. A single writer at a time builds the next snapshot, diffs
// it against the previous one per class group, publishes it, and then asks
// the runtime to re-present exactly the affected classes.

use crate::error::EngineResult;
use crate::location::{ClassGroupKey, ClassKeyResolver};
use crate::runtime::{ClassRuntime, LoadedClass};
use crate::tracepoint::TracepointDefinition;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One published generation of the tracepoint set
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    generation: u64,
    hash: Option<String>,
    by_id: HashMap<String, Arc<TracepointDefinition>>,
    by_key: BTreeMap<ClassGroupKey, Vec<Arc<TracepointDefinition>>>,
}

impl RegistrySnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<TracepointDefinition>> {
        self.by_id.get(id)
    }

    /// Live definitions for the given ids; unknown ids are skipped
    pub fn resolve(&self, ids: &[String]) -> Vec<Arc<TracepointDefinition>> {
        ids.iter().filter_map(|id| self.by_id.get(id).cloned()).collect()
    }

    /// Definitions targeting a class group, ordered by id
    pub fn for_key(&self, key: &ClassGroupKey) -> &[Arc<TracepointDefinition>] {
        self.by_key.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &ClassGroupKey> {
        self.by_key.keys()
    }

    pub fn tracepoints(&self) -> impl Iterator<Item = &Arc<TracepointDefinition>> {
        self.by_id.values()
    }
}

/// What one update changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdatePlan {
    /// Groups whose tracepoint set became empty
    pub removed: BTreeSet<ClassGroupKey>,
    /// Groups that had no tracepoints before
    pub added: BTreeSet<ClassGroupKey>,
    /// Groups whose tracepoint content changed
    pub modified: BTreeSet<ClassGroupKey>,
    /// Loaded classes handed to the runtime for retransformation
    pub classes: Vec<LoadedClass>,
}

impl UpdatePlan {
    pub fn affected_keys(&self) -> BTreeSet<ClassGroupKey> {
        self.removed
            .iter()
            .chain(self.added.iter())
            .chain(self.modified.iter())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.modified.is_empty()
    }
}

pub struct TracepointRegistry {
    resolver: ClassKeyResolver,
    runtime: Arc<dyn ClassRuntime>,
    current: RwLock<Arc<RegistrySnapshot>>,
    update_lock: Mutex<()>,
}

impl TracepointRegistry {
    pub fn new(resolver: ClassKeyResolver, runtime: Arc<dyn ClassRuntime>) -> Self {
        Self {
            resolver,
            runtime,
            current: RwLock::new(Arc::new(RegistrySnapshot::default())),
            update_lock: Mutex::new(()),
        }
    }

    /// The latest complete snapshot
    pub fn current(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    pub fn resolver(&self) -> &ClassKeyResolver {
        &self.resolver
    }

    /// Replace the whole set with a server-authoritative one
    pub fn apply_tracepoints(&self, tracepoints: Vec<TracepointDefinition>) -> EngineResult<UpdatePlan> {
        self.apply_update(None, tracepoints)
    }

    /// Replace the whole set, remembering the server hash it came with
    pub fn apply_update(
        &self,
        hash: Option<String>,
        tracepoints: Vec<TracepointDefinition>,
    ) -> EngineResult<UpdatePlan> {
        self.update_with(|_| (hash, tracepoints))
    }

    /// Add or replace one local ad-hoc tracepoint
    pub fn add_tracepoint(&self, tracepoint: TracepointDefinition) -> EngineResult<UpdatePlan> {
        self.update_with(|previous| {
            let mut set: Vec<TracepointDefinition> = previous
                .tracepoints()
                .filter(|tp| tp.id != tracepoint.id)
                .map(|tp| (**tp).clone())
                .collect();
            set.push(tracepoint);
            (previous.hash.clone(), set)
        })
    }

    /// Remove one tracepoint by id
    pub fn remove_tracepoint(&self, id: &str) -> EngineResult<UpdatePlan> {
        self.update_with(|previous| {
            let set = previous
                .tracepoints()
                .filter(|tp| tp.id != id)
                .map(|tp| (**tp).clone())
                .collect();
            (previous.hash.clone(), set)
        })
    }

    fn update_with<F>(&self, next: F) -> EngineResult<UpdatePlan>
    where
        F: FnOnce(&RegistrySnapshot) -> (Option<String>, Vec<TracepointDefinition>),
    {
        let _writer = self.update_lock.lock();
        let previous = self.current();
        let (hash, tracepoints) = next(&previous);

        let snapshot = self.build_snapshot(&previous, hash, tracepoints);
        let mut plan = diff(&previous, &snapshot);

        info!(
            "Tracepoint generation {}: {} tracepoints, {} added / {} modified / {} removed groups",
            snapshot.generation,
            snapshot.len(),
            plan.added.len(),
            plan.modified.len(),
            plan.removed.len()
        );

        *self.current.write() = Arc::new(snapshot);

        if plan.is_empty() {
            return Ok(plan);
        }

        let keys = plan.affected_keys();
        plan.classes = self
            .runtime
            .loaded_classes()
            .into_iter()
            .filter(|class| keys.iter().any(|key| self.resolver.matches(key, class)))
            .collect();

        if !plan.classes.is_empty() {
            debug!("Requesting retransform of {} classes", plan.classes.len());
            self.runtime.retransform(&plan.classes)?;
        }

        Ok(plan)
    }

    fn build_snapshot(
        &self,
        previous: &RegistrySnapshot,
        hash: Option<String>,
        tracepoints: Vec<TracepointDefinition>,
    ) -> RegistrySnapshot {
        let mut by_id: HashMap<String, Arc<TracepointDefinition>> = HashMap::new();
        for mut tp in tracepoints {
            if let Some(old) = previous.by_id.get(&tp.id) {
                if **old == tp {
                    tp.adopt_state_from(old);
                }
            }
            if by_id.contains_key(&tp.id) {
                warn!("Duplicate tracepoint id {}, keeping the last definition", tp.id);
            }
            by_id.insert(tp.id.clone(), Arc::new(tp));
        }

        let mut by_key: BTreeMap<ClassGroupKey, Vec<Arc<TracepointDefinition>>> = BTreeMap::new();
        for tp in by_id.values() {
            by_key
                .entry(self.resolver.key_for(tp))
                .or_default()
                .push(tp.clone());
        }
        for group in by_key.values_mut() {
            group.sort_by(|a, b| a.id.cmp(&b.id));
        }

        RegistrySnapshot {
            generation: previous.generation + 1,
            hash,
            by_id,
            by_key,
        }
    }
}

fn diff(previous: &RegistrySnapshot, next: &RegistrySnapshot) -> UpdatePlan {
    let mut plan = UpdatePlan::default();
    let keys: BTreeSet<&ClassGroupKey> = previous.keys().chain(next.keys()).collect();

    for key in keys {
        let old = previous.for_key(key);
        let new = next.for_key(key);
        match (old.is_empty(), new.is_empty()) {
            (false, true) => {
                plan.removed.insert(key.clone());
            }
            (true, false) => {
                plan.added.insert(key.clone());
            }
            (false, false) => {
                let same = old.len() == new.len() && old.iter().zip(new.iter()).all(|(a, b)| **a == **b);
                if !same {
                    plan.modified.insert(key.clone());
                }
            }
            (true, true) => {}
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::error::EngineError;

    #[derive(Default)]
    struct FakeRuntime {
        classes: Vec<LoadedClass>,
        calls: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    impl ClassRuntime for FakeRuntime {
        fn loaded_classes(&self) -> Vec<LoadedClass> {
            self.classes.clone()
        }

        fn retransform(&self, classes: &[LoadedClass]) -> EngineResult<()> {
            self.calls.lock().push(classes.iter().map(|c| c.name.clone()).collect());
            if self.fail {
                return Err(EngineError::Runtime("retransform refused".to_string()));
            }
            Ok(())
        }
    }

    fn class(name: &str, source: &str) -> LoadedClass {
        LoadedClass {
            name: name.to_string(),
            source_file: Some(source.to_string()),
        }
    }

    fn registry(runtime: Arc<FakeRuntime>) -> TracepointRegistry {
        TracepointRegistry::new(ClassKeyResolver::from_config(&AgentConfig::default()), runtime)
    }

    fn tp(id: &str, path: &str, line: u32) -> TracepointDefinition {
        TracepointDefinition::new(id, path, line)
    }

    #[test]
    fn test_reapplying_same_set_is_a_no_op() {
        let runtime = Arc::new(FakeRuntime {
            classes: vec![class("com/example/Foo", "Foo.java")],
            ..Default::default()
        });
        let registry = registry(runtime.clone());
        let set = vec![tp("a", "src/main/java/com/example/Foo.java", 10)];

        let first = registry.apply_tracepoints(set.clone()).unwrap();
        assert_eq!(first.classes.len(), 1);
        let second = registry.apply_tracepoints(set).unwrap();
        assert!(second.is_empty());
        assert_eq!(runtime.calls.lock().len(), 1);
    }

    #[test]
    fn test_removal_retransforms_only_that_class() {
        let runtime = Arc::new(FakeRuntime {
            classes: vec![
                class("com/example/Foo", "Foo.java"),
                class("com/example/Foo$1", "Foo.java"),
                class("com/example/Bar", "Bar.java"),
            ],
            ..Default::default()
        });
        let registry = registry(runtime.clone());
        registry
            .apply_tracepoints(vec![
                tp("a", "src/main/java/com/example/Foo.java", 10),
                tp("b", "src/main/java/com/example/Bar.java", 20),
            ])
            .unwrap();

        let plan = registry
            .apply_tracepoints(vec![tp("b", "src/main/java/com/example/Bar.java", 20)])
            .unwrap();

        assert_eq!(
            plan.removed.iter().cloned().collect::<Vec<_>>(),
            vec![ClassGroupKey::Class("com/example/Foo".to_string())]
        );
        let last = runtime.calls.lock().last().cloned().unwrap();
        assert_eq!(last, vec!["com/example/Foo", "com/example/Foo$1"]);
    }

    #[test]
    fn test_content_change_is_modified() {
        let runtime = Arc::new(FakeRuntime {
            classes: vec![class("com/example/Foo", "Foo.java")],
            ..Default::default()
        });
        let registry = registry(runtime);
        registry
            .apply_tracepoints(vec![tp("a", "com/example/Foo.java", 10)])
            .unwrap();
        let plan = registry
            .apply_tracepoints(vec![tp("a", "com/example/Foo.java", 10).with_watch("x")])
            .unwrap();
        assert_eq!(plan.modified.len(), 1);
        assert!(plan.added.is_empty() && plan.removed.is_empty());
    }

    #[test]
    fn test_fire_state_survives_unchanged_update() {
        let registry = registry(Arc::new(FakeRuntime::default()));
        registry
            .apply_tracepoints(vec![tp("a", "com/example/Foo.java", 10)])
            .unwrap();
        assert!(registry.current().get("a").unwrap().try_fire(1));

        registry
            .apply_tracepoints(vec![tp("a", "com/example/Foo.java", 10)])
            .unwrap();
        assert_eq!(registry.current().get("a").unwrap().state().fired(), 1);

        registry
            .apply_tracepoints(vec![tp("a", "com/example/Foo.java", 11)])
            .unwrap();
        assert_eq!(registry.current().get("a").unwrap().state().fired(), 0);
    }

    #[test]
    fn test_ad_hoc_add_and_remove() {
        let runtime = Arc::new(FakeRuntime {
            classes: vec![class("com/example/Foo", "Foo.java")],
            ..Default::default()
        });
        let registry = registry(runtime.clone());
        registry
            .apply_update(Some("h1".to_string()), vec![tp("a", "com/example/Foo.java", 10)])
            .unwrap();

        let plan = registry.add_tracepoint(tp("local", "com/example/Foo.java", 12)).unwrap();
        assert_eq!(plan.modified.len(), 1);
        assert_eq!(registry.current().len(), 2);
        assert_eq!(registry.current().hash(), Some("h1"));

        registry.remove_tracepoint("local").unwrap();
        assert_eq!(registry.current().len(), 1);
        assert_eq!(runtime.calls.lock().len(), 3);
    }

    #[test]
    fn test_retransform_failure_still_publishes() {
        let runtime = Arc::new(FakeRuntime {
            classes: vec![class("com/example/Foo", "Foo.java")],
            fail: true,
            ..Default::default()
        });
        let registry = registry(runtime);
        let result = registry.apply_tracepoints(vec![tp("a", "com/example/Foo.java", 10)]);
        assert!(result.is_err());
        assert_eq!(registry.current().len(), 1);
    }

    #[test]
    fn test_no_loaded_class_means_no_retransform() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = registry(runtime.clone());
        let plan = registry
            .apply_tracepoints(vec![tp("a", "com/example/Foo.java", 10)])
            .unwrap();
        assert_eq!(plan.added.len(), 1);
        assert!(plan.classes.is_empty());
        assert!(runtime.calls.lock().is_empty());
    }
}
