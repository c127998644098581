// Snapshot data model
//
// Plain value types produced by a capture and consumed by the transport.

use crate::error::{EngineError, EngineResult};
use crate::tracepoint::TracepointDefinition;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Reference to an entry of a snapshot's variable table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableId {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<String>,
}

impl VariableId {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            original_name: None,
            modifiers: Vec::new(),
        }
    }
}

/// A captured value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub type_name: String,
    pub value: String,
    /// Identity key of the captured object, empty for primitives
    pub hash: String,
    pub truncated: bool,
    #[serde(default)]
    pub children: Vec<VariableId>,
}

/// One frame of the captured stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file_name: String,
    pub line: u32,
    pub class_name: String,
    pub method_name: String,
    pub app_frame: bool,
    pub native: bool,
    #[serde(default)]
    pub variables: Vec<VariableId>,
}

/// Outcome of one watch expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchResult {
    Good {
        expression: String,
        variable: VariableId,
    },
    Error {
        expression: String,
        error: String,
    },
}

impl WatchResult {
    pub fn expression(&self) -> &str {
        match self {
            WatchResult::Good { expression, .. } | WatchResult::Error { expression, .. } => {
                expression
            }
        }
    }
}

/// The result of one tracepoint hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub id: String,
    pub tracepoint: TracepointDefinition,
    /// Hit time in nanoseconds since the unix epoch
    pub ts_nanos: u64,
    /// Time spent capturing, in nanoseconds
    pub duration_nanos: u64,
    pub var_lookup: HashMap<String, Variable>,
    /// Frames are shared between all snapshots produced by one hit
    pub frames: Arc<Vec<StackFrame>>,
    pub watches: Vec<WatchResult>,
    pub attributes: BTreeMap<String, String>,
    pub resource: Arc<BTreeMap<String, String>>,
    pub open: bool,
}

impl EventSnapshot {
    pub fn new(
        tracepoint: TracepointDefinition,
        ts_nanos: u64,
        frames: Arc<Vec<StackFrame>>,
        var_lookup: HashMap<String, Variable>,
        resource: Arc<BTreeMap<String, String>>,
    ) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert("path".to_string(), tracepoint.path.clone());
        attributes.insert("line".to_string(), tracepoint.line.to_string());
        attributes.insert("tracepoint".to_string(), tracepoint.id.clone());
        if let Some(frame) = frames.first() {
            attributes.insert("method_name".to_string(), frame.method_name.clone());
        }

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracepoint,
            ts_nanos,
            duration_nanos: 0,
            var_lookup,
            frames,
            watches: Vec::new(),
            attributes,
            resource,
            open: true,
        }
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(EngineError::SnapshotClosed(self.id.clone()))
        }
    }

    pub fn add_watch_result(&mut self, result: WatchResult) -> EngineResult<()> {
        self.ensure_open()?;
        self.watches.push(result);
        Ok(())
    }

    pub fn merge_variables(&mut self, variables: HashMap<String, Variable>) -> EngineResult<()> {
        self.ensure_open()?;
        self.var_lookup.extend(variables);
        Ok(())
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<String>) -> EngineResult<()> {
        self.ensure_open()?;
        self.attributes.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Stop accepting mutations and stamp the duration
    pub fn close(&mut self, duration_nanos: u64) {
        if self.open {
            self.duration_nanos = duration_nanos;
            self.open = false;
        }
    }

    /// Every VariableId reachable from frames, watches and children
    pub fn referenced_ids(&self) -> impl Iterator<Item = &VariableId> {
        let frame_ids = self.frames.iter().flat_map(|f| f.variables.iter());
        let watch_ids = self.watches.iter().filter_map(|w| match w {
            WatchResult::Good { variable, .. } => Some(variable),
            WatchResult::Error { .. } => None,
        });
        let child_ids = self.var_lookup.values().flat_map(|v| v.children.iter());
        frame_ids.chain(watch_ids).chain(child_ids)
    }

    /// Ids referenced somewhere but missing from the variable table
    pub fn dangling_ids(&self) -> Vec<String> {
        self.referenced_ids()
            .filter(|vid| !self.var_lookup.contains_key(&vid.id))
            .map(|vid| vid.id.clone())
            .collect()
    }
}
