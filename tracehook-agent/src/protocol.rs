// Stdio protocol messages
//
// One JSON object per line in each direction, discriminated by "type".

use serde::{Deserialize, Serialize};
use tracehook_engine::instrument::ClassIr;
use tracehook_engine::{EventSnapshot, TracepointDefinition};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// A complete tracepoint set from the control plane
    Update {
        #[serde(default)]
        hash: Option<String>,
        #[serde(default)]
        tracepoints: Vec<TracepointDefinition>,
    },
    /// Load a class into the hosted runtime
    DefineClass { class: ClassIr },
    /// Conditions and watches are resolved as plain names or dotted field
    /// paths against the hit's locals; operators such as `==` are not
    /// understood and make a condition read as false.
    AddTracepoint {
        #[serde(flatten)]
        tracepoint: TracepointDefinition,
    },
    RemoveTracepoint { id: String },
    /// A hit reported by instrumented code running in the host
    Hit {
        ids: Vec<String>,
        file: String,
        line: u32,
        #[serde(default)]
        locals: serde_json::Map<String, serde_json::Value>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Snapshot {
        #[serde(flatten)]
        snapshot: EventSnapshot,
    },
    /// Classes whose installed form changed as a result of a request
    Instrumented { classes: Vec<String> },
    Hit { outcome: String, snapshots: usize },
    Error { message: String },
}
