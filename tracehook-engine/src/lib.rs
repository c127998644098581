// Dynamic tracepoint engine
//
// Installs non-breaking tracepoints into running code and captures bounded
// snapshots when they are hit:
// - Tracepoint registry with copy-on-write generations
// - Line-level bytecode instrumentation over a label-based IR
// - Re-entrancy guarded capture callback
// - Bounded frame and variable graph capture

pub mod callback;
pub mod capture;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod frames;
pub mod heap;
pub mod instrument;
pub mod location;
pub mod model;
pub mod poller;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod sink;
pub mod tracepoint;
pub mod transport;
pub mod value;

pub use callback::{CaptureCallback, HitOutcome, ThreadContext};
pub use config::AgentConfig;
pub use error::{EngineError, EngineResult};
pub use instrument::{ClassTransformer, HookTarget, TransformOutcome};
pub use model::EventSnapshot;
pub use registry::TracepointRegistry;
pub use tracepoint::TracepointDefinition;
pub use value::{Locals, Value};
