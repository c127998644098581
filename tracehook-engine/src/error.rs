// Engine error definitions
//
// Every failure inside the engine is converted to one of these before it
// reaches a boundary. Capture-path callers degrade instead of propagating.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("class {0} has no source file attribute")]
    MissingSourceFile(String),

    #[error("failed to rewrite {class}.{method}: {reason}")]
    Rewrite {
        class: String,
        method: String,
        reason: String,
    },

    #[error("analysis failed at instruction {index}: {reason}")]
    Analysis { index: usize, reason: String },

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("snapshot {0} is closed")]
    SnapshotClosed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl EngineError {
    pub fn rewrite(class: &str, method: &str, reason: impl Into<String>) -> Self {
        EngineError::Rewrite {
            class: class.to_string(),
            method: method.to_string(),
            reason: reason.into(),
        }
    }

    pub fn analysis(index: usize, reason: impl Into<String>) -> Self {
        EngineError::Analysis {
            index,
            reason: reason.into(),
        }
    }
}
