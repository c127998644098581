// Configuration
//
// AgentConfig is the engine-wide configuration; FrameConfig is the merged,
// closed set of limits governing one capture.

use crate::error::EngineResult;
use crate::instrument::HookTarget;
use crate::tracepoint::{args, TracepointDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const CONFIG_PATH_ENV: &str = "TRACEHOOK_CONFIG";
pub const POLL_INTERVAL_ENV: &str = "TRACEHOOK_POLL_INTERVAL_MS";

/// Which frames get their locals expanded
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameMode {
    NoFrame,
    SingleFrame,
    AllFrames,
}

impl FrameMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "no_frame" | "none" => Some(FrameMode::NoFrame),
            "single_frame" | "single" => Some(FrameMode::SingleFrame),
            "all_frames" | "all" => Some(FrameMode::AllFrames),
            _ => None,
        }
    }
}

/// Whether the stack beyond the hit frame is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackMode {
    NoStack,
    Stack,
}

impl StackMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "no_stack" | "none" => Some(StackMode::NoStack),
            "stack" => Some(StackMode::Stack),
            _ => None,
        }
    }
}

/// Limits applied when no firing tracepoint sets them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameDefaults {
    pub max_var_depth: usize,
    pub max_variables: usize,
    pub max_collection_size: usize,
    pub max_str_length: usize,
    pub max_watch_vars: usize,
    pub max_tp_process_time_ms: u64,
    pub frame_mode: FrameMode,
    pub stack_mode: StackMode,
}

impl Default for FrameDefaults {
    fn default() -> Self {
        Self {
            max_var_depth: 5,
            max_variables: 1000,
            max_collection_size: 10,
            max_str_length: 1024,
            max_watch_vars: 100,
            max_tp_process_time_ms: 100,
            frame_mode: FrameMode::SingleFrame,
            stack_mode: StackMode::Stack,
        }
    }
}

/// Open accumulator of limits across all tracepoints firing together
#[derive(Debug, Default, Clone)]
pub struct FrameConfigBuilder {
    max_var_depth: Option<usize>,
    max_variables: Option<usize>,
    max_collection_size: Option<usize>,
    max_str_length: Option<usize>,
    max_watch_vars: Option<usize>,
    max_tp_process_time_ms: Option<u64>,
    frame_mode: Option<FrameMode>,
    stack_mode: Option<StackMode>,
}

fn merge_max<T: Ord + Copy>(slot: &mut Option<T>, value: Option<T>) {
    if let Some(value) = value {
        *slot = Some(match *slot {
            Some(current) => current.max(value),
            None => value,
        });
    }
}

impl FrameConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one tracepoint's args into the accumulator
    pub fn process(&mut self, tp: &TracepointDefinition) {
        let usize_arg = |key: &str| tp.arg_u64(key).map(|v| v as usize);
        merge_max(&mut self.max_var_depth, usize_arg(args::MAX_VAR_DEPTH));
        merge_max(&mut self.max_variables, usize_arg(args::MAX_VARIABLES));
        merge_max(&mut self.max_collection_size, usize_arg(args::MAX_COLLECTION_SIZE));
        merge_max(&mut self.max_str_length, usize_arg(args::MAX_STR_LENGTH));
        merge_max(&mut self.max_watch_vars, usize_arg(args::MAX_WATCH_VARS));
        merge_max(
            &mut self.max_tp_process_time_ms,
            tp.arg_u64(args::MAX_TP_PROCESS_TIME),
        );
        merge_max(
            &mut self.frame_mode,
            tp.arg(args::FRAME_TYPE).and_then(FrameMode::parse),
        );
        merge_max(
            &mut self.stack_mode,
            tp.arg(args::STACK_TYPE).and_then(StackMode::parse),
        );
    }

    /// Freeze the limits, substituting defaults for anything still unset
    pub fn close(self, defaults: &FrameDefaults) -> FrameConfig {
        let config = FrameConfig {
            max_var_depth: self.max_var_depth.unwrap_or(defaults.max_var_depth),
            max_variables: self.max_variables.unwrap_or(defaults.max_variables),
            max_collection_size: self
                .max_collection_size
                .unwrap_or(defaults.max_collection_size),
            max_str_length: self.max_str_length.unwrap_or(defaults.max_str_length),
            max_watch_vars: self.max_watch_vars.unwrap_or(defaults.max_watch_vars),
            max_tp_process_time: Duration::from_millis(
                self.max_tp_process_time_ms
                    .unwrap_or(defaults.max_tp_process_time_ms),
            ),
            frame_mode: self.frame_mode.unwrap_or(defaults.frame_mode),
            stack_mode: self.stack_mode.unwrap_or(defaults.stack_mode),
        };
        debug!(?config, "frame config closed");
        config
    }
}

/// Closed, immutable capture limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    max_var_depth: usize,
    max_variables: usize,
    max_collection_size: usize,
    max_str_length: usize,
    max_watch_vars: usize,
    max_tp_process_time: Duration,
    frame_mode: FrameMode,
    stack_mode: StackMode,
}

impl FrameConfig {
    pub fn from_defaults(defaults: &FrameDefaults) -> Self {
        FrameConfigBuilder::new().close(defaults)
    }

    pub fn max_var_depth(&self) -> usize {
        self.max_var_depth
    }

    pub fn max_variables(&self) -> usize {
        self.max_variables
    }

    pub fn max_collection_size(&self) -> usize {
        self.max_collection_size
    }

    pub fn max_str_length(&self) -> usize {
        self.max_str_length
    }

    pub fn max_watch_vars(&self) -> usize {
        self.max_watch_vars
    }

    pub fn max_tp_process_time(&self) -> Duration {
        self.max_tp_process_time
    }

    pub fn frame_mode(&self) -> FrameMode {
        self.frame_mode
    }

    pub fn stack_mode(&self) -> StackMode {
        self.stack_mode
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub frame_defaults: FrameDefaults,
    /// Class-name prefixes counted as application code; empty means "everything not excluded"
    pub in_app_include: Vec<String>,
    pub in_app_exclude: Vec<String>,
    /// Path fragments stripped from tracepoint paths to derive class names
    pub source_roots: Vec<String>,
    /// File extensions bucketed into the shared template class group
    pub template_extensions: Vec<String>,
    pub hook: HookTarget,
    pub poll_interval_ms: u64,
    pub sink_capacity: usize,
    pub resource: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            frame_defaults: FrameDefaults::default(),
            in_app_include: Vec::new(),
            in_app_exclude: ["java.", "javax.", "jdk.", "sun.", "com.sun."]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            source_roots: [
                "src/main/java/",
                "src/test/java/",
                "src/main/kotlin/",
                "src/main/scala/",
                "src/main/groovy/",
                "src/",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            template_extensions: ["jsp", "jspx", "tag", "tagx"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            hook: HookTarget::default(),
            poll_interval_ms: 10_000,
            sink_capacity: 256,
            resource: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load from `TRACEHOOK_CONFIG` (if set) and apply env overrides
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };

        if let Some(ms) = lookup(POLL_INTERVAL_ENV).and_then(|v| v.parse().ok()) {
            config.poll_interval_ms = ms;
        }

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_takes_max_of_limits() {
        let a = TracepointDefinition::new("a", "Foo.java", 1)
            .with_arg(args::MAX_VAR_DEPTH, "3")
            .with_arg(args::FRAME_TYPE, "single_frame");
        let b = TracepointDefinition::new("b", "Foo.java", 1)
            .with_arg(args::MAX_VAR_DEPTH, "7")
            .with_arg(args::MAX_STR_LENGTH, "20")
            .with_arg(args::FRAME_TYPE, "all_frames");

        let mut builder = FrameConfigBuilder::new();
        builder.process(&a);
        builder.process(&b);
        let config = builder.close(&FrameDefaults::default());

        assert_eq!(config.max_var_depth(), 7);
        assert_eq!(config.max_str_length(), 20);
        assert_eq!(config.max_variables(), 1000);
        assert_eq!(config.frame_mode(), FrameMode::AllFrames);
        assert_eq!(config.stack_mode(), StackMode::Stack);
    }

    #[test]
    fn test_unparseable_limits_fall_back_to_defaults() {
        let tp = TracepointDefinition::new("a", "Foo.java", 1)
            .with_arg(args::MAX_COLLECTION_SIZE, "lots")
            .with_arg(args::STACK_TYPE, "no_stack");
        let mut builder = FrameConfigBuilder::new();
        builder.process(&tp);
        let config = builder.close(&FrameDefaults::default());
        assert_eq!(config.max_collection_size(), 10);
        assert_eq!(config.stack_mode(), StackMode::NoStack);
    }

    #[test]
    fn test_from_lookup_with_override() {
        let config = AgentConfig::from_lookup(|key| match key {
            POLL_INTERVAL_ENV => Some("250".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.sink_capacity, 256);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"frame_defaults":{"max_var_depth":2}}"#).unwrap();
        assert_eq!(config.frame_defaults.max_var_depth, 2);
        assert_eq!(config.frame_defaults.max_variables, 1000);
        assert!(config.template_extensions.contains(&"jsp".to_string()));
    }
}
