// Tracepoint definitions
//
// A tracepoint is server-owned configuration plus a small amount of local
// fire state. The fire state survives registry generations as long as the
// definition content is unchanged.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Well-known keys of `TracepointDefinition::args`
pub mod args {
    pub const CONDITION: &str = "condition";
    pub const CLASS: &str = "class";
    pub const FRAME_TYPE: &str = "frame_type";
    pub const STACK_TYPE: &str = "stack_type";
    pub const FIRE_COUNT: &str = "fire_count";
    pub const FIRE_PERIOD: &str = "fire_period";
    pub const WINDOW_START: &str = "window_start";
    pub const WINDOW_END: &str = "window_end";
    pub const MAX_VAR_DEPTH: &str = "max_var_depth";
    pub const MAX_VARIABLES: &str = "max_variables";
    pub const MAX_COLLECTION_SIZE: &str = "max_collection_size";
    pub const MAX_STR_LENGTH: &str = "max_str_length";
    pub const MAX_WATCH_VARS: &str = "max_watch_vars";
    pub const MAX_TP_PROCESS_TIME: &str = "max_tp_process_time";
}

pub const DEFAULT_FIRE_COUNT: i64 = 1;
pub const DEFAULT_FIRE_PERIOD_MS: u64 = 1000;

/// Local, mutable fire bookkeeping for one definition
#[derive(Debug, Default)]
pub struct FireState {
    fired: AtomicU64,
    /// Epoch millis of the last fire, 0 when never fired
    last_fire_ms: AtomicU64,
}

impl FireState {
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Acquire)
    }

    pub fn last_fire_ms(&self) -> Option<u64> {
        match self.last_fire_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Reserve one fire if the budget and period allow it. Concurrent
    /// callers never reserve more than `limit` fires between them.
    fn try_reserve(&self, limit: Option<u64>, period_ms: u64, now_ms: u64) -> bool {
        let mut fired = self.fired.load(Ordering::Acquire);
        loop {
            if limit.is_some_and(|limit| fired >= limit) {
                return false;
            }
            match self
                .fired
                .compare_exchange_weak(fired, fired + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => fired = actual,
            }
        }

        let mut last = self.last_fire_ms.load(Ordering::Acquire);
        loop {
            if last != 0 && now_ms.saturating_sub(last) < period_ms {
                // hand the count back; the period wins
                self.fired.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            match self.last_fire_ms.compare_exchange_weak(
                last,
                now_ms.max(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => last = actual,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracepointDefinition {
    pub id: String,
    pub path: String,
    pub line: u32,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub watches: Vec<String>,
    #[serde(skip)]
    state: Arc<FireState>,
}

impl PartialEq for TracepointDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.path == other.path
            && self.line == other.line
            && self.args == other.args
            && self.watches == other.watches
    }
}

impl Eq for TracepointDefinition {}

impl TracepointDefinition {
    pub fn new(id: impl Into<String>, path: impl Into<String>, line: u32) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            line,
            args: BTreeMap::new(),
            watches: Vec::new(),
            state: Arc::default(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn with_watch(mut self, expression: impl Into<String>) -> Self {
        self.watches.push(expression.into());
        self
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn arg_u64(&self, key: &str) -> Option<u64> {
        self.arg(key).and_then(|v| v.parse().ok())
    }

    pub fn condition(&self) -> Option<&str> {
        self.arg(args::CONDITION)
    }

    /// Maximum number of fires, -1 for unlimited
    pub fn fire_count(&self) -> i64 {
        self.arg(args::FIRE_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_FIRE_COUNT)
    }

    pub fn fire_period_ms(&self) -> u64 {
        self.arg_u64(args::FIRE_PERIOD)
            .unwrap_or(DEFAULT_FIRE_PERIOD_MS)
    }

    pub fn state(&self) -> &FireState {
        &self.state
    }

    /// Take over another generation's fire state when the content is the same
    pub(crate) fn adopt_state_from(&mut self, previous: &TracepointDefinition) {
        self.state = previous.state.clone();
    }

    fn fire_limit(&self) -> Option<u64> {
        u64::try_from(self.fire_count()).ok()
    }

    fn in_window(&self, now_ms: u64) -> bool {
        let after_start = self.arg_u64(args::WINDOW_START).map_or(true, |start| now_ms >= start);
        let before_end = self.arg_u64(args::WINDOW_END).map_or(true, |end| now_ms <= end);
        after_start && before_end
    }

    /// Whether the fire budget, rate limit and time window allow a fire now.
    /// Read-only; use `try_fire` to actually consume budget.
    pub fn can_fire(&self, now_ms: u64) -> bool {
        if self.fire_limit().is_some_and(|limit| self.state.fired() >= limit) {
            return false;
        }
        if !self.in_window(now_ms) {
            return false;
        }
        match self.state.last_fire_ms() {
            Some(last) => now_ms.saturating_sub(last) >= self.fire_period_ms(),
            None => true,
        }
    }

    /// Atomically consume one unit of fire budget if a fire is allowed now
    pub fn try_fire(&self, now_ms: u64) -> bool {
        self.in_window(now_ms)
            && self
                .state
                .try_reserve(self.fire_limit(), self.fire_period_ms(), now_ms)
    }
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
