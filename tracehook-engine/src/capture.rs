// Frame and variable capture
//
// Breadth-first walk of the stack and object graph into a bounded variable
// table. A CaptureSession owns the table, the identity cache and the
// budget counters; it can be cloned so each snapshot of a hit can add its
// watch results on top of the shared frame capture.

use crate::config::{FrameConfig, FrameMode, StackMode};
use crate::frames::{FrameStrategy, RuntimeFrame};
use crate::model::{StackFrame, Variable, VariableId};
use crate::value::{IdentityKey, Locals, Shape, Value};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tracing::debug;

const UNKNOWN_FILE: &str = "<unknown>";

/// Trim `value` to at most `max` characters
pub fn trim_string(value: String, max: usize) -> (String, bool) {
    match value.char_indices().nth(max) {
        Some((cut, _)) => (value[..cut].to_string(), true),
        None => (value, false),
    }
}

/// One admitted value waiting to be described and expanded
struct Pending {
    id: String,
    value: Value,
    depth: usize,
}

#[derive(Debug, Clone)]
pub struct CaptureSession {
    config: FrameConfig,
    deadline: Instant,
    table: HashMap<String, Variable>,
    /// Admitted values stay pinned here so an address cannot be reused by
    /// a later allocation within the same session
    seen: HashMap<IdentityKey, (String, Value)>,
    next_id: u64,
    produced: usize,
    timed_out: bool,
}

impl CaptureSession {
    /// Start a session whose time budget is measured from `started`
    pub fn new(config: FrameConfig, started: Instant) -> Self {
        let deadline = started + config.max_tp_process_time();
        Self {
            config,
            deadline,
            table: HashMap::new(),
            seen: HashMap::new(),
            next_id: 0,
            produced: 0,
            timed_out: false,
        }
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub fn table(&self) -> &HashMap<String, Variable> {
        &self.table
    }

    pub fn into_table(self) -> HashMap<String, Variable> {
        self.table
    }

    /// Number of variables created, identity references excluded
    pub fn produced(&self) -> usize {
        self.produced
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Capture a set of named roots; returns the references in root order
    pub fn capture_roots(&mut self, roots: &Locals) -> Vec<VariableId> {
        let mut queue = VecDeque::new();
        let mut ids = Vec::with_capacity(roots.len());
        for (name, value) in roots.iter() {
            match self.admit(&mut queue, name.to_string(), None, Vec::new(), value.clone(), 0) {
                Some(id) => ids.push(id),
                None => break,
            }
        }
        self.drain(&mut queue);
        ids
    }

    /// Capture a single named value, e.g. a watch result
    pub fn capture_value(&mut self, name: &str, value: &Value) -> Option<VariableId> {
        let mut queue = VecDeque::new();
        let id = self.admit(&mut queue, name.to_string(), None, Vec::new(), value.clone(), 0);
        self.drain(&mut queue);
        id
    }

    /// Reference an already-seen identity, or allocate a new id within budget
    fn admit(
        &mut self,
        queue: &mut VecDeque<Pending>,
        name: String,
        original_name: Option<String>,
        modifiers: Vec<String>,
        value: Value,
        depth: usize,
    ) -> Option<VariableId> {
        let identity = value.identity();
        if let Some((existing, _)) = identity.and_then(|key| self.seen.get(&key)) {
            return Some(VariableId {
                id: existing.clone(),
                name,
                original_name,
                modifiers,
            });
        }

        if self.produced >= self.config.max_variables() {
            return None;
        }
        self.produced += 1;
        self.next_id += 1;
        let id = self.next_id.to_string();
        if let Some(key) = identity {
            self.seen.insert(key, (id.clone(), value.clone()));
        }

        queue.push_back(Pending {
            id: id.clone(),
            value,
            depth,
        });

        Some(VariableId {
            id,
            name,
            original_name,
            modifiers,
        })
    }

    fn check_deadline(&mut self) -> bool {
        if !self.timed_out && Instant::now() >= self.deadline {
            debug!(
                produced = self.produced,
                "capture time budget exhausted, finishing with a partial snapshot"
            );
            self.timed_out = true;
        }
        self.timed_out
    }

    /// Describe every admitted value; expand children while budgets allow.
    /// Values still queued after a timeout are recorded without children.
    fn drain(&mut self, queue: &mut VecDeque<Pending>) {
        while let Some(pending) = queue.pop_front() {
            let timed_out = self.check_deadline();
            let mut variable = self.describe(&pending.value, timed_out);

            let child_depth = pending.depth + 1;
            if !timed_out && !pending.value.is_leaf() && child_depth < self.config.max_var_depth() {
                variable.children = self.expand(queue, &pending.value, child_depth);
            }

            self.table.insert(pending.id, variable);
        }
    }

    fn expand(&mut self, queue: &mut VecDeque<Pending>, value: &Value, depth: usize) -> Vec<VariableId> {
        let Value::Object(object) = value else {
            return Vec::new();
        };
        let object = object.object();
        let limit = self.config.max_collection_size();
        let mut children = Vec::new();

        match object.shape() {
            Shape::Indexed => {
                for (index, element) in object.elements(limit).into_iter().take(limit).enumerate() {
                    match self.admit(queue, index.to_string(), None, Vec::new(), element, depth) {
                        Some(id) => children.push(id),
                        None => break,
                    }
                }
            }
            Shape::Keyed => {
                for (key, entry) in object.entries(limit).into_iter().take(limit) {
                    let (name, _) = trim_string(
                        self.render_safely(&key, true),
                        self.config.max_str_length(),
                    );
                    match self.admit(queue, name, None, Vec::new(), entry, depth) {
                        Some(id) => children.push(id),
                        None => break,
                    }
                }
            }
            Shape::Fields => {
                let mut names: Vec<String> = Vec::new();
                for field in object.fields() {
                    let (name, original_name) = if names.contains(&field.name) {
                        let declaring = field
                            .declaring_class
                            .rsplit('.')
                            .next()
                            .unwrap_or(&field.declaring_class)
                            .to_string();
                        (format!("{}.{}", declaring, field.name), Some(field.name.clone()))
                    } else {
                        names.push(field.name.clone());
                        (field.name.clone(), None)
                    };
                    match self.admit(queue, name, original_name, field.modifiers, field.value, depth) {
                        Some(id) => children.push(id),
                        None => break,
                    }
                }
            }
            Shape::Opaque => {}
        }

        children
    }

    fn describe(&self, value: &Value, timed_out: bool) -> Variable {
        let rendered = self.render_safely(value, !timed_out);
        let (value_str, truncated) = trim_string(rendered, self.config.max_str_length());
        Variable {
            type_name: value.type_name(),
            value: value_str,
            hash: value.identity().map(|k| k.to_string()).unwrap_or_default(),
            truncated,
            children: Vec::new(),
        }
    }

    /// Render without letting a failing or panicking `toString` escape.
    /// With `full` unset, objects get the cheap `Class@identity` form.
    fn render_safely(&self, value: &Value, full: bool) -> String {
        if let (Value::Object(object), false) = (value, full) {
            return format!("{:?}", object);
        }
        match catch_unwind(AssertUnwindSafe(|| value.render())) {
            Ok(Ok(rendered)) => rendered,
            Ok(Err(reason)) => format!("Unable to render value: {}", reason),
            Err(_) => format!("Unable to render value of type {}", value.type_name()),
        }
    }
}

/// Frames plus the session holding their variables
#[derive(Debug, Clone)]
pub struct CapturedStack {
    pub frames: Vec<StackFrame>,
    pub session: CaptureSession,
}

/// Walk `stack` (innermost first) into frames and variables
pub fn capture_stack(
    strategy: &dyn FrameStrategy,
    stack: &[RuntimeFrame],
    hit_locals: &Locals,
    config: FrameConfig,
    started: Instant,
) -> CapturedStack {
    let frame_mode = config.frame_mode();
    let recorded = match config.stack_mode() {
        StackMode::Stack => stack,
        StackMode::NoStack => &stack[..stack.len().min(1)],
    };

    let mut session = CaptureSession::new(config, started);
    let mut frames = Vec::with_capacity(recorded.len());

    for (index, runtime_frame) in recorded.iter().enumerate() {
        let expand = !runtime_frame.native
            && !session.check_deadline()
            && match frame_mode {
                FrameMode::NoFrame => false,
                FrameMode::SingleFrame => index == 0,
                FrameMode::AllFrames => true,
            };

        let variables = if expand {
            let hit = if index == 0 { Some(hit_locals) } else { None };
            strategy
                .select_root_locals(runtime_frame, hit)
                .map(|roots| session.capture_roots(&roots))
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        frames.push(StackFrame {
            file_name: runtime_frame
                .file_name
                .clone()
                .unwrap_or_else(|| UNKNOWN_FILE.to_string()),
            line: runtime_frame.line,
            class_name: runtime_frame.class_name.clone(),
            method_name: strategy.method_name(runtime_frame),
            app_frame: strategy.is_app_frame(runtime_frame),
            native: runtime_frame.native,
            variables,
        });
    }

    CapturedStack { frames, session }
}
