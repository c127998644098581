// Runtime stack frames and frame classification
//
// The host exposes the hitting thread's stack through StackWalker. How a
// frame is presented (which locals, app or library, display method name) is
// decided by a FrameStrategy injected into the capture engine.

use crate::value::Locals;

/// One physical frame as reported by the host, innermost first
#[derive(Debug, Clone, Default)]
pub struct RuntimeFrame {
    /// Dotted class name, e.g. `com.example.Foo`
    pub class_name: String,
    pub method_name: String,
    pub file_name: Option<String>,
    pub line: u32,
    pub native: bool,
    /// Locals the runtime can still observe; None when the frame is opaque
    pub locals: Option<Locals>,
}

impl RuntimeFrame {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>, line: u32) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            line,
            ..Self::default()
        }
    }

    pub fn with_file(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_locals(mut self, locals: Locals) -> Self {
        self.locals = Some(locals);
        self
    }

    pub fn native(mut self) -> Self {
        self.native = true;
        self
    }
}

/// Access to the calling thread's stack
pub trait StackWalker: Send + Sync {
    fn current_stack(&self) -> Vec<RuntimeFrame>;
}

/// A stack walker for hosts that have no stack beyond the hit frame
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStackWalker;

impl StackWalker for NoStackWalker {
    fn current_stack(&self) -> Vec<RuntimeFrame> {
        Vec::new()
    }
}

/// Language-specific presentation of frames
pub trait FrameStrategy: Send + Sync {
    /// Locals used to seed variable expansion for a frame.
    /// `hit_locals` is set only for the innermost frame.
    fn select_root_locals(&self, frame: &RuntimeFrame, hit_locals: Option<&Locals>) -> Option<Locals>;

    fn is_app_frame(&self, frame: &RuntimeFrame) -> bool;

    fn method_name(&self, frame: &RuntimeFrame) -> String;
}

/// Strategy for general-purpose source languages
#[derive(Debug, Clone, Default)]
pub struct GenericFrameStrategy {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl GenericFrameStrategy {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }
}

impl FrameStrategy for GenericFrameStrategy {
    fn select_root_locals(&self, frame: &RuntimeFrame, hit_locals: Option<&Locals>) -> Option<Locals> {
        match hit_locals {
            Some(locals) => Some(locals.clone()),
            None => frame.locals.clone(),
        }
    }

    fn is_app_frame(&self, frame: &RuntimeFrame) -> bool {
        let name = frame.class_name.as_str();
        if self.exclude.iter().any(|prefix| name.starts_with(prefix.as_str())) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }

    fn method_name(&self, frame: &RuntimeFrame) -> String {
        // lambda$handle$0 -> handle
        if let Some(rest) = frame.method_name.strip_prefix("lambda$") {
            if let Some((name, _)) = rest.split_once('$') {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
        frame.method_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_frame_classification() {
        let strategy = GenericFrameStrategy::new(
            vec!["com.example.".to_string()],
            vec!["com.example.generated.".to_string()],
        );
        assert!(strategy.is_app_frame(&RuntimeFrame::new("com.example.Foo", "run", 1)));
        assert!(!strategy.is_app_frame(&RuntimeFrame::new("com.example.generated.Bar", "run", 1)));
        assert!(!strategy.is_app_frame(&RuntimeFrame::new("java.lang.Thread", "run", 1)));
    }

    #[test]
    fn test_empty_include_accepts_everything_not_excluded() {
        let strategy = GenericFrameStrategy::new(Vec::new(), vec!["java.".to_string()]);
        assert!(strategy.is_app_frame(&RuntimeFrame::new("org.acme.Main", "main", 1)));
        assert!(!strategy.is_app_frame(&RuntimeFrame::new("java.util.HashMap", "get", 1)));
    }

    #[test]
    fn test_lambda_method_names() {
        let strategy = GenericFrameStrategy::default();
        let frame = RuntimeFrame::new("com.example.Foo", "lambda$handle$0", 1);
        assert_eq!(strategy.method_name(&frame), "handle");
        let frame = RuntimeFrame::new("com.example.Foo", "plain", 1);
        assert_eq!(strategy.method_name(&frame), "plain");
    }
}
