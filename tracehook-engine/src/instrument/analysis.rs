// Method flow analysis
//
// Abstract interpretation of a method body over verifier types. Produces
// max stack, max locals and a stack map frame for every branch target and
// exception handler, which is what a rewritten method needs before the
// runtime will accept it.

use super::descriptor::{array_element, parse_field_descriptor, parse_method_descriptor, ReturnType};
use super::ir::{
    ClassIr, Constant, Insn, InvokeKind, Kind, Label, MethodIr, StackMapFrame, VerificationType, OBJECT_CLASS,
    THROWABLE_CLASS,
};
use crate::error::{EngineError, EngineResult};
use std::collections::{BTreeSet, VecDeque};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodAnalysis {
    pub max_stack: u16,
    pub max_locals: u16,
    pub frames: Vec<StackMapFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    locals: Vec<VerificationType>,
    stack: Vec<VerificationType>,
}

impl Frame {
    fn stack_size(&self) -> u16 {
        self.stack.iter().map(VerificationType::size).sum()
    }

    /// Merge `other` into self; true when anything changed
    fn merge(&mut self, other: &Frame, index: usize) -> EngineResult<bool> {
        if self.stack.len() != other.stack.len() {
            return Err(EngineError::analysis(
                index,
                format!(
                    "stack height mismatch at merge point ({} vs {})",
                    self.stack.len(),
                    other.stack.len()
                ),
            ));
        }

        let mut changed = false;
        for (mine, theirs) in self.stack.iter_mut().zip(other.stack.iter()) {
            let merged = merge_types(mine, theirs);
            if merged == VerificationType::Top && *mine != VerificationType::Top {
                return Err(EngineError::analysis(index, "incompatible stack values at merge point"));
            }
            if merged != *mine {
                *mine = merged;
                changed = true;
            }
        }

        for (slot, mine) in self.locals.iter_mut().enumerate() {
            let theirs = other.locals.get(slot).unwrap_or(&VerificationType::Top);
            let merged = merge_types(mine, theirs);
            if merged != *mine {
                *mine = merged;
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn is_reference(vt: &VerificationType) -> bool {
    matches!(
        vt,
        VerificationType::Null
            | VerificationType::Object(_)
            | VerificationType::UninitializedThis
            | VerificationType::Uninitialized(_)
    )
}

fn merge_types(a: &VerificationType, b: &VerificationType) -> VerificationType {
    use VerificationType::*;
    match (a, b) {
        _ if a == b => a.clone(),
        (Null, Object(name)) | (Object(name), Null) => Object(name.clone()),
        // No class hierarchy is available here, so two distinct reference
        // types widen to Object. A verifier will reject the frame if the
        // merged local is later used as its concrete type.
        (Object(_), Object(_)) => Object(OBJECT_CLASS.to_string()),
        _ => Top,
    }
}

fn kind_type(kind: Kind) -> VerificationType {
    match kind {
        Kind::Int => VerificationType::Integer,
        Kind::Long => VerificationType::Long,
        Kind::Float => VerificationType::Float,
        Kind::Double => VerificationType::Double,
        Kind::Ref => VerificationType::Object(OBJECT_CLASS.to_string()),
    }
}

fn constant_type(value: &Constant) -> VerificationType {
    match value {
        Constant::Null => VerificationType::Null,
        Constant::Int(_) => VerificationType::Integer,
        Constant::Long(_) => VerificationType::Long,
        Constant::Float(_) => VerificationType::Float,
        Constant::Double(_) => VerificationType::Double,
        Constant::String(_) => VerificationType::Object("java/lang/String".to_string()),
        Constant::Class(_) => VerificationType::Object("java/lang/Class".to_string()),
    }
}

/// Verifier state on entry, from the descriptor and access flags
fn entry_frame(class_name: &str, method: &MethodIr) -> EngineResult<Frame> {
    let descriptor = parse_method_descriptor(&method.descriptor)?;
    let mut locals = Vec::new();
    if !method.is_static() {
        if method.is_constructor() && class_name != OBJECT_CLASS {
            locals.push(VerificationType::UninitializedThis);
        } else {
            locals.push(VerificationType::Object(class_name.to_string()));
        }
    }
    for param in &descriptor.params {
        let vt = param.verification_type();
        let wide = vt.size() == 2;
        locals.push(vt);
        if wide {
            locals.push(VerificationType::Top);
        }
    }
    Ok(Frame {
        locals,
        stack: Vec::new(),
    })
}

struct Interpreter<'a> {
    class_name: &'a str,
    code: &'a [Insn],
    index: usize,
    frame: Frame,
}

impl Interpreter<'_> {
    fn error(&self, reason: impl Into<String>) -> EngineError {
        EngineError::analysis(self.index, reason)
    }

    fn pop(&mut self) -> EngineResult<VerificationType> {
        self.frame
            .stack
            .pop()
            .ok_or_else(|| self.error("operand stack underflow"))
    }

    fn pop_n(&mut self, count: usize) -> EngineResult<()> {
        for _ in 0..count {
            self.pop()?;
        }
        Ok(())
    }

    fn push(&mut self, vt: VerificationType) {
        self.frame.stack.push(vt);
    }

    fn set_local(&mut self, slot: u16, vt: VerificationType) {
        let slot = slot as usize;
        let wide = vt.size() == 2;
        let needed = slot + if wide { 2 } else { 1 };
        if self.frame.locals.len() < needed {
            self.frame.locals.resize(needed, VerificationType::Top);
        }
        // storing into the upper half of a wide value invalidates it
        if slot > 0 && self.frame.locals[slot - 1].size() == 2 {
            self.frame.locals[slot - 1] = VerificationType::Top;
        }
        self.frame.locals[slot] = vt;
        if wide {
            self.frame.locals[slot + 1] = VerificationType::Top;
        }
    }

    fn load(&mut self, kind: Kind, slot: u16) -> EngineResult<()> {
        let local = self
            .frame
            .locals
            .get(slot as usize)
            .cloned()
            .unwrap_or(VerificationType::Top);
        let vt = match kind {
            Kind::Ref if is_reference(&local) => local,
            Kind::Ref => return Err(self.error(format!("slot {} holds no reference", slot))),
            other => {
                let expected = kind_type(other);
                if local != expected {
                    return Err(self.error(format!("slot {} holds {:?}, expected {:?}", slot, local, expected)));
                }
                expected
            }
        };
        self.push(vt);
        Ok(())
    }

    fn initialize(&mut self, receiver: VerificationType, owner: &str) -> EngineResult<()> {
        let initialized = match &receiver {
            VerificationType::UninitializedThis => VerificationType::Object(self.class_name.to_string()),
            VerificationType::Uninitialized(at) => match self.code.get(*at as usize) {
                Some(Insn::New { class }) => VerificationType::Object(class.clone()),
                _ => return Err(self.error("uninitialized value without a matching new")),
            },
            // already initialized receivers call <init> only through super/this chains
            _ => VerificationType::Object(owner.to_string()),
        };
        for vt in self.frame.locals.iter_mut().chain(self.frame.stack.iter_mut()) {
            if *vt == receiver {
                *vt = initialized.clone();
            }
        }
        Ok(())
    }

    /// Apply the current instruction to the frame
    fn step(&mut self) -> EngineResult<()> {
        let code = self.code;
        match &code[self.index] {
            Insn::Label { .. } | Insn::Line { .. } => {}
            Insn::Const { value } => self.push(constant_type(value)),
            Insn::Load { kind, slot } => self.load(*kind, *slot)?,
            Insn::Store { kind, slot } => {
                let value = self.pop()?;
                let vt = if *kind == Kind::Ref {
                    if !is_reference(&value) {
                        return Err(self.error("storing a non-reference as a reference"));
                    }
                    value
                } else {
                    kind_type(*kind)
                };
                self.set_local(*slot, vt);
            }
            Insn::Iinc { .. } => {}
            Insn::Binary { kind, .. } => {
                self.pop_n(2)?;
                self.push(kind_type(*kind));
            }
            Insn::Negate { kind } => {
                self.pop()?;
                self.push(kind_type(*kind));
            }
            Insn::Convert { to, .. } => {
                self.pop()?;
                self.push(kind_type(*to));
            }
            Insn::Compare { .. } => {
                self.pop_n(2)?;
                self.push(VerificationType::Integer);
            }
            Insn::Dup => {
                let top = self.pop()?;
                self.push(top.clone());
                self.push(top);
            }
            Insn::DupX1 => {
                let v1 = self.pop()?;
                let v2 = self.pop()?;
                self.push(v1.clone());
                self.push(v2);
                self.push(v1);
            }
            Insn::Pop => {
                self.pop()?;
            }
            Insn::Pop2 => {
                if self.pop()?.size() == 1 {
                    self.pop()?;
                }
            }
            Insn::Swap => {
                let v1 = self.pop()?;
                let v2 = self.pop()?;
                self.push(v1);
                self.push(v2);
            }
            Insn::If { .. } | Insn::IfNull { .. } | Insn::IfNonNull { .. } => {
                self.pop()?;
            }
            Insn::IfCmp { .. } => self.pop_n(2)?,
            Insn::Goto { .. } => {}
            Insn::New { .. } => self.push(VerificationType::Uninitialized(self.index as u32)),
            Insn::NewArray { element } => {
                self.pop()?;
                self.push(VerificationType::Object(format!("[{}", element)));
            }
            Insn::ArrayLength => {
                self.pop()?;
                self.push(VerificationType::Integer);
            }
            Insn::ArrayLoad { kind } => {
                self.pop()?;
                let array = self.pop()?;
                let element = match kind {
                    Kind::Ref => array_element(&array),
                    other => kind_type(*other),
                };
                self.push(element);
            }
            Insn::ArrayStore { .. } => self.pop_n(3)?,
            Insn::GetField { field } => {
                self.pop()?;
                self.push(parse_field_descriptor(&field.descriptor)?.verification_type());
            }
            Insn::PutField { .. } => self.pop_n(2)?,
            Insn::GetStatic { field } => self.push(parse_field_descriptor(&field.descriptor)?.verification_type()),
            Insn::PutStatic { .. } => {
                self.pop()?;
            }
            Insn::Invoke { kind, method } => {
                let descriptor = parse_method_descriptor(&method.descriptor)?;
                self.pop_n(descriptor.params.len())?;
                if *kind != InvokeKind::Static {
                    let receiver = self.pop()?;
                    if method.is_constructor() {
                        self.initialize(receiver, &method.owner)?;
                    }
                }
                if let ReturnType::Type(ty) = descriptor.return_type {
                    self.push(ty.verification_type());
                }
            }
            Insn::CheckCast { class } => {
                self.pop()?;
                self.push(VerificationType::Object(class.clone()));
            }
            Insn::InstanceOf { .. } => {
                self.pop()?;
                self.push(VerificationType::Integer);
            }
            Insn::Return { kind } => {
                if kind.is_some() {
                    self.pop()?;
                }
            }
            Insn::Throw | Insn::MonitorEnter | Insn::MonitorExit => {
                self.pop()?;
            }
        }
        Ok(())
    }
}

fn merge_into(
    states: &mut [Option<Frame>],
    queue: &mut VecDeque<usize>,
    at: usize,
    frame: &Frame,
) -> EngineResult<()> {
    if let Some(existing) = states[at].as_mut() {
        if existing.merge(frame, at)? {
            queue.push_back(at);
        }
    } else {
        states[at] = Some(frame.clone());
        queue.push_back(at);
    }
    Ok(())
}

/// Highest local slot touched by the code, plus one
fn locals_used(method: &MethodIr) -> u16 {
    method
        .code
        .iter()
        .filter_map(|insn| match insn {
            Insn::Load { kind, slot } | Insn::Store { kind, slot } => Some(slot + kind.size()),
            Insn::Iinc { slot, .. } => Some(slot + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

pub fn analyze(class_name: &str, method: &MethodIr) -> EngineResult<MethodAnalysis> {
    let code = method.code.as_slice();
    let positions = method.label_positions();
    let position = |label: Label| -> EngineResult<usize> {
        positions
            .get(&label)
            .copied()
            .ok_or_else(|| EngineError::analysis(0, format!("undefined label {}", label)))
    };

    let mut handlers = Vec::with_capacity(method.try_catch.len());
    for block in &method.try_catch {
        handlers.push((
            position(block.start)?,
            position(block.end)?,
            position(block.handler)?,
            VerificationType::Object(block.catch_type.clone().unwrap_or_else(|| THROWABLE_CLASS.to_string())),
        ));
    }

    let entry = entry_frame(class_name, method)?;
    let mut max_locals = (entry.locals.len() as u16).max(locals_used(method));
    let mut max_stack: u16 = 0;

    let mut states: Vec<Option<Frame>> = vec![None; code.len()];
    let mut targets: BTreeSet<usize> = BTreeSet::new();
    let mut queue = VecDeque::new();
    if !code.is_empty() {
        states[0] = Some(entry);
        queue.push_back(0usize);
    }

    while let Some(index) = queue.pop_front() {
        let Some(frame) = states[index].clone() else {
            continue;
        };

        for (start, end, handler, caught) in &handlers {
            if (*start..*end).contains(&index) {
                let handler_frame = Frame {
                    locals: frame.locals.clone(),
                    stack: vec![caught.clone()],
                };
                targets.insert(*handler);
                max_stack = max_stack.max(1);
                merge_into(&mut states, &mut queue, *handler, &handler_frame)?;
            }
        }

        let mut interpreter = Interpreter {
            class_name,
            code,
            index,
            frame,
        };
        interpreter.step()?;
        let out = interpreter.frame;
        max_stack = max_stack.max(out.stack_size());
        max_locals = max_locals.max(out.locals.len() as u16);

        let insn = &code[index];
        if let Some(target) = insn.jump_target() {
            let at = position(target)?;
            targets.insert(at);
            merge_into(&mut states, &mut queue, at, &out)?;
        }
        if !insn.ends_flow() {
            if index + 1 >= code.len() {
                return Err(EngineError::analysis(index, "control falls off the end of the method"));
            }
            merge_into(&mut states, &mut queue, index + 1, &out)?;
        }
    }

    let frames = targets
        .into_iter()
        .filter_map(|at| {
            let state = states[at].as_ref()?;
            let Insn::Label { label } = code[at] else {
                return None;
            };
            let mut locals = state.locals.clone();
            while locals.last() == Some(&VerificationType::Top) {
                locals.pop();
            }
            Some(StackMapFrame {
                label,
                locals,
                stack: state.stack.clone(),
            })
        })
        .collect();

    Ok(MethodAnalysis {
        max_stack,
        max_locals,
        frames,
    })
}

/// Refresh a rewritten method's derived metadata for its class's format
pub fn recompute(class: &ClassIr, method: &mut MethodIr) -> EngineResult<()> {
    let analysis = analyze(&class.name, method)?;
    method.max_stack = analysis.max_stack;
    method.max_locals = analysis.max_locals;
    if class.requires_frames() {
        method.frames = analysis.frames;
    } else {
        method.frames.clear();
    }
    trace!(
        method = %method.name,
        max_stack = method.max_stack,
        max_locals = method.max_locals,
        frames = method.frames.len(),
        "method metadata recomputed"
    );
    Ok(())
}
