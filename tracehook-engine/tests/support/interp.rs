// Minimal IR interpreter
//
// Executes (rewritten) method IR so tests can observe instrumented code
// behaving like the original. Only the instructions the fixtures and the
// rewriter emit are supported; anything else panics.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracehook_engine::instrument::ir::{BinaryOp, Condition, Constant, InvokeKind, MemberRef, ACC_STATIC};
use tracehook_engine::instrument::{ClassIr, Insn, Kind, Label, MethodIr};
use tracehook_engine::{CaptureCallback, HookTarget, Locals, Value};

const STEP_LIMIT: usize = 100_000;

#[derive(Clone, Debug)]
pub enum Val {
    Top,
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    /// A boxed primitive or a host object
    Boxed(Value),
    Array(Rc<RefCell<Vec<Val>>>),
    Map(Rc<RefCell<Vec<(String, Val)>>>),
    Throwable(String),
}

impl Val {
    fn is_wide(&self) -> bool {
        matches!(self, Val::Long(_) | Val::Double(_))
    }

    fn int(&self) -> i32 {
        match self {
            Val::Int(v) => *v,
            other => panic!("expected int, got {:?}", other),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Val::Top | Val::Null => Value::Null,
            Val::Int(v) => Value::Int(*v),
            Val::Long(v) => Value::Long(*v),
            Val::Float(v) => Value::Float(*v),
            Val::Double(v) => Value::Double(*v),
            Val::Str(s) => Value::text(s),
            Val::Boxed(v) => v.clone(),
            Val::Throwable(class) => Value::text(class),
            Val::Array(items) => Value::text(format!("array[{}]", items.borrow().len())),
            Val::Map(entries) => Value::text(format!("map[{}]", entries.borrow().len())),
        }
    }
}

/// Receives every call to the hook method
pub trait HookHost {
    fn on_hit(&self, ids: &[String], file: &str, line: u32, locals: &Locals);
}

impl HookHost for CaptureCallback {
    fn on_hit(&self, ids: &[String], file: &str, line: u32, locals: &Locals) {
        self.on_hit_current_thread(ids, file, line, locals);
    }
}

/// One recorded hook call
#[derive(Debug, Clone)]
pub struct Hit {
    pub ids: Vec<String>,
    pub file: String,
    pub line: u32,
    pub locals: Locals,
}

/// Records hook calls without capturing anything
#[derive(Debug, Default)]
pub struct Recorder {
    hits: RefCell<Vec<Hit>>,
}

impl Recorder {
    pub fn hits(&self) -> Vec<Hit> {
        self.hits.borrow().clone()
    }
}

impl HookHost for Recorder {
    fn on_hit(&self, ids: &[String], file: &str, line: u32, locals: &Locals) {
        self.hits.borrow_mut().push(Hit {
            ids: ids.to_vec(),
            file: file.to_string(),
            line,
            locals: locals.clone(),
        });
    }
}

pub struct Interpreter<'a> {
    class: &'a ClassIr,
    hook: HookTarget,
    host: &'a dyn HookHost,
}

impl<'a> Interpreter<'a> {
    pub fn new(class: &'a ClassIr, host: &'a dyn HookHost) -> Self {
        Self {
            class,
            hook: HookTarget::default(),
            host,
        }
    }

    /// Run `method` with `args` (receiver first for instance methods)
    pub fn invoke(&self, method: &str, args: Vec<Val>) -> Result<Option<Val>, Val> {
        let method = self
            .class
            .method(method)
            .unwrap_or_else(|| panic!("no method {} on {}", method, self.class.name));
        self.run(method, args)
    }

    fn run(&self, method: &MethodIr, args: Vec<Val>) -> Result<Option<Val>, Val> {
        let positions = method.label_positions();
        let mut locals: Vec<Val> = Vec::new();
        for arg in args {
            let wide = arg.is_wide();
            locals.push(arg);
            if wide {
                locals.push(Val::Top);
            }
        }
        let mut stack: Vec<Val> = Vec::new();
        let mut pc = 0;
        let mut steps = 0;

        loop {
            steps += 1;
            assert!(steps < STEP_LIMIT, "step limit exceeded in {}", method.name);
            let insn = method
                .code
                .get(pc)
                .unwrap_or_else(|| panic!("fell off the end of {}", method.name));
            pc += 1;

            let thrown = match self.step(insn, &mut stack, &mut locals, &positions, &mut pc) {
                Ok(Some(Step::Return(value))) => return Ok(value),
                Ok(Some(Step::Throw(exception))) => exception,
                Ok(None) => continue,
                Err(exception) => exception,
            };

            match handler_for(method, &positions, pc - 1, &thrown) {
                Some(handler) => {
                    stack.clear();
                    stack.push(thrown);
                    pc = handler;
                }
                None => return Err(thrown),
            }
        }
    }

    fn step(
        &self,
        insn: &Insn,
        stack: &mut Vec<Val>,
        locals: &mut Vec<Val>,
        positions: &HashMap<Label, usize>,
        pc: &mut usize,
    ) -> Result<Option<Step>, Val> {
        let jump = |pc: &mut usize, target: &Label| *pc = positions[target];
        match insn {
            Insn::Label { .. } | Insn::Line { .. } | Insn::CheckCast { .. } => {}
            Insn::Const { value } => stack.push(match value {
                Constant::Null => Val::Null,
                Constant::Int(v) => Val::Int(*v),
                Constant::Long(v) => Val::Long(*v),
                Constant::Float(v) => Val::Float(*v),
                Constant::Double(v) => Val::Double(*v),
                Constant::String(s) => Val::Str(s.clone()),
                Constant::Class(c) => Val::Boxed(Value::Class(c.as_str().into())),
            }),
            Insn::Load { slot, .. } => stack.push(locals[*slot as usize].clone()),
            Insn::Store { kind, slot } => {
                let value = pop(stack);
                let slot = *slot as usize;
                let needed = slot + kind.size() as usize;
                if locals.len() < needed {
                    locals.resize(needed, Val::Top);
                }
                locals[slot] = value;
            }
            Insn::Iinc { slot, delta } => {
                let slot = *slot as usize;
                locals[slot] = Val::Int(locals[slot].int().wrapping_add(*delta));
            }
            Insn::Binary { op, .. } => {
                let rhs = pop(stack);
                let lhs = pop(stack);
                stack.push(binary(*op, lhs, rhs)?);
            }
            Insn::Negate { .. } => {
                let value = match pop(stack) {
                    Val::Int(v) => Val::Int(v.wrapping_neg()),
                    Val::Long(v) => Val::Long(v.wrapping_neg()),
                    Val::Float(v) => Val::Float(-v),
                    Val::Double(v) => Val::Double(-v),
                    other => panic!("cannot negate {:?}", other),
                };
                stack.push(value);
            }
            Insn::Convert { to, .. } => {
                let value = pop(stack);
                let wide = match value {
                    Val::Int(v) => v as f64,
                    Val::Long(v) => v as f64,
                    Val::Float(v) => v as f64,
                    Val::Double(v) => v,
                    other => panic!("cannot convert {:?}", other),
                };
                stack.push(match to {
                    Kind::Int => Val::Int(wide as i32),
                    Kind::Long => Val::Long(wide as i64),
                    Kind::Float => Val::Float(wide as f32),
                    Kind::Double => Val::Double(wide),
                    Kind::Ref => panic!("cannot convert to a reference"),
                });
            }
            Insn::Compare { .. } => {
                let rhs = pop(stack);
                let lhs = pop(stack);
                let ordering = match (lhs, rhs) {
                    (Val::Long(a), Val::Long(b)) => a.cmp(&b) as i32,
                    (Val::Double(a), Val::Double(b)) => a.partial_cmp(&b).map(|o| o as i32).unwrap_or(-1),
                    (Val::Float(a), Val::Float(b)) => a.partial_cmp(&b).map(|o| o as i32).unwrap_or(-1),
                    (a, b) => panic!("cannot compare {:?} and {:?}", a, b),
                };
                stack.push(Val::Int(ordering));
            }
            Insn::Dup => {
                let top = stack.last().cloned().unwrap_or_else(|| panic!("dup on empty stack"));
                stack.push(top);
            }
            Insn::DupX1 => {
                let top = pop(stack);
                let under = pop(stack);
                stack.push(top.clone());
                stack.push(under);
                stack.push(top);
            }
            Insn::Pop => {
                pop(stack);
            }
            Insn::Pop2 => {
                if !pop(stack).is_wide() {
                    pop(stack);
                }
            }
            Insn::Swap => {
                let top = pop(stack);
                let under = pop(stack);
                stack.push(top);
                stack.push(under);
            }
            Insn::If { cond, target } => {
                if holds(*cond, pop(stack).int().cmp(&0)) {
                    jump(pc, target);
                }
            }
            Insn::IfCmp { cond, target, .. } => {
                let rhs = pop(stack);
                let lhs = pop(stack);
                let ordering = match (&lhs, &rhs) {
                    (Val::Int(a), Val::Int(b)) => a.cmp(b),
                    _ if same_reference(&lhs, &rhs) => std::cmp::Ordering::Equal,
                    _ => std::cmp::Ordering::Less,
                };
                if holds(*cond, ordering) {
                    jump(pc, target);
                }
            }
            Insn::IfNull { target } => {
                if matches!(pop(stack), Val::Null) {
                    jump(pc, target);
                }
            }
            Insn::IfNonNull { target } => {
                if !matches!(pop(stack), Val::Null) {
                    jump(pc, target);
                }
            }
            Insn::Goto { target } => jump(pc, target),
            Insn::New { class } => stack.push(if class == "java/util/HashMap" {
                Val::Map(Rc::new(RefCell::new(Vec::new())))
            } else {
                Val::Throwable(class.clone())
            }),
            Insn::NewArray { .. } => {
                let length = pop(stack).int();
                if length < 0 {
                    return Err(Val::Throwable("java/lang/NegativeArraySizeException".to_string()));
                }
                stack.push(Val::Array(Rc::new(RefCell::new(vec![Val::Null; length as usize]))));
            }
            Insn::ArrayLength => match pop(stack) {
                Val::Array(items) => stack.push(Val::Int(items.borrow().len() as i32)),
                _ => return Err(null_pointer()),
            },
            Insn::ArrayLoad { .. } => {
                let index = pop(stack).int();
                let Val::Array(items) = pop(stack) else {
                    return Err(null_pointer());
                };
                let item = items.borrow().get(index as usize).cloned();
                match item {
                    Some(item) if index >= 0 => stack.push(item),
                    _ => return Err(Val::Throwable("java/lang/ArrayIndexOutOfBoundsException".to_string())),
                }
            }
            Insn::ArrayStore { .. } => {
                let value = pop(stack);
                let index = pop(stack).int();
                let Val::Array(items) = pop(stack) else {
                    return Err(null_pointer());
                };
                let mut items = items.borrow_mut();
                match items.get_mut(index as usize) {
                    Some(slot) if index >= 0 => *slot = value,
                    _ => return Err(Val::Throwable("java/lang/ArrayIndexOutOfBoundsException".to_string())),
                }
            }
            Insn::PutField { .. } => {
                pop(stack);
                if matches!(pop(stack), Val::Null) {
                    return Err(null_pointer());
                }
            }
            Insn::Invoke { kind, method } => {
                if let Some(result) = self.invoke_member(*kind, method, stack)? {
                    stack.push(result);
                }
            }
            Insn::Return { kind } => {
                let value = kind.map(|_| pop(stack));
                return Ok(Some(Step::Return(value)));
            }
            Insn::Throw => match pop(stack) {
                Val::Null => return Err(null_pointer()),
                exception => return Ok(Some(Step::Throw(exception))),
            },
            other => panic!("unsupported instruction {:?}", other),
        }
        Ok(None)
    }

    fn invoke_member(&self, kind: InvokeKind, target: &MemberRef, stack: &mut Vec<Val>) -> Result<Option<Val>, Val> {
        if target.owner == self.hook.owner && target.name == self.hook.name {
            let map = pop(stack);
            let line = pop(stack).int();
            let file = match pop(stack) {
                Val::Str(s) => s,
                other => panic!("hook file must be a string, got {:?}", other),
            };
            let Val::Array(ids) = pop(stack) else {
                panic!("hook ids must be an array");
            };
            let ids: Vec<String> = ids
                .borrow()
                .iter()
                .map(|id| match id {
                    Val::Str(s) => s.clone(),
                    other => panic!("hook id must be a string, got {:?}", other),
                })
                .collect();
            let Val::Map(entries) = map else {
                panic!("hook locals must be a map");
            };
            let locals: Locals = entries
                .borrow()
                .iter()
                .map(|(name, value)| (name.clone(), value.to_value()))
                .collect();
            self.host.on_hit(&ids, &file, line as u32, &locals);
            return Ok(None);
        }

        match (kind, target.owner.as_str(), target.name.as_str()) {
            (InvokeKind::Special, _, "<init>") => {
                let params = param_count(&target.descriptor);
                for _ in 0..params {
                    pop(stack);
                }
                pop(stack);
                Ok(None)
            }
            (InvokeKind::Virtual, "java/util/HashMap", "put") => {
                let value = pop(stack);
                let key = match pop(stack) {
                    Val::Str(s) => s,
                    other => panic!("map key must be a string, got {:?}", other),
                };
                let Val::Map(entries) = pop(stack) else {
                    return Err(null_pointer());
                };
                entries.borrow_mut().push((key, value));
                Ok(Some(Val::Null))
            }
            (InvokeKind::Static, owner, "valueOf") if owner.starts_with("java/lang/") => {
                let value = pop(stack);
                let boxed = match (owner, value) {
                    ("java/lang/Boolean", Val::Int(v)) => Value::Boolean(v != 0),
                    ("java/lang/Byte", Val::Int(v)) => Value::Byte(v as i8),
                    ("java/lang/Short", Val::Int(v)) => Value::Short(v as i16),
                    ("java/lang/Character", Val::Int(v)) => Value::Char(char::from_u32(v as u32).unwrap_or('?')),
                    (_, other) => other.to_value(),
                };
                Ok(Some(Val::Boxed(boxed)))
            }
            (InvokeKind::Static, owner, name) if owner == self.class.name => {
                let callee = self
                    .class
                    .method(name)
                    .filter(|m| m.access & ACC_STATIC != 0)
                    .unwrap_or_else(|| panic!("no static method {}", name));
                let count = param_count(&callee.descriptor);
                let split = stack.len() - count;
                let args = stack.split_off(split);
                self.run(callee, args)
            }
            _ => panic!("unsupported call {:?} {}.{}", kind, target.owner, target.name),
        }
    }
}

enum Step {
    Return(Option<Val>),
    Throw(Val),
}

fn pop(stack: &mut Vec<Val>) -> Val {
    stack.pop().unwrap_or_else(|| panic!("stack underflow"))
}

fn null_pointer() -> Val {
    Val::Throwable("java/lang/NullPointerException".to_string())
}

fn same_reference(a: &Val, b: &Val) -> bool {
    match (a, b) {
        (Val::Null, Val::Null) => true,
        (Val::Array(x), Val::Array(y)) => Rc::ptr_eq(x, y),
        (Val::Map(x), Val::Map(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

fn holds(cond: Condition, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match cond {
        Condition::Eq => ordering == Equal,
        Condition::Ne => ordering != Equal,
        Condition::Lt => ordering == Less,
        Condition::Ge => ordering != Less,
        Condition::Gt => ordering == Greater,
        Condition::Le => ordering != Greater,
    }
}

fn binary(op: BinaryOp, lhs: Val, rhs: Val) -> Result<Val, Val> {
    let arithmetic = || Val::Throwable("java/lang/ArithmeticException".to_string());
    Ok(match (lhs, rhs) {
        (Val::Int(a), Val::Int(b)) => Val::Int(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => a.checked_div(b).ok_or_else(arithmetic)?,
            BinaryOp::Rem => a.checked_rem(b).ok_or_else(arithmetic)?,
            BinaryOp::Shl => a.wrapping_shl(b as u32),
            BinaryOp::Shr => a.wrapping_shr(b as u32),
            BinaryOp::Ushr => ((a as u32).wrapping_shr(b as u32)) as i32,
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
        }),
        (Val::Long(a), Val::Long(b)) => Val::Long(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => a.checked_div(b).ok_or_else(arithmetic)?,
            BinaryOp::Rem => a.checked_rem(b).ok_or_else(arithmetic)?,
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            other => panic!("unsupported long op {:?}", other),
        }),
        (Val::Double(a), Val::Double(b)) => Val::Double(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            other => panic!("unsupported double op {:?}", other),
        }),
        (a, b) => panic!("unsupported operands {:?} {:?}", a, b),
    })
}

fn param_count(descriptor: &str) -> usize {
    tracehook_engine::instrument::descriptor::parse_method_descriptor(descriptor)
        .map(|d| d.params.len())
        .unwrap_or_else(|e| panic!("{}", e))
}

fn handler_for(method: &MethodIr, positions: &HashMap<Label, usize>, at: usize, thrown: &Val) -> Option<usize> {
    let class = match thrown {
        Val::Throwable(class) => class.as_str(),
        _ => "java/lang/Object",
    };
    method
        .try_catch
        .iter()
        .find(|block| {
            let covered = positions[&block.start] <= at && at < positions[&block.end];
            let caught = match block.catch_type.as_deref() {
                None | Some("java/lang/Throwable") => true,
                Some("java/lang/Exception") => class.ends_with("Exception"),
                Some(other) => other == class,
            };
            covered && caught
        })
        .map(|block| positions[&block.handler])
}
