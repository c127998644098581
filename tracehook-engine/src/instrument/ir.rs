// Class and method IR
//
// A labelled instruction list per method, close to the JVM's own shape but
// with symbolic labels instead of byte offsets, so rewriting never has to
// patch jump distances. Everything is serde so class catalogs can be
// loaded from JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_ABSTRACT: u16 = 0x0400;

/// First class-file major version that requires stack map frames
pub const STACK_MAP_MAJOR_VERSION: u16 = 50;

pub const OBJECT_CLASS: &str = "java/lang/Object";
pub const THROWABLE_CLASS: &str = "java/lang/Throwable";

/// Symbolic branch target, unique within a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Computational kind of an operand stack value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Int,
    Long,
    Float,
    Double,
    Ref,
}

impl Kind {
    /// Slots taken in the locals array and on the operand stack
    pub fn size(self) -> u16 {
        match self {
            Kind::Long | Kind::Double => 2,
            _ => 1,
        }
    }

    /// Kind of a field descriptor's leading character
    pub fn of_descriptor(descriptor: &str) -> Kind {
        match descriptor.as_bytes().first() {
            Some(b'J') => Kind::Long,
            Some(b'F') => Kind::Float,
            Some(b'D') => Kind::Double,
            Some(b'L') | Some(b'[') => Kind::Ref,
            _ => Kind::Int,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constant {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    /// Class literal, internal name
    Class(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeKind {
    Static,
    Virtual,
    Special,
    Interface,
}

/// A field or method reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Insn {
    Label { label: Label },
    /// Source line of the code that follows
    Line { line: u32 },
    Const { value: Constant },
    Load { kind: Kind, slot: u16 },
    Store { kind: Kind, slot: u16 },
    Iinc { slot: u16, delta: i32 },
    Binary {
        kind: Kind,
        /// "op" is taken by the instruction tag
        #[serde(rename = "operator")]
        op: BinaryOp,
    },
    Negate { kind: Kind },
    Convert { from: Kind, to: Kind },
    /// lcmp / fcmpl / dcmpl
    Compare { kind: Kind },
    Dup,
    DupX1,
    Pop,
    Pop2,
    Swap,
    /// Compare the int on top of the stack with zero
    If { cond: Condition, target: Label },
    /// Compare two ints (or two references for eq/ne)
    IfCmp { kind: Kind, cond: Condition, target: Label },
    IfNull { target: Label },
    IfNonNull { target: Label },
    Goto { target: Label },
    New { class: String },
    /// Array of the given element descriptor
    NewArray { element: String },
    ArrayLength,
    ArrayLoad { kind: Kind },
    ArrayStore { kind: Kind },
    GetField { field: MemberRef },
    PutField { field: MemberRef },
    GetStatic { field: MemberRef },
    PutStatic { field: MemberRef },
    Invoke { kind: InvokeKind, method: MemberRef },
    CheckCast { class: String },
    InstanceOf { class: String },
    Return { kind: Option<Kind> },
    Throw,
    MonitorEnter,
    MonitorExit,
}

impl Insn {
    pub fn label(label: Label) -> Self {
        Insn::Label { label }
    }

    pub fn line(line: u32) -> Self {
        Insn::Line { line }
    }

    pub fn int(value: i32) -> Self {
        Insn::Const {
            value: Constant::Int(value),
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Insn::Const {
            value: Constant::String(value.into()),
        }
    }

    pub fn load(kind: Kind, slot: u16) -> Self {
        Insn::Load { kind, slot }
    }

    pub fn store(kind: Kind, slot: u16) -> Self {
        Insn::Store { kind, slot }
    }

    pub fn invoke(kind: InvokeKind, owner: &str, name: &str, descriptor: &str) -> Self {
        Insn::Invoke {
            kind,
            method: MemberRef::new(owner, name, descriptor),
        }
    }

    /// Branch target of a jump, if any
    pub fn jump_target(&self) -> Option<Label> {
        match self {
            Insn::If { target, .. }
            | Insn::IfCmp { target, .. }
            | Insn::IfNull { target }
            | Insn::IfNonNull { target }
            | Insn::Goto { target } => Some(*target),
            _ => None,
        }
    }

    pub fn jump_target_mut(&mut self) -> Option<&mut Label> {
        match self {
            Insn::If { target, .. }
            | Insn::IfCmp { target, .. }
            | Insn::IfNull { target }
            | Insn::IfNonNull { target }
            | Insn::Goto { target } => Some(target),
            _ => None,
        }
    }

    /// Control never falls through to the next instruction
    pub fn ends_flow(&self) -> bool {
        matches!(self, Insn::Goto { .. } | Insn::Return { .. } | Insn::Throw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryCatchBlock {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// Internal name of the caught type; None catches everything
    #[serde(default)]
    pub catch_type: Option<String>,
}

/// Debug metadata for one local variable; live from `start` up to `end`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVariable {
    pub name: String,
    pub descriptor: String,
    pub start: Label,
    pub end: Label,
    pub slot: u16,
}

/// Verifier type of a local or stack entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// Result of the `New` at this instruction index
    Uninitialized(u32),
    Object(String),
}

impl VerificationType {
    pub fn size(&self) -> u16 {
        match self {
            VerificationType::Long | VerificationType::Double => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackMapFrame {
    pub label: Label,
    /// One entry per slot; the second slot of a long or double is `Top`
    pub locals: Vec<VerificationType>,
    /// One entry per value
    pub stack: Vec<VerificationType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodIr {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub access: u16,
    #[serde(default)]
    pub max_stack: u16,
    #[serde(default)]
    pub max_locals: u16,
    #[serde(default)]
    pub code: Vec<Insn>,
    #[serde(default)]
    pub try_catch: Vec<TryCatchBlock>,
    #[serde(default)]
    pub local_variables: Vec<LocalVariable>,
    #[serde(default)]
    pub frames: Vec<StackMapFrame>,
}

impl MethodIr {
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>, access: u16) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            access,
            max_stack: 0,
            max_locals: 0,
            code: Vec::new(),
            try_catch: Vec::new(),
            local_variables: Vec::new(),
            frames: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: Vec<Insn>) -> Self {
        self.code = code;
        self
    }

    pub fn with_local(mut self, name: &str, descriptor: &str, slot: u16, start: Label, end: Label) -> Self {
        self.local_variables.push(LocalVariable {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            start,
            end,
            slot,
        });
        self
    }

    pub fn with_try_catch(mut self, start: Label, end: Label, handler: Label, catch_type: Option<&str>) -> Self {
        self.try_catch.push(TryCatchBlock {
            start,
            end,
            handler,
            catch_type: catch_type.map(|s| s.to_string()),
        });
        self
    }

    pub fn is_static(&self) -> bool {
        self.access & ACC_STATIC != 0
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub fn has_code(&self) -> bool {
        self.access & (ACC_ABSTRACT | ACC_NATIVE) == 0 && !self.code.is_empty()
    }

    /// A label not yet used anywhere in the method
    pub fn fresh_label(&self) -> Label {
        let max = self
            .code
            .iter()
            .filter_map(|insn| match insn {
                Insn::Label { label } => Some(label.0),
                _ => None,
            })
            .max();
        Label(max.map(|m| m + 1).unwrap_or(0))
    }

    /// Instruction index of every label
    pub fn label_positions(&self) -> HashMap<Label, usize> {
        self.code
            .iter()
            .enumerate()
            .filter_map(|(index, insn)| match insn {
                Insn::Label { label } => Some((*label, index)),
                _ => None,
            })
            .collect()
    }

    /// Source lines present in the method, in code order
    pub fn lines(&self) -> Vec<u32> {
        self.code
            .iter()
            .filter_map(|insn| match insn {
                Insn::Line { line } => Some(*line),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassIr {
    /// Internal name, e.g. `com/example/Foo`
    pub name: String,
    #[serde(default)]
    pub super_name: Option<String>,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default = "default_major_version")]
    pub major_version: u16,
    #[serde(default)]
    pub methods: Vec<MethodIr>,
}

fn default_major_version() -> u16 {
    52
}

impl ClassIr {
    pub fn new(name: impl Into<String>, source_file: Option<&str>) -> Self {
        Self {
            name: name.into(),
            super_name: Some(OBJECT_CLASS.to_string()),
            source_file: source_file.map(|s| s.to_string()),
            major_version: default_major_version(),
            methods: Vec::new(),
        }
    }

    pub fn with_major_version(mut self, major_version: u16) -> Self {
        self.major_version = major_version;
        self
    }

    pub fn with_method(mut self, method: MethodIr) -> Self {
        self.methods.push(method);
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodIr> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn requires_frames(&self) -> bool {
        self.major_version >= STACK_MAP_MAJOR_VERSION
    }
}
