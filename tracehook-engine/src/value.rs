// Live value model
//
// The handles through which the engine reads program state. Primitive
// values are carried inline; everything with reference identity sits
// behind an Arc so identity can be compared without touching the object.

use std::fmt;
use std::sync::Arc;

/// A value read from the running program
#[derive(Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Char(char),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Text(Arc<str>),
    Class(Arc<str>),
    Object(ObjectRef),
}

/// Reference identity of a live value, stable for the duration of one capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(pub usize);

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// How an object exposes its children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Arrays, lists, sets: children are positional elements
    Indexed,
    /// Maps: children are key/value entries
    Keyed,
    /// Plain objects: children are declared fields
    Fields,
    /// Handles that must never be walked (iterators, streams, native peers)
    Opaque,
}

/// One declared field of an object, as seen through its class hierarchy
#[derive(Debug, Clone)]
pub struct FieldValue {
    pub name: String,
    pub declaring_class: String,
    pub modifiers: Vec<String>,
    pub value: Value,
}

/// Read access to a heap object owned by the host
///
/// Implementations must be cheap to call repeatedly and must not block:
/// the capture engine calls them on the application thread.
pub trait HeapObject: Send + Sync {
    fn class_name(&self) -> &str;

    fn shape(&self) -> Shape;

    /// Number of elements or entries, if the object is a container
    fn size(&self) -> Option<usize> {
        None
    }

    /// At most `limit` positional elements
    fn elements(&self, _limit: usize) -> Vec<Value> {
        Vec::new()
    }

    /// At most `limit` key/value entries
    fn entries(&self, _limit: usize) -> Vec<(Value, Value)> {
        Vec::new()
    }

    /// Declared fields, own class first then each superclass
    fn fields(&self) -> Vec<FieldValue> {
        Vec::new()
    }

    /// String form of the object; may fail the way a user `toString` can
    fn render(&self) -> Result<String, String>;

    /// Look up a field by simple name, nearest declaration first
    fn field(&self, name: &str) -> Option<Value> {
        self.fields()
            .into_iter()
            .find(|f| f.name == name)
            .map(|f| f.value)
    }
}

/// Shared handle to a heap object
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn HeapObject>);

impl ObjectRef {
    pub fn new<T: HeapObject + 'static>(object: T) -> Self {
        Self(Arc::new(object))
    }

    pub fn from_arc(object: Arc<dyn HeapObject>) -> Self {
        Self(object)
    }

    pub fn identity(&self) -> IdentityKey {
        IdentityKey(Arc::as_ptr(&self.0) as *const () as usize)
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        self.identity() == other.identity()
    }

    pub fn object(&self) -> &dyn HeapObject {
        self.0.as_ref()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.0.class_name(), self.identity())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(v) => write!(f, "(boolean) {}", v),
            Value::Byte(v) => write!(f, "(byte) {}", v),
            Value::Char(v) => write!(f, "(char) '{}'", v),
            Value::Short(v) => write!(f, "(short) {}", v),
            Value::Int(v) => write!(f, "(int) {}", v),
            Value::Long(v) => write!(f, "(long) {}", v),
            Value::Float(v) => write!(f, "(float) {}", v),
            Value::Double(v) => write!(f, "(double) {}", v),
            Value::Text(v) => write!(f, "{:?}", v),
            Value::Class(v) => write!(f, "class {}", v),
            Value::Object(o) => write!(f, "{:?}", o),
        }
    }
}

impl Value {
    pub fn text(s: impl AsRef<str>) -> Self {
        Value::Text(Arc::from(s.as_ref()))
    }

    pub fn object<T: HeapObject + 'static>(object: T) -> Self {
        Value::Object(ObjectRef::new(object))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Runtime type name as a user would read it
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Boolean(_) => "boolean".to_string(),
            Value::Byte(_) => "byte".to_string(),
            Value::Char(_) => "char".to_string(),
            Value::Short(_) => "short".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Long(_) => "long".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::Double(_) => "double".to_string(),
            Value::Text(_) => "java.lang.String".to_string(),
            Value::Class(_) => "java.lang.Class".to_string(),
            Value::Object(o) => o.object().class_name().to_string(),
        }
    }

    /// Identity key for reference values; primitives and null have none
    pub fn identity(&self) -> Option<IdentityKey> {
        match self {
            Value::Text(s) => Some(IdentityKey(Arc::as_ptr(s) as *const u8 as usize)),
            Value::Class(s) => Some(IdentityKey(Arc::as_ptr(s) as *const u8 as usize)),
            Value::Object(o) => Some(o.identity()),
            _ => None,
        }
    }

    /// Values whose children are never walked
    pub fn is_leaf(&self) -> bool {
        match self {
            Value::Object(o) => o.object().shape() == Shape::Opaque,
            _ => true,
        }
    }

    /// Numeric view used by truthiness and comparisons
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Byte(v) => Some(*v as f64),
            Value::Short(v) => Some(*v as f64),
            Value::Int(v) => Some(*v as f64),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Char(c) => Some(*c as u32 as f64),
            _ => None,
        }
    }

    /// String form of the value. Object rendering can fail.
    pub fn render(&self) -> Result<String, String> {
        match self {
            Value::Null => Ok("null".to_string()),
            Value::Boolean(v) => Ok(v.to_string()),
            Value::Byte(v) => Ok(v.to_string()),
            Value::Char(v) => Ok(v.to_string()),
            Value::Short(v) => Ok(v.to_string()),
            Value::Int(v) => Ok(v.to_string()),
            Value::Long(v) => Ok(v.to_string()),
            Value::Float(v) => Ok(v.to_string()),
            Value::Double(v) => Ok(v.to_string()),
            Value::Text(v) => Ok(v.to_string()),
            Value::Class(v) => Ok(format!("class {}", v)),
            Value::Object(o) => o.object().render(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::text(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Value::Object(v)
    }
}

/// Ordered name -> value map of the locals visible at a hit
#[derive(Debug, Clone, Default)]
pub struct Locals {
    entries: Vec<(String, Value)>,
}

impl Locals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, keeping the first insertion position
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Value)> for Locals {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut locals = Locals::new();
        for (name, value) in iter {
            locals.insert(name, value);
        }
        locals
    }
}
