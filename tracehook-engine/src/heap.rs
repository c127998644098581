// In-process object model
//
// Concrete HeapObject implementations for hosts that materialize their
// program state as Rust values, and for the agent's in-memory runtime.
// Interior state sits behind RwLocks so cyclic graphs can be built after
// allocation.

use crate::value::{FieldValue, HeapObject, ObjectRef, Shape, Value};
use parking_lot::RwLock;
use std::sync::Arc;

/// A declared field
#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: String,
    pub modifiers: Vec<String>,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modifiers: vec!["private".to_string()],
        }
    }

    pub fn with_modifiers(name: impl Into<String>, modifiers: &[&str]) -> Self {
        Self {
            name: name.into(),
            modifiers: modifiers.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// Class metadata: declared fields and an optional superclass
#[derive(Debug)]
pub struct ClassShape {
    pub name: String,
    pub fields: Vec<FieldDecl>,
    pub superclass: Option<Arc<ClassShape>>,
}

impl ClassShape {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDecl>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fields,
            superclass: None,
        })
    }

    pub fn extending(
        name: impl Into<String>,
        fields: Vec<FieldDecl>,
        superclass: Arc<ClassShape>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fields,
            superclass: Some(superclass),
        })
    }

    /// (declaring class, field) pairs, own class first
    fn flattened(&self) -> Vec<(String, FieldDecl)> {
        let mut out = Vec::new();
        let mut current = Some(self);
        while let Some(class) = current {
            for field in &class.fields {
                out.push((class.name.clone(), field.clone()));
            }
            current = class.superclass.as_deref();
        }
        out
    }
}

/// A plain object with declared fields
pub struct Instance {
    class: Arc<ClassShape>,
    layout: Vec<(String, FieldDecl)>,
    values: RwLock<Vec<Value>>,
    display: Option<String>,
}

impl Instance {
    pub fn new(class: Arc<ClassShape>) -> Self {
        let layout = class.flattened();
        let values = RwLock::new(vec![Value::Null; layout.len()]);
        Self {
            class,
            layout,
            values,
            display: None,
        }
    }

    /// Replace the default `Class@identity` rendering
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    /// Set the nearest field with this name. Returns false when no such field exists.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> bool {
        match self.layout.iter().position(|(_, f)| f.name == name) {
            Some(index) => {
                self.values.write()[index] = value.into();
                true
            }
            None => false,
        }
    }
}

impl HeapObject for Instance {
    fn class_name(&self) -> &str {
        &self.class.name
    }

    fn shape(&self) -> Shape {
        Shape::Fields
    }

    fn fields(&self) -> Vec<FieldValue> {
        let values = self.values.read();
        self.layout
            .iter()
            .zip(values.iter())
            .map(|((declaring, decl), value)| FieldValue {
                name: decl.name.clone(),
                declaring_class: declaring.clone(),
                modifiers: decl.modifiers.clone(),
                value: value.clone(),
            })
            .collect()
    }

    fn render(&self) -> Result<String, String> {
        match &self.display {
            Some(display) => Ok(display.clone()),
            None => Ok(format!("{}@{:x}", self.class.name, self as *const _ as usize)),
        }
    }
}

/// Arrays, lists and sets
pub struct Sequence {
    class_name: String,
    items: RwLock<Vec<Value>>,
}

impl Sequence {
    pub fn new(class_name: impl Into<String>, items: Vec<Value>) -> Self {
        Self {
            class_name: class_name.into(),
            items: RwLock::new(items),
        }
    }

    pub fn push(&self, value: impl Into<Value>) {
        self.items.write().push(value.into());
    }
}

impl HeapObject for Sequence {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn shape(&self) -> Shape {
        Shape::Indexed
    }

    fn size(&self) -> Option<usize> {
        Some(self.items.read().len())
    }

    fn elements(&self, limit: usize) -> Vec<Value> {
        self.items.read().iter().take(limit).cloned().collect()
    }

    fn render(&self) -> Result<String, String> {
        let items = self.items.read();
        let rendered: Vec<String> = items
            .iter()
            .map(|item| match item {
                Value::Object(o) => format!("{:?}", o),
                other => other.render().unwrap_or_else(|e| e),
            })
            .collect();
        Ok(format!("[{}]", rendered.join(", ")))
    }
}

/// Map-like containers
pub struct Mapping {
    class_name: String,
    entries: RwLock<Vec<(Value, Value)>>,
}

impl Mapping {
    pub fn new(class_name: impl Into<String>, entries: Vec<(Value, Value)>) -> Self {
        Self {
            class_name: class_name.into(),
            entries: RwLock::new(entries),
        }
    }

    pub fn put(&self, key: impl Into<Value>, value: impl Into<Value>) {
        self.entries.write().push((key.into(), value.into()));
    }
}

impl HeapObject for Mapping {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn shape(&self) -> Shape {
        Shape::Keyed
    }

    fn size(&self) -> Option<usize> {
        Some(self.entries.read().len())
    }

    fn entries(&self, limit: usize) -> Vec<(Value, Value)> {
        self.entries.read().iter().take(limit).cloned().collect()
    }

    fn render(&self) -> Result<String, String> {
        Ok(format!("{}(size={})", self.class_name, self.entries.read().len()))
    }
}

/// A handle the engine must never walk, e.g. an iterator or a native peer
pub struct Opaque {
    class_name: String,
    display: String,
}

impl Opaque {
    pub fn new(class_name: impl Into<String>, display: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            display: display.into(),
        }
    }
}

impl HeapObject for Opaque {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn shape(&self) -> Shape {
        Shape::Opaque
    }

    fn render(&self) -> Result<String, String> {
        Ok(self.display.clone())
    }
}

/// Allocate an instance and return both the typed handle and the shared ref
pub fn alloc(class: Arc<ClassShape>) -> (Arc<Instance>, ObjectRef) {
    let instance = Arc::new(Instance::new(class));
    let shared: Arc<dyn HeapObject> = instance.clone();
    (instance, ObjectRef::from_arc(shared))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_include_superclass_fields() {
        let base = ClassShape::new("com.example.Base", vec![FieldDecl::new("id")]);
        let derived = ClassShape::extending("com.example.Derived", vec![FieldDecl::new("name")], base);
        let (instance, _) = alloc(derived);
        instance.set("id", 7);
        instance.set("name", "seven");

        let fields = instance.fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "name");
        assert_eq!(fields[1].declaring_class, "com.example.Base");
        assert!(matches!(fields[1].value, Value::Int(7)));
    }

    #[test]
    fn test_set_unknown_field() {
        let class = ClassShape::new("com.example.Empty", Vec::new());
        let (instance, _) = alloc(class);
        assert!(!instance.set("missing", 1));
    }

    #[test]
    fn test_alloc_identity_matches_typed_handle() {
        let class = ClassShape::new("com.example.Node", vec![FieldDecl::new("next")]);
        let (a, a_ref) = alloc(class.clone());
        let (_, b_ref) = alloc(class);
        a.set("next", a_ref.clone());
        assert!(a.field("next").and_then(|v| v.identity()) == Some(a_ref.identity()));
        assert!(!a_ref.ptr_eq(&b_ref));
    }
}
