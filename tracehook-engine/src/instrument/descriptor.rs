// Type descriptors
//
// Field and method descriptor parsing, plus the mapping from descriptor
// types to verifier types and boxing calls used by the rewriter.

use super::ir::{Kind, VerificationType};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Base(BaseType),
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    pub fn kind(&self) -> Kind {
        match self {
            FieldType::Base(BaseType::Long) => Kind::Long,
            FieldType::Base(BaseType::Float) => Kind::Float,
            FieldType::Base(BaseType::Double) => Kind::Double,
            FieldType::Base(_) => Kind::Int,
            FieldType::Object(_) | FieldType::Array(_) => Kind::Ref,
        }
    }

    pub fn size(&self) -> u16 {
        self.kind().size()
    }

    /// The descriptor string this type was parsed from
    pub fn descriptor(&self) -> String {
        match self {
            FieldType::Base(base) => base.descriptor().to_string(),
            FieldType::Object(name) => format!("L{};", name),
            FieldType::Array(component) => format!("[{}", component.descriptor()),
        }
    }

    pub fn verification_type(&self) -> VerificationType {
        match self {
            FieldType::Base(BaseType::Long) => VerificationType::Long,
            FieldType::Base(BaseType::Float) => VerificationType::Float,
            FieldType::Base(BaseType::Double) => VerificationType::Double,
            FieldType::Base(_) => VerificationType::Integer,
            FieldType::Object(name) => VerificationType::Object(name.clone()),
            FieldType::Array(_) => VerificationType::Object(self.descriptor()),
        }
    }

    /// `(owner, descriptor)` of the static `valueOf` boxing a primitive
    pub fn boxing(&self) -> Option<(&'static str, &'static str)> {
        let FieldType::Base(base) = self else {
            return None;
        };
        Some(match base {
            BaseType::Boolean => ("java/lang/Boolean", "(Z)Ljava/lang/Boolean;"),
            BaseType::Byte => ("java/lang/Byte", "(B)Ljava/lang/Byte;"),
            BaseType::Char => ("java/lang/Character", "(C)Ljava/lang/Character;"),
            BaseType::Short => ("java/lang/Short", "(S)Ljava/lang/Short;"),
            BaseType::Int => ("java/lang/Integer", "(I)Ljava/lang/Integer;"),
            BaseType::Long => ("java/lang/Long", "(J)Ljava/lang/Long;"),
            BaseType::Float => ("java/lang/Float", "(F)Ljava/lang/Float;"),
            BaseType::Double => ("java/lang/Double", "(D)Ljava/lang/Double;"),
        })
    }
}

impl BaseType {
    fn descriptor(self) -> &'static str {
        match self {
            BaseType::Byte => "B",
            BaseType::Char => "C",
            BaseType::Double => "D",
            BaseType::Float => "F",
            BaseType::Int => "I",
            BaseType::Long => "J",
            BaseType::Short => "S",
            BaseType::Boolean => "Z",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnType {
    Void,
    Type(FieldType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    pub return_type: ReturnType,
}

impl MethodDescriptor {
    /// Slots taken by the parameters, receiver excluded
    pub fn params_size(&self) -> u16 {
        self.params.iter().map(FieldType::size).sum()
    }
}

pub fn parse_field_descriptor(desc: &str) -> EngineResult<FieldType> {
    let (ty, rest) = parse_field_type(desc)?;
    if !rest.is_empty() {
        return Err(EngineError::InvalidDescriptor(desc.to_string()));
    }
    Ok(ty)
}

pub fn parse_method_descriptor(desc: &str) -> EngineResult<MethodDescriptor> {
    let Some(mut rest) = desc.strip_prefix('(') else {
        return Err(EngineError::InvalidDescriptor(desc.to_string()));
    };

    let mut params = Vec::new();
    loop {
        if let Some(after) = rest.strip_prefix(')') {
            rest = after;
            break;
        }
        if rest.is_empty() {
            return Err(EngineError::InvalidDescriptor(desc.to_string()));
        }
        let (param, after) = parse_field_type(rest)?;
        params.push(param);
        rest = after;
    }

    let return_type = if rest == "V" {
        ReturnType::Void
    } else {
        ReturnType::Type(parse_field_descriptor(rest).map_err(|_| EngineError::InvalidDescriptor(desc.to_string()))?)
    };

    Ok(MethodDescriptor { params, return_type })
}

fn parse_field_type(input: &str) -> EngineResult<(FieldType, &str)> {
    let Some(first) = input.chars().next() else {
        return Err(EngineError::InvalidDescriptor(input.to_string()));
    };
    let rest = &input[first.len_utf8()..];
    let base = match first {
        'B' => Some(BaseType::Byte),
        'C' => Some(BaseType::Char),
        'D' => Some(BaseType::Double),
        'F' => Some(BaseType::Float),
        'I' => Some(BaseType::Int),
        'J' => Some(BaseType::Long),
        'S' => Some(BaseType::Short),
        'Z' => Some(BaseType::Boolean),
        _ => None,
    };
    if let Some(base) = base {
        return Ok((FieldType::Base(base), rest));
    }
    match first {
        'L' => match rest.find(';') {
            Some(end) if end > 0 => Ok((FieldType::Object(rest[..end].to_string()), &rest[end + 1..])),
            _ => Err(EngineError::InvalidDescriptor(input.to_string())),
        },
        '[' => {
            let (component, rest) = parse_field_type(rest)?;
            Ok((FieldType::Array(Box::new(component)), rest))
        }
        _ => Err(EngineError::InvalidDescriptor(input.to_string())),
    }
}

/// Verifier type of an array's elements, from the array's verifier type
pub fn array_element(array: &VerificationType) -> VerificationType {
    match array {
        VerificationType::Object(desc) if desc.starts_with('[') => match parse_field_descriptor(&desc[1..]) {
            Ok(element) => element.verification_type(),
            Err(_) => VerificationType::Object(super::ir::OBJECT_CLASS.to_string()),
        },
        _ => VerificationType::Object(super::ir::OBJECT_CLASS.to_string()),
    }
}
