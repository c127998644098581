// Condition and watch evaluation
//
// The expression language is supplied by the host. The engine only relies on
// this contract plus the truthiness rules below.

use crate::value::{Locals, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{expression}: {message}")]
pub struct EvaluationFailure {
    pub expression: String,
    pub message: String,
}

impl EvaluationFailure {
    pub fn new(expression: &str, message: impl Into<String>) -> Self {
        Self {
            expression: expression.to_string(),
            message: message.into(),
        }
    }
}

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &Locals) -> Result<Value, EvaluationFailure>;

    /// Evaluate as a condition. Never fails: errors and panics read as false.
    fn evaluate_boolean(&self, expression: &str, scope: &Locals) -> bool {
        match catch_unwind(AssertUnwindSafe(|| self.evaluate(expression, scope))) {
            Ok(Ok(value)) => is_truthy(&value),
            Ok(Err(failure)) => {
                debug!("Condition did not evaluate, treating as false: {}", failure);
                false
            }
            Err(_) => {
                warn!("evaluator panicked on condition {:?}", expression);
                false
            }
        }
    }
}

/// Coerce an evaluation result to a condition outcome
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Boolean(b) => *b,
        Value::Text(s) => s.eq_ignore_ascii_case("true"),
        Value::Byte(_)
        | Value::Short(_)
        | Value::Int(_)
        | Value::Long(_)
        | Value::Float(_)
        | Value::Double(_) => value.as_f64().map(|n| n != 0.0).unwrap_or(true),
        _ => true,
    }
}

/// Resolves plain names and dotted field paths, e.g. `order.customer.name`
///
/// There are no operators; anything else is an evaluation failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LookupEvaluator;

impl Evaluator for LookupEvaluator {
    fn evaluate(&self, expression: &str, scope: &Locals) -> Result<Value, EvaluationFailure> {
        let expression = expression.trim();
        if expression
            .chars()
            .any(|c| !(c.is_alphanumeric() || c == '_' || c == '$' || c == '.'))
        {
            return Err(EvaluationFailure::new(
                expression,
                "only names and dotted field paths are supported",
            ));
        }
        let mut segments = expression.split('.');

        let root = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EvaluationFailure::new(expression, "empty expression"))?;

        let mut current = scope
            .get(root)
            .cloned()
            .ok_or_else(|| EvaluationFailure::new(expression, format!("unknown name '{}'", root)))?;

        for segment in segments {
            current = match &current {
                Value::Object(object) => match segment {
                    "length" | "size" if object.object().size().is_some() => {
                        Value::Int(object.object().size().unwrap_or(0) as i32)
                    }
                    _ => object.object().field(segment).ok_or_else(|| {
                        EvaluationFailure::new(
                            expression,
                            format!("no field '{}' on {}", segment, object.object().class_name()),
                        )
                    })?,
                },
                Value::Text(text) if segment == "length" => Value::Int(text.chars().count() as i32),
                Value::Null => {
                    return Err(EvaluationFailure::new(
                        expression,
                        format!("null dereference at '{}'", segment),
                    ))
                }
                other => {
                    return Err(EvaluationFailure::new(
                        expression,
                        format!("cannot read '{}' of {}", segment, other.type_name()),
                    ))
                }
            };
        }

        Ok(current)
    }
}
