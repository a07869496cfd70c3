//! The runtime value model: one tagged enum covering every type the
//! bytecode VM pushes and pops.
//!
//! Equality is derived, not hand-rolled: different variants are never equal
//! under `#[derive(PartialEq)]`, which is exactly the "int and float never
//! cross-tag-equal" rule — `Value::Int(1) == Value::Float(1.0)` is `false`
//! because they're different variants, full stop. Numeric *arithmetic* is
//! more permissive (int promotes to float when mixed); see `as_numeric`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ast::Classification;
use crate::version::Version;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Record {
        type_name: String,
        fields: BTreeMap<String, Value>,
        classification: Option<Classification>,
    },
    Variant {
        type_name: String,
        case: String,
        value: Box<Value>,
    },
    FunctionRef {
        name: String,
        version: Version,
    },
    ResultOk(Box<Value>),
    ResultErr(Box<Value>),
    OptionSome(Box<Value>),
    OptionNone,
}

/// A value coerced to one arithmetic lane, used by the VM's arithmetic
/// opcodes to decide whether a pair of operands stay integral or promote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::Timestamp(_) => "timestamp",
            Value::Json(_) => "json",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Record { .. } => "record",
            Value::Variant { .. } => "variant",
            Value::FunctionRef { .. } => "function_ref",
            Value::ResultOk(_) | Value::ResultErr(_) => "result",
            Value::OptionSome(_) | Value::OptionNone => "option",
        }
    }

    pub fn as_numeric(&self) -> Option<Numeric> {
        match self {
            Value::Int(i) => Some(Numeric::Int(*i)),
            Value::Float(f) => Some(Numeric::Float(*f)),
            _ => None,
        }
    }

    /// Truncating cast to `i64`, matching Rust's `as i64` semantics for a
    /// float operand (round toward zero, saturating at the integer bounds).
    pub fn as_int_truncating(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn unit() -> Value {
        Value::Unit
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Json(j) => write!(f, "{}", j),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Record { type_name, fields, .. } => {
                write!(f, "{} {{", type_name)?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Variant {
                type_name,
                case,
                value,
            } => {
                if matches!(value.as_ref(), Value::Unit) {
                    write!(f, "{}.{}", type_name, case)
                } else {
                    write!(f, "{}.{}({})", type_name, case, value)
                }
            }
            Value::FunctionRef { name, version } => write!(f, "{}:{}", name, version),
            Value::ResultOk(v) => write!(f, "Ok({})", v),
            Value::ResultErr(v) => write!(f, "Err({})", v),
            Value::OptionSome(v) => write!(f, "Some({})", v),
            Value::OptionNone => write!(f, "None"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_and_float_never_cross_tag_equal() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn equal_same_variant_values_are_equal() {
        assert_eq!(Value::Int(7), Value::Int(7));
        assert_eq!(Value::Str("a".into()), Value::Str("a".into()));
    }

    #[test]
    fn as_int_truncating_casts_float() {
        assert_eq!(Value::Float(3.9).as_int_truncating(), Some(3));
        assert_eq!(Value::Float(-3.9).as_int_truncating(), Some(-3));
    }

    #[test]
    fn display_renders_variant_with_payload() {
        let v = Value::Variant {
            type_name: "Status".into(),
            case: "Ok".into(),
            value: Box::new(Value::Int(1)),
        };
        assert_eq!(v.to_string(), "Status.Ok(1)");
    }

    #[test]
    fn display_renders_unit_variant_without_parens() {
        let v = Value::Variant {
            type_name: "Status".into(),
            case: "Unknown".into(),
            value: Box::new(Value::Unit),
        };
        assert_eq!(v.to_string(), "Status.Unknown");
    }
}
