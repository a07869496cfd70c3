//! The stack-based interpreter: fetch, dispatch, repeat.
//!
//! Arguments live in an indexed register file (`LOAD_ARG` reads from it
//! directly); locals are a per-frame name→value map populated by
//! `STORE_VAR`. `JUMP*` instructions carry an absolute instruction index —
//! the bytecompiler's label patcher already resolved them — so the
//! dispatch loop sets `ip` straight to the target rather than the
//! fetch-then-compensate dance described for the original interpreter.

use std::collections::BTreeMap;
use std::collections::HashMap;

use thiserror::Error;
use tracing::{trace, warn};

use crate::bytecode::{FunctionRecord, ModuleRecord, Opcode};
use crate::effects::{EffectMetadata, EffectRegistry, Principal};
use crate::value::{Numeric, Value};

#[derive(Debug, Error)]
pub enum VmError {
    #[error("function '{0}' not found")]
    FunctionNotFound(String),
    #[error("function '{name}' expects {expected} argument(s), got {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("Permission denied")]
    SecurityError,
    #[error("at instruction {ip}: {message}")]
    TypeMismatch { ip: usize, message: String },
    #[error("at instruction {ip}: stack underflow")]
    StackUnderflow { ip: usize },
    #[error("local variable '{name}' is not defined")]
    UndefinedVariable { name: String },
}

struct Frame {
    args: Vec<Value>,
    locals: HashMap<String, Value>,
    stack: Vec<Value>,
}

impl Frame {
    fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            locals: HashMap::new(),
            stack: Vec::new(),
        }
    }

    fn pop(&mut self, ip: usize) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow { ip })
    }

    fn pop_n(&mut self, n: usize, ip: usize) -> Result<Vec<Value>, VmError> {
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.pop(ip)?);
        }
        values.reverse();
        Ok(values)
    }

    fn pop_bool(&mut self, ip: usize) -> Result<bool, VmError> {
        match self.pop(ip)? {
            Value::Bool(b) => Ok(b),
            other => Err(VmError::TypeMismatch {
                ip,
                message: format!("expected bool, got {}", other.type_name()),
            }),
        }
    }
}

/// Runs bytecode from one `ModuleRecord`, dispatching `EXEC_EFFECT` to a
/// shared effect registry.
pub struct VM<'m> {
    module: &'m ModuleRecord,
    effects: &'m EffectRegistry,
}

impl<'m> VM<'m> {
    pub fn new(module: &'m ModuleRecord, effects: &'m EffectRegistry) -> Self {
        Self { module, effects }
    }

    /// Entry point: `execute(module, "name:version", args, principal)`.
    pub fn execute(&self, key: &str, args: Vec<Value>, principal: &Principal) -> Result<Value, VmError> {
        let record = self
            .module
            .function(key)
            .ok_or_else(|| VmError::FunctionNotFound(key.to_string()))?;
        self.run(record, args, principal)
    }

    fn resolve_call(&self, name: &str, version: Option<&crate::version::Version>) -> Option<&FunctionRecord> {
        match version {
            Some(v) => self.module.function(&format!("{}:{}", name, v)),
            None => self
                .module
                .versions_of(name)
                .max_by(|a, b| a.version.compare(&b.version)),
        }
    }

    fn run(&self, record: &FunctionRecord, args: Vec<Value>, principal: &Principal) -> Result<Value, VmError> {
        if args.len() != record.arity {
            return Err(VmError::ArityMismatch {
                name: record.name.clone(),
                expected: record.arity,
                found: args.len(),
            });
        }
        if !record.required_roles.is_empty() && !record.required_roles.iter().any(|r| principal.has_role(r)) {
            warn!(function = %record.key(), principal = %principal.id, "security gate denied call");
            return Err(VmError::SecurityError);
        }

        trace!(function = %record.key(), principal = %principal.id, "frame enter");
        let mut frame = Frame::new(args);
        let mut ip = 0usize;
        let instructions = &record.instructions;

        loop {
            if ip >= instructions.len() {
                let result = frame.stack.pop().unwrap_or(Value::Unit);
                trace!(function = %record.key(), "frame exit (fell off end)");
                return Ok(result);
            }
            let opcode = &instructions[ip].opcode;
            let mut next_ip = ip + 1;

            match opcode {
                Opcode::Push(v) => frame.stack.push(v.clone()),
                Opcode::Pop => {
                    frame.pop(ip)?;
                }
                Opcode::Dup => {
                    let top = frame.pop(ip)?;
                    frame.stack.push(top.clone());
                    frame.stack.push(top);
                }
                Opcode::Swap => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(b);
                    frame.stack.push(a);
                }
                Opcode::LoadVar(name) => {
                    let value = frame
                        .locals
                        .get(name)
                        .cloned()
                        .ok_or_else(|| VmError::UndefinedVariable { name: name.clone() })?;
                    frame.stack.push(value);
                }
                Opcode::StoreVar(name) => {
                    let top = frame.stack.last().cloned().ok_or(VmError::StackUnderflow { ip })?;
                    frame.locals.insert(name.clone(), top);
                }
                Opcode::LoadArg(index) => {
                    let value = frame
                        .args
                        .get(*index)
                        .cloned()
                        .ok_or_else(|| VmError::TypeMismatch {
                            ip,
                            message: format!("argument slot {} out of range", index),
                        })?;
                    frame.stack.push(value);
                }

                Opcode::Call { name, version, arity } => {
                    let target = self
                        .resolve_call(name, version.as_ref())
                        .ok_or_else(|| VmError::FunctionNotFound(name.clone()))?;
                    let call_args = frame.pop_n(*arity, ip)?;
                    let result = self.run(target, call_args, principal)?;
                    frame.stack.push(result);
                }
                Opcode::CallNative { name, arity } => {
                    let call_args = frame.pop_n(*arity, ip)?;
                    let result = call_native(name, &call_args)
                        .map_err(|message| VmError::TypeMismatch { ip, message })?;
                    frame.stack.push(result);
                }
                Opcode::Return | Opcode::Halt => {
                    let result = frame.stack.pop().unwrap_or(Value::Unit);
                    trace!(function = %record.key(), "frame exit");
                    return Ok(result);
                }
                Opcode::Jump(target) => next_ip = *target,
                Opcode::JumpIfFalse(target) => {
                    if !frame.pop_bool(ip)? {
                        next_ip = *target;
                    }
                }
                Opcode::JumpIfTrue(target) => {
                    if frame.pop_bool(ip)? {
                        next_ip = *target;
                    }
                }

                Opcode::Add => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(add(a, b, ip)?);
                }
                Opcode::Sub => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(numeric_binary(a, b, ip, "-", |x, y| x - y, |x, y| x - y)?);
                }
                Opcode::Mul => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(numeric_binary(a, b, ip, "*", |x, y| x * y, |x, y| x * y)?);
                }
                Opcode::Div => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(divide(a, b, ip)?);
                }
                Opcode::Mod => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(int_mod(a, b, ip)?);
                }
                Opcode::Neg => {
                    let a = frame.pop(ip)?;
                    frame.stack.push(match a.as_numeric() {
                        Some(Numeric::Int(i)) => Value::Int(-i),
                        Some(Numeric::Float(f)) => Value::Float(-f),
                        None => {
                            return Err(VmError::TypeMismatch {
                                ip,
                                message: format!("cannot negate {}", a.type_name()),
                            })
                        }
                    });
                }

                Opcode::Eq => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(Value::Bool(a == b));
                }
                Opcode::Ne => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(Value::Bool(a != b));
                }
                Opcode::Lt => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(Value::Bool(numeric_cmp(&a, &b, ip)? == std::cmp::Ordering::Less));
                }
                Opcode::Le => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(Value::Bool(numeric_cmp(&a, &b, ip)? != std::cmp::Ordering::Greater));
                }
                Opcode::Gt => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(Value::Bool(numeric_cmp(&a, &b, ip)? == std::cmp::Ordering::Greater));
                }
                Opcode::Ge => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(Value::Bool(numeric_cmp(&a, &b, ip)? != std::cmp::Ordering::Less));
                }

                Opcode::And => {
                    let b = frame.pop_bool(ip)?;
                    let a = frame.pop_bool(ip)?;
                    frame.stack.push(Value::Bool(a && b));
                }
                Opcode::Or => {
                    let b = frame.pop_bool(ip)?;
                    let a = frame.pop_bool(ip)?;
                    frame.stack.push(Value::Bool(a || b));
                }
                Opcode::Not => {
                    let a = frame.pop_bool(ip)?;
                    frame.stack.push(Value::Bool(!a));
                }

                Opcode::ExecEffect {
                    handler,
                    operation,
                    param_count,
                    audit_required,
                    resource,
                } => {
                    let params = frame.pop_n(*param_count, ip)?;
                    let param_classifications = params
                        .iter()
                        .map(|p| match p {
                            Value::Record { classification, .. } => *classification,
                            _ => None,
                        })
                        .collect();
                    let metadata = EffectMetadata {
                        audit_required: *audit_required,
                        resource: resource.clone(),
                        param_classifications,
                    };
                    match self.effects.dispatch(handler, operation, &params, principal, &metadata) {
                        Ok(value) => frame.stack.push(value),
                        Err(reason) => frame.stack.push(Value::ResultErr(Box::new(Value::Str(reason)))),
                    }
                }

                Opcode::MakeOk => {
                    let v = frame.pop(ip)?;
                    frame.stack.push(Value::ResultOk(Box::new(v)));
                }
                Opcode::MakeErr => {
                    let v = frame.pop(ip)?;
                    frame.stack.push(Value::ResultErr(Box::new(v)));
                }
                Opcode::MakeSome => {
                    let v = frame.pop(ip)?;
                    frame.stack.push(Value::OptionSome(Box::new(v)));
                }
                Opcode::MakeNone => frame.stack.push(Value::OptionNone),
                Opcode::MakeList(n) => {
                    let items = frame.pop_n(*n, ip)?;
                    frame.stack.push(Value::List(items));
                }
                Opcode::MakeMap(n_pairs) => {
                    let flat = frame.pop_n(n_pairs * 2, ip)?;
                    let mut map = BTreeMap::new();
                    for pair in flat.chunks(2) {
                        let key = as_string(&pair[0], ip)?;
                        map.insert(key, pair[1].clone());
                    }
                    frame.stack.push(Value::Map(map));
                }
                Opcode::ConstructRecord { type_name, field_count } => {
                    let flat = frame.pop_n(field_count * 2, ip)?;
                    let mut fields = BTreeMap::new();
                    for pair in flat.chunks(2) {
                        let key = as_string(&pair[0], ip)?;
                        fields.insert(key, pair[1].clone());
                    }
                    let classification = self
                        .module
                        .type_table
                        .get(type_name)
                        .and_then(|entry| entry.max_classification);
                    frame.stack.push(Value::Record {
                        type_name: type_name.clone(),
                        fields,
                        classification,
                    });
                }
                Opcode::AccessField(name) => {
                    let record = frame.pop(ip)?;
                    match record {
                        Value::Record { fields, .. } => {
                            let value = fields.get(name).cloned().ok_or_else(|| VmError::TypeMismatch {
                                ip,
                                message: format!("record has no field '{}'", name),
                            })?;
                            frame.stack.push(value);
                        }
                        other => {
                            return Err(VmError::TypeMismatch {
                                ip,
                                message: format!("expected record, got {}", other.type_name()),
                            })
                        }
                    }
                }
                Opcode::ConstructVariant { type_name, case } => {
                    let value = frame.pop(ip)?;
                    frame.stack.push(Value::Variant {
                        type_name: type_name.clone(),
                        case: case.clone(),
                        value: Box::new(value),
                    });
                }
                Opcode::MatchVariant { type_name, case } => {
                    let value = frame.pop(ip)?;
                    let matches = matches!(
                        &value,
                        Value::Variant { type_name: t, case: c, .. } if t == type_name && c == case
                    );
                    frame.stack.push(Value::Bool(matches));
                }

                Opcode::ListGet => {
                    let index = frame.pop(ip)?;
                    let list = frame.pop(ip)?;
                    frame.stack.push(list_get(&list, &index, ip)?);
                }
                Opcode::ListLen => {
                    let list = frame.pop(ip)?;
                    match list {
                        Value::List(items) => frame.stack.push(Value::Int(items.len() as i64)),
                        other => {
                            return Err(VmError::TypeMismatch {
                                ip,
                                message: format!("expected list, got {}", other.type_name()),
                            })
                        }
                    }
                }
                Opcode::ListSet => {
                    let value = frame.pop(ip)?;
                    let index = frame.pop(ip)?;
                    let list = frame.pop(ip)?;
                    frame.stack.push(list_set(list, &index, value, ip)?);
                }
                Opcode::ListAppend => {
                    let value = frame.pop(ip)?;
                    let list = frame.pop(ip)?;
                    match list {
                        Value::List(mut items) => {
                            items.push(value);
                            frame.stack.push(Value::List(items));
                        }
                        other => {
                            return Err(VmError::TypeMismatch {
                                ip,
                                message: format!("expected list, got {}", other.type_name()),
                            })
                        }
                    }
                }
                Opcode::MapGet => {
                    let key = frame.pop(ip)?;
                    let map = frame.pop(ip)?;
                    let key = as_string(&key, ip)?;
                    match map {
                        Value::Map(entries) => frame.stack.push(match entries.get(&key) {
                            Some(v) => Value::OptionSome(Box::new(v.clone())),
                            None => Value::OptionNone,
                        }),
                        other => {
                            return Err(VmError::TypeMismatch {
                                ip,
                                message: format!("expected map, got {}", other.type_name()),
                            })
                        }
                    }
                }
                Opcode::MapSet => {
                    let value = frame.pop(ip)?;
                    let key = frame.pop(ip)?;
                    let map = frame.pop(ip)?;
                    let key = as_string(&key, ip)?;
                    match map {
                        Value::Map(mut entries) => {
                            entries.insert(key, value);
                            frame.stack.push(Value::Map(entries));
                        }
                        other => {
                            return Err(VmError::TypeMismatch {
                                ip,
                                message: format!("expected map, got {}", other.type_name()),
                            })
                        }
                    }
                }
                Opcode::MapHas => {
                    let key = frame.pop(ip)?;
                    let map = frame.pop(ip)?;
                    let key = as_string(&key, ip)?;
                    match map {
                        Value::Map(entries) => frame.stack.push(Value::Bool(entries.contains_key(&key))),
                        other => {
                            return Err(VmError::TypeMismatch {
                                ip,
                                message: format!("expected map, got {}", other.type_name()),
                            })
                        }
                    }
                }

                Opcode::StrConcat => {
                    let b = frame.pop(ip)?;
                    let a = frame.pop(ip)?;
                    frame.stack.push(Value::Str(format!("{}{}", as_string(&a, ip)?, as_string(&b, ip)?)));
                }
                Opcode::StrLen => {
                    let a = frame.pop(ip)?;
                    frame.stack.push(Value::Int(as_string(&a, ip)?.chars().count() as i64));
                }

                Opcode::DebugPrint => {
                    if let Some(top) = frame.stack.last() {
                        println!("{}", top);
                    }
                }
            }

            ip = next_ip;
        }
    }
}

fn as_string(value: &Value, ip: usize) -> Result<String, VmError> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(VmError::TypeMismatch {
            ip,
            message: format!("expected string, got {}", other.type_name()),
        }),
    }
}

fn add(a: Value, b: Value, ip: usize) -> Result<Value, VmError> {
    if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
        return Ok(Value::Str(format!("{}{}", x, y)));
    }
    numeric_binary(a, b, ip, "+", |x, y| x + y, |x, y| x + y)
}

fn numeric_binary(
    a: Value,
    b: Value,
    ip: usize,
    op: &str,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, VmError> {
    match (a.as_numeric(), b.as_numeric()) {
        (Some(Numeric::Int(x)), Some(Numeric::Int(y))) => Ok(Value::Int(int_op(x, y))),
        (Some(na), Some(nb)) => Ok(Value::Float(float_op(as_f64(na), as_f64(nb)))),
        _ => Err(VmError::TypeMismatch {
            ip,
            message: format!("'{}' requires numeric operands, got {} and {}", op, a.type_name(), b.type_name()),
        }),
    }
}

fn as_f64(n: Numeric) -> f64 {
    match n {
        Numeric::Int(i) => i as f64,
        Numeric::Float(f) => f,
    }
}

fn divide(a: Value, b: Value, ip: usize) -> Result<Value, VmError> {
    match (a.as_numeric(), b.as_numeric()) {
        (Some(na), Some(nb)) => {
            if as_f64(nb) == 0.0 {
                return Ok(Value::ResultErr(Box::new(Value::Str("Division by zero".to_string()))));
            }
            match (na, nb) {
                (Numeric::Int(x), Numeric::Int(y)) => Ok(Value::Int(x / y)),
                _ => Ok(Value::Float(as_f64(na) / as_f64(nb))),
            }
        }
        _ => Err(VmError::TypeMismatch {
            ip,
            message: format!("'/' requires numeric operands, got {} and {}", a.type_name(), b.type_name()),
        }),
    }
}

fn int_mod(a: Value, b: Value, ip: usize) -> Result<Value, VmError> {
    match (&a, &b) {
        (Value::Int(_), Value::Int(0)) => Ok(Value::ResultErr(Box::new(Value::Str("Division by zero".to_string())))),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x % y)),
        _ => Err(VmError::TypeMismatch {
            ip,
            message: format!("'%' is integer-only, got {} and {}", a.type_name(), b.type_name()),
        }),
    }
}

fn numeric_cmp(a: &Value, b: &Value, ip: usize) -> Result<std::cmp::Ordering, VmError> {
    match (a.as_numeric(), b.as_numeric()) {
        (Some(na), Some(nb)) => as_f64(na)
            .partial_cmp(&as_f64(nb))
            .ok_or_else(|| VmError::TypeMismatch {
                ip,
                message: "comparison produced NaN".to_string(),
            }),
        _ => Err(VmError::TypeMismatch {
            ip,
            message: format!("comparison requires numeric operands, got {} and {}", a.type_name(), b.type_name()),
        }),
    }
}

fn list_get(list: &Value, index: &Value, ip: usize) -> Result<Value, VmError> {
    let items = match list {
        Value::List(items) => items,
        other => {
            return Err(VmError::TypeMismatch {
                ip,
                message: format!("expected list, got {}", other.type_name()),
            })
        }
    };
    let i = match index {
        Value::Int(i) => *i,
        other => {
            return Err(VmError::TypeMismatch {
                ip,
                message: format!("expected int index, got {}", other.type_name()),
            })
        }
    };
    usize::try_from(i)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .ok_or_else(|| VmError::TypeMismatch {
            ip,
            message: format!("list index {} out of bounds", i),
        })
}

fn list_set(list: Value, index: &Value, value: Value, ip: usize) -> Result<Value, VmError> {
    let mut items = match list {
        Value::List(items) => items,
        other => {
            return Err(VmError::TypeMismatch {
                ip,
                message: format!("expected list, got {}", other.type_name()),
            })
        }
    };
    let i = match index {
        Value::Int(i) => *i,
        other => {
            return Err(VmError::TypeMismatch {
                ip,
                message: format!("expected int index, got {}", other.type_name()),
            })
        }
    };
    match usize::try_from(i).ok().filter(|i| *i < items.len()) {
        Some(i) => {
            items[i] = value;
            Ok(Value::List(items))
        }
        None => Err(VmError::TypeMismatch {
            ip,
            message: format!("list index {} out of bounds", i),
        }),
    }
}

/// Host functions reachable from `CALL_NATIVE`, keyed by their qualified
/// name.
fn call_native(name: &str, args: &[Value]) -> Result<Value, String> {
    match name {
        "str.concat" => {
            let mut joined = String::new();
            for v in args {
                match v {
                    Value::Str(s) => joined.push_str(s),
                    other => return Err(format!("str.concat expects strings, got {}", other.type_name())),
                }
            }
            Ok(Value::Str(joined))
        }
        "str.uppercase" => match args.first() {
            Some(Value::Str(s)) => Ok(Value::Str(s.to_uppercase())),
            _ => Err("str.uppercase expects a single string argument".to_string()),
        },
        "str.lowercase" => match args.first() {
            Some(Value::Str(s)) => Ok(Value::Str(s.to_lowercase())),
            _ => Err("str.lowercase expects a single string argument".to_string()),
        },
        "list.length" => match args.first() {
            Some(Value::List(items)) => Ok(Value::Int(items.len() as i64)),
            _ => Err("list.length expects a single list argument".to_string()),
        },
        other => Err(format!("no native function registered for '{}'", other)),
    }
}
