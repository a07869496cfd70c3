//! Effect handlers and the classification-aware audit log.
//!
//! An effect call (`db.read`, `http.post`, …) is dispatched through a named
//! handler: a permission check, then execution, then — when the call is
//! flagged `audit_required` — an append-only log entry with classified
//! fields redacted per §4.15's rule.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ast::Classification;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>, roles: Vec<String>) -> Self {
        Self { id: id.into(), roles }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Metadata accompanying an effect call, carried from the `EXEC_EFFECT`
/// opcode's operand.
#[derive(Debug, Clone, Default)]
pub struct EffectMetadata {
    pub audit_required: bool,
    pub resource: Option<String>,
    /// Classification per positional parameter, used for audit redaction;
    /// missing entries are treated as `public`.
    pub param_classifications: Vec<Option<Classification>>,
}

pub trait EffectHandler: Send + Sync {
    /// Cheap pre-flight check, independent of `execute`'s result.
    fn check_permission(&self, operation: &str, principal: &Principal) -> bool;

    fn execute(
        &self,
        operation: &str,
        params: &[Value],
        principal: &Principal,
        metadata: &EffectMetadata,
    ) -> Result<Value, String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub principal_id: String,
    pub handler: String,
    pub operation: String,
    pub params: Vec<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub success: bool,
}

/// Redact a value for the audit log according to its field's classification.
/// `restricted`/`confidential` collapse to the literal redaction marker;
/// `internal` keeps only the type tag; `public` or unclassified passes
/// through, recursing into container values.
pub fn redact(value: &Value, classification: Option<Classification>) -> Value {
    match classification {
        Some(Classification::Restricted) | Some(Classification::Confidential) => {
            Value::Str("[REDACTED]".to_string())
        }
        Some(Classification::Internal) => Value::Str(format!("{{type: {}}}", value.type_name())),
        Some(Classification::Public) | None => redact_recursive(value),
    }
}

fn redact_recursive(value: &Value) -> Value {
    match value {
        Value::Record {
            type_name,
            fields,
            classification,
        } => match classification {
            Some(Classification::Restricted) | Some(Classification::Confidential) => {
                Value::Str("[REDACTED]".to_string())
            }
            Some(Classification::Internal) => Value::Str(format!("{{type: {}}}", value.type_name())),
            Some(Classification::Public) | None => Value::Record {
                type_name: type_name.clone(),
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.clone(), redact_recursive(v)))
                    .collect(),
                classification: *classification,
            },
        },
        Value::List(items) => Value::List(items.iter().map(redact_recursive).collect()),
        Value::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), redact_recursive(v)))
                .collect::<BTreeMap<_, _>>(),
        ),
        other => other.clone(),
    }
}

fn redact_params(params: &[Value], metadata: &EffectMetadata) -> Vec<Value> {
    params
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let classification = metadata.param_classifications.get(i).copied().flatten();
            redact(v, classification)
        })
        .collect()
}

#[derive(Default)]
pub struct EffectRegistry {
    handlers: std::collections::HashMap<String, Box<dyn EffectHandler>>,
    audit_log: Mutex<Vec<AuditLogEntry>>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Box<dyn EffectHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn audit_log(&self) -> Vec<AuditLogEntry> {
        self.audit_log.lock().expect("audit log mutex poisoned").clone()
    }

    pub fn clear_audit_log(&self) {
        self.audit_log.lock().expect("audit log mutex poisoned").clear();
    }

    /// Dispatch one effect call: permission check, execution, and — when
    /// `metadata.audit_required` — an append-only audit entry regardless of
    /// outcome.
    pub fn dispatch(
        &self,
        handler_name: &str,
        operation: &str,
        params: &[Value],
        principal: &Principal,
        metadata: &EffectMetadata,
    ) -> Result<Value, String> {
        let handler = self
            .handlers
            .get(handler_name)
            .ok_or_else(|| format!("no effect handler registered for '{}'", handler_name))?;

        if !handler.check_permission(operation, principal) {
            let reason = format!(
                "principal '{}' lacks permission for {}.{}",
                principal.id, handler_name, operation
            );
            warn!(handler = handler_name, operation, principal = %principal.id, "effect permission denied");
            self.record_audit(handler_name, operation, params, principal, metadata, None, Some(reason.clone()), false);
            return Err(reason);
        }

        match handler.execute(operation, params, principal, metadata) {
            Ok(result) => {
                info!(handler = handler_name, operation, principal = %principal.id, "effect executed");
                self.record_audit(handler_name, operation, params, principal, metadata, Some(result.clone()), None, true);
                Ok(result)
            }
            Err(error) => {
                warn!(handler = handler_name, operation, principal = %principal.id, error = %error, "effect failed");
                self.record_audit(handler_name, operation, params, principal, metadata, None, Some(error.clone()), false);
                Err(error)
            }
        }
    }

    fn record_audit(
        &self,
        handler_name: &str,
        operation: &str,
        params: &[Value],
        principal: &Principal,
        metadata: &EffectMetadata,
        result: Option<Value>,
        error: Option<String>,
        success: bool,
    ) {
        if !metadata.audit_required {
            return;
        }
        let entry = AuditLogEntry {
            timestamp: Utc::now(),
            principal_id: principal.id.clone(),
            handler: handler_name.to_string(),
            operation: operation.to_string(),
            params: redact_params(params, metadata),
            result,
            error,
            success,
        };
        self.audit_log.lock().expect("audit log mutex poisoned").push(entry);
    }
}

/// Logging effect handler: redacts its message the same way as audit params
/// when a classification is supplied, otherwise passes it through.
pub struct LogHandler;

impl EffectHandler for LogHandler {
    fn check_permission(&self, _operation: &str, _principal: &Principal) -> bool {
        true
    }

    fn execute(
        &self,
        operation: &str,
        params: &[Value],
        _principal: &Principal,
        metadata: &EffectMetadata,
    ) -> Result<Value, String> {
        let classification = metadata.param_classifications.first().copied().flatten();
        let message = params.first().cloned().unwrap_or(Value::Unit);
        let redacted = redact(&message, classification);
        info!(operation, message = %redacted, "log effect");
        Ok(Value::Unit)
    }
}

/// In-memory mock handler shared by `db`/`fs`/`event` stubs: every operation
/// succeeds and echoes a record of what was asked, useful for tests and the
/// CLI's demo mode.
pub struct MockHandler {
    pub required_role: Option<String>,
}

impl MockHandler {
    pub fn new() -> Self {
        Self { required_role: None }
    }

    pub fn requiring_role(role: impl Into<String>) -> Self {
        Self {
            required_role: Some(role.into()),
        }
    }
}

impl Default for MockHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectHandler for MockHandler {
    fn check_permission(&self, _operation: &str, principal: &Principal) -> bool {
        match &self.required_role {
            Some(role) => principal.has_role(role),
            None => true,
        }
    }

    fn execute(
        &self,
        operation: &str,
        params: &[Value],
        _principal: &Principal,
        _metadata: &EffectMetadata,
    ) -> Result<Value, String> {
        Ok(Value::Record {
            type_name: "EffectResult".to_string(),
            fields: BTreeMap::from([
                ("operation".to_string(), Value::Str(operation.to_string())),
                ("params".to_string(), Value::List(params.to_vec())),
            ]),
            classification: None,
        })
    }
}

/// Assemble the standard set of handlers named in §4.15: `db`, `http`,
/// `fs`, `log`, `event`.
pub fn default_registry() -> EffectRegistry {
    let mut registry = EffectRegistry::new();
    registry.register("db", Box::new(MockHandler::new()));
    registry.register("http", Box::new(MockHandler::new()));
    registry.register("fs", Box::new(MockHandler::new()));
    registry.register("log", Box::new(LogHandler));
    registry.register("event", Box::new(MockHandler::new()));
    registry
}
