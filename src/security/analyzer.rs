//! Static security analyzer: SEC001-SEC009 diagnostics over a parsed module.
//!
//! Two passes: the caller (`CompilerContext::register_module`) runs pass 1 by
//! registering every role/permission into the `SecurityContext` before
//! calling `analyze_module`, which is pass 2 — pure validation against what
//! pass 1 populated.

use crate::ast::{Classification, FunctionDef, Module};
use crate::diagnostics::{Diagnostic, DiagnosticBuilder};
use crate::security::context::SecurityContext;

pub fn analyze_module(module: &Module, ctx: &SecurityContext) -> DiagnosticBuilder {
    let mut diags = DiagnosticBuilder::new();

    for role in module.roles() {
        for parent in &role.parents {
            if ctx.role(parent).is_none() {
                diags.push(
                    Diagnostic::error(
                        format!("role '{}' inherits from unknown parent role '{}'", role.name, parent),
                        role.span,
                    )
                    .with_code("SEC001"),
                );
            }
        }
        if ctx.has_role_cycle(&role.name) {
            diags.push(
                Diagnostic::error(format!("role '{}' has a cyclical parent chain", role.name), role.span)
                    .with_code("SEC002"),
            );
        }
        for permission in &role.permissions {
            if ctx.permission(permission).is_none() {
                diags.push(
                    Diagnostic::warning(
                        format!("role '{}' references unknown permission '{}'", role.name, permission),
                        role.span,
                    )
                    .with_code("SEC003"),
                );
            }
        }
    }

    for policy in module.policies() {
        for rule in &policy.rules {
            for role_name in &rule.roles {
                if ctx.role(role_name).is_none() {
                    diags.push(
                        Diagnostic::error(
                            format!("policy '{}' references unknown role '{}'", policy.name, role_name),
                            policy.span,
                        )
                        .with_code("SEC004"),
                    );
                }
            }
            for permission in &rule.permissions {
                if ctx.permission(permission).is_none() {
                    diags.push(
                        Diagnostic::warning(
                            format!("policy '{}' references unknown permission '{}'", policy.name, permission),
                            policy.span,
                        )
                        .with_code("SEC005"),
                    );
                }
            }
        }
    }

    for f in module.functions() {
        check_required_roles(f, ctx, &mut diags);
        check_required_permissions(f, ctx, &mut diags);
        check_secrets_without_audit(f, &mut diags);
        check_classified_types_without_audit(f, module, &mut diags);
    }

    diags
}

fn check_required_roles(f: &FunctionDef, ctx: &SecurityContext, diags: &mut DiagnosticBuilder) {
    for role in &f.required_roles {
        if ctx.role(role).is_none() {
            diags.push(
                Diagnostic::error(format!("function '{}' requires unknown role '{}'", f.name, role), f.span)
                    .with_code("SEC006"),
            );
        }
    }
}

fn check_required_permissions(f: &FunctionDef, ctx: &SecurityContext, diags: &mut DiagnosticBuilder) {
    for perm in &f.required_permissions {
        if ctx.permission(perm).is_none() {
            diags.push(
                Diagnostic::warning(
                    format!("function '{}' requires unknown permission '{}'", f.name, perm),
                    f.span,
                )
                .with_code("SEC007"),
            );
        }
    }
}

fn check_secrets_without_audit(f: &FunctionDef, diags: &mut DiagnosticBuilder) {
    if f.handles_secrets && !f.audit_required {
        diags.push(
            Diagnostic::warning(
                format!("function '{}' handles secrets but is not :audit_required", f.name),
                f.span,
            )
            .with_code("SEC008")
            .with_hint("add :audit_required true"),
        );
    }
}

/// A type referenced as an input or output carries a confidential/restricted
/// field but the function touching it isn't auditing.
fn check_classified_types_without_audit(f: &FunctionDef, module: &Module, diags: &mut DiagnosticBuilder) {
    if f.audit_required {
        return;
    }
    let referenced_types = f.inputs.iter().chain(f.outputs.iter()).filter_map(|p| match &p.type_expr {
        crate::ast::TypeExpr::Named(name) => Some(name.as_str()),
        _ => None,
    });
    for type_name in referenced_types {
        if let Some(type_def) = module.types().find(|t| t.name == type_name) {
            if matches!(
                type_def.max_classification(),
                Some(Classification::Confidential) | Some(Classification::Restricted)
            ) {
                diags.push(
                    Diagnostic::warning(
                        format!(
                            "function '{}' references classified type '{}' but is not :audit_required",
                            f.name, type_name
                        ),
                        f.span,
                    )
                    .with_code("SEC009"),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn register_all(module: &Module) -> SecurityContext {
        let mut ctx = SecurityContext::new();
        for role in module.roles() {
            ctx.register_role(role.clone());
        }
        for perm in module.permissions() {
            ctx.register_permission(perm.clone());
        }
        ctx
    }

    #[test]
    fn flags_unknown_parent_role() {
        let module = parse_module("(mod m (role a :permissions [] :parents [ghost]))").unwrap();
        let ctx = register_all(&module);
        let diags = analyze_module(&module, &ctx);
        assert!(diags.iter().any(|d| d.code.as_deref() == Some("SEC001")));
    }

    #[test]
    fn flags_cyclical_role_parent_chain() {
        let module = parse_module(
            "(mod m (role a :permissions [] :parents [b]) (role b :permissions [] :parents [a]))",
        )
        .unwrap();
        let ctx = register_all(&module);
        let diags = analyze_module(&module, &ctx);
        assert!(diags.iter().any(|d| d.code.as_deref() == Some("SEC002")));
    }

    #[test]
    fn flags_unknown_required_permission() {
        let module = parse_module(
            "(mod m (fn f :v1 :permissions [nonexistent] :inputs [] :outputs [] (body 1)))",
        )
        .unwrap();
        let ctx = register_all(&module);
        let diags = analyze_module(&module, &ctx);
        assert!(diags.iter().any(|d| d.code.as_deref() == Some("SEC007")));
    }

    #[test]
    fn flags_unknown_required_role() {
        let module = parse_module(
            "(mod m (fn f :v1 :requires [ghost] :inputs [] :outputs [] (body 1)))",
        )
        .unwrap();
        let ctx = register_all(&module);
        let diags = analyze_module(&module, &ctx);
        assert!(diags.iter().any(|d| d.code.as_deref() == Some("SEC006")));
    }

    #[test]
    fn flags_secrets_without_audit() {
        let module = parse_module(
            "(mod m (fn f :v1 :handles_secrets true :inputs [] :outputs [] (body 1)))",
        )
        .unwrap();
        let ctx = register_all(&module);
        let diags = analyze_module(&module, &ctx);
        assert!(diags.iter().any(|d| d.code.as_deref() == Some("SEC008")));
    }

    #[test]
    fn flags_policy_referencing_unknown_role() {
        let module = parse_module(
            "(mod m (policy p (rule :effect allow :roles [ghost] :permissions [] :versions all_versions)))",
        )
        .unwrap();
        let ctx = register_all(&module);
        let diags = analyze_module(&module, &ctx);
        assert!(diags.iter().any(|d| d.code.as_deref() == Some("SEC004")));
    }

    #[test]
    fn flags_classified_type_referenced_without_audit() {
        let module = parse_module(
            "(mod m \
               (type account :v1 (field id :uuid) (field ssn :string :classification restricted)) \
               (fn f :v1 :inputs [] :outputs [(a account)] (body 1)))",
        )
        .unwrap();
        let ctx = register_all(&module);
        let diags = analyze_module(&module, &ctx);
        assert!(diags.iter().any(|d| d.code.as_deref() == Some("SEC009")));
    }
}
