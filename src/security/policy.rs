//! Runtime policy evaluation: ordered allow/deny rules with deny-precedence.
//!
//! Evaluation is keyed by `(role, function_name, optional version)`, not by
//! a bare permission string — a rule matches a function if the function's
//! *required permissions* intersect the rule's permission list, or, when the
//! function declares none, via a substring heuristic described below. This
//! mirrors the scenario in spec §8.5 exactly: a policy names `[data.access]`
//! and the function it gates requires permission `data.access`.

use tracing::debug;

use crate::ast::{FunctionDef, Module, PolicyDef, RuleEffect, RuleVersionConstraint};
use crate::security::context::SecurityContext;
use crate::version::{parse_constraint, satisfies, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRecord {
    pub decision: Decision,
    pub reason: Option<String>,
}

fn version_matches(constraint: &RuleVersionConstraint, version: &Version) -> bool {
    match constraint {
        RuleVersionConstraint::AllVersions => true,
        RuleVersionConstraint::StableOnly => version.is_stable(),
        RuleVersionConstraint::Specific(versions) => versions.contains(version),
        RuleVersionConstraint::Range(expr) => parse_constraint(expr)
            .map(|c| satisfies(version, &c))
            .unwrap_or(false),
    }
}

/// A rule's permission list matches a function if any required permission of
/// the function is named directly in the rule. If the function requires no
/// permissions at all, fall back to a substring heuristic: any rule
/// permission that shares a dotted segment with the function's name. This is
/// a compatibility shim carried over from early policy authoring and should
/// not be relied on in new modules — prefer declaring `:permissions` on the
/// function instead.
fn permission_clause_matches(rule: &crate::ast::PolicyRule, function: &FunctionDef) -> bool {
    if rule.permissions.is_empty() {
        return false;
    }
    if !function.required_permissions.is_empty() {
        return function
            .required_permissions
            .iter()
            .any(|p| rule.permissions.contains(p));
    }
    rule.permissions.iter().any(|p| {
        function
            .name
            .split('.')
            .any(|part| p.split('.').any(|rule_part| rule_part == part))
    })
}

pub struct PolicyEvaluator<'a> {
    policies: &'a [PolicyDef],
    ctx: &'a SecurityContext,
}

impl<'a> PolicyEvaluator<'a> {
    pub fn new(policies: &'a [PolicyDef], ctx: &'a SecurityContext) -> Self {
        Self { policies, ctx }
    }

    fn rule_matches(&self, rule: &crate::ast::PolicyRule, effective_roles: &std::collections::HashSet<String>, function: &FunctionDef, version: Option<&Version>) -> bool {
        let role_ok = !rule.roles.is_empty() && rule.roles.iter().any(|r| effective_roles.contains(r));
        let version_ok = match version {
            Some(v) => version_matches(&rule.version_constraint, v),
            None => true,
        };
        role_ok && permission_clause_matches(rule, function) && version_ok
    }

    /// Evaluate access for `role_name` calling `function` at an optional
    /// specific `version`. Unknown role is an immediate deny. Deny always
    /// wins over allow; with no policies registered at all, falls back to
    /// plain `required_roles` membership.
    pub fn evaluate(&self, role_name: &str, function: &FunctionDef, version: Option<&Version>) -> EvaluationRecord {
        if self.ctx.role(role_name).is_none() {
            debug!(role = role_name, function = %function.name, "policy decision: deny (unknown role)");
            return EvaluationRecord {
                decision: Decision::Deny,
                reason: Some("role does not exist".to_string()),
            };
        }

        if self.policies.is_empty() {
            let allow = function.required_roles.is_empty() || function.required_roles.contains(&role_name.to_string());
            debug!(role = role_name, function = %function.name, allow, "policy decision: no policies, falling back to required_roles");
            return EvaluationRecord {
                decision: if allow { Decision::Allow } else { Decision::Deny },
                reason: None,
            };
        }

        let effective_roles = self.ctx.role_ancestors(role_name);
        let mut first_deny = None;
        let mut first_allow = None;
        for policy in self.policies {
            for rule in &policy.rules {
                if self.rule_matches(rule, &effective_roles, function, version) {
                    match rule.effect {
                        RuleEffect::Deny if first_deny.is_none() => first_deny = Some(rule),
                        RuleEffect::Allow if first_allow.is_none() => first_allow = Some(rule),
                        _ => {}
                    }
                }
            }
        }

        if let Some(rule) = first_deny {
            debug!(role = role_name, function = %function.name, "policy decision: deny (matching deny rule)");
            return EvaluationRecord {
                decision: Decision::Deny,
                reason: rule.reason.clone(),
            };
        }
        if let Some(rule) = first_allow {
            debug!(role = role_name, function = %function.name, "policy decision: allow");
            return EvaluationRecord {
                decision: Decision::Allow,
                reason: rule.reason.clone(),
            };
        }
        debug!(role = role_name, function = %function.name, "policy decision: deny (no matching rule)");
        EvaluationRecord {
            decision: Decision::Deny,
            reason: Some("no matching rule".to_string()),
        }
    }

    pub fn accessible_functions<'m>(&self, role_name: &str, module: &'m Module) -> Vec<&'m FunctionDef> {
        module
            .functions()
            .filter(|f| self.evaluate(role_name, f, Some(&f.version.version)).decision == Decision::Allow)
            .collect()
    }

    /// Per-function accessibility report, used by the CLI's inspect output.
    pub fn access_report(&self, role_name: &str, module: &Module) -> Vec<AccessReportEntry> {
        module
            .functions()
            .map(|f| {
                let record = self.evaluate(role_name, f, Some(&f.version.version));
                AccessReportEntry {
                    function_name: f.name.clone(),
                    accessible: record.decision == Decision::Allow,
                    reason: record.reason,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccessReportEntry {
    pub function_name: String,
    pub accessible: bool,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::VersionInfo;
    use crate::parser::parse_module;

    fn ctx_with_role(name: &str, permissions: &[&str]) -> SecurityContext {
        let mut ctx = SecurityContext::new();
        ctx.register_role(crate::ast::RoleDef {
            name: name.to_string(),
            permissions: permissions.iter().map(|s| s.to_string()).collect(),
            parents: Vec::new(),
            span: Default::default(),
        });
        ctx
    }

    fn function_requiring(permissions: &[&str]) -> FunctionDef {
        FunctionDef {
            name: "access_data".to_string(),
            version: VersionInfo::new(Version::new(1, 0, 0)),
            pure: true,
            idempotent: true,
            required_roles: Vec::new(),
            required_permissions: permissions.iter().map(|s| s.to_string()).collect(),
            effects: Vec::new(),
            handles_secrets: false,
            audit_required: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            body: Vec::new(),
            span: Default::default(),
        }
    }

    #[test]
    fn deny_wins_over_allow_regardless_of_order() {
        let module = parse_module(
            "(mod m (policy p \
               (rule :effect allow :roles [user] :permissions [data.access] :versions all_versions) \
               (rule :effect deny :roles [user] :permissions [data.access] :versions all_versions)))",
        )
        .unwrap();
        let ctx = ctx_with_role("user", &["data.access"]);
        let f = function_requiring(&["data.access"]);
        let policies: Vec<_> = module.policies().cloned().collect();
        let evaluator = PolicyEvaluator::new(&policies, &ctx);
        let decision = evaluator.evaluate("user", &f, Some(&Version::new(1, 0, 0)));
        assert_eq!(decision.decision, Decision::Deny);
    }

    #[test]
    fn unknown_role_is_denied() {
        let ctx = SecurityContext::new();
        let evaluator = PolicyEvaluator::new(&[], &ctx);
        let f = function_requiring(&["data.access"]);
        let record = evaluator.evaluate("ghost", &f, None);
        assert_eq!(record.decision, Decision::Deny);
        assert_eq!(record.reason.as_deref(), Some("role does not exist"));
    }

    #[test]
    fn no_policies_falls_back_to_required_roles_membership() {
        let ctx = ctx_with_role("user", &[]);
        let evaluator = PolicyEvaluator::new(&[], &ctx);
        let mut f = function_requiring(&[]);
        f.required_roles = vec!["user".to_string()];
        assert_eq!(evaluator.evaluate("user", &f, None).decision, Decision::Allow);
        f.required_roles = vec!["admin".to_string()];
        assert_eq!(evaluator.evaluate("user", &f, None).decision, Decision::Deny);
    }

    #[test]
    fn stable_only_rule_rejects_prerelease_version() {
        let module = parse_module(
            "(mod m (policy p (rule :effect allow :roles [user] :permissions [data.access] :versions stable_only)))",
        )
        .unwrap();
        let ctx = ctx_with_role("user", &[]);
        let f = function_requiring(&["data.access"]);
        let policies: Vec<_> = module.policies().cloned().collect();
        let evaluator = PolicyEvaluator::new(&policies, &ctx);
        let mut prerelease = Version::new(1, 0, 0);
        prerelease.prerelease = Some("beta".to_string());
        let decision = evaluator.evaluate("user", &f, Some(&prerelease));
        assert_eq!(decision.decision, Decision::Deny);
    }

    #[test]
    fn substring_heuristic_matches_when_function_declares_no_permissions() {
        let module = parse_module(
            "(mod m (policy p (rule :effect allow :roles [user] :permissions [data.access] :versions all_versions)))",
        )
        .unwrap();
        let ctx = ctx_with_role("user", &[]);
        let f = function_requiring(&[]); // name is "access_data", shares "access" with rule perm "data.access"
        let policies: Vec<_> = module.policies().cloned().collect();
        let evaluator = PolicyEvaluator::new(&policies, &ctx);
        let decision = evaluator.evaluate("user", &f, Some(&Version::new(1, 0, 0)));
        assert_eq!(decision.decision, Decision::Allow);
    }

    #[test]
    fn access_report_lists_denied_functions() {
        let module = parse_module(
            "(mod m (fn access_data :v1 :permissions [data.write] :inputs [] :outputs [] (body 1)) \
               (policy p (rule :effect allow :roles [user] :permissions [data.read] :versions all_versions)))",
        )
        .unwrap();
        let ctx = ctx_with_role("user", &[]);
        let policies: Vec<_> = module.policies().cloned().collect();
        let evaluator = PolicyEvaluator::new(&policies, &ctx);
        let report = evaluator.access_report("user", &module);
        assert_eq!(report.len(), 1);
        assert!(!report[0].accessible);
    }
}
