//! Registered roles and permissions, with cycle-guarded permission
//! inheritance.
//!
//! A role's effective permission set is its own permissions unioned with
//! every ancestor's, walked recursively. The walk guards against cycles by
//! tracking visited role names rather than assuming the declarations are
//! acyclic (`analyzer` reports a cycle as a diagnostic; this type just
//! refuses to loop forever if one slips through).

use std::collections::{HashMap, HashSet};

use crate::ast::{Classification, FunctionDef, PermissionDef, RoleDef};

#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    roles: HashMap<String, RoleDef>,
    permissions: HashMap<String, PermissionDef>,
}

impl SecurityContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_role(&mut self, role: RoleDef) {
        self.roles.insert(role.name.clone(), role);
    }

    pub fn register_permission(&mut self, permission: PermissionDef) {
        self.permissions.insert(permission.name.clone(), permission);
    }

    pub fn role(&self, name: &str) -> Option<&RoleDef> {
        self.roles.get(name)
    }

    pub fn permission(&self, name: &str) -> Option<&PermissionDef> {
        self.permissions.get(name)
    }

    pub fn permission_classification(&self, name: &str) -> Option<Classification> {
        self.permissions.get(name).and_then(|p| p.classification)
    }

    /// Union of `role_name`'s own permissions and every ancestor's.
    pub fn role_effective_permissions(&self, role_name: &str) -> HashSet<String> {
        let mut visited = HashSet::new();
        let mut out = HashSet::new();
        self.collect_permissions(role_name, &mut visited, &mut out);
        out
    }

    fn collect_permissions(&self, role_name: &str, visited: &mut HashSet<String>, out: &mut HashSet<String>) {
        if !visited.insert(role_name.to_string()) {
            return;
        }
        if let Some(role) = self.roles.get(role_name) {
            out.extend(role.permissions.iter().cloned());
            for parent in &role.parents {
                self.collect_permissions(parent, visited, out);
            }
        }
    }

    /// `role_name` itself plus every role reachable by following `parents`.
    pub fn role_ancestors(&self, role_name: &str) -> HashSet<String> {
        let mut visited = HashSet::new();
        self.collect_ancestors(role_name, &mut visited);
        visited
    }

    fn collect_ancestors(&self, role_name: &str, visited: &mut HashSet<String>) {
        if !visited.insert(role_name.to_string()) {
            return;
        }
        if let Some(role) = self.roles.get(role_name) {
            for parent in &role.parents {
                self.collect_ancestors(parent, visited);
            }
        }
    }

    /// True if `role_name`'s parent chain loops back on itself.
    pub fn has_role_cycle(&self, role_name: &str) -> bool {
        let mut stack = HashSet::new();
        let mut visited = HashSet::new();
        self.visit_for_cycle(role_name, &mut stack, &mut visited)
    }

    fn visit_for_cycle(&self, node: &str, stack: &mut HashSet<String>, visited: &mut HashSet<String>) -> bool {
        if stack.contains(node) {
            return true;
        }
        if !visited.insert(node.to_string()) {
            return false;
        }
        stack.insert(node.to_string());
        if let Some(role) = self.roles.get(node) {
            for parent in &role.parents {
                if self.visit_for_cycle(parent, stack, visited) {
                    return true;
                }
            }
        }
        stack.remove(node);
        false
    }

    /// Gate used before a function call executes: true iff the role (or any
    /// ancestor) is listed in the function's required roles, OR the role
    /// (with inheritance) holds any one of the function's required
    /// permissions. A function with neither requirement is public. Note this
    /// is an OR, not an AND, between the role and permission checks — a role
    /// satisfying either side is enough.
    pub fn can_role_access_function(&self, role_name: &str, function: &FunctionDef) -> bool {
        if function.required_roles.is_empty() && function.required_permissions.is_empty() {
            return true;
        }
        let role_match = !function.required_roles.is_empty() && {
            let ancestors = self.role_ancestors(role_name);
            function.required_roles.iter().any(|r| ancestors.contains(r))
        };
        let permission_match = !function.required_permissions.is_empty() && {
            let effective = self.role_effective_permissions(role_name);
            function.required_permissions.iter().any(|p| effective.contains(p))
        };
        role_match || permission_match
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::VersionInfo;
    use crate::version::Version;

    fn role(name: &str, permissions: &[&str], parents: &[&str]) -> RoleDef {
        RoleDef {
            name: name.to_string(),
            permissions: permissions.iter().map(|s| s.to_string()).collect(),
            parents: parents.iter().map(|s| s.to_string()).collect(),
            span: Default::default(),
        }
    }

    fn function(required_roles: &[&str], required_permissions: &[&str]) -> FunctionDef {
        FunctionDef {
            name: "f".to_string(),
            version: VersionInfo::new(Version::new(1, 0, 0)),
            pure: true,
            idempotent: true,
            required_roles: required_roles.iter().map(|s| s.to_string()).collect(),
            required_permissions: required_permissions.iter().map(|s| s.to_string()).collect(),
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
    fn inherits_parent_permissions() {
        let mut ctx = SecurityContext::new();
        ctx.register_role(role("user", &["data.read"], &[]));
        ctx.register_role(role("admin", &["data.write"], &["user"]));
        let perms = ctx.role_effective_permissions("admin");
        assert!(perms.contains("data.read"));
        assert!(perms.contains("data.write"));
    }

    #[test]
    fn cycle_guard_does_not_hang() {
        let mut ctx = SecurityContext::new();
        ctx.register_role(role("a", &["p1"], &["b"]));
        ctx.register_role(role("b", &["p2"], &["a"]));
        let perms = ctx.role_effective_permissions("a");
        assert!(perms.contains("p1"));
        assert!(perms.contains("p2"));
        assert!(ctx.has_role_cycle("a"));
    }

    #[test]
    fn acyclic_roles_report_no_cycle() {
        let mut ctx = SecurityContext::new();
        ctx.register_role(role("user", &[], &[]));
        ctx.register_role(role("admin", &[], &["user"]));
        assert!(!ctx.has_role_cycle("admin"));
    }

    #[test]
    fn access_denied_when_neither_role_nor_permission_match() {
        let mut ctx = SecurityContext::new();
        ctx.register_role(role("viewer", &["data.read"], &[]));
        let f = function(&["admin"], &["data.write"]);
        assert!(!ctx.can_role_access_function("viewer", &f));
    }

    #[test]
    fn access_granted_via_ancestor_role() {
        let mut ctx = SecurityContext::new();
        ctx.register_role(role("user", &["data.read"], &[]));
        ctx.register_role(role("admin", &[], &["user"]));
        let f = function(&["user"], &["data.write"]);
        assert!(ctx.can_role_access_function("admin", &f));
    }

    #[test]
    fn access_granted_via_any_required_permission() {
        let mut ctx = SecurityContext::new();
        ctx.register_role(role("user", &["data.read"], &[]));
        let f = function(&["admin"], &["data.read", "data.write"]);
        assert!(ctx.can_role_access_function("user", &f));
    }

    #[test]
    fn public_function_has_no_requirements() {
        let ctx = SecurityContext::new();
        let f = function(&[], &[]);
        assert!(ctx.can_role_access_function("anyone", &f));
    }
}
