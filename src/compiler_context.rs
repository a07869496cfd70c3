//! Registration-time context: version chains, security context, migrations,
//! and the VER001-VER010 diagnostics produced while registering a module.
//!
//! Registration never hard-fails — every problem becomes a diagnostic, and
//! the caller (the CLI, a test) decides whether `diagnostics.has_errors()`
//! should stop the pipeline. This mirrors the `DiagnosticBuilder` pattern
//! used across parsing and the static analyzer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ast::{FunctionDef, Module, TypeDef};
use crate::compat::{self, Compatibility};
use crate::diagnostics::{Diagnostic, DiagnosticBuilder};
use crate::migration::MigrationRegistry;
use crate::security::analyzer::analyze_module;
use crate::security::context::SecurityContext;
use crate::version::{parse_constraint, Version};
use crate::version_registry::{VersionEntry, VersionRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// Reserved: promote static-analyzer warnings to hard errors.
    pub strict_versioning: bool,
    /// Emit VER005 when a registered version is marked `:deprecated true`.
    pub warn_on_deprecated: bool,
    /// Reserved: require a registered migration step for every breaking
    /// `:replaces` link.
    pub require_migrations: bool,
    /// Suppress VER006 for `alpha`/`beta`/unstable version registrations.
    pub allow_unstable_versions: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            strict_versioning: false,
            warn_on_deprecated: true,
            require_migrations: false,
            allow_unstable_versions: false,
        }
    }
}

#[derive(Default)]
pub struct CompilerContext {
    pub options: CompilerOptions,
    pub functions: VersionRegistry<FunctionDef>,
    pub types: VersionRegistry<TypeDef>,
    pub security: SecurityContext,
    pub migrations: MigrationRegistry,
    pub diagnostics: DiagnosticBuilder,
    modules: HashMap<String, Module>,
}

impl CompilerContext {
    pub fn new(options: CompilerOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.has_errors()
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    /// Register every element of `module`: roles and permissions first (so
    /// the static analyzer can resolve references against them), then every
    /// function and type version, then the static analyzer pass.
    pub fn register_module(&mut self, module: &Module) {
        debug!(module = %module.name, "registering module");
        for role in module.roles() {
            self.security.register_role(role.clone());
        }
        for permission in module.permissions() {
            self.security.register_permission(permission.clone());
        }

        for f in module.functions() {
            self.register_function(f);
        }
        for t in module.types() {
            self.register_type(t);
        }

        let analyzer_diags = analyze_module(module, &self.security);
        for diag in analyzer_diags.into_vec() {
            self.diagnostics.push(diag);
        }

        self.modules.insert(module.name.clone(), module.clone());
    }

    fn register_function(&mut self, f: &FunctionDef) {
        let span = f.span;

        if let Some(replaces) = f.version.replaces.clone() {
            if let Some(old) = self.functions.chain(&f.name).and_then(|c| c.get(&replaces)) {
                let report = compat::analyze_function_change(old, f);
                if report.compatibility == Compatibility::Breaking && f.version.version.major <= replaces.major {
                    self.diagnostics.push(
                        Diagnostic::error(
                            format!(
                                "function '{}' {} -> {} is a breaking change but the major version was not bumped",
                                f.name, replaces, f.version.version
                            ),
                            span,
                        )
                        .with_code("VER003"),
                    );
                }
                for detail in report.details.iter().filter(|d| d.breaking) {
                    self.diagnostics.push(
                        Diagnostic::warning(
                            format!("function '{}' {} -> {}: {}", f.name, replaces, f.version.version, detail.message),
                            span,
                        )
                        .with_code("VER004"),
                    );
                }
            }
        }

        if f.version.deprecated == Some(true) && self.options.warn_on_deprecated {
            self.diagnostics.push(
                Diagnostic::warning(
                    format!("function '{}' version {} is deprecated", f.name, f.version.version),
                    span,
                )
                .with_code("VER005"),
            );
        }

        if f.version.stability.is_unstable() && !self.options.allow_unstable_versions {
            self.diagnostics.push(
                Diagnostic::warning(
                    format!(
                        "function '{}' version {} is {:?} and may change without notice",
                        f.name, f.version.version, f.version.stability
                    ),
                    span,
                )
                .with_code("VER006"),
            );
        }

        debug!(function = %f.name, version = %f.version.version, "registering function version");
        self.functions.chain_mut(&f.name).insert(VersionEntry {
            version: f.version.version.clone(),
            replaces: f.version.replaces.clone(),
            deprecated: f.version.deprecated.unwrap_or(false),
            item: f.clone(),
        });
    }

    fn register_type(&mut self, t: &TypeDef) {
        let span = t.span;

        if let Some(replaces) = t.version.replaces.clone() {
            if let Some(old) = self.types.chain(&t.name).and_then(|c| c.get(&replaces)) {
                let report = compat::analyze_type_change(old, t);
                if report.compatibility == Compatibility::Breaking && t.version.version.major <= replaces.major {
                    self.diagnostics.push(
                        Diagnostic::error(
                            format!(
                                "type '{}' {} -> {} is a breaking change but the major version was not bumped",
                                t.name, replaces, t.version.version
                            ),
                            span,
                        )
                        .with_code("VER007"),
                    );
                }
                for detail in report.details.iter() {
                    self.diagnostics.push(
                        Diagnostic::warning(
                            format!("type '{}' {} -> {}: {}", t.name, replaces, t.version.version, detail.message),
                            span,
                        )
                        .with_code("VER011"),
                    );
                }
            }
        }

        debug!(type_name = %t.name, version = %t.version.version, "registering type version");
        self.types.chain_mut(&t.name).insert(VersionEntry {
            version: t.version.version.clone(),
            replaces: t.version.replaces.clone(),
            deprecated: t.version.deprecated.unwrap_or(false),
            item: t.clone(),
        });
    }

    /// Resolve `name` against a version constraint string such as `"^v1.0"`
    /// or `"latest"`. VER008 on a malformed constraint, VER009 when nothing
    /// in the chain satisfies it.
    pub fn resolve_function_version(&mut self, name: &str, constraint: &str) -> Option<&FunctionDef> {
        let span = Default::default();
        let parsed = match parse_constraint(constraint) {
            Ok(c) => c,
            Err(e) => {
                self.diagnostics.push(
                    Diagnostic::error(format!("function '{}': {}", name, e), span).with_code("VER008"),
                );
                return None;
            }
        };
        let chain = self.functions.chain(name)?;
        match chain.resolve(&parsed) {
            Some(version) => {
                let version = version.clone();
                self.functions.chain(name)?.get(&version)
            }
            None => {
                self.diagnostics.push(
                    Diagnostic::error(
                        format!("function '{}' has no version satisfying '{}'", name, constraint),
                        span,
                    )
                    .with_code("VER009"),
                );
                None
            }
        }
    }

    /// Type analog of `resolve_function_version`; both parse failure and
    /// no-match collapse to VER010.
    pub fn resolve_type_version(&mut self, name: &str, constraint: &str) -> Option<&TypeDef> {
        let span = Default::default();
        let parsed = match parse_constraint(constraint) {
            Ok(c) => c,
            Err(e) => {
                self.diagnostics
                    .push(Diagnostic::error(format!("type '{}': {}", name, e), span).with_code("VER010"));
                return None;
            }
        };
        let chain = self.types.chain(name)?;
        match chain.resolve(&parsed) {
            Some(version) => {
                let version = version.clone();
                self.types.chain(name)?.get(&version)
            }
            None => {
                self.diagnostics.push(
                    Diagnostic::error(
                        format!("type '{}' has no version satisfying '{}'", name, constraint),
                        span,
                    )
                    .with_code("VER010"),
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn register(source: &str) -> CompilerContext {
        let module = parse_module(source).unwrap();
        let mut ctx = CompilerContext::new(CompilerOptions::default());
        ctx.register_module(&module);
        ctx
    }

    #[test]
    fn registers_function_without_diagnostics() {
        let ctx = register("(mod m (fn f :v1 :inputs [] :outputs [] (body 1)))");
        assert!(!ctx.has_errors());
        assert!(ctx.functions.chain("f").unwrap().contains(&Version::new(1, 0, 0)));
    }

    #[test]
    fn breaking_change_without_major_bump_is_an_error() {
        let ctx = register(
            "(mod m \
               (fn f :v1 :inputs [(x :int)] :outputs [] (body 1)) \
               (fn f :v1.1 :replaces :v1 :inputs [] :outputs [] (body 2)))",
        );
        assert!(ctx.diagnostics.iter().any(|d| d.code.as_deref() == Some("VER003")));
    }

    #[test]
    fn breaking_change_emits_itemized_ver004_warning() {
        let ctx = register(
            "(mod m \
               (fn f :v1 :inputs [(x :int)] :outputs [] (body 1)) \
               (fn f :v2 :replaces :v1 :inputs [] :outputs [] (body 2)))",
        );
        assert!(ctx.diagnostics.iter().any(|d| d.code.as_deref() == Some("VER004")));
        assert!(!ctx.diagnostics.iter().any(|d| d.code.as_deref() == Some("VER003")));
    }

    #[test]
    fn compatible_addition_has_no_breaking_diagnostics() {
        let ctx = register(
            "(mod m \
               (fn f :v1 :inputs [] :outputs [] (body 1)) \
               (fn f :v1.1 :replaces :v1 :inputs [(y :int :optional true)] :outputs [] (body 2)))",
        );
        assert!(!ctx.diagnostics.iter().any(|d| d.code.as_deref() == Some("VER003")));
        assert!(!ctx.diagnostics.iter().any(|d| d.code.as_deref() == Some("VER004")));
    }

    #[test]
    fn deprecated_version_warns_when_option_enabled() {
        let ctx = register("(mod m (fn f :v1 :deprecated true :inputs [] :outputs [] (body 1)))");
        assert!(ctx.diagnostics.iter().any(|d| d.code.as_deref() == Some("VER005")));
    }

    #[test]
    fn unstable_version_warns_unless_allowed() {
        let ctx = register("(mod m (fn f :v1.0.0-beta :inputs [] :outputs [] (body 1)))");
        assert!(ctx.diagnostics.iter().any(|d| d.code.as_deref() == Some("VER006")));

        let module = parse_module("(mod m (fn f :v1.0.0-beta :inputs [] :outputs [] (body 1)))").unwrap();
        let mut options = CompilerOptions::default();
        options.allow_unstable_versions = true;
        let mut ctx = CompilerContext::new(options);
        ctx.register_module(&module);
        assert!(!ctx.diagnostics.iter().any(|d| d.code.as_deref() == Some("VER006")));
    }

    #[test]
    fn resolve_function_version_reports_no_match() {
        let mut ctx = register("(mod m (fn f :v1 :inputs [] :outputs [] (body 1)))");
        assert!(ctx.resolve_function_version("f", "^v2.0.0").is_none());
        assert!(ctx.diagnostics.iter().any(|d| d.code.as_deref() == Some("VER009")));
    }

    #[test]
    fn resolve_function_version_reports_bad_constraint() {
        let mut ctx = register("(mod m (fn f :v1 :inputs [] :outputs [] (body 1)))");
        assert!(ctx.resolve_function_version("f", "???").is_none());
        assert!(ctx.diagnostics.iter().any(|d| d.code.as_deref() == Some("VER008")));
    }

    #[test]
    fn resolve_function_version_finds_latest() {
        let mut ctx = register(
            "(mod m (fn f :v1 :inputs [] :outputs [] (body 1)) (fn f :v2 :replaces :v1 :inputs [] :outputs [] (body 2)))",
        );
        let resolved = ctx.resolve_function_version("f", "latest").unwrap();
        assert_eq!(resolved.version.version, Version::new(2, 0, 0));
    }
}
