//! Compatibility analysis between two versions of the same function or type.
//!
//! Type equality is decided by comparing `TypeExpr::pretty()` strings, not
//! structural equality — a renamed-but-isomorphic type still counts as a
//! change, matching how the AST's `pretty()` is documented to be used.

use crate::ast::{FieldDef, FunctionDef, Param, TypeDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    FullyCompatible,
    BackwardCompatible,
    Breaking,
}

impl Compatibility {
    /// The minimum semver bump this level of change requires.
    pub fn suggest_bump(self) -> &'static str {
        match self {
            Compatibility::FullyCompatible => "patch",
            Compatibility::BackwardCompatible => "minor",
            Compatibility::Breaking => "major",
        }
    }
}

/// One detected change between two versions of a function, tagged with
/// whether it is breaking on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDetail {
    pub breaking: bool,
    pub message: String,
}

/// Overall classification plus the itemized changes that produced it, in the
/// order spec §4.6 lists its checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionChangeReport {
    pub compatibility: Compatibility,
    pub details: Vec<ChangeDetail>,
}

fn param_key(p: &Param) -> (&str, String) {
    (p.name.as_str(), p.type_expr.pretty())
}

fn find_param<'a>(params: &'a [Param], name: &str) -> Option<&'a Param> {
    params.iter().find(|p| p.name == name)
}

fn diff_params(old: &[Param], new: &[Param], kind: &str, details: &mut Vec<ChangeDetail>) {
    for old_param in old {
        match find_param(new, &old_param.name) {
            None => details.push(ChangeDetail {
                breaking: true,
                message: format!("{} '{}' removed", kind, old_param.name),
            }),
            Some(new_param) if new_param.type_expr.pretty() != old_param.type_expr.pretty() => {
                details.push(ChangeDetail {
                    breaking: true,
                    message: format!(
                        "{} '{}' type changed from {} to {}",
                        kind,
                        old_param.name,
                        old_param.type_expr.pretty(),
                        new_param.type_expr.pretty()
                    ),
                })
            }
            Some(_) => {}
        }
    }
    for new_param in new {
        if find_param(old, &new_param.name).is_none() {
            details.push(ChangeDetail {
                breaking: !new_param.optional,
                message: format!(
                    "{} '{}' added{}",
                    kind,
                    new_param.name,
                    if new_param.optional { " (optional)" } else { " as required" }
                ),
            });
        }
    }
}

/// Compare two versions of the same function per spec §4.6: parameter
/// removal/type-change/required-addition, effect addition/removal, security
/// tightening/loosening, and purity loss.
pub fn analyze_function_change(old: &FunctionDef, new: &FunctionDef) -> FunctionChangeReport {
    let mut details = Vec::new();

    diff_params(&old.inputs, &new.inputs, "input", &mut details);
    diff_params(&old.outputs, &new.outputs, "output", &mut details);

    for effect in &new.effects {
        if !old.effects.contains(effect) {
            details.push(ChangeDetail {
                breaking: true,
                message: format!("effect '{}.{}' added", effect.effect_type, effect.target),
            });
        }
    }
    for effect in &old.effects {
        if !new.effects.contains(effect) {
            details.push(ChangeDetail {
                breaking: false,
                message: format!("effect '{}.{}' removed", effect.effect_type, effect.target),
            });
        }
    }

    for role in &new.required_roles {
        if !old.required_roles.contains(role) {
            details.push(ChangeDetail {
                breaking: true,
                message: format!("required role '{}' added", role),
            });
        }
    }
    for role in &old.required_roles {
        if !new.required_roles.contains(role) {
            details.push(ChangeDetail {
                breaking: false,
                message: format!("required role '{}' removed", role),
            });
        }
    }
    for perm in &new.required_permissions {
        if !old.required_permissions.contains(perm) {
            details.push(ChangeDetail {
                breaking: true,
                message: format!("required permission '{}' added", perm),
            });
        }
    }
    for perm in &old.required_permissions {
        if !new.required_permissions.contains(perm) {
            details.push(ChangeDetail {
                breaking: false,
                message: format!("required permission '{}' removed", perm),
            });
        }
    }

    if !old.audit_required && new.audit_required {
        details.push(ChangeDetail {
            breaking: false,
            message: "audit_required enabled".to_string(),
        });
    }

    if old.pure && !new.pure {
        details.push(ChangeDetail {
            breaking: true,
            message: "function is no longer pure".to_string(),
        });
    }

    let compatibility = if details.is_empty() {
        Compatibility::FullyCompatible
    } else if details.iter().any(|d| d.breaking) {
        Compatibility::Breaking
    } else {
        Compatibility::BackwardCompatible
    };

    FunctionChangeReport { compatibility, details }
}

/// Convenience wrapper for callers that only need the classification.
pub fn analyze_function_compatibility(old: &FunctionDef, new: &FunctionDef) -> Compatibility {
    analyze_function_change(old, new).compatibility
}

fn find_field<'a>(fields: &'a [FieldDef], name: &str) -> Option<&'a FieldDef> {
    fields.iter().find(|f| f.name == name)
}

/// Overall classification plus the itemized changes that produced it, mirroring
/// `FunctionChangeReport` for type declarations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeChangeReport {
    pub compatibility: Compatibility,
    pub details: Vec<ChangeDetail>,
}

/// Compare two versions of the same type per spec §4.6: field removal,
/// field type changes, required-field addition, and classification changes
/// (in either direction — both an increase and a decrease are warnings).
pub fn analyze_type_change(old: &TypeDef, new: &TypeDef) -> TypeChangeReport {
    let mut details = Vec::new();

    for old_field in &old.fields {
        match find_field(&new.fields, &old_field.name) {
            None => details.push(ChangeDetail {
                breaking: true,
                message: format!("field '{}' removed", old_field.name),
            }),
            Some(new_field) => {
                if new_field.type_expr.pretty() != old_field.type_expr.pretty() {
                    details.push(ChangeDetail {
                        breaking: true,
                        message: format!(
                            "field '{}' type changed from {} to {}",
                            old_field.name,
                            old_field.type_expr.pretty(),
                            new_field.type_expr.pretty()
                        ),
                    });
                }
                if new_field.classification != old_field.classification {
                    let increased = new_field.classification > old_field.classification;
                    details.push(ChangeDetail {
                        breaking: false,
                        message: format!(
                            "field '{}' classification changed from {:?} to {:?} ({})",
                            old_field.name,
                            old_field.classification,
                            new_field.classification,
                            if increased { "increase" } else { "decrease" }
                        ),
                    });
                }
            }
        }
    }
    for new_field in &new.fields {
        if find_field(&old.fields, &new_field.name).is_none() {
            details.push(ChangeDetail {
                breaking: false,
                message: format!("field '{}' added", new_field.name),
            });
        }
    }

    let compatibility = if details.is_empty() {
        Compatibility::FullyCompatible
    } else if details.iter().any(|d| d.breaking) {
        Compatibility::Breaking
    } else {
        Compatibility::BackwardCompatible
    };

    TypeChangeReport { compatibility, details }
}

/// Convenience wrapper for callers that only need the classification.
pub fn analyze_type_compatibility(old: &TypeDef, new: &TypeDef) -> Compatibility {
    analyze_type_change(old, new).compatibility
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{PrimitiveType, TypeExpr, VersionInfo};
    use crate::version::Version;

    fn param(name: &str, type_expr: TypeExpr, optional: bool) -> Param {
        Param {
            name: name.to_string(),
            type_expr,
            optional,
        }
    }

    fn function_with(inputs: Vec<Param>, outputs: Vec<Param>) -> FunctionDef {
        FunctionDef {
            name: "f".to_string(),
            version: VersionInfo::new(Version::new(1, 0, 0)),
            pure: true,
            idempotent: true,
            required_roles: Vec::new(),
            required_permissions: Vec::new(),
            effects: Vec::new(),
            handles_secrets: false,
            audit_required: false,
            inputs,
            outputs,
            body: Vec::new(),
            span: Default::default(),
        }
    }

    #[test]
    fn identical_signatures_are_fully_compatible() {
        let a = function_with(
            vec![param("x", TypeExpr::Primitive(PrimitiveType::Int), false)],
            vec![param("r", TypeExpr::Primitive(PrimitiveType::Int), false)],
        );
        let b = a.clone();
        assert_eq!(analyze_function_compatibility(&a, &b), Compatibility::FullyCompatible);
    }

    #[test]
    fn adding_optional_input_is_backward_compatible() {
        let old = function_with(
            vec![param("x", TypeExpr::Primitive(PrimitiveType::Int), false)],
            vec![],
        );
        let new = function_with(
            vec![
                param("x", TypeExpr::Primitive(PrimitiveType::Int), false),
                param("y", TypeExpr::Primitive(PrimitiveType::Int), true),
            ],
            vec![],
        );
        assert_eq!(
            analyze_function_compatibility(&old, &new),
            Compatibility::BackwardCompatible
        );
    }

    #[test]
    fn adding_required_input_is_breaking() {
        let old = function_with(vec![], vec![]);
        let new = function_with(
            vec![param("y", TypeExpr::Primitive(PrimitiveType::Int), false)],
            vec![],
        );
        assert_eq!(analyze_function_compatibility(&old, &new), Compatibility::Breaking);
    }

    #[test]
    fn changing_input_type_is_breaking() {
        let old = function_with(
            vec![param("x", TypeExpr::Primitive(PrimitiveType::Int), false)],
            vec![],
        );
        let new = function_with(
            vec![param("x", TypeExpr::Primitive(PrimitiveType::String), false)],
            vec![],
        );
        assert_eq!(analyze_function_compatibility(&old, &new), Compatibility::Breaking);
    }

    #[test]
    fn adding_required_role_is_breaking() {
        let mut old = function_with(vec![], vec![]);
        old.required_roles = vec!["user".to_string()];
        let mut new = old.clone();
        new.required_roles = vec!["user".to_string(), "admin".to_string()];
        assert_eq!(analyze_function_compatibility(&old, &new), Compatibility::Breaking);
    }

    #[test]
    fn type_adding_field_is_backward_compatible() {
        let old = TypeDef {
            name: "account".to_string(),
            version: VersionInfo::new(Version::new(1, 0, 0)),
            fields: vec![FieldDef {
                name: "id".to_string(),
                type_expr: TypeExpr::Primitive(PrimitiveType::Uuid),
                classification: None,
            }],
            span: Default::default(),
        };
        let mut new = old.clone();
        new.fields.push(FieldDef {
            name: "email".to_string(),
            type_expr: TypeExpr::Primitive(PrimitiveType::String),
            classification: None,
        });
        assert_eq!(analyze_type_compatibility(&old, &new), Compatibility::BackwardCompatible);
    }

    #[test]
    fn type_classification_increase_is_a_non_breaking_itemized_warning() {
        let old = TypeDef {
            name: "account".to_string(),
            version: VersionInfo::new(Version::new(1, 0, 0)),
            fields: vec![FieldDef {
                name: "ssn".to_string(),
                type_expr: TypeExpr::Primitive(PrimitiveType::String),
                classification: Some(crate::ast::Classification::Public),
            }],
            span: Default::default(),
        };
        let mut new = old.clone();
        new.fields[0].classification = Some(crate::ast::Classification::Restricted);

        let report = analyze_type_change(&old, &new);
        assert_eq!(report.compatibility, Compatibility::BackwardCompatible);
        assert!(report.details.iter().any(|d| d.message.contains("increase")));
    }

    #[test]
    fn type_classification_decrease_is_itemized() {
        let old = TypeDef {
            name: "account".to_string(),
            version: VersionInfo::new(Version::new(1, 0, 0)),
            fields: vec![FieldDef {
                name: "ssn".to_string(),
                type_expr: TypeExpr::Primitive(PrimitiveType::String),
                classification: Some(crate::ast::Classification::Restricted),
            }],
            span: Default::default(),
        };
        let mut new = old.clone();
        new.fields[0].classification = Some(crate::ast::Classification::Public);

        let report = analyze_type_change(&old, &new);
        assert!(report.details.iter().any(|d| d.message.contains("decrease")));
    }

    #[test]
    fn type_removing_field_is_breaking() {
        let old = TypeDef {
            name: "account".to_string(),
            version: VersionInfo::new(Version::new(1, 0, 0)),
            fields: vec![
                FieldDef {
                    name: "id".to_string(),
                    type_expr: TypeExpr::Primitive(PrimitiveType::Uuid),
                    classification: None,
                },
                FieldDef {
                    name: "email".to_string(),
                    type_expr: TypeExpr::Primitive(PrimitiveType::String),
                    classification: None,
                },
            ],
            span: Default::default(),
        };
        let mut new = old.clone();
        new.fields.pop();
        assert_eq!(analyze_type_compatibility(&old, &new), Compatibility::Breaking);
    }
}
