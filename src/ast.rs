//! Abstract syntax tree produced by the parser.
//!
//! Module elements are `Function`, `TypeDef`, `Role`, `Permission`, `Policy`.
//! `Channel`, `Contract`, `Import`, `Export` are reserved variants: the
//! parser never currently produces them (no grammar rule yields that
//! keyword), they exist so a future grammar extension doesn't need to touch
//! every `match` over `ModuleElement` in the crate.

use serde::{Deserialize, Serialize};

use crate::diagnostics::Span;
use crate::version::Version;

/// Stability marker on a versioned entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stability {
    Stable,
    Beta,
    Alpha,
    Deprecated,
}

impl Stability {
    pub fn from_keyword(s: &str) -> Option<Stability> {
        match s {
            "stable" => Some(Stability::Stable),
            "beta" => Some(Stability::Beta),
            "alpha" => Some(Stability::Alpha),
            "deprecated" => Some(Stability::Deprecated),
            _ => None,
        }
    }

    pub fn is_unstable(self) -> bool {
        matches!(self, Stability::Alpha | Stability::Beta)
    }
}

impl Default for Stability {
    fn default() -> Self {
        Stability::Stable
    }
}

/// Per-entity version metadata carried by every function and type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: Version,
    pub stability: Stability,
    pub replaces: Option<Version>,
    pub rollback_safe: Option<bool>,
    pub deprecated: Option<bool>,
}

impl VersionInfo {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            stability: Stability::Stable,
            replaces: None,
            rollback_safe: None,
            deprecated: None,
        }
    }
}

/// A dotted scope entry on a permission: `resource: users` or `action: read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeEntry {
    pub is_action: bool,
    pub value: String,
}

/// Data classification, ascending restrictiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Classification {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl Classification {
    pub fn from_keyword(s: &str) -> Option<Classification> {
        match s {
            "public" => Some(Classification::Public),
            "internal" => Some(Classification::Internal),
            "confidential" => Some(Classification::Confidential),
            "restricted" => Some(Classification::Restricted),
            _ => None,
        }
    }
}

/// A declared effect on a function: `(db read users_table)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectDecl {
    pub effect_type: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub type_expr: TypeExpr,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimitiveType {
    Int,
    Float,
    String,
    Bool,
    Uuid,
    Timestamp,
    Bytes,
    Json,
    Unit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenericKind {
    List,
    Map,
    Option,
    Result,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeExpr {
    Primitive(PrimitiveType),
    Generic {
        kind: GenericKind,
        args: Vec<TypeExpr>,
    },
    Named(String),
}

impl TypeExpr {
    /// Pretty-printed form used for string-comparison type equality in the
    /// compatibility analyzer (spec mandates comparing by printed form, not
    /// structural equality, so a renamed-but-isomorphic type still counts as
    /// a change).
    pub fn pretty(&self) -> String {
        match self {
            TypeExpr::Primitive(p) => format!("{:?}", p).to_lowercase(),
            TypeExpr::Generic { kind, args } => {
                let name = match kind {
                    GenericKind::List => "List",
                    GenericKind::Map => "Map",
                    GenericKind::Option => "Option",
                    GenericKind::Result => "Result",
                };
                let inner: Vec<String> = args.iter().map(TypeExpr::pretty).collect();
                format!("{}<{}>", name, inner.join(", "))
            }
            TypeExpr::Named(name) => name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub type_expr: TypeExpr,
    pub classification: Option<Classification>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub version: VersionInfo,
    pub fields: Vec<FieldDef>,
    pub span: Span,
}

impl TypeDef {
    /// Ordinal-max over the type's field classifications.
    pub fn max_classification(&self) -> Option<Classification> {
        self.fields.iter().filter_map(|f| f.classification).max()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub version: VersionInfo,
    pub pure: bool,
    pub idempotent: bool,
    pub required_roles: Vec<String>,
    pub required_permissions: Vec<String>,
    pub effects: Vec<EffectDecl>,
    pub handles_secrets: bool,
    pub audit_required: bool,
    pub inputs: Vec<Param>,
    pub outputs: Vec<Param>,
    pub body: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDef {
    pub name: String,
    pub permissions: Vec<String>,
    pub parents: Vec<String>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDef {
    pub name: String,
    pub doc: Option<String>,
    pub scope: Vec<ScopeEntry>,
    pub classification: Option<Classification>,
    pub audit_required: bool,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleEffect {
    Allow,
    Deny,
}

/// A policy rule's version constraint, in source form (kept distinct from
/// `ConstraintKind` because `specific` names a whole list of versions rather
/// than one bound).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleVersionConstraint {
    AllVersions,
    StableOnly,
    Specific(Vec<Version>),
    Range(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub effect: RuleEffect,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub version_constraint: RuleVersionConstraint,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDef {
    pub name: String,
    pub rules: Vec<PolicyRule>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModuleElement {
    Function(FunctionDef),
    TypeDef(TypeDef),
    Role(RoleDef),
    Permission(PermissionDef),
    Policy(PolicyDef),
    /// Reserved, not yet parsed by any grammar rule.
    Channel,
    Contract,
    Import,
    Export,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub elements: Vec<ModuleElement>,
}

impl Module {
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.elements.iter().filter_map(|e| match e {
            ModuleElement::Function(f) => Some(f),
            _ => None,
        })
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.elements.iter().filter_map(|e| match e {
            ModuleElement::TypeDef(t) => Some(t),
            _ => None,
        })
    }

    pub fn roles(&self) -> impl Iterator<Item = &RoleDef> {
        self.elements.iter().filter_map(|e| match e {
            ModuleElement::Role(r) => Some(r),
            _ => None,
        })
    }

    pub fn permissions(&self) -> impl Iterator<Item = &PermissionDef> {
        self.elements.iter().filter_map(|e| match e {
            ModuleElement::Permission(p) => Some(p),
            _ => None,
        })
    }

    pub fn policies(&self) -> impl Iterator<Item = &PolicyDef> {
        self.elements.iter().filter_map(|e| match e {
            ModuleElement::Policy(p) => Some(p),
            _ => None,
        })
    }
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallTarget {
    Name(String),
    /// Dot-joined qualified name, e.g. `str.uppercase` or `db.read`.
    Qualified(Vec<String>),
}

impl CallTarget {
    pub fn joined(&self) -> String {
        match self {
            CallTarget::Name(n) => n.clone(),
            CallTarget::Qualified(parts) => parts.join("."),
        }
    }

    pub fn is_qualified(&self) -> bool {
        matches!(self, CallTarget::Qualified(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pattern {
    Literal(Literal),
    Constructor { type_name: String, case: String },
    Wildcard,
    Binding(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCase {
    pub pattern: Pattern,
    pub body: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Literal),
    Identifier(String),
    QualifiedName {
        parts: Vec<String>,
        version: Option<Version>,
    },
    Call {
        target: CallTarget,
        version: Option<Version>,
        args: Vec<Expr>,
    },
    Let {
        bindings: Vec<(String, Expr)>,
        body: Vec<Expr>,
    },
    If {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    Cond {
        clauses: Vec<(Expr, Expr)>,
        default: Option<Box<Expr>>,
    },
    Match {
        scrutinee: Box<Expr>,
        cases: Vec<MatchCase>,
    },
    Do(Vec<Expr>),
    /// Reserved: the compiler rejects any function body containing this.
    Lambda,
    BinaryOp {
        op: BinaryOperator,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Expr>,
    },
}
