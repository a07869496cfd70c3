//! The bytecode the compiler emits and the VM executes.
//!
//! One instruction wraps one opcode plus an optional span for error
//! reporting; a function record is one compiled function body; a module
//! record is the VM's unit of loading, keyed `"{name}:{version}"`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ast::{Classification, EffectDecl, TypeDef};
use crate::diagnostics::Span;
use crate::security::context::SecurityContext;
use crate::value::Value;
use crate::version::Version;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    Push(Value),
    Pop,
    Dup,
    Swap,
    LoadVar(String),
    /// Keeps the stored value on the stack; see §9's note on `Let` lowering.
    StoreVar(String),
    LoadArg(usize),

    Call {
        name: String,
        version: Option<Version>,
        arity: usize,
    },
    CallNative {
        name: String,
        arity: usize,
    },
    Return,
    Jump(usize),
    JumpIfFalse(usize),
    JumpIfTrue(usize),
    Halt,

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    And,
    Or,
    Not,

    ExecEffect {
        handler: String,
        operation: String,
        param_count: usize,
        audit_required: bool,
        resource: Option<String>,
    },

    MakeOk,
    MakeErr,
    MakeSome,
    MakeNone,
    MakeList(usize),
    MakeMap(usize),
    ConstructRecord {
        type_name: String,
        field_count: usize,
    },
    AccessField(String),
    ConstructVariant {
        type_name: String,
        case: String,
    },
    MatchVariant {
        type_name: String,
        case: String,
    },

    ListGet,
    ListLen,
    ListSet,
    ListAppend,
    MapGet,
    MapSet,
    MapHas,

    StrConcat,
    StrLen,

    DebugPrint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub span: Option<Span>,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Self { opcode, span: None }
    }

    pub fn with_span(opcode: Opcode, span: Span) -> Self {
        Self {
            opcode,
            span: Some(span),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub name: String,
    pub version: Version,
    pub arity: usize,
    pub instructions: Vec<Instruction>,
    pub required_roles: Vec<String>,
    pub effects: Vec<EffectDecl>,
    pub pure: bool,
    pub idempotent: bool,
    pub local_count: usize,
}

impl FunctionRecord {
    /// The VM's lookup key for this record inside a `ModuleRecord`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeTableEntry {
    pub name: String,
    pub version: Version,
    pub field_names: Vec<String>,
    /// Ordinal-max over the type's field classifications, stamped onto a
    /// `Value::Record` of this type at construction time.
    pub max_classification: Option<Classification>,
}

impl TypeTableEntry {
    pub fn from_type_def(t: &TypeDef) -> Self {
        Self {
            name: t.name.clone(),
            version: t.version.version.clone(),
            field_names: t.fields.iter().map(|f| f.name.clone()).collect(),
            max_classification: t.max_classification(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub name: String,
    pub version: String,
    pub constant_pool: Vec<Value>,
    pub functions: HashMap<String, FunctionRecord>,
    pub type_table: HashMap<String, TypeTableEntry>,
    pub security_primitives: SecurityContext,
}

impl ModuleRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            constant_pool: Vec::new(),
            functions: HashMap::new(),
            type_table: HashMap::new(),
            security_primitives: SecurityContext::new(),
        }
    }

    pub fn insert_function(&mut self, record: FunctionRecord) {
        self.functions.insert(record.key(), record);
    }

    /// Populates the type table from a declared type, so the VM can look up
    /// a record's classification at construction time by name.
    pub fn register_type(&mut self, t: &TypeDef) {
        self.type_table
            .insert(t.name.clone(), TypeTableEntry::from_type_def(t));
    }

    pub fn function(&self, key: &str) -> Option<&FunctionRecord> {
        self.functions.get(key)
    }

    /// Every registered version of `name`, for `CALL`'s latest-wins
    /// resolution when no version is given.
    pub fn versions_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FunctionRecord> {
        self.functions
            .values()
            .filter(move |f| f.name == name)
    }
}
