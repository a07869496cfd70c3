//! Lowers a `FunctionDef`'s body into a `FunctionRecord`'s instruction
//! stream.
//!
//! Labels are resolved in two passes: emission pushes placeholder jump
//! targets and records which instruction index needs patching once the
//! label's final position is known, then `finish` walks the patch list and
//! writes the absolute offsets in. This mirrors `new_label`/`place_label`/
//! `emit_jump` from the forth engine's label handling, generalized from a
//! single loop-back label to arbitrarily many forward and backward jumps.

use std::collections::HashMap;

use thiserror::Error;

use crate::ast::{BinaryOperator, Expr, FunctionDef, Literal, MatchCase, Pattern, UnaryOperator};
use crate::bytecode::{FunctionRecord, Instruction, Opcode};
use crate::value::Value;

const EFFECT_PREFIXES: &[&str] = &["db", "http", "fs", "log", "event"];

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("function '{0}' body contains a lambda, which is unsupported")]
    LambdaUnsupported(String),
    #[error("internal compiler error: {0}")]
    Internal(String),
}

/// A forward reference to an as-yet-unplaced label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LabelId(usize);

enum PatchKind {
    Jump,
    JumpIfFalse,
    JumpIfTrue,
}

struct Patch {
    instruction_index: usize,
    label: LabelId,
    kind: PatchKind,
}

struct FunctionBuilder {
    instructions: Vec<Instruction>,
    locals: HashMap<String, usize>,
    next_label: usize,
    label_positions: HashMap<LabelId, usize>,
    patches: Vec<Patch>,
    arity: usize,
    /// The enclosing function's own `:audit_required` flag, stamped onto
    /// every `ExecEffect` opcode this function compiles to.
    audit_required: bool,
}

impl FunctionBuilder {
    fn new(arity: usize, locals: HashMap<String, usize>, audit_required: bool) -> Self {
        Self {
            instructions: Vec::new(),
            locals,
            next_label: 0,
            label_positions: HashMap::new(),
            patches: Vec::new(),
            arity,
            audit_required,
        }
    }

    fn emit(&mut self, opcode: Opcode) -> usize {
        let index = self.instructions.len();
        self.instructions.push(Instruction::new(opcode));
        index
    }

    fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    /// Record the label as pointing at the *next* instruction to be emitted.
    fn place_label(&mut self, label: LabelId) {
        self.label_positions.insert(label, self.instructions.len());
    }

    /// Emit a placeholder jump targeting `label`, patched to an absolute
    /// offset once every label in the function has been placed.
    fn emit_jump(&mut self, kind: PatchKind, label: LabelId) {
        let placeholder = match kind {
            PatchKind::Jump => Opcode::Jump(usize::MAX),
            PatchKind::JumpIfFalse => Opcode::JumpIfFalse(usize::MAX),
            PatchKind::JumpIfTrue => Opcode::JumpIfTrue(usize::MAX),
        };
        let index = self.emit(placeholder);
        self.patches.push(Patch {
            instruction_index: index,
            label,
            kind,
        });
    }

    fn finish(mut self) -> Result<Vec<Instruction>, CompileError> {
        for patch in &self.patches {
            let target = *self.label_positions.get(&patch.label).ok_or_else(|| {
                CompileError::Internal(format!("label {:?} was never placed", patch.label.0))
            })?;
            let opcode = match patch.kind {
                PatchKind::Jump => Opcode::Jump(target),
                PatchKind::JumpIfFalse => Opcode::JumpIfFalse(target),
                PatchKind::JumpIfTrue => Opcode::JumpIfTrue(target),
            };
            self.instructions[patch.instruction_index].opcode = opcode;
        }
        Ok(self.instructions)
    }
}

/// Compile a single function definition into its bytecode record.
pub fn compile_function(f: &FunctionDef) -> Result<FunctionRecord, CompileError> {
    let mut locals = HashMap::new();
    for (slot, param) in f.inputs.iter().enumerate() {
        locals.insert(param.name.clone(), slot);
    }
    let arity = f.inputs.len();

    let mut builder = FunctionBuilder::new(arity, locals, f.audit_required);
    compile_block(&f.body, &mut builder)?;
    builder.emit(Opcode::Return);
    let instructions = builder.finish()?;

    Ok(FunctionRecord {
        name: f.name.clone(),
        version: f.version.version.clone(),
        arity,
        instructions,
        required_roles: f.required_roles.clone(),
        effects: f.effects.clone(),
        pure: f.pure,
        idempotent: f.idempotent,
        local_count: locals_count(&f.body),
    })
}

/// Count of distinct `Let`-bound names across the body, used to size the
/// frame's local slots for a VM that wants to preallocate.
fn locals_count(body: &[Expr]) -> usize {
    fn walk(expr: &Expr, names: &mut std::collections::HashSet<String>) {
        match expr {
            Expr::Let { bindings, body } => {
                for (name, value) in bindings {
                    names.insert(name.clone());
                    walk(value, names);
                }
                for e in body {
                    walk(e, names);
                }
            }
            Expr::If {
                cond,
                then_branch,
                else_branch,
            } => {
                walk(cond, names);
                walk(then_branch, names);
                walk(else_branch, names);
            }
            Expr::Cond { clauses, default } => {
                for (cond, body) in clauses {
                    walk(cond, names);
                    walk(body, names);
                }
                if let Some(d) = default {
                    walk(d, names);
                }
            }
            Expr::Match { scrutinee, cases } => {
                walk(scrutinee, names);
                for case in cases {
                    walk(&case.body, names);
                }
            }
            Expr::Do(exprs) => exprs.iter().for_each(|e| walk(e, names)),
            Expr::Call { args, .. } => args.iter().for_each(|e| walk(e, names)),
            Expr::BinaryOp { lhs, rhs, .. } => {
                walk(lhs, names);
                walk(rhs, names);
            }
            Expr::UnaryOp { expr, .. } => walk(expr, names),
            _ => {}
        }
    }
    let mut names = std::collections::HashSet::new();
    body.iter().for_each(|e| walk(e, &mut names));
    names.len()
}

fn compile_block(body: &[Expr], builder: &mut FunctionBuilder) -> Result<(), CompileError> {
    if body.is_empty() {
        builder.emit(Opcode::Push(Value::Unit));
        return Ok(());
    }
    for (i, expr) in body.iter().enumerate() {
        compile_expr(expr, builder)?;
        if i + 1 < body.len() {
            builder.emit(Opcode::Pop);
        }
    }
    Ok(())
}

fn compile_expr(expr: &Expr, builder: &mut FunctionBuilder) -> Result<(), CompileError> {
    match expr {
        Expr::Literal(lit) => compile_literal(lit, builder),
        Expr::Identifier(name) => {
            if let Some(&slot) = builder.locals.get(name) {
                if slot < builder.arity {
                    builder.emit(Opcode::LoadArg(slot));
                    return Ok(());
                }
            }
            builder.emit(Opcode::LoadVar(name.clone()));
            Ok(())
        }
        Expr::QualifiedName { parts, .. } => {
            builder.emit(Opcode::LoadVar(parts.join(".")));
            Ok(())
        }
        Expr::Let { bindings, body } => {
            for (name, value) in bindings {
                compile_expr(value, builder)?;
                builder.emit(Opcode::StoreVar(name.clone()));
            }
            compile_block(body, builder)
        }
        Expr::If {
            cond,
            then_branch,
            else_branch,
        } => {
            let else_label = builder.new_label();
            let end_label = builder.new_label();
            compile_expr(cond, builder)?;
            builder.emit_jump(PatchKind::JumpIfFalse, else_label);
            compile_expr(then_branch, builder)?;
            builder.emit_jump(PatchKind::Jump, end_label);
            builder.place_label(else_label);
            compile_expr(else_branch, builder)?;
            builder.place_label(end_label);
            Ok(())
        }
        Expr::Cond { clauses, default } => {
            let end_label = builder.new_label();
            for (cond, body) in clauses {
                let next_label = builder.new_label();
                compile_expr(cond, builder)?;
                builder.emit_jump(PatchKind::JumpIfFalse, next_label);
                compile_expr(body, builder)?;
                builder.emit_jump(PatchKind::Jump, end_label);
                builder.place_label(next_label);
            }
            match default {
                Some(d) => compile_expr(d, builder)?,
                None => {
                    builder.emit(Opcode::Push(Value::Unit));
                }
            }
            builder.place_label(end_label);
            Ok(())
        }
        Expr::Match { scrutinee, cases } => compile_match(scrutinee, cases, builder),
        Expr::Do(exprs) => compile_block(exprs, builder),
        Expr::Lambda => Err(CompileError::LambdaUnsupported("<anonymous>".to_string())),
        Expr::BinaryOp { op, lhs, rhs } => {
            compile_expr(lhs, builder)?;
            compile_expr(rhs, builder)?;
            builder.emit(binary_opcode(*op));
            Ok(())
        }
        Expr::UnaryOp { op, expr } => {
            compile_expr(expr, builder)?;
            builder.emit(match op {
                UnaryOperator::Neg => Opcode::Neg,
                UnaryOperator::Not => Opcode::Not,
            });
            Ok(())
        }
        Expr::Call { target, version, args } => compile_call(target, version.clone(), args, builder),
    }
}

fn compile_literal(lit: &Literal, builder: &mut FunctionBuilder) -> Result<(), CompileError> {
    let value = match lit {
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::Str(s) => Value::Str(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
    };
    builder.emit(Opcode::Push(value));
    Ok(())
}

fn binary_opcode(op: BinaryOperator) -> Opcode {
    match op {
        BinaryOperator::Add => Opcode::Add,
        BinaryOperator::Sub => Opcode::Sub,
        BinaryOperator::Mul => Opcode::Mul,
        BinaryOperator::Div => Opcode::Div,
        BinaryOperator::Mod => Opcode::Mod,
        BinaryOperator::Eq => Opcode::Eq,
        BinaryOperator::Ne => Opcode::Ne,
        BinaryOperator::Lt => Opcode::Lt,
        BinaryOperator::Le => Opcode::Le,
        BinaryOperator::Gt => Opcode::Gt,
        BinaryOperator::Ge => Opcode::Ge,
        BinaryOperator::And => Opcode::And,
        BinaryOperator::Or => Opcode::Or,
    }
}

fn compile_match(scrutinee: &Expr, cases: &[MatchCase], builder: &mut FunctionBuilder) -> Result<(), CompileError> {
    compile_expr(scrutinee, builder)?;
    let end_label = builder.new_label();
    let last_index = cases.len().saturating_sub(1);

    for (i, case) in cases.iter().enumerate() {
        let is_last = i == last_index;
        if !is_last {
            builder.emit(Opcode::Dup);
        }
        let next_label = builder.new_label();
        match &case.pattern {
            Pattern::Literal(lit) => {
                compile_literal(lit, builder)?;
                builder.emit(Opcode::Eq);
            }
            Pattern::Constructor { type_name, case: c } => {
                builder.emit(Opcode::MatchVariant {
                    type_name: type_name.clone(),
                    case: c.clone(),
                });
            }
            Pattern::Wildcard | Pattern::Binding(_) => {
                builder.emit(Opcode::Pop);
                builder.emit(Opcode::Push(Value::Bool(true)));
            }
        }
        builder.emit_jump(PatchKind::JumpIfFalse, next_label);
        compile_expr(&case.body, builder)?;
        builder.emit_jump(PatchKind::Jump, end_label);
        builder.place_label(next_label);
    }

    builder.emit(Opcode::Push(Value::Str("no match arm matched scrutinee".to_string())));
    builder.emit(Opcode::Halt);
    builder.place_label(end_label);
    Ok(())
}

fn compile_call(
    target: &crate::ast::CallTarget,
    version: Option<crate::version::Version>,
    args: &[Expr],
    builder: &mut FunctionBuilder,
) -> Result<(), CompileError> {
    for arg in args {
        compile_expr(arg, builder)?;
    }
    let joined = target.joined();
    let is_effect = joined
        .split('.')
        .next()
        .map(|prefix| EFFECT_PREFIXES.contains(&prefix))
        .unwrap_or(false);

    if is_effect {
        let mut parts = joined.splitn(2, '.');
        let handler = parts.next().unwrap_or_default().to_string();
        let operation = parts.next().unwrap_or_default().to_string();
        builder.emit(Opcode::ExecEffect {
            handler,
            operation,
            param_count: args.len(),
            audit_required: builder.audit_required,
            resource: None,
        });
    } else if target.is_qualified() {
        builder.emit(Opcode::CallNative {
            name: joined,
            arity: args.len(),
        });
    } else {
        builder.emit(Opcode::Call {
            name: joined,
            version,
            arity: args.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::VersionInfo;
    use crate::parser::parse_module;
    use crate::version::Version;

    fn compile_source(source: &str) -> FunctionRecord {
        let module = parse_module(source).unwrap();
        let f = module.functions().next().unwrap();
        compile_function(f).unwrap()
    }

    #[test]
    fn literal_body_emits_push_then_return() {
        let record = compile_source("(mod m (fn f :v1 :inputs [] :outputs [] (body 42)))");
        assert!(matches!(record.instructions[0].opcode, Opcode::Push(Value::Int(42))));
        assert!(matches!(record.instructions.last().unwrap().opcode, Opcode::Return));
    }

    #[test]
    fn argument_reads_via_load_arg() {
        let record = compile_source(
            "(mod m (fn add :v1 :inputs [(a :int) (b :int)] :outputs [] (body (+ a b))))",
        );
        assert!(record
            .instructions
            .iter()
            .any(|i| matches!(i.opcode, Opcode::LoadArg(0))));
        assert!(record
            .instructions
            .iter()
            .any(|i| matches!(i.opcode, Opcode::LoadArg(1))));
        assert!(record.instructions.iter().any(|i| matches!(i.opcode, Opcode::Add)));
    }

    #[test]
    fn if_expression_patches_jump_targets() {
        let record = compile_source(
            "(mod m (fn check :v1 :inputs [(x :int)] :outputs [] (body (if (> x 10) \"big\" \"small\"))))",
        );
        let jumps: Vec<_> = record
            .instructions
            .iter()
            .enumerate()
            .filter_map(|(i, instr)| match &instr.opcode {
                Opcode::Jump(target) => Some((i, *target)),
                Opcode::JumpIfFalse(target) => Some((i, *target)),
                _ => None,
            })
            .collect();
        assert!(!jumps.is_empty());
        for (index, target) in jumps {
            assert!(target <= record.instructions.len());
            assert_ne!(target, usize::MAX, "patch at {} was never resolved", index);
        }
    }

    #[test]
    fn let_binding_stores_without_popping() {
        let record = compile_source("(mod m (fn f :v1 :inputs [] :outputs [] (body (let ((x 1)) x))))");
        let store_index = record
            .instructions
            .iter()
            .position(|i| matches!(i.opcode, Opcode::StoreVar(ref n) if n == "x"))
            .unwrap();
        assert!(!matches!(record.instructions[store_index + 1].opcode, Opcode::Pop));
    }

    #[test]
    fn lambda_body_is_rejected() {
        let f = crate::ast::FunctionDef {
            name: "f".to_string(),
            version: VersionInfo::new(Version::new(1, 0, 0)),
            pure: true,
            idempotent: true,
            required_roles: Vec::new(),
            required_permissions: Vec::new(),
            effects: Vec::new(),
            handles_secrets: false,
            audit_required: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            body: vec![Expr::Lambda],
            span: Default::default(),
        };
        assert!(compile_function(&f).is_err());
    }

    #[test]
    fn effect_call_compiles_to_exec_effect() {
        let record = compile_source(
            "(mod m (fn f :v1 :inputs [] :outputs [] (body (db.read \"users\"))))",
        );
        assert!(record.instructions.iter().any(|i| matches!(
            &i.opcode,
            Opcode::ExecEffect { handler, operation, .. } if handler == "db" && operation == "read"
        )));
    }

    #[test]
    fn dotted_non_effect_call_compiles_to_call_native() {
        let record = compile_source(
            "(mod m (fn f :v1 :inputs [] :outputs [] (body (str.uppercase \"hi\"))))",
        );
        assert!(record
            .instructions
            .iter()
            .any(|i| matches!(&i.opcode, Opcode::CallNative { name, .. } if name == "str.uppercase")));
    }
}
