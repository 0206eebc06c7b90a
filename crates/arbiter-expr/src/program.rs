//! Compilation of expression ASTs into a closed opcode set.
//!
//! The instruction list is executed by the stack VM in `vm`. The opcode set
//! is deliberately closed and documented: determinism of decisions depends
//! on every operation having exactly one meaning.
//!
//! `variables.<name>` references are resolved here into slot indices — the
//! per-request memo table is a fixed-size array sized at policy-compile
//! time, so evaluation never touches a hash map.

use std::collections::BTreeMap;

use arbiter_contracts::error::{ArbiterError, ArbiterResult};
use arbiter_contracts::value::Value;

use crate::parser::{parse, BinOp, Expr, UnaryOp};

/// Names bound by the engine that user variables must not shadow.
pub use arbiter_contracts::policy::RESERVED_VARIABLE_NAMES as RESERVED_NAMES;

/// Built-in functions callable from conditions.
///
/// `has` is absent: it is a special form compiled to [`Opcode::TestMember`],
/// because its argument must be probed, not evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `size(x)` — length of a string (in characters), list, or map.
    Size,
    /// `s.startsWith(prefix)`
    StartsWith,
    /// `s.endsWith(suffix)`
    EndsWith,
    /// `s.contains(substring)`
    Contains,
    /// `s.matches(regex)` — RE2-style regular expression match.
    Matches,
    /// `timestamp(rfc3339)` — parse a timestamp literal.
    Timestamp,
    /// `duration(text)` — parse a duration like `"36h"` or `"1h30m"`.
    Duration,
    /// `now()` — the request-start timestamp, bound once per request.
    Now,
}

impl Builtin {
    /// Resolve a function name and argument count (receiver included for
    /// methods) to a builtin.
    pub(crate) fn resolve(name: &str, argc: usize) -> Option<Builtin> {
        match (name, argc) {
            ("size", 1) => Some(Builtin::Size),
            ("startsWith", 2) => Some(Builtin::StartsWith),
            ("endsWith", 2) => Some(Builtin::EndsWith),
            ("contains", 2) => Some(Builtin::Contains),
            ("matches", 2) => Some(Builtin::Matches),
            ("timestamp", 1) => Some(Builtin::Timestamp),
            ("duration", 1) => Some(Builtin::Duration),
            ("now", 0) => Some(Builtin::Now),
            _ => None,
        }
    }
}

/// One VM instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    /// Push a constant.
    Const(Value),
    /// Push the value bound to a root name (`request`, `R`, `P`).
    LoadIdent(String),
    /// Push the (lazily memoized) value of a variable slot.
    LoadVar(usize),
    /// Pop a map, push its named member; unknown member is an error.
    Member(String),
    /// Pop a map, push whether the named member exists (the `has` probe).
    TestMember(String),
    /// Pop index then container, push the element.
    Index,
    /// Pop n values, push them as a list (first pushed first).
    MakeList(usize),
    /// Pop one value per key (in key order), push the assembled map.
    MakeMap(Vec<String>),
    /// Pop a bool, push its negation.
    Not,
    /// Pop a number or duration, push its negation.
    Neg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Pop container then candidate, push membership.
    In,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// Short-circuit `&&`: if the top is `false`, jump (keeping it);
    /// if `true`, pop and fall through; anything else is a type error.
    JumpIfFalse(usize),
    /// Short-circuit `||`, mirror image of `JumpIfFalse`.
    JumpIfTrue(usize),
    /// Pop the builtin's arguments (receiver first) and push its result.
    Call(Builtin, usize),
}

/// A compiled expression: the instruction list plus its source text and AST.
///
/// The AST is retained for the planner, which partially evaluates
/// expressions rather than running them.
#[derive(Debug, Clone)]
pub struct Program {
    pub ops: Vec<Opcode>,
    pub source: String,
    pub ast: Expr,
}

/// Compile-time context: the variable slot table and the identity of the
/// owning policy (for error messages).
pub struct CompileContext<'a> {
    pub variables: &'a BTreeMap<String, usize>,
    pub owner: &'a str,
}

impl CompileContext<'_> {
    /// A context with no variables in scope.
    pub fn empty(owner: &str) -> CompileContext<'_> {
        static EMPTY: BTreeMap<String, usize> = BTreeMap::new();
        CompileContext { variables: &EMPTY, owner }
    }
}

/// Parse and compile `source`.
pub fn compile(source: &str, ctx: &CompileContext<'_>) -> ArbiterResult<Program> {
    let ast = parse(source)?;
    compile_ast(ast, source, ctx)
}

/// Compile an already-parsed expression.
pub fn compile_ast(ast: Expr, source: &str, ctx: &CompileContext<'_>) -> ArbiterResult<Program> {
    let mut ops = Vec::new();
    emit(&ast, ctx, &mut ops)?;
    Ok(Program {
        ops,
        source: source.to_string(),
        ast,
    })
}

fn emit(expr: &Expr, ctx: &CompileContext<'_>, ops: &mut Vec<Opcode>) -> ArbiterResult<()> {
    match expr {
        Expr::Lit(v) => ops.push(Opcode::Const(v.clone())),

        Expr::Ident(name) => ops.push(Opcode::LoadIdent(name.clone())),

        Expr::Member(obj, field) => {
            // `variables.<name>` resolves to a slot index at compile time.
            if let Expr::Ident(root) = obj.as_ref() {
                if root == "variables" {
                    let slot = ctx.variables.get(field).ok_or_else(|| {
                        ArbiterError::UndefinedVariable {
                            name: field.clone(),
                            policy: ctx.owner.to_string(),
                        }
                    })?;
                    ops.push(Opcode::LoadVar(*slot));
                    return Ok(());
                }
            }
            emit(obj, ctx, ops)?;
            ops.push(Opcode::Member(field.clone()));
        }

        Expr::Index(obj, index) => {
            emit(obj, ctx, ops)?;
            emit(index, ctx, ops)?;
            ops.push(Opcode::Index);
        }

        Expr::List(items) => {
            for item in items {
                emit(item, ctx, ops)?;
            }
            ops.push(Opcode::MakeList(items.len()));
        }

        Expr::Map(entries) => {
            let mut keys = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                emit(value, ctx, ops)?;
                keys.push(key.clone());
            }
            ops.push(Opcode::MakeMap(keys));
        }

        Expr::Unary(UnaryOp::Not, inner) => {
            emit(inner, ctx, ops)?;
            ops.push(Opcode::Not);
        }

        Expr::Unary(UnaryOp::Neg, inner) => {
            emit(inner, ctx, ops)?;
            ops.push(Opcode::Neg);
        }

        Expr::Binary(BinOp::And, left, right) => {
            emit(left, ctx, ops)?;
            let jump = ops.len();
            ops.push(Opcode::JumpIfFalse(0));
            emit(right, ctx, ops)?;
            let target = ops.len();
            ops[jump] = Opcode::JumpIfFalse(target);
        }

        Expr::Binary(BinOp::Or, left, right) => {
            emit(left, ctx, ops)?;
            let jump = ops.len();
            ops.push(Opcode::JumpIfTrue(0));
            emit(right, ctx, ops)?;
            let target = ops.len();
            ops[jump] = Opcode::JumpIfTrue(target);
        }

        Expr::Binary(op, left, right) => {
            emit(left, ctx, ops)?;
            emit(right, ctx, ops)?;
            ops.push(match op {
                BinOp::Eq => Opcode::Eq,
                BinOp::Ne => Opcode::Ne,
                BinOp::Lt => Opcode::Lt,
                BinOp::Le => Opcode::Le,
                BinOp::Gt => Opcode::Gt,
                BinOp::Ge => Opcode::Ge,
                BinOp::In => Opcode::In,
                BinOp::Add => Opcode::Add,
                BinOp::Sub => Opcode::Sub,
                BinOp::Mul => Opcode::Mul,
                BinOp::Div => Opcode::Div,
                BinOp::Mod => Opcode::Mod,
                BinOp::And | BinOp::Or => unreachable!("handled above"),
            });
        }

        Expr::Call(name, args) => {
            if name == "has" {
                return emit_has(args, ctx, ops);
            }
            let builtin = Builtin::resolve(name, args.len()).ok_or_else(|| {
                ArbiterError::ExprType {
                    message: format!("unknown function '{}({} args)'", name, args.len()),
                }
            })?;
            for arg in args {
                emit(arg, ctx, ops)?;
            }
            ops.push(Opcode::Call(builtin, args.len()));
        }

        Expr::Method(receiver, name, args) => {
            let argc = args.len() + 1;
            let builtin = Builtin::resolve(name, argc).ok_or_else(|| ArbiterError::ExprType {
                message: format!("unknown method '{}' with {} argument(s)", name, args.len()),
            })?;
            emit(receiver, ctx, ops)?;
            for arg in args {
                emit(arg, ctx, ops)?;
            }
            ops.push(Opcode::Call(builtin, argc));
        }
    }
    Ok(())
}

/// `has(obj.field)` compiles to a presence probe on `obj`; any other
/// argument shape is malformed.
fn emit_has(args: &[Expr], ctx: &CompileContext<'_>, ops: &mut Vec<Opcode>) -> ArbiterResult<()> {
    match args {
        [Expr::Member(obj, field)] => {
            emit(obj, ctx, ops)?;
            ops.push(Opcode::TestMember(field.clone()));
            Ok(())
        }
        _ => Err(ArbiterError::ExprType {
            message: "has() requires a single member-access argument".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(names: &[&str]) -> BTreeMap<String, usize> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i))
            .collect()
    }

    #[test]
    fn variables_compile_to_slot_loads() {
        let table = slots(&["is_draft", "is_owner"]);
        let ctx = CompileContext { variables: &table, owner: "resource.test.vdefault" };
        let program = compile("variables.is_owner && variables.is_draft", &ctx).unwrap();
        assert!(program.ops.contains(&Opcode::LoadVar(0)));
        assert!(program.ops.contains(&Opcode::LoadVar(1)));
    }

    #[test]
    fn undefined_variable_is_a_compile_error() {
        let ctx = CompileContext::empty("resource.test.vdefault");
        let err = compile("variables.missing", &ctx).unwrap_err();
        match err {
            ArbiterError::UndefinedVariable { name, policy } => {
                assert_eq!(name, "missing");
                assert_eq!(policy, "resource.test.vdefault");
            }
            other => panic!("expected UndefinedVariable, got {other:?}"),
        }
    }

    #[test]
    fn and_compiles_to_a_forward_jump() {
        let ctx = CompileContext::empty("test");
        let program = compile("a && b", &ctx).unwrap();
        assert_eq!(
            program.ops,
            vec![
                Opcode::LoadIdent("a".to_string()),
                Opcode::JumpIfFalse(3),
                Opcode::LoadIdent("b".to_string()),
            ]
        );
    }

    #[test]
    fn has_compiles_to_a_presence_probe() {
        let ctx = CompileContext::empty("test");
        let program = compile("has(request.resource.attr.owner)", &ctx).unwrap();
        assert_eq!(
            program.ops.last(),
            Some(&Opcode::TestMember("owner".to_string()))
        );
    }

    #[test]
    fn has_rejects_non_member_arguments() {
        let ctx = CompileContext::empty("test");
        assert!(compile("has(42)", &ctx).is_err());
    }

    #[test]
    fn unknown_function_is_a_compile_error() {
        let ctx = CompileContext::empty("test");
        assert!(compile("frobnicate(1)", &ctx).is_err());
    }
}
