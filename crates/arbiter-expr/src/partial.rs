//! Partial evaluation of expression ASTs for the query planner.
//!
//! The planner evaluates the same conditions the engine does, but with the
//! per-instance resource attributes unknown. Sub-expressions that depend
//! only on known bindings fold to constants through the exact same operator
//! semantics as the VM (`apply_binary`, `call_builtin`); anything touching
//! an unknown stays symbolic and is re-assembled into a residual tree.

use chrono::{DateTime, Utc};

use arbiter_contracts::error::{ArbiterError, ArbiterResult};
use arbiter_contracts::value::Value;

use crate::parser::{BinOp, Expr, UnaryOp};
use crate::program::Builtin;
use crate::vm;

/// The outcome of partially evaluating one expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Partial {
    /// The expression folded to a concrete value.
    Known(Value),
    /// The expression depends on unknown bindings; this is the residue.
    Residual(Expr),
}

impl Partial {
    /// Re-embed into an expression (constants become literals).
    pub fn into_expr(self) -> Expr {
        match self {
            Partial::Known(v) => Expr::Lit(v),
            Partial::Residual(e) => e,
        }
    }
}

/// Bindings for partial evaluation.
///
/// Root lookups may be dotted for the request sub-objects
/// (`request.principal`, `request.resource`, `request.auxData`), letting an
/// environment keep the principal known while the resource stays symbolic.
pub trait PartialEnvironment {
    /// Resolve a root name to a known value or a canonical residual form.
    fn lookup(&self, name: &str) -> Option<Partial>;

    /// The parsed definition of a variable, for inline partial evaluation.
    fn variable_ast(&self, name: &str) -> Option<Expr>;

    /// The plan-time timestamp bound to `now()`.
    fn now(&self) -> DateTime<Utc>;
}

/// Partially evaluate `expr` against `env`.
pub fn partial_eval(expr: &Expr, env: &dyn PartialEnvironment) -> ArbiterResult<Partial> {
    match expr {
        Expr::Lit(v) => Ok(Partial::Known(v.clone())),

        Expr::Ident(name) => env
            .lookup(name)
            .ok_or_else(|| ArbiterError::UnknownName { name: name.clone() }),

        Expr::Member(obj, field) => {
            if let Expr::Ident(root) = obj.as_ref() {
                if root == "variables" {
                    let ast = env.variable_ast(field).ok_or_else(|| {
                        ArbiterError::UnknownName {
                            name: format!("variables.{field}"),
                        }
                    })?;
                    return partial_eval(&ast, env);
                }
                // `request.principal` and friends resolve as dotted roots so
                // the principal side stays known while the resource side
                // stays symbolic.
                if root == "request" {
                    if let Some(partial) = env.lookup(&format!("request.{field}")) {
                        return Ok(partial);
                    }
                }
            }
            match partial_eval(obj, env)? {
                Partial::Known(v) => Ok(Partial::Known(vm::member_access(&v, field)?)),
                Partial::Residual(e) => {
                    Ok(Partial::Residual(Expr::Member(Box::new(e), field.clone())))
                }
            }
        }

        Expr::Index(obj, index) => {
            let obj = partial_eval(obj, env)?;
            let index = partial_eval(index, env)?;
            match (obj, index) {
                (Partial::Known(o), Partial::Known(i)) => {
                    Ok(Partial::Known(vm::index_access(&o, &i)?))
                }
                (o, i) => Ok(Partial::Residual(Expr::Index(
                    Box::new(o.into_expr()),
                    Box::new(i.into_expr()),
                ))),
            }
        }

        Expr::List(items) => {
            let parts = items
                .iter()
                .map(|item| partial_eval(item, env))
                .collect::<ArbiterResult<Vec<_>>>()?;
            if parts.iter().all(|p| matches!(p, Partial::Known(_))) {
                let values = parts
                    .into_iter()
                    .map(|p| match p {
                        Partial::Known(v) => v,
                        Partial::Residual(_) => unreachable!(),
                    })
                    .collect();
                Ok(Partial::Known(Value::List(values)))
            } else {
                Ok(Partial::Residual(Expr::List(
                    parts.into_iter().map(Partial::into_expr).collect(),
                )))
            }
        }

        Expr::Map(entries) => {
            let parts = entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), partial_eval(v, env)?)))
                .collect::<ArbiterResult<Vec<_>>>()?;
            if parts.iter().all(|(_, p)| matches!(p, Partial::Known(_))) {
                let map = parts
                    .into_iter()
                    .map(|(k, p)| match p {
                        Partial::Known(v) => (k, v),
                        Partial::Residual(_) => unreachable!(),
                    })
                    .collect();
                Ok(Partial::Known(Value::Map(map)))
            } else {
                Ok(Partial::Residual(Expr::Map(
                    parts
                        .into_iter()
                        .map(|(k, p)| (k, p.into_expr()))
                        .collect(),
                )))
            }
        }

        Expr::Unary(UnaryOp::Not, inner) => match partial_eval(inner, env)? {
            Partial::Known(Value::Bool(b)) => Ok(Partial::Known(Value::Bool(!b))),
            Partial::Known(other) => Err(ArbiterError::ExprType {
                message: format!("'!' requires bool, found {}", other.type_name()),
            }),
            Partial::Residual(e) => Ok(Partial::Residual(Expr::Unary(
                UnaryOp::Not,
                Box::new(e),
            ))),
        },

        Expr::Unary(UnaryOp::Neg, inner) => match partial_eval(inner, env)? {
            Partial::Known(v) => Ok(Partial::Known(vm::apply_unary_neg(&v)?)),
            Partial::Residual(e) => Ok(Partial::Residual(Expr::Unary(
                UnaryOp::Neg,
                Box::new(e),
            ))),
        },

        Expr::Binary(BinOp::And, left, right) => {
            match partial_eval(left, env)? {
                Partial::Known(Value::Bool(false)) => Ok(Partial::Known(Value::Bool(false))),
                Partial::Known(Value::Bool(true)) => partial_eval(right, env),
                Partial::Known(other) => Err(ArbiterError::ExprType {
                    message: format!("'&&' requires bool operands, found {}", other.type_name()),
                }),
                Partial::Residual(le) => match partial_eval(right, env)? {
                    Partial::Known(Value::Bool(false)) => Ok(Partial::Known(Value::Bool(false))),
                    Partial::Known(Value::Bool(true)) => Ok(Partial::Residual(le)),
                    Partial::Known(other) => Err(ArbiterError::ExprType {
                        message: format!(
                            "'&&' requires bool operands, found {}",
                            other.type_name()
                        ),
                    }),
                    Partial::Residual(re) => Ok(Partial::Residual(Expr::Binary(
                        BinOp::And,
                        Box::new(le),
                        Box::new(re),
                    ))),
                },
            }
        }

        Expr::Binary(BinOp::Or, left, right) => {
            match partial_eval(left, env)? {
                Partial::Known(Value::Bool(true)) => Ok(Partial::Known(Value::Bool(true))),
                Partial::Known(Value::Bool(false)) => partial_eval(right, env),
                Partial::Known(other) => Err(ArbiterError::ExprType {
                    message: format!("'||' requires bool operands, found {}", other.type_name()),
                }),
                Partial::Residual(le) => match partial_eval(right, env)? {
                    Partial::Known(Value::Bool(true)) => Ok(Partial::Known(Value::Bool(true))),
                    Partial::Known(Value::Bool(false)) => Ok(Partial::Residual(le)),
                    Partial::Known(other) => Err(ArbiterError::ExprType {
                        message: format!(
                            "'||' requires bool operands, found {}",
                            other.type_name()
                        ),
                    }),
                    Partial::Residual(re) => Ok(Partial::Residual(Expr::Binary(
                        BinOp::Or,
                        Box::new(le),
                        Box::new(re),
                    ))),
                },
            }
        }

        Expr::Binary(op, left, right) => {
            let left = partial_eval(left, env)?;
            let right = partial_eval(right, env)?;
            match (left, right) {
                (Partial::Known(a), Partial::Known(b)) => {
                    Ok(Partial::Known(vm::apply_binary(*op, &a, &b)?))
                }
                (l, r) => Ok(Partial::Residual(Expr::Binary(
                    *op,
                    Box::new(l.into_expr()),
                    Box::new(r.into_expr()),
                ))),
            }
        }

        Expr::Call(name, args) => {
            if name == "has" {
                return partial_has(args, env);
            }
            if name == "now" && args.is_empty() {
                return Ok(Partial::Known(Value::Timestamp(env.now())));
            }
            let parts = args
                .iter()
                .map(|arg| partial_eval(arg, env))
                .collect::<ArbiterResult<Vec<_>>>()?;
            fold_call(None, name, parts, env)
        }

        Expr::Method(receiver, name, args) => {
            let recv = partial_eval(receiver, env)?;
            let parts = args
                .iter()
                .map(|arg| partial_eval(arg, env))
                .collect::<ArbiterResult<Vec<_>>>()?;
            fold_call(Some(recv), name, parts, env)
        }
    }
}

fn partial_has(args: &[Expr], env: &dyn PartialEnvironment) -> ArbiterResult<Partial> {
    match args {
        [Expr::Member(obj, field)] => match partial_eval(obj, env)? {
            Partial::Known(Value::Map(fields)) => {
                Ok(Partial::Known(Value::Bool(fields.contains_key(field.as_str()))))
            }
            Partial::Known(other) => Err(ArbiterError::ExprType {
                message: format!("has() probes a map, found {}", other.type_name()),
            }),
            Partial::Residual(e) => Ok(Partial::Residual(Expr::Call(
                "has".to_string(),
                vec![Expr::Member(Box::new(e), field.clone())],
            ))),
        },
        _ => Err(ArbiterError::ExprType {
            message: "has() requires a single member-access argument".to_string(),
        }),
    }
}

/// Fold a call when every argument is known; otherwise rebuild it.
fn fold_call(
    receiver: Option<Partial>,
    name: &str,
    args: Vec<Partial>,
    env: &dyn PartialEnvironment,
) -> ArbiterResult<Partial> {
    let argc = args.len() + usize::from(receiver.is_some());
    let all_known = receiver
        .iter()
        .chain(args.iter())
        .all(|p| matches!(p, Partial::Known(_)));

    let builtin = Builtin::resolve(name, argc).ok_or_else(|| ArbiterError::ExprType {
        message: format!("unknown function '{name}' with {argc} argument(s)"),
    })?;

    if all_known {
        let mut values = Vec::with_capacity(argc);
        for part in receiver.iter().chain(args.iter()) {
            match part {
                Partial::Known(v) => values.push(v.clone()),
                Partial::Residual(_) => unreachable!(),
            }
        }
        return Ok(Partial::Known(vm::call_builtin(builtin, &values, env.now())?));
    }

    let arg_exprs: Vec<Expr> = args.into_iter().map(Partial::into_expr).collect();
    Ok(Partial::Residual(match receiver {
        Some(recv) => Expr::Method(Box::new(recv.into_expr()), name.to_string(), arg_exprs),
        None => Expr::Call(name.to_string(), arg_exprs),
    }))
}

/// Simplify a residual tree: fold boolean identities, collapse double
/// negation, and eliminate duplicate clauses.
pub fn simplify(expr: Expr) -> Expr {
    match expr {
        Expr::Binary(BinOp::And, left, right) => {
            let left = simplify(*left);
            let right = simplify(*right);
            match (left, right) {
                (Expr::Lit(Value::Bool(true)), other) | (other, Expr::Lit(Value::Bool(true))) => {
                    other
                }
                (Expr::Lit(Value::Bool(false)), _) | (_, Expr::Lit(Value::Bool(false))) => {
                    Expr::Lit(Value::Bool(false))
                }
                (left, right) if left == right => left,
                (left, right) => Expr::Binary(BinOp::And, Box::new(left), Box::new(right)),
            }
        }
        Expr::Binary(BinOp::Or, left, right) => {
            let left = simplify(*left);
            let right = simplify(*right);
            match (left, right) {
                (Expr::Lit(Value::Bool(false)), other) | (other, Expr::Lit(Value::Bool(false))) => {
                    other
                }
                (Expr::Lit(Value::Bool(true)), _) | (_, Expr::Lit(Value::Bool(true))) => {
                    Expr::Lit(Value::Bool(true))
                }
                (left, right) if left == right => left,
                (left, right) => Expr::Binary(BinOp::Or, Box::new(left), Box::new(right)),
            }
        }
        Expr::Unary(UnaryOp::Not, inner) => {
            let inner = simplify(*inner);
            match inner {
                Expr::Lit(Value::Bool(b)) => Expr::Lit(Value::Bool(!b)),
                Expr::Unary(UnaryOp::Not, doubled) => *doubled,
                other => Expr::Unary(UnaryOp::Not, Box::new(other)),
            }
        }
        other => other,
    }
}
