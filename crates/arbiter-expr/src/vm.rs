//! The expression VM: a small stack interpreter over compiled opcodes.
//!
//! Evaluation is pure with respect to the environment: identical opcodes
//! over identical bindings produce identical results. The only time source
//! is `Environment::now()`, which the engine binds once per request.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use arbiter_contracts::error::{ArbiterError, ArbiterResult};
use arbiter_contracts::value::Value;

use crate::program::{Builtin, Opcode, Program};

/// The binding environment an expression evaluates against.
pub trait Environment {
    /// Resolve a root name (`request`, `R`, `P`). `None` means unknown.
    fn lookup(&self, name: &str) -> Option<Value>;

    /// Resolve a variable slot, evaluating and memoizing it on first use.
    fn variable(&self, slot: usize) -> ArbiterResult<Value>;

    /// The request-start timestamp.
    fn now(&self) -> DateTime<Utc>;
}

fn type_error(message: impl Into<String>) -> ArbiterError {
    ArbiterError::ExprType { message: message.into() }
}

fn eval_error(message: impl Into<String>) -> ArbiterError {
    ArbiterError::ExprEval { message: message.into() }
}

/// Execute `program` and return its result value.
pub fn evaluate(program: &Program, env: &dyn Environment) -> ArbiterResult<Value> {
    let mut stack: Vec<Value> = Vec::with_capacity(8);
    let mut pc = 0;

    while pc < program.ops.len() {
        match &program.ops[pc] {
            Opcode::Const(v) => stack.push(v.clone()),

            Opcode::LoadIdent(name) => {
                let value = env
                    .lookup(name)
                    .ok_or_else(|| ArbiterError::UnknownName { name: name.clone() })?;
                stack.push(value);
            }

            Opcode::LoadVar(slot) => stack.push(env.variable(*slot)?),

            Opcode::Member(field) => {
                let obj = pop(&mut stack)?;
                stack.push(member_access(&obj, field)?);
            }

            Opcode::TestMember(field) => {
                let obj = pop(&mut stack)?;
                let present = match obj {
                    Value::Map(fields) => fields.contains_key(field.as_str()),
                    other => {
                        return Err(type_error(format!(
                            "has() probes a map, found {}",
                            other.type_name()
                        )));
                    }
                };
                stack.push(Value::Bool(present));
            }

            Opcode::Index => {
                let index = pop(&mut stack)?;
                let obj = pop(&mut stack)?;
                stack.push(index_access(&obj, &index)?);
            }

            Opcode::MakeList(n) => {
                let items = stack.split_off(stack.len().saturating_sub(*n));
                if items.len() != *n {
                    return Err(eval_error("stack underflow building list"));
                }
                stack.push(Value::List(items));
            }

            Opcode::MakeMap(keys) => {
                let values = stack.split_off(stack.len().saturating_sub(keys.len()));
                if values.len() != keys.len() {
                    return Err(eval_error("stack underflow building map"));
                }
                let map: BTreeMap<String, Value> =
                    keys.iter().cloned().zip(values).collect();
                stack.push(Value::Map(map));
            }

            Opcode::Not => {
                let v = pop(&mut stack)?;
                match v {
                    Value::Bool(b) => stack.push(Value::Bool(!b)),
                    other => {
                        return Err(type_error(format!(
                            "'!' requires bool, found {}",
                            other.type_name()
                        )));
                    }
                }
            }

            Opcode::Neg => {
                let v = pop(&mut stack)?;
                stack.push(apply_unary_neg(&v)?);
            }

            Opcode::Eq => binary(&mut stack, |a, b| Ok(Value::Bool(a == b)))?,
            Opcode::Ne => binary(&mut stack, |a, b| Ok(Value::Bool(a != b)))?,
            Opcode::Lt => binary(&mut stack, |a, b| compare(a, b, Ordering::is_lt))?,
            Opcode::Le => binary(&mut stack, |a, b| compare(a, b, Ordering::is_le))?,
            Opcode::Gt => binary(&mut stack, |a, b| compare(a, b, Ordering::is_gt))?,
            Opcode::Ge => binary(&mut stack, |a, b| compare(a, b, Ordering::is_ge))?,
            Opcode::In => binary(&mut stack, membership)?,
            Opcode::Add => binary(&mut stack, add)?,
            Opcode::Sub => binary(&mut stack, sub)?,
            Opcode::Mul => binary(&mut stack, mul)?,
            Opcode::Div => binary(&mut stack, div)?,
            Opcode::Mod => binary(&mut stack, rem)?,

            Opcode::JumpIfFalse(target) => {
                match stack.last() {
                    Some(Value::Bool(false)) => {
                        pc = *target;
                        continue;
                    }
                    Some(Value::Bool(true)) => {
                        stack.pop();
                    }
                    Some(other) => {
                        return Err(type_error(format!(
                            "'&&' requires bool operands, found {}",
                            other.type_name()
                        )));
                    }
                    None => return Err(eval_error("stack underflow at '&&'")),
                }
            }

            Opcode::JumpIfTrue(target) => {
                match stack.last() {
                    Some(Value::Bool(true)) => {
                        pc = *target;
                        continue;
                    }
                    Some(Value::Bool(false)) => {
                        stack.pop();
                    }
                    Some(other) => {
                        return Err(type_error(format!(
                            "'||' requires bool operands, found {}",
                            other.type_name()
                        )));
                    }
                    None => return Err(eval_error("stack underflow at '||'")),
                }
            }

            Opcode::Call(builtin, argc) => {
                let args = stack.split_off(stack.len().saturating_sub(*argc));
                if args.len() != *argc {
                    return Err(eval_error("stack underflow in builtin call"));
                }
                stack.push(call_builtin(*builtin, &args, env.now())?);
            }
        }
        pc += 1;
    }

    match stack.len() {
        1 => Ok(stack.remove(0)),
        n => Err(eval_error(format!("program left {n} values on the stack"))),
    }
}

/// Execute `program` and require a boolean result.
///
/// Conditions use this entry point: a non-boolean result is a typed error
/// the engine records in the trace.
pub fn evaluate_bool(program: &Program, env: &dyn Environment) -> ArbiterResult<bool> {
    match evaluate(program, env)? {
        Value::Bool(b) => Ok(b),
        other => Err(type_error(format!(
            "condition '{}' produced {}, expected bool",
            program.source,
            other.type_name()
        ))),
    }
}

fn pop(stack: &mut Vec<Value>) -> ArbiterResult<Value> {
    stack.pop().ok_or_else(|| eval_error("stack underflow"))
}

fn binary(
    stack: &mut Vec<Value>,
    op: impl FnOnce(&Value, &Value) -> ArbiterResult<Value>,
) -> ArbiterResult<()> {
    let right = pop(stack)?;
    let left = pop(stack)?;
    stack.push(op(&left, &right)?);
    Ok(())
}

/// Member access on a map value. A missing key is an unknown-name error so
/// the engine can attribute it to the rule that touched it.
pub(crate) fn member_access(obj: &Value, field: &str) -> ArbiterResult<Value> {
    match obj {
        Value::Map(fields) => fields
            .get(field)
            .cloned()
            .ok_or_else(|| ArbiterError::UnknownName { name: field.to_string() }),
        other => Err(type_error(format!(
            "cannot access member '{}' on {}",
            field,
            other.type_name()
        ))),
    }
}

pub(crate) fn index_access(obj: &Value, index: &Value) -> ArbiterResult<Value> {
    match (obj, index) {
        (Value::List(items), Value::Int(i)) => {
            let idx = usize::try_from(*i)
                .ok()
                .filter(|idx| *idx < items.len())
                .ok_or_else(|| eval_error(format!("list index {i} out of range")))?;
            Ok(items[idx].clone())
        }
        (Value::Map(_), Value::String(key)) => member_access(obj, key),
        (obj, index) => Err(type_error(format!(
            "cannot index {} with {}",
            obj.type_name(),
            index.type_name()
        ))),
    }
}

fn compare(a: &Value, b: &Value, pick: impl Fn(Ordering) -> bool) -> ArbiterResult<Value> {
    let ordering = a.compare(b).ok_or_else(|| {
        type_error(format!(
            "cannot compare {} with {}",
            a.type_name(),
            b.type_name()
        ))
    })?;
    Ok(Value::Bool(pick(ordering)))
}

pub(crate) fn membership(candidate: &Value, container: &Value) -> ArbiterResult<Value> {
    match container {
        Value::List(items) => Ok(Value::Bool(items.iter().any(|item| item == candidate))),
        Value::Map(fields) => match candidate {
            Value::String(key) => Ok(Value::Bool(fields.contains_key(key.as_str()))),
            other => Err(type_error(format!(
                "map membership requires a string key, found {}",
                other.type_name()
            ))),
        },
        other => Err(type_error(format!(
            "'in' requires a list or map, found {}",
            other.type_name()
        ))),
    }
}

pub(crate) fn apply_unary_neg(v: &Value) -> ArbiterResult<Value> {
    match v {
        Value::Int(i) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| eval_error("integer overflow in negation")),
        Value::Double(d) => Ok(Value::Double(-d)),
        Value::Duration(d) => Ok(Value::Duration(-*d)),
        other => Err(type_error(format!(
            "cannot negate {}",
            other.type_name()
        ))),
    }
}

pub(crate) fn add(a: &Value, b: &Value) -> ArbiterResult<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x
            .checked_add(*y)
            .map(Value::Int)
            .ok_or_else(|| eval_error("integer overflow in '+'")),
        (Value::String(x), Value::String(y)) => Ok(Value::String(format!("{x}{y}"))),
        (Value::List(x), Value::List(y)) => {
            let mut joined = x.clone();
            joined.extend(y.iter().cloned());
            Ok(Value::List(joined))
        }
        (Value::Timestamp(ts), Value::Duration(d)) | (Value::Duration(d), Value::Timestamp(ts)) => {
            ts.checked_add_signed(*d)
                .map(Value::Timestamp)
                .ok_or_else(|| eval_error("timestamp overflow in '+'"))
        }
        (Value::Duration(x), Value::Duration(y)) => x
            .checked_add(y)
            .map(Value::Duration)
            .ok_or_else(|| eval_error("duration overflow in '+'")),
        _ => numeric(a, b, "'+'", |x, y| x + y),
    }
}

pub(crate) fn sub(a: &Value, b: &Value) -> ArbiterResult<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x
            .checked_sub(*y)
            .map(Value::Int)
            .ok_or_else(|| eval_error("integer overflow in '-'")),
        (Value::Timestamp(ts), Value::Duration(d)) => ts
            .checked_sub_signed(*d)
            .map(Value::Timestamp)
            .ok_or_else(|| eval_error("timestamp underflow in '-'")),
        (Value::Timestamp(x), Value::Timestamp(y)) => Ok(Value::Duration(*x - *y)),
        (Value::Duration(x), Value::Duration(y)) => x
            .checked_sub(y)
            .map(Value::Duration)
            .ok_or_else(|| eval_error("duration overflow in '-'")),
        _ => numeric(a, b, "'-'", |x, y| x - y),
    }
}

pub(crate) fn mul(a: &Value, b: &Value) -> ArbiterResult<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x
            .checked_mul(*y)
            .map(Value::Int)
            .ok_or_else(|| eval_error("integer overflow in '*'")),
        _ => numeric(a, b, "'*'", |x, y| x * y),
    }
}

pub(crate) fn div(a: &Value, b: &Value) -> ArbiterResult<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            if *y == 0 {
                Err(ArbiterError::DivisionByZero)
            } else {
                x.checked_div(*y)
                    .map(Value::Int)
                    .ok_or_else(|| eval_error("integer overflow in '/'"))
            }
        }
        _ => numeric(a, b, "'/'", |x, y| x / y),
    }
}

pub(crate) fn rem(a: &Value, b: &Value) -> ArbiterResult<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            if *y == 0 {
                Err(ArbiterError::DivisionByZero)
            } else {
                x.checked_rem(*y)
                    .map(Value::Int)
                    .ok_or_else(|| eval_error("integer overflow in '%'"))
            }
        }
        (a, b) => Err(type_error(format!(
            "'%' requires int operands, found {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn numeric(
    a: &Value,
    b: &Value,
    op: &str,
    apply: impl Fn(f64, f64) -> f64,
) -> ArbiterResult<Value> {
    let (x, y) = match (a, b) {
        (Value::Int(x), Value::Double(y)) => (*x as f64, *y),
        (Value::Double(x), Value::Int(y)) => (*x, *y as f64),
        (Value::Double(x), Value::Double(y)) => (*x, *y),
        (a, b) => {
            return Err(type_error(format!(
                "{} is not defined for {} and {}",
                op,
                a.type_name(),
                b.type_name()
            )));
        }
    };
    Ok(Value::Double(apply(x, y)))
}

/// Apply a non-short-circuiting binary operator outside the VM.
///
/// Shared with the planner's partial evaluator so both paths agree on
/// semantics by construction.
pub(crate) fn apply_binary(
    op: crate::parser::BinOp,
    a: &Value,
    b: &Value,
) -> ArbiterResult<Value> {
    use crate::parser::BinOp;
    match op {
        BinOp::Eq => Ok(Value::Bool(a == b)),
        BinOp::Ne => Ok(Value::Bool(a != b)),
        BinOp::Lt => compare(a, b, Ordering::is_lt),
        BinOp::Le => compare(a, b, Ordering::is_le),
        BinOp::Gt => compare(a, b, Ordering::is_gt),
        BinOp::Ge => compare(a, b, Ordering::is_ge),
        BinOp::In => membership(a, b),
        BinOp::Add => add(a, b),
        BinOp::Sub => sub(a, b),
        BinOp::Mul => mul(a, b),
        BinOp::Div => div(a, b),
        BinOp::Mod => rem(a, b),
        BinOp::And | BinOp::Or => Err(eval_error("logical operators are short-circuiting")),
    }
}

/// Invoke a builtin on already-evaluated arguments.
pub(crate) fn call_builtin(
    builtin: Builtin,
    args: &[Value],
    now: DateTime<Utc>,
) -> ArbiterResult<Value> {
    match (builtin, args) {
        (Builtin::Size, [Value::String(s)]) => Ok(Value::Int(s.chars().count() as i64)),
        (Builtin::Size, [Value::List(items)]) => Ok(Value::Int(items.len() as i64)),
        (Builtin::Size, [Value::Map(fields)]) => Ok(Value::Int(fields.len() as i64)),
        (Builtin::Size, [other]) => Err(type_error(format!(
            "size() requires a string, list, or map, found {}",
            other.type_name()
        ))),

        (Builtin::StartsWith, [Value::String(s), Value::String(prefix)]) => {
            Ok(Value::Bool(s.starts_with(prefix.as_str())))
        }
        (Builtin::EndsWith, [Value::String(s), Value::String(suffix)]) => {
            Ok(Value::Bool(s.ends_with(suffix.as_str())))
        }
        (Builtin::Contains, [Value::String(s), Value::String(needle)]) => {
            Ok(Value::Bool(s.contains(needle.as_str())))
        }
        (Builtin::Matches, [Value::String(s), Value::String(pattern)]) => {
            let re = regex::Regex::new(pattern)
                .map_err(|e| eval_error(format!("invalid regex '{pattern}': {e}")))?;
            Ok(Value::Bool(re.is_match(s)))
        }
        (Builtin::StartsWith | Builtin::EndsWith | Builtin::Contains | Builtin::Matches, args) => {
            Err(type_error(format!(
                "string predicate requires string arguments, found {}",
                args.iter().map(Value::type_name).collect::<Vec<_>>().join(", ")
            )))
        }

        (Builtin::Timestamp, [Value::String(s)]) => DateTime::parse_from_rfc3339(s)
            .map(|ts| Value::Timestamp(ts.with_timezone(&Utc)))
            .map_err(|e| eval_error(format!("invalid timestamp '{s}': {e}"))),
        (Builtin::Timestamp, [other]) => Err(type_error(format!(
            "timestamp() requires a string, found {}",
            other.type_name()
        ))),

        (Builtin::Duration, [Value::String(s)]) => parse_duration(s).map(Value::Duration),
        (Builtin::Duration, [other]) => Err(type_error(format!(
            "duration() requires a string, found {}",
            other.type_name()
        ))),

        (Builtin::Now, []) => Ok(Value::Timestamp(now)),

        (builtin, args) => Err(type_error(format!(
            "builtin {builtin:?} does not accept {} argument(s)",
            args.len()
        ))),
    }
}

/// Parse durations of the form `"36h"`, `"1h30m"`, `"90s"`, `"250ms"`.
fn parse_duration(text: &str) -> ArbiterResult<Duration> {
    let bytes = text.as_bytes();
    let mut total = Duration::zero();
    let mut pos = 0;
    let negative = bytes.first() == Some(&b'-');
    if negative {
        pos = 1;
    }

    if pos >= bytes.len() {
        return Err(eval_error(format!("invalid duration '{text}'")));
    }

    while pos < bytes.len() {
        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if start == pos {
            return Err(eval_error(format!("invalid duration '{text}'")));
        }
        let amount: i64 = text[start..pos]
            .parse()
            .map_err(|_| eval_error(format!("duration component out of range in '{text}'")))?;

        let unit_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_alphabetic() {
            pos += 1;
        }
        let component = match &text[unit_start..pos] {
            "h" => Duration::try_hours(amount),
            "m" => Duration::try_minutes(amount),
            "s" => Duration::try_seconds(amount),
            "ms" => Some(Duration::milliseconds(amount)),
            unit => {
                return Err(eval_error(format!(
                    "unknown duration unit '{unit}' in '{text}'"
                )));
            }
        }
        .ok_or_else(|| eval_error(format!("duration component out of range in '{text}'")))?;
        total = total + component;
    }

    Ok(if negative { -total } else { total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{compile, CompileContext};
    use serde_json::json;

    /// Test environment backed by a single JSON document of root bindings.
    struct TestEnv {
        roots: BTreeMap<String, Value>,
        now: DateTime<Utc>,
    }

    impl TestEnv {
        fn new(bindings: serde_json::Value) -> Self {
            let roots = match Value::from_json(&bindings) {
                Value::Map(fields) => fields,
                _ => panic!("bindings must be an object"),
            };
            Self {
                roots,
                now: DateTime::parse_from_rfc3339("2021-02-10T12:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
            }
        }
    }

    impl Environment for TestEnv {
        fn lookup(&self, name: &str) -> Option<Value> {
            self.roots.get(name).cloned()
        }

        fn variable(&self, _slot: usize) -> ArbiterResult<Value> {
            Err(ArbiterError::ExprEval {
                message: "no variables in test env".to_string(),
            })
        }

        fn now(&self) -> DateTime<Utc> {
            self.now
        }
    }

    fn eval(source: &str, bindings: serde_json::Value) -> ArbiterResult<Value> {
        let ctx = CompileContext::empty("test");
        let program = compile(source, &ctx)?;
        evaluate(&program, &TestEnv::new(bindings))
    }

    fn eval_ok(source: &str, bindings: serde_json::Value) -> Value {
        eval(source, bindings).unwrap()
    }

    #[test]
    fn member_chains_resolve_attributes() {
        let result = eval_ok(
            "R.attr.status == \"PENDING_APPROVAL\"",
            json!({ "R": { "attr": { "status": "PENDING_APPROVAL" } } }),
        );
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn logical_operators_short_circuit() {
        // The right side would error (unknown name), but the left side
        // decides the result first.
        let result = eval_ok("false && nosuch.thing", json!({}));
        assert_eq!(result, Value::Bool(false));

        let result = eval_ok("true || nosuch.thing", json!({}));
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn logical_operators_require_bools() {
        let err = eval("1 && true", json!({})).unwrap_err();
        assert!(matches!(err, ArbiterError::ExprType { .. }));
    }

    #[test]
    fn mixed_numeric_comparison() {
        assert_eq!(eval_ok("1 < 1.5", json!({})), Value::Bool(true));
        assert_eq!(eval_ok("2 == 2.0", json!({})), Value::Bool(true));
        assert_eq!(eval_ok("3 + 4 * 2", json!({})), Value::Int(11));
        assert_eq!(eval_ok("7 / 2", json!({})), Value::Int(3));
        assert_eq!(eval_ok("7.0 / 2", json!({})), Value::Double(3.5));
    }

    #[test]
    fn division_by_zero_is_typed() {
        let err = eval("1 / 0", json!({})).unwrap_err();
        assert!(matches!(err, ArbiterError::DivisionByZero));
    }

    #[test]
    fn string_predicates() {
        assert_eq!(
            eval_ok("\"view:public\".startsWith(\"view:\")", json!({})),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok("\"leave_request\".endsWith(\"request\")", json!({})),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok("\"GB-LON\".matches(\"^[A-Z]{2}-\")", json!({})),
            Value::Bool(true)
        );
    }

    #[test]
    fn membership_on_lists_and_maps() {
        assert_eq!(
            eval_ok(
                "P.attr.geography in R.attr.managed_geographies",
                json!({
                    "P": { "attr": { "geography": "GB" } },
                    "R": { "attr": { "managed_geographies": ["GB", "IE"] } }
                })
            ),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok("\"dept\" in {\"dept\": 1}", json!({})),
            Value::Bool(true)
        );
    }

    #[test]
    fn has_probes_without_erroring() {
        let bindings = json!({ "R": { "attr": { "owner": "john" } } });
        assert_eq!(eval_ok("has(R.attr.owner)", bindings.clone()), Value::Bool(true));
        assert_eq!(eval_ok("has(R.attr.missing)", bindings), Value::Bool(false));
    }

    #[test]
    fn missing_member_is_unknown_name() {
        let err = eval("R.attr.missing", json!({ "R": { "attr": {} } })).unwrap_err();
        match err {
            ArbiterError::UnknownName { name } => assert_eq!(name, "missing"),
            other => panic!("expected UnknownName, got {other:?}"),
        }
    }

    #[test]
    fn timestamp_and_duration_arithmetic() {
        assert_eq!(
            eval_ok(
                "timestamp(\"2021-02-10T12:00:00Z\") - timestamp(\"2021-02-10T11:00:00Z\") == duration(\"1h\")",
                json!({})
            ),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok(
                "now() + duration(\"24h\") > timestamp(\"2021-02-11T11:59:00Z\")",
                json!({})
            ),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok("duration(\"1h30m\") == duration(\"90m\")", json!({})),
            Value::Bool(true)
        );
    }

    #[test]
    fn size_of_strings_lists_maps() {
        assert_eq!(eval_ok("size(\"abc\")", json!({})), Value::Int(3));
        assert_eq!(eval_ok("size([1, 2])", json!({})), Value::Int(2));
        assert_eq!(eval_ok("size({\"a\": 1})", json!({})), Value::Int(1));
    }

    #[test]
    fn indexing_lists_and_maps() {
        assert_eq!(
            eval_ok("R.attr.tags[1]", json!({ "R": { "attr": { "tags": ["x", "y"] } } })),
            Value::String("y".to_string())
        );
        assert_eq!(
            eval_ok("R.attr[\"owner\"]", json!({ "R": { "attr": { "owner": "sally" } } })),
            Value::String("sally".to_string())
        );
        assert!(eval("[1][5]", json!({})).is_err());
    }

    #[test]
    fn non_bool_condition_result_is_typed() {
        let ctx = CompileContext::empty("test");
        let program = compile("1 + 1", &ctx).unwrap();
        let err = evaluate_bool(&program, &TestEnv::new(json!({}))).unwrap_err();
        assert!(matches!(err, ArbiterError::ExprType { .. }));
    }
}
