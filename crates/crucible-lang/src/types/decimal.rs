//! Fixed-point decimal host type.
//!
//! Scripts get exact decimal arithmetic (`decimal.new("1.1") +
//! decimal.new("2.2")` is exactly `3.3`) with operator overloads, trig and
//! log methods, and a decimal-string canonical form on the wire.

use std::collections::HashMap;

use rand::Rng;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};

use crate::registry::{HostBinOp, HostCmpOp, HostType};
use crate::value::{HostValue, NativeFunction, Table, TableKey, UserData, Value};

pub const TAG: &str = "decimal";

const DEFAULT_LOG_PRECISION: u32 = 32;

pub struct DecimalType;

fn wrap(d: Decimal) -> Value {
    Value::UserData(UserData::new(TAG, d))
}

/// Accepts numbers, numeric strings and decimal user-data.
fn coerce(value: &Value) -> Result<Decimal, String> {
    match value {
        Value::Int(i) => Ok(Decimal::from(*i)),
        Value::Float(f) => {
            Decimal::from_f64(*f).ok_or_else(|| format!("cannot represent {f} as a decimal"))
        }
        Value::Str(s) => s
            .parse::<Decimal>()
            .map_err(|e| format!("invalid decimal string {s:?}: {e}")),
        Value::UserData(ud) if ud.tag == TAG => ud
            .downcast_ref::<Decimal>()
            .copied()
            .ok_or_else(|| "corrupt decimal userdata".to_string()),
        other => Err(format!("unsupported decimal operand of type {}", other.kind())),
    }
}

fn self_decimal(recv: &Value) -> Result<Decimal, String> {
    coerce(recv)
}

fn fold(
    recv: &Value,
    args: &[Value],
    op: impl Fn(Decimal, Decimal) -> Result<Decimal, String>,
) -> Result<Vec<Value>, String> {
    let mut acc = coerce(recv)?;
    for arg in args {
        acc = op(acc, coerce(arg)?)?;
    }
    Ok(vec![wrap(acc)])
}

fn apply(op: HostBinOp, a: Decimal, b: Decimal) -> Result<Decimal, String> {
    match op {
        HostBinOp::Add => a.checked_add(b).ok_or_else(|| "decimal overflow".into()),
        HostBinOp::Sub => a.checked_sub(b).ok_or_else(|| "decimal overflow".into()),
        HostBinOp::Mul => a.checked_mul(b).ok_or_else(|| "decimal overflow".into()),
        HostBinOp::Div => a
            .checked_div(b)
            .ok_or_else(|| "decimal division by zero".into()),
        HostBinOp::Mod => a
            .checked_rem(b)
            .ok_or_else(|| "decimal modulo by zero".into()),
        HostBinOp::Pow => a
            .checked_powd(b)
            .ok_or_else(|| "decimal power out of range".into()),
    }
}

fn cmp(op: HostCmpOp, a: Decimal, b: Decimal) -> bool {
    match op {
        HostCmpOp::Eq => a == b,
        HostCmpOp::Lt => a < b,
        HostCmpOp::Le => a <= b,
    }
}

fn digit_count(d: &Decimal) -> i64 {
    d.mantissa().abs().to_string().len() as i64
}

fn round_with(
    recv: &Value,
    args: &[Value],
    exact: impl Fn(Decimal) -> Decimal,
    with_precision: impl Fn(Decimal, u32) -> Decimal,
) -> Result<Vec<Value>, String> {
    let d = self_decimal(recv)?;
    match args.first() {
        None => Ok(vec![wrap(exact(d))]),
        Some(arg) => {
            let dp = arg
                .as_int()
                .filter(|n| *n >= 0)
                .ok_or_else(|| "precision must be a non-negative number".to_string())?;
            Ok(vec![wrap(with_precision(d, dp as u32))])
        }
    }
}

fn ln_with_precision(d: Decimal, precision: u32) -> Result<Decimal, String> {
    let ln = d
        .checked_ln()
        .ok_or_else(|| "log of a non-positive decimal".to_string())?;
    Ok(ln.round_dp(precision))
}

impl HostType for DecimalType {
    fn name(&self) -> &'static str {
        TAG
    }

    fn install(&self, globals: &mut HashMap<String, Value>) {
        let mut table = Table::new();

        table.set(
            TableKey::Str("new".into()),
            Value::Native(NativeFunction::new("decimal.new", |_ctx, args| {
                if args.is_empty() {
                    return Ok(vec![wrap(Decimal::ZERO)]);
                }
                args.iter().map(|a| coerce(a).map(wrap)).collect()
            })),
        );
        table.set(
            TableKey::Str("pi".into()),
            Value::Native(NativeFunction::new("decimal.pi", |_ctx, args| {
                constant_with_rounding(Decimal::PI, args)
            })),
        );
        table.set(
            TableKey::Str("e".into()),
            Value::Native(NativeFunction::new("decimal.e", |_ctx, args| {
                constant_with_rounding(Decimal::E, args)
            })),
        );
        table.set(
            TableKey::Str("min".into()),
            Value::Native(NativeFunction::new("decimal.min", |_ctx, args| {
                extremum(args, |a, b| if b < a { b } else { a })
            })),
        );
        table.set(
            TableKey::Str("max".into()),
            Value::Native(NativeFunction::new("decimal.max", |_ctx, args| {
                extremum(args, |a, b| if b > a { b } else { a })
            })),
        );
        table.set(
            TableKey::Str("random".into()),
            Value::Native(NativeFunction::new("decimal.random", |_ctx, args| {
                random(args)
            })),
        );

        globals.insert(TAG.to_string(), Value::table(table));
    }

    fn to_host(&self, ud: &UserData) -> Option<HostValue> {
        ud.downcast_ref::<Decimal>()
            .map(|d| HostValue::Str(d.to_string()))
    }

    fn binary(&self, op: HostBinOp, lhs: &Value, rhs: &Value) -> Result<Value, String> {
        let (a, b) = (coerce(lhs)?, coerce(rhs)?);
        apply(op, a, b).map(wrap)
    }

    fn compare(&self, op: HostCmpOp, lhs: &Value, rhs: &Value) -> Result<bool, String> {
        let (a, b) = (coerce(lhs)?, coerce(rhs)?);
        Ok(cmp(op, a, b))
    }

    fn neg(&self, value: &Value) -> Result<Value, String> {
        Ok(wrap(-coerce(value)?))
    }

    fn len(&self, value: &Value) -> Result<Value, String> {
        Ok(Value::Int(digit_count(&coerce(value)?)))
    }

    fn to_display(&self, ud: &UserData) -> String {
        ud.downcast_ref::<Decimal>()
            .map(|d| d.to_string())
            .unwrap_or_else(|| format!("<{TAG}>"))
    }

    fn call_method(&self, name: &str, recv: &Value, args: &[Value]) -> Result<Vec<Value>, String> {
        match name {
            "add" => fold(recv, args, |a, b| apply(HostBinOp::Add, a, b)),
            "sub" => fold(recv, args, |a, b| apply(HostBinOp::Sub, a, b)),
            "mul" => fold(recv, args, |a, b| apply(HostBinOp::Mul, a, b)),
            "div" => fold(recv, args, |a, b| apply(HostBinOp::Div, a, b)),
            "mod" => fold(recv, args, |a, b| apply(HostBinOp::Mod, a, b)),
            "pow" => fold(recv, args, |a, b| apply(HostBinOp::Pow, a, b)),
            "neg" => Ok(vec![wrap(-self_decimal(recv)?)]),
            "eq" | "lt" | "le" | "gt" | "ge" => {
                let other = args
                    .first()
                    .ok_or_else(|| format!("'{name}' expects one operand"))?;
                let (a, b) = (self_decimal(recv)?, coerce(other)?);
                let result = match name {
                    "eq" => cmp(HostCmpOp::Eq, a, b),
                    "lt" => cmp(HostCmpOp::Lt, a, b),
                    "le" => cmp(HostCmpOp::Le, a, b),
                    "gt" => cmp(HostCmpOp::Lt, b, a),
                    _ => cmp(HostCmpOp::Le, b, a),
                };
                Ok(vec![Value::Bool(result)])
            }
            "sin" => Ok(vec![wrap(self_decimal(recv)?.sin())]),
            "cos" => Ok(vec![wrap(self_decimal(recv)?.cos())]),
            "tan" => Ok(vec![wrap(self_decimal(recv)?.tan())]),
            "sqrt" => {
                let d = self_decimal(recv)?;
                d.sqrt()
                    .map(|r| vec![wrap(r)])
                    .ok_or_else(|| "square root of a negative decimal".to_string())
            }
            "log" => {
                let d = self_decimal(recv)?;
                let precision = match args.get(1) {
                    Some(arg) => arg
                        .as_int()
                        .filter(|n| *n >= 0)
                        .ok_or_else(|| "log precision must be a non-negative number".to_string())?
                        as u32,
                    None => DEFAULT_LOG_PRECISION,
                };
                let ln = ln_with_precision(d, precision)?;
                match args.first() {
                    None => Ok(vec![wrap(ln)]),
                    Some(base_arg) => {
                        let base = coerce(base_arg)?;
                        let base_ln = ln_with_precision(base, precision)?;
                        let quotient = ln
                            .checked_div(base_ln)
                            .ok_or_else(|| "log base must not be 1".to_string())?;
                        Ok(vec![wrap(quotient)])
                    }
                }
            }
            "abs" => Ok(vec![wrap(self_decimal(recv)?.abs())]),
            "round" => round_with(recv, args, |d| d.round(), |d, dp| d.round_dp(dp)),
            "floor" => round_with(
                recv,
                args,
                |d| d.floor(),
                |d, dp| d.round_dp_with_strategy(dp, RoundingStrategy::ToNegativeInfinity),
            ),
            "ceil" => round_with(
                recv,
                args,
                |d| d.ceil(),
                |d, dp| d.round_dp_with_strategy(dp, RoundingStrategy::ToPositiveInfinity),
            ),
            "string" => Ok(vec![Value::string(self_decimal(recv)?.to_string())]),
            "float" => {
                let d = self_decimal(recv)?;
                let approx = d.to_f64().ok_or_else(|| "decimal out of float range".to_string())?;
                if Decimal::from_f64(approx) != Some(d) {
                    tracing::warn!(before = %d, after = approx, "precision lost in decimal to float conversion");
                }
                Ok(vec![Value::Float(approx)])
            }
            "isInteger" => Ok(vec![Value::Bool(self_decimal(recv)?.is_integer())]),
            "isPositive" => Ok(vec![Value::Bool(self_decimal(recv)? > Decimal::ZERO)]),
            "isNegative" => Ok(vec![Value::Bool(self_decimal(recv)? < Decimal::ZERO)]),
            "isZero" => Ok(vec![Value::Bool(self_decimal(recv)?.is_zero())]),
            other => Err(format!("unknown method '{other}' on decimal")),
        }
    }
}

fn constant_with_rounding(constant: Decimal, args: &[Value]) -> Result<Vec<Value>, String> {
    match args.first() {
        None => Ok(vec![wrap(constant)]),
        Some(arg) => {
            let dp = arg
                .as_int()
                .filter(|n| *n >= 0)
                .ok_or_else(|| "precision must be a non-negative number".to_string())?;
            Ok(vec![wrap(constant.round_dp(dp as u32))])
        }
    }
}

fn extremum(
    args: &[Value],
    pick: impl Fn(Decimal, Decimal) -> Decimal,
) -> Result<Vec<Value>, String> {
    if args.len() < 2 {
        return Err(format!(
            "not enough arguments, at least 2 but {} provided",
            args.len()
        ));
    }
    let mut acc = coerce(&args[0])?;
    for arg in &args[1..] {
        acc = pick(acc, coerce(arg)?);
    }
    Ok(vec![wrap(acc)])
}

/// `random(high)` and `random(from, high)` keep the original service's
/// `from + rand(high - from)` formula; `random()` is a float in [0, 1).
fn random(args: &[Value]) -> Result<Vec<Value>, String> {
    let mut rng = rand::thread_rng();
    let d = match args.len() {
        0 => Decimal::from_f64(rng.gen_range(0.0..1.0))
            .ok_or_else(|| "random float out of range".to_string())?,
        1 => {
            let high = args[0]
                .as_int()
                .ok_or_else(|| "random bound must be a number".to_string())?;
            if high <= 0 {
                return Err("random bound must be positive".to_string());
            }
            Decimal::from(rng.gen_range(0..high))
        }
        _ => {
            let from = args[0]
                .as_int()
                .ok_or_else(|| "random bound must be a number".to_string())?;
            let high = args[1]
                .as_int()
                .ok_or_else(|| "random bound must be a number".to_string())?;
            if high <= from {
                return Err("random upper bound must exceed the lower bound".to_string());
            }
            Decimal::from(from + rng.gen_range(0..high - from))
        }
    };
    Ok(vec![wrap(d)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecError;
    use crate::registry::TypeRegistry;
    use crate::vm::Vm;

    fn run(source: &str) -> Result<Vec<HostValue>, ExecError> {
        let mut vm = Vm::new(TypeRegistry::with_defaults());
        vm.run_source(source, vec![])
    }

    #[test]
    fn addition_is_exact() {
        let out = run(
            r#"
            local a = decimal.new("1.1")
            local b = decimal.new("2.2")
            this.returns((a + b):string())
            "#,
        )
        .unwrap();
        assert_eq!(out, vec![HostValue::Str("3.3".into())]);
    }

    #[test]
    fn operators_and_coercion() {
        let out = run(
            r#"
            local d = decimal.new("10.5")
            this.returns(
                (d * 2):string(),
                (d - "0.5"):string(),
                (-d):string(),
                d < 11,
                d == decimal.new("10.5"),
                #d
            )
            "#,
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                HostValue::Str("21.0".into()),
                HostValue::Str("10.0".into()),
                HostValue::Str("-10.5".into()),
                HostValue::Bool(true),
                HostValue::Bool(true),
                HostValue::Int(3),
            ]
        );
    }

    #[test]
    fn canonical_wire_form_is_a_string() {
        let out = run(r#"this.returns(decimal.new("42.10"))"#).unwrap();
        assert_eq!(out, vec![HostValue::Str("42.10".into())]);
    }

    #[test]
    fn rounding_family() {
        let out = run(
            r#"
            local d = decimal.new("3.14159")
            this.returns(
                d:round(2):string(),
                d:floor():string(),
                d:ceil():string(),
                d:floor(3):string(),
                d:abs():string()
            )
            "#,
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                HostValue::Str("3.14".into()),
                HostValue::Str("3".into()),
                HostValue::Str("4".into()),
                HostValue::Str("3.141".into()),
                HostValue::Str("3.14159".into()),
            ]
        );
    }

    #[test]
    fn predicates() {
        let out = run(
            r#"
            local d = decimal.new("-4")
            this.returns(d:isInteger(), d:isNegative(), d:isPositive(), decimal.new(0):isZero())
            "#,
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                HostValue::Bool(true),
                HostValue::Bool(true),
                HostValue::Bool(false),
                HostValue::Bool(true),
            ]
        );
    }

    #[test]
    fn min_max_require_two_operands() {
        let out = run(
            r#"this.returns(decimal.min(3, "1.5", 2):string(), decimal.max(3, 10):string())"#,
        )
        .unwrap();
        assert_eq!(
            out,
            vec![HostValue::Str("1.5".into()), HostValue::Str("10".into())]
        );
        assert!(run("decimal.min(1)").is_err());
    }

    #[test]
    fn random_stays_in_range() {
        let out = run(
            r#"
            local r = decimal.random(5, 50)
            this.returns(r:isInteger(), r:lt(50), decimal.new(5):le(r))
            "#,
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                HostValue::Bool(true),
                HostValue::Bool(true),
                HostValue::Bool(true),
            ]
        );
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = run(r#"this.returns((decimal.new(1) / 0):string())"#).unwrap_err();
        assert!(matches!(err, ExecError::Runtime(_)));
    }

    #[test]
    fn pi_rounds_on_request() {
        let out = run(r#"this.returns(decimal.pi(4):string())"#).unwrap();
        assert_eq!(out, vec![HostValue::Str("3.1416".into())]);
    }

    #[test]
    fn log_with_base_and_precision() {
        let out = run(
            r#"
            local eight = decimal.new(8)
            this.returns(eight:log(2, 6):string())
            "#,
        )
        .unwrap();
        let HostValue::Str(s) = &out[0] else {
            panic!("expected string");
        };
        let approx: f64 = s.parse().unwrap();
        assert!((approx - 3.0).abs() < 1e-4);
    }
}
