//! Operator semantics: arithmetic, comparison and membership.

use std::cmp::Ordering;

use crate::sandbox::ast::{BinOp, CmpOp, UnaryOp};
use crate::sandbox::error::Fault;
use crate::sandbox::time;
use crate::sandbox::value::{Value, check_weight, dict_get};

/// Reject collections and strings longer than the configured limit.
pub fn check_len(len: usize, max: usize, what: &str) -> Result<(), Fault> {
    if len > max {
        return Err(Fault::TooLarge(format!("{what} of length {len}")));
    }
    Ok(())
}

fn unsupported(op: BinOp, left: &Value, right: &Value) -> Fault {
    Fault::Type(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

pub fn unary(op: UnaryOp, value: &Value) -> Result<Value, Fault> {
    match (op, value) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Value::Float(v)) => Ok(Value::Float(-v)),
        (UnaryOp::Neg, Value::TimeDelta(us)) => {
            us.checked_neg().ok_or(Fault::Overflow).and_then(time::timedelta)
        }
        (UnaryOp::Neg, v) if v.as_int().is_some() => v
            .as_int()
            .and_then(i64::checked_neg)
            .map(Value::Int)
            .ok_or(Fault::Overflow),
        (UnaryOp::Pos, Value::Float(_) | Value::Int(_) | Value::TimeDelta(_)) => Ok(value.clone()),
        (UnaryOp::Pos, Value::Bool(b)) => Ok(Value::Int(i64::from(*b))),
        (op, v) => Err(Fault::Type(format!(
            "bad operand type for unary {}: '{}'",
            if op == UnaryOp::Neg { "-" } else { "+" },
            v.type_name()
        ))),
    }
}

pub fn binary(op: BinOp, left: &Value, right: &Value, max_len: usize) -> Result<Value, Fault> {
    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
        return int_op(op, a, b);
    }
    if left.is_number() && right.is_number() {
        let (a, b) = (left.as_number().unwrap_or(0.0), right.as_number().unwrap_or(0.0));
        return float_op(op, a, b);
    }
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            check_len(a.chars().count() + b.chars().count(), max_len, "string")?;
            Ok(Value::Str(format!("{a}{b}")))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            check_len(a.len() + b.len(), max_len, "list")?;
            Ok(Value::list(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            check_len(a.len() + b.len(), max_len, "tuple")?;
            Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if n.as_int().is_some() => {
            let times = usize::try_from(n.as_int().unwrap_or(0)).unwrap_or(0);
            check_len(s.chars().count().saturating_mul(times), max_len, "string")?;
            Ok(Value::Str(s.repeat(times)))
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items))
            if n.as_int().is_some() =>
        {
            let times = usize::try_from(n.as_int().unwrap_or(0)).unwrap_or(0);
            check_len(items.len().saturating_mul(times), max_len, "list")?;
            // Repeated strings are deep copies, so bound the expansion first.
            check_weight("list", items.weight().saturating_mul(times), max_len)?;
            Ok(Value::list(
                (0..times).flat_map(|_| items.iter().cloned()).collect(),
            ))
        }
        _ => calendar_op(op, left, right),
    }
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<Value, Fault> {
    let checked = |v: Option<i64>| v.map(Value::Int).ok_or(Fault::Overflow);
    match op {
        BinOp::Add => checked(a.checked_add(b)),
        BinOp::Sub => checked(a.checked_sub(b)),
        BinOp::Mul => checked(a.checked_mul(b)),
        BinOp::Div => {
            if b == 0 {
                return Err(Fault::ZeroDivision);
            }
            Ok(Value::Float(a as f64 / b as f64))
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(Fault::ZeroDivision);
            }
            let q = a.checked_div(b).ok_or(Fault::Overflow)?;
            let floored = if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q };
            Ok(Value::Int(floored))
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(Fault::ZeroDivision);
            }
            let r = a.checked_rem(b).unwrap_or(0);
            let adjusted = if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r };
            Ok(Value::Int(adjusted))
        }
        BinOp::Pow => {
            if b < 0 {
                return float_op(op, a as f64, b as f64);
            }
            let exponent = u32::try_from(b).map_err(|_| Fault::Overflow)?;
            checked(a.checked_pow(exponent))
        }
    }
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<Value, Fault> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(Fault::ZeroDivision);
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(Fault::ZeroDivision);
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(Fault::ZeroDivision);
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(Fault::ZeroDivision);
            }
            let result = a.powf(b);
            if result.is_nan() && !a.is_nan() && !b.is_nan() {
                return Err(Fault::Value(
                    "complex results are not supported".to_string(),
                ));
            }
            if result.is_infinite() && a.is_finite() && b.is_finite() {
                return Err(Fault::Overflow);
            }
            result
        }
    };
    Ok(Value::Float(value))
}

/// Datetime and timedelta arithmetic.
fn calendar_op(op: BinOp, left: &Value, right: &Value) -> Result<Value, Fault> {
    match (op, left, right) {
        (BinOp::Add, Value::DateTime(dt), Value::TimeDelta(us))
        | (BinOp::Add, Value::TimeDelta(us), Value::DateTime(dt)) => time::shift(dt, *us),
        (BinOp::Sub, Value::DateTime(dt), Value::TimeDelta(us)) => {
            time::shift(dt, us.checked_neg().ok_or(Fault::Overflow)?)
        }
        (BinOp::Sub, Value::DateTime(a), Value::DateTime(b)) => time::difference(a, b),
        (BinOp::Add, Value::TimeDelta(a), Value::TimeDelta(b)) => {
            time::timedelta(a.checked_add(*b).ok_or(Fault::Overflow)?)
        }
        (BinOp::Sub, Value::TimeDelta(a), Value::TimeDelta(b)) => {
            time::timedelta(a.checked_sub(*b).ok_or(Fault::Overflow)?)
        }
        (BinOp::Mul, Value::TimeDelta(us), n) | (BinOp::Mul, n, Value::TimeDelta(us))
            if n.is_number() =>
        {
            match n.as_int() {
                Some(k) => time::timedelta(us.checked_mul(k).ok_or(Fault::Overflow)?),
                None => scaled_delta(*us as f64 * n.as_number().unwrap_or(0.0)),
            }
        }
        (BinOp::Div, Value::TimeDelta(a), Value::TimeDelta(b)) => {
            if *b == 0 {
                return Err(Fault::ZeroDivision);
            }
            Ok(Value::Float(*a as f64 / *b as f64))
        }
        (BinOp::Div, Value::TimeDelta(us), n) if n.is_number() => {
            let divisor = n.as_number().unwrap_or(0.0);
            if divisor == 0.0 {
                return Err(Fault::ZeroDivision);
            }
            scaled_delta(*us as f64 / divisor)
        }
        (BinOp::FloorDiv, Value::TimeDelta(a), Value::TimeDelta(b)) => {
            int_op(BinOp::FloorDiv, *a, *b)
        }
        (BinOp::FloorDiv, Value::TimeDelta(us), n) if n.as_int().is_some() => {
            let divisor = n.as_int().unwrap_or(0);
            match int_op(BinOp::FloorDiv, *us, divisor)? {
                Value::Int(v) => time::timedelta(v),
                other => Ok(other),
            }
        }
        (BinOp::Mod, Value::TimeDelta(a), Value::TimeDelta(b)) => {
            match int_op(BinOp::Mod, *a, *b)? {
                Value::Int(v) => time::timedelta(v),
                other => Ok(other),
            }
        }
        _ => Err(unsupported(op, left, right)),
    }
}

fn scaled_delta(micros: f64) -> Result<Value, Fault> {
    if !micros.is_finite() || micros.abs() > i64::MAX as f64 {
        return Err(Fault::Overflow);
    }
    time::timedelta(micros.round_ties_even() as i64)
}

/// Evaluate one link of a (possibly chained) comparison.
pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, Fault> {
    let ordered = |want: fn(Ordering) -> bool| -> Result<bool, Fault> {
        Ok(left.py_cmp(right)?.is_some_and(want))
    };
    match op {
        CmpOp::Eq => Ok(left.py_eq(right)),
        CmpOp::NotEq => Ok(!left.py_eq(right)),
        CmpOp::Lt => ordered(Ordering::is_lt),
        CmpOp::LtE => ordered(Ordering::is_le),
        CmpOp::Gt => ordered(Ordering::is_gt),
        CmpOp::GtE => ordered(Ordering::is_ge),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|found| !found),
        CmpOp::Is => Ok(identical(left, right)),
        CmpOp::IsNot => Ok(!identical(left, right)),
    }
}

/// Identity approximated as same variant and equal value.
fn identical(left: &Value, right: &Value) -> bool {
    std::mem::discriminant(left) == std::mem::discriminant(right) && left.py_eq(right)
}

pub fn contains(container: &Value, item: &Value) -> Result<bool, Fault> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(Fault::Type(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) | Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(item))),
        Value::Dict(entries) => Ok(dict_get(entries, item).is_some()),
        other => Err(Fault::Type(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(op: BinOp, a: Value, b: Value) -> Result<Value, Fault> {
        binary(op, &a, &b, 1_000)
    }

    #[test]
    fn integer_division_floors_toward_negative_infinity() {
        assert_eq!(bin(BinOp::FloorDiv, Value::Int(-7), Value::Int(2)), Ok(Value::Int(-4)));
        assert_eq!(bin(BinOp::Mod, Value::Int(-7), Value::Int(2)), Ok(Value::Int(1)));
        assert_eq!(bin(BinOp::Mod, Value::Int(7), Value::Int(-2)), Ok(Value::Int(-1)));
    }

    #[test]
    fn true_division_always_yields_float() {
        assert_eq!(bin(BinOp::Div, Value::Int(6), Value::Int(3)), Ok(Value::Float(2.0)));
        assert_eq!(
            bin(BinOp::Div, Value::Int(1), Value::Int(0)),
            Err(Fault::ZeroDivision)
        );
        assert_eq!(
            bin(BinOp::Mod, Value::Float(1.0), Value::Float(0.0)),
            Err(Fault::ZeroDivision)
        );
    }

    #[test]
    fn integer_overflow_is_a_fault() {
        assert_eq!(
            bin(BinOp::Pow, Value::Int(10), Value::Int(30)),
            Err(Fault::Overflow)
        );
        assert_eq!(
            bin(BinOp::Mul, Value::Int(i64::MAX), Value::Int(2)),
            Err(Fault::Overflow)
        );
        assert_eq!(bin(BinOp::Pow, Value::Int(2), Value::Int(-1)), Ok(Value::Float(0.5)));
    }

    #[test]
    fn repetition_is_bounded() {
        assert_eq!(
            bin(BinOp::Mul, Value::Str("ab".to_string()), Value::Int(2)),
            Ok(Value::Str("abab".to_string()))
        );
        let err = bin(BinOp::Mul, Value::list(vec![Value::Int(0)]), Value::Int(5_000))
            .expect_err("too large");
        assert!(matches!(err, Fault::TooLarge(_)));
        assert_eq!(
            bin(BinOp::Mul, Value::Int(2), Value::list(vec![Value::Int(7)])),
            Ok(Value::list(vec![Value::Int(7), Value::Int(7)]))
        );
    }

    #[test]
    fn repeating_long_strings_is_bounded_by_expanded_size() {
        let word = Value::Str("x".repeat(900));
        let err = bin(BinOp::Mul, Value::list(vec![word]), Value::Int(900))
            .expect_err("expanded too far");
        assert!(err.to_string().contains("list expanding to 810000 elements"));
    }

    #[test]
    fn mixed_types_are_type_errors() {
        let err = bin(BinOp::Add, Value::Int(1), Value::Str("a".to_string())).expect_err("type");
        assert_eq!(
            err.to_string(),
            "unsupported operand type(s) for +: 'int' and 'str'"
        );
    }

    #[test]
    fn timedelta_arithmetic() {
        let hour = Value::TimeDelta(3_600_000_000);
        assert_eq!(
            bin(BinOp::Mul, hour.clone(), Value::Int(3)),
            Ok(Value::TimeDelta(10_800_000_000))
        );
        assert_eq!(
            bin(BinOp::Div, Value::TimeDelta(5_400_000_000), hour),
            Ok(Value::Float(1.5))
        );
    }

    #[test]
    fn membership_and_identity() {
        let items = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(compare(CmpOp::In, &Value::Float(2.0), &items), Ok(true));
        assert_eq!(compare(CmpOp::Is, &Value::None, &Value::None), Ok(true));
        assert_eq!(compare(CmpOp::IsNot, &Value::Int(0), &Value::None), Ok(true));
        assert!(compare(CmpOp::In, &Value::Int(1), &Value::Str("1".to_string())).is_err());
    }
}
