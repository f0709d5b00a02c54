//! The capability table: every callable a script can reach.
//!
//! Names not in this table do not exist inside a script. Well-known escape
//! hatches (`open`, `eval`, `__import__`, ...) are reported as denied rather
//! than undefined so the failure is explicit.

use std::rc::Rc;

use crate::sandbox::ast::BinOp;
use crate::sandbox::error::Fault;
use crate::sandbox::format::{format_value, str_format};
use crate::sandbox::ops::{binary, check_len};
use crate::sandbox::time;
use crate::sandbox::value::{Items, Value, dict_get, dict_set, exclusive};

const DENIED_NAMES: [&str; 26] = [
    "open",
    "exec",
    "eval",
    "compile",
    "__import__",
    "__builtins__",
    "print",
    "input",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "hasattr",
    "exit",
    "quit",
    "breakpoint",
    "help",
    "dir",
    "type",
    "object",
    "super",
    "memoryview",
    "classmethod",
    "staticmethod",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Abs,
    Int,
    Float,
    Str,
    Len,
    Min,
    Max,
    Sum,
    Round,
    Range,
    List,
    Dict,
    Bool,
    Sorted,
    DateTime,
    TimeDelta,
    Math(MathFn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFn {
    Sqrt,
    Floor,
    Ceil,
    Trunc,
    Fabs,
    Pow,
    Exp,
    Log,
    Log10,
    Log2,
    Gcd,
    Factorial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Math,
    DateTime,
}

impl Module {
    pub fn name(self) -> &'static str {
        match self {
            Module::Math => "math",
            Module::DateTime => "datetime",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "math" => Some(Module::Math),
            "datetime" => Some(Module::DateTime),
            _ => None,
        }
    }

    /// Member lookup for `module.name` and `from module import name`.
    pub fn member(self, name: &str) -> Option<Value> {
        match self {
            Module::DateTime => match name {
                "datetime" => Some(Value::Builtin(Builtin::DateTime)),
                "timedelta" => Some(Value::Builtin(Builtin::TimeDelta)),
                _ => None,
            },
            Module::Math => {
                let constant = match name {
                    "pi" => Some(std::f64::consts::PI),
                    "e" => Some(std::f64::consts::E),
                    "tau" => Some(std::f64::consts::TAU),
                    "inf" => Some(f64::INFINITY),
                    _ => None,
                };
                if let Some(constant) = constant {
                    return Some(Value::Float(constant));
                }
                let function = match name {
                    "sqrt" => MathFn::Sqrt,
                    "floor" => MathFn::Floor,
                    "ceil" => MathFn::Ceil,
                    "trunc" => MathFn::Trunc,
                    "fabs" => MathFn::Fabs,
                    "pow" => MathFn::Pow,
                    "exp" => MathFn::Exp,
                    "log" => MathFn::Log,
                    "log10" => MathFn::Log10,
                    "log2" => MathFn::Log2,
                    "gcd" => MathFn::Gcd,
                    "factorial" => MathFn::Factorial,
                    _ => return None,
                };
                Some(Value::Builtin(Builtin::Math(function)))
            }
        }
    }
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Abs => "abs",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Str => "str",
            Builtin::Len => "len",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sum => "sum",
            Builtin::Round => "round",
            Builtin::Range => "range",
            Builtin::List => "list",
            Builtin::Dict => "dict",
            Builtin::Bool => "bool",
            Builtin::Sorted => "sorted",
            Builtin::DateTime => "datetime",
            Builtin::TimeDelta => "timedelta",
            Builtin::Math(function) => match function {
                MathFn::Sqrt => "sqrt",
                MathFn::Floor => "floor",
                MathFn::Ceil => "ceil",
                MathFn::Trunc => "trunc",
                MathFn::Fabs => "fabs",
                MathFn::Pow => "pow",
                MathFn::Exp => "exp",
                MathFn::Log => "log",
                MathFn::Log10 => "log10",
                MathFn::Log2 => "log2",
                MathFn::Gcd => "gcd",
                MathFn::Factorial => "factorial",
            },
        }
    }

    pub fn describe(self) -> String {
        match self {
            Builtin::Int
            | Builtin::Float
            | Builtin::Str
            | Builtin::List
            | Builtin::Dict
            | Builtin::Bool => format!("<class '{}'>", self.name()),
            Builtin::DateTime | Builtin::TimeDelta => {
                format!("<class 'datetime.{}'>", self.name())
            }
            _ => format!("<built-in function {}>", self.name()),
        }
    }
}

/// Names visible to every script before it binds anything itself.
pub fn global(name: &str) -> Option<Value> {
    let builtin = match name {
        "abs" => Builtin::Abs,
        "int" => Builtin::Int,
        "float" => Builtin::Float,
        "str" => Builtin::Str,
        "len" => Builtin::Len,
        "min" => Builtin::Min,
        "max" => Builtin::Max,
        "sum" => Builtin::Sum,
        "round" => Builtin::Round,
        "range" => Builtin::Range,
        "list" => Builtin::List,
        "dict" => Builtin::Dict,
        "bool" => Builtin::Bool,
        "sorted" => Builtin::Sorted,
        "datetime" => Builtin::DateTime,
        "timedelta" => Builtin::TimeDelta,
        "math" => return Some(Value::Module(Module::Math)),
        _ => return None,
    };
    Some(Value::Builtin(builtin))
}

pub fn is_denied(name: &str) -> bool {
    DENIED_NAMES.contains(&name) || (name.starts_with("__") && name.ends_with("__"))
}

/// Bind positional and keyword arguments to named parameters. The first
/// `required` parameters must be supplied.
pub fn bind(
    func: &str,
    params: &[&str],
    required: usize,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Vec<Option<Value>>, Fault> {
    if args.len() > params.len() {
        return Err(Fault::Type(format!(
            "{func}() takes at most {} argument(s) ({} given)",
            params.len(),
            args.len()
        )));
    }
    let mut slots: Vec<Option<Value>> = args.into_iter().map(Some).collect();
    slots.resize(params.len(), None);
    for (name, value) in kwargs {
        let index = params.iter().position(|p| *p == name).ok_or_else(|| {
            Fault::Type(format!(
                "{func}() got an unexpected keyword argument '{name}'"
            ))
        })?;
        if slots[index].is_some() {
            return Err(Fault::Type(format!(
                "{func}() got multiple values for argument '{name}'"
            )));
        }
        slots[index] = Some(value);
    }
    if let Some(missing) = params
        .iter()
        .take(required)
        .zip(&slots)
        .find(|(_, slot)| slot.is_none())
    {
        return Err(Fault::Type(format!(
            "{func}() missing required argument '{}'",
            missing.0
        )));
    }
    Ok(slots)
}

/// Materialize an iterable.
pub fn iterate(value: &Value) -> Result<Vec<Value>, Fault> {
    match value {
        Value::List(items) | Value::Tuple(items) => Ok(items.to_vec()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Dict(entries) => Ok(entries.iter().map(|(k, _)| k.clone()).collect()),
        other => Err(Fault::Type(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn expect_int(func: &str, value: &Value) -> Result<i64, Fault> {
    value.as_int().ok_or_else(|| {
        Fault::Type(format!(
            "{func}() expected an integer, got '{}'",
            value.type_name()
        ))
    })
}

fn expect_number(func: &str, value: &Value) -> Result<f64, Fault> {
    value.as_number().ok_or_else(|| {
        Fault::Type(format!(
            "{func}() expected a number, got '{}'",
            value.type_name()
        ))
    })
}

/// Convert a float to an int, rejecting NaN, infinities and out-of-range
/// values.
pub fn float_to_int(value: f64) -> Result<i64, Fault> {
    if value.is_nan() {
        return Err(Fault::Value("cannot convert float NaN to integer".to_string()));
    }
    if value.is_infinite() || value.abs() >= 9.223_372_036_854_775e18 {
        return Err(Fault::Overflow);
    }
    Ok(value as i64)
}

pub fn call_value(
    callee: &Value,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    max_len: usize,
) -> Result<Value, Fault> {
    match callee {
        Value::Builtin(builtin) => call_builtin(*builtin, args, kwargs, max_len),
        other => Err(Fault::Type(format!(
            "'{}' object is not callable",
            other.type_name()
        ))),
    }
}

pub fn call_builtin(
    builtin: Builtin,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    max_len: usize,
) -> Result<Value, Fault> {
    let name = builtin.name();
    match builtin {
        Builtin::Abs => {
            let slots = bind(name, &["x"], 1, args, kwargs)?;
            match arg(&slots, 0) {
                Value::Int(v) => v.checked_abs().map(Value::Int).ok_or(Fault::Overflow),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Float(v) => Ok(Value::Float(v.abs())),
                Value::TimeDelta(us) => us.checked_abs().map(Value::TimeDelta).ok_or(Fault::Overflow),
                other => Err(bad_operand(name, other)),
            }
        }
        Builtin::Int => {
            let slots = bind(name, &["x"], 0, args, kwargs)?;
            match slots[0].as_ref().unwrap_or(&Value::Int(0)) {
                Value::Int(v) => Ok(Value::Int(*v)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Float(v) => float_to_int(v.trunc()).map(Value::Int),
                Value::Str(s) => s
                    .trim()
                    .replace('_', "")
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| {
                        Fault::Value(format!("invalid literal for int() with base 10: '{s}'"))
                    }),
                other => Err(bad_operand(name, other)),
            }
        }
        Builtin::Float => {
            let slots = bind(name, &["x"], 0, args, kwargs)?;
            match slots[0].as_ref().unwrap_or(&Value::Float(0.0)) {
                Value::Str(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| Fault::Value(format!("could not convert string to float: '{s}'"))),
                other => other
                    .as_number()
                    .map(Value::Float)
                    .ok_or_else(|| bad_operand(name, other)),
            }
        }
        Builtin::Str => {
            let slots = bind(name, &["object"], 0, args, kwargs)?;
            let text = slots[0].as_ref().map(ToString::to_string).unwrap_or_default();
            check_len(text.chars().count(), max_len, "string")?;
            Ok(Value::Str(text))
        }
        Builtin::Bool => {
            let slots = bind(name, &["x"], 0, args, kwargs)?;
            Ok(Value::Bool(slots[0].as_ref().is_some_and(Value::truthy)))
        }
        Builtin::Len => {
            let slots = bind(name, &["obj"], 1, args, kwargs)?;
            let len = match arg(&slots, 0) {
                Value::Str(s) => s.chars().count(),
                Value::List(items) | Value::Tuple(items) => items.len(),
                Value::Dict(entries) => entries.len(),
                other => {
                    return Err(Fault::Type(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )));
                }
            };
            Ok(Value::Int(i64::try_from(len).map_err(|_| Fault::Overflow)?))
        }
        Builtin::Min | Builtin::Max => extremum(builtin, args, kwargs, max_len),
        Builtin::Sum => {
            let slots = bind(name, &["iterable", "start"], 1, args, kwargs)?;
            let mut total = slots[1].clone().unwrap_or(Value::Int(0));
            if matches!(total, Value::Str(_)) {
                return Err(Fault::Type(
                    "sum() can't sum strings, use ''.join(seq) instead".to_string(),
                ));
            }
            for item in iterate(arg(&slots, 0))? {
                total = binary(BinOp::Add, &total, &item, max_len)?;
            }
            Ok(total)
        }
        Builtin::Round => {
            let slots = bind(name, &["number", "ndigits"], 1, args, kwargs)?;
            let digits = match &slots[1] {
                None | Some(Value::None) => None,
                Some(value) => Some(expect_int(name, value)?),
            };
            round(arg(&slots, 0), digits)
        }
        Builtin::Range => range(args, kwargs, max_len),
        Builtin::List => {
            let slots = bind(name, &["iterable"], 0, args, kwargs)?;
            match &slots[0] {
                None => Ok(Value::list(Vec::new())),
                Some(value) => Ok(Value::list(iterate(value)?)),
            }
        }
        Builtin::Dict => {
            let mut entries = Vec::new();
            if args.len() > 1 {
                return Err(Fault::Type("dict expected at most 1 argument".to_string()));
            }
            if let Some(source) = args.first() {
                match source {
                    Value::Dict(existing) => entries = existing.to_vec(),
                    other => {
                        for pair in iterate(other)? {
                            let items = iterate(&pair)?;
                            let [key, value]: [Value; 2] = items.try_into().map_err(|_| {
                                Fault::Value(
                                    "dictionary update sequence element has wrong length"
                                        .to_string(),
                                )
                            })?;
                            dict_set(&mut entries, key, value)?;
                        }
                    }
                }
            }
            for (key, value) in kwargs {
                dict_set(&mut entries, Value::Str(key), value)?;
            }
            check_len(entries.len(), max_len, "dict")?;
            Ok(Value::dict(entries))
        }
        Builtin::Sorted => {
            let slots = bind(name, &["iterable", "key", "reverse"], 1, args, kwargs)?;
            let items = iterate(arg(&slots, 0))?;
            let reverse = slots[2].as_ref().is_some_and(Value::truthy);
            let sorted = sort_values(items, slots[1].as_ref(), reverse, max_len)?;
            Ok(Value::list(sorted))
        }
        Builtin::DateTime => time::make_datetime(args, kwargs),
        Builtin::TimeDelta => time::make_timedelta(args, kwargs),
        Builtin::Math(function) => call_math(function, args, kwargs),
    }
}

fn arg(slots: &[Option<Value>], index: usize) -> &Value {
    slots
        .get(index)
        .and_then(Option::as_ref)
        .unwrap_or(&Value::None)
}

fn bad_operand(func: &str, value: &Value) -> Fault {
    Fault::Type(format!(
        "bad operand type for {func}(): '{}'",
        value.type_name()
    ))
}

fn extremum(
    builtin: Builtin,
    args: Vec<Value>,
    mut kwargs: Vec<(String, Value)>,
    max_len: usize,
) -> Result<Value, Fault> {
    let name = builtin.name();
    let mut key = None;
    let mut default = None;
    for (kw, value) in kwargs.drain(..) {
        match kw.as_str() {
            "key" => key = Some(value),
            "default" => default = Some(value),
            other => {
                return Err(Fault::Type(format!(
                    "{name}() got an unexpected keyword argument '{other}'"
                )));
            }
        }
    }
    let candidates = match args.len() {
        0 => {
            return Err(Fault::Type(format!(
                "{name} expected at least 1 argument, got 0"
            )));
        }
        1 => iterate(&args[0])?,
        _ => args,
    };
    let mut best: Option<(Value, Value)> = None;
    for candidate in candidates {
        let rank = match &key {
            Some(Value::None) | None => candidate.clone(),
            Some(func) => call_value(func, vec![candidate.clone()], Vec::new(), max_len)?,
        };
        let replace = match &best {
            None => true,
            Some((best_rank, _)) => {
                let ordering = rank.py_cmp(best_rank)?;
                match builtin {
                    Builtin::Min => ordering == Some(std::cmp::Ordering::Less),
                    _ => ordering == Some(std::cmp::Ordering::Greater),
                }
            }
        };
        if replace {
            best = Some((rank, candidate));
        }
    }
    match (best, default) {
        (Some((_, value)), _) => Ok(value),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(Fault::Value(format!("{name}() arg is an empty sequence"))),
    }
}

fn round(value: &Value, digits: Option<i64>) -> Result<Value, Fault> {
    match (value, digits) {
        (Value::Int(_) | Value::Bool(_), None) => Ok(Value::Int(value.as_int().unwrap_or(0))),
        (Value::Int(_) | Value::Bool(_), Some(d)) if d >= 0 => {
            Ok(Value::Int(value.as_int().unwrap_or(0)))
        }
        (Value::Int(v), Some(d)) => {
            let factor = 10f64.powi(i32::try_from(d.saturating_neg().min(308)).unwrap_or(308));
            float_to_int((*v as f64 / factor).round_ties_even() * factor).map(Value::Int)
        }
        (Value::Float(v), None) => float_to_int(v.round_ties_even()).map(Value::Int),
        (Value::Float(v), Some(d)) => {
            // Beyond these the result is all zeros or already exact.
            if d < -308 {
                return Ok(Value::Float(0.0f64.copysign(*v)));
            }
            if d > 308 {
                return Ok(Value::Float(*v));
            }
            let d = i32::try_from(d).unwrap_or(0);
            let rounded = if d >= 0 {
                let factor = 10f64.powi(d);
                let scaled = v * factor;
                if !scaled.is_finite() {
                    return Ok(Value::Float(*v));
                }
                scaled.round_ties_even() / factor
            } else {
                let factor = 10f64.powi(-d);
                (v / factor).round_ties_even() * factor
            };
            if rounded.is_finite() {
                Ok(Value::Float(rounded))
            } else {
                Err(Fault::Overflow)
            }
        }
        (other, _) => Err(Fault::Type(format!(
            "type {} doesn't define __round__ method",
            other.type_name()
        ))),
    }
}

fn range(args: Vec<Value>, kwargs: Vec<(String, Value)>, max_len: usize) -> Result<Value, Fault> {
    if !kwargs.is_empty() {
        return Err(Fault::Type("range() takes no keyword arguments".to_string()));
    }
    let ints = args
        .iter()
        .map(|v| expect_int("range", v))
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => {
            return Err(Fault::Type(format!(
                "range expected 1 to 3 arguments, got {}",
                ints.len()
            )));
        }
    };
    if step == 0 {
        return Err(Fault::Value("range() arg 3 must not be zero".to_string()));
    }
    let span = i128::from(stop) - i128::from(start);
    let step_wide = i128::from(step);
    let count = if (step > 0 && span > 0) || (step < 0 && span < 0) {
        (span.abs() + step_wide.abs() - 1) / step_wide.abs()
    } else {
        0
    };
    let count = usize::try_from(count).unwrap_or(usize::MAX);
    check_len(count, max_len, "range")?;
    let items = (0..count)
        .map(|i| Value::Int((i128::from(start) + i as i128 * step_wide) as i64))
        .collect();
    Ok(Value::list(items))
}

/// Stable merge sort with a fallible comparison. `key` must be a callable
/// capability or `None`.
pub fn sort_values(
    items: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
    max_len: usize,
) -> Result<Vec<Value>, Fault> {
    let ranks = match key {
        None | Some(Value::None) => items.clone(),
        Some(func) => items
            .iter()
            .map(|item| call_value(func, vec![item.clone()], Vec::new(), max_len))
            .collect::<Result<Vec<_>, _>>()?,
    };
    let mut order: Vec<usize> = (0..items.len()).collect();
    let less = |a: usize, b: usize| -> Result<bool, Fault> {
        let (x, y) = if reverse { (b, a) } else { (a, b) };
        Ok(ranks[x].py_cmp(&ranks[y])? == Some(std::cmp::Ordering::Less))
    };
    merge_sort(&mut order, &less)?;
    Ok(order.into_iter().map(|i| items[i].clone()).collect())
}

fn merge_sort(
    order: &mut Vec<usize>,
    less: &dyn Fn(usize, usize) -> Result<bool, Fault>,
) -> Result<(), Fault> {
    if order.len() <= 1 {
        return Ok(());
    }
    let mut right = order.split_off(order.len() / 2);
    merge_sort(order, less)?;
    merge_sort(&mut right, less)?;
    let left = std::mem::take(order);
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if less(right[j], left[i])? {
            order.push(right[j]);
            j += 1;
        } else {
            order.push(left[i]);
            i += 1;
        }
    }
    order.extend_from_slice(&left[i..]);
    order.extend_from_slice(&right[j..]);
    Ok(())
}

fn call_math(
    function: MathFn,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, Fault> {
    let name = Builtin::Math(function).name();
    let domain = || Fault::Value("math domain error".to_string());
    match function {
        MathFn::Pow => {
            let slots = bind(name, &["x", "y"], 2, args, kwargs)?;
            let x = expect_number(name, arg(&slots, 0))?;
            let y = expect_number(name, arg(&slots, 1))?;
            let result = x.powf(y);
            if result.is_nan() && !x.is_nan() && !y.is_nan() {
                return Err(domain());
            }
            finite(result, x.is_finite() && y.is_finite())
        }
        MathFn::Log => {
            let slots = bind(name, &["x", "base"], 1, args, kwargs)?;
            let x = expect_number(name, arg(&slots, 0))?;
            if x <= 0.0 {
                return Err(domain());
            }
            match &slots[1] {
                None => Ok(Value::Float(x.ln())),
                Some(base) => {
                    let base = expect_number(name, base)?;
                    if base <= 0.0 || base == 1.0 {
                        return Err(domain());
                    }
                    Ok(Value::Float(x.ln() / base.ln()))
                }
            }
        }
        MathFn::Gcd => {
            let mut acc: i64 = 0;
            if !kwargs.is_empty() {
                return Err(Fault::Type("gcd() takes no keyword arguments".to_string()));
            }
            for value in &args {
                let mut a = acc.unsigned_abs();
                let mut b = expect_int(name, value)?.unsigned_abs();
                while b != 0 {
                    (a, b) = (b, a % b);
                }
                acc = i64::try_from(a).map_err(|_| Fault::Overflow)?;
            }
            Ok(Value::Int(acc))
        }
        MathFn::Factorial => {
            let slots = bind(name, &["n"], 1, args, kwargs)?;
            let n = expect_int(name, arg(&slots, 0))?;
            if n < 0 {
                return Err(Fault::Value(
                    "factorial() not defined for negative values".to_string(),
                ));
            }
            (1..=n)
                .try_fold(1i64, i64::checked_mul)
                .map(Value::Int)
                .ok_or(Fault::Overflow)
        }
        _ => {
            let slots = bind(name, &["x"], 1, args, kwargs)?;
            let value = arg(&slots, 0);
            if let (MathFn::Floor | MathFn::Ceil | MathFn::Trunc, Some(v)) =
                (function, value.as_int())
            {
                return Ok(Value::Int(v));
            }
            let x = expect_number(name, value)?;
            match function {
                MathFn::Sqrt if x < 0.0 => Err(domain()),
                MathFn::Sqrt => Ok(Value::Float(x.sqrt())),
                MathFn::Floor => float_to_int(x.floor()).map(Value::Int),
                MathFn::Ceil => float_to_int(x.ceil()).map(Value::Int),
                MathFn::Trunc => float_to_int(x.trunc()).map(Value::Int),
                MathFn::Fabs => Ok(Value::Float(x.abs())),
                MathFn::Exp => finite(x.exp(), x.is_finite()),
                MathFn::Log10 | MathFn::Log2 if x <= 0.0 => Err(domain()),
                MathFn::Log10 => Ok(Value::Float(x.log10())),
                MathFn::Log2 => Ok(Value::Float(x.log2())),
                MathFn::Pow | MathFn::Log | MathFn::Gcd | MathFn::Factorial => Err(domain()),
            }
        }
    }
}

/// A finite input that produced an infinite result overflowed.
fn finite(result: f64, inputs_finite: bool) -> Result<Value, Fault> {
    if result.is_infinite() && inputs_finite {
        return Err(Fault::Value("math range error".to_string()));
    }
    Ok(Value::Float(result))
}

/// Attribute read without a call (`td.days`, `math.pi`).
pub fn get_attribute(value: &Value, name: &str) -> Result<Value, Fault> {
    let found = match value {
        Value::Module(module) => module.member(name),
        Value::DateTime(dt) => time::datetime_attribute(dt, name),
        Value::TimeDelta(us) => time::timedelta_attribute(*us, name),
        _ => None,
    };
    found.ok_or_else(|| no_attribute(value, name))
}

fn no_attribute(value: &Value, name: &str) -> Fault {
    if name.starts_with("__") {
        return Fault::Denied(format!("attribute '{name}'"));
    }
    match value {
        Value::Module(module) => Fault::Attribute(format!(
            "module '{}' has no attribute '{name}'",
            module.name()
        )),
        other => Fault::Attribute(format!(
            "'{}' object has no attribute '{name}'",
            other.type_name()
        )),
    }
}

/// Call `receiver.name(...)`. Mutating list and dict methods update
/// `receiver` in place.
pub fn call_method(
    receiver: &mut Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    max_len: usize,
) -> Result<Value, Fault> {
    if name.starts_with("__") {
        return Err(Fault::Denied(format!("attribute '{name}'")));
    }
    match receiver {
        Value::Module(module) => {
            let member = module
                .member(name)
                .ok_or_else(|| no_attribute(&Value::Module(*module), name))?;
            call_value(&member, args, kwargs, max_len)
        }
        Value::Builtin(Builtin::DateTime) => time::class_method(name, args, kwargs),
        Value::DateTime(dt) => time::datetime_method(dt, name, args, kwargs),
        Value::TimeDelta(us) => time::timedelta_method(*us, name, args, kwargs),
        Value::Str(s) => str_method(s, name, args, kwargs, max_len),
        Value::List(items) => list_method(items, name, args, kwargs, max_len),
        Value::Dict(entries) => dict_method(entries, name, args, kwargs, max_len),
        Value::Tuple(items) => match name {
            "index" | "count" => sequence_query(items.as_slice(), name, args, kwargs),
            _ => Err(no_attribute(&Value::tuple(Vec::new()), name)),
        },
        other => Err(no_attribute(other, name)),
    }
}

fn expect_str<'a>(func: &str, value: &'a Value) -> Result<&'a str, Fault> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(Fault::Type(format!(
            "{func}() argument must be str, not '{}'",
            other.type_name()
        ))),
    }
}

fn str_method(
    s: &str,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    max_len: usize,
) -> Result<Value, Fault> {
    let text = Value::Str;
    match name {
        "format" => Ok(text(str_format(s, &args, &kwargs)?)),
        "upper" => {
            bind(name, &[], 0, args, kwargs)?;
            Ok(text(s.to_uppercase()))
        }
        "lower" => {
            bind(name, &[], 0, args, kwargs)?;
            Ok(text(s.to_lowercase()))
        }
        "title" => {
            bind(name, &[], 0, args, kwargs)?;
            let mut out = String::with_capacity(s.len());
            let mut at_word_start = true;
            for c in s.chars() {
                if at_word_start {
                    out.extend(c.to_uppercase());
                } else {
                    out.extend(c.to_lowercase());
                }
                at_word_start = !c.is_alphanumeric();
            }
            Ok(text(out))
        }
        "strip" | "lstrip" | "rstrip" => {
            let slots = bind(name, &["chars"], 0, args, kwargs)?;
            let chars: Option<Vec<char>> = match &slots[0] {
                None | Some(Value::None) => None,
                Some(value) => Some(expect_str(name, value)?.chars().collect()),
            };
            let matches = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            let stripped = match name {
                "strip" => s.trim_matches(matches),
                "lstrip" => s.trim_start_matches(matches),
                _ => s.trim_end_matches(matches),
            };
            Ok(text(stripped.to_string()))
        }
        "split" => {
            let slots = bind(name, &["sep"], 0, args, kwargs)?;
            let parts: Vec<Value> = match &slots[0] {
                None | Some(Value::None) => s.split_whitespace().map(|p| text(p.to_string())).collect(),
                Some(sep) => {
                    let sep = expect_str(name, sep)?;
                    if sep.is_empty() {
                        return Err(Fault::Value("empty separator".to_string()));
                    }
                    s.split(sep).map(|p| text(p.to_string())).collect()
                }
            };
            check_len(parts.len(), max_len, "list")?;
            Ok(Value::list(parts))
        }
        "replace" => {
            let slots = bind(name, &["old", "new"], 2, args, kwargs)?;
            let old = expect_str(name, arg(&slots, 0))?;
            let new = expect_str(name, arg(&slots, 1))?;
            let replaced = s.replace(old, new);
            check_len(replaced.chars().count(), max_len, "string")?;
            Ok(text(replaced))
        }
        "join" => {
            let slots = bind(name, &["iterable"], 1, args, kwargs)?;
            let pieces = iterate(arg(&slots, 0))?
                .iter()
                .map(|item| expect_str(name, item).map(str::to_string))
                .collect::<Result<Vec<_>, _>>()?;
            let joined = pieces.join(s);
            check_len(joined.chars().count(), max_len, "string")?;
            Ok(text(joined))
        }
        "startswith" | "endswith" => {
            let slots = bind(name, &["prefix"], 1, args, kwargs)?;
            let candidates = match arg(&slots, 0) {
                Value::Tuple(options) => options.to_vec(),
                other => vec![other.clone()],
            };
            let mut found = false;
            for candidate in &candidates {
                let needle = expect_str(name, candidate)?;
                found |= if name == "startswith" {
                    s.starts_with(needle)
                } else {
                    s.ends_with(needle)
                };
            }
            Ok(Value::Bool(found))
        }
        "count" => {
            let slots = bind(name, &["sub"], 1, args, kwargs)?;
            let needle = expect_str(name, arg(&slots, 0))?;
            let count = if needle.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(needle).count()
            };
            Ok(Value::Int(i64::try_from(count).map_err(|_| Fault::Overflow)?))
        }
        "find" => {
            let slots = bind(name, &["sub"], 1, args, kwargs)?;
            let needle = expect_str(name, arg(&slots, 0))?;
            let index = s
                .find(needle)
                .map_or(-1, |byte| s[..byte].chars().count() as i64);
            Ok(Value::Int(index))
        }
        "zfill" => {
            let slots = bind(name, &["width"], 1, args, kwargs)?;
            let width = usize::try_from(expect_int(name, arg(&slots, 0))?).unwrap_or(0);
            check_len(width, max_len, "string")?;
            let len = s.chars().count();
            if len >= width {
                return Ok(text(s.to_string()));
            }
            let (sign, digits) = match s.strip_prefix(|c: char| c == '-' || c == '+') {
                Some(rest) => (&s[..1], rest),
                None => ("", s),
            };
            Ok(text(format!("{sign}{}{digits}", "0".repeat(width - len))))
        }
        "isdigit" => {
            bind(name, &[], 0, args, kwargs)?;
            Ok(Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())))
        }
        "isalpha" => {
            bind(name, &[], 0, args, kwargs)?;
            Ok(Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic)))
        }
        _ => Err(no_attribute(&Value::Str(String::new()), name)),
    }
}

fn sequence_query(
    items: &[Value],
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, Fault> {
    let slots = bind(name, &["value"], 1, args, kwargs)?;
    let needle = arg(&slots, 0);
    if name == "count" {
        let count = items.iter().filter(|item| item.py_eq(needle)).count();
        return Ok(Value::Int(i64::try_from(count).map_err(|_| Fault::Overflow)?));
    }
    items
        .iter()
        .position(|item| item.py_eq(needle))
        .map(|i| Value::Int(i as i64))
        .ok_or_else(|| Fault::Value(format!("{} is not in list", needle.repr())))
}

fn list_method(
    items: &mut Rc<Items<Value>>,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    max_len: usize,
) -> Result<Value, Fault> {
    match name {
        "index" | "count" => sequence_query(items.as_slice(), name, args, kwargs),
        "copy" => {
            bind(name, &[], 0, args, kwargs)?;
            Ok(Value::list(items.to_vec()))
        }
        "append" => {
            let slots = bind(name, &["object"], 1, args, kwargs)?;
            check_len(items.len() + 1, max_len, "list")?;
            exclusive(items, "list")?.push(arg(&slots, 0).clone());
            Ok(Value::None)
        }
        "extend" => {
            let slots = bind(name, &["iterable"], 1, args, kwargs)?;
            let extra = iterate(arg(&slots, 0))?;
            // `xs.extend(xs)` holds a second reference until the argument goes.
            drop(slots);
            check_len(items.len() + extra.len(), max_len, "list")?;
            exclusive(items, "list")?.extend(extra);
            Ok(Value::None)
        }
        "insert" => {
            let slots = bind(name, &["index", "object"], 2, args, kwargs)?;
            check_len(items.len() + 1, max_len, "list")?;
            let index = normalize_insert(expect_int(name, arg(&slots, 0))?, items.len());
            exclusive(items, "list")?.insert(index, arg(&slots, 1).clone());
            Ok(Value::None)
        }
        "pop" => {
            let slots = bind(name, &["index"], 0, args, kwargs)?;
            if items.is_empty() {
                return Err(Fault::Index("pop from empty list".to_string()));
            }
            let index = match &slots[0] {
                None => items.len() - 1,
                Some(value) => {
                    let raw = expect_int(name, value)?;
                    let len = items.len() as i64;
                    let resolved = if raw < 0 { raw + len } else { raw };
                    if !(0..len).contains(&resolved) {
                        return Err(Fault::Index("pop index out of range".to_string()));
                    }
                    resolved as usize
                }
            };
            Ok(exclusive(items, "list")?.remove(index))
        }
        "remove" => {
            let slots = bind(name, &["value"], 1, args, kwargs)?;
            let needle = arg(&slots, 0);
            let index = items
                .iter()
                .position(|item| item.py_eq(needle))
                .ok_or_else(|| Fault::Value("list.remove(x): x not in list".to_string()))?;
            exclusive(items, "list")?.remove(index);
            Ok(Value::None)
        }
        "clear" => {
            bind(name, &[], 0, args, kwargs)?;
            exclusive(items, "list")?.clear();
            Ok(Value::None)
        }
        "reverse" => {
            bind(name, &[], 0, args, kwargs)?;
            exclusive(items, "list")?.reverse();
            Ok(Value::None)
        }
        "sort" => {
            let slots = bind(name, &["key", "reverse"], 0, args, kwargs)?;
            let reverse = slots[1].as_ref().is_some_and(Value::truthy);
            let target = exclusive(items, "list")?;
            let sorted = sort_values(target.to_vec(), slots[0].as_ref(), reverse, max_len)?;
            *target = Items::new(sorted);
            Ok(Value::None)
        }
        _ => Err(no_attribute(&Value::list(Vec::new()), name)),
    }
}

fn normalize_insert(index: i64, len: usize) -> usize {
    let len = len as i64;
    let resolved = if index < 0 { (index + len).max(0) } else { index.min(len) };
    resolved as usize
}

fn dict_method(
    entries: &mut Rc<Items<(Value, Value)>>,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    max_len: usize,
) -> Result<Value, Fault> {
    match name {
        "get" => {
            let slots = bind(name, &["key", "default"], 1, args, kwargs)?;
            Ok(dict_get(entries.as_slice(), arg(&slots, 0))
                .cloned()
                .unwrap_or_else(|| arg(&slots, 1).clone()))
        }
        "keys" => {
            bind(name, &[], 0, args, kwargs)?;
            Ok(Value::list(entries.iter().map(|(k, _)| k.clone()).collect()))
        }
        "values" => {
            bind(name, &[], 0, args, kwargs)?;
            Ok(Value::list(entries.iter().map(|(_, v)| v.clone()).collect()))
        }
        "items" => {
            bind(name, &[], 0, args, kwargs)?;
            Ok(Value::list(
                entries
                    .iter()
                    .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                    .collect(),
            ))
        }
        "copy" => {
            bind(name, &[], 0, args, kwargs)?;
            Ok(Value::dict(entries.to_vec()))
        }
        "update" => {
            let slots = bind(name, &["other"], 0, args, kwargs)?;
            let incoming = match &slots[0] {
                None => Vec::new(),
                Some(Value::Dict(other)) => other.to_vec(),
                Some(other) => {
                    return Err(Fault::Type(format!(
                        "update() expected a dict, got '{}'",
                        other.type_name()
                    )));
                }
            };
            drop(slots);
            let target = exclusive(entries, "dict")?;
            for (key, value) in incoming {
                target.set_entry(key, value)?;
            }
            check_len(entries.len(), max_len, "dict")?;
            Ok(Value::None)
        }
        "setdefault" => {
            let slots = bind(name, &["key", "default"], 1, args, kwargs)?;
            let key = arg(&slots, 0).clone();
            if let Some(existing) = dict_get(entries.as_slice(), &key) {
                return Ok(existing.clone());
            }
            check_len(entries.len() + 1, max_len, "dict")?;
            let default = arg(&slots, 1).clone();
            exclusive(entries, "dict")?.set_entry(key, default.clone())?;
            Ok(default)
        }
        "pop" => {
            let slots = bind(name, &["key", "default"], 1, args, kwargs)?;
            let key = arg(&slots, 0);
            match entries.iter().position(|(k, _)| k.py_eq(key)) {
                Some(index) => Ok(exclusive(entries, "dict")?.remove(index).1),
                None => slots[1]
                    .clone()
                    .ok_or_else(|| Fault::Key(key.repr())),
            }
        }
        _ => Err(no_attribute(&Value::dict(Vec::new()), name)),
    }
}

/// `format(value, spec)` as used by f-string fields.
pub fn format_field(value: &Value, spec: Option<&str>) -> Result<String, Fault> {
    match spec {
        None | Some("") => Ok(value.to_string()),
        Some(spec) => format_value(value, spec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(builtin: Builtin, args: Vec<Value>) -> Result<Value, Fault> {
        call_builtin(builtin, args, Vec::new(), 1_000)
    }

    #[test]
    fn round_uses_half_even() {
        assert_eq!(call(Builtin::Round, vec![Value::Float(2.5)]), Ok(Value::Int(2)));
        assert_eq!(call(Builtin::Round, vec![Value::Float(3.5)]), Ok(Value::Int(4)));
        assert_eq!(
            call(Builtin::Round, vec![Value::Float(2.675), Value::Int(2)]),
            Ok(Value::Float(2.67))
        );        assert_eq!(
            call(Builtin::Round, vec![Value::Float(123.456), Value::Int(-1)]),
            Ok(Value::Float(120.0))
        );
    }

    #[test]
    fn round_to_huge_negative_digits_is_zero() {
        assert_eq!(
            call(Builtin::Round, vec![Value::Float(1e308), Value::Int(-400)]),
            Ok(Value::Float(0.0))
        );
        let negative = call(Builtin::Round, vec![Value::Float(-7.5), Value::Int(-400)])
            .expect("round");
        assert!(matches!(negative, Value::Float(v) if v == 0.0 && v.is_sign_negative()));
        assert_eq!(
            call(Builtin::Round, vec![Value::Float(1.25), Value::Int(400)]),
            Ok(Value::Float(1.25))
        );
    }

    #[test]
    fn range_respects_collection_limit() {
        let value = call(Builtin::Range, vec![Value::Int(0), Value::Int(10), Value::Int(3)])
            .expect("range");
        assert_eq!(
            value,
            Value::list(vec![Value::Int(0), Value::Int(3), Value::Int(6), Value::Int(9)])
        );
        let err = call(Builtin::Range, vec![Value::Int(1_000_000)]).expect_err("too large");
        assert!(matches!(err, Fault::TooLarge(_)));
    }

    #[test]
    fn min_and_max_accept_iterables_and_varargs() {
        let items = Value::list(vec![Value::Int(4), Value::Float(1.5), Value::Int(9)]);
        assert_eq!(call(Builtin::Min, vec![items.clone()]), Ok(Value::Float(1.5)));
        assert_eq!(call(Builtin::Max, vec![Value::Int(2), Value::Int(7)]), Ok(Value::Int(7)));
        let err = call(Builtin::Max, vec![Value::list(Vec::new())]).expect_err("empty");
        assert!(err.to_string().contains("empty sequence"));
    }

    #[test]
    fn sorted_is_stable_and_reversible() {
        let items = Value::list(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        let sorted = call_builtin(
            Builtin::Sorted,
            vec![items],
            vec![("reverse".to_string(), Value::Bool(true))],
            1_000,
        )
        .expect("sorted");
        assert_eq!(
            sorted,
            Value::list(vec![Value::Int(3), Value::Int(2), Value::Int(1)])
        );
        let mixed = Value::list(vec![Value::Int(1), Value::Str("a".to_string())]);
        assert!(call(Builtin::Sorted, vec![mixed]).is_err());
    }

    #[test]
    fn int_parses_and_truncates() {
        assert_eq!(call(Builtin::Int, vec![Value::Float(-2.9)]), Ok(Value::Int(-2)));
        assert_eq!(
            call(Builtin::Int, vec![Value::Str(" 42 ".to_string())]),
            Ok(Value::Int(42))
        );
        assert!(call(Builtin::Int, vec![Value::Str("4.2".to_string())]).is_err());
        assert!(call(Builtin::Int, vec![Value::Float(f64::NAN)]).is_err());
    }

    #[test]
    fn math_domain_errors_are_faults() {
        let sqrt = Builtin::Math(MathFn::Sqrt);
        assert_eq!(call(sqrt, vec![Value::Int(16)]), Ok(Value::Float(4.0)));
        assert!(call(sqrt, vec![Value::Int(-1)]).is_err());
        let factorial = Builtin::Math(MathFn::Factorial);
        assert_eq!(call(factorial, vec![Value::Int(5)]), Ok(Value::Int(120)));
        assert_eq!(call(factorial, vec![Value::Int(30)]), Err(Fault::Overflow));
    }

    #[test]
    fn list_methods_mutate_in_place() {
        let mut list = Value::list(vec![Value::Int(1)]);
        call_method(&mut list, "append", vec![Value::Int(2)], Vec::new(), 10).expect("append");
        let popped = call_method(&mut list, "pop", vec![Value::Int(0)], Vec::new(), 10)
            .expect("pop");
        assert_eq!(popped, Value::Int(1));
        assert_eq!(list, Value::list(vec![Value::Int(2)]));
    }

    #[test]
    fn mutating_a_shared_list_is_a_fault() {
        let mut list = Value::list(vec![Value::Int(1)]);
        let alias = list.clone();
        let err = call_method(&mut list, "append", vec![Value::Int(2)], Vec::new(), 10)
            .expect_err("shared");
        assert_eq!(err, Fault::Shared("list"));
        assert_eq!(alias, Value::list(vec![Value::Int(1)]));
        drop(alias);
        let copy = list.clone();
        call_method(&mut list, "extend", vec![copy], Vec::new(), 10).expect("extend self");
        assert_eq!(list, Value::list(vec![Value::Int(1), Value::Int(1)]));
    }

    #[test]
    fn str_of_a_value_respects_the_length_limit() {
        let items = Value::list(vec![Value::Int(12345); 100]);
        let err = call_builtin(Builtin::Str, vec![items], Vec::new(), 50).expect_err("long");
        assert!(matches!(err, Fault::TooLarge(_)));
    }

    #[test]
    fn dunder_attributes_are_denied() {
        let mut value = Value::Int(1);
        let err = call_method(&mut value, "__class__", Vec::new(), Vec::new(), 10)
            .expect_err("denied");
        assert!(matches!(err, Fault::Denied(_)));
        assert!(is_denied("open"));
        assert!(is_denied("__import__"));
        assert!(!is_denied("total"));
    }

    #[test]
    fn str_methods_cover_common_cleanup() {
        let mut value = Value::Str("  a,b ,c ".to_string());
        let stripped = call_method(&mut value, "strip", Vec::new(), Vec::new(), 100)
            .expect("strip");
        assert_eq!(stripped, Value::Str("a,b ,c".to_string()));
        let mut sep = Value::Str(", ".to_string());
        let joined = call_method(
            &mut sep,
            "join",
            vec![Value::list(vec![
                Value::Str("x".to_string()),
                Value::Str("y".to_string()),
            ])],
            Vec::new(),
            100,
        )
        .expect("join");
        assert_eq!(joined, Value::Str("x, y".to_string()));
    }
}
