//! Runtime values of the script dialect.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use chrono::NaiveDateTime;

use crate::core::types::{ResultValue, format_float};
use crate::sandbox::builtins::{Builtin, Module};
use crate::sandbox::error::Fault;
use crate::sandbox::time;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Rc<Items<Value>>),
    Tuple(Rc<Items<Value>>),
    /// Insertion-ordered; keys are unique under `py_eq`.
    Dict(Rc<Items<(Value, Value)>>),
    DateTime(NaiveDateTime),
    /// Signed duration in microseconds.
    TimeDelta(i64),
    Builtin(Builtin),
    Module(Module),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(Items::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(Items::new(items)))
    }

    pub fn dict(entries: Vec<(Value, Value)>) -> Self {
        Value::Dict(Rc::new(Items::new(entries)))
    }

    /// Reject containers that would expand past [`size_limit`] or nest deeper
    /// than [`MAX_DEPTH`]. Both measures are cached, so this is O(1).
    pub fn check_size(&self, max_len: usize) -> Result<(), Fault> {
        if !matches!(self, Value::List(_) | Value::Tuple(_) | Value::Dict(_)) {
            return Ok(());
        }
        let depth = self.depth();
        if depth > MAX_DEPTH {
            return Err(Fault::TooLarge(format!(
                "{} nested {depth} levels deep",
                self.type_name()
            )));
        }
        check_weight(self.type_name(), self.weight(), max_len)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::DateTime(_) => "datetime",
            Value::TimeDelta(_) => "timedelta",
            Value::Builtin(_) => "builtin",
            Value::Module(_) => "module",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) | Value::Tuple(items) => !items.is_empty(),
            Value::Dict(entries) => !entries.is_empty(),
            Value::TimeDelta(us) => *us != 0,
            Value::DateTime(_) | Value::Builtin(_) | Value::Module(_) => true,
        }
    }

    /// Integer view; booleans count as 0 and 1.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            other => other.as_int().map(|v| v as f64),
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Bool(_))
    }

    /// Equality with numeric coercion (`1 == 1.0 == True`).
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_number() && b.is_number() => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => x == y,
                _ => a.as_number() == b.as_number(),
            },
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.py_eq(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        dict_get(b, key).is_some_and(|other| other.py_eq(value))
                    })
            }
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::TimeDelta(a), Value::TimeDelta(b)) => a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            _ => false,
        }
    }

    /// Ordering for `<`-style comparisons. `Ok(None)` means unordered (NaN).
    pub fn py_cmp(&self, other: &Value) -> Result<Option<Ordering>, Fault> {
        match (self, other) {
            (a, b) if a.is_number() && b.is_number() => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => Ok(Some(x.cmp(&y))),
                _ => Ok(a.as_number().partial_cmp(&b.as_number())),
            },
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    if !x.py_eq(y) {
                        return x.py_cmp(y);
                    }
                }
                Ok(Some(a.len().cmp(&b.len())))
            }
            (Value::DateTime(a), Value::DateTime(b)) => Ok(Some(a.cmp(b))),
            (Value::TimeDelta(a), Value::TimeDelta(b)) => Ok(Some(a.cmp(b))),
            (a, b) => Err(Fault::Type(format!(
                "ordering not supported between instances of '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    /// Reject values that cannot be dict keys.
    pub fn check_hashable(&self) -> Result<(), Fault> {
        match self {
            Value::List(_) | Value::Dict(_) => Err(Fault::Type(format!(
                "unhashable type: '{}'",
                self.type_name()
            ))),
            Value::Tuple(items) => items.iter().try_for_each(Value::check_hashable),
            _ => Ok(()),
        }
    }

    /// Quoted form used inside containers and for `!r`.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => quote(s),
            Value::DateTime(dt) => time::datetime_repr(dt),
            Value::TimeDelta(us) => time::timedelta_repr(*us),
            other => other.to_string(),
        }
    }

    /// Convert to the data-only representation returned to the workflow.
    /// `None` maps to "no value"; nested `None` becomes an opaque marker.
    pub fn to_result(&self) -> Option<ResultValue> {
        match self {
            Value::None => None,
            other => Some(other.to_result_nested()),
        }
    }

    fn to_result_nested(&self) -> ResultValue {
        match self {
            Value::None => ResultValue::Opaque("None".to_string()),
            Value::Bool(b) => ResultValue::Bool(*b),
            Value::Int(v) => ResultValue::Int(*v),
            Value::Float(v) => ResultValue::Float(*v),
            Value::Str(s) => ResultValue::Str(s.clone()),
            Value::List(items) => {
                ResultValue::List(items.iter().map(Value::to_result_nested).collect())
            }
            Value::Tuple(items) => {
                ResultValue::Tuple(items.iter().map(Value::to_result_nested).collect())
            }
            Value::Dict(entries) => ResultValue::Dict(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_result_nested(), v.to_result_nested()))
                    .collect(),
            ),
            Value::DateTime(_) => ResultValue::DateTime(self.to_string()),
            Value::TimeDelta(_) => ResultValue::TimeDelta(self.to_string()),
            Value::Builtin(_) | Value::Module(_) => ResultValue::Opaque(self.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => f.write_str(&format_float(*v)),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => write_seq(f, "[", items, "]"),
            Value::Tuple(items) if items.len() == 1 => write!(f, "({},)", items[0].repr()),
            Value::Tuple(items) => write_seq(f, "(", items, ")"),
            Value::Dict(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", key.repr(), value.repr())?;
                }
                f.write_str("}")
            }
            Value::DateTime(dt) => f.write_str(&time::datetime_str(dt)),
            Value::TimeDelta(us) => f.write_str(&time::timedelta_str(*us)),
            Value::Builtin(builtin) => f.write_str(&builtin.describe()),
            Value::Module(module) => write!(f, "<module '{}' (built-in)>", module.name()),
        }
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, open: &str, items: &[Value], close: &str) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        f.write_str(&item.repr())?;
    }
    f.write_str(close)
}

fn quote(s: &str) -> String {
    let delimiter = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(delimiter);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == delimiter => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(delimiter);
    out
}

/// Deepest container nesting a script may build.
pub const MAX_DEPTH: usize = 100;

/// How many expanded elements a composite value may reach, as a multiple of
/// the per-collection length limit.
const EXPANSION_FACTOR: usize = 10;

/// Expanded size allowed for one value under a collection limit of `max_len`.
pub fn size_limit(max_len: usize) -> usize {
    max_len.saturating_mul(EXPANSION_FACTOR)
}

pub fn check_weight(what: &str, weight: usize, max_len: usize) -> Result<(), Fault> {
    if weight > size_limit(max_len) {
        return Err(Fault::TooLarge(format!("{what} expanding to {weight} elements")));
    }
    Ok(())
}

/// Size bookkeeping shared by values and dict entries.
pub trait Measure {
    /// Elements visited when fully expanded. Shared children count once per
    /// reference and strings count their bytes.
    fn weight(&self) -> usize;
    /// Container nesting; scalars are 0.
    fn depth(&self) -> usize;
}

impl Measure for Value {
    fn weight(&self) -> usize {
        match self {
            Value::Str(s) => s.len().max(1),
            Value::List(items) | Value::Tuple(items) => items.weight(),
            Value::Dict(entries) => entries.weight(),
            _ => 1,
        }
    }

    fn depth(&self) -> usize {
        match self {
            Value::List(items) | Value::Tuple(items) => items.depth(),
            Value::Dict(entries) => entries.depth(),
            _ => 0,
        }
    }
}

impl Measure for (Value, Value) {
    fn weight(&self) -> usize {
        self.0.weight().saturating_add(self.1.weight())
    }

    fn depth(&self) -> usize {
        self.0.depth().max(self.1.depth())
    }
}

/// Container payload that keeps its expanded weight and nesting depth
/// current through every mutation. Reads go through `Deref`.
#[derive(Debug, Clone)]
pub struct Items<T> {
    items: Vec<T>,
    total: usize,
    /// Upper bound; removals do not lower it.
    depth: usize,
}

impl<T: Measure> Items<T> {
    pub fn new(items: Vec<T>) -> Self {
        let total = items
            .iter()
            .fold(0usize, |acc, item| acc.saturating_add(item.weight()));
        let depth = items.iter().map(Measure::depth).max().unwrap_or(0) + 1;
        Self {
            items,
            total,
            depth,
        }
    }

    pub fn weight(&self) -> usize {
        self.total.max(1)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn absorb(&mut self, item: &T) {
        self.total = self.total.saturating_add(item.weight());
        self.depth = self.depth.max(item.depth() + 1);
    }

    pub fn push(&mut self, item: T) {
        self.absorb(&item);
        self.items.push(item);
    }

    pub fn insert(&mut self, index: usize, item: T) {
        self.absorb(&item);
        self.items.insert(index, item);
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.push(item);
        }
    }

    pub fn remove(&mut self, index: usize) -> T {
        let item = self.items.remove(index);
        self.total = self.total.saturating_sub(item.weight());
        item
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.total = 0;
        self.depth = 1;
    }

    pub fn reverse(&mut self) {
        self.items.reverse();
    }

    /// Run `f` on one element and fold its new size back into the totals.
    pub fn update<R>(&mut self, index: usize, f: impl FnOnce(&mut T) -> R) -> R {
        let before = self.items[index].weight();
        let out = f(&mut self.items[index]);
        let item = &self.items[index];
        self.total = self.total.saturating_sub(before).saturating_add(item.weight());
        self.depth = self.depth.max(item.depth() + 1);
        out
    }
}

impl Items<(Value, Value)> {
    /// Insert or overwrite `key`, keeping the original position on overwrite.
    pub fn set_entry(&mut self, key: Value, value: Value) -> Result<(), Fault> {
        key.check_hashable()?;
        match self.items.iter().position(|(existing, _)| existing.py_eq(&key)) {
            Some(index) => self.update(index, |entry| entry.1 = value),
            None => self.push((key, value)),
        }
        Ok(())
    }
}

impl<T> Deref for Items<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Vec<T> {
        &self.items
    }
}

impl<T: PartialEq> PartialEq for Items<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

/// Mutable access to a container nobody else holds. Values are shared
/// copy-on-assign, so changing a shared payload in place would leave the
/// other bindings stale.
pub fn exclusive<'a, T>(
    payload: &'a mut Rc<Items<T>>,
    type_name: &'static str,
) -> Result<&'a mut Items<T>, Fault> {
    Rc::get_mut(payload).ok_or(Fault::Shared(type_name))
}

/// Look up `key` in an insertion-ordered dict.
pub fn dict_get<'a>(entries: &'a [(Value, Value)], key: &Value) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(existing, _)| existing.py_eq(key))
        .map(|(_, value)| value)
}

/// Insert or overwrite `key`, keeping the original position on overwrite.
pub fn dict_set(entries: &mut Vec<(Value, Value)>, key: Value, value: Value) -> Result<(), Fault> {
    key.check_hashable()?;
    match entries.iter_mut().find(|(existing, _)| existing.py_eq(&key)) {
        Some(slot) => slot.1 = value,
        None => entries.push((key, value)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_script_str() {
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::Str("a".to_string()), Value::None])
                .to_string(),
            "[1, 'a', None]"
        );
        assert_eq!(Value::tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        assert_eq!(Value::Str("it's".to_string()).repr(), "\"it's\"");
    }

    #[test]
    fn numeric_equality_crosses_types() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::Str("1".to_string()).py_eq(&Value::Int(1)));
    }

    #[test]
    fn ordering_rejects_mixed_types() {
        let err = Value::Str("a".to_string())
            .py_cmp(&Value::Int(1))
            .expect_err("mixed");
        assert!(err.to_string().contains("'str' and 'int'"));
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::Int(2)])
                .py_cmp(&Value::list(vec![Value::Int(1), Value::Int(3)]))
                .expect("cmp"),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn none_result_means_no_value() {
        assert_eq!(Value::None.to_result(), None);
        assert_eq!(Value::Int(9).to_result(), Some(ResultValue::Int(9)));
    }

    #[test]
    fn dict_set_overwrites_in_place() {
        let mut entries = Vec::new();
        dict_set(&mut entries, Value::Str("a".to_string()), Value::Int(1)).expect("set");
        dict_set(&mut entries, Value::Str("b".to_string()), Value::Int(2)).expect("set");
        dict_set(&mut entries, Value::Str("a".to_string()), Value::Int(3)).expect("set");
        assert_eq!(entries.len(), 2);
        assert_eq!(
            dict_get(&entries, &Value::Str("a".to_string())),
            Some(&Value::Int(3))
        );
        assert!(dict_set(&mut entries, Value::list(Vec::new()), Value::None).is_err());
    }

    #[test]
    fn shared_children_count_once_per_reference() {
        let row = Value::list(vec![Value::Int(0); 1_000]);
        let grid = Value::list(vec![row; 1_000]);
        assert_eq!(grid.weight(), 1_000_000);
        assert_eq!(grid.depth(), 2);
        let err = grid.check_size(10_000).expect_err("too large");
        assert!(matches!(err, Fault::TooLarge(_)));
        assert!(grid.check_size(100_000).is_ok());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut value = Value::Int(0);
        for _ in 0..MAX_DEPTH {
            value = Value::list(vec![value]);
        }
        assert!(value.check_size(1_000).is_ok());
        let err = Value::list(vec![value])
            .check_size(1_000)
            .expect_err("too deep");
        assert!(err.to_string().contains("nested 101 levels deep"));
    }

    #[test]
    fn mutations_keep_measures_current() {
        let mut items = Items::new(vec![Value::Int(1)]);
        items.push(Value::Str("abcd".to_string()));
        assert_eq!(items.weight(), 5);
        items.update(0, |item| *item = Value::list(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(items.weight(), 6);
        assert_eq!(items.depth(), 2);
        items.remove(1);
        assert_eq!(items.weight(), 2);
        items.clear();
        assert_eq!((items.weight(), items.depth()), (1, 1));
    }

    #[test]
    fn shared_payloads_refuse_mutation() {
        let mut first = Rc::new(Items::new(vec![Value::Int(1)]));
        let second = Rc::clone(&first);
        assert_eq!(exclusive(&mut first, "list").err(), Some(Fault::Shared("list")));
        drop(second);
        exclusive(&mut first, "list").expect("unique").push(Value::Int(2));
        assert_eq!(first.len(), 2);
    }
}
