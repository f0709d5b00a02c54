//! Tree-walking evaluator for parsed scripts.
//!
//! Every statement and expression node burns one unit of fuel, so a runaway
//! loop ends with a contained fault instead of hanging the solver.

use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::sandbox::ast::{BinOp, BoolOp, CmpOp, Expr, FPart, Stmt, StmtKind, Target};
use crate::sandbox::builtins::{
    self, Module, call_method, call_value, format_field, get_attribute, is_denied, iterate,
};
use crate::sandbox::error::{Fault, ScriptError};
use crate::sandbox::ops::{binary, check_len, compare, unary};
use crate::sandbox::value::{Measure, Value, check_weight, dict_get, dict_set, exclusive};

/// Names bound by a finished script.
pub type Namespace = HashMap<String, Value>;

/// Resource limits for one script run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLimits {
    /// Evaluation steps before the run is aborted.
    pub fuel: u64,
    /// Longest string, list, tuple or dict a script may build. Nested values
    /// may expand to ten times this many elements.
    pub max_collection_len: usize,
    /// Modules the script may import. `math` is only pre-bound when listed.
    pub allowed_imports: Vec<String>,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            fuel: 1_000_000,
            max_collection_len: 100_000,
            allowed_imports: vec!["datetime".to_string(), "math".to_string()],
        }
    }
}

impl ScriptLimits {
    fn allows(&self, module: &str) -> bool {
        self.allowed_imports.iter().any(|m| m == module)
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
}

/// A change applied where a key path ends.
enum Edit<'a> {
    SetItem {
        key: Value,
        value: Value,
    },
    Method {
        name: &'a str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    },
}

/// Methods that change their receiver.
const MUTATING_METHODS: &[&str] = &[
    "append",
    "extend",
    "insert",
    "pop",
    "remove",
    "clear",
    "reverse",
    "sort",
    "update",
    "setdefault",
];

/// Run `program` to completion and return its namespace.
pub fn run(program: &[Stmt], limits: &ScriptLimits) -> Result<Namespace, ScriptError> {
    let mut interp = Interpreter {
        namespace: Namespace::new(),
        fuel: limits.fuel,
        limits,
    };
    for stmt in program {
        match interp.exec(stmt)? {
            Flow::Normal => {}
            Flow::Break => return Err(Fault::LoopControl("break").at(stmt.line)),
            Flow::Continue => return Err(Fault::LoopControl("continue").at(stmt.line)),
        }
    }
    Ok(interp.namespace)
}

struct Interpreter<'a> {
    namespace: Namespace,
    fuel: u64,
    limits: &'a ScriptLimits,
}

impl Interpreter<'_> {
    fn tick(&mut self) -> Result<(), Fault> {
        self.fuel = self.fuel.checked_sub(1).ok_or(Fault::FuelExhausted)?;
        Ok(())
    }

    fn max_len(&self) -> usize {
        self.limits.max_collection_len
    }

    fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow, ScriptError> {
        for stmt in body {
            match self.exec(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, ScriptError> {
        let line = stmt.line;
        let at = move |fault: Fault| fault.at(line);
        self.tick().map_err(at)?;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr).map_err(at)?;
            }
            StmtKind::Assign(targets, value) => {
                let value = self.eval(value).map_err(at)?;
                for target in targets {
                    self.assign(target, value.clone()).map_err(at)?;
                }
            }
            StmtKind::AugAssign(target, op, value) => {
                self.aug_assign(target, *op, value).map_err(at)?;
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test).map_err(at)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                return self.exec_block(orelse);
            }
            StmtKind::For { target, iter, body } => {
                let items = iterate(&self.eval(iter).map_err(at)?).map_err(at)?;
                for item in items {
                    self.tick().map_err(at)?;
                    self.assign(target, item).map_err(at)?;
                    if matches!(self.exec_block(body)?, Flow::Break) {
                        break;
                    }
                }
            }
            StmtKind::While { test, body } => loop {
                self.tick().map_err(at)?;
                if !self.eval(test).map_err(at)?.truthy() {
                    break;
                }
                if matches!(self.exec_block(body)?, Flow::Break) {
                    break;
                }
            },
            StmtKind::Import { module, bindings } => {
                self.import(module, bindings).map_err(at)?;
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
        }
        Ok(Flow::Normal)
    }

    fn import(&mut self, module: &str, bindings: &[(String, Option<String>)]) -> Result<(), Fault> {
        let resolved = Module::from_name(module)
            .filter(|_| self.limits.allows(module))
            .ok_or_else(|| Fault::Denied(format!("import {module}")))?;
        for (local, member) in bindings {
            let value = match member {
                None => Value::Module(resolved),
                Some(member) => resolved.member(member).ok_or_else(|| {
                    Fault::Attribute(format!("cannot import name '{member}' from '{module}'"))
                })?,
            };
            self.namespace.insert(local.clone(), value);
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Value, Fault> {
        if let Some(value) = self.namespace.get(name) {
            return Ok(value.clone());
        }
        if name == "math" && !self.limits.allows("math") {
            return Err(Fault::UndefinedName(name.to_string()));
        }
        if let Some(value) = builtins::global(name) {
            return Ok(value);
        }
        if is_denied(name) {
            return Err(Fault::Denied(name.to_string()));
        }
        Err(Fault::UndefinedName(name.to_string()))
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), Fault> {
        match target {
            Target::Name(name) => {
                self.namespace.insert(name.clone(), value);
                Ok(())
            }
            Target::Unpack(targets) => {
                let items = iterate(&value)?;
                if items.len() != targets.len() {
                    return Err(Fault::Value(format!(
                        "expected {} values to unpack, got {}",
                        targets.len(),
                        items.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
            Target::Item(name, keys) => {
                let (path, key) = self.eval_key_path(keys)?;
                self.edit(name, &path, Edit::SetItem { key, value })?;
                Ok(())
            }
        }
    }

    fn eval_key_path(&mut self, keys: &[Expr]) -> Result<(Vec<Value>, Value), Fault> {
        let mut path = self.eval_all(keys)?;
        let key = path
            .pop()
            .ok_or_else(|| Fault::Type("cannot assign to expression".to_string()))?;
        Ok((path, key))
    }

    /// Apply `edit` in place to the value reached from `name` through `keys`.
    fn edit(&mut self, name: &str, keys: &[Value], edit: Edit<'_>) -> Result<Value, Fault> {
        let max_len = self.max_len();
        let Some(slot) = self.namespace.get_mut(name) else {
            let current = self.lookup(name)?;
            return Err(not_assignable(&current));
        };
        let out = edit_at(slot, keys, edit, max_len)?;
        slot.check_size(max_len)?;
        Ok(out)
    }

    fn aug_assign(&mut self, target: &Target, op: BinOp, value: &Expr) -> Result<(), Fault> {
        match target {
            Target::Name(name) => {
                if let Some(slot) = self.namespace.get(name) {
                    check_in_place(op, slot)?;
                }
                let current = self.lookup(name)?;
                let rhs = self.eval(value)?;
                let result = binary(op, &current, &rhs, self.max_len())?;
                result.check_size(self.max_len())?;
                self.namespace.insert(name.clone(), result);
                Ok(())
            }
            Target::Item(name, keys) => {
                let (path, key) = self.eval_key_path(keys)?;
                let current = match self.namespace.get(name) {
                    Some(root) => {
                        let mut node = root;
                        for step in path.iter().chain(std::iter::once(&key)) {
                            node = item_ref(node, step)?;
                        }
                        check_in_place(op, node)?;
                        node.clone()
                    }
                    None => {
                        let current = self.lookup(name)?;
                        return Err(not_assignable(&current));
                    }
                };
                let rhs = self.eval(value)?;
                let value = binary(op, &current, &rhs, self.max_len())?;
                self.edit(name, &path, Edit::SetItem { key, value })?;
                Ok(())
            }
            Target::Unpack(_) => Err(Fault::Type(
                "illegal expression for augmented assignment".to_string(),
            )),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, Fault> {
        self.tick()?;
        let value = self.eval_expr(expr)?;
        value.check_size(self.max_len())?;
        Ok(value)
    }

    fn eval_expr(&mut self, expr: &Expr) -> Result<Value, Fault> {
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FPart::Literal(text) => out.push_str(text),
                        FPart::Field { expr, spec } => {
                            let value = self.eval(expr)?;
                            out.push_str(&format_field(&value, spec.as_deref())?);
                        }
                    }
                    check_len(out.len(), self.max_len(), "str")?;
                }
                Ok(Value::Str(out))
            }
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => Ok(Value::list(self.eval_all(items)?)),
            Expr::Tuple(items) => Ok(Value::tuple(self.eval_all(items)?)),
            Expr::Dict(pairs) => {
                let mut entries = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let key = self.eval(key)?;
                    let value = self.eval(value)?;
                    dict_set(&mut entries, key, value)?;
                }
                Ok(Value::dict(entries))
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                unary(*op, &value)
            }
            Expr::Binary(left, op, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, &left, &right, self.max_len())
            }
            Expr::Compare(first, rest) => self.eval_compare(first, rest),
            Expr::Logical(op, left, right) => {
                let left = self.eval(left)?;
                match (op, left.truthy()) {
                    (BoolOp::And, false) | (BoolOp::Or, true) => Ok(left),
                    _ => self.eval(right),
                }
            }
            Expr::Conditional { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::Call { func, args, kwargs } => self.eval_call(func, args, kwargs),
            Expr::Attribute(receiver, name) => {
                if is_denied(name) {
                    return Err(Fault::Denied(format!("attribute '{name}'")));
                }
                let receiver = self.eval(receiver)?;
                get_attribute(&receiver, name)
            }
            Expr::Index(target, key) => {
                let target = self.eval(target)?;
                let key = self.eval(key)?;
                index(&target, &key)
            }
            Expr::Slice {
                target,
                lower,
                upper,
                step,
            } => {
                let target = self.eval(target)?;
                let lower = self.eval_bound(lower.as_deref())?;
                let upper = self.eval_bound(upper.as_deref())?;
                let step = self.eval_bound(step.as_deref())?;
                slice(&target, lower, upper, step)
            }
            Expr::Comprehension {
                element,
                target,
                iter,
                conditions,
            } => {
                let items = iterate(&self.eval(iter)?)?;
                let mut names = Vec::new();
                target_names(target, &mut names);
                let saved: Vec<(String, Option<Value>)> = names
                    .into_iter()
                    .map(|name| {
                        let previous = self.namespace.get(&name).cloned();
                        (name, previous)
                    })
                    .collect();
                let outcome = self.comprehension(element, target, conditions, items);
                for (name, previous) in saved {
                    match previous {
                        Some(value) => self.namespace.insert(name, value),
                        None => self.namespace.remove(&name),
                    };
                }
                outcome
            }
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> Result<Vec<Value>, Fault> {
        exprs.iter().map(|expr| self.eval(expr)).collect()
    }

    fn eval_bound(&mut self, bound: Option<&Expr>) -> Result<Option<i64>, Fault> {
        let Some(expr) = bound else {
            return Ok(None);
        };
        match self.eval(expr)? {
            Value::None => Ok(None),
            value => value.as_int().map(Some).ok_or_else(|| {
                Fault::Type("slice indices must be integers or None".to_string())
            }),
        }
    }

    fn eval_compare(&mut self, first: &Expr, rest: &[(CmpOp, Expr)]) -> Result<Value, Fault> {
        let mut left = self.eval(first)?;
        for (op, right) in rest {
            let right = self.eval(right)?;
            if !compare(*op, &left, &right)? {
                return Ok(Value::Bool(false));
            }
            left = right;
        }
        Ok(Value::Bool(true))
    }

    fn eval_arguments(
        &mut self,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<(Vec<Value>, Vec<(String, Value)>), Fault> {
        let args = self.eval_all(args)?;
        let mut keyword_values = Vec::with_capacity(kwargs.len());
        for (name, expr) in kwargs {
            keyword_values.push((name.clone(), self.eval(expr)?));
        }
        Ok((args, keyword_values))
    }

    fn eval_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<Value, Fault> {
        let max_len = self.max_len();
        if let Expr::Attribute(receiver, method) = func {
            // Mutating methods on `name[k]...` change the stored value itself.
            if MUTATING_METHODS.contains(&method.as_str())
                && let Some((root, key_exprs)) = place(receiver)
                && self.namespace.contains_key(root)
            {
                let mut keys = Vec::with_capacity(key_exprs.len());
                for expr in key_exprs {
                    keys.push(self.eval(expr)?);
                }
                let (args, kwargs) = self.eval_arguments(args, kwargs)?;
                let edit = Edit::Method {
                    name: method,
                    args,
                    kwargs,
                };
                return self.edit(root, &keys, edit);
            }
            let mut receiver = self.eval(receiver)?;
            let (args, kwargs) = self.eval_arguments(args, kwargs)?;
            return call_method(&mut receiver, method, args, kwargs, max_len);
        }
        let callee = self.eval(func)?;
        let (args, kwargs) = self.eval_arguments(args, kwargs)?;
        call_value(&callee, args, kwargs, max_len)
    }

    fn comprehension(
        &mut self,
        element: &Expr,
        target: &Target,
        conditions: &[Expr],
        items: Vec<Value>,
    ) -> Result<Value, Fault> {
        let mut out = Vec::new();
        let mut weight = 0usize;
        'items: for item in items {
            self.tick()?;
            self.assign(target, item)?;
            for condition in conditions {
                if !self.eval(condition)?.truthy() {
                    continue 'items;
                }
            }
            let value = self.eval(element)?;
            weight = weight.saturating_add(value.weight());
            check_len(out.len() + 1, self.max_len(), "list")?;
            check_weight("list", weight, self.max_len())?;
            out.push(value);
        }
        Ok(Value::list(out))
    }
}

fn target_names(target: &Target, out: &mut Vec<String>) {
    match target {
        Target::Name(name) | Target::Item(name, _) => out.push(name.clone()),
        Target::Unpack(targets) => {
            for target in targets {
                target_names(target, out);
            }
        }
    }
}

/// `name[k1][k2]...` split into its root name and key expressions.
fn place(expr: &Expr) -> Option<(&str, Vec<&Expr>)> {
    match expr {
        Expr::Name(name) => Some((name.as_str(), Vec::new())),
        Expr::Index(inner, key) => {
            let (root, mut keys) = place(inner)?;
            keys.push(key.as_ref());
            Some((root, keys))
        }
        _ => None,
    }
}

/// `xs += ...` extends the list itself, which cannot reach other bindings.
fn check_in_place(op: BinOp, current: &Value) -> Result<(), Fault> {
    match current {
        Value::List(items)
            if matches!(op, BinOp::Add | BinOp::Mul) && Rc::strong_count(items) > 1 =>
        {
            Err(Fault::Shared("list"))
        }
        _ => Ok(()),
    }
}

/// Walk `keys` down from `slot`, claiming each container on the way, then
/// apply `edit` at the end. Every container passed keeps its sizes current.
fn edit_at(
    slot: &mut Value,
    keys: &[Value],
    edit: Edit<'_>,
    max_len: usize,
) -> Result<Value, Fault> {
    let Some((key, rest)) = keys.split_first() else {
        return match edit {
            Edit::SetItem { key, value } => {
                set_item(slot, key, value, max_len).map(|()| Value::None)
            }
            Edit::Method { name, args, kwargs } => call_method(slot, name, args, kwargs, max_len),
        };
    };
    match slot {
        Value::List(items) => {
            let i = normalize_index(integer_key("list", key)?, items.len(), "list")?;
            exclusive(items, "list")?.update(i, |item| edit_at(item, rest, edit, max_len))
        }
        Value::Tuple(items) => {
            let i = normalize_index(integer_key("tuple", key)?, items.len(), "tuple")?;
            exclusive(items, "tuple")?.update(i, |item| edit_at(item, rest, edit, max_len))
        }
        Value::Dict(entries) => {
            key.check_hashable()?;
            let i = entries
                .iter()
                .position(|(existing, _)| existing.py_eq(key))
                .ok_or_else(|| Fault::Key(key.repr()))?;
            exclusive(entries, "dict")?
                .update(i, |entry| edit_at(&mut entry.1, rest, edit, max_len))
        }
        other => Err(not_subscriptable(other)),
    }
}

fn not_subscriptable(value: &Value) -> Fault {
    Fault::Type(format!("'{}' object is not subscriptable", value.type_name()))
}

fn not_assignable(value: &Value) -> Fault {
    Fault::Type(format!(
        "'{}' object does not support item assignment",
        value.type_name()
    ))
}

fn normalize_index(index: i64, len: usize, what: &str) -> Result<usize, Fault> {
    let len = i64::try_from(len).map_err(|_| Fault::Overflow)?;
    let resolved = if index < 0 { index + len } else { index };
    if (0..len).contains(&resolved) {
        usize::try_from(resolved).map_err(|_| Fault::Overflow)
    } else {
        Err(Fault::Index(format!("{what} index out of range")))
    }
}

fn integer_key(type_name: &str, key: &Value) -> Result<i64, Fault> {
    key.as_int().ok_or_else(|| {
        Fault::Type(format!(
            "{type_name} indices must be integers, not {}",
            key.type_name()
        ))
    })
}

fn index(container: &Value, key: &Value) -> Result<Value, Fault> {
    match container {
        Value::Str(s) => {
            let i = normalize_index(integer_key("string", key)?, s.chars().count(), "string")?;
            Ok(s.chars().nth(i).map(|c| Value::Str(c.to_string())).unwrap_or(Value::None))
        }
        other => item_ref(other, key).cloned(),
    }
}

/// Borrow the element a subscript names, for containers that hold values.
fn item_ref<'v>(container: &'v Value, key: &Value) -> Result<&'v Value, Fault> {
    match container {
        Value::List(items) | Value::Tuple(items) => {
            let i = normalize_index(
                integer_key(container.type_name(), key)?,
                items.len(),
                container.type_name(),
            )?;
            Ok(&items[i])
        }
        Value::Dict(entries) => {
            key.check_hashable()?;
            dict_get(entries, key).ok_or_else(|| Fault::Key(key.repr()))
        }
        Value::Str(_) => Err(not_assignable(container)),
        other => Err(not_subscriptable(other)),
    }
}

fn set_item(container: &mut Value, key: Value, value: Value, max_len: usize) -> Result<(), Fault> {
    match container {
        Value::List(items) => {
            let i = normalize_index(integer_key("list", &key)?, items.len(), "list assignment")?;
            exclusive(items, "list")?.update(i, |item| *item = value);
            Ok(())
        }
        Value::Dict(entries) => {
            let entries = exclusive(entries, "dict")?;
            entries.set_entry(key, value)?;
            check_len(entries.len(), max_len, "dict")
        }
        other => Err(not_assignable(other)),
    }
}

/// Python slice bounds resolution for a sequence of `len` items.
fn slice_indices(len: usize, lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<usize> {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let clamp = |bound: i64, low: i64, high: i64| {
        let bound = if bound < 0 { bound.saturating_add(len) } else { bound };
        bound.clamp(low, high)
    };
    let (start, stop) = if step > 0 {
        (
            lower.map_or(0, |b| clamp(b, 0, len)),
            upper.map_or(len, |b| clamp(b, 0, len)),
        )
    } else {
        (
            lower.map_or(len - 1, |b| clamp(b, -1, len - 1)),
            upper.map_or(-1, |b| clamp(b, -1, len - 1)),
        )
    };
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        if let Ok(index) = usize::try_from(i) {
            out.push(index);
        }
        i = match i.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    out
}

fn slice(
    target: &Value,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> Result<Value, Fault> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Fault::Value("slice step cannot be zero".to_string()));
    }
    match target {
        Value::List(items) | Value::Tuple(items) => {
            let picked = slice_indices(items.len(), lower, upper, step)
                .into_iter()
                .map(|i| items[i].clone())
                .collect();
            Ok(match target {
                Value::Tuple(_) => Value::tuple(picked),
                _ => Value::list(picked),
            })
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(
                slice_indices(chars.len(), lower, upper, step)
                    .into_iter()
                    .map(|i| chars[i])
                    .collect(),
            ))
        }
        other => Err(not_subscriptable(other)),
    }
}
