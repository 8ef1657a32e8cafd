//! Tree-walking interpreter for parsed scripts
//!
//! Globals (the context snapshot) are read-only; scripts may only declare
//! and mutate their own locals. Every statement, loop iteration and call
//! consumes budget, and the wall-clock deadline is checked as budget is
//! spent, so runaway scripts stop with a limit or timeout error. Building
//! an array or object costs budget in proportion to the values copied into
//! it, and no collection may exceed [`MAX_COLLECTION_SIZE`] nodes.

use crate::ast::*;
use crate::errors::ScriptError;
use crate::host::{Capabilities, HostBridge};
use crate::value::{compare, loose_equals, number, strict_equals, to_display, to_number, truthy, type_of};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub(crate) const MAX_STRING_LEN: usize = 1 << 20;
/// Upper bound on the nodes (elements, nested values included) of any
/// array or object a script builds
pub(crate) const MAX_COLLECTION_SIZE: usize = 100_000;
const MAX_CALL_DEPTH: usize = 64;
const DEADLINE_CHECK_INTERVAL: u64 = 32;

/// Why evaluation stopped early
#[derive(Debug)]
pub(crate) enum Halt {
    Error(ScriptError),
    /// `abort(message)` was called
    Abort(String),
}

impl From<ScriptError> for Halt {
    fn from(err: ScriptError) -> Self {
        Halt::Error(err)
    }
}

pub(crate) type Eval<T> = Result<T, Halt>;

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Binding {
    value: Value,
    mutable: bool,
}

/// Budget for one execution
pub(crate) struct Limits {
    pub timeout: Duration,
    pub max_steps: u64,
    pub max_logs: usize,
}

enum PathKey {
    Key(String),
    Index(usize),
}

pub(crate) struct Interpreter<'h> {
    scopes: Vec<HashMap<String, Binding>>,
    pub(crate) globals: Map<String, Value>,
    deadline: Instant,
    timeout_ms: u64,
    max_steps: u64,
    steps: u64,
    call_depth: usize,
    max_logs: usize,
    pub(crate) logs: Vec<String>,
    logs_truncated: bool,
    pub(crate) set_fields: Map<String, Value>,
    pub(crate) capabilities: Capabilities,
    pub(crate) host: Option<&'h dyn HostBridge>,
    completion: Value,
}

impl<'h> Interpreter<'h> {
    pub(crate) fn new(
        globals: Map<String, Value>,
        limits: Limits,
        capabilities: Capabilities,
        host: Option<&'h dyn HostBridge>,
    ) -> Self {
        Self {
            scopes: vec![HashMap::new()],
            globals,
            deadline: Instant::now() + limits.timeout,
            timeout_ms: limits.timeout.as_millis() as u64,
            max_steps: limits.max_steps,
            steps: 0,
            call_depth: 0,
            max_logs: limits.max_logs,
            logs: Vec::new(),
            logs_truncated: false,
            set_fields: Map::new(),
            capabilities,
            host,
            completion: Value::Null,
        }
    }

    /// Execute a program; the result is the `return` value or the value of
    /// the last evaluated expression statement
    pub(crate) fn run(&mut self, program: &[Stmt]) -> Eval<Value> {
        for stmt in program {
            match self.exec(stmt)? {
                Flow::Normal => {}
                Flow::Return(value) => return Ok(value),
                Flow::Break | Flow::Continue => {
                    return Err(ScriptError::new(
                        crate::ScriptErrorKind::Syntax,
                        "Illegal break or continue outside of a loop",
                    )
                    .into())
                }
            }
        }
        Ok(std::mem::take(&mut self.completion))
    }

    // ── Budget ───────────────────────────────────────────────────────

    pub(crate) fn tick(&mut self) -> Eval<()> {
        self.steps += 1;
        self.check_steps()?;
        if self.steps % DEADLINE_CHECK_INTERVAL == 0 {
            self.check_deadline()?;
        }
        Ok(())
    }

    /// Spend budget for `units` of bulk work and check the deadline
    pub(crate) fn charge(&mut self, units: usize) -> Eval<()> {
        if units == 0 {
            return Ok(());
        }
        self.steps = self.steps.saturating_add(units as u64);
        self.check_steps()?;
        self.check_deadline()
    }

    /// Charge for a collection built from `parts`, enforcing the size cap
    /// before the caller allocates it
    pub(crate) fn charge_collection<'v>(
        &mut self,
        parts: impl IntoIterator<Item = &'v Value>,
    ) -> Eval<()> {
        let mut size = 1usize;
        for part in parts {
            size += value_size(part, MAX_COLLECTION_SIZE);
            if size > MAX_COLLECTION_SIZE {
                return Err(collection_too_large());
            }
        }
        self.charge(size)
    }

    fn check_steps(&self) -> Eval<()> {
        if self.steps > self.max_steps {
            return Err(ScriptError::limit(format!(
                "script exceeded {} evaluation steps",
                self.max_steps
            ))
            .into());
        }
        Ok(())
    }

    pub(crate) fn check_deadline(&self) -> Eval<()> {
        if Instant::now() >= self.deadline {
            return Err(ScriptError::timeout(self.timeout_ms).into());
        }
        Ok(())
    }

    /// Time left before the deadline
    pub(crate) fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn enter_call(&mut self) -> Eval<()> {
        self.call_depth += 1;
        if self.call_depth > MAX_CALL_DEPTH {
            return Err(ScriptError::limit("maximum call depth exceeded").into());
        }
        Ok(())
    }

    pub(crate) fn log(&mut self, line: String) {
        if self.logs.len() < self.max_logs {
            self.logs.push(line);
        } else if !self.logs_truncated {
            self.logs_truncated = true;
            self.logs.push("... log output truncated".to_string());
        }
    }

    // ── Scopes ───────────────────────────────────────────────────────

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: &str, value: Value, mutable: bool) -> Eval<()> {
        let scope = match self.scopes.last_mut() {
            Some(scope) => scope,
            None => return Err(ScriptError::runtime("no active scope").into()),
        };
        if scope.contains_key(name) {
            return Err(ScriptError::new(
                crate::ScriptErrorKind::Syntax,
                format!("Identifier '{}' has already been declared", name),
            )
            .into());
        }
        scope.insert(name.to_string(), Binding { value, mutable });
        Ok(())
    }

    pub(crate) fn is_local(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|s| s.contains_key(name))
    }

    fn local_mut(&mut self, name: &str) -> Option<&mut Binding> {
        self.scopes.iter_mut().rev().find_map(|s| s.get_mut(name))
    }

    fn lookup(&self, name: &str) -> Eval<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(binding) = scope.get(name) {
                return Ok(binding.value.clone());
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        match name {
            "NaN" | "Infinity" => Ok(Value::Null),
            _ if crate::builtins::is_namespace(name) || crate::builtins::is_function(name) => {
                Err(ScriptError::type_error(format!("{} cannot be used as a value", name)).into())
            }
            _ => Err(ScriptError::reference(name).into()),
        }
    }

    // ── Statements ───────────────────────────────────────────────────

    fn exec(&mut self, stmt: &Stmt) -> Eval<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Declare {
                name,
                mutable,
                init,
            } => {
                let value = match init {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                self.declare(name, value, *mutable)?;
                Ok(Flow::Normal)
            }
            Stmt::Expr(expr) => {
                self.completion = self.eval(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if truthy(&self.eval(condition)?) {
                    self.exec_scoped(then_branch)
                } else if let Some(else_branch) = else_branch {
                    self.exec_scoped(else_branch)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { condition, body } => {
                loop {
                    self.tick()?;
                    if !truthy(&self.eval(condition)?) {
                        break;
                    }
                    match self.exec_scoped(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::ForOf {
                name,
                iterable,
                body,
            } => {
                let items = match self.eval(iterable)? {
                    Value::Array(items) => items,
                    Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "{} is not iterable",
                            type_of(&other)
                        ))
                        .into())
                    }
                };
                for item in items {
                    self.tick()?;
                    self.push_scope();
                    let flow = self
                        .declare(name, item, true)
                        .and_then(|_| self.exec(body));
                    self.pop_scope();
                    match flow? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Block(stmts) => {
                self.push_scope();
                let flow = self.exec_block(stmts);
                self.pop_scope();
                flow
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Empty => Ok(Flow::Normal),
        }
    }

    /// Statement in its own scope, so `if (x) let y = 1` cannot leak `y`
    fn exec_scoped(&mut self, stmt: &Stmt) -> Eval<Flow> {
        self.push_scope();
        let flow = self.exec(stmt);
        self.pop_scope();
        flow
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Eval<Flow> {
        for stmt in stmts {
            match self.exec(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    // ── Expressions ──────────────────────────────────────────────────

    pub(crate) fn eval(&mut self, expr: &Expr) -> Eval<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => self.lookup(name),
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                self.charge_collection(&out)?;
                Ok(Value::Array(out))
            }
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    let value = self.eval(value)?;
                    map.insert(key.clone(), value);
                }
                self.charge_collection(map.values())?;
                Ok(Value::Object(map))
            }
            Expr::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => out.push_str(text),
                        TemplatePart::Expr(expr) => {
                            let value = self.eval(expr)?;
                            out.push_str(&to_display(&value));
                        }
                    }
                    check_string_len(&out)?;
                }
                Ok(Value::String(out))
            }
            Expr::Member {
                object,
                property,
                optional,
            } => {
                if let Expr::Ident(ns) = object.as_ref() {
                    if self.is_builtin_namespace(ns) {
                        return self.namespace_constant(ns, property);
                    }
                }
                let target = self.eval(object)?;
                get_member(&target, property, *optional)
            }
            Expr::Index {
                object,
                index,
                optional,
            } => {
                let target = self.eval(object)?;
                if target.is_null() && *optional {
                    return Ok(Value::Null);
                }
                let index = self.eval(index)?;
                get_index(&target, &index)
            }
            Expr::Call { callee, args } => {
                self.tick()?;
                self.enter_call()?;
                let result = self.eval_call(callee, args);
                self.call_depth -= 1;
                result
            }
            Expr::Unary { op, expr } => self.eval_unary(*op, expr),
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary_op(*op, &left, &right)
            }
            Expr::Logical { op, left, right } => {
                let left = self.eval(left)?;
                match op {
                    LogicalOp::And if !truthy(&left) => Ok(left),
                    LogicalOp::Or if truthy(&left) => Ok(left),
                    LogicalOp::Nullish if !left.is_null() => Ok(left),
                    _ => self.eval(right),
                }
            }
            Expr::Conditional {
                condition,
                then_expr,
                else_expr,
            } => {
                if truthy(&self.eval(condition)?) {
                    self.eval(then_expr)
                } else {
                    self.eval(else_expr)
                }
            }
            Expr::Assign { target, op, value } => self.eval_assign(target, *op, value),
            Expr::Arrow { .. } => Err(ScriptError::type_error(
                "arrow functions can only be passed to array methods",
            )
            .into()),
        }
    }

    fn eval_unary(&mut self, op: UnaryOp, expr: &Expr) -> Eval<Value> {
        if op == UnaryOp::Typeof {
            if let Expr::Ident(name) = expr {
                if !self.is_local(name) && !self.globals.contains_key(name) {
                    let kind = if crate::builtins::is_function(name) {
                        "function"
                    } else if crate::builtins::is_namespace(name) {
                        "object"
                    } else {
                        "undefined"
                    };
                    return Ok(Value::String(kind.to_string()));
                }
            }
            let value = self.eval(expr)?;
            return Ok(Value::String(type_of(&value).to_string()));
        }
        let value = self.eval(expr)?;
        Ok(match op {
            UnaryOp::Not => Value::Bool(!truthy(&value)),
            UnaryOp::Neg => to_number(&value).map(|n| number(-n)).unwrap_or(Value::Null),
            UnaryOp::Plus => to_number(&value).map(number).unwrap_or(Value::Null),
            UnaryOp::Typeof => Value::Null,
        })
    }

    pub(crate) fn is_builtin_namespace(&self, name: &str) -> bool {
        crate::builtins::is_namespace(name) && !self.is_local(name) && !self.globals.contains_key(name)
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr]) -> Eval<Value> {
        match callee {
            Expr::Ident(name) if !self.is_local(name) => {
                let values = self.eval_args(args)?;
                self.call_global(name, values)
            }
            Expr::Member {
                object,
                property,
                optional,
            } => {
                if let Expr::Ident(root) = object.as_ref() {
                    if self.is_builtin_namespace(root) {
                        let values = self.eval_args(args)?;
                        return self.call_namespace(root, property, values);
                    }
                    if property == "push" && self.is_local(root) {
                        let values = self.eval_args(args)?;
                        return self.push_local(root, values);
                    }
                }
                let receiver = self.eval(object)?;
                if receiver.is_null() && *optional {
                    return Ok(Value::Null);
                }
                self.call_method(receiver, property, args)
            }
            other => {
                let value = self.eval(other)?;
                Err(ScriptError::type_error(format!("{} is not a function", type_of(&value))).into())
            }
        }
    }

    pub(crate) fn eval_args(&mut self, args: &[Expr]) -> Eval<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        Ok(values)
    }

    fn push_local(&mut self, name: &str, values: Vec<Value>) -> Eval<Value> {
        let existing = match self.local_mut(name).map(|binding| &binding.value) {
            Some(Value::Array(items)) => items.len(),
            Some(other) => {
                return Err(ScriptError::type_error(format!(
                    "{}.push is not a function",
                    type_of(other)
                ))
                .into())
            }
            None => return Err(ScriptError::reference(name).into()),
        };
        let added: usize = values
            .iter()
            .map(|v| value_size(v, MAX_COLLECTION_SIZE))
            .sum();
        if existing.saturating_add(added) > MAX_COLLECTION_SIZE {
            return Err(collection_too_large());
        }
        self.charge(added)?;

        match self.local_mut(name).map(|binding| &mut binding.value) {
            Some(Value::Array(items)) => {
                items.extend(values);
                Ok(number(items.len() as f64))
            }
            _ => Err(ScriptError::reference(name).into()),
        }
    }

    /// Invoke an arrow-function argument with positional values
    pub(crate) fn call_arrow(&mut self, arrow: &Expr, args: Vec<Value>) -> Eval<Value> {
        let Expr::Arrow { params, body } = arrow else {
            return Err(ScriptError::type_error("callback must be an arrow function").into());
        };
        self.tick()?;
        self.enter_call()?;
        self.push_scope();
        let mut args = args.into_iter();
        let mut result = Ok(());
        for param in params {
            let value = args.next().unwrap_or(Value::Null);
            result = result.and_then(|_| self.declare(param, value, true));
        }
        let result = result.and_then(|_| match body {
            ArrowBody::Expr(expr) => self.eval(expr),
            ArrowBody::Block(stmts) => match self.exec_block(stmts)? {
                Flow::Return(value) => Ok(value),
                _ => Ok(Value::Null),
            },
        });
        self.pop_scope();
        self.call_depth -= 1;
        result
    }

    // ── Assignment ───────────────────────────────────────────────────

    fn eval_assign(&mut self, target: &Expr, op: AssignOp, value: &Expr) -> Eval<Value> {
        let rhs = self.eval(value)?;
        let (root, path) = self.assignment_path(target)?;

        if !self.is_local(&root) {
            if self.globals.contains_key(&root) {
                return Err(ScriptError::type_error(format!(
                    "Cannot assign to read-only context value '{}'",
                    root
                ))
                .into());
            }
            return Err(ScriptError::reference(&root).into());
        }

        let binding = self
            .local_mut(&root)
            .ok_or_else(|| Halt::from(ScriptError::reference(&root)))?;
        if path.is_empty() && !binding.mutable {
            return Err(ScriptError::type_error("Assignment to constant variable.").into());
        }

        let slot = resolve_slot(&mut binding.value, &path)?;
        let new_value = match op {
            AssignOp::Set => rhs,
            AssignOp::Add => binary_op(BinaryOp::Add, slot, &rhs)?,
            AssignOp::Sub => binary_op(BinaryOp::Sub, slot, &rhs)?,
        };
        *slot = new_value.clone();
        Ok(new_value)
    }

    fn assignment_path(&mut self, target: &Expr) -> Eval<(String, Vec<PathKey>)> {
        match target {
            Expr::Ident(name) => Ok((name.clone(), Vec::new())),
            Expr::Member {
                object, property, ..
            } => {
                let (root, mut path) = self.assignment_path(object)?;
                path.push(PathKey::Key(property.clone()));
                Ok((root, path))
            }
            Expr::Index { object, index, .. } => {
                let (root, mut path) = self.assignment_path(object)?;
                let key = match self.eval(index)? {
                    Value::Number(n) => match n.as_u64() {
                        Some(i) => PathKey::Index(i as usize),
                        None => PathKey::Key(n.to_string()),
                    },
                    other => PathKey::Key(to_display(&other)),
                };
                path.push(key);
                Ok((root, path))
            }
            _ => Err(ScriptError::new(crate::ScriptErrorKind::Syntax, "Invalid assignment target").into()),
        }
    }
}

/// Walk to the slot addressed by `path`, creating the final key
fn resolve_slot<'v>(root: &'v mut Value, path: &[PathKey]) -> Eval<&'v mut Value> {
    let mut current = root;
    for key in path {
        current = match (current, key) {
            (Value::Object(map), PathKey::Key(k)) => map.entry(k.clone()).or_insert(Value::Null),
            (Value::Object(map), PathKey::Index(i)) => map.entry(i.to_string()).or_insert(Value::Null),
            (Value::Array(items), PathKey::Index(i)) => {
                if *i > items.len() + 1024 {
                    return Err(ScriptError::limit("array index out of range").into());
                }
                check_collection_len(*i + 1)?;
                if *i >= items.len() {
                    items.resize(*i + 1, Value::Null);
                }
                &mut items[*i]
            }
            (other, key) => {
                let name = match key {
                    PathKey::Key(k) => k.clone(),
                    PathKey::Index(i) => i.to_string(),
                };
                return Err(ScriptError::type_error(format!(
                    "Cannot set properties of {} (setting '{}')",
                    type_of(other),
                    name
                ))
                .into());
            }
        };
    }
    Ok(current)
}

pub(crate) fn check_collection_len(len: usize) -> Eval<()> {
    if len > MAX_COLLECTION_SIZE {
        return Err(collection_too_large());
    }
    Ok(())
}

fn collection_too_large() -> Halt {
    ScriptError::limit(format!(
        "collection exceeds maximum size of {} elements",
        MAX_COLLECTION_SIZE
    ))
    .into()
}

/// Nodes in `value`, nested values included; counting stops past `cap`
pub(crate) fn value_size(value: &Value, cap: usize) -> usize {
    let mut size = 0;
    let mut pending = vec![value];
    while let Some(current) = pending.pop() {
        size += 1;
        if size > cap {
            break;
        }
        match current {
            Value::Array(items) => pending.extend(items.iter()),
            Value::Object(map) => pending.extend(map.values()),
            _ => {}
        }
    }
    size
}

pub(crate) fn check_string_len(s: &str) -> Eval<()> {
    if s.len() > MAX_STRING_LEN {
        return Err(ScriptError::limit("string exceeds maximum length").into());
    }
    Ok(())
}

pub(crate) fn get_member(target: &Value, property: &str, optional: bool) -> Eval<Value> {
    match target {
        Value::Null if optional => Ok(Value::Null),
        Value::Null => Err(ScriptError::type_error(format!(
            "Cannot read properties of undefined (reading '{}')",
            property
        ))
        .into()),
        Value::Object(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
        Value::Array(items) => Ok(match property {
            "length" => number(items.len() as f64),
            _ => property
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(Value::Null),
        }),
        Value::String(s) if property == "length" => Ok(number(s.chars().count() as f64)),
        _ => Ok(Value::Null),
    }
}

fn get_index(target: &Value, index: &Value) -> Eval<Value> {
    match (target, index) {
        (Value::Null, _) => Err(ScriptError::type_error(format!(
            "Cannot read properties of undefined (reading '{}')",
            to_display(index)
        ))
        .into()),
        (Value::Array(items), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| items.get(i as usize).cloned())
            .unwrap_or(Value::Null)),
        (Value::String(s), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| s.chars().nth(i as usize))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),
        (other, key) => get_member(other, &to_display(key), false),
    }
}

pub(crate) fn binary_op(op: BinaryOp, left: &Value, right: &Value) -> Eval<Value> {
    let numeric = |f: fn(f64, f64) -> f64| -> Value {
        match (to_number(left), to_number(right)) {
            (Some(a), Some(b)) => number(f(a, b)),
            _ => Value::Null,
        }
    };
    let ordered = |pred: fn(Ordering) -> bool| -> Value {
        Value::Bool(compare(left, right).map(pred).unwrap_or(false))
    };
    Ok(match op {
        BinaryOp::Add => match (left, right) {
            (Value::Number(_) | Value::Bool(_) | Value::Null, Value::Number(_) | Value::Bool(_) | Value::Null) => {
                numeric(|a, b| a + b)
            }
            _ => {
                let mut s = to_display(left);
                s.push_str(&to_display(right));
                check_string_len(&s)?;
                Value::String(s)
            }
        },
        BinaryOp::Sub => numeric(|a, b| a - b),
        BinaryOp::Mul => numeric(|a, b| a * b),
        BinaryOp::Div => numeric(|a, b| a / b),
        BinaryOp::Rem => numeric(|a, b| a % b),
        BinaryOp::Eq => Value::Bool(loose_equals(left, right)),
        BinaryOp::NotEq => Value::Bool(!loose_equals(left, right)),
        BinaryOp::StrictEq => Value::Bool(strict_equals(left, right)),
        BinaryOp::StrictNotEq => Value::Bool(!strict_equals(left, right)),
        BinaryOp::Lt => ordered(|o| o == Ordering::Less),
        BinaryOp::LtEq => ordered(|o| o != Ordering::Greater),
        BinaryOp::Gt => ordered(|o| o == Ordering::Greater),
        BinaryOp::GtEq => ordered(|o| o != Ordering::Less),
    })
}
