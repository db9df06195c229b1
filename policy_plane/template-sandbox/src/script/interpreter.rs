// Tree-walking interpreter for rule scripts.
//
// Design Principles:
// 1. No ambient authority - the only globals are inert namespaces
//    (Math, JSON, console, Object, Array, utils) gated by capabilities
// 2. Forbidden names (require, process, fs, ...) fail with a security error
// 3. Every statement, expression and loop iteration is metered
// 4. Bindings are charged against the memory budget when written and
//    released when their scope ends; large transient results are checked
//    before they are built

use std::collections::HashMap;

use log::debug;
use serde_json::{Map, Value};

use super::ast::{BinaryOp, Expr, Stmt, UnaryOp};
use super::value::{
    compare, display, loose_eq, measure, number, relative_index, to_number, truthy, type_of,
    MAX_VALUE_DEPTH,
};
use crate::capability::{Capability, CapabilitySet, UtilityRegistry};
use crate::error::SandboxError;
use crate::limits::ExecutionBudget;

type EvalResult<T> = Result<T, SandboxError>;

const FORBIDDEN_GLOBALS: &[&str] = &[
    "require",
    "process",
    "eval",
    "Function",
    "fs",
    "child_process",
    "fetch",
    "import",
    "globalThis",
    "global",
    "window",
    "module",
    "exports",
    "XMLHttpRequest",
    "WebSocket",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "Deno",
    "Bun",
];

const FORBIDDEN_PROPERTIES: &[&str] = &[
    "__proto__",
    "constructor",
    "prototype",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
];

const GLOBAL_FUNCTIONS: &[&str] = &[
    "String", "Number", "Boolean", "parseFloat", "len", "keys",
];

const MAX_LOG_LINES: usize = 256;
const MAX_LOG_LINE_CHARS: usize = 1024;
/// Largest gap an index assignment may open at the end of an array
const MAX_ARRAY_GROWTH: usize = 1024;

fn namespace_capability(name: &str) -> Option<Capability> {
    match name {
        "Math" => Some(Capability::Math),
        "JSON" => Some(Capability::Json),
        "console" => Some(Capability::Logger),
        "utils" => Some(Capability::Utilities),
        "Object" | "Array" => Some(Capability::Collections),
        _ => None,
    }
}

fn check_property(name: &str) -> EvalResult<()> {
    if FORBIDDEN_PROPERTIES.contains(&name) {
        return Err(SandboxError::security(format!(
            "access to `{}` is not permitted",
            name
        )));
    }
    Ok(())
}

fn forbidden(name: &str) -> SandboxError {
    SandboxError::security(format!("`{}` is not available in the sandbox", name))
}

struct Binding {
    value: Value,
    size: u64,
}

enum Flow {
    Next,
    Return(Value),
    Break,
    Continue,
}

pub(crate) struct Interpreter<'r> {
    budget: &'r mut ExecutionBudget,
    scopes: Vec<HashMap<String, Binding>>,
    logs: Vec<String>,
    utilities: &'r UtilityRegistry,
    capabilities: &'r CapabilitySet,
}

impl<'r> Interpreter<'r> {
    pub fn new(
        budget: &'r mut ExecutionBudget,
        utilities: &'r UtilityRegistry,
        capabilities: &'r CapabilitySet,
    ) -> Self {
        Self {
            budget,
            scopes: vec![HashMap::new()],
            logs: Vec::new(),
            utilities,
            capabilities,
        }
    }

    /// Bind a host-provided value in the outermost scope
    pub fn bind_global(&mut self, name: &str, value: Value) -> EvalResult<()> {
        self.declare(name, value)
    }

    pub fn run(&mut self, program: &[Stmt]) -> EvalResult<Value> {
        match self.exec_stmts(program)? {
            Flow::Return(v) => Ok(v),
            Flow::Next => Ok(Value::Null),
            Flow::Break | Flow::Continue => Err(SandboxError::runtime(
                "break or continue outside of a loop",
            )),
        }
    }

    pub fn into_logs(self) -> Vec<String> {
        self.logs
    }

    // ========================================================================
    // Scopes and bindings
    // ========================================================================

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            let freed: u64 = scope.values().map(|b| b.size).sum();
            self.budget.release(freed);
        }
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn is_local(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    fn measure_checked(value: &Value) -> EvalResult<u64> {
        let (size, depth) = measure(value);
        if depth > MAX_VALUE_DEPTH {
            return Err(SandboxError::runtime("value nesting too deep"));
        }
        Ok(size)
    }

    fn declare(&mut self, name: &str, value: Value) -> EvalResult<()> {
        if FORBIDDEN_GLOBALS.contains(&name)
            || namespace_capability(name).is_some()
            || GLOBAL_FUNCTIONS.contains(&name)
        {
            return Err(SandboxError::security(format!(
                "`{}` cannot be redefined",
                name
            )));
        }
        let size = Self::measure_checked(&value)?;
        let scope = match self.scopes.last_mut() {
            Some(scope) => scope,
            None => return Err(SandboxError::runtime("no active scope")),
        };
        let old = scope.get(name).map(|b| b.size).unwrap_or(0);
        self.budget.rebind(old, size)?;
        scope.insert(name.to_string(), Binding { value, size });
        Ok(())
    }

    fn set_var(&mut self, name: &str, value: Value) -> EvalResult<()> {
        let size = Self::measure_checked(&value)?;
        for scope in self.scopes.iter_mut().rev() {
            if let Some(binding) = scope.get_mut(name) {
                self.budget.rebind(binding.size, size)?;
                binding.value = value;
                binding.size = size;
                return Ok(());
            }
        }
        if FORBIDDEN_GLOBALS.contains(&name) {
            return Err(forbidden(name));
        }
        Err(SandboxError::runtime(format!("{} is not defined", name)))
    }

    fn assign(&mut self, target: &Expr, value: Value) -> EvalResult<()> {
        match target {
            Expr::Ident(name) => self.set_var(name, value),
            Expr::Member(obj, key) => {
                check_property(key)?;
                let mut container = self.eval(obj)?;
                set_key(&mut container, Value::String(key.clone()), value)?;
                self.assign(obj, container)
            }
            Expr::Index(obj, idx) => {
                let key = self.eval(idx)?;
                let mut container = self.eval(obj)?;
                set_key(&mut container, key, value)?;
                self.assign(obj, container)
            }
            _ => Err(SandboxError::runtime("invalid assignment target")),
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn exec_stmts(&mut self, stmts: &[Stmt]) -> EvalResult<Flow> {
        for stmt in stmts {
            match self.exec(stmt)? {
                Flow::Next => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Next)
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> EvalResult<Flow> {
        self.push_scope();
        let flow = self.exec_stmts(stmts);
        self.pop_scope();
        flow
    }

    fn exec(&mut self, stmt: &Stmt) -> EvalResult<Flow> {
        self.budget.tick()?;
        match stmt {
            Stmt::Let(name, init) => {
                let value = self.eval(init)?;
                self.declare(name, value)?;
                Ok(Flow::Next)
            }
            Stmt::Assign(target, rhs) => {
                let value = self.eval(rhs)?;
                self.assign(target, value)?;
                Ok(Flow::Next)
            }
            Stmt::CompoundAssign(op, target, rhs) => {
                let current = self.eval(target)?;
                let operand = self.eval(rhs)?;
                let value = self.binary(*op, current, operand)?;
                self.assign(target, value)?;
                Ok(Flow::Next)
            }
            Stmt::If(cond, then, otherwise) => {
                let c = self.eval(cond)?;
                if truthy(&c) {
                    self.exec_block(then)
                } else if let Some(otherwise) = otherwise {
                    self.exec_block(otherwise)
                } else {
                    Ok(Flow::Next)
                }
            }
            Stmt::While(cond, body) => {
                loop {
                    self.budget.tick()?;
                    let c = self.eval(cond)?;
                    if !truthy(&c) {
                        break;
                    }
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Next | Flow::Continue => {}
                    }
                }
                Ok(Flow::Next)
            }
            Stmt::For { init, cond, update, body } => {
                self.push_scope();
                let flow = self.exec_for(init.as_deref(), cond.as_ref(), update.as_deref(), body);
                self.pop_scope();
                flow
            }
            Stmt::ForOf(name, iterable, body) => {
                let items: Vec<Value> = match self.eval(iterable)? {
                    Value::Array(items) => items,
                    Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
                    Value::Object(_) => {
                        return Err(SandboxError::runtime(
                            "object is not iterable, use Object.keys()",
                        ))
                    }
                    other => {
                        return Err(SandboxError::runtime(format!(
                            "{} is not iterable",
                            type_of(&other)
                        )))
                    }
                };
                for item in items {
                    self.budget.tick()?;
                    self.push_scope();
                    let flow = self.declare(name, item).and_then(|_| self.exec_stmts(body));
                    self.pop_scope();
                    match flow? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Next | Flow::Continue => {}
                    }
                }
                Ok(Flow::Next)
            }
            Stmt::Return(value) => {
                let v = match value {
                    Some(e) => self.eval(e)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(v))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Throw(e) => {
                let v = self.eval(e)?;
                Err(SandboxError::runtime(format!("uncaught {}", display(&v))))
            }
            Stmt::Block(body) => self.exec_block(body),
            Stmt::Expr(e) => {
                self.eval(e)?;
                Ok(Flow::Next)
            }
            Stmt::Empty => Ok(Flow::Next),
        }
    }

    fn exec_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        update: Option<&Stmt>,
        body: &[Stmt],
    ) -> EvalResult<Flow> {
        if let Some(init) = init {
            self.exec(init)?;
        }
        loop {
            self.budget.tick()?;
            if let Some(cond) = cond {
                let c = self.eval(cond)?;
                if !truthy(&c) {
                    break;
                }
            }
            match self.exec_block(body)? {
                Flow::Break => break,
                Flow::Return(v) => return Ok(Flow::Return(v)),
                Flow::Next | Flow::Continue => {}
            }
            if let Some(update) = update {
                self.exec(update)?;
            }
        }
        Ok(Flow::Next)
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn eval(&mut self, expr: &Expr) -> EvalResult<Value> {
        self.budget.tick()?;
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => {
                if let Some(binding) = self.lookup(name) {
                    return Ok(binding.value.clone());
                }
                if FORBIDDEN_GLOBALS.contains(&name.as_str()) {
                    return Err(forbidden(name));
                }
                if namespace_capability(name).is_some() || GLOBAL_FUNCTIONS.contains(&name.as_str()) {
                    return Err(SandboxError::runtime(format!(
                        "`{}` cannot be used as a value",
                        name
                    )));
                }
                Err(SandboxError::runtime(format!("{} is not defined", name)))
            }
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                let value = Value::Array(values);
                self.budget.reserve_transient(Self::measure_checked(&value)?)?;
                Ok(value)
            }
            Expr::Object(props) => {
                let mut map = Map::new();
                for (key, item) in props {
                    check_property(key)?;
                    let v = self.eval(item)?;
                    map.insert(key.clone(), v);
                }
                let value = Value::Object(map);
                self.budget.reserve_transient(Self::measure_checked(&value)?)?;
                Ok(value)
            }
            Expr::Unary(op, operand) => {
                let v = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!truthy(&v)),
                    UnaryOp::Neg => number(-to_number(&v)),
                    UnaryOp::TypeOf => Value::String(type_of(&v).to_string()),
                })
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                let l = self.eval(lhs)?;
                if truthy(&l) {
                    self.eval(rhs)
                } else {
                    Ok(l)
                }
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                let l = self.eval(lhs)?;
                if truthy(&l) {
                    Ok(l)
                } else {
                    self.eval(rhs)
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                self.binary(*op, l, r)
            }
            Expr::Conditional(cond, then, otherwise) => {
                let c = self.eval(cond)?;
                if truthy(&c) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Member(obj, name) => {
                check_property(name)?;
                if let Expr::Ident(root) = obj.as_ref() {
                    if let Some(binding) = self.lookup(root) {
                        return get_member(&binding.value, name);
                    }
                    if let Some(capability) = namespace_capability(root) {
                        self.require(capability)?;
                        return Err(SandboxError::runtime(format!("{}.{} is not a value", root, name)));
                    }
                }
                let target = self.eval(obj)?;
                get_member(&target, name)
            }
            Expr::Index(obj, idx) => {
                let key = self.eval(idx)?;
                if let Value::String(name) = &key {
                    check_property(name)?;
                }
                if let Expr::Ident(root) = obj.as_ref() {
                    if let Some(binding) = self.lookup(root) {
                        return get_index(&binding.value, &key);
                    }
                }
                let target = self.eval(obj)?;
                get_index(&target, &key)
            }
            Expr::Call(callee, args) => self.eval_call(callee, args),
        }
    }

    fn eval_args(&mut self, args: &[Expr]) -> EvalResult<Vec<Value>> {
        args.iter().map(|a| self.eval(a)).collect()
    }

    fn require(&self, capability: Capability) -> EvalResult<()> {
        if self.capabilities.contains(&capability) {
            Ok(())
        } else {
            Err(SandboxError::security(format!(
                "capability `{}` was not granted",
                capability.name()
            )))
        }
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr]) -> EvalResult<Value> {
        match callee {
            Expr::Ident(name) => {
                if FORBIDDEN_GLOBALS.contains(&name.as_str()) {
                    return Err(forbidden(name));
                }
                if self.is_local(name) {
                    return Err(SandboxError::runtime(format!("{} is not a function", name)));
                }
                let args = self.eval_args(args)?;
                self.call_global(name, args)
            }
            Expr::Member(receiver, method) => {
                check_property(method)?;
                if let Expr::Ident(ns) = receiver.as_ref() {
                    if FORBIDDEN_GLOBALS.contains(&ns.as_str()) {
                        return Err(forbidden(ns));
                    }
                    if !self.is_local(ns) {
                        if let Some(capability) = namespace_capability(ns) {
                            self.require(capability)?;
                            let args = self.eval_args(args)?;
                            return self.call_namespace(ns, method, args);
                        }
                    }
                }
                if method == "push" && receiver.is_place() {
                    self.require(Capability::Collections)?;
                    let mut target = self.eval(receiver)?;
                    let args = self.eval_args(args)?;
                    let len = match target.as_array_mut() {
                        Some(items) => {
                            items.extend(args);
                            items.len()
                        }
                        None => {
                            return Err(SandboxError::runtime("push is only defined on arrays"))
                        }
                    };
                    self.assign(receiver, target)?;
                    return Ok(Value::from(len));
                }
                let target = self.eval(receiver)?;
                let args = self.eval_args(args)?;
                self.call_method(target, method, args)
            }
            _ => Err(SandboxError::runtime("expression is not callable")),
        }
    }

    // ========================================================================
    // Operators
    // ========================================================================

    fn binary(&mut self, op: BinaryOp, l: Value, r: Value) -> EvalResult<Value> {
        let arithmetic =
            |f: fn(f64, f64) -> f64| -> EvalResult<Value> { Ok(number(f(to_number(&l), to_number(&r)))) };
        match op {
            BinaryOp::Add => match (&l, &r) {
                (Value::Number(_) | Value::Bool(_) | Value::Null, Value::Number(_) | Value::Bool(_) | Value::Null) => {
                    arithmetic(|a, b| a + b)
                }
                _ => {
                    let (a, b) = (display(&l), display(&r));
                    self.budget.reserve_transient((a.len() + b.len()) as u64)?;
                    Ok(Value::String(a + &b))
                }
            },
            BinaryOp::Sub => arithmetic(|a, b| a - b),
            BinaryOp::Mul => arithmetic(|a, b| a * b),
            BinaryOp::Div | BinaryOp::Rem => {
                let divisor = to_number(&r);
                if divisor == 0.0 {
                    return Err(SandboxError::runtime("division by zero"));
                }
                if op == BinaryOp::Div {
                    arithmetic(|a, b| a / b)
                } else {
                    arithmetic(|a, b| a % b)
                }
            }
            BinaryOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
            BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(&l, &r))),
            BinaryOp::Lt => Ok(Value::Bool(compare(&l, &r).map(|o| o.is_lt()).unwrap_or(false))),
            BinaryOp::LtEq => Ok(Value::Bool(compare(&l, &r).map(|o| o.is_le()).unwrap_or(false))),
            BinaryOp::Gt => Ok(Value::Bool(compare(&l, &r).map(|o| o.is_gt()).unwrap_or(false))),
            BinaryOp::GtEq => Ok(Value::Bool(compare(&l, &r).map(|o| o.is_ge()).unwrap_or(false))),
            BinaryOp::And => Ok(if truthy(&l) { r } else { l }),
            BinaryOp::Or => Ok(if truthy(&l) { l } else { r }),
        }
    }

    // ========================================================================
    // Builtins
    // ========================================================================

    fn call_global(&mut self, name: &str, args: Vec<Value>) -> EvalResult<Value> {
        let first = args.first().cloned().unwrap_or(Value::Null);
        match name {
            "String" => Ok(Value::String(display(&first))),
            "Number" | "parseFloat" => Ok(number(to_number(&first))),
            "Boolean" => Ok(Value::Bool(truthy(&first))),
            "len" => {
                self.require(Capability::Collections)?;
                match &first {
                    Value::Array(items) => Ok(Value::from(items.len())),
                    Value::Object(map) => Ok(Value::from(map.len())),
                    Value::String(s) => Ok(Value::from(s.chars().count())),
                    _ => Ok(Value::from(0)),
                }
            }
            "keys" => {
                self.require(Capability::Collections)?;
                self.call_namespace("Object", "keys", args)
            }
            _ => Err(SandboxError::runtime(format!("{} is not defined", name))),
        }
    }

    fn call_namespace(&mut self, ns: &str, method: &str, args: Vec<Value>) -> EvalResult<Value> {
        match (ns, method) {
            ("Math", m) => math(m, &args),
            ("JSON", "stringify") => {
                let pretty = args.len() > 2;
                let target = args.into_iter().next().unwrap_or(Value::Null);
                let text = if pretty {
                    serde_json::to_string_pretty(&target)
                } else {
                    serde_json::to_string(&target)
                }
                .map_err(|e| SandboxError::runtime(format!("JSON.stringify: {}", e)))?;
                self.budget.reserve_transient(text.len() as u64)?;
                Ok(Value::String(text))
            }
            ("JSON", "parse") => {
                let text = match args.first() {
                    Some(Value::String(s)) => s,
                    _ => return Err(SandboxError::runtime("JSON.parse expects a string")),
                };
                self.budget.reserve_transient(text.len() as u64 * 2)?;
                serde_json::from_str(text)
                    .map_err(|e| SandboxError::runtime(format!("JSON.parse: {}", e)))
            }
            ("console", level @ ("log" | "info" | "warn" | "error" | "debug")) => {
                let line: String = args
                    .iter()
                    .map(display)
                    .collect::<Vec<_>>()
                    .join(" ")
                    .chars()
                    .take(MAX_LOG_LINE_CHARS)
                    .collect();
                if self.logs.len() < MAX_LOG_LINES {
                    debug!("sandbox console.{}: {}", level, line);
                    self.budget.rebind(0, line.len() as u64)?;
                    self.logs.push(line);
                }
                Ok(Value::Null)
            }
            ("utils", name) => {
                let utilities = self.utilities;
                let f = utilities.get(name).ok_or_else(|| {
                    SandboxError::runtime(format!("utils.{} is not a registered utility", name))
                })?;
                let result = (**f)(&args)
                    .map_err(|e| SandboxError::runtime(format!("utils.{}: {}", name, e)))?;
                self.budget.reserve_transient(Self::measure_checked(&result)?)?;
                Ok(result)
            }
            ("Object", "keys") => match args.first() {
                Some(Value::Object(map)) => Ok(Value::Array(
                    map.keys().map(|k| Value::String(k.clone())).collect(),
                )),
                Some(Value::Array(items)) => Ok(Value::Array(
                    (0..items.len()).map(|i| Value::String(i.to_string())).collect(),
                )),
                _ => Ok(Value::Array(Vec::new())),
            },
            ("Array", "isArray") => Ok(Value::Bool(matches!(args.first(), Some(Value::Array(_))))),
            _ => Err(SandboxError::runtime(format!("{}.{} is not a function", ns, method))),
        }
    }

    fn call_method(&mut self, target: Value, method: &str, args: Vec<Value>) -> EvalResult<Value> {
        match target {
            Value::String(s) => {
                self.require(Capability::Text)?;
                self.string_method(&s, method, &args)
            }
            Value::Array(items) => {
                self.require(Capability::Collections)?;
                self.array_method(items, method, args)
            }
            Value::Object(map) => {
                self.require(Capability::Collections)?;
                match method {
                    "hasOwnProperty" => {
                        let key = args.first().map(display).unwrap_or_default();
                        Ok(Value::Bool(map.contains_key(&key)))
                    }
                    _ => Err(SandboxError::runtime(format!("object.{} is not a function", method))),
                }
            }
            Value::Null => Err(SandboxError::runtime(format!(
                "cannot call {} on null",
                method
            ))),
            other => Err(SandboxError::runtime(format!(
                "{}.{} is not a function",
                type_of(&other),
                method
            ))),
        }
    }

    fn string_method(&mut self, s: &str, method: &str, args: &[Value]) -> EvalResult<Value> {
        let arg = |i: usize| args.get(i).map(display).unwrap_or_default();
        let char_len = s.chars().count();
        let char_slice = |start: usize, end: usize| -> String {
            s.chars().skip(start).take(end.saturating_sub(start)).collect()
        };

        match method {
            "includes" => Ok(Value::Bool(s.contains(arg(0).as_str()))),
            "startsWith" => Ok(Value::Bool(s.starts_with(arg(0).as_str()))),
            "endsWith" => Ok(Value::Bool(s.ends_with(arg(0).as_str()))),
            "indexOf" => Ok(match s.find(arg(0).as_str()) {
                Some(byte) => Value::from(s[..byte].chars().count()),
                None => Value::from(-1),
            }),
            "toLowerCase" => Ok(Value::String(s.to_lowercase())),
            "toUpperCase" => Ok(Value::String(s.to_uppercase())),
            "trim" => Ok(Value::String(s.trim().to_string())),
            "slice" => {
                let start = relative_index(args.first(), char_len, 0);
                let end = relative_index(args.get(1), char_len, char_len);
                Ok(Value::String(char_slice(start, end)))
            }
            "split" => {
                let parts: Vec<Value> = if args.is_empty() {
                    vec![Value::String(s.to_string())]
                } else {
                    let sep = arg(0);
                    if sep.is_empty() {
                        s.chars().map(|c| Value::String(c.to_string())).collect()
                    } else {
                        s.split(sep.as_str()).map(|p| Value::String(p.to_string())).collect()
                    }
                };
                let value = Value::Array(parts);
                self.budget.reserve_transient(Self::measure_checked(&value)?)?;
                Ok(value)
            }
            "replace" => {
                let (from, to) = (arg(0), arg(1));
                self.budget.reserve_transient(s.len() as u64 + to.len() as u64)?;
                Ok(Value::String(s.replacen(from.as_str(), &to, 1)))
            }
            "repeat" => {
                let count = to_number(args.first().unwrap_or(&Value::Null));
                if !count.is_finite() || count < 0.0 {
                    return Err(SandboxError::runtime("invalid repeat count"));
                }
                let total = (s.len() as u64).saturating_mul(count as u64);
                self.budget.reserve_transient(total)?;
                Ok(Value::String(s.repeat(count as usize)))
            }
            _ => Err(SandboxError::runtime(format!("string.{} is not a function", method))),
        }
    }

    fn array_method(&mut self, items: Vec<Value>, method: &str, args: Vec<Value>) -> EvalResult<Value> {
        let needle = args.first().cloned().unwrap_or(Value::Null);
        match method {
            "includes" => Ok(Value::Bool(items.iter().any(|v| loose_eq(v, &needle)))),
            "indexOf" => Ok(match items.iter().position(|v| loose_eq(v, &needle)) {
                Some(i) => Value::from(i),
                None => Value::from(-1),
            }),
            "join" => {
                let sep = match args.first() {
                    None | Some(Value::Null) => ",".to_string(),
                    Some(v) => display(v),
                };
                let parts: Vec<String> = items.iter().map(display).collect();
                let total = parts.iter().map(|p| p.len() + sep.len()).sum::<usize>();
                self.budget.reserve_transient(total as u64)?;
                Ok(Value::String(parts.join(&sep)))
            }
            "concat" => {
                let mut out = items;
                for a in args {
                    match a {
                        Value::Array(more) => out.extend(more),
                        other => out.push(other),
                    }
                }
                let value = Value::Array(out);
                self.budget.reserve_transient(Self::measure_checked(&value)?)?;
                Ok(value)
            }
            "slice" => {
                let len = items.len();
                let start = relative_index(args.first(), len, 0);
                let end = relative_index(args.get(1), len, len);
                Ok(Value::Array(
                    items.into_iter().skip(start).take(end.saturating_sub(start)).collect(),
                ))
            }
            _ => Err(SandboxError::runtime(format!("array.{} is not a function", method))),
        }
    }
}

fn math(method: &str, args: &[Value]) -> EvalResult<Value> {
    let n = |i: usize| args.get(i).map(to_number).unwrap_or(f64::NAN);
    let result = match method {
        "max" => args.iter().map(to_number).fold(f64::NEG_INFINITY, f64::max),
        "min" => args.iter().map(to_number).fold(f64::INFINITY, f64::min),
        "abs" => n(0).abs(),
        "floor" => n(0).floor(),
        "ceil" => n(0).ceil(),
        "round" => (n(0) + 0.5).floor(),
        _ => return Err(SandboxError::runtime(format!("Math.{} is not a function", method))),
    };
    Ok(number(result))
}

fn get_member(value: &Value, name: &str) -> EvalResult<Value> {
    match value {
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        Value::Array(items) if name == "length" => Ok(Value::from(items.len())),
        Value::String(s) if name == "length" => Ok(Value::from(s.chars().count())),
        Value::Null => Err(SandboxError::runtime(format!(
            "cannot read property '{}' of null",
            name
        ))),
        _ => Ok(Value::Null),
    }
}

fn get_index(value: &Value, key: &Value) -> EvalResult<Value> {
    match (value, key) {
        (Value::Array(items), Value::Number(_)) => {
            let idx = to_number(key);
            if idx < 0.0 || idx.fract() != 0.0 {
                return Ok(Value::Null);
            }
            Ok(items.get(idx as usize).cloned().unwrap_or(Value::Null))
        }
        (Value::String(s), Value::Number(_)) => {
            let idx = to_number(key);
            if idx < 0.0 || idx.fract() != 0.0 {
                return Ok(Value::Null);
            }
            Ok(s.chars()
                .nth(idx as usize)
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null))
        }
        (Value::Object(map), _) => Ok(map.get(&display(key)).cloned().unwrap_or(Value::Null)),
        (Value::Array(_) | Value::String(_), Value::String(name)) => get_member(value, name),
        (Value::Null, _) => Err(SandboxError::runtime(format!(
            "cannot read property '{}' of null",
            display(key)
        ))),
        _ => Ok(Value::Null),
    }
}

fn set_key(container: &mut Value, key: Value, value: Value) -> EvalResult<()> {
    match container {
        Value::Object(map) => {
            let key = display(&key);
            check_property(&key)?;
            map.insert(key, value);
            Ok(())
        }
        Value::Array(items) => {
            let idx = to_number(&key);
            if idx < 0.0 || idx.fract() != 0.0 || idx.is_nan() {
                return Err(SandboxError::runtime(format!(
                    "invalid array index {}",
                    display(&key)
                )));
            }
            let idx = idx as usize;
            if idx < items.len() {
                items[idx] = value;
            } else if idx <= items.len() + MAX_ARRAY_GROWTH {
                items.resize(idx, Value::Null);
                items.push(value);
            } else {
                return Err(SandboxError::runtime("array index out of range"));
            }
            Ok(())
        }
        other => Err(SandboxError::runtime(format!(
            "cannot set property on {}",
            type_of(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::limits::SandboxLimits;
    use crate::script::parser::parse_program;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn run_with(src: &str, bindings: Vec<(&str, Value)>, caps: CapabilitySet) -> EvalResult<(Value, Vec<String>)> {
        let program = parse_program(src)?;
        let mut budget = ExecutionBudget::new(SandboxLimits::default(), Arc::new(AtomicBool::new(false)));
        let utilities = {
            let mut u = UtilityRegistry::new();
            u.register("double", |args: &[Value]| {
                Ok(number(args.first().map(to_number).unwrap_or(0.0) * 2.0))
            });
            u
        };
        let mut interp = Interpreter::new(&mut budget, &utilities, &caps);
        for (name, value) in bindings {
            interp.bind_global(name, value)?;
        }
        let result = interp.run(&program)?;
        Ok((result, interp.into_logs()))
    }

    fn run(src: &str) -> EvalResult<Value> {
        run_with(src, vec![], Capability::all()).map(|(v, _)| v)
    }

    #[test]
    fn test_arithmetic_and_strings() {
        assert_eq!(run("return 1 + 2 * 3 - 4 / 2;").unwrap(), json!(5));
        assert_eq!(run("return 'a' + 1 + 2;").unwrap(), json!("a12"));
        assert_eq!(run("return 7 % 4;").unwrap(), json!(3));
        assert_eq!(run("return 'Eval('.toLowerCase().startsWith('eval');").unwrap(), json!(true));
        assert!(matches!(run("return 1 / 0;"), Err(SandboxError::Runtime(_))));
    }

    #[test]
    fn test_loops_and_collections() {
        let src = r#"
            let out = [];
            for (let i = 0; i < 5; i++) {
                if (i % 2 == 0) continue;
                out.push(i);
            }
            let total = 0;
            for (const n of out) { total += n; }
            let obj = { count: total };
            obj.items = out;
            obj["extra"] = Object.keys(obj).length;
            return obj;
        "#;
        assert_eq!(run(src).unwrap(), json!({"count": 4, "items": [1, 3], "extra": 2}));
    }

    #[test]
    fn test_context_binding_and_utils() {
        let ctx = json!({"rules": {"deny": ["eval(", "rm -rf"]}});
        let src = "let n = context.rules.deny.length; console.log('deny count', n); return utils.double(n);";
        let (value, logs) = run_with(src, vec![("context", ctx)], Capability::all()).unwrap();
        assert_eq!(value, json!(4));
        assert_eq!(logs, vec!["deny count 2".to_string()]);
    }

    #[test]
    fn test_forbidden_globals_are_security_errors() {
        assert!(matches!(run("return process;"), Err(SandboxError::Security(_))));
        assert!(matches!(run("require('fs');"), Err(SandboxError::Security(_))));
        assert!(matches!(run("let x = {}; return x.__proto__;"), Err(SandboxError::Security(_))));
        assert!(matches!(run("let process = 1;"), Err(SandboxError::Security(_))));
    }

    #[test]
    fn test_capabilities_are_enforced() {
        let caps: CapabilitySet = [Capability::Math].into_iter().collect();
        assert!(run_with("return Math.max(1, 3);", vec![], caps.clone()).is_ok());
        assert!(matches!(
            run_with("return JSON.stringify({});", vec![], caps),
            Err(SandboxError::Security(_))
        ));
    }

    #[test]
    fn test_throw_and_undefined_variable() {
        assert!(matches!(run("throw 'bad';"), Err(SandboxError::Runtime(m)) if m.contains("bad")));
        assert!(matches!(run("return missing;"), Err(SandboxError::Runtime(_))));
    }

    #[test]
    fn test_memory_ceiling() {
        let program = parse_program("let s = 'x'.repeat(2000000); return s.length;").unwrap();
        let mut budget = ExecutionBudget::new(SandboxLimits::new(1000, 1), Arc::new(AtomicBool::new(false)));
        let utilities = UtilityRegistry::new();
        let caps = Capability::all();
        let mut interp = Interpreter::new(&mut budget, &utilities, &caps);
        assert!(matches!(interp.run(&program), Err(SandboxError::Memory { .. })));
    }

    #[test]
    fn test_scope_release() {
        let program = parse_program("{ let big = 'y'.repeat(1000); } return 1;").unwrap();
        let mut budget = ExecutionBudget::new(SandboxLimits::default(), Arc::new(AtomicBool::new(false)));
        let utilities = UtilityRegistry::new();
        let caps = Capability::all();
        {
            let mut interp = Interpreter::new(&mut budget, &utilities, &caps);
            interp.run(&program).unwrap();
        }
        assert_eq!(budget.live_bytes(), 0);
        assert!(budget.peak_bytes() >= 1000);
    }
}
