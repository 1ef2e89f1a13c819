// src/lang/interp.rs

//! Tree-walking evaluator.
//!
//! Name lookup order: the current call frame, then the values of the
//! target's dependencies, then the shared environment, then natives.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::lang::ast::{AssignScope, BinOp, Expr, UnOp};
use crate::lang::budget::Budget;
use crate::lang::builtins::Builtins;
use crate::lang::env::{EnvToken, SharedEnv};
use crate::lang::value::{Closure, Value};

const MAX_DEPTH: usize = 512;

/// Stack of a thread that evaluates commands, sized so that evaluation hits
/// the nested-call limit long before it runs out of stack.
pub const EVAL_STACK_SIZE: usize = 256 * 1024 * 1024;

/// Run `f` on a scoped thread with an [`EVAL_STACK_SIZE`] stack and wait for it.
pub fn on_eval_stack<T, F>(name: &str, f: F) -> std::io::Result<T>
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    std::thread::scope(|scope| {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .stack_size(EVAL_STACK_SIZE)
            .spawn_scoped(scope, f)?;
        Ok(handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
    })
}

/// Which limit an evaluation ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Elapsed,
    Compute,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    /// An ordinary error raised by the code (`stop()`, type errors, ...).
    Runtime(String),
    Limit { kind: LimitKind, limit: Duration },
    Cancelled,
    /// A locked build tried to write to the shared environment.
    Integrity { binding: String },
    /// A dependency value could not be read back from the store.
    Store(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Runtime(msg) => f.write_str(msg),
            EvalError::Limit {
                kind: LimitKind::Elapsed,
                limit,
            } => write!(f, "elapsed time limit of {limit:?} exceeded"),
            EvalError::Limit {
                kind: LimitKind::Compute,
                limit,
            } => write!(f, "compute time limit of {limit:?} exceeded"),
            EvalError::Cancelled => f.write_str("evaluation cancelled"),
            EvalError::Integrity { binding } => {
                write!(f, "attempted to assign '{binding}' in the locked environment")
            }
            EvalError::Store(msg) => write!(f, "failed to load dependency: {msg}"),
        }
    }
}

impl std::error::Error for EvalError {}

pub type EvalResult<T> = Result<T, EvalError>;

pub(crate) fn runtime<T>(msg: impl Into<String>) -> EvalResult<T> {
    Err(EvalError::Runtime(msg.into()))
}

/// Supplies the values of a target's dependencies during evaluation.
pub trait DepSource: Send + Sync {
    /// `None` when `name` is not a dependency of the target being built.
    fn lookup(&self, name: &str) -> Option<Result<Arc<Value>, EvalError>>;
}

/// No dependency values at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDeps;

impl DepSource for NoDeps {
    fn lookup(&self, _name: &str) -> Option<Result<Arc<Value>, EvalError>> {
        None
    }
}

impl DepSource for BTreeMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Result<Arc<Value>, EvalError>> {
        self.get(name).map(|v| Ok(Arc::new(v.clone())))
    }
}

/// Warnings and messages emitted while evaluating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub warnings: Vec<String>,
    pub messages: Vec<String>,
}

/// Things every evaluation needs but never mutates.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub builtins: Arc<Builtins>,
    pub shared: SharedEnv,
    /// Relative file paths are resolved against this directory.
    pub root: PathBuf,
}

impl EvalContext {
    pub fn new(builtins: Arc<Builtins>, shared: SharedEnv, root: impl Into<PathBuf>) -> Self {
        Self {
            builtins,
            shared,
            root: root.into(),
        }
    }
}

/// Arguments to a native function.
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub positional: Vec<Value>,
    pub named: Vec<(String, Value)>,
}

impl Args {
    /// The argument named `name`, else the `index`-th positional one.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.named
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .or_else(|| self.positional.get(index))
    }

    pub fn require(&self, index: usize, name: &str, func: &str) -> EvalResult<&Value> {
        match self.get(index, name) {
            Some(v) => Ok(v),
            None => runtime(format!("{func}(): argument '{name}' is missing")),
        }
    }

    pub fn named(&self, name: &str) -> Option<&Value> {
        self.named.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Every argument value, positional first.
    pub fn all(&self) -> impl Iterator<Item = &Value> {
        self.positional
            .iter()
            .chain(self.named.iter().map(|(_, v)| v))
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Interpreter<'a> {
    ctx: &'a EvalContext,
    token: &'a EnvToken,
    deps: &'a dyn DepSource,
    budget: &'a Budget,
    frames: Vec<BTreeMap<String, Value>>,
    call_stack: Vec<String>,
    traceback: Vec<String>,
    diagnostics: Diagnostics,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        ctx: &'a EvalContext,
        token: &'a EnvToken,
        deps: &'a dyn DepSource,
        budget: &'a Budget,
    ) -> Self {
        Self {
            ctx,
            token,
            deps,
            budget,
            frames: vec![BTreeMap::new()],
            call_stack: Vec::new(),
            traceback: Vec::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn context(&self) -> &EvalContext {
        self.ctx
    }

    pub fn token(&self) -> &EnvToken {
        self.token
    }

    pub fn budget(&self) -> &Budget {
        self.budget
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Diagnostics {
        self.diagnostics
    }

    /// Call stack at the innermost point the last error was raised.
    pub fn traceback(&self) -> &[String] {
        &self.traceback
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::warn!(target: "pipewright::eval", "{msg}");
        self.diagnostics.warnings.push(msg);
    }

    pub fn message(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::info!(target: "pipewright::eval", "{msg}");
        self.diagnostics.messages.push(msg);
    }

    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.ctx.root.join(p)
        }
    }

    /// Evaluate statements in the current frame, returning the last value.
    pub fn eval_program(&mut self, exprs: &[Expr]) -> EvalResult<Value> {
        let mut last = Value::Null;
        for expr in exprs {
            last = self.eval(expr)?;
        }
        Ok(last)
    }

    /// Evaluate in a fresh top-level frame.
    pub fn eval_isolated(&mut self, exprs: &[Expr]) -> EvalResult<Value> {
        self.eval_document(|interp| interp.eval_program(exprs))
    }

    /// Run `f` inside a fresh frame shared by everything it evaluates.
    pub fn eval_document<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> EvalResult<T>,
    ) -> EvalResult<T> {
        self.frames.push(BTreeMap::new());
        let result = f(self);
        self.frames.pop();
        result
    }

    /// Bindings of the current frame (top-level assignments of a script).
    pub fn frame(&self) -> &BTreeMap<String, Value> {
        // There is always at least the frame created in `new`.
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut BTreeMap<String, Value> {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Resolve a symbol to a value.
    pub fn lookup(&mut self, name: &str) -> EvalResult<Value> {
        self.lookup_where(name, |_| true)?
            .map_or_else(|| runtime(format!("object '{name}' not found")), Ok)
    }

    /// Resolve a symbol in call position, skipping non-function bindings.
    pub fn lookup_function(&mut self, name: &str) -> EvalResult<Value> {
        self.lookup_where(name, Value::is_callable)?
            .map_or_else(|| runtime(format!("could not find function '{name}'")), Ok)
    }

    fn lookup_where(
        &mut self,
        name: &str,
        accept: impl Fn(&Value) -> bool,
    ) -> EvalResult<Option<Value>> {
        if let Some(v) = self.frame().get(name) {
            if accept(v) {
                return Ok(Some(v.clone()));
            }
        }

        let start = Instant::now();
        let dep = self.deps.lookup(name);
        self.budget.exclude(start.elapsed());
        if let Some(dep) = dep {
            let value = dep?;
            if accept(&value) {
                return Ok(Some(value.as_ref().clone()));
            }
        }

        if let Some(v) = self.ctx.shared.get(name) {
            if accept(&v) {
                return Ok(Some(v));
            }
        }

        if self.ctx.builtins.contains(name) {
            return Ok(Some(Value::Native(name.to_string())));
        }
        Ok(None)
    }

    pub fn eval(&mut self, expr: &Expr) -> EvalResult<Value> {
        self.budget.check()?;
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Ident(name) => self.lookup(name),
            Expr::Namespaced { pkg, name, .. } => {
                let qualified = format!("{pkg}::{name}");
                if let Some(v) = self.ctx.shared.get(&qualified) {
                    return Ok(v);
                }
                if self.ctx.builtins.contains(&qualified) {
                    return Ok(Value::Native(qualified));
                }
                if self.ctx.builtins.contains(name) {
                    return Ok(Value::Native(name.clone()));
                }
                runtime(format!("'{name}' is not exported by namespace '{pkg}'"))
            }
            Expr::Call { callee, args } => {
                let (func, label) = match callee.as_ref() {
                    Expr::Ident(name) => (self.lookup_function(name)?, name.clone()),
                    other => (self.eval(other)?, other.to_string()),
                };
                let mut evaluated = Args::default();
                for arg in args {
                    let value = self.eval(&arg.value)?;
                    match &arg.name {
                        Some(name) => evaluated.named.push((name.clone(), value)),
                        None => evaluated.positional.push(value),
                    }
                }
                self.apply_named(&func, evaluated, &label)
            }
            Expr::Function { params, body } => Ok(Value::Closure(Closure {
                params: params.clone(),
                body: body.as_ref().clone(),
                captured: self.capture(),
            })),
            Expr::Block(exprs) => self.eval_program(exprs),
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                let c = self.eval(cond)?;
                match c.truthy() {
                    Some(true) => self.eval(then),
                    Some(false) => match otherwise {
                        Some(e) => self.eval(e),
                        None => Ok(Value::Null),
                    },
                    None => runtime(format!("argument is not interpretable as logical: {c}")),
                }
            }
            Expr::Assign {
                target,
                value,
                scope,
            } => {
                let v = self.eval(value)?;
                match scope {
                    AssignScope::Local => {
                        self.frame_mut().insert(target.clone(), v.clone());
                    }
                    AssignScope::Shared => self.token.assign(target, v.clone())?,
                }
                Ok(v)
            }
            Expr::Binary { op, lhs, rhs } => match op {
                BinOp::And => {
                    if !self.condition(lhs, "&&")? {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(self.condition(rhs, "&&")?))
                }
                BinOp::Or => {
                    if self.condition(lhs, "||")? {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(self.condition(rhs, "||")?))
                }
                _ => {
                    let a = self.eval(lhs)?;
                    let b = self.eval(rhs)?;
                    binary_op(*op, &a, &b)
                }
            },
            Expr::Unary { op, expr } => {
                let v = self.eval(expr)?;
                unary_op(*op, &v)
            }
            Expr::Index {
                target,
                index,
                double,
            } => {
                let t = self.eval(target)?;
                let i = self.eval(index)?;
                index_value(&t, &i, *double)
            }
            Expr::Field { target, name } => {
                let t = self.eval(target)?;
                match t {
                    Value::Record(fields) => Ok(fields.get(name).cloned().unwrap_or(Value::Null)),
                    Value::Null => Ok(Value::Null),
                    other => runtime(format!("$ operator is invalid for {}", other.class())),
                }
            }
        }
    }

    fn condition(&mut self, expr: &Expr, op: &str) -> EvalResult<bool> {
        let v = self.eval(expr)?;
        match v.truthy() {
            Some(b) => Ok(b),
            None => runtime(format!("invalid operand for '{op}': {v}")),
        }
    }

    fn capture(&self) -> BTreeMap<String, Value> {
        self.frame().clone()
    }

    /// Call a function value.
    pub fn apply(&mut self, func: &Value, args: Args) -> EvalResult<Value> {
        let label = match func {
            Value::Native(name) | Value::Generic(name) => name.clone(),
            _ => "<anonymous>".to_string(),
        };
        self.apply_named(func, args, &label)
    }

    fn apply_named(&mut self, func: &Value, args: Args, label: &str) -> EvalResult<Value> {
        if self.call_stack.len() >= MAX_DEPTH {
            return runtime("evaluation nested too deeply: infinite recursion?");
        }
        self.call_stack.push(label.to_string());
        let result = self.dispatch_call(func, args, label);
        if result.is_err() && self.traceback.is_empty() {
            self.traceback = self.call_stack.clone();
        }
        self.call_stack.pop();
        result
    }

    fn dispatch_call(&mut self, func: &Value, args: Args, label: &str) -> EvalResult<Value> {
        match func {
            Value::Closure(closure) => self.call_closure(closure, args, label),
            Value::Native(name) => {
                let native = match self.ctx.builtins.get(name) {
                    Some(f) => f,
                    None => return runtime(format!("could not find function '{name}'")),
                };
                native(self, args)
            }
            Value::Vectorized(inner) => {
                let mut args = args;
                if args.positional.is_empty() {
                    return self.apply_named(inner, args, label);
                }
                let first = args.positional.remove(0);
                match first {
                    Value::List(items) => {
                        let mut out = Vec::with_capacity(items.len());
                        for item in items {
                            let mut call = args.clone();
                            call.positional.insert(0, item);
                            out.push(self.apply_named(inner, call, label)?);
                        }
                        Ok(Value::List(out))
                    }
                    scalar => {
                        args.positional.insert(0, scalar);
                        self.apply_named(inner, args, label)
                    }
                }
            }
            Value::Generic(name) => {
                let class = args
                    .positional
                    .first()
                    .or_else(|| args.named.first().map(|(_, v)| v))
                    .map(Value::class)
                    .unwrap_or_else(|| "NULL".to_string());
                let method = match self.lookup_where(&format!("{name}.{class}"), Value::is_callable)? {
                    Some(m) => m,
                    None => match self.lookup_where(&format!("{name}.default"), Value::is_callable)? {
                        Some(m) => m,
                        None => {
                            return runtime(format!(
                                "no applicable method for '{name}' applied to an object of class '{class}'"
                            ));
                        }
                    },
                };
                self.apply_named(&method, args, &format!("{name}.{class}"))
            }
            other => runtime(format!("attempt to apply non-function: {other}")),
        }
    }

    fn call_closure(&mut self, closure: &Closure, args: Args, label: &str) -> EvalResult<Value> {
        let mut frame = closure.captured.clone();
        let mut bound = vec![false; closure.params.len()];

        for (name, value) in args.named {
            match closure.params.iter().position(|p| p.name == name) {
                Some(i) if !bound[i] => {
                    frame.insert(name, value);
                    bound[i] = true;
                }
                Some(_) => {
                    return runtime(format!("{label}(): formal argument '{name}' matched twice"));
                }
                None => return runtime(format!("{label}(): unused argument ({name} = ...)")),
            }
        }
        let mut positional = args.positional.into_iter();
        for (i, param) in closure.params.iter().enumerate() {
            if bound[i] {
                continue;
            }
            if let Some(value) = positional.next() {
                frame.insert(param.name.clone(), value);
                bound[i] = true;
            }
        }
        if let Some(extra) = positional.next() {
            return runtime(format!("{label}(): unused argument ({extra})"));
        }

        self.frames.push(frame);
        let result = self
            .bind_defaults(closure, &bound, label)
            .and_then(|()| self.eval(&closure.body));
        self.frames.pop();
        result
    }

    fn bind_defaults(&mut self, closure: &Closure, bound: &[bool], label: &str) -> EvalResult<()> {
        for (param, bound) in closure.params.iter().zip(bound) {
            if *bound {
                continue;
            }
            match &param.default {
                Some(default) => {
                    let v = self.eval(default)?;
                    self.frame_mut().insert(param.name.clone(), v);
                }
                None => {
                    return runtime(format!(
                        "{label}(): argument '{}' is missing, with no default",
                        param.name
                    ));
                }
            }
        }
        Ok(())
    }
}

fn num_operand(v: &Value, op: BinOp) -> EvalResult<f64> {
    match v {
        Value::Num(n) => Ok(*n),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => runtime(format!(
            "non-numeric argument to binary operator '{}': {}",
            op.symbol(),
            other.class()
        )),
    }
}

fn is_vector(v: &Value) -> bool {
    matches!(v, Value::List(_) | Value::Null)
}

/// Apply `op` element-wise with recycling when either side is a vector.
fn recycle(
    a: &Value,
    b: &Value,
    f: impl Fn(&Value, &Value) -> EvalResult<Value>,
) -> EvalResult<Value> {
    let xs = a.elements();
    let ys = b.elements();
    if xs.is_empty() || ys.is_empty() {
        return Ok(Value::List(Vec::new()));
    }
    let n = xs.len().max(ys.len());
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        out.push(f(&xs[i % xs.len()], &ys[i % ys.len()])?);
    }
    Ok(Value::List(out))
}

pub(crate) fn binary_op(op: BinOp, a: &Value, b: &Value) -> EvalResult<Value> {
    if is_vector(a) || is_vector(b) {
        return recycle(a, b, |x, y| binary_op(op, x, y));
    }
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Pow => {
            let x = num_operand(a, op)?;
            let y = num_operand(b, op)?;
            let r = match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => x / y,
                BinOp::Mod => x - (x / y).floor() * y,
                _ => x.powf(y),
            };
            Ok(Value::Num(r))
        }
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (a, b) {
                (Value::Str(x), Value::Str(y)) => x.partial_cmp(y),
                (Value::Str(x), other) | (other, Value::Str(x)) if !other.is_callable() => {
                    let text = other.display_text();
                    if matches!(a, Value::Str(_)) {
                        x.as_str().partial_cmp(text.as_str())
                    } else {
                        text.as_str().partial_cmp(x.as_str())
                    }
                }
                _ => match (a.as_num(), b.as_num()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => {
                        return match op {
                            BinOp::Eq => Ok(Value::Bool(a == b)),
                            BinOp::Ne => Ok(Value::Bool(a != b)),
                            _ => runtime(format!(
                                "comparison '{}' is not possible for {} and {}",
                                op.symbol(),
                                a.class(),
                                b.class()
                            )),
                        };
                    }
                },
            };
            let Some(ord) = ordering else {
                // NaN compares false to everything.
                return Ok(Value::Bool(op == BinOp::Ne));
            };
            use std::cmp::Ordering::*;
            let r = match op {
                BinOp::Eq => ord == Equal,
                BinOp::Ne => ord != Equal,
                BinOp::Lt => ord == Less,
                BinOp::Le => ord != Greater,
                BinOp::Gt => ord == Greater,
                _ => ord != Less,
            };
            Ok(Value::Bool(r))
        }
        BinOp::And | BinOp::Or => {
            let x = a.truthy();
            let y = b.truthy();
            match (x, y) {
                (Some(x), Some(y)) => Ok(Value::Bool(if op == BinOp::And {
                    x && y
                } else {
                    x || y
                })),
                _ => runtime(format!("invalid operands for '{}'", op.symbol())),
            }
        }
    }
}

fn unary_op(op: UnOp, v: &Value) -> EvalResult<Value> {
    match (op, v) {
        (_, Value::List(items)) => Ok(Value::List(
            items
                .iter()
                .map(|item| unary_op(op, item))
                .collect::<EvalResult<_>>()?,
        )),
        (UnOp::Neg, Value::Num(n)) => Ok(Value::Num(-n)),
        (UnOp::Neg, Value::Bool(b)) => Ok(Value::Num(if *b { -1.0 } else { 0.0 })),
        (UnOp::Not, other) => match other.truthy() {
            Some(b) => Ok(Value::Bool(!b)),
            None => runtime(format!("invalid argument type for '!': {}", other.class())),
        },
        (UnOp::Neg, other) => runtime(format!("invalid argument to unary operator: {}", other.class())),
    }
}

fn position(i: &Value, len: usize) -> EvalResult<Option<usize>> {
    match i.as_num() {
        Some(n) if n >= 1.0 && n.fract() == 0.0 => {
            let idx = n as usize - 1;
            Ok((idx < len).then_some(idx))
        }
        Some(n) => runtime(format!("invalid subscript {n}")),
        None => runtime(format!("invalid subscript type '{}'", i.class())),
    }
}

fn index_value(target: &Value, index: &Value, double: bool) -> EvalResult<Value> {
    match target {
        Value::Record(fields) => {
            let key = match index {
                Value::Str(key) => key.clone(),
                other => {
                    let values: Vec<&Value> = fields.values().collect();
                    return match position(other, values.len())? {
                        Some(i) => Ok(values[i].clone()),
                        None if double => runtime("subscript out of bounds"),
                        None => Ok(Value::Null),
                    };
                }
            };
            match fields.get(&key) {
                Some(v) if double => Ok(v.clone()),
                Some(v) => {
                    let mut sub = BTreeMap::new();
                    sub.insert(key, v.clone());
                    Ok(Value::Record(sub))
                }
                None if double => runtime(format!("subscript '{key}' out of bounds")),
                None => Ok(Value::Null),
            }
        }
        Value::Null => Ok(Value::Null),
        _ => {
            let items = target.elements();
            if !double {
                if let Value::List(picks) = index {
                    let mut out = Vec::with_capacity(picks.len());
                    for pick in picks {
                        out.push(match position(pick, items.len())? {
                            Some(i) => items[i].clone(),
                            None => Value::Null,
                        });
                    }
                    return Ok(Value::List(out));
                }
            }
            match position(index, items.len())? {
                Some(i) if double || !matches!(target, Value::List(_)) => Ok(items[i].clone()),
                Some(i) => Ok(Value::List(vec![items[i].clone()])),
                None if double => runtime("subscript out of bounds"),
                None => Ok(Value::Null),
            }
        }
    }
}
