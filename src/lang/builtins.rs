// src/lang/builtins.rs

//! Native functions available to every command.
//!
//! Embedders add their own with [`Builtins::register`]. The file-marker
//! natives (`file_in`, `file_out`, `knitr_in`) and `ignore`/`no_deps` are
//! identity functions at run time; their meaning comes from dependency
//! extraction.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::lang::document;
use crate::lang::interp::{runtime, Args, EvalError, EvalResult, Interpreter};
use crate::lang::parser::parse_program;
use crate::lang::value::Value;

/// Signature of a native function.
pub type NativeFn = Arc<dyn Fn(&mut Interpreter<'_>, Args) -> EvalResult<Value> + Send + Sync>;

/// Registry of native functions, keyed by the name commands call them by.
#[derive(Clone, Default)]
pub struct Builtins {
    natives: HashMap<String, NativeFn>,
}

impl fmt::Debug for Builtins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.natives.keys().collect();
        names.sort();
        f.debug_struct("Builtins").field("natives", &names).finish()
    }
}

impl Builtins {
    /// An empty registry.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The standard library.
    pub fn standard() -> Self {
        let mut b = Self::empty();

        b.register("c", native_c);
        b.register("list", native_list);
        b.register("length", |_, args| {
            Ok(Value::Num(args.require(0, "x", "length")?.len() as f64))
        });
        b.register("sum", |_, args| Ok(Value::Num(numbers(&args, "sum")?.iter().sum())));
        b.register("mean", |_, args| {
            let xs = numbers(&args, "mean")?;
            Ok(Value::Num(xs.iter().sum::<f64>() / xs.len() as f64))
        });
        b.register("min", |_, args| extremum(&args, "min", f64::min));
        b.register("max", |_, args| extremum(&args, "max", f64::max));
        b.register("seq", native_seq);
        b.register("rev", |_, args| {
            let mut items = args.require(0, "x", "rev")?.elements();
            items.reverse();
            Ok(Value::List(items))
        });
        b.register("sort", native_sort);
        b.register("unlist", |_, args| {
            let mut out = Vec::new();
            flatten(args.require(0, "x", "unlist")?, &mut out);
            Ok(Value::List(out))
        });
        b.register("sqrt", |_, args| numeric_map(&args, "sqrt", f64::sqrt));
        b.register("abs", |_, args| numeric_map(&args, "abs", f64::abs));
        b.register("round", |_, args| {
            let digits = match args.get(1, "digits") {
                Some(d) => d.as_num().unwrap_or(0.0),
                None => 0.0,
            };
            let scale = 10f64.powf(digits);
            numeric_map(&args, "round", move |x| (x * scale).round() / scale)
        });

        b.register("paste", |_, args| paste(&args, " "));
        b.register("paste0", |_, args| paste(&args, ""));
        b.register("toupper", |_, args| {
            string_map(args.require(0, "x", "toupper")?, |s| Value::Str(s.to_uppercase()))
        });
        b.register("tolower", |_, args| {
            string_map(args.require(0, "x", "tolower")?, |s| Value::Str(s.to_lowercase()))
        });
        b.register("nchar", |_, args| {
            string_map(args.require(0, "x", "nchar")?, |s| {
                Value::Num(s.chars().count() as f64)
            })
        });
        b.register("as.character", |_, args| {
            string_map(args.require(0, "x", "as.character")?, |s| Value::Str(s.to_string()))
        });
        b.register("as.numeric", native_as_numeric);

        b.register("names", |_, args| match args.require(0, "x", "names")? {
            Value::Record(fields) => Ok(Value::List(
                fields.keys().map(|k| Value::Str(k.clone())).collect(),
            )),
            _ => Ok(Value::Null),
        });
        b.register("class", |_, args| {
            Ok(Value::Str(args.require(0, "x", "class")?.class()))
        });
        b.register("structure", native_structure);
        b.register("is.null", |_, args| {
            Ok(Value::Bool(matches!(args.get(0, "x"), None | Some(Value::Null))))
        });
        b.register("is.function", |_, args| {
            Ok(Value::Bool(args.get(0, "x").is_some_and(Value::is_callable)))
        });
        b.register("identity", passthrough);
        b.register("invisible", passthrough);

        b.register("get", |interp, args| match args.require(0, "x", "get")? {
            Value::Str(name) => interp.lookup(name),
            other => runtime(format!("get(): invalid first argument {other}")),
        });
        b.register("map", native_map);
        b.register("lapply", native_map);
        b.register("vectorize", |_, args| {
            let f = args.require(0, "f", "vectorize")?;
            if !f.is_callable() {
                return runtime(format!("vectorize(): {f} is not a function"));
            }
            Ok(Value::Vectorized(Box::new(f.clone())))
        });
        b.register("generic", |_, args| match args.require(0, "name", "generic")? {
            Value::Str(name) => Ok(Value::Generic(name.clone())),
            other => runtime(format!("generic(): expected a name, got {other}")),
        });

        b.register("stop", |_, args| runtime(joined(&args)));
        b.register("warning", |interp, args| {
            let msg = joined(&args);
            interp.warn(msg.clone());
            Ok(Value::Str(msg))
        });
        b.register("message", |interp, args| {
            interp.message(joined(&args));
            Ok(Value::Null)
        });
        b.register("print", |interp, args| {
            let value = args.require(0, "x", "print")?.clone();
            interp.message(value.display_text());
            Ok(value)
        });
        b.register("sleep", |interp, args| {
            let duration = match args.require(0, "seconds", "sleep")?.as_num() {
                Some(s) => Duration::try_from_secs_f64(s).map_err(|e| {
                    EvalError::Runtime(format!("sleep(): invalid 'seconds' value {s}: {e}"))
                })?,
                None => return runtime("sleep(): invalid 'seconds' value"),
            };
            interp.budget().sleep(duration)?;
            Ok(Value::Null)
        });

        b.register("read_lines", |interp, args| {
            let text = read_to_string(interp, args.require(0, "path", "read_lines")?)?;
            Ok(Value::List(text.lines().map(Value::from).collect()))
        });
        b.register("read_file", |interp, args| {
            Ok(Value::Str(read_to_string(interp, args.require(0, "path", "read_file")?)?))
        });
        b.register("write_lines", |interp, args| {
            let lines = args.require(0, "x", "write_lines")?;
            let path = args.require(1, "path", "write_lines")?;
            let mut text = String::new();
            for line in lines.elements() {
                text.push_str(&line.display_text());
                text.push('\n');
            }
            write_string(interp, path, &text)
        });
        b.register("write_file", |interp, args| {
            let text = args.require(0, "x", "write_file")?.display_text();
            let path = args.require(1, "path", "write_file")?;
            write_string(interp, path, &text)
        });
        b.register("file_exists", |interp, args| {
            let path = path_arg(args.require(0, "path", "file_exists")?, "file_exists")?;
            Ok(Value::Bool(interp.resolve_path(&path).exists()))
        });
        b.register("knit", native_knit);

        b.register("readd", |interp, args| match args.require(0, "target", "readd")? {
            Value::Str(name) => interp.lookup(name),
            other => Ok(other.clone()),
        });
        b.register("loadd", |_, _| Ok(Value::Null));

        b.register("file_in", markers);
        b.register("file_out", markers);
        b.register("knitr_in", markers);
        b.register("ignore", passthrough);
        b.register("no_deps", passthrough);

        b
    }

    /// Add or replace a native function.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut Interpreter<'_>, Args) -> EvalResult<Value> + Send + Sync + 'static,
    {
        self.natives.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.natives.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.natives.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.natives.keys().map(String::as_str)
    }
}

fn passthrough(_: &mut Interpreter<'_>, args: Args) -> EvalResult<Value> {
    Ok(args.get(0, "x").cloned().unwrap_or(Value::Null))
}

fn markers(_: &mut Interpreter<'_>, args: Args) -> EvalResult<Value> {
    let mut paths = Vec::new();
    for arg in args.all() {
        flatten(arg, &mut paths);
    }
    if paths.len() == 1 {
        return Ok(paths.remove(0));
    }
    Ok(Value::List(paths))
}

fn flatten(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Null => {}
        Value::List(items) => items.iter().for_each(|item| flatten(item, out)),
        Value::Record(fields) => fields.values().for_each(|item| flatten(item, out)),
        other => out.push(other.clone()),
    }
}

fn native_c(_: &mut Interpreter<'_>, args: Args) -> EvalResult<Value> {
    if !args.named.is_empty() {
        return native_list_record(args);
    }
    let mut out = Vec::new();
    for arg in &args.positional {
        match arg {
            Value::Null => {}
            Value::List(items) => out.extend(items.iter().cloned()),
            other => out.push(other.clone()),
        }
    }
    Ok(Value::List(out))
}

fn native_list(_: &mut Interpreter<'_>, args: Args) -> EvalResult<Value> {
    if !args.named.is_empty() {
        return native_list_record(args);
    }
    Ok(Value::List(args.positional))
}

fn native_list_record(args: Args) -> EvalResult<Value> {
    let mut fields = BTreeMap::new();
    for (i, value) in args.positional.into_iter().enumerate() {
        fields.insert((i + 1).to_string(), value);
    }
    for (name, value) in args.named {
        fields.insert(name, value);
    }
    Ok(Value::Record(fields))
}

fn native_structure(_: &mut Interpreter<'_>, args: Args) -> EvalResult<Value> {
    let base = args.require(0, ".Data", "structure")?.clone();
    let mut fields = match base {
        Value::Record(fields) => fields,
        other => {
            let mut fields = BTreeMap::new();
            fields.insert("value".to_string(), other);
            fields
        }
    };
    for (name, value) in args.named {
        if name != ".Data" {
            fields.insert(name, value);
        }
    }
    Ok(Value::Record(fields))
}

fn numbers(args: &Args, func: &str) -> EvalResult<Vec<f64>> {
    let mut flat = Vec::new();
    for arg in &args.positional {
        flatten(arg, &mut flat);
    }
    flat.iter()
        .map(|v| match v.as_num() {
            Some(n) => Ok(n),
            None => runtime(format!("{func}(): invalid 'type' ({}) of argument", v.class())),
        })
        .collect()
}

fn extremum(args: &Args, func: &str, pick: fn(f64, f64) -> f64) -> EvalResult<Value> {
    let xs = numbers(args, func)?;
    match xs.into_iter().reduce(pick) {
        Some(x) => Ok(Value::Num(x)),
        None => runtime(format!("{func}(): no non-missing arguments")),
    }
}

fn numeric_map(args: &Args, func: &str, f: impl Fn(f64) -> f64) -> EvalResult<Value> {
    fn go(v: &Value, func: &str, f: &dyn Fn(f64) -> f64) -> EvalResult<Value> {
        match v {
            Value::List(items) => Ok(Value::List(
                items.iter().map(|i| go(i, func, f)).collect::<EvalResult<_>>()?,
            )),
            other => match other.as_num() {
                Some(n) => Ok(Value::Num(f(n))),
                None => runtime(format!("{func}(): non-numeric argument")),
            },
        }
    }
    go(args.require(0, "x", func)?, func, &f)
}

fn string_map(v: &Value, f: impl Fn(&str) -> Value) -> EvalResult<Value> {
    match v {
        Value::List(items) => Ok(Value::List(
            items.iter().map(|i| f(&i.display_text())).collect(),
        )),
        Value::Null => Ok(Value::List(Vec::new())),
        other => Ok(f(&other.display_text())),
    }
}

fn native_as_numeric(_: &mut Interpreter<'_>, args: Args) -> EvalResult<Value> {
    fn convert(v: &Value) -> Value {
        match v {
            Value::Num(n) => Value::Num(*n),
            Value::Bool(b) => Value::Num(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => Value::Num(s.trim().parse().unwrap_or(f64::NAN)),
            _ => Value::Num(f64::NAN),
        }
    }
    match args.require(0, "x", "as.numeric")? {
        Value::List(items) => Ok(Value::List(items.iter().map(convert).collect())),
        other => Ok(convert(other)),
    }
}

fn native_seq(_: &mut Interpreter<'_>, args: Args) -> EvalResult<Value> {
    let num = |i: usize, name: &str| -> EvalResult<Option<f64>> {
        match args.get(i, name) {
            None => Ok(None),
            Some(v) => match v.as_num() {
                Some(n) if n.is_finite() => Ok(Some(n)),
                _ => runtime(format!("seq(): '{name}' must be a finite number")),
            },
        }
    };
    let from = num(0, "from")?.unwrap_or(1.0);
    let to = match num(1, "to")? {
        Some(to) => to,
        None => return runtime("seq(): argument 'to' is missing"),
    };
    let by = num(2, "by")?.unwrap_or(if to >= from { 1.0 } else { -1.0 });
    if by == 0.0 || (to - from) * by < 0.0 {
        return runtime("seq(): wrong sign in 'by' argument");
    }
    let steps = ((to - from) / by + 1e-10).floor() as usize;
    if steps > 10_000_000 {
        return runtime("seq(): result would be too long");
    }
    Ok(Value::List(
        (0..=steps).map(|i| Value::Num(from + i as f64 * by)).collect(),
    ))
}

fn native_sort(_: &mut Interpreter<'_>, args: Args) -> EvalResult<Value> {
    let mut items = args.require(0, "x", "sort")?.elements();
    if items.iter().all(|v| matches!(v, Value::Num(_))) {
        items.sort_by(|a, b| {
            let (x, y) = (a.as_num().unwrap_or(0.0), b.as_num().unwrap_or(0.0));
            x.total_cmp(&y)
        });
    } else {
        items.sort_by_key(Value::display_text);
    }
    if args.named("decreasing").and_then(Value::truthy) == Some(true) {
        items.reverse();
    }
    Ok(Value::List(items))
}

fn native_map(interp: &mut Interpreter<'_>, args: Args) -> EvalResult<Value> {
    let xs = args.require(0, "x", "map")?.elements();
    let f = args.require(1, "f", "map")?.clone();
    let mut out = Vec::with_capacity(xs.len());
    for x in xs {
        out.push(interp.apply(
            &f,
            Args {
                positional: vec![x],
                named: Vec::new(),
            },
        )?);
    }
    Ok(Value::List(out))
}

/// R's `paste`: vectorised over its arguments with recycling.
fn paste(args: &Args, default_sep: &str) -> EvalResult<Value> {
    let sep = match args.named("sep") {
        Some(v) => v.display_text(),
        None => default_sep.to_string(),
    };
    let collapse = args.named("collapse").and_then(|v| match v {
        Value::Null => None,
        other => Some(other.display_text()),
    });

    let columns: Vec<Vec<String>> = args
        .positional
        .iter()
        .map(|v| v.elements().iter().map(Value::display_text).collect::<Vec<_>>())
        .filter(|col| !col.is_empty())
        .collect();
    let rows = columns.iter().map(Vec::len).max().unwrap_or(0);
    let joined: Vec<String> = (0..rows)
        .map(|i| {
            columns
                .iter()
                .map(|col| col[i % col.len()].as_str())
                .collect::<Vec<_>>()
                .join(&sep)
        })
        .collect();

    match collapse {
        Some(c) => Ok(Value::Str(joined.join(&c))),
        None if joined.len() == 1 && args.positional.iter().all(|v| !matches!(v, Value::List(_))) => {
            Ok(Value::Str(joined.into_iter().next().unwrap_or_default()))
        }
        None if rows == 0 => Ok(Value::Str(String::new())),
        None => Ok(Value::List(joined.into_iter().map(Value::Str).collect())),
    }
}

fn joined(args: &Args) -> String {
    args.all().map(Value::display_text).collect::<Vec<_>>().join("")
}

fn path_arg(v: &Value, func: &str) -> EvalResult<String> {
    match v.as_str() {
        Some(s) => Ok(s.to_string()),
        None => runtime(format!("{func}(): invalid path argument {v}")),
    }
}

fn read_to_string(interp: &Interpreter<'_>, path: &Value) -> EvalResult<String> {
    let path = path_arg(path, "read")?;
    let full = interp.resolve_path(&path);
    std::fs::read_to_string(&full)
        .or_else(|e| runtime(format!("cannot open file '{path}': {e}")))
}

fn write_string(interp: &Interpreter<'_>, path: &Value, text: &str) -> EvalResult<Value> {
    let path = path_arg(path, "write")?;
    let full = interp.resolve_path(&path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)
            .or_else(|e| runtime(format!("cannot create directory for '{path}': {e}")))?;
    }
    std::fs::write(&full, text).or_else(|e| runtime(format!("cannot write file '{path}': {e}")))?;
    Ok(Value::Str(path))
}

/// Render a document: evaluate its active chunks in one fresh frame and
/// write the result next to the echoed code.
fn native_knit(interp: &mut Interpreter<'_>, args: Args) -> EvalResult<Value> {
    let input = args.require(0, "input", "knit")?.clone();
    let output = args.require(1, "output", "knit")?.clone();
    let text = read_to_string(interp, &input)?;

    let mut chunk_outputs = Vec::new();
    let mut exprs_per_chunk = Vec::new();
    for chunk in document::chunks(&text) {
        if !chunk.active {
            exprs_per_chunk.push(None);
            continue;
        }
        match parse_program(&chunk.code) {
            Ok(exprs) => exprs_per_chunk.push(Some(exprs)),
            Err(e) => return runtime(format!("knit(): chunk at line {}: {e}", chunk.open_line + 1)),
        }
    }

    interp.eval_document(|interp| {
        for exprs in &exprs_per_chunk {
            match exprs {
                Some(exprs) => {
                    let value = interp.eval_program(exprs)?;
                    chunk_outputs.push(Some(value.display_text()));
                }
                None => chunk_outputs.push(None),
            }
        }
        Ok(())
    })?;

    let rendered = document::render(&text, &chunk_outputs);
    write_string(interp, &output, &rendered)
}
