// src/imports.rs

//! Imports: everything environment scripts define.
//!
//! Scripts are sourced in order into a fresh [`SharedEnv`]. Each top-level
//! assignment defines an import; its kind and static dependencies come from
//! the value it evaluates to and the code that defined it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::dag::{file_path, DependencyGraph, NodeKind};
use crate::errors::{PipewrightError, Result};
use crate::extract::{extract, Deps, Role, Wrappers};
use crate::lang::{
    on_eval_stack, parse_program, Budget, Builtins, EnvToken, EvalContext, Expr, Interpreter,
    NoDeps, SharedEnv, Value,
};
use crate::store::{encode_value, FileHashCache, Fingerprint};

/// One import and what it statically references.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportDef {
    pub name: String,
    pub kind: NodeKind,
    pub deps: Deps,
    /// Canonical text of the definition.
    pub definition: String,
    /// For `g <- vectorize(f)`: the wrapped function `f`.
    pub wraps: Option<String>,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportTable {
    defs: BTreeMap<String, ImportDef>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, def: ImportDef) {
        self.defs.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&ImportDef> {
        self.defs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImportDef> {
        self.defs.values()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Vectorize wrappers, for call resolution during extraction.
    pub fn wrappers(&self) -> Wrappers {
        self.defs
            .values()
            .filter_map(|d| d.wraps.as_ref().map(|w| (d.name.clone(), w.clone())))
            .collect()
    }
}

/// The evaluated environment scripts.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub shared: SharedEnv,
    pub imports: ImportTable,
}

/// An environment script: a label for error messages and its source.
#[derive(Debug, Clone)]
pub struct Script {
    pub label: String,
    pub source: String,
}

impl Script {
    pub fn new(label: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            source: source.into(),
        }
    }

    pub fn read(root: &Path, path: &str) -> Result<Self> {
        let source = std::fs::read_to_string(root.join(path)).map_err(|e| {
            PipewrightError::ConfigError(format!("cannot read environment script '{path}': {e}"))
        })?;
        Ok(Self::new(path, source))
    }
}

/// Source `scripts` in order and derive the import table.
pub fn load_environment(scripts: &[Script], builtins: Arc<Builtins>, root: &Path) -> Result<Environment> {
    let shared = SharedEnv::new();
    let ctx = EvalContext::new(builtins, shared.clone(), root);
    let definitions = on_eval_stack("pipewright-environment", || source_scripts(scripts, &ctx))??;

    let wrappers: Wrappers = definitions
        .iter()
        .filter_map(|(name, expr)| wrapped_function(expr).map(|f| (name.clone(), f)))
        .collect();

    let mut imports = ImportTable::new();
    for (name, expr) in &definitions {
        let Some(value) = shared.get(name) else {
            continue;
        };
        imports.insert(classify(name, expr, value, &wrappers));
    }
    info!(imports = imports.len(), "environment loaded");

    Ok(Environment { shared, imports })
}

/// Evaluate every script into the shared environment, returning the
/// definitions made by top-level assignments.
fn source_scripts(scripts: &[Script], ctx: &EvalContext) -> Result<BTreeMap<String, Expr>> {
    let shared = &ctx.shared;
    let token = EnvToken::setup(shared.clone());
    let budget = Budget::unlimited();
    let mut interp = Interpreter::new(ctx, &token, &NoDeps, &budget);

    let mut definitions: BTreeMap<String, Expr> = BTreeMap::new();
    for script in scripts {
        let exprs = parse_program(&script.source)
            .map_err(|e| PipewrightError::parse(format!("environment script '{}'", script.label), e))?;
        for expr in &exprs {
            let result = match expr {
                Expr::Assign { target, value, .. } => interp.eval(value).map(|v| {
                    shared.define(target.clone(), v);
                    definitions.insert(target.clone(), value.as_ref().clone());
                }),
                other => interp.eval(other).map(|_| ()),
            };
            result.map_err(|e| {
                PipewrightError::ConfigError(format!(
                    "environment script '{}' failed: {e}",
                    script.label
                ))
            })?;
        }
        debug!(script = %script.label, statements = exprs.len(), "sourced environment script");
    }
    Ok(definitions)
}

/// `f` when `expr` is `vectorize(f)`.
fn wrapped_function(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Call { callee, args } if matches!(callee.as_ref(), Expr::Ident(n) if n == "vectorize") => {
            match args.first().map(|a| &a.value) {
                Some(Expr::Ident(f)) => Some(f.clone()),
                _ => None,
            }
        }
        _ => None,
    }
}

fn classify(name: &str, expr: &Expr, value: Value, wrappers: &Wrappers) -> ImportDef {
    let (kind, deps, definition) = match &value {
        Value::Closure(closure) => {
            let function = Expr::Function {
                params: closure.params.clone(),
                body: Box::new(closure.body.clone()),
            };
            let mut definition = closure.source();
            if !closure.captured.is_empty() {
                definition.push_str(&format!(" with {}", Value::Record(closure.captured.clone())));
            }
            (
                NodeKind::Function,
                extract(&function, Role::Import, wrappers),
                definition,
            )
        }
        Value::Vectorized(_) => (
            NodeKind::Function,
            extract(expr, Role::Import, wrappers),
            expr.to_string(),
        ),
        Value::Generic(generic) => (NodeKind::DispatchPoint, Deps::default(), format!("generic({generic:?})")),
        _ => (NodeKind::Object, Deps::default(), expr.to_string()),
    };
    ImportDef {
        name: name.to_string(),
        kind,
        deps,
        definition,
        wraps: wrappers.get(name).cloned(),
        value,
    }
}

/// Fingerprint every import node of `graph`, dependencies first.
pub fn fingerprint_imports(
    graph: &DependencyGraph,
    imports: &ImportTable,
    files: &mut FileHashCache,
    root: &Path,
) -> Result<BTreeMap<String, Fingerprint>> {
    let mut out: BTreeMap<String, Fingerprint> = BTreeMap::new();
    for name in graph.topological_order() {
        let Some(kind) = graph.kind_of(name) else {
            continue;
        };
        let fingerprint = match kind {
            NodeKind::Target => continue,
            NodeKind::File => match file_path(name) {
                Some(path) => files.get_or_compute(&root.join(path))?,
                None => Fingerprint::missing(),
            },
            NodeKind::Namespaced => Fingerprint::combine([("namespaced", name.as_str())]),
            NodeKind::DispatchPoint => Fingerprint::combine([("generic", name.as_str())]),
            NodeKind::Object => {
                let bytes = match imports.get(name) {
                    Some(def) => encode_value(&def.value)?,
                    None => Vec::new(),
                };
                Fingerprint::combine([("object", Fingerprint::of_bytes(&bytes).as_str())])
            }
            NodeKind::Function => {
                let definition = imports.get(name).map(|d| d.definition.as_str()).unwrap_or("");
                let mut parts = vec![("function".to_string(), definition.to_string())];
                for dep in graph.dependencies_of(name) {
                    if let Some(fp) = out.get(dep) {
                        parts.push((dep.clone(), fp.to_string()));
                    }
                }
                Fingerprint::combine(parts.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            }
        };
        out.insert(name.clone(), fingerprint);
    }
    Ok(out)
}
