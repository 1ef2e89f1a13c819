// src/extract/mod.rs

//! Static dependency extraction.
//!
//! Walks an unevaluated [`Expr`] and reports what it references: free
//! symbols, namespaced symbols, declared input and output files, and the
//! literate documents it reads. Nothing here evaluates code, so extraction
//! only fails when the text does not parse.

pub mod document;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use serde::Serialize;
use tracing::trace;

use crate::errors::{PipewrightError, Result};
use crate::lang::{parse_expr, Arg, AssignScope, Expr};

/// Everything a piece of code statically depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Deps {
    /// Free names referenced by the code (targets, imports, or unknowns).
    pub symbols: BTreeSet<String>,
    /// `pkg::name` references.
    pub namespaced: BTreeSet<String>,
    pub file_in: BTreeSet<String>,
    pub file_out: BTreeSet<String>,
    /// Documents passed to `knitr_in`; also input files.
    pub knitr_in: BTreeSet<String>,
    /// Targets loaded by `readd`/`loadd` inside scanned documents.
    pub loadd: BTreeSet<String>,
}

impl Deps {
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
            && self.namespaced.is_empty()
            && self.file_in.is_empty()
            && self.file_out.is_empty()
            && self.knitr_in.is_empty()
            && self.loadd.is_empty()
    }

    pub fn merge(&mut self, other: Deps) {
        self.symbols.extend(other.symbols);
        self.namespaced.extend(other.namespaced);
        self.file_in.extend(other.file_in);
        self.file_out.extend(other.file_out);
        self.knitr_in.extend(other.knitr_in);
        self.loadd.extend(other.loadd);
    }

    /// Files whose content the code reads: `file_in` plus `knitr_in`.
    pub fn input_files(&self) -> BTreeSet<String> {
        self.file_in.union(&self.knitr_in).cloned().collect()
    }

    /// Symbols plus names loaded from documents.
    pub fn referenced_names(&self) -> BTreeSet<String> {
        self.symbols.union(&self.loadd).cloned().collect()
    }
}

/// Whose code is being analysed. File effects are honoured only for targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Target,
    Import,
    /// A code chunk inside a document read via `knitr_in`.
    Document,
}

/// Known vectorize wrappers: wrapper name -> wrapped function name.
pub type Wrappers = BTreeMap<String, String>;

/// Extract the dependencies of `expr`.
pub fn extract(expr: &Expr, role: Role, wrappers: &Wrappers) -> Deps {
    let mut walker = Walker {
        role,
        wrappers,
        scopes: Vec::new(),
        deps: Deps::default(),
    };
    walker.enter_scope(std::iter::empty(), std::slice::from_ref(expr));
    walker.walk(expr);
    walker.deps
}

/// Parse `text` and extract its dependencies as if it were a target command.
pub fn deps_code(text: &str) -> Result<Deps> {
    let expr = parse_expr(text).map_err(|e| PipewrightError::parse("expression", e))?;
    Ok(extract(&expr, Role::Target, &Wrappers::new()))
}

/// Extract a target's dependencies, following `knitr_in` documents found
/// relative to `root`.
pub fn extract_target(expr: &Expr, wrappers: &Wrappers, root: &Path) -> Deps {
    let mut deps = extract(expr, Role::Target, wrappers);
    let docs: Vec<String> = deps.knitr_in.iter().cloned().collect();
    let mut visited = HashSet::new();
    for doc in docs {
        deps.merge(document::scan_file(root, &doc, wrappers, &mut visited));
    }
    deps
}

struct Walker<'w> {
    role: Role,
    wrappers: &'w Wrappers,
    scopes: Vec<HashSet<String>>,
    deps: Deps,
}

impl Walker<'_> {
    fn is_local(&self, name: &str) -> bool {
        self.scopes.iter().any(|s| s.contains(name))
    }

    /// Push a scope holding `params` plus every name assigned locally in
    /// `body` (not descending into nested functions).
    fn enter_scope<'a>(&mut self, params: impl Iterator<Item = &'a str>, body: &[Expr]) {
        let mut scope: HashSet<String> = params.map(str::to_string).collect();
        for expr in body {
            collect_assigned(expr, &mut scope);
        }
        self.scopes.push(scope);
    }

    fn symbol(&mut self, name: &str) {
        if !self.is_local(name) {
            self.deps.symbols.insert(name.to_string());
        }
    }

    fn walk(&mut self, expr: &Expr) {
        match expr {
            Expr::Null | Expr::Bool(_) | Expr::Num(_) | Expr::Str(_) => {}
            Expr::Ident(name) => self.symbol(name),
            Expr::Namespaced { pkg, name, .. } => {
                self.deps.namespaced.insert(format!("{pkg}::{name}"));
            }
            Expr::Call { callee, args } => self.walk_call(callee, args),
            Expr::Function { params, body } => {
                self.enter_scope(
                    params.iter().map(|p| p.name.as_str()),
                    std::slice::from_ref(body.as_ref()),
                );
                for param in params {
                    if let Some(default) = &param.default {
                        self.walk(default);
                    }
                }
                self.walk(body);
                self.scopes.pop();
            }
            Expr::Block(exprs) => exprs.iter().for_each(|e| self.walk(e)),
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                self.walk(cond);
                self.walk(then);
                if let Some(otherwise) = otherwise {
                    self.walk(otherwise);
                }
            }
            Expr::Assign { value, .. } => self.walk(value),
            Expr::Binary { lhs, rhs, .. } => {
                self.walk(lhs);
                self.walk(rhs);
            }
            Expr::Unary { expr, .. } => self.walk(expr),
            Expr::Index { target, index, .. } => {
                self.walk(target);
                self.walk(index);
            }
            Expr::Field { target, .. } => self.walk(target),
        }
    }

    fn walk_args(&mut self, args: &[Arg]) {
        for arg in args {
            self.walk(&arg.value);
        }
    }

    fn walk_call(&mut self, callee: &Expr, args: &[Arg]) {
        let name = match callee {
            Expr::Ident(name) if !self.is_local(name) => name.as_str(),
            other => {
                self.walk(other);
                self.walk_args(args);
                return;
            }
        };

        match name {
            "ignore" | "no_deps" => {}
            "file_in" => self.files(args, FileKind::In),
            "file_out" => match self.role {
                Role::Import => trace!("file_out() inside an imported function ignored"),
                _ => self.files(args, FileKind::Out),
            },
            "knitr_in" => match self.role {
                Role::Import => trace!("knitr_in() inside an imported function ignored"),
                _ => self.files(args, FileKind::Knitr),
            },
            "readd" | "loadd" if self.role == Role::Document => {
                for arg in args {
                    match &arg.value {
                        Expr::Ident(target) | Expr::Str(target) => {
                            self.deps.loadd.insert(target.clone());
                        }
                        other => self.walk(other),
                    }
                }
            }
            _ => {
                match self.wrappers.get(name).cloned() {
                    Some(wrapped) => {
                        trace!(wrapper = name, wrapped = %wrapped, "resolving vectorized call");
                        self.deps.symbols.insert(wrapped);
                    }
                    None => self.symbol(name),
                }
                self.walk_args(args);
            }
        }
    }

    /// Literal strings (possibly inside `c(...)`) become file paths; other
    /// argument code is walked normally.
    fn files(&mut self, args: &[Arg], kind: FileKind) {
        for arg in args {
            self.file_arg(&arg.value, kind);
        }
    }

    fn file_arg(&mut self, expr: &Expr, kind: FileKind) {
        match expr {
            Expr::Str(path) => {
                let set = match kind {
                    FileKind::In => &mut self.deps.file_in,
                    FileKind::Out => &mut self.deps.file_out,
                    FileKind::Knitr => &mut self.deps.knitr_in,
                };
                set.insert(path.clone());
            }
            Expr::Call { callee, args } if matches!(callee.as_ref(), Expr::Ident(n) if n == "c") => {
                for arg in args {
                    self.file_arg(&arg.value, kind);
                }
            }
            other => self.walk(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FileKind {
    In,
    Out,
    Knitr,
}

/// Names bound by `<-`/`=` anywhere in `expr`, outside nested functions.
fn collect_assigned(expr: &Expr, out: &mut HashSet<String>) {
    match expr {
        Expr::Assign {
            target,
            value,
            scope,
        } => {
            if *scope == AssignScope::Local {
                out.insert(target.clone());
            }
            collect_assigned(value, out);
        }
        Expr::Function { .. } => {}
        Expr::Block(exprs) => exprs.iter().for_each(|e| collect_assigned(e, out)),
        Expr::If {
            cond,
            then,
            otherwise,
        } => {
            collect_assigned(cond, out);
            collect_assigned(then, out);
            if let Some(otherwise) = otherwise {
                collect_assigned(otherwise, out);
            }
        }
        Expr::Call { callee, args } => {
            collect_assigned(callee, out);
            args.iter().for_each(|a| collect_assigned(&a.value, out));
        }
        Expr::Binary { lhs, rhs, .. } => {
            collect_assigned(lhs, out);
            collect_assigned(rhs, out);
        }
        Expr::Unary { expr, .. } => collect_assigned(expr, out),
        Expr::Index { target, index, .. } => {
            collect_assigned(target, out);
            collect_assigned(index, out);
        }
        Expr::Field { target, .. } => collect_assigned(target, out),
        Expr::Null
        | Expr::Bool(_)
        | Expr::Num(_)
        | Expr::Str(_)
        | Expr::Ident(_)
        | Expr::Namespaced { .. } => {}
    }
}
