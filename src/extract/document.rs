// src/extract/document.rs

//! Dependency scanning of literate documents read through `knitr_in`.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, warn};

use crate::extract::{extract, Deps, Role, Wrappers};
use crate::lang::document::active_code;
use crate::lang::parse_program;

/// Dependencies of the active chunks in `text`.
///
/// Chunks that fail to parse are skipped with a warning; the build that
/// knits the document will report the error.
pub fn scan_text(text: &str, wrappers: &Wrappers) -> Deps {
    let mut deps = Deps::default();
    for (i, code) in active_code(text).iter().enumerate() {
        match parse_program(code) {
            Ok(exprs) => {
                for expr in &exprs {
                    deps.merge(extract(expr, Role::Document, wrappers));
                }
            }
            Err(e) => warn!(chunk = i + 1, error = %e, "skipping unparsable document chunk"),
        }
    }
    deps
}

/// Scan the document at `path` (relative to `root`) and, recursively, any
/// documents it reads with `knitr_in`. Each document is scanned at most once.
pub fn scan_file(
    root: &Path,
    path: &str,
    wrappers: &Wrappers,
    visited: &mut HashSet<String>,
) -> Deps {
    if !visited.insert(path.to_string()) {
        return Deps::default();
    }
    let text = match std::fs::read_to_string(root.join(path)) {
        Ok(text) => text,
        Err(e) => {
            debug!(document = path, error = %e, "document not readable; no dependencies scanned");
            return Deps::default();
        }
    };

    let mut deps = scan_text(&text, wrappers);
    let nested: Vec<String> = deps.knitr_in.iter().cloned().collect();
    for doc in nested {
        deps.merge(scan_file(root, &doc, wrappers, visited));
    }
    deps
}
