// src/lang/document.rs

//! Code chunks embedded in literate documents.
//!
//! A chunk is a fenced block whose info string is `{pw ...}`:
//!
//! ````text
//! ```{pw summary, eval = TRUE}
//! readd(model)
//! ```
//! ````
//!
//! Chunks with `eval = FALSE` are kept in the rendered output but never
//! evaluated or scanned for dependencies.

use std::sync::LazyLock;

use regex::Regex;

static OPEN_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*```+\s*\{pw\b([^}]*)\}\s*$").expect("valid chunk regex")
});
static CLOSE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*```+\s*$").expect("valid fence regex"));
static EVAL_FALSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\beval\s*=\s*(FALSE|F|false)\b").expect("valid option regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Everything inside the braces after `pw`.
    pub options: String,
    pub code: String,
    pub active: bool,
    /// Zero-based line of the opening fence.
    pub open_line: usize,
    /// Zero-based line of the closing fence.
    pub close_line: usize,
}

/// All `{pw}` chunks in `text`, in document order.
///
/// An unterminated chunk runs to the end of the document.
pub fn chunks(text: &str) -> Vec<Chunk> {
    let lines: Vec<&str> = text.lines().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let Some(caps) = OPEN_FENCE.captures(lines[i]) else {
            i += 1;
            continue;
        };
        let options = caps
            .get(1)
            .map(|m| m.as_str().trim().trim_start_matches(',').trim().to_string())
            .unwrap_or_default();
        let open_line = i;
        let mut j = i + 1;
        while j < lines.len() && !CLOSE_FENCE.is_match(lines[j]) {
            j += 1;
        }
        let code = lines[open_line + 1..j].join("\n");
        out.push(Chunk {
            active: !EVAL_FALSE.is_match(&options),
            options,
            code,
            open_line,
            close_line: j,
        });
        i = j + 1;
    }
    out
}

/// Code of the chunks that would be evaluated.
pub fn active_code(text: &str) -> Vec<String> {
    chunks(text)
        .into_iter()
        .filter(|c| c.active)
        .map(|c| c.code)
        .collect()
}

/// Rebuild `text`, replacing each chunk by its code followed by `outputs`
/// for that chunk (one entry per chunk, `None` for inactive ones).
pub fn render(text: &str, outputs: &[Option<String>]) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let chunks = chunks(text);
    let mut out = String::new();
    let mut next = 0;
    for (chunk, output) in chunks.iter().zip(outputs.iter().chain(std::iter::repeat(&None))) {
        for line in &lines[next..chunk.open_line] {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("```\n");
        if !chunk.code.is_empty() {
            out.push_str(&chunk.code);
            out.push('\n');
        }
        out.push_str("```\n");
        if let Some(output) = output {
            for line in output.lines() {
                out.push_str("## ");
                out.push_str(line);
                out.push('\n');
            }
        }
        next = (chunk.close_line + 1).min(lines.len());
    }
    for line in &lines[next..] {
        out.push_str(line);
        out.push('\n');
    }
    out
}
