// tests/extraction.rs

use std::collections::BTreeSet;

use pipewright::dag::{file_node, NodeKind};
use pipewright::errors::PipewrightError;
use pipewright::extract::deps_code;
use pipewright_test_utils::{init_tracing, TestProject};

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn free_symbols_exclude_locals_and_parameters() {
    let deps = deps_code("{ y <- f(x); g <- function(a, b = k) a + b + z; g(y) }").unwrap();
    assert_eq!(deps.symbols, set(&["f", "x", "k", "z"]));
}

#[test]
fn shared_assignment_is_not_a_local() {
    let deps = deps_code("{ counter <<- 1; counter + 1 }").unwrap();
    assert!(deps.symbols.contains("counter"));
}

#[test]
fn file_markers_collect_literal_paths() {
    let deps = deps_code(
        r#"write_lines(read_lines(file_in("a.csv")), file_out(c("out/x.txt", "out/y.txt")))"#,
    )
    .unwrap();
    assert_eq!(deps.file_in, set(&["a.csv"]));
    assert_eq!(deps.file_out, set(&["out/x.txt", "out/y.txt"]));
    assert_eq!(deps.symbols, set(&["write_lines", "read_lines"]));
}

#[test]
fn ignored_code_contributes_nothing() {
    let deps = deps_code("summarise(data) + ignore(expensive(big)) + no_deps(other(x))").unwrap();
    assert_eq!(deps.symbols, set(&["summarise", "data"]));
}

#[test]
fn namespaced_references_are_reported_separately() {
    let deps = deps_code("stats::median(x) + pkg:::hidden").unwrap();
    assert_eq!(deps.namespaced, set(&["stats::median", "pkg::hidden"]));
    assert_eq!(deps.symbols, set(&["x"]));
}

#[test]
fn unparsable_code_is_a_parse_error() {
    let err = deps_code("f(").unwrap_err();
    assert!(matches!(err, PipewrightError::Parse { .. }));
}

#[test]
fn knitr_documents_add_the_targets_they_load() {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "model"
command = "2 * 21"

[[target]]
name = "fit"
command = "model + 1"

[[target]]
name = "report"
command = 'knit(knitr_in("report.md"), file_out("report.out.md"))'
"#,
    );
    project.write(
        "report.md",
        "# Report\n\n```{pw setup}\nx <- readd(model)\n```\n\n```{pw, eval = FALSE}\nloadd(fit)\n```\n\n```{pw}\nbroken(\n```\n",
    );

    let opened = project.open();
    let deps = opened.deps_target("report").unwrap();
    assert_eq!(deps.knitr_in, set(&["report.md"]));
    assert_eq!(deps.loadd, set(&["model"]));
    assert_eq!(deps.file_out, set(&["report.out.md"]));
    assert!(!deps.loadd.contains("fit"));

    let graph = opened.graph();
    assert!(graph.dependencies_of("report").contains(&"model".to_string()));
    assert!(!graph.dependencies_of("report").contains(&"fit".to_string()));
}

#[test]
fn nested_documents_are_followed_once() {
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "a"
command = "1"

[[target]]
name = "doc"
command = 'knitr_in("outer.md")'
"#,
    );
    project.write("outer.md", "```{pw}\nknitr_in(\"inner.md\")\n```\n");
    project.write("inner.md", "```{pw}\nreadd(a)\nknitr_in(\"outer.md\")\n```\n");

    let opened = project.open();
    let deps = opened.deps_target("doc").unwrap();
    assert_eq!(deps.knitr_in, set(&["outer.md", "inner.md"]));
    assert_eq!(deps.loadd, set(&["a"]));
}

#[test]
fn vectorized_wrappers_resolve_to_the_wrapped_function() {
    let project = TestProject::with_plan(
        r#"
[config]
environment = ["env.pw"]

[[target]]
name = "squares"
command = "vsquare(c(1, 2, 3))"
"#,
    );
    project.write(
        "env.pw",
        "square <- function(x) x * x\nvsquare <- vectorize(square)\n",
    );

    let opened = project.open();
    let deps = opened.deps_target("squares").unwrap();
    assert!(deps.symbols.contains("square"));
    assert!(!deps.symbols.contains("vsquare"));
    assert_eq!(opened.graph().kind_of("square"), Some(NodeKind::Function));
}

#[test]
fn generic_calls_depend_on_the_dispatch_point() {
    let project = TestProject::with_plan(
        r#"
[config]
environment = ["env.pw"]

[[target]]
name = "shown"
command = 'describe(structure(list(n = 1), class = "point"))'
"#,
    );
    project.write(
        "env.pw",
        "describe <- generic(\"describe\")\ndescribe.point <- function(x) paste(\"point\", x$n)\ndescribe.default <- function(x) \"thing\"\n",
    );

    let opened = project.open();
    let graph = opened.graph();
    assert_eq!(graph.kind_of("describe"), Some(NodeKind::DispatchPoint));
    assert_eq!(graph.dependencies_of("shown"), ["describe".to_string()]);
    assert!(!graph.contains("describe.point"));
}

#[test]
fn input_files_become_quoted_file_nodes() {
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "raw"
command = 'read_lines(file_in("data.csv"))'
"#,
    );
    project.write("data.csv", "a,b\n1,2\n");
    let opened = project.open();
    let node = file_node("data.csv");
    assert_eq!(node, "\"data.csv\"");
    assert_eq!(opened.graph().kind_of(&node), Some(NodeKind::File));
    assert_eq!(opened.graph().dependencies_of("raw"), [node]);
}
