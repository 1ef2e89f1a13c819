// tests/language.rs

use std::sync::Arc;
use std::time::Duration;

use pipewright::lang::{
    parse_expr, parse_program, Budget, Builtins, CancelToken, EnvLock, EnvToken, EvalContext,
    EvalError, Interpreter, LimitKind, NoDeps, SharedEnv, Value, MAX_NESTING,
};

fn eval_with(src: &str, token: &EnvToken, budget: &Budget) -> Result<Value, EvalError> {
    let ctx = EvalContext::new(Arc::new(Builtins::standard()), token.env().clone(), ".");
    let expr = parse_expr(src).expect("parse");
    Interpreter::new(&ctx, token, &NoDeps, budget).eval(&expr)
}

fn eval(src: &str) -> Result<Value, EvalError> {
    let env = SharedEnv::new();
    eval_with(src, &EnvToken::setup(env), &Budget::unlimited())
}

fn num(n: f64) -> Value {
    Value::Num(n)
}

#[test]
fn deparse_ignores_whitespace_and_comments() {
    let a = parse_expr("f(x,y=2)+1 # trailing comment").expect("parse");
    let b = parse_expr("f( x , y = 2 )\n  + 1").expect("parse");
    assert_eq!(a.deparse(), b.deparse());
    assert_eq!(a.deparse(), "f(x, y = 2) + 1");
}

#[test]
fn deparse_round_trips_through_the_parser() {
    for src in [
        "function(n, k = 2) if (n < 2) n else fib(n - 1) + fib(n - 2)",
        "{ x <- c(1, 2, 3); x[[2]] * -x[1] }",
        "list(a = 1, b = \"two\")$b",
        "pkg::fun(1) + pkg:::hidden",
        "-2 ^ 2",
        "!(a && b) || c",
    ] {
        let first = parse_expr(src).expect("parse").deparse();
        let second = parse_expr(&first).expect("reparse").deparse();
        assert_eq!(first, second, "deparse is not stable for {src}");
    }
}

#[test]
fn parse_errors_carry_a_position() {
    let err = parse_expr("f(1,\n  2").expect_err("unterminated call");
    assert!(err.line >= 1);
    assert!(!err.message.is_empty());

    assert!(parse_expr("   # only a comment").is_err());
    assert!(parse_expr("1 +").is_err());
}

#[test]
fn programs_split_on_newlines_and_semicolons() {
    let exprs = parse_program("a <- 1; b <- 2\n\nc <- a + b\n").expect("parse");
    assert_eq!(exprs.len(), 3);
}

#[test]
fn arithmetic_recycles_vectors() {
    assert_eq!(eval("1 + 2 * 3").unwrap(), num(7.0));
    assert_eq!(eval("2 ^ 3 ^ 2").unwrap(), num(512.0));
    assert_eq!(eval("7 %% 3").unwrap(), num(1.0));
    assert_eq!(
        eval("c(1, 2, 3) * 2").unwrap(),
        Value::List(vec![num(2.0), num(4.0), num(6.0)])
    );
    assert_eq!(eval("sum(seq(1, 4))").unwrap(), num(10.0));
}

#[test]
fn closures_capture_and_recurse() {
    let v = eval("{ make <- function(k) function(x) x * k; double <- make(2); double(21) }").unwrap();
    assert_eq!(v, num(42.0));

    // Recursion resolves through the shared environment, like an import.
    let v = eval("{ fact <<- function(n) if (n <= 1) 1 else n * fact(n - 1); fact(5) }").unwrap();
    assert_eq!(v, num(120.0));
}

#[test]
fn default_and_named_arguments() {
    let v = eval("{ f <- function(a, b = a + 1) a * b; f(b = 3, 2) }").unwrap();
    assert_eq!(v, num(6.0));
    let err = eval("{ f <- function(a) a; f(1, 2) }").unwrap_err();
    assert!(err.to_string().contains("unused argument"));
}

#[test]
fn records_and_indexing() {
    assert_eq!(eval("list(a = 1, b = 2)$b").unwrap(), num(2.0));
    assert_eq!(eval("list(a = 1)$missing").unwrap(), Value::Null);
    assert_eq!(eval("c(10, 20, 30)[[3]]").unwrap(), num(30.0));
    assert_eq!(eval("paste(\"a\", \"b\")").unwrap(), Value::Str("a b".into()));
    assert_eq!(eval("paste0(\"x\", 1)").unwrap(), Value::Str("x1".into()));
}

#[test]
fn stop_raises_a_runtime_error() {
    match eval("stop(\"boom: \", 42)") {
        Err(EvalError::Runtime(msg)) => assert_eq!(msg, "boom: 42"),
        other => panic!("expected runtime error, got {other:?}"),
    }
    assert!(matches!(eval("undefined_thing + 1"), Err(EvalError::Runtime(_))));
}

#[test]
fn locked_token_refuses_shared_assignment() {
    let env = SharedEnv::new();
    let lock = EnvLock::acquire(env.clone(), true);
    let token = lock.token("a", None);
    assert_eq!(lock.outstanding(), 1);

    match eval_with("counter <<- 1", &token, &Budget::unlimited()) {
        Err(EvalError::Integrity { binding }) => assert_eq!(binding, "counter"),
        other => panic!("expected integrity error, got {other:?}"),
    }
    assert!(!env.contains("counter"));

    drop(token);
    assert_eq!(lock.outstanding(), 0);
}

#[test]
fn unlocked_token_writes_the_shared_environment() {
    let env = SharedEnv::new();
    let lock = EnvLock::acquire(env.clone(), true);
    let token = lock.token("a", Some(false));
    eval_with("counter <<- 41 + 1", &token, &Budget::unlimited()).unwrap();
    assert_eq!(env.get("counter"), Some(num(42.0)));
}

#[test]
fn elapsed_limit_interrupts_sleep() {
    let token = EnvToken::setup(SharedEnv::new());
    let budget = Budget::new(CancelToken::new(), Some(Duration::from_millis(50)), None);
    match eval_with("sleep(5)", &token, &budget) {
        Err(EvalError::Limit { kind, .. }) => assert_eq!(kind, LimitKind::Elapsed),
        other => panic!("expected elapsed limit, got {other:?}"),
    }
    assert!(budget.elapsed() < Duration::from_secs(2));
}

#[test]
fn sleeping_does_not_consume_compute_budget() {
    let token = EnvToken::setup(SharedEnv::new());
    let budget = Budget::new(CancelToken::new(), None, Some(Duration::from_millis(200)));
    eval_with("{ sleep(0.3); 1 }", &token, &budget).expect("sleep is not compute");
    assert!(budget.cpu_used() < Duration::from_millis(200));
}

#[test]
fn cancellation_stops_evaluation() {
    let token = EnvToken::setup(SharedEnv::new());
    let cancel = CancelToken::new();
    cancel.cancel();
    let budget = Budget::new(cancel, None, None);
    assert!(matches!(eval_with("1 + 1", &token, &budget), Err(EvalError::Cancelled)));
}

#[test]
fn closures_serialize_with_their_source() {
    let v = eval("function(x) x + 1").unwrap();
    let json = serde_json::to_string(&v).expect("serialize");
    let back: Value = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back.to_string(), "function(x) x + 1");
}

#[test]
fn deeply_nested_commands_are_parse_errors() {
    let depth = 20_000;
    let src = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
    let err = parse_expr(&src).expect_err("nesting limit");
    assert!(err.message.contains("nested too deeply"), "{}", err.message);

    for src in [format!("{}1", "-".repeat(depth)), format!("{}2", "2 ^ ".repeat(depth))] {
        let err = parse_expr(&src).expect_err("nesting limit");
        assert!(err.message.contains("nested too deeply"), "{}", err.message);
    }

    match pipewright::extract::deps_code(&src) {
        Err(pipewright::errors::PipewrightError::Parse { .. }) => {}
        other => panic!("expected a parse error, got {other:?}"),
    }

    let shallow = MAX_NESTING / 4;
    let ok = format!("{}1{}", "(".repeat(shallow), ")".repeat(shallow));
    assert!(parse_expr(&ok).is_ok());
}

#[test]
fn sleep_rejects_unrepresentable_durations() {
    for src in ["sleep(1e30)", "sleep(-1)", "sleep(\"soon\")"] {
        match eval(src) {
            Err(EvalError::Runtime(msg)) => assert!(msg.contains("sleep()"), "{msg}"),
            other => panic!("expected a runtime error for {src}, got {other:?}"),
        }
    }
}
