// src/lang/mod.rs

//! The command language: parsing, canonical text, and evaluation.

pub mod ast;
pub mod budget;
pub mod builtins;
pub mod document;
pub mod env;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod value;

pub use ast::{Arg, AssignScope, BinOp, Expr, Param, UnOp};
pub use budget::{Budget, CancelToken};
pub use builtins::{Builtins, NativeFn};
pub use env::{EnvLock, EnvToken, SharedEnv};
pub use interp::{
    on_eval_stack, Args, DepSource, Diagnostics, EvalContext, EvalError, EvalResult, Interpreter,
    LimitKind, NoDeps, EVAL_STACK_SIZE,
};
pub use lexer::ParseError;
pub use parser::{parse_expr, parse_program, MAX_NESTING};
pub use value::{Closure, Value};
