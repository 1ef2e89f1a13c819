// src/lang/ast.rs

//! Expression tree and its canonical text form.
//!
//! `Display` on [`Expr`] produces the canonical deparse used for command
//! fingerprints: comments and insignificant whitespace never survive it, so
//! two commands that differ only in formatting fingerprint identically.

use std::fmt::{self, Write};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Ident(String),
    /// `pkg::name` (or `pkg:::name` when `internal`).
    Namespaced {
        pkg: String,
        name: String,
        internal: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Arg>,
    },
    Function {
        params: Vec<Param>,
        body: Box<Expr>,
    },
    Block(Vec<Expr>),
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
    Assign {
        target: String,
        value: Box<Expr>,
        scope: AssignScope,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
    /// `x[i]` or `x[[i]]` when `double`.
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
        double: bool,
    },
    /// `x$name`
    Field {
        target: Box<Expr>,
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

/// Where an assignment lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignScope {
    /// `x <- v` / `x = v`: the innermost evaluation frame.
    Local,
    /// `x <<- v`: the shared environment.
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%%",
            BinOp::Pow => "^",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    pub(crate) fn precedence(self) -> u8 {
        match self {
            BinOp::Or => prec::OR,
            BinOp::And => prec::AND,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => prec::CMP,
            BinOp::Add | BinOp::Sub => prec::ADD,
            BinOp::Mul | BinOp::Div | BinOp::Mod => prec::MUL,
            BinOp::Pow => prec::POW,
        }
    }
}

pub(crate) mod prec {
    pub const LOWEST: u8 = 0;
    pub const ASSIGN: u8 = 1;
    pub const OR: u8 = 2;
    pub const AND: u8 = 3;
    pub const NOT: u8 = 4;
    pub const CMP: u8 = 5;
    pub const ADD: u8 = 6;
    pub const MUL: u8 = 7;
    pub const NEG: u8 = 8;
    pub const POW: u8 = 9;
    pub const POSTFIX: u8 = 10;
    pub const ATOM: u8 = 11;
}

impl Expr {
    /// Convenience constructor for `name(args...)` with positional arguments.
    pub fn call(name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call {
            callee: Box::new(Expr::Ident(name.to_string())),
            args: args
                .into_iter()
                .map(|value| Arg { name: None, value })
                .collect(),
        }
    }

    /// Name of the function being called, when the callee is a plain symbol.
    pub fn callee_name(&self) -> Option<&str> {
        match self {
            Expr::Call { callee, .. } => match callee.as_ref() {
                Expr::Ident(name) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Function { .. } | Expr::If { .. } => prec::LOWEST,
            Expr::Assign { .. } => prec::ASSIGN,
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Unary { op: UnOp::Not, .. } => prec::NOT,
            Expr::Unary { op: UnOp::Neg, .. } => prec::NEG,
            Expr::Num(n) if n.is_sign_negative() => prec::NEG,
            Expr::Call { .. } | Expr::Index { .. } | Expr::Field { .. } => prec::POSTFIX,
            _ => prec::ATOM,
        }
    }

    /// Canonical single-line text of this expression.
    pub fn deparse(&self) -> String {
        self.to_string()
    }
}

/// Whether `name` can be written bare, without backtick quoting.
pub fn is_syntactic_name(name: &str) -> bool {
    let mut chars = name.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !(first.is_alphabetic() || first == '.') {
        return false;
    }
    if first == '.' && name.chars().nth(1).is_some_and(|c| c.is_ascii_digit()) {
        return false;
    }
    if !chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        return false;
    }
    !matches!(
        name,
        "function" | "if" | "else" | "TRUE" | "FALSE" | "NULL" | "true" | "false" | "null"
    )
}

fn write_name(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    if is_syntactic_name(name) {
        f.write_str(name)
    } else {
        write!(f, "`{name}`")
    }
}

pub(crate) fn write_str_literal(out: &mut impl Write, s: &str) -> fmt::Result {
    out.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => out.write_str("\\\"")?,
            '\\' => out.write_str("\\\\")?,
            '\n' => out.write_str("\\n")?,
            '\t' => out.write_str("\\t")?,
            '\r' => out.write_str("\\r")?,
            '\0' => out.write_str("\\0")?,
            c => out.write_char(c)?,
        }
    }
    out.write_char('"')
}

pub(crate) fn format_num(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Inf".into() } else { "-Inf".into() }
    } else {
        format!("{n}")
    }
}

/// Write `expr`, wrapping it in parentheses when it binds looser than `min`.
fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr, min: u8) -> fmt::Result {
    if expr.precedence() < min {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[Arg]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        if let Some(name) = &arg.name {
            write_name(f, name)?;
            f.write_str(" = ")?;
        }
        write!(f, "{}", arg.value)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Null => f.write_str("NULL"),
            Expr::Bool(true) => f.write_str("TRUE"),
            Expr::Bool(false) => f.write_str("FALSE"),
            Expr::Num(n) => f.write_str(&format_num(*n)),
            Expr::Str(s) => write_str_literal(f, s),
            Expr::Ident(name) => write_name(f, name),
            Expr::Namespaced {
                pkg,
                name,
                internal,
            } => {
                write_name(f, pkg)?;
                f.write_str(if *internal { ":::" } else { "::" })?;
                write_name(f, name)
            }
            Expr::Call { callee, args } => {
                write_operand(f, callee, prec::POSTFIX)?;
                f.write_str("(")?;
                write_args(f, args)?;
                f.write_str(")")
            }
            Expr::Function { params, body } => {
                f.write_str("function(")?;
                for (i, param) in params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_name(f, &param.name)?;
                    if let Some(default) = &param.default {
                        write!(f, " = {default}")?;
                    }
                }
                write!(f, ") {body}")
            }
            Expr::Block(exprs) => {
                if exprs.is_empty() {
                    return f.write_str("{}");
                }
                f.write_str("{ ")?;
                for (i, expr) in exprs.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{expr}")?;
                }
                f.write_str(" }")
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                write!(f, "if ({cond}) ")?;
                // A bare `if` in the then-branch would capture our `else`.
                let dangling = otherwise.is_some()
                    && matches!(then.as_ref(), Expr::If { otherwise: None, .. });
                if dangling {
                    write!(f, "{{ {then} }}")?;
                } else {
                    write!(f, "{then}")?;
                }
                if let Some(otherwise) = otherwise {
                    write!(f, " else {otherwise}")?;
                }
                Ok(())
            }
            Expr::Assign {
                target,
                value,
                scope,
            } => {
                write_name(f, target)?;
                f.write_str(match scope {
                    AssignScope::Local => " <- ",
                    AssignScope::Shared => " <<- ",
                })?;
                write_operand(f, value, prec::LOWEST)
            }
            Expr::Binary { op, lhs, rhs } => {
                let p = op.precedence();
                if *op == BinOp::Pow {
                    // right-associative
                    write_operand(f, lhs, p + 1)?;
                    write!(f, " {} ", op.symbol())?;
                    write_operand(f, rhs, prec::NEG)
                } else {
                    write_operand(f, lhs, p)?;
                    write!(f, " {} ", op.symbol())?;
                    write_operand(f, rhs, p + 1)
                }
            }
            Expr::Unary { op, expr } => match op {
                UnOp::Neg => {
                    f.write_str("-")?;
                    write_operand(f, expr, prec::NEG)
                }
                UnOp::Not => {
                    f.write_str("!")?;
                    write_operand(f, expr, prec::NOT)
                }
            },
            Expr::Index {
                target,
                index,
                double,
            } => {
                write_operand(f, target, prec::POSTFIX)?;
                if *double {
                    write!(f, "[[{index}]]")
                } else {
                    write!(f, "[{index}]")
                }
            }
            Expr::Field { target, name } => {
                write_operand(f, target, prec::POSTFIX)?;
                f.write_str("$")?;
                write_name(f, name)
            }
        }
    }
}
