// src/lang/value.rs

//! Runtime values produced by evaluating commands.
//!
//! Values are what the store persists for each target, so every variant is
//! serializable. Closures serialize as their canonical source plus the
//! values they captured.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::lang::ast::{format_num, Expr, Param};
use crate::lang::parser::parse_expr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Num(#[serde(with = "num_repr")] f64),
    Str(String),
    List(Vec<Value>),
    /// Named collection; a `class` entry drives generic dispatch.
    Record(BTreeMap<String, Value>),
    Closure(Closure),
    /// Reference to a native function by name.
    Native(String),
    /// Result of `vectorize(f)`: maps the wrapped function over its first argument.
    Vectorized(Box<Value>),
    /// Result of `generic("name")`: dispatches on the class of its first argument.
    Generic(String),
}

/// JSON has no non-finite numbers, so those travel as `"NaN"`, `"Inf"` and
/// `"-Inf"`.
mod num_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(n: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if n.is_nan() {
            serializer.serialize_str("NaN")
        } else if n.is_infinite() {
            serializer.serialize_str(if *n > 0.0 { "Inf" } else { "-Inf" })
        } else {
            serializer.serialize_f64(*n)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(n),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Inf" => Ok(f64::INFINITY),
                "-Inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid number '{other}'"))),
            },
        }
    }
}

/// A user-defined function.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ClosureRepr", into = "ClosureRepr")]
pub struct Closure {
    pub params: Vec<Param>,
    pub body: Expr,
    pub captured: BTreeMap<String, Value>,
}

impl Closure {
    /// Canonical `function(...) body` text.
    pub fn source(&self) -> String {
        Expr::Function {
            params: self.params.clone(),
            body: Box::new(self.body.clone()),
        }
        .to_string()
    }
}

impl PartialEq for Closure {
    fn eq(&self, other: &Self) -> bool {
        self.source() == other.source() && self.captured == other.captured
    }
}

#[derive(Serialize, Deserialize)]
struct ClosureRepr {
    source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    captured: BTreeMap<String, Value>,
}

impl From<Closure> for ClosureRepr {
    fn from(closure: Closure) -> Self {
        ClosureRepr {
            source: closure.source(),
            captured: closure.captured,
        }
    }
}

impl TryFrom<ClosureRepr> for Closure {
    type Error = String;

    fn try_from(repr: ClosureRepr) -> Result<Self, Self::Error> {
        match parse_expr(&repr.source).map_err(|e| e.to_string())? {
            Expr::Function { params, body } => Ok(Closure {
                params,
                body: *body,
                captured: repr.captured,
            }),
            other => Err(format!("stored closure is not a function: {other}")),
        }
    }
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    /// Class used for generic dispatch.
    pub fn class(&self) -> String {
        match self {
            Value::Null => "NULL".into(),
            Value::Bool(_) => "logical".into(),
            Value::Num(_) => "numeric".into(),
            Value::Str(_) => "character".into(),
            Value::List(_) => "list".into(),
            Value::Record(fields) => match fields.get("class") {
                Some(Value::Str(class)) => class.clone(),
                _ => "list".into(),
            },
            Value::Closure(_) | Value::Native(_) | Value::Vectorized(_) | Value::Generic(_) => {
                "function".into()
            }
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Closure(_) | Value::Native(_) | Value::Vectorized(_) | Value::Generic(_)
        )
    }

    /// Number of elements, R-style: scalars have length 1 and `NULL` has length 0.
    pub fn len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::List(items) => items.len(),
            Value::Record(fields) => fields.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Truthiness for `if`, `&&` and `||`.
    pub fn truthy(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Num(n) => Some(*n != 0.0),
            Value::List(items) if items.len() == 1 => items[0].truthy(),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::List(items) if items.len() == 1 => items[0].as_num(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::List(items) if items.len() == 1 => items[0].as_str(),
            _ => None,
        }
    }

    /// Elements of a vector-like value; scalars are a single element.
    pub fn elements(&self) -> Vec<Value> {
        match self {
            Value::Null => Vec::new(),
            Value::List(items) => items.clone(),
            Value::Record(fields) => fields.values().cloned().collect(),
            other => vec![other.clone()],
        }
    }

    /// Text used by `paste`, `message` and friends.
    pub fn display_text(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(true) => f.write_str("TRUE"),
            Value::Bool(false) => f.write_str("FALSE"),
            Value::Num(n) => f.write_str(&format_num(*n)),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Record(fields) => {
                f.write_str("{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            Value::Closure(closure) => f.write_str(&closure.source()),
            Value::Native(name) => write!(f, "<native {name}>"),
            Value::Vectorized(inner) => write!(f, "<vectorized {inner}>"),
            Value::Generic(name) => write!(f, "<generic {name}>"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
