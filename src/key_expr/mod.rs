//! Sandboxed key functions for Kafka targets.
//!
//! A target's `keyFunction` text is compiled once into a [`KeyFunction`] and
//! evaluated per message against the payload and topic. Only property
//! access, literals and concatenation are available.

mod parser;

pub use parser::{parse_function, Expr, ParseError, ParsedFunction};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SenderError};
use crate::types::Payload;

/// A compiled key function.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyFunction {
    params: Vec<String>,
    body: Expr,
}

impl KeyFunction {
    /// Compile function text.
    pub fn compile(text: &str) -> Result<Self> {
        let parsed = parse_function(text)
            .map_err(|e| SenderError::KeyFunction(format!("cannot compile '{}': {}", text, e)))?;
        Ok(Self {
            params: parsed.params,
            body: parsed.body,
        })
    }

    /// Evaluate against a payload and topic.
    ///
    /// The function sees the payload as it is about to be sent: text is a
    /// string even when it looks like JSON, and serialized bytes are an
    /// opaque buffer whose named properties are all undefined.
    /// `None` means the message is sent without a key.
    pub fn evaluate(&self, payload: &Payload, topic: &str) -> Result<Option<String>> {
        let bindings = Bindings {
            params: &self.params,
            args: [Operand::from_payload(payload), Operand::Json(Value::String(topic.to_string()))],
        };
        Ok(match eval(&self.body, &bindings)? {
            Operand::Json(Value::Null) => None,
            other => Some(other.display()),
        })
    }
}

/// A value flowing through evaluation.
#[derive(Debug, Clone)]
enum Operand {
    Json(Value),
    Bytes(Vec<u8>),
}

impl Operand {
    fn from_payload(payload: &Payload) -> Self {
        match payload {
            Payload::Text(s) => Operand::Json(Value::String(s.clone())),
            Payload::Json(v) => Operand::Json(v.clone()),
            Payload::Binary(b) => Operand::Bytes(b.clone()),
        }
    }

    fn display(&self) -> String {
        match self {
            Operand::Json(v) => to_display(v),
            Operand::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Operand::Json(v) if v.is_number() => v.as_f64(),
            _ => None,
        }
    }
}

struct Bindings<'a> {
    params: &'a [String],
    args: [Operand; 2],
}

impl Bindings<'_> {
    fn lookup(&self, name: &str) -> Result<Operand> {
        match self.params.iter().position(|p| p == name) {
            Some(idx) => Ok(self
                .args
                .get(idx)
                .cloned()
                .unwrap_or(Operand::Json(Value::Null))),
            None => Err(SenderError::KeyFunction(format!("{} is not defined", name))),
        }
    }
}

fn eval(expr: &Expr, bindings: &Bindings<'_>) -> Result<Operand> {
    match expr {
        Expr::Literal(value) => Ok(Operand::Json(value.clone())),
        Expr::Variable(name) => bindings.lookup(name),
        Expr::Member(base, name) => {
            let base = eval(base, bindings)?;
            property(&base, name).map(Operand::Json)
        }
        Expr::Index(base, index) => {
            let base = eval(base, bindings)?;
            let index = eval(index, bindings)?;
            property(&base, &index.display()).map(Operand::Json)
        }
        Expr::Add(left, right) => {
            let left = eval(left, bindings)?;
            let right = eval(right, bindings)?;
            Ok(Operand::Json(match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => parser::number_value(a + b),
                _ => Value::String(format!("{}{}", left.display(), right.display())),
            }))
        }
        Expr::Stringify(inner) => {
            let value = eval(inner, bindings)?;
            Ok(Operand::Json(Value::String(value.display())))
        }
    }
}

fn property(base: &Operand, name: &str) -> Result<Value> {
    let base = match base {
        Operand::Bytes(bytes) if name == "length" => return Ok(Value::from(bytes.len())),
        Operand::Bytes(bytes) => {
            return Ok(name
                .parse::<usize>()
                .ok()
                .and_then(|idx| bytes.get(idx))
                .map(|b| Value::from(*b))
                .unwrap_or(Value::Null))
        }
        Operand::Json(value) => value,
    };

    match base {
        Value::Null => Err(SenderError::KeyFunction(format!(
            "cannot read property '{}' of null",
            name
        ))),
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        Value::Array(items) if name == "length" => Ok(Value::from(items.len())),
        Value::Array(items) => Ok(name
            .parse::<usize>()
            .ok()
            .and_then(|idx| items.get(idx).cloned())
            .unwrap_or(Value::Null)),
        Value::String(s) if name == "length" => Ok(Value::from(s.chars().count())),
        Value::String(s) => Ok(name
            .parse::<usize>()
            .ok()
            .and_then(|idx| s.chars().nth(idx))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

/// Text of a value as a key. Whole floats print without a fraction.
fn to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_f64() => n
            .as_f64()
            .map(|f| parser::number_value(f).to_string())
            .unwrap_or_else(|| n.to_string()),
        other => other.to_string(),
    }
}

/// Compiled key functions keyed by their literal text.
#[derive(Default)]
pub struct KeyFunctionRegistry {
    compiled: RwLock<HashMap<String, Arc<KeyFunction>>>,
}

impl KeyFunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the compiled function for `text`, compiling it on first use.
    pub fn get_or_compile(&self, text: &str) -> Result<Arc<KeyFunction>> {
        if let Some(function) = self
            .compiled
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(text)
        {
            return Ok(Arc::clone(function));
        }

        debug!(function = %text, "Compiling key function");
        let function = Arc::new(KeyFunction::compile(text)?);
        self.compiled
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(text.to_string(), Arc::clone(&function));
        Ok(function)
    }

    /// Number of distinct compiled functions.
    pub fn len(&self) -> usize {
        self.compiled.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing has been compiled yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
