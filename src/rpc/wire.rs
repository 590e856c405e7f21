//! RPC tag frame encoding and argument decoding
//!
//! A call is a tagged list. The leading element is the tag descriptor,
//! a nested list of `(tag-name, version-major, version-minor)`; the
//! outer frame's element count includes it. Positional arguments follow
//! in declared order:
//!
//! ```text
//! [ ("set_speed" 1 0) 0.5 ]
//! ```
//!
//! A reply is a list holding the return value, or nothing for `void`
//! methods; the zero-length reply is still a required synchronization
//! frame. Text-mode callers may omit the descriptor and lead with bare
//! tokens; those parse with version (0, 0).
//!
//! Trailing parameters may declare defaults: a frame that ends early
//! fills the rest from declarations instead of failing. Enumeration
//! parameters travel as integer codes checked against a symbolic
//! table; an unknown code fails that field while the remaining fields
//! still parse.

use crate::bundle::{Bundle, Value};
use crate::error::{Error, Result};
use std::sync::Arc;

/// A parsed call frame
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub tag: String,
    pub version: (i32, i32),
    pub args: Vec<Value>,
}

/// Encode a call frame
pub fn make_call(tag: &str, version: (i32, i32), args: &[Value]) -> Bundle {
    let mut descriptor = Bundle::new();
    descriptor
        .push_str(tag)
        .push_i32(version.0)
        .push_i32(version.1);
    let mut frame = Bundle::new();
    frame.push_list(descriptor);
    for arg in args {
        frame.push(arg.clone());
    }
    frame
}

/// Decode a call frame.
///
/// Accepts the full descriptor form and, for hand-typed text calls, a
/// bare leading tag token.
pub fn parse_call(frame: &Bundle) -> Result<Call> {
    let head = frame
        .get(0)
        .ok_or_else(|| Error::Protocol("empty call frame".to_string()))?;

    if let Some(descriptor) = head.as_list() {
        let tag = descriptor
            .get(0)
            .and_then(Value::as_tag_text)
            .ok_or_else(|| Error::Protocol("tag descriptor missing name".to_string()))?;
        let major = descriptor.get(1).and_then(Value::as_i32).unwrap_or(0);
        let minor = descriptor.get(2).and_then(Value::as_i32).unwrap_or(0);
        return Ok(Call {
            tag,
            version: (major, minor),
            args: frame.values()[1..].to_vec(),
        });
    }

    // Bare leading token (text carrier, humans)
    let tag = head
        .as_tag_text()
        .ok_or_else(|| Error::Protocol("call frame has no tag".to_string()))?;
    Ok(Call {
        tag,
        version: (0, 0),
        args: frame.values()[1..].to_vec(),
    })
}

/// Encode a reply frame; `None` is the zero-length `void` reply
pub fn make_reply(value: Option<Value>) -> Bundle {
    let mut frame = Bundle::new();
    if let Some(value) = value {
        frame.push(value);
    }
    frame
}

/// Encode a failure reply
pub fn make_fail(message: &str) -> Bundle {
    let mut frame = Bundle::new();
    frame.push_vocab(b"fail").push_str(message);
    frame
}

/// True if a reply frame is the `fail` form
pub fn is_fail(frame: &Bundle) -> bool {
    frame.get(0).and_then(Value::as_vocab) == Some(crate::bundle::vocab(b"fail"))
}

/// Symbolic table for an enumeration-typed parameter
#[derive(Debug)]
pub struct EnumTable {
    name: String,
    entries: Vec<(i32, String)>,
}

impl EnumTable {
    pub fn new(name: &str, entries: &[(i32, &str)]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            entries: entries
                .iter()
                .map(|(code, symbol)| (*code, symbol.to_string()))
                .collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self, code: i32) -> Option<&str> {
        self.entries
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, s)| s.as_str())
    }

    pub fn code(&self, symbol: &str) -> Option<i32> {
        self.entries
            .iter()
            .find(|(_, s)| s == symbol)
            .map(|(c, _)| *c)
    }
}

/// Wire type of one declared parameter
#[derive(Debug, Clone)]
pub enum ParamType {
    I32,
    I64,
    F64,
    Str,
    /// Integer code constrained to a symbolic table
    Enum(Arc<EnumTable>),
}

/// One declared positional parameter
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    ty: ParamType,
    default: Option<Value>,
}

impl Param {
    pub fn i32(name: &str) -> Self {
        Self::new(name, ParamType::I32)
    }

    pub fn i64(name: &str) -> Self {
        Self::new(name, ParamType::I64)
    }

    pub fn f64(name: &str) -> Self {
        Self::new(name, ParamType::F64)
    }

    pub fn str(name: &str) -> Self {
        Self::new(name, ParamType::Str)
    }

    pub fn enumeration(name: &str, table: Arc<EnumTable>) -> Self {
        Self::new(name, ParamType::Enum(table))
    }

    fn new(name: &str, ty: ParamType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            default: None,
        }
    }

    /// Declare a default, making this parameter optional on the wire.
    /// Only a contiguous trailing run of defaults is legal; the
    /// dispatcher validates that at registration.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// One-line description for help output
    pub fn describe(&self) -> String {
        let ty = match &self.ty {
            ParamType::I32 => "i32".to_string(),
            ParamType::I64 => "i64".to_string(),
            ParamType::F64 => "f64".to_string(),
            ParamType::Str => "str".to_string(),
            ParamType::Enum(table) => format!("enum {}", table.name()),
        };
        match &self.default {
            Some(default) => {
                let mut text = String::new();
                let mut b = Bundle::new();
                b.push(default.clone());
                text.push_str(&b.to_text());
                format!("{}: {} = {}", self.name, ty, text)
            }
            None => format!("{}: {}", self.name, ty),
        }
    }

    fn decode(&self, value: &Value) -> std::result::Result<Value, String> {
        match &self.ty {
            ParamType::I32 => value
                .as_i32()
                .map(Value::Int32)
                .ok_or_else(|| format!("argument '{}' is not an i32", self.name)),
            ParamType::I64 => value
                .as_i64()
                .map(Value::Int64)
                .ok_or_else(|| format!("argument '{}' is not an i64", self.name)),
            ParamType::F64 => value
                .as_f64()
                .map(Value::Float64)
                .ok_or_else(|| format!("argument '{}' is not an f64", self.name)),
            ParamType::Str => value
                .as_str()
                .map(|s| Value::Str(s.to_string()))
                .ok_or_else(|| format!("argument '{}' is not a string", self.name)),
            ParamType::Enum(table) => {
                let code = value
                    .as_i32()
                    .ok_or_else(|| format!("argument '{}' is not an enum code", self.name))?;
                match table.symbol(code) {
                    Some(_) => Ok(Value::Int32(code)),
                    None => Err(format!(
                        "argument '{}': code {} is not in enum {}",
                        self.name,
                        code,
                        table.name()
                    )),
                }
            }
        }
    }
}

/// Decode positional arguments against the declared parameters.
///
/// Missing trailing arguments take their declared defaults. Every
/// field is decoded even after a failure, so the error cites the exact
/// offending fields.
pub fn decode_args(params: &[Param], args: &[Value]) -> Result<Vec<Value>> {
    let mut decoded = Vec::with_capacity(params.len());
    let mut failures: Vec<String> = Vec::new();

    for (index, param) in params.iter().enumerate() {
        match args.get(index) {
            Some(value) => match param.decode(value) {
                Ok(value) => decoded.push(value),
                Err(message) => failures.push(message),
            },
            None => match &param.default {
                Some(default) => decoded.push(default.clone()),
                None => failures.push(format!("missing argument '{}'", param.name)),
            },
        }
    }

    if args.len() > params.len() {
        failures.push(format!(
            "{} extra arguments",
            args.len() - params.len()
        ));
    }

    if failures.is_empty() {
        Ok(decoded)
    } else {
        Err(Error::Protocol(failures.join("; ")))
    }
}
