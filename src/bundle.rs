//! Tagged value model and wire codecs
//!
//! A `Bundle` is an ordered list of tagged values, the unit of exchange
//! between ports. Two codecs are provided:
//!
//! ```text
//! Binary (stream/dgram carriers)
//! ┌───────────────┬───────────────┬──────────────────────────┐
//! │ LIST tag (i32)│ count (i32)   │ count × (tag, value)     │
//! │ little-endian │ little-endian │ strings length-prefixed  │
//! └───────────────┴───────────────┴──────────────────────────┘
//!
//! Text (text carrier)
//! one line, space-separated tokens, quoted strings, nested lists
//! in parentheses, vocabs in brackets, blobs in braces (hex)
//! ```
//!
//! The binary layout is the compatibility-critical part: every scalar is
//! a `(type-tag, value)` pair, lists carry an element count, and strings
//! and blobs carry a byte length. Unknown tags fail the whole decode.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Type tag for 32-bit integers
pub const TAG_INT32: i32 = 1;
/// Type tag for length-prefixed UTF-8 strings
pub const TAG_STRING: i32 = 4;
/// Type tag for 32-bit vocabulary codes
pub const TAG_VOCAB: i32 = 9;
/// Type tag for 64-bit floats
pub const TAG_FLOAT64: i32 = 10;
/// Type tag for length-prefixed binary blobs
pub const TAG_BLOB: i32 = 12;
/// Type tag for 64-bit integers
pub const TAG_INT64: i32 = 17;
/// Type tag for nested lists
pub const TAG_LIST: i32 = 256;

/// Pack up to four ASCII characters into a vocabulary code.
///
/// The first character occupies the low byte, so codes sort and compare
/// the way the string reads.
pub const fn vocab(s: &[u8]) -> u32 {
    let mut v: u32 = 0;
    let mut i = 0;
    while i < s.len() && i < 4 {
        v |= (s[i] as u32) << (8 * i);
        i += 1;
    }
    v
}

/// Decode a vocabulary code back into its character form
pub fn vocab_str(v: u32) -> String {
    let mut out = String::new();
    for i in 0..4 {
        let b = ((v >> (8 * i)) & 0xff) as u8;
        if b == 0 {
            break;
        }
        out.push(b as char);
    }
    out
}

/// One tagged value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Float64(f64),
    /// 32-bit symbolic code, at most four characters
    Vocab(u32),
    Str(String),
    Blob(Vec<u8>),
    List(Bundle),
}

impl Value {
    /// Wire type tag for this value
    pub fn tag(&self) -> i32 {
        match self {
            Value::Int32(_) => TAG_INT32,
            Value::Int64(_) => TAG_INT64,
            Value::Float64(_) => TAG_FLOAT64,
            Value::Vocab(_) => TAG_VOCAB,
            Value::Str(_) => TAG_STRING,
            Value::Blob(_) => TAG_BLOB,
            Value::List(_) => TAG_LIST,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            Value::Int64(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vocab(&self) -> Option<u32> {
        match self {
            Value::Vocab(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Bundle> {
        match self {
            Value::List(b) => Some(b),
            _ => None,
        }
    }

    /// Symbolic form of a leading command token: vocabs and strings both
    /// qualify, everything else does not.
    pub fn as_tag_text(&self) -> Option<String> {
        match self {
            Value::Vocab(v) => Some(vocab_str(*v)),
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// Ordered list of tagged values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bundle {
    values: Vec<Value>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle from a list of values
    pub fn from_values(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn push(&mut self, value: Value) -> &mut Self {
        self.values.push(value);
        self
    }

    pub fn push_i32(&mut self, v: i32) -> &mut Self {
        self.push(Value::Int32(v))
    }

    pub fn push_i64(&mut self, v: i64) -> &mut Self {
        self.push(Value::Int64(v))
    }

    pub fn push_f64(&mut self, v: f64) -> &mut Self {
        self.push(Value::Float64(v))
    }

    pub fn push_vocab(&mut self, s: &[u8]) -> &mut Self {
        self.push(Value::Vocab(vocab(s)))
    }

    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.push(Value::Str(s.to_string()))
    }

    pub fn push_blob(&mut self, b: &[u8]) -> &mut Self {
        self.push(Value::Blob(b.to_vec()))
    }

    pub fn push_list(&mut self, b: Bundle) -> &mut Self {
        self.push(Value::List(b))
    }

    // === Binary codec ===

    /// Encode to the binary wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.values.len() * 8);
        encode_list(&mut out, self);
        out
    }

    /// Decode from the binary wire form, requiring full consumption
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor { buf, pos: 0 };
        let bundle = decode_list(&mut cur)?;
        if cur.pos != buf.len() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after bundle",
                buf.len() - cur.pos
            )));
        }
        Ok(bundle)
    }

    // === Text codec ===

    /// Encode to the single-line text form
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            write_text_value(&mut out, v);
        }
        out
    }

    /// Decode from the text form
    pub fn from_text(line: &str) -> Result<Self> {
        let mut chars = line.chars().peekable();
        let values = parse_text_values(&mut chars, false)?;
        Ok(Bundle { values })
    }
}

impl std::fmt::Display for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

impl FromIterator<Value> for Bundle {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Bundle {
            values: iter.into_iter().collect(),
        }
    }
}

/// Conversion into the wire data model.
///
/// Device and application crates implement this (or use [`to_typed`])
/// to publish their own types through a port without knowing anything
/// about connections or carriers.
pub trait ToBundle {
    fn to_bundle(&self) -> Bundle;
}

/// Conversion out of the wire data model
pub trait FromBundle: Sized {
    fn from_bundle(bundle: &Bundle) -> Result<Self>;
}

impl ToBundle for Bundle {
    fn to_bundle(&self) -> Bundle {
        self.clone()
    }
}

impl FromBundle for Bundle {
    fn from_bundle(bundle: &Bundle) -> Result<Self> {
        Ok(bundle.clone())
    }
}

/// Marker vocab identifying a typed (postcard) payload container
const TYPED_MARKER: u32 = vocab(b"tser");

/// Wrap any serde type in a blob-carrying bundle.
///
/// The result is `[ [tser] <blob> ]`: a marker vocab plus the postcard
/// encoding. The receiving side recovers the value with [`from_typed`].
pub fn to_typed<T: Serialize>(value: &T) -> Result<Bundle> {
    let bytes =
        postcard::to_allocvec(value).map_err(|e| Error::Serialization(e.to_string()))?;
    let mut b = Bundle::new();
    b.push(Value::Vocab(TYPED_MARKER));
    b.push(Value::Blob(bytes));
    Ok(b)
}

/// Recover a serde type wrapped by [`to_typed`]
pub fn from_typed<T: DeserializeOwned>(bundle: &Bundle) -> Result<T> {
    let marker = bundle.get(0).and_then(Value::as_vocab);
    if marker != Some(TYPED_MARKER) {
        return Err(Error::Serialization(
            "bundle is not a typed payload container".to_string(),
        ));
    }
    let blob = bundle
        .get(1)
        .and_then(Value::as_blob)
        .ok_or_else(|| Error::Serialization("typed container missing blob".to_string()))?;
    postcard::from_bytes(blob).map_err(|e| Error::Serialization(e.to_string()))
}

// === Binary codec internals ===

fn encode_list(out: &mut Vec<u8>, bundle: &Bundle) {
    out.extend_from_slice(&TAG_LIST.to_le_bytes());
    out.extend_from_slice(&(bundle.values.len() as i32).to_le_bytes());
    for v in &bundle.values {
        encode_value(out, v);
    }
}

fn encode_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Int32(v) => {
            out.extend_from_slice(&TAG_INT32.to_le_bytes());
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Int64(v) => {
            out.extend_from_slice(&TAG_INT64.to_le_bytes());
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Float64(v) => {
            out.extend_from_slice(&TAG_FLOAT64.to_le_bytes());
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Vocab(v) => {
            out.extend_from_slice(&TAG_VOCAB.to_le_bytes());
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Str(s) => {
            out.extend_from_slice(&TAG_STRING.to_le_bytes());
            out.extend_from_slice(&(s.len() as i32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            out.extend_from_slice(&TAG_BLOB.to_le_bytes());
            out.extend_from_slice(&(b.len() as i32).to_le_bytes());
            out.extend_from_slice(b);
        }
        Value::List(b) => encode_list(out, b),
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Protocol(format!(
                "truncated bundle: wanted {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn take_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn take_f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn take_len(&mut self) -> Result<usize> {
        let n = self.take_i32()?;
        if n < 0 {
            return Err(Error::Protocol(format!("negative length {}", n)));
        }
        Ok(n as usize)
    }
}

fn decode_list(cur: &mut Cursor<'_>) -> Result<Bundle> {
    let tag = cur.take_i32()?;
    if tag != TAG_LIST {
        return Err(Error::Protocol(format!(
            "expected list tag {}, found {}",
            TAG_LIST, tag
        )));
    }
    decode_list_body(cur)
}

fn decode_list_body(cur: &mut Cursor<'_>) -> Result<Bundle> {
    let count = cur.take_len()?;
    let mut values = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        values.push(decode_value(cur)?);
    }
    Ok(Bundle { values })
}

fn decode_value(cur: &mut Cursor<'_>) -> Result<Value> {
    let tag = cur.take_i32()?;
    match tag {
        TAG_INT32 => Ok(Value::Int32(cur.take_i32()?)),
        TAG_INT64 => Ok(Value::Int64(cur.take_i64()?)),
        TAG_FLOAT64 => Ok(Value::Float64(cur.take_f64()?)),
        TAG_VOCAB => Ok(Value::Vocab(cur.take_u32()?)),
        TAG_STRING => {
            let len = cur.take_len()?;
            let bytes = cur.take(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|e| Error::Protocol(format!("invalid UTF-8 in string: {}", e)))?;
            Ok(Value::Str(s.to_string()))
        }
        TAG_BLOB => {
            let len = cur.take_len()?;
            Ok(Value::Blob(cur.take(len)?.to_vec()))
        }
        TAG_LIST => Ok(Value::List(decode_list_body(cur)?)),
        other => Err(Error::Protocol(format!("unknown type tag {}", other))),
    }
}

// === Text codec internals ===

fn write_text_value(out: &mut String, value: &Value) {
    match value {
        Value::Int32(v) => out.push_str(&v.to_string()),
        Value::Int64(v) => out.push_str(&v.to_string()),
        Value::Float64(v) => {
            // {:?} keeps the decimal point on round numbers so the
            // reader can distinguish 3.0 from 3
            out.push_str(&format!("{:?}", v));
        }
        Value::Vocab(v) => {
            out.push('[');
            out.push_str(&vocab_str(*v));
            out.push(']');
        }
        Value::Str(s) => {
            if needs_quoting(s) {
                out.push('"');
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            } else {
                out.push_str(s);
            }
        }
        Value::Blob(b) => {
            out.push('{');
            for byte in b {
                out.push_str(&format!("{:02x}", byte));
            }
            out.push('}');
        }
        Value::List(b) => {
            out.push('(');
            out.push_str(&b.to_text());
            out.push(')');
        }
    }
}

fn needs_quoting(s: &str) -> bool {
    if s.is_empty() {
        return true;
    }
    if s.parse::<i64>().is_ok() || s.parse::<f64>().is_ok() {
        return true;
    }
    s.chars()
        .any(|c| c.is_whitespace() || "()[]{}\"\\".contains(c))
}

type CharStream<'a> = std::iter::Peekable<std::str::Chars<'a>>;

fn parse_text_values(chars: &mut CharStream<'_>, nested: bool) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.peek().copied() {
            None => {
                if nested {
                    return Err(Error::Protocol("unterminated list".to_string()));
                }
                return Ok(values);
            }
            Some(')') => {
                if !nested {
                    return Err(Error::Protocol("unbalanced ')'".to_string()));
                }
                chars.next();
                return Ok(values);
            }
            Some('(') => {
                chars.next();
                let inner = parse_text_values(chars, true)?;
                values.push(Value::List(Bundle { values: inner }));
            }
            Some('"') => {
                chars.next();
                values.push(Value::Str(parse_quoted(chars)?));
            }
            Some('[') => {
                chars.next();
                let mut tok = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(c) => tok.push(c),
                        None => {
                            return Err(Error::Protocol("unterminated vocab".to_string()));
                        }
                    }
                }
                values.push(Value::Vocab(vocab(tok.as_bytes())));
            }
            Some('{') => {
                chars.next();
                let mut hex = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => hex.push(c),
                        None => {
                            return Err(Error::Protocol("unterminated blob".to_string()));
                        }
                    }
                }
                values.push(Value::Blob(parse_hex(&hex)?));
            }
            Some(_) => {
                let mut tok = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "()[]{}\"".contains(c) {
                        break;
                    }
                    tok.push(c);
                    chars.next();
                }
                values.push(parse_bare_token(&tok));
            }
        }
    }
}

fn parse_quoted(chars: &mut CharStream<'_>) -> Result<String> {
    let mut out = String::new();
    loop {
        match chars.next() {
            Some('"') => return Ok(out),
            Some('\\') => match chars.next() {
                Some(c) => out.push(c),
                None => return Err(Error::Protocol("unterminated string".to_string())),
            },
            Some(c) => out.push(c),
            None => return Err(Error::Protocol("unterminated string".to_string())),
        }
    }
}

fn parse_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(Error::Protocol("odd-length blob hex".to_string()));
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for i in (0..bytes.len()).step_by(2) {
        let pair = std::str::from_utf8(&bytes[i..i + 2]).unwrap_or("zz");
        let b = u8::from_str_radix(pair, 16)
            .map_err(|_| Error::Protocol(format!("bad blob hex '{}'", pair)))?;
        out.push(b);
    }
    Ok(out)
}

fn parse_bare_token(tok: &str) -> Value {
    if let Ok(v) = tok.parse::<i32>() {
        return Value::Int32(v);
    }
    if let Ok(v) = tok.parse::<i64>() {
        return Value::Int64(v);
    }
    if tok.contains('.') || tok.contains('e') || tok.contains('E') {
        if let Ok(v) = tok.parse::<f64>() {
            return Value::Float64(v);
        }
    }
    Value::Str(tok.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bundle {
        let mut inner = Bundle::new();
        inner.push_i32(7).push_str("deep");
        let mut b = Bundle::new();
        b.push_vocab(b"set")
            .push_i32(-5)
            .push_i64(1 << 40)
            .push_f64(2.25)
            .push_str("two words")
            .push_blob(&[0xde, 0xad, 0xbe, 0xef])
            .push_list(inner);
        b
    }

    #[test]
    fn test_binary_round_trip() {
        let b = sample();
        let bytes = b.to_bytes();
        let back = Bundle::from_bytes(&bytes).unwrap();
        assert_eq!(b, back);
    }

    #[test]
    fn test_binary_layout() {
        let mut b = Bundle::new();
        b.push_i32(3);
        let bytes = b.to_bytes();
        // LIST tag, count 1, INT32 tag, value 3
        assert_eq!(&bytes[0..4], &TAG_LIST.to_le_bytes());
        assert_eq!(&bytes[4..8], &1i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &TAG_INT32.to_le_bytes());
        assert_eq!(&bytes[12..16], &3i32.to_le_bytes());
    }

    #[test]
    fn test_truncated_fails() {
        let bytes = sample().to_bytes();
        assert!(Bundle::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(Bundle::from_bytes(&bytes[..5]).is_err());
    }

    #[test]
    fn test_unknown_tag_fails() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&TAG_LIST.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&99i32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        assert!(Bundle::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_text_round_trip() {
        let b = sample();
        let line = b.to_text();
        let back = Bundle::from_text(&line).unwrap();
        assert_eq!(b, back);
    }

    #[test]
    fn test_text_form() {
        let b = sample();
        assert_eq!(
            b.to_text(),
            "[set] -5 1099511627776 2.25 \"two words\" {deadbeef} (7 deep)"
        );
    }

    #[test]
    fn test_text_numeric_string_quoted() {
        let mut b = Bundle::new();
        b.push_str("42");
        let back = Bundle::from_text(&b.to_text()).unwrap();
        assert_eq!(back.get(0).unwrap().as_str(), Some("42"));
    }

    #[test]
    fn test_vocab_packing() {
        assert_eq!(vocab(b"ok"), (b'o' as u32) | ((b'k' as u32) << 8));
        assert_eq!(vocab_str(vocab(b"help")), "help");
    }

    #[test]
    fn test_typed_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Pose {
            x: f64,
            y: f64,
            theta: f64,
        }
        let p = Pose {
            x: 1.0,
            y: -2.0,
            theta: 0.5,
        };
        let b = to_typed(&p).unwrap();
        let wire = Bundle::from_bytes(&b.to_bytes()).unwrap();
        let back: Pose = from_typed(&wire).unwrap();
        assert_eq!(p, back);
    }
}
