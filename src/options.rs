//! Carrier options
//!
//! Carriers and monitors receive their configuration as flat key-value
//! strings. Options come from three places: `+`-qualified carrier spec
//! strings handed to `add_output` (`stream+send.zstd+level.3`), literal
//! `key=value` lists, and TOML tables loaded from a configuration file.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Flat key-value option set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    map: BTreeMap<String, String>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a whitespace-separated `key=value` list.
    ///
    /// A bare token with no `=` becomes a flag with value `"1"`.
    pub fn from_kv_str(s: &str) -> Self {
        let mut map = BTreeMap::new();
        for tok in s.split_whitespace() {
            match tok.split_once('=') {
                Some((k, v)) => map.insert(k.to_string(), v.to_string()),
                None => map.insert(tok.to_string(), "1".to_string()),
            };
        }
        Self { map }
    }

    /// Load a named table from a TOML file.
    ///
    /// Every scalar entry in the table becomes one option, stringified.
    pub fn from_toml_file<P: AsRef<Path>>(path: P, table: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let doc: toml::Table =
            toml::from_str(&contents).map_err(|e| Error::Serialization(e.to_string()))?;
        let section = doc
            .get(table)
            .and_then(|v| v.as_table())
            .ok_or_else(|| Error::Other(format!("no [{}] table in options file", table)))?;
        let mut map = BTreeMap::new();
        for (k, v) in section {
            let s = match v {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => (*b as i32).to_string(),
                other => other.to_string(),
            };
            map.insert(k.clone(), s);
        }
        Ok(Self { map })
    }

    pub fn put(&mut self, key: &str, value: &str) -> &mut Self {
        self.map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn check(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key)?.parse().ok()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.parse().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A parsed carrier specification: base carrier name plus qualifiers.
///
/// Spec strings use `+` to chain qualifiers onto the base name and `.`
/// to separate a qualifier key from its value:
///
/// ```text
/// stream
/// stream+send.zstd+level.3     → base "stream", {send: zstd, level: 3}
/// dgram+recv.zstd              → base "dgram",  {recv: zstd}
/// ```
///
/// A qualifier without a `.` value becomes a flag with value `"1"`.
#[derive(Debug, Clone, PartialEq)]
pub struct CarrierSpec {
    pub base: String,
    pub options: Options,
}

impl CarrierSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split('+');
        let base = parts
            .next()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::Negotiation(format!("empty carrier spec '{}'", spec)))?
            .to_string();
        let mut options = Options::new();
        for part in parts {
            if part.is_empty() {
                return Err(Error::Negotiation(format!(
                    "empty qualifier in carrier spec '{}'",
                    spec
                )));
            }
            match part.split_once('.') {
                Some((k, v)) => options.put(k, v),
                None => options.put(part, "1"),
            };
        }
        Ok(Self { base, options })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_parse() {
        let o = Options::from_kv_str("level=3 verbose host=10.0.0.2");
        assert_eq!(o.get("level"), Some("3"));
        assert_eq!(o.get_i64("level"), Some(3));
        assert_eq!(o.get("verbose"), Some("1"));
        assert_eq!(o.get("host"), Some("10.0.0.2"));
        assert!(!o.check("missing"));
    }

    #[test]
    fn test_carrier_spec_plain() {
        let s = CarrierSpec::parse("stream").unwrap();
        assert_eq!(s.base, "stream");
        assert!(s.options.is_empty());
    }

    #[test]
    fn test_carrier_spec_qualified() {
        let s = CarrierSpec::parse("stream+send.zstd+level.3").unwrap();
        assert_eq!(s.base, "stream");
        assert_eq!(s.options.get("send"), Some("zstd"));
        assert_eq!(s.options.get_i64("level"), Some(3));
    }

    #[test]
    fn test_carrier_spec_flag() {
        let s = CarrierSpec::parse("dgram+lossy").unwrap();
        assert_eq!(s.base, "dgram");
        assert_eq!(s.options.get("lossy"), Some("1"));
    }

    #[test]
    fn test_carrier_spec_empty() {
        assert!(CarrierSpec::parse("").is_err());
        assert!(CarrierSpec::parse("stream++x").is_err());
    }

    #[test]
    fn test_toml_table_loading() {
        let path = std::env::temp_dir().join("setu-options-test.toml");
        std::fs::write(
            &path,
            "[carrier]\nsend = \"zstd\"\nlevel = 3\nverbose = true\n",
        )
        .unwrap();
        let o = Options::from_toml_file(&path, "carrier").unwrap();
        assert_eq!(o.get("send"), Some("zstd"));
        assert_eq!(o.get_i64("level"), Some(3));
        assert_eq!(o.get("verbose"), Some("1"));
        assert!(Options::from_toml_file(&path, "missing").is_err());
        let _ = std::fs::remove_file(&path);
    }
}
