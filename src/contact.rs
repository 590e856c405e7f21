//! Port addressing
//!
//! A `Contact` identifies one endpoint of a connection: the logical port
//! name, the host it lives on, the transport port number, and the carrier
//! used to reach it. Contacts are immutable values; they are created at
//! port-open time or resolved by name, and replaced rather than mutated.

use crate::error::{Error, Result};

/// Address tuple for one messaging endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Contact {
    name: String,
    host: String,
    port: u16,
    carrier: String,
}

impl Contact {
    /// Create a contact, validating the port name
    pub fn new(name: &str, host: &str, port: u16, carrier: &str) -> Result<Self> {
        validate_port_name(name)?;
        Ok(Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            carrier: carrier.to_string(),
        })
    }

    /// Contact with only a logical name, to be resolved later
    pub fn by_name(name: &str) -> Result<Self> {
        Self::new(name, "", 0, "")
    }

    /// Logical port name (always starts with `/`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Transport port number
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Carrier identifier (empty if unspecified)
    pub fn carrier(&self) -> &str {
        &self.carrier
    }

    /// Copy of this contact with a different carrier
    pub fn with_carrier(&self, carrier: &str) -> Self {
        Self {
            carrier: carrier.to_string(),
            ..self.clone()
        }
    }

    /// Copy of this contact with host and port filled in
    pub fn with_socket(&self, host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..self.clone()
        }
    }

    /// True if host and port are usable for dialing
    pub fn is_routable(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    /// `host:port` string for socket APIs
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.carrier.is_empty() {
            write!(f, "{} ({}:{})", self.name, self.host, self.port)
        } else {
            write!(
                f,
                "{} ({}://{}:{})",
                self.name, self.carrier, self.host, self.port
            )
        }
    }
}

/// Check that a logical port name is well formed.
///
/// Names must start with the `/` separator and contain no whitespace or
/// control characters.
pub fn validate_port_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Name("port name is empty".to_string()));
    }
    if !name.starts_with('/') {
        return Err(Error::Name(format!(
            "port name '{}' must start with '/'",
            name
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::Name(format!(
            "port name '{}' contains whitespace or control characters",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_port_name("/robot/camera").is_ok());
        assert!(validate_port_name("/a").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(validate_port_name("").is_err());
        assert!(validate_port_name("robot").is_err());
        assert!(validate_port_name("/has space").is_err());
    }

    #[test]
    fn test_contact_equality() {
        let a = Contact::new("/x", "10.0.0.1", 7001, "stream").unwrap();
        let b = Contact::new("/x", "10.0.0.1", 7001, "stream").unwrap();
        let c = a.with_carrier("text");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_socket_addr() {
        let a = Contact::new("/x", "127.0.0.1", 9000, "stream").unwrap();
        assert_eq!(a.socket_addr(), "127.0.0.1:9000");
        assert!(a.is_routable());
        assert!(!Contact::by_name("/x").unwrap().is_routable());
    }
}
