//! Process-local name registry
//!
//! Ports register themselves here at `open` and are looked up by logical
//! name for `add_output` and for same-process delivery over the `local`
//! carrier. A network-wide registry service is an external collaborator;
//! this module is the seam it plugs into via [`NameResolver`].

use crate::connection::Delivery;
use crate::contact::Contact;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{OnceLock, Weak};

/// Maps logical port names to contacts
pub trait NameResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Contact>;
}

/// Hooks a port exposes for same-process delivery.
///
/// The `local` carrier talks to the target port through this trait so
/// that neither side touches the other's internals.
pub(crate) trait LocalEndpoint: Send + Sync {
    /// Register an incoming same-process connection; false if the port
    /// is closing and cannot accept it.
    fn attach_local(&self, from: &Contact) -> bool;
    /// Hand a decoded message to the port's consumer.
    fn deliver_local(&self, delivery: Delivery) -> bool;
    /// Drop a previously attached same-process connection.
    fn detach_local(&self, from: &Contact);
}

struct Entry {
    contact: Contact,
    endpoint: Weak<dyn LocalEndpoint>,
}

/// Name table shared by every port in the process
#[derive(Default)]
pub struct NameRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

static GLOBAL: OnceLock<NameRegistry> = OnceLock::new();

impl NameRegistry {
    /// The process-wide registry instance
    pub fn global() -> &'static NameRegistry {
        GLOBAL.get_or_init(NameRegistry::default)
    }

    pub(crate) fn register(
        &self,
        contact: &Contact,
        endpoint: Weak<dyn LocalEndpoint>,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(contact.name()) {
            // A dead weak pointer means the previous owner leaked its
            // registration; reclaim the name.
            if existing.endpoint.strong_count() > 0 {
                return Err(Error::Name(format!(
                    "port name '{}' is already bound",
                    contact.name()
                )));
            }
        }
        entries.insert(
            contact.name().to_string(),
            Entry {
                contact: contact.clone(),
                endpoint,
            },
        );
        log::debug!("Registered port name {}", contact.name());
        Ok(())
    }

    pub(crate) fn unregister(&self, name: &str) {
        if self.entries.lock().remove(name).is_some() {
            log::debug!("Unregistered port name {}", name);
        }
    }

    pub(crate) fn endpoint(&self, name: &str) -> Option<std::sync::Arc<dyn LocalEndpoint>> {
        self.entries.lock().get(name)?.endpoint.upgrade()
    }
}

impl NameResolver for NameRegistry {
    fn resolve(&self, name: &str) -> Option<Contact> {
        self.entries.lock().get(name).map(|e| e.contact.clone())
    }
}
