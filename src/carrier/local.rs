//! Same-process carrier
//!
//! Connects two ports living in the same process through the name
//! registry, skipping sockets and serialization entirely. Bundles are
//! cloned across, and replies travel back on a one-shot channel.

use super::{Carrier, Message, POLL_INTERVAL};
use crate::connection::{Delivery, Replier};
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::name::{LocalEndpoint, NameRegistry};
use crate::options::Options;
use std::sync::{Arc, Weak};

pub(crate) struct LocalCarrier {
    from: Option<Contact>,
    peer: Contact,
    target: Weak<dyn LocalEndpoint>,
    pending_reply: Option<crossbeam_channel::Receiver<crate::bundle::Bundle>>,
}

impl LocalCarrier {
    /// Resolve the target port in this process
    pub fn connect(peer: &Contact) -> Result<Self> {
        let target = NameRegistry::global()
            .endpoint(peer.name())
            .ok_or_else(|| {
                Error::Negotiation(format!(
                    "no port named '{}' in this process",
                    peer.name()
                ))
            })?;
        Ok(Self {
            from: None,
            peer: peer.clone(),
            target: Arc::downgrade(&target),
            pending_reply: None,
        })
    }

    fn endpoint(&self) -> Result<Arc<dyn LocalEndpoint>> {
        self.target.upgrade().ok_or(Error::Closed)
    }
}

impl Carrier for LocalCarrier {
    fn name(&self) -> &'static str {
        "local"
    }

    fn send_header(&mut self, from: &Contact, _options: &Options) -> Result<()> {
        self.from = Some(from.clone());
        Ok(())
    }

    fn expect_reply_to_header(&mut self) -> Result<()> {
        let from = self
            .from
            .clone()
            .ok_or_else(|| Error::Negotiation("local header not sent".to_string()))?;
        if self.endpoint()?.attach_local(&from) {
            Ok(())
        } else {
            Err(Error::Negotiation(format!(
                "port '{}' refused the connection",
                self.peer.name()
            )))
        }
    }

    fn expect_sender(&mut self) -> Result<(String, Options)> {
        Err(Error::Protocol(
            "local connections are attached directly, not accepted".to_string(),
        ))
    }

    fn respond_to_header(&mut self, _accept: bool) -> Result<()> {
        Ok(())
    }

    fn write_message(&mut self, msg: &Message) -> Result<()> {
        let endpoint = self.endpoint()?;
        let from = self.from.clone().ok_or(Error::Closed)?;
        let replier = if msg.expects_reply {
            let (replier, rx) = Replier::channel();
            self.pending_reply = Some(rx);
            Some(replier)
        } else {
            None
        };
        let accepted = endpoint.deliver_local(Delivery {
            bundle: msg.bundle.clone(),
            envelope: msg.envelope.clone(),
            from,
            replier,
        });
        if !accepted {
            // Receiver is interrupted or shutting down; the message is
            // dropped, and any pending reply resolves empty.
            log::debug!("Local delivery to {} not accepted", self.peer.name());
        }
        Ok(())
    }

    fn read_message(&mut self) -> Result<Option<Message>> {
        let rx = self
            .pending_reply
            .as_ref()
            .ok_or_else(|| Error::Misuse("no local reply pending".to_string()))?;
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(bundle) => {
                self.pending_reply = None;
                Ok(Some(Message::data(bundle, None)))
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                self.pending_reply = None;
                // Receiver dropped the request without replying
                Ok(Some(Message::data(crate::bundle::Bundle::new(), None)))
            }
        }
    }

    fn send_ack(&mut self) -> Result<()> {
        Ok(())
    }

    fn expect_ack(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn close(&mut self) {
        if let (Some(from), Some(endpoint)) = (self.from.as_ref(), self.target.upgrade()) {
            endpoint.detach_local(from);
        }
    }
}
