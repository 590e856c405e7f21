//! Connection layer
//!
//! A connection is one negotiated, directional binding between two
//! ports, built on a carrier. Incoming connections each own a
//! background reader thread ([`input_unit`]); outgoing connections are
//! written to on the caller's thread, or from a dedicated writer thread
//! in background mode ([`output_unit`]).

use crate::bundle::Bundle;
use crate::contact::Contact;

pub(crate) mod input_unit;
pub(crate) mod output_unit;

pub(crate) use input_unit::InputUnit;
pub(crate) use output_unit::OutputUnit;

/// Lifecycle of one connection; transitions are forward-only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Negotiating,
    Established,
    Draining,
    Closed,
}

/// Which side of the port a connection is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// What happened to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    /// Negotiation completed; the connection carries traffic now
    Established,
    /// Negotiation or mid-stream failure
    Failed,
    /// Orderly disconnect
    Removed,
}

/// Reporter callback payload for connection lifecycle events
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub direction: Direction,
    pub peer: Contact,
    pub carrier: String,
    pub kind: ConnectionEventKind,
}

/// One-shot reply channel for a request that wants an answer.
///
/// Dropping an unused replier unblocks the waiting input thread, which
/// then sends an empty reply so the remote caller is never left
/// hanging.
pub(crate) struct Replier {
    tx: crossbeam_channel::Sender<Bundle>,
}

impl Replier {
    pub fn channel() -> (Replier, crossbeam_channel::Receiver<Bundle>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (Replier { tx }, rx)
    }

    /// Consume the replier, handing the reply to the waiting thread
    pub fn send(self, bundle: Bundle) -> bool {
        self.tx.send(bundle).is_ok()
    }
}

/// A decoded message on its way to the port's consumer
pub(crate) struct Delivery {
    pub bundle: Bundle,
    pub envelope: Option<Bundle>,
    pub from: Contact,
    pub replier: Option<Replier>,
}
