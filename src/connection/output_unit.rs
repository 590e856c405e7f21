//! Outgoing connection unit
//!
//! One `OutputUnit` per negotiated outgoing connection. Writes run on
//! the calling thread and hold the unit's carrier lock for the whole
//! frame exchange, which is also what serializes RPC: at most one
//! request/reply can be in flight per connection.

use super::ConnectionState;
use crate::bundle::Bundle;
use crate::carrier::{Carrier, Kicker, Message};
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::monitor::{run_pipeline, Monitor};
use crate::port::PortFlags;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) struct OutputUnit {
    id: u64,
    peer: Contact,
    carrier_name: &'static str,
    supports_reply: bool,
    requires_ack: bool,
    carrier: Mutex<Box<dyn Carrier>>,
    kick: Kicker,
    state: Mutex<ConnectionState>,
    busy: AtomicBool,
    monitors: Mutex<Vec<Box<dyn Monitor>>>,
    flags: Arc<PortFlags>,
    /// Replies abandoned by timed-out RPC calls, still on the wire
    stale_replies: AtomicU32,
    /// Frame acknowledgments abandoned by timed-out waits
    stale_acks: AtomicU32,
}

/// Clears the busy flag on every exit path
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OutputUnit {
    /// Wrap a freshly negotiated carrier as an established connection
    pub fn establish(
        id: u64,
        carrier: Box<dyn Carrier>,
        peer: Contact,
        monitors: Vec<Box<dyn Monitor>>,
        flags: Arc<PortFlags>,
    ) -> Self {
        Self {
            id,
            peer,
            carrier_name: carrier.name(),
            supports_reply: carrier.supports_reply(),
            requires_ack: carrier.requires_ack(),
            kick: carrier.kicker(),
            carrier: Mutex::new(carrier),
            state: Mutex::new(ConnectionState::Established),
            busy: AtomicBool::new(false),
            monitors: Mutex::new(monitors),
            flags,
            stale_replies: AtomicU32::new(0),
            stale_acks: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &Contact {
        &self.peer
    }

    pub fn carrier_name(&self) -> &'static str {
        self.carrier_name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn supports_reply(&self) -> bool {
        self.supports_reply
    }

    fn mark_closed(&self) {
        let mut state = self.state.lock();
        if *state != ConnectionState::Closed {
            *state = ConnectionState::Closed;
        }
    }

    fn transform(&self, bundle: &Bundle) -> Result<Option<Bundle>> {
        let mut monitors = self.monitors.lock();
        if monitors.is_empty() {
            return Ok(Some(bundle.clone()));
        }
        run_pipeline(&mut monitors, bundle.clone())
    }

    /// Wait for the frame acknowledgment, staying responsive to
    /// interrupt, close and the optional deadline. Callers record an
    /// abandoned wait in `stale_acks` so [`settle`] can consume the
    /// late byte before the next exchange.
    ///
    /// [`settle`]: OutputUnit::settle
    fn await_ack(&self, carrier: &mut Box<dyn Carrier>, deadline: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.flags.closing.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            if self.flags.interrupted.load(Ordering::Acquire) {
                return Err(Error::Interrupted);
            }
            if let Some(d) = deadline {
                if start.elapsed() > d {
                    return Err(Error::Timeout);
                }
            }
            match carrier.expect_ack() {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Send one message; no reply expected.
    ///
    /// A monitor veto drops the frame for this connection and is not a
    /// failure. Transport errors close the connection and propagate.
    pub fn send(
        &self,
        bundle: &Bundle,
        envelope: Option<&Bundle>,
        deadline: Option<Duration>,
    ) -> Result<()> {
        if self.state() != ConnectionState::Established {
            return Err(Error::Closed);
        }
        self.busy.store(true, Ordering::Release);
        let _busy = BusyGuard(&self.busy);

        let payload = match self.transform(bundle)? {
            Some(p) => p,
            None => return Ok(()),
        };
        let msg = Message {
            bundle: payload,
            envelope: envelope.cloned(),
            expects_reply: false,
        };

        let mut carrier = self.carrier.lock();
        self.settle(&mut carrier, deadline)?;
        if let Err(e) = carrier.write_message(&msg) {
            self.mark_closed();
            return Err(e);
        }
        if self.requires_ack {
            match self.await_ack(&mut carrier, deadline) {
                Ok(()) => {}
                Err(e @ (Error::Interrupted | Error::Timeout)) => {
                    self.stale_acks.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
                Err(e @ Error::Closed) => return Err(e),
                Err(e) => {
                    self.mark_closed();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Send one message and block for exactly one reply.
    ///
    /// Fails fast on one-way carriers. On timeout the connection stays
    /// usable: the late reply is recorded as stale and drained before
    /// the next call.
    pub fn send_with_reply(
        &self,
        bundle: &Bundle,
        envelope: Option<&Bundle>,
        deadline: Option<Duration>,
    ) -> Result<Bundle> {
        if !self.supports_reply {
            return Err(Error::Negotiation(format!(
                "carrier '{}' is one-way and cannot carry replies",
                self.carrier_name
            )));
        }
        if self.state() != ConnectionState::Established {
            return Err(Error::Closed);
        }
        self.busy.store(true, Ordering::Release);
        let _busy = BusyGuard(&self.busy);

        let payload = self
            .transform(bundle)?
            .ok_or_else(|| Error::Protocol("request vetoed by monitor".to_string()))?;
        let msg = Message {
            bundle: payload,
            envelope: envelope.cloned(),
            expects_reply: true,
        };

        let mut carrier = self.carrier.lock();
        self.settle(&mut carrier, deadline)?;

        if let Err(e) = carrier.write_message(&msg) {
            self.mark_closed();
            return Err(e);
        }

        let start = Instant::now();
        let reply = loop {
            if self.flags.closing.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            if self.flags.interrupted.load(Ordering::Acquire) {
                self.stale_replies.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Interrupted);
            }
            if let Some(d) = deadline {
                if start.elapsed() > d {
                    self.stale_replies.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::Timeout);
                }
            }
            match carrier.read_message() {
                Ok(Some(reply)) => break reply,
                Ok(None) => continue,
                Err(e) => {
                    self.mark_closed();
                    return Err(e);
                }
            }
        };

        if self.requires_ack {
            match self.await_ack(&mut carrier, None) {
                Ok(()) => {}
                Err(e @ Error::Interrupted) => {
                    self.stale_acks.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
                Err(e @ Error::Closed) => return Err(e),
                Err(e) => {
                    self.mark_closed();
                    return Err(e);
                }
            }
        }
        Ok(reply.bundle)
    }

    /// Consume wire traffic abandoned by timed-out or interrupted
    /// exchanges, so a stale reply is never mistaken for the next
    /// call's answer and a stale ack byte never desynchronizes the
    /// framing. Bounded by the caller's deadline; on timeout the debt
    /// is kept for the next attempt.
    fn settle(&self, carrier: &mut Box<dyn Carrier>, deadline: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        while self.stale_replies.load(Ordering::Relaxed) > 0 {
            if self.flags.closing.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            if self.flags.interrupted.load(Ordering::Acquire) {
                return Err(Error::Interrupted);
            }
            if let Some(d) = deadline {
                if start.elapsed() > d {
                    return Err(Error::Timeout);
                }
            }
            match carrier.read_message() {
                Ok(Some(_)) => {
                    // The reply's own ack follows it on the wire
                    self.stale_replies.fetch_sub(1, Ordering::Relaxed);
                    if self.requires_ack {
                        self.stale_acks.fetch_add(1, Ordering::Relaxed);
                    }
                    log::debug!("Discarded stale reply from {}", self.peer.name());
                }
                Ok(None) => continue,
                Err(e) => {
                    self.mark_closed();
                    return Err(e);
                }
            }
        }
        while self.stale_acks.load(Ordering::Relaxed) > 0 {
            if self.flags.closing.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            if self.flags.interrupted.load(Ordering::Acquire) {
                return Err(Error::Interrupted);
            }
            if let Some(d) = deadline {
                if start.elapsed() > d {
                    return Err(Error::Timeout);
                }
            }
            match carrier.expect_ack() {
                Ok(true) => {
                    self.stale_acks.fetch_sub(1, Ordering::Relaxed);
                }
                Ok(false) => continue,
                Err(e) => {
                    self.mark_closed();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Best-effort unblock of any thread stuck in this unit's carrier
    pub fn kick(&self) {
        (self.kick)();
    }

    /// Tear the connection down and release monitor state
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Draining;
        }
        self.kick();
        {
            let mut carrier = self.carrier.lock();
            carrier.close();
        }
        for monitor in self.monitors.lock().iter_mut() {
            monitor.destroy();
        }
        self.mark_closed();
    }
}
