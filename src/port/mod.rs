//! Port engine
//!
//! A `Port` is a named, addressable messaging endpoint. It owns the
//! ordered sets of outgoing and incoming connections, dispatches writes
//! and deliveries, and exposes the lifecycle controls: open, interrupt,
//! resume, close.
//!
//! Threading: one acceptor thread takes inbound stream connections, one
//! datagram thread services the lossy carrier, and every accepted
//! stream connection runs its own reader thread. Writes happen on the
//! caller's thread unless a [`WriterBuffer`] in background mode is
//! used.

use crate::admin::{is_admin_command, AdminHandler};
use crate::bundle::{Bundle, ToBundle};
use crate::carrier::{self, DgramFrame, LocalCarrier, POLL_INTERVAL};
use crate::connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, Delivery, Direction, InputUnit,
    OutputUnit,
};
use crate::connection::input_unit::InputSink;
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::monitor::{monitors_from_options, run_pipeline, Monitor, MonitorSide};
use crate::name::{LocalEndpoint, NameRegistry, NameResolver};
use crate::options::CarrierSpec;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

mod reader;
mod writer;

pub use reader::{ReadCallback, ReaderBuffer};
pub use writer::WriterBuffer;

pub(crate) use reader::DeliveryQueue;

/// Shared interrupt/close flags, checked at every blocking edge
pub(crate) struct PortFlags {
    pub interrupted: AtomicBool,
    pub closing: AtomicBool,
}

impl PortFlags {
    fn new() -> Self {
        Self {
            interrupted: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        }
    }

    /// True when blocking operations should bail out
    pub fn is_down(&self) -> bool {
        self.interrupted.load(Ordering::Acquire) || self.closing.load(Ordering::Acquire)
    }
}

/// Where deliveries go: the pull queue or a push-mode callback
enum Consumer {
    Queue(Arc<DeliveryQueue>),
    Callback(Arc<Mutex<Box<ReadCallback>>>),
}

#[derive(Default)]
struct Units {
    outputs: Vec<Arc<OutputUnit>>,
    inputs: Vec<Arc<InputUnit>>,
    /// Same-process incoming connections (no thread, no socket)
    local_inputs: Vec<Contact>,
    /// Datagram senders known to the datagram thread
    dgram_inputs: Vec<(SocketAddr, Contact)>,
}

struct Acceptors {
    accept_thread: Option<JoinHandle<()>>,
    dgram_thread: Option<JoinHandle<()>>,
}

/// Engine state shared between the port handle and its threads
pub(crate) struct PortShared {
    self_weak: Weak<PortShared>,
    contact: Contact,
    flags: Arc<PortFlags>,
    units: Mutex<Units>,
    consumer: Mutex<Consumer>,
    default_queue: Arc<DeliveryQueue>,
    pending_reply: Mutex<Option<crate::connection::Replier>>,
    last_envelope: Mutex<Option<Bundle>>,
    stamp: Mutex<Option<Bundle>>,
    reporters: Mutex<Vec<Box<dyn Fn(&ConnectionEvent) + Send + Sync>>>,
    admin: Mutex<Option<Box<dyn AdminHandler>>>,
    timeout: Mutex<Option<Duration>>,
    callback_lock: Mutex<()>,
    acceptors: Mutex<Option<Acceptors>>,
    next_unit_id: AtomicU64,
}

/// Guard returned by [`Port::lock_callback`]
pub type CallbackGuard<'a> = MutexGuard<'a, ()>;

/// A named messaging endpoint.
///
/// ```no_run
/// use setu::{Bundle, Port};
///
/// # fn main() -> setu::Result<()> {
/// let sender = Port::open("/talker")?;
/// let receiver = Port::open("/listener")?;
/// sender.add_output(&receiver.contact());
///
/// let mut msg = Bundle::new();
/// msg.push_str("hello").push_i32(1);
/// sender.write(&msg);
///
/// let got = receiver.read(false);
/// # let _ = got;
/// # Ok(())
/// # }
/// ```
pub struct Port {
    shared: Arc<PortShared>,
    owned: bool,
}

impl Port {
    /// Open a port on the loopback interface with an ephemeral
    /// transport port
    pub fn open(name: &str) -> Result<Port> {
        Self::open_at(name, "127.0.0.1", 0)
    }

    /// Open a port bound to a specific host and transport port.
    ///
    /// Fails if the name is malformed or already bound in this process.
    pub fn open_at(name: &str, host: &str, port: u16) -> Result<Port> {
        crate::contact::validate_port_name(name)?;

        let listener = TcpListener::bind((host, port))?;
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?;
        let contact = Contact::new(name, host, bound.port(), "stream")?;

        // The datagram carrier shares the port number with the stream
        // listener; losing it only costs dgram reachability.
        let dgram_socket = match UdpSocket::bind((host, bound.port())) {
            Ok(socket) => {
                socket.set_read_timeout(Some(POLL_INTERVAL))?;
                Some(socket)
            }
            Err(e) => {
                log::warn!(
                    "Port {} has no datagram listener ({}); dgram inputs disabled",
                    name,
                    e
                );
                None
            }
        };

        let default_queue = Arc::new(DeliveryQueue::new(true, None));
        let shared = Arc::new_cyclic(|weak| PortShared {
            self_weak: weak.clone(),
            contact: contact.clone(),
            flags: Arc::new(PortFlags::new()),
            units: Mutex::new(Units::default()),
            consumer: Mutex::new(Consumer::Queue(Arc::clone(&default_queue))),
            default_queue,
            pending_reply: Mutex::new(None),
            last_envelope: Mutex::new(None),
            stamp: Mutex::new(None),
            reporters: Mutex::new(Vec::new()),
            admin: Mutex::new(None),
            timeout: Mutex::new(None),
            callback_lock: Mutex::new(()),
            acceptors: Mutex::new(None),
            next_unit_id: AtomicU64::new(1),
        });

        let endpoint: Weak<dyn LocalEndpoint> = shared.self_weak.clone();
        NameRegistry::global().register(&contact, endpoint)?;

        let accept_shared = Arc::clone(&shared);
        let accept_thread = std::thread::Builder::new()
            .name("port-accept".to_string())
            .spawn(move || accept_loop(accept_shared, listener))?;

        let dgram_thread = match dgram_socket {
            Some(socket) => {
                let dgram_shared = Arc::clone(&shared);
                Some(
                    std::thread::Builder::new()
                        .name("port-dgram".to_string())
                        .spawn(move || dgram_loop(dgram_shared, socket))?,
                )
            }
            None => None,
        };

        *shared.acceptors.lock() = Some(Acceptors {
            accept_thread: Some(accept_thread),
            dgram_thread,
        });

        log::info!("Port {} listening on {}", name, bound);
        Ok(Port {
            shared,
            owned: true,
        })
    }

    /// Internal non-owning handle (dropping it does not close the port)
    pub(crate) fn from_shared(shared: Arc<PortShared>) -> Port {
        Port {
            shared,
            owned: false,
        }
    }

    pub(crate) fn shared_handle(&self) -> Arc<PortShared> {
        Arc::clone(&self.shared)
    }

    /// This port's address
    pub fn contact(&self) -> Contact {
        self.shared.contact.clone()
    }

    /// Logical port name
    pub fn name(&self) -> String {
        self.shared.contact.name().to_string()
    }

    /// Negotiate a new outgoing connection.
    ///
    /// The contact's carrier field selects the transport and may carry
    /// `+`-qualifiers (`stream+send.zstd`). Failure is reported through
    /// the return value and the reporter callback, never a panic.
    pub fn add_output(&self, target: &Contact) -> bool {
        self.shared.add_output(target)
    }

    /// Connect by name through the process-local registry
    pub fn add_output_named(&self, name: &str, carrier: &str) -> bool {
        match NameRegistry::global().resolve(name) {
            Some(contact) => self.add_output(&contact.with_carrier(carrier)),
            None => {
                log::info!("Cannot resolve port name '{}'", name);
                false
            }
        }
    }

    /// Send to every established outgoing connection.
    ///
    /// Failures are isolated per connection: one dead peer does not
    /// stop delivery to the others, but it does turn the overall result
    /// false. Returns false immediately when interrupted or closing.
    pub fn write(&self, payload: &impl ToBundle) -> bool {
        self.shared.write_bundle(&payload.to_bundle(), None)
    }

    /// Send with an explicit envelope instead of the port stamp
    pub fn write_with_envelope(&self, payload: &impl ToBundle, envelope: &Bundle) -> bool {
        self.shared
            .write_bundle(&payload.to_bundle(), Some(envelope))
    }

    /// Synchronous request/reply over the first reply-capable outgoing
    /// connection. Fails fast if only one-way carriers are connected.
    pub fn call(&self, payload: &impl ToBundle) -> Result<Bundle> {
        self.shared.call_bundle(&payload.to_bundle())
    }

    /// Block until a message is available; `None` when interrupted,
    /// closed, or timed out.
    ///
    /// `will_reply` promises that exactly one [`reply`] follows before
    /// the next read.
    ///
    /// [`reply`]: Port::reply
    pub fn read(&self, will_reply: bool) -> Option<Bundle> {
        self.shared.read_bundle(will_reply)
    }

    /// Answer the request taken by the last `read(true)`.
    ///
    /// Replying twice, or without a pending request, is a logged no-op
    /// returning false.
    pub fn reply(&self, payload: &impl ToBundle) -> bool {
        self.shared.reply_bundle(payload.to_bundle())
    }

    /// Make blocked and future reads/writes return false immediately.
    /// Connections stay up; [`resume`] undoes it.
    ///
    /// [`resume`]: Port::resume
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }

    /// Leave the interrupted state
    pub fn resume(&self) {
        self.shared.flags.interrupted.store(false, Ordering::Release);
    }

    /// True while the port is interrupted
    pub fn is_interrupted(&self) -> bool {
        self.shared.flags.interrupted.load(Ordering::Acquire)
    }

    /// Tear everything down: interrupt pending operations, close every
    /// connection, release the name. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Register an observer for connection establish/fail/remove events.
    /// Callbacks run synchronously on the thread where the event
    /// happens.
    pub fn add_reporter<F>(&self, reporter: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared.reporters.lock().push(Box::new(reporter));
    }

    /// Drop all registered reporters
    pub fn reset_reporters(&self) {
        self.shared.reporters.lock().clear();
    }

    /// Install the admin side-channel handler; see [`crate::admin`]
    pub fn set_admin_handler(&self, handler: Box<dyn AdminHandler>) {
        *self.shared.admin.lock() = Some(handler);
    }

    /// Bound for blocking reads, writes, and RPC reply waits
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self.shared.timeout.lock() = timeout;
    }

    /// Envelope attached to every subsequent write
    pub fn set_envelope(&self, envelope: &Bundle) {
        *self.shared.stamp.lock() = Some(envelope.clone());
    }

    /// Envelope that accompanied the most recently read message
    pub fn last_envelope(&self) -> Option<Bundle> {
        self.shared.last_envelope.lock().clone()
    }

    /// Number of live incoming connections
    pub fn input_count(&self) -> usize {
        let units = self.shared.units.lock();
        units
            .inputs
            .iter()
            .filter(|u| u.state() == ConnectionState::Established)
            .count()
            + units.local_inputs.len()
            + units.dgram_inputs.len()
    }

    /// Number of live outgoing connections
    pub fn output_count(&self) -> usize {
        self.shared
            .units
            .lock()
            .outputs
            .iter()
            .filter(|u| u.state() == ConnectionState::Established)
            .count()
    }

    /// Peer names of outgoing connections, in connection order
    pub fn output_names(&self) -> Vec<String> {
        self.shared
            .units
            .lock()
            .outputs
            .iter()
            .map(|u| u.peer().name().to_string())
            .collect()
    }

    /// Peer names of incoming connections
    pub fn input_names(&self) -> Vec<String> {
        let units = self.shared.units.lock();
        units
            .inputs
            .iter()
            .map(|u| u.peer().name().to_string())
            .chain(units.local_inputs.iter().map(|c| c.name().to_string()))
            .chain(units.dgram_inputs.iter().map(|(_, c)| c.name().to_string()))
            .collect()
    }

    /// Disconnect one outgoing connection by peer name
    pub fn remove_output(&self, name: &str) -> bool {
        self.shared.remove_output(name)
    }

    /// Disconnect one incoming connection by peer name (asynchronous:
    /// the reader thread winds down on its own)
    pub fn remove_input(&self, name: &str) -> bool {
        let units = self.shared.units.lock();
        match units.inputs.iter().find(|u| u.peer().name() == name) {
            Some(unit) => {
                unit.request_stop();
                true
            }
            None => false,
        }
    }

    /// True while any outgoing connection is still transmitting
    pub fn is_writing(&self) -> bool {
        self.shared
            .units
            .lock()
            .outputs
            .iter()
            .any(|u| u.is_busy())
    }

    /// Messages queued for [`read`](Port::read)
    pub fn pending_reads(&self) -> usize {
        match &*self.shared.consumer.lock() {
            Consumer::Queue(queue) => queue.len(),
            Consumer::Callback(_) => 0,
        }
    }

    /// Serialize push-mode callback delivery against the caller.
    ///
    /// While the returned guard lives, no callback runs, so state the
    /// callback touches can be mutated safely. Keep the critical
    /// section short: input threads block on this lock.
    pub fn lock_callback(&self) -> CallbackGuard<'_> {
        self.shared.callback_lock.lock()
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if self.owned {
            self.close();
        }
    }
}

impl PortShared {
    pub(crate) fn flags(&self) -> &PortFlags {
        &self.flags
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    pub(crate) fn note_envelope(&self, envelope: Option<Bundle>) {
        *self.last_envelope.lock() = envelope;
    }

    fn next_id(&self) -> u64 {
        self.next_unit_id.fetch_add(1, Ordering::Relaxed)
    }

    fn report(&self, event: ConnectionEvent) {
        log::debug!(
            "Port {} connection event: {:?} {:?} {}",
            self.contact.name(),
            event.kind,
            event.direction,
            event.peer.name()
        );
        for reporter in self.reporters.lock().iter() {
            reporter(&event);
        }
    }

    // === Consumer management (ReaderBuffer attach points) ===

    pub(crate) fn install_queue(&self, queue: Arc<DeliveryQueue>) {
        let mut consumer = self.consumer.lock();
        if let Consumer::Queue(old) = &*consumer {
            old.clear();
        }
        *consumer = Consumer::Queue(queue);
    }

    pub(crate) fn install_callback(&self, callback: Box<ReadCallback>) {
        let mut consumer = self.consumer.lock();
        if let Consumer::Queue(old) = &*consumer {
            old.clear();
        }
        *consumer = Consumer::Callback(Arc::new(Mutex::new(callback)));
    }

    pub(crate) fn reset_consumer(&self) {
        let mut consumer = self.consumer.lock();
        self.default_queue.clear();
        *consumer = Consumer::Queue(Arc::clone(&self.default_queue));
    }

    fn consumer_queue(&self) -> Option<Arc<DeliveryQueue>> {
        match &*self.consumer.lock() {
            Consumer::Queue(queue) => Some(Arc::clone(queue)),
            Consumer::Callback(_) => None,
        }
    }

    // === Core operations ===

    pub(crate) fn write_bundle(&self, bundle: &Bundle, envelope: Option<&Bundle>) -> bool {
        if self.flags.is_down() {
            return false;
        }
        let outputs: Vec<Arc<OutputUnit>> = self.units.lock().outputs.clone();
        let stamp = self.stamp.lock().clone();
        let envelope = envelope.cloned().or(stamp);
        let deadline = self.read_timeout();

        let mut all_ok = true;
        let mut any_failed = false;
        for unit in outputs
            .iter()
            .filter(|u| u.state() == ConnectionState::Established)
        {
            match unit.send(bundle, envelope.as_ref(), deadline) {
                Ok(()) => {}
                Err(Error::Interrupted) => return false,
                Err(Error::Closed) if self.flags.closing.load(Ordering::Acquire) => {
                    return false;
                }
                Err(e) => {
                    all_ok = false;
                    if unit.state() == ConnectionState::Closed {
                        any_failed = true;
                        log::info!(
                            "Output connection to {} failed: {}",
                            unit.peer().name(),
                            e
                        );
                        self.report(ConnectionEvent {
                            direction: Direction::Outgoing,
                            peer: unit.peer().clone(),
                            carrier: unit.carrier_name().to_string(),
                            kind: ConnectionEventKind::Failed,
                        });
                    } else {
                        log::warn!("Write to {} failed: {}", unit.peer().name(), e);
                    }
                }
            }
        }
        if any_failed {
            self.prune_outputs();
        }
        all_ok && !self.flags.is_down()
    }

    fn call_bundle(&self, bundle: &Bundle) -> Result<Bundle> {
        if self.flags.closing.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if self.flags.interrupted.load(Ordering::Acquire) {
            return Err(Error::Interrupted);
        }
        let unit = {
            let units = self.units.lock();
            units
                .outputs
                .iter()
                .find(|u| u.state() == ConnectionState::Established && u.supports_reply())
                .cloned()
        };
        let unit = unit.ok_or_else(|| {
            Error::Negotiation("no reply-capable outgoing connection".to_string())
        })?;
        let stamp = self.stamp.lock().clone();
        let deadline = self.read_timeout();
        let result = unit.send_with_reply(bundle, stamp.as_ref(), deadline);
        if unit.state() == ConnectionState::Closed {
            self.report(ConnectionEvent {
                direction: Direction::Outgoing,
                peer: unit.peer().clone(),
                carrier: unit.carrier_name().to_string(),
                kind: ConnectionEventKind::Failed,
            });
            self.prune_outputs();
        }
        result
    }

    fn read_bundle(&self, will_reply: bool) -> Option<Bundle> {
        let queue = match self.consumer_queue() {
            Some(queue) => queue,
            None => {
                log::warn!("read() while a callback consumer is installed");
                return None;
            }
        };
        let delivery = queue.pop(self.read_timeout(), &self.flags)?;
        self.note_envelope(delivery.envelope.clone());
        let mut pending = self.pending_reply.lock();
        if will_reply {
            *pending = delivery.replier;
        } else {
            // Dropping an unused replier resolves the sender's wait
            *pending = None;
        }
        Some(delivery.bundle)
    }

    fn reply_bundle(&self, bundle: Bundle) -> bool {
        match self.pending_reply.lock().take() {
            Some(replier) => replier.send(bundle),
            None => {
                log::warn!(
                    "reply() on port {} without a pending request",
                    self.contact.name()
                );
                false
            }
        }
    }

    fn interrupt(&self) {
        self.flags.interrupted.store(true, Ordering::Release);
        self.default_queue.wake_all();
        if let Some(queue) = self.consumer_queue() {
            queue.wake_all();
        }
    }

    fn close(&self) {
        if self.flags.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Closing port {}", self.contact.name());

        // Interrupt pending operations first
        self.default_queue.shut();
        if let Some(queue) = self.consumer_queue() {
            queue.shut();
        }

        // Stop accepting new connections
        let acceptors = self.acceptors.lock().take();
        if let Some(mut acceptors) = acceptors {
            if let Some(handle) = acceptors.accept_thread.take() {
                let _ = handle.join();
            }
            if let Some(handle) = acceptors.dgram_thread.take() {
                let _ = handle.join();
            }
        }

        // Then tear down every connection
        let (outputs, inputs) = {
            let mut units = self.units.lock();
            units.local_inputs.clear();
            units.dgram_inputs.clear();
            (
                std::mem::take(&mut units.outputs),
                std::mem::take(&mut units.inputs),
            )
        };
        for unit in &outputs {
            unit.close();
            self.report(ConnectionEvent {
                direction: Direction::Outgoing,
                peer: unit.peer().clone(),
                carrier: unit.carrier_name().to_string(),
                kind: ConnectionEventKind::Removed,
            });
        }
        for unit in &inputs {
            unit.close();
            self.report(ConnectionEvent {
                direction: Direction::Incoming,
                peer: unit.peer().clone(),
                carrier: unit.carrier_name().to_string(),
                kind: ConnectionEventKind::Removed,
            });
        }

        NameRegistry::global().unregister(self.contact.name());
    }

    fn prune_outputs(&self) {
        self.units
            .lock()
            .outputs
            .retain(|u| u.state() != ConnectionState::Closed);
    }

    fn remove_output(&self, name: &str) -> bool {
        let unit = {
            let mut units = self.units.lock();
            match units.outputs.iter().position(|u| u.peer().name() == name) {
                Some(index) => Some(units.outputs.remove(index)),
                None => None,
            }
        };
        match unit {
            Some(unit) => {
                unit.close();
                self.report(ConnectionEvent {
                    direction: Direction::Outgoing,
                    peer: unit.peer().clone(),
                    carrier: unit.carrier_name().to_string(),
                    kind: ConnectionEventKind::Removed,
                });
                true
            }
            None => false,
        }
    }

    fn add_output(&self, target: &Contact) -> bool {
        if self.flags.closing.load(Ordering::Acquire) {
            return false;
        }
        match self.try_add_output(target) {
            Ok(peer_and_carrier) => {
                let (peer, carrier_name) = peer_and_carrier;
                self.report(ConnectionEvent {
                    direction: Direction::Outgoing,
                    peer,
                    carrier: carrier_name,
                    kind: ConnectionEventKind::Established,
                });
                true
            }
            Err(e) => {
                log::info!(
                    "Port {} cannot connect to {}: {}",
                    self.contact.name(),
                    target.name(),
                    e
                );
                self.report(ConnectionEvent {
                    direction: Direction::Outgoing,
                    peer: target.clone(),
                    carrier: target.carrier().to_string(),
                    kind: ConnectionEventKind::Failed,
                });
                false
            }
        }
    }

    fn try_add_output(&self, target: &Contact) -> Result<(Contact, String)> {
        let carrier_field = if target.carrier().is_empty() {
            "stream"
        } else {
            target.carrier()
        };
        let spec = CarrierSpec::parse(carrier_field)?;
        let monitors = monitors_from_options(&spec.options, MonitorSide::Send)?;
        let deadline = self.read_timeout();

        // Fill in host/port from the registry when the contact only
        // carries a name.
        let resolved = if target.is_routable() || spec.base == "local" {
            target.clone()
        } else {
            NameRegistry::global()
                .resolve(target.name())
                .ok_or_else(|| {
                    Error::Name(format!("cannot resolve port name '{}'", target.name()))
                })?
        };

        let mut carrier: Box<dyn crate::carrier::Carrier> = if spec.base == "local" {
            Box::new(LocalCarrier::connect(&resolved)?)
        } else {
            carrier::initiate(&spec, &resolved, deadline)?
        };

        carrier.send_header(&self.contact, &spec.options)?;
        carrier.expect_reply_to_header()?;
        log::debug!(
            "Port {} negotiated {} to {} ({} framing)",
            self.contact.name(),
            carrier.name(),
            target.name(),
            if carrier.is_text_mode() { "text" } else { "binary" }
        );

        let peer = resolved.with_carrier(&spec.base);
        let carrier_name = carrier.name().to_string();
        let unit = Arc::new(OutputUnit::establish(
            self.next_id(),
            carrier,
            peer.clone(),
            monitors,
            Arc::clone(&self.flags),
        ));
        self.units.lock().outputs.push(unit);
        Ok((peer, carrier_name))
    }

    /// Run the admin side-channel over a decoded frame; `Some` is the
    /// admin reply and means the application reader must not see it.
    fn admin_filter(&self, bundle: &Bundle) -> Option<Bundle> {
        if !is_admin_command(bundle) {
            return None;
        }
        let mut admin = self.admin.lock();
        let handler = admin.as_mut()?;
        let port = Port::from_shared(self.self_weak.upgrade()?);
        Some(handler.handle(bundle, &port))
    }
}

impl InputSink for PortShared {
    fn sink_closing(&self) -> bool {
        self.flags.closing.load(Ordering::Acquire)
    }

    fn sink_deliver(&self, delivery: Delivery) -> bool {
        if self.flags.is_down() {
            return false;
        }
        let consumer = {
            let consumer = self.consumer.lock();
            match &*consumer {
                Consumer::Queue(queue) => Ok(Arc::clone(queue)),
                Consumer::Callback(cb) => Err(Arc::clone(cb)),
            }
        };
        match consumer {
            Ok(queue) => queue.push(delivery, &self.flags),
            Err(callback) => {
                let _serialized = self.callback_lock.lock();
                if self.flags.is_down() {
                    return false;
                }
                self.note_envelope(delivery.envelope.clone());
                (callback.lock())(delivery.bundle, delivery.envelope, &delivery.from);
                true
            }
        }
    }

    fn sink_admin(&self, bundle: &Bundle, _from: &Contact) -> Option<Bundle> {
        self.admin_filter(bundle)
    }

    fn sink_reply_timeout(&self) -> Option<Duration> {
        self.read_timeout()
    }

    fn sink_input_gone(&self, unit_id: u64, failed: bool) {
        let unit = {
            let mut units = self.units.lock();
            match units.inputs.iter().position(|u| u.id() == unit_id) {
                Some(index) => Some(units.inputs.remove(index)),
                None => None,
            }
        };
        if let Some(unit) = unit {
            self.report(ConnectionEvent {
                direction: Direction::Incoming,
                peer: unit.peer().clone(),
                carrier: unit.carrier_name().to_string(),
                kind: if failed {
                    ConnectionEventKind::Failed
                } else {
                    ConnectionEventKind::Removed
                },
            });
        }
    }
}

impl LocalEndpoint for PortShared {
    fn attach_local(&self, from: &Contact) -> bool {
        if self.flags.closing.load(Ordering::Acquire) {
            return false;
        }
        self.units.lock().local_inputs.push(from.clone());
        self.report(ConnectionEvent {
            direction: Direction::Incoming,
            peer: from.clone(),
            carrier: "local".to_string(),
            kind: ConnectionEventKind::Established,
        });
        true
    }

    fn deliver_local(&self, delivery: Delivery) -> bool {
        // The admin side-channel applies to same-process traffic too
        if let Some(reply) = self.admin_filter(&delivery.bundle) {
            if let Some(replier) = delivery.replier {
                replier.send(reply);
            }
            return true;
        }
        self.sink_deliver(delivery)
    }

    fn detach_local(&self, from: &Contact) {
        let removed = {
            let mut units = self.units.lock();
            match units.local_inputs.iter().position(|c| c == from) {
                Some(index) => {
                    units.local_inputs.remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.report(ConnectionEvent {
                direction: Direction::Incoming,
                peer: from.clone(),
                carrier: "local".to_string(),
                kind: ConnectionEventKind::Removed,
            });
        }
    }
}

/// Acceptor thread: non-blocking accept with a poll/sleep loop so the
/// closing flag is honored promptly
fn accept_loop(shared: Arc<PortShared>, listener: TcpListener) {
    log::debug!("Accept thread for {} started", shared.contact.name());
    loop {
        if shared.flags.closing.load(Ordering::Acquire) {
            break;
        }
        match listener.accept() {
            Ok((socket, addr)) => {
                if let Err(e) = negotiate_inbound(&shared, socket, addr) {
                    log::debug!("Inbound negotiation from {} failed: {}", addr, e);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                log::error!("Accept error on {}: {}", shared.contact.name(), e);
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
    log::debug!("Accept thread for {} exiting", shared.contact.name());
}

fn negotiate_inbound(
    shared: &Arc<PortShared>,
    socket: std::net::TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    // The listener is non-blocking; accepted sockets must not be
    socket.set_nonblocking(false)?;
    let _ = socket.set_nodelay(true);
    let mut carrier = carrier::accept_stream(socket)?;
    let (name, options) = carrier.expect_sender()?;

    let peer = match Contact::new(&name, &addr.ip().to_string(), addr.port(), carrier.name()) {
        Ok(peer) => peer,
        Err(e) => {
            carrier.respond_to_header(false)?;
            return Err(e);
        }
    };
    let monitors = match monitors_from_options(&options, MonitorSide::Receive) {
        Ok(monitors) => monitors,
        Err(e) => {
            carrier.respond_to_header(false)?;
            return Err(e);
        }
    };
    if shared.flags.closing.load(Ordering::Acquire) {
        carrier.respond_to_header(false)?;
        return Err(Error::Closed);
    }
    carrier.respond_to_header(true)?;

    let sink: Arc<dyn InputSink> = Arc::clone(shared) as Arc<dyn InputSink>;
    let unit = InputUnit::spawn(shared.next_id(), sink, carrier, peer.clone(), monitors)?;
    let carrier_name = unit.carrier_name().to_string();
    shared.units.lock().inputs.push(unit);
    shared.report(ConnectionEvent {
        direction: Direction::Incoming,
        peer,
        carrier: carrier_name,
        kind: ConnectionEventKind::Established,
    });
    Ok(())
}

struct DgramPeer {
    contact: Contact,
    monitors: Vec<Box<dyn Monitor>>,
}

/// Datagram thread: services the lossy carrier for the whole port.
/// Peers announce themselves with a hello datagram; anything malformed
/// is dropped without ceremony.
fn dgram_loop(shared: Arc<PortShared>, socket: UdpSocket) {
    log::debug!("Datagram thread for {} started", shared.contact.name());
    let mut peers: HashMap<SocketAddr, DgramPeer> = HashMap::new();
    let mut buf = vec![0u8; 65536];

    loop {
        if shared.flags.closing.load(Ordering::Acquire) {
            break;
        }
        let (len, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e) if carrier::is_timeout(e) => continue,
            Err(e) => {
                // Transient (e.g. ICMP-induced) errors are routine on UDP
                log::debug!("Datagram receive error: {}", e);
                continue;
            }
        };

        match DgramFrame::decode(&buf[..len]) {
            Some(DgramFrame::Hello(name, options)) => {
                if peers.contains_key(&addr) {
                    continue;
                }
                let contact =
                    match Contact::new(&name, &addr.ip().to_string(), addr.port(), "dgram") {
                        Ok(contact) => contact,
                        Err(_) => {
                            log::debug!("Ignoring hello with bad name '{}'", name);
                            continue;
                        }
                    };
                let monitors = match monitors_from_options(&options, MonitorSide::Receive) {
                    Ok(monitors) => monitors,
                    Err(e) => {
                        log::warn!("Ignoring hello from {}: {}", addr, e);
                        continue;
                    }
                };
                shared
                    .units
                    .lock()
                    .dgram_inputs
                    .push((addr, contact.clone()));
                shared.report(ConnectionEvent {
                    direction: Direction::Incoming,
                    peer: contact.clone(),
                    carrier: "dgram".to_string(),
                    kind: ConnectionEventKind::Established,
                });
                peers.insert(addr, DgramPeer { contact, monitors });
            }
            Some(DgramFrame::Data(msg)) => {
                let peer = match peers.get_mut(&addr) {
                    Some(peer) => peer,
                    None => {
                        log::debug!("Datagram from unannounced sender {}", addr);
                        continue;
                    }
                };
                let bundle = match run_pipeline(&mut peer.monitors, msg.bundle) {
                    Ok(Some(bundle)) => bundle,
                    Ok(None) => continue,
                    Err(e) => {
                        log::debug!("Datagram transform failed: {}", e);
                        continue;
                    }
                };
                // Admin frames are inspected here too; with no reply
                // channel the reply is simply discarded.
                if shared.admin_filter(&bundle).is_some() {
                    continue;
                }
                shared.sink_deliver(Delivery {
                    bundle,
                    envelope: msg.envelope,
                    from: peer.contact.clone(),
                    replier: None,
                });
            }
            Some(DgramFrame::Bye) => {
                if let Some(mut peer) = peers.remove(&addr) {
                    for monitor in peer.monitors.iter_mut() {
                        monitor.destroy();
                    }
                    {
                        let mut units = shared.units.lock();
                        units.dgram_inputs.retain(|(a, _)| *a != addr);
                    }
                    shared.report(ConnectionEvent {
                        direction: Direction::Incoming,
                        peer: peer.contact.clone(),
                        carrier: "dgram".to_string(),
                        kind: ConnectionEventKind::Removed,
                    });
                }
            }
            None => {
                log::debug!("Dropping malformed datagram from {}", addr);
            }
        }
    }

    for peer in peers.values_mut() {
        for monitor in peer.monitors.iter_mut() {
            monitor.destroy();
        }
    }
    log::debug!("Datagram thread for {} exiting", shared.contact.name());
}
