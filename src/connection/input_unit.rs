//! Incoming connection unit
//!
//! Every accepted connection gets one background thread that blocks on
//! the carrier, decodes frames, runs receive-side monitors, routes
//! admin traffic, and hands the rest to the port's consumer. The thread
//! polls shutdown flags between read timeouts, so close and interrupt
//! never leave it hanging.

use super::{ConnectionState, Delivery, Replier};
use crate::bundle::Bundle;
use crate::carrier::{Carrier, Kicker, Message};
use crate::contact::Contact;
use crate::monitor::{run_pipeline, Monitor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// What an input thread needs from its owning port.
///
/// The port implements this; keeping the surface narrow means input
/// threads cannot reach engine state they have no business touching.
pub(crate) trait InputSink: Send + Sync {
    fn sink_closing(&self) -> bool;
    /// Hand a decoded message to the consumer; false if the port is
    /// interrupted or shutting down and dropped it.
    fn sink_deliver(&self, delivery: Delivery) -> bool;
    /// Give the admin side-channel first refusal on a frame. `Some` is
    /// the admin reply and means the application reader never sees it.
    fn sink_admin(&self, bundle: &Bundle, from: &Contact) -> Option<Bundle>;
    /// How long to wait for an application reply before giving up
    fn sink_reply_timeout(&self) -> Option<Duration>;
    /// The unit's thread is exiting; `failed` distinguishes a protocol
    /// or transport fault from an orderly disconnect.
    fn sink_input_gone(&self, unit_id: u64, failed: bool);
}

pub(crate) struct InputUnit {
    id: u64,
    peer: Contact,
    carrier_name: &'static str,
    state: Mutex<ConnectionState>,
    stop: Arc<AtomicBool>,
    kick: Kicker,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl InputUnit {
    /// Take ownership of a negotiated carrier and start its reader
    /// thread.
    pub fn spawn(
        id: u64,
        sink: Arc<dyn InputSink>,
        carrier: Box<dyn Carrier>,
        peer: Contact,
        monitors: Vec<Box<dyn Monitor>>,
    ) -> std::io::Result<Arc<InputUnit>> {
        let stop = Arc::new(AtomicBool::new(false));
        let unit = Arc::new(InputUnit {
            id,
            peer: peer.clone(),
            carrier_name: carrier.name(),
            state: Mutex::new(ConnectionState::Established),
            stop: Arc::clone(&stop),
            kick: carrier.kicker(),
            thread: Mutex::new(None),
        });

        let thread_unit = Arc::clone(&unit);
        let handle = std::thread::Builder::new()
            .name("port-input".to_string())
            .spawn(move || {
                let failed = run_input_loop(&thread_unit, &sink, carrier, monitors, &stop);
                *thread_unit.state.lock() = ConnectionState::Closed;
                sink.sink_input_gone(thread_unit.id, failed);
            })?;
        *unit.thread.lock() = Some(handle);
        Ok(unit)
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

    /// Ask the reader thread to exit without waiting for it. Safe to
    /// call from any thread, including the unit's own.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        (self.kick)();
    }

    /// Stop the reader thread and wait for it to finish
    pub fn close(&self) {
        self.request_stop();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Reader loop body; returns true if the connection failed rather than
/// closed cleanly.
fn run_input_loop(
    unit: &InputUnit,
    sink: &Arc<dyn InputSink>,
    mut carrier: Box<dyn Carrier>,
    mut monitors: Vec<Box<dyn Monitor>>,
    stop: &AtomicBool,
) -> bool {
    log::debug!(
        "Input thread started for {} ({})",
        unit.peer.name(),
        unit.carrier_name
    );

    let failed = loop {
        if stop.load(Ordering::Acquire) || sink.sink_closing() {
            break false;
        }

        let msg = match carrier.read_message() {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) if e.is_disconnect() => {
                log::info!("Peer {} disconnected", unit.peer.name());
                break false;
            }
            Err(e) => {
                // Malformed frame or transport fault: this connection is
                // done, the port carries on.
                log::warn!(
                    "Dropping connection from {}: {}",
                    unit.peer.name(),
                    e
                );
                break true;
            }
        };

        match handle_message(unit, sink, &mut carrier, &mut monitors, msg, stop) {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                log::info!("Peer {} disconnected", unit.peer.name());
                break false;
            }
            Err(e) => {
                log::warn!("Connection from {} failed: {}", unit.peer.name(), e);
                break true;
            }
        }
    };

    for monitor in monitors.iter_mut() {
        monitor.destroy();
    }
    carrier.close();
    log::debug!("Input thread for {} exiting", unit.peer.name());
    failed
}

fn handle_message(
    unit: &InputUnit,
    sink: &Arc<dyn InputSink>,
    carrier: &mut Box<dyn Carrier>,
    monitors: &mut [Box<dyn Monitor>],
    msg: Message,
    stop: &AtomicBool,
) -> crate::error::Result<()> {
    // Receive-side monitors run before anything looks at the payload
    let bundle = match run_pipeline(monitors, msg.bundle)? {
        Some(bundle) => bundle,
        None => {
            // Monitor veto: frame dropped for this connection only
            carrier.send_ack()?;
            return Ok(());
        }
    };

    // The admin side-channel inspects the frame before the application
    // reader gets a chance.
    if let Some(admin_reply) = sink.sink_admin(&bundle, &unit.peer) {
        if msg.expects_reply {
            carrier.write_message(&Message::data(admin_reply, None))?;
        }
        carrier.send_ack()?;
        return Ok(());
    }

    if msg.expects_reply {
        let (replier, reply_rx) = Replier::channel();
        let accepted = sink.sink_deliver(Delivery {
            bundle,
            envelope: msg.envelope,
            from: unit.peer.clone(),
            replier: Some(replier),
        });
        if !accepted {
            log::debug!("Message from {} dropped by port", unit.peer.name());
        }
        let reply = await_reply(sink, &reply_rx, stop);
        carrier.write_message(&Message::data(reply, None))?;
    } else {
        let accepted = sink.sink_deliver(Delivery {
            bundle,
            envelope: msg.envelope,
            from: unit.peer.clone(),
            replier: None,
        });
        if !accepted {
            log::debug!("Message from {} dropped by port", unit.peer.name());
        }
    }

    carrier.send_ack()?;
    Ok(())
}

/// Wait for the application to reply, bounded by the port timeout and
/// shutdown flags. A missing reply becomes an empty one so the remote
/// caller is never stranded mid-exchange.
fn await_reply(
    sink: &Arc<dyn InputSink>,
    reply_rx: &crossbeam_channel::Receiver<Bundle>,
    stop: &AtomicBool,
) -> Bundle {
    let deadline = sink.sink_reply_timeout();
    let start = Instant::now();
    loop {
        match reply_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(reply) => return reply,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                // Reader consumed the message without replying
                return Bundle::new();
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Acquire) || sink.sink_closing() {
                    return Bundle::new();
                }
                if let Some(d) = deadline {
                    if start.elapsed() > d {
                        log::warn!("Reply not produced within {:?}; sending empty reply", d);
                        return Bundle::new();
                    }
                }
            }
        }
    }
}
