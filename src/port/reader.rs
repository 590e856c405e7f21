//! Consumer-side buffering
//!
//! The delivery queue decouples the network threads from the
//! application thread. Two delivery policies exist:
//!
//! - **strict**: lossless FIFO; when bounded, producers block until the
//!   consumer catches up (never overwriting)
//! - **latest-wins**: at most one undelivered message is retained, each
//!   arrival replacing the last
//!
//! [`ReaderBuffer`] is the application-facing front end: it selects the
//! policy and the consumption strategy (blocking pull or per-message
//! callback) and attaches to a port. The strategy is fixed at attach
//! time; changing it means detaching and reattaching.

use crate::bundle::Bundle;
use crate::connection::Delivery;
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::port::{Port, PortFlags, PortShared};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback invoked per decoded message in push mode
pub type ReadCallback = dyn FnMut(Bundle, Option<Bundle>, &Contact) + Send;

struct QueueInner {
    items: std::collections::VecDeque<Delivery>,
    open: bool,
}

/// Thread-safe delivery queue with strict or latest-wins policy
pub(crate) struct DeliveryQueue {
    inner: Mutex<QueueInner>,
    strict: bool,
    capacity: Option<usize>,
    data_ready: Condvar,
    space_ready: Condvar,
}

impl DeliveryQueue {
    pub fn new(strict: bool, capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: std::collections::VecDeque::new(),
                open: true,
            }),
            strict,
            capacity,
            data_ready: Condvar::new(),
            space_ready: Condvar::new(),
        }
    }

    /// Enqueue a delivery; false if it was dropped because the port is
    /// interrupted or shutting down. Strict bounded queues block the
    /// producer here rather than overwrite.
    pub fn push(&self, delivery: Delivery, flags: &PortFlags) -> bool {
        let mut inner = self.inner.lock();
        if !inner.open || flags.is_down() {
            return false;
        }
        if self.strict {
            if let Some(cap) = self.capacity {
                while inner.items.len() >= cap {
                    self.space_ready.wait(&mut inner);
                    if !inner.open || flags.is_down() {
                        return false;
                    }
                }
            }
            inner.items.push_back(delivery);
        } else {
            // Latest-wins: older undelivered messages are discarded
            inner.items.clear();
            inner.items.push_back(delivery);
        }
        self.data_ready.notify_one();
        true
    }

    /// Blocking pop; `None` on interrupt, close, or timeout
    pub fn pop(&self, timeout: Option<Duration>, flags: &PortFlags) -> Option<Delivery> {
        let start = Instant::now();
        let mut inner = self.inner.lock();
        loop {
            if flags.is_down() || !inner.open {
                return None;
            }
            if let Some(delivery) = inner.items.pop_front() {
                self.space_ready.notify_one();
                return Some(delivery);
            }
            match timeout {
                Some(t) => {
                    let remaining = t.checked_sub(start.elapsed())?;
                    if self
                        .data_ready
                        .wait_for(&mut inner, remaining.min(Duration::from_millis(100)))
                        .timed_out()
                        && start.elapsed() >= t
                    {
                        return None;
                    }
                }
                None => {
                    // Wake periodically so flag flips are never missed
                    let _ = self
                        .data_ready
                        .wait_for(&mut inner, Duration::from_millis(100));
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn clear(&self) {
        self.inner.lock().items.clear();
        self.space_ready.notify_all();
    }

    /// Wake every blocked producer and consumer (interrupt/close path)
    pub fn wake_all(&self) {
        let _guard = self.inner.lock();
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    pub fn shut(&self) {
        self.inner.lock().open = false;
        self.wake_all();
    }
}

enum AttachMode {
    Pull(Arc<DeliveryQueue>),
    Callback,
}

/// Buffered reader over a port's incoming stream.
///
/// ```no_run
/// use setu::{Port, ReaderBuffer};
///
/// # fn main() -> setu::Result<()> {
/// let port = Port::open("/sensor/in")?;
/// let mut reader = ReaderBuffer::strict();
/// reader.attach(&port)?;
/// while let Some(bundle) = reader.read() {
///     println!("got {}", bundle);
/// }
/// # Ok(())
/// # }
/// ```
pub struct ReaderBuffer {
    strict: bool,
    capacity: Option<usize>,
    callback: Option<Box<ReadCallback>>,
    attached: Option<(Arc<PortShared>, AttachMode)>,
}

impl ReaderBuffer {
    /// Lossless FIFO delivery
    pub fn strict() -> Self {
        Self {
            strict: true,
            capacity: None,
            callback: None,
            attached: None,
        }
    }

    /// Strict delivery with a bounded queue; producers block when full
    pub fn strict_bounded(capacity: usize) -> Self {
        Self {
            strict: true,
            capacity: Some(capacity.max(1)),
            callback: None,
            attached: None,
        }
    }

    /// Latest-wins delivery: only the newest undelivered message is kept
    pub fn latest() -> Self {
        Self {
            strict: false,
            capacity: None,
            callback: None,
            attached: None,
        }
    }

    /// Select push-mode consumption. Only honored before [`attach`];
    /// afterwards the strategy is fixed.
    ///
    /// [`attach`]: ReaderBuffer::attach
    pub fn use_callback<F>(&mut self, callback: F)
    where
        F: FnMut(Bundle, Option<Bundle>, &Contact) + Send + 'static,
    {
        if self.attached.is_some() {
            log::warn!("use_callback after attach is ignored; detach and reattach instead");
            return;
        }
        self.callback = Some(Box::new(callback));
    }

    /// Subscribe to a port's incoming stream. Any messages buffered
    /// under a previous consumer are cleared.
    pub fn attach(&mut self, port: &Port) -> Result<()> {
        if self.attached.is_some() {
            return Err(Error::Misuse("reader buffer already attached".to_string()));
        }
        let shared = port.shared_handle();
        let mode = match self.callback.take() {
            Some(cb) => {
                shared.install_callback(cb);
                AttachMode::Callback
            }
            None => {
                let queue = Arc::new(DeliveryQueue::new(self.strict, self.capacity));
                shared.install_queue(Arc::clone(&queue));
                AttachMode::Pull(queue)
            }
        };
        self.attached = Some((shared, mode));
        Ok(())
    }

    /// Unsubscribe and return the port to its built-in queue
    pub fn detach(&mut self) {
        if let Some((shared, _)) = self.attached.take() {
            shared.reset_consumer();
        }
    }

    /// Stop push-mode delivery without losing queued messages.
    ///
    /// Safe to call whether or not the buffer is attached or even in
    /// callback mode. After this, arrivals queue for [`read`]; going
    /// back to callbacks requires a detach/reattach.
    ///
    /// [`read`]: ReaderBuffer::read
    pub fn disable_callback(&mut self) {
        self.callback = None;
        if let Some((shared, mode)) = self.attached.as_mut() {
            if matches!(mode, AttachMode::Callback) {
                let queue = Arc::new(DeliveryQueue::new(self.strict, self.capacity));
                shared.install_queue(Arc::clone(&queue));
                *mode = AttachMode::Pull(queue);
            }
        }
    }

    /// Block until the next message, honoring the port's timeout.
    /// `None` when the port is interrupted or closed.
    pub fn read(&mut self) -> Option<Bundle> {
        let (shared, mode) = self.attached.as_ref()?;
        let queue = match mode {
            AttachMode::Pull(queue) => queue,
            AttachMode::Callback => {
                log::warn!("read() on a callback-mode reader buffer");
                return None;
            }
        };
        let delivery = queue.pop(shared.read_timeout(), shared.flags())?;
        shared.note_envelope(delivery.envelope.clone());
        // Pull-mode reads never reply; a dropped replier resolves the
        // sender's wait with an empty reply.
        Some(delivery.bundle)
    }

    /// Current queue depth (diagnostics and tests)
    pub fn pending_reads(&self) -> usize {
        match self.attached.as_ref() {
            Some((_, AttachMode::Pull(queue))) => queue.len(),
            _ => 0,
        }
    }
}

impl Drop for ReaderBuffer {
    fn drop(&mut self) {
        self.detach();
    }
}
