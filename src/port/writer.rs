//! Producer-side double buffering
//!
//! A `WriterBuffer` gives the caller a mutable slot to fill and an
//! optional background thread to flush it, so high-rate producers never
//! block on the network. The two slots form an explicit ring with an
//! atomic in-flight flag: while one slot is being transmitted, the
//! caller prepares the other, polling [`is_writing`] before reuse.
//!
//! [`is_writing`]: WriterBuffer::is_writing

use crate::bundle::Bundle;
use crate::error::Result;
use crate::port::{Port, PortShared};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct WriterBuffer {
    shared: Arc<PortShared>,
    slots: Arc<[Mutex<Bundle>; 2]>,
    active: usize,
    in_flight: Arc<AtomicBool>,
    job_tx: Option<crossbeam_channel::Sender<usize>>,
    flusher: Option<JoinHandle<()>>,
}

impl WriterBuffer {
    /// Writer with synchronous flushing on the caller's thread
    pub fn new(port: &Port) -> Self {
        Self {
            shared: port.shared_handle(),
            slots: Arc::new([Mutex::new(Bundle::new()), Mutex::new(Bundle::new())]),
            active: 0,
            in_flight: Arc::new(AtomicBool::new(false)),
            job_tx: None,
            flusher: None,
        }
    }

    /// Writer with a dedicated flusher thread; `write` returns
    /// immediately and [`is_writing`] reports transmission progress.
    ///
    /// [`is_writing`]: WriterBuffer::is_writing
    pub fn background(port: &Port) -> Result<Self> {
        let mut writer = Self::new(port);
        let (job_tx, job_rx) = crossbeam_channel::bounded::<usize>(2);
        let shared = Arc::clone(&writer.shared);
        let slots = Arc::clone(&writer.slots);
        let in_flight = Arc::clone(&writer.in_flight);

        let flusher = std::thread::Builder::new()
            .name("port-bg-writer".to_string())
            .spawn(move || {
                for slot_index in job_rx {
                    // Snapshot under the slot lock, transmit outside it,
                    // so the caller can refill the other slot meanwhile.
                    let bundle = slots[slot_index].lock().clone();
                    if !shared.write_bundle(&bundle, None) {
                        log::debug!("Background write did not reach all connections");
                    }
                    in_flight.store(false, Ordering::Release);
                }
            })?;

        writer.job_tx = Some(job_tx);
        writer.flusher = Some(flusher);
        Ok(writer)
    }

    /// Mutable handle to the next outgoing slot.
    ///
    /// The previous contents are kept, which suits producers that
    /// update a message in place each cycle.
    pub fn prepare(&mut self) -> MutexGuard<'_, Bundle> {
        self.slots[self.active].lock()
    }

    /// Send the prepared slot.
    ///
    /// In background mode this enqueues the slot for the flusher thread
    /// and returns immediately; if the previous transmission is still
    /// in flight the call is refused (`false`) and the caller should
    /// poll [`is_writing`] before retrying.
    ///
    /// [`is_writing`]: WriterBuffer::is_writing
    pub fn write(&mut self) -> bool {
        match &self.job_tx {
            Some(job_tx) => {
                if self.in_flight.swap(true, Ordering::AcqRel) {
                    log::warn!("write() while previous slot still in flight; poll is_writing()");
                    return false;
                }
                let index = self.active;
                self.active = 1 - self.active;
                if job_tx.send(index).is_err() {
                    self.in_flight.store(false, Ordering::Release);
                    return false;
                }
                true
            }
            None => {
                let bundle = self.slots[self.active].lock().clone();
                self.active = 1 - self.active;
                self.shared.write_bundle(&bundle, None)
            }
        }
    }

    /// True while the most recent background write has not yet been
    /// transmitted to all current outgoing connections
    pub fn is_writing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for WriterBuffer {
    fn drop(&mut self) {
        // Closing the channel ends the flusher loop
        self.job_tx = None;
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.join();
        }
    }
}
