//! zstd payload compression monitor
//!
//! The sending side replaces the payload with a container bundle
//! `[ [zc1] <raw-len> <compressed blob> ]`; the receiving side
//! recognizes the container and restores the original bundle. Payloads
//! that are already containers (send side) or are not containers
//! (receive side) fail the `accept` type check and are dropped for the
//! connection.

use super::{Monitor, MonitorSide};
use crate::bundle::{vocab, Bundle, Value};
use crate::error::{Error, Result};
use crate::options::Options;
use parking_lot::Mutex;

/// Marker vocab identifying a compressed container
const CONTAINER_MARKER: u32 = vocab(b"zc1");

const DEFAULT_LEVEL: i32 = 3;

/// The zstd context is not reentrant; transform calls take this lock,
/// and nothing else in the pipeline does.
static CODEC_LOCK: Mutex<()> = Mutex::new(());

pub struct ZstdMonitor {
    side: MonitorSide,
    level: i32,
}

impl ZstdMonitor {
    pub fn create(side: MonitorSide, options: &Options) -> Result<Self> {
        let level = options.get_i64("level").unwrap_or(DEFAULT_LEVEL as i64);
        if !(1..=19).contains(&level) {
            return Err(Error::Negotiation(format!(
                "zstd level {} out of range 1..=19",
                level
            )));
        }
        Ok(Self {
            side,
            level: level as i32,
        })
    }

    fn is_container(bundle: &Bundle) -> bool {
        bundle.len() == 3
            && bundle.get(0).and_then(Value::as_vocab) == Some(CONTAINER_MARKER)
            && matches!(bundle.get(1), Some(Value::Int32(n)) if *n >= 0)
            && matches!(bundle.get(2), Some(Value::Blob(_)))
    }
}

impl Monitor for ZstdMonitor {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn accept(&mut self, bundle: &Bundle) -> bool {
        match self.side {
            MonitorSide::Send => !Self::is_container(bundle),
            MonitorSide::Receive => Self::is_container(bundle),
        }
    }

    fn update(&mut self, bundle: Bundle) -> Result<Bundle> {
        match self.side {
            MonitorSide::Send => {
                let raw = bundle.to_bytes();
                let compressed = {
                    let _codec = CODEC_LOCK.lock();
                    ::zstd::bulk::compress(&raw, self.level)?
                };
                log::trace!(
                    "Compressed payload {} -> {} bytes",
                    raw.len(),
                    compressed.len()
                );
                let mut container = Bundle::new();
                container
                    .push(Value::Vocab(CONTAINER_MARKER))
                    .push_i32(raw.len() as i32)
                    .push_blob(&compressed);
                Ok(container)
            }
            MonitorSide::Receive => {
                let raw_len = bundle
                    .get(1)
                    .and_then(Value::as_i32)
                    .ok_or_else(|| Error::Protocol("container missing raw length".to_string()))?;
                let blob = bundle
                    .get(2)
                    .and_then(Value::as_blob)
                    .ok_or_else(|| Error::Protocol("container missing blob".to_string()))?;
                let raw = {
                    let _codec = CODEC_LOCK.lock();
                    ::zstd::bulk::decompress(blob, raw_len as usize)?
                };
                Bundle::from_bytes(&raw)
            }
        }
    }

    fn destroy(&mut self) {
        log::trace!("zstd monitor destroyed ({:?} side)", self.side);
    }
}
