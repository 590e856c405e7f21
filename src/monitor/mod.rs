//! Port monitors: in-flight payload transform stages
//!
//! A monitor is spliced into one side of one connection and rewrites
//! payloads as they pass: compress on the sending side, restore on the
//! receiving side. Monitors are selected through carrier spec
//! qualifiers (`stream+send.zstd+level.3`) and live exactly as long as
//! their connection.
//!
//! Stage contract: `accept` type-checks the payload and may veto it —
//! a vetoed frame is dropped for that connection only and the pipeline
//! does not advance; `update` produces the replacement payload;
//! `destroy` releases transform state when the connection dies.

use crate::bundle::Bundle;
use crate::error::{Error, Result};
use crate::options::Options;

mod zstd;

pub use self::zstd::ZstdMonitor;

/// Which side of the connection a monitor is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSide {
    Send,
    Receive,
}

/// One transform stage on a connection
pub trait Monitor: Send {
    fn name(&self) -> &'static str;

    /// Type-check an incoming payload; `false` vetoes the frame
    fn accept(&mut self, bundle: &Bundle) -> bool;

    /// Produce the replacement payload
    fn update(&mut self, bundle: Bundle) -> Result<Bundle>;

    /// Release transform state; called once when the connection closes
    fn destroy(&mut self) {}
}

/// Instantiate a monitor by name.
///
/// `options` come from the carrier spec qualifiers and are passed
/// through to the monitor's constructor.
pub fn create_monitor(
    name: &str,
    side: MonitorSide,
    options: &Options,
) -> Result<Box<dyn Monitor>> {
    match name {
        "zstd" => Ok(Box::new(ZstdMonitor::create(side, options)?)),
        other => Err(Error::Negotiation(format!("unknown monitor '{}'", other))),
    }
}

/// Build the monitor chain one connection side wants, from the carrier
/// options negotiated for it. The `send` qualifier names the sending
/// side's monitor, `recv` the receiving side's.
pub(crate) fn monitors_from_options(
    options: &Options,
    side: MonitorSide,
) -> Result<Vec<Box<dyn Monitor>>> {
    let key = match side {
        MonitorSide::Send => "send",
        MonitorSide::Receive => "recv",
    };
    match options.get(key) {
        Some(name) => Ok(vec![create_monitor(name, side, options)?]),
        None => Ok(Vec::new()),
    }
}

/// Run a payload through a monitor chain.
///
/// `Ok(None)` means a stage vetoed the frame; the caller drops it for
/// this connection and carries on.
pub(crate) fn run_pipeline(
    monitors: &mut [Box<dyn Monitor>],
    mut bundle: Bundle,
) -> Result<Option<Bundle>> {
    for monitor in monitors.iter_mut() {
        if !monitor.accept(&bundle) {
            log::debug!("Monitor '{}' rejected a frame", monitor.name());
            return Ok(None);
        }
        bundle = monitor.update(bundle)?;
    }
    Ok(Some(bundle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_monitor() {
        assert!(create_monitor("warp", MonitorSide::Send, &Options::new()).is_err());
    }

    #[test]
    fn test_empty_chain_passthrough() {
        let mut chain: Vec<Box<dyn Monitor>> = Vec::new();
        let mut b = Bundle::new();
        b.push_i32(1);
        let out = run_pipeline(&mut chain, b.clone()).unwrap();
        assert_eq!(out, Some(b));
    }

    #[test]
    fn test_options_select_side() {
        let mut opts = Options::new();
        opts.put("send", "zstd");
        let send = monitors_from_options(&opts, MonitorSide::Send).unwrap();
        assert_eq!(send.len(), 1);
        let recv = monitors_from_options(&opts, MonitorSide::Receive).unwrap();
        assert!(recv.is_empty());
    }
}
