//! Carrier layer: pluggable transport/protocol strategies
//!
//! A carrier owns one negotiated transport binding and knows how to
//! frame messages on it. Selection happens once per connection: the
//! initiating side names its carrier, the accepting side recognizes it
//! from the first eight bytes on the wire.
//!
//! ```text
//! initiator                              acceptor
//! ─────────                              ────────
//! 8-byte preamble          ──────────▶   match against registry
//! sender name + options    ──────────▶   expect_sender()
//!                          ◀──────────   accept / reject
//! message frames           ──────────▶   read_message()
//!                          ◀──────────   ack (carrier-specific)
//! ```
//!
//! Shipped carriers: `stream` (reliable TCP, binary framing), `text`
//! (reliable TCP, human-readable line framing), `dgram` (lossy UDP,
//! one-way), `local` (same-process).

use crate::bundle::Bundle;
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::options::{CarrierSpec, Options};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

mod dgram;
mod local;
mod stream;
mod text;

pub(crate) use dgram::{DgramCarrier, DgramFrame};
pub(crate) use local::LocalCarrier;
pub(crate) use stream::StreamCarrier;
pub(crate) use text::TextCarrier;

/// Largest frame a reliable carrier will accept
pub(crate) const MAX_FRAME: usize = 64 * 1024 * 1024;

/// How often blocked carrier reads wake up to check shutdown flags
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Acknowledgment byte closing every reliable frame exchange
pub(crate) const ACK_BYTE: u8 = 0x6f;

/// Eight-byte preamble for the binary stream carrier
pub(crate) const STREAM_PREAMBLE: [u8; 8] = [b'S', b'E', b'T', b'U', 0x01, 0x00, b's', b'm'];

/// Eight-byte preamble for the text carrier; deliberately typeable so a
/// human can open a connection from a terminal
pub(crate) const TEXT_PREAMBLE: [u8; 8] = *b"CONNECT ";

const REJECT_BANNER: &str = "* Error: protocol not recognized.\r\n\
* You appear to be talking to a setu port. The first 8 bytes of a\r\n\
* connection select the carrier, and yours matched none.\r\n\
* If you are a human, type \"CONNECT /yourname\" followed by RETURN\r\n\
* to speak the text carrier.\r\n";

/// One decoded message travelling through a carrier
#[derive(Debug, Clone, Default)]
pub(crate) struct Message {
    pub bundle: Bundle,
    pub envelope: Option<Bundle>,
    pub expects_reply: bool,
}

impl Message {
    pub fn data(bundle: Bundle, envelope: Option<Bundle>) -> Self {
        Self {
            bundle,
            envelope,
            expects_reply: false,
        }
    }
}

/// Best-effort unblocker for a carrier's reading thread
pub(crate) type Kicker = Arc<dyn Fn() + Send + Sync>;

pub(crate) fn noop_kicker() -> Kicker {
    Arc::new(|| {})
}

/// Transport/protocol strategy for one connection.
///
/// Negotiation methods run exactly once; afterwards the data-plane
/// methods carry framed messages. `read_message` returns `Ok(None)` on
/// a poll-interval timeout so the owning thread can check shutdown
/// flags, never blocking indefinitely.
pub(crate) trait Carrier: Send {
    fn name(&self) -> &'static str;

    /// Human-readable self-delimiting framing?
    fn is_text_mode(&self) -> bool {
        false
    }

    /// Can replies travel back over this carrier?
    fn supports_reply(&self) -> bool {
        true
    }

    /// Datagram-like: frames may be silently dropped
    fn is_push(&self) -> bool {
        false
    }

    /// Does every frame end with a transport-level acknowledgment?
    fn requires_ack(&self) -> bool {
        !self.is_push()
    }

    // Initiator-side negotiation
    fn send_header(&mut self, from: &Contact, options: &Options) -> Result<()>;
    fn expect_reply_to_header(&mut self) -> Result<()>;

    // Acceptor-side negotiation (the preamble is already consumed)
    fn expect_sender(&mut self) -> Result<(String, Options)>;
    fn respond_to_header(&mut self, accept: bool) -> Result<()>;

    // Data plane
    fn write_message(&mut self, msg: &Message) -> Result<()>;
    fn read_message(&mut self) -> Result<Option<Message>>;
    fn send_ack(&mut self) -> Result<()>;
    /// Poll for the frame acknowledgment: `Ok(true)` when it arrived,
    /// `Ok(false)` on a poll-interval tick so the caller can check
    /// interrupt/close flags.
    fn expect_ack(&mut self) -> Result<bool>;

    /// Handle that unblocks a thread parked in `read_message`
    fn kicker(&self) -> Kicker {
        noop_kicker()
    }

    fn close(&mut self);
}

/// Select and build a carrier for an inbound TCP connection.
///
/// Reads the eight-byte preamble and matches it against the known
/// carriers. An unrecognized preamble gets the human-readable rejection
/// banner before the connection is dropped.
pub(crate) fn accept_stream(mut socket: TcpStream) -> Result<Box<dyn Carrier>> {
    socket.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut preamble = [0u8; 8];
    socket.read_exact(&mut preamble)?;
    if preamble == STREAM_PREAMBLE {
        return Ok(Box::new(StreamCarrier::new(socket)?));
    }
    if preamble == TEXT_PREAMBLE {
        return Ok(Box::new(TextCarrier::new(socket)?));
    }
    log::debug!("Rejecting connection with unknown preamble {:02x?}", preamble);
    let _ = socket.write_all(REJECT_BANNER.as_bytes());
    let _ = socket.flush();
    Err(Error::Negotiation("unknown carrier preamble".to_string()))
}

/// Build an initiating carrier for an outgoing connection.
///
/// `local` is not built here: same-process connections are wired up by
/// the port against the name registry without touching a socket.
pub(crate) fn initiate(
    spec: &CarrierSpec,
    target: &Contact,
    timeout: Option<Duration>,
) -> Result<Box<dyn Carrier>> {
    match spec.base.as_str() {
        "stream" => Ok(Box::new(StreamCarrier::connect(target, timeout)?)),
        "text" => Ok(Box::new(TextCarrier::connect(target, timeout)?)),
        "dgram" => Ok(Box::new(DgramCarrier::connect(target)?)),
        other => Err(Error::Negotiation(format!("unknown carrier '{}'", other))),
    }
}

/// True if this error is a read-timeout tick rather than a failure
pub(crate) fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

pub(crate) fn connect_tcp(target: &Contact, timeout: Option<Duration>) -> Result<TcpStream> {
    if !target.is_routable() {
        return Err(Error::Negotiation(format!(
            "contact {} has no routable address",
            target
        )));
    }
    let addrs: Vec<std::net::SocketAddr> = std::net::ToSocketAddrs::to_socket_addrs(
        &(target.host(), target.port()),
    )
    .map_err(|e| Error::Negotiation(format!("cannot resolve {}: {}", target, e)))?
    .collect();
    let addr = addrs
        .first()
        .ok_or_else(|| Error::Negotiation(format!("cannot resolve {}", target)))?;
    let socket = match timeout {
        Some(t) => TcpStream::connect_timeout(addr, t)
            .map_err(|e| Error::Negotiation(format!("cannot reach {}: {}", target, e)))?,
        None => TcpStream::connect(addr)
            .map_err(|e| Error::Negotiation(format!("cannot reach {}: {}", target, e)))?,
    };
    socket.set_nodelay(true)?;
    Ok(socket)
}
