//! Reliable stream carrier (TCP, binary framing)
//!
//! Frame layout after the negotiation preamble:
//!
//! ```text
//! ┌──────────────────┬───────┬─────────────────────┬──────────────┐
//! │ Length (4 bytes) │ Flags │ Envelope (optional) │ Payload      │
//! │ Big-endian u32   │ u8    │ u32 len + bytes     │ bundle bytes │
//! └──────────────────┴───────┴─────────────────────┴──────────────┘
//! ```
//!
//! Flags: bit 0 = sender expects a reply, bit 1 = envelope present.
//! Every frame exchange ends with a single acknowledgment byte from the
//! receiver, sent after the frame (and any reply) has been consumed.

use super::{is_timeout, Carrier, Kicker, Message, ACK_BYTE, MAX_FRAME, POLL_INTERVAL, STREAM_PREAMBLE};
use crate::bundle::Bundle;
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::options::Options;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

const FLAG_EXPECTS_REPLY: u8 = 0x01;
const FLAG_HAS_ENVELOPE: u8 = 0x02;

const ACCEPT_OK: u8 = 0x01;
const ACCEPT_REFUSED: u8 = 0x00;

pub(crate) struct StreamCarrier {
    socket: TcpStream,
    kick_handle: Arc<TcpStream>,
}

impl StreamCarrier {
    /// Wrap an accepted socket (preamble already consumed)
    pub fn new(socket: TcpStream) -> Result<Self> {
        let kick_handle = Arc::new(socket.try_clone()?);
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self {
            socket,
            kick_handle,
        })
    }

    /// Dial a contact and send the carrier preamble
    pub fn connect(target: &Contact, timeout: Option<Duration>) -> Result<Self> {
        let socket = super::connect_tcp(target, timeout)?;
        let mut carrier = Self::new(socket)?;
        carrier.socket.write_all(&STREAM_PREAMBLE)?;
        Ok(carrier)
    }

    fn write_string(&mut self, s: &str) -> Result<()> {
        self.socket
            .write_all(&(s.len() as u32).to_be_bytes())?;
        self.socket.write_all(s.as_bytes())?;
        Ok(())
    }

    fn read_string(&mut self, limit: usize) -> Result<String> {
        let mut len_buf = [0u8; 4];
        self.socket.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > limit {
            return Err(Error::Protocol(format!(
                "header string too large: {} bytes",
                len
            )));
        }
        let mut buf = vec![0u8; len];
        self.socket.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| Error::Protocol(format!("header not UTF-8: {}", e)))
    }
}

impl Carrier for StreamCarrier {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn send_header(&mut self, from: &Contact, options: &Options) -> Result<()> {
        self.write_string(from.name())?;
        let kv: Vec<String> = options
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        self.write_string(&kv.join(" "))?;
        self.socket.flush()?;
        Ok(())
    }

    fn expect_reply_to_header(&mut self) -> Result<()> {
        // Allow generous time for the accept thread on the other side
        self.socket.set_read_timeout(Some(Duration::from_secs(10)))?;
        let mut verdict = [0u8; 1];
        self.socket.read_exact(&mut verdict)?;
        self.socket.set_read_timeout(Some(POLL_INTERVAL))?;
        match verdict[0] {
            ACCEPT_OK => Ok(()),
            _ => Err(Error::Negotiation("connection refused by peer".to_string())),
        }
    }

    fn expect_sender(&mut self) -> Result<(String, Options)> {
        self.socket.set_read_timeout(Some(Duration::from_secs(10)))?;
        let name = self.read_string(1024)?;
        let kv = self.read_string(4096)?;
        self.socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok((name, Options::from_kv_str(&kv)))
    }

    fn respond_to_header(&mut self, accept: bool) -> Result<()> {
        let verdict = if accept { ACCEPT_OK } else { ACCEPT_REFUSED };
        self.socket.write_all(&[verdict])?;
        self.socket.flush()?;
        Ok(())
    }

    fn write_message(&mut self, msg: &Message) -> Result<()> {
        let payload = msg.bundle.to_bytes();
        let envelope = msg.envelope.as_ref().map(Bundle::to_bytes);

        let mut flags = 0u8;
        if msg.expects_reply {
            flags |= FLAG_EXPECTS_REPLY;
        }
        let env_len = match &envelope {
            Some(e) => {
                flags |= FLAG_HAS_ENVELOPE;
                4 + e.len()
            }
            None => 0,
        };

        let body_len = 1 + env_len + payload.len();
        if body_len > MAX_FRAME {
            return Err(Error::Protocol(format!(
                "frame too large: {} bytes",
                body_len
            )));
        }

        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        buf.push(flags);
        if let Some(e) = &envelope {
            buf.extend_from_slice(&(e.len() as u32).to_be_bytes());
            buf.extend_from_slice(e);
        }
        buf.extend_from_slice(&payload);

        self.socket.write_all(&buf)?;
        self.socket.flush()?;
        Ok(())
    }

    fn read_message(&mut self) -> Result<Option<Message>> {
        let mut len_buf = [0u8; 4];
        match self.socket.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        }
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if body_len == 0 || body_len > MAX_FRAME {
            return Err(Error::Protocol(format!(
                "bad frame length {}",
                body_len
            )));
        }

        let mut body = vec![0u8; body_len];
        self.socket.read_exact(&mut body)?;

        let flags = body[0];
        let mut offset = 1;
        let envelope = if flags & FLAG_HAS_ENVELOPE != 0 {
            if body_len < offset + 4 {
                return Err(Error::Protocol("truncated envelope header".to_string()));
            }
            let env_len = u32::from_be_bytes([
                body[offset],
                body[offset + 1],
                body[offset + 2],
                body[offset + 3],
            ]) as usize;
            offset += 4;
            if body_len < offset + env_len {
                return Err(Error::Protocol("truncated envelope".to_string()));
            }
            let env = Bundle::from_bytes(&body[offset..offset + env_len])?;
            offset += env_len;
            Some(env)
        } else {
            None
        };

        let bundle = Bundle::from_bytes(&body[offset..])?;
        Ok(Some(Message {
            bundle,
            envelope,
            expects_reply: flags & FLAG_EXPECTS_REPLY != 0,
        }))
    }

    fn send_ack(&mut self) -> Result<()> {
        self.socket.write_all(&[ACK_BYTE])?;
        self.socket.flush()?;
        Ok(())
    }

    fn expect_ack(&mut self) -> Result<bool> {
        let mut ack = [0u8; 1];
        match self.socket.read_exact(&mut ack) {
            Ok(()) => {}
            Err(e) if is_timeout(&e) => return Ok(false),
            Err(e) => return Err(Error::Io(e)),
        }
        if ack[0] != ACK_BYTE {
            return Err(Error::Protocol(format!(
                "bad acknowledgment byte {:#04x}",
                ack[0]
            )));
        }
        Ok(true)
    }

    fn kicker(&self) -> Kicker {
        let handle = Arc::clone(&self.kick_handle);
        Arc::new(move || {
            let _ = handle.shutdown(Shutdown::Both);
        })
    }

    fn close(&mut self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (StreamCarrier, StreamCarrier) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut preamble = [0u8; 8];
            (&sock).read_exact(&mut preamble).unwrap();
            assert_eq!(preamble, STREAM_PREAMBLE);
            StreamCarrier::new(sock).unwrap()
        });
        let target = Contact::new("/peer", "127.0.0.1", addr.port(), "stream").unwrap();
        let initiator = StreamCarrier::connect(&target, None).unwrap();
        (initiator, accept.join().unwrap())
    }

    #[test]
    fn test_header_exchange() {
        let (mut a, mut b) = pair();
        let from = Contact::new("/writer", "127.0.0.1", 0, "stream").unwrap();
        let mut opts = Options::new();
        opts.put("recv", "zstd");
        a.send_header(&from, &opts).unwrap();
        let (name, received) = b.expect_sender().unwrap();
        assert_eq!(name, "/writer");
        assert_eq!(received.get("recv"), Some("zstd"));
        b.respond_to_header(true).unwrap();
        a.expect_reply_to_header().unwrap();
    }

    #[test]
    fn test_message_round_trip_with_envelope() {
        let (mut a, mut b) = pair();
        let mut bundle = Bundle::new();
        bundle.push_i32(1).push_str("scan");
        let mut env = Bundle::new();
        env.push_f64(123.456);
        let msg = Message {
            bundle: bundle.clone(),
            envelope: Some(env.clone()),
            expects_reply: false,
        };
        a.write_message(&msg).unwrap();
        let got = loop {
            if let Some(m) = b.read_message().unwrap() {
                break m;
            }
        };
        assert_eq!(got.bundle, bundle);
        assert_eq!(got.envelope, Some(env));
        assert!(!got.expects_reply);
        b.send_ack().unwrap();
        while !a.expect_ack().unwrap() {}
    }

    #[test]
    fn test_rejection() {
        let (mut a, mut b) = pair();
        let from = Contact::new("/writer", "127.0.0.1", 0, "stream").unwrap();
        a.send_header(&from, &Options::new()).unwrap();
        let _ = b.expect_sender().unwrap();
        b.respond_to_header(false).unwrap();
        assert!(a.expect_reply_to_header().is_err());
    }
}
