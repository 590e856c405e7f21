//! Datagram carrier (UDP, push-style, lossy)
//!
//! One datagram is one message; anything that does not fit is dropped
//! rather than fragmented, and late or mangled datagrams are discarded
//! silently. The carrier is one-way: there is no reply channel, and RPC
//! over it fails fast instead of blocking.
//!
//! Datagram layout:
//!
//! ```text
//! ┌───────────┬──────┬───────────────────────────────────────────┐
//! │ "SDG1"    │ kind │ body                                      │
//! │ 4 bytes   │ u8   │ HELLO: u16 name-len + name + options      │
//! │           │      │ DATA:  u8 flags + envelope? + payload     │
//! │           │      │ BYE:   empty                              │
//! └───────────┴──────┴───────────────────────────────────────────┘
//! ```

use super::{Carrier, Message};
use crate::bundle::Bundle;
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::options::Options;
use std::net::UdpSocket;

const MAGIC: [u8; 4] = *b"SDG1";

const KIND_HELLO: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_BYE: u8 = 2;

const FLAG_HAS_ENVELOPE: u8 = 0x02;

/// Largest datagram we will emit; anything bigger is dropped
pub(crate) const MAX_DGRAM: usize = 65_000;

/// Decoded inbound datagram
#[derive(Debug)]
pub(crate) enum DgramFrame {
    /// Sender announces itself: name plus carrier options
    Hello(String, Options),
    Data(Message),
    Bye,
}

impl DgramFrame {
    /// Decode one datagram; `None` for anything malformed (lossy
    /// carriers drop bad frames without ceremony)
    pub fn decode(buf: &[u8]) -> Option<DgramFrame> {
        if buf.len() < 5 || buf[0..4] != MAGIC {
            return None;
        }
        let body = &buf[5..];
        match buf[4] {
            KIND_HELLO => {
                if body.len() < 2 {
                    return None;
                }
                let name_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                if body.len() < 2 + name_len {
                    return None;
                }
                let name = std::str::from_utf8(&body[2..2 + name_len]).ok()?;
                let kv = std::str::from_utf8(&body[2 + name_len..]).ok()?;
                Some(DgramFrame::Hello(
                    name.to_string(),
                    Options::from_kv_str(kv),
                ))
            }
            KIND_DATA => {
                if body.is_empty() {
                    return None;
                }
                let flags = body[0];
                let mut offset = 1;
                let envelope = if flags & FLAG_HAS_ENVELOPE != 0 {
                    if body.len() < offset + 4 {
                        return None;
                    }
                    let env_len = u32::from_be_bytes([
                        body[offset],
                        body[offset + 1],
                        body[offset + 2],
                        body[offset + 3],
                    ]) as usize;
                    offset += 4;
                    if body.len() < offset + env_len {
                        return None;
                    }
                    let env = Bundle::from_bytes(&body[offset..offset + env_len]).ok()?;
                    offset += env_len;
                    Some(env)
                } else {
                    None
                };
                let bundle = Bundle::from_bytes(&body[offset..]).ok()?;
                Some(DgramFrame::Data(Message {
                    bundle,
                    envelope,
                    expects_reply: false,
                }))
            }
            KIND_BYE => Some(DgramFrame::Bye),
            _ => None,
        }
    }

    fn encode_hello(name: &str, options: &Options) -> Vec<u8> {
        let kv: Vec<String> = options
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let kv = kv.join(" ");
        let mut out = Vec::with_capacity(7 + name.len() + kv.len());
        out.extend_from_slice(&MAGIC);
        out.push(KIND_HELLO);
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(kv.as_bytes());
        out
    }

    fn encode_data(msg: &Message) -> Vec<u8> {
        let payload = msg.bundle.to_bytes();
        let envelope = msg.envelope.as_ref().map(Bundle::to_bytes);
        let mut out = Vec::with_capacity(10 + payload.len());
        out.extend_from_slice(&MAGIC);
        out.push(KIND_DATA);
        let mut flags = 0u8;
        if envelope.is_some() {
            flags |= FLAG_HAS_ENVELOPE;
        }
        out.push(flags);
        if let Some(env) = &envelope {
            out.extend_from_slice(&(env.len() as u32).to_be_bytes());
            out.extend_from_slice(env);
        }
        out.extend_from_slice(&payload);
        out
    }

    fn encode_bye() -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        out.extend_from_slice(&MAGIC);
        out.push(KIND_BYE);
        out
    }
}

pub(crate) struct DgramCarrier {
    socket: UdpSocket,
    peer: String,
}

impl DgramCarrier {
    pub fn connect(target: &Contact) -> Result<Self> {
        if !target.is_routable() {
            return Err(Error::Negotiation(format!(
                "contact {} has no routable address",
                target
            )));
        }
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket
            .connect(target.socket_addr())
            .map_err(|e| Error::Negotiation(format!("cannot reach {}: {}", target, e)))?;
        Ok(Self {
            socket,
            peer: target.name().to_string(),
        })
    }
}

impl Carrier for DgramCarrier {
    fn name(&self) -> &'static str {
        "dgram"
    }

    fn supports_reply(&self) -> bool {
        false
    }

    fn is_push(&self) -> bool {
        true
    }

    fn send_header(&mut self, from: &Contact, options: &Options) -> Result<()> {
        let hello = DgramFrame::encode_hello(from.name(), options);
        self.socket.send(&hello)?;
        Ok(())
    }

    fn expect_reply_to_header(&mut self) -> Result<()> {
        // Lossy carrier: the hello is fire-and-forget
        Ok(())
    }

    fn expect_sender(&mut self) -> Result<(String, Options)> {
        Err(Error::Protocol(
            "dgram connections are accepted by the port's datagram listener".to_string(),
        ))
    }

    fn respond_to_header(&mut self, _accept: bool) -> Result<()> {
        Ok(())
    }

    fn write_message(&mut self, msg: &Message) -> Result<()> {
        let frame = DgramFrame::encode_data(msg);
        if frame.len() > MAX_DGRAM {
            log::warn!(
                "Dropping {}-byte message to {}: exceeds datagram limit",
                frame.len(),
                self.peer
            );
            return Ok(());
        }
        self.socket.send(&frame)?;
        Ok(())
    }

    fn read_message(&mut self) -> Result<Option<Message>> {
        Err(Error::Protocol(
            "dgram carrier has no reply channel".to_string(),
        ))
    }

    fn send_ack(&mut self) -> Result<()> {
        Ok(())
    }

    fn expect_ack(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn close(&mut self) {
        let _ = self.socket.send(&DgramFrame::encode_bye());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_round_trip() {
        let mut opts = Options::new();
        opts.put("recv", "zstd");
        let buf = DgramFrame::encode_hello("/sensor", &opts);
        match DgramFrame::decode(&buf) {
            Some(DgramFrame::Hello(name, o)) => {
                assert_eq!(name, "/sensor");
                assert_eq!(o.get("recv"), Some("zstd"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_data_round_trip() {
        let mut bundle = Bundle::new();
        bundle.push_i32(3).push_f64(0.25);
        let mut env = Bundle::new();
        env.push_i64(111);
        let msg = Message {
            bundle: bundle.clone(),
            envelope: Some(env.clone()),
            expects_reply: false,
        };
        let buf = DgramFrame::encode_data(&msg);
        match DgramFrame::decode(&buf) {
            Some(DgramFrame::Data(m)) => {
                assert_eq!(m.bundle, bundle);
                assert_eq!(m.envelope, Some(env));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_dropped() {
        assert!(DgramFrame::decode(b"nonsense").is_none());
        assert!(DgramFrame::decode(b"SDG1").is_none());
        let mut bad = DgramFrame::encode_data(&Message::data(Bundle::new(), None));
        bad.truncate(bad.len() - 1);
        // Truncated payload decodes to nothing, not an error
        assert!(DgramFrame::decode(&bad).is_none());
    }
}
