//! Text carrier (TCP, human-readable line framing)
//!
//! Everything on the wire is a line of text, so a human with a terminal
//! can speak to a port directly:
//!
//! ```text
//! CONNECT /me          open the connection (this line IS the preamble)
//! Welcome /me          port accepts
//! d                    next line is data, no reply wanted
//! 1 2 3
//! o                    acknowledgment
//! ```
//!
//! Directives: `d` = data, `r` = data expecting a reply, `e <bundle>` =
//! envelope for the next data line, `o` = acknowledgment, `q` = quit.
//! A bare line that is no directive is treated as a data bundle with a
//! reply expected, which is what a human poking at a port wants.

use super::{is_timeout, Carrier, Kicker, Message, POLL_INTERVAL, TEXT_PREAMBLE};
use crate::bundle::Bundle;
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::options::Options;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Accumulating line reader that tolerates read timeouts mid-line
struct LineReader {
    socket: TcpStream,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(socket: TcpStream) -> Self {
        Self {
            socket,
            buf: Vec::with_capacity(256),
        }
    }

    /// Next complete line without its terminator; `Ok(None)` on a
    /// poll-interval tick. Partial input stays buffered.
    fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw)
                    .trim_end_matches(|c| c == '\r' || c == '\n')
                    .to_string();
                return Ok(Some(line));
            }
            let mut tmp = [0u8; 4096];
            match self.socket.read(&mut tmp) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "text connection closed",
                    )))
                }
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

pub(crate) struct TextCarrier {
    reader: LineReader,
    writer: TcpStream,
    kick_handle: Arc<TcpStream>,
    pending_envelope: Option<Bundle>,
    pending_directive: Option<bool>,
}

impl TextCarrier {
    /// Wrap an accepted socket (the `CONNECT ` preamble is consumed;
    /// the rest of that line is still buffered in the socket)
    pub fn new(socket: TcpStream) -> Result<Self> {
        let writer = socket.try_clone()?;
        let kick_handle = Arc::new(socket.try_clone()?);
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self {
            reader: LineReader::new(socket),
            writer,
            kick_handle,
            pending_envelope: None,
            pending_directive: None,
        })
    }

    /// Dial a contact and send the carrier preamble
    pub fn connect(target: &Contact, timeout: Option<Duration>) -> Result<Self> {
        let socket = super::connect_tcp(target, timeout)?;
        let mut carrier = Self::new(socket)?;
        carrier.writer.write_all(&TEXT_PREAMBLE)?;
        Ok(carrier)
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Block (with polling) until a full line arrives, bounded by a
    /// negotiation deadline.
    fn read_line_blocking(&mut self, deadline: Duration) -> Result<String> {
        let start = std::time::Instant::now();
        loop {
            if let Some(line) = self.reader.read_line()? {
                return Ok(line);
            }
            if start.elapsed() > deadline {
                return Err(Error::Timeout);
            }
        }
    }
}

impl Carrier for TextCarrier {
    fn name(&self) -> &'static str {
        "text"
    }

    fn is_text_mode(&self) -> bool {
        true
    }

    fn send_header(&mut self, from: &Contact, options: &Options) -> Result<()> {
        // The preamble "CONNECT " already went out; finish the line
        let mut line = from.name().to_string();
        for (k, v) in options.iter() {
            line.push_str(&format!(" {}={}", k, v));
        }
        self.write_line(&line)
    }

    fn expect_reply_to_header(&mut self) -> Result<()> {
        let line = self.read_line_blocking(Duration::from_secs(10))?;
        if line.starts_with("Welcome") {
            Ok(())
        } else {
            Err(Error::Negotiation(format!(
                "text connection refused: {}",
                line
            )))
        }
    }

    fn expect_sender(&mut self) -> Result<(String, Options)> {
        let line = self.read_line_blocking(Duration::from_secs(10))?;
        let mut tokens = line.split_whitespace();
        let name = tokens
            .next()
            .ok_or_else(|| Error::Negotiation("empty CONNECT line".to_string()))?
            .to_string();
        let kv: Vec<&str> = tokens.collect();
        Ok((name, Options::from_kv_str(&kv.join(" "))))
    }

    fn respond_to_header(&mut self, accept: bool) -> Result<()> {
        if accept {
            self.write_line("Welcome")
        } else {
            self.write_line("Refused")
        }
    }

    fn write_message(&mut self, msg: &Message) -> Result<()> {
        if let Some(env) = &msg.envelope {
            self.write_line(&format!("e {}", env.to_text()))?;
        }
        self.write_line(if msg.expects_reply { "r" } else { "d" })?;
        self.write_line(&msg.bundle.to_text())
    }

    fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            let line = match self.reader.read_line()? {
                Some(line) => line,
                None => return Ok(None),
            };

            if self.pending_directive.is_none() {
                if let Some(env_text) = line.strip_prefix("e ") {
                    self.pending_envelope = Some(Bundle::from_text(env_text)?);
                    continue;
                }
                match line.as_str() {
                    "d" => {
                        self.pending_directive = Some(false);
                        continue;
                    }
                    "r" => {
                        self.pending_directive = Some(true);
                        continue;
                    }
                    "q" => {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "peer quit",
                        )))
                    }
                    "" => continue,
                    // A human typed a bare bundle; show them the reply
                    _ => {
                        return Ok(Some(Message {
                            bundle: Bundle::from_text(&line)?,
                            envelope: self.pending_envelope.take(),
                            expects_reply: true,
                        }))
                    }
                }
            }

            let expects_reply = self.pending_directive.take().unwrap_or(false);
            return Ok(Some(Message {
                bundle: Bundle::from_text(&line)?,
                envelope: self.pending_envelope.take(),
                expects_reply,
            }));
        }
    }

    fn send_ack(&mut self) -> Result<()> {
        self.write_line("o")
    }

    fn expect_ack(&mut self) -> Result<bool> {
        match self.reader.read_line()? {
            None => Ok(false),
            Some(line) if line == "o" => Ok(true),
            Some(line) => Err(Error::Protocol(format!(
                "expected ack line, got '{}'",
                line
            ))),
        }
    }

    fn kicker(&self) -> Kicker {
        let handle = Arc::clone(&self.kick_handle);
        Arc::new(move || {
            let _ = handle.shutdown(Shutdown::Both);
        })
    }

    fn close(&mut self) {
        let _ = self.write_line("q");
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}
