//! Admin side-channel
//!
//! A small closed set of command tags is reserved for port
//! administration and multiplexed on the data port. When an admin
//! handler is installed, every inbound frame is inspected first: frames
//! whose leading tag is administrative are answered by the handler and
//! the application reader never sees them. Without a handler they fall
//! through to the reader like any other message, so nothing is lost
//! silently.
//!
//! Reserved tags: `help`, `ver`, `list`, `add`, `del`. The RPC
//! dispatcher refuses to register methods under these names.

use crate::bundle::{Bundle, Value};
use crate::port::Port;

/// The reserved administrative tags, never available to applications
pub const ADMIN_TAGS: [&str; 5] = ["help", "ver", "list", "add", "del"];

/// Admin protocol version reported by `ver`
const ADMIN_VERSION: (i32, i32, i32) = (1, 0, 0);

/// True if this frame's leading tag is administrative
pub fn is_admin_command(bundle: &Bundle) -> bool {
    match bundle.get(0).and_then(Value::as_tag_text) {
        Some(tag) => ADMIN_TAGS.contains(&tag.as_str()),
        None => false,
    }
}

/// Handles frames claimed by the admin side-channel
pub trait AdminHandler: Send {
    fn handle(&mut self, command: &Bundle, port: &Port) -> Bundle;
}

/// Stock admin handler: help, version, connection listing, and
/// port-driven connect/disconnect.
#[derive(Default)]
pub struct DefaultAdminHandler;

impl DefaultAdminHandler {
    fn help() -> Bundle {
        let mut reply = Bundle::new();
        reply.push_str("help                  # this list");
        reply.push_str("ver                   # admin protocol version");
        reply.push_str("list in               # names of incoming connections");
        reply.push_str("list out              # names of outgoing connections");
        reply.push_str("add <port> [carrier]  # connect an output");
        reply.push_str("del <port>            # disconnect by peer name");
        reply
    }

    fn ver() -> Bundle {
        let mut reply = Bundle::new();
        reply.push_vocab(b"ver");
        reply.push_i32(ADMIN_VERSION.0);
        reply.push_i32(ADMIN_VERSION.1);
        reply.push_i32(ADMIN_VERSION.2);
        reply
    }

    fn list(command: &Bundle, port: &Port) -> Bundle {
        let which = command
            .get(1)
            .and_then(Value::as_tag_text)
            .unwrap_or_else(|| "out".to_string());
        let names = match which.as_str() {
            "in" => port.input_names(),
            _ => port.output_names(),
        };
        let mut reply = Bundle::new();
        for name in names {
            reply.push_str(&name);
        }
        reply
    }

    fn add(command: &Bundle, port: &Port) -> Bundle {
        let mut reply = Bundle::new();
        let target = match command.get(1).and_then(Value::as_str) {
            Some(target) => target,
            None => {
                reply.push_vocab(b"fail").push_str("usage: add <port> [carrier]");
                return reply;
            }
        };
        let carrier = command
            .get(2)
            .and_then(Value::as_str)
            .unwrap_or("stream");
        if port.add_output_named(target, carrier) {
            reply.push_vocab(b"ok");
        } else {
            reply
                .push_vocab(b"fail")
                .push_str(&format!("cannot connect to {}", target));
        }
        reply
    }

    fn del(command: &Bundle, port: &Port) -> Bundle {
        let mut reply = Bundle::new();
        let target = match command.get(1).and_then(Value::as_str) {
            Some(target) => target,
            None => {
                reply.push_vocab(b"fail").push_str("usage: del <port>");
                return reply;
            }
        };
        if port.remove_output(target) || port.remove_input(target) {
            reply.push_vocab(b"ok");
        } else {
            reply
                .push_vocab(b"fail")
                .push_str(&format!("no connection to {}", target));
        }
        reply
    }
}

impl AdminHandler for DefaultAdminHandler {
    fn handle(&mut self, command: &Bundle, port: &Port) -> Bundle {
        let tag = command
            .get(0)
            .and_then(Value::as_tag_text)
            .unwrap_or_default();
        log::debug!("Port {} admin command: {}", port.name(), tag);
        match tag.as_str() {
            "help" => Self::help(),
            "ver" => Self::ver(),
            "list" => Self::list(command, port),
            "add" => Self::add(command, port),
            "del" => Self::del(command, port),
            // Unreachable by construction: the filter only passes
            // reserved tags. Answer with help rather than dying.
            _ => Self::help(),
        }
    }
}
