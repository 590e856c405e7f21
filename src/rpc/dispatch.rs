//! RPC dispatch
//!
//! A dispatcher holds a fixed table of methods keyed by tag. Incoming
//! calls resolve their tag, decode their arguments (with trailing
//! defaults), run the handler, and produce the reply frame. Multi-word
//! tags work by concatenation: while the leading tag fails to match,
//! string continuation tokens are joined on with `_` and the lookup
//! retried, so `set pos` resolves `set_pos`. A universal `help` tag
//! lists everything or details one method.

use super::wire::{decode_args, make_fail, make_reply, parse_call, Param};
use crate::admin::ADMIN_TAGS;
use crate::bundle::{Bundle, Value};
use crate::error::{Error, Result};
use crate::port::Port;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Method body: receives decoded arguments, returns the reply value or
/// `None` for `void`
pub type Handler = Box<dyn FnMut(&[Value]) -> Result<Option<Value>> + Send>;

/// One registered method
pub struct Method {
    tag: String,
    version: (i32, i32),
    params: Vec<Param>,
    help: String,
    oneway: bool,
    handler: Handler,
}

impl Method {
    pub fn new(tag: &str) -> MethodBuilder {
        MethodBuilder {
            tag: tag.to_string(),
            version: (1, 0),
            params: Vec::new(),
            help: String::new(),
            oneway: false,
        }
    }

    fn describe(&self) -> String {
        let params: Vec<String> = self.params.iter().map(|p| p.describe()).collect();
        format!(
            "{} v{}.{} ({}){}",
            self.tag,
            self.version.0,
            self.version.1,
            params.join(", "),
            if self.oneway { " [oneway]" } else { "" }
        )
    }
}

/// Builder for [`Method`]
pub struct MethodBuilder {
    tag: String,
    version: (i32, i32),
    params: Vec<Param>,
    help: String,
    oneway: bool,
}

impl MethodBuilder {
    pub fn version(mut self, major: i32, minor: i32) -> Self {
        self.version = (major, minor);
        self
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn help(mut self, text: &str) -> Self {
        self.help = text.to_string();
        self
    }

    /// Declare the method one-way: callers send it without waiting for
    /// a reply frame
    pub fn oneway(mut self) -> Self {
        self.oneway = true;
        self
    }

    pub fn handler<F>(self, handler: F) -> Method
    where
        F: FnMut(&[Value]) -> Result<Option<Value>> + Send + 'static,
    {
        Method {
            tag: self.tag,
            version: self.version,
            params: self.params,
            help: self.help,
            oneway: self.oneway,
            handler: Box::new(handler),
        }
    }
}

/// Fixed method table with tag resolution and help
#[derive(Default)]
pub struct Dispatcher {
    methods: Vec<Method>,
    by_tag: HashMap<String, usize>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method.
    ///
    /// Rejects reserved admin tags, duplicate tags, the universal
    /// `help` tag, and defaults that are not a contiguous trailing run.
    pub fn add(&mut self, method: Method) -> Result<()> {
        if ADMIN_TAGS.contains(&method.tag.as_str()) {
            return Err(Error::Misuse(format!(
                "tag '{}' is reserved for the admin channel",
                method.tag
            )));
        }
        if self.by_tag.contains_key(&method.tag) {
            return Err(Error::Misuse(format!(
                "tag '{}' is already registered",
                method.tag
            )));
        }
        let mut seen_default = false;
        for param in &method.params {
            if param.has_default() {
                seen_default = true;
            } else if seen_default {
                return Err(Error::Misuse(format!(
                    "method '{}': defaults must be a contiguous trailing run",
                    method.tag
                )));
            }
        }
        self.by_tag.insert(method.tag.clone(), self.methods.len());
        self.methods.push(method);
        Ok(())
    }

    /// Process one call frame and produce its reply frame.
    ///
    /// One-way methods still produce a reply bundle; the transport
    /// discards it when the caller did not ask for one.
    pub fn dispatch(&mut self, frame: &Bundle) -> Bundle {
        let call = match parse_call(frame) {
            Ok(call) => call,
            Err(e) => return make_fail(&e.to_string()),
        };

        // Resolve the tag, absorbing continuation tokens on mismatch
        let mut tag = call.tag.clone();
        let mut consumed = 0;
        let index = loop {
            if let Some(&index) = self.by_tag.get(&tag) {
                break Some(index);
            }
            if tag == "help" {
                break None;
            }
            match call.args.get(consumed).and_then(Value::as_tag_text) {
                Some(token) => {
                    tag.push('_');
                    tag.push_str(&token);
                    consumed += 1;
                }
                None => break None,
            }
        };

        let args = &call.args[consumed.min(call.args.len())..];

        let index = match index {
            Some(index) => index,
            None => {
                // `help` is always available, matched or not
                if tag == "help" || call.tag == "help" {
                    return self.help(args);
                }
                return make_fail(&format!(
                    "unrecognized command '{}'; try 'help'",
                    call.tag
                ));
            }
        };

        let method = &mut self.methods[index];
        if call.version.0 != 0 && call.version.0 != method.version.0 {
            log::warn!(
                "Call to '{}' with version {}.{}, serving {}.{}",
                method.tag,
                call.version.0,
                call.version.1,
                method.version.0,
                method.version.1
            );
        }

        let decoded = match decode_args(&method.params, args) {
            Ok(decoded) => decoded,
            Err(e) => return make_fail(&e.to_string()),
        };
        match (method.handler)(&decoded) {
            Ok(value) => make_reply(value),
            Err(e) => make_fail(&e.to_string()),
        }
    }

    /// The universal help reply: every tag, or detail for one
    fn help(&self, args: &[Value]) -> Bundle {
        if let Some(tag) = args.first().and_then(Value::as_tag_text) {
            if let Some(&index) = self.by_tag.get(&tag) {
                let method = &self.methods[index];
                let mut reply = Bundle::new();
                reply.push_str(&method.describe());
                if !method.help.is_empty() {
                    reply.push_str(&method.help);
                }
                return reply;
            }
            return make_fail(&format!("no such command '{}'", tag));
        }
        let mut reply = Bundle::new();
        reply.push_str("help [command]");
        for method in &self.methods {
            reply.push_str(&method.describe());
        }
        reply
    }

    /// Serve a single request from the port: read, dispatch, reply.
    /// False when the read failed (interrupt, close, timeout).
    pub fn serve_once(&mut self, port: &Port) -> bool {
        let request = match port.read(true) {
            Some(request) => request,
            None => return false,
        };
        let reply = self.dispatch(&request);
        port.reply(&reply)
    }

    /// Serve until the flag clears or the port goes down
    pub fn serve_while(&mut self, port: &Port, running: &AtomicBool) {
        while running.load(Ordering::Relaxed) {
            if !self.serve_once(port) && port.is_interrupted() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::wire::{make_call, EnumTable};
    use super::*;

    fn speed_dispatcher() -> Dispatcher {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .add(
                Method::new("set_speed")
                    .param(Param::f64("speed"))
                    .param(Param::i32("ramp").with_default(Value::Int32(100)))
                    .help("set wheel speed with optional ramp time")
                    .handler(|args| {
                        let speed = args[0].as_f64().unwrap();
                        let ramp = args[1].as_i32().unwrap();
                        Ok(Some(Value::Str(format!("{}@{}", speed, ramp))))
                    }),
            )
            .unwrap();
        dispatcher
            .add(
                Method::new("stop")
                    .oneway()
                    .handler(|_| Ok(None)),
            )
            .unwrap();
        dispatcher
    }

    #[test]
    fn test_dispatch_and_defaults() {
        let mut d = speed_dispatcher();
        let full = d.dispatch(&make_call(
            "set_speed",
            (1, 0),
            &[Value::Float64(0.5), Value::Int32(50)],
        ));
        assert_eq!(full.get(0).unwrap().as_str(), Some("0.5@50"));

        // Omitting the defaulted trailing argument behaves as if the
        // default had been sent explicitly
        let defaulted = d.dispatch(&make_call("set_speed", (1, 0), &[Value::Float64(0.5)]));
        let explicit = d.dispatch(&make_call(
            "set_speed",
            (1, 0),
            &[Value::Float64(0.5), Value::Int32(100)],
        ));
        assert_eq!(defaulted, explicit);
    }

    #[test]
    fn test_void_reply() {
        let mut d = speed_dispatcher();
        let reply = d.dispatch(&make_call("stop", (1, 0), &[]));
        assert!(reply.is_empty());
    }

    #[test]
    fn test_multi_word_tag_concatenation() {
        let mut d = speed_dispatcher();
        // "set speed 0.5" resolves set_speed with the remaining args
        let mut frame = Bundle::new();
        frame.push_str("set");
        frame.push_str("speed");
        frame.push_f64(0.5);
        let reply = d.dispatch(&frame);
        assert_eq!(reply.get(0).unwrap().as_str(), Some("0.5@100"));
    }

    #[test]
    fn test_help_fallback() {
        let mut d = speed_dispatcher();
        let mut frame = Bundle::new();
        frame.push_str("help");
        let listing = d.dispatch(&frame);
        let text = listing.to_text();
        assert!(text.contains("set_speed"));
        assert!(text.contains("stop"));

        let mut frame = Bundle::new();
        frame.push_str("help");
        frame.push_str("set_speed");
        let detail = d.dispatch(&frame);
        assert!(detail.to_text().contains("ramp"));
    }

    #[test]
    fn test_unrecognized_tag() {
        let mut d = speed_dispatcher();
        let reply = d.dispatch(&make_call("warp", (1, 0), &[]));
        assert!(super::super::wire::is_fail(&reply));
        assert!(reply.to_text().contains("help"));
    }

    #[test]
    fn test_admin_tags_rejected() {
        let mut d = Dispatcher::new();
        let result = d.add(Method::new("help").handler(|_| Ok(None)));
        assert!(result.is_err());
        let result = d.add(Method::new("del").handler(|_| Ok(None)));
        assert!(result.is_err());
    }

    #[test]
    fn test_non_trailing_default_rejected() {
        let mut d = Dispatcher::new();
        let result = d.add(
            Method::new("bad")
                .param(Param::i32("a").with_default(Value::Int32(0)))
                .param(Param::i32("b"))
                .handler(|_| Ok(None)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_enum_param_dispatch() {
        let table = EnumTable::new("gait", &[(0, "walk"), (1, "trot")]);
        let mut d = Dispatcher::new();
        d.add(
            Method::new("set_gait")
                .param(Param::enumeration("gait", table))
                .handler(|args| Ok(Some(Value::Int32(args[0].as_i32().unwrap())))),
        )
        .unwrap();

        let ok = d.dispatch(&make_call("set_gait", (1, 0), &[Value::Int32(1)]));
        assert_eq!(ok.get(0).unwrap().as_i32(), Some(1));

        let bad = d.dispatch(&make_call("set_gait", (1, 0), &[Value::Int32(7)]));
        assert!(super::super::wire::is_fail(&bad));
    }
}
