//! RPC: synchronous request/reply over a port
//!
//! The call side serializes a tagged frame and blocks for exactly one
//! reply on the same connection; the serve side resolves the tag
//! against a fixed [`Dispatcher`] table. One-way calls skip the reply
//! wait but still ride the carrier's frame acknowledgment, so the
//! connection is never left mid-message.

mod dispatch;
mod wire;

pub use dispatch::{Dispatcher, Handler, Method, MethodBuilder};
pub use wire::{
    decode_args, is_fail, make_call, make_fail, make_reply, parse_call, Call, EnumTable, Param,
    ParamType,
};

use crate::bundle::{Bundle, Value};
use crate::error::{Error, Result};
use crate::port::Port;

/// Call-side helper that frames method invocations the way generated
/// stubs would.
///
/// ```no_run
/// use setu::rpc::RpcClient;
/// use setu::{Port, Value};
///
/// # fn main() -> setu::Result<()> {
/// let port = Port::open("/motor/client")?;
/// // ... port.add_output(...) ...
/// let client = RpcClient::new(&port);
/// let reply = client.call("set_speed", &[Value::Float64(0.5)])?;
/// # let _ = reply;
/// # Ok(())
/// # }
/// ```
pub struct RpcClient<'a> {
    port: &'a Port,
    version: (i32, i32),
}

impl<'a> RpcClient<'a> {
    pub fn new(port: &'a Port) -> Self {
        Self {
            port,
            version: (1, 0),
        }
    }

    pub fn with_version(port: &'a Port, version: (i32, i32)) -> Self {
        Self { port, version }
    }

    /// Invoke a method and wait for its reply frame. A `fail` reply
    /// becomes an error.
    pub fn call(&self, tag: &str, args: &[Value]) -> Result<Bundle> {
        let frame = make_call(tag, self.version, args);
        let reply = self.port.call(&frame)?;
        if is_fail(&reply) {
            let message = reply
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("remote failure");
            return Err(Error::Protocol(message.to_string()));
        }
        Ok(reply)
    }

    /// Invoke a one-way method: no reply frame is read, but the send
    /// still completes the carrier's frame acknowledgment.
    pub fn call_oneway(&self, tag: &str, args: &[Value]) -> Result<()> {
        let frame = make_call(tag, self.version, args);
        if self.port.write(&frame) {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "one-way call '{}' was not delivered",
                tag
            )))
        }
    }
}
