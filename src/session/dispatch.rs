//! Message dispatch module
//!
//! The envelope is the application's framing inside a logical message:
//! a 4-byte little-endian message id followed by codec-encoded fields
//! in message-specific order. The registry maps ids to a factory and a
//! handler; it is append-only during setup, so steady-state lookups
//! need no locking. Unknown ids are dropped silently for forward
//! compatibility, and handler panics are contained per message.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::codec::{CodecPool, Packer, Unpacker};
use crate::error::{CodecError, ProtocolError, Result};
use crate::fault;

/// Size of the message id leading every envelope.
pub const ENVELOPE_ID_SIZE: usize = 4;

/// One application message type: identity plus field encoding.
pub trait Message: Send {
    fn msg_id(&self) -> u32;
    fn encode(&self, packer: &mut Packer);
    fn decode(&mut self, unpacker: &mut Unpacker) -> std::result::Result<(), CodecError>;
    /// Downcast support for handlers.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// The session surface handlers see: identity, send paths, the opaque
/// user tag, and teardown. Implemented by both server-side sessions
/// and the client session.
pub trait SessionHandle: Send + Sync {
    fn id(&self) -> u64;
    fn remote_addr(&self) -> String;
    /// Encode through the codec pool and queue on the connection.
    fn send_message(&self, msg: &dyn Message);
    /// Queue pre-encoded envelope bytes.
    fn send_bytes(&self, data: Bytes);
    fn close(&self);
    fn set_tag(&self, tag: Option<Arc<dyn Any + Send + Sync>>);
    fn tag(&self) -> Option<Arc<dyn Any + Send + Sync>>;
}

pub type MessageFactory = Box<dyn Fn() -> Box<dyn Message> + Send + Sync>;
pub type MessageHandler = Box<dyn Fn(&dyn SessionHandle, &mut dyn Message, bool) + Send + Sync>;
pub type SessionCallback = Box<dyn Fn(&dyn SessionHandle) + Send + Sync>;

struct MessageProxy {
    factory: MessageFactory,
    handler: MessageHandler,
}

/// Message id to (factory, handler) table plus the session lifecycle
/// callbacks. Registered once at setup, read-only afterwards.
pub struct DispatchRegistry {
    handlers: HashMap<u32, MessageProxy>,
    on_open: Option<SessionCallback>,
    on_close: Option<SessionCallback>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            on_open: None,
            on_close: None,
        }
    }

    /// Register a message type. Fails if the id is already taken;
    /// registrations never replace each other.
    pub fn register(
        &mut self,
        msg_id: u32,
        factory: MessageFactory,
        handler: MessageHandler,
    ) -> Result<()> {
        if self.handlers.contains_key(&msg_id) {
            return Err(ProtocolError::DuplicateHandler(msg_id).into());
        }
        self.handlers.insert(msg_id, MessageProxy { factory, handler });
        Ok(())
    }

    pub fn on_session_open(&mut self, callback: SessionCallback) {
        self.on_open = Some(callback);
    }

    pub fn on_session_close(&mut self, callback: SessionCallback) {
        self.on_close = Some(callback);
    }

    /// Decode one envelope and invoke its handler. An unregistered id
    /// is dropped without error; a field decode failure still reaches
    /// the handler, flagged through `decode_ok`. Handler panics are
    /// caught here and never abort the dispatch loop.
    pub fn dispatch(&self, session: &dyn SessionHandle, data: &[u8], unpacker: &mut Unpacker) {
        if data.len() < ENVELOPE_ID_SIZE {
            trace!(len = data.len(), "envelope shorter than a message id");
            return;
        }
        let msg_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let Some(proxy) = self.handlers.get(&msg_id) else {
            trace!(msg_id = msg_id, "no handler registered, dropping");
            return;
        };
        fault::safe_call("message handler", || {
            let mut msg = (proxy.factory)();
            unpacker.attach(&data[ENVELOPE_ID_SIZE..]);
            let decode_ok = msg.decode(unpacker).is_ok();
            (proxy.handler)(session, msg.as_mut(), decode_ok);
        });
    }

    pub fn notify_open(&self, session: &dyn SessionHandle) {
        if let Some(callback) = &self.on_open {
            fault::safe_call("session open callback", || callback(session));
        }
    }

    pub fn notify_close(&self, session: &dyn SessionHandle) {
        if let Some(callback) = &self.on_close {
            fault::safe_call("session close callback", || callback(session));
        }
    }
}

impl Default for DispatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the wire envelope for a message: id, then fields. Encoding
/// happens once per call; broadcast paths reuse the returned `Bytes`
/// for every recipient.
pub fn encode_envelope(pool: &CodecPool, msg: &dyn Message) -> Bytes {
    let mut packer = pool.acquire_packer();
    msg.encode(&mut packer);
    let mut out = BytesMut::with_capacity(ENVELOPE_ID_SIZE + packer.len());
    out.put_u32_le(msg.msg_id());
    out.put_slice(packer.as_bytes());
    pool.release_packer(packer);
    out.freeze()
}
