//! Network transport module
//!
//! Hand-implemented WebSocket transport: upgrade handshake, frame
//! codec, fragmentation, masking, control frames, and the
//! connection/listener machinery built on top of raw TCP streams.

pub mod connection;
pub mod frame;
pub mod handshake;
pub mod listener;
pub mod simple;

pub use connection::{ConnState, Connection, SocketWatcher, WsConn};
pub use listener::{AcceptWatcher, WsListener};
pub use simple::SimpleServer;
