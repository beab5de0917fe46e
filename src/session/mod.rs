//! Session layer module
//!
//! Binds transport connections to the tick loop: envelope encoding,
//! the message dispatch registry, server-side sessions with their
//! manager, and the reconnecting client-side session.

pub mod client;
pub mod dispatch;
pub mod manager;

pub use client::SessionClient;
pub use dispatch::{encode_envelope, DispatchRegistry, Message, SessionHandle};
pub use manager::{Session, SessionManager};
