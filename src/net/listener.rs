//! Listening socket module
//!
//! Owns the accept task for one bound address. Every accepted socket
//! gets a fresh monotonic connection id (unique for the lifetime of the
//! listener), is handed to the accept watcher so a session can attach
//! itself, and then starts its own I/O tasks. Stopping closes the
//! listener only; live connections are untouched.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::connection::WsConn;
use crate::fault;

/// Callback invoked on the accept task for every new connection,
/// before its I/O starts.
pub trait AcceptWatcher: Send + Sync {
    fn on_accept(&self, conn: &Arc<WsConn>);
}

struct ListenerShared {
    max_msg_size: u32,
    next_conn_id: AtomicU64,
    watcher: RwLock<Option<Arc<dyn AcceptWatcher>>>,
    listening: AtomicBool,
}

/// WebSocket listener bound to one host:port.
pub struct WsListener {
    host: String,
    shared: Arc<ListenerShared>,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown: RwLock<CancellationToken>,
}

impl WsListener {
    pub fn new(host: impl Into<String>, max_msg_size: u32) -> Self {
        Self {
            host: host.into(),
            shared: Arc::new(ListenerShared {
                max_msg_size,
                next_conn_id: AtomicU64::new(0),
                watcher: RwLock::new(None),
                listening: AtomicBool::new(false),
            }),
            local_addr: RwLock::new(None),
            shutdown: RwLock::new(CancellationToken::new()),
        }
    }

    pub fn set_watcher(&self, watcher: Option<Arc<dyn AcceptWatcher>>) {
        *self.shared.watcher.write() = watcher;
    }

    /// Address actually bound, available after a successful start.
    /// Useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    pub fn is_listening(&self) -> bool {
        self.shared.listening.load(Ordering::SeqCst)
    }

    /// Bind and spawn the accept task. Returns false if the bind fails
    /// or the listener is already running.
    pub fn start(&self) -> bool {
        if self.shared.listening.swap(true, Ordering::SeqCst) {
            return false;
        }
        let std_listener = match std::net::TcpListener::bind(&self.host) {
            Ok(listener) => listener,
            Err(err) => {
                error!(host = %self.host, error = %err, "failed to bind listener");
                self.shared.listening.store(false, Ordering::SeqCst);
                return false;
            }
        };
        if let Err(err) = std_listener.set_nonblocking(true) {
            error!(host = %self.host, error = %err, "failed to configure listener");
            self.shared.listening.store(false, Ordering::SeqCst);
            return false;
        }
        let listener = match TcpListener::from_std(std_listener) {
            Ok(listener) => listener,
            Err(err) => {
                error!(host = %self.host, error = %err, "failed to register listener");
                self.shared.listening.store(false, Ordering::SeqCst);
                return false;
            }
        };
        *self.local_addr.write() = listener.local_addr().ok();

        let token = CancellationToken::new();
        *self.shutdown.write() = token.clone();
        let shared = self.shared.clone();
        fault::spawn_guarded("ws-accept", async move {
            accept_loop(listener, shared, token).await;
        });

        info!(host = %self.host, "listener started");
        true
    }

    /// Close the listener. Existing connections keep running.
    pub fn stop(&self) -> bool {
        if !self.shared.listening.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.read().cancel();
        info!(host = %self.host, "listener stopped");
        true
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ListenerShared>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                if !shared.listening.load(Ordering::SeqCst) {
                    break;
                }
                let _ = stream.set_nodelay(true);
                let id = shared.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(conn_id = id, address = %addr, "accepted connection");

                let conn = WsConn::accepted(stream, id, shared.max_msg_size);
                if let Some(watcher) = shared.watcher.read().clone() {
                    fault::safe_call("accept watcher", || watcher.on_accept(&conn));
                }
                conn.start();
            }
            Err(err) => {
                error!(error = %err, "accept failed");
            }
        }
    }
    debug!("accept loop ended");
}
