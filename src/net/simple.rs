//! Callback-style server variant
//!
//! A session-less alternative to the session layer: closures for
//! open/close/message keyed by connection id, with send, kick and
//! broadcast by id. Callbacks fire on the connections' I/O tasks, so
//! they run concurrently; anything needing tick-ordered processing
//! belongs in the session layer instead.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use super::connection::{Connection, SocketWatcher, WsConn};
use super::listener::{AcceptWatcher, WsListener};

type OpenFn = Box<dyn Fn(u64) + Send + Sync>;
type CloseFn = Box<dyn Fn(u64) + Send + Sync>;
type MessageFn = Box<dyn Fn(u64, Bytes) + Send + Sync>;

struct SimpleShared {
    conns: RwLock<HashMap<u64, Arc<dyn Connection>>>,
    on_open: RwLock<Option<OpenFn>>,
    on_close: RwLock<Option<CloseFn>>,
    on_message: RwLock<Option<MessageFn>>,
}

impl SocketWatcher for SimpleShared {
    fn on_open(&self, conn: &Arc<dyn Connection>) {
        self.conns.write().insert(conn.id(), conn.clone());
        if let Some(callback) = self.on_open.read().as_ref() {
            callback(conn.id());
        }
    }

    fn on_message(&self, conn: &Arc<dyn Connection>, data: Bytes) {
        if let Some(callback) = self.on_message.read().as_ref() {
            callback(conn.id(), data);
        }
    }

    fn on_close(&self, conn: &Arc<dyn Connection>) {
        self.conns.write().remove(&conn.id());
        if let Some(callback) = self.on_close.read().as_ref() {
            callback(conn.id());
        }
    }
}

struct SimpleAccept(Arc<SimpleShared>);

impl AcceptWatcher for SimpleAccept {
    fn on_accept(&self, conn: &Arc<WsConn>) {
        conn.set_watcher(Some(self.0.clone()));
    }
}

/// Minimal WebSocket server: no sessions, no dispatch, just callbacks.
pub struct SimpleServer {
    listener: WsListener,
    shared: Arc<SimpleShared>,
}

impl SimpleServer {
    pub fn new(host: impl Into<String>, max_msg_size: u32) -> Self {
        Self {
            listener: WsListener::new(host, max_msg_size),
            shared: Arc::new(SimpleShared {
                conns: RwLock::new(HashMap::new()),
                on_open: RwLock::new(None),
                on_close: RwLock::new(None),
                on_message: RwLock::new(None),
            }),
        }
    }

    /// Register the open callback. Set before `start`.
    pub fn on_client_open(&self, callback: impl Fn(u64) + Send + Sync + 'static) {
        *self.shared.on_open.write() = Some(Box::new(callback));
    }

    pub fn on_client_close(&self, callback: impl Fn(u64) + Send + Sync + 'static) {
        *self.shared.on_close.write() = Some(Box::new(callback));
    }

    pub fn on_client_message(&self, callback: impl Fn(u64, Bytes) + Send + Sync + 'static) {
        *self.shared.on_message.write() = Some(Box::new(callback));
    }

    pub fn start(&self) -> bool {
        self.listener
            .set_watcher(Some(Arc::new(SimpleAccept(self.shared.clone()))));
        self.listener.start()
    }

    pub fn stop(&self) -> bool {
        if !self.listener.stop() {
            return false;
        }
        self.shared.conns.write().clear();
        true
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn client_count(&self) -> usize {
        if !self.listener.is_listening() {
            return 0;
        }
        self.shared.conns.read().len()
    }

    pub fn send(&self, id: u64, data: Bytes) {
        if let Some(conn) = self.shared.conns.read().get(&id) {
            conn.send(data);
        }
    }

    pub fn send_text(&self, id: u64, text: &str) {
        if let Some(conn) = self.shared.conns.read().get(&id) {
            conn.send_text(text);
        }
    }

    /// Push the same bytes to every connected client.
    pub fn broadcast(&self, data: Bytes) {
        for conn in self.shared.conns.read().values() {
            conn.send(data.clone());
        }
    }

    pub fn broadcast_text(&self, text: &str) {
        for conn in self.shared.conns.read().values() {
            conn.send_text(text);
        }
    }

    pub fn kick(&self, id: u64) {
        if let Some(conn) = self.shared.conns.read().get(&id) {
            conn.close();
        }
    }

    pub fn kick_all(&self) {
        for conn in self.shared.conns.read().values() {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_simple_server_echo() {
        let server = SimpleServer::new("127.0.0.1:0", 65536);
        let (open_tx, mut open_rx) = unbounded_channel();
        let (msg_tx, mut msg_rx) = unbounded_channel();
        server.on_client_open(move |id| {
            let _ = open_tx.send(id);
        });
        server.on_client_message(move |id, data| {
            let _ = msg_tx.send((id, data));
        });
        assert!(server.start());
        let addr = server.local_addr().unwrap().to_string();

        let client = WsConn::connect(&addr, "/", 1, 65536).await.unwrap();
        client.start();

        let opened = timeout(Duration::from_secs(5), open_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.client_count(), 1);

        client.send(Bytes::from_static(b"ping me"));
        let (from, data) = timeout(Duration::from_secs(5), msg_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, opened);
        assert_eq!(&data[..], b"ping me");

        server.send(opened, Bytes::from_static(b"reply"));
        server.stop();
        assert_eq!(server.client_count(), 0);
    }
}
