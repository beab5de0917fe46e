//! Client session module
//!
//! A session over one outbound connection. Socket events queue on the
//! client's own event queue and are processed on the tick; whenever a
//! Close event is processed the client re-dials on a fixed backoff,
//! until a connect succeeds or `stop` is called. State becomes
//! connected only once the Open event is drained, not when the dial
//! returns.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::CodecPool;
use crate::error::Result;
use crate::event::{EventQueue, SocketEvent};
use crate::fault;
use crate::module::Module;
use crate::net::{Connection, SocketWatcher, WsConn};
use crate::session::dispatch::{
    encode_envelope, DispatchRegistry, Message, MessageFactory, MessageHandler, SessionCallback,
    SessionHandle,
};

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

/// State shared with the connection watcher and the dial task.
struct ClientShared {
    events: EventQueue<SocketEvent>,
    conn: RwLock<Option<Arc<WsConn>>>,
    state: AtomicU8,
    stopped: AtomicBool,
    tag: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl SocketWatcher for ClientShared {
    fn on_open(&self, _conn: &Arc<dyn Connection>) {
        self.events.push(SocketEvent::Open);
    }

    fn on_message(&self, _conn: &Arc<dyn Connection>, data: Bytes) {
        self.events.push(SocketEvent::Message(data));
    }

    fn on_close(&self, _conn: &Arc<dyn Connection>) {
        self.events.push(SocketEvent::Close);
    }
}

/// Client-role session with automatic reconnect.
pub struct SessionClient {
    name: String,
    addr: String,
    path: String,
    max_msg_size: u32,
    reconnect_secs: u32,
    registry: DispatchRegistry,
    pool: Arc<CodecPool>,
    shared: Arc<ClientShared>,
    event_buf: VecDeque<SocketEvent>,
}

impl SessionClient {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        path: impl Into<String>,
        max_msg_size: u32,
        reconnect_secs: u32,
        pool: Arc<CodecPool>,
    ) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            path: path.into(),
            max_msg_size,
            reconnect_secs,
            registry: DispatchRegistry::new(),
            pool,
            shared: Arc::new(ClientShared {
                events: EventQueue::new(),
                conn: RwLock::new(None),
                state: AtomicU8::new(STATE_DISCONNECTED),
                stopped: AtomicBool::new(false),
                tag: Mutex::new(None),
            }),
            event_buf: VecDeque::new(),
        }
    }

    /// Register a message type. Setup-time only.
    pub fn register_message(
        &mut self,
        msg_id: u32,
        factory: MessageFactory,
        handler: MessageHandler,
    ) -> Result<()> {
        self.registry.register(msg_id, factory, handler)
    }

    pub fn on_session_open(&mut self, callback: SessionCallback) {
        self.registry.on_session_open(callback);
    }

    pub fn on_session_close(&mut self, callback: SessionCallback) {
        self.registry.on_session_close(callback);
    }

    /// True once the Open event has been processed and until the next
    /// Close is.
    pub fn is_connected(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == STATE_CONNECTED
    }

    /// Dial until one attempt succeeds, sleeping the configured backoff
    /// between failures. No-op unless fully disconnected.
    fn reconnect(&self) {
        if self
            .shared
            .state
            .compare_exchange(
                STATE_DISCONNECTED,
                STATE_CONNECTING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        let shared = self.shared.clone();
        let addr = self.addr.clone();
        let path = self.path.clone();
        let max_msg_size = self.max_msg_size;
        let backoff = Duration::from_secs(self.reconnect_secs as u64);
        fault::spawn_guarded("client-reconnect", async move {
            loop {
                if shared.stopped.load(Ordering::SeqCst) {
                    shared.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                    return;
                }
                match WsConn::connect(&addr, &path, 0, max_msg_size).await {
                    Ok(conn) => {
                        conn.set_watcher(Some(shared.clone()));
                        conn.start();
                        *shared.conn.write() = Some(conn);
                        return;
                    }
                    Err(err) => {
                        warn!(addr = %addr, error = %err, "connect failed, retrying");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        });
    }

    fn handle_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::Open => {
                self.shared.state.store(STATE_CONNECTED, Ordering::SeqCst);
                info!(name = %self.name, addr = %self.addr, "session connected");
                self.registry.notify_open(self);
            }
            SocketEvent::Close => {
                self.shared.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                debug!(name = %self.name, "session disconnected");
                if !self.shared.stopped.load(Ordering::SeqCst) {
                    self.reconnect();
                }
                self.registry.notify_close(self);
            }
            SocketEvent::Message(data) => {
                let mut unpacker = self.pool.acquire_unpacker();
                self.registry.dispatch(self, &data, &mut unpacker);
                self.pool.release_unpacker(unpacker);
            }
        }
    }

    pub fn start(&mut self) -> bool {
        self.shared.stopped.store(false, Ordering::SeqCst);
        self.reconnect();
        true
    }

    pub fn stop(&mut self) -> bool {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(conn) = self.shared.conn.write().take() {
            conn.set_watcher(None);
            conn.close();
        }
        self.shared
            .state
            .store(STATE_DISCONNECTED, Ordering::SeqCst);
        true
    }

    /// One tick: drain and process queued socket events in order.
    pub fn run(&mut self) {
        self.shared.events.drain(&mut self.event_buf);
        while let Some(event) = self.event_buf.pop_front() {
            self.handle_event(event);
        }
    }
}

impl SessionHandle for SessionClient {
    fn id(&self) -> u64 {
        self.shared
            .conn
            .read()
            .as_ref()
            .map(|conn| conn.id())
            .unwrap_or(0)
    }

    fn remote_addr(&self) -> String {
        self.shared
            .conn
            .read()
            .as_ref()
            .map(|conn| conn.remote_addr())
            .unwrap_or_default()
    }

    fn send_message(&self, msg: &dyn Message) {
        self.send_bytes(encode_envelope(&self.pool, msg));
    }

    fn send_bytes(&self, data: Bytes) {
        if let Some(conn) = self.shared.conn.read().as_ref() {
            conn.send(data);
        }
    }

    fn close(&self) {
        if let Some(conn) = self.shared.conn.read().as_ref() {
            conn.close();
        }
    }

    fn set_tag(&self, tag: Option<Arc<dyn Any + Send + Sync>>) {
        *self.shared.tag.lock() = tag;
    }

    fn tag(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.shared.tag.lock().clone()
    }
}

impl Module for SessionClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> bool {
        SessionClient::start(self)
    }

    fn stop(&mut self) -> bool {
        SessionClient::stop(self)
    }

    fn run(&mut self) {
        SessionClient::run(self);
    }
}
