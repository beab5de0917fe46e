//! Session manager module
//!
//! Server-side sessions and their manager. A session binds one
//! accepted connection to the manager's dispatch registry; its watcher
//! impl queues lifecycle events on the manager and message bytes on
//! itself, and everything queued is processed on the next `run` tick:
//! lifecycle first (admission, map upkeep, callbacks), then per-session
//! message dispatch in strict arrival order.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::codec::CodecPool;
use crate::error::Result;
use crate::event::EventQueue;
use crate::fault;
use crate::module::Module;
use crate::net::{AcceptWatcher, Connection, SocketWatcher, WsConn, WsListener};
use crate::session::dispatch::{
    encode_envelope, DispatchRegistry, Message, MessageFactory, MessageHandler, SessionCallback,
    SessionHandle,
};

/// Raw-interception hook: sees every inbound message's bytes before
/// envelope decoding. Returning true consumes the message and skips
/// normal dispatch for it.
pub type RawHook = Box<dyn Fn(&Arc<dyn Connection>, &Bytes) -> bool + Send + Sync>;

enum LifecycleEvent {
    Open(Arc<Session>),
    Close(Arc<Session>),
}

/// State shared between the manager and the watchers running on
/// connection tasks.
struct ManagerShared {
    lifecycle: EventQueue<LifecycleEvent>,
    hook: Option<RawHook>,
    pool: Arc<CodecPool>,
}

/// One connected client as the application sees it. Holds a reference
/// to its connection, never lifecycle authority over it.
pub struct Session {
    conn: Arc<dyn Connection>,
    messages: EventQueue<Bytes>,
    tag: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    skip: AtomicBool,
    shared: Arc<ManagerShared>,
    me: Weak<Session>,
}

impl Session {
    fn attach(conn: Arc<dyn Connection>, shared: Arc<ManagerShared>) -> Arc<Self> {
        Arc::new_cyclic(|me| Session {
            conn,
            messages: EventQueue::new(),
            tag: Mutex::new(None),
            skip: AtomicBool::new(false),
            shared,
            me: me.clone(),
        })
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// While set, drained messages are discarded instead of dispatched.
    pub fn skip_messages(&self, skip: bool) {
        self.skip.store(skip, Ordering::SeqCst);
    }

    pub fn is_skipping(&self) -> bool {
        self.skip.load(Ordering::SeqCst)
    }
}

impl SocketWatcher for Session {
    fn on_open(&self, _conn: &Arc<dyn Connection>) {
        if let Some(me) = self.me.upgrade() {
            self.shared.lifecycle.push(LifecycleEvent::Open(me));
        }
    }

    fn on_message(&self, conn: &Arc<dyn Connection>, data: Bytes) {
        if let Some(hook) = &self.shared.hook {
            let consumed =
                fault::safe_call_with("raw hook", || hook(conn, &data)).unwrap_or(false);
            if consumed {
                return;
            }
        }
        self.messages.push(data);
    }

    fn on_close(&self, conn: &Arc<dyn Connection>) {
        conn.set_watcher(None);
        if let Some(me) = self.me.upgrade() {
            self.shared.lifecycle.push(LifecycleEvent::Close(me));
        }
    }
}

impl SessionHandle for Session {
    fn id(&self) -> u64 {
        self.conn.id()
    }

    fn remote_addr(&self) -> String {
        self.conn.remote_addr()
    }

    fn send_message(&self, msg: &dyn Message) {
        self.conn.send(encode_envelope(&self.shared.pool, msg));
    }

    fn send_bytes(&self, data: Bytes) {
        self.conn.send(data);
    }

    fn close(&self) {
        self.conn.close();
    }

    fn set_tag(&self, tag: Option<Arc<dyn Any + Send + Sync>>) {
        *self.tag.lock() = tag;
    }

    fn tag(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.tag.lock().clone()
    }
}

/// Bridges listener accepts onto sessions: every new connection gets a
/// session attached as its watcher before its I/O starts.
struct ManagerAccept(Arc<ManagerShared>);

impl AcceptWatcher for ManagerAccept {
    fn on_accept(&self, conn: &Arc<WsConn>) {
        let as_conn: Arc<dyn Connection> = conn.clone();
        let session = Session::attach(as_conn, self.0.clone());
        conn.set_watcher(Some(session));
    }
}

/// Owns the listener, the live session map, admission, dispatch and
/// broadcast. Driven by the external tick through the Module contract;
/// the session map is touched only on the tick thread.
pub struct SessionManager {
    name: String,
    listener: WsListener,
    registry: DispatchRegistry,
    shared: Arc<ManagerShared>,
    sessions: HashMap<u64, Arc<Session>>,
    max_sessions: u32,
    event_buf: VecDeque<LifecycleEvent>,
    msg_buf: VecDeque<Bytes>,
}

impl SessionManager {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        max_msg_size: u32,
        max_sessions: u32,
        pool: Arc<CodecPool>,
    ) -> Self {
        Self::with_hook(name, host, max_msg_size, max_sessions, pool, None)
    }

    /// Manager with a raw-interception hook applied ahead of dispatch.
    pub fn with_hook(
        name: impl Into<String>,
        host: impl Into<String>,
        max_msg_size: u32,
        max_sessions: u32,
        pool: Arc<CodecPool>,
        hook: Option<RawHook>,
    ) -> Self {
        Self {
            name: name.into(),
            listener: WsListener::new(host, max_msg_size),
            registry: DispatchRegistry::new(),
            shared: Arc::new(ManagerShared {
                lifecycle: EventQueue::new(),
                hook,
                pool,
            }),
            sessions: HashMap::new(),
            max_sessions,
            event_buf: VecDeque::new(),
            msg_buf: VecDeque::new(),
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

    /// Bound address, available once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn get_session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn for_each_session<F>(&self, mut f: F)
    where
        F: FnMut(&Session),
    {
        for session in self.sessions.values() {
            f(session);
        }
    }

    /// Encode once, queue the same bytes on every live session.
    pub fn broadcast(&self, msg: &dyn Message) {
        let data = encode_envelope(&self.shared.pool, msg);
        for session in self.sessions.values() {
            session.send_bytes(data.clone());
        }
    }

    pub fn kick(&self, id: u64) {
        if let Some(session) = self.sessions.get(&id) {
            session.close();
        }
    }

    pub fn kick_all(&self) {
        for session in self.sessions.values() {
            session.close();
        }
    }

    fn handle_events(&mut self) {
        self.shared.lifecycle.drain(&mut self.event_buf);
        while let Some(event) = self.event_buf.pop_front() {
            match event {
                LifecycleEvent::Open(session) => {
                    if self.sessions.len() as u32 >= self.max_sessions {
                        // Over capacity: the connection never becomes a
                        // visible session.
                        debug!(
                            conn_id = session.id(),
                            max = self.max_sessions,
                            "session limit reached, closing connection"
                        );
                        session.conn.close();
                        continue;
                    }
                    self.sessions.insert(session.id(), session.clone());
                    self.registry.notify_open(session.as_ref());
                }
                LifecycleEvent::Close(session) => {
                    if self.sessions.remove(&session.id()).is_some() {
                        self.registry.notify_close(session.as_ref());
                    }
                }
            }
        }
    }

    fn handle_messages(&mut self) {
        let mut unpacker = self.shared.pool.acquire_unpacker();
        for session in self.sessions.values() {
            session.messages.drain(&mut self.msg_buf);
            while let Some(data) = self.msg_buf.pop_front() {
                if session.is_skipping() {
                    continue;
                }
                self.registry.dispatch(session.as_ref(), &data, &mut unpacker);
            }
        }
        self.shared.pool.release_unpacker(unpacker);
    }

    pub fn start(&mut self) -> bool {
        self.sessions.clear();
        self.listener
            .set_watcher(Some(Arc::new(ManagerAccept(self.shared.clone()))));
        if !self.listener.start() {
            return false;
        }
        info!(name = %self.name, "session manager started");
        true
    }

    /// Stop accepting and abandon the session map. Live connections
    /// are not individually closed; their teardown happens whenever
    /// the transport goes away.
    pub fn stop(&mut self) -> bool {
        if !self.listener.stop() {
            return false;
        }
        self.listener.set_watcher(None);
        self.sessions.clear();
        info!(name = %self.name, "session manager stopped");
        true
    }

    /// One tick: lifecycle events first, then message dispatch.
    pub fn run(&mut self) {
        self.handle_events();
        self.handle_messages();
    }
}

impl Module for SessionManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> bool {
        SessionManager::start(self)
    }

    fn stop(&mut self) -> bool {
        SessionManager::stop(self)
    }

    fn run(&mut self) {
        SessionManager::run(self);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use parking_lot::RwLock;

    use super::*;
    use crate::codec::{Packer, Unpacker};
    use crate::error::CodecError;
    use crate::net::ConnState;

    struct FakeConn {
        id: u64,
        closed: AtomicBool,
        sent: Mutex<Vec<Bytes>>,
        watcher: RwLock<Option<Arc<dyn SocketWatcher>>>,
    }

    impl FakeConn {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                closed: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
                watcher: RwLock::new(None),
            })
        }
    }

    impl Connection for FakeConn {
        fn id(&self) -> u64 {
            self.id
        }
        fn state(&self) -> ConnState {
            ConnState::Connected
        }
        fn local_addr(&self) -> String {
            String::new()
        }
        fn remote_addr(&self) -> String {
            "127.0.0.1:1".to_string()
        }
        fn path(&self) -> String {
            "/".to_string()
        }
        fn send(&self, data: Bytes) {
            self.sent.lock().push(data);
        }
        fn send_text(&self, _text: &str) {}
        fn ping(&self) {}
        fn close(&self) -> bool {
            self.closed.store(true, Ordering::SeqCst);
            true
        }
        fn set_watcher(&self, watcher: Option<Arc<dyn SocketWatcher>>) {
            *self.watcher.write() = watcher;
        }
        fn watcher(&self) -> Option<Arc<dyn SocketWatcher>> {
            self.watcher.read().clone()
        }
    }

    struct SeqMsg {
        value: u32,
    }

    impl Message for SeqMsg {
        fn msg_id(&self) -> u32 {
            0x21
        }
        fn encode(&self, packer: &mut Packer) {
            packer.pack_u32(self.value);
        }
        fn decode(&mut self, unpacker: &mut Unpacker) -> std::result::Result<(), CodecError> {
            self.value = unpacker.unpack_u32()?;
            Ok(())
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn test_manager(max_sessions: u32) -> SessionManager {
        SessionManager::new(
            "test",
            "127.0.0.1:0",
            65536,
            max_sessions,
            Arc::new(CodecPool::new(4)),
        )
    }

    fn open_session(manager: &SessionManager, conn: &Arc<FakeConn>) -> Arc<Session> {
        let as_conn: Arc<dyn Connection> = conn.clone();
        let session = Session::attach(as_conn.clone(), manager.shared.clone());
        session.on_open(&as_conn);
        session
    }

    #[test]
    fn test_open_event_creates_session_on_tick() {
        let mut manager = test_manager(8);
        let conn = FakeConn::new(1);
        open_session(&manager, &conn);

        // Nothing visible until the tick drains the event.
        assert_eq!(manager.count(), 0);
        manager.run();
        assert_eq!(manager.count(), 1);
        assert!(manager.get_session(1).is_some());
    }

    #[test]
    fn test_capacity_rejects_connection_without_session() {
        let mut manager = test_manager(1);
        let first = FakeConn::new(1);
        let second = FakeConn::new(2);
        open_session(&manager, &first);
        open_session(&manager, &second);

        manager.run();
        assert_eq!(manager.count(), 1);
        assert!(manager.get_session(2).is_none());
        assert!(second.closed.load(Ordering::SeqCst));
        assert!(!first.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_close_event_removes_and_notifies() {
        let mut manager = test_manager(8);
        let closes = Arc::new(AtomicU32::new(0));
        let closes_in_cb = closes.clone();
        manager.on_session_close(Box::new(move |_| {
            closes_in_cb.fetch_add(1, Ordering::SeqCst);
        }));

        let conn = FakeConn::new(1);
        let session = open_session(&manager, &conn);
        manager.run();
        assert_eq!(manager.count(), 1);

        let as_conn: Arc<dyn Connection> = conn.clone();
        session.on_close(&as_conn);
        manager.run();
        assert_eq!(manager.count(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // A second close for the same session is ignored.
        session.on_close(&as_conn);
        manager.run();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_messages_dispatch_in_fifo_order() {
        let mut manager = test_manager(8);
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_in_handler = order.clone();
        manager
            .register_message(
                0x21,
                Box::new(|| Box::new(SeqMsg { value: 0 })),
                Box::new(move |_, msg, decode_ok| {
                    assert!(decode_ok);
                    let msg = msg.as_any_mut().downcast_mut::<SeqMsg>().unwrap();
                    order_in_handler.lock().push(msg.value);
                }),
            )
            .unwrap();

        let conn = FakeConn::new(1);
        let session = open_session(&manager, &conn);
        manager.run();

        let as_conn: Arc<dyn Connection> = conn.clone();
        let pool = CodecPool::disabled();
        for value in [3u32, 1, 4, 1, 5] {
            session.on_message(&as_conn, encode_envelope(&pool, &SeqMsg { value }));
        }
        manager.run();
        assert_eq!(*order.lock(), vec![3, 1, 4, 1, 5]);
    }

    #[test]
    fn test_skip_discards_messages() {
        let mut manager = test_manager(8);
        let hits = Arc::new(AtomicU32::new(0));
        let hits_in_handler = hits.clone();
        manager
            .register_message(
                0x21,
                Box::new(|| Box::new(SeqMsg { value: 0 })),
                Box::new(move |_, _, _| {
                    hits_in_handler.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let conn = FakeConn::new(1);
        let session = open_session(&manager, &conn);
        manager.run();

        session.skip_messages(true);
        let as_conn: Arc<dyn Connection> = conn.clone();
        let pool = CodecPool::disabled();
        session.on_message(&as_conn, encode_envelope(&pool, &SeqMsg { value: 1 }));
        manager.run();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        session.skip_messages(false);
        session.on_message(&as_conn, encode_envelope(&pool, &SeqMsg { value: 2 }));
        manager.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_broadcast_shares_one_encoding() {
        let mut manager = test_manager(8);
        let first = FakeConn::new(1);
        let second = FakeConn::new(2);
        open_session(&manager, &first);
        open_session(&manager, &second);
        manager.run();

        manager.broadcast(&SeqMsg { value: 77 });

        let sent_first = first.sent.lock();
        let sent_second = second.sent.lock();
        assert_eq!(sent_first.len(), 1);
        assert_eq!(sent_second.len(), 1);
        assert_eq!(sent_first[0], sent_second[0]);
        // Same backing storage, not a re-encode per recipient.
        assert_eq!(sent_first[0].as_ptr(), sent_second[0].as_ptr());
    }

    #[test]
    fn test_hook_consumes_message_before_dispatch() {
        let pool = Arc::new(CodecPool::new(4));
        let mut manager = SessionManager::with_hook(
            "test",
            "127.0.0.1:0",
            65536,
            8,
            pool,
            Some(Box::new(|_conn, data| data.first() == Some(&0xff))),
        );
        let hits = Arc::new(AtomicU32::new(0));
        let hits_in_handler = hits.clone();
        manager
            .register_message(
                0x21,
                Box::new(|| Box::new(SeqMsg { value: 0 })),
                Box::new(move |_, _, _| {
                    hits_in_handler.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let conn = FakeConn::new(1);
        let session = open_session(&manager, &conn);
        manager.run();

        let as_conn: Arc<dyn Connection> = conn.clone();
        // Consumed by the hook: first byte 0xff.
        session.on_message(&as_conn, Bytes::from_static(&[0xff, 1, 2, 3]));
        // Passed through to dispatch.
        session.on_message(
            &as_conn,
            encode_envelope(&CodecPool::disabled(), &SeqMsg { value: 5 }),
        );
        manager.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_session_tag_round_trip() {
        let manager = test_manager(8);
        let conn = FakeConn::new(1);
        let session = open_session(&manager, &conn);

        assert!(session.tag().is_none());
        session.set_tag(Some(Arc::new("player-42".to_string())));
        let tag = session.tag().unwrap();
        assert_eq!(
            tag.downcast_ref::<String>().map(String::as_str),
            Some("player-42")
        );
        session.set_tag(None);
        assert!(session.tag().is_none());
    }

    #[test]
    fn test_kick_closes_connection() {
        let mut manager = test_manager(8);
        let conn = FakeConn::new(1);
        open_session(&manager, &conn);
        manager.run();

        manager.kick(1);
        assert!(conn.closed.load(Ordering::SeqCst));
    }
}
