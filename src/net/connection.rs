//! WebSocket connection module
//!
//! One `WsConn` per socket, usable in either role: server-accepted
//! (inbound frames are masked, outbound are not) or client-dialed (the
//! reverse). Each connection runs two tasks: an inbound task that
//! reassembles frames into logical messages and feeds the watcher, and
//! an outbound worker that serializes every send through one ordered
//! queue so multi-frame messages can never interleave on the wire.
//!
//! Lifecycle: Connecting -> Connected -> Closing -> Closed. A failed
//! handshake jumps straight to Closed without emitting any event; the
//! Close event reaches the watcher exactly once no matter how many
//! times `close` is called.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::frame::{self, Opcode, FRAME_CAPACITY, FRAME_HEADER_MAX};
use super::handshake;
use crate::error::{GateError, NetworkError, ProtocolError, Result};
use crate::fault;

/// Outbound queue depth per connection. Sends beyond this while the
/// worker is backed up are dropped with a warning.
pub const SEND_QUEUE_DEPTH: usize = 100;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Observer for socket lifecycle and inbound messages. Watchers are
/// invoked from the connection's inbound task; implementations queue
/// the occurrence and return.
pub trait SocketWatcher: Send + Sync {
    fn on_open(&self, conn: &Arc<dyn Connection>);
    fn on_message(&self, conn: &Arc<dyn Connection>, data: Bytes);
    fn on_close(&self, conn: &Arc<dyn Connection>);
}

/// Capability interface for a duplex connection. Consumers depend on
/// this, never on the concrete transport.
pub trait Connection: Send + Sync {
    /// Identity, monotonic per listener.
    fn id(&self) -> u64;
    fn state(&self) -> ConnState;
    fn local_addr(&self) -> String;
    fn remote_addr(&self) -> String;
    /// Request path from the upgrade handshake.
    fn path(&self) -> String;
    /// Queue one binary logical message.
    fn send(&self, data: Bytes);
    /// Queue one text logical message.
    fn send_text(&self, text: &str);
    fn ping(&self);
    /// Begin teardown. Idempotent; returns true once closing is under
    /// way.
    fn close(&self) -> bool;
    fn set_watcher(&self, watcher: Option<Arc<dyn SocketWatcher>>);
    fn watcher(&self) -> Option<Arc<dyn SocketWatcher>>;
}

struct Outbound {
    opcode: Opcode,
    payload: Bytes,
}

/// Socket not yet driven by the I/O tasks.
enum PendingIo {
    /// Server role: the upgrade request has not been read yet.
    Raw(TcpStream),
    /// Client role: handshake already done; carries over-read bytes.
    Ready(TcpStream, BytesMut),
}

/// A WebSocket connection in either role.
pub struct WsConn {
    id: u64,
    /// Client role masks outbound frames; server role never does.
    masked: bool,
    max_msg_size: u32,
    state: AtomicU8,
    local_addr: String,
    remote_addr: String,
    path: RwLock<String>,
    watcher: RwLock<Option<Arc<dyn SocketWatcher>>>,
    out_tx: mpsc::Sender<Outbound>,
    out_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    pending: Mutex<Option<PendingIo>>,
    shutdown: CancellationToken,
    close_emitted: AtomicBool,
    me: Weak<WsConn>,
}

impl WsConn {
    fn new(id: u64, masked: bool, max_msg_size: u32, pending: PendingIo) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let stream = match &pending {
            PendingIo::Raw(stream) => stream,
            PendingIo::Ready(stream, _) => stream,
        };
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let remote_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Arc::new_cyclic(|me| Self {
            id,
            masked,
            max_msg_size,
            state: AtomicU8::new(ConnState::Connecting as u8),
            local_addr,
            remote_addr,
            path: RwLock::new("/".to_string()),
            watcher: RwLock::new(None),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            pending: Mutex::new(Some(pending)),
            shutdown: CancellationToken::new(),
            close_emitted: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Wrap a freshly accepted server-side socket. The handshake runs
    /// once `start` is called.
    pub fn accepted(stream: TcpStream, id: u64, max_msg_size: u32) -> Arc<Self> {
        Self::new(id, false, max_msg_size, PendingIo::Raw(stream))
    }

    /// Dial and upgrade a client-side connection. The returned
    /// connection is handshaken but idle; set a watcher, then `start`.
    pub async fn connect(
        addr: &str,
        path: &str,
        id: u64,
        max_msg_size: u32,
    ) -> Result<Arc<Self>> {
        let mut stream = TcpStream::connect(addr).await?;
        let leftover = handshake::connect(&mut stream, addr, path).await?;
        let conn = Self::new(id, true, max_msg_size, PendingIo::Ready(stream, leftover));
        *conn.path.write() = path.to_string();
        Ok(conn)
    }

    /// Spin up the I/O tasks. Returns false if already started.
    pub fn start(&self) -> bool {
        let Some(pending) = self.pending.lock().take() else {
            return false;
        };
        let Some(conn) = self.me.upgrade() else {
            return false;
        };
        fault::spawn_guarded("ws-io", async move {
            conn.run_io(pending).await;
        });
        true
    }

    fn as_connection(&self) -> Option<Arc<dyn Connection>> {
        self.me
            .upgrade()
            .map(|conn| conn as Arc<dyn Connection>)
    }

    async fn run_io(self: Arc<Self>, pending: PendingIo) {
        let (stream, leftover) = match pending {
            PendingIo::Raw(mut stream) => match handshake::accept(&mut stream).await {
                Ok((path, leftover)) => {
                    *self.path.write() = path;
                    (stream, leftover)
                }
                Err(err) => {
                    // No Open was emitted, so nothing to tear down
                    // beyond the raw socket.
                    warn!(conn_id = self.id, error = %err, "handshake failed");
                    self.state.store(ConnState::Closed as u8, Ordering::SeqCst);
                    return;
                }
            },
            PendingIo::Ready(stream, leftover) => (stream, leftover),
        };

        let Some(out_rx) = self.out_rx.lock().take() else {
            return;
        };
        let (read_half, write_half) = stream.into_split();

        let writer_conn = self.clone();
        fault::spawn_guarded("ws-send", async move {
            writer_conn.send_loop(write_half, out_rx).await;
        });

        self.recv_loop(read_half, leftover).await;
    }

    /// Inbound task: reassemble logical messages and feed the watcher.
    async fn recv_loop(self: Arc<Self>, read_half: OwnedReadHalf, leftover: BytesMut) {
        self.state
            .store(ConnState::Connected as u8, Ordering::SeqCst);
        let as_conn: Arc<dyn Connection> = self.clone();
        if let Some(watcher) = self.watcher() {
            fault::safe_call("watcher.on_open", || watcher.on_open(&as_conn));
        }

        let mut reader =
            AsyncReadExt::chain(std::io::Cursor::new(leftover.freeze()), BufReader::new(read_half));
        let mut assembly = BytesMut::with_capacity(FRAME_CAPACITY);

        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = self.read_message(&mut reader, &mut assembly) => message,
            };
            let (opcode, data) = match message {
                Ok(message) => message,
                Err(err) => {
                    debug!(conn_id = self.id, error = %err, "inbound loop ending");
                    break;
                }
            };
            match opcode {
                Opcode::Pong => {}
                Opcode::Ping => self.pong(),
                Opcode::Close => break,
                Opcode::Text | Opcode::Binary => {
                    if let Some(watcher) = self.watcher() {
                        fault::safe_call("watcher.on_message", || {
                            watcher.on_message(&as_conn, data.clone())
                        });
                    } else {
                        trace!(conn_id = self.id, len = data.len(), "message with no watcher");
                    }
                }
                Opcode::Continuation => {}
            }
        }
        // Queue the close acknowledgement (if not already closing);
        // the outbound worker tears the socket down after flushing.
        self.close();
    }

    /// Read one logical message: frames accumulate until fin. The
    /// assembly buffer grows geometrically and the cumulative size is
    /// checked against the configured maximum before each frame body
    /// is read.
    async fn read_message<R>(
        &self,
        reader: &mut R,
        assembly: &mut BytesMut,
    ) -> Result<(Opcode, Bytes)>
    where
        R: AsyncRead + Unpin,
    {
        assembly.clear();
        let mut opcode = Opcode::Continuation;
        loop {
            let header = frame::read_header(reader).await?;
            let needed = assembly.len() as u64 + header.payload_len;
            if needed > self.max_msg_size as u64 {
                return Err(GateError::Protocol(ProtocolError::MessageTooLarge {
                    size: needed,
                    max: self.max_msg_size,
                }));
            }
            let needed = needed as usize;
            if needed > assembly.capacity() {
                assembly.reserve(needed * 2 - assembly.len());
            }

            let start = assembly.len();
            assembly.resize(needed, 0);
            frame::read_exact_net(reader, &mut assembly[start..]).await?;
            if let Some(key) = header.mask {
                frame::apply_mask(key, &mut assembly[start..]);
            }

            if header.opcode != Opcode::Continuation {
                opcode = header.opcode;
            }
            if header.fin {
                break;
            }
        }
        Ok((opcode, Bytes::copy_from_slice(assembly)))
    }

    /// Outbound worker: the only writer. Drains the queue in order,
    /// fragmenting large messages, until a close frame goes out or the
    /// write side fails; then tears the connection down.
    async fn send_loop(self: Arc<Self>, mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Outbound>) {
        let mut out = BytesMut::with_capacity(FRAME_CAPACITY + FRAME_HEADER_MAX);
        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            out.clear();
            frame::write_message(&mut out, msg.opcode, self.masked, &msg.payload);
            if let Err(err) = write_half.write_all(&out).await {
                let err = NetworkError::WriteError(err.to_string());
                debug!(conn_id = self.id, error = %err, "outbound write failed");
                break;
            }
            if msg.opcode == Opcode::Close {
                break;
            }
        }
        let _ = write_half.shutdown().await;
        self.finalize();
    }

    /// Terminal teardown: unblock the inbound task and emit the Close
    /// event exactly once.
    fn finalize(&self) {
        self.state.store(ConnState::Closed as u8, Ordering::SeqCst);
        self.shutdown.cancel();
        if !self.close_emitted.swap(true, Ordering::SeqCst) {
            if let (Some(watcher), Some(as_conn)) = (self.watcher(), self.as_connection()) {
                fault::safe_call("watcher.on_close", || watcher.on_close(&as_conn));
            }
        }
    }

    fn push(&self, opcode: Opcode, payload: Bytes) {
        let state = self.state();
        if state == ConnState::Closing || state == ConnState::Closed {
            return;
        }
        if self.out_tx.try_send(Outbound { opcode, payload }).is_err() {
            warn!(conn_id = self.id, "send queue full, dropping message");
        }
    }

    pub fn pong(&self) {
        self.push(Opcode::Pong, Bytes::from_static(b"pong"));
    }
}

impl Connection for WsConn {
    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn path(&self) -> String {
        self.path.read().clone()
    }

    fn send(&self, data: Bytes) {
        self.push(Opcode::Binary, data);
    }

    fn send_text(&self, text: &str) {
        self.push(Opcode::Text, Bytes::copy_from_slice(text.as_bytes()));
    }

    fn ping(&self) {
        self.push(Opcode::Ping, Bytes::from_static(b"ping"));
    }

    fn close(&self) -> bool {
        let state = self.state();
        if state == ConnState::Closed || state == ConnState::Closing {
            return true;
        }
        let queued = self
            .out_tx
            .try_send(Outbound {
                opcode: Opcode::Close,
                payload: Bytes::from_static(b"close"),
            })
            .is_ok();
        self.state.store(ConnState::Closing as u8, Ordering::SeqCst);
        if !queued {
            // Queue full: skip the best-effort flush and cut the tasks
            // loose directly.
            self.shutdown.cancel();
        }
        true
    }

    fn set_watcher(&self, watcher: Option<Arc<dyn SocketWatcher>>) {
        *self.watcher.write() = watcher;
    }

    fn watcher(&self) -> Option<Arc<dyn SocketWatcher>> {
        self.watcher.read().clone()
    }
}
