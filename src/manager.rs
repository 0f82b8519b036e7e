//! Client identity, the session table, and the dispatcher trait.
//!
//! The teacher funnels every event (`NewClient`/`NewMessage`/`Disconnect`/
//! `Error`) through a single mpsc channel into an `EventStream` that the
//! caller drives with `while let Some(event) = stream.next().await`
//! (`event.rs`, `server.rs`). That gives one consumer for every client,
//! which means the caller has to re-demultiplex by ID itself and has no
//! way to push a message to a specific client except through the writer
//! handed out at `NewClient` time.
//!
//! Here each session owns its own tokio task (`session.rs`) and calls
//! `Handler::on_connect`/`on_message`/`on_disconnect` inline, in order,
//! for that one client - per-client ordering falls out of "one task, one
//! set of sequential awaits" for free. `SessionManager` is the other
//! half: a shared, cloneable handle the handler implementation (and
//! `server.rs`) use to address any session by id, including ones other
//! than the one currently executing. Its table is a plain `std::sync::
//! RwLock`, not `tokio::sync::RwLock`: every access is held only across a
//! map lookup, never across an `.await`, so the blocking lock never stalls
//! the runtime, and `Handler` methods can stay fully synchronous.

use crate::error::Error;
use crate::frame::Frame;
use crate::message::Message;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// A monotonically increasing client identifier. `0` is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_client_id() -> ClientId {
    ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Callbacks invoked by a session's owning task as its state changes.
///
/// Implementations run synchronously on the session's task. Slow work
/// should be handed off (e.g. `tokio::spawn`) rather than awaited here,
/// since it would otherwise stall that one client's frame processing -
/// other sessions are unaffected either way, since each has its own task.
pub trait Handler: Send + Sync {
    fn on_connect(&self, id: ClientId, manager: &SessionManager);
    fn on_message(&self, id: ClientId, message: Message, manager: &SessionManager);
    fn on_disconnect(&self, id: ClientId, code: u16, reason: String, manager: &SessionManager);
}

/// What a session's owning task pulls off its outbound queue.
pub enum Outbound {
    Frames(Arc<Vec<Frame>>),
    Close(u16, String),
}

struct SessionHandle {
    outbound_tx: mpsc::Sender<Outbound>,
    remote_addr: SocketAddr,
    user_data: RwLock<HashMap<String, String>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Default)]
struct Statistics {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl Statistics {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    sessions: RwLock<HashMap<ClientId, SessionHandle>>,
    stats: Statistics,
    max_frame_size: usize,
    outbound_capacity: usize,
}

/// A cheaply cloneable handle to the shared session table.
#[derive(Clone)]
pub struct SessionManager(Arc<Inner>);

impl SessionManager {
    pub fn new(max_frame_size: usize, outbound_capacity: usize) -> Self {
        Self(Arc::new(Inner {
            sessions: RwLock::new(HashMap::new()),
            stats: Statistics::default(),
            max_frame_size,
            outbound_capacity,
        }))
    }

    /// Allocates a new `ClientId`, registers it in the session table, and
    /// returns the receiver half the owning session task drains.
    pub(crate) fn register(&self, remote_addr: SocketAddr) -> (ClientId, mpsc::Receiver<Outbound>) {
        let id = next_client_id();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.0.outbound_capacity);
        let handle = SessionHandle {
            outbound_tx,
            remote_addr,
            user_data: RwLock::new(HashMap::new()),
        };
        self.0.sessions.write().unwrap().insert(id, handle);
        self.0.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.0.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        (id, outbound_rx)
    }

    pub(crate) fn unregister(&self, id: ClientId) {
        if self.0.sessions.write().unwrap().remove(&id).is_some() {
            self.0.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_bytes_received(&self, bytes: usize) {
        self.0.stats.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self) {
        self.0.stats.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_sent(&self, bytes: usize) {
        self.0.stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self) {
        self.0.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.0.stats.snapshot()
    }

    pub fn is_connected(&self, id: ClientId) -> bool {
        self.0.sessions.read().unwrap().contains_key(&id)
    }

    pub fn remote_addr(&self, id: ClientId) -> Option<SocketAddr> {
        self.0.sessions.read().unwrap().get(&id).map(|h| h.remote_addr)
    }

    pub fn get_user_data(&self, id: ClientId, key: &str) -> Option<String> {
        let sessions = self.0.sessions.read().unwrap();
        let handle = sessions.get(&id)?;
        let value = handle.user_data.read().unwrap().get(key).cloned();
        value
    }

    pub fn set_user_data(&self, id: ClientId, key: impl Into<String>, value: impl Into<String>) {
        let sessions = self.0.sessions.read().unwrap();
        if let Some(handle) = sessions.get(&id) {
            handle.user_data.write().unwrap().insert(key.into(), value.into());
        }
    }

    /// Enqueues a message for the given client. The outbound queue is
    /// bounded: if it's full the message is dropped and an error is
    /// returned rather than letting a slow reader back-pressure every
    /// other caller of this method.
    pub fn send(&self, id: ClientId, message: Message) -> Result<(), Error> {
        let frames = Arc::new(message.to_frames(self.0.max_frame_size));
        let sessions = self.0.sessions.read().unwrap();
        let handle = sessions.get(&id).ok_or(Error::ChannelClosed)?;
        handle
            .outbound_tx
            .try_send(Outbound::Frames(frames))
            .map_err(|_| Error::ChannelClosed)
    }

    pub fn send_text(&self, id: ClientId, text: impl Into<String>) -> Result<(), Error> {
        self.send(id, Message::Text(text.into()))
    }

    pub fn send_binary(&self, id: ClientId, data: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.send(id, Message::Binary(data.into()))
    }

    /// Encodes `message` once and fans the same frame list out to every
    /// connected session, sharing the encoding via `Arc` rather than
    /// re-serializing per recipient. Returns the number of sessions whose
    /// outbound queue accepted it.
    pub fn broadcast(&self, message: Message) -> usize {
        let frames = Arc::new(message.to_frames(self.0.max_frame_size));
        let sessions = self.0.sessions.read().unwrap();
        sessions
            .values()
            .filter(|handle| handle.outbound_tx.try_send(Outbound::Frames(Arc::clone(&frames))).is_ok())
            .count()
    }

    pub fn close(&self, id: ClientId, code: u16, reason: impl Into<String>) {
        let sessions = self.0.sessions.read().unwrap();
        if let Some(handle) = sessions.get(&id) {
            let _ = handle.outbound_tx.try_send(Outbound::Close(code, reason.into()));
        }
    }

    pub fn close_all(&self, code: u16, reason: impl Into<String>) {
        let reason = reason.into();
        let sessions = self.0.sessions.read().unwrap();
        for handle in sessions.values() {
            let _ = handle.outbound_tx.try_send(Outbound::Close(code, reason.clone()));
        }
    }

    pub fn connected_count(&self) -> usize {
        self.0.sessions.read().unwrap().len()
    }
}
