use crate::message::{ResponseStatus, ServerResponse};
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::sleep;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect to room {room_id}: {reason}")]
    Connect { room_id: u32, reason: String },
    #[error("failed to send: {0}")]
    Send(String),
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Io(String),
}

/// Trait for the service under test: one persistent session per call.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a session bound to `room_id`. Every inbound frame or transport
    /// failure on that session is reported through `sink`.
    fn connect<'a>(
        &'a self,
        room_id: u32,
        sink: ResponseSink,
    ) -> BoxFuture<'a, Result<Box<dyn Session>, TransportError>>;
}

pub trait Session: Send + Sync {
    fn is_open(&self) -> bool;

    fn send<'a>(&'a self, text: String) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Best-effort close; never fails.
    fn close<'a>(&'a self) -> BoxFuture<'a, ()>;
}

pub type ResponseResult = Result<String, TransportError>;

struct SlotState {
    epoch: u64,
    pending: Option<oneshot::Sender<ResponseResult>>,
}

/// Single-slot rendezvous between a waiting sender and the session reader.
///
/// The waiter must `arm` before transmitting so a fast response cannot be
/// lost. Each (re)connect takes a fresh [`ResponseSink`]; sinks from replaced
/// sessions are stale and deliver nothing.
pub struct ResponseSlot {
    state: Mutex<SlotState>,
}

impl ResponseSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState {
                epoch: 0,
                pending: None,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn arm(&self) -> oneshot::Receiver<ResponseResult> {
        let (tx, rx) = oneshot::channel();
        self.lock().pending = Some(tx);
        rx
    }

    pub fn disarm(&self) {
        self.lock().pending.take();
    }

    /// Invalidate all earlier sinks and hand out one for a new session.
    pub fn new_sink(self: &Arc<Self>) -> ResponseSink {
        let mut state = self.lock();
        state.epoch += 1;
        // a waiter armed against the old session will never be answered
        if let Some(tx) = state.pending.take() {
            let _ = tx.send(Err(TransportError::Closed));
        }
        ResponseSink {
            slot: Arc::clone(self),
            epoch: state.epoch,
        }
    }

    fn deliver(&self, epoch: u64, result: ResponseResult) -> bool {
        let mut state = self.lock();
        if state.epoch != epoch {
            return false;
        }
        match state.pending.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

/// Handle given to a session to report what arrives on it.
#[derive(Clone)]
pub struct ResponseSink {
    slot: Arc<ResponseSlot>,
    epoch: u64,
}

impl ResponseSink {
    /// Returns false when nobody was waiting (late or unsolicited frame).
    pub fn complete(&self, payload: String) -> bool {
        self.slot.deliver(self.epoch, Ok(payload))
    }

    pub fn fail(&self, err: TransportError) -> bool {
        self.slot.deliver(self.epoch, Err(err))
    }
}

#[derive(Debug, Default)]
struct RoomSessions {
    open: usize,
    peak: usize,
}

#[derive(Default)]
struct MockState {
    fail_connect: AtomicBool,
    silent: AtomicBool,
    error_status: AtomicBool,
    connect_attempts: AtomicU64,
    sends: AtomicU64,
    rooms: Mutex<HashMap<u32, RoomSessions>>,
}

impl MockState {
    fn rooms(&self) -> std::sync::MutexGuard<'_, HashMap<u32, RoomSessions>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process chat server stand-in for tests and `--mode mock` runs.
///
/// Echoes a `SUCCESS` response after `latency` and can inject the failure
/// modes the harness has to survive. Toggles apply to live sessions too.
pub struct MockTransport {
    latency: Duration,
    drop_after_sends: Option<u64>,
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            drop_after_sends: None,
            state: Arc::new(MockState::default()),
        }
    }

    /// Each session drops after accepting `n` sends, failing the waiter.
    pub fn with_drop_after_sends(mut self, n: u64) -> Self {
        self.drop_after_sends = Some(n);
        self
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Accept sends but never answer them.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Answer with `status: ERROR` instead of `SUCCESS`.
    pub fn set_error_status(&self, error: bool) {
        self.state.error_status.store(error, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> u64 {
        self.state.sends.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self, room_id: u32) -> usize {
        self.state.rooms().get(&room_id).map_or(0, |r| r.open)
    }

    /// Highest number of simultaneously open sessions ever seen for a room.
    pub fn peak_sessions(&self, room_id: u32) -> usize {
        self.state.rooms().get(&room_id).map_or(0, |r| r.peak)
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn connect<'a>(
        &'a self,
        room_id: u32,
        sink: ResponseSink,
    ) -> BoxFuture<'a, Result<Box<dyn Session>, TransportError>> {
        Box::pin(async move {
            self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if self.state.fail_connect.load(Ordering::SeqCst) {
                return Err(TransportError::Connect {
                    room_id,
                    reason: "connection refused (injected)".to_string(),
                });
            }

            {
                let mut rooms = self.state.rooms();
                let room = rooms.entry(room_id).or_default();
                room.open += 1;
                room.peak = room.peak.max(room.open);
            }

            Ok(Box::new(MockSession {
                room_id,
                latency: self.latency,
                drop_after_sends: self.drop_after_sends,
                open: Arc::new(AtomicBool::new(true)),
                sends: AtomicU64::new(0),
                sink,
                state: Arc::clone(&self.state),
            }) as Box<dyn Session>)
        })
    }
}

struct MockSession {
    room_id: u32,
    latency: Duration,
    drop_after_sends: Option<u64>,
    open: Arc<AtomicBool>,
    sends: AtomicU64,
    sink: ResponseSink,
    state: Arc<MockState>,
}

impl MockSession {
    fn mark_closed(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(room) = self.state.rooms().get_mut(&self.room_id) {
                room.open = room.open.saturating_sub(1);
            }
        }
    }
}

impl Session for MockSession {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send<'a>(&'a self, _text: String) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(TransportError::Closed);
            }
            let sent = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.sends.fetch_add(1, Ordering::SeqCst);

            if self.drop_after_sends.is_some_and(|n| sent > n) {
                // the peer hangs up while we wait for the echo
                self.mark_closed();
                self.sink.fail(TransportError::Closed);
                return Ok(());
            }
            if self.state.silent.load(Ordering::SeqCst) {
                return Ok(());
            }

            let status = if self.state.error_status.load(Ordering::SeqCst) {
                ResponseStatus::Error
            } else {
                ResponseStatus::Success
            };
            let response = ServerResponse {
                status,
                server_timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                message: "echo".to_string(),
            };
            let payload = serde_json::to_string(&response)
                .map_err(|e| TransportError::Io(e.to_string()))?;

            let sink = self.sink.clone();
            let open = Arc::clone(&self.open);
            let latency = self.latency;
            tokio::spawn(async move {
                if !latency.is_zero() {
                    sleep(latency).await;
                }
                if open.load(Ordering::SeqCst) {
                    sink.complete(payload);
                }
            });
            Ok(())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.mark_closed();
        })
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.mark_closed();
    }
}
