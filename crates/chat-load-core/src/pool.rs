use crate::stats::MetricsCollector;
use crate::transport::{ResponseResult, ResponseSlot, Session, Transport, TransportError};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Connect(#[from] TransportError),
    #[error("connecting to room {room_id} timed out after {timeout:?}")]
    ConnectTimeout { room_id: u32, timeout: Duration },
    #[error("no connection available for room {0}")]
    Unavailable(u32),
}

/// One pooled session slot for a room. The session inside can be swapped on
/// reconnect while the slot (and its response slot) keeps its identity.
pub struct PooledConnection {
    id: u64,
    room_id: u32,
    in_use: AtomicBool,
    session: Mutex<Option<Arc<dyn Session>>>,
    responses: Arc<ResponseSlot>,
}

impl PooledConnection {
    fn reserved(id: u64, room_id: u32) -> Self {
        Self {
            id,
            room_id,
            in_use: AtomicBool::new(true),
            session: Mutex::new(None),
            responses: ResponseSlot::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn room_id(&self) -> u32 {
        self.room_id
    }

    fn session_guard(&self) -> MutexGuard<'_, Option<Arc<dyn Session>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.session_guard().clone()
    }

    pub fn is_open(&self) -> bool {
        self.session_guard().as_ref().is_some_and(|s| s.is_open())
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    fn try_acquire(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    fn take_session(&self) -> Option<Arc<dyn Session>> {
        self.session_guard().take()
    }

    /// Register interest in the next response before sending.
    pub fn prepare_for_response(&self) -> oneshot::Receiver<ResponseResult> {
        self.responses.arm()
    }

    pub fn cancel_response(&self) {
        self.responses.disarm();
    }

    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        let session = self.session().ok_or(TransportError::Closed)?;
        session.send(text).await
    }
}

/// Exclusive handle on a borrowed connection. Dropping it returns the
/// connection to the pool, so every exit path of a borrower releases it.
pub struct ConnectionLease {
    conn: Arc<PooledConnection>,
}

impl ConnectionLease {
    fn new(conn: Arc<PooledConnection>) -> Self {
        Self { conn }
    }
}

impl Deref for ConnectionLease {
    type Target = PooledConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.conn.release();
    }
}

/// Per-room bounded pool of persistent sessions.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    metrics: Arc<MetricsCollector>,
    capacity: usize,
    connect_timeout: Duration,
    rooms: Mutex<HashMap<u32, Vec<Arc<PooledConnection>>>>,
    next_id: AtomicU64,
}

enum BorrowPlan {
    Reuse(Arc<PooledConnection>),
    Create(Arc<PooledConnection>),
    Repair(Arc<PooledConnection>),
    Exhausted,
}

impl ConnectionPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        metrics: Arc<MetricsCollector>,
        capacity: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            metrics,
            capacity: capacity.max(1),
            connect_timeout,
            rooms: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<u32, Vec<Arc<PooledConnection>>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hand out an idle open connection, open a new one while under
    /// capacity, or repair a closed idle one, in that order.
    pub async fn borrow(&self, room_id: u32) -> Result<ConnectionLease, PoolError> {
        let plan = {
            let mut rooms = self.rooms();
            let conns = rooms.entry(room_id).or_default();

            if let Some(conn) = conns.iter().find(|c| c.is_open() && c.try_acquire()) {
                BorrowPlan::Reuse(Arc::clone(conn))
            } else if conns.len() < self.capacity {
                // reserve the slot before connecting so concurrent borrowers
                // cannot push the room past capacity
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let conn = Arc::new(PooledConnection::reserved(id, room_id));
                conns.push(Arc::clone(&conn));
                BorrowPlan::Create(conn)
            } else if let Some(conn) = conns.iter().find(|c| !c.is_open() && c.try_acquire()) {
                BorrowPlan::Repair(Arc::clone(conn))
            } else {
                BorrowPlan::Exhausted
            }
        };

        match plan {
            BorrowPlan::Reuse(conn) => Ok(ConnectionLease::new(conn)),
            BorrowPlan::Create(conn) => {
                let lease = ConnectionLease::new(Arc::clone(&conn));
                match self.open_session(&conn).await {
                    Ok(()) => {
                        self.metrics.increment_connections();
                        debug!("Room {}: opened connection #{}", room_id, conn.id());
                        Ok(lease)
                    }
                    Err(e) => {
                        self.forget(&conn);
                        Err(e)
                    }
                }
            }
            BorrowPlan::Repair(conn) => {
                let lease = ConnectionLease::new(conn);
                self.reconnect(&lease).await?;
                Ok(lease)
            }
            BorrowPlan::Exhausted => Err(PoolError::Unavailable(room_id)),
        }
    }

    /// Return a borrowed connection. Equivalent to dropping the lease.
    pub fn release(&self, lease: ConnectionLease) {
        drop(lease);
    }

    /// Replace the connection's session with a fresh one for the same room.
    pub async fn reconnect(&self, conn: &PooledConnection) -> Result<(), PoolError> {
        if let Some(old) = conn.take_session() {
            if old.is_open() {
                old.close().await;
            }
        }
        self.open_session(conn).await?;
        self.metrics.increment_reconnections();
        debug!("Room {}: reconnected connection #{}", conn.room_id(), conn.id());
        Ok(())
    }

    async fn open_session(&self, conn: &PooledConnection) -> Result<(), PoolError> {
        let sink = conn.responses.new_sink();
        let connect = self.transport.connect(conn.room_id(), sink);
        match timeout(self.connect_timeout, connect).await {
            Ok(Ok(session)) => {
                *conn.session_guard() = Some(Arc::from(session));
                Ok(())
            }
            Ok(Err(e)) => Err(PoolError::Connect(e)),
            Err(_) => Err(PoolError::ConnectTimeout {
                room_id: conn.room_id(),
                timeout: self.connect_timeout,
            }),
        }
    }

    fn forget(&self, conn: &Arc<PooledConnection>) {
        if let Some(conns) = self.rooms().get_mut(&conn.room_id()) {
            conns.retain(|c| !Arc::ptr_eq(c, conn));
        }
    }

    /// Number of pooled connections (open or not) for a room.
    pub fn room_size(&self, room_id: u32) -> usize {
        self.rooms().get(&room_id).map_or(0, Vec::len)
    }

    pub fn open_connections(&self, room_id: u32) -> usize {
        self.rooms()
            .get(&room_id)
            .map_or(0, |conns| conns.iter().filter(|c| c.is_open()).count())
    }

    /// Close every session in every room and forget the pool state.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<PooledConnection>> =
            self.rooms().drain().flat_map(|(_, conns)| conns).collect();

        let mut closed = 0usize;
        for conn in &drained {
            if let Some(session) = conn.take_session() {
                if session.is_open() {
                    session.close().await;
                    closed += 1;
                }
            }
        }
        info!("Connection pool closed ({} open sessions shut down)", closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BoxFuture, MockTransport, ResponseSink};
    use std::sync::atomic::AtomicUsize;

    fn pool_with(transport: Arc<MockTransport>, capacity: usize) -> (ConnectionPool, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        let pool = ConnectionPool::new(
            transport,
            metrics.clone(),
            capacity,
            Duration::from_secs(5),
        );
        (pool, metrics)
    }

    #[tokio::test]
    async fn test_borrow_reuses_idle_connection() {
        let transport = Arc::new(MockTransport::new(Duration::ZERO));
        let (pool, metrics) = pool_with(transport.clone(), 2);

        let lease = pool.borrow(1).await.unwrap();
        let first_id = lease.id();
        pool.release(lease);

        let lease = pool.borrow(1).await.unwrap();
        assert_eq!(lease.id(), first_id);
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(metrics.connections(), 1);
    }

    #[tokio::test]
    async fn test_capacity_is_a_hard_limit() {
        let transport = Arc::new(MockTransport::new(Duration::ZERO));
        let (pool, _) = pool_with(transport.clone(), 2);

        let a = pool.borrow(5).await.unwrap();
        let b = pool.borrow(5).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert!(matches!(pool.borrow(5).await, Err(PoolError::Unavailable(5))));
        assert_eq!(pool.room_size(5), 2);

        // other rooms have their own budget
        let _c = pool.borrow(6).await.unwrap();
        assert_eq!(pool.room_size(6), 1);

        drop(a);
        let again = pool.borrow(5).await.unwrap();
        assert_eq!(transport.connect_attempts(), 3);
        drop((again, b));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_borrowers_never_share() {
        let transport = Arc::new(MockTransport::new(Duration::ZERO));
        let (pool, _) = pool_with(transport.clone(), 1);
        let pool = Arc::new(pool);
        let holders = Arc::new(AtomicUsize::new(0));
        let wins = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let holders = holders.clone();
            let wins = wins.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    if let Ok(lease) = pool.borrow(1).await {
                        assert!(lease.is_open());
                        let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                        assert_eq!(now, 1, "two borrowers hold the same connection");
                        tokio::task::yield_now().await;
                        holders.fetch_sub(1, Ordering::SeqCst);
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(wins.load(Ordering::SeqCst) > 0);
        assert_eq!(pool.room_size(1), 1);
        assert_eq!(transport.peak_sessions(1), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_repaired_in_place() {
        let transport = Arc::new(MockTransport::new(Duration::ZERO));
        let (pool, metrics) = pool_with(transport.clone(), 1);

        let lease = pool.borrow(2).await.unwrap();
        let id = lease.id();
        lease.session().unwrap().close().await;
        assert!(!lease.is_open());
        drop(lease);

        let lease = pool.borrow(2).await.unwrap();
        assert_eq!(lease.id(), id, "identity survives the reconnect");
        assert!(lease.is_open());
        assert_eq!(metrics.reconnections(), 1);
        assert_eq!(metrics.connections(), 1);
        assert_eq!(transport.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_explicit_reconnect_replaces_open_session() {
        let transport = Arc::new(MockTransport::new(Duration::ZERO));
        let (pool, metrics) = pool_with(transport.clone(), 1);

        let lease = pool.borrow(3).await.unwrap();
        let before = lease.session().unwrap();
        pool.reconnect(&lease).await.unwrap();

        assert!(!before.is_open(), "old session closed first");
        assert!(lease.is_open());
        assert_eq!(transport.open_sessions(3), 1);
        assert_eq!(metrics.reconnections(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates_and_frees_slot() {
        let transport = Arc::new(MockTransport::new(Duration::ZERO));
        transport.set_fail_connect(true);
        let (pool, metrics) = pool_with(transport.clone(), 1);

        assert!(matches!(pool.borrow(1).await, Err(PoolError::Connect(_))));
        assert_eq!(pool.room_size(1), 0);
        assert_eq!(metrics.connections(), 0);

        transport.set_fail_connect(false);
        assert!(pool.borrow(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_repair_releases_connection() {
        let transport = Arc::new(MockTransport::new(Duration::ZERO));
        let (pool, metrics) = pool_with(transport.clone(), 1);

        let lease = pool.borrow(1).await.unwrap();
        lease.session().unwrap().close().await;
        drop(lease);

        transport.set_fail_connect(true);
        assert!(matches!(pool.borrow(1).await, Err(PoolError::Connect(_))));
        assert_eq!(metrics.reconnections(), 0);

        transport.set_fail_connect(false);
        let lease = pool.borrow(1).await.expect("closed connection is repairable again");
        assert!(lease.is_open());
    }

    struct HangingTransport;

    impl Transport for HangingTransport {
        fn name(&self) -> &'static str {
            "hanging"
        }

        fn connect<'a>(
            &'a self,
            _room_id: u32,
            _sink: ResponseSink,
        ) -> BoxFuture<'a, Result<Box<dyn Session>, TransportError>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let metrics = Arc::new(MetricsCollector::new());
        let pool = ConnectionPool::new(
            Arc::new(HangingTransport),
            metrics,
            1,
            Duration::from_secs(5),
        );
        let started = tokio::time::Instant::now();
        let err = pool.borrow(9).await.err().unwrap();
        assert!(matches!(err, PoolError::ConnectTimeout { room_id: 9, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(pool.room_size(9), 0);
    }

    #[tokio::test]
    async fn test_aborted_borrower_releases_connection() {
        let transport = Arc::new(MockTransport::new(Duration::ZERO));
        let (pool, _) = pool_with(transport.clone(), 1);
        let pool = Arc::new(pool);

        let holder = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _lease = pool.borrow(1).await.unwrap();
                std::future::pending::<()>().await;
            })
        };
        while pool.open_connections(1) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(matches!(pool.borrow(1).await, Err(PoolError::Unavailable(1))));

        holder.abort();
        let _ = holder.await;
        assert!(pool.borrow(1).await.is_ok());
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let transport = Arc::new(MockTransport::new(Duration::ZERO));
        let (pool, _) = pool_with(transport.clone(), 2);

        for room in 1..=3 {
            let a = pool.borrow(room).await.unwrap();
            let b = pool.borrow(room).await.unwrap();
            drop((a, b));
        }
        pool.close_all().await;

        for room in 1..=3 {
            assert_eq!(transport.open_sessions(room), 0);
            assert_eq!(pool.room_size(room), 0);
        }
    }
}
