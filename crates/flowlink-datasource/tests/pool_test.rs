//! Tests for flowlink-datasource pool module

use async_trait::async_trait;
use flowlink_datasource::prelude::*;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ==================== Test Doubles ====================

#[derive(Default)]
struct FakeDriverState {
    connects: AtomicU64,
    closes: AtomicU64,
    open: AtomicU64,
    max_open: AtomicU64,
    live_flags: parking_lot::Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeDriverState {
    /// Mark every connection handed out so far as dead; later connections
    /// come up healthy again.
    fn kill_existing(&self) {
        for flag in self.live_flags.lock().iter() {
            flag.store(false, Ordering::Release);
        }
    }
}

struct FakeConnection {
    state: Arc<FakeDriverState>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn execute(&self, _sql: &str) -> Result<u64> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(Error::connection("connection reset"));
        }
        Ok(0)
    }

    async fn is_valid(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.state.closes.fetch_add(1, Ordering::Relaxed);
        self.state.open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeDriver {
    state: Arc<FakeDriverState>,
}

#[async_trait]
impl Driver for FakeDriver {
    fn db_type(&self) -> DbType {
        DbType::PostgreSql
    }

    fn version(&self) -> u32 {
        1
    }

    fn accepts(&self, url: &str) -> bool {
        url.starts_with("postgres:")
    }

    async fn connect(
        &self,
        _descriptor: &ConnectionDescriptor,
        _secret: &str,
    ) -> Result<Box<dyn Connection>> {
        self.state.connects.fetch_add(1, Ordering::Relaxed);
        let open = self.state.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_open.fetch_max(open, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.state.live_flags.lock().push(Arc::clone(&alive));
        Ok(Box::new(FakeConnection {
            state: Arc::clone(&self.state),
            alive,
        }))
    }
}

fn fake_resolved(state: &Arc<FakeDriverState>) -> ResolvedDriver {
    let contexts = ContextManager::new();
    ResolvedDriver {
        driver: Arc::new(FakeDriver {
            state: Arc::clone(state),
        }),
        db_type: DbType::PostgreSql,
        version: 1,
        context: contexts.create_context(Path::new("/opt/drivers/pg.jar"), Path::new("/nonexistent")),
    }
}

fn descriptor() -> ConnectionDescriptor {
    ConnectionDescriptor::new(DbType::PostgreSql, "postgres://h:5432/db")
        .with_user("etl")
        .with_secret("pw")
}

// ==================== Build Tests ====================

#[tokio::test]
async fn test_build_prepopulates_min_idle() {
    let state = Arc::new(FakeDriverState::default());
    let config = PoolConfig::standard().with_min_idle(3);
    let pool = DriverPool::build(fake_resolved(&state), &descriptor(), config)
        .await
        .unwrap();

    assert_eq!(pool.size(), 3);
    assert_eq!(pool.stats().connections_created, 3);
    assert_eq!(pool.capacity(), DEFAULT_MAX_ACTIVE);
    assert_eq!(pool.policy(), PoolPolicy::Standard);
}

#[tokio::test]
async fn test_single_session_pool_has_capacity_one() {
    let state = Arc::new(FakeDriverState::default());
    let pool = DriverPool::build(fake_resolved(&state), &descriptor(), PoolConfig::single_session())
        .await
        .unwrap();

    assert_eq!(pool.policy(), PoolPolicy::SingleSession);
    assert_eq!(pool.capacity(), 1);
    assert_eq!(pool.size(), 1);
}

#[tokio::test]
async fn test_build_rejects_malformed_secret() {
    let state = Arc::new(FakeDriverState::default());
    let mut descriptor = descriptor();
    descriptor.secret = "!!not-base64!!".to_string();

    let err = DriverPool::build(fake_resolved(&state), &descriptor, PoolConfig::standard())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

// ==================== Borrow Tests ====================

#[tokio::test]
async fn test_borrow_creates_lazily_and_reuses_after_return() {
    let state = Arc::new(FakeDriverState::default());
    let config = PoolConfig::standard().with_min_idle(0);
    let pool = DriverPool::build(fake_resolved(&state), &descriptor(), config)
        .await
        .unwrap();

    let conn = pool.borrow().await.unwrap();
    assert_eq!(conn.execute("select now()").await.unwrap(), 0);
    assert_eq!(state.connects.load(Ordering::Relaxed), 1);
    drop(conn);

    // Give the deferred return a chance to land.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let _conn = pool.borrow().await.unwrap();
    assert_eq!(state.connects.load(Ordering::Relaxed), 1);
    assert_eq!(pool.stats().borrows, 2);
}

#[tokio::test(start_paused = true)]
async fn test_single_session_borrow_blocks_until_timeout() {
    let state = Arc::new(FakeDriverState::default());
    let pool = DriverPool::build(fake_resolved(&state), &descriptor(), PoolConfig::single_session())
        .await
        .unwrap();

    let held = pool.borrow().await.unwrap();

    let err = pool.borrow().await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));
    assert!(err.is_retriable());
    assert_eq!(pool.stats().exhausted_count, 1);

    drop(held);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(pool.borrow().await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_session_pool_never_opens_second_connection() {
    let state = Arc::new(FakeDriverState::default());
    let pool = DriverPool::build(fake_resolved(&state), &descriptor(), PoolConfig::single_session())
        .await
        .unwrap();

    // Hammer the borrow/return path; the deferred return races the next
    // borrow, and the pool must never open a second server session.
    for _ in 0..200 {
        let conn = pool.borrow().await.unwrap();
        conn.execute("select 1").await.unwrap();
        drop(conn);
    }

    assert_eq!(state.max_open.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pooled_connection_is_a_connection_trait_object() {
    let state = Arc::new(FakeDriverState::default());
    let config = PoolConfig::standard().with_min_idle(0);
    let pool = DriverPool::build(fake_resolved(&state), &descriptor(), config)
        .await
        .unwrap();

    let conn = pool.borrow().await.unwrap();
    let obj: &dyn Connection = &*conn;
    assert!(obj.is_valid().await);
    assert!(conn.connection().is_valid().await);
    assert!(format!("{conn:?}").contains("DriverPool"));
}

#[tokio::test]
async fn test_stale_idle_connection_is_discarded_and_replaced() {
    let state = Arc::new(FakeDriverState::default());
    let config = PoolConfig::standard().with_min_idle(1);
    let pool = DriverPool::build(fake_resolved(&state), &descriptor(), config)
        .await
        .unwrap();
    assert_eq!(state.connects.load(Ordering::Relaxed), 1);

    state.kill_existing();

    // The dead idle connection fails the probe; a fresh one replaces it.
    let conn = pool.borrow().await.unwrap();
    assert!(conn.execute("select 1").await.is_ok());
    assert_eq!(state.connects.load(Ordering::Relaxed), 2);
    assert_eq!(pool.stats().validation_failures, 1);
    assert_eq!(pool.stats().connections_closed, 1);
}

// ==================== Close Tests ====================

#[tokio::test]
async fn test_close_is_idempotent_and_rejects_borrows() {
    let state = Arc::new(FakeDriverState::default());
    let config = PoolConfig::standard().with_min_idle(2);
    let pool = DriverPool::build(fake_resolved(&state), &descriptor(), config)
        .await
        .unwrap();

    pool.close().await;
    pool.close().await;

    assert_eq!(state.closes.load(Ordering::Relaxed), 2);
    assert_eq!(pool.size(), 0);

    let err = pool.borrow().await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));
}

#[tokio::test]
async fn test_connection_returned_after_close_is_discarded() {
    let state = Arc::new(FakeDriverState::default());
    let config = PoolConfig::standard().with_min_idle(0);
    let pool = DriverPool::build(fake_resolved(&state), &descriptor(), config)
        .await
        .unwrap();

    let conn = pool.borrow().await.unwrap();
    pool.close().await;
    drop(conn);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(state.closes.load(Ordering::Relaxed), 1);
    assert_eq!(pool.size(), 0);
}
