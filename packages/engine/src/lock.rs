//! Advisory locking so exactly one scheduler replica runs a tick at a time
//! (C2). Mirrors the teacher's pattern of parking a dedicated `PgConnection`
//! for the duration of a session-scoped `pg_try_advisory_lock` and releasing
//! it explicitly with `pg_advisory_unlock`, rather than relying on
//! transaction-scoped locks that `PgPool` can't guarantee stick to one
//! connection.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

/// Arbitrary two-part key identifying the scheduler's lock in the
/// `pg_advisory_lock` keyspace. Any other two i32s would do; these just need
/// to not collide with a lock taken elsewhere in the same database.
pub const LOCK_CLASS_ID: i64 = 7345;
pub const LOCK_OBJ_ID: i64 = 9913;

#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Attempts to acquire the lock without blocking. Returns `true` if
    /// acquired. Must be paired with a later `release` call from the same
    /// `AdvisoryLock` instance.
    async fn try_acquire(&self) -> anyhow::Result<bool>;
    async fn release(&self) -> anyhow::Result<()>;
}

/// Postgres-backed advisory lock. Holds one checked-out connection for the
/// lifetime of the lock, since `pg_advisory_lock`/`pg_advisory_unlock` are
/// session-scoped and a pool may otherwise hand the session connection back
/// out from under the lock holder.
pub struct PgAdvisoryLock {
    pool: Pool<Postgres>,
    conn: tokio::sync::Mutex<Option<sqlx::pool::PoolConnection<Postgres>>>,
}

impl PgAdvisoryLock {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl AdvisoryLock for PgAdvisoryLock {
    async fn try_acquire(&self) -> anyhow::Result<bool> {
        let mut guard = self.conn.lock().await;
        let mut conn = self.pool.acquire().await?;
        let acquired: (bool,) =
            sqlx::query_as("SELECT pg_try_advisory_lock($1, $2)")
                .bind(LOCK_CLASS_ID)
                .bind(LOCK_OBJ_ID)
                .fetch_one(&mut *conn)
                .await?;
        if acquired.0 {
            *guard = Some(conn);
        }
        Ok(acquired.0)
    }

    async fn release(&self) -> anyhow::Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(mut conn) = guard.take() {
            let _: (bool,) = sqlx::query_as("SELECT pg_advisory_unlock($1, $2)")
                .bind(LOCK_CLASS_ID)
                .bind(LOCK_OBJ_ID)
                .fetch_one(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

/// In-process fake used by tests: a single `AtomicBool` stands in for the
/// database-wide lock.
pub struct FakeAdvisoryLock {
    held: std::sync::atomic::AtomicBool,
}

impl FakeAdvisoryLock {
    pub fn new() -> Self {
        Self {
            held: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl Default for FakeAdvisoryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AdvisoryLock for FakeAdvisoryLock {
    async fn try_acquire(&self) -> anyhow::Result<bool> {
        Ok(self
            .held
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_ok())
    }

    async fn release(&self) -> anyhow::Result<()> {
        self.held.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_lock_is_exclusive() {
        let lock = FakeAdvisoryLock::new();
        assert!(lock.try_acquire().await.unwrap());
        assert!(!lock.try_acquire().await.unwrap());
        lock.release().await.unwrap();
        assert!(lock.try_acquire().await.unwrap());
    }
}
