//! Session-level advisory locks over the shared pool.
//!
//! Advisory locks serialize the few critical sections that CAS rows cannot
//! cover: get-or-create of a run, and the managed-webhook create section.
//! Postgres scopes a session lock to its connection, so the guard pins one
//! pooled connection for the lock's whole lifetime.
//!
//! Release discipline: [`AdvisoryLock::release`] unlocks and returns the
//! connection to the pool. If the guard is dropped without an explicit
//! release (the holding future was cancelled), the connection is detached
//! from the pool and closed, which makes Postgres release the lock
//! server-side. Either way the lock never outlives its critical section.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::future::Future;

/// Map a lock name onto the 64-bit advisory-lock key space.
///
/// First 8 bytes of SHA-256, big-endian. Deterministic across processes and
/// releases — two workers computing the key for the same name always collide,
/// which is the point.
pub fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// A held session advisory lock. See module docs for release semantics.
pub struct AdvisoryLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
    released: bool,
}

impl AdvisoryLock {
    /// Block until the lock for `name` is held.
    pub async fn acquire(pool: &PgPool, name: &str) -> Result<Self> {
        let key = advisory_key(name);
        let mut conn = pool
            .acquire()
            .await
            .context("advisory lock: pool acquire failed")?;
        sqlx::query("select pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("pg_advisory_lock failed for {name:?}"))?;
        Ok(Self {
            conn: Some(conn),
            key,
            released: false,
        })
    }

    /// Unlock and return the connection to the pool.
    pub async fn release(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            self.released = true;
            sqlx::query("select pg_advisory_unlock($1)")
                .bind(self.key)
                .execute(&mut *conn)
                .await
                .context("pg_advisory_unlock failed")?;
        }
        Ok(())
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if !self.released {
            if let Some(conn) = self.conn.take() {
                // Closing the session releases the lock server-side; returning
                // the connection to the pool would leak the lock to the next
                // borrower instead.
                drop(conn.detach());
            }
        }
    }
}

/// Run `f` while holding the advisory lock for `name`.
///
/// The lock is released before the result is returned, on the success and
/// error paths both; cancellation mid-`f` closes the pinned connection.
pub async fn with_advisory_lock<T, Fut, F>(pool: &PgPool, name: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lock = AdvisoryLock::acquire(pool, name).await?;
    let out = f().await;
    lock.release().await?;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_key_is_deterministic() {
        let a = advisory_key("sync-run:acct_1");
        let b = advisory_key("sync-run:acct_1");
        assert_eq!(a, b);
    }

    #[test]
    fn advisory_key_separates_names() {
        assert_ne!(advisory_key("sync-run:acct_1"), advisory_key("sync-run:acct_2"));
        assert_ne!(advisory_key("sync-run:a"), advisory_key("webhook-create:a"));
    }
}
