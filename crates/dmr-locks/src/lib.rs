//! Distributed advisory locking over the `locks` table (spec.md §4.C).
//!
//! A lock here is a named resource, not a database-level lock: acquiring
//! writes a row, releasing deletes it. Contention is handled by polling with
//! exponential backoff rather than blocking on a database wait primitive,
//! so it behaves the same way against both PostgreSQL and SQLite.

use dmr_db::DbPool;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Initial retry delay when a lock is contended.
pub const INITIAL_BACKOFF_MS: u64 = 50;
/// Retry delay never exceeds this.
pub const MAX_BACKOFF_MS: u64 = 1_000;
/// Jitter applied to each computed delay, as a fraction either side.
pub const JITTER_FRACTION: f64 = 0.25;

/// A held lock. Dropping it without calling [`LockGuard::release`] leaves
/// the row in place for the startup reaper to eventually clear — callers
/// are expected to release explicitly, mirroring the teacher's preference
/// for explicit transaction commit/rollback over drop-based cleanup.
pub struct LockGuard<'a> {
    pool: &'a DbPool,
    resource_key: String,
    modifier_id: String,
    released: bool,
}

impl<'a> LockGuard<'a> {
    pub async fn release(mut self) -> anyhow::Result<()> {
        dmr_db::locks::release(self.pool, &self.resource_key, &self.modifier_id).await?;
        self.released = true;
        Ok(())
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        if !self.released {
            warn!(resource_key = %self.resource_key, "lock guard dropped without explicit release");
        }
    }
}

/// Backoff delay for retry attempt `n` (0-based), capped at
/// [`MAX_BACKOFF_MS`] and jittered by ±[`JITTER_FRACTION`].
fn backoff_delay(attempt: u32) -> Duration {
    let base = (INITIAL_BACKOFF_MS.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))).min(MAX_BACKOFF_MS);
    let jitter_span = (base as f64 * JITTER_FRACTION) as i64;
    let jitter = if jitter_span > 0 {
        rand::thread_rng().gen_range(-jitter_span..=jitter_span)
    } else {
        0
    };
    let millis = (base as i64 + jitter).max(1) as u64;
    Duration::from_millis(millis)
}

/// Acquire `resource_key` for `modifier_id`, retrying with exponential
/// backoff until it succeeds or `timeout` elapses. The wait is cancellable
/// through `cancel`: if it resolves before the lock is acquired, acquisition
/// stops and returns `Ok(None)`.
pub async fn acquire_with_backoff<'a>(
    pool: &'a DbPool,
    resource_key: &str,
    modifier_id: &str,
    timeout: Duration,
    cancel: impl std::future::Future<Output = ()>,
) -> anyhow::Result<Option<LockGuard<'a>>> {
    tokio::pin!(cancel);
    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempt = 0u32;

    loop {
        if dmr_db::locks::try_acquire(pool, resource_key, modifier_id).await? {
            debug!(resource_key, modifier_id, attempt, "lock acquired");
            return Ok(Some(LockGuard {
                pool,
                resource_key: resource_key.to_string(),
                modifier_id: modifier_id.to_string(),
                released: false,
            }));
        }

        if tokio::time::Instant::now() >= deadline {
            debug!(resource_key, modifier_id, "lock acquisition timed out");
            return Ok(None);
        }

        let delay = backoff_delay(attempt).min(deadline.saturating_duration_since(tokio::time::Instant::now()));
        tokio::select! {
            _ = sleep(delay) => {}
            _ = &mut cancel => {
                debug!(resource_key, modifier_id, "lock acquisition cancelled");
                return Ok(None);
            }
        }
        attempt = attempt.saturating_add(1);
    }
}

/// Acquire without a cancellation source, retrying until `timeout` elapses.
pub async fn acquire(pool: &DbPool, resource_key: &str, modifier_id: &str, timeout: Duration) -> anyhow::Result<Option<LockGuard<'_>>> {
    acquire_with_backoff(pool, resource_key, modifier_id, timeout, std::future::pending()).await
}

/// Release every lock row older than `max_age`, run once at process startup
/// to clear locks orphaned by a prior crash (spec.md §4.C).
pub async fn reap_stale_locks(pool: &DbPool, max_age: Duration) -> anyhow::Result<u64> {
    let reaped = dmr_db::locks::reap_stale(pool, max_age.as_micros() as i64).await?;
    if reaped > 0 {
        warn!(reaped, "startup lock reaper cleared stale locks");
    }
    Ok(reaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmr_db::{ensure_schema, DbPool};
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_succeeds_immediately_when_uncontended() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();

        let guard = acquire(&pool, "entity:1", "worker-a", Duration::from_millis(100)).await.unwrap();
        assert!(guard.is_some());
        guard.unwrap().release().await.unwrap();
    }

    #[tokio::test]
    async fn acquire_times_out_when_contended() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();

        let holder = acquire(&pool, "entity:2", "worker-a", Duration::from_millis(100)).await.unwrap().unwrap();
        let blocked = acquire(&pool, "entity:2", "worker-b", Duration::from_millis(120)).await.unwrap();
        assert!(blocked.is_none());
        holder.release().await.unwrap();
    }

    #[tokio::test]
    async fn acquire_succeeds_once_released_by_holder() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();

        let holder = acquire(&pool, "entity:3", "worker-a", Duration::from_millis(50)).await.unwrap().unwrap();
        tokio::spawn({
            let pool = pool.clone();
            async move {
                sleep(Duration::from_millis(60)).await;
                dmr_db::locks::release(&pool, "entity:3", "worker-a").await.unwrap();
            }
        });
        drop(holder);

        let second = acquire(&pool, "entity:3", "worker-b", Duration::from_millis(500)).await.unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn backoff_delay_never_exceeds_cap_plus_jitter() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt).as_millis() as u64;
            assert!(d <= MAX_BACKOFF_MS + (MAX_BACKOFF_MS as f64 * JITTER_FRACTION) as u64 + 1);
        }
    }
}
