//! Busy-lock handling for delivery store writes.
//!
//! Record saves and callback updates can collide on the SQLite write lock
//! when a dispatch finishes while callbacks stream in. The store retries those
//! writes with [`BusyRetry`]; any other error is returned immediately.

use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

/// SQLite primary result codes for a held lock.
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

/// Retry schedule for writes that hit a locked database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetry {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BusyRetry {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl BusyRetry {
    /// Never retry.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): half the capped backoff
    /// plus a random share of the other half.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let cap_ms = self.max_delay.as_millis() as u64;
        let backoff_ms = base_ms.saturating_mul(1u64 << retry.min(16)).min(cap_ms);
        let half = backoff_ms / 2;
        Duration::from_millis(half + random::<u64>() % (backoff_ms - half + 1))
    }

    /// Run `op`, repeating it while SQLite reports the database as locked.
    pub async fn run<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Err(err) if retry < self.max_retries && is_lock_contention(&err) => {
                    let delay = self.delay_for(retry);
                    retry += 1;
                    debug!(op = op_name, retry, max = self.max_retries, ?delay, "Database locked; retrying");
                    sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

/// Whether `err` is SQLite refusing a write because another connection holds the lock.
pub fn is_lock_contention(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };
    if let sqlx::Error::Database(db_err) = sqlx_err
        && let Some(code) = db_err.code()
    {
        // Extended codes carry the primary code in the low byte.
        let primary = code.parse::<u32>().map(|c| (c & 0xff).to_string()).ok();
        if matches!(primary.as_deref(), Some(SQLITE_BUSY | SQLITE_LOCKED)) {
            return true;
        }
    }
    let message = sqlx_err.to_string().to_ascii_lowercase();
    message.contains("database is locked") || message.contains("database table is locked")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn locked() -> Error {
        Error::DatabaseSqlx(sqlx::Error::Protocol("database is locked".to_string()))
    }

    fn fast() -> BusyRetry {
        BusyRetry {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_locked_write_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = fast()
            .run("save", || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(locked())
                    } else {
                        Ok("saved")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "saved");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result: Result<()> = fast()
            .run("save", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(locked())
                }
            })
            .await;

        assert!(is_lock_contention(&result.unwrap_err()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result: Result<()> = fast()
            .run("save", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::validation("bad input"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let disabled: Result<()> = BusyRetry::disabled().run("save", || async { Err(locked()) }).await;
        assert!(disabled.is_err());
    }

    #[test]
    fn test_delay_stays_within_cap() {
        let policy = BusyRetry::default();
        for retry in 0..10 {
            let delay = policy.delay_for(retry);
            assert!(delay <= policy.max_delay, "retry {} waited {:?}", retry, delay);
        }
        assert!(policy.delay_for(0) >= Duration::from_millis(10));
    }
}
