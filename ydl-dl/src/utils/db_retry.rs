//! Database lock retry
//!
//! Several workers write the ledger concurrently; SQLite reports contention
//! as "database is locked". Such writes are retried with exponential backoff.

use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use ydl_common::{Error, Result};

/// Upper bound on the time spent retrying one ledger write
pub const LEDGER_LOCK_WAIT: Duration = Duration::from_secs(5);

const FIRST_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Run a ledger write, retrying while SQLite reports the database as locked.
///
/// Any other error is returned on the first attempt. Once `max_wait` has
/// elapsed the lock error is converted to `Error::Locked`.
pub async fn retry_on_lock<F, Fut, T>(op: &str, max_wait: Duration, mut write: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut backoff = FIRST_BACKOFF;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let err = match write().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(op, attempts, "Ledger write went through after lock contention");
                }
                return Ok(value);
            }
            Err(err) if is_lock_error(&err) => err,
            Err(err) => return Err(err),
        };

        let waited = started.elapsed();
        if waited >= max_wait {
            error!(op, attempts, waited_ms = waited.as_millis() as u64, error = %err, "Ledger stayed locked");
            return Err(Error::Locked {
                op: op.to_string(),
                attempts,
            });
        }

        warn!(op, attempts, backoff_ms = backoff.as_millis() as u64, "Ledger locked, backing off");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn is_lock_error(err: &Error) -> bool {
    matches!(err, Error::Database(db_err) if db_err.to_string().contains("database is locked"))
}
