//! Fail-open helpers for side work that must never sink a run
//!
//! Status snapshot writes, agent teardown and supervisor checks go through
//! these helpers: a failure is logged and swallowed.
//!
//! Never use them for install steps or plan construction. Those errors are
//! the report.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::retry::ExponentialBackoff;
use crate::Result;

/// Run `f`, logging and discarding any error
///
/// ```no_run
/// use pfsmon_core::fail_open::fail_open;
/// use pfsmon_core::Result;
///
/// async fn write_snapshot() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     // None if the write failed
///     let written = fail_open("status snapshot", || write_snapshot()).await;
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Like [`fail_open`], retrying up to `max_attempts` times
///
/// Delays start at 100ms and double between attempts.
pub async fn fail_open_with_retries<F, Fut, T>(
    operation_name: &str,
    mut f: F,
    max_attempts: usize,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5));

    for attempt in 1..=max_attempts {
        match f().await {
            Ok(val) => return Some(val),
            Err(e) => {
                if attempt == max_attempts {
                    warn!(
                        "{} failed after {} attempts (fail-open): {}",
                        operation_name, max_attempts, e
                    );
                    return None;
                }
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_attempts, e
                );
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
    None
}
