// Retry helpers with exponential backoff

//! Generic retry helpers
//!
//! Two small wrappers used at the network seams: an async variant for
//! inventory HTTP calls and a blocking variant for the per-switch SNMP
//! entry point (which runs on the blocking pool). Delay doubles per
//! attempt, capped at `max_delay`.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;

/// Run `op` up to `attempts` times, sleeping between failures. The final
/// error is returned unchanged.
pub async fn retry_async<T, F, Fut>(
    attempts: u32,
    min_delay: Duration,
    max_delay: Duration,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = min_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                log::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {:#}",
                    what,
                    attempt,
                    attempts,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Blocking counterpart of [`retry_async`]; must not be called from an
/// async context.
pub fn retry_blocking<T, F>(
    attempts: u32,
    min_delay: Duration,
    max_delay: Duration,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = min_delay;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                log::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {:#}",
                    what,
                    attempt,
                    attempts,
                    delay,
                    err
                );
                std::thread::sleep(delay);
                delay = (delay * 2).min(max_delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
