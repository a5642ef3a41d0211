//! Fixed-backoff retry helper for fallible async operations.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Run `op` up to `attempts` times, sleeping `backoff` between failures.
/// Returns the first success, or the last error once attempts are spent.
pub async fn retry<T, F, Fut>(attempts: u32, backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Internal("retry called with zero attempts".into())))
}
