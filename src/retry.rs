use std::fmt;
use std::future::Future;

use tracing::debug;

/// Runs `action` up to `retries + 1` times, returning the first success or
/// the last error.
pub async fn with_retry<T, E, F, Fut>(retries: usize, action: F) -> Result<T, E>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: fmt::Display,
{
  with_retry_and_cleanup(retries, action, || async {}).await
}

/// Like [`with_retry`], awaiting `cleanup` after each failed attempt that
/// will be retried.
pub async fn with_retry_and_cleanup<T, E, F, Fut, C, CFut>(
  retries: usize,
  mut action: F,
  mut cleanup: C,
) -> Result<T, E>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  C: FnMut() -> CFut,
  CFut: Future<Output = ()>,
  E: fmt::Display,
{
  let mut attempt = 0usize;
  loop {
    match action().await {
      Ok(value) => return Ok(value),
      Err(error) if attempt < retries => {
        debug!(attempt, remaining = retries - attempt, error = %error, "attempt failed; retrying");
        attempt += 1;
        cleanup().await;
      }
      Err(error) => return Err(error),
    }
  }
}
