//! Bounded retry loop for optimistic (CAS) writes.

use std::future::Future;

use crate::error::{Result, SyncError};

/// Outcome of one optimistic attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    /// The attempt committed (or found nothing to do).
    Done(T),
    /// Another writer won the compare-and-swap; recompute and try again.
    Retry,
}

/// Run `attempt` until it returns [`Attempt::Done`], at most `limit` times.
///
/// Errors from an attempt end the loop immediately. Running out of attempts
/// yields [`SyncError::Failed`].
pub async fn with_retries<T, F, Fut>(limit: usize, operation: &str, mut attempt: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    for n in 1..=limit {
        match attempt(n).await? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Retry => {
                log::debug!("{}: write conflict on attempt {}/{}", operation, n, limit);
            }
        }
    }
    Err(SyncError::Failed(format!(
        "{} gave up after {} conflicting attempts",
        operation, limit
    )))
}
