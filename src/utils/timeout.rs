//! Deadline helpers for backend calls
//!
//! The dispatcher never waits for a call past its deadline: when the timer
//! wins, the call's future is dropped, its cancellation token is fired and
//! control returns immediately.

use crate::backends::Deadline;
use std::future::Future;
use std::time::Duration;

/// Run `future` until it completes or `deadline` elapses.
///
/// On elapse the deadline's token is cancelled so work the future spawned
/// elsewhere can stop too.
pub async fn with_deadline<T, E>(
    deadline: &Deadline,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, TimeoutError<E>> {
    let limit = deadline.remaining();
    tokio::select! {
        result = future => result.map_err(TimeoutError::Inner),
        _ = tokio::time::sleep(limit) => {
            deadline.cancel();
            Err(TimeoutError::Timeout(deadline.timeout()))
        }
    }
}

/// Apply a plain timeout to an async operation
pub async fn with_timeout<T, E>(
    timeout: Duration,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, TimeoutError<E>> {
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TimeoutError::Inner(err)),
        Err(_) => Err(TimeoutError::Timeout(timeout)),
    }
}

/// Error type for timeout operations
#[derive(Debug, thiserror::Error)]
pub enum TimeoutError<E> {
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Inner(E),
}

impl<E> TimeoutError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeoutError::Timeout(_))
    }
}
