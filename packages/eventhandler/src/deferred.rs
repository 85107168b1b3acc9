//! Possibly-deferred computations with bounded waits.
//!
//! A [`Deferred`] is either already settled (a value or an error) or still in
//! flight on a spawned tokio task. Spawning starts the work immediately, so a
//! caller can start many deferred computations before waiting on any of them.
//!
//! There is no unbounded accessor. [`Deferred::wait`] always takes a timeout;
//! on expiry the backing task is aborted and the wait fails with
//! [`EventHandlerError::Timeout`]. Aborting one deferred never touches any
//! other.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use eventhandler::Deferred;
//!
//! let pending = Deferred::spawn(async { Ok(fetch_document().await?) });
//! let settled = Deferred::ready(serde_json::json!({}));
//!
//! let doc = pending.wait(Duration::from_secs(5)).await?;
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::error::EventHandlerError;

/// A value that may already be known or may still be computing.
pub enum Deferred<T> {
    /// Settled successfully.
    Ready(T),
    /// Settled with an error.
    Failed(anyhow::Error),
    /// Still running on a spawned task.
    Pending(JoinHandle<Result<T>>),
}

impl<T> Deferred<T> {
    /// Create an already-settled successful value.
    pub fn ready(value: T) -> Self {
        Deferred::Ready(value)
    }

    /// Create an already-settled failure.
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        Deferred::Failed(error.into())
    }

    /// Returns true while the backing task has not finished.
    pub fn is_pending(&self) -> bool {
        match self {
            Deferred::Pending(handle) => !handle.is_finished(),
            _ => false,
        }
    }

    /// Wait at most `timeout` for the outcome.
    ///
    /// Settled variants return immediately. For a pending computation:
    /// - completion within the timeout yields the task's own result
    /// - a panicking task yields [`EventHandlerError::TaskPanicked`]
    /// - an externally cancelled task yields [`EventHandlerError::TaskCancelled`]
    /// - expiry aborts the task and yields [`EventHandlerError::Timeout`]
    pub async fn wait(self, timeout: Duration) -> Result<T> {
        match self {
            Deferred::Ready(value) => Ok(value),
            Deferred::Failed(error) => Err(error),
            Deferred::Pending(mut handle) => {
                match tokio::time::timeout(timeout, &mut handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) if join_error.is_panic() => {
                        Err(EventHandlerError::TaskPanicked {
                            message: panic_message(join_error.into_panic()),
                        }
                        .into())
                    }
                    Ok(Err(_)) => Err(EventHandlerError::TaskCancelled.into()),
                    Err(_) => {
                        handle.abort();
                        Err(EventHandlerError::Timeout { duration: timeout }.into())
                    }
                }
            }
        }
    }
}

impl<T: Send + 'static> Deferred<T> {
    /// Start `future` on the runtime right away.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Deferred::Pending(tokio::spawn(future))
    }
}

impl<T> From<Result<T>> for Deferred<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Deferred::Ready(value),
            Err(error) => Deferred::Failed(error),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferred::Ready(_) => write!(f, "Deferred::Ready"),
            Deferred::Failed(e) => write!(f, "Deferred::Failed({})", e),
            Deferred::Pending(handle) => {
                write!(f, "Deferred::Pending(finished={})", handle.is_finished())
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
