// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Harness for long-lived cooperative tasks.
//!
//! Every long-running component in drover (provisioner, uniter, hook queue,
//! presence pinger, relation watcher) is a [`Task`]: a tokio task paired with
//! a shutdown signal and a stored terminal result.  The contract:
//!
//! - `stop()` signals the task, waits for it to drop out of its next
//!   suspension point, and returns its terminal result.
//! - `wait()` waits without signalling.
//! - Both are idempotent: after the task has finished, every call returns a
//!   clone of the same stored result.
//!
//! The task body receives a [`Shutdown`] handle and is expected to select on
//! `shutdown.wait()` at every suspension point.

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A handle to a long-lived task with stop/wait semantics.
pub struct Task<E> {
    shutdown: watch::Sender<bool>,
    inner: tokio::sync::Mutex<TaskInner<E>>,
}

struct TaskInner<E> {
    handle: Option<JoinHandle<Result<(), E>>>,
    result: Option<Result<(), E>>,
}

impl<E: Clone + Send + 'static> Task<E> {
    /// Spawn `f` as a task.  `f` is given the [`Shutdown`] handle it must
    /// watch; its return value becomes the terminal result reported by
    /// `stop()` and `wait()`.
    pub fn spawn<F, Fut>(f: F) -> Task<E>
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f(Shutdown { rx }));
        Task {
            shutdown: tx,
            inner: tokio::sync::Mutex::new(TaskInner {
                handle: Some(handle),
                result: None,
            }),
        }
    }

    /// Signal the task to stop without waiting for it.
    pub fn signal(&self) {
        // The task may already have exited, in which case there is nobody
        // listening and that's fine.
        let _ = self.shutdown.send(true);
    }

    /// Signal the task to stop, wait for it to finish, and return its
    /// terminal result.  Idempotent.
    pub async fn stop(&self) -> Result<(), E> {
        self.signal();
        self.wait().await
    }

    /// Wait for the task to finish and return its terminal result.
    /// Idempotent; a second call returns a clone of the stored result.
    pub async fn wait(&self) -> Result<(), E> {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.handle.take() {
            let result = match handle.await {
                Ok(result) => result,
                Err(error) if error.is_panic() => {
                    // Programmer errors propagate; they are the only
                    // failures that abort unconditionally.
                    std::panic::resume_unwind(error.into_panic());
                }
                Err(error) => {
                    unreachable!("task cancelled unexpectedly: {}", error)
                }
            };
            inner.result = Some(result);
        }
        inner
            .result
            .clone()
            .expect("terminal result must be stored before wait() returns")
    }
}

/// The task-side view of the shutdown signal.
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Resolve once stop has been requested.  Cancel-safe; intended for use
    /// inside `tokio::select!`.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            // An error means the Task handle was dropped; treat that as a
            // stop request so the task cannot outlive its owner silently.
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Report whether stop has been requested without suspending.
    pub fn is_stopping(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[tokio::test]
    async fn stop_is_idempotent() {
        let task: Task<Boom> = Task::spawn(|mut shutdown| async move {
            shutdown.wait().await;
            Err(Boom)
        });
        assert_eq!(task.stop().await, Err(Boom));
        assert_eq!(task.stop().await, Err(Boom));
        assert_eq!(task.wait().await, Err(Boom));
    }

    #[tokio::test]
    async fn wait_returns_after_natural_exit() {
        let task: Task<Boom> = Task::spawn(|_shutdown| async move { Ok(()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(task.wait().await, Ok(()));
        assert_eq!(task.stop().await, Ok(()));
    }
}
