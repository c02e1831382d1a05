//! Named background threads with a cooperative cancel flag and a bounded join.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const JOIN_POLL: Duration = Duration::from_millis(5);

/// Cancellation flag shared between a task and its owner.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle to a spawned background thread.
#[derive(Debug)]
pub struct TaskHandle<T> {
    name: String,
    cancel: CancelToken,
    join: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Spawn `body` on a new named thread. The body receives the cancel token
    /// and is expected to check it once per iteration.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce(CancelToken) -> T + Send + 'static,
    {
        let name = name.into();
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(token))
            .with_context(|| format!("spawn thread {}", name))?;
        Ok(Self {
            name,
            cancel,
            join: Some(join),
        })
    }
}

impl<T> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Wait up to `timeout` for the thread to exit.
    ///
    /// Returns `Ok(Some(value))` when the thread finished, `Ok(None)` when it was
    /// already joined or did not finish in time (the thread is then detached).
    pub fn join_timeout(&mut self, timeout: Duration) -> Result<Option<T>> {
        let Some(join) = self.join.take() else {
            return Ok(None);
        };
        let deadline = Instant::now() + timeout;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "task {} did not exit within {:?}; detaching",
                    self.name,
                    timeout
                );
                return Ok(None);
            }
            std::thread::sleep(JOIN_POLL);
        }
        join.join()
            .map(Some)
            .map_err(|_| anyhow!("task {} panicked", self.name))
    }

    /// Cancel and then join with a bounded wait.
    pub fn stop(&mut self, timeout: Duration) -> Result<Option<T>> {
        self.cancel();
        self.join_timeout(timeout)
    }
}
