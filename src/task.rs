//! One-shot async task results and lock-free progress values
//!
//! `AsyncTask<T>` is a single-writer, many-reader completion cell: the first
//! `succeed`/`fail` wins and every observer sees the same terminal state.

use crate::error::TakiError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Fractional progress shared between threads. -1 means indeterminate.
#[derive(Debug)]
pub struct ProgressCell {
    bits: AtomicU64,
}

impl ProgressCell {
    pub const INDETERMINATE: f64 = -1.0;

    pub fn new(value: f64) -> Self {
        ProgressCell {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub fn indeterminate() -> Self {
        Self::new(Self::INDETERMINATE)
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }

    pub fn is_indeterminate(&self) -> bool {
        self.get() < 0.0
    }
}

impl Default for ProgressCell {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Anything that can report how far along it is.
pub trait Progressive {
    /// Progress in [0, 1], or -1 when the amount of work is unknown
    fn progress(&self) -> f64;
}

#[derive(Debug, Clone)]
pub enum TaskState<T> {
    Pending,
    Succeeded(T),
    Failed(Arc<TakiError>),
}

impl<T> TaskState<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskState::Pending)
    }
}

/// Cloneable handle to a one-shot result.
#[derive(Debug)]
pub struct AsyncTask<T> {
    tx: Arc<watch::Sender<TaskState<T>>>,
}

impl<T> Clone for AsyncTask<T> {
    fn clone(&self) -> Self {
        AsyncTask {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone> Default for AsyncTask<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> AsyncTask<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TaskState::Pending);
        AsyncTask { tx: Arc::new(tx) }
    }

    /// Move to a terminal state. Returns false if the task was already done.
    pub fn complete(&self, result: Result<T, TakiError>) -> bool {
        let mut next = Some(match result {
            Ok(v) => TaskState::Succeeded(v),
            Err(e) => TaskState::Failed(Arc::new(e)),
        });
        self.tx.send_if_modified(|state| {
            if state.is_pending() {
                *state = next.take().unwrap_or(TaskState::Pending);
                true
            } else {
                false
            }
        })
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, err: TakiError) -> bool {
        self.complete(Err(err))
    }

    pub fn state(&self) -> TaskState<T> {
        self.tx.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        !self.tx.borrow().is_pending()
    }

    /// Whether two handles refer to the same task
    pub fn same_task(&self, other: &AsyncTask<T>) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    /// Wait for the terminal state.
    pub async fn wait(&self) -> Result<T, Arc<TakiError>> {
        let mut rx = self.tx.subscribe();
        let state = match rx.wait_for(|s| !s.is_pending()).await {
            Ok(state) => state.clone(),
            // The sender lives in `self`, so this only happens during teardown
            Err(_) => return Err(Arc::new(TakiError::protocol("task dropped"))),
        };
        match state {
            TaskState::Succeeded(v) => Ok(v),
            TaskState::Failed(e) => Err(e),
            TaskState::Pending => Err(Arc::new(TakiError::protocol("task still pending"))),
        }
    }

    /// Wait for the terminal state or the token, whichever comes first.
    /// Giving up never affects the task itself.
    pub async fn wait_cancellable(&self, cancel: &CancellationToken) -> Result<T, TakiError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TakiError::Cancelled),
            res = self.wait() => res.map_err(TakiError::Shared),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> AsyncTask<T> {
    /// Run `f` on the blocking pool and complete with its result. A panic in
    /// `f` fails the task instead of leaving it pending forever.
    pub fn spawn_blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T, TakiError> + Send + 'static,
    {
        let task = Self::new();
        let handle = tokio::task::spawn_blocking(f);
        let done = task.clone();
        tokio::spawn(async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(TakiError::protocol(format!("task aborted: {e}"))),
            };
            done.complete(result);
        });
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_progress_cell() {
        let cell = ProgressCell::indeterminate();
        assert!(cell.is_indeterminate());
        cell.set(0.25);
        assert_eq!(cell.get(), 0.25);
        cell.set(1.0);
        assert!(!cell.is_indeterminate());
        assert_eq!(cell.get(), 1.0);
    }

    #[test]
    fn test_progress_cell_across_threads() {
        let cell = Arc::new(ProgressCell::default());
        let writer = {
            let cell = cell.clone();
            std::thread::spawn(move || {
                for i in 0..=1000 {
                    cell.set(i as f64 / 1000.0);
                }
            })
        };
        for _ in 0..1000 {
            let v = cell.get();
            assert!((0.0..=1.0).contains(&v));
        }
        writer.join().unwrap();
        assert_eq!(cell.get(), 1.0);
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let task: AsyncTask<u32> = AsyncTask::new();
        assert!(!task.is_done());
        assert!(task.succeed(1));
        assert!(!task.succeed(2));
        assert!(!task.fail(TakiError::Config));
        assert_eq!(task.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_many_observers_see_same_failure() {
        let task: AsyncTask<String> = AsyncTask::new();
        let mut waiters = Vec::new();
        for _ in 0..8 {
            let t = task.clone();
            waiters.push(tokio::spawn(async move { t.wait().await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.fail(TakiError::Config);

        let mut errors = Vec::new();
        for w in waiters {
            errors.push(w.await.unwrap().unwrap_err());
        }
        assert!(errors.iter().all(|e| Arc::ptr_eq(e, &errors[0])));
        assert!(matches!(errors[0].as_ref(), TakiError::Config));
    }

    #[tokio::test]
    async fn test_wait_cancellable_leaves_task_alone() {
        let task: AsyncTask<u8> = AsyncTask::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            task.wait_cancellable(&cancel).await,
            Err(TakiError::Cancelled)
        ));
        assert!(!task.is_done());
        task.succeed(9);
        assert_eq!(task.wait_cancellable(&CancellationToken::new()).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_spawn_blocking_result_and_panic() {
        let ok = AsyncTask::spawn_blocking(|| Ok(21 * 2));
        assert_eq!(ok.wait().await.unwrap(), 42);

        let boom: AsyncTask<u8> = AsyncTask::spawn_blocking(|| panic!("boom"));
        let err = boom.wait().await.unwrap_err();
        assert!(matches!(err.as_ref(), TakiError::Protocol(_)));
    }
}
