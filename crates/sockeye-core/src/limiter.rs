//! Per-session dispatch strategy and the global internal-task counter.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Semaphore;

use crate::config::ErrorHandler;
use crate::error::Error;

/// Counts tasks spawned by the engine so shutdown can drain them.
#[derive(Clone, Default)]
pub(crate) struct TaskCounter(Arc<AtomicI64>);

impl TaskCounter {
    pub(crate) fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    /// Spawn a task counted for the lifetime of the future.
    pub(crate) fn spawn_counted<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.0.fetch_add(1, Ordering::AcqRel);
        let counter = self.clone();
        tokio::spawn(async move {
            fut.await;
            counter.0.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

type Work = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Clone)]
enum Mode {
    /// Every dispatch in a fresh task, no bound.
    Unlimited,
    /// Run on the dispatching task; the read loop blocks until the callback
    /// returns, which preserves arrival order.
    Inline,
    /// At most `n` concurrent dispatch tasks; overflow drops the message.
    Bounded(Arc<Semaphore>),
}

/// Bounds how many user callbacks run concurrently for one session.
///
/// The mode is selected by the sign of the configured limit: negative is
/// [`Mode::Unlimited`], zero [`Mode::Inline`], positive [`Mode::Bounded`].
/// Spawned dispatches are counted in the global task counter; a dropped
/// message is reported through the error handler as [`Error::RateLimited`].
#[derive(Clone)]
pub(crate) struct RateLimiter {
    mode: Mode,
    counter: TaskCounter,
    errors: ErrorHandler,
}

impl RateLimiter {
    pub(crate) fn new(limit: i32, counter: TaskCounter, errors: ErrorHandler) -> Self {
        let mode = match limit {
            n if n < 0 => Mode::Unlimited,
            0 => Mode::Inline,
            n => Mode::Bounded(Arc::new(Semaphore::new(n as usize))),
        };
        Self { mode, counter, errors }
    }

    pub(crate) async fn dispatch(&self, work: Work) {
        match &self.mode {
            Mode::Unlimited => self.counter.spawn_counted(work),
            Mode::Inline => work.await,
            Mode::Bounded(semaphore) => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => self.counter.spawn_counted(async move {
                    work.await;
                    drop(permit);
                }),
                Err(_) => self.errors.call(Error::RateLimited),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn noop_errors() -> ErrorHandler {
        ErrorHandler::default()
    }

    #[tokio::test]
    async fn inline_runs_on_the_calling_task() {
        let limiter = RateLimiter::new(0, TaskCounter::default(), noop_errors());
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        limiter
            .dispatch(Box::pin(async move {
                flag.fetch_add(1, Ordering::SeqCst);
            }))
            .await;
        // Inline mode completes before dispatch returns.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bounded_drops_overflow() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let seen = dropped.clone();
        let errors = ErrorHandler::new(move |err| {
            if matches!(err, Error::RateLimited) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        let counter = TaskCounter::default();
        let limiter = RateLimiter::new(1, counter.clone(), errors);

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        limiter
            .dispatch(Box::pin(async move {
                let _ = release_rx.await;
            }))
            .await;
        limiter.dispatch(Box::pin(async {})).await;

        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        release_tx.send(()).unwrap();

        // The surviving task drains from the counter.
        tokio::time::timeout(Duration::from_secs(1), async {
            while counter.get() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("counted task should exit");
    }

    #[tokio::test]
    async fn unlimited_counts_every_dispatch() {
        let counter = TaskCounter::default();
        let limiter = RateLimiter::new(-1, counter.clone(), noop_errors());

        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(8);
        for _ in 0..5 {
            let tx = tx.clone();
            limiter
                .dispatch(Box::pin(async move {
                    let _ = tx.send(()).await;
                }))
                .await;
        }
        drop(tx);
        for _ in 0..5 {
            rx.recv().await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while counter.get() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all counted tasks should exit");
    }
}
