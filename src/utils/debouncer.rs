//! Cancel-and-reschedule debouncing for coalescing bursts of triggers.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Returned by [`Debouncer::call`] once the debounced future has already run
/// (or its worker stopped). The caller is expected to create a fresh debouncer.
#[derive(Debug, Error)]
#[error("debouncer already finished")]
pub struct Finished;

/// Runs a future once after a quiet period. Every [`Debouncer::call`] before
/// the deadline pushes it out by the full period again. Dropping the handle
/// cancels a run that has not started yet.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
    handle: JoinHandle<()>,
}

/// Schedule `future` to run after `duration` of quiet.
pub fn debounce<F>(duration: Duration, future: F) -> Debouncer
where
    F: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(worker(duration, rx, future));
    Debouncer { tx, handle }
}

async fn worker<F>(duration: Duration, mut rx: mpsc::UnboundedReceiver<()>, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut deadline = Instant::now() + duration;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                future.await;
                return;
            }
            msg = rx.recv() => match msg {
                Some(()) => deadline = Instant::now() + duration,
                // Handle dropped: cancel without running.
                None => return,
            },
        }
    }
}

impl Debouncer {
    /// Push the deadline out by the full quiet period.
    pub fn call(&self) -> Result<(), Finished> {
        self.tx.send(()).map_err(|_| Finished)
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    #[tokio::test]
    async fn burst_of_calls_runs_future_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let debouncer = debounce(Duration::from_millis(30), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            debouncer.call().unwrap();
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(100)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(debouncer.call().is_err());
    }

    #[tokio::test]
    async fn drop_cancels_pending_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let debouncer = debounce(Duration::from_millis(20), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.call().unwrap();
        drop(debouncer);

        sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn calls_keep_pushing_the_deadline() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let debouncer = debounce(Duration::from_millis(40), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Three pushes, each inside the quiet period: nothing may run yet.
        for _ in 0..3 {
            sleep(Duration::from_millis(20)).await;
            debouncer.call().unwrap();
            assert_eq!(runs.load(Ordering::SeqCst), 0);
        }
        sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
