use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::{errors::Error, Result};

/// Pacing primitive: admits one operation at a time and keeps at least
/// `interval` between the end of one operation and the start of the next.
///
/// Waiters are served in FIFO order (tokio's mutex is fair).
#[derive(Debug)]
pub struct Gate {
    interval: Duration,
    /// Earliest instant the next operation may start.
    next: Mutex<Instant>,
}

/// Held while an operation is in flight; dropping it releases the gate.
#[derive(Debug)]
pub struct GatePermit<'a> {
    next: MutexGuard<'a, Instant>,
    interval: Duration,
}

impl Gate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Mutex::new(Instant::now()),
        }
    }

    /// A gate whose window starts now, as if an operation had just completed.
    pub fn cooling(interval: Duration) -> Self {
        Self {
            interval,
            next: Mutex::new(Instant::now() + interval),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for our turn, then for the spacing window to pass.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GatePermit<'_>> {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.next.lock() => guard,
        };

        let start = *next;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep_until(start) => {}
        }

        Ok(GatePermit {
            next,
            interval: self.interval,
        })
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        *self.next = Instant::now() + self.interval;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spaces_consecutive_completions() {
        let gate = Gate::new(Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let mut done = Vec::new();

        for _ in 0..3 {
            let permit = gate.acquire(&cancel).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(permit);
            done.push(Instant::now());
        }

        for pair in done.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serves_waiters_in_fifo_order() {
        let gate = Arc::new(Gate::new(Duration::from_millis(5)));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let first = gate.acquire(&cancel).await.unwrap();
        let mut tasks = Vec::new();
        for i in 0..4 {
            let gate = gate.clone();
            let order = order.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire(&cancel).await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Let the task reach the mutex queue before spawning the next one.
            tokio::task::yield_now().await;
        }
        drop(first);
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_the_wait_and_keeps_the_window() {
        let gate = Gate::new(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        drop(gate.acquire(&cancel).await.unwrap());

        let waiter = CancellationToken::new();
        waiter.cancel();
        assert!(matches!(gate.acquire(&waiter).await, Err(Error::Cancelled)));

        let before = Instant::now();
        drop(gate.acquire(&cancel).await.unwrap());
        assert!(Instant::now() - before >= Duration::from_secs(10));
    }
}
