use crate::core::errors::ExchangeError;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    rx: mpsc::Receiver<Job>,
    next_seq: u64,
}

/// Sequence number whose job may run next. Only used in ordered mode.
struct Turn {
    current: Mutex<u64>,
    advanced: Condvar,
}

struct Shared {
    queue: Mutex<Queue>,
    turn: Option<Turn>,
    name: String,
}

/// Runs user callbacks on its own worker threads, off the reactor.
///
/// The queue is bounded: [`submit`](Self::submit) suspends the submitting task
/// once it is full, which throttles the producer to the speed of the callback.
/// In ordered mode jobs run strictly in submission order, however many workers
/// there are; a job's sequence number is taken while the queue lock is held,
/// so sequence order is queue order.
pub struct CallbackDispatcher {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl CallbackDispatcher {
    /// FIFO dispatcher, one per stream.
    pub fn ordered(name: &str, workers: usize, capacity: usize) -> Result<Self, ExchangeError> {
        Self::spawn(name, workers, capacity, true)
    }

    /// Shared dispatcher with no ordering between jobs.
    pub fn unordered(name: &str, workers: usize, capacity: usize) -> Result<Self, ExchangeError> {
        Self::spawn(name, workers, capacity, false)
    }

    fn spawn(
        name: &str,
        workers: usize,
        capacity: usize,
        ordered: bool,
    ) -> Result<Self, ExchangeError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue { rx, next_seq: 0 }),
            turn: ordered.then(|| Turn {
                current: Mutex::new(0),
                advanced: Condvar::new(),
            }),
            name: name.to_string(),
        });

        let handles = (0..workers.max(1))
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("{}-cb-{}", name, index))
                    .spawn(move || worker_loop(&shared))
                    .map_err(|e| {
                        ExchangeError::Other(format!("failed to spawn callback worker: {}", e))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            tx,
            workers: handles,
        })
    }

    /// Queue `job`, waiting for room if the queue is full.
    pub async fn submit<F>(&self, job: F) -> Result<(), ExchangeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Box::new(job))
            .await
            .map_err(|_| ExchangeError::DispatcherClosed)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl std::fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        // Workers exit once every sender is dropped and the queue is drained.
        let next = {
            let mut queue = shared.queue.lock();
            let job = queue.rx.blocking_recv();
            job.map(|job| {
                let seq = queue.next_seq;
                queue.next_seq += 1;
                (seq, job)
            })
        };
        let Some((seq, job)) = next else {
            trace!(dispatcher = %shared.name, "callback worker exiting");
            return;
        };

        if let Some(turn) = &shared.turn {
            let mut current = turn.current.lock();
            while *current != seq {
                turn.advanced.wait(&mut current);
            }
        }

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(dispatcher = %shared.name, seq, "user callback panicked");
        }

        if let Some(turn) = &shared.turn {
            *turn.current.lock() += 1;
            turn.advanced.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ordered_with_many_workers_keeps_fifo() {
        let dispatcher = CallbackDispatcher::ordered("test", 4, 2).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 0..50u64 {
            let tx = tx.clone();
            dispatcher
                .submit(move || {
                    // later jobs finish faster, which would reorder an unordered pool
                    std::thread::sleep(Duration::from_micros(50 * (50 - i)));
                    let _ = tx.send(i);
                })
                .await
                .unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(i) = rx.recv().await {
            seen.push(i);
        }
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_applies_backpressure() {
        let dispatcher = CallbackDispatcher::ordered("bp", 1, 1).unwrap();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        // Occupy the single worker until the gate opens.
        let blocker = Arc::clone(&gate);
        dispatcher
            .submit(move || {
                let (open, cv) = &*blocker;
                let mut open = open.lock();
                while !*open {
                    cv.wait(&mut open);
                }
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One slot in the queue.
        dispatcher.submit(|| {}).await.unwrap();

        // The next submit has to wait.
        let blocked = tokio::time::timeout(Duration::from_millis(100), dispatcher.submit(|| {}))
            .await
            .is_err();
        assert!(blocked);

        let (open, cv) = &*gate;
        *open.lock() = true;
        cv.notify_all();

        tokio::time::timeout(Duration::from_secs(2), dispatcher.submit(|| {}))
            .await
            .expect("queue should drain")
            .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_stall_queue() {
        let dispatcher = CallbackDispatcher::ordered("panic", 1, 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();

        dispatcher.submit(|| panic!("user bug")).await.unwrap();
        let seen = Arc::clone(&counter);
        dispatcher
            .submit(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unordered_runs_all_jobs() {
        let dispatcher = CallbackDispatcher::unordered("rest", 3, 8).unwrap();
        assert_eq!(dispatcher.worker_count(), 3);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..20 {
            let tx = tx.clone();
            dispatcher.submit(move || drop(tx.send(i))).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(i) = rx.recv().await {
            seen.push(i);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }
}
