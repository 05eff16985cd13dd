use crate::core::errors::ExchangeError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Upper bound on contexts per pool, whatever the caller asks for.
pub const MAX_CONTEXTS: usize = 24;

/// One single-threaded reactor and the thread that drives it.
///
/// The reactor blocks on a keep-alive receiver so it stays up while idle.
/// Releasing the keep-alive makes `block_on` return; the runtime is then
/// dropped on its own thread, which cancels every task still parked on I/O.
pub struct ExecutionContext {
    handle: Handle,
    keep_alive: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ExecutionContext {
    pub fn start(name: &str) -> Result<Self, ExchangeError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ExchangeError::Other(format!("failed to build reactor: {}", e)))?;
        let handle = runtime.handle().clone();
        let (keep_alive, released) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = released.await;
                });
                drop(runtime);
            })
            .map_err(|e| ExchangeError::Other(format!("failed to spawn reactor thread: {}", e)))?;

        debug!(context = name, "execution context started");
        Ok(Self {
            handle,
            keep_alive: Some(keep_alive),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Release the keep-alive, let the reactor wind down, then join.
    pub fn stop(&mut self) {
        if let Some(keep_alive) = self.keep_alive.take() {
            let _ = keep_alive.send(());
        }
        if let Some(thread) = self.thread.take() {
            // A callback running on this very reactor cannot join itself.
            if thread.thread().id() == std::thread::current().id() {
                warn!("execution context stopped from its own thread, not joining");
                return;
            }
            if thread.join().is_err() {
                warn!("execution context thread panicked");
            }
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fixed set of execution contexts handed out round-robin.
pub struct ExecutionContextPool {
    name: String,
    contexts: Vec<ExecutionContext>,
    cursor: AtomicUsize,
}

impl ExecutionContextPool {
    /// An empty pool; `next` yields nothing until one is started.
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            contexts: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Start `count` contexts, clamped to `1..=MAX_CONTEXTS`.
    pub fn start(name: &str, count: usize) -> Result<Self, ExchangeError> {
        let count = count.clamp(1, MAX_CONTEXTS);
        let contexts = (0..count)
            .map(|index| ExecutionContext::start(&format!("{}-{}", name, index)))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(pool = name, contexts = count, "execution context pool started");
        Ok(Self {
            name: name.to_string(),
            contexts,
            cursor: AtomicUsize::new(0),
        })
    }

    /// The next reactor, round-robin. Safe to call from any thread.
    pub fn next(&self) -> Option<Handle> {
        if self.contexts.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        Some(self.contexts[index].handle().clone())
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Stop and join every context. A no-op on an empty or stopped pool.
    pub fn stop(&mut self) {
        if self.contexts.is_empty() {
            return;
        }
        for context in &mut self.contexts {
            context.stop();
        }
        self.contexts.clear();
        debug!(pool = %self.name, "execution context pool stopped");
    }
}

impl Drop for ExecutionContextPool {
    fn drop(&mut self) {
        self.stop();
    }
}
