//! The engine facade: REST calls, market streams and the user-data stream,
//! all answered through callbacks.

pub mod builder;
pub mod streams;

pub use builder::EngineBuilder;

use crate::core::config::ConnectionConfig;
use crate::core::errors::ExchangeError;
use crate::core::kernel::context::ExecutionContextPool;
use crate::core::kernel::dispatch::CallbackDispatcher;
use crate::core::kernel::listen_key::ListenKeyManager;
use crate::core::kernel::registry::SessionRegistry;
use crate::core::kernel::rest::RestSession;
use crate::core::kernel::signer::{Clock, Signer};
use crate::core::kernel::transport::Transport;
use crate::core::kernel::ws::WsSession;
use crate::core::types::{RestRequest, RestResult, WsCallback, WsResult, WsToken};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Worker count and queue depth of a callback dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSizing {
    pub workers: usize,
    pub capacity: usize,
}

impl DispatchSizing {
    pub const REST: Self = Self {
        workers: 4,
        capacity: 256,
    };
    pub const STREAM: Self = Self {
        workers: 1,
        capacity: 4,
    };
}

/// Owns the reactors, the session registry and the listen key.
///
/// Every method is callable from any thread, including from inside a
/// callback. Results are never delivered on the caller's stack except when
/// the engine is already stopped, or for the synchronous listen-key calls.
pub struct Engine {
    transport: Arc<Transport>,
    rest_pool: Mutex<ExecutionContextPool>,
    ws_pool: Mutex<ExecutionContextPool>,
    registry: Arc<SessionRegistry>,
    rest_dispatcher: Arc<CallbackDispatcher>,
    listen_keys: ListenKeyManager,
    signer: Option<Arc<dyn Signer>>,
    clock: Arc<dyn Clock>,
    ws_dispatch: DispatchSizing,
    running: AtomicBool,
}

impl Engine {
    pub fn builder(config: ConnectionConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.transport.config()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn rest_contexts(&self) -> usize {
        self.rest_pool.lock().len()
    }

    pub fn ws_contexts(&self) -> usize {
        self.ws_pool.lock().len()
    }

    /// Open streams that have not finished closing.
    pub fn open_streams(&self) -> usize {
        self.registry.len()
    }

    pub fn is_stream_open(&self, token: WsToken) -> bool {
        self.registry.contains(token)
    }

    /// Send one REST call. `callback` receives its result exactly once.
    #[instrument(skip(self, request, callback), fields(method = %request.method, path = %request.path))]
    pub fn send_rest_request<F>(&self, request: RestRequest, callback: F)
    where
        F: FnOnce(RestResult) + Send + 'static,
    {
        let Some(handle) = self.rest_pool.lock().next() else {
            callback(RestResult::Fail(ExchangeError::NotRunning));
            return;
        };

        let session = RestSession::new(
            Arc::clone(&self.transport),
            request,
            self.signer.clone(),
            Arc::clone(&self.clock),
        );
        let dispatcher = Arc::clone(&self.rest_dispatcher);
        handle.spawn(async move {
            let result = session.run().await;
            if let Err(err) = dispatcher.submit(move || callback(result)).await {
                warn!(error = %err, "dropping rest result");
            }
        });
    }

    /// Subscribe to one raw stream, `/ws/<name>`.
    pub fn start_web_socket<F>(&self, stream: &str, callback: F) -> WsToken
    where
        F: Fn(WsResult) + Send + Sync + 'static,
    {
        self.open_stream(streams::single_stream_path(stream), Arc::new(callback))
    }

    /// Subscribe to several streams over one connection, `/stream?streams=a/b`.
    pub fn start_combined_stream<I, S, F>(&self, names: I, callback: F) -> WsToken
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(WsResult) + Send + Sync + 'static,
    {
        self.open_stream(streams::combined_stream_path(names), Arc::new(callback))
    }

    /// Close a stream; its own callback gets the final `Disconnect`.
    ///
    /// Unknown tokens and repeated calls are ignored.
    pub fn stop_web_socket(&self, token: WsToken) -> bool {
        self.registry.close(token, None)
    }

    /// Close a stream and send the final `Disconnect` to `callback` instead.
    pub fn stop_web_socket_with<F>(&self, token: WsToken, callback: F) -> bool
    where
        F: Fn(WsResult) + Send + Sync + 'static,
    {
        self.registry.close(token, Some(Arc::new(callback)))
    }

    /// Create a listen key at `endpoint` and open its user-data stream.
    ///
    /// Blocks for the listen-key request. A failed create is reported to
    /// `callback` and yields [`WsToken::INVALID`].
    pub fn start_user_data<F>(&self, endpoint: &str, callback: F) -> WsToken
    where
        F: Fn(WsResult) + Send + Sync + 'static,
    {
        if !self.is_running() {
            callback(WsResult::Fail(ExchangeError::NotRunning));
            return WsToken::INVALID;
        }
        match self.listen_keys.create(endpoint) {
            Ok(key) => self.open_stream(streams::user_data_path(&key), Arc::new(callback)),
            Err(err) => {
                warn!(error = %err, endpoint, "listen key create failed");
                callback(WsResult::Fail(err));
                WsToken::INVALID
            }
        }
    }

    /// Keep the listen key alive. Call this well inside the key's expiry.
    pub fn renew_listen_key<F>(&self, endpoint: &str, callback: F)
    where
        F: FnOnce(WsResult),
    {
        callback(self.listen_keys.extend(endpoint).into());
    }

    /// Revoke the listen key. The stored key is cleared if the server agrees.
    pub fn close_user_data<F>(&self, endpoint: &str, callback: F)
    where
        F: FnOnce(WsResult),
    {
        callback(self.listen_keys.revoke(endpoint).into());
    }

    /// The current listen key, empty when there is none.
    pub fn listen_key(&self) -> String {
        self.listen_keys.listen_key()
    }

    /// Stop every reactor, join their threads, then forget all streams.
    ///
    /// In-flight sessions are dropped where they stand and report nothing.
    /// Calling this more than once is harmless.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut rest = std::mem::replace(
            &mut *self.rest_pool.lock(),
            ExecutionContextPool::empty("rest"),
        );
        let mut ws = std::mem::replace(&mut *self.ws_pool.lock(), ExecutionContextPool::empty("ws"));
        rest.stop();
        ws.stop();
        self.registry.clear();
        info!("engine stopped");
    }

    #[instrument(skip(self, callback))]
    fn open_stream(&self, path: String, callback: WsCallback) -> WsToken {
        let Some(handle) = self.ws_pool.lock().next() else {
            callback(WsResult::Fail(ExchangeError::NotRunning));
            return WsToken::INVALID;
        };

        let token = self.registry.next_token();
        let dispatcher = match CallbackDispatcher::ordered(
            &format!("ws{}", token.id()),
            self.ws_dispatch.workers,
            self.ws_dispatch.capacity,
        ) {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                callback(WsResult::Fail(err));
                return WsToken::INVALID;
            }
        };

        let close_rx = self.registry.insert(token, &path);
        let session = WsSession::new(
            token,
            path,
            Arc::clone(&self.transport),
            Arc::clone(&self.registry),
            callback,
            dispatcher,
        );
        handle.spawn(session.run(close_rx));
        debug!(%token, "stream session spawned");
        token
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("rest_host", &self.config().rest_host)
            .field("ws_host", &self.config().ws_host)
            .field("running", &self.is_running())
            .field("open_streams", &self.open_streams())
            .finish_non_exhaustive()
    }
}
