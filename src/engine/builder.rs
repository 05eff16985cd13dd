use crate::core::config::ConnectionConfig;
use crate::core::errors::ExchangeError;
use crate::core::kernel::context::ExecutionContextPool;
use crate::core::kernel::dispatch::CallbackDispatcher;
use crate::core::kernel::listen_key::{BlockingListenKeyClient, ListenKeyClient, ListenKeyManager};
use crate::core::kernel::registry::SessionRegistry;
use crate::core::kernel::signer::{Clock, HmacSigner, Signer, SystemClock};
use crate::core::kernel::transport::{TlsSettings, Transport};
use crate::engine::{DispatchSizing, Engine};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_REST_CONTEXTS: usize = 4;
pub const DEFAULT_WS_CONTEXTS: usize = 6;

/// Collects everything that must be fixed before the engine starts: pool
/// sizes, trust anchors, callback workers and the clock used for signing.
pub struct EngineBuilder {
    config: ConnectionConfig,
    rest_contexts: usize,
    ws_contexts: usize,
    tls: TlsSettings,
    clock: Arc<dyn Clock>,
    rest_dispatch: DispatchSizing,
    ws_dispatch: DispatchSizing,
    listen_key_client: Option<Box<dyn ListenKeyClient>>,
}

impl EngineBuilder {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            rest_contexts: DEFAULT_REST_CONTEXTS,
            ws_contexts: DEFAULT_WS_CONTEXTS,
            tls: TlsSettings::default(),
            clock: Arc::new(SystemClock),
            rest_dispatch: DispatchSizing::REST,
            ws_dispatch: DispatchSizing::STREAM,
            listen_key_client: None,
        }
    }

    /// Number of REST reactors. Clamped to `1..=24` at start.
    #[must_use]
    pub const fn rest_contexts(mut self, count: usize) -> Self {
        self.rest_contexts = count;
        self
    }

    /// Number of stream reactors. Clamped to `1..=24` at start.
    #[must_use]
    pub const fn ws_contexts(mut self, count: usize) -> Self {
        self.ws_contexts = count;
        self
    }

    /// Trust every certificate in a PEM bundle.
    pub fn root_certificate(mut self, path: impl AsRef<Path>) -> Result<Self, ExchangeError> {
        self.tls.load_root_certificate(path.as_ref())?;
        Ok(self)
    }

    /// Trust every PEM file in a CA directory.
    pub fn root_verify_path(mut self, dir: impl AsRef<Path>) -> Result<Self, ExchangeError> {
        self.tls.add_verify_path(dir.as_ref())?;
        Ok(self)
    }

    /// Clock used to stamp signed requests.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Worker threads and queue depth of the shared REST callback pool.
    #[must_use]
    pub const fn rest_dispatch(mut self, workers: usize, capacity: usize) -> Self {
        self.rest_dispatch = DispatchSizing { workers, capacity };
        self
    }

    /// Worker threads and queue depth of each stream's ordered dispatcher.
    #[must_use]
    pub const fn ws_dispatch(mut self, workers: usize, capacity: usize) -> Self {
        self.ws_dispatch = DispatchSizing { workers, capacity };
        self
    }

    /// Swap the blocking listen-key client for another implementation.
    #[must_use]
    pub fn listen_key_client(mut self, client: Box<dyn ListenKeyClient>) -> Self {
        self.listen_key_client = Some(client);
        self
    }

    /// Build the TLS context, start both pools and the REST dispatcher.
    pub fn build(self) -> Result<Engine, ExchangeError> {
        let config = Arc::new(self.config);

        let tls = if config.use_tls {
            Some(self.tls.build(&config)?)
        } else {
            None
        };

        let signer: Option<Arc<dyn Signer>> = if config.secret_key().is_empty() {
            None
        } else {
            Some(Arc::new(HmacSigner::new(config.secret_key())))
        };

        let listen_key_client = match self.listen_key_client {
            Some(client) => client,
            None => Box::new(BlockingListenKeyClient::new(
                Arc::clone(&config),
                tls.clone(),
            )),
        };

        let rest_dispatcher = CallbackDispatcher::unordered(
            "rest",
            self.rest_dispatch.workers,
            self.rest_dispatch.capacity,
        )?;
        let rest_pool = ExecutionContextPool::start("rest", self.rest_contexts)?;
        let ws_pool = ExecutionContextPool::start("ws", self.ws_contexts)?;

        info!(
            rest_host = %config.rest_host,
            ws_host = %config.ws_host,
            rest_contexts = rest_pool.len(),
            ws_contexts = ws_pool.len(),
            custom_roots = self.tls.root_count(),
            "engine started"
        );

        Ok(Engine {
            transport: Arc::new(Transport::new(config, tls)),
            rest_pool: Mutex::new(rest_pool),
            ws_pool: Mutex::new(ws_pool),
            registry: Arc::new(SessionRegistry::new()),
            rest_dispatcher: Arc::new(rest_dispatcher),
            listen_keys: ListenKeyManager::new(listen_key_client),
            signer,
            clock: self.clock,
            ws_dispatch: self.ws_dispatch,
            running: AtomicBool::new(true),
        })
    }
}
