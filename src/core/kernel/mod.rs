//! `LotusX` Engine Kernel - session machinery behind the engine facade
//!
//! The kernel holds everything that touches the network or a thread. It knows
//! nothing about endpoints; the engine turns calls into sessions and hands
//! them to the kernel.
//!
//! # Architecture
//!
//! ## Execution
//! - `ExecutionContextPool`: single-threaded reactors, one OS thread each, picked round-robin
//! - `CallbackDispatcher`: bounded worker pools that run user callbacks off the reactors
//!
//! ## Sessions
//! - `RestSession`: resolve, connect, TLS, write, read, classify; one result per call
//! - `WsSession`: connect once, then read until closed; results in wire order
//! - `SessionRegistry`: token table used to close a running stream
//!
//! ## Authentication
//! - `Signer` / `HmacSigner`: HMAC-SHA256 query signing
//! - `Clock`: wall-clock source stamped into signed queries
//! - `ListenKeyManager`: user-data stream credential lifecycle over a blocking client
//!
//! # Key Principles
//!
//! 1. **Callbacks only**: transport, protocol and decode failures arrive as `Fail`, never as a panic or `Err`
//! 2. **Phase tagged**: every transport failure names the phase it happened in
//! 3. **No retries**: a failed session stays failed; retry policy belongs to the caller
//!
//! # Example
//! ```rust,no_run
//! use lotusx_engine::core::kernel::{
//!     CallbackDispatcher, ExecutionContextPool, RestSession, SystemClock, Transport,
//! };
//! use lotusx_engine::core::config::ConnectionConfig;
//! use lotusx_engine::core::types::RestRequest;
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), lotusx_engine::ExchangeError> {
//! let config = Arc::new(ConnectionConfig::new("127.0.0.1", "127.0.0.1").use_tls(false));
//! let transport = Arc::new(Transport::new(config, None));
//! let pool = ExecutionContextPool::start("rest", 1)?;
//! let dispatcher = Arc::new(CallbackDispatcher::unordered("rest", 1, 16)?);
//!
//! let session = RestSession::new(
//!     transport,
//!     RestRequest::get("/fapi/v1/time"),
//!     None,
//!     Arc::new(SystemClock),
//! );
//! if let Some(handle) = pool.next() {
//!     handle.spawn(async move {
//!         let result = session.run().await;
//!         let _ = dispatcher.submit(move || println!("{:?}", result)).await;
//!     });
//! }
//! # Ok(())
//! # }
//! ```
pub mod context;
pub mod dispatch;
pub mod http;
pub mod listen_key;
pub mod registry;
pub mod rest;
pub mod signer;
pub mod transport;
pub mod ws;

pub use context::{ExecutionContext, ExecutionContextPool, MAX_CONTEXTS};
pub use dispatch::CallbackDispatcher;
pub use listen_key::{BlockingListenKeyClient, ListenKeyClient, ListenKeyManager, ListenKeyMode};
pub use registry::{CloseRequest, SessionRegistry};
pub use rest::{RestSession, RestState};
pub use signer::{sign, Clock, FixedClock, HmacSigner, Signer, SystemClock};
pub use transport::{TlsSettings, Transport};
pub use ws::{WsSession, WsState};
