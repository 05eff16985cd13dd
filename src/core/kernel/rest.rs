use crate::core::errors::ExchangeError;
use crate::core::kernel::http::{self, ExchangeBounds, HttpResponse};
use crate::core::kernel::signer::{build_query_string, Clock, Signer};
use crate::core::kernel::transport::Transport;
use crate::core::types::{RestRequest, RestResult, RestSign};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{instrument, trace, warn};

/// Where a REST session is in its single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestState {
    Resolving,
    Connecting,
    Handshaking,
    Writing,
    Reading,
    Done,
    Failed,
}

/// One request, one connection, one result.
///
/// The session owns its request and runs to completion; there is no way to
/// cancel it from outside short of stopping its execution context.
pub struct RestSession {
    transport: Arc<Transport>,
    request: RestRequest,
    signer: Option<Arc<dyn Signer>>,
    clock: Arc<dyn Clock>,
    state: RestState,
}

impl RestSession {
    pub fn new(
        transport: Arc<Transport>,
        request: RestRequest,
        signer: Option<Arc<dyn Signer>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            request,
            signer,
            clock,
            state: RestState::Resolving,
        }
    }

    pub const fn state(&self) -> RestState {
        self.state
    }

    /// Drive the exchange and classify the response. Never panics, never
    /// returns early without a result.
    #[instrument(
        skip(self),
        fields(method = %self.request.method, path = %self.request.path, host = %self.transport.config().rest_host)
    )]
    pub async fn run(mut self) -> RestResult {
        match self.exchange().await {
            Ok(response) => {
                self.advance(RestState::Done);
                http::classify(response)
            }
            Err(err) => {
                self.advance(RestState::Failed);
                warn!(error = %err, "rest request failed");
                RestResult::Fail(err)
            }
        }
    }

    async fn exchange(&mut self) -> Result<HttpResponse, ExchangeError> {
        let transport = Arc::clone(&self.transport);
        let config = transport.config();
        let timeouts = config.timeouts;
        let host = config.rest_host.as_str();

        let deadline = Instant::now() + timeouts.rest_connect;
        let addrs = transport.resolve(host, config.rest_port, deadline).await?;

        self.advance(RestState::Connecting);
        let tcp = transport.connect(&addrs, deadline).await?;

        self.advance(RestState::Handshaking);
        let deadline = Instant::now() + timeouts.rest_handshake;
        let stream = transport.secure(host, tcp, deadline).await?;

        // The timestamp is taken here, as late as possible before the bytes go out.
        self.advance(RestState::Writing);
        let target = self.target()?;
        let request = http::build_request(
            self.request.method,
            host,
            &target,
            &config.user_agent,
            Some(config.api_key()),
        )?;

        self.advance(RestState::Reading);
        http::exchange(
            stream,
            request,
            ExchangeBounds {
                write_deadline: deadline,
                read_timeout: timeouts.rest_read,
            },
        )
        .await
    }

    /// Request target: path, then the query, signed when the request asks for it.
    fn target(&self) -> Result<String, ExchangeError> {
        let query = build_query_string(&self.request.params);
        let query = match self.request.sign {
            RestSign::Unsigned => query,
            RestSign::HmacSha256 => {
                let signer = self.signer.as_ref().ok_or_else(|| {
                    ExchangeError::AuthError("signed request needs a secret key".to_string())
                })?;
                signer.sign_query(&query, self.clock.now_ms()?)?
            }
        };

        if query.is_empty() {
            Ok(self.request.path.clone())
        } else {
            Ok(format!("{}?{}", self.request.path, query))
        }
    }

    fn advance(&mut self, next: RestState) {
        trace!(from = ?self.state, to = ?next, "rest state");
        self.state = next;
    }
}
