use crate::core::errors::{ExchangeError, Phase};
use crate::core::kernel::dispatch::CallbackDispatcher;
use crate::core::kernel::registry::{CloseRequest, SessionRegistry};
use crate::core::kernel::transport::{bounded, SessionStream, Transport};
use crate::core::types::{WsCallback, WsResult, WsToken};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{debug, instrument, trace, warn};

type Socket = WebSocketStream<SessionStream>;

/// Lifecycle of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Resolving,
    Connecting,
    TlsHandshaking,
    WsHandshaking,
    Reading,
    /// Read loop over; waiting for an explicit close or engine shutdown.
    Idle,
    Closing,
    Closed,
}

enum Event {
    Frame(Option<Result<Message, tungstenite::Error>>),
    Close(Option<CloseRequest>),
}

enum Frame {
    Deliver(WsResult),
    Skip,
    /// The peer ended the stream; nothing is reported.
    Ended,
    /// Deliver the failure, then stop reading.
    Failed(ExchangeError),
}

/// A long-lived subscription to one stream path.
///
/// The session task owns itself. It leaves the registry only through its own
/// close path, and every result it produces goes through its private ordered
/// dispatcher, so the callback sees frames in wire order.
pub struct WsSession {
    token: WsToken,
    path: String,
    transport: Arc<Transport>,
    registry: Arc<SessionRegistry>,
    callback: WsCallback,
    dispatcher: CallbackDispatcher,
    state: WsState,
}

impl WsSession {
    pub fn new(
        token: WsToken,
        path: impl Into<String>,
        transport: Arc<Transport>,
        registry: Arc<SessionRegistry>,
        callback: WsCallback,
        dispatcher: CallbackDispatcher,
    ) -> Self {
        Self {
            token,
            path: path.into(),
            transport,
            registry,
            callback,
            dispatcher,
            state: WsState::Resolving,
        }
    }

    pub const fn state(&self) -> WsState {
        self.state
    }

    /// Connect, then read until the peer goes away, a failure, or `close_rx` fires.
    #[instrument(skip(self, close_rx), fields(token = %self.token, path = %self.path))]
    pub async fn run(mut self, mut close_rx: oneshot::Receiver<CloseRequest>) {
        let connected = tokio::select! {
            request = &mut close_rx => Err(request.ok()),
            socket = self.connect() => Ok(socket),
        };

        let mut socket = match connected {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => {
                warn!(error = %err, "stream connect failed");
                self.deliver(WsResult::Fail(err)).await;
                return self.park(close_rx).await;
            }
            // closed before the connection was up: nothing to hand-shake
            Err(request) => return self.finish(request).await,
        };

        debug!("stream open");
        loop {
            let event = tokio::select! {
                request = &mut close_rx => Event::Close(request.ok()),
                frame = socket.next() => Event::Frame(frame),
            };

            match event {
                Event::Close(request) => return self.close(socket, request).await,
                Event::Frame(frame) => match classify_frame(frame) {
                    Frame::Deliver(result) => self.deliver(result).await,
                    Frame::Skip => {}
                    Frame::Ended => {
                        debug!("stream ended by peer");
                        break;
                    }
                    Frame::Failed(err) => {
                        warn!(error = %err, "stream read failed");
                        self.deliver(WsResult::Fail(err)).await;
                        break;
                    }
                },
            }
        }

        drop(socket);
        self.park(close_rx).await;
    }

    async fn connect(&mut self) -> Result<Socket, ExchangeError> {
        let transport = Arc::clone(&self.transport);
        let config = transport.config();
        let timeouts = config.timeouts;
        let host = config.ws_host.as_str();

        let deadline = Instant::now() + timeouts.ws_connect;
        let addrs = transport.resolve(host, config.ws_port, deadline).await?;

        self.advance(WsState::Connecting);
        let tcp = transport.connect(&addrs, deadline).await?;

        self.advance(WsState::TlsHandshaking);
        let deadline = Instant::now() + timeouts.ws_handshake;
        let stream = transport.secure(host, tcp, deadline).await?;

        self.advance(WsState::WsHandshaking);
        let request = handshake_request(
            host,
            config.ws_port,
            &self.path,
            config.use_tls,
            &config.user_agent,
        )?;
        let (socket, _response) =
            bounded(Phase::WsHandshake, deadline, client_async(request, stream)).await?;

        self.advance(WsState::Reading);
        Ok(socket)
    }

    /// Protocol close, bounded drain, then the final `Disconnect`.
    async fn close(mut self, mut socket: Socket, request: Option<CloseRequest>) {
        self.advance(WsState::Closing);
        let deadline = Instant::now() + self.transport.config().timeouts.ws_close;
        let handshake = async {
            socket.close(None).await?;
            while let Some(frame) = socket.next().await {
                if frame.is_err() {
                    break;
                }
            }
            Ok::<_, tungstenite::Error>(())
        };
        if let Err(err) = bounded(Phase::Close, deadline, handshake).await {
            debug!(error = %err, "close handshake incomplete");
        }
        drop(socket);
        self.finish(request).await;
    }

    async fn park(mut self, close_rx: oneshot::Receiver<CloseRequest>) {
        self.advance(WsState::Idle);
        let request = close_rx.await.ok();
        self.finish(request).await;
    }

    /// Leave the registry and report `Disconnect`. A hung-up close channel
    /// means the engine is shutting down, and nothing is reported.
    async fn finish(mut self, request: Option<CloseRequest>) {
        self.advance(WsState::Closed);
        let Some(request) = request else {
            trace!("registry cleared, exiting quietly");
            return;
        };
        self.registry.remove(self.token);

        let callback = request
            .callback
            .unwrap_or_else(|| Arc::clone(&self.callback));
        if let Err(err) = self
            .dispatcher
            .submit(move || callback(WsResult::Disconnect))
            .await
        {
            warn!(error = %err, "could not deliver disconnect");
        }
        debug!("stream closed");
    }

    async fn deliver(&self, result: WsResult) {
        let callback = Arc::clone(&self.callback);
        if let Err(err) = self.dispatcher.submit(move || callback(result)).await {
            warn!(error = %err, "dropping stream result");
        }
    }

    fn advance(&mut self, next: WsState) {
        trace!(from = ?self.state, to = ?next, "ws state");
        self.state = next;
    }
}

fn handshake_request(
    host: &str,
    port: u16,
    path: &str,
    use_tls: bool,
    user_agent: &str,
) -> Result<Request, ExchangeError> {
    let scheme = if use_tls { "wss" } else { "ws" };
    let url = format!("{}://{}:{}{}", scheme, host, port, path);
    let mut request = url
        .into_client_request()
        .map_err(|e| ExchangeError::transport(Phase::WsHandshake, e))?;
    let agent = HeaderValue::from_str(user_agent)
        .map_err(|e| ExchangeError::InvalidParameters(format!("user agent: {}", e)))?;
    request.headers_mut().insert(USER_AGENT, agent);
    Ok(request)
}

fn classify_frame(frame: Option<Result<Message, tungstenite::Error>>) -> Frame {
    let message = match frame {
        None => return Frame::Ended,
        Some(Ok(message)) => message,
        Some(Err(
            tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(
                tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
            ),
        )) => return Frame::Ended,
        Some(Err(err)) => return Frame::Failed(ExchangeError::transport(Phase::Read, err)),
    };

    let parsed = match message {
        Message::Text(text) => serde_json::from_str(&text),
        Message::Binary(bytes) => serde_json::from_slice(&bytes),
        Message::Close(frame) => {
            trace!(?frame, "close frame from peer");
            return Frame::Ended;
        }
        // pings are answered by the protocol layer
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Frame::Skip,
    };

    match parsed {
        Ok(value) => Frame::Deliver(WsResult::Success(value)),
        Err(e) => Frame::Failed(ExchangeError::JsonRead(e.to_string())),
    }
}
