use crate::core::config::ConnectionConfig;
use crate::core::errors::ExchangeError;
use crate::core::kernel::http::{self, ExchangeBounds, HttpResponse};
use crate::core::kernel::transport::Transport;
use crate::core::types::{Method, RestResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::{self, Handle};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Which listen-key call to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenKeyMode {
    Create,
    Extend,
    Close,
}

impl ListenKeyMode {
    pub const fn method(self) -> Method {
        match self {
            Self::Create => Method::Post,
            Self::Extend => Method::Put,
            Self::Close => Method::Delete,
        }
    }
}

/// Performs one listen-key call and classifies the answer.
///
/// `listen_key` is empty for `Create`.
pub trait ListenKeyClient: Send + Sync {
    fn call(&self, mode: ListenKeyMode, endpoint: &str, listen_key: &str) -> RestResult;
}

/// Synchronous client: one short-lived connection per call, driven to
/// completion on a private current-thread runtime.
///
/// Listen-key calls are rare and off the hot path, so they do not go through
/// the reactors. The caller's thread blocks until the answer is in.
pub struct BlockingListenKeyClient {
    transport: Transport,
}

impl BlockingListenKeyClient {
    pub fn new(config: Arc<ConnectionConfig>, tls: Option<native_tls::TlsConnector>) -> Self {
        Self {
            transport: Transport::new(config, tls),
        }
    }

    fn block_on(&self, mode: ListenKeyMode, target: &str) -> Result<HttpResponse, ExchangeError> {
        let run = || -> Result<HttpResponse, ExchangeError> {
            runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| ExchangeError::Other(format!("listen key runtime: {}", e)))?
                .block_on(self.exchange(mode, target))
        };

        // a runtime cannot be entered from inside another one
        if Handle::try_current().is_err() {
            return run();
        }
        std::thread::scope(|scope| {
            scope
                .spawn(run)
                .join()
                .unwrap_or_else(|_| Err(ExchangeError::Other("listen key call panicked".to_string())))
        })
    }

    async fn exchange(&self, mode: ListenKeyMode, target: &str) -> Result<HttpResponse, ExchangeError> {
        let transport = &self.transport;
        let config = transport.config();
        let host = config.rest_host.as_str();
        let timeouts = config.timeouts;

        let deadline = Instant::now() + timeouts.rest_connect;
        let addrs = transport.resolve(host, config.rest_port, deadline).await?;
        let tcp = transport.connect(&addrs, deadline).await?;

        let deadline = Instant::now() + timeouts.rest_handshake;
        let stream = transport.secure(host, tcp, deadline).await?;

        let request = http::build_request(
            mode.method(),
            host,
            target,
            &config.user_agent,
            Some(config.api_key()),
        )?;
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
}

impl ListenKeyClient for BlockingListenKeyClient {
    fn call(&self, mode: ListenKeyMode, endpoint: &str, listen_key: &str) -> RestResult {
        let target = match mode {
            ListenKeyMode::Create => endpoint.to_string(),
            ListenKeyMode::Extend | ListenKeyMode::Close => {
                format!("{}?listenKey={}", endpoint, listen_key)
            }
        };
        match self.block_on(mode, &target) {
            Ok(response) => http::classify(response),
            Err(err) => RestResult::Fail(err),
        }
    }
}

/// Holds the current listen key and drives its create/extend/revoke lifecycle.
pub struct ListenKeyManager {
    client: Box<dyn ListenKeyClient>,
    listen_key: Mutex<String>,
}

impl ListenKeyManager {
    pub fn new(client: Box<dyn ListenKeyClient>) -> Self {
        Self {
            client,
            listen_key: Mutex::new(String::new()),
        }
    }

    /// The stored key, empty when there is none.
    pub fn listen_key(&self) -> String {
        self.listen_key.lock().clone()
    }

    /// Request a new key and store it.
    ///
    /// Any previous key is forgotten first, so a failed create never leaves a
    /// stale key behind.
    #[instrument(skip(self))]
    pub fn create(&self, endpoint: &str) -> Result<String, ExchangeError> {
        self.listen_key.lock().clear();

        let mut result = self.client.call(ListenKeyMode::Create, endpoint, "");
        result.has_error_code(false);
        let body = result.into_result()?;
        let key = body
            .get("listenKey")
            .and_then(|key| key.as_str())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ExchangeError::JsonRead("response has no listenKey".to_string()))?
            .to_string();

        *self.listen_key.lock() = key.clone();
        debug!("listen key created");
        Ok(key)
    }

    /// Push the server-side expiry of the stored key forward.
    #[instrument(skip(self))]
    pub fn extend(&self, endpoint: &str) -> RestResult {
        let key = self.listen_key();
        if key.is_empty() {
            warn!("extending without a listen key");
        }
        let mut result = self.client.call(ListenKeyMode::Extend, endpoint, &key);
        result.has_error_code(true);
        result
    }

    /// Invalidate the stored key. It is cleared only if the server agrees.
    #[instrument(skip(self))]
    pub fn revoke(&self, endpoint: &str) -> RestResult {
        let key = self.listen_key();
        let mut result = self.client.call(ListenKeyMode::Close, endpoint, &key);
        if !result.has_error_code(true) {
            self.listen_key.lock().clear();
            debug!("listen key revoked");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::SessionTimeouts;
    use crate::core::errors::Phase;
    use serde_json::{json, Value};
    use std::io::{Read, Write};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Answers from a script and records what it was asked.
    struct ScriptedClient {
        answers: StdMutex<Vec<RestResult>>,
        calls: Arc<StdMutex<Vec<(ListenKeyMode, String)>>>,
    }

    impl ScriptedClient {
        fn new(answers: Vec<RestResult>) -> (Self, Arc<StdMutex<Vec<(ListenKeyMode, String)>>>) {
            let calls = Arc::new(StdMutex::new(Vec::new()));
            let client = Self {
                answers: StdMutex::new(answers.into_iter().rev().collect()),
                calls: Arc::clone(&calls),
            };
            (client, calls)
        }
    }

    impl ListenKeyClient for ScriptedClient {
        fn call(&self, mode: ListenKeyMode, _endpoint: &str, listen_key: &str) -> RestResult {
            self.calls
                .lock()
                .unwrap()
                .push((mode, listen_key.to_string()));
            self.answers
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(RestResult::Fail(ExchangeError::Other("script ran out".into())))
        }
    }

    #[test]
    fn test_lifecycle_create_extend_revoke() {
        let (client, calls) = ScriptedClient::new(vec![
            RestResult::Success(json!({"listenKey": "abc"})),
            RestResult::Success(json!({})),
            RestResult::Success(Value::Null),
        ]);
        let manager = ListenKeyManager::new(Box::new(client));

        assert_eq!(manager.create("/fapi/v1/listenKey").unwrap(), "abc");
        assert_eq!(manager.listen_key(), "abc");

        assert!(manager.extend("/fapi/v1/listenKey").is_success());
        assert_eq!(manager.listen_key(), "abc");

        assert!(manager.revoke("/fapi/v1/listenKey").is_success());
        assert_eq!(manager.listen_key(), "");

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                (ListenKeyMode::Create, String::new()),
                (ListenKeyMode::Extend, "abc".to_string()),
                (ListenKeyMode::Close, "abc".to_string()),
            ]
        );
    }

    #[test]
    fn test_failed_create_clears_previous_key() {
        let (client, _) = ScriptedClient::new(vec![
            RestResult::Success(json!({"listenKey": "old"})),
            RestResult::Fail(ExchangeError::ContentTypeInvalid("text/html".into())),
        ]);
        let manager = ListenKeyManager::new(Box::new(client));
        manager.create("/fapi/v1/listenKey").unwrap();

        let err = manager.create("/fapi/v1/listenKey").unwrap_err();
        assert!(matches!(err, ExchangeError::ContentTypeInvalid(_)));
        assert_eq!(manager.listen_key(), "");
    }

    #[test]
    fn test_create_rejected_by_api() {
        let (client, _) = ScriptedClient::new(vec![RestResult::Success(
            json!({"code": -2015, "msg": "Invalid API-key, IP, or permissions for action."}),
        )]);
        let manager = ListenKeyManager::new(Box::new(client));
        assert!(matches!(
            manager.create("/fapi/v1/listenKey"),
            Err(ExchangeError::ApiError { code: -2015, .. })
        ));
    }

    #[test]
    fn test_failed_revoke_keeps_key() {
        let (client, _) = ScriptedClient::new(vec![
            RestResult::Success(json!({"listenKey": "abc"})),
            RestResult::Success(json!({"code": -1125, "msg": "This listenKey does not exist."})),
        ]);
        let manager = ListenKeyManager::new(Box::new(client));
        manager.create("/fapi/v1/listenKey").unwrap();
        assert!(!manager.revoke("/fapi/v1/listenKey").is_success());
        assert_eq!(manager.listen_key(), "abc");
    }

    #[test]
    fn test_blocking_client_against_loopback() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 512];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let body = r#"{"listenKey":"abc"}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).unwrap();
            String::from_utf8(head).unwrap()
        });

        let config = ConnectionConfig::new("127.0.0.1", "127.0.0.1")
            .rest_port(port)
            .use_tls(false)
            .credentials("my-key", "s3cr3t");
        let client = BlockingListenKeyClient::new(Arc::new(config), None);
        let result = client.call(ListenKeyMode::Create, "/fapi/v1/listenKey", "");
        assert_eq!(result.json().unwrap()["listenKey"], "abc");

        let head = server.join().unwrap();
        assert!(head.starts_with("POST /fapi/v1/listenKey HTTP/1.1\r\n"));
        assert!(head.to_ascii_lowercase().contains("x-mbx-apikey: my-key\r\n"));
    }

    #[test]
    fn test_blocking_client_reports_read_expiry_as_timeout() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let server = std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let _ = done_rx.recv_timeout(Duration::from_secs(5));
            drop(socket);
        });

        let config = ConnectionConfig::new("127.0.0.1", "127.0.0.1")
            .rest_port(port)
            .use_tls(false)
            .timeouts(SessionTimeouts {
                rest_read: Duration::from_millis(200),
                ..SessionTimeouts::default()
            });
        let client = BlockingListenKeyClient::new(Arc::new(config), None);
        let result = client.call(ListenKeyMode::Extend, "/fapi/v1/listenKey", "abc");
        assert!(matches!(
            result,
            RestResult::Fail(ExchangeError::Timeout { phase: Phase::Read })
        ));

        done_tx.send(()).unwrap();
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_blocking_client_works_inside_a_runtime() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 512];
            let _ = socket.read(&mut buf).unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}")
                .unwrap();
        });

        let config = ConnectionConfig::new("127.0.0.1", "127.0.0.1")
            .rest_port(port)
            .use_tls(false);
        let client = BlockingListenKeyClient::new(Arc::new(config), None);
        assert!(client
            .call(ListenKeyMode::Close, "/fapi/v1/listenKey", "abc")
            .is_success());
        server.join().unwrap();
    }
}
