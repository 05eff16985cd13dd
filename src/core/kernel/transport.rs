use crate::core::config::{ConnectionConfig, TrustStore};
use crate::core::errors::{ExchangeError, Phase};
use native_tls::Certificate;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, trace};

pub type SessionStream = MaybeTlsStream<TcpStream>;

/// Trust anchors collected before the engine starts.
#[derive(Default)]
pub struct TlsSettings {
    roots: Vec<Certificate>,
}

impl TlsSettings {
    /// Load a PEM bundle. Every certificate in the file is added.
    pub fn load_root_certificate(&mut self, path: &Path) -> Result<usize, ExchangeError> {
        if !path.exists() {
            return Err(ExchangeError::TlsError(format!(
                "path to root certificate does not exist: {}",
                path.display()
            )));
        }
        let pem = std::fs::read(path).map_err(|e| {
            ExchangeError::TlsError(format!("failed to read {}: {}", path.display(), e))
        })?;

        let mut added = 0;
        for block in split_pem(&pem) {
            let cert = Certificate::from_pem(block.as_bytes())
                .map_err(|e| ExchangeError::TlsError(format!("{}: {}", path.display(), e)))?;
            self.roots.push(cert);
            added += 1;
        }
        if added == 0 {
            return Err(ExchangeError::TlsError(format!(
                "no PEM certificates in {}",
                path.display()
            )));
        }
        Ok(added)
    }

    /// Add every PEM file found directly inside `dir`.
    pub fn add_verify_path(&mut self, dir: &Path) -> Result<usize, ExchangeError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            ExchangeError::TlsError(format!("failed to read {}: {}", dir.display(), e))
        })?;

        let mut added = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                // non-PEM files in a CA directory are skipped
                if let Ok(count) = self.load_root_certificate(&path) {
                    added += count;
                }
            }
        }
        Ok(added)
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Build the blocking connector. The async one wraps the same value.
    pub fn build(&self, config: &ConnectionConfig) -> Result<native_tls::TlsConnector, ExchangeError> {
        let mut builder = native_tls::TlsConnector::builder();
        for root in &self.roots {
            builder.add_root_certificate(root.clone());
        }
        builder
            .disable_built_in_roots(config.trust_store == TrustStore::CustomOnly)
            .danger_accept_invalid_certs(!config.verify_peer)
            .danger_accept_invalid_hostnames(!config.verify_peer);
        builder
            .build()
            .map_err(|e| ExchangeError::TlsError(format!("failed to build TLS context: {}", e)))
    }
}

fn split_pem(pem: &[u8]) -> Vec<String> {
    const END: &str = "-----END CERTIFICATE-----";
    let text = String::from_utf8_lossy(pem);
    let mut blocks = Vec::new();
    let mut rest = text.as_ref();
    while let Some(start) = rest.find("-----BEGIN CERTIFICATE-----") {
        let Some(end) = rest[start..].find(END) else {
            break;
        };
        let stop = start + end + END.len();
        blocks.push(rest[start..stop].to_string());
        rest = &rest[stop..];
    }
    blocks
}

/// Everything a session needs to reach a host: config plus the TLS context.
pub struct Transport {
    config: Arc<ConnectionConfig>,
    tls: Option<tokio_native_tls::TlsConnector>,
}

impl Transport {
    pub fn new(config: Arc<ConnectionConfig>, tls: Option<native_tls::TlsConnector>) -> Self {
        Self {
            config,
            tls: tls.map(tokio_native_tls::TlsConnector::from),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Look up every candidate address for `host`.
    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
        deadline: Instant,
    ) -> Result<Vec<SocketAddr>, ExchangeError> {
        let addrs: Vec<SocketAddr> = bounded(
            Phase::Resolve,
            deadline,
            tokio::net::lookup_host((host, port)),
        )
        .await?
        .collect();
        trace!(host, port, candidates = addrs.len(), "resolved");
        if addrs.is_empty() {
            return Err(ExchangeError::transport(
                Phase::Resolve,
                format!("no addresses for {}", host),
            ));
        }
        Ok(addrs)
    }

    /// Try each address in turn; the first to accept wins.
    pub async fn connect(
        &self,
        addrs: &[SocketAddr],
        deadline: Instant,
    ) -> Result<TcpStream, ExchangeError> {
        let mut last_err = None;
        for addr in addrs {
            match bounded(Phase::Connect, deadline, TcpStream::connect(*addr)).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(%addr, "connected");
                    return Ok(stream);
                }
                Err(err @ ExchangeError::Timeout { .. }) => return Err(err),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| ExchangeError::transport(Phase::Connect, "no address to connect to")))
    }

    /// TLS handshake with SNI set to `host`, or a plain pass-through when TLS is off.
    pub async fn secure(
        &self,
        host: &str,
        stream: TcpStream,
        deadline: Instant,
    ) -> Result<SessionStream, ExchangeError> {
        if !self.config.use_tls {
            return Ok(MaybeTlsStream::Plain(stream));
        }
        let tls = self.tls.as_ref().ok_or_else(|| {
            ExchangeError::TlsError("TLS requested but no TLS context was built".to_string())
        })?;
        let stream = bounded(Phase::TlsHandshake, deadline, tls.connect(host, stream)).await?;
        Ok(MaybeTlsStream::NativeTls(stream))
    }
}

/// Run `fut` before `deadline`; both expiry and failure are tagged with `phase`.
pub async fn bounded<T, E, F>(phase: Phase, deadline: Instant, fut: F) -> Result<T, ExchangeError>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ExchangeError::transport(phase, e)),
        Err(_) => Err(ExchangeError::Timeout { phase }),
    }
}
