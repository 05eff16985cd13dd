//! One HTTP/1.1 exchange over an already connected stream, shared by the REST
//! session and the listen-key client.

use crate::core::errors::{ExchangeError, Phase};
use crate::core::kernel::signer::API_KEY_HEADER;
use crate::core::types::{Method, RestResult};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::client::conn::http1;
use hyper::header::{ACCEPT, CONNECTION, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace};

/// Largest response body accepted.
pub const MAX_BODY: usize = 16 * 1024 * 1024;

impl From<Method> for hyper::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => Self::GET,
            Method::Post => Self::POST,
            Method::Put => Self::PUT,
            Method::Delete => Self::DELETE,
        }
    }
}

/// Build a body-less request. The connection is closed after one exchange.
pub fn build_request(
    method: Method,
    host: &str,
    target: &str,
    user_agent: &str,
    api_key: Option<&str>,
) -> Result<Request<Empty<Bytes>>, ExchangeError> {
    let mut builder = Request::builder()
        .method(hyper::Method::from(method))
        .uri(target)
        .header(HOST, host)
        .header(USER_AGENT, user_agent)
        .header(ACCEPT, "application/json")
        .header(CONNECTION, "close");
    if let Some(key) = api_key.filter(|key| !key.is_empty()) {
        builder = builder.header(API_KEY_HEADER, key);
    }
    builder
        .body(Empty::new())
        .map_err(|e| ExchangeError::InvalidParameters(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Deadlines of one exchange. The read bound starts once the request is flushed.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeBounds {
    pub write_deadline: Instant,
    pub read_timeout: Duration,
}

/// Send `request` over `io` and collect the whole response.
///
/// Failures before the request is flushed are tagged `Write`, everything after
/// it `Read`. Expiry of either bound is reported as `Timeout` for that phase.
pub async fn exchange<S>(
    io: S,
    request: Request<Empty<Bytes>>,
    bounds: ExchangeBounds,
) -> Result<HttpResponse, ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let progress = Arc::new(WriteProgress::default());
    let io = FlushWatch {
        inner: io,
        progress: Arc::clone(&progress),
        wrote: false,
    };

    let pending = round_trip(io, request, Arc::clone(&progress));
    tokio::pin!(pending);

    tokio::select! {
        biased;
        result = &mut pending => return result,
        () = progress.flushed.notified() => {}
        () = sleep_until(bounds.write_deadline) => {
            return Err(ExchangeError::Timeout { phase: Phase::Write });
        }
    }

    trace!("request flushed");
    match timeout(bounds.read_timeout, pending).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout { phase: Phase::Read }),
    }
}

async fn round_trip<S>(
    io: FlushWatch<S>,
    request: Request<Empty<Bytes>>,
    progress: Arc<WriteProgress>,
) -> Result<HttpResponse, ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::Builder::new()
        .title_case_headers(true)
        .handshake::<_, Empty<Bytes>>(TokioIo::new(io))
        .await
        .map_err(|e| ExchangeError::transport(Phase::Write, e))?;

    let conn = async move {
        // the response is already complete when the peer skips a clean close
        if let Err(err) = conn.await {
            debug!(error = %err, "http connection closed");
        }
    };

    let response = async move {
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ExchangeError::transport(progress.phase(), e))?;
        let (parts, body) = response.into_parts();
        let body = Limited::new(body, MAX_BODY)
            .collect()
            .await
            .map_err(|e| ExchangeError::transport(Phase::Read, e))?
            .to_bytes();

        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).trim().to_string());
        trace!(status = parts.status.as_u16(), bytes = body.len(), "response read");
        Ok(HttpResponse {
            status: parts.status.as_u16(),
            content_type,
            body,
        })
    };

    let ((), response) = tokio::join!(conn, response);
    response
}

#[derive(Default)]
struct WriteProgress {
    done: AtomicBool,
    flushed: Notify,
}

impl WriteProgress {
    fn phase(&self) -> Phase {
        if self.done.load(Ordering::Acquire) {
            Phase::Read
        } else {
            Phase::Write
        }
    }
}

/// Marks the moment the request bytes have been written and flushed.
struct FlushWatch<S> {
    inner: S,
    progress: Arc<WriteProgress>,
    wrote: bool,
}

impl<S: AsyncRead + Unpin> AsyncRead for FlushWatch<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FlushWatch<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            self.wrote = true;
        }
        poll
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            self.wrote = true;
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let poll = Pin::new(&mut self.inner).poll_flush(cx);
        if self.wrote
            && matches!(poll, Poll::Ready(Ok(())))
            && !self.progress.done.swap(true, Ordering::AcqRel)
        {
            self.progress.flushed.notify_one();
        }
        poll
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn is_json_media_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/json"))
}

/// Turn a raw response into a result: 404 first, then content type, then JSON.
pub fn classify(response: HttpResponse) -> RestResult {
    if response.status == 404 {
        return RestResult::Fail(ExchangeError::PathNotFound);
    }

    let content_type = response.content_type.unwrap_or_default();
    if !is_json_media_type(&content_type) {
        return RestResult::Fail(ExchangeError::ContentTypeInvalid(content_type));
    }

    match serde_json::from_slice(&response.body) {
        Ok(value) => RestResult::Success(value),
        Err(e) => RestResult::Fail(ExchangeError::JsonRead(e.to_string())),
    }
}
