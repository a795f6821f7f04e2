//! Network fetch layer.
//!
//! [`Transport`] is the seam between the fetch coordinator and the network.
//! [`HttpTransport`] implements it with a small HTTP/1.1 client on top of
//! Tokio's `TcpStream`; tests swap in their own implementations to count or
//! stall fetches.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::config::CacheConfig;
use crate::http::{BodyFraming, ChunkedDecoder, Request, ResponseError, ResponseHead, StatusCode};
use crate::key::Credentials;

/// Transport-level failures. Cloneable so one failure can be handed to every
/// caller waiting on the same fetch.
#[derive(Debug, Error, Clone)]
pub enum NetworkError {
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported URL scheme `{scheme}`")]
    UnsupportedScheme { scheme: String },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server responded {status}")]
    Status { status: StatusCode },

    #[error("malformed response: {0}")]
    MalformedResponse(#[from] ResponseError),

    #[error("response head exceeds {max_bytes} bytes")]
    HeadTooLarge { max_bytes: usize },

    #[error("response body exceeds {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },

    #[error("too many redirects (limit {limit})")]
    TooManyRedirects { limit: u32 },

    #[error("connection closed before the response was complete")]
    UnexpectedEof,
}

impl From<io::Error> for NetworkError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// One image request as handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub credentials: Option<Credentials>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            url: url.into(),
            credentials,
        }
    }
}

/// Boxed future returned by [`Transport::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Bytes, NetworkError>> + Send + 'a>>;

/// Performs the HTTP GET behind a cache miss.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync`; one transport is shared by
///   every fetch task.
/// - The returned future may be dropped at any `.await` point when the fetch
///   is cancelled, and must release its resources when that happens.
/// - Only a `2xx` body counts as success.
pub trait Transport: Send + Sync {
    /// Fetches the body of `request.url`, attaching basic auth when
    /// `request.credentials` is set.
    fn fetch<'a>(&'a self, request: &'a FetchRequest) -> FetchFuture<'a>;
}

/// Maximum size of a response head we will buffer (64 KiB).
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 8 * 1024;

/// Longest chunk-size or trailer line buffered while decoding a chunked body.
const MAX_CHUNK_LINE: usize = 8 * 1024;

/// Plain-`http://` HTTP/1.1 client.
///
/// Each fetch opens one connection with `Connection: close`, follows
/// redirects up to a limit and reads `Content-Length`, chunked and
/// close-delimited bodies. Credentials are dropped when a redirect leaves the
/// original host.
///
/// # Examples
///
/// ```rust,no_run
/// use imcache::transport::{FetchRequest, HttpTransport, Transport};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = HttpTransport::new();
///     let request = FetchRequest::new("http://127.0.0.1:8080/logo.png", None);
///     let bytes = transport.fetch(&request).await?;
///     println!("{} bytes", bytes.len());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    timeout: Duration,
    max_redirects: u32,
    max_body_bytes: usize,
    user_agent: String,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct Exchange {
    head: ResponseHead,
    stream: TcpStream,
    buf: BytesMut,
}

impl HttpTransport {
    /// Creates a transport with the default configuration values.
    pub fn new() -> Self {
        Self::from_config(&CacheConfig::default())
    }

    /// Creates a transport using the network settings of `config`.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_redirects: config.max_redirects,
            max_body_bytes: config.max_body_bytes,
            user_agent: config.user_agent.clone(),
        }
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_redirects(mut self, redirects: u32) -> Self {
        self.max_redirects = redirects;
        self
    }

    #[must_use]
    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    async fn get(&self, request: &FetchRequest) -> Result<Bytes, NetworkError> {
        tokio::time::timeout(self.timeout, self.follow(request))
            .await
            .map_err(|_| NetworkError::Timeout(self.timeout))?
    }

    async fn follow(&self, request: &FetchRequest) -> Result<Bytes, NetworkError> {
        let mut url = parse_http_url(&request.url)?;
        let mut credentials = request.credentials.clone();
        let mut redirects = 0;

        loop {
            let exchange = self.exchange(&url, credentials.as_ref()).await?;
            let status = exchange.head.status();

            if status.is_redirect() {
                let Some(location) = exchange.head.location() else {
                    return Err(NetworkError::Status { status });
                };
                if redirects == self.max_redirects {
                    return Err(NetworkError::TooManyRedirects {
                        limit: self.max_redirects,
                    });
                }
                redirects += 1;

                let next = url.join(location).map_err(|e| NetworkError::InvalidUrl {
                    url: location.to_owned(),
                    reason: e.to_string(),
                })?;
                let next = parse_http_url(next.as_str())?;
                if !same_origin(&url, &next) && credentials.take().is_some() {
                    debug!(to = %next, "redirect left the origin; dropping credentials");
                }
                debug!(from = %url, to = %next, status = %status, "following redirect");
                url = next;
                continue;
            }

            if !status.is_success() {
                return Err(NetworkError::Status { status });
            }
            return self.read_body(exchange).await;
        }
    }

    /// Sends the GET and reads up to the end of the response head.
    async fn exchange(
        &self,
        url: &Url,
        credentials: Option<&Credentials>,
    ) -> Result<Exchange, NetworkError> {
        let (host, port) = socket_target(url)?;
        let addr = format!("{host}:{port}");
        debug!(url = %url, addr = %addr, "connecting");

        let mut stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| NetworkError::Connect {
                addr,
                source: Arc::new(e),
            })?;

        let mut request = Request::get(url)
            .map_err(|e| NetworkError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?
            .header("User-Agent", self.user_agent.as_str())
            .header("Accept", "image/*, */*;q=0.8")
            .header("Accept-Encoding", "identity")
            .header("Connection", "close");
        if let Some(credentials) = credentials {
            request = request.basic_auth(credentials);
        }
        debug!(
            path = request.target(),
            auth = request.headers().contains("Authorization"),
            "sending request"
        );
        stream.write_all(&request.into_bytes()).await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        loop {
            let bytes_read = stream.read_buf(&mut buf).await?;

            match ResponseHead::parse(&buf) {
                Ok((head, body_offset)) => {
                    buf.advance(body_offset);
                    debug!(url = %url, status = %head.status(), "response head received");
                    return Ok(Exchange { head, stream, buf });
                }
                Err(ResponseError::Incomplete) => {
                    if bytes_read == 0 {
                        return Err(NetworkError::UnexpectedEof);
                    }
                    if buf.len() > MAX_HEAD_SIZE {
                        return Err(NetworkError::HeadTooLarge {
                            max_bytes: MAX_HEAD_SIZE,
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn read_body(&self, exchange: Exchange) -> Result<Bytes, NetworkError> {
        let Exchange {
            head,
            mut stream,
            mut buf,
        } = exchange;
        let max_bytes = self.max_body_bytes;
        let too_large = NetworkError::BodyTooLarge { max_bytes };

        match head.framing()? {
            BodyFraming::Empty => Ok(Bytes::new()),
            BodyFraming::Length(len) => {
                if len > max_bytes {
                    return Err(too_large);
                }
                buf.reserve(len.saturating_sub(buf.len()));
                while buf.len() < len {
                    if stream.read_buf(&mut buf).await? == 0 {
                        return Err(NetworkError::UnexpectedEof);
                    }
                }
                buf.truncate(len);
                Ok(buf.freeze())
            }
            BodyFraming::Chunked => {
                let mut decoder = ChunkedDecoder::new();
                loop {
                    if decoder.decode(&mut buf)? {
                        return Ok(decoder.into_body());
                    }
                    // Data is consumed eagerly, so whatever is left in `buf` is
                    // an unterminated size or trailer line.
                    if decoder.body_len() > max_bytes || buf.len() > MAX_CHUNK_LINE {
                        return Err(too_large);
                    }
                    if stream.read_buf(&mut buf).await? == 0 {
                        return Err(NetworkError::UnexpectedEof);
                    }
                }
            }
            BodyFraming::UntilClose => loop {
                if buf.len() > max_bytes {
                    return Err(too_large);
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    return Ok(buf.freeze());
                }
            },
        }
    }
}

impl Transport for HttpTransport {
    fn fetch<'a>(&'a self, request: &'a FetchRequest) -> FetchFuture<'a> {
        Box::pin(self.get(request))
    }
}

fn parse_http_url(raw: &str) -> Result<Url, NetworkError> {
    let url = Url::parse(raw).map_err(|e| NetworkError::InvalidUrl {
        url: raw.to_owned(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "http" {
        return Err(NetworkError::UnsupportedScheme {
            scheme: url.scheme().to_owned(),
        });
    }
    Ok(url)
}

fn socket_target(url: &Url) -> Result<(String, u16), NetworkError> {
    let host = match url.host() {
        Some(url::Host::Domain(domain)) => domain.to_owned(),
        Some(url::Host::Ipv4(ip)) => ip.to_string(),
        Some(url::Host::Ipv6(ip)) => ip.to_string(),
        None => {
            return Err(NetworkError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".to_owned(),
            });
        }
    };
    let port = url.port_or_known_default().unwrap_or(80);
    Ok((host, port))
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}
