//! HTTP/1.1 GET request builder.
//!
//! Provides a fluent builder for the one request shape the transport sends
//! and serializes it to a byte buffer for transmission over TCP.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, BytesMut};
use thiserror::Error;
use url::Url;

use super::Headers;
use crate::key::Credentials;

/// Errors raised while building a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("URL has no host: {url}")]
    MissingHost { url: String },
}

/// An HTTP/1.1 `GET` request, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use imcache::http::Request;
/// use imcache::key::Credentials;
/// use url::Url;
///
/// let url = Url::parse("http://example.com:8080/img.png?size=2x").unwrap();
/// let request = Request::get(&url)
///     .unwrap()
///     .basic_auth(&Credentials::new("alice", "secret"));
///
/// let bytes = request.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("GET /img.png?size=2x HTTP/1.1\r\nHost: example.com:8080\r\n"));
/// assert!(text.contains("Authorization: Basic YWxpY2U6c2VjcmV0\r\n"));
/// assert!(text.ends_with("\r\n\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    target: String,
    headers: Headers,
}

impl Request {
    /// Starts a `GET` for `url` with the `Host` header filled in.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::MissingHost`] for URLs without a host.
    pub fn get(url: &Url) -> Result<Self, RequestError> {
        let host = url.host_str().ok_or_else(|| RequestError::MissingHost {
            url: url.to_string(),
        })?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        let target = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_owned(),
        };

        let mut headers = Headers::with_capacity(6);
        headers.insert("Host", host);
        Ok(Self { target, headers })
    }

    /// Sets a request header, replacing any previous value.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Attaches `Authorization: Basic …` for `credentials`.
    #[must_use]
    pub fn basic_auth(self, credentials: &Credentials) -> Self {
        let token = STANDARD.encode(format!(
            "{}:{}",
            credentials.username(),
            credentials.password()
        ));
        self.header("Authorization", format!("Basic {token}"))
    }

    /// Returns the request target (path and query).
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Serializes the request using HTTP/1.1 wire format.
    pub fn into_bytes(self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64 + self.target.len() + self.headers.len() * 48);
        buf.put(format!("GET {} HTTP/1.1\r\n", self.target).as_bytes());
        buf.put(self.headers.to_string().as_bytes());
        buf.put(&b"\r\n"[..]);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn default_port_omitted_from_host() {
        let url = Url::parse("http://example.com/a.png").unwrap();
        let s = to_string(Request::get(&url).unwrap().into_bytes());
        assert!(s.contains("Host: example.com\r\n"));
    }

    #[test]
    fn root_path_and_no_fragment() {
        let url = Url::parse("http://example.com#frag").unwrap();
        let req = Request::get(&url).unwrap();
        assert_eq!(req.target(), "/");
    }

    #[test]
    fn header_replaces() {
        let url = Url::parse("http://example.com/").unwrap();
        let req = Request::get(&url)
            .unwrap()
            .header("Accept", "*/*")
            .header("accept", "image/*");
        assert_eq!(req.headers().get("Accept"), Some("image/*"));
        assert_eq!(req.headers().len(), 2);
    }

    #[test]
    fn basic_auth_encoding() {
        let url = Url::parse("http://example.com/").unwrap();
        let req = Request::get(&url)
            .unwrap()
            .basic_auth(&Credentials::new("Aladdin", "open sesame"));
        assert_eq!(
            req.headers().get("authorization"),
            Some("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==")
        );
    }

    #[test]
    fn missing_host() {
        let url = Url::parse("data:image/png;base64,AAAA").unwrap();
        assert!(matches!(
            Request::get(&url),
            Err(RequestError::MissingHost { .. })
        ));
    }
}
