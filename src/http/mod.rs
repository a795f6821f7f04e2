//! Minimal HTTP/1.1 client-side protocol types.
//!
//! This module provides what the transport needs to issue a GET and read the
//! reply: [`StatusCode`], [`Headers`], [`Request`] (serialization) and
//! [`ResponseHead`] / [`ChunkedDecoder`] (parsing).

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::Request;
pub use response::{BodyFraming, ChunkedDecoder, ResponseError, ResponseHead};

/// An HTTP response status code as received on the wire.
///
/// # Examples
///
/// ```
/// use imcache::http::StatusCode;
///
/// let status = StatusCode::new(404);
/// assert!(!status.is_success());
/// assert_eq!(status.to_string(), "404 Not Found");
/// assert!(StatusCode::new(308).is_redirect());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: Self = Self(200);
    pub const NOT_MODIFIED: Self = Self(304);
    pub const UNAUTHORIZED: Self = Self(401);
    pub const NOT_FOUND: Self = Self(404);

    /// Wraps a numeric status code.
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric status code.
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// `2xx`
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }

    /// Redirects the transport follows: 301, 302, 303, 307 and 308.
    pub fn is_redirect(self) -> bool {
        matches!(self.0, 301 | 302 | 303 | 307 | 308)
    }

    /// Returns `true` for statuses that never carry a body (1xx, 204, 304).
    pub fn is_bodyless(self) -> bool {
        (100..200).contains(&self.0) || self.0 == 204 || self.0 == 304
    }

    /// Returns the canonical reason phrase, or `""` for codes we do not name.
    pub fn canonical_reason(self) -> &'static str {
        match self.0 {
            200 => "OK",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            410 => "Gone",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.canonical_reason() {
            "" => write!(f, "{}", self.0),
            reason => write!(f, "{} {}", self.0, reason),
        }
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert!(StatusCode::OK.is_success());
        assert!(StatusCode::new(206).is_success());
        assert!(!StatusCode::new(300).is_redirect());
        assert!(StatusCode::NOT_MODIFIED.is_bodyless());
        assert!(StatusCode::new(101).is_bodyless());
        assert!(!StatusCode::NOT_FOUND.is_bodyless());
    }

    #[test]
    fn display_unknown_code() {
        assert_eq!(StatusCode::new(599).to_string(), "599");
        assert_eq!(StatusCode::UNAUTHORIZED.to_string(), "401 Unauthorized");
    }
}
