//! HTTP/1.1 response parsing using the [`httparse`] crate.
//!
//! [`ResponseHead::parse`] handles the status line and headers;
//! [`ChunkedDecoder`] reassembles a `Transfer-Encoding: chunked` body as
//! bytes arrive.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, StatusCode};

/// Errors that can occur while parsing an HTTP/1.1 response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResponseError {
    #[error("response is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing status code")]
    MissingStatus,

    #[error("invalid Content-Length: {value}")]
    InvalidContentLength { value: String },

    #[error("malformed chunked body")]
    InvalidChunk,
}

/// How the body following a response head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// The status forbids a body.
    Empty,
    /// Exactly this many bytes follow.
    Length(usize),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// The body runs until the server closes the connection.
    UntilClose,
}

/// The status line and headers of a response.
///
/// # Examples
///
/// ```
/// use imcache::http::{BodyFraming, ResponseHead};
///
/// let raw = b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 3\r\n\r\nPNG";
/// let (head, offset) = ResponseHead::parse(raw).unwrap();
///
/// assert!(head.status().is_success());
/// assert_eq!(head.headers().get("content-type"), Some("image/png"));
/// assert_eq!(head.framing().unwrap(), BodyFraming::Length(3));
/// assert_eq!(&raw[offset..], b"PNG");
/// ```
#[derive(Debug, Clone)]
pub struct ResponseHead {
    status: StatusCode,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
}

impl ResponseHead {
    /// Maximum number of headers we accept per response.
    const MAX_HEADERS: usize = 64;

    /// Parses a response head from the start of `buf`.
    ///
    /// Returns the head and the byte offset at which the body begins.
    ///
    /// # Errors
    ///
    /// - [`ResponseError::Incomplete`]: the head has not fully arrived yet.
    /// - [`ResponseError::Parse`]: the data is not a valid HTTP/1.x response.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ResponseError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Response::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(ResponseError::Incomplete),
        };

        let status = StatusCode::new(raw.code.ok_or(ResponseError::MissingStatus)?);
        let version = raw.version.unwrap_or(1);

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        Ok((
            Self {
                status,
                version,
                headers: header_map,
            },
            body_offset,
        ))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The `Location` header, if any.
    pub fn location(&self) -> Option<&str> {
        self.headers.get("location")
    }

    /// Determines how the body is delimited (RFC 9112 §6.3).
    ///
    /// `Transfer-Encoding: chunked` takes precedence over `Content-Length`.
    pub fn framing(&self) -> Result<BodyFraming, ResponseError> {
        if self.status.is_bodyless() {
            return Ok(BodyFraming::Empty);
        }
        if self.headers.has_token("transfer-encoding", "chunked") {
            return Ok(BodyFraming::Chunked);
        }
        match self.headers.get("content-length") {
            Some(value) => value
                .trim()
                .parse()
                .map(BodyFraming::Length)
                .map_err(|_| ResponseError::InvalidContentLength {
                    value: value.to_owned(),
                }),
            None => Ok(BodyFraming::UntilClose),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental decoder for a chunked body.
///
/// Feed it the connection buffer with [`decode`](Self::decode) after every
/// read; it consumes whatever complete pieces are present and leaves the
/// rest in place.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    body: BytesMut,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            body: BytesMut::new(),
        }
    }

    /// Consumes as much of `buf` as possible.
    ///
    /// Returns `Ok(true)` once the terminating chunk and trailers have been read.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<bool, ResponseError> {
        loop {
            match self.state {
                ChunkState::Size => match httparse::parse_chunk_size(buf) {
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        buf.advance(consumed);
                        let size = usize::try_from(size).map_err(|_| ResponseError::InvalidChunk)?;
                        self.state = if size == 0 {
                            ChunkState::Trailer
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                    Ok(httparse::Status::Partial) => return Ok(false),
                    Err(_) => return Err(ResponseError::InvalidChunk),
                },
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(false);
                    }
                    let take = remaining.min(buf.len());
                    self.body.extend_from_slice(&buf.split_to(take));
                    self.state = match remaining - take {
                        0 => ChunkState::DataEnd,
                        left => ChunkState::Data(left),
                    };
                }
                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(false);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ResponseError::InvalidChunk);
                    }
                    buf.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(line_end) = buf.windows(2).position(|w| w == b"\r\n") else {
                        return Ok(false);
                    };
                    // An empty line ends the trailer section; anything else is a trailer field we skip.
                    buf.advance(line_end + 2);
                    if line_end == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }

    /// Bytes of body decoded so far.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Returns the decoded body.
    pub fn into_body(self) -> Bytes {
        self.body.freeze()
    }
}
