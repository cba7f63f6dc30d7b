//! Incremental HTTP/1.1 response decoding.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ParseError;

/// Default limit for the status line plus headers (64KB).
pub const DEFAULT_MAX_HEAD_SIZE: usize = 64 * 1024;

/// Chunk size lines longer than this are rejected.
const MAX_CHUNK_LINE: usize = 4096;

/// HTTP version from the status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body (HEAD request, `204`, `304`).
    None,
    /// Exactly this many bytes.
    Length(u64),
    /// `transfer-encoding: chunked`.
    Chunked,
    /// Body runs until the peer closes the connection.
    UntilClose,
}

/// Parsed response status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    /// Header (name, value) pairs in wire order, names as sent.
    pub headers: Vec<(String, String)>,
    pub body: BodyKind,
    /// Whether the connection may carry another request after this response.
    pub keep_alive: bool,
}

impl ResponseHead {
    /// Get the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if body bytes may follow the head.
    pub fn has_body(&self) -> bool {
        !matches!(self.body, BodyKind::None | BodyKind::Length(0))
    }
}

/// One item produced by [`ResponseDecoder::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Final (non-1xx) response head.
    Head(ResponseHead),
    /// A run of body bytes, already de-chunked.
    Body(Bytes),
    /// End of the response message.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkCrlf,
    Trailers,
    UntilClose,
    Done,
}

/// Decoder for a single HTTP/1.1 response.
///
/// Feed received bytes into a `BytesMut` and call [`decode`](Self::decode)
/// until it returns `Ok(None)`. Consumed bytes are removed from the buffer;
/// body chunks are split off without copying.
#[derive(Debug)]
pub struct ResponseDecoder {
    state: State,
    head_request: bool,
    max_head_size: usize,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Head,
            head_request: false,
            max_head_size: DEFAULT_MAX_HEAD_SIZE,
        }
    }

    /// Decoder for the response to a `HEAD` request, which never has a body
    /// regardless of its framing headers.
    pub fn for_head_request() -> Self {
        Self {
            head_request: true,
            ..Self::new()
        }
    }

    /// Override the response head size limit.
    pub fn with_max_head_size(mut self, max_head_size: usize) -> Self {
        self.max_head_size = max_head_size;
        self
    }

    /// Returns true once [`Decoded::End`] has been produced.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Decode the next item from `buf`.
    ///
    /// Returns `Ok(None)` when more data is needed (or the message is done).
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, ParseError> {
        loop {
            match self.state {
                State::Head => {
                    let Some(end) = find_header_end(buf) else {
                        if buf.len() > self.max_head_size {
                            return Err(ParseError::HeadTooLarge(self.max_head_size));
                        }
                        return Ok(None);
                    };
                    if end + 4 > self.max_head_size {
                        return Err(ParseError::HeadTooLarge(self.max_head_size));
                    }

                    let raw = buf.split_to(end + 4);
                    let head = parse_head(&raw[..end], self.head_request)?;
                    if (100..200).contains(&head.status) {
                        // Interim response; the final head follows.
                        continue;
                    }

                    self.state = match head.body {
                        BodyKind::None => State::Length(0),
                        BodyKind::Length(n) => State::Length(n),
                        BodyKind::Chunked => State::ChunkSize,
                        BodyKind::UntilClose => State::UntilClose,
                    };
                    return Ok(Some(Decoded::Head(head)));
                }
                State::Length(0) => {
                    self.state = State::Done;
                    return Ok(Some(Decoded::End));
                }
                State::Length(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(buf.len() as u64);
                    let chunk = buf.split_to(n as usize).freeze();
                    self.state = State::Length(remaining - n);
                    return Ok(Some(Decoded::Body(chunk)));
                }
                State::ChunkSize => {
                    let Some(crlf) = find_crlf(buf) else {
                        if buf.len() > MAX_CHUNK_LINE {
                            return Err(ParseError::InvalidChunkSize);
                        }
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&buf[..crlf])?;
                    buf.advance(crlf + 2);
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ChunkData(size)
                    };
                }
                State::ChunkData(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(buf.len() as u64);
                    let chunk = buf.split_to(n as usize).freeze();
                    self.state = if n == remaining {
                        State::ChunkCrlf
                    } else {
                        State::ChunkData(remaining - n)
                    };
                    return Ok(Some(Decoded::Body(chunk)));
                }
                State::ChunkCrlf => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ParseError::MissingChunkTerminator);
                    }
                    buf.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let Some(crlf) = find_crlf(buf) else {
                        if buf.len() > self.max_head_size {
                            return Err(ParseError::HeadTooLarge(self.max_head_size));
                        }
                        return Ok(None);
                    };
                    // Trailer fields are discarded.
                    buf.advance(crlf + 2);
                    if crlf == 0 {
                        self.state = State::Done;
                        return Ok(Some(Decoded::End));
                    }
                }
                State::UntilClose => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(Decoded::Body(buf.split().freeze())));
                }
                State::Done => return Ok(None),
            }
        }
    }

    /// Decode after the peer closed the connection.
    ///
    /// Drains whatever `buf` still holds, then finishes a read-until-close
    /// body with [`Decoded::End`]. Any other unfinished message is
    /// [`ParseError::UnexpectedEof`].
    pub fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, ParseError> {
        if let Some(item) = self.decode(buf)? {
            return Ok(Some(item));
        }
        match self.state {
            State::UntilClose => {
                self.state = State::Done;
                Ok(Some(Decoded::End))
            }
            State::Done => Ok(None),
            _ => Err(ParseError::UnexpectedEof),
        }
    }
}

/// Find the position of `\r\n\r\n` in data, returns index of the first `\r`.
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidChunkSize)?;
    // Strip chunk extensions (;key=value).
    let hex = line.split(';').next().unwrap_or("").trim();
    if hex.is_empty() {
        return Err(ParseError::InvalidChunkSize);
    }
    u64::from_str_radix(hex, 16).map_err(|_| ParseError::InvalidChunkSize)
}

/// Parse the status line and headers (everything before `\r\n\r\n`).
fn parse_head(data: &[u8], head_request: bool) -> Result<ResponseHead, ParseError> {
    let text = std::str::from_utf8(data).map_err(|_| ParseError::InvalidHeader)?;
    let mut lines = text.split("\r\n");

    // Status line: HTTP/1.1 200 OK
    let status_line = lines.next().ok_or(ParseError::InvalidStatusLine)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::Http11,
        Some("HTTP/1.0") => Version::Http10,
        _ => return Err(ParseError::InvalidStatusLine),
    };
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .filter(|s| (100..1000).contains(s))
        .ok_or(ParseError::InvalidStatusLine)?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    let mut content_length: Option<u64> = None;
    // Some(true) when the final transfer coding is chunked.
    let mut transfer_encoding: Option<bool> = None;
    let mut conn_close = false;
    let mut conn_keep_alive = false;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(ParseError::InvalidHeader);
        }

        if name.eq_ignore_ascii_case("content-length") {
            let n: u64 = value
                .parse()
                .map_err(|_| ParseError::InvalidContentLength(value.to_string()))?;
            if content_length.is_some_and(|prev| prev != n) {
                return Err(ParseError::InvalidContentLength(value.to_string()));
            }
            content_length = Some(n);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            let chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
            transfer_encoding = Some(chunked);
        } else if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    conn_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    conn_keep_alive = true;
                }
            }
        }

        headers.push((name.to_string(), value.to_string()));
    }

    let body = if head_request || (100..200).contains(&status) || status == 204 || status == 304
    {
        BodyKind::None
    } else if let Some(chunked) = transfer_encoding {
        // Any other final coding is delimited by close, whatever the length says.
        if chunked {
            BodyKind::Chunked
        } else {
            BodyKind::UntilClose
        }
    } else if let Some(n) = content_length {
        BodyKind::Length(n)
    } else {
        BodyKind::UntilClose
    };

    let keep_alive = body != BodyKind::UntilClose
        && match version {
            Version::Http11 => !conn_close,
            Version::Http10 => conn_keep_alive && !conn_close,
        };

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        body,
        keep_alive,
    })
}
