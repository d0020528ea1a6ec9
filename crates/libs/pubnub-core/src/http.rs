//! Minimal HTTP/1.1 framing: GET request bytes out, reply body into the
//! context's reply buffer.

use crate::buffer::ReplyBuffer;
use crate::context::PNSDK;
use crate::error::PubnubError;
use std::io;

const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_LINE_BYTES: usize = 4 * 1024;

pub fn build_get_request(target: &str, host: &str) -> Vec<u8> {
    let mut request = Vec::with_capacity(target.len() + host.len() + 96);
    request.extend_from_slice(format!("GET {target} HTTP/1.1\r\n").as_bytes());
    request.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    request.extend_from_slice(format!("User-Agent: {PNSDK}\r\n").as_bytes());
    request.extend_from_slice(b"Accept: */*\r\n");
    request.extend_from_slice(b"Connection: close\r\n");
    request.extend_from_slice(b"\r\n");
    request
}

pub fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(HEADER_END.len()).position(|window| window == HEADER_END)
}

/// `Ok(None)` when the header is absent, an error when it is not a number.
pub fn parse_content_length(headers: &[u8]) -> Result<Option<usize>, PubnubError> {
    header_value(headers, "content-length")
        .map(|value| {
            value.parse().map_err(|_| PubnubError::invalid_response("malformed Content-Length"))
        })
        .transpose()
}

fn header_value(headers: &[u8], name: &str) -> Option<String> {
    String::from_utf8_lossy(headers).lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim().to_owned())
    })
}

fn parse_status(headers: &[u8]) -> Result<u16, PubnubError> {
    let text = String::from_utf8_lossy(headers);
    let line = text.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next().and_then(|code| code.parse().ok())) {
        (Some(version), Some(status)) if version.starts_with("HTTP/1.") => Ok(status),
        _ => Err(PubnubError::invalid_response("malformed HTTP status line")),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadProgress {
    NeedMore,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReaderState {
    Headers,
    Sized { remaining: usize },
    UntilClose,
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkEnd,
    Trailers,
    Done,
}

/// Incremental reply reader fed with whatever the socket produced.
///
/// Understands `Content-Length`, `Transfer-Encoding: chunked` and bodies
/// delimited by connection close. Only the body reaches the reply buffer.
#[derive(Debug)]
pub struct ReplyReader {
    state: ReaderState,
    head: Vec<u8>,
    line: Vec<u8>,
    status: Option<u16>,
    content_len: usize,
}

impl Default for ReplyReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyReader {
    pub fn new() -> Self {
        Self {
            state: ReaderState::Headers,
            head: Vec::new(),
            line: Vec::new(),
            status: None,
            content_len: 0,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Body length announced by `Content-Length`, or received so far otherwise.
    pub fn content_len(&self) -> usize {
        self.content_len
    }

    pub fn is_complete(&self) -> bool {
        self.state == ReaderState::Done
    }

    pub fn feed(
        &mut self,
        input: &[u8],
        body: &mut ReplyBuffer,
    ) -> Result<ReadProgress, PubnubError> {
        if self.state != ReaderState::Headers {
            return self.feed_body(input, body);
        }
        self.head.extend_from_slice(input);
        let Some(end) = find_header_end(&self.head) else {
            if self.head.len() > MAX_HEADER_BYTES {
                return Err(PubnubError::invalid_response("reply headers too large"));
            }
            return Ok(ReadProgress::NeedMore);
        };
        let rest = self.head.split_off(end + HEADER_END.len());
        self.start_body(body)?;
        self.feed_body(&rest, body)
    }

    /// Called when the peer closed the connection.
    pub fn finish_on_close(&mut self) -> Result<(), PubnubError> {
        match self.state {
            ReaderState::UntilClose | ReaderState::Done => {
                self.state = ReaderState::Done;
                Ok(())
            }
            _ => Err(PubnubError::Io {
                kind: io::ErrorKind::UnexpectedEof,
                message: "connection closed before the reply was complete".to_owned(),
            }),
        }
    }

    fn start_body(&mut self, body: &mut ReplyBuffer) -> Result<(), PubnubError> {
        let status = parse_status(&self.head)?;
        self.status = Some(status);
        let chunked = header_value(&self.head, "transfer-encoding")
            .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));
        self.state = if chunked {
            ReaderState::ChunkSize
        } else {
            match parse_content_length(&self.head)? {
                Some(length) => {
                    body.ensure_capacity(body.len().saturating_add(length))?;
                    self.content_len = length;
                    if length == 0 {
                        ReaderState::Done
                    } else {
                        ReaderState::Sized { remaining: length }
                    }
                }
                None => ReaderState::UntilClose,
            }
        };
        log::debug!("http: reply status {status}, framing {:?}", self.state);
        Ok(())
    }

    fn feed_body(
        &mut self,
        mut input: &[u8],
        body: &mut ReplyBuffer,
    ) -> Result<ReadProgress, PubnubError> {
        while !input.is_empty() && self.state != ReaderState::Done {
            match self.state {
                ReaderState::Sized { remaining } => {
                    let take = remaining.min(input.len());
                    body.extend_from_slice(&input[..take])?;
                    input = &input[take..];
                    self.state = if take == remaining {
                        ReaderState::Done
                    } else {
                        ReaderState::Sized { remaining: remaining - take }
                    };
                }
                ReaderState::UntilClose => {
                    body.extend_from_slice(input)?;
                    self.content_len += input.len();
                    input = &[];
                }
                ReaderState::ChunkSize => {
                    if let Some(line) = self.read_line(&mut input)? {
                        let size = parse_chunk_size(&line)?;
                        self.state = if size == 0 {
                            ReaderState::Trailers
                        } else {
                            body.ensure_capacity(body.len().saturating_add(size))?;
                            ReaderState::ChunkData { remaining: size }
                        };
                    }
                }
                ReaderState::ChunkData { remaining } => {
                    let take = remaining.min(input.len());
                    body.extend_from_slice(&input[..take])?;
                    self.content_len += take;
                    input = &input[take..];
                    self.state = if take == remaining {
                        ReaderState::ChunkEnd
                    } else {
                        ReaderState::ChunkData { remaining: remaining - take }
                    };
                }
                ReaderState::ChunkEnd => {
                    if let Some(line) = self.read_line(&mut input)? {
                        if !line.is_empty() {
                            return Err(PubnubError::invalid_response("missing CRLF after chunk"));
                        }
                        self.state = ReaderState::ChunkSize;
                    }
                }
                ReaderState::Trailers => {
                    if let Some(line) = self.read_line(&mut input)? {
                        if line.is_empty() {
                            self.state = ReaderState::Done;
                        }
                    }
                }
                ReaderState::Headers | ReaderState::Done => break,
            }
        }
        Ok(if self.state == ReaderState::Done {
            ReadProgress::Complete
        } else {
            ReadProgress::NeedMore
        })
    }

    /// Takes one line (without CRLF) off `input`, buffering partial lines.
    fn read_line(&mut self, input: &mut &[u8]) -> Result<Option<Vec<u8>>, PubnubError> {
        match input.iter().position(|&byte| byte == b'\n') {
            Some(pos) => {
                self.line.extend_from_slice(&input[..pos]);
                *input = &input[pos + 1..];
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            None => {
                self.line.extend_from_slice(input);
                *input = &[];
                if self.line.len() > MAX_LINE_BYTES {
                    return Err(PubnubError::invalid_response("chunk header line too long"));
                }
                Ok(None)
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, PubnubError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| PubnubError::invalid_response("chunk size is not ASCII"))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(digits, 16)
        .map_err(|_| PubnubError::invalid_response("malformed chunk size"))
}
