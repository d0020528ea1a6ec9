//! Reply buffer and the token cursors that walk it.
//!
//! The parsers rewrite the buffer in place, turning JSON array separators into
//! NUL bytes. A [`TokenCursor`] is a half-open range over that rewritten area;
//! taking a token moves its `begin` just past the token's NUL, so a parsed
//! reply can be iterated exactly once.

use crate::error::PubnubError;

/// Owned reply storage with a hard growth limit.
///
/// With the default build the full capacity is allocated up front and never
/// grows. With the `dynamic-reply-buffer` feature the buffer starts empty and
/// grows on demand up to `max_reply_bytes`.
#[derive(Debug)]
pub struct ReplyBuffer {
    data: Vec<u8>,
    len: usize,
    limit: usize,
}

impl ReplyBuffer {
    #[cfg(not(feature = "dynamic-reply-buffer"))]
    pub fn new(reply_capacity: usize, _max_reply_bytes: usize) -> Self {
        Self { data: vec![0; reply_capacity], len: 0, limit: reply_capacity }
    }

    #[cfg(feature = "dynamic-reply-buffer")]
    pub fn new(_reply_capacity: usize, max_reply_bytes: usize) -> Self {
        Self { data: Vec::new(), len: 0, limit: max_reply_bytes }
    }

    /// Bytes currently valid in the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes the buffer can hold without growing.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub(crate) fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Grows the buffer to hold at least `bytes`, keeping its contents.
    ///
    /// Growth at least doubles the capacity, capped at the limit.
    /// On failure nothing about the buffer changes.
    pub fn ensure_capacity(&mut self, bytes: usize) -> Result<(), PubnubError> {
        if bytes <= self.data.len() {
            return Ok(());
        }
        if bytes > self.limit {
            return Err(PubnubError::Allocation { requested: bytes, limit: self.limit });
        }
        let current = self.data.len();
        let target = bytes.max(current.saturating_mul(2)).min(self.limit);
        let target = if self.data.try_reserve_exact(target - current).is_ok() {
            target
        } else {
            self.data
                .try_reserve_exact(bytes - current)
                .map_err(|_| PubnubError::Allocation { requested: bytes, limit: self.limit })?;
            bytes
        };
        self.data.resize(target, 0);
        Ok(())
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), PubnubError> {
        let needed = self.len.checked_add(bytes.len()).ok_or(PubnubError::Allocation {
            requested: usize::MAX,
            limit: self.limit,
        })?;
        self.ensure_capacity(needed)?;
        self.data[self.len..needed].copy_from_slice(bytes);
        self.len = needed;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Half-open byte range of not-yet-consumed, NUL-separated tokens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenCursor {
    begin: usize,
    end: usize,
}

impl TokenCursor {
    pub const EMPTY: Self = Self { begin: 0, end: 0 };

    pub(crate) fn new(begin: usize, end: usize) -> Self {
        debug_assert!(begin <= end, "cursor begin {begin} past end {end}");
        Self { begin, end }
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// Yields the token at `begin` and advances past its terminating NUL.
    pub fn next_token<'a>(&mut self, buf: &'a [u8]) -> Option<&'a str> {
        if self.is_empty() || self.end > buf.len() {
            return None;
        }
        let region = &buf[self.begin..self.end];
        let stop = region.iter().position(|&byte| byte == 0).unwrap_or(region.len());
        self.begin = (self.begin + stop + 1).min(self.end);
        std::str::from_utf8(trim_json_whitespace(&region[..stop])).ok()
    }
}

pub(crate) fn is_json_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r')
}

pub(crate) fn trim_json_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| !is_json_whitespace(b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|&b| !is_json_whitespace(b)).map_or(start, |pos| pos + 1);
    &bytes[start..end]
}
