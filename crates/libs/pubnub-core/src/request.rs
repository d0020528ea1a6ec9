//! Request target buffer and the typed URL parameter builder.

use crate::error::PubnubError;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt::Write as _;

/// Escapes everything except RFC 3986 unreserved characters.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Path segments keep `,` so channel lists stay comma-joined on the wire.
const PATH_SEGMENT: &AsciiSet = &QUERY_VALUE.remove(b',');

/// The character written in front of a query parameter.
///
/// The builder does not track whether a parameter was already written; the
/// caller picks `First` for the first one and `Next` for the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Separator {
    First,
    Next,
}

impl Separator {
    pub fn as_char(self) -> char {
        match self {
            Self::First => '?',
            Self::Next => '&',
        }
    }
}

/// A flag that may be left to the server default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TriBool {
    #[default]
    NotSet,
    False,
    True,
}

impl From<Option<bool>> for TriBool {
    fn from(value: Option<bool>) -> Self {
        match value {
            None => Self::NotSet,
            Some(false) => Self::False,
            Some(true) => Self::True,
        }
    }
}

impl From<bool> for TriBool {
    fn from(value: bool) -> Self {
        Some(value).into()
    }
}

/// Bounded buffer holding the path and query of the pending request.
///
/// Every append is all-or-nothing: when the addition would not fit, the call
/// fails with [`PubnubError::BufferFull`] and the buffer keeps its previous
/// contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestBuffer {
    buf: String,
    capacity: usize,
}

impl RequestBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { buf: String::with_capacity(capacity), capacity }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn push_checked(&mut self, piece: &str) -> Result<(), PubnubError> {
        let needed = self.buf.len() + piece.len();
        if needed > self.capacity {
            return Err(PubnubError::BufferFull { needed, capacity: self.capacity });
        }
        self.buf.push_str(piece);
        Ok(())
    }

    /// Appends `literal` without any escaping.
    pub fn push_str(&mut self, literal: &str) -> Result<(), PubnubError> {
        self.push_checked(literal)
    }

    /// Appends `/segment`, percent-encoding the segment.
    pub fn push_path_segment(&mut self, segment: &str) -> Result<(), PubnubError> {
        let piece = format!("/{}", utf8_percent_encode(segment, PATH_SEGMENT));
        self.push_checked(&piece)
    }

    /// Writes `separator name=value` when `value` is present; a no-op otherwise.
    pub fn append_param(
        &mut self,
        name: &str,
        value: Option<&str>,
        separator: Separator,
    ) -> Result<(), PubnubError> {
        let Some(value) = value else {
            return Ok(());
        };
        let mut piece = String::with_capacity(name.len() + value.len() + 2);
        piece.push(separator.as_char());
        piece.push_str(name);
        piece.push('=');
        let _ = write!(piece, "{}", utf8_percent_encode(value, QUERY_VALUE));
        self.push_checked(&piece)
    }

    pub fn append_int(
        &mut self,
        name: &str,
        value: i64,
        separator: Separator,
    ) -> Result<(), PubnubError> {
        self.append_param(name, Some(&value.to_string()), separator)
    }

    pub fn append_unsigned(
        &mut self,
        name: &str,
        value: u64,
        separator: Separator,
    ) -> Result<(), PubnubError> {
        self.append_param(name, Some(&value.to_string()), separator)
    }

    pub fn append_opt_unsigned(
        &mut self,
        name: &str,
        value: Option<u64>,
        separator: Separator,
    ) -> Result<(), PubnubError> {
        match value {
            Some(value) => self.append_unsigned(name, value, separator),
            None => Ok(()),
        }
    }

    pub fn append_bool(
        &mut self,
        name: &str,
        value: bool,
        separator: Separator,
    ) -> Result<(), PubnubError> {
        self.append_param(name, Some(if value { "true" } else { "false" }), separator)
    }

    /// `NotSet` writes nothing; otherwise the flag is rendered as `0` or `1`.
    pub fn append_tribool(
        &mut self,
        name: &str,
        value: TriBool,
        separator: Separator,
    ) -> Result<(), PubnubError> {
        let rendered = match value {
            TriBool::NotSet => None,
            TriBool::False => Some("0"),
            TriBool::True => Some("1"),
        };
        self.append_param(name, rendered, separator)
    }
}
