//! In-place response parsing.
//!
//! Every parser works in two phases. The scan phase reads the reply and
//! produces a plan (separator offsets, element ranges, extracted fields)
//! without touching the buffer. Only a complete, valid plan is applied, which
//! is where top-level separators are overwritten with NUL bytes. A reply that
//! fails validation therefore leaves both the buffer and the context as they
//! were.

use crate::buffer::{is_json_whitespace, TokenCursor};
use crate::error::PubnubError;
use std::ops::Range;

/// Positions of one JSON array inside a buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayLayout {
    pub open: usize,
    pub close: usize,
    /// Top-level commas, ascending.
    pub separators: Vec<usize>,
    /// Elements with surrounding whitespace trimmed.
    pub elements: Vec<Range<usize>>,
}

impl ArrayLayout {
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Cursor over the NUL-separated elements once the layout is applied.
    pub fn cursor(&self) -> TokenCursor {
        if self.elements.is_empty() {
            TokenCursor::EMPTY
        } else {
            TokenCursor::new(self.open + 1, self.close)
        }
    }

    pub(crate) fn apply(&self, buf: &mut [u8]) {
        for &separator in &self.separators {
            buf[separator] = 0;
        }
    }
}

/// Locates the JSON array occupying `buf[range]` and its top-level elements.
///
/// Commas nested in brackets, braces or quoted strings (with backslash
/// escapes) are not separators.
pub fn scan_array(buf: &[u8], range: Range<usize>) -> Result<ArrayLayout, PubnubError> {
    let region = &buf[range.clone()];
    let Some(first) = region.iter().position(|&b| !is_json_whitespace(b)) else {
        return Err(PubnubError::invalid_response("empty array input"));
    };
    let last = region.iter().rposition(|&b| !is_json_whitespace(b)).unwrap_or(first);
    let open = range.start + first;
    let close = range.start + last;
    if buf[open] != b'[' {
        return Err(PubnubError::invalid_response("expected '['"));
    }
    if close == open || buf[close] != b']' {
        return Err(PubnubError::invalid_response("unbalanced brackets"));
    }

    let mut closers: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut separators = Vec::new();
    for (pos, &byte) in buf.iter().enumerate().take(close).skip(open + 1) {
        if byte == 0 {
            return Err(PubnubError::invalid_response("NUL byte inside reply"));
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' => closers.push(b']'),
            b'{' => closers.push(b'}'),
            b']' | b'}' => {
                if closers.pop() != Some(byte) {
                    return Err(PubnubError::invalid_response("unbalanced brackets"));
                }
            }
            b',' if closers.is_empty() => separators.push(pos),
            _ => {}
        }
    }
    if in_string {
        return Err(PubnubError::invalid_response("unterminated string"));
    }
    if !closers.is_empty() {
        return Err(PubnubError::invalid_response("unbalanced brackets"));
    }

    let mut elements = Vec::with_capacity(separators.len() + 1);
    let inner_blank = buf[open + 1..close].iter().all(|&b| is_json_whitespace(b));
    if !inner_blank {
        let mut start = open + 1;
        for end in separators.iter().copied().chain(std::iter::once(close)) {
            let element = trimmed(buf, start..end);
            if element.is_empty() {
                return Err(PubnubError::invalid_response("empty array element"));
            }
            elements.push(element);
            start = end + 1;
        }
    }

    Ok(ArrayLayout { open, close, separators, elements })
}

/// Rewrites the single JSON array in `buf` into NUL-separated element strings.
///
/// Fails on empty input, unbalanced brackets or an unterminated string, in
/// which case `buf` is not modified.
pub fn split_array(buf: &mut [u8]) -> Result<TokenCursor, PubnubError> {
    let layout = scan_array(buf, 0..buf.len())?;
    layout.apply(buf);
    Ok(layout.cursor())
}

fn trimmed(buf: &[u8], range: Range<usize>) -> Range<usize> {
    let mut start = range.start;
    let mut end = range.end;
    while start < end && is_json_whitespace(buf[start]) {
        start += 1;
    }
    while end > start && is_json_whitespace(buf[end - 1]) {
        end -= 1;
    }
    start..end
}

/// Content range of the JSON string literal spanning exactly `range`.
fn string_contents(buf: &[u8], range: &Range<usize>) -> Option<Range<usize>> {
    if range.len() < 2 || buf[range.start] != b'"' {
        return None;
    }
    let mut escaped = false;
    for pos in range.start + 1..range.end {
        let byte = buf[pos];
        if escaped {
            escaped = false;
        } else if byte == b'\\' {
            escaped = true;
        } else if byte == b'"' {
            return (pos + 1 == range.end).then_some(range.start + 1..pos);
        }
    }
    None
}

/// Names are yielded without JSON unescaping, so escapes are refused.
fn check_channel_name(name: &[u8]) -> Result<(), PubnubError> {
    if name.is_empty() {
        return Err(PubnubError::invalid_response("empty channel name"));
    }
    if name.contains(&b'\\') {
        return Err(PubnubError::invalid_response("escaped channel name"));
    }
    Ok(())
}

fn ensure_utf8(buf: &[u8]) -> Result<&str, PubnubError> {
    std::str::from_utf8(buf).map_err(|_| PubnubError::invalid_response("reply is not UTF-8"))
}

/// Validated subscribe reply, ready to be applied to the buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SubscribePlan {
    messages: ArrayLayout,
    timetoken: Range<usize>,
    channels: Option<ChannelList>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ChannelList {
    /// Array of quoted names; the quotes are blanked on apply so the cursor
    /// yields bare names.
    Array(ArrayLayout),
    /// Legacy form: one quoted string holding comma-joined names.
    Joined { contents: Range<usize>, commas: Vec<usize> },
}

impl SubscribePlan {
    pub(crate) fn timetoken<'a>(&self, buf: &'a [u8]) -> &'a str {
        std::str::from_utf8(&buf[self.timetoken.clone()]).unwrap_or_default()
    }

    pub(crate) fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Writes the separators and returns the message and channel cursors.
    pub(crate) fn apply(&self, buf: &mut [u8]) -> (TokenCursor, TokenCursor) {
        self.messages.apply(buf);
        let channels = match &self.channels {
            None => TokenCursor::EMPTY,
            Some(ChannelList::Array(layout)) => {
                layout.apply(buf);
                for element in &layout.elements {
                    buf[element.start] = b' ';
                    buf[element.end - 1] = b' ';
                }
                layout.cursor()
            }
            Some(ChannelList::Joined { contents, commas }) => {
                for &comma in commas {
                    buf[comma] = 0;
                }
                TokenCursor::new(contents.start, contents.end)
            }
        };
        (self.messages.cursor(), channels)
    }
}

/// Validates `[[messages...], "timetoken", channels?]`.
pub(crate) fn plan_subscribe(
    buf: &[u8],
    max_timetoken_len: usize,
) -> Result<SubscribePlan, PubnubError> {
    ensure_utf8(buf)?;
    let outer = scan_array(buf, 0..buf.len())?;
    if !matches!(outer.len(), 2 | 3) {
        return Err(PubnubError::invalid_response("subscribe reply must have 2 or 3 elements"));
    }

    let messages = scan_array(buf, outer.elements[0].clone())?;

    let timetoken = string_contents(buf, &outer.elements[1])
        .ok_or(PubnubError::invalid_response("timetoken is not a string"))?;
    if timetoken.is_empty() || timetoken.len() > max_timetoken_len {
        return Err(PubnubError::invalid_response("timetoken length out of range"));
    }

    let channels = match outer.elements.get(2) {
        None => None,
        Some(element) if buf[element.start] == b'[' => {
            let layout = scan_array(buf, element.clone())?;
            for name in &layout.elements {
                let contents = string_contents(buf, name)
                    .ok_or(PubnubError::invalid_response("channel name is not a string"))?;
                check_channel_name(&buf[contents])?;
            }
            if layout.len() != messages.len() {
                return Err(PubnubError::invalid_response(
                    "channel count does not match message count",
                ));
            }
            Some(ChannelList::Array(layout))
        }
        Some(element) => {
            let contents = string_contents(buf, element)
                .ok_or(PubnubError::invalid_response("channel list is neither array nor string"))?;
            let joined = &buf[contents.clone()];
            if !joined.is_empty() {
                for name in joined.split(|&b| b == b',') {
                    check_channel_name(name)?;
                }
            }
            let commas: Vec<usize> = joined
                .iter()
                .enumerate()
                .filter(|&(_, &byte)| byte == b',')
                .map(|(offset, _)| contents.start + offset)
                .collect();
            let count = if joined.is_empty() { 0 } else { commas.len() + 1 };
            if count != messages.len() {
                return Err(PubnubError::invalid_response(
                    "channel count does not match message count",
                ));
            }
            if count == 0 {
                None
            } else {
                Some(ChannelList::Joined { contents, commas })
            }
        }
    };

    Ok(SubscribePlan { messages, timetoken, channels })
}

/// Parsed publish reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishResponse {
    pub status: i64,
    pub description: String,
    pub timetoken: Option<String>,
}

impl PublishResponse {
    pub fn is_success(&self) -> bool {
        self.status == 1 && self.timetoken.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PublishPlan {
    pub(crate) layout: Option<ArrayLayout>,
    pub(crate) response: PublishResponse,
}

/// Validates `[status, "description", "timetoken"?]`, or a JSON error object.
pub(crate) fn plan_publish(buf: &[u8]) -> Result<PublishPlan, PubnubError> {
    let text = ensure_utf8(buf)?;
    if text.trim_start().starts_with('{') {
        return plan_publish_error_object(text);
    }

    let layout = scan_array(buf, 0..buf.len())?;
    if !matches!(layout.len(), 2 | 3) {
        return Err(PubnubError::invalid_response("publish reply must have 2 or 3 elements"));
    }
    let status: i64 = text[layout.elements[0].clone()]
        .parse()
        .map_err(|_| PubnubError::invalid_response("publish status is not an integer"))?;
    let description: String = serde_json::from_str(&text[layout.elements[1].clone()])
        .map_err(|_| PubnubError::invalid_response("publish description is not a string"))?;
    let timetoken = match layout.elements.get(2) {
        Some(range) => {
            let contents = string_contents(buf, range)
                .ok_or(PubnubError::invalid_response("publish timetoken is not a string"))?;
            Some(text[contents].to_owned())
        }
        None => None,
    };
    if status == 1 && timetoken.is_none() {
        return Err(PubnubError::invalid_response("successful publish without timetoken"));
    }

    Ok(PublishPlan {
        layout: Some(layout),
        response: PublishResponse { status, description, timetoken },
    })
}

fn plan_publish_error_object(text: &str) -> Result<PublishPlan, PubnubError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|_| PubnubError::invalid_response("malformed error object"))?;
    let object = value.as_object().ok_or(PubnubError::invalid_response("expected object"))?;
    let status = object.get("status").and_then(serde_json::Value::as_i64).unwrap_or(0);
    let description = ["message", "error", "service"]
        .iter()
        .find_map(|key| object.get(*key).and_then(serde_json::Value::as_str))
        .ok_or(PubnubError::invalid_response("error object without message"))?
        .to_owned();
    if status == 1 {
        return Err(PubnubError::invalid_response("error object reports success"));
    }
    Ok(PublishPlan {
        layout: None,
        response: PublishResponse { status, description, timetoken: None },
    })
}
