//! Per-client protocol state: keys, request/reply buffers and cursors.

use crate::buffer::{ReplyBuffer, TokenCursor};
use crate::config::ContextConfig;
use crate::error::{PubnubError, TransactionResult};
use crate::parse::{self, PublishResponse};
use crate::request::{RequestBuffer, Separator};
use serde::{Deserialize, Serialize};

pub const TIMETOKEN_CAPACITY: usize = 20;

/// Server-issued subscribe cursor.
pub type Timetoken = heapless::String<TIMETOKEN_CAPACITY>;

/// Value of the `pnsdk` parameter sent with every request.
pub const PNSDK: &str = concat!("pubnub-core-rust/", env!("CARGO_PKG_VERSION"));

const INITIAL_TIMETOKEN: &str = "0";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Publish,
    Subscribe,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
        }
    }
}

#[derive(Debug)]
pub struct Context {
    publish_key: Option<String>,
    subscribe_key: Option<String>,
    uuid: Option<String>,
    auth: Option<String>,
    timetoken: Timetoken,
    last_result: TransactionResult,
    request: RequestBuffer,
    reply: ReplyBuffer,
    content_len: usize,
    messages: TokenCursor,
    channels: TokenCursor,
    last_publish: Option<PublishResponse>,
}

impl Context {
    pub fn new(config: &ContextConfig) -> Self {
        let mut timetoken = Timetoken::new();
        let _ = timetoken.push_str(INITIAL_TIMETOKEN);
        Self {
            publish_key: config.publish_key.clone(),
            subscribe_key: config.subscribe_key.clone(),
            uuid: config.uuid.clone(),
            auth: config.auth.clone(),
            timetoken,
            last_result: TransactionResult::Idle,
            request: RequestBuffer::new(config.request_capacity),
            reply: ReplyBuffer::new(config.reply_capacity, config.max_reply_bytes),
            content_len: 0,
            messages: TokenCursor::EMPTY,
            channels: TokenCursor::EMPTY,
            last_publish: None,
        }
    }

    pub fn publish_key(&self) -> Option<&str> {
        self.publish_key.as_deref()
    }

    pub fn subscribe_key(&self) -> Option<&str> {
        self.subscribe_key.as_deref()
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    pub fn set_keys(&mut self, publish_key: Option<&str>, subscribe_key: Option<&str>) {
        self.publish_key = publish_key.map(str::to_owned);
        self.subscribe_key = subscribe_key.map(str::to_owned);
    }

    pub fn set_uuid(&mut self, uuid: Option<&str>) {
        self.uuid = uuid.map(str::to_owned);
    }

    pub fn set_auth(&mut self, auth: Option<&str>) {
        self.auth = auth.map(str::to_owned);
    }

    pub fn last_timetoken(&self) -> &str {
        self.timetoken.as_str()
    }

    /// Resumes subscribing from a previously saved timetoken.
    pub fn set_last_timetoken(&mut self, timetoken: &str) -> Result<(), PubnubError> {
        let mut next = Timetoken::new();
        if timetoken.is_empty() || next.push_str(timetoken).is_err() {
            return Err(PubnubError::invalid_argument(format!(
                "timetoken must be 1..={TIMETOKEN_CAPACITY} bytes"
            )));
        }
        self.timetoken = next;
        Ok(())
    }

    pub fn last_result(&self) -> TransactionResult {
        self.last_result
    }

    pub fn last_publish(&self) -> Option<&PublishResponse> {
        self.last_publish.as_ref()
    }

    /// Marks a transaction as in flight. Fails if one already is.
    pub fn begin_transaction(&mut self) -> Result<(), PubnubError> {
        if self.last_result == TransactionResult::Started {
            return Err(PubnubError::InvalidState {
                operation: "begin_transaction",
                state: "a transaction is in progress",
            });
        }
        self.last_result = TransactionResult::Started;
        Ok(())
    }

    /// Records the outcome of the in-flight transaction.
    ///
    /// Only the first call after [`Context::begin_transaction`] takes effect;
    /// returns whether this call was it.
    pub fn finish_transaction(&mut self, result: TransactionResult) -> bool {
        if self.last_result != TransactionResult::Started || !result.is_final() {
            return false;
        }
        self.last_result = result;
        true
    }

    /// Path and query of the most recently prepared request.
    pub fn request_target(&self) -> &str {
        self.request.as_str()
    }

    pub fn reply(&self) -> &ReplyBuffer {
        &self.reply
    }

    pub(crate) fn reply_mut(&mut self) -> &mut ReplyBuffer {
        &mut self.reply
    }

    pub fn buf_len(&self) -> usize {
        self.reply.len()
    }

    pub fn content_len(&self) -> usize {
        self.content_len
    }

    pub(crate) fn set_content_len(&mut self, content_len: usize) {
        self.content_len = content_len;
    }

    pub fn ensure_capacity(&mut self, bytes: usize) -> Result<(), PubnubError> {
        self.reply.ensure_capacity(bytes)
    }

    /// Replaces the reply buffer contents, e.g. with a body read by a host's
    /// own transport, and forgets any parsed tokens.
    pub fn load_reply(&mut self, bytes: &[u8]) -> Result<(), PubnubError> {
        self.reply.ensure_capacity(bytes.len())?;
        self.reset_reply();
        self.reply.extend_from_slice(bytes)?;
        self.content_len = bytes.len();
        Ok(())
    }

    pub fn reset_reply(&mut self) {
        self.reply.clear();
        self.content_len = 0;
        self.messages = TokenCursor::EMPTY;
        self.channels = TokenCursor::EMPTY;
    }

    pub fn next_message(&mut self) -> Option<&str> {
        self.messages.next_token(self.reply.as_bytes())
    }

    pub fn next_channel(&mut self) -> Option<&str> {
        self.channels.next_token(self.reply.as_bytes())
    }

    pub fn message_cursor(&self) -> TokenCursor {
        self.messages
    }

    pub fn channel_cursor(&self) -> TokenCursor {
        self.channels
    }

    fn append_common_params(&self, request: &mut RequestBuffer) -> Result<(), PubnubError> {
        request.append_param("pnsdk", Some(PNSDK), Separator::First)?;
        request.append_param("uuid", self.uuid.as_deref(), Separator::Next)?;
        request.append_param("auth", self.auth.as_deref(), Separator::Next)
    }

    fn required_key<'a>(key: &'a Option<String>, name: &str) -> Result<&'a str, PubnubError> {
        key.as_deref().ok_or_else(|| PubnubError::config(format!("{name} key is not set")))
    }

    /// Formats the publish request target. Does no I/O.
    ///
    /// `store=false` is only sent when the message should stay out of
    /// history, `eat=true` only when it should be dropped once read.
    pub fn prepare_publish(
        &mut self,
        channel: &str,
        message: &str,
        store_in_history: bool,
        eat_after_reading: bool,
    ) -> Result<(), PubnubError> {
        let publish_key = Self::required_key(&self.publish_key, "publish")?;
        let subscribe_key = Self::required_key(&self.subscribe_key, "subscribe")?;
        if channel.is_empty() {
            return Err(PubnubError::invalid_argument("publish needs a channel"));
        }
        serde_json::from_str::<serde::de::IgnoredAny>(message).map_err(|err| {
            PubnubError::Encoding { what: "message", reason: format!("not valid JSON: {err}") }
        })?;

        let mut request = RequestBuffer::new(self.request.capacity());
        request.push_str("/publish")?;
        request.push_path_segment(publish_key)?;
        request.push_path_segment(subscribe_key)?;
        request.push_str("/0")?;
        request.push_path_segment(channel)?;
        request.push_str("/0")?;
        request.push_path_segment(message).map_err(|err| match err {
            PubnubError::BufferFull { needed, capacity } => PubnubError::Encoding {
                what: "message",
                reason: format!("encoded message needs {needed} bytes, buffer holds {capacity}"),
            },
            other => other,
        })?;
        self.append_common_params(&mut request)?;
        if !store_in_history {
            request.append_bool("store", false, Separator::Next)?;
        }
        if eat_after_reading {
            request.append_bool("eat", true, Separator::Next)?;
        }

        self.request = request;
        self.reset_reply();
        self.last_publish = None;
        Ok(())
    }

    /// Formats the subscribe request target. Does no I/O.
    ///
    /// At least one of `channel` and `channel_group` must be given. The current
    /// timetoken is always sent as `tt`.
    pub fn prepare_subscribe(
        &mut self,
        channel: Option<&str>,
        channel_group: Option<&str>,
        heartbeat: Option<u32>,
    ) -> Result<(), PubnubError> {
        let subscribe_key = Self::required_key(&self.subscribe_key, "subscribe")?;
        let channel = match (channel, channel_group) {
            (None, None) => {
                return Err(PubnubError::invalid_argument(
                    "subscribe needs a channel or a channel group",
                ));
            }
            (Some(""), _) | (_, Some("")) => {
                return Err(PubnubError::invalid_argument("channel names must not be empty"));
            }
            (Some(channel), _) => channel,
            (None, Some(_)) => ",",
        };

        let mut request = RequestBuffer::new(self.request.capacity());
        request.push_str("/subscribe")?;
        request.push_path_segment(subscribe_key)?;
        request.push_path_segment(channel)?;
        request.push_str("/0")?;
        self.append_common_params(&mut request)?;
        request.append_param("channel-group", channel_group, Separator::Next)?;
        request.append_opt_unsigned("heartbeat", heartbeat.map(u64::from), Separator::Next)?;
        request.append_param("tt", Some(self.timetoken.as_str()), Separator::Next)?;

        self.request = request;
        self.reset_reply();
        Ok(())
    }

    /// Parses the buffered subscribe reply and points the cursors at it.
    ///
    /// On error the timetoken, cursors and buffer are left untouched.
    pub fn parse_subscribe_response(&mut self) -> Result<(), PubnubError> {
        let plan = parse::plan_subscribe(self.reply.as_bytes(), TIMETOKEN_CAPACITY)?;
        let mut timetoken = Timetoken::new();
        timetoken
            .push_str(plan.timetoken(self.reply.as_bytes()))
            .map_err(|()| PubnubError::invalid_response("timetoken length out of range"))?;

        let (messages, channels) = plan.apply(self.reply.as_mut_bytes());
        self.timetoken = timetoken;
        self.messages = messages;
        self.channels = channels;
        self.last_publish = None;
        log::debug!(
            "context: subscribe reply with {} message(s), timetoken {}",
            plan.message_count(),
            self.timetoken
        );
        Ok(())
    }

    /// Parses the buffered publish reply.
    ///
    /// A well-formed rejection is returned as [`PubnubError::PublishFailed`];
    /// its details stay available through [`Context::last_publish`] and the
    /// raw reply elements through [`Context::next_message`].
    pub fn parse_publish_response(&mut self) -> Result<(), PubnubError> {
        let plan = parse::plan_publish(self.reply.as_bytes())?;
        self.messages = match &plan.layout {
            Some(layout) => {
                layout.apply(self.reply.as_mut_bytes());
                layout.cursor()
            }
            None => TokenCursor::EMPTY,
        };
        self.channels = TokenCursor::EMPTY;

        let response = plan.response;
        let outcome = if response.is_success() {
            Ok(())
        } else {
            log::debug!(
                "context: publish rejected with status {}: {}",
                response.status,
                response.description
            );
            Err(PubnubError::PublishFailed { description: response.description.clone() })
        };
        self.last_publish = Some(response);
        outcome
    }

    pub fn parse_response(&mut self, kind: TransactionKind) -> Result<(), PubnubError> {
        match kind {
            TransactionKind::Publish => self.parse_publish_response(),
            TransactionKind::Subscribe => self.parse_subscribe_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Context {
        let mut config = ContextConfig::with_keys("pub-key", "sub-key");
        config.request_capacity = 512;
        config.reply_capacity = 1024;
        Context::new(&config)
    }

    fn drain_messages(ctx: &mut Context) -> Vec<String> {
        std::iter::from_fn(|| ctx.next_message().map(str::to_owned)).collect()
    }

    fn drain_channels(ctx: &mut Context) -> Vec<String> {
        std::iter::from_fn(|| ctx.next_channel().map(str::to_owned)).collect()
    }

    #[test]
    fn subscribe_reply_without_channels_yields_messages_verbatim() {
        let mut ctx = context();
        ctx.load_reply(br#"[["one",{"n":[1,2]},"three, four"],"15232600000000001"]"#)
            .expect("fits");
        ctx.parse_subscribe_response().expect("valid reply");

        assert_eq!(
            drain_messages(&mut ctx),
            vec![r#""one""#, r#"{"n":[1,2]}"#, r#""three, four""#]
        );
        assert_eq!(ctx.next_message(), None);
        assert_eq!(ctx.next_channel(), None);
        assert_eq!(ctx.last_timetoken(), "15232600000000001");
    }

    #[test]
    fn subscribe_reply_with_channels_pairs_them_up() {
        let mut ctx = context();
        ctx.load_reply(br#"[[1,[2,3]],"77",["ch-a","ch-b"]]"#).expect("fits");
        ctx.parse_subscribe_response().expect("valid reply");
        assert_eq!(drain_messages(&mut ctx), vec!["1", "[2,3]"]);
        assert_eq!(drain_channels(&mut ctx), vec!["ch-a", "ch-b"]);
        assert_eq!(ctx.next_channel(), None);
    }

    #[test]
    fn channel_names_are_bare_for_array_and_joined_lists() {
        let mut ctx = context();
        ctx.load_reply(br#"[["m"],"1",["news"]]"#).expect("fits");
        ctx.parse_subscribe_response().expect("array channel list");
        let from_array = drain_channels(&mut ctx);

        ctx.load_reply(br#"[["m"],"2","news"]"#).expect("fits");
        ctx.parse_subscribe_response().expect("joined channel list");
        let from_joined = drain_channels(&mut ctx);

        assert_eq!(from_array, vec!["news"]);
        assert_eq!(from_array, from_joined);
    }

    #[test]
    fn timetoken_is_copied_byte_for_byte() {
        let mut ctx = context();
        ctx.load_reply(br#"[[], " 0012x "]"#).expect("fits");
        ctx.parse_subscribe_response().expect("valid reply");
        assert_eq!(ctx.last_timetoken(), " 0012x ");
        assert!(ctx.message_cursor().is_empty());
    }

    #[test]
    fn malformed_subscribe_reply_changes_nothing() {
        let mut ctx = context();
        ctx.load_reply(br#"[["a","b"],"100"]"#).expect("fits");
        ctx.parse_subscribe_response().expect("valid reply");
        assert_eq!(ctx.next_message(), Some(r#""a""#));
        let messages = ctx.message_cursor();
        let channels = ctx.channel_cursor();

        ctx.reply_mut().clear();
        ctx.reply_mut().extend_from_slice(br#"[[1,2],"10""#).expect("fits");
        let err = ctx.parse_subscribe_response().expect_err("missing bracket");
        assert!(matches!(err, PubnubError::InvalidResponse { .. }));
        assert_eq!(ctx.last_timetoken(), "100");
        assert_eq!(ctx.message_cursor(), messages);
        assert_eq!(ctx.channel_cursor(), channels);
        assert_eq!(ctx.reply().as_bytes(), br#"[[1,2],"10""#);
    }

    #[test]
    fn channel_count_mismatch_is_invalid() {
        let mut ctx = context();
        ctx.load_reply(br#"[["a","b"],"5",["only-one"]]"#).expect("fits");
        assert!(ctx.parse_subscribe_response().is_err());
        assert_eq!(ctx.last_timetoken(), "0");
    }

    #[test]
    fn publish_success_exposes_timetoken() {
        let mut ctx = context();
        ctx.load_reply(br#"[1,"Sent","15232600000000000"]"#).expect("fits");
        ctx.parse_publish_response().expect("success");
        let publish = ctx.last_publish().expect("parsed publish");
        assert!(publish.is_success());
        assert_eq!(publish.description, "Sent");
        assert_eq!(publish.timetoken.as_deref(), Some("15232600000000000"));
        assert_eq!(ctx.last_timetoken(), "0", "publish must not move the subscribe cursor");
        assert_eq!(ctx.next_message(), Some("1"));
    }

    #[test]
    fn publish_rejection_carries_description() {
        let mut ctx = context();
        ctx.load_reply(br#"[0,"Invalid Key"]"#).expect("fits");
        let err = ctx.parse_publish_response().expect_err("rejected");
        assert_eq!(err, PubnubError::PublishFailed { description: "Invalid Key".to_owned() });
        assert_eq!(ctx.last_publish().map(|p| p.status), Some(0));
    }

    #[test]
    fn prepare_publish_formats_path_and_flags() {
        let mut ctx = context();
        ctx.set_uuid(Some("client-1"));
        ctx.prepare_publish("news", r#"{"text":"hi there"}"#, true, false).expect("fits");
        assert_eq!(
            ctx.request_target(),
            format!(
                "/publish/pub-key/sub-key/0/news/0/%7B%22text%22%3A%22hi%20there%22%7D\
                 ?pnsdk={}&uuid=client-1",
                PNSDK.replace('/', "%2F")
            )
        );

        ctx.prepare_publish("news", "42", false, true).expect("fits");
        assert!(ctx.request_target().ends_with("&uuid=client-1&store=false&eat=true"));
    }

    #[test]
    fn prepare_publish_rejects_bad_input() {
        let mut ctx = context();
        let err = ctx.prepare_publish("news", "{not json", true, false).expect_err("bad json");
        assert!(matches!(err, PubnubError::Encoding { .. }));

        let huge = format!("\"{}\"", "x".repeat(600));
        let err = ctx.prepare_publish("news", &huge, true, false).expect_err("too big");
        assert!(matches!(err, PubnubError::Encoding { .. }));
        assert!(ctx.request_target().is_empty(), "failed prepare must not leave a request");

        ctx.set_keys(None, Some("sub-key"));
        let err = ctx.prepare_publish("news", "1", true, false).expect_err("no publish key");
        assert!(matches!(err, PubnubError::Config { .. }));
    }

    #[test]
    fn prepare_subscribe_sends_timetoken_and_optional_params() {
        let mut ctx = context();
        ctx.set_auth(Some("secret"));
        ctx.prepare_subscribe(Some("a,b"), None, None).expect("fits");
        assert!(ctx.request_target().starts_with("/subscribe/sub-key/a,b/0?pnsdk="));
        assert!(ctx.request_target().ends_with("&auth=secret&tt=0"));

        ctx.set_last_timetoken("15000").expect("valid timetoken");
        ctx.prepare_subscribe(None, Some("group"), Some(300)).expect("fits");
        assert!(ctx.request_target().starts_with("/subscribe/sub-key/,/0?"));
        assert!(ctx.request_target().ends_with("&channel-group=group&heartbeat=300&tt=15000"));

        let err = ctx.prepare_subscribe(None, None, None).expect_err("needs a channel");
        assert!(matches!(err, PubnubError::InvalidArgument { .. }));
    }

    #[test]
    fn transaction_result_is_written_once() {
        let mut ctx = context();
        assert_eq!(ctx.last_result(), TransactionResult::Idle);
        ctx.begin_transaction().expect("idle context");
        assert!(ctx.begin_transaction().is_err());
        assert!(ctx.finish_transaction(TransactionResult::Timeout));
        assert!(!ctx.finish_transaction(TransactionResult::Ok));
        assert_eq!(ctx.last_result(), TransactionResult::Timeout);
        ctx.begin_transaction().expect("finished context can start again");
    }
}
