//! Per-handle transaction driver tying a [`Context`], a [`Transport`] and the
//! notification engine together.

use crate::config::ContextConfig;
use crate::context::{Context, TransactionKind};
use crate::error::{PubnubError, TransactionResult};
use crate::http::{self, ReadProgress, ReplyReader};
use crate::ntf::{ContextId, Interest, Notification, NotificationEngine, Poller, SocketOf, Watched};
use crate::parse::PublishResponse;
use crate::transport::Transport;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

const RECV_CHUNK: usize = 4096;

/// Invoked once per finished transaction, outside every client lock.
pub type CompletionCallback = Arc<dyn Fn(TransactionKind, TransactionResult) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishOptions {
    pub store_in_history: bool,
    pub eat_after_reading: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { store_in_history: true, eat_after_reading: false }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub channel_group: Option<String>,
    pub heartbeat: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Sending,
    Receiving,
}

struct ClientState<T> {
    context: Context,
    transport: T,
    phase: Phase,
    kind: TransactionKind,
    outbound: Vec<u8>,
    sent: usize,
    reader: ReplyReader,
}

type Completion = (TransactionKind, TransactionResult);

struct ClientInner<T: Transport, P: Poller> {
    id: ContextId,
    origin: String,
    port: u16,
    timeout: Duration,
    engine: Arc<NotificationEngine<P>>,
    state: Mutex<ClientState<T>>,
    done: Condvar,
    callback: Mutex<Option<CompletionCallback>>,
}

impl<T, P> ClientInner<T, P>
where
    T: Transport<Socket = SocketOf<P>>,
    P: Poller,
{
    fn lock_state(&self) -> MutexGuard<'_, ClientState<T>> {
        self.state.lock().expect("client state mutex poisoned")
    }

    fn host_header(&self) -> String {
        if self.port == 80 {
            self.origin.clone()
        } else {
            format!("{}:{}", self.origin, self.port)
        }
    }

    fn run_callback(&self, completion: Option<Completion>) {
        let Some((kind, result)) = completion else {
            return;
        };
        let callback = self.callback.lock().expect("client callback mutex poisoned").clone();
        if let Some(callback) = callback {
            callback(kind, result);
        }
    }

    /// Records the outcome and wakes waiters. The caller makes sure the
    /// engine no longer watches this context.
    fn settle(
        &self,
        state: &mut ClientState<T>,
        outcome: Result<(), PubnubError>,
    ) -> Option<Completion> {
        state.transport.close();
        state.phase = Phase::Idle;
        let result = match &outcome {
            Ok(()) => TransactionResult::Ok,
            Err(err) => TransactionResult::from(err),
        };
        if !state.context.finish_transaction(result) {
            return None;
        }
        match &outcome {
            Ok(()) => log::debug!("client({}): {} finished", self.id, state.kind.as_str()),
            Err(err) => log::debug!("client({}): {} failed: {err}", self.id, state.kind.as_str()),
        }
        self.done.notify_all();
        Some((state.kind, result))
    }

    fn complete(
        &self,
        state: &mut ClientState<T>,
        outcome: Result<(), PubnubError>,
    ) -> Option<Completion> {
        self.engine.unregister_socket(self.id);
        self.settle(state, outcome)
    }

    fn drive(&self, state: &mut ClientState<T>) -> Option<Completion> {
        if state.phase == Phase::Sending {
            while state.sent < state.outbound.len() {
                match state.transport.send(&state.outbound[state.sent..]) {
                    Ok(0) => {
                        let err = io::Error::from(io::ErrorKind::WriteZero);
                        return self.complete(state, Err(err.into()));
                    }
                    Ok(sent) => state.sent += sent,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return self.complete(state, Err(err.into())),
                }
            }
            state.phase = Phase::Receiving;
            let Some(socket) = state.transport.socket() else {
                let err = io::Error::from(io::ErrorKind::NotConnected);
                return self.complete(state, Err(err.into()));
            };
            if let Err(err) = self.engine.update_socket(self.id, socket, Interest::Read) {
                return self.complete(state, Err(err));
            }
        }

        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            let progress = match state.transport.recv_into(&mut chunk) {
                Ok(0) => state.reader.finish_on_close().map(|()| ReadProgress::Complete),
                Ok(read) => state.reader.feed(&chunk[..read], state.context.reply_mut()),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => Err(err.into()),
            };
            match progress {
                Ok(ReadProgress::NeedMore) => {}
                Ok(ReadProgress::Complete) => {
                    state.context.set_content_len(state.reader.content_len());
                    let outcome = state.context.parse_response(state.kind);
                    return self.complete(state, outcome);
                }
                Err(err) => return self.complete(state, Err(err)),
            }
        }
    }
}

impl<T, P> Watched for ClientInner<T, P>
where
    T: Transport<Socket = SocketOf<P>>,
    P: Poller,
{
    fn context_id(&self) -> ContextId {
        self.id
    }

    fn transaction_timeout(&self) -> Duration {
        self.timeout
    }

    fn notify(&self, notification: Notification) {
        let completion = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if state.phase == Phase::Idle {
                return;
            }
            match notification {
                Notification::Timeout => {
                    let err = PubnubError::Io {
                        kind: io::ErrorKind::TimedOut,
                        message: format!("no reply within {:?}", self.timeout),
                    };
                    self.complete(state, Err(err))
                }
                Notification::Process | Notification::Writable | Notification::Readable => {
                    self.drive(state)
                }
            }
        };
        self.run_callback(completion);
    }
}

/// One client handle; at most one transaction in flight.
///
/// Dropping the handle cancels whatever is in flight.
pub struct Client<T, P>
where
    T: Transport<Socket = SocketOf<P>>,
    P: Poller,
{
    inner: Arc<ClientInner<T, P>>,
}

impl<T, P> Client<T, P>
where
    T: Transport<Socket = SocketOf<P>>,
    P: Poller,
{
    pub fn new(
        config: &ContextConfig,
        transport: T,
        engine: Arc<NotificationEngine<P>>,
    ) -> Result<Self, PubnubError> {
        config.validate()?;
        let state = ClientState {
            context: Context::new(config),
            transport,
            phase: Phase::Idle,
            kind: TransactionKind::Subscribe,
            outbound: Vec::new(),
            sent: 0,
            reader: ReplyReader::new(),
        };
        Ok(Self {
            inner: Arc::new(ClientInner {
                id: ContextId::next(),
                origin: config.origin.clone(),
                port: config.port,
                timeout: config.transaction_timeout(),
                engine,
                state: Mutex::new(state),
                done: Condvar::new(),
                callback: Mutex::new(None),
            }),
        })
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn set_callback(&self, callback: Option<CompletionCallback>) {
        *self.inner.callback.lock().expect("client callback mutex poisoned") = callback;
    }

    pub fn publish(&self, channel: &str, message: &str) -> Result<(), PubnubError> {
        self.publish_with(channel, message, PublishOptions::default())
    }

    pub fn publish_with(
        &self,
        channel: &str,
        message: &str,
        options: PublishOptions,
    ) -> Result<(), PubnubError> {
        self.begin(TransactionKind::Publish, |context| {
            context.prepare_publish(
                channel,
                message,
                options.store_in_history,
                options.eat_after_reading,
            )
        })
    }

    pub fn subscribe(&self, channel: &str) -> Result<(), PubnubError> {
        self.subscribe_with(Some(channel), &SubscribeOptions::default())
    }

    pub fn subscribe_with(
        &self,
        channel: Option<&str>,
        options: &SubscribeOptions,
    ) -> Result<(), PubnubError> {
        self.begin(TransactionKind::Subscribe, |context| {
            context.prepare_subscribe(channel, options.channel_group.as_deref(), options.heartbeat)
        })
    }

    /// Formats the request, connects and hands the socket to the engine.
    ///
    /// Failures before the engine takes over finish the transaction on the
    /// spot and are also returned to the caller.
    fn begin(
        &self,
        kind: TransactionKind,
        prepare: impl FnOnce(&mut Context) -> Result<(), PubnubError>,
    ) -> Result<(), PubnubError> {
        let inner = &self.inner;
        let (result, completion) = {
            let mut guard = inner.lock_state();
            let state = &mut *guard;
            state.context.begin_transaction()?;
            state.kind = kind;
            match self.connect(state, prepare) {
                Ok(socket) => {
                    let target: Arc<dyn Watched> = Arc::clone(inner) as Arc<dyn Watched>;
                    match inner.engine.register_socket(target, socket, Interest::Write) {
                        Ok(()) => {
                            log::debug!("client({}): {} started", inner.id, kind.as_str());
                            (Ok(()), None)
                        }
                        Err(err) => (Err(err.clone()), inner.settle(state, Err(err))),
                    }
                }
                Err(err) => (Err(err.clone()), inner.settle(state, Err(err))),
            }
        };
        inner.run_callback(completion);
        result
    }

    fn connect(
        &self,
        state: &mut ClientState<T>,
        prepare: impl FnOnce(&mut Context) -> Result<(), PubnubError>,
    ) -> Result<T::Socket, PubnubError> {
        prepare(&mut state.context)?;
        state.outbound =
            http::build_get_request(state.context.request_target(), &self.inner.host_header());
        state.sent = 0;
        state.reader = ReplyReader::new();
        state.transport.set_blocking(false);
        let socket = state.transport.connect(&self.inner.origin, self.inner.port)?;
        state.phase = Phase::Sending;
        Ok(socket)
    }

    /// Abandons the transaction in flight, if any, with
    /// [`TransactionResult::Cancelled`].
    pub fn cancel(&self) {
        let inner = &self.inner;
        inner.engine.unregister_socket(inner.id);
        let completion = {
            let mut guard = inner.lock_state();
            let state = &mut *guard;
            if state.phase == Phase::Idle {
                None
            } else {
                inner.settle(state, Err(PubnubError::Cancelled))
            }
        };
        inner.run_callback(completion);
    }

    /// Blocks until the transaction in flight finishes or `timeout` passes,
    /// then returns the current result.
    pub fn await_result(&self, timeout: Duration) -> TransactionResult {
        let guard = self.inner.lock_state();
        let (guard, _) = self
            .inner
            .done
            .wait_timeout_while(guard, timeout, |state| {
                state.context.last_result() == TransactionResult::Started
            })
            .expect("client state mutex poisoned");
        guard.context.last_result()
    }

    pub fn last_result(&self) -> TransactionResult {
        self.inner.lock_state().context.last_result()
    }

    pub fn last_timetoken(&self) -> String {
        self.inner.lock_state().context.last_timetoken().to_owned()
    }

    pub fn last_publish(&self) -> Option<PublishResponse> {
        self.inner.lock_state().context.last_publish().cloned()
    }

    pub fn next_message(&self) -> Option<String> {
        self.inner.lock_state().context.next_message().map(str::to_owned)
    }

    pub fn next_channel(&self) -> Option<String> {
        self.inner.lock_state().context.next_channel().map(str::to_owned)
    }

    pub fn set_uuid(&self, uuid: Option<&str>) {
        self.inner.lock_state().context.set_uuid(uuid);
    }

    pub fn set_auth(&self, auth: Option<&str>) {
        self.inner.lock_state().context.set_auth(auth);
    }

    /// Runs `f` on the protocol context. Do not call back into this client
    /// from inside `f`.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Context) -> R) -> R {
        f(&mut self.inner.lock_state().context)
    }
}

impl<T, P> Drop for Client<T, P>
where
    T: Transport<Socket = SocketOf<P>>,
    P: Poller,
{
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(unix)]
impl Client<crate::transport::TcpTransport, crate::ntf::MioPoller> {
    /// A TCP client on the process-wide notification engine.
    pub fn with_shared_engine(config: &ContextConfig) -> Result<Self, PubnubError> {
        let engine = NotificationEngine::shared()?;
        Self::new(config, crate::transport::TcpTransport::new(), engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ntf::{Readiness, SocketRegistry};
    use std::collections::VecDeque;

    /// Scripted transport: every `recv_into` pops the next step.
    #[derive(Default)]
    struct Script {
        sent: Vec<u8>,
        replies: VecDeque<io::Result<Vec<u8>>>,
        connect_error: Option<io::ErrorKind>,
    }

    struct ScriptedTransport {
        script: Arc<Mutex<Script>>,
        connected: bool,
    }

    impl Transport for ScriptedTransport {
        type Socket = u32;

        fn set_blocking(&mut self, _blocking: bool) {}

        fn connect(&mut self, _host: &str, _port: u16) -> Result<u32, PubnubError> {
            if let Some(kind) = self.script.lock().expect("script mutex").connect_error {
                return Err(io::Error::from(kind).into());
            }
            self.connected = true;
            Ok(1)
        }

        fn socket(&self) -> Option<u32> {
            self.connected.then_some(1)
        }

        fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
            self.script.lock().expect("script mutex").sent.extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn recv_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut script = self.script.lock().expect("script mutex");
            match script.replies.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(err)) => Err(err),
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }

        fn close(&mut self) {
            self.connected = false;
        }
    }

    struct NullPoller;
    struct NullRegistry;

    impl SocketRegistry for NullRegistry {
        type Socket = u32;

        fn register(&self, _: u32, _: ContextId, _: Interest) -> io::Result<()> {
            Ok(())
        }

        fn reregister(&self, _: u32, _: ContextId, _: Interest) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&self, _: u32) -> io::Result<()> {
            Ok(())
        }
    }

    impl Poller for NullPoller {
        type Registry = NullRegistry;

        fn registry(&self) -> io::Result<NullRegistry> {
            Ok(NullRegistry)
        }

        fn poll(&mut self, _: &mut Vec<Readiness>, timeout: Duration) -> io::Result<()> {
            std::thread::sleep(timeout);
            Ok(())
        }
    }

    type TestClient = Client<ScriptedTransport, NullPoller>;

    fn client(script: &Arc<Mutex<Script>>) -> (TestClient, Arc<NotificationEngine<NullPoller>>) {
        let engine = Arc::new(
            NotificationEngine::new(NullPoller, EngineConfig::default()).expect("engine"),
        );
        let mut config = ContextConfig::with_keys("pub-key", "sub-key");
        config.uuid = Some("tester".to_owned());
        let transport = ScriptedTransport { script: Arc::clone(script), connected: false };
        let client = Client::new(&config, transport, Arc::clone(&engine)).expect("client");
        (client, engine)
    }

    fn reply(script: &Arc<Mutex<Script>>, body: &str) {
        let raw = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len());
        script.lock().expect("script mutex").replies.push_back(Ok(raw.into_bytes()));
    }

    #[test]
    fn subscribe_runs_to_completion_through_the_queue() {
        let script = Arc::new(Mutex::new(Script::default()));
        let (client, engine) = client(&script);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            client.set_callback(Some(Arc::new(move |kind, result| {
                seen.lock().expect("seen mutex").push((kind, result));
            })));
        }

        client.subscribe("news").expect("start subscribe");
        assert_eq!(client.last_result(), TransactionResult::Started);
        assert!(engine.is_watched(client.id()));
        assert!(client.subscribe("news").is_err(), "one transaction at a time");

        engine.enqueue(Arc::clone(&client.inner) as Arc<dyn Watched>, Notification::Writable);
        engine.process_queue();
        let sent = String::from_utf8(script.lock().expect("script mutex").sent.clone())
            .expect("ascii request");
        assert!(sent.starts_with("GET /subscribe/sub-key/news/0?pnsdk="), "{sent}");
        assert!(sent.contains("&uuid=tester&tt=0 HTTP/1.1\r\n"), "{sent}");
        assert_eq!(client.last_result(), TransactionResult::Started);

        reply(&script, r#"[["hello",{"n":1}],"15000000000000001"]"#);
        engine.enqueue(Arc::clone(&client.inner) as Arc<dyn Watched>, Notification::Readable);
        engine.process_queue();

        assert_eq!(client.await_result(Duration::from_secs(1)), TransactionResult::Ok);
        assert_eq!(client.next_message().as_deref(), Some(r#""hello""#));
        assert_eq!(client.next_message().as_deref(), Some(r#"{"n":1}"#));
        assert_eq!(client.next_message(), None);
        assert_eq!(client.last_timetoken(), "15000000000000001");
        assert_eq!(engine.watched_len(), 0);
        assert_eq!(
            *seen.lock().expect("seen mutex"),
            vec![(TransactionKind::Subscribe, TransactionResult::Ok)]
        );
    }

    #[test]
    fn timeout_notification_finishes_with_timeout() {
        let script = Arc::new(Mutex::new(Script::default()));
        let (client, engine) = client(&script);
        client.publish("news", "\"hi\"").expect("start publish");
        assert_eq!(engine.age_timers(Duration::from_secs(400)), 1);
        engine.process_queue();
        assert_eq!(client.last_result(), TransactionResult::Timeout);
        assert_eq!(engine.timer_len(), 0);
    }

    #[test]
    fn rejected_publish_reports_publish_failed() {
        let script = Arc::new(Mutex::new(Script::default()));
        let (client, engine) = client(&script);
        reply(&script, r#"[0,"Invalid Key"]"#);
        client.publish("news", "1").expect("start publish");
        engine.enqueue(Arc::clone(&client.inner) as Arc<dyn Watched>, Notification::Writable);
        engine.process_queue();
        assert_eq!(client.last_result(), TransactionResult::PublishFailed);
        assert_eq!(client.last_publish().map(|p| p.description), Some("Invalid Key".to_owned()));
    }

    #[test]
    fn early_failures_finish_synchronously() {
        let script = Arc::new(Mutex::new(Script::default()));
        let (client, engine) = client(&script);
        let err = client.publish("news", "{broken").expect_err("bad message");
        assert!(matches!(err, PubnubError::Encoding { .. }));
        assert_eq!(client.last_result(), TransactionResult::FormatFailed);

        script.lock().expect("script mutex").connect_error = Some(io::ErrorKind::ConnectionRefused);
        assert!(client.subscribe("news").is_err());
        assert_eq!(client.last_result(), TransactionResult::IoError);
        assert_eq!(engine.watched_len(), 0);
    }

    #[test]
    fn cancel_is_final_and_idempotent() {
        let script = Arc::new(Mutex::new(Script::default()));
        let (client, engine) = client(&script);
        client.subscribe("news").expect("start subscribe");
        client.cancel();
        client.cancel();
        assert_eq!(client.last_result(), TransactionResult::Cancelled);
        assert_eq!((engine.watched_len(), engine.timer_len()), (0, 0));
    }
}
