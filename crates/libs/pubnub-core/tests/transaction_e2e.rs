#![cfg(unix)]

use pubnub_core::{
    Client, ContextConfig, EngineConfig, MioPoller, NotificationEngine, TcpTransport,
    TransactionKind, TransactionResult,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn engine() -> Arc<NotificationEngine<MioPoller>> {
    let poller = MioPoller::new().expect("create poller");
    let engine = NotificationEngine::new(poller, EngineConfig::default()).expect("engine");
    engine.start().expect("start engine");
    Arc::new(engine)
}

fn config(port: u16) -> ContextConfig {
    let mut config = ContextConfig::with_keys("demo-pub", "demo-sub");
    config.origin = "127.0.0.1".to_owned();
    config.port = port;
    config.uuid = Some("e2e-client".to_owned());
    config
}

fn read_request(stream: &mut TcpStream) -> String {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut buf).expect("read request");
        assert!(read > 0, "client closed before sending a full request");
        request.extend_from_slice(&buf[..read]);
    }
    String::from_utf8(request).expect("ascii request")
}

/// Accepts one connection, records the request line and writes `reply`.
fn serve_once(reply: Vec<u8>) -> (u16, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let request = read_request(&mut stream);
        stream.write_all(&reply).expect("write reply");
        request.lines().next().unwrap_or_default().to_owned()
    });
    (port, handle)
}

/// Accepts one connection and keeps it open without answering until told to.
fn serve_silently() -> (u16, mpsc::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = read_request(&mut stream);
        let _ = release_rx.recv_timeout(WAIT);
    });
    (port, release_tx, handle)
}

fn sized(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/javascript\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

#[test]
fn subscribe_over_tcp_yields_messages_channels_and_timetoken() {
    init_logging();
    let (port, server) =
        serve_once(sized(r#"[["first",{"text":"a, b"}],"15232600000000042","news,sports"]"#));
    let client =
        Client::new(&config(port), TcpTransport::new(), engine()).expect("create client");

    client.subscribe("news,sports").expect("start subscribe");
    assert_eq!(client.await_result(WAIT), TransactionResult::Ok);

    let request_line = server.join().expect("server thread");
    assert!(
        request_line.starts_with("GET /subscribe/demo-sub/news,sports/0?pnsdk=pubnub-core-rust"),
        "{request_line}"
    );
    assert!(request_line.ends_with("&uuid=e2e-client&tt=0 HTTP/1.1"), "{request_line}");

    assert_eq!(client.next_message().as_deref(), Some(r#""first""#));
    assert_eq!(client.next_message().as_deref(), Some(r#"{"text":"a, b"}"#));
    assert_eq!(client.next_message(), None);
    assert_eq!(client.next_channel().as_deref(), Some("news"));
    assert_eq!(client.next_channel().as_deref(), Some("sports"));
    assert_eq!(client.next_channel(), None);
    assert_eq!(client.last_timetoken(), "15232600000000042");
}

#[test]
fn publish_over_tcp_with_chunked_reply() {
    init_logging();
    let reply = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  8\r\n[1,\"Sent\r\n16\r\n\",\"15232600000000000\"]\r\n0\r\n\r\n"
        .to_vec();
    let (port, server) = serve_once(reply);
    let client =
        Client::new(&config(port), TcpTransport::new(), engine()).expect("create client");

    let completions = Arc::new(Mutex::new(Vec::new()));
    {
        let completions = Arc::clone(&completions);
        client.set_callback(Some(Arc::new(move |kind, result| {
            completions.lock().expect("completions mutex").push((kind, result));
        })));
    }

    client.publish("news", r#"{"text":"hello world"}"#).expect("start publish");
    assert_eq!(client.await_result(WAIT), TransactionResult::Ok);

    let request_line = server.join().expect("server thread");
    assert!(
        request_line.starts_with(
            "GET /publish/demo-pub/demo-sub/0/news/0/%7B%22text%22%3A%22hello%20world%22%7D?"
        ),
        "{request_line}"
    );
    let publish = client.last_publish().expect("publish reply");
    assert_eq!(publish.timetoken.as_deref(), Some("15232600000000000"));
    assert_eq!(
        *completions.lock().expect("completions mutex"),
        vec![(TransactionKind::Publish, TransactionResult::Ok)]
    );
}

#[test]
fn rejected_publish_surfaces_publish_failed() {
    init_logging();
    let body = r#"{"status":403,"error":true,"message":"Forbidden","service":"Access Manager"}"#;
    let reply = format!(
        "HTTP/1.1 403 Forbidden\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let (port, server) = serve_once(reply.into_bytes());
    let client =
        Client::new(&config(port), TcpTransport::new(), engine()).expect("create client");

    client.publish("news", "42").expect("start publish");
    assert_eq!(client.await_result(WAIT), TransactionResult::PublishFailed);
    server.join().expect("server thread");
    assert_eq!(client.last_publish().map(|p| p.description).as_deref(), Some("Forbidden"));
}

#[test]
fn silent_server_times_out() {
    init_logging();
    let (port, release, server) = serve_silently();
    let mut config = config(port);
    config.transaction_timeout_ms = 300;
    let engine = engine();
    let client = Client::new(&config, TcpTransport::new(), Arc::clone(&engine)).expect("client");

    client.subscribe("news").expect("start subscribe");
    assert_eq!(client.await_result(WAIT), TransactionResult::Timeout);
    assert_eq!(engine.watched_len(), 0);
    assert_eq!(client.last_timetoken(), "0");

    let _ = release.send(());
    server.join().expect("server thread");
}

#[test]
fn cancel_stops_an_in_flight_subscribe() {
    init_logging();
    let (port, release, server) = serve_silently();
    let engine = engine();
    let client =
        Client::new(&config(port), TcpTransport::new(), Arc::clone(&engine)).expect("client");

    client.subscribe("news").expect("start subscribe");
    assert_eq!(client.last_result(), TransactionResult::Started);
    client.cancel();
    assert_eq!(client.await_result(WAIT), TransactionResult::Cancelled);
    assert_eq!((engine.watched_len(), engine.timer_len(), engine.queued_len()), (0, 0, 0));

    let _ = release.send(());
    server.join().expect("server thread");
}
