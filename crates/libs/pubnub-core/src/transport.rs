//! Byte-stream transport used by [`crate::client::Client`].

use crate::error::PubnubError;
use std::fmt;
use std::io;

/// A connection the client can drive without blocking.
///
/// `send` and `recv_into` report [`io::ErrorKind::WouldBlock`] when the socket
/// is not ready; `recv_into` returning `Ok(0)` means the peer closed.
pub trait Transport: Send + 'static {
    type Socket: Copy + Send + fmt::Debug + 'static;

    /// Takes effect on the next `connect`.
    fn set_blocking(&mut self, blocking: bool);

    fn connect(&mut self, host: &str, port: u16) -> Result<Self::Socket, PubnubError>;

    fn socket(&self) -> Option<Self::Socket>;

    fn send(&mut self, bytes: &[u8]) -> io::Result<usize>;

    fn recv_into(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&mut self);
}

#[cfg(unix)]
pub use self::tcp::TcpTransport;

#[cfg(unix)]
mod tcp {
    use super::Transport;
    use crate::error::PubnubError;
    use std::io::{self, Read, Write};
    use std::net::{Shutdown, TcpStream, ToSocketAddrs};
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::time::Duration;

    const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Plain TCP. Name resolution and the connect itself block the caller for
    /// at most the connect timeout; everything after that is non-blocking.
    #[derive(Debug)]
    pub struct TcpTransport {
        stream: Option<TcpStream>,
        blocking: bool,
        connect_timeout: Duration,
    }

    impl Default for TcpTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TcpTransport {
        pub fn new() -> Self {
            Self { stream: None, blocking: false, connect_timeout: DEFAULT_CONNECT_TIMEOUT }
        }

        pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
            self.connect_timeout = timeout;
            self
        }

        fn stream(&mut self) -> io::Result<&mut TcpStream> {
            self.stream.as_mut().ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
        }
    }

    impl Transport for TcpTransport {
        type Socket = RawFd;

        fn set_blocking(&mut self, blocking: bool) {
            self.blocking = blocking;
        }

        fn connect(&mut self, host: &str, port: u16) -> Result<RawFd, PubnubError> {
            self.close();
            let mut last_err = None;
            for addr in (host, port).to_socket_addrs()? {
                match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        stream.set_nonblocking(!self.blocking)?;
                        let fd = stream.as_raw_fd();
                        log::debug!("tcp: connected to {addr} (fd {fd})");
                        self.stream = Some(stream);
                        return Ok(fd);
                    }
                    Err(err) => {
                        log::debug!("tcp: connect to {addr} failed: {err}");
                        last_err = Some(err);
                    }
                }
            }
            Err(last_err
                .unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve"))
                })
                .into())
        }

        fn socket(&self) -> Option<RawFd> {
            self.stream.as_ref().map(AsRawFd::as_raw_fd)
        }

        fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
            self.stream()?.write(bytes)
        }

        fn recv_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.stream()?.read(buf)
        }

        fn close(&mut self) {
            if let Some(stream) = self.stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::net::TcpListener;

        #[test]
        fn connects_sends_and_sees_close() {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
            let port = listener.local_addr().expect("local addr").port();
            let mut transport = TcpTransport::new();
            transport.set_blocking(true);
            let fd = transport.connect("127.0.0.1", port).expect("connect");
            assert_eq!(transport.socket(), Some(fd));

            let (mut peer, _) = listener.accept().expect("accept");
            assert_eq!(transport.send(b"ping").expect("send"), 4);
            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).expect("peer read");
            assert_eq!(&buf, b"ping");

            drop(peer);
            assert_eq!(transport.recv_into(&mut buf).expect("recv"), 0);
            transport.close();
            assert_eq!(transport.socket(), None);
            assert!(transport.send(b"x").is_err());
        }

        #[test]
        fn non_blocking_recv_would_block() {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
            let port = listener.local_addr().expect("local addr").port();
            let mut transport = TcpTransport::new();
            transport.connect("127.0.0.1", port).expect("connect");
            let _peer = listener.accept().expect("accept");
            let mut buf = [0u8; 8];
            let err = transport.recv_into(&mut buf).expect_err("nothing to read");
            assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        }
    }
}
