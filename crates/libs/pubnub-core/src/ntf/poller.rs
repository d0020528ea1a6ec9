//! Socket readiness seam and its `mio` implementation.

use super::ContextId;
use std::fmt;
use std::io;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

/// One readiness report, tagged with the context the socket was registered for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub id: ContextId,
    pub readable: bool,
    pub writable: bool,
    /// Error or hang-up; the owner finds out what happened on its next read.
    pub failed: bool,
}

/// Handle used to change the watched set while another thread polls.
pub trait SocketRegistry: Send {
    type Socket: Copy + Send + fmt::Debug + 'static;

    fn register(&self, socket: Self::Socket, id: ContextId, interest: Interest) -> io::Result<()>;

    fn reregister(&self, socket: Self::Socket, id: ContextId, interest: Interest)
        -> io::Result<()>;

    fn deregister(&self, socket: Self::Socket) -> io::Result<()>;
}

/// OS readiness primitive, owned by the notification thread.
pub trait Poller: Send + 'static {
    type Registry: SocketRegistry;

    fn registry(&self) -> io::Result<Self::Registry>;

    /// Waits up to `timeout` and appends what became ready. An interrupted
    /// wait reports nothing instead of failing.
    fn poll(&mut self, ready: &mut Vec<Readiness>, timeout: Duration) -> io::Result<()>;
}

pub type SocketOf<P> = <<P as Poller>::Registry as SocketRegistry>::Socket;

#[cfg(unix)]
pub use self::mio_impl::{MioPoller, MioRegistry};

#[cfg(unix)]
mod mio_impl {
    use super::{ContextId, Interest, Poller, Readiness, SocketRegistry};
    use mio::unix::SourceFd;
    use mio::{Events, Poll, Registry, Token};
    use std::io;
    use std::os::unix::io::RawFd;
    use std::time::Duration;

    const EVENT_CAPACITY: usize = 256;

    fn mio_interest(interest: Interest) -> mio::Interest {
        match interest {
            Interest::Read => mio::Interest::READABLE,
            Interest::Write => mio::Interest::WRITABLE,
            Interest::ReadWrite => mio::Interest::READABLE.add(mio::Interest::WRITABLE),
        }
    }

    pub struct MioPoller {
        poll: Poll,
        events: Events,
    }

    impl MioPoller {
        pub fn new() -> io::Result<Self> {
            Ok(Self { poll: Poll::new()?, events: Events::with_capacity(EVENT_CAPACITY) })
        }
    }

    pub struct MioRegistry(Registry);

    impl SocketRegistry for MioRegistry {
        type Socket = RawFd;

        fn register(&self, socket: RawFd, id: ContextId, interest: Interest) -> io::Result<()> {
            self.0.register(&mut SourceFd(&socket), Token(id.as_usize()), mio_interest(interest))
        }

        fn reregister(&self, socket: RawFd, id: ContextId, interest: Interest) -> io::Result<()> {
            self.0.reregister(&mut SourceFd(&socket), Token(id.as_usize()), mio_interest(interest))
        }

        fn deregister(&self, socket: RawFd) -> io::Result<()> {
            self.0.deregister(&mut SourceFd(&socket))
        }
    }

    impl Poller for MioPoller {
        type Registry = MioRegistry;

        fn registry(&self) -> io::Result<MioRegistry> {
            Ok(MioRegistry(self.poll.registry().try_clone()?))
        }

        fn poll(&mut self, ready: &mut Vec<Readiness>, timeout: Duration) -> io::Result<()> {
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(err) => return Err(err),
            }
            ready.extend(self.events.iter().map(|event| Readiness {
                id: ContextId::from_raw(event.token().0),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
                failed: event.is_error(),
            }));
            Ok(())
        }
    }

}
