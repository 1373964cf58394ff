use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{NetErrorCode, TransportError};

/// OS-level identity of a socket as registered with a [NetSelector]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SocketId(pub RawFd);

/// Readiness multiplexing in the style of `select()`: a fixed set of sockets is registered for
///  read and / or write readiness, and after each [NetSelector::wait] the readiness of every
///  socket can be queried. Readiness is level-triggered, i.e. a socket that still has unread data
///  is reported again on the next wait.
///
/// Connect completion is reported as write readiness.
pub trait NetSelector: Send {
    /// Replaces the registered sockets. An error here means the process ran out of resources
    ///  (e.g. file descriptors), which affects all sockets rather than a specific one.
    fn set_sockets(&mut self, read: &[SocketId], write: &[SocketId]) -> Result<(), TransportError>;

    /// Blocks until at least one registered socket is ready or the timeout expires. Returns false
    ///  on timeout.
    fn wait(&mut self, timeout: Duration) -> Result<bool, TransportError>;

    fn read_ready(&self, socket: SocketId) -> bool;
    fn write_ready(&self, socket: SocketId) -> bool;
}

#[derive(Default, Copy, Clone)]
struct Readiness {
    read: bool,
    write: bool,
}

pub struct MioSelector {
    poll: Poll,
    events: Events,
    interests: FxHashMap<RawFd, Interest>,
    ready: FxHashMap<RawFd, Readiness>,
}

impl MioSelector {
    pub fn new() -> anyhow::Result<MioSelector> {
        Ok(MioSelector {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            interests: FxHashMap::default(),
            ready: FxHashMap::default(),
        })
    }

    fn token(fd: RawFd) -> Token {
        Token(fd as usize)
    }
}

impl NetSelector for MioSelector {
    fn set_sockets(&mut self, read: &[SocketId], write: &[SocketId]) -> Result<(), TransportError> {
        for fd in self.interests.keys() {
            // sockets closed in the meantime are gone from the registry already
            let _ = self.poll.registry().deregister(&mut SourceFd(fd));
        }
        self.interests.clear();
        self.ready.clear();

        let mut interests: FxHashMap<RawFd, Interest> = FxHashMap::default();
        for socket in read {
            interests.insert(socket.0, Interest::READABLE);
        }
        for socket in write {
            interests.entry(socket.0)
                .and_modify(|i| *i = i.add(Interest::WRITABLE))
                .or_insert(Interest::WRITABLE);
        }

        for (fd, interest) in &interests {
            self.poll.registry()
                .register(&mut SourceFd(fd), Self::token(*fd), *interest)
                .map_err(|e| TransportError::new(NetErrorCode::Internal, format!("registering socket {} for polling failed: {}", fd, e)))?;
        }
        self.interests = interests;
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        // mio is edge-triggered: re-arming makes sockets that are still ready show up again
        for (fd, interest) in &self.interests {
            if let Err(e) = self.poll.registry().reregister(&mut SourceFd(fd), Self::token(*fd), *interest) {
                trace!("re-arming socket {} failed: {}", fd, e);
            }
        }

        self.ready.clear();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(TransportError::new(NetErrorCode::Internal, format!("polling failed: {}", e))),
        }

        for event in self.events.iter() {
            let readiness = self.ready.entry(event.token().0 as RawFd).or_default();
            readiness.read |= event.is_readable() || event.is_read_closed() || event.is_error();
            readiness.write |= event.is_writable() || event.is_write_closed() || event.is_error();
        }
        Ok(!self.ready.is_empty())
    }

    fn read_ready(&self, socket: SocketId) -> bool {
        self.ready.get(&socket.0).map(|r| r.read).unwrap_or(false)
    }

    fn write_ready(&self, socket: SocketId) -> bool {
        self.ready.get(&socket.0).map(|r| r.write).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;
    use std::time::Duration;
    use super::*;

    #[test]
    fn test_readiness() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let server_id = SocketId(server.as_raw_fd());

        let mut selector = MioSelector::new().unwrap();
        selector.set_sockets(&[server_id], &[]).unwrap();
        assert!(!selector.wait(Duration::from_millis(20)).unwrap());
        assert!(!selector.read_ready(server_id));

        client.write_all(b"hello").unwrap();
        assert!(selector.wait(Duration::from_secs(5)).unwrap());
        assert!(selector.read_ready(server_id));
        assert!(!selector.write_ready(server_id));

        // data was not consumed, so it is reported again
        assert!(selector.wait(Duration::from_secs(5)).unwrap());
        assert!(selector.read_ready(server_id));

        selector.set_sockets(&[], &[server_id]).unwrap();
        assert!(selector.wait(Duration::from_secs(5)).unwrap());
        assert!(selector.write_ready(server_id));
        assert!(!selector.read_ready(server_id));
    }

    #[test]
    fn test_empty_wait_times_out() {
        let mut selector = MioSelector::new().unwrap();
        selector.set_sockets(&[], &[]).unwrap();
        assert!(!selector.wait(Duration::from_millis(10)).unwrap());
    }
}
