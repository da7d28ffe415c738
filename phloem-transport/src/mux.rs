//! I/O readiness multiplexer.
//!
//! Linux builds sit directly on epoll via `nix`; other platforms go through
//! `mio` (kqueue on macOS/BSD). The two backends expose the same surface, so
//! the event loops upstream never see the difference.
//!
//! Error-queue readiness (`EPOLLERR`) is reported separately from readability:
//! the NIC-timestamped agent mode reads transmit timestamps off the error
//! queue, so folding errors into `readable` would make them indistinguishable
//! from response data.

use crate::Result;
use std::time::Duration;

#[cfg(target_os = "linux")]
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
#[cfg(target_os = "linux")]
use std::os::fd::RawFd;

#[cfg(not(target_os = "linux"))]
use mio::{Events, Interest as MioInterest, Poll, Token};

/// Interest flags for registration
#[derive(Debug, Clone, Copy)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
    pub const BOTH: Interest = Interest { readable: true, writable: true };
}

/// Readiness event returned by `wait`
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// The id supplied at registration (connection index upstream)
    pub id: usize,
    pub readable: bool,
    pub writable: bool,
    /// Error-queue readiness, kept distinct from `readable`
    pub error: bool,
}

/// Readiness multiplexer over the platform backend.
pub struct Multiplexer {
    backend: Backend,
    registered: usize,
}

enum Backend {
    #[cfg(target_os = "linux")]
    Epoll(EpollBackend),
    #[cfg(not(target_os = "linux"))]
    Mio(MioBackend),
}

// =============================================================================
// Epoll backend (Linux)
// =============================================================================

#[cfg(target_os = "linux")]
struct EpollBackend {
    epoll: Epoll,
    events: Vec<EpollEvent>,
}

#[cfg(target_os = "linux")]
impl EpollBackend {
    fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epoll, events: Vec::with_capacity(64) })
    }

    fn flags_for(interest: Interest) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if interest.readable {
            flags |= EpollFlags::EPOLLIN;
        }
        if interest.writable {
            flags |= EpollFlags::EPOLLOUT;
        }
        // Level-triggered: partial drains just fire again
        flags
    }

    fn register(&mut self, fd: RawFd, id: usize, interest: Interest) -> Result<()> {
        let event = EpollEvent::new(Self::flags_for(interest), id as u64);
        self.epoll.add(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, event)?;
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> Result<()> {
        self.epoll.delete(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) })?;
        Ok(())
    }

    fn wait(&mut self, max_events: usize, timeout: Option<Duration>) -> Result<Vec<Event>> {
        self.events.clear();
        self.events.resize(max_events.max(1), EpollEvent::empty());

        let timeout_val = match timeout {
            Some(d) => EpollTimeout::try_from(d).unwrap_or(EpollTimeout::NONE),
            None => EpollTimeout::NONE,
        };

        let n = self.epoll.wait(&mut self.events, timeout_val)?;

        let events = self.events[..n]
            .iter()
            .map(|e| {
                let flags = e.events();
                Event {
                    id: e.data() as usize,
                    // Hangups surface as readable so the 0-byte read path
                    // tears the connection down
                    readable: flags.contains(EpollFlags::EPOLLIN)
                        || flags.contains(EpollFlags::EPOLLHUP)
                        || flags.contains(EpollFlags::EPOLLRDHUP),
                    writable: flags.contains(EpollFlags::EPOLLOUT),
                    error: flags.contains(EpollFlags::EPOLLERR),
                }
            })
            .collect();

        Ok(events)
    }
}

// =============================================================================
// Mio backend (non-Linux)
// =============================================================================

#[cfg(not(target_os = "linux"))]
struct MioBackend {
    poll: Poll,
    events: Events,
}

#[cfg(not(target_os = "linux"))]
impl MioBackend {
    fn new() -> Result<Self> {
        Ok(Self { poll: Poll::new()?, events: Events::with_capacity(64) })
    }

    fn mio_interest(interest: Interest) -> MioInterest {
        match (interest.readable, interest.writable) {
            (true, true) => MioInterest::READABLE | MioInterest::WRITABLE,
            (false, true) => MioInterest::WRITABLE,
            _ => MioInterest::READABLE,
        }
    }

    fn register(&mut self, fd: std::os::fd::RawFd, id: usize, interest: Interest) -> Result<()> {
        let mut source = mio::unix::SourceFd(&fd);
        self.poll.registry().register(&mut source, Token(id), Self::mio_interest(interest))?;
        Ok(())
    }

    fn deregister(&mut self, fd: std::os::fd::RawFd) -> Result<()> {
        let mut source = mio::unix::SourceFd(&fd);
        self.poll.registry().deregister(&mut source)?;
        Ok(())
    }

    fn wait(&mut self, max_events: usize, timeout: Option<Duration>) -> Result<Vec<Event>> {
        self.events.clear();
        self.poll.poll(&mut self.events, timeout)?;

        let events = self
            .events
            .iter()
            .take(max_events.max(1))
            .map(|e| Event {
                id: e.token().0,
                readable: e.is_readable() || e.is_read_closed(),
                writable: e.is_writable(),
                error: e.is_error(),
            })
            .collect();

        Ok(events)
    }
}

// =============================================================================
// Unified surface
// =============================================================================

impl Multiplexer {
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "linux")]
        let backend = Backend::Epoll(EpollBackend::new()?);
        #[cfg(not(target_os = "linux"))]
        let backend = Backend::Mio(MioBackend::new()?);

        Ok(Self { backend, registered: 0 })
    }

    /// Register a file descriptor; `id` comes back in events.
    pub fn register(&mut self, fd: std::os::fd::RawFd, id: usize, interest: Interest) -> Result<()> {
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll(epoll) => epoll.register(fd, id, interest)?,
            #[cfg(not(target_os = "linux"))]
            Backend::Mio(mio) => mio.register(fd, id, interest)?,
        }
        self.registered += 1;
        Ok(())
    }

    pub fn deregister(&mut self, fd: std::os::fd::RawFd) -> Result<()> {
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll(epoll) => epoll.deregister(fd)?,
            #[cfg(not(target_os = "linux"))]
            Backend::Mio(mio) => mio.deregister(fd)?,
        }
        self.registered = self.registered.saturating_sub(1);
        Ok(())
    }

    /// Collect up to `registered` ready events.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        let cap = self.registered;
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll(epoll) => epoll.wait(cap, timeout),
            #[cfg(not(target_os = "linux"))]
            Backend::Mio(mio) => mio.wait(cap, timeout),
        }
    }

    /// Collect at most one ready event. The symmetric agent modes interleave
    /// a single readiness event per scheduling tick.
    pub fn wait_one(&mut self, timeout: Option<Duration>) -> Result<Option<Event>> {
        let events = match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll(epoll) => epoll.wait(1, timeout)?,
            #[cfg(not(target_os = "linux"))]
            Backend::Mio(mio) => mio.wait(1, timeout)?,
        };
        Ok(events.into_iter().next())
    }

    pub fn len(&self) -> usize {
        self.registered
    }

    pub fn is_empty(&self) -> bool {
        self.registered == 0
    }

    /// Register any type that implements AsRawFd
    pub fn register_fd<F: std::os::fd::AsRawFd>(
        &mut self,
        source: &F,
        id: usize,
        interest: Interest,
    ) -> Result<()> {
        self.register(source.as_raw_fd(), id, interest)
    }

    /// Deregister any type that implements AsRawFd
    pub fn deregister_fd<F: std::os::fd::AsRawFd>(&mut self, source: &F) -> Result<()> {
        self.deregister(source.as_raw_fd())
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer").field("registered", &self.registered).finish()
    }
}
