//! Readiness notification for mailboxes.
//!
//! A [`Doorbell`] is a nonblocking Unix socketpair. The mailbox rings it
//! when its queue goes from empty to non-empty and drains it when the queue
//! empties again, so the read end is readable exactly while messages are
//! pending. Callers integrating with `poll`/`epoll` get the read end as a
//! [`Notifier`].

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use tracing::warn;

/// Both ends of a mailbox's socketpair.
#[derive(Debug)]
pub(crate) struct Doorbell {
    ring: UnixStream,
    wake: Arc<UnixStream>,
}

impl Doorbell {
    pub(crate) fn new() -> io::Result<Self> {
        let (ring, wake) = UnixStream::pair()?;
        ring.set_nonblocking(true)?;
        wake.set_nonblocking(true)?;
        Ok(Self {
            ring,
            wake: Arc::new(wake),
        })
    }

    /// Make the read end readable.
    pub(crate) fn ring(&self) {
        match (&self.ring).write(&[1]) {
            Ok(_) => {}
            // Buffer full means the peer is already readable.
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "failed to ring mailbox doorbell"),
        }
    }

    /// Consume every pending ring so the read end is no longer readable.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&*self.wake).read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "failed to drain mailbox doorbell");
                    return;
                }
            }
        }
    }

    pub(crate) fn notifier(&self) -> Notifier {
        Notifier {
            wake: Arc::clone(&self.wake),
        }
    }
}

/// Pollable handle that is readable while a mailbox has pending messages.
///
/// Do not read from it; the mailbox drains it on `receive`.
#[derive(Debug, Clone)]
pub struct Notifier {
    wake: Arc<UnixStream>,
}

impl AsFd for Notifier {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.wake.as_fd()
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }
}

/// Zero-timeout poll of the read end. Leaves the pending byte in place.
#[cfg(test)]
pub(crate) fn is_readable(notifier: &Notifier) -> bool {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    let mut fds = [PollFd::new(notifier.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(n) if n > 0 => fds[0]
            .revents()
            .is_some_and(|events| events.contains(PollFlags::POLLIN)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_then_drain() {
        let bell = Doorbell::new().unwrap();
        let notifier = bell.notifier();
        assert!(!is_readable(&notifier));

        bell.ring();
        bell.ring();
        assert!(is_readable(&notifier));

        bell.drain();
        assert!(!is_readable(&notifier));
    }

    #[test]
    fn readiness_check_does_not_consume() {
        let bell = Doorbell::new().unwrap();
        let notifier = bell.notifier();
        bell.ring();

        assert!(is_readable(&notifier));
        assert!(is_readable(&notifier));
        assert!(is_readable(&notifier.clone()));

        bell.drain();
        assert!(!is_readable(&notifier));
    }

    #[test]
    fn notifier_exposes_fd() {
        let bell = Doorbell::new().unwrap();
        let notifier = bell.notifier();
        assert!(notifier.as_raw_fd() >= 0);
        assert_eq!(notifier.as_fd().as_raw_fd(), notifier.as_raw_fd());
    }
}
