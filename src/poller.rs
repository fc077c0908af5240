//! Level-triggered readiness multiplexer over a set of channels.
//!
//! Thin wrapper around epoll. Level-triggered semantics are load-bearing:
//! the read and accept suspension points perform one bounded syscall per
//! resume and rely on the same fd being reported again next tick until it
//! is drained.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use crate::channel::{Channel, Membership};

const INITIAL_EVENT_CAPACITY: usize = 64;

pub(crate) struct Poller {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENT_CAPACITY],
        })
    }

    /// Wait for readiness and push `(token, revents)` pairs in the order
    /// the kernel reported them. An interrupted wait reports no events.
    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<(usize, u32)>,
    ) -> io::Result<()> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        let n = n as usize;
        for event in &self.events[..n] {
            out.push((event.u64 as usize, event.events));
        }
        // A full event buffer means there may be more ready fds than we
        // could see this tick; grow so the next wait reports them all.
        if n == self.events.len() {
            self.events
                .resize(n * 2, libc::epoll_event { events: 0, u64: 0 });
        }
        Ok(())
    }

    /// Reflect the channel's interest mask into the epoll set.
    pub(crate) fn update_channel(&mut self, token: usize, channel: &mut Channel) -> io::Result<()> {
        match channel.membership() {
            Membership::New | Membership::Deleted => {
                if channel.is_none_interest() {
                    return Ok(());
                }
                self.ctl(libc::EPOLL_CTL_ADD, token, channel)?;
                channel.set_membership(Membership::Added);
            }
            Membership::Added => {
                if channel.is_none_interest() {
                    self.ctl(libc::EPOLL_CTL_DEL, token, channel)?;
                    channel.set_membership(Membership::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, token, channel)?;
                }
            }
        }
        Ok(())
    }

    /// Detach a channel. Must not fail for an fd the kernel already closed:
    /// close(2) removes the fd from the epoll set on its own.
    pub(crate) fn remove_channel(&mut self, token: usize, channel: &mut Channel) {
        if channel.membership() == Membership::Added {
            if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, token, channel) {
                match e.raw_os_error() {
                    Some(libc::ENOENT) | Some(libc::EBADF) => {}
                    _ => tracing::warn!(fd = channel.fd(), error = %e, "epoll_ctl DEL failed"),
                }
            }
        }
        channel.set_membership(Membership::New);
    }

    fn ctl(&self, op: libc::c_int, token: usize, channel: &Channel) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: channel.interest(),
            u64: token as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, channel.fd(), &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_poll_timeout_no_events() {
        let mut poller = Poller::new().unwrap();
        let mut out = Vec::new();
        poller
            .poll(Some(Duration::from_millis(1)), &mut out)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_level_triggered_until_drained() {
        let (r, w) = pipe();
        let mut poller = Poller::new().unwrap();
        let mut ch = Channel::new(r.as_raw_fd());
        ch.enable_reading();
        poller.update_channel(7, &mut ch).unwrap();

        let n = unsafe { libc::write(w.as_raw_fd(), b"x".as_ptr() as *const _, 1) };
        assert_eq!(n, 1);

        // Reported on every wait until the byte is read.
        for _ in 0..2 {
            let mut out = Vec::new();
            poller
                .poll(Some(Duration::from_millis(100)), &mut out)
                .unwrap();
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].0, 7);
            assert_ne!(out[0].1 & crate::channel::READ_EVENTS, 0);
        }

        let mut byte = [0u8; 1];
        unsafe { libc::read(r.as_raw_fd(), byte.as_mut_ptr() as *mut _, 1) };
        let mut out = Vec::new();
        poller
            .poll(Some(Duration::from_millis(1)), &mut out)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_update_transitions() {
        let (r, _w) = pipe();
        let mut poller = Poller::new().unwrap();
        let mut ch = Channel::new(r.as_raw_fd());
        assert_eq!(ch.membership(), Membership::New);

        // Empty interest: nothing to add.
        poller.update_channel(0, &mut ch).unwrap();
        assert_eq!(ch.membership(), Membership::New);

        ch.enable_reading();
        poller.update_channel(0, &mut ch).unwrap();
        assert_eq!(ch.membership(), Membership::Added);

        ch.enable_writing();
        poller.update_channel(0, &mut ch).unwrap();
        assert_eq!(ch.membership(), Membership::Added);

        ch.disable_all();
        poller.update_channel(0, &mut ch).unwrap();
        assert_eq!(ch.membership(), Membership::Deleted);

        ch.enable_reading();
        poller.update_channel(0, &mut ch).unwrap();
        assert_eq!(ch.membership(), Membership::Added);
    }

    #[test]
    fn test_remove_closed_fd_does_not_fail() {
        let mut poller = Poller::new().unwrap();
        let (r, _w) = pipe();
        let raw = r.as_raw_fd();
        let mut ch = Channel::new(raw);
        ch.enable_reading();
        poller.update_channel(1, &mut ch).unwrap();

        drop(r);
        poller.remove_channel(1, &mut ch);
        assert_eq!(ch.membership(), Membership::New);
    }
}
