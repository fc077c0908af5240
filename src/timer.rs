//! Timer queue backed by a timer fd.
//!
//! Two coupled ordered views: `timers`, keyed by (expiration, sequence) for
//! firing order, and `active`, keyed by sequence for cancellation. Among
//! simultaneous deadlines, ties break on the sequence number assigned at
//! creation, so insertion order wins. One timerfd is armed to the earliest
//! deadline; its readable tick drives expiry.
//!
//! Cancelling from inside another timer's callback is well-defined: an
//! expired timer has already left both views, so the cancellation lands in
//! the `canceling` set and suppresses the reinsertion of a repeating timer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Never arm the timerfd closer than this, so an already-elapsed deadline
/// still produces a tick instead of disarming the fd.
const MIN_ARM_DELAY: Duration = Duration::from_micros(100);

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Opaque, copyable handle for cancelling a timer.
///
/// Sequence numbers are process-unique and never reused, so a stale id is
/// always a harmless no-op to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

pub(crate) struct Timer {
    callback: Box<dyn FnMut() + Send>,
    expiration: Instant,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    pub(crate) fn new(
        callback: Box<dyn FnMut() + Send>,
        expiration: Instant,
        interval: Option<Duration>,
    ) -> Self {
        Timer {
            callback,
            expiration,
            interval,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn id(&self) -> TimerId {
        TimerId(self.sequence)
    }

    pub(crate) fn run(&mut self) {
        (self.callback)();
    }
}

pub(crate) struct TimerQueue {
    fd: OwnedFd,
    timers: BTreeMap<(Instant, u64), Timer>,
    active: HashMap<u64, Instant>,
    canceling: HashSet<u64>,
    calling_expired: bool,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(TimerQueue {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            timers: BTreeMap::new(),
            active: HashMap::new(),
            canceling: HashSet::new(),
            calling_expired: false,
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Insert a timer, re-arming the timerfd when it becomes the earliest.
    pub(crate) fn add(&mut self, timer: Timer) -> TimerId {
        let id = timer.id();
        let earliest_changed = self.insert(timer);
        if earliest_changed {
            if let Some((&(when, _), _)) = self.timers.first_key_value() {
                self.arm(when);
            }
        }
        id
    }

    /// Cancel by id. A no-op for ids that already fired (one-shot) or were
    /// already cancelled. When the target is currently in the in-flight
    /// expired list, it is recorded so a repeating timer is not reinserted.
    pub(crate) fn cancel(&mut self, id: TimerId) {
        if let Some(expiration) = self.active.remove(&id.0) {
            self.timers.remove(&(expiration, id.0));
        } else if self.calling_expired {
            self.canceling.insert(id.0);
        }
    }

    /// Drain the timerfd and detach every timer due at `now`.
    ///
    /// Leaves the queue in "calling expired" state; the caller runs the
    /// callbacks with no borrow held and then hands the batch back through
    /// [`TimerQueue::restart`].
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        self.drain_fd();

        // Everything strictly before (now, u64::MAX) is due.
        let remaining = self.timers.split_off(&(now, u64::MAX));
        let expired_map = std::mem::replace(&mut self.timers, remaining);

        let mut expired: Vec<Timer> = Vec::with_capacity(expired_map.len());
        for (_, timer) in expired_map {
            self.active.remove(&timer.sequence);
            expired.push(timer);
        }

        self.calling_expired = true;
        self.canceling.clear();
        expired
    }

    /// Reinsert repeating timers that were not cancelled mid-flight and
    /// re-arm the timerfd to the new earliest deadline.
    pub(crate) fn restart(&mut self, expired: Vec<Timer>, now: Instant) {
        self.calling_expired = false;
        for mut timer in expired {
            match timer.interval {
                Some(interval) if !self.canceling.contains(&timer.sequence) => {
                    timer.expiration = now + interval;
                    self.insert(timer);
                }
                _ => {}
            }
        }
        if let Some((&(when, _), _)) = self.timers.first_key_value() {
            self.arm(when);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }

    fn insert(&mut self, timer: Timer) -> bool {
        let when = timer.expiration;
        let earliest_changed = match self.timers.first_key_value() {
            Some((&(first, _), _)) => when < first,
            None => true,
        };
        self.active.insert(timer.sequence, when);
        self.timers.insert((when, timer.sequence), timer);
        earliest_changed
    }

    fn arm(&self, when: Instant) {
        let delay = when
            .saturating_duration_since(Instant::now())
            .max(MIN_ARM_DELAY);
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        let rc =
            unsafe { libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        if rc < 0 {
            tracing::error!(error = %io::Error::last_os_error(), "timerfd_settime failed");
        }
    }

    fn drain_fd(&self) {
        let mut expirations: u64 = 0;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }
}
