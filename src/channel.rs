//! Binding between one file descriptor and its loop-local dispatch state.
//!
//! A `Channel` carries the fd's interest mask, the revents reported by the
//! last poll, and the consumers a readiness event can be delivered to. The
//! read side has three mutually exclusive registrations, tried in priority
//! order on every read-ready tick:
//!
//! 1. the suspended-reader [`Waker`] (how `read` / `accept` wake up),
//! 2. the read-resume side-channel (installed only by read-with-timeout so
//!    it can race the timer),
//! 3. the plain read callback (non-coroutine consumers: the timer fd and
//!    the wakeup fd).
//!
//! There is at most one suspended reader, enforced structurally: the
//! channel exposes `set` and `clear`, never `add`. Dispatch takes the waker
//! out, so a later tick can never resume the same registration twice.

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::task::Waker;

pub(crate) const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;

/// Loop-side callback attached to a channel. `Rc` so dispatch can clone the
/// handle out of the registry and invoke it after releasing the borrow.
pub(crate) type EventCallback = Rc<dyn Fn()>;

/// Poller membership of a channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Membership {
    /// Never added to the poller.
    New,
    /// Currently registered.
    Added,
    /// Was registered, currently detached (empty interest).
    Deleted,
}

/// One step of a dispatch, produced while the registry is borrowed and run
/// after it is released so handlers can re-enter the loop.
pub(crate) enum Action {
    Wake(Waker),
    Call(EventCallback),
}

pub(crate) struct Channel {
    fd: RawFd,
    events: u32,
    revents: u32,
    membership: Membership,
    reader: Option<Waker>,
    read_resume: Option<EventCallback>,
    read_cb: Option<EventCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl Channel {
    pub(crate) fn new(fd: RawFd) -> Self {
        Channel {
            fd,
            events: 0,
            revents: 0,
            membership: Membership::New,
            reader: None,
            read_resume: None,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        }
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub(crate) fn interest(&self) -> u32 {
        self.events
    }

    #[inline]
    pub(crate) fn is_reading(&self) -> bool {
        self.events & READ_EVENTS != 0
    }

    #[inline]
    pub(crate) fn is_writing(&self) -> bool {
        self.events & WRITE_EVENTS != 0
    }

    #[inline]
    pub(crate) fn is_none_interest(&self) -> bool {
        self.events == 0
    }

    pub(crate) fn enable_reading(&mut self) {
        self.events |= READ_EVENTS;
    }

    pub(crate) fn disable_reading(&mut self) {
        self.events &= !READ_EVENTS;
    }

    pub(crate) fn enable_writing(&mut self) {
        self.events |= WRITE_EVENTS;
    }

    pub(crate) fn disable_writing(&mut self) {
        self.events &= !WRITE_EVENTS;
    }

    pub(crate) fn disable_all(&mut self) {
        self.events = 0;
    }

    #[inline]
    pub(crate) fn membership(&self) -> Membership {
        self.membership
    }

    pub(crate) fn set_membership(&mut self, m: Membership) {
        self.membership = m;
    }

    pub(crate) fn set_revents(&mut self, revents: u32) {
        self.revents = revents;
    }

    /// Install the suspended-reader handle. Replaces any previous one; the
    /// one-waiter rule means a replacement only happens when the same
    /// future re-registers after a spurious poll.
    pub(crate) fn set_reader(&mut self, waker: Waker) {
        self.reader = Some(waker);
    }

    /// Idempotent; called on every resume path and during close.
    pub(crate) fn clear_reader(&mut self) {
        self.reader = None;
    }

    pub(crate) fn take_reader(&mut self) -> Option<Waker> {
        self.reader.take()
    }

    pub(crate) fn has_reader(&self) -> bool {
        self.reader.is_some()
    }

    pub(crate) fn set_read_resume(&mut self, cb: EventCallback) {
        self.read_resume = Some(cb);
    }

    /// Idempotent; cleared by whichever side of the timed-read race loses,
    /// and again by the awaiter's resume.
    pub(crate) fn clear_read_resume(&mut self) {
        self.read_resume = None;
    }

    pub(crate) fn take_read_resume(&mut self) -> Option<EventCallback> {
        self.read_resume.take()
    }

    pub(crate) fn set_read_callback(&mut self, cb: EventCallback) {
        self.read_cb = Some(cb);
    }

    pub(crate) fn set_write_callback(&mut self, cb: EventCallback) {
        self.write_cb = Some(cb);
    }

    pub(crate) fn set_close_callback(&mut self, cb: EventCallback) {
        self.close_cb = Some(cb);
    }

    pub(crate) fn set_error_callback(&mut self, cb: EventCallback) {
        self.error_cb = Some(cb);
    }

    /// Translate the revents of the current tick into dispatch actions.
    ///
    /// Returns `true` when a read-ready event found no consumer at all; the
    /// loop then drops read interest so a level-triggered fd cannot spin
    /// while the session is suspended elsewhere.
    pub(crate) fn collect_actions(&mut self, actions: &mut Vec<Action>) -> bool {
        let revents = self.revents;
        let mut orphaned_read = false;

        // Peer hangup with nothing left to read: a suspended reader is
        // woken so its awaiter observes the zero-length fill and closes
        // cleanly; otherwise the close callback fires.
        if revents & (libc::EPOLLHUP as u32) != 0 && revents & (libc::EPOLLIN as u32) == 0 {
            if let Some(waker) = self.reader.take() {
                actions.push(Action::Wake(waker));
            } else if let Some(cb) = &self.close_cb {
                actions.push(Action::Call(cb.clone()));
            }
        }

        if revents & (libc::EPOLLERR as u32) != 0 {
            if let Some(cb) = &self.error_cb {
                actions.push(Action::Call(cb.clone()));
            }
        }

        if revents & READ_EVENTS != 0 {
            if let Some(waker) = self.reader.take() {
                actions.push(Action::Wake(waker));
            } else if let Some(cb) = &self.read_resume {
                actions.push(Action::Call(cb.clone()));
            } else if let Some(cb) = &self.read_cb {
                actions.push(Action::Call(cb.clone()));
            } else {
                orphaned_read = true;
            }
        }

        if revents & WRITE_EVENTS != 0 {
            if let Some(cb) = &self.write_cb {
                actions.push(Action::Call(cb.clone()));
            }
        }

        orphaned_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn run(actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Wake(w) => w.wake(),
                Action::Call(cb) => cb(),
            }
        }
    }

    #[test]
    fn test_reader_takes_priority_and_is_cleared() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let called = Rc::new(Cell::new(0));
        let called2 = called.clone();

        let mut ch = Channel::new(0);
        ch.set_read_callback(Rc::new(move || called2.set(called2.get() + 1)));
        ch.set_reader(Waker::from(counter.clone()));
        ch.set_revents(READ_EVENTS);

        let mut actions = Vec::new();
        assert!(!ch.collect_actions(&mut actions));
        run(actions);

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(called.get(), 0);
        assert!(!ch.has_reader());

        // Same revents on a later tick: the reader is gone, the legacy
        // callback now fires.
        let mut actions = Vec::new();
        assert!(!ch.collect_actions(&mut actions));
        run(actions);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(called.get(), 1);
    }

    #[test]
    fn test_side_channel_beats_read_callback() {
        let resumed = Rc::new(Cell::new(false));
        let resumed2 = resumed.clone();
        let legacy = Rc::new(Cell::new(false));
        let legacy2 = legacy.clone();

        let mut ch = Channel::new(0);
        ch.set_read_callback(Rc::new(move || legacy2.set(true)));
        ch.set_read_resume(Rc::new(move || resumed2.set(true)));
        ch.set_revents(READ_EVENTS);

        let mut actions = Vec::new();
        ch.collect_actions(&mut actions);
        run(actions);
        assert!(resumed.get());
        assert!(!legacy.get());
    }

    #[test]
    fn test_hangup_without_data_wakes_reader() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let closed = Rc::new(Cell::new(false));
        let closed2 = closed.clone();

        let mut ch = Channel::new(0);
        ch.set_close_callback(Rc::new(move || closed2.set(true)));
        ch.set_reader(Waker::from(counter.clone()));
        ch.set_revents(libc::EPOLLHUP as u32);

        let mut actions = Vec::new();
        ch.collect_actions(&mut actions);
        run(actions);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(!closed.get());

        // No reader next time: close callback fires.
        let mut actions = Vec::new();
        ch.collect_actions(&mut actions);
        run(actions);
        assert!(closed.get());
    }

    #[test]
    fn test_orphaned_read_reported() {
        let mut ch = Channel::new(0);
        ch.enable_reading();
        ch.set_revents(READ_EVENTS);
        let mut actions = Vec::new();
        assert!(ch.collect_actions(&mut actions));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_interest_mutations() {
        let mut ch = Channel::new(3);
        assert!(ch.is_none_interest());
        ch.enable_reading();
        assert!(ch.is_reading());
        ch.enable_writing();
        assert!(ch.is_writing());
        ch.disable_writing();
        assert!(!ch.is_writing());
        assert!(ch.is_reading());
        ch.disable_all();
        assert!(ch.is_none_interest());
    }
}
