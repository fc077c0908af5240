//! One thread's dispatch: poller, timer queue, cross-thread task queue.
//!
//! Every channel and timer belongs to exactly one `EventLoop` and is only
//! mutated from that loop's thread; [`LoopHandle::run_in_loop`] is the only
//! cross-thread bridge. A tick runs in phases: poll, dispatch I/O in
//! reported order (timer callbacks fire here through the timer fd's
//! channel), drain the cross-thread queue, then poll every local future
//! that was woken. Resumption of a suspension point is therefore scheduled
//! into its phase, never synchronous with the event that caused it.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::channel::{Action, Channel, EventCallback};
use crate::error::Result;
use crate::poller::Poller;
use crate::task::{self, LocalFuture};
use crate::timer::{Timer, TimerId, TimerQueue};

/// Upper bound for one epoll wait; the timer fd interrupts it earlier when
/// a deadline is due.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

type PendingTask = Box<dyn FnOnce() + Send>;

/// Loop-local state. Lives behind `Rc<RefCell<..>>` so leaf futures and
/// dispatch callbacks, which all run on the loop thread, can re-enter it
/// between the loop's own borrows.
pub(crate) struct LoopInner {
    pub(crate) poller: Poller,
    pub(crate) channels: Slab<Channel>,
    pub(crate) timers: TimerQueue,
    pub(crate) tasks: Slab<Option<LocalFuture>>,
    io_events: Vec<(usize, u32)>,
}

impl LoopInner {
    pub(crate) fn create_channel(&mut self, fd: RawFd) -> usize {
        self.channels.insert(Channel::new(fd))
    }

    pub(crate) fn remove_channel(&mut self, token: usize) {
        if self.channels.contains(token) {
            let mut channel = self.channels.remove(token);
            self.poller.remove_channel(token, &mut channel);
        }
    }

    pub(crate) fn enable_reading(&mut self, token: usize) {
        if let Some(ch) = self.channels.get_mut(token) {
            if !ch.is_reading() {
                ch.enable_reading();
                Self::reflect(&mut self.poller, token, ch);
            }
        }
    }

    pub(crate) fn disable_reading(&mut self, token: usize) {
        if let Some(ch) = self.channels.get_mut(token) {
            if ch.is_reading() {
                ch.disable_reading();
                Self::reflect(&mut self.poller, token, ch);
            }
        }
    }

    pub(crate) fn enable_writing(&mut self, token: usize) {
        if let Some(ch) = self.channels.get_mut(token) {
            if !ch.is_writing() {
                ch.enable_writing();
                Self::reflect(&mut self.poller, token, ch);
            }
        }
    }

    pub(crate) fn disable_writing(&mut self, token: usize) {
        if let Some(ch) = self.channels.get_mut(token) {
            if ch.is_writing() {
                ch.disable_writing();
                Self::reflect(&mut self.poller, token, ch);
            }
        }
    }

    pub(crate) fn disable_all(&mut self, token: usize) {
        if let Some(ch) = self.channels.get_mut(token) {
            if !ch.is_none_interest() {
                ch.disable_all();
                Self::reflect(&mut self.poller, token, ch);
            }
        }
    }

    pub(crate) fn is_writing(&self, token: usize) -> bool {
        self.channels.get(token).is_some_and(Channel::is_writing)
    }

    pub(crate) fn set_reader(&mut self, token: usize, waker: Waker) {
        if let Some(ch) = self.channels.get_mut(token) {
            ch.set_reader(waker);
        }
    }

    pub(crate) fn clear_reader(&mut self, token: usize) {
        if let Some(ch) = self.channels.get_mut(token) {
            ch.clear_reader();
        }
    }

    pub(crate) fn take_reader(&mut self, token: usize) -> Option<Waker> {
        self.channels.get_mut(token).and_then(Channel::take_reader)
    }

    pub(crate) fn take_read_resume(&mut self, token: usize) -> Option<EventCallback> {
        self.channels
            .get_mut(token)
            .and_then(Channel::take_read_resume)
    }

    pub(crate) fn set_read_resume(&mut self, token: usize, cb: EventCallback) {
        if let Some(ch) = self.channels.get_mut(token) {
            ch.set_read_resume(cb);
        }
    }

    pub(crate) fn clear_read_resume(&mut self, token: usize) {
        if let Some(ch) = self.channels.get_mut(token) {
            ch.clear_read_resume();
        }
    }

    pub(crate) fn set_read_callback(&mut self, token: usize, cb: EventCallback) {
        if let Some(ch) = self.channels.get_mut(token) {
            ch.set_read_callback(cb);
        }
    }

    pub(crate) fn set_write_callback(&mut self, token: usize, cb: EventCallback) {
        if let Some(ch) = self.channels.get_mut(token) {
            ch.set_write_callback(cb);
        }
    }

    pub(crate) fn set_close_callback(&mut self, token: usize, cb: EventCallback) {
        if let Some(ch) = self.channels.get_mut(token) {
            ch.set_close_callback(cb);
        }
    }

    pub(crate) fn set_error_callback(&mut self, token: usize, cb: EventCallback) {
        if let Some(ch) = self.channels.get_mut(token) {
            ch.set_error_callback(cb);
        }
    }

    fn reflect(poller: &mut Poller, token: usize, channel: &mut Channel) {
        if let Err(e) = poller.update_channel(token, channel) {
            tracing::error!(fd = channel.fd(), error = %e, "failed to update poller membership");
        }
    }
}

/// State shared with other threads: the submission queues and the wakeup fd.
pub(crate) struct LoopShared {
    thread_id: ThreadId,
    pending: Mutex<Vec<PendingTask>>,
    ready: Mutex<Vec<usize>>,
    wakeup: OwnedFd,
    quit: AtomicBool,
    calling_pending: AtomicBool,
}

impl LoopShared {
    pub(crate) fn enqueue_ready(&self, task: usize) {
        self.ready.lock().unwrap().push(task);
        if thread::current().id() != self.thread_id {
            self.wake();
        }
    }

    fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.wakeup.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }
}

/// Cloneable, `Send` handle to an event loop.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Whether the calling thread owns this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Run `f` on the loop thread: inline when already there and the loop
    /// is not currently draining its task queue, queued otherwise.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() && !self.shared.calling_pending.load(Ordering::Acquire) {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queue `f` for the loop's next task-drain phase and wake the loop if
    /// it might otherwise sleep past it.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.pending.lock().unwrap().push(Box::new(f));
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.shared.wake();
        }
    }

    /// Run `f` once on the loop thread after `delay`.
    pub fn run_after(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerId {
        let mut f = Some(f);
        let timer = Timer::new(
            Box::new(move || {
                if let Some(f) = f.take() {
                    f();
                }
            }),
            Instant::now() + delay,
            None,
        );
        self.add_timer(timer)
    }

    /// Run `f` on the loop thread every `interval`, starting one interval
    /// from now, until cancelled.
    pub fn run_every(&self, interval: Duration, f: impl FnMut() + Send + 'static) -> TimerId {
        let timer = Timer::new(Box::new(f), Instant::now() + interval, Some(interval));
        self.add_timer(timer)
    }

    /// Cancel a timer. Safe to call any number of times, from any thread,
    /// including from inside another timer's callback.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            current_ctx().inner.borrow_mut().timers.cancel(id);
        });
    }

    /// Ask the loop to exit after the current tick.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        self.shared.wake();
    }

    pub(crate) fn same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn add_timer(&self, timer: Timer) -> TimerId {
        let id = timer.id();
        self.run_in_loop(move || {
            current_ctx().inner.borrow_mut().timers.add(timer);
        });
        id
    }
}

/// The loop-thread context leaf futures reach through thread-local storage.
#[derive(Clone)]
pub(crate) struct LoopCtx {
    pub(crate) inner: Rc<RefCell<LoopInner>>,
    pub(crate) shared: Arc<LoopShared>,
}

thread_local! {
    static CURRENT: RefCell<Option<LoopCtx>> = const { RefCell::new(None) };
}

pub(crate) fn try_current_ctx() -> Option<LoopCtx> {
    CURRENT.with(|current| current.borrow().clone())
}

/// The loop context of the calling thread.
///
/// # Panics
///
/// Panics when the calling thread does not own an [`EventLoop`]; using a
/// suspension point off-loop is a programmer error.
pub(crate) fn current_ctx() -> LoopCtx {
    try_current_ctx().expect("not an event-loop thread (suspension points and timers must run on the loop that owns them)")
}

/// A single-threaded reactor: owns the poller, the timer queue, the channel
/// registry and the local task table of one thread.
///
/// Construct it on the thread that will run it; the constructing thread
/// becomes the owner and the loop registers itself in thread-local storage
/// so suspension points can find it.
pub struct EventLoop {
    inner: Rc<RefCell<LoopInner>>,
    shared: Arc<LoopShared>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let wakeup = create_eventfd()?;
        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            pending: Mutex::new(Vec::new()),
            ready: Mutex::new(Vec::new()),
            wakeup,
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
        });
        let inner = Rc::new(RefCell::new(LoopInner {
            poller: Poller::new()?,
            channels: Slab::new(),
            timers: TimerQueue::new()?,
            tasks: Slab::new(),
            io_events: Vec::new(),
        }));

        // The timer fd and the wakeup fd are ordinary channels on the
        // legacy read-callback path.
        {
            let mut borrow = inner.borrow_mut();

            let timer_fd = borrow.timers.fd();
            let timer_token = borrow.create_channel(timer_fd);
            let weak = Rc::downgrade(&inner);
            borrow.set_read_callback(
                timer_token,
                Rc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        handle_timer_tick(&inner);
                    }
                }),
            );
            borrow.enable_reading(timer_token);

            let wakeup_fd = shared.wakeup.as_raw_fd();
            let wakeup_token = borrow.create_channel(wakeup_fd);
            borrow.set_read_callback(wakeup_token, Rc::new(move || drain_eventfd(wakeup_fd)));
            borrow.enable_reading(wakeup_token);
        }

        let ctx = LoopCtx {
            inner: inner.clone(),
            shared: shared.clone(),
        };
        CURRENT.with(|current| {
            let mut slot = current.borrow_mut();
            assert!(slot.is_none(), "thread already owns an EventLoop");
            *slot = Some(ctx);
        });

        Ok(EventLoop { inner, shared })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run until [`LoopHandle::quit`].
    pub fn run(&self) {
        assert!(
            thread::current().id() == self.shared.thread_id,
            "EventLoop::run called off the owning thread"
        );
        tracing::debug!("event loop started");
        while !self.shared.quit.load(Ordering::Acquire) {
            self.tick();
        }
        tracing::debug!("event loop stopped");
    }

    /// One poll-dispatch-drain cycle.
    fn tick(&self) {
        let has_local_work = {
            !self.shared.ready.lock().unwrap().is_empty()
                || !self.shared.pending.lock().unwrap().is_empty()
        };
        let timeout = if has_local_work {
            Duration::ZERO
        } else {
            POLL_INTERVAL
        };

        let mut actions: Vec<Action> = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let mut events = std::mem::take(&mut inner.io_events);
            events.clear();
            if let Err(e) = inner.poller.poll(Some(timeout), &mut events) {
                tracing::error!(error = %e, "poll failed");
            }

            let mut orphaned = Vec::new();
            for &(token, revents) in &events {
                if let Some(channel) = inner.channels.get_mut(token) {
                    channel.set_revents(revents);
                    if channel.collect_actions(&mut actions) {
                        orphaned.push(token);
                    }
                }
            }
            // A readable fd with no consumer would be re-reported every
            // tick; drop its read interest until a reader registers again.
            for token in orphaned {
                inner.disable_reading(token);
            }
            inner.io_events = events;
        }

        for action in actions {
            match action {
                Action::Wake(waker) => waker.wake(),
                Action::Call(cb) => cb(),
            }
        }

        self.drain_pending();

        let ready: Vec<usize> = std::mem::take(&mut *self.shared.ready.lock().unwrap());
        let ctx = LoopCtx {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        };
        for task in ready {
            task::poll_task(&ctx, task);
        }
    }

    fn drain_pending(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        let pending: Vec<PendingTask> = std::mem::take(&mut *self.shared.pending.lock().unwrap());
        for f in pending {
            f();
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            let mut slot = current.borrow_mut();
            if let Some(ctx) = slot.as_ref() {
                if Rc::ptr_eq(&ctx.inner, &self.inner) {
                    *slot = None;
                }
            }
        });
    }
}

fn handle_timer_tick(inner: &Rc<RefCell<LoopInner>>) {
    let now = Instant::now();
    let mut expired = inner.borrow_mut().timers.take_expired(now);
    // Callbacks run with no borrow held so they can add or cancel timers.
    for timer in &mut expired {
        timer.run();
    }
    inner.borrow_mut().timers.restart(expired, now);
}

fn create_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn drain_eventfd(fd: RawFd) {
    let mut counter: u64 = 0;
    unsafe {
        libc::read(
            fd,
            &mut counter as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
}
