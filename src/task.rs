//! Detached tasks and the sleep suspension point.
//!
//! A task is a fire-and-forget suspendable routine: spawned onto the
//! calling thread's event loop, polled eagerly once, never yielding a
//! value. The future stays pinned to its loop for its whole life, so it
//! does not need to be `Send`; the waker, which may travel (a timer
//! callback created off-loop holds one), is a plain `Arc` that pushes the
//! task id onto the owning loop's ready queue and kicks its wakeup fd.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use crate::event_loop::{current_ctx, try_current_ctx, LoopCtx, LoopShared};
use crate::timer::{Timer, TimerId};

pub(crate) type LocalFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

struct TaskWaker {
    task: usize,
    shared: Arc<LoopShared>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.enqueue_ready(self.task);
    }
}

/// Spawn a detached routine on the calling thread's event loop.
///
/// The routine starts eagerly: it is polled once before `spawn` returns,
/// exactly like a coroutine body that runs to its first suspension point.
/// A panic inside it terminates the process.
///
/// # Panics
///
/// Panics when the calling thread does not own an [`crate::EventLoop`].
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    let ctx = current_ctx();
    let task = ctx.inner.borrow_mut().tasks.insert(Some(Box::pin(future)));
    poll_task(&ctx, task);
}

/// Poll one local task by id. Skips ids whose task already completed (a
/// stale wake) or is mid-poll (a wake from inside its own `poll`).
pub(crate) fn poll_task(ctx: &LoopCtx, task: usize) {
    let future = {
        let mut inner = ctx.inner.borrow_mut();
        match inner.tasks.get_mut(task) {
            Some(slot) => slot.take(),
            None => return,
        }
    };
    let Some(mut future) = future else {
        return;
    };

    let waker = Waker::from(Arc::new(TaskWaker {
        task,
        shared: ctx.shared.clone(),
    }));
    let mut cx = Context::from_waker(&waker);
    // The future is taken out of the table while polled, so a reentrant
    // wake cannot poll it recursively and spawn from inside it is fine.
    let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

    let mut inner = ctx.inner.borrow_mut();
    match polled {
        Ok(Poll::Ready(())) => {
            inner.tasks.remove(task);
        }
        Ok(Poll::Pending) => {
            if let Some(slot) = inner.tasks.get_mut(task) {
                *slot = Some(future);
            }
        }
        Err(payload) => {
            tracing::error!("panic in spawned task; aborting");
            drop(inner);
            drop(payload);
            std::process::abort();
        }
    }
}

/// Suspend the current routine for `duration`.
///
/// Backed by a one-shot timer on the owning loop; the zero-duration case
/// completes without suspending.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        state: None,
    }
}

struct SleepState {
    fired: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

pub struct Sleep {
    duration: Duration,
    state: Option<(Arc<SleepState>, TimerId)>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.duration.is_zero() {
            return Poll::Ready(());
        }
        match &this.state {
            None => {
                let state = Arc::new(SleepState {
                    fired: AtomicBool::new(false),
                    waker: Mutex::new(Some(cx.waker().clone())),
                });
                let state2 = state.clone();
                let timer = Timer::new(
                    Box::new(move || {
                        state2.fired.store(true, Ordering::Release);
                        if let Some(waker) = state2.waker.lock().unwrap().take() {
                            waker.wake();
                        }
                    }),
                    Instant::now() + this.duration,
                    None,
                );
                let id = current_ctx().inner.borrow_mut().timers.add(timer);
                this.state = Some((state, id));
                Poll::Pending
            }
            Some((state, _)) => {
                if state.fired.load(Ordering::Acquire) {
                    Poll::Ready(())
                } else {
                    *state.waker.lock().unwrap() = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some((state, id)) = self.state.take() {
            if !state.fired.load(Ordering::Acquire) {
                if let Some(ctx) = try_current_ctx() {
                    ctx.inner.borrow_mut().timers.cancel(id);
                }
            }
        }
    }
}
