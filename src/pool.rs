//! Pool of I/O event-loop threads fed round-robin by the base loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread::{Builder, JoinHandle};

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopHandle};

/// Base loop plus N worker threads, each running one [`EventLoop`].
///
/// With zero workers every connection shares the base loop (single-reactor
/// mode, as the acceptor does).
pub struct EventLoopPool {
    base: LoopHandle,
    name: String,
    num_threads: usize,
    next: AtomicUsize,
    workers: Vec<Worker>,
}

struct Worker {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopPool {
    pub fn new(base: LoopHandle, name: &str) -> Self {
        EventLoopPool {
            base,
            name: name.to_string(),
            num_threads: 0,
            next: AtomicUsize::new(0),
            workers: Vec::new(),
        }
    }

    /// Number of I/O loops to run in addition to the base loop. Must be set
    /// before [`EventLoopPool::start`].
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Spawn the worker threads. Each creates its loop on its own thread
    /// (the constructing thread owns a loop) and reports the handle back
    /// before entering the dispatch.
    pub fn start(&mut self) -> Result<()> {
        assert!(self.workers.is_empty(), "pool already started");
        for i in 0..self.num_threads {
            let thread_name = format!("{}-io-{}", self.name, i);
            let (tx, rx) = mpsc::channel();
            let thread = Builder::new()
                .name(thread_name)
                .spawn(move || {
                    let event_loop = match EventLoop::new() {
                        Ok(event_loop) => event_loop,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to create io loop");
                            return;
                        }
                    };
                    // A send can only fail if start() already gave up.
                    let _ = tx.send(event_loop.handle());
                    event_loop.run();
                })?;
            let handle = rx.recv().map_err(|_| Error::LoopStartup)?;
            self.workers.push(Worker {
                handle,
                thread: Some(thread),
            });
        }
        tracing::info!(name = %self.name, loops = self.num_threads, "event loop pool started");
        Ok(())
    }

    /// Next I/O loop, round-robin. Falls back to the base loop when the
    /// pool has no workers.
    pub fn get_next_loop(&self) -> LoopHandle {
        if self.workers.is_empty() {
            return self.base.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[i].handle.clone()
    }

    pub fn base_loop(&self) -> LoopHandle {
        self.base.clone()
    }
}

impl Drop for EventLoopPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.handle.quit();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    tracing::error!("io loop thread panicked");
                }
            }
        }
    }
}
