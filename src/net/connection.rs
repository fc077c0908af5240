//! Per-connection state and the per-connection suspension points.
//!
//! A `TcpConnection` is shared between the server's live map and every
//! session routine that holds it; its mutable state is only ever touched
//! from the owning I/O loop's thread. Each suspension point is a leaf
//! future whose `poll` implements the ready / suspend / resume triple:
//! skip-suspend test first, registration of the resumption trigger second,
//! result materialisation on the resuming poll. Every readiness test
//! short-circuits on a connection that is no longer connected, so a closed
//! connection never blocks its caller.

use std::fs::File;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::buffer::{Buffer, FillResult};
use crate::event_loop::{current_ctx, try_current_ctx, LoopHandle, LoopInner};
use crate::timer::TimerId;

const NO_TOKEN: usize = usize::MAX;

/// Invoked on the connection's I/O loop when it becomes connected and again
/// when it disconnects; `connected()` tells the two apart.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

pub(crate) type CloseCallback = Box<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

struct SendFileState {
    /// `None` once the transfer finished, failed or was cut short by a
    /// close; `sent` survives for the awaiter to collect.
    fd: Option<RawFd>,
    offset: i64,
    remaining: u64,
    sent: u64,
}

struct ConnInner {
    input: Buffer,
    output: Buffer,
    write_waker: Option<Waker>,
    /// Output-buffer level at which a back-pressured writer is resumed;
    /// zero means "resume only when empty".
    resume_threshold: usize,
    send_file: Option<SendFileState>,
}

pub struct TcpConnection {
    io_loop: LoopHandle,
    name: String,
    fd: OwnedFd,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    token: AtomicUsize,
    inner: Mutex<ConnInner>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    pub(crate) fn new(
        io_loop: LoopHandle,
        name: String,
        fd: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<Self> {
        tracing::debug!(name = %name, fd = fd.as_raw_fd(), "connection created");
        Arc::new(TcpConnection {
            io_loop,
            name,
            fd,
            local_addr,
            peer_addr,
            state: AtomicU8::new(State::Connecting as u8),
            token: AtomicUsize::new(NO_TOKEN),
            inner: Mutex::new(ConnInner {
                input: Buffer::new(),
                output: Buffer::new(),
                write_waker: None,
                resume_threshold: 0,
                send_file: None,
            }),
            connection_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Handle of the I/O loop this connection is pinned to.
    pub fn owner_loop(&self) -> LoopHandle {
        self.io_loop.clone()
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Bytes queued in the output buffer, not yet handed to the kernel.
    pub fn pending_output_bytes(&self) -> usize {
        self.inner.lock().unwrap().output.readable_bytes()
    }

    pub(crate) fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    // ---------------- suspension points ----------------

    /// Wait until the input buffer has bytes (or the connection is gone)
    /// and borrow it.
    ///
    /// The returned buffer may be empty: that is how the caller observes
    /// EOF after a peer close. A typical session loops on
    /// `conn.read().await` until `readable_bytes() == 0` with the
    /// connection disconnected.
    pub fn read(self: &Arc<Self>) -> Read<'_> {
        Read {
            conn: self,
            registered: false,
        }
    }

    /// Like [`TcpConnection::read`], but racing a timer: resolves with
    /// `timed_out == true` and the (empty or current) input buffer when no
    /// data arrived within `timeout`.
    pub fn read_with_timeout(self: &Arc<Self>, timeout: Duration) -> ReadWithTimeout<'_> {
        ReadWithTimeout {
            conn: self,
            timeout,
            race: None,
            completed: false,
        }
    }

    /// Wait until the output buffer is fully drained to the kernel.
    pub fn drain(self: &Arc<Self>) -> Drain<'_> {
        Drain {
            conn: self,
            registered: false,
            completed: false,
        }
    }

    /// Back-pressured write: suspends while the output buffer holds
    /// `high_water_mark` bytes or more, resuming once it has drained to
    /// half the mark, then appends `data` through the ordinary send path.
    ///
    /// Returns the number of bytes *accepted* — the full input length once
    /// every byte has reached the output buffer (or been written directly),
    /// or 0 when the connection is no longer connected. Delivery to the
    /// wire is observable via [`TcpConnection::drain`], not via this return
    /// value.
    pub fn write<'a>(self: &'a Arc<Self>, data: &'a [u8], high_water_mark: usize) -> Write<'a> {
        Write {
            conn: self,
            data,
            high_water_mark,
            registered: false,
            completed: false,
        }
    }

    /// Copy `count` bytes of `file` starting at `offset` to the socket
    /// in-kernel, bypassing the output buffer. Resolves with the number of
    /// bytes actually sent; a fatal transfer error or a close cuts the
    /// count short.
    pub fn send_file<'a>(
        self: &'a Arc<Self>,
        file: &'a File,
        offset: u64,
        count: u64,
    ) -> SendFile<'a> {
        SendFile {
            conn: self,
            file,
            offset,
            count,
            registered: false,
            completed: false,
        }
    }

    // ---------------- non-suspending surface ----------------

    /// Queue bytes for delivery without suspending.
    ///
    /// On the owning loop's thread this writes directly to the socket and
    /// buffers whatever the kernel did not take; from any other thread the
    /// call is marshalled onto the owning loop. A no-op once the connection
    /// is no longer connected.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.io_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let owned = data.to_vec();
            self.io_loop.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Half-close the write side once the output buffer drains.
    pub fn shutdown(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = self.clone();
            self.io_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    // ---------------- lifecycle (loop thread only) ----------------

    /// Connecting -> Connected; registers the channel and invokes the user
    /// connection callback. Runs on the owning loop.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        assert!(self.io_loop.is_in_loop_thread());
        self.set_state(State::Connected);

        let token = {
            let ctx = current_ctx();
            let mut inner = ctx.inner.borrow_mut();
            let token = inner.create_channel(self.fd.as_raw_fd());

            // The weak tie: each callback holds the connection weakly and
            // the upgrade keeps it alive through one dispatch.
            let weak = Arc::downgrade(self);
            inner.set_write_callback(
                token,
                Rc::new({
                    let weak = weak.clone();
                    move || {
                        if let Some(conn) = weak.upgrade() {
                            conn.handle_write();
                        }
                    }
                }),
            );
            inner.set_close_callback(
                token,
                Rc::new({
                    let weak = weak.clone();
                    move || {
                        if let Some(conn) = weak.upgrade() {
                            conn.handle_close();
                        }
                    }
                }),
            );
            inner.set_error_callback(
                token,
                Rc::new(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_error();
                    }
                }),
            );
            inner.enable_reading(token);
            token
        };
        self.token.store(token, Ordering::Release);

        tracing::info!(name = %self.name, peer = %self.peer_addr, "connection up");
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(self);
        }
    }

    /// Final teardown, queued on the owning loop by the server once the
    /// connection left the live map. Also covers the server-drop path where
    /// the close sequence never ran.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        assert!(self.io_loop.is_in_loop_thread());
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.with_loop(|inner, token| inner.disable_all(token));
            if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                cb(self);
            }
        }
        let token = self.token.swap(NO_TOKEN, Ordering::AcqRel);
        if token != NO_TOKEN {
            if let Some(ctx) = try_current_ctx() {
                ctx.inner.borrow_mut().remove_channel(token);
            }
        }
        tracing::debug!(name = %self.name, "connection destroyed");
    }

    // ---------------- event handlers (loop thread only) ----------------

    /// Close sequence: terminal state, interest teardown, waiter fan-out,
    /// then the user callbacks. Every suspended handle is resumed exactly
    /// once; later `send` calls become no-ops because `connected()` is
    /// false.
    pub(crate) fn handle_close(self: &Arc<Self>) {
        let previous = self.state.swap(State::Disconnected as u8, Ordering::AcqRel);
        if State::from_u8(previous) == State::Disconnected {
            return;
        }
        tracing::info!(name = %self.name, "connection down");

        let (reader, read_resume) = self
            .with_loop(|inner, token| {
                inner.disable_all(token);
                (inner.take_reader(token), inner.take_read_resume(token))
            })
            .unwrap_or((None, None));
        // A suspended reader observes the zero-length input; a pending
        // timed read resolves through its own single-resume race.
        if let Some(waker) = reader {
            waker.wake();
        }
        if let Some(cb) = read_resume {
            cb();
        }

        let writer = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(send_file) = inner.send_file.as_mut() {
                send_file.fd = None;
                send_file.remaining = 0;
            }
            inner.resume_threshold = 0;
            inner.write_waker.take()
        };
        if let Some(waker) = writer {
            waker.wake();
        }

        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(self);
        }
        if let Some(cb) = self.close_cb.lock().unwrap().as_ref() {
            cb(self);
        }
    }

    /// Write-ready tick: advance a pending sendfile, else drain the output
    /// buffer, resuming the suspended writer at its threshold.
    fn handle_write(&self) {
        let is_writing = self
            .with_loop(|inner, token| inner.is_writing(token))
            .unwrap_or(false);
        if !is_writing {
            tracing::trace!(name = %self.name, "write-ready on idle channel, ignoring");
            return;
        }

        let mut inner = self.inner.lock().unwrap();

        let active_file = inner.send_file.as_ref().and_then(|sf| sf.fd);
        if let Some(file_fd) = active_file {
            let result = {
                let state = inner.send_file.as_mut().unwrap();
                sendfile_once(self.fd.as_raw_fd(), file_fd, state)
            };
            let remaining = inner.send_file.as_ref().map_or(0, |sf| sf.remaining);
            match result {
                Ok(_) if remaining == 0 => {
                    if let Some(sf) = inner.send_file.as_mut() {
                        sf.fd = None;
                    }
                    let waker = inner.write_waker.take();
                    drop(inner);
                    self.with_loop(|l, t| l.disable_writing(t));
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
                Ok(_) => {} // partial progress, stay armed
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::error!(name = %self.name, error = %e, "sendfile failed");
                    if let Some(sf) = inner.send_file.as_mut() {
                        sf.fd = None;
                    }
                    let waker = inner.write_waker.take();
                    drop(inner);
                    self.with_loop(|l, t| l.disable_writing(t));
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                }
            }
            return;
        }

        match inner.output.drain_to(self.fd.as_raw_fd()) {
            Ok(n) if n > 0 => {
                let remaining = inner.output.readable_bytes();
                let threshold = inner.resume_threshold;
                let should_resume = if threshold > 0 {
                    remaining <= threshold
                } else {
                    remaining == 0
                };
                let waker = if should_resume {
                    inner.resume_threshold = 0;
                    inner.write_waker.take()
                } else {
                    None
                };
                drop(inner);
                if remaining == 0 {
                    self.with_loop(|l, t| l.disable_writing(t));
                }
                if let Some(waker) = waker {
                    waker.wake();
                }
                if remaining == 0 && self.state() == State::Disconnecting {
                    self.shutdown_in_loop();
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::error!(name = %self.name, error = %e, "drain to socket failed");
            }
        }
    }

    fn handle_error(&self) {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        let err = if rc < 0 {
            io::Error::last_os_error()
        } else {
            io::Error::from_raw_os_error(err)
        };
        tracing::error!(name = %self.name, error = %err, "socket error");
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        assert!(self.io_loop.is_in_loop_thread());
        if self.state() == State::Disconnected {
            tracing::warn!(name = %self.name, "disconnected, giving up writing");
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        let is_writing = self
            .with_loop(|l, t| l.is_writing(t))
            .unwrap_or(false);

        let mut written = 0usize;
        let mut fault = false;
        if !is_writing && inner.output.readable_bytes() == 0 {
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n >= 0 {
                written = n as usize;
            } else {
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::WouldBlock {
                    tracing::error!(name = %self.name, error = %e, "send failed");
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && written < data.len() {
            inner.output.append(&data[written..]);
            drop(inner);
            self.with_loop(|l, t| l.enable_writing(t));
        }
    }

    fn shutdown_in_loop(&self) {
        assert!(self.io_loop.is_in_loop_thread());
        let is_writing = self
            .with_loop(|l, t| l.is_writing(t))
            .unwrap_or(false);
        if !is_writing {
            // Output fully flushed: close our write side, the peer will
            // observe EOF and the read side stays open for its last words.
            if unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_WR) } < 0 {
                tracing::error!(name = %self.name, error = %io::Error::last_os_error(), "shutdown failed");
            }
        }
    }

    // ---------------- helpers ----------------

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn token(&self) -> usize {
        self.token.load(Ordering::Acquire)
    }

    /// Run `f` against the owning loop's registry. `None` when the channel
    /// is not (or no longer) registered.
    fn with_loop<R>(&self, f: impl FnOnce(&mut LoopInner, usize) -> R) -> Option<R> {
        let token = self.token();
        if token == NO_TOKEN {
            return None;
        }
        debug_assert!(self.io_loop.is_in_loop_thread());
        let ctx = try_current_ctx()?;
        let mut inner = ctx.inner.borrow_mut();
        Some(f(&mut inner, token))
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        tracing::debug!(name = %self.name, "connection dropped");
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

fn sendfile_once(
    socket_fd: RawFd,
    file_fd: RawFd,
    state: &mut SendFileState,
) -> io::Result<usize> {
    let chunk = state.remaining.min(usize::MAX as u64) as usize;
    let n = unsafe { libc::sendfile(socket_fd, file_fd, &mut state.offset, chunk) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    state.remaining -= n as u64;
    state.sent += n as u64;
    Ok(n as usize)
}

// ---------------- the input-buffer handle ----------------

/// Exclusive view of a connection's input buffer, detached for the
/// caller's use and reattached on drop.
///
/// Detaching (rather than holding the connection lock) keeps the handle
/// deadlock-free: the session can call `send`, `shutdown` or another
/// suspension point while it still holds the buffer. Bytes left unread are
/// spliced back in front of anything that arrived in the meantime.
pub struct InputBuf<'a> {
    conn: &'a TcpConnection,
    buf: Buffer,
}

impl<'a> InputBuf<'a> {
    fn detach(conn: &'a TcpConnection) -> Self {
        let buf = std::mem::take(&mut conn.inner.lock().unwrap().input);
        InputBuf { conn, buf }
    }
}

impl Deref for InputBuf<'_> {
    type Target = Buffer;
    fn deref(&self) -> &Buffer {
        &self.buf
    }
}

impl DerefMut for InputBuf<'_> {
    fn deref_mut(&mut self) -> &mut Buffer {
        &mut self.buf
    }
}

impl Drop for InputBuf<'_> {
    fn drop(&mut self) {
        if self.buf.readable_bytes() == 0 {
            return;
        }
        let mut inner = self.conn.inner.lock().unwrap();
        let arrived_meanwhile = std::mem::replace(&mut inner.input, std::mem::take(&mut self.buf));
        if arrived_meanwhile.readable_bytes() > 0 {
            inner.input.append(arrived_meanwhile.peek());
        }
    }
}

// ---------------- read ----------------

pub struct Read<'a> {
    conn: &'a Arc<TcpConnection>,
    registered: bool,
}

impl<'a> Future for Read<'a> {
    type Output = InputBuf<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<InputBuf<'a>> {
        let this = self.get_mut();
        let conn = this.conn;

        if !this.registered {
            if !conn.connected() {
                return Poll::Ready(InputBuf::detach(conn));
            }
            if conn.inner.lock().unwrap().input.readable_bytes() > 0 {
                return Poll::Ready(InputBuf::detach(conn));
            }
            conn.with_loop(|inner, token| {
                inner.set_reader(token, cx.waker().clone());
                inner.enable_reading(token);
            });
            this.registered = true;
            return Poll::Pending;
        }

        // Resumed by a readable tick, a hangup, or the close fan-out.
        if !conn.connected() {
            this.registered = false;
            return Poll::Ready(InputBuf::detach(conn));
        }
        let filled = {
            let mut inner = conn.inner.lock().unwrap();
            inner.input.fill_from(conn.raw_fd())
        };
        match filled {
            FillResult::Read(_) => {}
            FillResult::Closed => {
                conn.handle_close();
            }
            FillResult::Error(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Level-triggered spurious wake; park again.
                conn.with_loop(|inner, token| {
                    inner.set_reader(token, cx.waker().clone());
                    inner.enable_reading(token);
                });
                return Poll::Pending;
            }
            FillResult::Error(e) => {
                tracing::error!(name = %conn.name, error = %e, "read failed");
                conn.handle_error();
            }
        }
        conn.with_loop(|inner, token| inner.clear_reader(token));
        this.registered = false;
        Poll::Ready(InputBuf::detach(conn))
    }
}

impl Drop for Read<'_> {
    fn drop(&mut self) {
        if self.registered {
            self.conn.with_loop(|inner, token| inner.clear_reader(token));
        }
    }
}

// ---------------- read with timeout ----------------

/// Shared single-resume coordinator between the read event and the timer.
///
/// Whichever side wins the compare-and-swap resumes the caller exactly
/// once; the loser observes `resumed` already set and backs off. The
/// winner also tears down the loser's trigger (timer cancellation, or
/// side-channel clearing).
struct RaceState {
    resumed: AtomicBool,
    timed_out: AtomicBool,
    waker: Mutex<Option<Waker>>,
    timer: Mutex<Option<TimerId>>,
}

pub struct ReadWithTimeout<'a> {
    conn: &'a Arc<TcpConnection>,
    timeout: Duration,
    race: Option<Arc<RaceState>>,
    completed: bool,
}

impl<'a> Future for ReadWithTimeout<'a> {
    type Output = (InputBuf<'a>, bool);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<(InputBuf<'a>, bool)> {
        let this = self.get_mut();
        let conn = this.conn;

        let Some(race) = this.race.clone() else {
            if !conn.connected() || conn.inner.lock().unwrap().input.readable_bytes() > 0 {
                this.completed = true;
                return Poll::Ready((InputBuf::detach(conn), false));
            }

            let race = Arc::new(RaceState {
                resumed: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                waker: Mutex::new(Some(cx.waker().clone())),
                timer: Mutex::new(None),
            });

            let timer_id = {
                let race = Arc::downgrade(&race);
                let weak_conn = Arc::downgrade(conn);
                conn.io_loop.run_after(this.timeout, move || {
                    let Some(race) = race.upgrade() else { return };
                    if race
                        .resumed
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        race.timed_out.store(true, Ordering::Release);
                        if let Some(conn) = weak_conn.upgrade() {
                            conn.with_loop(|inner, token| inner.clear_read_resume(token));
                        }
                        if let Some(waker) = race.waker.lock().unwrap().take() {
                            waker.wake();
                        }
                    }
                })
            };
            *race.timer.lock().unwrap() = Some(timer_id);

            {
                let race_cb = Arc::downgrade(&race);
                let weak_conn = Arc::downgrade(conn);
                conn.with_loop(|inner, token| {
                    inner.set_read_resume(
                        token,
                        Rc::new(move || {
                            let Some(race) = race_cb.upgrade() else { return };
                            if race
                                .resumed
                                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                                .is_ok()
                            {
                                if let Some(conn) = weak_conn.upgrade() {
                                    if let Some(id) = race.timer.lock().unwrap().take() {
                                        conn.io_loop.cancel(id);
                                    }
                                }
                                if let Some(waker) = race.waker.lock().unwrap().take() {
                                    waker.wake();
                                }
                            }
                        }),
                    );
                    inner.enable_reading(token);
                });
            }

            this.race = Some(race);
            return Poll::Pending;
        };

        if !race.resumed.load(Ordering::Acquire) {
            // Spurious poll before either side of the race fired.
            *race.waker.lock().unwrap() = Some(cx.waker().clone());
            return Poll::Pending;
        }

        conn.with_loop(|inner, token| inner.clear_read_resume(token));
        this.completed = true;

        if race.timed_out.load(Ordering::Acquire) {
            return Poll::Ready((InputBuf::detach(conn), true));
        }

        if !conn.connected() {
            return Poll::Ready((InputBuf::detach(conn), false));
        }
        let filled = {
            let mut inner = conn.inner.lock().unwrap();
            inner.input.fill_from(conn.raw_fd())
        };
        match filled {
            FillResult::Read(_) => {}
            FillResult::Closed => conn.handle_close(),
            FillResult::Error(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            FillResult::Error(e) => {
                tracing::error!(name = %conn.name, error = %e, "timed read failed");
                conn.handle_error();
            }
        }
        Poll::Ready((InputBuf::detach(conn), false))
    }
}

impl Drop for ReadWithTimeout<'_> {
    fn drop(&mut self) {
        let Some(race) = self.race.take() else { return };
        if self.completed {
            return;
        }
        // Cancelled mid-suspension: win the race so neither trigger can
        // wake a dead waiter, then tear both triggers down.
        if race
            .resumed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(id) = race.timer.lock().unwrap().take() {
                self.conn.io_loop.cancel(id);
            }
            self.conn
                .with_loop(|inner, token| inner.clear_read_resume(token));
        }
    }
}

// ---------------- drain ----------------

pub struct Drain<'a> {
    conn: &'a Arc<TcpConnection>,
    registered: bool,
    completed: bool,
}

impl Future for Drain<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let conn = this.conn;

        if !this.registered {
            if !conn.connected() || conn.inner.lock().unwrap().output.readable_bytes() == 0 {
                this.completed = true;
                return Poll::Ready(());
            }
            conn.inner.lock().unwrap().write_waker = Some(cx.waker().clone());
            conn.with_loop(|inner, token| inner.enable_writing(token));
            this.registered = true;
            return Poll::Pending;
        }

        let mut inner = conn.inner.lock().unwrap();
        if inner.write_waker.is_some() {
            // Spurious poll; the write-ready handler has not resumed us.
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        drop(inner);
        this.completed = true;
        Poll::Ready(())
    }
}

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        if self.registered && !self.completed {
            self.conn.inner.lock().unwrap().write_waker = None;
        }
    }
}

// ---------------- write (back-pressured) ----------------

pub struct Write<'a> {
    conn: &'a Arc<TcpConnection>,
    data: &'a [u8],
    high_water_mark: usize,
    registered: bool,
    completed: bool,
}

impl Future for Write<'_> {
    type Output = usize;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<usize> {
        let this = self.get_mut();
        let conn = this.conn;

        if !this.registered {
            if !conn.connected() {
                this.completed = true;
                return Poll::Ready(0);
            }
            let below_mark =
                conn.inner.lock().unwrap().output.readable_bytes() < this.high_water_mark;
            if below_mark {
                this.completed = true;
                conn.send_in_loop(this.data);
                return Poll::Ready(this.data.len());
            }
            {
                let mut inner = conn.inner.lock().unwrap();
                // Hysteresis: resume at half the mark so the writer does
                // not oscillate between suspend and resume.
                inner.resume_threshold = this.high_water_mark / 2;
                inner.write_waker = Some(cx.waker().clone());
            }
            conn.with_loop(|inner, token| inner.enable_writing(token));
            this.registered = true;
            return Poll::Pending;
        }

        {
            let mut inner = conn.inner.lock().unwrap();
            if inner.write_waker.is_some() {
                inner.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
        }
        this.completed = true;
        if !conn.connected() {
            return Poll::Ready(0);
        }
        conn.send_in_loop(this.data);
        Poll::Ready(this.data.len())
    }
}

impl Drop for Write<'_> {
    fn drop(&mut self) {
        if self.registered && !self.completed {
            let mut inner = self.conn.inner.lock().unwrap();
            inner.write_waker = None;
            inner.resume_threshold = 0;
        }
    }
}

// ---------------- sendfile ----------------

pub struct SendFile<'a> {
    conn: &'a Arc<TcpConnection>,
    file: &'a File,
    offset: u64,
    count: u64,
    registered: bool,
    completed: bool,
}

impl Future for SendFile<'_> {
    type Output = u64;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u64> {
        let this = self.get_mut();
        let conn = this.conn;

        if !this.registered {
            if this.count == 0 || !conn.connected() {
                this.completed = true;
                return Poll::Ready(0);
            }

            let mut inner = conn.inner.lock().unwrap();
            inner.send_file = Some(SendFileState {
                fd: Some(this.file.as_raw_fd()),
                offset: this.offset as i64,
                remaining: this.count,
                sent: 0,
            });
            inner.write_waker = Some(cx.waker().clone());

            let idle = !conn
                .with_loop(|l, t| l.is_writing(t))
                .unwrap_or(false)
                && inner.output.readable_bytes() == 0;
            if idle {
                // Try the in-kernel copy right away; small files finish
                // without ever arming write interest.
                let result = {
                    let state = inner.send_file.as_mut().unwrap();
                    sendfile_once(conn.raw_fd(), this.file.as_raw_fd(), state)
                };
                let remaining = inner.send_file.as_ref().map_or(0, |sf| sf.remaining);
                match result {
                    Ok(_) if remaining == 0 => {
                        let sent = inner.send_file.take().map(|s| s.sent).unwrap_or(0);
                        inner.write_waker = None;
                        this.completed = true;
                        return Poll::Ready(sent);
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        tracing::error!(name = %conn.name, error = %e, "sendfile failed");
                        let sent = inner.send_file.take().map(|s| s.sent).unwrap_or(0);
                        inner.write_waker = None;
                        this.completed = true;
                        return Poll::Ready(sent);
                    }
                }
            }
            drop(inner);
            conn.with_loop(|inner, token| inner.enable_writing(token));
            this.registered = true;
            return Poll::Pending;
        }

        let mut inner = conn.inner.lock().unwrap();
        if inner.write_waker.is_some() {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let sent = inner.send_file.take().map(|s| s.sent).unwrap_or(0);
        drop(inner);
        this.completed = true;
        Poll::Ready(sent)
    }
}

impl Drop for SendFile<'_> {
    fn drop(&mut self) {
        if self.registered && !self.completed {
            let mut inner = self.conn.inner.lock().unwrap();
            inner.send_file = None;
            inner.write_waker = None;
        }
    }
}
