//! Growable byte buffer with read/write cursors and vectored fill.
//!
//! Each connection owns two of these: one the read suspension points fill
//! from the socket, one the send path drains into it. The layout keeps a
//! small prepend zone in front of the readable range so a protocol layer can
//! stamp a header without shifting the payload.
//!
//! ```text
//! +-------------+------------------+------------------+
//! | prepend     |  readable bytes  |  writable bytes  |
//! +-------------+------------------+------------------+
//! 0         read_pos           write_pos         data.len()
//! ```
//!
//! Invariant: `0 <= PREPEND <= read_pos <= write_pos <= data.len()` (the
//! prepend zone may shrink below `PREPEND` only through explicit
//! `prepend()` calls).

use std::io;
use std::os::unix::io::RawFd;

/// Bytes reserved in front of the readable range.
pub const PREPEND_SIZE: usize = 8;

/// Initial writable capacity.
pub const INITIAL_SIZE: usize = 1024;

/// Stack scratch used by [`Buffer::fill_from`] so a single `readv` can
/// capture payloads larger than the current writable range.
const EXTRA_FILL_SIZE: usize = 65536;

/// Outcome of one vectored fill from a file descriptor.
#[derive(Debug)]
pub enum FillResult {
    /// `n` bytes were appended to the readable range.
    Read(usize),
    /// The peer closed the connection (zero-length read).
    Closed,
    /// The read failed; `WouldBlock` is transient, everything else is not.
    Error(io::Error),
}

pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: vec![0; PREPEND_SIZE + capacity],
            read_pos: PREPEND_SIZE,
            write_pos: PREPEND_SIZE,
        }
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes that can be appended without reallocating.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Bytes in front of the readable range (prepend zone plus anything
    /// already retrieved).
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// The readable range, without consuming it.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Advance the read cursor by `n` bytes. Retrieving more than is
    /// readable drains the buffer.
    pub fn retrieve(&mut self, n: usize) {
        if n < self.readable_bytes() {
            self.read_pos += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Drain the buffer, resetting both cursors to the prepend boundary.
    pub fn retrieve_all(&mut self) {
        self.read_pos = PREPEND_SIZE;
        self.write_pos = PREPEND_SIZE;
    }

    /// Drain the readable range into an owned byte vector.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let bytes = self.peek().to_vec();
        self.retrieve_all();
        bytes
    }

    /// Drain the readable range into a `String` (invalid UTF-8 is replaced).
    pub fn retrieve_all_as_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Append bytes to the writable range, growing or compacting as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// Stamp bytes immediately in front of the readable range.
    ///
    /// # Panics
    ///
    /// Panics if the prepend zone is smaller than `bytes`.
    pub fn prepend(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.prependable_bytes(),
            "prepend({}) exceeds prependable bytes ({})",
            bytes.len(),
            self.prependable_bytes()
        );
        self.read_pos -= bytes.len();
        self.data[self.read_pos..self.read_pos + bytes.len()].copy_from_slice(bytes);
    }

    /// Make room for at least `n` writable bytes.
    ///
    /// Compacts the readable range back to the prepend boundary when the
    /// space freed by earlier retrieves is enough, and reallocates
    /// otherwise.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        if self.prependable_bytes() + self.writable_bytes() >= n + PREPEND_SIZE {
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_pos..self.write_pos, PREPEND_SIZE);
            self.read_pos = PREPEND_SIZE;
            self.write_pos = PREPEND_SIZE + readable;
        } else {
            self.data.resize(self.write_pos + n, 0);
        }
    }

    /// Fill the buffer from `fd` with one vectored read.
    ///
    /// The syscall scatters into the writable range plus a stack scratch
    /// block; overflow into the scratch is appended afterwards, so one call
    /// captures payloads larger than the current capacity without a
    /// pre-grow.
    pub fn fill_from(&mut self, fd: RawFd) -> FillResult {
        let mut extra = [0u8; EXTRA_FILL_SIZE];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.data[self.write_pos..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let n = unsafe { libc::readv(fd, iov.as_ptr(), 2) };
        if n < 0 {
            return FillResult::Error(io::Error::last_os_error());
        }
        if n == 0 {
            return FillResult::Closed;
        }
        let n = n as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.data.len();
            self.append(&extra[..n - writable]);
        }
        FillResult::Read(n)
    }

    /// Write the readable range to `fd` and retrieve whatever was accepted.
    pub fn drain_to(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        if readable == 0 {
            return Ok(0);
        }
        let n = unsafe {
            libc::write(
                fd,
                self.data[self.read_pos..].as_ptr() as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.retrieve(n as usize);
        Ok(n as usize)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);

        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.peek(), b"hello");

        buf.retrieve(2);
        assert_eq!(buf.peek(), b"llo");
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE + 2);

        assert_eq!(buf.retrieve_all_as_string(), "llo");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);
    }

    #[test]
    fn test_retrieve_more_than_readable_drains() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(100);
        assert!(buf.is_empty());
        assert_eq!(buf.read_pos, PREPEND_SIZE);
    }

    #[test]
    fn test_grow() {
        let mut buf = Buffer::with_capacity(16);
        let chunk = vec![b'x'; 1000];
        buf.append(&chunk);
        assert_eq!(buf.readable_bytes(), 1000);
        assert_eq!(buf.peek(), &chunk[..]);
    }

    #[test]
    fn test_compact_instead_of_grow() {
        let mut buf = Buffer::with_capacity(64);
        buf.append(&[b'a'; 48]);
        buf.retrieve(40);
        // 8 readable, 16 writable, 48 retrieved: room for 40 more after
        // compaction without reallocating.
        let len_before = buf.data.len();
        buf.append(&[b'b'; 40]);
        assert_eq!(buf.data.len(), len_before);
        assert_eq!(buf.readable_bytes(), 48);
        assert_eq!(&buf.peek()[..8], &[b'a'; 8]);
        assert_eq!(&buf.peek()[8..], &[b'b'; 40]);
    }

    #[test]
    fn test_prepend() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(&buf.peek()[..4], &7u32.to_be_bytes());
        assert_eq!(&buf.peek()[4..], b"payload");
    }

    #[test]
    fn test_fill_from_pipe() {
        use std::os::unix::io::FromRawFd;

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut writer = unsafe { std::fs::File::from_raw_fd(fds[1]) };
        writer.write_all(b"over the wire").unwrap();

        let mut buf = Buffer::new();
        match buf.fill_from(fds[0]) {
            FillResult::Read(n) => assert_eq!(n, 13),
            other => panic!("unexpected fill result: {:?}", other),
        }
        assert_eq!(buf.retrieve_all_as_string(), "over the wire");

        drop(writer);
        match buf.fill_from(fds[0]) {
            FillResult::Closed => {}
            other => panic!("expected Closed, got {:?}", other),
        }
        unsafe { libc::close(fds[0]) };
    }

    #[test]
    fn test_fill_overflows_into_scratch() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let payload = vec![b'z'; 4000];
        let n = unsafe {
            libc::write(
                fds[1],
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(n, 4000);

        let mut buf = Buffer::with_capacity(16);
        match buf.fill_from(fds[0]) {
            FillResult::Read(n) => assert_eq!(n, 4000),
            other => panic!("unexpected fill result: {:?}", other),
        }
        assert_eq!(buf.readable_bytes(), 4000);
        assert_eq!(buf.peek(), &payload[..]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
