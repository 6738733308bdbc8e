//! The read and write interest sets handed to `select(2)`.

use std::{os::unix::io::RawFd, time::Duration};

use nix::{
    errno::Errno,
    sys::{
        select::{select, FdSet},
        time::{TimeVal, TimeValLike},
    },
};

/// Can `fd` be stored in an `fd_set` at all?
pub(crate) fn fits_fd_set(fd: RawFd) -> bool {
    fd >= 0 && (fd as usize) < libc::FD_SETSIZE
}

/// Which sockets the reactor is waiting on. After [`InterestSets::wait`]
/// returns, the same sets say which of them are ready.
pub struct InterestSets {
    read: FdSet,
    write: FdSet,
    max_fd: Option<RawFd>,
    /// Sockets with decrypted data already buffered, which count as readable
    /// whatever the kernel says.
    buffered: Vec<RawFd>,
}

impl Default for InterestSets {
    fn default() -> Self {
        Self::new()
    }
}

impl InterestSets {
    pub fn new() -> Self {
        Self {
            read: FdSet::new(),
            write: FdSet::new(),
            max_fd: None,
            buffered: Vec::new(),
        }
    }

    fn note(&mut self, fd: RawFd) {
        self.max_fd = Some(self.max_fd.map_or(fd, |max| max.max(fd)));
    }

    pub(crate) fn add_read(&mut self, fd: RawFd) {
        self.read.insert(fd);
        self.note(fd);
    }

    pub(crate) fn add_write(&mut self, fd: RawFd) {
        self.write.insert(fd);
        self.note(fd);
    }

    pub(crate) fn add_buffered(&mut self, fd: RawFd) {
        self.buffered.push(fd);
    }

    /// The highest descriptor in either set, as `select` wants for `nfds - 1`.
    pub fn max_fd(&self) -> Option<RawFd> {
        self.max_fd
    }

    /// Is there data waiting that doesn't need the kernel's say-so? If so
    /// the wait must not block.
    pub fn immediate(&self) -> bool {
        !self.buffered.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.max_fd.is_none() && self.buffered.is_empty()
    }

    pub fn is_readable(&self, fd: RawFd) -> bool {
        (fits_fd_set(fd) && self.read.contains(fd)) || self.buffered.contains(&fd)
    }

    pub fn is_writable(&self, fd: RawFd) -> bool {
        fits_fd_set(fd) && self.write.contains(fd)
    }

    /// Block until a socket is ready or `timeout` expires (`None` waits
    /// indefinitely). Returns the number of ready descriptors; an interrupted
    /// wait counts as nothing ready.
    pub fn wait(&mut self, timeout: Option<Duration>) -> nix::Result<usize> {
        let timeout = if self.immediate() { Some(Duration::ZERO) } else { timeout };
        let mut timeval = timeout.map(|t| TimeVal::microseconds(t.as_micros().min(i64::MAX as u128) as i64));
        let nfds = self.max_fd.map(|fd| fd + 1).unwrap_or(0);

        match select(nfds, &mut self.read, &mut self.write, None, timeval.as_mut()) {
            Ok(n) => Ok(n as usize),
            Err(Errno::EINTR) => {
                self.read.clear();
                self.write.clear();
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn writable_socket() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let mut sets = InterestSets::new();
        sets.add_read(fd);
        sets.add_write(fd);
        assert_eq!(sets.max_fd(), Some(fd));

        let ready = sets.wait(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(ready, 1);
        assert!(sets.is_writable(fd));
        assert!(!sets.is_readable(fd));
    }

    #[test]
    fn readable_socket() {
        use std::io::Write;

        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();

        let mut sets = InterestSets::new();
        sets.add_read(a.as_raw_fd());
        sets.wait(Some(Duration::from_millis(100))).unwrap();
        assert!(sets.is_readable(a.as_raw_fd()));
    }

    #[test]
    fn buffered_data_does_not_wait() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let mut sets = InterestSets::new();
        sets.add_read(fd);
        sets.add_buffered(fd);
        assert!(sets.immediate());

        let started = std::time::Instant::now();
        sets.wait(None).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(sets.is_readable(fd));
    }

    #[test]
    fn descriptor_limits() {
        assert!(fits_fd_set(0));
        assert!(!fits_fd_set(-1));
        assert!(!fits_fd_set(libc::FD_SETSIZE as RawFd));
    }
}
