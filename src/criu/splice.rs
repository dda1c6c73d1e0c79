//! Zero-copy movement of page data between descriptors.
//!
//! Pages never enter user memory: they go socket -> pipe -> image, or
//! pipe -> image, or pipe -> socket, by splice(2).

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::error::{Result, XferError};

/// The splice primitives the relay is built from.
pub trait SpliceOps {
    /// One splice(2) call. Returns the number of bytes moved, 0 at end of
    /// stream.
    fn splice(&mut self, fd_in: RawFd, fd_out: RawFd, len: usize, flags: libc::c_uint)
        -> io::Result<usize>;

    /// Waits until `fd` has data. Returns false on timeout.
    fn wait_readable(&mut self, fd: RawFd, timeout: Duration) -> io::Result<bool>;
}

/// SpliceOps backed by the real syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelSplice;

impl SpliceOps for KernelSplice {
    fn splice(
        &mut self,
        fd_in: RawFd,
        fd_out: RawFd,
        len: usize,
        flags: libc::c_uint,
    ) -> io::Result<usize> {
        loop {
            let ret = unsafe {
                libc::splice(fd_in, ptr::null_mut(), fd_out, ptr::null_mut(), len, flags)
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(ret as usize);
        }
    }

    fn wait_readable(&mut self, fd: RawFd, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(ret > 0);
        }
    }
}

/// Intermediate pipe used as splice staging.
#[derive(Debug)]
pub struct XferPipe {
    rd: OwnedFd,
    wr: OwnedFd,
    size: usize,
}

impl XferPipe {
    pub fn new() -> io::Result<Self> {
        let mut p = [-1 as RawFd; 2];
        if unsafe { libc::pipe2(p.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(p[0]), OwnedFd::from_raw_fd(p[1])) };

        let size = unsafe { libc::fcntl(rd.as_raw_fd(), libc::F_GETPIPE_SZ) };
        if size < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(XferPipe {
            rd,
            wr,
            size: size as usize,
        })
    }

    /// Resizes the pipe buffer. The kernel may round the size up.
    pub fn set_size(&mut self, size: usize) -> io::Result<usize> {
        let ret = unsafe {
            libc::fcntl(self.wr.as_raw_fd(), libc::F_SETPIPE_SZ, size as libc::c_int)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        self.size = ret as usize;
        Ok(self.size)
    }

    pub fn read_fd(&self) -> RawFd {
        self.rd.as_raw_fd()
    }

    pub fn write_fd(&self) -> RawFd {
        self.wr.as_raw_fd()
    }

    /// Negotiated buffer capacity in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Moves exactly `len` bytes in one blocking splice.
pub fn splice_exact<S: SpliceOps>(
    ops: &mut S,
    from: RawFd,
    to: RawFd,
    len: usize,
    what: &'static str,
) -> Result<()> {
    match ops.splice(from, to, len, libc::SPLICE_F_MOVE) {
        Ok(n) if n == len => Ok(()),
        Ok(n) => Err(XferError::Relay {
            what,
            expected: len,
            moved: n,
            source: None,
        }),
        Err(e) => Err(XferError::Relay {
            what,
            expected: len,
            moved: 0,
            source: Some(e),
        }),
    }
}

/// Relays `len` bytes from `src` (a socket) to `dst` through `pipe`.
///
/// Every chunk is at most the pipe capacity. The socket hop is
/// non-blocking: whatever it moves is drained to `dst` right away, and when
/// nothing is queued yet we wait up to `timeout` for the peer. The pipe to
/// `dst` hop must be length-exact. Returns the number of chunks moved.
pub fn relay<S: SpliceOps>(
    ops: &mut S,
    src: RawFd,
    pipe: &XferPipe,
    dst: RawFd,
    len: usize,
    timeout: Duration,
) -> Result<usize> {
    let mut left = len;
    let mut chunks = 0;

    while left > 0 {
        let want = left.min(pipe.size());

        let chunk = match ops.splice(
            src,
            pipe.write_fd(),
            want,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        ) {
            Ok(0) => {
                return Err(XferError::Relay {
                    what: "Can't read from socket (end of stream)",
                    expected: len,
                    moved: len - left,
                    source: None,
                });
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let ready = ops.wait_readable(src, timeout).map_err(|e| XferError::Relay {
                    what: "Can't wait for socket",
                    expected: len,
                    moved: len - left,
                    source: Some(e),
                })?;
                if !ready {
                    return Err(XferError::Relay {
                        what: "Timed out waiting for pages",
                        expected: len,
                        moved: len - left,
                        source: None,
                    });
                }
                continue;
            }
            Err(e) => {
                return Err(XferError::Relay {
                    what: "Can't read from socket",
                    expected: len,
                    moved: len - left,
                    source: Some(e),
                });
            }
        };

        splice_exact(ops, pipe.read_fd(), dst, chunk, "Partial image write")?;

        left -= chunk;
        chunks += 1;
    }

    Ok(chunks)
}
