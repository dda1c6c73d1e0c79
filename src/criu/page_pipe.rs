//! Pages collected for dumping, staged in kernel pipes.
//!
//! A `PagePipe` is a list of buffers, each a pipe plus the iovecs whose
//! bytes it holds in order, and a separate list of holes (ranges that are
//! unchanged since the parent snapshot). Both lists are ascending.

use std::io;

use crate::criu::pagemap::{page_aligned, Iovec, PAGE_SIZE};
use crate::criu::splice::XferPipe;
use crate::criu::util::write_all;
use crate::error::{Result, XferError};

#[derive(Debug)]
pub struct PagePipeBuf {
    pipe: XferPipe,
    /// Pages queued into the pipe
    pub pages_in: usize,
    pub iov: Vec<Iovec>,
}

impl PagePipeBuf {
    fn new() -> Result<Self> {
        Ok(PagePipeBuf {
            pipe: XferPipe::new()?,
            pages_in: 0,
            iov: Vec::new(),
        })
    }

    /// Read end holding the bytes of `iov`.
    pub fn read_fd(&self) -> std::os::unix::io::RawFd {
        self.pipe.read_fd()
    }

    pub fn nr_segs(&self) -> usize {
        self.iov.len()
    }

    fn free_bytes(&self) -> usize {
        self.pipe.size().saturating_sub(self.pages_in * PAGE_SIZE)
    }
}

#[derive(Debug, Default)]
pub struct PagePipe {
    pub bufs: Vec<PagePipeBuf>,
    pub holes: Vec<Iovec>,
}

fn check_range(vaddr: u64, len: usize) -> Result<()> {
    if !page_aligned(vaddr) || len % PAGE_SIZE != 0 || len == 0 {
        return Err(XferError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unaligned range 0x{:x}/{}", vaddr, len),
        )));
    }
    Ok(())
}

impl PagePipe {
    pub fn new() -> Self {
        Self::default()
    }

    fn last_page_end(&self) -> Option<u64> {
        self.bufs
            .iter()
            .rev()
            .find_map(|b| b.iov.last())
            .map(Iovec::end)
    }

    /// Queues the contents of pages starting at `vaddr`. Pages must be added
    /// in ascending order. A run that does not fit in the current pipe is
    /// continued in a new one.
    pub fn add_pages(&mut self, vaddr: u64, data: &[u8]) -> Result<()> {
        check_range(vaddr, data.len())?;

        if let Some(end) = self.last_page_end() {
            if vaddr < end {
                return Err(XferError::BadRange { addr: vaddr, off: end });
            }
        }

        let mut vaddr = vaddr;
        let mut data = data;

        while !data.is_empty() {
            let need_new = match self.bufs.last() {
                Some(b) => b.free_bytes() < PAGE_SIZE,
                None => true,
            };
            if need_new {
                self.bufs.push(PagePipeBuf::new()?);
            }

            let nr = self.bufs.len() - 1;
            let Some(ppb) = self.bufs.last_mut() else {
                break;
            };

            let n = data.len().min(ppb.free_bytes() / PAGE_SIZE * PAGE_SIZE);
            write_all(ppb.pipe.write_fd(), &data[..n])?;

            let merged = match ppb.iov.last_mut() {
                Some(last) if last.end() == vaddr => {
                    last.len += n as u64;
                    true
                }
                _ => false,
            };
            if !merged {
                ppb.iov.push(Iovec::new(vaddr, n as u64));
            }
            ppb.pages_in += n / PAGE_SIZE;

            log::debug!("Add page {:x} [{}] into buf #{}", vaddr, n / PAGE_SIZE, nr);

            vaddr += n as u64;
            data = &data[n..];
        }

        Ok(())
    }

    /// Records `len` bytes at `vaddr` as present in the parent snapshot.
    pub fn add_hole(&mut self, vaddr: u64, len: usize) -> Result<()> {
        check_range(vaddr, len)?;

        if let Some(last) = self.holes.last_mut() {
            if vaddr < last.end() {
                return Err(XferError::BadRange {
                    addr: vaddr,
                    off: last.end(),
                });
            }
            if last.end() == vaddr {
                last.len += len as u64;
                return Ok(());
            }
        }

        self.holes.push(Iovec::new(vaddr, len as u64));

        Ok(())
    }

    pub fn nr_pages(&self) -> usize {
        self.bufs.iter().map(|b| b.pages_in).sum()
    }

    pub fn free_hole(&self) -> usize {
        self.holes.len()
    }
}
