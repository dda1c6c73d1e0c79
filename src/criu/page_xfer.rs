//! Page transfer: moving dumped pages into images, either directly or
//! through a remote page server.
//!
//! Dump code talks to a `PageXfer` only. `XferTarget::open_page_xfer`
//! decides once per destination whether that is a `LocalXfer` writing
//! pagemap/pages images, or a `RemoteXfer` streaming page server commands
//! into the process-wide connection.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

use crate::criu::image::{CrImg, ImageDir, O_DUMP};
use crate::criu::image_desc::CrFdType;
use crate::criu::options::XferOpts;
use crate::criu::page_pipe::PagePipe;
use crate::criu::pagemap::{pagemap_entry, Iovec, PAGE_SIZE};
use crate::criu::protobuf::pb_write_one;
use crate::criu::splice::{splice_exact, KernelSplice};
use crate::error::{Result, XferError};

/// Page server command: add pages.
pub const PS_IOV_ADD: u32 = 1;

pub const PS_TYPE_BITS: u32 = 4;
pub const PS_TYPE_MASK: u64 = (1 << PS_TYPE_BITS) - 1;

/// Packs an image kind and an object id into one destination id.
#[inline]
pub fn encode_pm_id(fd_type: u32, id: i64) -> u64 {
    debug_assert!((fd_type as u64) <= PS_TYPE_MASK);
    ((id as u64) << PS_TYPE_BITS) | (fd_type as u64 & PS_TYPE_MASK)
}

#[inline]
pub fn decode_pm_type(dst_id: u64) -> u32 {
    (dst_id & PS_TYPE_MASK) as u32
}

/// Arithmetic shift, so negative ids survive the trip.
#[inline]
pub fn decode_pm_id(dst_id: u64) -> i64 {
    (dst_id as i64) >> PS_TYPE_BITS
}

/// Page server command header. `nr_pages` pages of data follow it on the
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageServerIov {
    pub cmd: u32,
    pub nr_pages: u32,
    pub vaddr: u64,
    pub dst_id: u64,
}

impl PageServerIov {
    /// Wire size: 24 bytes, little-endian fields, no padding.
    pub const SIZE: usize = 24;

    pub fn add(dst_id: u64, iov: &Iovec) -> Result<Self> {
        let nr_pages = u32::try_from(iov.nr_pages()).map_err(|_| {
            XferError::Protocol(format!("too many pages at 0x{:x}: {}", iov.base, iov.nr_pages()))
        })?;

        Ok(PageServerIov {
            cmd: PS_IOV_ADD,
            nr_pages,
            vaddr: iov.base,
            dst_id,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.cmd.to_le_bytes());
        buf[4..8].copy_from_slice(&self.nr_pages.to_le_bytes());
        buf[8..16].copy_from_slice(&self.vaddr.to_le_bytes());
        buf[16..24].copy_from_slice(&self.dst_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[o..o + 8]);
            u64::from_le_bytes(b)
        };

        PageServerIov {
            cmd: u32_at(0),
            nr_pages: u32_at(4),
            vaddr: u64_at(8),
            dst_id: u64_at(16),
        }
    }

    pub fn len(&self) -> usize {
        self.nr_pages as usize * PAGE_SIZE
    }
}

/// Where dumped pages of one destination go.
pub trait PageXfer {
    /// Records that `iov` is present in the dump. Its bytes follow through
    /// `write_pages`.
    fn write_pagemap(&mut self, iov: &Iovec) -> Result<()>;
    /// Moves `len` bytes out of pipe `p`.
    fn write_pages(&mut self, p: RawFd, len: usize) -> Result<()>;
    /// Records that `iov` is unchanged since the parent snapshot.
    fn write_hole(&mut self, iov: &Iovec) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

fn closed() -> XferError {
    XferError::Config("page xfer is closed".to_string())
}

/// Writes pages into the local pagemap and pages images.
pub struct LocalXfer {
    pmi: Option<CrImg>,
    pi: Option<CrImg>,
    pi_fd: RawFd,
    pages_id: u32,
    fd_type: CrFdType,
    id: i64,
}

impl LocalXfer {
    pub fn open(dir: &ImageDir, fd_type: CrFdType, id: i64) -> Result<Self> {
        if !fd_type.is_pagemap() {
            return Err(XferError::Config(format!("{:?} is not a pagemap image", fd_type)));
        }

        let mut pmi = dir.open_image(fd_type, O_DUMP, id)?;
        let (pi, pages_id) = dir.open_pages_image(O_DUMP, &mut pmi)?;
        let pi_fd = pi.raw_fd().ok_or_else(|| {
            XferError::Config(format!("{} is buffered", pi.path.display()))
        })?;

        log::debug!("Opened {:?}/{} -> pages-{}", fd_type, id, pages_id);

        Ok(LocalXfer {
            pmi: Some(pmi),
            pi: Some(pi),
            pi_fd,
            pages_id,
            fd_type,
            id,
        })
    }

    pub fn pages_id(&self) -> u32 {
        self.pages_id
    }

    /// Pages image descriptor; page bytes are spliced straight into it.
    pub fn pages_fd(&self) -> Result<RawFd> {
        if self.pi.is_none() {
            return Err(closed());
        }
        Ok(self.pi_fd)
    }

    pub fn destination(&self) -> (CrFdType, i64) {
        (self.fd_type, self.id)
    }

    fn write_entry(&mut self, iov: &Iovec, hole: bool) -> Result<()> {
        let pmi = self.pmi.as_mut().ok_or_else(closed)?;
        pb_write_one(pmi, &pagemap_entry(iov, hole))
    }
}

impl PageXfer for LocalXfer {
    fn write_pagemap(&mut self, iov: &Iovec) -> Result<()> {
        self.write_entry(iov, false)
    }

    fn write_pages(&mut self, p: RawFd, len: usize) -> Result<()> {
        let fd = self.pages_fd()?;
        splice_exact(&mut KernelSplice, p, fd, len, "Can't put pages into file")
    }

    fn write_hole(&mut self, iov: &Iovec) -> Result<()> {
        self.write_entry(iov, true)
    }

    fn close(&mut self) -> Result<()> {
        self.pi = None;
        match self.pmi.take() {
            Some(pmi) => pmi.close(),
            None => Ok(()),
        }
    }
}

/// Streams pages to the page server over the shared connection.
pub struct RemoteXfer<'a> {
    sk: Option<&'a TcpStream>,
    dst_id: u64,
}

impl<'a> RemoteXfer<'a> {
    pub fn open(sk: &'a TcpStream, fd_type: CrFdType, id: i64) -> Self {
        RemoteXfer {
            sk: Some(sk),
            dst_id: encode_pm_id(fd_type as u32, id),
        }
    }

    pub fn dst_id(&self) -> u64 {
        self.dst_id
    }
}

impl PageXfer for RemoteXfer<'_> {
    fn write_pagemap(&mut self, iov: &Iovec) -> Result<()> {
        let mut sk = self.sk.ok_or_else(closed)?;
        let pi = PageServerIov::add(self.dst_id, iov)?;

        sk.write_all(&pi.to_bytes()).map_err(|e| {
            log::error!("Can't write pagemap to server: {}", e);
            XferError::Io(e)
        })
    }

    fn write_pages(&mut self, p: RawFd, len: usize) -> Result<()> {
        let sk = self.sk.ok_or_else(closed)?;

        log::debug!("Splicing {} bytes / {} pages into socket", len, len / PAGE_SIZE);
        splice_exact(&mut KernelSplice, p, sk.as_raw_fd(), len, "Can't write pages to socket")
    }

    fn write_hole(&mut self, _iov: &Iovec) -> Result<()> {
        log::error!("Writing holes to server not implemented.");
        Err(XferError::Unsupported("Writing holes to server"))
    }

    fn close(&mut self) -> Result<()> {
        // The connection is shared by all destinations and stays open
        self.sk = None;
        Ok(())
    }
}

/// Connects to the page server if the options ask for one.
pub fn connect_to_page_server(opts: &XferOpts) -> Result<Option<TcpStream>> {
    if !opts.use_page_server {
        return Ok(None);
    }

    let addr = opts.ps_addr()?;
    log::info!("Connecting to server {}:{}", addr.ip(), addr.port());

    let sk = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| XferError::Config(format!("Can't create socket: {}", e)))?;
    sk.connect(&SocketAddr::V4(addr).into())
        .map_err(|e| XferError::Config(format!("Can't connect to server {}: {}", addr, e)))?;

    Ok(Some(sk.into()))
}

/// Destination for one dump run: local images or a page server connection
/// shared by every transfer of the run.
pub enum XferTarget {
    Local(ImageDir),
    Remote(TcpStream),
}

impl XferTarget {
    pub fn from_opts(opts: &XferOpts) -> Result<Self> {
        match connect_to_page_server(opts)? {
            Some(sk) => Ok(XferTarget::Remote(sk)),
            None => Ok(XferTarget::Local(ImageDir::open(&opts.imgs_dir)?)),
        }
    }

    pub fn open_page_xfer(&self, fd_type: CrFdType, id: i64) -> Result<Box<dyn PageXfer + '_>> {
        match self {
            XferTarget::Local(dir) => Ok(Box::new(LocalXfer::open(dir, fd_type, id)?)),
            XferTarget::Remote(sk) => {
                if !fd_type.is_pagemap() {
                    return Err(XferError::Config(format!(
                        "{:?} is not a pagemap image",
                        fd_type
                    )));
                }
                Ok(Box::new(RemoteXfer::open(sk, fd_type, id)))
            }
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, XferTarget::Remote(_))
    }
}

/// Emits the pages of `pp` and its holes in ascending address order.
///
/// Page addresses are made relative to `off`. Both page iovecs and holes
/// must already be sorted. A remote `xfer` fails on the first hole.
pub fn dump_pages<X: PageXfer + ?Sized>(xfer: &mut X, pp: &PagePipe, off: u64) -> Result<()> {
    let mut holes = pp.holes.iter().peekable();

    for ppb in &pp.bufs {
        log::debug!("Dump pages {}/{}", ppb.pages_in, ppb.nr_segs());

        for iov in &ppb.iov {
            if iov.base < off {
                return Err(XferError::BadRange { addr: iov.base, off });
            }
            let iov = Iovec::new(iov.base - off, iov.len);

            while let Some(hole) = holes.next_if(|h| h.base < iov.base) {
                log::debug!("\th {:x} [{}]", hole.base, hole.nr_pages());
                xfer.write_hole(hole)?;
            }

            log::debug!("\t{:x} [{}]", iov.base, iov.nr_pages());
            xfer.write_pagemap(&iov)?;
            xfer.write_pages(ppb.read_fd(), iov.len as usize)?;
        }
    }

    for hole in holes {
        log::debug!("\th* {:x} [{}]", hole.base, hole.nr_pages());
        xfer.write_hole(hole)?;
    }

    Ok(())
}
