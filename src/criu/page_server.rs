//! The page server: receives pages over TCP and writes them into local
//! pagemap/pages images.
//!
//! It serves a single peer. Commands name their destination; consecutive
//! commands for the same destination share one open `LocalXfer`, and a new
//! destination closes the previous one first.

use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::criu::image::ImageDir;
use crate::criu::image_desc::CrFdType;
use crate::criu::options::XferOpts;
use crate::criu::page_xfer::{
    decode_pm_id, decode_pm_type, LocalXfer, PageServerIov, PageXfer, PS_IOV_ADD,
};
use crate::criu::pagemap::{Iovec, PAGE_SIZE};
use crate::criu::splice::{relay, KernelSplice, XferPipe};
use crate::criu::util::read_all;
use crate::error::{Result, XferError};

/// Counters for one page server session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    /// Commands handled
    pub commands: u64,
    pub pages: u64,
    /// Destinations opened
    pub switches: u64,
}

/// Receiving side state. At most one destination is open.
pub struct PageXferJob<'a> {
    dir: &'a ImageDir,
    dst_id: Option<u64>,
    pipe: XferPipe,
    loc_xfer: Option<LocalXfer>,
    timeout: Duration,
    stats: ServerStats,
}

impl<'a> PageXferJob<'a> {
    pub fn new(dir: &'a ImageDir, timeout: Duration) -> Result<Self> {
        let pipe = XferPipe::new()?;
        log::debug!("Created xfer pipe size {}", pipe.size());

        Ok(PageXferJob {
            dir,
            dst_id: None,
            pipe,
            loc_xfer: None,
            timeout,
            stats: ServerStats::default(),
        })
    }

    fn close_current(&mut self) -> Result<()> {
        self.dst_id = None;
        match self.loc_xfer.take() {
            Some(mut x) => x.close(),
            None => Ok(()),
        }
    }

    fn switch_to(&mut self, dst_id: u64) -> Result<&mut LocalXfer> {
        if self.dst_id != Some(dst_id) || self.loc_xfer.is_none() {
            self.close_current()?;

            let raw = decode_pm_type(dst_id);
            let fd_type = CrFdType::from_raw(raw)
                .filter(|t| t.is_pagemap())
                .ok_or_else(|| {
                    XferError::Protocol(format!("bad destination kind {} in 0x{:x}", raw, dst_id))
                })?;
            let id = decode_pm_id(dst_id);

            log::debug!("Switching xfer to {:?}/{}", fd_type, id);

            self.loc_xfer = Some(LocalXfer::open(self.dir, fd_type, id)?);
            self.dst_id = Some(dst_id);
            self.stats.switches += 1;
        }

        self.loc_xfer
            .as_mut()
            .ok_or_else(|| XferError::Protocol("no open destination".to_string()))
    }

    /// Handles one add command: records the range and relays its bytes
    /// from `sk` into the pages image.
    pub fn add(&mut self, sk: &TcpStream, pi: &PageServerIov) -> Result<()> {
        log::debug!("Adding {:x}/{}", pi.vaddr, pi.nr_pages);

        let timeout = self.timeout;
        let len = pi.len();
        let iov = Iovec::from_pages(pi.vaddr, pi.nr_pages as u64);

        let lxfer = self.switch_to(pi.dst_id)?;
        lxfer.write_pagemap(&iov)?;
        let pages_fd = lxfer.pages_fd()?;

        relay(&mut KernelSplice, sk.as_raw_fd(), &self.pipe, pages_fd, len, timeout)?;

        self.stats.commands += 1;
        self.stats.pages += pi.nr_pages as u64;
        Ok(())
    }

    pub fn finish(mut self) -> Result<ServerStats> {
        self.close_current()?;
        Ok(self.stats)
    }
}

/// Serves commands from `sk` until the peer closes the connection.
pub fn page_server_serve(sk: &TcpStream, dir: &ImageDir, timeout: Duration) -> Result<ServerStats> {
    let mut job = PageXferJob::new(dir, timeout)?;

    loop {
        let mut buf = [0u8; PageServerIov::SIZE];
        let ret = read_all(&mut &*sk, &mut buf).map_err(|e| {
            log::error!("Can't read pagemap from socket: {}", e);
            XferError::Io(e)
        })?;

        if ret == 0 {
            break;
        }
        if ret != PageServerIov::SIZE {
            return Err(XferError::Protocol(format!(
                "Can't read pagemap from socket: got {} of {} bytes",
                ret,
                PageServerIov::SIZE
            )));
        }

        let pi = PageServerIov::from_bytes(&buf);
        match pi.cmd {
            PS_IOV_ADD => job.add(sk, &pi)?,
            cmd => {
                log::error!("Unknown command {}", cmd);
                return Err(XferError::Protocol(format!("Unknown command {}", cmd)));
            }
        }
    }

    let stats = job.finish()?;
    log::info!(
        "Session over: {} commands, {} pages ({} bytes), {} destinations",
        stats.commands,
        stats.pages,
        stats.pages * PAGE_SIZE as u64,
        stats.switches
    );
    Ok(stats)
}

/// Listening socket of the page server.
pub struct PageServer {
    listener: TcpListener,
}

impl PageServer {
    pub fn bind(addr: SocketAddrV4) -> Result<Self> {
        let setup = |e: std::io::Error| XferError::Config(format!("Can't listen on {}: {}", addr, e));

        let sk = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(setup)?;
        sk.set_reuse_address(true).map_err(setup)?;
        sk.bind(&SocketAddr::V4(addr).into()).map_err(setup)?;
        sk.listen(1).map_err(setup)?;

        Ok(PageServer {
            listener: sk.into(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Takes the one peer. The listener is closed afterwards.
    pub fn accept(self) -> Result<(TcpStream, SocketAddr)> {
        let (sk, peer) = self
            .listener
            .accept()
            .map_err(|e| XferError::Config(format!("Can't accept connection: {}", e)))?;

        log::info!("Accepted connection from {}:{}", peer.ip(), peer.port());
        Ok((sk, peer))
    }

    pub fn serve(self, dir: &ImageDir, timeout: Duration) -> Result<ServerStats> {
        let (sk, _) = self.accept()?;
        page_server_serve(&sk, dir, timeout)
    }
}

/// Runs a page server session as configured by `opts`.
pub fn cr_page_server(opts: &XferOpts) -> Result<ServerStats> {
    let dir = ImageDir::open(&opts.imgs_dir)?;
    dir.up_page_ids_base()?;

    let addr = opts.ps_bind_addr()?;
    let server = PageServer::bind(addr)?;
    let port = server.local_addr()?.port();
    log::info!("Starting page server on port {}", port);

    server.serve(&dir, opts.relay_timeout)
}
