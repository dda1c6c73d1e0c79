use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::criu::image_desc::{get_imgset_template, magic, CrFdType};
use crate::criu::protobuf::pb_write_one;
use crate::error::{Result, XferError};
use crate::proto::PagemapHead;

/// Image is written straight to the fd, bypassing the write buffer.
/// Never passed to open(2).
pub const O_NOBUF: i32 = libc::O_DIRECT;
pub const O_DUMP: i32 = libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC;

pub const CR_FD_PERM: u32 = 0o600;

/// Page server produces pages images starting from this id, see
/// `ImageDir::up_page_ids_base`.
pub const PAGE_IDS_SERVER_BASE: u32 = 0x10000;

/// A directory holding the images of one dump.
#[derive(Debug)]
pub struct ImageDir {
    path: PathBuf,
    page_ids: AtomicU32,
}

impl ImageDir {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(XferError::backing_store(
                path,
                io::Error::new(io::ErrorKind::NotFound, "not a directory"),
            ));
        }
        Ok(ImageDir {
            path,
            page_ids: AtomicU32::new(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When page server and dump work on the same dir, the shmem pagemaps
    /// and regular pagemaps may have ids conflicts. Page server images get
    /// higher ids.
    pub fn up_page_ids_base(&self) -> Result<()> {
        self.page_ids
            .compare_exchange(1, 1 + PAGE_IDS_SERVER_BASE, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| XferError::Config("page ids already in use".to_string()))
    }

    fn next_pages_id(&self) -> u32 {
        self.page_ids.fetch_add(1, Ordering::SeqCst)
    }

    pub fn image_path(&self, fd_type: CrFdType, id: impl Display) -> PathBuf {
        self.path.join(get_imgset_template(fd_type).file_name(id))
    }

    pub fn open_image(&self, fd_type: CrFdType, oflags: i32, id: impl Display) -> Result<CrImg> {
        let tmpl = get_imgset_template(fd_type);
        let oflags = oflags | tmpl.oflags;
        let path = self.path.join(tmpl.file_name(id));

        let mut img = do_open_image(&path, fd_type, oflags)?;

        if tmpl.magic != magic::RAW_IMAGE_MAGIC {
            img.write_u32(magic::IMG_COMMON_MAGIC)?;
            img.write_u32(tmpl.magic)?;
        }

        Ok(img)
    }

    /// Allocates a pages id, records it in the pagemap head and opens the
    /// matching pages image.
    pub fn open_pages_image(&self, oflags: i32, pmi: &mut CrImg) -> Result<(CrImg, u32)> {
        let id = self.next_pages_id();
        pb_write_one(pmi, &PagemapHead { pages_id: id })?;

        let img = self.open_image(CrFdType::Pages, oflags, id)?;
        Ok((img, id))
    }
}

enum ImgFile {
    Buffered(BufWriter<File>),
    Raw(File),
}

/// An image opened for dumping.
pub struct CrImg {
    file: ImgFile,
    pub fd_type: CrFdType,
    pub path: PathBuf,
}

fn do_open_image(path: &Path, fd_type: CrFdType, oflags: i32) -> Result<CrImg> {
    let flags = oflags & !O_NOBUF;

    let mut options = OpenOptions::new();
    options
        .write(true)
        .create(flags & libc::O_CREAT != 0)
        .truncate(flags & libc::O_TRUNC != 0)
        .mode(CR_FD_PERM)
        .custom_flags(flags & !(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC));

    let file = options
        .open(path)
        .map_err(|e| XferError::backing_store(path, e))?;

    let file = if oflags & O_NOBUF != 0 {
        ImgFile::Raw(file)
    } else {
        ImgFile::Buffered(BufWriter::new(file))
    };

    Ok(CrImg {
        file,
        fd_type,
        path: path.to_path_buf(),
    })
}

impl CrImg {
    pub fn write_buf(&mut self, data: &[u8]) -> Result<()> {
        let ret = match &mut self.file {
            ImgFile::Buffered(w) => w.write_all(data),
            ImgFile::Raw(f) => f.write_all(data),
        };
        ret.map_err(|e| XferError::backing_store(&self.path, e))
    }

    pub fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write_buf(&val.to_ne_bytes())
    }

    /// Descriptor for splicing data in. Only unbuffered images have one,
    /// otherwise spliced bytes would overtake the buffered ones.
    pub fn raw_fd(&self) -> Option<RawFd> {
        match &self.file {
            ImgFile::Raw(f) => Some(f.as_raw_fd()),
            ImgFile::Buffered(_) => None,
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        let ret = match &mut self.file {
            ImgFile::Buffered(w) => w.flush(),
            ImgFile::Raw(_) => Ok(()),
        };
        ret.map_err(|e| XferError::backing_store(&self.path, e))
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("crust_xfer_img_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_open_missing_dir() {
        let dir = std::env::temp_dir().join(format!("crust_xfer_nodir_{}", std::process::id()));
        assert!(matches!(
            ImageDir::open(&dir),
            Err(XferError::BackingStore { .. })
        ));
    }

    #[test]
    fn test_pagemap_image_header() {
        let path = test_dir("header");
        let dir = ImageDir::open(&path).unwrap();

        let img = dir.open_image(CrFdType::Pagemap, O_DUMP, 42).unwrap();
        assert!(img.raw_fd().is_none());
        img.close().unwrap();

        let data = std::fs::read(path.join("pagemap-42.img")).unwrap();
        assert_eq!(data.len(), 8);
        assert_eq!(&data[..4], &magic::IMG_COMMON_MAGIC.to_ne_bytes());
        assert_eq!(&data[4..], &magic::PAGEMAP_MAGIC.to_ne_bytes());

        let _ = std::fs::remove_dir_all(&path);
    }

    #[test]
    fn test_pages_ids() {
        let path = test_dir("ids");
        let dir = ImageDir::open(&path).unwrap();

        let mut pmi = dir.open_image(CrFdType::Pagemap, O_DUMP, 1).unwrap();
        let (pi, id) = dir.open_pages_image(O_DUMP, &mut pmi).unwrap();
        assert_eq!(id, 1);
        assert!(pi.raw_fd().is_some());
        assert!(path.join("pages-1.img").exists());

        // ids are in use now
        assert!(dir.up_page_ids_base().is_err());

        let (_, id) = dir.open_pages_image(O_DUMP, &mut pmi).unwrap();
        assert_eq!(id, 2);

        let _ = std::fs::remove_dir_all(&path);
    }

    #[test]
    fn test_up_page_ids_base() {
        let path = test_dir("ids_base");
        let dir = ImageDir::open(&path).unwrap();
        dir.up_page_ids_base().unwrap();

        let mut pmi = dir.open_image(CrFdType::ShmemPagemap, O_DUMP, 3).unwrap();
        let (_, id) = dir.open_pages_image(O_DUMP, &mut pmi).unwrap();
        assert_eq!(id, PAGE_IDS_SERVER_BASE + 1);

        let _ = std::fs::remove_dir_all(&path);
    }
}
