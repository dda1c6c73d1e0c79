// Pagemap and pages image reader
use std::fs::File;
use std::io::{BufReader, Read};

use crate::criu::image::ImageDir;
use crate::criu::image_desc::{get_imgset_template, magic, CrFdType};
use crate::criu::pagemap::{init_compat_pagemap_entry, pagemap_len, pagemap_present, PAGE_SIZE};
use crate::criu::protobuf::{pb_read_one, pb_read_one_eof};
use crate::error::{Result, XferError};
use crate::proto::{PagemapEntry, PagemapHead};

/// A pagemap image read back from disk.
#[derive(Debug)]
pub struct Pagemap {
    pub pages_id: u32,
    pub entries: Vec<PagemapEntry>,
}

impl Pagemap {
    /// Pages stored in the pages image, holes excluded.
    pub fn nr_present_pages(&self) -> u64 {
        self.entries
            .iter()
            .filter(|pe| pagemap_present(pe))
            .map(|pe| pe.nr_pages.unwrap_or(0))
            .sum()
    }

    pub fn display(&self) {
        log::info!("Pages ID: {}", self.pages_id);
        log::info!("Pagemap entries: {}", self.entries.len());

        for pe in &self.entries {
            let kind = if pagemap_present(pe) { "" } else { " (parent)" };
            log::info!(
                "  0x{:x}-0x{:x} [{}]{}",
                pe.vaddr,
                pe.vaddr + pagemap_len(pe),
                pe.nr_pages.unwrap_or(0),
                kind
            );
        }

        let total = self.nr_present_pages();
        log::info!(
            "Total present pages: {} ({} bytes)",
            total,
            total * PAGE_SIZE as u64
        );
    }
}

impl ImageDir {
    fn open_for_read(&self, fd_type: CrFdType, id: i64) -> Result<(File, String)> {
        let img_path = self.image_path(fd_type, id);
        let file = File::open(&img_path).map_err(|e| XferError::backing_store(&img_path, e))?;
        Ok((file, get_imgset_template(fd_type).file_name(id)))
    }

    /// Read a pagemap (or shmem pagemap) image
    pub fn read_pagemap(&self, fd_type: CrFdType, id: i64) -> Result<Pagemap> {
        if !fd_type.is_pagemap() {
            return Err(XferError::Config(format!("{:?} is not a pagemap image", fd_type)));
        }

        let (file, filename) = self.open_for_read(fd_type, id)?;
        let mut r = BufReader::new(file);

        // [4 common magic][4 pagemap magic][4 size][PagemapHead][4 size][PagemapEntry]...
        let mut hdr = [0u8; 8];
        r.read_exact(&mut hdr).map_err(|_| XferError::InvalidImage {
            reason: format!("{} is too small (< 8 bytes)", filename),
        })?;

        let common = u32::from_ne_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let img_magic = u32::from_ne_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
        let want = get_imgset_template(fd_type).magic;
        if common != magic::IMG_COMMON_MAGIC || img_magic != want {
            return Err(XferError::InvalidImage {
                reason: format!(
                    "{}: magic 0x{:x}/0x{:x} doesn't match 0x{:x}/0x{:x}",
                    filename,
                    common,
                    img_magic,
                    magic::IMG_COMMON_MAGIC,
                    want
                ),
            });
        }

        let head: PagemapHead = pb_read_one(&mut r)?;

        let mut entries = Vec::new();
        while let Some(mut pe) = pb_read_one_eof::<PagemapEntry, _>(&mut r)? {
            init_compat_pagemap_entry(&mut pe);
            entries.push(pe);
        }

        log::debug!("Read {} entries from {}", entries.len(), filename);

        Ok(Pagemap {
            pages_id: head.pages_id,
            entries,
        })
    }

    /// Read pages file containing actual memory data
    pub fn read_pages(&self, pages_id: u32) -> Result<Vec<u8>> {
        let (mut file, filename) = self.open_for_read(CrFdType::Pages, pages_id as i64)?;

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        // Pages image is raw, no header
        if buffer.len() % PAGE_SIZE != 0 {
            return Err(XferError::InvalidImage {
                reason: format!("{} is not page aligned ({} bytes)", filename, buffer.len()),
            });
        }

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criu::image::O_DUMP;
    use crate::criu::pagemap::{Iovec, PE_PARENT};
    use crate::criu::protobuf::pb_write_one;
    use std::path::PathBuf;

    fn test_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("crust_xfer_reader_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_read_pagemap_compat_entry() {
        let path = test_dir("compat");
        let dir = ImageDir::open(&path).unwrap();

        let mut pmi = dir.open_image(CrFdType::Pagemap, O_DUMP, 5).unwrap();
        let (_pi, pages_id) = dir.open_pages_image(O_DUMP, &mut pmi).unwrap();
        // old style entries: no flags, no nr_pages
        pb_write_one(
            &mut pmi,
            &PagemapEntry {
                vaddr: 0x1000,
                compat_nr_pages: 2,
                ..Default::default()
            },
        )
        .unwrap();
        pb_write_one(
            &mut pmi,
            &PagemapEntry {
                vaddr: 0x8000,
                compat_nr_pages: 1,
                in_parent: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        pmi.close().unwrap();

        let pm = dir.read_pagemap(CrFdType::Pagemap, 5).unwrap();
        assert_eq!(pm.pages_id, pages_id);
        assert_eq!(pm.entries.len(), 2);
        assert_eq!(pm.entries[0].nr_pages, Some(2));
        assert!(pagemap_present(&pm.entries[0]));
        assert_eq!(pm.entries[1].flags.unwrap_or(0) & PE_PARENT, PE_PARENT);
        assert_eq!(pm.nr_present_pages(), 2);

        let _ = std::fs::remove_dir_all(&path);
    }

    #[test]
    fn test_read_pagemap_bad_magic() {
        let path = test_dir("magic");
        let dir = ImageDir::open(&path).unwrap();

        std::fs::write(path.join("pagemap-1.img"), [0u8; 16]).unwrap();
        assert!(matches!(
            dir.read_pagemap(CrFdType::Pagemap, 1),
            Err(XferError::InvalidImage { .. })
        ));

        std::fs::write(path.join("pagemap-2.img"), [0u8; 3]).unwrap();
        assert!(matches!(
            dir.read_pagemap(CrFdType::Pagemap, 2),
            Err(XferError::InvalidImage { .. })
        ));

        let _ = std::fs::remove_dir_all(&path);
    }

    #[test]
    fn test_read_missing_image() {
        let path = test_dir("missing");
        let dir = ImageDir::open(&path).unwrap();
        assert!(matches!(
            dir.read_pagemap(CrFdType::ShmemPagemap, 9),
            Err(XferError::BackingStore { .. })
        ));
        assert!(dir.read_pages(9).is_err());
        assert!(dir.read_pagemap(CrFdType::Pages, 9).is_err());

        let _ = std::fs::remove_dir_all(&path);
    }

    #[test]
    fn test_read_pages() {
        let path = test_dir("pages");
        let dir = ImageDir::open(&path).unwrap();

        std::fs::write(path.join("pages-3.img"), vec![7u8; PAGE_SIZE]).unwrap();
        assert_eq!(dir.read_pages(3).unwrap(), vec![7u8; PAGE_SIZE]);

        std::fs::write(path.join("pages-4.img"), [1u8; 10]).unwrap();
        assert!(dir.read_pages(4).is_err());

        // iovec helper keeps the reader honest about lengths
        assert_eq!(Iovec::from_pages(0, 3).len, 3 * PAGE_SIZE as u64);

        let _ = std::fs::remove_dir_all(&path);
    }
}
