use crate::criu::image::O_NOBUF;

pub mod magic {
    pub const RAW_IMAGE_MAGIC: u32 = 0x0;
    pub const IMG_COMMON_MAGIC: u32 = 0x54564319;

    pub const PAGEMAP_MAGIC: u32 = 0x56084025;
    pub const SHMEM_PAGEMAP_MAGIC: u32 = PAGEMAP_MAGIC;
    pub const PAGES_MAGIC: u32 = RAW_IMAGE_MAGIC;
}

use magic::*;

/// Image kinds handled by the page transfer code.
///
/// The discriminants travel on the wire in the low bits of a destination
/// id, so they must stay below 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CrFdType {
    Pagemap = 1,
    ShmemPagemap = 2,
    Pages = 3,
}

impl CrFdType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(CrFdType::Pagemap),
            2 => Some(CrFdType::ShmemPagemap),
            3 => Some(CrFdType::Pages),
            _ => None,
        }
    }

    /// Pagemap kinds are the only valid page transfer destinations.
    pub fn is_pagemap(self) -> bool {
        matches!(self, CrFdType::Pagemap | CrFdType::ShmemPagemap)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CrFdDescTmpl {
    pub fmt: &'static str,
    pub magic: u32,
    pub oflags: i32,
}

impl CrFdDescTmpl {
    /// Expands the `{}` in the name template with `id`.
    pub fn file_name(&self, id: impl std::fmt::Display) -> String {
        format!("{}.img", self.fmt.replacen("{}", &id.to_string(), 1))
    }
}

pub fn get_imgset_template(fd_type: CrFdType) -> CrFdDescTmpl {
    use CrFdType::*;

    match fd_type {
        Pagemap => CrFdDescTmpl {
            fmt: "pagemap-{}",
            magic: PAGEMAP_MAGIC,
            oflags: 0,
        },
        ShmemPagemap => CrFdDescTmpl {
            fmt: "pagemap-shmem-{}",
            magic: SHMEM_PAGEMAP_MAGIC,
            oflags: 0,
        },
        Pages => CrFdDescTmpl {
            fmt: "pages-{}",
            magic: PAGES_MAGIC,
            oflags: O_NOBUF,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_type_fits_type_bits() {
        for t in [CrFdType::Pagemap, CrFdType::ShmemPagemap, CrFdType::Pages] {
            assert!((t as u32) < 16);
            assert_eq!(CrFdType::from_raw(t as u32), Some(t));
        }
        assert_eq!(CrFdType::from_raw(0), None);
        assert_eq!(CrFdType::from_raw(15), None);
    }

    #[test]
    fn test_file_names() {
        assert_eq!(get_imgset_template(CrFdType::Pagemap).file_name(7), "pagemap-7.img");
        assert_eq!(
            get_imgset_template(CrFdType::ShmemPagemap).file_name(-3),
            "pagemap-shmem--3.img"
        );
        assert_eq!(get_imgset_template(CrFdType::Pages).file_name(65537), "pages-65537.img");
    }

    #[test]
    fn test_pages_image_is_raw() {
        let tmpl = get_imgset_template(CrFdType::Pages);
        assert_eq!(tmpl.magic, RAW_IMAGE_MAGIC);
        assert_eq!(tmpl.oflags & O_NOBUF, O_NOBUF);
    }
}
