use crate::proto::PagemapEntry;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub const PE_PARENT: u32 = 1 << 0;
pub const PE_PRESENT: u32 = 1 << 2;

/// A page aligned run of a dumped address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iovec {
    pub base: u64,
    pub len: u64,
}

impl Iovec {
    pub fn new(base: u64, len: u64) -> Self {
        Iovec { base, len }
    }

    pub fn from_pages(base: u64, nr_pages: u64) -> Self {
        Iovec {
            base,
            len: nr_pages * PAGE_SIZE as u64,
        }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.base + self.len
    }

    #[inline]
    pub fn nr_pages(&self) -> u64 {
        self.len / PAGE_SIZE as u64
    }
}

#[inline]
pub fn page_aligned(v: u64) -> bool {
    v & (PAGE_SIZE as u64 - 1) == 0
}

#[inline]
pub fn pagemap_in_parent(pe: &PagemapEntry) -> bool {
    (pe.flags.unwrap_or(0) & PE_PARENT) != 0
}

#[inline]
pub fn pagemap_present(pe: &PagemapEntry) -> bool {
    (pe.flags.unwrap_or(0) & PE_PRESENT) != 0
}

#[inline]
pub fn pagemap_len(pe: &PagemapEntry) -> u64 {
    pe.nr_pages.unwrap_or(0) * PAGE_SIZE as u64
}

/// Builds the pagemap record describing `iov`. Holes are marked as living
/// in the parent snapshot.
pub fn pagemap_entry(iov: &Iovec, hole: bool) -> PagemapEntry {
    let nr_pages = iov.nr_pages();

    PagemapEntry {
        vaddr: iov.base,
        compat_nr_pages: nr_pages as u32,
        in_parent: if hole { Some(true) } else { None },
        nr_pages: Some(nr_pages),
        flags: Some(if hole { PE_PARENT } else { PE_PRESENT }),
    }
}

pub fn init_compat_pagemap_entry(pe: &mut PagemapEntry) {
    // pagemap image generated with older version will either contain a hole
    // because the pages are in the parent snapshot or a pagemap that should
    // be marked with PE_PRESENT
    if pe.in_parent == Some(true) {
        let flags = pe.flags.unwrap_or(0);
        pe.flags = Some(flags | PE_PARENT);
    } else if pe.flags.is_none() {
        pe.flags = Some(PE_PRESENT);
    }

    if pe.nr_pages.is_none() {
        pe.nr_pages = Some(pe.compat_nr_pages as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iovec_pages() {
        let iov = Iovec::from_pages(0x1000, 3);
        assert_eq!(iov.len, 3 * PAGE_SIZE as u64);
        assert_eq!(iov.nr_pages(), 3);
        assert_eq!(iov.end(), 0x4000);
    }

    #[test]
    fn test_page_aligned() {
        assert!(page_aligned(0));
        assert!(page_aligned(0x7f00_0000_1000));
        assert!(!page_aligned(0x1001));
    }

    #[test]
    fn test_pagemap_entry_present() {
        let pe = pagemap_entry(&Iovec::from_pages(0x2000, 2), false);
        assert_eq!(pe.vaddr, 0x2000);
        assert_eq!(pe.compat_nr_pages, 2);
        assert_eq!(pe.nr_pages, Some(2));
        assert_eq!(pe.in_parent, None);
        assert!(pagemap_present(&pe));
        assert!(!pagemap_in_parent(&pe));
        assert_eq!(pagemap_len(&pe), 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_pagemap_entry_hole() {
        let pe = pagemap_entry(&Iovec::from_pages(0x3000, 1), true);
        assert_eq!(pe.in_parent, Some(true));
        assert!(pagemap_in_parent(&pe));
        assert!(!pagemap_present(&pe));
    }

    #[test]
    fn test_init_compat_pagemap_entry() {
        let mut old = PagemapEntry {
            vaddr: 0x1000,
            compat_nr_pages: 4,
            in_parent: None,
            nr_pages: None,
            flags: None,
        };
        init_compat_pagemap_entry(&mut old);
        assert_eq!(old.nr_pages, Some(4));
        assert!(pagemap_present(&old));

        let mut old_hole = PagemapEntry {
            vaddr: 0x1000,
            compat_nr_pages: 1,
            in_parent: Some(true),
            nr_pages: None,
            flags: None,
        };
        init_compat_pagemap_entry(&mut old_hole);
        assert!(pagemap_in_parent(&old_hole));
    }
}
