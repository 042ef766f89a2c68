use crate::{page_of, PAGE_SHIFT, PAGE_SIZE};
use rustc_hash::FxHashMap;
use std::sync::{Arc, PoisonError, RwLock};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RX = Self::READ.bits() | Self::EXEC.bits();
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

impl Prot {
    /// `ls -l` style rendering, e.g. `r-x`.
    pub fn letters(self) -> &'static str {
        const TABLE: [&str; 8] = ["---", "r--", "-w-", "rw-", "--x", "r-x", "-wx", "rwx"];
        TABLE[(self.bits() & 7) as usize]
    }

    /// Linux `PROT_*` bits share this layout.
    pub fn from_linux(prot: u64) -> Self {
        Prot::from_bits_truncate((prot & 7) as u8)
    }
}

/// Where a region's initial contents come from.
///
/// File-backed regions are private: stores land in the region's own pages and never reach
/// `data`.
#[derive(Debug, Clone)]
pub enum Backing {
    /// Zero-filled on first touch.
    Anonymous,
    /// Bytes `data[offset..]` appear at the region start; anything past the end of `data`
    /// reads as zero.
    File {
        name: Arc<str>,
        data: Arc<[u8]>,
        offset: u64,
    },
    /// Inaccessible spacer, typically below a stack.
    Guard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Anonymous,
    File,
    Guard,
}

/// Snapshot of one region's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub start: u64,
    pub end: u64,
    pub prot: Prot,
    pub kind: BackingKind,
    pub name: Option<Arc<str>>,
}

impl RegionInfo {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

pub(crate) type Page = Box<[u8; PAGE_SIZE as usize]>;

/// Materialized pages of a region, keyed by absolute page number.
#[derive(Default)]
pub(crate) struct Pages {
    map: FxHashMap<u64, Page>,
}

pub(crate) struct Region {
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) prot: Prot,
    pub(crate) backing: Backing,
    pub(crate) pages: RwLock<Pages>,
}

impl Region {
    pub(crate) fn new(start: u64, end: u64, prot: Prot, backing: Backing) -> Self {
        Self {
            start,
            end,
            prot,
            backing,
            pages: RwLock::new(Pages::default()),
        }
    }

    pub(crate) fn info(&self) -> RegionInfo {
        let (kind, name) = match &self.backing {
            Backing::Anonymous => (BackingKind::Anonymous, None),
            Backing::File { name, .. } => (BackingKind::File, Some(name.clone())),
            Backing::Guard => (BackingKind::Guard, None),
        };
        RegionInfo {
            start: self.start,
            end: self.end,
            prot: self.prot,
            kind,
            name,
        }
    }

    /// Initial contents of `[addr, addr + out.len())`, before any store.
    fn fill_initial(&self, addr: u64, out: &mut [u8]) {
        match &self.backing {
            Backing::Anonymous | Backing::Guard => out.fill(0),
            Backing::File { data, offset, .. } => {
                let file_pos = offset.saturating_add(addr - self.start);
                let avail = (data.len() as u64).saturating_sub(file_pos) as usize;
                let n = avail.min(out.len());
                if n > 0 {
                    let from = file_pos as usize;
                    out[..n].copy_from_slice(&data[from..from + n]);
                }
                out[n..].fill(0);
            }
        }
    }

    /// Copy `[addr, addr + out.len())` out of the region. The range must lie within the region.
    pub(crate) fn read_with(&self, pages: &Pages, addr: u64, out: &mut [u8]) {
        let mut done = 0usize;
        while done < out.len() {
            let a = addr + done as u64;
            let in_page = (a & (PAGE_SIZE - 1)) as usize;
            let n = (PAGE_SIZE as usize - in_page).min(out.len() - done);
            match pages.map.get(&page_of(a)) {
                Some(page) => out[done..done + n].copy_from_slice(&page[in_page..in_page + n]),
                None => self.fill_initial(a, &mut out[done..done + n]),
            }
            done += n;
        }
    }

    /// Store `data` at `addr`. The range must lie within the region.
    pub(crate) fn write_with(&self, pages: &mut Pages, addr: u64, data: &[u8]) {
        let mut done = 0usize;
        while done < data.len() {
            let a = addr + done as u64;
            let in_page = (a & (PAGE_SIZE - 1)) as usize;
            let n = (PAGE_SIZE as usize - in_page).min(data.len() - done);
            let page = pages.map.entry(page_of(a)).or_insert_with(|| {
                let mut fresh: Page = Box::new([0u8; PAGE_SIZE as usize]);
                self.fill_initial(page_of(a) << PAGE_SHIFT, &mut fresh[..]);
                fresh
            });
            page[in_page..in_page + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
    }

    /// Split at the page-aligned address `at` (strictly inside the region), keeping
    /// `[start, at)` in `self` and returning `[at, end)`.
    pub(crate) fn split_off(&mut self, at: u64) -> Region {
        debug_assert!(self.start < at && at < self.end);
        let pages = self.pages.get_mut().unwrap_or_else(PoisonError::into_inner);
        let split_page = page_of(at);
        let (upper, lower): (FxHashMap<u64, Page>, FxHashMap<u64, Page>) = std::mem::take(
            &mut pages.map,
        )
        .into_iter()
        .partition(|(page, _)| *page >= split_page);
        pages.map = lower;

        let backing = match &self.backing {
            Backing::File { name, data, offset } => Backing::File {
                name: name.clone(),
                data: data.clone(),
                offset: offset.saturating_add(at - self.start),
            },
            other => other.clone(),
        };
        let upper_region = Region {
            start: at,
            end: self.end,
            prot: self.prot,
            backing,
            pages: RwLock::new(Pages { map: upper }),
        };
        self.end = at;
        upper_region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_region(start: u64, len: u64, bytes: &[u8], offset: u64) -> Region {
        Region::new(
            start,
            start + len,
            Prot::READ,
            Backing::File {
                name: Arc::from("img"),
                data: Arc::from(bytes),
                offset,
            },
        )
    }

    #[test]
    fn file_backing_pads_with_zeros() {
        let r = file_region(0x1000, 0x1000, &[1, 2, 3, 4], 1);
        let pages = Pages::default();
        let mut out = [0xffu8; 6];
        r.read_with(&pages, 0x1000, &mut out);
        assert_eq!(out, [2, 3, 4, 0, 0, 0]);
    }

    #[test]
    fn write_materializes_page_with_initial_contents() {
        let r = file_region(0x1000, 0x1000, &[9, 9, 9, 9], 0);
        let mut pages = Pages::default();
        r.write_with(&mut pages, 0x1001, &[7]);
        let mut out = [0u8; 4];
        r.read_with(&pages, 0x1000, &mut out);
        assert_eq!(out, [9, 7, 9, 9]);
    }

    #[test]
    fn split_moves_pages_and_adjusts_file_offset() {
        let data: Vec<u8> = (0..0x3000u32).map(|i| (i >> 12) as u8 + 1).collect();
        let mut r = file_region(0x10000, 0x3000, &data, 0);
        {
            let mut pages = r.pages.write().unwrap();
            r.write_with(&mut pages, 0x12000, &[0xaa]);
        }
        let hi = r.split_off(0x11000);
        assert_eq!((r.start, r.end), (0x10000, 0x11000));
        assert_eq!((hi.start, hi.end), (0x11000, 0x13000));

        let mut b = [0u8; 1];
        hi.read_with(&hi.pages.read().unwrap(), 0x11000, &mut b);
        assert_eq!(b, [2]);
        hi.read_with(&hi.pages.read().unwrap(), 0x12000, &mut b);
        assert_eq!(b, [0xaa]);
        r.read_with(&r.pages.read().unwrap(), 0x10fff, &mut b);
        assert_eq!(b, [1]);
    }

    #[test]
    fn prot_letters() {
        assert_eq!(Prot::RX.letters(), "r-x");
        assert_eq!(Prot::empty().letters(), "---");
        assert_eq!(Prot::from_linux(3), Prot::RW);
    }
}
