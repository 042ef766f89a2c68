use crate::code::{CodeKey, CodeRegistry, CodeSnapshot, WriteObserver};
use crate::fault::{Access, FaultKind, MapError, MemoryFault};
use crate::region::{Backing, Pages, Prot, Region, RegionInfo};
use crate::{is_page_aligned, page_align_up, MIN_MAP_ADDRESS, USER_ADDRESS_LIMIT};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

type RegionMap = BTreeMap<u64, Region>;

/// The guest's virtual address space, shared by every thread of one emulated process.
///
/// Region-table changes (`map`, `unmap`, `protect`) take the table lock exclusively. Loads and
/// stores share the table lock and serialize per region on the region's page lock, so accesses
/// to distinct regions proceed in parallel.
pub struct AddressSpace {
    regions: RwLock<RegionMap>,
    code: CodeRegistry,
    mmap_base: u64,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Piece of an access that falls inside one region.
struct Piece<'a> {
    region: &'a Region,
    addr: u64,
    offset: usize,
    len: usize,
}

fn read_pages(region: &Region) -> RwLockReadGuard<'_, Pages> {
    region.pages.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_pages(region: &Region) -> RwLockWriteGuard<'_, Pages> {
    region.pages.write().unwrap_or_else(PoisonError::into_inner)
}

fn region_at(map: &RegionMap, addr: u64) -> Option<&Region> {
    map.range(..=addr)
        .next_back()
        .map(|(_, r)| r)
        .filter(|r| addr < r.end)
}

/// Resolve `[addr, addr + len)` into per-region pieces, checking `required` on every byte.
fn resolve(
    map: &RegionMap,
    addr: u64,
    len: usize,
    access: Access,
    required: Prot,
) -> Result<Vec<Piece<'_>>, MemoryFault> {
    let mut pieces = Vec::with_capacity(1);
    let mut offset = 0usize;
    while offset < len {
        let cur = addr.wrapping_add(offset as u64);
        let fault = |kind| MemoryFault {
            addr: cur,
            width: len,
            access,
            kind,
        };
        // Wrapping past the top of the address space never lands in a region.
        if offset > 0 && cur < addr {
            return Err(fault(FaultKind::Unmapped));
        }
        let region = region_at(map, cur).ok_or_else(|| fault(FaultKind::Unmapped))?;
        if !region.prot.contains(required) {
            return Err(fault(FaultKind::Protection {
                required,
                actual: region.prot,
            }));
        }
        let n = ((region.end - cur) as u128).min((len - offset) as u128) as usize;
        pieces.push(Piece {
            region,
            addr: cur,
            offset,
            len: n,
        });
        offset += n;
    }
    Ok(pieces)
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::with_mmap_base(0x7f00_0000_0000)
    }

    /// `mmap_base` is where the search for non-fixed mappings starts.
    pub fn with_mmap_base(mmap_base: u64) -> Self {
        Self {
            regions: RwLock::new(BTreeMap::new()),
            code: CodeRegistry::default(),
            mmap_base,
        }
    }

    fn table(&self) -> RwLockReadGuard<'_, RegionMap> {
        self.regions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn table_mut(&self) -> RwLockWriteGuard<'_, RegionMap> {
        self.regions.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------------------------
    // Region table
    // ---------------------------------------------------------------------------------------

    fn check_range(start: u64, len: u64) -> Result<u64, MapError> {
        if len == 0 {
            return Err(MapError::ZeroLength);
        }
        if !is_page_aligned(start) {
            return Err(MapError::Unaligned(start));
        }
        let len = page_align_up(len).ok_or(MapError::OutOfRange {
            start,
            end: u64::MAX,
        })?;
        let end = start.checked_add(len).ok_or(MapError::OutOfRange {
            start,
            end: u64::MAX,
        })?;
        if end > USER_ADDRESS_LIMIT {
            return Err(MapError::OutOfRange { start, end });
        }
        Ok(end)
    }

    fn is_free(map: &RegionMap, start: u64, end: u64) -> bool {
        // The last region starting before `end` is the only candidate for an overlap.
        match map.range(..end).next_back() {
            Some((_, r)) => r.end <= start,
            None => true,
        }
    }

    fn first_fit(map: &RegionMap, from: u64, len: u64) -> Option<u64> {
        let mut cand = from;
        for r in map.values() {
            if r.end <= cand {
                continue;
            }
            if r.start >= cand.checked_add(len)? {
                break;
            }
            cand = r.end;
        }
        (cand.checked_add(len)? <= USER_ADDRESS_LIMIT).then_some(cand)
    }

    /// Map `len` bytes (rounded up to whole pages) somewhere, preferring `hint`.
    pub fn map(&self, hint: u64, len: u64, prot: Prot, backing: Backing) -> Result<u64, MapError> {
        if len == 0 {
            return Err(MapError::ZeroLength);
        }
        let len = page_align_up(len).ok_or(MapError::NoSpace { len })?;
        let mut map = self.table_mut();

        let hinted = (hint >= MIN_MAP_ADDRESS && is_page_aligned(hint))
            .then(|| hint.checked_add(len))
            .flatten()
            .filter(|&end| end <= USER_ADDRESS_LIMIT && Self::is_free(&map, hint, end))
            .map(|_| hint);
        let start = hinted
            .or_else(|| Self::first_fit(&map, self.mmap_base.max(MIN_MAP_ADDRESS), len))
            .or_else(|| Self::first_fit(&map, MIN_MAP_ADDRESS, len))
            .ok_or(MapError::NoSpace { len })?;

        map.insert(start, Region::new(start, start + len, prot, backing));
        tracing::debug!(start, len, prot = prot.letters(), "mapped region");
        Ok(start)
    }

    /// Map exactly at `addr`. With `replace`, existing mappings in the range are discarded
    /// first; otherwise an overlap fails.
    pub fn map_fixed(
        &self,
        addr: u64,
        len: u64,
        prot: Prot,
        backing: Backing,
        replace: bool,
    ) -> Result<u64, MapError> {
        let end = Self::check_range(addr, len)?;
        {
            let mut map = self.table_mut();
            if !Self::is_free(&map, addr, end) {
                if !replace {
                    return Err(MapError::Overlap { start: addr, end });
                }
                Self::carve(&mut map, addr, end);
                let doomed: Vec<u64> = map.range(addr..end).map(|(&k, _)| k).collect();
                for k in doomed {
                    map.remove(&k);
                }
            }
            map.insert(addr, Region::new(addr, end, prot, backing));
        }
        // Replaced code is gone; translations of it must not survive.
        self.code.invalidate(addr, end, true);
        tracing::debug!(start = addr, len = end - addr, prot = prot.letters(), replace, "mapped fixed region");
        Ok(addr)
    }

    /// Split regions so that `start` and `end` fall on region boundaries.
    fn carve(map: &mut RegionMap, start: u64, end: u64) {
        for at in [start, end] {
            let key = match map.range(..at).next_back() {
                Some((&k, r)) if r.end > at => k,
                _ => continue,
            };
            if let Some(region) = map.get_mut(&key) {
                let upper = region.split_off(at);
                map.insert(at, upper);
            }
        }
    }

    /// Remove every mapping in `[base, base + len)`. Gaps are fine.
    pub fn unmap(&self, base: u64, len: u64) -> Result<(), MapError> {
        let end = Self::check_range(base, len)?;
        let removed = {
            let mut map = self.table_mut();
            Self::carve(&mut map, base, end);
            let doomed: Vec<u64> = map.range(base..end).map(|(&k, _)| k).collect();
            for k in &doomed {
                map.remove(k);
            }
            doomed.len()
        };
        self.code.invalidate(base, end, true);
        tracing::debug!(start = base, len = end - base, regions = removed, "unmapped range");
        Ok(())
    }

    /// Change permissions of `[base, base + len)`, which must be fully mapped.
    pub fn protect(&self, base: u64, len: u64, prot: Prot) -> Result<(), MapError> {
        let end = Self::check_range(base, len)?;
        {
            let mut map = self.table_mut();
            let mut cur = base;
            while cur < end {
                match region_at(&map, cur) {
                    Some(r) => cur = r.end,
                    None => return Err(MapError::NotMapped { start: base, end }),
                }
            }
            Self::carve(&mut map, base, end);
            for (_, region) in map.range_mut(base..end) {
                region.prot = prot;
            }
        }
        // Dropping EXEC must stop execution of already translated code.
        self.code.invalidate(base, end, false);
        tracing::debug!(start = base, len = end - base, prot = prot.letters(), "protected range");
        Ok(())
    }

    /// Region containing `addr`.
    pub fn translate(&self, addr: u64) -> Result<RegionInfo, MemoryFault> {
        region_at(&self.table(), addr)
            .map(Region::info)
            .ok_or(MemoryFault {
                addr,
                width: 1,
                access: Access::Read,
                kind: FaultKind::Unmapped,
            })
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.table().values().map(Region::info).collect()
    }

    /// True if every byte of `[addr, addr + len)` is mapped.
    pub fn is_mapped(&self, addr: u64, len: u64) -> bool {
        let map = self.table();
        resolve(&map, addr, len as usize, Access::Read, Prot::empty()).is_ok()
    }

    // ---------------------------------------------------------------------------------------
    // Data access
    // ---------------------------------------------------------------------------------------

    pub fn read_into(&self, addr: u64, out: &mut [u8]) -> Result<(), MemoryFault> {
        self.read_checked(addr, out, Access::Read)
    }

    fn read_checked(&self, addr: u64, out: &mut [u8], access: Access) -> Result<(), MemoryFault> {
        if out.is_empty() {
            return Ok(());
        }
        let map = self.table();
        for piece in resolve(&map, addr, out.len(), access, access.required())? {
            let pages = read_pages(piece.region);
            piece
                .region
                .read_with(&pages, piece.addr, &mut out[piece.offset..piece.offset + piece.len]);
        }
        Ok(())
    }

    /// Read `width` bytes starting at `addr`.
    ///
    /// The whole range is resolved before anything is allocated, so an oversized `width`
    /// faults at the first unmapped byte.
    pub fn read(&self, addr: u64, width: usize) -> Result<Vec<u8>, MemoryFault> {
        if width == 0 {
            return Ok(Vec::new());
        }
        let map = self.table();
        let pieces = resolve(&map, addr, width, Access::Read, Prot::READ)?;
        let mut out = vec![0u8; width];
        for piece in pieces {
            let pages = read_pages(piece.region);
            piece
                .region
                .read_with(&pages, piece.addr, &mut out[piece.offset..piece.offset + piece.len]);
        }
        Ok(out)
    }

    /// Store `bytes` at `addr`. Either every byte is written or none is.
    ///
    /// Translated code derived from any written byte is invalidated before the new bytes
    /// become readable.
    pub fn write(&self, addr: u64, bytes: &[u8]) -> Result<(), MemoryFault> {
        self.store(addr, bytes, Prot::WRITE)
    }

    /// Store `bytes` ignoring page protections. Used by loaders to populate read-only images.
    pub fn write_initial(&self, addr: u64, bytes: &[u8]) -> Result<(), MemoryFault> {
        self.store(addr, bytes, Prot::empty())
    }

    fn store(&self, addr: u64, bytes: &[u8], required: Prot) -> Result<(), MemoryFault> {
        if bytes.is_empty() {
            return Ok(());
        }
        let map = self.table();
        let pieces = resolve(&map, addr, bytes.len(), Access::Write, required)?;
        // Ascending address order is the lock order.
        let mut guards: Vec<_> = pieces.iter().map(|p| write_pages(p.region)).collect();
        // Page versions move while the old bytes are still the only ones visible.
        self.code
            .invalidate(addr, addr.saturating_add(bytes.len() as u64), false);
        for (piece, pages) in pieces.iter().zip(guards.iter_mut()) {
            piece.region.write_with(
                pages,
                piece.addr,
                &bytes[piece.offset..piece.offset + piece.len],
            );
        }
        Ok(())
    }

    /// Little-endian load of `size` (1..=8) bytes.
    pub fn read_le(&self, addr: u64, size: usize) -> Result<u64, MemoryFault> {
        debug_assert!((1..=8).contains(&size));
        let mut buf = [0u8; 8];
        self.read_into(addr, &mut buf[..size])?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Little-endian store of the low `size` (1..=8) bytes of `value`.
    pub fn write_le(&self, addr: u64, size: usize, value: u64) -> Result<(), MemoryFault> {
        debug_assert!((1..=8).contains(&size));
        self.write(addr, &value.to_le_bytes()[..size])
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, MemoryFault> {
        Ok(self.read_le(addr, 1)? as u8)
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryFault> {
        Ok(self.read_le(addr, 2)? as u16)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryFault> {
        Ok(self.read_le(addr, 4)? as u32)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryFault> {
        self.read_le(addr, 8)
    }

    pub fn write_u8(&self, addr: u64, v: u8) -> Result<(), MemoryFault> {
        self.write(addr, &[v])
    }

    pub fn write_u16(&self, addr: u64, v: u16) -> Result<(), MemoryFault> {
        self.write(addr, &v.to_le_bytes())
    }

    pub fn write_u32(&self, addr: u64, v: u32) -> Result<(), MemoryFault> {
        self.write(addr, &v.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, v: u64) -> Result<(), MemoryFault> {
        self.write(addr, &v.to_le_bytes())
    }

    /// Read a NUL-terminated string of at most `max` bytes (terminator excluded).
    pub fn read_c_string(&self, addr: u64, max: usize) -> Result<Vec<u8>, MemoryFault> {
        let mut out = Vec::new();
        for i in 0..max as u64 {
            let b = self.read_u8(addr.wrapping_add(i))?;
            if b == 0 {
                break;
            }
            out.push(b);
        }
        Ok(out)
    }

    /// Atomically read-modify-write `size` bytes at `addr`.
    ///
    /// `f` maps the old value to the new one, or to `None` to leave memory untouched. The
    /// whole range must be readable and writable even if nothing ends up being stored. Every
    /// region involved stays locked for the duration, so concurrent atomics on the same bytes
    /// serialize. Returns the old value.
    pub fn atomic_update(
        &self,
        addr: u64,
        size: usize,
        f: impl FnOnce(u64) -> Option<u64>,
    ) -> Result<u64, MemoryFault> {
        debug_assert!((1..=8).contains(&size));
        let map = self.table();
        let pieces = resolve(&map, addr, size, Access::Write, Prot::RW)?;
        // Pieces come out in ascending address order, which is also the lock order.
        let mut guards: Vec<_> = pieces.iter().map(|p| write_pages(p.region)).collect();

        let mut buf = [0u8; 8];
        for (piece, pages) in pieces.iter().zip(guards.iter()) {
            piece.region.read_with(
                pages,
                piece.addr,
                &mut buf[piece.offset..piece.offset + piece.len],
            );
        }
        let old = u64::from_le_bytes(buf);
        let new = f(old);
        if let Some(new) = new {
            self.code.invalidate(addr, addr.saturating_add(size as u64), false);
            let bytes = new.to_le_bytes();
            for (piece, pages) in pieces.iter().zip(guards.iter_mut()) {
                piece.region.write_with(
                    pages,
                    piece.addr,
                    &bytes[piece.offset..piece.offset + piece.len],
                );
            }
        }
        Ok(old)
    }

    // ---------------------------------------------------------------------------------------
    // Code
    // ---------------------------------------------------------------------------------------

    /// Fetch up to `out.len()` executable bytes starting at `addr`.
    ///
    /// Stops early at the first byte that is unmapped or not executable and returns how many
    /// bytes were fetched; faults only if not even the first byte can be fetched.
    pub fn fetch(&self, addr: u64, out: &mut [u8]) -> Result<usize, MemoryFault> {
        if out.is_empty() {
            return Ok(0);
        }
        let map = self.table();
        let mut done = 0usize;
        while done < out.len() {
            let cur = addr.wrapping_add(done as u64);
            if done > 0 && cur < addr {
                break;
            }
            let fault = |kind| MemoryFault {
                addr: cur,
                width: 1,
                access: Access::Execute,
                kind,
            };
            let region = match region_at(&map, cur) {
                Some(r) if r.prot.contains(Prot::EXEC) => r,
                Some(r) if done == 0 => {
                    return Err(fault(FaultKind::Protection {
                        required: Prot::EXEC,
                        actual: r.prot,
                    }))
                }
                None if done == 0 => return Err(fault(FaultKind::Unmapped)),
                _ => break,
            };
            let n = ((region.end - cur) as u128).min((out.len() - done) as u128) as usize;
            let pages = read_pages(region);
            region.read_with(&pages, cur, &mut out[done..done + n]);
            done += n;
        }
        Ok(done)
    }

    /// Install the observer told about invalidated code ranges. Replaces any previous one.
    pub fn set_write_observer(&self, observer: Weak<dyn WriteObserver>) {
        self.code.set_observer(observer);
    }

    /// Start tracking stores to the pages of `[start, end)`, recording their versions in
    /// `snapshot`. Call before fetching the bytes a translation is built from.
    pub fn watch_code(&self, start: u64, end: u64, snapshot: &mut CodeSnapshot) {
        self.code.watch(start, end, snapshot);
    }

    /// File the translated range `[start, end)` under `key`; stores into it report `key`.
    pub fn register_code(&self, key: CodeKey, start: u64, end: u64) {
        self.code.register(key, start, end);
    }

    pub fn unregister_code(&self, key: CodeKey, start: u64, end: u64) {
        self.code.unregister(key, start, end);
    }

    /// Treat `[start, end)` as written: bump page versions and report intersecting code.
    pub fn invalidate_code(&self, start: u64, end: u64) {
        self.code.invalidate(start, end, false);
    }

    pub fn is_code_page(&self, page: u64) -> bool {
        self.code.is_watched(page)
    }
}
