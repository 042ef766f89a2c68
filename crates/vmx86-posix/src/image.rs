//! Placing a guest image in memory and building the System V initial process stack.
//!
//! Executable formats are parsed elsewhere; this module receives the segments already laid
//! out as they should appear in the address space.

use std::sync::Arc;
use vmx86_cpu_core::{ConfigError, CpuMode, CpuState, VmConfig};
use vmx86_mem::{
    page_align_down, page_align_up, AddressSpace, Backing, MapError, MemoryFault, Prot,
    PAGE_SIZE,
};
use vmx86_types::Gpr;

/// Top of the initial stack; the stack grows down from here.
pub const STACK_TOP: u64 = 0x7fff_ffff_f000;

pub const AT_NULL: u64 = 0;
pub const AT_PAGESZ: u64 = 6;
pub const AT_ENTRY: u64 = 9;
pub const AT_UID: u64 = 11;
pub const AT_EUID: u64 = 12;
pub const AT_GID: u64 = 13;
pub const AT_EGID: u64 = 14;
pub const AT_SECURE: u64 = 23;
pub const AT_RANDOM: u64 = 25;

/// One loadable segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub addr: u64,
    pub data: Vec<u8>,
    /// Size in memory; anything past `data` is zero-filled. Never less than `data.len()`.
    pub mem_size: u64,
    pub prot: Prot,
}

impl Segment {
    pub fn new(addr: u64, data: Vec<u8>, prot: Prot) -> Self {
        let mem_size = data.len() as u64;
        Self {
            addr,
            data,
            mem_size,
            prot,
        }
    }

    /// Extend the segment with a zero-filled tail (`.bss`).
    pub fn with_mem_size(mut self, mem_size: u64) -> Self {
        self.mem_size = mem_size.max(self.data.len() as u64);
        self
    }

    fn end(&self) -> u64 {
        self.addr.saturating_add(self.mem_size)
    }
}

#[derive(Debug, Clone)]
pub struct GuestImage {
    /// Shown as the backing name of the mapped segments.
    pub name: String,
    pub entry: u64,
    pub segments: Vec<Segment>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("image has no segments")]
    Empty,
    #[error("segment at {addr:#x} cannot be mapped: {source}")]
    Map {
        addr: u64,
        #[source]
        source: MapError,
    },
    #[error("arguments and environment do not fit the initial stack")]
    StackOverflow,
    #[error("writing the initial stack faulted: {0}")]
    Memory(#[from] MemoryFault),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result of [`load_image`].
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Initial state of the main thread.
    pub cpu: CpuState,
    /// First page past the highest segment; the heap starts here.
    pub brk_start: u64,
    pub stack_top: u64,
    /// Lowest usable stack address; a guard page sits right below it.
    pub stack_base: u64,
}

/// Map `image` into `mem` and build the initial stack.
pub fn load_image(
    mem: &AddressSpace,
    image: &GuestImage,
    argv: &[&str],
    envp: &[&str],
    config: &VmConfig,
) -> Result<LoadedImage, LoadError> {
    config.validate()?;
    if image.segments.is_empty() {
        return Err(LoadError::Empty);
    }
    let name: Arc<str> = Arc::from(image.name.as_str());
    let mut image_end = 0u64;
    for seg in &image.segments {
        map_segment(mem, seg, &name)?;
        image_end = image_end.max(seg.end());
    }
    let brk_start = page_align_up(image_end).ok_or(LoadError::Map {
        addr: image_end,
        source: MapError::OutOfRange {
            start: image_end,
            end: u64::MAX,
        },
    })?;

    let stack_base = STACK_TOP - config.stack_size;
    let map_stack = |addr, len, prot, backing| {
        mem.map_fixed(addr, len, prot, backing, false)
            .map_err(|source| LoadError::Map { addr, source })
    };
    map_stack(stack_base, config.stack_size, Prot::RW, Backing::Anonymous)?;
    map_stack(stack_base - PAGE_SIZE, PAGE_SIZE, Prot::empty(), Backing::Guard)?;

    let sp = build_stack(mem, image.entry, argv, envp, stack_base)?;
    let mut cpu = CpuState::new(CpuMode::Long64);
    cpu.rip = image.entry;
    cpu.set_gpr(Gpr::Rsp, sp);

    tracing::debug!(
        entry = image.entry,
        segments = image.segments.len(),
        brk_start,
        sp,
        "loaded guest image"
    );
    Ok(LoadedImage {
        cpu,
        brk_start,
        stack_top: STACK_TOP,
        stack_base,
    })
}

fn map_segment(mem: &AddressSpace, seg: &Segment, name: &Arc<str>) -> Result<(), LoadError> {
    let base = page_align_down(seg.addr);
    let lead = (seg.addr - base) as usize;
    let map_err = |source| LoadError::Map {
        addr: seg.addr,
        source,
    };
    let end = page_align_up(seg.end()).ok_or_else(|| {
        map_err(MapError::OutOfRange {
            start: seg.addr,
            end: u64::MAX,
        })
    })?;
    if end == base {
        return Ok(());
    }
    // The region starts on a page boundary, so the file contents are shifted by the offset
    // of the segment within its first page.
    let mut data = vec![0u8; lead];
    data.extend_from_slice(&seg.data);
    let backing = Backing::File {
        name: name.clone(),
        data: data.into(),
        offset: 0,
    };
    mem.map_fixed(base, end - base, seg.prot, backing, false)
        .map_err(map_err)?;
    Ok(())
}

/// Deterministic stand-in for the 16 random bytes the kernel provides.
fn random_bytes(seed: u64) -> [u8; 16] {
    let mut x = seed ^ 0x9e37_79b9_7f4a_7c15;
    let mut next = || {
        x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = x;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    };
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&next().to_le_bytes());
    out[8..].copy_from_slice(&next().to_le_bytes());
    out
}

/// Lay out `argc`, `argv`, `envp` and the auxiliary vector below `STACK_TOP` and return the
/// initial stack pointer, which is 16-byte aligned and points at `argc`.
fn build_stack(
    mem: &AddressSpace,
    entry: u64,
    argv: &[&str],
    envp: &[&str],
    stack_base: u64,
) -> Result<u64, LoadError> {
    let mut sp = STACK_TOP;
    let mut push_bytes = |bytes: &[u8]| -> Result<u64, LoadError> {
        sp = sp
            .checked_sub(bytes.len() as u64)
            .filter(|&s| s >= stack_base)
            .ok_or(LoadError::StackOverflow)?;
        mem.write(sp, bytes)?;
        Ok(sp)
    };

    let random = push_bytes(&random_bytes(entry))?;
    let mut c_string = |s: &str| {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        push_bytes(&bytes)
    };
    let env_ptrs = envp
        .iter()
        .map(|s| c_string(s))
        .collect::<Result<Vec<_>, _>>()?;
    let arg_ptrs = argv
        .iter()
        .map(|s| c_string(s))
        .collect::<Result<Vec<_>, _>>()?;

    let auxv = [
        (AT_PAGESZ, PAGE_SIZE),
        (AT_ENTRY, entry),
        (AT_RANDOM, random),
        (AT_UID, crate::syscalls::GUEST_UID),
        (AT_EUID, crate::syscalls::GUEST_UID),
        (AT_GID, crate::syscalls::GUEST_GID),
        (AT_EGID, crate::syscalls::GUEST_GID),
        (AT_SECURE, 0),
        (AT_NULL, 0),
    ];
    let mut words = Vec::with_capacity(3 + arg_ptrs.len() + env_ptrs.len() + auxv.len() * 2);
    words.push(arg_ptrs.len() as u64);
    words.extend(&arg_ptrs);
    words.push(0);
    words.extend(&env_ptrs);
    words.push(0);
    for (key, value) in auxv {
        words.push(key);
        words.push(value);
    }

    let lowest = random.min(arg_ptrs.iter().chain(&env_ptrs).copied().min().unwrap_or(random));
    let table = (lowest & !0xf)
        .checked_sub(words.len() as u64 * 8)
        .map(|s| s & !0xf)
        .filter(|&s| s >= stack_base)
        .ok_or(LoadError::StackOverflow)?;
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    mem.write(table, &bytes)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> GuestImage {
        GuestImage {
            name: "hello".into(),
            entry: 0x40_1000,
            segments: vec![
                Segment::new(0x40_1000, vec![0xc3], Prot::RX),
                Segment::new(0x60_0010, vec![1, 2, 3], Prot::RW).with_mem_size(0x2000),
            ],
        }
    }

    #[test]
    fn segments_are_mapped_with_zero_tails() {
        let mem = AddressSpace::new();
        let loaded = load_image(&mem, &image(), &["hello"], &[], &VmConfig::default()).unwrap();
        assert_eq!(mem.read(0x60_0010, 4).unwrap(), vec![1, 2, 3, 0]);
        assert_eq!(mem.read_u8(0x60_0000).unwrap(), 0);
        assert_eq!(mem.read_u8(0x60_2000).unwrap(), 0);
        assert_eq!(loaded.brk_start, 0x60_3000);
        assert!(mem.write_u8(0x40_1000, 0).is_err());
        let text = mem.translate(0x40_1000).unwrap();
        assert_eq!(text.name.as_deref(), Some("hello"));
    }

    #[test]
    fn initial_stack_follows_the_sysv_layout() {
        let mem = AddressSpace::new();
        let loaded = load_image(
            &mem,
            &image(),
            &["hello", "-v"],
            &["HOME=/"],
            &VmConfig::default(),
        )
        .unwrap();
        let sp = loaded.cpu.gpr(Gpr::Rsp);
        assert_eq!(sp % 16, 0);
        assert_eq!(loaded.cpu.rip, 0x40_1000);

        let word = |i: u64| mem.read_u64(sp + i * 8).unwrap();
        assert_eq!(word(0), 2);
        assert_eq!(mem.read_c_string(word(1), 64).unwrap(), b"hello");
        assert_eq!(mem.read_c_string(word(2), 64).unwrap(), b"-v");
        assert_eq!(word(3), 0);
        assert_eq!(mem.read_c_string(word(4), 64).unwrap(), b"HOME=/");
        assert_eq!(word(5), 0);

        let mut aux = std::collections::HashMap::new();
        let mut i = 6;
        loop {
            let (k, v) = (word(i), word(i + 1));
            if k == AT_NULL {
                break;
            }
            aux.insert(k, v);
            i += 2;
        }
        assert_eq!(aux[&AT_PAGESZ], PAGE_SIZE);
        assert_eq!(aux[&AT_ENTRY], 0x40_1000);
        assert_eq!(mem.read(aux[&AT_RANDOM], 16).unwrap().len(), 16);
    }

    #[test]
    fn guard_page_sits_below_the_stack() {
        let mem = AddressSpace::new();
        let loaded = load_image(&mem, &image(), &[], &[], &VmConfig::default()).unwrap();
        let guard = loaded.stack_base - 1;
        let fault = mem.read_u8(guard).unwrap_err();
        assert!(!fault.is_unmapped());
        assert_eq!(mem.read_u8(loaded.stack_base).unwrap(), 0);
    }

    #[test]
    fn huge_environment_overflows_the_stack() {
        let mem = AddressSpace::new();
        let config = VmConfig {
            stack_size: 2 * PAGE_SIZE,
            ..VmConfig::default()
        };
        let big = "x".repeat(3 * PAGE_SIZE as usize);
        assert!(matches!(
            load_image(&mem, &image(), &[big.as_str()], &[], &config),
            Err(LoadError::StackOverflow)
        ));
    }

    #[test]
    fn invalid_config_is_rejected_before_mapping() {
        let mem = AddressSpace::new();
        let config = VmConfig {
            stack_size: STACK_TOP + PAGE_SIZE,
            ..VmConfig::default()
        };
        assert!(matches!(
            load_image(&mem, &image(), &[], &[], &config),
            Err(LoadError::Config(ConfigError::Invalid {
                field: "stack_size",
                ..
            }))
        ));
        assert!(mem.regions().is_empty());
    }

    #[test]
    fn overlapping_segments_are_rejected() {
        let mem = AddressSpace::new();
        let mut img = image();
        img.segments.push(Segment::new(0x40_1800, vec![0], Prot::RW));
        assert!(matches!(
            load_image(&mem, &img, &[], &[], &VmConfig::default()),
            Err(LoadError::Map { addr: 0x40_1800, .. })
        ));
    }
}
