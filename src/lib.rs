//! User-mode x86-64 emulation with dynamic block translation.
//!
//! This crate re-exports the pieces most embedders need. A guest is usually started through
//! [`posix::boot`], which loads an image into a fresh address space, wires up the Linux
//! system-call shim and returns the engine of the main thread:
//!
//! ```no_run
//! use vmx86::mem::Prot;
//! use vmx86::posix::{boot, GuestImage, Segment};
//! use vmx86::VmConfig;
//!
//! let image = GuestImage {
//!     name: "exit".into(),
//!     entry: 0x40_0000,
//!     // mov edi, 3; mov eax, 231; syscall
//!     segments: vec![Segment::new(
//!         0x40_0000,
//!         vec![0xbf, 3, 0, 0, 0, 0xb8, 0xe7, 0, 0, 0, 0x0f, 0x05],
//!         Prot::RX,
//!     )],
//! };
//! let mut booted = boot(1, &image, &["exit"], &[], VmConfig::default())?;
//! println!("{}", booted.main.run());
//! # Ok::<(), vmx86::posix::LoadError>(())
//! ```

pub use vmx86_cpu_core as cpu;
pub use vmx86_mem as mem;
pub use vmx86_posix as posix;
pub use vmx86_types as types;

pub use vmx86_cpu_core::{
    CpuState, Engine, EngineState, ExitReason, Process, TranslationCache, VmConfig,
};
pub use vmx86_mem::{AddressSpace, MemoryFault};
