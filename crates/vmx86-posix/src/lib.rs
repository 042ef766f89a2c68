//! Linux user-space personality for the emulator core: a system-call shim and the loader
//! that prepares a process image.

pub mod errno;
pub mod image;
pub mod output;
pub mod syscalls;

pub use image::{load_image, GuestImage, LoadError, LoadedImage, Segment};
pub use output::CapturedOutput;
pub use syscalls::LinuxSyscalls;

use std::sync::Arc;
use vmx86_cpu_core::{Engine, Process, VmConfig};
use vmx86_mem::AddressSpace;

/// A freshly started guest process.
pub struct Booted {
    pub process: Arc<Process>,
    /// Engine of the main thread, not yet run.
    pub main: Engine,
    pub output: Arc<CapturedOutput>,
}

/// Load `image` into a new address space and create its process and main thread.
pub fn boot(
    pid: u32,
    image: &GuestImage,
    argv: &[&str],
    envp: &[&str],
    config: VmConfig,
) -> Result<Booted, LoadError> {
    let mem = Arc::new(AddressSpace::with_mmap_base(config.mmap_base));
    let loaded = load_image(&mem, image, argv, envp, &config)?;
    let output = Arc::new(CapturedOutput::new());
    let syscalls = LinuxSyscalls::new(loaded.brk_start, config.brk_max, output.clone());
    let process = Process::new(pid, config, mem, Arc::new(syscalls))?;
    let main = process.spawn_thread(loaded.cpu);
    Ok(Booted {
        process,
        main,
        output,
    })
}
