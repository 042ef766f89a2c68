//! x86-64 Linux system calls on top of the emulated address space.
//!
//! Arguments arrive in RDI, RSI, RDX, R10, R8 and R9. Failures are reported as
//! [`SyscallError`]s; the engine turns them into `-errno` in RAX.

use crate::errno::{EBADF, EEXIST, EFAULT, EINVAL, ENODEV, ENOMEM, ENOSYS, EPERM};
use crate::output::CapturedOutput;
use std::sync::{Arc, Mutex, PoisonError};
use vmx86_cpu_core::signal::{self, sig_bit, SigAction, SignalTable, SIGKILL, SIGSTOP};
use vmx86_cpu_core::{CpuState, SyscallContext, SyscallError, SyscallHandler, SyscallOutcome};
use vmx86_mem::{
    is_page_aligned, page_align_up, AddressSpace, Backing, MapError, MemoryFault, Prot,
    USER_ADDRESS_LIMIT,
};
use vmx86_types::Gpr;

/// System call numbers handled here.
pub mod nr {
    pub const READ: u64 = 0;
    pub const WRITE: u64 = 1;
    pub const MMAP: u64 = 9;
    pub const MPROTECT: u64 = 10;
    pub const MUNMAP: u64 = 11;
    pub const BRK: u64 = 12;
    pub const RT_SIGACTION: u64 = 13;
    pub const RT_SIGPROCMASK: u64 = 14;
    pub const RT_SIGRETURN: u64 = 15;
    pub const WRITEV: u64 = 20;
    pub const GETPID: u64 = 39;
    pub const EXIT: u64 = 60;
    pub const UNAME: u64 = 63;
    pub const GETUID: u64 = 102;
    pub const GETGID: u64 = 104;
    pub const GETEUID: u64 = 107;
    pub const GETEGID: u64 = 108;
    pub const ARCH_PRCTL: u64 = 158;
    pub const GETTID: u64 = 186;
    pub const SET_TID_ADDRESS: u64 = 218;
    pub const EXIT_GROUP: u64 = 231;
}

const MAP_SHARED: u64 = 0x01;
const MAP_PRIVATE: u64 = 0x02;
const MAP_TYPE: u64 = 0x0f;
const MAP_FIXED: u64 = 0x10;
const MAP_ANONYMOUS: u64 = 0x20;
const MAP_FIXED_NOREPLACE: u64 = 0x10_0000;

const ARCH_SET_GS: u64 = 0x1001;
const ARCH_SET_FS: u64 = 0x1002;
const ARCH_GET_FS: u64 = 0x1003;
const ARCH_GET_GS: u64 = 0x1004;

const SIG_BLOCK: u64 = 0;
const SIG_UNBLOCK: u64 = 1;
const SIG_SETMASK: u64 = 2;
const SIGSET_SIZE: u64 = 8;
/// `struct sigaction` as the x86-64 kernel reads it: handler, flags, restorer, mask.
const SIGACTION_SIZE: usize = 32;

const IOV_MAX: u64 = 1024;
/// Largest transfer one read or write call performs; longer requests are cut short.
const MAX_RW_COUNT: u64 = 0x7fff_f000;
const UTSNAME_FIELD: usize = 65;

/// Identity every guest process runs as.
pub const GUEST_UID: u64 = 1000;
pub const GUEST_GID: u64 = 1000;

type SysResult = Result<SyscallOutcome, SyscallError>;

fn err(errno: i32) -> SysResult {
    Err(SyscallError::new(errno))
}

fn efault(_: MemoryFault) -> SyscallError {
    SyscallError::new(EFAULT)
}

fn map_errno(e: MapError) -> SyscallError {
    SyscallError::new(match e {
        MapError::ZeroLength | MapError::Unaligned(_) => EINVAL,
        MapError::Overlap { .. } => EEXIST,
        MapError::OutOfRange { .. } | MapError::NoSpace { .. } | MapError::NotMapped { .. } => {
            ENOMEM
        }
    })
}

fn ret(v: u64) -> SysResult {
    Ok(SyscallOutcome::Return(v))
}

#[derive(Debug)]
struct Brk {
    start: u64,
    current: u64,
}

/// The program break and the rest of the per-process policy state.
#[derive(Debug)]
pub struct LinuxSyscalls {
    brk: Mutex<Brk>,
    brk_max: u64,
    output: Arc<CapturedOutput>,
}

impl LinuxSyscalls {
    /// `brk_start` is the first byte past the loaded image; the heap may grow `brk_max` bytes
    /// beyond it.
    pub fn new(brk_start: u64, brk_max: u64, output: Arc<CapturedOutput>) -> Self {
        Self {
            brk: Mutex::new(Brk {
                start: brk_start,
                current: brk_start,
            }),
            brk_max,
            output,
        }
    }

    pub fn output(&self) -> &Arc<CapturedOutput> {
        &self.output
    }

    pub fn current_brk(&self) -> u64 {
        self.brk.lock().unwrap_or_else(PoisonError::into_inner).current
    }

    fn read(&self, fd: u64, _buf: u64, _count: u64) -> SysResult {
        match fd {
            // stdin is always at end of file.
            0 => ret(0),
            _ => err(EBADF),
        }
    }

    fn write(&self, mem: &AddressSpace, fd: u64, buf: u64, count: u64) -> SysResult {
        if fd != 1 && fd != 2 {
            return err(EBADF);
        }
        let count = count.min(MAX_RW_COUNT);
        let bytes = mem.read(buf, count as usize).map_err(efault)?;
        self.output.append(fd, &bytes);
        ret(count)
    }

    fn writev(&self, mem: &AddressSpace, fd: u64, iov: u64, iovcnt: u64) -> SysResult {
        if fd != 1 && fd != 2 {
            return err(EBADF);
        }
        if iovcnt > IOV_MAX {
            return err(EINVAL);
        }
        // Gather everything first so a bad vector writes nothing.
        let mut segments = Vec::new();
        for i in 0..iovcnt {
            let entry = iov.wrapping_add(i * 16);
            let base = mem.read_u64(entry).map_err(efault)?;
            let len = mem.read_u64(entry.wrapping_add(8)).map_err(efault)?;
            // Lengths are signed in the kernel's view.
            if len > i64::MAX as u64 {
                return err(EINVAL);
            }
            segments.push((base, len));
        }
        let mut bytes = Vec::new();
        let mut budget = MAX_RW_COUNT;
        for (base, len) in segments {
            let len = len.min(budget);
            bytes.extend(mem.read(base, len as usize).map_err(efault)?);
            budget -= len;
        }
        self.output.append(fd, &bytes);
        ret(bytes.len() as u64)
    }

    fn mmap(&self, mem: &AddressSpace, args: [u64; 6]) -> SysResult {
        let [addr, len, prot, flags, _fd, offset] = args;
        if len == 0 || !is_page_aligned(offset) {
            return err(EINVAL);
        }
        if !matches!(flags & MAP_TYPE, MAP_SHARED | MAP_PRIVATE) {
            return err(EINVAL);
        }
        if flags & MAP_ANONYMOUS == 0 {
            // No file descriptors exist to map.
            return err(ENODEV);
        }
        let prot = Prot::from_linux(prot);
        let base = if flags & (MAP_FIXED | MAP_FIXED_NOREPLACE) != 0 {
            if !is_page_aligned(addr) {
                return err(EINVAL);
            }
            let replace = flags & MAP_FIXED_NOREPLACE == 0;
            mem.map_fixed(addr, len, prot, Backing::Anonymous, replace)
        } else {
            mem.map(addr, len, prot, Backing::Anonymous)
        }
        .map_err(map_errno)?;
        ret(base)
    }

    fn munmap(&self, mem: &AddressSpace, addr: u64, len: u64) -> SysResult {
        mem.unmap(addr, len).map_err(map_errno)?;
        ret(0)
    }

    fn mprotect(&self, mem: &AddressSpace, addr: u64, len: u64, prot: u64) -> SysResult {
        if len == 0 && is_page_aligned(addr) {
            return ret(0);
        }
        mem.protect(addr, len, Prot::from_linux(prot))
            .map_err(map_errno)?;
        ret(0)
    }

    /// Move the break. Never fails: a refused request reports the unchanged break.
    fn brk(&self, mem: &AddressSpace, addr: u64) -> SysResult {
        let mut brk = self.brk.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = brk.start.saturating_add(self.brk_max);
        if addr < brk.start || addr > limit {
            return ret(brk.current);
        }
        let (Some(old_top), Some(new_top)) = (page_align_up(brk.current), page_align_up(addr))
        else {
            return ret(brk.current);
        };
        let resized = if new_top > old_top {
            mem.map_fixed(old_top, new_top - old_top, Prot::RW, Backing::Anonymous, false)
                .map(|_| ())
        } else if new_top < old_top {
            mem.unmap(new_top, old_top - new_top)
        } else {
            Ok(())
        };
        if let Err(e) = resized {
            tracing::debug!(addr, error = %e, "brk refused");
            return ret(brk.current);
        }
        brk.current = addr;
        ret(addr)
    }

    fn arch_prctl(&self, cpu: &mut CpuState, mem: &AddressSpace, code: u64, addr: u64) -> SysResult {
        match code {
            ARCH_SET_FS | ARCH_SET_GS if addr >= USER_ADDRESS_LIMIT => err(EPERM),
            ARCH_SET_FS => {
                cpu.fs_base = addr;
                ret(0)
            }
            ARCH_SET_GS => {
                cpu.gs_base = addr;
                ret(0)
            }
            ARCH_GET_FS => {
                mem.write_u64(addr, cpu.fs_base).map_err(efault)?;
                ret(0)
            }
            ARCH_GET_GS => {
                mem.write_u64(addr, cpu.gs_base).map_err(efault)?;
                ret(0)
            }
            _ => err(EINVAL),
        }
    }

    fn rt_sigaction(
        &self,
        mem: &AddressSpace,
        table: &SignalTable,
        args: [u64; 4],
    ) -> SysResult {
        let [signo, act, oldact, sigsetsize] = args;
        if sigsetsize != SIGSET_SIZE {
            return err(EINVAL);
        }
        let signo = u32::try_from(signo).unwrap_or(0);
        let Some(old) = table.get(signo) else {
            return err(EINVAL);
        };
        let new = if act != 0 {
            if signo == SIGKILL || signo == SIGSTOP {
                return err(EINVAL);
            }
            let raw = mem.read(act, SIGACTION_SIZE).map_err(efault)?;
            let word = |i: usize| {
                let mut b = [0u8; 8];
                b.copy_from_slice(&raw[i * 8..i * 8 + 8]);
                u64::from_le_bytes(b)
            };
            Some(SigAction {
                handler: word(0),
                flags: word(1),
                restorer: word(2),
                mask: word(3) & !(sig_bit(SIGKILL) | sig_bit(SIGSTOP)),
            })
        } else {
            None
        };
        if oldact != 0 {
            let mut raw = Vec::with_capacity(SIGACTION_SIZE);
            for w in [old.handler, old.flags, old.restorer, old.mask] {
                raw.extend_from_slice(&w.to_le_bytes());
            }
            mem.write(oldact, &raw).map_err(efault)?;
        }
        if let Some(action) = new {
            table.set(signo, action);
            tracing::debug!(signo, handler = action.handler, "installed signal handler");
        }
        ret(0)
    }

    fn rt_sigprocmask(&self, cpu: &mut CpuState, mem: &AddressSpace, args: [u64; 4]) -> SysResult {
        let [how, set, oldset, sigsetsize] = args;
        if sigsetsize != SIGSET_SIZE {
            return err(EINVAL);
        }
        let old = cpu.signal_mask;
        if set != 0 {
            let requested = mem.read_u64(set).map_err(efault)?;
            let mask = match how {
                SIG_BLOCK => old | requested,
                SIG_UNBLOCK => old & !requested,
                SIG_SETMASK => requested,
                _ => return err(EINVAL),
            };
            cpu.signal_mask = mask & !(sig_bit(SIGKILL) | sig_bit(SIGSTOP));
        }
        if oldset != 0 {
            mem.write_u64(oldset, old).map_err(efault)?;
        }
        ret(0)
    }

    fn uname(&self, mem: &AddressSpace, buf: u64) -> SysResult {
        let fields = ["Linux", "vmx86", "5.15.0-vmx86", "#1 SMP", "x86_64", "(none)"];
        let mut raw = vec![0u8; fields.len() * UTSNAME_FIELD];
        for (i, f) in fields.iter().enumerate() {
            raw[i * UTSNAME_FIELD..i * UTSNAME_FIELD + f.len()].copy_from_slice(f.as_bytes());
        }
        mem.write(buf, &raw).map_err(efault)?;
        ret(0)
    }
}

impl SyscallHandler for LinuxSyscalls {
    fn handle_syscall(
        &self,
        cpu: &mut CpuState,
        mem: &AddressSpace,
        ctx: &SyscallContext<'_>,
    ) -> SysResult {
        let sysno = cpu.gpr(Gpr::Rax);
        let a = [
            cpu.gpr(Gpr::Rdi),
            cpu.gpr(Gpr::Rsi),
            cpu.gpr(Gpr::Rdx),
            cpu.gpr(Gpr::R10),
            cpu.gpr(Gpr::R8),
            cpu.gpr(Gpr::R9),
        ];
        match sysno {
            nr::READ => self.read(a[0], a[1], a[2]),
            nr::WRITE => self.write(mem, a[0], a[1], a[2]),
            nr::WRITEV => self.writev(mem, a[0], a[1], a[2]),
            nr::MMAP => self.mmap(mem, a),
            nr::MUNMAP => self.munmap(mem, a[0], a[1]),
            nr::MPROTECT => self.mprotect(mem, a[0], a[1], a[2]),
            nr::BRK => self.brk(mem, a[0]),
            nr::EXIT => Ok(SyscallOutcome::ExitThread(a[0] as i32)),
            nr::EXIT_GROUP => Ok(SyscallOutcome::ExitGroup(a[0] as i32)),
            nr::ARCH_PRCTL => self.arch_prctl(cpu, mem, a[0], a[1]),
            nr::RT_SIGACTION => {
                self.rt_sigaction(mem, ctx.process.signals(), [a[0], a[1], a[2], a[3]])
            }
            nr::RT_SIGPROCMASK => self.rt_sigprocmask(cpu, mem, [a[0], a[1], a[2], a[3]]),
            nr::RT_SIGRETURN => {
                signal::restore_frame(cpu, mem).map_err(efault)?;
                Ok(SyscallOutcome::Restored)
            }
            nr::GETPID => ret(u64::from(ctx.process.pid())),
            nr::GETTID => ret(u64::from(ctx.tid)),
            nr::GETUID | nr::GETEUID => ret(GUEST_UID),
            nr::GETGID | nr::GETEGID => ret(GUEST_GID),
            nr::SET_TID_ADDRESS => {
                ctx.process.set_clear_child_tid(ctx.tid, a[0]);
                ret(u64::from(ctx.tid))
            }
            nr::UNAME => self.uname(mem, a[0]),
            _ => {
                tracing::debug!(sysno, rip = cpu.rip, "unimplemented syscall");
                err(ENOSYS)
            }
        }
    }
}
