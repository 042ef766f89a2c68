//! One emulated process: the state its threads share.

use crate::cache::TranslationCache;
use crate::config::{ConfigError, VmConfig};
use crate::cpuid::CpuidTable;
use crate::exec::Engine;
use crate::signal::SignalTable;
use crate::state::CpuState;
use crate::syscall::SyscallHandler;
use crate::trace::TraceSink;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What the registry knows about a live thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: u32,
    /// Guest address cleared on exit (`set_tid_address`); 0 when unset.
    pub clear_child_tid: u64,
}

pub struct Process {
    pid: u32,
    config: VmConfig,
    mem: Arc<vmx86_mem::AddressSpace>,
    cache: Arc<TranslationCache>,
    signals: SignalTable,
    syscalls: Arc<dyn SyscallHandler>,
    cpuid: CpuidTable,
    trace: Option<Arc<dyn TraceSink>>,
    threads: Mutex<BTreeMap<u32, ThreadInfo>>,
    next_tid: AtomicU32,
    exiting: AtomicBool,
    exit_code: AtomicI32,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("threads", &self.thread_ids())
            .field("exiting", &self.is_exiting())
            .finish_non_exhaustive()
    }
}

impl Process {
    pub fn new(
        pid: u32,
        config: VmConfig,
        mem: Arc<vmx86_mem::AddressSpace>,
        syscalls: Arc<dyn SyscallHandler>,
    ) -> Result<Arc<Self>, ConfigError> {
        Self::with_trace(pid, config, mem, syscalls, None)
    }

    /// Fails if `config` does not pass [`VmConfig::validate`].
    pub fn with_trace(
        pid: u32,
        config: VmConfig,
        mem: Arc<vmx86_mem::AddressSpace>,
        syscalls: Arc<dyn SyscallHandler>,
        trace: Option<Arc<dyn TraceSink>>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let cache = TranslationCache::new(
            mem.clone(),
            config.translate_options(),
            config.cache_max_blocks,
        );
        let cpuid = CpuidTable::new(&config.cpuid_vendor, &config.cpuid_brand);
        Ok(Arc::new(Self {
            pid,
            config,
            mem,
            cache,
            signals: SignalTable::new(),
            syscalls,
            cpuid,
            trace,
            threads: Mutex::new(BTreeMap::new()),
            // The first thread is the thread-group leader and shares the pid.
            next_tid: AtomicU32::new(pid),
            exiting: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
        }))
    }

    fn threads(&self) -> MutexGuard<'_, BTreeMap<u32, ThreadInfo>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new thread starting from `cpu` and return the engine that runs it.
    pub fn spawn_thread(self: &Arc<Self>, cpu: CpuState) -> Engine {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        self.threads().insert(
            tid,
            ThreadInfo {
                tid,
                clear_child_tid: 0,
            },
        );
        tracing::debug!(pid = self.pid, tid, rip = cpu.rip, "spawned thread");
        Engine::new(self.clone(), tid, cpu)
    }

    pub(crate) fn deregister(&self, tid: u32) {
        let info = self.threads().remove(&tid);
        if let Some(ThreadInfo {
            clear_child_tid, ..
        }) = info
        {
            if clear_child_tid != 0 {
                // The thread is gone either way; a bad address is the guest's problem.
                let _ = self.mem.write_u32(clear_child_tid, 0);
            }
        }
        tracing::debug!(pid = self.pid, tid, "thread exited");
    }

    /// Record the address `set_tid_address` gave for `tid`.
    pub fn set_clear_child_tid(&self, tid: u32, addr: u64) {
        if let Some(info) = self.threads().get_mut(&tid) {
            info.clear_child_tid = addr;
        }
    }

    pub fn thread_ids(&self) -> Vec<u32> {
        self.threads().keys().copied().collect()
    }

    pub fn thread_count(&self) -> usize {
        self.threads().len()
    }

    /// `exit_group`: every thread halts at its next block boundary. The first code wins.
    pub fn request_exit(&self, code: i32) {
        if self
            .exiting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.exit_code.store(code, Ordering::SeqCst);
            tracing::debug!(pid = self.pid, code, "process exiting");
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.is_exiting()
            .then(|| self.exit_code.load(Ordering::SeqCst))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn mem(&self) -> &Arc<vmx86_mem::AddressSpace> {
        &self.mem
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        &self.cache
    }

    pub fn signals(&self) -> &SignalTable {
        &self.signals
    }

    pub fn cpuid(&self) -> &CpuidTable {
        &self.cpuid
    }

    pub(crate) fn syscalls(&self) -> &dyn SyscallHandler {
        &*self.syscalls
    }

    pub(crate) fn trace(&self) -> Option<&dyn TraceSink> {
        self.trace.as_deref()
    }
}
