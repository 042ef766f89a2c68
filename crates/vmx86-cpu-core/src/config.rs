use serde::{Deserialize, Serialize};
use vmx86_jit::{BlockLimits, TranslateOptions};
use vmx86_mem::{is_page_aligned, PAGE_SIZE, USER_ADDRESS_LIMIT};
use vmx86_x86::MAX_INSTRUCTION_LEN;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Largest initial stack a process may ask for.
pub const MAX_STACK_SIZE: u64 = 1 << 30;

/// Tunables of one emulated process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub max_block_insts: usize,
    pub max_block_bytes: usize,
    /// Translated blocks kept before the least recently used ones are evicted.
    pub cache_max_blocks: usize,
    pub eliminate_dead_flags: bool,
    /// Emit a trace event per executed block (traps, syscalls and exits are always traced).
    pub trace_blocks: bool,
    pub stack_size: u64,
    pub mmap_base: u64,
    pub brk_max: u64,
    pub cpuid_vendor: String,
    pub cpuid_brand: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_block_insts: 64,
            max_block_bytes: 1024,
            cache_max_blocks: 8192,
            eliminate_dead_flags: true,
            trace_blocks: false,
            stack_size: 8 << 20,
            mmap_base: 0x7f00_0000_0000,
            brk_max: 256 << 20,
            cpuid_vendor: "VMX86VMX86VM".to_string(),
            cpuid_brand: "vmx86 virtual x86-64 processor".to_string(),
        }
    }
}

impl VmConfig {
    /// Parse and validate. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });
        if self.max_block_insts == 0 {
            return invalid("max_block_insts", "must be at least 1");
        }
        if self.max_block_bytes < MAX_INSTRUCTION_LEN {
            return invalid("max_block_bytes", "must fit one maximum-length instruction");
        }
        if self.cache_max_blocks == 0 {
            return invalid("cache_max_blocks", "must be at least 1");
        }
        if self.stack_size < 2 * PAGE_SIZE || !is_page_aligned(self.stack_size) {
            return invalid("stack_size", "must be page aligned and at least two pages");
        }
        if self.stack_size > MAX_STACK_SIZE {
            return invalid("stack_size", "must be at most 1 GiB");
        }
        if !is_page_aligned(self.mmap_base) || self.mmap_base >= USER_ADDRESS_LIMIT {
            return invalid("mmap_base", "must be a page-aligned user address");
        }
        if !is_page_aligned(self.brk_max) {
            return invalid("brk_max", "must be page aligned");
        }
        if self.cpuid_vendor.len() != 12 || !self.cpuid_vendor.is_ascii() {
            return invalid("cpuid_vendor", "must be exactly 12 ASCII characters");
        }
        if self.cpuid_brand.len() > 47 || !self.cpuid_brand.is_ascii() {
            return invalid("cpuid_brand", "must be at most 47 ASCII characters");
        }
        Ok(())
    }

    pub fn block_limits(&self) -> BlockLimits {
        BlockLimits {
            max_insts: self.max_block_insts,
            max_bytes: self.max_block_bytes,
        }
    }

    pub fn translate_options(&self) -> TranslateOptions {
        TranslateOptions {
            limits: self.block_limits(),
            eliminate_dead_flags: self.eliminate_dead_flags,
        }
    }
}
