//! Translation cache: guest entry address to translated block.
//!
//! Blocks are keyed by the exact entry address they were built from; overlapping blocks with
//! different entries are independent. Each block is registered with the address space under a
//! [`CodeKey`], and the cache is the address space's [`WriteObserver`]: a store into a block's
//! byte range removes the block before the new bytes become readable. A page-version snapshot
//! taken while the block's bytes were fetched is checked before a fresh block is handed out and
//! again on every hit.

use lru::LruCache;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use vmx86_jit::{Block, CodeSource, TranslateError, TranslateOptions};
use vmx86_mem::{AddressSpace, CodeKey, CodeSnapshot, MemoryFault, WriteObserver};
use vmx86_x86::DecodeMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub live: usize,
}

struct Entry {
    key: CodeKey,
    mode: DecodeMode,
    block: Arc<Block>,
    snapshot: CodeSnapshot,
}

struct Inner {
    blocks: LruCache<u64, Entry>,
    /// Entry address of the block each live key belongs to.
    keys: rustc_hash::FxHashMap<CodeKey, u64>,
    building: FxHashSet<u64>,
}

impl Inner {
    fn remove(&mut self, entry: u64) -> Option<Entry> {
        let e = self.blocks.pop(&entry)?;
        self.keys.remove(&e.key);
        Some(e)
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

pub struct TranslationCache {
    mem: Arc<AddressSpace>,
    opts: TranslateOptions,
    inner: Mutex<Inner>,
    built: Condvar,
    next_key: AtomicU64,
    counters: Counters,
}

/// Fetches code through the address space while recording the versions of the pages read.
struct WatchingFetcher<'a> {
    mem: &'a AddressSpace,
    snapshot: CodeSnapshot,
}

impl CodeSource for WatchingFetcher<'_> {
    fn fetch(&mut self, rip: u64, buf: &mut [u8]) -> Result<usize, MemoryFault> {
        let end = rip.saturating_add(buf.len() as u64);
        // Watch before reading so a store in between is seen as a version change.
        self.mem.watch_code(rip, end, &mut self.snapshot);
        self.mem.fetch(rip, buf)
    }
}

/// Clears the in-flight marker for `entry` however the build ends.
struct BuildGuard<'a> {
    cache: &'a TranslationCache,
    entry: u64,
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.cache.lock().building.remove(&self.entry);
        self.cache.built.notify_all();
    }
}

impl TranslationCache {
    /// Create a cache over `mem` and install it as the address space's write observer.
    pub fn new(mem: Arc<AddressSpace>, opts: TranslateOptions, capacity: usize) -> Arc<Self> {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let cache = Arc::new(Self {
            mem,
            opts,
            inner: Mutex::new(Inner {
                blocks: LruCache::new(capacity),
                keys: Default::default(),
                building: Default::default(),
            }),
            built: Condvar::new(),
            next_key: AtomicU64::new(1),
            counters: Counters::default(),
        });
        let observer: Weak<dyn WriteObserver> = Arc::downgrade(&cache) as Weak<dyn WriteObserver>;
        cache.mem.set_write_observer(observer);
        cache
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.mem
    }

    /// The block starting at `entry`, translating it if it is not cached.
    ///
    /// At most one translation per entry address runs at a time; concurrent callers wait for
    /// it and then share its result.
    pub fn lookup_or_build(&self, entry: u64, mode: DecodeMode) -> Result<Arc<Block>, TranslateError> {
        self.lookup_or_build_with(entry, mode, |fetcher| {
            vmx86_jit::build(fetcher, entry, mode, &self.opts)
        })
    }

    fn lookup_or_build_with<F>(
        &self,
        entry: u64,
        mode: DecodeMode,
        mut translate: F,
    ) -> Result<Arc<Block>, TranslateError>
    where
        F: FnMut(&mut WatchingFetcher<'_>) -> Result<Block, TranslateError>,
    {
        {
            let mut inner = self.lock();
            loop {
                if let Some(block) = self.hit(&mut inner, entry, mode) {
                    return Ok(block);
                }
                if !inner.building.contains(&entry) {
                    inner.building.insert(entry);
                    break;
                }
                inner = self
                    .built
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let _guard = BuildGuard { cache: self, entry };

        // A store that lands while the bytes are being translated leaves the snapshot behind;
        // such a block never reaches the caller, the entry is translated again instead.
        let (key, block, snapshot, mut inner) = loop {
            let mut fetcher = WatchingFetcher {
                mem: &self.mem,
                snapshot: CodeSnapshot::new(),
            };
            let block = Arc::new(translate(&mut fetcher)?);
            self.counters.builds.fetch_add(1, Ordering::Relaxed);
            let mut snapshot = fetcher.snapshot;
            snapshot.retain_range(block.entry, block.end.max(block.entry + 1));

            let key = CodeKey(self.next_key.fetch_add(1, Ordering::Relaxed));
            self.mem.register_code(key, block.entry, block.end);

            let inner = self.lock();
            if snapshot.is_current() {
                break (key, block, snapshot, inner);
            }
            drop(inner);
            self.mem.unregister_code(key, block.entry, block.end);
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(entry, "retranslating block raced by a store");
        };

        if let Some(old) = inner.remove(entry) {
            self.mem.unregister_code(old.key, old.block.entry, old.block.end);
        }
        inner.keys.insert(key, entry);
        let evicted = inner.blocks.push(
            entry,
            Entry {
                key,
                mode,
                block: block.clone(),
                snapshot,
            },
        );
        if let Some((evicted_entry, e)) = evicted {
            inner.keys.remove(&e.key);
            self.mem.unregister_code(e.key, e.block.entry, e.block.end);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(entry = evicted_entry, "evicted translated block");
        }
        tracing::debug!(
            entry,
            end = block.end,
            guest_insts = block.guest_insts,
            "cached translated block"
        );
        Ok(block)
    }

    fn hit(&self, inner: &mut Inner, entry: u64, mode: DecodeMode) -> Option<Arc<Block>> {
        let fresh = {
            let e = inner.blocks.get(&entry)?;
            e.mode == mode && e.snapshot.is_current()
        };
        if fresh {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return inner.blocks.peek(&entry).map(|e| e.block.clone());
        }
        if let Some(stale) = inner.remove(entry) {
            self.mem
                .unregister_code(stale.key, stale.block.entry, stale.block.end);
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// The cached block at `entry`, if any, without translating.
    pub fn lookup(&self, entry: u64) -> Option<Arc<Block>> {
        let inner = self.lock();
        inner
            .blocks
            .peek(&entry)
            .filter(|e| e.snapshot.is_current())
            .map(|e| e.block.clone())
    }

    pub fn contains(&self, entry: u64) -> bool {
        self.lookup(entry).is_some()
    }

    /// Drop every block whose guest bytes intersect `[start, end)`.
    pub fn invalidate_range(&self, start: u64, end: u64) {
        // Routed through the address space so page versions move too; the removals come back
        // through `code_invalidated`.
        self.mem.invalidate_code(start, end);
    }

    /// Drop everything.
    pub fn flush(&self) {
        let mut inner = self.lock();
        let n = inner.blocks.len();
        while let Some((_, e)) = inner.blocks.pop_lru() {
            self.mem.unregister_code(e.key, e.block.entry, e.block.end);
        }
        inner.keys.clear();
        self.counters
            .invalidations
            .fetch_add(n as u64, Ordering::Relaxed);
        tracing::debug!(blocks = n, "flushed translation cache");
    }

    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            builds: self.counters.builds.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            live: self.len(),
        }
    }
}

impl WriteObserver for TranslationCache {
    fn code_invalidated(&self, keys: &[CodeKey]) {
        let mut inner = self.lock();
        let mut removed = 0u64;
        for key in keys {
            let Some(entry) = inner.keys.get(key).copied() else {
                continue;
            };
            inner.remove(entry);
            removed += 1;
        }
        if removed > 0 {
            self.counters
                .invalidations
                .fetch_add(removed, Ordering::Relaxed);
            tracing::debug!(blocks = removed, "invalidated translated blocks");
        }
    }
}
