//! Registry of guest ranges that translated code was derived from.
//!
//! Two mechanisms cooperate:
//!
//! - Every page code has been fetched from carries a version counter. A [`CodeSnapshot`]
//!   records the counters of the pages a block was built from; any store, unmap or protection
//!   change on such a page bumps its counter, so a snapshot taken before the change can never
//!   validate afterwards.
//! - Each registered block range is filed under the pages it covers, keyed by an opaque
//!   [`CodeKey`] chosen by the translation cache. A store that intersects a registered range
//!   removes it and reports its key to the [`WriteObserver`] before the store returns.
//!
//! The registry only ever calls out to the observer; the observer owns its blocks and never
//! hands them back. Calls into the observer happen with no registry lock held.

use crate::page_of;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Identifies one registered code range. Allocated by the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeKey(pub u64);

/// Receives the keys of code ranges invalidated by guest stores or mapping changes.
pub trait WriteObserver: Send + Sync {
    fn code_invalidated(&self, keys: &[CodeKey]);
}

#[derive(Debug, Clone, Copy)]
struct CodeRange {
    key: CodeKey,
    start: u64,
    end: u64,
}

impl CodeRange {
    fn intersects(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

struct PageWatch {
    version: Arc<AtomicU32>,
    ranges: Vec<CodeRange>,
}

#[derive(Default)]
struct RegistryInner {
    pages: FxHashMap<u64, PageWatch>,
    observer: Option<Weak<dyn WriteObserver>>,
}

#[derive(Default)]
pub(crate) struct CodeRegistry {
    /// Number of watched pages; lets stores skip the lock when no code exists.
    watched: AtomicUsize,
    inner: Mutex<RegistryInner>,
}

/// Page versions observed while fetching the bytes of one translated block.
#[derive(Debug, Clone, Default)]
pub struct CodeSnapshot {
    pages: Vec<(u64, Arc<AtomicU32>, u32)>,
}

impl CodeSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while none of the recorded pages has changed since it was recorded.
    pub fn is_current(&self) -> bool {
        self.pages
            .iter()
            .all(|(_, version, seen)| version.load(Ordering::SeqCst) == *seen)
    }

    pub fn contains_page(&self, page: u64) -> bool {
        self.pages.iter().any(|(p, _, _)| *p == page)
    }

    pub fn pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages.iter().map(|(p, _, _)| *p)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Forget pages outside `[start, end)`; bytes there were fetched but never consumed.
    pub fn retain_range(&mut self, start: u64, end: u64) {
        let first = page_of(start);
        let last = if end > start { page_of(end - 1) } else { first };
        self.pages.retain(|(p, _, _)| (first..=last).contains(p));
    }
}

fn pages_of(start: u64, end: u64) -> impl Iterator<Item = u64> {
    let first = page_of(start);
    let last = if end > start { page_of(end - 1) } else { first };
    first..=last
}

impl CodeRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_observer(&self, observer: Weak<dyn WriteObserver>) {
        self.lock().observer = Some(observer);
    }

    /// Start watching the pages of `[start, end)` and record their current versions.
    pub(crate) fn watch(&self, start: u64, end: u64, snapshot: &mut CodeSnapshot) {
        let mut inner = self.lock();
        for page in pages_of(start, end) {
            if snapshot.contains_page(page) {
                continue;
            }
            let watch = inner.pages.entry(page).or_insert_with(|| {
                self.watched.fetch_add(1, Ordering::SeqCst);
                PageWatch {
                    version: Arc::new(AtomicU32::new(0)),
                    ranges: Vec::new(),
                }
            });
            let seen = watch.version.load(Ordering::SeqCst);
            snapshot.pages.push((page, watch.version.clone(), seen));
        }
    }

    pub(crate) fn register(&self, key: CodeKey, start: u64, end: u64) {
        let range = CodeRange { key, start, end };
        let mut inner = self.lock();
        for page in pages_of(start, end) {
            let watch = inner.pages.entry(page).or_insert_with(|| {
                self.watched.fetch_add(1, Ordering::SeqCst);
                PageWatch {
                    version: Arc::new(AtomicU32::new(0)),
                    ranges: Vec::new(),
                }
            });
            watch.ranges.push(range);
        }
    }

    pub(crate) fn unregister(&self, key: CodeKey, start: u64, end: u64) {
        let mut inner = self.lock();
        for page in pages_of(start, end) {
            if let Some(watch) = inner.pages.get_mut(&page) {
                watch.ranges.retain(|r| r.key != key);
            }
        }
    }

    /// Bump the versions of watched pages in `[start, end)` and detach every registered range
    /// intersecting it. With `release`, the pages stop being watched (used on unmap).
    ///
    /// Returns after the observer has been told about the detached ranges.
    pub(crate) fn invalidate(&self, start: u64, end: u64, release: bool) {
        if end <= start || self.watched.load(Ordering::SeqCst) == 0 {
            return;
        }

        let mut keys = Vec::new();
        let observer = {
            let mut inner = self.lock();
            let span = page_of(end - 1) - page_of(start) + 1;
            let candidates: Vec<u64> = if span > inner.pages.len() as u64 {
                inner
                    .pages
                    .keys()
                    .copied()
                    .filter(|p| (page_of(start)..=page_of(end - 1)).contains(p))
                    .collect()
            } else {
                pages_of(start, end).collect()
            };
            for page in candidates {
                let Some(watch) = inner.pages.get_mut(&page) else {
                    continue;
                };
                watch.version.fetch_add(1, Ordering::SeqCst);
                watch.ranges.retain(|r| {
                    if r.intersects(start, end) {
                        keys.push(r.key);
                        false
                    } else {
                        true
                    }
                });
                if release {
                    inner.pages.remove(&page);
                    self.watched.fetch_sub(1, Ordering::SeqCst);
                }
            }
            inner.observer.clone()
        };

        if keys.is_empty() {
            return;
        }
        keys.sort_unstable();
        keys.dedup();
        tracing::trace!(start, end, count = keys.len(), "guest store hit translated code");
        if let Some(observer) = observer.and_then(|w| w.upgrade()) {
            observer.code_invalidated(&keys);
        }
    }

    pub(crate) fn is_watched(&self, page: u64) -> bool {
        self.watched.load(Ordering::SeqCst) != 0 && self.lock().pages.contains_key(&page)
    }
}
