//! LRU-governed page cache with dirty tracking and writeback coordination.

use hashlink::LinkedHashMap;
use tracing::{debug, trace, warn};

use crate::cache::page::{Page, PageState};
use crate::cache::{PAGE_SIZE, PageKey, page_floor};
use crate::error::{FsError, FsResult};
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Arc, Mutex, Weak};
use crate::vfs::Inode;

/// Default soft capacity of a cache instance, in pages (4 MiB).
pub const DEFAULT_MAX_PAGES: usize = 1024;

/// Pinned-page rotations allowed within one eviction pass. When the budget
/// is exhausted the insert proceeds over capacity instead of livelocking.
const EVICT_ROTATION_BUDGET: usize = 8;

/// Monotonic cache counters, readable without the cache mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Lookups that found a page.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Pages reclaimed by the eviction scan.
    pub evictions: u64,
    /// Successful page writebacks.
    pub writebacks: u64,
}

impl CacheMetrics {
    /// Fraction of lookups served from the cache.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.hits as f64 / total as f64
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
    /// Writeback failures observed during eviction; surfaced at the next
    /// explicit sync rather than at the point of failure.
    deferred_write_errors: AtomicU64,
}

struct CacheInner {
    /// Authoritative index in recency order: front = least recently used,
    /// back = most recently used.
    lru: LinkedHashMap<PageKey, Arc<Page>>,
    /// Pages awaiting writeback.
    dirty: LinkedHashMap<PageKey, Arc<Page>>,
    /// Soft capacity in pages.
    max_pages: usize,
}

/// Cache of [`Page`]s shared by every mount.
///
/// One mutex guards the index, the LRU order, and the dirty list. The mutex
/// is never held across device I/O or page-lock acquisition; writeback during
/// eviction releases it around the device call.
pub struct PageCache {
    inner: Mutex<CacheInner>,
    counters: Counters,
    weak_self: Weak<PageCache>,
}

#[cfg(not(loom))]
static GLOBAL: crate::sync::OnceLock<Arc<PageCache>> = crate::sync::OnceLock::new();

impl PageCache {
    /// Create an isolated cache instance with the given soft capacity.
    #[must_use]
    pub fn new(max_pages: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            inner: Mutex::new(CacheInner {
                lru: LinkedHashMap::new(),
                dirty: LinkedHashMap::new(),
                max_pages,
            }),
            counters: Counters::default(),
            weak_self: weak_self.clone(),
        })
    }

    /// The process-wide cache shared by all mounts that do not inject their
    /// own instance.
    #[cfg(not(loom))]
    pub fn global() -> &'static Arc<PageCache> {
        GLOBAL.get_or_init(|| Self::new(DEFAULT_MAX_PAGES))
    }

    fn key_for(inode: &Inode, offset: u64) -> PageKey {
        PageKey {
            sb: inode.superblock().id(),
            ino: inode.ino(),
            offset,
        }
    }

    /// Look up a page, promoting it to most-recently-used on a hit.
    ///
    /// `offset` is rounded down to its page boundary.
    #[must_use]
    pub fn find(&self, inode: &Arc<Inode>, offset: u64) -> Option<Arc<Page>> {
        let key = Self::key_for(inode, page_floor(offset));
        let mut g = crate::sync::lock(&self.inner);
        if let Some(page) = g.lru.remove(&key) {
            g.lru.insert(key, Arc::clone(&page));
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            Some(page)
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Look up a page, allocating a zeroed one when absent. The new page is
    /// inserted most-recently-used; capacity is reclaimed first when needed.
    pub fn find_or_create(&self, inode: &Arc<Inode>, offset: u64) -> Arc<Page> {
        let key = Self::key_for(inode, page_floor(offset));
        {
            let mut g = crate::sync::lock(&self.inner);
            if let Some(page) = g.lru.remove(&key) {
                g.lru.insert(key, Arc::clone(&page));
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return page;
            }
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }

        self.reclaim();

        let mut g = crate::sync::lock(&self.inner);
        // Another thread may have created the page while the lock was
        // released for reclaim.
        if let Some(page) = g.lru.remove(&key) {
            g.lru.insert(key, Arc::clone(&page));
            return page;
        }
        let page = Arc::new(Page::new(key, Arc::clone(inode), self.weak_self.clone()));
        g.lru.insert(key, Arc::clone(&page));
        trace!(?key, pages = g.lru.len(), "page allocated");
        page
    }

    /// Return an `UpToDate` page for `(inode, offset)`, filling it from the
    /// device on first use.
    ///
    /// Concurrent callers requesting the same page find it `Locked` by the
    /// first and wait. A failed fill leaves the page `Error`; the next call
    /// attempts the read again. The cache never serves `Error` data.
    pub fn read_page(&self, inode: &Arc<Inode>, offset: u64) -> FsResult<Arc<Page>> {
        let page = self.find_or_create(inode, offset);
        if page.state() == PageState::UpToDate {
            return Ok(page);
        }

        let prev = page.lock();
        // Re-check under the page lock: another caller may have completed
        // the fill, or a writer may have populated the buffer already.
        if matches!(
            prev,
            PageState::UpToDate | PageState::Dirty | PageState::Writeback
        ) {
            page.unlock(prev);
            return Ok(page);
        }

        match inode.map_sector(page.offset(), false) {
            Ok(None) => {
                // Hole: nothing on the device yet; the page reads as zeroes.
                page.fill_zero();
                page.set_sector(None);
                page.unlock(PageState::UpToDate);
                Ok(page)
            }
            Ok(Some(sector)) => {
                let mut buf = vec![0u8; PAGE_SIZE];
                match inode.device().read_at(sector, &mut buf) {
                    Ok(_) => {
                        page.fill(&buf);
                        page.set_sector(Some(sector));
                        page.unlock(PageState::UpToDate);
                        Ok(page)
                    }
                    Err(e) => {
                        page.unlock(PageState::Error);
                        Err(e)
                    }
                }
            }
            Err(e) => {
                page.unlock(prev);
                Err(e)
            }
        }
    }

    /// Write back every dirty page, or only those of `inode` when given.
    ///
    /// All candidates are attempted; the first error is reported after the
    /// pass. Writeback failures deferred from earlier evictions are also
    /// surfaced here.
    pub fn sync_pages(&self, inode: Option<&Arc<Inode>>) -> FsResult<()> {
        let ident = inode.map(|i| (i.superblock().id(), i.ino()));
        let targets: Vec<Arc<Page>> = {
            let g = crate::sync::lock(&self.inner);
            g.dirty
                .iter()
                .filter(|(key, _)| ident.is_none_or(|(sb, ino)| key.sb == sb && key.ino == ino))
                .map(|(_, page)| Arc::clone(page))
                .collect()
        };

        let mut first_err = None;
        for page in targets {
            if let Err(e) = self.writeback_one(&page, false) {
                warn!(key = ?page.key(), error = %e, "page writeback failed");
                first_err.get_or_insert(e);
            }
        }

        if first_err.is_none()
            && self
                .counters
                .deferred_write_errors
                .swap(0, Ordering::Relaxed)
                > 0
        {
            first_err = Some(FsError::Io);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Write back every dirty page in the cache.
    pub fn flush_all(&self) -> FsResult<()> {
        self.sync_pages(None)
    }

    /// Drop every page belonging to `inode` from the index, the LRU order,
    /// and the dirty list. Dirty pages are discarded; callers that need
    /// durability sync first.
    pub fn invalidate(&self, inode: &Arc<Inode>) {
        self.invalidate_ident(inode.superblock().id(), inode.ino());
    }

    /// [`Self::invalidate`] keyed by raw identity, for callers (the driver's
    /// inode-free path) that no longer hold an `Inode`.
    pub(crate) fn invalidate_ident(&self, sb: u64, ino: u64) {
        let mut g = crate::sync::lock(&self.inner);
        let victims: Vec<PageKey> = g
            .lru
            .keys()
            .filter(|k| k.sb == sb && k.ino == ino)
            .copied()
            .collect();
        for key in &victims {
            g.lru.remove(key);
            g.dirty.remove(key);
        }
        if !victims.is_empty() {
            debug!(ino, count = victims.len(), "pages invalidated");
        }
    }

    /// Drop every page in the cache without writing anything back.
    pub fn clear(&self) {
        let mut g = crate::sync::lock(&self.inner);
        g.lru.clear();
        g.dirty.clear();
    }

    /// Number of pages currently cached.
    #[must_use]
    pub fn page_count(&self) -> usize {
        crate::sync::lock(&self.inner).lru.len()
    }

    /// Soft capacity in pages.
    #[must_use]
    pub fn max_pages(&self) -> usize {
        crate::sync::lock(&self.inner).max_pages
    }

    /// Change the soft capacity, evicting down to the new limit.
    pub fn set_max_pages(&self, max_pages: usize) {
        crate::sync::lock(&self.inner).max_pages = max_pages;
        self.reclaim();
    }

    /// Snapshot the monotonic counters.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            writebacks: self.counters.writebacks.load(Ordering::Relaxed),
        }
    }

    /// Add a page to the dirty list. Called from [`Page::mark_dirty`].
    pub(crate) fn note_dirty(&self, page: &Arc<Page>) {
        let mut g = crate::sync::lock(&self.inner);
        let key = page.key();
        if !g.dirty.contains_key(&key) {
            g.dirty.insert(key, Arc::clone(page));
        }
    }

    /// Remove a page from the dirty list. Called from [`Page::clear_dirty`].
    pub(crate) fn forget_dirty(&self, key: PageKey) {
        crate::sync::lock(&self.inner).dirty.remove(&key);
    }

    /// Whether the page is on the dirty list. Test support for the
    /// dirty-state invariant.
    #[must_use]
    pub fn on_dirty_list(&self, page: &Page) -> bool {
        crate::sync::lock(&self.inner).dirty.contains_key(&page.key())
    }

    /// Write one page to its backing sector.
    ///
    /// Takes the page lock, re-checks dirtiness, snapshots the buffer, and
    /// performs the device write with the page in `Writeback` (where buffer
    /// mutation is deferred and eviction keeps its hands off). On success the
    /// page returns to `UpToDate` and leaves the dirty list. On failure with
    /// `keep_dirty_on_error` (the eviction path) the page stays dirty for a
    /// later retry; otherwise it is marked `Error` and the error propagates.
    fn writeback_one(&self, page: &Arc<Page>, keep_dirty_on_error: bool) -> FsResult<()> {
        let prev = page.lock();
        if prev != PageState::Dirty {
            page.unlock(prev);
            // A racing clear may have settled the state before joining the
            // dirty list; drop any stale listing. An in-flight writeback
            // owns its own listing and is left alone.
            if prev != PageState::Writeback {
                self.forget_dirty(page.key());
            }
            return Ok(());
        }

        let (sector, data) = page.snapshot();
        page.unlock(PageState::Writeback);

        let outcome = match sector {
            // A dirty page without a mapping has nothing durable to update;
            // this only happens when a hole page was dirtied and the driver
            // never assigned a block.
            None => Ok(()),
            Some(sector) => page
                .inode()
                .device()
                .write_at(sector, &data[..])
                .map(|_| ()),
        };

        match outcome {
            Ok(()) => {
                page.set_state(PageState::UpToDate);
                self.forget_dirty(page.key());
                self.counters.writebacks.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                if keep_dirty_on_error {
                    page.set_state(PageState::Dirty);
                } else {
                    page.set_state(PageState::Error);
                    self.forget_dirty(page.key());
                }
                Err(e)
            }
        }
    }

    /// Evict from the LRU tail until the page count is under the soft
    /// capacity, subject to the skip rules:
    ///
    /// - pinned pages (held beyond the cache) rotate to the MRU end, at most
    ///   [`EVICT_ROTATION_BUDGET`] times per call;
    /// - a `Locked` or `Writeback` candidate ends the scan;
    /// - a `Dirty` candidate is written back synchronously, with the cache
    ///   mutex released around the device write, and is reconsidered after.
    fn reclaim(&self) {
        let mut rotations = 0;
        loop {
            let (key, page) = {
                let mut g = crate::sync::lock(&self.inner);
                if g.lru.len() < g.max_pages {
                    return;
                }
                let Some((key, page)) = g.lru.front() else {
                    return;
                };
                let key = *key;
                let page = Arc::clone(page);

                // Strong references held by the cache itself: the LRU index,
                // the dirty list (when listed), and the clone above.
                let cache_refs = 2 + usize::from(g.dirty.contains_key(&key));
                if Arc::strong_count(&page) > cache_refs {
                    if let Some(p) = g.lru.remove(&key) {
                        g.lru.insert(key, p);
                    }
                    rotations += 1;
                    if rotations >= EVICT_ROTATION_BUDGET {
                        warn!(
                            budget = EVICT_ROTATION_BUDGET,
                            "eviction rotation budget exhausted; inserting over capacity"
                        );
                        return;
                    }
                    continue;
                }

                match page.try_state() {
                    // Contended or mid-critical-section: skip this call.
                    None | Some(PageState::Locked | PageState::Writeback) => return,
                    Some(PageState::Dirty) => (key, page),
                    Some(_) => {
                        g.lru.remove(&key);
                        debug_assert!(!g.dirty.contains_key(&key));
                        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                        trace!(?key, "page evicted");
                        continue;
                    }
                }
            };

            // Dirty candidate: write it back with the cache mutex released,
            // then loop to reconsider it now that it is clean.
            if self.writeback_one(&page, true).is_err() {
                self.counters
                    .deferred_write_errors
                    .fetch_add(1, Ordering::Relaxed);
                let mut g = crate::sync::lock(&self.inner);
                if let Some(p) = g.lru.remove(&key) {
                    g.lru.insert(key, p);
                }
                rotations += 1;
                if rotations >= EVICT_ROTATION_BUDGET {
                    return;
                }
            }
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        // Best-effort writeback of whatever is still dirty; errors have
        // nowhere to go at this point.
        let _ = self.sync_pages(None);
    }
}
