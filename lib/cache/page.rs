//! A single cache page and its state machine.

use crate::block::SectorId;
use crate::cache::page_cache::PageCache;
use crate::cache::{PAGE_SIZE, PageKey};
use crate::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use crate::vfs::Inode;

/// Logical state of a page.
///
/// Transitions: a freshly created page is `Clean`; a successful fill makes
/// it `UpToDate` (or `Error` on failure); a buffer mutation makes it `Dirty`;
/// writeback moves `Dirty` through `Writeback` back to `UpToDate` (or
/// `Error`). `Locked` marks an I/O critical section; the holder restores the
/// logical state on unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Freshly allocated, contents not yet meaningful.
    Clean,
    /// Buffer is newer than the device; on the dirty list.
    Dirty,
    /// An I/O critical section is in progress; all other access waits.
    Locked,
    /// A writeback to the device is in flight.
    Writeback,
    /// Buffer matches (or supersedes) device content and is safe to serve.
    UpToDate,
    /// The last fill or writeback failed; the next read re-fills.
    Error,
}

struct PageInner {
    state: PageState,
    /// Device sector backing this page, resolved through the driver's block
    /// mapping. `None` for holes and never-allocated pages.
    sector: Option<SectorId>,
    data: Box<[u8; PAGE_SIZE]>,
}

/// A page-sized buffer plus state machine, jointly owned by the cache and
/// any current holders.
///
/// The buffer is only reachable through the accessors here, all of which
/// wait out a concurrent [`PageState::Locked`] critical section.
pub struct Page {
    key: PageKey,
    inode: Arc<Inode>,
    inner: Mutex<PageInner>,
    unlocked: Condvar,
    cache: Weak<PageCache>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Page {
    pub(crate) fn new(key: PageKey, inode: Arc<Inode>, cache: Weak<PageCache>) -> Self {
        Self {
            key,
            inode,
            inner: Mutex::new(PageInner {
                state: PageState::Clean,
                sector: None,
                data: Box::new([0; PAGE_SIZE]),
            }),
            unlocked: Condvar::new(),
            cache,
        }
    }

    /// The page's identity.
    #[must_use]
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// The inode this page belongs to.
    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Page-aligned file offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.key.offset
    }

    /// Current state. Does not wait out critical sections, so it may report
    /// [`PageState::Locked`].
    #[must_use]
    pub fn state(&self) -> PageState {
        crate::sync::lock(&self.inner).state
    }

    /// Non-blocking state probe used by eviction scans while the cache mutex
    /// is held. `None` means the page mutex is contended right now.
    #[cfg(not(loom))]
    pub(crate) fn try_state(&self) -> Option<PageState> {
        match self.inner.try_lock() {
            Ok(g) => Some(g.state),
            Err(std::sync::TryLockError::Poisoned(p)) => Some(p.into_inner().state),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    #[cfg(loom)]
    pub(crate) fn try_state(&self) -> Option<PageState> {
        Some(crate::sync::lock(&self.inner).state)
    }

    fn wait_unlocked(&self) -> MutexGuard<'_, PageInner> {
        let mut g = crate::sync::lock(&self.inner);
        while g.state == PageState::Locked {
            g = crate::sync::wait(&self.unlocked, g);
        }
        g
    }

    /// Enter the I/O critical section: wait until the page is not `Locked`,
    /// then mark it `Locked`. Returns the pre-lock state so the holder can
    /// re-check it and restore something sensible on [`Self::unlock`].
    pub fn lock(&self) -> PageState {
        let mut g = self.wait_unlocked();
        let prev = g.state;
        g.state = PageState::Locked;
        prev
    }

    /// Leave the critical section, setting `state` and waking waiters.
    pub fn unlock(&self, state: PageState) {
        {
            let mut g = crate::sync::lock(&self.inner);
            g.state = state;
        }
        self.unlocked.notify_all();
    }

    /// Copy bytes out of the page at `at`. Waits out a concurrent lock.
    pub fn copy_out(&self, at: usize, buf: &mut [u8]) {
        let g = self.wait_unlocked();
        buf.copy_from_slice(&g.data[at..at + buf.len()]);
    }

    /// Copy bytes into the page at `at`. Waits out a concurrent lock. The
    /// caller is responsible for the follow-up [`Self::mark_dirty`].
    pub fn copy_in(&self, at: usize, buf: &[u8]) {
        let mut g = self.wait_unlocked();
        g.data[at..at + buf.len()].copy_from_slice(buf);
    }

    /// Transition to `Dirty` and join the dirty list, unless the page is
    /// already `Dirty` or a writeback is in flight.
    pub fn mark_dirty(self: &Arc<Self>) {
        {
            let mut g = crate::sync::lock(&self.inner);
            if matches!(g.state, PageState::Dirty | PageState::Writeback) {
                return;
            }
            g.state = PageState::Dirty;
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.note_dirty(self);
        }
    }

    /// Transition `Dirty` back to `UpToDate` and leave the dirty list.
    pub fn clear_dirty(self: &Arc<Self>) {
        {
            let mut g = crate::sync::lock(&self.inner);
            if g.state != PageState::Dirty {
                return;
            }
            g.state = PageState::UpToDate;
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.forget_dirty(self.key);
        }
    }

    /// Record the device sector backing this page.
    pub(crate) fn set_sector(&self, sector: Option<SectorId>) {
        crate::sync::lock(&self.inner).sector = sector;
    }

    /// Overwrite the whole buffer; `bytes` must be exactly one page. Only
    /// called by the lock holder during a fill, so it takes the mutex
    /// directly rather than waiting.
    pub(crate) fn fill(&self, bytes: &[u8]) {
        crate::sync::lock(&self.inner).data.copy_from_slice(bytes);
    }

    /// Zero the buffer. Only called by the lock holder during a hole fill.
    pub(crate) fn fill_zero(&self) {
        crate::sync::lock(&self.inner).data.fill(0);
    }

    /// Snapshot `(sector, buffer)` for a writeback. Only called by the lock
    /// holder, so it takes the mutex directly rather than waiting.
    pub(crate) fn snapshot(&self) -> (Option<SectorId>, Box<[u8; PAGE_SIZE]>) {
        let g = crate::sync::lock(&self.inner);
        (g.sector, g.data.clone())
    }

    /// Set the state directly without the lock/unlock protocol. Used by
    /// writeback to move `Writeback` to its terminal state.
    pub(crate) fn set_state(&self, state: PageState) {
        crate::sync::lock(&self.inner).state = state;
        self.unlocked.notify_all();
    }
}
