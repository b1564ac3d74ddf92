//! Superblocks: one mounted filesystem instance and its inode cache.

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::block::BlockDevice;
use crate::cache::PageCache;
use crate::error::{FsError, FsResult};
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Arc, Mutex, OnceLock, Weak};
use crate::vfs::dentry::Dentry;
use crate::vfs::inode::Inode;
use crate::vfs::{Attributes, FileType, FsStats, InodeNo, MountFlags, Permissions};

static NEXT_SB_ID: AtomicU64 = AtomicU64::new(1);

/// The superblock-level operations table supplied by a filesystem driver.
pub trait SuperBlockOps: Send + Sync {
    /// Allocate a fresh on-storage inode and materialize it.
    fn alloc_inode(
        &self,
        sb: &Arc<SuperBlock>,
        ftype: FileType,
        perms: Permissions,
    ) -> FsResult<Arc<Inode>>;

    /// Release an on-storage inode and its blocks.
    fn free_inode(&self, ino: InodeNo) -> FsResult<()>;

    /// Materialize inode `ino` from storage.
    fn read_inode(&self, sb: &Arc<SuperBlock>, ino: InodeNo) -> FsResult<Arc<Inode>>;

    /// Persist inode metadata.
    fn write_inode(&self, ino: InodeNo, attrs: &Attributes) -> FsResult<()>;

    /// Persist filesystem-level metadata and issue a device flush.
    fn sync(&self) -> FsResult<()>;

    /// Apply new mount flags.
    fn remount(&self, flags: MountFlags) -> FsResult<()>;

    /// Filesystem statistics.
    fn statfs(&self) -> FsResult<FsStats>;
}

/// One mounted filesystem instance.
///
/// Owns the inode cache for its mount: weak entries keyed by inode number,
/// so rematerializations of a live identity alias to the same object while
/// dead entries are reloaded through the driver.
pub struct SuperBlock {
    id: u64,
    device: Arc<dyn BlockDevice>,
    device_name: String,
    cache: Arc<PageCache>,
    flags: Mutex<MountFlags>,
    ops: OnceLock<Arc<dyn SuperBlockOps>>,
    root: Mutex<Option<Arc<Dentry>>>,
    icache: Mutex<FxHashMap<InodeNo, Weak<Inode>>>,
    open_files: AtomicU64,
}

impl std::fmt::Debug for SuperBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperBlock")
            .field("id", &self.id)
            .field("device", &self.device_name)
            .finish_non_exhaustive()
    }
}

impl SuperBlock {
    /// Create a superblock for `device`. The driver attaches its operations
    /// table and root dentry before handing the superblock out.
    #[must_use]
    pub fn new(
        device: Arc<dyn BlockDevice>,
        cache: Arc<PageCache>,
        flags: MountFlags,
    ) -> Arc<Self> {
        let device_name = device.name().to_owned();
        Arc::new(Self {
            id: NEXT_SB_ID.fetch_add(1, Ordering::Relaxed),
            device,
            device_name,
            cache,
            flags: Mutex::new(flags),
            ops: OnceLock::new(),
            root: Mutex::new(None),
            icache: Mutex::new(FxHashMap::default()),
            open_files: AtomicU64::new(0),
        })
    }

    /// Unique id of this mount instance, used in page-cache keys.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The backing device.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Name of the backing device.
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// The page cache serving this mount.
    #[must_use]
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// Current mount flags.
    #[must_use]
    pub fn flags(&self) -> MountFlags {
        *crate::sync::lock(&self.flags)
    }

    /// Attach the driver's operations table. May only happen once, during
    /// mount.
    pub fn set_ops(&self, ops: Arc<dyn SuperBlockOps>) {
        let _ = self.ops.set(ops);
    }

    /// The driver's operations table.
    pub fn ops(&self) -> FsResult<&Arc<dyn SuperBlockOps>> {
        self.ops.get().ok_or(FsError::Io)
    }

    /// Attach the root dentry during mount.
    ///
    /// The superblock's strong root edge closes a reference cycle with the
    /// inodes underneath it; [`Self::release_root`] breaks it at unmount.
    pub fn set_root(&self, root: Arc<Dentry>) {
        *crate::sync::lock(&self.root) = Some(root);
    }

    /// The root dentry of this mount.
    pub fn root(&self) -> FsResult<Arc<Dentry>> {
        crate::sync::lock(&self.root).clone().ok_or(FsError::Io)
    }

    /// Drop the root edge so the dentry tree (and its inodes) can die with
    /// the last outside reference.
    pub(crate) fn release_root(&self) {
        crate::sync::lock(&self.root).take();
    }

    /// Return the inode for `ino`, reconstituting a live cached object or
    /// asking the driver to materialize it.
    pub fn get_inode(self: &Arc<Self>, ino: InodeNo) -> FsResult<Arc<Inode>> {
        if let Some(hit) = crate::sync::lock(&self.icache)
            .get(&ino)
            .and_then(Weak::upgrade)
        {
            return Ok(hit);
        }

        let inode = self.ops()?.read_inode(self, ino)?;

        // Two threads may have materialized concurrently; the first insert
        // wins so the aliasing guarantee holds. The loser's duplicate is
        // dropped outside the cache lock.
        let existing = {
            let mut icache = crate::sync::lock(&self.icache);
            match icache.get(&ino).and_then(Weak::upgrade) {
                Some(e) => Some(e),
                None => {
                    icache.insert(ino, Arc::downgrade(&inode));
                    None
                }
            }
        };
        if let Some(existing) = existing {
            return Ok(existing);
        }
        trace!(sb = self.id, ino, "inode materialized");
        Ok(inode)
    }

    /// Register a freshly allocated inode in the cache. Drivers call this
    /// from `alloc_inode` so later lookups alias to the same object.
    pub fn cache_inode(&self, inode: &Arc<Inode>) {
        crate::sync::lock(&self.icache).insert(inode.ino(), Arc::downgrade(inode));
    }

    /// Drop the cache entry for `ino` (freed or stale).
    pub fn evict_inode(&self, ino: InodeNo) {
        crate::sync::lock(&self.icache).remove(&ino);
    }

    /// Persist the metadata of every live inode, then ask the driver to
    /// persist filesystem-level metadata.
    pub fn sync(&self) -> FsResult<()> {
        let ops = Arc::clone(self.ops()?);
        let live: Vec<Arc<Inode>> = crate::sync::lock(&self.icache)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for inode in live {
            ops.write_inode(inode.ino(), &inode.getattr())?;
        }
        ops.sync()
    }

    /// Filesystem statistics from the driver.
    pub fn statfs(&self) -> FsResult<FsStats> {
        self.ops()?.statfs()
    }

    /// Apply new mount flags through the driver.
    pub fn remount(&self, flags: MountFlags) -> FsResult<()> {
        self.ops()?.remount(flags)?;
        *crate::sync::lock(&self.flags) = flags;
        Ok(())
    }

    /// Number of files currently open on this mount.
    #[must_use]
    pub fn open_file_count(&self) -> u64 {
        self.open_files.load(Ordering::Relaxed)
    }

    pub(crate) fn file_opened(&self) {
        self.open_files.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn file_closed(&self) {
        self.open_files.fetch_sub(1, Ordering::Relaxed);
    }
}
