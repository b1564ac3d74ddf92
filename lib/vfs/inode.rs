//! In-memory inodes and the driver-supplied operations table behind them.

use tracing::trace;

use crate::block::{BlockDevice, SectorId};
use crate::cache::{PAGE_SIZE, page_floor};
use crate::error::{FsError, FsResult};
use crate::sync::{Arc, Mutex, MutexGuard};
use crate::vfs::superblock::SuperBlock;
use crate::vfs::{Attributes, DirEntry, FileType, InodeNo, MountFlags, Permissions};

/// The operations table a filesystem driver supplies for every inode it
/// materializes.
///
/// The VFS holds the directory's inode mutex across every delegation and
/// passes the locked attribute record in, so implementations must not call
/// back into `Inode` attribute accessors for the inodes named in the call.
/// Structural attribute changes (directory growth, link counts) are applied
/// to the passed-in record; the VFS stamps timestamps after success.
pub trait InodeOps: Send + Sync {
    /// Resolve `name` within directory `dir` to an inode number.
    fn lookup(&self, dir: InodeNo, name: &str) -> FsResult<InodeNo>;

    /// Create a regular file or device node named `name` in `dir`.
    fn create(
        &self,
        dir: InodeNo,
        dattrs: &mut Attributes,
        name: &str,
        ftype: FileType,
        perms: Permissions,
    ) -> FsResult<InodeNo>;

    /// Remove the non-directory entry `name` from `dir`.
    fn unlink(&self, dir: InodeNo, dattrs: &mut Attributes, name: &str) -> FsResult<()>;

    /// Create a directory named `name` in `dir`.
    fn mkdir(
        &self,
        dir: InodeNo,
        dattrs: &mut Attributes,
        name: &str,
        perms: Permissions,
    ) -> FsResult<InodeNo>;

    /// Remove the empty directory `name` from `dir`.
    fn rmdir(&self, dir: InodeNo, dattrs: &mut Attributes, name: &str) -> FsResult<()>;

    /// Move `old_name` in `old_dir` to `new_name` in `new_dir`, replacing a
    /// compatible existing target. `new_attrs` is `None` for a rename within
    /// a single directory.
    fn rename(
        &self,
        old_dir: InodeNo,
        old_attrs: &mut Attributes,
        new_dir: InodeNo,
        new_attrs: Option<&mut Attributes>,
        old_name: &str,
        new_name: &str,
    ) -> FsResult<()>;

    /// List the entries of directory `dir`.
    fn readdir(&self, dir: InodeNo) -> FsResult<Vec<DirEntry>>;

    /// Create a symlink named `name` in `dir` pointing at `target`.
    fn symlink(
        &self,
        dir: InodeNo,
        dattrs: &mut Attributes,
        name: &str,
        target: &str,
    ) -> FsResult<InodeNo>;

    /// Read the target of symlink `ino`, whose current size is `size`.
    fn readlink(&self, ino: InodeNo, size: u64) -> FsResult<String>;

    /// Persist an attribute change (chmod/chown and friends).
    fn setattr(&self, ino: InodeNo, attrs: &Attributes) -> FsResult<()>;

    /// Release on-disk blocks past `new_size`. Growing allocates nothing.
    fn truncate(&self, ino: InodeNo, attrs: &mut Attributes, new_size: u64) -> FsResult<()>;

    /// Map a file block index to a device sector. `None` is a hole. With
    /// `create`, allocate the block (and any indirection) first.
    fn map_block(&self, ino: InodeNo, block_index: u64, create: bool)
    -> FsResult<Option<SectorId>>;

    /// Number of blocks currently allocated to `ino`, indirection included.
    fn allocated_blocks(&self, ino: InodeNo) -> FsResult<u64>;

    /// Read one extended attribute.
    fn getxattr(&self, ino: InodeNo, name: &str) -> FsResult<Vec<u8>>;

    /// Set one extended attribute.
    fn setxattr(&self, ino: InodeNo, name: &str, value: &[u8]) -> FsResult<()>;

    /// List extended attribute names.
    fn listxattr(&self, ino: InodeNo) -> FsResult<Vec<String>>;

    /// Remove one extended attribute.
    fn removexattr(&self, ino: InodeNo, name: &str) -> FsResult<()>;
}

/// In-memory representation of one file or directory.
///
/// Identity is `(superblock, inode number)`; the superblock's inode cache
/// guarantees at most one live `Inode` per identity. File content flows
/// through the page cache; everything else is delegated to the driver's
/// [`InodeOps`] table under this inode's mutex.
pub struct Inode {
    ino: InodeNo,
    sb: Arc<SuperBlock>,
    ops: Arc<dyn InodeOps>,
    attrs: Mutex<Attributes>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("sb", &self.sb.id())
            .finish_non_exhaustive()
    }
}

impl Inode {
    /// Materialize an inode. Drivers call this from `read_inode` and
    /// `alloc_inode`; everyone else goes through the superblock cache.
    #[must_use]
    pub fn new(
        ino: InodeNo,
        sb: Arc<SuperBlock>,
        ops: Arc<dyn InodeOps>,
        attrs: Attributes,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            sb,
            ops,
            attrs: Mutex::new(attrs),
        })
    }

    /// Inode number within the superblock.
    #[must_use]
    pub fn ino(&self) -> InodeNo {
        self.ino
    }

    /// The owning superblock.
    #[must_use]
    pub fn superblock(&self) -> &Arc<SuperBlock> {
        &self.sb
    }

    /// The device backing the owning superblock.
    #[must_use]
    pub fn device(&self) -> Arc<dyn BlockDevice> {
        Arc::clone(self.sb.device())
    }

    /// Snapshot of the attribute record.
    #[must_use]
    pub fn getattr(&self) -> Attributes {
        *crate::sync::lock(&self.attrs)
    }

    /// Current size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        crate::sync::lock(&self.attrs).size
    }

    /// Whether this is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        crate::sync::lock(&self.attrs).ftype == FileType::Directory
    }

    /// Whether this is a symlink.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        crate::sync::lock(&self.attrs).ftype == FileType::Symlink
    }

    fn guard_mutable(&self) -> FsResult<()> {
        if self.sb.flags().contains(MountFlags::RDONLY) || self.sb.device().readonly() {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    fn lock_dir_for_mutation(&self) -> FsResult<MutexGuard<'_, Attributes>> {
        self.guard_mutable()?;
        let attrs = crate::sync::lock(&self.attrs);
        if attrs.ftype != FileType::Directory {
            return Err(FsError::NotADirectory);
        }
        if !attrs.owner_writable() {
            return Err(FsError::AccessDenied);
        }
        Ok(attrs)
    }

    /// Resolve a file offset to its backing device sector through the
    /// driver's block map. Used by the page cache when filling pages and by
    /// the write path when allocating.
    pub(crate) fn map_sector(&self, offset: u64, create: bool) -> FsResult<Option<SectorId>> {
        self.ops
            .map_block(self.ino, offset / PAGE_SIZE as u64, create)
    }

    /// Read up to `buf.len()` bytes at `pos` through the page cache.
    ///
    /// Returns 0 at or past EOF; a read straddling EOF returns the prefix.
    pub fn read_at(self: &Arc<Self>, pos: u64, buf: &mut [u8]) -> FsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut attrs = crate::sync::lock(&self.attrs);
        if attrs.ftype == FileType::Directory {
            return Err(FsError::IsADirectory);
        }
        if pos >= attrs.size {
            return Ok(0);
        }
        let want = usize::try_from(attrs.size - pos)
            .unwrap_or(usize::MAX)
            .min(buf.len());

        let cache = self.sb.cache();
        let mut done = 0;
        while done < want {
            let cur = pos + done as u64;
            let page_off = page_floor(cur);
            let in_page = usize::try_from(cur - page_off).unwrap_or(0);
            let chunk = (want - done).min(PAGE_SIZE - in_page);
            let page = cache.read_page(self, page_off)?;
            page.copy_out(in_page, &mut buf[done..done + chunk]);
            done += chunk;
        }

        if !self.sb.flags().contains(MountFlags::NOATIME) {
            attrs.atime = std::time::SystemTime::now();
        }
        Ok(done)
    }

    /// Write `buf` at `pos` through the page cache, extending the size when
    /// the write runs past EOF. Pages are dirtied, not written to the device;
    /// durability comes from [`Self::sync`] or cache writeback.
    pub fn write_at(self: &Arc<Self>, pos: u64, buf: &[u8]) -> FsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.guard_mutable()?;
        let mut attrs = crate::sync::lock(&self.attrs);
        if attrs.ftype == FileType::Directory {
            return Err(FsError::IsADirectory);
        }
        if !attrs.owner_writable() {
            return Err(FsError::AccessDenied);
        }

        let cache = self.sb.cache();
        let mut done = 0;
        while done < buf.len() {
            let cur = pos + done as u64;
            let page_off = page_floor(cur);
            let in_page = usize::try_from(cur - page_off).unwrap_or(0);
            let chunk = (buf.len() - done).min(PAGE_SIZE - in_page);

            // A partial overwrite must see the existing bytes first; a full
            // page write may clobber whatever is there.
            let page = if in_page == 0 && chunk == PAGE_SIZE {
                cache.find_or_create(self, page_off)
            } else {
                cache.read_page(self, page_off)?
            };

            let sector = self.map_sector(page_off, true)?;
            page.set_sector(sector);
            page.copy_in(in_page, &buf[done..done + chunk]);
            page.mark_dirty();
            done += chunk;
        }

        let end = pos + done as u64;
        if end > attrs.size {
            attrs.size = end;
        }
        if let Ok(blocks) = self.ops.allocated_blocks(self.ino) {
            attrs.blocks = blocks;
        }
        attrs.touch_modified();
        Ok(done)
    }

    /// List this directory's entries via the driver.
    pub fn readdir(&self) -> FsResult<Vec<DirEntry>> {
        let attrs = crate::sync::lock(&self.attrs);
        if attrs.ftype != FileType::Directory {
            return Err(FsError::NotADirectory);
        }
        self.ops.readdir(self.ino)
    }

    /// Resolve `name` in this directory to a (cached or rematerialized)
    /// inode.
    pub fn lookup(&self, name: &str) -> FsResult<Arc<Inode>> {
        let ino = {
            let attrs = crate::sync::lock(&self.attrs);
            if attrs.ftype != FileType::Directory {
                return Err(FsError::NotADirectory);
            }
            self.ops.lookup(self.ino, name)?
        };
        self.sb.get_inode(ino)
    }

    /// Create a regular file in this directory.
    pub fn create(&self, name: &str, perms: Permissions) -> FsResult<Arc<Inode>> {
        let ino = {
            let mut attrs = self.lock_dir_for_mutation()?;
            let ino = self
                .ops
                .create(self.ino, &mut attrs, name, FileType::Regular, perms)?;
            attrs.touch_modified();
            ino
        };
        trace!(dir = self.ino, name, ino, "file created");
        self.sb.get_inode(ino)
    }

    /// Remove a non-directory entry from this directory.
    pub fn unlink(&self, name: &str) -> FsResult<()> {
        let mut attrs = self.lock_dir_for_mutation()?;
        self.ops.unlink(self.ino, &mut attrs, name)?;
        attrs.touch_modified();
        Ok(())
    }

    /// Create a subdirectory in this directory.
    pub fn mkdir(&self, name: &str, perms: Permissions) -> FsResult<Arc<Inode>> {
        let ino = {
            let mut attrs = self.lock_dir_for_mutation()?;
            let ino = self.ops.mkdir(self.ino, &mut attrs, name, perms)?;
            attrs.touch_modified();
            ino
        };
        trace!(dir = self.ino, name, ino, "directory created");
        self.sb.get_inode(ino)
    }

    /// Remove an empty subdirectory from this directory.
    pub fn rmdir(&self, name: &str) -> FsResult<()> {
        let mut attrs = self.lock_dir_for_mutation()?;
        self.ops.rmdir(self.ino, &mut attrs, name)?;
        attrs.touch_modified();
        Ok(())
    }

    /// Create a symlink in this directory.
    pub fn symlink(&self, name: &str, target: &str) -> FsResult<Arc<Inode>> {
        let ino = {
            let mut attrs = self.lock_dir_for_mutation()?;
            let ino = self.ops.symlink(self.ino, &mut attrs, name, target)?;
            attrs.touch_modified();
            ino
        };
        self.sb.get_inode(ino)
    }

    /// Read this symlink's target.
    pub fn readlink(&self) -> FsResult<String> {
        let size = {
            let attrs = crate::sync::lock(&self.attrs);
            if attrs.ftype != FileType::Symlink {
                return Err(FsError::InvalidArgument);
            }
            attrs.size
        };
        self.ops.readlink(self.ino, size)
    }

    /// Move `old_name` from this directory into `new_dir` as `new_name`.
    ///
    /// The two inode mutexes are taken in ascending inode-number order so
    /// concurrent cross-directory renames cannot deadlock.
    pub fn rename_to(&self, old_name: &str, new_dir: &Arc<Inode>, new_name: &str) -> FsResult<()> {
        self.guard_mutable()?;
        if !Arc::ptr_eq(&self.sb, &new_dir.sb) {
            return Err(FsError::InvalidArgument);
        }

        if self.ino == new_dir.ino {
            let mut attrs = self.lock_dir_for_mutation()?;
            self.ops
                .rename(self.ino, &mut attrs, self.ino, None, old_name, new_name)?;
            attrs.touch_modified();
            return Ok(());
        }

        let (first, second) = if self.ino < new_dir.ino {
            (self, &**new_dir)
        } else {
            (&**new_dir, self)
        };
        let mut first_attrs = crate::sync::lock(&first.attrs);
        let mut second_attrs = crate::sync::lock(&second.attrs);
        {
            let (old_attrs, new_attrs) = if self.ino < new_dir.ino {
                (&mut *first_attrs, &mut *second_attrs)
            } else {
                (&mut *second_attrs, &mut *first_attrs)
            };
            if old_attrs.ftype != FileType::Directory || new_attrs.ftype != FileType::Directory {
                return Err(FsError::NotADirectory);
            }
            if !old_attrs.owner_writable() || !new_attrs.owner_writable() {
                return Err(FsError::AccessDenied);
            }
            self.ops.rename(
                self.ino,
                &mut *old_attrs,
                new_dir.ino,
                Some(&mut *new_attrs),
                old_name,
                new_name,
            )?;
            old_attrs.touch_modified();
            new_attrs.touch_modified();
        }
        Ok(())
    }

    /// Replace the permission bits.
    pub fn chmod(&self, perms: Permissions) -> FsResult<()> {
        self.guard_mutable()?;
        let mut attrs = crate::sync::lock(&self.attrs);
        attrs.perms = perms;
        attrs.ctime = std::time::SystemTime::now();
        self.ops.setattr(self.ino, &attrs)
    }

    /// Replace the owning uid/gid.
    pub fn chown(&self, uid: u32, gid: u32) -> FsResult<()> {
        self.guard_mutable()?;
        let mut attrs = crate::sync::lock(&self.attrs);
        attrs.uid = uid;
        attrs.gid = gid;
        attrs.ctime = std::time::SystemTime::now();
        self.ops.setattr(self.ino, &attrs)
    }

    /// Change the file size. Shrinking releases blocks through the driver;
    /// growing allocates nothing. All cached pages of this inode are dropped
    /// so later reads rematerialize from the device or as holes.
    pub fn truncate(self: &Arc<Self>, size: u64) -> FsResult<()> {
        self.guard_mutable()?;
        {
            let mut attrs = crate::sync::lock(&self.attrs);
            if attrs.ftype == FileType::Directory {
                return Err(FsError::IsADirectory);
            }
            if !attrs.owner_writable() {
                return Err(FsError::AccessDenied);
            }
            if attrs.size == size {
                return Ok(());
            }
            self.ops.truncate(self.ino, &mut attrs, size)?;
            attrs.size = size;
            attrs.touch_modified();
        }
        self.sb.cache().invalidate(self);
        Ok(())
    }

    /// Flush this inode's dirty pages, then persist its metadata.
    pub fn sync(self: &Arc<Self>) -> FsResult<()> {
        self.sb.cache().sync_pages(Some(self))?;
        let attrs = self.getattr();
        self.sb.ops()?.write_inode(self.ino, &attrs)
    }

    /// Read one extended attribute.
    pub fn getxattr(&self, name: &str) -> FsResult<Vec<u8>> {
        self.ops.getxattr(self.ino, name)
    }

    /// Set one extended attribute.
    pub fn setxattr(&self, name: &str, value: &[u8]) -> FsResult<()> {
        self.guard_mutable()?;
        let mut attrs = crate::sync::lock(&self.attrs);
        self.ops.setxattr(self.ino, name, value)?;
        attrs.ctime = std::time::SystemTime::now();
        Ok(())
    }

    /// List extended attribute names.
    pub fn listxattr(&self) -> FsResult<Vec<String>> {
        self.ops.listxattr(self.ino)
    }

    /// Remove one extended attribute.
    pub fn removexattr(&self, name: &str) -> FsResult<()> {
        self.guard_mutable()?;
        let mut attrs = crate::sync::lock(&self.attrs);
        self.ops.removexattr(self.ino, name)?;
        attrs.ctime = std::time::SystemTime::now();
        Ok(())
    }
}

impl Drop for Inode {
    /// Best-effort metadata write-back when the last reference dies, so an
    /// identity evicted from the inode cache rematerializes with the
    /// attributes it had in memory.
    fn drop(&mut self) {
        if self.sb.flags().contains(MountFlags::RDONLY) || self.sb.device().readonly() {
            return;
        }
        if let Ok(ops) = self.sb.ops() {
            let attrs = *crate::sync::lock(&self.attrs);
            if let Err(e) = ops.write_inode(self.ino, &attrs) {
                trace!(ino = self.ino, error = %e, "inode write-back on drop failed");
            }
        }
    }
}
