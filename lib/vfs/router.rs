//! The VFS router: filesystem-type registry, mount table, and path-based
//! operation dispatch.

use tracing::{debug, info, warn};

use crate::block::BlockDevice;
use crate::cache::PageCache;
use crate::error::{FsError, FsResult};
use crate::sync::{Arc, Mutex};
use crate::vfs::dentry::Dentry;
use crate::vfs::file::File;
use crate::vfs::path::{components, split_parent};
use crate::vfs::superblock::SuperBlock;
use crate::vfs::{
    Attributes, FsStats, MAX_SYMLINK_FOLLOWS, MountFlags, OpenFlags, Permissions,
};

/// A filesystem type registered with the router.
pub trait FilesystemType: Send + Sync {
    /// Name the type is registered under, e.g. `ext4`.
    fn name(&self) -> &'static str;

    /// Build a superblock over `device`, with its operations table and root
    /// dentry attached.
    fn mount(
        &self,
        device: Arc<dyn BlockDevice>,
        cache: Arc<PageCache>,
        flags: MountFlags,
        options: &str,
    ) -> FsResult<Arc<SuperBlock>>;

    /// Tear down a superblock produced by [`FilesystemType::mount`].
    fn umount(&self, sb: &Arc<SuperBlock>) -> FsResult<()>;
}

/// One active mount.
pub struct VfsMount {
    sb: Arc<SuperBlock>,
    /// The dentry the mount covers; `None` for the root mount.
    mountpoint: Option<Arc<Dentry>>,
    root: Arc<Dentry>,
    device_name: String,
    fstype: String,
    flags: MountFlags,
}

impl VfsMount {
    /// The mounted superblock.
    #[must_use]
    pub fn superblock(&self) -> &Arc<SuperBlock> {
        &self.sb
    }

    /// Path of the mountpoint.
    #[must_use]
    pub fn mountpoint_path(&self) -> String {
        self.mountpoint
            .as_ref()
            .map_or_else(|| "/".to_owned(), |d| d.path())
    }

    /// Root dentry of the mounted tree.
    #[must_use]
    pub fn root(&self) -> &Arc<Dentry> {
        &self.root
    }

    /// Name of the backing device.
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Filesystem type name.
    #[must_use]
    pub fn fstype(&self) -> &str {
        &self.fstype
    }

    /// Mount flags.
    #[must_use]
    pub fn flags(&self) -> MountFlags {
        self.flags
    }
}

struct RouterState {
    mounts: Vec<Arc<VfsMount>>,
    root: Option<Arc<Dentry>>,
}

/// The router itself: registries plus the global name tree.
///
/// Constructing private instances keeps unit tests isolated; production
/// callers typically share one router and the global page cache.
pub struct Vfs {
    fs_types: scc::HashMap<String, Arc<dyn FilesystemType>>,
    devices: scc::HashMap<String, Arc<dyn BlockDevice>>,
    cache: Arc<PageCache>,
    state: Mutex<RouterState>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// A router over the process-wide page cache.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cache(Arc::clone(PageCache::global()))
    }

    /// A router over an injected page cache instance.
    #[must_use]
    pub fn with_cache(cache: Arc<PageCache>) -> Self {
        Self {
            fs_types: scc::HashMap::new(),
            devices: scc::HashMap::new(),
            cache,
            state: Mutex::new(RouterState {
                mounts: Vec::new(),
                root: None,
            }),
        }
    }

    /// The page cache this router serves mounts from.
    #[must_use]
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// Register a filesystem type under its name.
    pub fn register_filesystem(&self, fs: Arc<dyn FilesystemType>) -> FsResult<()> {
        let name = fs.name().to_owned();
        self.fs_types
            .insert(name, fs)
            .map_err(|_| FsError::AlreadyExists)
    }

    /// Remove a filesystem type from the registry.
    pub fn unregister_filesystem(&self, name: &str) -> FsResult<()> {
        self.fs_types
            .remove(name)
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }

    /// Look up a registered filesystem type.
    #[must_use]
    pub fn filesystem(&self, name: &str) -> Option<Arc<dyn FilesystemType>> {
        self.fs_types.read(name, |_, fs| Arc::clone(fs))
    }

    /// Register a block device under its name.
    pub fn register_device(&self, device: Arc<dyn BlockDevice>) -> FsResult<()> {
        let name = device.name().to_owned();
        self.devices
            .insert(name, device)
            .map_err(|_| FsError::AlreadyExists)
    }

    /// Look up a registered block device.
    #[must_use]
    pub fn device(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.devices.read(name, |_, d| Arc::clone(d))
    }

    /// Mount `fstype` from `device` at `mountpoint`.
    ///
    /// The first mount must cover `/` and roots the global tree; later
    /// mounts attach to an existing directory, and path walks cross onto
    /// them transparently.
    pub fn mount(
        &self,
        device: &str,
        mountpoint: &str,
        fstype: &str,
        flags: MountFlags,
        options: &str,
    ) -> FsResult<()> {
        if !mountpoint.starts_with('/') {
            return Err(FsError::InvalidArgument);
        }
        let fs = self.filesystem(fstype).ok_or(FsError::NotFound)?;
        let dev = self.device(device).ok_or(FsError::NotFound)?;

        let at_root = components(mountpoint).next().is_none();
        let mountpoint_dentry = if at_root {
            if crate::sync::lock(&self.state).root.is_some() {
                return Err(FsError::AlreadyExists);
            }
            None
        } else {
            let d = self.lookup(mountpoint)?;
            if !d.inode().is_dir() {
                return Err(FsError::NotADirectory);
            }
            Some(d)
        };

        let sb = fs.mount(dev, Arc::clone(&self.cache), flags, options)?;
        let root = sb.root()?;

        let mount = Arc::new(VfsMount {
            sb,
            mountpoint: mountpoint_dentry,
            root: Arc::clone(&root),
            device_name: device.to_owned(),
            fstype: fstype.to_owned(),
            flags,
        });

        let mut state = crate::sync::lock(&self.state);
        if at_root {
            state.root = Some(root);
        }
        state.mounts.push(mount);
        info!(device, mountpoint, fstype, "mounted");
        Ok(())
    }

    /// Unmount the filesystem covering `mountpoint`.
    ///
    /// A mount with open files is busy and is not torn down.
    pub fn umount(&self, mountpoint: &str) -> FsResult<()> {
        if !mountpoint.starts_with('/') {
            return Err(FsError::InvalidArgument);
        }
        let normalized = if components(mountpoint).next().is_none() {
            "/".to_owned()
        } else {
            mountpoint.trim_end_matches('/').to_owned()
        };

        let mount = {
            let state = crate::sync::lock(&self.state);
            state
                .mounts
                .iter()
                .find(|m| m.mountpoint_path() == normalized)
                .cloned()
                .ok_or(FsError::NotFound)?
        };

        if mount.sb.open_file_count() > 0 {
            warn!(mountpoint, open = mount.sb.open_file_count(), "umount of busy mount rejected");
            return Err(FsError::AccessDenied);
        }

        let fs = self.filesystem(&mount.fstype).ok_or(FsError::NotFound)?;
        fs.umount(&mount.sb)?;
        mount.sb.release_root();

        let mut state = crate::sync::lock(&self.state);
        state.mounts.retain(|m| !Arc::ptr_eq(m, &mount));
        if mount.mountpoint.is_none() {
            state.root = None;
        }
        info!(mountpoint, "unmounted");
        Ok(())
    }

    /// Snapshot of the active mounts.
    #[must_use]
    pub fn mounts(&self) -> Vec<Arc<VfsMount>> {
        crate::sync::lock(&self.state).mounts.clone()
    }

    fn root(&self) -> FsResult<Arc<Dentry>> {
        crate::sync::lock(&self.state).root.clone().ok_or(FsError::NotFound)
    }

    /// If `dentry` is covered by a mount, continue at that mount's root.
    fn cross_mount(&self, dentry: Arc<Dentry>) -> Arc<Dentry> {
        let state = crate::sync::lock(&self.state);
        for mount in &state.mounts {
            if let Some(mp) = &mount.mountpoint {
                if Arc::ptr_eq(mp, &dentry) {
                    return Arc::clone(&mount.root);
                }
            }
        }
        dentry
    }

    fn walk_component(&self, dir: &Arc<Dentry>, name: &str) -> FsResult<Arc<Dentry>> {
        if let Some(child) = dir.lookup_child(name) {
            return Ok(child);
        }
        let inode = dir.inode().lookup(name)?;
        let child = Dentry::new(name, inode, dir);
        dir.add_child(Arc::clone(&child));
        Ok(child)
    }

    fn walk_from(
        &self,
        base: Arc<Dentry>,
        path: &str,
        follow_last: bool,
        depth: &mut u32,
    ) -> FsResult<Arc<Dentry>> {
        let mut cur = base;
        let comps: Vec<&str> = components(path).collect();
        for (i, name) in comps.iter().enumerate() {
            let last = i == comps.len() - 1;
            if !cur.inode().is_dir() {
                return Err(FsError::NotADirectory);
            }
            if *name == ".." {
                if let Some(parent) = cur.parent() {
                    cur = parent;
                }
                continue;
            }
            let child = self.cross_mount(self.walk_component(&cur, name)?);
            if child.inode().is_symlink() && (follow_last || !last) {
                *depth += 1;
                if *depth > MAX_SYMLINK_FOLLOWS {
                    debug!(path, "symlink follow budget exceeded");
                    return Err(FsError::InvalidArgument);
                }
                let target = child.inode().readlink()?;
                let next_base = if target.starts_with('/') {
                    self.root()?
                } else {
                    Arc::clone(&cur)
                };
                cur = self.walk_from(next_base, &target, true, depth)?;
            } else {
                cur = child;
            }
        }
        Ok(cur)
    }

    fn walk(&self, path: &str, follow_last: bool) -> FsResult<Arc<Dentry>> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidArgument);
        }
        let mut depth = 0;
        self.walk_from(self.root()?, path, follow_last, &mut depth)
    }

    /// Resolve a path to its dentry, following symlinks.
    pub fn lookup(&self, path: &str) -> FsResult<Arc<Dentry>> {
        self.walk(path, true)
    }

    fn resolve_parent(&self, path: &str) -> FsResult<(Arc<Dentry>, String)> {
        let (parent_path, name) = split_parent(path)?;
        let parent = self.walk(parent_path, true)?;
        if !parent.inode().is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok((parent, name.to_owned()))
    }

    /// Open (and possibly create) the file at `path`.
    pub fn open(&self, path: &str, flags: OpenFlags, perms: Permissions) -> FsResult<Arc<File>> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidArgument);
        }
        // The root itself can be opened, but only for reading.
        let dentry = if components(path).next().is_none() {
            self.root()?
        } else {
            let (parent, name) = self.resolve_parent(path)?;
            match self.walk_component(&parent, &name) {
                Ok(existing) => {
                    if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                        return Err(FsError::AlreadyExists);
                    }
                    let existing = self.cross_mount(existing);
                    if existing.inode().is_symlink() {
                        if flags.contains(OpenFlags::NOFOLLOW) {
                            return Err(FsError::InvalidArgument);
                        }
                        let mut depth = 1;
                        let target = existing.inode().readlink()?;
                        let base = if target.starts_with('/') {
                            self.root()?
                        } else {
                            Arc::clone(&parent)
                        };
                        self.walk_from(base, &target, true, &mut depth)?
                    } else {
                        existing
                    }
                }
                Err(FsError::NotFound) if flags.contains(OpenFlags::CREAT) => {
                    let inode = parent.inode().create(&name, perms)?;
                    let child = Dentry::new(&name, inode, &parent);
                    parent.add_child(Arc::clone(&child));
                    child
                }
                Err(e) => return Err(e),
            }
        };

        let inode = dentry.inode();
        if flags.contains(OpenFlags::DIRECTORY) && !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if inode.is_dir() && flags.writable() {
            return Err(FsError::IsADirectory);
        }
        if flags.contains(OpenFlags::TRUNC) && flags.writable() {
            inode.truncate(0)?;
        }
        Ok(File::open(dentry, flags))
    }

    /// Drop a file handle. Present for API symmetry with `open`; the last
    /// clone going away is what actually closes the file.
    pub fn close(&self, file: Arc<File>) {
        drop(file);
    }

    /// Create a directory at `path`.
    pub fn mkdir(&self, path: &str, perms: Permissions) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path)?;
        if parent.lookup_child(&name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let inode = parent.inode().mkdir(&name, perms)?;
        parent.add_child(Dentry::new(&name, inode, &parent));
        Ok(())
    }

    /// Remove the empty directory at `path`.
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path)?;
        parent.inode().rmdir(&name)?;
        parent.remove_child(&name);
        Ok(())
    }

    /// Remove the non-directory entry at `path`.
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path)?;
        parent.inode().unlink(&name)?;
        parent.remove_child(&name);
        Ok(())
    }

    /// Rename `old_path` to `new_path`.
    ///
    /// On success both cached dentries are dropped; later walks re-resolve
    /// through the driver.
    pub fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        let (old_parent, old_name) = self.resolve_parent(old_path)?;
        let (new_parent, new_name) = self.resolve_parent(new_path)?;
        old_parent
            .inode()
            .rename_to(&old_name, new_parent.inode(), &new_name)?;
        old_parent.remove_child(&old_name);
        new_parent.remove_child(&new_name);
        Ok(())
    }

    /// Attribute snapshot at `path`, following symlinks.
    pub fn stat(&self, path: &str) -> FsResult<Attributes> {
        Ok(self.walk(path, true)?.inode().getattr())
    }

    /// Attribute snapshot at `path` without following a final symlink.
    pub fn lstat(&self, path: &str) -> FsResult<Attributes> {
        Ok(self.walk(path, false)?.inode().getattr())
    }

    /// Change permission bits at `path`.
    pub fn chmod(&self, path: &str, perms: Permissions) -> FsResult<()> {
        self.walk(path, true)?.inode().chmod(perms)
    }

    /// Change ownership at `path`.
    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.walk(path, true)?.inode().chown(uid, gid)
    }

    /// Change the size of the file at `path`, following symlinks.
    pub fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        self.walk(path, true)?.inode().truncate(size)
    }

    /// Create a symlink at `linkpath` pointing to `target`.
    pub fn symlink(&self, target: &str, linkpath: &str) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(linkpath)?;
        if parent.lookup_child(&name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let inode = parent.inode().symlink(&name, target)?;
        parent.add_child(Dentry::new(&name, inode, &parent));
        Ok(())
    }

    /// Read the target of the symlink at `path`.
    pub fn readlink(&self, path: &str) -> FsResult<String> {
        self.walk(path, false)?.inode().readlink()
    }

    /// Filesystem statistics for the mount containing `path`.
    pub fn statfs(&self, path: &str) -> FsResult<FsStats> {
        self.walk(path, true)?.inode().superblock().statfs()
    }

    /// Flush the page cache, then sync every mounted superblock. All mounts
    /// are attempted; the first error is reported.
    pub fn sync(&self) -> FsResult<()> {
        let mut first_err = self.cache.flush_all().err();
        for mount in self.mounts() {
            if let Err(e) = mount.sb.sync() {
                warn!(device = mount.device_name(), error = %e, "superblock sync failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
