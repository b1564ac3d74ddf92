//! Open-file state: a dentry, open flags, and a cursor.

use std::io::SeekFrom;

use crate::error::{FsError, FsResult};
use crate::sync::{Arc, Mutex};
use crate::vfs::dentry::Dentry;
use crate::vfs::inode::Inode;
use crate::vfs::{Attributes, DirEntry, OpenFlags};

/// An open file.
///
/// Handles share the inode through the dentry but keep independent cursors;
/// sequential reads and writes advance the cursor under the file's lock.
/// Dropping the last clone of a handle releases the mount's open-file count.
pub struct File {
    dentry: Arc<Dentry>,
    flags: OpenFlags,
    pos: Mutex<u64>,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.dentry.path())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl File {
    pub(crate) fn open(dentry: Arc<Dentry>, flags: OpenFlags) -> Arc<Self> {
        dentry.inode().superblock().file_opened();
        Arc::new(Self {
            dentry,
            flags,
            pos: Mutex::new(0),
        })
    }

    /// The dentry this file was opened through.
    #[must_use]
    pub fn dentry(&self) -> &Arc<Dentry> {
        &self.dentry
    }

    /// The underlying inode.
    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        self.dentry.inode()
    }

    /// The flags this file was opened with.
    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Current cursor position.
    #[must_use]
    pub fn pos(&self) -> u64 {
        *crate::sync::lock(&self.pos)
    }

    /// Read from the cursor, advancing it by the bytes transferred.
    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        if !self.flags.readable() {
            return Err(FsError::AccessDenied);
        }
        let mut pos = crate::sync::lock(&self.pos);
        let n = self.inode().read_at(*pos, buf)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Write at the cursor, advancing it by the bytes transferred. In
    /// append mode every write starts at the current end of file.
    pub fn write(&self, buf: &[u8]) -> FsResult<usize> {
        if !self.flags.writable() {
            return Err(FsError::AccessDenied);
        }
        let mut pos = crate::sync::lock(&self.pos);
        if self.flags.contains(OpenFlags::APPEND) {
            *pos = self.inode().size();
        }
        let n = self.inode().write_at(*pos, buf)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Move the cursor. A resulting position before byte 0 is rejected.
    pub fn seek(&self, whence: SeekFrom) -> FsResult<u64> {
        let mut pos = crate::sync::lock(&self.pos);
        let base = match whence {
            SeekFrom::Start(offset) => {
                *pos = offset;
                return Ok(*pos);
            }
            SeekFrom::Current(delta) => (*pos, delta),
            SeekFrom::End(delta) => (self.inode().size(), delta),
        };
        let (origin, delta) = base;
        let next = origin
            .checked_add_signed(delta)
            .ok_or(FsError::InvalidArgument)?;
        *pos = next;
        Ok(next)
    }

    /// Flush this file's dirty pages and metadata.
    pub fn fsync(&self) -> FsResult<()> {
        self.inode().sync()
    }

    /// Truncate the underlying file to `size`.
    pub fn truncate(&self, size: u64) -> FsResult<()> {
        if !self.flags.writable() {
            return Err(FsError::AccessDenied);
        }
        self.inode().truncate(size)
    }

    /// List entries when this file is an open directory.
    pub fn readdir(&self) -> FsResult<Vec<DirEntry>> {
        self.inode().readdir()
    }

    /// Attribute snapshot of the underlying inode.
    #[must_use]
    pub fn stat(&self) -> Attributes {
        self.inode().getattr()
    }

    /// Duplicate this handle: same dentry and flags, an independent cursor
    /// starting at this handle's current position.
    #[must_use]
    pub fn dup(&self) -> Arc<File> {
        let file = Self::open(Arc::clone(&self.dentry), self.flags);
        *crate::sync::lock(&file.pos) = self.pos();
        file
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.dentry.inode().superblock().file_closed();
    }
}
