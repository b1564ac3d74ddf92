//! The VFS object graph: inodes, dentries, superblocks, open files, and the
//! router that dispatches path-based operations to a mounted driver.

pub mod dentry;
pub mod file;
pub mod inode;
pub(crate) mod path;
pub mod router;
pub mod superblock;

pub use dentry::Dentry;
pub use file::File;
pub use inode::{Inode, InodeOps};
pub use router::{FilesystemType, Vfs, VfsMount};
pub use superblock::{SuperBlock, SuperBlockOps};

use std::time::SystemTime;

use bitflags::bitflags;

/// Inode number within one superblock.
pub type InodeNo = u64;

/// How many symlinks a single path walk may traverse before giving up.
pub const MAX_SYMLINK_FOLLOWS: u32 = 8;

bitflags! {
    /// Permission bits for an inode, following the Unix layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Sticky bit.
        const STICKY        = 1 << 9;
        /// Set-group-ID bit.
        const SETGID        = 1 << 10;
        /// Set-user-ID bit.
        const SETUID        = 1 << 11;

        /// Other: read, write, and execute.
        const OTHER_RWX = Self::OTHER_READ.bits()
            | Self::OTHER_WRITE.bits()
            | Self::OTHER_EXECUTE.bits();
        /// Group: read, write, and execute.
        const GROUP_RWX = Self::GROUP_READ.bits()
            | Self::GROUP_WRITE.bits()
            | Self::GROUP_EXECUTE.bits();
        /// Owner: read, write, and execute.
        const OWNER_RWX = Self::OWNER_READ.bits()
            | Self::OWNER_WRITE.bits()
            | Self::OWNER_EXECUTE.bits();
    }
}

impl Permissions {
    /// The conventional `0o644` file default.
    #[must_use]
    pub fn file_default() -> Self {
        Self::OWNER_READ | Self::OWNER_WRITE | Self::GROUP_READ | Self::OTHER_READ
    }

    /// The conventional `0o755` directory default.
    #[must_use]
    pub fn dir_default() -> Self {
        Self::OWNER_RWX
            | Self::GROUP_READ
            | Self::GROUP_EXECUTE
            | Self::OTHER_READ
            | Self::OTHER_EXECUTE
    }
}

bitflags! {
    /// Flags for opening a file, following the Unix open(2) conventions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create the file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if the file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;

        /// Do not follow a symlink in the final component.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Fail if the target is not a directory.
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

impl OpenFlags {
    /// Whether the access mode permits reading. `O_RDONLY` is zero, so this
    /// cannot be a plain `contains` check.
    #[must_use]
    pub fn readable(self) -> bool {
        let mode = self.bits() & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    /// Whether the access mode permits writing.
    #[must_use]
    pub fn writable(self) -> bool {
        let mode = self.bits() & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }
}

bitflags! {
    /// Mount flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MountFlags: u32 {
        /// Reject every mutation with a read-only error.
        const RDONLY = 1 << 0;
        /// Skip access-time updates on reads.
        const NOATIME = 1 << 1;
    }
}

/// The type of an object on the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// A regular file.
    Regular,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A block device node.
    BlockDevice,
    /// A character device node.
    CharDevice,
    /// A named pipe.
    Fifo,
    /// A socket.
    Socket,
}

impl FileType {
    /// The `S_IFMT` bits for this type.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::Regular => libc::S_IFREG,
            Self::Directory => libc::S_IFDIR,
            Self::Symlink => libc::S_IFLNK,
            Self::BlockDevice => libc::S_IFBLK,
            Self::CharDevice => libc::S_IFCHR,
            Self::Fifo => libc::S_IFIFO,
            Self::Socket => libc::S_IFSOCK,
        }
    }
}

/// In-memory attribute record of an inode.
///
/// The in-memory copy is authoritative; the driver persists it through
/// `write_inode`. Timestamps travel through every boundary unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    /// Object type.
    pub ftype: FileType,
    /// Permission bits.
    pub perms: Permissions,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Allocated blocks.
    pub blocks: u64,
    /// Hard-link count.
    pub nlink: u32,
    /// Preferred I/O block size.
    pub blksize: u32,
    /// Last access.
    pub atime: SystemTime,
    /// Last content modification.
    pub mtime: SystemTime,
    /// Last status change.
    pub ctime: SystemTime,
}

impl Attributes {
    /// Fresh attributes for a newly created object, timestamped now.
    #[must_use]
    pub fn new(ftype: FileType, perms: Permissions) -> Self {
        let now = SystemTime::now();
        Self {
            ftype,
            perms,
            uid: 0,
            gid: 0,
            size: 0,
            blocks: 0,
            nlink: 1,
            blksize: crate::cache::PAGE_SIZE as u32,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// The POSIX `st_mode` word: type bits or-ed with permission bits.
    #[must_use]
    pub fn mode(&self) -> u32 {
        self.ftype.mode_bits() | u32::from(self.perms.bits())
    }

    /// Whether this is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.ftype == FileType::Directory
    }

    /// Whether the owner may write.
    #[must_use]
    pub fn owner_writable(&self) -> bool {
        self.perms.contains(Permissions::OWNER_WRITE)
    }

    /// Stamp mtime and ctime.
    pub(crate) fn touch_modified(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }
}

/// A directory entry yielded by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number of the entry.
    pub ino: InodeNo,
    /// Entry name within its parent.
    pub name: String,
    /// Entry type.
    pub ftype: FileType,
}

/// Filesystem statistics returned by `statfs`.
///
/// Block-related counts are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Total number of inodes.
    pub total_inodes: u64,
    /// Number of free inodes.
    pub free_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}
