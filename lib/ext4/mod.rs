//! Reference EXT4-shaped filesystem driver.
//!
//! Owns the on-disk layout: a superblock, allocation bitmaps, a fixed inode
//! table, and data blocks mapped through 12 direct pointers plus one
//! single-indirect block per inode. The VFS never touches these structures;
//! it sees only the driver interface.

pub mod alloc;
pub mod dir;
pub mod driver;
pub mod layout;

pub use driver::{Ext4Fs, Ext4FsType};
pub use layout::{EXT4_SUPER_MAGIC, ROOT_INO};
