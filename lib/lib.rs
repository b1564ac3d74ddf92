//! pagefs: an in-process UNIX-style filesystem stack.
//!
//! A [`vfs::Vfs`] router dispatches path operations to pluggable filesystem
//! drivers (the [`ext4`] reference driver ships in-tree), with file content
//! flowing through a shared [`cache::PageCache`] over sector-addressed
//! [`block::BlockDevice`]s.

pub mod block;
/// Page caching for file content.
pub mod cache;
pub mod error;
/// Reference EXT4-shaped driver.
pub mod ext4;
pub mod sync;
/// The VFS object graph and router.
pub mod vfs;

pub use error::{FsError, FsResult};
