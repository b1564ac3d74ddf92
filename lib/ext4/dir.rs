//! Variable-length directory entry records packed into blocks.
//!
//! Each record is `ino u32, rec_len u16, name_len u8, file_type u8, name`,
//! 4-byte aligned. A record's `rec_len` spans to the start of the next
//! record, so the records of a block always tile it exactly; free space is a
//! record with `ino == 0` or the slack tail of a live record.

use crate::error::{FsError, FsResult};
use crate::ext4::layout::{read_u16, read_u32, write_u16, write_u32};
use crate::vfs::FileType;

const HEADER: usize = 8;

/// ext4 file-type codes carried in directory entries.
pub const FT_REG_FILE: u8 = 1;
/// Directory.
pub const FT_DIR: u8 = 2;
/// Character device.
pub const FT_CHRDEV: u8 = 3;
/// Block device.
pub const FT_BLKDEV: u8 = 4;
/// Named pipe.
pub const FT_FIFO: u8 = 5;
/// Socket.
pub const FT_SOCK: u8 = 6;
/// Symbolic link.
pub const FT_SYMLINK: u8 = 7;

/// Map a VFS file type to its dirent code.
#[must_use]
pub fn code_of(ftype: FileType) -> u8 {
    match ftype {
        FileType::Regular => FT_REG_FILE,
        FileType::Directory => FT_DIR,
        FileType::CharDevice => FT_CHRDEV,
        FileType::BlockDevice => FT_BLKDEV,
        FileType::Fifo => FT_FIFO,
        FileType::Socket => FT_SOCK,
        FileType::Symlink => FT_SYMLINK,
    }
}

/// Map a dirent code back to a VFS file type.
pub fn type_of(code: u8) -> FsResult<FileType> {
    match code {
        FT_REG_FILE => Ok(FileType::Regular),
        FT_DIR => Ok(FileType::Directory),
        FT_CHRDEV => Ok(FileType::CharDevice),
        FT_BLKDEV => Ok(FileType::BlockDevice),
        FT_FIFO => Ok(FileType::Fifo),
        FT_SOCK => Ok(FileType::Socket),
        FT_SYMLINK => Ok(FileType::Symlink),
        _ => Err(FsError::Io),
    }
}

/// Bytes a record with an `n`-byte name occupies.
#[must_use]
pub fn record_size(name_len: usize) -> usize {
    (HEADER + name_len + 3) & !3
}

/// A decoded live entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDirent {
    /// Inode number of the entry.
    pub ino: u32,
    /// ext4 file-type code.
    pub code: u8,
    /// Entry name.
    pub name: String,
}

/// Format `buf` as an empty directory block: one free record spanning it.
pub fn init_block(buf: &mut [u8]) {
    buf.fill(0);
    write_u32(buf, 0, 0);
    #[allow(clippy::cast_possible_truncation)]
    write_u16(buf, 4, buf.len() as u16);
}

fn walk(buf: &[u8]) -> impl Iterator<Item = (usize, u32, u16, u8, u8)> + '_ {
    let mut off = 0;
    std::iter::from_fn(move || {
        if off + HEADER > buf.len() {
            return None;
        }
        let ino = read_u32(buf, off);
        let rec_len = read_u16(buf, off + 4);
        let name_len = buf[off + 6];
        let code = buf[off + 7];
        if (rec_len as usize) < HEADER || off + rec_len as usize > buf.len() {
            return None;
        }
        let here = off;
        off += rec_len as usize;
        Some((here, ino, rec_len, name_len, code))
    })
}

/// Decode the live entries of a block.
#[must_use]
pub fn entries(buf: &[u8]) -> Vec<RawDirent> {
    walk(buf)
        .filter(|&(_, ino, _, _, _)| ino != 0)
        .map(|(off, ino, _, name_len, code)| RawDirent {
            ino,
            code,
            name: String::from_utf8_lossy(&buf[off + HEADER..off + HEADER + name_len as usize])
                .into_owned(),
        })
        .collect()
}

/// Find a live entry by name; returns `(ino, code)`.
#[must_use]
pub fn find(buf: &[u8], name: &str) -> Option<(u32, u8)> {
    walk(buf)
        .filter(|&(_, ino, _, _, _)| ino != 0)
        .find(|&(off, _, _, name_len, _)| {
            &buf[off + HEADER..off + HEADER + name_len as usize] == name.as_bytes()
        })
        .map(|(_, ino, _, _, code)| (ino, code))
}

/// Insert an entry, splitting the first record with enough slack.
/// Returns `false` when the block has no room.
pub fn insert(buf: &mut [u8], ino: u32, code: u8, name: &str) -> bool {
    let needed = record_size(name.len());
    let slots: Vec<(usize, u32, u16, u8)> = walk(buf)
        .map(|(off, ino, rec_len, name_len, _)| (off, ino, rec_len, name_len))
        .collect();

    for (off, cur_ino, rec_len, name_len) in slots {
        let (write_off, write_len) = if cur_ino == 0 {
            if (rec_len as usize) < needed {
                continue;
            }
            (off, rec_len)
        } else {
            let used = record_size(name_len as usize);
            let slack = rec_len as usize - used;
            if slack < needed {
                continue;
            }
            // Shrink the live record to its used size and carve the new
            // record out of its tail.
            #[allow(clippy::cast_possible_truncation)]
            write_u16(buf, off + 4, used as u16);
            #[allow(clippy::cast_possible_truncation)]
            let carved = (off + used, slack as u16);
            carved
        };

        write_u32(buf, write_off, ino);
        write_u16(buf, write_off + 4, write_len);
        #[allow(clippy::cast_possible_truncation)]
        {
            buf[write_off + 6] = name.len() as u8;
        }
        buf[write_off + 7] = code;
        buf[write_off + HEADER..write_off + HEADER + name.len()]
            .copy_from_slice(name.as_bytes());
        return true;
    }
    false
}

/// Remove an entry by name, merging its space into the preceding record
/// (or freeing it in place at the block head). Returns `false` when absent.
pub fn remove(buf: &mut [u8], name: &str) -> bool {
    let mut prev: Option<(usize, u16)> = None;
    let records: Vec<(usize, u32, u16, u8)> = walk(buf)
        .map(|(off, ino, rec_len, name_len, _)| (off, ino, rec_len, name_len))
        .collect();

    for (off, ino, rec_len, name_len) in records {
        let matches = ino != 0
            && &buf[off + HEADER..off + HEADER + name_len as usize] == name.as_bytes();
        if matches {
            if let Some((prev_off, prev_len)) = prev {
                write_u16(buf, prev_off + 4, prev_len + rec_len);
            } else {
                write_u32(buf, off, 0);
                buf[off + 6] = 0;
                buf[off + 7] = 0;
            }
            return true;
        }
        prev = Some((off, rec_len));
    }
    false
}

/// Whether the block holds no live entries besides `.` and `..`.
#[must_use]
pub fn is_empty_block(buf: &[u8]) -> bool {
    entries(buf)
        .iter()
        .all(|e| e.name == "." || e.name == "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PAGE_SIZE;

    fn fresh_block() -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        init_block(&mut buf);
        buf
    }

    #[test]
    fn insert_then_find() {
        let mut buf = fresh_block();
        assert!(insert(&mut buf, 12, FT_REG_FILE, "hello.txt"));
        assert!(insert(&mut buf, 13, FT_DIR, "sub"));
        assert_eq!(find(&buf, "hello.txt"), Some((12, FT_REG_FILE)));
        assert_eq!(find(&buf, "sub"), Some((13, FT_DIR)));
        assert_eq!(find(&buf, "nope"), None);
    }

    #[test]
    fn records_tile_the_block() {
        let mut buf = fresh_block();
        for i in 0..20 {
            assert!(insert(&mut buf, 100 + i, FT_REG_FILE, &format!("f{i}")));
        }
        let total: usize = walk(&buf).map(|(_, _, rec_len, _, _)| rec_len as usize).sum();
        assert_eq!(total, PAGE_SIZE);
    }

    #[test]
    fn remove_merges_into_predecessor() {
        let mut buf = fresh_block();
        assert!(insert(&mut buf, 1, FT_REG_FILE, "a"));
        assert!(insert(&mut buf, 2, FT_REG_FILE, "b"));
        assert!(insert(&mut buf, 3, FT_REG_FILE, "c"));
        assert!(remove(&mut buf, "b"));
        assert_eq!(find(&buf, "b"), None);
        assert_eq!(find(&buf, "a"), Some((1, FT_REG_FILE)));
        assert_eq!(find(&buf, "c"), Some((3, FT_REG_FILE)));
        // The freed space is reusable.
        assert!(insert(&mut buf, 4, FT_REG_FILE, "b2"));
        assert_eq!(find(&buf, "b2"), Some((4, FT_REG_FILE)));
    }

    #[test]
    fn remove_head_frees_in_place() {
        let mut buf = fresh_block();
        assert!(insert(&mut buf, 1, FT_REG_FILE, "only"));
        assert!(remove(&mut buf, "only"));
        assert_eq!(entries(&buf).len(), 0);
        assert!(insert(&mut buf, 2, FT_REG_FILE, "again"));
    }

    #[test]
    fn dot_entries_do_not_count_against_emptiness() {
        let mut buf = fresh_block();
        assert!(insert(&mut buf, 2, FT_DIR, "."));
        assert!(insert(&mut buf, 1, FT_DIR, ".."));
        assert!(is_empty_block(&buf));
        assert!(insert(&mut buf, 5, FT_REG_FILE, "x"));
        assert!(!is_empty_block(&buf));
    }

    #[test]
    fn block_fills_up_eventually() {
        let mut buf = fresh_block();
        let mut inserted = 0u32;
        while insert(&mut buf, 100 + inserted, FT_REG_FILE, "some-filename") {
            inserted += 1;
        }
        // 20-byte records in a 4096-byte block.
        assert!(inserted > 100);
        assert!(!insert(&mut buf, 9999, FT_REG_FILE, "one-more"));
    }
}
