#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::time::SystemTime;

use common::{mount_fresh, read_file, write_file};
use pagefs::FsError;
use pagefs::vfs::{FileType, OpenFlags, Permissions};

#[test]
fn mkdir_then_readdir_lists_the_entry() {
    let fs = mount_fresh();
    fs.vfs.mkdir("/projects", Permissions::dir_default()).unwrap();
    write_file(&fs.vfs, "/projects/notes.txt", b"n");

    let root = fs
        .vfs
        .open("/", OpenFlags::RDONLY, Permissions::dir_default())
        .unwrap();
    let names: Vec<String> = root.readdir().unwrap().into_iter().map(|e| e.name).collect();
    assert!(names.contains(&".".to_owned()));
    assert!(names.contains(&"..".to_owned()));
    assert!(names.contains(&"projects".to_owned()));

    let entries = fs.vfs.lookup("/projects").unwrap().inode().readdir().unwrap();
    let notes = entries.iter().find(|e| e.name == "notes.txt").unwrap();
    assert_eq!(notes.ftype, FileType::Regular);
    assert!(notes.ino >= 11, "user inodes start past the reserved range");
}

#[test]
fn mkdir_maintains_link_counts() {
    let fs = mount_fresh();
    let before = fs.vfs.stat("/").unwrap().nlink;
    fs.vfs.mkdir("/sub", Permissions::dir_default()).unwrap();

    assert_eq!(fs.vfs.stat("/").unwrap().nlink, before + 1, "`..` links the parent");
    assert_eq!(fs.vfs.stat("/sub").unwrap().nlink, 2);
}

#[test]
fn mkdir_of_an_existing_name_already_exists() {
    let fs = mount_fresh();
    fs.vfs.mkdir("/dup", Permissions::dir_default()).unwrap();
    assert_eq!(
        fs.vfs.mkdir("/dup", Permissions::dir_default()),
        Err(FsError::AlreadyExists)
    );
}

#[test]
fn unlink_removes_the_file() {
    let fs = mount_fresh();
    write_file(&fs.vfs, "/gone.txt", b"bye");
    fs.vfs.unlink("/gone.txt").unwrap();

    assert_eq!(fs.vfs.stat("/gone.txt"), Err(FsError::NotFound));
    assert_eq!(fs.vfs.unlink("/gone.txt"), Err(FsError::NotFound));
}

#[test]
fn unlink_frees_space_for_reuse() {
    let fs = mount_fresh();
    let free_before = fs.vfs.statfs("/").unwrap();
    write_file(&fs.vfs, "/big.bin", &vec![1u8; 64 * 1024]);
    fs.vfs.sync().unwrap();
    let free_during = fs.vfs.statfs("/").unwrap();
    assert!(free_during.free_blocks < free_before.free_blocks);
    assert!(free_during.free_inodes < free_before.free_inodes);

    fs.vfs.unlink("/big.bin").unwrap();
    let free_after = fs.vfs.statfs("/").unwrap();
    assert_eq!(free_after.free_blocks, free_before.free_blocks);
    assert_eq!(free_after.free_inodes, free_before.free_inodes);
}

#[test]
fn unlink_of_a_directory_is_rejected() {
    let fs = mount_fresh();
    fs.vfs.mkdir("/d", Permissions::dir_default()).unwrap();
    assert_eq!(fs.vfs.unlink("/d"), Err(FsError::IsADirectory));
}

#[test]
fn rmdir_requires_an_empty_directory() {
    let fs = mount_fresh();
    fs.vfs.mkdir("/full", Permissions::dir_default()).unwrap();
    write_file(&fs.vfs, "/full/file.txt", b"x");

    assert!(fs.vfs.rmdir("/full").is_err(), "non-empty directory stays");
    fs.vfs.unlink("/full/file.txt").unwrap();
    fs.vfs.rmdir("/full").unwrap();
    assert_eq!(fs.vfs.stat("/full"), Err(FsError::NotFound));
}

#[test]
fn rmdir_of_a_file_is_not_a_directory() {
    let fs = mount_fresh();
    write_file(&fs.vfs, "/f", b"x");
    assert_eq!(fs.vfs.rmdir("/f"), Err(FsError::NotADirectory));
}

#[test]
fn rename_within_a_directory() {
    let fs = mount_fresh();
    write_file(&fs.vfs, "/old-name.txt", b"contents");
    fs.vfs.rename("/old-name.txt", "/new-name.txt").unwrap();

    assert_eq!(fs.vfs.stat("/old-name.txt"), Err(FsError::NotFound));
    assert_eq!(read_file(&fs.vfs, "/new-name.txt"), b"contents");
}

#[test]
fn rename_across_directories_moves_content_and_links() {
    let fs = mount_fresh();
    fs.vfs.mkdir("/src", Permissions::dir_default()).unwrap();
    fs.vfs.mkdir("/dst", Permissions::dir_default()).unwrap();
    fs.vfs.mkdir("/src/inner", Permissions::dir_default()).unwrap();
    write_file(&fs.vfs, "/src/inner/deep.txt", b"moved along");

    let src_links = fs.vfs.stat("/src").unwrap().nlink;
    let dst_links = fs.vfs.stat("/dst").unwrap().nlink;

    fs.vfs.rename("/src/inner", "/dst/inner").unwrap();

    assert_eq!(fs.vfs.stat("/src/inner"), Err(FsError::NotFound));
    assert_eq!(read_file(&fs.vfs, "/dst/inner/deep.txt"), b"moved along");
    assert_eq!(fs.vfs.stat("/src").unwrap().nlink, src_links - 1);
    assert_eq!(fs.vfs.stat("/dst").unwrap().nlink, dst_links + 1);
    // The moved directory's `..` points at its new parent.
    let dotdot = fs
        .vfs
        .lookup("/dst/inner")
        .unwrap()
        .inode()
        .readdir()
        .unwrap()
        .into_iter()
        .find(|e| e.name == "..")
        .unwrap();
    assert_eq!(dotdot.ino, fs.vfs.lookup("/dst").unwrap().inode().ino());
}

#[test]
fn rename_replaces_a_compatible_target() {
    let fs = mount_fresh();
    write_file(&fs.vfs, "/winner.txt", b"winner");
    write_file(&fs.vfs, "/loser.txt", b"loser");

    fs.vfs.rename("/winner.txt", "/loser.txt").unwrap();
    assert_eq!(read_file(&fs.vfs, "/loser.txt"), b"winner");
    assert_eq!(fs.vfs.stat("/winner.txt"), Err(FsError::NotFound));
}

#[test]
fn rename_of_missing_source_is_not_found() {
    let fs = mount_fresh();
    assert_eq!(fs.vfs.rename("/ghost", "/dest"), Err(FsError::NotFound));
}

#[test]
fn chmod_and_chown_update_attributes_and_ctime() {
    let fs = mount_fresh();
    write_file(&fs.vfs, "/perms.txt", b"x");
    let before = fs.vfs.stat("/perms.txt").unwrap();

    std::thread::sleep(std::time::Duration::from_millis(10));
    fs.vfs
        .chmod("/perms.txt", Permissions::OWNER_READ | Permissions::OWNER_WRITE)
        .unwrap();
    fs.vfs.chown("/perms.txt", 1000, 1000).unwrap();

    let after = fs.vfs.stat("/perms.txt").unwrap();
    assert_eq!(after.perms, Permissions::OWNER_READ | Permissions::OWNER_WRITE);
    assert_eq!((after.uid, after.gid), (1000, 1000));
    assert!(after.ctime >= before.ctime);
}

#[test]
fn directory_mutations_update_mtime() {
    let fs = mount_fresh();
    fs.vfs.mkdir("/stamped", Permissions::dir_default()).unwrap();
    let before = fs.vfs.stat("/stamped").unwrap().mtime;

    std::thread::sleep(std::time::Duration::from_millis(10));
    write_file(&fs.vfs, "/stamped/child.txt", b"x");
    let after = fs.vfs.stat("/stamped").unwrap().mtime;
    assert!(after > before, "creating an entry stamps the directory");

    // A failed mutation leaves the timestamps alone.
    let settled = fs.vfs.stat("/stamped").unwrap().mtime;
    std::thread::sleep(std::time::Duration::from_millis(10));
    let _ = fs.vfs.mkdir("/stamped/child.txt", Permissions::dir_default());
    assert_eq!(fs.vfs.stat("/stamped").unwrap().mtime, settled);
}

#[test]
fn timestamps_survive_a_sync_round_trip() {
    let fs = mount_fresh();
    write_file(&fs.vfs, "/times.txt", b"x");
    let before = fs.vfs.stat("/times.txt").unwrap();
    fs.vfs.sync().unwrap();

    let after = fs.vfs.stat("/times.txt").unwrap();
    assert_eq!(
        clamp_to_secs(after.mtime),
        clamp_to_secs(before.mtime),
        "mtime travels through the driver boundary"
    );
}

fn clamp_to_secs(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_secs()
}

#[test]
fn xattrs_round_trip_through_the_driver() {
    let fs = mount_fresh();
    write_file(&fs.vfs, "/tagged.txt", b"x");
    let inode = std::sync::Arc::clone(fs.vfs.lookup("/tagged.txt").unwrap().inode());

    inode.setxattr("user.origin", b"pagefs-tests").unwrap();
    inode.setxattr("user.rank", b"7").unwrap();

    assert_eq!(inode.getxattr("user.origin").unwrap(), b"pagefs-tests");
    let mut names = inode.listxattr().unwrap();
    names.sort();
    assert_eq!(names, vec!["user.origin".to_owned(), "user.rank".to_owned()]);

    inode.removexattr("user.rank").unwrap();
    assert_eq!(inode.getxattr("user.rank"), Err(FsError::NotFound));
    assert_eq!(inode.removexattr("user.rank"), Err(FsError::NotFound));
}
