#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;

use common::{MIB, init_tracing, mem_device_named};
use pagefs::cache::PageCache;
use pagefs::ext4::{Ext4Fs, Ext4FsType, ROOT_INO};
use pagefs::vfs::{FileType, MountFlags, Permissions, Vfs};

fn mount_on(device: &Arc<dyn pagefs::block::BlockDevice>, cache_pages: usize) -> (Vfs, Arc<PageCache>) {
    let cache = PageCache::new(cache_pages);
    let vfs = Vfs::with_cache(Arc::clone(&cache));
    vfs.register_filesystem(Arc::new(Ext4FsType)).unwrap();
    vfs.register_device(Arc::clone(device)).unwrap();
    vfs.mount(device.name(), "/", "ext4", MountFlags::empty(), "")
        .unwrap();
    (vfs, cache)
}

#[test]
fn a_tree_survives_unmount_and_remount() {
    init_tracing();
    let device = mem_device_named("persist0", 64 * MIB);
    Ext4Fs::mkfs(&device, "").unwrap();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 233) as u8).collect();
    let (mtime_secs, root_ino);
    {
        let (vfs, _cache) = mount_on(&device, 256);
        vfs.mkdir("/etc", Permissions::dir_default()).unwrap();
        vfs.mkdir("/etc/app", Permissions::dir_default()).unwrap();
        common::write_file(&vfs, "/etc/app/config.bin", &payload);
        vfs.symlink("/etc/app/config.bin", "/etc/current").unwrap();
        vfs.chmod(
            "/etc/app/config.bin",
            Permissions::OWNER_READ | Permissions::OWNER_WRITE,
        )
        .unwrap();

        let attrs = vfs.stat("/etc/app/config.bin").unwrap();
        mtime_secs = attrs
            .mtime
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        root_ino = vfs.lookup("/").unwrap().inode().ino();

        vfs.sync().unwrap();
        vfs.umount("/").unwrap();
    }

    let (vfs, _cache) = mount_on(&device, 256);
    assert_eq!(root_ino, ROOT_INO);
    assert_eq!(vfs.lookup("/").unwrap().inode().ino(), ROOT_INO);

    let attrs = vfs.stat("/etc/app/config.bin").unwrap();
    assert_eq!(attrs.size, payload.len() as u64);
    assert_eq!(attrs.ftype, FileType::Regular);
    assert_eq!(
        attrs.perms,
        Permissions::OWNER_READ | Permissions::OWNER_WRITE,
        "chmod persisted"
    );
    assert_eq!(
        attrs
            .mtime
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs(),
        mtime_secs,
        "timestamps persisted at second resolution"
    );

    assert_eq!(common::read_file(&vfs, "/etc/app/config.bin"), payload);
    assert_eq!(vfs.readlink("/etc/current").unwrap(), "/etc/app/config.bin");
    assert_eq!(common::read_file(&vfs, "/etc/current"), payload);
}

#[test]
fn unlinked_files_stay_gone_after_remount() {
    let device = mem_device_named("persist1", 32 * MIB);
    Ext4Fs::mkfs(&device, "").unwrap();

    {
        let (vfs, _cache) = mount_on(&device, 128);
        common::write_file(&vfs, "/keep.txt", b"keep");
        common::write_file(&vfs, "/drop.txt", b"drop");
        vfs.unlink("/drop.txt").unwrap();
        vfs.sync().unwrap();
        vfs.umount("/").unwrap();
    }

    let (vfs, _cache) = mount_on(&device, 128);
    assert_eq!(common::read_file(&vfs, "/keep.txt"), b"keep");
    assert!(vfs.stat("/drop.txt").is_err());
}

#[test]
fn mkfs_produces_an_empty_root() {
    let device = mem_device_named("persist2", 16 * MIB);
    Ext4Fs::mkfs(&device, "").unwrap();

    let (vfs, _cache) = mount_on(&device, 64);
    let entries = vfs.lookup("/").unwrap().inode().readdir().unwrap();
    let names: Vec<String> = entries.into_iter().map(|e| e.name).collect();
    assert_eq!(names.len(), 2, "only . and ..");
    assert!(names.contains(&".".to_owned()));
    assert!(names.contains(&"..".to_owned()));
}

#[test]
fn tiny_devices_are_rejected_by_mkfs() {
    let device = mem_device_named("persist3", 16 * 1024);
    assert!(Ext4Fs::mkfs(&device, "").is_err());
}
