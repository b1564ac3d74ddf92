#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::sync::{Arc, Once};

use pagefs::block::{BlockDevice, MemBlockDevice, MemDeviceOptions};
use pagefs::cache::PageCache;
use pagefs::ext4::{Ext4Fs, Ext4FsType};
use pagefs::vfs::{MountFlags, OpenFlags, Permissions, Vfs};

pub const MIB: u64 = 1024 * 1024;

/// Opt-in tracing for debugging test runs: `RUST_LOG=pagefs=trace`.
pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A 64 MiB read-write memory device with default geometry.
pub fn mem_device() -> Arc<dyn BlockDevice> {
    mem_device_sized(64 * MIB)
}

pub fn mem_device_sized(size: u64) -> Arc<dyn BlockDevice> {
    Arc::new(MemBlockDevice::new(size))
}

pub fn mem_device_named(name: &str, size: u64) -> Arc<dyn BlockDevice> {
    let dev = MemBlockDevice::with_options(MemDeviceOptions {
        size,
        name: name.to_owned(),
        ..MemDeviceOptions::default()
    })
    .unwrap();
    Arc::new(dev)
}

/// A formatted and mounted single-device stack over a private page cache.
pub struct TestFs {
    pub vfs: Vfs,
    pub cache: Arc<PageCache>,
    pub device: Arc<dyn BlockDevice>,
}

pub fn mount_fresh() -> TestFs {
    mount_fresh_with_cache(1024)
}

pub fn mount_fresh_with_cache(max_pages: usize) -> TestFs {
    init_tracing();
    let device = mem_device();
    Ext4Fs::mkfs(&device, "").unwrap();

    let cache = PageCache::new(max_pages);
    let vfs = Vfs::with_cache(Arc::clone(&cache));
    vfs.register_filesystem(Arc::new(Ext4FsType)).unwrap();
    vfs.register_device(Arc::clone(&device)).unwrap();
    vfs.mount("memblk", "/", "ext4", MountFlags::empty(), "")
        .unwrap();
    TestFs { vfs, cache, device }
}

/// Create a file with the given contents and return its size.
pub fn write_file(vfs: &Vfs, path: &str, contents: &[u8]) -> u64 {
    let file = vfs
        .open(
            path,
            OpenFlags::CREAT | OpenFlags::WRONLY,
            Permissions::file_default(),
        )
        .unwrap();
    let written = file.write(contents).unwrap();
    assert_eq!(written, contents.len(), "short write creating {path}");
    contents.len() as u64
}

/// Read a whole file back through a fresh read-only handle.
pub fn read_file(vfs: &Vfs, path: &str) -> Vec<u8> {
    let file = vfs
        .open(path, OpenFlags::RDONLY, Permissions::file_default())
        .unwrap();
    let size = file.stat().size;
    let mut buf = vec![0u8; usize::try_from(size).unwrap()];
    let read = file.read(&mut buf).unwrap();
    buf.truncate(read);
    buf
}
