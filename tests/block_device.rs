#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::io::Write as _;
use std::sync::Arc;

use common::{MIB, mem_device_sized};
use pagefs::FsError;
use pagefs::block::{BlockDevice, FileBlockDevice, MemBlockDevice, MemDeviceOptions};

#[test]
fn write_then_read_round_trips_at_sector_zero() {
    // 64 MiB memory device; 0xAB x 4096 at sector 0 reads back verbatim.
    let dev = mem_device_sized(64 * MIB);
    let pattern = vec![0xABu8; 4096];
    assert_eq!(dev.write_at(0, &pattern).unwrap(), 4096);

    let mut got = vec![0u8; 4096];
    assert_eq!(dev.read_at(0, &mut got).unwrap(), 4096);
    assert!(got.iter().all(|&b| b == 0xAB), "every byte must be 0xAB");
}

#[test]
fn round_trips_at_nonzero_sectors() {
    let dev = mem_device_sized(MIB);
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    dev.write_at(17, &payload).unwrap();

    let mut got = vec![0u8; 1024];
    dev.read_at(17, &mut got).unwrap();
    assert_eq!(got, payload);

    // Until another write or trim, the data stays put.
    let mut again = vec![0u8; 1024];
    dev.read_at(17, &mut again).unwrap();
    assert_eq!(again, payload);
}

#[test]
fn access_at_device_end_is_invalid() {
    let dev = mem_device_sized(MIB);
    let sectors = MIB / u64::from(dev.sector_size());
    let mut buf = [0u8; 512];
    assert_eq!(dev.read_at(sectors, &mut buf), Err(FsError::InvalidArgument));
    assert_eq!(
        dev.write_at(sectors + 5, &buf),
        Err(FsError::InvalidArgument)
    );
}

#[test]
fn access_running_past_end_is_clamped() {
    let dev = mem_device_sized(MIB);
    let last = MIB / u64::from(dev.sector_size()) - 1;
    let buf = [0x55u8; 2048];
    assert_eq!(dev.write_at(last, &buf).unwrap(), 512, "short count, not error");

    let mut got = [0u8; 2048];
    assert_eq!(dev.read_at(last, &mut got).unwrap(), 512);
    assert!(got[..512].iter().all(|&b| b == 0x55));
}

#[test]
fn readonly_device_rejects_every_mutation() {
    let dev = MemBlockDevice::with_options(MemDeviceOptions {
        size: MIB,
        readonly: true,
        ..MemDeviceOptions::default()
    })
    .unwrap();
    assert!(dev.readonly());
    assert_eq!(dev.write_at(0, &[1, 2, 3]), Err(FsError::ReadOnly));
    assert_eq!(dev.trim(0, 512), Err(FsError::ReadOnly));

    let mut buf = [0u8; 4];
    assert_eq!(dev.read_at(0, &mut buf).unwrap(), 4);
}

#[test]
fn trim_zero_fills_memory_devices() {
    let dev = mem_device_sized(MIB);
    dev.write_at(0, &[0xFFu8; 1024]).unwrap();
    dev.trim(0, 512).unwrap();

    let mut got = [0u8; 1024];
    dev.read_at(0, &mut got).unwrap();
    assert!(got[..512].iter().all(|&b| b == 0), "trimmed range is zeroed");
    assert!(got[512..].iter().all(|&b| b == 0xFF), "rest is untouched");
}

#[test]
fn rejects_bogus_geometry() {
    let bad = MemBlockDevice::with_options(MemDeviceOptions {
        size: MIB,
        sector_size: 300,
        ..MemDeviceOptions::default()
    });
    assert!(matches!(bad, Err(FsError::InvalidArgument)));

    // Block smaller than sector.
    let bad = MemBlockDevice::with_options(MemDeviceOptions {
        size: MIB,
        sector_size: 4096,
        block_size: 512,
        ..MemDeviceOptions::default()
    });
    assert!(matches!(bad, Err(FsError::InvalidArgument)));
}

#[test]
fn file_device_round_trips_and_flushes() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.as_file().set_len(MIB).unwrap();

    let dev = FileBlockDevice::open(tmp.path(), false).unwrap();
    assert_eq!(dev.size(), MIB);

    let payload = vec![0xC3u8; 4096];
    assert_eq!(dev.write_at(8, &payload).unwrap(), 4096);
    dev.flush().unwrap();

    let mut got = vec![0u8; 4096];
    assert_eq!(dev.read_at(8, &mut got).unwrap(), 4096);
    assert_eq!(got, payload);
}

#[test]
fn file_device_readonly_rejects_writes() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&vec![0u8; 8192]).unwrap();
    tmp.flush().unwrap();

    let dev = FileBlockDevice::open(tmp.path(), true).unwrap();
    assert_eq!(dev.write_at(0, &[1u8; 512]), Err(FsError::ReadOnly));
}

#[test]
fn memory_device_snapshots_to_host_files() {
    let dev = MemBlockDevice::new(MIB);
    dev.write_at(0, b"snapshot me").unwrap();

    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("disk.img");
    dev.save_to(&image).unwrap();

    let restored = MemBlockDevice::new(MIB);
    restored.load_from(&image).unwrap();
    let mut got = vec![0u8; 11];
    restored.read_at(0, &mut got).unwrap();
    assert_eq!(&got, b"snapshot me");
}

#[test]
fn device_identity_is_exposed() {
    let dev: Arc<dyn BlockDevice> = mem_device_sized(MIB);
    assert_eq!(dev.name(), "memblk");
    assert_eq!(dev.major(), 8);
    assert_eq!(dev.sector_size(), 512);
    assert_eq!(dev.block_size(), 4096);
}
