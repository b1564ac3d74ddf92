//! Memory-backed block device, used by tests and ephemeral mounts.

use std::path::Path;

use tracing::debug;

use crate::block::bio::{Bio, BioData, BioExecutor, BioKind, BioQueue};
use crate::block::{BLOCK_SIZE, BlockDevice, SECTOR_SIZE, SectorId, clamp_range};
use crate::error::{FsError, FsResult};
use crate::sync::{Arc, Mutex};

/// Construction options for [`MemBlockDevice`].
#[derive(Debug, Clone)]
pub struct MemDeviceOptions {
    /// Device capacity in bytes.
    pub size: u64,
    /// Sector size in bytes; a power of two.
    pub sector_size: u32,
    /// Block size in bytes; a power of two, >= the sector size.
    pub block_size: u32,
    /// Reject writes with [`FsError::ReadOnly`].
    pub readonly: bool,
    /// Device name.
    pub name: String,
    /// Major device number.
    pub major: u32,
    /// Minor device number.
    pub minor: u32,
}

impl Default for MemDeviceOptions {
    fn default() -> Self {
        Self {
            size: 0,
            sector_size: SECTOR_SIZE,
            block_size: BLOCK_SIZE,
            readonly: false,
            name: "memblk".to_owned(),
            major: 8,
            minor: 0,
        }
    }
}

struct MemInner {
    data: Mutex<Vec<u8>>,
    opts: MemDeviceOptions,
}

impl MemInner {
    fn do_read(&self, sector: SectorId, buf: &mut [u8]) -> FsResult<usize> {
        let data = crate::sync::lock(&self.data);
        let (offset, n) = clamp_range(data.len() as u64, sector, self.opts.sector_size, buf.len())?;
        let offset = offset as usize;
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn do_write(&self, sector: SectorId, buf: &[u8]) -> FsResult<usize> {
        if self.opts.readonly {
            return Err(FsError::ReadOnly);
        }
        let mut data = crate::sync::lock(&self.data);
        let (offset, n) = clamp_range(data.len() as u64, sector, self.opts.sector_size, buf.len())?;
        let offset = offset as usize;
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn do_trim(&self, sector: SectorId, len: u64) -> FsResult<()> {
        if self.opts.readonly {
            return Err(FsError::ReadOnly);
        }
        let mut data = crate::sync::lock(&self.data);
        let (offset, n) = clamp_range(
            data.len() as u64,
            sector,
            self.opts.sector_size,
            usize::try_from(len).unwrap_or(usize::MAX),
        )?;
        let offset = offset as usize;
        data[offset..offset + n].fill(0);
        Ok(())
    }
}

impl BioExecutor for MemInner {
    fn execute(&self, bio: &mut Bio) -> FsResult<usize> {
        let (sector, len) = (bio.sector, bio.len);
        match (bio.kind, bio.data_mut()) {
            (BioKind::Read, BioData::Read(buf)) => self.do_read(sector, buf),
            (BioKind::Write, BioData::Write(payload)) => self.do_write(sector, &*payload),
            // Memory is always durable; a flush has nothing to do.
            (BioKind::Flush, _) => Ok(0),
            (BioKind::Discard, _) => self.do_trim(sector, len).map(|()| 0),
            _ => Err(FsError::InvalidArgument),
        }
    }
}

/// Block device over an in-memory buffer.
///
/// `flush` is a no-op and `trim` zero-fills the discarded range.
pub struct MemBlockDevice {
    inner: Arc<MemInner>,
    bio: BioQueue,
}

impl MemBlockDevice {
    /// A read-write device of `size` bytes with default geometry.
    #[must_use]
    pub fn new(size: u64) -> Self {
        // Default options are always valid geometry.
        #[allow(clippy::unwrap_used)]
        Self::with_options(MemDeviceOptions {
            size,
            ..MemDeviceOptions::default()
        })
        .unwrap()
    }

    /// A device with explicit geometry.
    pub fn with_options(opts: MemDeviceOptions) -> FsResult<Self> {
        if !opts.sector_size.is_power_of_two()
            || !opts.block_size.is_power_of_two()
            || opts.block_size < opts.sector_size
        {
            return Err(FsError::InvalidArgument);
        }
        let size = usize::try_from(opts.size).map_err(|_| FsError::InvalidArgument)?;
        let inner = Arc::new(MemInner {
            data: Mutex::new(vec![0; size]),
            opts,
        });
        let bio = BioQueue::spawn(&inner.opts.name, Arc::clone(&inner));
        debug!(name = %inner.opts.name, size, "memory block device created");
        Ok(Self { inner, bio })
    }

    /// Overwrite the device head with the contents of a host file.
    pub fn load_from(&self, path: &Path) -> FsResult<()> {
        let image = std::fs::read(path)?;
        let mut data = crate::sync::lock(&self.inner.data);
        let n = image.len().min(data.len());
        data[..n].copy_from_slice(&image[..n]);
        Ok(())
    }

    /// Snapshot the device contents into a host file.
    pub fn save_to(&self, path: &Path) -> FsResult<()> {
        let data = crate::sync::lock(&self.inner.data);
        std::fs::write(path, &*data)?;
        Ok(())
    }
}

impl BlockDevice for MemBlockDevice {
    fn name(&self) -> &str {
        &self.inner.opts.name
    }

    fn major(&self) -> u32 {
        self.inner.opts.major
    }

    fn minor(&self) -> u32 {
        self.inner.opts.minor
    }

    fn size(&self) -> u64 {
        self.inner.opts.size
    }

    fn sector_size(&self) -> u32 {
        self.inner.opts.sector_size
    }

    fn block_size(&self) -> u32 {
        self.inner.opts.block_size
    }

    fn readonly(&self) -> bool {
        self.inner.opts.readonly
    }

    fn read_at(&self, sector: SectorId, buf: &mut [u8]) -> FsResult<usize> {
        self.inner.do_read(sector, buf)
    }

    fn write_at(&self, sector: SectorId, buf: &[u8]) -> FsResult<usize> {
        self.inner.do_write(sector, buf)
    }

    fn flush(&self) -> FsResult<()> {
        Ok(())
    }

    fn trim(&self, sector: SectorId, len: u64) -> FsResult<()> {
        self.inner.do_trim(sector, len)
    }

    fn submit_bio(&self, bio: Bio) {
        self.bio.submit(bio);
    }
}
