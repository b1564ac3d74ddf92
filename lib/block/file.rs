//! Block device backed by a host file.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::block::bio::{Bio, BioData, BioExecutor, BioKind, BioQueue};
use crate::block::{BLOCK_SIZE, BlockDevice, SECTOR_SIZE, SectorId, clamp_range};
use crate::error::{FsError, FsResult};
use crate::sync::Arc;

/// Construction options for [`FileBlockDevice`].
#[derive(Debug, Clone)]
pub struct FileDeviceOptions {
    /// Sector size in bytes; a power of two.
    pub sector_size: u32,
    /// Block size in bytes; a power of two, >= the sector size.
    pub block_size: u32,
    /// Open the backing file read-only.
    pub readonly: bool,
    /// Major device number.
    pub major: u32,
    /// Minor device number.
    pub minor: u32,
}

impl Default for FileDeviceOptions {
    fn default() -> Self {
        Self {
            sector_size: SECTOR_SIZE,
            block_size: BLOCK_SIZE,
            readonly: false,
            major: 8,
            minor: 1,
        }
    }
}

struct FileInner {
    file: std::fs::File,
    name: String,
    size: u64,
    opts: FileDeviceOptions,
}

impl FileInner {
    fn do_read(&self, sector: SectorId, buf: &mut [u8]) -> FsResult<usize> {
        let (offset, n) = clamp_range(self.size, sector, self.opts.sector_size, buf.len())?;
        let mut done = 0;
        // read_at may return short; keep going until the clamped range is
        // filled or the file reports a real error.
        while done < n {
            match self.file.read_at(&mut buf[done..n], offset + done as u64) {
                Ok(0) => break,
                Ok(k) => done += k,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => return Err(FsError::Io),
            }
        }
        Ok(done)
    }

    fn do_write(&self, sector: SectorId, buf: &[u8]) -> FsResult<usize> {
        if self.opts.readonly {
            return Err(FsError::ReadOnly);
        }
        let (offset, n) = clamp_range(self.size, sector, self.opts.sector_size, buf.len())?;
        let mut done = 0;
        while done < n {
            match self.file.write_at(&buf[done..n], offset + done as u64) {
                // A zero-byte write here would loop forever; treat it as the
                // backing store failing, not as a short count.
                Ok(0) => return Err(FsError::Io),
                Ok(k) => done += k,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => return Err(FsError::Io),
            }
        }
        Ok(n)
    }

    fn do_flush(&self) -> FsResult<()> {
        self.file.sync_all().map_err(|_| FsError::Io)
    }
}

impl BioExecutor for FileInner {
    fn execute(&self, bio: &mut Bio) -> FsResult<usize> {
        let sector = bio.sector;
        match (bio.kind, bio.data_mut()) {
            (BioKind::Read, BioData::Read(buf)) => self.do_read(sector, buf),
            (BioKind::Write, BioData::Write(payload)) => self.do_write(sector, &*payload),
            (BioKind::Flush, _) => self.do_flush().map(|()| 0),
            // The host file keeps its blocks; discard is a no-op.
            (BioKind::Discard, _) => Ok(0),
            _ => Err(FsError::InvalidArgument),
        }
    }
}

/// Block device over a host file. `flush` issues `fsync` on the file.
pub struct FileBlockDevice {
    inner: Arc<FileInner>,
    path: PathBuf,
    bio: BioQueue,
}

impl FileBlockDevice {
    /// Open `path` as a block device with default geometry.
    pub fn open(path: &Path, readonly: bool) -> FsResult<Self> {
        Self::with_options(
            path,
            FileDeviceOptions {
                readonly,
                ..FileDeviceOptions::default()
            },
        )
    }

    /// Open `path` with explicit geometry. The device size is the file size.
    pub fn with_options(path: &Path, opts: FileDeviceOptions) -> FsResult<Self> {
        if !opts.sector_size.is_power_of_two()
            || !opts.block_size.is_power_of_two()
            || opts.block_size < opts.sector_size
        {
            return Err(FsError::InvalidArgument);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(!opts.readonly)
            .open(path)?;
        let size = file.metadata()?.len();
        let name = path.to_string_lossy().into_owned();
        let inner = Arc::new(FileInner {
            file,
            name,
            size,
            opts,
        });
        let bio = BioQueue::spawn(&inner.name, Arc::clone(&inner));
        debug!(path = %path.display(), size, "file block device opened");
        Ok(Self {
            inner,
            path: path.to_owned(),
            bio,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileBlockDevice {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn major(&self) -> u32 {
        self.inner.opts.major
    }

    fn minor(&self) -> u32 {
        self.inner.opts.minor
    }

    fn size(&self) -> u64 {
        self.inner.size
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
        self.inner.do_flush()
    }

    fn trim(&self, _sector: SectorId, _len: u64) -> FsResult<()> {
        Ok(())
    }

    fn submit_bio(&self, bio: Bio) {
        self.bio.submit(bio);
    }
}
