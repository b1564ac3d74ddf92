//! The EXT4-shaped driver: mounts a formatted device and serves the full
//! driver interface over it.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::block::{BlockDevice, SectorId};
use crate::cache::{PAGE_SIZE, PageCache};
use crate::error::{FsError, FsResult};
use crate::ext4::alloc::Bitmap;
use crate::ext4::dir;
use crate::ext4::layout::{
    DIRECT_BLOCKS, EXT4_SUPER_MAGIC, FIRST_USER_INO, Geometry, INODE_SIZE, INODES_PER_BLOCK,
    PTRS_PER_INDIRECT, ROOT_INO, RawInode, RawSuperBlock, mode_of, read_u64, split_mode, write_u64,
};
use crate::sync::{Arc, Mutex, OnceLock, Weak};
use crate::vfs::{
    Attributes, Dentry, DirEntry, FileType, FilesystemType, FsStats, Inode, InodeNo, InodeOps,
    MountFlags, Permissions, SuperBlock, SuperBlockOps,
};

const MAX_NAME_LEN: usize = 255;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn secs_to_time(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn time_to_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// The filesystem type registered with the router under `ext4`.
pub struct Ext4FsType;

impl FilesystemType for Ext4FsType {
    fn name(&self) -> &'static str {
        "ext4"
    }

    fn mount(
        &self,
        device: Arc<dyn BlockDevice>,
        cache: Arc<PageCache>,
        flags: MountFlags,
        options: &str,
    ) -> FsResult<Arc<SuperBlock>> {
        Ext4Fs::mount(device, cache, flags, options)
    }

    fn umount(&self, sb: &Arc<SuperBlock>) -> FsResult<()> {
        sb.sync()
    }
}

/// Block pointers of one loaded inode.
#[derive(Debug, Clone, Copy)]
struct InodeMap {
    direct: [u64; DIRECT_BLOCKS],
    indirect: u64,
    blocks: u64,
}

impl InodeMap {
    fn from_raw(raw: &RawInode) -> Self {
        Self {
            direct: raw.direct,
            indirect: raw.indirect,
            blocks: raw.blocks,
        }
    }

    fn empty() -> Self {
        Self {
            direct: [0; DIRECT_BLOCKS],
            indirect: 0,
            blocks: 0,
        }
    }
}

struct DriverInner {
    raw: RawSuperBlock,
    inode_bitmap: Bitmap,
    block_bitmap: Bitmap,
    maps: FxHashMap<InodeNo, InodeMap>,
    xattrs: FxHashMap<InodeNo, BTreeMap<String, Vec<u8>>>,
}

/// Per-mount driver state. One value serves as the superblock-operations
/// table and as the inode-operations table of every inode it materializes.
pub struct Ext4Fs {
    device: Arc<dyn BlockDevice>,
    cache: Arc<PageCache>,
    geo: Geometry,
    sectors_per_block: u64,
    sb_id: OnceLock<u64>,
    inner: Mutex<DriverInner>,
    weak_self: Weak<Ext4Fs>,
}

impl Ext4Fs {
    /// Format `device` with a fresh filesystem: superblock, bitmaps, inode
    /// table, and an empty root directory.
    pub fn mkfs(device: &Arc<dyn BlockDevice>, _options: &str) -> FsResult<()> {
        if device.readonly() {
            return Err(FsError::ReadOnly);
        }
        let blocks_count = device.size() / PAGE_SIZE as u64;
        let geo = Geometry::compute(blocks_count);
        // Metadata plus the root directory block have to fit.
        if blocks_count <= geo.first_data_block {
            return Err(FsError::NoSpace);
        }
        let sectors_per_block = u64::from(PAGE_SIZE as u32 / device.sector_size());
        let write_block = |block: u64, data: &[u8]| -> FsResult<()> {
            let n = device.write_at(block * sectors_per_block, data)?;
            if n < data.len() {
                return Err(FsError::Io);
            }
            Ok(())
        };

        let root_dir_block = geo.first_data_block;
        let now = now_secs();

        let mut block_bitmap = Bitmap::new(usize::try_from(blocks_count).unwrap_or(usize::MAX));
        for b in 0..=root_dir_block {
            block_bitmap.set(usize::try_from(b).unwrap_or(usize::MAX));
        }

        let mut inode_bitmap = Bitmap::new(geo.inodes_count as usize);
        for idx in 0..(FIRST_USER_INO - 1) {
            inode_bitmap.set(usize::try_from(idx).unwrap_or(usize::MAX));
        }

        let raw = RawSuperBlock {
            magic: EXT4_SUPER_MAGIC,
            block_size_log: 2,
            blocks_count,
            inodes_count: geo.inodes_count,
            free_blocks: blocks_count - root_dir_block - 1,
            free_inodes: geo.inodes_count - u32::try_from(FIRST_USER_INO - 1).unwrap_or(10),
            first_data_block: geo.first_data_block,
            mkfs_time: now,
            write_time: now,
        };

        let mut block = vec![0u8; PAGE_SIZE];
        raw.encode(&mut block);
        write_block(0, &block)?;

        block.fill(0);
        block[..inode_bitmap.as_bytes().len()].copy_from_slice(inode_bitmap.as_bytes());
        write_block(geo.inode_bitmap_block, &block)?;

        let bb = block_bitmap.as_bytes();
        for i in 0..geo.block_bitmap_blocks as usize {
            block.fill(0);
            let start = i * PAGE_SIZE;
            let end = bb.len().min(start + PAGE_SIZE);
            if start < end {
                block[..end - start].copy_from_slice(&bb[start..end]);
            }
            write_block(geo.block_bitmap_start + i as u64, &block)?;
        }

        // A clean inode table, then the root directory record.
        block.fill(0);
        for i in 0..geo.inode_table_blocks as u64 {
            write_block(geo.inode_table_start + i, &block)?;
        }

        let mut root = RawInode::new(mode_of(FileType::Directory, Permissions::dir_default()), 2, now);
        root.size = PAGE_SIZE as u64;
        root.blocks = 1;
        root.direct[0] = root_dir_block;
        block.fill(0);
        root.encode(&mut block, inode_slot_offset(ROOT_INO));
        write_block(inode_table_block(&geo, ROOT_INO), &block)?;

        dir::init_block(&mut block);
        #[allow(clippy::cast_possible_truncation)]
        let root32 = ROOT_INO as u32;
        dir::insert(&mut block, root32, dir::FT_DIR, ".");
        dir::insert(&mut block, root32, dir::FT_DIR, "..");
        write_block(root_dir_block, &block)?;

        device.flush()?;
        info!(device = device.name(), blocks = blocks_count, inodes = geo.inodes_count, "mkfs complete");
        Ok(())
    }

    /// Mount a formatted device: validate the magic, load the bitmaps, and
    /// build the superblock with its root dentry.
    pub fn mount(
        device: Arc<dyn BlockDevice>,
        cache: Arc<PageCache>,
        flags: MountFlags,
        _options: &str,
    ) -> FsResult<Arc<SuperBlock>> {
        let sectors_per_block = u64::from(PAGE_SIZE as u32 / device.sector_size());
        let read_block = |block: u64| -> FsResult<Vec<u8>> {
            let mut buf = vec![0u8; PAGE_SIZE];
            device.read_at(block * sectors_per_block, &mut buf)?;
            Ok(buf)
        };

        let raw = RawSuperBlock::decode(&read_block(0)?)?;
        let geo = raw.geometry();

        let inode_bitmap = Bitmap::from_bytes(
            read_block(geo.inode_bitmap_block)?[..(geo.inodes_count as usize).div_ceil(8)].to_vec(),
            geo.inodes_count as usize,
        );
        let mut bb_bytes = Vec::with_capacity(geo.block_bitmap_blocks as usize * PAGE_SIZE);
        for i in 0..u64::from(geo.block_bitmap_blocks) {
            bb_bytes.extend_from_slice(&read_block(geo.block_bitmap_start + i)?);
        }
        bb_bytes.truncate(usize::try_from(geo.blocks_count.div_ceil(8)).unwrap_or(usize::MAX));
        let block_bitmap =
            Bitmap::from_bytes(bb_bytes, usize::try_from(geo.blocks_count).unwrap_or(usize::MAX));

        let fs = Arc::new_cyclic(|weak_self| Ext4Fs {
            device: Arc::clone(&device),
            cache: Arc::clone(&cache),
            geo,
            sectors_per_block,
            sb_id: OnceLock::new(),
            inner: Mutex::new(DriverInner {
                raw,
                inode_bitmap,
                block_bitmap,
                maps: FxHashMap::default(),
                xattrs: FxHashMap::default(),
            }),
            weak_self: weak_self.clone(),
        });

        let sb = SuperBlock::new(device, cache, flags);
        let _ = fs.sb_id.set(sb.id());
        sb.set_ops(Arc::clone(&fs) as Arc<dyn SuperBlockOps>);
        let root = sb.get_inode(ROOT_INO)?;
        sb.set_root(Dentry::new_root(root));
        info!(device = sb.device_name(), "ext4 mounted");
        Ok(sb)
    }

    fn ops_arc(&self) -> FsResult<Arc<dyn InodeOps>> {
        self.weak_self
            .upgrade()
            .map(|fs| fs as Arc<dyn InodeOps>)
            .ok_or(FsError::Io)
    }

    fn block_sector(&self, block: u64) -> SectorId {
        block * self.sectors_per_block
    }

    fn read_block(&self, block: u64) -> FsResult<Vec<u8>> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.device.read_at(self.block_sector(block), &mut buf)?;
        Ok(buf)
    }

    fn write_block(&self, block: u64, data: &[u8]) -> FsResult<()> {
        let n = self.device.write_at(self.block_sector(block), data)?;
        if n < data.len() {
            return Err(FsError::Io);
        }
        Ok(())
    }

    fn check_ino(&self, ino: InodeNo) -> FsResult<()> {
        if ino == 0 || ino > u64::from(self.geo.inodes_count) {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }

    fn read_raw_inode(&self, ino: InodeNo) -> FsResult<RawInode> {
        self.check_ino(ino)?;
        let block = self.read_block(inode_table_block(&self.geo, ino))?;
        Ok(RawInode::decode(&block, inode_slot_offset(ino)))
    }

    fn write_raw_inode(&self, ino: InodeNo, raw: &RawInode) -> FsResult<()> {
        self.check_ino(ino)?;
        let table_block = inode_table_block(&self.geo, ino);
        let mut block = self.read_block(table_block)?;
        raw.encode(&mut block, inode_slot_offset(ino));
        self.write_block(table_block, &block)
    }

    fn ensure_map_loaded(&self, inner: &mut DriverInner, ino: InodeNo) -> FsResult<()> {
        if !inner.maps.contains_key(&ino) {
            let raw = self.read_raw_inode(ino)?;
            inner.maps.insert(ino, InodeMap::from_raw(&raw));
        }
        Ok(())
    }

    fn map_of(inner: &DriverInner, ino: InodeNo) -> FsResult<InodeMap> {
        inner.maps.get(&ino).copied().ok_or(FsError::Io)
    }

    /// Write the current block pointers of `ino` back into its table record,
    /// leaving the other fields alone.
    fn persist_map(&self, inner: &DriverInner, ino: InodeNo) -> FsResult<()> {
        let map = Self::map_of(inner, ino)?;
        let mut raw = self.read_raw_inode(ino)?;
        raw.direct = map.direct;
        raw.indirect = map.indirect;
        raw.blocks = map.blocks;
        self.write_raw_inode(ino, &raw)
    }

    fn alloc_block(&self, inner: &mut DriverInner) -> FsResult<u64> {
        let idx = inner.block_bitmap.alloc().ok_or(FsError::NoSpace)?;
        inner.raw.free_blocks = inner.raw.free_blocks.saturating_sub(1);
        Ok(idx as u64)
    }

    fn free_block(&self, inner: &mut DriverInner, block: u64) {
        if block == 0 {
            return;
        }
        inner
            .block_bitmap
            .clear(usize::try_from(block).unwrap_or(usize::MAX));
        inner.raw.free_blocks += 1;
    }

    fn alloc_ino(&self, inner: &mut DriverInner) -> FsResult<InodeNo> {
        let idx = inner.inode_bitmap.alloc().ok_or(FsError::NoSpace)?;
        inner.raw.free_inodes = inner.raw.free_inodes.saturating_sub(1);
        Ok(idx as u64 + 1)
    }

    fn free_ino(&self, inner: &mut DriverInner, ino: InodeNo) {
        inner
            .inode_bitmap
            .clear(usize::try_from(ino - 1).unwrap_or(usize::MAX));
        inner.raw.free_inodes += 1;
        inner.maps.remove(&ino);
        inner.xattrs.remove(&ino);
    }

    /// Release every data block of `ino`, including the indirect block.
    fn free_inode_blocks(&self, inner: &mut DriverInner, ino: InodeNo) -> FsResult<()> {
        self.ensure_map_loaded(inner, ino)?;
        let map = Self::map_of(inner, ino)?;
        for block in map.direct {
            self.free_block(inner, block);
        }
        if map.indirect != 0 {
            let ib = self.read_block(map.indirect)?;
            for slot in 0..PTRS_PER_INDIRECT {
                self.free_block(inner, read_u64(&ib, slot * 8));
            }
            self.free_block(inner, map.indirect);
        }
        inner.maps.insert(ino, InodeMap::empty());
        Ok(())
    }

    /// The allocated content blocks of a directory, in file order.
    /// Directories only use direct pointers.
    fn dir_blocks(&self, inner: &mut DriverInner, dir: InodeNo) -> FsResult<Vec<u64>> {
        self.ensure_map_loaded(inner, dir)?;
        let map = Self::map_of(inner, dir)?;
        Ok(map.direct.iter().copied().filter(|&b| b != 0).collect())
    }

    fn find_dirent(
        &self,
        inner: &mut DriverInner,
        dir: InodeNo,
        name: &str,
    ) -> FsResult<(u32, u8)> {
        for block in self.dir_blocks(inner, dir)? {
            if let Some(found) = dir::find(&self.read_block(block)?, name) {
                return Ok(found);
            }
        }
        Err(FsError::NotFound)
    }

    fn add_dirent(
        &self,
        inner: &mut DriverInner,
        dir: InodeNo,
        dattrs: &mut Attributes,
        ino: u32,
        code: u8,
        name: &str,
    ) -> FsResult<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('/') {
            return Err(FsError::InvalidArgument);
        }
        for block in self.dir_blocks(inner, dir)? {
            let mut buf = self.read_block(block)?;
            if dir::insert(&mut buf, ino, code, name) {
                return self.write_block(block, &buf);
            }
        }

        // Every existing block is full; grow the directory by one block.
        let map = Self::map_of(inner, dir)?;
        let slot = map
            .direct
            .iter()
            .position(|&b| b == 0)
            .ok_or(FsError::NoSpace)?;
        let new_block = self.alloc_block(inner)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        dir::init_block(&mut buf);
        dir::insert(&mut buf, ino, code, name);
        self.write_block(new_block, &buf)?;

        let map = inner.maps.get_mut(&dir).ok_or(FsError::Io)?;
        map.direct[slot] = new_block;
        map.blocks += 1;
        dattrs.size += PAGE_SIZE as u64;
        dattrs.blocks = map.blocks;
        self.persist_map(inner, dir)
    }

    fn remove_dirent(&self, inner: &mut DriverInner, dir: InodeNo, name: &str) -> FsResult<()> {
        for block in self.dir_blocks(inner, dir)? {
            let mut buf = self.read_block(block)?;
            if dir::remove(&mut buf, name) {
                return self.write_block(block, &buf);
            }
        }
        Err(FsError::NotFound)
    }

    fn dir_is_empty(&self, inner: &mut DriverInner, dir: InodeNo) -> FsResult<bool> {
        for block in self.dir_blocks(inner, dir)? {
            if !dir::is_empty_block(&self.read_block(block)?) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Allocate a fresh inode record on disk. Returns its number.
    fn new_raw_inode(
        &self,
        inner: &mut DriverInner,
        ftype: FileType,
        perms: Permissions,
        links: u16,
    ) -> FsResult<InodeNo> {
        let ino = self.alloc_ino(inner)?;
        let raw = RawInode::new(mode_of(ftype, perms), links, now_secs());
        if let Err(e) = self.write_raw_inode(ino, &raw) {
            self.free_ino(inner, ino);
            return Err(e);
        }
        inner.maps.insert(ino, InodeMap::empty());
        Ok(ino)
    }

    /// Decrement the link count of `ino`, freeing the inode and its blocks
    /// when it reaches zero.
    fn drop_link(&self, inner: &mut DriverInner, ino: InodeNo) -> FsResult<()> {
        let mut raw = self.read_raw_inode(ino)?;
        raw.links = raw.links.saturating_sub(1);
        if raw.links > 0 {
            raw.ctime = now_secs();
            return self.write_raw_inode(ino, &raw);
        }

        self.free_inode_blocks(inner, ino)?;
        raw = RawInode::new(0, 0, now_secs());
        self.write_raw_inode(ino, &raw)?;
        self.free_ino(inner, ino);
        // Stale pages of the dead identity must not linger: a dirty one
        // would write into blocks that may already belong to someone else.
        if let Some(&sb_id) = self.sb_id.get() {
            self.cache.invalidate_ident(sb_id, ino);
        }
        debug!(ino, "inode freed");
        Ok(())
    }

    fn ino_allocated(&self, ino: InodeNo) -> bool {
        if ino == 0 {
            return false;
        }
        let inner = crate::sync::lock(&self.inner);
        inner
            .inode_bitmap
            .get(usize::try_from(ino - 1).unwrap_or(usize::MAX))
    }

    fn statfs_inner(&self) -> FsStats {
        let inner = crate::sync::lock(&self.inner);
        FsStats {
            block_size: PAGE_SIZE as u32,
            total_blocks: inner.raw.blocks_count,
            free_blocks: inner.raw.free_blocks,
            total_inodes: u64::from(inner.raw.inodes_count),
            free_inodes: u64::from(inner.raw.free_inodes),
            max_filename_length: MAX_NAME_LEN as u32,
        }
    }
}

fn inode_table_block(geo: &Geometry, ino: InodeNo) -> u64 {
    geo.inode_table_start + (ino - 1) / INODES_PER_BLOCK as u64
}

#[allow(clippy::cast_possible_truncation)]
fn inode_slot_offset(ino: InodeNo) -> usize {
    ((ino - 1) as usize % INODES_PER_BLOCK) * INODE_SIZE
}

fn attrs_from_raw(raw: &RawInode) -> FsResult<Attributes> {
    let (ftype, perms) = split_mode(raw.mode)?;
    Ok(Attributes {
        ftype,
        perms,
        uid: raw.uid,
        gid: raw.gid,
        size: raw.size,
        blocks: raw.blocks,
        nlink: u32::from(raw.links),
        blksize: PAGE_SIZE as u32,
        atime: secs_to_time(raw.atime),
        mtime: secs_to_time(raw.mtime),
        ctime: secs_to_time(raw.ctime),
    })
}

fn apply_attrs(raw: &mut RawInode, attrs: &Attributes) {
    raw.mode = mode_of(attrs.ftype, attrs.perms);
    raw.uid = attrs.uid;
    raw.gid = attrs.gid;
    raw.size = attrs.size;
    raw.atime = time_to_secs(attrs.atime);
    raw.mtime = time_to_secs(attrs.mtime);
    raw.ctime = time_to_secs(attrs.ctime);
    #[allow(clippy::cast_possible_truncation)]
    {
        raw.links = attrs.nlink.min(u32::from(u16::MAX)) as u16;
    }
}

impl SuperBlockOps for Ext4Fs {
    fn alloc_inode(
        &self,
        sb: &Arc<SuperBlock>,
        ftype: FileType,
        perms: Permissions,
    ) -> FsResult<Arc<Inode>> {
        let ino = {
            let mut inner = crate::sync::lock(&self.inner);
            self.new_raw_inode(&mut inner, ftype, perms, 1)?
        };
        let inode = Inode::new(ino, Arc::clone(sb), self.ops_arc()?, Attributes::new(ftype, perms));
        sb.cache_inode(&inode);
        Ok(inode)
    }

    fn free_inode(&self, ino: InodeNo) -> FsResult<()> {
        let mut inner = crate::sync::lock(&self.inner);
        self.free_inode_blocks(&mut inner, ino)?;
        self.free_ino(&mut inner, ino);
        Ok(())
    }

    fn read_inode(&self, sb: &Arc<SuperBlock>, ino: InodeNo) -> FsResult<Arc<Inode>> {
        self.check_ino(ino)?;
        {
            let mut inner = crate::sync::lock(&self.inner);
            if !inner
                .inode_bitmap
                .get(usize::try_from(ino - 1).unwrap_or(usize::MAX))
            {
                return Err(FsError::NotFound);
            }
            self.ensure_map_loaded(&mut inner, ino)?;
        }
        let raw = self.read_raw_inode(ino)?;
        let attrs = attrs_from_raw(&raw)?;
        Ok(Inode::new(ino, Arc::clone(sb), self.ops_arc()?, attrs))
    }

    fn write_inode(&self, ino: InodeNo, attrs: &Attributes) -> FsResult<()> {
        if !self.ino_allocated(ino) {
            // The record was freed while an in-memory reference lived on;
            // there is nothing left to persist into.
            return Ok(());
        }
        let mut raw = self.read_raw_inode(ino)?;
        apply_attrs(&mut raw, attrs);
        self.write_raw_inode(ino, &raw)
    }

    fn sync(&self) -> FsResult<()> {
        let mut inner = crate::sync::lock(&self.inner);
        inner.raw.write_time = now_secs();

        let mut block = vec![0u8; PAGE_SIZE];
        inner.raw.encode(&mut block);
        self.write_block(0, &block)?;

        block.fill(0);
        let ib = inner.inode_bitmap.as_bytes();
        block[..ib.len()].copy_from_slice(ib);
        self.write_block(self.geo.inode_bitmap_block, &block)?;

        let bb = inner.block_bitmap.as_bytes();
        for i in 0..self.geo.block_bitmap_blocks as usize {
            block.fill(0);
            let start = i * PAGE_SIZE;
            let end = bb.len().min(start + PAGE_SIZE);
            if start < end {
                block[..end - start].copy_from_slice(&bb[start..end]);
            }
            self.write_block(self.geo.block_bitmap_start + i as u64, &block)?;
        }

        self.device.flush()
    }

    fn remount(&self, flags: MountFlags) -> FsResult<()> {
        debug!(?flags, "remount");
        Ok(())
    }

    fn statfs(&self) -> FsResult<FsStats> {
        Ok(self.statfs_inner())
    }
}

impl InodeOps for Ext4Fs {
    fn lookup(&self, dir: InodeNo, name: &str) -> FsResult<InodeNo> {
        let mut inner = crate::sync::lock(&self.inner);
        let (ino, _) = self.find_dirent(&mut inner, dir, name)?;
        Ok(u64::from(ino))
    }

    fn create(
        &self,
        dir: InodeNo,
        dattrs: &mut Attributes,
        name: &str,
        ftype: FileType,
        perms: Permissions,
    ) -> FsResult<InodeNo> {
        if ftype == FileType::Directory {
            return Err(FsError::InvalidArgument);
        }
        let mut inner = crate::sync::lock(&self.inner);
        if self.find_dirent(&mut inner, dir, name).is_ok() {
            return Err(FsError::AlreadyExists);
        }
        let ino = self.new_raw_inode(&mut inner, ftype, perms, 1)?;
        #[allow(clippy::cast_possible_truncation)]
        let ino32 = ino as u32;
        if let Err(e) = self.add_dirent(&mut inner, dir, dattrs, ino32, dir::code_of(ftype), name) {
            self.free_ino(&mut inner, ino);
            return Err(e);
        }
        Ok(ino)
    }

    fn unlink(&self, dir: InodeNo, _dattrs: &mut Attributes, name: &str) -> FsResult<()> {
        let mut inner = crate::sync::lock(&self.inner);
        let (ino, code) = self.find_dirent(&mut inner, dir, name)?;
        if code == dir::FT_DIR {
            return Err(FsError::IsADirectory);
        }
        self.remove_dirent(&mut inner, dir, name)?;
        self.drop_link(&mut inner, u64::from(ino))
    }

    fn mkdir(
        &self,
        dir: InodeNo,
        dattrs: &mut Attributes,
        name: &str,
        perms: Permissions,
    ) -> FsResult<InodeNo> {
        let mut inner = crate::sync::lock(&self.inner);
        if self.find_dirent(&mut inner, dir, name).is_ok() {
            return Err(FsError::AlreadyExists);
        }

        let ino = self.new_raw_inode(&mut inner, FileType::Directory, perms, 2)?;
        #[allow(clippy::cast_possible_truncation)]
        let ino32 = ino as u32;
        #[allow(clippy::cast_possible_truncation)]
        let dir32 = dir as u32;

        let content = match self.alloc_block(&mut inner) {
            Ok(b) => b,
            Err(e) => {
                self.free_ino(&mut inner, ino);
                return Err(e);
            }
        };
        let mut buf = vec![0u8; PAGE_SIZE];
        dir::init_block(&mut buf);
        dir::insert(&mut buf, ino32, dir::FT_DIR, ".");
        dir::insert(&mut buf, dir32, dir::FT_DIR, "..");
        self.write_block(content, &buf)?;

        let mut raw = self.read_raw_inode(ino)?;
        raw.size = PAGE_SIZE as u64;
        raw.blocks = 1;
        raw.direct[0] = content;
        self.write_raw_inode(ino, &raw)?;
        inner.maps.insert(ino, InodeMap::from_raw(&raw));

        if let Err(e) = self.add_dirent(&mut inner, dir, dattrs, ino32, dir::FT_DIR, name) {
            self.free_block(&mut inner, content);
            self.free_ino(&mut inner, ino);
            return Err(e);
        }

        // The child's `..` adds a link to the parent.
        dattrs.nlink += 1;
        let mut parent_raw = self.read_raw_inode(dir)?;
        apply_attrs(&mut parent_raw, dattrs);
        self.write_raw_inode(dir, &parent_raw)?;
        Ok(ino)
    }

    fn rmdir(&self, dir: InodeNo, dattrs: &mut Attributes, name: &str) -> FsResult<()> {
        let mut inner = crate::sync::lock(&self.inner);
        let (ino, code) = self.find_dirent(&mut inner, dir, name)?;
        if code != dir::FT_DIR {
            return Err(FsError::NotADirectory);
        }
        let target = u64::from(ino);
        if !self.dir_is_empty(&mut inner, target)? {
            return Err(FsError::InvalidArgument);
        }
        self.remove_dirent(&mut inner, dir, name)?;
        self.free_inode_blocks(&mut inner, target)?;
        self.write_raw_inode(target, &RawInode::new(0, 0, now_secs()))?;
        self.free_ino(&mut inner, target);

        dattrs.nlink = dattrs.nlink.saturating_sub(1);
        let mut parent_raw = self.read_raw_inode(dir)?;
        apply_attrs(&mut parent_raw, dattrs);
        self.write_raw_inode(dir, &parent_raw)
    }

    fn rename(
        &self,
        old_dir: InodeNo,
        old_attrs: &mut Attributes,
        new_dir: InodeNo,
        mut new_attrs: Option<&mut Attributes>,
        old_name: &str,
        new_name: &str,
    ) -> FsResult<()> {
        let mut inner = crate::sync::lock(&self.inner);
        let (ino, code) = self.find_dirent(&mut inner, old_dir, old_name)?;
        let moving_dir = code == dir::FT_DIR;

        if old_dir == new_dir && old_name == new_name {
            return Ok(());
        }

        // A compatible existing target is replaced, as rename(2) does.
        if let Ok((target, tcode)) = self.find_dirent(&mut inner, new_dir, new_name) {
            let target_is_dir = tcode == dir::FT_DIR;
            if target_is_dir && !moving_dir {
                return Err(FsError::IsADirectory);
            }
            if !target_is_dir && moving_dir {
                return Err(FsError::NotADirectory);
            }
            let target = u64::from(target);
            if target_is_dir {
                if !self.dir_is_empty(&mut inner, target)? {
                    return Err(FsError::InvalidArgument);
                }
                self.remove_dirent(&mut inner, new_dir, new_name)?;
                self.free_inode_blocks(&mut inner, target)?;
                self.write_raw_inode(target, &RawInode::new(0, 0, now_secs()))?;
                self.free_ino(&mut inner, target);
                if let Some(na) = new_attrs.as_deref_mut() {
                    na.nlink = na.nlink.saturating_sub(1);
                } else {
                    old_attrs.nlink = old_attrs.nlink.saturating_sub(1);
                }
            } else {
                self.remove_dirent(&mut inner, new_dir, new_name)?;
                self.drop_link(&mut inner, target)?;
            }
        }

        self.remove_dirent(&mut inner, old_dir, old_name)?;
        let insert_result = match new_attrs.as_deref_mut() {
            Some(na) => self.add_dirent(&mut inner, new_dir, na, ino, code, new_name),
            None => self.add_dirent(&mut inner, new_dir, old_attrs, ino, code, new_name),
        };
        if let Err(e) = insert_result {
            // Put the old entry back so a failed rename leaves both
            // directories unchanged.
            let _ = self.add_dirent(&mut inner, old_dir, old_attrs, ino, code, old_name);
            return Err(e);
        }

        if moving_dir && old_dir != new_dir {
            // Repoint the child's `..` and move the parent link with it.
            let child = u64::from(ino);
            if let Some(&first) = self
                .dir_blocks(&mut inner, child)?
                .first()
            {
                let mut buf = self.read_block(first)?;
                if dir::remove(&mut buf, "..") {
                    #[allow(clippy::cast_possible_truncation)]
                    dir::insert(&mut buf, new_dir as u32, dir::FT_DIR, "..");
                    self.write_block(first, &buf)?;
                }
            }
            old_attrs.nlink = old_attrs.nlink.saturating_sub(1);
            if let Some(na) = new_attrs.as_deref_mut() {
                na.nlink += 1;
            }
        }

        let mut old_raw = self.read_raw_inode(old_dir)?;
        apply_attrs(&mut old_raw, old_attrs);
        self.write_raw_inode(old_dir, &old_raw)?;
        if let Some(na) = new_attrs {
            let mut new_raw = self.read_raw_inode(new_dir)?;
            apply_attrs(&mut new_raw, na);
            self.write_raw_inode(new_dir, &new_raw)?;
        }
        Ok(())
    }

    fn readdir(&self, dir: InodeNo) -> FsResult<Vec<DirEntry>> {
        let mut inner = crate::sync::lock(&self.inner);
        let mut out = Vec::new();
        for block in self.dir_blocks(&mut inner, dir)? {
            for raw in dir::entries(&self.read_block(block)?) {
                out.push(DirEntry {
                    ino: u64::from(raw.ino),
                    ftype: dir::type_of(raw.code)?,
                    name: raw.name,
                });
            }
        }
        Ok(out)
    }

    fn symlink(
        &self,
        dir: InodeNo,
        dattrs: &mut Attributes,
        name: &str,
        target: &str,
    ) -> FsResult<InodeNo> {
        if target.is_empty() || target.len() > PAGE_SIZE {
            return Err(FsError::InvalidArgument);
        }
        let mut inner = crate::sync::lock(&self.inner);
        if self.find_dirent(&mut inner, dir, name).is_ok() {
            return Err(FsError::AlreadyExists);
        }

        let link_perms = Permissions::OWNER_RWX | Permissions::GROUP_RWX | Permissions::OTHER_RWX;
        let ino = self.new_raw_inode(&mut inner, FileType::Symlink, link_perms, 1)?;
        let content = match self.alloc_block(&mut inner) {
            Ok(b) => b,
            Err(e) => {
                self.free_ino(&mut inner, ino);
                return Err(e);
            }
        };
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[..target.len()].copy_from_slice(target.as_bytes());
        self.write_block(content, &buf)?;

        let mut raw = self.read_raw_inode(ino)?;
        raw.size = target.len() as u64;
        raw.blocks = 1;
        raw.direct[0] = content;
        self.write_raw_inode(ino, &raw)?;
        inner.maps.insert(ino, InodeMap::from_raw(&raw));

        #[allow(clippy::cast_possible_truncation)]
        let ino32 = ino as u32;
        if let Err(e) = self.add_dirent(&mut inner, dir, dattrs, ino32, dir::FT_SYMLINK, name) {
            self.free_block(&mut inner, content);
            self.free_ino(&mut inner, ino);
            return Err(e);
        }
        Ok(ino)
    }

    fn readlink(&self, ino: InodeNo, size: u64) -> FsResult<String> {
        if size == 0 {
            return Ok(String::new());
        }
        let block = {
            let mut inner = crate::sync::lock(&self.inner);
            self.ensure_map_loaded(&mut inner, ino)?;
            Self::map_of(&inner, ino)?.direct[0]
        };
        if block == 0 {
            return Err(FsError::Io);
        }
        let buf = self.read_block(block)?;
        let len = usize::try_from(size).unwrap_or(PAGE_SIZE).min(PAGE_SIZE);
        String::from_utf8(buf[..len].to_vec()).map_err(|_| FsError::Io)
    }

    fn setattr(&self, ino: InodeNo, attrs: &Attributes) -> FsResult<()> {
        if !self.ino_allocated(ino) {
            return Ok(());
        }
        let mut raw = self.read_raw_inode(ino)?;
        apply_attrs(&mut raw, attrs);
        self.write_raw_inode(ino, &raw)
    }

    fn truncate(&self, ino: InodeNo, attrs: &mut Attributes, new_size: u64) -> FsResult<()> {
        let mut inner = crate::sync::lock(&self.inner);
        self.ensure_map_loaded(&mut inner, ino)?;
        let keep = usize::try_from(new_size.div_ceil(PAGE_SIZE as u64)).unwrap_or(usize::MAX);
        let map = Self::map_of(&inner, ino)?;

        let mut freed = 0u64;
        let mut direct = map.direct;
        for (i, slot) in direct.iter_mut().enumerate() {
            if i >= keep && *slot != 0 {
                self.free_block(&mut inner, *slot);
                *slot = 0;
                freed += 1;
            }
        }

        let mut indirect = map.indirect;
        if indirect != 0 {
            let mut ib = self.read_block(indirect)?;
            let mut live = 0u64;
            for slot in 0..PTRS_PER_INDIRECT {
                let ptr = read_u64(&ib, slot * 8);
                if ptr == 0 {
                    continue;
                }
                if DIRECT_BLOCKS + slot >= keep {
                    self.free_block(&mut inner, ptr);
                    write_u64(&mut ib, slot * 8, 0);
                    freed += 1;
                } else {
                    live += 1;
                }
            }
            if live == 0 {
                self.free_block(&mut inner, indirect);
                indirect = 0;
                freed += 1;
            } else {
                self.write_block(map.indirect, &ib)?;
            }
        }

        // Zero the tail of the last kept block so a later grow reads zeroes
        // instead of whatever the file held before the shrink.
        let tail = usize::try_from(new_size % PAGE_SIZE as u64).unwrap_or(0);
        if tail != 0 && keep >= 1 && keep <= DIRECT_BLOCKS {
            let last = direct[keep - 1];
            if last != 0 {
                let mut buf = self.read_block(last)?;
                buf[tail..].fill(0);
                self.write_block(last, &buf)?;
            }
        } else if tail != 0 && keep > DIRECT_BLOCKS && indirect != 0 {
            let ib = self.read_block(indirect)?;
            let last = read_u64(&ib, (keep - 1 - DIRECT_BLOCKS) * 8);
            if last != 0 {
                let mut buf = self.read_block(last)?;
                buf[tail..].fill(0);
                self.write_block(last, &buf)?;
            }
        }

        let entry = inner.maps.get_mut(&ino).ok_or(FsError::Io)?;
        entry.direct = direct;
        entry.indirect = indirect;
        entry.blocks = entry.blocks.saturating_sub(freed);
        attrs.blocks = entry.blocks;

        let map = *entry;
        let mut raw = self.read_raw_inode(ino)?;
        raw.direct = map.direct;
        raw.indirect = map.indirect;
        raw.blocks = map.blocks;
        raw.size = new_size;
        self.write_raw_inode(ino, &raw)
    }

    fn map_block(
        &self,
        ino: InodeNo,
        block_index: u64,
        create: bool,
    ) -> FsResult<Option<SectorId>> {
        let mut inner = crate::sync::lock(&self.inner);
        self.ensure_map_loaded(&mut inner, ino)?;
        let idx = usize::try_from(block_index).map_err(|_| FsError::InvalidArgument)?;

        if idx < DIRECT_BLOCKS {
            let cur = Self::map_of(&inner, ino)?.direct[idx];
            if cur != 0 {
                return Ok(Some(self.block_sector(cur)));
            }
            if !create {
                return Ok(None);
            }
            let nb = self.alloc_block(&mut inner)?;
            let entry = inner.maps.get_mut(&ino).ok_or(FsError::Io)?;
            entry.direct[idx] = nb;
            entry.blocks += 1;
            self.persist_map(&inner, ino)?;
            return Ok(Some(self.block_sector(nb)));
        }

        let slot = idx - DIRECT_BLOCKS;
        if slot >= PTRS_PER_INDIRECT {
            warn!(ino, block_index, "file exceeds the block mapping limit");
            return Err(FsError::NoSpace);
        }

        let mut indirect = Self::map_of(&inner, ino)?.indirect;
        if indirect == 0 {
            if !create {
                return Ok(None);
            }
            indirect = self.alloc_block(&mut inner)?;
            self.write_block(indirect, &[0u8; PAGE_SIZE])?;
            let entry = inner.maps.get_mut(&ino).ok_or(FsError::Io)?;
            entry.indirect = indirect;
            entry.blocks += 1;
        }

        let mut ib = self.read_block(indirect)?;
        let ptr = read_u64(&ib, slot * 8);
        if ptr != 0 {
            return Ok(Some(self.block_sector(ptr)));
        }
        if !create {
            return Ok(None);
        }
        let nb = self.alloc_block(&mut inner)?;
        write_u64(&mut ib, slot * 8, nb);
        self.write_block(indirect, &ib)?;
        let entry = inner.maps.get_mut(&ino).ok_or(FsError::Io)?;
        entry.blocks += 1;
        self.persist_map(&inner, ino)?;
        Ok(Some(self.block_sector(nb)))
    }

    fn allocated_blocks(&self, ino: InodeNo) -> FsResult<u64> {
        let mut inner = crate::sync::lock(&self.inner);
        self.ensure_map_loaded(&mut inner, ino)?;
        Ok(Self::map_of(&inner, ino)?.blocks)
    }

    fn getxattr(&self, ino: InodeNo, name: &str) -> FsResult<Vec<u8>> {
        let inner = crate::sync::lock(&self.inner);
        inner
            .xattrs
            .get(&ino)
            .and_then(|m| m.get(name))
            .cloned()
            .ok_or(FsError::NotFound)
    }

    fn setxattr(&self, ino: InodeNo, name: &str, value: &[u8]) -> FsResult<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidArgument);
        }
        let mut inner = crate::sync::lock(&self.inner);
        inner
            .xattrs
            .entry(ino)
            .or_default()
            .insert(name.to_owned(), value.to_vec());
        Ok(())
    }

    fn listxattr(&self, ino: InodeNo) -> FsResult<Vec<String>> {
        let inner = crate::sync::lock(&self.inner);
        Ok(inner
            .xattrs
            .get(&ino)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn removexattr(&self, ino: InodeNo, name: &str) -> FsResult<()> {
        let mut inner = crate::sync::lock(&self.inner);
        inner
            .xattrs
            .get_mut(&ino)
            .and_then(|m| m.remove(name))
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }
}
