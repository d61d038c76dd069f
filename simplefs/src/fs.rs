use std::cmp::min;

use fileblock::{BlockStorage, SECTOR_SIZE};
use log::{debug, info, warn};
use thiserror::Error;

use crate::alloc::{bit_position, Bitmap, State};
use crate::cache::{BlockCache, BlockNo, DiskAddr};
use crate::node::{
    blocks_for, FileRef, FileType, Inode, Stat, MAX_FILE_BLOCKS, MAX_FILE_SIZE, MAX_NAME_LEN,
    NODES_PER_BLOCK, NODE_SIZE, N_DIRECT,
};
use crate::sb::{SuperBlock, ROOT_OFFSET};

pub const SB_MAGIC: u32 = 0x4A05_30AE;

pub const BLOCK_SIZE: usize = 4096;
pub const BLOCK_SECTORS: usize = BLOCK_SIZE / SECTOR_SIZE;
/// Blocks tracked by one bitmap block.
pub const BLOCK_BITS: u32 = (BLOCK_SIZE * 8) as u32;
/// Maximum path length including the terminating NUL.
pub const MAX_PATH_LEN: usize = 1024;
/// The cache window is 3 GiB, which bounds the volume size.
pub const MAX_VOLUME_BLOCKS: u32 = (0xC000_0000u64 / BLOCK_SIZE as u64) as u32;

/// Known locations.
pub const SUPERBLOCK_INDEX: BlockNo = 1;
pub const BITMAP_START: BlockNo = 2;

#[derive(Error, Debug)]
pub enum SFSError {
    #[error("found no file at path")]
    DoesNotExist,
    #[error("file already exists")]
    FileExists,
    #[error("bad path: {0}")]
    BadPath(String),
    #[error("no free blocks left on disk")]
    NoSpace,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("file is open elsewhere")]
    Busy,
    #[error("too many open files")]
    MaxOpen,
    #[error("device failure")]
    Device(#[from] std::io::Error),
    #[error("corrupt volume: {0}")]
    Corrupt(String),
}

impl SFSError {
    /// Errors the server cannot recover from. There is no journal or redundancy
    /// to fall back on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SFSError::Device(_) | SFSError::Corrupt(_))
    }
}

/// Result of walking a path.
#[derive(Debug)]
pub enum NodeStatus {
    /// The entity requested exists. `dir` is the directory holding it, `None`
    /// for the root.
    Found { dir: Option<FileRef>, file: FileRef },
    /// The parent handle if traversal finds parent directory but not terminal entity.
    NotFound { dir: FileRef, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub total_blocks: u32,
    pub used_blocks: u32,
}

/// A mounted volume.
///
/// # Layout
/// =====================================================================
/// | Reserved | SuperBlock (+ root record) | Bitmap ... | Data Region |
/// =====================================================================
///
/// Files and directories are fixed 256 byte records stored inline in their
/// parent directory's data blocks. A record addresses its data with ten direct
/// block numbers and one indirect block of further block numbers.
pub struct SFS<T: BlockStorage> {
    cache: BlockCache<T>,
    bitmap: Bitmap,
    nblocks: u32,
}

impl<T: BlockStorage> SFS<T> {
    /// Initializes an empty file system of `nblocks` blocks onto owned block
    /// storage and returns it mounted.
    pub fn format(dev: T, nblocks: u32) -> Result<Self, SFSError> {
        let bitmap = Bitmap::new(nblocks);
        if nblocks > MAX_VOLUME_BLOCKS || nblocks <= bitmap.first_data_block() {
            return Err(SFSError::InvalidArgument(format!(
                "cannot format a volume of {} blocks",
                nblocks
            )));
        }
        if !fits_device(&dev, nblocks) {
            return Err(SFSError::InvalidArgument(format!(
                "device too small for {} blocks",
                nblocks
            )));
        }

        let mut cache = BlockCache::new(dev);
        cache.set_block_count(nblocks);
        cache.install_zeroed(SUPERBLOCK_INDEX);
        let sb_addr = cache.addr_of(SUPERBLOCK_INDEX);
        cache.write(sb_addr, &SuperBlock::new(nblocks))?;
        bitmap.format(&mut cache)?;
        cache.flush_all()?;
        cache.sync_device()?;
        cache.enable_free_check();

        info!(
            "formatted volume of {} blocks, {} bitmap block(s)",
            nblocks,
            bitmap.blocks()
        );
        Ok(SFS {
            cache,
            bitmap,
            nblocks,
        })
    }

    /// Mounts a formatted volume, validating the super block and the bitmap.
    pub fn open(dev: T) -> Result<Self, SFSError> {
        let mut cache = BlockCache::new(dev);
        let sb_addr = cache.addr_of(SUPERBLOCK_INDEX);
        let super_block: SuperBlock = cache.read(sb_addr)?;

        if !super_block.is_valid() {
            return Err(SFSError::Corrupt("bad file system magic number".to_string()));
        }
        let nblocks = super_block.block_count();
        if nblocks > MAX_VOLUME_BLOCKS || !fits_device(cache.device(), nblocks) {
            return Err(SFSError::Corrupt(format!("file system is too large: {} blocks", nblocks)));
        }
        let bitmap = Bitmap::new(nblocks);
        if nblocks <= bitmap.first_data_block() {
            return Err(SFSError::Corrupt(format!("file system is too small: {} blocks", nblocks)));
        }

        cache.set_block_count(nblocks);
        cache.enable_free_check();
        bitmap.check(&mut cache)?;

        info!("mounted volume of {} blocks", nblocks);
        Ok(SFS {
            cache,
            bitmap,
            nblocks,
        })
    }

    pub fn root(&self) -> FileRef {
        FileRef::at(self.cache.addr_of(SUPERBLOCK_INDEX) + ROOT_OFFSET)
    }

    pub fn block_count(&self) -> u32 {
        self.nblocks
    }

    pub fn cache(&self) -> &BlockCache<T> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut BlockCache<T> {
        &mut self.cache
    }

    pub fn into_device(self) -> T {
        self.cache.into_device()
    }

    pub fn node(&mut self, f: FileRef) -> Result<Inode, SFSError> {
        self.cache.read(f.addr())
    }

    fn put_node(&mut self, f: FileRef, node: &Inode) -> Result<(), SFSError> {
        self.cache.write(f.addr(), node)
    }

    // --------------------------------------------------------------
    // Free block bitmap
    // --------------------------------------------------------------

    /// Blocks out of range are never free.
    pub fn block_is_free(&mut self, bno: BlockNo) -> Result<bool, SFSError> {
        Ok(self.bitmap.get(&mut self.cache, bno)? == State::Free)
    }

    /// Finds the first free block, marks it used and immediately flushes the
    /// changed bitmap block.
    pub fn alloc_block(&mut self) -> Result<BlockNo, SFSError> {
        let bno = self
            .bitmap
            .first_free(&mut self.cache)?
            .ok_or(SFSError::NoSpace)?;
        self.bitmap.set(&mut self.cache, bno, State::Used)?;
        self.flush_bitmap(bno)?;
        debug!("allocated block {}", bno);
        Ok(bno)
    }

    /// Marks a block free, flushes the bitmap and drops any cached copy.
    ///
    /// # Panics
    ///
    /// Block 0 is the null pointer of block numbers and is never freed.
    pub fn free_block(&mut self, bno: BlockNo) -> Result<(), SFSError> {
        if bno == 0 {
            panic!("attempt to free zero block");
        }
        if bno >= self.nblocks || self.bitmap.is_reserved(bno) {
            return Err(SFSError::InvalidArgument(format!("cannot free block {}", bno)));
        }
        self.bitmap.set(&mut self.cache, bno, State::Free)?;
        self.flush_bitmap(bno)?;
        self.cache.discard(bno);
        debug!("freed block {}", bno);
        Ok(())
    }

    fn flush_bitmap(&mut self, bno: BlockNo) -> Result<(), SFSError> {
        let (holder, _, _) = bit_position(bno);
        let addr = self.cache.addr_of(holder);
        self.cache.flush(addr)
    }

    // --------------------------------------------------------------
    // File block index
    // --------------------------------------------------------------

    /// Finds the slot holding the disk block number of the `filebno`th block of
    /// `f`: one of the record's direct entries, or an entry in the indirect block.
    /// When `alloc` is set a missing indirect block is allocated and zeroed.
    ///
    /// The slot itself may hold 0.
    ///
    /// # Errors
    ///
    /// `DoesNotExist` if the indirect block is needed but missing and `alloc` is
    /// false, `NoSpace` if it cannot be allocated, `InvalidArgument` if `filebno`
    /// is beyond what a record can address.
    pub fn block_walk(&mut self, f: FileRef, filebno: u32, alloc: bool) -> Result<DiskAddr, SFSError> {
        let filebno = filebno as usize;
        if filebno >= MAX_FILE_BLOCKS {
            return Err(SFSError::InvalidArgument(format!(
                "file block {} out of range",
                filebno
            )));
        }
        if filebno < N_DIRECT {
            return Ok(f.direct_slot(filebno));
        }

        let mut node = self.node(f)?;
        let indirect = match node.indirect() {
            0 if !alloc => return Err(SFSError::DoesNotExist),
            0 => {
                let bno = self.alloc_block()?;
                self.cache.install_zeroed(bno);
                node.set_indirect(bno);
                self.put_node(f, &node)?;
                bno
            }
            bno => bno,
        };
        Ok(self.cache.addr_of(indirect) + 4 * (filebno - N_DIRECT))
    }

    /// Returns the disk block backing the `filebno`th block of `f`, allocating
    /// a zeroed block if there is none yet.
    pub fn get_block(&mut self, f: FileRef, filebno: u32) -> Result<BlockNo, SFSError> {
        let slot = self.block_walk(f, filebno, true)?;
        match self.cache.read_u32(slot)? {
            0 => {
                let bno = self.alloc_block()?;
                self.cache.write_u32(slot, bno)?;
                self.cache.install_zeroed(bno);
                Ok(bno)
            }
            bno => Ok(bno),
        }
    }

    /// Like `get_block` but never allocates. Holes yield `None`.
    fn lookup_block(&mut self, f: FileRef, filebno: u32) -> Result<Option<BlockNo>, SFSError> {
        match self.block_walk(f, filebno, false) {
            Ok(slot) => Ok(Some(self.cache.read_u32(slot)?).filter(|&bno| bno != 0)),
            Err(SFSError::DoesNotExist) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // --------------------------------------------------------------
    // Directories and paths
    // --------------------------------------------------------------

    /// Every record slot of a directory, used or not.
    fn dir_slots(&mut self, dir: FileRef) -> Result<Vec<FileRef>, SFSError> {
        let node = self.node(dir)?;
        if !node.is_dir() {
            return Err(SFSError::InvalidArgument(format!("{} is not a directory", node.name())));
        }
        // The size of a directory is always a multiple of the block size.
        if node.size() % BLOCK_SIZE as i64 != 0 {
            return Err(SFSError::Corrupt(format!(
                "directory {} has unaligned size {}",
                node.name(),
                node.size()
            )));
        }

        let nblock = node.block_count();
        let mut slots = Vec::with_capacity(nblock as usize * NODES_PER_BLOCK);
        for i in 0..nblock {
            let bno = self.get_block(dir, i)?;
            let base = self.cache.addr_of(bno);
            slots.extend((0..NODES_PER_BLOCK).map(|j| FileRef::at(base + j * NODE_SIZE)));
        }
        Ok(slots)
    }

    fn dir_lookup(&mut self, dir: FileRef, name: &[u8]) -> Result<Option<FileRef>, SFSError> {
        for slot in self.dir_slots(dir)? {
            if self.node(slot)?.name_bytes() == name {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Returns a free record slot in `dir`, growing the directory by one block
    /// when every slot is taken. The caller fills in the record.
    fn dir_alloc_file(&mut self, dir: FileRef) -> Result<FileRef, SFSError> {
        for slot in self.dir_slots(dir)? {
            if self.node(slot)?.is_free_slot() {
                return Ok(slot);
            }
        }

        let nblock = self.node(dir)?.block_count();
        // Materialize first so a full disk leaves the directory size untouched.
        let bno = self.get_block(dir, nblock)?;
        let mut node = self.node(dir)?;
        node.set_size(node.size() + BLOCK_SIZE as i64);
        self.put_node(dir, &node)?;
        Ok(FileRef::at(self.cache.addr_of(bno)))
    }

    /// Live records of a directory, in slot order.
    pub fn dir_files(&mut self, dir: FileRef) -> Result<Vec<FileRef>, SFSError> {
        let mut files = Vec::new();
        for slot in self.dir_slots(dir)? {
            if !self.node(slot)?.is_free_slot() {
                files.push(slot);
            }
        }
        Ok(files)
    }

    /// Calls `handler` for every live record in `dir`. The listing is taken up
    /// front, so the handler may mutate the directory.
    pub fn for_each_file<F>(&mut self, dir: FileRef, mut handler: F) -> Result<(), SFSError>
    where
        F: FnMut(&mut Self, FileRef) -> Result<(), SFSError>,
    {
        for f in self.dir_files(dir)? {
            handler(self, f)?;
        }
        Ok(())
    }

    /// Evaluates an absolute path starting at the root. Repeated slashes are
    /// ignored. If only the final component is missing, the directory it would
    /// live in is returned along with the missing name.
    pub fn walk_path(&mut self, path: &str) -> Result<NodeStatus, SFSError> {
        if !path.starts_with('/') {
            return Err(SFSError::BadPath(format!("{} is not absolute", path)));
        }
        if path.len() >= MAX_PATH_LEN {
            return Err(SFSError::BadPath("path too long".to_string()));
        }

        let mut parts = path.split('/').filter(|part| !part.is_empty()).peekable();
        let mut dir = None;
        let mut file = self.root();
        while let Some(name) = parts.next() {
            if name.len() >= MAX_NAME_LEN {
                return Err(SFSError::BadPath(format!("name too long: {}", name)));
            }
            if !self.node(file)?.is_dir() {
                return Err(SFSError::DoesNotExist);
            }

            dir = Some(file);
            match self.dir_lookup(file, name.as_bytes())? {
                Some(found) => file = found,
                None if parts.peek().is_none() => {
                    return Ok(NodeStatus::NotFound {
                        dir: file,
                        name: name.to_string(),
                    })
                }
                None => return Err(SFSError::DoesNotExist),
            }
        }
        Ok(NodeStatus::Found { dir, file })
    }

    // --------------------------------------------------------------
    // File operations
    // --------------------------------------------------------------

    /// Creates `path` inside its existing parent directory.
    pub fn create_file(&mut self, path: &str, ftype: FileType) -> Result<FileRef, SFSError> {
        let (dir, name) = match self.walk_path(path)? {
            NodeStatus::Found { .. } => return Err(SFSError::FileExists),
            NodeStatus::NotFound { dir, name } => (dir, name),
        };

        let f = self.dir_alloc_file(dir)?;
        self.put_node(f, &Inode::new(&name, ftype))?;
        self.flush_file(dir)?;
        debug!("created {} ({:?})", path, ftype);
        Ok(f)
    }

    pub fn open_file(&mut self, path: &str) -> Result<FileRef, SFSError> {
        match self.walk_path(path)? {
            NodeStatus::Found { file, .. } => Ok(file),
            NodeStatus::NotFound { .. } => Err(SFSError::DoesNotExist),
        }
    }

    pub fn stat(&mut self, f: FileRef) -> Result<Stat, SFSError> {
        let node = self.node(f)?;
        Ok(Stat {
            name: node.name(),
            size: node.size(),
            is_dir: node.is_dir(),
        })
    }

    /// Reads up to `buf.len()` bytes at `offset`, clipped to the file size.
    /// Holes read back as zeroes. Returns the number of bytes read.
    pub fn read(&mut self, f: FileRef, buf: &mut [u8], offset: i64) -> Result<usize, SFSError> {
        if offset < 0 {
            return Err(SFSError::InvalidArgument(format!("negative offset {}", offset)));
        }
        let size = self.node(f)?.size();
        if offset >= size {
            return Ok(0);
        }

        let count = min(buf.len() as i64, size - offset) as usize;
        let mut pos = offset as usize;
        let mut done = 0;
        while done < count {
            let within = pos % BLOCK_SIZE;
            let n = min(BLOCK_SIZE - within, count - done);
            let dst = &mut buf[done..done + n];
            match self.lookup_block(f, (pos / BLOCK_SIZE) as u32)? {
                Some(bno) => {
                    let addr = self.cache.addr_of(bno) + within;
                    self.cache.read_bytes(addr, dst)?;
                }
                None => dst.fill(0),
            }
            pos += n;
            done += n;
        }
        Ok(count)
    }

    /// Writes `buf` at `offset`, extending the file first when the write ends
    /// past the current size. Returns the number of bytes written.
    pub fn write(&mut self, f: FileRef, buf: &[u8], offset: i64) -> Result<usize, SFSError> {
        let end = offset.checked_add(buf.len() as i64);
        match end {
            Some(end) if offset >= 0 && end <= MAX_FILE_SIZE => {
                if end > self.node(f)?.size() {
                    self.set_size(f, end)?;
                }
            }
            _ => {
                return Err(SFSError::InvalidArgument(format!(
                    "write of {} bytes at {} out of range",
                    buf.len(),
                    offset
                )))
            }
        }

        let mut pos = offset as usize;
        let mut src = buf;
        while !src.is_empty() {
            let within = pos % BLOCK_SIZE;
            let n = min(BLOCK_SIZE - within, src.len());
            let bno = self.get_block(f, (pos / BLOCK_SIZE) as u32)?;
            let addr = self.cache.addr_of(bno) + within;
            self.cache.write_bytes(addr, &src[..n])?;
            pos += n;
            src = &src[n..];
        }
        Ok(buf.len())
    }

    /// Sets the size of `f`, truncating or extending as necessary. Growing never
    /// allocates; blocks appear when they are first written. The record is
    /// flushed either way.
    pub fn set_size(&mut self, f: FileRef, new_size: i64) -> Result<(), SFSError> {
        if !(0..=MAX_FILE_SIZE).contains(&new_size) {
            return Err(SFSError::InvalidArgument(format!("bad file size {}", new_size)));
        }
        let old_size = self.node(f)?.size();
        if old_size > new_size {
            self.truncate_blocks(f, old_size, new_size)?;
        }

        let mut node = self.node(f)?;
        node.set_size(new_size);
        self.put_node(f, &node)?;
        self.cache.flush(f.addr())
    }

    /// Removes a block from `f`. If it's not there, just silently succeed.
    fn free_file_block(&mut self, f: FileRef, filebno: u32) -> Result<(), SFSError> {
        let slot = self.block_walk(f, filebno, false)?;
        let bno = self.cache.read_u32(slot)?;
        if bno != 0 {
            self.cache.write_u32(slot, 0)?;
            self.free_block(bno)?;
        }
        Ok(())
    }

    /// Releases the blocks used by a file of `old_size` but not needed for one
    /// of `new_size`, and the indirect block once only direct blocks remain.
    /// The kept last block is zeroed past `new_size` so later growth reads
    /// zeroes. Does not change the recorded size.
    fn truncate_blocks(&mut self, f: FileRef, old_size: i64, new_size: i64) -> Result<(), SFSError> {
        let old_nblocks = blocks_for(old_size);
        let new_nblocks = blocks_for(new_size);

        let within = new_size as usize % BLOCK_SIZE;
        if within != 0 {
            if let Some(bno) = self.lookup_block(f, (new_size as usize / BLOCK_SIZE) as u32)? {
                let addr = self.cache.addr_of(bno) + within;
                self.cache.fill(addr, BLOCK_SIZE - within, 0)?;
            }
        }

        for filebno in new_nblocks..old_nblocks {
            if let Err(e) = self.free_file_block(f, filebno) {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("free_file_block {}: {}", filebno, e);
            }
        }

        let mut node = self.node(f)?;
        let indirect = node.indirect();
        if new_nblocks as usize <= N_DIRECT && indirect != 0 {
            node.set_indirect(0);
            self.put_node(f, &node)?;
            if let Err(e) = self.free_block(indirect) {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("free indirect block {}: {}", indirect, e);
            }
        }
        Ok(())
    }

    /// Deletes a file's content and its record. Whether the file is still open is
    /// the caller's business. Directories must be emptied first; see `remove_tree`.
    pub fn remove(&mut self, f: FileRef) -> Result<(), SFSError> {
        if f == self.root() {
            return Err(SFSError::InvalidArgument("cannot remove the root directory".to_string()));
        }
        let size = self.node(f)?.size();
        self.truncate_blocks(f, size, 0)?;
        self.cache.fill(f.addr(), NODE_SIZE, 0)?;
        self.cache.flush(f.addr())
    }

    /// Removes a file, or a directory and everything below it.
    pub fn remove_tree(&mut self, f: FileRef) -> Result<(), SFSError> {
        if self.node(f)?.is_dir() {
            self.for_each_file(f, |fs, child| fs.remove_tree(child))?;
        }
        self.remove(f)
    }

    /// Moves `src` into directory `dir` under its current name. Only the record
    /// moves; its block pointers are reused as they are. Returns the new
    /// location.
    pub fn rename(&mut self, dir: FileRef, src: FileRef) -> Result<FileRef, SFSError> {
        if src == self.root() || src == dir || self.is_ancestor(src, dir)? {
            return Err(SFSError::InvalidArgument("cannot move a directory into itself".to_string()));
        }
        if !self.node(dir)?.is_dir() {
            return Err(SFSError::InvalidArgument("rename target is not a directory".to_string()));
        }
        let node = self.node(src)?;
        if self.dir_lookup(dir, node.name_bytes())?.is_some() {
            return Err(SFSError::FileExists);
        }

        let moved = self.dir_alloc_file(dir)?;
        self.put_node(moved, &node)?;
        self.cache.flush(moved.addr())?;
        self.cache.flush(dir.addr())?;

        self.cache.fill(src.addr(), NODE_SIZE, 0)?;
        self.cache.flush(src.addr())?;
        Ok(moved)
    }

    /// Whether `f` lies somewhere below directory `tree`.
    fn is_ancestor(&mut self, tree: FileRef, f: FileRef) -> Result<bool, SFSError> {
        if !self.node(tree)?.is_dir() {
            return Ok(false);
        }
        for child in self.dir_files(tree)? {
            if child == f || self.is_ancestor(child, f)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Flushes the contents and metadata of `f` out to disk: every dirty data
    /// block, the record's own block and the indirect block.
    pub fn flush_file(&mut self, f: FileRef) -> Result<(), SFSError> {
        let node = self.node(f)?;
        for filebno in 0..node.block_count() {
            if let Some(bno) = self.lookup_block(f, filebno)? {
                let addr = self.cache.addr_of(bno);
                self.cache.flush(addr)?;
            }
        }

        self.cache.flush(f.addr())?;
        if node.indirect() != 0 {
            let addr = self.cache.addr_of(node.indirect());
            self.cache.flush(addr)?;
        }
        Ok(())
    }

    /// Releases the cache buffers holding a file's data and indirect blocks,
    /// writing dirty ones back first. The record's own block is shared with its
    /// siblings and stays cached.
    pub fn close_file(&mut self, f: FileRef) -> Result<(), SFSError> {
        let node = self.node(f)?;
        for filebno in 0..node.block_count() {
            if let Some(bno) = self.lookup_block(f, filebno)? {
                self.cache.evict(bno)?;
            }
        }
        if node.indirect() != 0 {
            self.cache.evict(node.indirect())?;
        }
        Ok(())
    }

    /// Syncs the entire file system. A big hammer.
    pub fn sync(&mut self) -> Result<(), SFSError> {
        self.cache.flush_all()?;
        self.cache.sync_device()
    }

    pub fn info(&mut self) -> Result<VolumeInfo, SFSError> {
        Ok(VolumeInfo {
            total_blocks: self.nblocks,
            used_blocks: self.bitmap.count_used(&mut self.cache)?,
        })
    }
}

fn fits_device<T: BlockStorage>(dev: &T, nblocks: u32) -> bool {
    dev.sector_count() >= u64::from(nblocks) * BLOCK_SECTORS as u64
}
