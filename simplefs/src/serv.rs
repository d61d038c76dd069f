//! The file server: a table of open files and a loop answering requests one at
//! a time.

use std::cmp::min;
use std::collections::BTreeSet;

use fileblock::BlockStorage;
use log::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::fs::{SFSError, SFS};
use crate::ipc::{ClientId, Message, Reply, Transport};
use crate::node::{FileRef, FileType};
use crate::protocol::{
    decode, encode, new_page, Descriptor, FileReq, InfoRet, OpenMode, OpenReq, Opcode, Page, Perm, ReadReq,
    RemoveReq, RenameReq, SeekReq, SetSizeReq, ShareReq, StatRet, WriteReq, PAGE_SIZE, WRITE_BUF_SIZE,
};

#[derive(Debug)]
pub struct OpenFile {
    pub file: FileRef,
    /// Access bits only.
    pub mode: OpenMode,
    /// Current seek position, owned by the server.
    pub offset: i64,
    holders: BTreeSet<ClientId>,
}

impl OpenFile {
    pub fn holders(&self) -> &BTreeSet<ClientId> {
        &self.holders
    }
}

#[derive(Debug)]
pub enum HandleState {
    Free,
    Open(OpenFile),
}

#[derive(Debug)]
struct Slot {
    file_id: u32,
    state: HandleState,
}

/// Fixed table of open file handles. A handle's id maps to slot
/// `id % capacity`; each reuse of a slot advances its id by the capacity, so a
/// stale id from an earlier open no longer matches.
#[derive(Debug)]
pub struct OpenTable {
    slots: Vec<Slot>,
}

impl OpenTable {
    pub fn new(max_open: usize) -> Self {
        let slots = (0..max_open)
            .map(|i| Slot {
                file_id: i as u32,
                state: HandleState::Free,
            })
            .collect();
        OpenTable { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.state, HandleState::Open(_)))
            .count()
    }

    fn index(&self, file_id: u32) -> usize {
        file_id as usize % self.slots.len()
    }

    /// Reserves the id for a new handle. The slot stays free until `activate`.
    pub fn alloc(&mut self) -> Result<u32, SFSError> {
        let max_open = self.slots.len() as u32;
        let index = self
            .slots
            .iter()
            .position(|slot| matches!(slot.state, HandleState::Free))
            .ok_or(SFSError::MaxOpen)?;
        let slot = &mut self.slots[index];
        slot.file_id = slot.file_id.checked_add(max_open).unwrap_or(index as u32);
        Ok(slot.file_id)
    }

    pub fn activate(&mut self, file_id: u32, owner: ClientId, file: FileRef, mode: OpenMode) {
        let index = self.index(file_id);
        let slot = &mut self.slots[index];
        debug_assert_eq!(slot.file_id, file_id);
        slot.state = HandleState::Open(OpenFile {
            file,
            mode: mode.access(),
            offset: 0,
            holders: BTreeSet::from([owner]),
        });
    }

    /// Finds the open file `file_id`, which `who` must hold.
    pub fn lookup(&mut self, who: ClientId, file_id: u32) -> Result<&mut OpenFile, SFSError> {
        let index = self.index(file_id);
        let slot = &mut self.slots[index];
        match &mut slot.state {
            HandleState::Open(of) if slot.file_id == file_id && of.holders.contains(&who) => Ok(of),
            _ => Err(SFSError::InvalidArgument(format!(
                "file {} is not open by client {}",
                file_id, who
            ))),
        }
    }

    /// True if no handle other than `except` refers to `file`.
    pub fn is_closed(&self, file: FileRef, except: Option<u32>) -> bool {
        self.slots.iter().all(|slot| match &slot.state {
            HandleState::Open(of) => of.file != file || Some(slot.file_id) == except,
            HandleState::Free => true,
        })
    }

    pub fn share(&mut self, who: ClientId, file_id: u32, with: ClientId) -> Result<(), SFSError> {
        self.lookup(who, file_id)?.holders.insert(with);
        Ok(())
    }

    /// Drops `who` from the holders. Returns the file once the last holder is
    /// gone and the handle has been freed.
    pub fn close(&mut self, who: ClientId, file_id: u32) -> Result<Option<FileRef>, SFSError> {
        let of = self.lookup(who, file_id)?;
        of.holders.remove(&who);
        if !of.holders.is_empty() {
            return Ok(None);
        }
        let file = of.file;
        let index = self.index(file_id);
        self.slots[index].state = HandleState::Free;
        Ok(Some(file))
    }
}

enum Outcome {
    Value(i32),
    Descriptor(Box<Page>),
}

pub struct Server<T: BlockStorage> {
    fs: SFS<T>,
    table: OpenTable,
    config: ServerConfig,
}

impl<T: BlockStorage> Server<T> {
    pub fn new(fs: SFS<T>, config: ServerConfig) -> Self {
        Server {
            fs,
            table: OpenTable::new(config.max_open),
            config,
        }
    }

    pub fn fs(&self) -> &SFS<T> {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut SFS<T> {
        &mut self.fs
    }

    pub fn table(&self) -> &OpenTable {
        &self.table
    }

    pub fn into_fs(self) -> SFS<T> {
        self.fs
    }

    /// Answers requests until every client is gone. Returns early with any
    /// error the volume cannot recover from.
    pub fn serve<R: Transport>(&mut self, transport: &mut R) -> Result<(), SFSError> {
        info!(
            "file server is running: {} blocks, {} handles",
            self.fs.block_count(),
            self.config.max_open
        );
        while let Some(msg) = transport.receive() {
            let from = msg.from;
            if let Some(reply) = self.handle(msg)? {
                if let Err(e) = transport.send(from, reply) {
                    warn!("reply to {} failed: {}", from, e);
                }
            }
        }
        info!("file server stopping");
        Ok(())
    }

    /// Runs one request. `Ok(None)` means the request was malformed and gets no
    /// reply at all.
    pub fn handle(&mut self, msg: Message) -> Result<Option<Reply>, SFSError> {
        let Message { from, opcode, page, perm } = msg;
        let opcode = match Opcode::try_from(opcode) {
            Ok(opcode) => opcode,
            Err(code) => {
                warn!("invalid request code {} from {}", code, from);
                return Ok(None);
            }
        };
        let mut page = match page {
            Some(page) if perm.contains(Perm::PRESENT) => page,
            _ => {
                warn!("invalid request from {}: no argument page", from);
                return Ok(None);
            }
        };

        debug!("{:?} from {}", opcode, from);
        match self.dispatch(from, opcode, &mut page) {
            Ok(Outcome::Value(value)) => Ok(Some(Reply::new(value, Some(page), perm))),
            Ok(Outcome::Descriptor(desc)) => Ok(Some(Reply::new(0, Some(desc), Perm::descriptor()))),
            Err(e) if e.is_fatal() => {
                error!("{:?} from {}: {}", opcode, from, e);
                Err(e)
            }
            Err(e) => {
                debug!("{:?} from {} failed: {}", opcode, from, e);
                Ok(Some(Reply::new(e.code().reply_value(), Some(page), perm)))
            }
        }
    }

    fn dispatch(&mut self, from: ClientId, opcode: Opcode, page: &mut Page) -> Result<Outcome, SFSError> {
        let value = match opcode {
            Opcode::Open => return self.serve_open(from, page).map(Outcome::Descriptor),
            Opcode::SetSize => self.serve_set_size(from, page)?,
            Opcode::Read => self.serve_read(from, page)?,
            Opcode::Write => self.serve_write(from, page)?,
            Opcode::Stat => self.serve_stat(from, page)?,
            Opcode::Flush => self.serve_flush(from, page)?,
            Opcode::Remove => self.serve_remove(page)?,
            Opcode::Sync => {
                self.fs.sync()?;
                0
            }
            Opcode::Info => self.serve_info(page)?,
            Opcode::Rename => self.serve_rename(page)?,
            Opcode::Close => self.serve_close(from, page)?,
            Opcode::Seek => self.serve_seek(from, page)?,
            Opcode::Share => self.serve_share(from, page)?,
        };
        Ok(Outcome::Value(value))
    }

    fn serve_open(&mut self, from: ClientId, page: &Page) -> Result<Box<Page>, SFSError> {
        let req: OpenReq = decode(page)?;
        let path = req.path()?;
        let mode = req.mode();

        let file_id = self.table.alloc()?;
        let file = self.open_path(path, mode)?;
        if self.fs.node(file)?.is_dir() && (mode.writable() || mode.contains(OpenMode::TRUNC)) {
            return Err(SFSError::InvalidArgument(format!("{} is a directory", path)));
        }
        if mode.contains(OpenMode::TRUNC) {
            self.fs.set_size(file, 0)?;
        }
        self.table.activate(file_id, from, file, mode);

        let mut desc = new_page();
        encode(&Descriptor::new(self.config.dev_id, file_id, mode), &mut desc);
        debug!("opened {} as {} ({:?}) for {}", path, file_id, mode, from);
        Ok(desc)
    }

    fn open_path(&mut self, path: &str, mode: OpenMode) -> Result<FileRef, SFSError> {
        if mode.intersects(OpenMode::CREAT | OpenMode::MKDIR) {
            let ftype = if mode.contains(OpenMode::MKDIR) {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            match self.fs.create_file(path, ftype) {
                Ok(file) => return Ok(file),
                Err(SFSError::FileExists) if !mode.contains(OpenMode::EXCL) => {}
                Err(e) => return Err(e),
            }
        }
        self.fs.open_file(path)
    }

    fn serve_set_size(&mut self, from: ClientId, page: &Page) -> Result<i32, SFSError> {
        let req: SetSizeReq = decode(page)?;
        let of = self.table.lookup(from, req.file_id.get())?;
        if !of.mode.writable() {
            return Err(not_permitted("writable"));
        }
        self.fs.set_size(of.file, req.size.get())?;
        Ok(0)
    }

    fn serve_read(&mut self, from: ClientId, page: &mut Page) -> Result<i32, SFSError> {
        let req: ReadReq = decode(page)?;
        let of = self.table.lookup(from, req.file_id.get())?;
        if !of.mode.readable() {
            return Err(not_permitted("readable"));
        }
        let n = min(req.n.get() as usize, PAGE_SIZE);
        let count = self.fs.read(of.file, &mut page[..n], of.offset)?;
        of.offset += count as i64;
        Ok(count as i32)
    }

    fn serve_write(&mut self, from: ClientId, page: &Page) -> Result<i32, SFSError> {
        let req: WriteReq = decode(page)?;
        let of = self.table.lookup(from, req.file_id.get())?;
        if !of.mode.writable() {
            return Err(not_permitted("writable"));
        }
        let n = min(req.n.get() as usize, WRITE_BUF_SIZE);
        let count = self.fs.write(of.file, &req.buf[..n], of.offset)?;
        of.offset += count as i64;
        Ok(count as i32)
    }

    fn serve_stat(&mut self, from: ClientId, page: &mut Page) -> Result<i32, SFSError> {
        let req: FileReq = decode(page)?;
        let file = self.table.lookup(from, req.file_id.get())?.file;
        let st = self.fs.stat(file)?;
        encode(&StatRet::from(&st), page);
        Ok(0)
    }

    fn serve_flush(&mut self, from: ClientId, page: &Page) -> Result<i32, SFSError> {
        let req: FileReq = decode(page)?;
        let file_id = req.file_id.get();
        let file = self.table.lookup(from, file_id)?.file;
        self.fs.flush_file(file)?;
        if self.table.is_closed(file, Some(file_id)) {
            self.fs.close_file(file)?;
        }
        Ok(0)
    }

    fn serve_remove(&mut self, page: &Page) -> Result<i32, SFSError> {
        let req: RemoveReq = decode(page)?;
        let path = req.path()?;
        let file = self.fs.open_file(path)?;
        if file == self.fs.root() {
            return Err(SFSError::InvalidArgument("cannot remove the root directory".to_string()));
        }
        if !self.tree_is_closed(file)? {
            return Err(SFSError::Busy);
        }
        self.fs.remove_tree(file)?;
        debug!("removed {}", path);
        Ok(0)
    }

    /// True if neither `f` nor anything below it is open.
    fn tree_is_closed(&mut self, f: FileRef) -> Result<bool, SFSError> {
        if !self.table.is_closed(f, None) {
            return Ok(false);
        }
        if self.fs.node(f)?.is_dir() {
            for child in self.fs.dir_files(f)? {
                if !self.tree_is_closed(child)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn serve_info(&mut self, page: &mut Page) -> Result<i32, SFSError> {
        let info = self.fs.info()?;
        let mut ret: InfoRet = decode(page)?;
        ret.total_blocks.set(info.total_blocks);
        ret.used_blocks.set(info.used_blocks);
        encode(&ret, page);
        Ok(0)
    }

    fn serve_rename(&mut self, page: &Page) -> Result<i32, SFSError> {
        let req: RenameReq = decode(page)?;
        let src = self.fs.open_file(req.src()?)?;
        // The record moves, which would strand any handle on it.
        if !self.table.is_closed(src, None) {
            return Err(SFSError::Busy);
        }
        let dir = self.fs.open_file(req.dst()?)?;
        self.fs.rename(dir, src)?;
        debug!("moved {} into {}", req.src()?, req.dst()?);
        Ok(0)
    }

    fn serve_close(&mut self, from: ClientId, page: &Page) -> Result<i32, SFSError> {
        let req: FileReq = decode(page)?;
        if let Some(file) = self.table.close(from, req.file_id.get())? {
            self.fs.flush_file(file)?;
            if self.table.is_closed(file, None) {
                self.fs.close_file(file)?;
            }
        }
        Ok(0)
    }

    fn serve_seek(&mut self, from: ClientId, page: &Page) -> Result<i32, SFSError> {
        let req: SeekReq = decode(page)?;
        let offset = req.offset.get();
        if offset < 0 {
            return Err(SFSError::InvalidArgument(format!("negative offset {}", offset)));
        }
        self.table.lookup(from, req.file_id.get())?.offset = offset;
        Ok(0)
    }

    fn serve_share(&mut self, from: ClientId, page: &Page) -> Result<i32, SFSError> {
        let req: ShareReq = decode(page)?;
        self.table.share(from, req.file_id.get(), req.client.get())?;
        Ok(0)
    }
}

fn not_permitted(access: &str) -> SFSError {
    SFSError::InvalidArgument(format!("file is not open {}", access))
}
