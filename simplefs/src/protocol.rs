//! Request and reply layouts exchanged with the file server. Every request
//! travels in one page; the structs below sit at the start of that page.

use bitflags::bitflags;
use zerocopy::byteorder::{LittleEndian, I64, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::fs::{SFSError, MAX_PATH_LEN};
use crate::node::{Stat, MAX_NAME_LEN};

pub const PAGE_SIZE: usize = 4096;
pub type Page = [u8; PAGE_SIZE];

/// Allocates a zeroed request page.
pub fn new_page() -> Box<Page> {
    Box::new([0; PAGE_SIZE])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Open = 1,
    SetSize = 2,
    Read = 3,
    Write = 4,
    Stat = 5,
    Flush = 6,
    Remove = 7,
    Sync = 8,
    Info = 9,
    Rename = 10,
    Close = 11,
    Seek = 12,
    Share = 13,
}

impl TryFrom<u32> for Opcode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Opcode::Open,
            2 => Opcode::SetSize,
            3 => Opcode::Read,
            4 => Opcode::Write,
            5 => Opcode::Stat,
            6 => Opcode::Flush,
            7 => Opcode::Remove,
            8 => Opcode::Sync,
            9 => Opcode::Info,
            10 => Opcode::Rename,
            11 => Opcode::Close,
            12 => Opcode::Seek,
            13 => Opcode::Share,
            other => return Err(other),
        })
    }
}

impl From<Opcode> for u32 {
    fn from(op: Opcode) -> u32 {
        op as u32
    }
}

/// Error codes carried in a reply as `-code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Inval = 3,
    NoDisk = 9,
    MaxOpen = 10,
    NotFound = 11,
    BadPath = 12,
    FileExists = 13,
    Busy = 16,
}

impl ErrorCode {
    /// Decodes a reply value. Non-negative values are successes.
    pub fn from_code(value: i32) -> Option<ErrorCode> {
        Some(match -value {
            3 => ErrorCode::Inval,
            9 => ErrorCode::NoDisk,
            10 => ErrorCode::MaxOpen,
            11 => ErrorCode::NotFound,
            12 => ErrorCode::BadPath,
            13 => ErrorCode::FileExists,
            16 => ErrorCode::Busy,
            _ => return None,
        })
    }

    /// The reply value reporting this error.
    pub fn reply_value(self) -> i32 {
        -(self as i32)
    }
}

impl SFSError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SFSError::DoesNotExist => ErrorCode::NotFound,
            SFSError::FileExists => ErrorCode::FileExists,
            SFSError::BadPath(_) => ErrorCode::BadPath,
            SFSError::NoSpace => ErrorCode::NoDisk,
            SFSError::Busy => ErrorCode::Busy,
            SFSError::MaxOpen => ErrorCode::MaxOpen,
            SFSError::InvalidArgument(_) | SFSError::Device(_) | SFSError::Corrupt(_) => ErrorCode::Inval,
        }
    }
}

bitflags! {
    /// Flags passed with OPEN. The low two bits are the access mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenMode: u32 {
        const RDONLY = 0x0000;
        const WRONLY = 0x0001;
        const RDWR = 0x0002;
        const ACCMODE = 0x0003;
        /// Create if nonexistent.
        const CREAT = 0x0100;
        /// Truncate to zero length.
        const TRUNC = 0x0200;
        /// Error if already exists.
        const EXCL = 0x0400;
        /// Create a directory, not a regular file.
        const MKDIR = 0x0800;
    }
}

impl OpenMode {
    pub fn access(self) -> OpenMode {
        self & OpenMode::ACCMODE
    }

    pub fn readable(self) -> bool {
        self.access() != OpenMode::WRONLY
    }

    pub fn writable(self) -> bool {
        let access = self.access();
        access == OpenMode::WRONLY || access == OpenMode::RDWR
    }
}

bitflags! {
    /// Permissions of a page handed across the channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Perm: u32 {
        const PRESENT = 0x001;
        const WRITE = 0x002;
        const USER = 0x004;
        /// Shared with children rather than copied.
        const SHARE = 0x400;
    }
}

impl Perm {
    /// A writable page owned by the caller.
    pub fn request() -> Perm {
        Perm::PRESENT | Perm::WRITE | Perm::USER
    }

    /// A descriptor page, which survives fork shared.
    pub fn descriptor() -> Perm {
        Perm::request() | Perm::SHARE
    }
}

/// Reads a request struct from the start of a page.
pub fn decode<V: FromBytes>(page: &Page) -> Result<V, SFSError> {
    V::read_from_prefix(&page[..])
        .ok_or_else(|| SFSError::InvalidArgument("request does not fit a page".to_string()))
}

/// Writes a struct to the start of a page, leaving the rest untouched.
pub fn encode<V: AsBytes>(value: &V, page: &mut Page) {
    let bytes = value.as_bytes();
    page[..bytes.len()].copy_from_slice(bytes);
}

/// The NUL terminated string stored in `field`.
fn c_str(field: &[u8]) -> Result<&str, SFSError> {
    let len = field
        .iter()
        .position(|&c| c == 0)
        .ok_or_else(|| SFSError::BadPath("path is not terminated".to_string()))?;
    std::str::from_utf8(&field[..len]).map_err(|_| SFSError::BadPath("path is not valid UTF-8".to_string()))
}

/// # Panics
///
/// The string must leave room for the terminating NUL.
fn set_c_str(field: &mut [u8], s: &str) {
    assert!(s.len() < field.len(), "path too long: {}", s);
    field.fill(0);
    field[..s.len()].copy_from_slice(s.as_bytes());
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy)]
pub struct OpenReq {
    path: [u8; MAX_PATH_LEN],
    omode: U32<LittleEndian>,
}

impl OpenReq {
    pub fn new(path: &str, mode: OpenMode) -> Self {
        let mut req = Self::new_zeroed();
        set_c_str(&mut req.path, path);
        req.omode.set(mode.bits());
        req
    }

    pub fn path(&self) -> Result<&str, SFSError> {
        c_str(&self.path)
    }

    pub fn mode(&self) -> OpenMode {
        OpenMode::from_bits_truncate(self.omode.get())
    }
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
pub struct SetSizeReq {
    pub file_id: U32<LittleEndian>,
    pub size: I64<LittleEndian>,
}

impl SetSizeReq {
    pub fn new(file_id: u32, size: i64) -> Self {
        Self {
            file_id: U32::new(file_id),
            size: I64::new(size),
        }
    }
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
pub struct ReadReq {
    pub file_id: U32<LittleEndian>,
    pub n: U32<LittleEndian>,
}

impl ReadReq {
    pub fn new(file_id: u32, n: u32) -> Self {
        Self {
            file_id: U32::new(file_id),
            n: U32::new(n),
        }
    }
}

pub const WRITE_BUF_SIZE: usize = PAGE_SIZE - 8;

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy)]
pub struct WriteReq {
    pub file_id: U32<LittleEndian>,
    pub n: U32<LittleEndian>,
    pub buf: [u8; WRITE_BUF_SIZE],
}

impl WriteReq {
    /// Carries at most `WRITE_BUF_SIZE` bytes of `data`.
    pub fn new(file_id: u32, data: &[u8]) -> Self {
        let mut req = Self::new_zeroed();
        let n = data.len().min(WRITE_BUF_SIZE);
        req.file_id.set(file_id);
        req.n.set(n as u32);
        req.buf[..n].copy_from_slice(&data[..n]);
        req
    }
}

/// Requests that only name an open file: STAT, FLUSH and CLOSE.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
pub struct FileReq {
    pub file_id: U32<LittleEndian>,
}

impl FileReq {
    pub fn new(file_id: u32) -> Self {
        Self {
            file_id: U32::new(file_id),
        }
    }
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy)]
pub struct StatRet {
    name: [u8; MAX_NAME_LEN],
    pub size: I64<LittleEndian>,
    pub is_dir: U32<LittleEndian>,
}

impl From<&Stat> for StatRet {
    fn from(st: &Stat) -> Self {
        let mut ret = Self::new_zeroed();
        let name = st.name.as_bytes();
        let name = &name[..name.len().min(MAX_NAME_LEN - 1)];
        ret.name[..name.len()].copy_from_slice(name);
        ret.size.set(st.size);
        ret.is_dir.set(st.is_dir as u32);
        ret
    }
}

impl StatRet {
    pub fn to_stat(&self) -> Result<Stat, SFSError> {
        Ok(Stat {
            name: c_str(&self.name)?.to_string(),
            size: self.size.get(),
            is_dir: self.is_dir.get() != 0,
        })
    }
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy)]
pub struct RemoveReq {
    path: [u8; MAX_PATH_LEN],
}

impl RemoveReq {
    pub fn new(path: &str) -> Self {
        let mut req = Self::new_zeroed();
        set_c_str(&mut req.path, path);
        req
    }

    pub fn path(&self) -> Result<&str, SFSError> {
        c_str(&self.path)
    }
}

/// Moves `src` into the directory `dst`, keeping its name.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy)]
pub struct RenameReq {
    src: [u8; MAX_PATH_LEN],
    dst: [u8; MAX_PATH_LEN],
}

impl RenameReq {
    pub fn new(src: &str, dst: &str) -> Self {
        let mut req = Self::new_zeroed();
        set_c_str(&mut req.src, src);
        set_c_str(&mut req.dst, dst);
        req
    }

    pub fn src(&self) -> Result<&str, SFSError> {
        c_str(&self.src)
    }

    pub fn dst(&self) -> Result<&str, SFSError> {
        c_str(&self.dst)
    }
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
pub struct InfoRet {
    pub total_blocks: U32<LittleEndian>,
    pub used_blocks: U32<LittleEndian>,
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
pub struct SeekReq {
    pub file_id: U32<LittleEndian>,
    pub offset: I64<LittleEndian>,
}

impl SeekReq {
    pub fn new(file_id: u32, offset: i64) -> Self {
        Self {
            file_id: U32::new(file_id),
            offset: I64::new(offset),
        }
    }
}

/// Adds `client` as a holder of an open file, as when a descriptor is
/// inherited across fork.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
pub struct ShareReq {
    pub file_id: U32<LittleEndian>,
    pub client: U32<LittleEndian>,
}

impl ShareReq {
    pub fn new(file_id: u32, client: u32) -> Self {
        Self {
            file_id: U32::new(file_id),
            client: U32::new(client),
        }
    }
}

/// The page returned by a successful OPEN.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
pub struct Descriptor {
    pub dev_id: U32<LittleEndian>,
    pub offset: I64<LittleEndian>,
    pub omode: U32<LittleEndian>,
    pub file_id: U32<LittleEndian>,
}

impl Descriptor {
    pub fn new(dev_id: u32, file_id: u32, mode: OpenMode) -> Self {
        Self {
            dev_id: U32::new(dev_id),
            offset: I64::new(0),
            omode: U32::new(mode.access().bits()),
            file_id: U32::new(file_id),
        }
    }
}

const _: () = assert!(std::mem::size_of::<OpenReq>() <= PAGE_SIZE);
const _: () = assert!(std::mem::size_of::<WriteReq>() == PAGE_SIZE);
const _: () = assert!(std::mem::size_of::<RenameReq>() <= PAGE_SIZE);
const _: () = assert!(std::mem::size_of::<StatRet>() == MAX_NAME_LEN + 12);
const _: () = assert!(std::mem::size_of::<Descriptor>() == 20);
