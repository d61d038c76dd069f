/// The sector number to access ranging from 0 (the first sector) to n - 1 (the
/// last sector) where n is the number of sectors available.
pub type SectorNumber = u64;

/// Disks commonly are composed of 512 byte sectors.
pub const SECTOR_SIZE: usize = 512;

/// Tried to map as closely as possible to a PIO disk driver: synchronous sector
/// transfers that either complete or fail.
///
/// In cases where implementing the interface as described would lead to non-idiomatic
/// rust code, I opted to use a more rust-y interface.
pub trait BlockStorage {
    /// The total number of sectors available on the medium.
    fn sector_count(&self) -> u64;
    /// Reads `count` sectors starting at `sector` into the front of `buf`.
    ///
    /// # Errors
    ///
    /// Attempting to read a sector out of range, or into a buffer shorter than
    /// `count * SECTOR_SIZE`, will return an error.
    fn read_sectors(&mut self, sector: SectorNumber, buf: &mut [u8], count: usize) -> std::io::Result<()>;
    /// Writes the first `count * SECTOR_SIZE` bytes of `buf` starting at `sector`.
    ///
    /// # Errors
    ///
    /// Attempting to write a sector out of range will return an error.
    fn write_sectors(&mut self, sector: SectorNumber, buf: &[u8], count: usize) -> std::io::Result<()>;
    /// Flush any buffered disk IO from memory. This is useful if it must guaranteed
    /// the disk writes actually occurred, for instance, if being re-read from
    /// disk.
    fn sync_disk(&mut self) -> std::io::Result<()>;
}

/// Validates a transfer against the medium size and the caller's buffer.
pub(crate) fn check_transfer(
    sector_count: u64,
    sector: SectorNumber,
    buf_len: usize,
    count: usize,
) -> std::io::Result<usize> {
    use std::io::{Error, ErrorKind};

    let end = sector.checked_add(count as u64);
    if end.map_or(true, |end| end > sector_count) {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "sector requested exceeds device upper bound",
        ));
    }
    let bytes = count * SECTOR_SIZE;
    if buf_len < bytes {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "buffer does not contain enough space for transfer",
        ));
    }
    Ok(bytes)
}
