use crate::blockio::{check_transfer, BlockStorage, SectorNumber, SECTOR_SIZE};
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, SeekFrom};
use std::path::Path;

use log::trace;

pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a sector.
    fd: File,
    /// The total number of sectors available in the file store.
    sector_count: u64,
}

/// Emulates block disk/flash storage in userspace using a file as block storage.
/// This is only meant to be used for file system development and testing.
impl FileBlockEmulator {
    /// Opens an existing disk image. The medium size is the file length rounded
    /// down to a whole sector. This method does not validate the contents, it is
    /// up for clients to ensure disks are appropriately initialized.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        // Return error if the file does not exist rather than create one.
        let fd = OpenOptions::new().read(true).write(true).open(path)?;
        let sector_count = fd.metadata()?.len() / SECTOR_SIZE as u64;
        Ok(FileBlockEmulator { fd, sector_count })
    }

    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }
}

impl BlockStorage for FileBlockEmulator {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sectors(&mut self, sector: SectorNumber, buf: &mut [u8], count: usize) -> std::io::Result<()> {
        let bytes = check_transfer(self.sector_count, sector, buf.len(), count)?;
        trace!("read {} sectors at {}", count, sector);
        self.fd
            .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
        // Limit the read to just the sectors specified.
        self.fd.read_exact(&mut buf[..bytes])
    }

    fn write_sectors(&mut self, sector: SectorNumber, buf: &[u8], count: usize) -> std::io::Result<()> {
        let bytes = check_transfer(self.sector_count, sector, buf.len(), count)?;
        trace!("write {} sectors at {}", count, sector);
        self.fd
            .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
        self.fd.write_all(&buf[..bytes])
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    sector_count: u64,
    clear: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            // A better default here might be the size of the file rounded down
            // to the nearest sector.
            sector_count: 0,
            clear: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of desired sectors in the block store device.
    pub fn with_sector_count(mut self, sectors: u64) -> Self {
        self.sector_count = sectors;
        self
    }

    /// Controls whether the medium is zeroed on build. Reopening an initialized
    /// disk should pass `false`.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumed ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally, ownership
    /// of the file is transfered to the emulator meaning this builder can only
    /// be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        debug_assert!(self.sector_count > 0);
        if self.clear {
            self.zero_medium()?;
        } else if self.fd.metadata()?.len() < self.sector_count * SECTOR_SIZE as u64 {
            self.fd.set_len(self.sector_count * SECTOR_SIZE as u64)?;
        }
        Ok(FileBlockEmulator {
            fd: self.fd,
            sector_count: self.sector_count,
        })
    }

    fn zero_medium(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk", buffering each write to prevent excessive syscalls.
        let zeroes = [0x00; SECTOR_SIZE];
        for _ in 0..self.sector_count {
            bfd.write_all(&zeroes)?;
        }
        bfd.flush()?;
        drop(bfd);
        self.fd.set_len(self.sector_count * SECTOR_SIZE as u64)
    }
}
