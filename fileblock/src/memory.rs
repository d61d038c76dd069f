use crate::blockio::{check_transfer, BlockStorage, SectorNumber, SECTOR_SIZE};
use std::io::{Error, ErrorKind};

/// A volatile disk held entirely in memory. Counts sector transfers so tests can
/// reason about how much IO a code path issued, and can be told to fail writes.
pub struct MemoryDisk {
    bytes: Vec<u8>,
    reads: usize,
    writes: usize,
    fail_writes: bool,
}

impl MemoryDisk {
    pub fn new(sectors: u64) -> Self {
        Self {
            bytes: vec![0; sectors as usize * SECTOR_SIZE],
            reads: 0,
            writes: 0,
            fail_writes: false,
        }
    }

    /// Number of successful `read_sectors` calls.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Number of successful `write_sectors` calls.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn reset_counters(&mut self) {
        self.reads = 0;
        self.writes = 0;
    }

    /// When set, every subsequent write fails as a hardware error would.
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Raw view of the medium.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl BlockStorage for MemoryDisk {
    fn sector_count(&self) -> u64 {
        (self.bytes.len() / SECTOR_SIZE) as u64
    }

    fn read_sectors(&mut self, sector: SectorNumber, buf: &mut [u8], count: usize) -> std::io::Result<()> {
        let bytes = check_transfer(self.sector_count(), sector, buf.len(), count)?;
        let start = sector as usize * SECTOR_SIZE;
        buf[..bytes].copy_from_slice(&self.bytes[start..start + bytes]);
        self.reads += 1;
        Ok(())
    }

    fn write_sectors(&mut self, sector: SectorNumber, buf: &[u8], count: usize) -> std::io::Result<()> {
        if self.fail_writes {
            return Err(Error::new(ErrorKind::Other, "injected write failure"));
        }
        let bytes = check_transfer(self.sector_count(), sector, buf.len(), count)?;
        let start = sector as usize * SECTOR_SIZE;
        self.bytes[start..start + bytes].copy_from_slice(&buf[..bytes]);
        self.writes += 1;
        Ok(())
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_transfers() {
        let mut disk = MemoryDisk::new(4);
        disk.write_sectors(0, &[1; 1024], 2).unwrap();
        let mut buf = [0; 512];
        disk.read_sectors(1, &mut buf, 1).unwrap();

        assert_eq!(disk.writes(), 1);
        assert_eq!(disk.reads(), 1);
        assert_eq!(buf, [1; 512]);
    }

    #[test]
    fn injected_failure_rejects_writes() {
        let mut disk = MemoryDisk::new(4);
        disk.fail_writes(true);
        assert!(disk.write_sectors(0, &[1; 512], 1).is_err());
        assert_eq!(disk.writes(), 0);
        assert!(disk.as_bytes().iter().all(|&b| b == 0));
    }
}
