//! Sector-addressed block devices for file system development.

mod blockio;
mod emulator;
mod memory;

pub use blockio::{BlockStorage, SectorNumber, SECTOR_SIZE};
pub use emulator::{FileBlockEmulator, FileBlockEmulatorBuilder};
pub use memory::MemoryDisk;
