use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("access at offset {offset} (len {len}) beyond capacity {capacity}")]
    OutOfBounds { offset: u64, len: usize, capacity: u64 },
    #[error("write to read-only backing file")]
    ReadOnly,
}

impl From<std::io::Error> for DiskError {
    fn from(e: std::io::Error) -> Self {
        DiskError::Io(e.to_string())
    }
}

/// Positioned I/O over a disk image. The capacity is fixed at open time;
/// every access is bounds-checked against it, so a short read can only
/// mean a broken backing store.
pub trait DiskBackend {
    fn capacity_bytes(&self) -> u64;

    fn read_only(&self) -> bool {
        false
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
}

fn check_bounds(offset: u64, len: usize, capacity: u64) -> Result<u64> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OutOfBounds { offset, len, capacity })?;
    if end > capacity {
        return Err(DiskError::OutOfBounds { offset, len, capacity });
    }
    Ok(end)
}

/// Memory-backed image for tests and scratch disks.
#[derive(Debug, Clone, Default)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new(capacity: u64) -> Self {
        MemBackend { data: vec![0; capacity as usize] }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        MemBackend { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl DiskBackend for MemBackend {
    fn capacity_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.capacity_bytes())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.capacity_bytes())?;
        let start = offset as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// Disk image backed by a host file, mutated in place.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    capacity: u64,
    read_only: bool,
}

impl FileBackend {
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let capacity = file.metadata()?.len();
        Ok(FileBackend { file, capacity, read_only })
    }
}

impl DiskBackend for FileBackend {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.capacity)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        check_bounds(offset, buf.len(), self.capacity)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        self.file.flush()?;
        Ok(())
    }
}
