//! File-backed block device.
//!
//! `mapped_file.rs` maps a device file and hands out raw pointers for
//! read-only structure overlay. This crate's block device contract
//! includes `prog`/`erase`, so a writable backend is needed; positioned
//! reads/writes on a `File` give the same random-access shape without
//! the `unsafe` a read-only mmap would otherwise buy for a single
//! read-only dump pass.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::bd::{Block, BlockDevice};
use crate::error::{Error, Result};

pub struct FileBlockDevice {
    file: RefCell<File>,
    block_size: u32,
    block_count: u32,
}

impl FileBlockDevice {
    /// Open (creating if necessary) a flat image file sized to hold
    /// `block_count` blocks of `block_size` bytes.
    pub fn open(path: &Path, block_count: u32, block_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|_| Error::Io)?;
        let needed = block_count as u64 * block_size as u64;
        file.set_len(needed).map_err(|_| Error::Io)?;
        Ok(FileBlockDevice { file: RefCell::new(file), block_size, block_count })
    }

    fn offset(&self, block: Block, off: u32) -> u64 {
        block as u64 * self.block_size as u64 + off as u64
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read(&self, block: Block, off: u32, buf: &mut [u8]) -> Result<()> {
        if block >= self.block_count || off + buf.len() as u32 > self.block_size {
            return Err(Error::Range);
        }
        let mut f = self.file.borrow_mut();
        f.seek(SeekFrom::Start(self.offset(block, off))).map_err(|_| Error::Io)?;
        f.read_exact(buf).map_err(|_| Error::Io)?;
        Ok(())
    }

    fn prog(&self, block: Block, off: u32, data: &[u8]) -> Result<()> {
        if block >= self.block_count || off + data.len() as u32 > self.block_size {
            return Err(Error::Range);
        }
        let mut f = self.file.borrow_mut();
        f.seek(SeekFrom::Start(self.offset(block, off))).map_err(|_| Error::Io)?;
        f.write_all(data).map_err(|_| Error::Io)?;
        Ok(())
    }

    fn erase(&self, block: Block) -> Result<()> {
        if block >= self.block_count {
            return Err(Error::Range);
        }
        let blank = vec![0xffu8; self.block_size as usize];
        let mut f = self.file.borrow_mut();
        f.seek(SeekFrom::Start(self.offset(block, 0))).map_err(|_| Error::Io)?;
        f.write_all(&blank).map_err(|_| Error::Io)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.borrow().sync_data().map_err(|_| Error::Io)
    }
}
