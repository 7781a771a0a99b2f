//! `File`: an open cursor onto one regular file's body (spec §6).

use super::Lfs3;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

pub struct File<'bd, 'a> {
    lfs: &'a Lfs3<'bd>,
    path: String,
    pos: u32,
}

impl<'bd, 'a> File<'bd, 'a> {
    pub(crate) fn open(lfs: &'a Lfs3<'bd>, path: &str) -> Result<Self> {
        let stat = lfs.stat(path)?;
        if stat.kind != crate::fs::DirentKind::Reg {
            return Err(Error::Isdir);
        }
        Ok(File { lfs, path: path.to_string(), pos: 0 })
    }

    /// Read up to `buf.len()` bytes starting at the cursor, returning the
    /// number actually read (0 at end of file, never an error there).
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = self.lfs.fs.borrow().file_size(self.lfs.bd, &self.path)?;
        let remaining = size.saturating_sub(self.pos);
        let want = (buf.len() as u32).min(remaining);
        if want == 0 {
            return Ok(0);
        }
        let data = self.lfs.fs.borrow().read_file(self.lfs.bd, &self.path, self.pos, want)?;
        buf[..data.len()].copy_from_slice(&data);
        self.pos += data.len() as u32;
        Ok(data.len())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.lfs.fs.borrow_mut().write_file(self.lfs.bd, &self.path, self.pos, data)?;
        self.pos += data.len() as u32;
        Ok(data.len())
    }

    pub fn seek(&mut self, whence: Whence, off: i64) -> Result<u32> {
        let size = self.lfs.fs.borrow().file_size(self.lfs.bd, &self.path)? as i64;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.pos as i64,
            Whence::End => size,
        };
        let new_pos = base + off;
        if new_pos < 0 {
            return Err(Error::Inval);
        }
        self.pos = new_pos as u32;
        Ok(self.pos)
    }

    pub fn tell(&self) -> u32 {
        self.pos
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub fn size(&self) -> Result<u32> {
        self.lfs.fs.borrow().file_size(self.lfs.bd, &self.path)
    }

    pub fn truncate(&mut self, size: u32) -> Result<()> {
        self.lfs.fs.borrow_mut().truncate_file(self.lfs.bd, &self.path, size)?;
        if self.pos > size {
            self.pos = size;
        }
        Ok(())
    }

    /// Drop `n` bytes from the front of the file, shifting the cursor
    /// down to stay over the same logical bytes (spec's `fruncate`).
    pub fn fruncate(&mut self, n: u32) -> Result<()> {
        self.lfs.fs.borrow_mut().fruncate_file(self.lfs.bd, &self.path, n)?;
        self.pos = self.pos.saturating_sub(n);
        Ok(())
    }

    /// Every write already landed durably by the time [`File::write`]
    /// returned; `sync` exists for API parity with callers ported from
    /// the reference implementation.
    pub fn sync(&self) -> Result<()> {
        Ok(())
    }
}
