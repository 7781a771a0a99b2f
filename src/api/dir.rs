//! `Dir`: an open cursor over one directory's entries (spec §6).
//!
//! Entries are snapshotted at `open` time rather than re-read live from
//! the mdir on every [`Dir::read`] call -- matching how `BtrfsLeafNodeIter`
//! walks a copy of one block's item array rather than re-touching the
//! backing file per item.

use super::Lfs3;
use crate::error::Result;
use crate::fs::Dirent;

pub struct Dir<'bd, 'a> {
    lfs: &'a Lfs3<'bd>,
    entries: Vec<Dirent>,
    cursor: usize,
}

impl<'bd, 'a> Dir<'bd, 'a> {
    pub(crate) fn open(lfs: &'a Lfs3<'bd>, path: &str) -> Result<Self> {
        let entries = lfs.fs.borrow().list(lfs.bd, path)?;
        Ok(Dir { lfs, entries, cursor: 0 })
    }

    pub fn read(&mut self) -> Result<Option<Dirent>> {
        let e = self.entries.get(self.cursor).cloned();
        if e.is_some() {
            self.cursor += 1;
        }
        Ok(e)
    }

    pub fn tell(&self) -> usize {
        self.cursor
    }

    pub fn seek(&mut self, off: usize) {
        self.cursor = off.min(self.entries.len());
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}
