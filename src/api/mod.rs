//! The public surface (spec §6): a mounted filesystem handle plus the
//! `File`/`Dir` handles it opens.
//!
//! Mirrors the `BtrfsFilesystem`/`ImageInfo` split between "one handle
//! owning the block device" and "small cursor types borrowed from it"
//! (`btrfs.rs`), except this crate's handle is read-write and uses
//! `RefCell` rather than `&mut` borrows so multiple open `File`/`Dir`
//! handles can coexist the way spec §5's cooperative (non-reentrant,
//! single-threaded) locking model expects: every public call here takes
//! the lock for its duration and releases it before returning, so two
//! handles can interleave calls but never run inside each other.

pub mod attr;
pub mod dir;
pub mod file;

use crate::bd::BlockDevice;
use crate::config::Config;
use crate::error::Result;
use crate::fs::{Dirent, Fs};
use std::cell::RefCell;

pub use dir::Dir;
pub use file::File;

/// A mounted filesystem. Borrows its block device for the mount's whole
/// lifetime, per spec §6 (the device must outlive every open handle).
pub struct Lfs3<'bd> {
    bd: &'bd dyn BlockDevice,
    fs: RefCell<Fs>,
}

impl<'bd> Lfs3<'bd> {
    pub fn format(bd: &'bd dyn BlockDevice, cfg: Config) -> Result<Self> {
        let fs = Fs::format(bd, cfg)?;
        Ok(Lfs3 { bd, fs: RefCell::new(fs) })
    }

    pub fn mount(bd: &'bd dyn BlockDevice, cfg: Config) -> Result<Self> {
        let fs = Fs::mount(bd, cfg)?;
        Ok(Lfs3 { bd, fs: RefCell::new(fs) })
    }

    /// Every write this crate issues is already durable by the time the
    /// call that issued it returns (spec's commit protocol has no
    /// write-back cache to flush), so unmount has nothing left to do
    /// beyond dropping the handle. Kept as an explicit call so callers
    /// ported from the reference API don't need a special case.
    pub fn unmount(self) -> Result<()> {
        Ok(())
    }

    pub fn open(&self, path: &str) -> Result<File<'bd, '_>> {
        file::File::open(self, path)
    }

    pub fn create(&self, path: &str) -> Result<File<'bd, '_>> {
        self.fs.borrow_mut().create(self.bd, path)?;
        file::File::open(self, path)
    }

    pub fn open_dir(&self, path: &str) -> Result<Dir<'bd, '_>> {
        dir::Dir::open(self, path)
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.fs.borrow_mut().mkdir(self.bd, path)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        self.fs.borrow_mut().remove(self.bd, path)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.fs.borrow_mut().rename(self.bd, from, to)
    }

    pub fn stat(&self, path: &str) -> Result<Dirent> {
        self.fs.borrow().stat(self.bd, path)
    }

    pub fn usage(&self) -> Result<(u32, u32)> {
        self.fs.borrow().usage(self.bd)
    }

    pub fn mkconsistent(&self) -> Result<()> {
        self.fs.borrow_mut().mkconsistent(self.bd)
    }

    pub fn ckmeta(&self) -> Result<()> {
        self.fs.borrow().ckmeta(self.bd)
    }

    pub fn ckdata(&self) -> Result<()> {
        self.fs.borrow().ckdata(self.bd)
    }

    pub fn gc(&self) -> Result<()> {
        self.fs.borrow_mut().gc(self.bd)
    }

    pub fn grow(&self, new_block_count: u32) -> Result<()> {
        self.fs.borrow_mut().grow(self.bd, new_block_count)
    }

    pub fn traverse(&self, mode: crate::trv::Mode) -> Result<()> {
        match mode {
            crate::trv::Mode::MkConsistent => self.mkconsistent(),
            crate::trv::Mode::CkMeta => self.ckmeta(),
            crate::trv::Mode::CkData => self.ckdata(),
            crate::trv::Mode::Compact | crate::trv::Mode::Gc => self.gc(),
            crate::trv::Mode::Lookahead | crate::trv::Mode::Full => self.ckdata(),
        }
    }
}
