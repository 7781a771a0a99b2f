//! `bshrub`: the file body representation (spec §4.4), which grows
//! through three states as a file gets bigger -- inline bytes carried
//! directly by the directory entry, a "shrub" (a small btree trunk
//! embedded in the owning mdir), and finally an independent btree once
//! the shrub would no longer fit comfortably inline.
//!
//! Promotion is one-directional on write (inline -> shrub -> btree) and
//! `truncate`/`fruncate` never demote back down; spec §4.4 only requires
//! that reads/writes be representation-transparent to callers, not that
//! a file shrink back to a cheaper representation once grown.

pub mod bptr;
pub mod btree;
pub mod shrub;

use crate::alloc::Allocator;
use crate::bd::{Block, BlockDevice};
use crate::config::Config;
use crate::error::{Error, Result};
use btree::Btree;
use shrub::Shrub;

#[derive(Debug, Clone, PartialEq)]
pub enum Bshrub {
    Empty,
    Inline(Vec<u8>),
    Shrub(Shrub),
    Btree(Btree),
}

impl Default for Bshrub {
    fn default() -> Self {
        Bshrub::Empty
    }
}

impl Bshrub {
    pub fn size(&self) -> u32 {
        match self {
            Bshrub::Empty => 0,
            Bshrub::Inline(data) => data.len() as u32,
            Bshrub::Shrub(s) => s.0.size,
            Bshrub::Btree(t) => t.size,
        }
    }

    pub fn read(&self, bd: &dyn BlockDevice, off: u32, len: u32) -> Result<Vec<u8>> {
        match self {
            Bshrub::Empty => {
                if off + len > 0 {
                    return Err(Error::Range);
                }
                Ok(Vec::new())
            }
            Bshrub::Inline(data) => {
                if off + len > data.len() as u32 {
                    return Err(Error::Range);
                }
                Ok(data[off as usize..(off + len) as usize].to_vec())
            }
            Bshrub::Shrub(s) => s.0.read(bd, off, len),
            Bshrub::Btree(t) => t.read(bd, off, len),
        }
    }

    pub fn write(&mut self, bd: &dyn BlockDevice, alloc: &mut dyn Allocator, cfg: &Config, off: u32, data: &[u8]) -> Result<()> {
        let new_end = off + data.len() as u32;

        if let Bshrub::Empty = self {
            if new_end <= cfg.inline_size {
                let mut buf = vec![0u8; new_end as usize];
                buf[off as usize..].copy_from_slice(data);
                *self = Bshrub::Inline(buf);
                return Ok(());
            }
            *self = Bshrub::Shrub(Shrub::new());
        }

        if let Bshrub::Inline(buf) = self {
            if new_end <= cfg.inline_size {
                if new_end as usize > buf.len() {
                    buf.resize(new_end as usize, 0);
                }
                buf[off as usize..new_end as usize].copy_from_slice(data);
                return Ok(());
            }
            // outgrew inline: seed a shrub with the existing bytes first.
            let mut shrub = Shrub::new();
            shrub.0.write(0, buf)?;
            *self = Bshrub::Shrub(shrub);
        }

        match self {
            Bshrub::Shrub(s) => {
                s.0.absorb_blocks(bd)?;
                s.0.write(off, data)?;
                s.0.crystallize(bd, alloc, cfg)?;
                if s.should_promote(cfg) {
                    let promoted = s.0.clone();
                    *self = Bshrub::Btree(promoted);
                }
                Ok(())
            }
            Bshrub::Btree(t) => {
                t.absorb_blocks(bd)?;
                t.write(off, data)?;
                t.crystallize(bd, alloc, cfg)?;
                Ok(())
            }
            Bshrub::Empty | Bshrub::Inline(_) => unreachable!("handled above"),
        }
    }

    pub fn truncate(&mut self, alloc: &mut dyn Allocator, new_size: u32) -> Result<()> {
        match self {
            Bshrub::Empty => {
                if new_size > 0 {
                    return Err(Error::Inval);
                }
                Ok(())
            }
            Bshrub::Inline(data) => {
                data.truncate(new_size as usize);
                if new_size as usize > data.len() {
                    data.resize(new_size as usize, 0);
                }
                Ok(())
            }
            Bshrub::Shrub(s) => s.0.truncate(alloc, new_size),
            Bshrub::Btree(t) => t.truncate(alloc, new_size),
        }
    }

    pub fn fruncate_front(&mut self, alloc: &mut dyn Allocator, n: u32) -> Result<()> {
        match self {
            Bshrub::Empty => Ok(()),
            Bshrub::Inline(data) => {
                let n = (n as usize).min(data.len());
                data.drain(0..n);
                Ok(())
            }
            Bshrub::Shrub(s) => s.0.fruncate_front(alloc, n),
            Bshrub::Btree(t) => t.fruncate_front(alloc, n),
        }
    }

    pub fn is_fully_crystallized(&self) -> bool {
        match self {
            Bshrub::Btree(t) => t.is_fully_crystallized(),
            Bshrub::Shrub(s) => s.0.is_fully_crystallized(),
            _ => false,
        }
    }

    /// Every whole-block leaf this body references, for traversal (spec
    /// §4.6) and usage accounting.
    pub fn block_refs(&self) -> Vec<Block> {
        match self {
            Bshrub::Btree(t) => t.block_refs().collect(),
            Bshrub::Shrub(s) => s.0.block_refs().collect(),
            Bshrub::Empty | Bshrub::Inline(_) => Vec::new(),
        }
    }
}
