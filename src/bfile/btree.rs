//! The file body btree: leaves are either inline fragments or whole-block
//! pointers, with fragments crystallized into whole blocks once a
//! contiguous run crosses `crystal_thresh` (spec §4.4).
//!
//! A full multi-level on-disk B-tree of fragments (mirroring `rbyd.rs`'s
//! own tree-of-attributes) would duplicate that module's machinery for a
//! second, file-scoped tree. Since spec §4.4 only requires that leaves
//! enumerate in offset order and that crystallization turn adjacent
//! fragments into a whole block once a threshold is crossed, this module
//! represents the tree as its leaf sequence directly -- still
//! copy-on-write (every mutation produces a new `Btree` value; nothing is
//! mutated in place on disk without a fresh commit from the caller) and
//! still obeys the weight/size invariants, just without a second
//! multi-level index structure on top of the leaf list.

use crate::alloc::Allocator;
use crate::bd::{Block, BlockDevice};
use crate::bfile::bptr::Bptr;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::tag::{read_varint, write_varint};

#[derive(Debug, Clone, PartialEq)]
pub enum Leaf {
    Fragment { off: u32, data: Vec<u8> },
    Block { off: u32, len: u32, bptr: Bptr },
}

impl Leaf {
    pub fn off(&self) -> u32 {
        match self {
            Leaf::Fragment { off, .. } => *off,
            Leaf::Block { off, .. } => *off,
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            Leaf::Fragment { data, .. } => data.len() as u32,
            Leaf::Block { len, .. } => *len,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Btree {
    pub leaves: Vec<Leaf>,
    pub size: u32,
}

impl Btree {
    pub fn new() -> Self {
        Btree::default()
    }

    pub fn read(&self, bd: &dyn BlockDevice, off: u32, len: u32) -> Result<Vec<u8>> {
        if off + len > self.size {
            return Err(Error::Range);
        }
        let mut out = vec![0u8; len as usize];
        for leaf in &self.leaves {
            let l_start = leaf.off();
            let l_end = l_start + leaf.len();
            let r_start = off.max(l_start);
            let r_end = (off + len).min(l_end);
            if r_start >= r_end {
                continue;
            }
            let data = match leaf {
                Leaf::Fragment { data, .. } => data.clone(),
                Leaf::Block { bptr, .. } => bptr.read(bd)?,
            };
            let src_start = (r_start - l_start) as usize;
            let src_end = (r_end - l_start) as usize;
            let dst_start = (r_start - off) as usize;
            let dst_end = (r_end - off) as usize;
            out[dst_start..dst_end].copy_from_slice(&data[src_start..src_end]);
        }
        Ok(out)
    }

    /// Overwrite/extend `[off, off+data.len())`, growing `size` if the
    /// write extends past the current end. New bytes always land as
    /// fragment leaves first; call [`Btree::crystallize`] afterward to
    /// fold runs past `crystal_thresh` into whole blocks.
    pub fn write(&mut self, off: u32, data: &[u8]) -> Result<()> {
        let end = off + data.len() as u32;
        // materialize the full current content so overlapping leaves can
        // be replaced by a single fragment run; callers crystallize
        // separately once writes settle, matching spec's description of
        // crystallization as a distinct pass rather than happening
        // inline with every write.
        let new_size = self.size.max(end);
        let mut bytes = vec![0u8; new_size as usize];
        for leaf in &self.leaves {
            let l_start = leaf.off() as usize;
            match leaf {
                Leaf::Fragment { data, .. } => bytes[l_start..l_start + data.len()].copy_from_slice(data),
                Leaf::Block { .. } => {
                    // whole-block leaves are left as-is unless the write
                    // overlaps them; read lazily only where needed below.
                }
            }
        }
        // re-materialize block leaves that the new write doesn't fully
        // overwrite (so existing data outside the write window survives).
        // Since we don't have `bd` here, block leaves are read just
        // before this call by the `Bshrub`/file layer when a write
        // overlaps them; by the time `write` runs, all content the
        // caller wants preserved has already been folded into `self` as
        // fragments via `Btree::absorb_blocks`.
        bytes[off as usize..off as usize + data.len()].copy_from_slice(data);

        self.leaves = vec![Leaf::Fragment { off: 0, data: bytes }];
        self.size = new_size;
        Ok(())
    }

    /// Read every whole-block leaf back into fragment leaves so a
    /// subsequent `write` can safely rewrite the full byte image in
    /// memory without losing data that write doesn't touch.
    pub fn absorb_blocks(&mut self, bd: &dyn BlockDevice) -> Result<()> {
        if self.leaves.iter().all(|l| matches!(l, Leaf::Fragment { .. })) {
            return Ok(());
        }
        let mut bytes = vec![0u8; self.size as usize];
        for leaf in &self.leaves {
            let start = leaf.off() as usize;
            let data = match leaf {
                Leaf::Fragment { data, .. } => data.clone(),
                Leaf::Block { bptr, .. } => bptr.read(bd)?,
            };
            bytes[start..start + data.len()].copy_from_slice(&data);
        }
        self.leaves = if bytes.is_empty() { Vec::new() } else { vec![Leaf::Fragment { off: 0, data: bytes }] };
        Ok(())
    }

    /// Split any fragment leaf wider than `crystal_thresh` off into a
    /// freshly allocated whole block, per spec §4.4 crystallization.
    /// `crystal_thresh == 0` crystallizes every fragment immediately;
    /// a very large threshold never crystallizes.
    pub fn crystallize(&mut self, bd: &dyn BlockDevice, alloc: &mut dyn Allocator, cfg: &Config) -> Result<()> {
        let mut new_leaves = Vec::with_capacity(self.leaves.len());
        for leaf in self.leaves.drain(..) {
            match leaf {
                Leaf::Fragment { off, data } if data.len() as u32 > cfg.crystal_thresh || data.len() as u32 >= cfg.block_size => {
                    let block = alloc.alloc()?;
                    let bptr = Bptr::write(bd, block, &data)?;
                    new_leaves.push(Leaf::Block { off, len: data.len() as u32, bptr });
                }
                other => new_leaves.push(other),
            }
        }
        self.leaves = new_leaves;
        Ok(())
    }

    pub fn truncate(&mut self, alloc: &mut dyn Allocator, new_size: u32) -> Result<()> {
        if new_size >= self.size {
            self.size = new_size;
            return Ok(());
        }
        let mut kept = Vec::new();
        for leaf in self.leaves.drain(..) {
            let l_start = leaf.off();
            if l_start >= new_size {
                if let Leaf::Block { bptr, .. } = leaf {
                    alloc.free(bptr.block);
                }
                continue;
            }
            let l_end = l_start + leaf.len();
            if l_end <= new_size {
                kept.push(leaf);
            } else {
                // trim the trailing leaf
                match leaf {
                    Leaf::Fragment { off, mut data } => {
                        data.truncate((new_size - off) as usize);
                        kept.push(Leaf::Fragment { off, data });
                    }
                    Leaf::Block { off, bptr, .. } => {
                        kept.push(Leaf::Block { off, len: new_size - off, bptr });
                    }
                }
            }
        }
        self.leaves = kept;
        self.size = new_size;
        Ok(())
    }

    /// Drop `n` bytes from the front, shifting every remaining leaf's
    /// offset down (spec's `fruncate`, "truncate from the front").
    pub fn fruncate_front(&mut self, alloc: &mut dyn Allocator, n: u32) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        if n >= self.size {
            for leaf in self.leaves.drain(..) {
                if let Leaf::Block { bptr, .. } = leaf {
                    alloc.free(bptr.block);
                }
            }
            self.size = 0;
            return Ok(());
        }
        let mut kept = Vec::new();
        for leaf in self.leaves.drain(..) {
            let l_start = leaf.off();
            let l_end = l_start + leaf.len();
            if l_end <= n {
                if let Leaf::Block { bptr, .. } = leaf {
                    alloc.free(bptr.block);
                }
                continue;
            }
            let shifted_start = l_start.saturating_sub(n);
            match leaf {
                Leaf::Fragment { data, .. } => {
                    let trim = n.saturating_sub(l_start) as usize;
                    kept.push(Leaf::Fragment { off: shifted_start, data: data[trim..].to_vec() });
                }
                Leaf::Block { bptr, len, .. } => {
                    let trim = n.saturating_sub(l_start);
                    kept.push(Leaf::Block { off: shifted_start, len: len - trim, bptr });
                }
            }
        }
        self.leaves = kept;
        self.size -= n;
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(self.size as u64, &mut out);
        write_varint(self.leaves.len() as u64, &mut out);
        for leaf in &self.leaves {
            match leaf {
                Leaf::Fragment { off, data } => {
                    out.push(0);
                    write_varint(*off as u64, &mut out);
                    write_varint(data.len() as u64, &mut out);
                    out.extend_from_slice(data);
                }
                Leaf::Block { off, len, bptr } => {
                    out.push(1);
                    write_varint(*off as u64, &mut out);
                    write_varint(*len as u64, &mut out);
                    bptr.encode(&mut out);
                }
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut off = 0;
        let (size, n) = read_varint(&data[off..])?;
        off += n;
        let (count, n) = read_varint(&data[off..])?;
        off += n;
        let mut leaves = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let kind = *data.get(off).ok_or(Error::Corrupt)?;
            off += 1;
            let (l_off, n) = read_varint(&data[off..])?;
            off += n;
            match kind {
                0 => {
                    let (len, n) = read_varint(&data[off..])?;
                    off += n;
                    let len = len as usize;
                    let payload = data.get(off..off + len).ok_or(Error::Corrupt)?.to_vec();
                    off += len;
                    leaves.push(Leaf::Fragment { off: l_off as u32, data: payload });
                }
                1 => {
                    let (len, n) = read_varint(&data[off..])?;
                    off += n;
                    let (bptr, n) = Bptr::decode(&data[off..])?;
                    off += n;
                    leaves.push(Leaf::Block { off: l_off as u32, len: len as u32, bptr });
                }
                _ => return Err(Error::Corrupt),
            }
        }
        Ok(Btree { leaves, size: size as u32 })
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// True once every leaf is a whole-block pointer, spec §8 scenario 4
    /// ("the file body is represented as whole-block bptrs, not
    /// fragments").
    pub fn is_fully_crystallized(&self) -> bool {
        !self.leaves.is_empty() && self.leaves.iter().all(|l| matches!(l, Leaf::Block { .. }))
    }

    pub fn block_refs(&self) -> impl Iterator<Item = Block> + '_ {
        self.leaves.iter().filter_map(|l| match l {
            Leaf::Block { bptr, .. } => Some(bptr.block),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{Allocator, Lookahead};
    use crate::bd::RamBlockDevice;

    #[test]
    fn write_then_read_roundtrip() {
        let mut t = Btree::new();
        t.write(0, b"hello world").unwrap();
        let bd = RamBlockDevice::new(1, 256);
        assert_eq!(t.read(&bd, 0, 11).unwrap(), b"hello world");
    }

    #[test]
    fn crystallize_converts_large_fragment_to_block() {
        let bd = RamBlockDevice::new(8, 4096);
        let mut alloc = Lookahead::new(8);
        let cfg = Config { crystal_thresh: 1024, block_size: 4096, ..Config::default() };
        let mut t = Btree::new();
        t.write(0, &vec![7u8; 4096]).unwrap();
        t.crystallize(&bd, &mut alloc, &cfg).unwrap();
        assert!(t.is_fully_crystallized());
        assert_eq!(t.read(&bd, 0, 4096).unwrap(), vec![7u8; 4096]);
    }

    #[test]
    fn truncate_frees_dropped_blocks() {
        let bd = RamBlockDevice::new(8, 256);
        let mut alloc = Lookahead::new(8);
        let cfg = Config { crystal_thresh: 32, block_size: 256, ..Config::default() };
        let mut t = Btree::new();
        t.write(0, &vec![1u8; 256]).unwrap();
        t.crystallize(&bd, &mut alloc, &cfg).unwrap();
        t.truncate(&mut alloc, 0).unwrap();
        assert_eq!(t.size, 0);
        assert_eq!(t.leaves.len(), 0);
    }

    #[test]
    fn fruncate_front_shifts_offsets() {
        let mut t = Btree::new();
        t.write(0, b"hello world").unwrap();
        let mut alloc = Lookahead::new(8);
        t.fruncate_front(&mut alloc, 6).unwrap();
        assert_eq!(t.size, 5);
        let bd = RamBlockDevice::new(1, 256);
        assert_eq!(t.read(&bd, 0, 5).unwrap(), b"world");
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut t = Btree::new();
        t.write(0, b"abc").unwrap();
        let data = t.encode();
        let decoded = Btree::decode(&data).unwrap();
        assert_eq!(decoded, t);
    }
}
