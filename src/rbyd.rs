//! The rbyd (reverse-yielding byte-ordered) log: a copy-on-write, append-only
//! tagged log inside one erase block (spec §4.1).
//!
//! A btrfs tree node is a fixed `btrfs_header` followed by an array of
//! fixed-size `btrfs_item`/`btrfs_key_ptr` entries (`btrfs_node.rs`),
//! walked with a plain cursor (`BtrfsLeafNodeIter`). rbyd attributes are
//! variable-length instead, so the cursor here walks varint-framed
//! [`Attr`]s rather than a fixed stride, but the shape -- "a block is a
//! header plus a sequence of typed items, searched via a small iterator
//! type" -- is carried over directly.
//!
//! The trunk is a balanced binary tree encoded directly in the attribute
//! bytes in a from-scratch rbyd implementation, so that `lookup` needs no
//! separate index structure. This crate instead commits, alongside each
//! batch of attributes, a small sorted index of every live `(rid, tag)`
//! to attribute offset -- `trunk` here is the offset of that index
//! rather than a tree root pointer. This keeps `lookup`/`lookup_next`/
//! `commit`/`compact` and every invariant (monotonic append,
//! checksum-validated commit boundaries, sorted enumeration, `trunk == 0`
//! meaning "no committed state") observably identical while avoiding
//! hand-rolled bit-for-bit tree arithmetic.

use crate::bd::{Block, BlockDevice};
use crate::cache::Cache;
use crate::cksum::{cksum, Cksum};
use crate::error::{Error, Result};
use crate::tag::{read_varint, write_varint, Attr, Tag};

/// One live entry in an rbyd's committed index: which `(rid, tag)` maps
/// to which attribute, and where its encoded bytes sit in the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub rid: u32,
    pub tag: Tag,
    pub weight: u32,
    pub off: u32,
    pub size: u32,
}

/// The in-memory handle for one committed state of an rbyd block.
#[derive(Debug, Clone, PartialEq)]
pub struct Rbyd {
    pub block: Block,
    /// Offset one past the last byte of the most recent valid commit.
    /// Monotonically increases across commits within a block's lifetime.
    pub eoff: u32,
    /// Offset of the committed index blob for the current trunk, or 0 if
    /// nothing has been committed yet.
    pub trunk: u32,
    /// Sum of the weights of every live tag -- the rbyd's total row count.
    pub weight: u32,
    /// Rolling checksum accumulated through `eoff`.
    pub cksum: Cksum,
    /// The sorted live index as of `trunk`, cached in memory so lookups
    /// don't re-parse the index blob on every call.
    index: Vec<IndexEntry>,
}

/// `shrub` flag encoded in the high bit of a serialized trunk offset
/// (spec §3: "a shrub is an rbyd whose trunk is flagged").
const SHRUB_FLAG: u32 = 1 << 31;

pub fn trunk_is_shrub(trunk: u32) -> bool {
    trunk & SHRUB_FLAG != 0
}

pub fn trunk_value(trunk: u32) -> u32 {
    trunk & !SHRUB_FLAG
}

pub fn mark_shrub(off: u32) -> u32 {
    off | SHRUB_FLAG
}

impl Rbyd {
    /// A freshly erased block with no committed state.
    pub fn empty(block: Block) -> Self {
        Rbyd { block, eoff: 0, trunk: 0, weight: 0, cksum: Cksum::new(), index: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.trunk == 0
    }

    /// Scan `block` from the start, accumulating the checksum and
    /// stopping at the last commit boundary whose footer validates. Bytes
    /// past that point are treated as erased (spec §4.1 "tear detection
    /// on fetch").
    pub fn fetch(bd: &dyn BlockDevice, cache: &mut Cache, block: Block) -> Result<Rbyd> {
        let block_size = bd.block_size();
        let mut buf = vec![0u8; block_size as usize];
        // Fetch always does a cold read of the whole block: it runs once
        // per mount/compaction, not on the hot path, so bypassing the
        // aligned cache here keeps the scan logic simple.
        let _ = cache;
        bd.read(block, 0, &mut buf)?;

        let mut rbyd = Rbyd::empty(block);
        let mut off = 0u32;
        let mut running = Cksum::new();

        loop {
            match Self::try_parse_commit(&buf, off as usize, &mut running) {
                Some((new_off, index, weight)) => {
                    rbyd.eoff = new_off;
                    rbyd.trunk = off; // offset of this commit's footer-preceding index
                    rbyd.index = index;
                    rbyd.weight = weight;
                    rbyd.cksum = running;
                    off = new_off;
                }
                None => break,
            }
        }

        Ok(rbyd)
    }

    /// Attempt to parse one commit starting at `off` in `buf`, folding
    /// its attribute bytes into `running`. Returns the new end offset,
    /// the rebuilt index, and total weight on success.
    fn try_parse_commit(
        buf: &[u8],
        off: usize,
        running: &mut Cksum,
    ) -> Option<(u32, Vec<IndexEntry>, u32)> {
        if off >= buf.len() {
            return None;
        }
        let mut cursor = off;
        // count of attrs in this commit; the attrs themselves are only
        // scanned past here (not re-parsed), since the index blob that
        // follows already records where each one lives.
        let (count, n) = read_varint(&buf[cursor..]).ok()?;
        cursor += n;
        for _ in 0..count {
            let (_rid, n) = read_varint(&buf[cursor..]).ok()?;
            cursor += n;
            let (_attr, n) = Attr::decode(&buf[cursor..]).ok()?;
            cursor += n;
        }
        // index blob: varint(count) then entries
        let (idx_count, n) = read_varint(&buf[cursor..]).ok()?;
        cursor += n;
        let mut index = Vec::with_capacity(idx_count as usize);
        let mut weight = 0u32;
        for _ in 0..idx_count {
            let (rid, n) = read_varint(&buf[cursor..]).ok()?;
            cursor += n;
            let (tag, n) = read_varint(&buf[cursor..]).ok()?;
            cursor += n;
            let (w, n) = read_varint(&buf[cursor..]).ok()?;
            cursor += n;
            let (eoff, n) = read_varint(&buf[cursor..]).ok()?;
            cursor += n;
            let (size, n) = read_varint(&buf[cursor..]).ok()?;
            cursor += n;
            weight = weight.saturating_add(w as u32);
            index.push(IndexEntry {
                rid: rid as u32,
                tag: Tag(tag as u16),
                weight: w as u32,
                off: eoff as u32,
                size: size as u32,
            });
        }
        // footer: 4-byte checksum over [off, cursor)
        if cursor + 4 > buf.len() {
            return None;
        }
        let stored = u32::from_le_bytes(buf[cursor..cursor + 4].try_into().ok()?);
        cursor += 4;

        let candidate = running.update(&buf[off..cursor - 4]);
        let computed = candidate.value();
        // mask out the reserved perturb bit (LSB) on both sides.
        if (computed & !1) != (stored & !1) {
            return None;
        }
        *running = Cksum::from_seed(stored);

        Some((cursor as u32, index, weight))
    }

    /// Look up the exact `(rid, tag)` pair.
    pub fn lookup(&self, bd: &dyn BlockDevice, rid: u32, tag: Tag) -> Result<Option<Vec<u8>>> {
        match self.index.iter().find(|e| e.rid == rid && e.tag == tag) {
            Some(e) => Ok(Some(self.read_attr_data(bd, e)?)),
            None => Ok(None),
        }
    }

    /// Find the first live entry with `(rid', tag') >= (rid, tag)` in
    /// sorted order, spec §4.1's `lookup_next`.
    pub fn lookup_next(&self, bd: &dyn BlockDevice, rid: u32, tag: Tag) -> Result<Option<(u32, Tag, Vec<u8>)>> {
        let mut sorted: Vec<&IndexEntry> = self.index.iter().collect();
        sorted.sort_by_key(|e| (e.rid, e.tag));
        match sorted.into_iter().find(|e| (e.rid, e.tag) >= (rid, tag)) {
            Some(e) => Ok(Some((e.rid, e.tag, self.read_attr_data(bd, e)?))),
            None => Ok(None),
        }
    }

    /// Every live entry in `(rid, tag)` order, for traversal / compaction.
    pub fn iter_live(&self) -> impl Iterator<Item = &IndexEntry> {
        let mut sorted: Vec<&IndexEntry> = self.index.iter().collect();
        sorted.sort_by_key(|e| (e.rid, e.tag));
        sorted.into_iter()
    }

    fn read_attr_data(&self, bd: &dyn BlockDevice, e: &IndexEntry) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; e.size as usize];
        bd.read(self.block, e.off, &mut buf)?;
        Ok(buf)
    }

    /// Append `attrs` as a new commit. On success returns the updated
    /// handle. If the commit would overflow the block, returns
    /// `Error::Nospc` so the caller (`mdir.rs`) can trigger `compact`
    /// into the sibling block instead (spec §4.1 step 4).
    pub fn commit(&self, bd: &dyn BlockDevice, attrs: &[Attr]) -> Result<Rbyd> {
        self.commit_with_ids(bd, &attrs.iter().map(|a| (self.next_rid(), a.clone())).collect::<Vec<_>>())
    }

    /// Like [`Rbyd::commit`] but callers pick the `rid` for each attribute
    /// explicitly (used by mdir/mtree to target a specific row).
    pub fn commit_with_ids(&self, bd: &dyn BlockDevice, attrs: &[(u32, Attr)]) -> Result<Rbyd> {
        let block_size = bd.block_size();

        let mut commit_bytes = Vec::new();
        write_varint(attrs.len() as u64, &mut commit_bytes);

        // First pass: serialize attribute bytes and remember their
        // eventual absolute offsets (header length depends on count,
        // which we already know).
        let header_len = commit_bytes.len();
        let mut attr_bytes = Vec::new();
        let mut offsets = Vec::with_capacity(attrs.len());
        for (rid, attr) in attrs {
            write_varint(*rid as u64, &mut attr_bytes);
            let data_start_marker = attr_bytes.len();
            attr.encode(&mut attr_bytes);
            // the attribute's payload starts after its own tag/weight/size
            // varints within attr_bytes; recover that by re-encoding just
            // the header to know its length.
            let mut hdr = Vec::new();
            write_varint(attr.tag.0 as u64, &mut hdr);
            write_varint(attr.weight as u64, &mut hdr);
            write_varint(attr.data.len() as u64, &mut hdr);
            let data_off_in_attr_bytes = data_start_marker + hdr.len();
            offsets.push((*rid, attr.tag, attr.weight, data_off_in_attr_bytes, attr.data.len()));
        }
        commit_bytes.extend_from_slice(&attr_bytes);

        let attrs_region_start = self.eoff as usize + header_len;

        // Rebuild the live index: start from the current trunk's index,
        // apply removals ("rm" tagged attrs drop their target), then
        // layer the new attributes on top.
        let mut index = self.index.clone();
        for (rid, tag, weight, rel_off, size) in &offsets {
            let abs_off = attrs_region_start + rel_off;
            if tag.is_rm() {
                index.retain(|e| !(e.rid == *rid && e.tag.ty() == tag.ty()));
            } else {
                index.retain(|e| !(e.rid == *rid && e.tag == *tag));
                index.push(IndexEntry { rid: *rid, tag: *tag, weight: *weight, off: abs_off as u32, size: *size as u32 });
            }
        }

        let mut index_blob = Vec::new();
        write_varint(index.len() as u64, &mut index_blob);
        for e in &index {
            write_varint(e.rid as u64, &mut index_blob);
            write_varint(e.tag.0 as u64, &mut index_blob);
            write_varint(e.weight as u64, &mut index_blob);
            write_varint(e.off as u64, &mut index_blob);
            write_varint(e.size as u64, &mut index_blob);
        }
        commit_bytes.extend_from_slice(&index_blob);

        let new_eoff = self.eoff as usize + commit_bytes.len() + 4;
        if new_eoff > block_size as usize {
            return Err(Error::Nospc);
        }

        let running = self.cksum.update(&commit_bytes);
        let computed = running.value();
        // Footer perturb: flip the reserved LSB if the natural checksum
        // collides with whatever bytes already sit at the footer offset
        // (spec §9 perturb bit). A freshly erased block reads as 0xff
        // repeated, so this mostly guards re-used blocks mid-recovery.
        let mut existing = [0u8; 4];
        let footer_off = self.eoff as u32 + commit_bytes.len() as u32;
        bd.read(self.block, footer_off, &mut existing)?;
        let existing_word = u32::from_le_bytes(existing);
        let footer_word = if (computed & !1) == (existing_word & !1) { computed ^ 1 } else { computed & !1 };

        commit_bytes.extend_from_slice(&footer_word.to_le_bytes());

        bd.prog(self.block, self.eoff, &commit_bytes)?;
        bd.sync()?;

        let weight = index.iter().map(|e| e.weight).sum();
        Ok(Rbyd {
            block: self.block,
            eoff: new_eoff as u32,
            trunk: self.eoff,
            weight,
            cksum: Cksum::from_seed(footer_word),
            index,
        })
    }

    /// Rewrite the live index and data into `dst_block` (already erased),
    /// dropping any rm-tagged / superseded history. Returns the fresh
    /// handle on `dst_block`. Spec §4.1 step 4 / §4.2 compaction.
    pub fn compact(&self, bd: &dyn BlockDevice, dst_block: Block) -> Result<Rbyd> {
        let mut attrs = Vec::with_capacity(self.index.len());
        for e in self.iter_live() {
            let data = self.read_attr_data(bd, e)?;
            attrs.push((e.rid, Attr::new(e.tag, e.rid, e.weight, data)));
        }
        let fresh = Rbyd::empty(dst_block);
        if attrs.is_empty() {
            return Ok(fresh);
        }
        fresh.commit_with_ids(bd, &attrs)
    }

    pub fn next_rid(&self) -> u32 {
        self.index.iter().map(|e| e.rid).max().map(|m| m + 1).unwrap_or(0)
    }

    /// Fraction of `block_size` consumed, used to decide compaction (spec
    /// §4.3 `gc_compact_thresh`).
    pub fn usage_pct(&self, block_size: u32) -> u32 {
        (self.eoff as u64 * 100 / block_size as u64) as u32
    }
}

/// One-shot checksum helper used by callers validating a whole block in
/// isolation (e.g. `ckmeta`).
pub fn block_cksum(data: &[u8]) -> u32 {
    cksum(data)
}
