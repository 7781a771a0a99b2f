//! Filesystem-wide read cache (`rcache`) and program cache (`pcache`),
//! plus the per-file cache each open file owns (spec §2 `cache`).
//!
//! Caches are aligned to the device's `read_size`/`prog_size` the way
//! `load_virt_block` always operates on whole `nodesize` blocks rather
//! than ad hoc byte ranges -- every access here snaps to an aligned
//! window before touching the block device.

use crate::bd::{Block, BlockDevice};
use crate::error::Result;

/// A single cached, aligned window into one block.
#[derive(Debug, Clone)]
struct Window {
    block: Block,
    off: u32,
    data: Vec<u8>,
}

/// Generic aligned cache used for both `rcache` and per-file read caches.
/// `pcache` additionally tracks a dirty flag so a commit knows whether it
/// must flush before switching canonical blocks.
pub struct Cache {
    align: u32,
    size: u32,
    window: Option<Window>,
    dirty: bool,
}

impl Cache {
    pub fn new(align: u32, size: u32) -> Self {
        Cache { align, size, window: None, dirty: false }
    }

    fn aligned_start(&self, off: u32) -> u32 {
        off - (off % self.align)
    }

    /// Invalidate any cached window overlapping `[off, off+len)` of
    /// `block`. Called on every `prog`/`erase`, per spec §5 "cache
    /// coherence is maintained by invalidating overlapping cache ranges".
    pub fn invalidate_range(&mut self, block: Block, off: u32, len: u32) {
        if let Some(w) = &self.window {
            if w.block == block {
                let w_end = w.off + w.data.len() as u32;
                if off < w_end && off + len > w.off {
                    self.window = None;
                    self.dirty = false;
                }
            }
        }
    }

    pub fn invalidate_block(&mut self, block: Block) {
        if let Some(w) = &self.window {
            if w.block == block {
                self.window = None;
                self.dirty = false;
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        self.window = None;
        self.dirty = false;
    }

    /// Read `buf` from `block` at `off`, refilling the cache window from
    /// `bd` on a miss.
    pub fn read(&mut self, bd: &dyn BlockDevice, block: Block, off: u32, buf: &mut [u8]) -> Result<()> {
        let need_refill = match &self.window {
            Some(w) if w.block == block && off >= w.off && off + buf.len() as u32 <= w.off + w.data.len() as u32 => false,
            _ => true,
        };
        if need_refill {
            let start = self.aligned_start(off);
            let len = self.size.min(bd.block_size() - start);
            let mut data = vec![0u8; len as usize];
            bd.read(block, start, &mut data)?;
            self.window = Some(Window { block, off: start, data });
            self.dirty = false;
        }
        let w = self.window.as_ref().unwrap();
        let rel = (off - w.off) as usize;
        buf.copy_from_slice(&w.data[rel..rel + buf.len()]);
        Ok(())
    }

    /// Stage `data` into the program cache at `block`/`off`, flushing the
    /// previous window first if it belongs to a different block.
    pub fn stage(&mut self, bd: &dyn BlockDevice, block: Block, off: u32, data: &[u8]) -> Result<()> {
        let needs_flush = match &self.window {
            Some(w) if w.block == block => false,
            Some(_) => true,
            None => false,
        };
        if needs_flush {
            self.flush(bd)?;
        }
        if self.window.is_none() {
            self.window = Some(Window { block, off, data: Vec::new() });
        }
        let w = self.window.as_mut().unwrap();
        let rel_start = (off - w.off) as usize;
        let rel_end = rel_start + data.len();
        if rel_end > w.data.len() {
            w.data.resize(rel_end, 0xff);
        }
        w.data[rel_start..rel_end].copy_from_slice(data);
        self.dirty = true;
        Ok(())
    }

    pub fn flush(&mut self, bd: &dyn BlockDevice) -> Result<()> {
        if self.dirty {
            if let Some(w) = &self.window {
                bd.prog(w.block, w.off, &w.data)?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bd::RamBlockDevice;

    #[test]
    fn read_cache_hits_on_overlapping_window() {
        let bd = RamBlockDevice::new(2, 256);
        bd.erase(0).unwrap();
        bd.prog(0, 0, b"hello world").unwrap();

        let mut cache = Cache::new(16, 16);
        let mut buf = [0u8; 5];
        cache.read(&bd, 0, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        // second read should hit the cached window without touching the
        // backing device again for correctness (not directly observable,
        // but the cached bytes must still match).
        let mut buf2 = [0u8; 5];
        cache.read(&bd, 0, 6, &mut buf2).unwrap();
        assert_eq!(&buf2, b"world");
    }

    #[test]
    fn invalidate_range_drops_overlapping_window() {
        let bd = RamBlockDevice::new(1, 256);
        bd.erase(0).unwrap();
        bd.prog(0, 0, b"hello").unwrap();
        let mut cache = Cache::new(16, 16);
        let mut buf = [0u8; 5];
        cache.read(&bd, 0, 0, &mut buf).unwrap();
        cache.invalidate_range(0, 0, 16);
        assert!(cache.window.is_none());
    }
}
