//! In-memory block device, the backend nearly every test in this crate
//! runs against. It also knows how to simulate power loss, which is the
//! one thing a real backend can never do on command.

use std::cell::RefCell;

use crate::bd::{Block, BlockDevice};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailOp {
    Prog,
    Erase,
    Sync,
}

struct Fault {
    op: FailOp,
    /// Number of matching calls to let through before failing the next one.
    remaining: u32,
    /// If true, a failing `prog` still writes the first half of the
    /// buffer before erroring out, simulating a torn write. If false the
    /// call fails before touching storage at all (a clean power-loss
    /// just before the device started).
    torn: bool,
}

struct Inner {
    blocks: Vec<Vec<u8>>,
    /// Tracks which bytes of each block are "erased" (0xff, writable) vs
    /// already programmed, to catch contract violations the way real
    /// NOR/NAND would reject them.
    programmed: Vec<Vec<bool>>,
    erase_count: Vec<u64>,
    fault: Option<Fault>,
    prog_calls: u64,
    erase_calls: u64,
    sync_calls: u64,
}

/// A RAM-backed [`BlockDevice`] with fault injection for power-loss tests.
pub struct RamBlockDevice {
    block_size: u32,
    inner: RefCell<Inner>,
}

impl RamBlockDevice {
    pub fn new(block_count: u32, block_size: u32) -> Self {
        let blocks = vec![vec![0xffu8; block_size as usize]; block_count as usize];
        let programmed = vec![vec![false; block_size as usize]; block_count as usize];
        RamBlockDevice {
            block_size,
            inner: RefCell::new(Inner {
                blocks,
                programmed,
                erase_count: vec![0; block_count as usize],
                fault: None,
                prog_calls: 0,
                erase_calls: 0,
                sync_calls: 0,
            }),
        }
    }

    /// Fail the `n`th-from-now call to `prog`, simulating a torn write
    /// (the first half of the data lands, the rest doesn't, and the
    /// device then reports failure).
    pub fn fail_prog_after(&self, n: u32) {
        self.inner.borrow_mut().fault = Some(Fault { op: FailOp::Prog, remaining: n, torn: true });
    }

    /// Fail the `n`th-from-now call to `prog` cleanly: no bytes land at
    /// all, modeling power loss landing before the device woke up.
    pub fn fail_prog_after_clean(&self, n: u32) {
        self.inner.borrow_mut().fault = Some(Fault { op: FailOp::Prog, remaining: n, torn: false });
    }

    pub fn fail_erase_after(&self, n: u32) {
        self.inner.borrow_mut().fault = Some(Fault { op: FailOp::Erase, remaining: n, torn: false });
    }

    pub fn fail_sync_after(&self, n: u32) {
        self.inner.borrow_mut().fault = Some(Fault { op: FailOp::Sync, remaining: n, torn: false });
    }

    pub fn clear_fault(&self) {
        self.inner.borrow_mut().fault = None;
    }

    pub fn erase_counts(&self) -> Vec<u64> {
        self.inner.borrow().erase_count.clone()
    }

    /// Deep-clone the current contents, used to snapshot a device before
    /// injecting a fault so the test can remount a "crashed" copy while
    /// keeping the live one to compare against.
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.inner.borrow().blocks.clone()
    }

    pub fn restore(&self, blocks: Vec<Vec<u8>>) {
        let mut inner = self.inner.borrow_mut();
        let programmed = blocks.iter().map(|b| b.iter().map(|&v| v != 0xff).collect()).collect();
        inner.blocks = blocks;
        inner.programmed = programmed;
    }

    fn take_fault(&self, op: FailOp) -> Option<bool> {
        let mut inner = self.inner.borrow_mut();
        let trigger = match &mut inner.fault {
            Some(f) if f.op == op => {
                if f.remaining == 0 {
                    let torn = f.torn;
                    inner.fault = None;
                    Some(torn)
                } else {
                    f.remaining -= 1;
                    None
                }
            }
            _ => None,
        };
        trigger
    }
}

impl BlockDevice for RamBlockDevice {
    fn block_count(&self) -> u32 {
        self.inner.borrow().blocks.len() as u32
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read(&self, block: Block, off: u32, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.borrow();
        let block_data = inner.blocks.get(block as usize).ok_or(Error::Range)?;
        let start = off as usize;
        let end = start + buf.len();
        if end > block_data.len() {
            return Err(Error::Range);
        }
        buf.copy_from_slice(&block_data[start..end]);
        Ok(())
    }

    fn prog(&self, block: Block, off: u32, data: &[u8]) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.prog_calls += 1;
            let block_data = inner.programmed.get(block as usize).ok_or(Error::Range)?;
            let start = off as usize;
            let end = start + data.len();
            if end > block_data.len() {
                return Err(Error::Range);
            }
            if block_data[start..end].iter().any(|&p| p) {
                // erase-before-program violation
                return Err(Error::Corrupt);
            }
        }

        if let Some(torn) = self.take_fault(FailOp::Prog) {
            if torn {
                let mut inner = self.inner.borrow_mut();
                let half = data.len() / 2;
                let start = off as usize;
                inner.blocks[block as usize][start..start + half].copy_from_slice(&data[..half]);
                for i in start..start + half {
                    inner.programmed[block as usize][i] = true;
                }
            }
            return Err(Error::Corrupt);
        }

        let mut inner = self.inner.borrow_mut();
        let start = off as usize;
        let end = start + data.len();
        inner.blocks[block as usize][start..end].copy_from_slice(data);
        for i in start..end {
            inner.programmed[block as usize][i] = true;
        }
        Ok(())
    }

    fn erase(&self, block: Block) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.erase_calls += 1;
        }
        if let Some(_torn) = self.take_fault(FailOp::Erase) {
            return Err(Error::Corrupt);
        }
        let mut inner = self.inner.borrow_mut();
        let bs = self.block_size as usize;
        inner.blocks[block as usize] = vec![0xffu8; bs];
        inner.programmed[block as usize] = vec![false; bs];
        inner.erase_count[block as usize] += 1;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.sync_calls += 1;
        }
        if let Some(_) = self.take_fault(FailOp::Sync) {
            return Err(Error::Io);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_then_prog_roundtrip() {
        let bd = RamBlockDevice::new(4, 256);
        bd.erase(0).unwrap();
        bd.prog(0, 0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        bd.read(0, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn prog_without_erase_rejected() {
        let bd = RamBlockDevice::new(1, 256);
        bd.erase(0).unwrap();
        bd.prog(0, 0, b"hello").unwrap();
        assert_eq!(bd.prog(0, 0, b"world"), Err(Error::Corrupt));
    }

    #[test]
    fn torn_write_lands_partial_data() {
        let bd = RamBlockDevice::new(1, 256);
        bd.erase(0).unwrap();
        bd.fail_prog_after(0);
        let res = bd.prog(0, 0, b"helloworld");
        assert_eq!(res, Err(Error::Corrupt));
        let mut buf = [0u8; 10];
        bd.read(0, 0, &mut buf).unwrap();
        assert_eq!(&buf[..5], b"hello");
    }
}
