//! Block device abstraction (spec §6).
//!
//! This is the narrow contract the rest of the crate is built against:
//! read / program / erase / sync, with an erase-before-program contract
//! and undefined post-erase contents. Concrete backends are external
//! collaborators per spec §1; only a RAM backend (used pervasively by
//! tests) and a simple file backend ship here.

pub mod file;
pub mod ram;

pub use file::FileBlockDevice;
pub use ram::RamBlockDevice;

use crate::error::Result;

/// A block address. Matches `block` in spec §3.
pub type Block = u32;

/// Four callbacks plus an (optional, caller-supplied) lock pair, per
/// spec §6. The lock pair is modeled at the `fs` layer instead of here,
/// since it brackets whole public operations rather than individual
/// block accesses.
pub trait BlockDevice {
    /// Total number of blocks addressable on this device. The
    /// filesystem's configured `block_count` may be less than this (see
    /// `fs_grow`).
    fn block_count(&self) -> u32;

    /// Size in bytes of one erase block.
    fn block_size(&self) -> u32;

    /// Read `buf.len()` bytes starting at `off` within `block`. Must
    /// yield deterministic data across repeated reads of the same
    /// location, even if that location was never programmed.
    fn read(&self, block: Block, off: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `data` at `off` within `block`. May only be called on
    /// bytes that have been erased (and not yet programmed) since the
    /// last erase of `block`. Implementations are free to return
    /// `Error::Corrupt` to simulate a bad block.
    fn prog(&self, block: Block, off: u32, data: &[u8]) -> Result<()>;

    /// Erase a whole block. Leaves its contents undefined (in practice,
    /// the RAM backend fills with 0xff as real NOR/NAND flash does).
    fn erase(&self, block: Block) -> Result<()>;

    /// Durability barrier: once this returns `Ok`, every prior `prog`
    /// and `erase` is persistent.
    fn sync(&self) -> Result<()>;
}
