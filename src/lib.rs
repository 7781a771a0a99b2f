//! A power-loss-resilient, wear-leveling filesystem for small flash
//! devices, modeled on littlefs's `rbyd`-based metadata log.
//!
//! Layering, bottom to top:
//!
//! - [`bd`] -- the block device contract plus a RAM and file backend.
//! - [`cksum`] / [`cache`] / [`tag`] -- the primitives the log is built
//!   from: a CRC-32C accumulator, an aligned read/program cache, and the
//!   varint-framed attribute tag format.
//! - [`rbyd`] -- one copy-on-write tagged log inside a single block.
//! - [`mdir`] -- a pair of rbyds forming an atomically-committed
//!   journal, carrying the filesystem's global recovery state.
//! - [`mtree`] -- the index of mdirs by `mid`.
//! - [`bfile`] -- a file's body: inline bytes, a small embedded "shrub",
//!   or an independent btree of fragment/whole-block leaves.
//! - [`alloc`] / [`trv`] -- block allocation and resumable traversal.
//! - [`fs`] -- mount/format/directory-tree orchestration tying all of
//!   the above together.
//! - [`api`] -- the public `Lfs3`/`File`/`Dir` handles.

pub mod alloc;
pub mod api;
pub mod bd;
pub mod bfile;
pub mod cache;
pub mod cksum;
pub mod config;
pub mod error;
pub mod fs;
pub mod mdir;
pub mod mtree;
pub mod path;
pub mod rbyd;
pub mod tag;
pub mod trv;

pub use api::{Dir, File, Lfs3};
pub use config::Config;
pub use error::{Error, Result};
