//! Shrub: a [`Btree`] small enough to live inline in the owning mdir's
//! rbyd as a single `SHRUB_TRUNK` attribute, rather than as an
//! independent multi-block tree (spec §4.4 "shrub" state).
//!
//! A shrub and a full btree share the same leaf representation; the
//! only difference is where the trunk is stored (embedded vs. pointed
//! to by a root attribute) and that a shrub is promoted to a full btree
//! once its encoded size would no longer fit comfortably alongside a
//! directory entry's other attributes.

use crate::bfile::btree::Btree;
use crate::config::Config;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shrub(pub Btree);

impl Shrub {
    pub fn new() -> Self {
        Shrub(Btree::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        self.0.encode()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(Shrub(Btree::decode(data)?))
    }

    /// Once the encoded trunk would take up more than a quarter of a
    /// block, it no longer belongs inline next to a directory entry's
    /// other attributes and should be promoted to an independent btree
    /// with only a root pointer left behind (spec §4.4).
    pub fn should_promote(&self, cfg: &Config) -> bool {
        self.encode().len() as u32 > cfg.block_size / 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_btree_does_not_promote() {
        let mut s = Shrub::new();
        s.0.write(0, b"tiny").unwrap();
        let cfg = Config::default();
        assert!(!s.should_promote(&cfg));
    }

    #[test]
    fn large_btree_promotes() {
        let mut s = Shrub::new();
        s.0.write(0, &vec![0u8; 2048]).unwrap();
        let cfg = Config { block_size: 4096, ..Config::default() };
        assert!(s.should_promote(&cfg));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut s = Shrub::new();
        s.0.write(0, b"hello").unwrap();
        let data = s.encode();
        assert_eq!(Shrub::decode(&data).unwrap(), s);
    }
}
