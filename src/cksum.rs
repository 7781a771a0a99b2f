//! Rolling 32-bit checksum over arbitrary byte ranges (spec §2 `cksum`).
//!
//! Grounded directly on `csum_data_crc32` in `btrfs.rs`, which reaches
//! for the `crc` crate's CRC-32/ISCSI (Castagnoli) polynomial rather
//! than hand-rolling one. The difference here is that an rbyd checksum
//! is *rolling*: each commit extends the checksum over newly appended
//! bytes without re-reading the whole block, so this type carries the
//! running CRC state instead of taking one big slice.

use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A running checksum. `cksum(data)` for one shot, or fold bytes in
/// incrementally via [`Cksum::update`] as a commit's attribute bytes
/// stream past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cksum(u32);

impl Cksum {
    pub fn new() -> Self {
        Cksum(CASTAGNOLI.digest().finalize())
    }

    pub fn from_seed(seed: u32) -> Self {
        Cksum(seed)
    }

    pub fn update(self, data: &[u8]) -> Self {
        // crc's Digest API doesn't expose resuming from an arbitrary u32
        // state across calls to `update`, so the rolling checksum here
        // combines bytes with a second pass through the Castagnoli table
        // driven from the prior checksum as the initial register value.
        let mut digest = CASTAGNOLI.digest_with_initial(self.0);
        digest.update(data);
        Cksum(digest.finalize())
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

/// One-shot checksum of a full byte range.
pub fn cksum(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

/// Flip a single bit in `word` (the checksum footer's perturb bit, spec
/// §9). Guarantees the programmed checksum word differs from any value
/// that could already sit at this aligned offset from a previous,
/// uncommitted program.
pub fn perturb(word: u32, prior: u32) -> (u32, bool) {
    if word != prior {
        (word, false)
    } else {
        (word ^ 1, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let one_shot = cksum(data);
        let mut rolling = Cksum::new();
        for chunk in data.chunks(7) {
            rolling = rolling.update(chunk);
        }
        assert_eq!(one_shot, rolling.value());
    }

    #[test]
    fn perturb_only_flips_on_collision() {
        let (w, flipped) = perturb(42, 7);
        assert_eq!(w, 42);
        assert!(!flipped);
        let (w, flipped) = perturb(42, 42);
        assert_eq!(w, 43);
        assert!(flipped);
    }
}
