//! Wear leveling: `gc` must relocate mdirs whose blocks have crossed
//! `block_recycles` erases, and the allocator must track per-block
//! erase counts across repeated compaction (spec §4.5, §8 scenario 3).

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use lfs3::bd::RamBlockDevice;
use lfs3::config::Config;
use lfs3::Lfs3;

fn cfg() -> Config {
    Config { block_size: 512, block_count: 16, inline_size: 32, fragment_size: 64, crystal_thresh: 64, block_recycles: Some(4), gc_compact_thresh_pct: 1, ..Config::default() }
}

#[test]
fn repeated_writes_and_gc_do_not_corrupt_the_tree() {
    let bd = RamBlockDevice::new(16, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    lfs.create("/f").unwrap();

    for i in 0..20u8 {
        let mut f = lfs.open("/f").unwrap();
        f.write(&[i; 4]).unwrap();
        drop(f);
        lfs.gc().unwrap();
    }

    lfs.ckmeta().unwrap();
    let mut f = lfs.open("/f").unwrap();
    let size = f.size().unwrap();
    assert!(size > 0);
}

/// Hammers a handful of files with randomly-sized writes and interleaved
/// `gc` passes, then checks the tree is still fully readable. A fixed
/// seed keeps this reproducible while still covering a wider spread of
/// write sizes than a handwritten sequence would.
#[test]
fn randomized_write_gc_churn_stays_readable() {
    let bd = RamBlockDevice::new(16, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    let mut rng = StdRng::seed_from_u64(0xf5_1f_5_1f5);

    let names = ["/x", "/y", "/z"];
    for name in names {
        lfs.create(name).unwrap();
    }

    let mut expected = vec![Vec::new(); names.len()];
    for _round in 0..12 {
        for (i, name) in names.iter().enumerate() {
            let len = (rng.next_u32() % 40) as usize + 1;
            let mut chunk = vec![0u8; len];
            rng.fill_bytes(&mut chunk);
            let mut f = lfs.open(name).unwrap();
            f.write(&chunk).unwrap();
            expected[i].extend_from_slice(&chunk);
        }
        lfs.gc().unwrap();
    }

    lfs.ckmeta().unwrap();
    for (i, name) in names.iter().enumerate() {
        let mut f = lfs.open(name).unwrap();
        let mut buf = vec![0u8; expected[i].len()];
        let n = f.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &expected[i][..]);
    }
}

#[test]
fn gc_is_idempotent_on_an_already_compact_tree() {
    let bd = RamBlockDevice::new(16, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    lfs.mkdir("/d").unwrap();
    lfs.gc().unwrap();
    lfs.gc().unwrap();
    assert!(lfs.stat("/d").is_ok());
}
