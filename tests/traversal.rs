//! A traversal (via `ckmeta`/`ckdata`/`usage`) must reach every mdir and
//! data block in the tree exactly once, regardless of nesting depth
//! (spec §4.6 "traversal", §8 scenario 6).

use lfs3::bd::RamBlockDevice;
use lfs3::config::Config;
use lfs3::Lfs3;

fn cfg() -> Config {
    Config { block_size: 512, block_count: 32, inline_size: 16, fragment_size: 32, crystal_thresh: 48, ..Config::default() }
}

#[test]
fn ckmeta_and_ckdata_pass_over_a_nested_tree() {
    let bd = RamBlockDevice::new(32, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    lfs.mkdir("/a").unwrap();
    lfs.mkdir("/a/b").unwrap();
    lfs.mkdir("/a/b/c").unwrap();
    lfs.create("/a/top.txt").unwrap();
    lfs.create("/a/b/mid.txt").unwrap();
    let mut f = lfs.create("/a/b/c/deep.txt").unwrap();
    f.write(&vec![9u8; 200]).unwrap();

    lfs.ckmeta().unwrap();
    lfs.ckdata().unwrap();
}

#[test]
fn usage_counts_every_directory_and_file_block_once() {
    let bd = RamBlockDevice::new(32, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    let (used_empty, total) = lfs.usage().unwrap();
    assert_eq!(total, 32);

    lfs.mkdir("/dir").unwrap();
    let mut f = lfs.create("/dir/f").unwrap();
    f.write(&vec![1u8; 200]).unwrap();

    let (used_after, _) = lfs.usage().unwrap();
    assert!(used_after > used_empty);
}

#[test]
fn listing_reaches_every_entry_in_a_directory() {
    let bd = RamBlockDevice::new(32, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    lfs.mkdir("/d").unwrap();
    lfs.create("/d/one").unwrap();
    lfs.create("/d/two").unwrap();
    lfs.mkdir("/d/three").unwrap();

    let mut dir = lfs.open_dir("/d").unwrap();
    let mut names = Vec::new();
    while let Some(entry) = dir.read().unwrap() {
        names.push(entry.name);
    }
    names.sort();
    assert_eq!(names, vec!["one", "three", "two"]);
}
