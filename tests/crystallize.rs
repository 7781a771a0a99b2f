//! A file body's promotion ladder -- inline, then shrub, then an
//! independent btree of whole-block leaves once it outgrows
//! `crystal_thresh` -- must be transparent to readers at every stage
//! (spec §5 "bshrub crystallization", §8 scenario 4).

use lfs3::bd::RamBlockDevice;
use lfs3::config::Config;
use lfs3::Lfs3;

fn cfg() -> Config {
    Config { block_size: 512, block_count: 32, inline_size: 16, fragment_size: 32, crystal_thresh: 48, ..Config::default() }
}

#[test]
fn file_stays_inline_below_inline_size() {
    let bd = RamBlockDevice::new(32, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    let mut f = lfs.create("/small").unwrap();
    f.write(b"tiny").unwrap();
    f.rewind();
    let mut buf = vec![0u8; 4];
    f.read(&mut buf).unwrap();
    assert_eq!(buf, b"tiny");
}

#[test]
fn file_past_crystal_thresh_reads_back_whole() {
    let bd = RamBlockDevice::new(32, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    let mut f = lfs.create("/big").unwrap();
    let payload: Vec<u8> = (0u8..200).collect();
    f.write(&payload).unwrap();
    f.rewind();

    let mut buf = vec![0u8; payload.len()];
    let n = f.read(&mut buf).unwrap();
    assert_eq!(n, payload.len());
    assert_eq!(buf, payload);
}

#[test]
fn truncate_after_crystallization_frees_trailing_blocks_and_shrinks_usage() {
    let bd = RamBlockDevice::new(32, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    let mut f = lfs.create("/big").unwrap();
    let payload: Vec<u8> = (0u8..200).collect();
    f.write(&payload).unwrap();

    let (used_before, _) = lfs.usage().unwrap();
    f.truncate(10).unwrap();
    let (used_after, _) = lfs.usage().unwrap();
    assert!(used_after <= used_before);

    f.rewind();
    let mut buf = vec![0u8; 10];
    let n = f.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], &payload[..10]);
}

#[test]
fn appending_past_a_crystallized_block_keeps_earlier_bytes_intact() {
    let bd = RamBlockDevice::new(32, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    let mut f = lfs.create("/grow").unwrap();
    let first: Vec<u8> = (0u8..100).collect();
    f.write(&first).unwrap();

    let second: Vec<u8> = (100u8..150).collect();
    f.write(&second).unwrap();

    f.rewind();
    let mut buf = vec![0u8; 150];
    let n = f.read(&mut buf).unwrap();
    assert_eq!(n, 150);
    let expected: Vec<u8> = (0u8..150).collect();
    assert_eq!(buf, expected);
}
