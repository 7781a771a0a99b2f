//! Growing a filesystem onto a larger backing device must widen the
//! allocator's addressable range while leaving existing files intact,
//! and the allocator must still know which blocks are already spoken
//! for once it's done (spec §4.7, §8 scenario 5).

use lfs3::bd::RamBlockDevice;
use lfs3::config::Config;
use lfs3::Lfs3;

fn cfg() -> Config {
    Config { block_size: 512, block_count: 16, inline_size: 32, fragment_size: 64, crystal_thresh: 64, ..Config::default() }
}

#[test]
fn grow_widens_usage_and_preserves_existing_files() {
    let bd = RamBlockDevice::new(64, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    lfs.create("/a").unwrap();
    {
        let mut f = lfs.open("/a").unwrap();
        f.write(b"hello").unwrap();
    }

    let (_, total_before) = lfs.usage().unwrap();
    assert_eq!(total_before, 16);

    lfs.grow(64).unwrap();
    let (_, total_after) = lfs.usage().unwrap();
    assert_eq!(total_after, 64);

    let mut f = lfs.open("/a").unwrap();
    let mut buf = vec![0u8; 5];
    f.read(&mut buf).unwrap();
    assert_eq!(buf, b"hello");
}

#[test]
fn allocator_does_not_reissue_live_blocks_after_grow() {
    let bd = RamBlockDevice::new(64, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    lfs.create("/a").unwrap();
    lfs.create("/b").unwrap();
    lfs.grow(64).unwrap();

    // new files allocated after grow must not collide with blocks
    // already claimed by /a or /b's mdirs
    lfs.create("/c").unwrap();
    let mut f = lfs.open("/c").unwrap();
    f.write(b"post-grow write").unwrap();
    f.rewind();

    assert!(lfs.stat("/a").is_ok());
    assert!(lfs.stat("/b").is_ok());
    let mut buf = vec![0u8; 16];
    let n = f.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"post-grow write");
}
