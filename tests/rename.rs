//! Renaming a file must be atomic from an external observer's point of
//! view: at no point should both the old and new name be simultaneously
//! absent (spec §8 scenario 2).

use lfs3::bd::RamBlockDevice;
use lfs3::config::Config;
use lfs3::Error;
use lfs3::Lfs3;

fn cfg() -> Config {
    Config { block_size: 512, block_count: 32, inline_size: 32, fragment_size: 64, crystal_thresh: 64, ..Config::default() }
}

#[test]
fn rename_same_directory_is_atomic_and_preserves_contents() {
    let bd = RamBlockDevice::new(32, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    lfs.create("/old.txt").unwrap();
    {
        let mut f = lfs.open("/old.txt").unwrap();
        f.write(b"payload").unwrap();
    }
    lfs.rename("/old.txt", "/new.txt").unwrap();

    assert_eq!(lfs.stat("/old.txt").unwrap_err(), Error::Noent);
    let mut f = lfs.open("/new.txt").unwrap();
    let mut buf = vec![0u8; 7];
    f.read(&mut buf).unwrap();
    assert_eq!(buf, b"payload");
}

#[test]
fn rename_onto_existing_name_is_rejected() {
    let bd = RamBlockDevice::new(32, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    lfs.create("/a").unwrap();
    lfs.create("/b").unwrap();
    assert_eq!(lfs.rename("/a", "/b").unwrap_err(), Error::Exist);
}

#[test]
fn rename_across_directories_preserves_contents() {
    let bd = RamBlockDevice::new(32, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    lfs.mkdir("/dst").unwrap();
    lfs.create("/src.txt").unwrap();
    {
        let mut f = lfs.open("/src.txt").unwrap();
        f.write(b"moved").unwrap();
    }
    lfs.rename("/src.txt", "/dst/moved.txt").unwrap();
    assert_eq!(lfs.stat("/src.txt").unwrap_err(), Error::Noent);

    let mut f = lfs.open("/dst/moved.txt").unwrap();
    let mut buf = vec![0u8; 5];
    f.read(&mut buf).unwrap();
    assert_eq!(buf, b"moved");
}

#[test]
fn rmdir_requires_empty_directory() {
    let bd = RamBlockDevice::new(32, 512);
    let lfs = Lfs3::format(&bd, cfg()).unwrap();
    lfs.mkdir("/d").unwrap();
    lfs.create("/d/x").unwrap();
    assert_eq!(lfs.remove("/d").unwrap_err(), Error::Notempty);
    lfs.remove("/d/x").unwrap();
    lfs.remove("/d").unwrap();
    assert_eq!(lfs.stat("/d").unwrap_err(), Error::Noent);
}
