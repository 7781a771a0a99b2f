//! Inspect and exercise an `lfs3` image from the command line, the
//! spiritual successor to the read-only `dump_btrfs` binary -- except
//! this one can also format and write, since `lfs3` is a read-write
//! filesystem rather than a forensic dumper.

use clap::{Parser, Subcommand};
use lfs3::bd::{BlockDevice, FileBlockDevice};
use lfs3::cache::Cache;
use lfs3::config::Config;
use lfs3::fs::Fs;
use lfs3::rbyd::Rbyd;
use log::info;
use std::path::PathBuf;

/// inspect and exercise an lfs3 image
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    /// Path to the backing image file.
    image: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Format a fresh image with `block_count` blocks of `block_size` bytes.
    Format {
        #[arg(long, default_value_t = 4096)]
        block_size: u32,
        #[arg(long, default_value_t = 1024)]
        block_count: u32,
    },
    /// List a directory's entries.
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file's contents to stdout.
    Cat { path: String },
    /// Dump the live attribute index of one metadata block.
    DumpRbyd { block: u32 },
    /// Validate every reachable metadata checksum.
    Ckmeta,
    /// Validate every reachable metadata and data checksum.
    Ckdata,
    /// Replay any pending recovery state left by an unclean unmount.
    Mkconsistent,
    /// Compact mdirs past their usage threshold and relocate worn blocks.
    Gc,
    /// Print used/total block counts.
    Usage,
}

fn open_bd(image: &PathBuf, block_count: u32, block_size: u32) -> anyhow::Result<FileBlockDevice> {
    Ok(FileBlockDevice::open(image, block_count, block_size)?)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Params::parse();

    match args.cmd {
        Command::Format { block_size, block_count } => {
            let bd = open_bd(&args.image, block_count, block_size)?;
            let cfg = Config { block_size, block_count, ..Config::default() };
            Fs::format(&bd, cfg)?;
            info!("formatted {:?}: {} blocks of {} bytes", args.image, block_count, block_size);
        }
        Command::Ls { path } => {
            let (bd, cfg) = mount_cfg(&args.image)?;
            let fs = Fs::mount(&bd, cfg)?;
            for entry in fs.list(&bd, &path)? {
                let kind = match entry.kind {
                    lfs3::fs::DirentKind::Reg => "f",
                    lfs3::fs::DirentKind::Dir(_) => "d",
                };
                println!("{kind} {}", entry.name);
            }
        }
        Command::Cat { path } => {
            let (bd, cfg) = mount_cfg(&args.image)?;
            let fs = Fs::mount(&bd, cfg)?;
            let size = fs.file_size(&bd, &path)?;
            let data = fs.read_file(&bd, &path, 0, size)?;
            use std::io::Write;
            std::io::stdout().write_all(&data)?;
        }
        Command::DumpRbyd { block } => {
            let (bd, _cfg) = mount_cfg(&args.image)?;
            let mut cache = Cache::new(bd.block_size().min(64), 64);
            let rbyd = Rbyd::fetch(&bd, &mut cache, block)?;
            for e in rbyd.iter_live() {
                println!("rid={} tag={:#x} weight={} off={} size={}", e.rid, e.tag.0, e.weight, e.off, e.size);
            }
        }
        Command::Ckmeta => {
            let (bd, cfg) = mount_cfg(&args.image)?;
            let fs = Fs::mount(&bd, cfg)?;
            fs.ckmeta(&bd)?;
            println!("ckmeta: ok");
        }
        Command::Ckdata => {
            let (bd, cfg) = mount_cfg(&args.image)?;
            let fs = Fs::mount(&bd, cfg)?;
            fs.ckdata(&bd)?;
            println!("ckdata: ok");
        }
        Command::Mkconsistent => {
            let (bd, cfg) = mount_cfg(&args.image)?;
            let mut fs = Fs::mount(&bd, cfg)?;
            fs.mkconsistent(&bd)?;
            println!("mkconsistent: done");
        }
        Command::Gc => {
            let (bd, cfg) = mount_cfg(&args.image)?;
            let mut fs = Fs::mount(&bd, cfg)?;
            fs.gc(&bd)?;
            println!("gc: done");
        }
        Command::Usage => {
            let (bd, cfg) = mount_cfg(&args.image)?;
            let fs = Fs::mount(&bd, cfg)?;
            let (used, total) = fs.usage(&bd)?;
            println!("{used}/{total} blocks used");
        }
    }

    Ok(())
}

/// Re-derive the config an already-formatted image was written with.
/// `lfs3-dbg` only ever points at images it (or the library under test)
/// formatted itself, so the defaults here just need `block_size` right
/// -- `Fs::mount` will reject the guess if it's wrong.
fn mount_cfg(image: &PathBuf) -> anyhow::Result<(FileBlockDevice, Config)> {
    let cfg = Config::default();
    let bd = open_bd(image, cfg.block_count, cfg.block_size)?;
    Ok((bd, cfg))
}
