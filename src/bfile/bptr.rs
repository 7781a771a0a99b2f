//! `bptr`: a pointer to a whole-block leaf in a file's btree (spec §3,
//! §4.4), carrying its own checksum so data-block corruption is detected
//! independently of the metadata log.

use crate::bd::{Block, BlockDevice};
use crate::cksum::cksum;
use crate::error::{Error, Result};
use crate::tag::{read_varint, write_varint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bptr {
    pub block: Block,
    /// Number of meaningful bytes in the block (a whole-block leaf need
    /// not use every byte of `block_size`).
    pub cksize: u32,
    pub cksum: u32,
}

impl Bptr {
    pub fn write(bd: &dyn BlockDevice, block: Block, data: &[u8]) -> Result<Bptr> {
        if data.len() as u32 > bd.block_size() {
            return Err(Error::Fbig);
        }
        bd.erase(block)?;
        bd.prog(block, 0, data)?;
        bd.sync()?;
        Ok(Bptr { block, cksize: data.len() as u32, cksum: cksum(data) })
    }

    pub fn read(&self, bd: &dyn BlockDevice) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.cksize as usize];
        bd.read(self.block, 0, &mut buf)?;
        if cksum(&buf) != self.cksum {
            return Err(Error::Corrupt);
        }
        Ok(buf)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        write_varint(self.block as u64, out);
        write_varint(self.cksize as u64, out);
        write_varint(self.cksum as u64, out);
    }

    pub fn decode(data: &[u8]) -> Result<(Bptr, usize)> {
        let mut off = 0;
        let (block, n) = read_varint(&data[off..])?;
        off += n;
        let (cksize, n) = read_varint(&data[off..])?;
        off += n;
        let (cksum, n) = read_varint(&data[off..])?;
        off += n;
        Ok((Bptr { block: block as u32, cksize: cksize as u32, cksum: cksum as u32 }, off))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bd::RamBlockDevice;

    #[test]
    fn write_then_read_validates_checksum() {
        let bd = RamBlockDevice::new(2, 256);
        let bptr = Bptr::write(&bd, 0, b"whole block contents").unwrap();
        assert_eq!(bptr.read(&bd).unwrap(), b"whole block contents");
    }

    #[test]
    fn corrupted_block_fails_checksum() {
        let bd = RamBlockDevice::new(2, 256);
        let bptr = Bptr::write(&bd, 0, b"hello").unwrap();
        bd.erase(0).unwrap();
        bd.prog(0, 0, b"jello").unwrap();
        assert_eq!(bptr.read(&bd), Err(Error::Corrupt));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let bptr = Bptr { block: 7, cksize: 100, cksum: 0xabcdef };
        let mut buf = Vec::new();
        bptr.encode(&mut buf);
        let (decoded, n) = Bptr::decode(&buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(decoded, bptr);
    }
}
