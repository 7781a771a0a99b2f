//! User attributes: small, separately-addressed byte blobs attached to a
//! file or directory entry alongside its name (spec §4 "user
//! attributes").

use super::Lfs3;
use crate::error::Result;

impl<'bd> Lfs3<'bd> {
    pub fn get_attr(&self, path: &str, id: u8) -> Result<Option<Vec<u8>>> {
        self.fs.borrow().get_attr(self.bd, path, id)
    }

    pub fn set_attr(&self, path: &str, id: u8, data: &[u8]) -> Result<()> {
        self.fs.borrow_mut().set_attr(self.bd, path, id, data)
    }

    pub fn remove_attr(&self, path: &str, id: u8) -> Result<()> {
        self.fs.borrow_mut().remove_attr(self.bd, path, id)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Lfs3;
    use crate::bd::RamBlockDevice;
    use crate::config::Config;

    #[test]
    fn set_then_get_then_remove_attr() {
        let bd = RamBlockDevice::new(32, 512);
        let cfg = Config { block_size: 512, block_count: 32, ..Config::default() };
        let lfs = Lfs3::format(&bd, cfg).unwrap();
        lfs.create("/f").unwrap();
        lfs.set_attr("/f", 1, b"v1").unwrap();
        assert_eq!(lfs.get_attr("/f", 1).unwrap(), Some(b"v1".to_vec()));
        lfs.remove_attr("/f", 1).unwrap();
        assert_eq!(lfs.get_attr("/f", 1).unwrap(), None);
    }
}
