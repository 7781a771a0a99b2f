//! Path splitting and validation shared by the public API (spec §6).

use crate::config::Config;
use crate::error::{Error, Result};

/// Split a `/`-separated path into its non-empty components, rejecting
/// anything that would violate `name_limit` or contain an embedded NUL.
pub fn split(path: &str, cfg: &Config) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    for comp in path.split('/') {
        if comp.is_empty() || comp == "." {
            continue;
        }
        if comp == ".." {
            return Err(Error::Inval);
        }
        if comp.as_bytes().contains(&0) {
            return Err(Error::Inval);
        }
        if comp.len() as u32 > cfg.name_limit {
            return Err(Error::Nametoolong);
        }
        parts.push(comp);
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_skips_empty_components() {
        let cfg = Config::default();
        assert_eq!(split("/a//b/c/", &cfg).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn dot_dot_rejected() {
        let cfg = Config::default();
        assert_eq!(split("/a/../b", &cfg), Err(Error::Inval));
    }

    #[test]
    fn overlong_component_rejected() {
        let cfg = Config { name_limit: 4, ..Config::default() };
        assert_eq!(split("/abcdef", &cfg), Err(Error::Nametoolong));
    }
}
