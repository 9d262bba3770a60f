//! Content fingerprints used to decide whether a file body must be sent.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest as _, Sha256};

use crate::protocol::CHUNK_SIZE;

pub const DIGEST_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Digest carried by directories.
    pub fn empty() -> Self {
        Digest([0u8; DIGEST_LEN])
    }

    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Digest(hasher.finalize().into()))
}

pub fn digest_file(path: &Path) -> io::Result<Digest> {
    digest_reader(File::open(path)?)
}

pub fn digests_equal(a: &Digest, b: &Digest) -> bool {
    a.0 == b.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_content_same_digest() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"hello world").unwrap();
        std::fs::write(&b, b"hello world").unwrap();

        let da = digest_file(&a).unwrap();
        let db = digest_file(&b).unwrap();
        assert!(digests_equal(&da, &db));
    }

    #[test]
    fn test_single_byte_changes_digest() {
        let da = digest_reader(&b"hello world"[..]).unwrap();
        let db = digest_reader(&b"hello worle"[..]).unwrap();
        assert!(!digests_equal(&da, &db));
    }

    #[test]
    fn test_known_value() {
        let d = digest_reader(&b""[..]).unwrap();
        assert_eq!(
            d.to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(digest_file(&dir.path().join("nope")).is_err());
    }
}
