// src/digest.rs

//! SHA-256 content digests.
//!
//! Installed files are content-addressed by the lowercase hex SHA-256 of
//! their bytes; manifests record the expected digest per install path and
//! every download is verified against it before anything touches disk.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

/// Compute the lowercase hex SHA-256 of a byte slice.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Verify bytes against an expected digest.
///
/// The error names the computed digest so callers can report what was
/// actually received.
pub fn verify(path: &str, bytes: &[u8], expected: &str) -> Result<()> {
    let actual = digest(bytes);
    if actual != expected {
        return Err(Error::DigestMismatch {
            path: path.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_known_vector() {
        // SHA-256 of the empty string
        assert_eq!(
            digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_match() {
        let bytes = b"hello world";
        verify("f", bytes, &digest(bytes)).unwrap();
    }

    #[test]
    fn test_verify_mismatch_names_actual() {
        let err = verify("lib/init.txt", b"hello", &digest(b"other")).unwrap_err();
        match err {
            Error::DigestMismatch { path, actual, .. } => {
                assert_eq!(path, "lib/init.txt");
                assert_eq!(actual, digest(b"hello"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
