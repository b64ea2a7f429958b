//! Checksum manager (component 4.4): MD5 file inventory and constant-time
//! verification of a client's reported checksums.
//!
//! Grounded in the original server's checksum handler: an empty recorded MD5 means
//! "file must exist" and always passes; a real MD5 is compared in constant time so
//! a mismatch can't be timed to fish for the correct value.

use md5::{Digest, Md5};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ChecksumEntry {
    pub filename: String,
    /// `None` means "existence only": any reported digest, including an absent
    /// one, passes.
    pub digest: Option<[u8; 16]>,
}

#[derive(Debug, Clone, Default)]
pub struct ChecksumManager {
    pub entries: Vec<ChecksumEntry>,
}

impl ChecksumManager {
    /// Scans `files` (paths relative to the content root) and records each one's
    /// MD5 digest. A missing file is recorded with `digest: None` rather than
    /// failing the whole scan, mirroring the "checksum file" being optional content.
    pub fn scan<P: AsRef<Path>>(files: &[String], content_root: P) -> Self {
        let root = content_root.as_ref();
        let entries = files
            .iter()
            .map(|filename| {
                let path = root.join(filename);
                let digest = fs::read(&path).ok().map(|bytes| {
                    let mut hasher = Md5::new();
                    hasher.update(&bytes);
                    hasher.finalize().into()
                });
                ChecksumEntry {
                    filename: filename.clone(),
                    digest,
                }
            })
            .collect();
        Self { entries }
    }

    pub fn filenames(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.filename.as_str()).collect()
    }

    /// Verifies a client's reported digests, one per entry, in order. Returns
    /// `true` iff every entry passes. An entry with `digest: None` always passes.
    pub fn verify(&self, reported: &[[u8; 16]]) -> bool {
        if reported.len() != self.entries.len() {
            return false;
        }
        self.entries
            .iter()
            .zip(reported.iter())
            .all(|(entry, got)| match entry.digest {
                None => true,
                Some(expected) => constant_time_eq(&expected, got),
            })
    }
}

/// Constant-time byte comparison; mirrors `crypto/subtle.ConstantTimeCompare` so a
/// checksum mismatch can't be distinguished by timing.
fn constant_time_eq(a: &[u8; 16], b: &[u8; 16]) -> bool {
    let mut diff = 0u8;
    for i in 0..16 {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scan_records_digest_for_existing_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("car.acd"), b"hello").unwrap();

        let mgr = ChecksumManager::scan(&["car.acd".to_string()], dir.path());
        assert_eq!(mgr.entries.len(), 1);
        assert!(mgr.entries[0].digest.is_some());
    }

    #[test]
    fn missing_file_has_no_digest_and_always_passes() {
        let dir = tempdir().unwrap();
        let mgr = ChecksumManager::scan(&["missing.acd".to_string()], dir.path());
        assert!(mgr.entries[0].digest.is_none());
        assert!(mgr.verify(&[[0xAA; 16]]));
    }

    #[test]
    fn verify_rejects_mismatched_digest() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("car.acd"), b"hello").unwrap();
        let mgr = ChecksumManager::scan(&["car.acd".to_string()], dir.path());

        assert!(!mgr.verify(&[[0u8; 16]]));
    }

    #[test]
    fn verify_accepts_matching_digest() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("car.acd"), b"hello").unwrap();
        let mgr = ChecksumManager::scan(&["car.acd".to_string()], dir.path());
        let expected = mgr.entries[0].digest.unwrap();

        assert!(mgr.verify(&[expected]));
    }

    #[test]
    fn verify_rejects_wrong_count() {
        let mgr = ChecksumManager { entries: vec![] };
        assert!(!mgr.verify(&[[0u8; 16]]));
    }
}
