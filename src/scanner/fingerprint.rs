//! File fingerprints: content hash and write-stability tracking.

use std::collections::{HashMap, HashSet};
use std::fs::{File, Metadata};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};

const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Hex SHA-256 of a file's content, read in 64 KiB blocks.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Size and modification time observed on one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl FileStamp {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            size: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

/// Remembers the previous poll's stamp per path. A file is stable once two
/// consecutive polls see the same size and mtime.
#[derive(Debug, Default)]
pub struct StabilityTracker {
    last_seen: HashMap<PathBuf, FileStamp>,
}

impl StabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `stamp` and returns whether it matches the previous poll.
    pub fn observe(&mut self, path: &Path, stamp: FileStamp) -> bool {
        match self.last_seen.insert(path.to_path_buf(), stamp) {
            Some(previous) => previous == stamp,
            None => false,
        }
    }

    /// Forgets paths not seen in the latest listing.
    pub fn retain_seen(&mut self, seen: &HashSet<PathBuf>) {
        self.last_seen.retain(|path, _| seen.contains(path));
    }

    pub fn forget(&mut self, path: &Path) {
        self.last_seen.remove(path);
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_spans_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let data = vec![7u8; HASH_BLOCK_SIZE * 2 + 17];
        std::fs::write(&a, &data).unwrap();
        std::fs::write(&b, &data).unwrap();
        assert_eq!(sha256_file(&a).unwrap(), sha256_file(&b).unwrap());

        std::fs::write(&b, &data[1..]).unwrap();
        assert_ne!(sha256_file(&a).unwrap(), sha256_file(&b).unwrap());
    }

    #[test]
    fn test_stability_requires_two_equal_polls() {
        let mut tracker = StabilityTracker::new();
        let path = Path::new("watch/a.csv");
        let stamp = FileStamp {
            size: 10,
            modified: None,
        };

        assert!(!tracker.observe(path, stamp));
        assert!(tracker.observe(path, stamp));

        let grown = FileStamp { size: 20, ..stamp };
        assert!(!tracker.observe(path, grown));
        assert!(tracker.observe(path, grown));
    }

    #[test]
    fn test_retain_prunes_vanished_files() {
        let mut tracker = StabilityTracker::new();
        let stamp = FileStamp {
            size: 1,
            modified: None,
        };
        tracker.observe(Path::new("a"), stamp);
        tracker.observe(Path::new("b"), stamp);

        let seen: HashSet<PathBuf> = [PathBuf::from("a")].into_iter().collect();
        tracker.retain_seen(&seen);
        assert_eq!(tracker.len(), 1);

        tracker.forget(Path::new("a"));
        assert!(tracker.is_empty());
    }
}
