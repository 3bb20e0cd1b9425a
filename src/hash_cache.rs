//! `.ninja_hashes`: an advisory content-hash cache supplementing mtime-based
//! dirtiness. A mtime/hash disagreement always triggers a rebuild rather
//! than skip one — this cache can only make a build more conservative,
//! never less.

use std::collections::HashMap;
use std::path::Path;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

pub fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCacheEntry {
    pub hash: u64,
    pub mtime: i64,
}

#[derive(Default)]
pub struct HashCache {
    entries: HashMap<String, HashCacheEntry>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Self {
        let mut cache = HashCache::new();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return cache,
        };
        for line in content.lines() {
            let mut fields = line.splitn(3, '\t');
            let (Some(hash_hex), Some(mtime_str), Some(path)) = (fields.next(), fields.next(), fields.next()) else {
                continue;
            };
            let (Ok(hash), Ok(mtime)) = (u64::from_str_radix(hash_hex, 16), mtime_str.parse::<i64>()) else {
                continue;
            };
            cache.entries.insert(path.to_string(), HashCacheEntry { hash, mtime });
        }
        cache
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut out = String::new();
        for (p, e) in &self.entries {
            out.push_str(&format!("{:016x}\t{}\t{}\n", e.hash, e.mtime, p));
        }
        std::fs::write(path, out)
    }

    pub fn record(&mut self, path: &str, hash: u64, mtime: i64) {
        self.entries.insert(path.to_string(), HashCacheEntry { hash, mtime });
    }

    /// The mtime a stat of `path` should be treated as having, given its
    /// current on-disk mtime and content hash. If a cached entry's hash
    /// matches the current content hash, the file is considered unchanged
    /// even if its mtime advanced (a touch with no content change), and the
    /// older cached mtime is returned instead so dirtiness checks don't
    /// trip on it. Otherwise the current mtime passes through unchanged.
    pub fn effective_stamp(&self, path: &str, current_mtime: i64, current_hash: u64) -> i64 {
        match self.entries.get(path) {
            Some(e) if e.hash == current_hash => e.mtime,
            _ => current_mtime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_known_vector() {
        assert_eq!(fnv1a64(b""), FNV_OFFSET_BASIS);
        assert_ne!(fnv1a64(b"a"), fnv1a64(b"b"));
    }

    #[test]
    fn matching_hash_freezes_mtime_at_the_cached_value() {
        let mut cache = HashCache::new();
        cache.record("out", 0xabc, 100);
        assert_eq!(cache.effective_stamp("out", 100, 0xabc), 100);
        // Touched (mtime advanced) but content hash unchanged: pretend the
        // mtime never moved.
        assert_eq!(cache.effective_stamp("out", 150, 0xabc), 100);
        // Content actually changed: pass the new mtime through.
        assert_eq!(cache.effective_stamp("out", 150, 0xdef), 150);
    }

    #[test]
    fn unknown_path_passes_current_mtime_through() {
        let cache = HashCache::new();
        assert_eq!(cache.effective_stamp("never-seen", 42, 0), 42);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ninja_hashes");
        let mut cache = HashCache::new();
        cache.record("a.o", 111, 5);
        cache.save(&path).unwrap();
        let reloaded = HashCache::load(&path);
        assert_eq!(reloaded.effective_stamp("a.o", 5, 111), 5);
    }
}
