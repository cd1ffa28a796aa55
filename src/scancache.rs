//! Memoized scanner results: (scanner GUID, file path) maps to the file's
//! resolved direct includes.  Keys are digests so the on-disk form is a
//! sorted array amenable to binary search; entries are validated against the
//! scanned file's timestamp.

use crate::binio;
use crate::hash::{Digest, Hasher};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const MAGIC: u32 = 0x6b73_636e; // "kscn"

pub fn scan_key(scanner_guid: &Digest, path: &str) -> Digest {
    let mut h = Hasher::new();
    h.add_digest(scanner_guid);
    h.add_separator();
    h.add_path(path);
    h.finish()
}

/// One resolved include of a scanned file.  `follow` records whether the
/// scanner chases includes inside the included file too.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanInclude {
    pub path: String,
    pub follow: bool,
}

#[derive(Clone)]
pub struct ScanEntry {
    /// Timestamp of the scanned file when the entry was produced.
    pub timestamp: u64,
    /// Resolved direct includes of the scanned file.
    pub includes: Vec<ScanInclude>,
}

pub struct ScanCache {
    map: Mutex<HashMap<Digest, ScanEntry>>,
    dirty: AtomicBool,
}

impl ScanCache {
    pub fn new() -> ScanCache {
        ScanCache {
            map: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn load(path: &str) -> ScanCache {
        let cache = ScanCache::new();
        let map = match binio::map_frozen(path, MAGIC) {
            Ok(Some(map)) => map,
            _ => return cache,
        };
        let mut r = binio::Reader::new(binio::frozen_payload(&map));
        let mut parse = || -> anyhow::Result<HashMap<Digest, ScanEntry>> {
            let count = r.read_u32()? as usize;
            let mut entries = HashMap::with_capacity(count);
            for _ in 0..count {
                let key = r.read_digest()?;
                let timestamp = r.read_u64()?;
                let include_count = r.read_u32()? as usize;
                let mut includes = Vec::with_capacity(include_count);
                for _ in 0..include_count {
                    let path = r.read_str()?;
                    let follow = r.read_u32()? != 0;
                    includes.push(ScanInclude { path, follow });
                }
                entries.insert(
                    key,
                    ScanEntry {
                        timestamp,
                        includes,
                    },
                );
            }
            Ok(entries)
        };
        if let Ok(entries) = parse() {
            *cache.map.lock().unwrap() = entries;
        }
        cache
    }

    /// Returns the cached includes if the entry is still valid for a file
    /// with the given timestamp.
    pub fn get(&self, key: &Digest, timestamp: u64) -> Option<Vec<ScanInclude>> {
        let map = self.map.lock().unwrap();
        let entry = map.get(key)?;
        if entry.timestamp == timestamp {
            Some(entry.includes.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, key: Digest, entry: ScanEntry) {
        self.map.lock().unwrap().insert(key, entry);
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        let map = self.map.lock().unwrap();
        let mut keys: Vec<&Digest> = map.keys().collect();
        keys.sort();
        let mut w = binio::Writer::new(MAGIC);
        w.write_u32(map.len() as u32);
        for key in keys {
            let entry = &map[key];
            w.write_digest(key);
            w.write_u64(entry.timestamp);
            w.write_u32(entry.includes.len() as u32);
            for include in &entry.includes {
                w.write_str(&include.path);
                w.write_u32(include.follow as u32);
            }
        }
        w.commit(path, MAGIC)
    }
}

impl Default for ScanCache {
    fn default() -> Self {
        ScanCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::DIGEST_SIZE;

    fn include(path: &str) -> ScanInclude {
        ScanInclude {
            path: path.to_string(),
            follow: true,
        }
    }

    #[test]
    fn timestamp_validates_entries() {
        let cache = ScanCache::new();
        let key = scan_key(&Digest([9; DIGEST_SIZE]), "main.c");
        cache.insert(
            key,
            ScanEntry {
                timestamp: 7,
                includes: vec![include("a.h")],
            },
        );
        assert_eq!(cache.get(&key, 7), Some(vec![include("a.h")]));
        assert_eq!(cache.get(&key, 8), None);
    }

    #[test]
    fn distinct_scanners_distinct_keys() {
        let a = scan_key(&Digest([1; DIGEST_SIZE]), "main.c");
        let b = scan_key(&Digest([2; DIGEST_SIZE]), "main.c");
        assert_ne!(a, b);
    }

    #[test]
    fn round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("scans").to_str().unwrap().to_string();

        let cache = ScanCache::new();
        let key = scan_key(&Digest([9; DIGEST_SIZE]), "main.c");
        cache.insert(
            key,
            ScanEntry {
                timestamp: 7,
                includes: vec![
                    include("a.h"),
                    ScanInclude {
                        path: "b.inc".to_string(),
                        follow: false,
                    },
                ],
            },
        );
        cache.save(&path)?;

        let loaded = ScanCache::load(&path);
        assert_eq!(
            loaded.get(&key, 7),
            Some(vec![
                include("a.h"),
                ScanInclude {
                    path: "b.inc".to_string(),
                    follow: false,
                },
            ])
        );
        assert!(!loaded.is_dirty());
        Ok(())
    }
}
