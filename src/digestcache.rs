//! Content-digest memoizer with an on-disk backing that survives restarts.
//! An entry is valid while the file's (size, mtime) tuple is unchanged.

use crate::binio;
use crate::hash::Digest;
use crate::statcache::FileInfo;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const MAGIC: u32 = 0x6b64_6763; // "kdgc"

#[derive(Clone, Copy)]
struct Entry {
    size: u64,
    timestamp: u64,
    digest: Digest,
}

pub struct DigestCache {
    map: Mutex<HashMap<String, Entry>>,
    dirty: AtomicBool,
}

impl DigestCache {
    pub fn new() -> DigestCache {
        DigestCache {
            map: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Loads the persisted cache; a missing or corrupt file yields an empty
    /// cache.
    pub fn load(path: &str) -> DigestCache {
        let cache = DigestCache::new();
        let map = match binio::map_frozen(path, MAGIC) {
            Ok(Some(map)) => map,
            _ => return cache,
        };
        let mut r = binio::Reader::new(binio::frozen_payload(&map));
        let mut parse = || -> anyhow::Result<HashMap<String, Entry>> {
            let count = r.read_u32()? as usize;
            let mut entries = HashMap::with_capacity(count);
            for _ in 0..count {
                let path = r.read_str()?;
                let size = r.read_u64()?;
                let timestamp = r.read_u64()?;
                let digest = r.read_digest()?;
                entries.insert(
                    path,
                    Entry {
                        size,
                        timestamp,
                        digest,
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

    pub fn get(&self, path: &str, info: FileInfo) -> Option<Digest> {
        let map = self.map.lock().unwrap();
        let entry = map.get(path)?;
        if entry.size == info.size && entry.timestamp == info.timestamp {
            Some(entry.digest)
        } else {
            None
        }
    }

    pub fn set(&self, path: &str, info: FileInfo, digest: Digest) {
        self.map.lock().unwrap().insert(
            path.to_string(),
            Entry {
                size: info.size,
                timestamp: info.timestamp,
                digest,
            },
        );
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        let map = self.map.lock().unwrap();
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        let mut w = binio::Writer::new(MAGIC);
        w.write_u32(map.len() as u32);
        for key in keys {
            let entry = &map[key];
            w.write_str(key);
            w.write_u64(entry.size);
            w.write_u64(entry.timestamp);
            w.write_digest(&entry.digest);
        }
        w.commit(path, MAGIC)
    }
}

impl Default for DigestCache {
    fn default() -> Self {
        DigestCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::DIGEST_SIZE;

    fn info(size: u64, timestamp: u64) -> FileInfo {
        FileInfo {
            exists: true,
            is_dir: false,
            timestamp,
            size,
        }
    }

    #[test]
    fn entry_invalidated_by_stat_change() {
        let cache = DigestCache::new();
        let d = Digest([1; DIGEST_SIZE]);
        cache.set("a.c", info(10, 100), d);
        assert_eq!(cache.get("a.c", info(10, 100)), Some(d));
        assert_eq!(cache.get("a.c", info(11, 100)), None);
        assert_eq!(cache.get("a.c", info(10, 101)), None);
    }

    #[test]
    fn survives_restart() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("digests").to_str().unwrap().to_string();

        let cache = DigestCache::new();
        cache.set("a.c", info(10, 100), Digest([1; DIGEST_SIZE]));
        cache.set("b.c", info(20, 200), Digest([2; DIGEST_SIZE]));
        assert!(cache.is_dirty());
        cache.save(&path)?;

        let loaded = DigestCache::load(&path);
        assert_eq!(
            loaded.get("a.c", info(10, 100)),
            Some(Digest([1; DIGEST_SIZE]))
        );
        assert_eq!(
            loaded.get("b.c", info(20, 200)),
            Some(Digest([2; DIGEST_SIZE]))
        );
        assert!(!loaded.is_dirty());
        Ok(())
    }
}
