//! Thread-safe memoized file metadata.  Workers stat the same headers over
//! and over during signature checks; the cache collapses that to one syscall
//! per path until someone writes to it and calls `mark_dirty`.

use hashbrown::HashMap;
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileInfo {
    pub exists: bool,
    pub is_dir: bool,
    /// Modification time in nanoseconds since the epoch; 0 when missing.
    pub timestamp: u64,
    pub size: u64,
}

impl FileInfo {
    pub fn missing() -> FileInfo {
        FileInfo::default()
    }
}

/// Stats a path without caching.
pub fn stat_path(path: &str) -> FileInfo {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let timestamp = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            FileInfo {
                exists: true,
                is_dir: meta.is_dir(),
                timestamp,
                size: meta.len(),
            }
        }
        Err(_) => FileInfo::missing(),
    }
}

pub struct StatCache {
    map: Mutex<HashMap<String, FileInfo>>,
}

impl StatCache {
    pub fn new() -> StatCache {
        StatCache {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn stat(&self, path: &str) -> FileInfo {
        let mut map = self.map.lock().unwrap();
        if let Some(info) = map.get(path) {
            return *info;
        }
        let info = stat_path(path);
        map.insert(path.to_string(), info);
        info
    }

    /// Forget cached metadata after the build touched `path`.
    pub fn mark_dirty(&self, path: &str) {
        self.map.lock().unwrap().remove(path);
    }
}

impl Default for StatCache {
    fn default() -> Self {
        StatCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_and_invalidates() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f").to_str().unwrap().to_string();
        let cache = StatCache::new();

        assert!(!cache.stat(&path).exists);
        std::fs::write(&path, "x")?;
        // Still the memoized miss until marked dirty.
        assert!(!cache.stat(&path).exists);
        cache.mark_dirty(&path);
        let info = cache.stat(&path);
        assert!(info.exists);
        assert_eq!(info.size, 1);
        Ok(())
    }
}
