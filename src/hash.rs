//! Streaming 128-bit hashing used for node GUIDs, input signatures and cache
//! keys, plus the cheap djb2 path hashes the DAG carries alongside filenames.

use sha1::{Digest as _, Sha1};
use std::fmt;

pub const DIGEST_SIZE: usize = 16;

/// A 128-bit digest with a stable hex form.  Ordering is byte-lexicographic,
/// which is what the sorted GUID arrays in the DAG and state files rely on.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(DIGEST_SIZE * 2);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

const UNIT_SEPARATOR: u8 = 0x1F;

/// Incremental hasher with typed mixers.  Finalizes to a truncated SHA-1,
/// which gives us a well-mixed 128-bit value over streamed input.
pub struct Hasher(Sha1);

impl Hasher {
    pub fn new() -> Self {
        Hasher(Sha1::new())
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn add_str(&mut self, s: &str) {
        self.0.update(s.as_bytes());
    }

    /// Paths are case-folded on case-insensitive targets so signatures are
    /// stable regardless of how callers spell them.
    pub fn add_path(&mut self, path: &str) {
        if cfg!(windows) {
            for c in path.chars().flat_map(|c| c.to_lowercase()) {
                let mut buf = [0u8; 4];
                self.0.update(c.encode_utf8(&mut buf).as_bytes());
            }
        } else {
            self.0.update(path.as_bytes());
        }
    }

    pub fn add_u64(&mut self, v: u64) {
        self.0.update(v.to_le_bytes());
    }

    pub fn add_separator(&mut self) {
        self.0.update([UNIT_SEPARATOR]);
    }

    pub fn add_digest(&mut self, d: &Digest) {
        self.0.update(d.0);
    }

    pub fn finish(self) -> Digest {
        let full = self.0.finalize();
        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&full[..DIGEST_SIZE]);
        Digest(out)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Hasher::new()
    }
}

/// Hash the full contents of a byte buffer in one go.
pub fn digest_bytes(bytes: &[u8]) -> Digest {
    let mut h = Hasher::new();
    h.add_bytes(bytes);
    h.finish()
}

pub fn djb2(s: &str) -> u32 {
    let mut hash: u32 = 5381;
    for &b in s.as_bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// djb2 over a path, folding case on case-insensitive targets to match
/// `Hasher::add_path`.
pub fn djb2_path(s: &str) -> u32 {
    if cfg!(windows) {
        let mut hash: u32 = 5381;
        for c in s.chars().flat_map(|c| c.to_lowercase()) {
            let mut buf = [0u8; 4];
            for &b in c.encode_utf8(&mut buf).as_bytes() {
                hash = hash.wrapping_mul(33).wrapping_add(b as u32);
            }
        }
        hash
    } else {
        djb2(s)
    }
}
