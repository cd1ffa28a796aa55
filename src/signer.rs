//! Per-file signature computation: a file contributes either its content
//! digest or its timestamp to a node's input signature, decided by the DAG's
//! extension whitelist.

use crate::digestcache::DigestCache;
use crate::hash::{digest_bytes, djb2, Hasher};
use crate::statcache::StatCache;

/// Everything signature computation needs besides the node itself.
pub struct SignContext<'a> {
    pub stat_cache: &'a StatCache,
    pub digest_cache: &'a DigestCache,
    /// djb2 hashes of extensions whose files are content-signed.
    pub digest_extensions: &'a [u32],
}

pub fn should_use_digest(path: &str, digest_extensions: &[u32]) -> bool {
    let ext = match path.rfind('.') {
        Some(pos) => &path[pos..],
        None => return false,
    };
    let hash = djb2(ext);
    digest_extensions.iter().any(|&e| e == hash)
}

/// Mixes `path`'s signature into `h`.  Deterministic given identical
/// filesystem state.
pub fn compute_file_signature(
    h: &mut Hasher,
    ctx: &SignContext,
    path: &str,
    force_timestamp: bool,
) {
    if !force_timestamp && should_use_digest(path, ctx.digest_extensions) {
        compute_digest_signature(h, ctx, path);
    } else {
        compute_timestamp_signature(h, ctx, path);
    }
}

fn compute_timestamp_signature(h: &mut Hasher, ctx: &SignContext, path: &str) {
    let info = ctx.stat_cache.stat(path);
    if info.exists {
        h.add_u64(info.timestamp);
    } else {
        h.add_u64(u64::MAX);
    }
}

fn compute_digest_signature(h: &mut Hasher, ctx: &SignContext, path: &str) {
    let info = ctx.stat_cache.stat(path);
    if !info.exists {
        h.add_u64(u64::MAX);
        return;
    }
    if let Some(digest) = ctx.digest_cache.get(path, info) {
        h.add_digest(&digest);
        return;
    }
    match std::fs::read(path) {
        Ok(bytes) => {
            let digest = digest_bytes(&bytes);
            ctx.digest_cache.set(path, info, digest);
            h.add_digest(&digest);
        }
        // Raced with a deletion; sign it the way a missing file signs.
        Err(_) => h.add_str("<missing>"),
    }
}
