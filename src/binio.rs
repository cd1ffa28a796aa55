//! Little-endian binary readers and writers for the frozen on-disk files
//! (DAG, build state, scan cache, digest cache).  Every file carries the same
//! 32-bit magic number at its start and end; a truncated write shows up as a
//! missing end marker.

use crate::hash::{Digest, DIGEST_SIZE};
use anyhow::{anyhow, bail};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            bail!("unexpected end of data at offset {}", self.pos);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> anyhow::Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> anyhow::Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_str(&mut self) -> anyhow::Result<String> {
        let len = self.read_u32()? as usize;
        let b = self.take(len)?;
        Ok(std::str::from_utf8(b)
            .map_err(|_| anyhow!("invalid utf-8 string at offset {}", self.pos))?
            .to_string())
    }

    pub fn read_opt_str(&mut self) -> anyhow::Result<Option<String>> {
        match self.read_u32()? {
            0 => Ok(None),
            _ => Ok(Some(self.read_str()?)),
        }
    }

    pub fn read_digest(&mut self) -> anyhow::Result<Digest> {
        let b = self.take(DIGEST_SIZE)?;
        Ok(Digest(b.try_into().unwrap()))
    }
}

#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new(magic: u32) -> Self {
        let mut w = Writer { buf: Vec::new() };
        w.write_u32(magic);
        w
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_u32(v as u32);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_opt_str(&mut self, s: Option<&str>) {
        match s {
            None => self.write_u32(0),
            Some(s) => {
                self.write_u32(1);
                self.write_str(s);
            }
        }
    }

    pub fn write_digest(&mut self, d: &Digest) {
        self.buf.extend_from_slice(&d.0);
    }

    /// Appends the end magic and commits atomically: write `<path>.tmp`, then
    /// rename over `path`.  On failure the temp file is removed and the old
    /// file is left intact.
    pub fn commit(mut self, path: &str, magic: u32) -> anyhow::Result<()> {
        self.write_u32(magic);
        let tmp = format!("{}.tmp", path);
        if let Err(err) = std::fs::write(&tmp, &self.buf) {
            let _ = std::fs::remove_file(&tmp);
            bail!("write {}: {}", tmp, err);
        }
        if let Err(err) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            bail!("rename {} -> {}: {}", tmp, path, err);
        }
        Ok(())
    }
}

/// Memory-maps a frozen file and validates the magic number at both ends.
/// Returns None when the file is missing; corrupt files are an error for the
/// caller to interpret.
pub fn map_frozen(path: &str, magic: u32) -> anyhow::Result<Option<Mmap>> {
    let file = match File::open(Path::new(path)) {
        Ok(f) => f,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => bail!("open {}: {}", path, err),
    };
    // Safety: the mapping is read-only and the builds that rewrite these
    // files commit via rename, never in place.
    let map = unsafe { Mmap::map(&file) }.map_err(|err| anyhow!("mmap {}: {}", path, err))?;
    if map.len() < 8 {
        bail!("{}: too small ({} bytes)", path, map.len());
    }
    let head = u32::from_le_bytes(map[..4].try_into().unwrap());
    let tail = u32::from_le_bytes(map[map.len() - 4..].try_into().unwrap());
    if head != magic {
        bail!("{}: bad magic number {:08x}, expected {:08x}", path, head, magic);
    }
    if tail != magic {
        bail!("{}: missing end marker, file is truncated or overlong", path);
    }
    Ok(Some(map))
}

/// The payload between the two magic words.
pub fn frozen_payload(map: &Mmap) -> &[u8] {
    &map[4..map.len() - 4]
}
