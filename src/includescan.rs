//! Scanner adapter: discovers implicit dependencies (includes) of an input
//! file.  Two scanner kinds exist: a C-preprocessor-style `#include` chase
//! and a generic keyword scanner.  Per-file raw scans are memoized in the
//! scan cache; the adapter walks the include closure and deduplicates.
//!
//! Safe to call concurrently; all mutable state lives in the caller's
//! scratch.

use crate::dag::{ScannerData, ScannerKind};
use crate::hash::djb2_path;
use crate::scancache::{scan_key, ScanCache, ScanEntry, ScanInclude};
use crate::statcache::StatCache;
use hashbrown::HashSet;

/// An include directive lifted out of a source line.
struct Directive<'a> {
    path: &'a str,
    /// Quoted includes also search next to the including file.
    relative_first: bool,
    follow: bool,
}

/// Reusable per-thread scratch, reset between nodes.
#[derive(Default)]
pub struct ScanScratch {
    seen: HashSet<String>,
    stack: Vec<String>,
}

impl ScanScratch {
    pub fn new() -> ScanScratch {
        ScanScratch::default()
    }

    fn reset(&mut self) {
        self.seen.clear();
        self.stack.clear();
    }
}

/// Returns the transitive set of files included by `root`, resolved and
/// deduplicated, paired with their path hashes.  `root` itself is not
/// included.
pub fn scan_implicit_deps(
    stat_cache: &StatCache,
    scan_cache: &ScanCache,
    scanner: &ScannerData,
    root: &str,
    scratch: &mut ScanScratch,
) -> Vec<(String, u32)> {
    scratch.reset();
    scratch.stack.push(root.to_string());
    let mut result = Vec::new();

    while let Some(file) = scratch.stack.pop() {
        for include in direct_includes(stat_cache, scan_cache, scanner, &file) {
            if scratch.seen.contains(include.path.as_str()) {
                continue;
            }
            scratch.seen.insert(include.path.clone());
            let hash = djb2_path(&include.path);
            if include.follow {
                scratch.stack.push(include.path.clone());
            }
            result.push((include.path, hash));
        }
    }

    result
}

/// The resolved direct includes of one file, through the scan cache.
fn direct_includes(
    stat_cache: &StatCache,
    scan_cache: &ScanCache,
    scanner: &ScannerData,
    file: &str,
) -> Vec<ScanInclude> {
    let info = stat_cache.stat(file);
    if !info.exists {
        return Vec::new();
    }

    let key = scan_key(&scanner.guid, file);
    if let Some(includes) = scan_cache.get(&key, info.timestamp) {
        return includes;
    }

    let bytes = match std::fs::read(file) {
        Ok(b) => b,
        Err(_) => return Vec::new(),
    };
    let text = String::from_utf8_lossy(&bytes);

    let mut includes = Vec::new();
    for line in text.lines() {
        let directive = match scanner.kind {
            ScannerKind::Cpp => parse_cpp_line(line),
            ScannerKind::Generic => parse_generic_line(line, scanner),
        };
        let Some(directive) = directive else {
            continue;
        };
        if let Some(resolved) = resolve_include(stat_cache, scanner, file, &directive) {
            includes.push(ScanInclude {
                path: resolved,
                follow: directive.follow,
            });
        }
    }

    scan_cache.insert(
        key,
        ScanEntry {
            timestamp: info.timestamp,
            includes: includes.clone(),
        },
    );
    includes
}

fn parse_cpp_line(line: &str) -> Option<Directive> {
    let rest = line.trim_start();
    let rest = rest.strip_prefix('#')?.trim_start();
    let rest = rest.strip_prefix("include")?.trim_start();
    parse_bracketed(rest, /*bare_means_system=*/ false)
}

fn parse_generic_line<'a>(line: &'a str, scanner: &ScannerData) -> Option<Directive<'a>> {
    let config = &scanner.generic;
    let trimmed = line.trim_start();
    for keyword in &config.keywords {
        let Some(rest) = trimmed.strip_prefix(keyword.text.as_str()) else {
            continue;
        };
        if config.require_whitespace && !rest.starts_with([' ', '\t']) {
            continue;
        }
        let rest = rest.trim_start();
        let mut directive = parse_bracketed(rest, config.bare_means_system)?;
        directive.follow = keyword.follow;
        return Some(directive);
    }
    None
}

/// Extracts `"path"`, `<path>` or a bare token.
fn parse_bracketed(s: &str, bare_means_system: bool) -> Option<Directive> {
    if let Some(rest) = s.strip_prefix('"') {
        let end = rest.find('"')?;
        return Some(Directive {
            path: &rest[..end],
            relative_first: true,
            follow: true,
        });
    }
    if let Some(rest) = s.strip_prefix('<') {
        let end = rest.find('>')?;
        return Some(Directive {
            path: &rest[..end],
            relative_first: false,
            follow: true,
        });
    }
    let token = s.split_whitespace().next()?;
    if token.is_empty() {
        return None;
    }
    Some(Directive {
        path: token,
        relative_first: !bare_means_system,
        follow: true,
    })
}

/// Resolves a directive against the directory of the including file (for
/// quoted forms) and the scanner's include paths.  Only files that exist
/// become dependencies.
fn resolve_include(
    stat_cache: &StatCache,
    scanner: &ScannerData,
    includer: &str,
    directive: &Directive,
) -> Option<String> {
    if directive.relative_first {
        let dir = match includer.rfind('/') {
            Some(pos) => &includer[..pos],
            None => ".",
        };
        let candidate = join(dir, directive.path);
        if stat_cache.stat(&candidate).exists {
            return Some(candidate);
        }
    }
    for base in &scanner.include_paths {
        let candidate = join(base, directive.path);
        if stat_cache.stat(&candidate).exists {
            return Some(candidate);
        }
    }
    None
}

fn join(dir: &str, rel: &str) -> String {
    if dir.is_empty() || dir == "." {
        rel.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{GenericScannerConfig, Keyword};
    use crate::hash::{Digest, DIGEST_SIZE};

    fn cpp_scanner(include_paths: Vec<String>) -> ScannerData {
        ScannerData {
            kind: ScannerKind::Cpp,
            include_paths,
            generic: GenericScannerConfig::default(),
            guid: Digest([5; DIGEST_SIZE]),
        }
    }

    fn scan(dir: &std::path::Path, scanner: &ScannerData, root: &str) -> Vec<String> {
        let stat_cache = StatCache::new();
        let scan_cache = ScanCache::new();
        let mut scratch = ScanScratch::new();
        let root = dir.join(root).to_str().unwrap().to_string();
        let mut deps: Vec<String> =
            scan_implicit_deps(&stat_cache, &scan_cache, scanner, &root, &mut scratch)
                .into_iter()
                .map(|(path, _)| {
                    path.strip_prefix(&format!("{}/", dir.display()))
                        .unwrap_or(&path)
                        .to_string()
                })
                .collect();
        deps.sort();
        deps
    }

    #[test]
    fn recursive_chase_dedups() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("main.c"),
            "#include \"a.h\"\n#include \"b.h\"\n",
        )?;
        std::fs::write(dir.path().join("a.h"), "#include \"c.h\"\n")?;
        std::fs::write(dir.path().join("b.h"), "#include \"c.h\"\n")?;
        std::fs::write(dir.path().join("c.h"), "int c;\n")?;

        let scanner = cpp_scanner(vec![]);
        assert_eq!(scan(dir.path(), &scanner, "main.c"), ["a.h", "b.h", "c.h"]);
        Ok(())
    }

    #[test]
    fn angle_includes_use_include_paths_only() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("inc"))?;
        std::fs::write(dir.path().join("main.c"), "#include <sys.h>\n")?;
        std::fs::write(dir.path().join("inc/sys.h"), "")?;
        // A same-named file next to the includer must not win for <>.
        std::fs::write(dir.path().join("sys.h"), "")?;

        let scanner = cpp_scanner(vec![dir.path().join("inc").to_str().unwrap().to_string()]);
        let deps = scan(dir.path(), &scanner, "main.c");
        assert_eq!(deps, ["inc/sys.h"]);
        Ok(())
    }

    #[test]
    fn missing_includes_are_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("main.c"), "#include \"gone.h\"\n")?;
        let scanner = cpp_scanner(vec![]);
        assert!(scan(dir.path(), &scanner, "main.c").is_empty());
        Ok(())
    }

    #[test]
    fn generic_keyword_scanner() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("main.s"),
            "INCLUDE macros.inc\nIMPORT other.s\n",
        )?;
        std::fs::write(dir.path().join("macros.inc"), "")?;
        std::fs::write(dir.path().join("other.s"), "INCLUDE macros.inc\n")?;

        let scanner = ScannerData {
            kind: ScannerKind::Generic,
            include_paths: vec![dir.path().to_str().unwrap().to_string()],
            generic: GenericScannerConfig {
                require_whitespace: true,
                bare_means_system: true,
                keywords: vec![
                    Keyword {
                        text: "INCLUDE".to_string(),
                        follow: false,
                    },
                    Keyword {
                        text: "IMPORT".to_string(),
                        follow: true,
                    },
                ],
            },
            guid: Digest([6; DIGEST_SIZE]),
        };
        // IMPORT is followed into other.s, whose INCLUDE is recorded but not
        // followed further.
        let deps = scan(dir.path(), &scanner, "main.s");
        assert_eq!(deps, ["macros.inc", "other.s"]);
        Ok(())
    }

    #[test]
    fn cache_entry_reused_until_file_changes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let main = dir.path().join("main.c").to_str().unwrap().to_string();
        std::fs::write(&main, "#include \"a.h\"\n")?;
        std::fs::write(dir.path().join("a.h"), "")?;

        let stat_cache = StatCache::new();
        let scan_cache = ScanCache::new();
        let scanner = cpp_scanner(vec![]);
        let mut scratch = ScanScratch::new();

        let first =
            scan_implicit_deps(&stat_cache, &scan_cache, &scanner, &main, &mut scratch);
        assert_eq!(first.len(), 1);
        assert!(scan_cache.is_dirty());

        // Delete the file behind the cache's back; the memoized entry still
        // answers while the cached stat is unchanged.
        std::fs::remove_file(&main)?;
        let second =
            scan_implicit_deps(&stat_cache, &scan_cache, &scanner, &main, &mut scratch);
        assert_eq!(second.len(), 1);
        Ok(())
    }
}
