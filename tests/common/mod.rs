//! Support code for integration tests: a temporary workspace that compiles
//! small DAGs and drives the library the way the binary does.
#![allow(dead_code)]

use kiln::dag::{Builder, Dag};
use kiln::driver::{Driver, DriverOptions};
use kiln::queue::BuildResult;

pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        Ok(TestSpace {
            dir: tempfile::tempdir()?,
        })
    }

    /// Absolute path for a workspace-relative name.
    pub fn path(&self, rel: &str) -> String {
        self.dir.path().join(rel).to_str().unwrap().to_string()
    }

    pub fn write(&self, rel: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.path(rel), content)
    }

    pub fn read_str(&self, rel: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.path(rel))
    }

    pub fn exists(&self, rel: &str) -> bool {
        std::path::Path::new(&self.path(rel)).exists()
    }

    /// A DAG builder whose state and cache files live in this workspace.
    pub fn builder(&self, identifier: &str) -> Builder {
        let mut b = Builder::new(identifier);
        b.state_file = self.path(".kiln.state");
        b.scan_cache_file = self.path(".kiln.scancache");
        b.digest_cache_file = self.path(".kiln.digestcache");
        b
    }

    pub fn save_dag(&self, dag: &Dag) -> anyhow::Result<()> {
        dag.save(&self.path(".kiln.dag"))
    }

    pub fn options(&self) -> DriverOptions {
        DriverOptions {
            dag_file: self.path(".kiln.dag"),
            thread_count: 4,
            ..Default::default()
        }
    }

    /// Runs the full driver flow the binary uses, returning the build result
    /// and the number of actions executed.
    pub fn build_with(&self, options: DriverOptions) -> anyhow::Result<(BuildResult, u32)> {
        let dry_run = options.dry_run;
        let mut driver = Driver::new(options)?;
        driver.prepare_nodes()?;
        driver.remove_stale_outputs();
        let result = driver.build();
        if !dry_run {
            driver.save_build_state()?;
        }
        driver.save_caches()?;
        Ok((result, driver.executed_count()))
    }

    pub fn build(&self) -> anyhow::Result<(BuildResult, u32)> {
        self.build_with(self.options())
    }
}

/// Shell snippet copying `src` to `dst`.
pub fn copy_cmd(src: &str, dst: &str) -> String {
    format!("cp '{}' '{}'", src, dst)
}

/// Shell snippet writing a literal to `dst`.
pub fn write_cmd(content: &str, dst: &str) -> String {
    format!("printf '%s' '{}' > '{}'", content, dst)
}

/// Rewrites a file and makes sure its mtime moves even on coarse clocks.
pub fn touch_with_new_mtime(path: &str, content: &str) -> std::io::Result<()> {
    std::thread::sleep(std::time::Duration::from_millis(20));
    std::fs::write(path, content)
}
