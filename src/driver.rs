//! Composes the pieces into a build: loads the DAG, previous state and
//! caches, selects and closes over target nodes, garbage-collects stale
//! outputs, runs the queue pass by pass and persists the new state.

use crate::dag::{Dag, NodeId};
use crate::densemap::DenseMap;
use crate::digestcache::DigestCache;
use crate::hash::{djb2_path, Digest, Hasher};
use crate::printing::{Printer, StatusLevel};
use crate::queue::{BuildQueue, BuildQueueConfig, BuildResult, NodeState, PassRange};
use crate::scancache::ScanCache;
use crate::statcache::{stat_path, StatCache};
use crate::statefile::{self, StateFile};
use crate::terminal;
use anyhow::{anyhow, bail};
use hashbrown::HashSet;
use std::time::Instant;

pub struct DriverOptions {
    pub dag_file: String,
    pub targets: Vec<String>,
    pub thread_count: usize,
    pub verbose: bool,
    pub quiet: bool,
    pub continue_on_error: bool,
    pub dry_run: bool,
    pub clean: bool,
    pub rebuild: bool,
    pub max_expensive: Option<usize>,
    pub throttle_on_human_activity: bool,
    pub throttle_inactivity_period: u64,
    pub throttled_threads_amount: usize,
    pub emit_colors: bool,
}

impl Default for DriverOptions {
    fn default() -> DriverOptions {
        DriverOptions {
            dag_file: ".kiln.dag".to_string(),
            targets: Vec::new(),
            thread_count: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            verbose: false,
            quiet: false,
            continue_on_error: false,
            dry_run: false,
            clean: false,
            rebuild: false,
            max_expensive: None,
            throttle_on_human_activity: false,
            throttle_inactivity_period: 30,
            throttled_threads_amount: 0,
            emit_colors: false,
        }
    }
}

impl DriverOptions {
    pub fn for_console() -> DriverOptions {
        DriverOptions {
            emit_colors: terminal::use_colors(),
            ..Default::default()
        }
    }
}

pub struct Driver {
    pub options: DriverOptions,
    pub dag: Dag,
    prev_state: Option<StateFile>,
    stat_cache: StatCache,
    digest_cache: DigestCache,
    scan_cache: ScanCache,
    nodes: Vec<NodeState>,
    remap: DenseMap<NodeId, i32>,
    pass_node_count: Vec<usize>,
    executed: u32,
}

impl Driver {
    pub fn new(options: DriverOptions) -> anyhow::Result<Driver> {
        let dag = Dag::load(&options.dag_file)?.ok_or_else(|| {
            anyhow!(
                "no DAG file at {} - generate one with the frontend first",
                options.dag_file
            )
        })?;

        // The binary-search contracts everything below relies on.
        for pair in dag.guids.windows(2) {
            if pair[0] >= pair[1] {
                bail!(
                    "{}: DAG node guids are not sorted and unique",
                    options.dag_file
                );
            }
        }
        if dag.passes.is_empty() {
            bail!("{}: DAG names no passes", options.dag_file);
        }

        let prev_state = StateFile::load(&dag.state_file);
        let digest_cache = DigestCache::load(&dag.digest_cache_file);
        let scan_cache = ScanCache::load(&dag.scan_cache_file);

        let driver = Driver {
            options,
            dag,
            prev_state,
            stat_cache: StatCache::new(),
            digest_cache,
            scan_cache,
            nodes: Vec::new(),
            remap: DenseMap::new(),
            pass_node_count: Vec::new(),
            executed: 0,
        };
        driver.check_dag_freshness();
        Ok(driver)
    }

    fn printer(&self) -> Printer {
        Printer::new(self.nodes.len().max(1), self.options.emit_colors)
    }

    /// Re-validates the file and glob signatures recorded when the DAG was
    /// compiled.  A mismatch means the frontend should regenerate the DAG;
    /// we warn and build with what we have.
    fn check_dag_freshness(&self) {
        let mut printer = self.printer();
        for sig in &self.dag.file_signatures {
            let info = stat_path(&sig.path);
            let timestamp = if info.exists { info.timestamp } else { 0 };
            if timestamp != sig.timestamp {
                printer.service_message(
                    StatusLevel::Warning,
                    &format!(
                        "build file {} changed since the DAG was generated - rerun the frontend to pick it up",
                        sig.path
                    ),
                );
            }
        }
        for sig in &self.dag.glob_signatures {
            let digest =
                compute_glob_signature(&sig.path, sig.filter.as_deref(), sig.recurse);
            if digest != sig.digest {
                printer.service_message(
                    StatusLevel::Warning,
                    &format!(
                        "folder contents of {} changed since the DAG was generated - rerun the frontend to pick it up",
                        sig.path
                    ),
                );
            }
        }
    }

    /// Maps the requested targets to DAG nodes: named nodes first, then
    /// output file paths.
    fn select_nodes(&self) -> anyhow::Result<Vec<NodeId>> {
        let dag = &self.dag;
        let mut selected = Vec::new();

        if self.options.targets.is_empty() {
            if dag.default_nodes.is_empty() {
                bail!("no targets requested and the DAG names no default nodes");
            }
            selected.extend_from_slice(&dag.default_nodes);
            return Ok(selected);
        }

        for name in &self.options.targets {
            if let Some(named) = dag.named_nodes.iter().find(|n| &n.name == name) {
                selected.push(named.node);
                continue;
            }
            let hash = djb2_path(name);
            let mut found = false;
            for (index, node) in dag.nodes.iter().enumerate() {
                if node
                    .output_files
                    .iter()
                    .any(|f| f.hash == hash && f.path == *name)
                {
                    selected.push(NodeId(index as u32));
                    found = true;
                    break;
                }
            }
            if !found {
                bail!("unable to map {} to any named node or output file", name);
            }
        }
        Ok(selected)
    }

    /// Computes the active node set (transitive closure of the selection),
    /// sorts it by pass and builds the DAG-to-state remapping table.
    pub fn prepare_nodes(&mut self) -> anyhow::Result<()> {
        let mut stack = self.select_nodes()?;
        let dag = &self.dag;

        let mut visited = vec![false; dag.nodes.len()];
        let mut selected: Vec<NodeId> = Vec::new();
        while let Some(id) = stack.pop() {
            let index = id.0 as usize;
            if visited[index] {
                continue;
            }
            visited[index] = true;
            selected.push(id);
            stack.extend_from_slice(&dag.nodes[index].dependencies);
        }

        let mut nodes: Vec<NodeState> = selected
            .into_iter()
            .map(|id| {
                let prev = self
                    .prev_state
                    .as_ref()
                    .and_then(|p| p.find_index(dag.guid_of(id)));
                NodeState::new(id, prev, dag.node(id).pass_index)
            })
            .collect();

        // Stable sort: pass ranges stay contiguous, selection order is
        // preserved within a pass.
        nodes.sort_by_key(|n| n.pass_index);

        let mut remap: DenseMap<NodeId, i32> = DenseMap::new_sized(dag.nodes.len(), -1);
        let mut pass_node_count = vec![0usize; dag.passes.len()];
        for (state_index, node) in nodes.iter().enumerate() {
            *remap.get_mut(node.dag_index) = state_index as i32;
            pass_node_count[node.pass_index as usize] += 1;
        }

        self.nodes = nodes;
        self.remap = remap;
        self.pass_node_count = pass_node_count;
        Ok(())
    }

    pub fn selected_node_count(&self) -> usize {
        self.nodes.len()
    }

    fn pass_ranges(&self) -> Vec<PassRange> {
        let mut ranges = Vec::with_capacity(self.pass_node_count.len());
        let mut start = 0;
        for (pass_index, count) in self.pass_node_count.iter().enumerate() {
            ranges.push(PassRange {
                pass_index: pass_index as u32,
                start,
                count: *count,
            });
            start += count;
        }
        ranges
    }

    /// Deletes files the previous build produced that no node of the current
    /// DAG produces anymore, plus any directories that become empty.
    pub fn remove_stale_outputs(&mut self) {
        let Some(state) = &self.prev_state else {
            return;
        };
        let dag = &self.dag;

        let mut current: HashSet<&str> = HashSet::new();
        for node in &dag.nodes {
            for file in node.output_files.iter().chain(&node.aux_output_files) {
                current.insert(file.path.as_str());
            }
        }

        // Candidate files plus all their parent directories; we rely on
        // rmdir refusing to remove non-empty directories.
        let mut nuke: HashSet<String> = HashSet::new();
        for entry in &state.states {
            if !entry.seen_in(dag.identifier) {
                continue;
            }
            for path in entry.output_files.iter().chain(&entry.aux_output_files) {
                if current.contains(path.as_str()) {
                    continue;
                }
                nuke.insert(path.clone());
                let mut parent = std::path::Path::new(path.as_str());
                while let Some(dir) = parent.parent() {
                    if dir.as_os_str().is_empty() {
                        break;
                    }
                    nuke.insert(dir.to_string_lossy().into_owned());
                    parent = dir;
                }
            }
        }

        if nuke.is_empty() {
            return;
        }

        // Descending path length removes files and subdirectories before
        // their parent directories.
        let mut paths: Vec<String> = nuke.into_iter().collect();
        paths.sort_by(|l, r| r.len().cmp(&l.len()).then_with(|| l.cmp(r)));

        let started = Instant::now();
        for path in &paths {
            if std::fs::remove_file(path).is_err() {
                let _ = std::fs::remove_dir(path);
            }
            self.stat_cache.mark_dirty(path);
        }

        self.printer().print_non_node_result(
            started.elapsed().as_secs(),
            StatusLevel::Success,
            &format!(
                "Delete {} artifact files that are no longer in use. (like {})",
                paths.len(),
                paths[0]
            ),
            None,
        );
    }

    /// Removes the outputs of every selected node (--clean / --rebuild).
    pub fn clean_outputs(&self) -> usize {
        let mut count = 0;
        for node in &self.nodes {
            for file in &self.dag.node(node.dag_index).output_files {
                if std::fs::remove_file(&file.path).is_ok() {
                    count += 1;
                }
                self.stat_cache.mark_dirty(&file.path);
            }
        }
        count
    }

    pub fn build(&mut self) -> BuildResult {
        let thread_count = self.options.thread_count.max(1);
        let max_expensive = match self.options.max_expensive {
            Some(n) => n.clamp(1, thread_count),
            None => {
                if self.dag.max_expensive_count < 0 {
                    thread_count
                } else {
                    (self.dag.max_expensive_count as usize).clamp(1, thread_count)
                }
            }
        };

        let config = BuildQueueConfig {
            echo_command_lines: self.options.verbose,
            continue_on_error: self.options.continue_on_error,
            dry_run: self.options.dry_run,
            emit_colors: self.options.emit_colors,
            thread_count,
            max_expensive_count: max_expensive,
            throttle_on_human_activity: self.options.throttle_on_human_activity,
            throttle_inactivity_period: self.options.throttle_inactivity_period,
            throttled_threads_amount: self.options.throttled_threads_amount,
            dag: &self.dag,
            remap: &self.remap,
            prev_state: self.prev_state.as_ref(),
            stat_cache: &self.stat_cache,
            digest_cache: &self.digest_cache,
            scan_cache: &self.scan_cache,
            activity_probe: None,
        };

        let ranges = self.pass_ranges();
        let queue = BuildQueue::new(config, std::mem::take(&mut self.nodes));
        let result = queue.run(&ranges);
        let (nodes, executed) = queue.into_parts();
        self.nodes = nodes;
        self.executed = executed;
        result
    }

    pub fn executed_count(&self) -> u32 {
        self.executed
    }

    pub fn save_build_state(&self) -> anyhow::Result<()> {
        statefile::save_build_state(
            &self.dag.state_file,
            &self.dag,
            self.prev_state.as_ref(),
            &self.nodes,
            &self.stat_cache,
            &self.scan_cache,
        )
    }

    pub fn save_caches(&self) -> anyhow::Result<()> {
        if self.scan_cache.is_dirty() {
            self.scan_cache.save(&self.dag.scan_cache_file)?;
        }
        if self.digest_cache.is_dirty() {
            self.digest_cache.save(&self.dag.digest_cache_file)?;
        }
        Ok(())
    }
}

/// Fingerprint of a directory listing (or single file) recorded by the DAG
/// compiler.  Must stay in sync with the frontend's computation.
pub fn compute_glob_signature(path: &str, filter: Option<&str>, recurse: bool) -> Digest {
    let mut h = Hasher::new();
    let info = stat_path(path);
    h.add_u64(info.exists as u64);
    h.add_u64(info.is_dir as u64);
    h.add_separator();

    if info.exists && info.is_dir {
        let mut dirs: Vec<String> = Vec::new();
        let mut files: Vec<String> = Vec::new();
        list_directory(path, filter, recurse, &mut dirs, &mut files);
        dirs.sort();
        files.sort();
        for dir in &dirs {
            h.add_path(dir);
            h.add_separator();
        }
        // An extra separator catches a directory turning into a file.
        h.add_separator();
        for file in &files {
            h.add_path(file);
            h.add_separator();
        }
    } else if info.exists {
        h.add_u64(info.timestamp);
    }

    h.finish()
}

fn list_directory(
    path: &str,
    filter: Option<&str>,
    recurse: bool,
    dirs: &mut Vec<String>,
    files: &mut Vec<String>,
) {
    let Ok(entries) = std::fs::read_dir(path) else {
        return;
    };
    for entry in entries.flatten() {
        let entry_path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let full = entry_path.to_string_lossy().into_owned();
        if entry_path.is_dir() {
            dirs.push(full.clone());
            if recurse {
                list_directory(&full, filter, recurse, dirs, files);
            }
        } else if filter.map_or(true, |f| wildcard_match(f, &name)) {
            files.push(full);
        }
    }
}

/// Single-star wildcard match, the only pattern form glob signatures use.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}
