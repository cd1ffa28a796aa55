//! The build queue: a per-node progress machine advanced concurrently by a
//! pool of worker threads under one coarse lock.
//!
//! The threading policy is that only one worker at a time walks the queue
//! data structures and decides what to do next; it releases the lock while
//! the actual work (signature hashing, process execution) runs, then
//! re-acquires it to publish the outcome.  You _have_ to hold the lock while
//! touching the queue or any node's state, and you _cannot_ hold it across
//! anything that blocks for a nontrivial amount of time.

use crate::dag::{node_flags, Dag, NodeId};
use crate::densemap::DenseMap;
use crate::digestcache::DigestCache;
use crate::exec::{self, ExecResult};
use crate::hash::{Digest, Hasher};
use crate::includescan::{scan_implicit_deps, ScanScratch};
use crate::printing::{NodeResultData, Printer, StatusLevel};
use crate::scancache::ScanCache;
use crate::signal;
use crate::signer::{compute_file_signature, SignContext};
use crate::statcache::{stat_path, StatCache};
use crate::statefile::StateFile;
use crate::throttle::{self, ThrottleAction};
use crate::validate::{validate_output, ValidationResult};
use hashbrown::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const MAX_BUILD_THREADS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResult {
    Ok,
    Interrupted,
    BuildError,
    SetupError,
}

impl BuildResult {
    pub fn exit_code(self) -> i32 {
        match self {
            BuildResult::Ok => 0,
            BuildResult::Interrupted => 1,
            BuildResult::BuildError => 2,
            BuildResult::SetupError => 3,
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            BuildResult::Ok => "build success",
            BuildResult::Interrupted => "build interrupted",
            BuildResult::BuildError => "build failed",
            BuildResult::SetupError => "build failed to set up",
        })
    }
}

/// Per-node progress.  Terminal is Completed; Blocked is re-entered until all
/// dependencies complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Progress {
    Initial,
    Blocked,
    Unblocked,
    RunAction,
    UpToDate,
    Succeeded,
    Failed,
    Completed,
}

const FLAG_QUEUED: u8 = 1 << 0;
const FLAG_ACTIVE: u8 = 1 << 1;

/// Mutable per-run state of one selected node.
pub struct NodeState {
    pub dag_index: NodeId,
    /// Index into the previous StateFile's entries, if the node was seen
    /// before.
    pub prev_state: Option<usize>,
    pub progress: Progress,
    pub build_result: i32,
    pub input_signature: Digest,
    pub pass_index: u32,
    flags: u8,
}

impl NodeState {
    pub fn new(dag_index: NodeId, prev_state: Option<usize>, pass_index: u32) -> NodeState {
        NodeState {
            dag_index,
            prev_state,
            progress: Progress::Initial,
            build_result: 0,
            input_signature: Digest::default(),
            pass_index,
            flags: 0,
        }
    }

    fn is_queued(&self) -> bool {
        self.flags & FLAG_QUEUED != 0
    }
    fn is_active(&self) -> bool {
        self.flags & FLAG_ACTIVE != 0
    }
    fn flag_queued(&mut self) {
        self.flags |= FLAG_QUEUED;
    }
    fn flag_unqueued(&mut self) {
        self.flags &= !FLAG_QUEUED;
    }
    fn flag_active(&mut self) {
        self.flags |= FLAG_ACTIVE;
    }
    fn flag_inactive(&mut self) {
        self.flags &= !FLAG_ACTIVE;
    }
}

/// One pass worth of nodes: a contiguous range of the (pass-sorted) node
/// state array.
#[derive(Debug, Clone, Copy)]
pub struct PassRange {
    pub pass_index: u32,
    pub start: usize,
    pub count: usize,
}

pub struct BuildQueueConfig<'a> {
    pub echo_command_lines: bool,
    pub continue_on_error: bool,
    pub dry_run: bool,
    pub emit_colors: bool,
    pub thread_count: usize,
    pub max_expensive_count: usize,
    pub throttle_on_human_activity: bool,
    pub throttle_inactivity_period: u64,
    /// 0 means auto (60% of threads).
    pub throttled_threads_amount: usize,
    pub dag: &'a Dag,
    /// DAG index to state index, -1 for unselected nodes.
    pub remap: &'a DenseMap<NodeId, i32>,
    pub prev_state: Option<&'a StateFile>,
    pub stat_cache: &'a StatCache,
    pub digest_cache: &'a DigestCache,
    pub scan_cache: &'a ScanCache,
    /// Test/platform hook for human activity detection.
    pub activity_probe: Option<&'a (dyn Fn() -> Option<f64> + Sync)>,
}

/// Everything the workers mutate, guarded by the one queue lock.
struct QueueState {
    ring: Vec<u32>,
    mask: u32,
    read: u32,
    write: u32,
    pending: i32,
    failed: i32,
    processed: u32,
    executed: u32,
    active: u32,
    current_pass: u32,
    expensive_running: i32,
    expensive_wait: Vec<u32>,
    cleanup_requested: bool,
    dynamic_max_jobs: usize,
    nodes: Vec<NodeState>,
    printer: Printer,
}

impl QueueState {
    fn available(&self) -> u32 {
        (self.write.wrapping_sub(self.read)) & self.mask
    }

    fn enqueue(&mut self, state_index: u32) {
        let node = &self.nodes[state_index as usize];
        debug_assert!(!node.is_queued());
        debug_assert!(!node.is_active());
        debug_assert!(node.progress != Progress::Completed);
        let write = self.write;
        self.ring[write as usize] = state_index;
        self.write = (write + 1) & self.mask;
        self.nodes[state_index as usize].flag_queued();
    }

    fn next_node(&mut self) -> Option<u32> {
        if self.available() == 0 {
            return None;
        }
        let state_index = self.ring[self.read as usize];
        self.read = (self.read + 1) & self.mask;
        let node = &mut self.nodes[state_index as usize];
        debug_assert!(node.is_queued());
        debug_assert!(!node.is_active());
        node.flag_unqueued();
        node.flag_active();
        self.active += 1;
        Some(state_index)
    }
}

struct ThreadState {
    #[allow(dead_code)]
    index: usize,
    scratch: ScanScratch,
}

fn next_power_of_two(n: usize) -> usize {
    n.next_power_of_two()
}

pub struct BuildQueue<'a> {
    config: BuildQueueConfig<'a>,
    thread_count: usize,
    lock: Mutex<QueueState>,
    work_available: Condvar,
    max_jobs_changed: Condvar,
    finished_lock: Mutex<bool>,
    build_finished: Condvar,
    shared_created: Vec<AtomicU32>,
    shared_lock: Mutex<()>,
}

impl<'a> BuildQueue<'a> {
    pub fn new(config: BuildQueueConfig<'a>, nodes: Vec<NodeState>) -> BuildQueue<'a> {
        let mut printer = Printer::new(nodes.len(), config.emit_colors);
        let mut thread_count = config.thread_count.max(1);
        if thread_count > MAX_BUILD_THREADS {
            printer.service_message(
                StatusLevel::Warning,
                &format!(
                    "too many build threads ({}) - clamping to {}",
                    thread_count, MAX_BUILD_THREADS
                ),
            );
            thread_count = MAX_BUILD_THREADS;
        }

        // Power-of-two capacity at least one larger than the node count:
        // the ring buffer treats read == write as empty.
        let capacity = next_power_of_two(nodes.len() + 1);
        let shared_created = (0..config.dag.shared_resources.len())
            .map(|_| AtomicU32::new(0))
            .collect();

        let state = QueueState {
            ring: vec![0; capacity],
            mask: (capacity - 1) as u32,
            read: 0,
            write: 0,
            pending: 0,
            failed: 0,
            processed: 0,
            executed: 0,
            active: 0,
            current_pass: 0,
            expensive_running: 0,
            expensive_wait: Vec::new(),
            cleanup_requested: false,
            dynamic_max_jobs: thread_count,
            nodes,
            printer,
        };

        BuildQueue {
            config,
            thread_count,
            lock: Mutex::new(state),
            work_available: Condvar::new(),
            max_jobs_changed: Condvar::new(),
            finished_lock: Mutex::new(false),
            build_finished: Condvar::new(),
            shared_created,
            shared_lock: Mutex::new(()),
        }
    }

    /// Runs every pass to completion (or failure/interrupt), then tears the
    /// queue down: wakes and joins the workers, destroys shared resources
    /// and flushes deferred failure output.
    pub fn run(&self, passes: &[PassRange]) -> BuildResult {
        let result = std::thread::scope(|scope| {
            for i in 0..self.thread_count {
                scope.spawn(move || self.build_loop(i));
            }

            let mut result = BuildResult::Ok;
            for pass in passes {
                if pass.count == 0 {
                    continue;
                }
                result = self.build_node_range(*pass);
                if result != BuildResult::Ok {
                    break;
                }
            }

            let mut state = self.lock.lock().unwrap();
            state.cleanup_requested = true;
            drop(state);
            // Workers are either waiting for work or for the job limit to
            // change; wake both sets so they notice the cleanup flag.
            self.work_available.notify_all();
            self.max_jobs_changed.notify_all();

            result
        });

        self.destroy_shared_resources();
        self.lock.lock().unwrap().printer.flush_deferred();
        result
    }

    /// Consumes the queue, handing back node states (for state persistence)
    /// and the count of actions actually executed.
    pub fn into_parts(self) -> (Vec<NodeState>, u32) {
        let state = self.lock.into_inner().unwrap();
        (state.nodes, state.executed)
    }

    fn build_node_range(&self, range: PassRange) -> BuildResult {
        {
            let mut state = self.lock.lock().unwrap();
            state.current_pass = range.pass_index;
            state.read = 0;
            state.write = 0;
            for i in 0..range.count {
                let state_index = (range.start + i) as u32;
                debug_assert_eq!(
                    state.nodes[state_index as usize].progress,
                    Progress::Initial
                );
                state.enqueue(state_index);
            }
            state.pending = range.count as i32;
            state.failed = 0;
        }
        self.work_available.notify_all();

        // Sleep until the pass finishes, waking periodically to re-evaluate
        // throttling and notice interrupts (the signal handler only sets a
        // flag).
        let mut throttled = false;
        loop {
            self.process_throttling(&mut throttled);
            let finished = self.finished_lock.lock().unwrap();
            if *finished || signal::is_interrupted() {
                break;
            }
            let _ = self
                .build_finished
                .wait_timeout(finished, Duration::from_millis(100))
                .unwrap();
        }
        *self.finished_lock.lock().unwrap() = false;

        let state = self.lock.lock().unwrap();
        if signal::is_interrupted() {
            BuildResult::Interrupted
        } else if state.failed > 0 {
            BuildResult::BuildError
        } else {
            BuildResult::Ok
        }
    }

    fn signal_build_finished(&self) {
        let mut finished = self.finished_lock.lock().unwrap();
        *finished = true;
        self.build_finished.notify_one();
    }

    fn should_keep_building(&self, state: &QueueState) -> bool {
        if state.cleanup_requested {
            return false;
        }
        // Without this, workers would continue to drain nodes whose
        // dependencies already failed.
        if state.failed > 0 && !self.config.continue_on_error {
            return false;
        }
        true
    }

    fn build_loop(&self, thread_index: usize) {
        let mut thread_state = ThreadState {
            index: thread_index,
            scratch: ScanScratch::new(),
        };

        let mut guard = self.lock.lock().unwrap();
        while self.should_keep_building(&guard) {
            if thread_index >= guard.dynamic_max_jobs {
                // Hibernate until the throttle policy changes the limit.
                guard = self.max_jobs_changed.wait(guard).unwrap();
                continue;
            }

            if let Some(state_index) = guard.next_node() {
                guard = self.advance_node(&mut thread_state, guard, state_index);
                continue;
            }

            // Nothing runnable.  If failures (under -k) starved the rest of
            // the pass, pending never reaches zero; tell the main thread the
            // remainder is un-runnable.
            if guard.failed > 0
                && guard.pending > 0
                && guard.active == 0
                && guard.expensive_wait.is_empty()
            {
                self.signal_build_finished();
            }

            guard = self.work_available.wait(guard).unwrap();
        }
        drop(guard);
    }

    fn state_index(&self, id: NodeId) -> Option<u32> {
        match *self.config.remap.get(id) {
            -1 => None,
            i => Some(i as u32),
        }
    }

    fn all_dependencies_ready(&self, state: &QueueState, state_index: u32) -> bool {
        let data = self.config.dag.node(state.nodes[state_index as usize].dag_index);
        data.dependencies.iter().all(|dep| {
            let dep_index = self.state_index(*dep).expect("dependency not selected");
            state.nodes[dep_index as usize].progress == Progress::Completed
        })
    }

    fn dependencies_ready_and_successful(&self, state: &QueueState, state_index: u32) -> bool {
        let data = self.config.dag.node(state.nodes[state_index as usize].dag_index);
        data.dependencies.iter().all(|dep| {
            let dep_index = self.state_index(*dep).expect("dependency not selected");
            let dep_state = &state.nodes[dep_index as usize];
            dep_state.progress == Progress::Completed && dep_state.build_result == 0
        })
    }

    fn wake_waiters(&self, count: usize) {
        if count > 1 {
            self.work_available.notify_all();
        } else {
            self.work_available.notify_one();
        }
    }

    fn advance_node<'s>(
        &'s self,
        thread_state: &mut ThreadState,
        mut guard: MutexGuard<'s, QueueState>,
        state_index: u32,
    ) -> MutexGuard<'s, QueueState> {
        let si = state_index as usize;
        debug_assert!(guard.nodes[si].is_active());
        debug_assert!(!guard.nodes[si].is_queued());

        loop {
            match guard.nodes[si].progress {
                Progress::Initial => {
                    let next = self.setup_dependencies(&mut guard, state_index);
                    guard.nodes[si].progress = next;
                    if next == Progress::Blocked {
                        // Park until a dependency's completion wakes us.
                        guard.nodes[si].flag_inactive();
                        guard.active -= 1;
                        return guard;
                    }
                }

                Progress::Blocked => {
                    debug_assert!(self.all_dependencies_ready(&guard, state_index));
                    guard.nodes[si].progress = Progress::Unblocked;
                }

                Progress::Unblocked => {
                    let (g, next) = self.check_input_signature(thread_state, guard, state_index);
                    guard = g;
                    guard.nodes[si].progress = next;
                }

                Progress::RunAction => {
                    let (g, next) = self.run_action(guard, state_index);
                    guard = g;
                    guard.nodes[si].progress = next;

                    // Still RunAction means we were parked as an expensive
                    // job; a finishing expensive job re-enqueues us later.
                    if next == Progress::RunAction {
                        guard.nodes[si].flag_inactive();
                        guard.active -= 1;
                        return guard;
                    }
                }

                Progress::UpToDate | Progress::Succeeded => {
                    guard.nodes[si].build_result = 0;
                    guard.nodes[si].progress = Progress::Completed;
                }

                Progress::Failed => {
                    guard.failed += 1;
                    guard.nodes[si].build_result = 1;
                    guard.nodes[si].progress = Progress::Completed;
                    if !self.config.continue_on_error {
                        self.signal_build_finished();
                    }
                }

                Progress::Completed => {
                    guard.pending -= 1;
                    self.unblock_waiters(&mut guard, state_index);
                    guard.nodes[si].flag_inactive();
                    guard.active -= 1;
                    if guard.pending == 0 {
                        self.signal_build_finished();
                    }
                    return guard;
                }
            }
        }
    }

    /// Examines a node's dependencies, enqueueing any that haven't started.
    /// Returns Blocked when there is anything to wait for.
    fn setup_dependencies(&self, state: &mut QueueState, state_index: u32) -> Progress {
        let node_id = state.nodes[state_index as usize].dag_index;
        let data = self.config.dag.node(node_id);

        let mut waits_needed = 0;
        let mut enqueue_count = 0;
        for dep in &data.dependencies {
            let dep_index = self.state_index(*dep).expect("dependency not selected");
            let dep_state = &state.nodes[dep_index as usize];
            debug_assert!(dep_state.pass_index <= state.nodes[state_index as usize].pass_index);

            if dep_state.progress == Progress::Completed {
                // A failed dependency never becomes satisfied; the node
                // stays blocked for the rest of the pass.
                if dep_state.build_result != 0 {
                    waits_needed += 1;
                }
                continue;
            }
            waits_needed += 1;

            if !dep_state.is_queued()
                && !dep_state.is_active()
                && dep_state.progress != Progress::Blocked
            {
                state.enqueue(dep_index);
                enqueue_count += 1;
            }
        }

        if enqueue_count > 0 {
            self.wake_waiters(enqueue_count);
        }
        if waits_needed > 0 {
            Progress::Blocked
        } else {
            Progress::Unblocked
        }
    }

    /// Walks a completed node's back-links and enqueues every waiter in the
    /// current pass whose dependencies are now all complete.
    fn unblock_waiters(&self, state: &mut QueueState, state_index: u32) {
        let node_id = state.nodes[state_index as usize].dag_index;
        let data = self.config.dag.node(node_id);

        let mut enqueue_count = 0;
        for link in &data.back_links {
            let Some(waiter_index) = self.state_index(*link) else {
                continue;
            };
            let waiter = &state.nodes[waiter_index as usize];
            // Only wake nodes in our current pass.
            if waiter.pass_index != state.current_pass {
                continue;
            }
            if waiter.progress == Progress::Completed {
                continue;
            }
            if !self.dependencies_ready_and_successful(state, waiter_index) {
                continue;
            }
            // Did someone else get to the node first?
            if waiter.is_queued() || waiter.is_active() {
                continue;
            }
            state.enqueue(waiter_index);
            enqueue_count += 1;
        }

        if enqueue_count > 0 {
            self.wake_waiters(enqueue_count);
        }
    }

    fn park_expensive_node(&self, state: &mut QueueState, state_index: u32) {
        state.nodes[state_index as usize].flag_queued();
        state.expensive_wait.push(state_index);
    }

    fn unpark_expensive_node(&self, state: &mut QueueState) {
        if let Some(state_index) = state.expensive_wait.pop() {
            debug_assert!(state.nodes[state_index as usize].is_queued());
            // Only so the enqueue invariants hold.
            state.nodes[state_index as usize].flag_unqueued();
            state.enqueue(state_index);
            self.work_available.notify_one();
        }
    }

    /// Computes the node's input signature and decides whether its action
    /// must run.  Releases the queue lock around the filesystem work.
    fn check_input_signature<'s>(
        &'s self,
        thread_state: &mut ThreadState,
        guard: MutexGuard<'s, QueueState>,
        state_index: u32,
    ) -> (MutexGuard<'s, QueueState>, Progress) {
        let si = state_index as usize;
        let node_id = guard.nodes[si].dag_index;
        let prev_index = guard.nodes[si].prev_state;
        debug_assert!(self.all_dependencies_ready(&guard, state_index));
        drop(guard);

        let dag = self.config.dag;
        let data = dag.node(node_id);
        let ctx = SignContext {
            stat_cache: self.config.stat_cache,
            digest_cache: self.config.digest_cache,
            digest_extensions: &dag.digest_extensions,
        };
        let force_timestamp = data.has_flag(node_flags::BAN_CONTENT_DIGEST_FOR_INPUTS);
        let scanner = data.scanner.map(|i| &dag.scanners[i as usize]);

        // Start with the command line.  If that changes we definitely
        // rebuild.
        let mut h = Hasher::new();
        h.add_str(&data.action);
        h.add_separator();
        if let Some(pre_action) = &data.pre_action {
            h.add_str(pre_action);
            h.add_separator();
        }

        // Multiple inputs can pull in the same header, so implicit deps are
        // deduplicated across the whole node and hashed in a stable
        // hash-sorted order, not discovery order.
        let mut implicit: Vec<(String, u32)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for input in &data.input_files {
            h.add_path(&input.path);
            compute_file_signature(&mut h, &ctx, &input.path, force_timestamp);

            if let Some(scanner) = scanner {
                for (path, hash) in scan_implicit_deps(
                    self.config.stat_cache,
                    self.config.scan_cache,
                    scanner,
                    &input.path,
                    &mut thread_state.scratch,
                ) {
                    if seen.insert(path.clone()) {
                        implicit.push((path, hash));
                    }
                }
            }
        }

        if scanner.is_some() {
            implicit.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            for (path, _) in &implicit {
                h.add_path(path);
                compute_file_signature(&mut h, &ctx, path, force_timestamp);
            }
        }

        for allowed in &data.allowed_output_substrings {
            h.add_str(allowed);
        }
        h.add_u64(data.has_flag(node_flags::ALLOW_UNEXPECTED_OUTPUT) as u64);
        h.add_u64(data.has_flag(node_flags::ALLOW_UNWRITTEN_OUTPUT_FILES) as u64);
        let signature = h.finish();

        let prev_entry = match (prev_index, self.config.prev_state) {
            (Some(i), Some(prev)) => Some(&prev.states[i]),
            _ => None,
        };

        let next = match prev_entry {
            // New node, never built.
            None => Progress::RunAction,
            Some(prev) => {
                if prev.input_signature != signature {
                    Progress::RunAction
                } else if prev.build_result != 0 {
                    // Failed last time; retry.
                    Progress::RunAction
                } else if !data
                    .output_files
                    .iter()
                    .map(|f| f.path.as_str())
                    .eq(prev.output_files.iter().map(|s| s.as_str()))
                {
                    Progress::RunAction
                } else if data
                    .output_files
                    .iter()
                    .any(|f| !self.config.stat_cache.stat(&f.path).exists)
                {
                    Progress::RunAction
                } else {
                    Progress::UpToDate
                }
            }
        };

        let mut guard = self.lock.lock().unwrap();
        guard.nodes[si].input_signature = signature;
        if next == Progress::UpToDate {
            guard.processed += 1;
        }
        (guard, next)
    }

    /// Runs the node's action.  May instead park the node when the expensive
    /// job limit is reached, signalled by returning RunAction unchanged.
    fn run_action<'s>(
        &'s self,
        mut guard: MutexGuard<'s, QueueState>,
        state_index: u32,
    ) -> (MutexGuard<'s, QueueState>, Progress) {
        let si = state_index as usize;
        let dag = self.config.dag;
        let node_id = guard.nodes[si].dag_index;
        let data = dag.node(node_id);
        let dry_run = self.config.dry_run;
        let is_write_file = data.is_write_text_file();

        if !is_write_file && data.action.is_empty() {
            // Nothing to do; counts as processed without producing outputs.
            guard.processed += 1;
            return (guard, Progress::Succeeded);
        }

        let mut admitted_expensive = false;
        if data.is_expensive() && !dry_run {
            if guard.expensive_running == self.config.max_expensive_count as i32 {
                self.park_expensive_node(&mut guard, state_index);
                return (guard, Progress::RunAction);
            }
            guard.expensive_running += 1;
            admitted_expensive = true;
        }

        drop(guard);

        let finish = |mut guard: MutexGuard<'s, QueueState>,
                      progress: Progress|
         -> (MutexGuard<'s, QueueState>, Progress) {
            if admitted_expensive {
                guard.expensive_running -= 1;
                debug_assert!(guard.expensive_running >= 0);
                // Let another expensive job onto the cores.
                self.unpark_expensive_node(&mut guard);
            }
            (guard, progress)
        };

        for resource in &data.shared_resources {
            if !self.acquire_shared_resource(*resource) {
                let annotation =
                    dag.shared_resources[*resource as usize].annotation.clone();
                let mut guard = self.lock.lock().unwrap();
                guard.printer.service_message(
                    StatusLevel::Failure,
                    &format!("failed to create shared resource {}", annotation),
                );
                return finish(guard, Progress::Failed);
            }
        }

        let stat_cache = self.config.stat_cache;

        if !dry_run {
            for file in data.output_files.iter().chain(&data.aux_output_files) {
                if let Err(err) = make_parent_dirs(&file.path, stat_cache) {
                    let mut guard = self.lock.lock().unwrap();
                    guard.printer.service_message(
                        StatusLevel::Failure,
                        &format!(
                            "failed to create output directories for {}: {}",
                            file.path, err
                        ),
                    );
                    return finish(guard, Progress::Failed);
                }
            }

            // Tools that misbehave around stale outputs get a clean slate.
            if !data.has_flag(node_flags::OVERWRITE_OUTPUTS) {
                for output in &data.output_files {
                    let _ = std::fs::remove_file(&output.path);
                    stat_cache.mark_dirty(&output.path);
                }
            }
        }

        let allow_unwritten = data.has_flag(node_flags::ALLOW_UNWRITTEN_OUTPUT_FILES);
        let mut pre_timestamps = Vec::new();
        if !dry_run && !allow_unwritten {
            for output in &data.output_files {
                pre_timestamps.push(stat_path(&output.path).timestamp);
            }
        }

        let started = Instant::now();
        let make_busy_cb = || {
            let annotation = data.annotation.clone();
            let original_index = data.original_index;
            move || -> u64 {
                let mut guard = self.lock.lock().unwrap();
                guard.printer.print_busy(original_index, &annotation, started)
            }
        };

        let spawn_action =
            |cmd: &str, initial_slow: u64, cb: &mut dyn FnMut() -> u64| -> ExecResult {
                exec::execute_process(cmd, &data.env_vars, initial_slow, Some(cb))
                    .unwrap_or_else(|err| ExecResult {
                        return_code: 1,
                        output: err.to_string().into_bytes(),
                        ..Default::default()
                    })
            };

        let mut result = ExecResult::default();
        let mut last_cmd: Option<&str> = None;

        if let Some(pre_action) = &data.pre_action {
            last_cmd = Some(pre_action);
            if !dry_run {
                let mut cb = make_busy_cb();
                result = spawn_action(pre_action, 1, &mut cb);
            }
        }

        let mut validation = ValidationResult::Pass;
        let mut untouched_outputs: Vec<String> = Vec::new();
        if result.return_code == 0 && !dry_run {
            if is_write_file {
                result = exec::write_text_file(&data.action, &data.output_files[0].path);
            } else {
                last_cmd = Some(&data.action);
                let mut cb = make_busy_cb();
                result = spawn_action(&data.action, 5, &mut cb);
                validation = validate_output(&result.output, data);
            }

            if validation == ValidationResult::Pass && !allow_unwritten {
                for (output, pre_timestamp) in
                    data.output_files.iter().zip(&pre_timestamps)
                {
                    if stat_path(&output.path).timestamp == *pre_timestamp {
                        untouched_outputs.push(output.path.clone());
                        validation = ValidationResult::UnwrittenOutputFileFail;
                    }
                }
            }
        }

        for output in &data.output_files {
            stat_cache.mark_dirty(&output.path);
        }

        let mut guard = self.lock.lock().unwrap();

        let failed =
            result.return_code != 0 || result.was_signalled || validation.is_failure();
        let verbose = (failed && !result.was_aborted) || self.config.echo_command_lines;
        guard.processed += 1;
        if !dry_run {
            guard.executed += 1;
        }

        let output_text = if result.output.is_empty() {
            None
        } else if verbose || validation != ValidationResult::SwallowStdout {
            Some(String::from_utf8_lossy(&result.output).into_owned())
        } else {
            None
        };
        let processed = guard.processed;
        // Failure diagnostics go to the end of the log unless we keep
        // building through errors anyway.
        let defer = failed && !self.config.continue_on_error;
        guard.printer.print_node_result(
            NodeResultData {
                annotation: data.annotation.clone(),
                cmd_line: last_cmd.map(|s| s.to_string()),
                env_vars: data.env_vars.clone(),
                allowed_substrings: data.allowed_output_substrings.clone(),
                untouched_outputs: untouched_outputs.clone(),
                output: output_text,
                verbose,
                duration_secs: started.elapsed().as_secs(),
                validation,
                processed,
                status: if failed {
                    StatusLevel::Failure
                } else {
                    StatusLevel::Success
                },
                return_code: result.return_code,
                was_signalled: result.was_signalled,
                was_aborted: result.was_aborted,
            },
            defer,
        );

        if result.was_aborted {
            signal::set_reason_aborted_child();
        }

        if result.return_code == 0 && !validation.is_failure() {
            return finish(guard, Progress::Succeeded);
        }

        // Clean up outputs of the failed action, unless they are precious or
        // the only failure was an output the action (successfully) declined
        // to write.
        if !data.has_flag(node_flags::PRECIOUS_OUTPUTS)
            && !(result.return_code == 0
                && validation == ValidationResult::UnwrittenOutputFileFail)
        {
            for output in &data.output_files {
                let _ = std::fs::remove_file(&output.path);
                stat_cache.mark_dirty(&output.path);
            }
        }
        finish(guard, Progress::Failed)
    }

    /// Lazily runs the resource's create action, exactly once per build.
    /// Later acquires are free; the counter doubles as the created bit.
    fn acquire_shared_resource(&self, resource_index: u32) -> bool {
        let created = &self.shared_created[resource_index as usize];
        if created.load(Ordering::Acquire) != 0 {
            return true;
        }
        let _guard = self.shared_lock.lock().unwrap();
        // Another thread may have created it while we waited for the lock.
        if created.load(Ordering::Relaxed) != 0 {
            return true;
        }
        let ok = self.run_shared_resource_action(resource_index, true);
        created.store(1, Ordering::Release);
        ok
    }

    fn destroy_shared_resources(&self) {
        for (i, created) in self.shared_created.iter().enumerate() {
            if created.load(Ordering::Acquire) > 0 {
                self.run_shared_resource_action(i as u32, false);
                created.store(0, Ordering::Release);
            }
        }
    }

    fn run_shared_resource_action(&self, resource_index: u32, create: bool) -> bool {
        let resource = &self.config.dag.shared_resources[resource_index as usize];
        let action = if create {
            &resource.create_action
        } else {
            &resource.destroy_action
        };
        let Some(action) = action else {
            return true;
        };
        let annotation = format!(
            "{} {}",
            if create { "Creating" } else { "Destroying" },
            resource.annotation
        );

        let started = Instant::now();
        let result = exec::execute_process(action, &resource.env_vars, 1, None)
            .unwrap_or_else(|err| ExecResult {
                return_code: 1,
                output: err.to_string().into_bytes(),
                ..Default::default()
            });

        let mut guard = self.lock.lock().unwrap();
        let output = String::from_utf8_lossy(&result.output).into_owned();
        guard.printer.print_non_node_result(
            started.elapsed().as_secs(),
            if result.return_code == 0 {
                StatusLevel::Success
            } else {
                StatusLevel::Failure
            },
            &annotation,
            if result.return_code != 0 {
                Some(&output)
            } else {
                None
            },
        );
        result.return_code == 0
    }

    fn process_throttling(&self, throttled: &mut bool) {
        if !self.config.throttle_on_human_activity {
            return;
        }
        let idle = match self.config.activity_probe {
            Some(probe) => probe(),
            None => throttle::time_since_last_human_activity(),
        };
        let action = throttle::evaluate(
            *throttled,
            idle,
            self.config.throttle_inactivity_period,
            self.thread_count,
            self.config.throttled_threads_amount,
        );
        match action {
            ThrottleAction::None => {}
            ThrottleAction::Clamp(jobs) => {
                let mut guard = self.lock.lock().unwrap();
                guard.dynamic_max_jobs = jobs;
                self.max_jobs_changed.notify_all();
                guard.printer.print_non_node_result(
                    0,
                    StatusLevel::Warning,
                    &format!(
                        "Human activity detected, throttling to {} simultaneous jobs to leave system responsive",
                        jobs
                    ),
                    None,
                );
                *throttled = true;
            }
            ThrottleAction::Restore(jobs) => {
                let mut guard = self.lock.lock().unwrap();
                guard.dynamic_max_jobs = jobs;
                self.max_jobs_changed.notify_all();
                guard.printer.print_non_node_result(
                    0,
                    StatusLevel::Warning,
                    &format!(
                        "No human activity detected on this machine for {} seconds, unthrottling back up to {} simultaneous jobs",
                        self.config.throttle_inactivity_period, jobs
                    ),
                    None,
                );
                *throttled = false;
            }
        }
    }
}

/// Creates every missing parent directory of `path`, marking newly created
/// ones dirty in the stat cache.
fn make_parent_dirs(path: &str, stat_cache: &StatCache) -> std::io::Result<()> {
    let Some(parent) = Path::new(path).parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    let parent_str = parent.to_string_lossy();
    if stat_cache.stat(&parent_str).exists {
        return Ok(());
    }
    std::fs::create_dir_all(parent)?;
    stat_cache.mark_dirty(&parent_str);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_capacity_is_power_of_two() {
        assert_eq!(next_power_of_two(1), 1);
        assert_eq!(next_power_of_two(2), 2);
        assert_eq!(next_power_of_two(3), 4);
        assert_eq!(next_power_of_two(9), 16);
    }

    fn empty_state(node_count: usize) -> QueueState {
        let capacity = next_power_of_two(node_count + 1);
        QueueState {
            ring: vec![0; capacity],
            mask: (capacity - 1) as u32,
            read: 0,
            write: 0,
            pending: 0,
            failed: 0,
            processed: 0,
            executed: 0,
            active: 0,
            current_pass: 0,
            expensive_running: 0,
            expensive_wait: Vec::new(),
            cleanup_requested: false,
            dynamic_max_jobs: 1,
            nodes: (0..node_count)
                .map(|i| NodeState::new(NodeId(i as u32), None, 0))
                .collect(),
            printer: Printer::new(node_count, false),
        }
    }

    #[test]
    fn ring_wraps_and_preserves_fifo() {
        let mut state = empty_state(3);
        // Fill, drain, and refill across the wrap point a few times.
        for round in 0..5 {
            for i in 0..3u32 {
                state.enqueue(i);
                assert!(state.available() <= state.mask, "round {}", round);
            }
            assert_eq!(state.available(), 3);
            for i in 0..3u32 {
                let got = state.next_node().unwrap();
                assert_eq!(got, i);
                // Completed nodes aren't re-enqueued in this test; reset
                // the flags by hand to reuse them.
                state.nodes[got as usize].flag_inactive();
                state.active -= 1;
            }
            assert_eq!(state.next_node(), None);
        }
    }

    #[test]
    fn node_state_flags() {
        let mut node = NodeState::new(NodeId(0), None, 0);
        assert!(!node.is_queued());
        assert!(!node.is_active());
        node.flag_queued();
        assert!(node.is_queued());
        node.flag_unqueued();
        node.flag_active();
        assert!(!node.is_queued());
        assert!(node.is_active());
        node.flag_inactive();
        assert!(!node.is_active());
    }
}
