//! The previous-build state file: one entry per node GUID recording the input
//! signature, build result, recorded inputs/outputs and which DAGs the node
//! has been seen in.  Loaded read-only at startup, rewritten atomically at
//! the end of a build with a merge that preserves history for nodes that
//! never ran.

use crate::dag::Dag;
use crate::hash::Digest;
use crate::includescan::{scan_implicit_deps, ScanScratch};
use crate::queue::{NodeState, Progress};
use crate::binio;
use crate::scancache::ScanCache;
use crate::statcache::StatCache;
use hashbrown::HashSet;

const MAGIC: u32 = 0x6b73_7461; // "ksta"

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFileRecord {
    pub timestamp: u64,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStateData {
    pub build_result: i32,
    pub input_signature: Digest,
    pub output_files: Vec<String>,
    pub aux_output_files: Vec<String>,
    pub action: String,
    pub pre_action: Option<String>,
    pub input_files: Vec<InputFileRecord>,
    pub implicit_input_files: Vec<InputFileRecord>,
    /// Identifiers of every DAG this node has been observed in.
    pub dags_seen_in: Vec<u32>,
}

impl NodeStateData {
    pub fn seen_in(&self, dag_identifier: u32) -> bool {
        self.dags_seen_in.contains(&dag_identifier)
    }
}

pub struct StateFile {
    /// Sorted; parallel to `states`.
    pub guids: Vec<Digest>,
    pub states: Vec<NodeStateData>,
}

impl StateFile {
    /// Missing files, bad magic numbers and parse errors all yield None:
    /// a state file we can't trust is the same as no state file.
    pub fn load(path: &str) -> Option<StateFile> {
        let map = binio::map_frozen(path, MAGIC).ok()??;
        let mut r = binio::Reader::new(binio::frozen_payload(&map));
        read_state(&mut r).ok()
    }

    pub fn find_index(&self, guid: &Digest) -> Option<usize> {
        self.guids.binary_search(guid).ok()
    }

    pub fn find(&self, guid: &Digest) -> Option<&NodeStateData> {
        self.find_index(guid).map(|i| &self.states[i])
    }
}

fn read_records(r: &mut binio::Reader) -> anyhow::Result<Vec<InputFileRecord>> {
    let count = r.read_u32()? as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let timestamp = r.read_u64()?;
        let path = r.read_str()?;
        records.push(InputFileRecord { timestamp, path });
    }
    Ok(records)
}

fn write_records(records: &[InputFileRecord], w: &mut binio::Writer) {
    w.write_u32(records.len() as u32);
    for record in records {
        w.write_u64(record.timestamp);
        w.write_str(&record.path);
    }
}

fn read_strs(r: &mut binio::Reader) -> anyhow::Result<Vec<String>> {
    let count = r.read_u32()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(r.read_str()?);
    }
    Ok(out)
}

fn write_strs(strs: &[String], w: &mut binio::Writer) {
    w.write_u32(strs.len() as u32);
    for s in strs {
        w.write_str(s);
    }
}

fn read_state(r: &mut binio::Reader) -> anyhow::Result<StateFile> {
    let count = r.read_u32()? as usize;
    let mut guids = Vec::with_capacity(count);
    let mut states = Vec::with_capacity(count);
    for _ in 0..count {
        guids.push(r.read_digest()?);
        let build_result = r.read_i32()?;
        let input_signature = r.read_digest()?;
        let output_files = read_strs(r)?;
        let aux_output_files = read_strs(r)?;
        let action = r.read_str()?;
        let pre_action = r.read_opt_str()?;
        let input_files = read_records(r)?;
        let implicit_input_files = read_records(r)?;
        let dag_count = r.read_u32()? as usize;
        let mut dags_seen_in = Vec::with_capacity(dag_count);
        for _ in 0..dag_count {
            dags_seen_in.push(r.read_u32()?);
        }
        states.push(NodeStateData {
            build_result,
            input_signature,
            output_files,
            aux_output_files,
            action,
            pre_action,
            input_files,
            implicit_input_files,
            dags_seen_in,
        });
    }
    Ok(StateFile { guids, states })
}

fn write_entry(guid: &Digest, entry: &NodeStateData, w: &mut binio::Writer) {
    w.write_digest(guid);
    w.write_i32(entry.build_result);
    w.write_digest(&entry.input_signature);
    write_strs(&entry.output_files, w);
    write_strs(&entry.aux_output_files, w);
    w.write_str(&entry.action);
    w.write_opt_str(entry.pre_action.as_deref());
    write_records(&entry.input_files, w);
    write_records(&entry.implicit_input_files, w);
    w.write_u32(entry.dags_seen_in.len() as u32);
    for id in &entry.dags_seen_in {
        w.write_u32(*id);
    }
}

/// Builds the fresh entry for a node whose signature was computed this run.
fn fresh_entry(
    dag: &Dag,
    node: &NodeState,
    prev_entry: Option<&NodeStateData>,
    stat_cache: &StatCache,
    scan_cache: &ScanCache,
    scratch: &mut ScanScratch,
) -> NodeStateData {
    let data = dag.node(node.dag_index);

    let record = |path: &str| InputFileRecord {
        timestamp: {
            let info = stat_cache.stat(path);
            if info.exists {
                info.timestamp
            } else {
                0
            }
        },
        path: path.to_string(),
    };

    let input_files: Vec<InputFileRecord> =
        data.input_files.iter().map(|f| record(&f.path)).collect();

    let mut implicit_input_files = Vec::new();
    if let Some(scanner_index) = data.scanner {
        let scanner = &dag.scanners[scanner_index as usize];
        // The scanner results are all cached by now, so this is cheap.
        let mut seen: HashSet<String> = HashSet::new();
        for input in &data.input_files {
            for (path, _) in
                scan_implicit_deps(stat_cache, scan_cache, scanner, &input.path, scratch)
            {
                if seen.insert(path.clone()) {
                    implicit_input_files.push(record(&path));
                }
            }
        }
        implicit_input_files.sort_by(|a, b| a.path.cmp(&b.path));
    }

    let mut dags_seen_in = prev_entry.map(|e| e.dags_seen_in.clone()).unwrap_or_default();
    if !dags_seen_in.contains(&dag.identifier) {
        dags_seen_in.push(dag.identifier);
    }

    NodeStateData {
        build_result: node.build_result,
        input_signature: node.input_signature,
        output_files: data.output_files.iter().map(|f| f.path.clone()).collect(),
        aux_output_files: data
            .aux_output_files
            .iter()
            .map(|f| f.path.clone())
            .collect(),
        action: data.action.clone(),
        pre_action: data.pre_action.clone(),
        input_files,
        implicit_input_files,
        dags_seen_in,
    }
}

/// Writes the merged state file atomically.
///
/// For every selected node: a fresh entry when it reached signature
/// computation this run, else its previous entry verbatim so interrupted
/// builds keep their history.  Old entries for GUIDs we didn't select stay if
/// their node is still in the DAG; entries that belong only to this DAG and
/// are gone from it are dropped (their outputs get garbage-collected next
/// run).
pub fn save_build_state(
    path: &str,
    dag: &Dag,
    prev: Option<&StateFile>,
    nodes: &[NodeState],
    stat_cache: &StatCache,
    scan_cache: &ScanCache,
) -> anyhow::Result<()> {
    let mut scratch = ScanScratch::new();

    // DAG node order is GUID order, so sorting by DAG index walks new states
    // in GUID order.
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by_key(|&i| nodes[i].dag_index.0);

    let empty: &[Digest] = &[];
    let old_guids = prev.map(|p| &p.guids[..]).unwrap_or(empty);

    let mut entries: Vec<(Digest, NodeStateData)> = Vec::new();

    let mut emit_new = |entries: &mut Vec<(Digest, NodeStateData)>, state_index: usize| {
        let node = &nodes[state_index];
        let guid = dag.guid_of(node.dag_index);
        let prev_entry = node
            .prev_state
            .and_then(|i| prev.map(|p| &p.states[i]));
        if node.progress >= Progress::Unblocked {
            entries.push((
                *guid,
                fresh_entry(dag, node, prev_entry, stat_cache, scan_cache, &mut scratch),
            ));
        } else if let Some(prev_entry) = prev_entry {
            // Never computed a signature this run (error or cancellation);
            // retain the old record.
            entries.push((*guid, prev_entry.clone()));
        }
    };

    let emit_old = |entries: &mut Vec<(Digest, NodeStateData)>, old_index: usize| {
        let prev = prev.unwrap();
        let guid = &prev.guids[old_index];
        let entry = &prev.states[old_index];
        if dag.find_by_guid(guid).is_some() || !entry.seen_in(dag.identifier) {
            entries.push((*guid, entry.clone()));
        }
    };

    // Two-pointer merge over the sorted GUID sequences.
    let mut new_pos = 0;
    let mut old_pos = 0;
    while new_pos < order.len() || old_pos < old_guids.len() {
        if new_pos == order.len() {
            emit_old(&mut entries, old_pos);
            old_pos += 1;
        } else if old_pos == old_guids.len() {
            emit_new(&mut entries, order[new_pos]);
            new_pos += 1;
        } else {
            let new_guid = dag.guid_of(nodes[order[new_pos]].dag_index);
            match new_guid.cmp(&old_guids[old_pos]) {
                std::cmp::Ordering::Less => {
                    emit_new(&mut entries, order[new_pos]);
                    new_pos += 1;
                }
                std::cmp::Ordering::Greater => {
                    emit_old(&mut entries, old_pos);
                    old_pos += 1;
                }
                std::cmp::Ordering::Equal => {
                    emit_new(&mut entries, order[new_pos]);
                    new_pos += 1;
                    old_pos += 1;
                }
            }
        }
    }

    let mut w = binio::Writer::new(MAGIC);
    w.write_u32(entries.len() as u32);
    for (guid, entry) in &entries {
        write_entry(guid, entry, &mut w);
    }
    w.commit(path, MAGIC)
}
