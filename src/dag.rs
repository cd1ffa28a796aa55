//! The frozen build DAG: immutable node records produced by the DAG compiler,
//! loaded via mmap with a magic number at both ends.  The `Builder` is the
//! compiler-facing half: it computes node GUIDs, orders nodes by GUID and
//! derives back-links.

use crate::binio;
use crate::densemap::declare_id;
use crate::hash::{djb2, djb2_path, Digest, Hasher};
use anyhow::bail;

pub const MAGIC: u32 = 0x6b69_6c6e; // "kiln"

declare_id!(NodeId);

pub mod node_flags {
    /// Safe to overwrite output files in place; without it outputs are
    /// removed before the action runs.
    pub const OVERWRITE_OUTPUTS: u32 = 1 << 0;
    /// Keep output files even when the action fails.
    pub const PRECIOUS_OUTPUTS: u32 = 1 << 1;
    /// Node wants the whole machine; admission limited by max expensive count.
    pub const EXPENSIVE: u32 = 1 << 2;
    /// Unexpected console output is tolerated instead of failing the node.
    pub const ALLOW_UNEXPECTED_OUTPUT: u32 = 1 << 3;
    /// The action string is a file payload, not a command line.
    pub const IS_WRITE_TEXT_FILE: u32 = 1 << 4;
    /// Outputs whose timestamps do not move do not fail the node.
    pub const ALLOW_UNWRITTEN_OUTPUT_FILES: u32 = 1 << 5;
    /// Inputs of this node are always timestamp-signed.
    pub const BAN_CONTENT_DIGEST_FOR_INPUTS: u32 = 1 << 6;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAndHash {
    pub path: String,
    pub hash: u32,
}

impl FileAndHash {
    pub fn new(path: impl Into<String>) -> FileAndHash {
        let path = path.into();
        let hash = djb2_path(&path);
        FileAndHash { path, hash }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerKind {
    Cpp,
    Generic,
}

#[derive(Debug, Clone, Default)]
pub struct GenericScannerConfig {
    pub require_whitespace: bool,
    pub bare_means_system: bool,
    pub keywords: Vec<Keyword>,
}

#[derive(Debug, Clone)]
pub struct Keyword {
    pub text: String,
    pub follow: bool,
}

#[derive(Debug, Clone)]
pub struct ScannerData {
    pub kind: ScannerKind,
    pub include_paths: Vec<String>,
    pub generic: GenericScannerConfig,
    pub guid: Digest,
}

#[derive(Debug, Clone, Default)]
pub struct NodeData {
    pub action: String,
    pub pre_action: Option<String>,
    pub annotation: String,
    pub pass_index: u32,
    pub dependencies: Vec<NodeId>,
    pub back_links: Vec<NodeId>,
    pub input_files: Vec<FileAndHash>,
    pub output_files: Vec<FileAndHash>,
    pub aux_output_files: Vec<FileAndHash>,
    pub allowed_output_substrings: Vec<String>,
    pub env_vars: Vec<(String, String)>,
    pub scanner: Option<u32>,
    pub shared_resources: Vec<u32>,
    pub flags: u32,
    pub original_index: u32,
}

impl NodeData {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
    pub fn is_expensive(&self) -> bool {
        self.has_flag(node_flags::EXPENSIVE)
    }
    pub fn is_write_text_file(&self) -> bool {
        self.has_flag(node_flags::IS_WRITE_TEXT_FILE)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedResourceData {
    pub annotation: String,
    pub create_action: Option<String>,
    pub destroy_action: Option<String>,
    pub env_vars: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct NamedNode {
    pub name: String,
    pub node: NodeId,
}

#[derive(Debug, Clone)]
pub struct FileSignature {
    pub path: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct GlobSignature {
    pub path: String,
    pub filter: Option<String>,
    pub recurse: bool,
    pub digest: Digest,
}

pub struct Dag {
    /// Hash of the user-facing graph name; state entries remember which
    /// identifiers they were seen under.
    pub identifier: u32,
    pub build_title: String,
    /// Sorted; parallel to `nodes`.
    pub guids: Vec<Digest>,
    pub nodes: Vec<NodeData>,
    pub scanners: Vec<ScannerData>,
    pub passes: Vec<String>,
    pub shared_resources: Vec<SharedResourceData>,
    pub named_nodes: Vec<NamedNode>,
    pub default_nodes: Vec<NodeId>,
    pub file_signatures: Vec<FileSignature>,
    pub glob_signatures: Vec<GlobSignature>,
    /// djb2 hashes of extensions (".c" form) whose files are content-signed.
    pub digest_extensions: Vec<u32>,
    /// -1 means "as many as there are threads".
    pub max_expensive_count: i32,
    pub state_file: String,
    pub scan_cache_file: String,
    pub digest_cache_file: String,
}

impl Dag {
    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0 as usize]
    }

    pub fn guid_of(&self, id: NodeId) -> &Digest {
        &self.guids[id.0 as usize]
    }

    pub fn find_by_guid(&self, guid: &Digest) -> Option<NodeId> {
        self.guids
            .binary_search(guid)
            .ok()
            .map(|i| NodeId(i as u32))
    }

    pub fn load(path: &str) -> anyhow::Result<Option<Dag>> {
        let map = match binio::map_frozen(path, MAGIC)? {
            Some(map) => map,
            None => return Ok(None),
        };
        let mut r = binio::Reader::new(binio::frozen_payload(&map));
        Ok(Some(read_dag(&mut r)?))
    }

    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        let mut w = binio::Writer::new(MAGIC);
        write_dag(self, &mut w);
        w.commit(path, MAGIC)
    }
}

fn read_env(r: &mut binio::Reader) -> anyhow::Result<Vec<(String, String)>> {
    let count = r.read_u32()? as usize;
    let mut env = Vec::with_capacity(count);
    for _ in 0..count {
        let name = r.read_str()?;
        let value = r.read_str()?;
        env.push((name, value));
    }
    Ok(env)
}

fn write_env(env: &[(String, String)], w: &mut binio::Writer) {
    w.write_u32(env.len() as u32);
    for (name, value) in env {
        w.write_str(name);
        w.write_str(value);
    }
}

fn read_files(r: &mut binio::Reader) -> anyhow::Result<Vec<FileAndHash>> {
    let count = r.read_u32()? as usize;
    let mut files = Vec::with_capacity(count);
    for _ in 0..count {
        files.push(FileAndHash::new(r.read_str()?));
    }
    Ok(files)
}

fn write_files(files: &[FileAndHash], w: &mut binio::Writer) {
    w.write_u32(files.len() as u32);
    for f in files {
        w.write_str(&f.path);
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

fn read_ids(r: &mut binio::Reader) -> anyhow::Result<Vec<NodeId>> {
    let count = r.read_u32()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(NodeId(r.read_u32()?));
    }
    Ok(out)
}

fn write_ids(ids: &[NodeId], w: &mut binio::Writer) {
    w.write_u32(ids.len() as u32);
    for id in ids {
        w.write_u32(id.0);
    }
}

fn read_u32s(r: &mut binio::Reader) -> anyhow::Result<Vec<u32>> {
    let count = r.read_u32()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(r.read_u32()?);
    }
    Ok(out)
}

fn write_u32s(vals: &[u32], w: &mut binio::Writer) {
    w.write_u32(vals.len() as u32);
    for v in vals {
        w.write_u32(*v);
    }
}

fn read_dag(r: &mut binio::Reader) -> anyhow::Result<Dag> {
    let identifier = r.read_u32()?;
    let build_title = r.read_str()?;
    let node_count = r.read_u32()? as usize;

    let mut guids = Vec::with_capacity(node_count);
    for _ in 0..node_count {
        guids.push(r.read_digest()?);
    }

    let mut nodes = Vec::with_capacity(node_count);
    for _ in 0..node_count {
        nodes.push(NodeData {
            action: r.read_str()?,
            pre_action: r.read_opt_str()?,
            annotation: r.read_str()?,
            pass_index: r.read_u32()?,
            dependencies: read_ids(r)?,
            back_links: read_ids(r)?,
            input_files: read_files(r)?,
            output_files: read_files(r)?,
            aux_output_files: read_files(r)?,
            allowed_output_substrings: read_strs(r)?,
            env_vars: read_env(r)?,
            scanner: match r.read_u32()? {
                u32::MAX => None,
                n => Some(n),
            },
            shared_resources: read_u32s(r)?,
            flags: r.read_u32()?,
            original_index: r.read_u32()?,
        });
    }

    let scanner_count = r.read_u32()? as usize;
    let mut scanners = Vec::with_capacity(scanner_count);
    for _ in 0..scanner_count {
        let kind = match r.read_u32()? {
            0 => ScannerKind::Cpp,
            1 => ScannerKind::Generic,
            k => bail!("unknown scanner kind {}", k),
        };
        let include_paths = read_strs(r)?;
        let require_whitespace = r.read_u32()? != 0;
        let bare_means_system = r.read_u32()? != 0;
        let keyword_count = r.read_u32()? as usize;
        let mut keywords = Vec::with_capacity(keyword_count);
        for _ in 0..keyword_count {
            let text = r.read_str()?;
            let follow = r.read_u32()? != 0;
            keywords.push(Keyword { text, follow });
        }
        let guid = r.read_digest()?;
        scanners.push(ScannerData {
            kind,
            include_paths,
            generic: GenericScannerConfig {
                require_whitespace,
                bare_means_system,
                keywords,
            },
            guid,
        });
    }

    let passes = read_strs(r)?;

    let resource_count = r.read_u32()? as usize;
    let mut shared_resources = Vec::with_capacity(resource_count);
    for _ in 0..resource_count {
        shared_resources.push(SharedResourceData {
            annotation: r.read_str()?,
            create_action: r.read_opt_str()?,
            destroy_action: r.read_opt_str()?,
            env_vars: read_env(r)?,
        });
    }

    let named_count = r.read_u32()? as usize;
    let mut named_nodes = Vec::with_capacity(named_count);
    for _ in 0..named_count {
        let name = r.read_str()?;
        let node = NodeId(r.read_u32()?);
        named_nodes.push(NamedNode { name, node });
    }
    let default_nodes = read_ids(r)?;

    let sig_count = r.read_u32()? as usize;
    let mut file_signatures = Vec::with_capacity(sig_count);
    for _ in 0..sig_count {
        let path = r.read_str()?;
        let timestamp = r.read_u64()?;
        file_signatures.push(FileSignature { path, timestamp });
    }

    let glob_count = r.read_u32()? as usize;
    let mut glob_signatures = Vec::with_capacity(glob_count);
    for _ in 0..glob_count {
        let path = r.read_str()?;
        let filter = r.read_opt_str()?;
        let recurse = r.read_u32()? != 0;
        let digest = r.read_digest()?;
        glob_signatures.push(GlobSignature {
            path,
            filter,
            recurse,
            digest,
        });
    }

    let digest_extensions = read_u32s(r)?;
    let max_expensive_count = r.read_i32()?;
    let state_file = r.read_str()?;
    let scan_cache_file = r.read_str()?;
    let digest_cache_file = r.read_str()?;

    Ok(Dag {
        identifier,
        build_title,
        guids,
        nodes,
        scanners,
        passes,
        shared_resources,
        named_nodes,
        default_nodes,
        file_signatures,
        glob_signatures,
        digest_extensions,
        max_expensive_count,
        state_file,
        scan_cache_file,
        digest_cache_file,
    })
}

fn write_dag(dag: &Dag, w: &mut binio::Writer) {
    w.write_u32(dag.identifier);
    w.write_str(&dag.build_title);
    w.write_u32(dag.nodes.len() as u32);
    for guid in &dag.guids {
        w.write_digest(guid);
    }
    for node in &dag.nodes {
        w.write_str(&node.action);
        w.write_opt_str(node.pre_action.as_deref());
        w.write_str(&node.annotation);
        w.write_u32(node.pass_index);
        write_ids(&node.dependencies, w);
        write_ids(&node.back_links, w);
        write_files(&node.input_files, w);
        write_files(&node.output_files, w);
        write_files(&node.aux_output_files, w);
        write_strs(&node.allowed_output_substrings, w);
        write_env(&node.env_vars, w);
        w.write_u32(node.scanner.unwrap_or(u32::MAX));
        write_u32s(&node.shared_resources, w);
        w.write_u32(node.flags);
        w.write_u32(node.original_index);
    }
    w.write_u32(dag.scanners.len() as u32);
    for scanner in &dag.scanners {
        w.write_u32(match scanner.kind {
            ScannerKind::Cpp => 0,
            ScannerKind::Generic => 1,
        });
        write_strs(&scanner.include_paths, w);
        w.write_u32(scanner.generic.require_whitespace as u32);
        w.write_u32(scanner.generic.bare_means_system as u32);
        w.write_u32(scanner.generic.keywords.len() as u32);
        for kw in &scanner.generic.keywords {
            w.write_str(&kw.text);
            w.write_u32(kw.follow as u32);
        }
        w.write_digest(&scanner.guid);
    }
    write_strs(&dag.passes, w);
    w.write_u32(dag.shared_resources.len() as u32);
    for res in &dag.shared_resources {
        w.write_str(&res.annotation);
        w.write_opt_str(res.create_action.as_deref());
        w.write_opt_str(res.destroy_action.as_deref());
        write_env(&res.env_vars, w);
    }
    w.write_u32(dag.named_nodes.len() as u32);
    for named in &dag.named_nodes {
        w.write_str(&named.name);
        w.write_u32(named.node.0);
    }
    write_ids(&dag.default_nodes, w);
    w.write_u32(dag.file_signatures.len() as u32);
    for sig in &dag.file_signatures {
        w.write_str(&sig.path);
        w.write_u64(sig.timestamp);
    }
    w.write_u32(dag.glob_signatures.len() as u32);
    for sig in &dag.glob_signatures {
        w.write_str(&sig.path);
        w.write_opt_str(sig.filter.as_deref());
        w.write_u32(sig.recurse as u32);
        w.write_digest(&sig.digest);
    }
    write_u32s(&dag.digest_extensions, w);
    w.write_i32(dag.max_expensive_count);
    w.write_str(&dag.state_file);
    w.write_str(&dag.scan_cache_file);
    w.write_str(&dag.digest_cache_file);
}

/// GUID for a node with output files.
pub fn guid_for_outputs(outputs: &[&str]) -> Digest {
    let mut h = Hasher::new();
    for out in outputs {
        h.add_str(out);
    }
    h.add_str("salt for outputs");
    h.finish()
}

/// GUID for an output-less node, derived from what it does instead.
pub fn guid_for_legacy(action: &str, inputs: &[&str], annotation: &str) -> Digest {
    let mut h = Hasher::new();
    if !action.is_empty() {
        h.add_str(action);
    }
    for input in inputs {
        h.add_str(input);
    }
    h.add_str(annotation);
    h.add_str("salt for legacy");
    h.finish()
}

/// Node description fed to the builder, with dependencies referring to the
/// order nodes were added in.
#[derive(Default, Clone)]
pub struct NodeSpec {
    pub action: String,
    pub pre_action: Option<String>,
    pub annotation: String,
    pub pass_index: u32,
    pub dependencies: Vec<u32>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub aux_outputs: Vec<String>,
    pub allowed_output_substrings: Vec<String>,
    pub env_vars: Vec<(String, String)>,
    pub scanner: Option<u32>,
    pub shared_resources: Vec<u32>,
    pub flags: u32,
}

/// Assembles a frozen DAG: computes GUIDs, rejects duplicates, orders nodes
/// by GUID and derives back-links.
pub struct Builder {
    identifier: u32,
    build_title: String,
    specs: Vec<NodeSpec>,
    pub scanners: Vec<ScannerData>,
    pub passes: Vec<String>,
    pub shared_resources: Vec<SharedResourceData>,
    named: Vec<(String, u32)>,
    defaults: Vec<u32>,
    pub file_signatures: Vec<FileSignature>,
    pub glob_signatures: Vec<GlobSignature>,
    pub digest_extensions: Vec<u32>,
    pub max_expensive_count: i32,
    pub state_file: String,
    pub scan_cache_file: String,
    pub digest_cache_file: String,
}

impl Builder {
    pub fn new(identifier: &str) -> Builder {
        Builder {
            identifier: djb2(identifier),
            build_title: identifier.to_string(),
            specs: Vec::new(),
            scanners: Vec::new(),
            passes: vec!["default".to_string()],
            shared_resources: Vec::new(),
            named: Vec::new(),
            defaults: Vec::new(),
            file_signatures: Vec::new(),
            glob_signatures: Vec::new(),
            digest_extensions: Vec::new(),
            max_expensive_count: -1,
            state_file: ".kiln.state".to_string(),
            scan_cache_file: ".kiln.scancache".to_string(),
            digest_cache_file: ".kiln.digestcache".to_string(),
        }
    }

    /// Returns the node's index in add order; dependency lists and name
    /// registrations use these indices.
    pub fn add_node(&mut self, spec: NodeSpec) -> u32 {
        self.specs.push(spec);
        (self.specs.len() - 1) as u32
    }

    pub fn name_node(&mut self, name: &str, node: u32) {
        self.named.push((name.to_string(), node));
    }

    pub fn add_default(&mut self, node: u32) {
        self.defaults.push(node);
    }

    /// Registers an extension (".c" form) for content-digest signing.
    pub fn add_digest_extension(&mut self, ext: &str) {
        self.digest_extensions.push(djb2(ext));
    }

    pub fn finish(self) -> anyhow::Result<Dag> {
        let count = self.specs.len();
        let mut guid_order: Vec<(Digest, u32)> = Vec::with_capacity(count);
        for (i, spec) in self.specs.iter().enumerate() {
            let guid = if !spec.outputs.is_empty() {
                let outs: Vec<&str> = spec.outputs.iter().map(|s| s.as_str()).collect();
                guid_for_outputs(&outs)
            } else {
                if spec.action.is_empty() && spec.inputs.is_empty() && spec.annotation.is_empty() {
                    bail!("node {} has no outputs, action, inputs or annotation", i);
                }
                let ins: Vec<&str> = spec.inputs.iter().map(|s| s.as_str()).collect();
                guid_for_legacy(&spec.action, &ins, &spec.annotation)
            };
            guid_order.push((guid, i as u32));
        }
        guid_order.sort();
        for pair in guid_order.windows(2) {
            if pair[0].0 == pair[1].0 {
                bail!(
                    "duplicate node guid {} ({:?} vs {:?})",
                    pair[0].0,
                    self.specs[pair[0].1 as usize].annotation,
                    self.specs[pair[1].1 as usize].annotation
                );
            }
        }

        // Map from add order to guid order.
        let mut remap = vec![0u32; count];
        for (sorted_index, (_, original)) in guid_order.iter().enumerate() {
            remap[*original as usize] = sorted_index as u32;
        }

        let mut guids = Vec::with_capacity(count);
        let mut nodes = Vec::with_capacity(count);
        for (guid, original) in &guid_order {
            let spec = &self.specs[*original as usize];
            guids.push(*guid);
            nodes.push(NodeData {
                action: spec.action.clone(),
                pre_action: spec.pre_action.clone(),
                annotation: spec.annotation.clone(),
                pass_index: spec.pass_index,
                dependencies: spec
                    .dependencies
                    .iter()
                    .map(|d| NodeId(remap[*d as usize]))
                    .collect(),
                back_links: Vec::new(),
                input_files: spec
                    .inputs
                    .iter()
                    .map(|p| FileAndHash::new(p.as_str()))
                    .collect(),
                output_files: spec
                    .outputs
                    .iter()
                    .map(|p| FileAndHash::new(p.as_str()))
                    .collect(),
                aux_output_files: spec
                    .aux_outputs
                    .iter()
                    .map(|p| FileAndHash::new(p.as_str()))
                    .collect(),
                allowed_output_substrings: spec.allowed_output_substrings.clone(),
                env_vars: spec.env_vars.clone(),
                scanner: spec.scanner,
                shared_resources: spec.shared_resources.clone(),
                flags: spec.flags,
                original_index: *original,
            });
        }

        let mut back_links: Vec<Vec<NodeId>> = vec![Vec::new(); count];
        for (i, node) in nodes.iter().enumerate() {
            for dep in &node.dependencies {
                back_links[dep.0 as usize].push(NodeId(i as u32));
            }
        }
        for (node, links) in nodes.iter_mut().zip(back_links) {
            node.back_links = links;
        }

        let pass_count = self.passes.len() as u32;
        for node in &nodes {
            if node.pass_index >= pass_count {
                bail!(
                    "node {:?} references pass {} but only {} passes exist",
                    node.annotation,
                    node.pass_index,
                    pass_count
                );
            }
        }

        Ok(Dag {
            identifier: self.identifier,
            build_title: self.build_title,
            guids,
            nodes,
            scanners: self.scanners,
            passes: self.passes,
            shared_resources: self.shared_resources,
            named_nodes: self
                .named
                .into_iter()
                .map(|(name, node)| NamedNode {
                    name,
                    node: NodeId(remap[node as usize]),
                })
                .collect(),
            default_nodes: self
                .defaults
                .into_iter()
                .map(|n| NodeId(remap[n as usize]))
                .collect(),
            file_signatures: self.file_signatures,
            glob_signatures: self.glob_signatures,
            digest_extensions: self.digest_extensions,
            max_expensive_count: self.max_expensive_count,
            state_file: self.state_file,
            scan_cache_file: self.scan_cache_file,
            digest_cache_file: self.digest_cache_file,
        })
    }
}
