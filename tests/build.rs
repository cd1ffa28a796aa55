//! End-to-end incremental build scenarios driven through the Driver.

mod common;

use common::*;
use kiln::dag::{node_flags, GenericScannerConfig, NodeSpec, ScannerData, ScannerKind};
use kiln::hash::{digest_bytes, Digest};
use kiln::queue::BuildResult;
use kiln::statefile::StateFile;

/// A: writes out.a; B: reads out.a, writes out.b.
fn two_step_dag(space: &TestSpace) -> anyhow::Result<()> {
    let mut b = space.builder("two-step");
    let a = b.add_node(NodeSpec {
        action: write_cmd("x", &space.path("out.a")),
        annotation: "write out.a".to_string(),
        inputs: vec![space.path("src.txt")],
        outputs: vec![space.path("out.a")],
        ..Default::default()
    });
    let consumer = b.add_node(NodeSpec {
        action: copy_cmd(&space.path("out.a"), &space.path("out.b")),
        annotation: "copy out.a to out.b".to_string(),
        dependencies: vec![a],
        inputs: vec![space.path("out.a")],
        outputs: vec![space.path("out.b")],
        ..Default::default()
    });
    b.add_default(consumer);
    space.save_dag(&b.finish()?)
}

#[test]
fn first_build_runs_everything() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src.txt", "v1")?;
    two_step_dag(&space)?;

    let (result, executed) = space.build()?;
    assert_eq!(result, BuildResult::Ok);
    assert_eq!(executed, 2);
    assert_eq!(space.read_str("out.a")?, "x");
    assert_eq!(space.read_str("out.b")?, "x");

    let state = StateFile::load(&space.path(".kiln.state")).expect("state file written");
    assert_eq!(state.guids.len(), 2);
    assert!(state.guids.windows(2).all(|w| w[0] < w[1]));
    assert!(state.states.iter().all(|s| s.build_result == 0));
    Ok(())
}

#[test]
fn noop_rebuild_executes_nothing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src.txt", "v1")?;
    two_step_dag(&space)?;

    space.build()?;
    let (result, executed) = space.build()?;
    assert_eq!(result, BuildResult::Ok);
    assert_eq!(executed, 0, "no processes may run on a no-op rebuild");

    // The state file is rewritten and still loads with the same entries.
    let state = StateFile::load(&space.path(".kiln.state")).unwrap();
    assert_eq!(state.guids.len(), 2);
    Ok(())
}

#[test]
fn input_change_rebuilds_consumers() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src.txt", "v1")?;
    two_step_dag(&space)?;
    space.build()?;

    touch_with_new_mtime(&space.path("src.txt"), "v2")?;
    let (result, executed) = space.build()?;
    assert_eq!(result, BuildResult::Ok);
    // A re-runs for the changed input; rewriting out.a re-runs B.
    assert_eq!(executed, 2);
    Ok(())
}

#[test]
fn missing_output_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src.txt", "v1")?;
    two_step_dag(&space)?;
    space.build()?;

    std::fs::remove_file(space.path("out.b"))?;
    let (result, executed) = space.build()?;
    assert_eq!(result, BuildResult::Ok);
    assert_eq!(executed, 1);
    assert!(space.exists("out.b"));
    Ok(())
}

#[test]
fn digest_signed_inputs_ignore_touches() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src.c", "int x;")?;

    let mut b = space.builder("digest");
    let node = b.add_node(NodeSpec {
        action: copy_cmd(&space.path("src.c"), &space.path("src.o")),
        annotation: "compile src.c".to_string(),
        inputs: vec![space.path("src.c")],
        outputs: vec![space.path("src.o")],
        ..Default::default()
    });
    b.add_default(node);
    b.add_digest_extension(".c");
    space.save_dag(&b.finish()?)?;

    space.build()?;
    // Same bytes, new mtime: content digest shields the node.
    touch_with_new_mtime(&space.path("src.c"), "int x;")?;
    let (_, executed) = space.build()?;
    assert_eq!(executed, 0);

    // Different bytes rebuild.
    touch_with_new_mtime(&space.path("src.c"), "int y;")?;
    let (_, executed) = space.build()?;
    assert_eq!(executed, 1);
    Ok(())
}

#[test]
fn unexpected_output_fails_the_node() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut b = space.builder("chatty");
    let node = b.add_node(NodeSpec {
        action: format!("echo surprise; : > '{}'", space.path("out")),
        annotation: "chatty action".to_string(),
        outputs: vec![space.path("out")],
        ..Default::default()
    });
    b.add_default(node);
    space.save_dag(&b.finish()?)?;

    let (result, _) = space.build()?;
    assert_eq!(result, BuildResult::BuildError);
    // Failed outputs are cleaned up.
    assert!(!space.exists("out"));
    Ok(())
}

#[test]
fn allowed_substrings_cover_output() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut b = space.builder("covered");
    let node = b.add_node(NodeSpec {
        action: format!("echo 'Generating code'; : > '{}'", space.path("out")),
        annotation: "covered action".to_string(),
        outputs: vec![space.path("out")],
        allowed_output_substrings: vec!["Generating".to_string()],
        ..Default::default()
    });
    b.add_default(node);
    space.save_dag(&b.finish()?)?;

    let (result, _) = space.build()?;
    assert_eq!(result, BuildResult::Ok);
    assert!(space.exists("out"));
    Ok(())
}

#[test]
fn unwritten_output_fails_unless_allowed() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut b = space.builder("lazy");
    let node = b.add_node(NodeSpec {
        action: "true".to_string(),
        annotation: "forgets its output".to_string(),
        outputs: vec![space.path("out")],
        ..Default::default()
    });
    b.add_default(node);
    space.save_dag(&b.finish()?)?;
    let (result, _) = space.build()?;
    assert_eq!(result, BuildResult::BuildError);

    let mut b = space.builder("lazy");
    let node = b.add_node(NodeSpec {
        action: "true".to_string(),
        annotation: "forgets its output".to_string(),
        outputs: vec![space.path("out")],
        flags: node_flags::ALLOW_UNWRITTEN_OUTPUT_FILES,
        ..Default::default()
    });
    b.add_default(node);
    space.save_dag(&b.finish()?)?;
    let (result, _) = space.build()?;
    assert_eq!(result, BuildResult::Ok);
    Ok(())
}

#[test]
fn write_text_file_action() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut b = space.builder("writer");
    let node = b.add_node(NodeSpec {
        action: "generated contents\n".to_string(),
        annotation: "write generated file".to_string(),
        outputs: vec![space.path("gen/output.txt")],
        flags: node_flags::IS_WRITE_TEXT_FILE,
        ..Default::default()
    });
    b.add_default(node);
    space.save_dag(&b.finish()?)?;

    let (result, _) = space.build()?;
    assert_eq!(result, BuildResult::Ok);
    // Parent directories are created for outputs.
    assert_eq!(space.read_str("gen/output.txt")?, "generated contents\n");
    Ok(())
}

#[test]
fn empty_action_is_instant_success() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut b = space.builder("phony");
    let node = b.add_node(NodeSpec {
        annotation: "phony".to_string(),
        inputs: vec![space.path("src.txt")],
        ..Default::default()
    });
    b.add_default(node);
    space.save_dag(&b.finish()?)?;
    space.write("src.txt", "x")?;

    let (result, executed) = space.build()?;
    assert_eq!(result, BuildResult::Ok);
    assert_eq!(executed, 0);
    Ok(())
}

#[test]
fn pre_action_failure_skips_main_action() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut b = space.builder("pre");
    let node = b.add_node(NodeSpec {
        action: format!(": > '{}'", space.path("out")),
        pre_action: Some("false".to_string()),
        annotation: "guarded by pre-action".to_string(),
        outputs: vec![space.path("out")],
        ..Default::default()
    });
    b.add_default(node);
    space.save_dag(&b.finish()?)?;

    let (result, _) = space.build()?;
    assert_eq!(result, BuildResult::BuildError);
    assert!(!space.exists("out"));
    Ok(())
}

#[test]
fn passes_are_barriers() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut b = space.builder("passes");
    b.passes = vec!["codegen".to_string(), "compile".to_string()];
    // No dependency edge: the pass barrier alone orders these.
    let gen = b.add_node(NodeSpec {
        action: write_cmd("generated", &space.path("gen.txt")),
        annotation: "generate".to_string(),
        pass_index: 0,
        outputs: vec![space.path("gen.txt")],
        ..Default::default()
    });
    let compile = b.add_node(NodeSpec {
        action: copy_cmd(&space.path("gen.txt"), &space.path("final.txt")),
        annotation: "consume".to_string(),
        pass_index: 1,
        inputs: vec![space.path("gen.txt")],
        outputs: vec![space.path("final.txt")],
        ..Default::default()
    });
    b.add_default(gen);
    b.add_default(compile);
    space.save_dag(&b.finish()?)?;

    let (result, executed) = space.build()?;
    assert_eq!(result, BuildResult::Ok);
    assert_eq!(executed, 2);
    assert_eq!(space.read_str("final.txt")?, "generated");
    Ok(())
}

#[test]
fn keep_going_builds_independent_nodes() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut b = space.builder("keep-going");
    let bad = b.add_node(NodeSpec {
        action: "false".to_string(),
        annotation: "always fails".to_string(),
        outputs: vec![space.path("bad.out")],
        ..Default::default()
    });
    let good = b.add_node(NodeSpec {
        action: format!(": > '{}'", space.path("good.out")),
        annotation: "succeeds".to_string(),
        outputs: vec![space.path("good.out")],
        ..Default::default()
    });
    let dependent = b.add_node(NodeSpec {
        action: format!(": > '{}'", space.path("dependent.out")),
        annotation: "depends on the failure".to_string(),
        dependencies: vec![bad],
        outputs: vec![space.path("dependent.out")],
        ..Default::default()
    });
    b.add_default(good);
    b.add_default(dependent);
    space.save_dag(&b.finish()?)?;

    let mut options = space.options();
    options.continue_on_error = true;
    options.thread_count = 1;
    let (result, _) = space.build_with(options)?;
    assert_eq!(result, BuildResult::BuildError);
    assert!(space.exists("good.out"));
    // The dependent of the failed node never ran.
    assert!(!space.exists("dependent.out"));
    Ok(())
}

#[test]
fn scanner_discovers_header_dependencies() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.c", "#include \"hdr.h\"\nint main;\n")?;
    space.write("hdr.h", "int h;\n")?;

    let mut b = space.builder("scan");
    b.scanners.push(ScannerData {
        kind: ScannerKind::Cpp,
        include_paths: vec![],
        generic: GenericScannerConfig::default(),
        guid: digest_bytes(b"cpp scanner"),
    });
    let node = b.add_node(NodeSpec {
        action: copy_cmd(&space.path("main.c"), &space.path("main.o")),
        annotation: "compile main.c".to_string(),
        inputs: vec![space.path("main.c")],
        outputs: vec![space.path("main.o")],
        scanner: Some(0),
        ..Default::default()
    });
    b.add_default(node);
    space.save_dag(&b.finish()?)?;

    let (_, executed) = space.build()?;
    assert_eq!(executed, 1);

    // The discovered include lands in the persisted state.
    let state = StateFile::load(&space.path(".kiln.state")).unwrap();
    let entry = &state.states[0];
    assert!(entry
        .implicit_input_files
        .iter()
        .any(|r| r.path.ends_with("hdr.h")));

    // Untouched: no work.
    let (_, executed) = space.build()?;
    assert_eq!(executed, 0);

    // Touching only the header re-runs the node.
    touch_with_new_mtime(&space.path("hdr.h"), "int h2;\n")?;
    let (_, executed) = space.build()?;
    assert_eq!(executed, 1);
    Ok(())
}

#[test]
fn dry_run_executes_nothing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src.txt", "v1")?;
    two_step_dag(&space)?;

    let mut options = space.options();
    options.dry_run = true;
    let (result, executed) = space.build_with(options)?;
    assert_eq!(result, BuildResult::Ok);
    assert_eq!(executed, 0);
    assert!(!space.exists("out.a"));
    assert!(!space.exists("out.b"));
    Ok(())
}

#[test]
fn unknown_target_is_a_setup_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src.txt", "v1")?;
    two_step_dag(&space)?;

    let mut options = space.options();
    options.targets = vec!["no-such-target".to_string()];
    assert!(space.build_with(options).is_err());
    Ok(())
}

#[test]
fn named_targets_select_subgraphs() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut b = space.builder("named");
    let a = b.add_node(NodeSpec {
        action: write_cmd("a", &space.path("a.out")),
        annotation: "a".to_string(),
        outputs: vec![space.path("a.out")],
        ..Default::default()
    });
    let unrelated = b.add_node(NodeSpec {
        action: write_cmd("b", &space.path("b.out")),
        annotation: "b".to_string(),
        outputs: vec![space.path("b.out")],
        ..Default::default()
    });
    b.name_node("a", a);
    b.add_default(unrelated);
    space.save_dag(&b.finish()?)?;

    let mut options = space.options();
    options.targets = vec!["a".to_string()];
    let (result, executed) = space.build_with(options)?;
    assert_eq!(result, BuildResult::Ok);
    assert_eq!(executed, 1);
    assert!(space.exists("a.out"));
    assert!(!space.exists("b.out"));

    // Output paths resolve as targets too.
    let mut options = space.options();
    options.targets = vec![space.path("b.out")];
    let (_, executed) = space.build_with(options)?;
    assert_eq!(executed, 1);
    assert!(space.exists("b.out"));
    Ok(())
}

#[test]
fn guid_properties_hold_for_built_dags() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src.txt", "v1")?;
    two_step_dag(&space)?;

    let dag = kiln::dag::Dag::load(&space.path(".kiln.dag"))?.unwrap();
    // Unique and sorted.
    assert!(dag.guids.windows(2).all(|w| w[0] < w[1]));
    // Output-ful nodes hash their outputs.
    for (guid, node) in dag.guids.iter().zip(&dag.nodes) {
        let outs: Vec<&str> = node.output_files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(*guid, kiln::dag::guid_for_outputs(&outs));
    }
    Ok(())
}

#[test]
fn action_change_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let make_dag = |content: &str| -> anyhow::Result<()> {
        let mut b = space.builder("action-change");
        let node = b.add_node(NodeSpec {
            action: write_cmd(content, &space.path("out")),
            annotation: "write out".to_string(),
            outputs: vec![space.path("out")],
            ..Default::default()
        });
        b.add_default(node);
        space.save_dag(&b.finish()?)
    };

    make_dag("one")?;
    let (_, executed) = space.build()?;
    assert_eq!(executed, 1);

    // Same DAG: no work.
    let (_, executed) = space.build()?;
    assert_eq!(executed, 0);

    // New command line: signature differs, node re-runs.
    make_dag("two")?;
    let (_, executed) = space.build()?;
    assert_eq!(executed, 1);
    assert_eq!(space.read_str("out")?, "two");
    Ok(())
}

#[test]
fn failed_node_retries_next_run() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let flag = space.path("flag");
    let mut b = space.builder("retry");
    // Fails until the flag file exists; the command line never changes.
    let node = b.add_node(NodeSpec {
        action: format!("test -f '{}' && cp '{}' '{}'", flag, flag, space.path("out")),
        annotation: "flaky".to_string(),
        outputs: vec![space.path("out")],
        ..Default::default()
    });
    b.add_default(node);
    space.save_dag(&b.finish()?)?;

    let (result, _) = space.build()?;
    assert_eq!(result, BuildResult::BuildError);

    // A previous failure alone forces a retry.
    space.write("flag", "ready")?;
    let (result, executed) = space.build()?;
    assert_eq!(result, BuildResult::Ok);
    assert_eq!(executed, 1);
    Ok(())
}

#[test]
fn state_signature_matches_recomputation() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src.txt", "v1")?;
    two_step_dag(&space)?;
    space.build()?;

    let state = StateFile::load(&space.path(".kiln.state")).unwrap();
    for entry in &state.states {
        assert_ne!(entry.input_signature, Digest::default());
    }
    Ok(())
}
