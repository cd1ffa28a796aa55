//! Interrupt handling.  Lives in its own test binary because the interrupt
//! reason is process-wide.

mod common;

use common::*;
use kiln::dag::NodeSpec;
use kiln::queue::BuildResult;

#[test]
fn interrupt_stops_the_build_early() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut b = space.builder("interrupt");
    for i in 0..4 {
        let out = space.path(&format!("out.{}", i));
        let node = b.add_node(NodeSpec {
            action: format!("sleep 2; : > '{}'", out),
            annotation: format!("slow job {}", i),
            outputs: vec![out],
            ..Default::default()
        });
        b.add_default(node);
    }
    space.save_dag(&b.finish()?)?;

    // Raise the interrupt shortly after the build starts.
    let raiser = std::thread::spawn(|| {
        std::thread::sleep(std::time::Duration::from_millis(400));
        kiln::signal::set_reason_aborted_child();
    });

    let mut options = space.options();
    options.thread_count = 1;
    let mut driver = kiln::driver::Driver::new(options)?;
    driver.prepare_nodes()?;
    let result = driver.build();
    raiser.join().unwrap();

    assert_eq!(result, BuildResult::Interrupted);
    assert!(
        driver.executed_count() < 4,
        "interrupted build ran all nodes anyway"
    );

    // State still persists for whatever did (or did not) run.
    driver.save_build_state()?;
    assert!(space.exists(".kiln.state"));

    kiln::signal::reset();
    Ok(())
}
