//! Command-line entry point.

use crate::driver::{Driver, DriverOptions};
use crate::printing::{Printer, StatusLevel};
use crate::queue::BuildResult;
use crate::signal;
use anyhow::anyhow;
use std::path::Path;
use std::time::Instant;

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// kiln, an incremental build executor
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input DAG file [default=.kiln.dag]
    #[argh(option, short = 'f', default = "(\".kiln.dag\".into())")]
    dag_file: String,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// continue building when a node fails
    #[argh(switch, short = 'k')]
    keep_going: bool,

    /// figure out what would build, but do not run actions
    #[argh(switch, short = 'n')]
    dry_run: bool,

    /// print executed command lines and full diagnostics
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// suppress the summary when nothing was built
    #[argh(switch)]
    quiet: bool,

    /// delete outputs of the selected nodes and exit
    #[argh(switch)]
    clean: bool,

    /// delete outputs of the selected nodes, then build
    #[argh(switch)]
    rebuild: bool,

    /// maximum simultaneous expensive jobs [default from DAG]
    #[argh(option)]
    max_expensive: Option<usize>,

    /// reduce parallelism while a human is using this machine
    #[argh(switch)]
    throttle: bool,

    /// seconds of inactivity before unthrottling [default=30]
    #[argh(option, default = "30")]
    throttle_inactivity: u64,

    /// job count while throttled (0 = 60% of threads)
    #[argh(option, default = "0")]
    throttle_jobs: usize,

    /// targets to build
    #[argh(positional)]
    targets: Vec<String>,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

fn run_impl() -> anyhow::Result<BuildResult> {
    let opts: Opts = argh::from_env();

    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(Path::new(dir))
            .map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    signal::register();

    let options = DriverOptions {
        dag_file: opts.dag_file,
        targets: opts.targets,
        thread_count: opts.parallelism.unwrap_or_else(default_parallelism),
        verbose: opts.verbose,
        quiet: opts.quiet,
        continue_on_error: opts.keep_going,
        dry_run: opts.dry_run,
        clean: opts.clean,
        rebuild: opts.rebuild,
        max_expensive: opts.max_expensive,
        throttle_on_human_activity: opts.throttle,
        throttle_inactivity_period: opts.throttle_inactivity,
        throttled_threads_amount: opts.throttle_jobs,
        ..DriverOptions::for_console()
    };
    let quiet = options.quiet;
    let dry_run = options.dry_run;
    let clean = options.clean;
    let rebuild = options.rebuild;

    let started = Instant::now();

    let mut driver = Driver::new(options)?;
    driver.prepare_nodes()?;
    driver.remove_stale_outputs();

    if clean || rebuild {
        let removed = driver.clean_outputs();
        println!("kiln: removed {} output files", removed);
        if !rebuild {
            return Ok(BuildResult::Ok);
        }
    }

    let result = driver.build();

    if !dry_run {
        if let Err(err) = driver.save_build_state() {
            eprintln!("kiln: couldn't save build state: {:#}", err);
        }
    }
    if let Err(err) = driver.save_caches() {
        eprintln!("kiln: couldn't save caches: {:#}", err);
    }

    let executed = driver.executed_count();
    let show_summary =
        !driver.dag.build_title.is_empty() && (result != BuildResult::Ok || executed > 0 || !quiet);
    if show_summary {
        let mut printer = Printer::new(1, driver.options.emit_colors);
        printer.service_message(
            if result == BuildResult::Ok {
                StatusLevel::Success
            } else {
                StatusLevel::Failure
            },
            &format!(
                "*** {} {} ({:.2} seconds), {} items updated",
                driver.dag.build_title,
                result,
                started.elapsed().as_secs_f64(),
                executed
            ),
        );
    }

    Ok(result)
}

pub fn run() -> i32 {
    match run_impl() {
        Ok(result) => result.exit_code(),
        Err(err) => {
            eprintln!("kiln: {:#}", err);
            BuildResult::SetupError.exit_code()
        }
    }
}
