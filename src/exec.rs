//! Child process execution.
//!
//! Commands run via posix_spawn with stdout and stderr merged into one pipe.
//! We don't use std::process because we want both streams in a single
//! ordered capture buffer, an environment overlay handed straight to the
//! spawn call, and a poll-driven read loop so a watchdog callback can fire
//! for slow children and an interrupt can terminate them.

use anyhow::bail;
use std::time::{Duration, Instant};

use crate::signal;

/// Outcome of one spawned action.
#[derive(Default)]
pub struct ExecResult {
    pub return_code: i32,
    /// Child died from an uncaught signal.
    pub was_signalled: bool,
    /// The build was interrupted while this child ran; the child was
    /// terminated (or died to the same interrupt).
    pub was_aborted: bool,
    /// Combined stdout/stderr.
    pub output: Vec<u8>,
}

impl ExecResult {
    pub fn succeeded(&self) -> bool {
        self.return_code == 0
    }
}

/// Called when a child exceeds its slow threshold; returns the number of
/// seconds until the next callback.
pub type SlowCallback<'a> = &'a mut dyn FnMut() -> u64;

/// Writes `payload` verbatim to `target`, synthesizing an ExecResult.  Used
/// for nodes whose "action" is a file payload; no process is spawned.
pub fn write_text_file(payload: &str, target: &str) -> ExecResult {
    match std::fs::write(target, payload) {
        Ok(()) => ExecResult::default(),
        Err(err) => ExecResult {
            return_code: 1,
            output: format!("error writing {}: {}", target, err).into_bytes(),
            ..Default::default()
        },
    }
}

#[cfg(unix)]
fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret < 0 {
        let err_str = unsafe { std::ffi::CStr::from_ptr(libc::strerror(ret)) };
        bail!("{}: {}", func, err_str.to_str().unwrap());
    }
    Ok(())
}

/// Wraps libc::posix_spawn_file_actions_t, in particular to implement Drop.
#[cfg(unix)]
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

#[cfg(unix)]
impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_posix(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

#[cfg(unix)]
impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// The inherited environment with `env` overlaid, as NAME=value strings.
fn merged_environment(env: &[(String, String)]) -> Vec<std::ffi::CString> {
    let mut merged: Vec<(String, String)> = std::env::vars()
        .filter(|(name, _)| !env.iter().any(|(n, _)| n == name))
        .collect();
    merged.extend(env.iter().cloned());
    merged
        .into_iter()
        .filter_map(|(name, value)| std::ffi::CString::new(format!("{}={}", name, value)).ok())
        .collect()
}

/// Runs `cmdline` under /bin/sh with `env` overlaid on the inherited
/// environment.  `slow_cb` fires once the child has run for
/// `initial_slow_seconds` and then at the cadence the callback returns.
#[cfg(unix)]
pub fn execute_process(
    cmdline: &str,
    env: &[(String, String)],
    initial_slow_seconds: u64,
    mut slow_cb: Option<SlowCallback>,
) -> anyhow::Result<ExecResult> {
    use std::io::Read;
    use std::os::fd::{AsRawFd, FromRawFd};

    let env_strings = merged_environment(env);
    let mut envp: Vec<*const libc::c_char> =
        env_strings.iter().map(|s| s.as_ptr()).collect();
    envp.push(std::ptr::null());

    let (pid, mut pipe) = unsafe {
        let mut pipe: [libc::c_int; 2] = std::mem::zeroed();
        check_posix("pipe", libc::pipe(&mut pipe as *mut i32))?;

        let mut actions = PosixSpawnFileActions::new()?;
        // stdout/stderr => pipe
        actions.adddup2(pipe[1], 1)?;
        actions.adddup2(pipe[1], 2)?;
        // close pipe in child
        actions.addclose(pipe[0])?;
        actions.addclose(pipe[1])?;

        let mut pid: libc::pid_t = 0;
        let path = b"/bin/sh\0".as_ptr() as *const libc::c_char;
        let dash_c = b"-c\0".as_ptr() as *const libc::c_char;
        let cmdline_nul = std::ffi::CString::new(cmdline)?;
        let argv: [*const libc::c_char; 4] =
            [path, dash_c, cmdline_nul.as_ptr(), std::ptr::null()];

        check_posix(
            "posix_spawn",
            libc::posix_spawn(
                &mut pid,
                path,
                actions.as_ptr(),
                std::ptr::null(),
                argv.as_ptr() as *const *mut libc::c_char,
                envp.as_ptr() as *const *mut libc::c_char,
            ),
        )?;

        check_posix("close", libc::close(pipe[1]))?;

        (pid, std::fs::File::from_raw_fd(pipe[0]))
    };

    let mut output = Vec::new();
    let mut was_aborted = false;
    let mut killed = false;
    let mut next_slow = Instant::now() + Duration::from_secs(initial_slow_seconds.max(1));

    // Drain the pipe until EOF (child exit closes its end), waking at least
    // every 100ms to run the watchdog and notice interrupts.
    loop {
        if signal::is_interrupted() && !killed {
            unsafe { libc::kill(pid, libc::SIGTERM) };
            killed = true;
            was_aborted = true;
        }

        if slow_cb.is_some() && Instant::now() >= next_slow {
            let interval = slow_cb.as_mut().unwrap()().max(1);
            next_slow = Instant::now() + Duration::from_secs(interval);
        }

        let mut fds = libc::pollfd {
            fd: pipe.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut fds, 1, 100) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            bail!("poll: {}", err);
        }
        if ready == 0 {
            continue;
        }

        let mut buf = [0u8; 8192];
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => output.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => bail!("read child output: {}", err),
        }
    }

    let status = unsafe {
        let mut status: i32 = 0;
        loop {
            if libc::waitpid(pid, &mut status, 0) >= 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                bail!("waitpid: {}", err);
            }
        }
        status
    };

    let mut result = ExecResult {
        return_code: 0,
        was_signalled: false,
        was_aborted,
        output,
    };

    if libc::WIFEXITED(status) {
        result.return_code = libc::WEXITSTATUS(status);
    } else if libc::WIFSIGNALED(status) {
        let sig = libc::WTERMSIG(status);
        result.was_signalled = true;
        result.return_code = 128 + sig;
        if sig == libc::SIGINT {
            result.was_aborted = true;
        }
        use std::io::Write;
        let _ = write!(result.output, "terminated by signal {}", sig);
    } else {
        result.return_code = 1;
    }

    Ok(result)
}

#[cfg(not(unix))]
pub fn execute_process(
    _cmdline: &str,
    _env: &[(String, String)],
    _initial_slow_seconds: u64,
    _slow_cb: Option<SlowCallback>,
) -> anyhow::Result<ExecResult> {
    bail!("process execution is not supported on this platform");
}
