//! Terminal capability probing for colored output.

#[cfg(unix)]
pub fn stdout_isatty() -> bool {
    unsafe { libc::isatty(1) == 1 }
}

#[cfg(not(unix))]
pub fn stdout_isatty() -> bool {
    false
}

/// Whether result printing should emit ANSI colors.  Downstream log
/// consumers can override the tty heuristic either way.
pub fn use_colors() -> bool {
    match std::env::var("DOWNSTREAM_STDOUT_CONSUMER_SUPPORTS_COLOR") {
        Ok(v) if v.starts_with('1') => return true,
        Ok(v) if v.starts_with('0') => return false,
        _ => {}
    }
    stdout_isatty()
}
