//! Node result printing.
//!
//! One result line per processed node, `[NNN/MMM Ds] annotation`, colored by
//! status.  Failure diagnostics are deferred into a buffer and flushed at
//! queue teardown so they land grouped at the end of the log, and a watchdog
//! prints rate-limited `[BUSY Ds]` lines for long-running actions.  All
//! printing happens under the queue lock to keep lines whole.

use crate::validate::ValidationResult;
use std::io::Write;
use std::time::Instant;

const RED: &str = "\x1b[31m";
const YEL: &str = "\x1b[33m";
const GRN: &str = "\x1b[32m";
const WHT: &str = "\x1b[37m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
    Success,
    Failure,
}

impl StatusLevel {
    fn color(self) -> &'static str {
        match self {
            StatusLevel::Info => WHT,
            StatusLevel::Warning => YEL,
            StatusLevel::Success => GRN,
            StatusLevel::Failure => RED,
        }
    }
}

/// Everything needed to print one node's result, possibly later.
pub struct NodeResultData {
    pub annotation: String,
    pub cmd_line: Option<String>,
    pub env_vars: Vec<(String, String)>,
    pub allowed_substrings: Vec<String>,
    pub untouched_outputs: Vec<String>,
    pub output: Option<String>,
    pub verbose: bool,
    pub duration_secs: u64,
    pub validation: ValidationResult,
    pub processed: u32,
    pub status: StatusLevel,
    pub return_code: i32,
    pub was_signalled: bool,
    pub was_aborted: bool,
}

pub struct Printer {
    emit_colors: bool,
    total_nodes: usize,
    deferred: Vec<NodeResultData>,
    last_message_time: Option<Instant>,
    last_busy_node: Option<u32>,
    total_printed: u32,
}

impl Printer {
    pub fn new(total_nodes: usize, emit_colors: bool) -> Printer {
        Printer {
            emit_colors,
            total_nodes,
            deferred: Vec::new(),
            last_message_time: None,
            last_busy_node: None,
            total_printed: 0,
        }
    }

    fn digits(&self) -> usize {
        let mut digits = 1;
        let mut n = self.total_nodes;
        while n >= 10 {
            digits += 1;
            n /= 10;
        }
        digits
    }

    fn color(&self, code: &'static str) -> &'static str {
        if self.emit_colors {
            code
        } else {
            ""
        }
    }

    fn print_line_with_duration(
        &self,
        duration: u64,
        progress: &str,
        status: StatusLevel,
        annotation: &str,
    ) {
        let set = self.color(status.color());
        let reset = self.color(RESET);
        let failure_tag = if status == StatusLevel::Failure && !self.emit_colors {
            "!FAILED! "
        } else {
            ""
        };
        if status == StatusLevel::Failure {
            // Color the whole line red, only resetting at the end.
            println!(
                "{}[{}{} {:2}s] {}{}",
                set, failure_tag, progress, duration, annotation, reset
            );
        } else {
            println!(
                "{}[{}{} {:2}s]{} {}",
                set, failure_tag, progress, duration, reset, annotation
            );
        }
    }

    /// A result line for work that isn't a node: shared resource actions,
    /// stale output deletion, throttling notices.
    pub fn print_non_node_result(
        &mut self,
        duration: u64,
        status: StatusLevel,
        annotation: &str,
        output: Option<&str>,
    ) {
        let blank = " ".repeat(self.digits() * 2 + 1);
        self.print_line_with_duration(duration, &blank, status, annotation);
        if let Some(output) = output {
            let trimmed = self.prepare_output(output);
            if !trimmed.is_empty() {
                println!("{}", trimmed);
            }
        }
        self.touch();
    }

    pub fn service_message(&mut self, status: StatusLevel, message: &str) {
        println!(
            "{}{}{}",
            self.color(status.color()),
            message,
            self.color(RESET)
        );
        let _ = std::io::stdout().flush();
    }

    /// Prints, or defers when `defer` is set (failures grouped at the end of
    /// the log).
    pub fn print_node_result(&mut self, data: NodeResultData, defer: bool) {
        if defer {
            self.deferred.push(data);
        } else {
            self.print_result_now(&data);
        }
        self.total_printed += 1;
        self.touch();
        let _ = std::io::stdout().flush();
    }

    fn print_result_now(&self, data: &NodeResultData) {
        let digits = self.digits();
        let progress = format!(
            "{:>width$}/{}",
            data.processed,
            self.total_nodes,
            width = digits
        );
        self.print_line_with_duration(
            data.duration_secs,
            &progress,
            data.status,
            &data.annotation,
        );

        if data.verbose {
            if let Some(cmd) = &data.cmd_line {
                self.diagnostic("CommandLine", YEL);
                println!("{}", cmd);
            }
            if !data.env_vars.is_empty() {
                self.diagnostic("Custom Environment Variables", YEL);
                for (name, value) in &data.env_vars {
                    println!("{}={}", name, value);
                }
            }
            if data.return_code == 0 && !data.was_signalled {
                match data.validation {
                    ValidationResult::UnexpectedConsoleOutputFail => {
                        self.diagnostic(
                            "Failed because this command wrote something to the output that wasn't expected. We were expecting any of the following strings:",
                            RED,
                        );
                        if data.allowed_substrings.is_empty() {
                            println!("<< no allowed strings >>");
                        }
                        for allowed in &data.allowed_substrings {
                            println!("{}", allowed);
                        }
                    }
                    ValidationResult::UnwrittenOutputFileFail => {
                        self.diagnostic(
                            "Failed because this command failed to write the following output files:",
                            RED,
                        );
                        for path in &data.untouched_outputs {
                            println!("{}", path);
                        }
                    }
                    _ => {}
                }
            }
            if data.was_signalled {
                self.diagnostic("Was Signaled", YEL);
                println!("Yes");
            }
            if data.was_aborted {
                self.diagnostic("Was Aborted", YEL);
                println!("Yes");
            }
            if data.return_code != 0 {
                self.diagnostic("ExitCode", YEL);
                println!("{}", data.return_code);
            }
        }

        if let Some(output) = &data.output {
            if data.verbose {
                self.diagnostic("Output", YEL);
                println!("{}", self.prepare_output(output));
            } else if data.validation != ValidationResult::SwallowStdout {
                println!("{}", self.prepare_output(output));
            }
        }
    }

    fn diagnostic(&self, title: &str, color: &'static str) {
        println!(
            "{}##### {}{}",
            self.color(color),
            title,
            self.color(RESET)
        );
    }

    /// Trims trailing newlines; strips ANSI sequences when we aren't a
    /// color-capable consumer ourselves.
    fn prepare_output(&self, output: &str) -> String {
        let trimmed = output.trim_end_matches(['\n', '\r']);
        if self.emit_colors {
            trimmed.to_string()
        } else {
            strip_ansi_colors(trimmed)
        }
    }

    /// `[BUSY Ds]` line for a long-running node; rate-limited so repeated
    /// callbacks don't spam.  Returns the seconds until the next callback.
    pub fn print_busy(&mut self, node_index: u32, annotation: &str, started: Instant) -> u64 {
        let now = Instant::now();
        let running = now.duration_since(started).as_secs();
        let since_last = match self.last_message_time {
            Some(t) => now.duration_since(t).as_secs(),
            None => u64::MAX,
        };

        let acceptable_gap = if self.last_busy_node == Some(node_index) {
            10
        } else if self.total_printed == 0 {
            0
        } else {
            5
        };
        let only_if_slower_than = if since_last > 30 { 0 } else { 5 };

        if since_last > acceptable_gap && running > only_if_slower_than {
            let digits = self.digits();
            println!(
                "{}[BUSY {:>width$}s]{} {}",
                self.color(YEL),
                running,
                self.color(RESET),
                annotation,
                width = std::cmp::max(1, digits * 2 - 1),
            );
            self.last_message_time = Some(now);
            self.last_busy_node = Some(node_index);
            let _ = std::io::stdout().flush();
        }

        1
    }

    pub fn flush_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        for data in &deferred {
            self.print_result_now(data);
        }
        let _ = std::io::stdout().flush();
    }

    fn touch(&mut self) {
        self.last_message_time = Some(Instant::now());
        self.last_busy_node = None;
    }
}

fn is_terminating_char(c: u8) -> bool {
    (0x40..=0x7e).contains(&c)
}

/// Removes `ESC [ ... <final>` sequences, leaving other bytes alone.
pub fn strip_ansi_colors(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x1b && i + 1 < bytes.len() && bytes[i + 1] == b'[' {
            let mut j = i + 2;
            while j < bytes.len() && !is_terminating_char(bytes[j]) {
                j += 1;
            }
            if j < bytes.len() {
                i = j + 1;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
