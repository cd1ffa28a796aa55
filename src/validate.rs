//! Console-output validation: actions are expected to be quiet, or to print
//! only lines covered by the node's allowed substrings.

use crate::dag::{node_flags, NodeData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationResult {
    Pass,
    SwallowStdout,
    UnexpectedConsoleOutputFail,
    UnwrittenOutputFileFail,
}

impl ValidationResult {
    pub fn is_failure(self) -> bool {
        self >= ValidationResult::UnexpectedConsoleOutputFail
    }
}

/// Checks captured output against the node's allowed substrings.
/// The unwritten-output check happens separately, after the scheduler has
/// compared output timestamps.
pub fn validate_output(output: &[u8], node: &NodeData) -> ValidationResult {
    if output.iter().all(|&b| b == b'\n' || b == b'\r') {
        return ValidationResult::SwallowStdout;
    }

    let text = String::from_utf8_lossy(output);
    let covered = text.lines().filter(|line| !line.trim().is_empty()).all(|line| {
        node.allowed_output_substrings
            .iter()
            .any(|allowed| line.contains(allowed.as_str()))
    });

    if covered {
        return ValidationResult::Pass;
    }
    if node.has_flag(node_flags::ALLOW_UNEXPECTED_OUTPUT) {
        ValidationResult::Pass
    } else {
        ValidationResult::UnexpectedConsoleOutputFail
    }
}
