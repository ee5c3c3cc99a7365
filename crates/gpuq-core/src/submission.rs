//! Task file parsing
//!
//! One task per line, `arg0 arg1 ...[;num_gpus]`. Blank lines and lines
//! starting with `#` are skipped. The GPU count defaults to 1.

use std::path::Path;

use crate::error::{GpuqError, GpuqResult};

/// A single parsed line of a task file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub command: Vec<String>,
    pub num_gpus: u32,
}

/// Parse one line; `Ok(None)` for comments and blank lines
pub fn parse_line(line: &str) -> GpuqResult<Option<Submission>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (command_part, gpus_part) = match line.split_once(';') {
        Some((cmd, gpus)) => (cmd, Some(gpus)),
        None => (line, None),
    };

    let command: Vec<String> = command_part.split_whitespace().map(str::to_string).collect();
    if command.is_empty() {
        return Err(GpuqError::Validation(format!("empty command in `{}`", line)));
    }

    let num_gpus = match gpus_part {
        None => 1,
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(GpuqError::Validation(format!(
                    "number of GPUs must be a positive integer, got `{}`",
                    raw.trim()
                )))
            }
        },
    };

    Ok(Some(Submission { command, num_gpus }))
}

/// Parse a whole task file body. Fails on the first malformed line.
pub fn parse_str(content: &str) -> GpuqResult<Vec<Submission>> {
    let mut submissions = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(submission)) => submissions.push(submission),
            Ok(None) => {}
            Err(GpuqError::Validation(msg)) => {
                return Err(GpuqError::Validation(format!("line {}: {}", idx + 1, msg)))
            }
            Err(e) => return Err(e),
        }
    }
    Ok(submissions)
}

/// Read and parse a task file
pub fn parse_file(path: &Path) -> GpuqResult<Vec<Submission>> {
    if !path.exists() {
        return Err(GpuqError::Validation(format!(
            "`{}` does not exist!",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}
