//! JSON I/O for the CLI
//!
//! - Input: one JSON object on stdin
//! - Output: one JSON object per line on stdout

use std::io::{self, BufRead, Write};

use serde::Serialize;
use serde_json::Value;

use super::errors::{CliError, CliResult};

/// Read one JSON request line from stdin, checking that it parses.
pub fn read_request() -> CliResult<String> {
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    let line = line.trim();
    if line.is_empty() {
        return Err(CliError::EmptyInput);
    }
    serde_json::from_str::<Value>(line)?;
    Ok(line.to_string())
}

/// Write a value as one line of JSON to stdout.
pub fn write_json<T: Serialize>(value: &T) -> CliResult<()> {
    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

/// Write an already encoded line to stdout.
pub fn write_line(line: &str) -> CliResult<()> {
    let mut stdout = io::stdout();
    writeln!(stdout, "{}", line)?;
    stdout.flush()?;
    Ok(())
}
