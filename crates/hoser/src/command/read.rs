//! Script parsing.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use snafu::prelude::*;

use super::{Code, Command};
use crate::error::{
    CodeTooLongSnafu, CommandError, InvalidBodySnafu, MissingBodySnafu, OpenScriptSnafu,
    ReadScriptSnafu, ScriptError, ScriptLineSnafu,
};

/// Longest accepted command code, in bytes.
pub const MAX_CODE_LEN: usize = 128;

/// Blank lines and `//` comments carry no command.
pub fn is_skipped(line: &str) -> bool {
    let line = line.trim();
    line.is_empty() || line.starts_with("//")
}

/// Parse one `code {body}` line.
pub fn parse_line(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    let (code, body) = line
        .split_once(char::is_whitespace)
        .map(|(code, body)| (code, body.trim_start()))
        .unwrap_or((line, ""));

    ensure!(
        code.len() <= MAX_CODE_LEN,
        CodeTooLongSnafu {
            len: code.len(),
            max: MAX_CODE_LEN,
        }
    );
    let code: Code = code.parse()?;
    ensure!(!body.is_empty(), MissingBodySnafu { code: code.as_str() });

    Command::from_body(code, body).context(InvalidBodySnafu { code: code.as_str() })
}

/// Parse every command in a script, stopping at the first bad line.
pub fn read_script<R: BufRead>(reader: R) -> Result<Vec<Command>, ScriptError> {
    let mut commands = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.context(ReadScriptSnafu)?;
        if is_skipped(&line) {
            continue;
        }
        let command = parse_line(&line).context(ScriptLineSnafu {
            line: index + 1,
            text: line.trim(),
        })?;
        commands.push(command);
    }
    Ok(commands)
}

pub fn read_script_file(path: &Path) -> Result<Vec<Command>, ScriptError> {
    let file = File::open(path).context(OpenScriptSnafu { path })?;
    read_script(BufReader::new(file))
}
