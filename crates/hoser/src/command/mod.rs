//! Script commands.
//!
//! A script is a sequence of lines of the form `code {json body}`:
//!
//! ```text
//! // comments and blank lines are skipped
//! pipeline {"id": "/example"}
//! start {"id": "/example/grep0", "exe": "grep", "argv": ["-v", "bad"]}
//! set {"id": "/example/input", "read": "file://input.txt"}
//! pipe {"src": "/example/input", "dst": "/example/grep0[stdin]"}
//! exit {"when": "/example/output"}
//! ```

mod ident;
mod read;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CommandError;

pub use ident::Ident;
pub use read::{MAX_CODE_LEN, is_skipped, parse_line, read_script, read_script_file};

/// The first word of a script line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Pipeline,
    Start,
    Set,
    Pipe,
    Exit,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Pipeline => "pipeline",
            Code::Start => "start",
            Code::Set => "set",
            Code::Pipe => "pipe",
            Code::Exit => "exit",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Code {
    type Err = CommandError;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code {
            "pipeline" => Ok(Code::Pipeline),
            "start" => Ok(Code::Start),
            "set" => Ok(Code::Set),
            "pipe" => Ok(Code::Pipe),
            "exit" => Ok(Code::Exit),
            _ => Err(CommandError::UnknownCode {
                code: code.to_string(),
            }),
        }
    }
}

/// Data direction of a process port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// One argv entry: literal text, or a named port replaced by its pipe path.
///
/// Ports are written `{"in": "name"}` or `{"out": "name"}` in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawArg", into = "RawArg")]
pub enum Arg {
    Literal(String),
    Port { name: String, direction: Direction },
}

impl Arg {
    pub fn literal(text: impl Into<String>) -> Self {
        Arg::Literal(text.into())
    }

    pub fn input(name: impl Into<String>) -> Self {
        Arg::Port {
            name: name.into(),
            direction: Direction::In,
        }
    }

    pub fn output(name: impl Into<String>) -> Self {
        Arg::Port {
            name: name.into(),
            direction: Direction::Out,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawArg {
    Literal(String),
    Port(RawPort),
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPort {
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    input: Option<String>,
    #[serde(rename = "out", default, skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

impl TryFrom<RawArg> for Arg {
    type Error = String;

    fn try_from(raw: RawArg) -> Result<Self, Self::Error> {
        match raw {
            RawArg::Literal(text) => Ok(Arg::Literal(text)),
            RawArg::Port(RawPort {
                input: Some(name),
                output: None,
            }) => Ok(Arg::input(name)),
            RawArg::Port(RawPort {
                input: None,
                output: Some(name),
            }) => Ok(Arg::output(name)),
            RawArg::Port(_) => Err("port argument needs exactly one of 'in' or 'out'".to_string()),
        }
    }
}

impl From<Arg> for RawArg {
    fn from(arg: Arg) -> Self {
        match arg {
            Arg::Literal(text) => RawArg::Literal(text),
            Arg::Port {
                name,
                direction: Direction::In,
            } => RawArg::Port(RawPort {
                input: Some(name),
                output: None,
            }),
            Arg::Port {
                name,
                direction: Direction::Out,
            } => RawArg::Port(RawPort {
                input: None,
                output: Some(name),
            }),
        }
    }
}

/// Declared port in a `start` body's `ports` map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortSpec {
    #[serde(default)]
    pub dir: Direction,
}

/// `pipeline {"id": "/name"}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineBody {
    #[serde(default)]
    pub id: String,
}

/// `start {"id": "/p/node", "exe": "...", "argv": [...], "ports": {...}}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartBody {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub exe: String,
    #[serde(default)]
    pub argv: Vec<Arg>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, PortSpec>,
}

/// `set {"id": "/p/var", "text"|"read"|"write": "..."}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetBody {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub read: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub write: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
}

impl SetBody {
    /// Sets a destination that data is written into.
    pub fn is_sink(&self) -> bool {
        !self.write.is_empty()
    }

    /// Sets a source that data is read from.
    pub fn is_spout(&self) -> bool {
        !self.read.is_empty() || !self.text.is_empty()
    }
}

/// `pipe {"src": "/p/a[stdout]", "dst": "/p/b[stdin]"}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipeBody {
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub dst: String,
}

/// `exit {"when": "/p/node"}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExitBody {
    #[serde(default)]
    pub when: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pipeline(PipelineBody),
    Start(StartBody),
    Set(SetBody),
    Pipe(PipeBody),
    Exit(ExitBody),
}

impl Command {
    /// Decode a JSON body for `code`.
    pub fn from_body(code: Code, body: &str) -> Result<Self, serde_json::Error> {
        Ok(match code {
            Code::Pipeline => Command::Pipeline(serde_json::from_str(body)?),
            Code::Start => Command::Start(serde_json::from_str(body)?),
            Code::Set => Command::Set(serde_json::from_str(body)?),
            Code::Pipe => Command::Pipe(serde_json::from_str(body)?),
            Code::Exit => Command::Exit(serde_json::from_str(body)?),
        })
    }

    pub fn code(&self) -> Code {
        match self {
            Command::Pipeline(_) => Code::Pipeline,
            Command::Start(_) => Code::Start,
            Command::Set(_) => Code::Set,
            Command::Pipe(_) => Code::Pipe,
            Command::Exit(_) => Code::Exit,
        }
    }

    pub fn body_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Command::Pipeline(body) => serde_json::to_string(body),
            Command::Start(body) => serde_json::to_string(body),
            Command::Set(body) => serde_json::to_string(body),
            Command::Pipe(body) => serde_json::to_string(body),
            Command::Exit(body) => serde_json::to_string(body),
        }
    }
}

/// Renders the command back into script syntax.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body_json().map_err(|_| fmt::Error)?;
        write!(f, "{} {body}", self.code())
    }
}
