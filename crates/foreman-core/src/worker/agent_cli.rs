//! Agent CLI command construction.
//!
//! Translates a planner [`WorkerCall`] into the argv/env/stdin for a
//! concrete agent CLI. Each CLI has its own flag dialect; prompts go on
//! argv or stdin depending on `use_stdin`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::planner::protocol::WorkerCall;

/// Supported agent CLI kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliKind {
    Codex,
    ClaudeCode,
    CursorCli,
}

impl CliKind {
    /// Default binary name for the kind.
    pub fn default_command(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::ClaudeCode => "claude",
            Self::CursorCli => "cursor",
        }
    }
}

impl fmt::Display for CliKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Codex => "codex",
            Self::ClaudeCode => "claude-code",
            Self::CursorCli => "cursor-cli",
        };
        f.write_str(s)
    }
}

impl FromStr for CliKind {
    type Err = CliKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "codex" | "codex-cli" => Ok(Self::Codex),
            "claude" | "claude-code" => Ok(Self::ClaudeCode),
            "cursor" | "cursor-cli" => Ok(Self::CursorCli),
            other => Err(CliKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CliKind`] string.
#[derive(Debug, Clone)]
pub struct CliKindParseError(pub String);

impl fmt::Display for CliKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown agent CLI kind: {:?}", self.0)
    }
}

impl std::error::Error for CliKindParseError {}

/// A fully constructed agent CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecPlan {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub stdin: Option<String>,
}

/// Build the invocation for a worker call.
///
/// `default_kind` is used when the call leaves `worker_type` empty.
pub fn build_exec_plan(
    call: &WorkerCall,
    default_kind: CliKind,
) -> Result<ExecPlan, CliKindParseError> {
    let kind = if call.worker_type.is_empty() {
        default_kind
    } else {
        call.worker_type.parse()?
    };

    let command = call
        .cli_path
        .clone()
        .unwrap_or_else(|| kind.default_command().to_owned());

    let mut argv = vec![command];
    match kind {
        CliKind::Codex => {
            argv.extend(
                ["exec", "--sandbox", "workspace-write", "--json"]
                    .map(str::to_owned),
            );
            if let Some(model) = &call.model {
                argv.extend(["--model".to_owned(), model.clone()]);
            }
        }
        CliKind::ClaudeCode => {
            argv.push("-p".to_owned());
            if let Some(model) = &call.model {
                argv.extend(["--model".to_owned(), model.clone()]);
            }
        }
        CliKind::CursorCli => {
            if let Some(model) = &call.model {
                argv.extend(["--model".to_owned(), model.clone()]);
            }
        }
    }
    argv.extend(call.flags.iter().cloned());

    let stdin = if call.use_stdin {
        // Cursor reads from "-"; codex and claude detect piped stdin.
        if kind == CliKind::CursorCli {
            argv.push("-".to_owned());
        }
        Some(call.prompt.clone())
    } else {
        argv.push(call.prompt.clone());
        None
    };

    Ok(ExecPlan {
        argv,
        env: call.env.clone(),
        stdin,
    })
}
