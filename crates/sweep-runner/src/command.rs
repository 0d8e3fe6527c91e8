use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr_tail}")]
    ExitStatus {
        command: String,
        status: String,
        stderr_tail: String,
    },
    #[error("unusable output from `{command}`: {details}")]
    Output { command: String, details: String },
    #[error("empty command line")]
    EmptyArgv,
}

#[derive(Debug, Clone)]
pub struct CommandLine {
    argv: Vec<String>,
    work_dir: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            work_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub fn with_args<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = self.argv.clone();
        argv.extend(args.into_iter().map(Into::into));
        argv
    }

    pub fn run<I, S>(&self, args: I) -> Result<Output, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv = self.with_args(args);
        run_checked(&argv, self.work_dir())
    }
}

pub fn run_checked(argv: &[String], work_dir: Option<&Path>) -> Result<Output, CommandError> {
    let (program, args) = argv.split_first().ok_or(CommandError::EmptyArgv)?;
    let command_line = shell_join(argv);
    tracing::debug!(command = %command_line, "running command");

    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = work_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd.output().map_err(|source| CommandError::Spawn {
        command: command_line.clone(),
        source,
    })?;
    if output.status.success() {
        return Ok(output);
    }
    let status = output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let stderr_tail = String::from_utf8_lossy(&output.stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no stderr output")
        .trim()
        .to_string();
    Err(CommandError::ExitStatus {
        command: command_line,
        status,
        stderr_tail,
    })
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
