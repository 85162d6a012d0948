// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External process calls.
//!
//! Every external command is a blocking call with no timeout. Standard output
//! of a child never reaches our own standard output, which stays reserved for
//! the final apply step.

use std::{
    ffi::{OsStr, OsString},
    io::stderr,
    process::{Command, Stdio},
};
use tracing::debug;

/// Run command whose output we want to inspect.
///
/// Captures standard output and standard error. On success, only the trimmed
/// standard output is returned.
///
/// # Errors
///
/// - Return [`SyscallError::Spawn`] if command cannot be started.
/// - Return [`SyscallError::Failed`] if command exits unsuccessfully.
pub fn syscall_non_interactive(argv: &[OsString]) -> Result<String> {
    let (program, args) = split(argv)?;
    debug!("run {}", display_argv(argv));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| SyscallError::Spawn {
            source: err,
            command: display_argv(argv),
        })?;

    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

    if !output.status.success() {
        let mut message = String::new();
        if !stdout.trim().is_empty() {
            message.push_str(format!("stdout: {}\n", stdout.trim_end()).as_str());
        }
        if !stderr.trim().is_empty() {
            message.push_str(format!("stderr: {}", stderr.trim_end()).as_str());
        }

        return Err(SyscallError::Failed {
            command: display_argv(argv),
            code: output.status.code(),
            message: message.trim_end().to_string(),
        });
    }

    // INVARIANT: Chomp trailing newlines.
    Ok(stdout.trim_end().to_string())
}

/// Run command that may need to talk to the user.
///
/// Standard input and standard error are inherited so an escalation helper
/// can prompt for a password. Standard output of the child is redirected to
/// our standard error.
///
/// # Errors
///
/// - Return [`SyscallError::Spawn`] if command cannot be started.
/// - Return [`SyscallError::Failed`] if command exits unsuccessfully.
pub fn syscall_interactive(argv: &[OsString]) -> Result<()> {
    let (program, args) = split(argv)?;
    debug!("run {}", display_argv(argv));
    let status = Command::new(program)
        .args(args)
        .stdout(Stdio::from(stderr()))
        .spawn()
        .and_then(|mut child| child.wait())
        .map_err(|err| SyscallError::Spawn {
            source: err,
            command: display_argv(argv),
        })?;

    if !status.success() {
        return Err(SyscallError::Failed {
            command: display_argv(argv),
            code: status.code(),
            message: String::new(),
        });
    }

    Ok(())
}

/// Render argument vector for humans.
pub fn display_argv(argv: &[OsString]) -> String {
    argv.iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn split(argv: &[OsString]) -> Result<(&OsStr, &[OsString])> {
    match argv.split_first() {
        Some((program, args)) => Ok((program.as_os_str(), args)),
        None => Err(SyscallError::Empty),
    }
}

/// External process error types.
#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    /// Nothing to run.
    #[error("cannot run empty command")]
    Empty,

    /// Command could not be started.
    #[error("failed to run {command:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        command: String,
    },

    /// Command ran, but exited unsuccessfully.
    #[error("command {command:?} failed ({})\n{message}", exit_label(*code))]
    Failed {
        command: String,
        code: Option<i32>,
        message: String,
    },
}

impl SyscallError {
    /// Exit code of failed command, if it exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => *code,
            _ => None,
        }
    }
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".into(),
    }
}

/// Friendly result alias :3
pub type Result<T, E = SyscallError> = std::result::Result<T, E>;
