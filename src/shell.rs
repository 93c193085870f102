//! Running recipe lines and `!=` commands through `${SHELL}`.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::error::Error;

/// One shell invocation: `program -c line` (or `-ec`) inside `cwd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    /// Directory of the scope that owns the line.
    pub cwd: PathBuf,
    /// Pass `-ec` so the shell stops at the first failing command.
    pub errexit: bool,
    /// Expanded command text.
    pub line: String,
    /// Expanded `${SHELL}`.
    pub program: String,
}

impl ShellCommand {
    /// Option introducing the command string.
    fn flag(&self) -> &'static str {
        return if self.errexit { "-ec" } else { "-c" };
    }
}

/// What the build engine needs from process spawning.
pub trait ShellExecutor {
    /// Run with inherited stdout/stderr and return the exit status.
    /// A process killed by a signal reports 255.
    ///
    /// # Errors
    ///
    /// Returns `Error::Spawn` if the shell cannot be started.
    fn run(&self, cmd: &ShellCommand) -> Result<i32, Error>;

    /// Run and return standard output with surrounding whitespace trimmed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Spawn` if the shell cannot be started.
    fn capture(&self, cmd: &ShellCommand) -> Result<String, Error>;
}

/// Spawns real processes with stdin from `/dev/null`.
pub struct SystemShell;

impl SystemShell {
    /// Prepared process, or a 126 spawn error if `cwd` is gone.
    fn command(cmd: &ShellCommand) -> Result<Command, Error> {
        if !cmd.cwd.is_dir() {
            return Err(Error::Spawn {
                code: 126,
                program: cmd.program.clone(),
                source: std::io::Error::new(ErrorKind::NotFound, format!("cannot chdir to {}", cmd.cwd.display())),
            });
        }
        let mut command = Command::new(&cmd.program);
        command
            .arg(cmd.flag())
            .arg(&cmd.line)
            .current_dir(&cmd.cwd)
            .stdin(Stdio::null());
        return Ok(command);
    }
}

/// 127 for a missing shell, 126 for any other spawn failure.
fn spawn_error(program: &str, source: std::io::Error) -> Error {
    let code = if source.kind() == ErrorKind::NotFound { 127 } else { 126 };
    return Error::Spawn {
        code,
        program: program.to_string(),
        source,
    };
}

impl ShellExecutor for SystemShell {
    fn run(&self, cmd: &ShellCommand) -> Result<i32, Error> {
        info!(cmd = %cmd.line, cwd = %cmd.cwd.display(), "running");
        let status = Self::command(cmd)?
            .status()
            .map_err(|e| return spawn_error(&cmd.program, e))?;
        let code = status.code().unwrap_or(255);
        debug!(code, "exited");
        return Ok(code);
    }

    fn capture(&self, cmd: &ShellCommand) -> Result<String, Error> {
        info!(cmd = %cmd.line, cwd = %cmd.cwd.display(), "capturing");
        let output = Self::command(cmd)?
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| return spawn_error(&cmd.program, e))?;
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }
}

/// Test double that records invocations and understands a few commands:
/// `exit N` returns N, `touch a b` creates files under `cwd`, `echo x`
/// is what `capture` returns.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingShell {
    /// Every command seen, in order.
    pub calls: std::cell::RefCell<Vec<ShellCommand>>,
}

#[cfg(test)]
impl RecordingShell {
    /// Command text of every call.
    pub fn lines(&self) -> Vec<String> {
        return self.calls.borrow().iter().map(|c| return c.line.clone()).collect();
    }
}

#[cfg(test)]
impl ShellExecutor for RecordingShell {
    fn run(&self, cmd: &ShellCommand) -> Result<i32, Error> {
        self.calls.borrow_mut().push(cmd.clone());
        if let Some(code) = cmd.line.strip_prefix("exit ") {
            return Ok(code.trim().parse().unwrap_or(1));
        }
        if let Some(names) = cmd.line.strip_prefix("touch ") {
            for name in names.split_whitespace() {
                let path = cmd.cwd.join(name);
                let file = std::fs::File::create(&path)?;
                file.set_modified(std::time::SystemTime::now())?;
            }
        }
        return Ok(0);
    }

    fn capture(&self, cmd: &ShellCommand) -> Result<String, Error> {
        self.calls.borrow_mut().push(cmd.clone());
        let echoed = cmd.line.strip_prefix("echo ").unwrap_or_default();
        return Ok(echoed.trim().to_string());
    }
}
