//! External command execution seam.
//!
//! Every mutation the reconciler performs against the host goes through
//! [`CommandRunner`], so tests can substitute a fake and assert on the
//! command stream instead of touching a real machine. The production
//! implementation blocks on each child with a bounded deadline; a child
//! that outlives its deadline is killed and reported as a step failure.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::ReconcileError;

/// Default per-command deadline. Package installs are the slow path.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A single external invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program name or absolute path.
    pub program: String,
    /// Arguments, unquoted.
    pub args: Vec<String>,
    /// Extra environment for the child.
    pub env: BTreeMap<String, String>,
    /// Run the child as this user via `runuser` (requires root).
    pub run_as: Option<String>,
    /// Bytes written to the child's stdin, then closed.
    pub stdin: Option<Vec<u8>>,
    /// Deadline for the child to exit.
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            run_as: None,
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn run_as(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    #[must_use]
    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Rendered command line for logs and error messages.
    #[must_use]
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Captured result of a completed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status; -1 when terminated by signal.
    pub status: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the child exited zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.status == 0
    }
}

/// Abstraction over external process execution.
pub trait CommandRunner {
    /// Run the command to completion and capture its output.
    ///
    /// A non-zero exit is NOT an error at this layer; callers that require
    /// success use [`CommandRunner::run_checked`].
    ///
    /// # Errors
    ///
    /// Returns an error if the child cannot be spawned or exceeds its
    /// deadline.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ReconcileError>;

    /// Locate a program on the PATH, `None` when absent.
    fn lookup(&self, program: &str) -> Option<PathBuf>;

    /// Run the command and require a zero exit status.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` on a non-zero exit, plus anything
    /// [`CommandRunner::run`] returns.
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, ReconcileError> {
        let output = self.run(spec)?;
        if output.success() {
            Ok(output)
        } else {
            Err(ReconcileError::CommandFailed {
                command: spec.display(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Whether a program resolves on the PATH.
    fn available(&self, program: &str) -> bool {
        self.lookup(program).is_some()
    }
}

/// Production runner backed by `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ReconcileError> {
        debug!(command = %spec.display(), run_as = ?spec.run_as, "exec");

        // `runuser` drops privileges without requiring a password entry,
        // unlike `su -c` which may consult PAM interactively.
        let mut cmd = match &spec.run_as {
            Some(user) => {
                let mut c = Command::new("runuser");
                c.arg("-u").arg(user).arg("--").arg(&spec.program);
                c
            },
            None => Command::new(&spec.program),
        };

        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReconcileError::DependencyMissing {
                    tool: spec.program.clone(),
                }
            } else {
                ReconcileError::Io(e)
            }
        })?;

        if let Some(bytes) = &spec.stdin {
            use std::io::Write;
            if let Some(mut sink) = child.stdin.take() {
                sink.write_all(bytes)?;
            }
        }

        // Drain both pipes off-thread so a chatty child cannot deadlock
        // against a full pipe buffer while we poll for exit.
        let stdout_handle = child.stdout.take().map(spawn_reader);
        let stderr_handle = child.stderr.take().map(spawn_reader);

        let deadline = Instant::now() + spec.timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ReconcileError::CommandTimeout {
                        command: spec.display(),
                        seconds: spec.timeout.as_secs(),
                    });
                },
                None => std::thread::sleep(WAIT_POLL_INTERVAL),
            }
        };

        let stdout = join_reader(stdout_handle);
        let stderr = join_reader(stderr_handle);

        Ok(CommandOutput {
            status: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    fn lookup(&self, program: &str) -> Option<PathBuf> {
        lookup_on_path(program)
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = reader.read_to_string(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Search the PATH (plus the sbin directories root tools live in) for an
/// executable file.
#[must_use]
pub fn lookup_on_path(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let p = PathBuf::from(program);
        return is_executable(&p).then_some(p);
    }

    let path = std::env::var_os("PATH").unwrap_or_default();
    let extra = ["/usr/sbin", "/sbin", "/usr/local/sbin"];
    std::env::split_paths(&path)
        .chain(extra.iter().map(PathBuf::from))
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_builder_renders_display() {
        let spec = CommandSpec::new("systemctl").args(["enable", "ipfs-relay.service"]);
        assert_eq!(spec.display(), "systemctl enable ipfs-relay.service");
    }

    #[test]
    fn run_captures_stdout() {
        let out = SystemRunner::new()
            .run(&CommandSpec::new("sh").args(["-c", "printf converged"]))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "converged");
    }

    #[test]
    fn run_checked_surfaces_stderr() {
        let err = SystemRunner::new()
            .run_checked(&CommandSpec::new("sh").args(["-c", "echo broken >&2; exit 3"]))
            .unwrap_err();
        match err {
            ReconcileError::CommandFailed { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "broken");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn timeout_kills_the_child() {
        let err = SystemRunner::new()
            .run(
                &CommandSpec::new("sleep")
                    .arg("30")
                    .timeout(Duration::from_millis(200)),
            )
            .unwrap_err();
        assert!(matches!(err, ReconcileError::CommandTimeout { .. }));
    }

    #[test]
    fn missing_program_is_dependency_missing() {
        let err = SystemRunner::new()
            .run(&CommandSpec::new("relayctl-no-such-tool-x9"))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::DependencyMissing { .. }));
    }

    #[test]
    fn stdin_reaches_the_child() {
        let out = SystemRunner::new()
            .run(&CommandSpec::new("cat").stdin("secret-line"))
            .unwrap();
        assert_eq!(out.stdout, "secret-line");
    }

    #[test]
    fn lookup_finds_sh() {
        assert!(lookup_on_path("sh").is_some());
        assert!(lookup_on_path("relayctl-no-such-tool-x9").is_none());
    }
}
