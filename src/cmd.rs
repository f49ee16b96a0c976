//! Subprocess execution. Capturing lives here; streaming with log mirroring
//! lives in [`crate::spinner`].

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::process::{Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};
use wait_timeout::ChildExt;

use crate::error::{Error, Result};

/// A builder for executing external tools with unified error handling
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    timeout: Option<Duration>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Kill the child if it has not exited within `timeout` (capturing mode only).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human-readable command line for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The underlying `std::process::Command`, for callers that manage pipes.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd
    }

    /// Execute and capture output, failing on a non-zero exit code.
    pub fn run(self) -> Result<Output> {
        let output = self.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                command = %self.display(),
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(Error::Transport(format!(
                "command failed: {}\n{}",
                self.display(),
                stderr.trim()
            )));
        }
        trace!(command = %self.display(), "cmd:run success");
        Ok(output)
    }

    /// Execute and capture output without judging the exit code.
    pub fn output(&self) -> Result<Output> {
        trace!(command = %self.display(), "cmd:output start");
        let mut cmd = self.to_command();
        let Some(timeout) = self.timeout else {
            return cmd
                .output()
                .map_err(|e| spawn_error(&self.display(), e));
        };

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.display(), e))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match child.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Timeout {
                    what: self.display(),
                    secs: timeout.as_secs(),
                });
            }
        };
        Ok(Output {
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }

    /// Execute and return stdout as a trimmed string
    pub fn run_and_capture_stdout(self) -> Result<String> {
        let output = self.run()?;
        String::from_utf8(output.stdout)
            .map(|s| s.trim().to_string())
            .map_err(|e| Error::Protocol(format!("non-UTF-8 output: {}", e)))
    }

    /// Attach the child to the caller's stdio and return its exit code.
    pub fn run_interactive(self) -> Result<i32> {
        debug!(command = %self.display(), "cmd:interactive");
        let status = self
            .to_command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| spawn_error(&self.display(), e))?;
        Ok(status.code().unwrap_or(-1))
    }

}

pub(crate) fn spawn_error(display: &str, e: std::io::Error) -> Error {
    Error::Transport(format!("failed to execute {}: {}", display, e))
}

pub(crate) fn check_status(display: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(Error::Transport(format!(
            "{} exited with code {}",
            display,
            status.code().unwrap_or(-1)
        )))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_stdout() {
        let out = Cmd::new("sh")
            .args(["-c", "echo hello"])
            .run_and_capture_stdout()
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn nonzero_exit_is_error_with_stderr() {
        let err = Cmd::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn interactive_returns_exit_code() {
        assert_eq!(Cmd::new("sh").args(["-c", "exit 4"]).run_interactive().unwrap(), 4);
    }

    #[test]
    fn timeout_kills_child() {
        let err = Cmd::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100))
            .output()
            .unwrap_err();
        assert!(err.is(crate::error::ErrorKind::Timeout));
    }

    #[test]
    fn env_is_passed() {
        let out = Cmd::new("sh")
            .args(["-c", "printf %s \"$COOP_TEST_VAR\""])
            .env("COOP_TEST_VAR", "xyz")
            .timeout(Duration::from_secs(5))
            .run_and_capture_stdout()
            .unwrap();
        assert_eq!(out, "xyz");
    }

    #[test]
    fn missing_binary_is_transport_error() {
        let err = Cmd::new("coop-definitely-missing-binary").run().unwrap_err();
        assert!(err.is(crate::error::ErrorKind::Transport));
    }
}
