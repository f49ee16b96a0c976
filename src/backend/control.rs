//! Client for the VM daemon's versioned line protocol.
//!
//! A request is `v1 <command>\n`. A reply is `v1 <value>\n` or
//! `v1 error: <message>\n`. Unversioned legacy replies are accepted as the
//! bare value. One request per connection.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Error, Result};

pub const PROTOCOL_VERSION: &str = "v1";
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const EXCHANGE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
    dial_timeout: Duration,
    deadline: Duration,
}

impl ControlClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            dial_timeout: DIAL_TIMEOUT,
            deadline: EXCHANGE_DEADLINE,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send one command and return the reply value.
    pub fn request(&self, command: &str) -> Result<String> {
        if command.contains('\n') {
            return Err(Error::Protocol("command contains a newline".into()));
        }
        let stream = self.dial()?;
        stream.set_read_timeout(Some(self.deadline))?;
        stream.set_write_timeout(Some(self.deadline))?;

        let mut writer = stream
            .try_clone()
            .map_err(|e| Error::Transport(format!("clone control socket: {}", e)))?;
        trace!(socket = %self.socket.display(), command, "control:request");
        writer
            .write_all(format!("{} {}\n", PROTOCOL_VERSION, command).as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| Error::Transport(format!("write control request: {}", e)))?;

        let mut line = String::new();
        let n = BufReader::new(stream)
            .read_line(&mut line)
            .map_err(|e| Error::Transport(format!("read control reply: {}", e)))?;
        if n == 0 {
            return Err(Error::Protocol("connection closed without a reply".into()));
        }
        let value = parse_reply(&line);
        debug!(command, ok = value.is_ok(), "control:reply");
        value
    }

    /// `config.get <key>`.
    pub fn config_get(&self, key: &str) -> Result<String> {
        self.request(&format!("config.get {}", key))
    }

    fn dial(&self) -> Result<UnixStream> {
        let (tx, rx) = mpsc::sync_channel(1);
        let socket = self.socket.clone();
        thread::spawn(move || {
            let _ = tx.send(UnixStream::connect(&socket));
        });
        match rx.recv_timeout(self.dial_timeout) {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::Transport(format!(
                "connect {}: {}",
                self.socket.display(),
                e
            ))),
            Err(_) => Err(Error::Transport(format!(
                "connect {}: timed out after {}s",
                self.socket.display(),
                self.dial_timeout.as_secs()
            ))),
        }
    }
}

/// Decode one reply line.
pub fn parse_reply(line: &str) -> Result<String> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        return Err(Error::Protocol("empty reply".into()));
    }

    let value = match line.split_once(' ') {
        Some((PROTOCOL_VERSION, rest)) => rest,
        Some((tag, _)) if is_version_tag(tag) => {
            return Err(Error::Protocol(format!(
                "unsupported protocol version '{}'",
                tag
            )));
        }
        _ if line == PROTOCOL_VERSION || is_version_tag(line) => {
            return Err(Error::Protocol(format!("reply without a value: '{}'", line)));
        }
        // Legacy unversioned reply.
        _ => line,
    };

    if let Some(message) = value.strip_prefix("error:") {
        return Err(Error::Protocol(message.trim().to_string()));
    }
    Ok(value.to_string())
}

fn is_version_tag(s: &str) -> bool {
    s.len() > 1 && s.starts_with('v') && s[1..].chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;

    #[test]
    fn versioned_reply() {
        assert_eq!(parse_reply("v1 pong\n").unwrap(), "pong");
        assert_eq!(parse_reply("v1 4\n").unwrap(), "4");
        assert_eq!(
            parse_reply("v1 /Users/me/.ssh/config\n").unwrap(),
            "/Users/me/.ssh/config"
        );
    }

    #[test]
    fn legacy_reply() {
        assert_eq!(parse_reply("pong\n").unwrap(), "pong");
        assert_eq!(parse_reply("running").unwrap(), "running");
    }

    #[test]
    fn error_reply() {
        let err = parse_reply("v1 error: unknown command\n").unwrap_err();
        assert!(err.is(ErrorKind::Protocol));
        assert!(err.to_string().contains("unknown command"));
    }

    #[test]
    fn malformed_replies() {
        for line in ["", "\n", "v1\n", "v2 pong\n", "v10\n"] {
            let err = parse_reply(line).unwrap_err();
            assert!(err.is(ErrorKind::Protocol), "{line:?}");
        }
    }

    fn serve_once(dir: &TempDir, reply: &'static str) -> (PathBuf, thread::JoinHandle<String>) {
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            let mut stream = stream;
            stream.write_all(reply.as_bytes()).unwrap();
            request
        });
        (path, handle)
    }

    #[test]
    fn request_round_trip_over_socket() {
        let dir = TempDir::new().unwrap();
        let (path, server) = serve_once(&dir, "v1 8\n");
        let client = ControlClient::new(&path);
        assert_eq!(client.config_get("cpus").unwrap(), "8");
        assert_eq!(server.join().unwrap(), "v1 config.get cpus\n");
    }

    #[test]
    fn server_error_surfaces_as_protocol() {
        let dir = TempDir::new().unwrap();
        let (path, server) = serve_once(&dir, "v1 error: unknown command: bogus\n");
        let err = ControlClient::new(&path).request("bogus").unwrap_err();
        assert!(err.is(ErrorKind::Protocol));
        server.join().unwrap();
    }

    #[test]
    fn missing_socket_is_transport() {
        let dir = TempDir::new().unwrap();
        let err = ControlClient::new(dir.path().join("nope.sock"))
            .request("status")
            .unwrap_err();
        assert!(err.is(ErrorKind::Transport));
    }
}
