//! coop-isolated SSH identity and per-container host entries.
//!
//! Everything lives under `<config>/ssh`: the ed25519 key pair, a
//! `known_hosts` file and an ssh `config` with one managed block per
//! container. Users include that config from `~/.ssh/config` if they want
//! `ssh coop-<name>` to work directly.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::cmd::Cmd;
use crate::error::Result;
use crate::fsutil;
use crate::sandbox::cloudinit::AGENT_USER;

const KEY_NAME: &str = "id_ed25519";
const HOST_PREFIX: &str = "coop-";

#[derive(Debug, Clone)]
pub struct SshKeys {
    dir: PathBuf,
}

impl SshKeys {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn private_key(&self) -> PathBuf {
        self.dir.join(KEY_NAME)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.dir.join(format!("{}.pub", KEY_NAME))
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config")
    }

    pub fn known_hosts(&self) -> PathBuf {
        self.dir.join("known_hosts")
    }

    /// Generate the key pair once with `ssh-keygen`.
    pub fn ensure_key(&self) -> Result<PathBuf> {
        let key = self.private_key();
        if key.exists() && self.public_key_path().exists() {
            return Ok(key);
        }
        fsutil::create_private_dir(&self.dir)?;
        Cmd::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", "coop"])
            .arg("-f")
            .arg(&key)
            .run()?;
        info!(key = %key.display(), "ssh:key generated");
        Ok(key)
    }

    pub fn public_key(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.public_key_path()) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn host_alias(name: &str) -> String {
        format!("{}{}", HOST_PREFIX, name)
    }

    /// Insert or replace the host block of `name`.
    pub fn upsert_host(&self, name: &str, ip: &str, proxy_args: &[String]) -> Result<()> {
        let block = self.host_block(name, ip, proxy_args);
        self.edit_config(|config| replace_block(config, name, Some(&block)))?;
        debug!(container = name, ip, "ssh:config updated");
        Ok(())
    }

    pub fn remove_host(&self, name: &str) -> Result<()> {
        if !self.config_path().exists() {
            return Ok(());
        }
        self.edit_config(|config| replace_block(config, name, None))
    }

    fn edit_config(&self, edit: impl FnOnce(&str) -> String) -> Result<()> {
        fsutil::create_private_dir(&self.dir)?;
        let path = self.config_path();
        fsutil::with_exclusive(&path, || {
            let current = match fs::read_to_string(&path) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(e.into()),
            };
            let next = edit(&current);
            if next != current {
                fsutil::write_private(&path, next.as_bytes())?;
            }
            Ok(())
        })
    }

    fn host_block(&self, name: &str, ip: &str, proxy_args: &[String]) -> String {
        let mut lines = vec![
            format!("Host {}", Self::host_alias(name)),
            format!("  HostName {}", ip),
            format!("  User {}", AGENT_USER),
            format!("  IdentityFile {}", self.private_key().display()),
            "  IdentitiesOnly yes".to_string(),
            "  StrictHostKeyChecking accept-new".to_string(),
            format!("  UserKnownHostsFile {}", self.known_hosts().display()),
        ];
        for (key, value) in option_pairs(proxy_args) {
            lines.push(format!("  {} {}", key, value));
        }
        lines.join("\n")
    }

    /// argv for an interactive session with the container at `ip`.
    pub fn ssh_args(&self, ip: &str, proxy_args: &[String]) -> Vec<String> {
        let mut args = vec![
            "ssh".to_string(),
            "-i".to_string(),
            self.private_key().display().to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", self.known_hosts().display()),
        ];
        args.extend(proxy_args.iter().cloned());
        args.push(format!("{}@{}", AGENT_USER, ip));
        args
    }

    /// One-line shell command equivalent of [`SshKeys::ssh_args`].
    pub fn ssh_command(&self, ip: &str, proxy_args: &[String]) -> String {
        self.ssh_args(ip, proxy_args)
            .iter()
            .map(|a| quote_arg(a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn begin_marker(name: &str) -> String {
    format!("# coop:begin {}", name)
}

fn end_marker(name: &str) -> String {
    format!("# coop:end {}", name)
}

/// Replace (or drop, with `None`) the managed block of `name`.
fn replace_block(config: &str, name: &str, block: Option<&str>) -> String {
    let (begin, end) = (begin_marker(name), end_marker(name));
    let wrapped = block.map(|b| format!("{}\n{}\n{}", begin, b, end));
    let mut out: Vec<&str> = Vec::new();
    let mut inside = false;
    let mut replaced = false;

    for line in config.lines() {
        if line.trim() == begin {
            inside = true;
            if let Some(w) = &wrapped
                && !replaced
            {
                out.extend(w.lines());
                replaced = true;
            }
            continue;
        }
        if inside {
            if line.trim() == end {
                inside = false;
            }
            continue;
        }
        out.push(line);
    }
    if let (Some(w), false) = (&wrapped, replaced) {
        if out.last().is_some_and(|l| !l.trim().is_empty()) {
            out.push("");
        }
        out.extend(w.lines());
    }
    let mut text = out.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

/// `-o Key=Value` and `-J host` pairs as ssh_config keywords.
fn option_pairs(args: &[String]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-o" => {
                if let Some((k, v)) = iter.next().and_then(|o| o.split_once('=')) {
                    pairs.push((k.to_string(), v.to_string()));
                }
            }
            "-J" => {
                if let Some(host) = iter.next() {
                    pairs.push(("ProxyJump".to_string(), host.clone()));
                }
            }
            _ => {}
        }
    }
    pairs
}

fn quote_arg(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=@:%+,".contains(c))
    {
        arg.to_string()
    } else {
        crate::sandbox::cloudinit::shell_quote(arg)
    }
}
