//! Colima backend: a Lima-based VM started with the Incus runtime.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use super::log_format::format_tool_log_line;
use super::{Backend, IncusEndpoint, VmSpec, VmState, VmStatus};
use crate::cmd::Cmd;
use crate::error::{Error, Result, ResultExt};
use crate::platform::Platform;
use crate::spinner;

const BINARY: &str = "colima";
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One row of `colima list --json`.
#[derive(Debug, Deserialize)]
struct ColimaProfile {
    name: String,
    status: String,
    #[serde(default)]
    arch: String,
    #[serde(default)]
    cpus: u32,
    #[serde(default)]
    memory: u64,
    #[serde(default)]
    disk: u64,
    #[serde(default)]
    runtime: String,
}

fn parse_profiles(stdout: &[u8]) -> Result<Vec<ColimaProfile>> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str::<ColimaProfile>(l)
                .map_err(Error::from)
                .ctx(|| format!("failed to parse colima row: {}", l))
        })
        .collect()
}

pub struct ColimaBackend {
    spec: VmSpec,
    platform: Platform,
}

impl ColimaBackend {
    pub fn new(spec: VmSpec, platform: Platform) -> Self {
        Self { spec, platform }
    }

    fn profile(&self) -> &str {
        &self.spec.instance
    }

    fn colima_home(&self) -> Result<PathBuf> {
        match std::env::var("COLIMA_HOME") {
            Ok(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
            _ => Ok(home::home_dir()
                .ok_or_else(|| Error::not_found("home directory", "$HOME"))?
                .join(".colima")),
        }
    }

    /// Colima names the default profile's SSH host plain `colima`.
    fn ssh_host(&self) -> String {
        if self.profile() == "default" {
            "colima".to_string()
        } else {
            format!("colima-{}", self.profile())
        }
    }

    fn create_args(&self) -> Vec<String> {
        let spec = &self.spec;
        let mut args = vec![
            "start".to_string(),
            "--profile".to_string(),
            spec.instance.clone(),
            "--runtime".to_string(),
            "incus".to_string(),
            "--cpu".to_string(),
            spec.cpus.to_string(),
            "--memory".to_string(),
            spec.memory_gib.to_string(),
            "--disk".to_string(),
            spec.disk_gib.to_string(),
            "--arch".to_string(),
            spec.arch.clone(),
            "--vm-type".to_string(),
            spec.effective_vm_type(&self.platform).as_str().to_string(),
        ];
        if spec.rosetta {
            args.push("--vz-rosetta".to_string());
        }
        if spec.nested_virtualization {
            args.push("--nested-virtualization".to_string());
        }
        for server in &spec.dns {
            args.push("--dns".to_string());
            args.push(server.clone());
        }
        args
    }
}

impl Backend for ColimaBackend {
    fn name(&self) -> &'static str {
        "colima"
    }

    fn available(&self) -> bool {
        which::which(BINARY).is_ok()
    }

    fn status(&self) -> Result<VmStatus> {
        let output = Cmd::new(BINARY)
            .args(["list", "--json"])
            .timeout(LIST_TIMEOUT)
            .run()
            .ctx(|| "failed to list Colima profiles".to_string())?;
        let Some(p) = parse_profiles(&output.stdout)?
            .into_iter()
            .find(|p| p.name == self.profile())
        else {
            return Ok(VmStatus::missing(self.profile()));
        };
        Ok(VmStatus {
            state: VmState::parse(&p.status),
            cpus: p.cpus,
            memory_gib: p.memory as f64 / GIB,
            disk_gib: p.disk as f64 / GIB,
            arch: p.arch,
            runtime: p.runtime,
            name: p.name,
        })
    }

    fn start(&self) -> Result<()> {
        let state = self.status()?.state;
        if state == VmState::Running {
            return Ok(());
        }
        let cmd = if state == VmState::Missing {
            self.spec.validate(&self.platform)?;
            Cmd::new(BINARY).args(self.create_args())
        } else {
            Cmd::new(BINARY).args(["start", "--profile", self.profile()])
        };
        info!(profile = %self.profile(), create = state == VmState::Missing, "colima:start");
        spinner::with_streaming_command_formatted(
            &format!("Starting Colima profile '{}'", self.profile()),
            cmd,
            format_tool_log_line,
        )
    }

    fn stop(&self) -> Result<()> {
        match self.status()?.state {
            VmState::Missing | VmState::Stopped => Ok(()),
            _ => Cmd::new(BINARY)
                .args(["stop", "--profile", self.profile()])
                .run()
                .map(|_| ()),
        }
    }

    fn delete(&self) -> Result<()> {
        if self.status()?.state == VmState::Missing {
            return Ok(());
        }
        Cmd::new(BINARY)
            .args(["delete", "--force", "--profile", self.profile()])
            .run()
            .map(|_| ())
    }

    fn shell(&self) -> Result<i32> {
        Cmd::new(BINARY)
            .args(["ssh", "--profile", self.profile()])
            .run_interactive()
    }

    fn exec(&self, argv: &[&str]) -> Result<Vec<u8>> {
        let output = Cmd::new(BINARY)
            .args(["ssh", "--profile", self.profile(), "--"])
            .args(argv)
            .run()?;
        Ok(output.stdout)
    }

    fn incus_endpoint(&self) -> Result<IncusEndpoint> {
        Ok(IncusEndpoint::Unix(
            self.colima_home()?.join(self.profile()).join("incus.sock"),
        ))
    }

    fn ssh_proxy_args(&self) -> Vec<String> {
        match self.colima_home() {
            Ok(home) => vec![
                "-o".into(),
                format!(
                    "ProxyCommand=ssh -F {} {} -W %h:%p",
                    home.join("ssh_config").display(),
                    self.ssh_host()
                ),
            ],
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HostOs;

    const MAC: Platform = Platform {
        os: HostOs::MacOs,
        arch: "aarch64",
    };

    fn spec(instance: &str) -> VmSpec {
        VmSpec {
            instance: instance.into(),
            arch: "aarch64".into(),
            cpus: 2,
            memory_gib: 4,
            disk_gib: 60,
            dns: vec![],
            vm_type: None,
            rosetta: false,
            nested_virtualization: true,
        }
    }

    #[test]
    fn parse_profile_rows() {
        let out = br#"{"name":"coop","status":"Running","arch":"aarch64","cpus":2,"memory":4294967296,"disk":64424509440,"runtime":"incus","address":""}"#;
        let rows = parse_profiles(out).unwrap();
        assert_eq!(rows[0].runtime, "incus");
        assert_eq!(rows[0].memory as f64 / GIB, 4.0);
    }

    #[test]
    fn create_args_select_incus_runtime() {
        let args = ColimaBackend::new(spec("coop"), MAC).create_args().join(" ");
        assert!(args.starts_with("start --profile coop --runtime incus"));
        assert!(args.contains("--vm-type vz"));
        assert!(args.contains("--nested-virtualization"));
        assert!(!args.contains("--vz-rosetta"));
    }

    #[test]
    fn ssh_host_naming() {
        assert_eq!(ColimaBackend::new(spec("default"), MAC).ssh_host(), "colima");
        assert_eq!(ColimaBackend::new(spec("coop"), MAC).ssh_host(), "colima-coop");
    }
}
