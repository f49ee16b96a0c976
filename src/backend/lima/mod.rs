//! Lima backend: an Ubuntu VM managed by `limactl` with Incus installed at
//! first boot and its socket forwarded to the host.

mod config;

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use super::log_format::format_tool_log_line;
use super::{Backend, IncusEndpoint, VmSpec, VmState, VmStatus};
use crate::cmd::Cmd;
use crate::error::{Error, Result, ResultExt};
use crate::platform::Platform;
use crate::spinner;

pub use config::generate_lima_config;

const BINARY: &str = "limactl";
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One row of `limactl list --json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimaInstanceInfo {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub vm_type: Option<String>,
}

/// Parse NDJSON output from `limactl list --json` (one JSON object per line).
pub fn parse_lima_instances(stdout: &[u8]) -> Result<Vec<LimaInstanceInfo>> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str::<LimaInstanceInfo>(l)
                .map_err(Error::from)
                .ctx(|| format!("failed to parse limactl row: {}", l))
        })
        .collect()
}

pub struct LimaBackend {
    spec: VmSpec,
    platform: Platform,
    cache_dir: PathBuf,
}

impl LimaBackend {
    /// `cache_dir` receives the generated VM config before creation.
    pub fn new(spec: VmSpec, platform: Platform, cache_dir: PathBuf) -> Self {
        Self {
            spec,
            platform,
            cache_dir,
        }
    }

    fn instance(&self) -> Result<Option<LimaInstanceInfo>> {
        let output = Cmd::new(BINARY)
            .args(["list", "--json"])
            .timeout(LIST_TIMEOUT)
            .run()
            .ctx(|| "failed to list Lima instances".to_string())?;
        Ok(parse_lima_instances(&output.stdout)?
            .into_iter()
            .find(|i| i.name == self.spec.instance))
    }

    fn instance_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = self.instance()?.and_then(|i| i.dir) {
            return Ok(PathBuf::from(dir));
        }
        let lima_home = match std::env::var("LIMA_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => home::home_dir()
                .ok_or_else(|| Error::not_found("home directory", "$HOME"))?
                .join(".lima"),
        };
        Ok(lima_home.join(&self.spec.instance))
    }

    fn create(&self) -> Result<()> {
        let vm_type = self.spec.effective_vm_type(&self.platform);
        let yaml = generate_lima_config(&self.spec, vm_type)?;
        crate::fsutil::create_private_dir(&self.cache_dir)?;
        let path = self
            .cache_dir
            .join(format!("lima-{}.yaml", self.spec.instance));
        crate::fsutil::write_private(&path, yaml.as_bytes())?;
        debug!(path = %path.display(), "lima:config written");

        spinner::with_streaming_command_formatted(
            &format!("Creating Lima VM '{}'", self.spec.instance),
            Cmd::new(BINARY)
                .args(["create", "--name", &self.spec.instance, "--tty=false"])
                .arg(&path),
            format_tool_log_line,
        )
    }
}

impl Backend for LimaBackend {
    fn name(&self) -> &'static str {
        "lima"
    }

    fn available(&self) -> bool {
        which::which(BINARY).is_ok()
    }

    fn status(&self) -> Result<VmStatus> {
        let Some(info) = self.instance()? else {
            return Ok(VmStatus::missing(&self.spec.instance));
        };
        Ok(VmStatus {
            state: VmState::parse(&info.status),
            cpus: info.cpus.unwrap_or(0),
            memory_gib: info.memory.unwrap_or(0) as f64 / GIB,
            disk_gib: info.disk.unwrap_or(0) as f64 / GIB,
            arch: info.arch.unwrap_or_default(),
            runtime: "incus".to_string(),
            name: info.name,
        })
    }

    fn start(&self) -> Result<()> {
        let state = self.status()?.state;
        if state == VmState::Running {
            return Ok(());
        }
        self.spec.validate(&self.platform)?;
        if state == VmState::Missing {
            self.create()?;
        }
        info!(instance = %self.spec.instance, "lima:start");
        spinner::with_streaming_command_formatted(
            &format!(
                "Starting Lima VM '{}' (first boot takes a few minutes)",
                self.spec.instance
            ),
            Cmd::new(BINARY).args(["start", "--tty=false", &self.spec.instance]),
            format_tool_log_line,
        )
    }

    fn stop(&self) -> Result<()> {
        match self.status()?.state {
            VmState::Missing | VmState::Stopped => Ok(()),
            _ => Cmd::new(BINARY)
                .args(["stop", &self.spec.instance])
                .timeout(STOP_TIMEOUT)
                .run()
                .map(|_| ()),
        }
    }

    fn delete(&self) -> Result<()> {
        if self.status()?.state == VmState::Missing {
            return Ok(());
        }
        Cmd::new(BINARY)
            .args(["delete", "--force", &self.spec.instance])
            .run()
            .map(|_| ())
    }

    fn shell(&self) -> Result<i32> {
        Cmd::new(BINARY)
            .args(["shell", &self.spec.instance])
            .run_interactive()
    }

    fn exec(&self, argv: &[&str]) -> Result<Vec<u8>> {
        let output = Cmd::new(BINARY)
            .args(["shell", &self.spec.instance, "--"])
            .args(argv)
            .run()?;
        Ok(output.stdout)
    }

    fn incus_endpoint(&self) -> Result<IncusEndpoint> {
        Ok(IncusEndpoint::Unix(
            self.instance_dir()?.join(config::INCUS_HOST_SOCKET),
        ))
    }

    fn ssh_proxy_args(&self) -> Vec<String> {
        match self.instance_dir() {
            Ok(dir) => vec![
                "-o".into(),
                format!(
                    "ProxyCommand=ssh -F {} lima-{} -W %h:%p",
                    dir.join("ssh.config").display(),
                    self.spec.instance
                ),
            ],
            Err(_) => Vec::new(),
        }
    }
}
