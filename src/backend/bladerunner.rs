//! Bladerunner backend: a VM daemon that exposes Incus over HTTPS and is
//! controlled through a Unix-socket line protocol.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::control::ControlClient;
use super::{
    Backend, IncusEndpoint, RemoteRegistration, TlsMaterial, VmSpec, VmState, VmStatus,
    xdg_state_home,
};
use crate::cmd::Cmd;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::spinner;

const BINARY: &str = "bladerunner";
const START_WAIT: Duration = Duration::from_secs(180);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct BladerunnerBackend {
    spec: VmSpec,
    platform: Platform,
    state_dir: PathBuf,
}

impl BladerunnerBackend {
    pub fn new(spec: VmSpec, platform: Platform) -> Self {
        let root = xdg_state_home().unwrap_or_else(|| PathBuf::from(".local/state"));
        let state_dir = root.join("bladerunner").join(&spec.instance);
        Self::with_state_dir(spec, platform, state_dir)
    }

    pub fn with_state_dir(spec: VmSpec, platform: Platform, state_dir: PathBuf) -> Self {
        Self {
            spec,
            platform,
            state_dir,
        }
    }

    fn control(&self) -> ControlClient {
        ControlClient::new(self.state_dir.join("control.sock"))
    }

    fn socket_path(&self) -> PathBuf {
        self.state_dir.join("control.sock")
    }

    fn config_u32(&self, key: &str) -> u32 {
        self.control()
            .config_get(key)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    fn ssh_target(&self) -> Result<SshTarget> {
        let control = self.control();
        Ok(SshTarget {
            user: control.config_get("ssh-user")?,
            key: control.config_get("ssh-private-key-path")?,
            port: control.config_get("local-ssh-port")?,
        })
    }

    fn start_args(&self) -> Vec<String> {
        let spec = &self.spec;
        let mut args = vec![
            "start".to_string(),
            "--name".to_string(),
            spec.instance.clone(),
            "--cpus".to_string(),
            spec.cpus.to_string(),
            "--memory-gib".to_string(),
            spec.memory_gib.to_string(),
            "--disk-size-gib".to_string(),
            spec.disk_gib.to_string(),
            "--arch".to_string(),
            spec.arch.clone(),
        ];
        if spec.rosetta {
            args.push("--rosetta".to_string());
        }
        if spec.nested_virtualization {
            args.push("--nested-virt".to_string());
        }
        for server in &spec.dns {
            args.push("--dns".to_string());
            args.push(server.clone());
        }
        args
    }

    fn wait_until_running(&self) -> Result<()> {
        let started = Instant::now();
        loop {
            let status = self.status()?;
            if status.state == VmState::Running {
                return Ok(());
            }
            if started.elapsed() >= START_WAIT {
                return Err(Error::VmNotRunning {
                    name: self.spec.instance.clone(),
                    state: status.state.to_string(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

struct SshTarget {
    user: String,
    key: String,
    port: String,
}

impl SshTarget {
    fn base_args(&self) -> Vec<String> {
        vec![
            "-i".into(),
            self.key.clone(),
            "-p".into(),
            self.port.clone(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            format!("{}@127.0.0.1", self.user),
        ]
    }
}

impl Backend for BladerunnerBackend {
    fn name(&self) -> &'static str {
        "bladerunner"
    }

    fn available(&self) -> bool {
        which::which(BINARY).is_ok() || self.socket_path().exists()
    }

    fn status(&self) -> Result<VmStatus> {
        let name = &self.spec.instance;
        if !self.state_dir.exists() {
            return Ok(VmStatus::missing(name));
        }
        if !self.socket_path().exists() {
            return Ok(VmStatus::with_state(name, VmState::Stopped));
        }
        let state = match self.control().request("status") {
            Ok(value) => VmState::parse(&value),
            Err(e) if e.is(crate::error::ErrorKind::Transport) => {
                debug!(error = %e, "bladerunner:control socket not answering");
                VmState::Stopped
            }
            Err(e) => return Err(e),
        };
        if state != VmState::Running {
            return Ok(VmStatus::with_state(name, state));
        }
        let control = self.control();
        Ok(VmStatus {
            name: name.clone(),
            state,
            cpus: self.config_u32("cpus"),
            memory_gib: self.config_u32("memory-gib") as f64,
            disk_gib: self.config_u32("disk-size-gib") as f64,
            arch: control.config_get("arch").unwrap_or_default(),
            runtime: "incus".to_string(),
        })
    }

    fn start(&self) -> Result<()> {
        if self.status()?.state == VmState::Running {
            return Ok(());
        }
        self.spec.validate(&self.platform)?;
        info!(instance = %self.spec.instance, "bladerunner:start");
        spinner::with_streaming_command_formatted(
            &format!("Starting VM '{}'", self.spec.instance),
            Cmd::new(BINARY).args(self.start_args()),
            |line| Some(line.to_string()),
        )?;
        self.wait_until_running()
    }

    fn stop(&self) -> Result<()> {
        match self.status()?.state {
            VmState::Missing | VmState::Stopped => Ok(()),
            _ => self.control().request("stop").map(|_| ()),
        }
    }

    fn delete(&self) -> Result<()> {
        Err(Error::Unsupported("delete".into()))
    }

    fn shell(&self) -> Result<i32> {
        let target = self.ssh_target()?;
        Cmd::new("ssh").arg("-t").args(target.base_args()).run_interactive()
    }

    fn exec(&self, argv: &[&str]) -> Result<Vec<u8>> {
        let target = self.ssh_target()?;
        let output = Cmd::new("ssh")
            .args(target.base_args())
            .arg("--")
            .args(argv)
            .run()?;
        Ok(output.stdout)
    }

    fn incus_endpoint(&self) -> Result<IncusEndpoint> {
        let port = self.control().config_get("local-api-port")?;
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid local-api-port '{}'", port)))?;
        Ok(IncusEndpoint::Https(format!("https://127.0.0.1:{}", port)))
    }

    fn tls_material(&self) -> TlsMaterial {
        tls_material_in(&self.state_dir.join("incus"))
    }

    fn ssh_proxy_args(&self) -> Vec<String> {
        match self.ssh_target() {
            Ok(target) => {
                let hop = target.base_args().join(" ");
                vec!["-o".into(), format!("ProxyCommand=ssh {} -W %h:%p", hop)]
            }
            Err(e) => {
                warn!(error = %e, "bladerunner:ssh proxy unavailable");
                Vec::new()
            }
        }
    }

    fn use_incus_exec(&self) -> bool {
        true
    }

    fn remote_registration(&self) -> Option<RemoteRegistration> {
        let url = match self.incus_endpoint() {
            Ok(IncusEndpoint::Https(url)) => url,
            _ => return None,
        };
        Some(RemoteRegistration {
            remote_name: format!("coop-{}", self.spec.instance),
            url,
            tls: self.tls_material(),
        })
    }
}

fn tls_material_in(dir: &Path) -> TlsMaterial {
    let path = |f: &str| dir.join(f).to_string_lossy().into_owned();
    TlsMaterial {
        client_cert: path("client.crt"),
        client_key: path("client.key"),
        server_cert: path("server.crt"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HostOs;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;

    fn spec() -> VmSpec {
        VmSpec {
            instance: "coop".into(),
            arch: "aarch64".into(),
            cpus: 4,
            memory_gib: 8,
            disk_gib: 64,
            dns: vec!["1.1.1.1".into()],
            vm_type: None,
            rosetta: true,
            nested_virtualization: false,
        }
    }

    const MAC: Platform = Platform {
        os: HostOs::MacOs,
        arch: "aarch64",
    };

    /// Answer `n` control requests from a table of command -> reply.
    fn fake_daemon(dir: &Path, replies: &'static [(&'static str, &'static str)], n: usize) {
        std::fs::create_dir_all(dir).unwrap();
        let listener = UnixListener::bind(dir.join("control.sock")).unwrap();
        std::thread::spawn(move || {
            for _ in 0..n {
                let (stream, _) = listener.accept().unwrap();
                let mut line = String::new();
                BufReader::new(stream.try_clone().unwrap())
                    .read_line(&mut line)
                    .unwrap();
                let cmd = line.trim().trim_start_matches("v1 ");
                let reply = replies
                    .iter()
                    .find(|(c, _)| *c == cmd)
                    .map(|(_, r)| format!("v1 {}\n", r))
                    .unwrap_or_else(|| "v1 error: unknown command\n".to_string());
                let mut stream = stream;
                stream.write_all(reply.as_bytes()).unwrap();
            }
        });
    }

    #[test]
    fn missing_state_dir_is_missing_not_stopped() {
        let dir = TempDir::new().unwrap();
        let backend = BladerunnerBackend::with_state_dir(spec(), MAC, dir.path().join("vm"));
        assert_eq!(backend.status().unwrap().state, VmState::Missing);
        std::fs::create_dir_all(dir.path().join("vm")).unwrap();
        assert_eq!(backend.status().unwrap().state, VmState::Stopped);
    }

    #[test]
    fn running_status_reads_config() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("vm");
        fake_daemon(
            &state,
            &[
                ("status", "running"),
                ("config.get cpus", "4"),
                ("config.get memory-gib", "8"),
                ("config.get disk-size-gib", "64"),
                ("config.get arch", "aarch64"),
            ],
            5,
        );
        let backend = BladerunnerBackend::with_state_dir(spec(), MAC, state);
        let status = backend.status().unwrap();
        assert_eq!(status.state, VmState::Running);
        assert_eq!(status.cpus, 4);
        assert_eq!(status.memory_gib, 8.0);
        assert_eq!(status.arch, "aarch64");
    }

    #[test]
    fn https_endpoint_with_tls_material() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("vm");
        fake_daemon(&state, &[("config.get local-api-port", "18443")], 1);
        let backend = BladerunnerBackend::with_state_dir(spec(), MAC, state.clone());
        let endpoint = backend.incus_endpoint().unwrap();
        assert_eq!(endpoint, IncusEndpoint::Https("https://127.0.0.1:18443".into()));
        let tls = backend.tls_material();
        assert!(!tls.is_empty());
        assert!(tls.client_cert.ends_with("incus/client.crt"));
        assert!(backend.use_incus_exec());
    }

    #[test]
    fn delete_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let backend = BladerunnerBackend::with_state_dir(spec(), MAC, dir.path().into());
        assert!(
            backend
                .delete()
                .unwrap_err()
                .is(crate::error::ErrorKind::Unsupported)
        );
    }

    #[test]
    fn start_args_carry_spec() {
        let dir = TempDir::new().unwrap();
        let backend = BladerunnerBackend::with_state_dir(spec(), MAC, dir.path().into());
        let args = backend.start_args().join(" ");
        assert!(args.contains("--cpus 4"));
        assert!(args.contains("--memory-gib 8"));
        assert!(args.contains("--rosetta"));
        assert!(args.contains("--dns 1.1.1.1"));
    }
}
