//! Remote backend: a pre-provisioned Incus server reached over HTTPS.
//! There is no VM to manage; only reachability is observable.

use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use super::{Backend, IncusEndpoint, RemoteRegistration, TlsMaterial, VmState, VmStatus};
use crate::config::RemoteSettings;
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_PORT: u16 = 8443;
pub const REMOTE_NAME: &str = "coop-remote";

pub struct RemoteBackend {
    settings: RemoteSettings,
}

impl RemoteBackend {
    pub fn new(settings: RemoteSettings) -> Self {
        Self { settings }
    }

    fn url(&self) -> Result<url::Url> {
        let raw = self
            .settings
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::not_found("remote", "vm.remote.url"))?;
        let parsed = url::Url::parse(raw)
            .map_err(|e| Error::Protocol(format!("invalid remote url '{}': {}", raw, e)))?;
        if parsed.scheme() != "https" {
            return Err(Error::Unsupported(format!(
                "remote scheme '{}' (only https)",
                parsed.scheme()
            )));
        }
        Ok(parsed)
    }

    fn reachable(&self) -> bool {
        let Ok(url) = self.url() else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let Ok(mut addrs) = (host, port).to_socket_addrs() else {
            return false;
        };
        addrs.any(|addr| TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok())
    }
}

fn file_present(path: Option<&Path>) -> bool {
    path.is_some_and(|p| p.is_file())
}

impl Backend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn available(&self) -> bool {
        self.url().is_ok()
            && file_present(self.settings.client_cert.as_deref())
            && file_present(self.settings.client_key.as_deref())
    }

    fn status(&self) -> Result<VmStatus> {
        let url = self.url()?;
        let state = if self.reachable() {
            VmState::Running
        } else {
            debug!(url = %url, "remote:unreachable");
            VmState::Unknown
        };
        Ok(VmStatus {
            runtime: "incus".to_string(),
            ..VmStatus::with_state(url.host_str().unwrap_or("remote"), state)
        })
    }

    fn start(&self) -> Result<()> {
        let status = self.status()?;
        if status.state == VmState::Running {
            return Ok(());
        }
        Err(Error::VmNotRunning {
            name: status.name,
            state: status.state.to_string(),
        })
    }

    fn stop(&self) -> Result<()> {
        Err(Error::Unsupported("stop".into()))
    }

    fn delete(&self) -> Result<()> {
        Err(Error::Unsupported("delete".into()))
    }

    fn shell(&self) -> Result<i32> {
        Err(Error::Unsupported("shell".into()))
    }

    fn exec(&self, _argv: &[&str]) -> Result<Vec<u8>> {
        Err(Error::Unsupported("exec".into()))
    }

    fn incus_endpoint(&self) -> Result<IncusEndpoint> {
        let url = self.url()?;
        Ok(IncusEndpoint::Https(url.as_str().trim_end_matches('/').to_string()))
    }

    fn tls_material(&self) -> TlsMaterial {
        let path = |p: &Option<std::path::PathBuf>| {
            p.as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        TlsMaterial {
            client_cert: path(&self.settings.client_cert),
            client_key: path(&self.settings.client_key),
            server_cert: path(&self.settings.server_cert),
        }
    }

    fn use_incus_exec(&self) -> bool {
        true
    }

    fn remote_registration(&self) -> Option<RemoteRegistration> {
        let IncusEndpoint::Https(url) = self.incus_endpoint().ok()? else {
            return None;
        };
        Some(RemoteRegistration {
            remote_name: REMOTE_NAME.to_string(),
            url,
            tls: self.tls_material(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn settings(url: &str, dir: &TempDir) -> RemoteSettings {
        let cert = dir.path().join("client.crt");
        let key = dir.path().join("client.key");
        std::fs::write(&cert, "cert").unwrap();
        std::fs::write(&key, "key").unwrap();
        RemoteSettings {
            url: Some(url.to_string()),
            client_cert: Some(cert),
            client_key: Some(key),
            server_cert: None,
        }
    }

    #[test]
    fn available_requires_url_and_client_cert() {
        let dir = TempDir::new().unwrap();
        assert!(RemoteBackend::new(settings("https://10.0.0.5:8443", &dir)).available());
        assert!(!RemoteBackend::new(RemoteSettings::default()).available());

        let mut missing_key = settings("https://10.0.0.5:8443", &dir);
        missing_key.client_key = Some(dir.path().join("absent.key"));
        assert!(!RemoteBackend::new(missing_key).available());
    }

    #[test]
    fn endpoint_is_https_with_tls() {
        let dir = TempDir::new().unwrap();
        let backend = RemoteBackend::new(settings("https://incus.lan:8443/", &dir));
        assert_eq!(
            backend.incus_endpoint().unwrap(),
            IncusEndpoint::Https("https://incus.lan:8443".into())
        );
        assert!(!backend.tls_material().is_empty());
        assert_eq!(
            backend.remote_registration().unwrap().remote_name,
            REMOTE_NAME
        );
    }

    #[test]
    fn plain_http_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = RemoteBackend::new(settings("http://incus.lan", &dir))
            .incus_endpoint()
            .unwrap_err();
        assert!(err.is(ErrorKind::Unsupported));
    }

    #[test]
    fn status_reflects_reachability() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = TempDir::new().unwrap();
        let backend = RemoteBackend::new(settings(&format!("https://127.0.0.1:{}", port), &dir));
        assert_eq!(backend.status().unwrap().state, VmState::Running);
        assert!(backend.start().is_ok());
        drop(listener);
    }

    #[test]
    fn lifecycle_is_unsupported() {
        let backend = RemoteBackend::new(RemoteSettings::default());
        assert!(backend.stop().unwrap_err().is(ErrorKind::Unsupported));
        assert!(backend.delete().unwrap_err().is(ErrorKind::Unsupported));
        assert!(backend.exec(&["true"]).unwrap_err().is(ErrorKind::Unsupported));
    }
}
