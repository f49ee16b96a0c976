//! Typed client for the Incus REST API.
//!
//! Every mutating call is an Incus operation; the client blocks on
//! `/1.0/operations/<id>/wait` until it finishes. Status codes map onto the
//! crate error kinds: 404 is `NotFound`, 409 is `AlreadyExists`, 412 is
//! `PreconditionFailed`.

mod http;
mod tls;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::backend::{IncusEndpoint, TlsMaterial};
use crate::cmd::Cmd;
use crate::error::{Error, ErrorKind, Result, ResultExt};
use http::{DEFAULT_READ_TIMEOUT, HttpClient, Response, Transport};
pub use types::*;

/// Seconds the server holds an operation wait open before we re-poll.
const OPERATION_WAIT_SECS: u64 = 300;
const STATE_CHANGE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HTTPS_PORT: u16 = 8443;

#[derive(Debug, Clone)]
pub struct IncusClient {
    http: HttpClient,
    endpoint: IncusEndpoint,
    /// `incus` CLI remote that points at the same daemon, for streaming exec.
    cli_remote: Option<String>,
}

/// Mutable part of an instance, as accepted by `PUT /1.0/instances/<name>`.
#[derive(Debug, Serialize)]
struct InstancePut<'a> {
    config: &'a BTreeMap<String, String>,
    devices: &'a BTreeMap<String, Device>,
    profiles: &'a [String],
    description: &'a str,
}

impl IncusClient {
    pub fn connect(
        endpoint: &IncusEndpoint,
        material: &TlsMaterial,
        cli_remote: Option<String>,
    ) -> Result<Self> {
        let transport = match endpoint {
            IncusEndpoint::Unix(path) => Transport::Unix(path.clone()),
            IncusEndpoint::Https(raw) => {
                if material.is_empty() {
                    return Err(Error::Protocol(format!(
                        "HTTPS endpoint {} needs a client certificate",
                        raw
                    )));
                }
                let url = url::Url::parse(raw)
                    .map_err(|e| Error::Protocol(format!("invalid Incus URL '{}': {}", raw, e)))?;
                let host = url
                    .host_str()
                    .ok_or_else(|| Error::Protocol(format!("Incus URL without host: {}", raw)))?;
                let base = format!(
                    "{}://{}:{}",
                    url.scheme(),
                    host,
                    url.port().unwrap_or(DEFAULT_HTTPS_PORT)
                );
                Transport::https(&base, tls::client_config(material)?)?
            }
        };
        debug!(endpoint = %endpoint, "incus:connect");
        Ok(Self {
            http: HttpClient::new(transport),
            endpoint: endpoint.clone(),
            cli_remote,
        })
    }

    pub fn unix(path: impl Into<std::path::PathBuf>) -> Self {
        let path = path.into();
        Self {
            http: HttpClient::new(Transport::Unix(path.clone())),
            endpoint: IncusEndpoint::Unix(path),
            cli_remote: None,
        }
    }

    pub fn endpoint(&self) -> &IncusEndpoint {
        &self.endpoint
    }

    // ---- transport helpers ----

    fn send(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<(Envelope, Response)> {
        let bytes = body.map(serde_json::to_vec).transpose()?;
        let response = self
            .http
            .request(method, path, bytes.as_deref(), headers, timeout)?;
        let envelope: Envelope = serde_json::from_slice(&response.body).map_err(|e| {
            Error::Protocol(format!(
                "{} {}: invalid response (HTTP {}): {}",
                method, path, response.status, e
            ))
        })?;
        if envelope.kind == "error" || response.status >= 400 {
            let code = if envelope.error_code != 0 {
                envelope.error_code
            } else {
                response.status
            };
            return Err(api_error(path, code, &envelope.error));
        }
        Ok((envelope, response))
    }

    /// Synchronous request; returns the metadata.
    fn call(&self, method: &str, path: &str, body: Option<&Value>) -> Result<Value> {
        let (envelope, _) = self.send(method, path, body, &[], DEFAULT_READ_TIMEOUT)?;
        if envelope.kind == "async" {
            return self
                .wait_operation(path, &envelope)
                .map(|op| op.metadata.unwrap_or_default());
        }
        Ok(envelope.metadata)
    }

    fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let metadata = self.call("GET", path, None)?;
        serde_json::from_value(metadata)
            .map_err(|e| Error::Protocol(format!("GET {}: unexpected payload: {}", path, e)))
    }

    /// GET returning the payload and its ETag.
    fn get_with_etag<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<(T, String)> {
        let (envelope, response) = self.send("GET", path, None, &[], DEFAULT_READ_TIMEOUT)?;
        let etag = response.header("ETag").unwrap_or_default().to_string();
        let value = serde_json::from_value(envelope.metadata)
            .map_err(|e| Error::Protocol(format!("GET {}: unexpected payload: {}", path, e)))?;
        Ok((value, etag))
    }

    /// Mutating request that is expected to return an operation.
    fn run_operation(&self, method: &str, path: &str, body: Option<&Value>) -> Result<Operation> {
        let (envelope, _) = self.send(method, path, body, &[], DEFAULT_READ_TIMEOUT)?;
        if envelope.kind != "async" {
            return Ok(Operation {
                id: String::new(),
                status: "Success".into(),
                status_code: 200,
                err: String::new(),
                metadata: Some(envelope.metadata),
            });
        }
        self.wait_operation(path, &envelope)
    }

    /// Block until the operation started by a request to `origin` finishes.
    fn wait_operation(&self, origin: &str, envelope: &Envelope) -> Result<Operation> {
        let id = envelope
            .operation
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .or_else(|| envelope.metadata.get("id").and_then(Value::as_str))
            .ok_or_else(|| Error::Protocol("async response without an operation".into()))?
            .to_string();
        loop {
            let path = format!("/1.0/operations/{}/wait?timeout={}", id, OPERATION_WAIT_SECS);
            let timeout = Duration::from_secs(OPERATION_WAIT_SECS + 10);
            let (envelope, _) = self.send("GET", &path, None, &[], timeout)?;
            let op: Operation = serde_json::from_value(envelope.metadata)
                .map_err(|e| Error::Protocol(format!("operation {}: {}", id, e)))?;
            match op.status_code {
                200 => return Ok(op),
                // Still running after the server-side wait expired.
                100..=199 => continue,
                code => {
                    let message = if op.err.is_empty() {
                        format!("operation {} ended with status {}", id, op.status)
                    } else {
                        op.err.clone()
                    };
                    return Err(operation_error(origin, code, &message));
                }
            }
        }
    }

    // ---- instances ----

    pub fn create_container(
        &self,
        name: &str,
        source: &ImageSource,
        config: &BTreeMap<String, String>,
        profiles: &[String],
        devices: &BTreeMap<String, Device>,
    ) -> Result<()> {
        info!(container = name, source = ?source, "incus:create");
        let body = json!({
            "name": name,
            "type": "container",
            "source": source.to_json(),
            "config": config,
            "profiles": profiles,
            "devices": devices,
        });
        match self.run_operation("POST", "/1.0/instances", Some(&body)) {
            Err(e) if e.is(ErrorKind::AlreadyExists) => Err(Error::AlreadyExists {
                what: "container",
                name: name.to_string(),
            }),
            // The only thing a create can fail to find is its source image.
            Err(e) if e.is(ErrorKind::NotFound) => Err(Error::not_found(
                "image",
                source.display_ref(),
            )
            .context(format!("create container {}", name))),
            other => other.map(|_| ()).ctx(|| format!("create container {}", name)),
        }
    }

    fn change_state(&self, name: &str, action: &str, force: bool) -> Result<()> {
        debug!(container = name, action, force, "incus:state");
        let body = json!({
            "action": action,
            "timeout": STATE_CHANGE_TIMEOUT_SECS,
            "force": force,
        });
        self.run_operation("PUT", &format!("/1.0/instances/{}/state", name), Some(&body))?;
        Ok(())
    }

    pub fn start_container(&self, name: &str) -> Result<()> {
        self.change_state(name, "start", false)
    }

    pub fn stop_container(&self, name: &str, force: bool) -> Result<()> {
        self.change_state(name, "stop", force)
    }

    pub fn freeze_container(&self, name: &str) -> Result<()> {
        self.change_state(name, "freeze", false)
    }

    pub fn unfreeze_container(&self, name: &str) -> Result<()> {
        self.change_state(name, "unfreeze", false)
    }

    pub fn delete_container(&self, name: &str, force: bool) -> Result<()> {
        if force && self.get_container(name)?.status() != ContainerStatus::Stopped {
            self.stop_container(name, true)?;
        }
        info!(container = name, "incus:delete");
        self.run_operation("DELETE", &format!("/1.0/instances/{}", name), None)?;
        Ok(())
    }

    pub fn get_container(&self, name: &str) -> Result<Instance> {
        self.get(&format!("/1.0/instances/{}", name))
    }

    pub fn get_state(&self, name: &str) -> Result<InstanceState> {
        self.get(&format!("/1.0/instances/{}/state", name))
    }

    /// All containers whose name starts with `prefix`, sorted by name.
    pub fn list_containers(&self, prefix: &str) -> Result<Vec<Instance>> {
        let mut all: Vec<Instance> = self.get("/1.0/instances?recursion=2")?;
        all.retain(|i| i.name.starts_with(prefix));
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    pub fn get_container_ipv4(&self, name: &str) -> Result<Option<String>> {
        Ok(self.get_state(name)?.first_global("inet"))
    }

    /// Poll until `condition` holds, failing with `Timeout` after `timeout`.
    pub fn wait_for_condition(
        &self,
        name: &str,
        condition: Condition,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            let state = self.get_state(name)?;
            let met = match condition {
                Condition::Running => state.status == "Running",
                Condition::Stopped => state.status == "Stopped",
                Condition::HasIpv4 => state.first_global("inet").is_some(),
                Condition::HasIpv6 => state.first_global("inet6").is_some(),
                Condition::HasIp => {
                    state.first_global("inet").is_some() || state.first_global("inet6").is_some()
                }
            };
            if met {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(Error::Timeout {
                    what: format!("{} on {}", condition, name),
                    secs: timeout.as_secs(),
                });
            }
            std::thread::sleep(interval);
        }
    }

    // ---- exec ----

    /// Run a command and capture its output via the recorded-output logs.
    pub fn exec_output(
        &self,
        name: &str,
        argv: &[&str],
        env: &BTreeMap<String, String>,
    ) -> Result<ExecOutput> {
        debug!(container = name, command = ?argv, "incus:exec");
        let body = json!({
            "command": argv,
            "environment": env,
            "wait-for-websocket": false,
            "interactive": false,
            "record-output": true,
        });
        let op = self.run_operation("POST", &format!("/1.0/instances/{}/exec", name), Some(&body))?;
        let metadata = op.metadata.unwrap_or_default();
        let exit_code = metadata
            .get("return")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Protocol("exec result without a return code".into()))?
            as i32;
        let output = metadata.get("output").cloned().unwrap_or_default();
        let stdout = self.fetch_exec_log(&output, "1")?;
        let stderr = self.fetch_exec_log(&output, "2")?;
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    fn fetch_exec_log(&self, output: &Value, fd: &str) -> Result<String> {
        let Some(path) = output.get(fd).and_then(Value::as_str) else {
            return Ok(String::new());
        };
        let response = self
            .http
            .request("GET", path, None, &[], DEFAULT_READ_TIMEOUT)?;
        if response.status >= 400 {
            return Err(api_error(path, response.status, "exec log unavailable"));
        }
        if let Err(e) = self.http.request("DELETE", path, None, &[], DEFAULT_READ_TIMEOUT) {
            debug!(path, error = %e, "incus:exec log cleanup failed");
        }
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }

    /// Stdout of a command that must exit 0.
    pub fn exec_capture(&self, name: &str, argv: &[&str]) -> Result<String> {
        let out = self.exec_output(name, argv, &BTreeMap::new())?;
        if out.exit_code != 0 {
            return Err(Error::Transport(format!(
                "`{}` in {} exited with {}: {}",
                argv.join(" "),
                name,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    /// Attach the caller's terminal to a command in the container via the
    /// `incus` CLI and return its exit code.
    pub fn exec(&self, name: &str, argv: &[&str], env: &BTreeMap<String, String>) -> Result<i32> {
        self.exec_cli(name, argv, env).run_interactive()
    }

    fn exec_cli(&self, name: &str, argv: &[&str], env: &BTreeMap<String, String>) -> Cmd {
        let target = match &self.cli_remote {
            Some(remote) => format!("{}:{}", remote, name),
            None => name.to_string(),
        };
        let mut cmd = Cmd::new("incus").args(["exec", &target]);
        for (k, v) in env {
            cmd = cmd.arg("--env").arg(format!("{}={}", k, v));
        }
        cmd = cmd.arg("--").args(argv);
        if let (IncusEndpoint::Unix(socket), None) = (&self.endpoint, &self.cli_remote) {
            cmd = cmd.env("INCUS_SOCKET", socket);
        }
        cmd
    }

    /// Contents of a file inside the container.
    pub fn pull_file(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let query: String = url::form_urlencoded::byte_serialize(path.as_bytes()).collect();
        let api_path = format!("/1.0/instances/{}/files?path={}", name, query);
        let response = self
            .http
            .request("GET", &api_path, None, &[], DEFAULT_READ_TIMEOUT)?;
        match response.status {
            200 => Ok(response.body),
            404 => Err(Error::not_found("file", format!("{}:{}", name, path))),
            code => Err(api_error(&api_path, code, &String::from_utf8_lossy(&response.body))),
        }
    }

    // ---- snapshots ----

    pub fn create_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        info!(container = name, snapshot, "incus:snapshot");
        let body = json!({"name": snapshot, "stateful": false});
        self.run_operation("POST", &format!("/1.0/instances/{}/snapshots", name), Some(&body))?;
        Ok(())
    }

    /// Snapshots ordered by creation time.
    pub fn list_snapshots(&self, name: &str) -> Result<Vec<Snapshot>> {
        let mut snaps: Vec<Snapshot> =
            self.get(&format!("/1.0/instances/{}/snapshots?recursion=1", name))?;
        for snap in &mut snaps {
            if let Some((_, short)) = snap.name.rsplit_once('/') {
                snap.name = short.to_string();
            }
        }
        snaps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(snaps)
    }

    pub fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        self.run_operation(
            "DELETE",
            &format!("/1.0/instances/{}/snapshots/{}", name, snapshot),
            None,
        )?;
        Ok(())
    }

    pub fn restore_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        // Surface a missing snapshot as NotFound instead of a generic failure.
        self.call(
            "GET",
            &format!("/1.0/instances/{}/snapshots/{}", name, snapshot),
            None,
        )?;
        info!(container = name, snapshot, "incus:restore");
        let body = json!({"restore": snapshot});
        self.run_operation("PUT", &format!("/1.0/instances/{}", name), Some(&body))?;
        Ok(())
    }

    // ---- images ----

    /// Publish a snapshot as a local image and alias it. Returns the
    /// fingerprint. If aliasing fails the image is kept and the error names
    /// its fingerprint.
    pub fn publish_snapshot(&self, container: &str, snapshot: &str, alias: &str) -> Result<String> {
        let source = format!("{}/{}", container, snapshot);
        info!(source = %source, alias, "incus:publish");
        let body = json!({
            "source": {"type": "snapshot", "name": source},
            "properties": {"user.coop": "true", "user.coop.source": source},
            "public": false,
        });
        let op = self.run_operation("POST", "/1.0/images", Some(&body))?;
        let fingerprint = op
            .metadata
            .as_ref()
            .and_then(|m| m.get("fingerprint"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("publish result without a fingerprint".into()))?
            .to_string();

        let alias_body = json!({"name": alias, "target": fingerprint, "description": source});
        if let Err(mut e) = self.call("POST", "/1.0/images/aliases", Some(&alias_body)) {
            if e.is(ErrorKind::AlreadyExists) {
                e = Error::AlreadyExists {
                    what: "image alias",
                    name: alias.to_string(),
                };
            }
            warn!(fingerprint = %fingerprint, alias, error = %e, "incus:alias failed, image kept");
            return Err(e.context(format!(
                "image {} published but alias '{}' could not be created",
                fingerprint, alias
            )));
        }
        Ok(fingerprint)
    }

    pub fn image_exists(&self, alias: &str) -> Result<bool> {
        match self.call("GET", &format!("/1.0/images/aliases/{}", alias), None) {
            Ok(_) => Ok(true),
            Err(e) if e.is(ErrorKind::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn list_images(&self) -> Result<Vec<Image>> {
        self.get("/1.0/images?recursion=1")
    }

    pub fn delete_image_alias(&self, alias: &str) -> Result<()> {
        self.call("DELETE", &format!("/1.0/images/aliases/{}", alias), None)?;
        Ok(())
    }

    pub fn delete_image(&self, fingerprint: &str) -> Result<()> {
        self.run_operation("DELETE", &format!("/1.0/images/{}", fingerprint), None)?;
        Ok(())
    }

    // ---- devices ----

    /// Devices defined on the container itself (not inherited from profiles).
    pub fn list_devices(&self, name: &str) -> Result<BTreeMap<String, Device>> {
        Ok(self.get_container(name)?.devices)
    }

    pub fn add_device(&self, name: &str, device_name: &str, device: Device) -> Result<()> {
        self.update_devices(name, |devices| {
            if devices.contains_key(device_name) {
                return Err(Error::AlreadyExists {
                    what: "device",
                    name: format!("{}/{}", name, device_name),
                });
            }
            devices.insert(device_name.to_string(), device.clone());
            Ok(())
        })
    }

    pub fn remove_device(&self, name: &str, device_name: &str) -> Result<()> {
        self.update_devices(name, |devices| {
            devices
                .remove(device_name)
                .map(|_| ())
                .ok_or_else(|| Error::not_found("device", format!("{}/{}", name, device_name)))
        })
    }

    /// Read-modify-write of the device map guarded by the ETag. A lost race
    /// is retried once.
    fn update_devices(
        &self,
        name: &str,
        mutate: impl Fn(&mut BTreeMap<String, Device>) -> Result<()>,
    ) -> Result<()> {
        let path = format!("/1.0/instances/{}", name);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (mut instance, etag) = self.get_with_etag::<Instance>(&path)?;
            mutate(&mut instance.devices)?;
            let body = serde_json::to_value(InstancePut {
                config: &instance.config,
                devices: &instance.devices,
                profiles: &instance.profiles,
                description: &instance.description,
            })?;
            match self.put_if_match(&path, &body, &etag) {
                Err(e) if attempt == 1 && e.is(ErrorKind::PreconditionFailed) => {
                    debug!(container = name, "incus:device update raced, retrying");
                    continue;
                }
                other => return other,
            }
        }
    }

    fn put_if_match(&self, path: &str, body: &Value, etag: &str) -> Result<()> {
        let headers: Vec<(&str, &str)> = if etag.is_empty() {
            Vec::new()
        } else {
            vec![("If-Match", etag)]
        };
        let (envelope, _) = self.send("PUT", path, Some(body), &headers, DEFAULT_READ_TIMEOUT)?;
        if envelope.kind == "async" {
            self.wait_operation(path, &envelope)?;
        }
        Ok(())
    }

    // ---- profiles & storage ----

    /// Create the profile, or overwrite its config and devices if it exists.
    pub fn ensure_profile(
        &self,
        name: &str,
        config: &BTreeMap<String, String>,
        devices: &BTreeMap<String, Device>,
    ) -> Result<()> {
        let body = json!({
            "name": name,
            "description": "coop agent sandbox",
            "config": config,
            "devices": devices,
        });
        match self.call("POST", "/1.0/profiles", Some(&body)) {
            Ok(_) => {
                info!(profile = name, "incus:profile created");
                return Ok(());
            }
            Err(e) if e.is(ErrorKind::AlreadyExists) => {}
            Err(e) => return Err(e),
        }
        let path = format!("/1.0/profiles/{}", name);
        let (mut profile, etag) = self.get_with_etag::<Profile>(&path)?;
        if &profile.config == config && &profile.devices == devices {
            return Ok(());
        }
        profile.config = config.clone();
        profile.devices = devices.clone();
        let body = json!({
            "description": profile.description,
            "config": profile.config,
            "devices": profile.devices,
        });
        debug!(profile = name, "incus:profile updated");
        self.put_if_match(&path, &body, &etag)
    }

    pub fn get_profile(&self, name: &str) -> Result<Profile> {
        self.get(&format!("/1.0/profiles/{}", name))
    }

    pub fn storage_pool_resources(&self, pool: &str) -> Result<StoragePoolResources> {
        self.get(&format!("/1.0/storage-pools/{}/resources", pool))
    }

    /// Cheap connectivity check: `GET /1.0`.
    pub fn server_info(&self) -> Result<Value> {
        self.call("GET", "/1.0", None)
    }
}

/// Derive a resource description from an API path for error messages.
fn resource_of(path: &str) -> (&'static str, String) {
    let path = path.split('?').next().unwrap_or(path);
    let parts: Vec<&str> = path.trim_start_matches("/1.0/").split('/').collect();
    match parts.as_slice() {
        ["instances", name, "snapshots", snap, ..] => ("snapshot", format!("{}/{}", name, snap)),
        ["instances", name, ..] => ("container", name.to_string()),
        ["images", "aliases", alias, ..] => ("image alias", alias.to_string()),
        ["images", fp, ..] => ("image", fp.to_string()),
        ["profiles", name, ..] => ("profile", name.to_string()),
        ["storage-pools", name, ..] => ("storage pool", name.to_string()),
        ["operations", id, ..] => ("operation", id.to_string()),
        _ => ("resource", path.to_string()),
    }
}

fn api_error(path: &str, code: u16, message: &str) -> Error {
    let (what, name) = resource_of(path);
    match code {
        404 => Error::NotFound { what, name },
        409 => Error::AlreadyExists { what, name },
        412 => Error::PreconditionFailed { what, name },
        _ if message.is_empty() => Error::Transport(format!("{} {}: HTTP {}", what, name, code)),
        _ => Error::Transport(message.to_string()),
    }
}

/// Failed operations carry a generic 400 status; the daemon's message is
/// the only hint that the missing piece was a referenced resource.
fn operation_error(origin: &str, code: u16, message: &str) -> Error {
    if message.to_ascii_lowercase().contains("not found") {
        let (what, name) = resource_of(origin);
        return Error::NotFound { what, name };
    }
    api_error(origin, code, message)
}
