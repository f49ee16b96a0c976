//! In-process fake of the Incus API over a Unix socket, for tests.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tempfile::TempDir;

use super::IncusClient;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or_default()
    }

    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    fn query(&self, key: &str) -> Option<String> {
        let (_, query) = self.path.split_once('?')?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    pub fn sync(metadata: Value) -> Self {
        Self::json(
            200,
            json!({"type": "sync", "status": "Success", "status_code": 200, "metadata": metadata}),
        )
    }

    pub fn async_operation(id: &str) -> Self {
        Self::json(
            202,
            json!({
                "type": "async",
                "status": "Operation created",
                "status_code": 100,
                "operation": format!("/1.0/operations/{}", id),
                "metadata": {"id": id},
            }),
        )
    }

    pub fn operation_done(id: &str, metadata: Value) -> Self {
        Self::sync(json!({
            "id": id, "status": "Success", "status_code": 200, "err": "", "metadata": metadata,
        }))
    }

    pub fn operation_failed(id: &str, err: &str) -> Self {
        Self::sync(json!({
            "id": id, "status": "Failure", "status_code": 400, "err": err, "metadata": null,
        }))
    }

    pub fn error(code: u16, message: &str) -> Self {
        Self::json(
            code,
            json!({"type": "error", "error": message, "error_code": code, "metadata": null}),
        )
    }

    pub fn raw(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: serde_json::to_vec(&value).unwrap(),
        }
    }

    fn with_etag(mut self, etag: &str) -> Self {
        self.headers.push(("ETag".into(), etag.into()));
        self
    }
}

type Handler = dyn Fn(&Recorded) -> Reply + Send + Sync;
type ExecFn = dyn Fn(&[String]) -> (i32, String, String) + Send + Sync;

pub struct FakeIncus {
    _dir: TempDir,
    socket: PathBuf,
    requests: Arc<Mutex<Vec<Recorded>>>,
    sim: Arc<Mutex<Sim>>,
}

impl FakeIncus {
    /// Serve every request with `handler`.
    pub fn scripted(handler: impl Fn(&Recorded) -> Reply + Send + Sync + 'static) -> Self {
        Self::serve(Arc::new(handler), Arc::new(Mutex::new(Sim::default())))
    }

    /// A small in-memory Incus: instances, snapshots, images, profiles.
    pub fn simulated() -> Self {
        let sim = Arc::new(Mutex::new(Sim::default()));
        let state = sim.clone();
        let handler = move |req: &Recorded| state.lock().unwrap().handle(req);
        Self::serve(Arc::new(handler), sim)
    }

    fn serve(handler: Arc<Handler>, sim: Arc<Mutex<Sim>>) -> Self {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("incus.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let Some(req) = read_request(&stream) else {
                    continue;
                };
                log.lock().unwrap().push(req.clone());
                write_reply(stream, handler(&req));
            }
        });
        Self {
            _dir: dir,
            socket,
            requests,
            sim,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn client(&self) -> IncusClient {
        IncusClient::unix(&self.socket)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn add_container(&self, name: &str, status: &str) {
        self.sim.lock().unwrap().instances.insert(
            name.to_string(),
            SimInstance {
                status: status.to_string(),
                ..SimInstance::default()
            },
        );
    }

    pub fn add_image_alias(&self, alias: &str) {
        self.sim
            .lock()
            .unwrap()
            .aliases
            .insert(alias.to_string(), format!("fp-{}", alias));
    }

    pub fn on_exec(&self, f: impl Fn(&[String]) -> (i32, String, String) + Send + Sync + 'static) {
        self.sim.lock().unwrap().exec = Some(Box::new(f));
    }

    pub fn put_file(&self, container: &str, path: &str, contents: &str) {
        self.sim
            .lock()
            .unwrap()
            .files
            .insert(format!("{}:{}", container, path), contents.to_string());
    }

    pub fn status_of(&self, name: &str) -> Option<String> {
        self.sim
            .lock()
            .unwrap()
            .instances
            .get(name)
            .map(|i| i.status.clone())
    }

    pub fn instance_json(&self, name: &str) -> Option<Value> {
        let sim = self.sim.lock().unwrap();
        sim.instances.get(name).map(|i| i.to_json(name))
    }

    pub fn profile_json(&self, name: &str) -> Option<Value> {
        self.sim.lock().unwrap().profiles.get(name).cloned()
    }

    /// Make the next state change with `action` fail.
    pub fn fail_action(&self, action: &str) {
        self.sim.lock().unwrap().fail_actions.push(action.to_string());
    }
}

fn read_request(stream: &UnixStream) -> Option<Recorded> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    loop {
        let mut h = String::new();
        reader.read_line(&mut h).ok()?;
        let h = h.trim_end();
        if h.is_empty() {
            break;
        }
        if let Some((k, v)) = h.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }
    let len = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0; len];
    reader.read_exact(&mut body).ok()?;
    Some(Recorded {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn write_reply(mut stream: UnixStream, reply: Reply) {
    let mut head = format!("HTTP/1.1 {} Fake\r\n", reply.status);
    for (k, v) in &reply.headers {
        head.push_str(&format!("{}: {}\r\n", k, v));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", reply.body.len()));
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(&reply.body);
}

#[derive(Default)]
struct SimInstance {
    status: String,
    config: BTreeMap<String, String>,
    devices: BTreeMap<String, Value>,
    profiles: Vec<String>,
    snapshots: Vec<String>,
    version: u32,
}

impl SimInstance {
    fn to_json(&self, name: &str) -> Value {
        json!({
            "name": name,
            "status": self.status,
            "config": self.config,
            "devices": self.devices,
            "profiles": self.profiles,
            "created_at": "2026-01-01T00:00:00Z",
            "description": "",
        })
    }

    fn state_json(&self, index: usize) -> Value {
        let network = if self.status == "Running" {
            json!({"eth0": {"addresses": [
                {"family": "inet", "address": format!("10.0.0.{}", 10 + index), "scope": "global"}
            ]}})
        } else {
            Value::Null
        };
        json!({"status": self.status, "network": network})
    }
}

#[derive(Default)]
struct Sim {
    instances: BTreeMap<String, SimInstance>,
    profiles: BTreeMap<String, Value>,
    aliases: BTreeMap<String, String>,
    images: Vec<Value>,
    files: BTreeMap<String, String>,
    ops: BTreeMap<String, Reply>,
    exec: Option<Box<ExecFn>>,
    fail_actions: Vec<String>,
    next_id: u32,
}

impl Sim {
    fn id(&mut self) -> String {
        self.next_id += 1;
        format!("op{}", self.next_id)
    }

    /// Finish an operation immediately; the wait call picks up the result.
    fn op(&mut self, result: std::result::Result<Value, String>) -> Reply {
        let id = self.id();
        let done = match result {
            Ok(meta) => Reply::operation_done(&id, meta),
            Err(err) => Reply::operation_failed(&id, &err),
        };
        self.ops.insert(id.clone(), done);
        Reply::async_operation(&id)
    }

    fn handle(&mut self, req: &Recorded) -> Reply {
        let route = req.route().to_string();
        let parts: Vec<&str> = route.trim_start_matches("/1.0").split('/').collect();
        match (req.method.as_str(), &parts[1..]) {
            ("GET", []) | ("GET", [""]) => Reply::sync(json!({"api_version": "1.0"})),
            ("GET", ["operations", id, "wait"]) => self
                .ops
                .remove(*id)
                .unwrap_or_else(|| Reply::error(404, "Operation not found")),

            ("GET", ["instances"]) => {
                let list: Vec<Value> = self
                    .instances
                    .iter()
                    .enumerate()
                    .map(|(i, (name, inst))| {
                        let mut v = inst.to_json(name);
                        v["state"] = inst.state_json(i);
                        v
                    })
                    .collect();
                Reply::sync(Value::Array(list))
            }
            ("POST", ["instances"]) => {
                let body = req.json();
                let name = body["name"].as_str().unwrap_or_default().to_string();
                if self.instances.contains_key(&name) {
                    return Reply::error(409, "Instance already exists");
                }
                let source = &body["source"];
                if let Some(alias) = source["alias"].as_str()
                    && source["server"].is_null()
                    && !self.aliases.contains_key(alias)
                {
                    return self.op(Err(format!("Image \"{}\" not found", alias)));
                }
                let inst = SimInstance {
                    status: "Stopped".into(),
                    config: serde_json::from_value(body["config"].clone()).unwrap_or_default(),
                    devices: serde_json::from_value(body["devices"].clone()).unwrap_or_default(),
                    profiles: serde_json::from_value(body["profiles"].clone()).unwrap_or_default(),
                    ..SimInstance::default()
                };
                self.instances.insert(name, inst);
                self.op(Ok(Value::Null))
            }
            ("GET", ["instances", name]) => match self.instances.get(*name) {
                Some(inst) => {
                    Reply::sync(inst.to_json(name)).with_etag(&format!("\"v{}\"", inst.version))
                }
                None => Reply::error(404, "Instance not found"),
            },
            ("PUT", ["instances", name]) => {
                let body = req.json();
                let Some(inst) = self.instances.get_mut(*name) else {
                    return Reply::error(404, "Instance not found");
                };
                if let Some(snap) = body["restore"].as_str() {
                    if !inst.snapshots.iter().any(|s| s == snap) {
                        return Reply::error(404, "Snapshot not found");
                    }
                    return self.op(Ok(Value::Null));
                }
                if let Some(etag) = req.header("If-Match")
                    && etag != format!("\"v{}\"", inst.version)
                {
                    return Reply::error(412, "ETag doesn't match");
                }
                inst.config = serde_json::from_value(body["config"].clone()).unwrap_or_default();
                inst.devices = serde_json::from_value(body["devices"].clone()).unwrap_or_default();
                inst.version += 1;
                self.op(Ok(Value::Null))
            }
            ("DELETE", ["instances", name]) => match self.instances.get(*name) {
                Some(inst) if inst.status != "Stopped" => {
                    self.op(Err("Instance is running".into()))
                }
                Some(_) => {
                    self.instances.remove(*name);
                    self.op(Ok(Value::Null))
                }
                None => Reply::error(404, "Instance not found"),
            },
            ("GET", ["instances", name, "state"]) => {
                let index = self.instances.keys().position(|k| k == name);
                match (index, self.instances.get(*name)) {
                    (Some(i), Some(inst)) => Reply::sync(inst.state_json(i)),
                    _ => Reply::error(404, "Instance not found"),
                }
            }
            ("PUT", ["instances", name, "state"]) => {
                let action = req.json()["action"].as_str().unwrap_or_default().to_string();
                if let Some(pos) = self.fail_actions.iter().position(|a| *a == action) {
                    self.fail_actions.remove(pos);
                    return self.op(Err(format!("Failed to {} instance", action)));
                }
                let Some(inst) = self.instances.get_mut(*name) else {
                    return Reply::error(404, "Instance not found");
                };
                inst.status = match action.as_str() {
                    "start" | "unfreeze" => "Running",
                    "stop" => "Stopped",
                    "freeze" => "Frozen",
                    _ => return Reply::error(400, "Unknown action"),
                }
                .to_string();
                self.op(Ok(Value::Null))
            }
            ("GET", ["instances", name, "snapshots"]) => match self.instances.get(*name) {
                Some(inst) => Reply::sync(Value::Array(
                    inst.snapshots
                        .iter()
                        .enumerate()
                        .map(|(i, s)| {
                            json!({
                                "name": format!("{}/{}", name, s),
                                "created_at": format!("2026-01-01T00:00:{:02}Z", i),
                                "stateful": false,
                            })
                        })
                        .collect(),
                )),
                None => Reply::error(404, "Instance not found"),
            },
            ("POST", ["instances", name, "snapshots"]) => {
                let snap = req.json()["name"].as_str().unwrap_or_default().to_string();
                match self.instances.get_mut(*name) {
                    Some(inst) if inst.snapshots.contains(&snap) => {
                        Reply::error(409, "Snapshot already exists")
                    }
                    Some(inst) => {
                        inst.snapshots.push(snap);
                        self.op(Ok(Value::Null))
                    }
                    None => Reply::error(404, "Instance not found"),
                }
            }
            ("GET", ["instances", name, "snapshots", snap]) => match self.instances.get(*name) {
                Some(inst) if inst.snapshots.iter().any(|s| s == snap) => {
                    Reply::sync(json!({"name": snap}))
                }
                _ => Reply::error(404, "Snapshot not found"),
            },
            ("DELETE", ["instances", name, "snapshots", snap]) => {
                match self.instances.get_mut(*name) {
                    Some(inst) if inst.snapshots.iter().any(|s| s == snap) => {
                        inst.snapshots.retain(|s| s != snap);
                        self.op(Ok(Value::Null))
                    }
                    _ => Reply::error(404, "Snapshot not found"),
                }
            }
            ("POST", ["instances", name, "exec"]) => {
                if !self.instances.contains_key(*name) {
                    return Reply::error(404, "Instance not found");
                }
                let argv: Vec<String> =
                    serde_json::from_value(req.json()["command"].clone()).unwrap_or_default();
                let (code, stdout, stderr) = match &self.exec {
                    Some(f) => f(&argv),
                    None => (0, String::new(), String::new()),
                };
                let id = self.next_id + 1;
                let base = format!("/1.0/instances/{}/logs/exec-output/exec_{}", name, id);
                self.files.insert(format!("log:{}.stdout", base), stdout);
                self.files.insert(format!("log:{}.stderr", base), stderr);
                self.op(Ok(json!({
                    "return": code,
                    "output": {"1": format!("{}.stdout", base), "2": format!("{}.stderr", base)},
                })))
            }
            ("GET", ["instances", _, "logs", "exec-output", _]) => {
                match self.files.get(&format!("log:{}", route)) {
                    Some(text) => Reply::raw(200, text.clone()),
                    None => Reply::error(404, "not found"),
                }
            }
            ("DELETE", ["instances", _, "logs", "exec-output", _]) => {
                self.files.remove(&format!("log:{}", route));
                Reply::sync(Value::Null)
            }
            ("GET", ["instances", name, "files"]) => {
                let path = req.query("path").unwrap_or_default();
                match self.files.get(&format!("{}:{}", name, path)) {
                    Some(text) => Reply::raw(200, text.clone()),
                    None => Reply::error(404, "not found"),
                }
            }

            ("GET", ["images"]) => Reply::sync(Value::Array(self.images.clone())),
            ("POST", ["images"]) => {
                let body = req.json();
                let fp = format!("{:064x}", self.images.len() + 1);
                self.images.push(json!({
                    "fingerprint": fp,
                    "aliases": [],
                    "properties": body["properties"],
                    "size": 1024,
                }));
                self.op(Ok(json!({"fingerprint": fp})))
            }
            ("GET", ["images", "aliases", alias]) => match self.aliases.get(*alias) {
                Some(fp) => Reply::sync(json!({"name": alias, "target": fp})),
                None => Reply::error(404, "Image alias not found"),
            },
            ("POST", ["images", "aliases"]) => {
                let body = req.json();
                let name = body["name"].as_str().unwrap_or_default().to_string();
                if self.aliases.contains_key(&name) {
                    return Reply::error(409, "Alias already exists");
                }
                let target = body["target"].as_str().unwrap_or_default().to_string();
                for image in &mut self.images {
                    if image["fingerprint"] == target.as_str()
                        && let Some(list) = image["aliases"].as_array_mut()
                    {
                        list.push(json!({"name": name}));
                    }
                }
                self.aliases.insert(name, target);
                Reply::sync(Value::Null)
            }
            ("DELETE", ["images", "aliases", alias]) => match self.aliases.remove(*alias) {
                Some(_) => Reply::sync(Value::Null),
                None => Reply::error(404, "Image alias not found"),
            },
            ("DELETE", ["images", fp]) => {
                let before = self.images.len();
                self.images.retain(|i| i["fingerprint"] != *fp);
                if self.images.len() == before {
                    return Reply::error(404, "Image not found");
                }
                self.op(Ok(Value::Null))
            }

            ("POST", ["profiles"]) => {
                let body = req.json();
                let name = body["name"].as_str().unwrap_or_default().to_string();
                if self.profiles.contains_key(&name) {
                    return Reply::error(409, "Profile already exists");
                }
                self.profiles.insert(name, body);
                Reply::sync(Value::Null)
            }
            ("GET", ["profiles", name]) => match self.profiles.get(*name) {
                Some(p) => Reply::sync(p.clone()).with_etag("\"p1\""),
                None => Reply::error(404, "Profile not found"),
            },
            ("PUT", ["profiles", name]) => {
                let body = req.json();
                match self.profiles.get_mut(*name) {
                    Some(p) => {
                        p["config"] = body["config"].clone();
                        p["devices"] = body["devices"].clone();
                        Reply::sync(Value::Null)
                    }
                    None => Reply::error(404, "Profile not found"),
                }
            }
            ("GET", ["storage-pools", _, "resources"]) => Reply::sync(json!({
                "space": {"used": 5_000_000_000u64, "total": 50_000_000_000u64},
                "inodes": {"used": 1000, "total": 100000},
            })),
            _ => Reply::error(404, "not found"),
        }
    }
}
