//! Per-instance state tracking.
//!
//! Every externally visible change to a container (packages, mounts, env,
//! snapshots) is recorded in `state.json` and committed to a
//! content-addressed history. Snapshot names map to history entries through
//! `links.json`, which lives outside the history so resets never lose it.

pub mod history;
pub mod record;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::fsutil;
use crate::names;

pub use history::LogEntry;
use history::{Entry, History};
pub use record::{InstanceRecord, MountEntry, PackageManager};

const STATE_FILE: &str = "state.json";
const LINKS_FILE: &str = "links.json";
const HISTORY_DIR: &str = "history";

struct Inner {
    record: InstanceRecord,
    links: BTreeMap<String, String>,
}

pub struct StateTracker {
    dir: PathBuf,
    history: History,
    inner: Mutex<Inner>,
}

impl StateTracker {
    /// Start a fresh record for a new container, discarding anything left
    /// over from an earlier container of the same name.
    pub fn create(instances_dir: &Path, name: &str, base_image: &str) -> Result<Self> {
        names::validate_component("instance", name)?;
        let dir = instances_dir.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Self::init(dir, name, base_image)
    }

    /// Open the record of `name`, creating it if this container was never
    /// tracked.
    pub fn open(instances_dir: &Path, name: &str) -> Result<Self> {
        names::validate_component("instance", name)?;
        let dir = instances_dir.join(name);
        if !dir.join(STATE_FILE).exists() {
            return Self::init(dir, name, "");
        }
        fsutil::create_private_dir(&dir)?;
        let history = History::open(&dir.join(HISTORY_DIR))?;
        let record = read_record(&dir)?;
        let links = read_links(&dir)?;
        Ok(Self {
            dir,
            history,
            inner: Mutex::new(Inner { record, links }),
        })
    }

    fn init(dir: PathBuf, name: &str, base_image: &str) -> Result<Self> {
        fsutil::create_private_dir(&dir)?;
        let history = History::open(&dir.join(HISTORY_DIR))?;
        let record = InstanceRecord::new(name, base_image, Utc::now());
        let bytes = record.to_canonical_json()?;
        let message = if base_image.is_empty() {
            format!("track {}", name)
        } else {
            format!("create {} from {}", name, base_image)
        };
        let hash = history.write_object(&Entry {
            parent: None,
            timestamp: record.updated_at,
            message: message.clone(),
            state: String::from_utf8_lossy(&bytes).into_owned(),
        })?;
        // state.json marks the instance as tracked, so it goes last.
        history.set_head(&hash, &message)?;
        fsutil::write_private(&dir.join(STATE_FILE), &bytes)?;
        info!(instance = name, head = %hash, "state:init");
        Ok(Self {
            dir,
            history,
            inner: Mutex::new(Inner {
                record,
                links: BTreeMap::new(),
            }),
        })
    }

    /// Delete all tracked state of `name`.
    pub fn remove(instances_dir: &Path, name: &str) -> Result<()> {
        names::validate_component("instance", name)?;
        let dir = instances_dir.join(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Protocol("state tracker lock poisoned".into()))
    }

    pub fn state(&self) -> Result<InstanceRecord> {
        Ok(self.lock()?.record.clone())
    }

    pub fn links(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.lock()?.links.clone())
    }

    pub fn head(&self) -> Result<Option<String>> {
        self.history.head()
    }

    /// Apply `change` to a copy of the record and commit it. Returns the new
    /// head, or `None` when the change left the record untouched.
    fn commit(
        &self,
        inner: &mut Inner,
        message: &str,
        change: impl FnOnce(&mut InstanceRecord),
    ) -> Result<Option<String>> {
        let mut next = inner.record.clone();
        change(&mut next);
        if next.same_content(&inner.record) {
            return Ok(None);
        }
        next.updated_at = Utc::now();
        let bytes = next.to_canonical_json()?;

        let hash = self.history.write_object(&Entry {
            parent: self.history.head()?,
            timestamp: next.updated_at,
            message: message.to_string(),
            state: String::from_utf8_lossy(&bytes).into_owned(),
        })?;
        self.publish(&bytes, &hash, message)?;
        info!(instance = %next.name, head = %hash, message, "state:commit");
        inner.record = next;
        Ok(Some(hash))
    }

    pub fn record_package_install(
        &self,
        manager: PackageManager,
        packages: &[String],
    ) -> Result<Option<String>> {
        let mut inner = self.lock()?;
        let message = format!("install {}: {}", manager, packages.join(" "));
        self.commit(&mut inner, &message, |r| {
            r.add_packages(manager, packages);
        })
    }

    pub fn record_mount(
        &self,
        name: &str,
        source: &str,
        path: &str,
        readonly: bool,
    ) -> Result<Option<String>> {
        names::validate_component("mount", name)?;
        let mut inner = self.lock()?;
        let message = format!(
            "mount {} {} -> {}{}",
            name,
            source,
            path,
            if readonly { " (ro)" } else { "" }
        );
        self.commit(&mut inner, &message, |r| {
            r.upsert_mount(MountEntry {
                name: name.to_string(),
                source: source.to_string(),
                path: path.to_string(),
                readonly,
            })
        })
    }

    pub fn record_unmount(&self, name: &str) -> Result<Option<String>> {
        names::validate_component("mount", name)?;
        let mut inner = self.lock()?;
        self.commit(&mut inner, &format!("unmount {}", name), |r| {
            r.remove_mount(name);
        })
    }

    pub fn record_env(&self, key: &str, value: &str) -> Result<Option<String>> {
        if key.is_empty() || key.contains(['=', '\0']) {
            return Err(Error::invalid_name(
                "environment variable",
                key,
                "must be non-empty and contain no '=' or NUL",
            ));
        }
        let mut inner = self.lock()?;
        self.commit(&mut inner, &format!("env {}", key), |r| {
            r.env.insert(key.to_string(), value.to_string());
        })
    }

    /// Mark `name` as the current snapshot and link it to the resulting
    /// head. Returns the linked hash.
    pub fn record_snapshot(&self, name: &str, note: &str) -> Result<String> {
        names::validate_component("snapshot", name)?;
        let mut inner = self.lock()?;
        let message = if note.is_empty() {
            format!("snapshot {}", name)
        } else {
            format!("snapshot {}: {}", name, note)
        };
        let hash = match self.commit(&mut inner, &message, |r| {
            r.current_snapshot = Some(name.to_string());
        })? {
            Some(hash) => hash,
            None => self
                .history
                .head()?
                .ok_or_else(|| Error::not_found("history entry", "HEAD"))?,
        };
        let mut links = inner.links.clone();
        links.insert(name.to_string(), hash.clone());
        write_links(&self.dir, &links)?;
        inner.links = links;
        Ok(hash)
    }

    /// Drop the link of a deleted snapshot.
    pub fn forget_snapshot(&self, name: &str) -> Result<()> {
        names::validate_component("snapshot", name)?;
        let mut inner = self.lock()?;
        if inner.links.contains_key(name) {
            let mut links = inner.links.clone();
            links.remove(name);
            write_links(&self.dir, &links)?;
            inner.links = links;
        }
        Ok(())
    }

    /// Reset history to the entry linked to snapshot `name` and reload the
    /// record from it. The container itself is restored by the caller.
    pub fn undo_to_snapshot(&self, name: &str) -> Result<InstanceRecord> {
        names::validate_component("snapshot", name)?;
        let mut inner = self.lock()?;
        let hash = inner
            .links
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("snapshot link", name))?;
        self.reset(&mut inner, &hash, &format!("reset to snapshot {}", name))?;
        Ok(inner.record.clone())
    }

    /// Reset to a history entry by (possibly abbreviated) hash. Also returns
    /// the snapshot linked to that entry, if any.
    pub fn undo(&self, hash: &str) -> Result<(InstanceRecord, Option<String>)> {
        let mut inner = self.lock()?;
        let hash = self.history.resolve(hash)?;
        let snapshot = inner
            .links
            .iter()
            .find(|(_, h)| **h == hash)
            .map(|(name, _)| name.clone());
        self.reset(&mut inner, &hash, &format!("reset to {}", &hash[..12]))?;
        Ok((inner.record.clone(), snapshot))
    }

    fn reset(&self, inner: &mut Inner, hash: &str, message: &str) -> Result<()> {
        let entry = self.history.read(hash)?;
        let record = InstanceRecord::from_json(entry.state.as_bytes())?;
        self.publish(entry.state.as_bytes(), hash, message)?;
        info!(instance = %record.name, head = %hash, "state:reset");
        inner.record = record;

        let keep: HashSet<String> = inner.links.values().cloned().collect();
        if let Err(e) = self.history.gc(&keep, Utc::now()) {
            warn!(error = %e, "state:history gc failed");
        }
        Ok(())
    }

    /// Write `state` to state.json and move HEAD to `hash`. When HEAD cannot
    /// move, the previous state.json is put back.
    fn publish(&self, state: &[u8], hash: &str, message: &str) -> Result<()> {
        let path = self.dir.join(STATE_FILE);
        let previous = match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        fsutil::write_private(&path, state)?;
        if let Err(e) = self.history.set_head(hash, message) {
            let rollback = match &previous {
                Some(bytes) => fsutil::write_private(&path, bytes),
                None => fs::remove_file(&path).map_err(Error::from),
            };
            if let Err(r) = rollback {
                warn!(path = %path.display(), error = %r, "state:rollback failed");
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn history(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let _inner = self.lock()?;
        self.history.log(limit)
    }

    /// Re-read `state.json` and `links.json` from disk.
    pub fn reload(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.record = read_record(&self.dir)?;
        inner.links = read_links(&self.dir)?;
        Ok(())
    }
}

fn read_record(dir: &Path) -> Result<InstanceRecord> {
    let path = dir.join(STATE_FILE);
    let bytes =
        fs::read(&path).map_err(|e| Error::from(e).context(format!("read {}", path.display())))?;
    InstanceRecord::from_json(&bytes).map_err(|e| e.context(format!("parse {}", path.display())))
}

fn read_links(dir: &Path) -> Result<BTreeMap<String, String>> {
    match fs::read(dir.join(LINKS_FILE)) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_links(dir: &Path, links: &BTreeMap<String, String>) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(links)?;
    bytes.push(b'\n');
    fsutil::write_private(&dir.join(LINKS_FILE), &bytes)
}
