//! Registry of image aliases published by coop and where they came from.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::fsutil;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSourceRef {
    pub instance: String,
    pub snapshot: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedImage {
    pub fingerprint: String,
    pub source: ImageSourceRef,
    pub created_at: DateTime<Utc>,
}

pub struct ImageRegistry {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, PublishedImage>>,
}

impl ImageRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let entries = match fs::read(path) {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::from(e).context(format!("parse {}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, PublishedImage>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Protocol("image registry lock poisoned".into()))
    }

    fn persist(&self, entries: &BTreeMap<String, PublishedImage>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fsutil::create_private_dir(parent)?;
        }
        let mut bytes = serde_json::to_vec_pretty(entries)?;
        bytes.push(b'\n');
        fsutil::write_private(&self.path, &bytes)
    }

    pub fn record_publish(
        &self,
        alias: &str,
        fingerprint: &str,
        instance: &str,
        snapshot: &str,
    ) -> Result<()> {
        let mut entries = self.lock()?;
        let mut next = entries.clone();
        next.insert(
            alias.to_string(),
            PublishedImage {
                fingerprint: fingerprint.to_string(),
                source: ImageSourceRef {
                    instance: instance.to_string(),
                    snapshot: snapshot.to_string(),
                },
                created_at: Utc::now(),
            },
        );
        self.persist(&next)?;
        *entries = next;
        info!(alias, fingerprint, instance, snapshot, "images:recorded");
        Ok(())
    }

    pub fn get(&self, alias: &str) -> Result<Option<PublishedImage>> {
        Ok(self.lock()?.get(alias).cloned())
    }

    pub fn get_source(&self, alias: &str) -> Result<Option<ImageSourceRef>> {
        Ok(self.get(alias)?.map(|image| image.source))
    }

    pub fn list(&self) -> Result<BTreeMap<String, PublishedImage>> {
        Ok(self.lock()?.clone())
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, alias: &str) -> Result<bool> {
        let mut entries = self.lock()?;
        if !entries.contains_key(alias) {
            return Ok(false);
        }
        let mut next = entries.clone();
        next.remove(alias);
        self.persist(&next)?;
        *entries = next;
        info!(alias, "images:removed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn publish_then_remove_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("images.json");
        let reg = ImageRegistry::load(&path).unwrap();
        assert_eq!(reg.get_source("my-variant").unwrap(), None);

        reg.record_publish("my-variant", "abc123", "c1", "s1").unwrap();
        let expected = ImageSourceRef {
            instance: "c1".into(),
            snapshot: "s1".into(),
        };
        assert_eq!(reg.get_source("my-variant").unwrap(), Some(expected.clone()));
        assert_eq!(fsutil::mode_of(&path).unwrap(), 0o600);
        assert_eq!(fsutil::mode_of(path.parent().unwrap()).unwrap(), 0o700);

        let reloaded = ImageRegistry::load(&path).unwrap();
        let image = reloaded.get("my-variant").unwrap().unwrap();
        assert_eq!(image.fingerprint, "abc123");
        assert_eq!(image.source, expected);

        assert!(reg.remove("my-variant").unwrap());
        assert!(!reg.remove("my-variant").unwrap());
        assert_eq!(reg.get_source("my-variant").unwrap(), None);
        assert!(ImageRegistry::load(&path).unwrap().list().unwrap().is_empty());
    }

    #[test]
    fn reads_return_copies() {
        let dir = TempDir::new().unwrap();
        let reg = ImageRegistry::load(&dir.path().join("images.json")).unwrap();
        reg.record_publish("a", "f1", "c1", "s1").unwrap();
        let mut copy = reg.list().unwrap();
        copy.clear();
        assert_eq!(reg.list().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("images.json");
        fs::write(&path, "{not json").unwrap();
        assert!(ImageRegistry::load(&path).is_err());
    }
}
