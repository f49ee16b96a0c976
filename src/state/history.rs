//! Content-addressed history log.
//!
//! Layout under `history/`:
//! - `objects/<sha256>.json`: one entry each, named by the hash of its bytes
//! - `HEAD`: hash of the current tip
//! - `reflog`: NDJSON record of every HEAD move, used to keep entries that
//!   fell off the tip recoverable for a while

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::fsutil;

/// Unreachable entries are kept this long after they were last referenced.
pub const RECOVERY_WINDOW_DAYS: i64 = 30;

const MIN_PREFIX_LEN: usize = 4;

/// Stored form of an entry. `state` is the canonical JSON document
/// verbatim, so restoring an entry restores the exact bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub parent: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub state: String,
}

/// An entry as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReflogLine {
    at: DateTime<Utc>,
    #[serde(default)]
    from: Option<String>,
    to: String,
    message: String,
}

#[derive(Debug)]
pub struct History {
    dir: PathBuf,
}

impl History {
    pub fn open(dir: &Path) -> Result<Self> {
        fsutil::create_private_dir(&dir.join("objects"))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.dir.join("objects").join(format!("{}.json", hash))
    }

    fn head_path(&self) -> PathBuf {
        self.dir.join("HEAD")
    }

    fn reflog_path(&self) -> PathBuf {
        self.dir.join("reflog")
    }

    pub fn head(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.head_path()) {
            Ok(s) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist `entry` and return its hash. Writing the same entry twice is
    /// harmless.
    pub fn write_object(&self, entry: &Entry) -> Result<String> {
        let bytes = serde_json::to_vec(entry)?;
        let hash = hex::encode(Sha256::digest(&bytes));
        let path = self.object_path(&hash);
        if !path.exists() {
            fsutil::write_private(&path, &bytes)?;
        }
        trace!(hash = %hash, "history:object written");
        Ok(hash)
    }

    pub fn read(&self, hash: &str) -> Result<Entry> {
        let bytes = match fs::read(self.object_path(hash)) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("history entry", hash));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Move HEAD and note the move in the reflog.
    pub fn set_head(&self, hash: &str, message: &str) -> Result<()> {
        let from = self.head()?;
        let line = ReflogLine {
            at: Utc::now(),
            from,
            to: hash.to_string(),
            message: message.to_string(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(fsutil::PRIVATE_FILE_MODE)
            .open(self.reflog_path())?;
        let mut text = serde_json::to_string(&line)?;
        text.push('\n');
        file.write_all(text.as_bytes())?;
        fsutil::write_private(&self.head_path(), format!("{}\n", hash).as_bytes())?;
        debug!(head = %hash, message, "history:head moved");
        Ok(())
    }

    /// Expand an abbreviated hash. Ambiguous or unknown prefixes fail.
    pub fn resolve(&self, prefix: &str) -> Result<String> {
        let prefix = prefix.trim().to_ascii_lowercase();
        if prefix.len() < MIN_PREFIX_LEN || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::invalid_name(
                "history entry",
                &prefix,
                format!("expected at least {} hex digits", MIN_PREFIX_LEN),
            ));
        }
        let matches: Vec<String> = self
            .object_hashes()?
            .into_iter()
            .filter(|h| h.starts_with(&prefix))
            .collect();
        match matches.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(Error::not_found("history entry", prefix)),
            _ => Err(Error::invalid_name(
                "history entry",
                &prefix,
                "prefix is ambiguous",
            )),
        }
    }

    fn object_hashes(&self) -> Result<Vec<String>> {
        let mut hashes = Vec::new();
        for dirent in fs::read_dir(self.dir.join("objects"))? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            if let Some(hash) = name.strip_suffix(".json") {
                hashes.push(hash.to_string());
            }
        }
        Ok(hashes)
    }

    /// Up to `limit` entries walking parents from HEAD, newest first.
    pub fn log(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        let mut next = self.head()?;
        while let Some(hash) = next {
            if out.len() >= limit {
                break;
            }
            let entry = self.read(&hash)?;
            next = entry.parent.clone();
            out.push(LogEntry {
                hash,
                timestamp: entry.timestamp,
                message: entry.message,
            });
        }
        Ok(out)
    }

    fn ancestors(&self, start: &str, into: &mut HashSet<String>) {
        let mut next = Some(start.to_string());
        while let Some(hash) = next {
            if !into.insert(hash.clone()) {
                break;
            }
            next = self.read(&hash).ok().and_then(|e| e.parent);
        }
    }

    /// Delete entries unreachable from HEAD and from `keep` once they have
    /// been unreferenced for longer than the recovery window. Returns the
    /// number of entries removed.
    pub fn gc(&self, keep: &HashSet<String>, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::days(RECOVERY_WINDOW_DAYS);

        let mut reachable = HashSet::new();
        if let Some(head) = self.head()? {
            self.ancestors(&head, &mut reachable);
        }
        for hash in keep {
            self.ancestors(hash, &mut reachable);
        }

        let reflog = self.read_reflog()?;
        let mut last_seen: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        for line in &reflog {
            for hash in line.from.iter().chain(std::iter::once(&line.to)) {
                let seen = last_seen.entry(hash.as_str()).or_insert(line.at);
                *seen = (*seen).max(line.at);
            }
        }

        let mut removed = 0;
        for hash in self.object_hashes()? {
            if reachable.contains(&hash) {
                continue;
            }
            let Ok(entry) = self.read(&hash) else { continue };
            let seen = last_seen
                .get(hash.as_str())
                .copied()
                .unwrap_or(entry.timestamp)
                .max(entry.timestamp);
            if seen < cutoff {
                fs::remove_file(self.object_path(&hash))?;
                removed += 1;
            }
        }

        let kept: Vec<&ReflogLine> = reflog.iter().filter(|l| l.at >= cutoff).collect();
        if kept.len() != reflog.len() {
            let mut text = String::new();
            for line in kept {
                text.push_str(&serde_json::to_string(line)?);
                text.push('\n');
            }
            fsutil::write_private(&self.reflog_path(), text.as_bytes())?;
        }
        if removed > 0 {
            debug!(removed, "history:gc");
        }
        Ok(removed)
    }

    fn read_reflog(&self) -> Result<Vec<ReflogLine>> {
        let text = match fs::read_to_string(self.reflog_path()) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
