use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Pip,
    Npm,
    Go,
    Cargo,
    Brew,
    Custom,
}

impl PackageManager {
    pub const ALL: [PackageManager; 7] = [
        PackageManager::Apt,
        PackageManager::Pip,
        PackageManager::Npm,
        PackageManager::Go,
        PackageManager::Cargo,
        PackageManager::Brew,
        PackageManager::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Pip => "pip",
            PackageManager::Npm => "npm",
            PackageManager::Go => "go",
            PackageManager::Cargo => "cargo",
            PackageManager::Brew => "brew",
            PackageManager::Custom => "custom",
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageManager {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PackageManager::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::not_found("package manager", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    pub name: String,
    pub source: String,
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Tracked metadata of one container. Serialized as `state.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    #[serde(default)]
    pub base_image: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub packages: BTreeMap<PackageManager, Vec<String>>,
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_snapshot: Option<String>,
}

impl InstanceRecord {
    pub fn new(name: &str, base_image: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            base_image: base_image.to_string(),
            created_at: now,
            updated_at: now,
            packages: BTreeMap::new(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            current_snapshot: None,
        }
    }

    /// Canonical document: map keys are ordered, output is pretty JSON with
    /// a trailing newline.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Equal ignoring `updated_at`.
    pub fn same_content(&self, other: &InstanceRecord) -> bool {
        let mut a = self.clone();
        a.updated_at = other.updated_at;
        a == *other
    }

    /// Returns the packages that were not already recorded.
    pub fn add_packages(&mut self, manager: PackageManager, packages: &[String]) -> Vec<String> {
        let list = self.packages.entry(manager).or_default();
        let mut added = Vec::new();
        for pkg in packages {
            if !list.contains(pkg) && !added.contains(pkg) {
                list.push(pkg.clone());
                added.push(pkg.clone());
            }
        }
        if list.is_empty() {
            self.packages.remove(&manager);
        }
        added
    }

    pub fn upsert_mount(&mut self, entry: MountEntry) {
        match self.mounts.iter_mut().find(|m| m.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.mounts.push(entry),
        }
    }

    pub fn remove_mount(&mut self, name: &str) -> bool {
        let before = self.mounts.len();
        self.mounts.retain(|m| m.name != name);
        self.mounts.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> InstanceRecord {
        InstanceRecord::new("agent", "coop-agent-base", DateTime::<Utc>::UNIX_EPOCH)
    }

    #[test]
    fn packages_are_deduplicated_per_manager() {
        let mut r = record();
        let pkgs = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(r.add_packages(PackageManager::Apt, &pkgs(&["curl", "git", "curl"])), pkgs(&["curl", "git"]));
        assert_eq!(r.add_packages(PackageManager::Apt, &pkgs(&["git", "jq"])), pkgs(&["jq"]));
        assert!(r.add_packages(PackageManager::Pip, &[]).is_empty());
        assert_eq!(r.packages.len(), 1);
        assert_eq!(r.packages[&PackageManager::Apt], pkgs(&["curl", "git", "jq"]));
    }

    #[test]
    fn mount_upsert_keeps_order() {
        let mut r = record();
        let m = |name: &str, src: &str| MountEntry {
            name: name.into(),
            source: src.into(),
            path: format!("/mnt/{name}"),
            readonly: false,
        };
        r.upsert_mount(m("a", "/src/a"));
        r.upsert_mount(m("b", "/src/b"));
        r.upsert_mount(m("a", "/src/a2"));
        let names: Vec<_> = r.mounts.iter().map(|m| (m.name.as_str(), m.source.as_str())).collect();
        assert_eq!(names, [("a", "/src/a2"), ("b", "/src/b")]);
        assert!(r.remove_mount("a"));
        assert!(!r.remove_mount("a"));
    }

    #[test]
    fn canonical_json_is_stable() {
        let mut r = record();
        r.env.insert("Z".into(), "1".into());
        r.env.insert("A".into(), "2".into());
        r.add_packages(PackageManager::Npm, &["tsx".into()]);
        let a = r.to_canonical_json().unwrap();
        let back = InstanceRecord::from_json(&a).unwrap();
        assert_eq!(back, r);
        assert_eq!(back.to_canonical_json().unwrap(), a);
        let text = String::from_utf8(a).unwrap();
        assert!(text.find("\"A\"").unwrap() < text.find("\"Z\"").unwrap());
        assert!(text.contains("\"npm\""));
        assert!(!text.contains("current_snapshot"));
    }

    #[test]
    fn parses_manager_names() {
        assert_eq!("cargo".parse::<PackageManager>().unwrap(), PackageManager::Cargo);
        assert!("yum".parse::<PackageManager>().is_err());
    }
}
