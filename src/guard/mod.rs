//! Mount guard ("seatbelt"): decides which host paths may be exposed to a
//! container without a second factor.

pub mod authcode;

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::config::Dirs;
use crate::error::{Error, Result};

pub use authcode::AuthCode;

/// Second factor required before a guarded path is mounted.
pub trait Authorizer {
    fn authorize(&self, path: &str, reason: &str) -> Result<()>;
}

const SIP_REASON: &str = "protected by System Integrity Protection";

const SIP_PREFIXES: &[&str] = &["/System", "/usr", "/bin", "/sbin", "/var", "/private/var"];

/// Home-relative directories holding credentials or private state.
const SENSITIVE_DIRS: &[(&str, &str)] = &[
    (".ssh", "contains SSH keys"),
    (".gnupg", "contains GPG keys"),
    (".aws", "contains AWS credentials"),
    (".config/gcloud", "contains Google Cloud credentials"),
    (".azure", "contains Azure credentials"),
    (".kube", "contains Kubernetes credentials"),
    (".docker", "contains Docker registry credentials"),
    (".password-store", "contains the password store"),
    (".local/share/keyrings", "contains desktop keyrings"),
    ("Library/Keychains", "contains macOS keychains"),
    (".mozilla", "contains browser profiles"),
    (".config/google-chrome", "contains browser profiles"),
    (".config/chromium", "contains browser profiles"),
    ("Library/Application Support/Google/Chrome", "contains browser profiles"),
    ("Library/Application Support/Firefox", "contains browser profiles"),
    ("Library/Safari", "contains browser profiles"),
];

/// Outcome of classifying a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub seatbelted: bool,
    pub reason: String,
    /// Fully resolved path the verdict applies to.
    pub resolved: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MountGuard {
    home: PathBuf,
    config_root: PathBuf,
    sip_prefixes: Vec<PathBuf>,
}

impl MountGuard {
    pub fn new(home: impl Into<PathBuf>, config_root: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            config_root: config_root.into(),
            sip_prefixes: SIP_PREFIXES.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn for_user(dirs: &Dirs) -> Result<Self> {
        let home = home::home_dir().ok_or_else(|| Error::not_found("directory", "home"))?;
        Ok(Self::new(home, &dirs.config))
    }

    #[cfg(test)]
    pub(crate) fn with_sip_prefixes(mut self, prefixes: &[&str]) -> Self {
        self.sip_prefixes = prefixes.iter().map(PathBuf::from).collect();
        self
    }

    /// Expand `~`, make absolute, clean `.`/`..` and resolve symlinks of
    /// the longest existing prefix.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let expanded = self.expand(path);
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()?.join(expanded)
        };
        Ok(resolve_existing_prefix(&clean(&absolute)))
    }

    /// `~` and any `~user` prefix map to the invoking user's home.
    fn expand(&self, path: &str) -> PathBuf {
        match path.strip_prefix('~') {
            Some(rest) => match rest.find('/') {
                Some(slash) => self.home.join(rest[slash..].trim_start_matches('/')),
                None => self.home.clone(),
            },
            None => PathBuf::from(path),
        }
    }

    pub fn is_seatbelted(&self, path: &str) -> Result<Verdict> {
        let resolved = self.resolve(path)?;
        let verdict = self.classify(&resolved);
        debug!(
            path,
            resolved = %verdict.resolved.display(),
            seatbelted = verdict.seatbelted,
            reason = %verdict.reason,
            "guard:classify"
        );
        Ok(verdict)
    }

    fn classify(&self, resolved: &Path) -> Verdict {
        let verdict = |seatbelted: bool, reason: &str| Verdict {
            seatbelted,
            reason: reason.to_string(),
            resolved: resolved.to_path_buf(),
        };

        for prefix in &self.sip_prefixes {
            if resolved.starts_with(prefix) {
                return verdict(true, SIP_REASON);
            }
        }

        let config_reason = "contains the coop configuration and seatbelt key";
        let sensitive = SENSITIVE_DIRS
            .iter()
            .map(|(rel, reason)| (self.home.join(rel), *reason))
            .chain(std::iter::once((self.config_root.clone(), config_reason)));

        for (dir, reason) in sensitive {
            let dir = resolve_existing_prefix(&dir);
            if resolved.starts_with(&dir) {
                return verdict(true, reason);
            }
            if dir.starts_with(resolved) {
                return match secure_join(resolved, &dir) {
                    Ok(_) => verdict(true, &format!("{} ({})", reason, dir.display())),
                    Err(_) => verdict(true, "reaches sensitive directories through a symlink"),
                };
            }
        }
        verdict(false, "")
    }

    /// The config root and anything inside it are never mounted, even with
    /// a valid code. Ancestors such as `~` are only seatbelted.
    pub fn is_hard_blocked(&self, path: &str) -> Result<bool> {
        let resolved = self.resolve(path)?;
        let root = resolve_existing_prefix(&self.config_root);
        Ok(resolved.starts_with(&root))
    }
}

/// Lexical cleanup: drops `.`, folds `..`, never climbs above the root.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !path.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(c) => out.push(c),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Canonicalize the deepest existing ancestor and re-append the rest.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return rest.iter().rev().fold(canonical, |p, c| p.join(c));
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Walk from `root` down to `target` one component at a time, refusing
/// to follow any symlink on the way.
pub fn secure_join(root: &Path, target: &Path) -> Result<PathBuf> {
    let rel = target.strip_prefix(root).map_err(|_| Error::Seatbelted {
        path: target.display().to_string(),
        reason: format!("not inside {}", root.display()),
    })?;
    let mut current = root.to_path_buf();
    for component in rel.components() {
        let Component::Normal(c) = component else {
            return Err(Error::Seatbelted {
                path: target.display().to_string(),
                reason: "path escapes its root".into(),
            });
        };
        current.push(c);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::Seatbelted {
                    path: current.display().to_string(),
                    reason: "symlink in path".into(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(target.to_path_buf())
}
