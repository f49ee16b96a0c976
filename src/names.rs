//! Name validation and whimsical name generation.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{Error, Result};

static CONTAINER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static regex")
});

const MAX_COMPONENT_LEN: usize = 128;

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "clever", "cosmic", "dapper", "eager", "fuzzy", "gentle", "giddy",
    "happy", "hidden", "jolly", "keen", "lively", "lucky", "mellow", "misty", "nimble", "plucky",
    "quiet", "rapid", "rusty", "shiny", "silent", "sleepy", "snappy", "sunny", "swift", "tidy",
    "velvet", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "comet", "falcon", "ferret", "gecko", "heron", "koala", "lantern",
    "lemur", "marmot", "meadow", "narwhal", "otter", "panda", "pebble", "penguin", "quokka",
    "raven", "sparrow", "squid", "tapir", "thistle", "toucan", "walrus", "wombat", "yak",
];

/// Validate a container name (DNS label, at most 63 characters).
pub fn validate_container_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_name("container", name, "name is empty"));
    }
    if name.len() > 63 {
        return Err(Error::invalid_name(
            "container",
            name,
            "must be at most 63 characters",
        ));
    }
    if !CONTAINER_NAME.is_match(name) {
        return Err(Error::invalid_name(
            "container",
            name,
            "use lowercase letters, digits and hyphens; must start and end with a letter or digit",
        ));
    }
    Ok(())
}

/// Validate a name that becomes a single filesystem path component
/// (instance, snapshot, mount, remote). Rejects traversal before any I/O.
pub fn validate_component(what: &'static str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_name(what, name, "name is empty"));
    }
    if name == "." || name == ".." {
        return Err(Error::invalid_name(what, name, "reserved path component"));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(Error::invalid_name(
            what,
            name,
            "must not contain path separators or NUL",
        ));
    }
    if name.len() > MAX_COMPONENT_LEN {
        return Err(Error::invalid_name(what, name, "name is too long"));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::invalid_name(
            what,
            name,
            "must not contain whitespace or control characters",
        ));
    }
    Ok(())
}

/// Generate an `adjective-noun` name.
pub fn generate_name() -> String {
    let mut buf = [0u8; 8];
    // Fall back to the clock if the OS RNG is unavailable; names need not be secret.
    if getrandom::fill(&mut buf).is_err() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        buf = nanos.to_le_bytes();
    }
    let seed = u64::from_le_bytes(buf);
    pick_name(seed)
}

fn pick_name(seed: u64) -> String {
    let adjective = ADJECTIVES[(seed % ADJECTIVES.len() as u64) as usize];
    let noun = NOUNS[((seed >> 32) % NOUNS.len() as u64) as usize];
    format!("{}-{}", adjective, noun)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dns_labels() {
        for name in ["a", "agent1", "my-agent", "0x", &"a".repeat(63)] {
            assert!(validate_container_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_bad_container_names() {
        for name in [
            "",
            ".",
            "..",
            "UPPER",
            "a/b",
            "a\\b",
            "has space",
            "-lead",
            "trail-",
            &"a".repeat(64),
        ] {
            assert!(validate_container_name(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn rejects_traversal_components() {
        for name in ["", ".", "..", "a/b", "a\\b", "nul\0byte", "../etc"] {
            let err = validate_component("snapshot", name).unwrap_err();
            assert!(err.is(crate::error::ErrorKind::InvalidName));
        }
        assert!(validate_component("snapshot", "before-upgrade.1").is_ok());
    }

    #[test]
    fn generated_names_are_valid_containers() {
        for seed in [0u64, 1, 42, u64::MAX, 0xdead_beef_cafe_f00d] {
            let name = pick_name(seed);
            validate_container_name(&name).unwrap();
            assert_eq!(name.matches('-').count(), 1);
        }
        validate_container_name(&generate_name()).unwrap();
    }
}
