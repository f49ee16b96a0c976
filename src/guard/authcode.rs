//! Time-based one-time codes that authorize mounting guarded paths.
//!
//! 30-second step, 6 digits, HMAC-SHA256, one step of clock skew either
//! way. The 160-bit secret lives base32-encoded in `seatbelt.key` (0600).

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use console::style;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fsutil;

type HmacSha256 = Hmac<Sha256>;

pub const STEP_SECS: u64 = 30;
pub const DIGITS: usize = 6;
const SECRET_BYTES: usize = 20;
const SKEW_STEPS: i64 = 1;

pub const PROMPT_TIMEOUT: Duration = Duration::from_secs(15);
pub const PROMPT_ATTEMPTS: u32 = 3;

pub struct AuthCode {
    key_path: PathBuf,
    secret: RwLock<Option<Vec<u8>>>,
}

impl AuthCode {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            secret: RwLock::new(None),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Load the secret once, creating it on first use.
    fn secret(&self) -> Result<Vec<u8>> {
        if let Ok(guard) = self.secret.read()
            && let Some(secret) = guard.as_ref()
        {
            return Ok(secret.clone());
        }
        let mut guard = self
            .secret
            .write()
            .map_err(|_| Error::Protocol("seatbelt secret lock poisoned".into()))?;
        if let Some(secret) = guard.as_ref() {
            return Ok(secret.clone());
        }
        let secret = load_or_create(&self.key_path)?;
        *guard = Some(secret.clone());
        Ok(secret)
    }

    pub fn current_code(&self) -> Result<String> {
        Ok(code_at(&self.secret()?, unix_now() / STEP_SECS))
    }

    /// Seconds until the current code rolls over.
    pub fn seconds_remaining(&self) -> u64 {
        STEP_SECS - unix_now() % STEP_SECS
    }

    pub fn validate_code(&self, input: &str) -> Result<bool> {
        self.validate_code_at(input, unix_now())
    }

    fn validate_code_at(&self, input: &str, unix_secs: u64) -> Result<bool> {
        let input = input.trim();
        if input.len() != DIGITS || !input.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }
        let secret = self.secret()?;
        let counter = (unix_secs / STEP_SECS) as i64;
        Ok((-SKEW_STEPS..=SKEW_STEPS)
            .filter_map(|d| u64::try_from(counter + d).ok())
            .any(|c| constant_time_eq(code_at(&secret, c).as_bytes(), input.as_bytes())))
    }

    /// Forget the cached secret and delete the key file. The next code
    /// request generates a fresh secret.
    pub fn rotate(&self) -> Result<()> {
        let mut guard = self
            .secret
            .write()
            .map_err(|_| Error::Protocol("seatbelt secret lock poisoned".into()))?;
        *guard = None;
        match std::fs::remove_file(&self.key_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(path = %self.key_path.display(), "seatbelt:secret rotated");
        Ok(())
    }

    /// Ask for a code on the controlling terminal.
    pub fn prompt(&self, path: &str, reason: &str) -> Result<()> {
        let tty_in = std::fs::File::open("/dev/tty")
            .map_err(|e| Error::Transport(format!("open /dev/tty: {}", e)))?;
        let mut tty_out = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/tty")
            .map_err(|e| Error::Transport(format!("open /dev/tty: {}", e)))?;

        // The reader may stay blocked on the terminal after we return.
        let (tx, rx) = mpsc::sync_channel(1);
        std::thread::spawn(move || {
            for line in BufReader::new(tty_in).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        writeln!(
            tty_out,
            "{} {} is guarded: {}",
            style("⚠").yellow(),
            style(path).bold(),
            reason
        )?;
        writeln!(
            tty_out,
            "  Run {} in another terminal and enter the code.",
            style("coop seatbelt code").cyan()
        )?;
        self.run_prompt(&rx, &mut tty_out, PROMPT_TIMEOUT, PROMPT_ATTEMPTS)
    }

    fn run_prompt(
        &self,
        answers: &Receiver<String>,
        out: &mut impl Write,
        timeout: Duration,
        attempts: u32,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        for attempt in 1..=attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            write!(
                out,
                "  Code ({}s left, attempt {}/{}): ",
                remaining.as_secs(),
                attempt,
                attempts
            )?;
            out.flush()?;
            match answers.recv_timeout(remaining) {
                Ok(answer) => {
                    if self.validate_code(&answer)? {
                        debug!(attempt, "seatbelt:authorized");
                        writeln!(out, "  {} authorized", style("✔").green())?;
                        return Ok(());
                    }
                    writeln!(out, "  {} incorrect code", style("✘").red())?;
                }
                Err(RecvTimeoutError::Timeout) => {
                    writeln!(out)?;
                    warn!("seatbelt:prompt expired");
                    return Err(Error::AuthExpired);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Transport("terminal closed during prompt".into()));
                }
            }
        }
        warn!(attempts, "seatbelt:too many incorrect codes");
        Err(Error::AuthFailed)
    }
}

impl super::Authorizer for AuthCode {
    fn authorize(&self, path: &str, reason: &str) -> Result<()> {
        self.prompt(path, reason)
    }
}

fn load_or_create(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read_to_string(path) {
        Ok(text) => base32_decode(text.trim()).ok_or_else(|| {
            Error::Protocol(format!("{} is not valid base32", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut secret = vec![0u8; SECRET_BYTES];
            getrandom::fill(&mut secret)
                .map_err(|e| Error::Transport(format!("random source: {}", e)))?;
            if let Some(parent) = path.parent() {
                fsutil::create_private_dir(parent)?;
            }
            let mut encoded = base32_encode(&secret);
            encoded.push('\n');
            fsutil::write_private(path, encoded.as_bytes())?;
            info!(path = %path.display(), "seatbelt:secret created");
            Ok(secret)
        }
        Err(e) => Err(Error::from(e).context(format!("read {}", path.display()))),
    }
}

/// HOTP value for `counter`, zero-padded.
pub fn code_at(secret: &[u8], counter: u64) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    format!("{:0width$}", binary % 10u32.pow(DIGITS as u32), width = DIGITS)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// RFC 4648 base32 without padding.
pub fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let (mut buffer, mut bits) = (0u32, 0u32);
    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Case-insensitive decode; padding and whitespace are ignored.
pub fn base32_decode(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let (mut buffer, mut bits) = (0u32, 0u32);
    for c in text.bytes().filter(|c| !c.is_ascii_whitespace() && *c != b'=') {
        let value = BASE32_ALPHABET
            .iter()
            .position(|&a| a == c.to_ascii_uppercase())? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Some(out)
}
