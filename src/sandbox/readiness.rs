//! Waiting for cloud-init to finish inside a new container.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::incus::IncusClient;

pub const RESULT_MARKER: &str = "/run/cloud-init/result.json";
pub const OUTPUT_LOG: &str = "/var/log/cloud-init-output.log";

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudInitState {
    Pending,
    Running,
    Done,
    Error,
    Disabled,
}

impl CloudInitState {
    /// Classify `cloud-init status` output.
    pub fn classify(output: &str) -> Self {
        let status = output
            .lines()
            .find_map(|l| l.trim().strip_prefix("status:"))
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match status.as_str() {
            "done" => CloudInitState::Done,
            "running" => CloudInitState::Running,
            "error" | "degraded error" => CloudInitState::Error,
            "disabled" => CloudInitState::Disabled,
            _ => CloudInitState::Pending,
        }
    }
}

impl fmt::Display for CloudInitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloudInitState::Pending => "pending",
            CloudInitState::Running => "running",
            CloudInitState::Done => "done",
            CloudInitState::Error => "error",
            CloudInitState::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub interval: Duration,
    pub timeout: Duration,
    pub verbose: bool,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            verbose: false,
        }
    }
}

impl Readiness {
    /// Poll until cloud-init reports done. Elapsed time is counted in
    /// ticks of `interval`, so the budget does not depend on how long each
    /// check takes.
    pub fn wait(
        &self,
        client: &IncusClient,
        name: &str,
        out: &mut dyn Write,
        sleep: &mut dyn FnMut(Duration),
    ) -> Result<()> {
        let interval_ms = self.interval.as_millis().max(1);
        let max_ticks = (self.timeout.as_millis() / interval_ms) as u64;
        let mut last: Option<CloudInitState> = None;
        let mut next_line = 1usize;

        for tick in 0..=max_ticks {
            let state = observe(client, name);
            if last != Some(state) {
                writeln!(out, "  cloud-init: {}", state)?;
                debug!(container = name, tick, state = %state, "sandbox:cloud-init");
                last = Some(state);
            }
            if self.verbose {
                next_line = tail_log(client, name, next_line, out)?;
            }
            match state {
                CloudInitState::Done => {
                    info!(container = name, ticks = tick, "sandbox:cloud-init done");
                    return Ok(());
                }
                CloudInitState::Error | CloudInitState::Disabled => {
                    warn!(
                        container = name,
                        state = %state,
                        "sandbox:cloud-init failed; see `coop logs {}`",
                        name
                    );
                    return Err(Error::InvalidState {
                        name: name.to_string(),
                        state: format!("cloud-init {}", state),
                        action: "finish provisioning",
                    });
                }
                CloudInitState::Pending | CloudInitState::Running => {}
            }
            if tick < max_ticks {
                sleep(self.interval);
            }
        }
        Err(Error::Timeout {
            what: format!("cloud-init in {}", name),
            secs: self.timeout.as_secs(),
        })
    }
}

fn observe(client: &IncusClient, name: &str) -> CloudInitState {
    let env = BTreeMap::new();
    match client.exec_output(name, &["test", "-f", RESULT_MARKER], &env) {
        Ok(out) if out.exit_code == 0 => return CloudInitState::Done,
        Ok(_) => {}
        Err(e) => {
            debug!(container = name, error = %e, "sandbox:cloud-init marker check failed");
            return CloudInitState::Pending;
        }
    }
    match client.exec_output(name, &["cloud-init", "status"], &env) {
        Ok(out) => CloudInitState::classify(&out.stdout),
        Err(e) => {
            debug!(container = name, error = %e, "sandbox:cloud-init status failed");
            CloudInitState::Pending
        }
    }
}

/// Print log lines from `from` (1-based) on; returns the next line number.
fn tail_log(client: &IncusClient, name: &str, from: usize, out: &mut dyn Write) -> Result<usize> {
    let start = format!("+{}", from);
    let output = match client.exec_output(
        name,
        &["tail", "-n", &start, OUTPUT_LOG],
        &BTreeMap::new(),
    ) {
        Ok(o) if o.exit_code == 0 => o,
        _ => return Ok(from),
    };
    let mut next = from;
    for line in output.stdout.lines() {
        writeln!(out, "    {}", line)?;
        next += 1;
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::incus::fake::FakeIncus;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn classify_status_output() {
        assert_eq!(CloudInitState::classify("status: done\n"), CloudInitState::Done);
        assert_eq!(CloudInitState::classify("status: running"), CloudInitState::Running);
        assert_eq!(CloudInitState::classify("\nstatus: error\n"), CloudInitState::Error);
        assert_eq!(CloudInitState::classify("status: disabled"), CloudInitState::Disabled);
        assert_eq!(CloudInitState::classify("status: not started"), CloudInitState::Pending);
        assert_eq!(CloudInitState::classify(""), CloudInitState::Pending);
    }

    fn fake_with(status_after: usize, final_status: &'static str) -> FakeIncus {
        let fake = FakeIncus::simulated();
        fake.add_container("c1", "Running");
        let calls = Arc::new(AtomicUsize::new(0));
        fake.on_exec(move |argv| match argv[0].as_str() {
            "test" => (1, String::new(), String::new()),
            "cloud-init" => {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n >= status_after {
                    (0, format!("status: {}\n", final_status), String::new())
                } else {
                    (0, "status: running\n".into(), String::new())
                }
            }
            _ => (1, String::new(), String::new()),
        });
        fake
    }

    #[test]
    fn emits_one_line_per_state_change() {
        let fake = fake_with(2, "done");
        let mut out = Vec::new();
        let mut slept = Vec::new();
        Readiness::default()
            .wait(&fake.client(), "c1", &mut out, &mut |d| slept.push(d))
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "  cloud-init: running\n  cloud-init: done\n");
        assert_eq!(slept, vec![DEFAULT_INTERVAL; 2]);
    }

    #[test]
    fn marker_file_means_done() {
        let fake = FakeIncus::simulated();
        fake.add_container("c1", "Running");
        fake.on_exec(|argv| match argv[0].as_str() {
            "test" => (0, String::new(), String::new()),
            _ => panic!("status should not be queried"),
        });
        let mut out = Vec::new();
        Readiness::default()
            .wait(&fake.client(), "c1", &mut out, &mut |_| {})
            .unwrap();
    }

    #[test]
    fn error_status_fails_fast() {
        let fake = fake_with(0, "error");
        let err = Readiness::default()
            .wait(&fake.client(), "c1", &mut Vec::new(), &mut |_| {})
            .unwrap_err();
        assert!(err.is(ErrorKind::InvalidState));
        assert!(err.to_string().contains("cloud-init error"));
    }

    #[test]
    fn disabled_status_is_an_invalid_state() {
        let fake = fake_with(0, "disabled");
        let err = Readiness::default()
            .wait(&fake.client(), "c1", &mut Vec::new(), &mut |_| {})
            .unwrap_err();
        assert!(err.is(ErrorKind::InvalidState));
        assert!(err.to_string().contains("cloud-init disabled"));
    }

    #[test]
    fn times_out_after_exactly_the_budget() {
        let fake = fake_with(usize::MAX, "done");
        let mut total = Duration::ZERO;
        let readiness = Readiness {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(30),
            verbose: false,
        };
        let err = readiness
            .wait(&fake.client(), "c1", &mut Vec::new(), &mut |d| total += d)
            .unwrap_err();
        assert!(err.is(ErrorKind::Timeout));
        assert_eq!(total, Duration::from_secs(30));
    }

    #[test]
    fn verbose_tails_new_lines_only() {
        let fake = FakeIncus::simulated();
        fake.add_container("c1", "Running");
        let calls = Arc::new(AtomicUsize::new(0));
        fake.on_exec(move |argv| match argv[0].as_str() {
            "test" => (1, String::new(), String::new()),
            "cloud-init" => {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let s = if n == 0 { "running" } else { "done" };
                (0, format!("status: {}\n", s), String::new())
            }
            "tail" => {
                let log = ["one", "two", "three"];
                let from: usize = argv[2].trim_start_matches('+').parse().unwrap();
                let lines: String = log.iter().skip(from - 1).map(|l| format!("{l}\n")).collect();
                (0, lines, String::new())
            }
            _ => (1, String::new(), String::new()),
        });
        let mut out = Vec::new();
        Readiness {
            verbose: true,
            ..Readiness::default()
        }
        .wait(&fake.client(), "c1", &mut out, &mut |_| {})
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("    one\n").count(), 1);
        assert_eq!(text.matches("    three\n").count(), 1);
    }
}
