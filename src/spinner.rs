use indicatif::{ProgressBar, ProgressStyle};
use std::io::{BufRead, BufReader, Read};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info};

use crate::cmd::{Cmd, check_status, spawn_error};
use crate::error::Result;

/// Create a spinner with consistent styling.
fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.blue} {msg}")
    {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb
}

/// Run an operation with a spinner, showing success/failure.
pub fn with_spinner<T, E, F>(msg: &str, op: F) -> std::result::Result<T, E>
where
    F: FnOnce() -> std::result::Result<T, E>,
{
    let pb = create_spinner(msg);
    let result = op();
    match &result {
        Ok(_) => pb.finish_with_message(format!("✔ {}", msg)),
        Err(_) => pb.finish_with_message(format!("✘ {}", msg)),
    }
    result
}

/// Run a command with a spinner, streaming its output above the spinner line.
///
/// Every line is also mirrored into the log (ANSI stripped). Stderr lines go
/// through `stderr_formatter`; returning `None` hides the line from the
/// terminal but it is still logged.
pub fn with_streaming_command_formatted(
    msg: &str,
    cmd: Cmd,
    stderr_formatter: impl Fn(&str) -> Option<String> + Send + 'static,
) -> Result<()> {
    let command_line = cmd.display();
    info!(command = %command_line, "cmd:stream start");
    let pb = create_spinner(msg);

    let mut child = match cmd
        .to_command()
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            pb.finish_with_message(format!("✘ {}", msg));
            return Err(spawn_error(&command_line, e));
        }
    };

    let pb_out = pb.clone();
    let pb_err = pb.clone();
    let stdout_thread = stream_lines(child.stdout.take(), move |line| {
        pb_out.println(line);
    });
    let stderr_thread = stream_lines(child.stderr.take(), move |line| {
        if let Some(formatted) = stderr_formatter(line)
            && !formatted.is_empty()
        {
            pb_err.println(&formatted);
        }
    });

    stdout_thread.join().ok();
    stderr_thread.join().ok();

    let status = child.wait();
    let result = match status {
        Ok(status) => check_status(&command_line, status),
        Err(e) => Err(spawn_error(&command_line, e)),
    };
    match &result {
        Ok(()) => pb.finish_with_message(format!("✔ {}", msg)),
        Err(_) => pb.finish_with_message(format!("✘ {}", msg)),
    }
    result
}

/// Forward non-empty lines to `show` and to the log.
fn stream_lines<R>(
    pipe: Option<R>,
    show: impl Fn(&str) + Send + 'static,
) -> std::thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let Some(pipe) = pipe else { return };
        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            debug!(line = %strip_ansi_escapes::strip_str(&line), "cmd:stream");
            show(&line);
        }
    })
}
