//! Relaying commands into a running server's console. The unit wraps the
//! server in a named screen session; input goes in via `screen -X stuff`,
//! output comes back by tailing `logs/latest.log`.

use std::{
    fs,
    path::Path,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use anyhow::{Context, Result, bail};

use crate::{service::ServiceUnit, storage::Layout};

const SCREEN_SESSION_PREFIX: &str = "mc-";
const POLL_RATE: Duration = Duration::from_millis(500);
const MAX_RETRIES: usize = 5;
const MAX_FLUSH_RETRIES: usize = 2;

fn session_name(instance: &str) -> String {
    format!("{SCREEN_SESSION_PREFIX}{instance}")
}

/// Reattach the operator's terminal to the server console.
pub fn attach(unit: &ServiceUnit, instance: &str) -> Result<()> {
    if !unit.is_active()? {
        bail!("The server is not running");
    }
    let status = Command::new("screen")
        .args(["-r", &session_name(instance)])
        .status()
        .context("launching screen")?;
    if !status.success() {
        bail!("screen exited with {status}");
    }
    Ok(())
}

/// Push one console command into the server and echo whatever the log
/// produces in response. The retry budget shrinks once any output has been
/// seen: an answered command should not keep us waiting for the full idle
/// timeout.
pub fn send(
    unit: &ServiceUnit,
    layout: &Layout,
    instance: &str,
    command: &[String],
    echo: bool,
) -> Result<Vec<String>> {
    if !unit.is_active()? {
        bail!("The server is not running");
    }

    let log_path = layout.log_path(instance);
    let mut offset = count_lines(&log_path)?;

    let line = command.join(" ");
    let status = Command::new("screen")
        .args([
            "-p",
            "0",
            "-S",
            &session_name(instance),
            "-X",
            "stuff",
            &format!("{line}\r"),
        ])
        .stdout(Stdio::null())
        .status()
        .context("running screen")?;
    if !status.success() {
        bail!("Unable to reach the server console (screen exited with {status})");
    }
    tracing::debug!(instance, command = %line, "sent console command");

    let mut collected = Vec::new();
    let mut remaining = MAX_RETRIES;
    while remaining > 0 {
        thread::sleep(POLL_RATE);
        let fresh = read_new_lines(&log_path, &mut offset)?;
        if fresh.is_empty() {
            remaining -= 1;
            continue;
        }
        if echo {
            for line in &fresh {
                println!("{line}");
            }
        }
        collected.extend(fresh);
        remaining = remaining.saturating_sub(1).min(MAX_FLUSH_RETRIES);
    }
    Ok(collected)
}

/// In-game broadcast. Delivery is best-effort; callers that must proceed
/// regardless (shutdown paths) swallow the error.
pub fn broadcast(
    unit: &ServiceUnit,
    layout: &Layout,
    instance: &str,
    message: &str,
) -> Result<()> {
    let command = vec!["say".to_string(), message.to_string()];
    send(unit, layout, instance, &command, false)?;
    Ok(())
}

fn count_lines(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(content.lines().count())
}

fn read_new_lines(path: &Path, offset: &mut usize) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let fresh: Vec<String> = content
        .lines()
        .skip(*offset)
        .map(str::to_string)
        .collect();
    *offset += fresh.len();
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn session_names_carry_the_prefix() {
        assert_eq!(session_name("survival"), "mc-survival");
    }

    #[test]
    fn read_new_lines_advances_the_offset() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("latest.log");
        fs::write(&log, "a\nb\n").unwrap();

        let mut offset = count_lines(&log).unwrap();
        assert_eq!(offset, 2);
        assert!(read_new_lines(&log, &mut offset).unwrap().is_empty());

        fs::write(&log, "a\nb\nc\n").unwrap();
        let fresh = read_new_lines(&log, &mut offset).unwrap();
        assert_eq!(fresh, vec!["c"]);
        assert_eq!(offset, 3);
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("latest.log");
        let mut offset = 0;
        assert_eq!(count_lines(&log).unwrap(), 0);
        assert!(read_new_lines(&log, &mut offset).unwrap().is_empty());
    }
}
