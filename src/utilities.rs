use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use log::debug;

/// Formats seconds as an SRT timestamp (`HH:MM:SS,mmm`).
pub fn format_timestamp(seconds: f64) -> String {
    let total_millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_millis / 3_600_000;
    let minutes = (total_millis % 3_600_000) / 60_000;
    let secs = (total_millis % 60_000) / 1000;
    let millis = total_millis % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

/// Runs an external tool with an argument vector (never through a shell).
///
/// Returns captured stdout. A non-zero exit is an error carrying the tail of stderr.
pub async fn run_tool<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<Vec<u8>> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to spawn {}", program))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!("{} stderr: {}", program, stderr);

    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr_tail(&stderr, 400)
        );
    }
    Ok(output.stdout)
}

fn stderr_tail(stderr: &str, max_chars: usize) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max_chars).collect()
}

/// True when the file exists and holds at least one byte.
pub async fn is_non_empty_file(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Removes a file, ignoring "not found".
pub async fn remove_if_exists(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!("could not remove {}: {}", path.display(), err);
        }
    }
}

/// Shorthand for building `OsString` argument vectors.
pub fn os_args<I, S>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    args.into_iter().map(Into::into).collect()
}
