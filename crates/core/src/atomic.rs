//! Crash-safe file replacement shared by the checkpoint store and the matrix cache.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::warn;

/// Atomically replace `path` with `bytes`.
///
/// Writes to a hidden temporary file in the same directory, syncs it and
/// renames it over the target. A crash mid-write leaves the previous file
/// untouched; readers never observe a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let written = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if written.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    written
}

/// Retry an I/O operation with linear backoff.
///
/// Each failed attempt except the last is logged at `warn` with `what`;
/// the final error is returned to the caller.
pub fn retry_io<T, E, F>(what: &str, attempts: u32, delay: Duration, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts => {
                warn!(attempt, max_attempts = attempts, error = %e, "{} failed, retrying", what);
                thread::sleep(delay * attempt);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
