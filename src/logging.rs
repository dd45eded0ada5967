//! JSON line-delimited operation log.
//!
//! Each solver and localizer stage appends one line to
//! `<log dir>/operations.jsonl`. Callers treat a logging failure as
//! non-fatal and report it on stderr.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

const DEFAULT_LOG_DIR: &str = "logs";
const LOG_FILE: &str = "operations.jsonl";

static LOG_DIR: OnceLock<PathBuf> = OnceLock::new();
static WRITE_LOCK: Mutex<()> = Mutex::new(());

#[derive(Serialize)]
struct LogLine<'a, T: Serialize> {
    operation: &'a str,
    timestamp_ms: u128,
    payload: &'a T,
}

/// Redirect the operation log. Only the first call takes effect; returns
/// `false` if a directory was already fixed.
pub fn set_log_dir<P: AsRef<Path>>(dir: P) -> bool {
    LOG_DIR.set(dir.as_ref().to_path_buf()).is_ok()
}

pub fn log_path() -> PathBuf {
    LOG_DIR.get_or_init(default_log_dir).join(LOG_FILE)
}

/// Unit-test builds of the crate log outside the working tree.
fn default_log_dir() -> PathBuf {
    if cfg!(test) {
        std::env::temp_dir().join("concentration_localizer_unit_logs")
    } else {
        PathBuf::from(DEFAULT_LOG_DIR)
    }
}

pub fn log_operation<T: Serialize>(operation: &str, payload: &T) -> io::Result<()> {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let line = serde_json::to_string(&LogLine {
        operation,
        timestamp_ms,
        payload,
    })
    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    let path = log_path();
    let _guard = WRITE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{line}")
}

/// Log and swallow failures, for call sites inside numeric loops.
pub(crate) fn record<T: Serialize>(operation: &str, payload: &T) {
    if let Err(err) = log_operation(operation, payload) {
        eprintln!("failed to log {operation}: {err}");
    }
}
