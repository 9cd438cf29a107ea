//! Per-run log sink
//!
//! The hook must not write to stdout/stderr, so logs go to a file in the
//! state directory. The subscriber is installed as the thread default for
//! the lifetime of the returned guard; dropping it closes the file.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing::subscriber::DefaultGuard;
use tracing::Level;

pub struct LogGuard {
    _guard: DefaultGuard,
}

/// Install the file logger. Returns `None` when the log file cannot be
/// opened; the run then proceeds without logging.
pub fn init(path: &Path, debug: bool) -> Option<LogGuard> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path).ok()?;

    let subscriber = tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .finish();

    Some(LogGuard {
        _guard: tracing::subscriber::set_default(subscriber),
    })
}
