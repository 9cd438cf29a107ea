//! State file locations

use std::path::{Path, PathBuf};

pub const OFFSETS_FILE: &str = "langfuse_state.json";
pub const BUFFER_FILE: &str = "langfuse_tool_buffer.jsonl";
pub const LOCK_FILE: &str = "langfuse_state.lock";
pub const LOG_FILE: &str = "langfuse_hook.log";
pub const BACKEND_FILE: &str = "langfuse_backend.json";

/// State directory under a home directory
pub fn state_dir_under(home: &Path) -> PathBuf {
    home.join(".claude").join("state")
}

/// Default state directory (~/.claude/state), if there is a home directory
pub fn default_state_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| state_dir_under(&home))
}

/// Paths of every file in a state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub dir: PathBuf,
    pub offsets: PathBuf,
    pub buffer: PathBuf,
    pub lock: PathBuf,
    pub log: PathBuf,
    pub backend: PathBuf,
}

impl StatePaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            offsets: dir.join(OFFSETS_FILE),
            buffer: dir.join(BUFFER_FILE),
            lock: dir.join(LOCK_FILE),
            log: dir.join(LOG_FILE),
            backend: dir.join(BACKEND_FILE),
        }
    }
}
