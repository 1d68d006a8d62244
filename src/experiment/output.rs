//! Collaborators the plan talks to while running: where measurement data is
//! written, and where user-facing banners go.
//!
//! Both are narrow traits so a beamline integration can plug in its own data
//! writer configuration and terminal; the defaults keep the directory in
//! memory and print through `tracing`.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::info;

/// Where the data writer puts measurement output.
pub trait DataDirectory: Send + Sync {
    /// Current output directory.
    fn output_directory(&self) -> PathBuf;

    /// Redirect subsequent output to `path`.
    fn set_output_directory(&self, path: &Path);
}

/// In-memory [`DataDirectory`]; nothing is created on disk.
#[derive(Debug)]
pub struct LocalDataDirectory {
    current: RwLock<PathBuf>,
}

impl LocalDataDirectory {
    /// Start out pointing at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            current: RwLock::new(root.into()),
        }
    }
}

impl Default for LocalDataDirectory {
    fn default() -> Self {
        Self::new("data")
    }
}

impl DataDirectory for LocalDataDirectory {
    fn output_directory(&self) -> PathBuf {
        self.current.read().clone()
    }

    fn set_output_directory(&self, path: &Path) {
        *self.current.write() = path.to_path_buf();
    }
}

/// Text sink for user-facing messages.
pub trait TerminalPrinter: Send + Sync {
    /// Print `text` to the user.
    fn print(&self, text: &str);
}

/// [`TerminalPrinter`] writing through `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTerminal;

impl TerminalPrinter for TracingTerminal {
    fn print(&self, text: &str) {
        info!(target: "daq_plan::terminal", "{text}");
    }
}

/// Make a segment, trigger or plan name safe to use as a directory name:
/// anything outside `[a-zA-Z0-9._-]` becomes `_`.
pub fn valid_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Frame `message` in a box of `#`.
pub(crate) fn banner(message: &str) -> String {
    let horizontal = "#".repeat(message.chars().count() + 4);
    format!("\n{horizontal}\n# {message} #\n{horizontal}")
}
