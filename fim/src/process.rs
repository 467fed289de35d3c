use std::path::PathBuf;

use log::debug;

/// Best-effort lookup of a process's argument list.
pub trait CommandLine: Send + Sync + 'static {
    /// `None` when the process is gone or has no argument text.
    fn cmdline(&self, pid: u32) -> Option<String>;
}

/// Reads `<root>/<pid>/cmdline`.
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CommandLine for ProcFs {
    fn cmdline(&self, pid: u32) -> Option<String> {
        let path = self.root.join(pid.to_string()).join("cmdline");
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) => {
                debug!("no cmdline for pid {}: {}", pid, err);
                return None;
            }
        };
        let args = raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>();
        if args.is_empty() {
            return None;
        }
        Some(args.join(" "))
    }
}
