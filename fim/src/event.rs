use std::fmt;
use std::path::PathBuf;

use users::get_user_by_uid;

use fim_common::{EventMode, RawEvent};

/// A kernel notification resolved to a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub mode: i32,
    pub pid: u32,
    pub uid: u32,
    pub size: u32,
    pub inode: u64,
    pub device: u64,
    /// process argument list, or the kernel comm when that is unavailable
    pub comm: String,
    pub path: PathBuf,
}

impl Event {
    pub fn from_raw(raw: &RawEvent, comm: String, path: PathBuf) -> Self {
        Self {
            mode: raw.mode,
            pid: raw.pid,
            uid: raw.uid,
            size: raw.size,
            inode: raw.inode,
            device: raw.device,
            comm,
            path,
        }
    }

    /// Synthesized when a missing watched file appears; carries no process context.
    pub fn found(path: PathBuf) -> Self {
        Self {
            mode: EventMode::Found.into(),
            pid: 0,
            uid: 0,
            size: 0,
            inode: 0,
            device: 0,
            comm: String::new(),
            path,
        }
    }

    pub fn kind(&self) -> Option<EventMode> {
        EventMode::try_from(self.mode).ok()
    }

    pub fn is_found(&self) -> bool {
        self.kind() == Some(EventMode::Found)
    }

    /// uid resolved against the user database, or the number itself
    pub fn user_name(&self) -> String {
        match get_user_by_uid(self.uid) {
            None => format!("{}", self.uid),
            Some(user) => user.name().to_string_lossy().to_string(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.kind() {
            Some(kind) => kind.to_string(),
            None => format!("mode {}", self.mode),
        };
        write!(
            f,
            "{} {} by {}/{} (user {}, {}/{}, {} bytes)",
            mode,
            self.path.display(),
            self.pid,
            self.comm,
            self.user_name(),
            self.device,
            self.inode,
            self.size
        )
    }
}
