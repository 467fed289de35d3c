//! In-process stand-ins for the kernel probe and for consumers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fim_common::{decode_key, RuleKey};

use crate::consumer::{Commit, Consumer, Routes};
use crate::error::FimError;
use crate::event::Event;
use crate::probe::KernelProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Update(u64, i32),
    Delete(u64),
}

#[derive(Default)]
pub struct RecordingProbe {
    ops: Mutex<Vec<Op>>,
    fail_deletes: AtomicBool,
    channels: Mutex<Option<(mpsc::Sender<Bytes>, mpsc::Sender<u64>)>>,
    pub closed: AtomicBool,
}

impl RecordingProbe {
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<(u64, i32)> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                Op::Update(key, flag) => Some((*key, *flag)),
                Op::Delete(_) => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<u64> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                Op::Delete(key) => Some(*key),
                Op::Update(..) => None,
            })
            .collect()
    }

    /// Channels handed over by `poll_start`; panics before polling starts.
    pub fn ring(&self) -> (mpsc::Sender<Bytes>, mpsc::Sender<u64>) {
        self.channels.lock().clone().expect("poll_start not called")
    }
}

impl KernelProbe for RecordingProbe {
    fn update_rule(&self, key: RuleKey, flag: i32) -> Result<(), FimError> {
        let key = decode_key(&key)?;
        self.ops.lock().push(Op::Update(key, flag));
        Ok(())
    }

    fn delete_rule(&self, key: RuleKey) -> Result<(), FimError> {
        let key = decode_key(&key)?;
        self.ops.lock().push(Op::Delete(key));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(FimError::kernel("delete", key, "no such entry"));
        }
        Ok(())
    }

    fn poll_start(
        &self,
        records: mpsc::Sender<Bytes>,
        missed: mpsc::Sender<u64>,
        _shutdown: CancellationToken,
    ) -> Result<(), FimError> {
        *self.channels.lock() = Some((records, missed));
        Ok(())
    }

    fn poll_stop(&self) {
        self.channels.lock().take();
    }

    fn close(&self) -> Result<(), FimError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Consumer that records every event it is handed.
pub struct RecordingConsumer {
    name: &'static str,
    paths: Mutex<Vec<PathBuf>>,
    seen: Mutex<Vec<Event>>,
    commit: Mutex<Commit>,
    failing: Mutex<Vec<PathBuf>>,
}

impl RecordingConsumer {
    pub fn new(name: &'static str, paths: Vec<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            name,
            paths: Mutex::new(paths),
            seen: Mutex::new(Vec::new()),
            commit: Mutex::new(Commit::Committed),
            failing: Mutex::new(Vec::new()),
        })
    }

    pub fn set_paths(&self, paths: Vec<PathBuf>) {
        *self.paths.lock() = paths;
    }

    pub fn answer(&self, commit: Commit) {
        *self.commit.lock() = commit;
    }

    /// Events for `path` are recorded and then fail as a store error.
    pub fn fail_on(&self, path: PathBuf) {
        self.failing.lock().push(path);
    }

    pub fn seen(&self) -> Vec<Event> {
        self.seen.lock().clone()
    }
}

impl Consumer for RecordingConsumer {
    fn name(&self) -> &str {
        self.name
    }

    fn consume(&self, event: &Event) -> Result<Commit, FimError> {
        self.seen.lock().push(event.clone());
        if self.failing.lock().contains(&event.path) {
            return Err(FimError::Store(rusqlite::Error::InvalidQuery));
        }
        Ok(*self.commit.lock())
    }

    fn register(self: Arc<Self>) -> Routes {
        let paths = self.paths.lock().clone();
        paths
            .into_iter()
            .map(|path| (path, self.clone() as Arc<dyn Consumer>))
            .collect()
    }
}
