//! Bidirectional inode <-> path bookkeeping, kept in lockstep with the
//! kernel rules table.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use fim_common::{encode_key, WATCH_FLAG};

use crate::error::FimError;
use crate::probe::KernelProbe;

#[derive(Default)]
struct Views {
    by_path: HashMap<PathBuf, u64>,
    by_key: HashMap<u64, PathBuf>,
}

impl Views {
    fn consistent(&self) -> bool {
        self.by_path.len() == self.by_key.len()
            && self
                .by_path
                .iter()
                .all(|(path, key)| self.by_key.get(key) == Some(path))
    }

    fn forget(&mut self, path: &Path, key: u64) {
        self.by_path.remove(path);
        self.by_key.remove(&key);
    }
}

/// Every mutation, including the pipeline's stale-key purge, goes through the
/// single `views` lock so the two directions and the kernel table never
/// disagree for longer than one call.
pub struct WatchTable {
    views: Mutex<Views>,
    probe: Arc<dyn KernelProbe>,
}

impl WatchTable {
    pub fn new(probe: Arc<dyn KernelProbe>) -> Self {
        Self {
            views: Mutex::new(Views::default()),
            probe,
        }
    }

    /// Starts watching `path` under its current inode. Re-adding a path is an
    /// overwrite; if the file was replaced the old inode is released.
    pub fn add(&self, path: &Path) -> Result<u64, FimError> {
        let key = std::fs::metadata(path)
            .map_err(|e| FimError::lookup(path, e))?
            .ino();
        let mut views = self.views.lock();
        if let Some(old) = views.by_path.get(path).copied().filter(|old| *old != key) {
            views.forget(path, old);
            if let Err(err) = self.probe.delete_rule(encode_key(old)) {
                warn!("releasing replaced inode of {}: {}", path.display(), err);
            }
        }
        self.probe.update_rule(encode_key(key), WATCH_FLAG)?;
        if let Some(linked) = views.by_key.insert(key, path.to_path_buf()) {
            if linked != path {
                debug!("{} shares inode {} with {}", path.display(), key, linked.display());
                views.by_path.remove(&linked);
            }
        }
        views.by_path.insert(path.to_path_buf(), key);
        debug_assert!(views.consistent());
        debug!("watching {} as key {}", path.display(), key);
        Ok(key)
    }

    /// Stops watching `path`. The local entry is dropped even when the kernel
    /// delete fails, so a stale kernel entry never blocks a later `add`.
    pub fn remove(&self, path: &Path) -> Result<(), FimError> {
        let mut views = self.views.lock();
        let key = *views
            .by_path
            .get(path)
            .ok_or_else(|| FimError::NotFound(path.to_path_buf()))?;
        let deleted = self.probe.delete_rule(encode_key(key));
        views.forget(path, key);
        debug_assert!(views.consistent());
        deleted
    }

    pub fn resolve(&self, key: u64) -> Option<PathBuf> {
        self.views.lock().by_key.get(&key).cloned()
    }

    /// Deletes the kernel registration of a key that has no path. Returns
    /// `false` without touching the kernel if an `add` claimed the key first.
    pub fn purge_stale(&self, key: u64) -> Result<bool, FimError> {
        let views = self.views.lock();
        if views.by_key.contains_key(&key) {
            return Ok(false);
        }
        self.probe.delete_rule(encode_key(key))?;
        Ok(true)
    }

    pub fn count(&self) -> usize {
        self.views.lock().by_path.len()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.views.lock().by_path.keys().cloned().collect()
    }

    /// Empties the table, handing back every key for kernel cleanup.
    pub fn drain(&self) -> Vec<u64> {
        let mut views = self.views.lock();
        views.by_path.clear();
        views.by_key.drain().map(|(key, _)| key).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingProbe;

    fn table() -> (Arc<RecordingProbe>, WatchTable) {
        let probe = Arc::new(RecordingProbe::default());
        (probe.clone(), WatchTable::new(probe))
    }

    fn ino(path: &Path) -> u64 {
        std::fs::metadata(path).unwrap().ino()
    }

    #[test]
    fn add_registers_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let passwd = dir.path().join("passwd");
        std::fs::write(&passwd, "root:x:0:0::/root:/bin/sh\n").unwrap();
        let (probe, table) = table();

        let key = table.add(&passwd).unwrap();
        assert_eq!(key, ino(&passwd));
        assert_eq!(table.resolve(key), Some(passwd.clone()));
        assert_eq!(table.count(), 1);
        assert_eq!(probe.updates(), vec![(key, WATCH_FLAG)]);

        // overwrite, not a duplicate
        table.add(&passwd).unwrap();
        assert_eq!(table.count(), 1);
        assert!(probe.deletes().is_empty());
    }

    #[test]
    fn add_missing_file_is_lookup_error() {
        let dir = tempfile::tempdir().unwrap();
        let (probe, table) = table();
        let err = table.add(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, FimError::Lookup { .. }));
        assert!(probe.updates().is_empty());
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn remove_unknown_path_is_not_found() {
        let (_, table) = table();
        let err = table.remove(Path::new("/etc/never-added")).unwrap_err();
        assert!(matches!(err, FimError::NotFound(_)));
    }

    #[test]
    fn remove_clears_both_views_even_if_kernel_fails() {
        let dir = tempfile::tempdir().unwrap();
        let shadow = dir.path().join("shadow");
        std::fs::write(&shadow, "").unwrap();
        let (probe, table) = table();
        let key = table.add(&shadow).unwrap();

        probe.fail_deletes(true);
        assert!(matches!(table.remove(&shadow), Err(FimError::KernelOp { .. })));
        assert_eq!(table.resolve(key), None);
        assert_eq!(table.count(), 0);

        probe.fail_deletes(false);
        table.add(&shadow).unwrap();
        assert_eq!(table.resolve(key), Some(shadow));
    }

    #[test]
    fn views_stay_consistent_across_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let files = (0..4)
            .map(|i| {
                let path = dir.path().join(format!("f{i}"));
                std::fs::write(&path, "x").unwrap();
                path
            })
            .collect::<Vec<_>>();
        let (_, table) = table();
        for (step, path) in files.iter().cycle().take(12).enumerate() {
            if step % 3 == 2 {
                let _ = table.remove(path);
            } else {
                table.add(path).unwrap();
            }
            let views = table.views.lock();
            assert!(views.consistent());
        }
        for path in &files {
            let key = ino(path);
            let _ = table.remove(path);
            assert_eq!(table.resolve(key), None);
        }
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn replaced_file_releases_old_inode() {
        let dir = tempfile::tempdir().unwrap();
        let passwd = dir.path().join("passwd");
        std::fs::write(&passwd, "a").unwrap();
        let (probe, table) = table();
        let old = table.add(&passwd).unwrap();

        // rename-over, like vipw does
        let staged = dir.path().join("passwd.new");
        std::fs::write(&staged, "b").unwrap();
        std::fs::rename(&staged, &passwd).unwrap();
        let new = table.add(&passwd).unwrap();

        assert_ne!(old, new);
        assert_eq!(probe.deletes(), vec![old]);
        assert_eq!(table.resolve(old), None);
        assert_eq!(table.resolve(new), Some(passwd));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn purge_stale_skips_claimed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let group = dir.path().join("group");
        std::fs::write(&group, "").unwrap();
        let (probe, table) = table();
        let key = table.add(&group).unwrap();

        assert!(!table.purge_stale(key).unwrap());
        assert!(probe.deletes().is_empty());
        assert!(table.purge_stale(key + 1).unwrap());
        assert_eq!(probe.deletes(), vec![key + 1]);
    }

    #[test]
    fn drain_returns_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let (_, table) = table();
        let mut keys = Vec::new();
        for name in ["a", "b"] {
            let path = dir.path().join(name);
            std::fs::write(&path, "").unwrap();
            keys.push(table.add(&path).unwrap());
        }
        let mut drained = table.drain();
        drained.sort_unstable();
        keys.sort_unstable();
        assert_eq!(drained, keys);
        assert_eq!(table.count(), 0);
    }
}
