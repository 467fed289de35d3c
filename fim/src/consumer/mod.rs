//! Generic load -> parse -> diff -> notify -> save -> commit lifecycle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::error::FimError;
use crate::event::Event;
use crate::store::Store;

pub mod access;
pub mod users;

/// Actor reported for drift found while starting up.
pub const INIT_ACTOR: &str = "baseInit";

/// Outcome of committing `next` over `current`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Committed,
    /// The set of files this consumer needs watched has changed.
    CommittedNeedsReload,
}

/// One watched data shape: a `current` snapshot that was committed and a
/// `next` snapshot filled in by `parse`.
pub trait State: Send + 'static {
    /// Reads the on-disk sources into `next`. Never touches `current`.
    fn parse(&mut self) -> Result<(), FimError>;
    fn changed(&self) -> bool;
    /// `current` is empty, i.e. nothing has been observed before.
    fn created(&self) -> bool;
    fn notify(&self, actor: &str);
    /// Commits `next` over `current`.
    fn teardown(&mut self) -> Commit;
    fn save(&self, store: &dyn Store) -> Result<(), FimError>;
    fn load(&mut self, store: &dyn Store) -> Result<(), FimError>;
    /// Files to watch, derived from `current`.
    fn register(&self) -> Vec<PathBuf>;
}

pub type Routes = HashMap<PathBuf, Arc<dyn Consumer>>;

/// What the dispatcher drives.
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    fn consume(&self, event: &Event) -> Result<Commit, FimError>;

    /// Maps every path this consumer cares about to its owner.
    fn register(self: Arc<Self>) -> Routes;
}

pub struct BaseConsumer<S> {
    name: &'static str,
    store: Arc<dyn Store>,
    state: Mutex<S>,
}

impl<S: State> BaseConsumer<S> {
    pub fn new(name: &'static str, state: S, store: Arc<dyn Store>) -> Self {
        Self {
            name,
            store,
            state: Mutex::new(state),
        }
    }

    /// Establishes the baseline. Any error here means the daemon must not run.
    pub fn init(&self) -> Result<(), FimError> {
        let mut state = self.state.lock();
        state.load(&*self.store)?;
        state.parse()?;
        if !state.created() && state.changed() {
            state.notify(INIT_ACTOR);
        }
        state.save(&*self.store)?;
        if state.teardown() == Commit::CommittedNeedsReload {
            debug!("{}: watch set established", self.name);
        }
        Ok(())
    }
}

impl<S: State> Consumer for BaseConsumer<S> {
    fn name(&self) -> &str {
        self.name
    }

    fn consume(&self, event: &Event) -> Result<Commit, FimError> {
        let mut state = self.state.lock();
        state.parse()?;
        if !state.changed() {
            return Ok(state.teardown());
        }
        state.notify(&event.comm);
        state.save(&*self.store)?;
        Ok(state.teardown())
    }

    fn register(self: Arc<Self>) -> Routes {
        let paths = self.state.lock().register();
        paths
            .into_iter()
            .map(|path| (path, self.clone() as Arc<dyn Consumer>))
            .collect()
    }
}
