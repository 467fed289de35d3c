//! Routes resolved events to the consumer that owns the path and keeps the
//! kernel watch set in line with what the consumers ask for.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fim_common::EventMode;

use crate::consumer::{Commit, Consumer, Routes};
use crate::error::FimError;
use crate::event::Event;
use crate::pipeline::{Outputs, Pipeline};
use crate::watch_gap::FileMissing;
use crate::watch_table::WatchTable;

pub struct Dispatcher {
    consumers: Vec<Arc<dyn Consumer>>,
    routes: Routes,
    gaps: HashMap<PathBuf, Arc<FileMissing>>,
    table: Arc<WatchTable>,
    events: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        pipeline: &Pipeline,
        consumers: Vec<Arc<dyn Consumer>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            consumers,
            routes: Routes::new(),
            gaps: HashMap::new(),
            table: pipeline.table(),
            events: pipeline.events(),
            shutdown: pipeline.shutdown(),
            poll_interval,
        }
    }

    /// Recomputes the routes and brings the watch table in line with them.
    /// Paths that cannot be looked up are handed to a [`FileMissing`] poller.
    pub fn reload(&mut self) {
        let mut routes = Routes::new();
        let mut gaps = HashMap::new();
        for consumer in &self.consumers {
            for (path, owner) in consumer.clone().register() {
                match self.table.add(&path) {
                    Ok(_) => {
                        routes.insert(path, owner);
                    }
                    Err(FimError::Lookup { .. }) => {
                        let gap = match self.gaps.remove(&path) {
                            Some(gap) if gap.is_polling() => gap,
                            _ => FileMissing::spawn_every(
                                path.clone(),
                                owner,
                                self.events.clone(),
                                self.shutdown.child_token(),
                                self.poll_interval,
                            ),
                        };
                        gaps.insert(path.clone(), gap.clone());
                        routes.insert(path, gap as Arc<dyn Consumer>);
                    }
                    Err(err) => {
                        error!("error watching {}: {}", path.display(), err);
                        routes.insert(path, owner);
                    }
                }
            }
        }

        for (path, gap) in self.gaps.drain() {
            debug!("{} no longer missing", path.display());
            gap.cancel();
        }
        self.gaps = gaps;

        for path in self.table.paths() {
            if routes.contains_key(&path) && !self.gaps.contains_key(&path) {
                continue;
            }
            match self.table.remove(&path) {
                Ok(()) => debug!("stopped watching {}", path.display()),
                Err(err) => warn!("error unwatching {}: {}", path.display(), err),
            }
        }
        self.routes = routes;
        info!("Currently watching {} files", self.table.count());
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    pub fn missing(&self) -> Vec<PathBuf> {
        self.gaps.keys().cloned().collect()
    }

    /// Runs until shutdown or until the event channel closes.
    pub async fn run(&mut self, mut outputs: Outputs) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(err) = outputs.errors.recv() => warn!("{}", err),
                event = outputs.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
        for gap in self.gaps.values() {
            gap.cancel();
        }
        debug!("dispatcher stopped");
    }

    pub async fn handle(&mut self, event: Event) {
        info!("{}", event);
        let Some(consumer) = self.routes.get(&event.path).cloned() else {
            debug!("no consumer for {}", event.path.display());
            return;
        };
        // a rename or a newly found file leaves the watched inode behind
        let mut reload = matches!(event.kind(), Some(EventMode::Rename | EventMode::Found));

        let name = consumer.name().to_string();
        match tokio::task::spawn_blocking(move || consumer.consume(&event)).await {
            Ok(Ok(Commit::Committed)) => {}
            Ok(Ok(Commit::CommittedNeedsReload)) => reload = true,
            Ok(Err(err)) => error!("{} failed to handle event: {}", name, err),
            Err(err) => error!("{} consumer task failed: {}", name, err),
        }
        if reload {
            self.reload();
        }
    }
}
