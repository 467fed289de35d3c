//! Stand-in owner for a watched path that does not exist yet.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::consumer::{Commit, Consumer, Routes};
use crate::error::FimError;
use crate::event::Event;

pub const POLLING_DURATION: Duration = Duration::from_secs(10);

/// Polls for `path` and announces it with a single [`Event::found`]. Until
/// then it stands in for the real consumer in the routing table.
pub struct FileMissing {
    path: PathBuf,
    consumer: Arc<dyn Consumer>,
    task: JoinHandle<()>,
}

impl FileMissing {
    pub fn spawn(
        path: PathBuf,
        consumer: Arc<dyn Consumer>,
        events: mpsc::Sender<Event>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Self::spawn_every(path, consumer, events, shutdown, POLLING_DURATION)
    }

    pub fn spawn_every(
        path: PathBuf,
        consumer: Arc<dyn Consumer>,
        events: mpsc::Sender<Event>,
        shutdown: CancellationToken,
        period: Duration,
    ) -> Arc<Self> {
        debug!("{} is missing, polling every {:?}", path.display(), period);
        let task = tokio::spawn(poll(path.clone(), events, shutdown, period));
        Arc::new(Self {
            path,
            consumer,
            task,
        })
    }

    pub fn is_polling(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

async fn poll(
    path: PathBuf,
    events: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    period: Duration,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("stop polling {}", path.display());
                return;
            }
            _ = ticker.tick() => {}
        }
        if !path.exists() {
            continue;
        }
        debug!("{} appeared", path.display());
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {}
            sent = events.send(Event::found(path.clone())) => {
                if sent.is_err() {
                    debug!("event receiver dropped");
                }
            }
        }
        return;
    }
}

impl Consumer for FileMissing {
    fn name(&self) -> &str {
        self.consumer.name()
    }

    fn consume(&self, event: &Event) -> Result<Commit, FimError> {
        self.consumer.consume(event)
    }

    fn register(self: Arc<Self>) -> Routes {
        if self.path.exists() {
            return self.consumer.clone().register();
        }
        let path = self.path.clone();
        Routes::from([(path, self as Arc<dyn Consumer>)])
    }
}
