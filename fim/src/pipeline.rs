//! Kernel ring -> decoded, resolved [`Event`]s.
//!
//! [`Pipeline::start`] moves from starting to polling: it hands the probe the
//! raw record and lost-count channels and spawns one loop for each.
//! [`Pipeline::stop`] consumes the pipeline, so it can only happen once.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fim_common::{encode_key, RawEvent};

use crate::error::FimError;
use crate::event::Event;
use crate::probe::KernelProbe;
use crate::process::CommandLine;
use crate::watch_table::WatchTable;

/// Capacity of every pipeline channel.
pub const CHAN_SIZE: usize = 10;

/// Error channel that never blocks: when it is full the error is dropped.
#[derive(Clone)]
pub struct ErrorSink(mpsc::Sender<FimError>);

impl ErrorSink {
    pub fn new(tx: mpsc::Sender<FimError>) -> Self {
        Self(tx)
    }

    pub fn report(&self, err: FimError) {
        if let Err(dropped) = self.0.try_send(err) {
            debug!("error channel congested, dropping: {}", dropped.into_inner());
        }
    }
}

/// Receiving ends handed to whoever dispatches events.
pub struct Outputs {
    pub events: mpsc::Receiver<Event>,
    pub errors: mpsc::Receiver<FimError>,
}

pub struct Pipeline {
    table: Arc<WatchTable>,
    probe: Arc<dyn KernelProbe>,
    events: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Must be called from within a tokio runtime.
    pub fn start(
        probe: Arc<dyn KernelProbe>,
        cmdline: Arc<dyn CommandLine>,
    ) -> Result<(Self, Outputs), FimError> {
        let (event_tx, event_rx) = mpsc::channel(CHAN_SIZE);
        let (error_tx, error_rx) = mpsc::channel(CHAN_SIZE);
        let (record_tx, record_rx) = mpsc::channel(CHAN_SIZE);
        let (missed_tx, missed_rx) = mpsc::channel(CHAN_SIZE);
        let shutdown = CancellationToken::new();
        let table = Arc::new(WatchTable::new(probe.clone()));
        let errors = ErrorSink::new(error_tx);

        probe.poll_start(record_tx, missed_tx, shutdown.child_token())?;
        debug!("polling started");

        let decoder = Decoder {
            table: table.clone(),
            cmdline,
            events: event_tx.clone(),
            errors: errors.clone(),
            shutdown: shutdown.clone(),
        };
        let tasks = vec![
            tokio::spawn(decoder.run(record_rx)),
            tokio::spawn(watch_missed(missed_rx, errors, shutdown.clone())),
        ];
        let pipeline = Self {
            table,
            probe,
            events: event_tx,
            shutdown,
            tasks,
        };
        Ok((
            pipeline,
            Outputs {
                events: event_rx,
                errors: error_rx,
            },
        ))
    }

    pub fn table(&self) -> Arc<WatchTable> {
        self.table.clone()
    }

    /// The shared output channel, for producers of synthetic events.
    pub fn events(&self) -> mpsc::Sender<Event> {
        self.events.clone()
    }

    /// Broadcast shutdown signal; fires when `stop` is called.
    pub fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> String {
        format!("Currently watching {} files", self.table.count())
    }

    /// Stops both loops, unregisters every watched key and closes the probe.
    pub async fn stop(self) -> Result<(), FimError> {
        self.probe.poll_stop();
        self.shutdown.cancel();
        debug!("polling stopped");
        for task in self.tasks {
            if let Err(err) = task.await {
                error!("pipeline loop failed: {}", err);
            }
        }
        for key in self.table.drain() {
            match self.probe.delete_rule(encode_key(key)) {
                Ok(()) => debug!("key removed: {}", key),
                Err(err) => error!("error removing key {}: {}", key, err),
            }
        }
        debug!("closing probe");
        self.probe.close()
    }
}

struct Decoder {
    table: Arc<WatchTable>,
    cmdline: Arc<dyn CommandLine>,
    events: mpsc::Sender<Event>,
    errors: ErrorSink,
    shutdown: CancellationToken,
}

impl Decoder {
    async fn run(self, mut records: mpsc::Receiver<Bytes>) {
        loop {
            let data = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                data = records.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
            };
            self.process(&data).await;
        }
        debug!("decode loop stopped");
    }

    async fn process(&self, data: &[u8]) {
        let raw = match RawEvent::decode(data) {
            Ok(raw) => raw,
            Err(err) => {
                self.errors.report(err.into());
                return;
            }
        };
        debug!("message from ebpf: {:?}", raw);

        let Some(path) = self.table.resolve(raw.inode) else {
            match self.table.purge_stale(raw.inode) {
                Ok(true) => self.errors.report(FimError::StaleKey(raw.inode)),
                Ok(false) => debug!("key {} was re-added while resolving", raw.inode),
                Err(err) => self.errors.report(err),
            }
            return;
        };

        let comm = self
            .cmdline
            .cmdline(raw.pid)
            .unwrap_or_else(|| String::from_utf8_lossy(raw.comm()).into_owned());
        let event = Event::from_raw(&raw, comm, path);

        // Blocks while the consumer side is behind; only shutdown cuts it short.
        tokio::select! {
            biased;
            sent = self.events.send(event) => {
                if sent.is_err() {
                    debug!("event receiver dropped");
                }
            }
            _ = self.shutdown.cancelled() => debug!("shutdown while delivering event"),
        }
    }
}

async fn watch_missed(
    mut missed: mpsc::Receiver<u64>,
    errors: ErrorSink,
    shutdown: CancellationToken,
) {
    loop {
        let count = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            count = missed.recv() => match count {
                Some(count) => count,
                None => break,
            },
        };
        if count > 0 {
            debug!("missed {} events", count);
            errors.report(FimError::EventsLost(count));
        }
    }
    debug!("missed-count loop stopped");
}
