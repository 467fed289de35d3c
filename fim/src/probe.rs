use std::path::Path;

use anyhow::Context;
use aya::maps::{AsyncPerfEventArray, HashMap, MapData};
use aya::programs::KProbe;
use aya::util::online_cpus;
use aya::Ebpf;
use aya_log::EbpfLogger;
use bytes::{Bytes, BytesMut};
use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fim_common::{RawEvent, RuleKey, EVENTS_MAP, RULES_MAP};

use crate::error::FimError;

/// What the daemon needs from the loaded kernel probe.
///
/// Keys always cross this boundary in their encoded form (see
/// [`fim_common::encode_key`]).
pub trait KernelProbe: Send + Sync + 'static {
    fn update_rule(&self, key: RuleKey, flag: i32) -> Result<(), FimError>;

    fn delete_rule(&self, key: RuleKey) -> Result<(), FimError>;

    /// Starts delivering raw records and lost-record counts until `shutdown`
    /// fires or [`KernelProbe::poll_stop`] is called.
    fn poll_start(
        &self,
        records: mpsc::Sender<Bytes>,
        missed: mpsc::Sender<u64>,
        shutdown: CancellationToken,
    ) -> Result<(), FimError>;

    fn poll_stop(&self);

    fn close(&self) -> Result<(), FimError>;
}

/// kprobe program name in the object -> kernel function it attaches to
const PROBES: [(&str, &str); 2] = [("pvfs_write", "vfs_write"), ("pvfs_rename", "vfs_rename")];

/// Records buffered per cpu per read.
const READ_BATCH: usize = 10;

pub struct AyaProbe {
    ebpf: Mutex<Option<Ebpf>>,
    rules: Mutex<HashMap<MapData, RuleKey, i32>>,
    events: Mutex<Option<AsyncPerfEventArray<MapData>>>,
    polling: CancellationToken,
}

impl AyaProbe {
    /// Loads the probe object, attaches its kprobes and takes ownership of the
    /// rules table and the event array.
    pub fn load(object: &Path) -> anyhow::Result<Self> {
        let mut ebpf = Ebpf::load_file(object)
            .with_context(|| format!("loading probe object {}", object.display()))?;
        if let Err(e) = EbpfLogger::init(&mut ebpf) {
            // This can happen if the probe carries no log statements.
            warn!("failed to initialize eBPF logger: {}", e);
        }
        for (name, function) in PROBES {
            let program: &mut KProbe = ebpf
                .program_mut(name)
                .with_context(|| format!("probe object has no program {name}"))?
                .try_into()?;
            program.load()?;
            program.attach(function, 0)?;
            debug!("attached {} to {}", name, function);
        }
        let rules = HashMap::try_from(
            ebpf.take_map(RULES_MAP)
                .with_context(|| format!("probe object has no map {RULES_MAP}"))?,
        )?;
        let events = AsyncPerfEventArray::try_from(
            ebpf.take_map(EVENTS_MAP)
                .with_context(|| format!("probe object has no map {EVENTS_MAP}"))?,
        )?;
        Ok(Self {
            ebpf: Mutex::new(Some(ebpf)),
            rules: Mutex::new(rules),
            events: Mutex::new(Some(events)),
            polling: CancellationToken::new(),
        })
    }
}

impl KernelProbe for AyaProbe {
    fn update_rule(&self, key: RuleKey, flag: i32) -> Result<(), FimError> {
        self.rules
            .lock()
            .insert(key, flag, 0)
            .map_err(|e| FimError::kernel("update", u64::from_le_bytes(key), e))
    }

    fn delete_rule(&self, key: RuleKey) -> Result<(), FimError> {
        self.rules
            .lock()
            .remove(&key)
            .map_err(|e| FimError::kernel("delete", u64::from_le_bytes(key), e))
    }

    fn poll_start(
        &self,
        records: mpsc::Sender<Bytes>,
        missed: mpsc::Sender<u64>,
        shutdown: CancellationToken,
    ) -> Result<(), FimError> {
        let mut array = self.events.lock().take().ok_or_else(|| {
            FimError::kernel("poll", 0, "event array already polled")
        })?;
        let cpus = online_cpus().map_err(|(msg, err)| {
            FimError::kernel("poll", 0, format!("{msg}: {err}"))
        })?;
        for cpu in cpus {
            let mut buf = array
                .open(cpu, None)
                .map_err(|e| FimError::kernel("poll", 0, e))?;
            let records = records.clone();
            let missed = missed.clone();
            let shutdown = shutdown.clone();
            let polling = self.polling.clone();
            tokio::task::spawn(async move {
                let mut buffers = vec![BytesMut::with_capacity(RawEvent::SIZE); READ_BATCH];
                loop {
                    let events = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = polling.cancelled() => break,
                        events = buf.read_events(&mut buffers) => events,
                    };
                    match events {
                        Ok(events) => {
                            if events.lost > 0 && missed.send(events.lost as u64).await.is_err() {
                                break;
                            }
                            for data in &buffers[..events.read] {
                                if records.send(Bytes::copy_from_slice(data)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => error!("failed to fetch events on cpu {}: {}", cpu, err),
                    }
                }
                debug!("perf reader on cpu {} stopped", cpu);
            });
        }
        Ok(())
    }

    fn poll_stop(&self) {
        self.polling.cancel();
    }

    fn close(&self) -> Result<(), FimError> {
        // dropping the handle detaches the kprobes and releases the maps
        self.ebpf.lock().take();
        Ok(())
    }
}
