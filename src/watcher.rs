//! The single-threaded event pump that owns every reader.
//!
//! Filesystem notifications plus a short wait timeout drive tail passes;
//! the timeout doubles as the housekeeping cadence for aggregate
//! deadlines, rotation commits and re-opens of replaced files.

use std::{
    collections::HashMap,
    path::PathBuf,
    rc::Rc,
    sync::{mpsc as std_mpsc, Arc},
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use notify::{
    event::{EventKind, ModifyKind},
    Event, RecommendedWatcher, RecursiveMode, Watcher,
};
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    checkpoints::OffsetRecord,
    config::Config,
    pingback::Pingback,
    reader::{DeliveryCounters, FileReader, ReaderError},
    record::RecordBatch,
    script::{ScriptError, ScriptHost},
    shared::{RunStatus, Shared},
    transform::Pipeline,
};

const WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const HOUSEKEEPING_EVERY: Duration = Duration::from_secs(1);
/// An aggregation bucket whose timestamp stops advancing is flushed
/// after sitting this long.
const AGGREGATE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum WatchError {
    #[snafu(display("filesystem watcher: {source}"))]
    Notify { source: notify::Error },

    #[snafu(display("{source}"))]
    Reader { source: ReaderError },

    #[snafu(display("{source}"))]
    Script { source: ScriptError },
}

/// What the rest of the worker needs from a built watch loop: the offset
/// table rows in spec order and each spec's delivery counters.
pub struct WatchHandles {
    pub initial_offsets: Vec<OffsetRecord>,
    pub counters: Vec<Arc<DeliveryCounters>>,
}

pub struct WatchLoop {
    /// Primary readers; fan-out successors live inside their primary.
    readers: Vec<FileReader>,
    watcher: RecommendedWatcher,
    events: std_mpsc::Receiver<notify::Result<Event>>,
    /// Watched path -> index into `readers`.
    by_path: IndexMap<PathBuf, usize>,
    shared: Arc<Shared>,
    tx: mpsc::Sender<RecordBatch>,
    rotate_delay: Duration,
    poll_limit: Duration,
    pingback: Pingback,
}

impl WatchLoop {
    /// Open every reader and arm the watches. Runs on (and never leaves)
    /// the watch thread: reader state and the script hosts stay
    /// thread-local.
    pub fn build(
        config: &Config,
        shared: Arc<Shared>,
        tx: mpsc::Sender<RecordBatch>,
        saved: &HashMap<u64, u64>,
        pingback: Pingback,
    ) -> Result<(WatchLoop, WatchHandles), WatchError> {
        let host: Arc<str> = Arc::from(config.host.as_str());

        // First spec for a path is the primary; later ones chain onto it.
        let mut readers: Vec<FileReader> = Vec::new();
        let mut primary_for: HashMap<PathBuf, usize> = HashMap::new();
        for (spec_idx, spec) in config.specs.iter().enumerate() {
            let script = match &spec.script {
                Some(path) if spec.needs_script() => {
                    let script = ScriptHost::load(path).context(ScriptSnafu)?;
                    for name in [&spec.grep, &spec.transform, &spec.aggregate]
                        .into_iter()
                        .flatten()
                    {
                        script.require_function(name).context(ScriptSnafu)?;
                    }
                    Some(Rc::new(script))
                }
                _ => None,
            };
            let pipeline = Pipeline::new(spec, Arc::clone(&host), script);

            match primary_for.get(&spec.file) {
                Some(primary_idx) => {
                    let successor = FileReader::new(
                        spec_idx,
                        spec.clone(),
                        Arc::clone(&host),
                        pipeline.for_successor(),
                        true,
                    );
                    readers[*primary_idx].successors.push(successor);
                }
                None => {
                    let reader =
                        FileReader::new(spec_idx, spec.clone(), Arc::clone(&host), pipeline, false);
                    primary_for.insert(spec.file.clone(), readers.len());
                    readers.push(reader);
                }
            }
        }

        for reader in &mut readers {
            reader.open(saved).context(ReaderSnafu)?;
        }

        let (event_tx, events) = std_mpsc::channel();
        let mut watcher = notify::recommended_watcher(event_tx).context(NotifySnafu)?;
        let mut by_path = IndexMap::new();
        for (idx, reader) in readers.iter().enumerate() {
            watcher
                .watch(reader.path(), RecursiveMode::NonRecursive)
                .context(NotifySnafu)?;
            by_path.insert(reader.path().to_path_buf(), idx);
        }

        let spec_count = config.specs.len();
        let mut initial_offsets = vec![OffsetRecord { inode: 0, offset: 0 }; spec_count];
        let mut counters: Vec<Arc<DeliveryCounters>> =
            vec![Arc::new(DeliveryCounters::default()); spec_count];
        for reader in &readers {
            initial_offsets[reader.spec_idx] = OffsetRecord {
                inode: reader.inode(),
                offset: reader.position(),
            };
            counters[reader.spec_idx] = Arc::clone(&reader.counters);
            for successor in &reader.successors {
                initial_offsets[successor.spec_idx] = OffsetRecord {
                    inode: successor.inode(),
                    offset: successor.position(),
                };
                counters[successor.spec_idx] = Arc::clone(&successor.counters);
            }
        }

        let watch_loop = WatchLoop {
            readers,
            watcher,
            events,
            by_path,
            shared,
            tx,
            rotate_delay: Duration::from_secs(config.main.rotatedelay),
            poll_limit: Duration::from_millis(config.main.polllimit),
            pingback,
        };
        Ok((
            watch_loop,
            WatchHandles {
                initial_offsets,
                counters,
            },
        ))
    }

    /// Run until STOP. Consumes the loop; dropping it closes the sender
    /// queue, which lets the producer drain and finish.
    pub fn run(mut self) {
        // Catch up whatever appeared between the saved offsets and now.
        for idx in 0..self.readers.len() {
            self.tail_reader(idx);
        }

        let mut last_housekeeping = Instant::now();
        while self.shared.run_status() != RunStatus::Stop {
            match self.events.recv_timeout(WAIT_TIMEOUT) {
                Ok(Ok(event)) => self.dispatch(event),
                Ok(Err(error)) => warn!(message = "watch event error", %error),
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    self.housekeeping();
                    last_housekeeping = Instant::now();
                }
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    error!(message = "watcher channel closed, stopping");
                    break;
                }
            }

            if last_housekeeping.elapsed() >= HOUSEKEEPING_EVERY {
                self.housekeeping();
                last_housekeeping = Instant::now();
            }
            self.rotation_pass();

            if !self.poll_limit.is_zero() {
                std::thread::sleep(self.poll_limit);
            }
        }

        // Shutdown: whatever sits in aggregation caches goes out now.
        let shared = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        for reader in &mut self.readers {
            reader.flush_aggregates(&shared, &mut |batch| send_batch(&tx, batch));
        }
        info!(message = "watch loop exiting");
    }

    fn dispatch(&mut self, event: Event) {
        let moved = matches!(
            event.kind,
            EventKind::Modify(ModifyKind::Name(_)) | EventKind::Remove(_)
        );
        for path in &event.paths {
            let Some(idx) = self.by_path.get(path).copied() else {
                continue;
            };
            if moved {
                self.readers[idx].flag_moved();
            } else {
                debug!(message = "modify", path = %path.display());
                self.tail_reader(idx);
            }
        }
    }

    fn tail_reader(&mut self, idx: usize) {
        let shared = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        let reader = &mut self.readers[idx];
        match reader.tail(&shared, &mut |batch| send_batch(&tx, batch)) {
            Ok(_) => {}
            Err(error) => {
                error!(message = "tail pass failed", path = %reader.path().display(), %error);
            }
        }
        if tx.is_closed() {
            self.shared.set_run_status(RunStatus::Stop);
        }
    }

    fn housekeeping(&mut self) {
        for idx in 0..self.readers.len() {
            let shared = Arc::clone(&self.shared);
            let tx = self.tx.clone();
            let pingback = self.pingback.clone();

            let needs_catch_up = {
                let reader = &mut self.readers[idx];
                if reader.aggregate_flush_due(AGGREGATE_DEADLINE) {
                    reader.flush_aggregates(&shared, &mut |batch| send_batch(&tx, batch));
                }
                if let Some(new_path) = reader.time_format_path_changed() {
                    reader.flag_created(&new_path);
                    pingback.send(
                        "TAG_ROTATE",
                        &[
                            ("new", new_path.display().to_string()),
                            ("old", reader.path().display().to_string()),
                        ],
                    );
                }
                reader.inspect_rotation();
                reader.is_open() && !reader.eof && !shared.flow_control_on()
            };

            // Catch up readers left short of EOF by flow control.
            if needs_catch_up {
                self.tail_reader(idx);
            }
        }
    }

    fn rotation_pass(&mut self) {
        for idx in 0..self.readers.len() {
            let shared = Arc::clone(&self.shared);
            let tx = self.tx.clone();

            if self.readers[idx].rotation_due(self.rotate_delay) {
                let old_path = self.readers[idx].path().to_path_buf();
                let _ = self.watcher.unwatch(&old_path);
                self.by_path.shift_remove(&old_path);

                let meta = self.readers[idx]
                    .commit_rotation(&shared, &mut |batch| send_batch(&tx, batch));
                if let Some(meta) = meta {
                    self.pingback.send(
                        "ROTATE",
                        &[
                            ("file", old_path.display().to_string()),
                            ("size", meta.size.unwrap_or(0).to_string()),
                            ("md5", meta.md5.unwrap_or_default()),
                        ],
                    );
                }
            }

            if self.readers[idx].awaiting_reopen {
                match self.readers[idx].reopen(&shared, &mut |batch| send_batch(&tx, batch)) {
                    Ok(true) => {
                        let new_path = self.readers[idx].path().to_path_buf();
                        if let Err(error) =
                            self.watcher.watch(&new_path, RecursiveMode::NonRecursive)
                        {
                            error!(message = "rewatch failed", path = %new_path.display(), %error);
                        }
                        self.by_path.insert(new_path, idx);
                        self.tail_reader(idx);
                    }
                    Ok(false) => {
                        // Replacement not there yet; housekeeping retries.
                    }
                    Err(error) => {
                        error!(message = "reopen failed",
                               path = %self.readers[idx].path().display(), %error);
                    }
                }
            }
        }
    }
}

fn send_batch(tx: &mpsc::Sender<RecordBatch>, batch: RecordBatch) {
    if tx.blocking_send(batch).is_err() {
        // Producer is gone; the run loop notices the closed channel.
        warn!(message = "sender queue closed, batch dropped");
    }
}
