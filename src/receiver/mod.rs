//! Receiving side: one process per (topic, partition), reassembling the
//! broker stream into files on disk.

pub mod bucket;
pub mod mirror;
pub mod offset;

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use rdkafka::{
    config::ClientConfig,
    consumer::{BaseConsumer, Consumer},
    error::KafkaError,
    message::Message,
    topic_partition_list::{Offset, TopicPartitionList},
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, error, info, warn};

use crate::script::ScriptError;

use self::offset::ConsumerOffset;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum ReceiveError {
    #[snafu(display("{}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("consumer: {source}"))]
    Client { source: KafkaError },

    #[snafu(display("{host}: position gap, expected {expected} got {got}"))]
    Gap {
        host: String,
        expected: u64,
        got: u64,
    },

    #[snafu(display("finished file {} already exists", path.display()))]
    FinishExists { path: PathBuf },

    #[snafu(display("{detail}"))]
    Invalid { detail: String },

    #[snafu(display("{source}"))]
    Script { source: ScriptError },
}

/// What a writer wants done with the durable consumer offset after a
/// message or a timeout. `Local` commits cover flushed batches inside a
/// rotation; `Global` marks a rotation or bucket boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ignore,
    Local(i64),
    Global(i64),
}

/// One partition's reassembly state machine (mirror or bucket).
pub trait PartitionWriter {
    /// Handle one message; `offset` is the broker offset.
    fn write(&mut self, offset: i64, payload: &[u8]) -> Result<Disposition, ReceiveError>;

    /// Poll timeout housekeeping (bucket finalisation deadlines).
    fn on_timeout(&mut self) -> Result<Disposition, ReceiveError>;

    /// Cooperative shutdown: flush and report the final commit point.
    fn on_shutdown(&mut self) -> Result<Disposition, ReceiveError>;
}

#[derive(Debug, Clone)]
pub struct ReceiverOpts {
    pub brokers: String,
    pub topic: String,
    pub partition: i32,
    /// Where to start when no offset file exists.
    pub from_beginning: bool,
    pub datadir: PathBuf,
}

/// Consume the partition until `stop`, driving the writer and the offset
/// file. Order anomalies and output I/O failures abort the worker so the
/// supervisor layer can alarm.
pub fn run(
    opts: &ReceiverOpts,
    writer: &mut dyn PartitionWriter,
    stop: &AtomicBool,
) -> Result<(), ReceiveError> {
    let offset_path = opts
        .datadir
        .join(format!("{}.{}.offset", opts.topic, opts.partition));
    let mut offsets = ConsumerOffset::open(&offset_path).context(IoSnafu { path: &offset_path })?;

    let consumer: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", &opts.brokers)
        .set("group.id", format!("logship-receive-{}-{}", opts.topic, opts.partition))
        .set("enable.auto.commit", "false")
        .create()
        .context(ClientSnafu)?;

    let start = match offsets.get() {
        Some(next) => Offset::Offset(next),
        None if opts.from_beginning => Offset::Beginning,
        None => Offset::End,
    };
    info!(message = "consuming", topic = %opts.topic, partition = opts.partition, ?start);

    let mut assignment = TopicPartitionList::new();
    assignment
        .add_partition_offset(&opts.topic, opts.partition, start)
        .context(ClientSnafu)?;
    consumer.assign(&assignment).context(ClientSnafu)?;

    while !stop.load(Ordering::SeqCst) {
        match consumer.poll(POLL_TIMEOUT) {
            None => {
                debug!(message = "poll timeout", topic = %opts.topic, partition = opts.partition);
                let disposition = writer.on_timeout()?;
                apply(&mut offsets, &offset_path, disposition)?;
            }
            Some(Err(error)) => {
                warn!(message = "consume error", topic = %opts.topic,
                      partition = opts.partition, %error);
            }
            Some(Ok(message)) => {
                let payload = message.payload().unwrap_or_default();
                let disposition = writer.write(message.offset(), payload)?;
                apply(&mut offsets, &offset_path, disposition)?;
            }
        }
    }

    let disposition = writer.on_shutdown()?;
    apply(&mut offsets, &offset_path, disposition)?;
    info!(message = "receiver exiting", topic = %opts.topic, partition = opts.partition);
    Ok(())
}

fn apply(
    offsets: &mut ConsumerOffset,
    path: &Path,
    disposition: Disposition,
) -> Result<(), ReceiveError> {
    match disposition {
        Disposition::Ignore => Ok(()),
        Disposition::Local(offset) | Disposition::Global(offset) => {
            // Store the next offset to consume, so a restart resumes
            // exactly after the covered message.
            offsets.update(offset + 1).context(IoSnafu { path })
        }
    }
}

/// Exclusive per-partition lock at `<datadir>/<topic>.<partition>.lock`.
pub fn acquire_lock(opts: &ReceiverOpts) -> Result<crate::supervisor::PidFile, ReceiveError> {
    let path = opts
        .datadir
        .join(format!("{}.{}.lock", opts.topic, opts.partition));
    crate::supervisor::PidFile::acquire(&path).map_err(|error| {
        error!(message = "lock unavailable", path = %path.display(), %error);
        ReceiveError::Invalid {
            detail: format!("another consumer holds {}", path.display()),
        }
    })
}
