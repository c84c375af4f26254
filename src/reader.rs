//! Per-spec reader: open-position policy, chunked tailing, framing,
//! rotation detection and the START/END markers, plus fan-out to
//! successor specs sharing the same path.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use bstr::ByteSlice;
use chrono::Local;
use md5::{Digest, Md5};
use snafu::{ResultExt, Snafu};
use tracing::{error, info, warn};

use crate::{
    buffer::LineBuffer,
    config::{FileSpec, StartFrom, MAX_LINE_BYTES, MAX_TAIL_BYTES},
    record::{encode_meta, Meta, MetaEvent, Record, RecordBatch},
    shared::{Shared, Stats},
    transform::Pipeline,
};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Snafu)]
pub enum ReaderError {
    #[snafu(display("unable to open {}: {source}", path.display()))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("unable to stat {}: {source}", path.display()))]
    Stat { path: PathBuf, source: io::Error },

    #[snafu(display("read of {} failed: {source}", path.display()))]
    ReadFile { path: PathBuf, source: io::Error },

    #[snafu(display("{}: line length exceeds the buffer, cannot align to end", path.display()))]
    LineTooLong { path: PathBuf },
}

/// Rotation evidence accumulated between housekeeping passes. Any set
/// flag arms the commit check.
#[derive(Debug, Default, Clone, Copy)]
pub struct RotateFlags {
    pub moved: bool,
    pub created: bool,
    pub deleted: bool,
    pub truncated: bool,
    pub inode_changed: bool,
}

impl RotateFlags {
    pub fn any(&self) -> bool {
        self.moved || self.created || self.deleted || self.truncated || self.inode_changed
    }
}

/// Delivery counters shared with the producer's acknowledgement path so
/// the END marker can report what actually reached the broker.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    pub sent_lines: AtomicU64,
    pub sent_bytes: AtomicU64,
}

impl DeliveryCounters {
    fn reset(&self) {
        self.sent_lines.store(0, Ordering::Relaxed);
        self.sent_bytes.store(0, Ordering::Relaxed);
    }
}

pub struct FileReader {
    pub spec_idx: usize,
    spec: FileSpec,
    host: Arc<str>,
    /// Currently-resolved path (strftime placeholders applied).
    path: PathBuf,
    file: Option<File>,
    inode: u64,
    /// Bytes of the current file consumed by framing.
    pos: u64,
    /// Lines framed from the current file.
    lines: u64,
    digest: Option<Md5>,
    buffer: LineBuffer,
    pub eof: bool,
    pub flags: RotateFlags,
    flagged_at: Option<Instant>,
    /// Set after a rotation commit until the replacement opens.
    pub awaiting_reopen: bool,
    pipeline: Pipeline,
    /// Dependent specs sharing this path. The primary performs all I/O
    /// and copies every fresh chunk into each successor's buffer, so all
    /// of them frame byte-identical input; only the transforms differ.
    pub successors: Vec<FileReader>,
    is_successor: bool,
    pub counters: Arc<DeliveryCounters>,
}

impl FileReader {
    pub fn new(
        spec_idx: usize,
        spec: FileSpec,
        host: Arc<str>,
        pipeline: Pipeline,
        is_successor: bool,
    ) -> FileReader {
        let path = resolve_path(&spec);
        FileReader {
            spec_idx,
            spec,
            host,
            path,
            file: None,
            inode: 0,
            pos: 0,
            lines: 0,
            digest: None,
            buffer: LineBuffer::new(0, MAX_LINE_BYTES),
            eof: false,
            flags: RotateFlags::default(),
            flagged_at: None,
            awaiting_reopen: false,
            pipeline,
            successors: Vec::new(),
            is_successor,
            counters: Arc::new(DeliveryCounters::default()),
        }
    }

    pub fn spec(&self) -> &FileSpec {
        &self.spec
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Open the source and resolve the start position from the policy and
    /// the saved offsets. Only primaries open files; successors are
    /// primed with the primary's identity afterwards.
    pub fn open(&mut self, saved: &std::collections::HashMap<u64, u64>) -> Result<(), ReaderError> {
        debug_assert!(!self.is_successor);

        self.path = resolve_path(&self.spec);
        let file = open_source(&self.path, self.spec.autocreat)?;
        let metadata = file.metadata().context(StatSnafu { path: &self.path })?;
        self.inode = metadata.ino();
        let size = metadata.len();
        self.file = Some(file);

        self.pos = match self.spec.startpos {
            StartFrom::Start => 0,
            StartFrom::LogStart => match saved.get(&self.inode) {
                Some(offset) if *offset <= size => *offset,
                _ => {
                    info!(message = "no usable saved offset, starting from the beginning",
                          path = %self.path.display());
                    0
                }
            },
            StartFrom::LogEnd => match saved.get(&self.inode) {
                Some(offset) if *offset <= size => *offset,
                _ => {
                    info!(message = "no usable saved offset, aligning to the end",
                          path = %self.path.display());
                    self.align_to_end(size)?
                }
            },
            StartFrom::End => self.align_to_end(size)?,
        };

        if let Some(file) = &mut self.file {
            file.seek(SeekFrom::Start(self.pos))
                .context(ReadFileSnafu { path: &self.path })?;
        }

        self.reset_file_state(self.pos);
        let (inode, pos) = (self.inode, self.pos);
        for successor in &mut self.successors {
            successor.attach(inode, pos);
        }

        info!(message = "tailing", path = %self.path.display(),
              inode = self.inode, position = self.pos);
        Ok(())
    }

    fn reset_file_state(&mut self, pos: u64) {
        self.lines = 0;
        self.eof = false;
        self.flags = RotateFlags::default();
        self.flagged_at = None;
        self.awaiting_reopen = false;
        self.buffer.reset(pos);
        self.digest = self.spec.md5sum.then(Md5::new);
        self.counters.reset();
    }

    /// Prime a successor with the primary's identity and position.
    fn attach(&mut self, inode: u64, pos: u64) {
        debug_assert!(self.is_successor);
        self.inode = inode;
        self.pos = pos;
        self.reset_file_state(pos);
    }

    /// Find the end-of-file position aligned back to the previous
    /// newline, scanning at most one buffer's worth of bytes.
    fn align_to_end(&mut self, size: u64) -> Result<u64, ReaderError> {
        if size == 0 {
            return Ok(0);
        }
        let file = self.file.as_mut().expect("open before align");
        let span = size.min(MAX_LINE_BYTES as u64);
        file.seek(SeekFrom::Start(size - span))
            .context(ReadFileSnafu { path: &self.path })?;
        let mut tail = vec![0u8; span as usize];
        file.read_exact(&mut tail)
            .context(ReadFileSnafu { path: &self.path })?;
        match tail.rfind_byte(b'\n') {
            Some(last_nl) => Ok(size - span + last_nl as u64 + 1),
            None => LineTooLongSnafu { path: &self.path }.fail(),
        }
    }

    /// Mark a move-self notification. The old descriptor keeps draining
    /// until EOF; the rotation commits after the rotate delay.
    pub fn flag_moved(&mut self) {
        if !self.flags.moved {
            info!(message = "file moved away, draining old descriptor",
                  path = %self.path.display());
        }
        self.flags.moved = true;
        self.flagged_at.get_or_insert_with(Instant::now);
    }

    pub fn flag_created(&mut self, new_path: &Path) {
        info!(message = "time-formatted path advanced", path = %self.path.display(),
              new_path = %new_path.display());
        self.flags.created = true;
        self.flagged_at.get_or_insert_with(Instant::now);
    }

    /// Time-formatted specs follow the clock: a change in the formatted
    /// path is a creation-rotation.
    pub fn time_format_path_changed(&self) -> Option<PathBuf> {
        if !self.spec.file_with_time_format {
            return None;
        }
        let resolved = resolve_path(&self.spec);
        (resolved != self.path).then_some(resolved)
    }

    /// Re-examine the open descriptor and path for rotation evidence:
    /// unlink, truncation, inode swap under the same name.
    pub fn inspect_rotation(&mut self) {
        let Some(file) = &self.file else { return };
        let Ok(metadata) = file.metadata() else {
            return;
        };
        if metadata.nlink() == 0 {
            self.flags.deleted = true;
        }
        if metadata.len() < self.pos {
            self.flags.truncated = true;
        }
        if let Ok(path_meta) = std::fs::metadata(&self.path) {
            if path_meta.ino() != self.inode {
                self.flags.inode_changed = true;
            }
        }
        if self.flags.any() {
            self.flagged_at.get_or_insert_with(Instant::now);
        }
    }

    /// Whether the accumulated evidence commits the rotation. Rename and
    /// creation rotations drain the old descriptor to EOF and then wait
    /// out the rotate delay; destructive rotations commit as soon as no
    /// more bytes can come.
    pub fn rotation_due(&self, rotate_delay: std::time::Duration) -> bool {
        if self.file.is_none() || !self.flags.any() {
            return false;
        }
        if self.flags.truncated {
            return true;
        }
        if !self.eof {
            return false;
        }
        if self.flags.deleted || self.flags.inode_changed {
            return true;
        }
        self.flagged_at
            .is_some_and(|at| at.elapsed() >= rotate_delay)
    }

    /// One tail pass: read every available byte (bounded by the tail
    /// cap), frame, transform, and emit batches. Returns whether EOF was
    /// reached.
    pub fn tail(
        &mut self,
        shared: &Shared,
        emit: &mut dyn FnMut(RecordBatch),
    ) -> Result<bool, ReaderError> {
        debug_assert!(!self.is_successor);
        if self.file.is_none() {
            return Ok(true);
        }

        let metadata = self
            .file
            .as_ref()
            .expect("checked above")
            .metadata()
            .context(StatSnafu { path: &self.path })?;
        let size = metadata.len();
        if size < self.pos {
            self.flags.truncated = true;
            self.flagged_at.get_or_insert_with(Instant::now);
            return Ok(false);
        }

        let limit = if size - self.pos > MAX_TAIL_BYTES {
            info!(message = "tail pass capped", path = %self.path.display(),
                  position = self.pos, size);
            shared.set_tail_limit(true);
            self.pos + MAX_TAIL_BYTES
        } else {
            size
        };

        self.eof = false;
        let mut consumed_to = self.buffer.consumed_to() + self.buffer.buffered() as u64;
        let mut chunk = vec![0u8; READ_CHUNK];

        while consumed_to < limit {
            if shared.flow_control_on() {
                // Producer is saturated; buffer state survives to the
                // next wakeup.
                return Ok(false);
            }

            let want = ((limit - consumed_to) as usize).min(READ_CHUNK);
            let n = self
                .file
                .as_mut()
                .expect("file open during tail")
                .read(&mut chunk[..want])
                .context(ReadFileSnafu { path: &self.path })?;
            if n == 0 {
                // The file shrank under us.
                self.flags.truncated = true;
                self.flagged_at.get_or_insert_with(Instant::now);
                return Ok(false);
            }
            consumed_to += n as u64;

            self.consume_chunk(&chunk[..n], shared, emit);
            for successor in &mut self.successors {
                successor.consume_chunk(&chunk[..n], shared, emit);
            }
        }

        if limit == size {
            self.eof = true;
        }
        Ok(self.eof)
    }

    /// Push one chunk through framing and the pipeline.
    fn consume_chunk(
        &mut self,
        chunk: &[u8],
        shared: &Shared,
        emit: &mut dyn FnMut(RecordBatch),
    ) {
        self.buffer.push(chunk);
        let result = self.buffer.drain(self.spec.rawcopy);

        let mut records = Vec::new();
        for frame in &result.frames {
            if let Some(digest) = &mut self.digest {
                digest.update(&frame.bytes);
                if frame.raw_len > frame.bytes.len() as u64 {
                    digest.update(b"\n");
                }
            }
            self.lines += 1;
            Stats::incr(&shared.stats.lines_read, 1);
            match self.pipeline.process(self.inode, frame) {
                Ok(out) => records.extend(out),
                Err(error) => {
                    Stats::incr(&shared.stats.lines_dropped, 1);
                    error!(message = "transform failed, line dropped",
                           path = %self.path.display(), %error);
                }
            }
        }
        if let Some(dropped) = &result.discarded {
            if let Some(digest) = &mut self.digest {
                digest.update(dropped);
            }
            Stats::incr(&shared.stats.lines_dropped, 1);
            warn!(message = "line exceeds buffer, content discarded",
                  path = %self.path.display(), dropped = dropped.len());
        }

        self.pos = self.buffer.consumed_to();
        if !records.is_empty() {
            Stats::incr(&shared.stats.records_queued, records.len() as u64);
            Stats::incr(&shared.stats.queue_depth, records.len() as u64);
            emit(RecordBatch {
                spec: self.spec_idx,
                records,
            });
        }
    }

    /// Flush the aggregation cache out of band (housekeeping deadline or
    /// shutdown). Applies to this reader and its successors.
    pub fn flush_aggregates(&mut self, shared: &Shared, emit: &mut dyn FnMut(RecordBatch)) {
        self.flush_own_aggregate(shared, emit);
        for successor in &mut self.successors {
            successor.flush_own_aggregate(shared, emit);
        }
    }

    fn flush_own_aggregate(&mut self, shared: &Shared, emit: &mut dyn FnMut(RecordBatch)) {
        let records = self.pipeline.flush(self.inode);
        if !records.is_empty() {
            Stats::incr(&shared.stats.records_queued, records.len() as u64);
            Stats::incr(&shared.stats.queue_depth, records.len() as u64);
            emit(RecordBatch {
                spec: self.spec_idx,
                records,
            });
        }
    }

    pub fn aggregate_flush_due(&self, deadline: std::time::Duration) -> bool {
        std::iter::once(self)
            .chain(self.successors.iter())
            .any(|reader| reader.pipeline.flush_due(deadline))
    }

    /// Commit the rotation: deliver any partial trailing line, emit END,
    /// close the descriptor and wait for the replacement. The digest is
    /// finalised exactly once, here. Returns the END marker for the
    /// caller's reporting.
    pub fn commit_rotation(
        &mut self,
        shared: &Shared,
        emit: &mut dyn FnMut(RecordBatch),
    ) -> Option<Meta> {
        debug_assert!(!self.is_successor);
        self.file.as_ref()?;

        self.drain_remainder(shared, emit);
        for successor in &mut self.successors {
            successor.drain_remainder(shared, emit);
        }

        let md5 = self.finalize_digest();
        let reported = self.rotated_name().unwrap_or_else(|| self.path.clone());
        let meta = Meta {
            event: MetaEvent::End,
            time: now_iso8601(),
            file: Some(reported.display().to_string()),
            size: Some(self.pos),
            sendsize: Some(self.counters.sent_bytes.load(Ordering::Relaxed)),
            lines: Some(self.lines),
            sendlines: Some(self.counters.sent_lines.load(Ordering::Relaxed)),
            md5: Some(md5.clone()),
        };
        info!(message = "rotation end", path = %self.path.display(), size = self.pos,
              lines = self.lines, md5 = %md5);
        self.emit_meta(&meta, shared, emit);

        self.file = None;
        self.eof = false;
        self.flags = RotateFlags::default();
        self.flagged_at = None;
        self.awaiting_reopen = true;
        Some(meta)
    }

    /// Open the replacement file after a rotation and emit START. Returns
    /// false while the replacement has not appeared yet.
    pub fn reopen(
        &mut self,
        shared: &Shared,
        emit: &mut dyn FnMut(RecordBatch),
    ) -> Result<bool, ReaderError> {
        debug_assert!(!self.is_successor);
        self.path = resolve_path(&self.spec);
        let file = match open_source(&self.path, self.spec.autocreat) {
            Ok(file) => file,
            Err(ReaderError::Open { source, .. })
                if source.kind() == io::ErrorKind::NotFound =>
            {
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let metadata = file.metadata().context(StatSnafu { path: &self.path })?;
        self.inode = metadata.ino();
        self.pos = 0;
        self.file = Some(file);
        self.reset_file_state(0);
        let inode = self.inode;
        for successor in &mut self.successors {
            successor.attach(inode, 0);
        }

        let meta = Meta::start(now_iso8601());
        info!(message = "rotation start", path = %self.path.display(), inode = self.inode);
        self.emit_meta(&meta, shared, emit);
        Ok(true)
    }

    fn drain_remainder(&mut self, shared: &Shared, emit: &mut dyn FnMut(RecordBatch)) {
        let Some(frame) = self.buffer.take_remainder() else {
            return;
        };
        if let Some(digest) = &mut self.digest {
            digest.update(&frame.bytes);
        }
        self.lines += 1;
        Stats::incr(&shared.stats.lines_read, 1);
        self.pos = self.buffer.consumed_to();
        match self.pipeline.process(self.inode, &frame) {
            Ok(records) if !records.is_empty() => {
                Stats::incr(&shared.stats.records_queued, records.len() as u64);
                Stats::incr(&shared.stats.queue_depth, records.len() as u64);
                emit(RecordBatch {
                    spec: self.spec_idx,
                    records,
                });
            }
            Ok(_) => {}
            Err(error) => {
                Stats::incr(&shared.stats.lines_dropped, 1);
                error!(message = "transform failed on trailing line",
                       path = %self.path.display(), %error);
            }
        }
    }

    /// META records go to every chained spec that carries the host tag.
    fn emit_meta(&self, meta: &Meta, shared: &Shared, emit: &mut dyn FnMut(RecordBatch)) {
        for reader in std::iter::once(self).chain(self.successors.iter()) {
            if !reader.spec.withhost {
                continue;
            }
            Stats::incr(&shared.stats.records_queued, 1);
            Stats::incr(&shared.stats.queue_depth, 1);
            emit(RecordBatch {
                spec: reader.spec_idx,
                records: vec![Record::meta(self.inode, encode_meta(&self.host, meta))],
            });
        }
    }

    /// After a rename rotation the END marker reports where the file
    /// went: the directory entry that still carries our inode.
    fn rotated_name(&self) -> Option<PathBuf> {
        if !self.flags.moved {
            return None;
        }
        let dir = self.path.parent()?;
        for entry in std::fs::read_dir(dir).ok()? {
            let entry = entry.ok()?;
            let metadata = entry.metadata().ok()?;
            if metadata.ino() == self.inode && entry.path() != self.path {
                return Some(entry.path());
            }
        }
        None
    }

    fn finalize_digest(&mut self) -> String {
        self.digest
            .take()
            .map(|digest| format!("{:x}", digest.finalize()))
            .unwrap_or_default()
    }
}

fn now_iso8601() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn resolve_path(spec: &FileSpec) -> PathBuf {
    if spec.file_with_time_format {
        let raw = spec.file.to_string_lossy();
        PathBuf::from(Local::now().format(&raw).to_string())
    } else {
        spec.file.clone()
    }
}

fn open_source(path: &Path, autocreat: bool) -> Result<File, ReaderError> {
    if autocreat && !path.exists() {
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .context(OpenSnafu { path })?;
    }
    File::open(path).context(OpenSnafu { path })
}
