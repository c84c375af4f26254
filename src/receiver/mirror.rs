//! Mirror writer: reconstructs per-host append-only files from NMSG
//! payloads, byte-exact, rotating on END markers.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    fs::{File, OpenOptions},
    io::{IoSlice, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use snafu::ResultExt;
use tracing::{error, info};

use crate::{
    notify_cmd::CmdNotify,
    record::{parse_wire, MetaEvent, WireMessage},
};

use super::{Disposition, GapSnafu, IoSnafu, PartitionWriter, ReceiveError};

/// Matches the writev iovec limit: buffered segments per flush.
const MAX_SEGMENTS: usize = 1024;

struct HostSink {
    file: File,
    path: PathBuf,
    /// Expected position of the next message; duplicates fall below it.
    next_pos: Option<u64>,
    segments: Vec<Bytes>,
}

pub struct MirrorWriter {
    dir: PathBuf,
    notify: CmdNotify,
    sinks: BTreeMap<String, HostSink>,
    /// Highest broker offset consumed; the shutdown commit point.
    last_offset: Option<i64>,
}

impl MirrorWriter {
    pub fn new(datadir: &Path, topic: &str, notify: CmdNotify) -> Result<MirrorWriter, ReceiveError> {
        let dir = datadir.join(topic);
        std::fs::create_dir_all(&dir).context(IoSnafu { path: &dir })?;
        Ok(MirrorWriter {
            dir,
            notify,
            sinks: BTreeMap::new(),
            last_offset: None,
        })
    }

    fn sink(&mut self, host: &str) -> Result<&mut HostSink, ReceiveError> {
        match self.sinks.entry(host.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let path = self.dir.join(host);
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .context(IoSnafu { path: &path })?;
                Ok(entry.insert(HostSink {
                    file,
                    path,
                    next_pos: None,
                    segments: Vec::new(),
                }))
            }
        }
    }

    /// Flush every buffered segment of every host. Called when any host
    /// hits the segment limit, on END, and at shutdown, so a committed
    /// offset never covers unwritten bytes.
    fn flush_all(&mut self) -> Result<bool, ReceiveError> {
        let mut flushed = false;
        for sink in self.sinks.values_mut() {
            if sink.segments.is_empty() {
                continue;
            }
            flushed = true;
            write_segments(&mut sink.file, &sink.segments)
                .context(IoSnafu { path: &sink.path })?;
            sink.segments.clear();
        }
        Ok(flushed)
    }

    fn finish_host(&mut self, host: &str, meta_file: &str) -> Result<PathBuf, ReceiveError> {
        // Make sure the file exists even for an empty rotation, so every
        // END yields exactly one output file.
        self.sink(host)?;
        let sink = self.sinks.remove(host).expect("opened above");

        let basename = Path::new(meta_file)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| meta_file.to_string());
        let final_path = self.dir.join(format!("{host}_{basename}"));

        drop(sink.file);
        std::fs::rename(&sink.path, &final_path).context(IoSnafu { path: &sink.path })?;
        info!(message = "rotation mirrored", from = %sink.path.display(),
              to = %final_path.display());
        Ok(final_path)
    }
}

impl PartitionWriter for MirrorWriter {
    fn write(&mut self, offset: i64, payload: &[u8]) -> Result<Disposition, ReceiveError> {
        self.last_offset = Some(offset);

        match parse_wire(payload) {
            Ok(WireMessage::Nmsg {
                host,
                position,
                payload: body,
            }) => {
                let host = host.to_string();
                let sink = self.sink(&host)?;
                if let Some(expected) = sink.next_pos {
                    if position < expected {
                        error!(message = "duplicate message dropped", host = %host,
                               position, expected, offset);
                        return Ok(Disposition::Ignore);
                    }
                    if position > expected {
                        return GapSnafu {
                            host,
                            expected,
                            got: position,
                        }
                        .fail();
                    }
                }
                sink.next_pos = Some(position + body.len() as u64);
                sink.segments.push(Bytes::copy_from_slice(body));

                if sink.segments.len() >= MAX_SEGMENTS {
                    self.flush_all()?;
                    Ok(Disposition::Local(offset))
                } else {
                    Ok(Disposition::Ignore)
                }
            }
            Ok(WireMessage::Meta { host, meta }) => {
                info!(message = "meta", host = %host, event = ?meta.event, offset);
                if meta.event != MetaEvent::End {
                    return Ok(Disposition::Ignore);
                }
                let host = host.to_string();
                self.flush_all()?;
                let source_file = meta.file.clone().unwrap_or_default();
                let final_path = self.finish_host(&host, &source_file)?;
                self.notify.file_done(
                    &final_path,
                    &source_file,
                    meta.size,
                    meta.md5.as_deref(),
                );
                Ok(Disposition::Global(offset))
            }
            Ok(WireMessage::Msg(_)) | Err(_) => {
                error!(message = "unclassifiable message dropped", offset,
                       head = %String::from_utf8_lossy(&payload[..payload.len().min(64)]));
                Ok(Disposition::Ignore)
            }
        }
    }

    fn on_timeout(&mut self) -> Result<Disposition, ReceiveError> {
        Ok(Disposition::Ignore)
    }

    fn on_shutdown(&mut self) -> Result<Disposition, ReceiveError> {
        if self.flush_all()? {
            if let Some(offset) = self.last_offset {
                return Ok(Disposition::Local(offset));
            }
        }
        Ok(Disposition::Ignore)
    }
}

/// Vectored append handling partial writes.
fn write_segments(file: &mut File, segments: &[Bytes]) -> std::io::Result<()> {
    let total: usize = segments.iter().map(Bytes::len).sum();
    let mut written = 0usize;
    while written < total {
        // Rebuild the slice list past what has already gone out.
        let mut slices = Vec::with_capacity(segments.len());
        let mut skip = written;
        for segment in segments {
            if skip >= segment.len() {
                skip -= segment.len();
                continue;
            }
            slices.push(IoSlice::new(&segment[skip..]));
            skip = 0;
        }
        let n = file.write_vectored(&slices)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "vectored write made no progress",
            ));
        }
        written += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{encode_meta, encode_nmsg, Meta};

    fn writer(dir: &Path) -> MirrorWriter {
        let notify = CmdNotify::new(None, dir, "t", 0);
        MirrorWriter::new(dir, "t", notify).unwrap()
    }

    fn end_meta(file: &str, size: u64) -> Meta {
        Meta {
            event: MetaEvent::End,
            time: "2015-04-02T12:05:00".into(),
            file: Some(file.into()),
            size: Some(size),
            sendsize: Some(size),
            lines: Some(1),
            sendlines: Some(1),
            md5: Some(String::new()),
        }
    }

    #[test]
    fn rotation_round_trip_produces_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path());

        // The stream a sender produces for: hello\n, rotate, world\n.
        writer
            .write(0, &encode_nmsg("H", 0, b"hello\n"))
            .unwrap();
        let disposition = writer
            .write(1, &encode_meta("H", &end_meta("/var/log/hello.log.old", 6)))
            .unwrap();
        assert_eq!(disposition, Disposition::Global(1));

        writer
            .write(2, &encode_meta("H", &Meta::start("2015-04-02T12:05:01".into())))
            .unwrap();
        writer
            .write(3, &encode_nmsg("H", 0, b"world\n"))
            .unwrap();
        let disposition = writer
            .write(4, &encode_meta("H", &end_meta("/var/log/hello.log", 6)))
            .unwrap();
        assert_eq!(disposition, Disposition::Global(4));

        let first = std::fs::read(dir.path().join("t/H_hello.log.old")).unwrap();
        assert_eq!(first, b"hello\n");
        let second = std::fs::read(dir.path().join("t/H_hello.log")).unwrap();
        assert_eq!(second, b"world\n");
    }

    #[test]
    fn duplicates_drop_and_gaps_abort() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path());

        writer.write(0, &encode_nmsg("H", 0, b"abc\n")).unwrap();
        // Replay of the same position is dropped.
        let disposition = writer.write(1, &encode_nmsg("H", 0, b"abc\n")).unwrap();
        assert_eq!(disposition, Disposition::Ignore);
        // Skipping ahead is fatal.
        let result = writer.write(2, &encode_nmsg("H", 99, b"zzz\n"));
        assert!(matches!(result, Err(ReceiveError::Gap { .. })));
    }

    #[test]
    fn shutdown_flushes_and_commits_locally() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path());
        writer.write(7, &encode_nmsg("H", 0, b"abc\n")).unwrap();
        let disposition = writer.on_shutdown().unwrap();
        assert_eq!(disposition, Disposition::Local(7));
        let content = std::fs::read(dir.path().join("t/H")).unwrap();
        assert_eq!(content, b"abc\n");
    }

    #[test]
    fn interleaved_hosts_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path());
        writer.write(0, &encode_nmsg("a", 0, b"1\n")).unwrap();
        writer.write(1, &encode_nmsg("b", 0, b"x\n")).unwrap();
        writer.write(2, &encode_nmsg("a", 2, b"2\n")).unwrap();
        writer.on_shutdown().unwrap();
        assert_eq!(std::fs::read(dir.path().join("t/a")).unwrap(), b"1\n2\n");
        assert_eq!(std::fs::read(dir.path().join("t/b")).unwrap(), b"x\n");
    }
}
