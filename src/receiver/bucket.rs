//! Bucket writer: parses structured log lines into JSON objects and
//! appends them to time-interval files with a current / last / finished
//! three-state rotation.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::DateTime;
use serde_json::{Map, Value};
use snafu::ResultExt;
use tracing::{error, info};

use crate::{
    fields::{parse_iso8601, parse_request, split_fields, time_local_to_iso8601},
    notify_cmd::CmdNotify,
    record::{parse_wire, WireMessage},
    script::ScriptHost,
};

use super::{Disposition, FinishExistsSnafu, IoSnafu, PartitionWriter, ReceiveError};

/// Input layout of the structured lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Nginx,
    Tsv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimestampFormat {
    TimeLocal,
    Iso8601,
}

/// Field layout and JSON shaping rules, read from the Lua script.
pub struct Schema {
    fields: Vec<String>,
    time_index: usize,
    request_index: Option<usize>,
    timestamp_format: TimestampFormat,
    /// Rewrite the timestamp field to ISO-8601 in the output.
    time_local_iso: bool,
    delete_request_field: bool,
    request_map: BTreeMap<String, String>,
    request_type: BTreeMap<String, String>,
}

impl Schema {
    pub fn from_script(script: &ScriptHost, input: InputFormat) -> Result<Schema, ReceiveError> {
        let fields = script
            .global_string_array("informat")
            .context(super::ScriptSnafu)?;
        let timestamp_name = script
            .global_string_or("timestamp_name", "time_local")
            .context(super::ScriptSnafu)?;
        let time_index = fields
            .iter()
            .position(|f| *f == timestamp_name)
            .ok_or_else(|| ReceiveError::Invalid {
                detail: format!("timestamp field {timestamp_name} not in informat"),
            })?;

        let timestamp_format = match script
            .global_string_or("timestamp_format", "timelocal")
            .context(super::ScriptSnafu)?
            .as_str()
        {
            "timelocal" => TimestampFormat::TimeLocal,
            "iso8601" => TimestampFormat::Iso8601,
            other => {
                return Err(ReceiveError::Invalid {
                    detail: format!("unknown timestamp_format {other}"),
                })
            }
        };

        let request_index = match input {
            InputFormat::Nginx => Some(
                fields
                    .iter()
                    .position(|f| f == "request")
                    .ok_or_else(|| ReceiveError::Invalid {
                        detail: "request field not in informat".to_string(),
                    })?,
            ),
            InputFormat::Tsv => None,
        };

        let time_local_iso = script
            .global_string_or("time_local_format", "iso8601")
            .context(super::ScriptSnafu)?
            == "iso8601";

        Ok(Schema {
            fields,
            time_index,
            request_index,
            timestamp_format,
            time_local_iso,
            delete_request_field: script
                .global_bool_or("delete_request_field", true)
                .context(super::ScriptSnafu)?,
            request_map: script
                .global_string_map("request_map")
                .context(super::ScriptSnafu)?,
            request_type: script
                .global_string_map("request_type")
                .context(super::ScriptSnafu)?,
        })
    }

    fn typed(&self, name: &str, raw: &str) -> Value {
        let kind = self
            .request_type
            .get(name)
            .and_then(|t| t.chars().next())
            .unwrap_or('s');
        match kind {
            'i' => raw
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(0)),
            'f' => raw
                .parse::<f64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(0.0)),
            'j' => serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Map::new())),
            _ => Value::from(raw),
        }
    }

    /// Render one parsed line as a JSON object.
    fn to_json(
        &self,
        fields: &[String],
        method: &str,
        path: &str,
        query: &mut BTreeMap<String, String>,
    ) -> String {
        let mut root = Map::new();
        for (i, value) in fields.iter().enumerate() {
            let name = &self.fields[i];
            if name == "-"
                || name.starts_with('#')
                || (self.delete_request_field && Some(i) == self.request_index)
            {
                continue;
            }
            root.insert(name.clone(), self.typed(name, value));
        }

        let mut query_key = None;
        for (target, source) in &self.request_map {
            match source.as_str() {
                "__uri__" => {
                    root.insert(target.clone(), Value::from(path));
                }
                "__method__" => {
                    root.insert(target.clone(), Value::from(method));
                }
                "__query__" => query_key = Some(target.clone()),
                name => match query.remove(name) {
                    Some(value) => {
                        root.insert(target.clone(), self.typed(target, &value));
                    }
                    None => {
                        root.entry(target.clone()).or_insert(Value::Null);
                    }
                },
            }
        }
        if let Some(query_key) = query_key {
            let rest: Map<String, Value> = query
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                .collect();
            root.insert(query_key, Value::Object(rest));
        }

        Value::Object(root).to_string()
    }
}

struct IntervalFile {
    file: File,
    path: PathBuf,
    bucket: i64,
    /// Broker offset of the last record appended to this bucket.
    offset: i64,
}

pub struct BucketWriter {
    dir: PathBuf,
    topic: String,
    partition: i32,
    input: InputFormat,
    schema: Schema,
    interval: i64,
    delay: i64,
    notify: CmdNotify,
    /// Highest record timestamp seen; drives finalisation.
    watermark: i64,
    current: Option<IntervalFile>,
    last: Option<IntervalFile>,
}

impl BucketWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        datadir: &Path,
        topic: &str,
        partition: i32,
        input: InputFormat,
        schema: Schema,
        interval: i64,
        delay: i64,
        notify: CmdNotify,
    ) -> Result<BucketWriter, ReceiveError> {
        if !(60..=3600).contains(&interval) {
            return Err(ReceiveError::Invalid {
                detail: format!("interval {interval} outside [60, 3600]"),
            });
        }
        if delay > interval || delay < 0 {
            return Err(ReceiveError::Invalid {
                detail: format!("delay {delay} must be within [0, interval]"),
            });
        }

        let dir = datadir.join(topic);
        std::fs::create_dir_all(&dir).context(IoSnafu { path: &dir })?;

        // Leftover working files mean an unclean exit whose offsets were
        // not committed; refuse to silently mix old and new output.
        for entry in std::fs::read_dir(&dir).context(IoSnafu { path: &dir })? {
            let entry = entry.context(IoSnafu { path: &dir })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".current") || name.ends_with(".last") {
                return Err(ReceiveError::Invalid {
                    detail: format!("stale working file {} in {}", name, dir.display()),
                });
            }
        }

        Ok(BucketWriter {
            dir,
            topic: topic.to_string(),
            partition,
            input,
            schema,
            interval,
            delay,
            notify,
            watermark: 0,
            current: None,
            last: None,
        })
    }

    fn bucket_path(&self, bucket: i64) -> PathBuf {
        let start = DateTime::from_timestamp(bucket * self.interval, 0)
            .map(|dt| dt.naive_utc().format("%Y-%m-%d_%H-%M-%S").to_string())
            .unwrap_or_else(|| (bucket * self.interval).to_string());
        self.dir
            .join(format!("{}.{}_{}", self.topic, self.partition, start))
    }

    fn open_current(&mut self, bucket: i64, offset: i64) -> Result<(), ReceiveError> {
        let path = PathBuf::from(format!("{}.current", self.bucket_path(bucket).display()));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(IoSnafu { path: &path })?;
        info!(message = "bucket opened", path = %path.display());
        self.current = Some(IntervalFile {
            file,
            path,
            bucket,
            offset,
        });
        Ok(())
    }

    /// `current` becomes `last`, keeping its open handle.
    fn rotate_current_to_last(&mut self) -> Result<(), ReceiveError> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        let last_path = swap_suffix(&current.path, ".current", ".last");
        std::fs::rename(&current.path, &last_path)
            .context(IoSnafu { path: &current.path })?;
        info!(message = "bucket rotated", from = %current.path.display(),
              to = %last_path.display());
        self.last = Some(IntervalFile {
            file: current.file,
            path: last_path,
            bucket: current.bucket,
            offset: current.offset,
        });
        Ok(())
    }

    /// Strip the `.last` suffix, making the bucket final, and report the
    /// commit offset.
    fn finalize_last(&mut self) -> Result<Option<i64>, ReceiveError> {
        let Some(last) = self.last.take() else {
            return Ok(None);
        };
        let final_path = swap_suffix(&last.path, ".last", "");
        if final_path.exists() {
            return FinishExistsSnafu { path: final_path }.fail();
        }
        drop(last.file);
        std::fs::rename(&last.path, &final_path).context(IoSnafu { path: &last.path })?;
        info!(message = "bucket finalised", path = %final_path.display());
        self.notify
            .bucket_done(&final_path, last.bucket * self.interval);
        Ok(Some(last.offset))
    }

    fn last_due(&self) -> bool {
        self.last.is_some()
            && self
                .current
                .as_ref()
                .is_some_and(|cur| self.watermark > cur.bucket * self.interval + self.delay)
    }

    /// The three-state rotation. Returns the offset committed by a
    /// finalisation, if one happened.
    fn rotate(&mut self, bucket: i64, offset: i64) -> Result<Option<i64>, ReceiveError> {
        let mut committed = None;

        match self.current.as_ref().map(|current| current.bucket) {
            None => self.open_current(bucket, offset)?,
            Some(open_bucket) if bucket > open_bucket => {
                if self.last.is_some() {
                    // With delay <= interval the last bucket has always
                    // aged out by the time current rotates again.
                    committed = self.finalize_last()?;
                }
                self.rotate_current_to_last()?;
                self.open_current(bucket, offset)?;
            }
            Some(open_bucket) if bucket == open_bucket => {
                if let Some(current) = &mut self.current {
                    current.offset = offset;
                }
            }
            Some(_) => {
                if let Some(last) = &mut self.last {
                    if bucket == last.bucket {
                        last.offset = offset;
                    }
                }
            }
        }

        if self.last_due() {
            committed = self.finalize_last()?;
        }
        Ok(committed)
    }

    fn parse_line(&self, line: &str) -> Option<(Vec<String>, i64)> {
        let delimiter = match self.input {
            InputFormat::Nginx => ' ',
            InputFormat::Tsv => '\t',
        };
        let mut fields = split_fields(line, delimiter);
        if fields.len() != self.schema.fields.len() {
            error!(message = "field count mismatch", expected = self.schema.fields.len(),
                   got = fields.len(), line);
            return None;
        }

        let raw_time = &fields[self.schema.time_index];
        let timestamp = match self.schema.timestamp_format {
            TimestampFormat::TimeLocal => {
                let (iso, ts) = match time_local_to_iso8601(raw_time) {
                    Some(parsed) => parsed,
                    None => {
                        error!(message = "bad timestamp", value = %raw_time);
                        return None;
                    }
                };
                if self.schema.time_local_iso {
                    fields[self.schema.time_index] = iso;
                }
                ts
            }
            TimestampFormat::Iso8601 => match parse_iso8601(raw_time) {
                Some(ts) => ts,
                None => {
                    error!(message = "bad timestamp", value = %raw_time);
                    return None;
                }
            },
        };
        Some((fields, timestamp))
    }
}

impl PartitionWriter for BucketWriter {
    fn write(&mut self, offset: i64, payload: &[u8]) -> Result<Disposition, ReceiveError> {
        let body = match parse_wire(payload) {
            Ok(WireMessage::Nmsg { payload: body, .. }) => body,
            Ok(WireMessage::Meta { host, meta }) => {
                info!(message = "meta", host = %host, event = ?meta.event, offset);
                return Ok(Disposition::Ignore);
            }
            Ok(WireMessage::Msg(_)) | Err(_) => {
                error!(message = "unclassifiable message dropped", offset);
                return Ok(Disposition::Ignore);
            }
        };

        let line = String::from_utf8_lossy(body);
        let line = line.strip_suffix('\n').unwrap_or(&line);
        let Some((fields, timestamp)) = self.parse_line(line) else {
            return Ok(Disposition::Ignore);
        };

        let (method, path, mut query) = match self.schema.request_index {
            Some(idx) => match parse_request(&fields[idx]) {
                Some(parsed) => parsed,
                None => {
                    error!(message = "bad request field", value = %fields[idx]);
                    return Ok(Disposition::Ignore);
                }
            },
            None => (String::new(), String::new(), BTreeMap::new()),
        };

        if timestamp > self.watermark {
            self.watermark = timestamp;
        }
        let bucket = timestamp / self.interval;
        let committed = self.rotate(bucket, offset)?;

        let target = if self.current.as_ref().is_some_and(|c| c.bucket == bucket) {
            self.current.as_mut()
        } else if self.last.as_ref().is_some_and(|l| l.bucket == bucket) {
            self.last.as_mut()
        } else {
            info!(message = "message outside window", bucket, watermark = self.watermark);
            None
        };

        if let Some(target) = target {
            let mut json = self.schema.to_json(&fields, &method, &path, &mut query);
            json.push('\n');
            target
                .file
                .write_all(json.as_bytes())
                .context(IoSnafu { path: &target.path })?;
        }

        Ok(match committed {
            Some(commit) => Disposition::Global(commit),
            None => Disposition::Ignore,
        })
    }

    fn on_timeout(&mut self) -> Result<Disposition, ReceiveError> {
        if self.last_due() {
            if let Some(commit) = self.finalize_last()? {
                return Ok(Disposition::Global(commit));
            }
        }
        Ok(Disposition::Ignore)
    }

    fn on_shutdown(&mut self) -> Result<Disposition, ReceiveError> {
        self.on_timeout()
    }
}

impl Drop for BucketWriter {
    /// Working files whose offsets never committed are removed; replay
    /// rebuilds them from the stored offset.
    fn drop(&mut self) {
        if let Some(current) = self.current.take() {
            drop(current.file);
            let _ = std::fs::remove_file(&current.path);
        }
        if let Some(last) = self.last.take() {
            drop(last.file);
            let _ = std::fs::remove_file(&last.path);
        }
    }
}

fn swap_suffix(path: &Path, from: &str, to: &str) -> PathBuf {
    let raw = path.to_string_lossy();
    let base = raw.strip_suffix(from).unwrap_or(&raw);
    PathBuf::from(format!("{base}{to}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::encode_nmsg;

    const SCRIPT: &str = r#"
        informat = {"remote_addr", "time_local", "request", "status"}
        timestamp_format = "timelocal"
        delete_request_field = true
        request_map = {uri = "__uri__", method = "__method__", args = "__query__"}
        request_type = {status = "i"}
    "#;

    fn writer(dir: &Path, interval: i64, delay: i64) -> BucketWriter {
        let script = ScriptHost::from_source(SCRIPT).unwrap();
        let schema = Schema::from_script(&script, InputFormat::Nginx).unwrap();
        let notify = CmdNotify::new(None, dir, "t", 0);
        BucketWriter::new(dir, "t", 0, InputFormat::Nginx, schema, interval, delay, notify)
            .unwrap()
    }

    fn line(time: &str, uri: &str) -> Vec<u8> {
        let line = format!(
            r#"10.0.0.1 [02/Apr/2015:{time} +0800] "GET {uri} HTTP/1.1" 200"#
        );
        encode_nmsg("H", 0, line.as_bytes()).to_vec()
    }

    #[test]
    fn interval_bounds_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let script = ScriptHost::from_source(SCRIPT).unwrap();
        let schema = Schema::from_script(&script, InputFormat::Nginx).unwrap();
        let notify = CmdNotify::new(None, dir.path(), "t", 0);
        assert!(BucketWriter::new(
            dir.path(), "t", 0, InputFormat::Nginx, schema, 30, 0, notify
        )
        .is_err());
    }

    #[test]
    fn records_become_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path(), 60, 10);
        writer.write(0, &line("12:05:00", "/a?x=1&y=b%20c")).unwrap();

        let current = writer.current.as_ref().unwrap().path.clone();
        let content = std::fs::read_to_string(&current).unwrap();
        let value: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(value["remote_addr"], "10.0.0.1");
        assert_eq!(value["status"], 200);
        assert_eq!(value["uri"], "/a");
        assert_eq!(value["method"], "GET");
        assert_eq!(value["args"]["x"], "1");
        assert_eq!(value["args"]["y"], "b c");

        // An abandoned worker leaves no working files behind.
        drop(writer);
        assert!(!current.exists());
    }

    #[test]
    fn bucket_rotation_follows_the_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path(), 60, 10);

        // 12:05 bucket opens.
        writer.write(10, &line("12:05:00", "/a")).unwrap();
        // 12:06:05 rotates 12:05 to .last; not yet past the delay.
        writer.write(11, &line("12:06:05", "/b")).unwrap();
        assert!(writer.last.is_some());

        // A late 12:05:59 record still lands in .last.
        writer.write(12, &line("12:05:59", "/late")).unwrap();
        let last_path = writer.last.as_ref().unwrap().path.clone();
        let last_content = std::fs::read_to_string(&last_path).unwrap();
        assert_eq!(last_content.lines().count(), 2);
        assert!(last_content.contains("/late"));

        // 12:06:11 pushes the watermark past bucket start + delay: the
        // last file is finalised and the offset committed globally.
        let disposition = writer.write(13, &line("12:06:11", "/c")).unwrap();
        assert_eq!(disposition, Disposition::Global(12));
        assert!(writer.last.is_none());
        let final_path = swap_suffix(&last_path, ".last", "");
        let content = std::fs::read_to_string(&final_path).unwrap();
        assert_eq!(content.lines().count(), 2);
        for json_line in content.lines() {
            let value: serde_json::Value = serde_json::from_str(json_line).unwrap();
            assert_eq!(value["status"], 200);
            assert!(value["time_local"]
                .as_str()
                .unwrap()
                .starts_with("2015-04-02T12:05"));
            assert!(value.get("request").is_none());
            assert!(value["uri"].as_str().is_some());
        }
    }

    #[test]
    fn too_old_records_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path(), 60, 10);
        writer.write(0, &line("12:05:00", "/a")).unwrap();
        writer.write(1, &line("12:06:05", "/b")).unwrap();
        writer.write(2, &line("12:07:30", "/c")).unwrap();
        // 12:05 is finished; a record for it has nowhere to go.
        let before = writer.watermark;
        writer.write(3, &line("12:04:00", "/ancient")).unwrap();
        assert_eq!(writer.watermark, before);
    }

    #[test]
    fn stale_working_files_refuse_startup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("t")).unwrap();
        std::fs::write(dir.path().join("t/t.0_x.current"), b"").unwrap();
        let script = ScriptHost::from_source(SCRIPT).unwrap();
        let schema = Schema::from_script(&script, InputFormat::Nginx).unwrap();
        let notify = CmdNotify::new(None, dir.path(), "t", 0);
        assert!(BucketWriter::new(
            dir.path(), "t", 0, InputFormat::Nginx, schema, 60, 10, notify
        )
        .is_err());
    }
}
