//! Per-spec line pipeline: filter / grep / transform / aggregate, plus
//! the plain and raw copy paths.

use std::{
    collections::BTreeMap,
    rc::Rc,
    sync::Arc,
    time::Instant,
};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    buffer::Framed,
    config::{FileSpec, TransformKind},
    fields::{abs_index, split_fields, time_local_to_iso8601},
    record::{encode_nmsg, Record},
    script::{ScriptError, ScriptHost},
};

/// Two-level aggregation cache: pkey -> subkey -> sum, keyed off the
/// timestamp column. When the timestamp advances, the previous bucket is
/// serialised and the cache cleared.
#[derive(Debug, Default)]
struct AggregateState {
    last_time: Option<String>,
    cache: BTreeMap<String, BTreeMap<String, i64>>,
    last_touch: Option<Instant>,
}

pub struct Pipeline {
    kind: TransformKind,
    host: Arc<str>,
    withhost: bool,
    withtime: bool,
    autonl: bool,
    timeidx: Option<i32>,
    pkey: Option<String>,
    /// Only a primary reader's records drive the offset store; successor
    /// pipelines emit records without an advance.
    primary: bool,
    script: Option<Rc<ScriptHost>>,
    aggregate: AggregateState,
}

impl Pipeline {
    pub fn new(spec: &FileSpec, host: Arc<str>, script: Option<Rc<ScriptHost>>) -> Pipeline {
        Pipeline {
            kind: spec.transform_kind(),
            host,
            withhost: spec.withhost,
            withtime: spec.withtime,
            autonl: spec.autonl,
            timeidx: spec.timeidx,
            pkey: spec.pkey.clone(),
            primary: true,
            script,
            aggregate: AggregateState::default(),
        }
    }

    pub fn for_successor(mut self) -> Pipeline {
        self.primary = false;
        self
    }

    /// Run one framed unit through the pipeline. An empty line is counted
    /// by the caller but produces nothing. Script failures fail the line.
    pub fn process(&mut self, inode: u64, frame: &Framed) -> Result<Vec<Record>, ScriptError> {
        if frame.bytes.is_empty() {
            return Ok(Vec::new());
        }

        match self.kind.clone() {
            TransformKind::Copy => Ok(self.emit_line(inode, frame, frame.bytes.clone())),
            TransformKind::Filter(indexes) => {
                let Some(fields) = self.split_with_time(frame) else {
                    return Ok(Vec::new());
                };
                let mut out = String::new();
                for idx in &indexes {
                    let Some(resolved) = abs_index(*idx, fields.len()) else {
                        continue;
                    };
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(&fields[resolved]);
                }
                Ok(self.emit_line(inode, frame, Bytes::from(out)))
            }
            TransformKind::Grep(name) => {
                let Some(fields) = self.split_with_time(frame) else {
                    return Ok(Vec::new());
                };
                match self.script()?.eval_grep(&name, &fields)? {
                    Some(items) => {
                        let joined = items.join(" ");
                        Ok(self.emit_line(inode, frame, Bytes::from(joined)))
                    }
                    None => Ok(Vec::new()),
                }
            }
            TransformKind::Map(name) => {
                let line = String::from_utf8_lossy(&frame.bytes);
                match self.script()?.eval_transform(&name, &line)? {
                    Some(out) => Ok(self.emit_line(inode, frame, Bytes::from(out))),
                    None => Ok(Vec::new()),
                }
            }
            TransformKind::Aggregate(name) => {
                let Some(fields) = self.split_with_time(frame) else {
                    return Ok(Vec::new());
                };
                let Some(time_idx) = self.timeidx.and_then(|i| abs_index(i, fields.len()))
                else {
                    return Ok(Vec::new());
                };
                let current_time = fields[time_idx].clone();

                let mut flushed = Vec::new();
                if self
                    .aggregate
                    .last_time
                    .as_ref()
                    .is_some_and(|last| *last != current_time)
                {
                    flushed = self.serialize_cache(inode);
                }
                self.aggregate.last_time = Some(current_time);
                self.aggregate.last_touch = Some(Instant::now());

                if let Some((pkey, counters)) =
                    self.script()?.eval_aggregate(&name, &fields)?
                {
                    for (key, value) in counters {
                        *self
                            .aggregate
                            .cache
                            .entry(pkey.clone())
                            .or_default()
                            .entry(key.clone())
                            .or_insert(0) += value;
                        if let Some(extra) = self.pkey.clone() {
                            *self
                                .aggregate
                                .cache
                                .entry(extra)
                                .or_default()
                                .entry(key)
                                .or_insert(0) += value;
                        }
                    }
                }
                Ok(flushed)
            }
        }
    }

    /// Serialise the aggregation cache. Called by `process` on timestamp
    /// advance and by housekeeping / shutdown.
    pub fn flush(&mut self, inode: u64) -> Vec<Record> {
        self.serialize_cache(inode)
    }

    /// Whether the aggregation cache has been sitting past `deadline`
    /// without its timestamp advancing.
    pub fn flush_due(&self, deadline: std::time::Duration) -> bool {
        !self.aggregate.cache.is_empty()
            && self
                .aggregate
                .last_touch
                .is_some_and(|touch| touch.elapsed() >= deadline)
    }

    fn serialize_cache(&mut self, inode: u64) -> Vec<Record> {
        if self.aggregate.cache.is_empty() {
            return Vec::new();
        }
        let cache = std::mem::take(&mut self.aggregate.cache);
        let time = self.aggregate.last_time.clone().unwrap_or_default();
        self.aggregate.last_touch = None;

        let mut records = Vec::with_capacity(cache.len());
        for (pkey, counters) in cache {
            let mut line = String::new();
            if self.withhost {
                line.push_str(&self.host);
                line.push(' ');
            }
            if self.withtime {
                line.push_str(&time);
                line.push(' ');
            }
            line.push_str(&pkey);
            for (key, value) in counters {
                line.push(' ');
                line.push_str(&key);
                line.push('=');
                line.push_str(&value.to_string());
            }
            let mut payload = BytesMut::from(line.as_bytes());
            if self.autonl {
                payload.put_u8(b'\n');
            }
            records.push(Record {
                inode,
                position: None,
                advance: None,
                payload: payload.freeze(),
            });
        }
        records
    }

    fn script(&self) -> Result<&ScriptHost, ScriptError> {
        self.script
            .as_deref()
            .ok_or_else(|| ScriptError::NotFunction {
                name: "<no script configured>".to_string(),
            })
    }

    fn split_with_time(&self, frame: &Framed) -> Option<Vec<String>> {
        let line = String::from_utf8_lossy(&frame.bytes);
        let mut fields = split_fields(&line, ' ');
        if let Some(idx) = self.timeidx {
            let resolved = abs_index(idx, fields.len())?;
            let (iso, _) = time_local_to_iso8601(&fields[resolved])?;
            fields[resolved] = iso;
        }
        Some(fields)
    }

    /// Build the output record for a line-derived payload: optional host
    /// prefix carrying the source position, optional trailing newline.
    fn emit_line(&self, inode: u64, frame: &Framed, payload: Bytes) -> Vec<Record> {
        let body = if self.autonl && !payload.ends_with(b"\n") {
            let mut buf = BytesMut::with_capacity(payload.len() + 1);
            buf.put_slice(&payload);
            buf.put_u8(b'\n');
            buf.freeze()
        } else {
            payload
        };

        let wire = if self.withhost {
            encode_nmsg(&self.host, frame.offset, &body)
        } else {
            body
        };

        vec![Record {
            inode,
            position: self.withhost.then_some(frame.offset),
            advance: self.primary.then_some(frame.offset + frame.raw_len),
            payload: wire,
        }]
    }
}
