//! The three wire variants carried on the broker and the in-process
//! record types flowing from readers to the producer.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Width of the zero-padded byte offset in an `NMSG` prefix.
pub const POSITION_WIDTH: usize = 13;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum WireError {
    #[snafu(display("missing space separator"))]
    MissingSeparator,
    #[snafu(display("missing @position in named message"))]
    MissingPosition,
    #[snafu(display("malformed position"))]
    BadPosition,
    #[snafu(display("malformed meta json: {detail}"))]
    BadMeta { detail: String },
    #[snafu(display("payload is not utf-8 where text is required"))]
    NotUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaEvent {
    #[serde(rename = "START")]
    Start,
    #[serde(rename = "END")]
    End,
}

/// Body of a `META` record: `#<host> {json}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Meta {
    pub event: MetaEvent,
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sendsize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sendlines: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

impl Meta {
    pub fn start(time: String) -> Meta {
        Meta {
            event: MetaEvent::Start,
            time,
            file: None,
            size: None,
            sendsize: None,
            lines: None,
            sendlines: None,
            md5: None,
        }
    }
}

/// `*<host>@<pos-padded-13> <payload>`
pub fn encode_nmsg(host: &str, position: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(host.len() + payload.len() + POSITION_WIDTH + 3);
    buf.put_u8(b'*');
    buf.put_slice(host.as_bytes());
    buf.put_u8(b'@');
    buf.put_slice(format!("{position:0width$}", width = POSITION_WIDTH).as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(payload);
    buf.freeze()
}

/// `#<host> <json>`
pub fn encode_meta(host: &str, meta: &Meta) -> Bytes {
    let json = serde_json::to_string(meta).unwrap_or_default();
    let mut buf = BytesMut::with_capacity(host.len() + json.len() + 2);
    buf.put_u8(b'#');
    buf.put_slice(host.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(json.as_bytes());
    buf.freeze()
}

/// A broker payload classified by its first byte.
#[derive(Debug, PartialEq, Eq)]
pub enum WireMessage<'a> {
    Msg(&'a [u8]),
    Nmsg {
        host: &'a str,
        position: u64,
        payload: &'a [u8],
    },
    Meta {
        host: &'a str,
        meta: Meta,
    },
}

pub fn parse_wire(payload: &[u8]) -> Result<WireMessage<'_>, WireError> {
    match payload.first() {
        Some(b'*') => {
            let space = payload
                .iter()
                .position(|b| *b == b' ')
                .ok_or(WireError::MissingSeparator)?;
            let head = &payload[1..space];
            let at = head
                .iter()
                .position(|b| *b == b'@')
                .ok_or(WireError::MissingPosition)?;
            let host = std::str::from_utf8(&head[..at]).map_err(|_| WireError::NotUtf8)?;
            let position = std::str::from_utf8(&head[at + 1..])
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or(WireError::BadPosition)?;
            Ok(WireMessage::Nmsg {
                host,
                position,
                payload: &payload[space + 1..],
            })
        }
        Some(b'#') => {
            let space = payload
                .iter()
                .position(|b| *b == b' ')
                .ok_or(WireError::MissingSeparator)?;
            let host =
                std::str::from_utf8(&payload[1..space]).map_err(|_| WireError::NotUtf8)?;
            let meta = serde_json::from_slice(&payload[space + 1..]).map_err(|e| {
                WireError::BadMeta {
                    detail: e.to_string(),
                }
            })?;
            Ok(WireMessage::Meta { host, meta })
        }
        _ => Ok(WireMessage::Msg(payload)),
    }
}

/// One outgoing broker record plus the bookkeeping the producer needs to
/// move the offset store once the broker acknowledges it.
#[derive(Debug, Clone)]
pub struct Record {
    pub inode: u64,
    /// Byte offset of the source line start; `None` for meta and
    /// aggregate output.
    pub position: Option<u64>,
    /// Offset-store value after this record is acknowledged. Only primary
    /// line records carry one.
    pub advance: Option<u64>,
    pub payload: Bytes,
}

impl Record {
    pub fn meta(inode: u64, payload: Bytes) -> Record {
        Record {
            inode,
            position: None,
            advance: None,
            payload,
        }
    }
}

/// A batch of records from one spec, in framing order.
#[derive(Debug)]
pub struct RecordBatch {
    pub spec: usize,
    pub records: Vec<Record>,
}
