//! Field splitting and the small log-format parsers shared by the sender
//! transforms and the bucket receiver.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;

/// Split a log line into fields.
///
/// Runs enclosed by `"…"` or `[…]` form a single field, `\` escapes the
/// next character, and empty runs between delimiters are skipped.
pub fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    let bytes = line.as_bytes();
    let delim = delimiter as u8;
    let mut items = Vec::new();
    let mut esc = false;
    let mut want: u8 = 0;
    let mut pos = 0usize;

    for (i, &b) in bytes.iter().enumerate() {
        if esc {
            esc = false;
        } else if b == b'\\' {
            esc = true;
        } else if want == b'"' {
            if b == b'"' {
                want = 0;
                items.push(String::from_utf8_lossy(&bytes[pos..i]).into_owned());
                pos = i + 1;
            }
        } else if want == b']' {
            if b == b']' {
                want = 0;
                items.push(String::from_utf8_lossy(&bytes[pos..i]).into_owned());
                pos = i + 1;
            }
        } else if b == b'"' {
            want = b'"';
            pos += 1;
        } else if b == b'[' {
            want = b']';
            pos += 1;
        } else if b == delim {
            if i != pos {
                items.push(String::from_utf8_lossy(&bytes[pos..i]).into_owned());
            }
            pos = i + 1;
        }
    }
    if pos != bytes.len() {
        items.push(String::from_utf8_lossy(&bytes[pos..]).into_owned());
    }
    items
}

/// Resolve a 1-based field index; negatives count from the end.
pub fn abs_index(idx: i32, len: usize) -> Option<usize> {
    let resolved = if idx > 0 {
        idx as i64 - 1
    } else {
        len as i64 + idx as i64
    };
    if resolved >= 0 && (resolved as usize) < len {
        Some(resolved as usize)
    } else {
        None
    }
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Parse a log-local timestamp (`02/Apr/2015:12:05:00 +0800`) into its
/// ISO-8601 rendering and a naive timestamp. The zone suffix is ignored;
/// bucketing is done in log-local time.
pub fn time_local_to_iso8601(value: &str) -> Option<(String, i64)> {
    let body = value.split(' ').next()?;
    let mut parts = body.splitn(3, '/');
    let day: u32 = parts.next()?.parse().ok()?;
    let mon_name = parts.next()?;
    let rest = parts.next()?;
    let mon = MONTHS.iter().position(|m| *m == mon_name)? as u32 + 1;

    let mut time_parts = rest.splitn(4, ':');
    let year: i32 = time_parts.next()?.parse().ok()?;
    let hour: u32 = time_parts.next()?.parse().ok()?;
    let min: u32 = time_parts.next()?.parse().ok()?;
    let sec: u32 = time_parts.next()?.parse().ok()?;

    let dt = chrono::NaiveDate::from_ymd_opt(year, mon, day)?.and_hms_opt(hour, min, sec)?;
    Some((format!("{}", dt.format("%Y-%m-%dT%H:%M:%S")), epoch(dt)))
}

/// Parse `YYYY-MM-DD[T ]HH:MM:SS[.frac]` into a naive timestamp.
pub fn parse_iso8601(value: &str) -> Option<i64> {
    let body = value.split('.').next()?;
    let dt = NaiveDateTime::parse_from_str(body, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(body, "%Y-%m-%d %H:%M:%S"))
        .ok()?;
    Some(epoch(dt))
}

fn epoch(dt: NaiveDateTime) -> i64 {
    dt.and_utc().timestamp()
}

/// Parse an HTTP request field (`GET /path?k=v HTTP/1.1`) into method,
/// path and the decoded query map.
pub fn parse_request(request: &str) -> Option<(String, String, BTreeMap<String, String>)> {
    let first_sp = request.find(' ')?;
    let last_sp = request.rfind(' ')?;
    if last_sp <= first_sp + 1 {
        return None;
    }
    let method = request[..first_sp].to_string();
    let uri = &request[first_sp + 1..last_sp];
    let (path, query) = parse_query(uri);
    Some((method, path, query))
}

/// Split a URI into path and query map, percent-decoding values.
pub fn parse_query(uri: &str) -> (String, BTreeMap<String, String>) {
    let mut query = BTreeMap::new();
    let (path, qs) = match uri.split_once('?') {
        Some((p, q)) => (p, q),
        None => return (uri.to_string(), query),
    };
    for pair in qs.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if !key.is_empty() && !value.is_empty() {
                query.insert(key.to_string(), percent_decode(value));
            }
        }
    }
    (path.to_string(), query)
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
