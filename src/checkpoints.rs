//! Durable file-offset table for the sender.
//!
//! A fixed-width binary table at `<libdir>/offsets`: one
//! `(inode: u64, offset: u64)` native-endian record per spec, terminated
//! by a zero record. The table is rewritten whenever the spec set
//! changes and individual slots are rewritten in place on every
//! acknowledgement, so the durable offset never trails the acknowledged
//! offset by more than one batch.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Mutex,
};

use snafu::{ResultExt, Snafu};
use tracing::{info, warn};

pub const OFFSET_FILE_NAME: &str = "offsets";
const RECORD_BYTES: usize = 16;

#[derive(Debug, Snafu)]
pub enum OffsetError {
    #[snafu(display("unable to open offset table {}: {source}", path.display()))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("unable to rewrite offset table {}: {source}", path.display()))]
    Rewrite { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRecord {
    pub inode: u64,
    pub offset: u64,
}

impl OffsetRecord {
    fn encode(&self) -> [u8; RECORD_BYTES] {
        let mut buf = [0u8; RECORD_BYTES];
        buf[..8].copy_from_slice(&self.inode.to_ne_bytes());
        buf[8..].copy_from_slice(&self.offset.to_ne_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> OffsetRecord {
        let mut inode = [0u8; 8];
        let mut offset = [0u8; 8];
        inode.copy_from_slice(&buf[..8]);
        offset.copy_from_slice(&buf[8..RECORD_BYTES]);
        OffsetRecord {
            inode: u64::from_ne_bytes(inode),
            offset: u64::from_ne_bytes(offset),
        }
    }
}

/// Read the previous table into an inode-keyed map. A missing file is an
/// empty table; a short trailing record is ignored.
pub fn read_saved(dir: &Path) -> io::Result<HashMap<u64, u64>> {
    let path = dir.join(OFFSET_FILE_NAME);
    let mut raw = Vec::new();
    match File::open(&path) {
        Ok(mut file) => {
            file.read_to_end(&mut raw)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e),
    }

    let mut saved = HashMap::new();
    for chunk in raw.chunks_exact(RECORD_BYTES) {
        let record = OffsetRecord::decode(chunk);
        if record.inode == 0 && record.offset == 0 {
            break;
        }
        saved.insert(record.inode, record.offset);
    }
    Ok(saved)
}

/// The live table. Written only by the producer's acknowledgement path;
/// readers consult `read_saved` once at startup.
#[derive(Debug)]
pub struct OffsetTable {
    file: File,
    path: PathBuf,
    slots: Mutex<Vec<OffsetRecord>>,
}

impl OffsetTable {
    /// Rewrite the table for a fresh spec set, one slot per spec in spec
    /// order, and keep the handle for in-place slot updates.
    pub fn create(dir: &Path, initial: &[OffsetRecord]) -> Result<OffsetTable, OffsetError> {
        std::fs::create_dir_all(dir).ok();
        let path = dir.join(OFFSET_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .context(OpenSnafu { path: &path })?;

        let mut raw = Vec::with_capacity((initial.len() + 1) * RECORD_BYTES);
        for record in initial {
            raw.extend_from_slice(&record.encode());
        }
        raw.extend_from_slice(&[0u8; RECORD_BYTES]);
        write_all_at(&file, &raw, 0).context(RewriteSnafu { path: &path })?;
        file.sync_all().context(RewriteSnafu { path: &path })?;

        Ok(OffsetTable {
            file,
            path,
            slots: Mutex::new(initial.to_vec()),
        })
    }

    /// Record an acknowledged offset for `slot`. A different inode means
    /// the slot's file rotated; the slot is rebound. Offsets only move
    /// forward within one inode.
    pub fn advance(&self, slot: usize, inode: u64, offset: u64) {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(record) = slots.get_mut(slot) else {
            warn!(message = "offset slot out of range", slot);
            return;
        };

        if record.inode != inode {
            info!(
                message = "offset slot rebinding to new inode",
                slot,
                old_inode = record.inode,
                old_offset = record.offset,
                inode,
                offset
            );
            record.inode = inode;
            record.offset = offset;
        } else if offset > record.offset {
            record.offset = offset;
        } else {
            return;
        }

        let encoded = record.encode();
        if let Err(error) = write_all_at(&self.file, &encoded, (slot * RECORD_BYTES) as u64) {
            warn!(message = "offset table write failed", path = %self.path.display(), %error);
        }
    }

    pub fn snapshot(&self) -> Vec<OffsetRecord> {
        match self.slots.lock() {
            Ok(slots) => slots.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}
