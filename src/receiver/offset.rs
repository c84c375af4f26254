//! Durable broker offset for one partition: a single native-endian
//! `u64` rewritten in place. Absent or empty means "use the CLI default
//! policy".

use std::{
    fs::{File, OpenOptions},
    io::{self, Read},
    path::Path,
};

#[derive(Debug)]
pub struct ConsumerOffset {
    file: File,
    value: Option<i64>,
}

impl ConsumerOffset {
    pub fn open(path: &Path) -> io::Result<ConsumerOffset> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut buf = [0u8; 8];
        let value = match file.read_exact(&mut buf) {
            Ok(()) => Some(i64::from_ne_bytes(buf)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => None,
            Err(e) => return Err(e),
        };
        Ok(ConsumerOffset { file, value })
    }

    pub fn get(&self) -> Option<i64> {
        self.value
    }

    pub fn update(&mut self, offset: i64) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.write_all_at(&offset.to_ne_bytes(), 0)?;
        }
        self.value = Some(offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_is_default_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.0.offset");
        let offsets = ConsumerOffset::open(&path).unwrap();
        assert_eq!(offsets.get(), None);
    }

    #[test]
    fn value_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.0.offset");
        {
            let mut offsets = ConsumerOffset::open(&path).unwrap();
            offsets.update(42).unwrap();
            offsets.update(43).unwrap();
        }
        let offsets = ConsumerOffset::open(&path).unwrap();
        assert_eq!(offsets.get(), Some(43));
    }
}
