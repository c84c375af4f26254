//! Bounded tail buffer and line framer.
//!
//! A reader appends raw chunks as it drains its file and then frames
//! newline-terminated lines out of the accumulated bytes. At most one
//! partial trailing line stays buffered between passes; when the buffer
//! fills without a newline the content is discarded once and framing
//! continues.

use bstr::ByteSlice;
use bytes::{Bytes, BytesMut};

const NL: u8 = b'\n';

/// One framed unit together with its position in the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framed {
    /// Byte offset of the first byte of this frame in the source file.
    pub offset: u64,
    /// Frame content. Line frames exclude the terminating newline; raw
    /// frames keep every newline they span.
    pub bytes: Bytes,
    /// Bytes of the source file this frame consumed, delimiter included.
    pub raw_len: u64,
}

/// Result of a framing pass.
#[derive(Debug, Default)]
pub struct FrameResult {
    pub frames: Vec<Framed>,
    /// Content dropped because it exceeded the buffer without a newline.
    /// The source range it covered is still accounted for.
    pub discarded: Option<Bytes>,
}

#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    /// Source-file offset of the first byte held in `buf`.
    base: u64,
    max_line_bytes: usize,
}

impl LineBuffer {
    pub fn new(base: u64, max_line_bytes: usize) -> LineBuffer {
        LineBuffer {
            buf: BytesMut::new(),
            base,
            max_line_bytes,
        }
    }

    /// Offset of the next unframed byte: the position up to which the
    /// source has been fully consumed.
    pub fn consumed_to(&self) -> u64 {
        self.base
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop any partial state and restart accounting at `base`.
    pub fn reset(&mut self, base: u64) {
        self.buf.clear();
        self.base = base;
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Frame buffered bytes. In line mode every newline-terminated line
    /// becomes one frame (empty lines included, so offset accounting and
    /// digests stay exact). In raw mode everything up to the last newline
    /// becomes a single frame.
    pub fn drain(&mut self, raw: bool) -> FrameResult {
        let mut result = FrameResult::default();

        if raw {
            if let Some(last_nl) = self.buf.rfind_byte(NL) {
                let frame = self.buf.split_to(last_nl + 1).freeze();
                result.frames.push(Framed {
                    offset: self.base,
                    raw_len: frame.len() as u64,
                    bytes: frame,
                });
                self.base += last_nl as u64 + 1;
            }
        } else {
            while let Some(nl) = self.buf.find_byte(NL) {
                let mut line = self.buf.split_to(nl + 1);
                line.truncate(nl);
                result.frames.push(Framed {
                    offset: self.base,
                    bytes: line.freeze(),
                    raw_len: nl as u64 + 1,
                });
                self.base += nl as u64 + 1;
            }
        }

        if self.buf.len() >= self.max_line_bytes {
            let dropped = self.buf.split().freeze();
            self.base += dropped.len() as u64;
            result.discarded = Some(dropped);
        }

        result
    }

    /// Take whatever partial line remains. Used when the file's identity
    /// is ending and no newline is coming; the remainder is emitted as a
    /// final frame so every buffered byte is delivered before END.
    pub fn take_remainder(&mut self) -> Option<Framed> {
        if self.buf.is_empty() {
            return None;
        }
        let frame = self.buf.split().freeze();
        let framed = Framed {
            offset: self.base,
            raw_len: frame.len() as u64,
            bytes: frame,
        };
        self.base += framed.raw_len;
        Some(framed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};

    fn collect(buffer: &mut LineBuffer, chunks: &[&[u8]], raw: bool) -> (Vec<Framed>, usize) {
        let mut frames = Vec::new();
        let mut dropped = 0;
        for chunk in chunks {
            buffer.push(chunk);
            let result = buffer.drain(raw);
            frames.extend(result.frames);
            if result.discarded.is_some() {
                dropped += 1;
            }
        }
        (frames, dropped)
    }

    #[test]
    fn frames_lines_with_offsets() {
        let mut buffer = LineBuffer::new(0, 64);
        let (frames, dropped) = collect(&mut buffer, &[b"abc\ndef\n"], false);
        assert_eq!(dropped, 0);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].offset, 0);
        assert_eq!(&frames[0].bytes[..], b"abc");
        assert_eq!(frames[0].raw_len, 4);
        assert_eq!(frames[1].offset, 4);
        assert_eq!(&frames[1].bytes[..], b"def");
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let mut buffer = LineBuffer::new(0, 64);
        let (frames, _) = collect(&mut buffer, &[b"par"], false);
        assert!(frames.is_empty());
        assert_eq!(buffer.buffered(), 3);
        let (frames, _) = collect(&mut buffer, &[b"tial\n"], false);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].bytes[..], b"partial");
        assert_eq!(frames[0].offset, 0);
        assert_eq!(buffer.consumed_to(), 8);
    }

    #[test]
    fn empty_lines_are_framed() {
        let mut buffer = LineBuffer::new(0, 64);
        let (frames, _) = collect(&mut buffer, &[b"456\n\n789\n"], false);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0].bytes[..], b"456");
        assert!(frames[1].bytes.is_empty());
        assert_eq!(frames[1].offset, 4);
        assert_eq!(frames[2].offset, 5);
        assert_eq!(&frames[2].bytes[..], b"789");
    }

    #[test]
    fn raw_mode_takes_everything_to_last_newline() {
        let mut buffer = LineBuffer::new(0, 64);
        buffer.push(b"abcd\nefg\nhi");
        let result = buffer.drain(true);
        assert_eq!(result.frames.len(), 1);
        assert_eq!(&result.frames[0].bytes[..], b"abcd\nefg\n");
        assert_eq!(result.frames[0].offset, 0);
        assert_eq!(buffer.buffered(), 2);
        assert_eq!(buffer.consumed_to(), 9);
    }

    #[test]
    fn line_at_capacity_minus_one_is_framed() {
        let capacity = 16;
        let mut buffer = LineBuffer::new(0, capacity);
        let mut line = vec![b'x'; capacity - 1];
        line.push(NL);
        buffer.push(&line);
        let result = buffer.drain(false);
        assert_eq!(result.frames.len(), 1);
        assert_eq!(result.frames[0].bytes.len(), capacity - 1);
        assert!(result.discarded.is_none());
    }

    #[test]
    fn overlong_line_is_dropped_once_and_accounting_continues() {
        let capacity = 16;
        let mut buffer = LineBuffer::new(0, capacity);
        buffer.push(&vec![b'x'; capacity + 1]);
        let result = buffer.drain(false);
        assert!(result.frames.is_empty());
        let dropped = result.discarded.expect("overflow must discard");
        assert_eq!(dropped.len(), capacity + 1);
        assert_eq!(buffer.consumed_to(), capacity as u64 + 1);

        buffer.push(b"ok\n");
        let result = buffer.drain(false);
        assert_eq!(result.frames.len(), 1);
        assert_eq!(result.frames[0].offset, capacity as u64 + 1);
        assert_eq!(&result.frames[0].bytes[..], b"ok");
    }

    #[test]
    fn remainder_is_taken_for_rotation() {
        let mut buffer = LineBuffer::new(10, 64);
        buffer.push(b"tail-no-newline");
        let frame = buffer.take_remainder().unwrap();
        assert_eq!(frame.offset, 10);
        assert_eq!(&frame.bytes[..], b"tail-no-newline");
        assert!(buffer.take_remainder().is_none());
    }

    // Model check in the style the framing code has always been tested
    // with: however the input is chunked, concatenating raw frames plus
    // the discards plus the remainder reproduces the input exactly, and
    // offsets are dense.
    #[test]
    fn qc_reassembly_is_lossless() {
        fn prop(chunks: Vec<Vec<u8>>, max_line: u8) -> TestResult {
            let max_line = max_line as usize + 1;
            let mut buffer = LineBuffer::new(0, max_line);
            let mut seen = Vec::new();
            let mut expected_offset = 0u64;

            for chunk in &chunks {
                buffer.push(chunk);
                let result = buffer.drain(false);
                for frame in result.frames {
                    if frame.offset != expected_offset {
                        return TestResult::failed();
                    }
                    seen.extend_from_slice(&frame.bytes);
                    seen.push(NL);
                    expected_offset += frame.raw_len;
                }
                if let Some(dropped) = result.discarded {
                    seen.extend_from_slice(&dropped);
                    expected_offset += dropped.len() as u64;
                }
            }
            if let Some(frame) = buffer.take_remainder() {
                if frame.offset != expected_offset {
                    return TestResult::failed();
                }
                seen.extend_from_slice(&frame.bytes);
            }

            let whole: Vec<u8> = chunks.concat();
            TestResult::from_bool(seen == whole)
        }

        QuickCheck::new()
            .tests(500)
            .quickcheck(prop as fn(Vec<Vec<u8>>, u8) -> TestResult);
    }
}
