//! Polling reader over the live device console.
//!
//! The console is a terminal, not a file: an empty read only means "nothing
//! yet", so the reader sleeps for the poll interval and tries again instead
//! of treating it as end of stream. Each non-empty chunk is decoded as
//! Windows-1252 and handed out as one text fragment.

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use encoding_rs::WINDOWS_1252;
use tracing::trace;

use crate::error::{HarnessError, Result};

/// Default number of bytes pulled per read attempt.
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

/// Default wait between empty read attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bytes Windows-1252 leaves unassigned. `encoding_rs` maps them to C1
/// controls; the harness rejects them instead.
const UNDEFINED_CP1252: [u8; 5] = [0x81, 0x8D, 0x8F, 0x90, 0x9D];

/// A raw, non-blocking byte source.
pub trait ByteSource {
    /// Copy whatever is currently available into `buf`.
    ///
    /// `Ok(0)` means no data is available right now. It never signals end of
    /// stream.
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Decode one chunk as strict Windows-1252.
///
/// `base_offset` is the stream offset of `bytes[0]`, used for error reports.
pub fn decode_cp1252(bytes: &[u8], base_offset: u64) -> Result<String> {
    if let Some(pos) = bytes.iter().position(|b| UNDEFINED_CP1252.contains(b)) {
        return Err(HarnessError::Decode {
            byte: bytes[pos],
            offset: base_offset + pos as u64,
        });
    }
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    Ok(text.into_owned())
}

/// Turns a chunked [`ByteSource`] into a sequence of decoded fragments.
///
/// One reader is bound to a session for the session's whole lifetime; it is
/// not recreated per trial.
pub struct StreamReader<S> {
    source: S,
    buf: Vec<u8>,
    poll_interval: Duration,
    offset: u64,
}

impl<S: ByteSource> StreamReader<S> {
    pub fn new(source: S) -> Self {
        Self::with_settings(source, DEFAULT_CHUNK_SIZE, DEFAULT_POLL_INTERVAL)
    }

    /// A `chunk_size` of zero is bumped to one byte.
    pub fn with_settings(source: S, chunk_size: usize, poll_interval: Duration) -> Self {
        Self {
            source,
            buf: vec![0; chunk_size.max(1)],
            poll_interval,
            offset: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.source
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Total bytes consumed from the source so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Wait for the next non-empty fragment.
    ///
    /// Returns `Ok(None)` only when `deadline` is set and passes before any
    /// data arrives. Without a deadline this blocks until data shows up.
    pub fn next_fragment(&mut self, deadline: Option<Instant>) -> Result<Option<String>> {
        loop {
            let n = self
                .source
                .read_chunk(&mut self.buf)
                .map_err(HarnessError::Read)?;

            if n > 0 {
                let fragment = decode_cp1252(&self.buf[..n], self.offset)?;
                self.offset += n as u64;
                trace!(bytes = n, offset = self.offset, "console fragment");
                return Ok(Some(fragment));
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };
            thread::sleep(wait);
        }
    }
}

/// The unbounded view: every item is the next fragment, forever.
impl<S: ByteSource> Iterator for StreamReader<S> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_fragment(None).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out queued chunks; an empty chunk simulates "no data yet".
    struct Chunks {
        queue: VecDeque<Vec<u8>>,
        reads: usize,
    }

    impl Chunks {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                queue: chunks.into(),
                reads: 0,
            }
        }

        fn text(chunks: &[&str]) -> Self {
            Self::new(chunks.iter().map(|c| c.as_bytes().to_vec()).collect())
        }
    }

    impl ByteSource for Chunks {
        fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            let Some(mut chunk) = self.queue.pop_front() else {
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.queue.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    struct Broken;

    impl ByteSource for Broken {
        fn read_chunk(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("pty gone"))
        }
    }

    fn fast(source: Chunks, chunk_size: usize) -> StreamReader<Chunks> {
        StreamReader::with_settings(source, chunk_size, Duration::from_millis(1))
    }

    #[test]
    fn ascii_passes_through() {
        assert_eq!(decode_cp1252(b"I (123) boot\r\n", 0).unwrap(), "I (123) boot\r\n");
    }

    #[test]
    fn high_bytes_decode_as_cp1252() {
        // 0x80 is the euro sign, 0xE9 is e-acute.
        assert_eq!(decode_cp1252(&[0x80, b' ', 0xE9], 0).unwrap(), "\u{20AC} \u{e9}");
    }

    #[test]
    fn undefined_byte_is_rejected_with_absolute_offset() {
        let err = decode_cp1252(b"ok\x8Dbad", 100).unwrap_err();
        match err {
            HarnessError::Decode { byte, offset } => {
                assert_eq!(byte, 0x8D);
                assert_eq!(offset, 102);
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn utf8_multibyte_sequence_is_not_merged() {
        // UTF-8 for e-acute is C3 A9; cp1252 reads it as two characters.
        assert_eq!(decode_cp1252(&[0xC3, 0xA9], 0).unwrap(), "\u{c3}\u{a9}");
    }

    #[test]
    fn empty_reads_are_retried_not_treated_as_eof() {
        let mut reader = fast(Chunks::text(&["", "", "hello"]), 64);
        let fragment = reader.next_fragment(None).unwrap();
        assert_eq!(fragment.as_deref(), Some("hello"));
        assert_eq!(reader.get_ref().reads, 3);
    }

    #[test]
    fn chunk_size_caps_each_fragment() {
        let mut reader = fast(Chunks::text(&["abcdefgh"]), 3);
        let parts: Vec<String> = (0..3)
            .map(|_| reader.next_fragment(None).unwrap().unwrap())
            .collect();
        assert_eq!(parts, vec!["abc", "def", "gh"]);
        assert_eq!(reader.offset(), 8);
    }

    #[test]
    fn deadline_returns_none_when_silent() {
        let mut reader = fast(Chunks::text(&[]), 64);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(reader.next_fragment(Some(deadline)).unwrap().is_none());
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn decode_error_reports_offset_across_chunks() {
        let mut reader = fast(Chunks::new(vec![b"12345".to_vec(), b"ab\x90".to_vec()]), 64);
        reader.next_fragment(None).unwrap();
        let err = reader.next_fragment(None).unwrap_err();
        assert!(matches!(err, HarnessError::Decode { byte: 0x90, offset: 7 }));
    }

    #[test]
    fn source_errors_propagate() {
        let mut reader = StreamReader::new(Broken);
        assert!(matches!(
            reader.next_fragment(None),
            Err(HarnessError::Read(_))
        ));
    }

    #[test]
    fn iterator_yields_fragments_in_order() {
        let reader = fast(Chunks::text(&["one ", "", "two"]), 64);
        let got: Vec<String> = reader.take(2).map(|r| r.unwrap()).collect();
        assert_eq!(got, vec!["one ", "two"]);
    }
}
