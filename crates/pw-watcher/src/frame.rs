//! Wire format for change batches travelling through the event pipe.
//!
//! Pipes carry bytes, not records, so every batch is framed explicitly:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────┬──────────────────────────────┐
//! │ watcher identity     │ payload length       │ payload                      │
//! │ usize, native endian │ i64, native endian   │ path "\n" path "\n" ... path │
//! └──────────────────────┴──────────────────────┴──────────────────────────────┘
//! ```
//!
//! The payload length is the sum of the path lengths plus one separator
//! between each pair of consecutive paths. There is no trailing separator and
//! no path count; the reader splits the payload on `\n`. Both ends live in the
//! same process, so native byte order is used.
//!
//! A path that is empty or contains `\n` would not survive the split, so
//! [`encode`] refuses it, and a batch with no paths is never framed.

use std::io::{self, Read};
use std::mem::size_of;

use smallvec::SmallVec;

use crate::events::WatcherId;

/// Byte placed between consecutive paths in a payload.
pub const SEPARATOR: u8 = b'\n';

/// Width of the identity token.
pub const TOKEN_WIDTH: usize = size_of::<usize>();

/// Width of the payload length field.
pub const LENGTH_WIDTH: usize = size_of::<i64>();

/// Bytes preceding every payload.
pub const HEADER_LEN: usize = TOKEN_WIDTH + LENGTH_WIDTH;

/// Largest payload a reader accepts before treating the stream as corrupt.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Errors produced while framing or unframing a batch.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The batch had no paths.
    #[error("cannot frame a batch with no paths")]
    EmptyBatch,

    /// A path cannot be represented in a newline-separated payload.
    #[error("path {index} cannot be framed: {reason}")]
    InvalidPath {
        /// Position of the path in the batch.
        index: usize,
        /// Why the path was refused.
        reason: &'static str,
    },

    /// The encoded payload would exceed [`MAX_PAYLOAD_LEN`].
    #[error("payload of {0} bytes exceeds the frame limit")]
    TooLarge(usize),

    /// The length field read from the stream is negative or too large.
    #[error("payload length {0} is out of range")]
    InvalidLength(i64),

    /// The stream ended part-way through a frame.
    #[error("stream ended in the middle of a frame")]
    Truncated,

    /// The payload is not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Reading from the underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Returns `true` if the reader can no longer find frame boundaries.
    ///
    /// After such an error every following byte is suspect, so the stream
    /// must be abandoned. Other errors affect a single frame only.
    #[must_use]
    pub const fn loses_alignment(&self) -> bool {
        matches!(
            self,
            Self::InvalidLength(_) | Self::Truncated | Self::Io(_)
        )
    }
}

/// Checks that a path survives a round trip through a payload.
pub fn check_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        Err("path is empty")
    } else if path.as_bytes().contains(&SEPARATOR) {
        Err("path contains a newline")
    } else {
        Ok(())
    }
}

/// Returns the payload length for a batch: path bytes plus separators.
pub fn payload_len<S: AsRef<str>>(paths: &[S]) -> usize {
    let bytes: usize = paths.iter().map(|p| p.as_ref().len()).sum();
    bytes + paths.len().saturating_sub(1)
}

/// Encodes a batch into a single contiguous frame.
///
/// # Examples
///
/// ```
/// use pw_watcher::WatcherId;
/// use pw_watcher::frame::{self, HEADER_LEN};
///
/// let bytes = frame::encode(WatcherId::from_raw(7), &["/a", "/bc"]).unwrap();
/// assert_eq!(bytes.len(), HEADER_LEN + 6);
/// assert_eq!(&bytes[HEADER_LEN..], b"/a\n/bc");
/// ```
pub fn encode<S: AsRef<str>>(watcher: WatcherId, paths: &[S]) -> Result<Vec<u8>, FrameError> {
    if paths.is_empty() {
        return Err(FrameError::EmptyBatch);
    }
    for (index, path) in paths.iter().enumerate() {
        check_path(path.as_ref()).map_err(|reason| FrameError::InvalidPath { index, reason })?;
    }

    let len = payload_len(paths);
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let wire_len = i64::try_from(len).map_err(|_| FrameError::TooLarge(len))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + len);
    buf.extend_from_slice(&watcher.as_raw().to_ne_bytes());
    buf.extend_from_slice(&wire_len.to_ne_bytes());
    for (i, path) in paths.iter().enumerate() {
        if i > 0 {
            buf.push(SEPARATOR);
        }
        buf.extend_from_slice(path.as_ref().as_bytes());
    }
    Ok(buf)
}

/// A frame read off the pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Identity of the watcher that wrote the frame.
    pub watcher: WatcherId,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Splits the payload into paths.
    ///
    /// An empty payload yields no paths.
    pub fn paths(&self) -> Result<SmallVec<[&str; 8]>, FrameError> {
        if self.payload.is_empty() {
            return Ok(SmallVec::new());
        }
        let text = std::str::from_utf8(&self.payload)?;
        Ok(text.split(char::from(SEPARATOR)).collect())
    }
}

/// Reads frames from a byte stream.
///
/// Short reads and `EINTR` are retried until the requested bytes arrive or
/// the stream ends.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a byte stream.
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut token = [0u8; TOKEN_WIDTH];
        match fill(&mut self.inner, &mut token)? {
            0 => return Ok(None),
            TOKEN_WIDTH => {}
            _ => return Err(FrameError::Truncated),
        }

        let mut length = [0u8; LENGTH_WIDTH];
        self.read_exact(&mut length)?;
        let raw_len = i64::from_ne_bytes(length);
        let len = usize::try_from(raw_len)
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_LEN)
            .ok_or(FrameError::InvalidLength(raw_len))?;

        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload)?;

        Ok(Some(Frame {
            watcher: WatcherId::from_raw(usize::from_ne_bytes(token)),
            payload,
        }))
    }

    /// Returns the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        if fill(&mut self.inner, buf)? < buf.len() {
            return Err(FrameError::Truncated);
        }
        Ok(())
    }
}

/// Reads until `buf` is full or the stream ends, returning the bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut reader = FrameReader::new(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = reader.read_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn header_len_field(bytes: &[u8]) -> i64 {
        let mut field = [0u8; LENGTH_WIDTH];
        field.copy_from_slice(&bytes[TOKEN_WIDTH..HEADER_LEN]);
        i64::from_ne_bytes(field)
    }

    #[test]
    fn test_payload_length_invariant() {
        let batches: [&[&str]; 4] = [
            &["/a"],
            &["/tmp/watch/a.txt", "/tmp/watch/b.txt"],
            &["/x", "/y", "/z", "/x"],
            &["/données/été.txt", "/日本/ファイル"],
        ];
        for paths in batches {
            let bytes = encode(WatcherId::from_raw(1), paths).unwrap();
            let expected: usize =
                paths.iter().map(|p| p.len()).sum::<usize>() + paths.len() - 1;
            assert_eq!(payload_len(paths), expected);
            assert_eq!(header_len_field(&bytes), i64::try_from(expected).unwrap());
            assert_eq!(bytes.len(), HEADER_LEN + expected);
        }
    }

    #[test]
    fn test_roundtrip_preserves_order_and_duplicates() {
        let paths = ["/tmp/watch/a.txt", "/tmp/watch/b.txt", "/tmp/watch/a.txt"];
        let bytes = encode(WatcherId::from_raw(9), &paths).unwrap();

        let frames = decode_all(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].watcher, WatcherId::from_raw(9));
        assert_eq!(frames[0].paths().unwrap().as_slice(), &paths);
    }

    #[test]
    fn test_back_to_back_frames_stay_aligned() {
        let mut bytes = encode(WatcherId::from_raw(1), &["/one", "/two"]).unwrap();
        bytes.extend(encode(WatcherId::from_raw(2), &["/three"]).unwrap());
        bytes.extend(encode(WatcherId::from_raw(1), &["/four"]).unwrap());

        let frames = decode_all(&bytes);
        let decoded: Vec<(usize, Vec<&str>)> = frames
            .iter()
            .map(|f| (f.watcher.as_raw(), f.paths().unwrap().to_vec()))
            .collect();
        assert_eq!(
            decoded,
            vec![
                (1, vec!["/one", "/two"]),
                (2, vec!["/three"]),
                (1, vec!["/four"]),
            ]
        );
    }

    #[test]
    fn test_encode_rejects_empty_batch() {
        let paths: [&str; 0] = [];
        assert!(matches!(
            encode(WatcherId::from_raw(1), &paths),
            Err(FrameError::EmptyBatch)
        ));
    }

    #[test]
    fn test_encode_rejects_unsplittable_paths() {
        assert!(matches!(
            encode(WatcherId::from_raw(1), &["/ok", "/bad\nname"]),
            Err(FrameError::InvalidPath { index: 1, .. })
        ));
        assert!(matches!(
            encode(WatcherId::from_raw(1), &["", "/ok"]),
            Err(FrameError::InvalidPath { index: 0, .. })
        ));
    }

    #[test]
    fn test_clean_eof_yields_none() {
        let mut reader = FrameReader::new(&[][..]);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_truncated_header_and_payload() {
        let bytes = encode(WatcherId::from_raw(1), &["/tmp/file"]).unwrap();

        let mut reader = FrameReader::new(&bytes[..TOKEN_WIDTH - 1]);
        assert!(matches!(reader.read_frame(), Err(FrameError::Truncated)));

        let mut reader = FrameReader::new(&bytes[..bytes.len() - 1]);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
        assert!(err.loses_alignment());
    }

    #[test]
    fn test_negative_length_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&5usize.to_ne_bytes());
        bytes.extend_from_slice(&(-1i64).to_ne_bytes());

        let err = FrameReader::new(&bytes[..]).read_frame().unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength(-1)));
        assert!(err.loses_alignment());
    }

    #[test]
    fn test_empty_payload_has_no_paths() {
        let frame = Frame {
            watcher: WatcherId::from_raw(1),
            payload: Vec::new(),
        };
        assert!(frame.paths().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_utf8_payload_keeps_alignment() {
        let frame = Frame {
            watcher: WatcherId::from_raw(1),
            payload: vec![b'/', 0xff, 0xfe],
        };
        let err = frame.paths().unwrap_err();
        assert!(matches!(err, FrameError::InvalidUtf8(_)));
        assert!(!err.loses_alignment());
    }

    /// Reader that hands out one byte per call and interrupts every other call.
    struct Trickle<'a> {
        bytes: &'a [u8],
        interrupt: bool,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            match self.bytes.split_first() {
                Some((first, rest)) if !buf.is_empty() => {
                    buf[0] = *first;
                    self.bytes = rest;
                    Ok(1)
                }
                _ => Ok(0),
            }
        }
    }

    #[test]
    fn test_short_and_interrupted_reads_are_retried() {
        let bytes = encode(WatcherId::from_raw(4), &["/slow/a", "/slow/b"]).unwrap();
        let mut reader = FrameReader::new(Trickle {
            bytes: &bytes,
            interrupt: false,
        });

        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.watcher, WatcherId::from_raw(4));
        assert_eq!(frame.paths().unwrap().as_slice(), &["/slow/a", "/slow/b"]);
        assert!(reader.read_frame().unwrap().is_none());
    }
}
