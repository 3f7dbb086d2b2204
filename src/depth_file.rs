//! Depth stream file (`depth.bin`).
//!
//! Compressed layout, repeated once per recorded frame with no file header:
//!
//! ```text
//! [len: i32 LE][raw deflate payload: len bytes]
//! ```
//!
//! The payload inflates to `width * height` little-endian u16 samples. With
//! compression disabled the file is a plain concatenation of those frames.
//!
//! Every record is followed by `sync_data`, so a crash loses at most the
//! frame being written. Durability is preferred over throughput here.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of the per-record length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum DepthWriteError {
    #[error("failed to compress depth frame: {0}")]
    Compress(#[source] io::Error),
    #[error("compressed depth frame of {0} bytes exceeds the length prefix range")]
    TooLarge(usize),
    #[error("failed to write depth record: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DepthReadError {
    #[error("depth record {record} is truncated")]
    Truncated { record: u64 },
    #[error("depth record {record} has invalid length {len}")]
    InvalidLength { record: u64, len: i32 },
    #[error("failed to inflate depth record {record}: {source}")]
    Inflate { record: u64, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of handing one frame to the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Record committed and synced; `bytes` includes the length prefix.
    Written { bytes: usize },
    /// The file could not be opened at start; the frame was not persisted.
    Detached,
}

/// Counters reported when the writer is finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepthFileSummary {
    pub records: u64,
    pub bytes: u64,
    pub failed: u64,
    pub detached: u64,
}

pub struct DepthWriter {
    path: PathBuf,
    file: Option<File>,
    compress: bool,
    scratch: Vec<u8>,
    committed: u64,
    summary: DepthFileSummary,
}

impl DepthWriter {
    /// Create (truncate) the depth file.
    ///
    /// An open failure does not abort the recording: the writer comes back
    /// detached and every subsequent write reports [`WriteOutcome::Detached`].
    pub fn open(path: impl Into<PathBuf>, compress: bool) -> Self {
        let path = path.into();
        let file = match File::create(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!("Failed to open depth file {}: {}", path.display(), e);
                None
            }
        };
        Self {
            path,
            file,
            compress,
            scratch: Vec::new(),
            committed: 0,
            summary: DepthFileSummary::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_attached(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_compressed(&self) -> bool {
        self.compress
    }

    /// Append one frame of little-endian u16 samples.
    ///
    /// On failure the file is cut back to the last committed record so the
    /// records already written stay readable.
    pub fn write_frame(&mut self, raw: &[u8]) -> Result<WriteOutcome, DepthWriteError> {
        let Some(file) = self.file.as_mut() else {
            if self.summary.detached == 0 {
                tracing::warn!(
                    "Depth file {} is not open, depth frames are not persisted",
                    self.path.display()
                );
            }
            self.summary.detached += 1;
            return Ok(WriteOutcome::Detached);
        };

        let result = append_record(file, &mut self.scratch, self.compress, raw)
            .and_then(|bytes| file.sync_data().map(|_| bytes).map_err(DepthWriteError::from));

        match result {
            Ok(bytes) => {
                self.committed += bytes as u64;
                self.summary.records += 1;
                self.summary.bytes = self.committed;
                tracing::debug!(
                    "Depth record {} written ({} bytes)",
                    self.summary.records, bytes
                );
                Ok(WriteOutcome::Written { bytes })
            }
            Err(e) => {
                self.summary.failed += 1;
                if let Err(rollback) = rollback(file, self.committed) {
                    tracing::warn!(
                        "Failed to roll back {} to {} bytes: {}",
                        self.path.display(),
                        self.committed,
                        rollback
                    );
                }
                Err(e)
            }
        }
    }

    /// Final sync. Returns what was written over the writer's lifetime.
    pub fn finish(self) -> Result<DepthFileSummary, DepthWriteError> {
        if let Some(file) = self.file {
            file.sync_all()?;
        }
        Ok(self.summary)
    }
}

fn append_record(
    file: &mut File,
    scratch: &mut Vec<u8>,
    compress: bool,
    raw: &[u8],
) -> Result<usize, DepthWriteError> {
    if !compress {
        file.write_all(raw)?;
        return Ok(raw.len());
    }

    scratch.clear();
    let mut encoder = DeflateEncoder::new(&mut *scratch, Compression::fast());
    encoder.write_all(raw).map_err(DepthWriteError::Compress)?;
    encoder.finish().map_err(DepthWriteError::Compress)?;

    let len = i32::try_from(scratch.len()).map_err(|_| DepthWriteError::TooLarge(scratch.len()))?;
    file.write_all(&len.to_le_bytes())?;
    file.write_all(scratch)?;
    Ok(LENGTH_PREFIX_SIZE + scratch.len())
}

fn rollback(file: &mut File, committed: u64) -> io::Result<()> {
    file.set_len(committed)?;
    file.seek(SeekFrom::Start(committed))?;
    Ok(())
}

/// Sequential reader for depth files.
pub struct DepthReader<R> {
    inner: R,
    /// `Some(len)` for the uncompressed layout.
    frame_len: Option<usize>,
    record: u64,
    done: bool,
}

impl DepthReader<BufReader<File>> {
    pub fn open_compressed(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::compressed(BufReader::new(File::open(path)?)))
    }

    pub fn open_uncompressed(path: impl AsRef<Path>, frame_len: usize) -> io::Result<Self> {
        Ok(Self::uncompressed(BufReader::new(File::open(path)?), frame_len))
    }
}

impl<R: Read> DepthReader<R> {
    pub fn compressed(inner: R) -> Self {
        Self {
            inner,
            frame_len: None,
            record: 0,
            done: false,
        }
    }

    pub fn uncompressed(inner: R, frame_len: usize) -> Self {
        Self {
            inner,
            frame_len: Some(frame_len),
            record: 0,
            done: false,
        }
    }

    /// Next frame's raw little-endian bytes, or `None` at a clean end of file.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, DepthReadError> {
        let record = self.record;
        let frame = match self.frame_len {
            Some(len) => {
                let mut buf = vec![0u8; len];
                match read_full(&mut self.inner, &mut buf)? {
                    0 => return Ok(None),
                    n if n < len => return Err(DepthReadError::Truncated { record }),
                    _ => buf,
                }
            }
            None => {
                let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
                match read_full(&mut self.inner, &mut prefix)? {
                    0 => return Ok(None),
                    LENGTH_PREFIX_SIZE => {}
                    _ => return Err(DepthReadError::Truncated { record }),
                }
                let len = i32::from_le_bytes(prefix);
                if len < 0 {
                    return Err(DepthReadError::InvalidLength { record, len });
                }
                let mut payload = vec![0u8; len as usize];
                if read_full(&mut self.inner, &mut payload)? < payload.len() {
                    return Err(DepthReadError::Truncated { record });
                }
                let mut frame = Vec::new();
                DeflateDecoder::new(payload.as_slice())
                    .read_to_end(&mut frame)
                    .map_err(|source| DepthReadError::Inflate { record, source })?;
                frame
            }
        };
        self.record += 1;
        Ok(Some(frame))
    }
}

impl<R: Read> Iterator for DepthReader<R> {
    type Item = Result<Vec<u8>, DepthReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.next_frame().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

/// Decode a little-endian u16 frame.
pub fn decode_samples(raw: &[u8]) -> Vec<u16> {
    raw.chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
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

    fn frame(seed: u16, samples: usize) -> Vec<u8> {
        (0..samples)
            .flat_map(|i| (seed.wrapping_mul(31).wrapping_add(i as u16 / 4)).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_compressed_records_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.bin");
        let frames: Vec<Vec<u8>> = (0..7).map(|i| frame(i, 256 * 192)).collect();

        let mut writer = DepthWriter::open(&path, true);
        for f in &frames {
            assert!(matches!(
                writer.write_frame(f).unwrap(),
                WriteOutcome::Written { .. }
            ));
        }
        let summary = writer.finish().unwrap();
        assert_eq!(summary.records, 7);
        assert_eq!(summary.bytes, std::fs::metadata(&path).unwrap().len());
        assert!(summary.bytes < (frames.len() * frames[0].len()) as u64);

        let read: Vec<Vec<u8>> = DepthReader::open_compressed(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(read, frames);
    }

    #[test]
    fn test_record_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.bin");
        let mut writer = DepthWriter::open(&path, true);
        writer.write_frame(&frame(1, 64)).unwrap();
        writer.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let len = i32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(bytes.len(), LENGTH_PREFIX_SIZE + len);

        // Raw deflate: no zlib header.
        let mut inflated = Vec::new();
        DeflateDecoder::new(&bytes[4..])
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, frame(1, 64));
    }

    #[test]
    fn test_uncompressed_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.bin");
        let mut writer = DepthWriter::open(&path, false);
        writer.write_frame(&frame(1, 8)).unwrap();
        writer.write_frame(&frame(2, 8)).unwrap();
        writer.finish().unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 32);
        let mut reader = DepthReader::open_uncompressed(&path, 16).unwrap();
        assert_eq!(reader.next_frame().unwrap(), Some(frame(1, 8)));
        assert_eq!(reader.next_frame().unwrap(), Some(frame(2, 8)));
        assert_eq!(reader.next_frame().unwrap(), None);
    }

    #[test]
    fn test_truncated_trailing_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.bin");
        let mut writer = DepthWriter::open(&path, true);
        for i in 0..3 {
            writer.write_frame(&frame(i, 128)).unwrap();
        }
        writer.finish().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);

        let results: Vec<_> = DepthReader::compressed(bytes.as_slice()).collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok() && results[1].is_ok());
        assert!(matches!(
            results[2],
            Err(DepthReadError::Truncated { record: 2 })
        ));
    }

    #[test]
    fn test_detached_writer_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("depth.bin");
        let mut writer = DepthWriter::open(&path, true);
        assert!(!writer.is_attached());
        assert_eq!(writer.write_frame(&frame(0, 4)).unwrap(), WriteOutcome::Detached);
        assert_eq!(writer.write_frame(&frame(1, 4)).unwrap(), WriteOutcome::Detached);

        let summary = writer.finish().unwrap();
        assert_eq!(summary.records, 0);
        assert_eq!(summary.detached, 2);
    }

    #[test]
    fn test_negative_length_is_rejected() {
        let bytes = (-1i32).to_le_bytes();
        let mut reader = DepthReader::compressed(&bytes[..]);
        assert!(matches!(
            reader.next_frame(),
            Err(DepthReadError::InvalidLength { record: 0, len: -1 })
        ));
    }

    #[test]
    fn test_decode_samples() {
        assert_eq!(decode_samples(&[0xe8, 0x03, 0xff, 0xff]), vec![1000, 65535]);
    }
}
