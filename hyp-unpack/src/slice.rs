//! Seekable views over one or several files
//!
//! Large archives ship split into `.001`/`.002`... volumes and patch data
//! ships packed into shared blobs. Both cases need standard seekable-stream
//! semantics over bytes that are not one contiguous file:
//!
//! - [`FileSliceStream`] exposes a window `[start, start + len)` of one
//!   underlying stream
//! - [`CombinedStream`] exposes an ordered list of files as one contiguous
//!   stream
//!
//! Both are hot-path types for multi-gigabyte installs and hold nothing
//! beyond the file handles and a few counters.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Read-only window over a seekable stream
#[derive(Debug)]
pub struct FileSliceStream<R> {
    inner: R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> FileSliceStream<R> {
    /// Create a window of `len` bytes starting at `start`
    pub fn new(mut inner: R, start: u64, len: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(start))?;
        Ok(Self {
            inner,
            start,
            len,
            pos: 0,
        })
    }

    /// Window length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl FileSliceStream<File> {
    /// Open a window over a file on disk
    pub fn open(path: &Path, start: u64, len: u64) -> io::Result<Self> {
        Self::new(File::open(path)?, start, len)
    }
}

impl<R: Read + Seek> Read for FileSliceStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len - self.pos;
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let read = self.inner.read(&mut buf[..want])?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl<R: Read + Seek> Seek for FileSliceStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.len) + i128::from(delta),
        };
        let target = target.clamp(0, i128::from(self.len)) as u64;
        self.inner.seek(SeekFrom::Start(self.start + target))?;
        self.pos = target;
        Ok(self.pos)
    }
}

struct Volume {
    file: File,
    /// Cumulative offset of this volume's first byte
    offset: u64,
    len: u64,
}

/// Ordered list of files exposed as one contiguous seekable stream
///
/// Reads and seeks spanning volume boundaries are transparent; the archive
/// readers never learn the payload is split.
pub struct CombinedStream {
    volumes: Vec<Volume>,
    total_len: u64,
    pos: u64,
    /// Volume whose handle is positioned at `pos`, when in sync
    synced: Option<usize>,
}

impl CombinedStream {
    /// Open all volumes in order
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> io::Result<Self> {
        let mut volumes = Vec::with_capacity(paths.len());
        let mut offset = 0u64;
        for path in paths {
            let file = File::open(path)?;
            let len = file.metadata()?.len();
            volumes.push(Volume { file, offset, len });
            offset += len;
        }
        Ok(Self {
            volumes,
            total_len: offset,
            pos: 0,
            synced: None,
        })
    }

    /// Total length across all volumes
    pub fn len(&self) -> u64 {
        self.total_len
    }

    /// Whether the stream is empty
    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    fn volume_at(&self, pos: u64) -> Option<usize> {
        self.volumes
            .iter()
            .position(|v| pos >= v.offset && pos < v.offset + v.len)
    }
}

impl Read for CombinedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.total_len || buf.is_empty() {
            return Ok(0);
        }
        let Some(index) = self.volume_at(self.pos) else {
            return Ok(0);
        };
        let volume = &mut self.volumes[index];
        if self.synced != Some(index) {
            volume.file.seek(SeekFrom::Start(self.pos - volume.offset))?;
        }
        let end = volume.offset + volume.len;
        let want = buf
            .len()
            .min(usize::try_from(end - self.pos).unwrap_or(usize::MAX));
        let read = volume.file.read(&mut buf[..want])?;
        self.pos += read as u64;
        // Handle stays positioned at the new pos unless we crossed the end
        self.synced = if self.pos < end { Some(index) } else { None };
        Ok(read)
    }
}

impl Seek for CombinedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.total_len) + i128::from(delta),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of combined stream",
            ));
        }
        self.pos = target.min(i128::from(self.total_len)) as u64;
        self.synced = None;
        Ok(self.pos)
    }
}
