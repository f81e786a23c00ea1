//! Handles over entries produced by an extraction. A handle never outlives
//! the `gathering_extract` call that produced it: disk-backed entries sit in
//! a scoped temp dir, slice-backed entries borrow the reader's shared buffer
//! through an `Arc` and an index range.

use std::io::{self, Cursor, Read};
use std::ops::Range;
use std::sync::Arc;
use std::time::SystemTime;

use mason_core::{AbsolutePath, ReadSeek, RelativePath};

pub enum ExtractedFile {
    /// A file a native tool or unpacker left on disk.
    Disk {
        name: RelativePath,
        path: AbsolutePath,
        last_modified: Option<SystemTime>,
    },
    /// A zero-copy window into an in-memory pack.
    Slice {
        name: RelativePath,
        buffer: Arc<Vec<u8>>,
        range: Range<usize>,
    },
    /// Bytes materialised by an in-process container reader.
    Memory {
        name: RelativePath,
        bytes: Vec<u8>,
    },
}

impl ExtractedFile {
    pub fn name(&self) -> &RelativePath {
        match self {
            ExtractedFile::Disk { name, .. }
            | ExtractedFile::Slice { name, .. }
            | ExtractedFile::Memory { name, .. } => name,
        }
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        match self {
            ExtractedFile::Disk { last_modified, .. } => *last_modified,
            _ => None,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            ExtractedFile::Disk { path, .. } => std::fs::metadata(path.as_std())
                .map(|meta| meta.len())
                .unwrap_or(0),
            ExtractedFile::Slice { range, .. } => range.len() as u64,
            ExtractedFile::Memory { bytes, .. } => bytes.len() as u64,
        }
    }

    pub fn open(&self) -> io::Result<Box<dyn ReadSeek>> {
        match self {
            ExtractedFile::Disk { path, .. } => {
                let file = std::fs::File::open(path.as_std())?;
                Ok(Box::new(io::BufReader::new(file)))
            }
            ExtractedFile::Slice { buffer, range, .. } => Ok(Box::new(Cursor::new(
                buffer[range.clone()].to_vec(),
            ))),
            ExtractedFile::Memory { bytes, .. } => Ok(Box::new(Cursor::new(bytes.clone()))),
        }
    }

    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        match self {
            ExtractedFile::Disk { path, .. } => std::fs::read(path.as_std()),
            ExtractedFile::Slice { buffer, range, .. } => Ok(buffer[range.clone()].to_vec()),
            ExtractedFile::Memory { bytes, .. } => Ok(bytes.clone()),
        }
    }

    /// Consumes the handle, transferring ownership of the bytes to `target`.
    /// Disk entries are renamed when possible; everything else is written
    /// through a scratch file so a cancelled move never leaves a partial
    /// target.
    pub fn move_to(self, target: &AbsolutePath) -> io::Result<()> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent.as_std())?;
        }
        match self {
            ExtractedFile::Disk { path, .. } => {
                match std::fs::rename(path.as_std(), target.as_std()) {
                    Ok(()) => Ok(()),
                    // Cross-device rename: fall back to copy + remove.
                    Err(_) => {
                        std::fs::copy(path.as_std(), target.as_std())?;
                        std::fs::remove_file(path.as_std())
                    }
                }
            }
            ExtractedFile::Slice { buffer, range, .. } => {
                write_atomic(target, &buffer[range])
            }
            ExtractedFile::Memory { bytes, .. } => write_atomic(target, &bytes),
        }
    }
}

/// Writes to `<target>.scratch` then renames into place.
pub fn write_atomic(target: &AbsolutePath, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent.as_std())?;
    }
    let scratch = target
        .parent()
        .unwrap_or_else(|| target.clone())
        .join(&format!(
            ".{}.scratch",
            target.file_name().unwrap_or("unnamed")
        ));
    std::fs::write(scratch.as_std(), bytes)?;
    std::fs::rename(scratch.as_std(), target.as_std())
}

/// Streaming variant of [`write_atomic`] for sources too large to buffer.
pub fn write_atomic_from<R: Read>(target: &AbsolutePath, reader: &mut R) -> io::Result<u64> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent.as_std())?;
    }
    let scratch = target
        .parent()
        .unwrap_or_else(|| target.clone())
        .join(&format!(
            ".{}.scratch",
            target.file_name().unwrap_or("unnamed")
        ));
    let mut file = std::fs::File::create(scratch.as_std())?;
    let written = io::copy(reader, &mut file)?;
    drop(file);
    std::fs::rename(scratch.as_std(), target.as_std())?;
    Ok(written)
}
