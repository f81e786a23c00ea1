//! Stream factories. Extraction sources are opened lazily and possibly more
//! than once (format detection, then the real pass), so the unit of exchange
//! is a reopenable source rather than a live reader.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek};
use std::sync::Arc;

use crate::path::AbsolutePath;

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// A named, sized source that can hand out independent readers.
pub trait StreamSource: Send + Sync {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    fn open(&self) -> io::Result<Box<dyn ReadSeek>>;
}

/// A source backed by a file on disk.
pub struct FileSource {
    path: AbsolutePath,
    size: u64,
}

impl FileSource {
    pub fn new(path: AbsolutePath) -> io::Result<Self> {
        let size = std::fs::metadata(path.as_std())?.len();
        Ok(Self { path, size })
    }

    pub fn path(&self) -> &AbsolutePath {
        &self.path
    }
}

impl StreamSource for FileSource {
    fn name(&self) -> &str {
        self.path.file_name().unwrap_or(self.path.as_str())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn open(&self) -> io::Result<Box<dyn ReadSeek>> {
        let file = File::open(self.path.as_std())?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// A source over bytes already in memory; readers share the buffer.
pub struct MemorySource {
    name: String,
    bytes: Arc<Vec<u8>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes: Arc::new(bytes),
        }
    }

    pub fn bytes(&self) -> &Arc<Vec<u8>> {
        &self.bytes
    }
}

impl StreamSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn open(&self) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(Cursor::new(SharedBytes(self.bytes.clone()))))
    }
}

/// Lets a `Cursor` borrow the shared buffer without copying it.
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
