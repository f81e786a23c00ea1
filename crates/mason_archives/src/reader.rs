//! One reader over every game-container generation. The installer opens a
//! stream, the facade picks the concrete reader from the magic, and entries
//! come back as `(path, size)` with per-entry payload reads.

use mason_core::{signature, FileSignature, ReadSeek, RelativePath, StreamSource};

use crate::ba2::Ba2Reader;
use crate::bsa::BsaReader;
use crate::error::{ContainerError, Result};
use crate::tes3::Tes3Reader;

#[derive(Debug, Clone)]
pub struct ContainerEntry {
    pub path: RelativePath,
    pub size: u64,
}

pub enum ContainerReader {
    Bsa(BsaReader<Box<dyn ReadSeek>>),
    Ba2(Ba2Reader<Box<dyn ReadSeek>>),
    Tes3(Tes3Reader<Box<dyn ReadSeek>>),
}

impl ContainerReader {
    pub fn open(source: &dyn StreamSource) -> Result<Self> {
        let mut stream = source.open()?;
        match signature::detect(&mut stream)? {
            Some(FileSignature::Bsa) => Ok(Self::Bsa(BsaReader::open(stream)?)),
            Some(FileSignature::Ba2) => Ok(Self::Ba2(Ba2Reader::open(stream)?)),
            Some(FileSignature::Tes3) => Ok(Self::Tes3(Tes3Reader::open(stream)?)),
            other => Err(ContainerError::Malformed(format!(
                "{} is not a game container (detected {other:?})",
                source.name()
            ))),
        }
    }

    pub fn entries(&self) -> Vec<ContainerEntry> {
        match self {
            Self::Bsa(reader) => reader
                .entries()
                .iter()
                .map(|entry| ContainerEntry {
                    path: entry.path.clone(),
                    size: entry.size,
                })
                .collect(),
            Self::Ba2(reader) => reader
                .entries()
                .iter()
                .map(|entry| ContainerEntry {
                    path: entry.path.clone(),
                    size: entry.size,
                })
                .collect(),
            Self::Tes3(reader) => reader
                .entries()
                .iter()
                .map(|entry| ContainerEntry {
                    path: entry.path.clone(),
                    size: entry.size,
                })
                .collect(),
        }
    }

    pub fn read_entry(&mut self, index: usize) -> Result<Vec<u8>> {
        match self {
            Self::Bsa(reader) => reader.read_entry(index),
            Self::Ba2(reader) => reader.read_entry(index),
            Self::Tes3(reader) => reader.read_entry(index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsa::BsaBuilder;
    use mason_core::MemorySource;
    use std::io::Cursor;

    #[test]
    fn facade_dispatches_on_magic() {
        let mut builder = BsaBuilder::new(105, 0, 0x1).unwrap();
        builder
            .add_file(
                &RelativePath::new("meshes/a.nif").unwrap(),
                &b"payload"[..],
                false,
            )
            .unwrap();
        let mut buffer = Cursor::new(Vec::new());
        builder.write_to(&mut buffer).unwrap();

        let source = MemorySource::new("test.bsa", buffer.into_inner());
        let mut reader = ContainerReader::open(&source).unwrap();
        assert!(matches!(reader, ContainerReader::Bsa(_)));
        let entries = reader.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path.as_str(), "meshes/a.nif");
        assert_eq!(reader.read_entry(0).unwrap(), b"payload");
    }

    #[test]
    fn rejects_non_container_streams() {
        let source = MemorySource::new("not.bsa", b"PK\x03\x04zipdata".to_vec());
        assert!(ContainerReader::open(&source).is_err());
    }
}
