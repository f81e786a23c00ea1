//! BTAR: a flat big-endian pack of named payloads. The reader keeps the
//! whole source in one shared buffer and hands out `(offset, length)` slices,
//! so extraction is zero-copy until a caller materialises an entry.

use std::io::Read;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};
use mason_core::{RelativePath, StreamSource};

use crate::error::{ContainerError, Result};

const MAGIC: u32 = u32::from_be_bytes(*b"BTAR");
const MAJOR: u16 = 1;
const MINORS: [u16; 3] = [2, 3, 4];

#[derive(Debug, Clone)]
pub struct BtarEntry {
    pub name: RelativePath,
    offset: usize,
    length: usize,
}

impl BtarEntry {
    pub fn len(&self) -> u64 {
        self.length as u64
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.length
    }
}

pub struct BtarReader {
    bytes: Arc<Vec<u8>>,
    version: (u16, u16),
    entries: Vec<BtarEntry>,
}

impl BtarReader {
    pub fn open(source: &dyn StreamSource) -> Result<Self> {
        let mut bytes = Vec::with_capacity(source.size() as usize);
        source.open()?.read_to_end(&mut bytes)?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(&bytes);

        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(ContainerError::InvalidMagic(magic));
        }
        let major = cursor.read_u16::<BigEndian>()?;
        let minor = cursor.read_u16::<BigEndian>()?;
        if major != MAJOR || !MINORS.contains(&minor) {
            return Err(ContainerError::UnsupportedVersion(
                ((major as u32) << 16) | minor as u32,
            ));
        }

        let total = bytes.len() as u64;
        let mut entries = Vec::new();
        while cursor.position() < total {
            let name_length = cursor.read_u16::<BigEndian>()? as u64;
            if cursor.position() + name_length > total {
                return Err(ContainerError::Malformed(format!(
                    "entry name of {name_length} bytes overruns the archive"
                )));
            }
            let mut name_bytes = vec![0u8; name_length as usize];
            cursor.read_exact(&mut name_bytes)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| ContainerError::Malformed("entry name is not UTF-8".into()))?;
            let name = RelativePath::new(name)
                .map_err(|err| ContainerError::Malformed(err.to_string()))?;

            let data_length = cursor.read_u64::<BigEndian>()?;
            let offset = cursor.position();
            if offset + data_length > total {
                return Err(ContainerError::Malformed(format!(
                    "entry '{name}' of {data_length} bytes overruns the archive"
                )));
            }
            entries.push(BtarEntry {
                name,
                offset: offset as usize,
                length: data_length as usize,
            });
            cursor.set_position(offset + data_length);
        }

        Ok(Self {
            bytes: Arc::new(bytes),
            version: (major, minor),
            entries,
        })
    }

    pub fn version(&self) -> (u16, u16) {
        self.version
    }

    pub fn entries(&self) -> &[BtarEntry] {
        &self.entries
    }

    /// The entry's payload, borrowed from the shared buffer.
    pub fn bytes_of(&self, entry: &BtarEntry) -> &[u8] {
        &self.bytes[entry.range()]
    }

    /// Shared buffer handle for handles that outlive a borrow of `self`
    /// (they still never outlive the gathering-extract call that made them).
    pub fn shared_buffer(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.bytes)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use byteorder::{BigEndian, WriteBytesExt};
    use std::io::Write;

    /// Builds BTAR bytes for tests; production never writes the format.
    pub fn build_btar(minor: u16, entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_all(b"BTAR").unwrap();
        out.write_u16::<BigEndian>(1).unwrap();
        out.write_u16::<BigEndian>(minor).unwrap();
        for (name, payload) in entries {
            out.write_u16::<BigEndian>(name.len() as u16).unwrap();
            out.write_all(name.as_bytes()).unwrap();
            out.write_u64::<BigEndian>(payload.len() as u64).unwrap();
            out.write_all(payload).unwrap();
        }
        out
    }
}
