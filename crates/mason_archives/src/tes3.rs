//! Reader for the oldest container generation (version 0x100). The engine
//! only ever reads these; nothing in a modlist rebuilds them.
//!
//! Layout: 12-byte header (version, hash-table offset, file count), then
//! size/offset pairs, name offsets, the name block, the hash table, and
//! finally raw file data. Offsets in the records are relative to the end of
//! the hash table.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use mason_core::RelativePath;

use crate::error::{ContainerError, Result};

pub const VERSION: u32 = 0x100;

#[derive(Debug, Clone)]
pub struct Tes3Entry {
    pub path: RelativePath,
    pub size: u64,
    offset: u64,
}

pub struct Tes3Reader<R> {
    source: R,
    entries: Vec<Tes3Entry>,
}

impl<R: Read + Seek> Tes3Reader<R> {
    pub fn open(mut source: R) -> Result<Self> {
        let version = source.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(ContainerError::InvalidMagic(version));
        }
        let hash_table_offset = u64::from(source.read_u32::<LittleEndian>()?);
        let file_count = source.read_u32::<LittleEndian>()? as usize;

        let mut sizes = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            let size = source.read_u32::<LittleEndian>()?;
            let offset = source.read_u32::<LittleEndian>()?;
            sizes.push((size, offset));
        }

        let mut name_offsets = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            name_offsets.push(source.read_u32::<LittleEndian>()? as usize);
        }

        // The name block fills the space up to the hash table.
        let names_start = source.stream_position()?;
        let names_end = 12 + hash_table_offset;
        if names_end < names_start {
            return Err(ContainerError::Malformed(
                "hash table overlaps the name block".into(),
            ));
        }
        let mut name_block = vec![0u8; (names_end - names_start) as usize];
        source.read_exact(&mut name_block)?;

        let data_start = names_end + 8 * file_count as u64;

        let mut entries = Vec::with_capacity(file_count);
        for ((size, offset), name_offset) in sizes.into_iter().zip(name_offsets) {
            let terminator = name_block[name_offset..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| {
                    ContainerError::Malformed("unterminated name in name block".into())
                })?;
            // Names are stored with `\` separators.
            let name =
                String::from_utf8_lossy(&name_block[name_offset..name_offset + terminator])
                    .replace('\\', "/");
            let path = RelativePath::new(name)
                .map_err(|err| ContainerError::Malformed(err.to_string()))?;
            entries.push(Tes3Entry {
                path,
                size: u64::from(size),
                offset: data_start + u64::from(offset),
            });
        }

        Ok(Self { source, entries })
    }

    pub fn entries(&self) -> &[Tes3Entry] {
        &self.entries
    }

    pub fn read_entry(&mut self, index: usize) -> Result<Vec<u8>> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| ContainerError::EntryNotFound(format!("#{index}")))?
            .clone();
        self.source.seek(SeekFrom::Start(entry.offset))?;
        let mut out = vec![0u8; entry.size as usize];
        self.source.read_exact(&mut out)?;
        Ok(out)
    }
}
