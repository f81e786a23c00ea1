//! The folder-indexed game container (versions 104 and 105). Paths are
//! stored with `\` separators and hashed with the engine-specific name hash;
//! folders and files are ordered by hash, and per-file compression can
//! deviate from the archive default.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use mason_core::RelativePath;

use crate::error::{ContainerError, Result};

pub const MAGIC: [u8; 4] = *b"BSA\x00";

pub const FLAG_INCLUDE_DIR_NAMES: u32 = 0x01;
pub const FLAG_INCLUDE_FILE_NAMES: u32 = 0x02;
pub const FLAG_COMPRESSED_BY_DEFAULT: u32 = 0x04;

const HEADER_SIZE: u32 = 36;
const SIZE_COMPRESSION_FLIP: u32 = 0x4000_0000;

/// The name hash used for folder and file ordering. Operates on the
/// lowercased name with `\` separators.
pub fn name_hash(name: &str) -> u64 {
    let name = name.to_ascii_lowercase().replace('/', "\\");
    let (stem, ext) = match name.rfind('.') {
        // A leading dot is part of the stem, not an extension.
        Some(0) | None => (name.as_str(), ""),
        Some(pos) => (&name[..pos], &name[pos..]),
    };

    let bytes = stem.as_bytes();
    let mut low: u32 = 0;
    if !bytes.is_empty() {
        low = u32::from(bytes[bytes.len() - 1]);
        if bytes.len() > 2 {
            low |= u32::from(bytes[bytes.len() - 2]) << 8;
        }
        low |= (bytes.len() as u32) << 16;
        low |= u32::from(bytes[0]) << 24;
    }
    match ext {
        ".kf" => low |= 0x80,
        ".nif" => low |= 0x8000,
        ".dds" => low |= 0x8080,
        ".wav" => low |= 0x8000_0000,
        _ => {}
    }

    let mut high: u32 = 0;
    if bytes.len() > 2 {
        for &b in &bytes[1..bytes.len() - 2] {
            high = high.wrapping_mul(0x1003f).wrapping_add(u32::from(b));
        }
    }
    let mut ext_hash: u32 = 0;
    for &b in ext.as_bytes() {
        ext_hash = ext_hash.wrapping_mul(0x1003f).wrapping_add(u32::from(b));
    }

    (u64::from(high.wrapping_add(ext_hash)) << 32) | u64::from(low)
}

// ── Writer ──────────────────────────────────────────────────────────

struct PendingFile {
    name: String,
    hash: u64,
    data: Vec<u8>,
    flip_compression: bool,
}

struct PendingFolder {
    name: String,
    hash: u64,
    files: Vec<PendingFile>,
}

pub struct BsaBuilder {
    version: u32,
    archive_flags: u32,
    file_flags: u32,
    folders: BTreeMap<u64, PendingFolder>,
}

impl BsaBuilder {
    pub fn new(version: u32, archive_flags: u32, file_flags: u32) -> Result<Self> {
        if version != 104 && version != 105 {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        Ok(Self {
            // Names are always present; readers here require them.
            version,
            archive_flags: archive_flags | FLAG_INCLUDE_DIR_NAMES | FLAG_INCLUDE_FILE_NAMES,
            file_flags,
            folders: BTreeMap::new(),
        })
    }

    /// Queues one member. `flip_compression` inverts the archive default for
    /// this file alone.
    pub fn add_file<R: Read>(
        &mut self,
        path: &RelativePath,
        mut reader: R,
        flip_compression: bool,
    ) -> Result<()> {
        let folder_name = path
            .parent()
            .map(|p| p.as_str().replace('/', "\\").to_ascii_lowercase())
            .unwrap_or_default();
        let file_name = path.file_name().to_ascii_lowercase();
        if file_name.is_empty() {
            return Err(ContainerError::InvalidPath(path.to_string()));
        }

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let folder_hash = name_hash(&folder_name);
        let folder = self
            .folders
            .entry(folder_hash)
            .or_insert_with(|| PendingFolder {
                name: folder_name,
                hash: folder_hash,
                files: Vec::new(),
            });
        folder.files.push(PendingFile {
            hash: name_hash(&file_name),
            name: file_name,
            data,
            flip_compression,
        });
        Ok(())
    }

    pub fn write_to<W: Write + Seek>(mut self, writer: &mut W) -> Result<()> {
        for folder in self.folders.values_mut() {
            folder.files.sort_by_key(|file| file.hash);
        }

        let compress_default = self.archive_flags & FLAG_COMPRESSED_BY_DEFAULT != 0;
        let folder_record_size: u64 = if self.version >= 105 { 24 } else { 16 };

        let total_folder_name_length: u32 = self
            .folders
            .values()
            .map(|f| f.name.len() as u32 + 1)
            .sum();
        let total_file_name_length: u32 = self
            .folders
            .values()
            .flat_map(|f| &f.files)
            .map(|file| file.name.len() as u32 + 1)
            .sum();
        let file_count: u32 = self.folders.values().map(|f| f.files.len() as u32).sum();

        writer.write_all(&MAGIC)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(HEADER_SIZE)?;
        writer.write_u32::<LittleEndian>(self.archive_flags)?;
        writer.write_u32::<LittleEndian>(self.folders.len() as u32)?;
        writer.write_u32::<LittleEndian>(file_count)?;
        writer.write_u32::<LittleEndian>(total_folder_name_length)?;
        writer.write_u32::<LittleEndian>(total_file_name_length)?;
        writer.write_u32::<LittleEndian>(self.file_flags)?;

        // Folder record block offsets are computed up front; the quirk of
        // the format is that each recorded offset includes the total file
        // name length.
        let folder_records_start = u64::from(HEADER_SIZE);
        let file_records_start =
            folder_records_start + folder_record_size * self.folders.len() as u64;

        let mut running = file_records_start;
        let mut folder_offsets = Vec::with_capacity(self.folders.len());
        for folder in self.folders.values() {
            folder_offsets.push(running + u64::from(total_file_name_length));
            running += 1 + folder.name.len() as u64 + 1; // bzstring
            running += 16 * folder.files.len() as u64;
        }
        let data_start = running + u64::from(total_file_name_length);

        // Compress payloads now so file records can carry final sizes.
        struct Packed {
            hash: u64,
            block: Vec<u8>,
            flipped: bool,
        }
        let mut packed: Vec<Vec<Packed>> = Vec::with_capacity(self.folders.len());
        for folder in self.folders.values() {
            let mut folder_packed = Vec::with_capacity(folder.files.len());
            for file in &folder.files {
                let compressed = compress_default != file.flip_compression;
                let block = if compressed {
                    let mut block = Vec::with_capacity(file.data.len() / 2 + 8);
                    block.write_u32::<LittleEndian>(file.data.len() as u32)?;
                    let mut encoder = ZlibEncoder::new(block, Compression::default());
                    encoder.write_all(&file.data)?;
                    encoder.finish()?
                } else {
                    file.data.clone()
                };
                folder_packed.push(Packed {
                    hash: file.hash,
                    block,
                    flipped: file.flip_compression,
                });
            }
            packed.push(folder_packed);
        }

        // Folder records.
        for (folder, offset) in self.folders.values().zip(&folder_offsets) {
            writer.write_u64::<LittleEndian>(folder.hash)?;
            writer.write_u32::<LittleEndian>(folder.files.len() as u32)?;
            if self.version >= 105 {
                writer.write_u32::<LittleEndian>(0)?;
                writer.write_u64::<LittleEndian>(*offset)?;
            } else {
                writer.write_u32::<LittleEndian>(*offset as u32)?;
            }
        }

        // File record blocks, each prefixed by the folder's bzstring name.
        let mut data_offset = data_start;
        for (folder, folder_packed) in self.folders.values().zip(&packed) {
            writer.write_u8(folder.name.len() as u8 + 1)?;
            writer.write_all(folder.name.as_bytes())?;
            writer.write_u8(0)?;
            for file in folder_packed {
                let mut size = file.block.len() as u32;
                if file.flipped {
                    size |= SIZE_COMPRESSION_FLIP;
                }
                writer.write_u64::<LittleEndian>(file.hash)?;
                writer.write_u32::<LittleEndian>(size)?;
                writer.write_u32::<LittleEndian>(data_offset as u32)?;
                data_offset += file.block.len() as u64;
            }
        }

        // File name block.
        for folder in self.folders.values() {
            for file in &folder.files {
                writer.write_all(file.name.as_bytes())?;
                writer.write_u8(0)?;
            }
        }

        // Data.
        for folder_packed in &packed {
            for file in folder_packed {
                writer.write_all(&file.block)?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

// ── Reader ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BsaEntry {
    pub path: RelativePath,
    pub size: u64,
    offset: u64,
    block_size: u32,
    compressed: bool,
}

pub struct BsaReader<R> {
    source: R,
    version: u32,
    archive_flags: u32,
    file_flags: u32,
    entries: Vec<BsaEntry>,
}

impl<R: Read + Seek> BsaReader<R> {
    pub fn open(mut source: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        source.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(ContainerError::InvalidMagic(u32::from_le_bytes(magic)));
        }
        let version = source.read_u32::<LittleEndian>()?;
        if version != 104 && version != 105 {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        let _offset = source.read_u32::<LittleEndian>()?;
        let archive_flags = source.read_u32::<LittleEndian>()?;
        let folder_count = source.read_u32::<LittleEndian>()?;
        let file_count = source.read_u32::<LittleEndian>()?;
        let _total_folder_name_length = source.read_u32::<LittleEndian>()?;
        let total_file_name_length = source.read_u32::<LittleEndian>()?;
        let file_flags = source.read_u32::<LittleEndian>()?;

        if archive_flags & (FLAG_INCLUDE_DIR_NAMES | FLAG_INCLUDE_FILE_NAMES)
            != (FLAG_INCLUDE_DIR_NAMES | FLAG_INCLUDE_FILE_NAMES)
        {
            return Err(ContainerError::Malformed(
                "archive without embedded names".into(),
            ));
        }
        let compress_default = archive_flags & FLAG_COMPRESSED_BY_DEFAULT != 0;

        let mut folder_file_counts = Vec::with_capacity(folder_count as usize);
        for _ in 0..folder_count {
            let _hash = source.read_u64::<LittleEndian>()?;
            let count = source.read_u32::<LittleEndian>()?;
            if version >= 105 {
                let _padding = source.read_u32::<LittleEndian>()?;
                let _offset = source.read_u64::<LittleEndian>()?;
            } else {
                let _offset = source.read_u32::<LittleEndian>()?;
            }
            folder_file_counts.push(count);
        }

        struct RawFile {
            folder: String,
            size: u32,
            offset: u32,
        }
        let mut raw_files = Vec::with_capacity(file_count as usize);
        for count in folder_file_counts {
            let name_len = source.read_u8()? as usize;
            let mut name = vec![0u8; name_len];
            source.read_exact(&mut name)?;
            // Trailing null is inside the counted length.
            let folder = String::from_utf8_lossy(&name[..name_len.saturating_sub(1)]).into_owned();
            for _ in 0..count {
                let _hash = source.read_u64::<LittleEndian>()?;
                let size = source.read_u32::<LittleEndian>()?;
                let offset = source.read_u32::<LittleEndian>()?;
                raw_files.push(RawFile {
                    folder: folder.clone(),
                    size,
                    offset,
                });
            }
        }

        let mut names_block = vec![0u8; total_file_name_length as usize];
        source.read_exact(&mut names_block)?;
        let names: Vec<String> = names_block
            .split(|&b| b == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect();
        if names.len() != raw_files.len() {
            return Err(ContainerError::Malformed(format!(
                "{} file names for {} file records",
                names.len(),
                raw_files.len()
            )));
        }

        let mut entries = Vec::with_capacity(raw_files.len());
        for (raw, name) in raw_files.iter().zip(names) {
            let flipped = raw.size & SIZE_COMPRESSION_FLIP != 0;
            let block_size = raw.size & !SIZE_COMPRESSION_FLIP;
            let compressed = compress_default != flipped;
            // Stored folder names use `\` separators; translate before
            // constructing the canonical path.
            let folder = raw.folder.replace('\\', "/");
            let full = if folder.is_empty() {
                name.clone()
            } else {
                format!("{folder}/{name}")
            };
            let path = RelativePath::new(full)
                .map_err(|err| ContainerError::Malformed(err.to_string()))?;
            entries.push(BsaEntry {
                path,
                // Uncompressed size is only known after inflation; report
                // the stored block size for listings.
                size: u64::from(block_size),
                offset: u64::from(raw.offset),
                block_size,
                compressed,
            });
        }

        Ok(Self {
            source,
            version,
            archive_flags,
            file_flags,
            entries,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn archive_flags(&self) -> u32 {
        self.archive_flags
    }

    pub fn file_flags(&self) -> u32 {
        self.file_flags
    }

    pub fn entries(&self) -> &[BsaEntry] {
        &self.entries
    }

    pub fn read_entry(&mut self, index: usize) -> Result<Vec<u8>> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| ContainerError::EntryNotFound(format!("#{index}")))?
            .clone();
        self.source.seek(SeekFrom::Start(entry.offset))?;
        let mut block = vec![0u8; entry.block_size as usize];
        self.source.read_exact(&mut block)?;

        if entry.compressed {
            let mut cursor = std::io::Cursor::new(&block);
            let original_size = cursor.read_u32::<LittleEndian>()? as usize;
            let mut out = Vec::with_capacity(original_size);
            ZlibDecoder::new(cursor).read_to_end(&mut out)?;
            if out.len() != original_size {
                return Err(ContainerError::Malformed(format!(
                    "inflated {} bytes, header said {}",
                    out.len(),
                    original_size
                )));
            }
            Ok(out)
        } else {
            Ok(block)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn rel(path: &str) -> RelativePath {
        RelativePath::new(path).unwrap()
    }

    #[test]
    fn name_hash_orders_extensions() {
        // Same stem, different extensions must differ.
        assert_ne!(name_hash("meshes\\chair.nif"), name_hash("meshes\\chair.dds"));
        // Case and separator insensitive.
        assert_eq!(name_hash("Meshes/Chair.NIF"), name_hash("meshes\\chair.nif"));
    }

    #[test]
    fn uncompressed_round_trip() {
        let mut builder = BsaBuilder::new(105, 0, 0x1).unwrap();
        builder
            .add_file(&rel("meshes/furniture/chair.nif"), &b"nif bytes"[..], false)
            .unwrap();
        builder
            .add_file(&rel("meshes/furniture/table.nif"), &b"table bytes"[..], false)
            .unwrap();
        builder
            .add_file(&rel("textures/wood.dds"), &b"dds bytes"[..], false)
            .unwrap();

        let mut buffer = Cursor::new(Vec::new());
        builder.write_to(&mut buffer).unwrap();
        buffer.set_position(0);

        let mut reader = BsaReader::open(buffer).unwrap();
        assert_eq!(reader.version(), 105);
        assert_eq!(reader.entries().len(), 3);

        let by_path: std::collections::HashMap<String, usize> = reader
            .entries()
            .iter()
            .enumerate()
            .map(|(i, e)| (e.path.lookup_key(), i))
            .collect();
        let chair = by_path["meshes/furniture/chair.nif"];
        assert_eq!(reader.read_entry(chair).unwrap(), b"nif bytes");
        let wood = by_path["textures/wood.dds"];
        assert_eq!(reader.read_entry(wood).unwrap(), b"dds bytes");
    }

    #[test]
    fn compressed_archive_with_flipped_file() {
        let mut builder =
            BsaBuilder::new(105, FLAG_COMPRESSED_BY_DEFAULT, 0x1).unwrap();
        let big = vec![0x42u8; 50_000];
        builder.add_file(&rel("meshes/big.nif"), big.as_slice(), false).unwrap();
        // Flipped against a compressed default means stored raw.
        builder
            .add_file(&rel("meshes/raw.nif"), &b"stored raw"[..], true)
            .unwrap();

        let mut buffer = Cursor::new(Vec::new());
        builder.write_to(&mut buffer).unwrap();

        // Compression actually shrank the repetitive payload.
        assert!((buffer.get_ref().len() as u64) < 50_000);

        buffer.set_position(0);
        let mut reader = BsaReader::open(buffer).unwrap();
        let by_path: std::collections::HashMap<String, usize> = reader
            .entries()
            .iter()
            .enumerate()
            .map(|(i, e)| (e.path.lookup_key(), i))
            .collect();
        assert_eq!(reader.read_entry(by_path["meshes/big.nif"]).unwrap(), big);
        assert_eq!(
            reader.read_entry(by_path["meshes/raw.nif"]).unwrap(),
            b"stored raw"
        );
    }

    #[test]
    fn v104_layout_round_trips() {
        let mut builder = BsaBuilder::new(104, 0, 0).unwrap();
        builder
            .add_file(&rel("scripts/init.pex"), &b"pex"[..], false)
            .unwrap();
        let mut buffer = Cursor::new(Vec::new());
        builder.write_to(&mut buffer).unwrap();
        buffer.set_position(0);

        let mut reader = BsaReader::open(buffer).unwrap();
        assert_eq!(reader.version(), 104);
        assert_eq!(reader.read_entry(0).unwrap(), b"pex");
    }

    #[test]
    fn rejects_unknown_version() {
        assert!(matches!(
            BsaBuilder::new(200, 0, 0),
            Err(ContainerError::UnsupportedVersion(200))
        ));
    }
}
