//! The chunked game container ("BTDX"). Two layouts share one header: the
//! general layout stores whole payloads, the texture layout stores chunked
//! DDS data with dimension metadata. Name hashes are CRC32 over the
//! lowercased `\`-separated path.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use mason_core::RelativePath;

use crate::error::{ContainerError, Result};
use crate::states::Ba2Format;

pub const MAGIC: [u8; 4] = *b"BTDX";
const FORMAT_GENERAL: [u8; 4] = *b"GNRL";
const FORMAT_DX10: [u8; 4] = *b"DX10";
const ALIGN: u32 = 0xBAAD_F00D;
const HEADER_SIZE: u64 = 24;

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(bytes);
    crc.sum()
}

/// `(name_hash, ext4, dir_hash)` for a stored path.
fn split_hashes(path: &RelativePath) -> (u32, [u8; 4], u32) {
    let stored = path.as_str().replace('/', "\\").to_ascii_lowercase();
    let (dir, name) = match stored.rfind('\\') {
        Some(pos) => (&stored[..pos], &stored[pos + 1..]),
        None => ("", stored.as_str()),
    };
    let (stem, ext) = match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(pos) => (&name[..pos], &name[pos + 1..]),
    };
    let mut ext4 = [0u8; 4];
    for (slot, byte) in ext4.iter_mut().zip(ext.bytes()) {
        *slot = byte;
    }
    (crc32(stem.as_bytes()), ext4, crc32(dir.as_bytes()))
}

/// Texture metadata carried by the DX10 layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub height: u16,
    pub width: u16,
    pub num_mips: u8,
    pub pixel_format: u8,
}

enum PendingPayload {
    General { packed: Vec<u8>, full_size: u32 },
    Texture { raw: Vec<u8>, info: TextureInfo },
}

struct PendingEntry {
    path: RelativePath,
    payload: PendingPayload,
}

pub struct Ba2Builder {
    version: u32,
    format: Ba2Format,
    entries: Vec<PendingEntry>,
}

impl Ba2Builder {
    pub fn new(version: u32, format: Ba2Format) -> Result<Self> {
        if version != 1 {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            format,
            entries: Vec::new(),
        })
    }

    pub fn add_file<R: Read>(&mut self, path: &RelativePath, mut reader: R) -> Result<()> {
        if self.format != Ba2Format::General {
            return Err(ContainerError::Malformed(
                "texture archives take members via add_texture".into(),
            ));
        }
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let full_size = data.len() as u32;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data)?;
        let packed = encoder.finish()?;
        self.entries.push(PendingEntry {
            path: path.clone(),
            payload: PendingPayload::General { packed, full_size },
        });
        Ok(())
    }

    pub fn add_texture<R: Read>(
        &mut self,
        path: &RelativePath,
        mut reader: R,
        info: TextureInfo,
    ) -> Result<()> {
        if self.format != Ba2Format::Dx10 {
            return Err(ContainerError::Malformed(
                "general archives take members via add_file".into(),
            ));
        }
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        self.entries.push(PendingEntry {
            path: path.clone(),
            payload: PendingPayload::Texture { raw, info },
        });
        Ok(())
    }

    pub fn write_to<W: Write + Seek>(self, writer: &mut W) -> Result<()> {
        let entry_table_size: u64 = self
            .entries
            .iter()
            .map(|entry| match &entry.payload {
                PendingPayload::General { .. } => 36,
                PendingPayload::Texture { .. } => 24 + 24, // header + one chunk
            })
            .sum();
        let data_start = HEADER_SIZE + entry_table_size;

        let mut data_offset = data_start;
        let mut name_table_offset = data_start;
        for entry in &self.entries {
            name_table_offset += match &entry.payload {
                PendingPayload::General { packed, .. } => packed.len() as u64,
                PendingPayload::Texture { raw, .. } => raw.len() as u64,
            };
        }

        writer.write_all(&MAGIC)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_all(match self.format {
            Ba2Format::General => &FORMAT_GENERAL,
            Ba2Format::Dx10 => &FORMAT_DX10,
        })?;
        writer.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        writer.write_u64::<LittleEndian>(name_table_offset)?;

        // Entry table.
        for entry in &self.entries {
            let (name_hash, ext4, dir_hash) = split_hashes(&entry.path);
            match &entry.payload {
                PendingPayload::General { packed, full_size } => {
                    writer.write_u32::<LittleEndian>(name_hash)?;
                    writer.write_all(&ext4)?;
                    writer.write_u32::<LittleEndian>(dir_hash)?;
                    writer.write_u32::<LittleEndian>(0)?;
                    writer.write_u64::<LittleEndian>(data_offset)?;
                    writer.write_u32::<LittleEndian>(packed.len() as u32)?;
                    writer.write_u32::<LittleEndian>(*full_size)?;
                    writer.write_u32::<LittleEndian>(ALIGN)?;
                    data_offset += packed.len() as u64;
                }
                PendingPayload::Texture { raw, info } => {
                    writer.write_u32::<LittleEndian>(name_hash)?;
                    writer.write_all(&ext4)?;
                    writer.write_u32::<LittleEndian>(dir_hash)?;
                    writer.write_u8(0)?;
                    writer.write_u8(1)?; // chunk count
                    writer.write_u16::<LittleEndian>(24)?; // chunk record size
                    writer.write_u16::<LittleEndian>(info.height)?;
                    writer.write_u16::<LittleEndian>(info.width)?;
                    writer.write_u8(info.num_mips)?;
                    writer.write_u8(info.pixel_format)?;
                    writer.write_u16::<LittleEndian>(0x0800)?;
                    // The single chunk covers every mip level.
                    writer.write_u64::<LittleEndian>(data_offset)?;
                    writer.write_u32::<LittleEndian>(0)?; // stored raw
                    writer.write_u32::<LittleEndian>(raw.len() as u32)?;
                    writer.write_u16::<LittleEndian>(0)?;
                    writer.write_u16::<LittleEndian>(info.num_mips.saturating_sub(1) as u16)?;
                    writer.write_u32::<LittleEndian>(ALIGN)?;
                    data_offset += raw.len() as u64;
                }
            }
        }

        // Data blocks.
        for entry in &self.entries {
            match &entry.payload {
                PendingPayload::General { packed, .. } => writer.write_all(packed)?,
                PendingPayload::Texture { raw, .. } => writer.write_all(raw)?,
            }
        }

        // Name table: u16-prefixed stored paths, entry order.
        for entry in &self.entries {
            let stored = entry.path.as_str().replace('/', "\\");
            writer.write_u16::<LittleEndian>(stored.len() as u16)?;
            writer.write_all(stored.as_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }
}

// ── Reader ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Ba2Entry {
    pub path: RelativePath,
    pub size: u64,
    pub texture: Option<TextureInfo>,
    offset: u64,
    packed_size: u32,
    full_size: u32,
}

pub struct Ba2Reader<R> {
    source: R,
    format: Ba2Format,
    entries: Vec<Ba2Entry>,
}

impl<R: Read + Seek> Ba2Reader<R> {
    pub fn open(mut source: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        source.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(ContainerError::InvalidMagic(u32::from_le_bytes(magic)));
        }
        let version = source.read_u32::<LittleEndian>()?;
        if version != 1 {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        let mut format_tag = [0u8; 4];
        source.read_exact(&mut format_tag)?;
        let format = match format_tag {
            FORMAT_GENERAL => Ba2Format::General,
            FORMAT_DX10 => Ba2Format::Dx10,
            other => {
                return Err(ContainerError::Malformed(format!(
                    "unknown layout tag {:?}",
                    String::from_utf8_lossy(&other)
                )))
            }
        };
        let file_count = source.read_u32::<LittleEndian>()?;
        let name_table_offset = source.read_u64::<LittleEndian>()?;

        // Names first; the entry table needs them.
        source.seek(SeekFrom::Start(name_table_offset))?;
        let mut names = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            let len = source.read_u16::<LittleEndian>()? as usize;
            let mut raw = vec![0u8; len];
            source.read_exact(&mut raw)?;
            // The name table stores `\`-separated paths.
            let name = String::from_utf8_lossy(&raw).replace('\\', "/");
            names.push(
                RelativePath::new(name)
                    .map_err(|err| ContainerError::Malformed(err.to_string()))?,
            );
        }

        source.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut entries = Vec::with_capacity(file_count as usize);
        for path in names {
            let _name_hash = source.read_u32::<LittleEndian>()?;
            let mut _ext4 = [0u8; 4];
            source.read_exact(&mut _ext4)?;
            let _dir_hash = source.read_u32::<LittleEndian>()?;
            match format {
                Ba2Format::General => {
                    let _flags = source.read_u32::<LittleEndian>()?;
                    let offset = source.read_u64::<LittleEndian>()?;
                    let packed_size = source.read_u32::<LittleEndian>()?;
                    let full_size = source.read_u32::<LittleEndian>()?;
                    let align = source.read_u32::<LittleEndian>()?;
                    if align != ALIGN {
                        return Err(ContainerError::Malformed(
                            "entry record out of alignment".into(),
                        ));
                    }
                    entries.push(Ba2Entry {
                        path,
                        size: u64::from(full_size),
                        texture: None,
                        offset,
                        packed_size,
                        full_size,
                    });
                }
                Ba2Format::Dx10 => {
                    let _unk = source.read_u8()?;
                    let num_chunks = source.read_u8()?;
                    if num_chunks != 1 {
                        return Err(ContainerError::Malformed(format!(
                            "expected a single chunk, found {num_chunks}"
                        )));
                    }
                    let _chunk_size = source.read_u16::<LittleEndian>()?;
                    let height = source.read_u16::<LittleEndian>()?;
                    let width = source.read_u16::<LittleEndian>()?;
                    let num_mips = source.read_u8()?;
                    let pixel_format = source.read_u8()?;
                    let _unk16 = source.read_u16::<LittleEndian>()?;
                    let offset = source.read_u64::<LittleEndian>()?;
                    let packed_size = source.read_u32::<LittleEndian>()?;
                    let full_size = source.read_u32::<LittleEndian>()?;
                    let _start_mip = source.read_u16::<LittleEndian>()?;
                    let _end_mip = source.read_u16::<LittleEndian>()?;
                    let align = source.read_u32::<LittleEndian>()?;
                    if align != ALIGN {
                        return Err(ContainerError::Malformed(
                            "chunk record out of alignment".into(),
                        ));
                    }
                    entries.push(Ba2Entry {
                        path,
                        size: u64::from(full_size),
                        texture: Some(TextureInfo {
                            height,
                            width,
                            num_mips,
                            pixel_format,
                        }),
                        offset,
                        packed_size,
                        full_size,
                    });
                }
            }
        }

        Ok(Self {
            source,
            format,
            entries,
        })
    }

    pub fn format(&self) -> Ba2Format {
        self.format
    }

    pub fn entries(&self) -> &[Ba2Entry] {
        &self.entries
    }

    pub fn read_entry(&mut self, index: usize) -> Result<Vec<u8>> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| ContainerError::EntryNotFound(format!("#{index}")))?
            .clone();
        self.source.seek(SeekFrom::Start(entry.offset))?;

        if entry.packed_size == 0 {
            let mut out = vec![0u8; entry.full_size as usize];
            self.source.read_exact(&mut out)?;
            Ok(out)
        } else {
            let mut packed = vec![0u8; entry.packed_size as usize];
            self.source.read_exact(&mut packed)?;
            let mut out = Vec::with_capacity(entry.full_size as usize);
            ZlibDecoder::new(packed.as_slice()).read_to_end(&mut out)?;
            if out.len() != entry.full_size as usize {
                return Err(ContainerError::Malformed(format!(
                    "inflated {} bytes, record said {}",
                    out.len(),
                    entry.full_size
                )));
            }
            Ok(out)
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
    fn general_round_trip() {
        let mut builder = Ba2Builder::new(1, Ba2Format::General).unwrap();
        let payload = vec![0x11u8; 30_000];
        builder.add_file(&rel("meshes/door.nif"), payload.as_slice()).unwrap();
        builder.add_file(&rel("loose.txt"), &b"top level"[..],).unwrap();

        let mut buffer = Cursor::new(Vec::new());
        builder.write_to(&mut buffer).unwrap();
        buffer.set_position(0);

        let mut reader = Ba2Reader::open(buffer).unwrap();
        assert_eq!(reader.format(), Ba2Format::General);
        assert_eq!(reader.entries().len(), 2);
        assert_eq!(reader.entries()[0].path.as_str(), "meshes/door.nif");
        assert_eq!(reader.read_entry(0).unwrap(), payload);
        assert_eq!(reader.read_entry(1).unwrap(), b"top level");
    }

    #[test]
    fn dx10_round_trip_keeps_texture_info() {
        let mut builder = Ba2Builder::new(1, Ba2Format::Dx10).unwrap();
        let dds = vec![0xDDu8; 4096];
        let info = TextureInfo {
            height: 256,
            width: 256,
            num_mips: 9,
            pixel_format: 99,
        };
        builder.add_texture(&rel("textures/rock.dds"), dds.as_slice(), info).unwrap();

        let mut buffer = Cursor::new(Vec::new());
        builder.write_to(&mut buffer).unwrap();
        buffer.set_position(0);

        let mut reader = Ba2Reader::open(buffer).unwrap();
        assert_eq!(reader.entries()[0].texture, Some(info));
        assert_eq!(reader.read_entry(0).unwrap(), dds);
    }

    #[test]
    fn member_kind_must_match_layout() {
        let mut general = Ba2Builder::new(1, Ba2Format::General).unwrap();
        let info = TextureInfo {
            height: 4,
            width: 4,
            num_mips: 1,
            pixel_format: 0,
        };
        assert!(general.add_texture(&rel("a.dds"), &b"x"[..], info).is_err());

        let mut dx10 = Ba2Builder::new(1, Ba2Format::Dx10).unwrap();
        assert!(dx10.add_file(&rel("a.nif"), &b"x"[..]).is_err());
    }
}
