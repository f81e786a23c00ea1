//! Embedded unpacker for the legacy installer package format. The package
//! is a ZIP holding `data.crc` / `plugins.crc` manifests plus matching
//! zlib-compressed data blobs; each manifest entry is a 7-bit-length-prefixed
//! name, a CRC, and a payload length into the concatenated stream.

use std::io::{Read, Seek};

use flate2::read::ZlibDecoder;
use mason_core::{AbsolutePath, RelativePath};
use zip::ZipArchive;

use crate::error::{ExtractError, Result};
use crate::extracted::write_atomic;

struct ManifestEntry {
    name: RelativePath,
    length: u64,
}

/// Reads the .NET-style 7-bit encoded length prefix.
fn read_varint_len<R: Read>(reader: &mut R) -> Result<usize> {
    let mut value: usize = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        value |= ((byte[0] & 0x7F) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 28 {
            return Err(ExtractError::MalformedOmod(
                "runaway length prefix in manifest".into(),
            ));
        }
    }
}

fn parse_manifest(bytes: &[u8]) -> Result<Vec<ManifestEntry>> {
    let mut cursor = std::io::Cursor::new(bytes);
    let mut entries = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        let name_len = read_varint_len(&mut cursor)?;
        let mut name = vec![0u8; name_len];
        cursor.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| ExtractError::MalformedOmod("manifest name is not UTF-8".into()))?;

        let mut crc = [0u8; 4];
        cursor.read_exact(&mut crc)?;
        let mut length = [0u8; 8];
        cursor.read_exact(&mut length)?;

        // Manifest names are Windows-style.
        entries.push(ManifestEntry {
            name: RelativePath::new(name.replace('\\', "/"))
                .map_err(|err| ExtractError::MalformedOmod(err.to_string()))?,
            length: u64::from_le_bytes(length),
        });
    }
    Ok(entries)
}

fn read_zip_entry<R: Read + Seek>(zip: &mut ZipArchive<R>, name: &str) -> Result<Option<Vec<u8>>> {
    match zip.by_name(name) {
        Ok(mut entry) => {
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            Ok(Some(bytes))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Unpacks both data sections into `destination`, returning the extracted
/// relative paths.
pub fn extract_omod<R: Read + Seek>(
    reader: R,
    destination: &AbsolutePath,
) -> Result<Vec<RelativePath>> {
    let mut zip = ZipArchive::new(reader)?;
    let mut extracted = Vec::new();

    for (manifest_name, blob_name) in [("data.crc", "data"), ("plugins.crc", "plugins")] {
        let Some(manifest_bytes) = read_zip_entry(&mut zip, manifest_name)? else {
            continue;
        };
        let blob = read_zip_entry(&mut zip, blob_name)?.ok_or_else(|| {
            ExtractError::MalformedOmod(format!("{manifest_name} present without {blob_name}"))
        })?;

        let entries = parse_manifest(&manifest_bytes)?;
        let mut stream = Vec::new();
        ZlibDecoder::new(blob.as_slice()).read_to_end(&mut stream)?;

        let expected: u64 = entries.iter().map(|entry| entry.length).sum();
        if expected != stream.len() as u64 {
            return Err(ExtractError::MalformedOmod(format!(
                "{blob_name} stream is {} bytes, manifest expects {expected}",
                stream.len()
            )));
        }

        let mut offset = 0usize;
        for entry in entries {
            let end = offset + entry.length as usize;
            let target = destination.join_rel(&entry.name);
            write_atomic(&target, &stream[offset..end])?;
            extracted.push(entry.name);
            offset = end;
        }
    }

    if extracted.is_empty() {
        return Err(ExtractError::MalformedOmod(
            "package carries no data sections".into(),
        ));
    }
    Ok(extracted)
}

#[cfg(test)]
pub(crate) mod test_support {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_varint(out: &mut Vec<u8>, mut value: usize) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    /// Assembles a minimal package for tests.
    pub fn build_omod(data_files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut manifest = Vec::new();
        let mut stream = Vec::new();
        for (name, payload) in data_files {
            write_varint(&mut manifest, name.len());
            manifest.extend_from_slice(name.as_bytes());
            manifest.extend_from_slice(&0u32.to_le_bytes()); // crc, unchecked
            manifest.extend_from_slice(&(payload.len() as u64).to_le_bytes());
            stream.extend_from_slice(payload);
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&stream).unwrap();
        let blob = encoder.finish().unwrap();

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        zip.start_file("config", options).unwrap();
        zip.write_all(b"\x04test").unwrap();
        zip.start_file("data.crc", options).unwrap();
        zip.write_all(&manifest).unwrap();
        zip.start_file("data", options).unwrap();
        zip.write_all(&blob).unwrap();
        zip.finish().unwrap().into_inner()
    }
}
