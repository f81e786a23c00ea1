//! File-format recognition by leading-byte magic.

use std::io::{self, Read, Seek, SeekFrom};

/// The container formats the extraction dispatcher understands.
///
/// `Tes3` and `Bsa` share a weak prefix (the Morrowind header begins with a
/// version field); when the two collide the caller disambiguates by file
/// extension. All other matches are exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileSignature {
    Tes3,
    Bsa,
    Ba2,
    Btar,
    Zip,
    /// Installer-payload executable.
    Exe,
    RarOld,
    RarNew,
    SevenZip,
}

/// Longest prefix first so RAR5 wins over RAR4.
const MAGIC_TABLE: &[(&[u8], FileSignature)] = &[
    (b"Rar!\x1a\x07\x01\x00", FileSignature::RarNew),
    (b"Rar!\x1a\x07\x00", FileSignature::RarOld),
    (b"7z\xbc\xaf\x27\x1c", FileSignature::SevenZip),
    (b"BSA\x00", FileSignature::Bsa),
    (b"BTDX", FileSignature::Ba2),
    (b"BTAR", FileSignature::Btar),
    (b"PK\x03\x04", FileSignature::Zip),
    (b"\x00\x01\x00\x00", FileSignature::Tes3),
    (b"MZ", FileSignature::Exe),
];

const PROBE_LEN: usize = 8;

/// Reads the leading bytes and restores the stream position before
/// returning. `None` means no recognised format.
pub fn detect<R: Read + Seek>(reader: &mut R) -> io::Result<Option<FileSignature>> {
    let origin = reader.stream_position()?;
    let mut probe = [0u8; PROBE_LEN];
    let mut filled = 0;
    while filled < PROBE_LEN {
        let read = reader.read(&mut probe[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    reader.seek(SeekFrom::Start(origin))?;

    Ok(MAGIC_TABLE
        .iter()
        .find(|(magic, _)| filled >= magic.len() && probe[..magic.len()] == **magic)
        .map(|(_, signature)| *signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn detect_bytes(bytes: &[u8]) -> Option<FileSignature> {
        detect(&mut Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn recognises_each_magic() {
        assert_eq!(detect_bytes(b"BSA\x00\x68\x00\x00\x00"), Some(FileSignature::Bsa));
        assert_eq!(detect_bytes(b"BTDX\x01\x00\x00\x00"), Some(FileSignature::Ba2));
        assert_eq!(detect_bytes(b"BTAR\x00\x01\x00\x03"), Some(FileSignature::Btar));
        assert_eq!(detect_bytes(b"PK\x03\x04rest"), Some(FileSignature::Zip));
        assert_eq!(detect_bytes(b"MZ\x90\x00"), Some(FileSignature::Exe));
        assert_eq!(detect_bytes(b"7z\xbc\xaf\x27\x1c\x00\x04"), Some(FileSignature::SevenZip));
        assert_eq!(detect_bytes(b"\x00\x01\x00\x00\x24\x00\x00\x00"), Some(FileSignature::Tes3));
    }

    #[test]
    fn rar_versions_are_distinguished() {
        assert_eq!(detect_bytes(b"Rar!\x1a\x07\x00\x11"), Some(FileSignature::RarOld));
        assert_eq!(detect_bytes(b"Rar!\x1a\x07\x01\x00"), Some(FileSignature::RarNew));
    }

    #[test]
    fn unknown_and_short_inputs() {
        assert_eq!(detect_bytes(b"plain text file"), None);
        assert_eq!(detect_bytes(b"P"), None);
        assert_eq!(detect_bytes(b""), None);
    }

    #[test]
    fn restores_stream_position() {
        let mut cursor = Cursor::new(b"PK\x03\x04 trailing".to_vec());
        cursor.seek(SeekFrom::Start(0)).unwrap();
        detect(&mut cursor).unwrap();
        assert_eq!(cursor.stream_position().unwrap(), 0);

        // Detection from a non-zero origin returns there too.
        let mut cursor = Cursor::new(b"xxBSA\x00abcdef".to_vec());
        cursor.seek(SeekFrom::Start(2)).unwrap();
        assert_eq!(detect(&mut cursor).unwrap(), Some(FileSignature::Bsa));
        assert_eq!(cursor.stream_position().unwrap(), 2);
    }
}
