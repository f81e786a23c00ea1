//! Streaming applier for the octodiff delta format: an ASCII header with
//! hash metadata, then copy commands (`0x60`, offset + length into the
//! basis) and data commands (`0x80`, length + literal bytes) until EOF.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{InstallError, Result};

const DELTA_HEADER: &[u8] = b"OCTODELTA";
const END_OF_METADATA: &[u8] = b">>>";
const COPY_COMMAND: u8 = 0x60;
const DATA_COMMAND: u8 = 0x80;

/// Applies `delta` against `basis`, writing the patched output. Returns the
/// number of bytes produced.
pub fn apply_delta<D: Read, W: Write>(
    basis: &[u8],
    delta: &mut D,
    out: &mut W,
) -> Result<u64> {
    let mut header = [0u8; 9];
    read_exact(delta, &mut header)?;
    if header[..] != *DELTA_HEADER {
        return Err(InstallError::MalformedDelta("bad header magic".into()));
    }
    let version = read_u8(delta)?;
    if version != 0x01 {
        return Err(InstallError::MalformedDelta(format!(
            "unsupported delta version {version}"
        )));
    }

    // Hash algorithm name and expected basis digest; recorded but the
    // engine verifies outputs against directive hashes instead.
    let name_len = read_u8(delta)? as usize;
    let mut name = vec![0u8; name_len];
    read_exact(delta, &mut name)?;
    let digest_len = delta
        .read_i32::<LittleEndian>()
        .map_err(|_| InstallError::MalformedDelta("truncated digest length".into()))?;
    if !(0..=64).contains(&digest_len) {
        return Err(InstallError::MalformedDelta(format!(
            "implausible digest length {digest_len}"
        )));
    }
    let mut digest = vec![0u8; digest_len as usize];
    read_exact(delta, &mut digest)?;

    let mut eom = [0u8; 3];
    read_exact(delta, &mut eom)?;
    if eom[..] != *END_OF_METADATA {
        return Err(InstallError::MalformedDelta("missing end of metadata".into()));
    }

    let mut produced = 0u64;
    loop {
        let mut command = [0u8; 1];
        match delta.read(&mut command) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(InstallError::MalformedDelta(format!("read failure: {err}")))
            }
        }
        match command[0] {
            COPY_COMMAND => {
                let offset = read_u64(delta)?;
                let length = read_u64(delta)?;
                let end = offset
                    .checked_add(length)
                    .filter(|end| *end <= basis.len() as u64)
                    .ok_or_else(|| {
                        InstallError::MalformedDelta(format!(
                            "copy {offset}+{length} exceeds basis of {} bytes",
                            basis.len()
                        ))
                    })?;
                out.write_all(&basis[offset as usize..end as usize])
                    .map_err(|err| InstallError::MalformedDelta(err.to_string()))?;
                produced += length;
            }
            DATA_COMMAND => {
                let length = read_u64(delta)?;
                let mut remaining = length;
                let mut buf = [0u8; 64 * 1024];
                while remaining > 0 {
                    let take = remaining.min(buf.len() as u64) as usize;
                    read_exact(delta, &mut buf[..take])?;
                    out.write_all(&buf[..take])
                        .map_err(|err| InstallError::MalformedDelta(err.to_string()))?;
                    remaining -= take as u64;
                }
                produced += length;
            }
            other => {
                return Err(InstallError::MalformedDelta(format!(
                    "unknown command byte {other:#04x}"
                )))
            }
        }
    }
    Ok(produced)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader
        .read_exact(buf)
        .map_err(|_| InstallError::MalformedDelta("truncated delta stream".into()))
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    read_exact(reader, &mut byte)?;
    Ok(byte[0])
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    reader
        .read_u64::<LittleEndian>()
        .map_err(|_| InstallError::MalformedDelta("truncated command operand".into()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;

    /// Builds a delta for tests from explicit commands.
    pub enum Command<'a> {
        Copy { offset: u64, length: u64 },
        Data(&'a [u8]),
    }

    pub fn build_delta(commands: &[Command<'_>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_all(b"OCTODELTA").unwrap();
        out.push(0x01);
        out.push(4);
        out.write_all(b"XXH3").unwrap();
        out.write_all(&8i32.to_le_bytes()).unwrap();
        out.write_all(&[0u8; 8]).unwrap();
        out.write_all(b">>>").unwrap();
        for command in commands {
            match command {
                Command::Copy { offset, length } => {
                    out.push(0x60);
                    out.write_all(&offset.to_le_bytes()).unwrap();
                    out.write_all(&length.to_le_bytes()).unwrap();
                }
                Command::Data(bytes) => {
                    out.push(0x80);
                    out.write_all(&(bytes.len() as u64).to_le_bytes()).unwrap();
                    out.write_all(bytes).unwrap();
                }
            }
        }
        out
    }
}
