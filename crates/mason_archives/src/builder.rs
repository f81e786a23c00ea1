//! Container assembly from a directive's archive state and file states. The
//! installer feeds members in directive order; the builder defers to the
//! format-specific writer.

use std::io::{Read, Seek, Write};

use mason_core::RelativePath;

use crate::ba2::{Ba2Builder, TextureInfo};
use crate::bsa::BsaBuilder;
use crate::error::{ContainerError, Result};
use crate::states::{Ba2Format, ContainerState, FileState};

enum Inner {
    Bsa(BsaBuilder),
    Ba2(Ba2Builder),
}

pub struct ContainerBuilder {
    inner: Inner,
}

impl ContainerBuilder {
    pub fn new(state: &ContainerState) -> Result<Self> {
        let inner = match state {
            ContainerState::Bsa {
                version,
                archive_flags,
                file_flags,
            } => Inner::Bsa(BsaBuilder::new(*version, *archive_flags, *file_flags)?),
            ContainerState::Ba2 { version, format } => {
                Inner::Ba2(Ba2Builder::new(*version, *format)?)
            }
        };
        Ok(Self { inner })
    }

    /// Adds one member. The file state's kind must match the archive state.
    pub fn add_file<R: Read>(&mut self, state: &FileState, reader: R) -> Result<()> {
        match (&mut self.inner, state) {
            (
                Inner::Bsa(builder),
                FileState::BsaFile {
                    path,
                    flip_compression,
                    ..
                },
            ) => builder.add_file(path, reader, *flip_compression),
            (Inner::Ba2(builder), FileState::Ba2File { path, .. }) => {
                builder.add_file(path, reader)
            }
            (
                Inner::Ba2(builder),
                FileState::Ba2Dx10Entry {
                    path,
                    height,
                    width,
                    num_mips,
                    pixel_format,
                    ..
                },
            ) => builder.add_texture(
                path,
                reader,
                TextureInfo {
                    height: *height,
                    width: *width,
                    num_mips: *num_mips,
                    pixel_format: *pixel_format,
                },
            ),
            (_, state) => Err(ContainerError::Malformed(format!(
                "file state for '{}' does not match the archive layout",
                state.path()
            ))),
        }
    }

    pub fn write_to<W: Write + Seek>(self, writer: &mut W) -> Result<()> {
        match self.inner {
            Inner::Bsa(builder) => builder.write_to(writer),
            Inner::Ba2(builder) => builder.write_to(writer),
        }
    }
}

/// Convenience for the mixed reader side: which states describe which paths.
pub fn state_for_path<'a>(
    states: &'a [FileState],
    path: &RelativePath,
) -> Option<&'a FileState> {
    states.iter().find(|state| state.path() == path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ContainerReader;
    use mason_core::MemorySource;
    use std::io::Cursor;

    fn rel(path: &str) -> RelativePath {
        RelativePath::new(path).unwrap()
    }

    #[test]
    fn builds_from_directive_states() {
        let state = ContainerState::Bsa {
            version: 105,
            archive_flags: 0,
            file_flags: 0x1,
        };
        let file_states = vec![
            FileState::BsaFile {
                path: rel("meshes/a.nif"),
                index: 0,
                flip_compression: false,
            },
            FileState::BsaFile {
                path: rel("meshes/b.nif"),
                index: 1,
                flip_compression: false,
            },
        ];

        let mut builder = ContainerBuilder::new(&state).unwrap();
        builder.add_file(&file_states[0], &b"alpha"[..]).unwrap();
        builder.add_file(&file_states[1], &b"beta"[..]).unwrap();

        let mut buffer = Cursor::new(Vec::new());
        builder.write_to(&mut buffer).unwrap();

        let source = MemorySource::new("out.bsa", buffer.into_inner());
        let mut reader = ContainerReader::open(&source).unwrap();
        let entries = reader.entries();
        assert_eq!(entries.len(), 2);
        for (index, entry) in entries.iter().enumerate() {
            let state = state_for_path(&file_states, &entry.path).unwrap();
            assert!(!state.is_lossy());
            let expected: &[u8] = if state.index() == 0 { b"alpha" } else { b"beta" };
            assert_eq!(reader.read_entry(index).unwrap(), expected);
        }
    }

    #[test]
    fn mismatched_state_kind_errors() {
        let state = ContainerState::Ba2 {
            version: 1,
            format: Ba2Format::General,
        };
        let mut builder = ContainerBuilder::new(&state).unwrap();
        let wrong = FileState::BsaFile {
            path: rel("meshes/a.nif"),
            index: 0,
            flip_compression: false,
        };
        assert!(builder.add_file(&wrong, &b"x"[..]).is_err());
    }
}
