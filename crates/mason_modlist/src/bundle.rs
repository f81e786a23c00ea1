//! The modlist bundle: a standard ZIP with a single top-level `modlist`
//! JSON entry plus opaque inline blobs keyed by id. Blobs are loaded
//! lazily; the JSON is parsed once at open.

use std::fs::File;
use std::io::{BufReader, Read, Seek};

use mason_core::AbsolutePath;
use serde::{Deserialize, Serialize};
use zip::ZipArchive;

use crate::archive::Archive;
use crate::directive::Directive;
use crate::error::{ModlistError, Result};
use crate::game::GameType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Modlist {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    pub game_type: GameType,
    pub archives: Vec<Archive>,
    pub directives: Vec<Directive>,
}

pub struct ModlistBundle<R: Read + Seek> {
    archive: ZipArchive<R>,
    modlist: Modlist,
}

impl ModlistBundle<BufReader<File>> {
    pub fn open(path: &AbsolutePath) -> Result<Self> {
        let file = File::open(path.as_std())?;
        Self::from_reader(BufReader::new(file))
    }
}

impl<R: Read + Seek> ModlistBundle<R> {
    pub fn from_reader(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader)?;
        let mut json = String::new();
        {
            let mut entry = archive
                .by_name("modlist")
                .map_err(|_| ModlistError::MissingModlistEntry)?;
            entry.read_to_string(&mut json)?;
        }
        let modlist: Modlist = serde_json::from_str(&json)?;
        Ok(Self { archive, modlist })
    }

    pub fn modlist(&self) -> &Modlist {
        &self.modlist
    }

    /// Reads one inline blob by its id.
    pub fn read_blob(&mut self, id: &str) -> Result<Vec<u8>> {
        let mut entry = self
            .archive
            .by_name(id)
            .map_err(|_| ModlistError::BlobNotFound(id.to_string()))?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}
