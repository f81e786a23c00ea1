use std::fs::File;
use std::io::BufReader;

use camino::Utf8PathBuf;
use mason_core::hash_reader;

use super::EXIT_OK;
use crate::errors::CliError;

pub struct HashFileArgs {
    pub file: Utf8PathBuf,
}

/// Prints the engine fingerprint of one file, base64-encoded.
pub async fn hash_file(args: HashFileArgs) -> miette::Result<i32> {
    let file = File::open(&args.file).map_err(CliError::from)?;
    let hash = hash_reader(BufReader::new(file)).map_err(CliError::from)?;
    println!("{hash}  {}", args.file);
    Ok(EXIT_OK)
}
