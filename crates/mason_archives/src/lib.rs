//! Readers and writers for the game-native container formats, plus the BTAR
//! pack format the extraction dispatcher reads in-process.

pub mod ba2;
pub mod bsa;
pub mod btar;
pub mod builder;
mod error;
pub mod reader;
pub mod states;
pub mod tes3;

pub use ba2::{Ba2Builder, Ba2Entry, Ba2Reader, TextureInfo};
pub use bsa::{BsaBuilder, BsaEntry, BsaReader};
pub use btar::{BtarEntry, BtarReader};
pub use builder::{state_for_path, ContainerBuilder};
pub use error::{ContainerError, Result};
pub use reader::{ContainerEntry, ContainerReader};
pub use states::{Ba2Format, ContainerState, FileState};
