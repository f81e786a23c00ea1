//! The declarative modlist model: bundles, archives with source states, and
//! the directive sum type the installer walks.

mod archive;
mod bundle;
mod directive;
mod error;
mod game;

pub use archive::{Archive, ArchiveState};
pub use bundle::{Modlist, ModlistBundle};
pub use directive::{ArchiveHashPath, Directive, PatchSource};
pub use error::{ModlistError, Result};
pub use game::GameType;
