//! Shared primitives for the modlist installer engine: content hashes, typed
//! paths, stream factories, file-format recognition, scoped temporaries, and
//! cancellation.

pub mod cancel;
pub mod hash;
pub mod path;
pub mod signature;
pub mod stream;
pub mod temp;

pub use cancel::{CancelHandle, CancelToken, Cancelled};
pub use hash::{hash_bytes, hash_reader, Hash, Hasher};
pub use path::{AbsolutePath, PathError, RelativePath};
pub use signature::{detect, FileSignature};
pub use stream::{FileSource, MemorySource, ReadSeek, StreamSource};
pub use temp::{TempDir, TempManager};
