//! The extraction dispatcher: one entry point (`gathering_extract`) over
//! eight container formats, backed by in-process readers and two external
//! native tools.

mod dispatcher;
mod error;
mod extracted;
mod external;
mod native;
mod normalize;
mod omod;

pub use dispatcher::{ExtractionSettings, Extractor};
pub use error::{ExtractError, Result};
pub use extracted::{write_atomic, write_atomic_from, ExtractedFile};
pub use external::{parse_percent, pattern_variants, ToolKind, DEFAULT_CASE_VARIANT_ROOTS};
pub use native::{CompatTool, HostTool, NativeTool, ToolRequest};
pub use normalize::repair_backslash_names;
pub use omod::extract_omod;
