use std::path::PathBuf;

use crate::build_id::BuildIdError;
use crate::cfi::DecodeError;

/// Errors which abort a whole table build, or a call to
/// [`PlanTableBuilder::print_table`](crate::PlanTableBuilder::print_table).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not fetch the mappings of pid {pid}: {source}")]
    MappingProvider {
        pid: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("No mappings found for pid {0}")]
    NoMappingsFound(u32),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error("Could not write the table dump: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors for a single object file. During a table build these never abort
/// the build: the mapping is skipped and the error is kept in
/// [`PlanTable::skipped_mappings`](crate::PlanTable::skipped_mappings).
#[derive(thiserror::Error, Debug)]
pub enum ObjectError {
    #[error("Could not open object {}: {source}", path.display())]
    ObjectOpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse object {}: {source}", path.display())]
    ObjectParseFailed {
        path: PathBuf,
        #[source]
        source: object::Error,
    },

    #[error("{} has no .eh_frame section", path.display())]
    SectionMissing { path: PathBuf },

    #[error("Could not decode the .eh_frame section of {}: {source}", path.display())]
    DecodeFailed {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("Unsupported architecture {arch:?} in {}", path.display())]
    UnsupportedArchitecture {
        path: PathBuf,
        arch: object::Architecture,
    },

    #[error("Could not compute the build id of {}: {source}", path.display())]
    BuildId {
        path: PathBuf,
        #[source]
        source: BuildIdError,
    },

    #[error("Cached frame description entries for build id {0} belong to another object")]
    CacheCorruption(String),
}

impl ObjectError {
    /// The object file this error is about, if any.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            ObjectError::ObjectOpenFailed { path, .. }
            | ObjectError::ObjectParseFailed { path, .. }
            | ObjectError::SectionMissing { path }
            | ObjectError::DecodeFailed { path, .. }
            | ObjectError::UnsupportedArchitecture { path, .. }
            | ObjectError::BuildId { path, .. } => Some(path.as_path()),
            ObjectError::CacheCorruption(_) => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    #[error("Row {index} at 0x{loc:x} comes before the previous row at 0x{previous:x}")]
    UnsortedRows { index: usize, previous: u64, loc: u64 },
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Unknown instruction tag {0}")]
    UnknownTag(u8),

    #[error("Expected {expected} bytes but only {actual} are available")]
    Truncated { expected: usize, actual: usize },

    #[error("Encoded table length {0} is not a multiple of the row size")]
    TrailingBytes(usize),

    #[error(transparent)]
    Table(#[from] TableError),
}
