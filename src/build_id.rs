use std::fmt::Write;
use std::fs::File;
use std::path::Path;

use object::Object;

#[derive(thiserror::Error, Debug)]
pub enum BuildIdError {
    #[error("Could not read the object: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not parse the object: {0}")]
    Parse(#[from] object::Error),

    #[error("The object has no build id note")]
    Missing,
}

/// Computes a content-derived identifier for an object file. It is used as the
/// key of the [`FdeCache`](crate::FdeCache), so it must be deterministic for a
/// given file content.
pub trait BuildIdentifier {
    fn build_id(&self, path: &Path) -> Result<String, BuildIdError>;
}

/// Reads the GNU build id note (`NT_GNU_BUILD_ID`) of an ELF object and
/// renders it as lowercase hex.
#[derive(Clone, Copy, Debug, Default)]
pub struct ElfBuildId;

impl BuildIdentifier for ElfBuildId {
    fn build_id(&self, path: &Path) -> Result<String, BuildIdError> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and dropped before returning.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let obj = object::File::parse(&*mmap)?;
        let id = obj.build_id()?.ok_or(BuildIdError::Missing)?;
        Ok(to_hex(id))
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}
