use std::fs::File;
use std::path::{Path, PathBuf};

use gimli::RunTimeEndian;
use object::{Object, ObjectSection};

use crate::arch::Arch;
use crate::error::ObjectError;

/// The `.eh_frame` section of an object file, copied out of the file so that it
/// outlives the file handle.
#[derive(Clone, Debug)]
pub struct EhFrameSection {
    pub data: Vec<u8>,
    pub endian: RunTimeEndian,
    /// The section's virtual address in the object's address space.
    pub address: u64,
    pub arch: Arch,
    /// Raw architecture as reported by the object, kept for error messages.
    pub object_arch: object::Architecture,
    /// 4 or 8, or 0 for unsupported architectures.
    pub pointer_size: u8,
}

/// Opens the ELF object at `path` and copies out its `.eh_frame` section.
///
/// The file is memory-mapped for the duration of the call only.
pub fn read_eh_frame(path: &Path) -> Result<EhFrameSection, ObjectError> {
    let file = File::open(path).map_err(|source| ObjectError::ObjectOpenFailed {
        path: path.to_owned(),
        source,
    })?;
    // Safety: the mapping is read-only and dropped before returning.
    let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|source| {
        ObjectError::ObjectOpenFailed {
            path: path.to_owned(),
            source,
        }
    })?;
    let parse_failed = |source| ObjectError::ObjectParseFailed {
        path: path.to_owned(),
        source,
    };
    let obj = object::File::parse(&*mmap).map_err(parse_failed)?;

    let section = obj
        .section_by_name(".eh_frame")
        .ok_or_else(|| ObjectError::SectionMissing {
            path: path.to_owned(),
        })?;
    let data = section.data().map_err(parse_failed)?.to_vec();

    let endian = match obj.endianness() {
        object::Endianness::Little => RunTimeEndian::Little,
        object::Endianness::Big => RunTimeEndian::Big,
    };
    let object_arch = obj.architecture();
    let arch = Arch::from_object(object_arch);

    Ok(EhFrameSection {
        data,
        endian,
        address: section.address(),
        arch,
        object_arch,
        pointer_size: arch.pointer_size(),
    })
}

/// The path under which `file` is reachable from our mount namespace, given
/// that it was mapped by `pid`: `<proc_root>/<pid>/root/<file>`.
pub fn mapping_path(proc_root: &Path, pid: u32, file: &str) -> PathBuf {
    let mut path = proc_root.join(pid.to_string()).join("root");
    path.push(file.trim_start_matches('/'));
    path
}
