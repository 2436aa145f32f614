use std::ops::Range;

/// An executable memory mapping of a process.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Mapping {
    /// The backing file, as seen from inside the process's mount namespace,
    /// or a pseudo name such as `[vdso]`.
    pub file: String,
    /// Empty if the build id is not known.
    pub build_id: String,
    pub start: u64,
    pub limit: u64,
    /// The file offset at which this mapping starts.
    pub offset: u64,
}

impl Mapping {
    pub fn address_range(&self) -> Range<u64> {
        self.start..self.limit
    }
}

/// Supplies the memory mappings of a process. The mappings can be returned
/// in any order.
pub trait MappingProvider {
    type Error: std::error::Error + Send + Sync + 'static;

    fn mappings_for_pid(&self, pid: u32) -> Result<Vec<Mapping>, Self::Error>;
}

impl<M: MappingProvider + ?Sized> MappingProvider for &M {
    type Error = M::Error;

    fn mappings_for_pid(&self, pid: u32) -> Result<Vec<Mapping>, Self::Error> {
        (**self).mappings_for_pid(pid)
    }
}

impl<M: MappingProvider + ?Sized> MappingProvider for std::sync::Arc<M> {
    type Error = M::Error;

    fn mappings_for_pid(&self, pid: u32) -> Result<Vec<Mapping>, Self::Error> {
        (**self).mappings_for_pid(pid)
    }
}

/// Returns true for mappings which can't have unwind information on disk:
/// mappings without a build id, kernel-provided mappings like `[vdso]` and
/// `[vsyscall]`, and anonymous or bracketed pseudo mappings.
pub fn is_pseudo(mapping: &Mapping) -> bool {
    if mapping.build_id.is_empty() {
        return true;
    }
    let file = mapping.file.as_str();
    file.is_empty() || (file.starts_with('[') && file.ends_with(']'))
}
