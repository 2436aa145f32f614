//! Builds unwind plan tables for the executable mappings of a process.
//!
//! A [`PlanTable`] maps instruction addresses to [`Instruction`]s which tell a
//! sampler how to recover the return address, the caller's stack pointer and
//! the frame pointer from a captured register set, using only the DWARF call
//! frame information in each binary's `.eh_frame` section.
//!
//! ```no_run
//! use std::sync::Arc;
//! use unwind_plan::{FdeCache, Mapping, MappingProvider, PlanTableBuilder};
//!
//! struct Maps;
//!
//! impl MappingProvider for Maps {
//!     type Error = std::io::Error;
//!
//!     fn mappings_for_pid(&self, _pid: u32) -> Result<Vec<Mapping>, Self::Error> {
//!         Ok(vec![Mapping {
//!             file: "/usr/bin/app".into(),
//!             build_id: "abc123".into(),
//!             start: 0x5555_5555_4000,
//!             limit: 0x5555_5556_0000,
//!             offset: 0,
//!         }])
//!     }
//! }
//!
//! let builder = PlanTableBuilder::new(Maps, Arc::new(FdeCache::default()));
//! let table = builder.build_table(1234)?;
//! if let Some(row) = table.lookup(0x5555_5555_4321) {
//!     println!("cfa: {}, return address: {}", row.rsp, row.rip);
//! }
//! # Ok::<(), unwind_plan::Error>(())
//! ```

mod arch;
mod build_id;
mod builder;
mod cfi;
mod config;
mod display_utils;
mod error;
mod fde_cache;
mod mapping;
mod object_reader;
mod plan_table;

pub use arch::{x86_64_register_name, Arch};
pub use build_id::{BuildIdError, BuildIdentifier, ElfBuildId};
pub use builder::PlanTableBuilder;
pub use cfi::{
    CfaRegisterOffset, CfiDecoder, CfiReader, DecodeError, Fde, FdeSet, GimliCfiDecoder,
    InstructionContext,
};
pub use config::{BuilderConfig, RowGranularity};
pub use error::{EncodingError, Error, ObjectError, TableError};
pub use fde_cache::{CacheStats, FdeCache, DEFAULT_FDE_CACHE_CAPACITY};
pub use mapping::{is_pseudo, Mapping, MappingProvider};
pub use object_reader::{mapping_path, read_eh_frame, EhFrameSection};
pub use plan_table::{Instruction, PlanTable, PlanTableRow, SkippedMapping};
