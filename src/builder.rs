use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use gimli::{RegisterRule, UnwindContext};

use crate::build_id::{BuildIdentifier, ElfBuildId};
use crate::cfi::{CfiDecoder, DecodeError, Fde, FdeSet, GimliCfiDecoder, InstructionContext};
use crate::config::{BuilderConfig, RowGranularity};
use crate::error::{Error, ObjectError};
use crate::fde_cache::FdeCache;
use crate::mapping::{is_pseudo, MappingProvider};
use crate::object_reader::{mapping_path, read_eh_frame};
use crate::plan_table::{Instruction, PlanTable, PlanTableRow, SkippedMapping};

/// Builds [`PlanTable`]s for processes.
///
/// The builder can be shared between threads; the [`FdeCache`] it was given
/// is shared with every other builder holding the same `Arc`.
pub struct PlanTableBuilder<M, B = ElfBuildId, D = GimliCfiDecoder> {
    mappings: M,
    build_ids: B,
    decoder: D,
    fde_cache: Arc<FdeCache>,
    config: BuilderConfig,
}

impl<M: MappingProvider> PlanTableBuilder<M> {
    /// A builder which reads build ids from ELF notes and decodes CFI with gimli.
    pub fn new(mappings: M, fde_cache: Arc<FdeCache>) -> Self {
        Self::with_parts(
            mappings,
            ElfBuildId,
            GimliCfiDecoder,
            fde_cache,
            BuilderConfig::default(),
        )
    }

    /// A builder with its own [`FdeCache`], sized by
    /// [`BuilderConfig::fde_cache_capacity`].
    pub fn from_config(mappings: M, config: BuilderConfig) -> Self {
        let fde_cache = Arc::new(config.new_fde_cache());
        Self::with_parts(mappings, ElfBuildId, GimliCfiDecoder, fde_cache, config)
    }
}

impl<M, B, D> PlanTableBuilder<M, B, D>
where
    M: MappingProvider,
    B: BuildIdentifier,
    D: CfiDecoder,
{
    pub fn with_parts(
        mappings: M,
        build_ids: B,
        decoder: D,
        fde_cache: Arc<FdeCache>,
        config: BuilderConfig,
    ) -> Self {
        Self {
            mappings,
            build_ids,
            decoder,
            fde_cache,
            config,
        }
    }

    pub fn with_config(mut self, config: BuilderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn fde_cache(&self) -> &Arc<FdeCache> {
        &self.fde_cache
    }

    /// Builds the plan table for all file-backed mappings of `pid`.
    ///
    /// Fails only if the mappings can't be fetched or there are none. Mappings
    /// whose object can't be read or decoded are skipped and listed in
    /// [`PlanTable::skipped_mappings`]; if none of them produced rows the
    /// table is empty and [`PlanTable::has_unwind_data`] returns false.
    pub fn build_table(&self, pid: u32) -> Result<PlanTable, Error> {
        let mappings =
            self.mappings
                .mappings_for_pid(pid)
                .map_err(|source| Error::MappingProvider {
                    pid,
                    source: Box::new(source),
                })?;
        if mappings.is_empty() {
            return Err(Error::NoMappingsFound(pid));
        }

        let mut rows = Vec::new();
        let mut covered = Vec::new();
        let mut skipped = Vec::new();
        let mut ctx = UnwindContext::new();

        for mapping in &mappings {
            if is_pseudo(mapping) {
                continue;
            }

            let path = mapping_path(&self.config.proc_root, pid, &mapping.file);
            let fdes = match self.load_fdes(&path) {
                Ok(fdes) => fdes,
                Err(error) => {
                    log::debug!("Failed to read frame description entries: {error}");
                    skipped.push(SkippedMapping {
                        file: mapping.file.clone(),
                        start: mapping.start,
                        error,
                    });
                    continue;
                }
            };

            let before = rows.len();
            let failed = append_rows(
                &fdes,
                mapping.start,
                self.config.granularity,
                &mut ctx,
                &mut rows,
            );
            if failed != 0 {
                log::debug!(
                    "Could not execute {failed} of {} FDEs in {}",
                    fdes.len(),
                    path.display()
                );
            }
            if rows.len() > before {
                covered.push(mapping.address_range());
            } else {
                log::debug!("{} contributed no unwind rows", path.display());
            }
        }

        let table = PlanTable::assemble(rows, covered, skipped);
        if table.has_unwind_data() {
            log::debug!(
                "Built plan table for pid {pid}: {} rows from {} mappings, {} skipped",
                table.len(),
                table.covered_ranges().len(),
                table.skipped_mappings().len()
            );
        } else {
            log::warn!(
                "No unwind data for pid {pid}: none of its {} mappings produced rows",
                mappings.len()
            );
        }
        Ok(table)
    }

    /// Writes a human-readable dump of every FDE in the object at `path` and
    /// the CFA rule of each of its rows. Addresses are not relocated.
    pub fn print_table<W: Write>(&self, writer: &mut W, path: &Path) -> Result<(), Error> {
        let fdes = self.load_fdes(path)?;
        let arch = fdes.arch();
        let mut ctx = UnwindContext::new();

        for fde in fdes.fdes() {
            writeln!(
                writer,
                "=> Function start: {:x}, Function end: {:x}",
                fde.start(),
                fde.end()
            )?;
            let mut rows = Vec::new();
            if let Err(err) =
                rows_for_fde(&fdes, fde, 0, RowGranularity::AllContexts, &mut ctx, &mut rows)
            {
                writeln!(writer, "\t(failed: {err})")?;
                continue;
            }
            writeln!(writer, "\t(found {} rows)", rows.len())?;
            for row in rows {
                match row.rsp {
                    Instruction::Register(reg, offset) => match arch.try_register_name(reg) {
                        Some(name) => {
                            writeln!(writer, "\t Loc: {:x} CFA: ${name}={offset}", row.loc)?
                        }
                        None => writeln!(writer, "\t Loc: {:x} CFA: $reg{reg}={offset}", row.loc)?,
                    },
                    other => writeln!(writer, "\t Loc: {:x} CFA: {other}", row.loc)?,
                }
            }
        }

        Ok(())
    }

    /// Returns the FDEs of the object at `path`, decoding it only if no
    /// object with the same build id is cached.
    fn load_fdes(&self, path: &Path) -> Result<Arc<FdeSet>, ObjectError> {
        let build_id = self
            .build_ids
            .build_id(path)
            .map_err(|source| ObjectError::BuildId {
                path: path.to_owned(),
                source,
            })?;

        if let Some(fdes) = self.fde_cache.get(&build_id) {
            return Ok(fdes);
        }

        let section = read_eh_frame(path)?;
        let mut fdes = self
            .decoder
            .parse(&section, 0)
            .map_err(|source| match source {
                DecodeError::UnsupportedArchitecture => ObjectError::UnsupportedArchitecture {
                    path: path.to_owned(),
                    arch: section.object_arch,
                },
                source => ObjectError::DecodeFailed {
                    path: path.to_owned(),
                    source,
                },
            })?;
        fdes.set_build_id(build_id.as_str());

        let fdes = Arc::new(fdes);
        self.fde_cache.put(&build_id, fdes.clone());
        Ok(fdes)
    }
}

/// Appends the rows of every FDE in `fdes`, relocated to `start`. Returns the
/// number of FDEs whose program could not be executed.
fn append_rows(
    fdes: &FdeSet,
    start: u64,
    granularity: RowGranularity,
    ctx: &mut UnwindContext<usize>,
    rows: &mut Vec<PlanTableRow>,
) -> usize {
    let mut failed = 0;
    for fde in fdes.fdes() {
        if let Err(err) = rows_for_fde(fdes, fde, start, granularity, ctx, rows) {
            log::trace!("Skipping FDE at 0x{:x}: {err}", fde.start());
            failed += 1;
        }
    }
    failed
}

fn rows_for_fde(
    fdes: &FdeSet,
    fde: &Fde,
    start: u64,
    granularity: RowGranularity,
    ctx: &mut UnwindContext<usize>,
    rows: &mut Vec<PlanTableRow>,
) -> Result<(), DecodeError> {
    let contexts = fdes.execute_with_context(fde, ctx)?;
    if contexts.first().map_or(true, |context| context.loc != fde.start()) {
        // The entry's first rows were dropped. Without a row at its start the
        // previous function's row would cover them.
        log::debug!(
            "No translatable unwind row at the start of the FDE at 0x{:x}",
            fde.start()
        );
        rows.push(PlanTableRow {
            loc: start.wrapping_add(fde.start()),
            ..Default::default()
        });
    }
    match granularity {
        RowGranularity::FirstPerFde => {
            rows.extend(contexts.first().map(|context| translate(context, start)))
        }
        RowGranularity::AllContexts => {
            rows.extend(contexts.iter().map(|context| translate(context, start)))
        }
    }
    Ok(())
}

/// Translates one instruction context into a row anchored at `start`.
pub(crate) fn translate(context: &InstructionContext, start: u64) -> PlanTableRow {
    PlanTableRow {
        loc: start.wrapping_add(context.loc),
        rip: context
            .return_address
            .as_ref()
            .map_or(Instruction::Unimplemented, Instruction::from_register_rule),
        rsp: Instruction::Register(u64::from(context.cfa.register), context.cfa.offset),
        rbp: frame_pointer_instruction(context),
    }
}

fn frame_pointer_instruction(context: &InstructionContext) -> Instruction {
    let Some(fp) = context.frame_pointer_register else {
        return Instruction::Unimplemented;
    };
    match context.frame_pointer {
        // Callee-saved with no rule, or same value: still in the register.
        None | Some(RegisterRule::SameValue) => Instruction::Register(u64::from(fp.0), 0),
        Some(RegisterRule::Offset(offset)) => Instruction::CfaOffset(offset),
        Some(RegisterRule::Undefined) => Instruction::Undefined,
        Some(_) => Instruction::Unimplemented,
    }
}
