use std::sync::Arc;

use gimli::{
    BaseAddresses, CallFrameInstruction, CfaRule, CieOrFde, EhFrame, EndianArcSlice,
    FrameDescriptionEntry, Register, RegisterRule, RunTimeEndian, UnwindContext,
    UnwindSection, UnwindTableRow,
};

use crate::arch::Arch;
use crate::object_reader::EhFrameSection;

pub type CfiReader = EndianArcSlice<RunTimeEndian>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unsupported architecture, the pointer size is unknown")]
    UnsupportedArchitecture,

    #[error("Malformed call frame information: {0}")]
    Cfi(#[from] gimli::Error),
}

/// Turns a raw `.eh_frame` section into frame description entries.
pub trait CfiDecoder {
    /// Parses every FDE in `section`. All addresses reported by the returned
    /// set, and by [`FdeSet::execute`], are shifted by `load_bias`.
    fn parse(&self, section: &EhFrameSection, load_bias: u64) -> Result<FdeSet, DecodeError>;
}

impl<D: CfiDecoder + ?Sized> CfiDecoder for &D {
    fn parse(&self, section: &EhFrameSection, load_bias: u64) -> Result<FdeSet, DecodeError> {
        (**self).parse(section, load_bias)
    }
}

/// The default decoder, backed by gimli.
#[derive(Clone, Copy, Debug, Default)]
pub struct GimliCfiDecoder;

impl CfiDecoder for GimliCfiDecoder {
    fn parse(&self, section: &EhFrameSection, load_bias: u64) -> Result<FdeSet, DecodeError> {
        if section.pointer_size == 0 {
            return Err(DecodeError::UnsupportedArchitecture);
        }

        let reader = EndianArcSlice::new(Arc::from(section.data.as_slice()), section.endian);
        let mut eh_frame = EhFrame::from(reader);
        eh_frame.set_address_size(section.pointer_size);
        let bases = BaseAddresses::default().set_eh_frame(section.address);

        let mut fdes = Vec::new();
        let mut entries = eh_frame.entries(&bases);
        while let Some(entry) = entries.next()? {
            match entry {
                CieOrFde::Cie(_) => {}
                CieOrFde::Fde(partial) => {
                    let fde = partial
                        .parse(|section, bases, offset| section.cie_from_offset(bases, offset))?;
                    fdes.push(Fde { inner: fde, load_bias });
                }
            }
        }

        Ok(FdeSet {
            build_id: None,
            arch: section.arch,
            eh_frame,
            bases,
            load_bias,
            fdes,
        })
    }
}

/// One frame description entry, usually covering one function.
#[derive(Clone, Debug)]
pub struct Fde {
    inner: FrameDescriptionEntry<CfiReader>,
    load_bias: u64,
}

impl Fde {
    /// The first address covered by this entry.
    pub fn start(&self) -> u64 {
        self.inner.initial_address().wrapping_add(self.load_bias)
    }

    /// The first address past the end of this entry.
    pub fn end(&self) -> u64 {
        self.start().wrapping_add(self.inner.len())
    }

    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// The register which holds the return address, as declared by the CIE.
    pub fn return_address_register(&self) -> gimli::Register {
        self.inner.cie().return_address_register()
    }
}

/// The rule for recovering the canonical frame address at one location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CfaRegisterOffset {
    pub register: u16,
    pub offset: i64,
}

/// The unwind state of one address range inside an FDE.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstructionContext {
    /// Where this context starts to apply.
    pub loc: u64,
    /// Where the next context starts, or the FDE's end.
    pub end: u64,
    pub cfa: CfaRegisterOffset,
    /// The rule for the return address register. `None` if the CFI has no
    /// rule for it at all, `Some(Undefined)` only for an explicit
    /// `DW_CFA_undefined`.
    pub return_address: Option<RegisterRule<usize>>,
    /// The architecture's frame pointer register, if it has one.
    pub frame_pointer_register: Option<Register>,
    /// The rule for the frame pointer, with the same `None` convention as
    /// `return_address`.
    pub frame_pointer: Option<RegisterRule<usize>>,
}

/// The decoded frame description entries of one object.
///
/// Owns a reference-counted copy of the section, so the set can be shared
/// between threads and outlive the file it was read from.
pub struct FdeSet {
    build_id: Option<String>,
    arch: Arch,
    eh_frame: EhFrame<CfiReader>,
    bases: BaseAddresses,
    load_bias: u64,
    fdes: Vec<Fde>,
}

impl FdeSet {
    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn fdes(&self) -> &[Fde] {
        &self.fdes
    }

    pub fn len(&self) -> usize {
        self.fdes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fdes.is_empty()
    }

    /// The build id this set was decoded for, if it has been labeled.
    pub fn build_id(&self) -> Option<&str> {
        self.build_id.as_deref()
    }

    pub fn set_build_id(&mut self, build_id: impl Into<String>) {
        self.build_id = Some(build_id.into());
    }

    /// Runs the DWARF program of `fde` and returns one context per row of
    /// its unwind table, in address order.
    pub fn execute(&self, fde: &Fde) -> Result<Vec<InstructionContext>, DecodeError> {
        let mut ctx = UnwindContext::new();
        self.execute_with_context(fde, &mut ctx)
    }

    /// Like [`FdeSet::execute`], reusing the caller's gimli unwind context.
    ///
    /// Rows whose CFA is a DWARF expression have no register+offset form and
    /// are left out.
    pub fn execute_with_context(
        &self,
        fde: &Fde,
        ctx: &mut UnwindContext<usize>,
    ) -> Result<Vec<InstructionContext>, DecodeError> {
        let ra = fde.return_address_register();
        let fp = self.arch.frame_pointer_register();
        let ra_undefined = self.explicitly_undefined(fde, ra)?;
        let fp_undefined = match fp {
            Some(fp) => self.explicitly_undefined(fde, fp)?,
            None => Vec::new(),
        };

        let mut contexts = Vec::new();
        let mut table = fde.inner.rows(&self.eh_frame, &self.bases, ctx)?;
        while let Some(row) = table.next_row()? {
            let cfa = match *row.cfa() {
                CfaRule::RegisterAndOffset { register, offset } => CfaRegisterOffset {
                    register: register.0,
                    offset,
                },
                CfaRule::Expression(_) => {
                    log::trace!(
                        "Skipping row at 0x{:x}: CFA is a DWARF expression",
                        row.start_address()
                    );
                    continue;
                }
            };
            contexts.push(InstructionContext {
                loc: row.start_address().wrapping_add(self.load_bias),
                end: row.end_address().wrapping_add(self.load_bias),
                cfa,
                return_address: rule_for(row, ra, &ra_undefined),
                frame_pointer_register: fp,
                frame_pointer: fp.and_then(|fp| rule_for(row, fp, &fp_undefined)),
            });
        }
        Ok(contexts)
    }

    /// Replays the CIE and FDE programs for `register` alone and returns, for
    /// every row start, whether the register was explicitly marked undefined.
    ///
    /// gimli's rows drop undefined rules, which makes `DW_CFA_undefined`
    /// indistinguishable from a register the CFI never mentions.
    fn explicitly_undefined(
        &self,
        fde: &Fde,
        register: Register,
    ) -> Result<Vec<(u64, bool)>, DecodeError> {
        let cie = fde.inner.cie();

        let mut undefined = false;
        let mut instructions = cie.instructions(&self.eh_frame, &self.bases);
        while let Some(instruction) = instructions.next()? {
            apply_to_register(&instruction, register, &mut undefined);
        }
        let initial = undefined;

        let mut states = Vec::new();
        let mut stack = Vec::new();
        let mut row_start = fde.inner.initial_address();
        let mut instructions = fde.inner.instructions(&self.eh_frame, &self.bases);
        while let Some(instruction) = instructions.next()? {
            match instruction {
                CallFrameInstruction::SetLoc { address } => {
                    states.push((row_start, undefined));
                    row_start = address;
                }
                CallFrameInstruction::AdvanceLoc { delta } => {
                    states.push((row_start, undefined));
                    row_start = row_start
                        .wrapping_add(u64::from(delta).wrapping_mul(cie.code_alignment_factor()));
                }
                CallFrameInstruction::RememberState => stack.push(undefined),
                CallFrameInstruction::RestoreState => {
                    if let Some(saved) = stack.pop() {
                        undefined = saved;
                    }
                }
                CallFrameInstruction::Restore { register: r } if r == register => {
                    undefined = initial;
                }
                ref other => apply_to_register(other, register, &mut undefined),
            }
        }
        states.push((row_start, undefined));
        Ok(states)
    }
}

/// Tracks whether `register` is explicitly undefined after `instruction`.
fn apply_to_register(
    instruction: &CallFrameInstruction<usize>,
    register: Register,
    undefined: &mut bool,
) {
    let target = match *instruction {
        CallFrameInstruction::Undefined { register: r } => {
            if r == register {
                *undefined = true;
            }
            return;
        }
        CallFrameInstruction::SameValue { register: r }
        | CallFrameInstruction::Offset { register: r, .. }
        | CallFrameInstruction::OffsetExtendedSf { register: r, .. }
        | CallFrameInstruction::ValOffset { register: r, .. }
        | CallFrameInstruction::ValOffsetSf { register: r, .. }
        | CallFrameInstruction::Expression { register: r, .. }
        | CallFrameInstruction::ValExpression { register: r, .. }
        | CallFrameInstruction::Register {
            dest_register: r, ..
        } => r,
        _ => return,
    };
    if target == register {
        *undefined = false;
    }
}

/// The rule for `register` in `row`: `None` if the CFI has no rule for it,
/// `Some(Undefined)` if it was explicitly undefined at this row's start.
fn rule_for(
    row: &UnwindTableRow<usize>,
    register: Register,
    undefined: &[(u64, bool)],
) -> Option<RegisterRule<usize>> {
    if let Some((_, rule)) = row.registers().find(|(r, _)| *r == register) {
        return Some(rule.clone());
    }
    let index = undefined.partition_point(|&(start, _)| start <= row.start_address());
    match index.checked_sub(1).map(|i| undefined[i].1) {
        Some(true) => Some(RegisterRule::Undefined),
        _ => None,
    }
}

impl std::fmt::Debug for FdeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdeSet")
            .field("build_id", &self.build_id)
            .field("arch", &self.arch)
            .field("load_bias", &crate::display_utils::HexNum(self.load_bias))
            .field("fde_count", &self.fdes.len())
            .finish()
    }
}
