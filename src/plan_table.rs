use std::fmt::{Debug, Display};
use std::ops::Range;

use gimli::{Endianity, RegisterRule};

use crate::display_utils::HexNum;
use crate::error::{EncodingError, ObjectError, TableError};

/// How to recover the value of one register in the caller's frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Instruction {
    /// The CFI rule for this register could not be translated. Consumers
    /// should stop unwinding at this frame.
    #[default]
    Unimplemented,
    /// The register has no recoverable value at this location, for example
    /// before a function's prologue has run.
    Undefined,
    /// The value is stored in memory at `CFA + offset`.
    CfaOffset(i64),
    /// The value is `register + offset`, with a DWARF register number.
    Register(u64, i64),
}

impl Instruction {
    pub const TAG_UNIMPLEMENTED: u8 = 0;
    pub const TAG_UNDEFINED: u8 = 1;
    pub const TAG_CFA_OFFSET: u8 = 2;
    pub const TAG_REGISTER: u8 = 3;

    /// Size of the binary encoding: tag, register, offset.
    pub const ENCODED_SIZE: usize = 1 + 8 + 8;

    pub fn tag(&self) -> u8 {
        match self {
            Instruction::Unimplemented => Self::TAG_UNIMPLEMENTED,
            Instruction::Undefined => Self::TAG_UNDEFINED,
            Instruction::CfaOffset(_) => Self::TAG_CFA_OFFSET,
            Instruction::Register(_, _) => Self::TAG_REGISTER,
        }
    }

    fn reg_and_offset(&self) -> (u64, i64) {
        match *self {
            Instruction::Unimplemented | Instruction::Undefined => (0, 0),
            Instruction::CfaOffset(offset) => (0, offset),
            Instruction::Register(reg, offset) => (reg, offset),
        }
    }

    /// Translates a CFI register rule into an instruction. Only rules which
    /// store the value relative to the CFA have a translation.
    pub fn from_register_rule(rule: &RegisterRule<usize>) -> Self {
        match *rule {
            RegisterRule::Offset(offset) => Instruction::CfaOffset(offset),
            RegisterRule::Undefined => Instruction::Undefined,
            _ => Instruction::Unimplemented,
        }
    }

    /// Writes `{tag: u8, reg: u64, offset: i64}` into the first
    /// [`Instruction::ENCODED_SIZE`] bytes of `buf`.
    ///
    /// Panics if `buf` is shorter than that.
    pub fn write<E: Endianity>(&self, endian: E, buf: &mut [u8]) {
        let (reg, offset) = self.reg_and_offset();
        buf[0] = self.tag();
        endian.write_u64(&mut buf[1..9], reg);
        endian.write_u64(&mut buf[9..17], offset as u64);
    }

    pub fn to_bytes<E: Endianity>(&self, endian: E) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0; Self::ENCODED_SIZE];
        self.write(endian, &mut buf);
        buf
    }

    /// Reads an instruction written by [`Instruction::write`].
    pub fn read<E: Endianity>(endian: E, buf: &[u8]) -> Result<Self, EncodingError> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(EncodingError::Truncated {
                expected: Self::ENCODED_SIZE,
                actual: buf.len(),
            });
        }
        let reg = endian.read_u64(&buf[1..9]);
        let offset = endian.read_i64(&buf[9..17]);
        match buf[0] {
            Self::TAG_UNIMPLEMENTED => Ok(Instruction::Unimplemented),
            Self::TAG_UNDEFINED => Ok(Instruction::Undefined),
            Self::TAG_CFA_OFFSET => Ok(Instruction::CfaOffset(offset)),
            Self::TAG_REGISTER => Ok(Instruction::Register(reg, offset)),
            tag => Err(EncodingError::UnknownTag(tag)),
        }
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Unimplemented => f.write_str("unimplemented"),
            Instruction::Undefined => f.write_str("undefined"),
            Instruction::CfaOffset(offset) => write!(f, "[cfa{}]", RelativeOffset(*offset)),
            Instruction::Register(reg, offset) => write!(f, "reg{reg}{}", RelativeOffset(*offset)),
        }
    }
}

struct RelativeOffset(i64);

impl Display for RelativeOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 > 0 {
            f.write_str("+")?;
        }
        if self.0 != 0 {
            Display::fmt(&self.0, f)?;
        }
        Ok(())
    }
}

/// One row of a plan table. It applies from `loc` up to the next row's `loc`.
///
/// The field names follow x86-64; on aarch64 they hold the rules for lr, sp
/// and fp.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PlanTableRow {
    /// Absolute address of the first instruction this row applies to.
    pub loc: u64,
    /// Recovers the return address.
    pub rip: Instruction,
    /// Recovers the CFA, which is the caller's stack pointer.
    pub rsp: Instruction,
    /// Recovers the frame pointer.
    pub rbp: Instruction,
}

impl PlanTableRow {
    /// `loc` followed by the `rip`, `rsp` and `rbp` instructions.
    pub const ENCODED_SIZE: usize = 8 + 3 * Instruction::ENCODED_SIZE;

    /// Writes the row into the first [`PlanTableRow::ENCODED_SIZE`] bytes of
    /// `buf`.
    ///
    /// Panics if `buf` is shorter than that.
    pub fn write<E: Endianity>(&self, endian: E, buf: &mut [u8]) {
        const I: usize = Instruction::ENCODED_SIZE;
        endian.write_u64(&mut buf[..8], self.loc);
        self.rip.write(endian, &mut buf[8..8 + I]);
        self.rsp.write(endian, &mut buf[8 + I..8 + 2 * I]);
        self.rbp.write(endian, &mut buf[8 + 2 * I..8 + 3 * I]);
    }

    pub fn read<E: Endianity>(endian: E, buf: &[u8]) -> Result<Self, EncodingError> {
        const I: usize = Instruction::ENCODED_SIZE;
        if buf.len() < Self::ENCODED_SIZE {
            return Err(EncodingError::Truncated {
                expected: Self::ENCODED_SIZE,
                actual: buf.len(),
            });
        }
        Ok(Self {
            loc: endian.read_u64(&buf[..8]),
            rip: Instruction::read(endian, &buf[8..8 + I])?,
            rsp: Instruction::read(endian, &buf[8 + I..8 + 2 * I])?,
            rbp: Instruction::read(endian, &buf[8 + 2 * I..8 + 3 * I])?,
        })
    }
}

impl Debug for PlanTableRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanTableRow")
            .field("loc", &HexNum(self.loc))
            .field("rip", &self.rip)
            .field("rsp", &self.rsp)
            .field("rbp", &self.rbp)
            .finish()
    }
}

/// A mapping which contributed no rows to a table, and why.
#[derive(Debug)]
pub struct SkippedMapping {
    pub file: String,
    pub start: u64,
    pub error: ObjectError,
}

/// The unwind rows of all executable mappings of one process, sorted by
/// address.
#[derive(Debug, Default)]
pub struct PlanTable {
    rows: Vec<PlanTableRow>,
    /// Address ranges of the mappings that contributed rows, sorted. Empty
    /// means the rows are not restricted to any mapping.
    covered: Vec<Range<u64>>,
    skipped: Vec<SkippedMapping>,
}

impl PlanTable {
    /// Creates a table from rows which must already be sorted by `loc`.
    pub fn from_rows(rows: Vec<PlanTableRow>) -> Result<Self, TableError> {
        check_sorted(&rows)?;
        Ok(Self {
            rows,
            covered: Vec::new(),
            skipped: Vec::new(),
        })
    }

    pub(crate) fn assemble(
        mut rows: Vec<PlanTableRow>,
        mut covered: Vec<Range<u64>>,
        skipped: Vec<SkippedMapping>,
    ) -> Self {
        rows.sort_by_key(|row| row.loc);
        covered.sort_by_key(|range| range.start);
        Self {
            rows,
            covered,
            skipped,
        }
    }

    pub fn rows(&self) -> &[PlanTableRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// False if no mapping produced any rows. This is a build-time condition,
    /// unlike a failed [`PlanTable::lookup`].
    pub fn has_unwind_data(&self) -> bool {
        !self.rows.is_empty()
    }

    /// The address ranges of the mappings that contributed rows.
    pub fn covered_ranges(&self) -> &[Range<u64>] {
        &self.covered
    }

    /// Mappings which were considered but contributed nothing.
    pub fn skipped_mappings(&self) -> &[SkippedMapping] {
        &self.skipped
    }

    /// Finds the row for `pc`: the last row with `loc <= pc`, provided it
    /// belongs to the mapping which contains `pc`.
    pub fn lookup(&self, pc: u64) -> Option<&PlanTableRow> {
        let mapping_start = if self.covered.is_empty() {
            0
        } else {
            let index = self.covered.partition_point(|range| range.start <= pc);
            let range = &self.covered[index.checked_sub(1)?];
            if !range.contains(&pc) {
                return None;
            }
            range.start
        };
        let index = self.rows.partition_point(|row| row.loc <= pc);
        let row = &self.rows[index.checked_sub(1)?];
        if row.loc < mapping_start {
            return None;
        }
        Some(row)
    }

    /// Encodes all rows back to back, see [`PlanTableRow::ENCODED_SIZE`].
    pub fn to_bytes<E: Endianity>(&self, endian: E) -> Vec<u8> {
        let mut bytes = vec![0; self.rows.len() * PlanTableRow::ENCODED_SIZE];
        for (row, buf) in self
            .rows
            .iter()
            .zip(bytes.chunks_exact_mut(PlanTableRow::ENCODED_SIZE))
        {
            row.write(endian, buf);
        }
        bytes
    }

    /// Decodes rows written by [`PlanTable::to_bytes`]. The rows must be sorted.
    pub fn from_bytes<E: Endianity>(endian: E, bytes: &[u8]) -> Result<Self, EncodingError> {
        if bytes.len() % PlanTableRow::ENCODED_SIZE != 0 {
            return Err(EncodingError::TrailingBytes(bytes.len()));
        }
        let rows = bytes
            .chunks_exact(PlanTableRow::ENCODED_SIZE)
            .map(|buf| PlanTableRow::read(endian, buf))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_rows(rows)?)
    }
}

fn check_sorted(rows: &[PlanTableRow]) -> Result<(), TableError> {
    match rows.windows(2).position(|w| w[1].loc < w[0].loc) {
        Some(i) => Err(TableError::UnsortedRows {
            index: i + 1,
            previous: rows[i].loc,
            loc: rows[i + 1].loc,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use gimli::{BigEndian, LittleEndian};

    fn row(loc: u64) -> PlanTableRow {
        PlanTableRow {
            loc,
            rip: Instruction::CfaOffset(-8),
            rsp: Instruction::Register(7, 8),
            rbp: Instruction::Undefined,
        }
    }

    #[test]
    fn instruction_round_trip() {
        let instructions = [
            Instruction::Undefined,
            Instruction::Unimplemented,
            Instruction::CfaOffset(0),
            Instruction::CfaOffset(16),
            Instruction::CfaOffset(-8),
            Instruction::CfaOffset(i64::MIN),
            Instruction::CfaOffset(i64::MAX),
            Instruction::Register(7, 0),
            Instruction::Register(6, 16),
            Instruction::Register(0, -1),
            Instruction::Register(u64::MAX, i64::MIN),
            Instruction::Register(16, i64::MAX),
        ];
        for i in instructions {
            let le = i.to_bytes(LittleEndian);
            assert_eq!(Instruction::read(LittleEndian, &le), Ok(i));
            let be = i.to_bytes(BigEndian);
            assert_eq!(Instruction::read(BigEndian, &be), Ok(i));
        }
    }

    #[test]
    fn instruction_layout() {
        let bytes = Instruction::Register(7, -16).to_bytes(LittleEndian);
        assert_eq!(bytes[0], Instruction::TAG_REGISTER);
        assert_eq!(&bytes[1..9], &7u64.to_le_bytes());
        assert_eq!(&bytes[9..17], &(-16i64).to_le_bytes());

        let bytes = Instruction::CfaOffset(-8).to_bytes(BigEndian);
        assert_eq!(bytes[0], Instruction::TAG_CFA_OFFSET);
        assert_eq!(&bytes[1..9], &[0; 8]);
        assert_eq!(&bytes[9..17], &(-8i64).to_be_bytes());
    }

    #[test]
    fn bad_encodings() {
        let mut bytes = Instruction::Undefined.to_bytes(LittleEndian);
        bytes[0] = 9;
        assert_eq!(
            Instruction::read(LittleEndian, &bytes),
            Err(EncodingError::UnknownTag(9))
        );
        assert_eq!(
            Instruction::read(LittleEndian, &bytes[..10]),
            Err(EncodingError::Truncated {
                expected: 17,
                actual: 10
            })
        );
    }

    #[test]
    fn register_rule_translation() {
        assert_eq!(
            Instruction::from_register_rule(&RegisterRule::Offset(-8)),
            Instruction::CfaOffset(-8)
        );
        assert_eq!(
            Instruction::from_register_rule(&RegisterRule::Undefined),
            Instruction::Undefined
        );
        assert_eq!(
            Instruction::from_register_rule(&RegisterRule::SameValue),
            Instruction::Unimplemented
        );
        assert_eq!(
            Instruction::from_register_rule(&RegisterRule::ValOffset(8)),
            Instruction::Unimplemented
        );
        assert_eq!(
            Instruction::from_register_rule(&RegisterRule::Register(gimli::X86_64::RBX)),
            Instruction::Unimplemented
        );
    }

    #[test]
    fn display() {
        assert_eq!(Instruction::CfaOffset(-8).to_string(), "[cfa-8]");
        assert_eq!(Instruction::Register(7, 16).to_string(), "reg7+16");
        assert_eq!(Instruction::Register(6, 0).to_string(), "reg6");
        assert_eq!(Instruction::Undefined.to_string(), "undefined");
    }

    #[test]
    fn unsorted_rows_are_rejected() {
        let err = PlanTable::from_rows(vec![row(0x10), row(0x30), row(0x20)]).unwrap_err();
        assert_eq!(
            err,
            TableError::UnsortedRows {
                index: 2,
                previous: 0x30,
                loc: 0x20
            }
        );
        assert!(PlanTable::from_rows(vec![row(0x10), row(0x10), row(0x20)]).is_ok());
        assert!(PlanTable::from_rows(Vec::new()).is_ok());
    }

    #[test]
    fn lookup_boundaries() {
        let table = PlanTable::from_rows(vec![row(0x1000), row(0x1050), row(0x2000)]).unwrap();
        assert_eq!(table.lookup(0), None);
        assert_eq!(table.lookup(0xfff), None);
        assert_eq!(table.lookup(0x1000).unwrap().loc, 0x1000);
        assert_eq!(table.lookup(0x104f).unwrap().loc, 0x1000);
        assert_eq!(table.lookup(0x1050).unwrap().loc, 0x1050);
        assert_eq!(table.lookup(0x1fff).unwrap().loc, 0x1050);
        assert_eq!(table.lookup(0x2000).unwrap().loc, 0x2000);
        assert_eq!(table.lookup(u64::MAX).unwrap().loc, 0x2000);
        assert_eq!(PlanTable::default().lookup(0x1000), None);
    }

    #[test]
    fn lookup_respects_mapping_ranges() {
        let table = PlanTable::assemble(
            vec![row(0x5010), row(0x1010), row(0x1080)],
            vec![0x5000..0x6000, 0x1000..0x2000],
            Vec::new(),
        );
        assert_eq!(table.covered_ranges(), &[0x1000..0x2000, 0x5000..0x6000]);
        assert_eq!(table.lookup(0x1005), None);
        assert_eq!(table.lookup(0x1090).unwrap().loc, 0x1080);
        assert_eq!(table.lookup(0x1fff).unwrap().loc, 0x1080);
        // Between the two mappings: not covered by any table.
        assert_eq!(table.lookup(0x3000), None);
        // Inside the second mapping but before its first row.
        assert_eq!(table.lookup(0x5008), None);
        assert_eq!(table.lookup(0x5010).unwrap().loc, 0x5010);
        assert_eq!(table.lookup(0x6000), None);
    }

    #[test]
    fn assemble_sorts_rows() {
        let table = PlanTable::assemble(
            vec![row(0x30), row(0x10), row(0x20)],
            Vec::new(),
            Vec::new(),
        );
        let locs: Vec<u64> = table.rows().iter().map(|r| r.loc).collect();
        assert_eq!(locs, vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn table_bytes() {
        let table = PlanTable::from_rows(vec![row(0x1000), row(0x1050)]).unwrap();
        let bytes = table.to_bytes(LittleEndian);
        assert_eq!(bytes.len(), 2 * PlanTableRow::ENCODED_SIZE);
        assert_eq!(&bytes[..8], &0x1000u64.to_le_bytes());
        let decoded = PlanTable::from_bytes(LittleEndian, &bytes).unwrap();
        assert_eq!(decoded.rows(), table.rows());

        assert_eq!(
            PlanTable::from_bytes(LittleEndian, &bytes[..bytes.len() - 1]).unwrap_err(),
            EncodingError::TrailingBytes(2 * PlanTableRow::ENCODED_SIZE - 1)
        );

        let reversed = PlanTable::from_rows(vec![row(0x1050)])
            .unwrap()
            .to_bytes(BigEndian)
            .into_iter()
            .chain(row_bytes(0x1000))
            .collect::<Vec<u8>>();
        assert!(matches!(
            PlanTable::from_bytes(BigEndian, &reversed),
            Err(EncodingError::Table(TableError::UnsortedRows { .. }))
        ));
    }

    fn row_bytes(loc: u64) -> Vec<u8> {
        let mut buf = vec![0; PlanTableRow::ENCODED_SIZE];
        row(loc).write(BigEndian, &mut buf);
        buf
    }
}
