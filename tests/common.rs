#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use gimli::write::{
    Address, CallFrameInstruction, CommonInformationEntry, EhFrame, EndianVec,
    FrameDescriptionEntry, FrameTable,
};
use object::{Architecture, BinaryFormat, Endianness, SectionKind};

use unwind_plan::*;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An FDE to put into a synthetic `.eh_frame` section. Instruction offsets are
/// relative to `start`.
pub struct TestFde {
    pub start: u64,
    pub len: u32,
    pub instructions: Vec<(u32, CallFrameInstruction)>,
}

impl TestFde {
    pub fn new(start: u64, len: u32) -> Self {
        Self {
            start,
            len,
            instructions: Vec::new(),
        }
    }

    pub fn with(mut self, offset: u32, instruction: CallFrameInstruction) -> Self {
        self.instructions.push((offset, instruction));
        self
    }
}

pub fn eh_frame_bytes(
    address_size: u8,
    return_address_register: gimli::Register,
    cie_instructions: &[CallFrameInstruction],
    fdes: Vec<TestFde>,
) -> Vec<u8> {
    let encoding = gimli::Encoding {
        address_size,
        format: gimli::Format::Dwarf32,
        version: 1,
    };
    let data_alignment = -(i8::try_from(address_size).unwrap());
    let mut cie = CommonInformationEntry::new(encoding, 1, data_alignment, return_address_register);
    for instruction in cie_instructions {
        cie.add_instruction(instruction.clone());
    }

    let mut table = FrameTable::default();
    let cie_id = table.add_cie(cie);
    for test_fde in fdes {
        let mut fde = FrameDescriptionEntry::new(Address::Constant(test_fde.start), test_fde.len);
        for (offset, instruction) in test_fde.instructions {
            fde.add_instruction(offset, instruction);
        }
        table.add_fde(cie_id, fde);
    }

    let mut eh_frame = EhFrame(EndianVec::new(gimli::LittleEndian));
    table.write_eh_frame(&mut eh_frame).unwrap();
    eh_frame.0.into_vec()
}

/// The usual x86-64 CIE: CFA = rsp + 8, return address at CFA - 8.
pub fn x86_64_cie() -> Vec<CallFrameInstruction> {
    vec![
        CallFrameInstruction::Cfa(gimli::X86_64::RSP, 8),
        CallFrameInstruction::Offset(gimli::X86_64::RA, -8),
    ]
}

/// A function with a classic `push rbp; mov rbp, rsp` prologue.
pub fn framed_function(start: u64, len: u32) -> TestFde {
    TestFde::new(start, len)
        .with(1, CallFrameInstruction::CfaOffset(16))
        .with(1, CallFrameInstruction::Offset(gimli::X86_64::RBP, -16))
        .with(4, CallFrameInstruction::CfaRegister(gimli::X86_64::RBP))
}

pub fn x86_64_eh_frame(fdes: Vec<TestFde>) -> Vec<u8> {
    eh_frame_bytes(8, gimli::X86_64::RA, &x86_64_cie(), fdes)
}

fn build_id_note(build_id: &[u8]) -> Vec<u8> {
    let mut note = Vec::new();
    note.extend_from_slice(&4u32.to_le_bytes());
    note.extend_from_slice(&(build_id.len() as u32).to_le_bytes());
    note.extend_from_slice(&object::elf::NT_GNU_BUILD_ID.to_le_bytes());
    note.extend_from_slice(b"GNU\0");
    note.extend_from_slice(build_id);
    while note.len() % 4 != 0 {
        note.push(0);
    }
    note
}

/// A little-endian ELF relocatable object with a GNU build id note and,
/// optionally, an `.eh_frame` section.
pub fn elf_object(arch: Architecture, build_id: &[u8], eh_frame: Option<&[u8]>) -> Vec<u8> {
    let mut obj = object::write::Object::new(BinaryFormat::Elf, arch, Endianness::Little);

    let note = obj.add_section(
        Vec::new(),
        b".note.gnu.build-id".to_vec(),
        SectionKind::Note,
    );
    obj.append_section_data(note, &build_id_note(build_id), 4);

    if let Some(eh_frame) = eh_frame {
        let section = obj.add_section(Vec::new(), b".eh_frame".to_vec(), SectionKind::ReadOnlyData);
        obj.append_section_data(section, eh_frame, 8);
    }

    obj.write().unwrap()
}

pub fn x86_64_object(build_id: &[u8], fdes: Vec<TestFde>) -> Vec<u8> {
    elf_object(
        Architecture::X86_64,
        build_id,
        Some(&x86_64_eh_frame(fdes)),
    )
}

/// A fake procfs tree: objects installed for a pid are reachable under
/// `<proc_root>/<pid>/root/<file>`.
pub struct FakeProc {
    dir: tempfile::TempDir,
}

impl FakeProc {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn proc_root(&self) -> &Path {
        self.dir.path()
    }

    pub fn install(&self, pid: u32, file: &str, contents: &[u8]) -> PathBuf {
        let path = mapping_path(self.proc_root(), pid, file);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn config(&self) -> BuilderConfig {
        BuilderConfig::default().with_proc_root(self.proc_root())
    }
}

#[derive(Default)]
pub struct StaticMappings(pub HashMap<u32, Vec<Mapping>>);

impl StaticMappings {
    pub fn with(mut self, pid: u32, mappings: Vec<Mapping>) -> Self {
        self.0.insert(pid, mappings);
        self
    }
}

impl MappingProvider for StaticMappings {
    type Error = std::io::Error;

    fn mappings_for_pid(&self, pid: u32) -> Result<Vec<Mapping>, Self::Error> {
        self.0.get(&pid).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no process {pid}"))
        })
    }
}

pub fn mapping(file: &str, build_id: &str, start: u64, limit: u64) -> Mapping {
    Mapping {
        file: file.to_string(),
        build_id: build_id.to_string(),
        start,
        limit,
        offset: 0,
    }
}

/// Counts how often an object's CFI was actually decoded.
#[derive(Default)]
pub struct CountingDecoder {
    calls: AtomicUsize,
}

impl CountingDecoder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CfiDecoder for CountingDecoder {
    fn parse(&self, section: &EhFrameSection, load_bias: u64) -> Result<FdeSet, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        GimliCfiDecoder.parse(section, load_bias)
    }
}
