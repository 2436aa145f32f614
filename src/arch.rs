use gimli::{AArch64, Register, X86, X86_64};

/// The architectures we can build plan tables for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    I386,
    X86_64,
    Aarch64,
    Unsupported,
}

impl Arch {
    pub fn from_object(arch: object::Architecture) -> Self {
        match arch {
            object::Architecture::I386 => Arch::I386,
            object::Architecture::X86_64 => Arch::X86_64,
            object::Architecture::Aarch64 => Arch::Aarch64,
            _ => Arch::Unsupported,
        }
    }

    /// The target pointer width in bytes, or 0 if the architecture is not supported.
    pub fn pointer_size(self) -> u8 {
        match self {
            Arch::I386 => 4,
            Arch::X86_64 | Arch::Aarch64 => 8,
            Arch::Unsupported => 0,
        }
    }

    pub fn is_supported(self) -> bool {
        self.pointer_size() != 0
    }

    pub fn frame_pointer_register(self) -> Option<Register> {
        match self {
            Arch::I386 => Some(X86::EBP),
            Arch::X86_64 => Some(X86_64::RBP),
            Arch::Aarch64 => Some(AArch64::X29),
            Arch::Unsupported => None,
        }
    }

    /// The DWARF register names of this architecture, indexed by register number.
    pub fn register_names(self) -> &'static [&'static str] {
        match self {
            Arch::I386 => I386_REGISTERS,
            Arch::X86_64 => X86_64_REGISTERS,
            Arch::Aarch64 => AARCH64_REGISTERS,
            Arch::Unsupported => &[],
        }
    }

    /// Returns the mnemonic for a DWARF register number.
    ///
    /// Panics if `reg` is not part of the architecture's register table. The
    /// tables are fixed, so an out-of-range number is a bug in the caller.
    pub fn register_name(self, reg: u64) -> &'static str {
        match self.try_register_name(reg) {
            Some(name) => name,
            None => panic!("DWARF register {reg} is out of range for {self:?}"),
        }
    }

    /// Like [`Arch::register_name`], for register numbers read from untrusted data.
    pub fn try_register_name(self, reg: u64) -> Option<&'static str> {
        let names = self.register_names();
        usize::try_from(reg).ok().and_then(|i| names.get(i)).copied()
    }
}

/// Returns the x86-64 mnemonic for a DWARF register number. Panics when out of range.
pub fn x86_64_register_name(reg: u64) -> &'static str {
    Arch::X86_64.register_name(reg)
}

// System V AMD64 ABI, figure 3.36 "DWARF Register Number Mapping".
const X86_64_REGISTERS: &[&str] = &[
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip", "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8",
    "xmm9", "xmm10", "xmm11", "xmm12", "xmm13", "xmm14", "xmm15", "st0", "st1", "st2", "st3",
    "st4", "st5", "st6", "st7", "mm0", "mm1", "mm2", "mm3", "mm4", "mm5", "mm6", "mm7", "rflags",
    "es", "cs", "ss", "ds", "fs", "gs", "unused1", "unused2", "fs.base", "gs.base", "unused3",
    "unused4", "tr", "ldtr", "mxcsr", "fcw", "fsw",
];

// i386 System V ABI, table 2.14.
const I386_REGISTERS: &[&str] = &[
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "eip", "eflags",
];

// DWARF for the Arm 64-bit Architecture, section 4.1. Only the general purpose
// block is listed.
const AARCH64_REGISTERS: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp", "pc", "elr_mode", "ra_sign_state",
];
