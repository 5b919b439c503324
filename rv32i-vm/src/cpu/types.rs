use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of memory access that violated the alignment policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    Load,
    Store,
    /// Control transfer to a target that is not an instruction boundary.
    Fetch,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessKind::Load => "load",
            AccessKind::Store => "store",
            AccessKind::Fetch => "fetch",
        };
        f.write_str(name)
    }
}

/// Reasons the execution engine refuses an instruction.
///
/// A trap never leaves partial state behind: registers, memory and the pc
/// are exactly as they were before the faulting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Trap {
    #[error("unknown opcode {opcode:#04x}")]
    UnknownOpcode { opcode: u8 },

    #[error("unsupported function code for opcode {opcode:#04x} (funct3={funct3:#x}, funct7={funct7:#04x})")]
    UnknownFunctionCode { opcode: u8, funct3: u8, funct7: u8 },

    #[error("unaligned {kind} access at {addr:#010x}")]
    UnalignedAccess { addr: u32, kind: AccessKind },
}

/// A trap tagged with the location and encoding of the offending
/// instruction, as relayed by the fetch-execute loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{trap} at pc={pc:#010x} (insn={word:#010x})")]
pub struct Fault {
    pub pc: u32,
    pub word: u32,
    #[source]
    pub trap: Trap,
}
