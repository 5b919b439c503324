use serde::{Deserialize, Serialize};
use std::fmt;

pub const OPCODE_LOAD: u8 = 0x03;
pub const OPCODE_MISC_MEM: u8 = 0x0F;
pub const OPCODE_OP_IMM: u8 = 0x13;
pub const OPCODE_AUIPC: u8 = 0x17;
pub const OPCODE_STORE: u8 = 0x23;
pub const OPCODE_OP: u8 = 0x33;
pub const OPCODE_LUI: u8 = 0x37;
pub const OPCODE_BRANCH: u8 = 0x63;
pub const OPCODE_JALR: u8 = 0x67;
pub const OPCODE_JAL: u8 = 0x6F;
pub const OPCODE_SYSTEM: u8 = 0x73;

/// funct7 selecting the primary operation of an R-type or shift family.
const FUNCT7_PRIMARY: u8 = 0x00;
/// funct7 selecting SUB / SRA / SRAI.
const FUNCT7_ALT: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Register {
    X0,
    X1,
    X2,
    X3,
    X4,
    X5,
    X6,
    X7,
    X8,
    X9,
    X10,
    X11,
    X12,
    X13,
    X14,
    X15,
    X16,
    X17,
    X18,
    X19,
    X20,
    X21,
    X22,
    X23,
    X24,
    X25,
    X26,
    X27,
    X28,
    X29,
    X30,
    X31,
}

impl Register {
    pub const ALL: [Register; 32] = [
        Register::X0,
        Register::X1,
        Register::X2,
        Register::X3,
        Register::X4,
        Register::X5,
        Register::X6,
        Register::X7,
        Register::X8,
        Register::X9,
        Register::X10,
        Register::X11,
        Register::X12,
        Register::X13,
        Register::X14,
        Register::X15,
        Register::X16,
        Register::X17,
        Register::X18,
        Register::X19,
        Register::X20,
        Register::X21,
        Register::X22,
        Register::X23,
        Register::X24,
        Register::X25,
        Register::X26,
        Register::X27,
        Register::X28,
        Register::X29,
        Register::X30,
        Register::X31,
    ];

    const ABI_NAMES: [&'static str; 32] = [
        "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3",
        "a4", "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11",
        "t3", "t4", "t5", "t6",
    ];

    /// Build a register from the low five bits of `v`.
    #[inline(always)]
    pub fn from_u32(v: u32) -> Self {
        Self::ALL[(v & 0x1F) as usize]
    }

    #[inline(always)]
    pub fn to_usize(self) -> usize {
        self as usize
    }

    pub fn abi_name(self) -> &'static str {
        Self::ABI_NAMES[self.to_usize()]
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.to_usize())
    }
}

/// Register-register and register-immediate ALU operations.
///
/// `Sub` only occurs in R-type encodings; there is no SUBI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AluOp {
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadWidth {
    Byte,
    Half,
    Word,
    ByteUnsigned,
    HalfUnsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreWidth {
    Byte,
    Half,
    Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

/// Why a word could not be mapped onto a supported instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unsupported {
    /// Bits 0-6 name no RV32I opcode.
    Opcode,
    /// Known opcode, but funct3/funct7 select nothing in RV32I.
    FunctionCode { funct3: u8, funct7: u8 },
}

/// A decoded RV32I instruction.
///
/// Immediates are fully assembled and sign-extended: `imm` is the byte
/// offset or operand value the instruction uses, never the raw bitfield.
/// U-type immediates already sit in bits 12..31.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Lui {
        rd: Register,
        imm: u32,
    },
    Auipc {
        rd: Register,
        imm: u32,
    },
    Jal {
        rd: Register,
        imm: i32,
    },
    Jalr {
        rd: Register,
        rs1: Register,
        imm: i32,
    },
    Branch {
        cond: BranchCond,
        rs1: Register,
        rs2: Register,
        imm: i32,
    },
    Load {
        width: LoadWidth,
        rd: Register,
        rs1: Register,
        imm: i32,
    },
    Store {
        width: StoreWidth,
        rs1: Register,
        rs2: Register,
        imm: i32,
    },
    /// I-type ALU (ADDI etc). For shifts only the low five bits of `imm`
    /// are the shift amount.
    OpImm {
        op: AluOp,
        rd: Register,
        rs1: Register,
        imm: i32,
    },
    /// R-type ALU
    Op {
        op: AluOp,
        rd: Register,
        rs1: Register,
        rs2: Register,
    },
    Fence,
    Ecall,
    Ebreak,
    Unknown {
        opcode: u8,
        reason: Unsupported,
    },
}

impl Op {
    /// Register written by this instruction, if any.
    pub fn destination(&self) -> Option<Register> {
        match *self {
            Op::Lui { rd, .. }
            | Op::Auipc { rd, .. }
            | Op::Jal { rd, .. }
            | Op::Jalr { rd, .. }
            | Op::Load { rd, .. }
            | Op::OpImm { rd, .. }
            | Op::Op { rd, .. } => Some(rd),
            _ => None,
        }
    }
}

/// Sign-extend the low `bits` bits of `value`.
#[inline(always)]
pub fn sext(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

#[inline(always)]
pub fn imm_i(insn: u32) -> i32 {
    (insn as i32) >> 20
}

/// S-type: imm[11:5] from bits 25..31, imm[4:0] from bits 7..11.
#[inline(always)]
pub fn imm_s(insn: u32) -> i32 {
    let val = ((insn >> 25) << 5) | ((insn >> 7) & 0x1F);
    sext(val, 12)
}

/// B-type: imm[12|10:5|4:1|11], bit 0 implicitly zero.
#[inline(always)]
pub fn imm_b(insn: u32) -> i32 {
    let bit31 = (insn >> 31) & 1;
    let bit30_25 = (insn >> 25) & 0x3F;
    let bit11_8 = (insn >> 8) & 0xF;
    let bit7 = (insn >> 7) & 1;
    let val = (bit31 << 12) | (bit7 << 11) | (bit30_25 << 5) | (bit11_8 << 1);
    sext(val, 13)
}

/// U-type: imm[31:12] in place, low 12 bits zero.
#[inline(always)]
pub fn imm_u(insn: u32) -> u32 {
    insn & 0xFFFF_F000
}

/// J-type: imm[20|10:1|11|19:12], bit 0 implicitly zero.
#[inline(always)]
pub fn imm_j(insn: u32) -> i32 {
    let bit31 = (insn >> 31) & 1;
    let bit30_21 = (insn >> 21) & 0x3FF;
    let bit20 = (insn >> 20) & 1;
    let bit19_12 = (insn >> 12) & 0xFF;
    let val = (bit31 << 20) | (bit19_12 << 12) | (bit20 << 11) | (bit30_21 << 1);
    sext(val, 21)
}

/// Decode a 32-bit instruction word.
///
/// Total and pure: every word maps to exactly one `Op`, with encodings
/// outside RV32I landing in `Op::Unknown`.
pub fn decode(insn: u32) -> Op {
    let opcode = (insn & 0x7F) as u8;
    let rd = Register::from_u32(insn >> 7);
    let funct3 = ((insn >> 12) & 0x7) as u8;
    let rs1 = Register::from_u32(insn >> 15);
    let rs2 = Register::from_u32(insn >> 20);
    let funct7 = ((insn >> 25) & 0x7F) as u8;

    let unsupported = Op::Unknown {
        opcode,
        reason: Unsupported::FunctionCode { funct3, funct7 },
    };

    match opcode {
        OPCODE_LUI => Op::Lui {
            rd,
            imm: imm_u(insn),
        },
        OPCODE_AUIPC => Op::Auipc {
            rd,
            imm: imm_u(insn),
        },
        OPCODE_JAL => Op::Jal {
            rd,
            imm: imm_j(insn),
        },
        OPCODE_JALR if funct3 == 0 => Op::Jalr {
            rd,
            rs1,
            imm: imm_i(insn),
        },
        OPCODE_BRANCH => {
            let cond = match funct3 {
                0 => BranchCond::Eq,
                1 => BranchCond::Ne,
                4 => BranchCond::Lt,
                5 => BranchCond::Ge,
                6 => BranchCond::Ltu,
                7 => BranchCond::Geu,
                _ => return unsupported,
            };
            Op::Branch {
                cond,
                rs1,
                rs2,
                imm: imm_b(insn),
            }
        }
        OPCODE_LOAD => {
            let width = match funct3 {
                0 => LoadWidth::Byte,
                1 => LoadWidth::Half,
                2 => LoadWidth::Word,
                4 => LoadWidth::ByteUnsigned,
                5 => LoadWidth::HalfUnsigned,
                _ => return unsupported,
            };
            Op::Load {
                width,
                rd,
                rs1,
                imm: imm_i(insn),
            }
        }
        OPCODE_STORE => {
            let width = match funct3 {
                0 => StoreWidth::Byte,
                1 => StoreWidth::Half,
                2 => StoreWidth::Word,
                _ => return unsupported,
            };
            Op::Store {
                width,
                rs1,
                rs2,
                imm: imm_s(insn),
            }
        }
        OPCODE_OP_IMM => {
            let op = match (funct3, funct7) {
                (0, _) => AluOp::Add,
                (2, _) => AluOp::Slt,
                (3, _) => AluOp::Sltu,
                (4, _) => AluOp::Xor,
                (6, _) => AluOp::Or,
                (7, _) => AluOp::And,
                (1, FUNCT7_PRIMARY) => AluOp::Sll,
                (5, FUNCT7_PRIMARY) => AluOp::Srl,
                (5, FUNCT7_ALT) => AluOp::Sra,
                _ => return unsupported,
            };
            Op::OpImm {
                op,
                rd,
                rs1,
                imm: imm_i(insn),
            }
        }
        OPCODE_OP => {
            let op = match (funct3, funct7) {
                (0, FUNCT7_PRIMARY) => AluOp::Add,
                (0, FUNCT7_ALT) => AluOp::Sub,
                (1, FUNCT7_PRIMARY) => AluOp::Sll,
                (2, FUNCT7_PRIMARY) => AluOp::Slt,
                (3, FUNCT7_PRIMARY) => AluOp::Sltu,
                (4, FUNCT7_PRIMARY) => AluOp::Xor,
                (5, FUNCT7_PRIMARY) => AluOp::Srl,
                (5, FUNCT7_ALT) => AluOp::Sra,
                (6, FUNCT7_PRIMARY) => AluOp::Or,
                (7, FUNCT7_PRIMARY) => AluOp::And,
                _ => return unsupported,
            };
            Op::Op { op, rd, rs1, rs2 }
        }
        OPCODE_MISC_MEM if funct3 == 0 => Op::Fence,
        OPCODE_SYSTEM if funct3 == 0 && rd == Register::X0 && rs1 == Register::X0 => {
            match insn >> 20 {
                0 => Op::Ecall,
                1 => Op::Ebreak,
                _ => unsupported,
            }
        }
        OPCODE_JALR | OPCODE_MISC_MEM | OPCODE_SYSTEM => unsupported,
        _ => Op::Unknown {
            opcode,
            reason: Unsupported::Opcode,
        },
    }
}
