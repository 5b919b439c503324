use crate::engine::decoder::Register;
use crate::snapshot::CpuSnapshot;

/// Architectural register state of a single RV32I hart.
///
/// `regs[0]` is never written, so `x0` reads as zero no matter what the
/// program does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpu {
    regs: [u32; 32],
    pub pc: u32,
    /// When set, misaligned halfword/word accesses and control transfers to
    /// non word-aligned targets trap instead of being masked.
    pub strict_alignment: bool,
}

impl Cpu {
    pub fn new(pc: u32) -> Self {
        Self {
            regs: [0; 32],
            pc,
            strict_alignment: false,
        }
    }

    #[inline(always)]
    pub fn read_reg(&self, reg: Register) -> u32 {
        if reg == Register::X0 {
            0
        } else {
            self.regs[reg.to_usize()]
        }
    }

    #[inline(always)]
    pub fn write_reg(&mut self, reg: Register, val: u32) {
        if reg != Register::X0 {
            self.regs[reg.to_usize()] = val;
        }
    }

    #[inline(always)]
    pub fn read_pc(&self) -> u32 {
        self.pc
    }

    #[inline(always)]
    pub fn write_pc(&mut self, val: u32) {
        self.pc = val;
    }

    /// Copy of all 32 registers followed by the pc.
    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            pc: self.pc,
            regs: self.regs,
        }
    }

    /// Restore registers and pc. The stored value for `x0` is ignored.
    pub fn restore(&mut self, snapshot: &CpuSnapshot) {
        self.regs = snapshot.regs;
        self.regs[0] = 0;
        self.pc = snapshot.pc;
    }

    /// Zero every register and move the pc to `pc`.
    pub fn reset(&mut self, pc: u32) {
        self.regs = [0; 32];
        self.pc = pc;
    }
}
