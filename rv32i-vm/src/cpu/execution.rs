use super::core::Cpu;
use super::types::{AccessKind, Fault, Trap};
use crate::engine::decoder::{self, AluOp, BranchCond, LoadWidth, Op, StoreWidth, Unsupported};
use crate::memory::Bus;
use serde::{Deserialize, Serialize};

/// Environment requests the core does not service itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvCall {
    Ecall,
    Ebreak,
}

/// Result of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The instruction completed and the pc points at its successor.
    Retired,
    /// ECALL/EBREAK. The pc still addresses the requesting instruction; the
    /// embedding environment decides whether and where execution resumes.
    Environment(EnvCall),
}

#[inline(always)]
fn alu(op: AluOp, a: u32, b: u32) -> u32 {
    let shamt = b & 0x1F;
    match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::Sub => a.wrapping_sub(b),
        AluOp::Sll => a << shamt,
        AluOp::Slt => ((a as i32) < (b as i32)) as u32,
        AluOp::Sltu => (a < b) as u32,
        AluOp::Xor => a ^ b,
        AluOp::Srl => a >> shamt,
        AluOp::Sra => ((a as i32) >> shamt) as u32,
        AluOp::Or => a | b,
        AluOp::And => a & b,
    }
}

impl Cpu {
    /// Fetch the word at `pc`, decode it and execute it.
    pub fn step(&mut self, bus: &mut dyn Bus) -> Result<Step, Fault> {
        let pc = self.pc;
        let word = bus.read32(pc);
        if self.strict_alignment && pc & 0x3 != 0 {
            return Err(Fault {
                pc,
                word,
                trap: Trap::UnalignedAccess {
                    addr: pc,
                    kind: AccessKind::Fetch,
                },
            });
        }
        let op = decoder::decode(word);
        self.execute(op, bus).map_err(|trap| Fault { pc, word, trap })
    }

    fn check_alignment(&self, addr: u32, mask: u32, kind: AccessKind) -> Result<(), Trap> {
        if self.strict_alignment && addr & mask != 0 {
            return Err(Trap::UnalignedAccess { addr, kind });
        }
        Ok(())
    }

    /// Apply a decoded instruction to this hart and `bus`.
    ///
    /// On success the pc has advanced exactly once: to `pc + 4`, to a taken
    /// branch or jump target, or (for ECALL/EBREAK) not at all. On error no
    /// register, memory or pc state has changed.
    pub fn execute(&mut self, op: Op, bus: &mut dyn Bus) -> Result<Step, Trap> {
        let pc = self.pc;
        let mut next_pc = pc.wrapping_add(4);

        match op {
            Op::Lui { rd, imm } => {
                self.write_reg(rd, imm);
            }
            Op::Auipc { rd, imm } => {
                self.write_reg(rd, pc.wrapping_add(imm));
            }
            Op::Jal { rd, imm } => {
                let target = pc.wrapping_add(imm as u32);
                self.check_alignment(target, 0x3, AccessKind::Fetch)?;
                self.write_reg(rd, next_pc);
                next_pc = target;
            }
            Op::Jalr { rd, rs1, imm } => {
                let target = self.read_reg(rs1).wrapping_add(imm as u32) & !1;
                self.check_alignment(target, 0x3, AccessKind::Fetch)?;
                self.write_reg(rd, next_pc);
                next_pc = target;
            }
            Op::Branch {
                cond,
                rs1,
                rs2,
                imm,
            } => {
                let val1 = self.read_reg(rs1);
                let val2 = self.read_reg(rs2);
                let taken = match cond {
                    BranchCond::Eq => val1 == val2,
                    BranchCond::Ne => val1 != val2,
                    BranchCond::Lt => (val1 as i32) < (val2 as i32),
                    BranchCond::Ge => (val1 as i32) >= (val2 as i32),
                    BranchCond::Ltu => val1 < val2,
                    BranchCond::Geu => val1 >= val2,
                };
                if taken {
                    let target = pc.wrapping_add(imm as u32);
                    self.check_alignment(target, 0x3, AccessKind::Fetch)?;
                    next_pc = target;
                }
            }
            Op::Load {
                width,
                rd,
                rs1,
                imm,
            } => {
                let addr = self.read_reg(rs1).wrapping_add(imm as u32);
                let val = match width {
                    LoadWidth::Byte | LoadWidth::ByteUnsigned => {
                        let byte = (bus.read32(addr) >> ((addr & 0x3) * 8)) as u8;
                        if width == LoadWidth::Byte {
                            byte as i8 as i32 as u32
                        } else {
                            byte as u32
                        }
                    }
                    LoadWidth::Half | LoadWidth::HalfUnsigned => {
                        self.check_alignment(addr, 0x1, AccessKind::Load)?;
                        let half = (bus.read32(addr) >> ((addr & 0x2) * 8)) as u16;
                        if width == LoadWidth::Half {
                            half as i16 as i32 as u32
                        } else {
                            half as u32
                        }
                    }
                    LoadWidth::Word => {
                        self.check_alignment(addr, 0x3, AccessKind::Load)?;
                        bus.read32(addr)
                    }
                };
                self.write_reg(rd, val);
            }
            Op::Store {
                width,
                rs1,
                rs2,
                imm,
            } => {
                let addr = self.read_reg(rs1).wrapping_add(imm as u32);
                let val = self.read_reg(rs2);
                // Sub-word stores merge into the containing aligned word.
                let (lane_mask, shift) = match width {
                    StoreWidth::Byte => (0xFF, (addr & 0x3) * 8),
                    StoreWidth::Half => {
                        self.check_alignment(addr, 0x1, AccessKind::Store)?;
                        (0xFFFF, (addr & 0x2) * 8)
                    }
                    StoreWidth::Word => {
                        self.check_alignment(addr, 0x3, AccessKind::Store)?;
                        (0xFFFF_FFFF, 0)
                    }
                };
                let merged = if lane_mask == 0xFFFF_FFFF {
                    val
                } else {
                    let old = bus.read32(addr);
                    (old & !(lane_mask << shift)) | ((val & lane_mask) << shift)
                };
                bus.write32(addr, merged);
            }
            Op::OpImm { op, rd, rs1, imm } => {
                let res = alu(op, self.read_reg(rs1), imm as u32);
                self.write_reg(rd, res);
            }
            Op::Op { op, rd, rs1, rs2 } => {
                let res = alu(op, self.read_reg(rs1), self.read_reg(rs2));
                self.write_reg(rd, res);
            }
            // Single hart, in-order: memory is always coherent.
            Op::Fence => {}
            Op::Ecall => return Ok(Step::Environment(EnvCall::Ecall)),
            Op::Ebreak => return Ok(Step::Environment(EnvCall::Ebreak)),
            Op::Unknown { opcode, reason } => {
                return Err(match reason {
                    Unsupported::Opcode => Trap::UnknownOpcode { opcode },
                    Unsupported::FunctionCode { funct3, funct7 } => Trap::UnknownFunctionCode {
                        opcode,
                        funct3,
                        funct7,
                    },
                });
            }
        }

        self.pc = next_pc;
        Ok(Step::Retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::decoder::Register;
    use crate::memory::Memory;

    // --- Test helpers ----------------------------------------------------

    fn encode_i(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (((imm as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn encode_r(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32) -> u32 {
        (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | 0x33
    }

    fn encode_s(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
        let imm = imm as u32;
        let imm11_5 = (imm >> 5) & 0x7F;
        let imm4_0 = imm & 0x1F;
        (imm11_5 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (imm4_0 << 7) | 0x23
    }

    fn encode_b(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
        let imm = imm as u32;
        let imm12 = (imm >> 12) & 0x1;
        let imm10_5 = (imm >> 5) & 0x3F;
        let imm4_1 = (imm >> 1) & 0xF;
        let imm11 = (imm >> 11) & 0x1;
        (imm12 << 31)
            | (imm10_5 << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (funct3 << 12)
            | (imm4_1 << 8)
            | (imm11 << 7)
            | 0x63
    }

    fn encode_j(imm: i32, rd: u32) -> u32 {
        let imm20 = ((imm >> 20) & 0x1) as u32;
        let imm10_1 = ((imm >> 1) & 0x3FF) as u32;
        let imm11 = ((imm >> 11) & 0x1) as u32;
        let imm19_12 = ((imm >> 12) & 0xFF) as u32;
        (imm20 << 31) | (imm10_1 << 21) | (imm11 << 20) | (imm19_12 << 12) | (rd << 7) | 0x6F
    }

    fn encode_u(imm: u32, rd: u32, opcode: u32) -> u32 {
        (imm & 0xFFFF_F000) | (rd << 7) | opcode
    }

    fn run_one(cpu: &mut Cpu, mem: &mut Memory, insn: u32) -> Result<Step, Fault> {
        mem.write_word(cpu.pc, insn);
        cpu.step(mem)
    }

    #[test]
    fn test_addi_negative() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);

        run_one(&mut cpu, &mut mem, 0xfe01_0113).unwrap();
        assert_eq!(cpu.read_reg(Register::X2), 0xFFFF_FFE0);
        assert_eq!(cpu.read_reg(Register::X2) as i32, -32);
        assert_eq!(cpu.pc, 4);
    }

    #[test]
    fn test_lui_auipc() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0x1000);

        // LUI x2, 0x12345
        let lui = encode_u(0x1234_5000, 2, 0x37);
        assert_eq!(lui, 0x1234_5137);
        run_one(&mut cpu, &mut mem, lui).unwrap();
        assert_eq!(cpu.read_reg(Register::X2), 0x1234_5000);
        assert_eq!(cpu.pc, 0x1004);

        // AUIPC x3, 0xFFFFF -> pc - 0x1000
        run_one(&mut cpu, &mut mem, encode_u(0xFFFF_F000, 3, 0x17)).unwrap();
        assert_eq!(cpu.read_reg(Register::X3), 0x0000_0004);
        assert_eq!(cpu.pc, 0x1008);
    }

    #[test]
    fn test_r_type_alu() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);
        cpu.write_reg(Register::X1, 0x8000_0010);
        cpu.write_reg(Register::X2, 0x0000_0024); // shift amount uses low 5 bits -> 4

        let cases = [
            (encode_r(0x00, 2, 1, 0, 3), 0x8000_0034), // add
            (encode_r(0x20, 2, 1, 0, 3), 0x7FFF_FFEC), // sub
            (encode_r(0x00, 2, 1, 1, 3), 0x0000_0100), // sll
            (encode_r(0x00, 2, 1, 2, 3), 1),           // slt (negative < positive)
            (encode_r(0x00, 2, 1, 3, 3), 0),           // sltu
            (encode_r(0x00, 2, 1, 4, 3), 0x8000_0034), // xor
            (encode_r(0x00, 2, 1, 5, 3), 0x0800_0001), // srl
            (encode_r(0x20, 2, 1, 5, 3), 0xF800_0001), // sra
            (encode_r(0x00, 2, 1, 6, 3), 0x8000_0034), // or
            (encode_r(0x00, 2, 1, 7, 3), 0x0000_0000), // and
        ];
        for (insn, expected) in cases {
            let pc = cpu.pc;
            run_one(&mut cpu, &mut mem, insn).unwrap();
            assert_eq!(cpu.read_reg(Register::X3), expected, "insn {:#010x}", insn);
            assert_eq!(cpu.pc, pc + 4);
        }
    }

    #[test]
    fn test_i_type_alu() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);
        cpu.write_reg(Register::X1, 0xFFFF_FF00);

        let srai = encode_i(0x400 | 4, 1, 5, 3, 0x13);
        let cases = [
            (encode_i(0x10, 1, 0, 3, 0x13), 0xFFFF_FF10), // addi
            (encode_i(-1, 1, 2, 3, 0x13), 1),             // slti: -256 < -1
            (encode_i(-1, 1, 3, 3, 0x13), 1),             // sltiu: imm becomes 0xFFFFFFFF
            (encode_i(1, 1, 3, 3, 0x13), 0),              // sltiu
            (encode_i(-1, 1, 4, 3, 0x13), 0x0000_00FF),   // xori
            (encode_i(0x0F, 1, 6, 3, 0x13), 0xFFFF_FF0F), // ori
            (encode_i(0x7F0, 1, 7, 3, 0x13), 0x0000_0700), // andi
            (encode_i(4, 1, 1, 3, 0x13), 0xFFFF_F000),    // slli
            (encode_i(4, 1, 5, 3, 0x13), 0x0FFF_FFF0),    // srli
            (srai, 0xFFFF_FFF0),                          // srai
        ];
        for (insn, expected) in cases {
            run_one(&mut cpu, &mut mem, insn).unwrap();
            assert_eq!(cpu.read_reg(Register::X3), expected, "insn {:#010x}", insn);
        }
    }

    #[test]
    fn test_x0_stays_zero() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);
        mem.write_word(0x100, 0xDEAD_BEEF);
        cpu.write_reg(Register::X2, 0x100);

        // ADDI x0, x0, 5 ; LW x0, 0(x2) ; LUI x0, 1 ; JAL x0, 4
        for insn in [
            encode_i(5, 0, 0, 0, 0x13),
            encode_i(0, 2, 2, 0, 0x03),
            encode_u(0x1000, 0, 0x37),
            encode_j(4, 0),
        ] {
            assert_eq!(decoder::decode(insn).destination(), Some(Register::X0));
            run_one(&mut cpu, &mut mem, insn).unwrap();
            assert_eq!(cpu.read_reg(Register::X0), 0);
        }
    }

    #[test]
    fn test_load_sign_and_zero_extension() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);
        mem.write_word(0x200, 0x80FF_7F81);
        cpu.write_reg(Register::X1, 0x200);

        let cases = [
            (encode_i(0, 1, 0, 2, 0x03), 0xFFFF_FF81), // lb byte 0
            (encode_i(1, 1, 0, 2, 0x03), 0x0000_007F), // lb byte 1
            (encode_i(3, 1, 0, 2, 0x03), 0xFFFF_FF80), // lb byte 3
            (encode_i(2, 1, 4, 2, 0x03), 0x0000_00FF), // lbu byte 2
            (encode_i(0, 1, 1, 2, 0x03), 0x0000_7F81), // lh low half
            (encode_i(2, 1, 1, 2, 0x03), 0xFFFF_80FF), // lh high half
            (encode_i(2, 1, 5, 2, 0x03), 0x0000_80FF), // lhu high half
            (encode_i(0, 1, 2, 2, 0x03), 0x80FF_7F81), // lw
        ];
        for (insn, expected) in cases {
            run_one(&mut cpu, &mut mem, insn).unwrap();
            assert_eq!(cpu.read_reg(Register::X2), expected, "insn {:#010x}", insn);
        }
    }

    #[test]
    fn test_load_negative_offset() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);
        mem.write_word(0x3FC, 0x1234_5678);
        cpu.write_reg(Register::X1, 0x400);

        run_one(&mut cpu, &mut mem, encode_i(-4, 1, 2, 2, 0x03)).unwrap();
        assert_eq!(cpu.read_reg(Register::X2), 0x1234_5678);
    }

    #[test]
    fn test_store_lanes_preserve_neighbours() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);
        mem.write_word(0x300, 0x1122_3344);
        cpu.write_reg(Register::X1, 0x300);
        cpu.write_reg(Register::X2, 0xAABB_CCDD);

        // sb x2, 1(x1)
        run_one(&mut cpu, &mut mem, encode_s(1, 2, 1, 0)).unwrap();
        assert_eq!(mem.read_word(0x300), 0x1122_DD44);

        // sh x2, 2(x1)
        run_one(&mut cpu, &mut mem, encode_s(2, 2, 1, 1)).unwrap();
        assert_eq!(mem.read_word(0x300), 0xCCDD_DD44);

        // sb x2, 0(x1); lbu x3, 0(x1)
        run_one(&mut cpu, &mut mem, encode_s(0, 2, 1, 0)).unwrap();
        run_one(&mut cpu, &mut mem, encode_i(0, 1, 4, 3, 0x03)).unwrap();
        assert_eq!(cpu.read_reg(Register::X3), 0xDD);
        assert_eq!(mem.read_word(0x300), 0xCCDD_DDDD);

        // sw x2, 0(x1)
        run_one(&mut cpu, &mut mem, encode_s(0, 2, 1, 2)).unwrap();
        assert_eq!(mem.read_word(0x300), 0xAABB_CCDD);
    }

    #[test]
    fn test_store_then_load_half_round_trip() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);
        cpu.write_reg(Register::X1, 0x500);
        cpu.write_reg(Register::X2, 0x0000_8001);

        // sh x2, 2(x1); lh x3, 2(x1); lhu x4, 2(x1); lhu x5, 0(x1)
        run_one(&mut cpu, &mut mem, encode_s(2, 2, 1, 1)).unwrap();
        run_one(&mut cpu, &mut mem, encode_i(2, 1, 1, 3, 0x03)).unwrap();
        run_one(&mut cpu, &mut mem, encode_i(2, 1, 5, 4, 0x03)).unwrap();
        run_one(&mut cpu, &mut mem, encode_i(0, 1, 5, 5, 0x03)).unwrap();
        assert_eq!(cpu.read_reg(Register::X3), 0xFFFF_8001);
        assert_eq!(cpu.read_reg(Register::X4), 0x8001);
        assert_eq!(cpu.read_reg(Register::X5), 0);
    }

    #[test]
    fn test_branch_taken_and_not_taken() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0x100);

        // BEQ x1, x2, +8
        let beq = encode_b(8, 2, 1, 0);
        mem.write_word(0x100, beq);

        cpu.write_reg(Register::X1, 5);
        cpu.write_reg(Register::X2, 5);
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.pc, 0x108);

        cpu.write_reg(Register::X1, 1);
        cpu.pc = 0x100;
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.pc, 0x104);
    }

    #[test]
    fn test_branch_conditions_signedness() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0x100);
        cpu.write_reg(Register::X1, 0xFFFF_FFFF); // -1 signed, max unsigned
        cpu.write_reg(Register::X2, 1);

        // (funct3, taken?) for rs1=x1, rs2=x2
        let cases = [
            (0, false), // beq
            (1, true),  // bne
            (4, true),  // blt: -1 < 1
            (5, false), // bge
            (6, false), // bltu: 0xFFFFFFFF < 1
            (7, true),  // bgeu
        ];
        for (funct3, taken) in cases {
            cpu.pc = 0x100;
            run_one(&mut cpu, &mut mem, encode_b(-8, 2, 1, funct3)).unwrap();
            let expected = if taken { 0xF8 } else { 0x104 };
            assert_eq!(cpu.pc, expected, "funct3 {}", funct3);
        }
    }

    #[test]
    fn test_jal() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0x8000_0000);

        // JAL x1, 8
        let jal_insn = (4 << 21) | (1 << 7) | 0x6F;
        run_one(&mut cpu, &mut mem, jal_insn).unwrap();
        assert_eq!(cpu.read_reg(Register::X1), 0x8000_0004);
        assert_eq!(cpu.pc, 0x8000_0008);

        // JAL x1, -0x800
        run_one(&mut cpu, &mut mem, encode_j(-0x800, 1)).unwrap();
        assert_eq!(cpu.read_reg(Register::X1), 0x8000_000C);
        assert_eq!(cpu.pc, 0x7FFF_F808);
    }

    #[test]
    fn test_jalr_clears_bit_zero() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0x40);
        cpu.write_reg(Register::X5, 0x1000);

        // JALR x1, 3(x5) -> target 0x1003 & !1 = 0x1002
        run_one(&mut cpu, &mut mem, encode_i(3, 5, 0, 1, 0x67)).unwrap();
        assert_eq!(cpu.read_reg(Register::X1), 0x44);
        assert_eq!(cpu.pc, 0x1002);
    }

    #[test]
    fn test_jalr_same_source_and_destination() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0x40);
        cpu.write_reg(Register::X1, 0x2000);

        // JALR x1, 0(x1): target computed from the old x1
        run_one(&mut cpu, &mut mem, encode_i(0, 1, 0, 1, 0x67)).unwrap();
        assert_eq!(cpu.pc, 0x2000);
        assert_eq!(cpu.read_reg(Register::X1), 0x44);
    }

    #[test]
    fn test_fence_and_environment_calls() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);

        assert_eq!(run_one(&mut cpu, &mut mem, 0x0FF0_000F), Ok(Step::Retired));
        assert_eq!(cpu.pc, 4);

        assert_eq!(
            run_one(&mut cpu, &mut mem, 0x0000_0073),
            Ok(Step::Environment(EnvCall::Ecall))
        );
        assert_eq!(cpu.pc, 4);
        assert_eq!(
            run_one(&mut cpu, &mut mem, 0x0010_0073),
            Ok(Step::Environment(EnvCall::Ebreak))
        );
        assert_eq!(cpu.pc, 4);
    }

    #[test]
    fn test_unknown_opcode_leaves_state_untouched() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0x80);
        cpu.write_reg(Register::X7, 7);
        mem.write_word(0x80, 0xFFFF_FFFF);
        let regs_before = cpu.snapshot();
        let mem_before = mem.clone();

        let fault = cpu.step(&mut mem).unwrap_err();
        assert_eq!(fault.pc, 0x80);
        assert_eq!(fault.word, 0xFFFF_FFFF);
        assert_eq!(fault.trap, Trap::UnknownOpcode { opcode: 0x7F });
        assert_eq!(cpu.snapshot(), regs_before);
        assert_eq!(mem, mem_before);
    }

    #[test]
    fn test_unknown_function_code() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);

        // mul x3, x1, x2
        let fault = run_one(&mut cpu, &mut mem, encode_r(0x01, 2, 1, 0, 3)).unwrap_err();
        assert_eq!(
            fault.trap,
            Trap::UnknownFunctionCode {
                opcode: 0x33,
                funct3: 0,
                funct7: 1
            }
        );
        assert_eq!(cpu.pc, 0);
    }

    #[test]
    fn test_lenient_alignment_masks_addresses() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);
        mem.write_word(0x100, 0xCAFE_BABE);
        cpu.write_reg(Register::X1, 0x103);

        // lw x2, 0(x1) reads the containing word
        run_one(&mut cpu, &mut mem, encode_i(0, 1, 2, 2, 0x03)).unwrap();
        assert_eq!(cpu.read_reg(Register::X2), 0xCAFE_BABE);

        // lhu x2, 0(x1) picks the upper lane (address bit 1)
        run_one(&mut cpu, &mut mem, encode_i(0, 1, 5, 2, 0x03)).unwrap();
        assert_eq!(cpu.read_reg(Register::X2), 0xCAFE);
    }

    #[test]
    fn test_strict_alignment_traps_without_side_effects() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);
        cpu.strict_alignment = true;
        cpu.write_reg(Register::X1, 0x102);
        cpu.write_reg(Register::X2, 0xFFFF_FFFF);

        // lw x3, 0(x1)
        let fault = run_one(&mut cpu, &mut mem, encode_i(0, 1, 2, 3, 0x03)).unwrap_err();
        assert_eq!(
            fault.trap,
            Trap::UnalignedAccess {
                addr: 0x102,
                kind: AccessKind::Load
            }
        );
        assert_eq!(cpu.read_reg(Register::X3), 0);
        assert_eq!(cpu.pc, 0);

        // sh x2, 1(x1) -> 0x103
        let fault = run_one(&mut cpu, &mut mem, encode_s(1, 2, 1, 1)).unwrap_err();
        assert_eq!(
            fault.trap,
            Trap::UnalignedAccess {
                addr: 0x103,
                kind: AccessKind::Store
            }
        );
        assert_eq!(mem.read_word(0x100), 0);

        // sh x2, 0(x1) is halfword aligned and fine
        run_one(&mut cpu, &mut mem, encode_s(0, 2, 1, 1)).unwrap();
        assert_eq!(mem.read_word(0x100), 0xFFFF_0000);

        // jal x1, 2 -> misaligned target, link register untouched
        let fault = run_one(&mut cpu, &mut mem, encode_j(2, 1)).unwrap_err();
        assert_eq!(fault.trap.to_string(), "unaligned fetch access at 0x00000006");
        assert_eq!(cpu.read_reg(Register::X1), 0x102);
    }

    #[test]
    fn test_strict_alignment_jalr_and_branch_targets() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0x200);
        cpu.strict_alignment = true;
        cpu.write_reg(Register::X1, 0x303);
        cpu.write_reg(Register::X5, 0x55);

        // jalr x5, 0(x1): bit 0 cleared gives 0x302, still misaligned
        let fault = run_one(&mut cpu, &mut mem, encode_i(0, 1, 0, 5, 0x67)).unwrap_err();
        assert_eq!(
            fault.trap,
            Trap::UnalignedAccess {
                addr: 0x302,
                kind: AccessKind::Fetch
            }
        );
        assert_eq!(fault.pc, 0x200);
        assert_eq!(cpu.read_reg(Register::X5), 0x55);
        assert_eq!(cpu.pc, 0x200);

        // beq x0, x0, 2 is taken to pc+2
        let fault = run_one(&mut cpu, &mut mem, encode_b(2, 0, 0, 0)).unwrap_err();
        assert_eq!(
            fault.trap,
            Trap::UnalignedAccess {
                addr: 0x202,
                kind: AccessKind::Fetch
            }
        );
        assert_eq!(cpu.pc, 0x200);

        // bne x0, x0, 2 is not taken, so the odd offset never matters
        assert_eq!(
            run_one(&mut cpu, &mut mem, encode_b(2, 0, 0, 1)).unwrap(),
            Step::Retired
        );
        assert_eq!(cpu.pc, 0x204);
    }

    #[test]
    fn test_strict_alignment_misaligned_fetch() {
        let mut mem = Memory::new();
        mem.write_word(0x100, encode_i(1, 0, 0, 1, 0x13));

        let mut cpu = Cpu::new(0x102);
        cpu.strict_alignment = true;
        let fault = cpu.step(&mut mem).unwrap_err();
        assert_eq!(fault.pc, 0x102);
        assert_eq!(
            fault.trap,
            Trap::UnalignedAccess {
                addr: 0x102,
                kind: AccessKind::Fetch
            }
        );
        assert_eq!(cpu.read_reg(Register::X1), 0);
        assert_eq!(cpu.pc, 0x102);

        // Lenient mode executes the containing word.
        cpu.strict_alignment = false;
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.read_reg(Register::X1), 1);
        assert_eq!(cpu.pc, 0x106);
    }

    #[test]
    fn test_smoke_sum() {
        let mut mem = Memory::new();
        let mut cpu = Cpu::new(0);

        let data: [u32; 5] = [1, 2, 3, 4, 5];
        for (i, val) in data.iter().enumerate() {
            mem.write_word(0x100 + (i * 4) as u32, *val);
        }

        let prog = [
            0x10000093, // addi x1, x0, 0x100 -> Base
            0x00500113, // addi x2, x0, 5 -> Count
            0x00000193, // addi x3, x0, 0 -> Sum
            // loop:
            0x0000A203, // lw x4, 0(x1)
            0x004181B3, // add x3, x3, x4
            0x00408093, // addi x1, x1, 4
            0xFFF10113, // addi x2, x2, -1
            0xFE0118E3, // bne x2, x0, loop (-16)
            0x00100073, // ebreak
        ];
        for (i, val) in prog.iter().enumerate() {
            mem.write_word((i * 4) as u32, *val);
        }

        let mut steps = 0;
        loop {
            steps += 1;
            assert!(steps < 1000, "Infinite loop");
            match cpu.step(&mut mem) {
                Ok(Step::Retired) => {}
                Ok(Step::Environment(EnvCall::Ebreak)) => break,
                other => panic!("Unexpected result at pc 0x{:x}: {:?}", cpu.pc, other),
            }
        }

        assert_eq!(cpu.read_reg(Register::X3), 15);
        assert_eq!(cpu.pc, 0x20);
    }
}
