//! The fetch/decode/dispatch engine.
//!
//! A tight interpreter loop: fetch one parcel, widen compressed
//! encodings, execute, advance the PC by the instruction width unless
//! the instruction wrote it, and charge the instruction budget.
//! `ECALL` and `EBREAK` cross into the system call dispatch table;
//! everything else that goes wrong raises a [`MachineException`].

use crate::address::Address;
use crate::machine::{Machine, MachineException};
use crate::syscalls::SYSCALL_EBREAK;

/// The base integer ALU, shared by OP and OP-IMM. `alt` is the
/// funct7 bit 30 flavor (SUB/SRA). Returns `None` for encodings the
/// base ISA does not define.
fn alu_op<A: Address>(alt: bool, op: u32, a: A, b: A) -> Option<A> {
    Some(match op {
        0b000 => {
            if alt {
                a.wrapping_sub(b)
            } else {
                a.wrapping_add(b)
            }
        }
        0b001 => {
            if alt {
                return None;
            }
            a.shl(b.to_u32())
        }
        0b010 => {
            if alt {
                return None;
            }
            if a.lt_signed(b) {
                A::from_u32(1)
            } else {
                A::ZERO
            }
        }
        0b011 => {
            if alt {
                return None;
            }
            if a < b {
                A::from_u32(1)
            } else {
                A::ZERO
            }
        }
        0b100 => {
            if alt {
                return None;
            }
            a ^ b
        }
        0b101 => {
            if alt {
                a.sar(b.to_u32())
            } else {
                a.shr(b.to_u32())
            }
        }
        0b110 => {
            if alt {
                return None;
            }
            a | b
        }
        0b111 => {
            if alt {
                return None;
            }
            a & b
        }
        _ => return None,
    })
}

/// The M extension on the register form of OP.
fn mul_op<A: Address>(op: u32, a: A, b: A) -> A {
    match op {
        0b000 => a.wrapping_mul(b),
        0b001 => a.mulh(b),
        0b010 => a.mulhsu(b),
        0b011 => a.mulhu(b),
        0b100 => a.div_signed(b),
        0b101 => a.div_unsigned(b),
        0b110 => a.rem_signed(b),
        _ => a.rem_unsigned(b),
    }
}

/// Word-sized AMO arithmetic. `None` for undefined funct5 values.
fn amo_op32(funct5: u32, a: u32, b: u32) -> Option<u32> {
    Some(match funct5 {
        0b00001 => b,
        0b00000 => a.wrapping_add(b),
        0b00100 => a ^ b,
        0b01100 => a & b,
        0b01000 => a | b,
        0b10000 => {
            if (a as i32) < (b as i32) {
                a
            } else {
                b
            }
        }
        0b10100 => {
            if (a as i32) > (b as i32) {
                a
            } else {
                b
            }
        }
        0b11000 => a.min(b),
        0b11100 => a.max(b),
        _ => return None,
    })
}

fn amo_op64(funct5: u32, a: u64, b: u64) -> Option<u64> {
    Some(match funct5 {
        0b00001 => b,
        0b00000 => a.wrapping_add(b),
        0b00100 => a ^ b,
        0b01100 => a & b,
        0b01000 => a | b,
        0b10000 => {
            if (a as i64) < (b as i64) {
                a
            } else {
                b
            }
        }
        0b10100 => {
            if (a as i64) > (b as i64) {
                a
            } else {
                b
            }
        }
        0b11000 => a.min(b),
        0b11100 => a.max(b),
        _ => return None,
    })
}

impl<A: Address> Machine<A> {
    /// Run the guest until `max_instructions` more instructions have
    /// retired, [`Machine::stop`] zeroes the budget, or an exception
    /// surfaces. Budget exhaustion is not an error: the call returns
    /// `Ok` and a later `simulate` resumes where this one stopped.
    /// Passing `u64::MAX` runs without a budget.
    pub fn simulate(
        &mut self,
        max_instructions: u64,
    ) -> Result<(), MachineException> {
        if max_instructions == u64::MAX {
            self.cpu.set_max_instructions(u64::MAX);
        } else {
            self.cpu.set_max_instructions(
                self.cpu
                    .instruction_counter()
                    .saturating_add(max_instructions),
            );
        }
        while self.cpu.instruction_counter() < self.cpu.max_instructions() {
            self.step()?;
            self.cpu.increment_counter(1);
        }
        Ok(())
    }

    /// Execute one instruction while preserving the budget that was in
    /// effect, unless the machine stopped during the step.
    pub fn step_one(&mut self) -> Result<(), MachineException> {
        let old_max = self.cpu.max_instructions();
        let result = self.simulate(1);
        if self.cpu.max_instructions() != 0 {
            self.cpu.set_max_instructions(old_max);
        }
        result
    }

    fn step(&mut self) -> Result<(), MachineException> {
        let pc = self.cpu.pc();
        let low = self.memory.exec_read_u16(pc)?;
        if low & 0b11 == 0b11 {
            // A 32-bit instruction may straddle a page boundary when
            // the C extension allows half-aligned PCs.
            let high =
                self.memory.exec_read_u16(pc.wrapping_add(A::from_u32(2)))?;
            let instruction = (low as u32) | ((high as u32) << 16);
            self.execute(instruction, 4)
        } else {
            #[cfg(feature = "C")]
            {
                let instruction =
                    crate::compressed::expand::<A>(low, pc.to_u64())?;
                self.execute(instruction, 2)
            }
            #[cfg(not(feature = "C"))]
            {
                Err(MachineException::IllegalOpcode {
                    pc: pc.to_u64(),
                    bits: low as u32,
                })
            }
        }
    }

    /// Check a branch or jump target against the current instruction
    /// alignment.
    fn check_jump_target(
        &self,
        this_pc: A,
        target: A,
    ) -> Result<(), MachineException> {
        let align: u64 = if cfg!(feature = "C") { 0b1 } else { 0b11 };
        if target.to_u64() & align != 0 {
            return Err(MachineException::MisalignedInstruction {
                pc: this_pc.to_u64(),
                target: target.to_u64(),
            });
        }
        Ok(())
    }

    fn execute(
        &mut self,
        instruction: u32,
        length: u32,
    ) -> Result<(), MachineException> {
        let this_pc = self.cpu.pc();
        let mut next_pc = this_pc.wrapping_add(A::from_u32(length));
        let opcode = (instruction >> 2) & 0b11111;
        let illegal = MachineException::IllegalOpcode {
            pc: this_pc.to_u64(),
            bits: instruction,
        };
        // Lexically scoped field extractors, so each is written once
        // but only evaluated by the arms that use it.
        macro_rules! funct3 {
            () => {
                (instruction >> 12) & 0b111
            };
        }
        macro_rules! funct7 {
            () => {
                (instruction >> 25) & 0b1111111
            };
        }
        macro_rules! rd {
            () => {
                ((instruction >> 7) & 0b11111) as usize
            };
        }
        macro_rules! rs1 {
            () => {
                ((instruction >> 15) & 0b11111) as usize
            };
        }
        macro_rules! rs2 {
            () => {
                ((instruction >> 20) & 0b11111) as usize
            };
        }
        macro_rules! imm_i {
            () => {
                ((instruction as i32) >> 20) as i64
            };
        }
        macro_rules! imm_s {
            () => {
                ((((instruction as i32) >> 20) & !0b11111)
                    | (((instruction >> 7) & 0b11111) as i32))
                    as i64
            };
        }
        macro_rules! imm_u {
            () => {
                (instruction & 0xFFFF_F000) as i32 as i64
            };
        }
        macro_rules! imm_b {
            () => {{
                let imm_4_1 = (instruction >> 8) & 0b1111;
                let imm_10_5 = (instruction >> 25) & 0b111111;
                let imm_11 = (instruction >> 7) & 0b1;
                let imm_12 = (instruction as i32) >> 31;
                (((imm_4_1 << 1) | (imm_10_5 << 5) | (imm_11 << 11)) as i64)
                    | ((imm_12 as i64) << 12)
            }};
        }
        macro_rules! imm_j {
            () => {{
                let imm_10_1 = (instruction >> 21) & 0b11_1111_1111;
                let imm_11 = (instruction >> 20) & 0b1;
                let imm_19_12 = (instruction >> 12) & 0b1111_1111;
                let imm_20 = (instruction as i32) >> 31;
                (((imm_10_1 << 1) | (imm_11 << 11) | (imm_19_12 << 12))
                    as i64)
                    | ((imm_20 as i64) << 20)
            }};
        }

        match opcode {
            0b00000 => {
                // LOAD
                let base = self.cpu.reg(rs1!());
                let address = base.wrapping_add(A::from_i64(imm_i!()));
                let value = match funct3!() {
                    0b000 => {
                        A::from_i64(self.memory.read::<u8>(address)? as i8 as i64)
                    }
                    0b001 => A::from_i64(
                        self.memory.read::<u16>(address)? as i16 as i64,
                    ),
                    0b010 => A::from_i64(
                        self.memory.read::<u32>(address)? as i32 as i64,
                    ),
                    0b011 if A::XLEN >= 64 => {
                        A::from_u64(self.memory.read::<u64>(address)?)
                    }
                    0b100 => {
                        A::from_u32(self.memory.read::<u8>(address)? as u32)
                    }
                    0b101 => {
                        A::from_u32(self.memory.read::<u16>(address)? as u32)
                    }
                    0b110 if A::XLEN >= 64 => {
                        A::from_u64(self.memory.read::<u32>(address)? as u64)
                    }
                    // RV128 LDU is recognized at that width but not
                    // implemented by this decoder.
                    0b111 if A::XLEN >= 128 => {
                        return Err(MachineException::UnimplementedInstruction {
                            pc: this_pc.to_u64(),
                            bits: instruction,
                        })
                    }
                    _ => return Err(illegal),
                };
                self.cpu.set_reg(rd!(), value);
            }
            #[cfg(feature = "float")]
            0b00001 => {
                // LOAD-FP
                self.execute_load_fp(instruction, this_pc)?;
            }
            0b00011 => {
                // MISC-MEM: FENCE and FENCE.I. With one hart and no
                // decode cache there is nothing to order or flush.
                match funct3!() {
                    0b000 | 0b001 => (),
                    // RV128 LQ lives in this opcode.
                    0b010 if A::XLEN >= 128 => {
                        return Err(MachineException::UnimplementedInstruction {
                            pc: this_pc.to_u64(),
                            bits: instruction,
                        })
                    }
                    _ => return Err(illegal),
                }
            }
            0b00100 => {
                // OP-IMM
                let a = self.cpu.reg(rs1!());
                let imm = A::from_i64(imm_i!());
                let value = match funct3!() {
                    0b001 => {
                        let shamt = (instruction >> 20) & 0b111111;
                        if (instruction >> 26) != 0
                            || (A::XLEN == 32 && shamt >= 32)
                        {
                            return Err(MachineException::IllegalOperation {
                                pc: this_pc.to_u64(),
                                bits: instruction,
                            });
                        }
                        a.shl(shamt)
                    }
                    0b101 => {
                        let shamt = (instruction >> 20) & 0b111111;
                        if A::XLEN == 32 && shamt >= 32 {
                            return Err(MachineException::IllegalOperation {
                                pc: this_pc.to_u64(),
                                bits: instruction,
                            });
                        }
                        match instruction >> 26 {
                            0b000000 => a.shr(shamt),
                            0b010000 => a.sar(shamt),
                            _ => return Err(illegal),
                        }
                    }
                    op => match alu_op(false, op, a, imm) {
                        Some(value) => value,
                        None => return Err(illegal),
                    },
                };
                self.cpu.set_reg(rd!(), value);
            }
            0b00101 => {
                // AUIPC
                self.cpu.set_reg(
                    rd!(),
                    this_pc.wrapping_add(A::from_i64(imm_u!())),
                );
            }
            0b00110 => {
                // OP-IMM-32 (RV64 word forms, sign-extended results)
                if A::XLEN < 64 {
                    return Err(illegal);
                }
                let a = self.cpu.reg(rs1!()).to_u32();
                let value = match funct3!() {
                    0b000 => a.wrapping_add(imm_i!() as u32) as i32,
                    0b001 => {
                        if funct7!() != 0 {
                            return Err(illegal);
                        }
                        (a << ((instruction >> 20) & 0b11111)) as i32
                    }
                    0b101 => {
                        let shamt = (instruction >> 20) & 0b11111;
                        match funct7!() {
                            0b0000000 => (a >> shamt) as i32,
                            0b0100000 => (a as i32) >> shamt,
                            _ => return Err(illegal),
                        }
                    }
                    _ => return Err(illegal),
                };
                self.cpu.set_reg(rd!(), A::from_i64(value as i64));
            }
            0b01000 => {
                // STORE
                let base = self.cpu.reg(rs1!());
                let address = base.wrapping_add(A::from_i64(imm_s!()));
                let value = self.cpu.reg(rs2!());
                match funct3!() {
                    0b000 => {
                        self.memory.write::<u8>(address, value.to_u64() as u8)?
                    }
                    0b001 => self
                        .memory
                        .write::<u16>(address, value.to_u64() as u16)?,
                    0b010 => {
                        self.memory.write::<u32>(address, value.to_u32())?
                    }
                    0b011 if A::XLEN >= 64 => {
                        self.memory.write::<u64>(address, value.to_u64())?
                    }
                    // RV128 SQ, as LDU above.
                    0b100 if A::XLEN >= 128 => {
                        return Err(MachineException::UnimplementedInstruction {
                            pc: this_pc.to_u64(),
                            bits: instruction,
                        })
                    }
                    _ => return Err(illegal),
                }
            }
            #[cfg(feature = "float")]
            0b01001 => {
                // STORE-FP
                self.execute_store_fp(instruction, this_pc)?;
            }
            0b01011 => {
                // AMO. Single-threaded execution degrades the A
                // extension to plain loads and stores: LR always
                // acquires the reservation, SC always succeeds.
                let funct5 = instruction >> 27;
                let address = self.cpu.reg(rs1!());
                let src = self.cpu.reg(rs2!());
                match funct3!() {
                    0b010 => {
                        let loaded = match funct5 {
                            0b00010 => self.memory.read::<u32>(address)?,
                            0b00011 => {
                                self.memory
                                    .write::<u32>(address, src.to_u32())?;
                                self.cpu.set_reg(rd!(), A::ZERO);
                                self.cpu.set_pc(next_pc);
                                return Ok(());
                            }
                            _ => {
                                let loaded =
                                    self.memory.read::<u32>(address)?;
                                let stored = match amo_op32(
                                    funct5,
                                    loaded,
                                    src.to_u32(),
                                ) {
                                    Some(stored) => stored,
                                    None => return Err(illegal),
                                };
                                self.memory.write::<u32>(address, stored)?;
                                loaded
                            }
                        };
                        self.cpu
                            .set_reg(rd!(), A::from_i64(loaded as i32 as i64));
                    }
                    0b011 if A::XLEN >= 64 => {
                        let loaded = match funct5 {
                            0b00010 => self.memory.read::<u64>(address)?,
                            0b00011 => {
                                self.memory
                                    .write::<u64>(address, src.to_u64())?;
                                self.cpu.set_reg(rd!(), A::ZERO);
                                self.cpu.set_pc(next_pc);
                                return Ok(());
                            }
                            _ => {
                                let loaded =
                                    self.memory.read::<u64>(address)?;
                                let stored = match amo_op64(
                                    funct5,
                                    loaded,
                                    src.to_u64(),
                                ) {
                                    Some(stored) => stored,
                                    None => return Err(illegal),
                                };
                                self.memory.write::<u64>(address, stored)?;
                                loaded
                            }
                        };
                        self.cpu.set_reg(rd!(), A::from_u64(loaded));
                    }
                    _ => return Err(illegal),
                }
            }
            0b01100 => {
                // OP
                let a = self.cpu.reg(rs1!());
                let b = self.cpu.reg(rs2!());
                let value = match funct7!() {
                    0b0000000 | 0b0100000 => {
                        let alt = funct7!() == 0b0100000;
                        match alu_op(alt, funct3!(), a, b) {
                            Some(value) => value,
                            None => return Err(illegal),
                        }
                    }
                    0b0000001 => mul_op(funct3!(), a, b),
                    _ => return Err(illegal),
                };
                self.cpu.set_reg(rd!(), value);
            }
            0b01101 => {
                // LUI
                self.cpu.set_reg(rd!(), A::from_i64(imm_u!()));
            }
            0b01110 => {
                // OP-32 (RV64 word forms)
                if A::XLEN < 64 {
                    return Err(illegal);
                }
                let a = self.cpu.reg(rs1!()).to_u32();
                let b = self.cpu.reg(rs2!()).to_u32();
                let value: i32 = match (funct7!(), funct3!()) {
                    (0b0000000, 0b000) => a.wrapping_add(b) as i32,
                    (0b0100000, 0b000) => a.wrapping_sub(b) as i32,
                    (0b0000000, 0b001) => (a << (b & 31)) as i32,
                    (0b0000000, 0b101) => (a >> (b & 31)) as i32,
                    (0b0100000, 0b101) => (a as i32) >> (b & 31),
                    (0b0000001, 0b000) => a.wrapping_mul(b) as i32,
                    (0b0000001, 0b100) => {
                        let (a, b) = (a as i32, b as i32);
                        if b == 0 {
                            -1
                        } else {
                            a.wrapping_div(b)
                        }
                    }
                    (0b0000001, 0b101) => {
                        if b == 0 {
                            -1i32
                        } else {
                            (a / b) as i32
                        }
                    }
                    (0b0000001, 0b110) => {
                        let (a, b) = (a as i32, b as i32);
                        if b == 0 {
                            a
                        } else {
                            a.wrapping_rem(b)
                        }
                    }
                    (0b0000001, 0b111) => {
                        if b == 0 {
                            a as i32
                        } else {
                            (a % b) as i32
                        }
                    }
                    _ => return Err(illegal),
                };
                self.cpu.set_reg(rd!(), A::from_i64(value as i64));
            }
            #[cfg(feature = "float")]
            0b10000 | 0b10001 | 0b10010 | 0b10011 => {
                // FMADD / FMSUB / FNMSUB / FNMADD
                self.execute_fmadd(instruction, this_pc)?;
            }
            #[cfg(feature = "float")]
            0b10100 => {
                // OP-FP
                self.execute_op_fp(instruction, this_pc)?;
            }
            0b11000 => {
                // BRANCH
                let a = self.cpu.reg(rs1!());
                let b = self.cpu.reg(rs2!());
                let should_branch = match funct3!() {
                    0b000 => a == b,
                    0b001 => a != b,
                    0b100 => a.lt_signed(b),
                    0b101 => !a.lt_signed(b),
                    0b110 => a < b,
                    0b111 => a >= b,
                    _ => return Err(illegal),
                };
                if should_branch {
                    let target =
                        this_pc.wrapping_add(A::from_i64(imm_b!()));
                    self.check_jump_target(this_pc, target)?;
                    next_pc = target;
                }
            }
            0b11001 => {
                // JALR
                if funct3!() != 0 {
                    return Err(illegal);
                }
                let base = self.cpu.reg(rs1!());
                let target = base.wrapping_add(A::from_i64(imm_i!()))
                    & !A::from_u32(1);
                self.check_jump_target(this_pc, target)?;
                self.cpu.set_reg(rd!(), next_pc);
                next_pc = target;
            }
            0b11011 => {
                // JAL
                let target = this_pc.wrapping_add(A::from_i64(imm_j!()));
                self.check_jump_target(this_pc, target)?;
                self.cpu.set_reg(rd!(), next_pc);
                next_pc = target;
            }
            0b11100 => {
                // SYSTEM
                match funct3!() {
                    0b000 => {
                        if rd!() != 0 || rs1!() != 0 {
                            return Err(illegal);
                        }
                        match instruction >> 20 {
                            0 => {
                                let number = self.syscall_number();
                                self.system_call(number)?;
                            }
                            // EBREAK is routed through the reserved
                            // table slot, so an embedder can install a
                            // debug hook there; the default handler
                            // raises UnhandledSyscall.
                            1 => self.system_call(SYSCALL_EBREAK)?,
                            _ => return Err(illegal),
                        }
                    }
                    _ => self.execute_csr(instruction, this_pc)?,
                }
            }
            _ => return Err(illegal),
        }
        self.cpu.set_pc(next_pc);
        Ok(())
    }

    /// The user-mode Zicsr subset: float status registers when floats
    /// are compiled in, plus the read-only counters.
    fn execute_csr(
        &mut self,
        instruction: u32,
        this_pc: A,
    ) -> Result<(), MachineException> {
        let illegal = MachineException::IllegalOpcode {
            pc: this_pc.to_u64(),
            bits: instruction,
        };
        let funct3 = (instruction >> 12) & 0b111;
        if funct3 & 0b11 == 0 {
            return Err(illegal);
        }
        let csr = instruction >> 20;
        let rd = ((instruction >> 7) & 0b11111) as usize;
        let rs1_index = ((instruction >> 15) & 0b11111) as usize;
        let src = if funct3 & 0b100 != 0 {
            A::from_u32(rs1_index as u32)
        } else {
            self.cpu.reg(rs1_index)
        };
        let old = self.read_csr(csr).ok_or(illegal)?;
        let new = match funct3 & 0b11 {
            0b01 => src,
            0b10 => old | src,
            _ => old & !src,
        };
        // CSRRS/CSRRC with a zero source only read.
        let write_back = funct3 & 0b11 == 0b01 || rs1_index != 0;
        if write_back && !self.write_csr(csr, new) {
            return Err(illegal);
        }
        self.cpu.set_reg(rd, old);
        Ok(())
    }

    fn read_csr(&self, csr: u32) -> Option<A> {
        match csr {
            #[cfg(feature = "float")]
            0x001 => Some(A::from_u32(self.cpu.fflags())),
            #[cfg(feature = "float")]
            0x002 => Some(A::from_u32(self.cpu.frm())),
            #[cfg(feature = "float")]
            0x003 => Some(A::from_u32(self.cpu.fcsr())),
            // cycle, time and instret all report retired instructions.
            0xC00 | 0xC01 | 0xC02 => {
                Some(A::from_u64(self.cpu.instruction_counter()))
            }
            _ => None,
        }
    }

    fn write_csr(&mut self, csr: u32, value: A) -> bool {
        let _ = value;
        match csr {
            #[cfg(feature = "float")]
            0x001 => {
                self.cpu.set_fflags(value.to_u32());
                true
            }
            #[cfg(feature = "float")]
            0x002 => {
                self.cpu.set_frm(value.to_u32());
                true
            }
            #[cfg(feature = "float")]
            0x003 => {
                self.cpu.set_fcsr(value.to_u32());
                true
            }
            _ => false,
        }
    }
}
