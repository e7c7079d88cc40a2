//! The F and D extensions.
//!
//! Arithmetic goes through `rustc_apfloat` rather than the host FPU,
//! so results and exception flags do not depend on the platform the
//! emulator runs on. The one exception is FSQRT, which uses the host
//! square root: IEEE requires sqrt to be correctly rounded, so for the
//! default rounding mode the host result is the right answer.
//!
//! Singles are NaN-boxed in the 64-bit float registers: a single is
//! valid only when the upper 32 bits are all ones, otherwise reads
//! observe the canonical NaN.

use rustc_apfloat::ieee::{Double, Single};
use rustc_apfloat::{Float, FloatConvert, Round, Status, StatusAnd};

use std::cmp::Ordering;

use crate::address::Address;
use crate::machine::{Machine, MachineException};

// fcsr accrued exception flag bits.
const FLAG_NX: u32 = 0x01;
const FLAG_UF: u32 = 0x02;
const FLAG_OF: u32 = 0x04;
const FLAG_DZ: u32 = 0x08;
const FLAG_NV: u32 = 0x10;

fn status_to_fflags(status: Status) -> u32 {
    let mut flags = 0;
    if status.contains(Status::INVALID_OP) {
        flags |= FLAG_NV;
    }
    if status.contains(Status::DIV_BY_ZERO) {
        flags |= FLAG_DZ;
    }
    if status.contains(Status::OVERFLOW) {
        flags |= FLAG_OF;
    }
    if status.contains(Status::UNDERFLOW) {
        flags |= FLAG_UF;
    }
    if status.contains(Status::INEXACT) {
        flags |= FLAG_NX;
    }
    flags
}

const CANONICAL_NAN_F32: u32 = 0x7FC0_0000;
const CANONICAL_NAN_F64: u64 = 0x7FF8_0000_0000_0000;

fn unbox_single(bits: u64) -> u32 {
    if bits >> 32 == 0xFFFF_FFFF {
        bits as u32
    } else {
        CANONICAL_NAN_F32
    }
}
fn box_single(bits: u32) -> u64 {
    bits as u64 | 0xFFFF_FFFF_0000_0000
}

/// A float format stored in the guest float register file.
trait GuestFloat:
    Float + Copy + PartialOrd + std::ops::Neg<Output = Self>
{
    fn load(reg: u64) -> Self;
    fn store(self) -> u64;
}

impl GuestFloat for Single {
    fn load(reg: u64) -> Self {
        Single::from_bits(unbox_single(reg) as u128)
    }
    fn store(self) -> u64 {
        box_single(self.to_bits() as u32)
    }
}

impl GuestFloat for Double {
    fn load(reg: u64) -> Self {
        Double::from_bits(reg as u128)
    }
    fn store(self) -> u64 {
        self.to_bits() as u64
    }
}

impl<A: Address> Machine<A> {
    /// Resolve the rounding mode field, falling back to `frm` for the
    /// dynamic encoding. Reserved encodings are invalid instructions.
    fn resolve_round(&self, rm: u32) -> Option<Round> {
        let rm = if rm == 0b111 { self.cpu.frm() } else { rm };
        match rm {
            0b000 => Some(Round::NearestTiesToEven),
            0b001 => Some(Round::TowardZero),
            0b010 => Some(Round::TowardNegative),
            0b011 => Some(Round::TowardPositive),
            0b100 => Some(Round::NearestTiesToAway),
            _ => None,
        }
    }

    /// FLW / FLD.
    pub(crate) fn execute_load_fp(
        &mut self,
        instruction: u32,
        this_pc: A,
    ) -> Result<(), MachineException> {
        let rd = ((instruction >> 7) & 0b11111) as usize;
        let rs1 = ((instruction >> 15) & 0b11111) as usize;
        let imm = ((instruction as i32) >> 20) as i64;
        let address = self.cpu.reg(rs1).wrapping_add(A::from_i64(imm));
        match (instruction >> 12) & 0b111 {
            0b010 => {
                let bits = self.memory.read::<u32>(address)?;
                self.cpu.set_freg(rd, box_single(bits));
            }
            0b011 => {
                let bits = self.memory.read::<u64>(address)?;
                self.cpu.set_freg(rd, bits);
            }
            _ => {
                return Err(MachineException::IllegalOpcode {
                    pc: this_pc.to_u64(),
                    bits: instruction,
                })
            }
        }
        Ok(())
    }

    /// FSW / FSD.
    pub(crate) fn execute_store_fp(
        &mut self,
        instruction: u32,
        this_pc: A,
    ) -> Result<(), MachineException> {
        let rs1 = ((instruction >> 15) & 0b11111) as usize;
        let rs2 = ((instruction >> 20) & 0b11111) as usize;
        let imm = ((((instruction as i32) >> 20) & !0b11111)
            | (((instruction >> 7) & 0b11111) as i32)) as i64;
        let address = self.cpu.reg(rs1).wrapping_add(A::from_i64(imm));
        match (instruction >> 12) & 0b111 {
            0b010 => {
                self.memory
                    .write::<u32>(address, self.cpu.freg(rs2) as u32)?;
            }
            0b011 => {
                self.memory.write::<u64>(address, self.cpu.freg(rs2))?;
            }
            _ => {
                return Err(MachineException::IllegalOpcode {
                    pc: this_pc.to_u64(),
                    bits: instruction,
                })
            }
        }
        Ok(())
    }

    /// The four fused multiply-add opcodes.
    pub(crate) fn execute_fmadd(
        &mut self,
        instruction: u32,
        this_pc: A,
    ) -> Result<(), MachineException> {
        let illegal = MachineException::IllegalOpcode {
            pc: this_pc.to_u64(),
            bits: instruction,
        };
        let rd = ((instruction >> 7) & 0b11111) as usize;
        let rs1 = ((instruction >> 15) & 0b11111) as usize;
        let rs2 = ((instruction >> 20) & 0b11111) as usize;
        let rs3 = (instruction >> 27) as usize;
        let rm = (instruction >> 12) & 0b111;
        let kind = (instruction >> 2) & 0b11;
        let round = self.resolve_round(rm).ok_or(illegal)?;
        macro_rules! fused {
            ($F:ty) => {{
                let a = <$F>::load(self.cpu.freg(rs1));
                let b = <$F>::load(self.cpu.freg(rs2));
                let c = <$F>::load(self.cpu.freg(rs3));
                let r: StatusAnd<$F> = match kind {
                    0b00 => a.mul_add_r(b, c, round),
                    0b01 => a.mul_add_r(b, -c, round),
                    0b10 => (-a).mul_add_r(b, c, round),
                    _ => (-a).mul_add_r(b, -c, round),
                };
                self.cpu.accrue_fflags(status_to_fflags(r.status));
                self.cpu.set_freg(rd, r.value.store());
            }};
        }
        match (instruction >> 25) & 0b11 {
            0b00 => fused!(Single),
            0b01 => fused!(Double),
            _ => return Err(illegal),
        }
        Ok(())
    }

    /// OP-FP: arithmetic, sign injection, min/max, conversions, moves,
    /// compares and classification.
    pub(crate) fn execute_op_fp(
        &mut self,
        instruction: u32,
        this_pc: A,
    ) -> Result<(), MachineException> {
        let illegal = MachineException::IllegalOpcode {
            pc: this_pc.to_u64(),
            bits: instruction,
        };
        let rd = ((instruction >> 7) & 0b11111) as usize;
        let rs1 = ((instruction >> 15) & 0b11111) as usize;
        let rs2 = ((instruction >> 20) & 0b11111) as usize;
        let rm = (instruction >> 12) & 0b111;
        let funct7 = instruction >> 25;
        let fmt = funct7 & 0b11;
        let op = funct7 >> 2;

        macro_rules! arith {
            ($F:ty) => {{
                let a = <$F>::load(self.cpu.freg(rs1));
                let b = <$F>::load(self.cpu.freg(rs2));
                let round = self.resolve_round(rm).ok_or(illegal)?;
                let r: StatusAnd<$F> = match op {
                    0b00000 => a.add_r(b, round),
                    0b00001 => a.sub_r(b, round),
                    0b00010 => a.mul_r(b, round),
                    _ => a.div_r(b, round),
                };
                self.cpu.accrue_fflags(status_to_fflags(r.status));
                self.cpu.set_freg(rd, r.value.store());
            }};
        }
        macro_rules! min_max {
            ($F:ty) => {{
                let a = <$F>::load(self.cpu.freg(rs1));
                let b = <$F>::load(self.cpu.freg(rs2));
                if a.is_signaling() || b.is_signaling() {
                    self.cpu.accrue_fflags(FLAG_NV);
                }
                let want_min = rm == 0;
                let r = if a.is_nan() && b.is_nan() {
                    <$F>::NAN
                } else if a.is_nan() {
                    b
                } else if b.is_nan() {
                    a
                } else if a.is_zero() && b.is_zero() {
                    // ±0 compare equal; the sign decides.
                    if a.is_negative() == want_min {
                        a
                    } else {
                        b
                    }
                } else {
                    match a.partial_cmp(&b) {
                        Some(Ordering::Less) => {
                            if want_min {
                                a
                            } else {
                                b
                            }
                        }
                        _ => {
                            if want_min {
                                b
                            } else {
                                a
                            }
                        }
                    }
                };
                self.cpu.set_freg(rd, r.store());
            }};
        }
        macro_rules! compare {
            ($F:ty) => {{
                let a = <$F>::load(self.cpu.freg(rs1));
                let b = <$F>::load(self.cpu.freg(rs2));
                let any_nan = a.is_nan() || b.is_nan();
                let result = match rm {
                    // FLE and FLT signal on any NaN, FEQ only on
                    // signaling NaNs.
                    0b000 => {
                        if any_nan {
                            self.cpu.accrue_fflags(FLAG_NV);
                            false
                        } else {
                            matches!(
                                a.partial_cmp(&b),
                                Some(Ordering::Less) | Some(Ordering::Equal)
                            )
                        }
                    }
                    0b001 => {
                        if any_nan {
                            self.cpu.accrue_fflags(FLAG_NV);
                            false
                        } else {
                            a.partial_cmp(&b) == Some(Ordering::Less)
                        }
                    }
                    0b010 => {
                        if a.is_signaling() || b.is_signaling() {
                            self.cpu.accrue_fflags(FLAG_NV);
                        }
                        !any_nan && a.partial_cmp(&b) == Some(Ordering::Equal)
                    }
                    _ => return Err(illegal),
                };
                self.cpu.set_reg(
                    rd,
                    if result { A::from_u32(1) } else { A::ZERO },
                );
            }};
        }
        macro_rules! to_int {
            ($F:ty) => {{
                let f = <$F>::load(self.cpu.freg(rs1));
                let round = self.resolve_round(rm).ok_or(illegal)?;
                let mut exact = false;
                let (value, status) = match rs2 {
                    0 => {
                        let sa = f.to_i128_r(32, round, &mut exact);
                        let v = if sa.status.contains(Status::INVALID_OP) {
                            if f.is_nan() || !f.is_negative() {
                                i32::MAX as i128
                            } else {
                                i32::MIN as i128
                            }
                        } else {
                            sa.value
                        };
                        (A::from_i64(v as i32 as i64), sa.status)
                    }
                    1 => {
                        let sa = f.to_u128_r(32, round, &mut exact);
                        let v = if sa.status.contains(Status::INVALID_OP) {
                            if f.is_nan() || !f.is_negative() {
                                u32::MAX as u128
                            } else {
                                0
                            }
                        } else {
                            sa.value
                        };
                        // The 32-bit result is sign-extended even for
                        // the unsigned conversion.
                        (A::from_i64(v as u32 as i32 as i64), sa.status)
                    }
                    2 if A::XLEN >= 64 => {
                        let sa = f.to_i128_r(64, round, &mut exact);
                        let v = if sa.status.contains(Status::INVALID_OP) {
                            if f.is_nan() || !f.is_negative() {
                                i64::MAX as i128
                            } else {
                                i64::MIN as i128
                            }
                        } else {
                            sa.value
                        };
                        (A::from_i64(v as i64), sa.status)
                    }
                    3 if A::XLEN >= 64 => {
                        let sa = f.to_u128_r(64, round, &mut exact);
                        let v = if sa.status.contains(Status::INVALID_OP) {
                            if f.is_nan() || !f.is_negative() {
                                u64::MAX as u128
                            } else {
                                0
                            }
                        } else {
                            sa.value
                        };
                        (A::from_u64(v as u64), sa.status)
                    }
                    _ => return Err(illegal),
                };
                self.cpu.accrue_fflags(status_to_fflags(status));
                self.cpu.set_reg(rd, value);
            }};
        }
        macro_rules! from_int {
            ($F:ty) => {{
                let round = self.resolve_round(rm).ok_or(illegal)?;
                let reg = self.cpu.reg(rs1);
                let sa: StatusAnd<$F> = match rs2 {
                    0 => <$F>::from_i128_r(
                        reg.to_u64() as u32 as i32 as i128,
                        round,
                    ),
                    1 => <$F>::from_u128_r(reg.to_u64() as u32 as u128, round),
                    2 if A::XLEN >= 64 => {
                        <$F>::from_i128_r(reg.to_i64() as i128, round)
                    }
                    3 if A::XLEN >= 64 => {
                        <$F>::from_u128_r(reg.to_u64() as u128, round)
                    }
                    _ => return Err(illegal),
                };
                self.cpu.accrue_fflags(status_to_fflags(sa.status));
                self.cpu.set_freg(rd, sa.value.store());
            }};
        }
        macro_rules! classify {
            ($F:ty) => {{
                let f = <$F>::load(self.cpu.freg(rs1));
                let class: u32 = if f.is_nan() {
                    if f.is_signaling() {
                        1 << 8
                    } else {
                        1 << 9
                    }
                } else if f.is_infinite() {
                    if f.is_negative() {
                        1 << 0
                    } else {
                        1 << 7
                    }
                } else if f.is_zero() {
                    if f.is_negative() {
                        1 << 3
                    } else {
                        1 << 4
                    }
                } else if f.is_denormal() {
                    if f.is_negative() {
                        1 << 2
                    } else {
                        1 << 5
                    }
                } else if f.is_negative() {
                    1 << 1
                } else {
                    1 << 6
                };
                self.cpu.set_reg(rd, A::from_u32(class));
            }};
        }

        match op {
            0b00000..=0b00011 => match fmt {
                0b00 => arith!(Single),
                0b01 => arith!(Double),
                _ => return Err(illegal),
            },
            0b01011 => {
                // FSQRT; see the module comment about the host sqrt.
                if rs2 != 0 {
                    return Err(illegal);
                }
                self.resolve_round(rm).ok_or(illegal)?;
                match fmt {
                    0b00 => {
                        let x =
                            f32::from_bits(unbox_single(self.cpu.freg(rs1)));
                        let sqnan = x.is_nan() && x.to_bits() & 0x0040_0000 == 0;
                        if x < 0.0 || sqnan {
                            self.cpu.accrue_fflags(FLAG_NV);
                        }
                        let r = x.sqrt();
                        let bits = if r.is_nan() {
                            CANONICAL_NAN_F32
                        } else {
                            r.to_bits()
                        };
                        self.cpu.set_freg(rd, box_single(bits));
                    }
                    0b01 => {
                        let x = f64::from_bits(self.cpu.freg(rs1));
                        let sqnan = x.is_nan()
                            && x.to_bits() & 0x0008_0000_0000_0000 == 0;
                        if x < 0.0 || sqnan {
                            self.cpu.accrue_fflags(FLAG_NV);
                        }
                        let r = x.sqrt();
                        let bits = if r.is_nan() {
                            CANONICAL_NAN_F64
                        } else {
                            r.to_bits()
                        };
                        self.cpu.set_freg(rd, bits);
                    }
                    _ => return Err(illegal),
                }
            }
            0b00100 => {
                // FSGNJ / FSGNJN / FSGNJX: pure bit manipulation.
                match fmt {
                    0b00 => {
                        let a = unbox_single(self.cpu.freg(rs1));
                        let b = unbox_single(self.cpu.freg(rs2));
                        let sign = match rm {
                            0b000 => b & 0x8000_0000,
                            0b001 => !b & 0x8000_0000,
                            0b010 => (a ^ b) & 0x8000_0000,
                            _ => return Err(illegal),
                        };
                        self.cpu
                            .set_freg(rd, box_single(a & 0x7FFF_FFFF | sign));
                    }
                    0b01 => {
                        let a = self.cpu.freg(rs1);
                        let b = self.cpu.freg(rs2);
                        let sign = match rm {
                            0b000 => b & 0x8000_0000_0000_0000,
                            0b001 => !b & 0x8000_0000_0000_0000,
                            0b010 => (a ^ b) & 0x8000_0000_0000_0000,
                            _ => return Err(illegal),
                        };
                        self.cpu.set_freg(rd, a & 0x7FFF_FFFF_FFFF_FFFF | sign);
                    }
                    _ => return Err(illegal),
                }
            }
            0b00101 => match fmt {
                0b00 => min_max!(Single),
                0b01 => min_max!(Double),
                _ => return Err(illegal),
            },
            0b01000 => {
                // FCVT.S.D and FCVT.D.S; rs2 names the source format.
                match (fmt, rs2) {
                    (0b00, 1) => {
                        let a = Double::load(self.cpu.freg(rs1));
                        let round = self.resolve_round(rm).ok_or(illegal)?;
                        let mut loses_info = false;
                        let r: StatusAnd<Single> =
                            a.convert_r(round, &mut loses_info);
                        self.cpu.accrue_fflags(status_to_fflags(r.status));
                        self.cpu.set_freg(rd, r.value.store());
                    }
                    (0b01, 0) => {
                        let a = Single::load(self.cpu.freg(rs1));
                        let mut loses_info = false;
                        // Widening is exact; the rounding mode is moot.
                        let r: StatusAnd<Double> = a.convert_r(
                            Round::NearestTiesToEven,
                            &mut loses_info,
                        );
                        self.cpu.accrue_fflags(status_to_fflags(r.status));
                        self.cpu.set_freg(rd, r.value.store());
                    }
                    _ => return Err(illegal),
                }
            }
            0b10100 => match fmt {
                0b00 => compare!(Single),
                0b01 => compare!(Double),
                _ => return Err(illegal),
            },
            0b11000 => match fmt {
                0b00 => to_int!(Single),
                0b01 => to_int!(Double),
                _ => return Err(illegal),
            },
            0b11010 => match fmt {
                0b00 => from_int!(Single),
                0b01 => from_int!(Double),
                _ => return Err(illegal),
            },
            0b11100 => match (fmt, rm) {
                // FMV.X.W moves the raw low 32 bits, sign-extended.
                (0b00, 0b000) => {
                    if rs2 != 0 {
                        return Err(illegal);
                    }
                    let bits = self.cpu.freg(rs1) as u32;
                    self.cpu.set_reg(rd, A::from_i64(bits as i32 as i64));
                }
                (0b01, 0b000) if A::XLEN >= 64 => {
                    if rs2 != 0 {
                        return Err(illegal);
                    }
                    self.cpu.set_reg(rd, A::from_u64(self.cpu.freg(rs1)));
                }
                (0b00, 0b001) => classify!(Single),
                (0b01, 0b001) => classify!(Double),
                _ => return Err(illegal),
            },
            0b11110 => match (fmt, rm) {
                (0b00, 0b000) => {
                    if rs2 != 0 {
                        return Err(illegal);
                    }
                    let bits = self.cpu.reg(rs1).to_u32();
                    self.cpu.set_freg(rd, box_single(bits));
                }
                (0b01, 0b000) if A::XLEN >= 64 => {
                    if rs2 != 0 {
                        return Err(illegal);
                    }
                    self.cpu.set_freg(rd, self.cpu.reg(rs1).to_u64());
                }
                _ => return Err(illegal),
            },
            _ => return Err(illegal),
        }
        Ok(())
    }
}
