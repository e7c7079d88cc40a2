//! The C (compressed) extension.
//!
//! Every 16-bit encoding aliases a base instruction, so the decoder
//! widens compressed parcels into their 32-bit forms and feeds them to
//! the ordinary executor; only the PC increment differs. Reserved
//! encodings (including the all-zero parcel) are rejected here.

use crate::address::Address;
use crate::machine::MachineException;

const LOAD: u32 = 0x03;
const LOAD_FP: u32 = 0x07;
const OP_IMM: u32 = 0x13;
const STORE: u32 = 0x23;
const STORE_FP: u32 = 0x27;
const OP: u32 = 0x33;
const LUI: u32 = 0x37;
const OP_IMM_32: u32 = 0x1B;
const OP_32: u32 = 0x3B;
const BRANCH: u32 = 0x63;
const JALR: u32 = 0x67;
const JAL: u32 = 0x6F;

const EBREAK: u32 = 0x0010_0073;

fn enc_r(opcode: u32, funct3: u32, funct7: u32, rd: u32, rs1: u32, rs2: u32) -> u32 {
    opcode | (rd << 7) | (funct3 << 12) | (rs1 << 15) | (rs2 << 20) | (funct7 << 25)
}

fn enc_i(opcode: u32, funct3: u32, rd: u32, rs1: u32, imm: i32) -> u32 {
    opcode | (rd << 7) | (funct3 << 12) | (rs1 << 15) | ((imm as u32 & 0xFFF) << 20)
}

fn enc_s(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    opcode
        | ((imm & 0b11111) << 7)
        | (funct3 << 12)
        | (rs1 << 15)
        | (rs2 << 20)
        | (((imm >> 5) & 0b1111111) << 25)
}

fn enc_b(funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    BRANCH
        | (((imm >> 11) & 1) << 7)
        | (((imm >> 1) & 0b1111) << 8)
        | (funct3 << 12)
        | (rs1 << 15)
        | (rs2 << 20)
        | (((imm >> 5) & 0b111111) << 25)
        | (((imm >> 12) & 1) << 31)
}

fn enc_j(rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    JAL | (rd << 7)
        | (((imm >> 12) & 0xFF) << 12)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 20) & 1) << 31)
}

fn sext(value: u32, bits: u32) -> i32 {
    ((value << (32 - bits)) as i32) >> (32 - bits)
}

/// CJ-format jump offset.
fn cj_offset(h: u32) -> i32 {
    let mut imm = 0;
    imm |= ((h >> 12) & 1) << 11;
    imm |= ((h >> 11) & 1) << 4;
    imm |= ((h >> 9) & 0b11) << 8;
    imm |= ((h >> 8) & 1) << 10;
    imm |= ((h >> 7) & 1) << 6;
    imm |= ((h >> 6) & 1) << 7;
    imm |= ((h >> 3) & 0b111) << 1;
    imm |= ((h >> 2) & 1) << 5;
    sext(imm, 12)
}

/// CB-format branch offset.
fn cb_offset(h: u32) -> i32 {
    let mut imm = 0;
    imm |= ((h >> 12) & 1) << 8;
    imm |= ((h >> 10) & 0b11) << 3;
    imm |= ((h >> 5) & 0b11) << 6;
    imm |= ((h >> 3) & 0b11) << 1;
    imm |= ((h >> 2) & 1) << 5;
    sext(imm, 9)
}

/// CI-format sign-extended 6-bit immediate.
fn ci_imm(h: u32) -> i32 {
    sext(((h >> 12) & 1) << 5 | ((h >> 2) & 0b11111), 6)
}

/// Widen one compressed parcel into its 32-bit alias. `A` selects
/// between the RV32- and RV64-only encodings that share a slot.
pub(crate) fn expand<A: Address>(
    half: u16,
    pc: u64,
) -> Result<u32, MachineException> {
    let h = half as u32;
    let illegal = MachineException::IllegalOpcode {
        pc,
        bits: h,
    };
    let funct3 = (h >> 13) & 0b111;
    match h & 0b11 {
        0b00 => {
            let rd = 8 + ((h >> 2) & 0b111);
            let rs1 = 8 + ((h >> 7) & 0b111);
            match funct3 {
                0b000 => {
                    // C.ADDI4SPN; the all-zero parcel lands here too.
                    let imm = ((h >> 11) & 0b11) << 4
                        | ((h >> 7) & 0b1111) << 6
                        | ((h >> 6) & 1) << 2
                        | ((h >> 5) & 1) << 3;
                    if imm == 0 {
                        return Err(illegal);
                    }
                    Ok(enc_i(OP_IMM, 0b000, rd, 2, imm as i32))
                }
                0b001 => {
                    // C.FLD
                    let imm = ((h >> 10) & 0b111) << 3 | ((h >> 5) & 0b11) << 6;
                    Ok(enc_i(LOAD_FP, 0b011, rd, rs1, imm as i32))
                }
                0b010 => {
                    // C.LW
                    let imm = ((h >> 10) & 0b111) << 3
                        | ((h >> 6) & 1) << 2
                        | ((h >> 5) & 1) << 6;
                    Ok(enc_i(LOAD, 0b010, rd, rs1, imm as i32))
                }
                0b011 => {
                    if A::XLEN >= 64 {
                        // C.LD
                        let imm =
                            ((h >> 10) & 0b111) << 3 | ((h >> 5) & 0b11) << 6;
                        Ok(enc_i(LOAD, 0b011, rd, rs1, imm as i32))
                    } else {
                        // C.FLW
                        let imm = ((h >> 10) & 0b111) << 3
                            | ((h >> 6) & 1) << 2
                            | ((h >> 5) & 1) << 6;
                        Ok(enc_i(LOAD_FP, 0b010, rd, rs1, imm as i32))
                    }
                }
                0b101 => {
                    // C.FSD
                    let imm = ((h >> 10) & 0b111) << 3 | ((h >> 5) & 0b11) << 6;
                    Ok(enc_s(STORE_FP, 0b011, rs1, rd, imm as i32))
                }
                0b110 => {
                    // C.SW
                    let imm = ((h >> 10) & 0b111) << 3
                        | ((h >> 6) & 1) << 2
                        | ((h >> 5) & 1) << 6;
                    Ok(enc_s(STORE, 0b010, rs1, rd, imm as i32))
                }
                0b111 => {
                    if A::XLEN >= 64 {
                        // C.SD
                        let imm =
                            ((h >> 10) & 0b111) << 3 | ((h >> 5) & 0b11) << 6;
                        Ok(enc_s(STORE, 0b011, rs1, rd, imm as i32))
                    } else {
                        // C.FSW
                        let imm = ((h >> 10) & 0b111) << 3
                            | ((h >> 6) & 1) << 2
                            | ((h >> 5) & 1) << 6;
                        Ok(enc_s(STORE_FP, 0b010, rs1, rd, imm as i32))
                    }
                }
                _ => Err(illegal),
            }
        }
        0b01 => {
            match funct3 {
                0b000 => {
                    // C.ADDI (and C.NOP)
                    let rd = (h >> 7) & 0b11111;
                    Ok(enc_i(OP_IMM, 0b000, rd, rd, ci_imm(h)))
                }
                0b001 => {
                    if A::XLEN >= 64 {
                        // C.ADDIW
                        let rd = (h >> 7) & 0b11111;
                        if rd == 0 {
                            return Err(illegal);
                        }
                        Ok(enc_i(OP_IMM_32, 0b000, rd, rd, ci_imm(h)))
                    } else {
                        // C.JAL
                        Ok(enc_j(1, cj_offset(h)))
                    }
                }
                0b010 => {
                    // C.LI
                    let rd = (h >> 7) & 0b11111;
                    Ok(enc_i(OP_IMM, 0b000, rd, 0, ci_imm(h)))
                }
                0b011 => {
                    let rd = (h >> 7) & 0b11111;
                    if rd == 2 {
                        // C.ADDI16SP
                        let imm = ((h >> 12) & 1) << 9
                            | ((h >> 6) & 1) << 4
                            | ((h >> 5) & 1) << 6
                            | ((h >> 3) & 0b11) << 7
                            | ((h >> 2) & 1) << 5;
                        let imm = sext(imm, 10);
                        if imm == 0 {
                            return Err(illegal);
                        }
                        Ok(enc_i(OP_IMM, 0b000, 2, 2, imm))
                    } else {
                        // C.LUI
                        let imm = ci_imm(h);
                        if imm == 0 {
                            return Err(illegal);
                        }
                        Ok(LUI | (rd << 7) | ((imm as u32 & 0xFFFFF) << 12))
                    }
                }
                0b100 => {
                    let rd = 8 + ((h >> 7) & 0b111);
                    match (h >> 10) & 0b11 {
                        0b00 | 0b01 => {
                            // C.SRLI / C.SRAI
                            let shamt =
                                ((h >> 12) & 1) << 5 | ((h >> 2) & 0b11111);
                            if A::XLEN == 32 && shamt >= 32 {
                                return Err(illegal);
                            }
                            let alt = if (h >> 10) & 1 != 0 { 0x400 } else { 0 };
                            Ok(enc_i(
                                OP_IMM,
                                0b101,
                                rd,
                                rd,
                                (shamt | alt) as i32,
                            ))
                        }
                        0b10 => {
                            // C.ANDI
                            Ok(enc_i(OP_IMM, 0b111, rd, rd, ci_imm(h)))
                        }
                        _ => {
                            let rs2 = 8 + ((h >> 2) & 0b111);
                            if (h >> 12) & 1 == 0 {
                                let (funct3, funct7) = match (h >> 5) & 0b11 {
                                    0b00 => (0b000, 0b0100000), // C.SUB
                                    0b01 => (0b100, 0),         // C.XOR
                                    0b10 => (0b110, 0),         // C.OR
                                    _ => (0b111, 0),            // C.AND
                                };
                                Ok(enc_r(OP, funct3, funct7, rd, rd, rs2))
                            } else {
                                if A::XLEN < 64 {
                                    return Err(illegal);
                                }
                                match (h >> 5) & 0b11 {
                                    // C.SUBW
                                    0b00 => Ok(enc_r(
                                        OP_32, 0b000, 0b0100000, rd, rd, rs2,
                                    )),
                                    // C.ADDW
                                    0b01 => {
                                        Ok(enc_r(OP_32, 0b000, 0, rd, rd, rs2))
                                    }
                                    _ => Err(illegal),
                                }
                            }
                        }
                    }
                }
                0b101 => Ok(enc_j(0, cj_offset(h))), // C.J
                0b110 => {
                    // C.BEQZ
                    let rs1 = 8 + ((h >> 7) & 0b111);
                    Ok(enc_b(0b000, rs1, 0, cb_offset(h)))
                }
                _ => {
                    // C.BNEZ
                    let rs1 = 8 + ((h >> 7) & 0b111);
                    Ok(enc_b(0b001, rs1, 0, cb_offset(h)))
                }
            }
        }
        0b10 => {
            let rd = (h >> 7) & 0b11111;
            match funct3 {
                0b000 => {
                    // C.SLLI
                    let shamt = ((h >> 12) & 1) << 5 | ((h >> 2) & 0b11111);
                    if A::XLEN == 32 && shamt >= 32 {
                        return Err(illegal);
                    }
                    Ok(enc_i(OP_IMM, 0b001, rd, rd, shamt as i32))
                }
                0b001 => {
                    // C.FLDSP
                    let imm = ((h >> 12) & 1) << 5
                        | ((h >> 5) & 0b11) << 3
                        | ((h >> 2) & 0b111) << 6;
                    Ok(enc_i(LOAD_FP, 0b011, rd, 2, imm as i32))
                }
                0b010 => {
                    // C.LWSP
                    if rd == 0 {
                        return Err(illegal);
                    }
                    let imm = ((h >> 12) & 1) << 5
                        | ((h >> 4) & 0b111) << 2
                        | ((h >> 2) & 0b11) << 6;
                    Ok(enc_i(LOAD, 0b010, rd, 2, imm as i32))
                }
                0b011 => {
                    let imm_d = ((h >> 12) & 1) << 5
                        | ((h >> 5) & 0b11) << 3
                        | ((h >> 2) & 0b111) << 6;
                    if A::XLEN >= 64 {
                        // C.LDSP
                        if rd == 0 {
                            return Err(illegal);
                        }
                        Ok(enc_i(LOAD, 0b011, rd, 2, imm_d as i32))
                    } else {
                        // C.FLWSP
                        let imm = ((h >> 12) & 1) << 5
                            | ((h >> 4) & 0b111) << 2
                            | ((h >> 2) & 0b11) << 6;
                        Ok(enc_i(LOAD_FP, 0b010, rd, 2, imm as i32))
                    }
                }
                0b100 => {
                    let rs2 = (h >> 2) & 0b11111;
                    if (h >> 12) & 1 == 0 {
                        if rs2 == 0 {
                            // C.JR
                            if rd == 0 {
                                return Err(illegal);
                            }
                            Ok(enc_i(JALR, 0b000, 0, rd, 0))
                        } else {
                            // C.MV
                            Ok(enc_r(OP, 0b000, 0, rd, 0, rs2))
                        }
                    } else if rs2 == 0 {
                        if rd == 0 {
                            Ok(EBREAK)
                        } else {
                            // C.JALR
                            Ok(enc_i(JALR, 0b000, 1, rd, 0))
                        }
                    } else {
                        // C.ADD
                        Ok(enc_r(OP, 0b000, 0, rd, rd, rs2))
                    }
                }
                0b101 => {
                    // C.FSDSP
                    let rs2 = (h >> 2) & 0b11111;
                    let imm = ((h >> 10) & 0b111) << 3 | ((h >> 7) & 0b111) << 6;
                    Ok(enc_s(STORE_FP, 0b011, 2, rs2, imm as i32))
                }
                0b110 => {
                    // C.SWSP
                    let rs2 = (h >> 2) & 0b11111;
                    let imm = ((h >> 9) & 0b1111) << 2 | ((h >> 7) & 0b11) << 6;
                    Ok(enc_s(STORE, 0b010, 2, rs2, imm as i32))
                }
                _ => {
                    let rs2 = (h >> 2) & 0b11111;
                    if A::XLEN >= 64 {
                        // C.SDSP
                        let imm =
                            ((h >> 10) & 0b111) << 3 | ((h >> 7) & 0b111) << 6;
                        Ok(enc_s(STORE, 0b011, 2, rs2, imm as i32))
                    } else {
                        // C.FSWSP
                        let imm =
                            ((h >> 9) & 0b1111) << 2 | ((h >> 7) & 0b11) << 6;
                        Ok(enc_s(STORE_FP, 0b010, 2, rs2, imm as i32))
                    }
                }
            }
        }
        _ => Err(illegal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand32(half: u16) -> u32 {
        expand::<u32>(half, 0).expect("legal compressed instruction")
    }
    fn expand64(half: u16) -> u32 {
        expand::<u64>(half, 0).expect("legal compressed instruction")
    }

    #[test]
    fn all_zero_parcel_is_illegal() {
        assert!(expand::<u32>(0, 0).is_err());
    }

    #[test]
    fn c_nop_is_addi_x0_x0_0() {
        assert_eq!(expand32(0x0001), 0x0000_0013);
    }

    #[test]
    fn c_li_a0_1() {
        // c.li a0, 1 = 0x4505 -> addi a0, x0, 1
        assert_eq!(expand32(0x4505), enc_i(OP_IMM, 0, 10, 0, 1));
    }

    #[test]
    fn c_andi_negative_immediate() {
        // c.andi a0, -1: funct3=100, bit12=1 (imm5), bits11:10=10,
        // rd'=2 (a0), imm[4:0]=0b11111, quadrant 01.
        let h = 0b100_1_10_010_11111_01u16;
        assert_eq!(expand32(h), enc_i(OP_IMM, 0b111, 10, 10, -1));
    }

    #[test]
    fn c_add_and_c_mv() {
        // c.add a0, a1 = 0x952E
        assert_eq!(expand32(0x952E), enc_r(OP, 0, 0, 10, 10, 11));
        // c.mv a0, a1 = 0x852E
        assert_eq!(expand32(0x852E), enc_r(OP, 0, 0, 10, 0, 11));
    }

    #[test]
    fn c_ebreak() {
        assert_eq!(expand32(0x9002), EBREAK);
    }

    #[test]
    fn quadrant_zero_width_split() {
        // funct3=011 is C.FLW on RV32 and C.LD on RV64.
        // c.ld a0, 0(a1) = 0x6188
        assert_eq!(expand64(0x6188), enc_i(LOAD, 0b011, 10, 11, 0));
        assert_eq!(expand32(0x6188), enc_i(LOAD_FP, 0b010, 10, 11, 0));
    }

    #[test]
    fn c_j_backwards() {
        // c.j -4 from the compressed test corpus: 0xBFFD is j -2?
        // Verify via round decode: offset bits of 0xB7FD.
        let word = expand32(0xBFF5);
        assert_eq!(word & 0x7F, JAL);
        // rd must be x0.
        assert_eq!((word >> 7) & 0x1F, 0);
    }
}
