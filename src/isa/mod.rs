//! ISA module - 32-bit instruction encoding for the accelerator.
//!
//! Two disjoint encoding families share the 4-bit opcode field:
//!
//! - control/memory words: `[31:28] op_code, [27:21] op_spec,
//!   [20:16] loop_id, [15:0] immediate`
//! - compute words: `[31:28] op_code, [27] src1_sel, [26:24] fn,
//!   [23:8] src1/imm, [7:4] src0, [3:0] dest`
//!
//! Every field is range-checked before packing; a value that does not
//! fit its field is an error, never a truncation. The only deliberate
//! masking is the low/high split of GenAddr strides and the 21-bit
//! slicing of base addresses, where the remaining bits live in a
//! companion instruction.

/// Instruction opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Setup = 0,
    LdMem = 1,
    StMem = 2,
    RdBuf = 3,
    WrBuf = 4,
    GenAddrHi = 5,
    GenAddrLo = 6,
    Loop = 7,
    BlockEnd = 8,
    BaseAddr = 9,
    PuBlock = 10,
    ComputeR = 11,
    ComputeI = 12,
}

/// On-chip scratchpad identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Scratchpad {
    Ibuf = 0,
    Obuf = 1,
    Wbuf = 2,
    Bias = 3,
}

/// Address-generator access type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessType {
    Ld = 0,
    St = 1,
    Rd = 2,
    Wr = 3,
}

/// PU ALU function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FnCode {
    Nop = 0,
    Add = 1,
    Sub = 2,
    Mul = 3,
    MvHi = 4,
    Max = 5,
    Min = 6,
    Rshift = 7,
}

/// PU source slot that pops the OBUF stream.
pub const SRC_OBUF_POP: u8 = 8;
/// PU source slot that pops the LD0 stream.
pub const SRC_LD0_POP: u8 = 9;
/// PU source slot that pops the LD1 stream.
pub const SRC_LD1_POP: u8 = 10;
/// PU destination slot that pushes to the ST-DDR stream.
pub const DEST_ST_PUSH: u8 = 8;

/// Encoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{field} value {value} does not fit in {bits} bits")]
    FieldOutOfRange {
        field: &'static str,
        value: u64,
        bits: u32,
    },
    #[error("Immediate {value} outside signed 16-bit range")]
    ImmOutOfRange { value: i64 },
    #[error("Element width of {0} bits is not a power of two up to 128")]
    BadElementWidth(u64),
}

#[inline]
fn check_field(field: &'static str, value: u64, bits: u32) -> Result<u32, EncodeError> {
    if value >= (1u64 << bits) {
        return Err(EncodeError::FieldOutOfRange { field, value, bits });
    }
    Ok(value as u32)
}

/// log2 of a power-of-two element width (up to 128 bits).
fn elem_width_log2(bits: u64) -> Result<u64, EncodeError> {
    if !bits.is_power_of_two() || bits > 128 {
        return Err(EncodeError::BadElementWidth(bits));
    }
    Ok(u64::from(bits.trailing_zeros()))
}

/// Pack a control/memory word.
fn control_word(
    op_code: OpCode,
    op_spec: u64,
    loop_id: u64,
    immediate: u64,
) -> Result<u32, EncodeError> {
    let op_spec = check_field("op_spec", op_spec, 7)?;
    let loop_id = check_field("loop_id", loop_id, 5)?;
    let immediate = check_field("immediate", immediate, 16)?;
    Ok(((op_code as u32) << 28) | (op_spec << 21) | (loop_id << 16) | immediate)
}

/// SETUP: declares the two operand widths of the MACC array.
pub fn setup(op0_bits: u64, op1_bits: u64) -> Result<u32, EncodeError> {
    let spec = (elem_width_log2(op0_bits)? << 3) | elem_width_log2(op1_bits)?;
    control_word(OpCode::Setup, spec, 0, 0)
}

fn access_word(
    op_code: OpCode,
    scratchpad_id: u64,
    elem_bits: u64,
    loop_id: u64,
    access_size: u64,
) -> Result<u32, EncodeError> {
    let spec = (scratchpad_id << 3) | elem_width_log2(elem_bits)?;
    control_word(op_code, spec, loop_id, access_size)
}

/// LDMEM: DRAM-to-scratchpad transfer declaration. The PU reuses ids
/// beyond the four conv scratchpads for its stream engines.
pub fn ldmem(
    scratchpad_id: u64,
    elem_bits: u64,
    loop_id: u64,
    access_size: u64,
) -> Result<u32, EncodeError> {
    access_word(OpCode::LdMem, scratchpad_id, elem_bits, loop_id, access_size)
}

/// STMEM: scratchpad-to-DRAM transfer declaration.
pub fn stmem(
    scratchpad_id: u64,
    elem_bits: u64,
    loop_id: u64,
    access_size: u64,
) -> Result<u32, EncodeError> {
    access_word(OpCode::StMem, scratchpad_id, elem_bits, loop_id, access_size)
}

/// LOOP: opens a hardware loop. `count` is one less than the trip count.
pub fn loop_inst(level: u64, loop_id: u64, count: u64) -> Result<u32, EncodeError> {
    control_word(OpCode::Loop, level, loop_id, count)
}

/// BLOCK_END: terminates a macro-op block; `last` marks the final block
/// of the program.
pub fn block_end(last: bool) -> u32 {
    ((OpCode::BlockEnd as u32) << 28) | u32::from(last)
}

/// PU_BLOCK: opens a PU micro-program of `num_instructions` words
/// (exclusive of this word and the closing repeat).
pub fn pu_block_start(num_instructions: u64) -> Result<u32, EncodeError> {
    control_word(OpCode::PuBlock, 0, 0, num_instructions)
}

/// PU block terminator: the micro-program repeats `repeat` times.
pub fn pu_block_repeat(repeat: u64) -> Result<u32, EncodeError> {
    let imm = repeat
        .checked_sub(1)
        .ok_or(EncodeError::FieldOutOfRange {
            field: "repeat",
            value: 0,
            bits: 16,
        })?;
    control_word(OpCode::BlockEnd, 0, 0, imm)
}

/// BASE_ADDR: loads one 21-bit slice of a scratchpad's DRAM base
/// address. `index` selects the slice; the low 16 bits go in the
/// immediate and the next 5 in the loop-id field.
pub fn base_addr(scratchpad_id: u64, index: u64, address: u64) -> Result<u32, EncodeError> {
    let index = check_field("base_addr index", index, 1)? as u64;
    let spec = (scratchpad_id << 3) | index;
    let slice = address >> (index * 21);
    let immediate = slice & 0xFFFF;
    let loop_id = (slice >> 16) & 0x1F;
    control_word(OpCode::BaseAddr, spec, loop_id, immediate)
}

/// GENADDRLO: the low 16 bits of an address-generator stride. The
/// access selector is the raw low-3-bit field; conv-path callers pass
/// an [`AccessType`], the PU its stream-engine ids.
pub fn gen_addr_low(
    scratchpad_id: u64,
    access: u64,
    loop_id: u64,
    stride: u64,
) -> Result<u32, EncodeError> {
    let spec = (scratchpad_id << 3) | access;
    control_word(OpCode::GenAddrLo, spec, loop_id, stride & 0xFFFF)
}

/// GENADDRHI: the high 16 bits of a stride that does not fit GENADDRLO.
pub fn gen_addr_high(
    scratchpad_id: u64,
    access: u64,
    loop_id: u64,
    stride: u64,
) -> Result<u32, EncodeError> {
    let high = stride >> 16;
    if high >= (1 << 16) {
        return Err(EncodeError::FieldOutOfRange {
            field: "stride",
            value: stride,
            bits: 32,
        });
    }
    let spec = (scratchpad_id << 3) | access;
    control_word(OpCode::GenAddrHi, spec, loop_id, high)
}

/// Second operand of a compute instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Src1 {
    /// Register or stream slot.
    Reg(u8),
    /// Signed 16-bit immediate, stored two's-complement.
    Imm(i64),
}

/// A PU compute instruction, kept structural until encoding so the
/// assembler can rewrite the tail of the program (nop fusion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeInst {
    pub fn_code: FnCode,
    pub src1: Src1,
    pub src0: u8,
    pub dest: u8,
}

impl ComputeInst {
    /// `dest = src0` (stream pop or register move).
    pub fn nop(src0: u8, dest: u8) -> Self {
        Self {
            fn_code: FnCode::Nop,
            src1: Src1::Reg(0),
            src0,
            dest,
        }
    }

    /// `dest = src0 + src1`.
    pub fn add(src0: u8, src1: u8, dest: u8) -> Self {
        Self {
            fn_code: FnCode::Add,
            src1: Src1::Reg(src1),
            src0,
            dest,
        }
    }

    /// `dest = src0 − src1`.
    pub fn sub(src0: u8, src1: u8, dest: u8) -> Self {
        Self {
            fn_code: FnCode::Sub,
            src1: Src1::Reg(src1),
            src0,
            dest,
        }
    }

    /// `dest = src0 · src1`.
    pub fn mul(src0: u8, src1: u8, dest: u8) -> Self {
        Self {
            fn_code: FnCode::Mul,
            src1: Src1::Reg(src1),
            src0,
            dest,
        }
    }

    /// `dest = max(src0, src1)`.
    pub fn max(src0: u8, src1: u8, dest: u8) -> Self {
        Self {
            fn_code: FnCode::Max,
            src1: Src1::Reg(src1),
            src0,
            dest,
        }
    }

    /// `dest = src0 · imm`.
    pub fn mul_imm(src0: u8, imm: i64, dest: u8) -> Self {
        Self {
            fn_code: FnCode::Mul,
            src1: Src1::Imm(imm),
            src0,
            dest,
        }
    }

    /// `dest = src0 >> imm` (arithmetic).
    pub fn rshift_imm(src0: u8, imm: i64, dest: u8) -> Self {
        Self {
            fn_code: FnCode::Rshift,
            src1: Src1::Imm(imm),
            src0,
            dest,
        }
    }

    /// True for a plain `dest = src0` move.
    pub fn is_nop(&self) -> bool {
        self.fn_code == FnCode::Nop
    }

    /// Pack into a 32-bit word.
    pub fn encode(&self) -> Result<u32, EncodeError> {
        let dest = check_field("dest", u64::from(self.dest), 4)?;
        let src0 = check_field("src0", u64::from(self.src0), 4)?;
        let (op_code, src1_sel, src1_field) = match self.src1 {
            Src1::Reg(r) => (OpCode::ComputeR, 0u32, check_field("src1", u64::from(r), 16)?),
            Src1::Imm(v) => {
                if !(-(1 << 15)..(1 << 15)).contains(&v) {
                    return Err(EncodeError::ImmOutOfRange { value: v });
                }
                (OpCode::ComputeI, 1u32, u32::from(v as i16 as u16))
            }
        };
        Ok(((op_code as u32) << 28)
            | (src1_sel << 27)
            | ((self.fn_code as u32) << 24)
            | (src1_field << 8)
            | (src0 << 4)
            | dest)
    }
}

/// Fields recovered from an encoded word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    Control {
        op_code: u8,
        op_spec: u8,
        loop_id: u8,
        immediate: u16,
    },
    Compute {
        op_code: u8,
        src1_sel: u8,
        fn_code: u8,
        src1: u16,
        src0: u8,
        dest: u8,
    },
}

/// Split a 32-bit word back into its fields.
pub fn decode(word: u32) -> Decoded {
    let op_code = (word >> 28) as u8;
    if op_code >= OpCode::ComputeR as u8 {
        Decoded::Compute {
            op_code,
            src1_sel: ((word >> 27) & 0x1) as u8,
            fn_code: ((word >> 24) & 0x7) as u8,
            src1: ((word >> 8) & 0xFFFF) as u16,
            src0: ((word >> 4) & 0xF) as u8,
            dest: (word & 0xF) as u8,
        }
    } else {
        Decoded::Control {
            op_code,
            op_spec: ((word >> 21) & 0x7F) as u8,
            loop_id: ((word >> 16) & 0x1F) as u8,
            immediate: (word & 0xFFFF) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_setup_16_16() {
        let word = setup(16, 16).unwrap();
        assert_eq!(word, ((OpCode::Setup as u32) << 28) | ((4 << 3 | 4) << 21));
        assert_eq!(word, 0x0480_0000);
    }

    #[test]
    fn test_block_end_last() {
        assert_eq!(block_end(true), (8 << 28) | 1);
        assert_eq!(block_end(false), 8 << 28);
    }

    #[test]
    fn test_pu_block_repeat_offset() {
        let word = pu_block_repeat(256).unwrap();
        match decode(word) {
            Decoded::Control {
                op_code, immediate, ..
            } => {
                assert_eq!(op_code, OpCode::BlockEnd as u8);
                assert_eq!(immediate, 255);
            }
            _ => panic!("expected control word"),
        }
    }

    #[test]
    fn test_base_addr_slicing() {
        // 21-bit slice: low 16 in the immediate, next 5 in loop_id.
        let addr = 0x0015_4321;
        let word = base_addr(Scratchpad::Wbuf as u64, 0, addr).unwrap();
        match decode(word) {
            Decoded::Control {
                op_code,
                op_spec,
                loop_id,
                immediate,
            } => {
                assert_eq!(op_code, OpCode::BaseAddr as u8);
                assert_eq!(op_spec, (2 << 3) | 0);
                assert_eq!(u64::from(immediate), addr & 0xFFFF);
                assert_eq!(u64::from(loop_id), (addr >> 16) & 0x1F);
            }
            _ => panic!("expected control word"),
        }
        // Bank 1 carries the next slice of the address.
        let word = base_addr(Scratchpad::Wbuf as u64, 1, addr).unwrap();
        match decode(word) {
            Decoded::Control { immediate, .. } => {
                assert_eq!(u64::from(immediate), (addr >> 21) & 0xFFFF);
            }
            _ => panic!("expected control word"),
        }
    }

    #[test]
    fn test_gen_addr_split() {
        let stride = 0x0003_0007u64;
        let lo = gen_addr_low(1, AccessType::St as u64, 5, stride).unwrap();
        let hi = gen_addr_high(1, AccessType::St as u64, 5, stride).unwrap();
        match (decode(lo), decode(hi)) {
            (
                Decoded::Control { immediate: l, .. },
                Decoded::Control { immediate: h, .. },
            ) => {
                assert_eq!(l, 0x0007);
                assert_eq!(h, 0x0003);
            }
            _ => panic!("expected control words"),
        }
    }

    #[test]
    fn test_field_overflow_is_error() {
        assert!(matches!(
            loop_inst(0, 0, 1 << 16),
            Err(EncodeError::FieldOutOfRange { .. })
        ));
        assert!(matches!(
            gen_addr_high(0, AccessType::Ld as u64, 0, 1 << 32),
            Err(EncodeError::FieldOutOfRange { .. })
        ));
        assert!(matches!(
            ldmem(Scratchpad::Ibuf as u64, 48, 1, 1),
            Err(EncodeError::BadElementWidth(48))
        ));
    }

    #[test]
    fn test_compute_encoding() {
        // dest = max(R2, R3)
        let word = ComputeInst::max(2, 3, 1).encode().unwrap();
        assert_eq!(
            word,
            ((OpCode::ComputeR as u32) << 28) | ((FnCode::Max as u32) << 24) | (3 << 8) | (2 << 4) | 1
        );
        // negative immediates are stored two's-complement
        let word = ComputeInst::mul_imm(0, -2, 1).encode().unwrap();
        match decode(word) {
            Decoded::Compute { src1_sel, src1, .. } => {
                assert_eq!(src1_sel, 1);
                assert_eq!(src1, 0xFFFE);
            }
            _ => panic!("expected compute word"),
        }
        assert!(matches!(
            ComputeInst::mul_imm(0, 1 << 15, 1).encode(),
            Err(EncodeError::ImmOutOfRange { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_control_roundtrip(
            spec in 0u64..128,
            loop_id in 0u64..32,
            imm in 0u64..(1 << 16),
        ) {
            let word = loop_inst(spec % 32, loop_id, imm)?;
            prop_assert_eq!(
                decode(word),
                Decoded::Control {
                    op_code: OpCode::Loop as u8,
                    op_spec: (spec % 32) as u8,
                    loop_id: loop_id as u8,
                    immediate: imm as u16,
                }
            );
        }

        #[test]
        fn prop_compute_roundtrip(
            src0 in 0u8..11,
            src1 in 0u8..11,
            dest in 0u8..9,
            fn_sel in 0u8..4,
        ) {
            let inst = match fn_sel {
                0 => ComputeInst::nop(src0, dest),
                1 => ComputeInst::sub(src0, src1, dest),
                2 => ComputeInst::mul(src0, src1, dest),
                _ => ComputeInst::max(src0, src1, dest),
            };
            let word = inst.encode()?;
            let Src1::Reg(r) = inst.src1 else { unreachable!() };
            prop_assert_eq!(
                decode(word),
                Decoded::Compute {
                    op_code: OpCode::ComputeR as u8,
                    src1_sel: 0,
                    fn_code: inst.fn_code as u8,
                    src1: u16::from(r),
                    src0,
                    dest,
                }
            );
        }

        #[test]
        fn prop_base_addr_slices_recombine(addr in 0u64..(1 << 42)) {
            let w0 = base_addr(Scratchpad::Ibuf as u64, 0, addr)?;
            let w1 = base_addr(Scratchpad::Ibuf as u64, 1, addr)?;
            let slice = |w: u32| match decode(w) {
                Decoded::Control { loop_id, immediate, .. } =>
                    (u64::from(loop_id) << 16) | u64::from(immediate),
                _ => unreachable!(),
            };
            prop_assert_eq!(slice(w0) | (slice(w1) << 21), addr);
        }
    }
}
