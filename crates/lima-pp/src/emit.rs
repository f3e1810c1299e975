//! Binary encoding of scheduled bundles.
//!
//! Every bundle is a fixed record of [`BUNDLE_RECORD_WORDS`] little-endian words:
//!
//! | words  | contents                                                              |
//! |--------|-----------------------------------------------------------------------|
//! | 0      | slot mask (bits 0-9), stop (10), sync (11), constant vectors (12-13)  |
//! | 1-30   | one 96-bit field per slot, in execution order                         |
//! | 31-34  | eight half-float constants, `^const0` then `^const1`                  |
//!
//! A slot field holds, from bit 0: opcode (6 bits), condition or store width (3), destination
//! code (5), write mask (4), output modifier (2), three sources of code (5), swizzle (8),
//! absolute (1) and negate (1), and finally a 16-bit index. Branch indices are signed bundle
//! offsets relative to the branching bundle.

use half::f16;
use tracing::debug;

use crate::error::CompileError;
use crate::lir::bundle::{Bundle, Slot};
use crate::lir::{LirDst, LirInstr, LirOp, LirProgram, LirSrc, LirValue, PipelineReg};
use crate::limits::{BUNDLE_RECORD_WORDS, MAX_BUNDLE_CONSTANTS, MAX_SLOT_INDEX, REGISTER_LANES};

const SLOT_WORDS: usize = 3;
const CONST_WORD: usize = 1 + SLOT_WORDS * Slot::ALL.len();

pub const SRC_CONST0: u32 = 12;
pub const SRC_CONST1: u32 = 13;
pub const SRC_UNIFORM: u32 = 14;
pub const SRC_TEXTURE: u32 = 15;
pub const SRC_NONE: u32 = 31;

/// Metadata the driver needs alongside the code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderInfo {
    pub writes_color: bool,
    /// Reads the fragment position, which includes depth.
    pub reads_depth: bool,
    pub has_discard: bool,
    pub num_bundles: usize,
    /// Size of the first bundle record, zero for an empty program.
    pub first_bundle_words: usize,
    /// Temporary storage vec4 slots, including spill slots.
    pub temp_storage_size: u32,
}

/// Writes bit fields into a fixed record, least significant bit first.
struct BitWriter<'a> {
    words: &'a mut [u32],
    bit: usize,
}

impl<'a> BitWriter<'a> {
    fn new(words: &'a mut [u32]) -> Self {
        Self { words, bit: 0 }
    }

    fn put(&mut self, value: u32, bits: usize) {
        debug_assert!(bits == 32 || value >> bits == 0, "{value:#x} does not fit {bits} bits");
        for i in 0..bits {
            if (value >> i) & 1 != 0 {
                let at = self.bit + i;
                self.words[at / 32] |= 1 << (at % 32);
            }
        }
        self.bit += bits;
    }
}

fn opcode(op: LirOp) -> u32 {
    match op {
        LirOp::Mov => 0,
        LirOp::Add => 1,
        LirOp::Mul => 2,
        LirOp::Min => 3,
        LirOp::Max => 4,
        LirOp::Floor => 5,
        LirOp::Ceil => 6,
        LirOp::Fract => 7,
        LirOp::Sign => 8,
        LirOp::Gt => 9,
        LirOp::Ge => 10,
        LirOp::Eq => 11,
        LirOp::Ne => 12,
        LirOp::Select => 13,
        LirOp::Sum3 => 14,
        LirOp::Sum4 => 15,
        LirOp::Ddx => 16,
        LirOp::Ddy => 17,
        LirOp::Rcp => 18,
        LirOp::Rsqrt => 19,
        LirOp::Sqrt => 20,
        LirOp::Exp2 => 21,
        LirOp::Log2 => 22,
        LirOp::SinLut => 23,
        LirOp::CosLut => 24,
        LirOp::AtanPt1 => 25,
        LirOp::Atan2Pt1 => 26,
        LirOp::AtanPt2 => 27,
        LirOp::LoadVarying => 28,
        LirOp::FragCoord => 29,
        LirOp::FrontFacing => 30,
        LirOp::PointCoord => 31,
        LirOp::LoadUniform => 32,
        LirOp::LoadTemp => 33,
        LirOp::Texld2d => 34,
        LirOp::Texld2dProj => 35,
        LirOp::TexldCube => 36,
        LirOp::StoreTemp { .. } => 37,
        LirOp::Branch { .. } => 38,
        LirOp::Discard => 39,
    }
}

fn value_code(value: LirValue) -> Result<u32, &'static str> {
    match value {
        LirValue::Phys(p) => Ok(u32::from(p)),
        LirValue::Pipeline(PipelineReg::Const0) => Ok(SRC_CONST0),
        LirValue::Pipeline(PipelineReg::Const1) => Ok(SRC_CONST1),
        LirValue::Pipeline(PipelineReg::Uniform) => Ok(SRC_UNIFORM),
        LirValue::Pipeline(PipelineReg::Texture) => Ok(SRC_TEXTURE),
        LirValue::Reg(_) => Err("virtual register left after allocation"),
        LirValue::Const(_) => Err("constant operand outside the bundle constants"),
    }
}

fn put_dst(w: &mut BitWriter<'_>, dst: Option<&LirDst>) -> Result<(), &'static str> {
    match dst {
        Some(d) => {
            w.put(value_code(d.value)?, 5);
            w.put(u32::from(d.mask.bits()), 4);
            w.put(d.modifier as u32, 2);
        }
        None => {
            w.put(SRC_NONE, 5);
            w.put(0, 6);
        }
    }
    Ok(())
}

fn put_src(w: &mut BitWriter<'_>, src: Option<&LirSrc>) -> Result<(), &'static str> {
    let Some(src) = src else {
        w.put(SRC_NONE, 5);
        w.put(0, 10);
        return Ok(());
    };
    w.put(value_code(src.value)?, 5);
    for lane in 0..REGISTER_LANES {
        w.put(u32::from(src.swizzle.component(lane) & 3), 2);
    }
    w.put(u32::from(src.absolute), 1);
    w.put(u32::from(src.negate), 1);
    Ok(())
}

fn put_instr(words: &mut [u32], instr: &LirInstr, index: u32) -> Result<(), &'static str> {
    if instr.srcs.len() > 3 {
        return Err("more than three sources");
    }
    let mut w = BitWriter::new(words);
    w.put(opcode(instr.op), 6);
    let extra = match instr.op {
        LirOp::Branch { cond } => cond.code(),
        LirOp::StoreTemp { width } => u32::from(width.saturating_sub(1)),
        _ => 0,
    };
    w.put(extra, 3);
    put_dst(&mut w, instr.dst.as_ref())?;
    for k in 0..3 {
        put_src(&mut w, instr.srcs.get(k))?;
    }
    w.put(index, 16);
    Ok(())
}

fn encode_bundle(
    bundle: &Bundle,
    bundle_at: usize,
    block_start: &[usize],
) -> Result<[u32; BUNDLE_RECORD_WORDS], &'static str> {
    bundle.validate()?;
    let mut words = [0u32; BUNDLE_RECORD_WORDS];

    let consts = bundle.consts();
    let const_vectors = consts.iter().rposition(|c| !c.is_empty()).map_or(0, |k| k + 1);
    words[0] = u32::from(bundle.occupied().bits())
        | u32::from(bundle.stop) << 10
        | u32::from(bundle.sync) << 11
        | (const_vectors as u32) << 12;

    for (slot, instr) in bundle.slotted() {
        let index = match instr.op {
            LirOp::Branch { .. } => {
                let target = *block_start
                    .get(instr.index as usize)
                    .ok_or("branch to a missing block")?;
                let offset = target as i64 - bundle_at as i64;
                let offset = i16::try_from(offset).map_err(|_| "branch offset out of range")?;
                u32::from(offset as u16)
            }
            _ if instr.index > MAX_SLOT_INDEX => return Err("index out of range"),
            _ => instr.index,
        };
        let at = 1 + slot.index() * SLOT_WORDS;
        put_instr(&mut words[at..at + SLOT_WORDS], instr, index)?;
    }

    let mut w = BitWriter::new(&mut words[CONST_WORD..]);
    for c in consts.iter().take(MAX_BUNDLE_CONSTANTS) {
        for lane in 0..REGISTER_LANES as usize {
            let v = c.get(lane).copied().unwrap_or(0.0);
            w.put(u32::from(f16::from_f32(v).to_bits()), 16);
        }
    }
    Ok(words)
}

/// Encodes all bundles of a scheduled, allocated program in block order.
pub fn encode(program: &LirProgram) -> Result<(Vec<u32>, ShaderInfo), CompileError> {
    let mut block_start = Vec::with_capacity(program.blocks.len() + 1);
    let mut at = 0;
    for block in &program.blocks {
        block_start.push(at);
        at += block.bundles.len();
    }
    block_start.push(at);

    let mut words = Vec::with_capacity(at * BUNDLE_RECORD_WORDS);
    let mut info = ShaderInfo {
        num_bundles: at,
        first_bundle_words: if at > 0 { BUNDLE_RECORD_WORDS } else { 0 },
        temp_storage_size: program.temp_size,
        ..Default::default()
    };
    for (b, block) in program.blocks.iter().enumerate() {
        info.writes_color |= block.output.is_some();
        for (k, bundle) in block.bundles.iter().enumerate() {
            for instr in bundle.instrs() {
                info.reads_depth |= instr.op == LirOp::FragCoord;
                info.has_discard |= instr.op == LirOp::Discard;
            }
            let record = encode_bundle(bundle, block_start[b] + k, &block_start).map_err(|reason| {
                CompileError::InvalidBundle {
                    block: b,
                    bundle: k,
                    reason,
                }
            })?;
            words.extend_from_slice(&record);
        }
    }
    debug!(bundles = at, words = words.len(), "encoded shader");
    Ok((words, info))
}
