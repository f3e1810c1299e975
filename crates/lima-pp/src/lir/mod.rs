//! Register-level IR ("LIR"): machine operations bound to functional units, reading and writing
//! lanes of virtual vec4 registers. After register allocation the same structure holds physical
//! registers, and after bundle scheduling every block also carries its bundles.

pub mod bundle;
pub mod dce;
pub mod deps;
pub mod interp;
pub mod sched_bundle;
pub mod sched_pressure;
pub mod select;

use core::fmt;

use crate::types::{BranchCond, OutputModifier, Swizzle, WriteMask};
use bundle::Bundle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegId(pub u32);

/// Registers that forward a unit's result to later units of the same bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineReg {
    /// Result of the uniform/temporary load unit.
    Uniform,
    /// Result of the texture unit.
    Texture,
    /// Constant vectors embedded in the bundle.
    Const0,
    Const1,
}

impl PipelineReg {
    pub fn name(self) -> &'static str {
        match self {
            PipelineReg::Uniform => "^uniform",
            PipelineReg::Texture => "^texture",
            PipelineReg::Const0 => "^const0",
            PipelineReg::Const1 => "^const1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LirValue {
    Reg(RegId),
    /// Physical register, after allocation.
    Phys(u8),
    Pipeline(PipelineReg),
    /// Constant, until the bundle scheduler moves it into a bundle constant slot.
    Const([f32; 4]),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LirSrc {
    pub value: LirValue,
    pub swizzle: Swizzle,
    pub absolute: bool,
    pub negate: bool,
}

impl LirSrc {
    pub fn new(value: LirValue) -> Self {
        Self {
            value,
            swizzle: Swizzle::IDENTITY,
            absolute: false,
            negate: false,
        }
    }

    pub fn reg(reg: RegId) -> Self {
        Self::new(LirValue::Reg(reg))
    }

    pub fn pipeline(reg: PipelineReg) -> Self {
        Self::new(LirValue::Pipeline(reg))
    }

    pub fn with_swizzle(mut self, swizzle: Swizzle) -> Self {
        self.swizzle = swizzle;
        self
    }

    pub fn has_modifiers(&self) -> bool {
        self.absolute || self.negate
    }

    pub fn reg_id(&self) -> Option<RegId> {
        match self.value {
            LirValue::Reg(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LirDst {
    pub value: LirValue,
    pub mask: WriteMask,
    pub modifier: OutputModifier,
}

impl LirDst {
    pub fn reg(reg: RegId, mask: WriteMask) -> Self {
        Self {
            value: LirValue::Reg(reg),
            mask,
            modifier: OutputModifier::None,
        }
    }

    pub fn pipeline(reg: PipelineReg) -> Self {
        Self {
            value: LirValue::Pipeline(reg),
            mask: WriteMask::XYZW,
            modifier: OutputModifier::None,
        }
    }
}

/// Functional unit class an operation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Varying,
    Texture,
    Uniform,
    Mul,
    Add,
    /// Moves run on any ALU.
    Alu,
    /// Horizontal reductions need the vector adder.
    VectorAdd,
    Combine,
    Store,
    Branch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LirOp {
    Mov,
    Add,
    Mul,
    Min,
    Max,
    Floor,
    Ceil,
    Fract,
    Sign,
    Gt,
    Ge,
    Eq,
    Ne,
    Select,
    Sum3,
    Sum4,
    Ddx,
    Ddy,
    Rcp,
    Rsqrt,
    Sqrt,
    Exp2,
    Log2,
    SinLut,
    CosLut,
    AtanPt1,
    Atan2Pt1,
    AtanPt2,
    LoadVarying,
    FragCoord,
    FrontFacing,
    PointCoord,
    LoadUniform,
    LoadTemp,
    Texld2d,
    Texld2dProj,
    TexldCube,
    /// Stores the first `width` lanes of its source to temporary storage.
    StoreTemp { width: u8 },
    /// Branches to the block numbered by the instruction's index when the condition holds.
    Branch { cond: BranchCond },
    Discard,
}

impl LirOp {
    pub fn name(self) -> &'static str {
        match self {
            LirOp::Mov => "mov",
            LirOp::Add => "add",
            LirOp::Mul => "mul",
            LirOp::Min => "min",
            LirOp::Max => "max",
            LirOp::Floor => "floor",
            LirOp::Ceil => "ceil",
            LirOp::Fract => "fract",
            LirOp::Sign => "sign",
            LirOp::Gt => "gt",
            LirOp::Ge => "ge",
            LirOp::Eq => "eq",
            LirOp::Ne => "ne",
            LirOp::Select => "select",
            LirOp::Sum3 => "sum3",
            LirOp::Sum4 => "sum4",
            LirOp::Ddx => "ddx",
            LirOp::Ddy => "ddy",
            LirOp::Rcp => "rcp",
            LirOp::Rsqrt => "rsqrt",
            LirOp::Sqrt => "sqrt",
            LirOp::Exp2 => "exp2",
            LirOp::Log2 => "log2",
            LirOp::SinLut => "sin_lut",
            LirOp::CosLut => "cos_lut",
            LirOp::AtanPt1 => "atan_pt1",
            LirOp::Atan2Pt1 => "atan2_pt1",
            LirOp::AtanPt2 => "atan_pt2",
            LirOp::LoadVarying => "load_varying",
            LirOp::FragCoord => "frag_coord",
            LirOp::FrontFacing => "front_facing",
            LirOp::PointCoord => "point_coord",
            LirOp::LoadUniform => "load_uniform",
            LirOp::LoadTemp => "load_temp",
            LirOp::Texld2d => "texld_2d",
            LirOp::Texld2dProj => "texld_2d_proj",
            LirOp::TexldCube => "texld_cube",
            LirOp::StoreTemp { .. } => "store_temp",
            LirOp::Branch { .. } => "branch",
            LirOp::Discard => "discard",
        }
    }

    pub fn unit(self) -> Unit {
        match self {
            LirOp::Mov => Unit::Alu,
            LirOp::Mul | LirOp::Select => Unit::Mul,
            LirOp::Add
            | LirOp::Min
            | LirOp::Max
            | LirOp::Floor
            | LirOp::Ceil
            | LirOp::Fract
            | LirOp::Sign
            | LirOp::Gt
            | LirOp::Ge
            | LirOp::Eq
            | LirOp::Ne
            | LirOp::Ddx
            | LirOp::Ddy => Unit::Add,
            LirOp::Sum3 | LirOp::Sum4 => Unit::VectorAdd,
            LirOp::Rcp
            | LirOp::Rsqrt
            | LirOp::Sqrt
            | LirOp::Exp2
            | LirOp::Log2
            | LirOp::SinLut
            | LirOp::CosLut
            | LirOp::AtanPt1
            | LirOp::Atan2Pt1
            | LirOp::AtanPt2 => Unit::Combine,
            LirOp::LoadVarying | LirOp::FragCoord | LirOp::FrontFacing | LirOp::PointCoord => {
                Unit::Varying
            }
            LirOp::LoadUniform | LirOp::LoadTemp => Unit::Uniform,
            LirOp::Texld2d | LirOp::Texld2dProj | LirOp::TexldCube => Unit::Texture,
            LirOp::StoreTemp { .. } => Unit::Store,
            LirOp::Branch { .. } | LirOp::Discard => Unit::Branch,
        }
    }

    /// Lane `i` of the result is computed from position `i` of every source.
    pub fn is_lanewise(self) -> bool {
        matches!(
            self,
            LirOp::Mov
                | LirOp::Add
                | LirOp::Mul
                | LirOp::Min
                | LirOp::Max
                | LirOp::Floor
                | LirOp::Ceil
                | LirOp::Fract
                | LirOp::Sign
                | LirOp::Gt
                | LirOp::Ge
                | LirOp::Eq
                | LirOp::Ne
                | LirOp::Select
                | LirOp::Ddx
                | LirOp::Ddy
                | LirOp::Rcp
                | LirOp::Rsqrt
                | LirOp::Sqrt
                | LirOp::Exp2
                | LirOp::Log2
                | LirOp::SinLut
                | LirOp::CosLut
        )
    }

    /// Combine-unit operations producing more than one lane; they occupy the scalar multiplier
    /// as well.
    pub fn is_vector_combine(self) -> bool {
        matches!(self, LirOp::AtanPt1 | LirOp::Atan2Pt1)
    }

    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            LirOp::StoreTemp { .. } | LirOp::Branch { .. } | LirOp::Discard
        )
    }

    pub fn reads_memory(self) -> bool {
        self == LirOp::LoadTemp
    }

    pub fn is_texture(self) -> bool {
        matches!(self, LirOp::Texld2d | LirOp::Texld2dProj | LirOp::TexldCube)
    }

    /// Positions read by source `index` for operations that do not follow the write mask.
    fn fixed_positions(self, index: usize) -> u8 {
        match self {
            LirOp::Sum3 | LirOp::AtanPt2 | LirOp::Texld2dProj | LirOp::TexldCube => 0b0111,
            LirOp::Sum4 => 0b1111,
            LirOp::Texld2d => 0b0011,
            LirOp::StoreTemp { width } if index == 0 => WriteMask::for_width(width).bits(),
            _ => 0b0001,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LirInstr {
    pub op: LirOp,
    pub dst: Option<LirDst>,
    pub srcs: Vec<LirSrc>,
    /// Uniform, varying or sampler number, temporary address, or branch target block.
    pub index: u32,
}

impl LirInstr {
    pub fn new(op: LirOp, dst: Option<LirDst>, srcs: Vec<LirSrc>) -> Self {
        Self {
            op,
            dst,
            srcs,
            index: 0,
        }
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn mov(dst: LirDst, src: LirSrc) -> Self {
        Self::new(LirOp::Mov, Some(dst), vec![src])
    }

    /// Bitmask of the source positions read by source `index`.
    pub fn read_positions(&self, index: usize) -> u8 {
        match (self.op.is_lanewise(), &self.dst) {
            (true, Some(dst)) => dst.mask.bits(),
            _ => self.op.fixed_positions(index),
        }
    }

    /// Bitmask of the components of its value that source `index` reads.
    pub fn read_lanes(&self, index: usize) -> u8 {
        let positions = self.read_positions(index);
        let swizzle = self.srcs[index].swizzle;
        (0..4u8)
            .filter(|p| positions & (1 << p) != 0)
            .fold(0, |m, p| m | 1 << (swizzle.component(p) & 3))
    }

    pub fn dst_reg(&self) -> Option<RegId> {
        match self.dst {
            Some(LirDst {
                value: LirValue::Reg(r),
                ..
            }) => Some(r),
            _ => None,
        }
    }

    /// A move that only copies lanes between virtual registers, with no modifier.
    pub fn is_plain_move(&self) -> bool {
        self.op == LirOp::Mov
            && self.dst_reg().is_some()
            && self.dst.is_some_and(|d| d.modifier == OutputModifier::None)
            && self.srcs[0].reg_id().is_some()
            && !self.srcs[0].has_modifiers()
    }

    pub fn reads_pipeline(&self, reg: PipelineReg) -> bool {
        self.srcs
            .iter()
            .any(|s| s.value == LirValue::Pipeline(reg))
    }
}

/// Virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VReg {
    pub width: u8,
    /// Must be placed starting at lane 0 of a physical register.
    pub aligned: bool,
    pub precolor: Option<u8>,
    /// Short-lived register created by spilling; never spilled itself.
    pub spill_temp: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LirBlock {
    pub instrs: Vec<LirInstr>,
    pub bundles: Vec<Bundle>,
    /// Register holding the fragment colour when the block ends the shader with an output.
    pub output: Option<RegId>,
    /// The shader ends after this block.
    pub stop: bool,
}

impl LirBlock {
    /// Ends with an unconditional jump, discard or stop: control never falls into the next block.
    pub fn falls_through(&self) -> bool {
        if self.stop {
            return false;
        }
        !matches!(
            self.instrs.last().map(|i| i.op),
            Some(LirOp::Branch {
                cond: BranchCond::Always
            }) | Some(LirOp::Discard)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LirProgram {
    pub blocks: Vec<LirBlock>,
    pub regs: Vec<VReg>,
    pub temp_size: u32,
    /// Operands name physical registers; the fragment colour is read from the output register.
    pub allocated: bool,
}

impl LirProgram {
    pub fn new_reg(&mut self, width: u8, aligned: bool) -> RegId {
        let id = RegId(self.regs.len() as u32);
        self.regs.push(VReg {
            width,
            aligned,
            precolor: None,
            spill_temp: false,
        });
        id
    }

    pub fn reg(&self, r: RegId) -> &VReg {
        &self.regs[r.0 as usize]
    }

    pub fn successors(&self, block: usize) -> Vec<usize> {
        let b = &self.blocks[block];
        let mut succs = Vec::new();
        if let Some(LirInstr {
            op: LirOp::Branch { .. },
            index,
            ..
        }) = b.instrs.last()
        {
            succs.push(*index as usize);
        }
        if b.falls_through() && block + 1 < self.blocks.len() {
            succs.push(block + 1);
        }
        succs
    }

    pub fn num_instrs(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    pub fn num_bundles(&self) -> usize {
        self.blocks.iter().map(|b| b.bundles.len()).sum()
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &LirValue) -> fmt::Result {
    match value {
        LirValue::Reg(r) => write!(f, "%{}", r.0),
        LirValue::Phys(p) => write!(f, "$r{p}"),
        LirValue::Pipeline(p) => f.write_str(p.name()),
        LirValue::Const(c) => write!(f, "({}, {}, {}, {})", c[0], c[1], c[2], c[3]),
    }
}

impl fmt::Display for LirInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dst) = &self.dst {
            write_value(f, &dst.value)?;
            write!(f, ".{} = ", dst.mask)?;
        }
        f.write_str(self.op.name())?;
        if let Some(dst) = &self.dst {
            f.write_str(dst.modifier.suffix())?;
        }
        if let LirOp::Branch { cond } = self.op {
            write!(f, ".{} -> {}", cond.name(), self.index)?;
        } else if self.index != 0 {
            write!(f, " [{}]", self.index)?;
        }
        for (i, src) in self.srcs.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            if src.negate {
                f.write_str("-")?;
            }
            if src.absolute {
                f.write_str("|")?;
            }
            write_value(f, &src.value)?;
            if src.absolute {
                f.write_str("|")?;
            }
            if src.swizzle != Swizzle::IDENTITY {
                write!(f, ".{}", src.swizzle)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for LirProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, block) in self.blocks.iter().enumerate() {
            writeln!(f, "block {i}{}:", if block.stop { " (stop)" } else { "" })?;
            if block.bundles.is_empty() {
                for instr in &block.instrs {
                    writeln!(f, "  {instr}")?;
                }
                continue;
            }
            for (n, bundle) in block.bundles.iter().enumerate() {
                writeln!(f, "  bundle {n}{}", bundle.flags_suffix())?;
                for instr in bundle.instrs() {
                    writeln!(f, "    {instr}")?;
                }
            }
        }
        Ok(())
    }
}
