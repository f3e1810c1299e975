//! Instruction selection: HIR in conventional SSA form to LIR.
//!
//! Every value gets a virtual register; a phi shares one register with all of its sources (the
//! per-predecessor copies CSSA inserted), which turns those copies into plain register writes.
//! Loads from the uniform and texture units land in pipeline registers and are copied out by a
//! move that must execute in the same bundle.

use hashbrown::HashMap;
use tracing::debug;

use crate::error::CompileError;
use crate::hir::op::Op;
use crate::hir::{BlockEnd, BlockId, CmdId, Program, Src, Value};
use crate::limits::OUTPUT_REGISTER;
use crate::types::{BranchCond, Swizzle, WriteMask};

use super::{LirBlock, LirDst, LirInstr, LirOp, LirProgram, LirSrc, LirValue, PipelineReg, RegId};

fn lir_op(op: Op) -> Option<LirOp> {
    Some(match op {
        Op::Mov => LirOp::Mov,
        Op::Add => LirOp::Add,
        Op::Mul => LirOp::Mul,
        Op::Min => LirOp::Min,
        Op::Max => LirOp::Max,
        Op::Floor => LirOp::Floor,
        Op::Ceil => LirOp::Ceil,
        Op::Fract => LirOp::Fract,
        Op::Sign => LirOp::Sign,
        Op::Gt => LirOp::Gt,
        Op::Ge => LirOp::Ge,
        Op::Eq => LirOp::Eq,
        Op::Ne => LirOp::Ne,
        Op::Select => LirOp::Select,
        Op::Sum3 => LirOp::Sum3,
        Op::Sum4 => LirOp::Sum4,
        Op::Ddx => LirOp::Ddx,
        Op::Ddy => LirOp::Ddy,
        Op::Rcp => LirOp::Rcp,
        Op::Rsqrt => LirOp::Rsqrt,
        Op::Sqrt => LirOp::Sqrt,
        Op::Exp2 => LirOp::Exp2,
        Op::Log2 => LirOp::Log2,
        Op::SinLut => LirOp::SinLut,
        Op::CosLut => LirOp::CosLut,
        Op::AtanPt1 => LirOp::AtanPt1,
        Op::Atan2Pt1 => LirOp::Atan2Pt1,
        Op::AtanPt2 => LirOp::AtanPt2,
        Op::LoadVarying => LirOp::LoadVarying,
        Op::FragCoord => LirOp::FragCoord,
        Op::FrontFacing => LirOp::FrontFacing,
        Op::PointCoord => LirOp::PointCoord,
        Op::LoadUniform => LirOp::LoadUniform,
        Op::LoadTemp => LirOp::LoadTemp,
        Op::Texld2d => LirOp::Texld2d,
        Op::Texld2dProj => LirOp::Texld2dProj,
        Op::TexldCube => LirOp::TexldCube,
        _ => return None,
    })
}

/// Union-find over commands joined through phis.
struct Webs {
    parent: HashMap<CmdId, CmdId>,
}

impl Webs {
    fn find(&mut self, c: CmdId) -> CmdId {
        let mut root = c;
        while let Some(&p) = self.parent.get(&root) {
            if p == root {
                break;
            }
            root = p;
        }
        let mut cur = c;
        while cur != root {
            let next = self.parent.get(&cur).copied().unwrap_or(root);
            self.parent.insert(cur, root);
            cur = next;
        }
        root
    }

    fn union(&mut self, a: CmdId, b: CmdId) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent.insert(rb, ra);
        }
    }
}

struct Selector<'a> {
    hir: &'a Program,
    lir: LirProgram,
    regs: HashMap<CmdId, RegId>,
    block_index: HashMap<BlockId, usize>,
}

pub fn select(hir: &Program) -> Result<LirProgram, CompileError> {
    let layout = hir.layout();

    let mut webs = Webs {
        parent: HashMap::new(),
    };
    for &b in layout {
        for &phi in hir.block(b).phis() {
            for src in hir.cmd(phi).srcs() {
                if let Value::Cmd(c) = src.value {
                    webs.union(phi, c);
                }
            }
        }
    }

    let mut sel = Selector {
        hir,
        lir: LirProgram {
            temp_size: hir.temp_size,
            ..Default::default()
        },
        regs: HashMap::new(),
        block_index: HashMap::new(),
    };

    let mut web_regs: HashMap<CmdId, RegId> = HashMap::new();
    for &b in layout {
        for c in hir.block_cmds(b) {
            let cmd = hir.cmd(c);
            if !cmd.op.info().has_dest {
                continue;
            }
            let root = webs.find(c);
            let reg = match web_regs.get(&root) {
                Some(&r) => r,
                None => {
                    let r = sel.lir.new_reg(cmd.dst.width, false);
                    web_regs.insert(root, r);
                    r
                }
            };
            sel.regs.insert(c, reg);
        }
    }

    let trampolines: Vec<bool> = layout
        .iter()
        .enumerate()
        .map(|(i, &b)| needs_trampoline(hir.block(b).end(), layout.get(i + 1).copied()))
        .collect();
    let mut next = 0;
    for (&b, &tramp) in layout.iter().zip(&trampolines) {
        sel.block_index.insert(b, next);
        next += 1 + usize::from(tramp);
    }

    for (i, &b) in layout.iter().enumerate() {
        let mut block = LirBlock::default();
        for &c in hir.block(b).cmds() {
            sel.lower_cmd(c, &mut block.instrs)?;
        }
        let next = layout.get(i + 1).copied();
        let trampoline = sel.lower_end(hir.block(b).end(), next, &mut block);
        sel.lir.blocks.push(block);
        if let Some(target) = trampoline {
            let jump = LirInstr::new(
                LirOp::Branch {
                    cond: BranchCond::Always,
                },
                None,
                Vec::new(),
            )
            .with_index(target as u32);
            sel.lir.blocks.push(LirBlock {
                instrs: vec![jump],
                ..Default::default()
            });
        }
    }

    debug!(
        blocks = sel.lir.blocks.len(),
        regs = sel.lir.regs.len(),
        instrs = sel.lir.num_instrs(),
        "selected instructions"
    );
    Ok(sel.lir)
}

/// A conditional branch needs an extra jump block when neither successor follows it.
fn needs_trampoline(end: &BlockEnd, next: Option<BlockId>) -> bool {
    match *end {
        BlockEnd::Branch {
            cond,
            taken,
            not_taken,
            ..
        } => {
            cond != BranchCond::Always
                && taken != not_taken
                && Some(taken) != next
                && Some(not_taken) != next
        }
        _ => false,
    }
}

impl Selector<'_> {
    fn reg(&self, c: CmdId) -> RegId {
        self.regs[&c]
    }

    fn src(&self, src: &Src) -> LirSrc {
        let value = match src.value {
            Value::Cmd(c) => LirValue::Reg(self.reg(c)),
            Value::Const(v) => LirValue::Const(v),
        };
        LirSrc {
            value,
            swizzle: src.swizzle,
            absolute: src.absolute,
            negate: src.negate,
        }
    }

    /// Source read positionally from lane 0 by a load/store/texture unit: an unmodified register
    /// placed at lane 0, read with the identity swizzle.
    fn aligned_src(&mut self, src: &Src, width: u8, out: &mut Vec<LirInstr>) -> LirSrc {
        if let Value::Cmd(c) = src.value {
            if !src.has_modifiers() && src.swizzle.is_identity_for(width) {
                let reg = self.reg(c);
                self.lir.regs[reg.0 as usize].aligned = true;
                return LirSrc::reg(reg);
            }
        }
        let tmp = self.lir.new_reg(width, true);
        out.push(LirInstr::mov(
            LirDst::reg(tmp, WriteMask::for_width(width)),
            self.src(src),
        ));
        LirSrc::reg(tmp)
    }

    /// Scalar source without modifiers, for units that cannot apply them.
    fn plain_scalar(&mut self, src: &Src, out: &mut Vec<LirInstr>) -> LirSrc {
        if !src.has_modifiers() {
            return self.src(src);
        }
        let tmp = self.lir.new_reg(1, false);
        out.push(LirInstr::mov(LirDst::reg(tmp, WriteMask::X), self.src(src)));
        LirSrc::reg(tmp)
    }

    /// Copies a pipeline register into the command's register.
    fn pipeline_load(&mut self, c: CmdId, load: LirInstr, reg: PipelineReg, out: &mut Vec<LirInstr>) {
        let cmd = self.hir.cmd(c);
        out.push(load);
        out.push(LirInstr::mov(
            LirDst::reg(self.reg(c), WriteMask::for_width(cmd.dst.width)),
            LirSrc::pipeline(reg),
        ));
    }

    fn lower_cmd(&mut self, c: CmdId, out: &mut Vec<LirInstr>) -> Result<(), CompileError> {
        let hir = self.hir;
        let cmd = hir.cmd(c);
        let width = cmd.dst.width;
        match cmd.op {
            Op::Phi => {}
            Op::Combine => {
                let reg = self.reg(c);
                for (lane, s) in cmd.srcs().iter().enumerate() {
                    let src = self.src(s).with_swizzle(Swizzle::splat(s.swizzle.component(0)));
                    out.push(LirInstr::mov(LirDst::reg(reg, WriteMask::lane(lane as u8)), src));
                }
            }
            Op::LoadUniform => {
                let load = LirInstr::new(
                    LirOp::LoadUniform,
                    Some(LirDst::pipeline(PipelineReg::Uniform)),
                    Vec::new(),
                )
                .with_index(cmd.index);
                self.pipeline_load(c, load, PipelineReg::Uniform, out);
            }
            Op::LoadTemp => {
                let offset = match cmd.srcs().first() {
                    Some(s) => vec![self.plain_scalar(s, out)],
                    None => Vec::new(),
                };
                let load = LirInstr::new(
                    LirOp::LoadTemp,
                    Some(LirDst::pipeline(PipelineReg::Uniform)),
                    offset,
                )
                .with_index(cmd.index);
                self.pipeline_load(c, load, PipelineReg::Uniform, out);
            }
            Op::Texld2d | Op::Texld2dProj | Op::TexldCube => {
                let coords_width = cmd.op.arg_width(0, width, 4);
                let coords = self.aligned_src(&cmd.srcs()[0], coords_width, out);
                let op = lir_op(cmd.op).ok_or(CompileError::UnsupportedOp {
                    op: cmd.op.name(),
                    width,
                })?;
                let load = LirInstr::new(op, Some(LirDst::pipeline(PipelineReg::Texture)), vec![coords])
                    .with_index(cmd.index);
                self.pipeline_load(c, load, PipelineReg::Texture, out);
            }
            Op::StoreTemp => {
                let value = self.aligned_src(&cmd.srcs()[0], width, out);
                let mut srcs = vec![value];
                if let Some(offset) = cmd.srcs().get(1) {
                    srcs.push(self.plain_scalar(offset, out));
                }
                out.push(
                    LirInstr::new(LirOp::StoreTemp { width }, None, srcs).with_index(cmd.index),
                );
            }
            op => {
                let lop = lir_op(op)
                    .filter(|_| !(op.is_scalar_only() && width > 1))
                    .ok_or(CompileError::UnsupportedOp {
                        op: op.name(),
                        width,
                    })?;
                let reg = self.reg(c);
                // Units writing a fixed lane range need their result at lane 0.
                let positional = matches!(
                    lop,
                    LirOp::AtanPt1
                        | LirOp::Atan2Pt1
                        | LirOp::LoadVarying
                        | LirOp::FragCoord
                        | LirOp::FrontFacing
                        | LirOp::PointCoord
                );
                if positional {
                    self.lir.regs[reg.0 as usize].aligned = true;
                }
                let srcs = cmd.srcs().iter().map(|s| self.src(s)).collect();
                let dst = LirDst {
                    value: LirValue::Reg(reg),
                    mask: WriteMask::for_width(width),
                    modifier: cmd.dst.modifier,
                };
                out.push(LirInstr::new(lop, Some(dst), srcs).with_index(cmd.index));
            }
        }
        Ok(())
    }

    /// Lowers a block end; returns the target of a trampoline jump to emit right after the
    /// block.
    fn lower_end(&mut self, end: &BlockEnd, next: Option<BlockId>, block: &mut LirBlock) -> Option<usize> {
        let jump = |target: usize| {
            LirInstr::new(
                LirOp::Branch {
                    cond: BranchCond::Always,
                },
                None,
                Vec::new(),
            )
            .with_index(target as u32)
        };
        match *end {
            BlockEnd::Jump(t) => {
                if Some(t) != next {
                    block.instrs.push(jump(self.block_index[&t]));
                }
                None
            }
            BlockEnd::Branch {
                cond,
                srcs,
                taken,
                not_taken,
            } => {
                if cond == BranchCond::Always || taken == not_taken {
                    if Some(taken) != next {
                        block.instrs.push(jump(self.block_index[&taken]));
                    }
                    return None;
                }
                let a = self.plain_scalar(&srcs[0], &mut block.instrs);
                let b = self.plain_scalar(&srcs[1], &mut block.instrs);
                let (cond, target, trampoline) = if Some(not_taken) == next {
                    (cond, taken, None)
                } else if Some(taken) == next {
                    (cond.invert(), not_taken, None)
                } else {
                    (cond, taken, Some(self.block_index[&not_taken]))
                };
                block.instrs.push(
                    LirInstr::new(LirOp::Branch { cond }, None, vec![a, b])
                        .with_index(self.block_index[&target] as u32),
                );
                trampoline
            }
            BlockEnd::Output(src) => {
                let out = self.lir.new_reg(4, true);
                self.lir.regs[out.0 as usize].precolor = Some(OUTPUT_REGISTER);
                block
                    .instrs
                    .push(LirInstr::mov(LirDst::reg(out, WriteMask::XYZW), self.src(&src)));
                block.output = Some(out);
                block.stop = true;
                None
            }
            BlockEnd::Discard => {
                block
                    .instrs
                    .push(LirInstr::new(LirOp::Discard, None, Vec::new()));
                block.stop = true;
                None
            }
        }
    }
}
