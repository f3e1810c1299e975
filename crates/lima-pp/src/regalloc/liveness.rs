//! Per-lane liveness of virtual registers over the LIR control-flow graph.

use crate::bitset::BitSet;
use crate::lir::{LirInstr, LirProgram, RegId};

/// Bit index of `lane` of register `reg`.
pub fn lane_bit(reg: RegId, lane: u8) -> usize {
    reg.0 as usize * 4 + lane as usize
}

/// Register lanes an instruction reads.
pub fn reg_uses(instr: &LirInstr) -> impl Iterator<Item = (RegId, u8)> + '_ {
    instr
        .srcs
        .iter()
        .enumerate()
        .filter_map(|(k, s)| s.reg_id().map(|r| (r, instr.read_lanes(k))))
}

/// Register lanes an instruction writes.
pub fn reg_def(instr: &LirInstr) -> Option<(RegId, u8)> {
    let dst = instr.dst?;
    instr.dst_reg().map(|r| (r, dst.mask.bits()))
}

fn set_lanes(set: &mut BitSet, reg: RegId, lanes: u8) {
    for l in 0..4 {
        if lanes & (1 << l) != 0 {
            set.insert(lane_bit(reg, l));
        }
    }
}

fn clear_lanes(set: &mut BitSet, reg: RegId, lanes: u8) {
    for l in 0..4 {
        if lanes & (1 << l) != 0 {
            set.remove(lane_bit(reg, l));
        }
    }
}

/// Updates `live` from after `instr` to before it.
pub fn step_back(live: &mut BitSet, instr: &LirInstr) {
    if let Some((r, lanes)) = reg_def(instr) {
        clear_lanes(live, r, lanes);
    }
    for (r, lanes) in reg_uses(instr) {
        set_lanes(live, r, lanes);
    }
}

#[derive(Debug, Clone)]
pub struct Liveness {
    live_in: Vec<BitSet>,
    live_out: Vec<BitSet>,
}

impl Liveness {
    pub fn compute(program: &LirProgram) -> Self {
        let bits = program.regs.len() * 4;
        let n = program.blocks.len();
        let succs: Vec<Vec<usize>> = (0..n).map(|b| program.successors(b)).collect();

        // Upward-exposed uses and definitions per block.
        let mut exposed = vec![BitSet::new(bits); n];
        let mut kill = vec![BitSet::new(bits); n];
        let mut exit = vec![BitSet::new(bits); n];
        for (b, block) in program.blocks.iter().enumerate() {
            if let Some(out) = block.output {
                set_lanes(&mut exit[b], out, 0b1111);
            }
            for instr in block.instrs.iter().rev() {
                if let Some((r, lanes)) = reg_def(instr) {
                    clear_lanes(&mut exposed[b], r, lanes);
                    set_lanes(&mut kill[b], r, lanes);
                }
                for (r, lanes) in reg_uses(instr) {
                    set_lanes(&mut exposed[b], r, lanes);
                }
            }
        }

        let mut live_in = vec![BitSet::new(bits); n];
        let mut live_out = exit;
        let mut changed = true;
        while changed {
            changed = false;
            for b in (0..n).rev() {
                for &s in &succs[b] {
                    let incoming = live_in[s].clone();
                    changed |= live_out[b].union_with(&incoming);
                }
                let mut next = live_out[b].clone();
                next.subtract(&kill[b]);
                next.union_with(&exposed[b]);
                if next != live_in[b] {
                    live_in[b] = next;
                    changed = true;
                }
            }
        }
        Self { live_in, live_out }
    }

    pub fn live_in(&self, block: usize) -> &BitSet {
        &self.live_in[block]
    }

    pub fn live_out(&self, block: usize) -> &BitSet {
        &self.live_out[block]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{LirBlock, LirDst, LirOp, LirSrc, LirValue};
    use crate::types::{BranchCond, Swizzle, WriteMask};

    #[test]
    fn loop_carried_lane_is_live_around_the_back_edge() {
        // b0: v.x = 0
        // b1: v.x = v.x + 1; if v.x < 4 goto b1
        // b2: out = v.xxxx
        let mut p = LirProgram::default();
        let v = p.new_reg(2, false);
        let out = p.new_reg(4, true);
        p.blocks.push(LirBlock {
            instrs: vec![LirInstr::mov(
                LirDst::reg(v, WriteMask::X),
                LirSrc::new(LirValue::Const([0.0; 4])),
            )],
            ..Default::default()
        });
        p.blocks.push(LirBlock {
            instrs: vec![
                LirInstr::new(
                    LirOp::Add,
                    Some(LirDst::reg(v, WriteMask::X)),
                    vec![LirSrc::reg(v), LirSrc::new(LirValue::Const([1.0; 4]))],
                ),
                LirInstr::new(
                    LirOp::Branch { cond: BranchCond::Lt },
                    None,
                    vec![LirSrc::reg(v), LirSrc::new(LirValue::Const([4.0; 4]))],
                )
                .with_index(1),
            ],
            ..Default::default()
        });
        p.blocks.push(LirBlock {
            instrs: vec![LirInstr::mov(
                LirDst::reg(out, WriteMask::XYZW),
                LirSrc::reg(v).with_swizzle(Swizzle::splat(0)),
            )],
            output: Some(out),
            stop: true,
            ..Default::default()
        });

        let live = Liveness::compute(&p);
        assert!(live.live_in(1).contains(lane_bit(v, 0)));
        assert!(!live.live_in(1).contains(lane_bit(v, 1)));
        assert!(live.live_out(1).contains(lane_bit(v, 0)));
        assert!(live.live_out(2).contains(lane_bit(out, 3)));
        assert!(live.live_in(0).is_empty());
    }
}
