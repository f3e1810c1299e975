//! Register allocation: liveness, interference, colouring and spilling, repeated until every
//! virtual register has a place in the physical register file.

pub mod class;
pub mod color;
pub mod interference;
pub mod liveness;
pub mod spill;

use tracing::{debug, warn};

use crate::error::CompileError;
use crate::lir::{LirInstr, LirOp, LirProgram, LirSrc, LirValue, RegId};
use crate::options::CompileOptions;
use crate::types::{OutputModifier, Swizzle, WriteMask};

pub use color::Placement;
use color::Coloring;
use interference::Interference;
use liveness::Liveness;

/// Result of a successful allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    placements: Vec<Placement>,
    roots: Vec<RegId>,
    /// Build, colour and spill rounds it took.
    pub rounds: u32,
    /// Registers spilled over all rounds.
    pub spilled: usize,
}

impl Allocation {
    pub fn placement(&self, r: RegId) -> Placement {
        self.placements[r.0 as usize]
    }

    /// Representative of the coalescing group `r` ended up in.
    pub fn root(&self, r: RegId) -> RegId {
        self.roots[r.0 as usize]
    }
}

pub fn allocate(program: &mut LirProgram, options: &CompileOptions) -> Result<Allocation, CompileError> {
    let mut spilled = 0;
    for round in 1..=options.max_regalloc_rounds {
        let liveness = Liveness::compute(program);
        let graph = Interference::build(program, &liveness);
        match color::color(program, &graph, options) {
            Coloring::Colored { placements, roots } => {
                debug!(round, spilled, regs = program.regs.len(), "register allocation done");
                return Ok(Allocation {
                    placements,
                    roots,
                    rounds: round,
                    spilled,
                });
            }
            Coloring::Spill(regs) => {
                let spillable: Vec<RegId> = regs
                    .iter()
                    .copied()
                    .filter(|&r| {
                        let v = program.reg(r);
                        !v.spill_temp && v.precolor.is_none()
                    })
                    .collect();
                if spillable.is_empty() {
                    let reg = regs.first().map_or(0, |r| r.0);
                    warn!(reg, round, "colouring failed on an unspillable register");
                    return Err(CompileError::UnspillableRegister { reg });
                }
                spilled += spill::run(program, &spillable);
            }
        }
    }
    Err(CompileError::RegisterAllocation {
        rounds: options.max_regalloc_rounds,
    })
}

fn map_component(alloc: &Allocation, src: &LirSrc, component: u8) -> u8 {
    match src.value {
        LirValue::Reg(r) => alloc.placement(r).lanes[component as usize & 3],
        _ => component,
    }
}

fn rewrite_instr(instr: &mut LirInstr, alloc: &Allocation) {
    // Lane `i` of the old destination now lives at physical lane `moved[i]`.
    let mut moved = None;
    if let Some(dst) = instr.dst.as_mut() {
        if let LirValue::Reg(r) = dst.value {
            let p = alloc.placement(r);
            if instr.op.is_lanewise() {
                moved = Some((dst.mask, p.lanes));
            }
            let bits = dst.mask.lanes().fold(0u8, |m, l| m | 1 << p.lanes[l as usize]);
            dst.mask = WriteMask::from_bits_retain(bits);
            dst.value = LirValue::Phys(p.phys);
        }
    }

    for src in &mut instr.srcs {
        let old = src.swizzle;
        let mut new = Swizzle(old.0.map(|c| map_component(alloc, src, c)));
        if let Some((mask, lanes)) = moved {
            for i in mask.lanes() {
                new.0[lanes[i as usize] as usize] = map_component(alloc, src, old.component(i));
            }
        }
        src.swizzle = new;
        if let LirValue::Reg(r) = src.value {
            src.value = LirValue::Phys(alloc.placement(r).phys);
        }
    }
}

fn is_self_move(instr: &LirInstr) -> bool {
    let (Some(dst), [src]) = (instr.dst, instr.srcs.as_slice()) else {
        return false;
    };
    instr.op == LirOp::Mov
        && dst.modifier == OutputModifier::None
        && !src.has_modifiers()
        && matches!((dst.value, src.value), (LirValue::Phys(a), LirValue::Phys(b)) if a == b)
        && dst.mask.lanes().all(|l| src.swizzle.component(l) == l)
}

/// Replaces virtual registers by their physical placement and drops moves that became no-ops.
/// Returns the number of moves removed.
pub fn rewrite(program: &mut LirProgram, alloc: &Allocation) -> usize {
    let mut removed = 0;
    for block in &mut program.blocks {
        for instr in &mut block.instrs {
            rewrite_instr(instr, alloc);
        }
        let before = block.instrs.len();
        block.instrs.retain(|i| !is_self_move(i));
        removed += before - block.instrs.len();
    }
    program.allocated = true;
    debug!(removed, "rewrote registers");
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::eval::{Inputs, Outcome};
    use crate::lir::{interp, LirBlock, LirDst};

    fn alloc_of(placements: Vec<Placement>) -> Allocation {
        let roots = (0..placements.len() as u32).map(RegId).collect();
        Allocation {
            placements,
            roots,
            rounds: 1,
            spilled: 0,
        }
    }

    #[test]
    fn lanewise_sources_follow_the_destination_lanes() {
        // r1 (width 2) placed at $1.zw, r0 (width 2) at $2.yx.
        let alloc = alloc_of(vec![
            Placement {
                phys: 2,
                lanes: [1, 0, 2, 3],
            },
            Placement {
                phys: 1,
                lanes: [2, 3, 3, 3],
            },
        ]);
        let mut instr = LirInstr::new(
            LirOp::Add,
            Some(LirDst::reg(RegId(1), WriteMask::XY)),
            vec![
                LirSrc::reg(RegId(0)).with_swizzle(Swizzle([1, 0, 0, 0])),
                LirSrc::new(LirValue::Const([1.0, 2.0, 3.0, 4.0])),
            ],
        );
        rewrite_instr(&mut instr, &alloc);
        let dst = instr.dst.unwrap();
        assert_eq!(dst.value, LirValue::Phys(1));
        assert_eq!(dst.mask, WriteMask::Z | WriteMask::W);
        // Position z computes old lane x, which read r0.y = $2.x.
        assert_eq!(instr.srcs[0].value, LirValue::Phys(2));
        assert_eq!(instr.srcs[0].swizzle.component(2), 0);
        assert_eq!(instr.srcs[0].swizzle.component(3), 1);
        assert_eq!(instr.srcs[1].swizzle.component(2), 0);
        assert_eq!(instr.srcs[1].swizzle.component(3), 1);
    }

    #[test]
    fn allocation_preserves_results_and_drops_self_moves() {
        let mut p = LirProgram::default();
        let a = p.new_reg(1, false);
        let b = p.new_reg(1, false);
        let v = p.new_reg(2, false);
        let out = p.new_reg(4, true);
        p.regs[out.0 as usize].precolor = Some(0);
        let varying = |r, i| {
            LirInstr::new(LirOp::LoadVarying, Some(LirDst::reg(r, WriteMask::X)), Vec::new())
                .with_index(i)
        };
        p.blocks.push(LirBlock {
            instrs: vec![
                varying(a, 0),
                varying(b, 1),
                LirInstr::mov(LirDst::reg(v, WriteMask::X), LirSrc::reg(a)),
                LirInstr::mov(
                    LirDst::reg(v, WriteMask::Y),
                    LirSrc::reg(b).with_swizzle(Swizzle::splat(0)),
                ),
                LirInstr::new(
                    LirOp::Mul,
                    Some(LirDst::reg(out, WriteMask::XY)),
                    vec![LirSrc::reg(v), LirSrc::reg(v)],
                ),
            ],
            output: Some(out),
            stop: true,
            ..Default::default()
        });
        let inputs = Inputs {
            varyings: vec![[3.0; 4], [-2.0; 4]],
            ..Default::default()
        };
        let expected = interp::run(&p, &inputs, 1000).unwrap();
        assert_eq!(expected, Outcome::Color([9.0, 4.0, 0.0, 0.0]));

        let alloc = allocate(&mut p, &CompileOptions::default()).unwrap();
        assert_eq!(alloc.rounds, 1);
        assert_eq!(alloc.spilled, 0);
        assert_eq!(alloc.root(a), alloc.root(v));
        let removed = rewrite(&mut p, &alloc);
        assert_eq!(removed, 2);
        assert!(p.allocated);
        assert_eq!(interp::run(&p, &inputs, 1000).unwrap(), expected);
    }

    #[test]
    fn one_register_forces_spilling() {
        let mut p = LirProgram::default();
        let regs: Vec<RegId> = (0..3).map(|_| p.new_reg(4, false)).collect();
        let out = p.new_reg(4, true);
        p.regs[out.0 as usize].precolor = Some(0);
        let mut instrs: Vec<LirInstr> = regs
            .iter()
            .enumerate()
            .map(|(i, &r)| {
                LirInstr::new(LirOp::LoadVarying, Some(LirDst::reg(r, WriteMask::XYZW)), Vec::new())
                    .with_index(i as u32)
            })
            .collect();
        let sum = p.new_reg(4, false);
        instrs.push(LirInstr::new(
            LirOp::Add,
            Some(LirDst::reg(sum, WriteMask::XYZW)),
            vec![LirSrc::reg(regs[0]), LirSrc::reg(regs[1])],
        ));
        instrs.push(LirInstr::new(
            LirOp::Mul,
            Some(LirDst::reg(out, WriteMask::XYZW)),
            vec![LirSrc::reg(sum), LirSrc::reg(regs[2])],
        ));
        p.blocks.push(LirBlock {
            instrs,
            output: Some(out),
            stop: true,
            ..Default::default()
        });
        let inputs = Inputs {
            varyings: vec![[1.0; 4], [2.0; 4], [4.0; 4]],
            ..Default::default()
        };
        let expected = interp::run(&p, &inputs, 1000).unwrap();

        let options = CompileOptions {
            num_registers: 1,
            ..Default::default()
        };
        let alloc = allocate(&mut p, &options).unwrap();
        assert!(alloc.spilled > 0);
        assert!(p.temp_size > 0);
        rewrite(&mut p, &alloc);
        assert_eq!(interp::run(&p, &inputs, 1000).unwrap(), expected);
        assert_eq!(expected, Outcome::Color([12.0; 4]));
    }
}
