//! Lane-precise dead-code elimination on the LIR, followed by dense register renumbering.

use tracing::debug;

use super::{LirInstr, LirProgram, LirValue, PipelineReg, RegId};

fn pipeline_slot(reg: PipelineReg) -> Option<usize> {
    match reg {
        PipelineReg::Uniform => Some(0),
        PipelineReg::Texture => Some(1),
        PipelineReg::Const0 | PipelineReg::Const1 => None,
    }
}

/// Returns the number of instructions removed.
pub fn run(program: &mut LirProgram) -> usize {
    let mut live_lanes = vec![0u8; program.regs.len()];
    for block in &program.blocks {
        if let Some(out) = block.output {
            live_lanes[out.0 as usize] = 0b1111;
        }
    }

    let mut live: Vec<Vec<bool>> = program
        .blocks
        .iter()
        .map(|b| vec![false; b.instrs.len()])
        .collect();

    // Register liveness is flow-insensitive, so iterate until no more lanes become live.
    loop {
        let mut changed = false;
        for (b, block) in program.blocks.iter().enumerate() {
            let mut pipe_needed = [false; 2];
            for (i, instr) in block.instrs.iter().enumerate().rev() {
                let needed = instr.op.has_side_effects()
                    || match instr.dst.map(|d| (d.value, d.mask)) {
                        Some((LirValue::Reg(r), mask)) => live_lanes[r.0 as usize] & mask.bits() != 0,
                        Some((LirValue::Pipeline(p), _)) => {
                            pipeline_slot(p).is_some_and(|s| std::mem::take(&mut pipe_needed[s]))
                        }
                        _ => true,
                    };
                if !needed {
                    continue;
                }
                if !live[b][i] {
                    live[b][i] = true;
                    changed = true;
                }
                for (k, src) in instr.srcs.iter().enumerate() {
                    match src.value {
                        LirValue::Reg(r) => {
                            let lanes = instr.read_lanes(k);
                            let slot = &mut live_lanes[r.0 as usize];
                            if *slot | lanes != *slot {
                                *slot |= lanes;
                                changed = true;
                            }
                        }
                        LirValue::Pipeline(p) => {
                            if let Some(s) = pipeline_slot(p) {
                                pipe_needed[s] = true;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }

    let mut removed = 0;
    for (block, flags) in program.blocks.iter_mut().zip(&live) {
        let before = block.instrs.len();
        let mut keep = flags.iter();
        block.instrs.retain(|_| keep.next().copied().unwrap_or(true));
        removed += before - block.instrs.len();
    }

    renumber(program);
    if removed > 0 {
        debug!(removed, regs = program.regs.len(), "removed dead instructions");
    }
    removed
}

fn for_each_reg(instr: &mut LirInstr, mut f: impl FnMut(&mut RegId)) {
    if let Some(LirValue::Reg(r)) = instr.dst.as_mut().map(|d| &mut d.value) {
        f(r);
    }
    for src in &mut instr.srcs {
        if let LirValue::Reg(r) = &mut src.value {
            f(r);
        }
    }
}

/// Drops registers nothing refers to and renumbers the rest densely.
pub fn renumber(program: &mut LirProgram) {
    let mut used = vec![false; program.regs.len()];
    for block in &mut program.blocks {
        if let Some(out) = block.output {
            used[out.0 as usize] = true;
        }
        for instr in &mut block.instrs {
            for_each_reg(instr, |r| used[r.0 as usize] = true);
        }
    }

    let mut map = vec![RegId(u32::MAX); program.regs.len()];
    let mut regs = Vec::new();
    for (old, &u) in used.iter().enumerate() {
        if u {
            map[old] = RegId(regs.len() as u32);
            regs.push(program.regs[old]);
        }
    }
    if regs.len() == program.regs.len() {
        return;
    }
    program.regs = regs;
    for block in &mut program.blocks {
        if let Some(out) = &mut block.output {
            *out = map[out.0 as usize];
        }
        for instr in &mut block.instrs {
            for_each_reg(instr, |r| *r = map[r.0 as usize]);
        }
    }
}
