//! Spill code insertion.
//!
//! Every spilled register gets its own slot of temporary storage. Definitions write a short-lived
//! aligned register that is stored right after; uses reload into a fresh one right before. A
//! single spilled operand of an arithmetic instruction is instead read straight from the uniform
//! pipeline register, which costs no register at all.

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::lir::{LirDst, LirInstr, LirOp, LirProgram, LirSrc, LirValue, PipelineReg, RegId, Unit};
use crate::types::WriteMask;

fn reads_from_pipeline(instr: &LirInstr) -> bool {
    matches!(
        instr.op.unit(),
        Unit::Mul | Unit::Add | Unit::Alu | Unit::VectorAdd | Unit::Combine
    ) && !instr.reads_pipeline(PipelineReg::Uniform)
}

/// Start of the run of pipeline loads at the end of `out` that feed the instruction about to be
/// appended. Those loads must stay directly in front of their reader.
fn pipeline_group_start(out: &[LirInstr]) -> usize {
    let mut at = out.len();
    while at > 0
        && matches!(
            out[at - 1].dst,
            Some(LirDst {
                value: LirValue::Pipeline(PipelineReg::Uniform | PipelineReg::Texture),
                ..
            })
        )
    {
        at -= 1;
    }
    at
}

fn load(slot: u32) -> LirInstr {
    LirInstr::new(
        LirOp::LoadTemp,
        Some(LirDst::pipeline(PipelineReg::Uniform)),
        Vec::new(),
    )
    .with_index(slot)
}

/// Rewrites all occurrences of `regs`; returns how many registers were spilled.
pub fn run(program: &mut LirProgram, regs: &[RegId]) -> usize {
    let mut slots: HashMap<RegId, u32> = HashMap::new();
    for &r in regs {
        slots.insert(r, program.temp_size);
        trace!(reg = r.0, slot = program.temp_size, "spilling register");
        program.temp_size += 1;
    }

    for b in 0..program.blocks.len() {
        let instrs = std::mem::take(&mut program.blocks[b].instrs);
        let mut out = Vec::with_capacity(instrs.len());
        for mut instr in instrs {
            let reads_forwarded = instr.reads_pipeline(PipelineReg::Uniform)
                || instr.reads_pipeline(PipelineReg::Texture);
            let mut pre = Vec::new();
            let mut post = Vec::new();

            if let Some(r) = instr.dst_reg().filter(|r| slots.contains_key(r)) {
                let slot = slots[&r];
                let width = program.reg(r).width;
                let full = WriteMask::for_width(width);
                let tmp = spill_temp(program, width);
                if let Some(dst) = instr.dst.as_mut() {
                    if dst.mask != full {
                        pre.push(load(slot));
                        pre.push(LirInstr::mov(
                            LirDst::reg(tmp, full),
                            LirSrc::pipeline(PipelineReg::Uniform),
                        ));
                    }
                    dst.value = LirValue::Reg(tmp);
                }
                post.push(
                    LirInstr::new(LirOp::StoreTemp { width }, None, vec![LirSrc::reg(tmp)])
                        .with_index(slot),
                );
            }

            let mut forwarded = None;
            let mut reloaded: HashMap<RegId, RegId> = HashMap::new();
            for k in 0..instr.srcs.len() {
                let Some(r) = instr.srcs[k].reg_id().filter(|r| slots.contains_key(r)) else {
                    continue;
                };
                let slot = slots[&r];
                if forwarded == Some(r) {
                    instr.srcs[k].value = LirValue::Pipeline(PipelineReg::Uniform);
                    continue;
                }
                if forwarded.is_none() && reloaded.is_empty() && reads_from_pipeline(&instr) {
                    forwarded = Some(r);
                    instr.srcs[k].value = LirValue::Pipeline(PipelineReg::Uniform);
                    continue;
                }
                let tmp = match reloaded.get(&r) {
                    Some(&t) => t,
                    None => {
                        let width = program.reg(r).width;
                        let t = spill_temp(program, width);
                        pre.push(load(slot));
                        pre.push(LirInstr::mov(
                            LirDst::reg(t, WriteMask::for_width(width)),
                            LirSrc::pipeline(PipelineReg::Uniform),
                        ));
                        reloaded.insert(r, t);
                        t
                    }
                };
                instr.srcs[k].value = LirValue::Reg(tmp);
            }

            // Reloads go ahead of any pipeline load an earlier round left in front of this
            // instruction; the forwarded load must directly precede its reader.
            let at = if reads_forwarded {
                pipeline_group_start(&out)
            } else {
                out.len()
            };
            out.splice(at..at, pre);
            if let Some(r) = forwarded {
                out.push(load(slots[&r]));
            }
            out.push(instr);
            out.extend(post);
        }
        program.blocks[b].instrs = out;
    }

    debug!(spilled = regs.len(), temp_size = program.temp_size, "inserted spill code");
    regs.len()
}

fn spill_temp(program: &mut LirProgram, width: u8) -> RegId {
    let r = program.new_reg(width, true);
    program.regs[r.0 as usize].spill_temp = true;
    r
}
