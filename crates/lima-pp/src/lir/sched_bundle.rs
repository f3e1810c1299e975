//! Bundle scheduler: packs each block's instructions into bundles, bottom-up.
//!
//! An instruction is placed once all its dependents are. It first tries the bundle of the
//! dependent scheduled last, then scans towards the block start for the nearest bundle with a
//! free unit, and otherwise opens a new bundle in front. Producers of pipeline registers must
//! land in their consumer's bundle, so placing a consumer reserves the producer's unit.

use tracing::{debug, trace};

use crate::error::CompileError;

use super::bundle::{producer_slot, Bundle, SlotSet};
use super::deps::{DepGraph, Placement};
use super::{LirInstr, LirProgram, LirValue, PipelineReg};

/// Returns the total number of bundles.
pub fn run(program: &mut LirProgram) -> Result<usize, CompileError> {
    for (b, block) in program.blocks.iter_mut().enumerate() {
        let mut bundles = schedule_block(b, &block.instrs)?;
        if block.stop {
            if bundles.is_empty() {
                bundles.push(Bundle::new());
            }
            if let Some(last) = bundles.last_mut() {
                last.stop = true;
            }
        }
        trace!(block = b, bundles = bundles.len(), "scheduled block");
        block.bundles = bundles;
    }
    let total = program.num_bundles();
    debug!(bundles = total, instrs = program.num_instrs(), "scheduled bundles");
    Ok(total)
}

/// Longest dependency chain from each instruction to the end of the block.
fn height(graph: &DepGraph) -> Vec<u32> {
    let mut height = vec![0u32; graph.len()];
    for i in (0..graph.len()).rev() {
        height[i] = graph
            .succs(i)
            .iter()
            .map(|d| height[d.to] + 1)
            .max()
            .unwrap_or(0);
    }
    height
}

fn reads_pipeline_slots(instr: &LirInstr) -> SlotSet {
    instr
        .srcs
        .iter()
        .filter_map(|s| match s.value {
            LirValue::Pipeline(reg @ (PipelineReg::Uniform | PipelineReg::Texture)) => {
                producer_slot(reg)
            }
            _ => None,
        })
        .fold(SlotSet::empty(), |set, s| set | s.flag())
}

pub fn schedule_block(block: usize, instrs: &[LirInstr]) -> Result<Vec<Bundle>, CompileError> {
    let graph = DepGraph::build(instrs);
    let n = graph.len();
    let height = height(&graph);
    let unschedulable = |instr: usize, reason: &'static str| CompileError::Unschedulable {
        block,
        instr,
        reason,
    };

    // Index 0 is the last bundle of the block.
    let mut rev: Vec<Bundle> = Vec::new();
    let mut placed: Vec<Option<usize>> = vec![None; n];
    let mut pending: Vec<usize> = (0..n).map(|i| graph.succs(i).len()).collect();
    let mut ready: Vec<usize> = (0..n).filter(|&i| pending[i] == 0).collect();

    while !ready.is_empty() {
        let mut best = 0;
        for k in 1..ready.len() {
            let (a, b) = (ready[k], ready[best]);
            if (height[a], a) > (height[b], b) {
                best = k;
            }
        }
        let i = ready.swap_remove(best);
        let instr = &instrs[i];

        let mut lower = 0;
        let mut exact = None;
        for dep in graph.succs(i) {
            let Some(at) = placed[dep.to] else {
                return Err(unschedulable(i, "dependent instruction not placed"));
            };
            match dep.placement {
                Placement::SameOrLater => lower = lower.max(at),
                Placement::Later => lower = lower.max(at + 1),
                Placement::SameBundle => match exact {
                    Some(e) if e != at => {
                        return Err(unschedulable(i, "pipeline result read in two bundles"));
                    }
                    _ => exact = Some(at),
                },
            }
        }

        let needs = reads_pipeline_slots(instr);
        let at = if let Some(at) = exact {
            if at < lower {
                return Err(unschedulable(i, "pipeline producer must run earlier than its reader"));
            }
            rev[at]
                .try_insert(instr, true, needs)
                .ok_or_else(|| unschedulable(i, "unit needed by a pipeline producer is taken"))?;
            at
        } else {
            let existing = (lower..rev.len()).find(|&k| rev[k].try_insert(instr, false, needs).is_some());
            match existing {
                Some(k) => k,
                None => {
                    let mut bundle = Bundle::new();
                    bundle
                        .try_insert(instr, false, needs)
                        .ok_or_else(|| unschedulable(i, "no functional unit can execute it"))?;
                    rev.push(bundle);
                    rev.len() - 1
                }
            }
        };
        placed[i] = Some(at);

        for dep in graph.preds(i) {
            pending[dep.from] -= 1;
            if pending[dep.from] == 0 {
                ready.push(dep.from);
            }
        }
    }

    if let Some(i) = placed.iter().position(Option::is_none) {
        return Err(unschedulable(i, "dependency cycle"));
    }
    rev.reverse();
    Ok(rev)
}
