//! Pre-allocation list scheduler that reorders each block to keep register pressure low.
//!
//! Works bottom-up. Every instruction gets a Sethi-Ullman style pressure estimate computed over
//! the dependency graph cut into trees: an instruction with exactly one reader hangs below that
//! reader, anything read more than once starts a new tree. The ready instruction whose reader
//! was scheduled most recently goes first, so chains stay together.

use tracing::trace;

use super::deps::DepGraph;
use super::{LirInstr, LirProgram};

/// Returns the number of blocks whose instruction order changed.
pub fn run(program: &mut LirProgram) -> usize {
    let mut changed = 0;
    for (b, block) in program.blocks.iter_mut().enumerate() {
        let order = schedule(&block.instrs);
        if order.iter().enumerate().any(|(pos, &i)| pos != i) {
            changed += 1;
            trace!(block = b, ?order, "rescheduled block for register pressure");
            let mut old: Vec<Option<LirInstr>> = block.instrs.drain(..).map(Some).collect();
            block.instrs = order.iter().filter_map(|&i| old[i].take()).collect();
        }
    }
    changed
}

/// Register pressure of each instruction's expression tree.
pub fn tree_pressure(graph: &DepGraph) -> Vec<u32> {
    let n = graph.len();
    let parent: Vec<Option<usize>> = (0..n).map(|i| tree_parent(graph, i)).collect();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, p) in parent.iter().enumerate() {
        if let Some(p) = *p {
            children[p].push(i);
        }
    }

    // Dependencies point forward, so program order visits children first.
    let mut pressure = vec![0u32; n];
    for i in 0..n {
        let mut kids: Vec<u32> = children[i].iter().map(|&c| pressure[c]).collect();
        if kids.is_empty() {
            pressure[i] = 1;
            continue;
        }
        kids.sort_unstable_by(|a, b| b.cmp(a));
        let count = kids.len() as u32;
        pressure[i] = kids
            .iter()
            .enumerate()
            .map(|(k, &p)| p + count - k as u32 - 1)
            .max()
            .unwrap_or(1);
    }
    pressure
}

fn tree_parent(graph: &DepGraph, i: usize) -> Option<usize> {
    let mut readers = graph.true_succs(i);
    let first = readers.next()?;
    match readers.next() {
        None => Some(first),
        Some(_) => None,
    }
}

/// Bottom-up order of `instrs` as indices into the slice.
pub fn schedule(instrs: &[LirInstr]) -> Vec<usize> {
    let graph = DepGraph::build(instrs);
    let n = graph.len();
    let pressure = tree_pressure(&graph);
    let parent: Vec<Option<usize>> = (0..n).map(|i| tree_parent(&graph, i)).collect();

    let mut depth = vec![0u32; n];
    for i in 0..n {
        depth[i] = graph
            .preds(i)
            .iter()
            .map(|d| depth[d.from] + 1)
            .max()
            .unwrap_or(0);
    }

    let mut pending: Vec<usize> = (0..n).map(|i| graph.succs(i).len()).collect();
    let mut ready: Vec<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
    let mut position: Vec<Option<usize>> = vec![None; n];
    let mut order = Vec::with_capacity(n);

    while !ready.is_empty() {
        let producer = order
            .last()
            .and_then(|&last| graph.pipeline_producer(last))
            .and_then(|p| ready.iter().position(|&r| r == p));
        let pick = producer.unwrap_or_else(|| {
            let key = |i: usize| {
                let reader = parent[i].and_then(|p| position[p]).map_or(-1, |pos| pos as i64);
                (reader, core::cmp::Reverse(pressure[i]), depth[i], i)
            };
            let mut best = 0;
            for k in 1..ready.len() {
                if key(ready[k]) > key(ready[best]) {
                    best = k;
                }
            }
            best
        });
        let i = ready.swap_remove(pick);
        position[i] = Some(order.len());
        order.push(i);
        for dep in graph.preds(i) {
            pending[dep.from] -= 1;
            if pending[dep.from] == 0 {
                ready.push(dep.from);
            }
        }
    }

    debug_assert_eq!(order.len(), n, "dependency graph has a cycle");
    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{LirDst, LirOp, LirSrc, LirValue, RegId};
    use crate::types::WriteMask;

    fn load(dst: u32, index: u32) -> LirInstr {
        LirInstr::new(
            LirOp::LoadVarying,
            Some(LirDst::reg(RegId(dst), WriteMask::X)),
            Vec::new(),
        )
        .with_index(index)
    }

    fn add(dst: u32, a: u32, b: u32) -> LirInstr {
        LirInstr::new(
            LirOp::Add,
            Some(LirDst::reg(RegId(dst), WriteMask::X)),
            vec![LirSrc::reg(RegId(a)), LirSrc::reg(RegId(b))],
        )
    }

    #[test]
    fn balanced_tree_needs_two_registers_per_level() {
        // (a + b) + (c + d)
        let instrs = vec![
            load(0, 0),
            load(1, 1),
            load(2, 2),
            load(3, 3),
            add(4, 0, 1),
            add(5, 2, 3),
            add(6, 4, 5),
        ];
        let graph = DepGraph::build(&instrs);
        let p = tree_pressure(&graph);
        assert_eq!(&p[..4], &[1, 1, 1, 1]);
        assert_eq!(p[4], 2);
        assert_eq!(p[6], 3);
    }

    #[test]
    fn loads_move_next_to_their_reader() {
        // All loads first, then the sums: the scheduler interleaves them so that at most three
        // values are live at once.
        let instrs = vec![
            load(0, 0),
            load(1, 1),
            load(2, 2),
            load(3, 3),
            add(4, 0, 1),
            add(5, 2, 3),
            add(6, 4, 5),
            LirInstr::mov(
                LirDst::reg(RegId(7), WriteMask::XYZW),
                LirSrc::reg(RegId(6)).with_swizzle(crate::types::Swizzle::splat(0)),
            ),
        ];
        let order = schedule(&instrs);
        assert_eq!(order.len(), instrs.len());
        assert_eq!(*order.last().unwrap(), 7);

        let mut live = 0usize;
        let mut max_live = 0;
        for &i in &order {
            let reads = instrs[i]
                .srcs
                .iter()
                .filter(|s| matches!(s.value, LirValue::Reg(_)))
                .count();
            live = live + 1 - reads;
            max_live = max_live.max(live);
        }
        assert!(max_live <= 3, "order {order:?} keeps {max_live} values live");
    }
}
