//! Conversion to conventional SSA and final block layout.
//!
//! Critical edges are split first, then every phi gets a copy of each source at the end of the
//! corresponding predecessor and a copy of its own result right after the phis. Afterwards the
//! sources and the destination of a phi can share one register without interference, so the
//! register allocator can remove most of the copies again by coalescing.

use tracing::debug;

use super::dom::reverse_postorder;
use super::op::Op;
use super::{BlockId, Dst, Program, Src, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CssaStats {
    pub split_edges: usize,
    pub copies: usize,
    pub unreachable: usize,
}

pub fn run(program: &mut Program) -> CssaStats {
    let mut stats = CssaStats {
        unreachable: program.remove_unreachable(),
        ..Default::default()
    };

    for b in program.layout().to_vec() {
        let succs: Vec<BlockId> = program.block(b).end().successors().collect();
        if succs.len() < 2 || succs[0] == succs[1] {
            continue;
        }
        for s in succs {
            if program.block(s).preds().len() > 1 {
                program.split_edge(b, s);
                stats.split_edges += 1;
            }
        }
    }

    for b in program.layout().to_vec() {
        let phis = program.block(b).phis().to_vec();
        if phis.is_empty() {
            continue;
        }
        let preds = program.block(b).preds().to_vec();
        for &phi in &phis {
            let width = program.cmd(phi).dst.width;
            let srcs = program.cmd(phi).srcs().to_vec();
            let copies = srcs
                .iter()
                .zip(&preds)
                .map(|(&src, &pred)| {
                    stats.copies += 1;
                    Src::cmd(program.append(pred, Op::Mov, Dst::new(width), vec![src]))
                })
                .collect();
            program.set_srcs(phi, copies);
        }
        for &phi in &phis {
            let width = program.cmd(phi).dst.width;
            let copy = program.prepend(b, Op::Mov, Dst::new(width), Vec::new());
            program.replace_uses_with(phi, |s| Src {
                value: Value::Cmd(copy),
                ..s
            });
            program.set_srcs(copy, vec![Src::cmd(phi)]);
            stats.copies += 1;
        }
    }

    program.set_layout(reverse_postorder(program));
    program.compact();
    debug!(
        split_edges = stats.split_edges,
        copies = stats.copies,
        unreachable = stats.unreachable,
        "converted to conventional SSA"
    );
    stats
}
