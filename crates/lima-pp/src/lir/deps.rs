//! Per-block dependency graph between LIR instructions.
//!
//! Registers are tracked per lane, so writes to disjoint lanes of one register stay independent.
//! Every edge also records where the later instruction may be placed relative to the earlier one
//! once instructions are packed into bundles: register results are written at the end of a
//! bundle, pipeline registers only live inside one bundle.

use hashbrown::HashMap;

use super::{LirInstr, LirOp, LirValue, PipelineReg, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// Read after write.
    True,
    /// Write after read.
    Anti,
    /// Write after write.
    Output,
    /// Ordering only: memory accesses and the block-ending branch.
    Order,
}

/// Bundle placement of the dependent instruction relative to the one it depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Placement {
    SameOrLater,
    Later,
    SameBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dep {
    pub from: usize,
    pub to: usize,
    pub kind: DepKind,
    pub placement: Placement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Loc {
    Reg(u32, u8),
    Phys(u8, u8),
    Pipe(PipelineReg),
    Memory,
}

#[derive(Default)]
struct Access {
    writer: Option<usize>,
    readers: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    preds: Vec<Vec<Dep>>,
    succs: Vec<Vec<Dep>>,
}

fn value_locs(value: LirValue, lanes: u8) -> Vec<Loc> {
    let lanes = (0..4u8).filter(move |l| lanes & (1 << l) != 0);
    match value {
        LirValue::Reg(r) => lanes.map(|l| Loc::Reg(r.0, l)).collect(),
        LirValue::Phys(p) => lanes.map(|l| Loc::Phys(p, l)).collect(),
        LirValue::Pipeline(p @ (PipelineReg::Uniform | PipelineReg::Texture)) => vec![Loc::Pipe(p)],
        LirValue::Pipeline(_) | LirValue::Const(_) => Vec::new(),
    }
}

impl DepGraph {
    pub fn build(instrs: &[LirInstr]) -> Self {
        let mut edges: HashMap<(usize, usize), Dep> = HashMap::new();
        let mut add = |from: usize, to: usize, kind: DepKind, placement: Placement| {
            if from == to {
                return;
            }
            edges
                .entry((from, to))
                .and_modify(|d| {
                    if placement > d.placement {
                        d.placement = placement;
                    }
                    if kind == DepKind::True {
                        d.kind = kind;
                    }
                })
                .or_insert(Dep {
                    from,
                    to,
                    kind,
                    placement,
                });
        };

        let mut state: HashMap<Loc, Access> = HashMap::new();
        for (i, instr) in instrs.iter().enumerate() {
            let mut reads = Vec::new();
            for (k, src) in instr.srcs.iter().enumerate() {
                reads.extend(value_locs(src.value, instr.read_lanes(k)));
            }
            if instr.op.reads_memory() {
                reads.push(Loc::Memory);
            }
            for loc in reads {
                let access = state.entry(loc).or_default();
                if let Some(w) = access.writer {
                    let placement = match loc {
                        Loc::Pipe(_) => Placement::SameBundle,
                        _ => Placement::Later,
                    };
                    add(w, i, DepKind::True, placement);
                }
                access.readers.push(i);
            }

            let mut writes = match instr.dst {
                Some(dst) => value_locs(dst.value, dst.mask.bits()),
                None => Vec::new(),
            };
            if matches!(instr.op, LirOp::StoreTemp { .. }) {
                writes.push(Loc::Memory);
            }
            for loc in writes {
                let access = state.entry(loc).or_default();
                let anti = match loc {
                    Loc::Pipe(_) => Placement::Later,
                    _ => Placement::SameOrLater,
                };
                for &r in &access.readers {
                    add(r, i, DepKind::Anti, anti);
                }
                if let Some(w) = access.writer {
                    add(w, i, DepKind::Output, Placement::Later);
                }
                access.writer = Some(i);
                access.readers.clear();
            }

            if instr.op.unit() == Unit::Branch {
                for j in 0..i {
                    add(j, i, DepKind::Order, Placement::SameOrLater);
                }
            }
        }

        let mut graph = DepGraph {
            preds: vec![Vec::new(); instrs.len()],
            succs: vec![Vec::new(); instrs.len()],
        };
        let mut deps: Vec<Dep> = edges.into_values().collect();
        deps.sort_by_key(|d| (d.from, d.to));
        for dep in deps {
            graph.preds[dep.to].push(dep);
            graph.succs[dep.from].push(dep);
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.preds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }

    pub fn preds(&self, i: usize) -> &[Dep] {
        &self.preds[i]
    }

    pub fn succs(&self, i: usize) -> &[Dep] {
        &self.succs[i]
    }

    /// Instructions reading a value `i` produces.
    pub fn true_succs(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.succs[i]
            .iter()
            .filter(|d| d.kind == DepKind::True)
            .map(|d| d.to)
    }

    /// The instruction producing the pipeline register `i` reads, if any.
    pub fn pipeline_producer(&self, i: usize) -> Option<usize> {
        self.preds[i]
            .iter()
            .find(|d| d.placement == Placement::SameBundle)
            .map(|d| d.from)
    }
}
