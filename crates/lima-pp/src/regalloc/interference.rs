//! Lane-level interference graph and move list.
//!
//! Two registers interfere when a lane of one is written while a lane of the other is live. The
//! graph keeps, for every interfering pair, a 4x4 lane matrix so that registers sharing one
//! physical register on disjoint lanes can still be told apart from ones that really overlap.

use hashbrown::{HashMap, HashSet};

use crate::bitset::BitSet;
use crate::lir::{LirProgram, RegId};

use super::liveness::{reg_def, reg_uses, step_back, Liveness};

/// A plain register copy the allocator may remove by coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub dst: RegId,
    pub src: RegId,
    /// Source lane copied into each destination lane.
    pub lanes: [Option<u8>; 4],
}

/// Lane matrix of a pair `(a, b)`: bit `i * 4 + j` is set when lane `i` of `a` conflicts with
/// lane `j` of `b`.
pub fn transpose(bits: u16) -> u16 {
    let mut out = 0;
    for i in 0..4 {
        for j in 0..4 {
            if bits & (1 << (i * 4 + j)) != 0 {
                out |= 1 << (j * 4 + i);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct Interference {
    lanes: HashMap<(u32, u32), u16>,
    adj: Vec<HashSet<u32>>,
    moves: Vec<Move>,
    /// Instructions defining or using each register.
    occurrences: Vec<u32>,
}

impl Interference {
    pub fn new(num_regs: usize) -> Self {
        Self {
            lanes: HashMap::new(),
            adj: vec![HashSet::new(); num_regs],
            moves: Vec::new(),
            occurrences: vec![0; num_regs],
        }
    }

    pub fn build(program: &LirProgram, liveness: &Liveness) -> Self {
        let n = program.regs.len();
        let mut graph = Self::new(n);

        for (b, block) in program.blocks.iter().enumerate() {
            let mut live = liveness.live_out(b).clone();
            for instr in block.instrs.iter().rev() {
                let mut seen = HashSet::new();
                for (r, _) in reg_uses(instr) {
                    seen.insert(r);
                }
                if let Some((d, lanes)) = reg_def(instr) {
                    seen.insert(d);
                    // Lane pairs a plain move copies do not conflict.
                    let copy = instr.is_plain_move().then(|| {
                        let src = &instr.srcs[0];
                        (src.reg_id(), src.swizzle)
                    });
                    for bit in live.iter() {
                        let (u, j) = (RegId((bit / 4) as u32), (bit % 4) as u8);
                        if u == d {
                            continue;
                        }
                        for l in (0..4u8).filter(|l| lanes & (1 << l) != 0) {
                            let copied = matches!(copy, Some((Some(s), sw)) if s == u && sw.component(l) == j);
                            if !copied {
                                graph.add(d, l, u, j);
                            }
                        }
                    }
                    if let Some((Some(src), sw)) = copy {
                        if src != d {
                            let mut map = [None; 4];
                            for l in (0..4u8).filter(|l| lanes & (1 << l) != 0) {
                                map[l as usize] = Some(sw.component(l));
                            }
                            graph.moves.push(Move {
                                dst: d,
                                src,
                                lanes: map,
                            });
                        }
                    }
                }
                for r in seen {
                    graph.occurrences[r.0 as usize] += 1;
                }
                step_back(&mut live, instr);
            }
            if b == 0 {
                graph.add_all_pairs(&live);
            }
        }
        graph
    }

    /// Values live into the entry block are never defined; keep them apart from each other.
    fn add_all_pairs(&mut self, live: &BitSet) {
        let bits: Vec<usize> = live.iter().collect();
        for (k, &a) in bits.iter().enumerate() {
            for &b in &bits[k + 1..] {
                let (ra, la) = (RegId((a / 4) as u32), (a % 4) as u8);
                let (rb, lb) = (RegId((b / 4) as u32), (b % 4) as u8);
                if ra != rb {
                    self.add(ra, la, rb, lb);
                }
            }
        }
    }

    pub fn add(&mut self, a: RegId, la: u8, b: RegId, lb: u8) {
        if a == b {
            return;
        }
        let (key, bit) = if a.0 < b.0 {
            ((a.0, b.0), la * 4 + lb)
        } else {
            ((b.0, a.0), lb * 4 + la)
        };
        *self.lanes.entry(key).or_default() |= 1 << bit;
        self.adj[a.0 as usize].insert(b.0);
        self.adj[b.0 as usize].insert(a.0);
    }

    /// Lane matrix of `(a, b)`.
    pub fn lanes(&self, a: RegId, b: RegId) -> u16 {
        if a.0 < b.0 {
            self.lanes.get(&(a.0, b.0)).copied().unwrap_or(0)
        } else {
            transpose(self.lanes.get(&(b.0, a.0)).copied().unwrap_or(0))
        }
    }

    pub fn interferes(&self, a: RegId, b: RegId) -> bool {
        self.lanes(a, b) != 0
    }

    pub fn neighbors(&self, a: RegId) -> impl Iterator<Item = RegId> + '_ {
        self.adj[a.0 as usize].iter().map(|&r| RegId(r))
    }

    pub fn degree(&self, a: RegId) -> usize {
        self.adj[a.0 as usize].len()
    }

    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    pub fn occurrences(&self, a: RegId) -> u32 {
        self.occurrences[a.0 as usize]
    }

    pub fn num_regs(&self) -> usize {
        self.adj.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{LirBlock, LirDst, LirInstr, LirOp, LirSrc};
    use crate::types::{Swizzle, WriteMask};

    #[test]
    fn transpose_swaps_lane_roles() {
        assert_eq!(transpose(1 << 1), 1 << 4);
        assert_eq!(transpose(transpose(0xa5c3)), 0xa5c3);
    }

    #[test]
    fn combine_copies_only_conflict_on_other_lanes() {
        // a = varying; b = varying; v.x = a; v.y = b; out = v.xyxy
        let mut p = LirProgram::default();
        let a = p.new_reg(1, false);
        let b = p.new_reg(1, false);
        let v = p.new_reg(2, false);
        let out = p.new_reg(4, true);
        let load = |r| {
            LirInstr::new(
                LirOp::LoadVarying,
                Some(LirDst::reg(r, WriteMask::X)),
                Vec::new(),
            )
        };
        p.blocks.push(LirBlock {
            instrs: vec![
                load(a),
                load(b),
                LirInstr::mov(LirDst::reg(v, WriteMask::X), LirSrc::reg(a)),
                LirInstr::mov(
                    LirDst::reg(v, WriteMask::Y),
                    LirSrc::reg(b).with_swizzle(Swizzle::splat(0)),
                ),
                LirInstr::mov(
                    LirDst::reg(out, WriteMask::XYZW),
                    LirSrc::reg(v).with_swizzle(Swizzle([0, 1, 0, 1])),
                ),
            ],
            output: Some(out),
            stop: true,
            ..Default::default()
        });
        let live = Liveness::compute(&p);
        let g = Interference::build(&p, &live);

        assert!(g.interferes(a, b));
        // v.x is written while b is live.
        assert_eq!(g.lanes(v, b), 1 << 0);
        assert!(!g.interferes(v, a));
        assert!(!g.interferes(out, v));
        assert_eq!(g.moves().len(), 3);
        assert_eq!(g.moves()[0].dst, out);
        assert_eq!(g.moves()[1].lanes, [None, Some(0), None, None]);
        assert_eq!(g.occurrences(v), 3);
    }
}
