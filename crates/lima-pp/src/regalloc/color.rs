//! Iterated graph colouring with conservative coalescing over register classes.
//!
//! Simplification removes nodes that are trivially colourable in the Runeson-Nyström sense
//! (`sum of q(neighbour, node) < p(node)`); coalescing merges the two sides of a move when the
//! merged node passes the same test counted over its significant neighbours (Briggs); freezing
//! gives up on the moves of a low-degree node; and when everything left is significant the
//! cheapest node is pushed optimistically as a potential spill. Nodes are then popped and given
//! the first free placement.

use hashbrown::{HashMap, HashSet};
use tracing::trace;

use crate::lir::{LirProgram, RegId};
use crate::options::CompileOptions;

use super::class::{ClassTables, RegClass};
use super::interference::{transpose, Interference, Move};

/// Physical register and lane of every lane of a virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub phys: u8,
    pub lanes: [u8; 4],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coloring {
    /// Placement of every register, plus the coalescing group each belongs to.
    Colored {
        placements: Vec<Placement>,
        roots: Vec<RegId>,
    },
    /// Registers to spill before trying again.
    Spill(Vec<RegId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Active,
    Precolored,
    Simplified,
    Coalesced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveState {
    Active,
    Coalesced,
    Constrained,
    Frozen,
}

struct Colorer<'a> {
    program: &'a LirProgram,
    tables: ClassTables,
    num_regs: u8,
    state: Vec<NodeState>,
    /// Parent in the coalescing forest with the map from this node's lanes to the parent's.
    alias: Vec<Option<(usize, [u8; 4])>>,
    aligned: Vec<bool>,
    adj: Vec<HashSet<usize>>,
    lanes: HashMap<(usize, usize), u16>,
    q_total: Vec<u32>,
    occurrences: Vec<u32>,
    moves: Vec<Move>,
    move_state: Vec<MoveState>,
    /// Moves with an endpoint in each node's coalescing group, by index into `moves`.
    node_moves: Vec<Vec<usize>>,
    stack: Vec<usize>,
}

pub fn color(program: &LirProgram, graph: &Interference, options: &CompileOptions) -> Coloring {
    let mut c = Colorer::new(program, graph, options);
    c.run();
    c.select()
}

impl<'a> Colorer<'a> {
    fn new(program: &'a LirProgram, graph: &Interference, options: &CompileOptions) -> Self {
        let n = program.regs.len();
        let mut node_moves = vec![Vec::new(); n];
        for (k, m) in graph.moves().iter().enumerate() {
            node_moves[m.dst.0 as usize].push(k);
            if m.src != m.dst {
                node_moves[m.src.0 as usize].push(k);
            }
        }
        let mut c = Colorer {
            program,
            tables: ClassTables::new(options.physical_registers()),
            num_regs: options.physical_registers(),
            state: program
                .regs
                .iter()
                .map(|r| {
                    if r.precolor.is_some() {
                        NodeState::Precolored
                    } else {
                        NodeState::Active
                    }
                })
                .collect(),
            alias: vec![None; n],
            aligned: program.regs.iter().map(|r| r.aligned).collect(),
            adj: vec![HashSet::new(); n],
            lanes: HashMap::new(),
            q_total: vec![0; n],
            occurrences: (0..n).map(|r| graph.occurrences(RegId(r as u32))).collect(),
            moves: graph.moves().to_vec(),
            move_state: vec![
                if options.coalesce {
                    MoveState::Active
                } else {
                    MoveState::Frozen
                };
                graph.moves().len()
            ],
            node_moves,
            stack: Vec::new(),
        };
        for a in 0..n {
            for b in graph.neighbors(RegId(a as u32)) {
                let b = b.0 as usize;
                c.adj[a].insert(b);
                if a < b {
                    c.lanes.insert((a, b), graph.lanes(RegId(a as u32), RegId(b as u32)));
                }
            }
        }
        for a in 0..n {
            c.recompute_q(a);
        }
        c
    }
}

impl Colorer<'_> {
    fn width(&self, n: usize) -> u8 {
        self.program.regs[n].width
    }

    fn class(&self, n: usize) -> RegClass {
        RegClass::new(self.width(n), self.aligned[n])
    }

    fn counts(&self, n: usize) -> bool {
        matches!(self.state[n], NodeState::Active | NodeState::Precolored)
    }

    fn lane_matrix(&self, a: usize, b: usize) -> u16 {
        if a < b {
            self.lanes.get(&(a, b)).copied().unwrap_or(0)
        } else {
            transpose(self.lanes.get(&(b, a)).copied().unwrap_or(0))
        }
    }

    fn set_lane_matrix(&mut self, a: usize, b: usize, bits: u16) {
        if a < b {
            self.lanes.insert((a, b), bits);
        } else {
            self.lanes.insert((b, a), transpose(bits));
        }
    }

    fn recompute_q(&mut self, n: usize) {
        let class = self.class(n);
        self.q_total[n] = self
            .adj[n]
            .iter()
            .filter(|&&m| self.counts(m))
            .map(|&m| self.tables.q(self.class(m), class))
            .sum();
    }

    fn trivially_colorable(&self, n: usize) -> bool {
        self.q_total[n] < self.tables.p(self.class(n))
    }

    /// Root of `n`'s coalescing group and the map from `n`'s lanes to the root's. Every node on
    /// the way is re-pointed straight at the root.
    fn find(&mut self, n: usize) -> (usize, [u8; 4]) {
        let mut path = Vec::new();
        let mut root = n;
        while let Some((parent, _)) = self.alias[root] {
            path.push(root);
            root = parent;
        }
        let mut map = [0, 1, 2, 3];
        for &node in path.iter().rev() {
            if let Some((_, m)) = self.alias[node] {
                map = m.map(|l| map[l as usize]);
                self.alias[node] = Some((root, map));
            }
        }
        (root, map)
    }

    fn move_related(&self, n: usize) -> bool {
        self.node_moves[n]
            .iter()
            .any(|&k| self.move_state[k] == MoveState::Active)
    }

    fn run(&mut self) {
        let n = self.state.len();
        loop {
            let simplify = (0..n).find(|&i| {
                self.state[i] == NodeState::Active
                    && self.trivially_colorable(i)
                    && !self.move_related(i)
            });
            if let Some(i) = simplify {
                self.remove(i);
                continue;
            }
            if self.coalesce_step() {
                continue;
            }
            let freeze = (0..n).find(|&i| {
                self.state[i] == NodeState::Active
                    && self.trivially_colorable(i)
                    && self.move_related(i)
            });
            if let Some(i) = freeze {
                self.freeze(i);
                continue;
            }
            let candidate = (0..n)
                .filter(|&i| self.state[i] == NodeState::Active)
                .min_by(|&a, &b| self.spill_cost(a).total_cmp(&self.spill_cost(b)));
            match candidate {
                Some(i) => {
                    trace!(reg = i, cost = self.spill_cost(i), "potential spill");
                    self.freeze(i);
                    self.remove(i);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, n: usize) {
        self.state[n] = NodeState::Simplified;
        self.stack.push(n);
        let class = self.class(n);
        let neighbors: Vec<usize> = self.adj[n].iter().copied().collect();
        for m in neighbors {
            if self.counts(m) {
                let q = self.tables.q(class, self.class(m));
                self.q_total[m] = self.q_total[m].saturating_sub(q);
            }
        }
    }

    fn freeze(&mut self, n: usize) {
        for &k in &self.node_moves[n] {
            if self.move_state[k] == MoveState::Active {
                self.move_state[k] = MoveState::Frozen;
            }
        }
    }

    /// Spill cost: occurrences per unit of colourability gained by removing the node.
    fn spill_cost(&self, n: usize) -> f64 {
        let reg = &self.program.regs[n];
        if reg.spill_temp || reg.precolor.is_some() {
            return f64::INFINITY;
        }
        // Sorted so the float sum does not depend on set iteration order.
        let mut neighbors: Vec<usize> = self.adj[n].iter().copied().filter(|&m| self.counts(m)).collect();
        neighbors.sort_unstable();
        let benefit: f64 = neighbors
            .into_iter()
            .map(|m| {
                let cm = self.class(m);
                f64::from(self.tables.q(cm, self.class(n))) / f64::from(self.tables.p(cm))
            })
            .sum();
        if benefit == 0.0 {
            return f64::INFINITY;
        }
        f64::from(self.occurrences[n]) / benefit
    }

    /// Tries the first move that can make progress; returns whether anything changed.
    fn coalesce_step(&mut self) -> bool {
        for k in 0..self.moves.len() {
            if self.move_state[k] != MoveState::Active {
                continue;
            }
            match self.try_coalesce(self.moves[k]) {
                Some(state) => {
                    self.move_state[k] = state;
                    return true;
                }
                None => continue,
            }
        }
        false
    }

    /// Returns the move's new state, or `None` when it should be retried later.
    fn try_coalesce(&mut self, mv: Move) -> Option<MoveState> {
        let (rd, md) = self.find(mv.dst.0 as usize);
        let (rs, ms) = self.find(mv.src.0 as usize);
        let pairs: Vec<(u8, u8)> = mv
            .lanes
            .iter()
            .enumerate()
            .filter_map(|(l, s)| s.map(|s| (md[l], ms[s as usize])))
            .collect();

        if rd == rs {
            let consistent = pairs.iter().all(|&(a, b)| a == b);
            return Some(if consistent {
                MoveState::Coalesced
            } else {
                MoveState::Constrained
            });
        }

        let regs = &self.program.regs;
        if regs[rd].spill_temp || regs[rs].spill_temp {
            return Some(MoveState::Constrained);
        }
        let (pd, ps) = (regs[rd].precolor.is_some(), regs[rs].precolor.is_some());
        if pd && ps {
            return Some(MoveState::Constrained);
        }
        let (wd, ws) = (self.width(rd), self.width(rs));
        // The wider register absorbs the narrower one; a precoloured register is never absorbed.
        let dst_absorbs = if pd || ps {
            if (pd && wd < ws) || (ps && ws < wd) {
                return Some(MoveState::Constrained);
            }
            pd
        } else {
            wd >= ws
        };
        let (big, small) = if dst_absorbs { (rd, rs) } else { (rs, rd) };

        // Map from small lanes to big lanes; every small lane exactly once, injectively.
        let mut map = [u8::MAX; 4];
        for &(a, b) in &pairs {
            let (lb, ls) = if dst_absorbs { (a, b) } else { (b, a) };
            let slot = &mut map[ls as usize];
            if *slot != u8::MAX && *slot != lb {
                return Some(MoveState::Constrained);
            }
            *slot = lb;
        }
        let ws = self.width(small);
        let mut used = 0u8;
        for l in 0..ws {
            let lb = map[l as usize];
            if lb == u8::MAX || used & (1 << lb) != 0 {
                return Some(MoveState::Constrained);
            }
            used |= 1 << lb;
        }
        for l in ws..4 {
            map[l as usize] = l;
        }
        if self.aligned[small] && (0..ws).any(|l| map[l as usize] != l) {
            return Some(MoveState::Constrained);
        }

        let bits = self.lane_matrix(small, big);
        for i in 0..ws {
            let j = map[i as usize];
            if bits & (1 << (i * 4 + j)) != 0 {
                return Some(MoveState::Constrained);
            }
        }

        if !self.briggs(big, small) {
            return None;
        }
        trace!(small, big, ?map, "coalesced");
        self.merge(small, big, map);
        Some(MoveState::Coalesced)
    }

    /// Conservative test on the node that merging `small` into `big` would create.
    fn briggs(&self, big: usize, small: usize) -> bool {
        let merged = RegClass::new(self.width(big), self.aligned[big] || self.aligned[small]);
        let neighbors: HashSet<usize> = self.adj[big]
            .iter()
            .chain(&self.adj[small])
            .copied()
            .filter(|&m| m != big && m != small && self.counts(m))
            .collect();
        let significant: u32 = neighbors
            .iter()
            .filter(|&&m| self.state[m] == NodeState::Precolored || !self.trivially_colorable(m))
            .map(|&m| self.tables.q(self.class(m), merged))
            .sum();
        significant < self.tables.p(merged)
    }

    fn merge(&mut self, small: usize, big: usize, map: [u8; 4]) {
        self.alias[small] = Some((big, map));
        self.state[small] = NodeState::Coalesced;
        self.aligned[big] |= self.aligned[small];
        self.occurrences[big] += self.occurrences[small];
        let absorbed = core::mem::take(&mut self.node_moves[small]);
        self.node_moves[big].extend(absorbed);

        let neighbors: Vec<usize> = self.adj[small].iter().copied().collect();
        for x in neighbors {
            let bits = self.lane_matrix(small, x);
            self.adj[x].remove(&small);
            if x == big {
                continue;
            }
            let mut moved = 0u16;
            for i in 0..4u16 {
                for j in 0..4u16 {
                    if bits & (1 << (i * 4 + j)) != 0 {
                        moved |= 1 << (u16::from(map[i as usize]) * 4 + j);
                    }
                }
            }
            let merged = self.lane_matrix(big, x) | moved;
            self.set_lane_matrix(big, x, merged);
            self.adj[big].insert(x);
            self.adj[x].insert(big);
        }
        self.adj[small].clear();
        self.adj[big].remove(&small);

        self.recompute_q(big);
        let neighbors: Vec<usize> = self.adj[big].iter().copied().collect();
        for x in neighbors {
            self.recompute_q(x);
        }
    }

    fn placement_free(&self, n: usize, phys: u8, offset: u8, colors: &[Option<Placement>]) -> bool {
        self.adj[n].iter().all(|&m| {
            let Some(other) = colors[m] else {
                return true;
            };
            if other.phys != phys {
                return true;
            }
            let bits = self.lane_matrix(n, m);
            (0..4u8).all(|i| {
                (0..4u8).all(|j| bits & (1 << (i * 4 + j)) == 0 || offset + i != other.lanes[j as usize])
            })
        })
    }

    fn select(mut self) -> Coloring {
        let n = self.state.len();
        let mut colors: Vec<Option<Placement>> = vec![None; n];
        for i in 0..n {
            if let Some(phys) = self.program.regs[i].precolor {
                if self.state[i] == NodeState::Precolored {
                    colors[i] = Some(Placement {
                        phys,
                        lanes: [0, 1, 2, 3],
                    });
                }
            }
        }

        let mut spilled = Vec::new();
        for &node in self.stack.iter().rev() {
            let class = self.class(node);
            let found = (0..self.num_regs).find_map(|phys| {
                class
                    .offsets()
                    .find(|&off| self.placement_free(node, phys, off, &colors))
                    .map(|off| Placement {
                        phys,
                        lanes: [off, off + 1, off + 2, off + 3].map(|l| l.min(3)),
                    })
            });
            match found {
                Some(p) => colors[node] = Some(p),
                None => spilled.push(node),
            }
        }

        if !spilled.is_empty() {
            let regs: Vec<RegId> = (0..n)
                .filter(|&r| spilled.contains(&self.find(r).0))
                .map(|r| RegId(r as u32))
                .collect();
            return Coloring::Spill(regs);
        }

        let mut placements = Vec::with_capacity(n);
        let mut roots = Vec::with_capacity(n);
        for r in 0..n {
            let (root, map) = self.find(r);
            let base = colors[root].unwrap_or(Placement {
                phys: 0,
                lanes: [0, 1, 2, 3],
            });
            placements.push(Placement {
                phys: base.phys,
                lanes: map.map(|l| base.lanes[l as usize]),
            });
            roots.push(RegId(root as u32));
        }
        Coloring::Colored { placements, roots }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{LirBlock, LirDst, LirInstr, LirOp, LirSrc};
    use crate::regalloc::liveness::Liveness;
    use crate::types::{Swizzle, WriteMask};

    fn varying(r: RegId, index: u32) -> LirInstr {
        LirInstr::new(LirOp::LoadVarying, Some(LirDst::reg(r, WriteMask::X)), Vec::new())
            .with_index(index)
    }

    fn colored(p: &LirProgram, options: &CompileOptions) -> (Vec<Placement>, Vec<RegId>) {
        let live = Liveness::compute(p);
        let graph = Interference::build(p, &live);
        match color(p, &graph, options) {
            Coloring::Colored { placements, roots } => (placements, roots),
            Coloring::Spill(regs) => panic!("unexpected spill of {regs:?}"),
        }
    }

    /// a, b scalars copied into v.x / v.y, v copied to the output.
    fn combine_program() -> (LirProgram, [RegId; 4]) {
        let mut p = LirProgram::default();
        let a = p.new_reg(1, false);
        let b = p.new_reg(1, false);
        let v = p.new_reg(2, false);
        let out = p.new_reg(4, true);
        p.regs[out.0 as usize].precolor = Some(0);
        p.blocks.push(LirBlock {
            instrs: vec![
                varying(a, 0),
                varying(b, 1),
                LirInstr::mov(LirDst::reg(v, WriteMask::X), LirSrc::reg(a)),
                LirInstr::mov(
                    LirDst::reg(v, WriteMask::Y),
                    LirSrc::reg(b).with_swizzle(Swizzle::splat(0)),
                ),
                LirInstr::mov(
                    LirDst::reg(out, WriteMask::XYZW),
                    LirSrc::reg(v).with_swizzle(Swizzle([0, 1, 0, 0])),
                ),
            ],
            output: Some(out),
            stop: true,
            ..Default::default()
        });
        (p, [a, b, v, out])
    }

    #[test]
    fn combine_lanes_coalesce_into_the_vector() {
        let (p, [a, b, v, out]) = combine_program();
        let (placements, roots) = colored(&p, &CompileOptions::default());
        assert_eq!(roots[a.0 as usize], roots[v.0 as usize]);
        assert_eq!(roots[b.0 as usize], roots[v.0 as usize]);
        let pv = placements[v.0 as usize];
        assert_eq!(placements[a.0 as usize].lanes[0], pv.lanes[0]);
        assert_eq!(placements[b.0 as usize].lanes[0], pv.lanes[1]);
        assert_eq!(placements[out.0 as usize].phys, 0);
    }

    #[test]
    fn without_coalescing_interfering_lanes_differ() {
        let (p, [a, b, ..]) = combine_program();
        let options = CompileOptions {
            coalesce: false,
            ..Default::default()
        };
        let (placements, roots) = colored(&p, &options);
        assert_ne!(roots[a.0 as usize], roots[b.0 as usize]);
        let (pa, pb) = (placements[a.0 as usize], placements[b.0 as usize]);
        assert!(pa.phys != pb.phys || pa.lanes[0] != pb.lanes[0]);
    }

    #[test]
    fn too_many_live_vectors_spill() {
        // Five vec4 values live at once with two registers.
        let mut p = LirProgram::default();
        let regs: Vec<RegId> = (0..5).map(|_| p.new_reg(4, false)).collect();
        let out = p.new_reg(4, true);
        p.regs[out.0 as usize].precolor = Some(0);
        let mut instrs: Vec<LirInstr> = regs
            .iter()
            .enumerate()
            .map(|(i, &r)| {
                LirInstr::new(
                    LirOp::LoadVarying,
                    Some(LirDst::reg(r, WriteMask::XYZW)),
                    Vec::new(),
                )
                .with_index(i as u32)
            })
            .collect();
        let mut acc = regs[0];
        for &r in &regs[1..] {
            let next = p.new_reg(4, false);
            instrs.push(LirInstr::new(
                LirOp::Add,
                Some(LirDst::reg(next, WriteMask::XYZW)),
                vec![LirSrc::reg(acc), LirSrc::reg(r)],
            ));
            acc = next;
        }
        instrs.push(LirInstr::mov(LirDst::reg(out, WriteMask::XYZW), LirSrc::reg(acc)));
        p.blocks.push(LirBlock {
            instrs,
            output: Some(out),
            stop: true,
            ..Default::default()
        });

        let live = Liveness::compute(&p);
        let graph = Interference::build(&p, &live);
        let options = CompileOptions {
            num_registers: 2,
            ..Default::default()
        };
        match color(&p, &graph, &options) {
            Coloring::Spill(regs) => assert!(!regs.is_empty()),
            Coloring::Colored { .. } => panic!("five live vectors cannot fit in two registers"),
        }
    }

    fn colorer<'a>(p: &'a LirProgram) -> Colorer<'a> {
        let live = Liveness::compute(p);
        let graph = Interference::build(p, &live);
        Colorer::new(p, &graph, &CompileOptions::default())
    }

    #[test]
    fn find_composes_lane_maps_and_flattens_the_chain() {
        let (p, [a, b, v, _]) = combine_program();
        let mut c = colorer(&p);
        let (a, b, v) = (a.0 as usize, b.0 as usize, v.0 as usize);
        c.alias[a] = Some((b, [1, 0, 2, 3]));
        c.alias[b] = Some((v, [3, 2, 1, 0]));

        assert_eq!(c.find(a), (v, [2, 3, 1, 0]));
        assert_eq!(c.alias[a], Some((v, [2, 3, 1, 0])));
        assert_eq!(c.find(b), (v, [3, 2, 1, 0]));
        assert_eq!(c.find(a), (v, [2, 3, 1, 0]));
        assert_eq!(c.find(v), (v, [0, 1, 2, 3]));
    }

    #[test]
    fn merged_groups_carry_the_moves_of_their_members() {
        let (p, [a, b, v, _]) = combine_program();
        let mut c = colorer(&p);
        let (a, b, v) = (a.0 as usize, b.0 as usize, v.0 as usize);
        assert!(c.move_related(a));
        assert!(c.move_related(b));

        c.merge(a, v, [0, 1, 2, 3]);
        assert!(c.node_moves[a].is_empty());
        assert!(c.move_related(v));

        // Freezing the group freezes the move from `b` as well.
        c.freeze(v);
        assert!(!c.move_related(v));
        assert!(!c.move_related(b));
    }
}
