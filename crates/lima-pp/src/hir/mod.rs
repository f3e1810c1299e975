//! SSA program graph ("HIR"): basic blocks of commands with explicit def-use tracking.
//!
//! Commands and blocks live in arenas addressed by [`CmdId`]/[`BlockId`]. Every command records
//! which commands and which block ends read it, so dead-code checks and use rewriting are
//! proportional to the number of uses. Phi sources are ordered like the block's predecessor list,
//! which is maintained explicitly for that reason.

pub mod build;
pub mod copy_prop;
pub mod cssa;
pub mod dce;
pub mod display;
pub mod dom;
pub mod eval;
pub mod fold;
pub mod interp;
pub mod lower;
pub mod op;
pub mod verify;

use hashbrown::HashSet;
use tracing::{debug, warn};

use crate::options::CompileOptions;
use crate::types::{BranchCond, OutputModifier, Swizzle};
use op::Op;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmdId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Cmd(CmdId),
    Const([f32; 4]),
}

/// A command operand: a value read through a swizzle, then `abs`, then negation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Src {
    pub value: Value,
    pub swizzle: Swizzle,
    pub absolute: bool,
    pub negate: bool,
}

impl Src {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            swizzle: Swizzle::IDENTITY,
            absolute: false,
            negate: false,
        }
    }

    pub fn cmd(cmd: CmdId) -> Self {
        Self::new(Value::Cmd(cmd))
    }

    pub fn constant(value: [f32; 4]) -> Self {
        Self::new(Value::Const(value))
    }

    pub fn scalar(value: f32) -> Self {
        Self::constant([value; 4])
    }

    pub fn swizzled(mut self, swizzle: Swizzle) -> Self {
        self.swizzle = swizzle.compose(self.swizzle);
        self
    }

    pub fn lane(self, lane: u8) -> Self {
        self.swizzled(Swizzle::splat(lane))
    }

    pub fn neg(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    pub fn abs(mut self) -> Self {
        self.absolute = true;
        self.negate = false;
        self
    }

    pub fn has_modifiers(&self) -> bool {
        self.absolute || self.negate
    }

    pub fn cmd_id(&self) -> Option<CmdId> {
        match self.value {
            Value::Cmd(c) => Some(c),
            Value::Const(_) => None,
        }
    }

    /// The operand obtained when `self` reads the result of a plain move whose own source is
    /// `inner`.
    pub fn through(self, inner: Src) -> Src {
        let (absolute, negate) = if self.absolute {
            (true, self.negate)
        } else {
            (inner.absolute, self.negate ^ inner.negate)
        };
        Src {
            value: inner.value,
            swizzle: self.swizzle.compose(inner.swizzle),
            absolute,
            negate,
        }
    }

    /// Lane values this operand reads when its value is a constant.
    pub fn constant_value(&self) -> Option<[f32; 4]> {
        match self.value {
            Value::Const(c) => Some(eval::read_source(c, self.swizzle, self.absolute, self.negate)),
            Value::Cmd(_) => None,
        }
    }

    /// Same lanes as `self`, with the value replaced by the constant `value`.
    pub fn with_constant(self, value: [f32; 4]) -> Src {
        Src::constant(eval::read_source(
            value,
            self.swizzle,
            self.absolute,
            self.negate,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dst {
    pub width: u8,
    pub modifier: OutputModifier,
}

impl Dst {
    pub fn new(width: u8) -> Self {
        Self {
            width,
            modifier: OutputModifier::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cmd {
    pub op: Op,
    pub dst: Dst,
    /// Uniform, varying or sampler number, or the base address of a temporary access.
    pub index: u32,
    srcs: Vec<Src>,
    block: BlockId,
    uses: HashSet<CmdId>,
    block_uses: HashSet<BlockId>,
}

impl Cmd {
    pub fn srcs(&self) -> &[Src] {
        &self.srcs
    }

    pub fn block(&self) -> BlockId {
        self.block
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockEnd {
    Jump(BlockId),
    /// Takes `taken` when `cond(srcs[0].x, srcs[1].x)` holds.
    Branch {
        cond: BranchCond,
        srcs: [Src; 2],
        taken: BlockId,
        not_taken: BlockId,
    },
    Output(Src),
    Discard,
}

impl BlockEnd {
    pub fn successors(&self) -> impl Iterator<Item = BlockId> {
        let (a, b) = match *self {
            BlockEnd::Jump(t) => (Some(t), None),
            BlockEnd::Branch {
                taken, not_taken, ..
            } => (Some(taken), Some(not_taken)),
            BlockEnd::Output(_) | BlockEnd::Discard => (None, None),
        };
        a.into_iter().chain(b)
    }

    pub fn srcs(&self) -> &[Src] {
        match self {
            BlockEnd::Branch { srcs, .. } => srcs,
            BlockEnd::Output(src) => core::slice::from_ref(src),
            BlockEnd::Jump(_) | BlockEnd::Discard => &[],
        }
    }

    pub fn srcs_mut(&mut self) -> &mut [Src] {
        match self {
            BlockEnd::Branch { srcs, .. } => srcs,
            BlockEnd::Output(src) => core::slice::from_mut(src),
            BlockEnd::Jump(_) | BlockEnd::Discard => &mut [],
        }
    }

    /// Replaces successor `from` by `to`.
    pub fn retarget(&mut self, from: BlockId, to: BlockId) {
        match self {
            BlockEnd::Jump(t) if *t == from => *t = to,
            BlockEnd::Branch {
                taken, not_taken, ..
            } => {
                if *taken == from {
                    *taken = to;
                }
                if *not_taken == from {
                    *not_taken = to;
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    phis: Vec<CmdId>,
    cmds: Vec<CmdId>,
    end: BlockEnd,
    preds: Vec<BlockId>,
}

impl Block {
    pub fn phis(&self) -> &[CmdId] {
        &self.phis
    }

    pub fn cmds(&self) -> &[CmdId] {
        &self.cmds
    }

    pub fn end(&self) -> &BlockEnd {
        &self.end
    }

    pub fn preds(&self) -> &[BlockId] {
        &self.preds
    }
}

#[derive(Debug, Clone)]
pub struct Program {
    cmds: Vec<Option<Cmd>>,
    blocks: Vec<Option<Block>>,
    layout: Vec<BlockId>,
    pub entry: BlockId,
    /// Temporary storage (vec4 slots) used by indexed variables.
    pub temp_size: u32,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    pub fn new() -> Self {
        let mut program = Self {
            cmds: Vec::new(),
            blocks: Vec::new(),
            layout: Vec::new(),
            entry: BlockId(0),
            temp_size: 0,
        };
        program.entry = program.add_block();
        program
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Some(Block {
            phis: Vec::new(),
            cmds: Vec::new(),
            end: BlockEnd::Discard,
            preds: Vec::new(),
        }));
        self.layout.push(id);
        id
    }

    pub fn try_block(&self, b: BlockId) -> Option<&Block> {
        self.blocks.get(b.0 as usize).and_then(Option::as_ref)
    }

    pub fn block(&self, b: BlockId) -> &Block {
        match self.try_block(b) {
            Some(block) => block,
            None => panic!("block {} was removed", b.0),
        }
    }

    fn block_mut(&mut self, b: BlockId) -> &mut Block {
        match self.blocks.get_mut(b.0 as usize).and_then(Option::as_mut) {
            Some(block) => block,
            None => panic!("block {} was removed", b.0),
        }
    }

    pub fn try_cmd(&self, c: CmdId) -> Option<&Cmd> {
        self.cmds.get(c.0 as usize).and_then(Option::as_ref)
    }

    pub fn cmd(&self, c: CmdId) -> &Cmd {
        match self.try_cmd(c) {
            Some(cmd) => cmd,
            None => panic!("command {} was removed", c.0),
        }
    }

    pub(crate) fn cmd_mut(&mut self, c: CmdId) -> &mut Cmd {
        match self.cmds.get_mut(c.0 as usize).and_then(Option::as_mut) {
            Some(cmd) => cmd,
            None => panic!("command {} was removed", c.0),
        }
    }

    /// Blocks in layout order.
    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    pub(crate) fn set_layout(&mut self, layout: Vec<BlockId>) {
        self.layout = layout;
    }

    /// Live commands in id order.
    pub fn cmd_ids(&self) -> Vec<CmdId> {
        self.cmds
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(i, _)| CmdId(i as u32))
            .collect()
    }

    pub fn num_cmds(&self) -> usize {
        self.cmds.iter().filter(|c| c.is_some()).count()
    }

    /// Commands of a block, phis first.
    pub fn block_cmds(&self, b: BlockId) -> impl Iterator<Item = CmdId> + '_ {
        let block = self.block(b);
        block.phis.iter().chain(&block.cmds).copied()
    }

    pub fn value_width(&self, value: Value) -> u8 {
        match value {
            Value::Cmd(c) => self.cmd(c).dst.width,
            Value::Const(_) => 4,
        }
    }

    /// Number of positions source `index` of `cmd` reads.
    pub fn src_width(&self, cmd: CmdId, index: usize) -> u8 {
        let c = self.cmd(cmd);
        let first = c.srcs.first().map_or(4, |s| self.value_width(s.value));
        c.op.arg_width(index, c.dst.width, first)
    }

    fn add_uses(&mut self, user: CmdId, srcs: &[Src]) {
        for src in srcs {
            if let Value::Cmd(p) = src.value {
                self.cmd_mut(p).uses.insert(user);
            }
        }
    }

    fn drop_uses(&mut self, user: CmdId, srcs: &[Src]) {
        for src in srcs {
            if let Value::Cmd(p) = src.value {
                if let Some(Some(producer)) = self.cmds.get_mut(p.0 as usize) {
                    producer.uses.remove(&user);
                }
            }
        }
    }

    fn add_block_uses(&mut self, block: BlockId, srcs: &[Src]) {
        for src in srcs {
            if let Value::Cmd(p) = src.value {
                self.cmd_mut(p).block_uses.insert(block);
            }
        }
    }

    fn drop_block_uses(&mut self, block: BlockId, srcs: &[Src]) {
        for src in srcs {
            if let Value::Cmd(p) = src.value {
                if let Some(Some(producer)) = self.cmds.get_mut(p.0 as usize) {
                    producer.block_uses.remove(&block);
                }
            }
        }
    }

    fn alloc_cmd(&mut self, block: BlockId, op: Op, dst: Dst, srcs: Vec<Src>) -> CmdId {
        let id = CmdId(self.cmds.len() as u32);
        self.add_uses(id, &srcs);
        self.cmds.push(Some(Cmd {
            op,
            dst,
            index: 0,
            srcs,
            block,
            uses: HashSet::new(),
            block_uses: HashSet::new(),
        }));
        id
    }

    /// Appends a command at the end of `block`.
    pub fn append(&mut self, block: BlockId, op: Op, dst: Dst, srcs: Vec<Src>) -> CmdId {
        debug_assert!(op != Op::Phi);
        let id = self.alloc_cmd(block, op, dst, srcs);
        self.block_mut(block).cmds.push(id);
        id
    }

    /// Inserts a command immediately before the non-phi command `before`.
    pub fn insert_before(&mut self, before: CmdId, op: Op, dst: Dst, srcs: Vec<Src>) -> CmdId {
        let block = self.cmd(before).block;
        let id = self.alloc_cmd(block, op, dst, srcs);
        let cmds = &mut self.block_mut(block).cmds;
        let pos = cmds.iter().position(|&c| c == before).unwrap_or(cmds.len());
        cmds.insert(pos, id);
        id
    }

    /// Inserts a command at the start of `block`, after its phis.
    pub fn prepend(&mut self, block: BlockId, op: Op, dst: Dst, srcs: Vec<Src>) -> CmdId {
        let id = self.alloc_cmd(block, op, dst, srcs);
        self.block_mut(block).cmds.insert(0, id);
        id
    }

    /// Adds a phi without sources; fill them with [`Program::set_srcs`] in predecessor order.
    pub fn add_phi(&mut self, block: BlockId, width: u8) -> CmdId {
        let id = self.alloc_cmd(block, Op::Phi, Dst::new(width), Vec::new());
        self.block_mut(block).phis.push(id);
        id
    }

    pub fn set_srcs(&mut self, cmd: CmdId, srcs: Vec<Src>) {
        let old = core::mem::take(&mut self.cmd_mut(cmd).srcs);
        self.drop_uses(cmd, &old);
        self.add_uses(cmd, &srcs);
        self.cmd_mut(cmd).srcs = srcs;
    }

    /// Turns `cmd` into `op(srcs)` in place, keeping its id, destination and users.
    pub fn rewrite(&mut self, cmd: CmdId, op: Op, srcs: Vec<Src>) {
        self.cmd_mut(cmd).op = op;
        self.set_srcs(cmd, srcs);
    }

    /// Replaces the end of `block`, keeping predecessor lists of the successors in sync. A
    /// successor that is no longer reached loses the corresponding phi sources.
    pub fn set_end(&mut self, block: BlockId, end: BlockEnd) {
        let old = core::mem::replace(&mut self.block_mut(block).end, end.clone());
        self.drop_block_uses(block, old.srcs());
        self.add_block_uses(block, end.srcs());

        let old_succs: Vec<BlockId> = old.successors().collect();
        let new_succs: Vec<BlockId> = end.successors().collect();
        for s in &old_succs {
            if !new_succs.contains(s) {
                self.remove_pred(*s, block);
            }
        }
        for s in new_succs {
            if !old_succs.contains(&s) && !self.block(s).preds.contains(&block) {
                self.block_mut(s).preds.push(block);
            }
        }
    }

    /// Replaces predecessor `old` of `block` by `new` at the same position.
    pub(crate) fn replace_pred(&mut self, block: BlockId, old: BlockId, new: BlockId) {
        for p in &mut self.block_mut(block).preds {
            if *p == old {
                *p = new;
            }
        }
    }

    /// Removes predecessor `pred` of `block` together with the matching phi sources.
    pub(crate) fn remove_pred(&mut self, block: BlockId, pred: BlockId) {
        let Some(index) = self.block(block).preds.iter().position(|&p| p == pred) else {
            return;
        };
        self.block_mut(block).preds.remove(index);
        for phi in self.block(block).phis.clone() {
            let mut srcs = self.cmd(phi).srcs.clone();
            if index < srcs.len() {
                srcs.remove(index);
                self.set_srcs(phi, srcs);
            }
        }
    }

    /// Inserts an empty block on the edge `from -> to`, keeping `to`'s predecessor order.
    pub(crate) fn split_edge(&mut self, from: BlockId, to: BlockId) -> BlockId {
        let mid = self.add_block();
        self.block_mut(from).end.retarget(to, mid);
        let m = self.block_mut(mid);
        m.end = BlockEnd::Jump(to);
        m.preds.push(from);
        self.replace_pred(to, from, mid);
        mid
    }

    /// Commands reading `cmd`, sorted.
    pub fn users(&self, cmd: CmdId) -> Vec<CmdId> {
        let mut users: Vec<CmdId> = self.cmd(cmd).uses.iter().copied().collect();
        users.sort_unstable();
        users
    }

    /// Blocks whose end reads `cmd`, sorted.
    pub fn block_users(&self, cmd: CmdId) -> Vec<BlockId> {
        let mut users: Vec<BlockId> = self.cmd(cmd).block_uses.iter().copied().collect();
        users.sort_unstable();
        users
    }

    /// Combined command and block users.
    pub fn num_users(&self, cmd: CmdId) -> usize {
        let c = self.cmd(cmd);
        c.uses.len() + c.block_uses.len()
    }

    /// Rewrites every operand reading `old` (commands and block ends) to `f(operand)`.
    pub fn replace_uses_with(&mut self, old: CmdId, f: impl Fn(Src) -> Src) {
        for user in self.users(old) {
            let mut srcs = self.cmd(user).srcs.clone();
            for src in &mut srcs {
                if src.value == Value::Cmd(old) {
                    *src = f(*src);
                }
            }
            self.set_srcs(user, srcs);
        }
        for block in self.block_users(old) {
            let mut end = self.block(block).end.clone();
            for src in end.srcs_mut() {
                if src.value == Value::Cmd(old) {
                    *src = f(*src);
                }
            }
            self.set_end(block, end);
        }
    }

    /// Deletes a command nobody reads.
    pub fn remove_cmd(&mut self, cmd: CmdId) {
        debug_assert_eq!(self.num_users(cmd), 0, "removing command {} with users", cmd.0);
        let c = self.cmd(cmd);
        let (block, srcs) = (c.block, c.srcs.clone());
        self.drop_uses(cmd, &srcs);
        let b = self.block_mut(block);
        b.phis.retain(|&p| p != cmd);
        b.cmds.retain(|&p| p != cmd);
        self.cmds[cmd.0 as usize] = None;
    }

    /// Deletes a set of commands that may read each other but are read by nothing else.
    pub fn remove_cmds(&mut self, dead: &[CmdId]) {
        for &c in dead {
            self.set_srcs(c, Vec::new());
        }
        for &c in dead {
            self.remove_cmd(c);
        }
    }

    /// Deletes every block the entry cannot reach. Returns the number of blocks removed.
    pub fn remove_unreachable(&mut self) -> usize {
        let reachable: HashSet<BlockId> = dom::reverse_postorder(self).into_iter().collect();
        let dead: Vec<BlockId> = self
            .layout
            .iter()
            .copied()
            .filter(|b| !reachable.contains(b))
            .collect();
        if dead.is_empty() {
            return 0;
        }
        let mut cmds = Vec::new();
        for &b in &dead {
            self.set_end(b, BlockEnd::Discard);
            cmds.extend(self.block_cmds(b));
        }
        for &c in &cmds {
            self.set_srcs(c, Vec::new());
        }
        for &c in &cmds {
            if self.num_users(c) > 0 {
                warn!(cmd = c.0, "unreachable definition still in use");
                self.replace_uses_with(c, |s| s.with_constant([0.0; 4]));
            }
            self.remove_cmd(c);
        }
        for &b in &dead {
            self.blocks[b.0 as usize] = None;
        }
        self.layout.retain(|b| reachable.contains(b));
        dead.len()
    }

    /// Renumbers commands densely.
    pub fn compact(&mut self) {
        let mut remap = vec![None; self.cmds.len()];
        let mut next = 0u32;
        for (i, c) in self.cmds.iter().enumerate() {
            if c.is_some() {
                remap[i] = Some(CmdId(next));
                next += 1;
            }
        }
        if next as usize == self.cmds.len() {
            return;
        }
        let map = |c: CmdId| remap[c.0 as usize].unwrap_or(c);
        let map_src = |s: &mut Src| {
            if let Value::Cmd(c) = s.value {
                s.value = Value::Cmd(map(c));
            }
        };
        let cmds = core::mem::take(&mut self.cmds);
        self.cmds = cmds
            .into_iter()
            .flatten()
            .map(|mut c| {
                c.srcs.iter_mut().for_each(map_src);
                c.uses = c.uses.iter().map(|&u| map(u)).collect();
                c
            })
            .map(Some)
            .collect();
        for block in self.blocks.iter_mut().flatten() {
            block.phis.iter_mut().for_each(|c| *c = map(*c));
            block.cmds.iter_mut().for_each(|c| *c = map(*c));
            block.end.srcs_mut().iter_mut().for_each(map_src);
        }
    }

    /// Number of commands whose opcode still needs expansion.
    pub fn unsupported_ops(&self) -> usize {
        self.cmds
            .iter()
            .flatten()
            .filter(|c| !c.op.is_native() || (c.op.is_scalar_only() && c.dst.width > 1))
            .count()
    }
}

/// Runs folding, expansion, copy propagation and dead-code elimination until nothing changes
/// or the iteration cap is reached. Returns the number of iterations run.
pub fn optimize(program: &mut Program, options: &CompileOptions) -> u32 {
    let cap = options.max_opt_iterations.max(1);
    for iteration in 1..=cap {
        let mut changed = fold::run(program);
        changed |= lower::run(program);
        changed |= copy_prop::run(program);
        changed |= dce::run(program);
        if !changed {
            debug!(iterations = iteration, cmds = program.num_cmds(), "optimized program");
            return iteration;
        }
    }
    warn!(cap, "optimization did not reach a fixed point");
    cap
}
