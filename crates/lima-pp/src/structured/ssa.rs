//! SSA construction over structured control flow.
//!
//! Dominance is approximated from the nesting structure instead of being computed on a CFG:
//! the statement before an `if` dominates both arms and the code after the `if`, and the
//! statement before a `loop` dominates the body and the code after the loop. The loop case
//! ignores that the body runs at least once, so some of the inserted phis are redundant; copy
//! propagation removes them later.
//!
//! Variables accessed through an element projection (arrays) are never renamed and stay in
//! temporary storage. A variable with a single definition that dominates all of its uses is
//! already in SSA form and is left alone, which makes the pass idempotent.

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::error::CompileError;
use crate::hir::op::Op;
use crate::structured::{
    Assign, Call, CallArg, IfPhi, Index, JumpId, LoopBeginPhi, LoopEndPhi, Operand, Place, Rhs,
    ShaderSource, Stmt, Value, VarId,
};
use crate::types::WriteMask;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SsaStats {
    /// Phi nodes inserted (a loop contributes a begin and an end phi per variable).
    pub phis: usize,
    /// Fresh SSA variables created by renaming.
    pub renamed: usize,
    /// Copies introduced for `out`/`inout` call arguments.
    pub call_copies: usize,
}

/// Rewrites every function into SSA form. Fails without touching `src` when control flow is
/// nested too deeply for the recursive walkers.
pub fn into_ssa(src: &mut ShaderSource) -> Result<SsaStats, CompileError> {
    src.check_nesting()?;
    let mut stats = SsaStats::default();
    let mut retired = HashSet::new();

    for index in 0..src.functions.len() {
        let mut body = core::mem::take(&mut src.functions[index].body);
        stats.call_copies += rewrite_calls(src, &mut body);

        let tracked = Analysis::run(src, &body).tracked();
        if !tracked.is_empty() {
            stats.phis += insert_phis(&mut body, &tracked);
            let mut renamer = Renamer {
                src: &mut *src,
                tracked: &tracked,
                stacks: HashMap::new(),
                log: Vec::new(),
                versions: HashMap::new(),
                loops: Vec::new(),
                created: 0,
            };
            renamer.body(&mut body);
            stats.renamed += renamer.created;
            retired.extend(tracked);
        }
        src.functions[index].body = body;
    }

    // A variable may still be referenced from a function where it was not renamed.
    let mut referenced = HashSet::new();
    for func in &src.functions {
        visit_vars(&func.body, &mut |v| {
            referenced.insert(v);
        });
    }
    for var in retired {
        if !referenced.contains(&var) {
            src.retire(var);
        }
    }

    debug!(
        phis = stats.phis,
        renamed = stats.renamed,
        call_copies = stats.call_copies,
        "built SSA form"
    );
    Ok(stats)
}

fn copy_stmt(dst: VarId, width: u8, src: VarId) -> Stmt {
    Stmt::Assign(Assign {
        dst: Place::Var(dst),
        mask: WriteMask::for_width(width),
        rhs: Rhs::Op {
            op: Op::Mov,
            args: vec![Operand::var(src)],
        },
        modifier: Default::default(),
        prior: None,
    })
}

/// Rewrites `out v` into `undef -> t; v = t` and `inout v` into `v -> t; v = t`, so the callee's
/// write lands in a fresh single-definition variable.
fn rewrite_calls(src: &mut ShaderSource, body: &mut Vec<Stmt>) -> usize {
    let mut copies = 0;
    let mut out = Vec::with_capacity(body.len());
    for mut stmt in body.drain(..) {
        let mut after = Vec::new();
        match &mut stmt {
            Stmt::Call(Call { args, .. }) => {
                for arg in args.iter_mut() {
                    let (var, input) = match arg {
                        CallArg::Out(v) => (*v, Operand::undef()),
                        CallArg::InOut(v) => (*v, Operand::var(*v)),
                        CallArg::In(_) | CallArg::Split { .. } => continue,
                    };
                    let decl = src.var(var);
                    let (name, width) = (format!("{}.out", decl.name), decl.width);
                    let temp = src.declare(name, width);
                    *arg = CallArg::Split {
                        input,
                        output: temp,
                    };
                    after.push(copy_stmt(var, width, temp));
                    copies += 1;
                }
            }
            Stmt::If(s) => {
                copies += rewrite_calls(src, &mut s.then_body);
                copies += rewrite_calls(src, &mut s.else_body);
            }
            Stmt::Loop(l) => copies += rewrite_calls(src, &mut l.body),
            _ => {}
        }
        out.push(stmt);
        out.extend(after);
    }
    *body = out;
    copies
}

fn visit_operand(op: &Operand, f: &mut impl FnMut(VarId, bool)) {
    match &op.value {
        Value::Var(v) => f(*v, false),
        Value::Element { var, index } => {
            f(*var, true);
            if let Index::Dynamic(index) = index {
                visit_operand(index, f);
            }
        }
        _ => {}
    }
}

fn visit_rhs(rhs: &Rhs, f: &mut impl FnMut(VarId, bool)) {
    match rhs {
        Rhs::Op { args, .. } => args.iter().for_each(|a| visit_operand(a, f)),
        Rhs::Texture { coords, .. } => visit_operand(coords, f),
    }
}

/// Calls `f` for every variable named anywhere in `body`, definitions and phis included.
fn visit_vars(body: &[Stmt], f: &mut impl FnMut(VarId)) {
    let mut g = |v: VarId, _: bool| f(v);
    visit_vars_with(body, &mut g);
}

pub(crate) fn visit_vars_with(body: &[Stmt], f: &mut impl FnMut(VarId, bool)) {
    for stmt in body {
        match stmt {
            Stmt::Assign(a) => {
                visit_rhs(&a.rhs, f);
                match &a.dst {
                    Place::Var(v) => f(*v, false),
                    Place::Element { var, index } => {
                        f(*var, true);
                        if let Index::Dynamic(index) = index {
                            visit_operand(index, f);
                        }
                    }
                }
                if let Some(p) = a.prior {
                    f(p, false);
                }
            }
            Stmt::If(s) => {
                visit_operand(&s.cond.a, f);
                visit_operand(&s.cond.b, f);
                visit_vars_with(&s.then_body, f);
                visit_vars_with(&s.else_body, f);
                for phi in &s.phis {
                    f(phi.dest, false);
                    phi.if_true.into_iter().chain(phi.if_false).for_each(|v| f(v, false));
                }
            }
            Stmt::Loop(l) => {
                visit_vars_with(&l.body, f);
                for phi in &l.begin_phis {
                    f(phi.dest, false);
                    let sources = phi.enter.into_iter().chain(phi.repeat);
                    sources
                        .chain(phi.continues.iter().filter_map(|(_, v)| *v))
                        .for_each(|v| f(v, false));
                }
                for phi in &l.end_phis {
                    f(phi.dest, false);
                    phi.breaks
                        .iter()
                        .filter_map(|(_, v)| *v)
                        .for_each(|v| f(v, false));
                }
            }
            Stmt::Call(call) => {
                for arg in &call.args {
                    match arg {
                        CallArg::In(op) => visit_operand(op, f),
                        CallArg::Out(v) | CallArg::InOut(v) => f(*v, false),
                        CallArg::Split { input, output } => {
                            visit_operand(input, f);
                            f(*output, false);
                        }
                    }
                }
            }
            Stmt::Output(op) => visit_operand(op, f),
            Stmt::Break(_) | Stmt::Continue(_) | Stmt::Discard => {}
        }
    }
}

/// Whether control can leave `body` through its end.
pub(crate) fn falls_through(body: &[Stmt]) -> bool {
    for stmt in body {
        match stmt {
            s if s.is_terminator() => return false,
            Stmt::If(s) if !falls_through(&s.then_body) && !falls_through(&s.else_body) => {
                return false
            }
            Stmt::Loop(l) if !has_break(&l.body) => return false,
            _ => {}
        }
    }
    true
}

/// Whether `body` contains a `break` of the loop it belongs to.
fn has_break(body: &[Stmt]) -> bool {
    body.iter().any(|stmt| match stmt {
        Stmt::Break(_) => true,
        Stmt::If(s) => has_break(&s.then_body) || has_break(&s.else_body),
        _ => false,
    })
}

/// Definition counts and the approximate-dominance check of every use.
struct Analysis<'a> {
    src: &'a ShaderSource,
    defs: Vec<u32>,
    indexed: Vec<bool>,
    undominated: Vec<bool>,
    visible: Vec<bool>,
    log: Vec<VarId>,
    loops: Vec<&'a crate::structured::Loop>,
}

impl<'a> Analysis<'a> {
    fn run(src: &'a ShaderSource, body: &'a [Stmt]) -> Self {
        let n = src.vars.len();
        let mut this = Self {
            src,
            defs: vec![0; n],
            indexed: vec![false; n],
            undominated: vec![false; n],
            visible: vec![false; n],
            log: Vec::new(),
            loops: Vec::new(),
        };
        for (v, decl) in src.live_vars() {
            if decl.array_len.is_some() {
                this.indexed[v.0 as usize] = true;
            }
        }
        this.body(body);
        this
    }

    fn tracked(&self) -> HashSet<VarId> {
        (0..self.defs.len())
            .filter(|&i| self.src.vars[i].is_some())
            .filter(|&i| !self.indexed[i] && (self.defs[i] > 1 || self.undominated[i]))
            .map(|i| VarId(i as u32))
            .collect()
    }

    fn use_var(&mut self, v: VarId) {
        let i = v.0 as usize;
        if !self.visible[i] {
            self.undominated[i] = true;
        }
    }

    fn use_opt(&mut self, v: Option<VarId>) {
        if let Some(v) = v {
            self.use_var(v);
        }
    }

    fn operand(&mut self, op: &Operand) {
        let mut seen = Vec::new();
        visit_operand(op, &mut |v, indexed| seen.push((v, indexed)));
        for (v, indexed) in seen {
            if indexed {
                self.indexed[v.0 as usize] = true;
            } else {
                self.use_var(v);
            }
        }
    }

    fn define(&mut self, v: VarId) {
        let i = v.0 as usize;
        self.defs[i] += 1;
        if !self.visible[i] {
            self.visible[i] = true;
            self.log.push(v);
        }
    }

    fn scope_end(&mut self, mark: usize) {
        for v in self.log.drain(mark..) {
            self.visible[v.0 as usize] = false;
        }
    }

    fn jump_sources(&mut self, jump: JumpId, is_break: bool) {
        let Some(l) = self.loops.last().copied() else {
            return;
        };
        if is_break {
            for phi in &l.end_phis {
                for (j, v) in &phi.breaks {
                    if *j == jump {
                        self.use_opt(*v);
                    }
                }
            }
        } else {
            for phi in &l.begin_phis {
                for (j, v) in &phi.continues {
                    if *j == jump {
                        self.use_opt(*v);
                    }
                }
            }
        }
    }

    fn body(&mut self, body: &'a [Stmt]) {
        for stmt in body {
            match stmt {
                Stmt::Assign(a) => {
                    match &a.rhs {
                        Rhs::Op { args, .. } => args.iter().for_each(|op| self.operand(op)),
                        Rhs::Texture { coords, .. } => self.operand(coords),
                    }
                    self.use_opt(a.prior);
                    match &a.dst {
                        Place::Var(v) => self.define(*v),
                        Place::Element { var, index } => {
                            self.indexed[var.0 as usize] = true;
                            if let Index::Dynamic(op) = index {
                                self.operand(op);
                            }
                        }
                    }
                }
                Stmt::If(s) => {
                    self.operand(&s.cond.a);
                    self.operand(&s.cond.b);
                    let mark = self.log.len();
                    self.body(&s.then_body);
                    if falls_through(&s.then_body) {
                        s.phis.iter().for_each(|p| self.use_opt(p.if_true));
                    }
                    self.scope_end(mark);
                    self.body(&s.else_body);
                    if falls_through(&s.else_body) {
                        s.phis.iter().for_each(|p| self.use_opt(p.if_false));
                    }
                    self.scope_end(mark);
                    s.phis.iter().for_each(|p| self.define(p.dest));
                }
                Stmt::Loop(l) => {
                    l.begin_phis.iter().for_each(|p| self.use_opt(p.enter));
                    let mark = self.log.len();
                    l.begin_phis.iter().for_each(|p| self.define(p.dest));
                    self.loops.push(l);
                    self.body(&l.body);
                    self.loops.pop();
                    if falls_through(&l.body) {
                        l.begin_phis.iter().for_each(|p| self.use_opt(p.repeat));
                    }
                    self.scope_end(mark);
                    l.end_phis.iter().for_each(|p| self.define(p.dest));
                }
                Stmt::Break(j) => self.jump_sources(*j, true),
                Stmt::Continue(j) => self.jump_sources(*j, false),
                Stmt::Discard => {}
                Stmt::Call(call) => {
                    for arg in &call.args {
                        match arg {
                            CallArg::In(op) => self.operand(op),
                            CallArg::Out(v) => self.define(*v),
                            CallArg::InOut(v) => {
                                self.use_var(*v);
                                self.define(*v);
                            }
                            CallArg::Split { input, output } => {
                                self.operand(input);
                                self.define(*output);
                            }
                        }
                    }
                }
                Stmt::Output(op) => self.operand(op),
            }
        }
    }
}

#[derive(Default)]
struct PhiSites {
    ifs: HashMap<usize, Vec<VarId>>,
    loops: HashMap<usize, Vec<VarId>>,
    placed: HashSet<(bool, usize, VarId)>,
    count: usize,
}

#[derive(Clone, Copy)]
enum Frame {
    If(usize),
    Loop(usize),
}

impl PhiSites {
    /// Walks the enclosing constructs outward from a definition, stopping at the first one that
    /// already has a phi for `var`.
    fn definition(&mut self, stack: &[Frame], var: VarId) {
        for frame in stack.iter().rev() {
            let (is_loop, id) = match *frame {
                Frame::If(id) => (false, id),
                Frame::Loop(id) => (true, id),
            };
            if !self.placed.insert((is_loop, id, var)) {
                return;
            }
            let list = if is_loop {
                self.count += 2;
                &mut self.loops
            } else {
                self.count += 1;
                &mut self.ifs
            };
            list.entry(id).or_default().push(var);
        }
    }

    fn collect(
        &mut self,
        body: &[Stmt],
        tracked: &HashSet<VarId>,
        stack: &mut Vec<Frame>,
        next_id: &mut usize,
    ) {
        for stmt in body {
            match stmt {
                Stmt::Assign(Assign {
                    dst: Place::Var(v), ..
                }) if tracked.contains(v) => self.definition(stack, *v),
                Stmt::Call(call) => {
                    for arg in &call.args {
                        if let CallArg::Split { output, .. } = arg {
                            if tracked.contains(output) {
                                self.definition(stack, *output);
                            }
                        }
                    }
                }
                Stmt::If(s) => {
                    let id = *next_id;
                    *next_id += 1;
                    stack.push(Frame::If(id));
                    self.collect(&s.then_body, tracked, stack, next_id);
                    self.collect(&s.else_body, tracked, stack, next_id);
                    stack.pop();
                }
                Stmt::Loop(l) => {
                    let id = *next_id;
                    *next_id += 1;
                    stack.push(Frame::Loop(id));
                    self.collect(&l.body, tracked, stack, next_id);
                    stack.pop();
                }
                _ => {}
            }
        }
    }

    fn place(&self, body: &mut [Stmt], next_id: &mut usize) {
        for stmt in body {
            match stmt {
                Stmt::If(s) => {
                    let id = *next_id;
                    *next_id += 1;
                    for &v in self.ifs.get(&id).into_iter().flatten() {
                        s.phis.push(IfPhi {
                            dest: v,
                            if_true: Some(v),
                            if_false: Some(v),
                        });
                    }
                    self.place(&mut s.then_body, next_id);
                    self.place(&mut s.else_body, next_id);
                }
                Stmt::Loop(l) => {
                    let id = *next_id;
                    *next_id += 1;
                    for &v in self.loops.get(&id).into_iter().flatten() {
                        l.begin_phis.push(LoopBeginPhi {
                            dest: v,
                            enter: Some(v),
                            repeat: Some(v),
                            continues: Vec::new(),
                        });
                        l.end_phis.push(LoopEndPhi {
                            dest: v,
                            breaks: Vec::new(),
                        });
                    }
                    self.place(&mut l.body, next_id);
                }
                _ => {}
            }
        }
    }
}

/// Inserts trivial phis for every tracked variable; returns how many were added.
fn insert_phis(body: &mut [Stmt], tracked: &HashSet<VarId>) -> usize {
    let mut sites = PhiSites::default();
    sites.collect(body, tracked, &mut Vec::new(), &mut 0);
    sites.place(body, &mut 0);
    sites.count
}

struct LoopFrame {
    /// Original variables with phis on this loop, in phi order.
    vars: Vec<VarId>,
    continues: Vec<(JumpId, Vec<Option<VarId>>)>,
    breaks: Vec<(JumpId, Vec<Option<VarId>>)>,
}

struct Renamer<'a> {
    src: &'a mut ShaderSource,
    tracked: &'a HashSet<VarId>,
    stacks: HashMap<VarId, Vec<VarId>>,
    /// Variables pushed, in order, so a scope can be popped.
    log: Vec<VarId>,
    versions: HashMap<VarId, u32>,
    loops: Vec<LoopFrame>,
    created: usize,
}

impl Renamer<'_> {
    fn top(&self, v: VarId) -> Option<VarId> {
        self.stacks.get(&v).and_then(|s| s.last().copied())
    }

    fn snapshot(&self, vars: &[VarId]) -> Vec<Option<VarId>> {
        vars.iter().map(|&v| self.top(v)).collect()
    }

    fn fresh(&mut self, original: VarId) -> VarId {
        let version = self.versions.entry(original).or_insert(0);
        *version += 1;
        let version = *version;
        let new = self.src.new_var(original, version);
        self.created += 1;
        self.stacks.entry(original).or_default().push(new);
        self.log.push(original);
        new
    }

    fn pop_to(&mut self, mark: usize) {
        while self.log.len() > mark {
            if let Some(v) = self.log.pop() {
                if let Some(stack) = self.stacks.get_mut(&v) {
                    stack.pop();
                }
            }
        }
    }

    fn operand(&mut self, op: &mut Operand) {
        match &mut op.value {
            Value::Var(v) if self.tracked.contains(v) => {
                op.value = match self.top(*v) {
                    Some(top) => Value::Var(top),
                    None => Value::Undef,
                };
            }
            Value::Element {
                index: Index::Dynamic(index),
                ..
            } => self.operand(index),
            _ => {}
        }
    }

    fn rhs(&mut self, rhs: &mut Rhs) {
        match rhs {
            Rhs::Op { args, .. } => args.iter_mut().for_each(|a| self.operand(a)),
            Rhs::Texture { coords, .. } => self.operand(coords),
        }
    }

    fn body(&mut self, body: &mut [Stmt]) {
        for stmt in body {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Assign(a) => {
                self.rhs(&mut a.rhs);
                match &mut a.dst {
                    Place::Var(v) if self.tracked.contains(v) => {
                        let original = *v;
                        if a.mask != WriteMask::for_width(self.src.width(original)) {
                            a.prior = self.top(original);
                        }
                        *v = self.fresh(original);
                    }
                    Place::Element {
                        index: Index::Dynamic(index),
                        ..
                    } => self.operand(index),
                    _ => {}
                }
            }
            Stmt::If(s) => {
                self.operand(&mut s.cond.a);
                self.operand(&mut s.cond.b);
                let vars: Vec<VarId> = s
                    .phis
                    .iter()
                    .map(|p| p.dest)
                    .filter(|v| self.tracked.contains(v))
                    .collect();

                let mark = self.log.len();
                self.body(&mut s.then_body);
                let then_live = falls_through(&s.then_body);
                let if_true = self.snapshot(&vars);
                self.pop_to(mark);

                self.body(&mut s.else_body);
                let else_live = falls_through(&s.else_body);
                let if_false = self.snapshot(&vars);
                self.pop_to(mark);

                let mut k = 0;
                for phi in &mut s.phis {
                    if !self.tracked.contains(&phi.dest) {
                        continue;
                    }
                    phi.if_true = if then_live { if_true[k] } else { None };
                    phi.if_false = if else_live { if_false[k] } else { None };
                    phi.dest = self.fresh(phi.dest);
                    k += 1;
                }
            }
            Stmt::Loop(l) => {
                let vars: Vec<VarId> = l
                    .begin_phis
                    .iter()
                    .map(|p| p.dest)
                    .filter(|v| self.tracked.contains(v))
                    .collect();
                let enter = self.snapshot(&vars);

                let mark = self.log.len();
                let mut renamed = Vec::with_capacity(vars.len());
                for (i, phi) in l.begin_phis.iter_mut().enumerate() {
                    if self.tracked.contains(&phi.dest) {
                        phi.dest = self.fresh(phi.dest);
                        renamed.push(i);
                    }
                }
                self.loops.push(LoopFrame {
                    vars: vars.clone(),
                    continues: Vec::new(),
                    breaks: Vec::new(),
                });
                self.body(&mut l.body);
                let repeat = if falls_through(&l.body) {
                    self.snapshot(&vars)
                } else {
                    vec![None; vars.len()]
                };
                let frame = self.loops.pop();
                self.pop_to(mark);

                let Some(frame) = frame else {
                    return;
                };
                for (k, &i) in renamed.iter().enumerate() {
                    let phi = &mut l.begin_phis[i];
                    phi.enter = enter[k];
                    phi.repeat = repeat[k];
                    phi.continues = frame
                        .continues
                        .iter()
                        .map(|(j, values)| (*j, values[k]))
                        .collect();
                }
                let mut k = 0;
                for phi in &mut l.end_phis {
                    if !self.tracked.contains(&phi.dest) {
                        continue;
                    }
                    phi.breaks = frame
                        .breaks
                        .iter()
                        .map(|(j, values)| (*j, values[k]))
                        .collect();
                    phi.dest = self.fresh(phi.dest);
                    k += 1;
                }
            }
            Stmt::Break(j) => {
                if let Some(frame) = self.loops.last() {
                    let values = self.snapshot(&frame.vars);
                    if let Some(frame) = self.loops.last_mut() {
                        frame.breaks.push((*j, values));
                    }
                }
            }
            Stmt::Continue(j) => {
                if let Some(frame) = self.loops.last() {
                    let values = self.snapshot(&frame.vars);
                    if let Some(frame) = self.loops.last_mut() {
                        frame.continues.push((*j, values));
                    }
                }
            }
            Stmt::Discard => {}
            Stmt::Call(call) => {
                for arg in &mut call.args {
                    match arg {
                        CallArg::In(op) => self.operand(op),
                        CallArg::Split { input, output } => {
                            self.operand(input);
                            if self.tracked.contains(output) {
                                *output = self.fresh(*output);
                            }
                        }
                        CallArg::Out(_) | CallArg::InOut(_) => {}
                    }
                }
            }
            Stmt::Output(op) => self.operand(op),
        }
    }
}
