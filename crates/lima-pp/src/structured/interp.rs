//! Reference interpreter for the structured IR, before or after SSA construction.

use hashbrown::HashMap;

use crate::hir::eval::{self, Inputs, InterpError, Outcome};
use crate::hir::op::ResultWidth;
use crate::structured::{
    result_component, Assign, Index, JumpId, Operand, Place, Rhs, ShaderSource, Stmt, Value,
    VarId,
};

enum Flow {
    Next,
    Break(JumpId),
    Continue(JumpId),
    Discard,
    Output([f32; 4]),
}

struct Machine<'a> {
    src: &'a ShaderSource,
    inputs: &'a Inputs,
    storage: HashMap<VarId, Vec<[f32; 4]>>,
    steps: u64,
    limit: u64,
}

/// Runs `main`. Falling off the end of `main` outputs zero.
pub fn run(src: &ShaderSource, inputs: &Inputs, step_limit: u64) -> Result<Outcome, InterpError> {
    let main = src
        .function("main")
        .ok_or_else(|| InterpError::MissingFunction("main".into()))?;
    let mut machine = Machine {
        src,
        inputs,
        storage: HashMap::new(),
        steps: 0,
        limit: step_limit,
    };
    Ok(match machine.body(&main.body)? {
        Flow::Discard => Outcome::Discarded,
        Flow::Output(color) => Outcome::Color(color),
        Flow::Next | Flow::Break(_) | Flow::Continue(_) => Outcome::Color([0.0; 4]),
    })
}

impl Machine<'_> {
    fn slot(&mut self, var: VarId, index: usize) -> &mut [f32; 4] {
        let len = self.src.var(var).array_len.unwrap_or(1).max(1) as usize;
        let cells = self.storage.entry(var).or_insert_with(|| vec![[0.0; 4]; len]);
        let index = index.min(cells.len() - 1);
        &mut cells[index]
    }

    fn read_var(&mut self, var: VarId) -> [f32; 4] {
        *self.slot(var, 0)
    }

    fn element_index(&mut self, index: &Index) -> usize {
        match index {
            Index::Const(i) => *i as usize,
            Index::Dynamic(op) => self.operand(op)[0].max(0.0) as usize,
        }
    }

    fn value(&mut self, value: &Value) -> [f32; 4] {
        match value {
            Value::Var(v) => self.read_var(*v),
            Value::Element { var, index } => {
                let i = self.element_index(index);
                *self.slot(*var, i)
            }
            Value::Const(c) => *c,
            Value::Uniform(u) => self.inputs.uniform(*u),
            Value::Varying(v) => self.inputs.varying(*v),
            Value::FragCoord => self.inputs.frag_coord,
            Value::FrontFacing => [self.inputs.front_facing, 0.0, 0.0, 0.0],
            Value::PointCoord => {
                let [x, y] = self.inputs.point_coord;
                [x, y, 0.0, 0.0]
            }
            Value::Undef => [0.0; 4],
        }
    }

    fn operand(&mut self, op: &Operand) -> [f32; 4] {
        let v = self.value(&op.value);
        eval::read_source(v, op.swizzle, op.absolute, op.negate)
    }

    fn opt_var(&mut self, v: Option<VarId>) -> [f32; 4] {
        v.map(|v| self.read_var(v)).unwrap_or([0.0; 4])
    }

    fn assign(&mut self, a: &Assign) -> Result<(), InterpError> {
        let var = a.dst.var();
        let width = self.src.width(var);
        let result_width = self.src.result_width(&a.rhs, width);
        let raw = match &a.rhs {
            Rhs::Op { op, args } => {
                let values: Vec<[f32; 4]> = args.iter().map(|arg| self.operand(arg)).collect();
                let free = args.first().map_or(4, |arg| self.src.operand_width(arg));
                let eval_width = match op.info().result {
                    ResultWidth::Dest => width,
                    _ => result_width,
                };
                eval::evaluate(*op, eval_width, free, &values).unwrap_or([0.0; 4])
            }
            Rhs::Texture {
                op,
                sampler,
                coords,
            } => {
                let c = self.operand(coords);
                eval::sample_texture(*op, *sampler, c)
            }
        };
        let result = eval::apply_modifier(raw, a.modifier);

        let (slot_index, old) = match &a.dst {
            Place::Var(_) => {
                let old = match a.prior {
                    Some(p) => self.read_var(p),
                    None => self.read_var(var),
                };
                (0, old)
            }
            Place::Element { index, .. } => {
                let i = self.element_index(index);
                (i, *self.slot(var, i))
            }
        };
        let mut new = old;
        for lane in a.mask.lanes() {
            new[lane as usize] = result[result_component(result_width, lane) as usize];
        }
        *self.slot(var, slot_index) = new;
        Ok(())
    }

    fn step(&mut self) -> Result<(), InterpError> {
        self.steps += 1;
        if self.steps > self.limit {
            return Err(InterpError::StepLimit(self.limit));
        }
        Ok(())
    }

    /// Assigns `dests[i] = sources[i]` simultaneously.
    fn parallel_assign(&mut self, moves: &[(VarId, Option<VarId>)]) {
        let values: Vec<[f32; 4]> = moves.iter().map(|&(_, s)| self.opt_var(s)).collect();
        for (&(dest, _), value) in moves.iter().zip(values) {
            *self.slot(dest, 0) = value;
        }
    }

    fn body(&mut self, body: &[Stmt]) -> Result<Flow, InterpError> {
        for stmt in body {
            self.step()?;
            match stmt {
                Stmt::Assign(a) => self.assign(a)?,
                Stmt::If(s) => {
                    let a = self.operand(&s.cond.a)[0];
                    let b = self.operand(&s.cond.b)[0];
                    let taken = s.cond.cmp.eval(a, b);
                    let flow = if taken {
                        self.body(&s.then_body)?
                    } else {
                        self.body(&s.else_body)?
                    };
                    if !matches!(flow, Flow::Next) {
                        return Ok(flow);
                    }
                    let moves: Vec<_> = s
                        .phis
                        .iter()
                        .map(|p| (p.dest, if taken { p.if_true } else { p.if_false }))
                        .collect();
                    self.parallel_assign(&moves);
                }
                Stmt::Loop(l) => {
                    let enter: Vec<_> = l.begin_phis.iter().map(|p| (p.dest, p.enter)).collect();
                    self.parallel_assign(&enter);
                    loop {
                        self.step()?;
                        match self.body(&l.body)? {
                            Flow::Next => {
                                let moves: Vec<_> =
                                    l.begin_phis.iter().map(|p| (p.dest, p.repeat)).collect();
                                self.parallel_assign(&moves);
                            }
                            Flow::Continue(j) => {
                                let moves: Vec<_> = l
                                    .begin_phis
                                    .iter()
                                    .map(|p| (p.dest, jump_source(&p.continues, j)))
                                    .collect();
                                self.parallel_assign(&moves);
                            }
                            Flow::Break(j) => {
                                let moves: Vec<_> = l
                                    .end_phis
                                    .iter()
                                    .map(|p| (p.dest, jump_source(&p.breaks, j)))
                                    .collect();
                                self.parallel_assign(&moves);
                                break;
                            }
                            flow @ (Flow::Discard | Flow::Output(_)) => return Ok(flow),
                        }
                    }
                }
                Stmt::Break(j) => return Ok(Flow::Break(*j)),
                Stmt::Continue(j) => return Ok(Flow::Continue(*j)),
                Stmt::Discard => return Ok(Flow::Discard),
                Stmt::Call(call) => return Err(InterpError::Call(call.callee.clone())),
                Stmt::Output(op) => return Ok(Flow::Output(self.operand(op))),
            }
        }
        Ok(Flow::Next)
    }
}

fn jump_source(sources: &[(JumpId, Option<VarId>)], jump: JumpId) -> Option<VarId> {
    sources
        .iter()
        .find(|(j, _)| *j == jump)
        .and_then(|(_, v)| *v)
}
