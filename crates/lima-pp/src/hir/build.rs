//! Lowering of SSA-form structured code into the program graph.
//!
//! Register variables map directly to the command computing their current value. Variables that
//! are accessed by element (arrays) live in temporary storage and every access becomes a
//! `load_temp`/`store_temp`. Partial writes combine the new lanes with the previous value.

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use super::op::{Op, ResultWidth};
use super::{BlockEnd, BlockId, CmdId, Dst, Program, Src};
use crate::error::CompileError;
use crate::limits::MAX_CONTROL_FLOW_NESTING;
use crate::structured::ssa::visit_vars_with;
use crate::structured::{
    result_component, Assign, Index, JumpId, Operand, Place, Rhs, ShaderSource, Stmt, Value,
    VarId,
};
use crate::types::{OutputModifier, Swizzle, WriteMask};

struct LoopBlocks {
    header: BlockId,
    exit: BlockId,
}

struct Builder<'a> {
    src: &'a ShaderSource,
    program: Program,
    values: HashMap<VarId, Src>,
    memory: HashMap<VarId, u32>,
    current: Option<BlockId>,
    loops: Vec<LoopBlocks>,
    jumps: HashMap<JumpId, BlockId>,
    depth: usize,
}

/// Builds the program graph for `main`. `src` must already be in SSA form.
pub fn build(src: &ShaderSource) -> Result<Program, CompileError> {
    let main = src.function("main").ok_or(CompileError::MissingEntryPoint)?;

    let mut indexed = HashSet::new();
    visit_vars_with(&main.body, &mut |v, by_element| {
        if by_element {
            indexed.insert(v);
        }
    });
    let mut memory = HashMap::new();
    let mut temp_size = 0u32;
    for (v, decl) in src.live_vars() {
        if decl.array_len.is_some() || indexed.contains(&v) {
            memory.insert(v, temp_size);
            temp_size += decl.array_len.unwrap_or(1).max(1);
        }
    }

    let program = Program::new();
    let entry = program.entry;
    let mut builder = Builder {
        src,
        program,
        values: HashMap::new(),
        memory,
        current: Some(entry),
        loops: Vec::new(),
        jumps: HashMap::new(),
        depth: 0,
    };
    builder.program.temp_size = temp_size;
    builder.body(&main.body)?;
    if let Some(block) = builder.current {
        builder
            .program
            .set_end(block, BlockEnd::Output(Src::constant([0.0; 4])));
    }

    let mut program = builder.program;
    let removed = program.remove_unreachable();
    program.compact();
    debug!(
        blocks = program.layout().len(),
        cmds = program.num_cmds(),
        temp_size,
        unreachable = removed,
        "built program graph"
    );
    Ok(program)
}

impl Builder<'_> {
    fn emit(&mut self, op: Op, dst: Dst, srcs: Vec<Src>, index: u32) -> CmdId {
        let block = self.current.unwrap_or(self.program.entry);
        let cmd = self.program.append(block, op, dst, srcs);
        self.program.cmd_mut(cmd).index = index;
        cmd
    }

    fn input(&mut self, op: Op, width: u8, index: u32) -> Src {
        Src::cmd(self.emit(op, Dst::new(width), Vec::new(), index))
    }

    fn var_value(&self, var: Option<VarId>) -> Src {
        var.and_then(|v| self.values.get(&v).copied())
            .unwrap_or_else(|| Src::constant([0.0; 4]))
    }

    /// Address of an element access: constant part and optional dynamic offset.
    fn address(&mut self, var: VarId, index: &Index) -> (u32, Option<Src>) {
        let base = self.memory.get(&var).copied().unwrap_or(0);
        match index {
            Index::Const(i) => (base + i, None),
            Index::Dynamic(op) => {
                let offset = self.operand(op);
                (base, Some(offset))
            }
        }
    }

    fn load_element(&mut self, var: VarId, index: &Index) -> Src {
        let width = self.src.width(var);
        let (address, offset) = self.address(var, index);
        let srcs = offset.into_iter().collect();
        Src::cmd(self.emit(Op::LoadTemp, Dst::new(width), srcs, address))
    }

    fn value(&mut self, value: &Value) -> Src {
        match value {
            Value::Var(v) if self.memory.contains_key(v) => self.load_element(*v, &Index::Const(0)),
            Value::Var(v) => self.var_value(Some(*v)),
            Value::Element { var, index } => self.load_element(*var, index),
            Value::Const(c) => Src::constant(*c),
            Value::Uniform(u) => self.input(Op::LoadUniform, 4, *u),
            Value::Varying(v) => self.input(Op::LoadVarying, 4, *v),
            Value::FragCoord => self.input(Op::FragCoord, 4, 0),
            Value::FrontFacing => self.input(Op::FrontFacing, 1, 0),
            Value::PointCoord => self.input(Op::PointCoord, 2, 0),
            Value::Undef => Src::constant([0.0; 4]),
        }
    }

    fn operand(&mut self, op: &Operand) -> Src {
        let inner = self.value(&op.value);
        let outer = Src {
            value: inner.value,
            swizzle: op.swizzle,
            absolute: op.absolute,
            negate: op.negate,
        };
        outer.through(inner)
    }

    fn assign(&mut self, a: &Assign) {
        let var = a.dst.var();
        let width = self.src.width(var);
        let result_width = self.src.result_width(&a.rhs, width);
        let op = a.rhs.op();
        let (srcs, index, cmd_width) = match &a.rhs {
            Rhs::Op { op, args } => {
                let srcs = args.iter().map(|arg| self.operand(arg)).collect();
                let cmd_width = match op.info().result {
                    ResultWidth::Dest => width,
                    _ => result_width,
                };
                (srcs, 0, cmd_width)
            }
            Rhs::Texture {
                sampler, coords, ..
            } => (vec![self.operand(coords)], *sampler, 4),
        };

        let direct_modifier = op.info().output_modifiers || a.modifier == OutputModifier::None;
        let dst = Dst {
            width: cmd_width,
            modifier: if direct_modifier {
                a.modifier
            } else {
                OutputModifier::None
            },
        };
        let mut result = Src::cmd(self.emit(op, dst, srcs, index));
        if !direct_modifier {
            let dst = Dst {
                width: cmd_width,
                modifier: a.modifier,
            };
            result = Src::cmd(self.emit(Op::Mov, dst, vec![result], 0));
        }

        let full = a.mask == WriteMask::for_width(width);
        let value = if full && result_width == width {
            result
        } else if full {
            let mut swizzle = Swizzle::IDENTITY;
            for lane in 0..4 {
                swizzle.0[lane as usize] = result_component(result_width, lane.min(width - 1));
            }
            let mov = self.emit(Op::Mov, Dst::new(width), vec![result.swizzled(swizzle)], 0);
            Src::cmd(mov)
        } else {
            let prior = match &a.dst {
                Place::Var(v) if self.memory.contains_key(v) => {
                    self.load_element(*v, &Index::Const(0))
                }
                Place::Var(_) => self.var_value(a.prior),
                Place::Element { var, index } => self.load_element(*var, index),
            };
            let lanes = (0..width)
                .map(|lane| {
                    if a.mask.has_lane(lane) {
                        result.lane(result_component(result_width, lane))
                    } else {
                        prior.lane(lane)
                    }
                })
                .collect();
            Src::cmd(self.emit(Op::Combine, Dst::new(width), lanes, 0))
        };

        match &a.dst {
            Place::Var(v) if self.memory.contains_key(v) => {
                self.store(*v, &Index::Const(0), value);
            }
            Place::Var(v) => {
                self.values.insert(*v, value);
            }
            Place::Element { var, index } => self.store(*var, index, value),
        }
    }

    fn store(&mut self, var: VarId, index: &Index, value: Src) {
        let width = self.src.width(var);
        let (address, offset) = self.address(var, index);
        let mut srcs = vec![value];
        srcs.extend(offset);
        self.emit(Op::StoreTemp, Dst::new(width), srcs, address);
    }

    fn terminate(&mut self, end: BlockEnd) {
        if let Some(block) = self.current.take() {
            self.program.set_end(block, end);
        }
    }

    fn enter(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_CONTROL_FLOW_NESTING {
            return Err(CompileError::ControlFlowTooDeep {
                max: MAX_CONTROL_FLOW_NESTING,
            });
        }
        Ok(())
    }

    fn body(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        for stmt in body {
            if self.current.is_none() {
                break;
            }
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Assign(a) => self.assign(a),
            Stmt::If(s) => {
                self.enter()?;
                let a = self.operand(&s.cond.a);
                let b = self.operand(&s.cond.b);
                let then_block = self.program.add_block();
                let else_block = self.program.add_block();
                let join = self.program.add_block();
                self.terminate(BlockEnd::Branch {
                    cond: s.cond.cmp,
                    srcs: [a, b],
                    taken: then_block,
                    not_taken: else_block,
                });

                self.current = Some(then_block);
                self.body(&s.then_body)?;
                let then_end = self.current;
                self.terminate(BlockEnd::Jump(join));

                self.current = Some(else_block);
                self.body(&s.else_body)?;
                let else_end = self.current;
                self.terminate(BlockEnd::Jump(join));

                let preds = self.program.block(join).preds().to_vec();
                for phi in &s.phis {
                    let cmd = self.program.add_phi(join, self.src.width(phi.dest));
                    let srcs = preds
                        .iter()
                        .map(|&p| {
                            if Some(p) == then_end {
                                self.var_value(phi.if_true)
                            } else if Some(p) == else_end {
                                self.var_value(phi.if_false)
                            } else {
                                Src::constant([0.0; 4])
                            }
                        })
                        .collect();
                    self.program.set_srcs(cmd, srcs);
                    self.values.insert(phi.dest, Src::cmd(cmd));
                }
                self.current = (!preds.is_empty()).then_some(join);
                self.depth -= 1;
            }
            Stmt::Loop(l) => {
                self.enter()?;
                let header = self.program.add_block();
                let exit = self.program.add_block();
                let pre = self.current;
                self.terminate(BlockEnd::Jump(header));

                let begin: Vec<CmdId> = l
                    .begin_phis
                    .iter()
                    .map(|phi| {
                        let cmd = self.program.add_phi(header, self.src.width(phi.dest));
                        self.values.insert(phi.dest, Src::cmd(cmd));
                        cmd
                    })
                    .collect();

                self.loops.push(LoopBlocks { header, exit });
                self.current = Some(header);
                self.body(&l.body)?;
                let repeat = self.current;
                self.terminate(BlockEnd::Jump(header));
                self.loops.pop();

                let preds = self.program.block(header).preds().to_vec();
                for (phi, &cmd) in l.begin_phis.iter().zip(&begin) {
                    let srcs = preds
                        .iter()
                        .map(|&p| {
                            let source = if Some(p) == pre {
                                phi.enter
                            } else if Some(p) == repeat {
                                phi.repeat
                            } else {
                                self.jump_source(&phi.continues, p)
                            };
                            self.var_value(source)
                        })
                        .collect();
                    self.program.set_srcs(cmd, srcs);
                }

                let preds = self.program.block(exit).preds().to_vec();
                for phi in &l.end_phis {
                    let cmd = self.program.add_phi(exit, self.src.width(phi.dest));
                    let srcs = preds
                        .iter()
                        .map(|&p| self.var_value(self.jump_source(&phi.breaks, p)))
                        .collect();
                    self.program.set_srcs(cmd, srcs);
                    self.values.insert(phi.dest, Src::cmd(cmd));
                }
                self.current = (!preds.is_empty()).then_some(exit);
                self.depth -= 1;
            }
            Stmt::Break(j) => {
                if let (Some(block), Some(l)) = (self.current, self.loops.last()) {
                    let exit = l.exit;
                    self.jumps.insert(*j, block);
                    self.terminate(BlockEnd::Jump(exit));
                }
            }
            Stmt::Continue(j) => {
                if let (Some(block), Some(l)) = (self.current, self.loops.last()) {
                    let header = l.header;
                    self.jumps.insert(*j, block);
                    self.terminate(BlockEnd::Jump(header));
                }
            }
            Stmt::Discard => self.terminate(BlockEnd::Discard),
            Stmt::Output(op) => {
                let color = self.operand(op);
                self.terminate(BlockEnd::Output(color));
            }
            Stmt::Call(call) => {
                return Err(CompileError::UnresolvedCall {
                    callee: call.callee.clone(),
                })
            }
        }
        Ok(())
    }

    /// Source variable of the phi edge coming from the block that executed the jump.
    fn jump_source(&self, sources: &[(JumpId, Option<VarId>)], pred: BlockId) -> Option<VarId> {
        sources
            .iter()
            .find(|(j, _)| self.jumps.get(j) == Some(&pred))
            .and_then(|&(_, v)| v)
    }
}
