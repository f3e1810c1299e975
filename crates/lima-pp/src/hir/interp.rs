//! Reference interpreter for the program graph.

use super::eval::{self, Inputs, InterpError, Outcome};
use super::op::Op;
use super::{BlockEnd, BlockId, Program, Src, Value};

struct Machine<'a> {
    program: &'a Program,
    inputs: &'a Inputs,
    values: Vec<[f32; 4]>,
    temps: Vec<[f32; 4]>,
    steps: u64,
    limit: u64,
}

pub fn run(program: &Program, inputs: &Inputs, step_limit: u64) -> Result<Outcome, InterpError> {
    let size = program.cmd_ids().last().map_or(0, |c| c.0 as usize + 1);
    let mut machine = Machine {
        program,
        inputs,
        values: vec![[0.0; 4]; size],
        temps: vec![[0.0; 4]; program.temp_size.max(1) as usize],
        steps: 0,
        limit: step_limit,
    };
    machine.run()
}

/// Slot addressed by a temporary access: the constant base plus the dynamic offset, clamped to
/// the allocated range.
pub(crate) fn temp_address(base: u32, offset: Option<f32>, size: usize) -> usize {
    let dynamic = offset.map_or(0, |o| o.max(0.0) as usize);
    (base as usize + dynamic).min(size.saturating_sub(1))
}

impl Machine<'_> {
    fn step(&mut self) -> Result<(), InterpError> {
        self.steps += 1;
        if self.steps > self.limit {
            return Err(InterpError::StepLimit(self.limit));
        }
        Ok(())
    }

    fn read(&self, src: &Src) -> [f32; 4] {
        let v = match src.value {
            Value::Cmd(c) => self.values[c.0 as usize],
            Value::Const(c) => c,
        };
        eval::read_source(v, src.swizzle, src.absolute, src.negate)
    }

    fn run(&mut self) -> Result<Outcome, InterpError> {
        let mut block = self.program.entry;
        let mut prev: Option<BlockId> = None;
        let program = self.program;
        loop {
            self.step()?;
            let b = program.block(block);

            if let Some(prev) = prev {
                let edge = b.preds().iter().position(|&p| p == prev).unwrap_or(0);
                let incoming: Vec<[f32; 4]> = b
                    .phis()
                    .iter()
                    .map(|&phi| {
                        let srcs = program.cmd(phi).srcs();
                        srcs.get(edge).map_or([0.0; 4], |s| self.read(s))
                    })
                    .collect();
                for (&phi, value) in b.phis().iter().zip(incoming) {
                    self.values[phi.0 as usize] = value;
                }
            }

            for &c in b.cmds() {
                self.step()?;
                self.exec(c);
            }

            match b.end() {
                BlockEnd::Jump(target) => {
                    prev = Some(block);
                    block = *target;
                }
                BlockEnd::Branch {
                    cond,
                    srcs,
                    taken,
                    not_taken,
                } => {
                    let (x, y) = (self.read(&srcs[0])[0], self.read(&srcs[1])[0]);
                    prev = Some(block);
                    block = if cond.eval(x, y) { *taken } else { *not_taken };
                }
                BlockEnd::Output(src) => return Ok(Outcome::Color(self.read(src))),
                BlockEnd::Discard => return Ok(Outcome::Discarded),
            }
        }
    }

    fn exec(&mut self, c: super::CmdId) {
        let program = self.program;
        let cmd = program.cmd(c);
        let args: Vec<[f32; 4]> = cmd.srcs().iter().map(|s| self.read(s)).collect();
        let offset = |i: usize| args.get(i).map(|a| a[0]);
        let value = match cmd.op {
            Op::LoadUniform => self.inputs.uniform(cmd.index),
            Op::LoadVarying => self.inputs.varying(cmd.index),
            Op::FragCoord => self.inputs.frag_coord,
            Op::FrontFacing => [self.inputs.front_facing, 0.0, 0.0, 0.0],
            Op::PointCoord => {
                let [x, y] = self.inputs.point_coord;
                [x, y, 0.0, 0.0]
            }
            Op::LoadTemp => self.temps[temp_address(cmd.index, offset(0), self.temps.len())],
            Op::StoreTemp => {
                let slot = temp_address(cmd.index, offset(1), self.temps.len());
                let value = args.first().copied().unwrap_or([0.0; 4]);
                for lane in 0..cmd.dst.width as usize {
                    self.temps[slot][lane] = value[lane];
                }
                return;
            }
            Op::Texld2d | Op::Texld2dProj | Op::TexldCube => {
                eval::sample_texture(cmd.op, cmd.index, args.first().copied().unwrap_or_default())
            }
            // Phis are assigned on block entry.
            Op::Phi => return,
            op => {
                let free = cmd
                    .srcs()
                    .first()
                    .map_or(4, |s| program.value_width(s.value));
                eval::evaluate(op, cmd.dst.width, free, &args).unwrap_or_default()
            }
        };
        self.values[c.0 as usize] = eval::apply_modifier(value, cmd.dst.modifier);
    }
}
