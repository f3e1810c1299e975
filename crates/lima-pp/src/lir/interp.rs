//! Interpreter for LIR programs.
//!
//! Runs the instruction lists of unscheduled programs one instruction at a time, and the bundles
//! of scheduled programs with bundle semantics: registers are read when a bundle starts and
//! written when it ends, pipeline registers pass values between units of the same bundle.

use crate::hir::eval::{self, Inputs, InterpError, Outcome};
use crate::hir::interp::temp_address;
use crate::hir::op::Op;
use crate::limits::{MAX_PHYSICAL_REGISTERS, OUTPUT_REGISTER};

use super::bundle::Bundle;
use super::{LirDst, LirInstr, LirOp, LirProgram, LirSrc, LirValue, PipelineReg};

fn hir_op(op: LirOp) -> Option<Op> {
    Some(match op {
        LirOp::Mov => Op::Mov,
        LirOp::Add => Op::Add,
        LirOp::Mul => Op::Mul,
        LirOp::Min => Op::Min,
        LirOp::Max => Op::Max,
        LirOp::Floor => Op::Floor,
        LirOp::Ceil => Op::Ceil,
        LirOp::Fract => Op::Fract,
        LirOp::Sign => Op::Sign,
        LirOp::Gt => Op::Gt,
        LirOp::Ge => Op::Ge,
        LirOp::Eq => Op::Eq,
        LirOp::Ne => Op::Ne,
        LirOp::Select => Op::Select,
        LirOp::Sum3 => Op::Sum3,
        LirOp::Sum4 => Op::Sum4,
        LirOp::Ddx => Op::Ddx,
        LirOp::Ddy => Op::Ddy,
        LirOp::Rcp => Op::Rcp,
        LirOp::Rsqrt => Op::Rsqrt,
        LirOp::Sqrt => Op::Sqrt,
        LirOp::Exp2 => Op::Exp2,
        LirOp::Log2 => Op::Log2,
        LirOp::SinLut => Op::SinLut,
        LirOp::CosLut => Op::CosLut,
        LirOp::AtanPt1 => Op::AtanPt1,
        LirOp::Atan2Pt1 => Op::Atan2Pt1,
        LirOp::AtanPt2 => Op::AtanPt2,
        LirOp::Texld2d => Op::Texld2d,
        LirOp::Texld2dProj => Op::Texld2dProj,
        LirOp::TexldCube => Op::TexldCube,
        _ => return None,
    })
}

enum Flow {
    Next,
    Jump(usize),
    Discard,
}

struct Machine<'a> {
    program: &'a LirProgram,
    inputs: &'a Inputs,
    regs: Vec<[f32; 4]>,
    phys: [[f32; 4]; MAX_PHYSICAL_REGISTERS as usize],
    pipeline: [[f32; 4]; 2],
    temps: Vec<[f32; 4]>,
    steps: u64,
    limit: u64,
}

pub fn run(program: &LirProgram, inputs: &Inputs, step_limit: u64) -> Result<Outcome, InterpError> {
    let mut machine = Machine {
        program,
        inputs,
        regs: vec![[0.0; 4]; program.regs.len()],
        phys: Default::default(),
        pipeline: [[0.0; 4]; 2],
        temps: vec![[0.0; 4]; program.temp_size.max(1) as usize],
        steps: 0,
        limit: step_limit,
    };
    machine.run()
}

/// Register file contents visible to an instruction.
struct Snapshot {
    regs: Vec<[f32; 4]>,
    phys: [[f32; 4]; MAX_PHYSICAL_REGISTERS as usize],
}

impl Machine<'_> {
    fn step(&mut self) -> Result<(), InterpError> {
        self.steps += 1;
        if self.steps > self.limit {
            return Err(InterpError::StepLimit(self.limit));
        }
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            regs: self.regs.clone(),
            phys: self.phys,
        }
    }

    fn run(&mut self) -> Result<Outcome, InterpError> {
        let program = self.program;
        let scheduled = program.blocks.iter().any(|b| !b.bundles.is_empty());
        let mut block = 0;
        while block < program.blocks.len() {
            self.step()?;
            let b = &program.blocks[block];
            let flow = if scheduled {
                self.run_bundles(&b.bundles)?
            } else {
                self.run_instrs(&b.instrs)?
            };
            match flow {
                Flow::Discard => return Ok(Outcome::Discarded),
                Flow::Jump(target) => block = target,
                Flow::Next if b.stop => return Ok(Outcome::Color(self.color(block))),
                Flow::Next => block += 1,
            }
        }
        Ok(Outcome::Color([0.0; 4]))
    }

    fn color(&self, block: usize) -> [f32; 4] {
        if self.program.allocated {
            return self.phys[OUTPUT_REGISTER as usize];
        }
        self.program.blocks[block]
            .output
            .map_or([0.0; 4], |r| self.regs[r.0 as usize])
    }

    fn run_instrs(&mut self, instrs: &[LirInstr]) -> Result<Flow, InterpError> {
        for instr in instrs {
            self.step()?;
            let view = self.snapshot();
            let mut writes = Vec::new();
            match self.exec(instr, &view, None, &mut writes) {
                Flow::Next => {}
                flow => return Ok(flow),
            }
            self.commit(writes);
        }
        Ok(Flow::Next)
    }

    fn run_bundles(&mut self, bundles: &[Bundle]) -> Result<Flow, InterpError> {
        for bundle in bundles {
            self.step()?;
            let view = self.snapshot();
            let mut writes = Vec::new();
            let mut flow = Flow::Next;
            for instr in bundle.instrs() {
                match self.exec(instr, &view, Some(bundle), &mut writes) {
                    Flow::Next => {}
                    f => flow = f,
                }
            }
            self.commit(writes);
            if !matches!(flow, Flow::Next) {
                return Ok(flow);
            }
        }
        Ok(Flow::Next)
    }

    fn commit(&mut self, writes: Vec<(LirValue, u8, f32)>) {
        for (value, lane, v) in writes {
            match value {
                LirValue::Reg(r) => self.regs[r.0 as usize][lane as usize] = v,
                LirValue::Phys(p) => self.phys[p as usize][lane as usize] = v,
                _ => {}
            }
        }
    }

    fn fetch(&self, src: &LirSrc, view: &Snapshot, bundle: Option<&Bundle>) -> [f32; 4] {
        let value = match src.value {
            LirValue::Reg(r) => view.regs[r.0 as usize],
            LirValue::Phys(p) => view.phys[p as usize],
            LirValue::Pipeline(PipelineReg::Uniform) => self.pipeline[0],
            LirValue::Pipeline(PipelineReg::Texture) => self.pipeline[1],
            LirValue::Pipeline(reg) => {
                let k = usize::from(reg == PipelineReg::Const1);
                let mut v = [0.0; 4];
                if let Some(b) = bundle {
                    for (lane, &c) in b.consts()[k].iter().enumerate().take(4) {
                        v[lane] = c;
                    }
                }
                v
            }
            LirValue::Const(c) => c,
        };
        eval::read_source(value, src.swizzle, src.absolute, src.negate)
    }

    fn exec(
        &mut self,
        instr: &LirInstr,
        view: &Snapshot,
        bundle: Option<&Bundle>,
        writes: &mut Vec<(LirValue, u8, f32)>,
    ) -> Flow {
        let args: Vec<[f32; 4]> = instr
            .srcs
            .iter()
            .map(|s| self.fetch(s, view, bundle))
            .collect();
        let scalar = |i: usize| args.get(i).map(|a| a[0]);
        let size = self.temps.len();
        let result = match instr.op {
            LirOp::Branch { cond } => {
                let (a, b) = (scalar(0).unwrap_or(0.0), scalar(1).unwrap_or(0.0));
                return if cond.eval(a, b) {
                    Flow::Jump(instr.index as usize)
                } else {
                    Flow::Next
                };
            }
            LirOp::Discard => return Flow::Discard,
            LirOp::StoreTemp { width } => {
                let slot = temp_address(instr.index, scalar(1), size);
                let value = args.first().copied().unwrap_or_default();
                self.temps[slot][..width as usize].copy_from_slice(&value[..width as usize]);
                return Flow::Next;
            }
            LirOp::LoadUniform => self.inputs.uniform(instr.index),
            LirOp::LoadTemp => self.temps[temp_address(instr.index, scalar(0), size)],
            LirOp::LoadVarying => self.inputs.varying(instr.index),
            LirOp::FragCoord => self.inputs.frag_coord,
            LirOp::FrontFacing => [self.inputs.front_facing, 0.0, 0.0, 0.0],
            LirOp::PointCoord => {
                let [x, y] = self.inputs.point_coord;
                [x, y, 0.0, 0.0]
            }
            op if op.is_texture() => match hir_op(op) {
                Some(hop) => eval::sample_texture(hop, instr.index, args.first().copied().unwrap_or_default()),
                None => [0.0; 4],
            },
            op => hir_op(op)
                .and_then(|hop| eval::evaluate(hop, 4, 4, &args))
                .unwrap_or_default(),
        };
        if let Some(dst) = instr.dst {
            self.write(instr.op, dst, result, writes);
        }
        Flow::Next
    }

    fn write(&mut self, op: LirOp, dst: LirDst, result: [f32; 4], writes: &mut Vec<(LirValue, u8, f32)>) {
        let result = eval::apply_modifier(result, dst.modifier);
        match dst.value {
            LirValue::Pipeline(PipelineReg::Uniform) => self.pipeline[0] = result,
            LirValue::Pipeline(PipelineReg::Texture) => self.pipeline[1] = result,
            value => {
                for (j, lane) in dst.mask.lanes().enumerate() {
                    let v = if op.is_lanewise() {
                        result[lane as usize]
                    } else {
                        result[j]
                    };
                    writes.push((value, lane, v));
                }
            }
        }
    }
}
