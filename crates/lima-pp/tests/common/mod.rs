//! Shared helpers for `lima-pp` integration tests: a seeded random shader generator and random
//! fragment inputs.

#![allow(dead_code)]

use lima_pp::hir::eval::Inputs;
use lima_pp::hir::op::Op;
use lima_pp::lir::LirProgram;
use lima_pp::structured::{Cond, Operand, ShaderSource, Stmt, VarId};
use lima_pp::types::{BranchCond, OutputModifier, Swizzle, WriteMask};
use lima_pp::{hir, lir, structured, CompileOptions};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub const STEP_LIMIT: u64 = 200_000;
pub const TOLERANCE: f32 = 1e-5;

const CONSTANTS: [f32; 7] = [0.0, 0.5, 1.0, 2.0, -1.0, 3.0, 0.25];

const CONDS: [BranchCond; 6] = [
    BranchCond::Lt,
    BranchCond::Le,
    BranchCond::Gt,
    BranchCond::Ge,
    BranchCond::Eq,
    BranchCond::Ne,
];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Runs the pipeline up to register allocation: selected, cleaned and (optionally) reordered
/// LIR with virtual registers.
pub fn lower_to_lir(source: &ShaderSource, options: &CompileOptions) -> LirProgram {
    let mut source = source.clone();
    structured::ssa::into_ssa(&mut source).unwrap();
    let mut program = hir::build::build(&source).unwrap();
    hir::optimize(&mut program, options);
    hir::cssa::run(&mut program);
    let mut lir = lir::select::select(&program).unwrap();
    lir::dce::run(&mut lir);
    if options.schedule_for_pressure {
        lir::sched_pressure::run(&mut lir);
    }
    lir
}

pub fn random_inputs(rng: &mut ChaCha8Rng) -> Inputs {
    let mut vec4 = || [0; 4].map(|_| (rng.gen_range(-16i32..=16) as f32) / 8.0);
    Inputs {
        uniforms: (0..4).map(|_| vec4()).collect(),
        varyings: (0..4).map(|_| vec4()).collect(),
        frag_coord: vec4(),
        front_facing: 1.0,
        point_coord: [0.25, 0.75],
    }
}

/// Builds random shaders with nested `if`/`loop` control flow, `break` and `continue`. Every
/// variable is written before it is read and every loop is bounded by a counter.
pub struct ShaderGen {
    rng: ChaCha8Rng,
    src: ShaderSource,
    /// Variables random assignments may write.
    vars: Vec<VarId>,
    /// Loop counters readable at the current point.
    counters: Vec<VarId>,
    depth: u32,
    allow_discard: bool,
}

impl ShaderGen {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            src: ShaderSource::new(),
            vars: Vec::new(),
            counters: Vec::new(),
            depth: 0,
            allow_discard: true,
        }
    }

    pub fn without_discard(mut self) -> Self {
        self.allow_discard = false;
        self
    }

    pub fn generate(mut self, statements: usize) -> ShaderSource {
        let mut body = Vec::new();
        for k in 0..self.rng.gen_range(2..=5u32) {
            let width = self.rng.gen_range(1..=4u8);
            let v = self.src.declare(format!("v{k}"), width);
            body.push(self.src.assign(v, Op::Mov, vec![Operand::varying(k % 4)]));
            self.vars.push(v);
        }
        body.extend(self.block(statements, false));

        let out = *self.vars.choose(&mut self.rng).unwrap();
        let w = self.src.width(out);
        body.push(Stmt::Output(
            Operand::var(out).swizzled(Swizzle([0, 1 % w, 2 % w, 3 % w])),
        ));
        self.src.add_function("main", body);
        self.src
    }

    fn readable(&mut self) -> VarId {
        if !self.counters.is_empty() && self.rng.gen_bool(0.1) {
            return *self.counters.choose(&mut self.rng).unwrap();
        }
        *self.vars.choose(&mut self.rng).unwrap()
    }

    fn operand(&mut self, width: u8) -> Operand {
        let mut op = match self.rng.gen_range(0..10) {
            0..=5 => {
                let v = self.readable();
                let w = self.src.width(v);
                let rng = &mut self.rng;
                let swizzle = Swizzle([0; 4].map(|_| rng.gen_range(0..w)));
                Operand::var(v).swizzled(swizzle)
            }
            6 => Operand::uniform(self.rng.gen_range(0..4)),
            7 => Operand::varying(self.rng.gen_range(0..4)),
            _ => {
                let rng = &mut self.rng;
                let mut value = [0.0; 4];
                for lane in value.iter_mut().take(width as usize) {
                    *lane = *CONSTANTS.choose(rng).unwrap();
                }
                Operand::constant(value)
            }
        };
        if self.rng.gen_bool(0.1) {
            op = op.abs();
        }
        if self.rng.gen_bool(0.15) {
            op = op.neg();
        }
        op
    }

    fn cond(&mut self) -> Cond {
        let cmp = *CONDS.choose(&mut self.rng).unwrap();
        let a = self.operand(1);
        let b = self.operand(1);
        Cond::new(cmp, a, b)
    }

    fn assign(&mut self) -> Stmt {
        let dst = *self.vars.choose(&mut self.rng).unwrap();
        let w = self.src.width(dst);
        let (op, args, arg_width) = match self.rng.gen_range(0..17) {
            0 => (Op::Mov, 1, w),
            1 => (Op::Add, 2, w),
            2 => (Op::Sub, 2, w),
            3 => (Op::Mul, 2, w),
            4 => (Op::Min, 2, w),
            5 => (Op::Max, 2, w),
            6 => (Op::Floor, 1, w),
            7 => (Op::Fract, 1, w),
            8 => (Op::Abs, 1, w),
            9 => (Op::Neg, 1, w),
            10 => (Op::Lrp, 3, w),
            11 => (Op::Select, 3, w),
            12 if w == 1 => (Op::Dot3, 2, 3),
            13 if w == 1 => (Op::Dot2, 2, 2),
            14 if w == 1 => (Op::Dot4, 2, 4),
            15 if w == 1 => (Op::AllEq, 2, 4),
            16 => (Op::Not, 1, w),
            _ => (Op::Add, 2, w),
        };
        let args = (0..args).map(|_| self.operand(arg_width)).collect();
        let mut stmt = if w > 1 && self.rng.gen_bool(0.3) {
            let bits = self.rng.gen_range(1..(1u8 << w));
            self.src
                .assign_masked(dst, WriteMask::from_bits_retain(bits), op, args)
        } else {
            self.src.assign(dst, op, args)
        };
        if self.rng.gen_bool(0.1) {
            if let Stmt::Assign(a) = &mut stmt {
                a.modifier = OutputModifier::Saturate;
            }
        }
        stmt
    }

    fn block(&mut self, len: usize, in_loop: bool) -> Vec<Stmt> {
        let mut out = Vec::new();
        for _ in 0..len {
            let roll = self.rng.gen_range(0..20);
            match roll {
                0 | 1 if self.depth < 2 => {
                    self.depth += 1;
                    let cond = self.cond();
                    let then_len = self.rng.gen_range(1..4);
                    let else_len = self.rng.gen_range(0..3);
                    let then_body = self.block(then_len, in_loop);
                    let else_body = self.block(else_len, in_loop);
                    self.depth -= 1;
                    out.push(Stmt::if_else(cond, then_body, else_body));
                }
                2 if self.depth < 2 => out.extend(self.counted_loop()),
                3 if in_loop => {
                    let cond = self.cond();
                    let jump = self.src.new_jump();
                    out.push(Stmt::if_else(cond, vec![Stmt::Break(jump)], Vec::new()));
                }
                5 if in_loop => {
                    let cond = self.cond();
                    let jump = self.src.new_jump();
                    out.push(Stmt::if_else(cond, vec![Stmt::Continue(jump)], Vec::new()));
                }
                4 if self.allow_discard && self.rng.gen_bool(0.3) => {
                    let cond = self.cond();
                    out.push(Stmt::if_else(cond, vec![Stmt::Discard], Vec::new()));
                }
                _ => out.push(self.assign()),
            }
        }
        out
    }

    fn counted_loop(&mut self) -> Vec<Stmt> {
        let counter = self.src.declare(format!("i{}", self.counters.len()), 1);
        let init = self.src.assign(counter, Op::Mov, vec![Operand::scalar(0.0)]);
        let trips = self.rng.gen_range(1..=4) as f32;

        // Counting and the exit test come first so `continue` cannot skip them.
        let jump = self.src.new_jump();
        let mut body = vec![
            self.src.assign(
                counter,
                Op::Add,
                vec![Operand::var(counter), Operand::scalar(1.0)],
            ),
            Stmt::if_else(
                Cond::new(BranchCond::Gt, Operand::var(counter), Operand::scalar(trips)),
                vec![Stmt::Break(jump)],
                Vec::new(),
            ),
        ];

        self.depth += 1;
        self.counters.push(counter);
        let len = self.rng.gen_range(1..4);
        body.extend(self.block(len, true));
        self.counters.pop();
        self.depth -= 1;

        vec![init, Stmt::looped(body)]
    }
}

pub fn random_shader(seed: u64, statements: usize) -> ShaderSource {
    ShaderGen::new(seed).generate(statements)
}

/// `x = 1; if (..) { if (..) { ... x = 2 } }; out = x`, with `depth` nested `if`s.
pub fn nested_ifs(depth: usize) -> ShaderSource {
    let mut src = ShaderSource::new();
    let x = src.declare("x", 1);
    let mut inner = vec![src.assign(x, Op::Mov, vec![Operand::scalar(2.0)])];
    for _ in 0..depth {
        let cond = Cond::new(BranchCond::Lt, Operand::varying(0).lane(0), Operand::scalar(0.5));
        inner = vec![Stmt::if_else(cond, inner, Vec::new())];
    }
    let mut body = vec![src.assign(x, Op::Mov, vec![Operand::scalar(1.0)])];
    body.extend(inner);
    body.push(Stmt::Output(Operand::var(x).lane(0)));
    src.add_function("main", body);
    src
}
