mod common;

use lima_pp::hir::eval::{self, Inputs, Outcome};
use lima_pp::hir::op::{Op, ResultWidth};
use lima_pp::hir::{build::build, copy_prop, dce, fold, interp, optimize, verify::verify};
use lima_pp::hir::{BlockEnd, Dst, Program, Src};
use lima_pp::structured::ssa::into_ssa;
use lima_pp::types::OutputModifier;
use lima_pp::CompileOptions;
use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use common::{random_inputs, random_shader, STEP_LIMIT, TOLERANCE};

fn count(program: &Program, op: Op) -> usize {
    program
        .cmd_ids()
        .into_iter()
        .filter(|&c| program.cmd(c).op == op)
        .count()
}

/// `a = b + c; d = a * 2; e = d - a`, with `e` output or not.
fn dce_scenario(output_e: bool) -> Program {
    let mut p = Program::new();
    let entry = p.entry;
    let b = p.append(entry, Op::LoadVarying, Dst::new(4), Vec::new());
    let c = p.append(entry, Op::LoadUniform, Dst::new(4), Vec::new());
    let a = p.append(entry, Op::Add, Dst::new(4), vec![Src::cmd(b), Src::cmd(c)]);
    let d = p.append(entry, Op::Mul, Dst::new(4), vec![Src::cmd(a), Src::scalar(2.0)]);
    let e = p.append(entry, Op::Add, Dst::new(4), vec![Src::cmd(d), Src::cmd(a).neg()]);
    let out = if output_e { Src::cmd(e) } else { Src::cmd(b) };
    p.set_end(entry, BlockEnd::Output(out));
    p
}

#[test]
fn dce_keeps_the_chain_feeding_the_output() {
    let mut p = dce_scenario(true);
    let before = p.num_cmds();
    assert!(!dce::run(&mut p));
    assert_eq!(p.num_cmds(), before);
}

#[test]
fn dce_removes_the_chain_when_unused() {
    let mut p = dce_scenario(false);
    assert!(dce::run(&mut p));
    assert_eq!(p.num_cmds(), 1);
    assert_eq!(count(&p, Op::LoadVarying), 1);
    assert!(!dce::run(&mut p), "dce is a fixed point");
}

#[test]
fn scalar_division_expands_to_reciprocal_and_multiply() {
    let mut p = Program::new();
    let entry = p.entry;
    let y = p.append(entry, Op::LoadVarying, Dst::new(1), Vec::new());
    let z = p.append(entry, Op::LoadUniform, Dst::new(1), Vec::new());
    let x = p.append(entry, Op::Div, Dst::new(1), vec![Src::cmd(y), Src::cmd(z)]);
    p.set_end(entry, BlockEnd::Output(Src::cmd(x)));

    optimize(&mut p, &CompileOptions::default());
    assert_eq!(count(&p, Op::Div), 0);
    assert_eq!(count(&p, Op::Rcp), 1);
    assert_eq!(count(&p, Op::Mul), 1);
    assert_eq!(p.num_cmds(), 4);
    assert!(verify(&p).is_ok());
}

#[test]
fn folding_applies_the_modifier_after_the_operation() {
    let mut p = Program::new();
    let entry = p.entry;
    let x = p.append(
        entry,
        Op::Mul,
        Dst {
            width: 4,
            modifier: OutputModifier::Saturate,
        },
        vec![Src::scalar(-3.0), Src::constant([0.25, -0.5, 2.0, 0.0])],
    );
    p.set_end(entry, BlockEnd::Output(Src::cmd(x)));

    assert!(fold::run(&mut p));
    assert_eq!(count(&p, Op::Mul), 0);
    let raw = eval::evaluate(
        Op::Mul,
        4,
        4,
        &[[-3.0; 4], [0.25, -0.5, 2.0, 0.0]],
    )
    .unwrap();
    let want = eval::apply_modifier(raw, OutputModifier::Saturate);
    assert_eq!(want, [0.0, 1.0, 0.0, 0.0]);
    assert_eq!(
        interp::run(&p, &Inputs::default(), STEP_LIMIT).unwrap(),
        Outcome::Color(want)
    );
}

const PURE_OPS: &[Op] = &[
    Op::Mov,
    Op::Neg,
    Op::Abs,
    Op::Add,
    Op::Sub,
    Op::Mul,
    Op::Div,
    Op::Mod,
    Op::Min,
    Op::Max,
    Op::Floor,
    Op::Ceil,
    Op::Fract,
    Op::Sign,
    Op::Rcp,
    Op::Sqrt,
    Op::Rsqrt,
    Op::Exp2,
    Op::Log2,
    Op::Pow,
    Op::Sin,
    Op::Cos,
    Op::Tan,
    Op::Asin,
    Op::Acos,
    Op::Atan,
    Op::Atan2,
    Op::SinLut,
    Op::CosLut,
    Op::AtanPt1,
    Op::Atan2Pt1,
    Op::AtanPt2,
    Op::Dot2,
    Op::Dot3,
    Op::Dot4,
    Op::Sum3,
    Op::Sum4,
    Op::Normalize,
    Op::Lrp,
    Op::Gt,
    Op::Ge,
    Op::Eq,
    Op::Ne,
    Op::Not,
    Op::Any,
    Op::All,
    Op::AllEq,
    Op::AnyNe,
    Op::Select,
    Op::Ddx,
    Op::Ddy,
    Op::Combine,
];

#[test]
fn folding_matches_evaluation_for_every_pure_op() {
    let args = [
        [0.25, -0.5, 0.75, 0.125],
        [2.0, 0.5, -1.5, 3.0],
        [1.0, 0.0, 0.5, 0.25],
    ];
    let modifiers = [
        OutputModifier::None,
        OutputModifier::Saturate,
        OutputModifier::ClampPositive,
        OutputModifier::Round,
    ];
    for &op in PURE_OPS {
        let info = op.info();
        assert!(info.pure, "{}", info.name);
        let n = info.min_args as usize;
        let width = match info.result {
            ResultWidth::Dest => 3,
            ResultWidth::Fixed(w) => w,
            ResultWidth::Sources => n as u8,
        };
        for modifier in modifiers {
            if modifier != OutputModifier::None && !info.output_modifiers {
                continue;
            }
            let mut p = Program::new();
            let entry = p.entry;
            let srcs = args[..n].iter().map(|&v| Src::constant(v)).collect();
            let x = p.append(entry, op, Dst { width, modifier }, srcs);
            p.set_end(entry, BlockEnd::Output(Src::cmd(x)));

            assert!(fold::run(&mut p), "{} was not folded", info.name);
            assert_eq!(p.num_cmds(), 0, "{}", info.name);
            let raw = eval::evaluate(op, width, 4, &args[..n]).unwrap();
            let want = eval::apply_modifier(raw, modifier);
            let BlockEnd::Output(color) = p.block(entry).end() else {
                panic!("{}: output replaced by {:?}", info.name, p.block(entry).end());
            };
            let got = color.constant_value().unwrap();
            assert!(
                want.iter().zip(&got).all(|(&w, &g)| eval::lanes_approx_eq(w, g, 0.0)),
                "{}{}: {want:?} != {got:?}",
                info.name,
                modifier.suffix()
            );
        }
    }
}

#[test]
fn copy_propagation_preserves_random_programs() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    for seed in 0..64 {
        let mut src = random_shader(seed, 14);
        into_ssa(&mut src).unwrap();
        let original = build(&src).unwrap();
        let mut propagated = original.clone();
        copy_prop::run(&mut propagated);
        verify(&propagated).unwrap();

        for _ in 0..4 {
            let inputs = random_inputs(&mut rng);
            let want = interp::run(&original, &inputs, STEP_LIMIT).unwrap();
            let got = interp::run(&propagated, &inputs, STEP_LIMIT).unwrap();
            assert!(
                want.approx_eq(&got, TOLERANCE),
                "seed {seed}: {want:?} != {got:?}"
            );
        }
    }
}

#[test]
fn optimization_preserves_random_programs_and_removes_expandable_ops() {
    common::init_tracing();
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let options = CompileOptions::default();
    for seed in 100..164 {
        let mut src = random_shader(seed, 16);
        let reference = src.clone();
        into_ssa(&mut src).unwrap();
        let mut program = build(&src).unwrap();
        optimize(&mut program, &options);
        verify(&program).unwrap();
        assert_eq!(program.unsupported_ops(), 0, "seed {seed}");

        for _ in 0..4 {
            let inputs = random_inputs(&mut rng);
            let want = lima_pp::structured::interp::run(&reference, &inputs, STEP_LIMIT).unwrap();
            let got = interp::run(&program, &inputs, STEP_LIMIT).unwrap();
            assert!(
                want.approx_eq(&got, TOLERANCE),
                "seed {seed}: {want:?} != {got:?}"
            );
        }
    }
}
