mod common;

use lima_pp::hir::eval::{Inputs, Outcome};
use lima_pp::hir::op::Op;
use lima_pp::limits::{BUNDLE_RECORD_WORDS, MAX_CONTROL_FLOW_NESTING};
use lima_pp::lir::interp;
use lima_pp::structured::{self, Cond, Index, Operand, Stmt};
use lima_pp::types::{BranchCond, Swizzle};
use lima_pp::{compile, CompileError, CompileOptions, CompiledShader, ShaderSource};
use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use common::{nested_ifs, random_inputs, random_shader, ShaderGen, STEP_LIMIT, TOLERANCE};

fn assert_same_results(seed: u64, source: &ShaderSource, compiled: &CompiledShader, rng: &mut ChaCha8Rng) {
    for _ in 0..4 {
        let inputs = random_inputs(rng);
        let want = structured::interp::run(source, &inputs, STEP_LIMIT).unwrap();
        let got = interp::run(&compiled.program, &inputs, STEP_LIMIT).unwrap();
        assert!(
            want.approx_eq(&got, TOLERANCE),
            "seed {seed}: {want:?} != {got:?}"
        );
    }
}

#[test]
fn random_shaders_compile_to_equivalent_bundles() {
    common::init_tracing();
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let options = CompileOptions::default();
    for seed in 0..64 {
        let source = random_shader(seed, 18);
        let compiled = compile(&source, &options).unwrap();
        assert!(compiled.program.allocated);
        assert_eq!(compiled.words.len(), compiled.info.num_bundles * BUNDLE_RECORD_WORDS);
        assert_eq!(compiled.info.first_bundle_words, BUNDLE_RECORD_WORDS);
        assert_same_results(seed, &source, &compiled, &mut rng);
    }
}

#[test]
fn pressure_scheduling_and_coalescing_are_optional() {
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let options = CompileOptions {
        schedule_for_pressure: false,
        coalesce: false,
        ..CompileOptions::default()
    };
    for seed in 64..96 {
        let source = ShaderGen::new(seed).without_discard().generate(14);
        let compiled = compile(&source, &options).unwrap();
        assert!(compiled.info.writes_color);
        assert!(!compiled.info.has_discard);
        assert_same_results(seed, &source, &compiled, &mut rng);
    }
}

#[test]
fn small_register_files_compile_through_repeated_spilling() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    for num_registers in [2, 3] {
        let options = CompileOptions {
            num_registers,
            ..CompileOptions::default()
        };
        let (mut compiled_count, mut spilled) = (0, 0);
        for seed in 200..248 {
            let source = random_shader(seed, 30);
            let compiled = match compile(&source, &options) {
                Ok(compiled) => compiled,
                Err(CompileError::RegisterAllocation { .. } | CompileError::UnspillableRegister { .. }) => {
                    continue;
                }
                Err(e) => panic!("seed {seed}, {num_registers} registers: {e}"),
            };
            assert_same_results(seed, &source, &compiled, &mut rng);
            compiled_count += 1;
            if compiled.info.temp_storage_size > 0 {
                spilled += 1;
            }
        }
        assert!(compiled_count > 0, "nothing fit into {num_registers} registers");
        assert!(spilled > 0, "nothing spilled with {num_registers} registers");
    }
}

#[test]
fn continue_skips_the_rest_of_the_iteration() {
    let mut src = ShaderSource::new();
    let i = src.declare("i", 1);
    let acc = src.declare("acc", 4);
    let (exit, skip) = (src.new_jump(), src.new_jump());
    let body = vec![
        src.assign(i, Op::Mov, vec![Operand::scalar(0.0)]),
        src.assign(acc, Op::Mov, vec![Operand::scalar(0.0)]),
        Stmt::looped(vec![
            src.assign(i, Op::Add, vec![Operand::var(i), Operand::scalar(1.0)]),
            Stmt::if_else(
                Cond::new(BranchCond::Gt, Operand::var(i), Operand::scalar(4.0)),
                vec![Stmt::Break(exit)],
                Vec::new(),
            ),
            Stmt::if_else(
                Cond::new(BranchCond::Eq, Operand::var(i), Operand::uniform(0).lane(0)),
                vec![Stmt::Continue(skip)],
                Vec::new(),
            ),
            src.assign(acc, Op::Add, vec![Operand::var(acc), Operand::varying(0)]),
        ]),
        Stmt::Output(Operand::var(acc)),
    ];
    src.add_function("main", body);

    let inputs = Inputs {
        uniforms: vec![[2.0, 0.0, 0.0, 0.0]],
        varyings: vec![[1.0, 2.0, 3.0, 4.0]],
        ..Inputs::default()
    };
    for num_registers in [6, 3] {
        let options = CompileOptions {
            num_registers,
            ..CompileOptions::default()
        };
        let compiled = compile(&src, &options).unwrap();
        assert_eq!(
            interp::run(&compiled.program, &inputs, STEP_LIMIT).unwrap(),
            Outcome::Color([3.0, 6.0, 9.0, 12.0])
        );
        assert_same_results(0, &src, &compiled, &mut ChaCha8Rng::seed_from_u64(14));
    }
}

#[test]
fn composite_operations_expand_to_equivalent_bundles() {
    let a = || Operand::varying(0);
    let b = || Operand::uniform(0);
    let c = || Operand::varying(1);
    let cases = vec![
        (Op::Sub, 4, vec![a(), b()]),
        (Op::Div, 4, vec![a(), b()]),
        (Op::Mod, 4, vec![a(), b()]),
        (Op::Pow, 4, vec![a().abs(), b()]),
        (Op::Sin, 4, vec![a()]),
        (Op::Cos, 4, vec![a()]),
        (Op::Tan, 4, vec![a()]),
        (Op::Asin, 4, vec![a()]),
        (Op::Acos, 4, vec![a()]),
        (Op::Atan, 4, vec![a()]),
        (Op::Atan2, 2, vec![a(), b()]),
        (Op::Normalize, 3, vec![a()]),
        (Op::Normalize, 2, vec![b()]),
        (Op::Dot2, 1, vec![a(), b()]),
        (Op::Dot4, 1, vec![a(), b()]),
        (Op::Lrp, 4, vec![a(), b(), c()]),
        (Op::Not, 4, vec![c()]),
        (Op::Any, 1, vec![a()]),
        (Op::All, 1, vec![c()]),
        (Op::AllEq, 1, vec![a(), a()]),
        (Op::AllEq, 1, vec![a(), b()]),
        (Op::AnyNe, 1, vec![a(), b()]),
    ];
    let inputs = Inputs {
        uniforms: vec![[0.7, 1.1, -0.35, 2.3]],
        varyings: vec![[0.3, -0.6, 0.45, 0.8], [0.5, 0.25, 0.75, 1.0]],
        ..Inputs::default()
    };

    for (op, width, args) in cases {
        let mut src = ShaderSource::new();
        let r = src.declare("r", width);
        let color = Operand::var(r).swizzled(Swizzle([0, 1 % width, 2 % width, 3 % width]));
        let body = vec![src.assign(r, op, args), Stmt::Output(color)];
        src.add_function("main", body);

        let compiled = compile(&src, &CompileOptions::default())
            .unwrap_or_else(|e| panic!("{}: {e}", op.name()));
        let want = structured::interp::run(&src, &inputs, STEP_LIMIT).unwrap();
        let got = interp::run(&compiled.program, &inputs, STEP_LIMIT).unwrap();
        assert!(
            want.approx_eq(&got, TOLERANCE),
            "{}.{width}: {want:?} != {got:?}",
            op.name()
        );
    }
}

#[test]
fn deeply_nested_control_flow_is_rejected() {
    let compiled = compile(&nested_ifs(MAX_CONTROL_FLOW_NESTING), &CompileOptions::default());
    assert!(compiled.is_ok());
    assert!(matches!(
        compile(&nested_ifs(2_000), &CompileOptions::default()),
        Err(CompileError::ControlFlowTooDeep { max }) if max == MAX_CONTROL_FLOW_NESTING
    ));
}

#[test]
fn textured_shader_modulates_by_a_uniform() {
    let mut src = ShaderSource::new();
    let t = src.declare("t", 4);
    let body = vec![
        src.texture(t, Op::Texld2d, 1, Operand::varying(0)),
        src.assign(t, Op::Mul, vec![Operand::var(t), Operand::uniform(2)]),
        Stmt::Output(Operand::var(t)),
    ];
    src.add_function("main", body);

    let compiled = compile(&src, &CompileOptions::default()).unwrap();
    let syncs = compiled
        .program
        .blocks
        .iter()
        .flat_map(|b| &b.bundles)
        .filter(|b| b.sync)
        .count();
    assert_eq!(syncs, 1);
    assert!(!compiled.info.reads_depth);
    assert_same_results(0, &src, &compiled, &mut ChaCha8Rng::seed_from_u64(9));
}

#[test]
fn eight_live_vectors_fit_into_two_registers() {
    let mut src = ShaderSource::new();
    let vars: Vec<_> = (0..8).map(|k| src.declare(format!("v{k}"), 4)).collect();
    let mut body = Vec::new();
    for (k, &v) in vars.iter().enumerate() {
        let input = if k % 2 == 0 {
            Operand::varying(k as u32 / 2)
        } else {
            Operand::uniform(k as u32 / 2)
        };
        body.push(src.assign(v, Op::Mul, vec![input, Operand::scalar(k as f32 + 1.0)]));
    }
    // Sum in reverse so every value stays live until the end.
    let acc = src.declare("acc", 4);
    body.push(src.assign(acc, Op::Mov, vec![Operand::var(vars[7])]));
    for &v in vars.iter().rev().skip(1) {
        body.push(src.assign(acc, Op::Add, vec![Operand::var(acc), Operand::var(v)]));
    }
    body.push(Stmt::Output(Operand::var(acc)));
    src.add_function("main", body);

    let mut rng = ChaCha8Rng::seed_from_u64(10);
    for schedule_for_pressure in [true, false] {
        let options = CompileOptions {
            num_registers: 2,
            schedule_for_pressure,
            ..CompileOptions::default()
        };
        let compiled = compile(&src, &options).unwrap();
        if !schedule_for_pressure {
            assert!(compiled.info.temp_storage_size > 0, "nothing was spilled");
        }
        assert_same_results(0, &src, &compiled, &mut rng);
    }
}

#[test]
fn shader_info_reports_depth_discard_and_temporaries() {
    let mut src = ShaderSource::new();
    let a = src.declare_array("a", 4, 3);
    let body = vec![
        src.store_element(
            a,
            Index::Const(1),
            Op::Add,
            vec![Operand::new(structured::Value::FragCoord), Operand::uniform(0)],
        ),
        Stmt::if_else(
            Cond::new(BranchCond::Lt, Operand::varying(0).lane(0), Operand::scalar(0.0)),
            vec![Stmt::Discard],
            Vec::new(),
        ),
        Stmt::Output(Operand::element(a, 1)),
    ];
    src.add_function("main", body);

    let compiled = compile(&src, &CompileOptions::default()).unwrap();
    assert!(compiled.info.reads_depth);
    assert!(compiled.info.has_discard);
    assert!(compiled.info.writes_color);
    assert!(compiled.info.temp_storage_size >= 3);
    assert_same_results(0, &src, &compiled, &mut ChaCha8Rng::seed_from_u64(11));
}

#[test]
fn dynamically_indexed_array_reads_back_the_stored_element() {
    let mut src = ShaderSource::new();
    let a = src.declare_array("a", 4, 3);
    let mut body: Vec<Stmt> = (0..3)
        .map(|k| {
            let v = k as f32;
            src.store_element(
                a,
                Index::Const(k),
                Op::Add,
                vec![Operand::varying(0), Operand::constant([v, v + 0.5, -v, 1.0])],
            )
        })
        .collect();
    body.push(Stmt::Output(Operand::dynamic_element(a, Operand::uniform(0).lane(0))));
    src.add_function("main", body);

    let compiled = compile(&src, &CompileOptions::default()).unwrap();
    assert_eq!(compiled.info.temp_storage_size, 3);
    assert_same_results(0, &src, &compiled, &mut ChaCha8Rng::seed_from_u64(12));
}

#[test]
fn constant_colour_is_a_single_stopping_bundle() {
    let mut src = ShaderSource::new();
    src.add_function(
        "main",
        vec![Stmt::Output(Operand::constant([0.25, 0.5, 0.75, 1.0]))],
    );
    let compiled = compile(&src, &CompileOptions::default()).unwrap();
    assert_eq!(compiled.info.num_bundles, 1);
    assert_eq!(compiled.words.len(), BUNDLE_RECORD_WORDS);
    assert_eq!(compiled.words[0] >> 10 & 1, 1, "stop bit");
    assert_eq!(
        interp::run(&compiled.program, &Inputs::default(), STEP_LIMIT).unwrap(),
        Outcome::Color([0.25, 0.5, 0.75, 1.0])
    );
}

#[test]
fn compilation_is_deterministic() {
    let source = random_shader(42, 20);
    let options = CompileOptions::default();
    let first = compile(&source, &options).unwrap();
    let second = compile(&source, &options).unwrap();
    assert_eq!(first.words, second.words);
    assert_eq!(first.info, second.info);
}

#[test]
fn missing_main_is_reported() {
    let mut src = ShaderSource::new();
    src.add_function("helper", vec![Stmt::Output(Operand::scalar(1.0))]);
    assert!(matches!(
        compile(&src, &CompileOptions::default()),
        Err(CompileError::MissingEntryPoint)
    ));
}
