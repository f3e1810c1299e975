mod common;

use lima_pp::hir::eval::Outcome;
use lima_pp::lir::bundle::Slot;
use lima_pp::lir::deps::DepGraph;
use lima_pp::lir::sched_bundle::schedule_block;
use lima_pp::lir::{interp, sched_pressure, LirDst, LirInstr, LirOp, LirSrc, LirValue, RegId};
use lima_pp::types::{BranchCond, WriteMask};
use lima_pp::{compile, CompileOptions};
use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use common::{lower_to_lir, random_inputs, random_shader, STEP_LIMIT, TOLERANCE};

fn scalar_add(dst: u32, a: u32, b: LirSrc) -> LirInstr {
    LirInstr::new(
        LirOp::Add,
        Some(LirDst::reg(RegId(dst), WriteMask::X)),
        vec![LirSrc::reg(RegId(a)), b],
    )
}

#[test]
fn independent_scalar_adds_share_one_bundle() {
    let instrs = vec![
        scalar_add(2, 0, LirSrc::reg(RegId(1))),
        scalar_add(3, 0, LirSrc::new(LirValue::Const([1.0; 4]))),
    ];
    let bundles = schedule_block(0, &instrs).unwrap();
    assert_eq!(bundles.len(), 1);
    assert!(bundles[0].instr(Slot::VAdd).is_some());
    assert!(bundles[0].instr(Slot::SAdd).is_some());
}

#[test]
fn dependent_scalar_adds_take_two_bundles() {
    let instrs = vec![
        scalar_add(2, 0, LirSrc::reg(RegId(1))),
        scalar_add(3, 2, LirSrc::reg(RegId(1))),
    ];
    let bundles = schedule_block(0, &instrs).unwrap();
    assert_eq!(bundles.len(), 2);
    assert_eq!(bundles[0].instrs().count(), 1);
    assert_eq!(bundles[1].instrs().count(), 1);
}

#[test]
fn branch_lands_in_the_last_bundle() {
    let instrs = vec![
        scalar_add(2, 0, LirSrc::reg(RegId(1))),
        scalar_add(3, 2, LirSrc::reg(RegId(1))),
        LirInstr::new(
            LirOp::Branch {
                cond: BranchCond::Lt,
            },
            None,
            vec![LirSrc::reg(RegId(0)), LirSrc::reg(RegId(1))],
        )
        .with_index(2),
    ];
    let bundles = schedule_block(0, &instrs).unwrap();
    let last = bundles.last().unwrap();
    assert!(last.instr(Slot::Branch).is_some());
    for b in &bundles[..bundles.len() - 1] {
        assert!(b.instr(Slot::Branch).is_none());
    }
}

#[test]
fn compiled_bundles_are_legal_and_complete() {
    common::init_tracing();
    let options = CompileOptions::default();
    for seed in 0..48 {
        let compiled = compile(&random_shader(seed, 14), &options).unwrap();
        let program = &compiled.program;
        for (b, block) in program.blocks.iter().enumerate() {
            let placed: usize = block.bundles.iter().map(|bundle| bundle.instrs().count()).sum();
            assert_eq!(placed, block.instrs.len(), "seed {seed} block {b}");
            for (k, bundle) in block.bundles.iter().enumerate() {
                let last = k + 1 == block.bundles.len();
                assert_eq!(bundle.validate(), Ok(()), "seed {seed} block {b} bundle {k}");
                if !last {
                    assert!(bundle.instr(Slot::Branch).is_none(), "seed {seed} block {b}");
                    assert!(!bundle.stop, "seed {seed} block {b}");
                }
            }
            if block.stop {
                assert!(block.bundles.last().is_some_and(|last| last.stop), "seed {seed}");
            }
        }
    }
}

#[test]
fn bundles_compute_what_the_instruction_order_computes() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let options = CompileOptions::default();
    for seed in 200..248 {
        let compiled = compile(&random_shader(seed, 14), &options).unwrap();
        let mut sequential = compiled.program.clone();
        for block in &mut sequential.blocks {
            block.bundles.clear();
        }
        for _ in 0..4 {
            let inputs = random_inputs(&mut rng);
            let want = interp::run(&sequential, &inputs, STEP_LIMIT).unwrap();
            let got = interp::run(&compiled.program, &inputs, STEP_LIMIT).unwrap();
            assert!(
                want.approx_eq(&got, TOLERANCE),
                "seed {seed}: {want:?} != {got:?}"
            );
        }
    }
}

#[test]
fn pressure_order_respects_dependencies_and_meaning() {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let options = CompileOptions {
        schedule_for_pressure: false,
        ..CompileOptions::default()
    };
    for seed in 300..348 {
        let original = lower_to_lir(&random_shader(seed, 16), &options);
        for block in &original.blocks {
            let order = sched_pressure::schedule(&block.instrs);
            let mut position = vec![usize::MAX; order.len()];
            for (pos, &i) in order.iter().enumerate() {
                position[i] = pos;
            }
            assert!(position.iter().all(|&p| p != usize::MAX), "seed {seed}: not a permutation");

            let graph = DepGraph::build(&block.instrs);
            for i in 0..graph.len() {
                for dep in graph.succs(i) {
                    assert!(position[dep.from] < position[dep.to], "seed {seed}: {dep:?}");
                }
            }
        }

        let mut reordered = original.clone();
        sched_pressure::run(&mut reordered);
        for _ in 0..4 {
            let inputs = random_inputs(&mut rng);
            let want = interp::run(&original, &inputs, STEP_LIMIT).unwrap();
            let got = interp::run(&reordered, &inputs, STEP_LIMIT).unwrap();
            assert!(
                want.approx_eq(&got, TOLERANCE),
                "seed {seed}: {want:?} != {got:?}"
            );
        }
    }
}

#[test]
fn discard_only_shader_still_stops() {
    let mut src = lima_pp::ShaderSource::new();
    src.add_function("main", vec![lima_pp::structured::Stmt::Discard]);
    let compiled = compile(&src, &CompileOptions::default()).unwrap();
    assert!(compiled.info.has_discard);
    let outcome = interp::run(&compiled.program, &Default::default(), STEP_LIMIT).unwrap();
    assert_eq!(outcome, Outcome::Discarded);
}
