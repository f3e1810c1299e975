mod common;

use std::collections::BTreeSet;

use lima_pp::lir::{interp, sched_bundle, LirInstr, LirProgram, RegId};
use lima_pp::regalloc::{allocate, rewrite, Allocation};
use lima_pp::{CompileError, CompileOptions};
use pretty_assertions::{assert_eq, assert_ne};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use common::{lower_to_lir, random_inputs, random_shader, STEP_LIMIT, TOLERANCE};

/// Physical lane `(register, lane)` that lane `lane` of `reg` was given.
fn phys_lane(alloc: &Allocation, reg: RegId, lane: u8) -> (u8, u8) {
    let p = alloc.placement(reg);
    (p.phys, p.lanes[lane as usize])
}

type Lanes = BTreeSet<(u32, u8)>;

fn uses(instr: &LirInstr) -> Lanes {
    let mut out = Lanes::new();
    for (k, src) in instr.srcs.iter().enumerate() {
        if let Some(r) = src.reg_id() {
            let lanes = instr.read_lanes(k);
            out.extend((0..4u8).filter(|l| lanes & (1 << l) != 0).map(|l| (r.0, l)));
        }
    }
    out
}

fn def(instr: &LirInstr) -> Option<(RegId, Vec<u8>)> {
    let r = instr.dst_reg()?;
    let mask = instr.dst?.mask.bits();
    Some((r, (0..4u8).filter(|l| mask & (1 << l) != 0).collect()))
}

fn step(live: &mut Lanes, instr: &LirInstr) {
    if let Some((r, lanes)) = def(instr) {
        for l in lanes {
            live.remove(&(r.0, l));
        }
    }
    live.extend(uses(instr));
}

/// Lanes live at the end of each block, by plain round-robin iteration to a fixed point.
fn live_out(program: &LirProgram) -> Vec<Lanes> {
    let n = program.blocks.len();
    let mut live_in = vec![Lanes::new(); n];
    let mut live_out = vec![Lanes::new(); n];
    loop {
        let mut changed = false;
        for b in 0..n {
            let mut out: Lanes = program.successors(b).iter().flat_map(|&s| live_in[s].clone()).collect();
            if let Some(r) = program.blocks[b].output {
                out.extend((0..4).map(|l| (r.0, l)));
            }
            let mut live = out.clone();
            for instr in program.blocks[b].instrs.iter().rev() {
                step(&mut live, instr);
            }
            changed |= out != live_out[b] || live != live_in[b];
            live_out[b] = out;
            live_in[b] = live;
        }
        if !changed {
            return live_out;
        }
    }
}

/// Walks every definition and checks that no lane live across it shares its physical lane,
/// apart from the lane a plain move copies and members of the same coalescing group.
fn assert_no_lane_collisions(seed: u64, program: &LirProgram, alloc: &Allocation) {
    let live_out = live_out(program);
    for (b, block) in program.blocks.iter().enumerate() {
        let mut live = live_out[b].clone();
        for instr in block.instrs.iter().rev() {
            if let Some((d, lanes)) = def(instr) {
                let copied_from = instr
                    .is_plain_move()
                    .then(|| (instr.srcs[0].reg_id(), instr.srcs[0].swizzle));
                for &(u, j) in &live {
                    let u = RegId(u);
                    if u == d || alloc.root(u) == alloc.root(d) {
                        continue;
                    }
                    for &l in &lanes {
                        if matches!(copied_from, Some((Some(s), sw)) if s == u && sw.component(l) == j) {
                            continue;
                        }
                        assert_ne!(
                            phys_lane(alloc, d, l),
                            phys_lane(alloc, u, j),
                            "seed {seed} block {b}: %{}.{l} and %{}.{j} collide at `{instr}`",
                            d.0,
                            u.0,
                        );
                    }
                }
            }
            step(&mut live, instr);
        }
    }
}

/// Allocates, rewrites and bundles random shaders, checking each stage against the selected
/// program. Returns the number of rounds each successful allocation took.
fn check_random_allocations(options: CompileOptions, seeds: std::ops::Range<u64>) -> Vec<u32> {
    check_random_allocations_of(options, seeds, 16)
}

fn check_random_allocations_of(
    options: CompileOptions,
    seeds: std::ops::Range<u64>,
    statements: usize,
) -> Vec<u32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seeds.start);
    let mut rounds = Vec::new();
    for seed in seeds {
        let original = lower_to_lir(&random_shader(seed, statements), &options);
        let mut program = original.clone();
        let alloc = match allocate(&mut program, &options) {
            Ok(alloc) => alloc,
            Err(CompileError::RegisterAllocation { .. } | CompileError::UnspillableRegister { .. }) => {
                continue;
            }
            Err(e) => panic!("seed {seed}: {e}"),
        };
        assert!(alloc.rounds >= 1 && alloc.rounds <= options.max_regalloc_rounds);
        assert_no_lane_collisions(seed, &program, &alloc);

        let spilled = program.clone();
        rewrite(&mut program, &alloc);
        assert!(program.allocated);
        let rewritten = program.clone();
        sched_bundle::run(&mut program)
            .unwrap_or_else(|e| panic!("seed {seed}, {} rounds: {e}", alloc.rounds));
        for _ in 0..4 {
            let inputs = random_inputs(&mut rng);
            let want = interp::run(&original, &inputs, STEP_LIMIT).unwrap();
            let after_spill = interp::run(&spilled, &inputs, STEP_LIMIT).unwrap();
            let got = interp::run(&rewritten, &inputs, STEP_LIMIT).unwrap();
            let bundled = interp::run(&program, &inputs, STEP_LIMIT).unwrap();
            assert!(
                want.approx_eq(&after_spill, TOLERANCE),
                "seed {seed}: spilling changed {want:?} to {after_spill:?}"
            );
            assert!(
                want.approx_eq(&got, TOLERANCE),
                "seed {seed}: allocation changed {want:?} to {got:?}"
            );
            assert!(
                want.approx_eq(&bundled, TOLERANCE),
                "seed {seed}: bundling changed {want:?} to {bundled:?}"
            );
        }
        rounds.push(alloc.rounds);
    }
    rounds
}

#[test]
fn full_register_file_allocates_without_collisions() {
    common::init_tracing();
    let options = CompileOptions::default();
    assert_eq!(check_random_allocations(options, 0..48).len(), 48);
}

#[test]
fn allocation_without_coalescing_is_still_sound() {
    let options = CompileOptions {
        coalesce: false,
        ..CompileOptions::default()
    };
    assert_eq!(check_random_allocations(options, 500..532).len(), 32);
}

#[test]
fn small_register_files_spill_and_terminate() {
    let options = CompileOptions {
        num_registers: 3,
        ..CompileOptions::default()
    };
    let rounds = check_random_allocations(options, 1000..1048);
    assert!(!rounds.is_empty(), "no shader fit into three registers");
}

#[test]
fn later_spill_rounds_keep_forwarded_loads_schedulable() {
    let options = CompileOptions {
        num_registers: 2,
        ..CompileOptions::default()
    };
    let rounds = check_random_allocations_of(options, 2000..2048, 30);
    assert!(
        rounds.iter().any(|&r| r > 2),
        "no allocation needed more than one spill round: {rounds:?}"
    );
}

#[test]
fn retry_loop_reports_exhausted_rounds() {
    let options = CompileOptions {
        num_registers: 1,
        max_regalloc_rounds: 1,
        ..CompileOptions::default()
    };
    let mut hit = false;
    for seed in 0..16 {
        let mut program = lower_to_lir(&random_shader(seed, 16), &options);
        match allocate(&mut program, &options) {
            Ok(alloc) => assert_eq!(alloc.rounds, 1),
            Err(CompileError::RegisterAllocation { rounds }) => {
                assert_eq!(rounds, 1);
                hit = true;
            }
            Err(CompileError::UnspillableRegister { .. }) => hit = true,
            Err(e) => panic!("seed {seed}: {e}"),
        }
    }
    assert!(hit, "one register and one round fit every shader");
}
