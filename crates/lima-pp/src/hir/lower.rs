//! Expansion of operations the functional units do not implement into sequences of native ones.
//!
//! Every expansion inserts its helper commands in front of the original command and then turns
//! the original command into the last operation of the sequence, so the command keeps its id,
//! destination and users throughout.

use core::f32::consts::TAU;

use tracing::debug;

use super::op::Op;
use super::{CmdId, Dst, Program, Src};
use crate::types::OutputModifier;

pub fn run(program: &mut Program) -> bool {
    let mut expanded = 0usize;
    for c in program.cmd_ids() {
        let Some(cmd) = program.try_cmd(c) else {
            continue;
        };
        if cmd.op.is_scalar_only() && cmd.dst.width > 1 {
            scalarize(program, c);
            expanded += 1;
        } else if !cmd.op.is_native() {
            expand(program, c);
            expanded += 1;
        }
    }
    if expanded > 0 {
        debug!(
            expanded,
            remaining = program.unsupported_ops(),
            "expanded composite operations"
        );
    }
    expanded > 0
}

fn insert(program: &mut Program, before: CmdId, op: Op, width: u8, srcs: Vec<Src>) -> Src {
    Src::cmd(program.insert_before(before, op, Dst::new(width), srcs))
}

/// Horizontal sum of the first `n` lanes of `src`, as a scalar.
fn horizontal_sum(program: &mut Program, before: CmdId, src: Src, n: u8) -> Src {
    match n {
        0 | 1 => src,
        2 => insert(program, before, Op::Add, 1, vec![src.lane(0), src.lane(1)]),
        3 => insert(program, before, Op::Sum3, 1, vec![src]),
        _ => insert(program, before, Op::Sum4, 1, vec![src]),
    }
}

/// Splits a lane-wise operation the hardware only has as a scalar into one command per lane and
/// a `combine` of the results.
fn scalarize(program: &mut Program, c: CmdId) {
    let cmd = program.cmd(c);
    let (op, width, modifier) = (cmd.op, cmd.dst.width, cmd.dst.modifier);
    let srcs = cmd.srcs().to_vec();
    let lanes = (0..width)
        .map(|lane| {
            let lane_srcs = srcs.iter().map(|s| s.lane(lane)).collect();
            let dst = Dst { width: 1, modifier };
            Src::cmd(program.insert_before(c, op, dst, lane_srcs))
        })
        .collect();
    program.cmd_mut(c).dst.modifier = OutputModifier::None;
    program.rewrite(c, Op::Combine, lanes);
}

fn expand(program: &mut Program, c: CmdId) {
    let cmd = program.cmd(c);
    let (op, w) = (cmd.op, cmd.dst.width);
    let src = |i: usize| cmd.srcs().get(i).copied().unwrap_or(Src::scalar(0.0));
    let (a, b, t) = (src(0), src(1), src(2));
    let free = program.value_width(a.value);
    let inv_tau = Src::scalar(1.0 / TAU);

    let (new_op, srcs) = match op {
        Op::Neg => (Op::Mov, vec![a.neg()]),
        Op::Abs => (Op::Mov, vec![a.abs()]),
        Op::Sub => (Op::Add, vec![a, b.neg()]),
        Op::Not => (Op::Add, vec![Src::scalar(1.0), a.neg()]),
        Op::Div => {
            let r = insert(program, c, Op::Rcp, w, vec![b]);
            (Op::Mul, vec![a, r])
        }
        Op::Mod => {
            // mod(x, y) = y * fract(x / y)
            let r = insert(program, c, Op::Rcp, w, vec![b]);
            let q = insert(program, c, Op::Mul, w, vec![a, r]);
            let f = insert(program, c, Op::Fract, w, vec![q]);
            (Op::Mul, vec![b, f])
        }
        Op::Pow => {
            let l = insert(program, c, Op::Log2, w, vec![a]);
            let m = insert(program, c, Op::Mul, w, vec![l, b]);
            (Op::Exp2, vec![m])
        }
        Op::Dot2 => {
            let m = insert(program, c, Op::Mul, 2, vec![a, b]);
            (Op::Add, vec![m.lane(0), m.lane(1)])
        }
        Op::Dot3 => {
            let m = insert(program, c, Op::Mul, 3, vec![a, b]);
            (Op::Sum3, vec![m])
        }
        Op::Dot4 => {
            let m = insert(program, c, Op::Mul, 4, vec![a, b]);
            (Op::Sum4, vec![m])
        }
        Op::Normalize if w == 1 => (Op::Sign, vec![a]),
        Op::Normalize => {
            let dot = match w {
                2 => Op::Dot2,
                3 => Op::Dot3,
                _ => Op::Dot4,
            };
            let d = insert(program, c, dot, 1, vec![a, a]);
            let r = insert(program, c, Op::Rsqrt, 1, vec![d]);
            (Op::Mul, vec![a, r.lane(0)])
        }
        Op::Lrp => {
            // a + t * (b - a)
            let d = insert(program, c, Op::Add, w, vec![b, a.neg()]);
            let m = insert(program, c, Op::Mul, w, vec![t, d]);
            (Op::Add, vec![m, a])
        }
        Op::Sin | Op::Cos => {
            let turns = insert(program, c, Op::Mul, w, vec![a, inv_tau]);
            let lut = if op == Op::Sin { Op::SinLut } else { Op::CosLut };
            (lut, vec![turns])
        }
        Op::Tan => {
            let turns = insert(program, c, Op::Mul, w, vec![a, inv_tau]);
            let s = insert(program, c, Op::SinLut, w, vec![turns]);
            let k = insert(program, c, Op::CosLut, w, vec![turns]);
            let r = insert(program, c, Op::Rcp, w, vec![k]);
            (Op::Mul, vec![s, r])
        }
        Op::Asin | Op::Acos => {
            // asin(x) = atan2(x, sqrt(1 - x^2)), acos(x) = atan2(sqrt(1 - x^2), x)
            let sq = insert(program, c, Op::Mul, w, vec![a, a]);
            let rest = insert(program, c, Op::Add, w, vec![Src::scalar(1.0), sq.neg()]);
            let root = insert(program, c, Op::Sqrt, w, vec![rest]);
            let srcs = if op == Op::Asin {
                vec![a, root]
            } else {
                vec![root, a]
            };
            (Op::Atan2, srcs)
        }
        Op::Atan => {
            let p = insert(program, c, Op::AtanPt1, 3, vec![a]);
            (Op::AtanPt2, vec![p])
        }
        Op::Atan2 => {
            let p = insert(program, c, Op::Atan2Pt1, 3, vec![a, b]);
            (Op::AtanPt2, vec![p])
        }
        Op::Any => {
            let s = horizontal_sum(program, c, a.abs(), free);
            (Op::Ne, vec![s, Src::scalar(0.0)])
        }
        Op::All => {
            let e = insert(program, c, Op::Ne, free, vec![a, Src::scalar(0.0)]);
            let s = horizontal_sum(program, c, e, free);
            (Op::Eq, vec![s, Src::scalar(free as f32)])
        }
        Op::AllEq => {
            let e = insert(program, c, Op::Eq, free, vec![a, b]);
            let s = horizontal_sum(program, c, e, free);
            (Op::Eq, vec![s, Src::scalar(free as f32)])
        }
        Op::AnyNe => {
            let e = insert(program, c, Op::Ne, free, vec![a, b]);
            let s = horizontal_sum(program, c, e, free);
            (Op::Ne, vec![s, Src::scalar(0.0)])
        }
        _ => return,
    };
    program.rewrite(c, new_op, srcs);
}
