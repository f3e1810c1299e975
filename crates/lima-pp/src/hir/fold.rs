//! Constant folding of commands and branches.

use tracing::debug;

use super::copy_prop::forward;
use super::eval;
use super::op::Op;
use super::{BlockEnd, Program, Src};

pub fn run(program: &mut Program) -> bool {
    let mut folded = 0usize;
    for c in program.cmd_ids() {
        let Some(cmd) = program.try_cmd(c) else {
            continue;
        };
        if !cmd.op.info().pure || cmd.op == Op::Phi {
            continue;
        }
        let Some(args) = cmd
            .srcs()
            .iter()
            .map(Src::constant_value)
            .collect::<Option<Vec<[f32; 4]>>>()
        else {
            continue;
        };
        let Some(value) = eval::evaluate(cmd.op, cmd.dst.width, 4, &args) else {
            continue;
        };
        let value = eval::apply_modifier(value, cmd.dst.modifier);
        if forward(program, c, Src::constant(value)) {
            folded += 1;
        }
    }

    let mut branches = 0usize;
    for b in program.layout().to_vec() {
        let BlockEnd::Branch {
            cond,
            srcs,
            taken,
            not_taken,
        } = *program.block(b).end()
        else {
            continue;
        };
        let (Some(x), Some(y)) = (srcs[0].constant_value(), srcs[1].constant_value()) else {
            continue;
        };
        let target = if cond.eval(x[0], y[0]) {
            taken
        } else {
            not_taken
        };
        program.set_end(b, BlockEnd::Jump(target));
        branches += 1;
    }
    if branches > 0 {
        program.remove_unreachable();
    }

    if folded + branches > 0 {
        debug!(folded, branches, "constant folding");
    }
    folded + branches > 0
}
