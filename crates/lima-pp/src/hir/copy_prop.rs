//! Copy propagation: forwards the source of plain moves (and of phis whose sources all agree)
//! into every reader.

use tracing::trace;

use super::op::{ArgWidth, Op};
use super::{BlockEnd, CmdId, Program, Src, Value};
use crate::types::OutputModifier;

pub fn run(program: &mut Program) -> bool {
    let mut changed = false;
    for c in program.cmd_ids() {
        let Some(cmd) = program.try_cmd(c) else {
            continue;
        };
        match cmd.op {
            Op::Mov => changed |= propagate_move(program, c),
            Op::Phi => {
                if let Some(src) = trivial_phi_source(program, c) {
                    changed |= forward(program, c, src);
                }
            }
            _ => {}
        }
    }
    changed
}

fn propagate_move(program: &mut Program, mov: CmdId) -> bool {
    let cmd = program.cmd(mov);
    let src = cmd.srcs()[0];
    let modifier = cmd.dst.modifier;
    let Value::Cmd(producer) = src.value else {
        return false;
    };

    if modifier != OutputModifier::None {
        let p = program.cmd(producer);
        let pushable = !src.has_modifiers()
            && program.num_users(producer) == 1
            && p.op.info().output_modifiers
            && p.dst.modifier == OutputModifier::None;
        if !pushable || !uses_accept(program, mov, src) {
            return false;
        }
        program.cmd_mut(producer).dst.modifier = modifier;
        program.cmd_mut(mov).dst.modifier = OutputModifier::None;
    }
    forward(program, mov, src)
}

/// The common source of a phi whose sources are all equal (ignoring the phi itself).
fn trivial_phi_source(program: &Program, phi: CmdId) -> Option<Src> {
    let mut common: Option<Src> = None;
    for &src in program.cmd(phi).srcs() {
        if src.value == Value::Cmd(phi) && !src.has_modifiers() {
            continue;
        }
        match common {
            None => common = Some(src),
            Some(c) if c == src => {}
            Some(_) => return None,
        }
    }
    common
}

/// Operand a reader of `old` gets when `old` is replaced by `replacement`. Constants are
/// resolved so they never carry modifiers.
fn replaced(read: Src, replacement: Src) -> Src {
    let new = read.through(replacement);
    match new.constant_value() {
        Some(v) => Src::constant(v),
        None => new,
    }
}

fn accepts(program: &Program, user: CmdId, index: usize, new: &Src, old_width: u8) -> bool {
    let cmd = program.cmd(user);
    let info = cmd.op.info();
    if new.has_modifiers() && !info.input_modifiers {
        return false;
    }
    let is_const = matches!(new.value, Value::Const(_));
    let same_width = program.value_width(new.value) == old_width;
    match cmd.op {
        Op::StoreTemp if index == 0 => new.swizzle.is_identity_for(cmd.dst.width),
        Op::Combine => is_const || same_width,
        Op::Phi => is_const || (same_width && new.swizzle.is_identity_for(cmd.dst.width)),
        _ if index == 0 && info.arg_widths.contains(&ArgWidth::Free) => same_width,
        _ => true,
    }
}

fn uses_accept(program: &Program, old: CmdId, replacement: Src) -> bool {
    let old_width = program.cmd(old).dst.width;
    for user in program.users(old) {
        for (i, &src) in program.cmd(user).srcs().iter().enumerate() {
            if src.value == Value::Cmd(old)
                && !accepts(program, user, i, &replaced(src, replacement), old_width)
            {
                return false;
            }
        }
    }
    for block in program.block_users(old) {
        let end = program.block(block).end();
        for &src in end.srcs() {
            let new = replaced(src, replacement);
            if src.value == Value::Cmd(old)
                && matches!(end, BlockEnd::Branch { .. })
                && new.has_modifiers()
            {
                return false;
            }
        }
    }
    true
}

/// Replaces every read of `old` by the equivalent read of `replacement` and deletes `old`.
/// Nothing changes unless every reader accepts the new operand.
pub(crate) fn forward(program: &mut Program, old: CmdId, replacement: Src) -> bool {
    if replacement.value == Value::Cmd(old) || !uses_accept(program, old, replacement) {
        return false;
    }
    trace!(cmd = old.0, "forwarding operand");
    program.replace_uses_with(old, |read| replaced(read, replacement));
    if program.num_users(old) == 0 && !program.cmd(old).op.has_side_effects() {
        program.remove_cmd(old);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{Dst, Src};
    use crate::types::Swizzle;

    #[test]
    fn forwards_through_swizzled_negated_move() {
        let mut p = Program::new();
        let entry = p.entry;
        let u = p.append(entry, Op::LoadUniform, Dst::new(4), vec![]);
        let mov = p.append(
            entry,
            Op::Mov,
            Dst::new(4),
            vec![Src::cmd(u).swizzled(Swizzle([3, 2, 1, 0])).neg()],
        );
        let add = p.append(
            entry,
            Op::Add,
            Dst::new(4),
            vec![Src::cmd(mov).lane(1), Src::scalar(1.0)],
        );
        p.set_end(entry, BlockEnd::Output(Src::cmd(add)));

        assert!(run(&mut p));
        assert!(p.try_cmd(mov).is_none());
        let src = p.cmd(add).srcs()[0];
        assert_eq!(src.value, Value::Cmd(u));
        assert_eq!(src.swizzle, Swizzle::splat(2));
        assert!(src.negate);
    }

    #[test]
    fn saturate_moves_onto_single_use_producer() {
        let mut p = Program::new();
        let entry = p.entry;
        let u = p.append(entry, Op::LoadUniform, Dst::new(4), vec![]);
        let mul = p.append(entry, Op::Mul, Dst::new(4), vec![Src::cmd(u), Src::cmd(u)]);
        let sat = Dst {
            width: 4,
            modifier: OutputModifier::Saturate,
        };
        let mov = p.append(entry, Op::Mov, sat, vec![Src::cmd(mul)]);
        p.set_end(entry, BlockEnd::Output(Src::cmd(mov)));

        assert!(run(&mut p));
        assert_eq!(p.cmd(mul).dst.modifier, OutputModifier::Saturate);
        assert_eq!(p.block(entry).end(), &BlockEnd::Output(Src::cmd(mul)));
    }

    #[test]
    fn modifier_stays_when_producer_has_other_users() {
        let mut p = Program::new();
        let entry = p.entry;
        let u = p.append(entry, Op::LoadUniform, Dst::new(4), vec![]);
        let mul = p.append(entry, Op::Mul, Dst::new(4), vec![Src::cmd(u), Src::cmd(u)]);
        let sat = Dst {
            width: 4,
            modifier: OutputModifier::Saturate,
        };
        let mov = p.append(entry, Op::Mov, sat, vec![Src::cmd(mul)]);
        let add = p.append(entry, Op::Add, Dst::new(4), vec![Src::cmd(mov), Src::cmd(mul)]);
        p.set_end(entry, BlockEnd::Output(Src::cmd(add)));

        assert!(!run(&mut p));
        assert_eq!(p.cmd(mul).dst.modifier, OutputModifier::None);
        assert!(p.try_cmd(mov).is_some());
    }

    #[test]
    fn store_rejects_swizzled_source() {
        let mut p = Program::new();
        let entry = p.entry;
        let u = p.append(entry, Op::LoadUniform, Dst::new(4), vec![]);
        let mov = p.append(
            entry,
            Op::Mov,
            Dst::new(4),
            vec![Src::cmd(u).swizzled(Swizzle([1, 0, 2, 3]))],
        );
        p.append(entry, Op::StoreTemp, Dst::new(4), vec![Src::cmd(mov)]);
        p.set_end(entry, BlockEnd::Output(Src::scalar(0.0)));

        assert!(!run(&mut p));
        assert!(p.try_cmd(mov).is_some());
    }
}
