use hashbrown::HashSet;

use super::{CmdId, Program, Value};

/// Removes commands whose results cannot reach a store, a branch condition or the output.
pub fn run(program: &mut Program) -> bool {
    let mut live: HashSet<CmdId> = HashSet::new();
    let mut work: Vec<CmdId> = Vec::new();

    for &b in program.layout() {
        for src in program.block(b).end().srcs() {
            if let Value::Cmd(c) = src.value {
                work.push(c);
            }
        }
        for c in program.block_cmds(b) {
            if program.cmd(c).op.has_side_effects() {
                work.push(c);
            }
        }
    }

    while let Some(c) = work.pop() {
        if !live.insert(c) {
            continue;
        }
        for src in program.cmd(c).srcs() {
            if let Value::Cmd(p) = src.value {
                if !live.contains(&p) {
                    work.push(p);
                }
            }
        }
    }

    let dead: Vec<CmdId> = program
        .cmd_ids()
        .into_iter()
        .filter(|c| !live.contains(c))
        .collect();
    if dead.is_empty() {
        return false;
    }
    program.remove_cmds(&dead);
    program.compact();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::op::Op;
    use crate::hir::{BlockEnd, Dst, Src};

    #[test]
    fn removes_unused_chain_and_dead_phi_cycle() {
        let mut p = Program::new();
        let entry = p.entry;
        let header = p.add_block();
        let exit = p.add_block();
        p.set_end(entry, BlockEnd::Jump(header));

        let u = p.append(entry, Op::LoadUniform, Dst::new(4), vec![]);
        p.append(entry, Op::Mul, Dst::new(4), vec![Src::cmd(u), Src::cmd(u)]);

        // %phi = phi(0, %next); %next = %phi + 1, never read outside the cycle
        let phi = p.add_phi(header, 1);
        let next = p.append(header, Op::Add, Dst::new(1), vec![Src::cmd(phi), Src::scalar(1.0)]);
        p.set_end(
            header,
            BlockEnd::Branch {
                cond: crate::types::BranchCond::Lt,
                srcs: [Src::cmd(u).lane(0), Src::scalar(0.0)],
                taken: header,
                not_taken: exit,
            },
        );
        p.set_srcs(phi, vec![Src::scalar(0.0), Src::cmd(next)]);
        p.set_end(exit, BlockEnd::Output(Src::cmd(u)));

        assert!(run(&mut p));
        assert_eq!(p.num_cmds(), 1);
        assert!(p.block(header).phis().is_empty());
        assert!(!run(&mut p));
    }
}
