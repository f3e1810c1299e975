//! Structural checks of the program graph, run between passes.

use hashbrown::HashMap;
use thiserror::Error;

use super::dom::Dominators;
use super::op::Op;
use super::{BlockEnd, BlockId, CmdId, Program, Value};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("command %{cmd} reads removed command %{missing}")]
    DanglingSource { cmd: u32, missing: u32 },
    #[error("command %{cmd} ({op}) has {count} sources")]
    SourceCount {
        cmd: u32,
        op: &'static str,
        count: usize,
    },
    #[error("phi %{cmd} has {srcs} sources but its block has {preds} predecessors")]
    PhiSourceCount { cmd: u32, srcs: usize, preds: usize },
    #[error("command %{cmd} has invalid width {width}")]
    InvalidWidth { cmd: u32, width: u8 },
    #[error("source {src} of command %{cmd} reads past the end of its value")]
    SwizzleOutOfRange { cmd: u32, src: usize },
    #[error("command %{cmd} ({op}) carries a modifier it cannot encode")]
    UnsupportedModifier { cmd: u32, op: &'static str },
    #[error("phi %{cmd} is not at the start of block {block}")]
    MisplacedPhi { cmd: u32, block: u32 },
    #[error("end of block {block} reads removed command %{missing}")]
    EndDanglingSource { block: u32, missing: u32 },
    #[error("end of block {block} reads past the end of its value")]
    EndSwizzleOutOfRange { block: u32 },
    #[error("definition %{def} does not dominate its use in %{cmd}")]
    NotDominated { cmd: u32, def: u32 },
    #[error("definition %{def} does not dominate the end of block {block}")]
    EndNotDominated { block: u32, def: u32 },
    #[error("block {block} jumps to missing block {target}")]
    MissingSuccessor { block: u32, target: u32 },
    #[error("predecessor list of block {block} disagrees with the edges")]
    PredecessorMismatch { block: u32 },
    #[error("use list of command %{cmd} is stale")]
    StaleUses { cmd: u32 },
}

/// Checks operand shapes, predecessor/phi consistency, def-use bookkeeping and that every
/// definition dominates its uses.
pub fn verify(program: &Program) -> Result<(), VerifyError> {
    let dom = Dominators::compute(program);
    let mut position: HashMap<CmdId, (BlockId, usize)> = HashMap::new();

    for &b in program.layout() {
        let block = program.block(b);
        for (i, &c) in block.phis().iter().chain(block.cmds()).enumerate() {
            position.insert(c, (b, i));
        }
        for &c in block.cmds() {
            if program.cmd(c).op == Op::Phi {
                return Err(VerifyError::MisplacedPhi { cmd: c.0, block: b.0 });
            }
        }
        for target in block.end().successors() {
            let Some(succ) = program.try_block(target) else {
                return Err(VerifyError::MissingSuccessor {
                    block: b.0,
                    target: target.0,
                });
            };
            if !succ.preds().contains(&b) {
                return Err(VerifyError::PredecessorMismatch { block: target.0 });
            }
        }
        for &p in block.preds() {
            let reaches = program
                .try_block(p)
                .is_some_and(|pred| pred.end().successors().any(|s| s == b));
            if !reaches {
                return Err(VerifyError::PredecessorMismatch { block: b.0 });
            }
        }
    }

    for &b in program.layout() {
        let block = program.block(b);
        for &c in block.phis().iter().chain(block.cmds()) {
            check_cmd(program, &dom, &position, c)?;
        }
        let width = match block.end() {
            BlockEnd::Output(_) => 4,
            _ => 1,
        };
        for src in block.end().srcs() {
            let Value::Cmd(def) = src.value else {
                continue;
            };
            let Some(&(def_block, _)) = position.get(&def) else {
                return Err(VerifyError::EndDanglingSource {
                    block: b.0,
                    missing: def.0,
                });
            };
            if !program.cmd(def).block_uses.contains(&b) {
                return Err(VerifyError::StaleUses { cmd: def.0 });
            }
            if src.swizzle.max_component(width) >= program.cmd(def).dst.width {
                return Err(VerifyError::EndSwizzleOutOfRange { block: b.0 });
            }
            if dom.is_reachable(b) && !dom.dominates(def_block, b) {
                return Err(VerifyError::EndNotDominated {
                    block: b.0,
                    def: def.0,
                });
            }
        }
    }
    Ok(())
}

fn check_cmd(
    program: &Program,
    dom: &Dominators,
    position: &HashMap<CmdId, (BlockId, usize)>,
    c: CmdId,
) -> Result<(), VerifyError> {
    let cmd = program.cmd(c);
    let info = cmd.op.info();
    let count = cmd.srcs().len();
    let (own_block, own_index) = position[&c];

    if !(1..=4).contains(&cmd.dst.width) {
        return Err(VerifyError::InvalidWidth {
            cmd: c.0,
            width: cmd.dst.width,
        });
    }

    if cmd.op == Op::Phi {
        let preds = program.block(own_block).preds().len();
        if count != preds {
            return Err(VerifyError::PhiSourceCount {
                cmd: c.0,
                srcs: count,
                preds,
            });
        }
    } else if count < info.min_args as usize || count > info.max_args as usize {
        return Err(VerifyError::SourceCount {
            cmd: c.0,
            op: info.name,
            count,
        });
    }

    if cmd.dst.modifier != Default::default() && !info.output_modifiers {
        return Err(VerifyError::UnsupportedModifier {
            cmd: c.0,
            op: info.name,
        });
    }

    for (i, src) in cmd.srcs().iter().enumerate() {
        if src.has_modifiers() && !info.input_modifiers {
            return Err(VerifyError::UnsupportedModifier {
                cmd: c.0,
                op: info.name,
            });
        }
        let Value::Cmd(def) = src.value else {
            continue;
        };
        let Some(&(def_block, def_index)) = position.get(&def) else {
            return Err(VerifyError::DanglingSource {
                cmd: c.0,
                missing: def.0,
            });
        };
        if !program.cmd(def).uses.contains(&c) {
            return Err(VerifyError::StaleUses { cmd: def.0 });
        }
        let width = program.src_width(c, i);
        if src.swizzle.max_component(width) >= program.cmd(def).dst.width {
            return Err(VerifyError::SwizzleOutOfRange { cmd: c.0, src: i });
        }

        let dominated = if cmd.op == Op::Phi {
            let pred = program.block(own_block).preds()[i];
            !dom.is_reachable(pred) || dom.dominates(def_block, pred)
        } else if def_block == own_block {
            def_index < own_index
        } else {
            !dom.is_reachable(own_block) || dom.dominates(def_block, own_block)
        };
        if !dominated {
            return Err(VerifyError::NotDominated {
                cmd: c.0,
                def: def.0,
            });
        }
    }
    Ok(())
}
