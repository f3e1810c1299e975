use thiserror::Error;

use crate::hir::verify::VerifyError;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("program graph verification failed: {0}")]
    Verify(#[from] VerifyError),
    #[error("shader has no `main` function")]
    MissingEntryPoint,
    #[error("call to `{callee}` must be inlined before lowering to the program graph")]
    UnresolvedCall { callee: String },
    #[error("control flow is nested deeper than {max} levels")]
    ControlFlowTooDeep { max: usize },
    #[error("`{op}` has no machine instruction at width {width}")]
    UnsupportedOp { op: &'static str, width: u8 },
    #[error("cannot schedule instruction {instr} of block {block}: {reason}")]
    Unschedulable {
        block: usize,
        instr: usize,
        reason: &'static str,
    },
    #[error("bundle {bundle} of block {block} cannot be encoded: {reason}")]
    InvalidBundle {
        block: usize,
        bundle: usize,
        reason: &'static str,
    },
    #[error("register allocation did not converge after {rounds} rounds")]
    RegisterAllocation { rounds: u32 },
    #[error("register {reg} has to be spilled but is a spill temporary or precoloured")]
    UnspillableRegister { reg: u32 },
}
