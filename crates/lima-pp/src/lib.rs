//! Back-end of a shader compiler for the fragment processor of Mali-200/400 GPUs.
//!
//! Input is a structured program (nested `if`/`loop`, variables written many times), output is
//! a list of fixed-size bundle records plus the metadata a driver needs to run them. The
//! pipeline:
//!
//! 1. SSA construction on the structured program ([`structured::ssa`]).
//! 2. Lowering to an SSA program graph and optimisation to a fixed point ([`hir`]).
//! 3. Conversion to conventional SSA and block layout ([`hir::cssa`]).
//! 4. Instruction selection to register-level IR and scheduling for low register pressure
//!    ([`lir`]).
//! 5. Graph-colouring register allocation with spilling ([`regalloc`]).
//! 6. Packing into bundles and encoding ([`lir::sched_bundle`], [`emit`]).

pub mod bitset;
pub mod emit;
pub mod error;
pub mod hir;
pub mod limits;
pub mod lir;
pub mod options;
pub mod regalloc;
pub mod structured;
pub mod types;

use tracing::debug;

pub use emit::ShaderInfo;
pub use error::CompileError;
pub use options::CompileOptions;
pub use structured::ShaderSource;

/// A compiled fragment shader.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledShader {
    /// Allocated and scheduled program the words were encoded from.
    pub program: lir::LirProgram,
    pub words: Vec<u32>,
    pub info: ShaderInfo,
}

pub fn compile(source: &ShaderSource, options: &CompileOptions) -> Result<CompiledShader, CompileError> {
    // Cloning recurses once per nesting level as well.
    source.check_nesting()?;
    let mut source = source.clone();
    structured::ssa::into_ssa(&mut source)?;

    let mut program = hir::build::build(&source)?;
    hir::verify::verify(&program)?;
    hir::optimize(&mut program, options);
    hir::verify::verify(&program)?;
    hir::cssa::run(&mut program);

    let mut lir = lir::select::select(&program)?;
    lir::dce::run(&mut lir);
    if options.schedule_for_pressure {
        lir::sched_pressure::run(&mut lir);
    }

    let allocation = regalloc::allocate(&mut lir, options)?;
    regalloc::rewrite(&mut lir, &allocation);
    lir::sched_bundle::run(&mut lir)?;

    let (words, info) = emit::encode(&lir)?;
    debug!(
        bundles = info.num_bundles,
        rounds = allocation.rounds,
        spilled = allocation.spilled,
        "compiled shader"
    );
    Ok(CompiledShader {
        program: lir,
        words,
        info,
    })
}
