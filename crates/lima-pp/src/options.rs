use crate::limits::MAX_PHYSICAL_REGISTERS;

/// Knobs for a single [`crate::compile`] invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Physical vec4 registers the allocator may use (clamped to `1..=MAX_PHYSICAL_REGISTERS`).
    pub num_registers: u8,
    /// Upper bound on build → colour → spill rounds before allocation is reported as failed.
    pub max_regalloc_rounds: u32,
    /// Upper bound on fold/expand/copy-propagation/DCE iterations.
    pub max_opt_iterations: u32,
    /// Reorder each block for register pressure before allocation.
    pub schedule_for_pressure: bool,
    /// Coalesce move-related registers during allocation.
    pub coalesce: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            num_registers: MAX_PHYSICAL_REGISTERS,
            max_regalloc_rounds: 16,
            max_opt_iterations: 64,
            schedule_for_pressure: true,
            coalesce: true,
        }
    }
}

impl CompileOptions {
    pub fn physical_registers(&self) -> u8 {
        self.num_registers.clamp(1, MAX_PHYSICAL_REGISTERS)
    }
}
