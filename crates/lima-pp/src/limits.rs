//! Centralized limits of the fragment-processor ISA and of the compiler itself.
//!
//! Hardware limits determine encoding field widths; compiler limits bound recursion and memory use
//! for pathological inputs produced by a front-end.

/// Number of physical vec4 registers (`r0`..`r5`) available to the allocator.
pub const MAX_PHYSICAL_REGISTERS: u8 = 6;

/// Lanes in a physical register.
pub const REGISTER_LANES: u8 = 4;

/// Physical register receiving the fragment colour when the shader stops.
pub const OUTPUT_REGISTER: u8 = 0;

/// Maximum `if`/`loop` nesting depth accepted by the structured IR walkers.
///
/// SSA construction and the program-graph builder recurse once per nesting level; deeper inputs
/// are rejected by an iterative check before either runs.
pub const MAX_CONTROL_FLOW_NESTING: usize = 64;

/// Constant vectors embedded in a single bundle (`^const0`, `^const1`).
pub const MAX_BUNDLE_CONSTANTS: usize = 2;

/// 32-bit words in one encoded bundle record (see [`crate::emit`] for the field layout).
pub const BUNDLE_RECORD_WORDS: usize = 35;

/// Largest value representable in the 16-bit index field of a bundle slot (uniform, varying,
/// sampler, temporary address or branch target).
pub const MAX_SLOT_INDEX: u32 = u16::MAX as u32;
