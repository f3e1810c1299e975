//! Operand-level types shared by the structured IR, the HIR and the LIR.

use core::fmt;

use bitflags::bitflags;

const LANE_NAMES: [char; 4] = ['x', 'y', 'z', 'w'];

bitflags! {
    /// Per-lane destination write mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WriteMask: u8 {
        const X = 0b0001;
        const Y = 0b0010;
        const Z = 0b0100;
        const W = 0b1000;
        const XY = Self::X.bits() | Self::Y.bits();
        const XYZ = Self::XY.bits() | Self::Z.bits();
        const XYZW = Self::XYZ.bits() | Self::W.bits();
    }
}

impl WriteMask {
    /// Mask covering lanes `0..width`.
    pub fn for_width(width: u8) -> Self {
        debug_assert!((1..=4).contains(&width), "invalid vector width {width}");
        Self::from_bits_truncate(((1u16 << width) - 1) as u8)
    }

    pub fn lane(lane: u8) -> Self {
        Self::from_bits_truncate(1 << lane)
    }

    pub fn has_lane(self, lane: u8) -> bool {
        lane < 4 && self.contains(Self::lane(lane))
    }

    pub fn lanes(self) -> impl Iterator<Item = u8> {
        (0..4u8).filter(move |&l| self.has_lane(l))
    }

    pub fn count(self) -> u8 {
        self.bits().count_ones() as u8
    }

    /// Lowest written lane, if any.
    pub fn first(self) -> Option<u8> {
        self.lanes().next()
    }
}

impl fmt::Display for WriteMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for lane in self.lanes() {
            write!(f, "{}", LANE_NAMES[lane as usize])?;
        }
        Ok(())
    }
}

/// 4-lane swizzle.
///
/// Lane `i` of the swizzled operand reads component `self.0[i]` of the referenced value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Swizzle(pub [u8; 4]);

impl Swizzle {
    pub const IDENTITY: Self = Self([0, 1, 2, 3]);

    pub const fn splat(component: u8) -> Self {
        Self([component; 4])
    }

    pub fn component(self, lane: u8) -> u8 {
        self.0[lane as usize]
    }

    /// True when lanes `0..width` read their own component.
    pub fn is_identity_for(self, width: u8) -> bool {
        (0..width).all(|l| self.component(l) == l)
    }

    /// Swizzle equivalent to applying `inner` to a value and then `self` to the result.
    pub fn compose(self, inner: Swizzle) -> Swizzle {
        Swizzle(self.0.map(|c| inner.0[c as usize]))
    }

    /// Largest component referenced by lanes `0..width`.
    pub fn max_component(self, width: u8) -> u8 {
        (0..width).map(|l| self.component(l)).max().unwrap_or(0)
    }
}

impl Default for Swizzle {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl fmt::Display for Swizzle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0 {
            write!(f, "{}", LANE_NAMES[(c & 3) as usize])?;
        }
        Ok(())
    }
}

/// Modifier applied to an instruction result after the operation itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutputModifier {
    #[default]
    None,
    /// Clamp to `[0, 1]`.
    Saturate,
    /// Clamp to `[0, +inf)`.
    ClampPositive,
    /// Round to the nearest integer.
    Round,
}

impl OutputModifier {
    pub fn apply(self, v: f32) -> f32 {
        match self {
            OutputModifier::None => v,
            OutputModifier::Saturate => v.clamp(0.0, 1.0),
            OutputModifier::ClampPositive => v.max(0.0),
            OutputModifier::Round => v.round(),
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            OutputModifier::None => "",
            OutputModifier::Saturate => ".sat",
            OutputModifier::ClampPositive => ".pos",
            OutputModifier::Round => ".int",
        }
    }
}

/// Comparison used by block-ending branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchCond {
    Always,
    Lt,
    Eq,
    Le,
    Gt,
    Ne,
    Ge,
}

impl BranchCond {
    pub fn eval(self, a: f32, b: f32) -> bool {
        match self {
            BranchCond::Always => true,
            BranchCond::Lt => a < b,
            BranchCond::Eq => a == b,
            BranchCond::Le => a <= b,
            BranchCond::Gt => a > b,
            BranchCond::Ne => a != b,
            BranchCond::Ge => a >= b,
        }
    }

    /// Condition taking the opposite edge. `Always` has no inverse and is returned unchanged.
    pub fn invert(self) -> Self {
        match self {
            BranchCond::Always => BranchCond::Always,
            BranchCond::Lt => BranchCond::Ge,
            BranchCond::Eq => BranchCond::Ne,
            BranchCond::Le => BranchCond::Gt,
            BranchCond::Gt => BranchCond::Le,
            BranchCond::Ne => BranchCond::Eq,
            BranchCond::Ge => BranchCond::Lt,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BranchCond::Always => "always",
            BranchCond::Lt => "lt",
            BranchCond::Eq => "eq",
            BranchCond::Le => "le",
            BranchCond::Gt => "gt",
            BranchCond::Ne => "ne",
            BranchCond::Ge => "ge",
        }
    }

    /// 3-bit hardware condition code.
    pub fn code(self) -> u32 {
        match self {
            BranchCond::Always => 0,
            BranchCond::Lt => 1,
            BranchCond::Eq => 2,
            BranchCond::Le => 3,
            BranchCond::Gt => 4,
            BranchCond::Ne => 5,
            BranchCond::Ge => 6,
        }
    }
}
