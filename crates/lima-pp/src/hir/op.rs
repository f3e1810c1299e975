//! Opcode metadata table.

/// Width of an operand position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgWidth {
    /// Same width as the command's destination.
    Dest,
    Fixed(u8),
    /// Width of the value referenced by the first source (horizontal reductions).
    Free,
}

/// Width of the value a command produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultWidth {
    /// Chosen by the producer of the command.
    Dest,
    Fixed(u8),
    /// One lane per source (`combine`).
    Sources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    pub name: &'static str,
    pub min_args: u8,
    pub max_args: u8,
    pub commutative: bool,
    pub has_dest: bool,
    pub arg_widths: [ArgWidth; 3],
    pub result: ResultWidth,
    pub input_modifiers: bool,
    pub output_modifiers: bool,
    /// Result depends only on the sources (foldable when they are constant).
    pub pure: bool,
}

const VARIADIC: u8 = u8::MAX;

const fn alu(name: &'static str, args: u8) -> OpInfo {
    OpInfo {
        name,
        min_args: args,
        max_args: args,
        commutative: false,
        has_dest: true,
        arg_widths: [ArgWidth::Dest; 3],
        result: ResultWidth::Dest,
        input_modifiers: true,
        output_modifiers: true,
        pure: true,
    }
}

const fn commutative(info: OpInfo) -> OpInfo {
    OpInfo {
        commutative: true,
        ..info
    }
}

const fn reduce(name: &'static str, args: u8, arg: ArgWidth) -> OpInfo {
    OpInfo {
        arg_widths: [arg; 3],
        result: ResultWidth::Fixed(1),
        ..alu(name, args)
    }
}

const fn input(name: &'static str, width: u8) -> OpInfo {
    OpInfo {
        result: ResultWidth::Fixed(width),
        input_modifiers: false,
        output_modifiers: false,
        pure: false,
        ..alu(name, 0)
    }
}

const fn texture(name: &'static str, coords: u8) -> OpInfo {
    OpInfo {
        arg_widths: [ArgWidth::Fixed(coords); 3],
        ..input(name, 4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    Mov,
    Neg,
    Abs,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Floor,
    Ceil,
    Fract,
    Sign,
    Rcp,
    Sqrt,
    Rsqrt,
    Exp2,
    Log2,
    Pow,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    /// `sin(2πx)`, the hardware sine taking turns instead of radians.
    SinLut,
    /// `cos(2πx)`.
    CosLut,
    /// First half of the hardware arctangent: `x -> [x, 1, 0]`.
    AtanPt1,
    /// First half of the hardware two-argument arctangent: `(y, x) -> [y, x, 0]`.
    Atan2Pt1,
    /// Second half of the hardware arctangent: `v -> atan2(v.x, v.y)`.
    AtanPt2,
    Dot2,
    Dot3,
    Dot4,
    Sum3,
    Sum4,
    Normalize,
    /// `lrp(a, b, t) = a + t * (b - a)`.
    Lrp,
    Gt,
    Ge,
    Eq,
    Ne,
    Not,
    Any,
    All,
    AllEq,
    AnyNe,
    /// `select(c, a, b) = c != 0 ? a : b`, per lane.
    Select,
    Ddx,
    Ddy,
    /// Builds a vector from one lane of each source.
    Combine,
    LoadUniform,
    LoadVarying,
    LoadTemp,
    FragCoord,
    FrontFacing,
    PointCoord,
    Texld2d,
    Texld2dProj,
    TexldCube,
    StoreTemp,
    Phi,
}

impl Op {
    pub fn info(self) -> OpInfo {
        match self {
            Op::Mov => alu("mov", 1),
            Op::Neg => alu("neg", 1),
            Op::Abs => alu("abs", 1),
            Op::Add => commutative(alu("add", 2)),
            Op::Sub => alu("sub", 2),
            Op::Mul => commutative(alu("mul", 2)),
            Op::Div => alu("div", 2),
            Op::Mod => alu("mod", 2),
            Op::Min => commutative(alu("min", 2)),
            Op::Max => commutative(alu("max", 2)),
            Op::Floor => alu("floor", 1),
            Op::Ceil => alu("ceil", 1),
            Op::Fract => alu("fract", 1),
            Op::Sign => alu("sign", 1),
            Op::Rcp => alu("rcp", 1),
            Op::Sqrt => alu("sqrt", 1),
            Op::Rsqrt => alu("rsqrt", 1),
            Op::Exp2 => alu("exp2", 1),
            Op::Log2 => alu("log2", 1),
            Op::Pow => alu("pow", 2),
            Op::Sin => alu("sin", 1),
            Op::Cos => alu("cos", 1),
            Op::Tan => alu("tan", 1),
            Op::Asin => alu("asin", 1),
            Op::Acos => alu("acos", 1),
            Op::Atan => alu("atan", 1),
            Op::Atan2 => alu("atan2", 2),
            Op::SinLut => alu("sin_lut", 1),
            Op::CosLut => alu("cos_lut", 1),
            Op::AtanPt1 => OpInfo {
                arg_widths: [ArgWidth::Fixed(1); 3],
                result: ResultWidth::Fixed(3),
                output_modifiers: false,
                ..alu("atan_pt1", 1)
            },
            Op::Atan2Pt1 => OpInfo {
                arg_widths: [ArgWidth::Fixed(1); 3],
                result: ResultWidth::Fixed(3),
                output_modifiers: false,
                ..alu("atan2_pt1", 2)
            },
            Op::AtanPt2 => OpInfo {
                input_modifiers: false,
                ..reduce("atan_pt2", 1, ArgWidth::Fixed(3))
            },
            Op::Dot2 => commutative(reduce("dot2", 2, ArgWidth::Fixed(2))),
            Op::Dot3 => commutative(reduce("dot3", 2, ArgWidth::Fixed(3))),
            Op::Dot4 => commutative(reduce("dot4", 2, ArgWidth::Fixed(4))),
            Op::Sum3 => reduce("sum3", 1, ArgWidth::Fixed(3)),
            Op::Sum4 => reduce("sum4", 1, ArgWidth::Fixed(4)),
            Op::Normalize => alu("normalize", 1),
            Op::Lrp => alu("lrp", 3),
            Op::Gt => alu("gt", 2),
            Op::Ge => alu("ge", 2),
            Op::Eq => commutative(alu("eq", 2)),
            Op::Ne => commutative(alu("ne", 2)),
            Op::Not => alu("not", 1),
            Op::Any => reduce("any", 1, ArgWidth::Free),
            Op::All => reduce("all", 1, ArgWidth::Free),
            Op::AllEq => commutative(reduce("all_eq", 2, ArgWidth::Free)),
            Op::AnyNe => commutative(reduce("any_ne", 2, ArgWidth::Free)),
            Op::Select => alu("select", 3),
            Op::Ddx => alu("ddx", 1),
            Op::Ddy => alu("ddy", 1),
            Op::Combine => OpInfo {
                min_args: 1,
                max_args: 4,
                arg_widths: [ArgWidth::Fixed(1); 3],
                result: ResultWidth::Sources,
                output_modifiers: false,
                ..alu("combine", 1)
            },
            Op::LoadUniform => input("load_uniform", 4),
            Op::LoadVarying => input("load_varying", 4),
            Op::LoadTemp => OpInfo {
                max_args: 1,
                arg_widths: [ArgWidth::Fixed(1); 3],
                result: ResultWidth::Dest,
                ..input("load_temp", 4)
            },
            Op::FragCoord => input("frag_coord", 4),
            Op::FrontFacing => input("front_facing", 1),
            Op::PointCoord => input("point_coord", 2),
            Op::Texld2d => texture("texld_2d", 2),
            Op::Texld2dProj => texture("texld_2d_proj", 3),
            Op::TexldCube => texture("texld_cube", 3),
            Op::StoreTemp => OpInfo {
                min_args: 1,
                max_args: 2,
                has_dest: false,
                arg_widths: [ArgWidth::Dest, ArgWidth::Fixed(1), ArgWidth::Fixed(1)],
                result: ResultWidth::Dest,
                input_modifiers: false,
                output_modifiers: false,
                pure: false,
                ..alu("store_temp", 1)
            },
            Op::Phi => OpInfo {
                min_args: 0,
                max_args: VARIADIC,
                input_modifiers: false,
                output_modifiers: false,
                pure: false,
                ..alu("phi", 0)
            },
        }
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Width of source `index` given the command's destination width and the width of the value
    /// its first source references.
    pub fn arg_width(self, index: usize, dest: u8, first_source: u8) -> u8 {
        match self.info().arg_widths[index.min(2)] {
            ArgWidth::Dest => dest,
            ArgWidth::Fixed(n) => n,
            ArgWidth::Free => first_source,
        }
    }

    /// Operations the hardware only evaluates on a single lane.
    pub fn is_scalar_only(self) -> bool {
        matches!(
            self,
            Op::Rcp
                | Op::Sqrt
                | Op::Rsqrt
                | Op::Exp2
                | Op::Log2
                | Op::SinLut
                | Op::CosLut
                | Op::Atan
                | Op::Atan2
        )
    }

    /// Operations a functional unit implements directly; everything else is expanded.
    pub fn is_native(self) -> bool {
        !matches!(
            self,
            Op::Neg
                | Op::Abs
                | Op::Sub
                | Op::Div
                | Op::Mod
                | Op::Pow
                | Op::Sin
                | Op::Cos
                | Op::Tan
                | Op::Asin
                | Op::Acos
                | Op::Atan
                | Op::Atan2
                | Op::Dot2
                | Op::Dot3
                | Op::Dot4
                | Op::Normalize
                | Op::Lrp
                | Op::Not
                | Op::Any
                | Op::All
                | Op::AllEq
                | Op::AnyNe
        )
    }

    pub fn is_texture(self) -> bool {
        matches!(self, Op::Texld2d | Op::Texld2dProj | Op::TexldCube)
    }

    pub fn has_side_effects(self) -> bool {
        matches!(self, Op::StoreTemp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reductions_take_free_width_from_first_source() {
        assert_eq!(Op::Any.arg_width(0, 1, 3), 3);
        assert_eq!(Op::Dot3.arg_width(1, 1, 4), 3);
        assert_eq!(Op::Add.arg_width(1, 2, 4), 2);
        assert_eq!(Op::StoreTemp.arg_width(1, 4, 4), 1);
    }

    #[test]
    fn scalar_only_ops_are_alu() {
        for op in [Op::Rcp, Op::Exp2, Op::SinLut, Op::Atan2] {
            let info = op.info();
            assert!(info.has_dest && info.pure, "{}", info.name);
        }
    }
}
