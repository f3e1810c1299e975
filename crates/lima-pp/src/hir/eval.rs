//! Reference scalar semantics shared by constant folding and the interpreters.

use core::f32::consts::TAU;

use thiserror::Error;

use crate::hir::op::Op;
use crate::types::{OutputModifier, Swizzle};

/// Fragment inputs of one shader invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Inputs {
    pub uniforms: Vec<[f32; 4]>,
    pub varyings: Vec<[f32; 4]>,
    pub frag_coord: [f32; 4],
    pub front_facing: f32,
    pub point_coord: [f32; 2],
}

impl Inputs {
    pub fn uniform(&self, index: u32) -> [f32; 4] {
        self.uniforms.get(index as usize).copied().unwrap_or([0.0; 4])
    }

    pub fn varying(&self, index: u32) -> [f32; 4] {
        self.varyings.get(index as usize).copied().unwrap_or([0.0; 4])
    }
}

/// Result of running a shader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Color([f32; 4]),
    Discarded,
}

impl Outcome {
    /// Equality up to a relative tolerance; NaN lanes compare equal to each other.
    pub fn approx_eq(&self, other: &Outcome, tolerance: f32) -> bool {
        match (self, other) {
            (Outcome::Discarded, Outcome::Discarded) => true,
            (Outcome::Color(a), Outcome::Color(b)) => a
                .iter()
                .zip(b)
                .all(|(&x, &y)| lanes_approx_eq(x, y, tolerance)),
            _ => false,
        }
    }
}

pub fn lanes_approx_eq(x: f32, y: f32, tolerance: f32) -> bool {
    if x.is_nan() || y.is_nan() {
        return x.is_nan() && y.is_nan();
    }
    if x.is_infinite() || y.is_infinite() {
        return x == y;
    }
    (x - y).abs() <= tolerance * x.abs().max(y.abs()).max(1.0)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterpError {
    #[error("step limit of {0} exceeded")]
    StepLimit(u64),
    #[error("call to `{0}` cannot be interpreted")]
    Call(String),
    #[error("function `{0}` not found")]
    MissingFunction(String),
}

/// Applies a source's swizzle and input modifiers (absolute before negate).
pub fn read_source(value: [f32; 4], swizzle: Swizzle, absolute: bool, negate: bool) -> [f32; 4] {
    swizzle.0.map(|c| {
        let mut v = value[(c & 3) as usize];
        if absolute {
            v = v.abs();
        }
        if negate {
            v = -v;
        }
        v
    })
}

pub fn apply_modifier(value: [f32; 4], modifier: OutputModifier) -> [f32; 4] {
    value.map(|v| modifier.apply(v))
}

fn bool_f(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn lanewise1(width: u8, a: [f32; 4], f: impl Fn(f32) -> f32) -> [f32; 4] {
    let mut out = [0.0; 4];
    for l in 0..width as usize {
        out[l] = f(a[l]);
    }
    out
}

fn lanewise2(width: u8, a: [f32; 4], b: [f32; 4], f: impl Fn(f32, f32) -> f32) -> [f32; 4] {
    let mut out = [0.0; 4];
    for l in 0..width as usize {
        out[l] = f(a[l], b[l]);
    }
    out
}

fn dot(n: usize, a: [f32; 4], b: [f32; 4]) -> f32 {
    (0..n).map(|l| a[l] * b[l]).sum()
}

/// Evaluates a pure operation over already-swizzled sources.
///
/// `width` is the destination width and `free` the width of the value the first source
/// references. Returns `None` for operations that read state other than their sources.
pub fn evaluate(op: Op, width: u8, free: u8, args: &[[f32; 4]]) -> Option<[f32; 4]> {
    let arg = |i: usize| args.get(i).copied().unwrap_or([0.0; 4]);
    let (a, b, c) = (arg(0), arg(1), arg(2));
    let n = free.clamp(1, 4) as usize;
    let scalar = |v: f32| [v, 0.0, 0.0, 0.0];
    let out = match op {
        Op::Mov => lanewise1(width, a, |x| x),
        Op::Neg => lanewise1(width, a, |x| -x),
        Op::Abs => lanewise1(width, a, f32::abs),
        Op::Add => lanewise2(width, a, b, |x, y| x + y),
        Op::Sub => lanewise2(width, a, b, |x, y| x - y),
        Op::Mul => lanewise2(width, a, b, |x, y| x * y),
        Op::Div => lanewise2(width, a, b, |x, y| x / y),
        Op::Mod => lanewise2(width, a, b, |x, y| x - y * (x / y).floor()),
        Op::Min => lanewise2(width, a, b, f32::min),
        Op::Max => lanewise2(width, a, b, f32::max),
        Op::Floor => lanewise1(width, a, f32::floor),
        Op::Ceil => lanewise1(width, a, f32::ceil),
        Op::Fract => lanewise1(width, a, |x| x - x.floor()),
        Op::Sign => lanewise1(width, a, |x| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        }),
        Op::Rcp => lanewise1(width, a, f32::recip),
        Op::Sqrt => lanewise1(width, a, f32::sqrt),
        Op::Rsqrt => lanewise1(width, a, |x| x.sqrt().recip()),
        Op::Exp2 => lanewise1(width, a, f32::exp2),
        Op::Log2 => lanewise1(width, a, f32::log2),
        Op::Pow => lanewise2(width, a, b, f32::powf),
        Op::Sin => lanewise1(width, a, f32::sin),
        Op::Cos => lanewise1(width, a, f32::cos),
        Op::Tan => lanewise1(width, a, f32::tan),
        Op::Asin => lanewise1(width, a, f32::asin),
        Op::Acos => lanewise1(width, a, f32::acos),
        Op::Atan => lanewise1(width, a, f32::atan),
        Op::Atan2 => lanewise2(width, a, b, f32::atan2),
        Op::SinLut => lanewise1(width, a, |x| (x * TAU).sin()),
        Op::CosLut => lanewise1(width, a, |x| (x * TAU).cos()),
        Op::AtanPt1 => [a[0], 1.0, 0.0, 0.0],
        Op::Atan2Pt1 => [a[0], b[0], 0.0, 0.0],
        Op::AtanPt2 => scalar(a[0].atan2(a[1])),
        Op::Dot2 => scalar(dot(2, a, b)),
        Op::Dot3 => scalar(dot(3, a, b)),
        Op::Dot4 => scalar(dot(4, a, b)),
        Op::Sum3 => scalar(a[0] + a[1] + a[2]),
        Op::Sum4 => scalar(a[0] + a[1] + a[2] + a[3]),
        Op::Normalize => {
            let len = dot(width as usize, a, a).sqrt();
            lanewise1(width, a, |x| x / len)
        }
        Op::Lrp => {
            let mut out = [0.0; 4];
            for l in 0..width as usize {
                out[l] = a[l] + c[l] * (b[l] - a[l]);
            }
            out
        }
        Op::Gt => lanewise2(width, a, b, |x, y| bool_f(x > y)),
        Op::Ge => lanewise2(width, a, b, |x, y| bool_f(x >= y)),
        Op::Eq => lanewise2(width, a, b, |x, y| bool_f(x == y)),
        Op::Ne => lanewise2(width, a, b, |x, y| bool_f(x != y)),
        Op::Not => lanewise1(width, a, |x| 1.0 - x),
        Op::Any => scalar(bool_f(a[..n].iter().any(|&x| x != 0.0))),
        Op::All => scalar(bool_f(a[..n].iter().all(|&x| x != 0.0))),
        Op::AllEq => scalar(bool_f((0..n).all(|l| a[l] == b[l]))),
        Op::AnyNe => scalar(bool_f((0..n).any(|l| a[l] != b[l]))),
        Op::Select => {
            let mut out = [0.0; 4];
            for l in 0..width as usize {
                out[l] = if a[l] != 0.0 { b[l] } else { c[l] };
            }
            out
        }
        // A single invocation has no neighbours; derivatives of anything are zero.
        Op::Ddx | Op::Ddy => [0.0; 4],
        Op::Combine => {
            let mut out = [0.0; 4];
            for (l, v) in args.iter().take(4).enumerate() {
                out[l] = v[0];
            }
            out
        }
        Op::LoadUniform
        | Op::LoadVarying
        | Op::LoadTemp
        | Op::FragCoord
        | Op::FrontFacing
        | Op::PointCoord
        | Op::Texld2d
        | Op::Texld2dProj
        | Op::TexldCube
        | Op::StoreTemp
        | Op::Phi => return None,
    };
    Some(out)
}

/// Deterministic stand-in for texture sampling used by the interpreters.
pub fn sample_texture(op: Op, sampler: u32, coords: [f32; 4]) -> [f32; 4] {
    let (s, t) = match op {
        Op::Texld2dProj => (coords[0] / coords[2], coords[1] / coords[2]),
        Op::TexldCube => {
            let m = coords[0].abs().max(coords[1].abs()).max(coords[2].abs());
            (coords[0] / m + coords[2] / m, coords[1] / m)
        }
        _ => (coords[0], coords[1]),
    };
    let fract = |x: f32| x - x.floor();
    [fract(s), fract(t), fract(s + t), sampler as f32 / 16.0]
}
