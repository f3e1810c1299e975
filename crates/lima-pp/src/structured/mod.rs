//! Structured input IR: the form the front-end hands to the compiler.
//!
//! Control flow is limited to nested `if`/`loop` constructs with `break`/`continue`. Phi lists on
//! `if` and `loop` are empty on input and populated by [`ssa::into_ssa`].

pub mod interp;
pub mod ssa;

use core::fmt;

use crate::error::CompileError;
use crate::hir::op::Op;
use crate::limits::MAX_CONTROL_FLOW_NESTING;
use crate::types::{BranchCond, OutputModifier, Swizzle, WriteMask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

/// Identifies one `break` or `continue` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JumpId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    /// Lanes per element, 1..=4.
    pub width: u8,
    /// Element count for arrays. Arrays always live in temporary storage.
    pub array_len: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Index {
    Const(u32),
    /// Scalar operand; lane 0 is truncated to an element index.
    Dynamic(Box<Operand>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Var(VarId),
    Element { var: VarId, index: Index },
    Const([f32; 4]),
    Uniform(u32),
    Varying(u32),
    FragCoord,
    FrontFacing,
    PointCoord,
    /// Read of a variable with no reaching definition.
    Undef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub value: Value,
    pub swizzle: Swizzle,
    pub absolute: bool,
    pub negate: bool,
}

impl Operand {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            swizzle: Swizzle::IDENTITY,
            absolute: false,
            negate: false,
        }
    }

    pub fn var(var: VarId) -> Self {
        Self::new(Value::Var(var))
    }

    pub fn element(var: VarId, index: u32) -> Self {
        Self::new(Value::Element {
            var,
            index: Index::Const(index),
        })
    }

    pub fn dynamic_element(var: VarId, index: Operand) -> Self {
        Self::new(Value::Element {
            var,
            index: Index::Dynamic(Box::new(index)),
        })
    }

    pub fn constant(value: [f32; 4]) -> Self {
        Self::new(Value::Const(value))
    }

    pub fn scalar(value: f32) -> Self {
        Self::constant([value; 4])
    }

    pub fn uniform(index: u32) -> Self {
        Self::new(Value::Uniform(index))
    }

    pub fn varying(index: u32) -> Self {
        Self::new(Value::Varying(index))
    }

    pub fn undef() -> Self {
        Self::new(Value::Undef)
    }

    /// Applies `swizzle` on top of the operand's current swizzle.
    pub fn swizzled(mut self, swizzle: Swizzle) -> Self {
        self.swizzle = swizzle.compose(self.swizzle);
        self
    }

    pub fn lane(self, lane: u8) -> Self {
        self.swizzled(Swizzle::splat(lane))
    }

    pub fn neg(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    pub fn abs(mut self) -> Self {
        self.absolute = true;
        self.negate = false;
        self
    }

    pub fn has_modifiers(&self) -> bool {
        self.absolute || self.negate
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Place {
    Var(VarId),
    Element { var: VarId, index: Index },
}

impl Place {
    pub fn var(&self) -> VarId {
        match self {
            Place::Var(v) | Place::Element { var: v, .. } => *v,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rhs {
    Op { op: Op, args: Vec<Operand> },
    Texture { op: Op, sampler: u32, coords: Operand },
}

impl Rhs {
    pub fn op(&self) -> Op {
        match self {
            Rhs::Op { op, .. } | Rhs::Texture { op, .. } => *op,
        }
    }
}

/// `dst.mask = modifier(rhs)`.
///
/// The right-hand side is evaluated at the destination's width with lane `i` of the result
/// written to lane `i` of `dst`; scalar-result operations broadcast. Lanes outside `mask` keep
/// the destination's previous value, which after SSA construction is named by `prior`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assign {
    pub dst: Place,
    pub mask: WriteMask,
    pub rhs: Rhs,
    pub modifier: OutputModifier,
    pub prior: Option<VarId>,
}

/// Compares lane 0 of two operands.
#[derive(Debug, Clone, PartialEq)]
pub struct Cond {
    pub cmp: BranchCond,
    pub a: Operand,
    pub b: Operand,
}

impl Cond {
    pub fn new(cmp: BranchCond, a: Operand, b: Operand) -> Self {
        Self { cmp, a, b }
    }
}

/// Join of the two arms of an `if`. `None` marks an arm that cannot reach the join or has no
/// reaching definition.
#[derive(Debug, Clone, PartialEq)]
pub struct IfPhi {
    pub dest: VarId,
    pub if_true: Option<VarId>,
    pub if_false: Option<VarId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct If {
    pub cond: Cond,
    pub then_body: Vec<Stmt>,
    pub else_body: Vec<Stmt>,
    pub phis: Vec<IfPhi>,
}

/// Merge at the top of a loop: the entry edge, the back edge from the end of the body and one
/// edge per `continue`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopBeginPhi {
    pub dest: VarId,
    pub enter: Option<VarId>,
    pub repeat: Option<VarId>,
    pub continues: Vec<(JumpId, Option<VarId>)>,
}

/// Merge after a loop: one edge per `break`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopEndPhi {
    pub dest: VarId,
    pub breaks: Vec<(JumpId, Option<VarId>)>,
}

/// Infinite loop; leaves only through `break`.
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    pub body: Vec<Stmt>,
    pub begin_phis: Vec<LoopBeginPhi>,
    pub end_phis: Vec<LoopEndPhi>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallArg {
    In(Operand),
    Out(VarId),
    InOut(VarId),
    /// In/out parameter passed as a value and received in a separate variable.
    Split { input: Operand, output: VarId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub callee: String,
    pub args: Vec<CallArg>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign(Assign),
    If(If),
    Loop(Loop),
    Break(JumpId),
    Continue(JumpId),
    Discard,
    Call(Call),
    /// Ends the invocation with the given fragment colour.
    Output(Operand),
}

impl Stmt {
    pub fn if_else(cond: Cond, then_body: Vec<Stmt>, else_body: Vec<Stmt>) -> Self {
        Stmt::If(If {
            cond,
            then_body,
            else_body,
            phis: Vec::new(),
        })
    }

    pub fn looped(body: Vec<Stmt>) -> Self {
        Stmt::Loop(Loop {
            body,
            begin_phis: Vec::new(),
            end_phis: Vec::new(),
        })
    }

    /// Control never continues to the next statement of the same list.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Stmt::Break(_) | Stmt::Continue(_) | Stmt::Discard | Stmt::Output(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub body: Vec<Stmt>,
}

/// A whole shader: variable declarations shared by all functions, and the functions themselves.
/// The entry point is named `main`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShaderSource {
    /// Retired declarations (replaced by SSA renaming) are `None`.
    pub vars: Vec<Option<VarDecl>>,
    pub functions: Vec<Function>,
    next_jump: u32,
}

impl ShaderSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: impl Into<String>, width: u8) -> VarId {
        self.push_decl(VarDecl {
            name: name.into(),
            width,
            array_len: None,
        })
    }

    pub fn declare_array(&mut self, name: impl Into<String>, width: u8, len: u32) -> VarId {
        self.push_decl(VarDecl {
            name: name.into(),
            width,
            array_len: Some(len),
        })
    }

    fn push_decl(&mut self, decl: VarDecl) -> VarId {
        debug_assert!((1..=4).contains(&decl.width));
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Some(decl));
        id
    }

    /// Declares a fresh variable derived from `original` (same width, suffixed name).
    pub fn new_var(&mut self, original: VarId, version: u32) -> VarId {
        let decl = self.var(original);
        let name = format!("{}.{version}", decl.name);
        let width = decl.width;
        self.declare(name, width)
    }

    pub fn retire(&mut self, var: VarId) {
        self.vars[var.0 as usize] = None;
    }

    pub fn try_var(&self, var: VarId) -> Option<&VarDecl> {
        self.vars.get(var.0 as usize).and_then(Option::as_ref)
    }

    /// Panics on retired or unknown variables: referencing one is a contract violation.
    pub fn var(&self, var: VarId) -> &VarDecl {
        match self.try_var(var) {
            Some(decl) => decl,
            None => panic!("variable {} is not declared", var.0),
        }
    }

    pub fn width(&self, var: VarId) -> u8 {
        self.var(var).width
    }

    pub fn live_vars(&self) -> impl Iterator<Item = (VarId, &VarDecl)> {
        self.vars
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.as_ref().map(|d| (VarId(i as u32), d)))
    }

    pub fn new_jump(&mut self) -> JumpId {
        let id = JumpId(self.next_jump);
        self.next_jump += 1;
        id
    }

    pub fn add_function(&mut self, name: impl Into<String>, body: Vec<Stmt>) {
        self.functions.push(Function {
            name: name.into(),
            body,
        });
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Full-width assignment `dst = op(args)`.
    pub fn assign(&self, dst: VarId, op: Op, args: Vec<Operand>) -> Stmt {
        self.assign_masked(dst, WriteMask::for_width(self.width(dst)), op, args)
    }

    pub fn assign_masked(&self, dst: VarId, mask: WriteMask, op: Op, args: Vec<Operand>) -> Stmt {
        Stmt::Assign(Assign {
            dst: Place::Var(dst),
            mask,
            rhs: Rhs::Op { op, args },
            modifier: OutputModifier::None,
            prior: None,
        })
    }

    pub fn store_element(&self, var: VarId, index: Index, op: Op, args: Vec<Operand>) -> Stmt {
        Stmt::Assign(Assign {
            dst: Place::Element { var, index },
            mask: WriteMask::for_width(self.width(var)),
            rhs: Rhs::Op { op, args },
            modifier: OutputModifier::None,
            prior: None,
        })
    }

    pub fn texture(&self, dst: VarId, op: Op, sampler: u32, coords: Operand) -> Stmt {
        Stmt::Assign(Assign {
            dst: Place::Var(dst),
            mask: WriteMask::for_width(self.width(dst)),
            rhs: Rhs::Texture {
                op,
                sampler,
                coords,
            },
            modifier: OutputModifier::None,
            prior: None,
        })
    }
}

impl Assign {
    pub fn with_modifier(mut self, modifier: OutputModifier) -> Self {
        self.modifier = modifier;
        self
    }
}

impl Stmt {
    /// Sets the output modifier of an assignment; other statements are returned unchanged.
    pub fn with_modifier(self, modifier: OutputModifier) -> Self {
        match self {
            Stmt::Assign(a) => Stmt::Assign(a.with_modifier(modifier)),
            other => other,
        }
    }
}

struct Printer<'a> {
    src: &'a ShaderSource,
}

impl Printer<'_> {
    fn var(&self, f: &mut fmt::Formatter<'_>, v: VarId) -> fmt::Result {
        match self.src.try_var(v) {
            Some(decl) => write!(f, "{}", decl.name),
            None => write!(f, "%{}", v.0),
        }
    }

    fn opt_var(&self, f: &mut fmt::Formatter<'_>, v: Option<VarId>) -> fmt::Result {
        match v {
            Some(v) => self.var(f, v),
            None => write!(f, "-"),
        }
    }

    fn index(&self, f: &mut fmt::Formatter<'_>, index: &Index) -> fmt::Result {
        match index {
            Index::Const(i) => write!(f, "[{i}]"),
            Index::Dynamic(op) => {
                write!(f, "[")?;
                self.operand(f, op)?;
                write!(f, "]")
            }
        }
    }

    fn operand(&self, f: &mut fmt::Formatter<'_>, op: &Operand) -> fmt::Result {
        if op.negate {
            write!(f, "-")?;
        }
        if op.absolute {
            write!(f, "|")?;
        }
        match &op.value {
            Value::Var(v) => self.var(f, *v)?,
            Value::Element { var, index } => {
                self.var(f, *var)?;
                self.index(f, index)?;
            }
            Value::Const(c) => write!(f, "({}, {}, {}, {})", c[0], c[1], c[2], c[3])?,
            Value::Uniform(u) => write!(f, "u{u}")?,
            Value::Varying(v) => write!(f, "v{v}")?,
            Value::FragCoord => write!(f, "frag_coord")?,
            Value::FrontFacing => write!(f, "front_facing")?,
            Value::PointCoord => write!(f, "point_coord")?,
            Value::Undef => write!(f, "undef")?,
        }
        if op.absolute {
            write!(f, "|")?;
        }
        if op.swizzle != Swizzle::IDENTITY {
            write!(f, ".{}", op.swizzle)?;
        }
        Ok(())
    }

    fn jumps(&self, f: &mut fmt::Formatter<'_>, jumps: &[(JumpId, Option<VarId>)]) -> fmt::Result {
        for (jump, v) in jumps {
            write!(f, ", j{}: ", jump.0)?;
            self.opt_var(f, *v)?;
        }
        Ok(())
    }

    fn body(&self, f: &mut fmt::Formatter<'_>, body: &[Stmt], depth: usize) -> fmt::Result {
        for stmt in body {
            self.stmt(f, stmt, depth)?;
        }
        Ok(())
    }

    fn stmt(&self, f: &mut fmt::Formatter<'_>, stmt: &Stmt, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        write!(f, "{pad}")?;
        match stmt {
            Stmt::Assign(a) => {
                match &a.dst {
                    Place::Var(v) => self.var(f, *v)?,
                    Place::Element { var, index } => {
                        self.var(f, *var)?;
                        self.index(f, index)?;
                    }
                }
                write!(f, ".{} = {}{}(", a.mask, a.rhs.op().name(), a.modifier.suffix())?;
                match &a.rhs {
                    Rhs::Op { args, .. } => {
                        for (i, arg) in args.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            self.operand(f, arg)?;
                        }
                    }
                    Rhs::Texture {
                        sampler, coords, ..
                    } => {
                        write!(f, "s{sampler}, ")?;
                        self.operand(f, coords)?;
                    }
                }
                write!(f, ")")?;
                if let Some(prior) = a.prior {
                    write!(f, " prior ")?;
                    self.var(f, prior)?;
                }
                writeln!(f)
            }
            Stmt::If(s) => {
                write!(f, "if {}(", s.cond.cmp.name())?;
                self.operand(f, &s.cond.a)?;
                write!(f, ", ")?;
                self.operand(f, &s.cond.b)?;
                writeln!(f, ") {{")?;
                self.body(f, &s.then_body, depth + 1)?;
                writeln!(f, "{pad}}} else {{")?;
                self.body(f, &s.else_body, depth + 1)?;
                writeln!(f, "{pad}}}")?;
                for phi in &s.phis {
                    write!(f, "{pad}")?;
                    self.var(f, phi.dest)?;
                    write!(f, " = phi(")?;
                    self.opt_var(f, phi.if_true)?;
                    write!(f, ", ")?;
                    self.opt_var(f, phi.if_false)?;
                    writeln!(f, ")")?;
                }
                Ok(())
            }
            Stmt::Loop(l) => {
                writeln!(f, "loop {{")?;
                for phi in &l.begin_phis {
                    write!(f, "{pad}  ")?;
                    self.var(f, phi.dest)?;
                    write!(f, " = phi(enter: ")?;
                    self.opt_var(f, phi.enter)?;
                    write!(f, ", repeat: ")?;
                    self.opt_var(f, phi.repeat)?;
                    self.jumps(f, &phi.continues)?;
                    writeln!(f, ")")?;
                }
                self.body(f, &l.body, depth + 1)?;
                writeln!(f, "{pad}}}")?;
                for phi in &l.end_phis {
                    write!(f, "{pad}")?;
                    self.var(f, phi.dest)?;
                    write!(f, " = phi(")?;
                    self.jumps(f, &phi.breaks)?;
                    writeln!(f, ")")?;
                }
                Ok(())
            }
            Stmt::Break(j) => writeln!(f, "break j{}", j.0),
            Stmt::Continue(j) => writeln!(f, "continue j{}", j.0),
            Stmt::Discard => writeln!(f, "discard"),
            Stmt::Call(call) => {
                write!(f, "call {}(", call.callee)?;
                for (i, arg) in call.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match arg {
                        CallArg::In(op) => self.operand(f, op)?,
                        CallArg::Out(v) => {
                            write!(f, "out ")?;
                            self.var(f, *v)?;
                        }
                        CallArg::InOut(v) => {
                            write!(f, "inout ")?;
                            self.var(f, *v)?;
                        }
                        CallArg::Split { input, output } => {
                            self.operand(f, input)?;
                            write!(f, " -> ")?;
                            self.var(f, *output)?;
                        }
                    }
                }
                writeln!(f, ")")
            }
            Stmt::Output(op) => {
                write!(f, "output ")?;
                self.operand(f, op)?;
                writeln!(f)
            }
        }
    }
}

impl fmt::Display for ShaderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let printer = Printer { src: self };
        for func in &self.functions {
            writeln!(f, "fn {}() {{", func.name)?;
            printer.body(f, &func.body, 1)?;
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

/// Component of an operation's result that lands in destination lane `lane`, for a result of
/// `result_width` lanes. Scalar results broadcast; narrower vector results repeat their last lane.
pub fn result_component(result_width: u8, lane: u8) -> u8 {
    if result_width <= 1 {
        0
    } else {
        lane.min(result_width - 1)
    }
}

impl ShaderSource {
    /// Deepest `if`/`loop` nesting over all functions. Walks with an explicit stack, so it is
    /// safe on inputs the recursive passes would overflow on.
    pub fn max_nesting(&self) -> usize {
        let mut deepest = 0;
        let mut stack: Vec<(&[Stmt], usize)> = self
            .functions
            .iter()
            .map(|f| (f.body.as_slice(), 0))
            .collect();
        while let Some((body, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            for stmt in body {
                match stmt {
                    Stmt::If(s) => {
                        stack.push((&s.then_body, depth + 1));
                        stack.push((&s.else_body, depth + 1));
                    }
                    Stmt::Loop(l) => stack.push((&l.body, depth + 1)),
                    _ => {}
                }
            }
        }
        deepest
    }

    pub fn check_nesting(&self) -> Result<(), CompileError> {
        if self.max_nesting() > MAX_CONTROL_FLOW_NESTING {
            return Err(CompileError::ControlFlowTooDeep {
                max: MAX_CONTROL_FLOW_NESTING,
            });
        }
        Ok(())
    }

    /// Width of the value an operand references before swizzling.
    pub fn operand_width(&self, op: &Operand) -> u8 {
        match &op.value {
            Value::Var(v) | Value::Element { var: v, .. } => self.width(*v),
            Value::FrontFacing => 1,
            Value::PointCoord => 2,
            Value::Const(_) | Value::Uniform(_) | Value::Varying(_) | Value::FragCoord => 4,
            Value::Undef => 4,
        }
    }

    /// Width of the value `rhs` computes when assigned to a `dst_width`-lane destination.
    pub fn result_width(&self, rhs: &Rhs, dst_width: u8) -> u8 {
        use crate::hir::op::ResultWidth;
        match rhs {
            Rhs::Texture { .. } => 4,
            Rhs::Op { op, args } => match op.info().result {
                ResultWidth::Dest => dst_width,
                ResultWidth::Fixed(n) => n,
                ResultWidth::Sources => args.len().clamp(1, 4) as u8,
            },
        }
    }
}
