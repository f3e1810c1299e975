use core::fmt;

use super::op::Op;
use super::{BlockEnd, Cmd, CmdId, Program, Src, Value};
use crate::types::Swizzle;

fn write_vec(f: &mut fmt::Formatter<'_>, v: [f32; 4]) -> fmt::Result {
    if v.iter().all(|&x| x == v[0]) {
        return write!(f, "{}", v[0]);
    }
    write!(f, "({}, {}, {}, {})", v[0], v[1], v[2], v[3])
}

impl fmt::Display for Src {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            f.write_str("-")?;
        }
        if self.absolute {
            f.write_str("|")?;
        }
        match self.value {
            Value::Cmd(c) => write!(f, "%{}", c.0)?,
            Value::Const(v) => write_vec(f, v)?,
        }
        if self.absolute {
            f.write_str("|")?;
        }
        if self.swizzle != Swizzle::IDENTITY {
            write!(f, ".{}", self.swizzle)?;
        }
        Ok(())
    }
}

struct CmdLine<'a>(CmdId, &'a Cmd);

impl fmt::Display for CmdLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let CmdLine(id, cmd) = *self;
        if cmd.op.info().has_dest {
            write!(f, "%{} = ", id.0)?;
        }
        write!(f, "{}{}.{}", cmd.op.name(), cmd.dst.modifier.suffix(), cmd.dst.width)?;
        if matches!(
            cmd.op,
            Op::LoadUniform
                | Op::LoadVarying
                | Op::LoadTemp
                | Op::StoreTemp
                | Op::Texld2d
                | Op::Texld2dProj
                | Op::TexldCube
        ) {
            write!(f, " [{}]", cmd.index)?;
        }
        for (i, src) in cmd.srcs().iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            write!(f, "{src}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.layout() {
            let block = self.block(b);
            write!(f, "block {}", b.0)?;
            if !block.preds().is_empty() {
                f.write_str(" <-")?;
                for p in block.preds() {
                    write!(f, " {}", p.0)?;
                }
            }
            f.write_str(":\n")?;
            for c in self.block_cmds(b) {
                writeln!(f, "  {}", CmdLine(c, self.cmd(c)))?;
            }
            match block.end() {
                BlockEnd::Jump(t) => writeln!(f, "  jump {}", t.0)?,
                BlockEnd::Branch {
                    cond,
                    srcs,
                    taken,
                    not_taken,
                } => writeln!(
                    f,
                    "  branch.{} {}, {} -> {}, {}",
                    cond.name(),
                    srcs[0],
                    srcs[1],
                    taken.0,
                    not_taken.0
                )?,
                BlockEnd::Output(src) => writeln!(f, "  output {src}")?,
                BlockEnd::Discard => writeln!(f, "  discard")?,
            }
        }
        Ok(())
    }
}
