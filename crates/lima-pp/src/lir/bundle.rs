//! Bundle model: one instruction word with a slot per functional unit, two embedded constant
//! vectors, and the sync/stop control bits.
//!
//! Units run in slot order within a bundle. Registers are read when the bundle starts and written
//! when it ends; the uniform, texture and constant pipeline registers carry values forward to
//! later slots of the same bundle only.

use bitflags::bitflags;

use crate::limits::MAX_BUNDLE_CONSTANTS;
use crate::types::Swizzle;

use super::{LirInstr, LirValue, PipelineReg, Unit};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SlotSet: u16 {
        const VARYING = 1 << 0;
        const TEXTURE = 1 << 1;
        const UNIFORM = 1 << 2;
        const VMUL = 1 << 3;
        const SMUL = 1 << 4;
        const VADD = 1 << 5;
        const SADD = 1 << 6;
        const COMBINE = 1 << 7;
        const STORE = 1 << 8;
        const BRANCH = 1 << 9;
    }
}

/// Functional unit slots in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Varying,
    Texture,
    Uniform,
    VMul,
    SMul,
    VAdd,
    SAdd,
    Combine,
    Store,
    Branch,
}

impl Slot {
    pub const ALL: [Slot; 10] = [
        Slot::Varying,
        Slot::Texture,
        Slot::Uniform,
        Slot::VMul,
        Slot::SMul,
        Slot::VAdd,
        Slot::SAdd,
        Slot::Combine,
        Slot::Store,
        Slot::Branch,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn flag(self) -> SlotSet {
        SlotSet::from_bits_truncate(1 << self.index())
    }

    pub fn name(self) -> &'static str {
        match self {
            Slot::Varying => "varying",
            Slot::Texture => "texture",
            Slot::Uniform => "uniform",
            Slot::VMul => "vmul",
            Slot::SMul => "smul",
            Slot::VAdd => "vadd",
            Slot::SAdd => "sadd",
            Slot::Combine => "combine",
            Slot::Store => "store",
            Slot::Branch => "branch",
        }
    }

    /// Scalar units write a single lane.
    pub fn is_scalar(self) -> bool {
        matches!(self, Slot::SMul | Slot::SAdd)
    }
}

/// Slots that can execute `instr`, in order of preference.
pub fn candidate_slots(instr: &LirInstr) -> &'static [Slot] {
    let scalar = instr.dst.map_or(true, |d| d.mask.count() <= 1);
    match (instr.op.unit(), scalar) {
        (Unit::Alu, true) => &[Slot::SAdd, Slot::SMul, Slot::VAdd, Slot::VMul],
        (Unit::Alu, false) => &[Slot::VAdd, Slot::VMul],
        (Unit::Add, true) => &[Slot::SAdd, Slot::VAdd],
        (Unit::Add, false) => &[Slot::VAdd],
        (Unit::Mul, true) => &[Slot::SMul, Slot::VMul],
        (Unit::Mul, false) => &[Slot::VMul],
        (Unit::VectorAdd, _) => &[Slot::VAdd],
        (Unit::Combine, _) => &[Slot::Combine],
        (Unit::Varying, _) => &[Slot::Varying],
        (Unit::Texture, _) => &[Slot::Texture],
        (Unit::Uniform, _) => &[Slot::Uniform],
        (Unit::Store, _) => &[Slot::Store],
        (Unit::Branch, _) => &[Slot::Branch],
    }
}

/// Slot an instruction writing pipeline register `reg` occupies.
pub fn producer_slot(reg: PipelineReg) -> Option<Slot> {
    match reg {
        PipelineReg::Uniform => Some(Slot::Uniform),
        PipelineReg::Texture => Some(Slot::Texture),
        PipelineReg::Const0 | PipelineReg::Const1 => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bundle {
    slots: [Option<LirInstr>; 10],
    consts: [Vec<f32>; MAX_BUNDLE_CONSTANTS],
    reserved: SlotSet,
    /// Wait for an outstanding texture fetch before the bundle executes.
    pub sync: bool,
    /// The shader ends after this bundle.
    pub stop: bool,
}

/// Places the constant components `src` reads into the bundle constants; returns the pipeline
/// register and swizzle to read them through.
fn pack_constant(
    consts: &mut [Vec<f32>; MAX_BUNDLE_CONSTANTS],
    value: [f32; 4],
    swizzle: Swizzle,
    positions: u8,
) -> Option<(PipelineReg, Swizzle)> {
    'slots: for (k, slot) in consts.iter_mut().enumerate() {
        let mut candidate = slot.clone();
        let mut out = Swizzle::IDENTITY;
        for p in (0..4u8).filter(|p| positions & (1 << p) != 0) {
            let v = value[(swizzle.component(p) & 3) as usize];
            let at = match candidate.iter().position(|c| c.to_bits() == v.to_bits()) {
                Some(at) => at,
                None => {
                    if candidate.len() == 4 {
                        continue 'slots;
                    }
                    candidate.push(v);
                    candidate.len() - 1
                }
            };
            out.0[p as usize] = at as u8;
        }
        *slot = candidate;
        let reg = if k == 0 {
            PipelineReg::Const0
        } else {
            PipelineReg::Const1
        };
        // Unread positions repeat a read one so the swizzle stays in range.
        let first = (0..4u8)
            .find(|p| positions & (1 << p) != 0)
            .map_or(0, |p| out.0[p as usize]);
        for p in (0..4u8).filter(|p| positions & (1 << p) == 0) {
            out.0[p as usize] = first;
        }
        return Some((reg, out));
    }
    None
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instr(&self, slot: Slot) -> Option<&LirInstr> {
        self.slots[slot.index()].as_ref()
    }

    /// Instructions in execution order with their slots.
    pub fn slotted(&self) -> impl Iterator<Item = (Slot, &LirInstr)> {
        Slot::ALL
            .iter()
            .filter_map(move |&s| self.instr(s).map(|i| (s, i)))
    }

    pub fn instrs(&self) -> impl Iterator<Item = &LirInstr> {
        self.slots.iter().flatten()
    }

    pub fn occupied(&self) -> SlotSet {
        Slot::ALL
            .iter()
            .filter(|s| self.slots[s.index()].is_some())
            .fold(SlotSet::empty(), |set, s| set | s.flag())
    }

    pub fn consts(&self) -> &[Vec<f32>; MAX_BUNDLE_CONSTANTS] {
        &self.consts
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn has_vector_combine(&self) -> bool {
        self.instr(Slot::Combine)
            .is_some_and(|i| i.op.is_vector_combine())
    }

    fn slot_usable(&self, slot: Slot, instr: &LirInstr, claim: bool) -> bool {
        if self.slots[slot.index()].is_some() {
            return false;
        }
        if self.reserved.contains(slot.flag()) && !claim {
            return false;
        }
        let blocked = SlotSet::SMUL & (self.occupied() | self.reserved);
        match slot {
            Slot::SMul => !self.has_vector_combine(),
            Slot::Combine if instr.op.is_vector_combine() => blocked.is_empty(),
            _ => true,
        }
    }

    /// Tries to place `instr` into a free slot, moving its constant operands into the bundle
    /// constants. `claim` allows taking a slot reserved for a pipeline producer; `needs` lists
    /// slots that must still be free and are reserved on success.
    pub fn try_insert(&mut self, instr: &LirInstr, claim: bool, needs: SlotSet) -> Option<Slot> {
        let taken = self.occupied() | self.reserved;
        if taken.intersects(needs) {
            return None;
        }
        let slot = candidate_slots(instr)
            .iter()
            .copied()
            .find(|&s| !needs.contains(s.flag()) && self.slot_usable(s, instr, claim))?;

        let mut consts = self.consts.clone();
        let mut placed = instr.clone();
        for k in 0..placed.srcs.len() {
            if let LirValue::Const(value) = placed.srcs[k].value {
                let positions = placed.read_positions(k);
                let (reg, swizzle) =
                    pack_constant(&mut consts, value, placed.srcs[k].swizzle, positions)?;
                placed.srcs[k].value = LirValue::Pipeline(reg);
                placed.srcs[k].swizzle = swizzle;
            }
        }

        self.consts = consts;
        if instr.op.is_texture() {
            self.sync = true;
        }
        self.reserved.remove(slot.flag());
        self.reserved |= needs;
        self.slots[slot.index()] = Some(placed);
        Some(slot)
    }

    /// Checks the structural rules every emitted bundle must satisfy.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.has_vector_combine() && self.instr(Slot::SMul).is_some() {
            return Err("vector combine shares a bundle with the scalar multiplier");
        }
        if self.consts.iter().any(|c| c.len() > 4) {
            return Err("more than four constant lanes in one vector");
        }
        for (slot, instr) in self.slotted() {
            if !candidate_slots(instr).contains(&slot) {
                return Err("instruction placed on a unit that cannot execute it");
            }
            if slot.is_scalar() && instr.dst.is_some_and(|d| d.mask.count() > 1) {
                return Err("scalar unit writes more than one lane");
            }
            for (k, src) in instr.srcs.iter().enumerate() {
                let lanes = instr.read_lanes(k);
                match src.value {
                    LirValue::Const(_) => return Err("constant operand outside the bundle constants"),
                    LirValue::Pipeline(PipelineReg::Const0) => {
                        if lanes >> self.consts[0].len() != 0 {
                            return Err("read past the first bundle constant");
                        }
                    }
                    LirValue::Pipeline(PipelineReg::Const1) => {
                        if lanes >> self.consts[1].len() != 0 {
                            return Err("read past the second bundle constant");
                        }
                    }
                    LirValue::Pipeline(reg) => {
                        let producer = producer_slot(reg).and_then(|s| self.instr(s));
                        let writes = producer.is_some_and(|p| {
                            p.dst.is_some_and(|d| d.value == LirValue::Pipeline(reg))
                        });
                        if !writes {
                            return Err("pipeline register read without its producer");
                        }
                    }
                    LirValue::Reg(_) | LirValue::Phys(_) => {}
                }
            }
            if instr.op.is_texture() && !self.sync {
                return Err("texture fetch without sync");
            }
        }
        Ok(())
    }

    pub fn flags_suffix(&self) -> String {
        let mut s = String::new();
        if self.sync {
            s.push_str(" sync");
        }
        if self.stop {
            s.push_str(" stop");
        }
        for (k, c) in self.consts.iter().enumerate() {
            if !c.is_empty() {
                s.push_str(&format!(" const{k}={c:?}"));
            }
        }
        s
    }
}
