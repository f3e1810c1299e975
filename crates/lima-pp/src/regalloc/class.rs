//! Register classes of a vec4 register file with lane-granular placement.
//!
//! A virtual register of width `w` occupies `w` consecutive lanes of one physical register.
//! Aligned registers must start at lane 0. Colourability follows Runeson and Nyström: `p(C)` is
//! the number of placements of class `C`, and `q(B, C)` is the largest number of `C` placements
//! a single `B` register can block.

use core::ops::RangeInclusive;

use crate::limits::REGISTER_LANES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegClass {
    pub width: u8,
    pub aligned: bool,
}

impl RegClass {
    pub const COUNT: usize = 7;

    pub fn new(width: u8, aligned: bool) -> Self {
        debug_assert!((1..=REGISTER_LANES).contains(&width));
        Self {
            width,
            // A full-width register has a single placement either way.
            aligned: aligned && width < REGISTER_LANES,
        }
    }

    /// Dense index: unaligned widths 1-4 first, then aligned widths 1-3.
    pub fn index(self) -> usize {
        let w = (self.width - 1) as usize;
        if self.aligned {
            4 + w
        } else {
            w
        }
    }

    pub fn all() -> impl Iterator<Item = RegClass> {
        (1..=REGISTER_LANES)
            .map(|w| RegClass::new(w, false))
            .chain((1..REGISTER_LANES).map(|w| RegClass::new(w, true)))
    }

    /// First lanes the register may start at.
    pub fn offsets(self) -> RangeInclusive<u8> {
        if self.aligned {
            0..=0
        } else {
            0..=REGISTER_LANES - self.width
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTables {
    p: [u32; RegClass::COUNT],
    q: [[u32; RegClass::COUNT]; RegClass::COUNT],
}

fn overlaps(a: u8, wa: u8, b: u8, wb: u8) -> bool {
    a < b + wb && b < a + wa
}

impl ClassTables {
    pub fn new(num_regs: u8) -> Self {
        let mut p = [0; RegClass::COUNT];
        let mut q = [[0; RegClass::COUNT]; RegClass::COUNT];
        for c in RegClass::all() {
            p[c.index()] = u32::from(num_regs) * c.offsets().count() as u32;
            for b in RegClass::all() {
                q[b.index()][c.index()] = b
                    .offsets()
                    .map(|ob| {
                        c.offsets()
                            .filter(|&oc| overlaps(ob, b.width, oc, c.width))
                            .count() as u32
                    })
                    .max()
                    .unwrap_or(0);
            }
        }
        Self { p, q }
    }

    pub fn p(&self, c: RegClass) -> u32 {
        self.p[c.index()]
    }

    /// Placements of class `c` one neighbour of class `b` can block.
    pub fn q(&self, b: RegClass, c: RegClass) -> u32 {
        self.q[b.index()][c.index()]
    }
}
