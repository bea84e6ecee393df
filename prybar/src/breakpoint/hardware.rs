//! Debug-register programming.
//!
//! DR7 layout per the x86 architectural definition: two enable bits per
//! slot in the low byte, LE/GE at bits 8-9, general-detect at bit 13, and a
//! `[len:2][rw:2]` nibble per slot from bit 16 up.

use bitfield::bitfield;

/// Number of hardware breakpoint slots.
pub const HARD_SLOTS: usize = 4;

/// What kind of access trips the breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Execute,
    Write,
    ReadWrite,
}

impl Access {
    fn bits(self) -> u64 {
        match self {
            Access::Execute => 0b00,
            Access::Write => 0b01,
            Access::ReadWrite => 0b11,
        }
    }
}

/// Watched width. Execute breakpoints must use `One`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Length {
    One,
    Two,
    Four,
}

impl Length {
    fn bits(self) -> u64 {
        match self {
            Length::One => 0b00,
            Length::Two => 0b01,
            Length::Four => 0b11,
        }
    }

    pub fn from_size(size: usize) -> Option<Self> {
        match size {
            1 => Some(Length::One),
            2 => Some(Length::Two),
            4 => Some(Length::Four),
            _ => None,
        }
    }
}

bitfield! {
    /// The DR7 debug-control register.
    pub struct Dr7(u64);
    impl Debug;

    pub l0, set_l0: 0;
    pub g0, set_g0: 1;
    pub l1, set_l1: 2;
    pub g1, set_g1: 3;
    pub l2, set_l2: 4;
    pub g2, set_g2: 5;
    pub l3, set_l3: 6;
    pub g3, set_g3: 7;
    pub le, set_le: 8;
    pub ge, set_ge: 9;
    pub gd, set_gd: 13;
    pub rw0, set_rw0: 17, 16;
    pub len0, set_len0: 19, 18;
    pub rw1, set_rw1: 21, 20;
    pub len1, set_len1: 23, 22;
    pub rw2, set_rw2: 25, 24;
    pub len2, set_len2: 27, 26;
    pub rw3, set_rw3: 29, 28;
    pub len3, set_len3: 31, 30;
}

impl Dr7 {
    /// Arms one slot: local + global enable, exact-match bits, access kind
    /// and watch length.
    pub fn arm_slot(&mut self, slot: usize, access: Access, length: Length) {
        self.set_le(true);
        self.set_ge(true);
        match slot {
            0 => {
                self.set_l0(true);
                self.set_g0(true);
                self.set_rw0(access.bits());
                self.set_len0(length.bits());
            }
            1 => {
                self.set_l1(true);
                self.set_g1(true);
                self.set_rw1(access.bits());
                self.set_len1(length.bits());
            }
            2 => {
                self.set_l2(true);
                self.set_g2(true);
                self.set_rw2(access.bits());
                self.set_len2(length.bits());
            }
            3 => {
                self.set_l3(true);
                self.set_g3(true);
                self.set_rw3(access.bits());
                self.set_len3(length.bits());
            }
            _ => {}
        }
    }

    /// Disarms one slot and zeroes its condition/size bits.
    pub fn clear_slot(&mut self, slot: usize) {
        match slot {
            0 => {
                self.set_l0(false);
                self.set_g0(false);
                self.set_rw0(0);
                self.set_len0(0);
            }
            1 => {
                self.set_l1(false);
                self.set_g1(false);
                self.set_rw1(0);
                self.set_len1(0);
            }
            2 => {
                self.set_l2(false);
                self.set_g2(false);
                self.set_rw2(0);
                self.set_len2(0);
            }
            3 => {
                self.set_l3(false);
                self.set_g3(false);
                self.set_rw3(0);
                self.set_len3(0);
            }
            _ => {}
        }
    }

    pub fn slot_enabled(&self, slot: usize) -> bool {
        match slot {
            0 => self.l0() || self.g0(),
            1 => self.l1() || self.g1(),
            2 => self.l2() || self.g2(),
            3 => self.l3() || self.g3(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_slot0_write_len4() {
        let mut dr7 = Dr7(0);
        dr7.arm_slot(0, Access::Write, Length::Four);

        // L0 + G0.
        assert_eq!(dr7.0 & 0b11, 0b11);
        // Exact-match bits.
        assert_eq!((dr7.0 >> 8) & 0b11, 0b11);
        // RW0 = write (0b01), LEN0 = four bytes (0b11).
        assert_eq!((dr7.0 >> 16) & 0b11, 0b01);
        assert_eq!((dr7.0 >> 18) & 0b11, 0b11);
    }

    #[test]
    fn test_arm_slot3_exec() {
        let mut dr7 = Dr7(0);
        dr7.arm_slot(3, Access::Execute, Length::One);

        assert_eq!((dr7.0 >> 6) & 0b11, 0b11);
        assert_eq!((dr7.0 >> 28) & 0b1111, 0b0000);
        assert!(dr7.slot_enabled(3));
        assert!(!dr7.slot_enabled(0));
    }

    #[test]
    fn test_clear_slot_zeroes_its_bits() {
        let mut dr7 = Dr7(0);
        dr7.arm_slot(1, Access::ReadWrite, Length::Two);
        dr7.arm_slot(2, Access::Write, Length::Four);

        dr7.clear_slot(1);
        assert!(!dr7.slot_enabled(1));
        assert_eq!((dr7.0 >> 20) & 0b1111, 0);
        // Slot 2 is untouched.
        assert!(dr7.slot_enabled(2));
        assert_eq!((dr7.0 >> 24) & 0b11, 0b01);
    }
}
