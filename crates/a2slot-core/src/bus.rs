/// Slot peripheral bus contract.
///
/// The CPU emulator's dispatcher routes two address windows to a card
/// in slot `n`: the sixteen soft switches at `$C0n0..$C0nF` and the
/// 256-byte ROM window at `$Cn00..$CnFF`. Every routed access is
/// delivered to the card's handler as four integers:
///
///   `loc`  — absolute CPU address
///   `val`  — −1 for a read, 0..=255 for a write
///   `ploc` — offset within the ROM window, or −1
///   `psw`  — soft-switch number 0..=15, or −1
///
/// Exactly one of `ploc`/`psw` is non-negative. The return value is
/// the byte driven onto the bus on reads; it is ignored on writes.

/// A slot peripheral card.
pub trait Card {
    /// Called once before emulation starts.
    fn init(&mut self);

    /// Called for every bus access routed to the card.
    fn handle(&mut self, loc: u16, val: i32, ploc: i32, psw: i32) -> u8;
}

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("slot {0} out of range (valid slots are 1..=7)")]
    OutOfRange(u8),
}

/// Routes absolute CPU addresses to a card's handler, computing the
/// `ploc`/`psw` values the way the emulator's dispatcher does. Tests
/// and the probe binary use this to drive a card exactly as Apple II
/// software would.
pub struct Slot<C: Card> {
    slot: u8,
    pub card: C,
}

impl<C: Card> Slot<C> {
    pub fn new(slot: u8, mut card: C) -> Result<Self, SlotError> {
        if !(1..=7).contains(&slot) {
            return Err(SlotError::OutOfRange(slot));
        }
        card.init();
        Ok(Self { slot, card })
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Base of the card's soft-switch window (`$C080 + slot * 0x10`).
    pub fn switch_base(&self) -> u16 {
        0xC080 + (self.slot as u16) * 0x10
    }

    /// Base of the card's ROM window (`$Cn00`).
    pub fn rom_base(&self) -> u16 {
        0xC000 + (self.slot as u16) * 0x100
    }

    /// Deliver an access at absolute address `loc`. `val` is −1 for a
    /// read, 0..=255 for a write. Addresses outside both card windows
    /// read as 0.
    pub fn access(&mut self, loc: u16, val: i32) -> u8 {
        let sw = self.switch_base();
        if (sw..sw + 0x10).contains(&loc) {
            let psw = (loc - sw) as i32;
            return self.card.handle(loc, val, -1, psw);
        }
        let rom = self.rom_base();
        if (rom..=rom + 0xFF).contains(&loc) {
            let ploc = (loc - rom) as i32;
            return self.card.handle(loc, val, ploc, -1);
        }
        0
    }

    pub fn read(&mut self, loc: u16) -> u8 {
        self.access(loc, -1)
    }

    pub fn write(&mut self, loc: u16, val: u8) {
        self.access(loc, val as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the ploc/psw values the router computes.
    struct Probe {
        last: Option<(u16, i32, i32, i32)>,
    }

    impl Card for Probe {
        fn init(&mut self) {}
        fn handle(&mut self, loc: u16, val: i32, ploc: i32, psw: i32) -> u8 {
            self.last = Some((loc, val, ploc, psw));
            0xA5
        }
    }

    #[test]
    fn routes_soft_switches_and_rom_window() {
        let mut slot = Slot::new(3, Probe { last: None }).unwrap();

        assert_eq!(slot.read(0xC0B4), 0xA5);
        assert_eq!(slot.card.last, Some((0xC0B4, -1, -1, 4)));

        slot.write(0xC0BF, 0x12);
        assert_eq!(slot.card.last, Some((0xC0BF, 0x12, -1, 15)));

        assert_eq!(slot.read(0xC305), 0xA5);
        assert_eq!(slot.card.last, Some((0xC305, -1, 5, -1)));

        slot.card.last = None;
        assert_eq!(slot.read(0xC405), 0, "address in another slot's window");
        assert_eq!(slot.card.last, None);
    }

    #[test]
    fn rejects_out_of_range_slots() {
        assert!(Slot::new(0, Probe { last: None }).is_err());
        assert!(Slot::new(8, Probe { last: None }).is_err());
    }

    #[test]
    fn window_bases_follow_slot_number() {
        let slot = Slot::new(5, Probe { last: None }).unwrap();
        assert_eq!(slot.switch_base(), 0xC0D0);
        assert_eq!(slot.rom_base(), 0xC500);
    }
}
