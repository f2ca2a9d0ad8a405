/// AppleMouse card: a 6821 PIA plus 2 KiB of banked firmware ROM.
///
/// The PIA's port B selects which 256-byte ROM page appears in the
/// slot ROM window; port A carries a synthetic quadrature/button
/// byte standing in for the card's 68705 MCU. Motion arrives from
/// the outside through `set_position`, accumulates as deltas, and is
/// drained one tick per port-A read.
mod pia;
mod rom;

use crate::bus::Card;

use pia::{Pia, PIA_ORA};
pub use rom::{MouseRom, RomError};

pub struct MouseCard {
    pia: Pia,
    rom: MouseRom,
    x: u16,
    y: u16,
    button: bool,
    delta_x: i32,
    delta_y: i32,
    /// Quadrature phase bits, flipped once per consumed tick.
    x_phase: bool,
    y_phase: bool,
    slot: u8,
}

impl MouseCard {
    pub fn new() -> Self {
        Self {
            pia: Pia::default(),
            rom: MouseRom::minimal(),
            x: 512,
            y: 512,
            button: false,
            delta_x: 0,
            delta_y: 0,
            x_phase: false,
            y_phase: false,
            slot: 4,
        }
    }

    pub fn set_slot(&mut self, slot: u8) {
        if (1..=7).contains(&slot) {
            self.slot = slot;
        }
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Move the mouse. The difference from the previous position
    /// accumulates as quadrature ticks for the firmware to consume.
    pub fn set_position(&mut self, x: u16, y: u16) {
        self.delta_x += x as i32 - self.x as i32;
        self.delta_y += y as i32 - self.y as i32;
        self.x = x;
        self.y = y;
        log::debug!("Mouse: position set to ({}, {})", x, y);
    }

    pub fn set_button(&mut self, pressed: bool) {
        self.button = pressed;
        log::debug!(
            "Mouse: button {}",
            if pressed { "pressed" } else { "released" }
        );
    }

    pub fn state(&self) -> (u16, u16, bool) {
        (self.x, self.y, self.button)
    }

    /// Port-A byte: movement ticks and directions, button on bit 7
    /// (active low). Each read consumes one unit of ΔX and ΔY; the
    /// tick bits alternate phase per consumed unit.
    fn quadrature_byte(&mut self) -> u8 {
        let mut val = 0u8;

        if self.delta_x != 0 {
            self.x_phase = !self.x_phase;
            if self.x_phase {
                val |= 0x01;
            }
            if self.delta_x > 0 {
                val |= 0x02; // moving right
                self.delta_x -= 1;
            } else {
                self.delta_x += 1;
            }
            if self.delta_x == 0 {
                self.x_phase = false;
            }
        }

        if self.delta_y != 0 {
            self.y_phase = !self.y_phase;
            if self.y_phase {
                val |= 0x08;
            }
            if self.delta_y > 0 {
                val |= 0x04; // moving down
                self.delta_y -= 1;
            } else {
                self.delta_y += 1;
            }
            if self.delta_y == 0 {
                self.y_phase = false;
            }
        }

        if !self.button {
            val |= 0x80;
        }

        val
    }
}

impl Default for MouseCard {
    fn default() -> Self {
        Self::new()
    }
}

impl Card for MouseCard {
    fn init(&mut self) {
        log::info!("Mouse: initializing AppleMouse in slot {}", self.slot);
        self.pia = Pia::default();
        self.x = 512;
        self.y = 512;
        self.button = false;
        self.delta_x = 0;
        self.delta_y = 0;
        self.x_phase = false;
        self.y_phase = false;
        self.rom = MouseRom::load();
    }

    fn handle(&mut self, _loc: u16, val: i32, ploc: i32, psw: i32) -> u8 {
        // ROM window, banked by the PIA's port B.
        if psw < 0 && ploc >= 0 {
            return self.rom.read(self.pia.rom_page(), ploc as usize);
        }

        if (0..4).contains(&psw) {
            let reg = psw as u8;
            if val < 0 {
                // A gated ORA read is the one access that consumes
                // mouse state.
                if reg == PIA_ORA && self.pia.port_a_selected() {
                    let byte = self.quadrature_byte();
                    return self.pia.read(reg, byte);
                }
                return self.pia.read(reg, 0);
            }
            self.pia.write(reg, val as u8);
            return 0;
        }

        0
    }
}
