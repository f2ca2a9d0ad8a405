/// Uthernet II — a WIZnet W5100-based Ethernet card.
///
/// The card exposes four soft switches (Mode, Address High, Address
/// Low, Data) through which software reaches the controller's 32 KiB
/// internal address space, plus fixed identification bytes in the
/// slot ROM window for detection probes.
///
/// There is no wire on the other side. Instead of forwarding frames,
/// the card synthesizes a whole network: TCP and UDP sockets bridge
/// to host BSD sockets, and MACRAW traffic is answered by built-in
/// ARP/DHCP/TCP responders (see `vnet`).
mod arp;
mod dhcp;
mod frame;
mod socket;
mod tcp;
mod vnet;
mod w5100;

use crate::bus::Card;

use w5100::{MR_AI, MR_RST, W5100};

// Soft-switch offsets within $C0n0..$C0nF.
const SW_MODE: i32 = 0x04;
const SW_ADDR_HI: i32 = 0x05;
const SW_ADDR_LO: i32 = 0x06;
const SW_DATA: i32 = 0x07;

pub struct Uthernet2 {
    w5100: W5100,
    slot: u8,
}

impl Uthernet2 {
    pub fn new() -> Self {
        Self {
            w5100: W5100::new(),
            slot: 3,
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
}

impl Default for Uthernet2 {
    fn default() -> Self {
        Self::new()
    }
}

impl Card for Uthernet2 {
    fn init(&mut self) {
        log::debug!("Uthernet II: initializing in slot {}", self.slot);
        self.w5100.reset();
    }

    fn handle(&mut self, _loc: u16, val: i32, ploc: i32, psw: i32) -> u8 {
        if psw < 0 {
            // ROM window: identification bytes for detection probes.
            if ploc >= 0 {
                return match ploc {
                    0x05 => 0x38,
                    0x07 => 0x18,
                    _ => 0x00,
                };
            }
            return 0;
        }

        let w = &mut self.w5100;
        match psw {
            SW_MODE => {
                if val < 0 {
                    return w.mode;
                }
                let val = val as u8;
                if val & MR_RST != 0 {
                    log::info!("Uthernet II: reset via mode register");
                    w.reset();
                    // The reset bit is consumed, never stored.
                    w.mode = val & 0x7F;
                } else {
                    w.mode = val;
                }
                log::debug!("Uthernet II: mode set to {:#04X}", w.mode);
                0
            }
            SW_ADDR_HI => {
                if val < 0 {
                    return (w.addr_ptr >> 8) as u8;
                }
                w.addr_ptr = (w.addr_ptr & 0x00FF) | ((val as u16) << 8);
                0
            }
            SW_ADDR_LO => {
                if val < 0 {
                    return w.addr_ptr as u8;
                }
                w.addr_ptr = (w.addr_ptr & 0xFF00) | val as u16;
                0
            }
            SW_DATA => {
                let result = if val < 0 {
                    let byte = w.read(w.addr_ptr);
                    log::debug!(
                        "Uthernet II: data read [{:#06X}] = {:#04X}",
                        w.addr_ptr,
                        byte
                    );
                    byte
                } else {
                    log::debug!(
                        "Uthernet II: data write [{:#06X}] = {:#04X}",
                        w.addr_ptr,
                        val
                    );
                    w.write(w.addr_ptr, val as u8);
                    0
                };
                // Post-increment wraps within the 32 KiB image.
                if w.mode & MR_AI != 0 {
                    w.addr_ptr = w.addr_ptr.wrapping_add(1) & 0x7FFF;
                }
                result
            }
            _ => 0,
        }
    }
}
