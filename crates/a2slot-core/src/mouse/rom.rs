/// AppleMouse firmware ROM: 2 KiB, banked into the 256-byte slot
/// ROM window as eight pages.
///
/// A real ROM image is picked up from `A2SLOT_MOUSE_ROM` or a couple
/// of conventional paths. Absence is not an error: a minimal ROM
/// carrying the card signature and RTS stubs at the published entry
/// points is synthesized instead, which is enough for identification
/// and for software that tolerates a no-op mouse firmware.
use std::io;
use std::path::{Path, PathBuf};

pub const ROM_SIZE: usize = 2048;
pub const ROM_PAGE_SIZE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum RomError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("ROM size mismatch (expected 2048 bytes, got {0})")]
    WrongSize(usize),
}

pub struct MouseRom {
    data: [u8; ROM_SIZE],
}

impl MouseRom {
    /// Probe the candidate paths, falling back to the minimal ROM.
    pub fn load() -> Self {
        let mut paths: Vec<PathBuf> = Vec::new();
        if let Ok(path) = std::env::var("A2SLOT_MOUSE_ROM") {
            paths.push(path.into());
        }
        paths.push("roms/cards/mouse.rom".into());
        paths.push("../roms/cards/mouse.rom".into());

        for path in &paths {
            match Self::from_file(path) {
                Ok(rom) => {
                    log::info!("Mouse: loaded ROM from {}", path.display());
                    return rom;
                }
                Err(RomError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("Mouse: ignoring {}: {}", path.display(), err),
            }
        }

        log::warn!("Mouse: no ROM file found, using minimal firmware");
        Self::minimal()
    }

    pub fn from_file(path: &Path) -> Result<Self, RomError> {
        let bytes = std::fs::read(path)?;
        if bytes.len() != ROM_SIZE {
            return Err(RomError::WrongSize(bytes.len()));
        }
        let mut data = [0u8; ROM_SIZE];
        data.copy_from_slice(&bytes);
        Ok(Self { data })
    }

    /// Synthesized firmware: signature bytes plus RTS at the entry
    /// points.
    pub fn minimal() -> Self {
        let mut data = [0u8; ROM_SIZE];

        data[0x05] = 0x38;
        data[0x07] = 0x18;
        data[0x0B] = 0x01;
        data[0x0C] = 0x20;
        data[0xFB] = 0xD6;

        // SETMOUSE, SERVEMOUSE, READMOUSE, POSMOUSE, CLAMPMOUSE,
        // CLEARMOUSE, INITMOUSE, TIMEDATA
        for entry in [0x12, 0x13, 0x14, 0x16, 0x17, 0x18, 0x19, 0x1C] {
            data[entry] = 0x60; // RTS
        }

        Self { data }
    }

    /// Read one byte of the given 256-byte page.
    pub fn read(&self, page: u8, offset: usize) -> u8 {
        let index = (page as usize) * ROM_PAGE_SIZE + offset;
        if index < ROM_SIZE {
            self.data[index]
        } else {
            0
        }
    }
}
