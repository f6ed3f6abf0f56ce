//! GridEYE register map (Panasonic AMG88xx datasheet).
//!
//! Only the registers this driver touches are listed. Pixel data starts
//! at 0x80, two bytes per pixel, low byte first.

/// Register addresses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Register {
    /// Operating mode (PCTL).
    PowerControl = 0x00,
    /// Software reset (RST).
    Reset = 0x01,
    /// Frame rate (FPSC).
    FrameRate = 0x02,
    /// Overflow and interrupt flags (STAT).
    Status = 0x04,
    /// Writing ones clears the matching STAT flags (SCLR).
    StatusClear = 0x05,
    /// Low byte of pixel 0 (T01L).
    Pixel0 = 0x80,
}

impl From<Register> for u8 {
    fn from(register: Register) -> u8 {
        register as u8
    }
}

/// Values accepted by [`Register::Reset`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ResetKind {
    /// Clears the status flags and interrupt table.
    FlagReset = 0x30,
    /// Flag reset plus reload of the adjustment values from flash.
    InitialReset = 0x3f,
}

impl From<ResetKind> for u8 {
    fn from(kind: ResetKind) -> u8 {
        kind as u8
    }
}

/// Values accepted by [`Register::PowerControl`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum PowerMode {
    #[default]
    Normal = 0x00,
    Sleep = 0x10,
    /// Standby, one frame every 60 s.
    Standby60 = 0x20,
    /// Standby, one frame every 10 s.
    Standby10 = 0x21,
}

impl From<PowerMode> for u8 {
    fn from(mode: PowerMode) -> u8 {
        mode as u8
    }
}
