use std::str::FromStr;

use bitflags::bitflags;
use strum::EnumString;

use super::command::{EosMode, ReadTerminator};
use crate::{GpibError, GpibResult};

bitflags! {
    /// How to talk to one instrument.
    ///
    /// The low byte is not a single flag: it holds the status-byte bits that
    /// signal "data ready" (0x10, the IEEE-488.2 MAV bit, by default; older
    /// instruments often use 0x01).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceFlags: u32 {
        const READY_MASK = 0x00ff;
        const READ_EOI = 0x0100;
        const READ_LF = 0x0200;
        const READ_CR = 0x0400;
        const TERM_EOI = 0x0800;
        const TERM_LF = 0x1000;
        const TERM_CR = 0x2000;
        /// The ready bit stays set after a read; do not trust it to end a
        /// buffered read.
        const STICKY_READY = 0x4000;
        const HAS_SPOLL = 0x8000;

        // Set by the controller, never by a device declaration.
        const AUTO_READ = 0x01_0000;
        const BINARY = 0x02_0000;
        const NO_TERMINATOR = 0x04_0000;
    }
}

/// Status bit an IEEE-488.2 instrument raises when output is queued.
pub const STATUS_MESSAGE_AVAILABLE: u8 = 0x10;

impl DeviceFlags {
    pub const DEFAULT: Self = Self::from_bits_retain(STATUS_MESSAGE_AVAILABLE as u32)
        .union(Self::READ_EOI)
        .union(Self::TERM_EOI)
        .union(Self::TERM_LF)
        .union(Self::TERM_CR)
        .union(Self::HAS_SPOLL);

    pub const INTERNAL: Self = Self::AUTO_READ
        .union(Self::BINARY)
        .union(Self::NO_TERMINATOR);

    /// Drop the controller-internal bits.
    pub fn user_settable(self) -> Self {
        self.difference(Self::INTERNAL)
    }

    /// Only the per-call bits a caller may pass to `send`.
    pub fn transient(self) -> Self {
        self.intersection(Self::INTERNAL)
    }

    pub fn ready_mask(self) -> u8 {
        (self.bits() & Self::READY_MASK.bits()) as u8
    }

    pub fn with_ready_mask(self, mask: u8) -> Self {
        self.difference(Self::READY_MASK)
            .union(Self::from_bits_retain(mask as u32))
    }

    pub fn read_terminator(self) -> ReadTerminator {
        if self.contains(Self::READ_EOI) {
            ReadTerminator::Eoi
        } else if self.contains(Self::READ_LF) {
            ReadTerminator::Char(b'\n')
        } else if self.contains(Self::READ_CR) {
            ReadTerminator::Char(b'\r')
        } else {
            ReadTerminator::Timeout
        }
    }

    pub fn eos_mode(self) -> EosMode {
        EosMode::from_terminators(self.contains(Self::TERM_CR), self.contains(Self::TERM_LF))
    }

    /// Build flags from option words applied on top of [`DeviceFlags::DEFAULT`].
    ///
    /// `stb_bit` consumes the following word as the new ready mask.
    pub fn from_options<I, S>(words: I) -> GpibResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut flags = Self::DEFAULT;
        let mut words = words.into_iter();
        while let Some(word) = words.next() {
            let word = word.as_ref();
            let option = DeviceOption::from_str(word)
                .map_err(|_| GpibError::UnknownOption(word.to_string()))?;
            flags = match option {
                DeviceOption::StbBit => {
                    let value = words
                        .next()
                        .ok_or_else(|| GpibError::UnknownOption("stb_bit".to_string()))?;
                    let value = value.as_ref();
                    let mask = value
                        .parse::<u8>()
                        .map_err(|_| GpibError::UnknownOption(format!("stb_bit {value}")))?;
                    flags.with_ready_mask(mask)
                }
                other => other.apply(flags),
            };
        }
        Ok(flags)
    }
}

impl Default for DeviceFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Words accepted in a device's option list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DeviceOption {
    NoReadStb,
    NoStb,
    NoReadEoi,
    NoTermEoi,
    NoEoi,
    NoTerm,
    ReadCr,
    ReadLf,
    NoTermLf,
    NoTermCr,
    NoSpoll,
    StbRdy,
    StbBit,
}

impl DeviceOption {
    fn apply(self, flags: DeviceFlags) -> DeviceFlags {
        match self {
            DeviceOption::NoReadStb | DeviceOption::NoStb => {
                flags.difference(DeviceFlags::READY_MASK)
            }
            DeviceOption::NoReadEoi => flags.difference(DeviceFlags::READ_EOI),
            DeviceOption::NoTermEoi => flags.difference(DeviceFlags::TERM_EOI),
            DeviceOption::NoEoi => flags.difference(DeviceFlags::TERM_EOI | DeviceFlags::READ_EOI),
            DeviceOption::NoTerm => flags
                .difference(DeviceFlags::TERM_EOI | DeviceFlags::TERM_LF | DeviceFlags::TERM_CR),
            DeviceOption::ReadCr => flags
                .difference(DeviceFlags::READ_EOI)
                .union(DeviceFlags::READ_CR),
            DeviceOption::ReadLf => flags
                .difference(DeviceFlags::READ_EOI)
                .union(DeviceFlags::READ_LF),
            DeviceOption::NoTermLf => flags.difference(DeviceFlags::TERM_LF),
            DeviceOption::NoTermCr => flags.difference(DeviceFlags::TERM_CR),
            DeviceOption::NoSpoll => flags.difference(DeviceFlags::HAS_SPOLL),
            DeviceOption::StbRdy => flags.union(DeviceFlags::STICKY_READY),
            // Needs its argument; handled by the caller.
            DeviceOption::StbBit => flags,
        }
    }
}
