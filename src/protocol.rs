//! Wire constants and command identifiers (AN3155)

use core::convert::TryFrom;

/// Handshake byte, also used by hosts to resynchronise
pub const UART_INIT: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Value of an erased flash cell, used for alignment padding
pub const ERASED: u8 = 0xFF;

/// Erase count requesting every application page
pub const ERASE_ALL: u8 = 0xFF;
/// Confirmation byte that must follow [`ERASE_ALL`]
pub const ERASE_ALL_CONFIRM: u8 = 0x00;

pub const MAX_CHUNK: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Bootloader handshake
    Init = 0x7F,

    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the option bytes
    GetVersion = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the host.
    ReadMemory = 0x11,

    /// Jumps to code located at an address specified by the host.
    Go = 0x21,

    /// Writes up to 256 bytes to flash starting from an address specified by the host.
    WriteMemory = 0x31,

    /// Erases from one to all the application flash pages.
    Erase = 0x43,
}

impl Command {
    /// Commands advertised in the GET response, in wire order
    pub const SUPPORTED: [Command; 7] = [
        Command::Get,
        Command::GetVersion,
        Command::GetId,
        Command::ReadMemory,
        Command::Go,
        Command::WriteMemory,
        Command::Erase,
    ];

    /// Byte the host sends to confirm this command
    pub fn complement(self) -> u8 {
        !(self as u8)
    }
}

impl From<Command> for u8 {
    fn from(c: Command) -> u8 {
        c as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let c = match v {
            0x7F => Command::Init,
            0x00 => Command::Get,
            0x01 => Command::GetVersion,
            0x02 => Command::GetId,
            0x11 => Command::ReadMemory,
            0x21 => Command::Go,
            0x31 => Command::WriteMemory,
            0x43 => Command::Erase,
            _ => return Err(v),
        };

        Ok(c)
    }
}
