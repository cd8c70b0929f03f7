//! STM32 Serial Bootloader, device side.
//!
//! Implements the command set of the STM32 factory UART bootloader (AN3155)
//! over any `embedded-hal` serial port, so the usual host tools can flash a
//! part with 16-bit flash addressing and page erasable flash.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod codec;
pub mod entry;
pub mod flash;
pub mod protocol;
pub mod session;
pub mod staging;

#[cfg(feature = "linux")]
pub mod linux;

pub use entry::{Entry, Jumper};
pub use flash::Flash;
pub use protocol::{Command, UART_ACK, UART_INIT, UART_NACK};
pub use session::{Bootloader, SessionState, Step};

/// Byte link the bootloader talks over
pub trait Transport<E> {
    /// Block until a byte is received
    fn get_byte(&mut self) -> Result<u8, E>;

    /// Queue a byte for transmission
    fn put_byte(&mut self, b: u8) -> Result<(), E>;

    /// Block until queued bytes have been transmitted
    fn flush(&mut self) -> Result<(), E>;
}

impl<P, E> Transport<E> for P
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
{
    fn get_byte(&mut self) -> Result<u8, E> {
        block!(self.read())
    }

    fn put_byte(&mut self, b: u8) -> Result<(), E> {
        block!(self.write(b))
    }

    fn flush(&mut self) -> Result<(), E> {
        block!(<P as Write<u8>>::flush(self))
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum Error<SerialError> {
    /// The underlying serial port failed
    #[cfg_attr(feature = "std", error("serial error: {0:?}"))]
    Serial(SerialError),

    /// A frame checksum or command confirmation did not match
    #[cfg_attr(
        feature = "std",
        error("checksum mismatch (expected 0x{expected:02x}, received 0x{received:02x})")
    )]
    ChecksumMismatch { expected: u8, received: u8 },

    /// A decoded address lies beyond the end of flash
    #[cfg_attr(feature = "std", error("address 0x{0:04x} out of bounds"))]
    AddressOutOfBounds(u16),

    /// A confirmed command byte is not part of the supported command set
    #[cfg_attr(feature = "std", error("unknown command 0x{0:02x}"))]
    UnknownCommand(u8),

    /// The flash interface reported a failure
    #[cfg_attr(feature = "std", error("flash operation failed"))]
    Flash,
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl<SerialError> Error<SerialError> {
    /// Protocol errors abort the current command, anything else ends the session
    pub fn is_protocol(&self) -> bool {
        !matches!(self, Error::Serial(_))
    }
}

/// Device description served to the host
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Config {
    /// Flash size in bytes, addresses above this are rejected
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x8000", parse(try_from_str = parse_u32)))]
    pub flash_size: u32,

    /// Flash page size in bytes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1024", parse(try_from_str = parse_u16)))]
    pub page_size: u16,

    /// Number of pages occupied by the bootloader itself
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2"))]
    pub bootloader_pages: u8,

    /// Product ID reported by GET_ID
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x0410", parse(try_from_str = parse_u16)))]
    pub device_id: u16,

    /// Bootloader version reported by GET and GET_VERSION
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x22", parse(try_from_str = parse_u8)))]
    pub bootloader_version: u8,

    /// Period to wait for the entry pin to settle before sampling it
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "25"))]
    pub pin_settle_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flash_size: 0x8000,
            page_size: 1024,
            bootloader_pages: 2,
            device_id: 0x0410,
            bootloader_version: 0x22,
            pin_settle_ms: 25,
        }
    }
}

impl Config {
    /// Total number of flash pages, page indices are 8 bits wide
    pub fn page_count(&self) -> u16 {
        let pages = self.flash_size / u32::from(self.page_size.max(1));
        pages.min(256) as u16
    }

    /// Address of the first byte past the bootloader, where the application lives
    pub fn app_base(&self) -> u16 {
        let base = u32::from(self.bootloader_pages) * u32::from(self.page_size);
        base.min(u32::from(u16::MAX)) as u16
    }

    /// Page indices an erase-all request clears, never including bootloader pages
    pub fn erasable_pages(&self) -> impl Iterator<Item = u8> {
        let first = u16::from(self.bootloader_pages);
        let last = self.page_count();
        (first..last).map(|p| p as u8)
    }

    /// Whether `address` lies within flash (the end address itself is accepted)
    pub fn contains(&self, address: u16) -> bool {
        u32::from(address) <= self.flash_size
    }
}

#[cfg(feature = "structopt")]
fn parse_u32(s: &str) -> Result<u32, core::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[cfg(feature = "structopt")]
fn parse_u16(s: &str) -> Result<u16, core::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[cfg(feature = "structopt")]
fn parse_u8(s: &str) -> Result<u8, core::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    }
}
