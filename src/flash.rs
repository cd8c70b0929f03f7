//! Flash memory capability

use core::fmt::Debug;

#[cfg(any(test, feature = "std"))]
use crate::Config;

/// Page erasable flash as seen by the bootloader.
///
/// Addresses and page indices come straight from the host, implementations
/// are responsible for rejecting anything they cannot service.
pub trait Flash {
    type Error: Debug;

    /// Reads flash contents into `buf`, starting at `address`.
    fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Sets every byte of the page to the erased value (0xFF).
    fn erase_page(&mut self, page: u8) -> Result<(), Self::Error>;

    /// Programs `data` at `address`, both must be halfword aligned.
    fn write(&mut self, address: u16, data: &[u8]) -> Result<(), Self::Error>;
}

#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum FlashError {
    #[cfg_attr(feature = "std", error("access of {len} bytes at 0x{address:04x} is out of bounds"))]
    OutOfBounds { address: u16, len: usize },

    #[cfg_attr(feature = "std", error("write of {len} bytes at 0x{address:04x} is not halfword aligned"))]
    Misaligned { address: u16, len: usize },

    #[cfg_attr(feature = "std", error("page {0} does not exist"))]
    InvalidPage(u8),

    #[cfg_attr(feature = "std", error("access at 0x{0:04x} targets the bootloader"))]
    Protected(u16),
}

/// Flash held in memory, with NOR semantics: erase sets bytes to 0xFF and
/// programming can only clear bits.
#[cfg(any(test, feature = "std"))]
#[derive(Clone, Debug)]
pub struct RamFlash {
    data: Vec<u8>,
    page_size: usize,
    app_base: usize,
}

#[cfg(any(test, feature = "std"))]
impl RamFlash {
    /// Create a fully erased flash matching `config`
    pub fn new(config: &Config) -> Self {
        let size = usize::from(config.page_count()) * usize::from(config.page_size);
        Self {
            data: vec![0xFF; size],
            page_size: usize::from(config.page_size),
            app_base: usize::from(config.app_base()),
        }
    }

    /// Create a flash preloaded with `image`, the remainder is left erased
    pub fn with_image(config: &Config, image: &[u8]) -> Result<Self, FlashError> {
        let mut flash = Self::new(config);
        if image.len() > flash.data.len() {
            return Err(FlashError::OutOfBounds {
                address: 0,
                len: image.len(),
            });
        }
        flash.data[..image.len()].copy_from_slice(image);
        Ok(flash)
    }

    pub fn image(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, address: u16, len: usize) -> Result<core::ops::Range<usize>, FlashError> {
        let start = usize::from(address);
        match start.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(FlashError::OutOfBounds { address, len }),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl Flash for RamFlash {
    type Error = FlashError;

    fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(address, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn erase_page(&mut self, page: u8) -> Result<(), Self::Error> {
        let start = usize::from(page) * self.page_size;
        if start >= self.data.len() {
            return Err(FlashError::InvalidPage(page));
        }
        if start < self.app_base {
            return Err(FlashError::Protected(start as u16));
        }

        self.data[start..start + self.page_size]
            .iter_mut()
            .for_each(|b| *b = 0xFF);
        Ok(())
    }

    fn write(&mut self, address: u16, data: &[u8]) -> Result<(), Self::Error> {
        if address & 1 != 0 || data.len() & 1 != 0 {
            return Err(FlashError::Misaligned {
                address,
                len: data.len(),
            });
        }
        if usize::from(address) < self.app_base {
            return Err(FlashError::Protected(address));
        }

        let range = self.range(address, data.len())?;
        self.data[range]
            .iter_mut()
            .zip(data)
            .for_each(|(cell, b)| *cell &= *b);
        Ok(())
    }
}
