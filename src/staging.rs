//! Staging of write and erase request bodies
//!
//! A request body is read and validated completely before anything reaches
//! flash, so a corrupted frame can never leave a partial write behind.

use crate::codec;
use crate::protocol::{ERASED, ERASE_ALL, ERASE_ALL_CONFIRM, MAX_CHUNK};
use crate::{Config, Error, Flash, Transport};

/// Room for a full chunk plus one leading and one trailing pad byte
pub const STAGED_CAPACITY: usize = MAX_CHUNK + 2;

/// Fixed size buffer holding a pending write payload or page list
pub struct StagedBuffer {
    data: [u8; STAGED_CAPACITY],
    len: usize,
}

impl StagedBuffer {
    pub const fn new() -> Self {
        Self {
            data: [0u8; STAGED_CAPACITY],
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append a byte, bytes past capacity are dropped
    pub fn push(&mut self, b: u8) {
        if let Some(slot) = self.data.get_mut(self.len) {
            *slot = b;
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self, len: usize) -> &mut [u8] {
        self.len = len.min(STAGED_CAPACITY);
        &mut self.data[..self.len]
    }
}

impl Default for StagedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated flash write, even aligned and of even length
#[derive(Debug, PartialEq)]
pub struct WriteRequest<'a> {
    pub address: u16,
    pub data: &'a [u8],
}

impl<'a> WriteRequest<'a> {
    /// Receive the length, payload and checksum of a WRITE_MEMORY body for
    /// an already decoded `address`.
    ///
    /// Flash can only be programmed in aligned halfwords, so an odd start
    /// gets a leading erased byte and an odd total gets a trailing one. The
    /// checksum covers only what the host sent.
    pub fn receive<P, E>(
        port: &mut P,
        address: u16,
        buffer: &'a mut StagedBuffer,
    ) -> Result<Self, Error<E>>
    where
        P: Transport<E>,
    {
        buffer.clear();

        let len = port.get_byte()?;

        let mut address = address;
        if address & 1 != 0 {
            address -= 1;
            buffer.push(ERASED);
        }

        codec::receive_payload(port, len, buffer)?;

        if buffer.len() & 1 != 0 {
            buffer.push(ERASED);
        }

        trace!(
            "Staged write of {} bytes at 0x{:04x} ({} requested)",
            buffer.len(),
            address,
            usize::from(len) + 1
        );

        Ok(Self {
            address,
            data: buffer.as_slice(),
        })
    }

    pub fn commit<F: Flash, E>(&self, flash: &mut F) -> Result<(), Error<E>> {
        flash.write(self.address, self.data).map_err(|e| {
            warn!("Flash write at 0x{:04x} failed: {:?}", self.address, e);
            Error::Flash
        })
    }
}

/// A validated list of pages to erase, in host order
#[derive(Debug, PartialEq)]
pub struct EraseRequest<'a> {
    pub pages: &'a [u8],
}

impl<'a> EraseRequest<'a> {
    /// Receive an ERASE body, either an explicit page list or the erase-all
    /// sentinel which expands to every page after the bootloader.
    pub fn receive<P, E>(
        port: &mut P,
        config: &Config,
        buffer: &'a mut StagedBuffer,
    ) -> Result<Self, Error<E>>
    where
        P: Transport<E>,
    {
        buffer.clear();

        let len = port.get_byte()?;

        if len == ERASE_ALL {
            let received = port.get_byte()?;
            if received != ERASE_ALL_CONFIRM {
                return Err(Error::ChecksumMismatch {
                    expected: ERASE_ALL_CONFIRM,
                    received,
                });
            }

            config.erasable_pages().for_each(|p| buffer.push(p));
            debug!("Staged erase of all {} application pages", buffer.len());
        } else {
            codec::receive_payload(port, len, buffer)?;
            debug!("Staged erase of {} pages", buffer.len());
        }

        Ok(Self {
            pages: buffer.as_slice(),
        })
    }

    /// Erase each page in turn, stopping at the first failure.
    ///
    /// Pages erased before a failure stay erased.
    pub fn commit<F: Flash, E>(&self, flash: &mut F) -> Result<(), Error<E>> {
        for &page in self.pages {
            flash.erase_page(page).map_err(|e| {
                warn!("Flash erase of page {} failed: {:?}", page, e);
                Error::<E>::Flash
            })?;
        }
        Ok(())
    }
}
