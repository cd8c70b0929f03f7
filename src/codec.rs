//! Frame decoding and XOR checksums

use crate::staging::StagedBuffer;
use crate::{Config, Error, Transport};

/// Running XOR over the bytes of a frame
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Checksum(u8);

impl Checksum {
    /// Start a checksum with an initial byte already folded in
    pub fn seeded(seed: u8) -> Self {
        Self(seed)
    }

    pub fn fold(&mut self, b: u8) {
        self.0 ^= b;
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Compare against the trailing checksum byte of a frame
    pub fn verify<E>(&self, received: u8) -> Result<(), Error<E>> {
        if received != self.0 {
            return Err(Error::ChecksumMismatch {
                expected: self.0,
                received,
            });
        }
        Ok(())
    }
}

/// Check a byte against the bitwise complement of `value`, as used for
/// command and length confirmation
pub fn confirm<E>(value: u8, received: u8) -> Result<(), Error<E>> {
    let expected = !value;
    if received != expected {
        return Err(Error::ChecksumMismatch { expected, received });
    }
    Ok(())
}

/// Read an address frame: four address bytes followed by their XOR.
///
/// The wire carries a 32-bit big-endian address, only the low 16 bits are
/// meaningful here so the two leading bytes only feed the checksum.
pub fn decode_address<P, E>(port: &mut P, config: &Config) -> Result<u16, Error<E>>
where
    P: Transport<E>,
{
    let mut checksum = Checksum::default();

    for _ in 0..2 {
        checksum.fold(port.get_byte()?);
    }

    let hi = port.get_byte()?;
    checksum.fold(hi);
    let lo = port.get_byte()?;
    checksum.fold(lo);

    let address = u16::from_be_bytes([hi, lo]);

    checksum.verify::<E>(port.get_byte()?)?;

    if !config.contains(address) {
        return Err(Error::AddressOutOfBounds(address));
    }

    Ok(address)
}

/// Read `count + 1` payload bytes into `buffer` followed by a checksum
/// byte covering the count and the payload.
pub fn receive_payload<P, E>(
    port: &mut P,
    count: u8,
    buffer: &mut StagedBuffer,
) -> Result<(), Error<E>>
where
    P: Transport<E>,
{
    let mut checksum = Checksum::seeded(count);

    for _ in 0..=count {
        let b = port.get_byte()?;
        checksum.fold(b);
        buffer.push(b);
    }

    checksum.verify(port.get_byte()?)
}
