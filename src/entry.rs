//! Deciding between the bootloader and the resident application at reset

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::InputPin;

use crate::protocol::ERASED;
use crate::{Config, Flash};

/// Transfer of control to code at an absolute address.
///
/// Implementations must disable every interrupt source before jumping.
pub trait Jumper {
    fn jump(&mut self, address: u16) -> !;
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Entry {
    /// Start the resident application
    Application,
    /// Stay in the bootloader and serve the host
    Bootloader,
}

/// Sample the entry pin and peek at the application image.
///
/// The application is only started when the pin does not request the
/// bootloader and the first application byte is programmed, so a part
/// without a valid image always stays reachable. Pin or flash failures
/// keep the bootloader.
pub fn decide<P, D, F>(pin: &P, delay: &mut D, flash: &mut F, config: &Config) -> Entry
where
    P: InputPin,
    P::Error: core::fmt::Debug,
    D: DelayMs<u32>,
    F: Flash,
{
    delay.delay_ms(config.pin_settle_ms);

    match pin.is_high() {
        Ok(false) => (),
        Ok(true) => {
            info!("Bootloader requested by entry pin");
            return Entry::Bootloader;
        }
        Err(e) => {
            warn!("Entry pin read failed: {:?}", e);
            return Entry::Bootloader;
        }
    }

    let mut first = [ERASED; 1];
    if let Err(e) = flash.read(config.app_base(), &mut first) {
        warn!("Application peek failed: {:?}", e);
        return Entry::Bootloader;
    }

    if first[0] == ERASED {
        info!("No application at 0x{:04x}", config.app_base());
        return Entry::Bootloader;
    }

    Entry::Application
}

/// Run the entry decision, jumping straight to the application if selected.
///
/// Only returns when the bootloader should run.
pub fn boot<P, D, F, J>(pin: &P, delay: &mut D, flash: &mut F, jumper: &mut J, config: &Config)
where
    P: InputPin,
    P::Error: core::fmt::Debug,
    D: DelayMs<u32>,
    F: Flash,
    J: Jumper,
{
    if decide(pin, delay, flash, config) == Entry::Application {
        info!("Starting application at 0x{:04x}", config.app_base());
        jumper.jump(config.app_base());
    }
}
