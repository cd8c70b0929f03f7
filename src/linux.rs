//! Running the bootloader on a Linux host, for testing flashing tools
//! against a simulated device.

use std::convert::Infallible;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use embedded_hal::digital::v2::InputPin;
use linux_embedded_hal::Serial;
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::flash::RamFlash;
use crate::{Bootloader, Config, Flash, Jumper};

impl<F: Flash> Bootloader<Serial, F, IoErrorKind> {
    /// Create a bootloader session on a linux serial port
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        flash: F,
        config: Config,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings, AN3155 framing is 8E1
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0.write_settings(&settings)?;

        // Return instance
        Ok(Self::new(port, flash, config))
    }
}

/// Flash backed by an image file, rewritten after every change
pub struct FileFlash {
    inner: RamFlash,
    path: PathBuf,
}

impl FileFlash {
    /// Load `path`, or create an erased image there if it does not exist
    pub fn open<P: AsRef<Path>>(path: P, config: &Config) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let inner = if path.exists() {
            let image = std::fs::read(&path)
                .with_context(|| format!("reading flash image {}", path.display()))?;
            RamFlash::with_image(config, &image)
                .with_context(|| format!("loading flash image {}", path.display()))?
        } else {
            info!("Creating erased flash image {}", path.display());
            RamFlash::new(config)
        };

        let f = Self { inner, path };
        f.persist()?;

        Ok(f)
    }

    pub fn image(&self) -> &[u8] {
        self.inner.image()
    }

    fn persist(&self) -> anyhow::Result<()> {
        std::fs::write(&self.path, self.inner.image())
            .with_context(|| format!("writing flash image {}", self.path.display()))
    }
}

impl Flash for FileFlash {
    type Error = anyhow::Error;

    fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.inner.read(address, buf)?;
        Ok(())
    }

    fn erase_page(&mut self, page: u8) -> Result<(), Self::Error> {
        debug!("Erasing page {}", page);
        self.inner.erase_page(page)?;
        self.persist()
    }

    fn write(&mut self, address: u16, data: &[u8]) -> Result<(), Self::Error> {
        trace!("Programming 0x{:04x}: {}", address, hex::encode(data));
        self.inner.write(address, data)?;
        self.persist()
    }
}

/// Entry pin with a fixed level
pub struct StaticPin(pub bool);

impl InputPin for StaticPin {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Self::Error> {
        Ok(self.0)
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        Ok(!self.0)
    }
}

/// Stands in for a transfer of control by ending the process
pub struct ProcessJumper;

impl Jumper for ProcessJumper {
    fn jump(&mut self, address: u16) -> ! {
        info!("Control transferred to 0x{:04x}, exiting", address);
        std::process::exit(0)
    }
}
