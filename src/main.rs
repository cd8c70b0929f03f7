#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};

use std::path::PathBuf;

use linux_embedded_hal::Delay;

use stm32_uart_bootloader::entry;
use stm32_uart_bootloader::linux::{FileFlash, ProcessJumper, StaticPin};
use stm32_uart_bootloader::{Bootloader, Config};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to serve the bootloader on
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "57600")]
    baud: usize,

    /// Flash image file, created erased if missing
    #[structopt(long, default_value = "flash.bin")]
    image: PathBuf,

    /// Stay in the bootloader even when a valid application is present
    #[structopt(long)]
    force_bootloader: bool,

    #[structopt(flatten)]
    config: Config,

    /// Log level for console output
    #[structopt(long, default_value = "debug")]
    log_level: LevelFilter,
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, LogConfig::default());

    info!(
        "Loading flash image {} ({}, {} pages)",
        o.image.display(),
        bytefmt::format(u64::from(o.config.flash_size)),
        o.config.page_count()
    );

    let mut flash = match FileFlash::open(&o.image, &o.config) {
        Ok(f) => f,
        Err(e) => {
            error!("Error loading flash image: {:?}", e);
            return;
        }
    };

    // Does not return if the application is started
    entry::boot(
        &StaticPin(o.force_bootloader),
        &mut Delay {},
        &mut flash,
        &mut ProcessJumper,
        &o.config,
    );

    info!("Opening serial port {}", o.port);

    let mut b = match Bootloader::linux(&o.port, o.baud, flash, o.config.clone()) {
        Ok(b) => b,
        Err(e) => {
            error!("Error opening serial port: {:?}", e);
            return;
        }
    };

    info!("Bootloader ready");

    match b.run(&mut ProcessJumper) {
        Ok(never) => match never {},
        Err(e) => error!("Bootloader stopped: {:?}", e),
    }
}
