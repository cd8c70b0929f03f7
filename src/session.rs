//! Protocol state machine
//!
//! Each call to [`Bootloader::poll`] performs one state transition, reading
//! and writing as many bytes as that state requires. Every validation
//! failure lands in [`SessionState::Abort`], which answers with a single NACK
//! and returns to idle.

use core::convert::{Infallible, TryFrom};
use core::marker::PhantomData;

use crate::codec;
use crate::protocol::{Command, UART_ACK, UART_INIT, UART_NACK};
use crate::staging::{EraseRequest, StagedBuffer, WriteRequest};
use crate::{Config, Error, Flash, Jumper, Transport};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum SessionState {
    /// Waiting for a command byte
    Idle,
    /// Waiting for the complement of the candidate command byte
    AwaitChecksum(u8),
    /// Confirmed command, body and response pending
    InCommand(Command),
    /// Validation failed, NACK pending
    Abort,
}

/// Outcome of a single state transition
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Step {
    Continue,
    /// A GO command was accepted, control should pass to this address
    Go(u16),
}

pub struct Bootloader<P, F, E> {
    state: SessionState,
    config: Config,
    port: P,
    flash: F,
    buffer: StagedBuffer,
    _err: PhantomData<E>,
}

impl<P, F, E> Bootloader<P, F, E>
where
    P: Transport<E>,
    F: Flash,
    E: core::fmt::Debug,
{
    /// Create a new bootloader session
    pub fn new(port: P, flash: F, config: Config) -> Self {
        Self {
            state: SessionState::Idle,
            config,
            port,
            flash,
            buffer: StagedBuffer::new(),
            _err: PhantomData,
        }
    }

    /// Fetch the session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Tear down the session, returning the port and flash
    pub fn release(self) -> (P, F) {
        (self.port, self.flash)
    }

    /// Serve the host until a GO command hands over control.
    ///
    /// Only returns if the serial port fails.
    pub fn run<J: Jumper>(&mut self, jumper: &mut J) -> Result<Infallible, Error<E>> {
        loop {
            if let Step::Go(address) = self.poll()? {
                info!("Jumping to 0x{:04x}", address);
                jumper.jump(address);
            }
        }
    }

    /// Execute one state transition.
    ///
    /// Protocol failures are absorbed into the abort state, only serial
    /// errors are returned.
    pub fn poll(&mut self) -> Result<Step, Error<E>> {
        let res = match self.state {
            SessionState::Idle => self.idle(),
            SessionState::AwaitChecksum(candidate) => self.await_checksum(candidate),
            SessionState::InCommand(command) => self.command(command),
            SessionState::Abort => {
                self.port.put_byte(UART_NACK)?;
                Ok((SessionState::Idle, Step::Continue))
            }
        };

        match res {
            Ok((next, step)) => {
                if next != self.state {
                    trace!("State {:?} -> {:?}", self.state, next);
                }
                self.state = next;
                Ok(step)
            }
            Err(e) if e.is_protocol() => {
                warn!("Aborting in state {:?}: {:?}", self.state, e);
                self.state = SessionState::Abort;
                Ok(Step::Continue)
            }
            Err(e) => {
                error!("Serial error in state {:?}: {:?}", self.state, e);
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    fn ack(&mut self) -> Result<(), Error<E>> {
        self.port.put_byte(UART_ACK)?;
        Ok(())
    }

    fn idle(&mut self) -> Result<(SessionState, Step), Error<E>> {
        let b = self.port.get_byte()?;

        if b == UART_INIT {
            debug!("Received init");
            self.ack()?;
            return Ok((SessionState::Idle, Step::Continue));
        }

        Ok((SessionState::AwaitChecksum(b), Step::Continue))
    }

    fn await_checksum(&mut self, candidate: u8) -> Result<(SessionState, Step), Error<E>> {
        let rx = self.port.get_byte()?;

        if codec::confirm::<E>(candidate, rx).is_ok() {
            let command = Command::try_from(candidate).map_err(Error::<E>::UnknownCommand)?;

            debug!("Received command {:?}", command);
            self.ack()?;
            return Ok((SessionState::InCommand(command), Step::Continue));
        }

        if rx == UART_INIT {
            debug!("Resynchronised on init");
            self.ack()?;
            return Ok((SessionState::Idle, Step::Continue));
        }

        // Either line noise or we joined mid-frame, retry with this byte
        trace!("Command 0x{:02x} not confirmed, retrying with 0x{:02x}", candidate, rx);
        Ok((SessionState::AwaitChecksum(rx), Step::Continue))
    }

    fn command(&mut self, command: Command) -> Result<(SessionState, Step), Error<E>> {
        let step = match command {
            // The handshake is acknowledged at confirmation
            Command::Init => Step::Continue,
            Command::Get => self.get()?,
            Command::GetVersion => self.get_version()?,
            Command::GetId => self.get_id()?,
            Command::ReadMemory => self.read_memory()?,
            Command::Go => self.go()?,
            Command::WriteMemory => self.write_memory()?,
            Command::Erase => self.erase()?,
        };

        Ok((SessionState::Idle, step))
    }

    fn get(&mut self) -> Result<Step, Error<E>> {
        self.port.put_byte(Command::SUPPORTED.len() as u8)?;
        self.port.put_byte(self.config.bootloader_version)?;
        for c in Command::SUPPORTED.iter() {
            self.port.put_byte(*c as u8)?;
        }
        self.ack()?;

        Ok(Step::Continue)
    }

    fn get_version(&mut self) -> Result<Step, Error<E>> {
        self.port.put_byte(self.config.bootloader_version)?;
        // Option bytes
        self.port.put_byte(0x00)?;
        self.port.put_byte(0x00)?;
        self.ack()?;

        Ok(Step::Continue)
    }

    fn get_id(&mut self) -> Result<Step, Error<E>> {
        let [hi, lo] = self.config.device_id.to_be_bytes();

        self.port.put_byte(1)?;
        self.port.put_byte(hi)?;
        self.port.put_byte(lo)?;
        self.ack()?;

        Ok(Step::Continue)
    }

    fn read_memory(&mut self) -> Result<Step, Error<E>> {
        let address = codec::decode_address(&mut self.port, &self.config)?;
        self.ack()?;

        let len = self.port.get_byte()?;
        let confirmation = self.port.get_byte()?;
        codec::confirm::<E>(len, confirmation)?;
        self.ack()?;

        let count = usize::from(len) + 1;
        debug!("Reading {} bytes at 0x{:04x}", count, address);

        let data = self.buffer.as_mut_slice(count);
        self.flash.read(address, data).map_err(|e| {
            warn!("Flash read at 0x{:04x} failed: {:?}", address, e);
            Error::<E>::Flash
        })?;

        for &b in self.buffer.as_slice() {
            self.port.put_byte(b)?;
        }

        Ok(Step::Continue)
    }

    fn go(&mut self) -> Result<Step, Error<E>> {
        let address = codec::decode_address(&mut self.port, &self.config)?;
        self.ack()?;

        // The ACK has to leave before control does
        self.port.flush()?;

        Ok(Step::Go(address))
    }

    fn write_memory(&mut self) -> Result<Step, Error<E>> {
        let address = codec::decode_address(&mut self.port, &self.config)?;
        self.ack()?;

        let req = WriteRequest::receive(&mut self.port, address, &mut self.buffer)?;
        debug!("Writing {} bytes at 0x{:04x}", req.data.len(), req.address);
        req.commit::<_, E>(&mut self.flash)?;

        self.ack()?;

        Ok(Step::Continue)
    }

    fn erase(&mut self) -> Result<Step, Error<E>> {
        let req = EraseRequest::receive(&mut self.port, &self.config, &mut self.buffer)?;
        req.commit::<_, E>(&mut self.flash)?;

        self.ack()?;

        Ok(Step::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::fake::{FakeFlash, Op};
    use embedded_hal_mock::serial::{Mock, Transaction};
    use embedded_hal_mock::MockError;

    type Session = Bootloader<Mock<u8>, FakeFlash, MockError>;

    const ACK: u8 = UART_ACK;
    const NACK: u8 = UART_NACK;

    fn session(expectations: &[Transaction<u8>]) -> Session {
        let config = Config::default();
        Bootloader::new(
            Mock::new(expectations),
            FakeFlash::new(config.clone()),
            config,
        )
    }

    fn command(c: Command) -> Transaction<u8> {
        Transaction::read_many(&[c as u8, c.complement()])
    }

    fn address_frame(address: u16) -> Transaction<u8> {
        let [hi, lo] = address.to_be_bytes();
        Transaction::read_many(&[0x08, 0x00, hi, lo, 0x08 ^ hi ^ lo])
    }

    /// Poll until the session is back in idle, through abort if needed
    fn run_command(s: &mut Session) -> Step {
        loop {
            let step = s.poll().unwrap();
            if step != Step::Continue || s.state() == SessionState::Idle {
                return step;
            }
        }
    }

    fn finish(s: Session) -> FakeFlash {
        let (mut port, flash) = s.release();
        port.done();
        flash
    }

    #[test]
    fn init_is_acknowledged_in_idle() {
        let mut s = session(&[Transaction::read(UART_INIT), Transaction::write(ACK)]);

        assert_eq!(s.poll(), Ok(Step::Continue));
        assert_eq!(s.state(), SessionState::Idle);
        finish(s);
    }

    #[test]
    fn get_lists_supported_commands() {
        let mut s = session(&[
            command(Command::Get),
            Transaction::write(ACK),
            Transaction::write_many(&[7, 0x22, 0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, ACK]),
        ]);

        assert_eq!(run_command(&mut s), Step::Continue);
        finish(s);
    }

    #[test]
    fn get_version_reports_zero_option_bytes() {
        let mut s = session(&[
            command(Command::GetVersion),
            Transaction::write(ACK),
            Transaction::write_many(&[0x22, 0x00, 0x00, ACK]),
        ]);

        run_command(&mut s);
        finish(s);
    }

    #[test]
    fn get_id_reports_device_id() {
        let mut s = session(&[
            command(Command::GetId),
            Transaction::write(ACK),
            Transaction::write_many(&[1, 0x04, 0x10, ACK]),
        ]);

        run_command(&mut s);
        finish(s);
    }

    #[test]
    fn every_command_is_confirmed_with_one_ack() {
        for c in Command::SUPPORTED.iter() {
            let mut s = session(&[command(*c), Transaction::write(ACK)]);

            s.poll().unwrap();
            assert_eq!(s.state(), SessionState::AwaitChecksum(*c as u8));
            s.poll().unwrap();
            assert_eq!(s.state(), SessionState::InCommand(*c));
            finish(s);
        }
    }

    #[test]
    fn mismatched_confirmation_becomes_new_candidate() {
        // 0x11 is not the complement of 0x00, so it is retried as a command
        let mut s = session(&[
            Transaction::read_many(&[0x00, 0x11, 0xEE]),
            Transaction::write(ACK),
        ]);

        s.poll().unwrap();
        s.poll().unwrap();
        assert_eq!(s.state(), SessionState::AwaitChecksum(0x11));
        s.poll().unwrap();
        assert_eq!(s.state(), SessionState::InCommand(Command::ReadMemory));
        finish(s);
    }

    #[test]
    fn init_resynchronises_pending_command() {
        let mut s = session(&[Transaction::read_many(&[0x31, UART_INIT]), Transaction::write(ACK)]);

        s.poll().unwrap();
        s.poll().unwrap();
        assert_eq!(s.state(), SessionState::Idle);
        finish(s);
    }

    #[test]
    fn unknown_command_is_nacked() {
        // Extended erase is not supported
        let mut s = session(&[Transaction::read_many(&[0x44, 0xBB]), Transaction::write(NACK)]);

        s.poll().unwrap();
        s.poll().unwrap();
        assert_eq!(s.state(), SessionState::Abort);
        s.poll().unwrap();
        assert_eq!(s.state(), SessionState::Idle);
        finish(s);
    }

    #[test]
    fn read_memory_of_bootloader_region() {
        let mut s = session(&[
            command(Command::ReadMemory),
            Transaction::write(ACK),
            address_frame(0x0000),
            Transaction::write(ACK),
            Transaction::read_many(&[0x00, 0xFF]),
            Transaction::write(ACK),
            Transaction::write(0xFF),
        ]);

        run_command(&mut s);
        let flash = finish(s);
        assert_eq!(flash.ops(), &[Op::Read(0x0000, 1)]);
    }

    #[test]
    fn read_memory_length_confirmation_mismatch_aborts() {
        let mut s = session(&[
            command(Command::ReadMemory),
            Transaction::write(ACK),
            address_frame(0x0800),
            Transaction::write(ACK),
            Transaction::read_many(&[0x0F, 0x0F]),
            Transaction::write(NACK),
        ]);

        s.poll().unwrap();
        s.poll().unwrap();
        s.poll().unwrap();
        assert_eq!(s.state(), SessionState::Abort);
        s.poll().unwrap();
        let flash = finish(s);
        assert!(flash.ops().is_empty());
    }

    #[test]
    fn read_memory_past_end_of_flash_is_nacked() {
        let mut s = session(&[
            command(Command::ReadMemory),
            Transaction::write(ACK),
            address_frame(0x8000),
            Transaction::write(ACK),
            Transaction::read_many(&[0x00, 0xFF]),
            Transaction::write(ACK),
            Transaction::write(NACK),
        ]);

        run_command(&mut s);
        finish(s);
    }

    #[test]
    fn out_of_bounds_address_aborts() {
        let mut s = session(&[
            command(Command::ReadMemory),
            Transaction::write(ACK),
            address_frame(0x8001),
            Transaction::write(NACK),
        ]);

        run_command(&mut s);
        assert_eq!(s.state(), SessionState::Idle);
        finish(s);
    }

    #[test]
    fn go_flushes_ack_and_returns_target() {
        let mut s = session(&[
            command(Command::Go),
            Transaction::write(ACK),
            address_frame(0x0800),
            Transaction::write(ACK),
            Transaction::flush(),
        ]);

        assert_eq!(run_command(&mut s), Step::Go(0x0800));
        assert_eq!(s.state(), SessionState::Idle);
        finish(s);
    }

    #[test]
    fn write_memory_at_odd_address_commits_padded_buffer() {
        let data = [0xA5u8, 0x5A, 0x01, 0x02];
        let len = 3u8;
        let checksum = data.iter().fold(len, |a, b| a ^ b);

        let mut s = session(&[
            command(Command::WriteMemory),
            Transaction::write(ACK),
            address_frame(0x0C01),
            Transaction::write(ACK),
            Transaction::read(len),
            Transaction::read_many(&data),
            Transaction::read(checksum),
            Transaction::write(ACK),
        ]);

        run_command(&mut s);
        let flash = finish(s);
        assert_eq!(
            flash.ops(),
            &[Op::Write(0x0C00, vec![0xFF, 0xA5, 0x5A, 0x01, 0x02, 0xFF])]
        );
    }

    #[test]
    fn write_memory_checksum_error_leaves_flash_untouched() {
        let mut s = session(&[
            command(Command::WriteMemory),
            Transaction::write(ACK),
            address_frame(0x0C00),
            Transaction::write(ACK),
            Transaction::read_many(&[0x01, 0x12, 0x34, 0x00]),
            Transaction::write(NACK),
        ]);

        run_command(&mut s);
        let flash = finish(s);
        assert_eq!(flash.mutations(), 0);
    }

    #[test]
    fn write_memory_flash_failure_is_nacked() {
        let data = [0x12u8, 0x34];
        let mut s = session(&[
            command(Command::WriteMemory),
            Transaction::write(ACK),
            address_frame(0x0C00),
            Transaction::write(ACK),
            Transaction::read_many(&[0x01, 0x12, 0x34, 0x01 ^ 0x12 ^ 0x34]),
            Transaction::write(NACK),
        ]);
        s.flash.fail_writes();

        run_command(&mut s);
        let flash = finish(s);
        assert_eq!(flash.ops(), &[Op::Write(0x0C00, data.to_vec())]);
    }

    #[test]
    fn erase_all_clears_application_pages_only() {
        let mut s = session(&[
            command(Command::Erase),
            Transaction::write(ACK),
            Transaction::read_many(&[0xFF, 0x00]),
            Transaction::write(ACK),
        ]);

        run_command(&mut s);
        let flash = finish(s);
        let expected: Vec<Op> = (2..32).map(Op::Erase).collect();
        assert_eq!(flash.ops(), &expected[..]);
    }

    #[test]
    fn erase_all_with_bad_confirmation_erases_nothing() {
        let mut s = session(&[
            command(Command::Erase),
            Transaction::write(ACK),
            Transaction::read_many(&[0xFF, 0x01]),
            Transaction::write(NACK),
        ]);

        run_command(&mut s);
        let flash = finish(s);
        assert!(flash.ops().is_empty());
    }

    #[test]
    fn erase_failure_stops_and_nacks() {
        let mut s = session(&[
            command(Command::Erase),
            Transaction::write(ACK),
            Transaction::read_many(&[0x02, 3, 4, 5, 0x02 ^ 3 ^ 4 ^ 5]),
            Transaction::write(NACK),
        ]);
        s.flash.fail_erase_of(4);

        run_command(&mut s);
        let flash = finish(s);
        assert_eq!(flash.ops(), &[Op::Erase(3), Op::Erase(4)]);
    }

    #[test]
    fn serial_errors_are_returned() {
        let mut s = session(&[Transaction::read_error(nb::Error::Other(MockError::Io(
            std::io::ErrorKind::BrokenPipe,
        )))]);

        assert_eq!(
            s.poll(),
            Err(Error::Serial(MockError::Io(std::io::ErrorKind::BrokenPipe)))
        );
        assert_eq!(s.state(), SessionState::Idle);
        finish(s);
    }
}
