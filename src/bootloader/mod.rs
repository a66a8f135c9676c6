//! Serial update session.
//!
//! After reset the bootloader offers a bounded update window: a hardware
//! button, an armed flash trigger page, or a magic byte sequence on the
//! serial port opens a session; otherwise control passes straight to the
//! hypervisor. Inside a session, framed commands stream a new image into
//! the inactive bank through an 8-byte staging buffer; VERIFY checks the
//! CRC and image structure and only then is the metadata page rewritten,
//! which atomically activates the new bank. Any fatal error leaves the
//! previous bank untouched and yields to the application.
//!
//! The session is single-threaded and cooperative: it polls the UART with
//! a timeout and never runs concurrently with the hypervisor.

pub mod command;
pub mod frame;

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

use crate::flash::{Bank, BankManager, BankMetadata};
use crate::host::{Host, Level};
use crate::time::{elapsed_ms, Deadline};
use crate::FlashError;
use command::Command;
use frame::FrameParser;

/// Serial trigger sequence, "CKPT".
pub const SERIAL_TRIGGER: [u8; 4] = [0x43, 0x4B, 0x50, 0x54];

const UART_POLL_MS: u32 = 10;
const POLL_SLICE_MS: u32 = 50;
const RETRY_CLASSES: usize = 6;

/// Bootloader-local error taxonomy. The code byte travels in `0xFF`
/// responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootError {
    InvalidRequest,
    Framing,
    FrameSize,
    Crc,
    Timeout,
    Sequence,
    FlashOperation,
    ImageInvalid,
    ResourceExhaustion,
}

impl BootError {
    pub fn code(self) -> u8 {
        match self {
            BootError::InvalidRequest => 0x01,
            BootError::Framing => 0x02,
            BootError::FrameSize => 0x03,
            BootError::Crc => 0x04,
            BootError::Timeout => 0x05,
            BootError::Sequence => 0x06,
            BootError::FlashOperation => 0x07,
            BootError::ImageInvalid => 0x08,
            BootError::ResourceExhaustion => 0x09,
        }
    }

    /// Communication errors are retried; flash, image, and resource errors
    /// abort the session.
    pub fn retryable(self) -> bool {
        self.class_index().is_some()
    }

    fn class_index(self) -> Option<usize> {
        match self {
            BootError::Framing => Some(0),
            BootError::FrameSize => Some(1),
            BootError::Crc => Some(2),
            BootError::Timeout => Some(3),
            BootError::Sequence => Some(4),
            BootError::InvalidRequest => Some(5),
            _ => None,
        }
    }
}

impl From<FlashError> for BootError {
    fn from(_: FlashError) -> Self {
        BootError::FlashOperation
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    Startup,
    TriggerDetect,
    TransportInit,
    Handshake,
    Ready,
    Receiving,
    Verifying,
    BankSwitch,
    Complete,
    Recovery,
    Abort,
    JumpApplication,
}

/// How a boot attempt ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// No update happened; boot the existing active bank.
    JumpApplication,
    /// A new image was verified and activated; boot it.
    Updated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Active-low button sampled once at reset.
    pub trigger_pin: Option<u8>,
    /// Serial listen window after reset.
    pub serial_listen_ms: u32,
    pub session_timeout_ms: u32,
    /// Inter-frame (and inter-byte) timeout while a transfer is up.
    pub frame_timeout_ms: u32,
    pub handshake_timeout_ms: u32,
    pub max_retries: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trigger_pin: None,
            serial_listen_ms: 5_000,
            session_timeout_ms: 30_000,
            frame_timeout_ms: 500,
            handshake_timeout_ms: 2_000,
            max_retries: 3,
        }
    }
}

/// One update session over a polled UART.
///
/// Borrows the host and the bank manager exclusively; both are released
/// when the session object is dropped, before the hypervisor takes over.
pub struct Bootloader<'a, H: Host, F> {
    host: &'a mut H,
    banks: &'a mut BankManager<F>,
    config: Config,
    state: SessionState,
    parser: FrameParser,
    receive_bank: Bank,
    cursor: u32,
    staging: [u8; 8],
    staged: usize,
    received: u32,
    expected: u32,
    last_activity: u32,
    retries: [u8; RETRY_CLASSES],
}

impl<'a, H: Host, F: ReadNorFlash + NorFlash> Bootloader<'a, H, F> {
    pub fn new(host: &'a mut H, banks: &'a mut BankManager<F>, config: Config) -> Self {
        Self {
            host,
            banks,
            config,
            state: SessionState::Startup,
            parser: FrameParser::new(),
            receive_bank: Bank::B,
            cursor: 0,
            staging: [0xFF; 8],
            staged: 0,
            received: 0,
            expected: 0,
            last_activity: 0,
            retries: [0; RETRY_CLASSES],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Full boot entry: evaluate triggers, then either run a session or
    /// yield immediately.
    pub fn run(&mut self) -> Outcome {
        self.enter(SessionState::TriggerDetect);
        if !self.detect_trigger() {
            self.enter(SessionState::JumpApplication);
            return Outcome::JumpApplication;
        }
        self.run_session()
    }

    /// Evaluate the three session triggers in priority order.
    pub fn detect_trigger(&mut self) -> bool {
        if let Some(pin) = self.config.trigger_pin {
            if self.host.gpio_read(pin) == Level::Low {
                info!("session trigger: button on pin {}", pin);
                return true;
            }
        }

        if self.banks.read_trigger() {
            info!("session trigger: flash trigger page");
            // one-shot: disarm before the session so a crash cannot loop
            if self.banks.clear_trigger().is_err() {
                warn!("trigger page clear failed");
            }
            return true;
        }

        let deadline = Deadline::new(self.host.tick_ms(), self.config.serial_listen_ms);
        let mut matched = 0usize;
        while !deadline.expired(self.host.tick_ms()) {
            let mut byte = [0u8; 1];
            if self.host.uart_read(&mut byte, UART_POLL_MS) != 1 {
                continue;
            }
            if byte[0] == SERIAL_TRIGGER[matched] {
                matched += 1;
                if matched == SERIAL_TRIGGER.len() {
                    info!("session trigger: serial magic");
                    return true;
                }
            } else {
                matched = (byte[0] == SERIAL_TRIGGER[0]) as usize;
            }
        }
        false
    }

    /// Run the command loop until an update completes, a fatal error
    /// aborts, or the session times out.
    pub fn run_session(&mut self) -> Outcome {
        self.enter(SessionState::TransportInit);
        self.parser.reset();
        self.retries = [0; RETRY_CLASSES];
        self.cursor = 0;
        self.staged = 0;
        self.received = 0;
        self.expected = 0;
        self.receive_bank = match self.banks.active_bank() {
            Some((active, _)) => active.other(),
            None => Bank::A,
        };
        debug!("receive bank {}", self.receive_bank.index());

        self.enter(SessionState::Handshake);
        let session = Deadline::new(self.host.tick_ms(), self.config.session_timeout_ms);
        self.last_activity = self.host.tick_ms();
        let mut updated = false;

        loop {
            let now = self.host.tick_ms();
            if session.expired(now) {
                warn!("session timeout");
                self.send_error(BootError::Timeout);
                self.enter(SessionState::Abort);
                break;
            }

            if self.stalled(now) {
                if !self.recover_or_abort(BootError::Timeout) {
                    break;
                }
                continue;
            }

            match self.poll_frame(POLL_SLICE_MS) {
                Ok(true) => match self.dispatch_frame() {
                    Ok(true) => {
                        updated = true;
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        if !self.recover_or_abort(e) {
                            break;
                        }
                    }
                },
                Ok(false) => {}
                Err(e) => {
                    if !self.recover_or_abort(e) {
                        break;
                    }
                }
            }
        }

        self.enter(SessionState::JumpApplication);
        if updated {
            Outcome::Updated
        } else {
            Outcome::JumpApplication
        }
    }

    /// Idle/stall detection against the per-state timeout.
    fn stalled(&self, now: u32) -> bool {
        let idle = elapsed_ms(now, self.last_activity);
        if !self.parser.idle() {
            return idle >= self.config.frame_timeout_ms;
        }
        match self.state {
            SessionState::Handshake => idle >= self.config.handshake_timeout_ms,
            SessionState::Receiving => idle >= self.config.frame_timeout_ms,
            _ => false,
        }
    }

    /// Pump the UART into the frame parser for one poll slice.
    fn poll_frame(&mut self, slice_ms: u32) -> Result<bool, BootError> {
        let slice = Deadline::new(self.host.tick_ms(), slice_ms);
        loop {
            let mut byte = [0u8; 1];
            if self.host.uart_read(&mut byte, UART_POLL_MS) == 1 {
                self.last_activity = self.host.tick_ms();
                if self.parser.feed(byte[0])? {
                    return Ok(true);
                }
            } else if slice.expired(self.host.tick_ms()) {
                return Ok(false);
            }
        }
    }

    /// Handle one complete frame. `Ok(true)` ends the session as updated.
    fn dispatch_frame(&mut self) -> Result<bool, BootError> {
        let payload = self.parser.take_payload();
        match Command::parse(&payload)? {
            Command::Handshake { version } => {
                match self.state {
                    // idempotent in Ready
                    SessionState::Handshake | SessionState::Ready => {}
                    _ => return Err(BootError::Sequence),
                }
                debug!("handshake, host protocol {}", version);
                self.enter(SessionState::Ready);
                self.send(&command::handshake_ok());
                Ok(false)
            }
            Command::PrepareFlash { size } => {
                match self.state {
                    // a restarted transfer re-prepares from Receiving
                    SessionState::Ready | SessionState::Receiving => {}
                    _ => return Err(BootError::Sequence),
                }
                if size == 0 {
                    return Err(BootError::InvalidRequest);
                }
                if size > self.banks.bank_size() {
                    return Err(BootError::ResourceExhaustion);
                }
                self.banks.erase_bank(self.receive_bank)?;
                self.cursor = 0;
                self.staged = 0;
                self.received = 0;
                self.expected = size;
                self.enter(SessionState::Receiving);
                self.send(&command::prepare_ok());
                Ok(false)
            }
            Command::Data { chunk } => {
                if self.state != SessionState::Receiving {
                    return Err(BootError::Sequence);
                }
                if self.received + chunk.len() as u32 > self.expected {
                    return Err(BootError::ResourceExhaustion);
                }
                self.stage(chunk)?;
                self.send(&command::data_ok());
                Ok(false)
            }
            Command::Verify { size, crc32 } => {
                if self.state != SessionState::Receiving {
                    return Err(BootError::Sequence);
                }
                self.enter(SessionState::Verifying);
                let written = self.verify_and_switch(size, crc32)?;
                self.enter(SessionState::Complete);
                self.send(&command::verify_ok(written));
                Ok(true)
            }
        }
    }

    /// Accumulate bytes through the 8-byte staging buffer, flushing every
    /// full word to the receive bank.
    fn stage(&mut self, chunk: &[u8]) -> Result<(), BootError> {
        for &byte in chunk {
            self.staging[self.staged] = byte;
            self.staged += 1;
            if self.staged == self.staging.len() {
                self.flush_word()?;
            }
        }
        self.received += chunk.len() as u32;
        Ok(())
    }

    fn flush_word(&mut self) -> Result<(), BootError> {
        let word = self.staging;
        self.banks
            .program_aligned(self.receive_bank, self.cursor, &word)?;
        self.cursor += self.staging.len() as u32;
        self.staged = 0;
        self.staging = [0xFF; 8];
        Ok(())
    }

    /// VERIFY: flush the padded tail, check CRC and image structure, then
    /// commit metadata. The metadata write is the atomic activation point.
    fn verify_and_switch(&mut self, size: u32, crc32: u32) -> Result<u16, BootError> {
        if self.staged > 0 {
            // partial word is 0xFF-padded by construction
            self.flush_word()?;
        }
        if size != self.received {
            warn!("verify size {} != received {}", size, self.received);
            return Err(BootError::ImageInvalid);
        }
        if !self.banks.verify_crc32(self.receive_bank, size, crc32)? {
            warn!("candidate bank failed CRC");
            return Err(BootError::ImageInvalid);
        }
        let Some((version, image_len)) = self.banks.probe_bank(self.receive_bank) else {
            return Err(BootError::ImageInvalid);
        };
        if image_len != size {
            return Err(BootError::ImageInvalid);
        }

        self.enter(SessionState::BankSwitch);
        self.banks.commit_metadata(&BankMetadata {
            version: version as u32,
            size,
            crc32,
            active: self.receive_bank,
        })?;
        info!(
            "bank {} activated, v{} {} bytes",
            self.receive_bank.index(),
            version as u32,
            size
        );
        Ok(u16::try_from(size).unwrap_or(u16::MAX))
    }

    /// Report the error, then either recover in place or abort the session.
    /// Staged transfer state survives recovery so the host can resend the
    /// failed frame.
    fn recover_or_abort(&mut self, e: BootError) -> bool {
        warn!("session error, code {}", e.code());
        self.send_error(e);
        self.parser.reset();
        self.last_activity = self.host.tick_ms();

        let Some(class) = e.class_index() else {
            self.enter(SessionState::Abort);
            return false;
        };
        self.retries[class] = self.retries[class].saturating_add(1);
        if self.retries[class] > self.config.max_retries {
            self.enter(SessionState::Abort);
            return false;
        }
        let resume = self.state;
        self.enter(SessionState::Recovery);
        self.enter(resume);
        true
    }

    fn send(&mut self, payload: &[u8]) {
        let mut wire = [0u8; 64];
        if let Ok(n) = frame::encode(payload, &mut wire) {
            self.host.uart_write(&wire[..n]);
        }
    }

    fn send_error(&mut self, e: BootError) {
        self.send(&command::error_response(e));
    }

    fn enter(&mut self, next: SessionState) {
        trace!("bootloader state -> {}", next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::Layout;
    use crate::sim::{SimFlash, SimHost};

    const FLASH_BYTES: usize = 0x1_0000;

    fn rig() -> (SimHost, BankManager<SimFlash<FLASH_BYTES>>) {
        let host = SimHost::new();
        let banks = BankManager::new(SimFlash::new(), Layout::default()).unwrap();
        (host, banks)
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(BootError::InvalidRequest.code(), 0x01);
        assert_eq!(BootError::Crc.code(), 0x04);
        assert_eq!(BootError::ResourceExhaustion.code(), 0x09);
    }

    #[test]
    fn retryability_matches_the_taxonomy() {
        for e in [
            BootError::Framing,
            BootError::FrameSize,
            BootError::Crc,
            BootError::Timeout,
            BootError::Sequence,
            BootError::InvalidRequest,
        ] {
            assert!(e.retryable());
        }
        for e in [
            BootError::FlashOperation,
            BootError::ImageInvalid,
            BootError::ResourceExhaustion,
        ] {
            assert!(!e.retryable());
        }
    }

    #[test]
    fn button_trigger_wins() {
        let (mut host, mut banks) = rig();
        host.set_pin_level(9, Level::Low);
        let config = Config {
            trigger_pin: Some(9),
            ..Config::default()
        };
        let mut boot = Bootloader::new(&mut host, &mut banks, config);
        assert!(boot.detect_trigger());
    }

    #[test]
    fn flash_trigger_page_is_one_shot() {
        let (mut host, mut banks) = rig();
        banks.write_trigger().unwrap();
        let mut boot = Bootloader::new(&mut host, &mut banks, Config::default());
        assert!(boot.detect_trigger());
        // page was cleared; a plain reboot boots the application
        assert!(!banks.read_trigger());
    }

    #[test]
    fn serial_magic_trigger() {
        let (mut host, mut banks) = rig();
        host.queue_serial(b"xx");
        host.queue_serial(&SERIAL_TRIGGER);
        let mut boot = Bootloader::new(&mut host, &mut banks, Config::default());
        assert!(boot.detect_trigger());
    }

    #[test]
    fn no_trigger_yields_to_application() {
        let (mut host, mut banks) = rig();
        let config = Config {
            serial_listen_ms: 100,
            ..Config::default()
        };
        let mut boot = Bootloader::new(&mut host, &mut banks, config);
        assert_eq!(boot.run(), Outcome::JumpApplication);
        assert_eq!(boot.state(), SessionState::JumpApplication);
    }

    #[test]
    fn session_times_out_without_a_handshake() {
        let (mut host, mut banks) = rig();
        let config = Config {
            session_timeout_ms: 2_000,
            ..Config::default()
        };
        let mut boot = Bootloader::new(&mut host, &mut banks, config);
        let started = host_time(&boot);
        assert_eq!(boot.run_session(), Outcome::JumpApplication);
        let elapsed = host_time(&boot).wrapping_sub(started);
        // handshake timeouts retry until the retry budget aborts, within
        // the session bound
        assert!(elapsed <= 2_100, "session ran {} ms", elapsed);
    }

    fn host_time<F>(boot: &Bootloader<'_, SimHost, F>) -> u32 {
        boot.host.now_ms()
    }
}
