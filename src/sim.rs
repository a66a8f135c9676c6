//! In-memory doubles for the platform seam: a scripted [`Host`] and a NOR
//! flash with fault injection.
//!
//! Both are `no_std`-clean so the same doubles back the host test suite and
//! on-target smoke builds. [`SimHost`] keeps a virtual nanosecond clock that
//! only advances through delays and UART poll timeouts, which makes timeout
//! behavior deterministic. [`SimFlash`] can cut "power" after a given number
//! of program/erase operations to exercise the bank-activation atomicity
//! invariant.

use embedded_hal::delay::DelayNs;
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use heapless::{Deque, Vec};

use crate::host::{Host, Level, PinMode};

pub const SIM_PINS: usize = 64;

/// Scripted host: pin levels and ADC samples are set by the test, serial
/// output is captured, serial input is queued ahead of time.
pub struct SimHost {
    tick_ns: u64,
    levels: [Level; SIM_PINS],
    modes: [Option<PinMode>; SIM_PINS],
    adc: [u16; SIM_PINS],
    pwm: [u8; SIM_PINS],
    serial_out: Vec<u8, 8192>,
    serial_in: Deque<u8, 2048>,
}

impl SimHost {
    pub fn new() -> Self {
        Self {
            tick_ns: 0,
            levels: [Level::High; SIM_PINS],
            modes: [None; SIM_PINS],
            adc: [0; SIM_PINS],
            pwm: [0; SIM_PINS],
            serial_out: Vec::new(),
            serial_in: Deque::new(),
        }
    }

    pub fn set_pin_level(&mut self, pin: u8, level: Level) {
        if let Some(slot) = self.levels.get_mut(pin as usize) {
            *slot = level;
        }
    }

    pub fn pin_level(&self, pin: u8) -> Level {
        self.levels.get(pin as usize).copied().unwrap_or(Level::Low)
    }

    pub fn configured_mode(&self, pin: u8) -> Option<PinMode> {
        self.modes.get(pin as usize).copied().flatten()
    }

    pub fn set_adc(&mut self, pin: u8, sample: u16) {
        if let Some(slot) = self.adc.get_mut(pin as usize) {
            *slot = sample;
        }
    }

    pub fn pwm_duty(&self, pin: u8) -> u8 {
        self.pwm.get(pin as usize).copied().unwrap_or(0)
    }

    /// Queue bytes the device will "receive" on its UART.
    pub fn queue_serial(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.serial_in.push_back(b).is_err() {
                break;
            }
        }
    }

    pub fn serial_out(&self) -> &[u8] {
        &self.serial_out
    }

    pub fn serial_out_str(&self) -> &str {
        core::str::from_utf8(&self.serial_out).unwrap_or("")
    }

    pub fn clear_serial_out(&mut self) {
        self.serial_out.clear();
    }

    pub fn now_ms(&self) -> u32 {
        (self.tick_ns / 1_000_000) as u32
    }

    pub fn advance_ms(&mut self, ms: u32) {
        self.tick_ns += ms as u64 * 1_000_000;
    }
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayNs for SimHost {
    fn delay_ns(&mut self, ns: u32) {
        self.tick_ns += ns as u64;
    }
}

impl Host for SimHost {
    fn gpio_configure(&mut self, pin: u8, mode: PinMode) {
        if let Some(slot) = self.modes.get_mut(pin as usize) {
            *slot = Some(mode);
        }
    }

    fn gpio_write(&mut self, pin: u8, level: Level) {
        self.set_pin_level(pin, level);
    }

    fn gpio_read(&mut self, pin: u8) -> Level {
        self.levels.get(pin as usize).copied().unwrap_or(Level::Low)
    }

    fn adc_read(&mut self, pin: u8) -> u16 {
        self.adc.get(pin as usize).copied().unwrap_or(0)
    }

    fn pwm_write(&mut self, pin: u8, duty: u8) {
        if let Some(slot) = self.pwm.get_mut(pin as usize) {
            *slot = duty;
        }
    }

    fn tick_ms(&mut self) -> u32 {
        self.now_ms()
    }

    fn tick_us(&mut self) -> u32 {
        (self.tick_ns / 1_000) as u32
    }

    fn uart_write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.serial_out.push(b).is_err() {
                break;
            }
        }
    }

    fn uart_read(&mut self, buf: &mut [u8], timeout_ms: u32) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.serial_in.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        if n == 0 {
            // the virtual clock only moves while something blocks
            self.advance_ms(timeout_ms);
        }
        n
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimFlashError {
    OutOfBounds,
    NotAligned,
    /// Injected power cut.
    PowerLost,
}

impl NorFlashError for SimFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            SimFlashError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            SimFlashError::NotAligned => NorFlashErrorKind::NotAligned,
            SimFlashError::PowerLost => NorFlashErrorKind::Other,
        }
    }
}

/// NOR flash model: erased bytes read 0xFF, writes happen in 8-byte words,
/// erases in 2 KB pages. An optional operation budget simulates power loss
/// between (or inside) flash operations.
#[derive(Clone)]
pub struct SimFlash<const N: usize> {
    mem: [u8; N],
    ops_until_cut: Option<u32>,
}

impl<const N: usize> SimFlash<N> {
    pub fn new() -> Self {
        Self {
            mem: [0xFF; N],
            ops_until_cut: None,
        }
    }

    /// Fail every program/erase word or page operation after `ops` of them.
    pub fn cut_power_after(&mut self, ops: u32) {
        self.ops_until_cut = Some(ops);
    }

    pub fn restore_power(&mut self) {
        self.ops_until_cut = None;
    }

    pub fn contents(&self) -> &[u8] {
        &self.mem
    }

    fn consume_op(&mut self) -> Result<(), SimFlashError> {
        match &mut self.ops_until_cut {
            None => Ok(()),
            Some(0) => Err(SimFlashError::PowerLost),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
        }
    }
}

impl<const N: usize> Default for SimFlash<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ErrorType for SimFlash<N> {
    type Error = SimFlashError;
}

impl<const N: usize> ReadNorFlash for SimFlash<N> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let at = offset as usize;
        let end = at.checked_add(bytes.len()).ok_or(SimFlashError::OutOfBounds)?;
        let src = self.mem.get(at..end).ok_or(SimFlashError::OutOfBounds)?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> NorFlash for SimFlash<N> {
    const WRITE_SIZE: usize = 8;
    const ERASE_SIZE: usize = 2048;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let (from, to) = (from as usize, to as usize);
        if from % Self::ERASE_SIZE != 0 || to % Self::ERASE_SIZE != 0 || from > to {
            return Err(SimFlashError::NotAligned);
        }
        if to > N {
            return Err(SimFlashError::OutOfBounds);
        }
        for page in (from..to).step_by(Self::ERASE_SIZE) {
            self.consume_op()?;
            self.mem[page..page + Self::ERASE_SIZE].fill(0xFF);
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let at = offset as usize;
        if at % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(SimFlashError::NotAligned);
        }
        let end = at.checked_add(bytes.len()).ok_or(SimFlashError::OutOfBounds)?;
        if end > N {
            return Err(SimFlashError::OutOfBounds);
        }
        // word-granular, so a power cut can land between words of one call
        for (i, word) in bytes.chunks_exact(Self::WRITE_SIZE).enumerate() {
            self.consume_op()?;
            let dst = at + i * Self::WRITE_SIZE;
            for (d, &s) in self.mem[dst..dst + Self::WRITE_SIZE].iter_mut().zip(word) {
                // NOR semantics: programming only clears bits
                *d &= s;
            }
        }
        Ok(())
    }
}
