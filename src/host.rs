//! Platform seam consumed by the I/O controller and the bootloader.
//!
//! A target binds this trait to its HAL once at boot; the core never touches
//! hardware directly. Every primitive is total: an invalid pin is a logged
//! no-op on the platform side, reads of unsupported channels return 0, and
//! UART reads are best-effort with short reads allowed.

use embedded_hal::delay::DelayNs;

/// Represents a digital input or output level.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    /// Logical low.
    Low,
    /// Logical high.
    High,
}

impl From<bool> for Level {
    fn from(val: bool) -> Self {
        match val {
            true => Self::High,
            false => Self::Low,
        }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> bool {
        match level {
            Level::Low => false,
            Level::High => true,
        }
    }
}

/// Guest-visible pin configuration.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinMode {
    Input,
    Output,
    InputPullUp,
}

/// Platform primitives required by the core.
///
/// Blocking delay comes from the [`DelayNs`] supertrait; `delay_ms(ms)`
/// must block for at least `ms` milliseconds. Tick counters are monotonic
/// modulo 2^32 since platform init.
pub trait Host: DelayNs {
    fn gpio_configure(&mut self, pin: u8, mode: PinMode);
    fn gpio_write(&mut self, pin: u8, level: Level);
    fn gpio_read(&mut self, pin: u8) -> Level;

    /// 0 if `pin` is not ADC-capable.
    fn adc_read(&mut self, pin: u8) -> u16;
    fn pwm_write(&mut self, pin: u8, duty: u8);

    fn tick_ms(&mut self) -> u32;
    fn tick_us(&mut self) -> u32;

    /// Best-effort blocking transmit.
    fn uart_write(&mut self, bytes: &[u8]);

    /// Read up to `buf.len()` bytes, waiting at most `timeout_ms`. Returns
    /// the number of bytes read; 0 means the timeout elapsed with no data.
    fn uart_read(&mut self, buf: &mut [u8], timeout_ms: u32) -> usize;
}
