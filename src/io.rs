//! Arduino-level I/O on top of the [`Host`] trait.
//!
//! The controller owns the host for the hypervisor's lifetime, keeps the
//! guest-visible pin-mode table, renders `printf`, and counts operations for
//! the metrics report. Pin-mode policy is lenient: an operation that does
//! not match the configured mode is performed anyway and logged.

use core::convert::Infallible;
use core::fmt::{self, Write as _};

use embedded_hal::delay::DelayNs;

use crate::host::{Host, Level, PinMode};
use crate::image::StringTable;
use crate::VmError;

pub const MAX_PINS: usize = 64;
pub const MAX_PRINTF_ARGS: usize = 16;

/// Byte stream over the host serial transmit path.
///
/// Implements [`embedded_io::Write`] so host tooling can treat the guest
/// console as an ordinary I/O stream, and [`core::fmt::Write`] for the
/// printf renderer.
pub struct SerialSink<'a, H: Host> {
    host: &'a mut H,
}

impl<H: Host> embedded_io::ErrorType for SerialSink<'_, H> {
    type Error = Infallible;
}

impl<H: Host> embedded_io::Write for SerialSink<'_, H> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.host.uart_write(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<H: Host> fmt::Write for SerialSink<'_, H> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.host.uart_write(s.as_bytes());
        Ok(())
    }
}

/// Mediates every guest hardware access.
pub struct IoController<H: Host> {
    host: H,
    pin_modes: [Option<PinMode>; MAX_PINS],
    operations: u32,
}

impl<H: Host> IoController<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            pin_modes: [None; MAX_PINS],
            operations: 0,
        }
    }

    pub fn pin_mode(&mut self, pin: u8, mode: PinMode) {
        if let Some(slot) = self.pin_modes.get_mut(pin as usize) {
            *slot = Some(mode);
        } else {
            warn!("pinMode on unknown pin {}", pin);
        }
        self.host.gpio_configure(pin, mode);
        self.operations += 1;
    }

    pub fn digital_write(&mut self, pin: u8, level: Level) {
        match self.pin_modes.get(pin as usize) {
            Some(Some(PinMode::Output)) => {}
            _ => debug!("digitalWrite on pin {} not configured as output", pin),
        }
        self.host.gpio_write(pin, level);
        self.operations += 1;
    }

    pub fn digital_read(&mut self, pin: u8) -> i32 {
        self.operations += 1;
        bool::from(self.host.gpio_read(pin)) as i32
    }

    pub fn analog_write(&mut self, pin: u8, duty: u8) {
        self.host.pwm_write(pin, duty);
        self.operations += 1;
    }

    pub fn analog_read(&mut self, pin: u8) -> i32 {
        self.operations += 1;
        self.host.adc_read(pin) as i32
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.host.delay_ms(ms);
        self.operations += 1;
    }

    pub fn millis(&mut self) -> u32 {
        self.operations += 1;
        self.host.tick_ms()
    }

    pub fn micros(&mut self) -> u32 {
        self.operations += 1;
        self.host.tick_us()
    }

    /// 1 while the active-low button reads low.
    pub fn button_pressed(&mut self, pin: u8) -> i32 {
        self.operations += 1;
        (self.host.gpio_read(pin) == Level::Low) as i32
    }

    pub fn button_released(&mut self, pin: u8) -> i32 {
        self.operations += 1;
        (self.host.gpio_read(pin) == Level::High) as i32
    }

    /// Render format string `id` with `args` to the serial sink.
    ///
    /// `args[i]` feeds the i-th conversion. The argument count must match
    /// the conversions in the format string exactly. Supported conversions:
    /// `%d %u %x %c %s %%`; `%s` takes a string id.
    pub fn printf(
        &mut self,
        strings: &StringTable<'_>,
        id: u8,
        args: &[i32],
    ) -> Result<(), VmError> {
        let format = strings.get(id).ok_or(VmError::IOFailure)?;
        if conversion_count(format)? != args.len() {
            return Err(VmError::PrintfArgumentMismatch);
        }

        let bytes = format.as_bytes();
        let mut sink = SerialSink { host: &mut self.host };
        let mut next_arg = 0usize;
        let mut span = 0usize;
        let mut at = 0usize;
        while at < bytes.len() {
            if bytes[at] != b'%' {
                at += 1;
                continue;
            }
            if span < at {
                sink.host.uart_write(&bytes[span..at]);
            }
            // the pre-scan guarantees a conversion byte follows
            let conv = bytes[at + 1];
            let mut arg = || {
                let v = args[next_arg];
                next_arg += 1;
                v
            };
            let rendered = match conv {
                b'd' => write!(sink, "{}", arg()),
                b'u' => write!(sink, "{}", arg() as u32),
                b'x' => write!(sink, "{:x}", arg() as u32),
                b'c' => {
                    sink.host.uart_write(&[arg() as u8]);
                    Ok(())
                }
                b's' => {
                    let sid = arg();
                    let s = u8::try_from(sid)
                        .ok()
                        .and_then(|sid| strings.get(sid))
                        .ok_or(VmError::IOFailure)?;
                    sink.write_str(s)
                }
                _ => {
                    // '%%'
                    sink.host.uart_write(b"%");
                    Ok(())
                }
            };
            rendered.map_err(|_| VmError::IOFailure)?;
            at += 2;
            span = at;
        }
        if span < bytes.len() {
            sink.host.uart_write(&bytes[span..]);
        }
        self.operations += 1;
        Ok(())
    }

    /// One-line fault report, emitted by the hypervisor when a run dies.
    pub fn emit_fault(&mut self, kind: VmError, pc: u32) {
        error!("guest fault {} at pc {}", kind, pc);
        let mut sink = SerialSink { host: &mut self.host };
        let _ = write!(sink, "fault: {:?} at {}\n", kind, pc);
    }

    /// Clear the pin-mode table and the operation counter.
    pub fn reset(&mut self) {
        self.pin_modes = [None; MAX_PINS];
        self.operations = 0;
    }

    pub fn operation_count(&self) -> u32 {
        self.operations
    }

    pub fn configured_mode(&self, pin: u8) -> Option<PinMode> {
        self.pin_modes.get(pin as usize).copied().flatten()
    }

    pub fn sink(&mut self) -> SerialSink<'_, H> {
        SerialSink { host: &mut self.host }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Release the host, ending the controller's ownership.
    pub fn release(self) -> H {
        self.host
    }
}

/// Count conversions in a format string, rejecting malformed ones.
fn conversion_count(format: &str) -> Result<usize, VmError> {
    let bytes = format.as_bytes();
    let mut count = 0usize;
    let mut at = 0usize;
    while at < bytes.len() {
        if bytes[at] == b'%' {
            match bytes.get(at + 1) {
                Some(b'd') | Some(b'u') | Some(b'x') | Some(b'c') | Some(b's') => count += 1,
                Some(b'%') => {}
                _ => return Err(VmError::PrintfArgumentMismatch),
            }
            at += 2;
        } else {
            at += 1;
        }
    }
    Ok(count)
}
