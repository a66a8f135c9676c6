#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! CockpitVM: an embedded hypervisor core for single-MCU targets.
//!
//! Guest programs are compiled ahead of time to a fixed 32-bit instruction
//! format and executed by a deterministic, statically allocated interpreter
//! that mediates every hardware access through the [`host::Host`] trait.
//! New images arrive over a framed serial protocol into the inactive flash
//! bank and are activated atomically by rewriting the metadata page.
//!
//! A typical boot sequence on the target:
//!
//! 1. Construct a [`flash::BankManager`] over the platform NOR flash and a
//!    [`bootloader::Bootloader`] over the platform host; call `run()`.
//! 2. When the bootloader yields, look up the active bank, map its bytes,
//!    and hand them to [`hypervisor::Hypervisor::load_image`].
//! 3. `execute_program()` until halt, fault, or external reset.
//!
//! The core is `no_std`; the `std` cargo feature only unlocks host-side
//! conveniences and the test suite.

// this mod must go first, so that the others see its macros
mod fmt;

pub mod bootloader;
pub mod engine;
pub mod flash;
pub mod host;
pub mod hypervisor;
pub mod image;
pub mod instruction;
pub mod io;
pub mod memory;
pub mod sim;
pub mod time;

pub use bootloader::{BootError, Bootloader, Outcome};
pub use engine::{Control, ExecutionEngine, RunState};
pub use flash::{Bank, BankManager, BankMetadata, FlashError};
pub use host::{Host, Level, PinMode};
pub use hypervisor::{Hypervisor, Metrics};
pub use image::Program;
pub use instruction::{Instruction, Op};
pub use io::IoController;
pub use memory::MemoryManager;

/// Guest-fatal error kinds shared by the engine, memory manager, I/O
/// controller, and hypervisor.
///
/// Every one of these is fatal to the current run: the engine halts, the
/// error is latched, and the hypervisor reports it once on the serial sink.
/// There is no guest-visible catch; recovery is reset or reload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum VmError {
    StackOverflow,
    StackUnderflow,
    InvalidOpcode,
    /// Control transfer outside `[0, program_length)`.
    InvalidJump,
    DivisionByZero,
    MemoryBounds,
    PrintfArgumentMismatch,
    IOFailure,
    ProgramNotLoaded,
    /// Bad magic, counts, caps, or encoding in a persisted image.
    ImageInvalid,
}
