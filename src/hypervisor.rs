//! Hypervisor: owns the engine, memory, and I/O for one loaded guest.
//!
//! The coordinator object is constructed once at boot around the platform
//! host and lives for the session. Programs are loaded either from decoded
//! parts (toolchain, tests) or from a persisted image in the active flash
//! bank. Faults halt the guest, are reported once on the serial sink, and
//! recovery is reload or reset.

use crate::engine::ExecutionEngine;
use crate::host::Host;
use crate::image::Program;
use crate::instruction::Instruction;
use crate::io::IoController;
use crate::memory::MemoryManager;
use crate::time::elapsed_ms;
use crate::VmError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Program cap in instructions; defaults to a 32 KB bank of packed
    /// instruction words.
    pub max_program_len: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_program_len: 8192,
        }
    }
}

/// Advisory counters; reading them never perturbs execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Metrics {
    pub instructions_executed: u32,
    pub io_operations: u32,
    pub memory_operations: u32,
    pub elapsed_ms: u32,
}

pub struct Hypervisor<'p, H: Host> {
    config: Config,
    memory: MemoryManager,
    engine: ExecutionEngine,
    io: IoController<H>,
    program: Option<Program<'p>>,
    elapsed_ms: u32,
}

impl<'p, H: Host> Hypervisor<'p, H> {
    pub fn new(host: H) -> Self {
        Self::with_config(host, Config::default())
    }

    pub fn with_config(host: H, config: Config) -> Self {
        Self {
            config,
            memory: MemoryManager::new(),
            engine: ExecutionEngine::new(),
            io: IoController::new(host),
            program: None,
            elapsed_ms: 0,
        }
    }

    /// Load a program from decoded parts and reset all run state.
    pub fn load_program(
        &mut self,
        instructions: &'p [Instruction],
        strings: &'p [&'p str],
    ) -> Result<(), VmError> {
        if instructions.len() as u64 > self.config.max_program_len as u64 {
            return Err(VmError::ImageInvalid);
        }
        let program = Program::from_parts(instructions, strings)?;
        self.install(program);
        Ok(())
    }

    /// Parse and load a persisted image (header, instructions, strings).
    pub fn load_image(&mut self, bytes: &'p [u8]) -> Result<(), VmError> {
        let program = Program::from_image(bytes)?;
        if program.len() > self.config.max_program_len {
            return Err(VmError::ImageInvalid);
        }
        info!(
            "loaded image v{}: {} instructions, {} strings",
            program.version(),
            program.len(),
            program.strings().len() as u32
        );
        self.install(program);
        Ok(())
    }

    fn install(&mut self, program: Program<'p>) {
        self.program = Some(program);
        self.memory.reset();
        self.io.reset();
        self.engine.prepare();
        self.elapsed_ms = 0;
    }

    /// Run until the guest halts or faults.
    pub fn execute_program(&mut self) -> Result<(), VmError> {
        self.run_some(u32::MAX).map(|_| ())
    }

    /// Run at most `budget` instructions. `Ok(true)` means the guest
    /// halted; `Ok(false)` that the budget ran out first. Not guest-visible.
    pub fn execute_with_budget(&mut self, budget: u32) -> Result<bool, VmError> {
        self.run_some(budget)
    }

    /// Execute exactly one instruction.
    pub fn execute_single_step(&mut self) -> Result<bool, VmError> {
        self.run_steps(1)
    }

    fn run_some(&mut self, budget: u32) -> Result<bool, VmError> {
        loop {
            let halted = !self.run_steps(budget)?;
            if halted {
                return Ok(true);
            }
            if budget != u32::MAX {
                return Ok(false);
            }
        }
    }

    /// Step up to `n` times; `Ok(true)` while the guest is still running.
    fn run_steps(&mut self, n: u32) -> Result<bool, VmError> {
        let program = self.program.as_ref().ok_or(VmError::ProgramNotLoaded)?;
        if let Some(e) = self.engine.last_error() {
            // a faulted run stays faulted until reset or reload
            return Err(e);
        }

        let started = self.io.host_mut().tick_ms();
        let mut running = !self.engine.halted();
        let mut fault = None;
        let mut left = n;
        while running && left > 0 {
            match self.engine.step(program, &mut self.memory, &mut self.io) {
                Ok(more) => running = more,
                Err(e) => {
                    fault = Some(e);
                    running = false;
                }
            }
            left -= 1;
        }
        let now = self.io.host_mut().tick_ms();
        self.elapsed_ms = self.elapsed_ms.wrapping_add(elapsed_ms(now, started));

        match fault {
            Some(e) => {
                self.io.emit_fault(e, self.engine.pc());
                Err(e)
            }
            None => Ok(running),
        }
    }

    /// Clear engine, memory, and pin modes; the loaded program is kept.
    pub fn reset(&mut self) {
        self.memory.reset();
        self.io.reset();
        if self.program.is_some() {
            self.engine.prepare();
        } else {
            self.engine.to_idle();
        }
        self.elapsed_ms = 0;
    }

    pub fn clear_program(&mut self) {
        self.program = None;
        self.engine.to_idle();
    }

    pub fn program_loaded(&self) -> bool {
        self.program.is_some()
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            instructions_executed: self.engine.instructions_executed(),
            io_operations: self.io.operation_count(),
            memory_operations: self.memory.operation_count(),
            elapsed_ms: self.elapsed_ms,
        }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn io(&self) -> &IoController<H> {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut IoController<H> {
        &mut self.io
    }
}
