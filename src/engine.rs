//! Stack-based bytecode interpreter.
//!
//! One dispatch table, indexed by the raw opcode byte, routes every
//! instruction to a handler with a uniform signature. Handlers never touch
//! the program counter; they return a [`Control`] and the engine alone
//! advances, jumps, or halts. Any handler error is fatal to the run: the
//! engine latches it, halts, and leaves recovery to the hypervisor.

use core::marker::PhantomData;

use heapless::Vec;

use crate::host::{Host, Level, PinMode};
use crate::image::{Program, StringTable};
use crate::instruction::Op;
use crate::io::{IoController, MAX_PRINTF_ARGS};
use crate::memory::MemoryManager;
use crate::VmError;

/// Operand stack capacity in 32-bit cells.
pub const STACK_CELLS: usize = 1024;

/// LIFO operand stack. Underflow and overflow are errors, never silent.
pub struct OperandStack {
    cells: [i32; STACK_CELLS],
    depth: usize,
}

impl OperandStack {
    pub const fn new() -> Self {
        Self {
            cells: [0; STACK_CELLS],
            depth: 0,
        }
    }

    pub fn push(&mut self, value: i32) -> Result<(), VmError> {
        if self.depth == STACK_CELLS {
            return Err(VmError::StackOverflow);
        }
        self.cells[self.depth] = value;
        self.depth += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<i32, VmError> {
        if self.depth == 0 {
            return Err(VmError::StackUnderflow);
        }
        self.depth -= 1;
        Ok(self.cells[self.depth])
    }

    pub fn peek(&self) -> Option<i32> {
        self.depth.checked_sub(1).map(|i| self.cells[i])
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn clear(&mut self) {
        self.depth = 0;
    }
}

impl Default for OperandStack {
    fn default() -> Self {
        Self::new()
    }
}

/// What a handler asks the engine to do with the program counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Control {
    /// Advance to the next instruction.
    Continue,
    /// Transfer to an absolute instruction index.
    Jump(u32),
    /// Stop fetching.
    Halt,
}

/// Engine lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunState {
    Idle,
    Ready,
    Running,
    Halted,
    Faulted,
}

/// Per-instruction view handed to handlers: the operand stack, a read-only
/// copy of the program counter, and the loaded string table.
pub struct ExecFrame<'r, 'p> {
    pub stack: &'r mut OperandStack,
    pub pc: u32,
    pub strings: &'r StringTable<'p>,
}

type Handler<H> = fn(
    &mut ExecFrame<'_, '_>,
    u8,
    u16,
    &mut MemoryManager,
    &mut IoController<H>,
) -> Result<Control, VmError>;

#[allow(unused)]
struct Dispatch<H: Host>(PhantomData<H>);

impl<H: Host> Dispatch<H> {
    const TABLE: [Handler<H>; 256] = Self::build();

    const fn build() -> [Handler<H>; 256] {
        let mut t: [Handler<H>; 256] = [op_invalid::<H>; 256];
        t[Op::Halt as usize] = op_halt::<H>;

        t[Op::Push as usize] = op_push::<H>;
        t[Op::Pop as usize] = op_pop::<H>;
        t[Op::Add as usize] = op_add::<H>;
        t[Op::Sub as usize] = op_sub::<H>;
        t[Op::Mul as usize] = op_mul::<H>;
        t[Op::Div as usize] = op_div::<H>;
        t[Op::Mod as usize] = op_mod::<H>;

        t[Op::Call as usize] = op_call::<H>;
        t[Op::Ret as usize] = op_ret::<H>;

        t[Op::DigitalWrite as usize] = op_digital_write::<H>;
        t[Op::DigitalRead as usize] = op_digital_read::<H>;
        t[Op::AnalogWrite as usize] = op_analog_write::<H>;
        t[Op::AnalogRead as usize] = op_analog_read::<H>;
        t[Op::Delay as usize] = op_delay::<H>;
        t[Op::PinMode as usize] = op_pin_mode::<H>;
        t[Op::ButtonPressed as usize] = op_button_pressed::<H>;
        t[Op::ButtonReleased as usize] = op_button_released::<H>;
        t[Op::Printf as usize] = op_printf::<H>;
        t[Op::Millis as usize] = op_millis::<H>;
        t[Op::Micros as usize] = op_micros::<H>;

        t[Op::Eq as usize] = op_eq::<H>;
        t[Op::Ne as usize] = op_ne::<H>;
        t[Op::Lt as usize] = op_lt::<H>;
        t[Op::Gt as usize] = op_gt::<H>;
        t[Op::Le as usize] = op_le::<H>;
        t[Op::Ge as usize] = op_ge::<H>;
        t[Op::LtS as usize] = op_lt_s::<H>;
        t[Op::GtS as usize] = op_gt_s::<H>;
        t[Op::LeS as usize] = op_le_s::<H>;
        t[Op::GeS as usize] = op_ge_s::<H>;

        t[Op::Jmp as usize] = op_jmp::<H>;
        t[Op::JmpTrue as usize] = op_jmp_true::<H>;
        t[Op::JmpFalse as usize] = op_jmp_false::<H>;

        t[Op::And as usize] = op_and::<H>;
        t[Op::Or as usize] = op_or::<H>;
        t[Op::Xor as usize] = op_xor::<H>;
        t[Op::Not as usize] = op_not::<H>;
        t[Op::Shl as usize] = op_shl::<H>;
        t[Op::Shr as usize] = op_shr::<H>;

        t[Op::LoadGlobal as usize] = op_load_global::<H>;
        t[Op::StoreGlobal as usize] = op_store_global::<H>;
        t[Op::LoadArray as usize] = op_load_array::<H>;
        t[Op::StoreArray as usize] = op_store_array::<H>;
        t[Op::CreateArray as usize] = op_create_array::<H>;
        t
    }
}

/// Fetch-decode-dispatch interpreter state.
pub struct ExecutionEngine {
    stack: OperandStack,
    pc: u32,
    halted: bool,
    last_error: Option<VmError>,
    state: RunState,
    executed: u32,
}

impl ExecutionEngine {
    pub const fn new() -> Self {
        Self {
            stack: OperandStack::new(),
            pc: 0,
            halted: false,
            last_error: None,
            state: RunState::Idle,
            executed: 0,
        }
    }

    /// Arm the engine for a fresh run of the loaded program.
    pub fn prepare(&mut self) {
        self.stack.clear();
        self.pc = 0;
        self.halted = false;
        self.last_error = None;
        self.state = RunState::Ready;
        self.executed = 0;
    }

    /// Drop back to the no-program state.
    pub fn to_idle(&mut self) {
        self.prepare();
        self.state = RunState::Idle;
    }

    /// Execute one instruction. `Ok(true)` means the run continues,
    /// `Ok(false)` that it has halted. A fault halts the engine and is
    /// returned exactly once.
    pub fn step<H: Host>(
        &mut self,
        program: &Program<'_>,
        memory: &mut MemoryManager,
        io: &mut IoController<H>,
    ) -> Result<bool, VmError> {
        if self.halted {
            return Ok(false);
        }
        self.state = RunState::Running;

        let Some(instr) = program.fetch(self.pc) else {
            // ran off the end of the program without a HALT
            return Err(self.fault(VmError::InvalidJump));
        };
        self.executed = self.executed.wrapping_add(1);

        let mut frame = ExecFrame {
            stack: &mut self.stack,
            pc: self.pc,
            strings: program.strings(),
        };
        let handler = Dispatch::<H>::TABLE[instr.opcode as usize];
        match handler(&mut frame, instr.flags, instr.immediate, memory, io) {
            Ok(Control::Continue) => {
                self.pc += 1;
                Ok(true)
            }
            Ok(Control::Jump(target)) => {
                if target >= program.len() {
                    return Err(self.fault(VmError::InvalidJump));
                }
                self.pc = target;
                Ok(true)
            }
            Ok(Control::Halt) => {
                self.halted = true;
                self.state = RunState::Halted;
                Ok(false)
            }
            Err(e) => Err(self.fault(e)),
        }
    }

    fn fault(&mut self, e: VmError) -> VmError {
        self.halted = true;
        self.last_error = Some(e);
        self.state = RunState::Faulted;
        e
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn last_error(&self) -> Option<VmError> {
        self.last_error
    }

    pub fn run_state(&self) -> RunState {
        self.state
    }

    pub fn instructions_executed(&self) -> u32 {
        self.executed
    }

    pub fn stack(&self) -> &OperandStack {
        &self.stack
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ==========
// handlers

fn op_invalid<H: Host>(
    _f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    Err(VmError::InvalidOpcode)
}

fn op_halt<H: Host>(
    _f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    Ok(Control::Halt)
}

fn op_push<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    f.stack.push(imm as i32)?;
    Ok(Control::Continue)
}

fn op_pop<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    f.stack.pop()?;
    Ok(Control::Continue)
}

/// Pop `b` then `a`, push `op(a, b)`.
fn binary(stack: &mut OperandStack, op: fn(i32, i32) -> Result<i32, VmError>) -> Result<Control, VmError> {
    let b = stack.pop()?;
    let a = stack.pop()?;
    stack.push(op(a, b)?)?;
    Ok(Control::Continue)
}

fn op_add<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok(a.wrapping_add(b)))
}

fn op_sub<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok(a.wrapping_sub(b)))
}

fn op_mul<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok(a.wrapping_mul(b)))
}

fn op_div<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| {
        if b == 0 {
            Err(VmError::DivisionByZero)
        } else {
            Ok(a.wrapping_div(b))
        }
    })
}

fn op_mod<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| {
        if b == 0 {
            Err(VmError::DivisionByZero)
        } else {
            Ok(a.wrapping_rem(b))
        }
    })
}

fn op_call<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    // return marker on the operand stack
    f.stack.push(f.pc as i32 + 1)?;
    Ok(Control::Jump(imm as u32))
}

fn op_ret<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let target = f.stack.pop()?;
    Ok(Control::Jump(target as u32))
}

fn op_digital_write<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let level = f.stack.pop()?;
    io.digital_write(imm as u8, Level::from(level != 0));
    Ok(Control::Continue)
}

fn op_digital_read<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let level = io.digital_read(imm as u8);
    f.stack.push(level)?;
    Ok(Control::Continue)
}

fn op_analog_write<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let duty = f.stack.pop()?;
    io.analog_write(imm as u8, duty.clamp(0, 255) as u8);
    Ok(Control::Continue)
}

fn op_analog_read<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let sample = io.analog_read(imm as u8);
    f.stack.push(sample)?;
    Ok(Control::Continue)
}

fn op_delay<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let ms = f.stack.pop()?;
    io.delay_ms(ms.max(0) as u32);
    Ok(Control::Continue)
}

fn op_pin_mode<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let mode = match f.stack.pop()? {
        0 => Some(PinMode::Input),
        1 => Some(PinMode::Output),
        2 => Some(PinMode::InputPullUp),
        other => {
            warn!("unknown pin mode {} ignored", other);
            None
        }
    };
    if let Some(mode) = mode {
        io.pin_mode(imm as u8, mode);
    }
    Ok(Control::Continue)
}

fn op_button_pressed<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let pressed = io.button_pressed(imm as u8);
    f.stack.push(pressed)?;
    Ok(Control::Continue)
}

fn op_button_released<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let released = io.button_released(imm as u8);
    f.stack.push(released)?;
    Ok(Control::Continue)
}

fn op_printf<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let count = f.stack.pop()?;
    let count = usize::try_from(count).map_err(|_| VmError::PrintfArgumentMismatch)?;
    if count > MAX_PRINTF_ARGS {
        return Err(VmError::PrintfArgumentMismatch);
    }
    let mut args: Vec<i32, MAX_PRINTF_ARGS> = Vec::new();
    for _ in 0..count {
        let v = f.stack.pop()?;
        args.push(v).map_err(|_| VmError::PrintfArgumentMismatch)?;
    }
    let id = u8::try_from(imm).map_err(|_| VmError::IOFailure)?;
    io.printf(f.strings, id, &args)?;
    Ok(Control::Continue)
}

fn op_millis<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let now = io.millis();
    f.stack.push(now as i32)?;
    Ok(Control::Continue)
}

fn op_micros<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let now = io.micros();
    f.stack.push(now as i32)?;
    Ok(Control::Continue)
}

fn op_eq<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok((a == b) as i32))
}

fn op_ne<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok((a != b) as i32))
}

fn op_lt<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok(((a as u32) < b as u32) as i32))
}

fn op_gt<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok((a as u32 > b as u32) as i32))
}

fn op_le<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok((a as u32 <= b as u32) as i32))
}

fn op_ge<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok((a as u32 >= b as u32) as i32))
}

fn op_lt_s<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok((a < b) as i32))
}

fn op_gt_s<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok((a > b) as i32))
}

fn op_le_s<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok((a <= b) as i32))
}

fn op_ge_s<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok((a >= b) as i32))
}

fn op_jmp<H: Host>(
    _f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    Ok(Control::Jump(imm as u32))
}

fn op_jmp_true<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let cond = f.stack.pop()?;
    if cond != 0 {
        Ok(Control::Jump(imm as u32))
    } else {
        Ok(Control::Continue)
    }
}

fn op_jmp_false<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let cond = f.stack.pop()?;
    if cond == 0 {
        Ok(Control::Jump(imm as u32))
    } else {
        Ok(Control::Continue)
    }
}

fn op_and<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok(a & b))
}

fn op_or<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok(a | b))
}

fn op_xor<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok(a ^ b))
}

fn op_not<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let a = f.stack.pop()?;
    f.stack.push(!a)?;
    Ok(Control::Continue)
}

fn op_shl<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    binary(f.stack, |a, b| Ok(a.wrapping_shl(b as u32)))
}

fn op_shr<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    _imm: u16,
    _mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    // logical shift on the unsigned reinterpretation
    binary(f.stack, |a, b| Ok(((a as u32).wrapping_shr(b as u32)) as i32))
}

fn op_load_global<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let value = mem.load_global(imm)?;
    f.stack.push(value)?;
    Ok(Control::Continue)
}

fn op_store_global<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let value = f.stack.pop()?;
    mem.store_global(imm, value)?;
    Ok(Control::Continue)
}

fn op_load_array<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let index = f.stack.pop()?;
    let index = u16::try_from(index).map_err(|_| VmError::MemoryBounds)?;
    let value = mem.load_array_element(imm, index)?;
    f.stack.push(value)?;
    Ok(Control::Continue)
}

fn op_store_array<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let value = f.stack.pop()?;
    let index = f.stack.pop()?;
    let index = u16::try_from(index).map_err(|_| VmError::MemoryBounds)?;
    mem.store_array_element(imm, index, value)?;
    Ok(Control::Continue)
}

fn op_create_array<H: Host>(
    f: &mut ExecFrame<'_, '_>,
    _flags: u8,
    imm: u16,
    mem: &mut MemoryManager,
    _io: &mut IoController<H>,
) -> Result<Control, VmError> {
    let size = f.stack.pop()?;
    let size = u16::try_from(size).map_err(|_| VmError::MemoryBounds)?;
    mem.create_array(imm, size)?;
    Ok(Control::Continue)
}
