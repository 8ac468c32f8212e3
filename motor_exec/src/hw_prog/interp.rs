//! # Program interpreter
//!
//! Executes a [`Program`] with the same integer semantics as the coprocessor. Used to verify the
//! ramp program against the floating point generator and to back the simulated timing engine.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use super::isa::{Instr, Operand, Reg, NUM_PARAMS, NUM_VARS};
use super::program::Program;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Default number of instructions a run may execute.
pub const DEFAULT_BUDGET: u64 = 200_000_000;

/// Maximum depth of the call and value stacks.
pub const MAX_STACK: usize = 256;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Receives the program's GPIO writes and delays.
pub trait PulseSink {
    fn write(&mut self, gpio: u32, high: bool);

    fn delay_us(&mut self, micros: u32);
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct Interpreter<'p> {
    program: &'p Program,
    budget: u64,
    shifts: ShiftModel,
}

/// Registers of the machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub a: i32,
    pub f: i32,
    pub p: [i32; NUM_PARAMS],
    pub v: Vec<i32>,

    /// Instructions executed so far.
    pub executed: u64,

    pc: usize,
    stack: Vec<i32>,
    calls: Vec<usize>,
}

/// Sink which discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// How `RLA`/`RRA` treat the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftModel {
    /// True 32 bit rotation.
    Rotate,

    /// Rotation built from shifts of a signed integer, so right shifts fill with the sign bit.
    /// This is what the pigpio daemon does.
    SignedShift,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InterpError {
    #[error("Program takes at most {max} parameters (got {got})")]
    TooManyParams { got: usize, max: usize },

    #[error("Instruction budget of {0} exhausted")]
    BudgetExhausted(u64),

    #[error("Division by zero at instruction {0}")]
    DivideByZero(usize),

    #[error("Stack overflow at instruction {0}")]
    StackOverflow(usize),

    #[error("Stack underflow at instruction {0}")]
    StackUnderflow(usize),

    #[error("Invalid GPIO write at instruction {pc} (gpio {gpio}, level {level})")]
    InvalidWrite { pc: usize, gpio: i32, level: i32 },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<'p> Interpreter<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            budget: DEFAULT_BUDGET,
            shifts: ShiftModel::SignedShift,
        }
    }

    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_shifts(mut self, shifts: ShiftModel) -> Self {
        self.shifts = shifts;
        self
    }

    /// Run to `HALT` (or the end of the program).
    pub fn run<S: PulseSink>(&self, params: &[i32], sink: &mut S) -> Result<Machine, InterpError> {
        self.run_probed(params, sink, |_, _, _| ())
    }

    /// Run, calling `probe` with the machine state before each GPIO write is forwarded to the
    /// sink.
    pub fn run_probed<S, F>(
        &self,
        params: &[i32],
        sink: &mut S,
        mut probe: F,
    ) -> Result<Machine, InterpError>
    where
        S: PulseSink,
        F: FnMut(&Machine, u32, bool),
    {
        if params.len() > NUM_PARAMS {
            return Err(InterpError::TooManyParams {
                got: params.len(),
                max: NUM_PARAMS,
            });
        }

        let mut m = Machine::new(params);
        let instrs = self.program.instrs();

        while m.pc < instrs.len() {
            if m.executed >= self.budget {
                return Err(InterpError::BudgetExhausted(self.budget));
            }
            m.executed += 1;

            let pc = m.pc;
            m.pc += 1;

            match instrs[pc] {
                Instr::Tag(_) => (),
                Instr::Ld(r, o) => {
                    let x = m.get(o);
                    m.set(r, x);
                }
                Instr::Lda(o) => m.a = m.get(o),
                Instr::Sta(r) => m.set(r, m.a),
                Instr::Add(o) => m.acc(m.a.wrapping_add(m.get(o))),
                Instr::Sub(o) => m.acc(m.a.wrapping_sub(m.get(o))),
                Instr::Mlt(o) => m.acc(m.a.wrapping_mul(m.get(o))),
                Instr::Div(o) => {
                    let x = m.get(o);
                    if x == 0 {
                        return Err(InterpError::DivideByZero(pc));
                    }
                    m.acc(m.a.wrapping_div(x))
                }
                Instr::Mod(o) => {
                    let x = m.get(o);
                    if x == 0 {
                        return Err(InterpError::DivideByZero(pc));
                    }
                    m.acc(m.a.wrapping_rem(x))
                }
                Instr::And(o) => m.acc(m.a & m.get(o)),
                Instr::Or(o) => m.acc(m.a | m.get(o)),
                Instr::Xor(o) => m.acc(m.a ^ m.get(o)),
                Instr::Rla(o) => m.acc(self.rotate_left(m.a, m.get(o))),
                Instr::Rra(o) => m.acc(self.rotate_right(m.a, m.get(o))),
                Instr::Cmp(o) => m.f = m.a.wrapping_sub(m.get(o)),
                Instr::Inr(r) => {
                    let x = m.reg(r).wrapping_add(1);
                    m.set(r, x);
                    m.f = x;
                }
                Instr::Dcr(r) => {
                    let x = m.reg(r).wrapping_sub(1);
                    m.set(r, x);
                    m.f = x;
                }
                Instr::Inra => m.acc(m.a.wrapping_add(1)),
                Instr::Dcra => m.acc(m.a.wrapping_sub(1)),
                Instr::Push(r) => {
                    if m.stack.len() >= MAX_STACK {
                        return Err(InterpError::StackOverflow(pc));
                    }
                    let x = m.reg(r);
                    m.stack.push(x);
                }
                Instr::Pop(r) => match m.stack.pop() {
                    Some(x) => m.set(r, x),
                    None => return Err(InterpError::StackUnderflow(pc)),
                },
                Instr::Jmp(t) => m.pc = self.target(t),
                Instr::Jz(t) => {
                    if m.f == 0 {
                        m.pc = self.target(t)
                    }
                }
                Instr::Jnz(t) => {
                    if m.f != 0 {
                        m.pc = self.target(t)
                    }
                }
                Instr::Jm(t) => {
                    if m.f < 0 {
                        m.pc = self.target(t)
                    }
                }
                Instr::Jp(t) => {
                    if m.f >= 0 {
                        m.pc = self.target(t)
                    }
                }
                Instr::Call(t) => {
                    if m.calls.len() >= MAX_STACK {
                        return Err(InterpError::StackOverflow(pc));
                    }
                    m.calls.push(m.pc);
                    m.pc = self.target(t);
                }
                Instr::Ret => match m.calls.pop() {
                    Some(ret) => m.pc = ret,
                    None => return Err(InterpError::StackUnderflow(pc)),
                },
                Instr::Write(g, l) => {
                    let gpio = m.get(g);
                    let level = m.get(l);
                    if gpio < 0 || !(level == 0 || level == 1) {
                        return Err(InterpError::InvalidWrite { pc, gpio, level });
                    }
                    probe(&m, gpio as u32, level == 1);
                    sink.write(gpio as u32, level == 1);
                }
                Instr::Mics(o) => sink.delay_us(m.get(o).max(0) as u32),
                Instr::Halt => break,
            }
        }

        Ok(m)
    }

    /// Tags are checked when the program is built, a missing one ends the program.
    fn target(&self, tag: u32) -> usize {
        self.program
            .tag_index(tag)
            .unwrap_or_else(|| self.program.instrs().len())
    }

    fn rotate_left(&self, a: i32, n: i32) -> i32 {
        let n = (n as u32) & 31;
        match self.shifts {
            ShiftModel::Rotate => a.rotate_left(n),
            ShiftModel::SignedShift if n == 0 => a,
            ShiftModel::SignedShift => a.wrapping_shl(n) | (a >> (32 - n)),
        }
    }

    fn rotate_right(&self, a: i32, n: i32) -> i32 {
        let n = (n as u32) & 31;
        match self.shifts {
            ShiftModel::Rotate => a.rotate_right(n),
            ShiftModel::SignedShift if n == 0 => a,
            ShiftModel::SignedShift => (a >> n) | a.wrapping_shl(32 - n),
        }
    }
}

impl Machine {
    fn new(params: &[i32]) -> Self {
        let mut p = [0; NUM_PARAMS];
        p[..params.len()].copy_from_slice(params);

        Self {
            a: 0,
            f: 0,
            p,
            v: vec![0; NUM_VARS],
            executed: 0,
            pc: 0,
            stack: Vec::new(),
            calls: Vec::new(),
        }
    }

    /// Value of a register.
    pub fn reg(&self, r: Reg) -> i32 {
        match r {
            Reg::Var(i) => self.v[i as usize],
            Reg::Param(i) => self.p[i as usize],
        }
    }

    fn get(&self, o: Operand) -> i32 {
        match o {
            Operand::Const(c) => c,
            Operand::Reg(r) => self.reg(r),
        }
    }

    fn set(&mut self, r: Reg, x: i32) {
        match r {
            Reg::Var(i) => self.v[i as usize] = x,
            Reg::Param(i) => self.p[i as usize] = x,
        }
    }

    /// Store an arithmetic result in `A` and `F`.
    fn acc(&mut self, x: i32) {
        self.a = x;
        self.f = x;
    }
}

impl PulseSink for NullSink {
    fn write(&mut self, _gpio: u32, _high: bool) {}

    fn delay_us(&mut self, _micros: u32) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hw_prog::isa::Instr as I;
    use crate::hw_prog::program::{addc_harness, mul_harness, var};

    /// Small xorshift generator so the test needs no extra crates.
    fn xorshift(state: &mut u32) -> u32 {
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *state = x;
        x
    }

    #[test]
    fn test_mul_subroutine() {
        let prog = mul_harness().unwrap();
        let mut seed = 0x2545_f491;

        let mut cases: Vec<(u32, u32)> = vec![
            (0, 0),
            (1, 1),
            (0xffff_ffff, 0xffff_ffff),
            (0x8000_0000, 2),
            (0xffff, 0x1_0000),
            (1_000_000, 16_384),
        ];
        for _ in 0..500 {
            cases.push((xorshift(&mut seed), xorshift(&mut seed)));
        }

        for shifts in [ShiftModel::Rotate, ShiftModel::SignedShift].iter() {
            let interp = Interpreter::new(&prog).with_shifts(*shifts);
            for &(x, y) in cases.iter() {
                let m = interp.run(&[x as i32, y as i32], &mut NullSink).unwrap();
                let got = (
                    m.v[var::MUL_HI as usize] as u32,
                    m.v[var::MUL_LO as usize] as u32,
                );
                assert_eq!(
                    got,
                    crate::hw_prog::fixed::mul_u32(x, y),
                    "{} * {} ({:?})",
                    x,
                    y,
                    shifts
                );
            }
        }
    }

    #[test]
    fn test_addc_subroutine() {
        let prog = addc_harness().unwrap();
        let cases: [(u32, u32); 5] = [
            (1, 2),
            (0xffff_ffff, 1),
            (0x8000_0000, 0x8000_0000),
            (0x7fff_ffff, 0x7fff_ffff),
            (0xdead_beef, 0x2152_4111),
        ];

        for shifts in [ShiftModel::Rotate, ShiftModel::SignedShift].iter() {
            let interp = Interpreter::new(&prog).with_shifts(*shifts);
            for &(a, b) in cases.iter() {
                let m = interp.run(&[a as i32, b as i32], &mut NullSink).unwrap();
                let (sum, carry) = a.overflowing_add(b);
                assert_eq!(m.v[var::ADDC_SUM as usize] as u32, sum);
                assert_eq!(m.v[var::ADDC_CARRY as usize], carry as i32);
            }
        }
    }

    #[test]
    fn test_flags_and_jumps() {
        // Count p0 down to zero, incrementing v0 each time
        let prog = Program::new(vec![
            I::Tag(1),
            I::Lda(Operand::param(0)),
            I::Cmp(0.into()),
            I::Jz(2),
            I::Dcr(Reg::param(0)),
            I::Inr(Reg::var(0)),
            I::Jmp(1),
            I::Tag(2),
            I::Halt,
        ])
        .unwrap();

        let m = Interpreter::new(&prog).run(&[7], &mut NullSink).unwrap();
        assert_eq!(m.v[0], 7);
        assert_eq!(m.p[0], 0);
    }

    #[test]
    fn test_rotate_models() {
        let prog = Program::new(vec![I::Lda((-2).into()), I::Rra(1.into()), I::Halt]).unwrap();

        let m = Interpreter::new(&prog)
            .with_shifts(ShiftModel::Rotate)
            .run(&[], &mut NullSink)
            .unwrap();
        assert_eq!(m.a, 0x7fff_ffff);

        let m = Interpreter::new(&prog)
            .with_shifts(ShiftModel::SignedShift)
            .run(&[], &mut NullSink)
            .unwrap();
        assert_eq!(m.a, -1);
    }

    #[test]
    fn test_errors() {
        let prog = Program::new(vec![I::Tag(1), I::Jmp(1)]).unwrap();
        assert_eq!(
            Interpreter::new(&prog)
                .with_budget(100)
                .run(&[], &mut NullSink)
                .unwrap_err(),
            InterpError::BudgetExhausted(100)
        );

        let prog = Program::new(vec![I::Lda(1.into()), I::Div(Operand::var(0))]).unwrap();
        assert_eq!(
            Interpreter::new(&prog).run(&[], &mut NullSink).unwrap_err(),
            InterpError::DivideByZero(1)
        );

        let prog = Program::new(vec![I::Ret]).unwrap();
        assert_eq!(
            Interpreter::new(&prog).run(&[], &mut NullSink).unwrap_err(),
            InterpError::StackUnderflow(0)
        );

        let prog = Program::new(vec![I::Halt]).unwrap();
        assert!(matches!(
            Interpreter::new(&prog).run(&[0; 11], &mut NullSink),
            Err(InterpError::TooManyParams { .. })
        ));
    }
}
