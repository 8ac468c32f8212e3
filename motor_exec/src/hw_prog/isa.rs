//! # Instruction set
//!
//! The coprocessor runs the pigpio daemon's script language: a 32 bit accumulator `A`, a flag
//! register `F`, ten parameters `p0..p9` and 150 variables `v0..v149`. Arithmetic and logic
//! instructions leave their result in `A` and copy it into `F`, `CMP` sets `F = A - x`.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::fmt;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Number of parameter registers.
pub const NUM_PARAMS: usize = 10;

/// Number of variable registers.
pub const NUM_VARS: usize = 150;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Jump target label.
pub type Tag = u32;

/// Register which can be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Var(u8),
    Param(u8),
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Const(i32),
    Reg(Reg),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instr {
    Tag(Tag),

    /// `x = y`
    Ld(Reg, Operand),
    /// `A = x`
    Lda(Operand),
    /// `x = A`
    Sta(Reg),

    Add(Operand),
    Sub(Operand),
    Mlt(Operand),
    Div(Operand),
    Mod(Operand),
    And(Operand),
    Or(Operand),
    Xor(Operand),
    /// Rotate `A` left by `x` bits.
    Rla(Operand),
    /// Rotate `A` right by `x` bits.
    Rra(Operand),
    /// `F = A - x`
    Cmp(Operand),

    Inr(Reg),
    Dcr(Reg),
    Inra,
    Dcra,

    Push(Reg),
    Pop(Reg),

    Jmp(Tag),
    /// Jump if `F == 0`
    Jz(Tag),
    /// Jump if `F != 0`
    Jnz(Tag),
    /// Jump if `F < 0`
    Jm(Tag),
    /// Jump if `F >= 0`
    Jp(Tag),
    Call(Tag),
    Ret,

    /// Write level `y` to GPIO `x`.
    Write(Operand, Operand),
    /// Delay for `x` microseconds.
    Mics(Operand),
    Halt,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Reg {
    pub fn var(i: u8) -> Self {
        Reg::Var(i)
    }

    pub fn param(i: u8) -> Self {
        Reg::Param(i)
    }

    /// Whether the register index exists on the engine.
    pub fn in_range(&self) -> bool {
        match *self {
            Reg::Var(i) => (i as usize) < NUM_VARS,
            Reg::Param(i) => (i as usize) < NUM_PARAMS,
        }
    }
}

impl Operand {
    pub fn var(i: u8) -> Self {
        Operand::Reg(Reg::Var(i))
    }

    pub fn param(i: u8) -> Self {
        Operand::Reg(Reg::Param(i))
    }

    pub fn reg(&self) -> Option<Reg> {
        match *self {
            Operand::Reg(r) => Some(r),
            Operand::Const(_) => None,
        }
    }
}

impl From<i32> for Operand {
    fn from(c: i32) -> Self {
        Operand::Const(c)
    }
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Self {
        Operand::Reg(r)
    }
}

impl Instr {
    /// Jump or call target of this instruction, if any.
    pub fn target(&self) -> Option<Tag> {
        match *self {
            Instr::Jmp(t)
            | Instr::Jz(t)
            | Instr::Jnz(t)
            | Instr::Jm(t)
            | Instr::Jp(t)
            | Instr::Call(t) => Some(t),
            _ => None,
        }
    }

    /// Every register this instruction names.
    pub fn regs(&self) -> Vec<Reg> {
        let (dst, ops): (Option<Reg>, Vec<Operand>) = match *self {
            Instr::Ld(r, o) => (Some(r), vec![o]),
            Instr::Lda(o)
            | Instr::Add(o)
            | Instr::Sub(o)
            | Instr::Mlt(o)
            | Instr::Div(o)
            | Instr::Mod(o)
            | Instr::And(o)
            | Instr::Or(o)
            | Instr::Xor(o)
            | Instr::Rla(o)
            | Instr::Rra(o)
            | Instr::Cmp(o)
            | Instr::Mics(o) => (None, vec![o]),
            Instr::Write(g, l) => (None, vec![g, l]),
            Instr::Sta(r) | Instr::Inr(r) | Instr::Dcr(r) | Instr::Push(r) | Instr::Pop(r) => {
                (Some(r), Vec::new())
            }
            _ => (None, Vec::new()),
        };

        ops.iter().filter_map(Operand::reg).chain(dst).collect()
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Var(i) => write!(f, "v{}", i),
            Reg::Param(i) => write!(f, "p{}", i),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Const(c) => write!(f, "{}", c),
            Operand::Reg(r) => write!(f, "{}", r),
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Tag(t) => write!(f, "tag {}", t),
            Instr::Ld(r, o) => write!(f, "ld {} {}", r, o),
            Instr::Lda(o) => write!(f, "lda {}", o),
            Instr::Sta(r) => write!(f, "sta {}", r),
            Instr::Add(o) => write!(f, "add {}", o),
            Instr::Sub(o) => write!(f, "sub {}", o),
            Instr::Mlt(o) => write!(f, "mlt {}", o),
            Instr::Div(o) => write!(f, "div {}", o),
            Instr::Mod(o) => write!(f, "mod {}", o),
            Instr::And(o) => write!(f, "and {}", o),
            Instr::Or(o) => write!(f, "or {}", o),
            Instr::Xor(o) => write!(f, "xor {}", o),
            Instr::Rla(o) => write!(f, "rla {}", o),
            Instr::Rra(o) => write!(f, "rra {}", o),
            Instr::Cmp(o) => write!(f, "cmp {}", o),
            Instr::Inr(r) => write!(f, "inr {}", r),
            Instr::Dcr(r) => write!(f, "dcr {}", r),
            Instr::Inra => write!(f, "inra"),
            Instr::Dcra => write!(f, "dcra"),
            Instr::Push(r) => write!(f, "push {}", r),
            Instr::Pop(r) => write!(f, "pop {}", r),
            Instr::Jmp(t) => write!(f, "jmp {}", t),
            Instr::Jz(t) => write!(f, "jz {}", t),
            Instr::Jnz(t) => write!(f, "jnz {}", t),
            Instr::Jm(t) => write!(f, "jm {}", t),
            Instr::Jp(t) => write!(f, "jp {}", t),
            Instr::Call(t) => write!(f, "call {}", t),
            Instr::Ret => write!(f, "ret"),
            Instr::Write(g, l) => write!(f, "w {} {}", g, l),
            Instr::Mics(o) => write!(f, "mics {}", o),
            Instr::Halt => write!(f, "halt"),
        }
    }
}
