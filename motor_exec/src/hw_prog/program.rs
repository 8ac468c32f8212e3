//! # Program assembly
//!
//! Programs are typed instruction lists. The ramp program and its two arithmetic subroutines are
//! assembled here, each subroutine can also be wrapped into a small stand-alone program so it can
//! be exercised on its own.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::fmt;

use super::isa::{Instr as I, Operand, Reg, Tag};
use super::ProgramError;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Parameter registers of the ramp program.
pub mod param {
    /// Start frequency (Hz)
    pub const A: u8 = 0;
    /// Frequency rate (Q12 Hz/s, signed)
    pub const B: u8 = 1;
    /// Ramp duration (Q20 s)
    pub const DURATION: u8 = 2;
    /// First impulse duration (Q20 s)
    pub const T0: u8 = 3;
    /// STEP line GPIO number
    pub const GPIO: u8 = 4;
}

/// Variable registers of the ramp program.
pub mod var {
    /// Current impulse duration (Q20 s)
    pub const T: u8 = 0;
    /// Elapsed time (Q20 s)
    pub const S: u8 = 1;
    pub const ABS_B: u8 = 2;
    /// 1 when `b` is negative
    pub const B_NEG: u8 = 3;
    /// `a` in Q10
    pub const A_Q10: u8 = 4;
    /// Half impulse in microseconds
    pub const HALF_US: u8 = 5;
    /// Frequency (Q10 Hz)
    pub const FREQ: u8 = 6;

    pub const MUL_X: u8 = 10;
    pub const MUL_Y: u8 = 11;
    pub const MUL_HI: u8 = 12;
    pub const MUL_LO: u8 = 13;
    pub const MUL_X0: u8 = 14;
    pub const MUL_X1: u8 = 15;
    pub const MUL_Y0: u8 = 16;
    pub const MUL_Y1: u8 = 17;
    pub const MUL_LL: u8 = 18;
    pub const MUL_MID: u8 = 19;

    pub const ADDC_T0: u8 = 21;
    pub const ADDC_T1: u8 = 22;
    pub const ADDC_A: u8 = 23;
    pub const ADDC_B: u8 = 24;
    pub const ADDC_SUM: u8 = 25;
    pub const ADDC_CARRY: u8 = 26;
}

/// Subroutine and branch labels.
pub mod tag {
    use super::Tag;

    pub const LOOP: Tag = 1;
    pub const END: Tag = 2;
    pub const B_POSITIVE: Tag = 3;
    pub const F_POSITIVE: Tag = 4;
    pub const ADDC: Tag = 100;
    pub const MUL: Tag = 101;
}

/// Microseconds per second, the multiplier converting Q20 seconds into Q20 microseconds.
const MICROS: i32 = 1_000_000;

/// Low half word mask
const LO16: i32 = 0xffff;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A validated program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    instrs: Vec<I>,
    tags: HashMap<Tag, usize>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Program {
    /// Validate an instruction list.
    ///
    /// Tags must be unique, every jump or call must name a defined tag and every register must
    /// exist on the engine.
    pub fn new(instrs: Vec<I>) -> Result<Self, ProgramError> {
        if instrs.is_empty() {
            return Err(ProgramError::Empty);
        }

        let mut tags = HashMap::new();
        for (i, instr) in instrs.iter().enumerate() {
            if let I::Tag(t) = instr {
                if tags.insert(*t, i).is_some() {
                    return Err(ProgramError::DuplicateTag(*t));
                }
            }
        }

        for instr in instrs.iter() {
            if let Some(t) = instr.target() {
                if !tags.contains_key(&t) {
                    return Err(ProgramError::UndefinedTag(t));
                }
            }

            for reg in instr.regs() {
                if !reg.in_range() {
                    return Err(ProgramError::RegisterOutOfRange(reg));
                }
            }
        }

        Ok(Self { instrs, tags })
    }

    pub fn instrs(&self) -> &[I] {
        &self.instrs
    }

    /// Index of the instruction defining the tag.
    pub fn tag_index(&self, tag: Tag) -> Option<usize> {
        self.tags.get(&tag).copied()
    }

    /// Render as script text for the pigpio daemon.
    pub fn to_script(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instr in self.instrs.iter() {
            writeln!(f, "{}", instr)?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn v(i: u8) -> Operand {
    Operand::var(i)
}

fn p(i: u8) -> Operand {
    Operand::param(i)
}

fn c(x: i32) -> Operand {
    Operand::Const(x)
}

fn rv(i: u8) -> Reg {
    Reg::var(i)
}

/// 32 bit add with carry out.
///
/// Inputs `ADDC_A`, `ADDC_B`, outputs `ADDC_SUM` and `ADDC_CARRY` (0 or 1). The carry is the top
/// bit of `(a & b) | ((a | b) & !sum)`, isolated with a rotate and a mask so that it does not
/// matter whether the engine's right rotate fills with the sign bit.
pub fn addc_subroutine() -> Vec<I> {
    use var::*;

    vec![
        I::Tag(tag::ADDC),
        I::Lda(v(ADDC_A)),
        I::Add(v(ADDC_B)),
        I::Sta(rv(ADDC_SUM)),
        I::Xor(c(-1)),
        I::Sta(rv(ADDC_T0)),
        I::Lda(v(ADDC_A)),
        I::Or(v(ADDC_B)),
        I::And(v(ADDC_T0)),
        I::Sta(rv(ADDC_T1)),
        I::Lda(v(ADDC_A)),
        I::And(v(ADDC_B)),
        I::Or(v(ADDC_T1)),
        I::Rra(c(31)),
        I::And(c(1)),
        I::Sta(rv(ADDC_CARRY)),
        I::Ret,
    ]
}

/// Unsigned 32x32 -> 64 bit multiply.
///
/// Inputs `MUL_X`, `MUL_Y`, outputs `MUL_HI:MUL_LO`. Uses 16 bit partial products, the middle
/// sum and the low word each go through `ADDC` to recover their carries. Values are masked before
/// every left rotate and after every right rotate so signed shifts give the same result.
pub fn mul_subroutine() -> Vec<I> {
    use var::*;

    vec![
        I::Tag(tag::MUL),
        // Split into half words
        I::Lda(v(MUL_X)),
        I::And(c(LO16)),
        I::Sta(rv(MUL_X0)),
        I::Lda(v(MUL_X)),
        I::Rra(c(16)),
        I::And(c(LO16)),
        I::Sta(rv(MUL_X1)),
        I::Lda(v(MUL_Y)),
        I::And(c(LO16)),
        I::Sta(rv(MUL_Y0)),
        I::Lda(v(MUL_Y)),
        I::Rra(c(16)),
        I::And(c(LO16)),
        I::Sta(rv(MUL_Y1)),
        // ll = x0 y0, hi = x1 y1
        I::Lda(v(MUL_X0)),
        I::Mlt(v(MUL_Y0)),
        I::Sta(rv(MUL_LL)),
        I::Lda(v(MUL_X1)),
        I::Mlt(v(MUL_Y1)),
        I::Sta(rv(MUL_HI)),
        // mid = x0 y1 + x1 y0, carry into bit 16 of hi
        I::Lda(v(MUL_X0)),
        I::Mlt(v(MUL_Y1)),
        I::Sta(rv(ADDC_A)),
        I::Lda(v(MUL_X1)),
        I::Mlt(v(MUL_Y0)),
        I::Sta(rv(ADDC_B)),
        I::Call(tag::ADDC),
        I::Ld(rv(MUL_MID), v(ADDC_SUM)),
        I::Lda(v(ADDC_CARRY)),
        I::Rla(c(16)),
        I::Add(v(MUL_HI)),
        I::Sta(rv(MUL_HI)),
        // lo = ll + (mid << 16), carry into hi
        I::Lda(v(MUL_MID)),
        I::And(c(LO16)),
        I::Rla(c(16)),
        I::Sta(rv(ADDC_B)),
        I::Ld(rv(ADDC_A), v(MUL_LL)),
        I::Call(tag::ADDC),
        I::Ld(rv(MUL_LO), v(ADDC_SUM)),
        I::Lda(v(MUL_HI)),
        I::Add(v(ADDC_CARRY)),
        I::Sta(rv(MUL_HI)),
        // hi += mid >> 16
        I::Lda(v(MUL_MID)),
        I::Rra(c(16)),
        I::And(c(LO16)),
        I::Add(v(MUL_HI)),
        I::Sta(rv(MUL_HI)),
        I::Ret,
    ]
}

/// Main loop of the ramp program.
///
/// ```text
/// t = t0, S = 0
/// loop:
///     pulse STEP for t (high t/2, low t/2)
///     S += t
///     if S >= duration: end
///     f = (a << 10) +/- ((|b| * S) >> 22)        Q10 Hz
///     if f <= 0: end
///     t = (2^30 + f/2) / f                        Q20 s
/// ```
fn ramp_main() -> Vec<I> {
    use param::*;
    use var::*;

    vec![
        I::Ld(rv(T), p(T0)),
        I::Ld(rv(S), c(0)),
        // |b| and its sign
        I::Lda(p(B)),
        I::Ld(rv(B_NEG), c(0)),
        I::Cmp(c(0)),
        I::Jp(tag::B_POSITIVE),
        I::Ld(rv(B_NEG), c(1)),
        I::Lda(c(0)),
        I::Sub(p(B)),
        I::Tag(tag::B_POSITIVE),
        I::Sta(rv(ABS_B)),
        // a in Q10
        I::Lda(p(A)),
        I::Rla(c(10)),
        I::And(c(-1024)),
        I::Sta(rv(A_Q10)),
        I::Tag(tag::LOOP),
        // Half impulse in microseconds: (t * 10^6) >> 21
        I::Ld(rv(MUL_X), v(T)),
        I::Ld(rv(MUL_Y), c(MICROS)),
        I::Call(tag::MUL),
        I::Lda(v(MUL_HI)),
        I::Rla(c(11)),
        I::And(c(-2048)),
        I::Sta(rv(HALF_US)),
        I::Lda(v(MUL_LO)),
        I::Rra(c(21)),
        I::And(c(2047)),
        I::Or(v(HALF_US)),
        I::Sta(rv(HALF_US)),
        // Pulse
        I::Write(p(GPIO), c(1)),
        I::Mics(v(HALF_US)),
        I::Write(p(GPIO), c(0)),
        I::Mics(v(HALF_US)),
        // Elapsed time
        I::Lda(v(S)),
        I::Add(v(T)),
        I::Sta(rv(S)),
        I::Cmp(p(DURATION)),
        I::Jp(tag::END),
        // Frequency: (|b| * S) >> 22
        I::Ld(rv(MUL_X), v(ABS_B)),
        I::Ld(rv(MUL_Y), v(S)),
        I::Call(tag::MUL),
        I::Lda(v(MUL_HI)),
        I::Rla(c(10)),
        I::And(c(-1024)),
        I::Sta(rv(FREQ)),
        I::Lda(v(MUL_LO)),
        I::Rra(c(22)),
        I::And(c(1023)),
        I::Or(v(FREQ)),
        I::Sta(rv(FREQ)),
        I::Lda(v(B_NEG)),
        I::Cmp(c(0)),
        I::Jz(tag::F_POSITIVE),
        I::Lda(c(0)),
        I::Sub(v(FREQ)),
        I::Sta(rv(FREQ)),
        I::Tag(tag::F_POSITIVE),
        I::Lda(v(FREQ)),
        I::Add(v(A_Q10)),
        I::Sta(rv(FREQ)),
        // Stop at (or below) zero speed
        I::Cmp(c(0)),
        I::Jm(tag::END),
        I::Jz(tag::END),
        // Next impulse, rounded
        I::Lda(v(FREQ)),
        I::Div(c(2)),
        I::Add(c(1 << 30)),
        I::Div(v(FREQ)),
        I::Sta(rv(T)),
        I::Jmp(tag::LOOP),
        I::Tag(tag::END),
        I::Write(p(GPIO), c(0)),
        I::Halt,
    ]
}

/// The complete ramp program.
pub fn ramp_program() -> Result<Program, ProgramError> {
    let mut instrs = ramp_main();
    instrs.extend(addc_subroutine());
    instrs.extend(mul_subroutine());
    Program::new(instrs)
}

/// Stand-alone program computing `p0 * p1` into `v12:v13`.
pub fn mul_harness() -> Result<Program, ProgramError> {
    let mut instrs = vec![
        I::Ld(rv(var::MUL_X), p(0)),
        I::Ld(rv(var::MUL_Y), p(1)),
        I::Call(tag::MUL),
        I::Halt,
    ];
    instrs.extend(addc_subroutine());
    instrs.extend(mul_subroutine());
    Program::new(instrs)
}

/// Stand-alone program computing `p0 + p1` into `v25` with the carry in `v26`.
pub fn addc_harness() -> Result<Program, ProgramError> {
    let mut instrs = vec![
        I::Ld(rv(var::ADDC_A), p(0)),
        I::Ld(rv(var::ADDC_B), p(1)),
        I::Call(tag::ADDC),
        I::Halt,
    ];
    instrs.extend(addc_subroutine());
    Program::new(instrs)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ramp_program_validates() {
        let prog = ramp_program().unwrap();
        assert!(prog.tag_index(tag::MUL).is_some());
        assert!(prog.tag_index(tag::ADDC).is_some());
    }

    #[test]
    fn test_script_text() {
        let script = ramp_program().unwrap().to_script();
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "ld v0 p3");
        assert_eq!(lines[1], "ld v1 0");
        assert!(lines.contains(&"w p4 1"));
        assert!(lines.contains(&"mics v5"));
        assert!(lines.contains(&"and 65535"));
        assert_eq!(lines.iter().filter(|l| l.starts_with("tag ")).count(), 6);
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(Program::new(vec![]), Err(ProgramError::Empty)));
        assert!(matches!(
            Program::new(vec![I::Jmp(9), I::Halt]),
            Err(ProgramError::UndefinedTag(9))
        ));
        assert!(matches!(
            Program::new(vec![I::Tag(1), I::Tag(1)]),
            Err(ProgramError::DuplicateTag(1))
        ));
        assert!(matches!(
            Program::new(vec![I::Lda(Operand::var(200))]),
            Err(ProgramError::RegisterOutOfRange(Reg::Var(200)))
        ));
    }
}
