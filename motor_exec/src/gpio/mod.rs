//! # GPIO Module
//!
//! The stepper driver is controlled through a fixed set of digital lines. This module provides a
//! unified interface over those lines so that the motor logic can run against the real Raspberry
//! Pi header or against an in-memory simulation.
//!
//! The line set is a single owned capability: whoever holds the [`MotorPins`] value is the only
//! thing allowed to drive STEP, DIR, EN and the microstep resolution lines.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// In-memory pins used in tests and on non-Pi hosts.
pub mod sim;

/// [`MotorPins`] implementation for the Raspberry Pi GPIO header.
#[cfg(all(target_os = "linux", any(target_arch = "arm", target_arch = "aarch64")))]
pub mod rpi;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::fmt;

pub use sim::{SimPins, SimRecorder};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Trait providing role-addressed access to the stepper driver lines.
pub trait MotorPins: Send + 'static {
    /// Drive the line with the given role to the given level.
    fn write(&mut self, role: PinRole, level: Level) -> Result<(), GpioError>;

    /// Read back the level currently present on the line with the given role.
    fn read(&mut self, role: PinRole) -> Result<Level, GpioError>;

    /// Whether the optional line with this role is wired up.
    fn has(&self, role: PinRole) -> bool {
        !matches!(role, PinRole::Slp | PinRole::Rst)
    }
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Mapping from logical pin roles to BCM GPIO numbers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PinMap {
    pub step: u8,
    pub dir: u8,

    /// Driver enable, active low.
    pub en: u8,

    pub m1: u8,
    pub m2: u8,
    pub m3: u8,

    #[serde(default)]
    pub slp: Option<u8>,

    #[serde(default)]
    pub rst: Option<u8>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Logical role of a driver line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinRole {
    Step,
    Dir,
    En,
    M1,
    M2,
    M3,
    Slp,
    Rst,
}

/// Digital level of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Low,
    High,
}

/// Direction of rotation of the motor shaft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Fraction of a full step executed per STEP pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicrostepResolution {
    Full,
    Half,
    Quarter,
    Eighth,
    Sixteenth,
}

#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    #[error("Could not write {level:?} to the {role:?} line: {reason}")]
    WriteFailed {
        role: PinRole,
        level: Level,
        reason: String,
    },

    #[error("Could not read the {role:?} line: {reason}")]
    ReadFailed { role: PinRole, reason: String },

    #[error("The {0:?} line is not connected")]
    NotConnected(PinRole),

    #[error("Resolution lines read back as {0:?}, which is not a known resolution")]
    UnknownResolution([Level; 3]),

    #[error("Resolution lines read back as {read:?} after setting {expected:?}")]
    ResolutionMismatch {
        expected: MicrostepResolution,
        read: MicrostepResolution,
    },

    #[error("Could not acquire the GPIO peripheral: {0}")]
    Init(String),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl PinMap {
    /// BCM number of the line with the given role, if connected.
    pub fn gpio(&self, role: PinRole) -> Option<u8> {
        match role {
            PinRole::Step => Some(self.step),
            PinRole::Dir => Some(self.dir),
            PinRole::En => Some(self.en),
            PinRole::M1 => Some(self.m1),
            PinRole::M2 => Some(self.m2),
            PinRole::M3 => Some(self.m3),
            PinRole::Slp => self.slp,
            PinRole::Rst => self.rst,
        }
    }
}

impl Level {
    pub fn from_bool(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }

    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => write!(f, "0"),
            Level::High => write!(f, "1"),
        }
    }
}

impl Direction {
    /// Level of the DIR line selecting this direction.
    pub fn dir_level(self) -> Level {
        match self {
            Direction::Forward => Level::Low,
            Direction::Reverse => Level::High,
        }
    }

    /// Direction of a signed quantity, positive values (and zero) map to forward.
    pub fn from_sign(value: f64) -> Self {
        if value < 0.0 {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }

    /// `+1.0` for forward, `-1.0` for reverse.
    pub fn signum(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

impl MicrostepResolution {
    /// All resolutions from coarsest to finest.
    pub const ALL: [MicrostepResolution; 5] = [
        MicrostepResolution::Full,
        MicrostepResolution::Half,
        MicrostepResolution::Quarter,
        MicrostepResolution::Eighth,
        MicrostepResolution::Sixteenth,
    ];

    /// Levels of the (M1, M2, M3) lines selecting this resolution.
    pub fn pins(self) -> [Level; 3] {
        use Level::*;
        match self {
            MicrostepResolution::Full => [Low, Low, Low],
            MicrostepResolution::Half => [High, Low, Low],
            MicrostepResolution::Quarter => [Low, High, Low],
            MicrostepResolution::Eighth => [High, High, Low],
            MicrostepResolution::Sixteenth => [High, High, High],
        }
    }

    /// Decode the (M1, M2, M3) levels, `None` if the pattern is not in the table.
    pub fn from_pins(levels: [Level; 3]) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.pins() == levels)
    }

    /// Fraction of a full step executed per pulse.
    pub fn fraction(self) -> f64 {
        1.0 / self.divisor() as f64
    }

    /// Number of pulses per full step.
    pub fn divisor(self) -> u32 {
        match self {
            MicrostepResolution::Full => 1,
            MicrostepResolution::Half => 2,
            MicrostepResolution::Quarter => 4,
            MicrostepResolution::Eighth => 8,
            MicrostepResolution::Sixteenth => 16,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Read the resolution currently selected on the M1..M3 lines.
///
/// A pattern outside the resolution table leaves the driver in an undefined state and is an
/// error.
pub fn read_resolution<P: MotorPins + ?Sized>(
    pins: &mut P,
) -> Result<MicrostepResolution, GpioError> {
    let levels = [
        pins.read(PinRole::M1)?,
        pins.read(PinRole::M2)?,
        pins.read(PinRole::M3)?,
    ];

    MicrostepResolution::from_pins(levels).ok_or(GpioError::UnknownResolution(levels))
}

/// Select a resolution and verify it by reading the lines back.
pub fn set_resolution<P: MotorPins + ?Sized>(
    pins: &mut P,
    resolution: MicrostepResolution,
) -> Result<(), GpioError> {
    let [m1, m2, m3] = resolution.pins();
    pins.write(PinRole::M1, m1)?;
    pins.write(PinRole::M2, m2)?;
    pins.write(PinRole::M3, m3)?;

    let read = read_resolution(pins)?;
    if read != resolution {
        return Err(GpioError::ResolutionMismatch {
            expected: resolution,
            read,
        });
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_resolution_table_is_bijective() {
        for r in MicrostepResolution::ALL.iter() {
            assert_eq!(MicrostepResolution::from_pins(r.pins()), Some(*r));
        }

        // (L, L, H) is not part of the table
        assert_eq!(
            MicrostepResolution::from_pins([Level::Low, Level::Low, Level::High]),
            None
        );
    }

    #[test]
    fn test_set_resolution_reads_back() {
        let mut pins = SimPins::new();
        set_resolution(&mut pins, MicrostepResolution::Eighth).unwrap();
        assert_eq!(
            read_resolution(&mut pins).unwrap(),
            MicrostepResolution::Eighth
        );
    }

    #[test]
    fn test_stuck_resolution_line_fails_fast() {
        let mut pins = SimPins::new().with_stuck(PinRole::M3, Level::Low);

        match set_resolution(&mut pins, MicrostepResolution::Sixteenth) {
            Err(GpioError::ResolutionMismatch { expected, read }) => {
                assert_eq!(expected, MicrostepResolution::Sixteenth);
                assert_eq!(read, MicrostepResolution::Eighth);
            }
            r => panic!("Expected a resolution mismatch, got {:?}", r),
        }

        // M3 stuck high while selecting full step gives a pattern outside the table
        let mut pins = SimPins::new().with_stuck(PinRole::M3, Level::High);
        assert!(matches!(
            set_resolution(&mut pins, MicrostepResolution::Full),
            Err(GpioError::UnknownResolution(_))
        ));
    }

    #[test]
    fn test_direction_levels() {
        assert_eq!(Direction::Forward.dir_level(), Level::Low);
        assert_eq!(Direction::Reverse.dir_level(), Level::High);
        assert_eq!(Direction::from_sign(-0.1), Direction::Reverse);
        assert_eq!(Direction::from_sign(0.0), Direction::Forward);
    }
}
