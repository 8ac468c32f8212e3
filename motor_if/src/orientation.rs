//! # Orientation updates
//!
//! The viewer streams its head orientation as JSON objects carrying a monotonically increasing
//! sequence number and a unit quaternion, e.g.
//!
//! ```json
//! {"number": 12, "orientation": {"x": 0.0, "y": 0.38, "z": 0.0, "w": 0.92}, "time": 3.14}
//! ```
//!
//! `time` is the sender's clock in seconds and is optional.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::{Quaternion as NaQuaternion, UnitQuaternion};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Quaternions whose norm is further than this from one are rejected.
pub const UNIT_NORM_TOLERANCE: f64 = 1e-2;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A single update from the orientation stream.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct OrientationUpdate {
    /// Sequence number, strictly increasing for fresh updates.
    pub number: u64,

    /// The orientation of the viewer.
    pub orientation: Quaternion,

    /// Sender timestamp.
    ///
    /// Units: seconds
    #[serde(default)]
    pub time: Option<f64>,
}

/// Quaternion in the `x, y, z, w` layout used on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Possible parsing errors.
#[derive(Debug, Error)]
pub enum OrientationParseError {
    #[error("Update contains invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("Orientation is not a unit quaternion (norm = {0})")]
    NotUnit(f64),

    #[error("Update timestamp is not finite")]
    InvalidTime,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl OrientationUpdate {
    /// Parse an update from its JSON representation, validating the quaternion.
    pub fn from_json(json: &str) -> Result<Self, OrientationParseError> {
        let update: Self =
            serde_json::from_str(json).map_err(OrientationParseError::InvalidJson)?;

        update.orientation.to_unit()?;

        if let Some(t) = update.time {
            if !t.is_finite() {
                return Err(OrientationParseError::InvalidTime);
            }
        }

        Ok(update)
    }
}

impl Quaternion {
    /// The identity orientation.
    pub fn identity() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }

    /// Convert into a normalised nalgebra quaternion.
    ///
    /// Fails if the wire value is not (close to) a unit quaternion.
    pub fn to_unit(&self) -> Result<UnitQuaternion<f64>, OrientationParseError> {
        let q = NaQuaternion::new(self.w, self.x, self.y, self.z);
        let norm = q.norm();

        if !norm.is_finite() || (norm - 1.0).abs() > UNIT_NORM_TOLERANCE {
            return Err(OrientationParseError::NotUnit(norm));
        }

        Ok(UnitQuaternion::from_quaternion(q))
    }
}

impl From<UnitQuaternion<f64>> for Quaternion {
    fn from(q: UnitQuaternion<f64>) -> Self {
        Self {
            x: q.coords[0],
            y: q.coords[1],
            z: q.coords[2],
            w: q.coords[3],
        }
    }
}
