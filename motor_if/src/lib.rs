//! # Motor Interface Library
//!
//! Data shapes exchanged between the orientation stream and the motor executable.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod orientation;

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use orientation::*;
