//! # Motor Library
//!
//! Drives a stepper motor turning a camera platform: impulse sequence generation, profiled
//! moves, continuous rotation, a hardware timing program for the pigpio daemon, and a command
//! queue that follows an orientation stream.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Motion command queue and the orientation follower feeding it.
pub mod cmd_queue;

/// Software-timed step pulse emitter.
pub mod emitter;

/// Driver line capability and microstep resolution table.
pub mod gpio;

/// Fixed point ramp program and the engines that run it.
pub mod hw_prog;

pub mod impulse;

/// Ownership of the driver and its runtime state.
pub mod motor;

/// Parameters for the motor executable.
pub mod params;

pub mod profile;

/// Constant frequency rotation on a background thread.
pub mod rotator;
