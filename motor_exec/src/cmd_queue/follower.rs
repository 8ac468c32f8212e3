//! # Orientation follower
//!
//! Converts consecutive orientation samples into motion commands the motor can physically
//! execute. Speeds and accelerations here are those of the motor shaft, platform angles are
//! scaled by the inertia ratio on the way in.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::trace;
use nalgebra::UnitQuaternion;
use serde::{Deserialize, Serialize};

use motor_if::{OrientationParseError, OrientationUpdate};
use util::maths::{clamp, relative_y_rotation};

use super::MotionCommand;
use crate::gpio::{Direction, MicrostepResolution};
use crate::impulse::StepGeometry;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Limits applied when following the orientation stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FollowerParams {
    /// Nominal time between updates, used when the sender gives no timestamps.
    ///
    /// Units: seconds
    pub message_interval_s: f64,

    /// Lowest pulse frequency the motor is driven at, below it the motor is stopped.
    ///
    /// Units: Hz
    pub min_frequency_hz: f64,

    /// Units: Hz
    pub max_frequency_hz: f64,

    /// Units: rad/s^2
    pub max_acceleration: f64,

    /// Resolution the motor runs at while following.
    pub resolution: MicrostepResolution,
}

pub struct OrientationFollower {
    params: FollowerParams,
    geometry: StepGeometry,
    inertia_ratio: f64,

    last_orientation: Option<UnitQuaternion<f64>>,
    last_time: Option<f64>,

    /// Shaft speed reached at the end of the last issued command, zero when stopped.
    ///
    /// Units: rad/s
    speed: f64,

    /// Shaft angle requested but not yet covered by issued commands.
    ///
    /// Units: radians
    accumulated: f64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for FollowerParams {
    fn default() -> Self {
        Self {
            message_interval_s: 0.1,
            min_frequency_hz: 300.0,
            max_frequency_hz: 15000.0,
            max_acceleration: 50.0,
            resolution: MicrostepResolution::Sixteenth,
        }
    }
}

impl OrientationFollower {
    pub fn new(params: FollowerParams, geometry: StepGeometry, inertia_ratio: f64) -> Self {
        Self {
            params,
            geometry,
            inertia_ratio,
            last_orientation: None,
            last_time: None,
            speed: 0.0,
            accumulated: 0.0,
        }
    }

    /// Shaft speed at the end of the last issued command.
    ///
    /// Units: rad/s
    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn params(&self) -> &FollowerParams {
        &self.params
    }

    fn min_speed(&self) -> f64 {
        self.geometry
            .speed(self.params.min_frequency_hz, self.params.resolution)
    }

    fn max_speed(&self) -> f64 {
        self.geometry
            .speed(self.params.max_frequency_hz, self.params.resolution)
    }

    /// Consume one orientation sample, returning the commands to enqueue (possibly none).
    pub fn update(
        &mut self,
        update: &OrientationUpdate,
    ) -> Result<Vec<MotionCommand>, OrientationParseError> {
        let orientation = update.orientation.to_unit()?;

        let dt = match (update.time, self.last_time) {
            (Some(now), Some(last)) if now > last => now - last,
            _ => self.params.message_interval_s,
        };
        if update.time.is_some() {
            self.last_time = update.time;
        }

        let last = match self.last_orientation.replace(orientation) {
            Some(q) => q,
            None => return Ok(Vec::new()),
        };

        self.accumulated += relative_y_rotation(&last, &orientation) * self.inertia_ratio;

        let commands = self.plan(dt);
        for c in &commands {
            trace!("Follower command {:?}", c);
        }

        Ok(commands)
    }

    fn plan(&mut self, dt: f64) -> Vec<MotionCommand> {
        let min_speed = self.min_speed();
        let max_speed = self.max_speed();
        let max_accel = self.params.max_acceleration;

        let target = clamp(self.accumulated / dt, -max_speed, max_speed);
        let accel = clamp((target - self.speed) / dt, -max_accel, max_accel);
        let last = self.speed;

        // Remove the angle this update's motion covers, ignoring what is left inside the deadzone
        self.accumulated -= last * dt + accel * dt * dt / 2.0;
        if self.accumulated.abs() < min_speed * self.params.message_interval_s {
            self.accumulated = 0.0;
        }

        let mut out = Vec::with_capacity(2);

        if last == 0.0 {
            if target.abs() < min_speed {
                return out;
            }

            // Start from rest at the floor speed
            let start = min_speed.copysign(target);
            let (accel, t) = match time_to(start, target, accel, dt) {
                t if t > 0.0 => (accel, t),
                _ => (0.0, dt),
            };
            out.push(self.segment(start, accel, t));
            self.speed = start + accel * t;
        } else if target.abs() < min_speed {
            // Slow to the floor and stop there
            let t = time_to(last, min_speed.copysign(last), accel, dt);
            if t > 0.0 {
                out.push(self.segment(last, accel, t));
            }
            self.speed = 0.0;
        } else if last * target < 0.0 {
            // Reversal, slow to the floor then accelerate away from it in the new direction
            let t_dec = time_to(last, min_speed.copysign(last), accel, f64::INFINITY);

            if t_dec >= dt {
                out.push(self.segment(last, accel, dt));
                self.speed = last + accel * dt;
            } else {
                if t_dec > 0.0 {
                    out.push(self.segment(last, accel, t_dec));
                }

                let start = min_speed.copysign(target);
                let t_acc = time_to(start, target, accel, dt - t_dec);
                if t_acc > 0.0 {
                    out.push(self.segment(start, accel, t_acc));
                }
                self.speed = start + accel * t_acc;
            }
        } else {
            out.push(self.segment(last, accel, dt));
            self.speed = last + accel * dt;
        }

        out
    }

    /// Command moving from the signed shaft speed `from` with signed acceleration `accel`.
    fn segment(&self, from: f64, accel: f64, duration: f64) -> MotionCommand {
        let direction = Direction::from_sign(from);

        MotionCommand {
            direction,
            acceleration: accel * direction.signum(),
            start_frequency: self.geometry.frequency(from.abs(), self.params.resolution),
            duration,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Time for a constant acceleration to take the speed from `from` to `to`, clamped to
/// `[0, limit]`. Zero when the acceleration points away from `to` or is zero.
fn time_to(from: f64, to: f64, accel: f64, limit: f64) -> f64 {
    if accel == 0.0 {
        return 0.0;
    }
    clamp((to - from) / accel, 0.0, limit)
}

#[cfg(test)]
mod test {
    use super::*;
    use motor_if::Quaternion;

    fn sample(number: u64, yaw: f64, time: Option<f64>) -> OrientationUpdate {
        OrientationUpdate {
            number,
            orientation: Quaternion {
                x: 0.0,
                y: (yaw / 2.0).sin(),
                z: 0.0,
                w: (yaw / 2.0).cos(),
            },
            time,
        }
    }

    fn follower() -> OrientationFollower {
        OrientationFollower::new(FollowerParams::default(), StepGeometry::default(), 1.0)
    }

    /// Feed yaw increments, returning the commands issued for each.
    fn feed(f: &mut OrientationFollower, steps: &[f64]) -> Vec<Vec<MotionCommand>> {
        let mut yaw = 0.0;
        steps
            .iter()
            .enumerate()
            .map(|(i, d)| {
                yaw += d;
                f.update(&sample(i as u64, yaw, None)).unwrap()
            })
            .collect()
    }

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_starts_from_rest_at_floor() {
        let mut f = follower();
        let out = feed(&mut f, &[0.0, 0.2]);

        assert!(out[0].is_empty());
        assert_eq!(out[1].len(), 1);

        // Target 2 rad/s, 20 rad/s^2 from the floor of 300 Hz
        let c = out[1][0];
        assert_eq!(c.direction, Direction::Forward);
        assert!(close(c.acceleration, 20.0, 1e-9));
        assert!(close(c.start_frequency, 300.0, 1e-9));
        assert!(close(c.duration, 0.070548, 1e-5));
        assert!(close(f.speed(), 2.0, 1e-9));
    }

    #[test]
    fn test_acceleration_is_clamped() {
        let mut f = follower();
        let out = feed(&mut f, &[0.0, 2.0]);

        let c = out[1][0];
        assert!(close(c.acceleration, 50.0, 1e-9));
        assert!(close(c.duration, 0.1, 1e-12));
    }

    #[test]
    fn test_deadzone_suppresses_small_motion() {
        let mut f = follower();
        let out = feed(&mut f, &[0.01; 10]);

        assert!(out.iter().all(|c| c.is_empty()));
        assert_eq!(f.speed(), 0.0);
    }

    #[test]
    fn test_reversal_is_split() {
        let mut f = follower();
        let out = feed(&mut f, &[0.0, 0.2, 0.2, 0.2, -0.2]);

        let same = &out[2];
        assert_eq!(same.len(), 1);
        assert!(close(same[0].acceleration, 10.0, 1e-9));
        assert!(close(same[0].start_frequency, 1018.59, 0.01));

        let rev = &out[4];
        assert_eq!(rev.len(), 2);

        assert_eq!(rev[0].direction, Direction::Forward);
        assert!(rev[0].acceleration < 0.0);

        assert_eq!(rev[1].direction, Direction::Reverse);
        assert!(rev[1].acceleration > 0.0);
        assert!(close(rev[1].start_frequency, 300.0, 1e-9));

        assert!(rev[0].duration + rev[1].duration <= 0.1 + 1e-12);
        assert!(close(f.speed(), -2.0, 1e-9));
    }

    #[test]
    fn test_slows_to_stop() {
        let mut f = follower();
        let out = feed(
            &mut f,
            &[0.0, 0.2, 0.2, 0.2, -0.2, -0.2, 0.0, 0.0, 0.0, 0.0],
        );

        let stop = &out[9];
        assert_eq!(stop.len(), 1);
        assert_eq!(stop[0].direction, Direction::Forward);
        assert!(stop[0].acceleration < 0.0);
        assert!(close(stop[0].duration, 0.05288, 1e-4));
        assert_eq!(f.speed(), 0.0);
    }

    #[test]
    fn test_uses_sender_timestamps() {
        let mut f = follower();
        f.update(&sample(0, 0.0, Some(10.0))).unwrap();
        let out = f.update(&sample(1, 0.2, Some(10.2))).unwrap();

        // 1 rad/s over 0.2 s gives 5 rad/s^2
        assert!(close(out[0].acceleration, 5.0, 1e-9));
        assert!(close(out[0].duration, (1.0 - 0.589049) / 5.0, 1e-5));
    }
}
