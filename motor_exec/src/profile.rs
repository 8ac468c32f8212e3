//! # Rotation profile composer
//!
//! Turns a desired platform rotation into a [`MovePlan`], an ordered list of resolution phases
//! each carrying its impulse sequence, and executes plans on a [`Motor`].
//!
//! Planning is completed before any pulse is emitted, so an impossible move is reported without
//! the platform having moved.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::emitter::StepPulseEmitter;
use crate::gpio::{Direction, MicrostepResolution, MotorPins};
use crate::hw_prog::HwProgParams;
use crate::impulse::{ImpulseCache, StepGeometry, StepPeriodSequence, StopRule};
use crate::motor::{Motor, MotorError};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Resolutions used while accelerating through the low speed region, finest first.
const ACCEL_PHASES: [MicrostepResolution; 4] = [
    MicrostepResolution::Sixteenth,
    MicrostepResolution::Eighth,
    MicrostepResolution::Quarter,
    MicrostepResolution::Half,
];

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Calibration and tuning of the composer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ProfileConfig {
    /// Ratio between motor shaft and platform angular acceleration.
    pub inertia_ratio: f64,

    /// Pulse frequency at which the phased ramp moves to the next resolution.
    ///
    /// Units: Hz
    pub phase_switch_frequency: f64,

    /// Resolution used by single ramp, symmetric and hardware moves.
    pub resolution: MicrostepResolution,
}

pub struct RotationProfileComposer {
    config: ProfileConfig,
    geometry: StepGeometry,
    cache: Arc<ImpulseCache>,
    emitter: StepPulseEmitter,
}

/// One part of a move run at a single resolution.
#[derive(Debug, Clone)]
pub struct MovePhase {
    pub resolution: MicrostepResolution,

    /// Pulse frequency rate of this phase.
    ///
    /// Units: Hz/s
    pub k: f64,

    pub sequence: Arc<StepPeriodSequence>,
}

/// A fully planned move.
#[derive(Debug, Clone)]
pub struct MovePlan {
    pub direction: Direction,
    pub phases: Vec<MovePhase>,
}

/// A move to be run by the hardware timing program.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HardwarePlan {
    pub direction: Direction,
    pub resolution: MicrostepResolution,
    pub params: HwProgParams,
}

/// Serialisable description of a [`MovePlan`].
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub direction: Direction,
    pub phases: Vec<PhaseSummary>,
    pub pulses: usize,
    pub duration_s: f64,

    /// Shaft rotation the plan covers.
    ///
    /// Units: radians
    pub shaft_angle_rad: f64,

    /// Platform rotation, the shaft rotation divided by the inertia ratio.
    ///
    /// Units: radians
    pub platform_angle_rad: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub resolution: MicrostepResolution,
    pub k: f64,
    pub pulses: usize,
    pub duration_s: f64,
    pub first_period_s: f64,
    pub last_period_s: f64,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MoveReport {
    pub pulses: usize,
    pub planned_s: f64,
    pub elapsed_s: f64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            inertia_ratio: 1.0,
            phase_switch_frequency: 200.0,
            resolution: MicrostepResolution::Sixteenth,
        }
    }
}

impl RotationProfileComposer {
    pub fn new(
        config: ProfileConfig,
        geometry: StepGeometry,
        cache: Arc<ImpulseCache>,
        emitter: StepPulseEmitter,
    ) -> Self {
        Self {
            config,
            geometry,
            cache,
            emitter,
        }
    }

    pub fn config(&self) -> &ProfileConfig {
        &self.config
    }

    /// Mutable access to the configuration, only possible between moves.
    pub fn config_mut(&mut self) -> &mut ProfileConfig {
        &mut self.config
    }

    pub fn set_inertia_ratio(&mut self, ratio: f64) -> Result<(), MotorError> {
        if !(ratio.is_finite() && ratio > 0.0) {
            return Err(MotorError::InvalidInput(format!(
                "inertia ratio must be positive, got {}",
                ratio
            )));
        }
        self.config.inertia_ratio = ratio;
        info!("Inertia ratio set to {}", ratio);
        Ok(())
    }

    pub fn geometry(&self) -> &StepGeometry {
        &self.geometry
    }

    pub fn cache(&self) -> &Arc<ImpulseCache> {
        &self.cache
    }

    /// Shaft angular acceleration that sweeps `angle` in `duration` from rest.
    ///
    /// Units: rad/s^2
    fn acceleration(&self, angle: f64, duration: f64) -> f64 {
        2.0 * self.config.inertia_ratio * angle.abs() / (duration * duration)
    }

    fn phase(
        &self,
        resolution: MicrostepResolution,
        k: f64,
        t0: f64,
        rule: StopRule,
    ) -> Result<MovePhase, MotorError> {
        Ok(MovePhase {
            resolution,
            k,
            sequence: self.cache.get_or_generate(k, t0, rule)?,
        })
    }

    /// Single ramp accelerating from `start_frequency` so the platform sweeps `angle` radians in
    /// `duration` seconds.
    pub fn plan_single(
        &self,
        angle: f64,
        duration: f64,
        start_frequency: f64,
    ) -> Result<MovePlan, MotorError> {
        validate_move(angle, duration, start_frequency)?;

        let res = self.config.resolution;
        let k = self.geometry.k(self.acceleration(angle, duration), res);

        Ok(MovePlan {
            direction: Direction::from_sign(angle),
            phases: vec![self.phase(
                res,
                k,
                1.0 / start_frequency,
                StopRule::Duration(duration),
            )?],
        })
    }

    /// Ramp the pulse frequency linearly from `start_frequency` to `final_frequency`.
    pub fn plan_accelerate(
        &self,
        direction: Direction,
        start_frequency: f64,
        final_frequency: f64,
        duration: f64,
    ) -> Result<MovePlan, MotorError> {
        validate_move(1.0, duration, start_frequency)?;
        if !(final_frequency.is_finite() && final_frequency > 0.0) {
            return Err(MotorError::InvalidInput(format!(
                "final frequency must be positive, got {} Hz",
                final_frequency
            )));
        }

        let k = (final_frequency - start_frequency) / duration;

        Ok(MovePlan {
            direction,
            phases: vec![self.phase(
                self.config.resolution,
                k,
                1.0 / start_frequency,
                StopRule::Duration(duration),
            )?],
        })
    }

    /// Accelerate through the first half of the angle, then decelerate by the mirror ramp back
    /// towards the start frequency.
    pub fn plan_symmetric(
        &self,
        angle: f64,
        duration: f64,
        start_frequency: f64,
    ) -> Result<MovePlan, MotorError> {
        validate_move(angle, duration, start_frequency)?;

        let res = self.config.resolution;
        let half = duration / 2.0;
        let k = self.geometry.k(self.acceleration(angle / 2.0, half), res);

        let up = self.phase(res, k, 1.0 / start_frequency, StopRule::Duration(half))?;
        let seed = last_period(&up)?;
        let down = self.phase(res, -k, seed, StopRule::Duration(half))?;

        Ok(MovePlan {
            direction: Direction::from_sign(angle),
            phases: vec![up, down],
        })
    }

    /// Symmetric move which passes through the low speed region at fine resolutions.
    ///
    /// Acceleration steps up from 1/16 to 1/2 each time the pulse frequency reaches the phase
    /// switch frequency, runs at full step through the middle of the move, then steps back down
    /// to 1/16. Every resolution change scales the impulse duration so the shaft speed is
    /// continuous.
    ///
    /// The way down retraces the fine resolution phases backwards in time, so it lasts as long
    /// as the way up, covers the same angle and ends at the start frequency. The full step middle
    /// gets whatever duration and angle the fine phases leave, its acceleration solved so the
    /// plan covers the requested angle.
    pub fn plan_phased(
        &self,
        angle: f64,
        duration: f64,
        start_frequency: f64,
    ) -> Result<MovePlan, MotorError> {
        validate_move(angle, duration, start_frequency)?;

        let f_s = self.config.phase_switch_frequency;
        if !(f_s.is_finite() && f_s > 0.0) {
            return Err(MotorError::InvalidInput(format!(
                "phase switch frequency must be positive, got {} Hz",
                f_s
            )));
        }
        if start_frequency >= f_s {
            return Err(MotorError::InvalidInput(format!(
                "start frequency {} Hz must be below the phase switch frequency {} Hz",
                start_frequency, f_s
            )));
        }

        let accel = self.acceleration(angle / 2.0, duration / 2.0);

        // Up through the fine resolutions
        let mut up = Vec::with_capacity(ACCEL_PHASES.len());
        let mut seed = 1.0 / start_frequency;
        for &res in ACCEL_PHASES.iter() {
            let p = self.phase(
                res,
                self.geometry.k(accel, res),
                seed,
                StopRule::PeriodAtMost(1.0 / f_s),
            )?;
            seed = 2.0 * last_period(&p)?;
            up.push(p);
        }
        let down: Vec<MovePhase> = up.iter().rev().map(MovePhase::reversed).collect();

        let forward_time: f64 = up.iter().map(|p| p.sequence.total_duration()).sum();
        let backward_time: f64 = down.iter().map(|p| p.sequence.total_duration()).sum();
        let remainder = middle_budget(duration, forward_time, backward_time)?;

        let ramp_angle: f64 = up
            .iter()
            .chain(down.iter())
            .map(|p| p.shaft_angle(&self.geometry))
            .sum();

        let mut phases = up;

        if remainder > 0.0 {
            let full = MicrostepResolution::Full;
            let half = remainder / 2.0;
            let target = self.config.inertia_ratio * angle.abs() - ramp_angle;

            // Each half of the middle starts at the handover speed and covers half of what is
            // left
            let speed = self.geometry.speed(1.0 / seed, full);
            let middle_accel = (target - 2.0 * speed * half) / (half * half);
            if middle_accel < 0.0 {
                return Err(MotorError::UnreachableAngle {
                    requested: self.config.inertia_ratio * angle.abs(),
                    minimum: ramp_angle + 2.0 * speed * half,
                });
            }

            let cruise_up = self.phase(
                full,
                self.geometry.k(middle_accel, full),
                seed,
                StopRule::Duration(half),
            )?;
            let cruise_down = cruise_up.reversed();
            phases.push(cruise_up);
            phases.push(cruise_down);
        }

        phases.extend(down);

        debug!(
            "Phased plan: {:.3} s up, {:.3} s middle budget, {:.3} s down",
            forward_time, remainder, backward_time
        );

        Ok(MovePlan {
            direction: Direction::from_sign(angle),
            phases,
        })
    }

    /// Parameters for running the single ramp move on the hardware timing program.
    pub fn plan_hardware(
        &self,
        angle: f64,
        duration: f64,
        start_frequency: f64,
        step_gpio: u32,
    ) -> Result<HardwarePlan, MotorError> {
        validate_move(angle, duration, start_frequency)?;

        let res = self.config.resolution;
        let k = self.geometry.k(self.acceleration(angle, duration), res);

        Ok(HardwarePlan {
            direction: Direction::from_sign(angle),
            resolution: res,
            params: HwProgParams::new(start_frequency, k, duration, step_gpio)?,
        })
    }

    /// Emit a plan, switching resolution between phases. Blocks for the length of the move.
    pub fn execute<P: MotorPins>(
        &self,
        motor: &mut Motor<P>,
        plan: &MovePlan,
    ) -> Result<MoveReport, MotorError> {
        if let Some(owner) = motor.owner()? {
            return Err(MotorError::ConcurrencyViolation(owner));
        }

        if !motor.state().enabled {
            motor.enable()?;
        }
        motor.set_direction(plan.direction)?;

        let mut report = MoveReport {
            pulses: 0,
            planned_s: 0.0,
            elapsed_s: 0.0,
        };

        for phase in &plan.phases {
            if motor.state().resolution != phase.resolution {
                motor.set_resolution(phase.resolution)?;
            }

            let r = motor.emit(&self.emitter, &phase.sequence)?;
            report.pulses += r.pulses;
            report.planned_s += r.planned_s;
            report.elapsed_s += r.elapsed_s;
        }

        debug!("Executed move: {:?}", report);

        Ok(report)
    }

    /// Start a hardware plan, returning as soon as the engine has it.
    pub fn execute_hardware<P: MotorPins>(
        &self,
        motor: &mut Motor<P>,
        plan: &HardwarePlan,
    ) -> Result<(), MotorError> {
        if !motor.state().enabled {
            motor.enable()?;
        }
        motor.run_hardware(&plan.params, plan.direction, plan.resolution)
    }

    pub fn rotate_single<P: MotorPins>(
        &self,
        motor: &mut Motor<P>,
        angle: f64,
        duration: f64,
        start_frequency: f64,
    ) -> Result<MoveReport, MotorError> {
        ensure_idle(motor)?;
        let plan = self.plan_single(angle, duration, start_frequency)?;
        self.execute(motor, &plan)
    }

    pub fn accelerate<P: MotorPins>(
        &self,
        motor: &mut Motor<P>,
        direction: Direction,
        start_frequency: f64,
        final_frequency: f64,
        duration: f64,
    ) -> Result<MoveReport, MotorError> {
        ensure_idle(motor)?;
        let plan = self.plan_accelerate(direction, start_frequency, final_frequency, duration)?;
        self.execute(motor, &plan)
    }

    pub fn rotate_symmetric<P: MotorPins>(
        &self,
        motor: &mut Motor<P>,
        angle: f64,
        duration: f64,
        start_frequency: f64,
    ) -> Result<MoveReport, MotorError> {
        ensure_idle(motor)?;
        let plan = self.plan_symmetric(angle, duration, start_frequency)?;
        self.execute(motor, &plan)
    }

    pub fn rotate_phased<P: MotorPins>(
        &self,
        motor: &mut Motor<P>,
        angle: f64,
        duration: f64,
        start_frequency: f64,
    ) -> Result<MoveReport, MotorError> {
        ensure_idle(motor)?;
        let plan = self.plan_phased(angle, duration, start_frequency)?;
        self.execute(motor, &plan)
    }

    /// Describe a plan in a form suitable for archiving.
    pub fn summarise(&self, plan: &MovePlan) -> PlanSummary {
        let phases: Vec<PhaseSummary> = plan
            .phases
            .iter()
            .map(|p| PhaseSummary {
                resolution: p.resolution,
                k: p.k,
                pulses: p.sequence.len(),
                duration_s: p.sequence.total_duration(),
                first_period_s: p.sequence.first().unwrap_or(0.0),
                last_period_s: p.sequence.last().unwrap_or(0.0),
            })
            .collect();

        let shaft_angle_rad = plan
            .phases
            .iter()
            .map(|p| p.shaft_angle(&self.geometry))
            .sum::<f64>()
            * plan.direction.signum();

        PlanSummary {
            direction: plan.direction,
            pulses: phases.iter().map(|p| p.pulses).sum(),
            duration_s: phases.iter().map(|p| p.duration_s).sum(),
            phases,
            shaft_angle_rad,
            platform_angle_rad: shaft_angle_rad / self.config.inertia_ratio,
        }
    }
}

impl MovePhase {
    /// Shaft rotation covered by this phase.
    ///
    /// Units: radians
    pub fn shaft_angle(&self, geometry: &StepGeometry) -> f64 {
        self.sequence.len() as f64 * geometry.rotation_per_pulse(self.resolution)
    }

    /// The same phase run backwards in time, decelerating where this one accelerates.
    pub fn reversed(&self) -> MovePhase {
        let mut periods = self.sequence.periods().to_vec();
        periods.reverse();

        MovePhase {
            resolution: self.resolution,
            k: -self.k,
            sequence: Arc::new(StepPeriodSequence::from_periods(periods)),
        }
    }
}

impl MovePlan {
    pub fn pulses(&self) -> usize {
        self.phases.iter().map(|p| p.sequence.len()).sum()
    }

    /// Units: seconds
    pub fn duration(&self) -> f64 {
        self.phases.iter().map(|p| p.sequence.total_duration()).sum()
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn validate_move(angle: f64, duration: f64, start_frequency: f64) -> Result<(), MotorError> {
    if !(angle.is_finite() && angle != 0.0) {
        return Err(MotorError::InvalidInput(format!(
            "angle must be finite and non-zero, got {}",
            angle
        )));
    }
    if !(duration.is_finite() && duration > 0.0) {
        return Err(MotorError::InvalidInput(format!(
            "duration must be positive, got {} s",
            duration
        )));
    }
    if !(start_frequency.is_finite() && start_frequency > 0.0) {
        return Err(MotorError::InvalidInput(format!(
            "start frequency must be positive, got {} Hz",
            start_frequency
        )));
    }
    Ok(())
}

/// Time left for the full step middle of a phased move once the fine resolution phases are
/// accounted for.
fn middle_budget(duration: f64, forward: f64, backward: f64) -> Result<f64, MotorError> {
    let remainder = duration - forward - backward;
    if remainder < 0.0 {
        return Err(MotorError::UnsatisfiableMove {
            duration,
            needed: forward + backward,
        });
    }
    Ok(remainder)
}

fn last_period(phase: &MovePhase) -> Result<f64, MotorError> {
    phase
        .sequence
        .last()
        .ok_or_else(|| MotorError::InvalidInput("empty impulse sequence".into()))
}

fn ensure_idle<P: MotorPins>(motor: &mut Motor<P>) -> Result<(), MotorError> {
    match motor.owner()? {
        Some(owner) => Err(MotorError::ConcurrencyViolation(owner)),
        None => Ok(()),
    }
}
