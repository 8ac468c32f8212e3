//! # Impulse duration generator
//!
//! Produces the sequence of step impulse durations that approximates a constant angular
//! acceleration of the motor shaft.
//!
//! Each term `T` of a [`StepPeriodSequence`] is the full duration of one step impulse, the STEP
//! line is held high for `T/2` and low for `T/2`. With `k` the acceleration expressed in pulses
//! per second squared the terms follow
//!
//! ```text
//! T[n+1] = T[n] / (1 + k * T[n]^2)
//! ```
//!
//! which is exactly `1/T[n] = 1/T[0] + k * (T[0] + ... + T[n-1])`, the pulse frequency growing
//! linearly with elapsed time.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

use crate::gpio::MicrostepResolution;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Relative tolerance applied to the cumulative duration when checking a duration rule.
pub const DURATION_TOLERANCE: f64 = 1e-9;

/// Maximum number of terms a single sequence may hold.
pub const MAX_SEQUENCE_LEN: usize = 2_000_000;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Geometry of the stepper motor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StepGeometry {
    /// Number of full steps in one revolution of the shaft.
    pub full_steps_per_rev: u32,
}

/// Ordered, immutable sequence of step impulse durations.
///
/// Units: seconds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepPeriodSequence {
    periods: Vec<f64>,
    total: f64,
}

/// Cache of generated sequences keyed by their exact inputs.
#[derive(Debug)]
pub struct ImpulseCache {
    enabled: bool,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, Arc<StepPeriodSequence>>,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    k: u64,
    rule: (u8, u64),
    t0: u64,
}

/// Counters describing cache usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Condition ending a sequence, checked after each term is appended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StopRule {
    /// Stop once the terms sum to at least this duration (seconds).
    Duration(f64),

    /// Stop once the last term is at most this long (seconds), i.e. the pulse frequency has
    /// risen to `1/p`.
    PeriodAtMost(f64),

    /// Stop once the last term is at least this long (seconds).
    PeriodAtLeast(f64),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ImpulseError {
    #[error("The first impulse duration must be positive and finite (got {0})")]
    InvalidStart(f64),

    #[error("The acceleration must be finite (got {0})")]
    InvalidAcceleration(f64),

    #[error("Invalid stop rule: {0:?}")]
    InvalidRule(StopRule),

    #[error(
        "Deceleration overshoots zero speed after {terms} impulses (last impulse {last} s)"
    )]
    Overshoot { terms: usize, last: f64 },

    #[error("The stop rule {rule:?} is never met from {t0} s with k = {k}")]
    Unbounded { k: f64, t0: f64, rule: StopRule },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl StepGeometry {
    /// Rotation of the shaft for one full step.
    ///
    /// Units: radians
    pub fn rotation_per_step(&self) -> f64 {
        2.0 * PI / self.full_steps_per_rev as f64
    }

    /// Shaft rotation per pulse at the given resolution.
    ///
    /// Units: radians
    pub fn rotation_per_pulse(&self, resolution: MicrostepResolution) -> f64 {
        self.rotation_per_step() * resolution.fraction()
    }

    /// Convert a shaft angular acceleration (rad/s^2) into a pulse frequency rate (Hz/s).
    pub fn k(&self, acceleration: f64, resolution: MicrostepResolution) -> f64 {
        acceleration / self.rotation_per_pulse(resolution)
    }

    /// Convert a pulse frequency (Hz) into a shaft angular speed (rad/s).
    pub fn speed(&self, frequency: f64, resolution: MicrostepResolution) -> f64 {
        frequency * self.rotation_per_pulse(resolution)
    }

    /// Convert a shaft angular speed (rad/s) into a pulse frequency (Hz).
    pub fn frequency(&self, speed: f64, resolution: MicrostepResolution) -> f64 {
        speed / self.rotation_per_pulse(resolution)
    }
}

impl Default for StepGeometry {
    fn default() -> Self {
        Self {
            full_steps_per_rev: 200,
        }
    }
}

impl StopRule {
    fn is_met(&self, last: f64, total: f64) -> bool {
        match *self {
            StopRule::Duration(d) => total >= d * (1.0 - DURATION_TOLERANCE),
            StopRule::PeriodAtMost(p) => last <= p,
            StopRule::PeriodAtLeast(p) => last >= p,
        }
    }

    fn validate(&self) -> Result<(), ImpulseError> {
        let v = match *self {
            StopRule::Duration(v) | StopRule::PeriodAtMost(v) | StopRule::PeriodAtLeast(v) => v,
        };

        if v.is_finite() && v > 0.0 {
            Ok(())
        } else {
            Err(ImpulseError::InvalidRule(*self))
        }
    }

    /// Whether the rule can ever be met starting from `t0` with the given `k`.
    fn reachable(&self, k: f64, t0: f64) -> bool {
        match *self {
            StopRule::Duration(_) => true,
            StopRule::PeriodAtMost(p) => t0 <= p || k > 0.0,
            StopRule::PeriodAtLeast(p) => t0 >= p || k < 0.0,
        }
    }

    fn key(&self) -> (u8, u64) {
        match *self {
            StopRule::Duration(v) => (0, v.to_bits()),
            StopRule::PeriodAtMost(v) => (1, v.to_bits()),
            StopRule::PeriodAtLeast(v) => (2, v.to_bits()),
        }
    }
}

impl StepPeriodSequence {
    /// Build a sequence from already computed durations.
    pub fn from_periods(periods: Vec<f64>) -> Self {
        let total = periods.iter().sum();
        Self { periods, total }
    }

    pub fn periods(&self) -> &[f64] {
        &self.periods
    }

    pub fn len(&self) -> usize {
        self.periods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    pub fn first(&self) -> Option<f64> {
        self.periods.first().copied()
    }

    pub fn last(&self) -> Option<f64> {
        self.periods.last().copied()
    }

    /// Sum of every impulse duration.
    ///
    /// Units: seconds
    pub fn total_duration(&self) -> f64 {
        self.total
    }

    /// Pulse frequency of the final impulse.
    ///
    /// Units: Hz
    pub fn final_frequency(&self) -> Option<f64> {
        self.last().map(|t| 1.0 / t)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, f64> {
        self.periods.iter()
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.periods
    }
}

impl<'a> IntoIterator for &'a StepPeriodSequence {
    type Item = &'a f64;
    type IntoIter = std::slice::Iter<'a, f64>;

    fn into_iter(self) -> Self::IntoIter {
        self.periods.iter()
    }
}

impl ImpulseCache {
    pub fn new() -> Self {
        Self {
            enabled: true,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// A cache which never stores anything, every request is generated afresh.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Return the cached sequence for these inputs, generating and storing it on a miss.
    pub fn get_or_generate(
        &self,
        k: f64,
        t0: f64,
        rule: StopRule,
    ) -> Result<Arc<StepPeriodSequence>, ImpulseError> {
        let key = CacheKey {
            k: k.to_bits(),
            rule: rule.key(),
            t0: t0.to_bits(),
        };

        if self.enabled {
            if let Ok(mut inner) = self.inner.lock() {
                if let Some(seq) = inner.entries.get(&key).cloned() {
                    inner.hits += 1;
                    return Ok(seq);
                }
            }
        }

        let seq = Arc::new(impulse_durations(k, t0, rule)?);

        if let Ok(mut inner) = self.inner.lock() {
            inner.misses += 1;
            if self.enabled {
                inner.entries.insert(key, seq.clone());
            }
        }

        Ok(seq)
    }

    pub fn stats(&self) -> CacheStats {
        match self.inner.lock() {
            Ok(inner) => CacheStats {
                hits: inner.hits,
                misses: inner.misses,
                entries: inner.entries.len(),
            },
            Err(_) => CacheStats {
                hits: 0,
                misses: 0,
                entries: 0,
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for ImpulseCache {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Generate impulse durations from a pulse frequency rate.
///
/// ## Arguments
/// - `k` - Rate of change of the pulse frequency (Hz/s), negative to decelerate
/// - `t0` - Duration of the first impulse (s)
/// - `rule` - When to stop appending terms
pub fn impulse_durations(
    k: f64,
    t0: f64,
    rule: StopRule,
) -> Result<StepPeriodSequence, ImpulseError> {
    if !(t0.is_finite() && t0 > 0.0) {
        return Err(ImpulseError::InvalidStart(t0));
    }
    if !k.is_finite() {
        return Err(ImpulseError::InvalidAcceleration(k));
    }
    rule.validate()?;

    if !rule.reachable(k, t0) {
        return Err(ImpulseError::Unbounded { k, t0, rule });
    }

    let mut periods = Vec::new();
    let mut total = 0.0;
    let mut t = t0;

    loop {
        periods.push(t);
        total += t;

        if rule.is_met(t, total) {
            break;
        }

        if periods.len() >= MAX_SEQUENCE_LEN {
            return Err(ImpulseError::Unbounded { k, t0, rule });
        }

        let denom = 1.0 + k * t * t;
        if denom <= 0.0 {
            return Err(ImpulseError::Overshoot {
                terms: periods.len(),
                last: t,
            });
        }

        t /= denom;
    }

    debug!(
        "Generated {} impulses (k = {:.3} Hz/s, t0 = {:.6} s, {:?}), total {:.6} s",
        periods.len(),
        k,
        t0,
        rule,
        total
    );

    Ok(StepPeriodSequence { periods, total })
}

/// Generate impulse durations for a shaft angular acceleration lasting `duration` seconds.
///
/// ## Arguments
/// - `geometry` - Motor step geometry
/// - `resolution` - Microstep resolution the sequence will be emitted at
/// - `acceleration` - Shaft angular acceleration (rad/s^2)
/// - `duration` - Target cumulative duration (s)
/// - `t0` - Duration of the first impulse (s)
pub fn accelerated_impulse_durations(
    geometry: &StepGeometry,
    resolution: MicrostepResolution,
    acceleration: f64,
    duration: f64,
    t0: f64,
) -> Result<StepPeriodSequence, ImpulseError> {
    impulse_durations(
        geometry.k(acceleration, resolution),
        t0,
        StopRule::Duration(duration),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn full() -> (StepGeometry, MicrostepResolution) {
        (StepGeometry::default(), MicrostepResolution::Full)
    }

    #[test]
    fn test_zero_acceleration_is_constant() {
        let (g, r) = full();
        let seq = accelerated_impulse_durations(&g, r, 0.0, 1.0, 0.01).unwrap();

        assert_eq!(seq.len(), 100);
        assert!(seq.iter().all(|t| *t == 0.01));
    }

    #[test]
    fn test_golden_lengths() {
        let (g, r) = full();

        // k = 200 Hz/s
        let seq = accelerated_impulse_durations(&g, r, 2.0 * PI, 1.0, 0.01).unwrap();
        assert_eq!(seq.len(), 200);
        assert!(seq.total_duration() >= 1.0);

        // k = 3200 Hz/s
        let seq =
            accelerated_impulse_durations(&g, MicrostepResolution::Sixteenth, 2.0 * PI, 1.0, 0.01)
                .unwrap();
        assert_eq!(seq.len(), 1699);
        assert!(seq.total_duration() >= 1.0);
    }

    #[test]
    fn test_monotonicity() {
        let acc = impulse_durations(500.0, 0.01, StopRule::Duration(0.5)).unwrap();
        assert!(acc.periods().windows(2).all(|w| w[1] <= w[0]));

        let dec = impulse_durations(-500.0, acc.last().unwrap(), StopRule::Duration(0.5)).unwrap();
        assert!(dec.periods().windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_frequency_grows_linearly() {
        let k = 1000.0;
        let seq = impulse_durations(k, 0.01, StopRule::Duration(0.5)).unwrap();

        // 1/T[n] = 1/T[0] + k * sum(T[..n])
        let mut elapsed = 0.0;
        for t in seq.iter() {
            let expected = 1.0 / (100.0 + k * elapsed);
            assert!((t - expected).abs() / expected < 1e-9);
            elapsed += t;
        }
    }

    #[test]
    fn test_ramp_symmetry() {
        for &k in [50.0, 200.0].iter() {
            for &d in [0.5, 1.0].iter() {
                let fwd = impulse_durations(k, 0.01, StopRule::Duration(d)).unwrap();
                let back =
                    impulse_durations(-k, fwd.last().unwrap(), StopRule::Duration(d)).unwrap();

                let end = back.last().unwrap();
                assert!(
                    (end - 0.01).abs() / 0.01 < 0.01,
                    "k = {}, d = {}: ramp ended at {}",
                    k,
                    d,
                    end
                );
            }
        }
    }

    #[test]
    fn test_period_rules() {
        let seq = impulse_durations(2000.0, 0.01, StopRule::PeriodAtMost(1.0 / 200.0)).unwrap();
        assert!(seq.last().unwrap() <= 1.0 / 200.0);
        assert!(seq.periods()[seq.len() - 2] > 1.0 / 200.0);

        let seq = impulse_durations(-2000.0, 0.005, StopRule::PeriodAtLeast(0.01)).unwrap();
        assert!(seq.last().unwrap() >= 0.01);

        // The first term may already satisfy the rule
        let seq = impulse_durations(2000.0, 0.001, StopRule::PeriodAtMost(0.005)).unwrap();
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(
            impulse_durations(1.0, 0.0, StopRule::Duration(1.0)),
            Err(ImpulseError::InvalidStart(0.0))
        );
        assert!(matches!(
            impulse_durations(1.0, 0.01, StopRule::Duration(-1.0)),
            Err(ImpulseError::InvalidRule(_))
        ));
        assert!(matches!(
            impulse_durations(0.0, 0.01, StopRule::PeriodAtMost(0.001)),
            Err(ImpulseError::Unbounded { .. })
        ));
        assert!(matches!(
            impulse_durations(f64::NAN, 0.01, StopRule::Duration(1.0)),
            Err(ImpulseError::InvalidAcceleration(_))
        ));
    }

    #[test]
    fn test_overshoot_is_reported() {
        // Decelerating at 1000 Hz/s from 100 Hz reaches zero speed after ~0.1 s
        assert!(matches!(
            impulse_durations(-1000.0, 0.01, StopRule::Duration(1.0)),
            Err(ImpulseError::Overshoot { .. })
        ));
    }

    #[test]
    fn test_cache() {
        let cache = ImpulseCache::new();
        let a = cache
            .get_or_generate(200.0, 0.01, StopRule::Duration(1.0))
            .unwrap();
        let b = cache
            .get_or_generate(200.0, 0.01, StopRule::Duration(1.0))
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );

        // Different rule with the same value is a different entry
        cache
            .get_or_generate(200.0, 0.01, StopRule::PeriodAtMost(1.0))
            .unwrap();
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_disabled_cache() {
        let cache = ImpulseCache::disabled();
        let a = cache
            .get_or_generate(200.0, 0.01, StopRule::Duration(1.0))
            .unwrap();
        let b = cache
            .get_or_generate(200.0, 0.01, StopRule::Duration(1.0))
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a, b);
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().misses, 2);
    }
}
