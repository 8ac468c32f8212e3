//! # Raspberry Pi pins
//!
//! Drives the stepper driver lines through the Pi's GPIO header using `rppal`.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::info;
use rppal::gpio::{Gpio, OutputPin};

use super::{GpioError, Level, MotorPins, PinMap, PinRole};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct RpiPins {
    step: OutputPin,
    dir: OutputPin,
    en: OutputPin,
    m1: OutputPin,
    m2: OutputPin,
    m3: OutputPin,
    slp: Option<OutputPin>,
    rst: Option<OutputPin>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl RpiPins {
    /// Claim every line in the map and configure it as an output.
    ///
    /// The driver is left disabled (EN high) until the motor enables it.
    pub fn new(map: &PinMap) -> Result<Self, GpioError> {
        let gpio = Gpio::new().map_err(|e| GpioError::Init(e.to_string()))?;

        let output = |pin: u8| -> Result<OutputPin, GpioError> {
            let mut p = gpio
                .get(pin)
                .map_err(|e| GpioError::Init(format!("pin {}: {}", pin, e)))?
                .into_output_low();
            p.set_reset_on_drop(false);
            Ok(p)
        };

        let mut pins = Self {
            step: output(map.step)?,
            dir: output(map.dir)?,
            en: output(map.en)?,
            m1: output(map.m1)?,
            m2: output(map.m2)?,
            m3: output(map.m3)?,
            slp: map.slp.map(|p| output(p)).transpose()?,
            rst: map.rst.map(|p| output(p)).transpose()?,
        };

        pins.en.set_high();

        // SLP and RST are active low, hold the driver awake and out of reset
        if let Some(ref mut p) = pins.slp {
            p.set_high();
        }
        if let Some(ref mut p) = pins.rst {
            p.set_high();
        }

        info!("GPIO lines claimed: {:?}", map);

        Ok(pins)
    }

    fn pin(&mut self, role: PinRole) -> Result<&mut OutputPin, GpioError> {
        match role {
            PinRole::Step => Ok(&mut self.step),
            PinRole::Dir => Ok(&mut self.dir),
            PinRole::En => Ok(&mut self.en),
            PinRole::M1 => Ok(&mut self.m1),
            PinRole::M2 => Ok(&mut self.m2),
            PinRole::M3 => Ok(&mut self.m3),
            PinRole::Slp => self.slp.as_mut().ok_or(GpioError::NotConnected(role)),
            PinRole::Rst => self.rst.as_mut().ok_or(GpioError::NotConnected(role)),
        }
    }
}

impl MotorPins for RpiPins {
    fn write(&mut self, role: PinRole, level: Level) -> Result<(), GpioError> {
        let pin = self.pin(role)?;
        match level {
            Level::High => pin.set_high(),
            Level::Low => pin.set_low(),
        }
        Ok(())
    }

    fn read(&mut self, role: PinRole) -> Result<Level, GpioError> {
        let pin = self.pin(role)?;
        Ok(Level::from_bool(pin.is_set_high()))
    }

    fn has(&self, role: PinRole) -> bool {
        match role {
            PinRole::Slp => self.slp.is_some(),
            PinRole::Rst => self.rst.is_some(),
            _ => true,
        }
    }
}
