//! # Motor Control Executable
//!
//! This executable drives the stepper motor which turns the camera platform:
//! - `follow`: read orientation updates from stdin and follow them through the command queue
//! - `rotate`: perform a single profiled move
//! - `spin`: rotate continuously at a fixed frequency for a while

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

// External
use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use log::{error, info, trace, warn};
use std::io::BufRead;
use std::str::FromStr;
use std::sync::Arc;
use structopt::{clap::AppSettings, StructOpt};

// Internal
use motor_if::OrientationUpdate;
use motor_lib::{
    cmd_queue::{
        Admission, DrainReport, EmitterExecutor, HardwareExecutor, MotionCommandQueue,
        MotionExecutor, OrientationFollower, QueueError,
    },
    emitter::{Pacing, StepPulseEmitter},
    gpio::{Direction, MotorPins, SimPins},
    hw_prog::{HardwareTimingProgram, PigpioEngine, SimEngine, TimingEngine},
    impulse::ImpulseCache,
    motor::Motor,
    params::{MotorExecParams, TimingMode},
    profile::RotationProfileComposer,
};
use util::{
    archive::Archiver,
    host,
    logger::{logger_init, LevelFilter},
    session::Session,
    time::seconds_to_std,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "motor_exec", about = "Camera platform stepper motor control")]
struct Opt {
    /// Parameter file, relative to the params directory.
    #[structopt(long, default_value = "motor_exec.toml")]
    params: String,

    /// Drive simulated pins and a simulated timing engine instead of the hardware.
    #[structopt(long)]
    sim: bool,

    #[structopt(subcommand)]
    cmd: Command,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
enum Command {
    /// Follow newline-delimited orientation updates read from stdin.
    #[structopt(name = "follow")]
    Follow,

    /// Rotate the platform through an angle in a given time.
    #[structopt(name = "rotate", setting = AppSettings::AllowNegativeNumbers)]
    Rotate {
        /// One of single, symmetric, phased or hardware.
        profile: ProfileKind,

        /// Platform angle in radians, the sign gives the direction.
        angle_rad: f64,

        /// Duration of the move in seconds.
        duration_s: f64,

        /// Pulse frequency the move starts from in Hz.
        #[structopt(long, default_value = "300")]
        start_frequency: f64,
    },

    /// Rotate at a constant pulse frequency.
    #[structopt(name = "spin", setting = AppSettings::AllowNegativeNumbers)]
    Spin {
        /// Pulse frequency in Hz, negative frequencies spin in reverse.
        frequency_hz: f64,

        /// How long to spin for in seconds.
        seconds: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProfileKind {
    Single,
    Symmetric,
    Phased,
    Hardware,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl FromStr for ProfileKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "symmetric" => Ok(Self::Symmetric),
            "phased" => Ok(Self::Phased),
            "hardware" => Ok(Self::Hardware),
            _ => Err(format!(
                "unknown profile {:?}, expected single, symmetric, phased or hardware",
                s
            )),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// MAIN
// ------------------------------------------------------------------------------------------------

fn main() -> Result<()> {
    color_eyre::install()?;

    let opt = Opt::from_args();

    // ---- EARLY INITIALISATION ----

    // Initialise session
    let session = Session::new("motor_exec", "sessions").wrap_err("Failed to create the session")?;

    // Initialise logger
    logger_init(LevelFilter::Trace, &session).wrap_err("Failed to initialise logging")?;

    // Log information on this execution.
    info!("Motor Control Executable\n");
    info!(
        "Running on: {:#?}",
        host::get_uname().wrap_err("Failed to get host information")?
    );
    info!("Session directory: {:?}\n", session.session_root);

    info!("Initialising...");

    // ---- LOAD PARAMETERS ----

    let params: MotorExecParams = util::params::load(&opt.params)
        .wrap_err_with(|| format!("Failed to load parameters from {}", opt.params))?;

    info!("Parameters loaded");

    // ---- RUN ----

    let result = run_on_host(&opt, &params, &session);

    if let Err(ref e) = result {
        error!("Motor executable failed: {:#}", e);
    }

    session.exit();

    result
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

#[cfg(all(target_os = "linux", any(target_arch = "arm", target_arch = "aarch64")))]
fn run_on_host(opt: &Opt, params: &MotorExecParams, session: &Session) -> Result<()> {
    if opt.sim {
        return run(SimPins::new(), opt, params, session);
    }

    let pins = motor_lib::gpio::rpi::RpiPins::new(&params.pins)
        .wrap_err("Failed to acquire the driver lines")?;
    run(pins, opt, params, session)
}

#[cfg(not(all(target_os = "linux", any(target_arch = "arm", target_arch = "aarch64"))))]
fn run_on_host(opt: &Opt, params: &MotorExecParams, session: &Session) -> Result<()> {
    if !opt.sim {
        warn!("This host has no GPIO header, using simulated pins");
    }
    run(SimPins::new(), opt, params, session)
}

fn run<P: MotorPins>(
    pins: P,
    opt: &Opt,
    params: &MotorExecParams,
    session: &Session,
) -> Result<()> {
    let mut motor =
        Motor::new(pins, params.pins.step as u32).wrap_err("Failed to initialise the motor")?;

    let cache = Arc::new(match params.cache_enabled {
        true => ImpulseCache::new(),
        false => ImpulseCache::disabled(),
    });

    // Simulated pins don't need real time pulses
    let emitter = match opt.sim {
        true => StepPulseEmitter::new(Pacing::Unpaced),
        false => StepPulseEmitter::new(Pacing::RealTime),
    };

    info!("Motor initialised");

    let (motor, fault) = match opt.cmd {
        Command::Follow => match params.timing {
            TimingMode::Software => {
                let exec = EmitterExecutor::new(
                    motor,
                    params.geometry,
                    params.follower.resolution,
                    cache,
                    emitter,
                )
                .wrap_err("Failed to prepare the motor for following")?;

                let report = follow(exec, params, session)?;
                (report.executor.into_motor(), report.fault)
            }
            TimingMode::Hardware => {
                attach_engine(&mut motor, opt.sim, params)?;
                let exec = HardwareExecutor::new(
                    motor,
                    params.geometry,
                    params.follower.resolution,
                    params.hw_run_timeout(),
                )
                .wrap_err("Failed to prepare the motor for following")?;

                let report = follow(exec, params, session)?;
                (report.executor.into_motor(), report.fault)
            }
        },
        Command::Rotate {
            profile,
            angle_rad,
            duration_s,
            start_frequency,
        } => {
            let composer =
                RotationProfileComposer::new(params.profile, params.geometry, cache, emitter);
            rotate(
                &mut motor,
                &composer,
                profile,
                angle_rad,
                duration_s,
                start_frequency,
                opt.sim,
                params,
                session,
            )?;
            (motor, None)
        }
        Command::Spin {
            frequency_hz,
            seconds,
        } => {
            spin(&mut motor, params, frequency_hz, seconds)?;
            (motor, None)
        }
    };

    motor
        .shutdown(params.hw_run_timeout())
        .wrap_err("Failed to shut the motor down")?;

    match fault {
        Some(f) => Err(eyre!("Following stopped by a hardware fault: {}", f)),
        None => Ok(()),
    }
}

/// Connect the timing engine and store the ramp program in it.
fn attach_engine<P: MotorPins>(
    motor: &mut Motor<P>,
    sim: bool,
    params: &MotorExecParams,
) -> Result<()> {
    let engine: Box<dyn TimingEngine> = match sim {
        true => Box::new(SimEngine::new(true)),
        false => Box::new(
            PigpioEngine::connect(params.pigpiod_address.as_str()).wrap_err_with(|| {
                format!("Failed to connect to pigpiod at {}", params.pigpiod_address)
            })?,
        ),
    };

    let program = HardwareTimingProgram::new().wrap_err("Failed to assemble the ramp program")?;
    motor
        .attach_engine(engine, &program)
        .wrap_err("Failed to store the ramp program")?;

    info!("Timing engine attached");

    Ok(())
}

/// Feed stdin through the follower into the command queue until stdin closes.
fn follow<E: MotionExecutor>(
    executor: E,
    params: &MotorExecParams,
    session: &Session,
) -> Result<DrainReport<E>> {
    let archiver = Archiver::from_path(session, "motion_commands.csv")
        .wrap_err("Failed to create the motion command archive")?;

    let mut queue = MotionCommandQueue::new(executor, Some(archiver));
    let mut follower = OrientationFollower::new(
        params.follower,
        params.geometry,
        params.profile.inertia_ratio,
    );

    info!("Following orientation updates from stdin");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.wrap_err("Failed to read from stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let update = match OrientationUpdate::from_json(&line) {
            Ok(u) => u,
            Err(e) => {
                warn!("Ignoring malformed orientation update: {}", e);
                continue;
            }
        };

        // Out of order updates must not disturb the follower's state
        if !queue.admits(update.number) {
            warn!(
                "Dropping stale orientation update {} (last accepted {:?})",
                update.number,
                queue.last_seq()
            );
            continue;
        }

        let commands = match follower.update(&update) {
            Ok(c) => c,
            Err(e) => {
                warn!("Ignoring orientation update {}: {}", update.number, e);
                continue;
            }
        };

        match queue.submit(update.number, commands) {
            Ok(Admission::Accepted(n)) => trace!(
                "Update {} queued {} commands ({} pending)",
                update.number,
                n,
                queue.pending()
            ),
            Ok(Admission::Stale { .. }) => (),
            Err(QueueError::WorkerGone) => {
                error!("Queue worker has stopped, no longer following");
                break;
            }
            Err(e) => return Err(e).wrap_err("Failed to queue motion commands"),
        }
    }

    info!("Orientation stream closed, draining queue");

    let report = queue
        .shutdown(params.drain_timeout())
        .wrap_err("Failed to drain the command queue")?;

    info!("Executed {} motion commands", report.executed);

    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn rotate<P: MotorPins>(
    motor: &mut Motor<P>,
    composer: &RotationProfileComposer,
    profile: ProfileKind,
    angle: f64,
    duration: f64,
    start_frequency: f64,
    sim: bool,
    params: &MotorExecParams,
    session: &Session,
) -> Result<()> {
    if profile == ProfileKind::Hardware {
        attach_engine(motor, sim, params)?;

        let plan = composer
            .plan_hardware(angle, duration, start_frequency, motor.step_gpio())
            .wrap_err("Failed to plan the move")?;
        session.save("rotate_plan.json", plan);

        composer
            .execute_hardware(motor, &plan)
            .wrap_err("Failed to start the hardware run")?;
        motor
            .wait_hardware(params.hw_run_timeout() + seconds_to_std(duration))
            .wrap_err("Hardware run did not complete")?;

        info!("Hardware move complete");
        return Ok(());
    }

    let plan = match profile {
        ProfileKind::Single => composer.plan_single(angle, duration, start_frequency),
        ProfileKind::Symmetric => composer.plan_symmetric(angle, duration, start_frequency),
        _ => composer.plan_phased(angle, duration, start_frequency),
    }
    .wrap_err("Failed to plan the move")?;

    let summary = composer.summarise(&plan);
    info!(
        "Planned {} pulses over {:.3} s in {} phases, shaft angle {:.3} rad, platform angle {:.3} rad",
        summary.pulses,
        summary.duration_s,
        summary.phases.len(),
        summary.shaft_angle_rad,
        summary.platform_angle_rad
    );
    session.save("rotate_plan.json", summary);

    let report = composer
        .execute(motor, &plan)
        .wrap_err("Failed to execute the move")?;

    info!(
        "Move complete: {} pulses in {:.3} s (planned {:.3} s)",
        report.pulses, report.elapsed_s, report.planned_s
    );

    Ok(())
}

fn spin<P: MotorPins>(
    motor: &mut Motor<P>,
    params: &MotorExecParams,
    frequency: f64,
    seconds: f64,
) -> Result<()> {
    if seconds.is_nan() || seconds <= 0.0 {
        return Err(eyre!("Spin time must be positive, got {}", seconds));
    }

    motor.set_resolution(params.profile.resolution)?;
    motor.set_direction(Direction::from_sign(frequency))?;
    motor.enable()?;

    motor
        .set_frequency(frequency.abs())
        .wrap_err("Failed to start rotation")?;
    info!("Spinning at {} Hz for {} s", frequency, seconds);

    std::thread::sleep(seconds_to_std(seconds));

    let summary = motor.stop_rotation().wrap_err("Failed to stop rotation")?;
    info!("Rotation stopped after {} pulses", summary.pulses);

    Ok(())
}
