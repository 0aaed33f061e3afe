//! Main balance control executable entry point.
//!
//! # Architecture
//!
//! The executable runs the balance controller against a linear inverted
//! pendulum in place of a robot:
//!
//!     - Initialise the session, logging and parameters
//!     - Start the plan and tuning publishers
//!     - Main loop:
//!         - Read the state estimate from the pendulum
//!         - Apply the scripted push
//!         - Balance control processing
//!         - Drive the pendulum with the desired CMP
//!         - Land the swing foot at touchdown
//!         - Write archives
//!
//! A demo plan file can be given as the only argument, otherwise
//! `demo_plan.toml` is loaded from the parameters directory.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{eyre::{eyre, WrapErr}, Report};
use log::{debug, info, warn};
use nalgebra::Vector2;
use serde::Deserialize;
use std::env;
use std::thread;
use std::time::{Duration, Instant};

// Internal
use bal_lib::{
    bal_ctrl::{self, BalCtrl, BalCtrlError, InputData, WalkingPhase, PHASE_TIME_TOLERANCE_S},
    footstep::{Feet, Footstep, FootstepPlan},
    icp_opt,
    lipm::Lipm
};
use util::{
    archive::Archived,
    logger::{logger_init, LevelFilter},
    module::State,
    session::Session,
    snapshot::{snapshot_channel, SnapshotSender}
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// How often the tuning file is checked for changes.
const TUNING_POLL_PERIOD_S: f64 = 1.0;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The scripted demo.
#[derive(Debug, Deserialize)]
struct DemoParams {
    /// Length of the run in controller time.
    ///
    /// Units: seconds
    duration_s: f64,

    /// Time the plan is published.
    ///
    /// Units: seconds
    plan_time_s: f64,

    /// Units: seconds
    push_time_s: f64,

    /// Change in CoM velocity applied by the push.
    ///
    /// Units: meters/second
    push_velocity_mps: [f64; 2],

    /// Initial foot poses.
    feet: Feet,

    plan: FootstepPlan
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {

    color_eyre::install()?;

    // ---- EARLY INITIALISATION ----

    let session = Session::new(
        "bal_exec",
        "sessions"
    ).wrap_err("Failed to create the session")?;

    logger_init(LevelFilter::Debug, &session)
        .wrap_err("Failed to initialise logging")?;

    info!("ICP Balance Control Executable\n");
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let params: bal_ctrl::Params = util::params::load("bal_ctrl.toml")
        .wrap_err("Could not load balance control params")?;
    let opt_params: icp_opt::Params = util::params::load("icp_opt.toml")
        .wrap_err("Could not load ICP optimisation params")?;

    let args: Vec<String> = env::args().collect();
    debug!("CLI arguments: {:?}", args);

    let demo: DemoParams = match args.len() {
        1 => util::params::load::<DemoParams>("demo_plan.toml"),
        2 => {
            info!("Loading demo from \"{}\"", &args[1]);
            util::params::load_path::<DemoParams, _>(&args[1])
        },
        n => return Err(eyre!("Expected zero or one argument, found {}", n - 1))
    }.wrap_err("Could not load the demo plan")?;

    info!(
        "Demo lasts {:.02} s with {} steps, push of {:?} m/s at {:.02} s",
        demo.duration_s, demo.plan.steps.len(), demo.push_velocity_mps, demo.push_time_s
    );

    // ---- INITIALISE MODULES ----

    let (plan_tx, plan_rx) = snapshot_channel();
    let (tuning_tx, tuning_rx) = snapshot_channel();

    let control_dt_s = params.control_dt_s;
    let omega_rps = params.omega_rps();

    let mut bal_ctrl = BalCtrl::new(params, opt_params.clone())
        .wrap_err("Failed to initialise BalCtrl")?
        .with_plan_channel(plan_rx)
        .with_tuning_channel(tuning_rx);
    bal_ctrl.init_archive(&session)
        .wrap_err("Failed to initialise BalCtrl archive")?;
    info!("BalCtrl init complete");

    spawn_tuning_watcher(tuning_tx, opt_params);

    let mut feet = demo.feet;
    let mut lipm = Lipm::at_rest(omega_rps, feet.mid_point());
    let mut plan = Some(demo.plan);
    let mut pushed = false;

    // Step being swung and where it was last commanded to land
    let mut landing: Option<Footstep> = None;

    // ---- MAIN LOOP ----

    info!("Begining main loop\n");

    let num_cycles = (demo.duration_s / control_dt_s).ceil() as u64;

    for cycle in 0..num_cycles {

        let cycle_start_instant = Instant::now();
        let time_s = cycle as f64 * control_dt_s;

        // ---- SCRIPT ----

        if time_s >= demo.plan_time_s {
            if let Some(p) = plan.take() {
                info!("Publishing plan of {} steps", p.steps.len());
                plan_tx.publish(p)
                    .map_err(|_| eyre!("BalCtrl plan channel closed"))?;
            }
        }

        if !pushed && time_s >= demo.push_time_s {
            let push = Vector2::new(demo.push_velocity_mps[0], demo.push_velocity_mps[1]);
            info!("Pushing with {:?} m/s", push);
            lipm.push(push);
            pushed = true;
        }

        // ---- STATE ESTIMATE ----

        // The swing foot is on the ground by the time the swing ends
        if let (Some(step), Some(end_s)) = (landing, bal_ctrl.swing_end_time_s()) {
            if time_s >= end_s - PHASE_TIME_TOLERANCE_S {
                info!(
                    "Step {} landed at ({:.3}, {:.3})",
                    step.step_index, step.pose.position_m[0], step.pose.position_m[1]
                );
                feet.set(step.side, step.pose);
                landing = None;
            }
        }

        let input = InputData {
            time_s,
            icp_m: lipm.icp_m(),
            com_m: lipm.com_m,
            com_velocity_mps: lipm.com_velocity_mps,
            feet,
            replan_requested: false
        };

        // ---- CONTROL ALGORITHM PROCESSING ----

        let cmd = match bal_ctrl.proc(&input) {
            Ok((cmd, report)) => {
                if !report.feasible {
                    warn!("BalCtrl infeasible at {:.3} s ({:?})", time_s, report.solver_status);
                }
                cmd
            },
            Err(BalCtrlError::InvalidEstimate(t)) => {
                warn!("Invalid estimate at {} s, using fallback command", t);
                *bal_ctrl.last_output()
            },
            Err(e) => return Err(e).wrap_err("BalCtrl processing failed")
        };

        // ---- PLANT ----

        lipm.step(&cmd.desired_cmp_m, control_dt_s);

        if let (WalkingPhase::SingleSupport { .. }, Some(step)) = (cmd.phase, cmd.adjusted_footstep) {
            landing = Some(step);
        }

        // ---- WRITE ARCHIVES ----

        if let Err(e) = bal_ctrl.write() {
            warn!("Could not write BalCtrl archive: {}", e);
        }

        // ---- CYCLE MANAGEMENT ----

        let cycle_dur = Instant::now() - cycle_start_instant;

        match Duration::from_secs_f64(control_dt_s).checked_sub(cycle_dur) {
            Some(d) => thread::sleep(d),
            None => warn!(
                "Cycle overran by {:.06} s",
                cycle_dur.as_secs_f64() - control_dt_s
            )
        }
    }

    // ---- SHUTDOWN ----

    let report = bal_ctrl.last_report();
    info!(
        "Final ICP error {:.4} m, {} overruns, max jitter {:.06} s",
        report.icp_error_norm_m, report.num_overruns, report.max_jitter_s
    );
    info!("End of execution");

    Ok(())
}

/// Start a thread which republishes the ICP optimisation parameters whenever
/// `icp_opt.toml` changes.
fn spawn_tuning_watcher(tx: SnapshotSender<icp_opt::Params>, initial: icp_opt::Params) {
    thread::spawn(move || {
        let mut current = initial;

        loop {
            thread::sleep(Duration::from_secs_f64(TUNING_POLL_PERIOD_S));

            match util::params::load::<icp_opt::Params>("icp_opt.toml") {
                Ok(p) if p != current => {
                    info!("ICP optimisation parameters changed, publishing");
                    if tx.publish(p.clone()).is_err() {
                        break
                    }
                    current = p;
                },
                Ok(_) => (),
                Err(e) => warn!("Could not reload ICP optimisation params: {}", e)
            }
        }
    });
}
