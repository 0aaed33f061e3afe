//! Integration test: run the balance controller against the linear inverted
//! pendulum.
//!
//! Checks that:
//! 1. A push while standing is recovered with CMP feedback alone
//! 2. The demo plan is walked to completion, landing each step near its plan
//! 3. A push part way through a swing is recovered while walking

use nalgebra::Vector2;
use serde::Deserialize;

use bal_lib::{
    bal_ctrl::{self, BalCtrl, InputData, StatusReport, WalkingPhase, PHASE_TIME_TOLERANCE_S},
    footstep::{Feet, Footstep, FootstepPlan},
    icp_opt,
    lipm::Lipm
};
use util::module::State;

/// Control period used by the tests, slower than the shipped one to keep the
/// runs short.
const DT: f64 = 0.004;

/// The parts of the demo file used here.
#[derive(Debug, Deserialize)]
struct Demo {
    feet: Feet,
    plan: FootstepPlan
}

struct Run {
    lipm: Lipm,
    feet: Feet,
    num_infeasible: usize,
    landed: Vec<Footstep>,
    report: StatusReport,
    phase: WalkingPhase
}

fn params_path(file: &str) -> String {
    format!("{}/../params/{}", env!("CARGO_MANIFEST_DIR"), file)
}

fn controller() -> BalCtrl {
    let mut params: bal_ctrl::Params = util::params::load_path(params_path("bal_ctrl.toml")).unwrap();
    params.control_dt_s = DT;
    params.max_solve_time_s = 0.1;
    params.max_solver_iters = 100;

    let opt_params: icp_opt::Params = util::params::load_path(params_path("icp_opt.toml")).unwrap();

    BalCtrl::new(params, opt_params).unwrap()
}

fn demo() -> Demo {
    util::params::load_path(params_path("demo_plan.toml")).unwrap()
}

/// Run the loop for `duration_s`, applying `push` once at its time.
fn run(
    ctrl: &mut BalCtrl,
    mut feet: Feet,
    plan: Option<FootstepPlan>,
    push: Option<(f64, Vector2<f64>)>,
    duration_s: f64
) -> Run {
    let omega = ctrl.params().omega_rps();
    let mut lipm = Lipm::at_rest(omega, feet.mid_point());

    if let Some(p) = plan {
        ctrl.submit_plan(p);
    }

    let mut pushed = false;
    let mut landing: Option<Footstep> = None;
    let mut landed = Vec::new();
    let mut num_infeasible = 0;
    let mut report = *ctrl.last_report();
    let mut phase = ctrl.phase();

    let num_ticks = (duration_s / DT).round() as usize;

    for k in 0..num_ticks {
        let time_s = k as f64 * DT;

        if let Some((push_s, dv)) = push {
            if !pushed && time_s >= push_s {
                lipm.push(dv);
                pushed = true;
            }
        }

        if let (Some(step), Some(end_s)) = (landing, ctrl.swing_end_time_s()) {
            if time_s >= end_s - PHASE_TIME_TOLERANCE_S {
                feet.set(step.side, step.pose);
                landed.push(step);
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

        let (cmd, r) = ctrl.proc(&input).unwrap();

        if !cmd.feasible {
            num_infeasible += 1;
        }

        lipm.step(&cmd.desired_cmp_m, DT);

        if let (WalkingPhase::SingleSupport { .. }, Some(step)) = (cmd.phase, cmd.adjusted_footstep) {
            landing = Some(step);
        }

        report = r;
        phase = cmd.phase;
    }

    Run {
        lipm,
        feet,
        num_infeasible,
        landed,
        report,
        phase
    }
}

#[test]
fn test_standing_push_recovery() {
    let mut ctrl = controller();
    let feet = demo().feet;

    let result = run(&mut ctrl, feet, None, Some((0.5, Vector2::new(0.1, 0.0))), 3.0);

    assert_eq!(result.num_infeasible, 0);
    assert_eq!(result.phase, WalkingPhase::DoubleSupport);
    assert!(result.landed.is_empty());

    // Back at rest between the feet
    assert!(result.report.icp_error_norm_m < 5e-3, "ICP error {}", result.report.icp_error_norm_m);
    assert!(result.lipm.com_velocity_mps.norm() < 0.02);
    assert!((result.lipm.icp_m() - feet.mid_point()).norm() < 0.01);
}

#[test]
fn test_walk_demo_plan() {
    let mut ctrl = controller();
    let demo = demo();
    let planned = demo.plan.steps.clone();

    let result = run(&mut ctrl, demo.feet, Some(demo.plan), None, 6.0);

    assert_eq!(result.num_infeasible, 0);
    assert_eq!(result.phase, WalkingPhase::DoubleSupport);
    assert_eq!(ctrl.step_index(), planned.len());
    assert_eq!(result.landed.len(), planned.len());

    // Undisturbed, every step lands close to where it was planned
    for (landed, plan) in result.landed.iter().zip(planned.iter()) {
        assert_eq!(landed.step_index, plan.step_index);
        assert_eq!(landed.side, plan.side);
        assert!(
            (landed.pose.position_2d() - plan.pose.position_2d()).norm() < 0.05,
            "step {} landed at {:?}", landed.step_index, landed.pose.position_m
        );
    }

    assert!(result.report.icp_error_norm_m < 0.01, "ICP error {}", result.report.icp_error_norm_m);
}

#[test]
fn test_push_while_walking() {
    let mut ctrl = controller();
    let demo = demo();
    let num_steps = demo.plan.steps.len();

    // Part way through the second swing
    let push = (1.6, Vector2::new(0.1, -0.1));
    let result = run(&mut ctrl, demo.feet, Some(demo.plan), Some(push), 6.0);

    assert_eq!(result.num_infeasible, 0);
    assert_eq!(result.phase, WalkingPhase::DoubleSupport);
    assert_eq!(result.landed.len(), num_steps);
    assert!(result.report.icp_error_norm_m < 0.01, "ICP error {}", result.report.icp_error_norm_m);

    // Feet never cross
    let left = result.feet.left.position_2d();
    let right = result.feet.right.position_2d();
    assert!(left[1] > right[1]);
}
