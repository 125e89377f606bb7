//! The coarse-time controller. First of the four stages, started
//! directly by the session orchestrator; on success it spawns the
//! flight-material controller on a fresh thread — hand-off never calls
//! the next controller from inside this worker's call stack.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use weigher_analysis::client::AnalysisOutcome;
use weigher_analysis::types::CoarseTimeRequest;
use weigher_common::events::CoreEvent;
use weigher_common::hopper::HopperId;
use weigher_common::params::ControlParameters;
use weigher_common::stage::Stage;

use weigher_plc::address_map::HopperRegister;
use weigher_plc::monitor::MonitorEvent;

use crate::context::StageContext;
use crate::error::ControlError;
use crate::flight_material::FlightMaterialController;

/// Minimum accepted target weight, grams.
pub const TARGET_WEIGHT_MIN_G: f64 = 60.0;
/// Maximum accepted target weight, grams.
pub const TARGET_WEIGHT_MAX_G: f64 = 425.0;

/// How a hopper re-enters coarse-time after an operator-requested restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    /// Reset to the session's initial coarse speed, equivalent to a
    /// fresh `start_session` call restricted to this hopper.
    FromBeginning,
    /// Reuse the last trialed speed.
    FromCurrentStage,
}

pub struct CoarseTimeController;

impl CoarseTimeController {
    /// Start a new session across all six hoppers.
    pub fn start_session(
        ctx: &Arc<StageContext>,
        target_weight: f64,
        initial_coarse_speed: u16,
    ) -> Result<(), ControlError> {
        if !(TARGET_WEIGHT_MIN_G..=TARGET_WEIGHT_MAX_G).contains(&target_weight) {
            return Err(ControlError::Integrity(format!(
                "target weight {target_weight}g out of range {TARGET_WEIGHT_MIN_G}..={TARGET_WEIGHT_MAX_G}"
            )));
        }
        ctx.aggregator.reset(target_weight);
        for hopper in HopperId::all() {
            ctx.aggregator.start_stage(hopper, Stage::CoarseTime)?;
            ctx.aggregator
                .with_cell_mut(hopper, Stage::CoarseTime, |c| c.start_attempt(initial_coarse_speed));
            ctx.write_weight(hopper, HopperRegister::TargetWeight, target_weight)?;
            ctx.write_raw(hopper, HopperRegister::CoarseSpeed, initial_coarse_speed)?;
        }
        ctx.start_all_hoppers()?;
        for hopper in HopperId::all() {
            let (tx, rx) = mpsc::channel();
            ctx.monitor.arm(hopper, Stage::CoarseTime, true, tx);
            let ctx = Arc::clone(ctx);
            std::thread::spawn(move || run_worker(ctx, hopper, rx));
        }
        Ok(())
    }

    /// Restart a single hopper that an operator pulled out of the
    /// running session (e.g. after clearing a jam).
    pub fn restart_bucket(
        ctx: &Arc<StageContext>,
        hopper: HopperId,
        mode: RestartMode,
        initial_coarse_speed: u16,
    ) -> Result<(), ControlError> {
        if mode == RestartMode::FromBeginning {
            let target_weight = ctx.aggregator.with_cell(hopper, Stage::CoarseTime, |c| c.target_weight());
            ctx.aggregator
                .with_cell_mut(hopper, Stage::CoarseTime, |c| c.reset_for_new_test(target_weight));
        }
        let speed = match mode {
            RestartMode::FromBeginning => initial_coarse_speed,
            RestartMode::FromCurrentStage => ctx
                .aggregator
                .with_cell(hopper, Stage::CoarseTime, |c| c.current_speed())
                .unwrap_or(initial_coarse_speed),
        };
        ctx.aggregator.with_cell_mut(hopper, Stage::CoarseTime, |c| c.start_attempt(speed));
        ctx.write_raw(hopper, HopperRegister::CoarseSpeed, speed)?;
        ctx.sleep(Duration::from_millis(100));
        ctx.start_hopper(hopper)?;
        let (tx, rx) = mpsc::channel();
        ctx.monitor.arm(hopper, Stage::CoarseTime, true, tx);
        let ctx = Arc::clone(ctx);
        std::thread::spawn(move || run_worker(ctx, hopper, rx));
        Ok(())
    }
}

fn run_worker(ctx: Arc<StageContext>, hopper: HopperId, mut rx: mpsc::Receiver<MonitorEvent>) {
    loop {
        if ctx.is_cancelled() {
            ctx.monitor.disarm(hopper);
            ctx.aggregator
                .complete_stage_failure(hopper, Stage::CoarseTime, "operator cancelled the session");
            return;
        }
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(MonitorEvent::TargetReached { elapsed_ms, .. }) => {
                ctx.monitor.disarm(hopper);
                match handle_target_reached(&ctx, hopper, elapsed_ms) {
                    Ok(Some(next_rx)) => rx = next_rx,
                    Ok(None) => return,
                    Err(e) => {
                        ctx.aggregator.complete_stage_failure(hopper, Stage::CoarseTime, e.to_string());
                        return;
                    }
                }
            }
            Ok(MonitorEvent::StarvationDetected { stage, .. }) => {
                ctx.monitor.disarm(hopper);
                let _ = ctx.stop_hopper(hopper);
                ctx.aggregator.emit(CoreEvent::StarvationDetected {
                    hopper,
                    stage,
                    is_production: false,
                });
                ctx.aggregator.complete_stage_failure(
                    hopper,
                    Stage::CoarseTime,
                    format!("{hopper} starved during coarse-time fill"),
                );
                return;
            }
            Ok(_) => continue,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// `Ok(Some(rx))` to keep looping on a new arm, `Ok(None)` once the
/// stage has terminated (success handed off on a fresh thread, or
/// failure already recorded by the caller from the returned error).
fn handle_target_reached(
    ctx: &Arc<StageContext>,
    hopper: HopperId,
    elapsed_ms: u64,
) -> Result<Option<mpsc::Receiver<MonitorEvent>>, ControlError> {
    ctx.stop_hopper(hopper)?;
    ctx.discharge(hopper)?;
    let current_speed = ctx.read_raw(hopper, HopperRegister::CoarseSpeed)?;
    let target_weight = ctx.aggregator.with_cell(hopper, Stage::CoarseTime, |c| c.target_weight());

    let request = CoarseTimeRequest::new(target_weight, elapsed_ms, current_speed);
    let outcome = ctx.analysis.analyze_coarse_time(&request)?;

    match outcome {
        AnalysisOutcome::Compliant(_resp) => {
            let params = ControlParameters {
                coarse_speed: current_speed,
                ..ControlParameters::zeroed()
            };
            ctx.aggregator.complete_stage_success(hopper, Stage::CoarseTime, params);
            debug!(%hopper, coarse_speed = current_speed, "coarse-time settled");
            let ctx = Arc::clone(ctx);
            std::thread::spawn(move || FlightMaterialController::run(ctx, hopper));
            Ok(None)
        }
        AnalysisOutcome::NotCompliant(resp) => match resp.new_coarse_speed {
            Some(new_speed) => {
                let started = ctx
                    .aggregator
                    .with_cell_mut(hopper, Stage::CoarseTime, |c| c.start_attempt(new_speed));
                if !started {
                    return Err(ControlError::BudgetExhausted(format!(
                        "{hopper} exhausted coarse-time attempt budget"
                    )));
                }
                ctx.write_raw(hopper, HopperRegister::CoarseSpeed, new_speed)?;
                ctx.sleep(Duration::from_millis(100));
                ctx.start_hopper(hopper)?;
                let (tx, rx) = mpsc::channel();
                ctx.monitor.arm(hopper, Stage::CoarseTime, true, tx);
                Ok(Some(rx))
            }
            None => Err(ControlError::BudgetExhausted(format!(
                "{hopper} coarse-time analysis returned no adjustment"
            ))),
        },
    }
}
