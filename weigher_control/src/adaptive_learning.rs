//! The adaptive-learning controller. Last of the four stages — it reads
//! `coarse_advance`/`fall_value` back from the PLC on every attempt
//! rather than trusting a cached copy, since a human operator can jog
//! those registers directly between attempts. It requires several
//! consecutive compliant trials before declaring the hopper calibrated,
//! not just one.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use weigher_analysis::client::AnalysisOutcome;
use weigher_analysis::types::AdaptiveLearningRequest;
use weigher_common::hopper::HopperId;
use weigher_common::params::ControlParameters;
use weigher_common::stage::Stage;

use weigher_plc::address_map::HopperRegister;
use weigher_plc::monitor::MonitorEvent;

use crate::context::StageContext;
use crate::error::ControlError;

/// Consecutive compliant trials required before the hopper is declared
/// calibrated (see DESIGN.md for why three).
pub const REQUIRED_CONSECUTIVE_SUCCESSES: u32 = 3;
/// Starting fall value trialed before any analysis feedback (this
/// implementation's chosen constant — see DESIGN.md).
pub const ADAPTIVE_INITIAL_FALL_VALUE_G: f64 = 2.0;

enum AttemptOutcome {
    Success { coarse_speed: u16, fine_speed: u16 },
    Retry { delay: Duration },
}

pub struct AdaptiveLearningController;

impl AdaptiveLearningController {
    /// Run the stage for one hopper to completion. Terminal: there is
    /// no stage beyond this one to hand off to.
    pub fn run(ctx: Arc<StageContext>, hopper: HopperId, target_weight: f64, fine_flow_rate: Option<f64>) {
        if let Err(e) = try_run(&ctx, hopper, target_weight, fine_flow_rate) {
            ctx.aggregator.complete_stage_failure(hopper, Stage::AdaptiveLearning, e.to_string());
        }
    }
}

fn try_run(
    ctx: &Arc<StageContext>,
    hopper: HopperId,
    target_weight: f64,
    fine_flow_rate: Option<f64>,
) -> Result<(), ControlError> {
    ctx.aggregator.start_stage(hopper, Stage::AdaptiveLearning)?;
    ctx.aggregator
        .with_cell_mut(hopper, Stage::AdaptiveLearning, |c| c.start_attempt(0));

    ctx.write_weight(hopper, HopperRegister::TargetWeight, target_weight)?;
    ctx.write_weight(hopper, HopperRegister::FallValue, ADAPTIVE_INITIAL_FALL_VALUE_G)?;

    loop {
        if ctx.is_cancelled() {
            return Err(ControlError::OperatorCancel);
        }
        match run_one_attempt(ctx, hopper, target_weight, fine_flow_rate)? {
            AttemptOutcome::Success { coarse_speed, fine_speed } => {
                let coarse_advance = ctx.read_weight(hopper, HopperRegister::CoarseAdvance)?;
                let fall_value = ctx.read_weight(hopper, HopperRegister::FallValue)?;
                let params = ControlParameters { coarse_speed, fine_speed, coarse_advance, fall_value };
                ctx.aggregator.complete_stage_success(hopper, Stage::AdaptiveLearning, params);
                return Ok(());
            }
            AttemptOutcome::Retry { delay } => {
                ctx.sleep(delay);
                let speed = ctx
                    .aggregator
                    .with_cell(hopper, Stage::AdaptiveLearning, |c| c.current_speed())
                    .unwrap_or(0);
                let advanced = ctx
                    .aggregator
                    .with_cell_mut(hopper, Stage::AdaptiveLearning, |c| c.start_attempt(speed));
                if !advanced {
                    let rolled = ctx
                        .aggregator
                        .with_cell_mut(hopper, Stage::AdaptiveLearning, |c| c.start_round());
                    if !rolled {
                        return Err(ControlError::BudgetExhausted(format!(
                            "{hopper} exhausted adaptive-learning round budget"
                        )));
                    }
                }
            }
        }
    }
}

fn run_one_attempt(
    ctx: &Arc<StageContext>,
    hopper: HopperId,
    target_weight: f64,
    fine_flow_rate: Option<f64>,
) -> Result<AttemptOutcome, ControlError> {
    ctx.start_hopper(hopper)?;
    let (tx, rx) = mpsc::channel();
    ctx.monitor.arm(hopper, Stage::AdaptiveLearning, false, tx);
    let start_instant = Instant::now();

    wait_for_event(ctx, hopper, &rx, |e| matches!(e, MonitorEvent::CoarseStatusChanged { active: false, .. }))?;
    let actual_coarse_time_ms = start_instant.elapsed().as_millis() as u64;

    let elapsed_ms = wait_for_event(ctx, hopper, &rx, |e| matches!(e, MonitorEvent::TargetReached { .. }))?;
    let actual_total_cycle_ms = match elapsed_ms {
        MonitorEvent::TargetReached { elapsed_ms, .. } => elapsed_ms,
        _ => unreachable!("filtered for TargetReached above"),
    };
    ctx.monitor.disarm(hopper);
    ctx.stop_hopper(hopper)?;
    ctx.sleep(Duration::from_millis(1000));

    let real_weight = ctx.read_weight(hopper, HopperRegister::Weight)?;
    let error_value = real_weight - target_weight;
    ctx.discharge(hopper)?;

    let current_coarse_advance = ctx.read_weight(hopper, HopperRegister::CoarseAdvance)?;
    let current_fall_value = ctx.read_weight(hopper, HopperRegister::FallValue)?;

    let request = AdaptiveLearningRequest::new(
        target_weight,
        actual_total_cycle_ms,
        actual_coarse_time_ms,
        error_value,
        current_coarse_advance,
        current_fall_value,
        fine_flow_rate,
    );
    let outcome = ctx.analysis.analyze_adaptive_learning(&request)?;

    match outcome {
        AnalysisOutcome::Compliant(_resp) => {
            let streak = ctx
                .aggregator
                .with_cell_mut(hopper, Stage::AdaptiveLearning, |c| c.record_compliant_trial());
            if streak >= REQUIRED_CONSECUTIVE_SUCCESSES {
                let coarse_speed = ctx.read_raw(hopper, HopperRegister::CoarseSpeed)?;
                let fine_speed = ctx.read_raw(hopper, HopperRegister::FineSpeed)?;
                Ok(AttemptOutcome::Success { coarse_speed, fine_speed })
            } else {
                Ok(AttemptOutcome::Retry { delay: Duration::from_secs(1) })
            }
        }
        AnalysisOutcome::NotCompliant(resp) => {
            ctx.aggregator
                .with_cell_mut(hopper, Stage::AdaptiveLearning, |c| c.record_non_compliant_trial());
            let mut adjusted = false;
            if let Some(advance) = resp.new_params.coarse_advance {
                ctx.write_weight(hopper, HopperRegister::CoarseAdvance, advance)?;
                adjusted = true;
            }
            if let Some(fall) = resp.new_params.fall_value {
                ctx.write_weight(hopper, HopperRegister::FallValue, fall)?;
                adjusted = true;
            }
            if !adjusted {
                return Err(ControlError::Integrity(format!(
                    "{hopper} adaptive-learning analysis returned no adjustment"
                )));
            }
            Ok(AttemptOutcome::Retry { delay: Duration::from_millis(100) })
        }
    }
}

fn wait_for_event(
    ctx: &Arc<StageContext>,
    hopper: HopperId,
    rx: &mpsc::Receiver<MonitorEvent>,
    predicate: impl Fn(&MonitorEvent) -> bool,
) -> Result<MonitorEvent, ControlError> {
    loop {
        if ctx.is_cancelled() {
            ctx.monitor.disarm(hopper);
            return Err(ControlError::OperatorCancel);
        }
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) if predicate(&event) => return Ok(event),
            Ok(_) => continue,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(ControlError::Transport(format!("{hopper} monitor channel disconnected")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::harness;
    use weigher_common::stage::StageStatus;
    use weigher_plc::address_map::{coil_address, HopperCoil};

    #[test]
    fn missing_predecessor_completion_is_rejected() {
        let h = harness();
        let ctx = Arc::new(h.ctx);
        let hopper = HopperId::new(1).unwrap();
        let err = try_run(&ctx, hopper, 500.0, None).unwrap_err();
        assert!(matches!(err, ControlError::Integrity(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn three_consecutive_compliant_trials_complete_the_stage() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/adaptive_learning/analyze"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "is_compliant": true,
                "new_params": {"coarse_advance": null, "fall_value": null},
                "message": "within tolerance"
            })))
            .mount(&server)
            .await;

        let base_url = server.uri();
        tokio::task::spawn_blocking(move || {
            let mut h = harness();
            h.ctx.analysis =
                Arc::new(weigher_analysis::client::AnalysisClient::new(base_url, Duration::from_secs(5)).unwrap());
            let ctx = Arc::new(h.ctx);
            let hopper = HopperId::new(4).unwrap();
            ctx.aggregator.complete_stage_success(hopper, Stage::CoarseTime, ControlParameters::zeroed());
            ctx.aggregator.complete_stage_success(hopper, Stage::FlightMaterial, ControlParameters::zeroed());
            ctx.aggregator.complete_stage_success(hopper, Stage::FineTime, ControlParameters::zeroed());

            let worker_ctx = Arc::clone(&ctx);
            std::thread::spawn(move || AdaptiveLearningController::run(worker_ctx, hopper, 500.0, Some(3.1)));

            let coarse_addr = coil_address(4, HopperCoil::CoarseActive).unwrap();
            let target_addr = coil_address(4, HopperCoil::TargetReached).unwrap();
            for _ in 0..REQUIRED_CONSECUTIVE_SUCCESSES {
                std::thread::sleep(Duration::from_millis(150));
                h.sim.seed_coil(coarse_addr, true);
                std::thread::sleep(Duration::from_millis(150));
                h.sim.seed_coil(coarse_addr, false);
                std::thread::sleep(Duration::from_millis(150));
                h.sim.seed_coil(target_addr, true);
                std::thread::sleep(Duration::from_millis(1300));
                h.sim.seed_coil(target_addr, false);
                h.sim.seed_coil(coarse_addr, true);
            }
            std::thread::sleep(Duration::from_millis(300));

            let status = ctx.aggregator.with_cell(hopper, Stage::AdaptiveLearning, |c| c.status());
            assert_eq!(status, StageStatus::CompletedSuccess);
        })
        .await
        .unwrap();
    }
}
