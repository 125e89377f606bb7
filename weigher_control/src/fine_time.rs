//! The fine-time controller. Triggered by a successful flight-material
//! completion, carrying that stage's measured flight material value
//! forward into its own analysis requests and, on success, into the
//! adaptive-learning hand-off.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use weigher_analysis::client::AnalysisOutcome;
use weigher_analysis::flow_rate::extract_flow_rate;
use weigher_analysis::types::FineTimeRequest;
use weigher_common::hopper::HopperId;
use weigher_common::params::ControlParameters;
use weigher_common::stage::Stage;

use weigher_plc::address_map::HopperRegister;
use weigher_plc::monitor::MonitorEvent;

use crate::adaptive_learning::AdaptiveLearningController;
use crate::context::StageContext;
use crate::error::ControlError;

/// Fixed target weight this stage cycles against.
pub const FINE_TIME_TARGET_G: f64 = 6.0;
/// Fixed coarse-advance value this stage cycles against.
pub const FINE_TIME_COARSE_ADVANCE_G: f64 = 6.0;
/// Starting fine speed trialed before any analysis feedback (this
/// implementation's chosen constant — see DESIGN.md).
pub const INITIAL_FINE_SPEED: u16 = 30;

pub struct FineTimeController;

impl FineTimeController {
    /// Run the stage for one hopper to completion, carrying the flight
    /// material value measured by the predecessor stage.
    pub fn run(ctx: Arc<StageContext>, hopper: HopperId, flight_material_value: f64) {
        if let Err(e) = try_run(&ctx, hopper, flight_material_value) {
            ctx.aggregator.complete_stage_failure(hopper, Stage::FineTime, e.to_string());
        }
    }
}

fn try_run(ctx: &Arc<StageContext>, hopper: HopperId, flight_material_value: f64) -> Result<(), ControlError> {
    ctx.aggregator.start_stage(hopper, Stage::FineTime)?;
    let original_target_weight = ctx.aggregator.with_cell(hopper, Stage::CoarseTime, |c| c.target_weight());
    ctx.aggregator.with_cell_mut(hopper, Stage::FineTime, |c| c.start_attempt(INITIAL_FINE_SPEED));

    ctx.write_weight(hopper, HopperRegister::TargetWeight, FINE_TIME_TARGET_G)?;
    ctx.write_weight(hopper, HopperRegister::CoarseAdvance, FINE_TIME_COARSE_ADVANCE_G)?;
    ctx.write_raw(hopper, HopperRegister::FineSpeed, INITIAL_FINE_SPEED)?;

    let mut rx = arm_and_start(ctx, hopper)?;
    loop {
        if ctx.is_cancelled() {
            ctx.monitor.disarm(hopper);
            return Err(ControlError::OperatorCancel);
        }
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(MonitorEvent::TargetReached { elapsed_ms, .. }) => {
                ctx.monitor.disarm(hopper);
                match handle_target_reached(ctx, hopper, elapsed_ms, original_target_weight, flight_material_value)? {
                    Some(next_rx) => rx = next_rx,
                    None => return Ok(()),
                }
            }
            Ok(_) => continue,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(ControlError::Transport(format!("{hopper} monitor channel disconnected")))
            }
        }
    }
}

fn arm_and_start(ctx: &Arc<StageContext>, hopper: HopperId) -> Result<mpsc::Receiver<MonitorEvent>, ControlError> {
    ctx.start_hopper(hopper)?;
    let (tx, rx) = mpsc::channel();
    ctx.monitor.arm(hopper, Stage::FineTime, false, tx);
    Ok(rx)
}

fn handle_target_reached(
    ctx: &Arc<StageContext>,
    hopper: HopperId,
    elapsed_ms: u64,
    original_target_weight: f64,
    flight_material_value: f64,
) -> Result<Option<mpsc::Receiver<MonitorEvent>>, ControlError> {
    ctx.stop_hopper(hopper)?;
    ctx.sleep(Duration::from_millis(600));
    ctx.discharge(hopper)?;

    let current_fine_speed = ctx.read_raw(hopper, HopperRegister::FineSpeed)?;
    let request = FineTimeRequest::new(elapsed_ms, current_fine_speed, original_target_weight, flight_material_value);
    let outcome = ctx.analysis.analyze_fine_time(&request)?;

    match outcome {
        AnalysisOutcome::Compliant(resp) => {
            let coarse_advance = match resp.coarse_advance {
                Some(advance) => {
                    ctx.write_weight(hopper, HopperRegister::CoarseAdvance, advance)?;
                    advance
                }
                None => FINE_TIME_COARSE_ADVANCE_G,
            };
            let flow_rate = extract_flow_rate(resp.fine_flow_rate, &resp.message);
            if flow_rate.is_none() {
                warn!(%hopper, "fine-time analysis returned no usable flow rate");
            }
            let params = ControlParameters {
                coarse_speed: 0,
                fine_speed: current_fine_speed,
                coarse_advance,
                fall_value: 0.0,
            };
            ctx.aggregator.complete_stage_success(hopper, Stage::FineTime, params);
            let ctx = Arc::clone(ctx);
            std::thread::spawn(move || AdaptiveLearningController::run(ctx, hopper, original_target_weight, flow_rate));
            Ok(None)
        }
        AnalysisOutcome::NotCompliant(resp) => match resp.new_fine_speed {
            Some(new_speed) => {
                let started = ctx.aggregator.with_cell_mut(hopper, Stage::FineTime, |c| c.start_attempt(new_speed));
                if !started {
                    return Err(ControlError::BudgetExhausted(format!("{hopper} exhausted fine-time attempt budget")));
                }
                ctx.write_raw(hopper, HopperRegister::FineSpeed, new_speed)?;
                ctx.sleep(Duration::from_millis(100));
                Ok(Some(arm_and_start(ctx, hopper)?))
            }
            None => Err(ControlError::BudgetExhausted(format!(
                "{hopper} fine-time analysis returned no adjustment"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::harness;

    #[test]
    fn missing_predecessor_completion_is_rejected() {
        let h = harness();
        let ctx = Arc::new(h.ctx);
        let hopper = HopperId::new(1).unwrap();
        let err = try_run(&ctx, hopper, 4.0).unwrap_err();
        assert!(matches!(err, ControlError::Integrity(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn compliant_response_completes_stage_and_starts_adaptive_learning() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/fine_time/analyze"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "is_compliant": true,
                "new_fine_speed": null,
                "coarse_advance": 6.5,
                "fine_flow_rate": 3.2,
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
            let hopper = HopperId::new(3).unwrap();
            ctx.aggregator.complete_stage_success(hopper, Stage::CoarseTime, ControlParameters::zeroed());
            ctx.aggregator.complete_stage_success(hopper, Stage::FlightMaterial, ControlParameters::zeroed());

            let worker_ctx = Arc::clone(&ctx);
            std::thread::spawn(move || FineTimeController::run(worker_ctx, hopper, 4.0));

            let addr = weigher_plc::address_map::coil_address(3, weigher_plc::address_map::HopperCoil::TargetReached)
                .unwrap();
            std::thread::sleep(Duration::from_millis(150));
            h.sim.seed_coil(addr, true);
            std::thread::sleep(Duration::from_millis(900));

            let status = ctx.aggregator.with_cell(hopper, Stage::FineTime, |c| c.status());
            assert_eq!(status, weigher_common::stage::StageStatus::CompletedSuccess);
        })
        .await
        .unwrap();
    }
}
