//! The flight-material controller. Triggered only by a successful
//! coarse-time completion for the same hopper — never started
//! standalone by the session orchestrator. Three mandatory trials with
//! no per-trial retry: a single bad sample fails the whole stage by
//! design, not an oversight.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use weigher_analysis::client::AnalysisOutcome;
use weigher_analysis::types::FlightMaterialRequest;
use weigher_common::hopper::HopperId;
use weigher_common::params::ControlParameters;
use weigher_common::stage::Stage;

use weigher_plc::address_map::HopperRegister;
use weigher_plc::monitor::MonitorEvent;

use crate::context::StageContext;
use crate::error::ControlError;
use crate::fine_time::FineTimeController;

const SAMPLE_COUNT: usize = 3;

pub struct FlightMaterialController;

impl FlightMaterialController {
    /// Run the stage for one hopper to completion, on whatever thread
    /// the caller spawned for the hand-off. Never returns an `Err` —
    /// failures are recorded on the aggregator directly, matching the
    /// other controllers' `run` entry points.
    pub fn run(ctx: Arc<StageContext>, hopper: HopperId) {
        if let Err(e) = try_run(&ctx, hopper) {
            ctx.aggregator.complete_stage_failure(hopper, Stage::FlightMaterial, e.to_string());
        }
    }
}

fn try_run(ctx: &Arc<StageContext>, hopper: HopperId) -> Result<(), ControlError> {
    ctx.aggregator.start_stage(hopper, Stage::FlightMaterial)?;
    ctx.aggregator.with_cell_mut(hopper, Stage::FlightMaterial, |c| c.start_attempt(0));
    let target_weight = ctx.aggregator.with_cell(hopper, Stage::FlightMaterial, |c| c.target_weight());

    let mut samples = Vec::with_capacity(SAMPLE_COUNT);
    while samples.len() < SAMPLE_COUNT {
        if ctx.is_cancelled() {
            return Err(ControlError::OperatorCancel);
        }
        ctx.write_weight(hopper, HopperRegister::TargetWeight, target_weight)?;
        ctx.start_hopper(hopper)?;
        let (tx, rx) = mpsc::channel();
        ctx.monitor.arm(hopper, Stage::FlightMaterial, false, tx);
        samples.push(wait_for_sample(ctx, hopper, &rx)?);
    }

    let recorded: [f64; SAMPLE_COUNT] = samples.try_into().expect("loop collects exactly SAMPLE_COUNT samples");
    let request = FlightMaterialRequest::new(target_weight, recorded);
    let outcome = ctx.analysis.analyze_flight_material(&request)?;

    match outcome {
        AnalysisOutcome::Compliant(resp) => {
            let flight_material_value = resp.avg_flight_material.ok_or_else(|| {
                ControlError::Integrity(format!("{hopper} flight-material response missing avg_flight_material"))
            })?;
            ctx.aggregator
                .complete_stage_success(hopper, Stage::FlightMaterial, ControlParameters::zeroed());
            let ctx = Arc::clone(ctx);
            std::thread::spawn(move || FineTimeController::run(ctx, hopper, flight_material_value));
            Ok(())
        }
        AnalysisOutcome::NotCompliant(_resp) => Err(ControlError::AnalysisDisagreement(format!(
            "{hopper} flight-material trial rejected by analysis service"
        ))),
    }
}

fn wait_for_sample(ctx: &Arc<StageContext>, hopper: HopperId, rx: &mpsc::Receiver<MonitorEvent>) -> Result<f64, ControlError> {
    loop {
        if ctx.is_cancelled() {
            ctx.monitor.disarm(hopper);
            return Err(ControlError::OperatorCancel);
        }
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(MonitorEvent::TargetReached { .. }) => {
                ctx.monitor.disarm(hopper);
                ctx.stop_hopper(hopper)?;
                ctx.sleep(Duration::from_millis(600));
                let weight = ctx.read_weight(hopper, HopperRegister::Weight)?;
                ctx.discharge(hopper)?;
                return Ok(weight);
            }
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

    #[tokio::test(flavor = "multi_thread")]
    async fn three_compliant_samples_complete_the_stage() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/flight_material/analyze"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "avg_flight_material": 5.1,
                "flight_material_details": [5.0, 5.1, 5.2],
                "message": "ok"
            })))
            .mount(&server)
            .await;

        let base_url = server.uri();
        tokio::task::spawn_blocking(move || {
            let mut h = harness();
            h.ctx.analysis =
                Arc::new(weigher_analysis::client::AnalysisClient::new(base_url, Duration::from_secs(5)).unwrap());
            let ctx = Arc::new(h.ctx);
            let hopper = HopperId::new(1).unwrap();
            ctx.aggregator.complete_stage_success(hopper, Stage::CoarseTime, ControlParameters::zeroed());

            let worker_ctx = Arc::clone(&ctx);
            std::thread::spawn(move || FlightMaterialController::run(worker_ctx, hopper));

            let addr = coil_address(1, HopperCoil::TargetReached).unwrap();
            for _ in 0..SAMPLE_COUNT {
                std::thread::sleep(Duration::from_millis(150));
                h.sim.seed_coil(addr, true);
                std::thread::sleep(Duration::from_millis(900));
                h.sim.seed_coil(addr, false);
            }
            std::thread::sleep(Duration::from_millis(300));

            let status = ctx.aggregator.with_cell(hopper, Stage::FlightMaterial, |c| c.status());
            assert_eq!(status, StageStatus::CompletedSuccess);
        })
        .await
        .unwrap();
    }

    #[test]
    fn missing_predecessor_completion_is_rejected() {
        let h = harness();
        let ctx = Arc::new(h.ctx);
        let hopper = HopperId::new(2).unwrap();
        let err = try_run(&ctx, hopper).unwrap_err();
        assert!(matches!(err, ControlError::Integrity(_)));
    }
}
