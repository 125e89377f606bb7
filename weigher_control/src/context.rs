//! The shared handles every stage controller needs: the PLC port, the
//! monitoring engine, the analysis client, the aggregator, an
//! injectable clock, and the cooperative-cancellation flag. Built once
//! by the `weigher` binary and handed to all four controllers so none
//! of them reaches for a global — the same `DriverRegistry`
//! constructor-injection pattern, carried through at the session level
//! rather than the per-driver level.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weigher_analysis::client::AnalysisClient;
use weigher_common::config::BudgetConfig;
use weigher_common::hopper::HopperId;

use weigher_plc::address_map::{register_address, HopperRegister};
use weigher_plc::bucket_control::{CommandSequencer, Sleeper};
use weigher_plc::monitor::Monitor;
use weigher_plc::transport::{decode_signed_weight, encode_weight, PlcPort};

use crate::aggregator::LearningStateAggregator;
use crate::error::ControlError;

/// Shared, `Arc`-cloned handles passed to every stage controller.
pub struct StageContext {
    pub plc: Arc<dyn PlcPort>,
    pub monitor: Arc<Monitor>,
    pub analysis: Arc<AnalysisClient>,
    pub aggregator: Arc<LearningStateAggregator>,
    pub sleeper: Arc<dyn Sleeper>,
    pub cancel: Arc<AtomicBool>,
    pub budget: BudgetConfig,
}

impl StageContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn sequencer(&self) -> CommandSequencer<'_> {
        CommandSequencer::new(self.plc.as_ref(), self.sleeper.as_ref())
    }

    pub fn sleep(&self, duration: Duration) {
        self.sleeper.sleep(duration);
    }

    pub fn start_hopper(&self, hopper: HopperId) -> Result<(), ControlError> {
        let (ok, msg) = self.sequencer().start_hopper(hopper.get())?;
        if ok {
            Ok(())
        } else {
            Err(ControlError::Transport(msg))
        }
    }

    pub fn stop_hopper(&self, hopper: HopperId) -> Result<(), ControlError> {
        let (ok, msg) = self.sequencer().stop_hopper(hopper.get())?;
        if ok {
            Ok(())
        } else {
            Err(ControlError::Transport(msg))
        }
    }

    pub fn discharge(&self, hopper: HopperId) -> Result<(), ControlError> {
        let (ok, msg) = self.sequencer().discharge(hopper.get())?;
        if ok {
            Ok(())
        } else {
            Err(ControlError::Transport(msg))
        }
    }

    pub fn start_all_hoppers(&self) -> Result<(), ControlError> {
        let (ok, msg) = self.sequencer().start_all_hoppers()?;
        if ok {
            Ok(())
        } else {
            Err(ControlError::Transport(msg))
        }
    }

    /// Write a weight-scaled register (target weight, coarse/fine
    /// advance, fall value, live weight) in display units.
    pub fn write_weight(&self, hopper: HopperId, role: HopperRegister, display: f64) -> Result<(), ControlError> {
        let addr = register_address(hopper.get(), role)?;
        self.plc.write_holding_register(addr, encode_weight(display))?;
        Ok(())
    }

    /// Read a weight-scaled register back into display units.
    pub fn read_weight(&self, hopper: HopperId, role: HopperRegister) -> Result<f64, ControlError> {
        let addr = register_address(hopper.get(), role)?;
        let raw = self.plc.read_holding_registers(addr, 1)?;
        Ok(decode_signed_weight(raw[0]))
    }

    /// Write a raw (unscaled) register, e.g. a coarse/fine speed index.
    pub fn write_raw(&self, hopper: HopperId, role: HopperRegister, value: u16) -> Result<(), ControlError> {
        let addr = register_address(hopper.get(), role)?;
        self.plc.write_holding_register(addr, value)?;
        Ok(())
    }

    /// Read a raw (unscaled) register back.
    pub fn read_raw(&self, hopper: HopperId, role: HopperRegister) -> Result<u16, ControlError> {
        let addr = register_address(hopper.get(), role)?;
        let raw = self.plc.read_holding_registers(addr, 1)?;
        Ok(raw[0])
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::mpsc;
    use weigher_common::matrix::LearningMatrix;
    use weigher_plc::bucket_control::RecordingSleeper;
    use weigher_plc::transport::SimulatedTransport;

    /// A fully wired `StageContext` over a connected `SimulatedTransport`,
    /// plus the raw handles tests need to seed registers/coils and
    /// inspect events.
    pub struct Harness {
        pub sim: Arc<SimulatedTransport>,
        pub ctx: StageContext,
        pub events: mpsc::Receiver<weigher_common::events::CoreEvent>,
    }

    pub fn harness() -> Harness {
        let sim = Arc::new(SimulatedTransport::new());
        sim.connect().unwrap();
        let monitor = Arc::new(Monitor::new(sim.clone() as Arc<dyn PlcPort>, 0.3));
        monitor.start();
        let matrix = Arc::new(LearningMatrix::new(15, 3, 500.0));
        let (tx, rx) = mpsc::channel();
        let aggregator = Arc::new(LearningStateAggregator::new(matrix, tx));
        let ctx = StageContext {
            plc: sim.clone() as Arc<dyn PlcPort>,
            monitor,
            analysis: Arc::new(AnalysisClient::new("http://127.0.0.1:0", Duration::from_secs(1)).unwrap()),
            aggregator,
            sleeper: Arc::new(RecordingSleeper::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            budget: BudgetConfig::default(),
        };
        Harness { sim, ctx, events: rx }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::harness;
    use super::*;

    #[test]
    fn write_then_read_weight_round_trips() {
        let h = harness();
        let hopper = HopperId::new(1).unwrap();
        h.ctx.write_weight(hopper, HopperRegister::TargetWeight, 500.0).unwrap();
        assert_eq!(h.ctx.read_weight(hopper, HopperRegister::TargetWeight).unwrap(), 500.0);
    }

    #[test]
    fn write_then_read_raw_round_trips() {
        let h = harness();
        let hopper = HopperId::new(2).unwrap();
        h.ctx.write_raw(hopper, HopperRegister::CoarseSpeed, 42).unwrap();
        assert_eq!(h.ctx.read_raw(hopper, HopperRegister::CoarseSpeed).unwrap(), 42);
    }

    #[test]
    fn start_hopper_sets_start_coil() {
        let h = harness();
        let hopper = HopperId::new(3).unwrap();
        h.ctx.start_hopper(hopper).unwrap();
        let addr = weigher_plc::address_map::coil_address(3, weigher_plc::address_map::HopperCoil::Start).unwrap();
        assert!(h.sim.peek_coil(addr));
    }

    #[test]
    fn is_cancelled_reflects_flag() {
        let h = harness();
        assert!(!h.ctx.is_cancelled());
        h.ctx.cancel.store(true, Ordering::SeqCst);
        assert!(h.ctx.is_cancelled());
    }
}
