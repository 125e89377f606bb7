//! Command-sequence DSL for driving the PLC's start/stop/discharge and
//! calibration coils, plus the named sequences the stage controllers
//! call. Sequences are data (`Vec<Step>`), not closures, so tests can
//! assert on step order and minimum delays without depending on wall
//! clock time — the "inject a clock" technique the redesign guidance
//! calls for.

use std::time::Duration;

use parking_lot::Mutex;

use crate::address_map::{coil_address, global_coil_address, GlobalCoil, HopperCoil};
use crate::transport::{PlcError, PlcPort};

/// One step of a command sequence.
#[derive(Debug, Clone)]
pub enum Step {
    WriteCoil { addr: u16, value: bool },
    WriteCoils { addr: u16, values: Vec<bool> },
    Delay(Duration),
}

/// Injectable sleep so tests can run a sequence without waiting in real
/// time while still observing that a delay step was requested.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps for the real duration. Used outside tests.
pub struct RealSleeper;

impl Sleeper for RealSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested delays without waiting, so test assertions can
/// check sequencing and minimum delays without slowing the test suite.
#[derive(Default)]
pub struct RecordingSleeper {
    pub recorded: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded_delays(&self) -> Vec<Duration> {
        self.recorded.lock().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.recorded.lock().push(duration);
    }
}

/// Executes `Step` sequences against a `PlcPort`. A sequence's own steps
/// never interleave with another sequence's on the same hopper because
/// each hopper has exactly one worker thread driving it; writes from
/// different hoppers interleave freely at the step level but never
/// mid-write, since every individual `PlcPort` call is itself serialized
/// by the transport's own lock.
pub struct CommandSequencer<'a> {
    port: &'a dyn PlcPort,
    sleeper: &'a dyn Sleeper,
}

impl<'a> CommandSequencer<'a> {
    pub fn new(port: &'a dyn PlcPort, sleeper: &'a dyn Sleeper) -> Self {
        Self { port, sleeper }
    }

    /// Run a sequence, stopping at the first failed write. Returns
    /// `(true, "")` on full success, or `(false, message)` on the first
    /// failure, matching the original `(bool, str)` result shape.
    pub fn run(&self, steps: &[Step]) -> (bool, String) {
        for step in steps {
            match step {
                Step::WriteCoil { addr, value } => {
                    if let Err(e) = self.port.write_coil(crate::address_map::Address(*addr), *value) {
                        return (false, format_error(&e));
                    }
                }
                Step::WriteCoils { addr, values } => {
                    if let Err(e) = self.port.write_multiple_coils(crate::address_map::Address(*addr), values) {
                        return (false, format_error(&e));
                    }
                }
                Step::Delay(duration) => self.sleeper.sleep(*duration),
            }
        }
        (true, String::new())
    }

    pub fn start_hopper(&self, hopper_id: u8) -> Result<(bool, String), PlcError> {
        Ok(self.run(&start_hopper_sequence(hopper_id)?))
    }

    pub fn stop_hopper(&self, hopper_id: u8) -> Result<(bool, String), PlcError> {
        Ok(self.run(&stop_hopper_sequence(hopper_id)?))
    }

    pub fn discharge(&self, hopper_id: u8) -> Result<(bool, String), PlcError> {
        Ok(self.run(&discharge_sequence(hopper_id)?))
    }

    pub fn start_all_hoppers(&self) -> Result<(bool, String), PlcError> {
        Ok(self.run(&start_all_hoppers_sequence()?))
    }

    pub fn global_start(&self) -> (bool, String) {
        self.run(&global_start_sequence())
    }

    pub fn global_stop(&self) -> (bool, String) {
        self.run(&global_stop_sequence())
    }

    pub fn zero_calibration(&self, hopper_id: u8) -> Result<(bool, String), PlcError> {
        Ok(self.run(&zero_calibration_sequence(hopper_id)?))
    }

    pub fn weight_calibration(&self, hopper_id: u8) -> Result<(bool, String), PlcError> {
        Ok(self.run(&weight_calibration_sequence(hopper_id)?))
    }
}

fn format_error(e: &PlcError) -> String {
    e.to_string()
}

/// `Stop=0`, delay 50ms, `Start=1`.
pub fn start_hopper_sequence(hopper_id: u8) -> Result<Vec<Step>, PlcError> {
    let stop = coil_address(hopper_id, HopperCoil::Stop).map_err(|e| PlcError::Protocol(e.to_string()))?;
    let start = coil_address(hopper_id, HopperCoil::Start).map_err(|e| PlcError::Protocol(e.to_string()))?;
    Ok(vec![
        Step::WriteCoil { addr: stop.get(), value: false },
        Step::Delay(Duration::from_millis(50)),
        Step::WriteCoil { addr: start.get(), value: true },
    ])
}

/// `Start=0`, delay 50ms, `Stop=1`.
pub fn stop_hopper_sequence(hopper_id: u8) -> Result<Vec<Step>, PlcError> {
    let start = coil_address(hopper_id, HopperCoil::Start).map_err(|e| PlcError::Protocol(e.to_string()))?;
    let stop = coil_address(hopper_id, HopperCoil::Stop).map_err(|e| PlcError::Protocol(e.to_string()))?;
    Ok(vec![
        Step::WriteCoil { addr: start.get(), value: false },
        Step::Delay(Duration::from_millis(50)),
        Step::WriteCoil { addr: stop.get(), value: true },
    ])
}

/// `Discharge=1`, delay 1500ms, `Discharge=0`.
pub fn discharge_sequence(hopper_id: u8) -> Result<Vec<Step>, PlcError> {
    let discharge =
        coil_address(hopper_id, HopperCoil::Discharge).map_err(|e| PlcError::Protocol(e.to_string()))?;
    Ok(vec![
        Step::WriteCoil { addr: discharge.get(), value: true },
        Step::Delay(Duration::from_millis(1500)),
        Step::WriteCoil { addr: discharge.get(), value: false },
    ])
}

/// Batch-write `Stop=0` for all six hoppers, delay 50ms, batch-write
/// `Start=1` for all six.
pub fn start_all_hoppers_sequence() -> Result<Vec<Step>, PlcError> {
    let stop_addrs: Vec<u16> = (1..=6u8)
        .map(|h| coil_address(h, HopperCoil::Stop).map(|a| a.get()))
        .collect::<Result<_, _>>()
        .map_err(|e| PlcError::Protocol(e.to_string()))?;
    let start_addrs: Vec<u16> = (1..=6u8)
        .map(|h| coil_address(h, HopperCoil::Start).map(|a| a.get()))
        .collect::<Result<_, _>>()
        .map_err(|e| PlcError::Protocol(e.to_string()))?;

    // The six stop coils and six start coils are each contiguous within
    // one hopper's block but not across hoppers at this stride, so
    // batch writes are expressed one coil at a time rather than a
    // single `WriteCoils` burst.
    let mut steps: Vec<Step> = stop_addrs
        .iter()
        .map(|addr| Step::WriteCoil { addr: *addr, value: false })
        .collect();
    steps.push(Step::Delay(Duration::from_millis(50)));
    steps.extend(start_addrs.iter().map(|addr| Step::WriteCoil { addr: *addr, value: true }));
    Ok(steps)
}

/// `GlobalStop=0`, delay 50ms, `GlobalStart=1`.
pub fn global_start_sequence() -> Vec<Step> {
    vec![
        Step::WriteCoil { addr: global_coil_address(GlobalCoil::GlobalStop).get(), value: false },
        Step::Delay(Duration::from_millis(50)),
        Step::WriteCoil { addr: global_coil_address(GlobalCoil::GlobalStart).get(), value: true },
    ]
}

/// `GlobalStart=0`, delay 50ms, `GlobalStop=1`.
pub fn global_stop_sequence() -> Vec<Step> {
    vec![
        Step::WriteCoil { addr: global_coil_address(GlobalCoil::GlobalStart).get(), value: false },
        Step::Delay(Duration::from_millis(50)),
        Step::WriteCoil { addr: global_coil_address(GlobalCoil::GlobalStop).get(), value: true },
    ]
}

/// `ZeroCalibration=1`, delay 1000ms, `ZeroCalibration=0`.
pub fn zero_calibration_sequence(hopper_id: u8) -> Result<Vec<Step>, PlcError> {
    let addr =
        coil_address(hopper_id, HopperCoil::ZeroCalibration).map_err(|e| PlcError::Protocol(e.to_string()))?;
    Ok(vec![
        Step::WriteCoil { addr: addr.get(), value: true },
        Step::Delay(Duration::from_millis(1000)),
        Step::WriteCoil { addr: addr.get(), value: false },
    ])
}

/// `WeightCalibration=1`, delay 1000ms, `WeightCalibration=0`.
pub fn weight_calibration_sequence(hopper_id: u8) -> Result<Vec<Step>, PlcError> {
    let addr =
        coil_address(hopper_id, HopperCoil::WeightCalibration).map_err(|e| PlcError::Protocol(e.to_string()))?;
    Ok(vec![
        Step::WriteCoil { addr: addr.get(), value: true },
        Step::Delay(Duration::from_millis(1000)),
        Step::WriteCoil { addr: addr.get(), value: false },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedTransport;

    #[test]
    fn start_hopper_sequence_is_stop_then_start() {
        let steps = start_hopper_sequence(1).unwrap();
        assert_eq!(steps.len(), 3);
        assert!(matches!(steps[0], Step::WriteCoil { value: false, .. }));
        assert!(matches!(steps[1], Step::Delay(d) if d == Duration::from_millis(50)));
        assert!(matches!(steps[2], Step::WriteCoil { value: true, .. }));
    }

    #[test]
    fn command_sequencer_runs_steps_against_simulated_port() {
        let port = SimulatedTransport::new();
        port.connect().unwrap();
        let sleeper = RecordingSleeper::new();
        let sequencer = CommandSequencer::new(&port, &sleeper);

        let (ok, msg) = sequencer.start_hopper(1).unwrap();
        assert!(ok, "{msg}");

        let start_addr = coil_address(1, HopperCoil::Start).unwrap();
        assert!(port.peek_coil(start_addr));
        assert_eq!(sleeper.recorded_delays(), vec![Duration::from_millis(50)]);
    }

    #[test]
    fn sequence_stops_at_first_failure() {
        // A not-connected port fails every write, so only the first
        // step should be attempted.
        let port = SimulatedTransport::new();
        let sleeper = RecordingSleeper::new();
        let sequencer = CommandSequencer::new(&port, &sleeper);
        let (ok, msg) = sequencer.start_hopper(1).unwrap();
        assert!(!ok);
        assert!(!msg.is_empty());
        // The delay step after the failed write must never run.
        assert!(sleeper.recorded_delays().is_empty());
    }

    #[test]
    fn discharge_sequence_delays_1500ms() {
        let steps = discharge_sequence(3).unwrap();
        assert!(matches!(steps[1], Step::Delay(d) if d == Duration::from_millis(1500)));
    }

    #[test]
    fn start_all_hoppers_writes_six_stops_then_six_starts() {
        let steps = start_all_hoppers_sequence().unwrap();
        // six stop writes, one delay, six start writes
        assert_eq!(steps.len(), 13);
        for step in &steps[0..6] {
            assert!(matches!(step, Step::WriteCoil { value: false, .. }));
        }
        assert!(matches!(steps[6], Step::Delay(_)));
        for step in &steps[7..13] {
            assert!(matches!(step, Step::WriteCoil { value: true, .. }));
        }
    }

    #[test]
    fn global_start_and_stop_are_complementary() {
        let start = global_start_sequence();
        let stop = global_stop_sequence();
        assert_eq!(start.len(), 3);
        assert_eq!(stop.len(), 3);
    }

    #[test]
    fn calibration_sequences_delay_1000ms() {
        let zero = zero_calibration_sequence(2).unwrap();
        let weight = weight_calibration_sequence(2).unwrap();
        assert!(matches!(zero[1], Step::Delay(d) if d == Duration::from_millis(1000)));
        assert!(matches!(weight[1], Step::Delay(d) if d == Duration::from_millis(1000)));
    }
}
