//! The monitoring engine: a single background thread that polls the
//! PLC's status coils and live weight registers and turns raw polling
//! into edge-triggered events for whichever stage controller currently
//! owns a hopper.
//!
//! Shaped like `evo_hal::core::HalCore`'s RT tick loop, but reworked
//! into an explicit `mpsc` event channel per armed hopper rather than a
//! cross-thread callback registry, so a stage controller's worker
//! thread can `recv()` without the monitoring thread ever blocking on
//! it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use weigher_common::hopper::{HopperId, HOPPER_COUNT};
use weigher_common::stage::Stage;

use crate::address_map::{all_hopper_coils, coil_address, register_address, HopperCoil, HopperRegister};
use crate::transport::{decode_signed_weight, PlcPort};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const WEIGHT_WINDOW: Duration = Duration::from_secs(15);

/// Events the monitoring engine delivers to whichever stage controller
/// armed the hopper in question.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    TargetReached { hopper: HopperId, elapsed_ms: u64 },
    CoarseStatusChanged { hopper: HopperId, active: bool },
    StarvationDetected { hopper: HopperId, stage: Stage },
}

struct ArmedHopper {
    tag: Stage,
    sender: Sender<MonitorEvent>,
    arm_instant: Instant,
    last_target_reached: Option<bool>,
    last_coarse_active: Option<bool>,
    starvation_enabled: bool,
    starvation_fired: bool,
    weight_window: VecDeque<(Instant, f64)>,
    starvation_debounced_until: Option<Instant>,
}

impl ArmedHopper {
    fn new(tag: Stage, sender: Sender<MonitorEvent>, starvation_enabled: bool) -> Self {
        Self {
            tag,
            sender,
            arm_instant: Instant::now(),
            last_target_reached: None,
            last_coarse_active: None,
            starvation_enabled,
            starvation_fired: false,
            weight_window: VecDeque::new(),
            starvation_debounced_until: None,
        }
    }
}

struct MonitorState {
    armed: HashMap<HopperId, ArmedHopper>,
}

/// Owns the background poll thread and the armed-hopper registry.
pub struct Monitor {
    port: Arc<dyn PlcPort>,
    state: Arc<Mutex<MonitorState>>,
    starvation_threshold_g: f64,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(port: Arc<dyn PlcPort>, starvation_threshold_g: f64) -> Self {
        Self {
            port,
            state: Arc::new(Mutex::new(MonitorState { armed: HashMap::new() })),
            starvation_threshold_g,
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Arm a hopper: events for it will be delivered on `sender` until
    /// `disarm` is called. `starvation_enabled` controls whether the
    /// sliding-weight-window check runs for this hopper while it's
    /// armed; the caller decides per stage whether a stalled hopper
    /// should be treated as a failure.
    pub fn arm(&self, hopper: HopperId, tag: Stage, starvation_enabled: bool, sender: Sender<MonitorEvent>) {
        let mut state = self.state.lock();
        state.armed.insert(hopper, ArmedHopper::new(tag, sender, starvation_enabled));
    }

    pub fn disarm(&self, hopper: HopperId) {
        self.state.lock().armed.remove(&hopper);
    }

    pub fn is_armed(&self, hopper: HopperId) -> bool {
        self.state.lock().armed.contains_key(&hopper)
    }

    /// Spawn the background poll thread. Returns immediately; call
    /// `shutdown` to stop it.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || this.run_loop());
        *self.handle.lock() = Some(handle);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_loop(&self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let armed_count = self.state.lock().armed.len();
            if armed_count == 0 {
                std::thread::sleep(IDLE_POLL_INTERVAL);
                continue;
            }
            if let Err(e) = self.tick() {
                warn!(error = %e, "monitoring engine tick failed");
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// One polling tick: batch-read target-reached (always), batch-read
    /// coarse-active (only if an adaptive-learning hopper is armed),
    /// per-hopper weight reads (only for starvation-enabled hoppers),
    /// then edge-detect and dispatch events.
    fn tick(&self) -> Result<(), crate::transport::PlcError> {
        let target_reached_addrs = all_hopper_coils(HopperCoil::TargetReached);
        let target_reached = self.read_each(&target_reached_addrs)?;

        let needs_coarse_active = {
            let state = self.state.lock();
            state.armed.values().any(|a| a.tag == Stage::AdaptiveLearning)
        };
        let coarse_active = if needs_coarse_active {
            let addrs = all_hopper_coils(HopperCoil::CoarseActive);
            Some(self.read_each(&addrs)?)
        } else {
            None
        };

        let now = Instant::now();
        let mut state = self.state.lock();
        let hoppers: Vec<HopperId> = state.armed.keys().copied().collect();

        for hopper in hoppers {
            let idx = hopper.index();
            let target_now = target_reached[idx];

            let (prev_target, was_bootstrap_target) = {
                let armed = state.armed.get(&hopper).unwrap();
                (armed.last_target_reached, armed.last_target_reached.is_none())
            };

            if was_bootstrap_target {
                state.armed.get_mut(&hopper).unwrap().last_target_reached = Some(target_now);
            } else if prev_target == Some(false) && target_now {
                let armed = state.armed.get_mut(&hopper).unwrap();
                let elapsed_ms = now.duration_since(armed.arm_instant).as_millis() as u64;
                armed.last_target_reached = Some(target_now);
                let _ = armed.sender.send(MonitorEvent::TargetReached { hopper, elapsed_ms });
            } else {
                state.armed.get_mut(&hopper).unwrap().last_target_reached = Some(target_now);
            }

            if let Some(coarse) = &coarse_active {
                let active_now = coarse[idx];
                let armed = state.armed.get_mut(&hopper).unwrap();
                if armed.tag == Stage::AdaptiveLearning {
                    match armed.last_coarse_active {
                        None => armed.last_coarse_active = Some(active_now),
                        Some(true) if !active_now => {
                            armed.last_coarse_active = Some(active_now);
                            let _ = armed
                                .sender
                                .send(MonitorEvent::CoarseStatusChanged { hopper, active: false });
                        }
                        _ => armed.last_coarse_active = Some(active_now),
                    }
                }
            }

            let starvation_enabled = state.armed.get(&hopper).unwrap().starvation_enabled;
            if starvation_enabled && !target_now {
                self.check_starvation(&mut state, hopper, now)?;
            }
        }

        Ok(())
    }

    fn check_starvation(
        &self,
        state: &mut MonitorState,
        hopper: HopperId,
        now: Instant,
    ) -> Result<(), crate::transport::PlcError> {
        let start_addr = coil_address(hopper.get(), HopperCoil::Start)
            .map_err(|e| crate::transport::PlcError::Protocol(e.to_string()))?;
        let weight_addr = register_address(hopper.get(), HopperRegister::Weight)
            .map_err(|e| crate::transport::PlcError::Protocol(e.to_string()))?;
        let started = self.port.read_coils(start_addr, 1)?[0];
        if !started {
            return Ok(());
        }
        let raw = self.port.read_holding_registers(weight_addr, 1)?[0];
        let weight = decode_signed_weight(raw);

        let armed = state.armed.get_mut(&hopper).unwrap();
        armed.weight_window.push_back((now, weight));
        while let Some((t, _)) = armed.weight_window.front() {
            if now.duration_since(*t) > WEIGHT_WINDOW {
                armed.weight_window.pop_front();
            } else {
                break;
            }
        }

        let window_full = armed
            .weight_window
            .front()
            .map(|(t, _)| now.duration_since(*t) >= WEIGHT_WINDOW)
            .unwrap_or(false);
        if !window_full {
            return Ok(());
        }

        if let Some(until) = armed.starvation_debounced_until {
            if now < until {
                return Ok(());
            }
        }

        let min = armed.weight_window.iter().map(|(_, w)| *w).fold(f64::MAX, f64::min);
        let max = armed.weight_window.iter().map(|(_, w)| *w).fold(f64::MIN, f64::max);
        let delta = max - min;

        if delta < self.starvation_threshold_g && !armed.starvation_fired {
            armed.starvation_fired = true;
            armed.starvation_debounced_until =
                Some(now + Duration::from_millis(200 * hopper.get() as u64));
            let tag = armed.tag;
            debug!(?hopper, delta, "starvation detected");
            let _ = armed.sender.send(MonitorEvent::StarvationDetected { hopper, stage: tag });
        }
        Ok(())
    }

    fn read_each(&self, addrs: &[crate::address_map::Address; HOPPER_COUNT]) -> Result<[bool; HOPPER_COUNT], crate::transport::PlcError> {
        let mut out = [false; HOPPER_COUNT];
        for (i, addr) in addrs.iter().enumerate() {
            out[i] = self.port.read_coils(*addr, 1)?[0];
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedTransport;
    use std::sync::mpsc;

    fn make_monitor() -> (Arc<SimulatedTransport>, Arc<Monitor>) {
        let sim = Arc::new(SimulatedTransport::new());
        sim.connect().unwrap();
        let monitor = Arc::new(Monitor::new(sim.clone() as Arc<dyn PlcPort>, 0.3));
        (sim, monitor)
    }

    #[test]
    fn arm_and_disarm_track_membership() {
        let (_, monitor) = make_monitor();
        let hopper = HopperId::new(1).unwrap();
        let (tx, _rx) = mpsc::channel();
        assert!(!monitor.is_armed(hopper));
        monitor.arm(hopper, Stage::CoarseTime, false, tx);
        assert!(monitor.is_armed(hopper));
        monitor.disarm(hopper);
        assert!(!monitor.is_armed(hopper));
    }

    #[test]
    fn disarm_on_empty_set_is_a_no_op() {
        let (_, monitor) = make_monitor();
        let hopper = HopperId::new(1).unwrap();
        monitor.disarm(hopper);
        assert!(!monitor.is_armed(hopper));
    }

    #[test]
    fn bootstrap_tick_does_not_fire_edge() {
        let (sim, monitor) = make_monitor();
        let hopper = HopperId::new(1).unwrap();
        let addr = coil_address(1, HopperCoil::TargetReached).unwrap();
        sim.seed_coil(addr, true);
        let (tx, rx) = mpsc::channel();
        monitor.arm(hopper, Stage::CoarseTime, false, tx);
        monitor.tick().unwrap();
        assert!(rx.try_recv().is_err(), "bootstrap observation must not fire an edge");
    }

    #[test]
    fn rising_edge_on_target_reached_fires_event() {
        let (sim, monitor) = make_monitor();
        let hopper = HopperId::new(2).unwrap();
        let addr = coil_address(2, HopperCoil::TargetReached).unwrap();
        let (tx, rx) = mpsc::channel();
        monitor.arm(hopper, Stage::CoarseTime, false, tx);
        // First tick bootstraps at false.
        monitor.tick().unwrap();
        assert!(rx.try_recv().is_err());
        // Rising edge.
        sim.seed_coil(addr, true);
        monitor.tick().unwrap();
        let event = rx.try_recv().expect("edge should fire");
        assert!(matches!(event, MonitorEvent::TargetReached { hopper: h, .. } if h == hopper));
    }

    #[test]
    fn falling_edge_on_coarse_active_fires_for_adaptive_learning_only() {
        let (sim, monitor) = make_monitor();
        let hopper = HopperId::new(3).unwrap();
        let coarse_addr = coil_address(3, HopperCoil::CoarseActive).unwrap();
        sim.seed_coil(coarse_addr, true);
        let (tx, rx) = mpsc::channel();
        monitor.arm(hopper, Stage::AdaptiveLearning, false, tx);
        monitor.tick().unwrap();
        assert!(rx.try_recv().is_err(), "bootstrap must not fire");
        sim.seed_coil(coarse_addr, false);
        monitor.tick().unwrap();
        let event = rx.try_recv().expect("falling edge should fire");
        assert!(matches!(
            event,
            MonitorEvent::CoarseStatusChanged { hopper: h, active: false } if h == hopper
        ));
    }

    #[test]
    fn non_adaptive_hopper_never_reads_coarse_active() {
        let (sim, monitor) = make_monitor();
        let hopper = HopperId::new(4).unwrap();
        let (tx, rx) = mpsc::channel();
        monitor.arm(hopper, Stage::CoarseTime, false, tx);
        monitor.tick().unwrap();
        assert!(rx.try_recv().is_err());
        let _ = sim;
    }
}
