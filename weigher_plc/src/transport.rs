//! The PLC transport boundary: a `PlcPort` trait with a real
//! Modbus/TCP implementation and an in-memory simulation, mirroring the
//! teacher's `HalDriver` pluggable-backend pattern (see
//! `evo_common::hal::driver`).

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream as TokioTcpStream;
use tokio::runtime::Runtime;
use tokio_modbus::client::Context as ModbusContext;
use tokio_modbus::prelude::*;
use tokio_modbus::slave::Slave;
use tracing::debug;

use crate::address_map::{coil_address, register_address, Address, HopperCoil, HopperRegister};
use weigher_common::hopper::HOPPER_COUNT;

/// Fallback register probe addresses, taken verbatim from the original
/// frontend's connection handshake: when holding register 0 doesn't
/// answer, these are tried in order before the device is declared
/// unreachable.
const PROBE_ADDRESSES: [u16; 5] = [20, 22, 24, 26, 28];

/// Errors a `PlcPort` implementation can produce.
#[derive(Debug, Clone, Error)]
pub enum PlcError {
    #[error("not connected to PLC")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device error: {0}")]
    DeviceError(String),
}

/// Abstraction over the Modbus/TCP device, so stage controllers and the
/// monitoring engine never depend on `tokio-modbus` directly.
pub trait PlcPort: Send + Sync {
    fn connect(&self) -> Result<(), PlcError>;
    fn disconnect(&self) -> Result<(), PlcError>;
    fn is_connected(&self) -> bool;

    fn read_holding_registers(&self, addr: Address, count: u16) -> Result<Vec<u16>, PlcError>;
    fn write_holding_register(&self, addr: Address, value: u16) -> Result<(), PlcError>;
    fn write_multiple_registers(&self, addr: Address, values: &[u16]) -> Result<(), PlcError>;

    fn read_coils(&self, addr: Address, count: u16) -> Result<Vec<bool>, PlcError>;
    fn write_coil(&self, addr: Address, value: bool) -> Result<(), PlcError>;
    fn write_multiple_coils(&self, addr: Address, values: &[bool]) -> Result<(), PlcError>;
}

/// Read a hopper's live weight register and convert it to a display
/// value: a signed 16-bit two's-complement reading divided by the ×10
/// unit factor.
pub fn decode_signed_weight(raw: u16) -> f64 {
    let signed = if raw <= 32767 { raw as i32 } else { raw as i32 - 65536 };
    signed as f64 / 10.0
}

/// Encode a display weight (grams, one decimal place of precision) back
/// into the ×10 register unit.
pub fn encode_weight(display: f64) -> u16 {
    (display * 10.0).round() as i16 as u16
}

struct ModbusInner {
    ctx: Option<ModbusContext>,
    runtime: Runtime,
}

/// Modbus/TCP implementation of `PlcPort`, driven synchronously through
/// a small single-threaded Tokio runtime the transport owns privately.
/// `tokio-modbus`'s client is async; the rest of the core is
/// thread-based, so every call here blocks on that inner runtime rather
/// than forcing async onto stage controllers (the same boundary
/// technique a blocking HTTP client wraps around an async one).
pub struct ModbusTransport {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
    inner: Mutex<ModbusInner>,
}

impl ModbusTransport {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8, timeout: Duration) -> Result<Self, PlcError> {
        let runtime = Runtime::new().map_err(|e| PlcError::Transport(e.to_string()))?;
        Ok(Self {
            host: host.into(),
            port,
            unit_id,
            timeout,
            inner: Mutex::new(ModbusInner { ctx: None, runtime }),
        })
    }

    /// Direct TCP pre-check ahead of the Modbus handshake: a bare
    /// socket connect with the configured timeout, independent of
    /// whether the device speaks Modbus correctly.
    fn tcp_precheck(&self) -> Result<(), PlcError> {
        let addr = format!("{}:{}", self.host, self.port);
        let socket_addrs = addr
            .parse()
            .or_else(|_| {
                use std::net::ToSocketAddrs;
                addr.to_socket_addrs()
                    .map_err(|e| e.to_string())
                    .and_then(|mut it| it.next().ok_or_else(|| "no address resolved".to_string()))
            })
            .map_err(PlcError::Transport)?;
        TcpStream::connect_timeout(&socket_addrs, self.timeout)
            .map(|_| ())
            .map_err(|e| PlcError::Transport(format!("tcp connect to {addr} failed: {e}")))
    }

    /// Vendor-compatibility read: try holding register 0, then the fixed
    /// probe set, before declaring the device unreachable at the
    /// Modbus protocol level.
    fn verify_communication(&self, guard: &mut ModbusInner) -> Result<(), PlcError> {
        let ctx = guard.ctx.as_mut().ok_or(PlcError::NotConnected)?;
        let probe = |ctx: &mut ModbusContext, addr: u16, rt: &Runtime| -> bool {
            rt.block_on(async { ctx.read_holding_registers(addr, 1).await }).is_ok()
        };
        if probe(ctx, 0, &guard.runtime) {
            return Ok(());
        }
        for addr in PROBE_ADDRESSES {
            if probe(ctx, addr, &guard.runtime) {
                return Ok(());
            }
        }
        Err(PlcError::Transport(
            "device did not respond to register 0 or any fallback probe address".to_string(),
        ))
    }
}

impl PlcPort for ModbusTransport {
    fn connect(&self) -> Result<(), PlcError> {
        self.tcp_precheck()?;
        let mut guard = self.inner.lock();
        let socket_addr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| PlcError::Transport(e.to_string()))?;
        let unit_id = self.unit_id;
        let ctx = guard
            .runtime
            .block_on(async move {
                let stream = TokioTcpStream::connect(socket_addr)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok::<_, String>(tokio_modbus::client::tcp::attach_slave(stream, Slave(unit_id)))
            })
            .map_err(PlcError::Transport)?;
        guard.ctx = Some(ctx);
        self.verify_communication(&mut guard)?;
        Ok(())
    }

    fn disconnect(&self) -> Result<(), PlcError> {
        let mut guard = self.inner.lock();
        guard.ctx = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().ctx.is_some()
    }

    fn read_holding_registers(&self, addr: Address, count: u16) -> Result<Vec<u16>, PlcError> {
        let mut guard = self.inner.lock();
        let timeout = self.timeout;
        let ctx = guard.ctx.as_mut().ok_or(PlcError::NotConnected)?;
        guard
            .runtime
            .block_on(async {
                tokio::time::timeout(timeout, ctx.read_holding_registers(addr.get(), count))
                    .await
                    .map_err(|_| PlcError::Transport("read_holding_registers timed out".to_string()))?
                    .map_err(|e| PlcError::Transport(e.to_string()))?
                    .map_err(|e| PlcError::Protocol(format!("{e:?}")))
            })
    }

    fn write_holding_register(&self, addr: Address, value: u16) -> Result<(), PlcError> {
        let mut guard = self.inner.lock();
        let timeout = self.timeout;
        let ctx = guard.ctx.as_mut().ok_or(PlcError::NotConnected)?;
        guard
            .runtime
            .block_on(async {
                tokio::time::timeout(timeout, ctx.write_single_register(addr.get(), value))
                    .await
                    .map_err(|_| PlcError::Transport("write_holding_register timed out".to_string()))?
                    .map_err(|e| PlcError::Transport(e.to_string()))?
                    .map_err(|e| PlcError::Protocol(format!("{e:?}")))
            })
    }

    fn write_multiple_registers(&self, addr: Address, values: &[u16]) -> Result<(), PlcError> {
        let mut guard = self.inner.lock();
        let timeout = self.timeout;
        let ctx = guard.ctx.as_mut().ok_or(PlcError::NotConnected)?;
        guard
            .runtime
            .block_on(async {
                tokio::time::timeout(timeout, ctx.write_multiple_registers(addr.get(), values))
                    .await
                    .map_err(|_| PlcError::Transport("write_multiple_registers timed out".to_string()))?
                    .map_err(|e| PlcError::Transport(e.to_string()))?
                    .map_err(|e| PlcError::Protocol(format!("{e:?}")))
            })
    }

    fn read_coils(&self, addr: Address, count: u16) -> Result<Vec<bool>, PlcError> {
        let mut guard = self.inner.lock();
        let timeout = self.timeout;
        let ctx = guard.ctx.as_mut().ok_or(PlcError::NotConnected)?;
        guard
            .runtime
            .block_on(async {
                tokio::time::timeout(timeout, ctx.read_coils(addr.get(), count))
                    .await
                    .map_err(|_| PlcError::Transport("read_coils timed out".to_string()))?
                    .map_err(|e| PlcError::Transport(e.to_string()))?
                    .map_err(|e| PlcError::Protocol(format!("{e:?}")))
            })
    }

    fn write_coil(&self, addr: Address, value: bool) -> Result<(), PlcError> {
        let mut guard = self.inner.lock();
        let timeout = self.timeout;
        let ctx = guard.ctx.as_mut().ok_or(PlcError::NotConnected)?;
        guard
            .runtime
            .block_on(async {
                tokio::time::timeout(timeout, ctx.write_single_coil(addr.get(), value))
                    .await
                    .map_err(|_| PlcError::Transport("write_coil timed out".to_string()))?
                    .map_err(|e| PlcError::Transport(e.to_string()))?
                    .map_err(|e| PlcError::Protocol(format!("{e:?}")))
            })
    }

    fn write_multiple_coils(&self, addr: Address, values: &[bool]) -> Result<(), PlcError> {
        let mut guard = self.inner.lock();
        let timeout = self.timeout;
        let ctx = guard.ctx.as_mut().ok_or(PlcError::NotConnected)?;
        guard
            .runtime
            .block_on(async {
                tokio::time::timeout(timeout, ctx.write_multiple_coils(addr.get(), values))
                    .await
                    .map_err(|_| PlcError::Transport("write_multiple_coils timed out".to_string()))?
                    .map_err(|e| PlcError::Transport(e.to_string()))?
                    .map_err(|e| PlcError::Protocol(format!("{e:?}")))
            })
    }
}

/// In-memory register/coil store, the direct analog of `evo_hal`'s
/// `drivers::simulation` driver: no real device, just enough behavior
/// to drive the stage controllers and the monitoring engine end to end
/// in tests and under `--simulate`.
struct SimState {
    registers: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    connected: bool,
}

/// Per-hopper progress of the background fill model, `None` while the
/// hopper's `Start` coil is low.
#[derive(Clone, Copy, Default)]
struct FillProgress {
    started_at: Option<Instant>,
}

/// Tracks the background fill model's own flat array, separate from
/// `SimState` so the tick thread doesn't have to share `SimState`'s lock
/// with the register/coil store for longer than one hopper at a time.
struct AutoFill {
    coarse_duration: Duration,
    total_duration: Duration,
    progress: Mutex<[FillProgress; HOPPER_COUNT]>,
}

pub struct SimulatedTransport {
    state: Mutex<SimState>,
    auto_fill: Option<Arc<AutoFill>>,
    auto_fill_stop: Arc<AtomicBool>,
    auto_fill_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                registers: HashMap::new(),
                coils: HashMap::new(),
                connected: false,
            }),
            auto_fill: None,
            auto_fill_stop: Arc::new(AtomicBool::new(false)),
            auto_fill_thread: Mutex::new(None),
        }
    }

    /// Build a `SimulatedTransport` whose `Weight` register advances on
    /// its own while a hopper's `Start` coil is set, the analog of
    /// `evo_hal`'s `SimulationDriver::cycle` advancing axis position
    /// each tick — except nothing upstream here calls `cycle(dt)` on a
    /// fixed schedule, so the transport runs its own tick thread instead
    /// of being driven by an external loop. `coarse_duration` is how
    /// long `CoarseActive` stays set after `Start` goes high;
    /// `total_duration` is how long until the register reaches its
    /// target and `TargetReached` is set. Existing tests that seed coils
    /// by hand keep using `new()`, which never starts this thread.
    pub fn with_auto_fill(coarse_duration: Duration, total_duration: Duration) -> Arc<Self> {
        let transport = Arc::new(Self {
            state: Mutex::new(SimState {
                registers: HashMap::new(),
                coils: HashMap::new(),
                connected: false,
            }),
            auto_fill: Some(Arc::new(AutoFill {
                coarse_duration,
                total_duration,
                progress: Mutex::new([FillProgress::default(); HOPPER_COUNT]),
            })),
            auto_fill_stop: Arc::new(AtomicBool::new(false)),
            auto_fill_thread: Mutex::new(None),
        });
        transport.spawn_auto_fill_thread();
        transport
    }

    fn spawn_auto_fill_thread(self: &Arc<Self>) {
        let transport = Arc::clone(self);
        let stop = Arc::clone(&self.auto_fill_stop);
        let handle = std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                transport.auto_fill_tick();
                std::thread::sleep(Duration::from_millis(100));
            }
        });
        *self.auto_fill_thread.lock() = Some(handle);
    }

    /// One tick of the background fill model: for every hopper whose
    /// `Start` coil is high, advance its `Weight` register linearly
    /// toward `TargetWeight` and flip `CoarseActive`/`TargetReached` once
    /// their configured durations have elapsed. A hopper whose `Start`
    /// coil drops resets its progress, ready for the next attempt.
    fn auto_fill_tick(&self) {
        let Some(auto_fill) = &self.auto_fill else { return };
        for i in 0..HOPPER_COUNT {
            let hopper_id = (i + 1) as u8;
            let Ok(start_addr) = coil_address(hopper_id, HopperCoil::Start) else { continue };
            if !self.peek_coil(start_addr) {
                auto_fill.progress.lock()[i] = FillProgress::default();
                continue;
            }

            let Ok(coarse_addr) = coil_address(hopper_id, HopperCoil::CoarseActive) else { continue };
            let Ok(target_addr) = coil_address(hopper_id, HopperCoil::TargetReached) else { continue };
            let Ok(target_weight_addr) = register_address(hopper_id, HopperRegister::TargetWeight) else {
                continue;
            };
            let Ok(weight_addr) = register_address(hopper_id, HopperRegister::Weight) else { continue };

            let (started_at, fresh_start) = {
                let mut progress = auto_fill.progress.lock();
                match progress[i].started_at {
                    Some(at) => (at, false),
                    None => {
                        let now = Instant::now();
                        progress[i].started_at = Some(now);
                        (now, true)
                    }
                }
            };
            if fresh_start {
                self.write_coil_unchecked(target_addr, false);
                self.write_register_unchecked(weight_addr, 0);
            }
            let elapsed = started_at.elapsed();

            if elapsed < auto_fill.coarse_duration {
                self.write_coil_unchecked(coarse_addr, true);
            } else if self.peek_coil(coarse_addr) {
                self.write_coil_unchecked(coarse_addr, false);
                debug!(hopper_id, "auto-fill cleared CoarseActive");
            }

            let target = decode_signed_weight(self.peek_register(target_weight_addr));
            let fraction = (elapsed.as_secs_f64() / auto_fill.total_duration.as_secs_f64()).min(1.0);
            self.write_register_unchecked(weight_addr, encode_weight(target * fraction));

            if elapsed >= auto_fill.total_duration && !self.peek_coil(target_addr) {
                self.write_coil_unchecked(target_addr, true);
                debug!(hopper_id, "auto-fill set TargetReached");
            }
        }
    }

    fn write_coil_unchecked(&self, addr: Address, value: bool) {
        self.state.lock().coils.insert(addr.get(), value);
    }

    fn write_register_unchecked(&self, addr: Address, value: u16) {
        self.state.lock().registers.insert(addr.get(), value);
    }

    /// Stop the background fill thread, if one was started. Idempotent.
    pub fn shutdown_auto_fill(&self) {
        self.auto_fill_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.auto_fill_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Directly set a register's value, bypassing write protocol —
    /// used by tests to arrange starting conditions.
    pub fn seed_register(&self, addr: Address, value: u16) {
        self.state.lock().registers.insert(addr.get(), value);
    }

    /// Directly set a coil's value, bypassing write protocol.
    pub fn seed_coil(&self, addr: Address, value: bool) {
        self.state.lock().coils.insert(addr.get(), value);
    }

    pub fn peek_register(&self, addr: Address) -> u16 {
        *self.state.lock().registers.get(&addr.get()).unwrap_or(&0)
    }

    pub fn peek_coil(&self, addr: Address) -> bool {
        *self.state.lock().coils.get(&addr.get()).unwrap_or(&false)
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.shutdown_auto_fill();
    }
}

impl PlcPort for SimulatedTransport {
    fn connect(&self) -> Result<(), PlcError> {
        self.state.lock().connected = true;
        Ok(())
    }

    fn disconnect(&self) -> Result<(), PlcError> {
        self.state.lock().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn read_holding_registers(&self, addr: Address, count: u16) -> Result<Vec<u16>, PlcError> {
        let guard = self.state.lock();
        if !guard.connected {
            return Err(PlcError::NotConnected);
        }
        Ok((0..count)
            .map(|i| *guard.registers.get(&(addr.get() + i)).unwrap_or(&0))
            .collect())
    }

    fn write_holding_register(&self, addr: Address, value: u16) -> Result<(), PlcError> {
        let mut guard = self.state.lock();
        if !guard.connected {
            return Err(PlcError::NotConnected);
        }
        guard.registers.insert(addr.get(), value);
        Ok(())
    }

    fn write_multiple_registers(&self, addr: Address, values: &[u16]) -> Result<(), PlcError> {
        let mut guard = self.state.lock();
        if !guard.connected {
            return Err(PlcError::NotConnected);
        }
        for (i, value) in values.iter().enumerate() {
            guard.registers.insert(addr.get() + i as u16, *value);
        }
        Ok(())
    }

    fn read_coils(&self, addr: Address, count: u16) -> Result<Vec<bool>, PlcError> {
        let guard = self.state.lock();
        if !guard.connected {
            return Err(PlcError::NotConnected);
        }
        Ok((0..count)
            .map(|i| *guard.coils.get(&(addr.get() + i)).unwrap_or(&false))
            .collect())
    }

    fn write_coil(&self, addr: Address, value: bool) -> Result<(), PlcError> {
        let mut guard = self.state.lock();
        if !guard.connected {
            return Err(PlcError::NotConnected);
        }
        guard.coils.insert(addr.get(), value);
        Ok(())
    }

    fn write_multiple_coils(&self, addr: Address, values: &[bool]) -> Result<(), PlcError> {
        let mut guard = self.state.lock();
        if !guard.connected {
            return Err(PlcError::NotConnected);
        }
        for (i, value) in values.iter().enumerate() {
            guard.coils.insert(addr.get() + i as u16, *value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_signed_weight_handles_positive_and_negative() {
        assert_eq!(decode_signed_weight(5000), 500.0);
        assert_eq!(decode_signed_weight(0), 0.0);
        // 65536 - 10 = 65526 represents -1.0g
        assert_eq!(decode_signed_weight(65526), -1.0);
    }

    #[test]
    fn encode_weight_round_trips_through_decode() {
        for value in [0.0, 123.4, -12.3, 500.0] {
            let encoded = encode_weight(value);
            assert_eq!(decode_signed_weight(encoded), value);
        }
    }

    #[test]
    fn simulated_transport_requires_connect_before_use() {
        let sim = SimulatedTransport::new();
        let addr = Address(10);
        assert!(matches!(
            sim.read_holding_registers(addr, 1),
            Err(PlcError::NotConnected)
        ));
        sim.connect().unwrap();
        assert!(sim.read_holding_registers(addr, 1).is_ok());
    }

    #[test]
    fn simulated_transport_write_then_read_register() {
        let sim = SimulatedTransport::new();
        sim.connect().unwrap();
        let addr = Address(10);
        sim.write_holding_register(addr, 4500).unwrap();
        assert_eq!(sim.read_holding_registers(addr, 1).unwrap(), vec![4500]);
    }

    #[test]
    fn simulated_transport_write_multiple_coils() {
        let sim = SimulatedTransport::new();
        sim.connect().unwrap();
        let addr = Address(0);
        sim.write_multiple_coils(addr, &[true, false, true]).unwrap();
        assert_eq!(sim.read_coils(addr, 3).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn simulated_transport_peek_helpers_match_writes() {
        let sim = SimulatedTransport::new();
        sim.connect().unwrap();
        let addr = Address(5);
        sim.seed_register(addr, 999);
        sim.seed_coil(Address(6), true);
        assert_eq!(sim.peek_register(addr), 999);
        assert!(sim.peek_coil(Address(6)));
    }

    #[test]
    fn auto_fill_advances_weight_and_sets_target_reached() {
        let sim = SimulatedTransport::with_auto_fill(Duration::from_millis(150), Duration::from_millis(400));
        sim.connect().unwrap();
        let target_addr = register_address(2, HopperRegister::TargetWeight).unwrap();
        let weight_addr = register_address(2, HopperRegister::Weight).unwrap();
        let coarse_addr = coil_address(2, HopperCoil::CoarseActive).unwrap();
        let reached_addr = coil_address(2, HopperCoil::TargetReached).unwrap();
        let start_addr = coil_address(2, HopperCoil::Start).unwrap();

        sim.write_holding_register(target_addr, encode_weight(500.0)).unwrap();
        sim.write_coil(start_addr, true).unwrap();

        std::thread::sleep(Duration::from_millis(250));
        assert!(!sim.peek_coil(coarse_addr), "CoarseActive should have cleared by 250ms");
        assert!(!sim.peek_coil(reached_addr), "TargetReached should not fire before total_duration");
        let mid_weight = decode_signed_weight(sim.peek_register(weight_addr));
        assert!(mid_weight > 0.0 && mid_weight < 500.0);

        std::thread::sleep(Duration::from_millis(300));
        assert!(sim.peek_coil(reached_addr));
        assert_eq!(decode_signed_weight(sim.peek_register(weight_addr)), 500.0);

        sim.write_coil(start_addr, false).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        sim.shutdown_auto_fill();
    }

    #[test]
    fn auto_fill_is_opt_in_and_does_not_run_for_new() {
        let sim = SimulatedTransport::new();
        sim.connect().unwrap();
        let start_addr = coil_address(1, HopperCoil::Start).unwrap();
        let weight_addr = register_address(1, HopperRegister::Weight).unwrap();
        sim.write_coil(start_addr, true).unwrap();
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(sim.peek_register(weight_addr), 0, "plain new() must never auto-advance");
    }
}
