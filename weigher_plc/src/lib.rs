//! # Weigher PLC
//!
//! The Modbus/TCP boundary: address map, transport (real and
//! simulated), the monitoring engine, and the bucket command-sequence
//! DSL. Nothing in here knows about analysis verdicts or stage
//! controllers — it only knows how to talk to the PLC and turn raw
//! polling into edge events.

pub mod address_map;
pub mod bucket_control;
pub mod monitor;
pub mod transport;

pub mod prelude {
    pub use crate::address_map::{Address, AddressMapError, GlobalCoil, GlobalRegister, HopperCoil, HopperRegister};
    pub use crate::bucket_control::{CommandSequencer, RealSleeper, Sleeper, Step};
    pub use crate::monitor::{Monitor, MonitorEvent};
    pub use crate::transport::{ModbusTransport, PlcError, PlcPort, SimulatedTransport};
}
