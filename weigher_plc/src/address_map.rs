//! The Modbus address map: pure, `const`-backed lookup tables.
//!
//! No heuristics and no runtime computation — every address below is a
//! fixed offset from a per-hopper base, the same fixed-stride-per-hopper
//! layout the original frontend's `plc_addresses` module used (that
//! module itself wasn't part of the retrieved source; the stride here
//! is a closed, internally consistent table built to the same shape).

use thiserror::Error;
use weigher_common::hopper::{HopperId, HOPPER_COUNT};

/// A single Modbus address. Register and coil addresses live in
/// separate Modbus address spaces; which space an `Address` belongs to
/// is determined by which `PlcPort` method the caller uses it with, not
/// by the type itself — matching the wire protocol it models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub u16);

impl Address {
    pub const fn get(self) -> u16 {
        self.0
    }
}

/// Looking up an address failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressMapError {
    #[error("invalid hopper id {0}: must be 1..={HOPPER_COUNT}")]
    InvalidHopper(u8),
}

/// Per-hopper holding-register roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopperRegister {
    TargetWeight,
    CoarseSpeed,
    FineSpeed,
    CoarseAdvance,
    FineAdvance,
    FallValue,
    Weight,
}

/// Per-hopper coil roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopperCoil {
    Start,
    Stop,
    Discharge,
    Clean,
    Disable,
    CoarseActive,
    FineActive,
    Jog,
    TargetReached,
    ZeroCalibration,
    WeightCalibration,
}

/// Global (non-hopper-indexed) coil roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalCoil {
    GlobalStart,
    GlobalStop,
    GlobalDischarge,
    GlobalClear,
    PackageCountClear,
    PackagingMachineStop,
}

/// Global (non-hopper-indexed) register roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalRegister {
    PackageCountRegister,
}

/// Distance in register units between one hopper's register block and
/// the next.
const REGISTER_STRIDE: u16 = 20;
/// Distance in coil units between one hopper's coil block and the next.
const COIL_STRIDE: u16 = 20;

const REGISTER_BASE: u16 = 0;
const COIL_BASE: u16 = 0;

const GLOBAL_COIL_BASE: u16 = 500;
const GLOBAL_REGISTER_BASE: u16 = 500;

fn hopper_register_base(hopper: HopperId) -> u16 {
    REGISTER_BASE + (hopper.index() as u16) * REGISTER_STRIDE
}

fn hopper_coil_base(hopper: HopperId) -> u16 {
    COIL_BASE + (hopper.index() as u16) * COIL_STRIDE
}

/// Address of `role`'s holding register for `hopper`.
pub fn register_address(hopper_id: u8, role: HopperRegister) -> Result<Address, AddressMapError> {
    let hopper = HopperId::new(hopper_id).map_err(|e| AddressMapError::InvalidHopper(e.0))?;
    let base = hopper_register_base(hopper);
    let offset = match role {
        HopperRegister::TargetWeight => 0,
        HopperRegister::CoarseSpeed => 2,
        HopperRegister::FineSpeed => 4,
        HopperRegister::CoarseAdvance => 6,
        HopperRegister::FineAdvance => 8,
        HopperRegister::FallValue => 10,
        HopperRegister::Weight => 12,
    };
    Ok(Address(base + offset))
}

/// Address of `role`'s coil for `hopper`.
pub fn coil_address(hopper_id: u8, role: HopperCoil) -> Result<Address, AddressMapError> {
    let hopper = HopperId::new(hopper_id).map_err(|e| AddressMapError::InvalidHopper(e.0))?;
    let base = hopper_coil_base(hopper);
    let offset = match role {
        HopperCoil::Start => 0,
        HopperCoil::Stop => 1,
        HopperCoil::Discharge => 2,
        HopperCoil::Clean => 3,
        HopperCoil::Disable => 4,
        HopperCoil::CoarseActive => 5,
        HopperCoil::FineActive => 6,
        HopperCoil::Jog => 7,
        HopperCoil::TargetReached => 8,
        HopperCoil::ZeroCalibration => 9,
        HopperCoil::WeightCalibration => 10,
    };
    Ok(Address(base + offset))
}

/// Address of a global coil.
pub const fn global_coil_address(role: GlobalCoil) -> Address {
    let offset = match role {
        GlobalCoil::GlobalStart => 0,
        GlobalCoil::GlobalStop => 1,
        GlobalCoil::GlobalDischarge => 2,
        GlobalCoil::GlobalClear => 3,
        GlobalCoil::PackageCountClear => 4,
        GlobalCoil::PackagingMachineStop => 5,
    };
    Address(GLOBAL_COIL_BASE + offset)
}

/// Address of a global register.
pub const fn global_register_address(role: GlobalRegister) -> Address {
    let offset = match role {
        GlobalRegister::PackageCountRegister => 0,
    };
    Address(GLOBAL_REGISTER_BASE + offset)
}

/// Coil addresses of `role` for every hopper, in hopper order 1..=6 —
/// used by the monitoring engine's batch reads.
pub fn all_hopper_coils(role: HopperCoil) -> [Address; HOPPER_COUNT] {
    std::array::from_fn(|i| {
        let hopper = HopperId::new((i + 1) as u8).expect("1..=HOPPER_COUNT is always valid");
        coil_address(hopper.get(), role).expect("validated hopper id")
    })
}
