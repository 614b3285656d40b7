use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{CONTRACT_ID_SIZE, CONTRACT_MAX_SIZE, VM_MAX_RAM};

/// An opaque handle identifying a deployed contract.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractId([u8; CONTRACT_ID_SIZE]);

impl ContractId {
    /// The all-zero contract id.
    pub const ZEROED: Self = Self([0; CONTRACT_ID_SIZE]);

    pub const fn new(bytes: [u8; CONTRACT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; CONTRACT_ID_SIZE] {
        &self.0
    }
}

impl From<[u8; CONTRACT_ID_SIZE]> for ContractId {
    fn from(bytes: [u8; CONTRACT_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContractId({self})")
    }
}

/// An error parsing a [`ContractId`] from its hex form.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ContractIdParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {CONTRACT_ID_SIZE} bytes, got {0}")]
    Length(usize),
}

impl FromStr for ContractId {
    type Err = ContractIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
        let len = bytes.len();
        let bytes: [u8; CONTRACT_ID_SIZE] =
            bytes.try_into().map_err(|_| ContractIdParseError::Length(len))?;
        Ok(Self(bytes))
    }
}

/// An invalid [`MemoryGeometry`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    #[error("total memory must be non-zero")]
    ZeroMemory,
    #[error("max contract size {max_contract_size} exceeds total memory {max_ram}")]
    ContractLargerThanMemory { max_ram: u64, max_contract_size: u64 },
}

/// The fixed memory geometry of a VM instance.
///
/// Constructed once when the VM instance starts and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryGeometry {
    max_ram: u64,
    max_contract_size: u64,
}

impl MemoryGeometry {
    /// Create a new [`MemoryGeometry`], checking that a contract fits in memory.
    pub const fn new(max_ram: u64, max_contract_size: u64) -> Result<Self, GeometryError> {
        if max_ram == 0 {
            return Err(GeometryError::ZeroMemory);
        }
        if max_contract_size > max_ram {
            return Err(GeometryError::ContractLargerThanMemory { max_ram, max_contract_size });
        }
        Ok(Self { max_ram, max_contract_size })
    }

    /// Total addressable memory in bytes.
    pub const fn max_ram(&self) -> u64 {
        self.max_ram
    }

    /// Maximum size of a single loaded contract in bytes.
    pub const fn max_contract_size(&self) -> u64 {
        self.max_contract_size
    }
}

impl Default for MemoryGeometry {
    fn default() -> Self {
        Self { max_ram: VM_MAX_RAM, max_contract_size: CONTRACT_MAX_SIZE }
    }
}
