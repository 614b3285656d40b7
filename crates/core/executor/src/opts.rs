use std::str::FromStr;

use ldc_primitives::{
    consts::{CONTRACT_MAX_SIZE, VM_MAX_RAM},
    GeometryError, MemoryGeometry,
};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;

const MAX_RAM_VAR: &str = "LDC_MAX_RAM";
const MAX_CONTRACT_SIZE_VAR: &str = "LDC_MAX_CONTRACT_SIZE";
const STACK_POLICY_VAR: &str = "LDC_STACK_POLICY";

/// What a load does when the stack holds live data.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StackPolicy {
    /// Reject the load with [`crate::LoadError::StackNotEmpty`].
    #[default]
    Strict,
    /// Move the stack onto the heap for the duration of the load.
    Relocate,
}

/// An error raised while reading [`LdcCoreOpts`] from the environment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptsError {
    #[error("{var} must be an unsigned integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var} must be `strict` or `relocate`, got {value:?}")]
    InvalidStackPolicy { var: &'static str, value: String },
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

/// Options for the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LdcCoreOpts {
    pub geometry: MemoryGeometry,
    pub stack_policy: StackPolicy,
}

impl Default for LdcCoreOpts {
    fn default() -> Self {
        Self { geometry: MemoryGeometry::default(), stack_policy: StackPolicy::default() }
    }
}

impl LdcCoreOpts {
    /// Read the options from the `LDC_MAX_RAM`, `LDC_MAX_CONTRACT_SIZE` and `LDC_STACK_POLICY`
    /// environment variables, falling back to the defaults for unset variables.
    pub fn from_env() -> Result<Self, OptsError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`LdcCoreOpts::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, OptsError> {
        let number = |var: &'static str, default: u64| match lookup(var) {
            Some(value) => value
                .trim()
                .replace('_', "")
                .parse::<u64>()
                .map_err(|_| OptsError::InvalidNumber { var, value }),
            None => Ok(default),
        };

        let max_ram = number(MAX_RAM_VAR, VM_MAX_RAM)?;
        let max_contract_size = number(MAX_CONTRACT_SIZE_VAR, CONTRACT_MAX_SIZE)?;
        let geometry = MemoryGeometry::new(max_ram, max_contract_size)?;

        let stack_policy = match lookup(STACK_POLICY_VAR) {
            Some(value) => StackPolicy::from_str(value.trim().to_lowercase().as_str())
                .map_err(|_| OptsError::InvalidStackPolicy { var: STACK_POLICY_VAR, value })?,
            None => StackPolicy::default(),
        };

        Ok(Self { geometry, stack_policy })
    }
}
