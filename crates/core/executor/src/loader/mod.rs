//! Loading the bytecode of deployed contracts into the running program's code region.
//!
//! A load runs through four steps: the size of the target is queried, the prospective load is
//! validated against the memory geometry and the live frame, the stack is optionally moved out
//! of the way, and finally the code is copied.

mod bounds;
mod relocate;
mod size;

pub use bounds::*;
pub use relocate::*;
pub use size::*;

use std::fmt;

use ldc_primitives::ContractId;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use thiserror::Error;

use crate::{
    memory::MemoryError,
    state::{ExecutionState, LoadedCode},
    storage::ContractStorage,
};

/// Why the raw code-copy primitive failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CopyFault {
    #[error("the contract code is unavailable")]
    SourceUnavailable,
    #[error("the contract code holds only {available} bytes")]
    SourceTruncated { available: u64 },
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Why restoring an evacuated stack failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RestoreFault {
    #[error("stash at {addr:#x} records {found} bytes, expected {expected}")]
    CorruptStash { addr: u64, expected: u64, found: u64 },
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// An error raised while loading contract code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("contract {0} is not deployed")]
    UnknownProgram(ContractId),

    #[error("loading {size} bytes at {stack_start:#x} exceeds the {max_ram} bytes of memory")]
    MemoryExceeded { stack_start: u64, size: u64, max_ram: u64 },

    #[error("the stack holds live data between {stack_start:#x} and {stack_pointer:#x}")]
    StackNotEmpty { stack_start: u64, stack_pointer: u64 },

    #[error(
        "loading {size} bytes at {stack_start:#x} collides with the heap at {heap_pointer:#x}"
    )]
    StackHeapCollision { stack_start: u64, size: u64, heap_pointer: u64 },

    #[error("contract of {size} bytes exceeds the maximum contract size of {max_contract_size}")]
    ProgramTooLarge { size: u64, max_contract_size: u64 },

    #[error("failed to stash {stack_size} stack bytes on the heap")]
    StashAllocationFailed {
        stack_size: u64,
        #[source]
        source: MemoryError,
    },

    #[error("range {offset}..{offset}+{length} is outside the {code_size} bytes of {contract_id}")]
    CodeRangeOutOfBounds { contract_id: ContractId, offset: u64, length: u64, code_size: u64 },

    #[error("reached the limit of {max_loads} loads for this execution")]
    LoadLimitReached { max_loads: usize },

    #[error("copying {length} bytes at offset {offset} from {contract_id} faulted")]
    CodeCopyFault {
        contract_id: ContractId,
        offset: u64,
        length: u64,
        #[source]
        source: CopyFault,
    },

    #[error("failed to restore {stack_size} stashed stack bytes")]
    StackRestoreFault {
        stack_size: u64,
        #[source]
        source: RestoreFault,
    },

    #[error("execution halted after a fatal load fault")]
    ExecutionHalted,
}

/// The kind of a [`LoadError`], without its payload.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    Serialize,
    Deserialize,
)]
pub enum LoadErrorKind {
    UnknownProgram,
    MemoryExceeded,
    StackNotEmpty,
    StackHeapCollision,
    ProgramTooLarge,
    StashAllocationFailed,
    CodeRangeOutOfBounds,
    LoadLimitReached,
    CodeCopyFault,
    StackRestoreFault,
    ExecutionHalted,
}

impl LoadErrorKind {
    /// Whether errors of this kind leave the execution in an unknown state.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::CodeCopyFault | Self::StackRestoreFault | Self::ExecutionHalted)
    }
}

impl LoadError {
    #[must_use]
    pub const fn kind(&self) -> LoadErrorKind {
        match self {
            Self::UnknownProgram(_) => LoadErrorKind::UnknownProgram,
            Self::MemoryExceeded { .. } => LoadErrorKind::MemoryExceeded,
            Self::StackNotEmpty { .. } => LoadErrorKind::StackNotEmpty,
            Self::StackHeapCollision { .. } => LoadErrorKind::StackHeapCollision,
            Self::ProgramTooLarge { .. } => LoadErrorKind::ProgramTooLarge,
            Self::StashAllocationFailed { .. } => LoadErrorKind::StashAllocationFailed,
            Self::CodeRangeOutOfBounds { .. } => LoadErrorKind::CodeRangeOutOfBounds,
            Self::LoadLimitReached { .. } => LoadErrorKind::LoadLimitReached,
            Self::CodeCopyFault { .. } => LoadErrorKind::CodeCopyFault,
            Self::StackRestoreFault { .. } => LoadErrorKind::StackRestoreFault,
            Self::ExecutionHalted => LoadErrorKind::ExecutionHalted,
        }
    }

    /// Whether the execution can continue after this error.
    ///
    /// Every rejection raised before code is copied leaves the machine untouched; faults raised
    /// while copying or restoring do not.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}

/// The progress of a single load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadPhase {
    Idle,
    SizeKnown,
    Validated,
    StackEvacuated,
    Loaded,
    StackRestored,
    Done,
    Rejected(LoadErrorKind),
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(kind) => write!(f, "Rejected({kind})"),
            phase => fmt::Debug::fmt(phase, f),
        }
    }
}

/// The part of a contract's code to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadRange {
    /// The whole contract.
    Full,
    /// `length` bytes starting at `offset`.
    Partial { offset: u64, length: u64 },
}

impl LoadRange {
    /// Resolve the range against a contract of `code_size` bytes into `(offset, length)`.
    pub fn resolve(self, contract_id: ContractId, code_size: u64) -> Result<(u64, u64), LoadError> {
        match self {
            Self::Full => Ok((0, code_size)),
            Self::Partial { offset, length } => match offset.checked_add(length) {
                Some(end) if end <= code_size => Ok((offset, length)),
                _ => Err(LoadError::CodeRangeOutOfBounds { contract_id, offset, length, code_size }),
            },
        }
    }
}

/// Append `length` bytes of `contract_id`'s code, starting at `offset`, to the code region.
///
/// The code is written at `stack_start` and the stack is shifted up by `length`. The caller must
/// have validated the load; there is no way to undo it.
pub fn copy_code<S: ContractStorage + ?Sized>(
    state: &mut ExecutionState,
    storage: &S,
    contract_id: ContractId,
    offset: u64,
    length: u64,
) -> Result<LoadedCode, LoadError> {
    let fault = |source: CopyFault| LoadError::CodeCopyFault { contract_id, offset, length, source };

    let code = storage.contract_code(&contract_id).ok_or_else(|| fault(CopyFault::SourceUnavailable))?;
    let available = code.len() as u64;
    let bytes = offset
        .checked_add(length)
        .filter(|&end| end <= available)
        .map(|end| &code[offset as usize..end as usize])
        .ok_or_else(|| fault(CopyFault::SourceTruncated { available }))?;

    let start = state.frame.code_end();
    state.memory.write(start, bytes).map_err(|err| fault(err.into()))?;
    state.frame.grow_code(length);

    let loaded = LoadedCode { contract_id, start, len: length, offset };
    state.loaded.push(loaded);
    tracing::debug!("copied {} bytes of {} to {:#x}", length, contract_id, start);
    Ok(loaded)
}
