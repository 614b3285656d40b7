//! A dynamic code loader for a register-based virtual machine.
//!
//! A running program can append the bytecode of another deployed contract to its own code region
//! and enter it by a direct jump. Memory is laid out as `[code | stack -> ... <- heap]`, so the
//! code region can only grow while the stack is empty; the loader either rejects a load over a
//! live stack or moves the stack onto the heap for the duration of the load.

#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

mod context;
mod executor;
pub mod loader;
pub mod memory;
mod opts;
mod report;
mod state;
pub mod storage;
pub mod utils;

pub use context::*;
pub use executor::*;
pub use loader::{LoadError, LoadErrorKind, LoadPhase, LoadRange, Stash, StackGuard, StackHost};
pub use memory::{MemoryError, PagedMemory};
pub use opts::*;
pub use report::*;
pub use state::*;
pub use storage::{ContractStorage, InMemoryStorage};
pub use utils::setup_logger;
