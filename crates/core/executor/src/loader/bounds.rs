use ldc_primitives::MemoryGeometry;

use super::LoadError;
use crate::state::ExecutionFrame;

/// Decide whether appending `size` bytes of code to the code region of `frame` is safe.
///
/// The checks run in a fixed order and the first failing one is reported:
///
/// 1. the target must fit within `max_contract_size` ([`LoadError::ProgramTooLarge`]),
/// 2. the grown code region must stay within `max_ram` ([`LoadError::MemoryExceeded`]),
/// 3. the stack must be empty, since growing the code moves the stack base
///    ([`LoadError::StackNotEmpty`]),
/// 4. the grown code region must not reach into the heap ([`LoadError::StackHeapCollision`]).
///
/// Validation never mutates anything.
pub fn validate_load(
    geometry: &MemoryGeometry,
    frame: &ExecutionFrame,
    size: u64,
) -> Result<(), LoadError> {
    let stack_start = frame.stack_start();

    if size > geometry.max_contract_size() {
        return Err(LoadError::ProgramTooLarge {
            size,
            max_contract_size: geometry.max_contract_size(),
        });
    }

    let code_end = match stack_start.checked_add(size) {
        Some(end) if end <= geometry.max_ram() => end,
        _ => {
            return Err(LoadError::MemoryExceeded {
                stack_start,
                size,
                max_ram: geometry.max_ram(),
            })
        }
    };

    if !frame.is_stack_empty() {
        return Err(LoadError::StackNotEmpty {
            stack_start,
            stack_pointer: frame.stack_pointer(),
        });
    }

    if code_end > frame.heap_pointer() {
        return Err(LoadError::StackHeapCollision {
            stack_start,
            size,
            heap_pointer: frame.heap_pointer(),
        });
    }

    Ok(())
}
