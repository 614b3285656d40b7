use ldc_primitives::consts::WORD_SIZE;

use super::{LoadError, RestoreFault};
use crate::state::{ExecutionFrame, ExecutionState};

/// A snapshot of the live stack, held on the heap while the code region grows.
///
/// The heap buffer holds the stack size as a little endian word followed by the stack bytes.
/// A `Stash` can only be obtained from [`evacuate_stack`] and is consumed by [`restore_stack`].
#[must_use = "an evacuated stack must be restored"]
#[derive(Debug, PartialEq, Eq)]
pub struct Stash {
    addr: u64,
    stack_size: u64,
}

impl Stash {
    /// The heap address of the stash buffer.
    pub const fn addr(&self) -> u64 {
        self.addr
    }

    /// The number of stack bytes held by the stash.
    pub const fn stack_size(&self) -> u64 {
        self.stack_size
    }

    /// The size of the heap buffer, including the length prefix.
    pub const fn len(&self) -> u64 {
        WORD_SIZE as u64 + self.stack_size
    }
}

/// Move the live stack into a heap stash and leave the stack empty.
///
/// Either the whole stack is stashed or, if the heap cannot hold it, nothing changes and
/// [`LoadError::StashAllocationFailed`] is returned.
pub fn evacuate_stack(state: &mut ExecutionState) -> Result<Stash, LoadError> {
    let stack_size = state.frame.stack_size();
    let failed = |source| LoadError::StashAllocationFailed { stack_size, source };

    let stack = state.stack_bytes().map_err(failed)?;
    let len = WORD_SIZE as u64 + stack_size;
    let addr = state.allocate(len).map_err(failed)?;

    let written = state
        .memory
        .write_word(addr, stack_size)
        .and_then(|()| state.memory.write(addr + WORD_SIZE as u64, &stack));
    if let Err(err) = written {
        state.release(addr, len);
        return Err(failed(err));
    }

    state.frame.set_stack_pointer(state.frame.stack_start());
    tracing::debug!("stashed {} stack bytes at {:#x}", stack_size, addr);
    Ok(Stash { addr, stack_size })
}

/// Push the stashed bytes back onto the stack and free the stash if it is still the most recent
/// heap allocation.
pub fn restore_stack(state: &mut ExecutionState, stash: Stash) -> Result<(), LoadError> {
    let Stash { addr, stack_size } = stash;
    let fault = |source: RestoreFault| LoadError::StackRestoreFault { stack_size, source };

    let recorded = state.memory.read_word(addr).map_err(|err| fault(err.into()))?;
    if recorded != stack_size {
        return Err(fault(RestoreFault::CorruptStash { addr, expected: stack_size, found: recorded }));
    }
    let bytes =
        state.memory.read(addr + WORD_SIZE as u64, stack_size).map_err(|err| fault(err.into()))?;

    let released = state.release(addr, WORD_SIZE as u64 + stack_size);
    state.push_stack(&bytes).map_err(|err| fault(err.into()))?;
    tracing::debug!(
        "restored {} stack bytes at {:#x} (stash released: {})",
        stack_size,
        state.frame.stack_start(),
        released
    );
    Ok(())
}

/// Something that owns an [`ExecutionState`] whose stack can be relocated.
pub trait StackHost {
    fn execution_state(&self) -> &ExecutionState;

    fn execution_state_mut(&mut self) -> &mut ExecutionState;

    /// Called when a [`StackGuard`] fails to restore the stack while being dropped.
    fn restore_failed(&mut self, _err: LoadError) {}
}

impl StackHost for ExecutionState {
    fn execution_state(&self) -> &ExecutionState {
        self
    }

    fn execution_state_mut(&mut self) -> &mut ExecutionState {
        self
    }
}

/// Keeps the stack evacuated for as long as it lives.
///
/// Dropping the guard restores the stack, so it is put back on every exit path. While the guard
/// is alive the host can only be inspected or have code loaded into it, which keeps the heap
/// unchanged between evacuation and restore.
pub struct StackGuard<'a, H: StackHost + ?Sized> {
    host: &'a mut H,
    stash: Option<Stash>,
}

impl<'a, H: StackHost + ?Sized> StackGuard<'a, H> {
    /// Evacuate the stack of `host`.
    pub fn evacuate(host: &'a mut H) -> Result<Self, LoadError> {
        let stash = evacuate_stack(host.execution_state_mut())?;
        Ok(Self { host, stash: Some(stash) })
    }

    /// The frame of the host, with an empty stack.
    pub fn frame(&self) -> &ExecutionFrame {
        self.host.execution_state().frame()
    }

    /// The outstanding stash.
    pub fn stash(&self) -> Option<&Stash> {
        self.stash.as_ref()
    }

    pub(crate) fn host(&self) -> &H {
        self.host
    }

    pub(crate) fn host_mut(&mut self) -> &mut H {
        self.host
    }

    /// Restore the stack now, returning any failure instead of logging it on drop.
    ///
    /// The host is told about a failure either way.
    pub fn restore(mut self) -> Result<(), LoadError> {
        let Some(stash) = self.stash.take() else {
            return Ok(());
        };
        restore_stack(self.host.execution_state_mut(), stash).map_err(|err| {
            self.host.restore_failed(err.clone());
            err
        })
    }
}

impl<H: StackHost + ?Sized> Drop for StackGuard<'_, H> {
    fn drop(&mut self) {
        if let Some(stash) = self.stash.take() {
            if let Err(err) = restore_stack(self.host.execution_state_mut(), stash) {
                tracing::error!("failed to restore the stack: {}", err);
                self.host.restore_failed(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ldc_primitives::{ContractId, MemoryGeometry};
    use rand::Rng;

    use super::*;
    use crate::{
        loader::{copy_code, validate_load, LoadErrorKind},
        memory::MemoryError,
        storage::InMemoryStorage,
    };

    const RAM: u64 = 1 << 16;

    fn geometry() -> MemoryGeometry {
        MemoryGeometry::new(RAM, 1 << 12).unwrap()
    }

    fn state_with_stack(stack: &[u8]) -> ExecutionState {
        let mut state = ExecutionState::with_code(&geometry(), &[0xC0; 32]).unwrap();
        state.push_stack(stack).unwrap();
        state
    }

    #[test]
    fn test_evacuate_restore_round_trip() {
        let mut rng = rand::thread_rng();
        for len in [0usize, 1, 7, 8, 100, 5000] {
            let stack = (0..len).map(|_| rng.gen()).collect::<Vec<u8>>();
            let mut state = state_with_stack(&stack);
            let before = *state.frame();

            let stash = evacuate_stack(&mut state).unwrap();
            assert_eq!(stash.stack_size(), len as u64);
            assert_eq!(stash.addr(), RAM - stash.len());
            assert!(state.frame().is_stack_empty());
            assert_eq!(state.frame().heap_pointer(), stash.addr());
            assert_eq!(state.memory().read_word(stash.addr()).unwrap(), len as u64);

            restore_stack(&mut state, stash).unwrap();
            assert_eq!(*state.frame(), before);
            assert_eq!(state.stack_bytes().unwrap(), stack);
        }
    }

    #[test]
    fn test_evacuate_is_all_or_nothing() {
        let mut state = state_with_stack(&[5; 64]);
        // Leave room for the stack bytes but not for the length prefix.
        let free = state.frame().free_memory();
        state.allocate(free - 64).unwrap();
        let before = *state.frame();

        let err = evacuate_stack(&mut state).unwrap_err();
        assert_eq!(
            err,
            LoadError::StashAllocationFailed {
                stack_size: 64,
                source: MemoryError::HeapExhausted { requested: 72, available: 64 },
            }
        );
        assert_eq!(*state.frame(), before);
        assert_eq!(state.stack_bytes().unwrap(), vec![5; 64]);
    }

    #[test]
    fn test_restore_after_code_growth() {
        let target = ContractId::new([9; 32]);
        let storage: InMemoryStorage = [(target, vec![0xAB; 40])].into_iter().collect();
        let mut state = state_with_stack(&[1, 2, 3, 4]);

        let stash = evacuate_stack(&mut state).unwrap();
        validate_load(&geometry(), state.frame(), 40).unwrap();
        copy_code(&mut state, &storage, target, 0, 40).unwrap();
        restore_stack(&mut state, stash).unwrap();

        assert_eq!(state.frame().stack_start(), 72);
        assert_eq!(state.frame().stack_pointer(), 76);
        assert_eq!(state.frame().heap_pointer(), RAM);
        assert_eq!(state.stack_bytes().unwrap(), [1, 2, 3, 4]);
        assert_eq!(state.memory().read(32, 40).unwrap(), vec![0xAB; 40]);
    }

    #[test]
    fn test_restore_detects_corrupt_stash() {
        let mut state = state_with_stack(&[1; 16]);
        let stash = evacuate_stack(&mut state).unwrap();
        let addr = stash.addr();
        state.memory.write_word(addr, 3).unwrap();

        let err = restore_stack(&mut state, stash).unwrap_err();
        assert_eq!(err.kind(), LoadErrorKind::StackRestoreFault);
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            LoadError::StackRestoreFault {
                source: RestoreFault::CorruptStash { expected: 16, found: 3, .. },
                ..
            }
        ));
    }

    #[test]
    fn test_restore_keeps_newer_allocations() {
        let mut state = state_with_stack(&[6; 10]);
        let stash = evacuate_stack(&mut state).unwrap();
        let block = state.allocate(100).unwrap();

        restore_stack(&mut state, stash).unwrap();
        // The stash sits under a newer allocation, so the heap is left alone.
        assert_eq!(state.frame().heap_pointer(), block);
        assert_eq!(state.stack_bytes().unwrap(), vec![6; 10]);
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let mut state = state_with_stack(&[7; 24]);
        let before = *state.frame();
        {
            let guard = StackGuard::evacuate(&mut state).unwrap();
            assert!(guard.frame().is_stack_empty());
            assert_eq!(guard.stash().map(Stash::stack_size), Some(24));
        }
        assert_eq!(*state.frame(), before);
        assert_eq!(state.stack_bytes().unwrap(), vec![7; 24]);
    }

    #[test]
    fn test_guard_restores_on_error_path() {
        fn load_too_much(state: &mut ExecutionState) -> Result<(), LoadError> {
            let guard = StackGuard::evacuate(state)?;
            validate_load(&geometry(), guard.frame(), RAM)?;
            guard.restore()
        }

        let mut state = state_with_stack(&[8; 12]);
        let before = *state.frame();
        let err = load_too_much(&mut state).unwrap_err();
        assert_eq!(err.kind(), LoadErrorKind::ProgramTooLarge);
        assert_eq!(*state.frame(), before);
        assert_eq!(state.stack_bytes().unwrap(), vec![8; 12]);
    }

    #[test]
    fn test_guard_load() {
        let target = ContractId::new([2; 32]);
        let storage: InMemoryStorage = [(target, vec![0x11; 8])].into_iter().collect();
        let mut state = state_with_stack(&[3; 5]);

        let mut guard = StackGuard::evacuate(&mut state).unwrap();
        copy_code(guard.host_mut(), &storage, target, 0, 8).unwrap();
        assert_eq!(guard.host().frame().stack_start(), 40);
        guard.restore().unwrap();

        assert_eq!(state.frame().stack_start(), 40);
        assert_eq!(state.stack_bytes().unwrap(), vec![3; 5]);
    }
}
