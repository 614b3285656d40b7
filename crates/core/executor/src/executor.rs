use ldc_primitives::{consts::WORD_SIZE, ContractId, MemoryGeometry};

use crate::{
    context::LdcContext,
    loader::{
        code_size, copy_code, evacuate_stack, restore_stack, validate_load, LoadError, LoadPhase,
        LoadRange, Stash, StackGuard, StackHost,
    },
    memory::MemoryError,
    opts::{LdcCoreOpts, StackPolicy},
    report::LoadReport,
    state::{ExecutionFrame, ExecutionState, LoadedCode},
    storage::ContractStorage,
};

/// An executor whose running program can append the code of other deployed contracts to its own
/// code region and jump into it.
pub struct Executor<'a> {
    /// The state of the execution.
    state: ExecutionState,

    /// The deployed contracts loads read from.
    storage: &'a dyn ContractStorage,

    /// The memory geometry and stack policy.
    opts: LdcCoreOpts,

    /// The maximum number of loads this execution may perform.
    max_loads: Option<usize>,

    /// Statistics of the loads performed so far.
    report: LoadReport,

    /// The phase reached by the most recent load.
    phase: LoadPhase,

    /// Set once a load faults; every later load is refused.
    halted: bool,
}

impl<'a> Executor<'a> {
    /// Create a new [`Executor`] with an empty code region.
    #[must_use]
    pub fn new(storage: &'a dyn ContractStorage, opts: LdcCoreOpts) -> Self {
        Self::from_state(storage, ExecutionState::new(&opts.geometry), opts, None)
    }

    /// Create a new [`Executor`] from a context.
    pub fn with_context(
        storage: &'a dyn ContractStorage,
        context: LdcContext,
    ) -> Result<Self, MemoryError> {
        let LdcContext { opts, initial_code, max_loads } = context;
        let state = ExecutionState::with_code(&opts.geometry, &initial_code)?;
        Ok(Self::from_state(storage, state, opts, max_loads))
    }

    fn from_state(
        storage: &'a dyn ContractStorage,
        state: ExecutionState,
        opts: LdcCoreOpts,
        max_loads: Option<usize>,
    ) -> Self {
        tracing::debug!(
            "executor with {} bytes of memory, {} bytes of code, {} stack policy",
            opts.geometry.max_ram(),
            state.frame().code_end(),
            opts.stack_policy
        );
        Self {
            state,
            storage,
            opts,
            max_loads,
            report: LoadReport::default(),
            phase: LoadPhase::Idle,
            halted: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &ExecutionState {
        &self.state
    }

    #[must_use]
    pub const fn frame(&self) -> &ExecutionFrame {
        self.state.frame()
    }

    #[must_use]
    pub const fn opts(&self) -> &LdcCoreOpts {
        &self.opts
    }

    #[must_use]
    pub const fn geometry(&self) -> &MemoryGeometry {
        &self.opts.geometry
    }

    #[must_use]
    pub const fn report(&self) -> &LoadReport {
        &self.report
    }

    /// The phase reached by the most recent load.
    #[must_use]
    pub const fn phase(&self) -> LoadPhase {
        self.phase
    }

    /// Whether a fatal fault stopped the execution.
    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.halted
    }

    /// The byte length of `contract_id`'s deployed code.
    pub fn code_size(&self, contract_id: &ContractId) -> Result<u64, LoadError> {
        code_size(self.storage, contract_id)
    }

    /// Check whether `size` bytes of code can be appended to the code region right now.
    pub fn validate(&self, size: u64) -> Result<(), LoadError> {
        validate_load(&self.opts.geometry, self.state.frame(), size)
    }

    /// Append the whole code of `contract_id` to the code region.
    pub fn load_contract(&mut self, contract_id: ContractId) -> Result<LoadedCode, LoadError> {
        self.load(contract_id, LoadRange::Full)
    }

    /// Append `length` bytes of `contract_id`'s code, starting at `offset`, to the code region.
    pub fn load_contract_range(
        &mut self,
        contract_id: ContractId,
        offset: u64,
        length: u64,
    ) -> Result<LoadedCode, LoadError> {
        self.load(contract_id, LoadRange::Partial { offset, length })
    }

    /// Move the live stack onto the heap. The returned stash must be handed back to
    /// [`Executor::restore_stack`].
    pub fn evacuate_stack(&mut self) -> Result<Stash, LoadError> {
        self.ensure_running().map_err(|err| self.reject(err))?;
        let stash = evacuate_stack(&mut self.state).map_err(|err| self.reject(err))?;
        self.report.record_evacuation();
        Ok(stash)
    }

    /// Put a stack moved by [`Executor::evacuate_stack`] back in place.
    pub fn restore_stack(&mut self, stash: Stash) -> Result<(), LoadError> {
        self.ensure_running().map_err(|err| self.reject(err))?;
        restore_stack(&mut self.state, stash).map_err(|err| self.reject(err))
    }

    /// Move the live stack onto the heap until the returned guard is dropped.
    pub fn relocate_stack(&mut self) -> Result<StackGuard<'_, Self>, LoadError> {
        self.ensure_running().map_err(|err| self.reject(err))?;
        self.evacuated_frame().map_err(|err| self.reject(err))?;

        let mut guard = StackGuard::evacuate(self)?;
        guard.host_mut().report.record_evacuation();
        Ok(guard)
    }

    /// Run `f` with the stack moved onto the heap, restoring it afterwards whatever `f` returns.
    ///
    /// A failure to restore the stack takes precedence over the result of `f`.
    pub fn with_relocated_stack<'s, T>(
        &'s mut self,
        f: impl FnOnce(&mut StackGuard<'s, Executor<'a>>) -> Result<T, LoadError>,
    ) -> Result<T, LoadError> {
        let mut guard = self.relocate_stack()?;
        let value = f(&mut guard);
        guard.restore()?;
        value
    }

    /// Push `bytes` onto the stack.
    pub fn push_stack(&mut self, bytes: &[u8]) -> Result<(), MemoryError> {
        self.state.push_stack(bytes)
    }

    /// Pop `len` bytes off the stack.
    pub fn pop_stack(&mut self, len: u64) -> Result<Vec<u8>, MemoryError> {
        self.state.pop_stack(len)
    }

    /// The live bytes on the stack, bottom first.
    pub fn stack_bytes(&self) -> Result<Vec<u8>, MemoryError> {
        self.state.stack_bytes()
    }

    /// Allocate `len` bytes on the heap, returning the address of the allocation.
    pub fn allocate(&mut self, len: u64) -> Result<u64, MemoryError> {
        self.state.allocate(len)
    }

    pub fn read_memory(&self, addr: u64, len: u64) -> Result<Vec<u8>, MemoryError> {
        self.state.memory().read(addr, len)
    }

    /// The bytes of the code region.
    pub fn code_bytes(&self) -> Result<Vec<u8>, MemoryError> {
        self.state.code_bytes()
    }

    /// The segments loaded so far, in load order.
    #[must_use]
    pub fn loaded_code(&self) -> &[LoadedCode] {
        self.state.loaded_code()
    }

    /// Enter a loaded segment by pointing the program counter at its first byte.
    pub fn jump_to(&mut self, segment: &LoadedCode) {
        debug_assert!(segment.end() <= self.state.frame().code_end());
        tracing::debug!("jump to {} at {:#x}", segment.contract_id, segment.start);
        self.state.pc = segment.start;
    }

    fn load(&mut self, contract_id: ContractId, range: LoadRange) -> Result<LoadedCode, LoadError> {
        let _span = tracing::debug_span!("load", contract = %contract_id).entered();
        self.set_phase(LoadPhase::Idle);
        match self.try_load(contract_id, range) {
            Ok(loaded) => {
                self.report.record_load(loaded.len);
                self.set_phase(LoadPhase::Done);
                tracing::info!(
                    "loaded {} bytes of {} at {:#x}",
                    loaded.len,
                    contract_id,
                    loaded.start
                );
                Ok(loaded)
            }
            Err(err) => Err(self.reject(err)),
        }
    }

    fn try_load(
        &mut self,
        contract_id: ContractId,
        range: LoadRange,
    ) -> Result<LoadedCode, LoadError> {
        self.ensure_running()?;
        if let Some(max_loads) = self.max_loads {
            if self.report.loads >= max_loads as u64 {
                tracing::warn!("refusing load of {}: {} loads already done", contract_id, max_loads);
                return Err(LoadError::LoadLimitReached { max_loads });
            }
        }

        let size = code_size(self.storage, &contract_id)?;
        self.set_phase(LoadPhase::SizeKnown);
        let (offset, length) = range.resolve(contract_id, size)?;

        if self.opts.stack_policy == StackPolicy::Relocate && !self.state.frame().is_stack_empty() {
            return self.load_relocated(contract_id, offset, length);
        }

        self.validate(length)?;
        self.set_phase(LoadPhase::Validated);
        self.copy(contract_id, offset, length)
    }

    /// Load with the live stack moved out of the way, validating against the frame the
    /// evacuation will produce before touching anything.
    fn load_relocated(
        &mut self,
        contract_id: ContractId,
        offset: u64,
        length: u64,
    ) -> Result<LoadedCode, LoadError> {
        let projected = self.evacuated_frame()?;
        validate_load(&self.opts.geometry, &projected, length)?;
        self.set_phase(LoadPhase::Validated);

        let mut guard = StackGuard::evacuate(self)?;
        let host = guard.host_mut();
        host.report.record_evacuation();
        host.set_phase(LoadPhase::StackEvacuated);
        host.validate(length)?;
        let loaded = host.copy(contract_id, offset, length)?;
        guard.restore()?;

        self.set_phase(LoadPhase::StackRestored);
        Ok(loaded)
    }

    fn copy(
        &mut self,
        contract_id: ContractId,
        offset: u64,
        length: u64,
    ) -> Result<LoadedCode, LoadError> {
        let loaded = copy_code(&mut self.state, self.storage, contract_id, offset, length)?;
        self.set_phase(LoadPhase::Loaded);
        Ok(loaded)
    }

    /// The frame evacuating the stack would produce.
    fn evacuated_frame(&self) -> Result<ExecutionFrame, LoadError> {
        let frame = self.state.frame();
        let stash_len = WORD_SIZE as u64 + frame.stack_size();
        frame.evacuated(stash_len).ok_or(LoadError::StashAllocationFailed {
            stack_size: frame.stack_size(),
            source: MemoryError::HeapExhausted {
                requested: stash_len,
                available: frame.free_memory(),
            },
        })
    }

    fn ensure_running(&self) -> Result<(), LoadError> {
        if self.halted {
            return Err(LoadError::ExecutionHalted);
        }
        Ok(())
    }

    fn set_phase(&mut self, phase: LoadPhase) {
        tracing::debug!("load phase {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    /// Account for a failed operation, halting the execution if the failure is fatal.
    fn reject(&mut self, err: LoadError) -> LoadError {
        let kind = err.kind();
        self.report.record_rejection(kind);
        self.set_phase(LoadPhase::Rejected(kind));
        if err.is_fatal() {
            self.halt(&err);
        } else {
            tracing::info!("load rejected: {}", err);
        }
        err
    }

    fn halt(&mut self, err: &LoadError) {
        if !self.halted {
            tracing::error!("halting execution: {}", err);
        }
        self.halted = true;
    }
}

impl StackHost for Executor<'_> {
    fn execution_state(&self) -> &ExecutionState {
        &self.state
    }

    fn execution_state_mut(&mut self) -> &mut ExecutionState {
        &mut self.state
    }

    fn restore_failed(&mut self, err: LoadError) {
        self.halt(&err);
    }
}

impl StackGuard<'_, Executor<'_>> {
    /// The byte length of `contract_id`'s deployed code.
    pub fn code_size(&self, contract_id: &ContractId) -> Result<u64, LoadError> {
        self.host().code_size(contract_id)
    }

    /// Append the whole code of `contract_id` to the code region.
    pub fn load_contract(&mut self, contract_id: ContractId) -> Result<LoadedCode, LoadError> {
        self.host_mut().load_contract(contract_id)
    }

    /// Append `length` bytes of `contract_id`'s code, starting at `offset`, to the code region.
    pub fn load_contract_range(
        &mut self,
        contract_id: ContractId,
        offset: u64,
        length: u64,
    ) -> Result<LoadedCode, LoadError> {
        self.host_mut().load_contract_range(contract_id, offset, length)
    }
}
