use std::{
    fs::File,
    io::{Read, Seek, Write},
};

use ldc_primitives::{ContractId, MemoryGeometry};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{MemoryError, PagedMemory};

/// The registers delimiting the code, stack and heap regions of a running program.
///
/// Memory is laid out as `[code | stack -> ... <- heap]`: the code region occupies
/// `[0, stack_start)`, the live stack `[stack_start, stack_pointer)` and the heap
/// `[heap_pointer, max_ram)`. The heap grows downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FrameRegisters")]
pub struct ExecutionFrame {
    stack_start: u64,
    stack_pointer: u64,
    heap_pointer: u64,
}

/// Register values that do not satisfy `stack_start <= stack_pointer <= heap_pointer`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error(
    "invalid frame: stack start {stack_start:#x}, stack pointer {stack_pointer:#x}, \
     heap pointer {heap_pointer:#x}"
)]
pub struct InvalidFrame {
    pub stack_start: u64,
    pub stack_pointer: u64,
    pub heap_pointer: u64,
}

/// The unchecked registers of a serialized [`ExecutionFrame`].
#[derive(Deserialize)]
struct FrameRegisters {
    stack_start: u64,
    stack_pointer: u64,
    heap_pointer: u64,
}

impl TryFrom<FrameRegisters> for ExecutionFrame {
    type Error = InvalidFrame;

    fn try_from(registers: FrameRegisters) -> Result<Self, Self::Error> {
        let FrameRegisters { stack_start, stack_pointer, heap_pointer } = registers;
        Self::new(stack_start, stack_pointer, heap_pointer).ok_or(InvalidFrame {
            stack_start,
            stack_pointer,
            heap_pointer,
        })
    }
}

impl ExecutionFrame {
    /// Create a new [`ExecutionFrame`], returning `None` unless
    /// `stack_start <= stack_pointer <= heap_pointer`.
    #[must_use]
    pub fn new(stack_start: u64, stack_pointer: u64, heap_pointer: u64) -> Option<Self> {
        (stack_start <= stack_pointer && stack_pointer <= heap_pointer).then_some(Self {
            stack_start,
            stack_pointer,
            heap_pointer,
        })
    }

    /// The start of the stack (`$ssp`).
    #[must_use]
    pub const fn stack_start(&self) -> u64 {
        self.stack_start
    }

    /// The top of the stack (`$sp`).
    #[must_use]
    pub const fn stack_pointer(&self) -> u64 {
        self.stack_pointer
    }

    /// The lowest allocated heap address (`$hp`).
    #[must_use]
    pub const fn heap_pointer(&self) -> u64 {
        self.heap_pointer
    }

    /// The end of the code region, which is where the stack starts.
    #[must_use]
    pub const fn code_end(&self) -> u64 {
        self.stack_start
    }

    /// The number of live bytes on the stack.
    #[must_use]
    pub const fn stack_size(&self) -> u64 {
        self.stack_pointer - self.stack_start
    }

    #[must_use]
    pub const fn is_stack_empty(&self) -> bool {
        self.stack_pointer == self.stack_start
    }

    /// The number of unused bytes between the stack and the heap.
    #[must_use]
    pub const fn free_memory(&self) -> u64 {
        self.heap_pointer - self.stack_pointer
    }

    /// The frame that would result from moving the live stack into a heap allocation of
    /// `stash_len` bytes, or `None` if that allocation cannot be satisfied.
    #[must_use]
    pub fn evacuated(&self, stash_len: u64) -> Option<Self> {
        (stash_len <= self.free_memory()).then_some(Self {
            stack_start: self.stack_start,
            stack_pointer: self.stack_start,
            heap_pointer: self.heap_pointer - stash_len,
        })
    }

    /// Grow the code region by `len` bytes, shifting the stack up with it.
    pub(crate) fn grow_code(&mut self, len: u64) {
        self.stack_start += len;
        self.stack_pointer += len;
        debug_assert!(self.stack_pointer <= self.heap_pointer);
    }

    pub(crate) fn set_stack_pointer(&mut self, stack_pointer: u64) {
        debug_assert!(self.stack_start <= stack_pointer && stack_pointer <= self.heap_pointer);
        self.stack_pointer = stack_pointer;
    }

    pub(crate) fn set_heap_pointer(&mut self, heap_pointer: u64) {
        debug_assert!(self.stack_pointer <= heap_pointer);
        self.heap_pointer = heap_pointer;
    }
}

/// A contiguous run of code appended to the code region by a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedCode {
    /// The contract the code was copied from.
    pub contract_id: ContractId,
    /// The address of the first loaded byte in the code region.
    pub start: u64,
    /// The number of loaded bytes.
    pub len: u64,
    /// The offset of the first loaded byte within the source contract.
    pub offset: u64,
}

impl LoadedCode {
    /// The address one past the last loaded byte.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.len
    }

    /// Whether `addr` falls inside the loaded segment.
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end()
    }
}

/// Holds data describing the current state of a program's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    /// The program counter.
    pub pc: u64,

    /// The code, stack and heap registers.
    pub(crate) frame: ExecutionFrame,

    /// The memory which the program operates over.
    pub(crate) memory: PagedMemory,

    /// Every segment appended to the code region, in load order.
    pub(crate) loaded: Vec<LoadedCode>,
}

impl ExecutionState {
    #[must_use]
    /// Create a new [`ExecutionState`] with an empty code region, an empty stack and no heap.
    pub fn new(geometry: &MemoryGeometry) -> Self {
        Self {
            pc: 0,
            frame: ExecutionFrame {
                stack_start: 0,
                stack_pointer: 0,
                heap_pointer: geometry.max_ram(),
            },
            memory: PagedMemory::new(geometry.max_ram()),
            loaded: Vec::new(),
        }
    }

    /// Create a new [`ExecutionState`] whose code region holds `code`.
    pub fn with_code(geometry: &MemoryGeometry, code: &[u8]) -> Result<Self, MemoryError> {
        let mut state = Self::new(geometry);
        state.memory.write(0, code)?;
        state.frame.grow_code(code.len() as u64);
        Ok(state)
    }

    #[must_use]
    pub const fn frame(&self) -> &ExecutionFrame {
        &self.frame
    }

    #[must_use]
    pub const fn memory(&self) -> &PagedMemory {
        &self.memory
    }

    /// The segments appended to the code region so far.
    #[must_use]
    pub fn loaded_code(&self) -> &[LoadedCode] {
        &self.loaded
    }

    /// The bytes of the code region.
    pub fn code_bytes(&self) -> Result<Vec<u8>, MemoryError> {
        self.memory.read(0, self.frame.code_end())
    }

    /// The live bytes on the stack, bottom first.
    pub fn stack_bytes(&self) -> Result<Vec<u8>, MemoryError> {
        self.memory.read(self.frame.stack_start, self.frame.stack_size())
    }

    /// Push `bytes` onto the stack.
    pub fn push_stack(&mut self, bytes: &[u8]) -> Result<(), MemoryError> {
        let len = bytes.len() as u64;
        if len > self.frame.free_memory() {
            return Err(MemoryError::StackOverflow {
                len,
                stack_pointer: self.frame.stack_pointer,
                heap_pointer: self.frame.heap_pointer,
            });
        }
        self.memory.write(self.frame.stack_pointer, bytes)?;
        self.frame.set_stack_pointer(self.frame.stack_pointer + len);
        Ok(())
    }

    /// Pop `len` bytes off the stack, returning them bottom first.
    pub fn pop_stack(&mut self, len: u64) -> Result<Vec<u8>, MemoryError> {
        let available = self.frame.stack_size();
        if len > available {
            return Err(MemoryError::StackUnderflow { requested: len, available });
        }
        let stack_pointer = self.frame.stack_pointer - len;
        let bytes = self.memory.read(stack_pointer, len)?;
        self.frame.set_stack_pointer(stack_pointer);
        Ok(bytes)
    }

    /// Allocate `len` bytes on the heap, returning the address of the allocation.
    pub fn allocate(&mut self, len: u64) -> Result<u64, MemoryError> {
        let available = self.frame.free_memory();
        if len > available {
            return Err(MemoryError::HeapExhausted { requested: len, available });
        }
        let heap_pointer = self.frame.heap_pointer - len;
        self.frame.set_heap_pointer(heap_pointer);
        Ok(heap_pointer)
    }

    /// Give back the heap allocation of `len` bytes at `addr` if it is the most recent one.
    ///
    /// Returns whether the allocation was released.
    pub(crate) fn release(&mut self, addr: u64, len: u64) -> bool {
        if addr != self.frame.heap_pointer || addr + len > self.memory.size() {
            return false;
        }
        self.frame.set_heap_pointer(addr + len);
        true
    }

    /// Save the execution state to a file.
    pub fn save(&self, file: &mut File) -> std::io::Result<()> {
        let mut writer = std::io::BufWriter::new(file);
        bincode::serialize_into(&mut writer, self).map_err(std::io::Error::other)?;
        writer.flush()?;
        writer.seek(std::io::SeekFrom::Start(0))?;
        Ok(())
    }

    /// Read an execution state previously written by [`ExecutionState::save`].
    ///
    /// A dump whose registers are out of order or point past the end of memory is rejected
    /// with [`std::io::ErrorKind::InvalidData`].
    pub fn read_from(reader: impl Read) -> std::io::Result<Self> {
        let state: Self = bincode::deserialize_from(reader).map_err(|err| match *err {
            bincode::ErrorKind::Io(err) => err,
            err => std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        })?;
        if state.frame.heap_pointer > state.memory.size() {
            let ExecutionFrame { stack_start, stack_pointer, heap_pointer } = state.frame;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                InvalidFrame { stack_start, stack_pointer, heap_pointer },
            ));
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> MemoryGeometry {
        MemoryGeometry::new(1 << 16, 1 << 12).unwrap()
    }

    #[test]
    fn test_frame_ordering() {
        assert!(ExecutionFrame::new(10, 20, 30).is_some());
        assert!(ExecutionFrame::new(10, 10, 10).is_some());
        assert!(ExecutionFrame::new(20, 10, 30).is_none());
        assert!(ExecutionFrame::new(10, 40, 30).is_none());
    }

    #[test]
    fn test_evacuated_frame() {
        let frame = ExecutionFrame::new(100, 140, 1000).unwrap();
        assert_eq!(frame.evacuated(48), ExecutionFrame::new(100, 100, 952));
        assert_eq!(frame.evacuated(860), ExecutionFrame::new(100, 100, 140));
        assert_eq!(frame.evacuated(861), None);
    }

    #[test]
    fn test_with_code() {
        let state = ExecutionState::with_code(&geometry(), &[0xAA; 24]).unwrap();
        assert_eq!(state.frame().code_end(), 24);
        assert!(state.frame().is_stack_empty());
        assert_eq!(state.frame().heap_pointer(), 1 << 16);
        assert_eq!(state.code_bytes().unwrap(), vec![0xAA; 24]);
    }

    #[test]
    fn test_stack_push_pop() {
        let mut state = ExecutionState::with_code(&geometry(), &[1; 8]).unwrap();
        state.push_stack(&[1, 2, 3]).unwrap();
        state.push_stack(&[4]).unwrap();
        assert_eq!(state.frame().stack_size(), 4);
        assert_eq!(state.stack_bytes().unwrap(), [1, 2, 3, 4]);
        assert_eq!(state.pop_stack(2).unwrap(), [3, 4]);
        assert_eq!(
            state.pop_stack(3),
            Err(MemoryError::StackUnderflow { requested: 3, available: 2 })
        );
    }

    #[test]
    fn test_heap_allocation() {
        let mut state = ExecutionState::new(&geometry());
        let addr = state.allocate(100).unwrap();
        assert_eq!(addr, (1 << 16) - 100);
        assert_eq!(state.frame().heap_pointer(), addr);

        assert!(matches!(state.allocate(1 << 16), Err(MemoryError::HeapExhausted { .. })));
        assert!(matches!(state.push_stack(&vec![0; 1 << 16]), Err(MemoryError::StackOverflow { .. })));

        // Only the most recent allocation can be released.
        let top = state.allocate(8).unwrap();
        assert!(!state.release(addr, 100));
        assert!(state.release(top, 8));
        assert!(state.release(addr, 100));
        assert_eq!(state.frame().heap_pointer(), 1 << 16);
    }

    #[test]
    fn test_read_rejects_corrupt_frame() {
        let mut state = ExecutionState::with_code(&geometry(), &[7; 16]).unwrap();
        state.push_stack(&[9; 5]).unwrap();
        let bytes = bincode::serialize(&state).unwrap();

        // The frame follows the 8 byte program counter: stack start, stack pointer, heap pointer.
        let mut swapped = bytes.clone();
        swapped[8..16].copy_from_slice(&100u64.to_le_bytes());
        let err = ExecutionState::read_from(swapped.as_slice()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("invalid frame"));

        let mut past_memory = bytes.clone();
        past_memory[24..32].copy_from_slice(&(1u64 << 40).to_le_bytes());
        let err = ExecutionState::read_from(past_memory.as_slice()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let restored = ExecutionState::read_from(bytes.as_slice()).unwrap();
        assert_eq!(restored.frame(), state.frame());
    }

    #[test]
    fn test_frame_deserialize_checks_order() {
        let valid = bincode::serialize(&(16u64, 20u64, 64u64)).unwrap();
        assert_eq!(
            bincode::deserialize::<ExecutionFrame>(&valid).unwrap(),
            ExecutionFrame::new(16, 20, 64).unwrap()
        );
        let invalid = bincode::serialize(&(16u64, 8u64, 64u64)).unwrap();
        assert!(bincode::deserialize::<ExecutionFrame>(&invalid).is_err());
    }

    #[test]
    fn test_save_and_read() {
        let mut state = ExecutionState::with_code(&geometry(), &[7; 16]).unwrap();
        state.push_stack(&[9; 5]).unwrap();
        state.pc = 4;

        let mut file = tempfile::tempfile().unwrap();
        state.save(&mut file).unwrap();
        let restored = ExecutionState::read_from(&mut file).unwrap();

        assert_eq!(restored.pc, 4);
        assert_eq!(restored.frame(), state.frame());
        assert_eq!(restored.stack_bytes().unwrap(), vec![9; 5]);
        assert_eq!(restored.code_bytes().unwrap(), vec![7; 16]);
    }
}
