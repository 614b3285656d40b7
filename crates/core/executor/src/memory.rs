use ldc_primitives::consts::{bytes_to_word_le, word_to_bytes_le, WORD_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vec_map::VecMap;

/// An error raised by a memory or register operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("access of {len} bytes at {addr:#x} is outside memory of {size} bytes")]
    OutOfBounds { addr: u64, len: u64, size: u64 },
    #[error("heap exhausted: requested {requested} bytes, {available} available")]
    HeapExhausted { requested: u64, available: u64 },
    #[error("stack overflow: pushing {len} bytes at {stack_pointer:#x} crosses the heap at {heap_pointer:#x}")]
    StackOverflow { len: u64, stack_pointer: u64, heap_pointer: u64 },
    #[error("stack underflow: popping {requested} bytes from a stack holding {available}")]
    StackUnderflow { requested: u64, available: u64 },
}

/// A page of memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page(Vec<u8>);

impl Page {
    fn zeroed() -> Self {
        Self(vec![0; PagedMemory::PAGE_SIZE])
    }
}

/// Paged byte memory. Pages are only materialized once a non-zero byte is written to them, so a
/// VM instance with a large address space stays cheap until it is actually used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedMemory {
    /// The internal page table.
    page_table: VecMap<Page>,
    /// The number of addressable bytes.
    size: u64,
}

impl PagedMemory {
    /// The base 2 logarithm of the page size in bytes.
    const LOG_PAGE_SIZE: usize = 12;
    /// The size of each page in bytes.
    pub const PAGE_SIZE: usize = 1 << Self::LOG_PAGE_SIZE;
    /// The mask for retrieving the lowest bits necessary to index within a page.
    const PAGE_MASK: usize = Self::PAGE_SIZE - 1;

    /// Create an empty `PagedMemory` addressing `size` bytes.
    #[must_use]
    pub fn new(size: u64) -> Self {
        Self { page_table: VecMap::new(), size }
    }

    /// The number of addressable bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The number of pages that have been materialized.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Check that `len` bytes starting at `addr` are addressable.
    pub fn check(&self, addr: u64, len: u64) -> Result<(), MemoryError> {
        match addr.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds { addr, len, size: self.size }),
        }
    }

    /// Read `buf.len()` bytes starting at `addr`.
    pub fn read_into(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check(addr, buf.len() as u64)?;
        let mut addr = addr as usize;
        let mut rest = buf;
        while !rest.is_empty() {
            let (upper, lower) = Self::indices(addr);
            let n = rest.len().min(Self::PAGE_SIZE - lower);
            let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(n);
            match self.page_table.get(upper) {
                Some(page) => chunk.copy_from_slice(&page.0[lower..lower + n]),
                None => chunk.fill(0),
            }
            addr += n;
            rest = tail;
        }
        Ok(())
    }

    /// Read `len` bytes starting at `addr`.
    pub fn read(&self, addr: u64, len: u64) -> Result<Vec<u8>, MemoryError> {
        self.check(addr, len)?;
        let mut buf = vec![0; len as usize];
        self.read_into(addr, &mut buf)?;
        Ok(buf)
    }

    /// Write `bytes` starting at `addr`.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        self.check(addr, bytes.len() as u64)?;
        let mut addr = addr as usize;
        let mut rest = bytes;
        while !rest.is_empty() {
            let (upper, lower) = Self::indices(addr);
            let n = rest.len().min(Self::PAGE_SIZE - lower);
            let (chunk, tail) = rest.split_at(n);
            match self.page_table.get_mut(upper) {
                Some(page) => page.0[lower..lower + n].copy_from_slice(chunk),
                // Untouched pages already read as zero.
                None if chunk.iter().all(|&b| b == 0) => {}
                None => {
                    let mut page = Page::zeroed();
                    page.0[lower..lower + n].copy_from_slice(chunk);
                    self.page_table.insert(upper, page);
                }
            }
            addr += n;
            rest = tail;
        }
        Ok(())
    }

    /// Read a little endian word at `addr`.
    pub fn read_word(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0; WORD_SIZE];
        self.read_into(addr, &mut buf)?;
        Ok(bytes_to_word_le(buf))
    }

    /// Write a little endian word at `addr`.
    pub fn write_word(&mut self, addr: u64, word: u64) -> Result<(), MemoryError> {
        self.write(addr, &word_to_bytes_le(word))
    }

    /// Break apart an address into a page index and an offset within the page.
    #[inline]
    const fn indices(addr: usize) -> (usize, usize) {
        (addr >> Self::LOG_PAGE_SIZE, addr & Self::PAGE_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_memory_reads_zero() {
        let memory = PagedMemory::new(1 << 20);
        assert_eq!(memory.read(0x1234, 16).unwrap(), vec![0; 16]);
        assert_eq!(memory.page_count(), 0);
    }

    #[test]
    fn test_write_across_pages() {
        let mut memory = PagedMemory::new(1 << 20);
        let addr = PagedMemory::PAGE_SIZE as u64 - 3;
        let bytes = [1, 2, 3, 4, 5, 6, 7];
        memory.write(addr, &bytes).unwrap();
        assert_eq!(memory.page_count(), 2);
        assert_eq!(memory.read(addr, 7).unwrap(), bytes);
        assert_eq!(memory.read(addr - 1, 9).unwrap(), [0, 1, 2, 3, 4, 5, 6, 7, 0]);
    }

    #[test]
    fn test_zero_write_does_not_allocate() {
        let mut memory = PagedMemory::new(1 << 20);
        memory.write(4096 * 3, &[0; 100]).unwrap();
        assert_eq!(memory.page_count(), 0);
    }

    #[test]
    fn test_words() {
        let mut memory = PagedMemory::new(64);
        memory.write_word(8, 0xdead_beef_cafe_f00d).unwrap();
        assert_eq!(memory.read_word(8).unwrap(), 0xdead_beef_cafe_f00d);
        assert_eq!(memory.read(8, 1).unwrap(), [0x0d]);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut memory = PagedMemory::new(64);
        assert_eq!(
            memory.write(60, &[1; 8]),
            Err(MemoryError::OutOfBounds { addr: 60, len: 8, size: 64 })
        );
        assert!(memory.read(u64::MAX, 2).is_err());
        assert!(memory.read(0, 64).is_ok());
        assert!(memory.read(64, 0).is_ok());
    }
}
