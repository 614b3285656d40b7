//! The deployed-code source the loader reads from.

use hashbrown::HashMap;
use ldc_primitives::ContractId;

/// Read access to the bytecode of deployed contracts.
///
/// Identifier resolution and persistence belong to the host; the loader only needs to look up
/// code by id.
pub trait ContractStorage {
    /// The deployed bytecode of `id`, if it exists.
    fn contract_code(&self, id: &ContractId) -> Option<&[u8]>;

    /// The byte length of the deployed bytecode of `id`, if it exists.
    fn contract_size(&self, id: &ContractId) -> Option<u64> {
        self.contract_code(id).map(|code| code.len() as u64)
    }
}

impl<T: ContractStorage + ?Sized> ContractStorage for &T {
    fn contract_code(&self, id: &ContractId) -> Option<&[u8]> {
        (**self).contract_code(id)
    }

    fn contract_size(&self, id: &ContractId) -> Option<u64> {
        (**self).contract_size(id)
    }
}

/// A [`ContractStorage`] backed by an in-memory map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    contracts: HashMap<ContractId, Vec<u8>>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy `code` under `id`, returning the code previously deployed there.
    pub fn insert(&mut self, id: ContractId, code: impl Into<Vec<u8>>) -> Option<Vec<u8>> {
        self.contracts.insert(id, code.into())
    }

    pub fn remove(&mut self, id: &ContractId) -> Option<Vec<u8>> {
        self.contracts.remove(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ContractId) -> bool {
        self.contracts.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

impl ContractStorage for InMemoryStorage {
    fn contract_code(&self, id: &ContractId) -> Option<&[u8]> {
        self.contracts.get(id).map(Vec::as_slice)
    }
}

impl FromIterator<(ContractId, Vec<u8>)> for InMemoryStorage {
    fn from_iter<T: IntoIterator<Item = (ContractId, Vec<u8>)>>(iter: T) -> Self {
        Self { contracts: iter.into_iter().collect() }
    }
}
