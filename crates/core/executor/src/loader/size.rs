use ldc_primitives::ContractId;

use super::LoadError;
use crate::storage::ContractStorage;

/// The byte length of `contract_id`'s deployed code.
pub fn code_size<S: ContractStorage + ?Sized>(
    storage: &S,
    contract_id: &ContractId,
) -> Result<u64, LoadError> {
    storage.contract_size(contract_id).ok_or(LoadError::UnknownProgram(*contract_id))
}
