//! In-place page fault repair.

use thiserror::Error;

use crate::fault::FaultRecord;
use crate::hal::AddressSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RepairError {
    #[error("fault has no resolved channel")]
    NoChannel,
    #[error("page table entry is empty")]
    EntryMissing,
    #[error("page table entry already valid")]
    AlreadyValid,
    #[error("page table update failed")]
    WriteFailed,
}

/// Marks the faulting page table entry valid and invalidates the TLB for the
/// owning root.
///
/// Only the narrow "entry present but invalid" case is repairable. An
/// all-zero entry must never be marked valid; that would mask a genuine
/// invalid access. A repeat fault on an already-valid entry signals a
/// different failure class and is not retried.
pub fn try_fix(record: &FaultRecord<'_>, vm: &mut dyn AddressSpace) -> Result<(), RepairError> {
    let chid = record
        .channel
        .as_ref()
        .map(|guard| guard.chid())
        .ok_or(RepairError::NoChannel)?;

    let mut pte = vm
        .get_pte(chid, record.fault_addr)
        .map_err(|_| RepairError::EntryMissing)?;
    if pte.is_zero() {
        return Err(RepairError::EntryMissing);
    }
    if pte.valid() {
        return Err(RepairError::AlreadyValid);
    }

    pte.set_valid();
    pte.clear_read_only();
    vm.set_pte(chid, record.fault_addr, pte)
        .map_err(|_| RepairError::WriteFailed)?;

    if vm.invalidate_tlb(chid).is_err() {
        // Stale translations may survive; the access cannot be trusted to
        // replay cleanly, so escalate instead of claiming success.
        tracing::warn!(chid, "tlb invalidate timed out after pte repair");
        return Err(RepairError::WriteFailed);
    }

    // Diagnostics only.
    if let Ok(fixed) = vm.get_pte(chid, record.fault_addr) {
        tracing::debug!(
            chid,
            fault_addr = format_args!("{:#x}", record.fault_addr),
            pte = format_args!("{:#x} {:#x}", fixed.0[0], fixed.0[1]),
            "page fault fixed"
        );
    }
    Ok(())
}
