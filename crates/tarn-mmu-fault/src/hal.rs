//! Seams to the chip backend and sibling driver subsystems.
//!
//! One trait per concern, implemented once per chip generation (or by mocks
//! in tests). The fault core only ever sees these trait objects, bundled into
//! a [`DeviceCtx`] for the duration of one interrupt.

use thiserror::Error;

use crate::regs::{FaultStatus, PTE_READ_ONLY, PTE_VALID};

/// A bounded hardware wait ran out of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timed out waiting for hardware")]
pub struct Timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PteError {
    #[error("no page table entry mapped at {va:#x}")]
    NotMapped { va: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueId {
    Replayable,
    NonReplayable,
}

/// Raw register snapshot of a single "snap" fault (BAR/physical path).
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultSnapshot {
    pub inst_lo: u32,
    pub inst_hi: u32,
    pub addr_lo: u32,
    pub addr_hi: u32,
    pub info: u32,
}

/// Chip-generation backend for the fault unit.
///
/// Register I/O is infallible; only the bounded waits (`bar2_rebind`, polls
/// driven through [`crate::retry::RetryPolicy`]) can time out.
pub trait FaultHw {
    fn read_fault_buffer_get(&mut self, queue: QueueId) -> u32;
    fn write_fault_buffer_get(&mut self, queue: QueueId, value: u32);
    fn read_fault_buffer_put(&mut self, queue: QueueId) -> u32;
    fn read_fault_buffer_size(&mut self, queue: QueueId) -> u32;
    fn write_fault_buffer_size(&mut self, queue: QueueId, value: u32);
    fn write_fault_buffer_addr(&mut self, queue: QueueId, lo: u32, hi: u32);

    /// DMA base of the ring backing store, as mapped at bring-up.
    fn fault_buffer_base(&self, queue: QueueId) -> u64;
    /// Ring capacity in entries.
    fn fault_buffer_capacity(&self, queue: QueueId) -> u32;

    fn read_entry_word(&mut self, queue: QueueId, index: u32, word: usize) -> u32;
    fn write_entry_word(&mut self, queue: QueueId, index: u32, word: usize, value: u32);

    fn read_fault_status(&mut self) -> FaultStatus;
    /// Write-one-to-clear.
    fn write_fault_status(&mut self, bits: FaultStatus);
    fn read_fault_snapshot(&mut self) -> FaultSnapshot;

    fn read_engine_status(&mut self, engine_id: u32) -> u32;
    /// Firmware-defined disambiguator for the "switch" context-switch
    /// sub-state: true means the switch is save-only.
    fn ctxsw_save_only(&mut self, engine_id: u32) -> bool;

    fn bar2_rebind(&mut self) -> Result<(), Timeout>;

    /// Serializes all invalidate-and-wait sequences device-wide.
    fn acquire_tlb_lock(&mut self);
    fn release_tlb_lock(&mut self);
    fn read_mmu_invalidate(&mut self) -> u32;
    fn write_mmu_invalidate(&mut self, value: u32);
    fn mmu_pri_fifo_empty(&mut self) -> bool;

    fn delay_us(&mut self, us: u64);
    /// Orders the get-pointer publication against the next ring read.
    fn barrier(&mut self);
}

/// Channel/TSG ownership, reference-counted by the channel subsystem.
pub trait Channels {
    /// Resolves the channel owning an instance block. Acquires one reference
    /// on success; the caller must release it exactly once.
    fn resolve_instance_ptr(&self, inst_ptr: u64) -> Option<u32>;
    fn release(&self, chid: u32);
    fn tsg_of(&self, chid: u32) -> Option<u32>;
    /// Idempotent; returns the previous value of the flag.
    fn mark_recovering(&self, chid: u32) -> bool;
    /// Clears the faulted-engine/faulted-PBDMA bits on every channel of the
    /// TSG after a successful in-place repair.
    fn clear_faulted(&self, tsgid: u32, engine: bool, pbdma: bool);
}

/// Holds one acquired channel reference and releases it on drop.
///
/// `detach` hands the reference to the caller for the one intentional
/// ownership transfer.
pub struct ChannelGuard<'a> {
    channels: &'a dyn Channels,
    chid: u32,
    armed: bool,
}

impl<'a> ChannelGuard<'a> {
    pub fn new(channels: &'a dyn Channels, chid: u32) -> Self {
        Self {
            channels,
            chid,
            armed: true,
        }
    }

    pub fn chid(&self) -> u32 {
        self.chid
    }

    /// Disarms the guard; the caller now owns the reference.
    pub fn detach(mut self) -> u32 {
        self.armed = false;
        self.chid
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.channels.release(self.chid);
        }
    }
}

impl core::fmt::Debug for ChannelGuard<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelGuard")
            .field("chid", &self.chid)
            .field("armed", &self.armed)
            .finish()
    }
}

/// Two-word page table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pte(pub [u32; 2]);

impl Pte {
    pub fn is_zero(self) -> bool {
        self.0 == [0, 0]
    }

    pub fn valid(self) -> bool {
        self.0[0] & PTE_VALID != 0
    }

    pub fn set_valid(&mut self) {
        self.0[0] |= PTE_VALID;
    }

    pub fn read_only(self) -> bool {
        self.0[0] & PTE_READ_ONLY != 0
    }

    pub fn clear_read_only(&mut self) {
        self.0[0] &= !PTE_READ_ONLY;
    }
}

/// Page tables, keyed by the owning channel's page-table root.
pub trait AddressSpace {
    fn get_pte(&mut self, chid: u32, va: u64) -> Result<Pte, PteError>;
    fn set_pte(&mut self, chid: u32, va: u64, pte: Pte) -> Result<(), PteError>;
    fn invalidate_tlb(&mut self, chid: u32) -> Result<(), Timeout>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Channel,
    Tsg,
    Unknown,
}

/// Recovery id passed when the fault could not be attributed to a context.
pub const INVALID_ID: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverReason {
    MmuFault,
}

/// Runlist/engine reset, implemented by the scheduling layer.
pub trait Runlists {
    fn recover(&mut self, engine_mask: u32, id: u32, id_kind: IdKind, reason: RecoverReason);
    fn preempt_channel(&mut self, chid: u32);
}

/// Everything the fault core touches during one interrupt.
pub struct DeviceCtx<'a> {
    pub hw: &'a mut dyn FaultHw,
    pub channels: &'a dyn Channels,
    pub vm: &'a mut dyn AddressSpace,
    pub runlists: &'a mut dyn Runlists,
}
