//! Packed register and fault-entry field layouts.
//!
//! A fault ring entry is eight little-endian 32-bit words. Word 7 carries the
//! classification fields and the valid flag; the register-snapshot path packs
//! the same classification layout into its single info word, so the `info_*`
//! extractors serve both.

use bitflags::bitflags;

/// Words per hardware fault ring entry.
pub const FAULT_ENTRY_WORDS: usize = 8;

const INST_LO_ADDR_MASK: u32 = 0xffff_f000;
const INST_APERTURE_SHIFT: u32 = 8;
const INST_ENGINE_ID_MASK: u32 = 0x1ff;
const ADDR_LO_MASK: u32 = 0xffff_f000;
const ADDR_APERTURE_MASK: u32 = 0x3;

const INFO_FAULT_TYPE_MASK: u32 = 0x1f;
const INFO_REPLAYABLE: u32 = 1 << 7;
const INFO_CLIENT_ID_SHIFT: u32 = 8;
const INFO_CLIENT_ID_MASK: u32 = 0x7f;
const INFO_ACCESS_TYPE_SHIFT: u32 = 16;
const INFO_ACCESS_TYPE_MASK: u32 = 0xf;
const INFO_CLIENT_TYPE_HUB: u32 = 1 << 20;
const INFO_GPC_ID_SHIFT: u32 = 24;
const INFO_GPC_ID_MASK: u32 = 0x1f;
const INFO_PROTECTED: u32 = 1 << 29;
const INFO_VALID: u32 = 1 << 31;

pub fn entry_inst_ptr(words: &[u32; FAULT_ENTRY_WORDS]) -> u64 {
    inst_ptr(words[0], words[1])
}

pub fn entry_inst_aperture(words: &[u32; FAULT_ENTRY_WORDS]) -> u8 {
    ((words[0] >> INST_APERTURE_SHIFT) & ADDR_APERTURE_MASK) as u8
}

pub fn entry_fault_addr(words: &[u32; FAULT_ENTRY_WORDS]) -> u64 {
    fault_addr(words[2], words[3])
}

pub fn entry_addr_aperture(words: &[u32; FAULT_ENTRY_WORDS]) -> u8 {
    (words[2] & ADDR_APERTURE_MASK) as u8
}

pub fn entry_timestamp(words: &[u32; FAULT_ENTRY_WORDS]) -> u64 {
    (u64::from(words[5]) << 32) | u64::from(words[4])
}

pub fn entry_mmu_engine_id(words: &[u32; FAULT_ENTRY_WORDS]) -> u32 {
    words[6] & INST_ENGINE_ID_MASK
}

pub fn entry_info(words: &[u32; FAULT_ENTRY_WORDS]) -> u32 {
    words[7]
}

pub fn entry_valid(words: &[u32; FAULT_ENTRY_WORDS]) -> bool {
    words[7] & INFO_VALID != 0
}

pub fn entry_clear_valid(word7: u32) -> u32 {
    word7 & !INFO_VALID
}

pub fn inst_ptr(lo: u32, hi: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo & INST_LO_ADDR_MASK)
}

pub fn fault_addr(lo: u32, hi: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo & ADDR_LO_MASK)
}

pub fn addr_aperture(lo: u32) -> u8 {
    (lo & ADDR_APERTURE_MASK) as u8
}

pub fn inst_aperture(lo: u32) -> u8 {
    ((lo >> INST_APERTURE_SHIFT) & ADDR_APERTURE_MASK) as u8
}

/// The register snapshot carries the faulting mmu-engine id in the low bits
/// of its instance-low word.
pub fn snap_mmu_engine_id(inst_lo: u32) -> u32 {
    inst_lo & INST_ENGINE_ID_MASK
}

pub fn info_fault_type(info: u32) -> u8 {
    (info & INFO_FAULT_TYPE_MASK) as u8
}

pub fn info_replayable(info: u32) -> bool {
    info & INFO_REPLAYABLE != 0
}

pub fn info_client_id(info: u32) -> u32 {
    (info >> INFO_CLIENT_ID_SHIFT) & INFO_CLIENT_ID_MASK
}

pub fn info_access_type(info: u32) -> u8 {
    ((info >> INFO_ACCESS_TYPE_SHIFT) & INFO_ACCESS_TYPE_MASK) as u8
}

pub fn info_client_is_hub(info: u32) -> bool {
    info & INFO_CLIENT_TYPE_HUB != 0
}

pub fn info_gpc_id(info: u32) -> u32 {
    (info >> INFO_GPC_ID_SHIFT) & INFO_GPC_ID_MASK
}

pub fn info_protected(info: u32) -> bool {
    info & INFO_PROTECTED != 0
}

pub fn info_valid(info: u32) -> bool {
    info & INFO_VALID != 0
}

bitflags! {
    /// Top-level fault status word. Write-one-to-clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultStatus: u32 {
        const DROPPED_BAR1_PHYS = 1 << 0;
        const DROPPED_BAR1_VIRT = 1 << 1;
        const DROPPED_BAR2_PHYS = 1 << 2;
        const DROPPED_BAR2_VIRT = 1 << 3;
        const DROPPED_IFB_PHYS = 1 << 4;
        const DROPPED_IFB_VIRT = 1 << 5;
        const DROPPED_OTHER_PHYS = 1 << 6;
        const DROPPED_OTHER_VIRT = 1 << 7;
        const REPLAYABLE = 1 << 8;
        const NON_REPLAYABLE = 1 << 9;
        const REPLAYABLE_ERROR = 1 << 10;
        const NON_REPLAYABLE_ERROR = 1 << 11;
        const REPLAYABLE_OVERFLOW = 1 << 12;
        const NON_REPLAYABLE_OVERFLOW = 1 << 13;
        const REPLAYABLE_GETPTR_CORRUPTED = 1 << 14;
        const NON_REPLAYABLE_GETPTR_CORRUPTED = 1 << 15;
        const BUSY = 1 << 30;
        const VALID = 1 << 31;
    }
}

impl FaultStatus {
    pub const DROPPED: FaultStatus = FaultStatus::DROPPED_BAR1_PHYS
        .union(FaultStatus::DROPPED_BAR1_VIRT)
        .union(FaultStatus::DROPPED_BAR2_PHYS)
        .union(FaultStatus::DROPPED_BAR2_VIRT)
        .union(FaultStatus::DROPPED_IFB_PHYS)
        .union(FaultStatus::DROPPED_IFB_VIRT)
        .union(FaultStatus::DROPPED_OTHER_PHYS)
        .union(FaultStatus::DROPPED_OTHER_VIRT);
}

bitflags! {
    /// MMU-related bits of the non-isochronous interrupt status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NisoIntr: u32 {
        const MMU_OTHER_FAULT_NOTIFY = 1 << 0;
        const MMU_NONREPLAYABLE_FAULT_NOTIFY = 1 << 1;
        const MMU_NONREPLAYABLE_FAULT_OVERFLOW = 1 << 2;
        const MMU_REPLAYABLE_FAULT_NOTIFY = 1 << 3;
        const MMU_REPLAYABLE_FAULT_OVERFLOW = 1 << 4;
    }
}

/// Replay directive encoded into the TLB invalidate trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    StartAckAll,
    CancelGlobal,
}

impl ReplayMode {
    pub fn bits(self) -> u32 {
        match self {
            ReplayMode::StartAckAll => 2 << 3,
            ReplayMode::CancelGlobal => 4 << 3,
        }
    }
}

pub const INVALIDATE_ALL_VA: u32 = 1 << 0;
pub const INVALIDATE_ALL_PDB: u32 = 1 << 1;
pub const INVALIDATE_TRIGGER: u32 = 1 << 31;

// Fault buffer get register: pointer plus write-one-to-clear error flags.
pub const FAULT_BUFFER_GET_PTR_MASK: u32 = 0x000f_ffff;
pub const FAULT_BUFFER_GET_GETPTR_CORRUPTED_CLEAR: u32 = 1 << 30;
pub const FAULT_BUFFER_GET_OVERFLOW_CLEAR: u32 = 1 << 31;

// Fault buffer size register.
pub const FAULT_BUFFER_SIZE_VAL_MASK: u32 = 0x000f_ffff;
pub const FAULT_BUFFER_SIZE_OVERFLOW_INTR_EN: u32 = 1 << 29;
pub const FAULT_BUFFER_SIZE_ENABLE: u32 = 1 << 31;

// Page table entry, word 0.
pub const PTE_VALID: u32 = 1 << 0;
pub const PTE_READ_ONLY: u32 = 1 << 6;

// Engine context-switch status word.
const STATUS_ID_MASK: u32 = 0xfff;
const STATUS_ID_TYPE_TSG: u32 = 1 << 12;
const STATUS_CTX_SHIFT: u32 = 13;
const STATUS_CTX_MASK: u32 = 0x7;
const STATUS_NEXT_ID_SHIFT: u32 = 16;
const STATUS_NEXT_ID_TYPE_TSG: u32 = 1 << 28;
const STATUS_BUSY: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxStatus {
    Invalid,
    Valid,
    Load,
    Save,
    Switch,
    Unknown(u8),
}

pub fn status_busy(status: u32) -> bool {
    status & STATUS_BUSY != 0
}

pub fn status_id(status: u32) -> u32 {
    status & STATUS_ID_MASK
}

pub fn status_id_is_tsg(status: u32) -> bool {
    status & STATUS_ID_TYPE_TSG != 0
}

pub fn status_next_id(status: u32) -> u32 {
    (status >> STATUS_NEXT_ID_SHIFT) & STATUS_ID_MASK
}

pub fn status_next_id_is_tsg(status: u32) -> bool {
    status & STATUS_NEXT_ID_TYPE_TSG != 0
}

pub fn status_ctx_status(status: u32) -> CtxStatus {
    match ((status >> STATUS_CTX_SHIFT) & STATUS_CTX_MASK) as u8 {
        0 => CtxStatus::Invalid,
        1 => CtxStatus::Valid,
        5 => CtxStatus::Load,
        6 => CtxStatus::Save,
        7 => CtxStatus::Switch,
        other => CtxStatus::Unknown(other),
    }
}

/// Builds an engine status word; shared by tests that model the hardware.
pub fn encode_engine_status(
    busy: bool,
    id: u32,
    id_is_tsg: bool,
    ctx_status: u32,
    next_id: u32,
    next_id_is_tsg: bool,
) -> u32 {
    let mut word = (id & STATUS_ID_MASK) | ((ctx_status & STATUS_CTX_MASK) << STATUS_CTX_SHIFT);
    word |= (next_id & STATUS_ID_MASK) << STATUS_NEXT_ID_SHIFT;
    if id_is_tsg {
        word |= STATUS_ID_TYPE_TSG;
    }
    if next_id_is_tsg {
        word |= STATUS_NEXT_ID_TYPE_TSG;
    }
    if busy {
        word |= STATUS_BUSY;
    }
    word
}

pub const CTX_STATUS_VALID: u32 = 1;
pub const CTX_STATUS_LOAD: u32 = 5;
pub const CTX_STATUS_SAVE: u32 = 6;
pub const CTX_STATUS_SWITCH: u32 = 7;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn entry_field_extraction() {
        let words: [u32; FAULT_ENTRY_WORDS] = [
            0xdead_b200,          // inst lo, aperture = sys-coh (2)
            0x0000_0001,          // inst hi
            0x1234_5003,          // addr lo, aperture = sys-noncoh (3)
            0x0000_00ab,          // addr hi
            0x4444_4444,          // timestamp lo
            0x0000_0002,          // timestamp hi
            0x0000_0115,          // mmu engine id
            0x8000_0000,          // valid
        ];
        assert_eq!(entry_inst_ptr(&words), 0x1_dead_b000);
        assert_eq!(entry_inst_aperture(&words), 2);
        assert_eq!(entry_fault_addr(&words), 0xab_1234_5000);
        assert_eq!(entry_addr_aperture(&words), 3);
        assert_eq!(entry_timestamp(&words), 0x2_4444_4444);
        assert_eq!(entry_mmu_engine_id(&words), 0x115);
        assert!(entry_valid(&words));
        assert!(!entry_valid(&{
            let mut w = words;
            w[7] = entry_clear_valid(w[7]);
            w
        }));
    }

    #[test]
    fn info_field_extraction() {
        let info = INFO_VALID
            | INFO_REPLAYABLE
            | INFO_CLIENT_TYPE_HUB
            | INFO_PROTECTED
            | 0x02                       // fault type: pte
            | (0x21 << INFO_CLIENT_ID_SHIFT)
            | (0x1 << INFO_ACCESS_TYPE_SHIFT)
            | (0x7 << INFO_GPC_ID_SHIFT);
        assert_eq!(info_fault_type(info), 2);
        assert!(info_replayable(info));
        assert_eq!(info_client_id(info), 0x21);
        assert_eq!(info_access_type(info), 1);
        assert!(info_client_is_hub(info));
        assert_eq!(info_gpc_id(info), 7);
        assert!(info_protected(info));
        assert!(info_valid(info));
    }

    #[test]
    fn engine_status_round_trip() {
        let word = encode_engine_status(true, 0x41, true, CTX_STATUS_SWITCH, 0x42, false);
        assert!(status_busy(word));
        assert_eq!(status_id(word), 0x41);
        assert!(status_id_is_tsg(word));
        assert_eq!(status_next_id(word), 0x42);
        assert!(!status_next_id_is_tsg(word));
        assert_eq!(status_ctx_status(word), CtxStatus::Switch);
    }

    #[test]
    fn dropped_mask_covers_all_sources() {
        assert_eq!(FaultStatus::DROPPED.bits(), 0xff);
        assert!(!FaultStatus::DROPPED.contains(FaultStatus::REPLAYABLE));
    }
}
