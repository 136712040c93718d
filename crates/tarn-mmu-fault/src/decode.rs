//! Turns raw fault entries and register snapshots into [`FaultRecord`]s.

use tarn_engines::EngineRegistry;

use crate::fault::{AccessKind, Aperture, ClientKind, FaultRecord, FaultType};
use crate::hal::{ChannelGuard, Channels, FaultHw};
use crate::regs::{self, FaultStatus, FAULT_ENTRY_WORDS};

/// Decodes one ring entry.
///
/// The mmu-engine id resolves either into an engine (plus sub-context) or
/// into a PBDMA, never both; pseudo engines resolve to neither. The channel
/// reference acquired here transfers into the record and is released when the
/// record drops.
pub fn decode_ring_entry<'a>(
    words: &[u32; FAULT_ENTRY_WORDS],
    registry: &EngineRegistry,
    channels: &'a dyn Channels,
) -> FaultRecord<'a> {
    build_record(
        regs::entry_valid(words),
        regs::entry_fault_addr(words),
        regs::entry_addr_aperture(words),
        regs::entry_inst_ptr(words),
        regs::entry_inst_aperture(words),
        regs::entry_timestamp(words),
        regs::entry_mmu_engine_id(words),
        regs::entry_info(words),
        registry,
        channels,
    )
}

/// Decodes the single-entry register snapshot used for BAR/physical faults.
///
/// Clears the hardware valid bit as its last act so a second read never
/// reprocesses the same fault.
pub fn decode_register_snapshot<'a>(
    hw: &mut dyn FaultHw,
    registry: &EngineRegistry,
    channels: &'a dyn Channels,
) -> FaultRecord<'a> {
    let snap = hw.read_fault_snapshot();
    let record = build_record(
        regs::info_valid(snap.info),
        regs::fault_addr(snap.addr_lo, snap.addr_hi),
        regs::addr_aperture(snap.addr_lo),
        regs::inst_ptr(snap.inst_lo, snap.inst_hi),
        regs::inst_aperture(snap.inst_lo),
        0,
        regs::snap_mmu_engine_id(snap.inst_lo),
        snap.info,
        registry,
        channels,
    );
    hw.write_fault_status(FaultStatus::VALID);
    record
}

#[allow(clippy::too_many_arguments)]
fn build_record<'a>(
    valid: bool,
    fault_addr: u64,
    addr_aperture: u8,
    inst_ptr: u64,
    inst_aperture: u8,
    timestamp: u64,
    mmu_engine_id: u32,
    info: u32,
    registry: &EngineRegistry,
    channels: &'a dyn Channels,
) -> FaultRecord<'a> {
    let (faulted_engine_id, faulted_subctx_id) = match registry
        .engine_id_for_fault_id(mmu_engine_id)
    {
        Some((engine_id, subctx)) => (Some(engine_id), subctx),
        None => (None, None),
    };
    let faulted_pbdma_id = if faulted_engine_id.is_none() {
        registry.pbdma_id_for_fault_id(mmu_engine_id)
    } else {
        None
    };

    let channel = channels
        .resolve_instance_ptr(inst_ptr)
        .map(|chid| ChannelGuard::new(channels, chid));

    FaultRecord {
        valid,
        fault_addr,
        fault_addr_aperture: Aperture::from_raw(addr_aperture),
        inst_ptr,
        inst_aperture: Aperture::from_raw(inst_aperture),
        timestamp,
        mmu_engine_id,
        faulted_engine_id,
        faulted_subctx_id,
        faulted_pbdma_id,
        client_kind: if regs::info_client_is_hub(info) {
            ClientKind::Hub
        } else {
            ClientKind::Gpc
        },
        client_id: regs::info_client_id(info),
        fault_type: FaultType::from_raw(regs::info_fault_type(info)),
        access_kind: AccessKind::from_raw(regs::info_access_type(info)),
        gpc_id: regs::info_gpc_id(info),
        replayable: regs::info_replayable(info),
        protected_mode: regs::info_protected(info),
        channel,
    }
}
