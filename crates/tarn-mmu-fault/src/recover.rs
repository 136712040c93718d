//! Fault classification into recovery decisions.

use tarn_engines::{EngineKind, EngineRegistry};

use crate::fault::{FaultRecord, FaultType};
use crate::hal::{DeviceCtx, FaultHw, IdKind, INVALID_ID};
use crate::regs::{self, CtxStatus};
use crate::repair;

/// What to do about one fault. Produced once per record, applied by the
/// orchestrator, then discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    NoOp,
    /// Page table repaired; the replayable path reissues the access.
    FixedInPlace,
    /// Repaired mid context-switch; replay also restarts the switch.
    RetryContextSwitch,
    PreemptChannel {
        chid: u32,
    },
    PreemptAndResetEngine {
        engine_mask: u32,
        id: u32,
        id_kind: IdKind,
    },
    /// Unrecoverable replayable fault; the orchestrator cancels globally.
    Fatal,
}

/// The context currently executing on `engine_id`, if the engine is busy.
///
/// Single source of truth for busy/context-switch attribution; the recovery
/// paths and sibling "who is executing id X" queries both go through here.
/// During "load" the incoming id is authoritative; during "switch" the
/// firmware save-only flag picks between outgoing and incoming.
pub fn running_context(hw: &mut dyn FaultHw, engine_id: u32) -> Option<(u32, IdKind)> {
    let status = hw.read_engine_status(engine_id);
    if !regs::status_busy(status) {
        return None;
    }
    let (id, is_tsg) = match regs::status_ctx_status(status) {
        CtxStatus::Load => (regs::status_next_id(status), regs::status_next_id_is_tsg(status)),
        CtxStatus::Switch => {
            if hw.ctxsw_save_only(engine_id) {
                (regs::status_id(status), regs::status_id_is_tsg(status))
            } else {
                (regs::status_next_id(status), regs::status_next_id_is_tsg(status))
            }
        }
        _ => (regs::status_id(status), regs::status_id_is_tsg(status)),
    };
    let kind = if is_tsg { IdKind::Tsg } else { IdKind::Channel };
    Some((id, kind))
}

/// Bitmask of active engines currently executing `(id, id_kind)`.
pub fn engines_running_id(
    hw: &mut dyn FaultHw,
    registry: &EngineRegistry,
    id: u32,
    id_kind: IdKind,
) -> u32 {
    let mut mask = 0;
    for &engine_id in registry.active_engine_ids() {
        if running_context(hw, engine_id) == Some((id, id_kind)) {
            mask |= 1 << engine_id;
        }
    }
    mask
}

fn engine_mid_ctxsw(hw: &mut dyn FaultHw, engine_id: u32) -> bool {
    let status = hw.read_engine_status(engine_id);
    regs::status_busy(status)
        && matches!(
            regs::status_ctx_status(status),
            CtxStatus::Load | CtxStatus::Save | CtxStatus::Switch
        )
}

/// All active engines sharing `engine_id`'s runlist; every active engine when
/// the fault carried no engine attribution.
fn full_runlist_mask(registry: &EngineRegistry, engine_id: Option<u32>) -> u32 {
    let runlist_id = engine_id.and_then(|id| registry.lookup(id)).map(|d| d.runlist_id);
    let mut mask = 0;
    for &id in registry.active_engine_ids() {
        let Some(desc) = registry.lookup(id) else {
            continue;
        };
        if runlist_id.is_none() || runlist_id == Some(desc.runlist_id) {
            mask |= 1 << id;
        }
    }
    mask
}

/// Classifies one fault record. Consumes the record; its channel reference is
/// released when the record drops here, on every path.
pub fn dispatch(
    mut record: FaultRecord<'_>,
    ctx: &mut DeviceCtx<'_>,
    registry: &EngineRegistry,
) -> RecoveryDecision {
    record.log();
    if record.replayable {
        replay_path(&record, ctx)
    } else {
        non_replay_path(&mut record, ctx, registry)
    }
}

fn replay_path(record: &FaultRecord<'_>, ctx: &mut DeviceCtx<'_>) -> RecoveryDecision {
    if record.fault_type != FaultType::InvalidPte {
        return RecoveryDecision::Fatal;
    }
    match repair::try_fix(record, ctx.vm) {
        Ok(()) => {
            if let Some(engine_id) = record.faulted_engine_id {
                if engine_mid_ctxsw(ctx.hw, engine_id) {
                    return RecoveryDecision::RetryContextSwitch;
                }
            }
            RecoveryDecision::FixedInPlace
        }
        Err(err) => {
            tracing::warn!(%err, "replayable fault not repairable, cancelling");
            RecoveryDecision::Fatal
        }
    }
}

fn non_replay_path(
    record: &mut FaultRecord<'_>,
    ctx: &mut DeviceCtx<'_>,
    registry: &EngineRegistry,
) -> RecoveryDecision {
    if record.fault_type == FaultType::UnboundInstBlock {
        // The faulting context cannot be identified from the instance block,
        // so every context on the runlist is suspect. The id stays
        // unattributed even when a channel resolved; the recovery layer must
        // tear down the whole runlist, not one context.
        return RecoveryDecision::PreemptAndResetEngine {
            engine_mask: full_runlist_mask(registry, record.faulted_engine_id),
            id: INVALID_ID,
            id_kind: IdKind::Unknown,
        };
    }

    // Copy-engine faults are reported non-replayable but still get one
    // in-place repair attempt regardless of fault type; the repairer's own
    // checks reject anything but a present-but-invalid entry. On success the
    // engine resumes once both faulted bits are cleared.
    if let Some(engine_id) = record.faulted_engine_id {
        let is_copy = registry.lookup(engine_id).is_some_and(|desc| {
            matches!(desc.kind, EngineKind::AsyncCopy | EngineKind::GraphicsCopy)
        });
        if is_copy {
            if let Ok(()) = repair::try_fix(record, ctx.vm) {
                if let Some(chid) = record.channel.as_ref().map(|g| g.chid()) {
                    if let Some(tsg) = ctx.channels.tsg_of(chid) {
                        ctx.channels.clear_faulted(tsg, true, true);
                    }
                }
                return RecoveryDecision::FixedInPlace;
            }
        }
    }

    let Some(guard) = record.channel.take() else {
        if let Some(engine_id) = record.faulted_engine_id {
            return RecoveryDecision::PreemptAndResetEngine {
                engine_mask: 1 << engine_id,
                id: INVALID_ID,
                id_kind: IdKind::Unknown,
            };
        }
        tracing::warn!("unattributable non-replayable fault, nothing to recover");
        return RecoveryDecision::NoOp;
    };
    let chid = guard.chid();

    if ctx.channels.mark_recovering(chid) {
        // A concurrent report of the same event already started recovery.
        tracing::debug!(chid, "channel already recovering");
        return RecoveryDecision::NoOp;
    }

    let engine_bit = record.faulted_engine_id.map_or(0, |id| 1 << id);
    if let Some(tsg) = ctx.channels.tsg_of(chid) {
        let engine_mask = engine_bit | engines_running_id(ctx.hw, registry, tsg, IdKind::Tsg);
        return RecoveryDecision::PreemptAndResetEngine {
            engine_mask,
            id: tsg,
            id_kind: IdKind::Tsg,
        };
    }
    if record.faulted_engine_id.is_some() {
        let engine_mask =
            engine_bit | engines_running_id(ctx.hw, registry, chid, IdKind::Channel);
        return RecoveryDecision::PreemptAndResetEngine {
            engine_mask,
            id: chid,
            id_kind: IdKind::Channel,
        };
    }
    if record.faulted_pbdma_id.is_some() {
        // A bare channel faulting through a PBDMA: preempting the channel
        // flushes the PBDMA without resetting any engine.
        return RecoveryDecision::PreemptChannel { chid };
    }
    RecoveryDecision::NoOp
}
