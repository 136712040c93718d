//! Interrupt-time sequencing of the fault unit.

use tarn_engines::EngineRegistry;

use crate::decode;
use crate::fault::{classify_mmu_engine, FaultRecord, MmuEngineClass};
use crate::hal::{DeviceCtx, FaultHw, QueueId, RecoverReason, Timeout};
use crate::queue::FaultQueueState;
use crate::recover::{self, RecoveryDecision};
use crate::regs::{
    FaultStatus, NisoIntr, ReplayMode, INVALIDATE_ALL_PDB, INVALIDATE_ALL_VA, INVALIDATE_TRIGGER,
};
use crate::retry::RetryPolicy;

/// The per-device fault unit. Owns the engine registry and both ring states;
/// invoked from a single hardware-interrupt context per device.
pub struct MmuFaultUnit {
    registry: EngineRegistry,
    replayable: FaultQueueState,
    nonreplayable: FaultQueueState,
    retry: RetryPolicy,
}

impl MmuFaultUnit {
    pub fn new(registry: EngineRegistry) -> Self {
        Self {
            registry,
            replayable: FaultQueueState::new(QueueId::Replayable),
            nonreplayable: FaultQueueState::new(QueueId::NonReplayable),
            retry: RetryPolicy::default(),
        }
    }

    /// Read-only registry queries for sibling subsystems.
    pub fn engine_registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Configures and enables both rings at bring-up.
    pub fn setup(&mut self, hw: &mut dyn FaultHw) {
        self.nonreplayable.configure(hw);
        self.replayable.configure(hw);
    }

    /// Quiesces both rings so their backing stores can be unmapped. Callers
    /// hold the fault-disable lock.
    pub fn teardown(&mut self, hw: &mut dyn FaultHw) {
        if self.nonreplayable.disable(hw, &self.retry).is_err() {
            tracing::warn!("non-replayable fault buffer did not quiesce");
        }
        if self.replayable.disable(hw, &self.retry).is_err() {
            tracing::warn!("replayable fault buffer did not quiesce");
        }
    }

    /// The interrupt entry point. Never fails; all internal failures are
    /// absorbed and logged. Safe to invoke with nothing pending.
    pub fn handle_mmu_fault_interrupt(&mut self, ctx: &mut DeviceCtx<'_>, intr: NisoIntr) {
        let status = ctx.hw.read_fault_status();

        if intr.contains(NisoIntr::MMU_OTHER_FAULT_NOTIFY) {
            self.handle_other_fault(ctx, status);
        }

        if self.nonreplayable.is_enabled(ctx.hw)
            && intr.intersects(
                NisoIntr::MMU_NONREPLAYABLE_FAULT_NOTIFY
                    | NisoIntr::MMU_NONREPLAYABLE_FAULT_OVERFLOW,
            )
        {
            if status.intersects(
                FaultStatus::NON_REPLAYABLE_OVERFLOW | FaultStatus::NON_REPLAYABLE_GETPTR_CORRUPTED,
            ) {
                self.nonreplayable.handle_overflow(ctx.hw, status);
            }
            let records = self
                .nonreplayable
                .drain(ctx.hw, &self.registry, ctx.channels);
            for record in records {
                let decision = recover::dispatch(record, ctx, &self.registry);
                apply_decision(decision, ctx);
            }
        }

        if self.replayable.is_enabled(ctx.hw)
            && intr.intersects(
                NisoIntr::MMU_REPLAYABLE_FAULT_NOTIFY | NisoIntr::MMU_REPLAYABLE_FAULT_OVERFLOW,
            )
        {
            if status.intersects(
                FaultStatus::REPLAYABLE_OVERFLOW | FaultStatus::REPLAYABLE_GETPTR_CORRUPTED,
            ) {
                self.replayable.handle_overflow(ctx.hw, status);
            }
            let records = self.replayable.drain(ctx.hw, &self.registry, ctx.channels);
            let mut replay: Option<ReplayMode> = None;
            for record in records {
                let decision = recover::dispatch(record, ctx, &self.registry);
                match replay_mode_for(decision) {
                    Some(ReplayMode::CancelGlobal) => replay = Some(ReplayMode::CancelGlobal),
                    Some(ReplayMode::StartAckAll) => {
                        // Cancel always wins over replay-start.
                        if replay != Some(ReplayMode::CancelGlobal) {
                            replay = Some(ReplayMode::StartAckAll);
                        }
                    }
                    None => {}
                }
                apply_decision(decision, ctx);
            }
            // Exactly one replay-or-cancel command per pass.
            if let Some(mode) = replay {
                self.issue_replay(ctx, mode);
            }
        }

        // Level-triggered; leaving this set storms the interrupt line.
        ctx.hw.write_fault_status(FaultStatus::VALID);
    }

    fn handle_other_fault(&mut self, ctx: &mut DeviceCtx<'_>, status: FaultStatus) {
        let dropped = status.intersection(FaultStatus::DROPPED);
        if !dropped.is_empty() {
            tracing::warn!(?dropped, "dropped mmu faults");
            ctx.hw.write_fault_status(dropped);
        }
        if !status.contains(FaultStatus::VALID) {
            return;
        }

        let record = decode::decode_register_snapshot(ctx.hw, &self.registry, ctx.channels);
        match classify_mmu_engine(record.mmu_engine_id) {
            MmuEngineClass::Bar2 | MmuEngineClass::Physical => {
                self.handle_bar2_fault(ctx, record, status);
            }
            MmuEngineClass::Other => {
                let replayable = record.replayable;
                let decision = recover::dispatch(record, ctx, &self.registry);
                apply_decision(decision, ctx);
                // A replayable snap fault gets its replay-or-cancel command
                // here; it never flows through the ring-drain aggregation.
                if replayable {
                    if let Some(mode) = replay_mode_for(decision) {
                        self.issue_replay(ctx, mode);
                    }
                }
            }
        }
    }

    /// BAR2/physical faults bypass recovery: rewrite whichever rings flagged
    /// an error and rebind the BAR2 instance. The record drop releases any
    /// channel reference the snapshot resolved.
    fn handle_bar2_fault(
        &mut self,
        ctx: &mut DeviceCtx<'_>,
        record: FaultRecord<'_>,
        status: FaultStatus,
    ) {
        record.log();
        if status.contains(FaultStatus::NON_REPLAYABLE_ERROR) {
            self.nonreplayable.configure(ctx.hw);
        }
        if status.contains(FaultStatus::REPLAYABLE_ERROR) {
            self.replayable.configure(ctx.hw);
        }
        if ctx.hw.bar2_rebind().is_err() {
            tracing::warn!("bar2 rebind timed out");
        }
    }

    fn issue_replay(&self, ctx: &mut DeviceCtx<'_>, mode: ReplayMode) {
        if invalidate_replay(ctx.hw, &self.retry, mode).is_err() {
            tracing::warn!(?mode, "replay invalidate did not complete");
        }
    }
}

fn replay_mode_for(decision: RecoveryDecision) -> Option<ReplayMode> {
    match decision {
        RecoveryDecision::Fatal => Some(ReplayMode::CancelGlobal),
        RecoveryDecision::FixedInPlace | RecoveryDecision::RetryContextSwitch => {
            Some(ReplayMode::StartAckAll)
        }
        RecoveryDecision::NoOp
        | RecoveryDecision::PreemptChannel { .. }
        | RecoveryDecision::PreemptAndResetEngine { .. } => None,
    }
}

fn apply_decision(decision: RecoveryDecision, ctx: &mut DeviceCtx<'_>) {
    match decision {
        RecoveryDecision::PreemptChannel { chid } => ctx.runlists.preempt_channel(chid),
        RecoveryDecision::PreemptAndResetEngine {
            engine_mask,
            id,
            id_kind,
        } => ctx
            .runlists
            .recover(engine_mask, id, id_kind, RecoverReason::MmuFault),
        RecoveryDecision::NoOp
        | RecoveryDecision::FixedInPlace
        | RecoveryDecision::RetryContextSwitch
        | RecoveryDecision::Fatal => {}
    }
}

/// Issues one TLB invalidate carrying the replay directive and waits for the
/// MMU to drain it, under the device-wide invalidate lock.
pub fn invalidate_replay(
    hw: &mut dyn FaultHw,
    retry: &RetryPolicy,
    mode: ReplayMode,
) -> Result<(), Timeout> {
    hw.acquire_tlb_lock();
    let mut reg = hw.read_mmu_invalidate();
    reg |= INVALIDATE_ALL_VA | INVALIDATE_ALL_PDB | mode.bits() | INVALIDATE_TRIGGER;
    hw.write_mmu_invalidate(reg);
    let result = retry.poll(hw, |hw| hw.mmu_pri_fifo_empty());
    hw.release_tlb_lock();
    result
}
