//! GPU MMU fault handling and engine recovery core.
//!
//! Consumes the replayable/non-replayable hardware fault rings, decodes each
//! entry into a [`fault::FaultRecord`], repairs the narrow
//! "PTE present but invalid" case in place, and classifies everything else
//! into a recovery decision the scheduling layer executes. The chip backend
//! and sibling subsystems are reached only through the trait seams in
//! [`hal`].

#![forbid(unsafe_code)]

pub mod decode;
pub mod fault;
pub mod hal;
pub mod orchestrator;
pub mod queue;
pub mod recover;
pub mod regs;
pub mod repair;
pub mod retry;

pub use fault::{FaultRecord, FaultType};
pub use hal::{DeviceCtx, IdKind, QueueId, Timeout};
pub use orchestrator::MmuFaultUnit;
pub use recover::RecoveryDecision;
pub use regs::{FaultStatus, NisoIntr};
pub use repair::RepairError;
