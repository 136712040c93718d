//! Structured fault records and classification enums.

use crate::hal::ChannelGuard;

/// Pseudo mmu-engine ids outside the per-engine fault-id windows.
pub const MMU_ENGINE_ID_BAR2: u32 = 0x05;
pub const MMU_ENGINE_ID_PHYSICAL: u32 = 0x1f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuEngineClass {
    Bar2,
    Physical,
    Other,
}

pub fn classify_mmu_engine(mmu_engine_id: u32) -> MmuEngineClass {
    match mmu_engine_id {
        MMU_ENGINE_ID_BAR2 => MmuEngineClass::Bar2,
        MMU_ENGINE_ID_PHYSICAL => MmuEngineClass::Physical,
        _ => MmuEngineClass::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    InvalidPde,
    InvalidPdeSize,
    InvalidPte,
    VaLimitViolation,
    UnboundInstBlock,
    PrivViolation,
    ReadOnlyViolation,
    WriteOnlyViolation,
    PitchMaskViolation,
    WorkCreation,
    UnsupportedAperture,
    CompressionFailure,
    UnsupportedKind,
    RegionViolation,
    Poisoned,
    AtomicViolation,
    Unknown(u8),
}

impl FaultType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => FaultType::InvalidPde,
            1 => FaultType::InvalidPdeSize,
            2 => FaultType::InvalidPte,
            3 => FaultType::VaLimitViolation,
            4 => FaultType::UnboundInstBlock,
            5 => FaultType::PrivViolation,
            6 => FaultType::ReadOnlyViolation,
            7 => FaultType::WriteOnlyViolation,
            8 => FaultType::PitchMaskViolation,
            9 => FaultType::WorkCreation,
            10 => FaultType::UnsupportedAperture,
            11 => FaultType::CompressionFailure,
            12 => FaultType::UnsupportedKind,
            13 => FaultType::RegionViolation,
            14 => FaultType::Poisoned,
            15 => FaultType::AtomicViolation,
            other => FaultType::Unknown(other),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            FaultType::InvalidPde => "invalid pde",
            FaultType::InvalidPdeSize => "invalid pde size",
            FaultType::InvalidPte => "invalid pte",
            FaultType::VaLimitViolation => "va limit violation",
            FaultType::UnboundInstBlock => "unbound inst block",
            FaultType::PrivViolation => "priv violation",
            FaultType::ReadOnlyViolation => "ro violation",
            FaultType::WriteOnlyViolation => "wo violation",
            FaultType::PitchMaskViolation => "pitch mask violation",
            FaultType::WorkCreation => "work creation",
            FaultType::UnsupportedAperture => "unsupported aperture",
            FaultType::CompressionFailure => "compression failure",
            FaultType::UnsupportedKind => "unsupported kind",
            FaultType::RegionViolation => "region violation",
            FaultType::Poisoned => "poisoned",
            FaultType::AtomicViolation => "atomic violation",
            FaultType::Unknown(_) => "invalid fault type",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    VirtRead,
    VirtWrite,
    VirtAtomic,
    VirtPrefetch,
    PhysRead,
    PhysWrite,
    PhysAtomic,
    PhysPrefetch,
    Unknown(u8),
}

impl AccessKind {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => AccessKind::VirtRead,
            1 => AccessKind::VirtWrite,
            2 => AccessKind::VirtAtomic,
            3 => AccessKind::VirtPrefetch,
            8 => AccessKind::PhysRead,
            9 => AccessKind::PhysWrite,
            10 => AccessKind::PhysAtomic,
            11 => AccessKind::PhysPrefetch,
            other => AccessKind::Unknown(other),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            AccessKind::VirtRead => "virt read",
            AccessKind::VirtWrite => "virt write",
            AccessKind::VirtAtomic => "virt atomic",
            AccessKind::VirtPrefetch => "virt prefetch",
            AccessKind::PhysRead => "phys read",
            AccessKind::PhysWrite => "phys write",
            AccessKind::PhysAtomic => "phys atomic",
            AccessKind::PhysPrefetch => "phys prefetch",
            AccessKind::Unknown(_) => "invalid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aperture {
    VidMem,
    SysCoherent,
    SysNonCoherent,
    Unknown(u8),
}

impl Aperture {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Aperture::VidMem,
            2 => Aperture::SysCoherent,
            3 => Aperture::SysNonCoherent,
            other => Aperture::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Gpc,
    Hub,
}

const HUB_CLIENT_DESCS: &[&str] = &[
    "vip", "ce0", "ce1", "dniso", "fe", "fecs", "host", "host cpu", "host cpu nb", "iso", "mmu",
    "nvdec", "nvenc1", "nvenc2", "niso", "p2p", "pd", "perf", "pmu", "raster twod", "scc",
    "scc nb", "sec", "ssync", "grcopy", "xv", "mmu nb", "nvenc", "dfalcon", "sked", "afalcon",
    "dont care", "hsce0", "hsce1", "hsce2", "hsce3", "hsce4", "hsce5", "hsce6", "hsce7",
    "hsce8", "hsce9", "hshub", "ptp x0", "ptp x1", "ptp x2", "ptp x3", "ptp x4", "ptp x5",
    "ptp x6", "ptp x7", "vpr scrubber0", "vpr scrubber1", "dwbif", "fbfalcon", "ce shim",
    "gsp",
];

const GPC_CLIENT_DESCS: &[&str] = &[
    "l1 0", "t1 0", "pe 0", "l1 1", "t1 1", "pe 1", "l1 2", "t1 2", "pe 2", "l1 3", "t1 3",
    "pe 3", "rast", "gcc", "gpccs", "prop", "l1 4", "t1 4", "pe 4", "l1 5", "t1 5", "pe 5",
    "l1 6", "t1 6", "pe 6", "l1 7", "t1 7", "pe 7", "gpm", "ltp utlb 0", "ltp utlb 1",
    "ltp utlb 2", "ltp utlb 3", "rgg utlb",
];

/// Human-readable client name used at fault log sites.
pub fn client_desc(kind: ClientKind, client_id: u32) -> &'static str {
    let table = match kind {
        ClientKind::Hub => HUB_CLIENT_DESCS,
        ClientKind::Gpc => GPC_CLIENT_DESCS,
    };
    table.get(client_id as usize).copied().unwrap_or("invalid")
}

/// One decoded fault, consumed within a single orchestration pass.
///
/// Dropping the record releases the channel reference if one was acquired at
/// decode time and not detached.
#[derive(Debug)]
pub struct FaultRecord<'a> {
    pub valid: bool,
    pub fault_addr: u64,
    pub fault_addr_aperture: Aperture,
    pub inst_ptr: u64,
    pub inst_aperture: Aperture,
    pub timestamp: u64,
    pub mmu_engine_id: u32,
    pub faulted_engine_id: Option<u32>,
    pub faulted_subctx_id: Option<u32>,
    pub faulted_pbdma_id: Option<u32>,
    pub client_kind: ClientKind,
    pub client_id: u32,
    pub fault_type: FaultType,
    pub access_kind: AccessKind,
    pub gpc_id: u32,
    pub replayable: bool,
    pub protected_mode: bool,
    pub channel: Option<ChannelGuard<'a>>,
}

impl FaultRecord<'_> {
    pub fn client_desc(&self) -> &'static str {
        client_desc(self.client_kind, self.client_id)
    }

    /// The fault print. One line per fault, mirrors what field debugging
    /// expects to grep for.
    pub fn log(&self) {
        tracing::error!(
            fault_addr = format_args!("{:#x}", self.fault_addr),
            inst_ptr = format_args!("{:#x}", self.inst_ptr),
            mmu_engine_id = self.mmu_engine_id,
            engine_id = ?self.faulted_engine_id,
            subctx_id = ?self.faulted_subctx_id,
            pbdma_id = ?self.faulted_pbdma_id,
            chid = ?self.channel.as_ref().map(|c| c.chid()),
            fault_type = self.fault_type.describe(),
            access = self.access_kind.describe(),
            client = self.client_desc(),
            gpc_id = self.gpc_id,
            replayable = self.replayable,
            protected = self.protected_mode,
            "mmu fault"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fault_type_raw_values() {
        assert_eq!(FaultType::from_raw(2), FaultType::InvalidPte);
        assert_eq!(FaultType::from_raw(4), FaultType::UnboundInstBlock);
        assert_eq!(FaultType::from_raw(15), FaultType::AtomicViolation);
        assert_eq!(FaultType::from_raw(31), FaultType::Unknown(31));
        assert_eq!(FaultType::Unknown(31).describe(), "invalid fault type");
    }

    #[test]
    fn access_kind_raw_values() {
        assert_eq!(AccessKind::from_raw(1), AccessKind::VirtWrite);
        assert_eq!(AccessKind::from_raw(9), AccessKind::PhysWrite);
        assert_eq!(AccessKind::from_raw(5), AccessKind::Unknown(5));
    }

    #[test]
    fn aperture_raw_values() {
        assert_eq!(Aperture::from_raw(0), Aperture::VidMem);
        assert_eq!(Aperture::from_raw(2), Aperture::SysCoherent);
        assert_eq!(Aperture::from_raw(3), Aperture::SysNonCoherent);
        assert_eq!(Aperture::from_raw(1), Aperture::Unknown(1));
    }

    #[test]
    fn client_desc_lookup() {
        assert_eq!(client_desc(ClientKind::Hub, 5), "fecs");
        assert_eq!(client_desc(ClientKind::Gpc, 12), "rast");
        assert_eq!(client_desc(ClientKind::Hub, 500), "invalid");
    }

    #[test]
    fn pseudo_engine_classification() {
        assert_eq!(classify_mmu_engine(MMU_ENGINE_ID_BAR2), MmuEngineClass::Bar2);
        assert_eq!(
            classify_mmu_engine(MMU_ENGINE_ID_PHYSICAL),
            MmuEngineClass::Physical
        );
        assert_eq!(classify_mmu_engine(0x15), MmuEngineClass::Other);
    }
}
