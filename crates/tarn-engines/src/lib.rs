//! Engine topology registry.
//!
//! Built once at device bring-up from the hardware device-info table and
//! immutable afterwards. The fault-handling core queries it to map an opaque
//! hardware fault id back to an engine (and, for graphics, a sub-context) or
//! to a PBDMA, and the interrupt dispatcher queries it for aggregate
//! interrupt/reset masks.

#![forbid(unsafe_code)]

use thiserror::Error;

/// Engine class reported by the device-info table.
pub const ENGINE_TYPE_GRAPHICS: u32 = 0;
/// Logical copy engine.
pub const ENGINE_TYPE_COPY: u32 = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Graphics,
    /// Copy engine on its own runlist.
    AsyncCopy,
    /// Copy engine sharing the graphics runlist.
    GraphicsCopy,
    Invalid,
}

/// One engine's entry in the registry. Immutable after [`EngineRegistry::new`].
#[derive(Debug, Clone)]
pub struct EngineDescriptor {
    pub engine_id: u32,
    pub kind: EngineKind,
    pub runlist_id: u32,
    pub pbdma_id: u32,
    pub intr_mask: u32,
    pub reset_mask: u32,
    pub fault_id: u32,
}

/// One row of the hardware device-info table, as read at bring-up.
#[derive(Debug, Clone)]
pub struct DeviceInfoRow {
    pub engine_type: u32,
    pub engine_id: u32,
    pub runlist_id: u32,
    pub intr_id: u32,
    pub reset_id: u32,
    pub fault_id: u32,
}

/// Snapshot of the hardware topology consumed exactly once by
/// [`EngineRegistry::new`].
#[derive(Debug, Clone)]
pub struct DeviceTopology {
    pub rows: Vec<DeviceInfoRow>,
    /// Per PBDMA, the bitmask of runlists it serves.
    pub pbdma_runlist_mask: Vec<u32>,
    /// Hardware-reported ceiling on engine ids.
    pub max_engines: u32,
    /// Sub-context (VEID) count of the graphics engine.
    pub max_subctx_count: u32,
    /// Fault id of PBDMA 0; PBDMAs occupy a contiguous fault-id window.
    pub pbdma_fault_id_base: u32,
}

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("no graphics engine in device-info table")]
    GraphicsEngineMissing,
    #[error("no pbdma serves runlist {runlist_id}")]
    NoPbdmaForRunlist { runlist_id: u32 },
    #[error("engine id {engine_id} exceeds hardware maximum {max_engines}")]
    EngineIdOutOfRange { engine_id: u32, max_engines: u32 },
}

#[derive(Debug)]
pub struct EngineRegistry {
    /// Indexed by engine id; `None` for ids the device-info table never named.
    descriptors: Vec<Option<EngineDescriptor>>,
    /// Engine ids considered live, in device-info table order.
    active: Vec<u32>,
    graphics_engine_id: u32,
    max_subctx_count: u32,
    pbdma_fault_id_base: u32,
    num_pbdma: u32,
}

impl EngineRegistry {
    pub fn new(topology: &DeviceTopology) -> Result<Self, TopologyError> {
        let mut descriptors: Vec<Option<EngineDescriptor>> =
            vec![None; topology.max_engines as usize];
        let mut active = Vec::new();
        let mut graphics_engine_id = None;
        let mut graphics_runlist_id = None;

        for row in &topology.rows {
            if row.engine_id >= topology.max_engines {
                return Err(TopologyError::EngineIdOutOfRange {
                    engine_id: row.engine_id,
                    max_engines: topology.max_engines,
                });
            }

            let kind = match row.engine_type {
                ENGINE_TYPE_GRAPHICS => EngineKind::Graphics,
                ENGINE_TYPE_COPY => EngineKind::AsyncCopy,
                _ => EngineKind::Invalid,
            };

            let pbdma_id = find_pbdma_for_runlist(&topology.pbdma_runlist_mask, row.runlist_id)
                .ok_or(TopologyError::NoPbdmaForRunlist {
                    runlist_id: row.runlist_id,
                })?;

            if kind == EngineKind::Graphics && graphics_engine_id.is_none() {
                graphics_engine_id = Some(row.engine_id);
                graphics_runlist_id = Some(row.runlist_id);
            }

            descriptors[row.engine_id as usize] = Some(EngineDescriptor {
                engine_id: row.engine_id,
                kind,
                runlist_id: row.runlist_id,
                pbdma_id,
                intr_mask: 1u32 << row.intr_id,
                reset_mask: 1u32 << row.reset_id,
                fault_id: row.fault_id,
            });
            active.push(row.engine_id);

            tracing::debug!(
                engine_id = row.engine_id,
                runlist_id = row.runlist_id,
                pbdma_id,
                fault_id = row.fault_id,
                ?kind,
                "engine registered"
            );
        }

        let graphics_engine_id =
            graphics_engine_id.ok_or(TopologyError::GraphicsEngineMissing)?;

        // Copy engines scheduled on the graphics runlist are context-switched
        // together with graphics and get the dedicated GraphicsCopy kind.
        if let Some(gr_runlist) = graphics_runlist_id {
            for desc in descriptors.iter_mut().flatten() {
                if desc.kind == EngineKind::AsyncCopy && desc.runlist_id == gr_runlist {
                    desc.kind = EngineKind::GraphicsCopy;
                }
            }
        }

        Ok(Self {
            descriptors,
            active,
            graphics_engine_id,
            max_subctx_count: topology.max_subctx_count,
            pbdma_fault_id_base: topology.pbdma_fault_id_base,
            num_pbdma: topology.pbdma_runlist_mask.len() as u32,
        })
    }

    /// Descriptor for `engine_id`, only if it is in the active list.
    pub fn lookup(&self, engine_id: u32) -> Option<&EngineDescriptor> {
        if !self.active.contains(&engine_id) {
            return None;
        }
        self.descriptors.get(engine_id as usize)?.as_ref()
    }

    pub fn active_engine_ids(&self) -> &[u32] {
        &self.active
    }

    pub fn graphics_engine_id(&self) -> u32 {
        self.graphics_engine_id
    }

    pub fn max_subctx_count(&self) -> u32 {
        self.max_subctx_count
    }

    /// Maps a hardware fault id to `(engine_id, subcontext)`.
    ///
    /// The graphics engine owns a window of `max_subctx_count` consecutive
    /// fault ids, one per sub-context; every other engine matches exactly one
    /// fault id and reports no sub-context.
    pub fn engine_id_for_fault_id(&self, fault_id: u32) -> Option<(u32, Option<u32>)> {
        for &engine_id in &self.active {
            let desc = self.descriptors[engine_id as usize].as_ref()?;
            if desc.kind == EngineKind::Graphics {
                if fault_id >= desc.fault_id
                    && fault_id < desc.fault_id + self.max_subctx_count
                {
                    return Some((engine_id, Some(fault_id - desc.fault_id)));
                }
            } else if desc.fault_id == fault_id {
                return Some((engine_id, None));
            }
        }
        None
    }

    /// Maps a hardware fault id into the contiguous PBDMA fault-id window.
    pub fn pbdma_id_for_fault_id(&self, fault_id: u32) -> Option<u32> {
        if fault_id >= self.pbdma_fault_id_base
            && fault_id < self.pbdma_fault_id_base + self.num_pbdma
        {
            Some(fault_id - self.pbdma_fault_id_base)
        } else {
            None
        }
    }

    /// Interrupt mask of one active engine, or 0 for unknown ids.
    pub fn act_interrupt_mask(&self, engine_id: u32) -> u32 {
        self.lookup(engine_id).map_or(0, |desc| desc.intr_mask)
    }

    /// Aggregate interrupt mask over all active engines.
    pub fn interrupt_mask(&self) -> u32 {
        self.active
            .iter()
            .filter_map(|&id| self.lookup(id))
            .fold(0, |mask, desc| mask | desc.intr_mask)
    }

    /// Aggregate reset mask of every copy engine.
    pub fn copy_engine_reset_mask(&self) -> u32 {
        self.active
            .iter()
            .filter_map(|&id| self.lookup(id))
            .filter(|desc| {
                matches!(desc.kind, EngineKind::AsyncCopy | EngineKind::GraphicsCopy)
            })
            .fold(0, |mask, desc| mask | desc.reset_mask)
    }
}

fn find_pbdma_for_runlist(pbdma_runlist_mask: &[u32], runlist_id: u32) -> Option<u32> {
    pbdma_runlist_mask
        .iter()
        .position(|&mask| mask & (1u32 << runlist_id) != 0)
        .map(|id| id as u32)
}
