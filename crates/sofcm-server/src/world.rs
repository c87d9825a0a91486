// world.rs -- the server's collision world: shared geometry plus the Area Tree
//
// Geometry is immutable once loaded and shared through an Arc. The Area Tree
// changes on every entity move, so it sits behind a read/write lock: links and
// unlinks take the write side, traces and queries the read side.

use std::sync::Arc;

use parking_lot::RwLock;
use sofcm_common::cmodel::{CModelContext, TraceStats};
use sofcm_common::cmodel_load::{load_map, LoadError};
use sofcm_common::cvar::CollisionConfig;
use sofcm_common::q_shared::*;

use crate::edict::Edict;
use crate::sv_world::{AreaStats, AreaTree, AreaType, CollisionModel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorldStats {
    pub area: AreaStats,
    pub trace: TraceStats,
}

pub struct ServerWorld {
    cm: Arc<CModelContext>,
    area: RwLock<AreaTree>,
    world_mins: Vec3,
    world_maxs: Vec3,
}

impl ServerWorld {
    /// Wrap loaded geometry and build the Area Tree over the world model's
    /// bounds, or the configured fallback bounds when nothing is loaded.
    pub fn new(cm: Arc<CModelContext>, cfg: &CollisionConfig) -> Self {
        let (world_mins, world_maxs) = match cm.world_bounds() {
            Some(bounds) => bounds,
            None => {
                if !cfg.world_bounds_valid() {
                    tracing::warn!(
                        mins = ?cfg.world_mins,
                        maxs = ?cfg.world_maxs,
                        "configured world bounds are empty, area tree will be degenerate"
                    );
                }
                (cfg.world_mins, cfg.world_maxs)
            }
        };

        let mut area = AreaTree::new(cfg);
        area.clear_world(&world_mins, &world_maxs);

        Self {
            cm,
            area: RwLock::new(area),
            world_mins,
            world_maxs,
        }
    }

    /// A world with no geometry: traces only see entities.
    pub fn empty(cfg: &CollisionConfig) -> Self {
        Self::new(Arc::new(CModelContext::with_config(cfg)), cfg)
    }

    /// Parse a BSP buffer and build a world around it. Returns the map checksum too.
    pub fn load(name: &str, data: &[u8], cfg: &CollisionConfig) -> Result<(Self, u32), LoadError> {
        let (cm, checksum) = load_map(name, data, cfg)?;
        Ok((Self::new(Arc::new(cm), cfg), checksum))
    }

    pub fn collision_model(&self) -> &Arc<CModelContext> {
        &self.cm
    }

    pub fn world_bounds(&self) -> (Vec3, Vec3) {
        (self.world_mins, self.world_maxs)
    }

    /// Drop every link and rebuild the tree, as on a level change.
    /// Edicts still flagged as linked are harmless; unlinking them is a no-op scan.
    pub fn clear_world(&self) {
        self.area.write().clear_world(&self.world_mins, &self.world_maxs);
    }

    /// Apply the Area Tree tunables (`sv_area_leaf_capacity`, `sv_area_query_max`).
    ///
    /// The shared geometry is immutable behind its Arc, so `cm_max_trace_depth`
    /// and `cm_parallel_traces` only take effect on the next `new` or `load`.
    /// World bounds are likewise fixed until the world is rebuilt.
    pub fn apply_config(&self, cfg: &CollisionConfig) {
        self.area.write().apply_config(cfg);
    }

    pub fn stats(&self) -> WorldStats {
        WorldStats {
            area: self.area.read().stats(),
            trace: self.cm.counters.snapshot(),
        }
    }

    pub fn reset_stats(&self) {
        self.area.read().counters.reset();
        self.cm.counters.reset();
    }

    // ============================================================
    // Index mutation
    // ============================================================

    pub fn link_edict(&self, edicts: &mut [Edict], ent_idx: usize) {
        self.area.write().link_edict(edicts, ent_idx);
    }

    pub fn unlink_edict(&self, edicts: &mut [Edict], ent_idx: usize) {
        self.area.write().unlink_edict(edicts, ent_idx);
    }

    // ============================================================
    // Queries
    // ============================================================

    pub fn area_edicts(
        &self,
        mins: &Vec3,
        maxs: &Vec3,
        edicts: &[Edict],
        maxcount: usize,
        areatype: AreaType,
    ) -> Vec<usize> {
        self.area.read().area_edicts(mins, maxs, edicts, maxcount, areatype)
    }

    /// World contents at `p` combined with every solid entity containing it.
    pub fn point_contents(&self, p: &Vec3, edicts: &[Edict]) -> i32 {
        self.area.read().point_contents(p, edicts, self.cm.as_ref())
    }

    /// Sweep a box from `start` to `end` against the world and every solid
    /// entity except `passedict` and the entities it owns or is owned by.
    #[allow(clippy::too_many_arguments)]
    pub fn trace(
        &self,
        start: &Vec3,
        mins: Option<&Vec3>,
        maxs: Option<&Vec3>,
        end: &Vec3,
        passedict: Option<usize>,
        contentmask: i32,
        edicts: &[Edict],
    ) -> Trace {
        self.area
            .read()
            .trace(start, mins, maxs, end, passedict, contentmask, edicts, self.cm.as_ref())
    }

    /// Sweep against one inline model positioned at `origin`, ignoring entities.
    #[allow(clippy::too_many_arguments)]
    pub fn transformed_trace(
        &self,
        start: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        end: &Vec3,
        modelindex: usize,
        origin: &Vec3,
        contentmask: i32,
    ) -> Trace {
        match self.cm.model(modelindex) {
            Some(model) => self.cm.transformed_box_trace(
                start,
                end,
                mins,
                maxs,
                model.headnode,
                contentmask,
                origin,
            ),
            None => Trace::clear(end),
        }
    }
}
