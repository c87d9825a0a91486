// sv_world.rs -- world query functions
//
// Entity area checking: a fixed-depth spatial subdivision of the play area,
// linking/unlinking entities, box queries, point contents, and the composite
// trace that merges world geometry with entity boxes.

use sofcm_common::cmodel::{CModelContext, DIST_EPSILON};
use sofcm_common::cvar::CollisionConfig;
use sofcm_common::q_shared::*;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::edict::{Edict, Solid, SvFlags};

// ===============================================================================
// ENTITY AREA CHECKING
// ===============================================================================

pub const AREA_DEPTH: usize = 4;
pub const AREA_NODES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaType {
    Solid,
    Triggers,
}

// ============================================================
// Area node (spatial partitioning tree for entities)
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct AreaNode {
    /// split axis, `None` for a leaf
    pub axis: Option<usize>,
    pub dist: f32,
    /// front (above `dist`) and back child indices into `AreaTree::nodes`
    pub children: [usize; 2],
    pub trigger_edicts: Vec<usize>,
    pub solid_edicts: Vec<usize>,
}

impl AreaNode {
    pub fn is_leaf(&self) -> bool {
        self.axis.is_none()
    }

    fn list(&self, area_type: AreaType) -> &Vec<usize> {
        match area_type {
            AreaType::Solid => &self.solid_edicts,
            AreaType::Triggers => &self.trigger_edicts,
        }
    }
}

// ============================================================
// Counters
// ============================================================

#[derive(Debug, Default)]
pub struct AreaCounters {
    pub leaf_overflows: AtomicU64,
    pub query_truncations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AreaStats {
    pub leaf_overflows: u64,
    pub query_truncations: u64,
}

impl AreaCounters {
    pub fn snapshot(&self) -> AreaStats {
        AreaStats {
            leaf_overflows: self.leaf_overflows.load(Ordering::Relaxed),
            query_truncations: self.query_truncations.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.leaf_overflows.store(0, Ordering::Relaxed);
        self.query_truncations.store(0, Ordering::Relaxed);
    }
}

// ============================================================
// Collision model callbacks trait
// ============================================================

/// The collision model functions the world queries need.
/// Allows testing the Area Tree and composite trace against a mock.
///
/// `Sync` so one loaded model can serve traces from several threads.
pub trait CollisionModel: Sync {
    /// Bounds of the world model, `None` when no map is loaded.
    fn world_bounds(&self) -> Option<(Vec3, Vec3)>;
    fn model_headnode(&self, modelindex: usize) -> Option<usize>;
    fn point_contents(&self, p: &Vec3, headnode: usize) -> i32;
    fn transformed_point_contents(&self, p: &Vec3, headnode: usize, origin: &Vec3) -> i32;
    fn box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: usize,
        brushmask: i32,
    ) -> Trace;
    fn transformed_box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: usize,
        brushmask: i32,
        origin: &Vec3,
    ) -> Trace;
}

impl CollisionModel for CModelContext {
    fn world_bounds(&self) -> Option<(Vec3, Vec3)> {
        if !self.is_loaded() {
            return None;
        }
        self.model(0).map(|m| (m.mins, m.maxs))
    }

    fn model_headnode(&self, modelindex: usize) -> Option<usize> {
        self.model(modelindex).map(|m| m.headnode)
    }

    fn point_contents(&self, p: &Vec3, headnode: usize) -> i32 {
        CModelContext::point_contents(self, p, headnode)
    }

    fn transformed_point_contents(&self, p: &Vec3, headnode: usize, origin: &Vec3) -> i32 {
        CModelContext::transformed_point_contents(self, p, headnode, origin)
    }

    fn box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: usize,
        brushmask: i32,
    ) -> Trace {
        CModelContext::box_trace(self, start, end, mins, maxs, headnode, brushmask)
    }

    fn transformed_box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: usize,
        brushmask: i32,
        origin: &Vec3,
    ) -> Trace {
        CModelContext::transformed_box_trace(self, start, end, mins, maxs, headnode, brushmask, origin)
    }
}

// ============================================================
// MoveClip -- internal trace structure
// ============================================================

struct MoveClip<'a> {
    boxmins: Vec3,
    boxmaxs: Vec3,
    mins: &'a Vec3,
    maxs: &'a Vec3,
    start: &'a Vec3,
    end: &'a Vec3,
    trace: Trace,
    passedict: Option<usize>,
    contentmask: i32,
}

// ============================================================
// AreaTree -- the broad-phase index
// ============================================================

#[derive(Debug)]
pub struct AreaTree {
    pub nodes: Vec<AreaNode>,
    /// entity references each leaf list may hold
    pub leaf_capacity: usize,
    /// result capacity used by `point_contents` and the composite trace
    pub query_max: usize,
    pub counters: AreaCounters,
}

impl Default for AreaTree {
    fn default() -> Self {
        Self::new(&CollisionConfig::default())
    }
}

impl AreaTree {
    /// An empty tree; nothing is indexed until `clear_world` builds the nodes.
    pub fn new(cfg: &CollisionConfig) -> Self {
        Self {
            nodes: Vec::new(),
            leaf_capacity: cfg.area_leaf_capacity,
            query_max: cfg.area_query_max,
            counters: AreaCounters::default(),
        }
    }

    pub fn apply_config(&mut self, cfg: &CollisionConfig) {
        self.leaf_capacity = cfg.area_leaf_capacity;
        self.query_max = cfg.area_query_max;
    }

    pub fn stats(&self) -> AreaStats {
        self.counters.snapshot()
    }

    pub fn num_leafs(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    // ================================================================
    // create_area_node
    //
    // Builds a uniformly subdivided tree for the given world size.
    // Returns the index of the created node.
    // ================================================================
    fn create_area_node(&mut self, depth: usize, mins: &Vec3, maxs: &Vec3) -> usize {
        let anode_idx = self.nodes.len();
        self.nodes.push(AreaNode::default());

        if depth == AREA_DEPTH {
            return anode_idx;
        }

        // only the horizontal extents are compared
        let size = vector_subtract(maxs, mins);
        let axis = if size[0] > size[1] { 0 } else { 1 };
        let dist = 0.5 * (maxs[axis] + mins[axis]);

        let mins1 = *mins;
        let mut mins2 = *mins;
        let mut maxs1 = *maxs;
        let maxs2 = *maxs;

        maxs1[axis] = dist;
        mins2[axis] = dist;

        let child0 = self.create_area_node(depth + 1, &mins2, &maxs2);
        let child1 = self.create_area_node(depth + 1, &mins1, &maxs1);

        let node = &mut self.nodes[anode_idx];
        node.axis = Some(axis);
        node.dist = dist;
        node.children = [child0, child1];

        anode_idx
    }

    // ================================================================
    // clear_world
    // ================================================================
    pub fn clear_world(&mut self, world_mins: &Vec3, world_maxs: &Vec3) {
        self.nodes.clear();
        self.nodes.reserve(AREA_NODES);
        self.create_area_node(0, world_mins, world_maxs);
        tracing::debug!(
            nodes = self.nodes.len(),
            mins = ?world_mins,
            maxs = ?world_maxs,
            "area tree built"
        );
    }

    // ================================================================
    // unlink_edict
    // ================================================================
    pub fn unlink_edict(&mut self, edicts: &mut [Edict], ent_idx: usize) {
        let Some(ent) = edicts.get_mut(ent_idx) else {
            return;
        };
        if !ent.area_linked {
            return; // not linked in anywhere
        }

        // a straddling entity sits in several leaves
        for node in self.nodes.iter_mut().filter(|n| n.is_leaf()) {
            node.trigger_edicts.retain(|&e| e != ent_idx);
            node.solid_edicts.retain(|&e| e != ent_idx);
        }

        ent.area_linked = false;
    }

    // ================================================================
    // link_edict
    // ================================================================
    pub fn link_edict(&mut self, edicts: &mut [Edict], ent_idx: usize) {
        if ent_idx >= edicts.len() {
            tracing::warn!(ent = ent_idx, count = edicts.len(), "link_edict: bad edict index");
            return;
        }

        if edicts[ent_idx].area_linked {
            self.unlink_edict(edicts, ent_idx); // unlink from old position
        }

        if ent_idx == 0 {
            return; // don't add the world
        }

        let ent = &mut edicts[ent_idx];
        if !ent.inuse {
            return;
        }

        ent.set_abs_box();
        ent.linkcount += 1;

        if ent.solid == Solid::Not || self.nodes.is_empty() {
            return;
        }

        let area_type = if ent.solid == Solid::Trigger {
            AreaType::Triggers
        } else {
            AreaType::Solid
        };
        let absmin = ent.absmin;
        let absmax = ent.absmax;

        self.link_to_leafs(0, ent_idx, &absmin, &absmax, area_type);
        edicts[ent_idx].area_linked = true;
    }

    /// Descend both sides of every split the box touches and append to each leaf reached.
    fn link_to_leafs(
        &mut self,
        node_idx: usize,
        ent_idx: usize,
        absmin: &Vec3,
        absmax: &Vec3,
        area_type: AreaType,
    ) {
        let Some(node) = self.nodes.get(node_idx) else {
            return;
        };

        if let Some(axis) = node.axis {
            let (dist, children) = (node.dist, node.children);
            if absmax[axis] >= dist {
                self.link_to_leafs(children[0], ent_idx, absmin, absmax, area_type);
            }
            if absmin[axis] <= dist {
                self.link_to_leafs(children[1], ent_idx, absmin, absmax, area_type);
            }
            return;
        }

        let capacity = self.leaf_capacity;
        let node = &mut self.nodes[node_idx];
        let list = match area_type {
            AreaType::Solid => &mut node.solid_edicts,
            AreaType::Triggers => &mut node.trigger_edicts,
        };
        if list.len() >= capacity {
            self.counters.leaf_overflows.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                ent = ent_idx,
                leaf = node_idx,
                capacity,
                "area leaf full, entity not indexed there"
            );
            return;
        }
        list.push(ent_idx);
    }

    // ================================================================
    // area_edicts_r
    //
    // Returns false once the result list is full.
    // ================================================================
    #[allow(clippy::too_many_arguments)]
    fn area_edicts_r(
        &self,
        node_idx: usize,
        edicts: &[Edict],
        area_mins: &Vec3,
        area_maxs: &Vec3,
        area_type: AreaType,
        area_list: &mut Vec<usize>,
        area_maxcount: usize,
    ) -> bool {
        let Some(node) = self.nodes.get(node_idx) else {
            return true;
        };

        if let Some(axis) = node.axis {
            // recurse down both sides
            if area_maxs[axis] >= node.dist
                && !self.area_edicts_r(
                    node.children[0],
                    edicts,
                    area_mins,
                    area_maxs,
                    area_type,
                    area_list,
                    area_maxcount,
                )
            {
                return false;
            }
            if area_mins[axis] <= node.dist {
                return self.area_edicts_r(
                    node.children[1],
                    edicts,
                    area_mins,
                    area_maxs,
                    area_type,
                    area_list,
                    area_maxcount,
                );
            }
            return true;
        }

        // touch linked edicts
        for &check_idx in node.list(area_type) {
            let Some(check) = edicts.get(check_idx) else {
                continue;
            };
            // the list never exceeds maxcount, so the scan stays bounded
            if area_list.contains(&check_idx) {
                continue; // already listed from a neighbouring leaf
            }
            if check.solid == Solid::Not {
                continue; // deactivated
            }
            if !bounds_overlap(&check.absmin, &check.absmax, area_mins, area_maxs) {
                continue; // not touching
            }

            if area_list.len() == area_maxcount {
                return false;
            }

            area_list.push(check_idx);
        }
        true
    }

    // ================================================================
    // area_edicts
    //
    // Every linked edict of `areatype` whose abs box touches mins/maxs, each
    // listed once. Stops at `maxcount` and reports the truncation.
    // ================================================================
    pub fn area_edicts(
        &self,
        mins: &Vec3,
        maxs: &Vec3,
        edicts: &[Edict],
        maxcount: usize,
        areatype: AreaType,
    ) -> Vec<usize> {
        let mut list = Vec::new();
        if self.nodes.is_empty() {
            return list;
        }

        if !self.area_edicts_r(0, edicts, mins, maxs, areatype, &mut list, maxcount) {
            self.counters.query_truncations.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(maxcount, "area query hit maxcount, results truncated");
        }
        list
    }

    // ================================================================
    // point_contents
    // ================================================================
    pub fn point_contents(&self, p: &Vec3, edicts: &[Edict], cm: &dyn CollisionModel) -> i32 {
        // get base contents from world
        let world_headnode = cm.model_headnode(0).unwrap_or(0);
        let mut contents = cm.point_contents(p, world_headnode);

        // or in contents from all the other entities
        let touch = self.area_edicts(p, p, edicts, self.query_max, AreaType::Solid);

        for touch_idx in touch {
            let hit = &edicts[touch_idx];

            contents |= match hit.solid {
                Solid::Bsp => match cm.model_headnode(hit.modelindex) {
                    Some(headnode) => cm.transformed_point_contents(p, headnode, &hit.origin),
                    None => 0,
                },
                Solid::Bbox => {
                    let mins = vector_add(&hit.origin, &hit.mins);
                    let maxs = vector_add(&hit.origin, &hit.maxs);
                    if bounds_overlap(p, p, &mins, &maxs) {
                        hit.box_contents()
                    } else {
                        0
                    }
                }
                Solid::Not | Solid::Trigger => 0,
            };
        }

        contents
    }

    // ================================================================
    // clip_move_to_entities
    // ================================================================
    fn clip_move_to_entities(&self, clip: &mut MoveClip, edicts: &[Edict], cm: &dyn CollisionModel) {
        let touchlist =
            self.area_edicts(&clip.boxmins, &clip.boxmaxs, edicts, self.query_max, AreaType::Solid);

        for touch_idx in touchlist {
            let touch = &edicts[touch_idx];

            if touch.solid == Solid::Not || touch.solid == Solid::Trigger {
                continue;
            }
            if Some(touch_idx) == clip.passedict {
                continue;
            }
            if clip.trace.allsolid {
                return;
            }
            if let Some(pass_idx) = clip.passedict {
                if touch.owner == Some(pass_idx) {
                    continue; // don't clip against own missiles
                }
                if edicts.get(pass_idx).and_then(|p| p.owner) == Some(touch_idx) {
                    continue; // don't clip against owner
                }
            }

            if (clip.contentmask & CONTENTS_DEADMONSTER) == 0
                && touch.svflags.contains(SvFlags::DEADMONSTER)
            {
                continue;
            }

            // might intersect, so do an exact clip
            let trace = if touch.solid == Solid::Bsp {
                let Some(headnode) = cm.model_headnode(touch.modelindex) else {
                    tracing::warn!(
                        ent = touch_idx,
                        model = touch.modelindex,
                        "SOLID_BSP entity without an inline model"
                    );
                    continue;
                };
                cm.transformed_box_trace(
                    clip.start,
                    clip.end,
                    clip.mins,
                    clip.maxs,
                    headnode,
                    clip.contentmask,
                    &touch.origin,
                )
            } else {
                clip_to_entity_box(clip.start, clip.end, clip.mins, clip.maxs, touch, clip.contentmask)
            };

            if trace.allsolid || trace.fraction < clip.trace.fraction {
                let startsolid = clip.trace.startsolid || trace.startsolid;
                clip.trace = trace;
                clip.trace.ent = Some(touch_idx);
                clip.trace.startsolid = startsolid;
            } else if trace.startsolid {
                clip.trace.startsolid = true;
            }
        }
    }

    // ================================================================
    // trace
    //
    // Moves the given mins/maxs volume through the world from start to end.
    // Passedict and edicts owned by passedict are explicitly not checked.
    // ================================================================
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
        cm: &dyn CollisionModel,
    ) -> Trace {
        let mins = mins.unwrap_or(&VEC3_ORIGIN);
        let maxs = maxs.unwrap_or(&VEC3_ORIGIN);

        // clip to world
        let world_headnode = cm.model_headnode(0).unwrap_or(0);
        let mut world = cm.box_trace(start, end, mins, maxs, world_headnode, contentmask);
        if world.hit() {
            world.ent = Some(0); // world entity
        }
        if world.fraction == 0.0 {
            return world; // blocked by the world
        }

        let (boxmins, boxmaxs) = trace_bounds(start, mins, maxs, end);
        let mut clip = MoveClip {
            boxmins,
            boxmaxs,
            mins,
            maxs,
            start,
            end,
            trace: world,
            passedict,
            contentmask,
        };

        // clip to other solid entities
        self.clip_move_to_entities(&mut clip, edicts, cm);

        clip.trace
    }
}

// ================================================================
// trace_bounds
//
// The box swept by the whole move, padded by one unit.
// ================================================================
fn trace_bounds(start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3) -> (Vec3, Vec3) {
    let mut boxmins = [0.0f32; 3];
    let mut boxmaxs = [0.0f32; 3];
    for i in 0..3 {
        if end[i] > start[i] {
            boxmins[i] = start[i] + mins[i] - 1.0;
            boxmaxs[i] = end[i] + maxs[i] + 1.0;
        } else {
            boxmins[i] = end[i] + mins[i] - 1.0;
            boxmaxs[i] = start[i] + maxs[i] + 1.0;
        }
    }
    (boxmins, boxmaxs)
}

/// Clip a swept box against a bounding box entity.
///
/// The entity box is grown by the moving box, reducing the problem to a point
/// crossing six axial planes. Each pair of planes is one slab; the entry and
/// exit fractions of the three slabs are intersected with the same epsilon
/// handling the brush clipper uses, so entity and world hits stop the same
/// distance short of the surface.
fn clip_to_entity_box(
    start: &Vec3,
    end: &Vec3,
    mins: &Vec3,
    maxs: &Vec3,
    ent: &Edict,
    contentmask: i32,
) -> Trace {
    let mut trace = Trace::clear(end);
    let contents = ent.box_contents();
    if contents & contentmask == 0 {
        return trace;
    }

    let mut enterfrac: f32 = -1.0;
    let mut leavefrac: f32 = 1.0;
    let mut clipplane: Option<CPlane> = None;

    let mut getout = false;
    let mut startout = false;

    for axis in 0..3 {
        let lo = ent.origin[axis] + ent.mins[axis] - maxs[axis];
        let hi = ent.origin[axis] + ent.maxs[axis] - mins[axis];

        for (sign, dist) in [(1.0f32, hi), (-1.0f32, -lo)] {
            let d1 = sign * start[axis] - dist;
            let d2 = sign * end[axis] - dist;

            if d2 > 0.0 {
                getout = true;
            }
            if d1 > 0.0 {
                startout = true;
            }

            // never enters this slab
            if d1 > 0.0 && (d2 >= DIST_EPSILON || d2 >= d1) {
                return trace;
            }
            if d1 <= 0.0 && d2 <= 0.0 {
                continue;
            }

            if d1 > d2 {
                let f = ((d1 - DIST_EPSILON) / (d1 - d2)).max(0.0);
                if f > enterfrac {
                    enterfrac = f;
                    let mut normal = [0.0f32; 3];
                    normal[axis] = sign;
                    clipplane = Some(CPlane::new(normal, dist));
                }
            } else {
                let f = ((d1 + DIST_EPSILON) / (d1 - d2)).min(1.0);
                if f < leavefrac {
                    leavefrac = f;
                }
            }
        }
    }

    if !startout {
        trace.startsolid = true;
        if !getout {
            trace.allsolid = true;
            trace.fraction = 0.0;
            trace.contents = contents;
            trace.endpos = *start;
        }
        return trace;
    }

    if enterfrac < leavefrac && enterfrac > -1.0 {
        trace.fraction = enterfrac.max(0.0);
        if let Some(plane) = clipplane {
            trace.plane = plane;
        }
        trace.contents = contents;
        trace.endpos = vector_lerp(start, end, trace.fraction);
    }
    trace
}
