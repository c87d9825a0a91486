// cmodel.rs -- Collision model: brush clipping, BSP sweeps and point queries

use crate::cvar::CollisionConfig;
use crate::q_shared::{
    box_on_plane_side, dot_product, vector_compare, vector_lerp, vector_subtract, CModel, CPlane,
    CSurface, Trace, Vec3, CONTENTS_SOLID,
};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================
// Internal structures (not in the BSP file, but used at runtime)
// ============================================================

/// A node child: either another interior node or a terminal leaf.
///
/// The file format packs both into one signed integer (`>= 0` node,
/// `< 0` leaf `-(child + 1)`); that encoding is decoded once at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeChild {
    Node(usize),
    Leaf(usize),
}

impl NodeChild {
    pub fn from_raw(raw: i32) -> Self {
        if raw >= 0 {
            NodeChild::Node(raw as usize)
        } else {
            NodeChild::Leaf((-1 - raw) as usize)
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            NodeChild::Node(n) => n as i32,
            NodeChild::Leaf(l) => -1 - l as i32,
        }
    }
}

impl Default for NodeChild {
    fn default() -> Self {
        NodeChild::Leaf(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CNode {
    pub plane_idx: usize,
    /// [0] is in front of the plane, [1] behind it
    pub children: [NodeChild; 2],
}

#[derive(Debug, Clone, Default)]
pub struct CBrushSide {
    pub plane_idx: usize,
    /// index into the surface table, None for untextured sides
    pub surface_idx: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CLeaf {
    pub contents: i32,
    pub firstleafbrush: usize,
    pub numleafbrushes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CBrush {
    pub contents: i32,
    pub firstbrushside: usize,
    pub numsides: usize,
}

/// Raw geometry tables handed over by whoever loads the world.
#[derive(Debug, Clone, Default)]
pub struct MapData {
    pub planes: Vec<CPlane>,
    pub nodes: Vec<CNode>,
    pub leafs: Vec<CLeaf>,
    pub leafbrushes: Vec<usize>,
    pub brushes: Vec<CBrush>,
    pub brushsides: Vec<CBrushSide>,
    pub surfaces: Vec<CSurface>,
    pub models: Vec<CModel>,
    pub entity_string: String,
}

impl MapData {
    /// A six-node hull around a single box brush.
    ///
    /// Leaf 0 is empty, leaf 1 holds the brush. Each node's plane cuts one face
    /// of the box; the outside goes to the empty leaf and the inside continues
    /// down the chain.
    pub fn box_hull(mins: &Vec3, maxs: &Vec3, contents: i32) -> Self {
        let mut data = MapData {
            leafs: vec![
                CLeaf::default(),
                CLeaf {
                    contents,
                    firstleafbrush: 0,
                    numleafbrushes: 1,
                },
            ],
            leafbrushes: vec![0],
            brushes: vec![CBrush {
                contents,
                firstbrushside: 0,
                numsides: 6,
            }],
            ..Default::default()
        };

        for i in 0..6 {
            let axis = i >> 1;
            let side = i & 1;
            let d = if side == 0 { maxs[axis] } else { mins[axis] };

            let mut normal = [0.0f32; 3];
            normal[axis] = 1.0;
            data.planes.push(CPlane::new(normal, d));
            normal[axis] = -1.0;
            data.planes.push(CPlane::new(normal, -d));

            data.brushsides.push(CBrushSide {
                plane_idx: i * 2 + side,
                surface_idx: None,
            });

            let mut children = [NodeChild::Leaf(0); 2];
            children[side ^ 1] = if i != 5 {
                NodeChild::Node(i + 1)
            } else {
                NodeChild::Leaf(1)
            };
            data.nodes.push(CNode {
                plane_idx: i * 2,
                children,
            });
        }

        data.models.push(CModel {
            mins: *mins,
            maxs: *maxs,
            origin: [0.0; 3],
            headnode: 0,
        });
        data
    }
}

// ============================================================
// Constants
// ============================================================

/// Clip planes are pushed this far into the solid so float error never lets a
/// box come to rest exactly on a surface.
pub const DIST_EPSILON: f32 = 0.03125;

/// Leaf budget for the position test's box enumeration.
const POSITION_TEST_MAX_LEAFS: usize = 1024;

// ============================================================
// Counters
// ============================================================

/// Performance counters, safe to bump from concurrent readers.
#[derive(Debug, Default)]
pub struct TraceCounters {
    pub traces: AtomicU64,
    pub brush_traces: AtomicU64,
    pub point_contents: AtomicU64,
    pub depth_aborts: AtomicU64,
    pub leaf_truncations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub traces: u64,
    pub brush_traces: u64,
    pub point_contents: u64,
    pub depth_aborts: u64,
    pub leaf_truncations: u64,
}

impl TraceCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TraceStats {
        TraceStats {
            traces: self.traces.load(Ordering::Relaxed),
            brush_traces: self.brush_traces.load(Ordering::Relaxed),
            point_contents: self.point_contents.load(Ordering::Relaxed),
            depth_aborts: self.depth_aborts.load(Ordering::Relaxed),
            leaf_truncations: self.leaf_truncations.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.traces.store(0, Ordering::Relaxed);
        self.brush_traces.store(0, Ordering::Relaxed);
        self.point_contents.store(0, Ordering::Relaxed);
        self.depth_aborts.store(0, Ordering::Relaxed);
        self.leaf_truncations.store(0, Ordering::Relaxed);
    }
}

// ============================================================
// Trace work state
// ============================================================

/// One box sweep, as handed to `box_trace_batch`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceRequest {
    pub start: Vec3,
    pub end: Vec3,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub headnode: usize,
    pub brushmask: i32,
}

/// Everything one trace carries down the tree. Lives on the caller's stack,
/// so traces never share mutable state.
struct TraceWork {
    start: Vec3,
    end: Vec3,
    mins: Vec3,
    maxs: Vec3,
    extents: Vec3,
    contents: i32,
    ispoint: bool,
    trace: Trace,
    max_depth: usize,
    depth_aborted: bool,
    bad_index: bool,
}

impl TraceWork {
    fn new(start: &Vec3, end: &Vec3, mins: &Vec3, maxs: &Vec3, brushmask: i32, max_depth: usize) -> Self {
        let ispoint = mins.iter().chain(maxs.iter()).all(|&v| v == 0.0);
        let mut extents = [0.0f32; 3];
        for i in 0..3 {
            extents[i] = mins[i].abs().max(maxs[i].abs());
        }
        Self {
            start: *start,
            end: *end,
            mins: *mins,
            maxs: *maxs,
            extents,
            contents: brushmask,
            ispoint,
            trace: Trace::clear(end),
            max_depth,
            depth_aborted: false,
            bad_index: false,
        }
    }
}

// ============================================================
// Context: holds all loaded map state
// ============================================================

pub struct CModelContext {
    pub map_name: String,

    pub map_planes: Vec<CPlane>,
    pub map_nodes: Vec<CNode>,
    pub map_leafs: Vec<CLeaf>,
    pub map_leafbrushes: Vec<usize>,
    pub map_brushes: Vec<CBrush>,
    pub map_brushsides: Vec<CBrushSide>,
    pub map_surfaces: Vec<CSurface>,
    pub map_cmodels: Vec<CModel>,
    pub map_entitystring: String,

    pub counters: TraceCounters,
    pub max_trace_depth: usize,
    pub parallel_trace_threshold: usize,
}

impl CModelContext {
    /// An empty context: every trace is clear and every point is empty.
    pub fn new() -> Self {
        Self::with_config(&CollisionConfig::default())
    }

    pub fn with_config(cfg: &CollisionConfig) -> Self {
        Self {
            map_name: String::new(),
            map_planes: Vec::new(),
            map_nodes: Vec::new(),
            map_leafs: Vec::new(),
            map_leafbrushes: Vec::new(),
            map_brushes: Vec::new(),
            map_brushsides: Vec::new(),
            map_surfaces: Vec::new(),
            map_cmodels: Vec::new(),
            map_entitystring: String::new(),
            counters: TraceCounters::default(),
            max_trace_depth: cfg.max_trace_depth,
            parallel_trace_threshold: cfg.parallel_trace_threshold,
        }
    }

    /// Take ownership of loaded geometry tables.
    pub fn from_map(name: &str, data: MapData, cfg: &CollisionConfig) -> Self {
        let mut ctx = Self::with_config(cfg);
        ctx.map_name = name.to_string();
        ctx.map_planes = data.planes;
        ctx.map_nodes = data.nodes;
        ctx.map_leafs = data.leafs;
        ctx.map_leafbrushes = data.leafbrushes;
        ctx.map_brushes = data.brushes;
        ctx.map_brushsides = data.brushsides;
        ctx.map_surfaces = data.surfaces;
        ctx.map_cmodels = data.models;
        ctx.map_entitystring = data.entity_string;

        tracing::debug!(
            map = %ctx.map_name,
            nodes = ctx.map_nodes.len(),
            leafs = ctx.map_leafs.len(),
            brushes = ctx.map_brushes.len(),
            models = ctx.map_cmodels.len(),
            "collision model ready"
        );
        ctx
    }

    pub fn apply_config(&mut self, cfg: &CollisionConfig) {
        self.max_trace_depth = cfg.max_trace_depth;
        self.parallel_trace_threshold = cfg.parallel_trace_threshold;
    }

    /// True once there is a tree to walk.
    pub fn is_loaded(&self) -> bool {
        !self.map_nodes.is_empty() && !self.map_leafs.is_empty()
    }

    // ============================================================
    // Public accessors
    // ============================================================

    pub fn num_inline_models(&self) -> usize {
        self.map_cmodels.len()
    }

    pub fn model(&self, index: usize) -> Option<&CModel> {
        self.map_cmodels.get(index)
    }

    /// Looks up a sub-model by its entity-string name, `"*1"`, `"*2"`, ...
    /// Model 0 is the world and is not addressable this way.
    pub fn inline_model(&self, name: &str) -> Option<&CModel> {
        let num: usize = name.strip_prefix('*')?.parse().ok()?;
        if num < 1 {
            return None;
        }
        self.map_cmodels.get(num)
    }

    pub fn entity_string(&self) -> &str {
        &self.map_entitystring
    }

    pub fn leaf_contents(&self, leafnum: usize) -> i32 {
        self.map_leafs.get(leafnum).map_or(0, |l| l.contents)
    }

    // ============================================================
    // Point / leaf queries
    // ============================================================

    /// Walks from `headnode` to the leaf containing `p`. Points exactly on a
    /// plane go to the front child.
    pub fn point_leafnum(&self, p: &Vec3, headnode: usize) -> Option<usize> {
        if !self.is_loaded() {
            return None;
        }
        TraceCounters::bump(&self.counters.point_contents);

        let mut num = NodeChild::Node(headnode);
        for _ in 0..=self.max_trace_depth {
            match num {
                NodeChild::Leaf(l) => {
                    return (l < self.map_leafs.len()).then_some(l);
                }
                NodeChild::Node(n) => {
                    let node = self.map_nodes.get(n)?;
                    let plane = self.map_planes.get(node.plane_idx)?;
                    let d = plane.distance(p);
                    num = if d < 0.0 {
                        node.children[1]
                    } else {
                        node.children[0]
                    };
                }
            }
        }
        self.report_depth_abort("point_leafnum");
        None
    }

    /// Content flags of the leaf holding `p`, 0 when unloaded or out of range.
    pub fn point_contents(&self, p: &Vec3, headnode: usize) -> i32 {
        self.point_leafnum(p, headnode)
            .map_or(0, |l| self.map_leafs[l].contents)
    }

    /// Point contents in a sub-model's local frame. Translation only.
    pub fn transformed_point_contents(&self, p: &Vec3, headnode: usize, origin: &Vec3) -> i32 {
        let p_l = vector_subtract(p, origin);
        self.point_contents(&p_l, headnode)
    }

    // ============================================================
    // Box leaf enumeration
    // ============================================================

    /// Leaves touched by the box, up to `max_count`, plus the first node the
    /// box straddles (where the box stops fitting on one side).
    pub fn box_leafnums(
        &self,
        mins: &Vec3,
        maxs: &Vec3,
        max_count: usize,
        headnode: usize,
    ) -> (Vec<usize>, Option<usize>) {
        let mut leaf_list = Vec::new();
        let mut topnode = None;
        if self.is_loaded() {
            // one spare slot tells a full list from a cut-off one
            self.box_leafnums_r(
                NodeChild::Node(headnode),
                &mut leaf_list,
                max_count.saturating_add(1),
                mins,
                maxs,
                &mut topnode,
                0,
            );
        }
        if leaf_list.len() > max_count {
            leaf_list.truncate(max_count);
            TraceCounters::bump(&self.counters.leaf_truncations);
            tracing::warn!(map = %self.map_name, max_count, "box leaf list full, remaining leafs skipped");
        }
        (leaf_list, topnode)
    }

    #[allow(clippy::too_many_arguments)]
    fn box_leafnums_r(
        &self,
        mut num: NodeChild,
        leaf_list: &mut Vec<usize>,
        max_count: usize,
        mins: &Vec3,
        maxs: &Vec3,
        topnode: &mut Option<usize>,
        mut depth: usize,
    ) {
        loop {
            if depth > self.max_trace_depth {
                self.report_depth_abort("box_leafnums");
                return;
            }
            depth += 1;

            let n = match num {
                NodeChild::Leaf(l) => {
                    if l < self.map_leafs.len() && leaf_list.len() < max_count {
                        leaf_list.push(l);
                    }
                    return;
                }
                NodeChild::Node(n) => n,
            };

            let Some(node) = self.map_nodes.get(n) else {
                return;
            };
            let Some(plane) = self.map_planes.get(node.plane_idx) else {
                return;
            };

            match box_on_plane_side(mins, maxs, plane) {
                1 => num = node.children[0],
                2 => num = node.children[1],
                _ => {
                    if topnode.is_none() {
                        *topnode = Some(n);
                    }
                    self.box_leafnums_r(node.children[0], leaf_list, max_count, mins, maxs, topnode, depth);
                    num = node.children[1];
                }
            }
        }
    }

    // ============================================================
    // Brush intersector
    // ============================================================

    /// Distance of `p` to `plane` pushed out by the box corner that meets it first.
    #[inline]
    fn box_plane_dist(work: &TraceWork, plane: &CPlane, p: &Vec3) -> f32 {
        if work.ispoint {
            return dot_product(p, &plane.normal) - plane.dist;
        }
        let mut ofs = [0.0f32; 3];
        for j in 0..3 {
            ofs[j] = if plane.normal[j] < 0.0 {
                work.maxs[j]
            } else {
                work.mins[j]
            };
        }
        let dist = plane.dist - dot_product(&ofs, &plane.normal);
        dot_product(p, &plane.normal) - dist
    }

    /// Clips the whole sweep against one convex brush, recording a nearer hit
    /// or an embedded start in `work.trace`.
    fn clip_box_to_brush(&self, work: &mut TraceWork, brush_idx: usize) {
        let Some(brush) = self.map_brushes.get(brush_idx) else {
            work.bad_index = true;
            return;
        };
        if brush.numsides == 0 {
            return;
        }

        TraceCounters::bump(&self.counters.brush_traces);

        let mut enterfrac: f32 = -1.0;
        let mut leavefrac: f32 = 1.0;
        let mut clip: Option<(CPlane, usize)> = None;

        let mut getout = false;
        let mut startout = false;

        for side_idx in brush.firstbrushside..brush.firstbrushside + brush.numsides {
            let Some(plane) = self
                .map_brushsides
                .get(side_idx)
                .and_then(|s| self.map_planes.get(s.plane_idx))
            else {
                work.bad_index = true;
                continue;
            };

            let d1 = Self::box_plane_dist(work, plane, &work.start);
            let d2 = Self::box_plane_dist(work, plane, &work.end);

            if d2 > 0.0 {
                getout = true;
            }
            if d1 > 0.0 {
                startout = true;
            }

            // never enters this half-space
            if d1 > 0.0 && (d2 >= DIST_EPSILON || d2 >= d1) {
                return;
            }
            if d1 <= 0.0 && d2 <= 0.0 {
                continue;
            }

            if d1 > d2 {
                let f = ((d1 - DIST_EPSILON) / (d1 - d2)).max(0.0);
                if f > enterfrac {
                    enterfrac = f;
                    clip = Some((*plane, side_idx));
                }
            } else {
                let f = ((d1 + DIST_EPSILON) / (d1 - d2)).min(1.0);
                if f < leavefrac {
                    leavefrac = f;
                }
            }
        }

        if !startout {
            work.trace.startsolid = true;
            if !getout {
                work.trace.allsolid = true;
                work.trace.fraction = 0.0;
                work.trace.contents = brush.contents;
            }
            return;
        }

        if enterfrac < leavefrac && enterfrac > -1.0 && enterfrac < work.trace.fraction {
            work.trace.fraction = enterfrac.max(0.0);
            if let Some((plane, side_idx)) = clip {
                work.trace.plane = plane;
                work.trace.surface = Some(self.side_surface(side_idx));
            }
            work.trace.contents = brush.contents;
        }
    }

    fn side_surface(&self, side_idx: usize) -> CSurface {
        self.map_brushsides
            .get(side_idx)
            .and_then(|s| s.surface_idx)
            .and_then(|i| self.map_surfaces.get(i))
            .cloned()
            .unwrap_or_default()
    }

    /// Stationary containment test used when start == end.
    fn test_box_in_brush(&self, work: &mut TraceWork, brush_idx: usize) {
        let Some(brush) = self.map_brushes.get(brush_idx) else {
            work.bad_index = true;
            return;
        };
        if brush.numsides == 0 {
            return;
        }

        for side_idx in brush.firstbrushside..brush.firstbrushside + brush.numsides {
            let Some(plane) = self
                .map_brushsides
                .get(side_idx)
                .and_then(|s| self.map_planes.get(s.plane_idx))
            else {
                work.bad_index = true;
                continue;
            };
            if Self::box_plane_dist(work, plane, &work.start) > 0.0 {
                return;
            }
        }

        work.trace.startsolid = true;
        work.trace.allsolid = true;
        work.trace.fraction = 0.0;
        work.trace.contents = brush.contents;
    }

    // ============================================================
    // Leaf testing
    // ============================================================

    /// Runs every brush of the leaf that can block this trace through either
    /// the sweep clip or the stationary containment test.
    fn test_leaf_brushes(&self, work: &mut TraceWork, leafnum: usize, stationary: bool) {
        let Some(leaf) = self.map_leafs.get(leafnum) else {
            work.bad_index = true;
            return;
        };
        if leaf.contents & work.contents == 0 {
            return;
        }

        for k in leaf.firstleafbrush..leaf.firstleafbrush + leaf.numleafbrushes {
            let Some(&brushnum) = self.map_leafbrushes.get(k) else {
                work.bad_index = true;
                break;
            };
            match self.map_brushes.get(brushnum) {
                Some(b) if b.contents & work.contents != 0 => {}
                Some(_) => continue,
                None => {
                    work.bad_index = true;
                    continue;
                }
            }

            if stationary {
                self.test_box_in_brush(work, brushnum);
            } else {
                self.clip_box_to_brush(work, brushnum);
            }
            if work.trace.allsolid {
                return;
            }
        }
    }

    fn trace_to_leaf(&self, work: &mut TraceWork, leafnum: usize) {
        self.test_leaf_brushes(work, leafnum, false);
    }

    fn test_in_leaf(&self, work: &mut TraceWork, leafnum: usize) {
        self.test_leaf_brushes(work, leafnum, true);
    }

    // ============================================================
    // BSP sweep walker
    // ============================================================

    /// Splits the sweep `[p1f, p2f]` at each node plane, near side first, so
    /// the early-out on `trace.fraction` can never skip a nearer hit.
    #[allow(clippy::too_many_arguments)]
    fn recursive_hull_check(
        &self,
        work: &mut TraceWork,
        num: NodeChild,
        p1f: f32,
        p2f: f32,
        p1: &Vec3,
        p2: &Vec3,
        depth: usize,
    ) {
        if work.trace.fraction <= p1f {
            return;
        }
        if depth > work.max_depth {
            if !work.depth_aborted {
                work.depth_aborted = true;
                TraceCounters::bump(&self.counters.depth_aborts);
            }
            return;
        }

        let n = match num {
            NodeChild::Leaf(l) => {
                self.trace_to_leaf(work, l);
                return;
            }
            NodeChild::Node(n) => n,
        };

        let Some(node) = self.map_nodes.get(n) else {
            work.bad_index = true;
            return;
        };
        let Some(plane) = self.map_planes.get(node.plane_idx) else {
            work.bad_index = true;
            return;
        };
        let children = node.children;

        let t1 = plane.distance(p1);
        let t2 = plane.distance(p2);
        let offset = if work.ispoint {
            0.0
        } else {
            (work.extents[0] * plane.normal[0]).abs()
                + (work.extents[1] * plane.normal[1]).abs()
                + (work.extents[2] * plane.normal[2]).abs()
        };

        if t1 >= offset + 1.0 && t2 >= offset + 1.0 {
            self.recursive_hull_check(work, children[0], p1f, p2f, p1, p2, depth + 1);
            return;
        }
        if t1 < -offset - 1.0 && t2 < -offset - 1.0 {
            self.recursive_hull_check(work, children[1], p1f, p2f, p1, p2, depth + 1);
            return;
        }

        // put the crosspoint DIST_EPSILON pixels on the near side
        let (side, frac, frac2) = if t1 < t2 {
            let idist = 1.0 / (t1 - t2);
            (
                1usize,
                (t1 - offset + DIST_EPSILON) * idist,
                (t1 + offset + DIST_EPSILON) * idist,
            )
        } else if t1 > t2 {
            let idist = 1.0 / (t1 - t2);
            (
                0usize,
                (t1 + offset + DIST_EPSILON) * idist,
                (t1 - offset - DIST_EPSILON) * idist,
            )
        } else {
            (0usize, 1.0, 0.0)
        };
        let frac = frac.clamp(0.0, 1.0);
        let frac2 = frac2.clamp(0.0, 1.0);

        let midf = p1f + (p2f - p1f) * frac;
        let mid = vector_lerp(p1, p2, frac);
        self.recursive_hull_check(work, children[side], p1f, midf, p1, &mid, depth + 1);

        let midf2 = p1f + (p2f - p1f) * frac2;
        let mid2 = vector_lerp(p1, p2, frac2);
        self.recursive_hull_check(work, children[side ^ 1], midf2, p2f, &mid2, p2, depth + 1);
    }

    // ============================================================
    // Box tracing
    // ============================================================

    /// Sweeps the box `mins..maxs` from `start` to `end` through the tree at
    /// `headnode`, returning the first brush hit whose contents match `brushmask`.
    pub fn box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: usize,
        brushmask: i32,
    ) -> Trace {
        TraceCounters::bump(&self.counters.traces);

        if !self.is_loaded() {
            return Trace::clear(end);
        }

        let mut work = TraceWork::new(start, end, mins, maxs, brushmask, self.max_trace_depth);

        // position test special case
        if vector_compare(start, end) {
            let mut c1 = [0.0f32; 3];
            let mut c2 = [0.0f32; 3];
            for i in 0..3 {
                c1[i] = start[i] + mins[i] - 1.0;
                c2[i] = start[i] + maxs[i] + 1.0;
            }

            let (leafs, _topnode) = self.box_leafnums(&c1, &c2, POSITION_TEST_MAX_LEAFS, headnode);
            for leafnum in leafs {
                self.test_in_leaf(&mut work, leafnum);
                if work.trace.allsolid {
                    break;
                }
            }
            work.trace.endpos = *start;
            self.finish_trace(&work);
            return work.trace;
        }

        self.recursive_hull_check(&mut work, NodeChild::Node(headnode), 0.0, 1.0, start, end, 0);

        if work.trace.fraction == 1.0 {
            work.trace.endpos = *end;
        } else {
            work.trace.endpos = vector_lerp(start, end, work.trace.fraction);
        }
        self.finish_trace(&work);
        work.trace
    }

    fn finish_trace(&self, work: &TraceWork) {
        if work.depth_aborted {
            tracing::warn!(
                map = %self.map_name,
                max_depth = work.max_depth,
                "trace exceeded maximum BSP depth, returning nearest hit so far"
            );
        }
        if work.bad_index {
            tracing::warn!(map = %self.map_name, "trace skipped out-of-range geometry indices");
        }
    }

    fn report_depth_abort(&self, what: &str) {
        TraceCounters::bump(&self.counters.depth_aborts);
        tracing::warn!(map = %self.map_name, what, max_depth = self.max_trace_depth, "BSP walk too deep");
    }

    /// Trace against a movable sub-model positioned at `origin`.
    ///
    /// Only translation is applied: the sub-model is assumed to be unrotated.
    #[allow(clippy::too_many_arguments)]
    pub fn transformed_box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: usize,
        brushmask: i32,
        origin: &Vec3,
    ) -> Trace {
        let start_l = vector_subtract(start, origin);
        let end_l = vector_subtract(end, origin);

        let mut trace = self.box_trace(&start_l, &end_l, mins, maxs, headnode, brushmask);

        trace.endpos = if trace.fraction == 1.0 {
            *end
        } else {
            vector_lerp(start, end, trace.fraction)
        };
        trace
    }

    /// Runs independent traces, fanning out over the rayon pool once the batch
    /// reaches `parallel_trace_threshold`. Results keep request order.
    pub fn box_trace_batch(&self, requests: &[TraceRequest]) -> Vec<Trace> {
        let one = |r: &TraceRequest| {
            self.box_trace(&r.start, &r.end, &r.mins, &r.maxs, r.headnode, r.brushmask)
        };
        if requests.len() >= self.parallel_trace_threshold {
            requests.par_iter().map(one).collect()
        } else {
            requests.iter().map(one).collect()
        }
    }

    /// Solid check for a single point against the world model.
    pub fn point_is_solid(&self, p: &Vec3) -> bool {
        self.point_contents(p, 0) & CONTENTS_SOLID != 0
    }
}

impl Default for CModelContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::q_shared::{
        bounds_overlap, CONTENTS_MONSTER, CONTENTS_WATER, MASK_ALL, MASK_SOLID, PLANE_ANYX, PLANE_Z,
    };
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    const ZERO: Vec3 = [0.0, 0.0, 0.0];

    /// Pushes a six-sided axial box brush and returns its index.
    fn push_box_brush(data: &mut MapData, mins: &Vec3, maxs: &Vec3, contents: i32) -> usize {
        let firstbrushside = data.brushsides.len();
        for axis in 0..3 {
            let mut n = [0.0f32; 3];
            n[axis] = 1.0;
            data.brushsides.push(CBrushSide {
                plane_idx: data.planes.len(),
                surface_idx: None,
            });
            data.planes.push(CPlane::new(n, maxs[axis]));

            n[axis] = -1.0;
            data.brushsides.push(CBrushSide {
                plane_idx: data.planes.len(),
                surface_idx: None,
            });
            data.planes.push(CPlane::new(n, -mins[axis]));
        }
        data.brushes.push(CBrush {
            contents,
            firstbrushside,
            numsides: 6,
        });
        data.brushes.len() - 1
    }

    /// The 1024x1024x1 floor slab: node 0 splits at z=0, front is empty leaf
    /// 1, back is leaf 2 holding the slab brush. Leaf 0 stays unused.
    fn slab_ctx() -> CModelContext {
        let mut data = MapData::default();
        data.planes.push(CPlane::new([0.0, 0.0, 1.0], 0.0));
        let brush = push_box_brush(&mut data, &[-512.0, -512.0, -1.0], &[512.0, 512.0, 0.0], CONTENTS_SOLID);
        data.surfaces.push(CSurface {
            name: "floor/concrete".into(),
            flags: 0,
            value: 0,
        });
        // top face of the slab carries the material
        let top_side = data.brushes[brush].firstbrushside + 4;
        data.brushsides[top_side].surface_idx = Some(0);

        data.nodes.push(CNode {
            plane_idx: 0,
            children: [NodeChild::Leaf(1), NodeChild::Leaf(2)],
        });
        data.leafs = vec![
            CLeaf::default(),
            CLeaf::default(),
            CLeaf {
                contents: CONTENTS_SOLID,
                firstleafbrush: 0,
                numleafbrushes: 1,
                ..Default::default()
            },
        ];
        data.leafbrushes.push(brush);
        data.models.push(CModel {
            mins: [-512.0, -512.0, -1.0],
            maxs: [512.0, 512.0, 0.0],
            origin: ZERO,
            headnode: 0,
        });
        CModelContext::from_map("slab", data, &CollisionConfig::default())
    }

    /// Axial kd-tree over [-256, 256]^3 splitting at region midpoints on
    /// axis `depth % 3`; each leaf lists every brush touching its region.
    fn grid_ctx(boxes: &[(Vec3, Vec3, i32)], depth: usize) -> CModelContext {
        grid_ctx_cut(boxes, &[], depth)
    }

    /// Like `grid_ctx`, but brush `i` also gets a seventh side through its
    /// centre with normal `cuts[i]`, when one is given.
    fn grid_ctx_cut(boxes: &[(Vec3, Vec3, i32)], cuts: &[Option<Vec3>], depth: usize) -> CModelContext {
        let mut data = MapData::default();
        let brushes: Vec<usize> = boxes
            .iter()
            .enumerate()
            .map(|(i, (mins, maxs, c))| {
                let b = push_box_brush(&mut data, mins, maxs, *c);
                if let Some(Some(normal)) = cuts.get(i) {
                    let centre = vector_lerp(mins, maxs, 0.5);
                    data.brushsides.push(CBrushSide {
                        plane_idx: data.planes.len(),
                        surface_idx: None,
                    });
                    data.planes.push(CPlane::new(*normal, dot_product(normal, &centre)));
                    data.brushes[b].numsides += 1;
                }
                b
            })
            .collect();

        fn build(
            data: &mut MapData,
            boxes: &[(Vec3, Vec3, i32)],
            brushes: &[usize],
            mins: Vec3,
            maxs: Vec3,
            level: usize,
            depth: usize,
        ) -> NodeChild {
            if level == depth {
                let firstleafbrush = data.leafbrushes.len();
                let mut contents = 0;
                for (b, (bmins, bmaxs, c)) in brushes.iter().zip(boxes) {
                    if bounds_overlap(&mins, &maxs, bmins, bmaxs) {
                        data.leafbrushes.push(*b);
                        contents |= *c;
                    }
                }
                data.leafs.push(CLeaf {
                    contents,
                    firstleafbrush,
                    numleafbrushes: data.leafbrushes.len() - firstleafbrush,
                });
                return NodeChild::Leaf(data.leafs.len() - 1);
            }

            let axis = level % 3;
            let mid = (mins[axis] + maxs[axis]) * 0.5;
            let mut normal = [0.0f32; 3];
            normal[axis] = 1.0;
            data.planes.push(CPlane::new(normal, mid));
            let plane_idx = data.planes.len() - 1;
            data.nodes.push(CNode {
                plane_idx,
                children: [NodeChild::Leaf(0); 2],
            });
            let n = data.nodes.len() - 1;

            let mut front_mins = mins;
            front_mins[axis] = mid;
            let mut back_maxs = maxs;
            back_maxs[axis] = mid;
            let front = build(data, boxes, brushes, front_mins, maxs, level + 1, depth);
            let back = build(data, boxes, brushes, mins, back_maxs, level + 1, depth);
            data.nodes[n].children = [front, back];
            NodeChild::Node(n)
        }

        build(&mut data, boxes, &brushes, [-256.0; 3], [256.0; 3], 0, depth);
        data.models.push(CModel {
            mins: [-256.0; 3],
            maxs: [256.0; 3],
            origin: ZERO,
            headnode: 0,
        });
        CModelContext::from_map("grid", data, &CollisionConfig::default())
    }

    /// Clip against every brush in the map, ignoring the tree.
    fn brute_force_trace(ctx: &CModelContext, start: &Vec3, end: &Vec3, mins: &Vec3, maxs: &Vec3, mask: i32) -> Trace {
        let mut work = TraceWork::new(start, end, mins, maxs, mask, ctx.max_trace_depth);
        for (i, b) in ctx.map_brushes.iter().enumerate() {
            if b.contents & mask == 0 {
                continue;
            }
            ctx.clip_box_to_brush(&mut work, i);
            if work.trace.allsolid {
                break;
            }
        }
        work.trace
    }

    #[test]
    fn test_node_child_encoding() {
        assert_eq!(NodeChild::from_raw(0), NodeChild::Node(0));
        assert_eq!(NodeChild::from_raw(7), NodeChild::Node(7));
        assert_eq!(NodeChild::from_raw(-1), NodeChild::Leaf(0));
        assert_eq!(NodeChild::from_raw(-5), NodeChild::Leaf(4));
        for raw in [-300, -2, -1, 0, 1, 4095] {
            assert_eq!(NodeChild::from_raw(raw).to_raw(), raw);
        }
    }

    #[test]
    fn test_dist_epsilon() {
        assert_eq!(DIST_EPSILON, 1.0 / 32.0);
    }

    #[test]
    fn test_box_trace_no_map() {
        let ctx = CModelContext::new();
        let end = [10.0, 20.0, 30.0];
        let trace = ctx.box_trace(&ZERO, &end, &ZERO, &ZERO, 0, MASK_ALL);
        assert_eq!(trace.fraction, 1.0);
        assert_eq!(trace.endpos, end);
        assert!(!trace.startsolid && !trace.allsolid);
        assert_eq!(ctx.point_contents(&ZERO, 0), 0);
        assert_eq!(ctx.point_leafnum(&ZERO, 0), None);
    }

    #[test]
    fn test_floor_slab_point_trace() {
        let ctx = slab_ctx();
        let trace = ctx.box_trace(&[0.0, 0.0, 100.0], &[0.0, 0.0, -100.0], &ZERO, &ZERO, 0, MASK_SOLID);

        assert_abs_diff_eq!(trace.fraction, 0.5, epsilon = 0.001);
        assert!(trace.fraction < 0.5, "hit is biased onto the near side");
        assert_eq!(trace.plane.normal, [0.0, 0.0, 1.0]);
        assert_eq!(trace.plane.plane_type, PLANE_Z);
        assert_eq!(trace.contents, CONTENTS_SOLID);
        assert!(!trace.startsolid && !trace.allsolid);
        assert_abs_diff_eq!(trace.endpos[2], 0.0, epsilon = 0.1);
        assert_eq!(trace.surface.as_ref().map(|s| s.name.as_str()), Some("floor/concrete"));
    }

    #[test]
    fn test_floor_slab_miss_outside_bounds() {
        let ctx = slab_ctx();
        let end = [2000.0, 0.0, -100.0];
        let trace = ctx.box_trace(&[2000.0, 0.0, 100.0], &end, &ZERO, &ZERO, 0, MASK_SOLID);
        assert_eq!(trace.fraction, 1.0);
        assert_eq!(trace.endpos, end);
        assert!(trace.surface.is_none());
    }

    #[test]
    fn test_floor_slab_mask_filters_contents() {
        let ctx = slab_ctx();
        let trace = ctx.box_trace(&[0.0, 0.0, 100.0], &[0.0, 0.0, -100.0], &ZERO, &ZERO, 0, CONTENTS_WATER);
        assert_eq!(trace.fraction, 1.0);
    }

    #[test]
    fn test_floor_slab_box_trace_rests_on_top() {
        let ctx = slab_ctx();
        let mins = [-16.0, -16.0, -24.0];
        let maxs = [16.0, 16.0, 32.0];
        let trace = ctx.box_trace(&[0.0, 0.0, 100.0], &[0.0, 0.0, -100.0], &mins, &maxs, 0, MASK_SOLID);

        assert!(trace.fraction < 1.0);
        assert_eq!(trace.plane.normal, [0.0, 0.0, 1.0]);
        // the box bottom stops just above the floor
        assert_abs_diff_eq!(trace.endpos[2], 24.0, epsilon = 0.1);
        assert!(trace.endpos[2] > 24.0);
    }

    #[test]
    fn test_embedded_start_is_allsolid() {
        let ctx = slab_ctx();
        let start = [0.0, 0.0, -0.5];
        let end = [100.0, 50.0, -0.5];
        let trace = ctx.box_trace(&start, &end, &ZERO, &ZERO, 0, MASK_SOLID);
        assert!(trace.startsolid);
        assert!(trace.allsolid);
        assert_eq!(trace.fraction, 0.0);
        assert_eq!(trace.endpos, start);
        assert_eq!(trace.contents, CONTENTS_SOLID);
    }

    #[test]
    fn test_start_inside_moving_out_is_startsolid_only() {
        let ctx = slab_ctx();
        let trace = ctx.box_trace(&[0.0, 0.0, -0.5], &[0.0, 0.0, 50.0], &ZERO, &ZERO, 0, MASK_SOLID);
        assert!(trace.startsolid);
        assert!(!trace.allsolid);
        assert_eq!(trace.fraction, 1.0);
    }

    #[test]
    fn test_position_test() {
        let ctx = slab_ctx();
        let mins = [-16.0, -16.0, -24.0];
        let maxs = [16.0, 16.0, 32.0];

        let inside = [0.0, 0.0, 10.0];
        let trace = ctx.box_trace(&inside, &inside, &mins, &maxs, 0, MASK_SOLID);
        assert!(trace.startsolid && trace.allsolid);
        assert_eq!(trace.fraction, 0.0);
        assert_eq!(trace.endpos, inside);
        assert_eq!(trace.contents, CONTENTS_SOLID);

        let above = [0.0, 0.0, 40.0];
        let trace = ctx.box_trace(&above, &above, &mins, &maxs, 0, MASK_SOLID);
        assert!(!trace.startsolid);
        assert_eq!(trace.fraction, 1.0);
        assert_eq!(trace.endpos, above);
    }

    #[test]
    fn test_point_contents_and_leafnum_agree() {
        let ctx = slab_ctx();
        for p in [[0.0, 0.0, 10.0], [0.0, 0.0, -0.5], [3000.0, 0.0, -10.0], [0.0, 0.0, 0.0]] {
            let leaf = ctx.point_leafnum(&p, 0).unwrap();
            assert_eq!(ctx.point_contents(&p, 0), ctx.leaf_contents(leaf));

            // the position test enumerates the same leaf for a zero box at p
            let (leafs, _) = ctx.box_leafnums(&p, &p, 16, 0);
            assert!(leafs.contains(&leaf));
        }
        assert_eq!(ctx.point_contents(&[0.0, 0.0, 10.0], 0), 0);
        assert_eq!(ctx.point_contents(&[0.0, 0.0, -0.5], 0), CONTENTS_SOLID);
        // on the plane goes to the front child
        assert_eq!(ctx.point_leafnum(&[0.0, 0.0, 0.0], 0), Some(1));
        assert!(ctx.point_is_solid(&[0.0, 0.0, -0.5]));
    }

    #[test]
    fn test_box_leafnums_topnode() {
        let ctx = slab_ctx();
        let (leafs, top) = ctx.box_leafnums(&[-8.0, -8.0, 4.0], &[8.0, 8.0, 8.0], 16, 0);
        assert_eq!(leafs, vec![1]);
        assert_eq!(top, None);

        let (leafs, top) = ctx.box_leafnums(&[-8.0, -8.0, -8.0], &[8.0, 8.0, 8.0], 16, 0);
        assert_eq!(leafs, vec![1, 2]);
        assert_eq!(top, Some(0));

        assert_eq!(ctx.counters.snapshot().leaf_truncations, 0);

        let (leafs, _) = ctx.box_leafnums(&[-8.0, -8.0, -8.0], &[8.0, 8.0, 8.0], 1, 0);
        assert_eq!(leafs.len(), 1);
        assert_eq!(ctx.counters.snapshot().leaf_truncations, 1);

        // exactly full is not a truncation
        let (leafs, _) = ctx.box_leafnums(&[-8.0, -8.0, -8.0], &[8.0, 8.0, 8.0], 2, 0);
        assert_eq!(leafs.len(), 2);
        assert_eq!(ctx.counters.snapshot().leaf_truncations, 1);
    }

    #[test]
    fn test_position_test_reports_leaf_overflow() {
        // 2048 leaves, more than the position test will enumerate
        let boxes = [([-64.0, -64.0, -8.0], [64.0, 64.0, 0.0], CONTENTS_SOLID)];
        let ctx = grid_ctx(&boxes, 11);

        let p = [0.0, 0.0, 128.0];
        let small = ctx.box_trace(&p, &p, &[-8.0; 3], &[8.0; 3], 0, MASK_SOLID);
        assert!(!small.startsolid);
        assert_eq!(ctx.counters.snapshot().leaf_truncations, 0);

        let huge = ctx.box_trace(&p, &p, &[-512.0; 3], &[512.0; 3], 0, MASK_SOLID);
        assert_eq!(huge.endpos, p);
        assert_eq!(ctx.counters.snapshot().leaf_truncations, 1);
    }

    #[test]
    fn test_out_of_range_indices_are_skipped() {
        let mut data = MapData::default();
        data.planes.push(CPlane::new([0.0, 0.0, 1.0], 0.0));
        data.nodes.push(CNode {
            plane_idx: 0,
            children: [NodeChild::Node(99), NodeChild::Leaf(42)],
        });
        data.leafs.push(CLeaf {
            contents: CONTENTS_SOLID,
            firstleafbrush: 10,
            numleafbrushes: 3,
            ..Default::default()
        });
        let ctx = CModelContext::from_map("broken", data, &CollisionConfig::default());

        let end = [0.0, 0.0, -100.0];
        let trace = ctx.box_trace(&[0.0, 0.0, 100.0], &end, &ZERO, &ZERO, 0, MASK_ALL);
        assert_eq!(trace.fraction, 1.0);
        assert_eq!(trace.endpos, end);
        assert_eq!(ctx.point_contents(&[0.0, 0.0, 5.0], 0), 0);
        assert_eq!(ctx.point_contents(&[0.0, 0.0, -5.0], 0), 0);
        // bad headnode
        assert_eq!(ctx.box_trace(&ZERO, &end, &ZERO, &ZERO, 7, MASK_ALL).fraction, 1.0);
    }

    #[test]
    fn test_cyclic_tree_aborts_at_depth() {
        let mut data = MapData::default();
        data.planes.push(CPlane::new([0.0, 0.0, 1.0], 0.0));
        // node 0 points back at itself on both sides
        data.nodes.push(CNode {
            plane_idx: 0,
            children: [NodeChild::Node(0), NodeChild::Node(0)],
        });
        data.leafs.push(CLeaf::default());
        let mut cfg = CollisionConfig::default();
        cfg.max_trace_depth = 32;
        let ctx = CModelContext::from_map("cycle", data, &cfg);

        let trace = ctx.box_trace(&[0.0, 0.0, 10.0], &[0.0, 0.0, 20.0], &ZERO, &ZERO, 0, MASK_ALL);
        assert_eq!(trace.fraction, 1.0);
        assert_eq!(ctx.point_leafnum(&ZERO, 0), None);
        assert!(ctx.counters.snapshot().depth_aborts >= 2);
    }

    #[test]
    fn test_empty_brush_is_inert() {
        let mut data = MapData::box_hull(&[-8.0; 3], &[8.0; 3], CONTENTS_SOLID);
        data.brushes[0].numsides = 0;
        let ctx = CModelContext::from_map("empty", data, &CollisionConfig::default());
        let trace = ctx.box_trace(&[-50.0, 0.0, 0.0], &[50.0, 0.0, 0.0], &ZERO, &ZERO, 0, MASK_ALL);
        assert_eq!(trace.fraction, 1.0);
    }

    #[test]
    fn test_box_hull_blocks_from_every_side() {
        let ctx = CModelContext::from_map(
            "hull",
            MapData::box_hull(&[-8.0; 3], &[8.0; 3], CONTENTS_MONSTER),
            &CollisionConfig::default(),
        );
        for axis in 0..3 {
            for sign in [-1.0f32, 1.0] {
                let mut start = ZERO;
                start[axis] = 100.0 * sign;
                let trace = ctx.box_trace(&start, &ZERO, &ZERO, &ZERO, 0, CONTENTS_MONSTER);
                assert!(trace.fraction < 1.0, "axis {axis} sign {sign}");
                assert_eq!(trace.plane.normal[axis], sign);
                assert_abs_diff_eq!(trace.endpos[axis], 8.0 * sign, epsilon = 0.1);
            }
        }
        assert_eq!(ctx.point_contents(&ZERO, 0), CONTENTS_MONSTER);
        assert_eq!(ctx.point_contents(&[9.0, 0.0, 0.0], 0), 0);
    }

    #[test]
    fn test_transformed_trace_translates() {
        let ctx = CModelContext::from_map(
            "door",
            MapData::box_hull(&[-8.0; 3], &[8.0; 3], CONTENTS_SOLID),
            &CollisionConfig::default(),
        );
        let origin = [200.0, 0.0, 0.0];
        let start = [100.0, 0.0, 0.0];
        let end = [300.0, 0.0, 0.0];

        let trace = ctx.transformed_box_trace(&start, &end, &ZERO, &ZERO, 0, MASK_SOLID, &origin);
        assert!(trace.fraction < 1.0);
        assert_abs_diff_eq!(trace.endpos[0], 192.0, epsilon = 0.1);
        assert_eq!(trace.plane.normal, [-1.0, 0.0, 0.0]);

        let miss = [300.0, 100.0, 0.0];
        let trace = ctx.transformed_box_trace(&[100.0, 100.0, 0.0], &miss, &ZERO, &ZERO, 0, MASK_SOLID, &origin);
        assert_eq!(trace.fraction, 1.0);
        assert_eq!(trace.endpos, miss);

        assert_eq!(ctx.transformed_point_contents(&[205.0, 0.0, 0.0], 0, &origin), CONTENTS_SOLID);
        assert_eq!(ctx.transformed_point_contents(&[5.0, 0.0, 0.0], 0, &origin), 0);
    }

    #[test]
    fn test_inline_model_lookup() {
        let mut data = MapData::box_hull(&[-8.0; 3], &[8.0; 3], CONTENTS_SOLID);
        data.models.push(CModel {
            mins: [-1.0; 3],
            maxs: [1.0; 3],
            origin: [64.0, 0.0, 0.0],
            headnode: 0,
        });
        let ctx = CModelContext::from_map("models", data, &CollisionConfig::default());
        assert_eq!(ctx.num_inline_models(), 2);
        assert_eq!(ctx.inline_model("*1").map(|m| m.origin), Some([64.0, 0.0, 0.0]));
        assert!(ctx.inline_model("*0").is_none());
        assert!(ctx.inline_model("*2").is_none());
        assert!(ctx.inline_model("1").is_none());
        assert!(ctx.inline_model("*x").is_none());
    }

    #[test]
    fn test_batch_matches_single_traces() {
        let mut ctx = slab_ctx();
        let requests: Vec<TraceRequest> = (0..40)
            .map(|i| TraceRequest {
                start: [i as f32 * 40.0 - 800.0, 0.0, 64.0],
                end: [i as f32 * 40.0 - 800.0, 10.0, -64.0],
                mins: [-4.0; 3],
                maxs: [4.0; 3],
                headnode: 0,
                brushmask: MASK_SOLID,
            })
            .collect();

        let serial = ctx.box_trace_batch(&requests);
        ctx.parallel_trace_threshold = 1;
        let parallel = ctx.box_trace_batch(&requests);
        assert_eq!(serial, parallel);
        for (r, t) in requests.iter().zip(&serial) {
            assert_eq!(*t, ctx.box_trace(&r.start, &r.end, &r.mins, &r.maxs, 0, MASK_SOLID));
        }
        assert!(serial.iter().any(|t| t.fraction < 1.0));
        assert!(serial.iter().any(|t| t.fraction == 1.0));
    }

    #[test]
    fn test_counters() {
        let ctx = slab_ctx();
        ctx.box_trace(&[0.0, 0.0, 100.0], &[0.0, 0.0, -100.0], &ZERO, &ZERO, 0, MASK_SOLID);
        ctx.point_contents(&ZERO, 0);
        let stats = ctx.counters.snapshot();
        assert_eq!(stats.traces, 1);
        assert!(stats.brush_traces >= 1);
        assert_eq!(stats.point_contents, 1);
        ctx.counters.reset();
        assert_eq!(ctx.counters.snapshot(), TraceStats::default());
    }

    #[test]
    fn test_grid_world_matches_brute_force_example() {
        let boxes = [
            ([-64.0, -64.0, -8.0], [64.0, 64.0, 0.0], CONTENTS_SOLID),
            ([96.0, -16.0, 0.0], [128.0, 16.0, 64.0], CONTENTS_SOLID),
        ];
        let ctx = grid_ctx(&boxes, 6);
        let start = [0.0, 0.0, 32.0];
        let end = [200.0, 0.0, 32.0];
        let walker = ctx.box_trace(&start, &end, &[-8.0; 3], &[8.0; 3], 0, MASK_SOLID);
        let brute = brute_force_trace(&ctx, &start, &end, &[-8.0; 3], &[8.0; 3], MASK_SOLID);
        assert!(walker.fraction < 1.0);
        assert_abs_diff_eq!(walker.fraction, brute.fraction, epsilon = 1e-6);
        assert_eq!(walker.plane.normal, [-1.0, 0.0, 0.0]);
    }

    fn grid_coord() -> impl Strategy<Value = f32> {
        (-20i32..=20).prop_map(|v| v as f32 * 8.0)
    }

    fn grid_point() -> impl Strategy<Value = Vec3> {
        [grid_coord(), grid_coord(), grid_coord()]
    }

    fn grid_brush() -> impl Strategy<Value = (Vec3, Vec3, i32)> {
        (
            [-16i32..16, -16i32..16, -16i32..16],
            [1i32..8, 1i32..8, 1i32..8],
            prop_oneof![Just(CONTENTS_SOLID), Just(CONTENTS_WATER)],
        )
            .prop_map(|(m, s, c)| {
                let mins = [m[0] as f32 * 8.0, m[1] as f32 * 8.0, m[2] as f32 * 8.0];
                let maxs = [
                    mins[0] + s[0] as f32 * 8.0,
                    mins[1] + s[1] as f32 * 8.0,
                    mins[2] + s[2] as f32 * 8.0,
                ];
                (mins, maxs, c)
            })
    }

    const R2: f32 = std::f32::consts::FRAC_1_SQRT_2;
    const R3: f32 = 0.577_350_26;

    fn slant_cut() -> impl Strategy<Value = Option<Vec3>> {
        prop_oneof![
            Just(None),
            Just(Some([R2, 0.0, R2])),
            Just(Some([-R2, 0.0, R2])),
            Just(Some([0.0, R2, -R2])),
            Just(Some([R2, -R2, 0.0])),
            Just(Some([-R3, R3, R3])),
        ]
    }

    #[test]
    fn test_slanted_side_stops_point_trace() {
        // the wedge keeps the half of the box where x + z <= 0
        let boxes = [([-32.0; 3], [32.0; 3], CONTENTS_SOLID)];
        let ctx = grid_ctx_cut(&boxes, &[Some([R2, 0.0, R2])], 5);
        let start = [16.0, 0.0, 100.0];
        let end = [16.0, 0.0, -100.0];

        let walker = ctx.box_trace(&start, &end, &ZERO, &ZERO, 0, MASK_SOLID);
        let d1 = R2 * 116.0;
        let d2 = R2 * -84.0;
        assert_abs_diff_eq!(walker.fraction, (d1 - DIST_EPSILON) / (d1 - d2), epsilon = 1e-4);
        assert_abs_diff_eq!(walker.plane.normal[0], R2, epsilon = 1e-6);
        assert_abs_diff_eq!(walker.plane.normal[2], R2, epsilon = 1e-6);
        assert_eq!(walker.plane.plane_type, PLANE_ANYX);

        let brute = brute_force_trace(&ctx, &start, &end, &ZERO, &ZERO, MASK_SOLID);
        assert_abs_diff_eq!(walker.fraction, brute.fraction, epsilon = 1e-6);

        // the cut-away half is open
        let t = ctx.box_trace(&[24.0, 0.0, 100.0], &[24.0, 0.0, 0.0], &ZERO, &ZERO, 0, MASK_SOLID);
        assert_eq!(t.fraction, 1.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn prop_walker_never_misses_nearer_hit(
            brushes in prop::collection::vec((grid_brush(), slant_cut()), 1..6),
            start in grid_point(),
            end in grid_point(),
            half in prop_oneof![Just(0.0f32), Just(4.0f32), Just(8.0f32)],
        ) {
            prop_assume!(!vector_compare(&start, &end));
            let (boxes, cuts): (Vec<_>, Vec<_>) = brushes.into_iter().unzip();
            let ctx = grid_ctx_cut(&boxes, &cuts, 5);
            let mins = [-half; 3];
            let maxs = [half; 3];

            let walker = ctx.box_trace(&start, &end, &mins, &maxs, 0, MASK_SOLID);
            let brute = brute_force_trace(&ctx, &start, &end, &mins, &maxs, MASK_SOLID);

            prop_assert!(
                walker.fraction <= brute.fraction + 0.01,
                "walker {} brute {}", walker.fraction, brute.fraction
            );
        }

        #[test]
        fn prop_clear_trace_reaches_end(
            start in grid_point(),
            end in grid_point(),
        ) {
            // all geometry lives below z = -200
            let boxes = [([-256.0, -256.0, -256.0], [256.0, 256.0, -224.0], CONTENTS_SOLID)];
            let ctx = grid_ctx(&boxes, 4);
            let trace = ctx.box_trace(&start, &end, &[-4.0; 3], &[4.0; 3], 0, MASK_SOLID);
            prop_assert_eq!(trace.fraction, 1.0);
            prop_assert_eq!(trace.endpos, end);
            prop_assert!(!trace.startsolid);
        }

        #[test]
        fn prop_point_contents_matches_leaf(
            boxes in prop::collection::vec(grid_brush(), 1..6),
            p in grid_point(),
        ) {
            let ctx = grid_ctx(&boxes, 5);
            let leaf = ctx.point_leafnum(&p, 0);
            prop_assert!(leaf.is_some());
            prop_assert_eq!(ctx.point_contents(&p, 0), ctx.leaf_contents(leaf.unwrap_or(0)));
        }
    }
}
