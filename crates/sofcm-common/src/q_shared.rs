// q_shared.rs -- shared math, content flags, planes and trace results

pub type Vec3 = [f32; 3];

pub const VEC3_ORIGIN: Vec3 = [0.0, 0.0, 0.0];

// ============================================================
// Contents flags
// ============================================================
// Lower bits are stronger, and will eat weaker brushes completely.

pub const CONTENTS_SOLID: i32 = 1;
pub const CONTENTS_WINDOW: i32 = 2;
pub const CONTENTS_AUX: i32 = 4;
pub const CONTENTS_LAVA: i32 = 8;
pub const CONTENTS_SLIME: i32 = 16;
pub const CONTENTS_WATER: i32 = 32;
pub const CONTENTS_MIST: i32 = 64;

pub const CONTENTS_AREAPORTAL: i32 = 0x8000;
pub const CONTENTS_PLAYERCLIP: i32 = 0x10000;
pub const CONTENTS_MONSTERCLIP: i32 = 0x20000;

pub const CONTENTS_CURRENT_0: i32 = 0x40000;
pub const CONTENTS_CURRENT_90: i32 = 0x80000;
pub const CONTENTS_CURRENT_180: i32 = 0x100000;
pub const CONTENTS_CURRENT_270: i32 = 0x200000;
pub const CONTENTS_CURRENT_UP: i32 = 0x400000;
pub const CONTENTS_CURRENT_DOWN: i32 = 0x800000;

pub const CONTENTS_ORIGIN: i32 = 0x1000000;
pub const CONTENTS_MONSTER: i32 = 0x2000000;
pub const CONTENTS_DEADMONSTER: i32 = 0x4000000;
pub const CONTENTS_DETAIL: i32 = 0x8000000;
pub const CONTENTS_TRANSLUCENT: i32 = 0x10000000;
pub const CONTENTS_LADDER: i32 = 0x20000000;

// ============================================================
// Content masks
// ============================================================

pub const MASK_ALL: i32 = -1;
pub const MASK_SOLID: i32 = CONTENTS_SOLID | CONTENTS_WINDOW;
pub const MASK_PLAYERSOLID: i32 =
    CONTENTS_SOLID | CONTENTS_PLAYERCLIP | CONTENTS_WINDOW | CONTENTS_MONSTER;
pub const MASK_DEADSOLID: i32 = CONTENTS_SOLID | CONTENTS_PLAYERCLIP | CONTENTS_WINDOW;
pub const MASK_MONSTERSOLID: i32 =
    CONTENTS_SOLID | CONTENTS_MONSTERCLIP | CONTENTS_WINDOW | CONTENTS_MONSTER;
pub const MASK_WATER: i32 = CONTENTS_WATER | CONTENTS_LAVA | CONTENTS_SLIME;
pub const MASK_OPAQUE: i32 = CONTENTS_SOLID | CONTENTS_SLIME | CONTENTS_LAVA;
pub const MASK_SHOT: i32 =
    CONTENTS_SOLID | CONTENTS_MONSTER | CONTENTS_WINDOW | CONTENTS_DEADMONSTER;

// ============================================================
// Surface flags
// ============================================================

pub const SURF_LIGHT: i32 = 0x1;
pub const SURF_SLICK: i32 = 0x2;
pub const SURF_SKY: i32 = 0x4;
pub const SURF_WARP: i32 = 0x8;
pub const SURF_NODRAW: i32 = 0x80;

// ============================================================
// Plane
// ============================================================

pub const PLANE_X: u8 = 0;
pub const PLANE_Y: u8 = 1;
pub const PLANE_Z: u8 = 2;
pub const PLANE_ANYX: u8 = 3;
pub const PLANE_ANYY: u8 = 4;
pub const PLANE_ANYZ: u8 = 5;

/// A half-space boundary: points with `dot(p, normal) <= dist` are behind it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CPlane {
    pub normal: Vec3,
    pub dist: f32,
    /// `PLANE_X..PLANE_Z` for axial planes, which lets tree walks skip the dot product.
    pub plane_type: u8,
    pub signbits: u8,
}

impl Default for CPlane {
    fn default() -> Self {
        Self {
            normal: [0.0; 3],
            dist: 0.0,
            plane_type: PLANE_ANYZ,
            signbits: 0,
        }
    }
}

impl CPlane {
    /// Builds a plane, deriving the axial type and sign bits from the normal.
    pub fn new(normal: Vec3, dist: f32) -> Self {
        Self {
            normal,
            dist,
            plane_type: plane_type_for_normal(&normal),
            signbits: sign_bits_for_normal(&normal),
        }
    }

    /// Signed distance from `p` to the plane, using the axial shortcut when possible.
    #[inline]
    pub fn distance(&self, p: &Vec3) -> f32 {
        if self.plane_type < 3 {
            p[self.plane_type as usize] - self.dist
        } else {
            dot_product(&self.normal, p) - self.dist
        }
    }
}

/// Only positive axial normals get an axial type; `distance` relies on that.
pub fn plane_type_for_normal(normal: &Vec3) -> u8 {
    for axis in 0..3 {
        if normal[axis] == 1.0 {
            return axis as u8;
        }
    }

    let ax = normal[0].abs();
    let ay = normal[1].abs();
    let az = normal[2].abs();
    if ax >= ay && ax >= az {
        PLANE_ANYX
    } else if ay >= ax && ay >= az {
        PLANE_ANYY
    } else {
        PLANE_ANYZ
    }
}

pub fn sign_bits_for_normal(normal: &Vec3) -> u8 {
    let mut bits = 0u8;
    for j in 0..3 {
        if normal[j] < 0.0 {
            bits |= 1 << j;
        }
    }
    bits
}

/// Returns 1 (front), 2 (back), or 3 (crossing) for a box vs. plane test.
pub fn box_on_plane_side(emins: &Vec3, emaxs: &Vec3, p: &CPlane) -> i32 {
    // fast axial cases
    if p.plane_type < 3 {
        let t = p.plane_type as usize;
        if p.dist <= emins[t] {
            return 1;
        }
        if p.dist >= emaxs[t] {
            return 2;
        }
        return 3;
    }

    // pick the box corners nearest and farthest along the normal
    let mut dist1 = 0.0;
    let mut dist2 = 0.0;
    for j in 0..3 {
        if p.signbits & (1 << j) != 0 {
            dist1 += p.normal[j] * emins[j];
            dist2 += p.normal[j] * emaxs[j];
        } else {
            dist1 += p.normal[j] * emaxs[j];
            dist2 += p.normal[j] * emins[j];
        }
    }

    let mut sides = 0;
    if dist1 >= p.dist {
        sides = 1;
    }
    if dist2 < p.dist {
        sides |= 2;
    }
    sides
}

// ============================================================
// Surfaces and inline models
// ============================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CSurface {
    pub name: String,
    pub flags: i32,
    pub value: i32,
}

/// A BSP model: index 0 is the world, the rest are movable sub-models
/// (doors, platforms) with their own head node.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CModel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub origin: Vec3,
    pub headnode: usize,
}

// ============================================================
// Trace
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// if true, plane is not valid
    pub allsolid: bool,
    /// if true, the initial point was in a solid area
    pub startsolid: bool,
    /// time completed, 1.0 = didn't hit anything
    pub fraction: f32,
    /// final position
    pub endpos: Vec3,
    /// surface normal at impact
    pub plane: CPlane,
    /// surface hit
    pub surface: Option<CSurface>,
    /// contents on other side of surface hit
    pub contents: i32,
    /// edict index of the entity hit, 0 for the world
    pub ent: Option<usize>,
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            allsolid: false,
            startsolid: false,
            fraction: 1.0,
            endpos: [0.0; 3],
            plane: CPlane::default(),
            surface: None,
            contents: 0,
            ent: None,
        }
    }
}

impl Trace {
    /// A trace that reached `end` without touching anything.
    pub fn clear(end: &Vec3) -> Self {
        Self {
            endpos: *end,
            ..Self::default()
        }
    }

    /// True when something blocked or enclosed the move.
    pub fn hit(&self) -> bool {
        self.fraction < 1.0 || self.startsolid
    }
}

// ============================================================
// MATHLIB -- Vector operations
// ============================================================

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// Point at parametric position `frac` on the segment `start -> end`.
#[inline]
pub fn vector_lerp(start: &Vec3, end: &Vec3, frac: f32) -> Vec3 {
    [
        start[0] + frac * (end[0] - start[0]),
        start[1] + frac * (end[1] - start[1]),
        start[2] + frac * (end[2] - start[2]),
    ]
}

pub fn vector_compare(v1: &Vec3, v2: &Vec3) -> bool {
    v1[0] == v2[0] && v1[1] == v2[1] && v1[2] == v2[2]
}

/// Standard 3-axis interval overlap test, touching counts as overlap.
pub fn bounds_overlap(mins1: &Vec3, maxs1: &Vec3, mins2: &Vec3, maxs2: &Vec3) -> bool {
    !(mins1[0] > maxs2[0]
        || mins1[1] > maxs2[1]
        || mins1[2] > maxs2[2]
        || maxs1[0] < mins2[0]
        || maxs1[1] < mins2[1]
        || maxs1[2] < mins2[2])
}
