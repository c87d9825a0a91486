// edict.rs -- the slice of server entity state the collision core reads
//
// Behaviour (think/touch/use callbacks) stays with the game side; the world
// only needs where an entity is, how big it is, whether it blocks, and who
// owns it.

use sofcm_common::q_shared::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Solid {
    /// no interaction with other objects
    #[default]
    Not,
    /// only touch when inside, after moving
    Trigger,
    /// touch on edge
    Bbox,
    /// bsp clip, touch on edge
    Bsp,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SvFlags: i32 {
        /// treat as CONTENTS_DEADMONSTER for collision
        const DEADMONSTER = 0x00000002;
        /// treat as CONTENTS_MONSTER for collision
        const MONSTER     = 0x00000004;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edict {
    pub inuse: bool,
    pub linkcount: i32,
    /// set while any Area Tree leaf references this edict
    pub area_linked: bool,

    pub origin: Vec3,
    pub mins: Vec3,
    pub maxs: Vec3,
    /// derived by linking: `maxs - mins`
    pub size: Vec3,
    /// derived by linking: world-space box padded by one unit
    pub absmin: Vec3,
    pub absmax: Vec3,

    pub solid: Solid,
    pub svflags: SvFlags,
    /// inline model index for `Solid::Bsp` entities ("*N")
    pub modelindex: usize,
    /// edict index of the owner, if any
    pub owner: Option<usize>,
}

impl Default for Edict {
    fn default() -> Self {
        Self {
            inuse: false,
            linkcount: 0,
            area_linked: false,
            origin: [0.0; 3],
            mins: [0.0; 3],
            maxs: [0.0; 3],
            size: [0.0; 3],
            absmin: [0.0; 3],
            absmax: [0.0; 3],
            solid: Solid::Not,
            svflags: SvFlags::empty(),
            modelindex: 0,
            owner: None,
        }
    }
}

impl Edict {
    /// An in-use bounding box entity.
    pub fn bbox(origin: Vec3, mins: Vec3, maxs: Vec3) -> Self {
        Self {
            inuse: true,
            origin,
            mins,
            maxs,
            solid: Solid::Bbox,
            ..Self::default()
        }
    }

    /// An in-use trigger volume.
    pub fn trigger(origin: Vec3, mins: Vec3, maxs: Vec3) -> Self {
        Self {
            solid: Solid::Trigger,
            ..Self::bbox(origin, mins, maxs)
        }
    }

    /// An in-use movable brush model (door, platform) using inline model `modelindex`.
    pub fn brush_model(origin: Vec3, mins: Vec3, maxs: Vec3, modelindex: usize) -> Self {
        Self {
            solid: Solid::Bsp,
            modelindex,
            ..Self::bbox(origin, mins, maxs)
        }
    }

    pub fn with_owner(mut self, owner: usize) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_svflags(mut self, flags: SvFlags) -> Self {
        self.svflags = flags;
        self
    }

    /// Contents a bounding box entity presents to traces and point tests.
    pub fn box_contents(&self) -> i32 {
        if self.svflags.contains(SvFlags::DEADMONSTER) {
            CONTENTS_DEADMONSTER
        } else {
            CONTENTS_MONSTER
        }
    }

    /// Recompute `size` and the padded `absmin`/`absmax` from origin and box.
    pub fn set_abs_box(&mut self) {
        self.size = vector_subtract(&self.maxs, &self.mins);
        self.absmin = vector_add(&self.origin, &self.mins);
        self.absmax = vector_add(&self.origin, &self.maxs);

        // movement is clipped an epsilon away from an actual edge, so boxes
        // that don't quite touch must still be checked
        for i in 0..3 {
            self.absmin[i] -= 1.0;
            self.absmax[i] += 1.0;
        }
    }
}
