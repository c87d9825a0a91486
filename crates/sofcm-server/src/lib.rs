#![allow(clippy::too_many_arguments, clippy::float_cmp, clippy::needless_range_loop)]

// Server-side collision: the entities the world links, the Area Tree that
// indexes them, and the composite trace over world and entities.

pub mod edict;
pub mod sv_world;
pub mod world;

pub use edict::{Edict, Solid, SvFlags};
pub use sv_world::{AreaStats, AreaTree, AreaType, CollisionModel};
pub use world::{ServerWorld, WorldStats};
