#![allow(clippy::too_many_arguments, clippy::float_cmp, clippy::needless_range_loop,
         clippy::manual_range_contains, clippy::comparison_chain)]

// Shared collision layer: math and trace types, BSP format, the collision
// model itself, and the tunables and logging it runs with.

pub mod q_shared;
pub mod qfiles;
pub mod cvar;
pub mod common;
pub mod cmodel;
pub mod cmodel_load;
