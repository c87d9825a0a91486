// common.rs -- logging bootstrap shared by the collision crates

use tracing_subscriber::EnvFilter;

use crate::cvar::CollisionConfig;

/// Filter used when `RUST_LOG` is unset: `developer` turns on debug output.
pub fn default_log_level(cfg: &CollisionConfig) -> &'static str {
    if cfg.developer {
        "debug"
    } else {
        "info"
    }
}

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level comes from
/// [`default_log_level`]. Returns false if a subscriber was already installed,
/// which is harmless.
pub fn init_logging(cfg: &CollisionConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_level(cfg)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
