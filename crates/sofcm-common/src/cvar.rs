// cvar.rs -- collision tunables, settable by name like console variables

use crate::q_shared::Vec3;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown tunable \"{0}\"")]
    UnknownVar(String),
    #[error("{name}: cannot parse \"{value}\"")]
    BadValue { name: String, value: String },
    #[error("{name}: {value} is out of range")]
    OutOfRange { name: String, value: String },
}

/// Every knob the collision core reads. Defaults are the stock engine values.
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionConfig {
    /// Entity references each Area Tree leaf list may hold before overflow is reported.
    pub area_leaf_capacity: usize,
    /// Default result capacity of area queries.
    pub area_query_max: usize,
    /// Recursion guard for the BSP walker; deeper trees abort to the best result so far.
    pub max_trace_depth: usize,
    /// Batch size at which `box_trace_batch` fans out over the rayon pool.
    pub parallel_trace_threshold: usize,
    /// Area Tree bounds used when no world model is loaded.
    pub world_mins: Vec3,
    pub world_maxs: Vec3,
    pub developer: bool,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            area_leaf_capacity: 256,
            area_query_max: 1024,
            max_trace_depth: 512,
            parallel_trace_threshold: 64,
            world_mins: [-4096.0, -4096.0, -4096.0],
            world_maxs: [4096.0, 4096.0, 4096.0],
            developer: false,
        }
    }
}

impl CollisionConfig {
    pub const VAR_NAMES: [&'static str; 7] = [
        "sv_area_leaf_capacity",
        "sv_area_query_max",
        "cm_max_trace_depth",
        "cm_parallel_traces",
        "sv_world_mins",
        "sv_world_maxs",
        "developer",
    ];

    /// Set a tunable from its string form.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        match name {
            "sv_area_leaf_capacity" => self.area_leaf_capacity = parse_count(name, value)?,
            "sv_area_query_max" => self.area_query_max = parse_count(name, value)?,
            "cm_max_trace_depth" => self.max_trace_depth = parse_count(name, value)?,
            "cm_parallel_traces" => self.parallel_trace_threshold = parse_count(name, value)?,
            "sv_world_mins" => self.world_mins = parse_vec3(name, value)?,
            "sv_world_maxs" => self.world_maxs = parse_vec3(name, value)?,
            "developer" => self.developer = parse_number(name, value)? != 0.0,
            _ => return Err(ConfigError::UnknownVar(name.to_string())),
        }
        tracing::debug!(name, value, "tunable set");
        Ok(())
    }

    /// Current value of a tunable in the same string form `set` accepts.
    pub fn get(&self, name: &str) -> Option<String> {
        let v = match name {
            "sv_area_leaf_capacity" => self.area_leaf_capacity.to_string(),
            "sv_area_query_max" => self.area_query_max.to_string(),
            "cm_max_trace_depth" => self.max_trace_depth.to_string(),
            "cm_parallel_traces" => self.parallel_trace_threshold.to_string(),
            "sv_world_mins" => format_vec3(&self.world_mins),
            "sv_world_maxs" => format_vec3(&self.world_maxs),
            "developer" => (self.developer as i32).to_string(),
            _ => return None,
        };
        Some(v)
    }

    /// Apply `name value` lines, config-file style. Blank lines and `//` comments
    /// are skipped; an optional leading `set` is accepted. Stops at the first error.
    pub fn apply_lines(&mut self, text: &str) -> Result<usize, ConfigError> {
        let mut applied = 0;
        for line in text.lines() {
            let line = match line.find("//") {
                Some(pos) => &line[..pos],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let line = line.strip_prefix("set ").map(str::trim_start).unwrap_or(line);
            let (name, value) = match line.split_once(char::is_whitespace) {
                Some((n, v)) => (n, v.trim().trim_matches('"')),
                None => (line, ""),
            };
            self.set(name, value)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// World bounds must be non-empty on both horizontal axes for the Area Tree.
    pub fn world_bounds_valid(&self) -> bool {
        self.world_mins[0] < self.world_maxs[0] && self.world_mins[1] < self.world_maxs[1]
    }
}

fn parse_number(name: &str, value: &str) -> Result<f32, ConfigError> {
    value.trim().parse::<f32>().map_err(|_| ConfigError::BadValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_count(name: &str, value: &str) -> Result<usize, ConfigError> {
    let v = parse_number(name, value)?;
    if !(1.0..=(u32::MAX as f32)).contains(&v) || v.fract() != 0.0 {
        return Err(ConfigError::OutOfRange {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    Ok(v as usize)
}

fn parse_vec3(name: &str, value: &str) -> Result<Vec3, ConfigError> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(ConfigError::BadValue {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    let mut v = [0.0f32; 3];
    for (i, p) in parts.iter().enumerate() {
        v[i] = parse_number(name, p)?;
    }
    Ok(v)
}

fn format_vec3(v: &Vec3) -> String {
    format!("{} {} {}", v[0], v[1], v[2])
}
