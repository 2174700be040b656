//! Roadmap: the feature table that drives the build loop.
//!
//! - `parser`: reads `.specs/roadmap.md` rows and rewrites status cells
//! - `resolver`: cycle detection and topological build order

mod parser;
mod resolver;

pub use parser::{
    Feature, FeatureStatus, Roadmap, parse_deps, parse_roadmap, rewrite_status, set_status,
};
pub use resolver::{BuildPlan, Unschedulable, check_cycles, find_cycle, resolve};
