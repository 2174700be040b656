//! Commit quality evaluation, run as a sidecar next to the build loop.

pub mod campaign;
pub mod mechanical;
pub mod record;
pub mod sidecar;
pub mod supervisor;

pub use campaign::{CampaignSummary, summarize, write_campaign};
pub use mechanical::{Mechanical, MechanicalEval, run_mechanical_eval};
pub use record::{AgentEval, EvalRecord};
pub use sidecar::{DRAIN_SENTINEL, EvalSidecar, SidecarConfig, SidecarStats, sentinel_path};
pub use supervisor::{DEFAULT_DRAIN_TIMEOUT, SidecarHandle};
