//! CLI command implementations.
//!
//! | Module     | Commands handled       |
//! |------------|------------------------|
//! | `build`    | `Build`                |
//! | `plan`     | `Order`, `ValidateSpec`|
//! | `eval`     | `Eval`, `Campaign`     |
//! | `status`   | `Status`               |

pub mod build;
pub mod eval;
pub mod plan;
pub mod status;

pub use build::cmd_build;
pub use eval::{cmd_campaign, cmd_eval};
pub use plan::{cmd_order, cmd_validate_spec};
pub use status::cmd_status;
