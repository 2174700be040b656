//! Git workspaces: one isolated place per feature build.

mod git;
mod manager;

pub use git::{Git, GitCli};
pub use manager::{BRANCH_PREFIX, BranchManager, IsolationMode, SpaceQuery, Workspace};
