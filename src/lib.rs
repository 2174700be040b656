pub mod agent;
pub mod config;
pub mod context;
pub mod errors;
pub mod eval;
pub mod lock;
pub mod orchestrator;
pub mod prompts;
pub mod roadmap;
pub mod settings;
pub mod signals;
pub mod ui;
pub mod util;
pub mod validation;
pub mod workspace;

#[cfg(test)]
mod testing;
