//! `auto-sdd eval` and `auto-sdd campaign`.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

pub async fn cmd_eval(
    project_dir: &Path,
    overrides: auto_sdd::config::CliOverrides,
    cancel: CancellationToken,
) -> Result<()> {
    use auto_sdd::agent::{AgentStep, BackoffAgent, ClaudeAgent};
    use auto_sdd::config::Config;
    use auto_sdd::eval::{EvalSidecar, SidecarConfig};

    let config = Config::load(project_dir, &overrides)?;
    std::fs::create_dir_all(&config.eval.output_dir)?;

    let agent = config.eval.agent.then(|| {
        BackoffAgent::new(
            ClaudeAgent::new(&config.claude_cmd, config.agent_log_dir())
                .with_cost_log(config.cost_log()),
            config.backoff,
        )
    });
    let sidecar = EvalSidecar::new(
        SidecarConfig {
            project_dir: config.project_dir.clone(),
            output_dir: config.eval.output_dir.clone(),
            interval: config.eval.interval,
            model: config.model_for(AgentStep::Eval),
            max_context_tokens: config.max_context_tokens,
        },
        agent,
    );

    let stats = sidecar.run(cancel).await?;
    println!(
        "Evaluated {} commit(s), {} error(s){}",
        stats.evaluated,
        stats.errors,
        if stats.agent_disabled {
            "; agent evaluation was disabled mid-run"
        } else {
            ""
        }
    );
    if let Some(path) = stats.campaign {
        println!("Campaign summary: {}", path.display());
    }
    Ok(())
}

pub fn cmd_campaign(project_dir: &Path, output_dir: Option<PathBuf>) -> Result<()> {
    use auto_sdd::config::{CliOverrides, Config};
    use auto_sdd::eval::write_campaign;

    let overrides = CliOverrides {
        eval_output_dir: output_dir,
        ..Default::default()
    };
    let config = Config::load(project_dir, &overrides)?;
    match write_campaign(&config.eval.output_dir)? {
        Some(path) => println!("Campaign summary written to {}", path.display()),
        None => println!("No eval records in {}", config.eval.output_dir.display()),
    }
    Ok(())
}
