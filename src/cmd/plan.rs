//! Read-only planning commands: `auto-sdd order` and `auto-sdd validate-spec`.

use anyhow::{Result, bail};
use std::path::{Path, PathBuf};

pub fn cmd_order(project_dir: &Path) -> Result<()> {
    use auto_sdd::config::ROADMAP_FILE;
    use auto_sdd::roadmap::{Roadmap, resolve};
    use console::style;

    let roadmap = Roadmap::load(&project_dir.join(ROADMAP_FILE))?;
    let plan = resolve(roadmap.features())?;

    if plan.is_empty() && plan.unschedulable.is_empty() {
        println!("No pending features in {}", ROADMAP_FILE);
        return Ok(());
    }

    println!("{}", style("Build order").bold());
    for (i, feature) in plan.order.iter().enumerate() {
        let deps = if feature.deps.is_empty() {
            "-".to_string()
        } else {
            feature
                .deps
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "  {:>3}. #{} {} {}",
            i + 1,
            feature.id,
            feature.name,
            style(format!("(deps: {}, {})", deps, feature.complexity)).dim()
        );
    }

    if !plan.unschedulable.is_empty() {
        println!();
        println!("{}", style("Cannot be scheduled").yellow().bold());
        for u in &plan.unschedulable {
            println!("  #{} {}: {}", u.feature.id, u.feature.name, u.reason);
        }
    }
    Ok(())
}

pub fn cmd_validate_spec(project_dir: &Path, files: &[PathBuf]) -> Result<()> {
    use auto_sdd::ui::icons::{CHECK, CROSS};
    use auto_sdd::validation::validate_frontmatter;
    use console::style;

    let mut failed = 0;
    for file in files {
        let path = if file.is_absolute() {
            file.clone()
        } else {
            project_dir.join(file)
        };
        match validate_frontmatter(&path) {
            Ok(front) => println!(
                "{}{} {}",
                CHECK,
                file.display(),
                style(format!("({} / {})", front.domain, front.feature)).dim()
            ),
            Err(e) => {
                failed += 1;
                println!("{}{}", CROSS, style(e).red());
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} spec files failed validation", failed, files.len());
    }
    Ok(())
}
