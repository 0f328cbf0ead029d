//! `imglift prepare` - the full migration pipeline.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::Args;

use imglift::{pipeline, MigrateOptions, MigrationState};

#[derive(Args, Debug)]
pub struct PrepareArgs {
    /// Path to the disk image
    pub image: PathBuf,

    /// Accept fragile-variant warnings without prompting
    #[arg(long)]
    pub assume_yes: bool,

    /// Write the JSON report to this path instead of the configured one
    #[arg(long)]
    pub report: Option<PathBuf>,
}

pub fn execute(args: PrepareArgs, global: &crate::GlobalFlags) -> anyhow::Result<()> {
    let config = global.load_config()?;

    // Surface fragile-variant confirmations interactively before the
    // pipeline commits to kernel resources.
    let assume_yes = if args.assume_yes {
        true
    } else {
        confirm_fragile_variant(&args.image)?
    };

    let options = MigrateOptions {
        image: args.image.clone(),
        config,
        assume_yes,
    };
    tracing::info!(image = %args.image.display(), "starting migration pipeline");
    let report = pipeline::run(&options)?;

    let report_path = args
        .report
        .clone()
        .unwrap_or_else(|| options.config.result_file(&args.image));
    report.write_json(&report_path)?;

    println!("image:    {}", args.image.display());
    if let Some(format) = &report.format {
        println!("format:   {format}");
    }
    if let Some(boot) = &report.boot_type {
        println!("boot:     {boot} (launch-mode recommendation)");
    }
    if !report.tasks.is_empty() {
        println!("tasks:");
        for task in &report.tasks {
            let status = if task.ok { "ok" } else { "FAILED" };
            match &task.detail {
                Some(detail) => println!("  {:28} {status} ({detail})", task.name),
                None => println!("  {:28} {status}", task.name),
            }
        }
    }
    if !report.interfaces.is_empty() {
        println!("nics:     {}", report.interfaces.join(", "));
    }
    println!("report:   {}", report_path.display());

    if report.eligible {
        println!("result:   eligible for upload");
        Ok(())
    } else {
        println!("result:   NOT eligible for upload");
        for reason in &report.reasons {
            println!("  - {reason}");
        }
        anyhow::bail!("image disqualified ({} reason(s))", report.reasons.len());
    }
}

/// When preflight reports a fragile-but-supported variant, ask the
/// operator. Declining (or a non-interactive stdin) leaves the
/// confirmation unaccepted and the pipeline will disqualify with an
/// actionable reason.
fn confirm_fragile_variant(image: &PathBuf) -> anyhow::Result<bool> {
    let state = MigrationState::new();
    let Some(info) = pipeline::preflight(image, &state, true)? else {
        return Ok(false);
    };
    let Some(confirmation) = &info.support.confirmation else {
        return Ok(false);
    };

    print!("{confirmation}\ncontinue anyway? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
