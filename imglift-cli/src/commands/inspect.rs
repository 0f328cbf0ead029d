//! `imglift inspect` - header-only preflight, no kernel resources.

use std::path::PathBuf;

use clap::Args;

use imglift::format::{self, ImageFile};
use imglift::MigrationState;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Path to the disk image
    pub image: PathBuf,
}

pub fn execute(args: InspectArgs, _global: &crate::GlobalFlags) -> anyhow::Result<()> {
    let image = ImageFile::open(&args.image)?;
    let format = format::detect(&image)?;
    let descriptor = format.descriptor();
    let header = format.parse(&image.path)?;

    println!("image:    {}", args.image.display());
    println!("format:   {}", descriptor.name);
    println!(
        "size:     {:.1} GiB logical, {:.1} GiB physical",
        header.logical_gib(),
        header.physical_gib()
    );
    if let Some(subtype) = &header.create_subtype {
        println!("subtype:  {subtype}");
    }
    println!();
    println!("header fields:");
    for field in &header.fields {
        println!("  {:24} {}", field.name, field.value);
    }
    if !header.descriptor.is_empty() {
        println!();
        println!("descriptor:");
        for (key, value) in &header.descriptor {
            println!("  {key}={value}");
        }
    }

    // Reuse the pipeline's preflight bookkeeping for the verdict.
    let state = MigrationState::new();
    let support = format.check_prerequisites(&header);
    for failure in &support.failures {
        state.disqualify(failure.clone());
    }

    println!();
    if support.supported {
        match &support.confirmation {
            Some(confirmation) => {
                println!("verdict:  supported, needs confirmation: {confirmation}")
            }
            None => println!("verdict:  supported"),
        }
        Ok(())
    } else {
        println!("verdict:  not supported");
        for reason in state.reasons() {
            println!("  - {reason}");
        }
        anyhow::bail!("image does not meet upload prerequisites");
    }
}
