//! Config command implementation

use super::RangeArgs;
use anyhow::{Context, Result};
use clap::Args;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    /// Print as JSON instead of TOML
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: ConfigArgs) -> Result<()> {
    let config = args.range.load()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        let text = config.to_toml_string().context("Failed to render config")?;
        print!("{}", text);
    }
    Ok(())
}
