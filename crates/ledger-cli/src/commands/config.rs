//! Config commands

use std::path::Path;

use super::Context;
use crate::config;
use crate::ConfigCommands;

pub fn handle(action: ConfigCommands, path: Option<&Path>, ctx: &Context) -> anyhow::Result<()> {
    match action {
        ConfigCommands::Show => {
            print!("{}", config::render(&ctx.config)?);
        }
        ConfigCommands::Init => {
            let Some(path) = path else {
                anyhow::bail!("config init needs --config <file.toml>");
            };
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            config::save(&ledger_core::LedgerConfig::default(), path)?;
            println!("Configuration initialized at {}", path.display());
        }
    }
    Ok(())
}
