//! `conveyor config`: Emit the default configuration.

use anyhow::Context;
use conveyor_core::ConveyorConfig;
use std::path::PathBuf;

pub fn execute(output: Option<PathBuf>) -> anyhow::Result<()> {
    let text = ConveyorConfig::default().to_toml_string()?;
    match output {
        Some(path) => {
            std::fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}
