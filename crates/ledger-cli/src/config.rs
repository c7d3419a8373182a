//! CLI Configuration

use anyhow::Context;
use ledger_core::LedgerConfig;
use std::fs;
use std::path::Path;

/// Load the ledger configuration, falling back to defaults when no file is given
/// or the file does not exist
pub fn load(path: Option<&Path>) -> anyhow::Result<LedgerConfig> {
    match path {
        Some(path) if path.exists() => {
            let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            parse(&content).with_context(|| format!("parsing {}", path.display()))
        }
        _ => Ok(LedgerConfig::default()),
    }
}

/// Write `config` as TOML, creating parent directories
pub fn save(config: &LedgerConfig, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, render(config)?).with_context(|| format!("writing {}", path.display()))
}

pub fn parse(content: &str) -> anyhow::Result<LedgerConfig> {
    Ok(toml::from_str(content)?)
}

pub fn render(config: &LedgerConfig) -> anyhow::Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::OverageBehaviour;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse(
            r#"
            [lock]
            max_attempts = 3

            [deduction]
            overage = "cap"
            "#,
        )
        .unwrap();
        assert_eq!(config.lock.max_attempts, 3);
        assert_eq!(config.deduction.overage, OverageBehaviour::Cap);
        assert_eq!(config.batching, LedgerConfig::default().batching);
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = load(Some(Path::new("/nonexistent/ledger.toml"))).unwrap();
        assert_eq!(config, LedgerConfig::default());
    }

    #[test]
    fn test_render_parses_back() {
        let config = LedgerConfig::default();
        assert_eq!(parse(&render(&config).unwrap()).unwrap(), config);
    }
}
