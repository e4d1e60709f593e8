//! Engine configuration loaded from TOML

use anyhow::{Context, Result};
use meshcall_core::EngineConfig;
use std::path::Path;

/// Load the configuration at `path`, or the defaults without one
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    parse(&text).with_context(|| format!("parsing config file {}", path.display()))
}

/// Parse a TOML document; missing keys keep their defaults
pub fn parse(text: &str) -> Result<EngineConfig> {
    Ok(toml::from_str(text)?)
}

/// Effective configuration as TOML
pub fn render(config: &EngineConfig) -> Result<String> {
    toml::to_string_pretty(config).context("serializing configuration")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(parse("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_partial_document_overrides_only_given_keys() {
        let config = parse(
            r#"
            event_capacity = 32

            [local_user]
            id = "alice"
            display_name = "Alice"

            [call]
            join_timeout = 250

            [call.rejoin_retry]
            max_attempts = 5
            initial_delay = 100
            backoff_factor = 2
            max_delay = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.event_capacity, 32);
        assert_eq!(config.local_user.id.as_str(), "alice");
        assert_eq!(config.call.join_timeout, Duration::from_millis(250));
        assert_eq!(config.call.rejoin_retry.max_attempts, 5);
        assert_eq!(
            config.call.eviction_grace,
            EngineConfig::default().call.eviction_grace
        );
    }

    #[test]
    fn test_rendered_defaults_parse_back() {
        let rendered = render(&EngineConfig::default()).unwrap();
        assert!(rendered.contains("join_timeout = 5000"));
        assert_eq!(parse(&rendered).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        assert!(parse("[call]\njoin_timeout = \"soon\"").is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load(Some(Path::new("/nonexistent/meshcall.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/meshcall.toml"));
    }
}
