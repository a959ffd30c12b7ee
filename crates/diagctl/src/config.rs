//! Configuration loading for diagctl

use std::path::Path;

use anyhow::{Context, Result};
use diag_client::{ConversationConfig, DiagClientConfig};

/// Conversation used when no configuration file is given
pub const DEFAULT_TESTER: &str = "diagctl";

/// Tester logical address of the default conversation
pub const DEFAULT_TESTER_ADDRESS: u16 = 0x0E80;

/// Load the client configuration, or a single-tester default without a file
pub fn load(path: Option<&Path>) -> Result<DiagClientConfig> {
    match path {
        Some(path) => DiagClientConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display())),
        None => Ok(default_config()),
    }
}

fn default_config() -> DiagClientConfig {
    DiagClientConfig {
        conversations: vec![ConversationConfig::new(
            DEFAULT_TESTER,
            DEFAULT_TESTER_ADDRESS,
        )],
        ..DiagClientConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_has_one_tester() {
        let config = load(None).unwrap();
        assert_eq!(config.conversations.len(), 1);
        assert_eq!(config.conversations[0].name, DEFAULT_TESTER);
        assert_eq!(config.conversations[0].source_address, 0x0E80);
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(
            &path,
            r#"{ "conversations": [ { "name": "DiagTesterOne", "source_address": 1 } ] }"#,
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.conversations[0].name, "DiagTesterOne");
    }

    #[test]
    fn test_load_error_names_file() {
        let err = load(Some(Path::new("/nonexistent/client.toml"))).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/client.toml"));
    }
}
