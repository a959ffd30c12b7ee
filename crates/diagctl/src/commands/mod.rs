//! Command implementations for diagctl

pub mod connect;
pub mod discover;
pub mod send;

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use diag_client::{Conversation, DiagnosticManager, LogicalAddress};

pub use connect::connect;
pub use discover::discover;
pub use send::send;

/// Which tester talks to which server
#[derive(Debug, Args)]
pub struct TargetArgs {
    /// Conversation name from the config (default: the first one)
    #[arg(short, long)]
    pub tester: Option<String>,

    /// Server logical address (e.g. 0xFA25)
    #[arg(long, value_parser = parse_address)]
    pub target: LogicalAddress,

    /// Server IP address, overrides the configured mapping
    #[arg(long)]
    pub host: Option<IpAddr>,
}

impl TargetArgs {
    pub fn conversation(&self, manager: &DiagnosticManager) -> Result<Arc<Conversation>> {
        let name = match &self.tester {
            Some(name) => name.clone(),
            None => manager
                .conversation_names()
                .into_iter()
                .next()
                .context("No conversation configured")?,
        };
        manager
            .conversation(&name)
            .with_context(|| format!("Unknown tester: {}", name))
    }
}

/// Parse a logical address given as `0xFA25`, `FA25h` or decimal
pub fn parse_address(text: &str) -> Result<LogicalAddress, String> {
    let text = text.trim();
    let parsed = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .or_else(|| text.strip_suffix('h'))
    {
        u16::from_str_radix(hex, 16)
    } else {
        text.parse::<u16>()
    };
    parsed.map_err(|e| format!("invalid logical address {:?}: {}", text, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0xFA25"), Ok(0xFA25));
        assert_eq!(parse_address("FA25h"), Ok(0xFA25));
        assert_eq!(parse_address("1"), Ok(1));
        assert!(parse_address("0x1FFFF").is_err());
        assert!(parse_address("tester").is_err());
    }
}
