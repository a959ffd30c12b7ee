//! Send command - one raw diagnostic request

use anyhow::{bail, Context, Result};
use diag_client::{ConnectResult, DiagnosticManager};

use super::TargetArgs;
use crate::output::{hex_bytes, OutputContext};

/// Connect, send the request, print the response and disconnect
pub fn send(
    manager: &DiagnosticManager,
    args: &TargetArgs,
    payload: &[String],
    ctx: &OutputContext,
) -> Result<()> {
    let request = parse_payload(payload)?;
    let tester = args.conversation(manager)?;

    if tester.connect_to_diag_server(args.target, args.host) == ConnectResult::Failed {
        bail!("Routing activation to 0x{:04X} failed", args.target);
    }

    let response = tester.send_diagnostic_request(&request);
    tester.disconnect_from_diag_server();
    let response = response.context("Diagnostic request failed")?;

    ctx.print_kv(&[
        ("source_address", format!("0x{:04X}", response.source_address)),
        ("target_address", format!("0x{:04X}", response.target_address)),
        ("request", hex_bytes(&request)),
        ("response", hex_bytes(&response.payload)),
    ]);
    Ok(())
}

/// Join the arguments and decode them as hex
fn parse_payload(parts: &[String]) -> Result<Vec<u8>> {
    let digits: String = parts
        .iter()
        .flat_map(|p| p.split_whitespace())
        .map(|p| p.trim_start_matches("0x"))
        .collect();
    let bytes = hex::decode(&digits).with_context(|| format!("Invalid hex payload: {}", digits))?;
    if bytes.is_empty() {
        bail!("Payload is empty");
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_payload() {
        let parts = vec!["10".to_string(), "0x01".to_string()];
        assert_eq!(parse_payload(&parts).unwrap(), vec![0x10, 0x01]);

        let parts = vec!["22 F1 90".to_string()];
        assert_eq!(parse_payload(&parts).unwrap(), vec![0x22, 0xF1, 0x90]);

        assert!(parse_payload(&["1".to_string()]).is_err());
        assert!(parse_payload(&["zz".to_string()]).is_err());
    }
}
