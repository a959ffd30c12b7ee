//! Connect command - routing activation check

use anyhow::{bail, Result};
use diag_client::{ConnectResult, DiagnosticManager};

use super::TargetArgs;
use crate::output::OutputContext;

/// Connect, activate routing and disconnect again
pub fn connect(manager: &DiagnosticManager, args: &TargetArgs, ctx: &OutputContext) -> Result<()> {
    let tester = args.conversation(manager)?;

    let result = tester.connect_to_diag_server(args.target, args.host);
    if result == ConnectResult::Failed {
        ctx.error(&format!(
            "Routing activation to 0x{:04X} failed",
            args.target
        ));
        bail!("Connect failed");
    }
    let disconnect = tester.disconnect_from_diag_server();

    ctx.success(&format!("Routing activated to 0x{:04X}", args.target));
    ctx.print_kv(&[
        ("tester", tester.name().to_string()),
        ("source_address", format!("0x{:04X}", tester.source_address())),
        ("target_address", format!("0x{:04X}", args.target)),
        ("connect", format!("{:?}", result)),
        ("disconnect", format!("{:?}", disconnect)),
    ]);
    Ok(())
}
