//! Discover command - vehicle identification broadcast

use std::time::Duration;

use anyhow::{Context, Result};
use diag_client::{DiagnosticManager, VehicleIdentificationFilter};

use crate::output::{OutputContext, VehicleRow};

/// List DoIP entities answering a vehicle identification request
pub fn discover(
    manager: &DiagnosticManager,
    vin: Option<&str>,
    eid: Option<&str>,
    timeout_ms: Option<u64>,
    ctx: &OutputContext,
) -> Result<()> {
    let filter = match (vin, eid) {
        (Some(vin), _) => VehicleIdentificationFilter::Vin(vin.to_string()),
        (None, Some(eid)) => VehicleIdentificationFilter::eid(eid)?,
        (None, None) => VehicleIdentificationFilter::Any,
    };

    let vehicles = manager
        .discover(filter, timeout_ms.map(Duration::from_millis))
        .context("Vehicle discovery failed")?;

    let rows: Vec<VehicleRow> = vehicles
        .iter()
        .map(|v| VehicleRow {
            logical_address: format!("0x{:04X}", v.logical_address),
            vin: if v.vin.is_empty() {
                "-".to_string()
            } else {
                v.vin.clone()
            },
            eid: v.eid_string(),
            gid: v.gid_string(),
            ip_address: v.ip_address.to_string(),
        })
        .collect();

    ctx.print(&rows);
    Ok(())
}
