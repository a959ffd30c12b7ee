//! Vehicle discovery integration tests

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use diag_client::testing::{announcement, EntityScript, TestEntity};
use diag_client::{
    ConnectResult, DiagnosticManager, DiscoveryError, VehicleIdentificationFilter,
};
use pretty_assertions::assert_eq;

const VIN: &[u8; 17] = b"ABCDEFGH123456789";
const OTHER_VIN: &[u8; 17] = b"WVWZZZ3CZWE123456";

fn start(script: EntityScript) -> (TestEntity, DiagnosticManager) {
    let entity = TestEntity::start(script).unwrap();
    let manager =
        DiagnosticManager::new(entity.client_config(&[("DiagTesterOne", 0x0001)])).unwrap();
    manager.initialize().unwrap();
    (entity, manager)
}

#[test]
fn test_no_responders_yields_empty_list() {
    let (entity, manager) = start(EntityScript::new(0xFA25));

    let vehicles = manager
        .send_vehicle_identification_request(VehicleIdentificationFilter::Any)
        .unwrap();
    assert!(vehicles.is_empty());
    assert_eq!(entity.log().identification_requests, 1);
}

#[test]
fn test_announcement_fields() {
    let (_entity, manager) = start(EntityScript::new(0xFA25).announce(announcement(0xFA25, VIN)));

    let vehicles = manager
        .send_vehicle_identification_request(VehicleIdentificationFilter::Any)
        .unwrap();
    assert_eq!(vehicles.len(), 1);

    let vehicle = &vehicles[0];
    assert_eq!(vehicle.logical_address, 0xFA25);
    assert_eq!(vehicle.vin, "ABCDEFGH123456789");
    assert_eq!(vehicle.eid_string(), "00:02:36:31:00:1c");
    assert_eq!(vehicle.gid_string(), "0a:0b:0c:0d:0e:0f");
    assert_eq!(vehicle.ip_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
}

#[test]
fn test_two_responders_in_arrival_order() {
    let (_entity, manager) = start(
        EntityScript::new(0xFA25)
            .announce(announcement(0xFA25, VIN))
            .announce(announcement(0xFA26, VIN)),
    );

    let addresses: Vec<u16> = manager
        .send_vehicle_identification_request(VehicleIdentificationFilter::Any)
        .unwrap()
        .iter()
        .map(|v| v.logical_address)
        .collect();
    assert_eq!(addresses, vec![0xFA25, 0xFA26]);
}

#[test]
fn test_duplicate_logical_address_is_dropped() {
    let (_entity, manager) = start(
        EntityScript::new(0xFA25)
            .announce(announcement(0xFA25, VIN))
            .announce(announcement(0xFA26, VIN))
            .duplicate_announcement(),
    );

    let vehicles = manager
        .send_vehicle_identification_request(VehicleIdentificationFilter::Any)
        .unwrap();
    assert_eq!(vehicles.len(), 2);
}

#[test]
fn test_vin_preselection() {
    let (_entity, manager) = start(
        EntityScript::new(0xFA25)
            .announce(announcement(0xFA25, VIN))
            .announce(announcement(0x0010, OTHER_VIN)),
    );

    let vehicles = manager
        .send_vehicle_identification_request(VehicleIdentificationFilter::Vin(
            "WVWZZZ3CZWE123456".into(),
        ))
        .unwrap();
    assert_eq!(vehicles.len(), 1);
    assert_eq!(vehicles[0].logical_address, 0x0010);
}

#[test]
fn test_eid_preselection() {
    let (_entity, manager) = start(EntityScript::new(0xFA25).announce(announcement(0xFA25, VIN)));

    let matching = VehicleIdentificationFilter::eid("00:02:36:31:00:1c").unwrap();
    assert_eq!(manager.discover(matching, None).unwrap().len(), 1);

    let other = VehicleIdentificationFilter::eid("00:00:00:00:00:01").unwrap();
    assert!(manager.discover(other, None).unwrap().is_empty());
}

#[test]
fn test_invalid_vin_filter() {
    let (entity, manager) = start(EntityScript::new(0xFA25));

    let result =
        manager.send_vehicle_identification_request(VehicleIdentificationFilter::Vin("ABC".into()));
    assert!(matches!(result, Err(DiscoveryError::InvalidFilter(_))));
    assert_eq!(entity.log().identification_requests, 0);
}

#[test]
fn test_server_list_is_cached() {
    let (_entity, manager) = start(EntityScript::new(0xFA25).announce(announcement(0xFA25, VIN)));

    assert!(manager.diagnostic_server_list().is_empty());
    let vehicles = manager
        .discover(VehicleIdentificationFilter::Any, Some(Duration::from_millis(150)))
        .unwrap();
    assert_eq!(manager.diagnostic_server_list(), vehicles);
}

#[test]
fn test_discover_then_connect() {
    let (_entity, manager) = start(EntityScript::new(0xFA25).announce(announcement(0xFA25, VIN)));

    let vehicles = manager
        .send_vehicle_identification_request(VehicleIdentificationFilter::Any)
        .unwrap();
    let target = &vehicles[0];

    let tester = manager.conversation("DiagTesterOne").unwrap();
    assert_eq!(
        tester.connect_to_diag_server(target.logical_address, Some(target.ip_address)),
        ConnectResult::Success
    );
}

#[test]
fn test_discovery_requires_running_manager() {
    let entity = TestEntity::start(EntityScript::new(0xFA25)).unwrap();
    let manager =
        DiagnosticManager::new(entity.client_config(&[("DiagTesterOne", 0x0001)])).unwrap();

    assert!(matches!(
        manager.send_vehicle_identification_request(VehicleIdentificationFilter::Any),
        Err(DiscoveryError::Cancelled)
    ));
}
