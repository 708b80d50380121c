//! Tests for the GATT helper registry

use super::*;

const HANDLE: ConnectionHandle = 0x0040;

#[test]
fn test_setup_request_without_link() {
    let mut registry = GattHelperRegistry::new();

    let err = registry
        .setup_request(ClientId(1), HANDLE, true, false)
        .unwrap_err();
    assert!(matches!(err, DaemonError::NotConnected(HANDLE)));
    assert!(!registry.contains(HANDLE));
}

#[test]
fn test_busy_preserves_active_owner() {
    let mut registry = GattHelperRegistry::new();
    let c1 = ClientId(1);
    let c2 = ClientId(2);

    registry.setup_request(c1, HANDLE, true, true).unwrap();
    assert_eq!(registry.active_owner(HANDLE), Some(c1));

    let err = registry.setup_request(c2, HANDLE, true, true).unwrap_err();
    assert!(matches!(err, DaemonError::Busy(HANDLE)));
    assert_eq!(err.status().value(), 0x7F);
    assert_eq!(registry.active_owner(HANDLE), Some(c1));
    assert!(!registry.get(HANDLE).unwrap().has_user(c2));
}

#[test]
fn test_untracked_request_bypasses_busy() {
    let mut registry = GattHelperRegistry::new();
    let c1 = ClientId(1);
    let c2 = ClientId(2);

    registry.setup_request(c1, HANDLE, true, true).unwrap();
    registry.setup_request(c2, HANDLE, false, true).unwrap();

    let helper = registry.get(HANDLE).unwrap();
    assert_eq!(helper.active_owner(), Some(c1));
    assert!(helper.has_user(c2));
}

#[test]
fn test_complete_active_allows_next_query() {
    let mut registry = GattHelperRegistry::new();

    registry.setup_request(ClientId(1), HANDLE, true, true).unwrap();
    assert_eq!(registry.complete_active(HANDLE), Some(ClientId(1)));
    assert_eq!(registry.active_owner(HANDLE), None);

    registry.setup_request(ClientId(2), HANDLE, true, true).unwrap();
    assert_eq!(registry.active_owner(HANDLE), Some(ClientId(2)));
}

#[test]
fn test_long_value_reassembly() {
    let mut registry = GattHelperRegistry::new();
    registry.setup_request(ClientId(1), HANDLE, true, true).unwrap();

    let a = [0x01, 0x02, 0x03, 0x04];
    let b = [0x05, 0x06, 0x07, 0x08];
    registry
        .append_long_fragment(HANDLE, LongAttributeKind::CharacteristicValue, 0x0021, 0, &a)
        .unwrap();
    registry
        .append_long_fragment(HANDLE, LongAttributeKind::CharacteristicValue, 0x0021, 4, &b)
        .unwrap();
    assert_eq!(registry.get(HANDLE).unwrap().reassembly().len(), 8);

    let value = registry.take_long_value(HANDLE).unwrap();
    assert_eq!(value.kind, LongAttributeKind::CharacteristicValue);
    assert_eq!(value.attribute_handle, 0x0021);
    assert_eq!(value.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);

    // Length resets after delivery
    assert!(registry.get(HANDLE).unwrap().reassembly().is_empty());
    assert!(registry.take_long_value(HANDLE).is_none());
}

#[test]
fn test_oversized_fragment_is_rejected() {
    let mut registry = GattHelperRegistry::new();
    registry.setup_request(ClientId(1), HANDLE, true, true).unwrap();

    let chunk = [0xAA; 22];
    let err = registry
        .append_long_fragment(HANDLE, LongAttributeKind::Descriptor, 0x0030, 500, &chunk)
        .unwrap_err();
    assert!(matches!(err, DaemonError::AttributeTooLong(522)));
    assert!(registry.get(HANDLE).unwrap().reassembly().is_empty());

    // A fragment ending exactly at the limit fits
    registry
        .append_long_fragment(HANDLE, LongAttributeKind::Descriptor, 0x0030, 490, &chunk)
        .unwrap();
    assert_eq!(
        registry.get(HANDLE).unwrap().reassembly().len(),
        ATT_MAX_LONG_ATTRIBUTE_SIZE
    );
}

#[test]
fn test_fragment_without_helper() {
    let mut registry = GattHelperRegistry::new();
    let err = registry
        .append_long_fragment(HANDLE, LongAttributeKind::Descriptor, 1, 0, &[1])
        .unwrap_err();
    assert!(matches!(err, DaemonError::UnknownResource { .. }));
}

#[test]
fn test_release_client_reports_last_user() {
    let mut registry = GattHelperRegistry::new();
    let c1 = ClientId(1);
    let c2 = ClientId(2);

    registry.setup_request(c1, HANDLE, true, true).unwrap();
    registry.setup_request(c2, HANDLE, false, true).unwrap();

    assert_eq!(registry.release_client(c1, HANDLE), Some(false));
    // Active ownership goes with the client
    assert_eq!(registry.active_owner(HANDLE), None);
    assert_eq!(registry.release_client(c2, HANDLE), Some(true));
    assert_eq!(registry.release_client(c2, 0x0099), None);
}

#[test]
fn test_teardown_removes_helper() {
    let mut registry = GattHelperRegistry::new();
    registry.setup_request(ClientId(1), HANDLE, true, true).unwrap();
    registry.setup_request(ClientId(2), HANDLE, false, true).unwrap();

    let helper = registry.teardown(HANDLE).unwrap();
    assert_eq!(helper.users().collect::<Vec<_>>(), vec![ClientId(1), ClientId(2)]);
    assert!(registry.is_empty());
    assert!(registry.teardown(HANDLE).is_none());
}
