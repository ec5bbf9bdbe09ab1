//! Tests for apphost-bundle lib module

use apphost_bundle::VERSION;

#[test]
fn test_version() {
    assert!(VERSION.contains('.'), "VERSION should contain a dot");
}

#[test]
fn test_is_bundled() {
    // The test harness is a plain executable
    assert!(!apphost_bundle::is_bundled());
    assert!(apphost_bundle::read_current_manifest().is_err());
}
