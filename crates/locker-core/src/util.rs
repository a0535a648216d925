//! Utility functions for locker-core.

use btleplug::platform::PeripheralId;

use locker_types::LinkHandle;

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms, they may be
/// MAC addresses or D-Bus paths. This extracts the useful identifier.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    strip_debug_wrapper(&format!("{:?}", id)).to_string()
}

/// The link handle a BLE transport issues for a peripheral.
pub fn link_for_peripheral(id: &PeripheralId) -> LinkHandle {
    LinkHandle::new(format_peripheral_id(id))
}

fn strip_debug_wrapper(debug: &str) -> &str {
    debug
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
}

/// The locker id carried in an advertised local name.
///
/// Lockers advertise their id as the local name; some stacks pad it with
/// whitespace or NUL bytes.
pub fn locker_id_from_local_name(name: &str) -> &str {
    name.trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
}
