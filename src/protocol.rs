use std::collections::HashMap;
use std::sync::LazyLock;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

/// Identity signature reported by the Bluno model-number characteristic.
pub(crate) const BLUNO_MODEL_SIGNATURE: &str = "DF BLUNO";

/// Baud rate configured on the Bluno UART when nothing else is requested.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

pub(crate) const DEVICE_INFORMATION_SERVICE_UUID: &str = "0000180a-0000-1000-8000-00805f9b34fb";
pub(crate) const BLUNO_SERVICE_UUID: &str = "0000dfb0-0000-1000-8000-00805f9b34fb";

/// Characteristic roles required by the Bluno serial protocol.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleId {
    /// Device-information model number, used to identify the peripheral.
    #[strum(to_string = "identity")]
    Identity,
    /// Transparent UART data channel.
    #[strum(to_string = "serial")]
    Serial,
    /// AT command channel.
    #[strum(to_string = "command")]
    Command,
}

/// Descriptive metadata for one role.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct RoleMetadata {
    name: &'static str,
    uuid: &'static str,
}

impl RoleMetadata {
    /// Human-readable role name.
    pub(crate) fn name(self) -> &'static str {
        self.name
    }

    /// Characteristic UUID bound to the role.
    pub(crate) fn uuid(self) -> &'static str {
        self.uuid
    }
}

/// Returns metadata for one role.
pub(crate) fn role_metadata(role: RoleId) -> RoleMetadata {
    match role {
        RoleId::Identity => RoleMetadata {
            name: "Model number",
            uuid: "00002a24-0000-1000-8000-00805f9b34fb",
        },
        RoleId::Serial => RoleMetadata {
            name: "Bluno serial port",
            uuid: "0000dfb1-0000-1000-8000-00805f9b34fb",
        },
        RoleId::Command => RoleMetadata {
            name: "Bluno command",
            uuid: "0000dfb2-0000-1000-8000-00805f9b34fb",
        },
    }
}

/// Returns the role whose characteristic UUID matches, ignoring case.
pub(crate) fn role_for_uuid(uuid: &str) -> Option<RoleId> {
    RoleId::iter().find(|role| role_metadata(*role).uuid().eq_ignore_ascii_case(uuid))
}

/// Human-readable names for well-known services and characteristics, keyed by lowercase UUID.
static ATTRIBUTE_NAMES: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    let mut names = HashMap::from([
        ("00001800-0000-1000-8000-00805f9b34fb", "Generic Access"),
        ("00001801-0000-1000-8000-00805f9b34fb", "Generic Attribute"),
        (DEVICE_INFORMATION_SERVICE_UUID, "Device Information"),
        (BLUNO_SERVICE_UUID, "Bluno serial service"),
        ("00002a00-0000-1000-8000-00805f9b34fb", "Device Name"),
        ("00002a01-0000-1000-8000-00805f9b34fb", "Appearance"),
        ("00002a04-0000-1000-8000-00805f9b34fb", "Peripheral Preferred Connection Parameters"),
        ("00002a05-0000-1000-8000-00805f9b34fb", "Service Changed"),
        ("00002a23-0000-1000-8000-00805f9b34fb", "System ID"),
        ("00002a25-0000-1000-8000-00805f9b34fb", "Serial Number String"),
        ("00002a26-0000-1000-8000-00805f9b34fb", "Firmware Revision String"),
        ("00002a27-0000-1000-8000-00805f9b34fb", "Hardware Revision String"),
        ("00002a28-0000-1000-8000-00805f9b34fb", "Software Revision String"),
        ("00002a29-0000-1000-8000-00805f9b34fb", "Manufacturer Name String"),
        ("00002902-0000-1000-8000-00805f9b34fb", "Client Characteristic Configuration"),
    ]);
    for role in RoleId::iter() {
        let metadata = role_metadata(role);
        names.insert(metadata.uuid(), metadata.name());
    }
    names
});

/// Looks up the display name for a UUID, falling back to `default` when unknown.
pub fn lookup<'a>(uuid: &str, default: &'a str) -> &'a str {
    ATTRIBUTE_NAMES
        .get(uuid.to_ascii_lowercase().as_str())
        .copied()
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("00002a24-0000-1000-8000-00805f9b34fb", Some(RoleId::Identity))]
    #[case("0000DFB1-0000-1000-8000-00805F9B34FB", Some(RoleId::Serial))]
    #[case("0000dfb2-0000-1000-8000-00805f9b34fb", Some(RoleId::Command))]
    #[case("0000dfb0-0000-1000-8000-00805f9b34fb", None)]
    fn role_for_uuid_matches_case_insensitively(
        #[case] uuid: &str,
        #[case] expected: Option<RoleId>,
    ) {
        assert_eq!(expected, role_for_uuid(uuid));
    }

    #[test]
    fn lookup_returns_known_name() {
        assert_eq!(
            "Bluno serial service",
            lookup("0000DFB0-0000-1000-8000-00805F9B34FB", "Unknown service")
        );
        assert_eq!(
            "Bluno command",
            lookup(role_metadata(RoleId::Command).uuid(), "Unknown characteristic")
        );
    }

    #[test]
    fn lookup_falls_back_to_default() {
        assert_eq!(
            "Unknown characteristic",
            lookup("deadbeef-0000-1000-8000-00805f9b34fb", "Unknown characteristic")
        );
    }
}
