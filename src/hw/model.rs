use std::fmt::{self, Display, Formatter};
use std::ops::BitOr;

use btleplug::api::CharPropFlags;
use serde::{Serialize, Serializer};
use strum_macros::Display as StrumDisplay;

use crate::utils::format_hex;

/// Connection lifecycle state of the managed peripheral.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, StrumDisplay, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    #[strum(to_string = "disconnected")]
    Disconnected,
    #[strum(to_string = "connecting")]
    Connecting,
    #[strum(to_string = "connected")]
    Connected,
}

/// GATT attribute permission bits as reported by the platform stack.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct AttributePermissions(u16);

impl AttributePermissions {
    pub const READ: Self = Self(0x0001);
    pub const READ_ENCRYPTED: Self = Self(0x0002);
    pub const READ_ENCRYPTED_MITM: Self = Self(0x0004);
    pub const WRITE: Self = Self(0x0010);
    pub const WRITE_ENCRYPTED: Self = Self(0x0020);
    pub const WRITE_ENCRYPTED_MITM: Self = Self(0x0040);
    pub const WRITE_SIGNED: Self = Self(0x0080);
    pub const WRITE_SIGNED_MITM: Self = Self(0x0100);

    /// Slot order and glyphs used by [`format_permissions`].
    const SLOTS: [(Self, char); 8] = [
        (Self::READ, 'r'),
        (Self::READ_ENCRYPTED, 'e'),
        (Self::READ_ENCRYPTED_MITM, 'm'),
        (Self::WRITE, 'W'),
        (Self::WRITE_ENCRYPTED, 'E'),
        (Self::WRITE_ENCRYPTED_MITM, 'M'),
        (Self::WRITE_SIGNED, 'S'),
        (Self::WRITE_SIGNED_MITM, 'X'),
    ];

    /// Creates a permission set from raw platform bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns the empty permission set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns whether every bit in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AttributePermissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Renders permissions as a fixed `<remWEMSX>` indicator with a space for each clear bit.
#[must_use]
pub fn format_permissions(permissions: AttributePermissions) -> String {
    let mut rendered = String::with_capacity(AttributePermissions::SLOTS.len() + 2);
    rendered.push('<');
    for (flag, glyph) in AttributePermissions::SLOTS {
        rendered.push(if permissions.contains(flag) { glyph } else { ' ' });
    }
    rendered.push('>');
    rendered
}

/// How a characteristic write is acknowledged by the peripheral.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, StrumDisplay, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    #[default]
    #[strum(to_string = "with_response")]
    WithResponse,
    #[strum(to_string = "without_response")]
    WithoutResponse,
    #[strum(to_string = "signed")]
    Signed,
}

/// Identifies one characteristic inside the service catalog.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct CharacteristicRef {
    service_uuid: String,
    uuid: String,
}

impl CharacteristicRef {
    /// Creates a reference from service and characteristic UUIDs.
    #[must_use]
    pub fn new(service_uuid: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            service_uuid: service_uuid.into().to_ascii_lowercase(),
            uuid: uuid.into().to_ascii_lowercase(),
        }
    }

    #[must_use]
    pub fn service_uuid(&self) -> &str {
        &self.service_uuid
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl Display for CharacteristicRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_uuid, self.uuid)
    }
}

/// A characteristic in the discovered service catalog.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct GattCharacteristic {
    service_uuid: String,
    uuid: String,
    #[serde(serialize_with = "serialize_value")]
    value: Vec<u8>,
    #[serde(serialize_with = "serialize_permissions")]
    permissions: AttributePermissions,
    #[serde(serialize_with = "serialize_properties")]
    properties: CharPropFlags,
    write_kind: WriteKind,
}

impl GattCharacteristic {
    /// Creates a characteristic description with an empty value.
    #[must_use]
    pub fn new(
        service_uuid: impl Into<String>,
        uuid: impl Into<String>,
        properties: CharPropFlags,
    ) -> Self {
        let write_kind = if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
            && !properties.contains(CharPropFlags::WRITE)
        {
            WriteKind::WithoutResponse
        } else {
            WriteKind::WithResponse
        };
        Self {
            service_uuid: service_uuid.into().to_ascii_lowercase(),
            uuid: uuid.into().to_ascii_lowercase(),
            value: Vec::new(),
            permissions: AttributePermissions::empty(),
            properties,
            write_kind,
        }
    }

    #[must_use]
    pub fn with_permissions(mut self, permissions: AttributePermissions) -> Self {
        self.permissions = permissions;
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    #[must_use]
    pub fn with_write_kind(mut self, write_kind: WriteKind) -> Self {
        self.write_kind = write_kind;
        self
    }

    #[must_use]
    pub fn reference(&self) -> CharacteristicRef {
        CharacteristicRef {
            service_uuid: self.service_uuid.clone(),
            uuid: self.uuid.clone(),
        }
    }

    #[must_use]
    pub fn service_uuid(&self) -> &str {
        &self.service_uuid
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub(crate) fn set_value(&mut self, value: Vec<u8>) {
        self.value = value;
    }

    #[must_use]
    pub fn permissions(&self) -> AttributePermissions {
        self.permissions
    }

    #[must_use]
    pub fn properties(&self) -> CharPropFlags {
        self.properties
    }

    #[must_use]
    pub fn write_kind(&self) -> WriteKind {
        self.write_kind
    }

    pub(crate) fn set_write_kind(&mut self, write_kind: WriteKind) {
        self.write_kind = write_kind;
    }

    /// Returns whether the characteristic can be read.
    #[must_use]
    pub fn supports_read(&self) -> bool {
        self.properties.contains(CharPropFlags::READ)
    }

    /// Returns whether the characteristic accepts writes of either kind.
    #[must_use]
    pub fn supports_write(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
    }

    /// Returns whether the characteristic can push notifications or indications.
    #[must_use]
    pub fn supports_notify(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
    }

    /// Lowercase property labels, `none` when no property bit is set.
    #[must_use]
    pub fn property_labels(&self) -> Vec<String> {
        property_labels(self.properties)
    }
}

/// A GATT service with its characteristics, in discovery order.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct GattService {
    uuid: String,
    characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Creates a service description.
    #[must_use]
    pub fn new(uuid: impl Into<String>, characteristics: Vec<GattCharacteristic>) -> Self {
        Self {
            uuid: uuid.into().to_ascii_lowercase(),
            characteristics,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn characteristics(&self) -> &[GattCharacteristic] {
        &self.characteristics
    }

    pub(crate) fn characteristics_mut(&mut self) -> &mut [GattCharacteristic] {
        &mut self.characteristics
    }
}

/// Characteristic data carried by `DataAvailable` and `WriteComplete` events.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CharacteristicPayload {
    uuid: String,
    #[serde(serialize_with = "serialize_value")]
    value: Vec<u8>,
    debug_text: String,
}

impl CharacteristicPayload {
    /// Builds a payload from a characteristic snapshot.
    #[must_use]
    pub fn from_characteristic(characteristic: &GattCharacteristic) -> Self {
        Self {
            uuid: characteristic.uuid().to_string(),
            value: characteristic.value().to_vec(),
            debug_text: debug_text(characteristic.value(), characteristic.permissions()),
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// The value rendered as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }

    /// Opaque diagnostic rendering of value and permissions.
    #[must_use]
    pub fn debug_text(&self) -> &str {
        &self.debug_text
    }
}

/// Renders `value` as text, then hex, then the permission indicator.
pub(crate) fn debug_text(value: &[u8], permissions: AttributePermissions) -> String {
    format!(
        "{}\n{}::{}",
        String::from_utf8_lossy(value),
        format_hex(value),
        format_permissions(permissions)
    )
}

pub(crate) fn property_labels(flags: CharPropFlags) -> Vec<String> {
    let labels: Vec<String> = flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect();
    if labels.is_empty() {
        vec!["none".to_string()]
    } else {
        labels
    }
}

fn serialize_value<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_hex(value))
}

fn serialize_permissions<S: Serializer>(
    permissions: &AttributePermissions,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_permissions(*permissions))
}

fn serialize_properties<S: Serializer>(
    properties: &CharPropFlags,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(property_labels(*properties))
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn read_and_write_fill_first_and_fourth_slots() {
        let rendered =
            format_permissions(AttributePermissions::READ | AttributePermissions::WRITE);
        let slots: Vec<char> = rendered.trim_start_matches('<').trim_end_matches('>').chars().collect();

        assert_eq!(8, slots.len());
        for (index, slot) in slots.iter().enumerate() {
            if index == 0 || index == 3 {
                assert_ne!(' ', *slot, "slot {index} should be set");
            } else {
                assert_eq!(' ', *slot, "slot {index} should be clear");
            }
        }
    }

    #[rstest]
    #[case::empty(AttributePermissions::empty(), "<        >")]
    #[case::encrypted_read(AttributePermissions::READ_ENCRYPTED, "< e      >")]
    #[case::signed_mitm(AttributePermissions::WRITE_SIGNED_MITM, "<       X>")]
    #[case::all(AttributePermissions::from_bits(0x01F7), "<remWEMSX>")]
    fn format_permissions_uses_fixed_slot_order(
        #[case] permissions: AttributePermissions,
        #[case] expected: &str,
    ) {
        assert_eq!(expected, format_permissions(permissions));
    }

    #[test]
    fn debug_text_combines_text_hex_and_permissions() {
        let characteristic = GattCharacteristic::new(
            "0000180a-0000-1000-8000-00805f9b34fb",
            "00002a24-0000-1000-8000-00805f9b34fb",
            CharPropFlags::READ,
        )
        .with_permissions(AttributePermissions::READ)
        .with_value(b"DF".to_vec());

        let payload = CharacteristicPayload::from_characteristic(&characteristic);
        assert_snapshot!(payload.debug_text(), @r"
        DF
        44 46::<r       >
        ");
    }

    #[rstest]
    #[case(CharPropFlags::READ, true, false, false)]
    #[case(CharPropFlags::WRITE_WITHOUT_RESPONSE, false, true, false)]
    #[case(CharPropFlags::INDICATE, false, false, true)]
    #[case(CharPropFlags::READ | CharPropFlags::WRITE | CharPropFlags::NOTIFY, true, true, true)]
    #[case(CharPropFlags::empty(), false, false, false)]
    fn capability_checks_require_the_flag(
        #[case] properties: CharPropFlags,
        #[case] readable: bool,
        #[case] writable: bool,
        #[case] notifiable: bool,
    ) {
        let characteristic = GattCharacteristic::new("a", "b", properties);
        assert_eq!(readable, characteristic.supports_read());
        assert_eq!(writable, characteristic.supports_write());
        assert_eq!(notifiable, characteristic.supports_notify());
    }

    #[test]
    fn write_without_response_only_defaults_write_kind() {
        let characteristic =
            GattCharacteristic::new("a", "b", CharPropFlags::WRITE_WITHOUT_RESPONSE);
        assert_eq!(WriteKind::WithoutResponse, characteristic.write_kind());
    }
}
