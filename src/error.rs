use derive_more::From;
use thiserror::Error;

use crate::hw::{GattOperation, GattStatus};
use crate::protocol::{RoleId, role_metadata};

/// Errors returned by BLE interaction operations.
#[derive(Debug, Error)]
pub enum InteractionError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no usable BLE adapter is available")]
    AdapterUnavailable,
    #[error("the BLE adapter or peripheral handle has not been initialised")]
    NotInitialized,
    #[error("no device address was supplied")]
    MissingAddress,
    #[error("the driver refused the {operation} request{}", uuid_suffix(.uuid.as_deref()))]
    OperationRejected {
        operation: GattOperation,
        uuid: Option<String>,
    },
    #[error("the {operation} operation failed with status {status}")]
    AsyncOperationFailed {
        operation: GattOperation,
        status: GattStatus,
    },
    #[error("the peripheral is not connected")]
    NotConnected,
    #[error("the connected peripheral is not a supported Bluno device; missing {}", format_missing_roles(.missing))]
    IncompatibleDevice { missing: Vec<RoleId> },
    #[error("the peripheral identified itself as `{identity}`, not a Bluno")]
    UnrecognisedIdentity { identity: String },
    #[error("characteristic `{uuid}` is not part of the discovered service catalog")]
    UnknownCharacteristic { uuid: String },
    #[error("timed out waiting for {waiting_for}")]
    Timeout { waiting_for: &'static str },
    #[error("the event stream closed before {waiting_for}")]
    EventStreamClosed { waiting_for: &'static str },
    #[error("failed while waiting for Ctrl+C")]
    CtrlC { source: std::io::Error },
}

/// Errors returned when parsing fake driver fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake service fixture is empty")]
    EmptyFixture,
    #[error("service records must look like `service_uuid=char_uuid:props,...`")]
    InvalidServiceRecord,
    #[error("characteristic records must look like `uuid:props`")]
    InvalidCharacteristicRecord,
    #[error("unknown characteristic property `{value}`")]
    UnknownProperty { value: String },
    #[error("hex payload length must be even")]
    InvalidHexLength,
    #[error("hex payload contains invalid byte `{value}`")]
    InvalidHexByte { value: String },
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("an --address is required unless --fake is set")]
    MissingAddress,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Errors returned by the vendor command layer.
#[derive(Debug, Error, From)]
pub enum ProtocolError {
    #[error("handshake aborted after `{command}` failed with status {status}")]
    #[from(ignore)]
    HandshakeAborted { command: String, status: GattStatus },
    #[error(transparent)]
    #[from(InteractionError, Box<InteractionError>)]
    Interaction(Box<InteractionError>),
}

fn uuid_suffix(uuid: Option<&str>) -> String {
    uuid.map(|uuid| format!(" on `{uuid}`")).unwrap_or_default()
}

fn format_missing_roles(missing: &[RoleId]) -> String {
    missing
        .iter()
        .map(|role| {
            let metadata = role_metadata(*role);
            format!("{} ({})", metadata.name(), metadata.uuid())
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn incompatible_device_lists_missing_roles() {
        let error = InteractionError::IncompatibleDevice {
            missing: vec![RoleId::Command],
        };
        assert_eq!(
            "the connected peripheral is not a supported Bluno device; missing Bluno command (0000dfb2-0000-1000-8000-00805f9b34fb)",
            error.to_string()
        );
    }

    #[test]
    fn operation_rejected_mentions_uuid_when_known() {
        let error = InteractionError::OperationRejected {
            operation: GattOperation::Write,
            uuid: Some("0000dfb1-0000-1000-8000-00805f9b34fb".to_string()),
        };
        assert_eq!(
            "the driver refused the write request on `0000dfb1-0000-1000-8000-00805f9b34fb`",
            error.to_string()
        );
    }
}
