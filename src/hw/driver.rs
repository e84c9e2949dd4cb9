use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use strum_macros::Display as StrumDisplay;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use super::model::{CharacteristicRef, GattCharacteristic, GattService};
use crate::error::InteractionError;

/// Result status reported by a driver callback.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct GattStatus(u8);

impl GattStatus {
    pub const SUCCESS: Self = Self(0x00);
    pub const READ_NOT_PERMITTED: Self = Self(0x02);
    pub const WRITE_NOT_PERMITTED: Self = Self(0x03);
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x05);
    pub const FAILURE: Self = Self(0x85);

    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        Self(code)
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl Display for GattStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let label = match *self {
            Self::SUCCESS => "success",
            Self::READ_NOT_PERMITTED => "read not permitted",
            Self::WRITE_NOT_PERMITTED => "write not permitted",
            Self::INSUFFICIENT_AUTHENTICATION => "insufficient authentication",
            _ => "failure",
        };
        write!(f, "0x{:02X} ({label})", self.0)
    }
}

impl Serialize for GattStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// GATT operations named in errors and logs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, StrumDisplay)]
pub enum GattOperation {
    #[strum(to_string = "connect")]
    Connect,
    #[strum(to_string = "reconnect")]
    Reconnect,
    #[strum(to_string = "service discovery")]
    DiscoverServices,
    #[strum(to_string = "read")]
    Read,
    #[strum(to_string = "write")]
    Write,
    #[strum(to_string = "notification toggle")]
    SetNotification,
}

/// Outcome of one service discovery attempt.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum DiscoveryStatus {
    /// The catalog was replaced.
    #[display("complete")]
    Complete,
    /// The driver refused to start discovery.
    #[display("refused by the driver")]
    Rejected,
    /// The driver finished discovery with a non-success status.
    #[display("failed with status {_0}")]
    Failed(GattStatus),
}

impl DiscoveryStatus {
    #[must_use]
    pub const fn is_complete(self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Converts a failed outcome into the matching error.
    ///
    /// # Errors
    ///
    /// Returns `OperationRejected` or `AsyncOperationFailed` for the service discovery operation.
    pub fn into_result(self) -> Result<(), InteractionError> {
        match self {
            Self::Complete => Ok(()),
            Self::Rejected => Err(InteractionError::OperationRejected {
                operation: GattOperation::DiscoverServices,
                uuid: None,
            }),
            Self::Failed(status) => Err(InteractionError::AsyncOperationFailed {
                operation: GattOperation::DiscoverServices,
                status,
            }),
        }
    }
}

/// Link state reported by the platform stack.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Raw callbacks raised by a peripheral driver.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DriverCallback {
    ConnectionStateChange {
        status: GattStatus,
        new_state: LinkState,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: GattCharacteristic,
        status: GattStatus,
    },
    CharacteristicChanged {
        characteristic: GattCharacteristic,
    },
    CharacteristicWrite {
        characteristic: GattCharacteristic,
        status: GattStatus,
    },
}

/// Generation number of one opened peripheral handle.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, derive_more::Display)]
#[display("handle#{_0}")]
pub struct HandleId(pub(crate) u64);

/// Callback plus the handle that produced it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TaggedCallback {
    pub handle: HandleId,
    pub callback: DriverCallback,
}

/// Sink a driver uses to deliver callbacks for one handle.
#[derive(Debug, Clone)]
pub struct CallbackSink {
    handle: HandleId,
    sender: UnboundedSender<TaggedCallback>,
}

impl CallbackSink {
    pub(crate) fn new(handle: HandleId, sender: UnboundedSender<TaggedCallback>) -> Self {
        Self { handle, sender }
    }

    /// Handle generation this sink reports for.
    #[must_use]
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// Delivers one callback; silently dropped once the manager is gone.
    pub fn emit(&self, callback: DriverCallback) {
        if self
            .sender
            .send(TaggedCallback {
                handle: self.handle,
                callback,
            })
            .is_err()
        {
            trace!(handle = %self.handle, "callback receiver closed; dropping callback");
        }
    }
}

/// Entry point to the platform BLE stack.
#[async_trait]
pub trait GattDriver: Send + Sync + Debug {
    /// Acquires the adapter, failing with `AdapterUnavailable` when Bluetooth is missing or off.
    async fn adapter(&self) -> Result<Arc<dyn GattAdapter>, InteractionError>;
}

/// An available BLE adapter.
pub trait GattAdapter: Send + Sync + Debug {
    /// Starts connecting to `address`; the outcome is reported through `sink`.
    fn open_connection(
        &self,
        address: &str,
        sink: CallbackSink,
    ) -> Result<Box<dyn PeripheralHandle>, InteractionError>;
}

/// A low-level connection to one peripheral.
///
/// Every request returns whether it was accepted for dispatch; completion arrives later
/// through the handle's [`CallbackSink`].
pub trait PeripheralHandle: Send + Sync + Debug {
    fn reconnect(&self) -> bool;
    fn disconnect(&self);
    fn close(&self);
    fn discover_services(&self) -> bool;
    fn read_characteristic(&self, characteristic: &CharacteristicRef) -> bool;
    fn write_characteristic(&self, characteristic: &GattCharacteristic) -> bool;
    fn set_notification(&self, characteristic: &CharacteristicRef, enabled: bool) -> bool;
    fn services(&self) -> Vec<GattService>;
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(GattStatus::SUCCESS, "0x00 (success)")]
    #[case(GattStatus::WRITE_NOT_PERMITTED, "0x03 (write not permitted)")]
    #[case(GattStatus::from_code(0x85), "0x85 (failure)")]
    fn status_renders_code_and_label(#[case] status: GattStatus, #[case] expected: &str) {
        assert_eq!(expected, status.to_string());
    }

    #[test]
    fn discovery_failures_map_to_their_errors() {
        assert_matches!(
            DiscoveryStatus::Rejected.into_result(),
            Err(InteractionError::OperationRejected {
                operation: GattOperation::DiscoverServices,
                uuid: None,
            })
        );
        assert_matches!(
            DiscoveryStatus::Failed(GattStatus::FAILURE).into_result(),
            Err(InteractionError::AsyncOperationFailed {
                operation: GattOperation::DiscoverServices,
                status: GattStatus::FAILURE,
            })
        );
        assert!(DiscoveryStatus::Complete.into_result().is_ok());
    }

    #[test]
    fn sink_tags_callbacks_with_its_handle() {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let sink = CallbackSink::new(HandleId(7), sender);

        sink.emit(DriverCallback::ServicesDiscovered {
            status: GattStatus::SUCCESS,
        });

        let tagged = receiver.try_recv().expect("callback should be queued");
        assert_eq!(HandleId(7), tagged.handle);
    }
}
