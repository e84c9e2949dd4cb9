use std::sync::Arc;

use tracing::info;

use super::btleplug_backend::BtleplugDriver;
use super::driver::GattDriver;
use super::fake_backend::{FakeDriverConfig, FakeGattDriver};
use crate::error::InteractionError;

/// Runtime BLE driver selection.
#[derive(Debug)]
pub(crate) enum DriverBackend {
    Real,
    Fake(FakeDriverConfig),
}

/// Builds the injected platform driver for the selected backend.
pub(crate) async fn driver_from_backend(
    backend: DriverBackend,
) -> Result<Arc<dyn GattDriver>, InteractionError> {
    let driver: Arc<dyn GattDriver> = match backend {
        DriverBackend::Real => real_driver().await?,
        DriverBackend::Fake(config) => {
            info!("using fake BLE driver");
            fake_driver(config)
        }
    };

    Ok(driver)
}

/// Creates the `btleplug` driver for the host Bluetooth stack.
///
/// # Errors
///
/// Returns an error when the platform BLE manager cannot be created.
pub async fn real_driver() -> Result<Arc<dyn GattDriver>, InteractionError> {
    Ok(Arc::new(BtleplugDriver::new().await?))
}

/// Creates an in-memory driver from fixture settings.
#[must_use]
pub fn fake_driver(config: FakeDriverConfig) -> Arc<dyn GattDriver> {
    Arc::new(FakeGattDriver::new(config))
}
