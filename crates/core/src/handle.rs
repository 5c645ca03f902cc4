//! An open device session.

use crate::adapters::PeqAdapter;
use crate::registry::DeviceModelConfig;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// A connected peripheral routed to its adapter.
///
/// Owns no filter data. The cancellation token fires when the device is
/// closed or lost, ending any correlated wait issued against it.
pub struct DeviceHandle {
    transport: Arc<dyn Transport>,
    manufacturer: String,
    model: String,
    model_config: &'static DeviceModelConfig,
    adapter: Arc<dyn PeqAdapter>,
    cancel: CancellationToken,
    op_lock: Mutex<()>,
}

impl DeviceHandle {
    pub fn new(
        transport: Arc<dyn Transport>,
        manufacturer: impl Into<String>,
        model: impl Into<String>,
        model_config: &'static DeviceModelConfig,
        adapter: Arc<dyn PeqAdapter>,
    ) -> Self {
        Self {
            transport,
            manufacturer: manufacturer.into(),
            model: model.into(),
            model_config,
            adapter,
            cancel: CancellationToken::new(),
            op_lock: Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_id(&self) -> &str {
        self.transport.id()
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn model_config(&self) -> &'static DeviceModelConfig {
        self.model_config
    }

    pub fn adapter(&self) -> &Arc<dyn PeqAdapter> {
        &self.adapter
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Acquire the per-device operation lock.
    ///
    /// Vendor wire formats carry no sequence numbers, so at most one
    /// request/response exchange may be in flight per device.
    pub async fn lock_exclusive(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("transport", &self.transport.id())
            .field("manufacturer", &self.manufacturer)
            .field("model", &self.model)
            .field("adapter", &self.adapter.name())
            .finish()
    }
}
