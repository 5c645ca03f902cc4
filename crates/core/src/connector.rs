//! Device connector: owns the table of open devices and fronts every adapter
//! call with a liveness check and the per-device operation lock.

use crate::comm::ErrorClass;
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterSet};
use crate::handle::DeviceHandle;
use crate::registry::{get_model_config, SlotInfo};
use crate::router::AdapterRegistry;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Notifications for the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device went away or dropped off the bus after saving. Sent once per
    /// handle.
    Disconnected {
        transport_id: String,
        manufacturer: String,
        model: String,
    },
}

/// Tracks open devices and exposes the adapter contract uniformly.
pub struct Connector {
    registry: AdapterRegistry,
    devices: Mutex<Vec<Arc<DeviceHandle>>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl Connector {
    pub fn new(registry: AdapterRegistry) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            devices: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Open a device and route it to its adapter.
    ///
    /// If the transport already backs a live handle, that handle is returned
    /// and nothing is opened twice.
    pub async fn connect(
        &self,
        transport: Arc<dyn Transport>,
        manufacturer: &str,
        model: &str,
    ) -> Result<Arc<DeviceHandle>> {
        if let Some(existing) = self.find_live(transport.id()) {
            debug!(transport = transport.id(), "Reusing open device");
            return Ok(existing);
        }

        let adapter = self
            .registry
            .resolve_adapter(manufacturer, model)
            .ok_or_else(|| Error::UnsupportedDevice {
                manufacturer: manufacturer.to_string(),
                model: model.to_string(),
            })?;
        if adapter.transport_kind() != transport.kind() {
            warn!(
                transport = transport.id(),
                adapter = adapter.name(),
                expected = ?adapter.transport_kind(),
                actual = ?transport.kind(),
                "Adapter cannot run over this transport"
            );
            return Err(Error::UnsupportedDevice {
                manufacturer: manufacturer.to_string(),
                model: model.to_string(),
            });
        }
        let model_config = get_model_config(manufacturer, model);
        let handle = Arc::new(DeviceHandle::new(
            transport,
            manufacturer,
            model,
            model_config,
            adapter,
        ));

        handle.adapter().connect(&handle).await?;
        let handle = self.register_open_device(handle);
        info!(
            transport = handle.transport_id(),
            manufacturer,
            model,
            adapter = handle.adapter().name(),
            "Device connected"
        );
        Ok(handle)
    }

    /// Record an open handle. A live handle already registered for the same
    /// transport wins and is returned instead.
    pub fn register_open_device(&self, handle: Arc<DeviceHandle>) -> Arc<DeviceHandle> {
        let mut devices = self.devices.lock();
        if let Some(existing) = devices
            .iter()
            .find(|d| d.transport_id() == handle.transport_id() && Self::is_live(d))
        {
            return Arc::clone(existing);
        }
        devices.retain(|d| d.transport_id() != handle.transport_id());
        devices.push(Arc::clone(&handle));
        handle
    }

    /// Registered, not torn down, and the transport is still open.
    pub fn is_still_connected(&self, handle: &DeviceHandle) -> bool {
        self.devices
            .lock()
            .iter()
            .any(|d| std::ptr::eq(Arc::as_ptr(d), handle))
            && Self::is_live(handle)
    }

    /// Most recently connected live device.
    pub fn get_device_connected(&self) -> Option<Arc<DeviceHandle>> {
        self.devices
            .lock()
            .iter()
            .rev()
            .find(|d| Self::is_live(d))
            .cloned()
    }

    pub fn get_available_slots(&self, handle: &DeviceHandle) -> &'static [SlotInfo] {
        handle.model_config().available_slots
    }

    /// Close a device on the caller's request. No event is sent.
    pub async fn close_device(&self, handle: &DeviceHandle) -> Result<()> {
        if self.teardown(handle) {
            info!(transport = handle.transport_id(), "Device closed");
        }
        handle.transport().close().await
    }

    /// Tear down a device that went away and notify subscribers once.
    pub async fn disconnect_device(&self, handle: &DeviceHandle) {
        if !self.teardown(handle) {
            return;
        }
        if let Err(e) = handle.transport().close().await {
            debug!(error = %e, "Close after disconnect failed");
        }
        warn!(
            transport = handle.transport_id(),
            model = handle.model(),
            "Device disconnected"
        );
        let _ = self.events.send(DeviceEvent::Disconnected {
            transport_id: handle.transport_id().to_string(),
            manufacturer: handle.manufacturer().to_string(),
            model: handle.model().to_string(),
        });
    }

    /// Host platform reported the transport gone.
    pub async fn on_transport_lost(&self, transport_id: &str) {
        let handle = self
            .devices
            .lock()
            .iter()
            .find(|d| d.transport_id() == transport_id)
            .cloned();
        if let Some(handle) = handle {
            self.disconnect_device(&handle).await;
        }
    }

    pub async fn get_current_slot(&self, handle: &DeviceHandle) -> Result<i32> {
        self.ensure_connected(handle).await?;
        let result = {
            let _guard = handle.lock_exclusive().await;
            handle.adapter().get_current_slot(handle).await
        };
        self.settle(handle, result).await
    }

    /// Read a filter bank. `slot` is a router slot.
    pub async fn pull_from_device(&self, handle: &DeviceHandle, slot: i32) -> Result<FilterSet> {
        self.ensure_connected(handle).await?;
        let vendor_slot = handle.model_config().to_vendor_slot(slot);
        let result = {
            let _guard = handle.lock_exclusive().await;
            handle.adapter().pull_from_device(handle, vendor_slot).await
        };
        if let Ok(set) = &result {
            debug!(slot, bands = set.len(), global_gain = set.global_gain, "Pulled");
        }
        self.settle(handle, result).await
    }

    /// Write a filter bank. Returns `true` when the device dropped off after
    /// saving; the handle has then already been torn down.
    ///
    /// Sentinel slots are rejected: writing "PEQ off" would overwrite the
    /// vendor's disabled preset.
    pub async fn push_to_device(
        &self,
        handle: &DeviceHandle,
        slot: i32,
        global_gain: f64,
        filters: &[Filter],
    ) -> Result<bool> {
        if slot < 0 {
            return Err(Error::OutOfRange {
                field: "slot",
                value: f64::from(slot),
                min: 0.0,
                max: f64::from(i32::MAX),
            });
        }
        self.ensure_connected(handle).await?;
        let config = handle.model_config();
        if config.first_writable_slot >= 0 && !config.is_writable_slot(slot) {
            debug!(slot, "Writing a slot outside the writable range");
        }
        let result = {
            let _guard = handle.lock_exclusive().await;
            handle
                .adapter()
                .push_to_device(handle, slot, global_gain, filters)
                .await
        };
        let reconnect = self.settle(handle, result).await?;
        if reconnect {
            info!(
                transport = handle.transport_id(),
                "Device reboots after save"
            );
            self.disconnect_device(handle).await;
        }
        Ok(reconnect)
    }

    pub async fn enable_peq(&self, handle: &DeviceHandle, enabled: bool, slot: i32) -> Result<()> {
        self.ensure_connected(handle).await?;
        let vendor_slot = handle.model_config().to_vendor_slot(slot);
        let result = {
            let _guard = handle.lock_exclusive().await;
            handle.adapter().enable_peq(handle, enabled, vendor_slot).await
        };
        self.settle(handle, result).await
    }

    fn is_live(handle: &DeviceHandle) -> bool {
        !handle.is_cancelled() && handle.transport().is_open()
    }

    fn find_live(&self, transport_id: &str) -> Option<Arc<DeviceHandle>> {
        self.devices
            .lock()
            .iter()
            .find(|d| d.transport_id() == transport_id && Self::is_live(d))
            .cloned()
    }

    /// Remove from the table and cancel pending waits. Returns whether the
    /// handle was registered.
    fn teardown(&self, handle: &DeviceHandle) -> bool {
        handle.cancel_token().cancel();
        let mut devices = self.devices.lock();
        let before = devices.len();
        devices.retain(|d| !std::ptr::eq(Arc::as_ptr(d), handle));
        devices.len() != before
    }

    async fn ensure_connected(&self, handle: &DeviceHandle) -> Result<()> {
        if self.is_still_connected(handle) {
            return Ok(());
        }
        self.disconnect_device(handle).await;
        Err(Error::DeviceDisconnected(handle.transport_id().to_string()))
    }

    /// Tear the device down when an operation failed because it is gone.
    async fn settle<T>(&self, handle: &DeviceHandle, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if ErrorClass::classify(e) == ErrorClass::Disconnected {
                self.disconnect_device(handle).await;
            }
        }
        result
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::new(AdapterRegistry::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[tokio::test]
    async fn connect_reuses_open_handle_for_same_transport() {
        let connector = Connector::default();
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new("hid-0"));

        let first = connector
            .connect(Arc::clone(&transport), "FiiO", "FIIO KA17")
            .await
            .unwrap();
        let second = connector
            .connect(Arc::clone(&transport), "FiiO", "FIIO KA17")
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(transport.is_open());
        assert!(connector.is_still_connected(&first));
    }

    #[tokio::test]
    async fn unsupported_device_is_rejected() {
        let connector = Connector::default();
        let result = connector
            .connect(Arc::new(MockTransport::new("hid-1")), "Logitech", "G502")
            .await;
        assert!(matches!(result, Err(Error::UnsupportedDevice { .. })));
        assert!(connector.get_device_connected().is_none());
    }

    #[tokio::test]
    async fn serial_protocol_needs_serial_transport() {
        let connector = Connector::default();
        let hid = Arc::new(MockTransport::new("hid-2"));
        let result = connector
            .connect(hid.clone(), "JDS Labs", "Element IV")
            .await;
        assert!(matches!(result, Err(Error::UnsupportedDevice { .. })));
        assert!(!hid.is_open());

        let tty = Arc::new(MockTransport::serial("/dev/ttyACM0"));
        let handle = connector
            .connect(tty, "JDS Labs", "Element IV")
            .await
            .unwrap();
        assert_eq!(handle.adapter().name(), "jds-labs");

        let result = connector
            .connect(Arc::new(MockTransport::serial("/dev/ttyACM1")), "FiiO", "FIIO KA17")
            .await;
        assert!(matches!(result, Err(Error::UnsupportedDevice { .. })));
    }

    #[tokio::test]
    async fn close_device_sends_no_event() {
        let connector = Connector::default();
        let mut events = connector.subscribe_events();
        let handle = connector
            .connect(Arc::new(MockTransport::new("hid-0")), "Qudelix", "5K")
            .await
            .unwrap();

        connector.close_device(&handle).await.unwrap();

        assert!(!connector.is_still_connected(&handle));
        assert!(handle.is_cancelled());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn lost_transport_notifies_once() {
        let connector = Connector::default();
        let mut events = connector.subscribe_events();
        let handle = connector
            .connect(Arc::new(MockTransport::new("hid-0")), "Moondrop", "Quark2")
            .await
            .unwrap();

        connector.on_transport_lost("hid-0").await;
        connector.on_transport_lost("hid-0").await;
        connector.disconnect_device(&handle).await;

        assert_eq!(
            events.try_recv().unwrap(),
            DeviceEvent::Disconnected {
                transport_id: "hid-0".into(),
                manufacturer: "Moondrop".into(),
                model: "Quark2".into(),
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalidated_transport_fails_before_any_write() {
        let connector = Connector::default();
        let mock = Arc::new(MockTransport::new("hid-0"));
        let transport: Arc<dyn Transport> = mock.clone();
        let handle = connector
            .connect(transport, "FiiO", "FIIO KA17")
            .await
            .unwrap();

        mock.unplug();
        let result = connector.pull_from_device(&handle, 0).await;

        assert!(matches!(result, Err(Error::DeviceDisconnected(_))));
        assert_eq!(mock.sent_count(), 0);
        assert!(connector.get_device_connected().is_none());
    }

    #[tokio::test]
    async fn push_to_sentinel_slot_is_rejected() {
        let connector = Connector::default();
        let mock = Arc::new(MockTransport::new("hid-0"));
        let handle = connector
            .connect(mock.clone(), "FiiO", "FIIO KA17")
            .await
            .unwrap();
        let filters = [Filter::peaking(1000.0, 3.0, 1.0)];

        for slot in [crate::PEQ_DISABLED_SLOT, crate::SLOT_UNAVAILABLE] {
            let result = connector.push_to_device(&handle, slot, 0.0, &filters).await;
            assert!(
                matches!(result, Err(Error::OutOfRange { field: "slot", .. })),
                "{result:?}"
            );
        }
        assert_eq!(mock.sent_count(), 0);
        assert!(connector.is_still_connected(&handle));
    }

    #[tokio::test]
    async fn available_slots_come_from_model_table() {
        let connector = Connector::default();
        let handle = connector
            .connect(Arc::new(MockTransport::new("hid-0")), "FiiO", "FIIO KA17")
            .await
            .unwrap();
        let slots = connector.get_available_slots(&handle);
        assert!(slots.iter().any(|s| s.id == 160 && s.name == "USER1"));
    }
}
