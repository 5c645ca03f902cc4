//! open-peq-core: device communication layer for parametric-EQ peripherals.
//!
//! This crate reads and writes PEQ filter banks on USB HID dongles and USB
//! serial DSP boxes from several vendors. Each vendor's wire format lives in
//! an adapter behind one async contract; the connector routes a device to its
//! adapter by manufacturer and product string and serializes operations per
//! device.

pub mod adapters;
pub mod codec;
pub mod comm;
pub mod connector;
pub mod correlator;
pub mod device;
pub mod error;
pub mod filter;
pub mod handle;
pub mod registry;
pub mod router;
pub mod safety;
pub mod transport;

pub use adapters::{AdapterCapabilities, AdapterConfig, PeqAdapter};
pub use connector::{Connector, DeviceEvent};
pub use error::{Error, Result};
pub use filter::{Filter, FilterSet, FilterType};
pub use handle::DeviceHandle;
pub use registry::{get_model_config, DeviceModelConfig, SlotInfo, PEQ_DISABLED_SLOT, SLOT_UNAVAILABLE};
pub use router::AdapterRegistry;
pub use transport::{InboundReport, Transport, TransportKind};
