//! Vendor protocol adapters.
//!
//! Every adapter speaks one vendor's wire format behind the [`PeqAdapter`]
//! contract. Adapters are stateless: per-call state lives in a local
//! accumulator fed by a [`ReportListener`](crate::transport::ReportListener)
//! and is discarded when the call returns.

pub mod fiio;
pub mod jds;
pub mod moondrop;
pub mod moondrop_legacy;
pub mod qudelix;
pub mod topping;

use crate::comm;
use crate::correlator::{await_condition, WaitError, WaitOptions, DEFAULT_POLL_INTERVAL};
use crate::error::Result;
use crate::filter::{Filter, FilterSet};
use crate::handle::DeviceHandle;
use crate::registry::SLOT_UNAVAILABLE;
use crate::transport::TransportKind;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What an adapter's protocol can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdapterCapabilities {
    /// The device answers read requests. When false, pulls are inferred from
    /// echoed writes and may return stale or default values.
    pub supports_explicit_read: bool,
    /// The protocol carries an overall (pre)gain.
    pub supports_global_gain: bool,
    /// Bands may be shelves, not only peaking.
    pub supports_filter_types: bool,
}

/// Timing knobs handed to every adapter at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterConfig {
    pub poll_interval: Duration,
    /// Budget for a full filter-bank read, including any fan-out.
    pub read_timeout: Duration,
    /// Budget for write acknowledgements.
    pub write_timeout: Duration,
    /// Budget for a current-slot query.
    pub slot_timeout: Duration,
    /// Mandatory pause after each register access on register-model devices.
    pub register_delay: Duration,
    /// How long echoed writes are collected on devices without a read opcode.
    pub harvest_window: Duration,
    pub max_write_retries: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_timeout: Duration::from_millis(10_000),
            write_timeout: Duration::from_millis(5_000),
            slot_timeout: Duration::from_millis(5_000),
            register_delay: Duration::from_millis(20),
            harvest_window: Duration::from_millis(500),
            max_write_retries: comm::MAX_RETRIES,
        }
    }
}

impl AdapterConfig {
    pub fn wait(&self, timeout: Duration) -> WaitOptions {
        WaitOptions::new(timeout, self.poll_interval)
    }
}

/// Uniform adapter contract consumed by the connector.
#[async_trait]
pub trait PeqAdapter: Send + Sync {
    /// Short protocol family name.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Link class the protocol runs over.
    fn transport_kind(&self) -> TransportKind {
        TransportKind::Hid
    }

    /// Open the transport if it is not already open.
    async fn connect(&self, handle: &DeviceHandle) -> Result<()> {
        let transport = handle.transport();
        if !transport.is_open() {
            transport.open().await?;
            info!(
                adapter = self.name(),
                transport = transport.id(),
                model = handle.model(),
                "Transport opened"
            );
        }
        Ok(())
    }

    /// Active slot id, [`PEQ_DISABLED_SLOT`](crate::registry::PEQ_DISABLED_SLOT)
    /// when PEQ is off, [`SLOT_UNAVAILABLE`] when the device did not answer.
    async fn get_current_slot(&self, handle: &DeviceHandle) -> Result<i32>;

    async fn pull_from_device(&self, handle: &DeviceHandle, slot: i32) -> Result<FilterSet>;

    /// Write a filter bank. Returns `true` when the caller should disconnect
    /// because the device drops off the bus after saving.
    async fn push_to_device(
        &self,
        handle: &DeviceHandle,
        slot: i32,
        global_gain: f64,
        filters: &[Filter],
    ) -> Result<bool>;

    async fn enable_peq(&self, handle: &DeviceHandle, enabled: bool, slot_id: i32) -> Result<()>;
}

/// Per-call accumulator shared between a listener callback and the waiter.
pub(crate) type Shared<T> = Arc<parking_lot::Mutex<T>>;

pub(crate) fn shared<T>(value: T) -> Shared<T> {
    Arc::new(parking_lot::Mutex::new(value))
}

/// Write one report through the retrying writer.
pub(crate) async fn send(
    handle: &DeviceHandle,
    config: &AdapterConfig,
    report_id: u8,
    data: &[u8],
) -> Result<()> {
    comm::write_with_retry(handle.transport(), report_id, data, config.max_write_retries).await
}

/// Wait for a slot answer and map it to a router slot.
///
/// A timeout is reported as [`SLOT_UNAVAILABLE`] instead of an error so the
/// caller can show "unknown" without tearing the device down.
pub(crate) async fn await_slot(
    handle: &DeviceHandle,
    config: &AdapterConfig,
    state: &Shared<Option<i32>>,
) -> Result<i32> {
    let outcome = await_condition(
        || state.lock().is_some(),
        || *state.lock(),
        config.wait(config.slot_timeout),
        handle.cancel_token(),
    )
    .await;

    match outcome {
        Ok(Some(raw)) => {
            let slot = handle.model_config().to_router_slot(raw);
            debug!(raw, slot, "Current slot");
            Ok(slot)
        }
        Ok(None) => Ok(SLOT_UNAVAILABLE),
        Err(WaitError::TimedOut { waited, .. }) => {
            warn!(
                transport = handle.transport_id(),
                waited_ms = waited.as_millis() as u64,
                "Slot query timed out"
            );
            Ok(SLOT_UNAVAILABLE)
        }
        Err(e) => Err(e.into_error("current slot", handle.transport_id())),
    }
}

/// An outbound report queued by an interrogation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Outbound {
    pub report_id: u8,
    pub data: Vec<u8>,
}

impl Outbound {
    pub fn new(report_id: u8, data: Vec<u8>) -> Self {
        Self { report_id, data }
    }
}

/// Phase of a count-then-per-band interrogation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterrogationPhase {
    Idle,
    AwaitingCount,
    AwaitingBands { expected: usize },
    Satisfied,
    TimedOut,
}

/// State filled by a two-phase interrogation's listener.
pub(crate) trait BandAccumulator {
    /// Band count, once the device has reported it.
    fn expected(&self) -> Option<usize>;
    /// Distinct bands received so far.
    fn collected(&self) -> usize;
    /// Fields outside the band list (e.g. global gain) are in.
    fn header_ready(&self) -> bool {
        true
    }
}

/// Run a two-phase read: request the band count, then one request per band.
///
/// Both phases share a single `read_timeout` budget. Returns the band count
/// once every band has arrived.
pub(crate) async fn interrogate<S, F>(
    handle: &DeviceHandle,
    config: &AdapterConfig,
    state: &Shared<S>,
    count_requests: Vec<Outbound>,
    band_request: F,
    operation: &'static str,
) -> Result<usize>
where
    S: BandAccumulator,
    F: Fn(usize) -> Outbound,
{
    let deadline = Instant::now() + config.read_timeout;
    let wait = config.wait(config.read_timeout);
    let device = handle.transport_id();
    debug!(phase = ?InterrogationPhase::Idle, operation, "Interrogation start");

    for req in &count_requests {
        send(handle, config, req.report_id, &req.data).await?;
    }
    debug!(phase = ?InterrogationPhase::AwaitingCount, operation);

    let expected = await_condition(
        || state.lock().expected().is_some(),
        || state.lock().expected(),
        wait.until(deadline),
        handle.cancel_token(),
    )
    .await
    .map_err(|e| {
        debug!(phase = ?InterrogationPhase::TimedOut, operation, "No band count");
        e.into_error(operation, device)
    })?
    .unwrap_or(0);

    debug!(phase = ?InterrogationPhase::AwaitingBands { expected }, operation);
    for index in 0..expected {
        let req = band_request(index);
        send(handle, config, req.report_id, &req.data).await?;
    }

    await_condition(
        || {
            let s = state.lock();
            s.collected() >= expected && s.header_ready()
        },
        || (),
        wait.until(deadline),
        handle.cancel_token(),
    )
    .await
    .map_err(|e| {
        let received = state.lock().collected();
        warn!(
            phase = ?InterrogationPhase::TimedOut,
            operation,
            received,
            expected,
            "Band interrogation incomplete"
        );
        e.into_error(operation, device)
    })?;

    debug!(phase = ?InterrogationPhase::Satisfied, operation, expected);
    Ok(expected)
}
