//! Topping HID PEQ protocol (best effort).
//!
//! Parameters are written one field at a time into paged registers:
//!
//! ```text
//! [page, offset, v0, v1, v2, v3]     page 0x90 + band, 0x80 global
//! ```
//!
//! | offset | field | value |
//! |---|---|---|
//! | 0x00 | enable | u32 LE, 0 or 1 |
//! | 0x01 | frequency | u32 LE Hz |
//! | 0x02 | gain | i32 LE, 16.16 fixed-point dB |
//! | 0x03 | Q | u32 LE ×10000 |
//! | 0x0F | apply | ignored |
//!
//! The device has no read opcode. It echoes every accepted write verbatim,
//! and an apply trigger makes it re-send the current fields of that page. A
//! pull therefore triggers every page and collects whatever echoes arrive
//! within a short window; fields that never arrive come back as defaults,
//! and stale echoes of earlier writes are indistinguishable from live state.

use super::{send, shared, AdapterCapabilities, AdapterConfig, PeqAdapter};
use crate::codec::{ByteOrder, GainScale, QScale};
use crate::correlator::{await_condition, WaitError};
use crate::error::Result;
use crate::filter::{Filter, FilterSet};
use crate::handle::DeviceHandle;
use crate::registry::PEQ_DISABLED_SLOT;
use crate::safety::{self, QLimits};
use crate::transport::ReportListener;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const REPORT_ID: u8 = 0x00;

pub const BAND_PAGE_BASE: u8 = 0x90;
pub const GLOBAL_PAGE: u8 = 0x80;

/// Register offsets within a page.
pub mod offsets {
    pub const ENABLE: u8 = 0x00;
    pub const FREQ: u8 = 0x01;
    pub const GAIN: u8 = 0x02;
    pub const Q: u8 = 0x03;
    pub const APPLY: u8 = 0x0F;
}

const ORDER: ByteOrder = ByteOrder::LittleEndian;
const GAIN: GainScale = GainScale::FIXED_16_16;
const Q: QScale = QScale::TEN_THOUSANDTHS;
const Q_LIMITS: QLimits = QLimits::new(0.01, 50.0);

/// Centre frequencies reported for bands whose frequency never echoed.
const DEFAULT_FREQS: [f64; 10] = [
    31.0, 62.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

pub fn band_page(index: usize) -> u8 {
    BAND_PAGE_BASE + index as u8
}

pub fn default_freq(index: usize) -> f64 {
    DEFAULT_FREQS.get(index).copied().unwrap_or(1000.0)
}

pub fn register_packet(page: u8, offset: u8, value: u32) -> [u8; 6] {
    let v = ORDER.split_u32(value);
    [page, offset, v[0], v[1], v[2], v[3]]
}

pub fn encode_gain(gain: f64) -> u32 {
    GAIN.encode(gain) as u32
}

pub fn decode_gain(raw: u32) -> f64 {
    GAIN.decode(raw as i32)
}

/// Every packet needed to write one band, ending with its apply trigger.
pub fn band_packets(index: usize, filter: Option<&Filter>) -> Vec<[u8; 6]> {
    let page = band_page(index);
    let flat = Filter::peaking(default_freq(index), 0.0, 1.0);
    let enabled = filter.is_some_and(|f| !f.disabled);
    let f = filter.unwrap_or(&flat);
    vec![
        register_packet(page, offsets::ENABLE, u32::from(enabled)),
        register_packet(page, offsets::FREQ, f.freq.round() as u32),
        register_packet(page, offsets::GAIN, encode_gain(f.gain)),
        register_packet(page, offsets::Q, Q.encode(f.q)),
        register_packet(page, offsets::APPLY, 0),
    ]
}

/// Fields of one page seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PageFields {
    pub enable: Option<bool>,
    pub freq: Option<f64>,
    pub gain: Option<f64>,
    pub q: Option<f64>,
}

impl PageFields {
    fn complete(&self) -> bool {
        self.enable.is_some() && self.freq.is_some() && self.gain.is_some() && self.q.is_some()
    }

    /// Build a band, filling missing fields with defaults.
    pub fn to_filter(&self, index: usize) -> Filter {
        let mut filter = Filter::peaking(
            self.freq.unwrap_or_else(|| default_freq(index)),
            self.gain.unwrap_or(0.0),
            self.q.unwrap_or(1.0),
        );
        filter.disabled = self.enable == Some(false);
        filter
    }
}

/// Record one echoed packet into the per-page field map.
pub fn record_echo(pages: &mut BTreeMap<u8, PageFields>, data: &[u8]) -> bool {
    let [page, offset, v0, v1, v2, v3, ..] = *data else {
        return false;
    };
    let value = ORDER.join_u32([v0, v1, v2, v3]);
    let fields = pages.entry(page).or_default();
    match offset {
        offsets::ENABLE => fields.enable = Some(value != 0),
        offsets::FREQ => fields.freq = Some(value as f64),
        offsets::GAIN => fields.gain = Some(decode_gain(value)),
        offsets::Q => fields.q = Some(Q.decode(value)),
        _ => return false,
    }
    true
}

/// Adapter for Topping devices. Reads are inferred from echoed writes.
#[derive(Debug, Default)]
pub struct ToppingAdapter {
    config: AdapterConfig,
    /// Last PEQ switch written per transport id. The device has no way to
    /// report it.
    peq_enabled: Mutex<HashMap<String, bool>>,
}

impl ToppingAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            peq_enabled: Mutex::new(HashMap::new()),
        }
    }

    async fn write_register(&self, handle: &DeviceHandle, packet: [u8; 6]) -> Result<()> {
        send(handle, &self.config, REPORT_ID, &packet).await
    }
}

#[async_trait]
impl PeqAdapter for ToppingAdapter {
    fn name(&self) -> &'static str {
        "topping"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_explicit_read: false,
            supports_global_gain: true,
            supports_filter_types: false,
        }
    }

    /// Single-bank device: slot 0, or [`PEQ_DISABLED_SLOT`] once PEQ has been
    /// switched off through this adapter.
    async fn get_current_slot(&self, handle: &DeviceHandle) -> Result<i32> {
        let enabled = self
            .peq_enabled
            .lock()
            .get(handle.transport_id())
            .copied()
            .unwrap_or(true);
        Ok(if enabled { 0 } else { PEQ_DISABLED_SLOT })
    }

    async fn pull_from_device(&self, handle: &DeviceHandle, slot: i32) -> Result<FilterSet> {
        let bands = handle.model_config().max_filters;
        debug!(slot, bands, "Topping harvest pull");

        let state = shared(BTreeMap::<u8, PageFields>::new());
        let sink = Arc::clone(&state);
        let _listener = ReportListener::spawn(handle.transport(), move |report| {
            if !record_echo(&mut sink.lock(), &report.data) {
                debug!(report_hex = format_args!("{:02X?}", report.data), "Ignoring report");
            }
        });

        for index in 0..bands {
            self.write_register(handle, register_packet(band_page(index), offsets::APPLY, 0))
                .await?;
        }
        self.write_register(handle, register_packet(GLOBAL_PAGE, offsets::APPLY, 0))
            .await?;

        let complete = || {
            let pages = state.lock();
            (0..bands).all(|i| pages.get(&band_page(i)).is_some_and(PageFields::complete))
                && pages.get(&GLOBAL_PAGE).is_some_and(|g| g.gain.is_some())
        };
        let pages = match await_condition(
            complete,
            || state.lock().clone(),
            self.config.wait(self.config.harvest_window),
            handle.cancel_token(),
        )
        .await
        {
            Ok(pages) => pages,
            Err(WaitError::TimedOut { partial, .. }) => {
                warn!(
                    pages = partial.len(),
                    "Topping harvest incomplete; missing fields use defaults"
                );
                partial
            }
            Err(e) => return Err(e.into_error("Topping harvest", handle.transport_id())),
        };

        let filters = (0..bands)
            .map(|i| {
                pages
                    .get(&band_page(i))
                    .copied()
                    .unwrap_or_default()
                    .to_filter(i)
            })
            .collect();
        let global_gain = pages
            .get(&GLOBAL_PAGE)
            .and_then(|g| g.gain)
            .unwrap_or(0.0);
        Ok(FilterSet::new(filters, global_gain))
    }

    async fn push_to_device(
        &self,
        handle: &DeviceHandle,
        slot: i32,
        global_gain: f64,
        filters: &[Filter],
    ) -> Result<bool> {
        let config = handle.model_config();
        let filters = safety::prepare_filters(filters, config, Q_LIMITS);

        for index in 0..config.max_filters {
            for packet in band_packets(index, filters.get(index)) {
                self.write_register(handle, packet).await?;
            }
        }
        self.write_register(
            handle,
            register_packet(
                GLOBAL_PAGE,
                offsets::GAIN,
                encode_gain(config.clamp_gain(global_gain)),
            ),
        )
        .await?;
        self.write_register(handle, register_packet(GLOBAL_PAGE, offsets::APPLY, 0))
            .await?;

        info!(slot, bands = filters.len(), "Topping bands written");
        Ok(config.disconnect_on_save)
    }

    async fn enable_peq(&self, handle: &DeviceHandle, enabled: bool, _slot_id: i32) -> Result<()> {
        self.write_register(
            handle,
            register_packet(GLOBAL_PAGE, offsets::ENABLE, u32::from(enabled)),
        )
        .await?;
        self.peq_enabled
            .lock()
            .insert(handle.transport_id().to_string(), enabled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_is_16_16_fixed_point() {
        assert_eq!(encode_gain(1.0), 0x0001_0000);
        assert_eq!(encode_gain(-1.5), 0xFFFE_8000);
        assert_eq!(decode_gain(0xFFFE_8000), -1.5);
    }

    #[test]
    fn band_packet_sequence() {
        let packets = band_packets(2, Some(&Filter::peaking(1000.0, -1.5, 0.7071)));
        assert_eq!(packets[0], [0x92, 0x00, 1, 0, 0, 0]);
        assert_eq!(packets[1], [0x92, 0x01, 0xE8, 0x03, 0, 0]);
        assert_eq!(packets[2], [0x92, 0x02, 0x00, 0x80, 0xFE, 0xFF]);
        // 7071 = 0x1B9F
        assert_eq!(packets[3], [0x92, 0x03, 0x9F, 0x1B, 0, 0]);
        assert_eq!(packets[4], [0x92, 0x0F, 0, 0, 0, 0]);
    }

    #[test]
    fn absent_band_written_disabled_and_flat() {
        let packets = band_packets(0, None);
        assert_eq!(packets[0], [0x90, 0x00, 0, 0, 0, 0]);
        assert_eq!(packets[2], [0x90, 0x02, 0, 0, 0, 0]);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let mut pages = BTreeMap::new();
        assert!(record_echo(&mut pages, &register_packet(0x91, offsets::GAIN, encode_gain(4.0))));
        assert!(!record_echo(&mut pages, &register_packet(0x91, offsets::APPLY, 0)));
        assert!(!record_echo(&mut pages, &[0x91, 0x02]));

        let filter = pages[&0x91].to_filter(1);
        assert_eq!(filter, Filter::peaking(62.0, 4.0, 1.0));
        assert_eq!(PageFields::default().to_filter(20).freq, 1000.0);
    }

    #[test]
    fn disabled_echo_marks_band_disabled() {
        let mut pages = BTreeMap::new();
        record_echo(&mut pages, &register_packet(0x90, offsets::ENABLE, 0));
        assert!(pages[&0x90].to_filter(0).disabled);
    }
}
