//! Moondrop HID PEQ protocol (older register-addressed firmware).
//!
//! Every access is a 5-byte register operation:
//!
//! ```text
//! [cmd, addr, b0, b1, b2]      cmd: READ 0x52, WRITE 0x57, SAVE 0x53
//! ```
//!
//! Reads are answered with the same layout. Band `i` occupies two registers:
//! `0x10 + 2i` holds `freq(2, BE), gain(i8 tenths dB)` and `0x11 + 2i` holds
//! `q(2, BE, ×1000), 0`. The preamp register holds half-dB steps, the preset
//! register the active preset id. The device needs a pause after every
//! access, so accesses are strictly paced.

use super::{send, shared, AdapterCapabilities, AdapterConfig, PeqAdapter};
use crate::codec::{ByteOrder, GainScale, QScale};
use crate::correlator::await_condition;
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterSet};
use crate::handle::DeviceHandle;
use crate::registry::DeviceModelConfig;
use crate::safety::{self, QLimits};
use crate::transport::ReportListener;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const REPORT_ID: u8 = 0x4B;

/// Register command bytes.
pub mod commands {
    pub const READ: u8 = 0x52;
    pub const WRITE: u8 = 0x57;
    pub const SAVE: u8 = 0x53;
}

/// Register addresses.
pub mod registers {
    pub const PREAMP: u8 = 0x01;
    pub const PRESET: u8 = 0x02;
    pub const BAND_BASE: u8 = 0x10;
}

const ORDER: ByteOrder = ByteOrder::BigEndian;
const BAND_GAIN: GainScale = GainScale::TENTHS;
const PREAMP_GAIN: GainScale = GainScale::HALF_DB;
const Q: QScale = QScale::THOUSANDTHS;
const Q_LIMITS: QLimits = QLimits::new(0.1, 65.535);

/// Frequency/gain register of band `index`.
pub fn band_register(index: usize) -> u8 {
    registers::BAND_BASE + (index as u8) * 2
}

/// Q register of band `index`.
pub fn q_register(index: usize) -> u8 {
    band_register(index) + 1
}

pub fn register_packet(command: u8, addr: u8, value: [u8; 3]) -> [u8; 5] {
    [command, addr, value[0], value[1], value[2]]
}

/// Band gain in tenths of a dB, clamped to the model range and a signed byte.
fn gain_byte(gain: f64, config: &DeviceModelConfig) -> u8 {
    let lo = ((config.min_gain * 10.0).round() as i32).max(i8::MIN as i32);
    let hi = ((config.max_gain * 10.0).round() as i32).min(i8::MAX as i32);
    BAND_GAIN.encode(gain).clamp(lo, hi) as i8 as u8
}

/// Encode band `filter` into its two register values.
pub fn encode_band(filter: &Filter, config: &DeviceModelConfig) -> ([u8; 3], [u8; 3]) {
    let freq = ORDER.split_u16(filter.freq.round() as u16);
    let q = ORDER.split_u16(Q.encode_u16(filter.q));
    (
        [freq[0], freq[1], gain_byte(filter.effective_gain(), config)],
        [q[0], q[1], 0x00],
    )
}

pub fn decode_band(freq_gain: [u8; 3], q: [u8; 3]) -> Filter {
    let freq = ORDER.join_u16([freq_gain[0], freq_gain[1]]) as f64;
    let gain = BAND_GAIN.decode(freq_gain[2] as i8 as i32);
    let q = Q.decode(ORDER.join_u16([q[0], q[1]]) as u32);
    Filter::peaking(freq, gain, q)
}

pub fn encode_preamp(gain: f64) -> [u8; 3] {
    let steps = PREAMP_GAIN
        .encode(gain)
        .clamp(i8::MIN as i32, i8::MAX as i32);
    [steps as i8 as u8, 0x00, 0x00]
}

pub fn decode_preamp(value: [u8; 3]) -> f64 {
    PREAMP_GAIN.decode(value[0] as i8 as i32)
}

/// Parse a read response into `(addr, value)`.
pub fn parse_read(data: &[u8]) -> Result<(u8, [u8; 3])> {
    match data {
        [commands::READ, addr, b0, b1, b2, ..] => Ok((*addr, [*b0, *b1, *b2])),
        _ => Err(Error::MalformedResponse(format!(
            "Moondrop register response: {:02X?}",
            data
        ))),
    }
}

/// Adapter for register-addressed Moondrop devices.
#[derive(Debug, Clone, Default)]
pub struct MoondropLegacyAdapter {
    config: AdapterConfig,
}

impl MoondropLegacyAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    /// Send one register access followed by the mandatory pause.
    async fn access(&self, handle: &DeviceHandle, packet: [u8; 5]) -> Result<()> {
        send(handle, &self.config, REPORT_ID, &packet).await?;
        tokio::time::sleep(self.config.register_delay).await;
        Ok(())
    }

    /// Read a set of registers and wait until every one has answered.
    async fn read_registers(
        &self,
        handle: &DeviceHandle,
        addrs: &[u8],
        operation: &'static str,
    ) -> Result<BTreeMap<u8, [u8; 3]>> {
        let state = shared(BTreeMap::<u8, [u8; 3]>::new());
        let sink = Arc::clone(&state);
        let _listener = ReportListener::spawn(handle.transport(), move |report| {
            match parse_read(&report.data) {
                Ok((addr, value)) => {
                    sink.lock().insert(addr, value);
                }
                Err(e) => warn!(error = %e, "Discarding malformed report"),
            }
        });

        for addr in addrs {
            self.access(handle, register_packet(commands::READ, *addr, [0; 3]))
                .await?;
        }

        await_condition(
            || {
                let s = state.lock();
                addrs.iter().all(|a| s.contains_key(a))
            },
            || state.lock().clone(),
            self.config.wait(self.config.read_timeout),
            handle.cancel_token(),
        )
        .await
        .map_err(|e| e.into_error(operation, handle.transport_id()))
    }
}

#[async_trait]
impl PeqAdapter for MoondropLegacyAdapter {
    fn name(&self) -> &'static str {
        "moondrop-legacy"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_explicit_read: true,
            supports_global_gain: true,
            supports_filter_types: false,
        }
    }

    async fn get_current_slot(&self, handle: &DeviceHandle) -> Result<i32> {
        let state = shared(None::<i32>);
        let sink = Arc::clone(&state);
        let _listener = ReportListener::spawn(handle.transport(), move |report| {
            if let Ok((registers::PRESET, value)) = parse_read(&report.data) {
                *sink.lock() = Some(value[0] as i32);
            }
        });
        self.access(
            handle,
            register_packet(commands::READ, registers::PRESET, [0; 3]),
        )
        .await?;
        super::await_slot(handle, &self.config, &state).await
    }

    /// Reads the active register bank; `slot` is informational only.
    async fn pull_from_device(&self, handle: &DeviceHandle, slot: i32) -> Result<FilterSet> {
        let config = handle.model_config();
        debug!(slot, bands = config.max_filters, "Moondrop register pull");

        let mut addrs = vec![registers::PREAMP];
        for index in 0..config.max_filters {
            addrs.push(band_register(index));
            addrs.push(q_register(index));
        }
        let values = self
            .read_registers(handle, &addrs, "Moondrop register read")
            .await?;

        let filters = (0..config.max_filters)
            .filter_map(|i| {
                let fg = values.get(&band_register(i))?;
                let q = values.get(&q_register(i))?;
                Some(decode_band(*fg, *q))
            })
            .collect();
        let global_gain = values
            .get(&registers::PREAMP)
            .map(|v| decode_preamp(*v))
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
        let slot_id = safety::slot_byte(slot)?;
        let filters = safety::prepare_filters(filters, config, Q_LIMITS);
        let flat = Filter::peaking(1000.0, 0.0, 1.0);

        for index in 0..config.max_filters {
            let filter = filters.get(index).unwrap_or(&flat);
            let (freq_gain, q) = encode_band(filter, config);
            self.access(
                handle,
                register_packet(commands::WRITE, band_register(index), freq_gain),
            )
            .await?;
            self.access(
                handle,
                register_packet(commands::WRITE, q_register(index), q),
            )
            .await?;
        }
        self.access(
            handle,
            register_packet(
                commands::WRITE,
                registers::PREAMP,
                encode_preamp(config.clamp_gain(global_gain)),
            ),
        )
        .await?;
        self.access(handle, register_packet(commands::SAVE, slot_id, [0; 3]))
            .await?;

        info!(slot, bands = filters.len(), "Moondrop registers saved");
        Ok(config.disconnect_on_save)
    }

    async fn enable_peq(&self, handle: &DeviceHandle, enabled: bool, slot_id: i32) -> Result<()> {
        let config = handle.model_config();
        let target = if enabled {
            slot_id
        } else {
            config.disabled_preset_id
        };
        let target = safety::slot_byte(target)?;
        self.access(
            handle,
            register_packet(commands::WRITE, registers::PRESET, [target, 0, 0]),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::get_model_config;

    fn model() -> &'static DeviceModelConfig {
        get_model_config("Moondrop", "MOONDROP Dawn Pro")
    }

    #[test]
    fn band_registers_are_consecutive() {
        assert_eq!(band_register(0), 0x10);
        assert_eq!(q_register(0), 0x11);
        assert_eq!(band_register(3), 0x16);
        assert_eq!(q_register(3), 0x17);
    }

    #[test]
    fn band_encoding_bytes() {
        let (fg, q) = encode_band(&Filter::peaking(250.0, -2.5, 0.707), model());
        assert_eq!(fg, [0x00, 0xFA, (-25i8) as u8]);
        assert_eq!(q, [0x02, 0xC3, 0x00]);
        let back = decode_band(fg, q);
        assert_eq!(back, Filter::peaking(250.0, -2.5, 0.707));
    }

    #[test]
    fn gain_clamped_to_device_signed_byte_range() {
        // Dawn Pro max_gain is 6 dB → 60 tenths
        let (fg, _) = encode_band(&Filter::peaking(1000.0, 11.0, 1.0), model());
        assert_eq!(fg[2], 60);
        let (fg, _) = encode_band(&Filter::peaking(1000.0, -20.0, 1.0), model());
        assert_eq!(fg[2] as i8, -120);
    }

    #[test]
    fn preamp_half_db_steps() {
        assert_eq!(encode_preamp(-3.5), [(-7i8) as u8, 0, 0]);
        assert_eq!(decode_preamp(encode_preamp(-3.5)), -3.5);
    }

    #[test]
    fn parse_read_response() {
        assert_eq!(
            parse_read(&[0x52, 0x10, 1, 2, 3]).unwrap(),
            (0x10, [1, 2, 3])
        );
        assert!(parse_read(&[0x57, 0x10, 1, 2, 3]).is_err());
        assert!(parse_read(&[0x52, 0x10]).is_err());
    }
}
