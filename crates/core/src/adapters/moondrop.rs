//! Moondrop HID PEQ protocol (current firmware).
//!
//! One report id carries whole-slot transfers:
//!
//! ```text
//! read request:   [0x03, slot]
//! slot packet:    [cmd, slot, count, gg_hi, gg_lo, count × (freq(2), gain(2), q(2))]
//! write ack:      [0x04, slot, status]
//! active slot:    [0x01] → [0x01, slot];  set: [0x02, slot]
//! ```
//!
//! All fields are big-endian. Band gain is two's-complement tenths of a dB,
//! Q is sent as is, without fixed-point scaling, so only whole values
//! survive the trip. Bands are peaking only. The global-gain field holds the
//! headroom above the device floor, `round((max_gain + preamp) × 10)`.

use super::{await_slot, send, shared, AdapterCapabilities, AdapterConfig, PeqAdapter};
use crate::codec::{ByteOrder, GainScale, QScale, SignEncoding};
use crate::correlator::await_condition;
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterSet, FilterType};
use crate::handle::DeviceHandle;
use crate::registry::DeviceModelConfig;
use crate::safety::{self, QLimits};
use crate::transport::ReportListener;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const REPORT_ID: u8 = 0x4B;

/// Command bytes.
pub mod commands {
    pub const GET_ACTIVE_SLOT: u8 = 0x01;
    pub const SET_ACTIVE_SLOT: u8 = 0x02;
    pub const EQ_SLOT_READ: u8 = 0x03;
    pub const EQ_SLOT_WRITE: u8 = 0x04;
}

const ORDER: ByteOrder = ByteOrder::BigEndian;
const SIGN: SignEncoding = SignEncoding::TwosComplement;
const GAIN: GainScale = GainScale::TENTHS;
const Q: QScale = QScale::UNSCALED;
const Q_LIMITS: QLimits = QLimits::new(1.0, 65535.0);

const HEADER_LEN: usize = 5;
const BAND_LEN: usize = 6;

/// Encode the global-gain field relative to the device ceiling.
pub fn encode_global_gain(preamp: f64, config: &DeviceModelConfig) -> [u8; 2] {
    ORDER.split_u16(SIGN.encode(GAIN.encode(config.max_gain + preamp)))
}

pub fn decode_global_gain(bytes: [u8; 2], config: &DeviceModelConfig) -> f64 {
    GAIN.decode(SIGN.decode(ORDER.join_u16(bytes))) - config.max_gain
}

fn encode_band(filter: &Filter) -> [u8; BAND_LEN] {
    let freq = ORDER.split_u16(filter.freq.round() as u16);
    let gain = ORDER.split_u16(SIGN.encode(GAIN.encode(filter.effective_gain())));
    let q = ORDER.split_u16(Q.encode_u16(filter.q));
    [freq[0], freq[1], gain[0], gain[1], q[0], q[1]]
}

fn decode_band(bytes: &[u8]) -> Filter {
    let freq = ORDER.join_u16([bytes[0], bytes[1]]) as f64;
    let gain = GAIN.decode(SIGN.decode(ORDER.join_u16([bytes[2], bytes[3]])));
    let q = Q.decode(ORDER.join_u16([bytes[4], bytes[5]]) as u32);
    Filter::peaking(freq, gain, q)
}

/// Build a slot-write packet.
pub fn encode_slot(
    slot: u8,
    preamp: f64,
    filters: &[Filter],
    config: &DeviceModelConfig,
) -> Vec<u8> {
    let gg = encode_global_gain(preamp, config);
    let mut packet = Vec::with_capacity(HEADER_LEN + filters.len() * BAND_LEN);
    packet.extend_from_slice(&[commands::EQ_SLOT_WRITE, slot, filters.len() as u8, gg[0], gg[1]]);
    for filter in filters {
        if filter.filter_type != FilterType::Peaking {
            debug!(
                freq = filter.freq,
                filter_type = %filter.filter_type,
                "Shelf band written as peaking"
            );
        }
        packet.extend_from_slice(&encode_band(filter));
    }
    packet
}

/// Decode a slot-read response into `(slot, filter set)`.
pub fn decode_slot(data: &[u8], config: &DeviceModelConfig) -> Result<(u8, FilterSet)> {
    if data.len() < HEADER_LEN || data[0] != commands::EQ_SLOT_READ {
        return Err(Error::MalformedResponse(format!(
            "Moondrop slot packet header: {:02X?}",
            &data[..data.len().min(HEADER_LEN)]
        )));
    }
    let count = data[2] as usize;
    let bands = data
        .get(HEADER_LEN..HEADER_LEN + count * BAND_LEN)
        .ok_or_else(|| {
            Error::MalformedResponse(format!(
                "Moondrop slot packet truncated: {count} bands in {} bytes",
                data.len()
            ))
        })?;
    let filters = bands.chunks_exact(BAND_LEN).map(decode_band).collect();
    let global_gain = decode_global_gain([data[3], data[4]], config);
    Ok((data[1], FilterSet::new(filters, global_gain)))
}

/// Adapter for Moondrop dongles with whole-slot transfers.
#[derive(Debug, Clone, Default)]
pub struct MoondropAdapter {
    config: AdapterConfig,
}

impl MoondropAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeqAdapter for MoondropAdapter {
    fn name(&self) -> &'static str {
        "moondrop"
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
            if let [commands::GET_ACTIVE_SLOT, slot, ..] = report.data.as_slice() {
                *sink.lock() = Some(*slot as i32);
            }
        });

        send(handle, &self.config, REPORT_ID, &[commands::GET_ACTIVE_SLOT]).await?;
        await_slot(handle, &self.config, &state).await
    }

    async fn pull_from_device(&self, handle: &DeviceHandle, slot: i32) -> Result<FilterSet> {
        let slot_id = safety::slot_byte(slot)?;
        let model = handle.model_config();
        let state = shared(None::<FilterSet>);
        let sink = Arc::clone(&state);
        let _listener = ReportListener::spawn(handle.transport(), move |report| {
            if report.data.first() != Some(&commands::EQ_SLOT_READ) {
                return;
            }
            match decode_slot(&report.data, model) {
                Ok((s, set)) if s == slot_id => *sink.lock() = Some(set),
                Ok((s, _)) => debug!(slot = s, "Ignoring packet for another slot"),
                Err(e) => warn!(error = %e, "Discarding slot packet"),
            }
        });

        send(
            handle,
            &self.config,
            REPORT_ID,
            &[commands::EQ_SLOT_READ, slot_id],
        )
        .await?;

        await_condition(
            || state.lock().is_some(),
            || state.lock().take(),
            self.config.wait(self.config.read_timeout),
            handle.cancel_token(),
        )
        .await
        .map_err(|e| e.into_error("Moondrop slot read", handle.transport_id()))?
        .ok_or_else(|| Error::MalformedResponse("Moondrop slot packet vanished".into()))
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
        let global_gain = config.clamp_gain(global_gain);

        let ack = shared(None::<u8>);
        let sink = Arc::clone(&ack);
        let _listener = ReportListener::spawn(handle.transport(), move |report| {
            if let [commands::EQ_SLOT_WRITE, s, status, ..] = report.data.as_slice() {
                if *s == slot_id {
                    *sink.lock() = Some(*status);
                }
            }
        });

        let packet = encode_slot(slot_id, global_gain, &filters, config);
        send(handle, &self.config, REPORT_ID, &packet).await?;

        let status = await_condition(
            || ack.lock().is_some(),
            || *ack.lock(),
            self.config.wait(self.config.write_timeout),
            handle.cancel_token(),
        )
        .await
        .map_err(|e| e.into_error("Moondrop slot write ack", handle.transport_id()))?;

        match status {
            Some(0) => {
                info!(slot, bands = filters.len(), global_gain, "Moondrop slot written");
                Ok(config.disconnect_on_save)
            }
            other => Err(Error::WriteFailed(format!(
                "Moondrop rejected slot {slot} write (status {other:?})"
            ))),
        }
    }

    async fn enable_peq(&self, handle: &DeviceHandle, enabled: bool, slot_id: i32) -> Result<()> {
        let config = handle.model_config();
        let target = if enabled {
            slot_id
        } else {
            config.disabled_preset_id
        };
        let target = safety::slot_byte(target)?;
        send(
            handle,
            &self.config,
            REPORT_ID,
            &[commands::SET_ACTIVE_SLOT, target],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::get_model_config;

    fn model() -> &'static DeviceModelConfig {
        get_model_config("Moondrop", "default")
    }

    #[test]
    fn global_gain_is_headroom_above_floor() {
        // max_gain 12, preamp -1.5 → round(10.5 * 10) = 105
        assert_eq!(encode_global_gain(-1.5, model()), [0x00, 105]);
        assert_eq!(decode_global_gain([0x00, 105], model()), -1.5);
    }

    #[test]
    fn slot_packet_layout() {
        let filters = [Filter::peaking(1000.0, -3.0, 0.71)];
        let packet = encode_slot(2, 0.0, &filters, model());
        assert_eq!(
            packet,
            vec![
                0x04, 0x02, 0x01, 0x00, 0x78, // cmd, slot, count, gg = 120
                0x03, 0xE8, // 1000 Hz
                0xFF, 0xE2, // -30 tenths
                0x00, 0x01, // Q 0.71 rounds to 1
            ]
        );
    }

    #[test]
    fn q_field_carries_unscaled_value() {
        let packet = encode_slot(0, 0.0, &[Filter::peaking(1000.0, 0.0, 1.0)], model());
        assert_eq!(packet[9..11], [0x00, 0x01]);
        let packet = encode_slot(0, 0.0, &[Filter::peaking(1000.0, 0.0, 4.0)], model());
        assert_eq!(packet[9..11], [0x00, 0x04]);
    }

    #[test]
    fn decode_slot_roundtrip() {
        let filters = vec![
            Filter::peaking(100.0, 2.5, 1.0),
            Filter::peaking(8000.0, -4.0, 2.0),
        ];
        let mut packet = encode_slot(1, -2.0, &filters, model());
        packet[0] = commands::EQ_SLOT_READ;
        let (slot, set) = decode_slot(&packet, model()).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(set.filters, filters);
        assert_eq!(set.global_gain, -2.0);
    }

    #[test]
    fn decode_slot_rejects_truncated_packet() {
        let packet = [commands::EQ_SLOT_READ, 0, 3, 0, 120, 0x03, 0xE8];
        assert!(matches!(
            decode_slot(&packet, model()),
            Err(Error::MalformedResponse(_))
        ));
        assert!(decode_slot(&[0x09, 0, 0, 0, 0], model()).is_err());
    }
}
