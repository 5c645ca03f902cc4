//! FiiO / JadeAudio HID PEQ protocol.
//!
//! Packet layout (report id 7):
//!
//! ```text
//! [hdr1, hdr2, 0x00, 0x00, command, payload_len, payload..., 0xEE]
//! ```
//!
//! - set header `0xAA 0x0A`, get header `0xBB 0x0B`; responses carry the get
//!   header and echo the command byte
//! - commands: filter-params 0x15, preset-switch 0x16, global-gain 0x17,
//!   filter-count 0x18, save 0x19
//! - band payload: `index, gain(2), freq(2), q(2), type`, all little-endian;
//!   gain in sign-folded tenths of a dB, Q ×100
//! - global gain payload: sign-folded tenths of a dB, high byte first
//!
//! Reading is two-phase: the filter count arrives first, then one request is
//! issued per band index.

use super::{
    await_slot, interrogate, send, shared, AdapterCapabilities, AdapterConfig, BandAccumulator,
    Outbound, PeqAdapter,
};
use crate::codec::{ByteOrder, FilterTypeCodes, GainScale, QScale, SignEncoding};
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterSet, FilterType};
use crate::handle::DeviceHandle;
use crate::safety::{self, QLimits};
use crate::transport::ReportListener;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const REPORT_ID: u8 = 7;
pub const SET_HEADER: [u8; 2] = [0xAA, 0x0A];
pub const GET_HEADER: [u8; 2] = [0xBB, 0x0B];
pub const END_MARKER: u8 = 0xEE;

/// FiiO command bytes.
pub mod commands {
    pub const FILTER_PARAMS: u8 = 0x15;
    pub const PRESET_SWITCH: u8 = 0x16;
    pub const GLOBAL_GAIN: u8 = 0x17;
    pub const FILTER_COUNT: u8 = 0x18;
    pub const SAVE: u8 = 0x19;
}

const GAIN: GainScale = GainScale::TENTHS;
const SIGN: SignEncoding = SignEncoding::SignFold;
const Q: QScale = QScale::HUNDREDTHS;
const BAND_ORDER: ByteOrder = ByteOrder::LittleEndian;
const GLOBAL_ORDER: ByteOrder = ByteOrder::BigEndian;
const TYPES: FilterTypeCodes = FilterTypeCodes::FIIO;
const Q_LIMITS: QLimits = QLimits::new(0.1, 655.35);

/// Offset of the command byte in a packet.
const COMMAND_OFFSET: usize = 4;
/// Offset of the payload length byte.
const LENGTH_OFFSET: usize = 5;
/// Offset of the first payload byte.
const PAYLOAD_OFFSET: usize = 6;

/// Build a complete packet.
pub fn build_packet(header: [u8; 2], command: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(PAYLOAD_OFFSET + payload.len() + 1);
    packet.extend_from_slice(&header);
    packet.extend_from_slice(&[0x00, 0x00, command, payload.len() as u8]);
    packet.extend_from_slice(payload);
    packet.push(END_MARKER);
    packet
}

/// Band payload: `index, gain(2), freq(2), q(2), type`.
pub fn encode_band(index: u8, filter: &Filter) -> Vec<u8> {
    let gain = BAND_ORDER.split_u16(SIGN.encode(GAIN.encode(filter.effective_gain())));
    let freq = BAND_ORDER.split_u16(filter.freq.round() as u16);
    let q = BAND_ORDER.split_u16(Q.encode_u16(filter.q));
    vec![
        index,
        gain[0],
        gain[1],
        freq[0],
        freq[1],
        q[0],
        q[1],
        TYPES.encode(filter.filter_type),
    ]
}

fn decode_band(payload: &[u8]) -> Result<(u8, Filter)> {
    if payload.len() < 8 {
        return Err(Error::MalformedResponse(format!(
            "FiiO band payload too short: {} bytes",
            payload.len()
        )));
    }
    let gain = GAIN.decode(SIGN.decode(BAND_ORDER.join_u16([payload[1], payload[2]])));
    let freq = BAND_ORDER.join_u16([payload[3], payload[4]]) as f64;
    let q = Q.decode(BAND_ORDER.join_u16([payload[5], payload[6]]) as u32);
    let filter_type = TYPES.decode(payload[7]).unwrap_or_else(|| {
        debug!(code = payload[7], "Unknown FiiO filter type, assuming peaking");
        FilterType::Peaking
    });
    Ok((payload[0], Filter::new(filter_type, freq, gain, q)))
}

/// Global gain payload, high byte first.
pub fn encode_global_gain(gain: f64) -> [u8; 2] {
    GLOBAL_ORDER.split_u16(SIGN.encode(GAIN.encode(gain)))
}

fn decode_global_gain(payload: &[u8]) -> Result<f64> {
    match payload {
        [hi, lo, ..] => Ok(GAIN.decode(SIGN.decode(GLOBAL_ORDER.join_u16([*hi, *lo])))),
        _ => Err(Error::MalformedResponse(
            "FiiO global gain payload too short".into(),
        )),
    }
}

/// A decoded get-response.
#[derive(Debug, Clone, PartialEq)]
pub enum FiioResponse {
    FilterCount(usize),
    GlobalGain(f64),
    Band { index: u8, filter: Filter },
    Preset(i32),
}

/// Decode an inbound report. Reports without the get header are malformed.
pub fn parse_response(data: &[u8]) -> Result<FiioResponse> {
    if data.len() <= PAYLOAD_OFFSET {
        return Err(Error::MalformedResponse(format!(
            "FiiO report too short: {} bytes",
            data.len()
        )));
    }
    if data[..2] != GET_HEADER {
        return Err(Error::MalformedResponse(format!(
            "FiiO header mismatch: {:02X?}",
            &data[..2]
        )));
    }
    let len = data[LENGTH_OFFSET] as usize;
    let payload = data
        .get(PAYLOAD_OFFSET..PAYLOAD_OFFSET + len)
        .ok_or_else(|| Error::MalformedResponse(format!("FiiO payload length {len} overruns")))?;

    match data[COMMAND_OFFSET] {
        commands::FILTER_COUNT => payload
            .first()
            .map(|n| FiioResponse::FilterCount(*n as usize))
            .ok_or_else(|| Error::MalformedResponse("FiiO filter count empty".into())),
        commands::GLOBAL_GAIN => decode_global_gain(payload).map(FiioResponse::GlobalGain),
        commands::FILTER_PARAMS => {
            decode_band(payload).map(|(index, filter)| FiioResponse::Band { index, filter })
        }
        commands::PRESET_SWITCH => payload
            .first()
            .map(|p| FiioResponse::Preset(*p as i32))
            .ok_or_else(|| Error::MalformedResponse("FiiO preset empty".into())),
        other => Err(Error::MalformedResponse(format!(
            "FiiO unknown command 0x{other:02X}"
        ))),
    }
}

#[derive(Debug, Default)]
struct PullState {
    expected: Option<usize>,
    bands: BTreeMap<u8, Filter>,
    global_gain: Option<f64>,
}

impl BandAccumulator for PullState {
    fn expected(&self) -> Option<usize> {
        self.expected
    }

    fn collected(&self) -> usize {
        self.bands.len()
    }

    fn header_ready(&self) -> bool {
        self.global_gain.is_some()
    }
}

/// Adapter for FiiO and JadeAudio dongles, DAPs and Bluetooth receivers.
#[derive(Debug, Clone, Default)]
pub struct FiioAdapter {
    config: AdapterConfig,
}

impl FiioAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    async fn set(&self, handle: &DeviceHandle, command: u8, payload: &[u8]) -> Result<()> {
        let packet = build_packet(SET_HEADER, command, payload);
        send(handle, &self.config, REPORT_ID, &packet).await
    }
}

#[async_trait]
impl PeqAdapter for FiioAdapter {
    fn name(&self) -> &'static str {
        "fiio"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_explicit_read: true,
            supports_global_gain: true,
            supports_filter_types: true,
        }
    }

    async fn get_current_slot(&self, handle: &DeviceHandle) -> Result<i32> {
        let state = shared(None::<i32>);
        let sink = Arc::clone(&state);
        let _listener = ReportListener::spawn(handle.transport(), move |report| {
            if let Ok(FiioResponse::Preset(p)) = parse_response(&report.data) {
                *sink.lock() = Some(p);
            }
        });

        let packet = build_packet(GET_HEADER, commands::PRESET_SWITCH, &[]);
        send(handle, &self.config, REPORT_ID, &packet).await?;
        await_slot(handle, &self.config, &state).await
    }

    /// Reads the active bank; FiiO devices expose no per-slot read.
    async fn pull_from_device(&self, handle: &DeviceHandle, slot: i32) -> Result<FilterSet> {
        debug!(slot, "FiiO pull (active bank)");
        let state = shared(PullState::default());
        let sink = Arc::clone(&state);
        let _listener = ReportListener::spawn(handle.transport(), move |report| {
            match parse_response(&report.data) {
                Ok(FiioResponse::FilterCount(n)) => sink.lock().expected = Some(n),
                Ok(FiioResponse::GlobalGain(g)) => sink.lock().global_gain = Some(g),
                Ok(FiioResponse::Band { index, filter }) => {
                    sink.lock().bands.insert(index, filter);
                }
                Ok(FiioResponse::Preset(_)) => {}
                Err(e) => warn!(error = %e, "Discarding malformed report"),
            }
        });

        let count = interrogate(
            handle,
            &self.config,
            &state,
            vec![
                Outbound::new(
                    REPORT_ID,
                    build_packet(GET_HEADER, commands::FILTER_COUNT, &[]),
                ),
                Outbound::new(
                    REPORT_ID,
                    build_packet(GET_HEADER, commands::GLOBAL_GAIN, &[]),
                ),
            ],
            |index| {
                Outbound::new(
                    REPORT_ID,
                    build_packet(GET_HEADER, commands::FILTER_PARAMS, &[index as u8]),
                )
            },
            "FiiO filter bank",
        )
        .await?;

        let s = state.lock();
        let filters = (0..count)
            .filter_map(|i| s.bands.get(&(i as u8)).copied())
            .collect();
        Ok(FilterSet::new(filters, s.global_gain.unwrap_or(0.0)))
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

        self.set(handle, commands::FILTER_COUNT, &[filters.len() as u8])
            .await?;
        for (index, filter) in filters.iter().enumerate() {
            self.set(
                handle,
                commands::FILTER_PARAMS,
                &encode_band(index as u8, filter),
            )
            .await?;
        }
        self.set(handle, commands::GLOBAL_GAIN, &encode_global_gain(global_gain))
            .await?;
        self.set(handle, commands::SAVE, &[slot_id]).await?;

        info!(
            slot,
            bands = filters.len(),
            global_gain,
            "FiiO PEQ saved"
        );
        Ok(config.disconnect_on_save)
    }

    async fn enable_peq(&self, handle: &DeviceHandle, enabled: bool, slot_id: i32) -> Result<()> {
        let config = handle.model_config();
        let target = if enabled {
            slot_id
        } else {
            config.disabled_preset_id
        };
        if target < 0 {
            warn!(enabled, slot_id, "No preset to switch to on this model");
            return Ok(());
        }
        self.set(handle, commands::PRESET_SWITCH, &[safety::slot_byte(target)?])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(command: u8, payload: &[u8]) -> Vec<u8> {
        build_packet(GET_HEADER, command, payload)
    }

    #[test]
    fn packet_framing() {
        let p = build_packet(SET_HEADER, commands::SAVE, &[7]);
        assert_eq!(p, vec![0xAA, 0x0A, 0x00, 0x00, 0x19, 0x01, 0x07, 0xEE]);
    }

    #[test]
    fn band_encoding_bytes() {
        // 1000 Hz = 0x03E8, -5.0 dB = -50 = 0xFFCE, Q 1.41 = 141 = 0x008D
        let f = Filter::new(FilterType::LowShelf, 1000.0, -5.0, 1.41);
        assert_eq!(
            encode_band(2, &f),
            vec![0x02, 0xCE, 0xFF, 0xE8, 0x03, 0x8D, 0x00, 0x01]
        );
    }

    #[test]
    fn disabled_band_encodes_zero_gain() {
        let mut f = Filter::peaking(500.0, 6.0, 1.0);
        f.disabled = true;
        let payload = encode_band(0, &f);
        assert_eq!(&payload[1..3], &[0x00, 0x00]);
    }

    #[test]
    fn global_gain_is_high_byte_first() {
        assert_eq!(encode_global_gain(-1.5), [0xFF, 0xF1]);
        assert_eq!(encode_global_gain(3.0), [0x00, 0x1E]);
    }

    #[test]
    fn parse_band_response() {
        let payload = encode_band(1, &Filter::peaking(125.0, 5.0, 1.0));
        let parsed = parse_response(&response(commands::FILTER_PARAMS, &payload)).unwrap();
        assert_eq!(
            parsed,
            FiioResponse::Band {
                index: 1,
                filter: Filter::peaking(125.0, 5.0, 1.0),
            }
        );
    }

    #[test]
    fn parse_count_gain_and_preset() {
        assert_eq!(
            parse_response(&response(commands::FILTER_COUNT, &[4])).unwrap(),
            FiioResponse::FilterCount(4)
        );
        assert_eq!(
            parse_response(&response(commands::GLOBAL_GAIN, &[0xFF, 0xF1])).unwrap(),
            FiioResponse::GlobalGain(-1.5)
        );
        assert_eq!(
            parse_response(&response(commands::PRESET_SWITCH, &[160])).unwrap(),
            FiioResponse::Preset(160)
        );
    }

    #[test]
    fn parse_rejects_set_header_and_garbage() {
        let set = build_packet(SET_HEADER, commands::FILTER_COUNT, &[3]);
        assert!(matches!(
            parse_response(&set),
            Err(Error::MalformedResponse(_))
        ));
        assert!(parse_response(&[0xBB, 0x0B, 0x00]).is_err());
        let overrun = [0xBB, 0x0B, 0x00, 0x00, 0x15, 0x08, 0x01, 0xEE];
        assert!(parse_response(&overrun).is_err());
        assert!(parse_response(&response(0x42, &[1])).is_err());
    }

    #[test]
    fn zero_q_field_decodes_to_unity() {
        let payload = [0x00, 0x00, 0x00, 0xE8, 0x03, 0x00, 0x00, 0x00];
        let (_, f) = decode_band(&payload).unwrap();
        assert_eq!(f.q, 1.0);
    }
}
