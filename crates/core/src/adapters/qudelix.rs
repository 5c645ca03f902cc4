//! Qudelix-style HID PEQ protocol.
//!
//! Commands travel in a length-prefixed envelope inside output report 0x08:
//!
//! ```text
//! [len, cmd_hi, cmd_lo, payload...]      len = 2 + payload length
//! ```
//!
//! Responses use the same envelope with bit 15 of the command id set. They
//! arrive on the device-to-host input report 0x09 when the device declares
//! it, otherwise on the shared report 0x08.
//!
//! A preset read is two-phase: the preset header carries the band count and
//! pre-gain, then each band is requested by index. Band fields are
//! big-endian; gain and pre-gain are two's-complement tenths of a dB, Q is
//! ×1000.

use super::{
    await_slot, interrogate, send, shared, AdapterCapabilities, AdapterConfig, BandAccumulator,
    Outbound, PeqAdapter,
};
use crate::codec::{ByteOrder, FilterTypeCodes, GainScale, QScale, SignEncoding};
use crate::correlator::await_condition;
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterSet, FilterType};
use crate::handle::DeviceHandle;
use crate::safety::{self, QLimits};
use crate::transport::{ReportListener, Transport};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Host-to-device report id, also the shared response id.
pub const OUT_REPORT_ID: u8 = 0x08;
/// Dedicated device-to-host report id.
pub const IN_REPORT_ID: u8 = 0x09;

/// Application command ids.
pub mod commands {
    pub const REQ_PRESET: u16 = 0x0301;
    pub const REQ_BAND: u16 = 0x0302;
    pub const SET_PRESET: u16 = 0x0303;
    pub const SET_BAND: u16 = 0x0304;
    pub const REQ_ACTIVE_PRESET: u16 = 0x0305;
    pub const SET_ACTIVE_PRESET: u16 = 0x0306;
    /// Set on every response command id.
    pub const RESPONSE_FLAG: u16 = 0x8000;
}

const ORDER: ByteOrder = ByteOrder::BigEndian;
const SIGN: SignEncoding = SignEncoding::TwosComplement;
const GAIN: GainScale = GainScale::TENTHS;
const Q: QScale = QScale::THOUSANDTHS;
const Q_LIMITS: QLimits = QLimits::new(0.1, 65.535);
const TYPES: FilterTypeCodes = FilterTypeCodes {
    low_shelf: 0x01,
    peaking: 0x02,
    high_shelf: 0x03,
};

/// Wrap a command in the length-prefixed envelope.
pub fn envelope(command: u16, payload: &[u8]) -> Vec<u8> {
    let cmd = ORDER.split_u16(command);
    let mut packet = Vec::with_capacity(3 + payload.len());
    packet.push((2 + payload.len()) as u8);
    packet.extend_from_slice(&cmd);
    packet.extend_from_slice(payload);
    packet
}

/// Unwrap an envelope into `(command, payload)`.
pub fn open_envelope(data: &[u8]) -> Result<(u16, &[u8])> {
    let (len, rest) = data
        .split_first()
        .ok_or_else(|| Error::MalformedResponse("Qudelix empty report".into()))?;
    let len = *len as usize;
    if len < 2 || rest.len() < len {
        return Err(Error::MalformedResponse(format!(
            "Qudelix envelope length {len} with {} bytes",
            rest.len()
        )));
    }
    let command = ORDER.join_u16([rest[0], rest[1]]);
    Ok((command, &rest[2..len]))
}

/// Response report id for a transport.
pub fn response_report_id(transport: &dyn Transport) -> u8 {
    if transport.input_report_ids().contains(&IN_REPORT_ID) {
        IN_REPORT_ID
    } else {
        OUT_REPORT_ID
    }
}

pub fn encode_band(slot: u8, index: u8, filter: &Filter) -> Vec<u8> {
    let freq = ORDER.split_u16(filter.freq.round() as u16);
    let gain = ORDER.split_u16(SIGN.encode(GAIN.encode(filter.effective_gain())));
    let q = ORDER.split_u16(Q.encode_u16(filter.q));
    vec![
        slot,
        index,
        TYPES.encode(filter.filter_type),
        freq[0],
        freq[1],
        gain[0],
        gain[1],
        q[0],
        q[1],
    ]
}

fn decode_band(payload: &[u8]) -> Result<(u8, u8, Filter)> {
    if payload.len() < 9 {
        return Err(Error::MalformedResponse(format!(
            "Qudelix band payload too short: {} bytes",
            payload.len()
        )));
    }
    let filter_type = TYPES.decode(payload[2]).unwrap_or(FilterType::Peaking);
    let freq = ORDER.join_u16([payload[3], payload[4]]) as f64;
    let gain = GAIN.decode(SIGN.decode(ORDER.join_u16([payload[5], payload[6]])));
    let q = Q.decode(ORDER.join_u16([payload[7], payload[8]]) as u32);
    Ok((
        payload[0],
        payload[1],
        Filter::new(filter_type, freq, gain, q),
    ))
}

pub fn encode_preset_header(slot: u8, count: usize, pregain: f64) -> Vec<u8> {
    let pg = ORDER.split_u16(SIGN.encode(GAIN.encode(pregain)));
    vec![slot, count as u8, pg[0], pg[1]]
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq)]
pub enum QudelixResponse {
    Preset {
        slot: u8,
        count: usize,
        pregain: f64,
    },
    Band {
        slot: u8,
        index: u8,
        filter: Filter,
    },
    ActivePreset(i32),
    Ack {
        command: u16,
        status: u8,
    },
}

pub fn parse_response(data: &[u8]) -> Result<QudelixResponse> {
    let (command, payload) = open_envelope(data)?;
    if command & commands::RESPONSE_FLAG == 0 {
        return Err(Error::MalformedResponse(format!(
            "Qudelix command 0x{command:04X} is not a response"
        )));
    }
    let short = || Error::MalformedResponse(format!("Qudelix 0x{command:04X} payload too short"));
    match command & !commands::RESPONSE_FLAG {
        commands::REQ_PRESET => match payload {
            [slot, count, hi, lo, ..] => Ok(QudelixResponse::Preset {
                slot: *slot,
                count: *count as usize,
                pregain: GAIN.decode(SIGN.decode(ORDER.join_u16([*hi, *lo]))),
            }),
            _ => Err(short()),
        },
        commands::REQ_BAND => {
            decode_band(payload).map(|(slot, index, filter)| QudelixResponse::Band {
                slot,
                index,
                filter,
            })
        }
        commands::REQ_ACTIVE_PRESET => payload
            .first()
            .map(|s| QudelixResponse::ActivePreset(*s as i32))
            .ok_or_else(short),
        cmd @ (commands::SET_PRESET | commands::SET_BAND | commands::SET_ACTIVE_PRESET) => payload
            .first()
            .map(|status| QudelixResponse::Ack {
                command: cmd,
                status: *status,
            })
            .ok_or_else(short),
        other => Err(Error::MalformedResponse(format!(
            "Qudelix unknown response 0x{other:04X}"
        ))),
    }
}

#[derive(Debug, Default)]
struct PresetState {
    expected: Option<usize>,
    pregain: Option<f64>,
    bands: BTreeMap<u8, Filter>,
}

impl BandAccumulator for PresetState {
    fn expected(&self) -> Option<usize> {
        self.expected
    }

    fn collected(&self) -> usize {
        self.bands.len()
    }

    fn header_ready(&self) -> bool {
        self.pregain.is_some()
    }
}

/// Adapter for Qudelix-style envelope devices.
#[derive(Debug, Clone, Default)]
pub struct QudelixAdapter {
    config: AdapterConfig,
}

impl QudelixAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    async fn command(&self, handle: &DeviceHandle, command: u16, payload: &[u8]) -> Result<()> {
        send(handle, &self.config, OUT_REPORT_ID, &envelope(command, payload)).await
    }
}

#[async_trait]
impl PeqAdapter for QudelixAdapter {
    fn name(&self) -> &'static str {
        "qudelix"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_explicit_read: true,
            supports_global_gain: true,
            supports_filter_types: true,
        }
    }

    async fn get_current_slot(&self, handle: &DeviceHandle) -> Result<i32> {
        let rx_id = response_report_id(handle.transport());
        let state = shared(None::<i32>);
        let sink = Arc::clone(&state);
        let _listener = ReportListener::spawn(handle.transport(), move |report| {
            if report.report_id != rx_id {
                return;
            }
            if let Ok(QudelixResponse::ActivePreset(slot)) = parse_response(&report.data) {
                *sink.lock() = Some(slot);
            }
        });
        self.command(handle, commands::REQ_ACTIVE_PRESET, &[]).await?;
        await_slot(handle, &self.config, &state).await
    }

    async fn pull_from_device(&self, handle: &DeviceHandle, slot: i32) -> Result<FilterSet> {
        let slot_id = safety::slot_byte(slot)?;
        let rx_id = response_report_id(handle.transport());
        let state = shared(PresetState::default());
        let sink = Arc::clone(&state);
        let _listener = ReportListener::spawn(handle.transport(), move |report| {
            if report.report_id != rx_id {
                return;
            }
            match parse_response(&report.data) {
                Ok(QudelixResponse::Preset {
                    slot,
                    count,
                    pregain,
                }) if slot == slot_id => {
                    let mut s = sink.lock();
                    s.expected = Some(count);
                    s.pregain = Some(pregain);
                }
                Ok(QudelixResponse::Band {
                    slot,
                    index,
                    filter,
                }) if slot == slot_id => {
                    sink.lock().bands.insert(index, filter);
                }
                Ok(other) => debug!(?other, "Ignoring unrelated response"),
                Err(e) => warn!(error = %e, "Discarding malformed report"),
            }
        });

        let count = interrogate(
            handle,
            &self.config,
            &state,
            vec![Outbound::new(
                OUT_REPORT_ID,
                envelope(commands::REQ_PRESET, &[slot_id]),
            )],
            |index| {
                Outbound::new(
                    OUT_REPORT_ID,
                    envelope(commands::REQ_BAND, &[slot_id, index as u8]),
                )
            },
            "Qudelix preset",
        )
        .await?;

        let s = state.lock();
        let filters = (0..count)
            .filter_map(|i| s.bands.get(&(i as u8)).copied())
            .collect();
        Ok(FilterSet::new(filters, s.pregain.unwrap_or(0.0)))
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
        let pregain = config.clamp_gain(global_gain);

        let rx_id = response_report_id(handle.transport());
        let acks = shared(Vec::<u8>::new());
        let sink = Arc::clone(&acks);
        let _listener = ReportListener::spawn(handle.transport(), move |report| {
            if report.report_id != rx_id {
                return;
            }
            if let Ok(QudelixResponse::Ack {
                command: commands::SET_PRESET | commands::SET_BAND,
                status,
            }) = parse_response(&report.data)
            {
                sink.lock().push(status);
            }
        });

        self.command(
            handle,
            commands::SET_PRESET,
            &encode_preset_header(slot_id, filters.len(), pregain),
        )
        .await?;
        for (index, filter) in filters.iter().enumerate() {
            self.command(
                handle,
                commands::SET_BAND,
                &encode_band(slot_id, index as u8, filter),
            )
            .await?;
        }

        let expected = filters.len() + 1;
        let statuses = await_condition(
            || acks.lock().len() >= expected,
            || acks.lock().clone(),
            self.config.wait(self.config.write_timeout),
            handle.cancel_token(),
        )
        .await
        .map_err(|e| e.into_error("Qudelix write acks", handle.transport_id()))?;

        if let Some(bad) = statuses.iter().find(|s| **s != 0) {
            return Err(Error::WriteFailed(format!(
                "Qudelix rejected preset {slot} write (status {bad})"
            )));
        }
        info!(slot, bands = filters.len(), pregain, "Qudelix preset written");
        Ok(config.disconnect_on_save)
    }

    async fn enable_peq(&self, handle: &DeviceHandle, enabled: bool, slot_id: i32) -> Result<()> {
        let config = handle.model_config();
        let target = if enabled {
            slot_id
        } else {
            config.disabled_preset_id
        };
        self.command(
            handle,
            commands::SET_ACTIVE_PRESET,
            &[safety::slot_byte(target)?],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn response(command: u16, payload: &[u8]) -> Vec<u8> {
        envelope(command | commands::RESPONSE_FLAG, payload)
    }

    #[test]
    fn envelope_layout() {
        assert_eq!(
            envelope(commands::REQ_BAND, &[1, 4]),
            vec![0x04, 0x03, 0x02, 0x01, 0x04]
        );
        let (cmd, payload) = open_envelope(&[0x04, 0x03, 0x02, 0x01, 0x04, 0x00, 0x00]).unwrap();
        assert_eq!(cmd, commands::REQ_BAND);
        assert_eq!(payload, &[1, 4]);
    }

    #[test]
    fn open_envelope_rejects_bad_length() {
        assert!(open_envelope(&[]).is_err());
        assert!(open_envelope(&[0x01, 0x03]).is_err());
        assert!(open_envelope(&[0x08, 0x03, 0x02]).is_err());
    }

    #[test]
    fn band_roundtrip_through_response() {
        let f = Filter::new(FilterType::HighShelf, 10_000.0, -6.5, 0.707);
        let parsed = parse_response(&response(commands::REQ_BAND, &encode_band(2, 5, &f))).unwrap();
        assert_eq!(
            parsed,
            QudelixResponse::Band {
                slot: 2,
                index: 5,
                filter: f,
            }
        );
    }

    #[test]
    fn requests_are_not_responses() {
        assert!(parse_response(&envelope(commands::REQ_PRESET, &[0])).is_err());
    }

    #[test]
    fn preset_header_and_ack() {
        let parsed =
            parse_response(&response(commands::REQ_PRESET, &encode_preset_header(1, 3, -2.0)))
                .unwrap();
        assert_eq!(
            parsed,
            QudelixResponse::Preset {
                slot: 1,
                count: 3,
                pregain: -2.0,
            }
        );
        assert_eq!(
            parse_response(&response(commands::SET_BAND, &[0])).unwrap(),
            QudelixResponse::Ack {
                command: commands::SET_BAND,
                status: 0,
            }
        );
    }

    #[test]
    fn response_report_id_prefers_device_to_host() {
        let shared_only = MockTransport::new("hid-0");
        assert_eq!(response_report_id(&shared_only), OUT_REPORT_ID);
        let dedicated = MockTransport::new("hid-1").with_input_report_ids(&[0x08, 0x09]);
        assert_eq!(response_report_id(&dedicated), IN_REPORT_ID);
    }
}
