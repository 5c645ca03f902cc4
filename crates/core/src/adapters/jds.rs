//! JDS Labs text protocol over a USB serial byte stream.
//!
//! Commands and replies are ASCII lines terminated by `\n` (some firmware
//! ends replies with NUL instead):
//!
//! ```text
//! PEQ:GET_EQ:<slot>                   -> PEQ:EQ:<slot>:<i,f,g,q;...>
//! PEQ:SET_EQ:<slot>:<i,f,g,q;...>     -> OK | ERR:<text>
//! PEQ:GET_SLOT                        -> PEQ:SLOT:<n>
//! PEQ:SET_SLOT:<n>                    -> OK
//! PEQ:ENABLE:<0|1>                    -> OK
//! ```
//!
//! Bands are peaking only and there is no global gain.

use super::{await_slot, send, shared, AdapterCapabilities, AdapterConfig, PeqAdapter};
use crate::correlator::await_condition;
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterSet, FilterType};
use crate::handle::DeviceHandle;
use crate::safety::{self, QLimits};
use crate::transport::{ReportListener, TransportKind};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Serial transports ignore the report id.
const STREAM_REPORT_ID: u8 = 0x00;
const Q_LIMITS: QLimits = QLimits::new(0.001, 100.0);

/// Reassembles terminated lines from arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == 0 {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                if !line.is_empty() {
                    lines.push(line);
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }
}

/// A decoded reply line.
#[derive(Debug, Clone, PartialEq)]
pub enum JdsReply {
    Eq { slot: i32, filters: Vec<Filter> },
    Slot(i32),
    Ok,
    Err(String),
}

pub fn command_line(command: &str) -> Vec<u8> {
    let mut line = command.as_bytes().to_vec();
    line.push(b'\n');
    line
}

/// `i,f,g,q;...` with frequency in whole Hz, gain in tenths and Q in
/// thousandths.
pub fn format_filter_list(filters: &[Filter]) -> String {
    filters
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{i},{:.0},{:.1},{:.3}", f.freq, f.effective_gain(), f.q))
        .collect::<Vec<_>>()
        .join(";")
}

/// Parse a semicolon-delimited band list, ordered by band index.
pub fn parse_filter_list(list: &str) -> Result<Vec<Filter>> {
    let mut bands = Vec::new();
    for entry in list.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let fields: Vec<&str> = entry.split(',').map(str::trim).collect();
        let [index, freq, gain, q] = fields.as_slice() else {
            return Err(Error::MalformedResponse(format!("JDS band entry: {entry:?}")));
        };
        let number = |s: &str| {
            s.parse::<f64>()
                .map_err(|_| Error::MalformedResponse(format!("JDS band field {s:?} in {entry:?}")))
        };
        let index = index
            .parse::<usize>()
            .map_err(|_| Error::MalformedResponse(format!("JDS band index in {entry:?}")))?;
        let q = number(*q)?;
        let q = if q == 0.0 { 1.0 } else { q };
        bands.push((index, Filter::peaking(number(*freq)?, number(*gain)?, q)));
    }
    bands.sort_by_key(|(index, _)| *index);
    Ok(bands.into_iter().map(|(_, f)| f).collect())
}

pub fn parse_reply(line: &str) -> Result<JdsReply> {
    let bad = || Error::MalformedResponse(format!("JDS reply: {line:?}"));
    if line == "OK" {
        return Ok(JdsReply::Ok);
    }
    if let Some(text) = line.strip_prefix("ERR:") {
        return Ok(JdsReply::Err(text.to_string()));
    }
    if let Some(n) = line.strip_prefix("PEQ:SLOT:") {
        return n.trim().parse().map(JdsReply::Slot).map_err(|_| bad());
    }
    if let Some(rest) = line.strip_prefix("PEQ:EQ:") {
        let (slot, list) = rest.split_once(':').unwrap_or((rest, ""));
        let slot = slot.trim().parse().map_err(|_| bad())?;
        return Ok(JdsReply::Eq {
            slot,
            filters: parse_filter_list(list)?,
        });
    }
    Err(bad())
}

/// Adapter for JDS Labs serial DSP devices.
#[derive(Debug, Clone, Default)]
pub struct JdsAdapter {
    config: AdapterConfig,
}

impl JdsAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    async fn write_line(&self, handle: &DeviceHandle, command: &str) -> Result<()> {
        debug!(command, "JDS command");
        send(handle, &self.config, STREAM_REPORT_ID, &command_line(command)).await
    }

    /// Spawn a listener that decodes reply lines and hands them to `on_reply`.
    fn listen<F>(handle: &DeviceHandle, mut on_reply: F) -> ReportListener
    where
        F: FnMut(JdsReply) + Send + 'static,
    {
        let mut lines = LineAssembler::default();
        ReportListener::spawn(handle.transport(), move |report| {
            for line in lines.push(&report.data) {
                match parse_reply(&line) {
                    Ok(reply) => on_reply(reply),
                    Err(e) => warn!(error = %e, "Discarding line"),
                }
            }
        })
    }
}

#[async_trait]
impl PeqAdapter for JdsAdapter {
    fn name(&self) -> &'static str {
        "jds-labs"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_explicit_read: true,
            supports_global_gain: false,
            supports_filter_types: false,
        }
    }

    fn transport_kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn get_current_slot(&self, handle: &DeviceHandle) -> Result<i32> {
        let state = shared(None::<i32>);
        let sink = Arc::clone(&state);
        let _listener = Self::listen(handle, move |reply| {
            if let JdsReply::Slot(n) = reply {
                *sink.lock() = Some(n);
            }
        });
        self.write_line(handle, "PEQ:GET_SLOT").await?;
        await_slot(handle, &self.config, &state).await
    }

    async fn pull_from_device(&self, handle: &DeviceHandle, slot: i32) -> Result<FilterSet> {
        let slot_id = safety::slot_byte(slot)? as i32;
        let state = shared(None::<Vec<Filter>>);
        let sink = Arc::clone(&state);
        let _listener = Self::listen(handle, move |reply| match reply {
            JdsReply::Eq { slot, filters } if slot == slot_id => *sink.lock() = Some(filters),
            other => debug!(?other, "Ignoring reply"),
        });

        self.write_line(handle, &format!("PEQ:GET_EQ:{slot_id}"))
            .await?;

        let filters = await_condition(
            || state.lock().is_some(),
            || state.lock().take(),
            self.config.wait(self.config.read_timeout),
            handle.cancel_token(),
        )
        .await
        .map_err(|e| e.into_error("JDS EQ read", handle.transport_id()))?
        .unwrap_or_default();

        Ok(FilterSet::new(filters, 0.0))
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
        if global_gain != 0.0 {
            debug!(global_gain, "JDS has no global gain; ignored");
        }
        if filters.iter().any(|f| f.filter_type != FilterType::Peaking) {
            debug!("Shelf bands written as peaking");
        }

        let state = shared(None::<JdsReply>);
        let sink = Arc::clone(&state);
        let _listener = Self::listen(handle, move |reply| {
            if matches!(reply, JdsReply::Ok | JdsReply::Err(_)) {
                *sink.lock() = Some(reply);
            }
        });

        self.write_line(
            handle,
            &format!("PEQ:SET_EQ:{slot_id}:{}", format_filter_list(&filters)),
        )
        .await?;

        let reply = await_condition(
            || state.lock().is_some(),
            || state.lock().take(),
            self.config.wait(self.config.write_timeout),
            handle.cancel_token(),
        )
        .await
        .map_err(|e| e.into_error("JDS EQ write", handle.transport_id()))?;

        match reply {
            Some(JdsReply::Ok) => {
                info!(slot, bands = filters.len(), "JDS EQ written");
                Ok(config.disconnect_on_save)
            }
            Some(JdsReply::Err(text)) => Err(Error::WriteFailed(format!("JDS: {text}"))),
            other => Err(Error::MalformedResponse(format!(
                "JDS write reply: {other:?}"
            ))),
        }
    }

    async fn enable_peq(&self, handle: &DeviceHandle, enabled: bool, slot_id: i32) -> Result<()> {
        if enabled && slot_id >= 0 {
            self.write_line(handle, &format!("PEQ:SET_SLOT:{slot_id}"))
                .await?;
        }
        self.write_line(handle, &format!("PEQ:ENABLE:{}", u8::from(enabled)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks() {
        let mut lines = LineAssembler::default();
        assert!(lines.push(b"PEQ:SL").is_empty());
        assert_eq!(lines.push(b"OT:2\nO"), vec!["PEQ:SLOT:2".to_string()]);
        assert_eq!(lines.push(b"K\0\r\n"), vec!["OK".to_string()]);
    }

    #[test]
    fn parse_eq_reply_orders_by_index() {
        let reply = parse_reply("PEQ:EQ:1:1,250,-2.0,0.707;0,100,3.5,1.000").unwrap();
        assert_eq!(
            reply,
            JdsReply::Eq {
                slot: 1,
                filters: vec![
                    Filter::peaking(100.0, 3.5, 1.0),
                    Filter::peaking(250.0, -2.0, 0.707),
                ],
            }
        );
    }

    #[test]
    fn parse_empty_eq_list() {
        assert_eq!(
            parse_reply("PEQ:EQ:0:").unwrap(),
            JdsReply::Eq {
                slot: 0,
                filters: vec![],
            }
        );
    }

    #[test]
    fn parse_status_replies() {
        assert_eq!(parse_reply("OK").unwrap(), JdsReply::Ok);
        assert_eq!(parse_reply("PEQ:SLOT:-1").unwrap(), JdsReply::Slot(-1));
        assert_eq!(
            parse_reply("ERR:bad slot").unwrap(),
            JdsReply::Err("bad slot".into())
        );
        assert!(parse_reply("HELLO").is_err());
        assert!(parse_reply("PEQ:EQ:0:1,2,3").is_err());
    }

    #[test]
    fn filter_list_format() {
        let mut muted = Filter::peaking(8000.0, 4.0, 2.0);
        muted.disabled = true;
        let list = format_filter_list(&[Filter::peaking(1000.0, -3.24, 0.7071), muted]);
        assert_eq!(list, "0,1000,-3.2,0.707;1,8000,0.0,2.000");
        assert_eq!(
            command_line("PEQ:GET_SLOT"),
            b"PEQ:GET_SLOT\n".to_vec()
        );
    }
}
