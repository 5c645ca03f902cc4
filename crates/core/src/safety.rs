//! Safety layer: clamps every band to what the device can store before any
//! packet is built.
//!
//! ## Invariants
//! 1. Filter lists longer than `max_filters` are truncated, never rejected
//! 2. Gain is clamped to the model's `[min_gain, max_gain]`
//! 3. Frequency is clamped to 20 to 20000 Hz
//! 4. Q is clamped to the vendor's encodable range so the fixed-point field
//!    cannot overflow
//! 5. Slot ids are range-checked against the wire field width

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::registry::DeviceModelConfig;
use tracing::debug;

pub const MIN_FREQ_HZ: f64 = 20.0;
pub const MAX_FREQ_HZ: f64 = 20000.0;

/// Encodable Q interval of a vendor format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QLimits {
    pub min: f64,
    pub max: f64,
}

impl QLimits {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

pub fn clamp_freq(freq: f64) -> f64 {
    freq.clamp(MIN_FREQ_HZ, MAX_FREQ_HZ)
}

/// Clamp one band to model and vendor limits.
pub fn clamp_filter(filter: &Filter, config: &DeviceModelConfig, q: QLimits) -> Filter {
    Filter {
        freq: clamp_freq(filter.freq),
        gain: config.clamp_gain(filter.gain),
        q: filter.q.clamp(q.min, q.max),
        ..*filter
    }
}

/// Truncate to `max_filters` and clamp every band.
pub fn prepare_filters(filters: &[Filter], config: &DeviceModelConfig, q: QLimits) -> Vec<Filter> {
    if filters.len() > config.max_filters {
        debug!(
            requested = filters.len(),
            max_filters = config.max_filters,
            "Truncating filter list"
        );
    }
    filters
        .iter()
        .take(config.max_filters)
        .map(|f| clamp_filter(f, config, q))
        .collect()
}

/// Check a slot id fits a single-byte wire field.
pub fn slot_byte(slot: i32) -> Result<u8> {
    u8::try_from(slot).map_err(|_| Error::OutOfRange {
        field: "slot",
        value: slot as f64,
        min: 0.0,
        max: u8::MAX as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterType;
    use crate::registry::get_model_config;

    const Q: QLimits = QLimits::new(0.1, 20.0);

    #[test]
    fn truncates_to_max_filters() {
        let cfg = get_model_config("FiiO", "default");
        let filters = vec![Filter::peaking(1000.0, 1.0, 1.0); 8];
        let prepared = prepare_filters(&filters, cfg, Q);
        assert_eq!(prepared.len(), cfg.max_filters);
    }

    #[test]
    fn clamps_gain_freq_and_q() {
        let cfg = get_model_config("FiiO", "default");
        let wild = Filter::new(FilterType::HighShelf, 5.0, 40.0, 100.0);
        let clamped = clamp_filter(&wild, cfg, Q);
        assert_eq!(clamped.freq, MIN_FREQ_HZ);
        assert_eq!(clamped.gain, cfg.max_gain);
        assert_eq!(clamped.q, 20.0);
        assert_eq!(clamped.filter_type, FilterType::HighShelf);

        let low = Filter::peaking(30_000.0, -40.0, 0.0);
        let clamped = clamp_filter(&low, cfg, Q);
        assert_eq!(clamped.freq, MAX_FREQ_HZ);
        assert_eq!(clamped.gain, cfg.min_gain);
        assert_eq!(clamped.q, 0.1);
    }

    #[test]
    fn clamping_keeps_disabled_flag() {
        let cfg = get_model_config("FiiO", "default");
        let mut f = Filter::peaking(1000.0, 3.0, 1.0);
        f.disabled = true;
        assert!(clamp_filter(&f, cfg, Q).disabled);
    }

    #[test]
    fn slot_byte_range() {
        assert_eq!(slot_byte(160).unwrap(), 160);
        assert!(slot_byte(-1).is_err());
        assert!(slot_byte(256).is_err());
    }
}
