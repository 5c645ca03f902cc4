//! Vendor-neutral PEQ filter model.

use serde::{Deserialize, Serialize};

/// Biquad shape of a single band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FilterType {
    /// Peaking (bell) filter.
    #[default]
    #[serde(rename = "PK")]
    Peaking,
    /// Low shelf.
    #[serde(rename = "LSQ")]
    LowShelf,
    /// High shelf.
    #[serde(rename = "HSQ")]
    HighShelf,
}

impl FilterType {
    /// Short label used by EQ tools ("PK", "LSQ", "HSQ").
    pub fn label(&self) -> &'static str {
        match self {
            Self::Peaking => "PK",
            Self::LowShelf => "LSQ",
            Self::HighShelf => "HSQ",
        }
    }
}

impl std::fmt::Display for FilterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One band of a PEQ filter bank.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(rename = "type")]
    pub filter_type: FilterType,
    /// Center (or corner) frequency in Hz.
    pub freq: f64,
    /// Gain in dB.
    pub gain: f64,
    /// Quality factor, always > 0.
    pub q: f64,
    #[serde(default)]
    pub disabled: bool,
}

impl Filter {
    pub fn new(filter_type: FilterType, freq: f64, gain: f64, q: f64) -> Self {
        Self {
            filter_type,
            freq,
            gain,
            q,
            disabled: false,
        }
    }

    pub fn peaking(freq: f64, gain: f64, q: f64) -> Self {
        Self::new(FilterType::Peaking, freq, gain, q)
    }

    /// Gain as it should reach a device without a per-band enable flag.
    pub fn effective_gain(&self) -> f64 {
        if self.disabled {
            0.0
        } else {
            self.gain
        }
    }
}

/// An ordered filter bank plus the overall (pre)gain.
///
/// Band index is positional: `filters[i]` is band `i` on the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSet {
    pub filters: Vec<Filter>,
    pub global_gain: f64,
}

impl FilterSet {
    pub fn new(filters: Vec<Filter>, global_gain: f64) -> Self {
        Self {
            filters,
            global_gain,
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_serialized_label() {
        for t in [FilterType::Peaking, FilterType::LowShelf, FilterType::HighShelf] {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{t}\""));
        }
    }

    #[test]
    fn disabled_filter_has_zero_effective_gain() {
        let mut f = Filter::peaking(1000.0, 4.5, 1.0);
        assert_eq!(f.effective_gain(), 4.5);
        f.disabled = true;
        assert_eq!(f.effective_gain(), 0.0);
    }

    #[test]
    fn filter_serializes_with_short_type_labels() {
        let f = Filter::new(FilterType::LowShelf, 105.0, 3.0, 0.7);
        let json = serde_json::to_string(&f).expect("serialize filter");
        assert!(json.contains("\"type\":\"LSQ\""));
        let back: Filter = serde_json::from_str(&json).expect("deserialize filter");
        assert_eq!(back, f);
    }
}
