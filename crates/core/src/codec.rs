//! Numeric wire toolkit shared by the vendor adapters.
//!
//! Every vendor stores band parameters as small fixed-point integers, but each
//! picks its own scale, sign convention and byte order:
//!
//! | Quantity | Encodings in use |
//! |---|---|
//! | gain | tenths of a dB, half-dB steps, 16.16 fixed-point dB |
//! | Q | ×100, ×1000, ×10000 |
//! | sign | two's complement, sign-fold (`(|v| ^ 0xFFFF) + 1`) |
//! | order | big-endian, little-endian |
//!
//! The pieces here are combined per adapter; nothing in this module knows
//! about a particular device.

use crate::filter::FilterType;

/// How a signed quantity is folded into an unsigned 16-bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignEncoding {
    /// Plain 16-bit two's complement.
    TwosComplement,
    /// Magnitude XOR 0xFFFF plus one for negatives, decoded by testing bit 15.
    SignFold,
}

impl SignEncoding {
    /// Encode a signed value, saturating at the 16-bit signed range.
    pub fn encode(self, value: i32) -> u16 {
        match self {
            Self::TwosComplement => {
                let v = value.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                v as u16
            }
            Self::SignFold => {
                let v = value.clamp(-(i16::MAX as i32), i16::MAX as i32);
                if v < 0 {
                    ((v.unsigned_abs() as u16) ^ 0xFFFF).wrapping_add(1)
                } else {
                    v as u16
                }
            }
        }
    }

    /// Decode a 16-bit field back into a signed value.
    pub fn decode(self, raw: u16) -> i32 {
        match self {
            Self::TwosComplement => raw as i16 as i32,
            Self::SignFold => {
                if raw & 0x8000 != 0 {
                    -(((raw ^ 0xFFFF).wrapping_add(1)) as i32)
                } else {
                    raw as i32
                }
            }
        }
    }
}

/// Byte order of a multi-byte field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    pub fn split_u16(self, value: u16) -> [u8; 2] {
        match self {
            Self::BigEndian => value.to_be_bytes(),
            Self::LittleEndian => value.to_le_bytes(),
        }
    }

    pub fn join_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Self::BigEndian => u16::from_be_bytes(bytes),
            Self::LittleEndian => u16::from_le_bytes(bytes),
        }
    }

    pub fn split_u32(self, value: u32) -> [u8; 4] {
        match self {
            Self::BigEndian => value.to_be_bytes(),
            Self::LittleEndian => value.to_le_bytes(),
        }
    }

    pub fn join_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::BigEndian => u32::from_be_bytes(bytes),
            Self::LittleEndian => u32::from_le_bytes(bytes),
        }
    }
}

/// Fixed-point gain representation: integer steps per dB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainScale {
    steps_per_db: f64,
}

impl GainScale {
    /// `round(gain * 10)`.
    pub const TENTHS: Self = Self { steps_per_db: 10.0 };
    /// `round(gain * 2)`.
    pub const HALF_DB: Self = Self { steps_per_db: 2.0 };
    /// 16.16 fixed-point dB.
    pub const FIXED_16_16: Self = Self {
        steps_per_db: 65536.0,
    };

    pub fn encode(self, gain: f64) -> i32 {
        (gain * self.steps_per_db).round() as i32
    }

    pub fn decode(self, raw: i32) -> f64 {
        raw as f64 / self.steps_per_db
    }

    /// Quantization step in dB.
    pub fn step(self) -> f64 {
        1.0 / self.steps_per_db
    }
}

/// Fixed-point Q representation: integer = `round(q * factor)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QScale {
    factor: f64,
}

impl QScale {
    /// Q carried as a plain integer.
    pub const UNSCALED: Self = Self { factor: 1.0 };
    pub const HUNDREDTHS: Self = Self { factor: 100.0 };
    pub const THOUSANDTHS: Self = Self { factor: 1000.0 };
    pub const TEN_THOUSANDTHS: Self = Self { factor: 10000.0 };

    pub fn encode(self, q: f64) -> u32 {
        (q * self.factor).round().max(0.0) as u32
    }

    /// Encode into a 16-bit field, saturating at `u16::MAX`.
    pub fn encode_u16(self, q: f64) -> u16 {
        self.encode(q).min(u16::MAX as u32) as u16
    }

    /// Decode a raw field. A zero field decodes to Q = 1.0.
    pub fn decode(self, raw: u32) -> f64 {
        let q = raw as f64 / self.factor;
        if q == 0.0 {
            1.0
        } else {
            q
        }
    }

    pub fn step(self) -> f64 {
        1.0 / self.factor
    }
}

/// Vendor literals for the filter shape byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterTypeCodes {
    pub peaking: u8,
    pub low_shelf: u8,
    pub high_shelf: u8,
}

impl FilterTypeCodes {
    /// FiiO/JadeAudio family: `PK=0, LSQ=1, HSQ=2`.
    pub const FIIO: Self = Self {
        peaking: 0,
        low_shelf: 1,
        high_shelf: 2,
    };

    pub fn encode(&self, filter_type: FilterType) -> u8 {
        match filter_type {
            FilterType::Peaking => self.peaking,
            FilterType::LowShelf => self.low_shelf,
            FilterType::HighShelf => self.high_shelf,
        }
    }

    pub fn decode(&self, code: u8) -> Option<FilterType> {
        if code == self.peaking {
            Some(FilterType::Peaking)
        } else if code == self.low_shelf {
            Some(FilterType::LowShelf)
        } else if code == self.high_shelf {
            Some(FilterType::HighShelf)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sign_fold_matches_known_bytes() {
        // -5.0 dB in tenths = -50 → 0xFFCE
        assert_eq!(SignEncoding::SignFold.encode(-50), 0xFFCE);
        assert_eq!(SignEncoding::SignFold.decode(0xFFCE), -50);
        assert_eq!(SignEncoding::SignFold.encode(50), 0x0032);
    }

    #[test]
    fn twos_complement_saturates() {
        assert_eq!(SignEncoding::TwosComplement.encode(40_000), 0x7FFF);
        assert_eq!(SignEncoding::TwosComplement.encode(-40_000), 0x8000);
    }

    #[test]
    fn byte_order_split_and_join() {
        assert_eq!(ByteOrder::BigEndian.split_u16(0x03E8), [0x03, 0xE8]);
        assert_eq!(ByteOrder::LittleEndian.split_u16(0x03E8), [0xE8, 0x03]);
        assert_eq!(ByteOrder::LittleEndian.join_u16([0xE8, 0x03]), 1000);
        assert_eq!(
            ByteOrder::LittleEndian.split_u32(0x0001_0000),
            [0x00, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn q_zero_decodes_to_unity() {
        assert_eq!(QScale::HUNDREDTHS.decode(0), 1.0);
        assert_eq!(QScale::THOUSANDTHS.decode(0), 1.0);
        assert_eq!(QScale::TEN_THOUSANDTHS.decode(0), 1.0);
    }

    #[test]
    fn unscaled_q_is_the_integer_value() {
        assert_eq!(QScale::UNSCALED.encode_u16(1.0), 1);
        assert_eq!(QScale::UNSCALED.encode_u16(4.4), 4);
        assert_eq!(QScale::UNSCALED.decode(3), 3.0);
        assert_eq!(QScale::UNSCALED.decode(0), 1.0);
    }

    #[test]
    fn q_u16_saturates() {
        assert_eq!(QScale::TEN_THOUSANDTHS.encode_u16(10.0), u16::MAX);
        assert_eq!(QScale::THOUSANDTHS.encode_u16(65.535), u16::MAX);
    }

    #[test]
    fn fiio_filter_type_codes() {
        let codes = FilterTypeCodes::FIIO;
        assert_eq!(codes.encode(FilterType::Peaking), 0);
        assert_eq!(codes.encode(FilterType::LowShelf), 1);
        assert_eq!(codes.encode(FilterType::HighShelf), 2);
        assert_eq!(codes.decode(2), Some(FilterType::HighShelf));
        assert_eq!(codes.decode(9), None);
    }

    proptest! {
        #[test]
        fn gain_roundtrip_within_step(gain in -30.0f64..30.0) {
            for scale in [GainScale::TENTHS, GainScale::HALF_DB, GainScale::FIXED_16_16] {
                let back = scale.decode(scale.encode(gain));
                prop_assert!((back - gain).abs() <= scale.step() / 2.0 + 1e-9);
            }
        }

        #[test]
        fn signed_gain_survives_both_sign_encodings(gain in -30.0f64..30.0) {
            for sign in [SignEncoding::TwosComplement, SignEncoding::SignFold] {
                let raw = GainScale::TENTHS.encode(gain);
                let back = GainScale::TENTHS.decode(sign.decode(sign.encode(raw)));
                prop_assert!((back - gain).abs() <= 0.05 + 1e-9);
            }
        }

        #[test]
        fn q_roundtrip_within_step(q in 0.1f64..6.5) {
            for scale in [QScale::HUNDREDTHS, QScale::THOUSANDTHS, QScale::TEN_THOUSANDTHS] {
                let back = scale.decode(scale.encode_u16(q) as u32);
                prop_assert!((back - q).abs() <= scale.step() / 2.0 + 1e-9);
            }
        }
    }
}
