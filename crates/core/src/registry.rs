//! Static per-model capability tables.
//!
//! Lookups are keyed by `(manufacturer, product name)` as the device reports
//! them in its USB string descriptors. Unknown products fall back to the
//! manufacturer's `"default"` row, then to [`GLOBAL_DEFAULT`].

use serde::Serialize;
use tracing::debug;

/// Router-level sentinel: PEQ is switched off on the device.
pub const PEQ_DISABLED_SLOT: i32 = -1;
/// Router-level sentinel: the device did not answer a slot query.
pub const SLOT_UNAVAILABLE: i32 = -99;

/// A named storage location on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub id: i32,
    pub name: &'static str,
}

const fn slot(id: i32, name: &'static str) -> SlotInfo {
    SlotInfo { id, name }
}

/// Immutable capability description of one device model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceModelConfig {
    pub min_gain: f64,
    pub max_gain: f64,
    pub max_filters: usize,
    /// First slot id that accepts writes, `-1` when none do.
    pub first_writable_slot: i32,
    pub max_writable_slots: usize,
    /// The device drops off the bus after a save and must be reopened.
    pub disconnect_on_save: bool,
    /// Vendor preset id meaning "PEQ off", `-1` when the vendor has none.
    pub disabled_preset_id: i32,
    pub available_slots: &'static [SlotInfo],
}

impl DeviceModelConfig {
    /// Translate a vendor preset id into a router slot.
    pub fn to_router_slot(&self, vendor_slot: i32) -> i32 {
        if vendor_slot == self.disabled_preset_id {
            PEQ_DISABLED_SLOT
        } else {
            vendor_slot
        }
    }

    /// Translate a router slot into the vendor preset id.
    pub fn to_vendor_slot(&self, router_slot: i32) -> i32 {
        if router_slot == PEQ_DISABLED_SLOT {
            self.disabled_preset_id
        } else {
            router_slot
        }
    }

    /// Whether `slot` is one of the writable slots.
    pub fn is_writable_slot(&self, slot: i32) -> bool {
        if self.first_writable_slot < 0 {
            return false;
        }
        let first = self.first_writable_slot;
        let last = first + self.max_writable_slots as i32;
        (first..last).contains(&slot)
    }

    pub fn clamp_gain(&self, gain: f64) -> f64 {
        gain.clamp(self.min_gain, self.max_gain)
    }
}

/// One row of the model table.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub config: DeviceModelConfig,
}

/// Fallback used when neither the model nor its manufacturer is known.
pub static GLOBAL_DEFAULT: DeviceModelConfig = DeviceModelConfig {
    min_gain: -12.0,
    max_gain: 12.0,
    max_filters: 5,
    first_writable_slot: -1,
    max_writable_slots: 0,
    disconnect_on_save: true,
    disabled_preset_id: -1,
    available_slots: &[],
};

const FIIO_SLOTS: &[SlotInfo] = &[
    slot(0, "Jazz"),
    slot(1, "Pop"),
    slot(2, "Rock"),
    slot(3, "Dance"),
    slot(4, "R&B"),
    slot(5, "Classic"),
    slot(6, "Hip-hop"),
    slot(7, "USER1"),
    slot(8, "USER2"),
    slot(9, "USER3"),
];

const FIIO_DONGLE_SLOTS: &[SlotInfo] = &[
    slot(0, "Jazz"),
    slot(1, "Pop"),
    slot(2, "Rock"),
    slot(3, "Dance"),
    slot(4, "R&B"),
    slot(5, "Classic"),
    slot(6, "Hip-hop"),
    slot(160, "USER1"),
    slot(161, "USER2"),
    slot(162, "USER3"),
    slot(163, "USER4"),
    slot(164, "USER5"),
];

const JADE_SLOTS: &[SlotInfo] = &[
    slot(0, "Vocal"),
    slot(1, "Classic"),
    slot(2, "Bass"),
    slot(3, "USER1"),
];

const MOONDROP_SLOTS: &[SlotInfo] = &[
    slot(0, "Custom 1"),
    slot(1, "Custom 2"),
    slot(2, "Custom 3"),
    slot(3, "Custom 4"),
];

const MOONDROP_LEGACY_SLOTS: &[SlotInfo] = &[slot(0, "Custom")];

const QUDELIX_SLOTS: &[SlotInfo] = &[
    slot(0, "Custom 1"),
    slot(1, "Custom 2"),
    slot(2, "Custom 3"),
    slot(3, "Custom 4"),
];

const JDS_SLOTS: &[SlotInfo] = &[slot(0, "Headphones"), slot(1, "RCA")];

const TOPPING_SLOTS: &[SlotInfo] = &[slot(0, "Custom")];

/// The model table. Rows for a manufacturer keep `"default"` first.
pub static MODEL_TABLE: &[ModelEntry] = &[
    ModelEntry {
        manufacturer: "FiiO",
        model: "default",
        config: DeviceModelConfig {
            min_gain: -12.0,
            max_gain: 12.0,
            max_filters: 5,
            first_writable_slot: 7,
            max_writable_slots: 3,
            disconnect_on_save: true,
            disabled_preset_id: 11,
            available_slots: FIIO_SLOTS,
        },
    },
    ModelEntry {
        manufacturer: "FiiO",
        model: "FIIO KA17",
        config: DeviceModelConfig {
            min_gain: -12.0,
            max_gain: 12.0,
            max_filters: 10,
            first_writable_slot: 160,
            max_writable_slots: 5,
            disconnect_on_save: false,
            disabled_preset_id: 11,
            available_slots: FIIO_DONGLE_SLOTS,
        },
    },
    ModelEntry {
        manufacturer: "FiiO",
        model: "FIIO BTR13",
        config: DeviceModelConfig {
            min_gain: -12.0,
            max_gain: 12.0,
            max_filters: 10,
            first_writable_slot: 160,
            max_writable_slots: 5,
            disconnect_on_save: false,
            disabled_preset_id: 12,
            available_slots: FIIO_DONGLE_SLOTS,
        },
    },
    ModelEntry {
        manufacturer: "FiiO",
        model: "FIIO Q7",
        config: DeviceModelConfig {
            min_gain: -12.0,
            max_gain: 12.0,
            max_filters: 10,
            first_writable_slot: 7,
            max_writable_slots: 3,
            disconnect_on_save: true,
            disabled_preset_id: 11,
            available_slots: FIIO_SLOTS,
        },
    },
    ModelEntry {
        manufacturer: "JadeAudio",
        model: "default",
        config: DeviceModelConfig {
            min_gain: -12.0,
            max_gain: 12.0,
            max_filters: 5,
            first_writable_slot: 3,
            max_writable_slots: 1,
            disconnect_on_save: true,
            disabled_preset_id: 4,
            available_slots: JADE_SLOTS,
        },
    },
    ModelEntry {
        manufacturer: "Moondrop",
        model: "default",
        config: DeviceModelConfig {
            min_gain: -12.0,
            max_gain: 12.0,
            max_filters: 8,
            first_writable_slot: 0,
            max_writable_slots: 4,
            disconnect_on_save: false,
            disabled_preset_id: 0xFF,
            available_slots: MOONDROP_SLOTS,
        },
    },
    ModelEntry {
        manufacturer: "Moondrop",
        model: "MOONDROP Dawn Pro",
        config: DeviceModelConfig {
            min_gain: -12.0,
            max_gain: 6.0,
            max_filters: 5,
            first_writable_slot: 0,
            max_writable_slots: 1,
            disconnect_on_save: false,
            disabled_preset_id: 0xFF,
            available_slots: MOONDROP_LEGACY_SLOTS,
        },
    },
    ModelEntry {
        manufacturer: "Moondrop",
        model: "ECHO-A",
        config: DeviceModelConfig {
            min_gain: -12.0,
            max_gain: 6.0,
            max_filters: 5,
            first_writable_slot: 0,
            max_writable_slots: 1,
            disconnect_on_save: true,
            disabled_preset_id: 0xFF,
            available_slots: MOONDROP_LEGACY_SLOTS,
        },
    },
    ModelEntry {
        manufacturer: "Qudelix",
        model: "default",
        config: DeviceModelConfig {
            min_gain: -12.0,
            max_gain: 12.0,
            max_filters: 10,
            first_writable_slot: 0,
            max_writable_slots: 4,
            disconnect_on_save: false,
            disabled_preset_id: 0xFF,
            available_slots: QUDELIX_SLOTS,
        },
    },
    ModelEntry {
        manufacturer: "JDS Labs",
        model: "default",
        config: DeviceModelConfig {
            min_gain: -12.0,
            max_gain: 12.0,
            max_filters: 12,
            first_writable_slot: 0,
            max_writable_slots: 2,
            disconnect_on_save: false,
            disabled_preset_id: -1,
            available_slots: JDS_SLOTS,
        },
    },
    ModelEntry {
        manufacturer: "Topping",
        model: "default",
        config: DeviceModelConfig {
            min_gain: -12.0,
            max_gain: 12.0,
            max_filters: 10,
            first_writable_slot: 0,
            max_writable_slots: 1,
            disconnect_on_save: false,
            disabled_preset_id: -1,
            available_slots: TOPPING_SLOTS,
        },
    },
];

/// Look up the capability table for a device.
///
/// Matching is case-insensitive and ignores surrounding whitespace. The
/// manufacturer key matches when the reported manufacturer string contains
/// it, so "FiiO Electronics" resolves to the "FiiO" rows.
pub fn get_model_config(manufacturer: &str, model: &str) -> &'static DeviceModelConfig {
    let manufacturer = manufacturer.trim().to_lowercase();
    let model = model.trim();

    let vendor_rows = || {
        MODEL_TABLE
            .iter()
            .filter(|e| manufacturer.contains(&e.manufacturer.to_lowercase()))
    };

    if let Some(entry) = vendor_rows().find(|e| e.model.eq_ignore_ascii_case(model)) {
        return &entry.config;
    }
    if let Some(entry) = vendor_rows().find(|e| e.model == "default") {
        debug!(
            manufacturer = entry.manufacturer,
            model, "Unknown model, using manufacturer default"
        );
        return &entry.config;
    }

    debug!(%manufacturer, model, "Unknown manufacturer, using global default");
    &GLOBAL_DEFAULT
}
