//! GATT UUIDs, poll cadence constants, and codec tables for Sonicare handles.
//!
//! Vendor characteristics live in the Philips namespace
//! `477ea600-a260-11e4-ae37-0002a5d5XXXX`; battery level and model number are
//! the Bluetooth SIG standard characteristics.
//!
//! Everything in this module is data. The decoding built on these tables
//! lives in [`crate::parse`] and [`crate::device`].

use std::time::Duration;

use uuid::Uuid;

use crate::types::{Model, SensorKey};

// ── Poll cadence ──────────────────────────────────────────────────────────────

/// How long after the last observed `run` state a handle still counts as
/// "recently brushing" for scheduling purposes.
pub const TIMEOUT_RECENTLY_BRUSHING: Duration = Duration::from_secs(20);

/// Poll interval while the handle is idle.
pub const NOT_BRUSHING_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Poll interval while brushing or recently brushing. Session data changes
/// quickly enough during a session to warrant the faster cadence.
pub const BRUSHING_UPDATE_INTERVAL: Duration = Duration::from_secs(15);

// ── Services ──────────────────────────────────────────────────────────────────

/// Service UUID present in every Sonicare advertisement.
///
/// This is the family detector: an advertisement without it is not a Sonicare
/// handle and is ignored entirely.
pub const ADVERTISEMENT_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x477ea600_a260_11e4_ae37_0002a5d50001);

/// GATT service grouping the state, clock, and mode characteristics.
///
/// The poll path addresses characteristics directly, so this is carried for
/// reference and debugging rather than used for lookup.
pub const STATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x477ea600_a260_11e4_ae37_0002a5d50002);

/// GATT service grouping the brush-head characteristics. Carried for
/// reference, like [`STATE_SERVICE_UUID`].
pub const BRUSH_SERVICE_UUID: Uuid = Uuid::from_u128(0x477ea600_a260_11e4_ae37_0002a5d50006);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Standard Battery Level characteristic (single byte, 0–100 %).
pub const BATTERY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Standard Model Number String characteristic (UTF-8, e.g. `"HX9924/01"`).
///
/// Read opportunistically during the per-session batch to report the brush
/// type; not every firmware exposes it, so a failed read is skipped rather
/// than treated as a poll failure.
pub const MODEL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);

/// Seconds brushed in the current session (little-endian unsigned). Notifies.
pub const BRUSHING_TIME_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x477ea600_a260_11e4_ae37_0002a5d54090);

/// Handle state byte (see [`STATES`]). Notifies on every transition.
pub const STATE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x477ea600_a260_11e4_ae37_0002a5d54010);

/// On-device clock as a little-endian Unix epoch second count.
pub const CURRENT_TIME_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x477ea600_a260_11e4_ae37_0002a5d54050);

/// Selected cleaning-mode code (little-endian unsigned; meaning is
/// model-specific, see the mode tables below). Notifies.
pub const MODE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x477ea600_a260_11e4_ae37_0002a5d54091);

/// Selected intensity code (see [`STRENGTH`]). Notifies.
pub const STRENGTH_CHARACTERISTIC: Uuid = Uuid::from_u128(0x477ea600_a260_11e4_ae37_0002a5d540b0);

/// Seconds of accumulated use on the fitted brush head.
pub const BRUSH_USAGE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x477ea600_a260_11e4_ae37_0002a5d54290);

/// Rated brush-head lifetime, in the same unit as the usage counter.
pub const BRUSH_LIFETIME_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x477ea600_a260_11e4_ae37_0002a5d54280);

/// Serial number of the fitted brush head (little-endian unsigned).
pub const SERIAL_NUMBER_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x477ea600_a260_11e4_ae37_0002a5d54230);

/// Session identifier, read every poll to detect a new brushing session.
///
/// Deliberately the same physical characteristic as
/// [`SERIAL_NUMBER_CHARACTERISTIC`]: the firmware rolls the value whenever a
/// new session starts, so one characteristic serves both logical roles.
pub const SESSION_ID_CHARACTERISTIC: Uuid = SERIAL_NUMBER_CHARACTERISTIC;

/// Characteristics subscribed while a session runs, in (un)subscribe order.
pub const NOTIFY_CHARACTERISTICS: [Uuid; 4] = [
    STATE_CHARACTERISTIC,
    BRUSHING_TIME_CHARACTERISTIC,
    MODE_CHARACTERISTIC,
    STRENGTH_CHARACTERISTIC,
];

// ── Characteristic registry ───────────────────────────────────────────────────

/// A logical characteristic: its UUID, the sensor key it feeds, and the
/// display label used when a reading is built straight from a notification.
#[derive(Debug, Clone, Copy)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub key: SensorKey,
    pub label: Option<&'static str>,
}

/// Registry of every characteristic this crate decodes.
///
/// UUIDs are unique per entry except for the deliberate serial-number /
/// session-id pairing; [`descriptor`] resolves that shared UUID to the
/// serial-number entry (first match wins).
pub const CHARACTERISTICS: &[CharacteristicDescriptor] = &[
    CharacteristicDescriptor {
        uuid: BATTERY_CHARACTERISTIC,
        key: SensorKey::BatteryPercent,
        label: None,
    },
    CharacteristicDescriptor {
        uuid: MODEL_CHARACTERISTIC,
        key: SensorKey::BrushType,
        label: Some("Brush type"),
    },
    CharacteristicDescriptor {
        uuid: BRUSHING_TIME_CHARACTERISTIC,
        key: SensorKey::BrushingTime,
        label: Some("Brushing time"),
    },
    CharacteristicDescriptor {
        uuid: STATE_CHARACTERISTIC,
        key: SensorKey::ToothbrushState,
        label: Some("Toothbrush State"),
    },
    CharacteristicDescriptor {
        uuid: CURRENT_TIME_CHARACTERISTIC,
        key: SensorKey::CurrentTime,
        label: Some("Toothbrush current time"),
    },
    CharacteristicDescriptor {
        uuid: MODE_CHARACTERISTIC,
        key: SensorKey::Mode,
        label: Some("Toothbrush current mode"),
    },
    CharacteristicDescriptor {
        uuid: STRENGTH_CHARACTERISTIC,
        key: SensorKey::BrushStrength,
        label: Some("Toothbrush current strength"),
    },
    CharacteristicDescriptor {
        uuid: BRUSH_USAGE_CHARACTERISTIC,
        key: SensorKey::BrushHeadUsage,
        label: None,
    },
    CharacteristicDescriptor {
        uuid: BRUSH_LIFETIME_CHARACTERISTIC,
        key: SensorKey::BrushHeadLifetime,
        label: None,
    },
    CharacteristicDescriptor {
        uuid: SERIAL_NUMBER_CHARACTERISTIC,
        key: SensorKey::BrushSerialNumber,
        label: Some("Toothbrush serial number"),
    },
    CharacteristicDescriptor {
        uuid: SESSION_ID_CHARACTERISTIC,
        key: SensorKey::SessionId,
        label: None,
    },
];

/// Look up the registry entry for a UUID (first match wins).
pub fn descriptor(uuid: Uuid) -> Option<&'static CharacteristicDescriptor> {
    CHARACTERISTICS.iter().find(|d| d.uuid == uuid)
}

// ── Models ────────────────────────────────────────────────────────────────────

/// Manufacturer string reported for every accepted device.
pub const MANUFACTURER: &str = "Philips Sonicare";

/// Static per-model data: the marketing device type plus the mode table used
/// to decode that model's mode codes.
#[derive(Debug, Clone, Copy)]
pub struct ModelDescription {
    pub device_type: &'static str,
    pub modes: &'static [(u64, &'static str)],
}

/// Mode table for the Sonicare for Kids range; the hardware has one implicit
/// mode.
pub const KIDS_MODES: &[(u64, &str)] = &[(0, "none")];

/// Mode table shared by the ExpertClean range.
pub const EXPERT_CLEAN_MODES: &[(u64, &str)] =
    &[(120, "clean"), (200, "gun health"), (180, "deep clean+")];

/// ExpertClean modes plus the DiamondClean-only whitening mode.
pub const DIAMOND_CLEAN_MODES: &[(u64, &str)] = &[
    (120, "clean"),
    (200, "gun health"),
    (180, "deep clean+"),
    (160, "white+"),
];

/// DiamondClean modes plus the Prestige-only sensitive mode.
pub const PRESTIGE_MODES: &[(u64, &str)] = &[
    (120, "clean"),
    (200, "gun health"),
    (180, "deep clean+"),
    (160, "white+"),
    (210, "sensitive"),
];

/// Raw advertised model bytes → model, for the patterns seen in captures.
///
/// Kept as data only for now: advertisement handling hard-selects
/// [`Model::HX992X`] until the manufacturer-data layout carrying these bytes
/// is confirmed (see
/// [`SonicareDevice::handle_advertisement`](crate::device::SonicareDevice::handle_advertisement)).
pub const BYTES_TO_MODEL: [(&[u8], Model); 3] = [
    (b"\x062k", Model::HX6340),
    (b"\x2a24", Model::HX992X),
    (b"\x9999", Model::HX9990),
];

impl Model {
    /// The static description (device type string and mode table) for a model.
    pub const fn description(self) -> ModelDescription {
        match self {
            Model::HX6340 => ModelDescription {
                device_type: "HX6340",
                modes: KIDS_MODES,
            },
            Model::HX992X => ModelDescription {
                device_type: "HX992X",
                modes: DIAMOND_CLEAN_MODES,
            },
            Model::HX9990 => ModelDescription {
                device_type: "HX9990",
                modes: PRESTIGE_MODES,
            },
        }
    }

    /// Map advertised model bytes through [`BYTES_TO_MODEL`], defaulting to
    /// the Kids model on a miss.
    pub fn from_advertised_bytes(data: &[u8]) -> Model {
        BYTES_TO_MODEL
            .iter()
            .find(|(pattern, _)| *pattern == data)
            .map(|&(_, model)| model)
            .unwrap_or(Model::HX6340)
    }
}

// ── State and strength tables ─────────────────────────────────────────────────

/// Handle state byte → name. Value 5 and anything above 7 have not been
/// observed; unknown bytes decode to a synthetic `unknown state {byte}` label
/// rather than failing, so new firmware states degrade gracefully.
pub const STATES: [(u8, &str); 7] = [
    (0, "off"),
    (1, "standby"),
    (2, "run"),
    (3, "charge"),
    (4, "shutdown"),
    (6, "validate"),
    (7, "lightsout"),
];

/// State byte reported while the motor is running; drives the brushing
/// transitions in [`crate::device::SonicareDevice`].
pub const STATE_RUN: u8 = 2;

/// Intensity code → name.
pub const STRENGTH: [(u64, &str); 3] = [(0, "low"), (1, "medium"), (2, "high")];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_aliases_serial_number() {
        assert_eq!(SESSION_ID_CHARACTERISTIC, SERIAL_NUMBER_CHARACTERISTIC);
        // The registry resolves the shared UUID to the serial-number entry.
        let desc = descriptor(SESSION_ID_CHARACTERISTIC).unwrap();
        assert_eq!(desc.key, SensorKey::BrushSerialNumber);
    }

    #[test]
    fn registry_uuids_unique_apart_from_session_alias() {
        for (i, a) in CHARACTERISTICS.iter().enumerate() {
            for b in &CHARACTERISTICS[i + 1..] {
                if a.uuid == b.uuid {
                    assert_eq!(a.key, SensorKey::BrushSerialNumber);
                    assert_eq!(b.key, SensorKey::SessionId);
                }
            }
        }
    }

    #[test]
    fn model_from_advertised_bytes_defaults_to_kids() {
        assert_eq!(Model::from_advertised_bytes(b"\x2a24"), Model::HX992X);
        assert_eq!(Model::from_advertised_bytes(b"\x9999"), Model::HX9990);
        assert_eq!(Model::from_advertised_bytes(b"\x00\x00"), Model::HX6340);
    }

    #[test]
    fn prestige_extends_diamond_clean() {
        for entry in DIAMOND_CLEAN_MODES {
            assert!(PRESTIGE_MODES.contains(entry));
        }
        assert!(PRESTIGE_MODES.contains(&(210, "sensitive")));
    }
}
