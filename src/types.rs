//! Value types shared across the crate: sensor readings, update snapshots,
//! device identity, and the mutable brushing state.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Sonicare model families this crate can decode.
///
/// The family determines which mode table applies (see
/// [`Model::description`](crate::protocol)), not the exact retail SKU; the
/// retail model string, when the handle exposes it, is reported separately as
/// the [`SensorKey::BrushType`] reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    /// Sonicare for Kids.
    HX6340,
    /// DiamondClean family (HX992x handles).
    HX992X,
    /// Prestige 9900.
    HX9990,
}

/// Stable identifier for a sensor reading within an update snapshot.
///
/// The string form (via [`SensorKey::as_str`] or `Display`) is what downstream
/// consumers key their entities on, so these never change spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKey {
    BatteryPercent,
    ToothbrushState,
    CurrentTime,
    BrushingTime,
    Mode,
    BrushStrength,
    BrushHeadLifetime,
    BrushHeadUsage,
    BrushSerialNumber,
    BrushHeadPercentage,
    SessionId,
    BrushType,
}

impl SensorKey {
    /// The wire-stable snake_case name for this key.
    pub const fn as_str(self) -> &'static str {
        match self {
            SensorKey::BatteryPercent => "battery_percent",
            SensorKey::ToothbrushState => "toothbrush_state",
            SensorKey::CurrentTime => "current_time",
            SensorKey::BrushingTime => "brushing_time",
            SensorKey::Mode => "mode",
            SensorKey::BrushStrength => "brush_strength",
            SensorKey::BrushHeadLifetime => "brush_head_lifetime",
            SensorKey::BrushHeadUsage => "brush_head_usage",
            SensorKey::BrushSerialNumber => "brush_serial_number",
            SensorKey::BrushHeadPercentage => "brush_head_percentage",
            SensorKey::SessionId => "current_session_id",
            SensorKey::BrushType => "brush_type",
        }
    }
}

impl fmt::Display for SensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of measurement attached to a reading, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Percentage,
}

impl Unit {
    pub const fn as_str(self) -> &'static str {
        match self {
            Unit::Percentage => "%",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device class hint for consumers that classify sensors (battery gauges get
/// treated specially by most dashboards).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Battery,
}

/// A decoded sensor value.
///
/// Counters, codes, and percentages decode to `Integer`; state names, mode
/// names, timestamps, and the brush type decode to `Text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

/// One sensor reading inside a [`SensorUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorReading {
    /// Stable identity of the reading.
    pub key: SensorKey,
    /// Unit of measurement, where one applies.
    pub unit: Option<Unit>,
    /// The decoded value.
    pub value: Value,
    /// Classification hint for downstream consumers.
    pub device_class: Option<DeviceClass>,
    /// Human-readable label shown next to the value.
    pub label: &'static str,
}

/// Identity of the toothbrush a [`SensorUpdate`] belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Always `"Philips Sonicare"` for devices accepted by this crate.
    pub manufacturer: String,
    /// Detected model family.
    pub model: Model,
    /// Display name, e.g. `"HX992X EEFF"`: device type plus the short tail
    /// of the Bluetooth address so two handles in one household stay apart.
    pub name: String,
}

/// A batch of readings produced by one decode cycle (advertisement, poll, or
/// notification).
///
/// Readings are deduplicated by [`SensorKey`]; writing a key twice within one
/// update keeps the latest value. An update is all-or-nothing: a failed poll
/// never produces a partially filled one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorUpdate {
    title: Option<String>,
    device: Option<DeviceIdentity>,
    readings: HashMap<SensorKey, SensorReading>,
}

impl SensorUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the display title for this update.
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(title.into());
    }

    /// Attach the device identity this update describes.
    pub fn set_device_identity(&mut self, identity: DeviceIdentity) {
        self.device = Some(identity);
    }

    /// Record one reading, replacing any earlier reading with the same key.
    pub fn update_sensor(
        &mut self,
        key: SensorKey,
        unit: Option<Unit>,
        value: Value,
        device_class: Option<DeviceClass>,
        label: &'static str,
    ) {
        self.readings.insert(
            key,
            SensorReading {
                key,
                unit,
                value,
                device_class,
                label,
            },
        );
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn device(&self) -> Option<&DeviceIdentity> {
        self.device.as_ref()
    }

    /// The reading stored under `key`, if this update carries one.
    pub fn reading(&self, key: SensorKey) -> Option<&SensorReading> {
        self.readings.get(&key)
    }

    /// Iterate over all readings (unordered).
    pub fn readings(&self) -> impl Iterator<Item = &SensorReading> {
        self.readings.values()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// A BLE advertisement as seen by the scanner, reduced to the fields the
/// interpreter needs.
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    /// Platform address string (`AA:BB:CC:DD:EE:FF` on most platforms, an
    /// opaque UUID on macOS).
    pub address: String,
    /// Advertised local name, when present.
    pub local_name: Option<String>,
    /// Advertised service UUIDs; Sonicare handles include
    /// [`crate::protocol::ADVERTISEMENT_SERVICE_UUID`].
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer-specific data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// Mutable brushing state shared between the poll path and the notification
/// pump.
///
/// `last_brush` only moves forward: it is stamped from [`Instant::now`] each
/// time a `run` state is observed and never cleared, so "recently brushed"
/// stays true for the grace window after a session ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrushingState {
    /// Whether the last observed state byte was `run`.
    pub is_brushing: bool,
    /// When a `run` state was last observed. `None` until the first one.
    pub last_brush: Option<Instant>,
    /// Session id seen on the previous poll; used to detect session starts.
    pub last_session_id: Option<u64>,
}

impl BrushingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a `run` state was observed within `window`.
    pub fn recently_brushed(&self, window: Duration) -> bool {
        self.last_brush.is_some_and(|at| at.elapsed() <= window)
    }

    /// Record an observed `run` state.
    pub fn mark_brushing(&mut self) {
        self.is_brushing = true;
        self.last_brush = Some(Instant::now());
    }

    /// Record an observed non-`run` state. Keeps `last_brush` so the recent
    /// window stays intact.
    pub fn mark_idle(&mut self) {
        self.is_brushing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_sensor_replaces_by_key() {
        let mut update = SensorUpdate::new();
        update.update_sensor(
            SensorKey::BatteryPercent,
            Some(Unit::Percentage),
            Value::Integer(40),
            Some(DeviceClass::Battery),
            "Battery",
        );
        update.update_sensor(
            SensorKey::BatteryPercent,
            Some(Unit::Percentage),
            Value::Integer(41),
            Some(DeviceClass::Battery),
            "Battery",
        );
        assert_eq!(update.len(), 1);
        assert_eq!(
            update.reading(SensorKey::BatteryPercent).map(|r| &r.value),
            Some(&Value::Integer(41))
        );
    }

    #[test]
    fn mark_idle_keeps_last_brush() {
        let mut state = BrushingState::new();
        state.mark_brushing();
        state.mark_idle();
        assert!(!state.is_brushing);
        assert!(state.last_brush.is_some());
        assert!(state.recently_brushed(Duration::from_secs(20)));
    }

    #[test]
    fn recently_brushed_is_false_without_history() {
        let state = BrushingState::new();
        assert!(!state.recently_brushed(Duration::from_secs(20)));
    }

    #[test]
    fn sensor_key_strings_are_snake_case() {
        assert_eq!(SensorKey::BatteryPercent.as_str(), "battery_percent");
        assert_eq!(SensorKey::SessionId.as_str(), "current_session_id");
        assert_eq!(SensorKey::BrushType.to_string(), "brush_type");
    }
}
