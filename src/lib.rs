//! # sonicare-ble
//!
//! Async Rust library and CLI for reading battery, brushing state, and brush
//! head wear from Philips Sonicare toothbrushes over Bluetooth Low Energy.
//!
//! ## Supported hardware
//!
//! | Family | Device type | Cleaning modes |
//! |---|---|---|
//! | Sonicare for Kids | HX6340 | none |
//! | ExpertClean | HX992X† | clean, gun health, deep clean+ |
//! | DiamondClean | HX992X | ExpertClean set plus white+ |
//! | Prestige | HX9990 | DiamondClean set plus sensitive |
//!
//! † ExpertClean and DiamondClean share a device type; the handle reports its
//! exact retail model (e.g. `HX9924/01`) as a separate reading when the
//! firmware exposes it.
//!
//! Any handle advertising the Sonicare family service is accepted; unknown
//! state, mode, and strength codes decode to synthetic `unknown …` labels
//! instead of failing, so newer firmware degrades gracefully.
//!
//! ## Quick start
//!
//! ```no_run
//! use sonicare_ble::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = BtleplugTransport::new(TransportConfig::default());
//!     let advertisement = transport.discover().await?;
//!
//!     let (device, mut updates) = SonicareDevice::new();
//!     if device.handle_advertisement(&advertisement).is_none() {
//!         anyhow::bail!("not a Sonicare handle");
//!     }
//!
//!     // One connection-based poll: battery, state, clock, and (for a new
//!     // brushing session) the per-session batch.
//!     let update = device.poll(&transport, &advertisement.address).await?;
//!     for reading in update.readings() {
//!         println!("{}: {}", reading.label, reading.value);
//!     }
//!
//!     // While the handle is brushing, live notifications stream in here.
//!     while let Some(update) = updates.recv().await {
//!         for reading in update.readings() {
//!             println!("{}: {}", reading.label, reading.value);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Polling model
//!
//! Sonicare advertisements carry no sensor payload, only proof the handle is
//! awake. Everything interesting comes from connecting and reading GATT
//! characteristics, so the crate is built around a poll cycle instead of a
//! passive listener:
//!
//! * [`SonicareDevice::handle_advertisement`] interprets an advertisement
//!   into the device identity and confirms the handle is online.
//! * [`SonicareDevice::poll_needed`] schedules polls at 15 s while brushing
//!   (or shortly after) and 30 s otherwise.
//! * [`SonicareDevice::poll`] connects, reads, and disconnects, except while
//!   a brushing session runs: then the connection stays open and the four
//!   live characteristics (state, brushing time, mode, strength) push
//!   updates through the channel returned by [`SonicareDevice::new`].
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`device`] | The decode and poll engine, [`device::SonicareDevice`] |
//! | [`transport`] | BLE scanning and connections behind the [`transport::Transport`] trait |
//! | [`types`] | Sensor readings, updates, and shared device state |
//! | [`protocol`] | GATT UUIDs, characteristic registry, and the codec tables |
//! | [`parse`] | Pure payload decoders shared by the poll and notification paths |

pub mod device;
pub mod parse;
pub mod protocol;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// A single glob import covers the surface needed to discover a handle, poll
/// it, and consume updates:
///
/// ```no_run
/// use sonicare_ble::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = BtleplugTransport::new(TransportConfig::default());
/// let advertisement = transport.discover().await?;
/// let (device, _updates) = SonicareDevice::new();
/// let _ = device.handle_advertisement(&advertisement);
/// let update = device.poll(&transport, &advertisement.address).await?;
/// println!("{:?}", update.reading(SensorKey::BatteryPercent));
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    // ── Engine ────────────────────────────────────────────────────────────────
    pub use crate::device::SonicareDevice;

    // ── Transport ─────────────────────────────────────────────────────────────
    pub use crate::transport::{
        BtleplugTransport, Connection, Notification, NotificationStream, Transport,
        TransportConfig,
    };

    // ── Readings and device state ─────────────────────────────────────────────
    pub use crate::types::{
        Advertisement, DeviceClass, DeviceIdentity, Model, SensorKey, SensorReading,
        SensorUpdate, Unit, Value,
    };

    // ── Cadence constants ─────────────────────────────────────────────────────
    pub use crate::protocol::{
        BRUSHING_UPDATE_INTERVAL, NOT_BRUSHING_UPDATE_INTERVAL, TIMEOUT_RECENTLY_BRUSHING,
    };
}
