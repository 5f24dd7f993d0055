//! The BLE transport capability: what the poll engine needs from a radio.
//!
//! [`Transport`] and [`Connection`] are the seam between the decode engine in
//! [`crate::device`] and an actual Bluetooth stack. The production
//! implementation ([`BtleplugTransport`] / [`BtleplugConnection`]) sits on
//! btleplug; tests drive the same traits with a scripted in-memory transport.
//!
//! Retry policy lives here or below, never above: the poll engine treats every
//! call as a single fallible operation.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use log::{debug, info};
use uuid::Uuid;

use crate::protocol::ADVERTISEMENT_SERVICE_UUID;
use crate::types::Advertisement;

/// A characteristic value pushed by the device while subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

/// Stream of pushed characteristic values. Ends when the connection closes.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// Opens connections to a device by its platform address string.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the device at `address`.
    ///
    /// A failure here fails the whole poll; any retrying happens inside the
    /// implementation, not in the caller.
    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>>;
}

/// An open GATT connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Read the current value of a characteristic.
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Start notifications for a characteristic. Subscribing while already
    /// subscribed is a no-op, never an error or a duplicate delivery.
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Stop notifications for a characteristic. Unsubscribing while not
    /// subscribed is a no-op.
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// The stream of pushed values for every subscribed characteristic.
    async fn notifications(&self) -> Result<NotificationStream>;

    /// Whether the link is still up at the adapter level.
    async fn is_connected(&self) -> bool;

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Configuration for [`BtleplugTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// BLE scan duration in seconds before giving up. Default: `15`.
    pub scan_timeout_secs: u64,
    /// Only accept the handle with this exact platform address, when set.
    ///
    /// The default `None` accepts the first advertisement carrying the
    /// Sonicare family service, which is the right thing for a household with
    /// one handle. Set the address to pin a specific handle. Default: `None`.
    pub address: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 15,
            address: None,
        }
    }
}

// ── btleplug implementation ───────────────────────────────────────────────────

/// Production [`Transport`] on top of the platform Bluetooth stack.
///
/// Peripherals found by [`BtleplugTransport::discover`] are remembered by
/// address so a later [`Transport::connect`] does not have to scan again;
/// connecting to an address that was never discovered falls back to a scan.
pub struct BtleplugTransport {
    config: TransportConfig,
    adapter: Mutex<Option<Adapter>>,
    known: Mutex<HashMap<String, Peripheral>>,
}

impl BtleplugTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            adapter: Mutex::new(None),
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Scan until a Sonicare advertisement (matching the configured address
    /// filter, if any) is seen, and return it.
    ///
    /// The accepted peripheral is cached for the follow-up connect.
    pub async fn discover(&self) -> Result<Advertisement> {
        let adapter = self.adapter().await?;
        info!(
            "scanning for a Sonicare handle ({} s timeout)",
            self.config.scan_timeout_secs
        );
        adapter.start_scan(ScanFilter::default()).await?;
        let found = self
            .find_peripheral(&adapter, |address, props| {
                props.services.contains(&ADVERTISEMENT_SERVICE_UUID)
                    && self
                        .config
                        .address
                        .as_deref()
                        .is_none_or(|want| want.eq_ignore_ascii_case(address))
            })
            .await;
        adapter.stop_scan().await.ok();

        let (peripheral, advertisement) = found?;
        info!(
            "found {} at {}",
            advertisement.local_name.as_deref().unwrap_or("a handle"),
            advertisement.address
        );
        self.remember(advertisement.address.clone(), peripheral);
        Ok(advertisement)
    }

    /// First adapter from the platform manager, created on first use.
    async fn adapter(&self) -> Result<Adapter> {
        if let Some(adapter) = self.held_adapter() {
            return Ok(adapter);
        }

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        // ── macOS: hold off until CoreBluetooth is ready ─────────────────────
        // Right after process start CBCentralManager has not settled on a
        // state yet, and a scan issued before it reaches poweredOn is
        // swallowed without any error. Poll adapter_state() until it reports
        // PoweredOn (or a short deadline passes) before using the adapter.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;
            use log::warn;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => {
                        info!("CoreBluetooth adapter powered on");
                        break;
                    }
                    Ok(state) => {
                        if tokio::time::Instant::now() >= deadline {
                            warn!("CoreBluetooth still {state:?} after 3 s, scanning anyway");
                            break;
                        }
                        debug!("CoreBluetooth state {state:?}, waiting");
                    }
                    Err(e) => {
                        warn!("adapter_state() failed: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            // A beat more for the delegate callbacks to finish.
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        *self
            .adapter
            .lock()
            .expect("adapter mutex poisoned") = Some(adapter.clone());
        Ok(adapter)
    }

    fn held_adapter(&self) -> Option<Adapter> {
        self.adapter
            .lock()
            .expect("adapter mutex poisoned")
            .clone()
    }

    fn remember(&self, address: String, peripheral: Peripheral) {
        self.known
            .lock()
            .expect("peripheral cache mutex poisoned")
            .insert(address, peripheral);
    }

    fn recall(&self, address: &str) -> Option<Peripheral> {
        self.known
            .lock()
            .expect("peripheral cache mutex poisoned")
            .get(address)
            .cloned()
    }

    /// Poll the adapter's peripheral list until `accept` matches one or the
    /// configured timeout expires.
    async fn find_peripheral(
        &self,
        adapter: &Adapter,
        accept: impl Fn(&str, &PeripheralProperties) -> bool,
    ) -> Result<(Peripheral, Advertisement)> {
        let result = tokio::time::timeout(
            Duration::from_secs(self.config.scan_timeout_secs),
            async {
                loop {
                    for peripheral in adapter.peripherals().await.unwrap_or_default() {
                        if let Ok(Some(props)) = peripheral.properties().await {
                            let address = address_of(&peripheral, &props);
                            if accept(&address, &props) {
                                let advertisement = Advertisement {
                                    address,
                                    local_name: props.local_name.clone(),
                                    service_uuids: props.services.clone(),
                                    manufacturer_data: props.manufacturer_data.clone(),
                                };
                                return (peripheral, advertisement);
                            }
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            },
        )
        .await;

        result.map_err(|_| {
            anyhow!(
                "Timed out scanning for a Sonicare handle after {} s",
                self.config.scan_timeout_secs
            )
        })
    }

    /// The peripheral for an address: the cached one from a prior discover, or
    /// a fresh scan when the caller supplied the address directly.
    async fn peripheral_for(&self, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.recall(address) {
            return Ok(peripheral);
        }

        debug!("address {address} not seen yet, scanning for it");
        let adapter = self.adapter().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        let found = self
            .find_peripheral(&adapter, |candidate, _| {
                candidate.eq_ignore_ascii_case(address)
            })
            .await;
        adapter.stop_scan().await.ok();

        let (peripheral, advertisement) = found?;
        self.remember(advertisement.address, peripheral.clone());
        Ok(peripheral)
    }
}

/// The platform address string for a peripheral. macOS hides the MAC address
/// behind a CoreBluetooth UUID; everywhere else the MAC is the stable handle.
fn address_of(peripheral: &Peripheral, props: &PeripheralProperties) -> String {
    if cfg!(target_os = "macos") {
        peripheral.id().to_string()
    } else {
        props.address.to_string()
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>> {
        let peripheral = self.peripheral_for(address).await?;

        // A Sonicare handle drops off the air seconds after it stops
        // advertising, and a connect attempt against a gone handle can hang
        // indefinitely at the stack level (BlueZ in particular). Cap it well
        // above the couple of seconds a healthy connect takes.
        tokio::time::timeout(Duration::from_secs(10), peripheral.connect())
            .await
            .map_err(|_| anyhow!("BLE connect() timed out after 10 s"))??;

        // BlueZ reports the connection up before its GATT cache is filled;
        // service discovery issued straight away can come back empty, after
        // which every characteristic lookup fails. Give it a moment first.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(Duration::from_secs(15), peripheral.discover_services())
            .await
            .map_err(|_| anyhow!("discover_services() timed out after 15 s"))??;
        info!("connected to {address}, services discovered");

        Ok(Box::new(BtleplugConnection {
            peripheral,
            subscribed: Mutex::new(HashSet::new()),
        }))
    }
}

/// An open btleplug connection.
///
/// Subscriptions are tracked locally so the [`Connection`] idempotence
/// contract holds: BlueZ in particular errors on a stop-notify for a
/// characteristic that was never started.
pub struct BtleplugConnection {
    peripheral: Peripheral,
    subscribed: Mutex<HashSet<Uuid>>,
}

impl BtleplugConnection {
    fn characteristic(&self, uuid: Uuid) -> Result<btleplug::api::Characteristic> {
        self.peripheral
            .characteristics()
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| anyhow!("Characteristic {uuid} not found"))
    }

    fn is_subscribed(&self, uuid: Uuid) -> bool {
        self.subscribed
            .lock()
            .expect("subscription set mutex poisoned")
            .contains(&uuid)
    }
}

#[async_trait]
impl Connection for BtleplugConnection {
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let gatt_char = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&gatt_char).await?)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        if self.is_subscribed(characteristic) {
            return Ok(());
        }
        let gatt_char = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&gatt_char).await?;
        self.subscribed
            .lock()
            .expect("subscription set mutex poisoned")
            .insert(characteristic);
        debug!("subscribed to {characteristic}");
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        if !self.is_subscribed(characteristic) {
            return Ok(());
        }
        let gatt_char = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(&gatt_char).await?;
        self.subscribed
            .lock()
            .expect("subscription set mutex poisoned")
            .remove(&characteristic);
        debug!("unsubscribed from {characteristic}");
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let stream = self.peripheral.notifications().await?;
        Ok(Box::pin(stream.map(|n| Notification {
            uuid: n.uuid,
            value: n.value,
        })))
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
