//! The decode and poll engine for one Sonicare handle.
//!
//! [`SonicareDevice`] owns everything the radio does not: interpreting
//! advertisements into a device identity, deciding when a connection-based
//! poll is due, driving the poll read sequence, and decoding the values the
//! handle pushes while a brushing session runs. It holds no Bluetooth state
//! of its own; polls borrow a [`Transport`]. The one exception is the live
//! connection parked inside the device between polls while the handle is
//! brushing, which keeps notifications flowing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::parse::{
    decode_state, decode_text, format_epoch, lookup_mode, lookup_strength, read_uint_le,
    remaining_life_percent, short_address,
};
use crate::protocol::{
    descriptor, ADVERTISEMENT_SERVICE_UUID, BATTERY_CHARACTERISTIC, BRUSHING_TIME_CHARACTERISTIC,
    BRUSHING_UPDATE_INTERVAL, BRUSH_LIFETIME_CHARACTERISTIC, BRUSH_USAGE_CHARACTERISTIC,
    CURRENT_TIME_CHARACTERISTIC, MANUFACTURER, MODEL_CHARACTERISTIC, MODE_CHARACTERISTIC,
    NOTIFY_CHARACTERISTICS, NOT_BRUSHING_UPDATE_INTERVAL, SERIAL_NUMBER_CHARACTERISTIC,
    SESSION_ID_CHARACTERISTIC, STATE_CHARACTERISTIC, STATE_RUN, STRENGTH_CHARACTERISTIC,
    TIMEOUT_RECENTLY_BRUSHING,
};
use crate::transport::{Connection, NotificationStream, Transport};
use crate::types::{
    Advertisement, BrushingState, DeviceClass, DeviceIdentity, Model, SensorKey, SensorUpdate,
    Unit, Value,
};

/// A live connection parked in the device while a brushing session runs,
/// together with the pump task draining its notification stream.
struct Retained {
    conn: Arc<dyn Connection>,
    pump: Option<JoinHandle<()>>,
}

/// Decode and poll engine for one handle.
///
/// Construct with [`SonicareDevice::new`], which also hands back the channel
/// that carries updates decoded from live notifications. Feed advertisements
/// to [`handle_advertisement`](Self::handle_advertisement) as they arrive;
/// each time one shows the handle is online, ask
/// [`poll_needed`](Self::poll_needed) whether it is time for
/// [`poll`](Self::poll).
///
/// Clones share all state; the notification pump holds one. The caller must
/// not run two `poll`s concurrently on the same device; serialize them if
/// the surrounding code could overlap calls.
#[derive(Clone)]
pub struct SonicareDevice {
    identity: Arc<Mutex<Option<DeviceIdentity>>>,
    brushing: Arc<Mutex<BrushingState>>,
    retained: Arc<Mutex<Option<Retained>>>,
    update_tx: mpsc::Sender<SensorUpdate>,
}

impl SonicareDevice {
    /// Create a device plus the receiving end of its live-update channel.
    ///
    /// Updates decoded from notifications (state, brushing time, mode,
    /// strength) arrive on the receiver while a brushing session keeps a
    /// connection open; dropping the receiver silently discards them without
    /// stopping the state tracking.
    pub fn new() -> (Self, mpsc::Receiver<SensorUpdate>) {
        let (update_tx, update_rx) = mpsc::channel(256);
        let device = Self {
            identity: Arc::new(Mutex::new(None)),
            brushing: Arc::new(Mutex::new(BrushingState::new())),
            retained: Arc::new(Mutex::new(None)),
            update_tx,
        };
        (device, update_rx)
    }

    /// The identity built from the last accepted advertisement, if any.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity
            .lock()
            .expect("identity mutex poisoned")
            .clone()
    }

    // ── Advertisement interpreter ─────────────────────────────────────────────

    /// Interpret an advertisement, returning the identity-bearing update for
    /// a Sonicare handle or `None` for anything else.
    ///
    /// Advertisements carry no numeric sensors in this protocol generation;
    /// their value is the family service UUID (proof the handle is online)
    /// and the address used for the display name. An accepted advertisement
    /// records the identity used by later polls to pick the mode table.
    pub fn handle_advertisement(&self, advertisement: &Advertisement) -> Option<SensorUpdate> {
        if !advertisement
            .service_uuids
            .contains(&ADVERTISEMENT_SERVICE_UUID)
        {
            debug!(
                "not a Sonicare advertisement for address {}",
                advertisement.address
            );
            return None;
        }

        // TODO: pick the model from the advertised bytes via
        // Model::from_advertised_bytes once the manufacturer-data layout is
        // confirmed; every capture so far reports the DiamondClean family.
        let model = Model::HX992X;
        let name = format!(
            "{} {}",
            model.description().device_type,
            short_address(&advertisement.address)
        );
        let identity = DeviceIdentity {
            manufacturer: MANUFACTURER.to_owned(),
            model,
            name,
        };
        *self.identity.lock().expect("identity mutex poisoned") = Some(identity.clone());

        let mut update = SensorUpdate::new();
        update.set_title(identity.name.clone());
        update.set_device_identity(identity);
        Some(update)
    }

    // ── Poll scheduler ────────────────────────────────────────────────────────

    /// Whether an active poll is due, `last_poll` being the time since the
    /// previous one (`None` when there has never been one).
    ///
    /// The cadence is 15 s while brushing or within 20 s of the last observed
    /// run state, 30 s otherwise. Pure decision, no I/O.
    pub fn poll_needed(&self, last_poll: Option<Duration>) -> bool {
        let Some(age) = last_poll else {
            return true;
        };
        let interval = {
            let brushing = self.brushing.lock().expect("brushing state mutex poisoned");
            if brushing.is_brushing || brushing.recently_brushed(TIMEOUT_RECENTLY_BRUSHING) {
                BRUSHING_UPDATE_INTERVAL
            } else {
                NOT_BRUSHING_UPDATE_INTERVAL
            }
        };
        age > interval
    }

    // ── Active poll orchestrator ──────────────────────────────────────────────

    /// Connect and read everything passive listening cannot provide.
    ///
    /// The sequence, in order:
    ///
    /// 1. Reuse the connection retained by a previous brushing poll if it is
    ///    still up, else connect through `transport`.
    /// 2. Read the state byte.
    /// 3. Read battery level and the on-device clock.
    /// 4. Flip the brushing flag on the run state.
    /// 5. Brushing: subscribe to the four live characteristics and start the
    ///    notification pump. Idle: unsubscribe from them.
    /// 6. Read the session id; when it differs from the last one seen, read
    ///    the per-session batch (serial number, head usage and lifetime, mode,
    ///    strength, brushing time, and the retail model string when exposed).
    /// 7. Derive the remaining-head percentage from usage and lifetime.
    /// 8. Disconnect, unless brushing: then the connection is parked in the
    ///    device so notifications keep arriving. This holds on every exit
    ///    path, including errors and cancellation.
    /// 9. Return the update: battery, state, and clock always; the session
    ///    batch only when step 6 saw a new session.
    ///
    /// A failed poll returns the error and no readings.
    pub async fn poll(&self, transport: &dyn Transport, address: &str) -> Result<SensorUpdate> {
        debug!("polling {address}");

        // Step 1: reuse or connect. Take the retained slot in its own
        // statement so the lock never spans an await.
        let previous = self
            .retained
            .lock()
            .expect("retained connection mutex poisoned")
            .take();
        let mut reuse = None;
        if let Some(retained) = previous {
            if retained.conn.is_connected().await {
                debug!("reusing the connection retained while brushing");
                reuse = Some(retained);
            } else {
                debug!("retained connection went dead, discarding it");
                if let Some(pump) = retained.pump {
                    pump.abort();
                }
            }
        }
        let (conn, pump) = match reuse {
            Some(Retained { conn, pump }) => (conn, pump),
            None => {
                let conn: Arc<dyn Connection> = Arc::from(transport.connect(address).await?);
                (conn, None)
            }
        };

        // From here on the guard enforces the step-8 rule on every exit path.
        let mut guard = ConnectionGuard {
            conn: Some(conn.clone()),
            pump,
            retained: Arc::clone(&self.retained),
            brushing: Arc::clone(&self.brushing),
        };

        // Steps 2–7.
        let outcome = self.read_cycle(conn.as_ref(), &mut guard).await;

        // Step 8 runs before any error from the read sequence propagates; a
        // read error outranks a release error.
        let released = guard.release().await;
        let outcome = outcome?;
        released?;

        // Step 9.
        Ok(self.build_update(outcome))
    }

    /// Steps 2–7 of [`poll`](Self::poll): everything between connection
    /// acquisition and release.
    async fn read_cycle(
        &self,
        conn: &dyn Connection,
        guard: &mut ConnectionGuard,
    ) -> Result<PollOutcome> {
        // Step 2: state byte.
        let state_payload = conn.read(STATE_CHARACTERISTIC).await?;
        let state_code = *state_payload
            .first()
            .ok_or_else(|| anyhow!("empty state payload"))?;
        let state = decode_state(state_code);
        debug!("handle state is {state} (byte {state_code})");

        // Step 3: battery and clock, every poll.
        let battery_payload = conn.read(BATTERY_CHARACTERISTIC).await?;
        let battery = *battery_payload
            .first()
            .ok_or_else(|| anyhow!("empty battery payload"))?;
        let time_payload = conn.read(CURRENT_TIME_CHARACTERISTIC).await?;
        let current_time = format_epoch(read_uint_le(&time_payload));

        // Step 4: brushing transition.
        let is_brushing = state_code == STATE_RUN;
        {
            let mut brushing = self.brushing.lock().expect("brushing state mutex poisoned");
            if is_brushing {
                brushing.mark_brushing();
            } else {
                brushing.mark_idle();
            }
        }

        // Step 5: live notifications only while a session runs.
        if is_brushing {
            debug!("handle is running, subscribing to live updates");
            for uuid in NOTIFY_CHARACTERISTICS {
                conn.subscribe(uuid).await?;
            }
            self.ensure_pump(conn, guard).await?;
        } else {
            for uuid in NOTIFY_CHARACTERISTICS {
                conn.unsubscribe(uuid).await?;
            }
        }

        // Step 6: session boundary detection.
        let session_payload = conn.read(SESSION_ID_CHARACTERISTIC).await?;
        let session_id = read_uint_le(&session_payload);
        let new_session = {
            let mut brushing = self.brushing.lock().expect("brushing state mutex poisoned");
            let new_session = brushing.last_session_id != Some(session_id);
            brushing.last_session_id = Some(session_id);
            new_session
        };

        let session = if new_session {
            debug!("new brushing session {session_id}");
            Some(self.read_session_batch(conn, session_id).await?)
        } else {
            None
        };

        Ok(PollOutcome {
            state,
            battery,
            current_time,
            session,
        })
    }

    /// The per-session batch: values stable within one brushing session, so
    /// only re-read (and re-emitted) when the session id rolls.
    async fn read_session_batch(
        &self,
        conn: &dyn Connection,
        session_id: u64,
    ) -> Result<SessionBatch> {
        let serial_number = read_uint_le(&conn.read(SERIAL_NUMBER_CHARACTERISTIC).await?);
        let usage = read_uint_le(&conn.read(BRUSH_USAGE_CHARACTERISTIC).await?);
        let lifetime = read_uint_le(&conn.read(BRUSH_LIFETIME_CHARACTERISTIC).await?);
        // Step 7 of the poll sequence; the zero guard lives in parse.
        let remaining_percent = remaining_life_percent(lifetime, usage);

        let mode_code = read_uint_le(&conn.read(MODE_CHARACTERISTIC).await?);
        let mode = match self.identity().map(|identity| identity.model) {
            Some(model) => lookup_mode(model, mode_code)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("unknown mode {mode_code}")),
            None => "unknown mode".to_owned(),
        };

        let strength_code = read_uint_le(&conn.read(STRENGTH_CHARACTERISTIC).await?);
        let strength = lookup_strength(strength_code)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("unknown speed {strength_code}"));

        let brushing_time = read_uint_le(&conn.read(BRUSHING_TIME_CHARACTERISTIC).await?);

        // Not every firmware exposes the retail model string; a failed read
        // skips the reading rather than failing the poll.
        let brush_type = match conn.read(MODEL_CHARACTERISTIC).await {
            Ok(payload) => Some(decode_text(&payload)).filter(|s| !s.is_empty()),
            Err(e) => {
                debug!("brush type read failed, skipping it: {e}");
                None
            }
        };

        Ok(SessionBatch {
            session_id,
            serial_number,
            usage,
            lifetime,
            remaining_percent,
            mode,
            strength,
            brushing_time,
            brush_type,
        })
    }

    /// Spawn the notification pump unless one is already draining this
    /// connection's stream.
    async fn ensure_pump(&self, conn: &dyn Connection, guard: &mut ConnectionGuard) -> Result<()> {
        if guard.pump.as_ref().is_some_and(|pump| !pump.is_finished()) {
            return Ok(());
        }
        let stream = conn.notifications().await?;
        let device = self.clone();
        guard.pump = Some(tokio::spawn(device.pump_notifications(stream)));
        Ok(())
    }

    /// Forward every decoded notification to the update channel until the
    /// stream closes (the connection dropped or was released).
    async fn pump_notifications(self, mut stream: NotificationStream) {
        debug!("notification pump started");
        while let Some(notification) = stream.next().await {
            if let Some(update) = self.handle_notification(notification.uuid, &notification.value)
            {
                let _ = self.update_tx.send(update).await;
            }
        }
        debug!("notification stream closed, pump exiting");
    }

    // ── Notification decoder ──────────────────────────────────────────────────

    /// Decode one pushed characteristic value into an update.
    ///
    /// Dispatches on the characteristic identity: the state byte (which also
    /// drives the brushing flag), the brushing-time counter, the mode code,
    /// or the strength code. Values from characteristics this crate does not
    /// subscribe to decode to `None`, as does an empty state payload.
    pub fn handle_notification(&self, uuid: Uuid, data: &[u8]) -> Option<SensorUpdate> {
        let Some(desc) = descriptor(uuid) else {
            debug!("notification from unknown characteristic {uuid}");
            return None;
        };

        let value: Value = match desc.key {
            SensorKey::ToothbrushState => {
                let Some(&code) = data.first() else {
                    warn!("empty state notification");
                    return None;
                };
                let state = decode_state(code);
                {
                    let mut brushing =
                        self.brushing.lock().expect("brushing state mutex poisoned");
                    if code == STATE_RUN {
                        brushing.mark_brushing();
                    } else {
                        brushing.mark_idle();
                    }
                }
                debug!("state notification: {state}");
                state.into()
            }
            SensorKey::BrushingTime => (read_uint_le(data) as i64).into(),
            SensorKey::Mode => {
                let code = read_uint_le(data);
                // Bare fallback, no code suffix: live updates stay terse.
                self.identity()
                    .and_then(|identity| lookup_mode(identity.model, code))
                    .unwrap_or("unknown mode")
                    .into()
            }
            SensorKey::BrushStrength => {
                let code = read_uint_le(data);
                lookup_strength(code).unwrap_or("unknown speed").into()
            }
            _ => {
                debug!(
                    "ignoring notification for {} ({uuid})",
                    desc.key
                );
                return None;
            }
        };

        let mut update = self.base_update();
        update.update_sensor(
            desc.key,
            None,
            value,
            None,
            desc.label.unwrap_or(desc.key.as_str()),
        );
        Some(update)
    }

    // ── Update assembly ───────────────────────────────────────────────────────

    /// An empty update carrying the identity and title, when known.
    fn base_update(&self) -> SensorUpdate {
        let mut update = SensorUpdate::new();
        if let Some(identity) = self.identity() {
            update.set_title(identity.name.clone());
            update.set_device_identity(identity);
        }
        update
    }

    fn build_update(&self, outcome: PollOutcome) -> SensorUpdate {
        let mut update = self.base_update();
        update.update_sensor(
            SensorKey::BatteryPercent,
            Some(Unit::Percentage),
            i64::from(outcome.battery).into(),
            Some(DeviceClass::Battery),
            "Battery",
        );
        update.update_sensor(
            SensorKey::ToothbrushState,
            None,
            outcome.state.into(),
            None,
            "Toothbrush State",
        );
        update.update_sensor(
            SensorKey::CurrentTime,
            None,
            outcome.current_time.into(),
            None,
            "Toothbrush current time",
        );

        if let Some(session) = outcome.session {
            update.update_sensor(
                SensorKey::BrushHeadLifetime,
                None,
                (session.lifetime as i64).into(),
                None,
                "Brush head lifetime",
            );
            update.update_sensor(
                SensorKey::BrushHeadUsage,
                None,
                (session.usage as i64).into(),
                None,
                "Brush head usage",
            );
            update.update_sensor(
                SensorKey::BrushSerialNumber,
                None,
                (session.serial_number as i64).into(),
                None,
                "Toothbrush serial number",
            );
            update.update_sensor(
                SensorKey::BrushHeadPercentage,
                None,
                session.remaining_percent.into(),
                None,
                "Brush head remaining",
            );
            update.update_sensor(
                SensorKey::SessionId,
                None,
                (session.session_id as i64).into(),
                None,
                "Session ID",
            );
            update.update_sensor(
                SensorKey::BrushingTime,
                None,
                (session.brushing_time as i64).into(),
                None,
                "Brushing time",
            );
            update.update_sensor(
                SensorKey::Mode,
                None,
                session.mode.into(),
                None,
                "Toothbrush current mode",
            );
            update.update_sensor(
                SensorKey::BrushStrength,
                None,
                session.strength.into(),
                None,
                "Toothbrush current strength",
            );
            if let Some(brush_type) = session.brush_type {
                update.update_sensor(SensorKey::BrushType, None, brush_type.into(), None, "Brush type");
            }
        }
        update
    }
}

/// Raw results of one read cycle, turned into a [`SensorUpdate`] only after
/// the connection has been released.
struct PollOutcome {
    state: String,
    battery: u8,
    current_time: String,
    session: Option<SessionBatch>,
}

struct SessionBatch {
    session_id: u64,
    serial_number: u64,
    usage: u64,
    lifetime: u64,
    remaining_percent: i64,
    mode: String,
    strength: String,
    brushing_time: u64,
    brush_type: Option<String>,
}

/// Enforces the poll's release rule: disconnect on the way out of a poll
/// unless the handle is brushing, in which case the connection (and pump) is
/// parked back in the device.
///
/// [`release`](Self::release) is the normal exit and awaits the disconnect;
/// `Drop` covers error and cancellation exits, where the disconnect can only
/// be spawned best-effort. Both inspect the brushing flag as it stands at
/// release time, not as it stood when the poll began.
struct ConnectionGuard {
    conn: Option<Arc<dyn Connection>>,
    pump: Option<JoinHandle<()>>,
    retained: Arc<Mutex<Option<Retained>>>,
    brushing: Arc<Mutex<BrushingState>>,
}

impl ConnectionGuard {
    fn is_brushing(&self) -> bool {
        self.brushing
            .lock()
            .expect("brushing state mutex poisoned")
            .is_brushing
    }

    fn park(&self, conn: Arc<dyn Connection>, pump: Option<JoinHandle<()>>) {
        debug!("brushing, keeping the connection open for notifications");
        *self
            .retained
            .lock()
            .expect("retained connection mutex poisoned") = Some(Retained { conn, pump });
    }

    async fn release(mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        let pump = self.pump.take();
        if self.is_brushing() {
            self.park(conn, pump);
        } else {
            conn.disconnect().await?;
            debug!("disconnected");
        }
        Ok(())
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let pump = self.pump.take();
        if self.is_brushing() {
            self.park(conn, pump);
        } else if let Ok(handle) = tokio::runtime::Handle::try_current() {
            // The pump ends by itself once the disconnect closes the stream.
            handle.spawn(async move {
                conn.disconnect().await.ok();
            });
        }
        // Without a runtime there is nothing left to drive the disconnect;
        // the link drops with the process.
    }
}
