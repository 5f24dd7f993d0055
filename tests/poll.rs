//! Poll orchestration driven against a scripted in-memory transport.
//!
//! Every test scripts exactly the reads one poll sequence is allowed to
//! perform; an unscripted read fails the poll, so passing tests also prove
//! no characteristic is read more often than intended.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::channel::mpsc as notify_mpsc;
use tokio::sync::mpsc;
use uuid::Uuid;

use sonicare_ble::device::SonicareDevice;
use sonicare_ble::protocol::{
    ADVERTISEMENT_SERVICE_UUID, BATTERY_CHARACTERISTIC, BRUSHING_TIME_CHARACTERISTIC,
    BRUSH_LIFETIME_CHARACTERISTIC, BRUSH_USAGE_CHARACTERISTIC, CURRENT_TIME_CHARACTERISTIC,
    MODEL_CHARACTERISTIC, MODE_CHARACTERISTIC, NOTIFY_CHARACTERISTICS,
    SERIAL_NUMBER_CHARACTERISTIC, SESSION_ID_CHARACTERISTIC, STATE_CHARACTERISTIC,
    STRENGTH_CHARACTERISTIC,
};
use sonicare_ble::transport::{
    Connection, Notification, NotificationStream, Transport,
};
use sonicare_ble::types::{
    Advertisement, DeviceClass, SensorKey, SensorUpdate, Unit, Value,
};

const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

// ── Scripted transport ────────────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    /// Per-characteristic queues of scripted read results, popped in order.
    reads: HashMap<Uuid, VecDeque<Result<Vec<u8>, String>>>,
    /// Characteristics whose reads never resolve, for cancellation tests.
    stalls: HashSet<Uuid>,
    subscriptions: Vec<Uuid>,
    unsubscriptions: Vec<Uuid>,
    connects: usize,
    disconnects: usize,
    connected: bool,
    fail_connect: bool,
    /// Held by the mock while a notification stream is open; dropping it
    /// (on disconnect) closes the stream, like a real link going down.
    notify_tx: Option<notify_mpsc::UnboundedSender<Notification>>,
}

struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _address: &str) -> Result<Box<dyn Connection>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connect {
            return Err(anyhow!("connect refused"));
        }
        state.connects += 1;
        state.connected = true;
        drop(state);
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let stalled = self.state.lock().unwrap().stalls.contains(&characteristic);
        if stalled {
            futures::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        match state
            .reads
            .get_mut(&characteristic)
            .and_then(VecDeque::pop_front)
        {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("unscripted read of {characteristic}")),
        }
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        self.state.lock().unwrap().subscriptions.push(characteristic);
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .unsubscriptions
            .push(characteristic);
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let (tx, rx) = notify_mpsc::unbounded();
        self.state.lock().unwrap().notify_tx = Some(tx);
        Ok(Box::pin(rx))
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.disconnects += 1;
        state.connected = false;
        state.notify_tx = None;
        Ok(())
    }
}

// ── Scripting helpers ─────────────────────────────────────────────────────────

fn script(state: &Arc<Mutex<MockState>>, uuid: Uuid, payload: &[u8]) {
    state
        .lock()
        .unwrap()
        .reads
        .entry(uuid)
        .or_default()
        .push_back(Ok(payload.to_vec()));
}

fn script_error(state: &Arc<Mutex<MockState>>, uuid: Uuid, message: &str) {
    state
        .lock()
        .unwrap()
        .reads
        .entry(uuid)
        .or_default()
        .push_back(Err(message.to_owned()));
}

/// The three reads every poll performs: state byte, battery, clock.
fn script_status(state: &Arc<Mutex<MockState>>, state_byte: u8, battery: u8) {
    script(state, STATE_CHARACTERISTIC, &[state_byte]);
    script(state, BATTERY_CHARACTERISTIC, &[battery]);
    script(
        state,
        CURRENT_TIME_CHARACTERISTIC,
        &1_700_000_000u32.to_le_bytes(),
    );
}

/// The session-id read. The serial-number characteristic doubles as the
/// session id, so this payload and any scripted serial-number payload pop
/// from the same queue; always script the session id first.
fn script_session(state: &Arc<Mutex<MockState>>, session_id: u8) {
    script(state, SESSION_ID_CHARACTERISTIC, &[session_id]);
}

/// The per-session batch: serial 1337, usage 2500 of 10000 (75 % left),
/// clean mode, medium strength, 300 s brushed, retail model string.
fn script_batch(state: &Arc<Mutex<MockState>>) {
    script(state, SERIAL_NUMBER_CHARACTERISTIC, &[0x39, 0x05]);
    script(state, BRUSH_USAGE_CHARACTERISTIC, &2_500u16.to_le_bytes());
    script(state, BRUSH_LIFETIME_CHARACTERISTIC, &10_000u16.to_le_bytes());
    script(state, MODE_CHARACTERISTIC, &[120]);
    script(state, STRENGTH_CHARACTERISTIC, &[1]);
    script(state, BRUSHING_TIME_CHARACTERISTIC, &[0x2c, 0x01]);
    script(state, MODEL_CHARACTERISTIC, b"HX9924/01\0\0");
}

fn advertisement() -> Advertisement {
    Advertisement {
        address: ADDRESS.to_owned(),
        local_name: Some("Sonicare".to_owned()),
        service_uuids: vec![ADVERTISEMENT_SERVICE_UUID],
        ..Advertisement::default()
    }
}

/// A device that has already seen one advertisement, plus its transport.
fn rig() -> (
    SonicareDevice,
    mpsc::Receiver<SensorUpdate>,
    MockTransport,
    Arc<Mutex<MockState>>,
) {
    let state = Arc::new(Mutex::new(MockState::default()));
    let transport = MockTransport {
        state: Arc::clone(&state),
    };
    let (device, updates) = SonicareDevice::new();
    device
        .handle_advertisement(&advertisement())
        .expect("test advertisement should be accepted");
    (device, updates, transport, state)
}

fn text(update: &SensorUpdate, key: SensorKey) -> Option<&Value> {
    update.reading(key).map(|reading| &reading.value)
}

// ── Idle polls ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn standby_poll_reads_everything_and_disconnects() {
    let (device, _updates, transport, state) = rig();
    script_status(&state, 1, 90);
    script_session(&state, 5);
    script_batch(&state);

    let update = device.poll(&transport, ADDRESS).await.unwrap();

    let battery = update.reading(SensorKey::BatteryPercent).unwrap();
    assert_eq!(battery.value, Value::Integer(90));
    assert_eq!(battery.unit, Some(Unit::Percentage));
    assert_eq!(battery.device_class, Some(DeviceClass::Battery));
    assert_eq!(battery.label, "Battery");

    assert_eq!(
        text(&update, SensorKey::ToothbrushState),
        Some(&Value::Text("standby".into()))
    );
    assert!(update.reading(SensorKey::CurrentTime).is_some());

    assert_eq!(text(&update, SensorKey::SessionId), Some(&Value::Integer(5)));
    assert_eq!(
        text(&update, SensorKey::BrushSerialNumber),
        Some(&Value::Integer(1337))
    );
    assert_eq!(
        text(&update, SensorKey::BrushHeadUsage),
        Some(&Value::Integer(2500))
    );
    assert_eq!(
        text(&update, SensorKey::BrushHeadLifetime),
        Some(&Value::Integer(10_000))
    );
    assert_eq!(
        text(&update, SensorKey::BrushHeadPercentage),
        Some(&Value::Integer(75))
    );
    assert_eq!(text(&update, SensorKey::Mode), Some(&Value::Text("clean".into())));
    assert_eq!(
        text(&update, SensorKey::BrushStrength),
        Some(&Value::Text("medium".into()))
    );
    assert_eq!(
        text(&update, SensorKey::BrushingTime),
        Some(&Value::Integer(300))
    );
    assert_eq!(
        text(&update, SensorKey::BrushType),
        Some(&Value::Text("HX9924/01".into()))
    );

    assert_eq!(update.device().map(|d| d.name.as_str()), Some("HX992X EEFF"));
    assert_eq!(update.title(), Some("HX992X EEFF"));

    let state = state.lock().unwrap();
    assert_eq!(state.connects, 1);
    assert_eq!(state.disconnects, 1);
    assert!(!state.connected);
    // An idle poll tears the four live subscriptions down and makes none.
    assert!(state.subscriptions.is_empty());
    assert_eq!(state.unsubscriptions, NOTIFY_CHARACTERISTICS.to_vec());
}

#[tokio::test]
async fn same_session_poll_skips_the_batch() {
    let (device, _updates, transport, state) = rig();
    script_status(&state, 1, 90);
    script_session(&state, 5);
    script_batch(&state);
    device.poll(&transport, ADDRESS).await.unwrap();

    // Second poll, same session id: only status reads are scripted, so any
    // attempt at a batch read would error the poll.
    script_status(&state, 1, 89);
    script_session(&state, 5);
    let update = device.poll(&transport, ADDRESS).await.unwrap();

    assert_eq!(update.len(), 3);
    assert!(update.reading(SensorKey::SessionId).is_none());
    assert!(update.reading(SensorKey::BrushType).is_none());
    assert_eq!(
        text(&update, SensorKey::BatteryPercent),
        Some(&Value::Integer(89))
    );
    assert_eq!(state.lock().unwrap().connects, 2);
}

#[tokio::test]
async fn new_session_re_emits_the_batch() {
    let (device, _updates, transport, state) = rig();
    script_status(&state, 1, 90);
    script_session(&state, 5);
    script_batch(&state);
    device.poll(&transport, ADDRESS).await.unwrap();

    script_status(&state, 1, 88);
    script_session(&state, 6);
    script_batch(&state);
    let update = device.poll(&transport, ADDRESS).await.unwrap();

    assert_eq!(text(&update, SensorKey::SessionId), Some(&Value::Integer(6)));
    assert!(update.reading(SensorKey::BrushHeadPercentage).is_some());
}

// ── Brushing polls ────────────────────────────────────────────────────────────

#[tokio::test]
async fn run_state_poll_subscribes_and_keeps_the_connection() {
    let (device, _updates, transport, state) = rig();
    script_status(&state, 2, 80);
    script_session(&state, 1);
    script_batch(&state);

    let update = device.poll(&transport, ADDRESS).await.unwrap();
    assert_eq!(
        text(&update, SensorKey::ToothbrushState),
        Some(&Value::Text("run".into()))
    );

    {
        let state = state.lock().unwrap();
        assert_eq!(state.subscriptions, NOTIFY_CHARACTERISTICS.to_vec());
        assert!(state.unsubscriptions.is_empty());
        assert_eq!(state.disconnects, 0);
        assert!(state.connected);
        assert!(state.notify_tx.is_some(), "notification pump not started");
    }

    // While the session lasts, further polls reuse the kept connection.
    script_status(&state, 2, 80);
    script_session(&state, 1);
    device.poll(&transport, ADDRESS).await.unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.connects, 1);
    assert_eq!(state.disconnects, 0);
}

#[tokio::test]
async fn poll_after_brushing_stops_disconnects() {
    let (device, _updates, transport, state) = rig();
    script_status(&state, 2, 80);
    script_session(&state, 1);
    script_batch(&state);
    device.poll(&transport, ADDRESS).await.unwrap();

    script_status(&state, 1, 80);
    script_session(&state, 1);
    device.poll(&transport, ADDRESS).await.unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.connects, 1, "should have reused the kept connection");
    assert_eq!(state.disconnects, 1);
    assert!(!state.connected);
    assert_eq!(state.unsubscriptions, NOTIFY_CHARACTERISTICS.to_vec());
}

#[tokio::test]
async fn dead_retained_connection_is_replaced() {
    let (device, _updates, transport, state) = rig();
    script_status(&state, 2, 80);
    script_session(&state, 1);
    script_batch(&state);
    device.poll(&transport, ADDRESS).await.unwrap();

    // The handle wandered out of range between polls.
    state.lock().unwrap().connected = false;

    script_status(&state, 2, 79);
    script_session(&state, 1);
    device.poll(&transport, ADDRESS).await.unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.connects, 2);
    assert!(state.connected);
}

// ── Failure paths ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn connect_failure_propagates() {
    let (device, _updates, transport, state) = rig();
    state.lock().unwrap().fail_connect = true;

    let err = device.poll(&transport, ADDRESS).await.unwrap_err();
    assert_eq!(err.to_string(), "connect refused");

    let state = state.lock().unwrap();
    assert_eq!(state.connects, 0);
    assert_eq!(state.disconnects, 0);
}

#[tokio::test]
async fn empty_state_payload_fails_the_poll() {
    let (device, _updates, transport, state) = rig();
    script(&state, STATE_CHARACTERISTIC, &[]);

    let err = device.poll(&transport, ADDRESS).await.unwrap_err();
    assert_eq!(err.to_string(), "empty state payload");

    let state = state.lock().unwrap();
    assert_eq!(state.disconnects, 1);
    assert!(!state.connected);
}

#[tokio::test]
async fn cancelled_poll_still_disconnects() {
    let (device, _updates, transport, state) = rig();
    script(&state, STATE_CHARACTERISTIC, &[1]);
    state.lock().unwrap().stalls.insert(BATTERY_CHARACTERISTIC);

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        device.poll(&transport, ADDRESS),
    )
    .await;
    assert!(
        cancelled.is_err(),
        "the stalled battery read should hold the poll past the timeout"
    );

    // Dropping the poll mid-read releases the connection from a spawned
    // task; give it a moment to run.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = state.lock().unwrap();
    assert_eq!(state.connects, 1);
    assert_eq!(state.disconnects, 1);
    assert!(!state.connected);
}

#[tokio::test]
async fn read_failure_mid_poll_still_disconnects() {
    let (device, _updates, transport, state) = rig();
    script(&state, STATE_CHARACTERISTIC, &[1]);
    script_error(&state, BATTERY_CHARACTERISTIC, "battery read failed");

    let err = device.poll(&transport, ADDRESS).await.unwrap_err();
    assert_eq!(err.to_string(), "battery read failed");

    let state = state.lock().unwrap();
    assert_eq!(state.disconnects, 1);
    assert!(!state.connected);
}

#[tokio::test]
async fn read_failure_while_brushing_retains_the_connection() {
    let (device, _updates, transport, state) = rig();
    script_status(&state, 2, 80);
    script_error(&state, SESSION_ID_CHARACTERISTIC, "session read failed");

    assert!(device.poll(&transport, ADDRESS).await.is_err());
    {
        let state = state.lock().unwrap();
        assert_eq!(state.disconnects, 0, "brushing keeps the link up on errors");
        assert!(state.connected);
    }

    // The retained connection serves the retry.
    script_status(&state, 2, 80);
    script_session(&state, 7);
    script_batch(&state);
    device.poll(&transport, ADDRESS).await.unwrap();
    assert_eq!(state.lock().unwrap().connects, 1);
}

#[tokio::test]
async fn failed_batch_is_not_retried_for_the_same_session() {
    let (device, _updates, transport, state) = rig();
    script_status(&state, 1, 90);
    script_session(&state, 5);
    script_error(&state, SERIAL_NUMBER_CHARACTERISTIC, "serial read failed");

    assert!(device.poll(&transport, ADDRESS).await.is_err());
    assert_eq!(state.lock().unwrap().disconnects, 1);

    // The session id was recorded before the batch, so the retry treats it
    // as already seen and emits status readings only.
    script_status(&state, 1, 90);
    script_session(&state, 5);
    let update = device.poll(&transport, ADDRESS).await.unwrap();
    assert_eq!(update.len(), 3);
    assert!(update.reading(SensorKey::SessionId).is_none());
}

#[tokio::test]
async fn brush_type_read_failure_skips_only_that_reading() {
    let (device, _updates, transport, state) = rig();
    script_status(&state, 1, 90);
    script_session(&state, 5);
    script(&state, SERIAL_NUMBER_CHARACTERISTIC, &[0x39, 0x05]);
    script(&state, BRUSH_USAGE_CHARACTERISTIC, &2_500u16.to_le_bytes());
    script(&state, BRUSH_LIFETIME_CHARACTERISTIC, &10_000u16.to_le_bytes());
    script(&state, MODE_CHARACTERISTIC, &[120]);
    script(&state, STRENGTH_CHARACTERISTIC, &[1]);
    script(&state, BRUSHING_TIME_CHARACTERISTIC, &[0x2c, 0x01]);
    script_error(&state, MODEL_CHARACTERISTIC, "no such characteristic");

    let update = device.poll(&transport, ADDRESS).await.unwrap();
    assert!(update.reading(SensorKey::BrushType).is_none());
    assert_eq!(text(&update, SensorKey::SessionId), Some(&Value::Integer(5)));
    assert_eq!(
        text(&update, SensorKey::BrushHeadPercentage),
        Some(&Value::Integer(75))
    );
}

// ── Live notifications ────────────────────────────────────────────────────────

#[tokio::test]
async fn live_notifications_flow_while_brushing() {
    let (device, mut updates, transport, state) = rig();
    script_status(&state, 2, 80);
    script_session(&state, 1);
    script_batch(&state);
    device.poll(&transport, ADDRESS).await.unwrap();

    let tx = state
        .lock()
        .unwrap()
        .notify_tx
        .clone()
        .expect("notification pump not started");

    tx.unbounded_send(Notification {
        uuid: BRUSHING_TIME_CHARACTERISTIC,
        value: vec![30, 0],
    })
    .unwrap();
    let update = tokio::time::timeout(Duration::from_secs(1), updates.recv())
        .await
        .expect("live update should arrive")
        .expect("update channel closed");
    assert_eq!(
        text(&update, SensorKey::BrushingTime),
        Some(&Value::Integer(30))
    );

    // The handle going back to standby by notification flips the brushing
    // flag, so the next poll tears the connection down.
    tx.unbounded_send(Notification {
        uuid: STATE_CHARACTERISTIC,
        value: vec![1],
    })
    .unwrap();
    let update = tokio::time::timeout(Duration::from_secs(1), updates.recv())
        .await
        .expect("live update should arrive")
        .expect("update channel closed");
    assert_eq!(
        text(&update, SensorKey::ToothbrushState),
        Some(&Value::Text("standby".into()))
    );

    script_status(&state, 1, 79);
    script_session(&state, 1);
    device.poll(&transport, ADDRESS).await.unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.connects, 1);
    assert_eq!(state.disconnects, 1);
    assert!(!state.connected);
}
