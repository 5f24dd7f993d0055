use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use log::{error, info};

use sonicare_ble::device::SonicareDevice;
use sonicare_ble::transport::{BtleplugTransport, TransportConfig};
use sonicare_ble::types::SensorUpdate;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=sonicare_ble=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    // Pass a Bluetooth address as the first argument to wait for one specific
    // handle instead of taking the first Sonicare that shows up.
    let config = TransportConfig {
        // Handles only advertise for a short while after being lifted off the
        // charger or having a button pressed, so scan generously.
        scan_timeout_secs: 60,
        address: std::env::args().nth(1),
    };

    // ── Discover ──────────────────────────────────────────────────────────────
    let transport = BtleplugTransport::new(config);

    info!("Scanning for a Sonicare handle (lift it or press a button to wake it) …");
    let advertisement = transport.discover().await?;

    let (device, mut updates) = SonicareDevice::new();
    let Some(hello) = device.handle_advertisement(&advertisement) else {
        bail!("{} is not a Sonicare handle", advertisement.address);
    };
    info!("Found {}", hello.title().unwrap_or(&advertisement.address));

    let address = advertisement.address.clone();

    // ── Live update printer ───────────────────────────────────────────────────
    // Notifications only flow while a brushing session keeps the connection
    // open; between sessions this task just sleeps on the channel.
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            print_update("LIVE", &update);
        }
    });

    // ── Poll loop ─────────────────────────────────────────────────────────────
    info!("Polling {address}. Press Ctrl-C to quit.\n");

    let poll_loop = async {
        let mut last_poll: Option<Instant> = None;
        loop {
            if device.poll_needed(last_poll.map(|at| at.elapsed())) {
                match device.poll(&transport, &address).await {
                    Ok(update) => print_update("POLL", &update),
                    // A failed poll usually means the handle dozed off; the
                    // next advertisement wakes the cycle again.
                    Err(e) => error!("Poll failed: {e}"),
                }
                last_poll = Some(Instant::now());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    };

    tokio::select! {
        _ = poll_loop => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, exiting.");
        }
    }
    Ok(())
}

/// Print every reading of an update, one tagged line each.
fn print_update(tag: &str, update: &SensorUpdate) {
    // HashMap order is arbitrary; sort for stable output.
    let mut readings: Vec<_> = update.readings().collect();
    readings.sort_by_key(|reading| reading.key.as_str());
    for reading in readings {
        match reading.unit {
            Some(unit) => println!("[{tag}] {:26} {} {unit}", reading.label, reading.value),
            None => println!("[{tag}] {:26} {}", reading.label, reading.value),
        }
    }
}
