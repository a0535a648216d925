//! Scan command implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;

use locker_core::{BtleOptions, BtleTransport, DiscoveredLocker, Transport, TransportEvent};

/// Scan for the scan time box and list every locker seen.
pub async fn cmd_scan(options: BtleOptions, json: bool, quiet: bool) -> Result<()> {
    let duration = options.scan_duration;
    let transport = BtleTransport::new(options)
        .await
        .context("Failed to open the Bluetooth adapter")?;
    let mut events = transport.subscribe();

    if !quiet {
        eprintln!("Scanning for lockers ({}s)...", duration.as_secs());
    }
    transport.start_scan().await.context("Failed to start scan")?;

    // Keyed by id so repeated advertisements collapse
    let mut found: BTreeMap<String, DiscoveredLocker> = BTreeMap::new();
    let deadline = tokio::time::sleep(duration + Duration::from_secs(5));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(TransportEvent::Discovered { lockers }) => {
                    for locker in lockers {
                        found.insert(locker.id.clone(), locker);
                    }
                }
                Ok(TransportEvent::ScanFinished) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            },
        }
    }
    transport.stop_scan().await.context("Failed to stop scan")?;

    let lockers: Vec<_> = found.into_values().collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&lockers)?);
    } else if lockers.is_empty() {
        println!("No lockers found.");
    } else {
        println!("{:<24} {:<40} RSSI", "LOCKER", "LINK");
        for locker in &lockers {
            let rssi = locker
                .rssi
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{:<24} {:<40} {}", locker.id, locker.link.as_str(), rssi);
        }
    }
    Ok(())
}
