//! Read and unlock command implementations.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::info;

use locker_core::service_client::ApiClient;
use locker_core::{BtleTransport, LockerClient};
use locker_types::{ActionKind, Coordinates};

use crate::config::Config;
use crate::location::{FixedLocation, LogPrompt};

/// Arguments shared by the unlock commands.
#[derive(Debug, Clone)]
pub struct ActionArgs {
    pub locker: String,
    pub token: String,
    pub location: Option<Coordinates>,
}

async fn transport(config: &Config) -> Result<Arc<BtleTransport>> {
    let transport = BtleTransport::new(config.btle_options()?)
        .await
        .context("Failed to open the Bluetooth adapter")?;
    Ok(Arc::new(transport))
}

/// Read a locker's status payload.
pub async fn cmd_read(locker: &str, config: &Config, json: bool) -> Result<()> {
    let client = LockerClient::builder(transport(config).await?)
        .config(config.client_config()?)
        .build()?;

    let payload = client
        .read(locker)
        .await
        .with_context(|| format!("Failed to read locker '{}'", locker))?;

    if json {
        let body = serde_json::json!({ "locker": locker, "payload": payload });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!("{}: {}", locker, payload);
    }
    Ok(())
}

/// Run a put, take or maintenance action.
pub async fn cmd_action(action: ActionKind, args: ActionArgs, config: &Config) -> Result<()> {
    let Some(api_config) = config.api_config() else {
        bail!("'{}' needs the locker API; set [api] base_url in the config file", action);
    };
    let api = Arc::new(
        ApiClient::new(api_config.token(args.token.clone()))
            .context("Failed to create the locker API client")?,
    );
    let location = args
        .location
        .or_else(|| config.location.map(|l| Coordinates { lat: l.lat, lng: l.lng }));

    let client = LockerClient::builder(transport(config).await?)
        .config(config.client_config()?)
        .key_service(api.clone())
        .directory(api.clone())
        .network(api)
        .location(Arc::new(FixedLocation::new(location)))
        .prompt(Arc::new(LogPrompt))
        .build()?;

    info!(locker = %args.locker, %action, "Running locker action");
    let result = match action {
        ActionKind::Put => client.put(&args.token, &args.locker).await,
        ActionKind::Take => client.take(&args.token, &args.locker).await,
        ActionKind::OpenForMaintenance => {
            client
                .open_for_maintenance(&args.token, &args.locker)
                .await
        }
        ActionKind::Read => bail!("use the read command to read a locker"),
    };
    let path = result.with_context(|| format!("Failed to {} locker '{}'", action, args.locker))?;

    println!("{}: {} succeeded via {}", args.locker, action, path);
    Ok(())
}
