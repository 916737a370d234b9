use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use backon::ConstantBuilder;
use backon::Retryable;
use ble::BleLink;
use config::Config;
use log::LevelFilter;
use poller::Poller;
use sensor::SensorReader;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use store::ReadingsStore;
use tokio::{net::TcpListener, sync::watch};

mod api;
mod ble;
mod config;
mod link;
mod poller;
mod reading;
mod sensor;
mod store;
mod tp357;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    TermLogger::init(
        LevelFilter::Info,
        ConfigBuilder::new()
            .set_time_format_rfc3339()
            .set_time_offset_to_local()
            .map_err(|_| anyhow::anyhow!("Failed to set time offset to local"))?
            .build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("Failed to initialize logger")?;

    if let Err(e) = run().await {
        log::error!("{e:#}");
        std::process::exit(1);
    }

    Ok(())
}

/// Connection timeout for `discover`, which is not bound to a config file.
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, PartialEq, Eq)]
enum Command {
    /// Poll the configured sensors and serve the dashboard.
    Serve { config_path: PathBuf },
    /// List the services and characteristics of one device.
    Discover { address: String },
}

impl Command {
    fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Command, anyhow::Error> {
        let mut args = args.into_iter().skip(1);
        match args.next() {
            Some(arg) if arg == "discover" => {
                let address = args
                    .next()
                    .context("Usage: tp357-dashboard discover <address>")?;
                Ok(Command::Discover { address })
            }
            Some(path) => Ok(Command::Serve {
                config_path: PathBuf::from(path),
            }),
            None => Ok(Command::Serve {
                config_path: PathBuf::from(config::CONFIG_FILE),
            }),
        }
    }
}

pub async fn run() -> Result<(), anyhow::Error> {
    match Command::parse(std::env::args())? {
        Command::Serve { config_path } => serve(&config_path).await,
        Command::Discover { address } => {
            let link = init_bluetooth().await?;
            ble::discover(&link, &address, DISCOVER_TIMEOUT)
                .await
                .with_context(|| format!("Failed to discover {address}"))
        }
    }
}

async fn init_bluetooth() -> Result<BleLink, anyhow::Error> {
    let retry_builder = ConstantBuilder::default()
        .with_delay(Duration::from_secs(1))
        .with_max_times(10);

    BleLink::new
        .retry(retry_builder)
        .notify(|e, dur| {
            log::error!("{e:#}");
            log::info!("Retrying in {:?}", dur);
        })
        .await
        .context("Failed to initialize Bluetooth")
}

async fn serve(config_path: &Path) -> Result<(), anyhow::Error> {
    let config = Config::load(config_path).context("Failed to load configuration")?;
    config.log_summary();

    let store = ReadingsStore::new(config.sensors.iter().map(|s| s.name.clone()));

    let listener = TcpListener::bind((config.bind_address, config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.bind_address, config.port))?;

    let link = init_bluetooth().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = Poller::new(
        SensorReader::new(link, store.clone()),
        config.sensors.clone(),
        config.cycle_interval(),
        config.connection_timeout(),
    );
    let polling = tokio::spawn(poller.run(shutdown_rx.clone()));

    log::info!(
        "Dashboard live at http://{}:{}",
        config.bind_address,
        config.port
    );
    let mut server = tokio::spawn(api::serve(listener, store, shutdown_rx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to wait for Ctrl+C signal")?;
            log::info!("Shutting down");
        }
        result = &mut server => {
            shutdown_tx.send_replace(true);
            polling.await.context("Polling task failed")?;
            return result.context("HTTP server task failed")?;
        }
    }

    shutdown_tx.send_replace(true);
    polling.await.context("Polling task failed")?;
    server.await.context("HTTP server task failed")??;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command, anyhow::Error> {
        Command::parse(args.iter().map(|a| a.to_string()))
    }

    #[test]
    fn test_parse_defaults_to_serve() {
        assert_eq!(
            parse(&["tp357-dashboard"]).unwrap(),
            Command::Serve {
                config_path: PathBuf::from(config::CONFIG_FILE)
            }
        );
        assert_eq!(
            parse(&["tp357-dashboard", "/etc/tp357.toml"]).unwrap(),
            Command::Serve {
                config_path: PathBuf::from("/etc/tp357.toml")
            }
        );
    }

    #[test]
    fn test_parse_discover() {
        assert_eq!(
            parse(&["tp357-dashboard", "discover", "E5:35:C4:81:8D:8C"]).unwrap(),
            Command::Discover {
                address: "E5:35:C4:81:8D:8C".to_string()
            }
        );
        assert!(parse(&["tp357-dashboard", "discover"]).is_err());
    }
}
