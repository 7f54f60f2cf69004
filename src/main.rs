use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

mod allowlist;
mod capture;
mod config;
mod controller;
mod messages;
mod mqtt;
mod presence;
mod reconciler;
mod remote;

use messages::ThresholdKind;
use remote::SensorClient as _;

#[derive(Parser, Debug)]
#[command(version, about = "Presence-aware light controller")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller (default).
    Run,
    /// Read or change the light sensor's brightness thresholds.
    #[command(subcommand)]
    Threshold(ThresholdCommand),
}

#[derive(Subcommand, Debug)]
enum ThresholdCommand {
    Get {
        #[arg(value_enum)]
        kind: ThresholdKind,
    },
    Set {
        #[arg(value_enum)]
        kind: ThresholdKind,
        value: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Info)
            .init();
    } else {
        pretty_env_logger::init();
    }

    let cli = Cli::parse();
    let config = config::load(&cli.config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Threshold(command) => threshold(config, command).await,
    }
}

async fn threshold(config: config::AppConfig, command: ThresholdCommand) -> anyhow::Result<()> {
    let client = remote::CoapClient::new(&config.endpoints());
    match command {
        ThresholdCommand::Get { kind } => {
            let value = client
                .threshold(kind)
                .await
                .with_context(|| format!("reading {kind:?} threshold"))?;
            println!("{}", value.trim());
        }
        ThresholdCommand::Set { kind, value } => {
            if !client.set_threshold(kind, &value.to_string()).await {
                anyhow::bail!("light sensor rejected {kind:?} threshold {value}");
            }
            info!("Set {:?} threshold to {}", kind, value);
        }
    }
    Ok(())
}

async fn run(config: config::AppConfig) -> anyhow::Result<()> {
    let presence_config = config.presence();

    let state = match allowlist::load(&presence_config.allow_list()).await {
        Ok(devices) => {
            info!("Tracking {} device(s) from allow-list", devices.len());
            presence::PresenceState::with_devices(&devices, presence_config.timeout())
        }
        Err(err) => {
            warn!("Starting with no tracked devices: {:#}", err);
            presence::PresenceState::new(presence_config.timeout())
        }
    };
    let state = Arc::new(state);

    let observed = capture::ObservedLog::create(&presence_config.observed_output()).await?;
    let source = capture::CaptureProcess::spawn(&config.capture())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mqtt = config.mqtt.as_ref().map(|mqtt_config| {
        let (client, eventloop) = mqtt::MqttClient::new(mqtt_config);
        let handle = tokio::spawn(mqtt::MqttClient::drive(eventloop, shutdown_rx.clone()));
        (client, handle)
    });

    let mut capture_handle = tokio::spawn(capture::run(
        source,
        state.clone(),
        observed,
        shutdown_rx.clone(),
    ));

    let reconciler = reconciler::Reconciler::new(&presence_config, state.clone());
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    let client = remote::CoapClient::new(&config.endpoints());
    let controller = controller::Controller::new(&config.controller(), client, state)
        .with_mqtt(mqtt.as_ref().map(|(client, _)| client.clone()));
    let controller_handle = tokio::spawn(controller.run(shutdown_rx));

    let capture_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down");
            None
        }
        result = &mut capture_handle => Some(result),
    };

    let _ = shutdown_tx.send(true);

    let capture_result = match capture_result {
        Some(result) => result,
        None => capture_handle.await,
    };
    join("reconciler", reconciler_handle).await;
    join("controller", controller_handle).await;

    if let Some((client, handle)) = mqtt {
        if let Err(err) = client.disconnect().await {
            warn!("Error disconnecting MQTT client: {:?}", err);
        }
        join("mqtt", handle).await;
    }

    // Capture ending on its own is fatal.
    match capture_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.context("presence capture failed")),
        Err(err) => Err(anyhow::Error::new(err).context("presence capture task panicked")),
    }
}

async fn join(name: &str, handle: JoinHandle<()>) {
    if let Err(err) = handle.await {
        error!("{} task failed: {:?}", name, err);
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(err) => warn!("Cannot listen for SIGTERM: {}", err),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
}
