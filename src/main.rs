use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use voice_relay::client::{
    AudioOutput, ClientOptions, ClientSessionController, ConnectionState, ControllerEvent, NullOutput,
    PcmFileDevice, PcmWriterOutput, Severity, websocket_url,
};
use voice_relay::config::RelayConfig;

/// Realtime voice session relay
#[derive(Parser, Debug)]
#[command(name = "voice-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Bind host (overrides RELAY_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides RELAY_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Upstream realtime WebSocket endpoint
        #[arg(long)]
        upstream_url: Option<String>,

        /// Upstream model
        #[arg(long)]
        model: Option<String>,
    },

    /// Talk to a running relay, using a raw PCM16 file as the microphone
    Talk {
        /// Relay base URL (http, https, ws or wss)
        #[arg(long, default_value = "http://127.0.0.1:8787")]
        relay: String,

        /// 24 kHz mono PCM16 input
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Where to write assistant audio; `-` for stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    match Cli::parse().command {
        Commands::Serve { host, port, upstream_url, model } => {
            let mut config = RelayConfig::from_env()?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(url) = upstream_url {
                config.upstream_url = url;
            }
            if let Some(model) = model {
                config.model = model;
            }
            voice_relay::relay::serve(config, shutdown_signal()).await?;
        }
        Commands::Talk { relay, input, output } => talk(&relay, input, output).await?,
    }
    Ok(())
}

async fn talk(relay: &str, input: PathBuf, output: Option<PathBuf>) -> anyhow::Result<()> {
    let url = websocket_url(relay, "/realtime")?;
    let output: Box<dyn AudioOutput> = match output {
        None => Box::new(NullOutput),
        Some(path) if path.as_os_str() == "-" => Box::new(PcmWriterOutput::new(tokio::io::stdout())),
        Some(path) => {
            let file = tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Box::new(PcmWriterOutput::new(file))
        }
    };

    let mut controller = ClientSessionController::new(
        ClientOptions::new(url),
        Arc::new(PcmFileDevice::new(input)),
        output,
    );
    let mut states = controller.state_changes();
    controller.connect().await?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut was_live = false;

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                eprintln!("[{state}]");
                was_live |= state.is_live();
                if was_live && state == ConnectionState::Idle {
                    break;
                }
            }
            Some(event) = controller.next_event() => match event {
                ControllerEvent::Notice(notice) => {
                    let marker = match notice.severity {
                        Severity::Info => "info",
                        Severity::Error => "error",
                    };
                    eprintln!("{marker}: {}: {}", notice.title, notice.description);
                }
                ControllerEvent::TranscriptDelta { delta, .. } => eprint!("{delta}"),
            },
        }
    }

    info!("Ending voice session");
    controller.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
