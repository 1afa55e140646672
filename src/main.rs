// Control daemon: serves JSON LED requests over a UNIX socket
use clap::Parser;
use eyre::{Result, WrapErr};
use gpio_leds::config::{self, BackendKind};
use gpio_leds::registry::LineRegistry;
use gpio_leds::sequencer::Sequencer;
use gpio_leds::server::{self, Control};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{error, info};

use git_version::git_version;
const GIT_VERSION: &str = git_version!(fallback = "unknown");

#[derive(Parser, Debug)]
#[command(name = "ledd", about = "Serve LED patterns over a UNIX socket")]
struct Args {
    /// Configuration file (default: gpio-leds/config.toml in the XDG config dirs)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Use the simulated kernel instead of /sys/class/gpio
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = config::load_config(args.config.as_deref())?;
    if args.dry_run {
        config.backend = BackendKind::Simulated;
    }
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(config.log_level())
        .finish();
    tracing::subscriber::set_global_default(subscriber).wrap_err("setting default subscriber failed")?;
    info!("Starting ledd version {}", GIT_VERSION);

    let socket = config.socket.clone();
    // Remove a socket left behind by a previous run
    if socket.exists() {
        std::fs::remove_file(&socket)
            .wrap_err_with(|| format!("could not remove stale {}", socket.display()))?;
    }
    let listener = UnixListener::bind(&socket)
        .wrap_err_with(|| format!("could not bind {}", socket.display()))?;
    info!("Listening on {}", socket.display());

    let sequencer = Sequencer::new(config.backend(), LineRegistry::global(), config.shine.strategy);
    let control = Arc::new(Control::new(config, sequencer));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        continue;
                    }
                };
                let control = Arc::clone(&control);
                tokio::spawn(async move {
                    if let Err(e) = server::handle_stream(&control, stream).await {
                        error!("Connection failed: {}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    control.shutdown().await;
    std::fs::remove_file(&socket).wrap_err("could not remove socket")?;
    Ok(())
}
