// One-shot CLI: `led <SELECTOR> [on|off|CYCLES]`
use clap::Parser;
use eyre::{Result, WrapErr};
use gpio_leds::command;
use gpio_leds::config::{self, BackendKind};
use gpio_leds::pattern::Pattern;
use gpio_leds::registry::LineRegistry;
use gpio_leds::sequencer::Sequencer;
use std::path::PathBuf;
use tracing::{info, warn};

use git_version::git_version;
const GIT_VERSION: &str = git_version!(fallback = "unknown");

#[derive(Parser, Debug)]
#[command(name = "led", about = "Switch, blink or shine the board LEDs")]
struct Args {
    /// LED name (LED1..LED4), comma-separated LED names, or Mode_Shine
    selector: String,
    /// on, off, or a cycle count
    arg: Option<String>,
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
    info!("led version {}", GIT_VERSION);

    let pattern = command::parse(&config, &args.selector, args.arg.as_deref())
        .wrap_err("invalid arguments")?;
    let sequencer = Sequencer::new(config.backend(), LineRegistry::global(), config.shine.strategy);

    if let Pattern::SetState { line, on } = pattern {
        sequencer.set_state(line, on)?;
        // Leave a lit LED exported so it stays on after we exit.
        for gpio in sequencer.detach_all() {
            info!("gpio{} left on", gpio);
        }
        return Ok(());
    }

    let handle = sequencer.run(pattern)?;
    let canceller = handle.canceller();
    let wait = handle.wait();
    tokio::pin!(wait);
    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping pattern");
            canceller.cancel();
            wait.await
        }
    };
    info!("Done: {:?}", outcome?);
    Ok(())
}
