use clap::Parser;
use eyre::{Result, WrapErr};
use gpio_leds::backend::SysfsBackend;
use gpio_leds::pattern::{Pattern, ShineStrategy};
use gpio_leds::registry::LineRegistry;
use gpio_leds::sequencer::Sequencer;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Blink one raw GPIO number through /sys/class/gpio
#[derive(Parser, Debug)]
#[command(name = "test_gpio")]
struct Args {
    /// Kernel GPIO number
    gpio: u64,
    #[arg(default_value_t = 10)]
    cycles: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber).wrap_err("setting default subscriber failed")?;

    let sequencer = Sequencer::new(Arc::new(SysfsBackend), LineRegistry::global(), ShineStrategy::PerPhase);
    let outcome = sequencer
        .run(Pattern::Blink {
            lines: BTreeSet::from([args.gpio]),
            cycles: args.cycles,
            on: Duration::from_millis(200),
            off: Duration::from_millis(200),
        })?
        .wait()
        .await?;
    info!("gpio{}: {:?}", args.gpio, outcome);
    Ok(())
}
