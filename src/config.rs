use crate::backend::{GpioBackend, SysfsBackend};
use crate::error::InvalidPattern;
use crate::pattern::{Pattern, ShineStrategy};
use crate::sim::SimulatedBackend;
use eyre::{Result, WrapErr};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const APP_PREFIX: &str = "gpio-leds";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sysfs,
    Simulated,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BlinkConfig {
    pub on_ms: u64,
    pub off_ms: u64,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            on_ms: 500,
            off_ms: 500,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ShineConfig {
    pub pair_a: Vec<String>,
    pub pair_b: Vec<String>,
    pub phase_ms: u64,
    pub cycles: u32,
    pub strategy: ShineStrategy,
}

impl Default for ShineConfig {
    fn default() -> Self {
        Self {
            pair_a: vec!["LED1".into(), "LED2".into()],
            pair_b: vec!["LED3".into(), "LED4".into()],
            phase_ms: 300,
            cycles: 5,
            strategy: ShineStrategy::PerPhase,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub backend: BackendKind,
    pub socket: PathBuf,
    /// Logical LED name to kernel GPIO number.
    pub leds: BTreeMap<String, u64>,
    pub blink: BlinkConfig,
    pub shine: ShineConfig,
}

impl Default for Config {
    fn default() -> Self {
        let leds = [("LED1", 396), ("LED2", 397), ("LED3", 254), ("LED4", 389)]
            .into_iter()
            .map(|(name, gpio)| (name.to_string(), gpio))
            .collect();
        Self {
            log_level: "info".into(),
            backend: BackendKind::Sysfs,
            socket: PathBuf::from("/tmp/gpio-leds.sock"),
            leds,
            blink: BlinkConfig::default(),
            shine: ShineConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).wrap_err("invalid configuration")?;
        config.check()?;
        Ok(config)
    }

    /// Every name the shine pairs mention must be a configured LED.
    fn check(&self) -> Result<()> {
        self.shine_pairs()
            .map(|_| ())
            .wrap_err("invalid [shine] section")
    }

    pub fn log_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }

    pub fn resolve(&self, name: &str) -> Result<u64, InvalidPattern> {
        self.leds
            .get(name)
            .copied()
            .ok_or_else(|| InvalidPattern::UnknownSelector(name.to_string()))
    }

    pub fn resolve_all<S: AsRef<str>>(&self, names: &[S]) -> Result<BTreeSet<u64>, InvalidPattern> {
        names.iter().map(|name| self.resolve(name.as_ref())).collect()
    }

    /// LED name for a GPIO number, if one is configured.
    pub fn name_of(&self, gpio: u64) -> Option<&str> {
        self.leds
            .iter()
            .find(|(_, n)| **n == gpio)
            .map(|(name, _)| name.as_str())
    }

    fn shine_pairs(&self) -> Result<(BTreeSet<u64>, BTreeSet<u64>), InvalidPattern> {
        Ok((
            self.resolve_all(&self.shine.pair_a)?,
            self.resolve_all(&self.shine.pair_b)?,
        ))
    }

    pub fn blink_pattern<S: AsRef<str>>(
        &self,
        names: &[S],
        cycles: u32,
    ) -> Result<Pattern, InvalidPattern> {
        Ok(Pattern::Blink {
            lines: self.resolve_all(names)?,
            cycles,
            on: Duration::from_millis(self.blink.on_ms),
            off: Duration::from_millis(self.blink.off_ms),
        })
    }

    pub fn shine_pattern(&self, cycles: Option<u32>) -> Result<Pattern, InvalidPattern> {
        let (pair_a, pair_b) = self.shine_pairs()?;
        Ok(Pattern::Shine {
            pair_a,
            pair_b,
            cycles: cycles.unwrap_or(self.shine.cycles),
            phase: Duration::from_millis(self.shine.phase_ms),
        })
    }

    pub fn backend(&self) -> Arc<dyn GpioBackend> {
        match self.backend {
            BackendKind::Sysfs => Arc::new(SysfsBackend),
            BackendKind::Simulated => Arc::new(SimulatedBackend::new()),
        }
    }
}

/// Loads `path` if given, else the first `gpio-leds/config.toml` in the XDG
/// config directories, else the built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => xdg::BaseDirectories::with_prefix(APP_PREFIX)
            .wrap_err("could not locate XDG directories")?
            .find_config_file(CONFIG_FILE),
    };
    match path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            let text = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("could not read {}", path.display()))?;
            let config = Config::from_toml_str(&text)
                .wrap_err_with(|| format!("in {}", path.display()))?;
            debug!("{:#?}", config);
            Ok(config)
        }
        None => {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}
