//! Kernel-facing side of a GPIO line.
//!
//! [`SysfsBackend`] speaks the `/sys/class/gpio` protocol through the
//! `sysfs_gpio` crate; [`SimulatedBackend`](crate::sim::SimulatedBackend)
//! stands in for it in tests and dry runs.

use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use std::fmt;
use sysfs_gpio::Pin;
use tracing::debug;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// The literal written to `gpio<N>/direction`.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    /// The value written to `gpio<N>/value`.
    pub fn as_u8(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// One write per call, no state kept between calls.
pub trait GpioBackend: Send + Sync {
    fn export(&self, gpio: u64) -> Result<(), BackendError>;
    fn unexport(&self, gpio: u64) -> Result<(), BackendError>;
    fn set_direction(&self, gpio: u64, direction: Direction) -> Result<(), BackendError>;
    fn set_level(&self, gpio: u64, level: Level) -> Result<(), BackendError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SysfsBackend;

impl GpioBackend for SysfsBackend {
    fn export(&self, gpio: u64) -> Result<(), BackendError> {
        debug!("export gpio{}", gpio);
        Pin::new(gpio).export()?;
        Ok(())
    }

    fn unexport(&self, gpio: u64) -> Result<(), BackendError> {
        debug!("unexport gpio{}", gpio);
        Pin::new(gpio).unexport()?;
        Ok(())
    }

    fn set_direction(&self, gpio: u64, direction: Direction) -> Result<(), BackendError> {
        debug!("gpio{} direction <- {}", gpio, direction);
        let direction = match direction {
            Direction::In => sysfs_gpio::Direction::In,
            Direction::Out => sysfs_gpio::Direction::Out,
        };
        Pin::new(gpio).set_direction(direction)?;
        Ok(())
    }

    fn set_level(&self, gpio: u64, level: Level) -> Result<(), BackendError> {
        debug!("gpio{} value <- {}", gpio, level);
        Pin::new(gpio).set_value(level.as_u8())?;
        Ok(())
    }
}
