//! In-memory stand-in for `/sys/class/gpio`.
//!
//! Mirrors the kernel's bookkeeping closely enough to catch lifecycle
//! mistakes: exporting twice fails, writing to an unexported line fails, and
//! so does unexporting a line nobody exported. Every call is recorded with a
//! timestamp from the tokio clock, so tests running with a paused clock can
//! assert on exact delays between writes.

use crate::backend::{Direction, GpioBackend, Level};
use crate::error::BackendError;
use std::collections::BTreeSet;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// A single call as seen by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Export(u64),
    Unexport(u64),
    Direction(u64, Direction),
    Level(u64, Level),
}

impl Op {
    pub fn gpio(&self) -> u64 {
        match *self {
            Op::Export(gpio) | Op::Unexport(gpio) | Op::Direction(gpio, _) | Op::Level(gpio, _) => {
                gpio
            }
        }
    }
}

/// Makes calls matching `op` fail once `after` of them have succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub op: Op,
    pub after: usize,
}

#[derive(Debug, Default)]
struct SimState {
    log: Vec<(Instant, Op)>,
    exported: BTreeSet<u64>,
    faults: Vec<(Fault, usize)>,
}

#[derive(Debug)]
pub struct SimulatedBackend {
    origin: Instant,
    state: Mutex<SimState>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Lines that some other owner already exported before we started.
    pub fn with_exported(gpios: impl IntoIterator<Item = u64>) -> Self {
        let backend = Self::new();
        backend.lock().exported.extend(gpios);
        backend
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push((fault, 0));
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().log.iter().map(|(_, op)| *op).collect()
    }

    /// Recorded calls with their offset from the creation of the backend.
    pub fn timeline(&self) -> Vec<(Duration, Op)> {
        self.lock()
            .log
            .iter()
            .map(|(at, op)| (at.duration_since(self.origin), *op))
            .collect()
    }

    pub fn exported(&self) -> BTreeSet<u64> {
        self.lock().exported.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, op: Op) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.log.push((Instant::now(), op));
        info!("simulated {:?}", op);

        for (fault, seen) in state.faults.iter_mut() {
            if fault.op == op {
                if *seen >= fault.after {
                    return Err(io::Error::new(io::ErrorKind::Other, "injected fault").into());
                }
                *seen += 1;
            }
        }

        let gpio = op.gpio();
        match op {
            Op::Export(_) => {
                if !state.exported.insert(gpio) {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("gpio{} is busy", gpio),
                    )
                    .into());
                }
            }
            Op::Unexport(_) => {
                if !state.exported.remove(&gpio) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("gpio{} is not exported", gpio),
                    )
                    .into());
                }
            }
            Op::Direction(..) | Op::Level(..) => {
                if !state.exported.contains(&gpio) {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("/sys/class/gpio/gpio{} does not exist", gpio),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }
}

impl GpioBackend for SimulatedBackend {
    fn export(&self, gpio: u64) -> Result<(), BackendError> {
        self.apply(Op::Export(gpio))
    }

    fn unexport(&self, gpio: u64) -> Result<(), BackendError> {
        self.apply(Op::Unexport(gpio))
    }

    fn set_direction(&self, gpio: u64, direction: Direction) -> Result<(), BackendError> {
        self.apply(Op::Direction(gpio, direction))
    }

    fn set_level(&self, gpio: u64, level: Level) -> Result<(), BackendError> {
        self.apply(Op::Level(gpio, level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_export_is_rejected() {
        let sim = SimulatedBackend::new();
        sim.export(396).unwrap();
        assert!(sim.export(396).is_err());
        assert_eq!(sim.ops(), vec![Op::Export(396), Op::Export(396)]);
    }

    #[test]
    fn writes_need_an_exported_line() {
        let sim = SimulatedBackend::new();
        assert!(sim.set_direction(397, Direction::Out).is_err());
        assert!(sim.set_level(397, Level::High).is_err());
        assert!(sim.unexport(397).is_err());
    }

    #[test]
    fn fault_fires_after_given_successes() {
        let sim = SimulatedBackend::new();
        sim.export(254).unwrap();
        sim.inject(Fault { op: Op::Level(254, Level::High), after: 1 });
        assert!(sim.set_level(254, Level::High).is_ok());
        assert!(sim.set_level(254, Level::Low).is_ok());
        assert!(sim.set_level(254, Level::High).is_err());
        assert!(sim.set_level(254, Level::High).is_err());
    }
}
