use crate::backend::{Direction, GpioBackend, Level};
use crate::error::{DirectionError, ExportError, LevelError, SequencerError};
use crate::registry::LineRegistry;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, span, warn, Level as TraceLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Unexported,
    Exported {
        direction: Option<Direction>,
        level: Option<Level>,
    },
}

/// Exclusive owner of one kernel GPIO line.
///
/// An exported line is unexported when the value is dropped, so every path
/// that exports a line also releases it.
pub struct GpioLine {
    gpio: u64,
    state: LineState,
    backend: Arc<dyn GpioBackend>,
    registry: Arc<LineRegistry>,
}

impl fmt::Debug for GpioLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioLine")
            .field("gpio", &self.gpio)
            .field("state", &self.state)
            .finish()
    }
}

impl GpioLine {
    pub fn new(gpio: u64, backend: Arc<dyn GpioBackend>, registry: Arc<LineRegistry>) -> Self {
        Self {
            gpio,
            state: LineState::Unexported,
            backend,
            registry,
        }
    }

    pub fn gpio(&self) -> u64 {
        self.gpio
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    pub fn level(&self) -> Option<Level> {
        match self.state {
            LineState::Exported { level, .. } => level,
            LineState::Unexported => None,
        }
    }

    pub fn export(&mut self) -> Result<(), ExportError> {
        let _span_ = span!(TraceLevel::TRACE, "GpioLine::export", gpio = self.gpio).entered();
        if matches!(self.state, LineState::Exported { .. }) {
            return Ok(());
        }
        if !self.registry.claim(self.gpio) {
            return Err(ExportError::AlreadyOwned { gpio: self.gpio });
        }
        if let Err(source) = self.backend.export(self.gpio) {
            self.registry.release(self.gpio);
            return Err(ExportError::Kernel {
                gpio: self.gpio,
                source,
            });
        }
        self.state = LineState::Exported {
            direction: None,
            level: None,
        };
        debug!("gpio{} exported", self.gpio);
        Ok(())
    }

    /// Takes over a line a previous invocation left exported as an output.
    pub fn adopt(&mut self) -> Result<(), ExportError> {
        if matches!(self.state, LineState::Exported { .. }) {
            return Ok(());
        }
        if !self.registry.claim(self.gpio) {
            return Err(ExportError::AlreadyOwned { gpio: self.gpio });
        }
        self.state = LineState::Exported {
            direction: Some(Direction::Out),
            level: None,
        };
        debug!("gpio{} adopted", self.gpio);
        Ok(())
    }

    pub fn set_direction(&mut self, direction: Direction) -> Result<(), DirectionError> {
        let LineState::Exported { level, .. } = self.state else {
            return Err(DirectionError::NotExported { gpio: self.gpio });
        };
        self.backend
            .set_direction(self.gpio, direction)
            .map_err(|source| DirectionError::Write {
                gpio: self.gpio,
                source,
            })?;
        self.state = LineState::Exported {
            direction: Some(direction),
            level,
        };
        Ok(())
    }

    pub fn set_level(&mut self, level: Level) -> Result<(), LevelError> {
        match self.state {
            LineState::Unexported => Err(LevelError::NotExported { gpio: self.gpio }),
            LineState::Exported {
                direction: Some(Direction::Out),
                ..
            } => {
                self.backend
                    .set_level(self.gpio, level)
                    .map_err(|source| LevelError::Write {
                        gpio: self.gpio,
                        source,
                    })?;
                self.state = LineState::Exported {
                    direction: Some(Direction::Out),
                    level: Some(level),
                };
                Ok(())
            }
            LineState::Exported { .. } => Err(LevelError::NotOutput { gpio: self.gpio }),
        }
    }

    /// Best-effort release. Failures are logged, never returned.
    pub fn unexport(&mut self) {
        if self.state == LineState::Unexported {
            return;
        }
        self.state = LineState::Unexported;
        if let Err(e) = self.backend.unexport(self.gpio) {
            warn!("failed to unexport gpio{}: {}", self.gpio, e);
        } else {
            debug!("gpio{} unexported", self.gpio);
        }
        self.registry.release(self.gpio);
    }

    /// Gives up ownership but leaves the line exported in the kernel.
    pub fn detach(mut self) -> u64 {
        if self.state != LineState::Unexported {
            self.registry.release(self.gpio);
            self.state = LineState::Unexported;
        }
        self.gpio
    }
}

impl Drop for GpioLine {
    fn drop(&mut self) {
        self.unexport();
    }
}

/// Exported output lines, kept in ascending GPIO order.
#[derive(Debug)]
pub struct LineGroup {
    lines: Vec<GpioLine>,
}

impl LineGroup {
    /// Exports each line and makes it an output, in ascending order.
    ///
    /// On failure every line exported so far is released again before the
    /// error is returned.
    pub fn acquire(
        gpios: &BTreeSet<u64>,
        backend: &Arc<dyn GpioBackend>,
        registry: &Arc<LineRegistry>,
    ) -> Result<Self, SequencerError> {
        let mut lines = Vec::with_capacity(gpios.len());
        for &gpio in gpios {
            let mut line = GpioLine::new(gpio, Arc::clone(backend), Arc::clone(registry));
            line.export()?;
            line.set_direction(Direction::Out)?;
            lines.push(line);
        }
        Ok(Self { lines })
    }

    pub fn gpios(&self) -> impl Iterator<Item = u64> + '_ {
        self.lines.iter().map(GpioLine::gpio)
    }

    /// Writes `level` to every line, returning the first failure.
    ///
    /// A failing line does not stop the remaining writes of the pass.
    pub fn drive(
        &mut self,
        level: Level,
        notify: impl FnMut(u64, Level),
    ) -> Result<(), LevelError> {
        self.drive_where(level, |_| true, notify)
    }

    /// Drives low every line that is currently high.
    pub fn darken(&mut self, notify: impl FnMut(u64, Level)) -> Result<(), LevelError> {
        self.drive_where(Level::Low, |line| line.level() == Some(Level::High), notify)
    }

    /// Like [`drive`](Self::drive), limited to the lines in `subset`.
    pub fn drive_subset(
        &mut self,
        subset: &BTreeSet<u64>,
        level: Level,
        notify: impl FnMut(u64, Level),
    ) -> Result<(), LevelError> {
        self.drive_where(level, |line| subset.contains(&line.gpio()), notify)
    }

    fn drive_where(
        &mut self,
        level: Level,
        filter: impl Fn(&GpioLine) -> bool,
        mut notify: impl FnMut(u64, Level),
    ) -> Result<(), LevelError> {
        let mut first = None;
        for line in self.lines.iter_mut().filter(|line| filter(line)) {
            match line.set_level(level) {
                Ok(()) => notify(line.gpio(), level),
                Err(e) => {
                    warn!("{}", e);
                    first.get_or_insert(e);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Unexports every line in ascending order.
    pub fn release(mut self) {
        for line in self.lines.iter_mut() {
            line.unexport();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Fault, Op, SimulatedBackend};

    fn setup() -> (Arc<SimulatedBackend>, Arc<dyn GpioBackend>, Arc<LineRegistry>) {
        let sim = Arc::new(SimulatedBackend::new());
        let backend: Arc<dyn GpioBackend> = sim.clone();
        (sim, backend, Arc::new(LineRegistry::new()))
    }

    #[test]
    fn level_requires_output_direction() {
        let (_sim, backend, registry) = setup();
        let mut line = GpioLine::new(396, backend, registry);
        assert!(matches!(
            line.set_level(Level::High),
            Err(LevelError::NotExported { gpio: 396 })
        ));
        line.export().unwrap();
        assert!(matches!(
            line.set_level(Level::High),
            Err(LevelError::NotOutput { gpio: 396 })
        ));
        line.set_direction(Direction::In).unwrap();
        assert!(matches!(
            line.set_level(Level::High),
            Err(LevelError::NotOutput { gpio: 396 })
        ));
        line.set_direction(Direction::Out).unwrap();
        line.set_level(Level::High).unwrap();
        assert_eq!(line.level(), Some(Level::High));
    }

    #[test]
    fn direction_requires_export() {
        let (sim, backend, registry) = setup();
        let mut line = GpioLine::new(396, backend, registry);
        assert!(matches!(
            line.set_direction(Direction::Out),
            Err(DirectionError::NotExported { gpio: 396 })
        ));
        assert!(sim.ops().is_empty());
    }

    #[test]
    fn drop_unexports_once() {
        let (sim, backend, registry) = setup();
        {
            let mut line = GpioLine::new(397, backend, Arc::clone(&registry));
            line.export().unwrap();
            assert!(registry.is_owned(397));
        }
        assert_eq!(sim.ops(), vec![Op::Export(397), Op::Unexport(397)]);
        assert!(!registry.is_owned(397));
    }

    #[test]
    fn unexport_without_export_is_silent() {
        let (sim, backend, registry) = setup();
        let mut line = GpioLine::new(254, backend, registry);
        line.unexport();
        drop(line);
        assert!(sim.ops().is_empty());
    }

    #[test]
    fn second_owner_is_refused_before_the_kernel() {
        let (sim, backend, registry) = setup();
        let mut first = GpioLine::new(389, Arc::clone(&backend), Arc::clone(&registry));
        first.export().unwrap();
        let mut second = GpioLine::new(389, backend, registry);
        assert!(matches!(
            second.export(),
            Err(ExportError::AlreadyOwned { gpio: 389 })
        ));
        assert_eq!(sim.ops(), vec![Op::Export(389)]);
    }

    #[test]
    fn failed_export_releases_the_claim() {
        let (sim, backend, registry) = setup();
        sim.inject(Fault { op: Op::Export(396), after: 0 });
        let mut line = GpioLine::new(396, backend, Arc::clone(&registry));
        assert!(matches!(line.export(), Err(ExportError::Kernel { gpio: 396, .. })));
        assert!(!registry.is_owned(396));
        drop(line);
        assert_eq!(sim.ops(), vec![Op::Export(396)]);
    }

    #[test]
    fn detach_keeps_kernel_export() {
        let (sim, backend, registry) = setup();
        let mut line = GpioLine::new(396, backend, Arc::clone(&registry));
        line.export().unwrap();
        assert_eq!(line.detach(), 396);
        assert!(!registry.is_owned(396));
        assert_eq!(sim.exported(), BTreeSet::from([396]));
    }

    #[test]
    fn group_acquire_rolls_back_on_direction_failure() {
        let (sim, backend, registry) = setup();
        sim.inject(Fault { op: Op::Direction(397, Direction::Out), after: 0 });
        let err = LineGroup::acquire(&BTreeSet::from([397, 396]), &backend, &registry)
            .unwrap_err();
        assert!(matches!(err, SequencerError::Direction(DirectionError::Write { gpio: 397, .. })));
        assert_eq!(
            sim.ops(),
            vec![
                Op::Export(396),
                Op::Direction(396, Direction::Out),
                Op::Export(397),
                Op::Direction(397, Direction::Out),
                Op::Unexport(397),
                Op::Unexport(396),
            ]
        );
        assert!(registry.owned().is_empty());
    }

    #[test]
    fn drive_continues_past_a_failing_line() {
        let (sim, backend, registry) = setup();
        let mut group = LineGroup::acquire(&BTreeSet::from([396, 397, 398]), &backend, &registry)
            .unwrap();
        sim.inject(Fault { op: Op::Level(397, Level::High), after: 0 });
        sim.clear_log();
        let mut lit = Vec::new();
        let err = group
            .drive(Level::High, |gpio, _| lit.push(gpio))
            .unwrap_err();
        assert_eq!(err.gpio(), 397);
        assert_eq!(lit, vec![396, 398]);
        let mut darkened = Vec::new();
        group.darken(|gpio, _| darkened.push(gpio)).unwrap();
        assert_eq!(darkened, vec![396, 398]);
        group.release();
        assert_eq!(sim.exported(), BTreeSet::new());
    }
}
