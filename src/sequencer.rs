//! Timed LED patterns over [`GpioLine`]s.
//!
//! `SetState` runs on the caller's task. `Blink` and `Shine` run on a
//! spawned tokio task so the caller stays free to query state or cancel;
//! only one of them runs at a time.

use crate::backend::{Direction, GpioBackend, Level};
use crate::error::{DirectionError, ExportError, LevelError, SequencerError};
use crate::line::{GpioLine, LineGroup};
use crate::pattern::{Pattern, PatternKind, ShineStrategy};
use crate::registry::LineRegistry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerEvent {
    Level { gpio: u64, level: Level },
    Released { gpio: u64 },
    Finished {
        pattern: PatternKind,
        result: Result<PatternOutcome, String>,
    },
}

struct Inner {
    backend: Arc<dyn GpioBackend>,
    registry: Arc<LineRegistry>,
    shine_strategy: ShineStrategy,
    busy: AtomicBool,
    /// Lines exported through the single-line calls, not by a pattern.
    held: Mutex<BTreeMap<u64, GpioLine>>,
    levels: Mutex<BTreeMap<u64, Level>>,
    events: broadcast::Sender<SequencerEvent>,
}

#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<Inner>,
}

impl Sequencer {
    pub fn new(
        backend: Arc<dyn GpioBackend>,
        registry: Arc<LineRegistry>,
        shine_strategy: ShineStrategy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                backend,
                registry,
                shine_strategy,
                busy: AtomicBool::new(false),
                held: Mutex::new(BTreeMap::new()),
                levels: Mutex::new(BTreeMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequencerEvent> {
        self.inner.events.subscribe()
    }

    /// True while a `Blink` or `Shine` is running.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Last written level of every line currently exported through this sequencer.
    pub fn line_levels(&self) -> BTreeMap<u64, Level> {
        lock(&self.inner.levels).clone()
    }

    pub fn held_lines(&self) -> Vec<u64> {
        self.inner.held().keys().copied().collect()
    }

    pub fn export_line(&self, gpio: u64) -> Result<(), ExportError> {
        let mut held = self.inner.held();
        if held.contains_key(&gpio) {
            return Ok(());
        }
        let mut line = self.inner.line(gpio);
        line.export()?;
        held.insert(gpio, line);
        Ok(())
    }

    pub fn set_direction(&self, gpio: u64, direction: Direction) -> Result<(), DirectionError> {
        self.inner
            .held()
            .get_mut(&gpio)
            .ok_or(DirectionError::NotExported { gpio })?
            .set_direction(direction)
    }

    pub fn set_level(&self, gpio: u64, level: Level) -> Result<(), LevelError> {
        let mut held = self.inner.held();
        held.get_mut(&gpio)
            .ok_or(LevelError::NotExported { gpio })?
            .set_level(level)?;
        self.inner.record_level(gpio, level);
        Ok(())
    }

    /// Best-effort; does nothing for a line this sequencer does not hold.
    pub fn unexport_line(&self, gpio: u64) {
        let line = self.inner.held().remove(&gpio);
        match line {
            Some(mut line) => {
                line.unexport();
                self.inner.record_released(gpio);
            }
            None => debug!("gpio{} is not held, nothing to unexport", gpio),
        }
    }

    /// Single-line toggle. The line stays exported between `on` and `off`.
    pub fn set_state(&self, gpio: u64, on: bool) -> Result<(), SequencerError> {
        info!("gpio{} -> {}", gpio, if on { "on" } else { "off" });
        if on {
            self.export_line(gpio)?;
            let lit = self
                .set_direction(gpio, Direction::Out)
                .map_err(SequencerError::from)
                .and_then(|()| self.set_level(gpio, Level::High).map_err(SequencerError::from));
            if lit.is_err() {
                self.unexport_line(gpio);
            }
            lit
        } else {
            self.adopt_line(gpio)?;
            let lowered = self.set_level(gpio, Level::Low);
            self.unexport_line(gpio);
            lowered.map_err(SequencerError::from)
        }
    }

    fn adopt_line(&self, gpio: u64) -> Result<(), ExportError> {
        let mut held = self.inner.held();
        if held.contains_key(&gpio) {
            return Ok(());
        }
        let mut line = self.inner.line(gpio);
        line.adopt()?;
        held.insert(gpio, line);
        Ok(())
    }

    /// Stops tracking every held line but leaves them exported and driven,
    /// so they outlive the process.
    pub fn detach_all(&self) -> Vec<u64> {
        let held = std::mem::take(&mut *self.inner.held());
        let gpios: Vec<u64> = held.into_values().map(GpioLine::detach).collect();
        let mut levels = lock(&self.inner.levels);
        for gpio in &gpios {
            levels.remove(gpio);
        }
        gpios
    }

    /// Drives every held line low and unexports it.
    pub fn shutdown(&self) {
        let held = std::mem::take(&mut *self.inner.held());
        for (gpio, mut line) in held {
            match line.set_level(Level::Low) {
                Ok(()) => self.inner.record_level(gpio, Level::Low),
                Err(e) => warn!("could not turn off gpio{}: {}", gpio, e),
            }
            line.unexport();
            self.inner.record_released(gpio);
        }
    }

    /// Validates and starts `pattern`.
    ///
    /// `SetState` completes before this returns. `Blink` and `Shine` are
    /// spawned on the tokio runtime and must be awaited or cancelled through
    /// the returned handle; starting one while another runs fails with
    /// [`SequencerError::Busy`].
    pub fn run(&self, pattern: Pattern) -> Result<PatternHandle, SequencerError> {
        pattern.validate()?;
        let kind = pattern.kind();
        if let Pattern::SetState { line, on } = pattern {
            self.set_state(line, on)?;
            return Ok(PatternHandle::finished(kind));
        }

        let busy = BusyGuard::acquire(&self.inner)?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = async move {
            let mut cancel = CancelSignal(cancel_rx);
            let result = match pattern {
                Pattern::Blink {
                    lines,
                    cycles,
                    on,
                    off,
                } => blink(&inner, &lines, cycles, on, off, &mut cancel).await,
                Pattern::Shine {
                    pair_a,
                    pair_b,
                    cycles,
                    phase,
                } => {
                    let phases = phases(&pair_a, &pair_b, cycles);
                    match inner.shine_strategy {
                        ShineStrategy::PerPhase => {
                            shine_per_phase(&inner, phases, phase, &mut cancel).await
                        }
                        ShineStrategy::HoldAll => {
                            let all = pair_a.union(&pair_b).copied().collect();
                            shine_hold_all(&inner, &all, phases, phase, &mut cancel).await
                        }
                    }
                }
                // Handled synchronously before spawning.
                Pattern::SetState { .. } => Ok(PatternOutcome::Completed),
            };
            drop(busy);
            match &result {
                Ok(outcome) => info!("{} finished: {:?}", kind, outcome),
                Err(e) => error!("{} failed: {}", kind, e),
            }
            inner.emit(SequencerEvent::Finished {
                pattern: kind,
                result: result.as_ref().map(|o| *o).map_err(|e| e.to_string()),
            });
            result
        };
        let join = tokio::spawn(task.instrument(info_span!("pattern", kind = %kind)));
        Ok(PatternHandle {
            kind,
            cancel: Arc::new(cancel_tx),
            join: Some(join),
        })
    }
}

impl Inner {
    fn held(&self) -> MutexGuard<'_, BTreeMap<u64, GpioLine>> {
        lock(&self.held)
    }

    fn line(&self, gpio: u64) -> GpioLine {
        GpioLine::new(gpio, Arc::clone(&self.backend), Arc::clone(&self.registry))
    }

    fn emit(&self, event: SequencerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn record_level(&self, gpio: u64, level: Level) {
        lock(&self.levels).insert(gpio, level);
        self.emit(SequencerEvent::Level { gpio, level });
    }

    fn record_released(&self, gpio: u64) {
        lock(&self.levels).remove(&gpio);
        self.emit(SequencerEvent::Released { gpio });
    }

    fn acquire(&self, gpios: &BTreeSet<u64>) -> Result<LineGroup, SequencerError> {
        LineGroup::acquire(gpios, &self.backend, &self.registry)
    }

    fn drive(&self, group: &mut LineGroup, level: Level) -> Result<(), LevelError> {
        group.drive(level, |gpio, level| self.record_level(gpio, level))
    }

    fn drive_subset(
        &self,
        group: &mut LineGroup,
        subset: &BTreeSet<u64>,
        level: Level,
    ) -> Result<(), LevelError> {
        group.drive_subset(subset, level, |gpio, level| self.record_level(gpio, level))
    }

    /// Turns off whatever is still lit, then unexports the whole group.
    fn release(&self, mut group: LineGroup) {
        if let Err(e) = group.darken(|gpio, level| self.record_level(gpio, level)) {
            warn!("could not turn off gpio{} before release: {}", e.gpio(), e);
        }
        let gpios: Vec<u64> = group.gpios().collect();
        group.release();
        for gpio in gpios {
            self.record_released(gpio);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the busy flag when the pattern task ends, even by panic.
struct BusyGuard(Arc<Inner>);

impl BusyGuard {
    fn acquire(inner: &Arc<Inner>) -> Result<Self, SequencerError> {
        inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SequencerError::Busy)?;
        Ok(Self(Arc::clone(inner)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

struct Cancelled;

struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Sleeps for `duration` unless cancellation arrives first.
    async fn pause(&mut self, duration: Duration) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = wait_cancelled(&mut self.0) => Err(Cancelled),
        }
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped without cancelling: run to completion.
            std::future::pending::<()>().await;
        }
    }
}

/// Cancels the pattern it was taken from. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Canceller(Arc<watch::Sender<bool>>);

impl Canceller {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

pub struct PatternHandle {
    kind: PatternKind,
    cancel: Arc<watch::Sender<bool>>,
    join: Option<JoinHandle<Result<PatternOutcome, SequencerError>>>,
}

impl PatternHandle {
    fn finished(kind: PatternKind) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            kind,
            cancel: Arc::new(cancel),
            join: None,
        }
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    /// Asks the pattern to stop at its next delay. Its lines are still released.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn canceller(&self) -> Canceller {
        Canceller(Arc::clone(&self.cancel))
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub async fn wait(mut self) -> Result<PatternOutcome, SequencerError> {
        match self.join.take() {
            None => Ok(PatternOutcome::Completed),
            Some(join) => match join.await {
                Ok(result) => result,
                Err(e) => Err(SequencerError::TaskFailed(e.to_string())),
            },
        }
    }
}

/// Active set of each shine phase: `pair_a` first, then alternating.
fn phases<'a>(
    pair_a: &'a BTreeSet<u64>,
    pair_b: &'a BTreeSet<u64>,
    cycles: u32,
) -> impl Iterator<Item = &'a BTreeSet<u64>> + Send + 'a {
    (0..u64::from(cycles) * 2).map(move |i| if i % 2 == 0 { pair_a } else { pair_b })
}

async fn blink(
    inner: &Inner,
    lines: &BTreeSet<u64>,
    cycles: u32,
    on: Duration,
    off: Duration,
    cancel: &mut CancelSignal,
) -> Result<PatternOutcome, SequencerError> {
    info!("blink {:?} x{} ({:?} on, {:?} off)", lines, cycles, on, off);
    let mut group = inner.acquire(lines)?;
    let result = blink_cycles(inner, &mut group, cycles, on, off, cancel).await;
    inner.release(group);
    result
}

async fn blink_cycles(
    inner: &Inner,
    group: &mut LineGroup,
    cycles: u32,
    on: Duration,
    off: Duration,
    cancel: &mut CancelSignal,
) -> Result<PatternOutcome, SequencerError> {
    for cycle in 1..=cycles {
        if cancel.is_cancelled() {
            return Ok(PatternOutcome::Cancelled);
        }
        trace!("blink cycle {}/{}", cycle, cycles);
        inner.drive(group, Level::High)?;
        if cancel.pause(on).await.is_err() {
            return Ok(PatternOutcome::Cancelled);
        }
        inner.drive(group, Level::Low)?;
        if cancel.pause(off).await.is_err() {
            return Ok(PatternOutcome::Cancelled);
        }
    }
    Ok(PatternOutcome::Completed)
}

async fn shine_per_phase<'a>(
    inner: &Inner,
    phases: impl Iterator<Item = &'a BTreeSet<u64>>,
    phase: Duration,
    cancel: &mut CancelSignal,
) -> Result<PatternOutcome, SequencerError> {
    info!("shine, per-phase export, {:?} per phase", phase);
    for (index, active) in phases.enumerate() {
        if cancel.is_cancelled() {
            return Ok(PatternOutcome::Cancelled);
        }
        trace!("shine phase {}: {:?}", index + 1, active);
        let mut group = inner.acquire(active)?;
        if let Err(e) = inner.drive(&mut group, Level::High) {
            inner.release(group);
            return Err(e.into());
        }
        let interrupted = cancel.pause(phase).await.is_err();
        let lowered = inner.drive(&mut group, Level::Low);
        inner.release(group);
        lowered?;
        if interrupted || cancel.pause(phase).await.is_err() {
            return Ok(PatternOutcome::Cancelled);
        }
    }
    Ok(PatternOutcome::Completed)
}

async fn shine_hold_all<'a>(
    inner: &Inner,
    all: &BTreeSet<u64>,
    phases: impl Iterator<Item = &'a BTreeSet<u64>>,
    phase: Duration,
    cancel: &mut CancelSignal,
) -> Result<PatternOutcome, SequencerError> {
    info!("shine, holding {:?}, {:?} per phase", all, phase);
    let mut group = inner.acquire(all)?;
    let result = shine_held(inner, &mut group, phases, phase, cancel).await;
    inner.release(group);
    result
}

async fn shine_held<'a>(
    inner: &Inner,
    group: &mut LineGroup,
    phases: impl Iterator<Item = &'a BTreeSet<u64>>,
    phase: Duration,
    cancel: &mut CancelSignal,
) -> Result<PatternOutcome, SequencerError> {
    for (index, active) in phases.enumerate() {
        if cancel.is_cancelled() {
            return Ok(PatternOutcome::Cancelled);
        }
        trace!("shine phase {}: {:?}", index + 1, active);
        inner.drive_subset(group, active, Level::High)?;
        if cancel.pause(phase).await.is_err() {
            return Ok(PatternOutcome::Cancelled);
        }
        inner.drive_subset(group, active, Level::Low)?;
        if cancel.pause(phase).await.is_err() {
            return Ok(PatternOutcome::Cancelled);
        }
    }
    Ok(PatternOutcome::Completed)
}
