//! Shared test infrastructure for gpio-leds integration tests

#![allow(dead_code)] // Items used across multiple test files; Rust analyzes per-file

use gpio_leds::sim::Op;
use gpio_leds::{Level, LineRegistry, Sequencer, ShineStrategy, SimulatedBackend};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A sequencer over a simulated kernel with its own registry.
pub struct Rig {
    pub sim: Arc<SimulatedBackend>,
    pub registry: Arc<LineRegistry>,
    pub sequencer: Sequencer,
}

pub fn rig() -> Rig {
    rig_with(SimulatedBackend::new(), ShineStrategy::PerPhase)
}

pub fn rig_with(sim: SimulatedBackend, strategy: ShineStrategy) -> Rig {
    let sim = Arc::new(sim);
    let registry = Arc::new(LineRegistry::new());
    let sequencer = Sequencer::new(sim.clone(), Arc::clone(&registry), strategy);
    Rig {
        sim,
        registry,
        sequencer,
    }
}

pub fn lines(gpios: &[u64]) -> BTreeSet<u64> {
    gpios.iter().copied().collect()
}

/// Checks the kernel-side lifecycle of every line in `ops`: an export
/// precedes any direction or level write, no line is exported twice without
/// an unexport in between, and every exported line ends up unexported.
pub fn assert_lifecycle(ops: &[Op]) {
    let mut exported: BTreeMap<u64, bool> = BTreeMap::new();
    for (i, op) in ops.iter().enumerate() {
        let is_exported = exported.entry(op.gpio()).or_insert(false);
        match op {
            Op::Export(gpio) => {
                assert!(!*is_exported, "gpio{} exported twice at op {}: {:?}", gpio, i, ops);
                *is_exported = true;
            }
            Op::Unexport(gpio) => {
                assert!(*is_exported, "gpio{} unexported while not exported at op {}: {:?}", gpio, i, ops);
                *is_exported = false;
            }
            Op::Direction(gpio, _) | Op::Level(gpio, _) => {
                assert!(*is_exported, "gpio{} written while not exported at op {}: {:?}", gpio, i, ops);
            }
        }
    }
    let leaked: Vec<u64> = exported
        .into_iter()
        .filter(|(_, exported)| *exported)
        .map(|(gpio, _)| gpio)
        .collect();
    assert!(leaked.is_empty(), "lines left exported: {:?}", leaked);
}

/// Groups consecutive `Level(_, High)` writes into the sets they light.
pub fn high_passes(ops: &[Op]) -> Vec<BTreeSet<u64>> {
    let mut passes = Vec::new();
    let mut current = BTreeSet::new();
    for op in ops {
        match op {
            Op::Level(gpio, Level::High) => {
                current.insert(*gpio);
            }
            _ if !current.is_empty() => passes.push(std::mem::take(&mut current)),
            _ => {}
        }
    }
    if !current.is_empty() {
        passes.push(current);
    }
    passes
}

pub fn count(ops: &[Op], wanted: Op) -> usize {
    ops.iter().filter(|op| **op == wanted).count()
}
