use crate::error::InvalidPattern;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// How `Shine` holds its lines.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ShineStrategy {
    /// Each pair is exported for its own phase only.
    #[default]
    PerPhase,
    /// Both pairs stay exported for the whole run; only levels change.
    HoldAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    SetState {
        line: u64,
        on: bool,
    },
    Blink {
        lines: BTreeSet<u64>,
        cycles: u32,
        on: Duration,
        off: Duration,
    },
    /// `cycles` rounds of `pair_a` then `pair_b`, one phase each.
    Shine {
        pair_a: BTreeSet<u64>,
        pair_b: BTreeSet<u64>,
        cycles: u32,
        phase: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    SetState,
    Blink,
    Shine,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PatternKind::SetState => "set_state",
            PatternKind::Blink => "blink",
            PatternKind::Shine => "shine",
        })
    }
}

impl Pattern {
    pub fn kind(&self) -> PatternKind {
        match self {
            Pattern::SetState { .. } => PatternKind::SetState,
            Pattern::Blink { .. } => PatternKind::Blink,
            Pattern::Shine { .. } => PatternKind::Shine,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidPattern> {
        match self {
            Pattern::SetState { .. } => Ok(()),
            Pattern::Blink {
                lines,
                cycles,
                on,
                off,
            } => {
                non_empty(lines, "blink")?;
                positive_cycles(*cycles)?;
                positive(*on, "on")?;
                positive(*off, "off")
            }
            Pattern::Shine {
                pair_a,
                pair_b,
                cycles,
                phase,
            } => {
                non_empty(pair_a, "first shine")?;
                non_empty(pair_b, "second shine")?;
                if let Some(gpio) = pair_a.intersection(pair_b).next() {
                    return Err(InvalidPattern::OverlappingPairs(*gpio));
                }
                positive_cycles(*cycles)?;
                positive(*phase, "phase")
            }
        }
    }
}

fn non_empty(lines: &BTreeSet<u64>, which: &'static str) -> Result<(), InvalidPattern> {
    if lines.is_empty() {
        Err(InvalidPattern::EmptyLineSet(which))
    } else {
        Ok(())
    }
}

fn positive_cycles(cycles: u32) -> Result<(), InvalidPattern> {
    if cycles == 0 {
        Err(InvalidPattern::ZeroCycles)
    } else {
        Ok(())
    }
}

fn positive(duration: Duration, which: &'static str) -> Result<(), InvalidPattern> {
    if duration.is_zero() {
        Err(InvalidPattern::ZeroDuration(which))
    } else {
        Ok(())
    }
}
