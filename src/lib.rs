//! Drive LEDs wired to Linux sysfs GPIO lines: single on/off toggles,
//! synchronized blinking and an alternating "shine" between two pairs.

pub mod backend;
pub mod command;
pub mod config;
pub mod error;
pub mod line;
pub mod pattern;
pub mod registry;
pub mod sequencer;
pub mod server;
pub mod sim;

pub use backend::{Direction, GpioBackend, Level, SysfsBackend};
pub use error::{DirectionError, ExportError, InvalidPattern, LevelError, SequencerError};
pub use line::{GpioLine, LineGroup, LineState};
pub use pattern::{Pattern, ShineStrategy};
pub use registry::LineRegistry;
pub use sequencer::{PatternHandle, PatternOutcome, Sequencer, SequencerEvent};
pub use sim::SimulatedBackend;
