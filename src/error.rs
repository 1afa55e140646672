use thiserror::Error;

/// Failure reported by a [`GpioBackend`](crate::backend::GpioBackend) write.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Sysfs(#[from] sysfs_gpio::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("gpio{gpio} is already exported by this process")]
    AlreadyOwned { gpio: u64 },
    #[error("kernel refused to export gpio{gpio}: {source}")]
    Kernel {
        gpio: u64,
        #[source]
        source: BackendError,
    },
}

#[derive(Debug, Error)]
pub enum DirectionError {
    #[error("gpio{gpio} is not exported")]
    NotExported { gpio: u64 },
    #[error("failed to write direction of gpio{gpio}: {source}")]
    Write {
        gpio: u64,
        #[source]
        source: BackendError,
    },
}

#[derive(Debug, Error)]
pub enum LevelError {
    #[error("gpio{gpio} is not exported")]
    NotExported { gpio: u64 },
    #[error("gpio{gpio} is not configured as an output")]
    NotOutput { gpio: u64 },
    #[error("failed to write level of gpio{gpio}: {source}")]
    Write {
        gpio: u64,
        #[source]
        source: BackendError,
    },
}

/// Rejected pattern or selector. Raised before any kernel interaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidPattern {
    #[error("cycle count must be positive")]
    ZeroCycles,
    #[error("malformed cycle count {0:?}")]
    MalformedCycles(String),
    #[error("{0} duration must be positive")]
    ZeroDuration(&'static str),
    #[error("{0} line set is empty")]
    EmptyLineSet(&'static str),
    #[error("gpio{0} appears in both shine pairs")]
    OverlappingPairs(u64),
    #[error("unknown selector {0:?}")]
    UnknownSelector(String),
    #[error("expected one of on, off or a cycle count after {0:?}")]
    MissingArgument(String),
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Direction(#[from] DirectionError),
    #[error(transparent)]
    Level(#[from] LevelError),
    #[error(transparent)]
    InvalidPattern(#[from] InvalidPattern),
    #[error("a pattern is already running")]
    Busy,
    #[error("pattern task failed: {0}")]
    TaskFailed(String),
}

impl ExportError {
    pub fn gpio(&self) -> u64 {
        match self {
            Self::AlreadyOwned { gpio } | Self::Kernel { gpio, .. } => *gpio,
        }
    }
}

impl DirectionError {
    pub fn gpio(&self) -> u64 {
        match self {
            Self::NotExported { gpio } | Self::Write { gpio, .. } => *gpio,
        }
    }
}

impl LevelError {
    pub fn gpio(&self) -> u64 {
        match self {
            Self::NotExported { gpio } | Self::NotOutput { gpio } | Self::Write { gpio, .. } => {
                *gpio
            }
        }
    }
}

impl SequencerError {
    /// Stable name of the error kind, as shown to control clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Export(_) => "export",
            Self::Direction(_) => "direction",
            Self::Level(_) => "level",
            Self::InvalidPattern(_) => "invalid_pattern",
            Self::Busy => "busy",
            Self::TaskFailed(_) => "task_failed",
        }
    }

    /// The GPIO number the failure concerns, if any.
    pub fn gpio(&self) -> Option<u64> {
        match self {
            Self::Export(e) => Some(e.gpio()),
            Self::Direction(e) => Some(e.gpio()),
            Self::Level(e) => Some(e.gpio()),
            Self::InvalidPattern(InvalidPattern::OverlappingPairs(gpio)) => Some(*gpio),
            _ => None,
        }
    }
}
