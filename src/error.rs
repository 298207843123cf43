//! Error taxonomy for the consistency model core

/// Errors raised by the schedule, network, EMA, sampler and data loader
#[derive(thiserror::Error, Debug)]
pub enum ConsistencyError {
    #[error("invalid schedule config: {0}")]
    InvalidScheduleConfig(String),
    #[error("invalid sigma sequence: {0}")]
    InvalidSigmaSequence(String),
    #[error("shape mismatch for {name}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("parameter {0} missing from checkpoint")]
    MissingParameter(String),
    #[error("parameter tables differ at {0}")]
    TopologyMismatch(String),
    #[error("image pair {index} has mismatched sizes: visible {visible:?}, infrared {infrared:?}")]
    PairMismatch {
        index: usize,
        visible: (u32, u32),
        infrared: (u32, u32),
    },
    #[error("no usable image pairs in {0}")]
    NoValidPairs(String),
    #[error("parameter table lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    SafeTensor(#[from] safetensors::SafeTensorError),
}

impl ConsistencyError {
    /// Data-level anomalies that the training loop skips instead of aborting
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConsistencyError::PairMismatch { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConsistencyError>;
