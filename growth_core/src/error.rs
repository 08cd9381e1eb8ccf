use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EstimationError {
    #[error("invalid covariance: {0}")]
    InvalidCovariance(String),
    #[error("numerical instability: {0}")]
    NumericalInstability(String),
    #[error("mixed source mode: od source live={od_live}, event source live={events_live}")]
    MixedSourceMode { od_live: bool, events_live: bool },
    #[error("missing calibration for experiment {0:?}: historical runs need a cached normalization baseline")]
    MissingCalibration(String),
    #[error("initialization did not complete within {0:?}")]
    InitializationTimeout(std::time::Duration),
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    #[error("no OD reading for {stalled_ms} ms")]
    Stale { stalled_ms: u64 },
    #[error("store error: {0}")]
    Store(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl EstimationError {
    /// Fatal errors terminate the job; the rest are surfaced and processing continues.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Stale { .. } | Self::InitializationTimeout(_) | Self::Store(_)
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing experiment")]
    MissingExperiment,
    #[error("missing store")]
    MissingStore,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

impl From<BuildError> for EstimationError {
    fn from(e: BuildError) -> Self {
        Self::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EstimationError>;
