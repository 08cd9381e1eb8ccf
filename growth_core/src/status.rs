//! Lifecycle state of an estimation job.

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for the first complete batch.
    Initializing,
    /// Filter initialized; consuming batches and events.
    SteadyState,
    /// Live sources stopped or disconnected.
    Disconnected,
    /// Historical sources ran out.
    Exhausted,
    /// Terminated by a fatal error; nothing further is emitted.
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Exhausted | Self::Failed)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::SteadyState => 1,
            Self::Disconnected => 2,
            Self::Exhausted => 3,
            Self::Failed => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initializing,
            1 => Self::SteadyState,
            2 => Self::Disconnected,
            3 => Self::Exhausted,
            _ => Self::Failed,
        }
    }
}
