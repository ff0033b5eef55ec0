use thiserror::Error;

/// All errors produced by the recognition core.
#[derive(Debug, Error)]
pub enum SoundTriggerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device busy")]
    DeviceBusy,

    #[error("device failure: {0}")]
    DeviceFailure(String),

    #[error("stage-2 plugin failure: {0}")]
    PluginFailure(String),

    #[error("ring buffer underrun")]
    RingBufferUnderrun,

    #[error("restart ignored — engine was not active")]
    RestartIgnored,

    #[error("service restart in progress")]
    SsrInProgress,

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SoundTriggerError>;
