use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Validation Error - {0}")]
    Validation(String),

    #[error("Late Data Error - {0}")]
    LateData(String),

    #[error("Sink Delivery Error - {0}")]
    SinkDelivery(String),

    /// Fatal. Carries the last durable checkpoint so an operator knows where a restart resumes.
    #[error("Checkpoint Persist Error - {reason} (last committed checkpoint: {last_committed:?})")]
    CheckpointPersist {
        reason: String,
        last_committed: Option<u64>,
    },

    #[error("Checkpoint Error - {0}")]
    Checkpoint(String),

    #[error("Source Unavailable Error - {0}")]
    SourceUnavailable(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Serde Error - {0}")]
    Serde(String),

    #[error("IO Error - {0}")]
    Io(String),

    #[error("metrics Error - {0}")]
    Metrics(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),

    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Fatal errors stop the pipeline; everything else is isolated to a record or a batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::CheckpointPersist { .. }
                | Error::Checkpoint(_)
                | Error::Source(_)
                | Error::ActorPatternRecv(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serde(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(value: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ActorPatternRecv(value.to_string())
    }
}
