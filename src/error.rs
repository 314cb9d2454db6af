use crate::stage::StageKind;

pub type SweepResult<T> = Result<T, SweepError>;

#[derive(thiserror::Error, Debug)]
pub enum SweepError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{stage} stage failed: `{command}` exited abnormally ({status}): {stderr}")]
    ExternalFailure {
        stage: StageKind,
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{stage} stage cancelled: `{command}`")]
    Cancelled { stage: StageKind, command: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SweepError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
