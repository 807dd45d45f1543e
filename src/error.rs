use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    /// No schedule record at or after the cursor carries this fingerprint.
    #[error("no schedule record matches fingerprint {fingerprint:#06x}")]
    MatchNotFound { fingerprint: u32 },

    #[error("malformed control input: {0:?}")]
    MalformedControlInput(String),

    #[error("out of memory while growing {0}")]
    ResourceExhaustion(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReplayError>;
