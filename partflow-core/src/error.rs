use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Checkpoint Error - {0}")]
    Checkpoint(String),

    #[error("Ownership Error - {0}")]
    Ownership(String),

    #[error("Handler Error - {0}")]
    Handler(String),

    #[error("Document Error - {0}")]
    Document(String),
}
